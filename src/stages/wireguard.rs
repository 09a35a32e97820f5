//! WireGuard config exchange
//!
//! Stage-out copies every local `*.conf` onto the drive. Stage-in
//! synchronizes the local directory with the drive: differing files are
//! overwritten, local files missing from the drive are deleted. An absent
//! drive directory means the host removed the whole exchange; nothing is
//! deleted locally in that case.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::Result;

/// Local WireGuard config directory
pub const WIREGUARD_DIR: &str = "/data/wireguard";

/// Exchange directory on the drive
const DRIVE_DIR_NAME: &str = "wireguard";

const CONF_SUFFIX: &str = ".conf";

pub struct WireguardStage {
    config_dir: PathBuf,
}

impl WireguardStage {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Create the exchange directory on the drive
    pub async fn prepare(&self, mount: &Path) -> Result<()> {
        tokio::fs::create_dir_all(mount.join(DRIVE_DIR_NAME)).await?;
        Ok(())
    }

    /// Copy local configs onto the drive
    pub async fn stage_out(&self, mount: &Path) -> Result<()> {
        if !tokio::fs::try_exists(&self.config_dir).await? {
            debug!(
                "wireguard directory {} does not exist, skipping",
                self.config_dir.display()
            );
            return Ok(());
        }

        let dest_dir = mount.join(DRIVE_DIR_NAME);
        let mut copied = 0usize;
        for name in conf_files(&self.config_dir).await? {
            let src = self.config_dir.join(&name);
            let data = match tokio::fs::read(&src).await {
                Ok(d) => d,
                Err(e) => {
                    warn!("failed to read {}: {e}", src.display());
                    continue;
                }
            };
            if let Err(e) = tokio::fs::write(dest_dir.join(&name), data).await {
                warn!("failed to write {name} to USB drive: {e}");
                continue;
            }
            copied += 1;
        }
        if copied > 0 {
            info!("copied {copied} WireGuard config file(s) to USB drive");
        }
        Ok(())
    }

    /// Synchronize the local directory with the drive's. Returns whether any
    /// file was written or deleted.
    pub async fn stage_in(&self, mount: &Path) -> Result<bool> {
        let src_dir = mount.join(DRIVE_DIR_NAME);
        if !tokio::fs::try_exists(&src_dir).await? {
            debug!("no wireguard directory on USB drive");
            return Ok(false);
        }

        tokio::fs::create_dir_all(&self.config_dir).await?;

        let existing: HashSet<String> = conf_files(&self.config_dir).await?.into_iter().collect();
        let mut changed = false;
        let mut seen: HashSet<String> = HashSet::new();

        for name in conf_files(&src_dir).await? {
            seen.insert(name.clone());
            let incoming = match tokio::fs::read(src_dir.join(&name)).await {
                Ok(d) => d,
                Err(e) => {
                    warn!("failed to read {name} from USB drive: {e}");
                    continue;
                }
            };

            let dest = self.config_dir.join(&name);
            let needs_update = match tokio::fs::read(&dest).await {
                Ok(current) => current != incoming,
                Err(_) => true,
            };
            if needs_update {
                if let Err(e) = tokio::fs::write(&dest, incoming).await {
                    warn!("failed to write {}: {e}", dest.display());
                    continue;
                }
                info!("updated WireGuard config {name}");
                changed = true;
            }
        }

        for name in existing.difference(&seen) {
            let path = self.config_dir.join(name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!("removed WireGuard config {name}");
                    changed = true;
                }
                Err(e) => warn!("failed to remove {}: {e}", path.display()),
            }
        }

        Ok(changed)
    }
}

/// List `*.conf` file names in a directory
async fn conf_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(CONF_SUFFIX) {
            names.push(name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, TempDir, WireguardStage) {
        let data = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        let stage = WireguardStage::new(data.path().join("wireguard"));
        tokio::fs::create_dir(&stage.config_dir).await.unwrap();
        stage.prepare(mount.path()).await.unwrap();
        (data, mount, stage)
    }

    #[tokio::test]
    async fn test_stage_out_copies_conf_files_only() {
        let (_data, mount, stage) = setup().await;
        tokio::fs::write(stage.config_dir.join("wg0.conf"), b"[Interface]\n")
            .await
            .unwrap();
        tokio::fs::write(stage.config_dir.join("notes.txt"), b"x")
            .await
            .unwrap();

        stage.stage_out(mount.path()).await.unwrap();

        let dest = mount.path().join("wireguard");
        assert!(dest.join("wg0.conf").exists());
        assert!(!dest.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_stage_in_converges_to_drive_contents() {
        let (_data, mount, stage) = setup().await;
        let drive = mount.path().join("wireguard");
        tokio::fs::write(stage.config_dir.join("old.conf"), b"old")
            .await
            .unwrap();
        tokio::fs::write(drive.join("wg0.conf"), b"[Interface]\n")
            .await
            .unwrap();
        tokio::fs::write(drive.join("wg1.conf"), b"[Peer]\n")
            .await
            .unwrap();

        assert!(stage.stage_in(mount.path()).await.unwrap());

        let local: HashSet<String> = conf_files(&stage.config_dir)
            .await
            .unwrap()
            .into_iter()
            .collect();
        let on_drive: HashSet<String> =
            conf_files(&drive).await.unwrap().into_iter().collect();
        assert_eq!(local, on_drive);
    }

    #[tokio::test]
    async fn test_stage_in_unchanged_reports_false() {
        let (_data, mount, stage) = setup().await;
        let drive = mount.path().join("wireguard");
        tokio::fs::write(drive.join("wg0.conf"), b"same").await.unwrap();
        tokio::fs::write(stage.config_dir.join("wg0.conf"), b"same")
            .await
            .unwrap();

        assert!(!stage.stage_in(mount.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_stage_in_absent_drive_dir_deletes_nothing() {
        let data = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        let stage = WireguardStage::new(data.path().join("wireguard"));
        tokio::fs::create_dir(&stage.config_dir).await.unwrap();
        tokio::fs::write(stage.config_dir.join("wg0.conf"), b"keep")
            .await
            .unwrap();

        // No wireguard/ directory on the drive at all
        assert!(!stage.stage_in(mount.path()).await.unwrap());
        assert!(stage.config_dir.join("wg0.conf").exists());
    }

    #[tokio::test]
    async fn test_stage_in_empty_drive_dir_deletes_all() {
        let (_data, mount, stage) = setup().await;
        tokio::fs::write(stage.config_dir.join("wg0.conf"), b"gone")
            .await
            .unwrap();

        assert!(stage.stage_in(mount.path()).await.unwrap());
        assert!(conf_files(&stage.config_dir).await.unwrap().is_empty());
    }
}
