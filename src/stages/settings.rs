//! Settings file exchange

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Result;

/// Local settings file
pub const SETTINGS_FILE: &str = "/data/settings.toml";

/// Name of the copy presented to the host
const DRIVE_FILE_NAME: &str = "settings.toml";

pub struct SettingsStage {
    settings_file: PathBuf,
}

impl SettingsStage {
    pub fn new(settings_file: impl Into<PathBuf>) -> Self {
        Self {
            settings_file: settings_file.into(),
        }
    }

    /// Copy the local settings file onto the drive, if it exists
    pub async fn stage_out(&self, mount: &Path) -> Result<()> {
        if !tokio::fs::try_exists(&self.settings_file).await? {
            debug!(
                "settings file {} does not exist, skipping",
                self.settings_file.display()
            );
            return Ok(());
        }
        let data = tokio::fs::read(&self.settings_file).await?;
        tokio::fs::write(mount.join(DRIVE_FILE_NAME), data).await?;
        info!("copied settings.toml to USB drive");
        Ok(())
    }

    /// Take the drive's settings file back, returning whether the local copy
    /// changed. Byte-identical content is a no-op.
    pub async fn stage_in(&self, mount: &Path) -> Result<bool> {
        let src = mount.join(DRIVE_FILE_NAME);
        if !tokio::fs::try_exists(&src).await? {
            debug!("no settings.toml on USB drive");
            return Ok(false);
        }

        let incoming = tokio::fs::read(&src).await?;
        let changed = match tokio::fs::read(&self.settings_file).await {
            Ok(existing) => existing != incoming,
            Err(_) => true,
        };

        if changed {
            tokio::fs::write(&self.settings_file, incoming).await?;
            info!("updated settings.toml from USB drive");
        } else {
            debug!("settings.toml unchanged");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stage_in_dirs() -> (TempDir, TempDir, SettingsStage) {
        let data = TempDir::new().unwrap();
        let mount = TempDir::new().unwrap();
        let stage = SettingsStage::new(data.path().join("settings.toml"));
        (data, mount, stage)
    }

    #[tokio::test]
    async fn test_stage_out_missing_source_is_ok() {
        let (_data, mount, stage) = stage_in_dirs();
        stage.stage_out(mount.path()).await.unwrap();
        assert!(!mount.path().join("settings.toml").exists());
    }

    #[tokio::test]
    async fn test_stage_out_copies_file() {
        let (_data, mount, stage) = stage_in_dirs();
        tokio::fs::write(&stage.settings_file, b"[power]\nmode = \"eco\"\n")
            .await
            .unwrap();
        stage.stage_out(mount.path()).await.unwrap();
        let copied = tokio::fs::read(mount.path().join("settings.toml"))
            .await
            .unwrap();
        assert_eq!(copied, b"[power]\nmode = \"eco\"\n");
    }

    #[tokio::test]
    async fn test_stage_in_absent_reports_unchanged() {
        let (_data, mount, stage) = stage_in_dirs();
        assert!(!stage.stage_in(mount.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_stage_in_new_content_changes() {
        let (_data, mount, stage) = stage_in_dirs();
        tokio::fs::write(mount.path().join("settings.toml"), b"a = 1\n")
            .await
            .unwrap();
        assert!(stage.stage_in(mount.path()).await.unwrap());
        let local = tokio::fs::read(&stage.settings_file).await.unwrap();
        assert_eq!(local, b"a = 1\n");
    }

    #[tokio::test]
    async fn test_stage_in_idempotent_on_identical_bytes() {
        let (_data, mount, stage) = stage_in_dirs();
        tokio::fs::write(mount.path().join("settings.toml"), b"a = 1\n")
            .await
            .unwrap();
        assert!(stage.stage_in(mount.path()).await.unwrap());
        // Second run with the same drive contents reports no change
        assert!(!stage.stage_in(mount.path()).await.unwrap());
    }
}
