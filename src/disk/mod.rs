//! Backing drive image
//!
//! Owns the FAT32 image file exported to the host in UMS mode, and the fixed
//! mount point used to exchange files with it locally. The image and the
//! kernel gadget cannot hold the filesystem at the same time, so the
//! orchestrator unmounts before exporting and only mounts after unexporting.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::error::{Result, ServiceError};
use crate::utils;

/// Fixed mount point for local file exchange
const MOUNT_POINT: &str = "/mnt/usb-drive-temp";

pub struct DiskImage {
    drive_file: PathBuf,
    size_bytes: u64,
    mount_point: PathBuf,
    mounted: AtomicBool,
}

impl DiskImage {
    pub fn new(drive_file: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            drive_file: drive_file.into(),
            size_bytes,
            mount_point: PathBuf::from(MOUNT_POINT),
            mounted: AtomicBool::new(false),
        }
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Create the backing file on first run: zero-filled at exact size, then
    /// formatted FAT32. An existing file is reused as-is.
    pub async fn initialize(&self) -> Result<()> {
        if tokio::fs::try_exists(&self.drive_file).await? {
            debug!("backing image {} already exists", self.drive_file.display());
            return Ok(());
        }

        info!(
            "creating virtual USB drive at {} ({} MiB)",
            self.drive_file.display(),
            self.size_bytes / (1024 * 1024)
        );
        if let Some(parent) = self.drive_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.allocate().await?;
        self.format().await?;
        Ok(())
    }

    async fn allocate(&self) -> Result<()> {
        let out = utils::run(
            "dd",
            [
                "if=/dev/zero".to_string(),
                format!("of={}", self.drive_file.display()),
                "bs=1M".to_string(),
                format!("count={}", self.size_bytes / (1024 * 1024)),
            ],
        )
        .await?;
        if !out.success {
            return Err(ServiceError::DiskAlloc(out.detail));
        }
        Ok(())
    }

    async fn format(&self) -> Result<()> {
        let file = self.drive_file.display().to_string();
        let out = utils::run("mkfs.fat", ["-F", "32", file.as_str()]).await?;
        if !out.success {
            return Err(ServiceError::Format(out.detail));
        }
        Ok(())
    }

    /// Mount the image at the fixed mount point, creating it if missing
    pub async fn mount(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.mount_point)
            .await
            .map_err(|e| ServiceError::Mount(format!("create mount point: {e}")))?;

        let file = self.drive_file.display().to_string();
        let mp = self.mount_point.display().to_string();
        let out = utils::run("mount", ["-t", "vfat", file.as_str(), mp.as_str()]).await?;
        if !out.success {
            return Err(ServiceError::Mount(out.detail));
        }

        self.mounted.store(true, Ordering::Release);
        info!("mounted USB drive at {}", self.mount_point.display());
        Ok(())
    }

    /// Unmount the image and remove the mount directory
    pub async fn unmount(&self) -> Result<()> {
        let mp = self.mount_point.display().to_string();
        let out = utils::run("umount", [mp.as_str()]).await?;
        if !out.success {
            return Err(ServiceError::Unmount(out.detail));
        }

        self.mounted.store(false, Ordering::Release);
        let _ = tokio::fs::remove_dir_all(&self.mount_point).await;
        info!("unmounted USB drive");
        Ok(())
    }

    /// Delete everything under the mount point, keeping the mount point itself
    pub async fn clean(&self) -> Result<()> {
        info!("cleaning USB drive");
        clean_dir(&self.mount_point).await
    }
}

async fn clean_dir(dir: &Path) -> Result<()> {
    let path = dir.display().to_string();
    let out = utils::run("find", [path.as_str(), "-mindepth", "1", "-delete"]).await?;
    if !out.success {
        return Err(ServiceError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("clean {} failed: {}", dir.display(), out.detail),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths() {
        let disk = DiskImage::new("/data/usb.drive", 1024 * 1024 * 1024);
        assert_eq!(disk.mount_point(), Path::new("/mnt/usb-drive-temp"));
        assert!(!disk.is_mounted());
    }

    #[tokio::test]
    async fn test_clean_dir_preserves_root() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("system-update");
        tokio::fs::create_dir(&sub).await.unwrap();
        tokio::fs::write(sub.join("a.mender"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("settings.toml"), b"y")
            .await
            .unwrap();

        clean_dir(dir.path()).await.unwrap();

        assert!(dir.path().exists());
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clean_dir_empty_is_ok() {
        let dir = TempDir::new().unwrap();
        clean_dir(dir.path()).await.unwrap();
        assert!(dir.path().exists());
    }
}
