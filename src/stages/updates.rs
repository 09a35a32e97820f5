//! System update intake
//!
//! The host drops update bundles into `system-update/` on the drive.
//! Main-board bundles are copied into the local OTA directory and announced
//! on the MDB update queue; dashboard bundles are shipped to the DBC over
//! the proxy and announced on the DBC queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::bus::BusClient;
use crate::dbc::DbcProxy;
use crate::error::Result;

/// Local OTA inbox
pub const OTA_DIR: &str = "/data/ota";

/// OTA inbox on the DBC
pub const DBC_OTA_DIR: &str = "/data/ota";

/// Intake directory on the drive
pub const UPDATE_DIR_NAME: &str = "system-update";

/// Queue consumed by the main-board update service
pub const MDB_UPDATE_QUEUE: &str = "scooter:update:mdb";

/// Queue consumed by the dashboard update service
pub const DBC_UPDATE_QUEUE: &str = "scooter:update:dbc";

/// Which board an update bundle is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTarget {
    Mdb,
    Dbc,
}

/// Recognize an update bundle by name: `librescoot-*` with a `.mender` or
/// `.delta` suffix, routed by board marker.
pub fn classify_update(filename: &str) -> Option<UpdateTarget> {
    if !filename.starts_with("librescoot-") {
        return None;
    }
    if !filename.ends_with(".mender") && !filename.ends_with(".delta") {
        return None;
    }
    if filename.contains("librescoot-mdb") {
        Some(UpdateTarget::Mdb)
    } else if filename.contains("librescoot-dbc") {
        Some(UpdateTarget::Dbc)
    } else {
        None
    }
}

pub struct UpdateStage {
    ota_dir: PathBuf,
    dbc_ota_dir: PathBuf,
    bus: Arc<BusClient>,
    dbc: Arc<DbcProxy>,
}

impl UpdateStage {
    pub fn new(
        ota_dir: impl Into<PathBuf>,
        dbc_ota_dir: impl Into<PathBuf>,
        bus: Arc<BusClient>,
        dbc: Arc<DbcProxy>,
    ) -> Self {
        Self {
            ota_dir: ota_dir.into(),
            dbc_ota_dir: dbc_ota_dir.into(),
            bus,
            dbc,
        }
    }

    /// Create the intake directory on the drive
    pub async fn prepare(&self, mount: &Path) -> Result<()> {
        tokio::fs::create_dir_all(mount.join(UPDATE_DIR_NAME)).await?;
        Ok(())
    }

    /// Route every recognized bundle in the intake directory
    pub async fn stage_in(&self, mount: &Path) -> Result<()> {
        let update_dir = mount.join(UPDATE_DIR_NAME);
        let mut entries = match tokio::fs::read_dir(&update_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no system-update directory on USB drive");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match classify_update(&name) {
                Some(UpdateTarget::Mdb) => self.process_mdb(&entry.path(), &name).await?,
                Some(UpdateTarget::Dbc) => self.process_dbc(&entry.path(), &name).await?,
                None => debug!("ignoring {name} in system-update"),
            }
        }
        Ok(())
    }

    async fn process_mdb(&self, src: &Path, name: &str) -> Result<()> {
        info!("processing MDB update {name}");
        tokio::fs::create_dir_all(&self.ota_dir).await?;
        let dest = self.ota_dir.join(name);

        // The drive is vfat, the OTA directory ext4: a rename would cross
        // filesystems, so copy and flush before announcing the file.
        copy_durable(src, &dest).await?;

        self.bus
            .push(MDB_UPDATE_QUEUE, &update_message(&dest))
            .await?;
        info!("queued MDB update {name}");
        Ok(())
    }

    async fn process_dbc(&self, src: &Path, name: &str) -> Result<()> {
        if !self.dbc.is_enabled().await {
            info!("DBC link unavailable, skipping DBC update {name}");
            return Ok(());
        }
        info!("processing DBC update {name}");

        self.dbc
            .run_command(&format!("mkdir -p {}", self.dbc_ota_dir.display()))
            .await?;
        let remote = self.dbc_ota_dir.join(name);
        self.dbc.copy_file(src, &remote).await?;

        self.bus
            .push(DBC_UPDATE_QUEUE, &update_message(&remote))
            .await?;
        info!("queued DBC update {name}");
        Ok(())
    }
}

/// Queue payload announcing an update file
fn update_message(path: &Path) -> String {
    format!("update-from-file:{}", path.display())
}

/// Copy a file and flush it to stable storage
async fn copy_durable(src: &Path, dest: &Path) -> Result<()> {
    let mut reader = tokio::fs::File::open(src).await?;
    let mut writer = tokio::fs::File::create(dest).await?;
    tokio::io::copy(&mut reader, &mut writer).await?;
    writer.flush().await?;
    writer.sync_all().await?;
    Ok(())
}
