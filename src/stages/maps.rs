//! Map file intake
//!
//! Map data lives on the DBC, so everything the host dropped into `maps/`
//! travels over the proxy: `.mbtiles` databases to the map directory,
//! Valhalla `tiles.tar` archives to the routing directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::dbc::DbcProxy;
use crate::error::Result;

/// Map directory on the DBC
pub const DBC_MAPS_DIR: &str = "/data/maps";

/// Valhalla tile directory on the DBC
pub const DBC_VALHALLA_DIR: &str = "/data/valhalla";

/// Intake directory on the drive
pub const MAPS_DIR_NAME: &str = "maps";

/// Kind of map file recognized in the intake directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Mbtiles,
    TilesTar,
}

pub fn classify_map(filename: &str) -> Option<MapKind> {
    if filename.ends_with(".mbtiles") {
        Some(MapKind::Mbtiles)
    } else if filename.ends_with("tiles.tar") {
        Some(MapKind::TilesTar)
    } else {
        None
    }
}

pub struct MapsStage {
    dbc_maps_dir: PathBuf,
    dbc_valhalla_dir: PathBuf,
    dbc: Arc<DbcProxy>,
}

impl MapsStage {
    pub fn new(dbc: Arc<DbcProxy>) -> Self {
        Self {
            dbc_maps_dir: PathBuf::from(DBC_MAPS_DIR),
            dbc_valhalla_dir: PathBuf::from(DBC_VALHALLA_DIR),
            dbc,
        }
    }

    /// Create the intake directory on the drive
    pub async fn prepare(&self, mount: &Path) -> Result<()> {
        tokio::fs::create_dir_all(mount.join(MAPS_DIR_NAME)).await?;
        Ok(())
    }

    /// Ship recognized map files to the DBC
    pub async fn stage_in(&self, mount: &Path) -> Result<()> {
        let maps_dir = mount.join(MAPS_DIR_NAME);
        let mut entries = match tokio::fs::read_dir(&maps_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no maps directory on USB drive");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut mbtiles: Option<PathBuf> = None;
        let mut tiles_tar: Option<PathBuf> = None;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match classify_map(&name) {
                Some(MapKind::Mbtiles) => mbtiles = Some(entry.path()),
                Some(MapKind::TilesTar) => tiles_tar = Some(entry.path()),
                None => {}
            }
        }

        if mbtiles.is_none() && tiles_tar.is_none() {
            debug!("no map files to process");
            return Ok(());
        }
        if !self.dbc.is_enabled().await {
            info!("DBC link unavailable, skipping map intake");
            return Ok(());
        }

        if let Some(path) = mbtiles {
            self.ship(&path, &self.dbc_maps_dir, "map.mbtiles").await?;
        }
        if let Some(path) = tiles_tar {
            self.ship(&path, &self.dbc_valhalla_dir, "tiles.tar").await?;
        }
        Ok(())
    }

    async fn ship(&self, local: &Path, remote_dir: &Path, remote_name: &str) -> Result<()> {
        self.dbc
            .run_command(&format!("mkdir -p {}", remote_dir.display()))
            .await?;
        let remote = remote_dir.join(remote_name);
        self.dbc.copy_file(local, &remote).await?;
        info!("copied {} to DBC at {}", local.display(), remote.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_mbtiles() {
        assert_eq!(classify_map("germany.mbtiles"), Some(MapKind::Mbtiles));
        assert_eq!(classify_map("map.mbtiles"), Some(MapKind::Mbtiles));
    }

    #[test]
    fn test_classify_tiles_tar() {
        assert_eq!(classify_map("tiles.tar"), Some(MapKind::TilesTar));
        assert_eq!(classify_map("valhalla-tiles.tar"), Some(MapKind::TilesTar));
    }

    #[test]
    fn test_classify_rejects_other_files() {
        assert_eq!(classify_map("map.tar"), None);
        assert_eq!(classify_map("tiles.tar.gz"), None);
        assert_eq!(classify_map("readme.md"), None);
    }
}
