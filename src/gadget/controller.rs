//! Gadget mode controller
//!
//! Owns the current mode of the USB gadget port and serializes switches
//! between the network gadget and the mass-storage gadget. The mode is an
//! in-memory authority: a daemon restart resets it to [`GadgetMode::Normal`],
//! with [`GadgetController::reconcile`] cleaning up a mass-storage module
//! left behind by a crash.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::modules::ModuleOps;
use crate::error::Result;

/// Network gadget module (Ethernet-over-USB)
pub const NET_GADGET_MODULE: &str = "g_ether";

/// Mass-storage gadget module
pub const MASS_STORAGE_MODULE: &str = "g_mass_storage";

/// Serial number reported to the USB host in mass-storage mode
const MASS_STORAGE_SERIAL: &str = "1234567890";

/// Physical mode of the gadget port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GadgetMode {
    /// Ethernet-over-USB interface
    Normal,
    /// Removable mass-storage disk
    Ums,
}

impl fmt::Display for GadgetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GadgetMode::Normal => write!(f, "normal"),
            GadgetMode::Ums => write!(f, "ums"),
        }
    }
}

pub struct GadgetController {
    modules: ModuleOps,
    drive_file: PathBuf,
    mode: Mutex<GadgetMode>,
    /// Published for the host link monitor, which must not take our lock
    ums_active: Arc<AtomicBool>,
}

impl GadgetController {
    pub fn new(drive_file: impl Into<PathBuf>) -> Self {
        Self {
            modules: ModuleOps::new(),
            drive_file: drive_file.into(),
            mode: Mutex::new(GadgetMode::Normal),
            ums_active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Lock-free view of "is the port in UMS mode", shared with the monitor
    pub fn ums_flag(&self) -> Arc<AtomicBool> {
        self.ums_active.clone()
    }

    pub async fn current_mode(&self) -> GadgetMode {
        *self.mode.lock().await
    }

    /// Switch the gadget port to `target`. No-op when already there.
    ///
    /// A failed switch leaves the recorded mode on the last successful one.
    pub async fn switch_mode(&self, target: GadgetMode) -> Result<()> {
        let mut mode = self.mode.lock().await;
        if *mode == target {
            debug!("already in {target} mode");
            return Ok(());
        }

        info!("switching gadget from {} to {}", *mode, target);
        match target {
            GadgetMode::Ums => {
                if let Err(e) = self.modules.unload(NET_GADGET_MODULE).await {
                    warn!("failed to unload {NET_GADGET_MODULE}: {e}");
                }
                self.modules
                    .load(MASS_STORAGE_MODULE, &self.mass_storage_params())
                    .await?;
            }
            GadgetMode::Normal => {
                if let Err(e) = self.modules.unload(MASS_STORAGE_MODULE).await {
                    warn!("failed to unload {MASS_STORAGE_MODULE}: {e}");
                }
                self.modules.load(NET_GADGET_MODULE, &[]).await?;
            }
        }

        *mode = target;
        self.ums_active
            .store(target == GadgetMode::Ums, Ordering::Release);
        info!("gadget now in {target} mode");
        Ok(())
    }

    /// Reconcile the kernel with our initial `normal` assumption.
    ///
    /// If the previous run crashed while exporting the disk, the mass-storage
    /// module is still loaded. Best effort: failures are logged, the mode
    /// stays `normal` and the next bus request re-drives the port.
    pub async fn reconcile(&self) {
        let modules = match tokio::fs::read_to_string("/proc/modules").await {
            Ok(m) => m,
            Err(e) => {
                warn!("cannot read /proc/modules: {e}");
                return;
            }
        };
        if !module_loaded(&modules, MASS_STORAGE_MODULE) {
            return;
        }

        warn!("{MASS_STORAGE_MODULE} left loaded from a previous run, restoring network gadget");
        if let Err(e) = self.modules.unload(MASS_STORAGE_MODULE).await {
            warn!("failed to unload stale {MASS_STORAGE_MODULE}: {e}");
        }
        if let Err(e) = self.modules.load(NET_GADGET_MODULE, &[]).await {
            warn!("failed to load {NET_GADGET_MODULE}: {e}");
        }
    }

    fn mass_storage_params(&self) -> Vec<String> {
        vec![
            format!("file={}", self.drive_file.display()),
            "removable=1".to_string(),
            "ro=0".to_string(),
            "stall=0".to_string(),
            format!("iSerialNumber={MASS_STORAGE_SERIAL}"),
        ]
    }
}

/// Check a `/proc/modules` listing for a loaded module
fn module_loaded(proc_modules: &str, name: &str) -> bool {
    proc_modules
        .lines()
        .any(|line| line.split_whitespace().next() == Some(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_mode_is_normal() {
        let controller = GadgetController::new("/data/usb.drive");
        assert_eq!(controller.current_mode().await, GadgetMode::Normal);
        assert!(!controller.ums_flag().load(Ordering::Acquire));
    }

    #[test]
    fn test_mass_storage_params() {
        let controller = GadgetController::new("/data/usb.drive");
        let params = controller.mass_storage_params();
        assert_eq!(params[0], "file=/data/usb.drive");
        assert!(params.contains(&"removable=1".to_string()));
        assert!(params.contains(&"ro=0".to_string()));
        assert!(params.contains(&"stall=0".to_string()));
    }

    #[test]
    fn test_module_loaded() {
        let listing = "g_mass_storage 49152 0 - Live 0x0000000000000000\n\
                       usb_f_mass_storage 65536 2 g_mass_storage, Live 0x0000000000000000\n";
        assert!(module_loaded(listing, "g_mass_storage"));
        assert!(!module_loaded(listing, "g_ether"));
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(GadgetMode::Normal.to_string(), "normal");
        assert_eq!(GadgetMode::Ums.to_string(), "ums");
    }
}
