//! Mode-switch orchestrator
//!
//! Reconciles the externally requested mode, the current gadget mode and the
//! physical host-detach signal into safe transitions of the USB gadget, and
//! sequences the file-exchange pipeline around them.
//!
//! Every transition runs under one exclusive session lock. Three workers
//! feed it: the bus watcher delivering `mode` requests, the host link
//! monitor producing detach events on a bounded channel, and a dedicated
//! detach consumer relaying those events into the lock. The monitor never
//! calls orchestrator code itself; collapsing that indirection reintroduces
//! the monitor/orchestrator deadlock this design exists to avoid.

pub mod leds;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusClient, HashPublisher};
use crate::config::Config;
use crate::dbc::{DbcProxy, DBC_DATA_DIR};
use crate::disk::DiskImage;
use crate::error::{Result, ServiceError};
use crate::gadget::{DetachEvent, GadgetController, GadgetMode, HostLinkMonitor};
use crate::stages::maps::{classify_map, MAPS_DIR_NAME};
use crate::stages::settings::SETTINGS_FILE;
use crate::stages::updates::{DBC_OTA_DIR, OTA_DIR, UPDATE_DIR_NAME};
use crate::stages::wireguard::WIREGUARD_DIR;
use crate::stages::{MapsStage, SettingsStage, UpdateStage, WireguardStage};
use crate::utils;
use self::leds::LedPattern;

/// Coordination hash on the bus
const USB_HASH: &str = "usb";
const MODE_FIELD: &str = "mode";
const STATUS_FIELD: &str = "status";

/// Unit restarted when settings or WireGuard configs changed
const SETTINGS_SERVICE_UNIT: &str = "settings-service";

/// Detach semantics of an active UMS session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UmsKind {
    /// Technician flow: the first disconnect ends the session
    Ums,
    /// DBC-initiated flow: the device is expected to be unplugged from the
    /// dashboard and replugged into a PC, so only the second disconnect ends
    /// the session
    UmsByDbc,
}

impl UmsKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UmsKind::Ums => "ums",
            UmsKind::UmsByDbc => "ums-by-dbc",
        }
    }
}

/// Mode requested through the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedMode {
    Normal,
    Ums(UmsKind),
}

impl FromStr for RequestedMode {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(RequestedMode::Normal),
            "ums" => Ok(RequestedMode::Ums(UmsKind::Ums)),
            "ums-by-dbc" => Ok(RequestedMode::Ums(UmsKind::UmsByDbc)),
            other => Err(ServiceError::UnknownMode(other.to_string())),
        }
    }
}

/// Published lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Idle,
    Preparing,
    Active,
    Processing,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Preparing => "preparing",
            Status::Active => "active",
            Status::Processing => "processing",
        }
    }
}

/// What a detach means for the active session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetachAction {
    RemainWaitingForHost,
    ReturnToNormal,
}

/// Dispatch a detach on the session type and running count
fn detach_action(mode_type: Option<UmsKind>, detach_count: u32) -> DetachAction {
    match mode_type {
        Some(UmsKind::Ums) => DetachAction::ReturnToNormal,
        Some(UmsKind::UmsByDbc) if detach_count == 1 => DetachAction::RemainWaitingForHost,
        Some(UmsKind::UmsByDbc) => DetachAction::ReturnToNormal,
        // A detach in UMS with no recorded type is an inconsistency; recover
        // by returning to normal
        None => DetachAction::ReturnToNormal,
    }
}

/// DBC update bundles force the link up during stage-in
fn needs_dbc_update(filename: &str) -> bool {
    filename.starts_with("librescoot-dbc") && filename.ends_with(".mender")
}

/// Per-session state guarded by the orchestrator lock
#[derive(Debug, Default)]
struct Session {
    ums_mode_type: Option<UmsKind>,
    detach_count: u32,
}

pub struct UmsService {
    bus: Arc<BusClient>,
    publisher: HashPublisher,
    gadget: Arc<GadgetController>,
    monitor: HostLinkMonitor,
    detach_rx: Mutex<Option<mpsc::Receiver<DetachEvent>>>,
    disk: Arc<DiskImage>,
    dbc: Arc<DbcProxy>,
    settings: SettingsStage,
    wireguard: WireguardStage,
    updates: UpdateStage,
    maps: MapsStage,
    session: Mutex<Session>,
    shutdown: CancellationToken,
}

impl UmsService {
    /// Connect to the bus and assemble the collaborators. Bus connection
    /// failure is fatal.
    pub async fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let bus = Arc::new(BusClient::connect(&config).await?);
        let publisher = bus.hash_publisher(USB_HASH);

        let gadget = Arc::new(GadgetController::new(config.drive_file.clone()));
        let (monitor, detach_rx) = HostLinkMonitor::new(gadget.ums_flag());
        let disk = Arc::new(DiskImage::new(config.drive_file.clone(), config.drive_size));
        let dbc = Arc::new(DbcProxy::new(DBC_DATA_DIR));

        Ok(Self {
            publisher,
            gadget,
            monitor,
            detach_rx: Mutex::new(Some(detach_rx)),
            disk,
            settings: SettingsStage::new(SETTINGS_FILE),
            wireguard: WireguardStage::new(WIREGUARD_DIR),
            updates: UpdateStage::new(OTA_DIR, DBC_OTA_DIR, bus.clone(), dbc.clone()),
            maps: MapsStage::new(dbc.clone()),
            dbc,
            bus,
            session: Mutex::new(Session::default()),
            shutdown,
        })
    }

    /// Run until shutdown is requested
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("starting UMS service");
        self.disk.initialize().await?;
        self.gadget.reconcile().await;
        self.monitor.start().await;
        self.publish_status(Status::Idle).await;

        let detach_rx = self
            .detach_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ServiceError::Config("service already running".to_string()))?;
        let detach_task = tokio::spawn(self.clone().detach_loop(detach_rx));

        let (mode_tx, mode_rx) = mpsc::channel(8);
        let watcher = self.bus.hash_watcher(USB_HASH, MODE_FIELD);
        let watcher_task = watcher.start(mode_tx, self.shutdown.clone()).await?;
        let mode_task = tokio::spawn(self.clone().mode_loop(mode_rx));

        info!("UMS service running, waiting for mode changes");
        self.shutdown.cancelled().await;
        info!("shutdown requested");

        self.monitor.stop().await;
        // Let an in-flight transition finish before returning
        let _ = mode_task.await;
        let _ = detach_task.await;
        let _ = watcher_task.await;
        Ok(())
    }

    async fn mode_loop(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                value = rx.recv() => match value {
                    Some(mode) => self.handle_mode_request(&mode).await,
                    None => break,
                }
            }
        }
    }

    async fn detach_loop(self: Arc<Self>, mut rx: mpsc::Receiver<DetachEvent>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(_) => self.on_device_detached().await,
                    None => break,
                }
            }
        }
    }

    /// Apply one `mode` request from the bus
    pub async fn handle_mode_request(&self, raw: &str) {
        let requested = match raw.parse::<RequestedMode>() {
            Ok(mode) => mode,
            Err(e) => {
                warn!("ignoring mode request: {e}");
                return;
            }
        };

        let mut session = self.session.lock().await;
        let current = self.gadget.current_mode().await;
        let result = match (requested, current) {
            (RequestedMode::Normal, GadgetMode::Normal) => {
                debug!("already in normal mode");
                Ok(())
            }
            (RequestedMode::Normal, GadgetMode::Ums) => self.leave_ums(&mut session).await,
            (RequestedMode::Ums(kind), GadgetMode::Normal) => {
                self.enter_ums(&mut session, kind).await
            }
            (RequestedMode::Ums(kind), GadgetMode::Ums) => {
                // Retyping a live session would change detach semantics under
                // the host's feet; keep the type it was entered with
                match session.ums_mode_type {
                    Some(active) if active == kind => debug!("already in {} mode", kind.as_str()),
                    Some(active) => info!(
                        "UMS session already active as {}, ignoring request for {}",
                        active.as_str(),
                        kind.as_str()
                    ),
                    None => warn!("UMS active without session type, ignoring retype"),
                }
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("mode change to {raw:?} failed: {e}");
        }
    }

    /// Handle one detach event. Called with the session lock *not* held.
    async fn on_device_detached(&self) {
        let mut session = self.session.lock().await;
        if self.gadget.current_mode().await != GadgetMode::Ums {
            return;
        }

        session.detach_count += 1;
        let mode_type = session.ums_mode_type;
        info!(
            "USB detach #{} detected (mode type: {})",
            session.detach_count,
            mode_type.map(UmsKind::as_str).unwrap_or("")
        );

        match detach_action(mode_type, session.detach_count) {
            DetachAction::RemainWaitingForHost => {
                info!("first disconnect in ums-by-dbc mode, waiting for host PC");
                leds::apply(&self.bus, LedPattern::WaitingForHost).await;
            }
            DetachAction::ReturnToNormal => {
                if mode_type.is_none() {
                    warn!("detach without session type, returning to normal");
                }
                self.return_to_normal(&mut session).await;
            }
        }
    }

    /// Leave UMS and republish the mode so peer services converge
    async fn return_to_normal(&self, session: &mut Session) {
        if let Err(e) = self.leave_ums(session).await {
            warn!("error switching to normal mode: {e}");
        }
        session.detach_count = 0;
        if let Err(e) = self.publisher.set(MODE_FIELD, "normal").await {
            warn!("failed to republish usb mode: {e}");
        }
    }

    /// Stage out, unexport the filesystem, export the disk to the host
    async fn enter_ums(&self, session: &mut Session, kind: UmsKind) -> Result<()> {
        self.publish_status(Status::Preparing).await;

        if let Err(e) = self.disk.mount().await {
            self.publish_status(Status::Idle).await;
            return Err(e);
        }

        let mount = self.disk.mount_point();
        if let Err(e) = self.settings.stage_out(mount).await {
            warn!("error copying settings to USB: {e}");
        }
        if let Err(e) = self.updates.prepare(mount).await {
            warn!("error preparing update directory: {e}");
        }
        if let Err(e) = self.maps.prepare(mount).await {
            warn!("error preparing maps directory: {e}");
        }
        if let Err(e) = self.wireguard.prepare(mount).await {
            warn!("error preparing wireguard directory: {e}");
        }
        if let Err(e) = self.wireguard.stage_out(mount).await {
            warn!("error copying wireguard configs to USB: {e}");
        }

        if let Err(e) = self.disk.unmount().await {
            self.publish_status(Status::Idle).await;
            return Err(e);
        }

        // Publish before switching the gadget: the network gadget still
        // carries the bus, so downstream consumers see the change
        self.publish_status(Status::Active).await;
        leds::apply(&self.bus, LedPattern::UmsActive).await;

        if let Err(e) = self.gadget.switch_mode(GadgetMode::Ums).await {
            self.publish_status(Status::Idle).await;
            leds::apply(&self.bus, LedPattern::Off).await;
            return Err(e);
        }

        session.ums_mode_type = Some(kind);
        session.detach_count = 0;
        info!("switched to UMS mode (type: {})", kind.as_str());
        Ok(())
    }

    /// Unexport the disk, take back what the host wrote, clean up
    async fn leave_ums(&self, session: &mut Session) -> Result<()> {
        leds::apply(&self.bus, LedPattern::Off).await;

        self.gadget.switch_mode(GadgetMode::Normal).await?;

        self.publish_status(Status::Processing).await;
        if let Err(e) = self.disk.mount().await {
            self.publish_status(Status::Idle).await;
            return Err(e);
        }

        let mount = self.disk.mount_point();
        let need_dbc = dbc_needed(mount).await;
        let mut dbc_enabled = false;
        if need_dbc {
            match self.dbc.enable(&self.shutdown).await {
                Ok(()) => dbc_enabled = true,
                Err(e) => warn!("failed to enable DBC: {e}"),
            }
        }

        let mut settings_changed = false;
        match self.settings.stage_in(mount).await {
            Ok(changed) => settings_changed = changed,
            Err(e) => warn!("error processing settings: {e}"),
        }

        let mut wireguard_changed = false;
        match self.wireguard.stage_in(mount).await {
            Ok(changed) => wireguard_changed = changed,
            Err(e) => warn!("error processing wireguard configs: {e}"),
        }

        if let Err(e) = self.updates.stage_in(mount).await {
            warn!("error processing updates: {e}");
        }
        if let Err(e) = self.maps.stage_in(mount).await {
            warn!("error processing maps: {e}");
        }

        if settings_changed || wireguard_changed {
            self.restart_settings_consumer().await;
        }

        if let Err(e) = self.disk.clean().await {
            warn!("error cleaning USB drive: {e}");
        }
        if let Err(e) = self.disk.unmount().await {
            warn!("error unmounting USB drive: {e}");
        }

        if dbc_enabled {
            if let Err(e) = self.dbc.disable().await {
                warn!("failed to disable DBC: {e}");
            }
        }

        session.ums_mode_type = None;
        session.detach_count = 0;
        self.publish_status(Status::Idle).await;
        info!("switched to normal mode and processed files");
        Ok(())
    }

    /// Restart the settings consumer, blocking until the restart completes
    async fn restart_settings_consumer(&self) {
        info!("configuration changed, restarting {SETTINGS_SERVICE_UNIT}");
        match utils::run("systemctl", ["restart", SETTINGS_SERVICE_UNIT]).await {
            Ok(out) if out.success => info!("restarted {SETTINGS_SERVICE_UNIT}"),
            Ok(out) => warn!(
                "failed to restart {SETTINGS_SERVICE_UNIT}: {}",
                out.detail
            ),
            Err(e) => warn!("failed to run systemctl: {e}"),
        }
    }

    async fn publish_status(&self, status: Status) {
        if let Err(e) = self.publisher.set(STATUS_FIELD, status.as_str()).await {
            warn!("error publishing usb status {:?}: {e}", status.as_str());
        }
    }
}

/// Decide up front whether this stage-in needs the DBC link
async fn dbc_needed(mount: &Path) -> bool {
    let update_dir = mount.join(UPDATE_DIR_NAME);
    if let Ok(mut entries) = tokio::fs::read_dir(&update_dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if needs_dbc_update(&name) {
                info!("found DBC update files, DBC needed");
                return true;
            }
        }
    }

    let maps_dir = mount.join(MAPS_DIR_NAME);
    if let Ok(mut entries) = tokio::fs::read_dir(&maps_dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if classify_map(&name).is_some() {
                info!("found map files, DBC needed");
                return true;
            }
        }
    }

    debug!("no DBC operations needed");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_requested_mode_parsing() {
        assert_eq!(
            "normal".parse::<RequestedMode>().unwrap(),
            RequestedMode::Normal
        );
        assert_eq!(
            "ums".parse::<RequestedMode>().unwrap(),
            RequestedMode::Ums(UmsKind::Ums)
        );
        assert_eq!(
            "ums-by-dbc".parse::<RequestedMode>().unwrap(),
            RequestedMode::Ums(UmsKind::UmsByDbc)
        );
        assert!(matches!(
            "sideways".parse::<RequestedMode>(),
            Err(ServiceError::UnknownMode(_))
        ));
    }

    #[test]
    fn test_single_detach_ends_ums_session() {
        assert_eq!(
            detach_action(Some(UmsKind::Ums), 1),
            DetachAction::ReturnToNormal
        );
    }

    #[test]
    fn test_ums_by_dbc_needs_two_detaches() {
        assert_eq!(
            detach_action(Some(UmsKind::UmsByDbc), 1),
            DetachAction::RemainWaitingForHost
        );
        assert_eq!(
            detach_action(Some(UmsKind::UmsByDbc), 2),
            DetachAction::ReturnToNormal
        );
        assert_eq!(
            detach_action(Some(UmsKind::UmsByDbc), 3),
            DetachAction::ReturnToNormal
        );
    }

    #[test]
    fn test_detach_without_session_type_recovers() {
        assert_eq!(detach_action(None, 1), DetachAction::ReturnToNormal);
    }

    #[test]
    fn test_needs_dbc_update() {
        assert!(needs_dbc_update("librescoot-dbc-2.0.0.mender"));
        assert!(!needs_dbc_update("librescoot-mdb-1.2.3.mender"));
        assert!(!needs_dbc_update("librescoot-dbc-2.0.0.delta"));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(Status::Idle.as_str(), "idle");
        assert_eq!(Status::Preparing.as_str(), "preparing");
        assert_eq!(Status::Active.as_str(), "active");
        assert_eq!(Status::Processing.as_str(), "processing");
    }

    #[tokio::test]
    async fn test_dbc_needed_on_dbc_update() {
        let mount = TempDir::new().unwrap();
        let dir = mount.path().join("system-update");
        tokio::fs::create_dir(&dir).await.unwrap();
        tokio::fs::write(dir.join("librescoot-dbc-2.0.0.mender"), b"x")
            .await
            .unwrap();
        assert!(dbc_needed(mount.path()).await);
    }

    #[tokio::test]
    async fn test_dbc_needed_on_map_file() {
        let mount = TempDir::new().unwrap();
        let dir = mount.path().join("maps");
        tokio::fs::create_dir(&dir).await.unwrap();
        tokio::fs::write(dir.join("germany.mbtiles"), b"x")
            .await
            .unwrap();
        assert!(dbc_needed(mount.path()).await);
    }

    #[tokio::test]
    async fn test_dbc_not_needed_for_mdb_only() {
        let mount = TempDir::new().unwrap();
        let dir = mount.path().join("system-update");
        tokio::fs::create_dir(&dir).await.unwrap();
        tokio::fs::write(dir.join("librescoot-mdb-1.2.3.mender"), b"x")
            .await
            .unwrap();
        assert!(!dbc_needed(mount.path()).await);
    }

    #[tokio::test]
    async fn test_dbc_not_needed_on_empty_drive() {
        let mount = TempDir::new().unwrap();
        assert!(!dbc_needed(mount.path()).await);
    }
}
