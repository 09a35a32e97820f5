//! File exchange stages
//!
//! Each stage moves one category of files between the daemon's data
//! directories and the mounted backing drive: an out-phase before the drive
//! is exported, and an in-phase after the host detaches. Stages are
//! independent; the orchestrator logs individual failures and carries on.

pub mod maps;
pub mod settings;
pub mod updates;
pub mod wireguard;

pub use maps::MapsStage;
pub use settings::SettingsStage;
pub use updates::UpdateStage;
pub use wireguard::WireguardStage;
