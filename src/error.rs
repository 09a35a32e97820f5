use thiserror::Error;

/// Service-wide error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to load module {module}: {detail}")]
    ModuleLoad { module: String, detail: String },

    #[error("Failed to unload module {module}: {detail}")]
    ModuleUnload { module: String, detail: String },

    #[error("Mount failed: {0}")]
    Mount(String),

    #[error("Unmount failed: {0}")]
    Unmount(String),

    #[error("Format failed: {0}")]
    Format(String),

    #[error("Drive allocation failed: {0}")]
    DiskAlloc(String),

    #[error("DBC link script failed: {0}")]
    DbcLink(String),

    #[error("Timeout waiting for DBC to become reachable")]
    DbcTimeout,

    #[error("DBC interface not enabled")]
    DbcNotEnabled,

    #[error("DBC bring-up cancelled")]
    DbcCancelled,

    #[error("Copy failed: {0}")]
    Copy(String),

    #[error("Remote command failed: {0}")]
    Ssh(String),

    #[error("Bus error: {0}")]
    Bus(#[from] redis::RedisError),

    #[error("Unknown mode: {0}")]
    UnknownMode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, ServiceError>;
