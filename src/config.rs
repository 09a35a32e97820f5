//! Service configuration
//!
//! Resolved once at startup from the environment. `REDIS_ADDR` accepts either
//! `host` or `host:port`; everything else has fixed defaults matching the
//! on-device filesystem layout.

use std::env;
use std::path::PathBuf;

use crate::error::{Result, ServiceError};

/// Default coordination bus endpoint
pub const DEFAULT_REDIS_ADDR: &str = "localhost:6379";

/// Default Redis port when `REDIS_ADDR` carries no port
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Backing image file exported in UMS mode
pub const DEFAULT_DRIVE_FILE: &str = "/data/usb.drive";

/// Backing image size (1 GiB)
pub const DEFAULT_DRIVE_SIZE: u64 = 1024 * 1024 * 1024;

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub drive_file: PathBuf,
    pub drive_size: u64,
}

impl Config {
    /// Build the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        let addr = env::var("REDIS_ADDR").unwrap_or_else(|_| DEFAULT_REDIS_ADDR.to_string());
        let password = env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty());
        Self::with_redis_addr(&addr, password)
    }

    /// Build the configuration with an explicit bus address
    pub fn with_redis_addr(addr: &str, password: Option<String>) -> Result<Self> {
        let (redis_host, redis_port) = parse_redis_addr(addr)?;
        Ok(Self {
            redis_host,
            redis_port,
            redis_password: password,
            drive_file: PathBuf::from(DEFAULT_DRIVE_FILE),
            drive_size: DEFAULT_DRIVE_SIZE,
        })
    }
}

/// Split `host` or `host:port` into its parts
fn parse_redis_addr(addr: &str) -> Result<(String, u16)> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(ServiceError::Config("REDIS_ADDR is empty".to_string()));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(ServiceError::Config(format!(
                    "invalid REDIS_ADDR {addr:?}: missing host"
                )));
            }
            let port = port.parse::<u16>().map_err(|_| {
                ServiceError::Config(format!("invalid port {port:?} in REDIS_ADDR"))
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), DEFAULT_REDIS_PORT)),
    }
}
