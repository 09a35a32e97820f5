//! scooter-ums - USB mass-storage gadget service
//!
//! On-device daemon that temporarily turns the USB gadget port into a
//! removable disk for configuration, VPN key, firmware and map exchange,
//! then returns the port to its network-gadget role and applies whatever
//! changed on the disk.

pub mod bus;
pub mod config;
pub mod dbc;
pub mod disk;
pub mod error;
pub mod gadget;
pub mod service;
pub mod stages;
pub mod utils;

pub use error::{Result, ServiceError};
