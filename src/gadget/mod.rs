//! USB gadget management
//!
//! Three collaborators around the gadget port:
//! - [`ModuleOps`] wraps the kernel module tools,
//! - [`GadgetController`] owns the current gadget mode and serializes switches,
//! - [`HostLinkMonitor`] watches the device controller state and reports when
//!   the host side goes away.

pub mod controller;
pub mod modules;
pub mod monitor;

pub use controller::{GadgetController, GadgetMode};
pub use modules::ModuleOps;
pub use monitor::{DetachEvent, HostLinkMonitor};
