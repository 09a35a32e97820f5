//! Kernel module load/unload wrappers

use crate::error::{Result, ServiceError};
use crate::utils;

/// Marker in the tool output that means the module was already absent
const NOT_LOADED_MARKER: &str = "not currently loaded";

/// Thin wrapper around `modprobe`/`rmmod`
#[derive(Debug, Default)]
pub struct ModuleOps;

impl ModuleOps {
    pub fn new() -> Self {
        Self
    }

    /// Load a module with `key=value` parameters.
    ///
    /// Not idempotent: a module already present under different parameters
    /// must be unloaded first.
    pub async fn load(&self, module: &str, params: &[String]) -> Result<()> {
        let args = std::iter::once(module.to_string()).chain(params.iter().cloned());
        let out = utils::run("modprobe", args).await?;
        if !out.success {
            return Err(ServiceError::ModuleLoad {
                module: module.to_string(),
                detail: out.detail,
            });
        }
        Ok(())
    }

    /// Unload a module. An already-absent module is success.
    pub async fn unload(&self, module: &str) -> Result<()> {
        let out = utils::run("rmmod", [module]).await?;
        interpret_unload(module, out.success, &out.detail)
    }
}

/// Map an `rmmod` result onto the unload contract
fn interpret_unload(module: &str, success: bool, detail: &str) -> Result<()> {
    if success || detail.contains(NOT_LOADED_MARKER) {
        return Ok(());
    }
    Err(ServiceError::ModuleUnload {
        module: module.to_string(),
        detail: detail.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unload_success() {
        assert!(interpret_unload("g_ether", true, "").is_ok());
    }

    #[test]
    fn test_unload_absent_module_is_ok() {
        let detail = "rmmod: ERROR: Module g_mass_storage is not currently loaded";
        assert!(interpret_unload("g_mass_storage", false, detail).is_ok());
    }

    #[test]
    fn test_unload_in_use_fails() {
        let detail = "rmmod: ERROR: Module g_mass_storage is in use";
        let err = interpret_unload("g_mass_storage", false, detail).unwrap_err();
        match err {
            ServiceError::ModuleUnload { module, detail } => {
                assert_eq!(module, "g_mass_storage");
                assert!(detail.contains("in use"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
