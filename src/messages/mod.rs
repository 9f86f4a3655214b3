//! Built-in message catalog.
//!
//! Only the messages the gateway core needs are declared here; the full
//! Velbus catalog is larger.

pub mod module_status;
pub mod sensor_settings;

use crate::registry::{MessageRegistry, RegistryBuilder};
use crate::schema::SchemaError;

/// Registry holding every built-in schema. Fails on a catalog defect, which
/// callers treat as fatal at startup.
pub fn builtin_registry() -> Result<MessageRegistry, SchemaError> {
    let mut builder = RegistryBuilder::new();
    builder.register_all(module_status::schemas())?;
    builder.register_all(sensor_settings::schemas())?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_registers() {
        let registry = builtin_registry().unwrap();
        assert_eq!(registry.len(), 8);
    }

    #[test]
    fn test_module_status_resolution_by_length() {
        let registry = builtin_registry().unwrap();
        assert_eq!(
            registry.resolve(0xed, 7).map(|s| s.name()),
            Some(module_status::MODULE_STATUS_8PBU)
        );
        assert_eq!(
            registry.resolve(0xed, 5).map(|s| s.name()),
            Some(module_status::MODULE_STATUS_6IN)
        );
        assert_eq!(
            registry.resolve(0xed, 8).map(|s| s.name()),
            Some(module_status::MODULE_STATUS_VMBELO)
        );
        assert!(registry.resolve(0xed, 6).is_none());
    }
}
