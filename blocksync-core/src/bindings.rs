//! Pluggable per-type bindings.
//!
//! The replication core never interprets a datablock's payload itself. A
//! `DataBinding` turns raw committed bytes into a live in-process instance
//! and back; implementations are registered per type name at startup and
//! looked up by the discriminator carried on the wire.

use bytes::Bytes;
use std::any::Any;
use std::collections::HashMap;

use crate::error::{ReplicationError, Result};

/// A live in-process object managed through its binding.
pub type Instance = Box<dyn Any + Send + Sync>;

/// Capability interface implemented once per supported data type.
///
/// `dump` must be deterministic: committing the same instance twice in a
/// row yields byte-identical payloads, which is what change detection
/// relies on.
pub trait DataBinding: Send + Sync {
    /// Type-name discriminator this binding handles.
    fn type_name(&self) -> &'static str;

    /// Build a fresh live instance from a committed payload.
    fn construct(&self, payload: &[u8]) -> Result<Instance>;

    /// Load a committed payload into an existing live instance.
    fn load(&self, instance: &mut Instance, payload: &[u8]) -> Result<()>;

    /// Serialize a live instance into its committed payload.
    fn dump(&self, instance: &Instance) -> Result<Bytes>;

    /// Whether the live instance is still usable.
    fn is_valid(&self, instance: &Instance) -> bool;
}

/// Type-name to binding table, built at startup and shared read-only.
#[derive(Default)]
pub struct BindingRegistry {
    bindings: HashMap<&'static str, Box<dyn DataBinding>>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding under its own type name. A later registration
    /// for the same name replaces the earlier one.
    pub fn register(&mut self, binding: Box<dyn DataBinding>) {
        self.bindings.insert(binding.type_name(), binding);
    }

    /// Look up the binding for a type name.
    pub fn get(&self, type_name: &str) -> Result<&dyn DataBinding> {
        self.bindings
            .get(type_name)
            .map(|b| b.as_ref())
            .ok_or_else(|| ReplicationError::UnsupportedType(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.bindings.contains_key(type_name)
    }

    /// Registered type names.
    pub fn type_names(&self) -> Vec<&'static str> {
        self.bindings.keys().copied().collect()
    }
}

/// Reference binding replicating plain byte buffers.
///
/// Useful for tests and for payloads that are already serialized by the
/// host application.
pub struct BytesBinding;

impl DataBinding for BytesBinding {
    fn type_name(&self) -> &'static str {
        "bytes"
    }

    fn construct(&self, payload: &[u8]) -> Result<Instance> {
        Ok(Box::new(payload.to_vec()))
    }

    fn load(&self, instance: &mut Instance, payload: &[u8]) -> Result<()> {
        let buffer = instance
            .downcast_mut::<Vec<u8>>()
            .ok_or_else(|| ReplicationError::Data("instance is not a byte buffer".to_string()))?;
        buffer.clear();
        buffer.extend_from_slice(payload);
        Ok(())
    }

    fn dump(&self, instance: &Instance) -> Result<Bytes> {
        let buffer = instance
            .downcast_ref::<Vec<u8>>()
            .ok_or_else(|| ReplicationError::Data("instance is not a byte buffer".to_string()))?;
        Ok(Bytes::copy_from_slice(buffer))
    }

    fn is_valid(&self, instance: &Instance) -> bool {
        instance.downcast_ref::<Vec<u8>>().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let mut registry = BindingRegistry::new();
        registry.register(Box::new(BytesBinding));

        assert!(registry.contains("bytes"));
        assert!(registry.get("bytes").is_ok());
        match registry.get("mesh") {
            Err(ReplicationError::UnsupportedType(name)) => assert_eq!(name, "mesh"),
            Ok(_) => panic!("expected UnsupportedType, got a binding"),
            Err(other) => panic!("expected UnsupportedType, got {other:?}"),
        }
    }

    #[test]
    fn test_bytes_binding_roundtrip() {
        let binding = BytesBinding;
        let payload = b"datablock payload";

        let mut instance = binding.construct(payload).unwrap();
        assert!(binding.is_valid(&instance));
        assert_eq!(binding.dump(&instance).unwrap().as_ref(), payload);

        binding.load(&mut instance, b"updated").unwrap();
        assert_eq!(binding.dump(&instance).unwrap().as_ref(), b"updated");
    }

    #[test]
    fn test_bytes_binding_rejects_foreign_instance() {
        let binding = BytesBinding;
        let mut foreign: Instance = Box::new(42u64);
        assert!(!binding.is_valid(&foreign));
        assert!(binding.load(&mut foreign, b"x").is_err());
        assert!(binding.dump(&foreign).is_err());
    }
}
