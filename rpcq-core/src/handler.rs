//! Handler table collaborator and a map-backed implementation.

use crate::error::CoreError;
use rpcq_protocol::{ItemKind, PeerId, UpdateStage, WireReader};
use std::collections::HashMap;

/// Facts about an inbound item passed to its handler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallContext {
    pub sender: PeerId,
    pub kind: ItemKind,
    pub stage: UpdateStage,
    /// Time at which the item was queued by the receiver, in seconds.
    pub timestamp: f32,
    /// The item was delivered in-process by a host to itself.
    pub loopback: bool,
}

/// Invokes the handler registered for a method id.
pub trait HandlerTable {
    /// `reader` is positioned at the first argument byte.
    fn invoke(
        &mut self,
        method_id: u64,
        reader: &mut WireReader<'_>,
        ctx: &CallContext,
    ) -> Result<(), CoreError>;
}

pub type MethodHandler =
    Box<dyn FnMut(&mut WireReader<'_>, &CallContext) -> Result<(), CoreError> + Send>;

/// Handlers keyed by method id.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: HashMap<u64, MethodHandler>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, method_id: u64, handler: F) -> Result<(), CoreError>
    where
        F: FnMut(&mut WireReader<'_>, &CallContext) -> Result<(), CoreError> + Send + 'static,
    {
        if self.handlers.contains_key(&method_id) {
            return Err(CoreError::DuplicateMethod(method_id));
        }
        self.handlers.insert(method_id, Box::new(handler));
        Ok(())
    }

    pub fn unregister(&mut self, method_id: u64) -> bool {
        self.handlers.remove(&method_id).is_some()
    }

    pub fn contains(&self, method_id: u64) -> bool {
        self.handlers.contains_key(&method_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl HandlerTable for MethodRegistry {
    fn invoke(
        &mut self,
        method_id: u64,
        reader: &mut WireReader<'_>,
        ctx: &CallContext,
    ) -> Result<(), CoreError> {
        let handler = self
            .handlers
            .get_mut(&method_id)
            .ok_or(CoreError::UnknownMethod(method_id))?;
        handler(reader, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn ctx() -> CallContext {
        CallContext {
            sender: 3,
            kind: ItemKind::ServerRpc,
            stage: UpdateStage::Update,
            timestamp: 0.0,
            loopback: false,
        }
    }

    #[test]
    fn test_register_and_invoke() {
        let total = Arc::new(AtomicU32::new(0));
        let seen = total.clone();

        let mut registry = MethodRegistry::new();
        registry
            .register(10, move |reader, ctx| {
                assert_eq!(ctx.sender, 3);
                seen.fetch_add(reader.read_u32()?, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let args = 5u32.to_le_bytes();
        registry
            .invoke(10, &mut WireReader::new(&args), &ctx())
            .unwrap();
        registry
            .invoke(10, &mut WireReader::new(&args), &ctx())
            .unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_unknown_and_duplicate() {
        let mut registry = MethodRegistry::new();
        registry.register(1, |_, _| Ok(())).unwrap();
        assert!(matches!(
            registry.register(1, |_, _| Ok(())),
            Err(CoreError::DuplicateMethod(1))
        ));
        assert!(matches!(
            registry.invoke(2, &mut WireReader::new(&[]), &ctx()),
            Err(CoreError::UnknownMethod(2))
        ));

        assert!(registry.unregister(1));
        assert!(!registry.contains(1));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_short_args_surface_as_protocol_error() {
        let mut registry = MethodRegistry::new();
        registry
            .register(1, |reader, _| {
                reader.read_u64()?;
                Ok(())
            })
            .unwrap();
        let err = registry
            .invoke(1, &mut WireReader::new(&[1, 2]), &ctx())
            .unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
    }
}
