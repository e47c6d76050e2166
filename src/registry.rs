//! Typed message registry.
//!
//! The registry is the single source of truth for the id ↔ type mapping:
//! every handler (publish, subscribe, request client, request server) is
//! written generically against `u32` message ids while user code stays
//! typed. Registration happens during configuration; after a bus is
//! started the registry is treated as read-only.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ProtocolError;

/// Marker for types usable as wire payloads.
///
/// Blanket-implemented for every `prost::Message` struct, so deriving
/// `prost::Message` is all a payload type needs.
pub trait Payload: prost::Message + Default + Clone + 'static {}

impl<M> Payload for M where M: prost::Message + Default + Clone + 'static {}

/// Object-safe erased payload.
///
/// The dynamic counterpart of [`Payload`]: a decoded message travels the
/// generic layers as `Box<dyn AnyPayload>` tagged by its `TypeId`, and is
/// downcast back to the concrete type at the typed boundary.
pub trait AnyPayload: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;

    /// Encoded size in bytes.
    fn encoded_len(&self) -> usize;

    /// Encode into the front of `buf`, returning the number of bytes
    /// written. `buf` must be at least `encoded_len()` bytes.
    fn encode_to(&self, buf: &mut [u8]) -> Result<usize, ProtocolError>;

    /// Human-readable type name for diagnostics.
    fn type_name(&self) -> &'static str;
}

impl<M> AnyPayload for M
where
    M: Payload,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn encoded_len(&self) -> usize {
        prost::Message::encoded_len(self)
    }

    fn encode_to(&self, mut buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let len = prost::Message::encoded_len(self);
        if buf.len() < len {
            return Err(ProtocolError::Overflow {
                needed: len,
                capacity: buf.len(),
            });
        }
        prost::Message::encode(self, &mut buf)?;
        Ok(len)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<M>()
    }
}

type DecodeFn =
    Arc<dyn Fn(&[u8]) -> Result<Box<dyn AnyPayload>, ProtocolError> + Send + Sync + 'static>;

struct Registration {
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

#[derive(Default)]
struct Tables {
    by_id: HashMap<u32, Registration>,
    by_type: HashMap<TypeId, u32>,
}

/// Bidirectional map between message ids, in-memory types and their
/// decoders.
///
/// Shared via `Arc` between every handler of an endpoint. Registering the
/// same `(id, type)` pair twice is a no-op; registering a different type
/// under an existing id, or a different id under an existing type, fails
/// with [`ProtocolError::AlreadyRegistered`].
#[derive(Default)]
pub struct MessageRegistry {
    tables: RwLock<Tables>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `M` under `id`.
    pub fn register<M: Payload>(&self, id: u32) -> Result<(), ProtocolError> {
        let type_id = TypeId::of::<M>();
        let type_name = std::any::type_name::<M>();
        let mut tables = self.tables.write();

        if let Some(existing) = tables.by_id.get(&id) {
            if existing.type_id == type_id {
                return Ok(());
            }
            return Err(ProtocolError::AlreadyRegistered {
                id,
                name: existing.type_name,
            });
        }
        if tables.by_type.contains_key(&type_id) {
            return Err(ProtocolError::AlreadyRegistered { id, name: type_name });
        }

        tables.by_id.insert(
            id,
            Registration {
                type_id,
                type_name,
                decode: Arc::new(|bytes: &[u8]| {
                    M::decode(bytes).map(|m| Box::new(m) as Box<dyn AnyPayload>).map_err(
                        |source| ProtocolError::Decode {
                            name: std::any::type_name::<M>().to_owned(),
                            source,
                        },
                    )
                }),
            },
        );
        tables.by_type.insert(type_id, id);
        Ok(())
    }

    /// Decode `bytes` as the type registered under `id`.
    pub fn decode(&self, id: u32, bytes: &[u8]) -> Result<Box<dyn AnyPayload>, ProtocolError> {
        let decode = {
            let tables = self.tables.read();
            let registration = tables
                .by_id
                .get(&id)
                .ok_or(ProtocolError::UnknownMessageId(id))?;
            Arc::clone(&registration.decode)
        };
        decode(bytes)
    }

    /// The id registered for `M`.
    pub fn id_of<M: 'static>(&self) -> Result<u32, ProtocolError> {
        self.tables
            .read()
            .by_type
            .get(&TypeId::of::<M>())
            .copied()
            .ok_or(ProtocolError::UnknownType(std::any::type_name::<M>()))
    }

    /// The id registered for a value's runtime type.
    pub fn id_of_value(&self, value: &dyn AnyPayload) -> Result<u32, ProtocolError> {
        self.tables
            .read()
            .by_type
            .get(&value.as_any().type_id())
            .copied()
            .ok_or(ProtocolError::UnknownType(value.type_name()))
    }

    /// Human-readable name of the type registered under `id`.
    pub fn name_of(&self, id: u32) -> Result<&'static str, ProtocolError> {
        self.tables
            .read()
            .by_id
            .get(&id)
            .map(|r| r.type_name)
            .ok_or(ProtocolError::UnknownMessageId(id))
    }

    pub fn is_registered(&self, id: u32) -> bool {
        self.tables.read().by_id.contains_key(&id)
    }
}
