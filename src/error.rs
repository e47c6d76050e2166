//! Error types for the bus runtime.

use std::any::Any;
use thiserror::Error;

use crate::registry::AnyPayload;

/// Errors raised by the message registry, the frame codec, and the
/// typed dispatch layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message id or type was registered twice with conflicting pairs.
    #[error("message id {id} already registered with a different type ({name})")]
    AlreadyRegistered { id: u32, name: &'static str },

    /// No registration exists for a message id seen on the wire.
    #[error("unknown message id {0}")]
    UnknownMessageId(u32),

    /// No registration exists for an in-memory type.
    #[error("type {0} is not registered")]
    UnknownType(&'static str),

    /// Payload or header parsing failed.
    #[error("failed to decode {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: prost::DecodeError,
    },

    /// Serialization into the frame buffer failed.
    #[error("failed to encode message: {0}")]
    Encode(#[from] prost::EncodeError),

    /// An encoded frame does not fit the fixed buffer.
    #[error("frame overflow: {needed} bytes needed, {capacity} available")]
    Overflow { needed: usize, capacity: usize },

    /// An inbound frame is shorter than its size prefix claims.
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// A decoded message is not of the type the caller expected.
    #[error("message type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// A known message id has no handler bound to it.
    #[error("no handler registered for message id {0}")]
    HandlerAbsent(u32),
}

/// A command failure carried in a `CommandResponse` envelope.
///
/// Servers raise a `Fault` from a command handler to fail the command
/// with a status code; clients reconstruct it from a non-success reply.
/// The typed variant additionally carries a registered payload that the
/// caller can recover with [`Fault::details`].
#[derive(Debug, Error)]
pub enum Fault {
    #[error("command failed with status {code}: {message}")]
    Generic { code: u32, message: String },

    #[error("command failed with status {code}: {message}")]
    Typed {
        code: u32,
        message: String,
        type_id: u32,
        payload: Box<dyn AnyPayload>,
    },
}

impl Fault {
    /// Fail with a status code and message only.
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Fault::Generic {
            code,
            message: message.into(),
        }
    }

    /// Fail with a status code, message and a typed payload. The payload
    /// type must be registered under `type_id` on both endpoints.
    pub fn typed(
        type_id: u32,
        code: u32,
        message: impl Into<String>,
        payload: impl AnyPayload,
    ) -> Self {
        Fault::Typed {
            code,
            message: message.into(),
            type_id,
            payload: Box::new(payload),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Fault::Generic { code, .. } | Fault::Typed { code, .. } => *code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Fault::Generic { message, .. } | Fault::Typed { message, .. } => message,
        }
    }

    /// The registered id of the fault payload type, if any.
    pub fn type_id(&self) -> Option<u32> {
        match self {
            Fault::Generic { .. } => None,
            Fault::Typed { type_id, .. } => Some(*type_id),
        }
    }

    /// Downcast the fault payload to a concrete registered type.
    pub fn details<E: Any>(&self) -> Option<&E> {
        match self {
            Fault::Generic { .. } => None,
            Fault::Typed { payload, .. } => payload.as_any().downcast_ref::<E>(),
        }
    }
}

/// Top-level error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Invalid wiring: double start, missing initialization, duplicate
    /// stream creation, registration after start.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Registry, codec or dispatch failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A command failed with a status envelope.
    #[error(transparent)]
    Fault(#[from] Fault),

    /// Underlying socket error.
    #[error("transport error: {0}")]
    Transport(#[from] zmq::Error),

    /// Filesystem error while provisioning IPC endpoints.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
