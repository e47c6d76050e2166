//! Generic id → typed-handler dispatch.

use std::collections::HashMap;

use crate::error::{BusError, ProtocolError};
use crate::registry::{AnyPayload, Payload};

type Handler<R, M> =
    Box<dyn Fn(&M, &dyn AnyPayload) -> Result<R, BusError> + Send + Sync + 'static>;

/// Maps incoming `(metadata, message id, erased payload)` triples to
/// registered typed handlers.
///
/// `R` is the handler result, `M` the metadata passed alongside the
/// message (a command header, an event timestamp, stream metadata).
/// Each registered handler downcasts the erased payload to its concrete
/// type before invoking the user function; a mismatch is a
/// [`ProtocolError::TypeMismatch`].
pub struct MessageDispatcher<R, M> {
    handlers: HashMap<u32, Handler<R, M>>,
}

impl<R, M> Default for MessageDispatcher<R, M> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<R, M> MessageDispatcher<R, M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `id` to a typed handler. Re-binding an id replaces the
    /// previous handler.
    pub fn register<T: Payload>(
        &mut self,
        id: u32,
        handler: impl Fn(&M, &T) -> Result<R, BusError> + Send + Sync + 'static,
    ) {
        self.handlers.insert(
            id,
            Box::new(move |meta: &M, msg: &dyn AnyPayload| {
                let typed = msg.as_any().downcast_ref::<T>().ok_or_else(|| {
                    ProtocolError::TypeMismatch {
                        expected: std::any::type_name::<T>(),
                        actual: msg.type_name(),
                    }
                })?;
                handler(meta, typed)
            }),
        );
    }

    /// Invoke the handler bound to `id`.
    pub fn handle(&self, meta: &M, id: u32, msg: &dyn AnyPayload) -> Result<R, BusError> {
        let handler = self
            .handlers
            .get(&id)
            .ok_or(ProtocolError::HandlerAbsent(id))?;
        handler(meta, msg)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.handlers.contains_key(&id)
    }
}
