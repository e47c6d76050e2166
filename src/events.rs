//! Event metadata and typed event dispatch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::dispatch::MessageDispatcher;
use crate::registry::{AnyPayload, Payload};

/// Delivery metadata attached to every in-process event delivery.
#[derive(Debug, Clone)]
pub struct Metadata {
    stream_id: String,
    created: DateTime<Utc>,
}

impl Metadata {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            created: Utc::now(),
        }
    }

    pub fn with_created(stream_id: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            stream_id: stream_id.into(),
            created,
        }
    }

    /// Name of the stream the event was published on.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Wall-clock time the event was created.
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }
}

/// Erased event consumer: receives `(metadata, message id, payload)`.
///
/// Implemented by [`EventRouter`] for table-driven dispatch; custom
/// implementations may route however they like.
pub trait EventDispatcher: Send + Sync {
    fn handle(&self, metadata: &Metadata, id: u32, event: &dyn AnyPayload) -> crate::Result<()>;
}

/// A typed handler for one event type. One struct may implement this
/// trait for several event types and register each with one
/// [`EventRouter::route`] call.
pub trait EventHandler<E>: Send + Sync {
    fn handle(&self, metadata: &Metadata, event: &E);
}

/// Table-driven [`EventDispatcher`]: maps event ids to typed handlers.
/// Events with no route are silently dropped.
#[derive(Default)]
pub struct EventRouter {
    table: MessageDispatcher<(), Metadata>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route events with `id` to a typed handler object.
    pub fn route<E: Payload>(&mut self, id: u32, handler: Arc<dyn EventHandler<E>>) {
        self.table.register::<E>(id, move |metadata, event| {
            handler.handle(metadata, event);
            Ok(())
        });
    }

    /// Route events with `id` to a closure.
    pub fn route_fn<E: Payload>(
        &mut self,
        id: u32,
        handler: impl Fn(&Metadata, &E) + Send + Sync + 'static,
    ) {
        self.table.register::<E>(id, move |metadata, event| {
            handler(metadata, event);
            Ok(())
        });
    }

    pub fn routes(&self, id: u32) -> bool {
        self.table.contains(id)
    }
}

impl EventDispatcher for EventRouter {
    fn handle(&self, metadata: &Metadata, id: u32, event: &dyn AnyPayload) -> crate::Result<()> {
        if !self.table.contains(id) {
            trace!(id, stream = metadata.stream_id(), "no route for event, dropping");
            return Ok(());
        }
        self.table.handle(metadata, id, event)
    }
}
