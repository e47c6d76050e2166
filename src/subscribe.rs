//! Inbound event subscription and typed dispatch.
//!
//! A [`SubscribeHandler`] owns a subscribe socket and a table of typed
//! handlers keyed by event id. The socket's receive thread parses each
//! frame as an [`EventHeader`] plus payload and invokes the matching
//! handler with the publish timestamp. One bad message never kills the
//! stream: parse and decode failures are logged and the loop continues;
//! events with no registered handler are silently dropped.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::frame::FrameBuffer;
use crate::messages::EventHeader;
use crate::registry::{AnyPayload, MessageRegistry, Payload};
use crate::transport::SubscribeSocket;

type TimedHandler = Box<dyn Fn(DateTime<Utc>, &dyn AnyPayload) + Send + Sync + 'static>;

/// Parse an inbound event frame into its header and payload.
///
/// Shared by the subscribe handler and the client-side subscription
/// stream.
pub(crate) fn decode_event_frame(
    frame: &mut FrameBuffer,
    bytes: &[u8],
) -> crate::Result<(EventHeader, Option<Box<dyn AnyPayload>>)> {
    frame.fill_from(bytes)?;
    let (header, payload) = frame.read::<EventHeader>(|h| h.event_type)?;
    Ok((header, payload))
}

pub(crate) fn event_timestamp(header: &EventHeader) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(header.timestamp).unwrap_or_else(Utc::now)
}

/// Receives event frames on a background thread and dispatches them to
/// typed handlers by event id.
pub struct SubscribeHandler {
    socket: Box<dyn SubscribeSocket>,
    registry: Arc<MessageRegistry>,
    table: Arc<RwLock<HashMap<u32, TimedHandler>>>,
    running: bool,
}

impl SubscribeHandler {
    pub fn new(socket: Box<dyn SubscribeSocket>, registry: Arc<MessageRegistry>) -> Self {
        Self {
            socket,
            registry,
            table: Arc::new(RwLock::new(HashMap::new())),
            running: false,
        }
    }

    /// Register a typed handler for events with `id`. Also registers the
    /// event type with the shared registry.
    pub fn register_handler<E: Payload>(
        &mut self,
        id: u32,
        handler: impl Fn(DateTime<Utc>, &E) + Send + Sync + 'static,
    ) -> crate::Result<()> {
        self.registry.register::<E>(id)?;
        self.table.write().insert(
            id,
            Box::new(move |timestamp: DateTime<Utc>, event: &dyn AnyPayload| match event
                .as_any()
                .downcast_ref::<E>()
            {
                Some(event) => handler(timestamp, event),
                None => warn!(
                    id,
                    actual = event.type_name(),
                    "event payload type mismatch, dropping"
                ),
            }),
        );
        Ok(())
    }

    /// Start the receive loop. Idempotent while running.
    pub fn start(&mut self) -> crate::Result<()> {
        if self.running {
            return Ok(());
        }
        let registry = Arc::clone(&self.registry);
        let table = Arc::clone(&self.table);
        let mut frame = FrameBuffer::new(Arc::clone(&self.registry));

        self.socket.start(Box::new(move |bytes: &[u8]| {
            let (header, payload) = match decode_event_frame(&mut frame, bytes) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable event frame");
                    return;
                }
            };
            let Some(payload) = payload else {
                warn!(event_type = header.event_type, "event frame without payload, dropping");
                return;
            };
            let table = table.read();
            match table.get(&header.event_type) {
                Some(handler) => handler(event_timestamp(&header), payload.as_ref()),
                None => trace!(
                    event_type = header.event_type,
                    name = registry.name_of(header.event_type).unwrap_or("<unknown>"),
                    "no handler for event, dropping"
                ),
            }
        }))?;
        self.running = true;
        Ok(())
    }

    /// Stop the receive loop and close the socket.
    pub fn stop(&mut self) -> crate::Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        self.socket.stop()
    }
}
