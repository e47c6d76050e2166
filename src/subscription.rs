//! Client-side stream subscriptions.
//!
//! Subscribing to a stream sends the built-in `CreateStream` command to
//! the server, opens a subscribe socket dedicated to the stream, and
//! drives the caller's [`EventDispatcher`] from that socket's receive
//! thread. The returned [`Subscription`] handle unsubscribes on drop;
//! its socket and receive loop are torn down with it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bus::CommandBus;
use crate::events::{EventDispatcher, Metadata};
use crate::frame::FrameBuffer;
use crate::messages::{CreateStream, BUILTIN_RECIPIENT};
use crate::registry::MessageRegistry;
use crate::subscribe::{decode_event_frame, event_timestamp};
use crate::transport::{SocketFactory, SubscribeSocket};
use uuid::Uuid;

/// One stream's receive loop feeding an [`EventDispatcher`].
///
/// Owns the subscribe socket it was created for; stopping or dropping
/// the stream stops the loop.
pub(crate) struct SubscriptionStream {
    socket: Box<dyn SubscribeSocket>,
    stream: String,
}

impl SubscriptionStream {
    fn start(
        mut socket: Box<dyn SubscribeSocket>,
        registry: Arc<MessageRegistry>,
        dispatcher: Arc<dyn EventDispatcher>,
        stream: &str,
    ) -> crate::Result<Self> {
        let mut frame = FrameBuffer::new(registry);
        let stream_name = stream.to_owned();
        socket.start(Box::new(move |bytes: &[u8]| {
            let (header, payload) = match decode_event_frame(&mut frame, bytes) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(stream = %stream_name, error = %e, "dropping undecodable event frame");
                    return;
                }
            };
            let Some(payload) = payload else {
                warn!(stream = %stream_name, "event frame without payload, dropping");
                return;
            };
            let metadata = Metadata::with_created(&stream_name, event_timestamp(&header));
            if let Err(e) = dispatcher.handle(&metadata, header.event_type, payload.as_ref()) {
                warn!(stream = %stream_name, error = %e, "event dispatcher failed");
            }
        }))?;
        Ok(Self {
            socket,
            stream: stream.to_owned(),
        })
    }

    fn stop(&mut self) {
        if let Err(e) = self.socket.stop() {
            warn!(stream = %self.stream, error = %e, "failed to stop subscription stream");
        }
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.stop();
    }
}

type ActiveSubscriptions = Mutex<HashMap<Uuid, SubscriptionStream>>;

/// Opens and tracks per-stream subscriptions for a client.
pub struct SubscriptionManager {
    factory: Arc<dyn SocketFactory>,
    registry: Arc<MessageRegistry>,
    commands: Arc<CommandBus>,
    active: Arc<ActiveSubscriptions>,
}

impl SubscriptionManager {
    pub(crate) fn new(
        factory: Arc<dyn SocketFactory>,
        registry: Arc<MessageRegistry>,
        commands: Arc<CommandBus>,
    ) -> Self {
        Self {
            factory,
            registry,
            commands,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register an event type receivable on any subscribed stream.
    pub fn register_event<E: crate::registry::Payload>(&self, id: u32) -> crate::Result<()> {
        self.registry.register::<E>(id)?;
        Ok(())
    }

    /// Subscribe `dispatcher` to a stream.
    ///
    /// Ensures the stream exists on the server, opens a subscribe
    /// socket for it and starts the receive loop. The subscription stays
    /// live until the returned handle is dropped or unsubscribed.
    pub fn subscribe(
        &self,
        stream: &str,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> crate::Result<Subscription> {
        self.commands.send(
            BUILTIN_RECIPIENT,
            &CreateStream {
                name: stream.to_owned(),
            },
        )?;

        let socket = self.factory.subscribe_socket(stream)?;
        let link =
            SubscriptionStream::start(socket, Arc::clone(&self.registry), dispatcher, stream)?;

        let id = Uuid::new_v4();
        self.active.lock().insert(id, link);
        debug!(stream, subscription = %id, "subscribed");

        Ok(Subscription {
            active: Arc::downgrade(&self.active),
            stream: stream.to_owned(),
            id,
            live: true,
        })
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }
}

/// Handle for one stream subscription. Unsubscribes on drop.
pub struct Subscription {
    active: Weak<ActiveSubscriptions>,
    stream: String,
    id: Uuid,
    live: bool,
}

impl Subscription {
    /// Stop the stream's receive loop and deregister the subscription.
    pub fn unsubscribe(&mut self) {
        if !self.live {
            return;
        }
        self.live = false;
        if let Some(active) = self.active.upgrade() {
            if active.lock().remove(&self.id).is_some() {
                debug!(stream = %self.stream, subscription = %self.id, "unsubscribed");
            }
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
