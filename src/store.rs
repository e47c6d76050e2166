//! Server-side event store: named streams with dual local + remote
//! delivery.
//!
//! Each stream owns one remote publish endpoint (a PUB socket bound to
//! the stream's name) and a list of in-process subscribers. `publish`
//! delivers to local subscribers first, in subscription order, then
//! emits one frame on the stream's publish socket. Local delivery and
//! the remote send are not atomic: a local subscriber may observe an
//! event before any remote peer does.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::BusError;
use crate::events::{EventDispatcher, Metadata};
use crate::publish::PublishHandler;
use crate::registry::{AnyPayload, MessageRegistry, Payload};
use crate::transport::SocketFactory;
use uuid::Uuid;

struct LocalSubscriber {
    id: Uuid,
    dispatcher: Arc<dyn EventDispatcher>,
}

#[derive(Default)]
struct StoreInner {
    streams: HashMap<String, PublishHandler>,
    subscribers: HashMap<String, Vec<LocalSubscriber>>,
}

/// Creates streams and fans published events out to in-process
/// subscribers and the stream's remote publish socket.
pub struct EventStore {
    registry: Arc<MessageRegistry>,
    factory: Arc<dyn SocketFactory>,
    inner: Arc<Mutex<StoreInner>>,
}

impl EventStore {
    pub fn new(factory: Arc<dyn SocketFactory>, registry: Arc<MessageRegistry>) -> Self {
        Self {
            registry,
            factory,
            inner: Arc::new(Mutex::new(StoreInner::default())),
        }
    }

    /// Register an event type with the shared registry.
    pub fn register_message<M: Payload>(&self, id: u32) -> crate::Result<()> {
        self.registry.register::<M>(id)?;
        Ok(())
    }

    /// Create the named stream: bind its publish endpoint and start the
    /// publish handler. Creating a stream that already exists is a
    /// configuration error.
    pub fn create_stream(&self, name: &str) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        if inner.streams.contains_key(name) {
            return Err(BusError::Configuration(format!(
                "stream '{name}' already exists"
            )));
        }
        let socket = self.factory.publish_socket(name)?;
        let mut handler = PublishHandler::new(socket, Arc::clone(&self.registry));
        handler.start()?;
        inner.streams.insert(name.to_owned(), handler);
        debug!(stream = name, "stream created");
        Ok(())
    }

    /// Create the named stream if it does not exist yet. Used by the
    /// built-in `CreateStream` command handler so repeated subscriptions
    /// to one stream succeed.
    pub fn ensure_stream(&self, name: &str) -> crate::Result<()> {
        if self.inner.lock().streams.contains_key(name) {
            debug!(stream = name, "stream already exists");
            return Ok(());
        }
        self.create_stream(name)
    }

    pub fn has_stream(&self, name: &str) -> bool {
        self.inner.lock().streams.contains_key(name)
    }

    /// Subscribe an in-process dispatcher to a stream. The stream does
    /// not need to exist yet; events only flow after `create_stream`.
    pub fn subscribe_local(
        &self,
        stream: &str,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> LocalSubscription {
        let id = Uuid::new_v4();
        self.inner
            .lock()
            .subscribers
            .entry(stream.to_owned())
            .or_default()
            .push(LocalSubscriber { id, dispatcher });
        debug!(stream, subscription = %id, "local subscriber added");
        LocalSubscription {
            inner: Arc::downgrade(&self.inner),
            stream: stream.to_owned(),
            id,
            active: true,
        }
    }

    /// Publish an event on a stream.
    ///
    /// The stream must have been created. Local subscribers are invoked
    /// in subscription order; one failing subscriber does not stop the
    /// others. The frame then goes out on the stream's publish socket.
    /// The first local error (if any) surfaces after the fanout
    /// completes; later ones are logged.
    pub fn publish<E: Payload>(&self, stream: &str, event: &E) -> crate::Result<()> {
        self.publish_erased(stream, event)
    }

    fn publish_erased(&self, stream: &str, event: &dyn AnyPayload) -> crate::Result<()> {
        if !self.has_stream(stream) {
            return Err(BusError::Configuration(format!(
                "stream '{stream}' has not been created"
            )));
        }
        let event_type = self.registry.id_of_value(event)?;

        // Snapshot the subscriber list so handlers run outside the lock.
        let subscribers: Vec<(Uuid, Arc<dyn EventDispatcher>)> = {
            let inner = self.inner.lock();
            inner
                .subscribers
                .get(stream)
                .map(|subs| {
                    subs.iter()
                        .map(|s| (s.id, Arc::clone(&s.dispatcher)))
                        .collect()
                })
                .unwrap_or_default()
        };

        let metadata = Metadata::new(stream);
        let mut first_error: Option<BusError> = None;
        for (id, dispatcher) in subscribers {
            if let Err(err) = dispatcher.handle(&metadata, event_type, event) {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    warn!(stream, subscription = %id, error = %err, "local subscriber failed");
                }
            }
        }

        let remote = {
            let mut inner = self.inner.lock();
            match inner.streams.get_mut(stream) {
                Some(handler) => handler.publish_erased(event),
                None => Err(BusError::Configuration(format!(
                    "stream '{stream}' has not been created"
                ))),
            }
        };
        if let Err(err) = remote {
            if first_error.is_none() {
                first_error = Some(err);
            } else {
                warn!(stream, error = %err, "remote publish failed");
            }
        }

        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Handle for an in-process subscription. Unsubscribes on drop.
pub struct LocalSubscription {
    inner: Weak<Mutex<StoreInner>>,
    stream: String,
    id: Uuid,
    active: bool,
}

impl LocalSubscription {
    /// Remove this subscriber from its stream. Deliveries already in
    /// flight complete; no further ones occur.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock();
            if let Some(subs) = inner.subscribers.get_mut(&self.stream) {
                subs.retain(|s| s.id != self.id);
            }
            debug!(stream = %self.stream, subscription = %self.id, "local subscriber removed");
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

impl Drop for LocalSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
