//! In-process mock transport.
//!
//! A [`MockTransportHub`] wires request sockets to reply sockets and
//! publish sockets to subscribe sockets by endpoint name, entirely in
//! the caller's thread. Deliveries are synchronous and deterministic,
//! which makes it the transport of choice for unit-testing handlers and
//! facade wiring without ZeroMQ.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    FrameCallback, PublishSocket, ReplyHandler, ReplySocket, RequestSocket, SocketFactory,
    SubscribeSocket,
};
use crate::error::BusError;
use uuid::Uuid;

type HandlerSlot = Arc<Mutex<Option<ReplyHandler>>>;
type CallbackSlot = Arc<Mutex<Option<FrameCallback>>>;

#[derive(Default)]
struct HubInner {
    reply_handlers: HashMap<String, HandlerSlot>,
    subscribers: HashMap<String, Vec<(Uuid, CallbackSlot)>>,
    bound_publishers: HashSet<String>,
}

/// Shared wiring between all sockets created by one [`MockSocketFactory`].
#[derive(Default)]
pub struct MockTransportHub {
    inner: Mutex<HubInner>,
}

impl MockTransportHub {
    fn reply_slot(&self, endpoint: &str) -> HandlerSlot {
        self.inner
            .lock()
            .reply_handlers
            .entry(endpoint.to_owned())
            .or_default()
            .clone()
    }

    fn bind_publisher(&self, endpoint: &str) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        if !inner.bound_publishers.insert(endpoint.to_owned()) {
            return Err(BusError::Configuration(format!(
                "endpoint '{endpoint}' already bound"
            )));
        }
        Ok(())
    }

    fn add_subscriber(&self, endpoint: &str, slot: CallbackSlot) -> Uuid {
        let id = Uuid::new_v4();
        self.inner
            .lock()
            .subscribers
            .entry(endpoint.to_owned())
            .or_default()
            .push((id, slot));
        id
    }

    fn remove_subscriber(&self, endpoint: &str, id: Uuid) {
        if let Some(slots) = self.inner.lock().subscribers.get_mut(endpoint) {
            slots.retain(|(sid, _)| *sid != id);
        }
    }

    fn fanout(&self, endpoint: &str, frame: &[u8]) {
        // Snapshot the slots so callbacks run without the hub lock held.
        let slots: Vec<CallbackSlot> = self
            .inner
            .lock()
            .subscribers
            .get(endpoint)
            .map(|subs| subs.iter().map(|(_, slot)| slot.clone()).collect())
            .unwrap_or_default();
        for slot in slots {
            if let Some(callback) = slot.lock().as_mut() {
                callback(frame);
            }
        }
    }
}

/// [`SocketFactory`] whose sockets deliver through a shared hub.
#[derive(Default)]
pub struct MockSocketFactory {
    hub: Arc<MockTransportHub>,
}

impl MockSocketFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hub(&self) -> &Arc<MockTransportHub> {
        &self.hub
    }
}

impl SocketFactory for MockSocketFactory {
    fn publish_socket(&self, endpoint: &str) -> crate::Result<Box<dyn PublishSocket>> {
        Ok(Box::new(MockPublishSocket {
            hub: Arc::clone(&self.hub),
            endpoint: endpoint.to_owned(),
            bound: false,
        }))
    }

    fn subscribe_socket(&self, endpoint: &str) -> crate::Result<Box<dyn SubscribeSocket>> {
        Ok(Box::new(MockSubscribeSocket {
            hub: Arc::clone(&self.hub),
            endpoint: endpoint.to_owned(),
            slot: None,
            id: None,
        }))
    }

    fn request_socket(&self, endpoint: &str) -> crate::Result<Box<dyn RequestSocket>> {
        Ok(Box::new(MockRequestSocket {
            hub: Arc::clone(&self.hub),
            endpoint: endpoint.to_owned(),
            started: false,
        }))
    }

    fn reply_socket(&self, endpoint: &str) -> crate::Result<Box<dyn ReplySocket>> {
        Ok(Box::new(MockReplySocket {
            hub: Arc::clone(&self.hub),
            endpoint: endpoint.to_owned(),
            pending: None,
            slot: None,
        }))
    }
}

struct MockPublishSocket {
    hub: Arc<MockTransportHub>,
    endpoint: String,
    bound: bool,
}

impl PublishSocket for MockPublishSocket {
    fn start(&mut self) -> crate::Result<()> {
        if self.bound {
            return Ok(());
        }
        self.hub.bind_publisher(&self.endpoint)?;
        self.bound = true;
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> crate::Result<()> {
        if !self.bound {
            return Err(BusError::Configuration(
                "publish socket not started".into(),
            ));
        }
        self.hub.fanout(&self.endpoint, frame);
        Ok(())
    }
}

struct MockSubscribeSocket {
    hub: Arc<MockTransportHub>,
    endpoint: String,
    slot: Option<CallbackSlot>,
    id: Option<Uuid>,
}

impl SubscribeSocket for MockSubscribeSocket {
    fn start(&mut self, on_frame: FrameCallback) -> crate::Result<()> {
        if self.slot.is_some() {
            return Ok(());
        }
        let slot: CallbackSlot = Arc::new(Mutex::new(Some(on_frame)));
        let id = self.hub.add_subscriber(&self.endpoint, slot.clone());
        self.slot = Some(slot);
        self.id = Some(id);
        Ok(())
    }

    fn stop(&mut self) -> crate::Result<()> {
        if let Some(slot) = self.slot.take() {
            *slot.lock() = None;
        }
        if let Some(id) = self.id.take() {
            self.hub.remove_subscriber(&self.endpoint, id);
        }
        Ok(())
    }
}

struct MockRequestSocket {
    hub: Arc<MockTransportHub>,
    endpoint: String,
    started: bool,
}

impl RequestSocket for MockRequestSocket {
    fn start(&mut self) -> crate::Result<()> {
        self.started = true;
        Ok(())
    }

    fn send(&mut self, request: &[u8]) -> crate::Result<Vec<u8>> {
        if !self.started {
            return Err(BusError::Configuration(
                "request socket not started".into(),
            ));
        }
        let slot = self.hub.reply_slot(&self.endpoint);
        let mut guard = slot.lock();
        let handler = guard.as_mut().ok_or_else(|| {
            BusError::Configuration(format!(
                "no reply socket bound to '{}'",
                self.endpoint
            ))
        })?;
        Ok(handler(request))
    }
}

struct MockReplySocket {
    hub: Arc<MockTransportHub>,
    endpoint: String,
    pending: Option<ReplyHandler>,
    slot: Option<HandlerSlot>,
}

impl ReplySocket for MockReplySocket {
    fn initialize(&mut self, handler: ReplyHandler) -> crate::Result<()> {
        if self.pending.is_some() || self.slot.is_some() {
            return Err(BusError::Configuration(
                "reply socket already initialized".into(),
            ));
        }
        self.pending = Some(handler);
        Ok(())
    }

    fn start(&mut self) -> crate::Result<()> {
        if self.slot.is_some() {
            return Ok(());
        }
        let handler = self.pending.take().ok_or_else(|| {
            BusError::Configuration("reply socket must be initialized before start".into())
        })?;
        let slot = self.hub.reply_slot(&self.endpoint);
        *slot.lock() = Some(handler);
        self.slot = Some(slot);
        Ok(())
    }

    fn stop(&mut self) -> crate::Result<()> {
        if let Some(slot) = self.slot.take() {
            *slot.lock() = None;
        }
        Ok(())
    }
}
