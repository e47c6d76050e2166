//! Outbound event publishing.

use std::sync::Arc;

use chrono::Utc;
use tracing::trace;

use crate::frame::FrameBuffer;
use crate::messages::EventHeader;
use crate::registry::{AnyPayload, MessageRegistry, Payload};
use crate::transport::PublishSocket;

/// Serializes typed events into timestamped frames and hands each one to
/// a publish socket as a single send.
pub struct PublishHandler {
    socket: Box<dyn PublishSocket>,
    registry: Arc<MessageRegistry>,
    frame: FrameBuffer,
}

impl PublishHandler {
    pub fn new(socket: Box<dyn PublishSocket>, registry: Arc<MessageRegistry>) -> Self {
        let frame = FrameBuffer::new(Arc::clone(&registry));
        Self {
            socket,
            registry,
            frame,
        }
    }

    pub fn with_frame_capacity(
        socket: Box<dyn PublishSocket>,
        registry: Arc<MessageRegistry>,
        capacity: usize,
    ) -> Self {
        let frame = FrameBuffer::with_capacity(Arc::clone(&registry), capacity);
        Self {
            socket,
            registry,
            frame,
        }
    }

    /// Register an event type so it can be published.
    pub fn register_message<E: Payload>(&self, id: u32) -> crate::Result<()> {
        self.registry.register::<E>(id)?;
        Ok(())
    }

    /// Bind the underlying socket. Idempotent.
    pub fn start(&mut self) -> crate::Result<()> {
        self.socket.start()
    }

    /// Publish one event: look up its registered id, stamp an
    /// [`EventHeader`] with the current wall-clock time, frame, send.
    pub fn publish<E: Payload>(&mut self, event: &E) -> crate::Result<()> {
        self.publish_erased(event)
    }

    pub(crate) fn publish_erased(&mut self, event: &dyn AnyPayload) -> crate::Result<()> {
        let event_type = self.registry.id_of_value(event)?;
        let header = EventHeader {
            event_type,
            timestamp: Utc::now().timestamp_millis(),
        };
        self.frame.write(&header, Some(event))?;
        self.socket.send(self.frame.as_slice())?;
        trace!(event_type, name = event.type_name(), "event published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BusError, ProtocolError};
    use crate::messages::CreateStream;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CapturingSocket {
        started: Arc<Mutex<u32>>,
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl PublishSocket for CapturingSocket {
        fn start(&mut self) -> crate::Result<()> {
            *self.started.lock() += 1;
            Ok(())
        }

        fn send(&mut self, frame: &[u8]) -> crate::Result<()> {
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }
    }

    #[test]
    fn publishes_one_frame_with_timestamped_header() {
        let registry = Arc::new(MessageRegistry::new());
        let socket = CapturingSocket::default();
        let frames = Arc::clone(&socket.frames);

        let mut publisher = PublishHandler::new(Box::new(socket), Arc::clone(&registry));
        publisher.register_message::<CreateStream>(4).unwrap();
        publisher.start().unwrap();

        let before = Utc::now().timestamp_millis();
        publisher
            .publish(&CreateStream { name: "e".into() })
            .unwrap();
        let after = Utc::now().timestamp_millis();

        let frames = frames.lock();
        assert_eq!(frames.len(), 1);

        let mut parse = FrameBuffer::new(registry);
        parse.fill_from(&frames[0]).unwrap();
        let (header, payload) = parse.read::<EventHeader>(|h| h.event_type).unwrap();
        assert_eq!(header.event_type, 4);
        assert!(header.timestamp >= before && header.timestamp <= after);
        let payload = payload.unwrap();
        let event = payload.as_any().downcast_ref::<CreateStream>().unwrap();
        assert_eq!(event.name, "e");
    }

    #[test]
    fn unregistered_event_type_fails() {
        let registry = Arc::new(MessageRegistry::new());
        let mut publisher =
            PublishHandler::new(Box::new(CapturingSocket::default()), registry);
        publisher.start().unwrap();

        let err = publisher
            .publish(&CreateStream { name: "e".into() })
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::Protocol(ProtocolError::UnknownType(_))
        ));
    }
}
