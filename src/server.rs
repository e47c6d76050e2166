//! Typed request/reply server.
//!
//! [`RequestServer`] binds a reply socket, decodes each inbound command
//! frame, dispatches it to the registered handler and writes a
//! [`CommandResponse`] envelope back. Every outcome becomes an
//! envelope; a handler error never escapes the receive loop:
//!
//! - handler success → 200, with the response payload when present
//! - [`Fault::Typed`] → the fault's code/message/type plus its payload
//! - [`Fault::Generic`] → the fault's code/message, no payload
//! - unknown command id or undecodable request → 400
//! - no handler bound for the id → 404
//! - any other handler error → 500

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::dispatch::MessageDispatcher;
use crate::error::{BusError, Fault, ProtocolError};
use crate::frame::{FrameBuffer, DEFAULT_FRAME_CAPACITY};
use crate::messages::{CommandHeader, CommandResponse};
use crate::registry::{AnyPayload, MessageRegistry, Payload};
use crate::transport::ReplySocket;

/// What a command handler produced for the reply frame.
pub enum CommandReply {
    /// Empty success envelope (`response_type` 0).
    Empty,
    /// Success envelope announcing a typed payload.
    Message {
        id: u32,
        payload: Box<dyn AnyPayload>,
    },
}

type CommandDispatcher = MessageDispatcher<CommandReply, CommandHeader>;

/// Command server over a reply socket.
///
/// Handlers are registered before `start`; the receive loop exclusively
/// owns the inbound and outbound frame buffers for its whole life.
pub struct RequestServer {
    socket: Box<dyn ReplySocket>,
    registry: Arc<MessageRegistry>,
    dispatcher: Option<CommandDispatcher>,
    frame_capacity: usize,
    running: bool,
}

impl RequestServer {
    pub fn new(socket: Box<dyn ReplySocket>, registry: Arc<MessageRegistry>) -> Self {
        Self {
            socket,
            registry,
            dispatcher: Some(MessageDispatcher::new()),
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            running: false,
        }
    }

    pub fn with_frame_capacity(
        socket: Box<dyn ReplySocket>,
        registry: Arc<MessageRegistry>,
        capacity: usize,
    ) -> Self {
        Self {
            socket,
            registry,
            dispatcher: Some(MessageDispatcher::new()),
            frame_capacity: capacity,
            running: false,
        }
    }

    fn dispatcher_mut(&mut self) -> crate::Result<&mut CommandDispatcher> {
        self.dispatcher
            .as_mut()
            .ok_or_else(|| BusError::Configuration("cannot register handlers after start".into()))
    }

    /// Register a handler producing a typed response.
    pub fn register_handler<Req: Payload, Rsp: Payload>(
        &mut self,
        req_id: u32,
        rsp_id: u32,
        handler: impl Fn(&Req) -> crate::Result<Rsp> + Send + Sync + 'static,
    ) -> crate::Result<()> {
        self.registry.register::<Req>(req_id)?;
        self.registry.register::<Rsp>(rsp_id)?;
        self.dispatcher_mut()?.register::<Req>(req_id, move |_header, request| {
            let response = handler(request)?;
            Ok(CommandReply::Message {
                id: rsp_id,
                payload: Box::new(response),
            })
        });
        Ok(())
    }

    /// Register a responding handler that also receives the full
    /// [`CommandHeader`], including the recipient string.
    pub fn register_handler_with_header<Req: Payload, Rsp: Payload>(
        &mut self,
        req_id: u32,
        rsp_id: u32,
        handler: impl Fn(&CommandHeader, &Req) -> crate::Result<Rsp> + Send + Sync + 'static,
    ) -> crate::Result<()> {
        self.registry.register::<Req>(req_id)?;
        self.registry.register::<Rsp>(rsp_id)?;
        self.dispatcher_mut()?.register::<Req>(req_id, move |header, request| {
            let response = handler(header, request)?;
            Ok(CommandReply::Message {
                id: rsp_id,
                payload: Box::new(response),
            })
        });
        Ok(())
    }

    /// Register a handler with no response payload. The handler receives
    /// the full [`CommandHeader`], including the recipient string.
    pub fn register_handler_void<Req: Payload>(
        &mut self,
        req_id: u32,
        handler: impl Fn(&CommandHeader, &Req) -> crate::Result<()> + Send + Sync + 'static,
    ) -> crate::Result<()> {
        self.registry.register::<Req>(req_id)?;
        self.dispatcher_mut()?.register::<Req>(req_id, move |header, request| {
            handler(header, request)?;
            Ok(CommandReply::Empty)
        });
        Ok(())
    }

    /// Register an error type so handlers may raise it as a typed fault.
    pub fn register_error<E: Payload>(&mut self, id: u32) -> crate::Result<()> {
        self.registry.register::<E>(id)?;
        Ok(())
    }

    /// Initialize the reply socket with the receive closure and start
    /// its loop. Idempotent while running.
    pub fn start(&mut self) -> crate::Result<()> {
        if self.running {
            return Ok(());
        }
        let dispatcher = Arc::new(self.dispatcher.take().ok_or_else(|| {
            BusError::Configuration("request server already started once".into())
        })?);
        let mut in_frame =
            FrameBuffer::with_capacity(Arc::clone(&self.registry), self.frame_capacity);
        let mut out_frame =
            FrameBuffer::with_capacity(Arc::clone(&self.registry), self.frame_capacity);

        self.socket.initialize(Box::new(move |request: &[u8]| {
            Self::handle_request(&dispatcher, &mut in_frame, &mut out_frame, request);
            out_frame.as_slice().to_vec()
        }))?;
        self.socket.start()?;
        self.running = true;
        debug!("request server started");
        Ok(())
    }

    /// Stop the receive loop and join its thread.
    pub fn stop(&mut self) -> crate::Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        self.socket.stop()?;
        debug!("request server stopped");
        Ok(())
    }

    /// Process one request into `out_frame`. Infallible: every error is
    /// translated into a response envelope.
    fn handle_request(
        dispatcher: &CommandDispatcher,
        in_frame: &mut FrameBuffer,
        out_frame: &mut FrameBuffer,
        request: &[u8],
    ) {
        out_frame.reset();
        if let Err(err) = Self::process(dispatcher, in_frame, out_frame, request) {
            Self::write_failure(out_frame, err);
        }
    }

    fn process(
        dispatcher: &CommandDispatcher,
        in_frame: &mut FrameBuffer,
        out_frame: &mut FrameBuffer,
        request: &[u8],
    ) -> crate::Result<()> {
        in_frame.fill_from(request)?;
        let (header, payload) = in_frame.read::<CommandHeader>(|h| h.command_type)?;
        let payload = payload.ok_or(ProtocolError::TypeMismatch {
            expected: "command payload",
            actual: "no payload",
        })?;

        let reply = dispatcher.handle(&header, header.command_type, payload.as_ref())?;
        match reply {
            CommandReply::Empty => {
                out_frame.write(&CommandResponse::ok(), None)?;
            }
            CommandReply::Message { id, payload } => {
                out_frame.write(&CommandResponse::ok_with(id), Some(payload.as_ref()))?;
            }
        }
        Ok(())
    }

    /// Serialize a failed outcome as a response envelope.
    fn write_failure(out_frame: &mut FrameBuffer, err: BusError) {
        let written = match err {
            BusError::Fault(Fault::Typed {
                code,
                message,
                type_id,
                payload,
            }) => {
                debug!(code, type_id, "handler raised typed fault: {message}");
                out_frame.write(
                    &CommandResponse::failed(code, message, type_id),
                    Some(payload.as_ref()),
                )
            }
            BusError::Fault(Fault::Generic { code, message }) => {
                debug!(code, "handler raised fault: {message}");
                out_frame.write(&CommandResponse::failed(code, message, 0), None)
            }
            BusError::Protocol(ProtocolError::HandlerAbsent(id)) => {
                warn!(command_type = id, "command with no registered handler");
                out_frame.write(
                    &CommandResponse::failed(
                        404,
                        format!("no handler registered for command {id}"),
                        0,
                    ),
                    None,
                )
            }
            BusError::Protocol(protocol) => {
                warn!("rejecting malformed command: {protocol}");
                out_frame.write(
                    &CommandResponse::failed(400, protocol.to_string(), 0),
                    None,
                )
            }
            other => {
                error!("command handler failed: {other}");
                out_frame.write(&CommandResponse::failed(500, other.to_string(), 0), None)
            }
        };

        if written.is_err() {
            // The envelope itself did not fit; fall back to a bare 500.
            let fallback = CommandResponse::failed(500, "failed to encode fault response", 0);
            if let Err(e) = out_frame.write(&fallback, None) {
                error!(error = %e, "failed to encode fallback response");
                out_frame.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ReplyHandler;
    use parking_lot::Mutex;

    #[derive(Clone, PartialEq, ::prost::Message)]
    struct Ping {
        #[prost(string, tag = "1")]
        text: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    struct Pong {
        #[prost(string, tag = "1")]
        text: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    struct Trouble {
        #[prost(string, tag = "1")]
        detail: String,
    }

    /// Test double exposing the installed reply handler to the test.
    #[derive(Default)]
    struct LoopbackSocket {
        handler: Arc<Mutex<Option<ReplyHandler>>>,
    }

    impl LoopbackSocket {
        fn port(&self) -> Arc<Mutex<Option<ReplyHandler>>> {
            Arc::clone(&self.handler)
        }
    }

    impl ReplySocket for LoopbackSocket {
        fn initialize(&mut self, handler: ReplyHandler) -> crate::Result<()> {
            *self.handler.lock() = Some(handler);
            Ok(())
        }

        fn start(&mut self) -> crate::Result<()> {
            if self.handler.lock().is_none() {
                return Err(BusError::Configuration("not initialized".into()));
            }
            Ok(())
        }

        fn stop(&mut self) -> crate::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        server: RequestServer,
        registry: Arc<MessageRegistry>,
        port: Arc<Mutex<Option<ReplyHandler>>>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(MessageRegistry::new());
        let socket = LoopbackSocket::default();
        let port = socket.port();
        let server = RequestServer::new(Box::new(socket), Arc::clone(&registry));
        Fixture {
            server,
            registry,
            port,
        }
    }

    fn send(fx: &Fixture, request: &[u8]) -> (CommandResponse, Option<Box<dyn AnyPayload>>) {
        let mut guard = fx.port.lock();
        let handler = guard.as_mut().expect("server not started");
        let reply = handler(request);
        let mut frame = FrameBuffer::new(Arc::clone(&fx.registry));
        frame.fill_from(&reply).unwrap();
        frame.read::<CommandResponse>(|h| h.response_type).unwrap()
    }

    fn command_frame(
        registry: &Arc<MessageRegistry>,
        command_type: u32,
        recipient: &str,
        payload: &dyn AnyPayload,
    ) -> Vec<u8> {
        let mut frame = FrameBuffer::new(Arc::clone(registry));
        let header = CommandHeader {
            command_type,
            recipient: recipient.into(),
        };
        frame.write(&header, Some(payload)).unwrap();
        frame.as_slice().to_vec()
    }

    #[test]
    fn success_with_response_payload() {
        let mut fx = fixture();
        fx.server
            .register_handler::<Ping, Pong>(1, 2, |ping| {
                Ok(Pong {
                    text: format!("re:{}", ping.text),
                })
            })
            .unwrap();
        fx.server.start().unwrap();

        let request = command_frame(&fx.registry, 1, "svc", &Ping { text: "hi".into() });
        let (response, payload) = send(&fx, &request);

        assert_eq!(response.status_code, 200);
        assert_eq!(response.response_type, 2);
        let payload = payload.unwrap();
        assert_eq!(
            payload.as_any().downcast_ref::<Pong>().unwrap().text,
            "re:hi"
        );
    }

    #[test]
    fn responding_handler_can_read_the_header() {
        let mut fx = fixture();
        fx.server
            .register_handler_with_header::<Ping, Pong>(1, 2, |header, ping| {
                Ok(Pong {
                    text: format!("{}/{}", header.recipient, ping.text),
                })
            })
            .unwrap();
        fx.server.start().unwrap();

        let request = command_frame(&fx.registry, 1, "desk", &Ping { text: "hi".into() });
        let (response, payload) = send(&fx, &request);

        assert_eq!(response.status_code, 200);
        let payload = payload.unwrap();
        assert_eq!(
            payload.as_any().downcast_ref::<Pong>().unwrap().text,
            "desk/hi"
        );
    }

    #[test]
    fn void_handler_sees_header_and_yields_empty_envelope() {
        let mut fx = fixture();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&seen);
        fx.server
            .register_handler_void::<Ping>(1, move |header, ping| {
                sink.lock()
                    .push(format!("{}:{}", header.recipient, ping.text));
                Ok(())
            })
            .unwrap();
        fx.server.start().unwrap();

        let request = command_frame(&fx.registry, 1, "room-7", &Ping { text: "hi".into() });
        let (response, payload) = send(&fx, &request);

        assert_eq!(response.status_code, 200);
        assert_eq!(response.response_type, 0);
        assert!(payload.is_none());
        assert_eq!(seen.lock().as_slice(), ["room-7:hi"]);
    }

    #[test]
    fn typed_fault_is_serialized_with_payload() {
        let mut fx = fixture();
        fx.server.register_error::<Trouble>(999).unwrap();
        fx.server
            .register_handler_void::<Ping>(1, |_, _| {
                Err(Fault::typed(
                    999,
                    400,
                    "Test error",
                    Trouble { detail: "x".into() },
                )
                .into())
            })
            .unwrap();
        fx.server.start().unwrap();

        let request = command_frame(&fx.registry, 1, "svc", &Ping { text: "hi".into() });
        let (response, payload) = send(&fx, &request);

        assert_eq!(response.status_code, 400);
        assert_eq!(response.error_message, "Test error");
        assert_eq!(response.response_type, 999);
        let payload = payload.unwrap();
        assert_eq!(
            payload.as_any().downcast_ref::<Trouble>().unwrap().detail,
            "x"
        );
    }

    #[test]
    fn generic_fault_has_no_payload() {
        let mut fx = fixture();
        fx.server
            .register_handler_void::<Ping>(1, |_, _| Err(Fault::new(409, "conflict").into()))
            .unwrap();
        fx.server.start().unwrap();

        let request = command_frame(&fx.registry, 1, "svc", &Ping { text: "hi".into() });
        let (response, payload) = send(&fx, &request);

        assert_eq!(response.status_code, 409);
        assert_eq!(response.error_message, "conflict");
        assert_eq!(response.response_type, 0);
        assert!(payload.is_none());
    }

    #[test]
    fn unknown_command_id_yields_400() {
        let mut fx = fixture();
        fx.server
            .register_handler_void::<Ping>(1, |_, _| Ok(()))
            .unwrap();
        fx.server.start().unwrap();

        // command_type 77 was never registered: payload decode fails
        let mut frame = FrameBuffer::new(Arc::clone(&fx.registry));
        let header = CommandHeader {
            command_type: 77,
            recipient: "svc".into(),
        };
        let ping = Ping { text: "hi".into() };
        frame.write(&header, Some(&ping)).unwrap();
        let (response, payload) = send(&fx, frame.as_slice());

        assert_eq!(response.status_code, 400);
        assert!(payload.is_none());
    }

    #[test]
    fn registered_id_without_handler_yields_404() {
        let mut fx = fixture();
        fx.registry.register::<Ping>(5).unwrap();
        fx.server
            .register_handler_void::<Pong>(1, |_, _| Ok(()))
            .unwrap();
        fx.server.start().unwrap();

        let request = command_frame(&fx.registry, 5, "svc", &Ping { text: "hi".into() });
        let (response, payload) = send(&fx, &request);

        assert_eq!(response.status_code, 404);
        assert!(payload.is_none());
    }

    #[test]
    fn garbage_request_yields_400() {
        let mut fx = fixture();
        fx.server
            .register_handler_void::<Ping>(1, |_, _| Ok(()))
            .unwrap();
        fx.server.start().unwrap();

        let (response, payload) = send(&fx, &[0xba, 0xad, 0xf0, 0x0d]);
        assert_eq!(response.status_code, 400);
        assert!(payload.is_none());
    }

    #[test]
    fn unclassified_handler_error_yields_500() {
        let mut fx = fixture();
        fx.server
            .register_handler_void::<Ping>(1, |_, _| {
                Err(BusError::Configuration("internal wiring broke".into()))
            })
            .unwrap();
        fx.server.start().unwrap();

        let request = command_frame(&fx.registry, 1, "svc", &Ping { text: "hi".into() });
        let (response, _) = send(&fx, &request);
        assert_eq!(response.status_code, 500);
        assert!(response.error_message.contains("internal wiring broke"));
    }

    #[test]
    fn registration_after_start_is_rejected() {
        let mut fx = fixture();
        fx.server
            .register_handler_void::<Ping>(1, |_, _| Ok(()))
            .unwrap();
        fx.server.start().unwrap();

        let err = fx
            .server
            .register_handler_void::<Pong>(2, |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, BusError::Configuration(_)));
    }
}
