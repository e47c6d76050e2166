//! Typed request/reply client.
//!
//! [`RequestClient`] frames a typed command with a [`CommandHeader`],
//! performs one blocking send-receive on its request socket, and
//! translates the reply envelope back into a typed value or a
//! [`Fault`]. A non-success envelope whose `response_type` names a
//! registered error type is reconstructed as `Fault::Typed` with the
//! decoded payload; anything else becomes `Fault::Generic`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{BusError, Fault, ProtocolError};
use crate::frame::FrameBuffer;
use crate::messages::{is_success, CommandHeader, CommandResponse};
use crate::registry::{AnyPayload, MessageRegistry, Payload};
use crate::transport::RequestSocket;

type FaultFactory =
    Box<dyn Fn(u32, String, Box<dyn AnyPayload>) -> BusError + Send + Sync + 'static>;

/// Blocking command client over a request socket.
///
/// Not internally synchronized: concurrent sends require external
/// locking or one client per thread (see [`crate::bus::CommandBus`]).
pub struct RequestClient {
    socket: Box<dyn RequestSocket>,
    registry: Arc<MessageRegistry>,
    fault_factories: HashMap<u32, FaultFactory>,
    out_frame: FrameBuffer,
    in_frame: FrameBuffer,
    connected: bool,
}

impl RequestClient {
    pub fn new(socket: Box<dyn RequestSocket>, registry: Arc<MessageRegistry>) -> Self {
        let out_frame = FrameBuffer::new(Arc::clone(&registry));
        let in_frame = FrameBuffer::new(Arc::clone(&registry));
        Self {
            socket,
            registry,
            fault_factories: HashMap::new(),
            out_frame,
            in_frame,
            connected: false,
        }
    }

    pub fn with_frame_capacity(
        socket: Box<dyn RequestSocket>,
        registry: Arc<MessageRegistry>,
        capacity: usize,
    ) -> Self {
        let out_frame = FrameBuffer::with_capacity(Arc::clone(&registry), capacity);
        let in_frame = FrameBuffer::with_capacity(Arc::clone(&registry), capacity);
        Self {
            socket,
            registry,
            fault_factories: HashMap::new(),
            out_frame,
            in_frame,
            connected: false,
        }
    }

    /// Register a command type this client may send.
    pub fn register_command<Req: Payload>(&self, id: u32) -> crate::Result<()> {
        self.registry.register::<Req>(id)?;
        Ok(())
    }

    /// Register a response type this client may receive.
    pub fn register_response<Rsp: Payload>(&self, id: u32) -> crate::Result<()> {
        self.registry.register::<Rsp>(id)?;
        Ok(())
    }

    /// Register a command/response pair in one call.
    pub fn register_command_response<Req: Payload, Rsp: Payload>(
        &self,
        req_id: u32,
        rsp_id: u32,
    ) -> crate::Result<()> {
        self.registry.register::<Req>(req_id)?;
        self.registry.register::<Rsp>(rsp_id)?;
        Ok(())
    }

    /// Register an error type, enabling typed-fault reconstruction for
    /// non-success replies carrying `id` as their `response_type`.
    pub fn register_error<E: Payload>(&mut self, id: u32) -> crate::Result<()> {
        self.registry.register::<E>(id)?;
        self.fault_factories.insert(
            id,
            Box::new(move |code, message, payload| {
                if payload.as_any().is::<E>() {
                    BusError::Fault(Fault::Typed {
                        code,
                        message,
                        type_id: id,
                        payload,
                    })
                } else {
                    ProtocolError::TypeMismatch {
                        expected: std::any::type_name::<E>(),
                        actual: payload.type_name(),
                    }
                    .into()
                }
            }),
        );
        Ok(())
    }

    /// Connect the underlying socket. Called implicitly on first send.
    pub fn start(&mut self) -> crate::Result<()> {
        if !self.connected {
            self.socket.start()?;
            self.connected = true;
        }
        Ok(())
    }

    /// Send a command expecting an empty success envelope.
    pub fn send<Req: Payload>(&mut self, recipient: &str, command: &Req) -> crate::Result<()> {
        let (response, payload) = self.round_trip(recipient, command)?;
        let payload = self.into_success(&response, payload)?;
        match payload {
            None => Ok(()),
            Some(payload) => Err(ProtocolError::TypeMismatch {
                expected: "no payload",
                actual: payload.type_name(),
            }
            .into()),
        }
    }

    /// Send a command expecting a typed response payload. An empty 2xx
    /// envelope yields `Rsp::default()`.
    pub fn call<Req: Payload, Rsp: Payload>(
        &mut self,
        recipient: &str,
        command: &Req,
    ) -> crate::Result<Rsp> {
        let (response, payload) = self.round_trip(recipient, command)?;
        let payload = self.into_success(&response, payload)?;
        match payload {
            None => Ok(Rsp::default()),
            Some(payload) => {
                let name = payload.type_name();
                payload
                    .into_any()
                    .downcast::<Rsp>()
                    .map(|boxed| *boxed)
                    .map_err(|_| {
                        ProtocolError::TypeMismatch {
                            expected: std::any::type_name::<Rsp>(),
                            actual: name,
                        }
                        .into()
                    })
            }
        }
    }

    fn round_trip(
        &mut self,
        recipient: &str,
        command: &dyn AnyPayload,
    ) -> crate::Result<(CommandResponse, Option<Box<dyn AnyPayload>>)> {
        self.start()?;

        let command_type = self.registry.id_of_value(command)?;
        let header = CommandHeader {
            command_type,
            recipient: recipient.to_owned(),
        };
        self.out_frame.write(&header, Some(command))?;
        trace!(
            command_type,
            recipient,
            bytes = self.out_frame.written(),
            "sending command"
        );

        let reply = self.socket.send(self.out_frame.as_slice())?;
        self.in_frame.fill_from(&reply)?;
        let parsed = self.in_frame.read::<CommandResponse>(|h| h.response_type)?;
        Ok(parsed)
    }

    /// Translate a reply envelope: pass the payload through on success,
    /// reconstruct the fault otherwise.
    fn into_success(
        &self,
        response: &CommandResponse,
        payload: Option<Box<dyn AnyPayload>>,
    ) -> crate::Result<Option<Box<dyn AnyPayload>>> {
        if is_success(response.status_code) {
            return Ok(payload);
        }

        debug!(
            status = response.status_code,
            response_type = response.response_type,
            "command failed: {}",
            response.error_message
        );
        if let Some(payload) = payload {
            if let Some(factory) = self.fault_factories.get(&response.response_type) {
                return Err(factory(
                    response.status_code,
                    response.error_message.clone(),
                    payload,
                ));
            }
        }
        Err(Fault::Generic {
            code: response.status_code,
            message: response.error_message.clone(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::CreateStream;
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

    /// Test double returning a canned reply frame per request.
    struct ScriptedSocket {
        reply: Arc<Mutex<Vec<u8>>>,
        requests: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl RequestSocket for ScriptedSocket {
        fn start(&mut self) -> crate::Result<()> {
            Ok(())
        }

        fn send(&mut self, request: &[u8]) -> crate::Result<Vec<u8>> {
            self.requests.lock().push(request.to_vec());
            Ok(self.reply.lock().clone())
        }
    }

    struct Fixture {
        client: RequestClient,
        registry: Arc<MessageRegistry>,
        reply: Arc<Mutex<Vec<u8>>>,
        requests: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(MessageRegistry::new());
        let reply: Arc<Mutex<Vec<u8>>> = Arc::default();
        let requests: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
        let socket = ScriptedSocket {
            reply: Arc::clone(&reply),
            requests: Arc::clone(&requests),
        };
        let client = RequestClient::new(Box::new(socket), Arc::clone(&registry));
        Fixture {
            client,
            registry,
            reply,
            requests,
        }
    }

    fn frame(registry: &Arc<MessageRegistry>, rsp: CommandResponse, payload: Option<&dyn AnyPayload>) -> Vec<u8> {
        let mut frame = FrameBuffer::new(Arc::clone(registry));
        frame.write(&rsp, payload).unwrap();
        frame.as_slice().to_vec()
    }

    #[test]
    fn void_send_succeeds_on_empty_200() {
        let mut fx = fixture();
        fx.client.register_command::<Ping>(1).unwrap();
        *fx.reply.lock() = frame(&fx.registry, CommandResponse::ok(), None);

        fx.client
            .send("svc", &Ping { text: "hi".into() })
            .unwrap();

        // the request carried a CommandHeader naming the command type
        let requests = fx.requests.lock();
        let mut parse = FrameBuffer::new(Arc::clone(&fx.registry));
        parse.fill_from(&requests[0]).unwrap();
        let (header, payload) = parse.read::<CommandHeader>(|h| h.command_type).unwrap();
        assert_eq!(header.command_type, 1);
        assert_eq!(header.recipient, "svc");
        let payload = payload.unwrap();
        assert_eq!(
            payload.as_any().downcast_ref::<Ping>().unwrap().text,
            "hi"
        );
    }

    #[test]
    fn void_send_rejects_unexpected_payload() {
        let mut fx = fixture();
        fx.client.register_command::<Ping>(1).unwrap();
        fx.client.register_response::<Pong>(2).unwrap();
        let pong = Pong { text: "p".into() };
        *fx.reply.lock() = frame(&fx.registry, CommandResponse::ok_with(2), Some(&pong));

        let err = fx
            .client
            .send("svc", &Ping { text: "hi".into() })
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::Protocol(ProtocolError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn call_returns_typed_response() {
        let mut fx = fixture();
        fx.client.register_command_response::<Ping, Pong>(1, 2).unwrap();
        let pong = Pong { text: "back".into() };
        *fx.reply.lock() = frame(&fx.registry, CommandResponse::ok_with(2), Some(&pong));

        let got: Pong = fx.client.call("svc", &Ping { text: "hi".into() }).unwrap();
        assert_eq!(got, pong);
    }

    #[test]
    fn call_with_empty_success_returns_default() {
        let mut fx = fixture();
        fx.client.register_command_response::<Ping, Pong>(1, 2).unwrap();
        *fx.reply.lock() = frame(&fx.registry, CommandResponse::ok(), None);

        let got: Pong = fx.client.call("svc", &Ping { text: "hi".into() }).unwrap();
        assert_eq!(got, Pong::default());
    }

    #[test]
    fn generic_fault_is_raised() {
        let mut fx = fixture();
        fx.client.register_command::<Ping>(1).unwrap();
        *fx.reply.lock() = frame(
            &fx.registry,
            CommandResponse::failed(503, "overloaded", 0),
            None,
        );

        let err = fx
            .client
            .send("svc", &Ping { text: "hi".into() })
            .unwrap_err();
        match err {
            BusError::Fault(fault) => {
                assert_eq!(fault.code(), 503);
                assert_eq!(fault.message(), "overloaded");
                assert_eq!(fault.type_id(), None);
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn typed_fault_is_reconstructed() {
        let mut fx = fixture();
        fx.client.register_command::<Ping>(1).unwrap();
        fx.client.register_error::<Trouble>(999).unwrap();
        let trouble = Trouble {
            detail: "x".into(),
        };
        *fx.reply.lock() = frame(
            &fx.registry,
            CommandResponse::failed(400, "Test error", 999),
            Some(&trouble),
        );

        let err = fx
            .client
            .send("svc", &Ping { text: "hi".into() })
            .unwrap_err();
        match err {
            BusError::Fault(fault) => {
                assert_eq!(fault.code(), 400);
                assert_eq!(fault.message(), "Test error");
                assert_eq!(fault.type_id(), Some(999));
                assert_eq!(fault.details::<Trouble>().unwrap(), &trouble);
            }
            other => panic!("expected typed fault, got {other:?}"),
        }
    }

    #[test]
    fn unregistered_fault_payload_degrades_to_generic() {
        let mut fx = fixture();
        fx.client.register_command::<Ping>(1).unwrap();
        // payload type registered for decoding but no error factory
        fx.client.register_response::<CreateStream>(50).unwrap();
        let payload = CreateStream { name: "s".into() };
        *fx.reply.lock() = frame(
            &fx.registry,
            CommandResponse::failed(500, "boom", 50),
            Some(&payload),
        );

        let err = fx
            .client
            .send("svc", &Ping { text: "hi".into() })
            .unwrap_err();
        match err {
            BusError::Fault(fault) => {
                assert_eq!(fault.code(), 500);
                assert_eq!(fault.type_id(), None);
            }
            other => panic!("expected generic fault, got {other:?}"),
        }
    }

    #[test]
    fn unregistered_command_type_fails_before_sending() {
        let mut fx = fixture();
        let err = fx
            .client
            .send("svc", &Ping { text: "hi".into() })
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::Protocol(ProtocolError::UnknownType(_))
        ));
        assert!(fx.requests.lock().is_empty());
    }
}
