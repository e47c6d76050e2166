//! ZeroMQ implementations of the socket roles.
//!
//! One shared `zmq::Context` per factory so `inproc://` endpoints
//! resolve across sockets. Publish and reply sockets bind; subscribe and
//! request sockets connect. Subscribe and reply sockets own one
//! background receive thread each, created together with the socket so
//! the socket never crosses threads; the loop polls with a bounded
//! receive timeout and re-checks its running flag on every pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace, warn};

use super::{
    Endpoint, FrameCallback, PublishSocket, ReplyHandler, ReplySocket, RequestSocket,
    SocketFactory, SocketOptions, SubscribeSocket,
};
use crate::config::BusConfig;
use crate::error::BusError;

/// PUB socket bound to one endpoint. Binding happens at `start`, which
/// is idempotent.
pub struct ZmqPublishSocket {
    context: Arc<zmq::Context>,
    endpoint: Endpoint,
    options: SocketOptions,
    socket: Option<zmq::Socket>,
}

impl ZmqPublishSocket {
    fn new(context: Arc<zmq::Context>, endpoint: Endpoint, options: SocketOptions) -> Self {
        Self {
            context,
            endpoint,
            options,
            socket: None,
        }
    }
}

impl PublishSocket for ZmqPublishSocket {
    fn start(&mut self) -> crate::Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        self.endpoint.ensure_parent_dir()?;
        let socket = self.context.socket(zmq::PUB)?;
        socket.set_sndhwm(self.options.send_hwm)?;
        socket.set_linger(0)?;
        socket.bind(&self.endpoint.url())?;
        debug!(endpoint = %self.endpoint.url(), "publish socket bound");
        self.socket = Some(socket);
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> crate::Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| BusError::Configuration("publish socket not started".into()))?;
        socket.send(frame, 0)?;
        trace!(bytes = frame.len(), endpoint = %self.endpoint.url(), "frame published");
        Ok(())
    }
}

/// SUB socket with a dedicated receive thread.
///
/// The socket is created on the thread that uses it; `start` blocks
/// until the thread reports that the connect succeeded.
pub struct ZmqSubscribeSocket {
    context: Arc<zmq::Context>,
    endpoint: Endpoint,
    options: SocketOptions,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ZmqSubscribeSocket {
    fn new(context: Arc<zmq::Context>, endpoint: Endpoint, options: SocketOptions) -> Self {
        Self {
            context,
            endpoint,
            options,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    fn open(
        context: &zmq::Context,
        url: &str,
        recv_timeout_ms: i32,
    ) -> Result<zmq::Socket, zmq::Error> {
        let socket = context.socket(zmq::SUB)?;
        socket.set_subscribe(b"")?;
        socket.set_rcvtimeo(recv_timeout_ms)?;
        socket.set_linger(0)?;
        socket.connect(url)?;
        Ok(socket)
    }

    fn receive_loop(
        socket: &zmq::Socket,
        running: &AtomicBool,
        on_frame: &mut FrameCallback,
        url: &str,
    ) {
        debug!(endpoint = url, "subscribe loop started");
        while running.load(Ordering::Acquire) {
            match socket.recv_bytes(0) {
                Ok(frame) => on_frame(&frame),
                Err(zmq::Error::EAGAIN) => continue,
                Err(e) => {
                    if running.load(Ordering::Acquire) {
                        error!(endpoint = url, error = %e, "subscribe receive failed, stopping loop");
                    }
                    break;
                }
            }
        }
        debug!(endpoint = url, "subscribe loop stopped");
    }
}

impl SubscribeSocket for ZmqSubscribeSocket {
    fn start(&mut self, mut on_frame: FrameCallback) -> crate::Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let context = Arc::clone(&self.context);
        let url = self.endpoint.url();
        let recv_timeout_ms = self.options.recv_timeout_ms;
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::Release);

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), zmq::Error>>();
        let thread_url = url.clone();
        let handle = thread::Builder::new()
            .name(format!("sub:{url}"))
            .spawn(move || {
                let socket = match Self::open(&context, &thread_url, recv_timeout_ms) {
                    Ok(socket) => {
                        let _ = ready_tx.send(Ok(()));
                        socket
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                Self::receive_loop(&socket, &running, &mut on_frame, &thread_url);
            })?;
        self.thread = Some(handle);

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.running.store(false, Ordering::Release);
                if let Some(handle) = self.thread.take() {
                    let _ = handle.join();
                }
                Err(e.into())
            }
            Err(_) => Err(BusError::Configuration(
                "subscribe thread exited before signaling readiness".into(),
            )),
        }
    }

    fn stop(&mut self) -> crate::Result<()> {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!(endpoint = %self.endpoint.url(), "subscribe thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for ZmqSubscribeSocket {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// REQ socket for blocking request/reply exchanges.
///
/// Configured with `REQ_RELAXED` + `REQ_CORRELATE` and reconnect
/// backoff so a lost reply or a restarted server does not wedge the
/// socket state machine.
pub struct ZmqRequestSocket {
    context: Arc<zmq::Context>,
    endpoint: Endpoint,
    options: SocketOptions,
    socket: Option<zmq::Socket>,
}

impl ZmqRequestSocket {
    fn new(context: Arc<zmq::Context>, endpoint: Endpoint, options: SocketOptions) -> Self {
        Self {
            context,
            endpoint,
            options,
            socket: None,
        }
    }
}

impl RequestSocket for ZmqRequestSocket {
    fn start(&mut self) -> crate::Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = self.context.socket(zmq::REQ)?;
        socket.set_req_relaxed(true)?;
        socket.set_req_correlate(true)?;
        socket.set_reconnect_ivl(self.options.reconnect_ivl_ms)?;
        socket.set_reconnect_ivl_max(self.options.reconnect_ivl_max_ms)?;
        socket.set_rcvtimeo(self.options.request_timeout_ms)?;
        socket.set_sndtimeo(self.options.send_timeout_ms)?;
        socket.set_linger(0)?;
        socket.connect(&self.endpoint.url())?;
        debug!(endpoint = %self.endpoint.url(), "request socket connected");
        self.socket = Some(socket);
        Ok(())
    }

    fn send(&mut self, request: &[u8]) -> crate::Result<Vec<u8>> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| BusError::Configuration("request socket not started".into()))?;
        trace!(bytes = request.len(), endpoint = %self.endpoint.url(), "sending request");
        socket.send(request, 0)?;
        let reply = socket.recv_bytes(0)?;
        trace!(bytes = reply.len(), endpoint = %self.endpoint.url(), "received reply");
        Ok(reply)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyState {
    Created,
    Initialized,
    Running,
    Stopped,
}

/// REP socket owning a background receive loop.
///
/// Lifecycle: `created → initialized → running → stopped`. `start`
/// before `initialize` is rejected; `start` while running is a no-op;
/// a stopped socket cannot be restarted.
pub struct ZmqReplySocket {
    context: Arc<zmq::Context>,
    endpoint: Endpoint,
    options: SocketOptions,
    state: ReplyState,
    handler: Option<ReplyHandler>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ZmqReplySocket {
    fn new(context: Arc<zmq::Context>, endpoint: Endpoint, options: SocketOptions) -> Self {
        Self {
            context,
            endpoint,
            options,
            state: ReplyState::Created,
            handler: None,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    fn open(
        context: &zmq::Context,
        url: &str,
        recv_timeout_ms: i32,
    ) -> Result<zmq::Socket, zmq::Error> {
        let socket = context.socket(zmq::REP)?;
        socket.set_rcvtimeo(recv_timeout_ms)?;
        socket.set_linger(0)?;
        socket.bind(url)?;
        Ok(socket)
    }

    fn serve_loop(
        socket: &zmq::Socket,
        running: &AtomicBool,
        handler: &mut ReplyHandler,
        url: &str,
    ) {
        debug!(endpoint = url, "reply loop started");
        while running.load(Ordering::Acquire) {
            match socket.recv_bytes(0) {
                Ok(request) => {
                    let response = handler(&request);
                    if let Err(e) = socket.send(&response, 0) {
                        error!(endpoint = url, error = %e, "failed to send reply, stopping loop");
                        break;
                    }
                }
                Err(zmq::Error::EAGAIN) => continue,
                Err(e) => {
                    if running.load(Ordering::Acquire) {
                        error!(endpoint = url, error = %e, "reply receive failed, stopping loop");
                    }
                    break;
                }
            }
        }
        debug!(endpoint = url, "reply loop stopped");
    }
}

impl ReplySocket for ZmqReplySocket {
    fn initialize(&mut self, handler: ReplyHandler) -> crate::Result<()> {
        if self.state != ReplyState::Created {
            return Err(BusError::Configuration(format!(
                "reply socket cannot be initialized in state {:?}",
                self.state
            )));
        }
        self.handler = Some(handler);
        self.state = ReplyState::Initialized;
        Ok(())
    }

    fn start(&mut self) -> crate::Result<()> {
        match self.state {
            ReplyState::Created => Err(BusError::Configuration(
                "reply socket must be initialized before start".into(),
            )),
            ReplyState::Running => Ok(()),
            ReplyState::Stopped => Err(BusError::Configuration(
                "reply socket already stopped".into(),
            )),
            ReplyState::Initialized => {
                self.endpoint.ensure_parent_dir()?;
                let mut handler = self
                    .handler
                    .take()
                    .ok_or_else(|| BusError::Configuration("reply handler missing".into()))?;
                let context = Arc::clone(&self.context);
                let url = self.endpoint.url();
                let recv_timeout_ms = self.options.recv_timeout_ms;
                let running = Arc::clone(&self.running);
                running.store(true, Ordering::Release);

                let (ready_tx, ready_rx) = mpsc::channel::<Result<(), zmq::Error>>();
                let thread_url = url.clone();
                let handle = thread::Builder::new()
                    .name(format!("rep:{url}"))
                    .spawn(move || {
                        let socket = match Self::open(&context, &thread_url, recv_timeout_ms) {
                            Ok(socket) => {
                                let _ = ready_tx.send(Ok(()));
                                socket
                            }
                            Err(e) => {
                                let _ = ready_tx.send(Err(e));
                                return;
                            }
                        };
                        Self::serve_loop(&socket, &running, &mut handler, &thread_url);
                    })?;
                self.thread = Some(handle);

                match ready_rx.recv() {
                    Ok(Ok(())) => {
                        self.state = ReplyState::Running;
                        Ok(())
                    }
                    Ok(Err(e)) => {
                        self.running.store(false, Ordering::Release);
                        if let Some(handle) = self.thread.take() {
                            let _ = handle.join();
                        }
                        self.state = ReplyState::Stopped;
                        Err(e.into())
                    }
                    Err(_) => Err(BusError::Configuration(
                        "reply thread exited before signaling readiness".into(),
                    )),
                }
            }
        }
    }

    fn stop(&mut self) -> crate::Result<()> {
        if self.state != ReplyState::Running {
            return Ok(());
        }
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!(endpoint = %self.endpoint.url(), "reply thread panicked");
            }
        }
        self.state = ReplyState::Stopped;
        Ok(())
    }
}

impl Drop for ZmqReplySocket {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Creates ZMQ sockets for logical endpoint names under a root URL.
///
/// The endpoint URL of name `n` is `"{root}/{n}"`. An IPC root has its
/// directory created at construction; individual IPC socket paths get
/// their parent directories created before bind.
pub struct ZmqSocketFactory {
    context: Arc<zmq::Context>,
    root: String,
    options: SocketOptions,
}

impl ZmqSocketFactory {
    /// Default root is `ipc:///tmp/streambus`.
    pub fn new(root_url: impl Into<String>) -> crate::Result<Self> {
        Self::with_options(root_url, SocketOptions::default())
    }

    pub fn with_options(root_url: impl Into<String>, options: SocketOptions) -> crate::Result<Self> {
        let root = root_url.into();
        if let Endpoint::Ipc { path } = Endpoint::from_url(&root) {
            std::fs::create_dir_all(&path)?;
        }
        Ok(Self {
            context: Arc::new(zmq::Context::new()),
            root,
            options,
        })
    }

    pub fn from_config(config: &BusConfig) -> crate::Result<Self> {
        Self::with_options(config.root_url.clone(), config.socket_options())
    }

    pub fn root_url(&self) -> &str {
        &self.root
    }

    pub fn context(&self) -> &Arc<zmq::Context> {
        &self.context
    }

    fn endpoint(&self, name: &str) -> Endpoint {
        Endpoint::from_url(&format!("{}/{}", self.root, name))
    }
}

impl SocketFactory for ZmqSocketFactory {
    fn publish_socket(&self, endpoint: &str) -> crate::Result<Box<dyn PublishSocket>> {
        Ok(Box::new(ZmqPublishSocket::new(
            Arc::clone(&self.context),
            self.endpoint(endpoint),
            self.options.clone(),
        )))
    }

    fn subscribe_socket(&self, endpoint: &str) -> crate::Result<Box<dyn SubscribeSocket>> {
        Ok(Box::new(ZmqSubscribeSocket::new(
            Arc::clone(&self.context),
            self.endpoint(endpoint),
            self.options.clone(),
        )))
    }

    fn request_socket(&self, endpoint: &str) -> crate::Result<Box<dyn RequestSocket>> {
        Ok(Box::new(ZmqRequestSocket::new(
            Arc::clone(&self.context),
            self.endpoint(endpoint),
            self.options.clone(),
        )))
    }

    fn reply_socket(&self, endpoint: &str) -> crate::Result<Box<dyn ReplySocket>> {
        Ok(Box::new(ZmqReplySocket::new(
            Arc::clone(&self.context),
            self.endpoint(endpoint),
            self.options.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn factory() -> (tempfile::TempDir, ZmqSocketFactory) {
        let dir = tempfile::tempdir().unwrap();
        let root = format!("ipc://{}", dir.path().join("bus").display());
        let factory = ZmqSocketFactory::new(root).unwrap();
        (dir, factory)
    }

    #[test]
    fn request_reply_round_trip() {
        let (_dir, factory) = factory();

        let mut server = factory.reply_socket("echo").unwrap();
        server
            .initialize(Box::new(|request: &[u8]| {
                let mut reply = b"re:".to_vec();
                reply.extend_from_slice(request);
                reply
            }))
            .unwrap();
        server.start().unwrap();

        let mut client = factory.request_socket("echo").unwrap();
        client.start().unwrap();
        let reply = client.send(b"hello").unwrap();
        assert_eq!(reply, b"re:hello");

        server.stop().unwrap();
    }

    #[test]
    fn reply_socket_requires_initialization() {
        let (_dir, factory) = factory();
        let mut server = factory.reply_socket("strict").unwrap();
        let err = server.start().unwrap_err();
        assert!(matches!(err, BusError::Configuration(_)));
    }

    #[test]
    fn reply_socket_cannot_restart_after_stop() {
        let (_dir, factory) = factory();
        let mut server = factory.reply_socket("once").unwrap();
        server.initialize(Box::new(|_| Vec::new())).unwrap();
        server.start().unwrap();
        server.stop().unwrap();
        assert!(matches!(
            server.start(),
            Err(BusError::Configuration(_))
        ));
    }

    #[test]
    fn publish_subscribe_delivers_frames() {
        let (_dir, factory) = factory();

        let mut publisher = factory.publish_socket("ticks").unwrap();
        publisher.start().unwrap();
        // start is idempotent
        publisher.start().unwrap();

        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
        let sink = Arc::clone(&received);
        let mut subscriber = factory.subscribe_socket("ticks").unwrap();
        subscriber
            .start(Box::new(move |frame| {
                sink.lock().unwrap().push(frame.to_vec());
            }))
            .unwrap();

        // PUB/SUB joins asynchronously; retry until the subscriber sees a frame.
        let mut delivered = false;
        for _ in 0..50 {
            publisher.send(b"tick").unwrap();
            std::thread::sleep(Duration::from_millis(20));
            if !received.lock().unwrap().is_empty() {
                delivered = true;
                break;
            }
        }
        assert!(delivered, "subscriber never received a frame");
        assert_eq!(received.lock().unwrap()[0], b"tick");

        subscriber.stop().unwrap();
    }

    #[test]
    fn publish_before_start_is_rejected() {
        let (_dir, factory) = factory();
        let mut publisher = factory.publish_socket("cold").unwrap();
        assert!(matches!(
            publisher.send(b"x"),
            Err(BusError::Configuration(_))
        ));
    }

    #[test]
    fn duplicate_bind_on_same_endpoint_fails() {
        let (_dir, factory) = factory();
        let mut first = factory.publish_socket("solo").unwrap();
        first.start().unwrap();
        let mut second = factory.publish_socket("solo").unwrap();
        assert!(second.start().is_err());
    }
}
