//! Transport layer: socket role traits, endpoint configuration and the
//! socket factory contract.
//!
//! The core is written against the four role traits below; the `zmq`
//! submodule provides the ZeroMQ implementations. Endpoints support
//! `inproc://`, `ipc://` and `tcp://` schemes; a factory is configured
//! with a *root URL* and appends one path segment per logical endpoint
//! name (the command channel is `"commands"`, each stream uses its own
//! name).

pub mod mock;
pub mod zmq;

use std::path::PathBuf;

pub use self::mock::MockSocketFactory;
pub use self::zmq::{
    ZmqPublishSocket, ZmqReplySocket, ZmqRequestSocket, ZmqSocketFactory, ZmqSubscribeSocket,
};

/// Callback invoked with each inbound frame on a subscriber's receive
/// thread.
pub type FrameCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// Handler invoked with each inbound request on a reply socket's receive
/// thread; the returned bytes are sent back as the reply.
pub type ReplyHandler = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send + 'static>;

/// One-way outbound socket for event fanout. `start` binds and is
/// idempotent.
pub trait PublishSocket: Send {
    fn start(&mut self) -> crate::Result<()>;
    fn send(&mut self, frame: &[u8]) -> crate::Result<()>;
}

/// Inbound event socket. `start` connects and spawns the receive loop,
/// which invokes the callback once per frame on a background thread
/// until `stop`.
pub trait SubscribeSocket: Send {
    fn start(&mut self, on_frame: FrameCallback) -> crate::Result<()>;
    fn stop(&mut self) -> crate::Result<()>;
}

/// Synchronous request socket: one blocking send-receive per call.
pub trait RequestSocket: Send {
    fn start(&mut self) -> crate::Result<()>;
    fn send(&mut self, request: &[u8]) -> crate::Result<Vec<u8>>;
}

/// Reply socket owning a background receive loop. Lifecycle:
/// `initialize` installs the handler, `start` binds and spawns the
/// loop, `stop` signals it and joins. `start` before `initialize` is
/// rejected.
pub trait ReplySocket: Send {
    fn initialize(&mut self, handler: ReplyHandler) -> crate::Result<()>;
    fn start(&mut self) -> crate::Result<()>;
    fn stop(&mut self) -> crate::Result<()>;
}

/// Creates sockets for logical endpoint names under a configured root.
pub trait SocketFactory: Send + Sync {
    fn publish_socket(&self, endpoint: &str) -> crate::Result<Box<dyn PublishSocket>>;
    fn subscribe_socket(&self, endpoint: &str) -> crate::Result<Box<dyn SubscribeSocket>>;
    fn request_socket(&self, endpoint: &str) -> crate::Result<Box<dyn RequestSocket>>;
    fn reply_socket(&self, endpoint: &str) -> crate::Result<Box<dyn ReplySocket>>;
}

/// Endpoint address for the supported schemes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// In-process endpoint (`inproc://name`); requires a shared context.
    Inproc { name: String },
    /// TCP endpoint (`tcp://host:port`).
    Tcp { addr: String },
    /// Unix domain socket endpoint (`ipc:///path`).
    Ipc { path: PathBuf },
}

impl Endpoint {
    /// Parse an endpoint URL. A bare path with no scheme is taken as an
    /// IPC path.
    pub fn from_url(url: &str) -> Self {
        if let Some(name) = url.strip_prefix("inproc://") {
            Endpoint::Inproc {
                name: name.to_owned(),
            }
        } else if let Some(addr) = url.strip_prefix("tcp://") {
            Endpoint::Tcp {
                addr: addr.to_owned(),
            }
        } else if let Some(path) = url.strip_prefix("ipc://") {
            Endpoint::Ipc {
                path: PathBuf::from(path),
            }
        } else {
            Endpoint::Ipc {
                path: PathBuf::from(url),
            }
        }
    }

    /// The full endpoint URL.
    pub fn url(&self) -> String {
        match self {
            Endpoint::Inproc { name } => format!("inproc://{name}"),
            Endpoint::Tcp { addr } => format!("tcp://{addr}"),
            Endpoint::Ipc { path } => format!("ipc://{}", path.display()),
        }
    }

    /// Create the parent directory of an IPC path. No-op for other
    /// schemes.
    pub fn ensure_parent_dir(&self) -> std::io::Result<()> {
        if let Endpoint::Ipc { path } = self {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// Socket tuning knobs shared by every socket a factory creates.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Receive-poll timeout for background loops, in milliseconds. Loops
    /// re-check their running flag at this cadence.
    pub recv_timeout_ms: i32,
    /// Reply timeout for the blocking request socket, in milliseconds.
    pub request_timeout_ms: i32,
    /// Send timeout for the blocking request socket, in milliseconds.
    pub send_timeout_ms: i32,
    /// Outbound high-water mark for publish sockets.
    pub send_hwm: i32,
    /// Initial reconnect interval, in milliseconds.
    pub reconnect_ivl_ms: i32,
    /// Reconnect interval cap, in milliseconds.
    pub reconnect_ivl_max_ms: i32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            recv_timeout_ms: 100,
            request_timeout_ms: 30_000,
            send_timeout_ms: 5_000,
            send_hwm: 1000,
            reconnect_ivl_ms: 100,
            reconnect_ivl_max_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inproc() {
        let ep = Endpoint::from_url("inproc://bus/commands");
        assert_eq!(
            ep,
            Endpoint::Inproc {
                name: "bus/commands".into()
            }
        );
        assert_eq!(ep.url(), "inproc://bus/commands");
    }

    #[test]
    fn parses_tcp() {
        let ep = Endpoint::from_url("tcp://127.0.0.1:5560");
        assert_eq!(ep.url(), "tcp://127.0.0.1:5560");
    }

    #[test]
    fn parses_ipc_and_bare_paths() {
        let ep = Endpoint::from_url("ipc:///tmp/bus/commands");
        assert_eq!(ep.url(), "ipc:///tmp/bus/commands");
        let bare = Endpoint::from_url("/tmp/bus/commands");
        assert_eq!(bare, ep);
    }
}
