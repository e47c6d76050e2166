//! streambus - typed CQRS + event bus over ZeroMQ.
//!
//! This crate layers a typed, message-oriented programming model on top
//! of ZeroMQ's publish/subscribe and request/reply sockets:
//!
//! - clients issue *commands* against named recipients and receive
//!   typed responses or typed faults,
//! - servers register *command handlers*, mutate local state and
//!   *publish events* onto named *streams*,
//! - clients and in-process consumers *subscribe* to streams and
//!   dispatch typed events to handlers.
//!
//! Payloads are `prost` messages registered by a stable numeric id; the
//! wire unit is a length-prefixed frame carrying one header message and
//! at most one payload message.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use streambus::prelude::*;
//!
//! #[derive(Clone, PartialEq, ::prost::Message)]
//! struct SetProperty {
//!     #[prost(string, tag = "1")]
//!     name: String,
//! }
//!
//! let factory = Arc::new(ZmqSocketFactory::new("ipc:///tmp/app")?);
//! let mut server = BusServer::new(factory.clone())?;
//! server.server_mut().register_handler_void::<SetProperty>(1, |header, cmd| {
//!     tracing::info!("{} set {}", header.recipient, cmd.name);
//!     Ok(())
//! })?;
//! server.start()?;
//!
//! let mut client = BusClient::new(factory)?;
//! client.command_bus().register_command::<SetProperty>(1)?;
//! client.start()?;
//! client.command_bus().send("display-1", &SetProperty { name: "bright".into() })?;
//! # Ok::<(), streambus::BusError>(())
//! ```

pub mod bus;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod frame;
pub mod messages;
pub mod publish;
pub mod registry;
pub mod server;
pub mod store;
pub mod subscribe;
pub mod subscription;
pub mod transport;

pub use bus::{BusClient, BusServer, CommandBus, CommandHandler};
pub use client::RequestClient;
pub use config::BusConfig;
pub use error::{BusError, Fault, ProtocolError, Result};
pub use events::{EventDispatcher, EventHandler, EventRouter, Metadata};
pub use frame::{FrameBuffer, DEFAULT_FRAME_CAPACITY};
pub use messages::{
    CommandHeader, CommandResponse, CreateStream, EventHeader, BUILTIN_MESSAGE_BASE,
    BUILTIN_RECIPIENT, COMMAND_ENDPOINT, CREATE_STREAM,
};
pub use publish::PublishHandler;
pub use registry::{AnyPayload, MessageRegistry, Payload};
pub use server::{CommandReply, RequestServer};
pub use store::{EventStore, LocalSubscription};
pub use subscribe::SubscribeHandler;
pub use subscription::{Subscription, SubscriptionManager};
pub use transport::{MockSocketFactory, SocketFactory, SocketOptions, ZmqSocketFactory};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The most commonly used types in one import.
pub mod prelude {
    pub use crate::bus::{BusClient, BusServer, CommandBus, CommandHandler};
    pub use crate::config::BusConfig;
    pub use crate::error::{BusError, Fault, ProtocolError, Result};
    pub use crate::events::{EventDispatcher, EventHandler, EventRouter, Metadata};
    pub use crate::messages::{CreateStream, BUILTIN_RECIPIENT, CREATE_STREAM};
    pub use crate::registry::{MessageRegistry, Payload};
    pub use crate::store::EventStore;
    pub use crate::subscription::Subscription;
    pub use crate::transport::{SocketFactory, ZmqSocketFactory};
}
