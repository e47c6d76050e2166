//! Top-level facades wiring a server or client onto a socket factory.
//!
//! [`BusServer`] owns the command channel's request server and the
//! event store, which share one message registry, and pre-registers the
//! built-in `CreateStream` handler. [`BusClient`] owns the command bus
//! and the subscription manager, and pre-registers `CreateStream` on
//! the command channel.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::client::RequestClient;
use crate::config::BusConfig;
use crate::error::BusError;
use crate::messages::{CreateStream, COMMAND_ENDPOINT, CREATE_STREAM};
use crate::registry::{MessageRegistry, Payload};
use crate::server::RequestServer;
use crate::store::EventStore;
use crate::subscription::SubscriptionManager;
use crate::transport::SocketFactory;

/// A typed command handler. The recipient string from the
/// `CommandHeader` is passed through unchanged.
pub trait CommandHandler<C>: Send + Sync {
    fn handle(&self, recipient: &str, command: &C) -> crate::Result<()>;
}

/// Client-side command channel: a [`RequestClient`] behind a mutex so
/// the bus, the subscription manager and user code can share it.
pub struct CommandBus {
    client: Mutex<RequestClient>,
}

impl CommandBus {
    pub fn new(client: RequestClient) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }

    /// Connect the underlying socket. Optional: the first send connects
    /// implicitly.
    pub fn start(&self) -> crate::Result<()> {
        self.client.lock().start()
    }

    /// Send a command expecting an empty success reply.
    pub fn send<C: Payload>(&self, recipient: &str, command: &C) -> crate::Result<()> {
        self.client.lock().send(recipient, command)
    }

    /// Send a command expecting a typed response.
    pub fn call<C: Payload, R: Payload>(&self, recipient: &str, command: &C) -> crate::Result<R> {
        self.client.lock().call(recipient, command)
    }

    pub fn register_command<C: Payload>(&self, id: u32) -> crate::Result<()> {
        self.client.lock().register_command::<C>(id)
    }

    pub fn register_response<R: Payload>(&self, id: u32) -> crate::Result<()> {
        self.client.lock().register_response::<R>(id)
    }

    pub fn register_command_response<C: Payload, R: Payload>(
        &self,
        cmd_id: u32,
        rsp_id: u32,
    ) -> crate::Result<()> {
        self.client.lock().register_command_response::<C, R>(cmd_id, rsp_id)
    }

    pub fn register_error<E: Payload>(&self, id: u32) -> crate::Result<()> {
        self.client.lock().register_error::<E>(id)
    }
}

/// Server facade: command channel plus event store.
pub struct BusServer {
    registry: Arc<MessageRegistry>,
    server: RequestServer,
    store: Arc<EventStore>,
    started: bool,
}

impl BusServer {
    pub fn new(factory: Arc<dyn SocketFactory>) -> crate::Result<Self> {
        Self::with_config(factory, &BusConfig::default())
    }

    pub fn with_config(factory: Arc<dyn SocketFactory>, config: &BusConfig) -> crate::Result<Self> {
        let registry = Arc::new(MessageRegistry::new());
        let socket = factory.reply_socket(COMMAND_ENDPOINT)?;
        let mut server = RequestServer::with_frame_capacity(
            socket,
            Arc::clone(&registry),
            config.frame_capacity,
        );
        let store = Arc::new(EventStore::new(
            Arc::clone(&factory),
            Arc::clone(&registry),
        ));

        let streams = Arc::clone(&store);
        server.register_handler_void::<CreateStream>(CREATE_STREAM, move |_header, command| {
            streams.ensure_stream(&command.name)
        })?;

        Ok(Self {
            registry,
            server,
            store,
            started: false,
        })
    }

    /// Bind a typed command handler object to a command id.
    pub fn add_command_handler<C: Payload>(
        &mut self,
        id: u32,
        handler: Arc<dyn CommandHandler<C>>,
    ) -> crate::Result<()> {
        if self.started {
            return Err(BusError::Configuration(
                "cannot register handlers after start".into(),
            ));
        }
        self.server
            .register_handler_void::<C>(id, move |header, command| {
                handler.handle(&header.recipient, command)
            })
    }

    /// Register an error type command handlers may raise as a typed
    /// fault.
    pub fn register_error<E: Payload>(&mut self, id: u32) -> crate::Result<()> {
        self.server.register_error::<E>(id)
    }

    /// Direct access to the request server for responding handlers.
    pub fn server_mut(&mut self) -> &mut RequestServer {
        &mut self.server
    }

    pub fn event_store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    pub fn start(&mut self) -> crate::Result<()> {
        if self.started {
            return Ok(());
        }
        self.server.start()?;
        self.started = true;
        info!("bus server started");
        Ok(())
    }

    pub fn stop(&mut self) -> crate::Result<()> {
        if !self.started {
            return Ok(());
        }
        self.server.stop()?;
        self.started = false;
        info!("bus server stopped");
        Ok(())
    }
}

/// Client facade: command bus plus subscription manager.
///
/// The command channel and the subscription side keep separate
/// registries: message ids are scoped per endpoint, so a command and an
/// event may share an id.
pub struct BusClient {
    registry: Arc<MessageRegistry>,
    event_registry: Arc<MessageRegistry>,
    commands: Arc<CommandBus>,
    subscriptions: SubscriptionManager,
    started: bool,
}

impl BusClient {
    pub fn new(factory: Arc<dyn SocketFactory>) -> crate::Result<Self> {
        Self::with_config(factory, &BusConfig::default())
    }

    pub fn with_config(factory: Arc<dyn SocketFactory>, config: &BusConfig) -> crate::Result<Self> {
        let registry = Arc::new(MessageRegistry::new());
        let event_registry = Arc::new(MessageRegistry::new());
        let socket = factory.request_socket(COMMAND_ENDPOINT)?;
        let client = RequestClient::with_frame_capacity(
            socket,
            Arc::clone(&registry),
            config.frame_capacity,
        );
        let commands = Arc::new(CommandBus::new(client));
        commands.register_command::<CreateStream>(CREATE_STREAM)?;

        let subscriptions = SubscriptionManager::new(
            Arc::clone(&factory),
            Arc::clone(&event_registry),
            Arc::clone(&commands),
        );

        Ok(Self {
            registry,
            event_registry,
            commands,
            subscriptions,
            started: false,
        })
    }

    /// Register an event type this client may receive on a stream.
    pub fn register_event<E: Payload>(&self, id: u32) -> crate::Result<()> {
        self.event_registry.register::<E>(id)?;
        Ok(())
    }

    pub fn start(&mut self) -> crate::Result<()> {
        if self.started {
            return Ok(());
        }
        self.commands.start()?;
        self.started = true;
        info!("bus client started");
        Ok(())
    }

    pub fn stop(&mut self) -> crate::Result<()> {
        self.started = false;
        Ok(())
    }

    pub fn command_bus(&self) -> &Arc<CommandBus> {
        &self.commands
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Registry backing the command channel.
    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    /// Registry backing stream subscriptions.
    pub fn event_registry(&self) -> &Arc<MessageRegistry> {
        &self.event_registry
    }
}
