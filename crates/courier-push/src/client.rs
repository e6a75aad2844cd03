use std::sync::Arc;

use courier_proto::{private_queue, resolve_command, resolve_topic, MessageBody};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::codec::{encode_send, Envelope};
use crate::config::ClientConfig;
use crate::error::{PushError, PushResult};
use crate::manager::{Command, ConnectionState, SessionEvent, SessionManager};
use crate::registry::{Listener, Registry, Removal, SubscriptionHandle};
use crate::transport::{connector_for, Connector};

/// Handle to one push connection and its listener registry.
///
/// Subscriptions live in the registry independently of the connection: they
/// can be added before [`connect`](Self::connect) and survive reconnects.
/// Dropping the client stops the session manager.
pub struct PushClient {
    config: Arc<ClientConfig>,
    registry: Arc<Registry>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl PushClient {
    /// Builds a client for `config.endpoint`. Must be called inside a Tokio
    /// runtime.
    pub fn new(config: ClientConfig) -> PushResult<Self> {
        let connector = connector_for(&config)?;
        Ok(Self::with_connector(config, connector))
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::new());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(
            config.clone(),
            connector,
            registry.clone(),
            state_tx,
            events.clone(),
            command_rx,
        );
        tokio::spawn(manager.run());
        Self {
            config,
            registry,
            commands,
            state: state_rx,
            events,
        }
    }

    /// Resolves with the outcome of the first attempt. On failure the
    /// client keeps retrying in the background per the retry policy.
    pub async fn connect(&self) -> PushResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Start { reply })?;
        rx.await.map_err(|_| PushError::ManagerGone)?
    }

    /// Tears down the connection and cancels pending retries. Listeners
    /// stay registered for the next `connect`.
    pub async fn disconnect(&self) -> PushResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Stop { reply })?;
        rx.await.map_err(|_| PushError::ManagerGone)
    }

    /// `topic` is a bare topic name (`"messages"`) or an absolute
    /// destination.
    pub fn subscribe<F>(&self, topic: &str, listener: F) -> SubscriptionHandle
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscribe_listener(topic, Arc::new(listener))
    }

    pub fn subscribe_listener(&self, topic: &str, listener: Listener) -> SubscriptionHandle {
        let destination = resolve_topic(topic);
        let registration = self.registry.insert(&destination, listener);
        if registration.first_for_topic {
            self.notify(Command::Subscribe { topic: destination });
        }
        registration.handle
    }

    /// Subscribes to the principal's private queue.
    pub fn subscribe_to_user<F>(&self, principal: &str, listener: F) -> SubscriptionHandle
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let destination = private_queue(principal, &self.config.private_queue);
        self.subscribe_listener(&destination, Arc::new(listener))
    }

    /// Returns `false` if the handle was already removed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removal = self.registry.remove(handle);
        self.after_removal(handle.topic(), removal)
    }

    /// Removes `listener` from `topic`, matching by `Arc` identity.
    pub fn unsubscribe_listener(&self, topic: &str, listener: &Listener) -> bool {
        let destination = resolve_topic(topic);
        let removal = self.registry.remove_listener(&destination, listener);
        self.after_removal(&destination, removal)
    }

    fn after_removal(&self, topic: &str, removal: Removal) -> bool {
        match removal {
            Removal::NotFound => false,
            Removal::Remaining => true,
            Removal::LastForTopic => {
                self.notify(Command::Unsubscribe {
                    topic: topic.to_string(),
                });
                true
            }
        }
    }

    pub fn unsubscribe_all(&self) {
        for topic in self.registry.clear() {
            self.notify(Command::Unsubscribe { topic });
        }
    }

    /// Serializes `body` as JSON and sends it to `destination` (bare names
    /// go to `/app/<name>`). While not connected the message is dropped
    /// with a warning and `Ok(())` is returned.
    pub fn send<T>(&self, destination: &str, body: &T) -> PushResult<()>
    where
        T: Serialize + ?Sized,
    {
        let destination = resolve_command(destination);
        if !self.is_connected() {
            warn!(
                target: "courier.session",
                destination = %destination,
                state = self.state().as_str(),
                "not connected; dropping outbound message"
            );
            return Ok(());
        }
        let frame = encode_send(&destination, body)?;
        self.command(Command::Publish { frame })
    }

    /// Sends a `{type, message, data, timestamp}` body.
    pub fn send_message(
        &self,
        destination: &str,
        kind: &str,
        message: &str,
        data: Value,
    ) -> PushResult<()> {
        self.send(destination, &MessageBody::new(kind, message, data))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Registered destinations, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.registry.topics()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn command(&self, command: Command) -> PushResult<()> {
        self.commands
            .send(command)
            .map_err(|_| PushError::ManagerGone)
    }

    fn notify(&self, command: Command) {
        if self.command(command).is_err() {
            debug!(target: "courier.session", "session manager gone; registry updated locally");
        }
    }
}
