//! Connection state machine. Runs as a single task that owns the live
//! session, the retry timer and the in-flight connect attempt; callers talk
//! to it through [`Command`]s.

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use courier_proto::Frame;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout, Sleep};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{PushError, PushResult};
use crate::registry::Registry;
use crate::session::{SessionEnded, TransportSession};
use crate::transport::Connector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the retry interval before the next attempt.
    Reconnecting,
    /// Retry budget spent. Only an explicit connect leaves this state.
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

/// Lifecycle notifications published alongside the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { transport: &'static str },
    Disconnected { reason: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Terminal: emitted once per exhausted retry budget.
    ReconnectFailed { retries: u32 },
}

pub(crate) enum Command {
    Start {
        reply: oneshot::Sender<PushResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        frame: Frame,
    },
}

struct AttemptOutcome {
    generation: u64,
    result: PushResult<TransportSession>,
}

pub(crate) struct SessionManager {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    ended_tx: mpsc::UnboundedSender<SessionEnded>,
    ended_rx: mpsc::UnboundedReceiver<SessionEnded>,
    /// Bumped on every attempt and every stop; results tagged with an older
    /// value are discarded.
    generation: u64,
    retries: u32,
    session: Option<TransportSession>,
    attempt: Option<JoinHandle<AttemptOutcome>>,
    retry_at: Option<Pin<Box<Sleep>>>,
    waiters: Vec<oneshot::Sender<PushResult<()>>>,
}

impl SessionManager {
    pub fn new(
        config: Arc<ClientConfig>,
        connector: Arc<dyn Connector>,
        registry: Arc<Registry>,
        state: watch::Sender<ConnectionState>,
        events: broadcast::Sender<SessionEvent>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        Self {
            config,
            connector,
            dispatcher: Dispatcher::new(registry.clone()),
            registry,
            state,
            events,
            commands,
            ended_tx,
            ended_rx,
            generation: 0,
            retries: 0,
            session: None,
            attempt: None,
            retry_at: None,
            waiters: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        self.stop();
                        break;
                    }
                },
                joined = join_attempt(&mut self.attempt) => {
                    self.attempt = None;
                    self.finish_attempt(joined);
                }
                _ = expire(&mut self.retry_at) => {
                    self.retry_at = None;
                    self.begin_attempt();
                }
                Some(ended) = self.ended_rx.recv() => self.session_ended(ended),
            }
        }
        debug!(target: "courier.session", "session manager stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start { reply } => self.start(reply),
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Subscribe { topic } => self.subscribe(&topic),
            Command::Unsubscribe { topic } => self.unsubscribe(&topic),
            Command::Publish { frame } => self.publish(frame),
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(target: "courier.session", state = next.as_str(), "connection state changed");
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn start(&mut self, reply: oneshot::Sender<PushResult<()>>) {
        match self.current() {
            ConnectionState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting => self.waiters.push(reply),
            ConnectionState::Disconnected | ConnectionState::Reconnecting | ConnectionState::Failed => {
                self.retry_at = None;
                self.retries = 0;
                self.waiters.push(reply);
                self.begin_attempt();
            }
        }
    }

    fn stop(&mut self) {
        self.generation += 1;
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        self.retry_at = None;
        self.retries = 0;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(PushError::Cancelled));
        }
        let was_connected = match self.session.take() {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        };
        let previous = self.current();
        self.set_state(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            info!(target: "courier.session", from = previous.as_str(), "push client stopped");
        }
        if was_connected {
            self.emit(SessionEvent::Disconnected {
                reason: "stopped".to_string(),
            });
        }
    }

    fn begin_attempt(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        self.set_state(ConnectionState::Connecting);
        debug!(
            target: "courier.session",
            generation,
            retry = self.retries,
            transport = self.connector.name(),
            "connecting"
        );

        let config = self.config.clone();
        let connector = self.connector.clone();
        let dispatcher = self.dispatcher.clone();
        let ended = self.ended_tx.clone();
        self.attempt = Some(tokio::spawn(async move {
            let limit = config.connect_timeout;
            let attempt = async {
                let link = connector.connect().await?;
                TransportSession::establish(link, &config, dispatcher, generation, ended).await
            };
            let result = match timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => Err(PushError::Timeout(limit)),
            };
            AttemptOutcome { generation, result }
        }));
    }

    fn finish_attempt(&mut self, joined: Result<AttemptOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => return,
            Err(err) => AttemptOutcome {
                generation: self.generation,
                result: Err(PushError::Transport(format!("connect task failed: {err}"))),
            },
        };
        if outcome.generation != self.generation {
            debug!(
                target: "courier.session",
                generation = outcome.generation,
                current = self.generation,
                "discarding stale connect result"
            );
            return;
        }
        match outcome.result {
            Ok(session) => self.connected(session),
            Err(err) => {
                warn!(
                    target: "courier.session",
                    error = %err,
                    retry = self.retries,
                    "connect attempt failed"
                );
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Err(err.clone()));
                }
                self.schedule_retry();
            }
        }
    }

    fn connected(&mut self, session: TransportSession) {
        let transport = session.transport();
        self.retries = 0;
        self.session = Some(session);
        self.set_state(ConnectionState::Connected);
        self.resubscribe_all();
        info!(target: "courier.session", transport, "push client connected");
        self.emit(SessionEvent::Connected { transport });
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Subscribes the fresh session to every topic in the registry snapshot.
    /// Topics registered after the snapshot arrive as their own commands.
    fn resubscribe_all(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let topics = self.registry.topics();
        let mut sent = 0usize;
        for topic in &topics {
            match session.subscribe(topic) {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(target: "courier.session", topic = %topic, error = %err, "resubscribe failed");
                    break;
                }
            }
        }
        debug!(target: "courier.session", topics = topics.len(), sent, "resubscribed");
    }

    fn schedule_retry(&mut self) {
        let policy = &self.config.retry;
        if self.retries < policy.max_retries {
            self.retries += 1;
            let delay = policy.delay_for(self.retries);
            self.set_state(ConnectionState::Reconnecting);
            info!(
                target: "courier.session",
                attempt = self.retries,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            );
            self.emit(SessionEvent::ReconnectScheduled {
                attempt: self.retries,
                delay,
            });
            self.retry_at = Some(Box::pin(sleep(delay)));
        } else {
            let retries = self.retries;
            self.set_state(ConnectionState::Failed);
            warn!(
                target: "courier.session",
                retries,
                "retry budget exhausted; giving up until the next connect"
            );
            self.emit(SessionEvent::ReconnectFailed { retries });
        }
    }

    fn session_ended(&mut self, ended: SessionEnded) {
        if ended.generation != self.generation || self.session.is_none() {
            debug!(
                target: "courier.session",
                generation = ended.generation,
                "ignoring end of a retired session"
            );
            return;
        }
        self.session = None;
        warn!(
            target: "courier.session",
            reason = %ended.reason,
            "push connection lost"
        );
        self.emit(SessionEvent::Disconnected {
            reason: ended.reason,
        });
        self.schedule_retry();
    }

    fn subscribe(&mut self, topic: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !self.registry.contains(topic) {
            return;
        }
        if let Err(err) = session.subscribe(topic) {
            warn!(target: "courier.session", topic, error = %err, "subscribe failed");
        }
    }

    fn unsubscribe(&mut self, topic: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if self.registry.contains(topic) {
            return;
        }
        if let Err(err) = session.unsubscribe(topic) {
            warn!(target: "courier.session", topic, error = %err, "unsubscribe failed");
        }
    }

    fn publish(&mut self, frame: Frame) {
        let destination = frame.destination().unwrap_or("-").to_string();
        match self.session.as_ref() {
            Some(session) => {
                if let Err(err) = session.send(frame) {
                    warn!(target: "courier.session", destination = %destination, error = %err, "publish failed");
                }
            }
            None => warn!(
                target: "courier.session",
                destination = %destination,
                "not connected; dropping outbound message"
            ),
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
    }
}

async fn join_attempt(
    attempt: &mut Option<JoinHandle<AttemptOutcome>>,
) -> Result<AttemptOutcome, JoinError> {
    match attempt {
        Some(handle) => handle.await,
        None => pending().await,
    }
}

async fn expire(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(deadline) => deadline.as_mut().await,
        None => pending().await,
    }
}
