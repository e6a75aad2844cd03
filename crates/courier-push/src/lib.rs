//! Courier Push: real-time event client for the messaging dashboard.
//!
//! Responsibilities:
//! - keeping one STOMP session open over WebSocket or SockJS polling
//! - reconnecting with a bounded retry budget and resubscribing afterwards
//! - fanning decoded envelopes out to listeners registered per topic
//! - best-effort publishing of application commands

pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod registry;
pub mod retry;
mod session;
pub mod transport;

pub use client::PushClient;
pub use codec::{decode_message, CodecError, Envelope, EventKind};
pub use config::{ClientConfig, Heartbeat, TransportKind};
pub use dispatcher::Dispatcher;
pub use error::{PushError, PushResult};
pub use manager::{ConnectionState, SessionEvent};
pub use registry::{Listener, ListenerId, Registry, SubscriptionHandle};
pub use retry::{Backoff, RetryPolicy};
pub use transport::{Connector, Link, LinkMessage};

pub use courier_proto as proto;
