//! Physical connections. A [`Connector`] opens one [`Link`] per attempt; the
//! link carries raw text messages in both directions until either side
//! closes it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{ClientConfig, TransportKind};
use crate::error::{PushError, PushResult};

pub mod mock;
pub mod polling;
pub mod websocket;

pub use polling::PollingConnector;
pub use websocket::WebSocketConnector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkMessage {
    Text(String),
    /// The peer went away. Carries the close reason when one was given.
    Closed(Option<String>),
}

/// An open connection. Dropping every outbound sender ends the link's I/O
/// task after it flushes what was already queued.
#[derive(Debug)]
pub struct Link {
    label: &'static str,
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<LinkMessage>,
}

impl Link {
    pub fn new(
        label: &'static str,
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<LinkMessage>,
    ) -> Self {
        Self {
            label,
            outbound,
            inbound,
        }
    }

    pub fn send(&self, text: impl Into<String>) -> PushResult<()> {
        self.outbound.send(text.into()).map_err(|_| PushError::Closed)
    }

    /// Next inbound item; `None` once the I/O task is gone.
    pub async fn recv(&mut self) -> Option<LinkMessage> {
        self.inbound.recv().await
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<String> {
        self.outbound.clone()
    }

    /// Transport name, for logs and `SessionEvent::Connected`.
    pub fn label(&self) -> &'static str {
        self.label
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> PushResult<Link>;

    fn name(&self) -> &'static str;
}

/// Tries `primary`, then `fallback` when the primary cannot open a link.
pub struct FallbackConnector {
    primary: Arc<dyn Connector>,
    fallback: Arc<dyn Connector>,
}

impl FallbackConnector {
    pub fn new(primary: Arc<dyn Connector>, fallback: Arc<dyn Connector>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl Connector for FallbackConnector {
    async fn connect(&self) -> PushResult<Link> {
        match self.primary.connect().await {
            Ok(link) => Ok(link),
            Err(primary_err) => {
                warn!(
                    target: "courier.transport",
                    transport = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %primary_err,
                    "primary transport unavailable; falling back"
                );
                self.fallback.connect().await.map_err(|fallback_err| {
                    PushError::Transport(format!(
                        "{}: {primary_err}; {}: {fallback_err}",
                        self.primary.name(),
                        self.fallback.name()
                    ))
                })
            }
        }
    }

    fn name(&self) -> &'static str {
        "auto"
    }
}

/// Builds the connector selected by `config.transport`.
pub fn connector_for(config: &ClientConfig) -> PushResult<Arc<dyn Connector>> {
    let url = config.endpoint_url()?;
    let connector: Arc<dyn Connector> = match config.transport {
        TransportKind::WebSocket => Arc::new(WebSocketConnector::new(url)?),
        TransportKind::Polling => Arc::new(PollingConnector::new(url)?),
        TransportKind::Auto => Arc::new(FallbackConnector::new(
            Arc::new(WebSocketConnector::new(url.clone())?),
            Arc::new(PollingConnector::new(url)?),
        )),
    };
    info!(
        target: "courier.transport",
        transport = connector.name(),
        endpoint = %config.endpoint,
        "transport selected"
    );
    Ok(connector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Refusing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self) -> PushResult<Link> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PushError::Transport("refused".into()))
        }

        fn name(&self) -> &'static str {
            "refusing"
        }
    }

    #[tokio::test]
    async fn fallback_is_used_when_primary_fails() {
        let primary = Arc::new(Refusing {
            calls: AtomicUsize::new(0),
        });
        let (fallback, broker) = mock::pair();
        let connector = FallbackConnector::new(primary.clone(), Arc::new(fallback));

        let link = connector.connect().await.expect("fallback link");
        assert_eq!(link.label(), "mock");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.attempts(), 1);
    }

    #[tokio::test]
    async fn both_failures_are_reported() {
        let connector = FallbackConnector::new(
            Arc::new(Refusing {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(Refusing {
                calls: AtomicUsize::new(0),
            }),
        );
        let err = connector.connect().await.expect_err("both refuse");
        assert!(matches!(err, PushError::Transport(msg) if msg.contains("refused; refusing")));
    }

    #[test]
    fn connector_for_rejects_bad_endpoints() {
        let config = ClientConfig::new("ftp://example.com/ws");
        assert!(matches!(connector_for(&config), Err(PushError::Config(_))));
    }
}
