//! In-memory connector for tests. Each successful `connect` hands a
//! [`MockPeer`] to the [`MockBroker`], which plays the server side of the
//! link.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use courier_proto::{decode, Command, Frame, Inbound};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use super::{Connector, Link, LinkMessage};
use crate::error::{PushError, PushResult};

struct Shared {
    attempts: AtomicUsize,
    refuse: AtomicBool,
    peers: mpsc::UnboundedSender<MockPeer>,
}

#[derive(Clone)]
pub struct MockConnector {
    shared: Arc<Shared>,
}

pub struct MockBroker {
    shared: Arc<Shared>,
    peers: mpsc::UnboundedReceiver<MockPeer>,
}

pub fn pair() -> (MockConnector, MockBroker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        attempts: AtomicUsize::new(0),
        refuse: AtomicBool::new(false),
        peers: tx,
    });
    (
        MockConnector {
            shared: shared.clone(),
        },
        MockBroker { shared, peers: rx },
    )
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> PushResult<Link> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(PushError::Transport("connection refused".into()));
        }
        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let (tx_in, rx_in) = mpsc::unbounded_channel();
        let peer = MockPeer {
            from_client: rx_out,
            to_client: tx_in,
            pending: VecDeque::new(),
        };
        self.shared
            .peers
            .send(peer)
            .map_err(|_| PushError::Transport("mock broker dropped".into()))?;
        Ok(Link::new(self.name(), tx_out, rx_in))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

impl MockBroker {
    /// Waits for the client's next successful `connect`.
    pub async fn next_peer(&mut self) -> Option<MockPeer> {
        self.peers.recv().await
    }

    /// While set, every `connect` fails immediately.
    pub fn refuse(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of `connect` calls so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

/// Server side of one mock link. Dropping it closes the link.
pub struct MockPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<LinkMessage>,
    pending: VecDeque<Frame>,
}

impl MockPeer {
    /// Next frame from the client, skipping heart-beats. `None` once the
    /// client has dropped the link.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            let text = self.from_client.recv().await?;
            self.buffer(&text);
        }
    }

    /// Frames already sent by the client, without waiting.
    pub fn try_recv_frame(&mut self) -> Option<Frame> {
        while let Ok(text) = self.from_client.try_recv() {
            self.buffer(&text);
        }
        self.pending.pop_front()
    }

    /// Raw text the client sent, heart-beats included, without waiting.
    pub fn try_recv_raw(&mut self) -> Option<String> {
        self.from_client.try_recv().ok()
    }

    fn buffer(&mut self, text: &str) {
        match decode(text) {
            Ok(items) => self.pending.extend(items.into_iter().filter_map(|item| match item {
                Inbound::Frame(frame) => Some(frame),
                Inbound::Heartbeat => None,
            })),
            Err(err) => warn!(target: "courier.mock", error = %err, "client sent an undecodable frame"),
        }
    }

    /// Completes the handshake without heart-beats. Returns the client's
    /// CONNECT frame.
    pub async fn accept(&mut self) -> Option<Frame> {
        self.accept_with_heartbeat("0,0").await
    }

    pub async fn accept_with_heartbeat(&mut self, heart_beat: &str) -> Option<Frame> {
        let connect = self.expect_connect().await?;
        self.send_frame(
            Frame::new(Command::Connected)
                .header("version", "1.2")
                .header("heart-beat", heart_beat)
                .header("server", "courier-mock"),
        );
        Some(connect)
    }

    /// Answers the CONNECT with an ERROR frame.
    pub async fn reject(&mut self, message: &str) -> Option<Frame> {
        let connect = self.expect_connect().await?;
        self.send_frame(Frame::new(Command::Error).header("message", message));
        Some(connect)
    }

    async fn expect_connect(&mut self) -> Option<Frame> {
        loop {
            let frame = self.recv_frame().await?;
            if frame.command == Command::Connect {
                return Some(frame);
            }
        }
    }

    pub fn send_frame(&self, frame: Frame) -> bool {
        self.send_raw(frame.encode())
    }

    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client.send(LinkMessage::Text(text.into())).is_ok()
    }

    /// Delivers a MESSAGE for an open subscription.
    pub fn publish(&self, subscription: &str, destination: &str, body: &str) -> bool {
        self.send_frame(
            Frame::new(Command::Message)
                .header("subscription", subscription)
                .header("destination", destination)
                .header("message-id", Uuid::new_v4().to_string())
                .with_body(body),
        )
    }

    /// Closes the link from the server side.
    pub fn close(self, reason: &str) {
        let _ = self.to_client.send(LinkMessage::Closed(Some(reason.to_string())));
    }
}
