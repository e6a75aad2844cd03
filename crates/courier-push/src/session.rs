//! One STOMP session over one [`Link`]. Never reused: after it ends, the
//! manager builds a fresh one.

use std::collections::HashMap;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use courier_proto::{decode, frames, Command, Frame, Inbound, HEARTBEAT};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, trace, warn};

use crate::codec::{connect_frame, disconnect_frame, subscribe_frame, unsubscribe_frame};
use crate::config::ClientConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{PushError, PushResult};
use crate::transport::{Link, LinkMessage};

/// Reported once when an established session stops on its own.
#[derive(Debug, Clone)]
pub(crate) struct SessionEnded {
    pub generation: u64,
    pub reason: String,
}

/// Subscription id → registry key, shared with the pump for routing.
type Routes = Arc<RwLock<HashMap<String, String>>>;

/// Heart-beat schedule agreed with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Negotiated {
    pub send_every: Option<Duration>,
    pub stale_after: Option<Duration>,
}

impl Negotiated {
    /// `ours` is `(cx, cy)` from our CONNECT, `theirs` is `(sx, sy)` from
    /// the server's CONNECTED. Zero on either side disables a direction.
    pub fn from_headers(ours: (Duration, Duration), theirs: (Duration, Duration)) -> Self {
        let (cx, cy) = ours;
        let (sx, sy) = theirs;
        let send_every = (!cx.is_zero() && !sy.is_zero()).then(|| cx.max(sy));
        let stale_after = (!cy.is_zero() && !sx.is_zero()).then(|| cy.max(sx) * 2);
        Self {
            send_every,
            stale_after,
        }
    }
}

fn parse_heart_beat(value: Option<&str>) -> (Duration, Duration) {
    let Some((x, y)) = value.and_then(|value| value.split_once(',')) else {
        return (Duration::ZERO, Duration::ZERO);
    };
    let millis = |raw: &str| Duration::from_millis(raw.trim().parse().unwrap_or(0));
    (millis(x), millis(y))
}

pub(crate) struct TransportSession {
    transport: &'static str,
    outbound: mpsc::UnboundedSender<String>,
    routes: Routes,
    /// Registry key → subscription id for this session only.
    wire: HashMap<String, String>,
    next_subscription: u64,
    pump: JoinHandle<()>,
}

impl TransportSession {
    /// Performs the STOMP handshake on `link` and starts the pump.
    pub async fn establish(
        mut link: Link,
        config: &ClientConfig,
        dispatcher: Dispatcher,
        generation: u64,
        ended: mpsc::UnboundedSender<SessionEnded>,
    ) -> PushResult<Self> {
        let connect = connect_frame(
            &config.virtual_host(),
            config.heartbeat,
            &config.connect_headers,
        );
        link.send(connect.encode())?;

        let (connected, backlog) = loop {
            let text = match link.recv().await {
                Some(LinkMessage::Text(text)) => text,
                Some(LinkMessage::Closed(Some(reason))) => {
                    return Err(PushError::Transport(format!(
                        "closed during handshake: {reason}"
                    )))
                }
                Some(LinkMessage::Closed(None)) | None => return Err(PushError::Closed),
            };
            let items = decode(&text)
                .map_err(|err| PushError::Handshake(format!("undecodable reply: {err}")))?;
            let mut frames = items.into_iter().filter_map(|item| match item {
                Inbound::Frame(frame) => Some(frame),
                Inbound::Heartbeat => None,
            });
            if let Some(first) = frames.next() {
                match first.command {
                    Command::Connected => break (first, frames.collect::<Vec<_>>()),
                    Command::Error => return Err(PushError::Handshake(error_reason(&first))),
                    other => {
                        return Err(PushError::Handshake(format!(
                            "expected CONNECTED, got {other}"
                        )))
                    }
                }
            }
        };

        let negotiated = Negotiated::from_headers(
            (config.heartbeat.outgoing, config.heartbeat.incoming),
            parse_heart_beat(connected.get("heart-beat")),
        );
        debug!(
            target: "courier.session",
            transport = link.label(),
            generation,
            version = connected.get("version").unwrap_or("1.0"),
            server = connected.get("server").unwrap_or("-"),
            heartbeat = ?negotiated,
            "stomp session established"
        );

        let transport = link.label();
        let outbound = link.sender();
        let routes = Routes::default();
        let pump = tokio::spawn(pump(
            link,
            Pump {
                dispatcher,
                routes: routes.clone(),
                generation,
                negotiated,
            },
            EndReport {
                generation,
                ended,
                reason: None,
            },
            backlog,
        ));

        Ok(Self {
            transport,
            outbound,
            routes,
            wire: HashMap::new(),
            next_subscription: 0,
            pump,
        })
    }

    pub fn transport(&self) -> &'static str {
        self.transport
    }

    /// Issues a SUBSCRIBE unless `topic` is already subscribed here.
    /// Returns whether a frame was sent.
    pub fn subscribe(&mut self, topic: &str) -> PushResult<bool> {
        if self.wire.contains_key(topic) {
            return Ok(false);
        }
        let id = format!("sub-{}", self.next_subscription);
        self.next_subscription += 1;
        self.write(subscribe_frame(&id, topic))?;
        self.routes.write().insert(id.clone(), topic.to_string());
        self.wire.insert(topic.to_string(), id);
        Ok(true)
    }

    pub fn unsubscribe(&mut self, topic: &str) -> PushResult<bool> {
        let Some(id) = self.wire.remove(topic) else {
            return Ok(false);
        };
        self.routes.write().remove(&id);
        self.write(unsubscribe_frame(&id))?;
        Ok(true)
    }

    pub fn send(&self, frame: Frame) -> PushResult<()> {
        self.write(frame)
    }

    fn write(&self, frame: Frame) -> PushResult<()> {
        trace!(target: "courier.session", frame = %frame, "sending frame");
        self.outbound.send(frame.encode()).map_err(|_| PushError::Closed)
    }

    /// Sends DISCONNECT and stops reading. The link flushes queued frames
    /// before it shuts down.
    pub fn close(self) {
        if let Err(err) = self.write(disconnect_frame()) {
            debug!(target: "courier.session", error = %err, "disconnect not sent");
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn error_reason(frame: &Frame) -> String {
    match (frame.get("message"), frame.body.trim()) {
        (Some(message), "") => message.to_string(),
        (Some(message), body) => format!("{message}: {body}"),
        (None, "") => "server sent ERROR".to_string(),
        (None, body) => body.to_string(),
    }
}

struct Pump {
    dispatcher: Dispatcher,
    routes: Routes,
    generation: u64,
    negotiated: Negotiated,
}

/// Sends the session's single [`SessionEnded`] when dropped, so a pump that
/// panics or is aborted still reports. Retired sessions report with their
/// old generation and the manager ignores them.
struct EndReport {
    generation: u64,
    ended: mpsc::UnboundedSender<SessionEnded>,
    reason: Option<String>,
}

impl Drop for EndReport {
    fn drop(&mut self) {
        let reason = self
            .reason
            .take()
            .unwrap_or_else(|| "session task stopped unexpectedly".to_string());
        let _ = self.ended.send(SessionEnded {
            generation: self.generation,
            reason,
        });
    }
}

impl Pump {
    /// Returns a reason when the session must end.
    fn handle_text(&self, text: &str) -> Option<String> {
        for item in frames(text) {
            match item {
                Ok(Inbound::Heartbeat) => {}
                Ok(Inbound::Frame(frame)) => {
                    if let Some(reason) = self.handle_frame(frame) {
                        return Some(reason);
                    }
                }
                Err(err) => warn!(
                    target: "courier.session",
                    error = %err,
                    generation = self.generation,
                    "discarding undecodable inbound frame"
                ),
            }
        }
        None
    }

    fn handle_frame(&self, frame: Frame) -> Option<String> {
        match frame.command {
            Command::Message => {
                match frame.get("subscription") {
                    Some(id) => {
                        let route = self.routes.read().get(id).cloned();
                        match route {
                            Some(route) => {
                                self.dispatcher.dispatch(&frame, Some(&route));
                            }
                            None => trace!(
                                target: "courier.session",
                                subscription = id,
                                "message for a closed subscription"
                            ),
                        }
                    }
                    None => {
                        self.dispatcher.dispatch(&frame, None);
                    }
                }
                None
            }
            Command::Receipt => {
                debug!(
                    target: "courier.session",
                    receipt = frame.get("receipt-id").unwrap_or("-"),
                    "receipt"
                );
                None
            }
            Command::Error => Some(format!("server error: {}", error_reason(&frame))),
            other => {
                debug!(target: "courier.session", command = %other, "ignoring unexpected frame");
                None
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn expire(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(deadline) => deadline.as_mut().await,
        None => pending().await,
    }
}

async fn pump(mut link: Link, pump: Pump, mut report: EndReport, backlog: Vec<Frame>) {
    let heartbeat = link.sender();
    let mut send_tick = pump.negotiated.send_every.map(|every| {
        let mut interval = interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let stale_after = pump.negotiated.stale_after;
    let mut stale = stale_after.map(|after| Box::pin(sleep(after)));

    let mut reason = backlog
        .into_iter()
        .find_map(|frame| pump.handle_frame(frame));

    while reason.is_none() {
        tokio::select! {
            inbound = link.recv() => match inbound {
                Some(LinkMessage::Text(text)) => {
                    if let (Some(deadline), Some(after)) = (stale.as_mut(), stale_after) {
                        deadline.as_mut().reset(Instant::now() + after);
                    }
                    reason = pump.handle_text(&text);
                }
                Some(LinkMessage::Closed(closed)) => {
                    reason = Some(closed.unwrap_or_else(|| "connection closed".to_string()));
                }
                None => reason = Some("transport gone".to_string()),
            },
            _ = tick(&mut send_tick) => {
                if heartbeat.send(HEARTBEAT.to_string()).is_err() {
                    reason = Some("heart-beat send failed".to_string());
                }
            }
            _ = expire(&mut stale) => {
                reason = Some(format!(
                    "no data from server within {:?}",
                    stale_after.unwrap_or_default()
                ));
            }
        }
    }

    let reason = reason.unwrap_or_default();
    debug!(
        target: "courier.session",
        generation = pump.generation,
        reason = %reason,
        "stomp session ended"
    );
    report.reason = Some(reason);
}
