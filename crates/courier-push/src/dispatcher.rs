use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use courier_proto::Frame;
use tracing::{trace, warn};

use crate::codec::{decode_message, Envelope};
use crate::registry::Registry;

/// Fans decoded messages out to the registry's listeners.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Decodes a MESSAGE frame and delivers it. `route` is the registry key
    /// the frame's subscription was opened for; it wins over the frame's
    /// own destination header, which brokers rewrite for private queues.
    ///
    /// Returns the number of listeners invoked. Undecodable frames are
    /// logged and dropped.
    pub fn dispatch(&self, frame: &Frame, route: Option<&str>) -> usize {
        let mut envelope = match decode_message(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    target: "courier.dispatch",
                    error = %err,
                    destination = frame.destination().unwrap_or("-"),
                    "discarding undecodable message"
                );
                return 0;
            }
        };
        if let Some(route) = route {
            if route != envelope.topic {
                envelope.topic = route.to_string();
            }
        }
        self.deliver(&envelope)
    }

    pub fn deliver(&self, envelope: &Envelope) -> usize {
        let listeners = self.registry.listeners(&envelope.topic);
        if listeners.is_empty() {
            trace!(
                target: "courier.dispatch",
                topic = %envelope.topic,
                "no listeners for message"
            );
            return 0;
        }
        for listener in &listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(envelope))).is_err() {
                warn!(
                    target: "courier.dispatch",
                    topic = %envelope.topic,
                    kind = envelope.kind.as_str(),
                    "listener panicked; continuing with remaining listeners"
                );
            }
        }
        listeners.len()
    }
}
