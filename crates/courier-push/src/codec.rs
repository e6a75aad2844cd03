//! Envelope codec: typed events out of MESSAGE frames, and the frames the
//! client sends.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use courier_proto::{Command, Frame, FrameError};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::Heartbeat;

pub const ACCEPT_VERSION: &str = "1.2,1.1,1.0";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("expected a MESSAGE frame, got {0}")]
    UnexpectedCommand(Command),
    #[error("message frame has no destination")]
    MissingDestination,
    #[error("invalid message body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Event kinds the platform publishes. Anything else decodes as
/// [`EventKind::Unknown`] so newer servers do not break older dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessage,
    MessageStatus,
    EmailUpdate,
    CampaignProgress,
    AnalyticsUpdate,
    DashboardUpdate,
    Notification,
    Unknown(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "new_message" | "message" | "message_received" => EventKind::NewMessage,
            "message_status" | "status_update" | "delivery_status" => EventKind::MessageStatus,
            "email_update" | "email_status" => EventKind::EmailUpdate,
            "campaign_progress" | "campaign_update" => EventKind::CampaignProgress,
            "analytics_update" | "analytics" | "analytics_live" => EventKind::AnalyticsUpdate,
            "dashboard_update" | "dashboard" => EventKind::DashboardUpdate,
            "notification" => EventKind::Notification,
            _ => EventKind::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::NewMessage => "new_message",
            EventKind::MessageStatus => "message_status",
            EventKind::EmailUpdate => "email_update",
            EventKind::CampaignProgress => "campaign_progress",
            EventKind::AnalyticsUpdate => "analytics_update",
            EventKind::DashboardUpdate => "dashboard_update",
            EventKind::Notification => "notification",
            EventKind::Unknown(raw) => raw,
        }
    }
}

/// One decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Destination the message was routed to; the registry key.
    pub topic: String,
    pub kind: EventKind,
    pub message: String,
    pub payload: Value,
    pub timestamp: SystemTime,
}

/// Decodes a MESSAGE frame.
///
/// Bodies of the form `{type, message, data, timestamp}` map onto the typed
/// fields. Any other JSON value is kept whole as the payload with an empty
/// `Unknown` kind. A missing or non-numeric timestamp falls back to the time
/// of receipt.
pub fn decode_message(frame: &Frame) -> Result<Envelope, CodecError> {
    if frame.command != Command::Message {
        return Err(CodecError::UnexpectedCommand(frame.command));
    }
    let topic = frame
        .destination()
        .ok_or(CodecError::MissingDestination)?
        .to_string();
    let value: Value = serde_json::from_str(&frame.body)?;

    let typed = value
        .get("type")
        .and_then(Value::as_str)
        .map(EventKind::parse);
    let Some(kind) = typed else {
        return Ok(Envelope {
            topic,
            kind: EventKind::Unknown(String::new()),
            message: String::new(),
            payload: value,
            timestamp: SystemTime::now(),
        });
    };

    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let timestamp = value
        .get("timestamp")
        .and_then(Value::as_f64)
        .and_then(epoch_millis)
        .unwrap_or_else(SystemTime::now);
    let payload = match value {
        Value::Object(mut fields) => fields.remove("data").unwrap_or(Value::Null),
        _ => Value::Null,
    };

    Ok(Envelope {
        topic,
        kind,
        message,
        payload,
        timestamp,
    })
}

fn epoch_millis(millis: f64) -> Option<SystemTime> {
    if !millis.is_finite() || millis < 0.0 {
        return None;
    }
    let offset = Duration::try_from_secs_f64(millis / 1000.0).ok()?;
    UNIX_EPOCH.checked_add(offset)
}

pub fn connect_frame(host: &str, heartbeat: Heartbeat, extra: &[(String, String)]) -> Frame {
    let mut frame = Frame::new(Command::Connect)
        .header("accept-version", ACCEPT_VERSION)
        .header("host", host)
        .header("heart-beat", heartbeat.header_value());
    for (key, value) in extra {
        frame = frame.header(key.as_str(), value.as_str());
    }
    frame
}

pub fn subscribe_frame(id: &str, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .header("id", id)
        .header("destination", destination)
        .header("ack", "auto")
}

pub fn unsubscribe_frame(id: &str) -> Frame {
    Frame::new(Command::Unsubscribe).header("id", id)
}

pub fn send_frame(destination: &str, body: impl Into<String>) -> Frame {
    Frame::new(Command::Send)
        .header("destination", destination)
        .header("content-type", "application/json")
        .with_body(body)
}

/// Serializes `body` as JSON and wraps it in a SEND frame.
pub fn encode_send<T: Serialize + ?Sized>(destination: &str, body: &T) -> Result<Frame, CodecError> {
    Ok(send_frame(destination, serde_json::to_string(body)?))
}

pub fn disconnect_frame() -> Frame {
    Frame::new(Command::Disconnect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(destination: &str, body: &str) -> Frame {
        Frame::new(Command::Message)
            .header("destination", destination)
            .header("subscription", "sub-0")
            .with_body(body)
    }

    #[test]
    fn decodes_typed_body() {
        let frame = message(
            "/topic/campaign_progress",
            r#"{"type":"CAMPAIGN_PROGRESS","message":"42% sent","data":{"sent":42},"timestamp":1700000000000}"#,
        );
        let envelope = decode_message(&frame).expect("envelope");
        assert_eq!(envelope.topic, "/topic/campaign_progress");
        assert_eq!(envelope.kind, EventKind::CampaignProgress);
        assert_eq!(envelope.message, "42% sent");
        assert_eq!(envelope.payload, json!({"sent": 42}));
        assert_eq!(
            envelope.timestamp,
            UNIX_EPOCH + Duration::from_millis(1_700_000_000_000)
        );
    }

    #[test]
    fn out_of_range_timestamp_falls_back_to_receipt_time() {
        let before = SystemTime::now();
        for raw in ["1e300", "-5", "1e25"] {
            let body = format!(r#"{{"type":"new_message","message":"late","timestamp":{raw}}}"#);
            let envelope = decode_message(&message("/topic/messages", &body)).expect("envelope");
            assert_eq!(envelope.message, "late");
            assert!(envelope.timestamp >= before, "timestamp {raw} was not replaced");
        }
    }

    #[test]
    fn unknown_kind_is_preserved() {
        let frame = message("/topic/messages", r#"{"type":"billing-alert","data":[1,2]}"#);
        let envelope = decode_message(&frame).expect("envelope");
        assert_eq!(envelope.kind, EventKind::Unknown("billing-alert".into()));
        assert_eq!(envelope.kind.as_str(), "billing-alert");
        assert_eq!(envelope.payload, json!([1, 2]));
    }

    #[test]
    fn untyped_json_is_kept_whole() {
        let frame = message("/topic/analytics_live", r#"{"opens":3,"clicks":1}"#);
        let envelope = decode_message(&frame).expect("envelope");
        assert_eq!(envelope.kind, EventKind::Unknown(String::new()));
        assert_eq!(envelope.payload, json!({"opens": 3, "clicks": 1}));
    }

    #[test]
    fn rejects_bad_frames() {
        assert!(matches!(
            decode_message(&message("/topic/messages", "not json")),
            Err(CodecError::Body(_))
        ));
        assert!(matches!(
            decode_message(&Frame::new(Command::Message).with_body("{}")),
            Err(CodecError::MissingDestination)
        ));
        assert!(matches!(
            decode_message(&Frame::new(Command::Receipt)),
            Err(CodecError::UnexpectedCommand(Command::Receipt))
        ));
    }

    #[test]
    fn kind_parsing_is_lenient() {
        assert_eq!(EventKind::parse("NEW_MESSAGE"), EventKind::NewMessage);
        assert_eq!(EventKind::parse("email-update"), EventKind::EmailUpdate);
        assert_eq!(EventKind::parse("Dashboard Update"), EventKind::DashboardUpdate);
    }

    #[test]
    fn outbound_frames() {
        let connect = connect_frame(
            "push.example.com",
            Heartbeat::disabled(),
            &[("Authorization".into(), "Bearer t".into())],
        );
        assert_eq!(connect.get("accept-version"), Some(ACCEPT_VERSION));
        assert_eq!(connect.get("heart-beat"), Some("0,0"));
        assert_eq!(connect.get("Authorization"), Some("Bearer t"));

        let send = encode_send("/app/campaign.pause", &json!({"campaignId": 7})).expect("send");
        assert_eq!(send.command, Command::Send);
        assert_eq!(send.destination(), Some("/app/campaign.pause"));
        assert_eq!(send.body, r#"{"campaignId":7}"#);

        let subscribe = subscribe_frame("sub-3", "/topic/messages");
        assert_eq!(subscribe.get("id"), Some("sub-3"));
        assert_eq!(unsubscribe_frame("sub-3").get("id"), Some("sub-3"));
    }
}
