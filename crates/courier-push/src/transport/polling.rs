//! SockJS `xhr` long-polling, used when a native WebSocket cannot be opened.
//!
//! Every session lives under `{endpoint}/{server}/{session}/`. Inbound data
//! arrives by repeatedly POSTing to `xhr`; outbound messages are POSTed as a
//! JSON array of strings to `xhr_send`.

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;
use uuid::Uuid;

use super::{Connector, Link, LinkMessage};
use crate::error::{PushError, PushResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SockJsFrame {
    Open,
    Heartbeat,
    Messages(Vec<String>),
    Close(u16, String),
}

pub(crate) fn parse_frames(body: &str) -> PushResult<Vec<SockJsFrame>> {
    let mut frames = Vec::new();
    for line in body.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let mut chars = line.chars();
        let tag = chars.next();
        let rest = chars.as_str();
        let frame = match tag {
            Some('o') => SockJsFrame::Open,
            Some('h') => SockJsFrame::Heartbeat,
            Some('a') => SockJsFrame::Messages(serde_json::from_str(rest).map_err(invalid_frame)?),
            Some('c') => {
                let (code, reason): (u16, String) =
                    serde_json::from_str(rest).map_err(invalid_frame)?;
                SockJsFrame::Close(code, reason)
            }
            _ => {
                return Err(PushError::Transport(format!(
                    "unexpected sockjs frame {line:?}"
                )))
            }
        };
        frames.push(frame);
    }
    Ok(frames)
}

fn invalid_frame(err: serde_json::Error) -> PushError {
    PushError::Transport(format!("invalid sockjs frame: {err}"))
}

#[derive(Debug, Clone)]
pub struct PollingConnector {
    http: Client,
    base: Url,
}

impl PollingConnector {
    pub fn new(mut base: Url) -> PushResult<Self> {
        let scheme = match base.scheme() {
            "ws" | "http" => "http",
            "wss" | "https" => "https",
            other => {
                return Err(PushError::Config(format!(
                    "polling transport cannot use scheme {other:?}"
                )))
            }
        };
        base.set_scheme(scheme)
            .map_err(|_| PushError::Config(format!("cannot rewrite scheme of {base}")))?;
        Ok(Self {
            http: Client::new(),
            base,
        })
    }

    fn session_url(&self) -> String {
        let server = rand::thread_rng().gen_range(0..1000);
        let session = Uuid::new_v4().simple();
        format!(
            "{}/{server:03}/{session}",
            self.base.as_str().trim_end_matches('/')
        )
    }
}

#[async_trait]
impl Connector for PollingConnector {
    async fn connect(&self) -> PushResult<Link> {
        let session_url = self.session_url();
        let body = post(&self.http, &format!("{session_url}/xhr"), None).await?;
        match parse_frames(&body)?.first() {
            Some(SockJsFrame::Open) => {}
            Some(SockJsFrame::Close(code, reason)) => {
                return Err(PushError::Transport(format!(
                    "sockjs session refused: {code} {reason}"
                )))
            }
            other => {
                return Err(PushError::Transport(format!(
                    "expected sockjs open frame, got {other:?}"
                )))
            }
        }
        debug!(target: "courier.transport", session = %session_url, "sockjs session opened");

        let (tx_out, rx_out) = mpsc::unbounded_channel::<String>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<LinkMessage>();
        tokio::spawn(run(self.http.clone(), session_url, rx_out, tx_in));
        Ok(Link::new(self.name(), tx_out, rx_in))
    }

    fn name(&self) -> &'static str {
        "xhr-polling"
    }
}

async fn post(http: &Client, url: &str, body: Option<String>) -> PushResult<String> {
    let mut request = http.post(url);
    if let Some(body) = body {
        request = request
            .header(reqwest::header::CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(body);
    }
    let response = request
        .send()
        .await
        .map_err(|err| PushError::Transport(format!("http request failed: {err}")))?;
    let status = response.status();
    if status.is_success() {
        response
            .text()
            .await
            .map_err(|err| PushError::Transport(format!("http body read failed: {err}")))
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(PushError::Transport(format!(
            "unexpected status: {status} body={body}"
        )))
    }
}

async fn run(
    http: Client,
    session_url: String,
    mut rx_out: mpsc::UnboundedReceiver<String>,
    tx_in: mpsc::UnboundedSender<LinkMessage>,
) {
    let reason = tokio::select! {
        reason = poll_loop(&http, &session_url, &tx_in) => reason,
        reason = send_loop(&http, &session_url, &mut rx_out) => reason,
    };
    debug!(
        target: "courier.transport",
        session = %session_url,
        reason = reason.as_deref().unwrap_or("-"),
        "sockjs session closed"
    );
    let _ = tx_in.send(LinkMessage::Closed(reason));
}

async fn poll_loop(
    http: &Client,
    session_url: &str,
    tx_in: &mpsc::UnboundedSender<LinkMessage>,
) -> Option<String> {
    let url = format!("{session_url}/xhr");
    loop {
        let frames = match post(http, &url, None).await.and_then(|body| parse_frames(&body)) {
            Ok(frames) => frames,
            Err(err) => return Some(err.to_string()),
        };
        for frame in frames {
            match frame {
                SockJsFrame::Open | SockJsFrame::Heartbeat => {
                    trace!(target: "courier.transport", frame = ?frame, "sockjs control frame");
                }
                SockJsFrame::Messages(messages) => {
                    for text in messages {
                        if tx_in.send(LinkMessage::Text(text)).is_err() {
                            return None;
                        }
                    }
                }
                SockJsFrame::Close(code, reason) => return Some(format!("{code} {reason}")),
            }
        }
    }
}

async fn send_loop(
    http: &Client,
    session_url: &str,
    rx_out: &mut mpsc::UnboundedReceiver<String>,
) -> Option<String> {
    let url = format!("{session_url}/xhr_send");
    while let Some(first) = rx_out.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx_out.try_recv() {
            batch.push(next);
        }
        let body = match serde_json::to_string(&batch) {
            Ok(body) => body,
            Err(err) => return Some(err.to_string()),
        };
        if let Err(err) = post(http, &url, Some(body)).await {
            return Some(err.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sockjs_frames() {
        let frames = parse_frames("o\nh\na[\"CONNECTED\\nversion:1.2\\n\\n\\u0000\"]\nc[3000,\"Go away!\"]\n")
            .expect("frames");
        assert_eq!(
            frames,
            vec![
                SockJsFrame::Open,
                SockJsFrame::Heartbeat,
                SockJsFrame::Messages(vec!["CONNECTED\nversion:1.2\n\n\0".to_string()]),
                SockJsFrame::Close(3000, "Go away!".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_unknown_frames() {
        assert!(matches!(parse_frames("x[]"), Err(PushError::Transport(_))));
        assert!(matches!(parse_frames("a{oops"), Err(PushError::Transport(_))));
    }

    #[test]
    fn session_urls_use_http_schemes() {
        let connector = PollingConnector::new(Url::parse("wss://push.example.com/ws/").unwrap()).unwrap();
        let url = connector.session_url();
        let rest = url
            .strip_prefix("https://push.example.com/ws/")
            .expect("base prefix");
        let (server, session) = rest.split_once('/').expect("server/session");
        assert_eq!(server.len(), 3);
        assert!(server.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(session.len(), 32);
    }
}
