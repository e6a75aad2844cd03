use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

use super::{Connector, Link, LinkMessage};
use crate::error::{PushError, PushResult};

/// Native WebSocket connector. `http(s)` endpoints are mapped to `ws(s)`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(mut url: Url) -> PushResult<Self> {
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(PushError::Config(format!(
                    "websocket transport cannot use scheme {other:?}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| PushError::Config(format!("cannot rewrite scheme of {url}")))?;
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> PushResult<Link> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|err| PushError::Transport(format!("websocket connect failed: {err}")))?;
        debug!(
            target: "courier.transport",
            url = %self.url,
            status = %response.status(),
            "websocket opened"
        );

        let (tx_out, rx_out) = mpsc::unbounded_channel::<String>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<LinkMessage>();
        tokio::spawn(pump(stream, rx_out, tx_in));
        Ok(Link::new(self.name(), tx_out, rx_in))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<String>,
    tx_in: mpsc::UnboundedSender<LinkMessage>,
) {
    let (mut sink, mut source) = stream.split();
    let reason = loop {
        tokio::select! {
            outbound = rx_out.recv() => match outbound {
                Some(text) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        break Some(format!("send failed: {err}"));
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break None;
                }
            },
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if tx_in.send(LinkMessage::Text(text)).is_err() {
                        break None;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if tx_in.send(LinkMessage::Text(text)).is_err() {
                            break None;
                        }
                    }
                    Err(err) => {
                        trace!(target: "courier.transport", error = %err, "dropping non-utf8 binary message");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame.map(|frame| format!("{} {}", u16::from(frame.code), frame.reason));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break Some(err.to_string()),
                None => break None,
            },
        }
    };
    debug!(
        target: "courier.transport",
        reason = reason.as_deref().unwrap_or("-"),
        "websocket closed"
    );
    let _ = tx_in.send(LinkMessage::Closed(reason));
}
