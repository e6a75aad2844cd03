mod cli;
mod telemetry;

use std::time::UNIX_EPOCH;

use anyhow::{bail, Context, Result};
use clap::Parser;
use courier_push::{Envelope, PushClient, SessionEvent};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cli::{Cli, Commands, SendArgs, WatchArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_filter);

    let config = cli.client_config()?;
    info!(
        endpoint = %config.endpoint,
        transport = ?config.transport,
        max_retries = config.retry.max_retries,
        retry_interval_ms = config.retry.interval.as_millis() as u64,
        "starting courier-tail"
    );
    let client = PushClient::new(config).context("failed to build push client")?;

    match cli.command {
        Commands::Watch(args) => watch(client, args).await,
        Commands::Send(args) => send(client, args).await,
    }
}

async fn watch(client: PushClient, args: WatchArgs) -> Result<()> {
    let json = args.json;
    let print = move |envelope: &Envelope| println!("{}", render(envelope, json));

    for topic in args.topics() {
        client.subscribe(&topic, print);
    }
    if let Some(user) = &args.user {
        client.subscribe_to_user(user, print);
    }
    info!(topics = ?client.topics(), "subscribed");

    let mut events = client.events();
    if let Err(err) = client.connect().await {
        warn!(error = %err, "initial connect failed; retrying in the background");
    }

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Connected { transport }) => info!(transport, "connected"),
                Ok(SessionEvent::Disconnected { reason }) => warn!(reason = %reason, "disconnected"),
                Ok(SessionEvent::ReconnectScheduled { attempt, delay }) => {
                    info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled")
                }
                Ok(SessionEvent::ReconnectFailed { retries }) => {
                    break Err(anyhow::anyhow!("giving up after {retries} reconnect attempts"));
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "session events lagged"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    client.disconnect().await.ok();
    outcome
}

async fn send(client: PushClient, args: SendArgs) -> Result<()> {
    let data: serde_json::Value =
        serde_json::from_str(&args.data).context("--data is not valid JSON")?;
    client.connect().await.context("failed to connect")?;
    if !client.is_connected() {
        bail!("push session is not connected");
    }
    client
        .send_message(&args.destination, &args.kind, &args.message, data)
        .context("failed to publish")?;
    info!(destination = %args.destination, kind = %args.kind, "message sent");
    client.disconnect().await.context("failed to disconnect")?;
    Ok(())
}

fn render(envelope: &Envelope, json: bool) -> String {
    let timestamp_ms = envelope
        .timestamp
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default();
    if json {
        json!({
            "topic": envelope.topic,
            "type": envelope.kind.as_str(),
            "message": envelope.message,
            "data": envelope.payload,
            "timestamp": timestamp_ms,
        })
        .to_string()
    } else {
        format!(
            "{} {} [{}] {} {}",
            timestamp_ms,
            envelope.topic,
            envelope.kind.as_str(),
            envelope.message,
            envelope.payload
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_push::EventKind;
    use std::time::{Duration, SystemTime};

    fn envelope() -> Envelope {
        Envelope {
            topic: "/topic/messages".to_string(),
            kind: EventKind::NewMessage,
            message: "hi".to_string(),
            payload: json!({"id": 3}),
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_millis(1_500),
        }
    }

    #[test]
    fn renders_json_lines() {
        let line: serde_json::Value = serde_json::from_str(&render(&envelope(), true)).unwrap();
        assert_eq!(
            line,
            json!({
                "topic": "/topic/messages",
                "type": "new_message",
                "message": "hi",
                "data": {"id": 3},
                "timestamp": 1500,
            })
        );
    }

    #[test]
    fn renders_human_lines() {
        assert_eq!(
            render(&envelope(), false),
            r#"1500 /topic/messages [new_message] hi {"id":3}"#
        );
    }
}
