use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use courier_proto::KNOWN_TOPICS;
use courier_push::{ClientConfig, TransportKind};

#[derive(Parser, Debug)]
#[command(name = "courier-tail")]
#[command(about = "Watch and publish messaging dashboard push events")]
pub struct Cli {
    /// Push endpoint (e.g., wss://app.example.com/ws)
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// websocket, polling or auto
    #[arg(long, global = true)]
    pub transport: Option<String>,

    /// Bearer token sent with the STOMP CONNECT frame
    #[arg(long, global = true, hide_env_values = true, env = "COURIER_ACCESS_TOKEN")]
    pub token: Option<String>,

    /// Automatic reconnect attempts after a failure
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Delay between reconnect attempts
    #[arg(long, global = true)]
    pub retry_interval_ms: Option<u64>,

    #[arg(long, global = true, env = "COURIER_LOG", default_value = "info")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print events as they arrive until interrupted
    Watch(WatchArgs),
    /// Publish one application message and exit
    Send(SendArgs),
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Topic to follow; repeatable. Defaults to every dashboard topic.
    #[arg(short, long = "topic")]
    pub topics: Vec<String>,

    /// Also follow this user's private queue
    #[arg(short, long)]
    pub user: Option<String>,

    /// One JSON object per line instead of the human format
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Command destination; bare names go to /app/<name>
    #[arg(short, long)]
    pub destination: String,

    #[arg(short = 't', long = "type", default_value = "notification")]
    pub kind: String,

    #[arg(short, long, default_value = "")]
    pub message: String,

    /// JSON payload for the `data` field
    #[arg(long, default_value = "{}")]
    pub data: String,
}

impl Cli {
    /// Environment first, then explicit flags on top.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::from_env();
        if let Some(url) = &self.url {
            config.endpoint = url.clone();
        }
        if let Some(transport) = &self.transport {
            config.transport = transport
                .parse::<TransportKind>()
                .with_context(|| format!("--transport {transport}"))?;
        }
        if let Some(max_retries) = self.max_retries {
            config.retry.max_retries = max_retries;
        }
        if let Some(ms) = self.retry_interval_ms {
            config.retry.interval = Duration::from_millis(ms);
        }
        if let Some(token) = &self.token {
            config
                .connect_headers
                .retain(|(key, _)| !key.eq_ignore_ascii_case("authorization"));
            config = config.with_access_token(token);
        }
        config.endpoint_url().context("invalid push endpoint")?;
        Ok(config)
    }
}

impl WatchArgs {
    pub fn topics(&self) -> Vec<String> {
        if self.topics.is_empty() {
            KNOWN_TOPICS.iter().map(|topic| topic.to_string()).collect()
        } else {
            self.topics.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "courier-tail",
            "--url",
            "https://push.example.com/ws",
            "--transport",
            "polling",
            "--max-retries",
            "2",
            "--retry-interval-ms",
            "100",
            "--token",
            "secret",
            "watch",
            "--topic",
            "messages",
        ]);
        let config = cli.client_config().expect("config");
        assert_eq!(config.endpoint, "https://push.example.com/ws");
        assert_eq!(config.transport, TransportKind::Polling);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.interval, Duration::from_millis(100));
        assert!(config
            .connect_headers
            .contains(&("Authorization".to_string(), "Bearer secret".to_string())));
        match cli.command {
            Commands::Watch(args) => assert_eq!(args.topics(), vec!["messages"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_transport() {
        let cli = Cli::parse_from(["courier-tail", "--transport", "smoke", "watch"]);
        assert!(cli.client_config().is_err());
    }

    #[test]
    fn watch_defaults_to_every_known_topic() {
        let cli = Cli::parse_from(["courier-tail", "watch", "--json"]);
        let Commands::Watch(args) = cli.command else {
            panic!("expected watch");
        };
        assert!(args.json);
        assert_eq!(args.topics().len(), KNOWN_TOPICS.len());
    }

    #[test]
    fn send_parses_message_fields() {
        let cli = Cli::parse_from([
            "courier-tail",
            "send",
            "-d",
            "campaign.pause",
            "--type",
            "campaign_progress",
            "--data",
            r#"{"campaignId":7}"#,
        ]);
        let Commands::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.destination, "campaign.pause");
        assert_eq!(args.kind, "campaign_progress");
        assert_eq!(args.message, "");
    }
}
