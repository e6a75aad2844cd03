use std::env;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::{PushError, PushResult};
use crate::retry::RetryPolicy;

pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Polling,
    /// WebSocket first, HTTP long-polling when the socket cannot be opened.
    Auto,
}

impl FromStr for TransportKind {
    type Err = PushError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            "polling" | "xhr" | "http" => Ok(TransportKind::Polling),
            "auto" => Ok(TransportKind::Auto),
            other => Err(PushError::Config(format!("unknown transport {other:?}"))),
        }
    }
}

/// STOMP heart-beat preferences. A zero duration disables that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub outgoing: Duration,
    pub incoming: Duration,
}

impl Heartbeat {
    pub const fn disabled() -> Self {
        Self {
            outgoing: Duration::ZERO,
            incoming: Duration::ZERO,
        }
    }

    pub const fn symmetric(every: Duration) -> Self {
        Self {
            outgoing: every,
            incoming: every,
        }
    }

    pub(crate) fn header_value(&self) -> String {
        format!(
            "{},{}",
            self.outgoing.as_millis(),
            self.incoming.as_millis()
        )
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::symmetric(DEFAULT_HEARTBEAT)
    }
}

/// Push client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Event-stream endpoint, e.g. `wss://app.example.com/ws`.
    pub endpoint: String,
    pub transport: TransportKind,
    pub retry: RetryPolicy,
    /// Upper bound on one connect attempt, handshake included.
    pub connect_timeout: Duration,
    pub heartbeat: Heartbeat,
    /// Extra headers sent with the STOMP CONNECT frame.
    pub connect_headers: Vec<(String, String)>,
    /// Queue used by `subscribe_to_user`.
    pub private_queue: String,
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            transport: TransportKind::Auto,
            retry: RetryPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat: Heartbeat::default(),
            connect_headers: Vec::new(),
            private_queue: courier_proto::DEFAULT_PRIVATE_QUEUE.to_string(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Load configuration from `COURIER_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(endpoint) = env::var("COURIER_PUSH_URL") {
            if !endpoint.trim().is_empty() {
                config.endpoint = endpoint.trim().to_string();
            }
        }
        if let Some(transport) = env_parse::<TransportKind>("COURIER_TRANSPORT") {
            config.transport = transport;
        }
        if let Some(max_retries) = env_parse::<u32>("COURIER_MAX_RETRIES") {
            config.retry.max_retries = max_retries;
        }
        if let Some(ms) = env_parse::<u64>("COURIER_RETRY_INTERVAL_MS") {
            config.retry.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("COURIER_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("COURIER_HEARTBEAT_MS") {
            config.heartbeat = Heartbeat::symmetric(Duration::from_millis(ms));
        }
        if let Ok(token) = env::var("COURIER_ACCESS_TOKEN") {
            if !token.trim().is_empty() {
                config = config.with_access_token(token.trim());
            }
        }
        config
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_connect_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connect_headers.push((key.into(), value.into()));
        self
    }

    pub fn with_access_token(self, token: impl AsRef<str>) -> Self {
        let value = format!("Bearer {}", token.as_ref());
        self.with_connect_header("Authorization", value)
    }

    pub fn with_private_queue(mut self, queue: impl Into<String>) -> Self {
        self.private_queue = queue.into();
        self
    }

    pub fn endpoint_url(&self) -> PushResult<Url> {
        let url = Url::parse(&self.endpoint)
            .map_err(|err| PushError::Config(format!("invalid endpoint {:?}: {err}", self.endpoint)))?;
        match url.scheme() {
            "ws" | "wss" | "http" | "https" => Ok(url),
            other => Err(PushError::Config(format!(
                "unsupported endpoint scheme {other:?}"
            ))),
        }
    }

    /// Value of the STOMP `host` header.
    pub fn virtual_host(&self) -> String {
        Url::parse(&self.endpoint)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 7] = [
        "COURIER_PUSH_URL",
        "COURIER_TRANSPORT",
        "COURIER_MAX_RETRIES",
        "COURIER_RETRY_INTERVAL_MS",
        "COURIER_CONNECT_TIMEOUT_MS",
        "COURIER_HEARTBEAT_MS",
        "COURIER_ACCESS_TOKEN",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn defaults_match_documented_policy() {
        let config = ClientConfig::default();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.transport, TransportKind::Auto);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat.header_value(), "10000,10000");
        assert_eq!(config.private_queue, "messages");
    }

    #[test]
    fn from_env_overrides_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("COURIER_PUSH_URL", "wss://push.example.com/ws");
        env::set_var("COURIER_TRANSPORT", "polling");
        env::set_var("COURIER_MAX_RETRIES", "3");
        env::set_var("COURIER_RETRY_INTERVAL_MS", "250");
        env::set_var("COURIER_ACCESS_TOKEN", "abc");

        let config = ClientConfig::from_env();
        clear_env();

        assert_eq!(config.endpoint, "wss://push.example.com/ws");
        assert_eq!(config.transport, TransportKind::Polling);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.interval, Duration::from_millis(250));
        assert_eq!(
            config.connect_headers,
            vec![("Authorization".to_string(), "Bearer abc".to_string())]
        );
        assert_eq!(config.virtual_host(), "push.example.com");
    }

    #[test]
    fn from_env_ignores_unparseable_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("COURIER_MAX_RETRIES", "many");
        env::set_var("COURIER_TRANSPORT", "carrier-pigeon");

        let config = ClientConfig::from_env();
        clear_env();

        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.transport, TransportKind::Auto);
    }

    #[test]
    fn endpoint_validation() {
        assert!(ClientConfig::new("https://push.example.com/ws").endpoint_url().is_ok());
        assert!(matches!(
            ClientConfig::new("ftp://push.example.com").endpoint_url(),
            Err(PushError::Config(_))
        ));
        assert!(matches!(
            ClientConfig::new("not a url").endpoint_url(),
            Err(PushError::Config(_))
        ));
    }
}
