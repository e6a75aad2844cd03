//! Destination addressing used by the push broker.
//!
//! Broadcast topics live under `/topic/<name>`, per-principal delivery under
//! `/user/<id>/queue/<name>`, and application commands are sent to
//! `/app/<name>`.

pub const TOPIC_PREFIX: &str = "/topic/";
pub const USER_PREFIX: &str = "/user/";
pub const APP_PREFIX: &str = "/app/";

pub const MESSAGES: &str = "messages";
pub const EMAIL_UPDATES: &str = "email-updates";
pub const ANALYTICS_UPDATES: &str = "analytics-updates";
pub const DASHBOARD_UPDATES: &str = "dashboard-updates";
pub const ANALYTICS_LIVE: &str = "analytics_live";
pub const CAMPAIGN_PROGRESS: &str = "campaign_progress";

/// Broadcast topics the dashboard listens on.
pub const KNOWN_TOPICS: [&str; 6] = [
    MESSAGES,
    EMAIL_UPDATES,
    ANALYTICS_UPDATES,
    DASHBOARD_UPDATES,
    ANALYTICS_LIVE,
    CAMPAIGN_PROGRESS,
];

/// Queue name used for private per-principal delivery.
pub const DEFAULT_PRIVATE_QUEUE: &str = "messages";

pub fn topic(name: &str) -> String {
    format!("{TOPIC_PREFIX}{}", name.trim_start_matches('/'))
}

pub fn private_queue(principal: &str, queue: &str) -> String {
    format!(
        "{USER_PREFIX}{}/queue/{}",
        principal.trim_matches('/'),
        queue.trim_start_matches('/')
    )
}

pub fn app(name: &str) -> String {
    format!("{APP_PREFIX}{}", name.trim_start_matches('/'))
}

/// Bare names become broadcast topics; anything already absolute is kept.
pub fn resolve_topic(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        topic(name)
    }
}

/// Bare names become application commands; absolute destinations are kept.
pub fn resolve_command(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        app(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_destinations() {
        assert_eq!(topic("messages"), "/topic/messages");
        assert_eq!(private_queue("tenant-42", "messages"), "/user/tenant-42/queue/messages");
        assert_eq!(app("campaign.pause"), "/app/campaign.pause");
        assert_eq!(resolve_command("/app/campaign.pause"), "/app/campaign.pause");
        assert_eq!(resolve_command("campaign.pause"), "/app/campaign.pause");
    }

    #[test]
    fn resolve_keeps_absolute_destinations() {
        assert_eq!(resolve_topic(CAMPAIGN_PROGRESS), "/topic/campaign_progress");
        assert_eq!(resolve_topic("/queue/errors"), "/queue/errors");
    }
}
