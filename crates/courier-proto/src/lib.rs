//! Shared wire definitions for the Courier push channel.
//! Kept in a dedicated crate so dashboards, tools, and test servers agree on
//! frame shapes and addressing without pulling in the client runtime.

pub mod body;
pub mod destination;
pub mod frame;

pub use body::MessageBody;
pub use destination::{
    app, private_queue, resolve_command, resolve_topic, topic, ANALYTICS_LIVE,
    ANALYTICS_UPDATES, CAMPAIGN_PROGRESS, DASHBOARD_UPDATES, DEFAULT_PRIVATE_QUEUE, EMAIL_UPDATES,
    KNOWN_TOPICS, MESSAGES,
};
pub use frame::{decode, frames, Command, Frame, FrameError, Frames, Inbound, HEARTBEAT};
