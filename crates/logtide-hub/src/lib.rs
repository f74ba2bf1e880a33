//! Fan-out hub for logtide
//!
//! A single actor task owns the subscriber set. Producers and consumers only
//! talk to it through channels: `register`, `unregister` and `publish`.
//! A subscriber whose outbox fills up is dropped; the publisher never waits.

mod error;
mod hub;
mod subscription;

pub use error::{HubError, Result};
pub use hub::{Hub, HubConfig, HubStats, SubscriberId};
pub use subscription::Subscription;

// Re-export the default payload type
pub use logtide_types::Envelope;
