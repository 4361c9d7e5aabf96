//! Publish/subscribe transport
//!
//! The [`PubSub`] trait is the seam between the runtime and the broker.
//! [`MqttTransport`] is the wire implementation; [`MemoryTransport`] is an
//! in-process broker with the same retained-message and wildcard semantics,
//! used by tests and headless single-process pipelines.
//!
//! Inbound deliveries never call user code directly: every subscriber is a
//! mailbox on an event loop, so transport threads only post.

mod memory;
mod mqtt;

pub use memory::MemoryTransport;
pub use mqtt::{MqttDriver, MqttTransport};

use std::sync::Arc;

use crate::event_loop::LoopHandle;
use crate::Result;

/// Where a subscription delivers: a mailbox on an event loop
#[derive(Clone)]
pub struct Subscriber {
    /// Loop that owns the mailbox
    pub handle: LoopHandle,
    /// Mailbox name mail is posted to
    pub mailbox: String,
}

impl Subscriber {
    /// Build a subscriber for `mailbox` on the given loop
    pub fn new(handle: LoopHandle, mailbox: impl Into<String>) -> Self {
        Self {
            handle,
            mailbox: mailbox.into(),
        }
    }
}

/// Publish/subscribe client surface
pub trait PubSub: Send + Sync {
    /// Publish a payload; `retain` keeps the last value for new subscribers
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()>;

    /// Subscribe a mailbox to a topic pattern (`+`/`#` wildcards allowed);
    /// a retained message matching the pattern is delivered immediately
    fn subscribe(&self, pattern: &str, subscriber: Subscriber) -> Result<()>;

    /// Drop every subscriber registered for the pattern
    fn unsubscribe(&self, pattern: &str) -> Result<()>;
}

/// Shared transport handle passed to every service
pub type SharedTransport = Arc<dyn PubSub>;

/// Match a topic against a subscription pattern
///
/// Hierarchical `/` topics; `+` matches exactly one segment, `#` matches
/// the remaining tail and must be the final segment.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_topic_match() {
        assert!(topic_matches("aiko/h/1/1/in", "aiko/h/1/1/in"));
        assert!(!topic_matches("aiko/h/1/1/in", "aiko/h/1/1/out"));
        assert!(!topic_matches("aiko/h/1/1", "aiko/h/1/1/in"));
    }

    #[test]
    fn plus_matches_one_segment() {
        assert!(topic_matches("aiko/+/1/1/in", "aiko/h/1/1/in"));
        assert!(!topic_matches("aiko/+/in", "aiko/h/1/1/in"));
        assert!(topic_matches("+/service/registrar", "aiko/service/registrar"));
    }

    #[test]
    fn hash_matches_tail() {
        assert!(topic_matches("aiko/#", "aiko/h/1/1/in"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(topic_matches("aiko/h/#", "aiko/h/1"));
        assert!(!topic_matches("aiko/x/#", "aiko/h/1"));
    }
}
