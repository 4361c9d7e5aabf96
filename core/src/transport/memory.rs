//! In-process broker
//!
//! Implements [`PubSub`] without a network: subscriptions, retained
//! messages, and wildcard matching behave like the MQTT broker, with
//! delivery ordered by publish order per topic. Tests and headless
//! single-process pipelines run against this transport.

use std::sync::Mutex;

use super::{topic_matches, PubSub, Subscriber};
use crate::event_loop::Mail;
use crate::Result;

#[derive(Default)]
struct BrokerState {
    subscriptions: Vec<(String, Subscriber)>,
    retained: Vec<(String, String)>,
}

/// In-memory [`PubSub`] implementation
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<BrokerState>,
}

impl MemoryTransport {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Retained payload currently stored for a topic, if any
    pub fn retained(&self, topic: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .retained
            .iter()
            .find_map(|(t, p)| (t == topic).then(|| p.clone()))
    }
}

impl PubSub for MemoryTransport {
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if retain {
            state.retained.retain(|(t, _)| t != topic);
            // An empty retained payload clears the retained message
            if !payload.is_empty() {
                state.retained.push((topic.to_string(), payload.to_string()));
            }
        }
        for (pattern, subscriber) in &state.subscriptions {
            if topic_matches(pattern, topic) {
                subscriber
                    .handle
                    .post(&subscriber.mailbox, Mail::new(topic, payload));
            }
        }
        Ok(())
    }

    fn subscribe(&self, pattern: &str, subscriber: Subscriber) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        // Retained messages are delivered immediately on subscription
        for (topic, payload) in &state.retained {
            if topic_matches(pattern, topic) {
                subscriber
                    .handle
                    .post(&subscriber.mailbox, Mail::new(topic.clone(), payload.clone()));
            }
        }
        state.subscriptions.push((pattern.to_string(), subscriber));
        Ok(())
    }

    fn unsubscribe(&self, pattern: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.subscriptions.retain(|(p, _)| p != pattern);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::{Arc, Mutex};

    async fn drain(handle: crate::event_loop::LoopHandle, event_loop: EventLoop) {
        let done = handle.clone();
        handle.spawn(move || done.terminate());
        event_loop.run().await;
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscriber() {
        let broker = MemoryTransport::new();
        let (event_loop, handle) = EventLoop::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            handle.add_mailbox_handler("sub", move |mail| {
                seen.lock().unwrap().push((mail.topic, mail.payload));
                Ok(())
            });
        }
        broker
            .subscribe("aiko/+/in", Subscriber::new(handle.clone(), "sub"))
            .unwrap();
        broker.publish("aiko/a/in", "(hello)", false).unwrap();
        broker.publish("aiko/a/out", "(ignored)", false).unwrap();

        drain(handle, event_loop).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("aiko/a/in".to_string(), "(hello)".to_string())]
        );
    }

    #[tokio::test]
    async fn retained_message_delivered_on_subscribe() {
        let broker = MemoryTransport::new();
        broker.publish("ns/service/registrar", "ns/h/1/1", true).unwrap();

        let (event_loop, handle) = EventLoop::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            handle.add_mailbox_handler("sub", move |mail| {
                seen.lock().unwrap().push(mail.payload);
                Ok(())
            });
        }
        broker
            .subscribe("ns/service/registrar", Subscriber::new(handle.clone(), "sub"))
            .unwrap();

        drain(handle, event_loop).await;
        assert_eq!(*seen.lock().unwrap(), vec!["ns/h/1/1".to_string()]);
    }

    #[tokio::test]
    async fn empty_retained_publish_clears_marker() {
        let broker = MemoryTransport::new();
        broker.publish("ns/service/registrar", "ns/h/1/1", true).unwrap();
        broker.publish("ns/service/registrar", "", true).unwrap();
        assert_eq!(broker.retained("ns/service/registrar"), None);
    }
}
