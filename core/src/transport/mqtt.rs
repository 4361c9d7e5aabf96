//! MQTT transport
//!
//! Wraps `rumqttc` behind the [`PubSub`] trait. A background driver task
//! owns the rumqttc event loop: it forwards publish/subscribe requests,
//! routes inbound publishes into subscriber mailboxes, and reconnects with
//! exponential backoff. On reconnect every outstanding pattern is
//! re-subscribed before any new inbound message is delivered.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;

use super::{topic_matches, PubSub, Subscriber};
use crate::config::Config;
use crate::event_loop::Mail;
use crate::{Error, Result};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Consecutive poll failures tolerated before the driver gives up
pub const DEFAULT_MAX_FAILURES: u32 = 10;

enum Request {
    Publish {
        topic: String,
        payload: String,
        retain: bool,
    },
    Subscribe(String),
    Unsubscribe(String),
}

/// MQTT-backed [`PubSub`] implementation
pub struct MqttTransport {
    requests: mpsc::UnboundedSender<Request>,
    subscriptions: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl MqttTransport {
    /// Build the client and its driver; the caller spawns
    /// [`MqttDriver::run`] and watches it for fatal transport failure
    pub fn connect(config: &Config, client_id: &str) -> (Arc<Self>, MqttDriver) {
        let mut options = MqttOptions::new(client_id, &config.mqtt_host, config.mqtt_port);
        options.set_keep_alive(Duration::from_secs(5));
        if config.mqtt_tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, event_loop) = AsyncClient::new(options, 64);
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            requests: tx,
            subscriptions: Mutex::new(HashMap::new()),
        });
        let driver = MqttDriver {
            client,
            event_loop,
            requests: rx,
            transport: transport.clone(),
            max_failures: DEFAULT_MAX_FAILURES,
        };
        (transport, driver)
    }

    fn send(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| Error::Transport("MQTT driver is gone".to_string()))
    }
}

impl PubSub for MqttTransport {
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        self.send(Request::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
        })
    }

    fn subscribe(&self, pattern: &str, subscriber: Subscriber) -> Result<()> {
        let is_new = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            let subscribers = subscriptions.entry(pattern.to_string()).or_default();
            subscribers.push(subscriber);
            subscribers.len() == 1
        };
        if is_new {
            self.send(Request::Subscribe(pattern.to_string()))?;
        }
        Ok(())
    }

    fn unsubscribe(&self, pattern: &str) -> Result<()> {
        self.subscriptions.lock().unwrap().remove(pattern);
        self.send(Request::Unsubscribe(pattern.to_string()))
    }
}

/// Background task driving the MQTT connection
pub struct MqttDriver {
    client: AsyncClient,
    event_loop: rumqttc::EventLoop,
    requests: mpsc::UnboundedReceiver<Request>,
    transport: Arc<MqttTransport>,
    max_failures: u32,
}

impl MqttDriver {
    /// Override the consecutive-failure limit
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    /// Drive the connection until the transport is dropped or the broker
    /// stays unreachable past the failure limit
    pub async fn run(mut self) -> Result<()> {
        enum Wake {
            Request(Option<Request>),
            Event(std::result::Result<Event, rumqttc::ConnectionError>),
        }
        let mut failures: u32 = 0;
        loop {
            let wake = tokio::select! {
                request = self.requests.recv() => Wake::Request(request),
                event = self.event_loop.poll() => Wake::Event(event),
            };
            match wake {
                Wake::Request(None) => return Ok(()),
                Wake::Request(Some(request)) => self.handle_request(request).await,
                Wake::Event(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    failures = 0;
                    self.resubscribe().await;
                }
                Wake::Event(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                    self.deliver(&publish.topic, payload);
                }
                Wake::Event(Ok(_)) => {}
                Wake::Event(Err(error)) => {
                    failures += 1;
                    if failures > self.max_failures {
                        return Err(Error::Transport(format!(
                            "broker unreachable after {} attempts: {}",
                            failures, error
                        )));
                    }
                    let delay = backoff_delay(failures);
                    tracing::warn!(
                        %error,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "MQTT connection lost, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn handle_request(&mut self, request: Request) {
        let result = match request {
            Request::Publish {
                topic,
                payload,
                retain,
            } => {
                self.client
                    .publish(topic, QoS::AtMostOnce, retain, payload)
                    .await
            }
            Request::Subscribe(pattern) => self.client.subscribe(pattern, QoS::AtMostOnce).await,
            Request::Unsubscribe(pattern) => self.client.unsubscribe(pattern).await,
        };
        if let Err(error) = result {
            tracing::warn!(%error, "MQTT request failed");
        }
    }

    /// Replay the subscription table after (re)connecting; the broker only
    /// delivers new inbound messages once these are processed, so every
    /// pattern is live before delivery resumes
    async fn resubscribe(&mut self) {
        let patterns: Vec<String> = {
            let subscriptions = self.transport.subscriptions.lock().unwrap();
            subscriptions.keys().cloned().collect()
        };
        for pattern in patterns {
            if let Err(error) = self.client.subscribe(&pattern, QoS::AtMostOnce).await {
                tracing::warn!(%error, pattern, "re-subscribe failed");
            }
        }
    }

    fn deliver(&self, topic: &str, payload: String) {
        let subscriptions = self.transport.subscriptions.lock().unwrap();
        for (pattern, subscribers) in subscriptions.iter() {
            if topic_matches(pattern, topic) {
                for subscriber in subscribers {
                    subscriber
                        .handle
                        .post(&subscriber.mailbox, Mail::new(topic, payload.clone()));
                }
            }
        }
    }
}

/// Exponential backoff: base 1 s doubling to a 30 s cap, ±20% jitter
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(5);
    let base = BACKOFF_BASE * 2u32.pow(exponent);
    let capped = base.min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    capped.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        for attempt in 1..12 {
            let delay = backoff_delay(attempt);
            assert!(delay >= Duration::from_millis(800), "attempt {}", attempt);
            assert!(delay <= Duration::from_secs(36), "attempt {}", attempt);
        }
        // Deep into retries the delay sits at the cap, modulo jitter
        let late = backoff_delay(20);
        assert!(late >= Duration::from_secs(24));
    }
}
