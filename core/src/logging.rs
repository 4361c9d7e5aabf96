//! Logging setup and distributed log shipping
//!
//! Console output goes through `tracing-subscriber`. When `AIKO_LOG_MQTT`
//! selects the bus, a shipping layer forwards each record to the owning
//! service's `<topic>/log` topic as a structured S-expression
//! `(level kind topic stream_id frame_id message)`.

use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::Config;
use crate::sexpr::SValue;
use crate::transport::{PubSub, SharedTransport};

/// Bus destination for shipped log records
pub struct BusTarget {
    /// Broker connection
    pub transport: SharedTransport,
    /// The owning service's log topic
    pub topic: String,
    /// The owning service's topic path, recorded in each log record
    pub topic_path: String,
}

/// Map an `AIKO_LOG_LEVEL` value onto a tracing directive
fn level_directive(level: &str) -> &'static str {
    match level.to_ascii_uppercase().as_str() {
        "ERROR" => "error",
        "WARNING" => "warn",
        "DEBUG" => "debug",
        _ => "info",
    }
}

/// Install the subscriber per `AIKO_LOG_LEVEL` and `AIKO_LOG_MQTT`.
/// Safe to call more than once; later calls are no-ops.
pub fn init(config: &Config, bus: Option<BusTarget>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(&config.log_level)));

    let to_bus = matches!(config.log_mqtt.as_str(), "all" | "true");
    let to_console = !matches!(config.log_mqtt.as_str(), "true");

    let console_layer = to_console.then(tracing_subscriber::fmt::layer);
    let bus_layer = match (to_bus, bus) {
        (true, Some(target)) => Some(BusLayer { target }),
        _ => None,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(bus_layer)
        .try_init();
}

struct BusLayer {
    target: BusTarget,
}

impl<S: tracing::Subscriber> Layer<S> for BusLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        // The transport's own diagnostics must not loop back onto the bus
        if event.metadata().target().starts_with("rumqttc") {
            return;
        }
        let mut fields = RecordFields::default();
        event.record(&mut fields);

        let level = event.metadata().level().as_str().to_ascii_lowercase();
        let kind = fields
            .kind
            .unwrap_or_else(|| event.metadata().target().to_string());
        let record = SValue::List(vec![
            SValue::symbol(level),
            SValue::symbol(kind),
            SValue::str(&self.target.topic_path),
            fields.stream_id.map(SValue::Int).unwrap_or(SValue::Null),
            fields.frame_id.map(SValue::Int).unwrap_or(SValue::Null),
            SValue::str(fields.message.unwrap_or_default()),
        ]);
        let _ = self
            .target
            .transport
            .publish(&self.target.topic, &record.to_string(), false);
    }
}

#[derive(Default)]
struct RecordFields {
    message: Option<String>,
    kind: Option<String>,
    stream_id: Option<i64>,
    frame_id: Option<i64>,
}

impl Visit for RecordFields {
    fn record_i64(&mut self, field: &Field, value: i64) {
        match field.name() {
            "stream_id" => self.stream_id = Some(value),
            "frame_id" => self.frame_id = Some(value),
            _ => {}
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_i64(field, value as i64);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "kind" => self.kind = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_directives() {
        assert_eq!(level_directive("ERROR"), "error");
        assert_eq!(level_directive("warning"), "warn");
        assert_eq!(level_directive("INFO"), "info");
        assert_eq!(level_directive("unknown"), "info");
    }
}
