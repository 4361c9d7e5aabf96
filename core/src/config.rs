//! Runtime configuration
//!
//! Configuration is loaded from environment variables. Every field has a
//! default, so a bare `Config::from_env()` connects to a broker on
//! localhost:1883 under the `aiko` namespace.

use serde::{Deserialize, Serialize};

/// Default MQTT port without TLS
pub const MQTT_PORT: u16 = 1883;

/// Default MQTT port with TLS
pub const MQTT_PORT_TLS: u16 = 8883;

/// Runtime configuration shared by every process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Broker host name
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,

    /// Broker port (1883, or 8883 when TLS is enabled)
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,

    /// Connect over TLS
    #[serde(default)]
    pub mqtt_tls: bool,

    /// Topic namespace every topic path starts with
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Log level: ERROR, WARNING, INFO, or DEBUG
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Where log records go: "all" (console and bus), "true" (bus only),
    /// "false" (console only)
    #[serde(default = "default_log_mqtt")]
    pub log_mqtt: String,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    MQTT_PORT
}

fn default_namespace() -> String {
    "aiko".to_string()
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_mqtt() -> String {
    "false".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_host: default_mqtt_host(),
            mqtt_port: default_mqtt_port(),
            mqtt_tls: false,
            namespace: default_namespace(),
            log_level: default_log_level(),
            log_mqtt: default_log_mqtt(),
        }
    }
}

impl Config {
    /// Load configuration from `AIKO_*` environment variables
    pub fn from_env() -> Self {
        let mqtt_tls = std::env::var("AIKO_MQTT_TLS")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            mqtt_host: std::env::var("AIKO_MQTT_HOST").unwrap_or_else(|_| default_mqtt_host()),
            mqtt_port: if mqtt_tls { MQTT_PORT_TLS } else { MQTT_PORT },
            mqtt_tls,
            namespace: std::env::var("AIKO_NAMESPACE").unwrap_or_else(|_| default_namespace()),
            log_level: std::env::var("AIKO_LOG_LEVEL").unwrap_or_else(|_| default_log_level()),
            log_mqtt: std::env::var("AIKO_LOG_MQTT").unwrap_or_else(|_| default_log_mqtt()),
        }
    }

    /// Well-known registrar topic for this namespace
    pub fn registrar_topic(&self) -> String {
        format!("{}/service/registrar", self.namespace)
    }
}
