//! Service identity, discovery records, and lifecycle
//!
//! A Service is anything addressable on the bus: it owns a topic path,
//! a state machine, and a set of `key=value` tags, and it announces itself
//! to the Registrar on startup.

pub mod discovery;
pub mod registrar;

use std::fmt;

use crate::event_loop::LoopHandle;
use crate::sexpr::SValue;
use crate::transport::{PubSub, SharedTransport, Subscriber};
use crate::{Error, Result};

/// Hierarchical address of one service:
/// `<namespace>/<host>/<process-id>/<instance>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPath {
    /// Namespace every topic in the deployment shares
    pub namespace: String,
    /// Host name segment
    pub host: String,
    /// Process id segment
    pub pid: u32,
    /// Distinguishes services sharing a process
    pub instance: String,
}

impl TopicPath {
    /// Topic path for a service in this process
    pub fn local(namespace: impl Into<String>, instance: impl Into<String>) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            namespace: namespace.into(),
            host,
            pid: std::process::id(),
            instance: instance.into(),
        }
    }

    /// Parse `ns/host/pid/instance`
    pub fn parse(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.split('/').collect();
        let [namespace, host, pid, instance] = parts.as_slice() else {
            return Err(Error::Invariant(format!("malformed topic path: {}", text)));
        };
        let pid = pid
            .parse::<u32>()
            .map_err(|_| Error::Invariant(format!("malformed topic path pid: {}", text)))?;
        Ok(Self {
            namespace: namespace.to_string(),
            host: host.to_string(),
            pid,
            instance: instance.to_string(),
        })
    }

    /// Inbound command channel
    pub fn in_topic(&self) -> String {
        format!("{}/in", self)
    }

    /// Outbound reply/event channel
    pub fn out_topic(&self) -> String {
        format!("{}/out", self)
    }

    /// Retained liveness channel
    pub fn state_topic(&self) -> String {
        format!("{}/state", self)
    }

    /// Distributed log channel
    pub fn log_topic(&self) -> String {
        format!("{}/log", self)
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.namespace, self.host, self.pid, self.instance
        )
    }
}

/// Service lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Created, not yet announced
    Starting,
    /// Announced and serving
    Running,
    /// Shutdown in progress
    Stopping,
    /// Removed from the bus
    Stopped,
}

impl ServiceState {
    /// Lowercase tag used on the state topic and in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        }
    }
}

/// Discovery record describing one live service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRecord {
    /// Bus address; actors reference each other only by this string
    pub topic_path: String,
    /// Service name
    pub name: String,
    /// Owner (user or deployment) the service runs as
    pub owner: String,
    /// Protocol identifier the service speaks
    pub protocol: String,
    /// Transport identifier (always `mqtt` on the wire today)
    pub transport: String,
    /// `key=value` tags for filtered discovery
    pub tags: Vec<String>,
}

impl ServiceRecord {
    /// Wire form: `(topic name owner protocol transport (tag …))`
    pub fn to_sexpr(&self) -> SValue {
        SValue::List(vec![
            SValue::str(&self.topic_path),
            SValue::str(&self.name),
            SValue::str(&self.owner),
            SValue::str(&self.protocol),
            SValue::str(&self.transport),
            SValue::List(self.tags.iter().map(SValue::str).collect()),
        ])
    }

    /// Parse the wire form back into a record
    pub fn from_sexpr(value: &SValue) -> Result<Self> {
        let items = value
            .as_list()
            .ok_or_else(|| Error::Discovery("service record is not a list".to_string()))?;
        let [topic_path, name, owner, protocol, transport, tags] = items else {
            return Err(Error::Discovery(format!(
                "service record needs 6 fields, found {}",
                items.len()
            )));
        };
        let field = |value: &SValue, what: &str| -> Result<String> {
            value
                .as_text()
                .map(str::to_string)
                .ok_or_else(|| Error::Discovery(format!("service record {} is not text", what)))
        };
        let tags = tags
            .as_list()
            .ok_or_else(|| Error::Discovery("service record tags are not a list".to_string()))?
            .iter()
            .map(|t| field(t, "tag"))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            topic_path: field(topic_path, "topic path")?,
            name: field(name, "name")?,
            owner: field(owner, "owner")?,
            protocol: field(protocol, "protocol")?,
            transport: field(transport, "transport")?,
            tags,
        })
    }

    /// Value of a tag by key, if present
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.iter().find_map(|tag| {
            let (k, v) = tag.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

/// Discovery query: the shape of a record with `*` wildcards
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceFilter {
    /// Topic path or `*`
    pub topic_path: String,
    /// Name or `*`
    pub name: String,
    /// Owner or `*`
    pub owner: String,
    /// Protocol or `*`
    pub protocol: String,
    /// Transport or `*`
    pub transport: String,
    /// Required tags; each `key=value` must be present on the record
    pub tags: Vec<String>,
}

impl Default for ServiceFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl ServiceFilter {
    /// Filter matching every service
    pub fn all() -> Self {
        Self {
            topic_path: "*".to_string(),
            name: "*".to_string(),
            owner: "*".to_string(),
            protocol: "*".to_string(),
            transport: "*".to_string(),
            tags: Vec::new(),
        }
    }

    /// Filter matching services by name
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::all()
        }
    }

    /// True when the record satisfies every non-wildcard field and carries
    /// every filter tag
    pub fn matches(&self, record: &ServiceRecord) -> bool {
        let field = |filter: &str, value: &str| filter == "*" || filter == value;
        field(&self.topic_path, &record.topic_path)
            && field(&self.name, &record.name)
            && field(&self.owner, &record.owner)
            && field(&self.protocol, &record.protocol)
            && field(&self.transport, &record.transport)
            && self.tags.iter().all(|tag| record.tags.contains(tag))
    }

    /// Wire form mirrors the record shape with `*` symbols
    pub fn to_sexpr(&self) -> SValue {
        let field = |text: &str| {
            if text == "*" {
                SValue::symbol("*")
            } else {
                SValue::str(text)
            }
        };
        SValue::List(vec![
            field(&self.topic_path),
            field(&self.name),
            field(&self.owner),
            field(&self.protocol),
            field(&self.transport),
            SValue::List(self.tags.iter().map(SValue::str).collect()),
        ])
    }

    /// Parse the wire form back into a filter
    pub fn from_sexpr(value: &SValue) -> Result<Self> {
        let record = ServiceRecord::from_sexpr(value)?;
        Ok(Self {
            topic_path: record.topic_path,
            name: record.name,
            owner: record.owner,
            protocol: record.protocol,
            transport: record.transport,
            tags: record.tags,
        })
    }
}

/// Construction context shared by every service in a process
#[derive(Clone)]
pub struct ServiceContext {
    /// Event loop of this process
    pub loop_handle: LoopHandle,
    /// Broker connection of this process
    pub transport: SharedTransport,
    /// Well-known registrar topic (`<ns>/service/registrar`)
    pub registrar_topic: String,
}

impl ServiceContext {
    /// Bundle the per-process singletons
    pub fn new(
        loop_handle: LoopHandle,
        transport: SharedTransport,
        registrar_topic: impl Into<String>,
    ) -> Self {
        Self {
            loop_handle,
            transport,
            registrar_topic: registrar_topic.into(),
        }
    }
}

/// One bus-addressable component
pub struct Service {
    context: ServiceContext,
    topic_path: TopicPath,
    record: ServiceRecord,
    state: ServiceState,
}

impl Service {
    /// Create a service in the `Starting` state
    pub fn new(
        context: ServiceContext,
        topic_path: TopicPath,
        name: impl Into<String>,
        protocol: impl Into<String>,
        tags: Vec<String>,
    ) -> Self {
        let owner = std::env::var("USER").unwrap_or_else(|_| "aiko".to_string());
        let record = ServiceRecord {
            topic_path: topic_path.to_string(),
            name: name.into(),
            owner,
            protocol: protocol.into(),
            transport: "mqtt".to_string(),
            tags,
        };
        Self {
            context,
            topic_path,
            record,
            state: ServiceState::Starting,
        }
    }

    /// This service's topic path
    pub fn topic_path(&self) -> &TopicPath {
        &self.topic_path
    }

    /// This service's discovery record
    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Shared process context
    pub fn context(&self) -> &ServiceContext {
        &self.context
    }

    /// Broker connection
    pub fn transport(&self) -> &SharedTransport {
        &self.context.transport
    }

    /// Add a `key=value` tag; refreshes the retained state when running
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.record.tags.push(tag.into());
        if self.state == ServiceState::Running {
            self.publish_state();
        }
    }

    /// Subscribe the inbound channel, publish liveness, announce to the
    /// registrar, and enter `Running`
    pub fn start(&mut self) -> Result<()> {
        let in_topic = self.topic_path.in_topic();
        self.context.transport.subscribe(
            &in_topic,
            Subscriber::new(self.context.loop_handle.clone(), in_topic.clone()),
        )?;

        // Announce first: the registrar must hold the record before the
        // liveness message lands, or the entry never counts as alive
        let announce = SValue::List(vec![SValue::symbol("add"), self.record.to_sexpr()]);
        self.context
            .transport
            .publish(&self.context.registrar_topic, &announce.to_string(), false)?;

        self.state = ServiceState::Running;
        self.publish_state();
        Ok(())
    }

    /// Retract the service: `(remove …)` to the registrar, clear the
    /// retained liveness message, drop the inbound subscription
    pub fn stop(&mut self) -> Result<()> {
        if self.state == ServiceState::Stopped {
            return Ok(());
        }
        self.state = ServiceState::Stopping;

        let retract = SValue::List(vec![
            SValue::symbol("remove"),
            SValue::str(self.topic_path.to_string()),
        ]);
        self.context
            .transport
            .publish(&self.context.registrar_topic, &retract.to_string(), false)?;
        self.context
            .transport
            .publish(&self.topic_path.state_topic(), "", true)?;
        self.context
            .transport
            .unsubscribe(&self.topic_path.in_topic())?;

        self.state = ServiceState::Stopped;
        Ok(())
    }

    fn publish_state(&self) {
        let state: SValue = [(
            SValue::symbol("state"),
            SValue::symbol(self.state.as_str()),
        )]
        .into_iter()
        .collect::<crate::sexpr::SMap>()
        .into();
        if let Err(error) =
            self.context
                .transport
                .publish(&self.topic_path.state_topic(), &state.to_string(), true)
        {
            tracing::warn!(%error, topic = %self.topic_path, "liveness publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_path_round_trip() {
        let path = TopicPath::parse("aiko/h/1000/1").unwrap();
        assert_eq!(path.namespace, "aiko");
        assert_eq!(path.pid, 1000);
        assert_eq!(path.to_string(), "aiko/h/1000/1");
        assert_eq!(path.in_topic(), "aiko/h/1000/1/in");
        assert_eq!(path.log_topic(), "aiko/h/1000/1/log");
    }

    #[test]
    fn malformed_topic_path_rejected() {
        assert!(TopicPath::parse("aiko/h/1").is_err());
        assert!(TopicPath::parse("aiko/h/not_a_pid/1").is_err());
    }

    #[test]
    fn record_sexpr_round_trip() {
        let record = ServiceRecord {
            topic_path: "aiko/h/1/1".to_string(),
            name: "p_local".to_string(),
            owner: "tester".to_string(),
            protocol: "pipeline".to_string(),
            transport: "mqtt".to_string(),
            tags: vec!["ec=true".to_string()],
        };
        let parsed = ServiceRecord::from_sexpr(&record.to_sexpr()).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.tag("ec"), Some("true"));
    }

    #[test]
    fn filter_wildcards_and_tags() {
        let record = ServiceRecord {
            topic_path: "aiko/h/1/1".to_string(),
            name: "p_local".to_string(),
            owner: "tester".to_string(),
            protocol: "pipeline".to_string(),
            transport: "mqtt".to_string(),
            tags: vec!["a=1".to_string(), "b=2".to_string()],
        };
        assert!(ServiceFilter::all().matches(&record));
        assert!(ServiceFilter::by_name("p_local").matches(&record));
        assert!(!ServiceFilter::by_name("other").matches(&record));

        let mut tagged = ServiceFilter::all();
        tagged.tags = vec!["a=1".to_string()];
        assert!(tagged.matches(&record));
        tagged.tags = vec!["a=1".to_string(), "c=3".to_string()];
        assert!(!tagged.matches(&record));
    }

    #[test]
    fn filter_sexpr_round_trip() {
        let filter = ServiceFilter::by_name("p_local");
        let parsed = ServiceFilter::from_sexpr(&filter.to_sexpr()).unwrap();
        assert_eq!(parsed, filter);
    }
}
