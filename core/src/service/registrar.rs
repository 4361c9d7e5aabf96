//! Registrar: the distinguished service maintaining the set of live
//! services
//!
//! Exactly one registrar per namespace is primary, elected by the
//! retained-message discipline on `<ns>/service/registrar`: the first
//! marker published with retain wins, later starters observe it and stay
//! in standby. An empty retained payload resets the election.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::actor::Actor;
use crate::event_loop::{LoopHandle, Mail};
use crate::service::{Service, ServiceContext, ServiceFilter, ServiceRecord, TopicPath};
use crate::sexpr::{self, SValue};
use crate::transport::{PubSub, SharedTransport, Subscriber};
use crate::Result;

/// How long a starting registrar waits for an existing primary marker
/// before self-promoting
pub const DEFAULT_ELECTION_DELAY: Duration = Duration::from_millis(500);

/// How long a registered service may stay silent on its state topic
/// before it is implicitly removed
pub const DEFAULT_GRACE_TIME: Duration = Duration::from_secs(60);

/// Registrar tuning knobs
#[derive(Debug, Clone)]
pub struct RegistrarOptions {
    /// Election wait before self-promotion
    pub election_delay: Duration,
    /// Implicit-removal grace time
    pub grace_time: Duration,
}

impl Default for RegistrarOptions {
    fn default() -> Self {
        Self {
            election_delay: DEFAULT_ELECTION_DELAY,
            grace_time: DEFAULT_GRACE_TIME,
        }
    }
}

/// Election outcome for this registrar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Waiting for a marker or for the election delay to expire
    Candidate,
    /// Owns the retained marker and answers discovery
    Primary,
    /// Another registrar is primary; tracking the registry passively
    Standby,
}

struct ServiceEntry {
    record: ServiceRecord,
    /// A retained state message has been seen for this service
    alive: bool,
    added_at: Instant,
}

struct RegistrarState {
    role: Role,
    primary: Option<String>,
    services: HashMap<String, ServiceEntry>,
    own_topic: String,
    out_topic: String,
    registrar_topic: String,
    transport: SharedTransport,
    grace_time: Duration,
}

impl RegistrarState {
    fn publish_marker(&self) {
        if let Err(error) =
            self.transport
                .publish(&self.registrar_topic, &self.own_topic, true)
        {
            tracing::warn!(%error, "primary marker publish failed");
        }
    }

    fn add(&mut self, record: ServiceRecord) {
        let topic_path = record.topic_path.clone();
        tracing::debug!(topic = %topic_path, name = %record.name, "service added");
        self.announce("add", record.to_sexpr());
        self.services.insert(
            topic_path,
            ServiceEntry {
                record,
                alive: false,
                added_at: Instant::now(),
            },
        );
    }

    fn remove(&mut self, topic_path: &str) {
        if self.services.remove(topic_path).is_some() {
            tracing::debug!(topic = %topic_path, "service removed");
            self.announce("remove", SValue::str(topic_path));
        }
    }

    /// Primary mirrors registry changes onto its out topic for watchers
    fn announce(&self, event: &str, detail: SValue) {
        if self.role != Role::Primary {
            return;
        }
        let message = SValue::List(vec![SValue::symbol(event), detail]);
        if let Err(error) = self
            .transport
            .publish(&self.out_topic, &message.to_string(), false)
        {
            tracing::warn!(%error, "registry event publish failed");
        }
    }

    fn matching(&self, filter: &ServiceFilter) -> Vec<ServiceRecord> {
        let mut records: Vec<ServiceRecord> = self
            .services
            .values()
            .filter(|entry| filter.matches(&entry.record))
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| a.topic_path.cmp(&b.topic_path));
        records
    }

    fn sweep(&mut self) {
        let expired: Vec<String> = self
            .services
            .iter()
            .filter(|(_, entry)| !entry.alive && entry.added_at.elapsed() > self.grace_time)
            .map(|(topic_path, _)| topic_path.clone())
            .collect();
        for topic_path in expired {
            tracing::info!(topic = %topic_path, "liveness lapsed, removing service");
            self.remove(&topic_path);
        }
    }
}

/// Shared view of a running registrar, for embedding processes and tests
#[derive(Clone)]
pub struct RegistrarHandle {
    state: Arc<Mutex<RegistrarState>>,
}

impl RegistrarHandle {
    /// Current election role
    pub fn role(&self) -> Role {
        self.state.lock().unwrap().role
    }

    /// Topic path of the decided primary, if any
    pub fn primary(&self) -> Option<String> {
        self.state.lock().unwrap().primary.clone()
    }

    /// Snapshot of records matching a filter
    pub fn discover(&self, filter: &ServiceFilter) -> Vec<ServiceRecord> {
        self.state.lock().unwrap().matching(filter)
    }
}

/// Start a registrar on the process event loop
///
/// Subscribes the well-known topic and the namespace state pattern,
/// schedules the election, and registers the `(discover …)` and
/// `(terminate)` commands.
pub fn start(
    context: ServiceContext,
    instance: impl Into<String>,
    options: RegistrarOptions,
) -> Result<RegistrarHandle> {
    let instance = instance.into();
    let namespace = context
        .registrar_topic
        .split('/')
        .next()
        .unwrap_or("aiko")
        .to_string();
    let topic_path = TopicPath::local(namespace.clone(), instance);
    let service = Service::new(
        context.clone(),
        topic_path.clone(),
        "registrar",
        "registrar",
        vec!["ec=true".to_string()],
    );

    let state = Arc::new(Mutex::new(RegistrarState {
        role: Role::Candidate,
        primary: None,
        services: HashMap::new(),
        own_topic: topic_path.to_string(),
        out_topic: topic_path.out_topic(),
        registrar_topic: context.registrar_topic.clone(),
        transport: context.transport.clone(),
        grace_time: options.grace_time,
    }));

    // Election and registry traffic share the well-known topic
    let election_mailbox = format!("{}/election", topic_path);
    context.transport.subscribe(
        &context.registrar_topic,
        Subscriber::new(context.loop_handle.clone(), election_mailbox.clone()),
    )?;
    {
        let state = state.clone();
        let loop_handle = context.loop_handle.clone();
        let election_delay = options.election_delay;
        context
            .loop_handle
            .add_mailbox_handler(election_mailbox, move |mail| {
                handle_registrar_topic(&state, &loop_handle, election_delay, mail);
                Ok(())
            });
    }

    // Retained liveness messages from every service in the namespace
    let liveness_mailbox = format!("{}/liveness", topic_path);
    let state_pattern = format!("{}/+/+/+/state", namespace);
    context.transport.subscribe(
        &state_pattern,
        Subscriber::new(context.loop_handle.clone(), liveness_mailbox.clone()),
    )?;
    {
        let state = state.clone();
        context
            .loop_handle
            .add_mailbox_handler(liveness_mailbox, move |mail| {
                handle_liveness(&state, mail);
                Ok(())
            });
    }

    schedule_election(&state, &context.loop_handle, options.election_delay);

    // Implicit removal of services whose liveness never appeared
    {
        let state = state.clone();
        let sweep_interval = options.grace_time.max(Duration::from_secs(1)) / 2;
        context.loop_handle.add_timer(sweep_interval, true, move || {
            state.lock().unwrap().sweep();
        });
    }

    let mut actor = Actor::new(service);
    {
        let state = state.clone();
        actor.add_handler("discover", move |_service, invocation| {
            let filter = match invocation.args.first() {
                Some(value) => ServiceFilter::from_sexpr(value)?,
                None => ServiceFilter::all(),
            };
            let records = state.lock().unwrap().matching(&filter);
            let reply = SValue::List(vec![
                filter.to_sexpr(),
                SValue::List(records.iter().map(ServiceRecord::to_sexpr).collect()),
            ]);
            Ok(Some(reply))
        });
    }
    {
        let state = state.clone();
        let loop_handle = context.loop_handle.clone();
        actor.add_handler("terminate", move |service, _invocation| {
            let guard = state.lock().unwrap();
            if guard.role == Role::Primary {
                // Give the next registrar a clean election
                let _ = guard.transport.publish(&guard.registrar_topic, "", true);
            }
            drop(guard);
            service.stop()?;
            loop_handle.terminate();
            Ok(None)
        });
    }
    actor.start()?;

    Ok(RegistrarHandle { state })
}

fn schedule_election(
    state: &Arc<Mutex<RegistrarState>>,
    loop_handle: &LoopHandle,
    delay: Duration,
) {
    let state = state.clone();
    loop_handle.add_timer(delay, false, move || {
        let guard = state.lock().unwrap();
        if guard.primary.is_none() {
            tracing::info!(topic = %guard.own_topic, "no primary observed, self-promoting");
            guard.publish_marker();
        }
    });
}

fn handle_registrar_topic(
    state: &Arc<Mutex<RegistrarState>>,
    loop_handle: &LoopHandle,
    election_delay: Duration,
    mail: Mail,
) {
    let payload = mail.payload.trim();
    if payload.is_empty() {
        handle_reset(state, loop_handle, election_delay);
        return;
    }
    if payload.starts_with('(') {
        handle_registry_command(state, payload);
        return;
    }
    handle_marker(state, payload);
}

fn handle_reset(state: &Arc<Mutex<RegistrarState>>, loop_handle: &LoopHandle, delay: Duration) {
    let mut guard = state.lock().unwrap();
    match guard.role {
        Role::Primary => {
            // Someone cleared the marker; re-assert ownership
            guard.publish_marker();
        }
        Role::Candidate | Role::Standby => {
            guard.role = Role::Candidate;
            guard.primary = None;
            drop(guard);
            schedule_election(state, loop_handle, delay);
        }
    }
}

fn handle_marker(state: &Arc<Mutex<RegistrarState>>, marker: &str) {
    let mut guard = state.lock().unwrap();
    match guard.primary.clone() {
        None => {
            // First marker after reset decides the election
            if marker == guard.own_topic {
                tracing::info!(topic = %guard.own_topic, "registrar is primary");
                guard.role = Role::Primary;
            } else {
                tracing::info!(topic = %guard.own_topic, primary = marker, "registrar on standby");
                guard.role = Role::Standby;
            }
            guard.primary = Some(marker.to_string());
        }
        Some(primary) => {
            if guard.role == Role::Primary && marker != guard.own_topic {
                // A late self-promotion overwrote the retained marker
                guard.publish_marker();
            } else if guard.role == Role::Standby && marker != primary {
                guard.primary = Some(marker.to_string());
            }
        }
    }
}

fn handle_registry_command(state: &Arc<Mutex<RegistrarState>>, payload: &str) {
    let parsed = match sexpr::parse(payload) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(%error, "bad registrar message dropped");
            return;
        }
    };
    let Some(items) = parsed.as_list() else {
        return;
    };
    let Some(command) = items.first().and_then(SValue::as_text) else {
        return;
    };
    match command {
        "add" => {
            let Some(record) = items.get(1) else {
                return;
            };
            match ServiceRecord::from_sexpr(record) {
                Ok(record) => state.lock().unwrap().add(record),
                Err(error) => tracing::warn!(%error, "bad service record dropped"),
            }
        }
        "remove" => {
            if let Some(topic_path) = items.get(1).and_then(SValue::as_text) {
                state.lock().unwrap().remove(topic_path);
            }
        }
        other => {
            tracing::debug!(command = other, "registrar topic message ignored");
        }
    }
}

fn handle_liveness(state: &Arc<Mutex<RegistrarState>>, mail: Mail) {
    let Some(topic_path) = mail.topic.strip_suffix("/state") else {
        return;
    };
    let mut guard = state.lock().unwrap();
    if mail.payload.is_empty() {
        // Retained state cleared: the service is gone
        guard.remove(topic_path);
    } else if let Some(entry) = guard.services.get_mut(topic_path) {
        entry.alive = true;
    }
}
