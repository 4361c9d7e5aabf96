//! Client-side service discovery
//!
//! Each process keeps a local cache of the registry: it follows the
//! primary registrar through the retained marker, pulls a snapshot with a
//! `(discover …)` query, and tracks `(add …)`/`(remove …)` traffic from
//! then on. The retained marker is redelivered after a reconnect, which
//! re-triggers the snapshot query and rebuilds the cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::actor::Invocation;
use crate::event_loop::Mail;
use crate::service::{ServiceContext, ServiceFilter, ServiceRecord};
use crate::sexpr::{self, SValue};
use crate::transport::{PubSub, Subscriber};
use crate::Result;

/// Registry change delivered to a watch handler
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A matching service appeared
    Added(ServiceRecord),
    /// A matching service went away
    Removed(ServiceRecord),
}

/// Cancellation token for a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchId(u64);

type WatchHandler = Box<dyn FnMut(DiscoveryEvent) + Send>;

struct DiscoveryInner {
    context: ServiceContext,
    records: HashMap<String, ServiceRecord>,
    watches: Vec<(WatchId, ServiceFilter, WatchHandler)>,
    next_watch_id: u64,
    primary: Option<String>,
}

impl DiscoveryInner {
    fn insert(&mut self, record: ServiceRecord) {
        let known = self.records.get(&record.topic_path) == Some(&record);
        if known {
            return;
        }
        self.records
            .insert(record.topic_path.clone(), record.clone());
        for (_, filter, handler) in self.watches.iter_mut() {
            if filter.matches(&record) {
                handler(DiscoveryEvent::Added(record.clone()));
            }
        }
    }

    fn remove(&mut self, topic_path: &str) {
        let Some(record) = self.records.remove(topic_path) else {
            return;
        };
        for (_, filter, handler) in self.watches.iter_mut() {
            if filter.matches(&record) {
                handler(DiscoveryEvent::Removed(record.clone()));
            }
        }
    }
}

/// Handle onto the local discovery cache
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<Mutex<DiscoveryInner>>,
}

impl Discovery {
    /// Start following the registry; `mailbox_prefix` must be unique in
    /// this process (callers use their own topic path)
    pub fn start(context: ServiceContext, mailbox_prefix: &str) -> Result<Self> {
        let inner = Arc::new(Mutex::new(DiscoveryInner {
            context: context.clone(),
            records: HashMap::new(),
            watches: Vec::new(),
            next_watch_id: 1,
            primary: None,
        }));
        let discovery = Self { inner };

        let registrar_mailbox = format!("{}/discovery", mailbox_prefix);
        context.transport.subscribe(
            &context.registrar_topic,
            Subscriber::new(context.loop_handle.clone(), registrar_mailbox.clone()),
        )?;
        {
            let discovery = discovery.clone();
            let events_mailbox = format!("{}/discovery_events", mailbox_prefix);
            context
                .loop_handle
                .add_mailbox_handler(registrar_mailbox, move |mail| {
                    discovery.handle_registrar_topic(mail, &events_mailbox);
                    Ok(())
                });
        }
        {
            let discovery = discovery.clone();
            let events_mailbox = format!("{}/discovery_events", mailbox_prefix);
            context
                .loop_handle
                .add_mailbox_handler(events_mailbox, move |mail| {
                    discovery.handle_registry_event(&mail.payload);
                    Ok(())
                });
        }
        Ok(discovery)
    }

    /// Snapshot of cached records matching a filter
    pub fn discover(&self, filter: &ServiceFilter) -> Vec<ServiceRecord> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<ServiceRecord> = inner
            .records
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.topic_path.cmp(&b.topic_path));
        records
    }

    /// Call `handler` for every future add/remove matching the filter,
    /// and immediately for services already cached
    pub fn watch(
        &self,
        filter: ServiceFilter,
        mut handler: impl FnMut(DiscoveryEvent) + Send + 'static,
    ) -> WatchId {
        let mut inner = self.inner.lock().unwrap();
        for record in inner.records.values() {
            if filter.matches(record) {
                handler(DiscoveryEvent::Added(record.clone()));
            }
        }
        let id = WatchId(inner.next_watch_id);
        inner.next_watch_id += 1;
        inner.watches.push((id, filter, Box::new(handler)));
        id
    }

    /// Cancel a watch
    pub fn unwatch(&self, id: WatchId) {
        self.inner
            .lock()
            .unwrap()
            .watches
            .retain(|(watch_id, _, _)| *watch_id != id);
    }

    /// Topic path of the primary registrar being followed, if known
    pub fn primary(&self) -> Option<String> {
        self.inner.lock().unwrap().primary.clone()
    }

    fn handle_registrar_topic(&self, mail: Mail, events_mailbox: &str) {
        let payload = mail.payload.trim();
        if payload.is_empty() {
            self.inner.lock().unwrap().primary = None;
            return;
        }
        if payload.starts_with('(') {
            self.handle_registry_event(payload);
            return;
        }
        self.follow_primary(payload, events_mailbox);
    }

    /// A (possibly redelivered) primary marker: subscribe its out topic
    /// when it changed and always re-pull the snapshot
    fn follow_primary(&self, marker: &str, events_mailbox: &str) {
        let (context, changed) = {
            let mut inner = self.inner.lock().unwrap();
            let changed = inner.primary.as_deref() != Some(marker);
            inner.primary = Some(marker.to_string());
            (inner.context.clone(), changed)
        };
        if changed {
            let out_topic = format!("{}/out", marker);
            if let Err(error) = context.transport.subscribe(
                &out_topic,
                Subscriber::new(context.loop_handle.clone(), events_mailbox.to_string()),
            ) {
                tracing::warn!(%error, topic = out_topic, "primary out subscribe failed");
            }
        }
        let query = Invocation::new("discover").arg(ServiceFilter::all().to_sexpr());
        let in_topic = format!("{}/in", marker);
        if let Err(error) = context
            .transport
            .publish(&in_topic, &query.to_sexpr().to_string(), false)
        {
            tracing::warn!(%error, topic = in_topic, "snapshot query failed");
        }
    }

    fn handle_registry_event(&self, payload: &str) {
        let parsed = match sexpr::parse(payload) {
            Ok(value) => value,
            Err(_) => return,
        };
        let Some(items) = parsed.as_list() else {
            return;
        };
        let Some(head) = items.first().and_then(SValue::as_text) else {
            return;
        };
        match head {
            "add" => {
                if let Some(value) = items.get(1) {
                    if let Ok(record) = ServiceRecord::from_sexpr(value) {
                        self.inner.lock().unwrap().insert(record);
                    }
                }
            }
            "remove" => {
                if let Some(topic_path) = items.get(1).and_then(SValue::as_text) {
                    self.inner.lock().unwrap().remove(topic_path);
                }
            }
            "discover" => {
                // Reply shape: (discover (<filter> (<record> …)))
                let records = items
                    .get(1)
                    .and_then(SValue::as_list)
                    .and_then(|reply| reply.get(1))
                    .and_then(SValue::as_list);
                let Some(records) = records else {
                    return;
                };
                let mut inner = self.inner.lock().unwrap();
                for value in records {
                    if let Ok(record) = ServiceRecord::from_sexpr(value) {
                        inner.insert(record);
                    }
                }
            }
            _ => {}
        }
    }
}
