//! Actor dispatch and remote proxies
//!
//! An Actor is a Service with a mailbox of typed commands. Commands arrive
//! on `<topic>/in` as `(method arg … (kw: val …))` and dispatch through a
//! static table populated at construction. Remote actors are driven
//! through [`RemoteProxy`], which holds only a topic path and the
//! transport, never a direct reference.

use std::collections::HashMap;
use std::time::Duration;

use crate::event_loop::{LoopHandle, Mail};
use crate::service::{Service, ServiceFilter, ServiceRecord};
use crate::sexpr::{self, SMap, SValue};
use crate::transport::{PubSub, SharedTransport};
use crate::{Error, Result};

/// One command: method name plus arguments
///
/// Keyword arguments ride in a trailing `(kw: val …)` mapping. A trailing
/// mapping is not necessarily kwargs (`process_frame` carries its inputs
/// mapping last when no kwargs are present), so parsing keeps every
/// argument positional and [`Invocation::get_kwarg`] resolves keywords by
/// name from the trailing mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Method name to dispatch on
    pub method: String,
    /// Arguments as they appeared on the wire
    pub args: Vec<SValue>,
    /// Keyword arguments staged by the builder; appended as the trailing
    /// mapping at serialization
    kwargs: SMap,
}

impl Invocation {
    /// Start building a command
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
            kwargs: SMap::new(),
        }
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Into<SValue>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Append a keyword argument
    pub fn kwarg(mut self, name: &str, value: impl Into<SValue>) -> Self {
        self.kwargs.insert(SValue::symbol(name), value.into());
        self
    }

    /// Keyword argument by name, from the staged kwargs or the trailing
    /// mapping of a parsed command
    pub fn get_kwarg(&self, name: &str) -> Option<&SValue> {
        if let Some(value) = self.kwargs.get(name) {
            return Some(value);
        }
        self.args
            .last()
            .and_then(SValue::as_map)
            .and_then(|map| map.get(name))
    }

    /// Parse a command payload
    pub fn parse(payload: &str) -> Result<Self> {
        let value = sexpr::parse(payload)?;
        let items = value.as_list().ok_or_else(|| Error::Parse {
            offset: 0,
            reason: "command is not a list".to_string(),
        })?;
        let (method, rest) = items.split_first().ok_or_else(|| Error::Parse {
            offset: 0,
            reason: "command is empty".to_string(),
        })?;
        let method = method
            .as_text()
            .ok_or_else(|| Error::Parse {
                offset: 0,
                reason: "command method is not a symbol".to_string(),
            })?
            .to_string();
        Ok(Self {
            method,
            args: rest.to_vec(),
            kwargs: SMap::new(),
        })
    }

    /// Wire form `(method arg … (kw: val …))`; the kwargs mapping is
    /// omitted when empty
    pub fn to_sexpr(&self) -> SValue {
        let mut items = Vec::with_capacity(self.args.len() + 2);
        items.push(SValue::symbol(&self.method));
        items.extend(self.args.iter().cloned());
        if !self.kwargs.is_empty() {
            items.push(SValue::Map(self.kwargs.clone()));
        }
        SValue::List(items)
    }
}

/// Handler for one method; a `Some` result is published as
/// `(method <result>)` on the actor's out topic
pub type CommandHandler =
    Box<dyn FnMut(&mut Service, &Invocation) -> Result<Option<SValue>> + Send>;

/// A Service with a command dispatch table
pub struct Actor {
    service: Service,
    handlers: HashMap<String, CommandHandler>,
}

impl Actor {
    /// Wrap a service; handlers are added before [`Actor::start`]
    pub fn new(service: Service) -> Self {
        Self {
            service,
            handlers: HashMap::new(),
        }
    }

    /// The underlying service
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Mutable access for setup before start
    pub fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    /// Register the handler for a method name
    pub fn add_handler(
        &mut self,
        method: impl Into<String>,
        handler: impl FnMut(&mut Service, &Invocation) -> Result<Option<SValue>> + Send + 'static,
    ) {
        self.handlers.insert(method.into(), Box::new(handler));
    }

    /// Start the service and attach the dispatcher to the inbound mailbox;
    /// the actor is owned by the event loop from here on
    pub fn start(mut self) -> Result<()> {
        self.service.start()?;
        let loop_handle = self.service.context().loop_handle.clone();
        let in_topic = self.service.topic_path().in_topic();
        loop_handle.add_mailbox_handler(in_topic, move |mail| {
            self.dispatch(mail);
            Ok(())
        });
        Ok(())
    }

    fn dispatch(&mut self, mail: Mail) {
        let invocation = match Invocation::parse(&mail.payload) {
            Ok(invocation) => invocation,
            Err(error) => {
                tracing::warn!(%error, topic = %mail.topic, "unparseable command dropped");
                return;
            }
        };
        let Some(handler) = self.handlers.get_mut(&invocation.method) else {
            tracing::warn!(
                method = %invocation.method,
                topic = %mail.topic,
                "unknown command dropped"
            );
            return;
        };
        match handler(&mut self.service, &invocation) {
            Ok(Some(result)) => {
                let reply = SValue::List(vec![SValue::symbol(&invocation.method), result]);
                let out_topic = self.service.topic_path().out_topic();
                if let Err(error) = self
                    .service
                    .transport()
                    .publish(&out_topic, &reply.to_string(), false)
                {
                    tracing::warn!(%error, topic = out_topic, "reply publish failed");
                }
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(
                    %error,
                    method = %invocation.method,
                    topic = %self.service.topic_path(),
                    "command handler failed"
                );
            }
        }
    }
}

/// Client side of a remote actor: serialize commands and publish them to
/// the remote `<topic>/in`
#[derive(Clone)]
pub struct RemoteProxy {
    topic_path: String,
    transport: SharedTransport,
}

impl std::fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("topic_path", &self.topic_path)
            .finish_non_exhaustive()
    }
}

impl RemoteProxy {
    /// Proxy to a known topic path
    pub fn new(topic_path: impl Into<String>, transport: SharedTransport) -> Self {
        Self {
            topic_path: topic_path.into(),
            transport,
        }
    }

    /// Pick the proxy target from discovery results: zero matches is an
    /// error, more than one picks the first and logs
    pub fn from_records(
        records: &[ServiceRecord],
        filter: &ServiceFilter,
        transport: SharedTransport,
    ) -> Result<Self> {
        let Some(first) = records.first() else {
            return Err(Error::Discovery(format!(
                "no service matches filter {}",
                filter.to_sexpr()
            )));
        };
        if records.len() > 1 {
            tracing::warn!(
                filter = %filter.to_sexpr(),
                count = records.len(),
                chosen = %first.topic_path,
                "ambiguous service filter, using first match"
            );
        }
        Ok(Self::new(first.topic_path.clone(), transport))
    }

    /// Remote topic path this proxy addresses
    pub fn topic_path(&self) -> &str {
        &self.topic_path
    }

    /// Publish one command to the remote inbound topic
    pub fn invoke(&self, invocation: &Invocation) -> Result<()> {
        let in_topic = format!("{}/in", self.topic_path);
        self.transport
            .publish(&in_topic, &invocation.to_sexpr().to_string(), false)
    }

    /// Publish one command after a delay, for callers waiting on a remote
    /// lifecycle to settle
    pub fn invoke_after(&self, loop_handle: &LoopHandle, delay: Duration, invocation: Invocation) {
        let proxy = self.clone();
        let mut pending = Some(invocation);
        loop_handle.add_timer(delay, false, move || {
            if let Some(invocation) = pending.take() {
                if let Err(error) = proxy.invoke(&invocation) {
                    tracing::warn!(%error, topic = %proxy.topic_path, "delayed invoke failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_with_trailing_kwargs() {
        let invocation = Invocation::parse("(process_frame 7 (reply_to: target))").unwrap();
        assert_eq!(invocation.method, "process_frame");
        assert_eq!(invocation.args.len(), 2);
        assert_eq!(
            invocation.get_kwarg("reply_to"),
            Some(&SValue::symbol("target"))
        );
    }

    #[test]
    fn trailing_inputs_mapping_is_not_mistaken_for_kwargs() {
        let invocation =
            Invocation::parse("(process_frame (stream_id: 0 frame_id: 0) (a: 0))").unwrap();
        assert_eq!(invocation.args.len(), 2);
        assert_eq!(
            invocation.args[1].as_map().unwrap().get("a"),
            Some(&SValue::Int(0))
        );
        assert_eq!(invocation.get_kwarg("reply_to"), None);
    }

    #[test]
    fn mid_list_mapping_stays_positional() {
        // (create_stream N (param: value …) grace_time)
        let invocation = Invocation::parse("(create_stream 7 (rate: 20) 10)").unwrap();
        assert_eq!(invocation.args.len(), 3);
        assert_eq!(invocation.get_kwarg("rate"), None);
    }

    #[test]
    fn parse_command_without_kwargs() {
        let invocation = Invocation::parse("(echo \"hi\")").unwrap();
        assert_eq!(invocation.method, "echo");
        assert_eq!(invocation.args, vec![SValue::str("hi")]);
    }

    #[test]
    fn proxy_resolution_policy() {
        use crate::transport::MemoryTransport;
        use std::sync::Arc;

        let transport: SharedTransport = Arc::new(MemoryTransport::new());
        let filter = ServiceFilter::by_name("p_local");
        let record = |topic: &str| ServiceRecord {
            topic_path: topic.to_string(),
            name: "p_local".to_string(),
            owner: "tester".to_string(),
            protocol: "pipeline".to_string(),
            transport: "mqtt".to_string(),
            tags: Vec::new(),
        };

        // Zero matches is a discovery error
        let error = RemoteProxy::from_records(&[], &filter, transport.clone()).unwrap_err();
        assert!(matches!(error, Error::Discovery(_)));

        // More than one picks the first
        let records = [record("aiko/h/1/1"), record("aiko/h/2/1")];
        let proxy = RemoteProxy::from_records(&records, &filter, transport).unwrap();
        assert_eq!(proxy.topic_path(), "aiko/h/1/1");
    }

    #[test]
    fn invocation_round_trip_preserves_wire_form() {
        let invocation = Invocation::new("process_frame")
            .arg(SValue::Int(1))
            .kwarg("reply_to", "aiko/h/1/1/in");
        let text = invocation.to_sexpr().to_string();
        let parsed = Invocation::parse(&text).unwrap();
        assert_eq!(parsed.to_sexpr().to_string(), text);
        assert_eq!(
            parsed.get_kwarg("reply_to"),
            Some(&SValue::str("aiko/h/1/1/in"))
        );
    }

    #[test]
    fn empty_command_rejected() {
        assert!(Invocation::parse("()").is_err());
        assert!(Invocation::parse("42").is_err());
    }
}
