//! Pipeline actor
//!
//! A Pipeline is an Actor whose commands are `create_stream`,
//! `process_frame`, `destroy_stream`, and `terminate`. Frames traverse the
//! element graph in topological order on the process event loop; remote
//! elements park the frame until their reply command resumes it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::actor::{Actor, Invocation, RemoteProxy};
use crate::pipeline::definition::{
    self, DeployDefinition, ElementDefinition, PipelineDefinition,
};
use crate::pipeline::element::{ElementRegistry, PipelineElement};
use crate::pipeline::elements::Metrics;
use crate::pipeline::graph::PipelineGraph;
use crate::service::discovery::{Discovery, DiscoveryEvent};
use crate::service::{Service, ServiceContext, ServiceFilter, TopicPath};
use crate::sexpr::{SMap, SValue};
use crate::stream::{Frame, Stream, StreamEvent, StreamState};
use crate::transport::{PubSub, SharedTransport};
use crate::{Error, Result};

/// Grace time given to streams auto-created by a bare `process_frame`;
/// zero means the stream is never reclaimed by the idle sweep
pub const DEFAULT_STREAM_GRACE: f64 = 0.0;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

enum ElementKind {
    Local(Box<dyn PipelineElement>),
    Remote {
        filter: ServiceFilter,
        proxy: Option<RemoteProxy>,
    },
}

struct ElementSlot {
    definition: ElementDefinition,
    kind: ElementKind,
}

struct StreamSlot {
    stream: Stream,
    frames_done: i64,
    last_frame_at: Instant,
    /// Sliding-window FIFO per inbound edge of each join element
    windows: HashMap<(String, String), VecDeque<SMap>>,
}

struct PendingFrame {
    frame: Frame,
    /// Name of the remote element the frame is parked at
    parked_at: String,
    /// Traversal index to continue from
    resume_at: usize,
    reply_to: Option<String>,
    durations: Vec<(String, i64)>,
}

struct PipelineState {
    graph: PipelineGraph,
    order: Vec<String>,
    tail: String,
    elements: HashMap<String, ElementSlot>,
    streams: HashMap<i64, StreamSlot>,
    pending: HashMap<(i64, i64), PendingFrame>,
    pipeline_parameters: SMap,
    /// Name of the Metrics element, when the graph carries one
    metrics_element: Option<String>,
    sliding_window: bool,
    topic_path: TopicPath,
    transport: SharedTransport,
}

/// Shared view of a running pipeline, for embedding processes and tests
#[derive(Clone)]
pub struct PipelineHandle {
    state: Arc<Mutex<PipelineState>>,
}

impl PipelineHandle {
    /// This pipeline's topic path
    pub fn topic_path(&self) -> TopicPath {
        self.state.lock().unwrap().topic_path.clone()
    }

    /// Lifecycle state of one stream
    pub fn stream_state(&self, stream_id: i64) -> Option<StreamState> {
        self.state
            .lock()
            .unwrap()
            .streams
            .get(&stream_id)
            .map(|slot| slot.stream.state)
    }

    /// Ids of live streams
    pub fn stream_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.state.lock().unwrap().streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Count of frames parked on remote elements
    pub fn pending_frames(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Count of remote elements with no resolved target yet
    pub fn unresolved_remotes(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .elements
            .values()
            .filter(|slot| matches!(slot.kind, ElementKind::Remote { proxy: None, .. }))
            .count()
    }
}

/// Load elements, start the service, and register the pipeline commands
/// on the process event loop
pub fn start(
    context: ServiceContext,
    definition: PipelineDefinition,
    registry: &ElementRegistry,
    instance: impl Into<String>,
) -> Result<PipelineHandle> {
    let graph = PipelineGraph::from_expressions(&definition.graph)?;
    graph.validate(&definition)?;
    let order = graph.topological_order()?;
    let tail = order.last().cloned().unwrap_or_default();

    let mut elements = HashMap::new();
    let mut metrics_element = None;
    let mut remote_filters: Vec<(String, ServiceFilter)> = Vec::new();
    for element_definition in &definition.elements {
        let kind = match &element_definition.deploy {
            DeployDefinition::Local(local) => {
                let class_name = local
                    .class_name
                    .as_deref()
                    .unwrap_or(&element_definition.name);
                if class_name == "Metrics" && metrics_element.is_none() {
                    metrics_element = Some(element_definition.name.clone());
                }
                let element = registry.create(&local.module, class_name, element_definition)?;
                ElementKind::Local(element)
            }
            DeployDefinition::Remote(remote) => {
                let filter = ServiceFilter::from(&remote.service_filter);
                remote_filters.push((element_definition.name.clone(), filter.clone()));
                ElementKind::Remote {
                    filter,
                    proxy: None,
                }
            }
        };
        elements.insert(
            element_definition.name.clone(),
            ElementSlot {
                definition: element_definition.clone(),
                kind,
            },
        );
    }

    let sliding_window = definition
        .parameters
        .get("sliding_window")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let pipeline_parameters = definition::json_map_to_smap(&definition.parameters);

    let namespace = context
        .registrar_topic
        .split('/')
        .next()
        .unwrap_or("aiko")
        .to_string();
    let topic_path = TopicPath::local(namespace, instance);
    let service = Service::new(
        context.clone(),
        topic_path.clone(),
        definition.name.clone(),
        "pipeline",
        Vec::new(),
    );

    let state = Arc::new(Mutex::new(PipelineState {
        graph,
        order,
        tail,
        elements,
        streams: HashMap::new(),
        pending: HashMap::new(),
        pipeline_parameters,
        metrics_element,
        sliding_window,
        topic_path: topic_path.clone(),
        transport: context.transport.clone(),
    }));

    // Remote elements resolve through discovery as their targets appear
    if !remote_filters.is_empty() {
        let discovery = Discovery::start(context.clone(), &topic_path.to_string())?;
        for (element_name, filter) in remote_filters {
            let state = state.clone();
            let transport = context.transport.clone();
            discovery.watch(filter, move |event| {
                let mut guard = state.lock().unwrap();
                let Some(slot) = guard.elements.get_mut(&element_name) else {
                    return;
                };
                let ElementKind::Remote { proxy, .. } = &mut slot.kind else {
                    return;
                };
                match event {
                    DiscoveryEvent::Added(record) => {
                        if proxy.is_none() {
                            tracing::info!(
                                element = %element_name,
                                remote = %record.topic_path,
                                "remote element resolved"
                            );
                            *proxy = Some(RemoteProxy::new(record.topic_path, transport.clone()));
                        }
                    }
                    DiscoveryEvent::Removed(record) => {
                        let resolved = proxy
                            .as_ref()
                            .is_some_and(|p| p.topic_path() == record.topic_path);
                        if resolved {
                            tracing::warn!(
                                element = %element_name,
                                remote = %record.topic_path,
                                "remote element went away"
                            );
                            *proxy = None;
                        }
                    }
                }
            });
        }
    }

    // Reclaim idle streams whose grace time lapsed
    {
        let state = state.clone();
        context.loop_handle.add_timer(SWEEP_INTERVAL, true, move || {
            let mut guard = state.lock().unwrap();
            let expired: Vec<i64> = guard
                .streams
                .iter()
                .filter(|(_, slot)| {
                    slot.stream.grace_time > 0.0
                        && slot.last_frame_at.elapsed().as_secs_f64() > slot.stream.grace_time
                })
                .map(|(id, _)| *id)
                .collect();
            for stream_id in expired {
                tracing::info!(stream_id, "stream grace time lapsed, destroying");
                destroy_stream(&mut guard, stream_id);
            }
        });
    }

    let mut actor = Actor::new(service);
    {
        let state = state.clone();
        actor.add_handler("create_stream", move |_service, invocation| {
            let stream_id = invocation
                .args
                .first()
                .and_then(SValue::as_int)
                .ok_or_else(|| Error::Lifecycle("create_stream needs a stream id".to_string()))?;
            let parameters = invocation
                .args
                .get(1)
                .map(value_to_smap)
                .transpose()?
                .unwrap_or_default();
            let grace_time = invocation
                .args
                .get(2)
                .and_then(SValue::as_f64)
                .unwrap_or(DEFAULT_STREAM_GRACE);
            let mut guard = state.lock().unwrap();
            create_stream(&mut guard, stream_id, parameters, grace_time)?;
            Ok(None)
        });
    }
    {
        let state = state.clone();
        actor.add_handler("process_frame", move |_service, invocation| {
            let mut guard = state.lock().unwrap();
            process_frame(&mut guard, invocation)?;
            Ok(None)
        });
    }
    {
        let state = state.clone();
        actor.add_handler("destroy_stream", move |_service, invocation| {
            let stream_id = invocation
                .args
                .first()
                .and_then(SValue::as_int)
                .ok_or_else(|| Error::Lifecycle("destroy_stream needs a stream id".to_string()))?;
            let mut guard = state.lock().unwrap();
            destroy_stream(&mut guard, stream_id);
            Ok(None)
        });
    }
    {
        let state = state.clone();
        let loop_handle = context.loop_handle.clone();
        actor.add_handler("terminate", move |service, _invocation| {
            let mut guard = state.lock().unwrap();
            let stream_ids: Vec<i64> = guard.streams.keys().copied().collect();
            for stream_id in stream_ids {
                destroy_stream(&mut guard, stream_id);
            }
            drop(guard);
            service.stop()?;
            loop_handle.terminate();
            Ok(None)
        });
    }
    actor.start()?;

    Ok(PipelineHandle { state })
}

/// Accept both `(k: v …)` and the empty list `()` as a mapping
fn value_to_smap(value: &SValue) -> Result<SMap> {
    match value {
        SValue::Map(map) => Ok(map.clone()),
        SValue::List(items) if items.is_empty() => Ok(SMap::new()),
        other => Err(Error::Lifecycle(format!(
            "expected a mapping, found {}",
            other
        ))),
    }
}

fn create_stream(
    state: &mut PipelineState,
    stream_id: i64,
    parameters: SMap,
    grace_time: f64,
) -> Result<()> {
    if state.streams.contains_key(&stream_id) {
        return Err(Error::Lifecycle(format!("duplicate_stream {}", stream_id)));
    }

    // Pipeline-wide defaults under the per-stream overrides. The element
    // tier sits underneath both: elements resolve through
    // ElementDefinition::resolve_parameter, which consults these merged
    // parameters before the element's own defaults.
    let mut merged = state.pipeline_parameters.clone();
    for (key, value) in parameters.entries() {
        merged.insert(key.clone(), value.clone());
    }
    let mut stream = Stream::new(stream_id, merged, grace_time);

    let order = state.order.clone();
    let mut started: Vec<String> = Vec::new();
    for name in &order {
        let event = {
            let slot = state.elements.get_mut(name).expect("graph is validated");
            match &mut slot.kind {
                ElementKind::Local(element) => Some(element.start_stream(&mut stream)),
                ElementKind::Remote { proxy, .. } => {
                    if let Some(proxy) = proxy {
                        let forward = Invocation::new("create_stream")
                            .arg(SValue::Int(stream_id))
                            .arg(SValue::Map(stream.parameters.clone()))
                            .arg(SValue::Float(grace_time));
                        if let Err(error) = proxy.invoke(&forward) {
                            tracing::warn!(%error, element = %name, "remote create_stream failed");
                        }
                    }
                    None
                }
            }
        };
        match event {
            Some(StreamEvent::Error { reason }) => {
                // Unwind the elements already started, newest first
                for unwind in started.iter().rev() {
                    let slot = state.elements.get_mut(unwind).expect("started element");
                    if let ElementKind::Local(element) = &mut slot.kind {
                        element.stop_stream(&mut stream);
                    }
                }
                return Err(Error::Lifecycle(format!(
                    "start_stream failed in {}: {}",
                    name, reason
                )));
            }
            Some(_) => started.push(name.clone()),
            None => {}
        }
    }

    stream.state = StreamState::Running;
    tracing::info!(stream_id, "stream created");
    state.streams.insert(
        stream_id,
        StreamSlot {
            stream,
            frames_done: 0,
            last_frame_at: Instant::now(),
            windows: HashMap::new(),
        },
    );
    Ok(())
}

/// Tear a stream down in reverse topological order. A failing
/// `stop_stream` does not halt the teardown; every failure is collected
/// and returned, and each is logged against the stream.
fn destroy_stream(state: &mut PipelineState, stream_id: i64) -> Vec<Error> {
    let Some(mut slot) = state.streams.remove(&stream_id) else {
        tracing::warn!(stream_id, "destroy_stream for unknown stream");
        return Vec::new();
    };
    slot.stream.state = StreamState::Stopping;

    let mut diagnostics: Vec<Error> = Vec::new();
    let order = state.order.clone();
    for name in order.iter().rev() {
        let element_slot = state.elements.get_mut(name).expect("graph is validated");
        match &mut element_slot.kind {
            ElementKind::Local(element) => {
                if let StreamEvent::Error { reason } = element.stop_stream(&mut slot.stream) {
                    diagnostics.push(Error::Lifecycle(format!(
                        "stop_stream failed in {}: {}",
                        name, reason
                    )));
                }
            }
            ElementKind::Remote { proxy, .. } => {
                if let Some(proxy) = proxy {
                    let forward = Invocation::new("destroy_stream").arg(SValue::Int(stream_id));
                    if let Err(error) = proxy.invoke(&forward) {
                        tracing::warn!(%error, element = %name, "remote destroy_stream failed");
                    }
                }
            }
        }
    }
    slot.stream.state = StreamState::Stopped;
    state.pending.retain(|(sid, _), _| *sid != stream_id);

    for diagnostic in &diagnostics {
        tracing::error!(stream_id, kind = "lifecycle", "{}", diagnostic);
    }
    tracing::info!(stream_id, failures = diagnostics.len(), "stream destroyed");
    diagnostics
}

fn process_frame(state: &mut PipelineState, invocation: &Invocation) -> Result<()> {
    let ids = invocation
        .args
        .first()
        .and_then(SValue::as_map)
        .ok_or_else(|| Error::Lifecycle("process_frame needs (stream_id: frame_id:)".to_string()))?;
    let stream_id = ids
        .get("stream_id")
        .and_then(SValue::as_int)
        .ok_or_else(|| Error::Lifecycle("process_frame needs stream_id".to_string()))?;
    let frame_id = ids
        .get("frame_id")
        .and_then(SValue::as_int)
        .ok_or_else(|| Error::Lifecycle("process_frame needs frame_id".to_string()))?;
    let inputs = invocation
        .args
        .get(1)
        .map(value_to_smap)
        .transpose()?
        .unwrap_or_default();
    let reply_to = invocation
        .get_kwarg("reply_to")
        .and_then(SValue::as_text)
        .map(str::to_string);

    // A parked frame resuming with its remote outputs
    if let Some(pending) = state.pending.remove(&(stream_id, frame_id)) {
        let PendingFrame {
            mut frame,
            parked_at,
            resume_at,
            reply_to,
            durations,
        } = pending;
        frame.merge(inputs.clone());
        push_windows(state, stream_id, &parked_at, &inputs);
        run_frame(state, frame, resume_at, reply_to, durations);
        return Ok(());
    }

    // Headless single-process pipelines skip create_stream
    if !state.streams.contains_key(&stream_id) {
        create_stream(state, stream_id, SMap::new(), DEFAULT_STREAM_GRACE)?;
    }
    let Some(slot) = state.streams.get_mut(&stream_id) else {
        return Ok(());
    };
    if slot.stream.state != StreamState::Running {
        tracing::debug!(stream_id, frame_id, "frame dropped: stream not running");
        return Ok(());
    }
    slot.last_frame_at = Instant::now();

    let frame = Frame::new(stream_id, frame_id, inputs);
    run_frame(state, frame, 0, reply_to, Vec::new());
    Ok(())
}

/// Queue element outputs on the inbound edges of sliding-window joins
fn push_windows(state: &mut PipelineState, stream_id: i64, from: &str, outputs: &SMap) {
    if !state.sliding_window || outputs.is_empty() {
        return;
    }
    let join_edges: Vec<(String, String)> = state
        .graph
        .successors(from)
        .iter()
        .filter(|successor| state.graph.predecessors(successor).len() > 1)
        .map(|successor| (from.to_string(), successor.clone()))
        .collect();
    let Some(slot) = state.streams.get_mut(&stream_id) else {
        return;
    };
    for edge in join_edges {
        slot.windows.entry(edge).or_default().push_back(outputs.clone());
    }
}

/// Traverse the graph from `start_index`, transferring frame ownership to
/// each element in turn
fn run_frame(
    state: &mut PipelineState,
    mut frame: Frame,
    start_index: usize,
    reply_to: Option<String>,
    mut durations: Vec<(String, i64)>,
) {
    let stream_id = frame.stream_id;
    let frame_id = frame.frame_id;
    let order = state.order.clone();
    let mut unbound: Vec<String> = Vec::new();

    let mut index = start_index;
    while index < order.len() {
        let name = order[index].clone();
        index += 1;

        if !state.streams.contains_key(&stream_id) {
            // Destroyed mid-traversal; halt at the element boundary
            return;
        }

        let input_names = state
            .elements
            .get(&name)
            .expect("graph is validated")
            .definition
            .input_names();
        let is_join = state.graph.predecessors(&name).len() > 1;

        // Bind inputs from the swag, or from window queues at a join
        let inputs = if state.sliding_window && is_join {
            match consume_windows(state, stream_id, &name) {
                Some(consumed) => {
                    frame.merge(consumed);
                    match frame.swag_slice(&input_names) {
                        Some(slice) => slice,
                        None => {
                            unbound.push(name.clone());
                            continue;
                        }
                    }
                }
                // Not every edge has data yet; the join fires on a later frame
                None => continue,
            }
        } else {
            match frame.swag_slice(&input_names) {
                Some(slice) => slice,
                None => {
                    unbound.push(name.clone());
                    continue;
                }
            }
        };

        let outcome = run_element(state, stream_id, &name, &frame, &inputs, &mut durations);
        match outcome {
            ElementOutcome::Continue(outputs) => {
                frame.merge(outputs.clone());
                push_windows(state, stream_id, &name, &outputs);
            }
            ElementOutcome::Parked => {
                state.pending.insert(
                    (stream_id, frame_id),
                    PendingFrame {
                        frame,
                        parked_at: name,
                        resume_at: index,
                        reply_to,
                        durations,
                    },
                );
                return;
            }
            ElementOutcome::Stop => {
                if let Some(slot) = state.streams.get_mut(&stream_id) {
                    slot.stream.state = StreamState::Stopping;
                }
                tracing::info!(stream_id, frame_id, "element {} stopped the stream", name);
                return;
            }
            ElementOutcome::Failed(reason) => {
                tracing::error!(
                    stream_id,
                    frame_id,
                    kind = "frame",
                    "element {} failed: {}",
                    name,
                    reason
                );
                return;
            }
        }
    }

    if !unbound.is_empty() {
        tracing::error!(
            stream_id,
            frame_id,
            kind = "frame",
            "inputs never provided for {:?}",
            unbound
        );
        return;
    }

    finish_frame(state, frame, reply_to, durations);
}

enum ElementOutcome {
    Continue(SMap),
    Parked,
    Stop,
    Failed(String),
}

fn run_element(
    state: &mut PipelineState,
    stream_id: i64,
    name: &str,
    frame: &Frame,
    inputs: &SMap,
    durations: &mut Vec<(String, i64)>,
) -> ElementOutcome {
    let PipelineState {
        elements,
        streams,
        topic_path,
        ..
    } = state;
    let Some(slot) = streams.get_mut(&stream_id) else {
        return ElementOutcome::Failed("stream vanished".to_string());
    };
    let element_slot = elements.get_mut(name).expect("graph is validated");

    match &mut element_slot.kind {
        ElementKind::Local(element) => {
            let started = Instant::now();
            let (event, outputs) = element.process_frame(&mut slot.stream, frame, inputs);
            durations.push((name.to_string(), started.elapsed().as_micros() as i64));
            match event {
                StreamEvent::Okay => ElementOutcome::Continue(outputs),
                StreamEvent::Stop => ElementOutcome::Stop,
                StreamEvent::Error { reason } => ElementOutcome::Failed(reason),
            }
        }
        ElementKind::Remote { proxy, filter } => {
            let Some(proxy) = proxy else {
                return ElementOutcome::Failed(format!(
                    "remote element unresolved for filter {}",
                    filter.to_sexpr()
                ));
            };
            let ids: SMap = [
                (SValue::symbol("stream_id"), SValue::Int(frame.stream_id)),
                (SValue::symbol("frame_id"), SValue::Int(frame.frame_id)),
            ]
            .into_iter()
            .collect();
            let command = Invocation::new("process_frame")
                .arg(SValue::Map(ids))
                .arg(SValue::Map(inputs.clone()))
                .kwarg("reply_to", topic_path.in_topic());
            match proxy.invoke(&command) {
                Ok(()) => ElementOutcome::Parked,
                Err(error) => ElementOutcome::Failed(format!("remote publish failed: {}", error)),
            }
        }
    }
}

/// Pop one queued mapping per inbound edge of a join; `None` until every
/// edge has data
fn consume_windows(state: &mut PipelineState, stream_id: i64, name: &str) -> Option<SMap> {
    let predecessors: Vec<String> = state.graph.predecessors(name).to_vec();
    let slot = state.streams.get_mut(&stream_id)?;
    let ready = predecessors.iter().all(|pred| {
        slot.windows
            .get(&(pred.clone(), name.to_string()))
            .is_some_and(|queue| !queue.is_empty())
    });
    if !ready {
        return None;
    }
    let mut combined = SMap::new();
    for pred in predecessors {
        let queue = slot
            .windows
            .get_mut(&(pred, name.to_string()))
            .expect("readiness checked");
        let outputs = queue.pop_front().expect("readiness checked");
        for (key, value) in outputs.entries() {
            combined.insert(key.clone(), value.clone());
        }
    }
    Some(combined)
}

/// Metrics and reply routing once traversal completes
fn finish_frame(
    state: &mut PipelineState,
    frame: Frame,
    reply_to: Option<String>,
    durations: Vec<(String, i64)>,
) {
    let stream_id = frame.stream_id;
    let out_topic = state.topic_path.out_topic();

    if let Some(slot) = state.streams.get_mut(&stream_id) {
        slot.frames_done += 1;
        // Zero disables publication; the Metrics element interprets rate
        let rate = match &state.metrics_element {
            Some(name) => match state.elements.get(name) {
                Some(element) => Metrics::rate_for(&element.definition, &slot.stream),
                None => 1,
            },
            None => 0,
        };
        if rate > 0 && slot.frames_done % rate == 0 {
            let elements: SMap = durations
                .iter()
                .map(|(name, us)| (SValue::symbol(name), SValue::Int(*us)))
                .collect();
            let ids: SMap = [(SValue::symbol("stream_id"), SValue::Int(stream_id))]
                .into_iter()
                .collect();
            let message = SValue::List(vec![
                SValue::symbol("metrics"),
                SValue::Map(ids),
                SValue::List(vec![SValue::symbol("elements"), SValue::Map(elements)]),
            ]);
            if let Err(error) = state
                .transport
                .publish(&out_topic, &message.to_string(), false)
            {
                tracing::warn!(%error, "metrics publish failed");
            }
        }
    }

    let tail_outputs = state
        .elements
        .get(&state.tail)
        .map(|slot| slot.definition.output_names())
        .unwrap_or_default();
    if tail_outputs.is_empty() {
        return;
    }
    let Some(outputs) = frame.swag_slice(&tail_outputs) else {
        return;
    };

    let reply = match &reply_to {
        // A reply_to caller gets a complete command it can dispatch on
        Some(_) => {
            let ids: SMap = [
                (SValue::symbol("stream_id"), SValue::Int(frame.stream_id)),
                (SValue::symbol("frame_id"), SValue::Int(frame.frame_id)),
            ]
            .into_iter()
            .collect();
            SValue::List(vec![
                SValue::symbol("process_frame"),
                SValue::Map(ids),
                SValue::Map(outputs),
            ])
        }
        None => SValue::List(vec![
            SValue::symbol("process_frame"),
            SValue::Map(outputs),
        ]),
    };
    let target = reply_to.as_deref().unwrap_or(&out_topic);
    if let Err(error) = state.transport.publish(target, &reply.to_string(), false) {
        tracing::warn!(%error, topic = target, "frame reply publish failed");
    }
}
