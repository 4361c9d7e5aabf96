//! Shared test harness
//!
//! Simulated processes share one in-memory broker: each gets its own
//! event loop and service context, mirroring one OS process per loop.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use aiko_core::event_loop::EventLoop;
use aiko_core::event_loop::LoopHandle;
use aiko_core::pipeline::{ElementDefinition, ElementRegistry, PipelineElement};
use aiko_core::service::ServiceContext;
use aiko_core::sexpr::{SMap, SValue};
use aiko_core::stream::{Frame, Stream, StreamEvent};
use aiko_core::transport::{MemoryTransport, PubSub, SharedTransport, Subscriber};

/// One simulated process: an event loop plus its service context
pub struct Process {
    pub handle: LoopHandle,
    pub context: ServiceContext,
}

/// Spawn a process onto the shared broker
pub fn spawn_process(broker: &Arc<MemoryTransport>, namespace: &str) -> Process {
    let (event_loop, handle) = EventLoop::new();
    let transport: SharedTransport = broker.clone();
    let context = ServiceContext::new(
        handle.clone(),
        transport,
        format!("{}/service/registrar", namespace),
    );
    tokio::spawn(event_loop.run());
    Process { handle, context }
}

/// Collects every payload delivered for a topic pattern
#[derive(Clone)]
pub struct Collector {
    messages: Arc<Mutex<Vec<(String, String)>>>,
}

impl Collector {
    pub fn subscribe(process: &Process, pattern: &str, mailbox: &str) -> Self {
        let collector = Self {
            messages: Arc::new(Mutex::new(Vec::new())),
        };
        process
            .context
            .transport
            .subscribe(
                pattern,
                Subscriber::new(process.handle.clone(), mailbox.to_string()),
            )
            .unwrap();
        let messages = collector.messages.clone();
        process.handle.add_mailbox_handler(mailbox.to_string(), move |mail| {
            messages.lock().unwrap().push((mail.topic, mail.payload));
            Ok(())
        });
        collector
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

/// Poll a condition until it holds or the test times out
pub async fn eventually(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Settle the bus, then assert the condition still fails to change
pub async fn never(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..20 {
        assert!(!condition(), "unexpected: {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Arithmetic elements used by the pipeline scenarios
// ---------------------------------------------------------------------------

fn single_ports(definition: &ElementDefinition) -> (String, String) {
    let input = definition
        .input_names()
        .first()
        .cloned()
        .unwrap_or_default();
    let output = definition
        .output_names()
        .first()
        .cloned()
        .unwrap_or_default();
    (input, output)
}

fn int_input(inputs: &SMap, port: &str) -> std::result::Result<i64, String> {
    inputs
        .get(port)
        .and_then(SValue::as_int)
        .ok_or_else(|| format!("port {} is not an integer", port))
}

/// Resolve an integer parameter through the stream, falling back to the
/// element's own definition, then to a hardcoded default
fn int_parameter(definition: &ElementDefinition, stream: &Stream, name: &str, default: i64) -> i64 {
    definition
        .resolve_parameter(stream, name)
        .and_then(|v| v.as_int())
        .unwrap_or(default)
}

/// Adds `amount` (default 1) to its input port, producing its output port
#[derive(Debug)]
pub struct Add {
    input: String,
    output: String,
    definition: ElementDefinition,
}

impl Add {
    pub fn new(definition: &ElementDefinition) -> Self {
        let (input, output) = single_ports(definition);
        Self {
            input,
            output,
            definition: definition.clone(),
        }
    }
}

impl PipelineElement for Add {
    fn process_frame(
        &mut self,
        stream: &mut Stream,
        _frame: &Frame,
        inputs: &SMap,
    ) -> (StreamEvent, SMap) {
        let amount = int_parameter(&self.definition, stream, "amount", 1);
        match int_input(inputs, &self.input) {
            Ok(value) => {
                let mut outputs = SMap::new();
                outputs.insert(SValue::symbol(&self.output), SValue::Int(value + amount));
                (StreamEvent::Okay, outputs)
            }
            Err(reason) => (StreamEvent::Error { reason }, SMap::new()),
        }
    }
}

/// Multiplies its input port by `factor` (default 2)
#[derive(Debug)]
pub struct Multiply {
    input: String,
    output: String,
    definition: ElementDefinition,
}

impl Multiply {
    pub fn new(definition: &ElementDefinition) -> Self {
        let (input, output) = single_ports(definition);
        Self {
            input,
            output,
            definition: definition.clone(),
        }
    }
}

impl PipelineElement for Multiply {
    fn process_frame(
        &mut self,
        stream: &mut Stream,
        _frame: &Frame,
        inputs: &SMap,
    ) -> (StreamEvent, SMap) {
        let factor = int_parameter(&self.definition, stream, "factor", 2);
        match int_input(inputs, &self.input) {
            Ok(value) => {
                let mut outputs = SMap::new();
                outputs.insert(SValue::symbol(&self.output), SValue::Int(value * factor));
                (StreamEvent::Okay, outputs)
            }
            Err(reason) => (StreamEvent::Error { reason }, SMap::new()),
        }
    }
}

/// Sums every declared input port into its output port
#[derive(Debug)]
pub struct Sum {
    inputs: Vec<String>,
    output: String,
}

impl Sum {
    pub fn new(definition: &ElementDefinition) -> Self {
        Self {
            inputs: definition.input_names(),
            output: definition
                .output_names()
                .first()
                .cloned()
                .unwrap_or_default(),
        }
    }
}

impl PipelineElement for Sum {
    fn process_frame(
        &mut self,
        _stream: &mut Stream,
        _frame: &Frame,
        inputs: &SMap,
    ) -> (StreamEvent, SMap) {
        let mut total = 0;
        for port in &self.inputs {
            match int_input(inputs, port) {
                Ok(value) => total += value,
                Err(reason) => return (StreamEvent::Error { reason }, SMap::new()),
            }
        }
        let mut outputs = SMap::new();
        outputs.insert(SValue::symbol(&self.output), SValue::Int(total));
        (StreamEvent::Okay, outputs)
    }
}

/// Adds `amount` to its input, but only on odd frame ids; even frames
/// produce nothing (exercises sliding-window buffering)
#[derive(Debug)]
pub struct OddFrames {
    input: String,
    output: String,
    definition: ElementDefinition,
}

impl OddFrames {
    pub fn new(definition: &ElementDefinition) -> Self {
        let (input, output) = single_ports(definition);
        Self {
            input,
            output,
            definition: definition.clone(),
        }
    }
}

impl PipelineElement for OddFrames {
    fn process_frame(
        &mut self,
        stream: &mut Stream,
        frame: &Frame,
        inputs: &SMap,
    ) -> (StreamEvent, SMap) {
        if frame.frame_id % 2 == 0 {
            return (StreamEvent::Okay, SMap::new());
        }
        let amount = int_parameter(&self.definition, stream, "amount", 10);
        match int_input(inputs, &self.input) {
            Ok(value) => {
                let mut outputs = SMap::new();
                outputs.insert(SValue::symbol(&self.output), SValue::Int(value + amount));
                (StreamEvent::Okay, outputs)
            }
            Err(reason) => (StreamEvent::Error { reason }, SMap::new()),
        }
    }
}

/// Fails `start_stream`, for lifecycle unwind tests
#[derive(Debug)]
pub struct FailingStart;

impl PipelineElement for FailingStart {
    fn start_stream(&mut self, _stream: &mut Stream) -> StreamEvent {
        StreamEvent::Error {
            reason: "refusing to start".to_string(),
        }
    }

    fn process_frame(
        &mut self,
        _stream: &mut Stream,
        _frame: &Frame,
        _inputs: &SMap,
    ) -> (StreamEvent, SMap) {
        (StreamEvent::Okay, SMap::new())
    }
}

/// Fails `stop_stream`, for teardown diagnostics tests
#[derive(Debug)]
pub struct FailingStop;

impl PipelineElement for FailingStop {
    fn process_frame(
        &mut self,
        _stream: &mut Stream,
        _frame: &Frame,
        _inputs: &SMap,
    ) -> (StreamEvent, SMap) {
        (StreamEvent::Okay, SMap::new())
    }

    fn stop_stream(&mut self, _stream: &mut Stream) -> StreamEvent {
        StreamEvent::Error {
            reason: "refusing to stop".to_string(),
        }
    }
}

/// Registry with the built-ins plus the arithmetic test elements
pub fn test_registry() -> ElementRegistry {
    let mut registry = ElementRegistry::with_builtins();
    registry.register_fn("Add", |d| Ok(Box::new(Add::new(d)) as Box<dyn PipelineElement>));
    registry.register_fn("Multiply", |d| {
        Ok(Box::new(Multiply::new(d)) as Box<dyn PipelineElement>)
    });
    registry.register_fn("Sum", |d| Ok(Box::new(Sum::new(d)) as Box<dyn PipelineElement>));
    registry.register_fn("OddFrames", |d| {
        Ok(Box::new(OddFrames::new(d)) as Box<dyn PipelineElement>)
    });
    registry.register_fn("FailingStart", |_| {
        Ok(Box::new(FailingStart) as Box<dyn PipelineElement>)
    });
    registry.register_fn("FailingStop", |_| {
        Ok(Box::new(FailingStop) as Box<dyn PipelineElement>)
    });
    registry
}
