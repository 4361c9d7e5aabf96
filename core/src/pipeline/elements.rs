//! Built-in pipeline elements
//!
//! `Metrics` enables per-element timing publication (the pipeline does the
//! measuring; the element carries the `rate` parameter and passes frames
//! through). `Inspect` is a pass-through that serializes selected swag
//! ports to a file, the log, or stdout.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::pipeline::definition::ElementDefinition;
use crate::pipeline::element::{ElementRegistry, PipelineElement};
use crate::sexpr::{SMap, SValue};
use crate::stream::{Frame, Stream, StreamEvent};
use crate::{Error, Result};

/// Register the built-ins under their bare class names
pub fn register_builtins(registry: &mut ElementRegistry) {
    registry.register_fn("Metrics", |definition| {
        Ok(Box::new(Metrics::new(definition)))
    });
    registry.register_fn("Inspect", |definition| {
        Ok(Box::new(Inspect::new(definition)?))
    });
}

/// Marker element that turns on per-frame timing publication
///
/// Parameters: `rate` (publish every N frames, default 1; a pipeline or
/// per-stream `rate` overrides the element's own).
#[derive(Debug)]
pub struct Metrics {
    definition: ElementDefinition,
}

impl Metrics {
    /// Keep the definition for stream-time parameter resolution
    pub fn new(definition: &ElementDefinition) -> Self {
        Self {
            definition: definition.clone(),
        }
    }

    /// Publish interval in frames for this stream
    pub fn rate(&self, stream: &Stream) -> i64 {
        Self::rate_for(&self.definition, stream)
    }

    /// The single place the `rate` parameter is interpreted; the pipeline
    /// gates its metrics publication through this too
    pub fn rate_for(definition: &ElementDefinition, stream: &Stream) -> i64 {
        definition
            .resolve_parameter(stream, "rate")
            .and_then(|v| v.as_int())
            .filter(|r| *r >= 1)
            .unwrap_or(1)
    }
}

impl PipelineElement for Metrics {
    fn process_frame(
        &mut self,
        _stream: &mut Stream,
        _frame: &Frame,
        _inputs: &SMap,
    ) -> (StreamEvent, SMap) {
        (StreamEvent::Okay, SMap::new())
    }
}

/// Where Inspect writes
#[derive(Debug)]
enum InspectTarget {
    File(PathBuf),
    Log,
    Print,
}

/// Pass-through element that serializes swag ports without modifying them
///
/// Parameters: `inspect` (list of port names, or `*` for the whole swag,
/// default `*`), `target` (`file:<path>`, `log`, or `print`, default
/// `log`), `enable` (default true; resolvable per pipeline or stream).
#[derive(Debug)]
pub struct Inspect {
    name: String,
    definition: ElementDefinition,
    ports: Option<Vec<String>>,
    target: InspectTarget,
}

impl Inspect {
    /// Read `inspect` and `target` from the definition; `enable` is
    /// resolved per stream
    pub fn new(definition: &ElementDefinition) -> Result<Self> {
        let ports = match definition.parameter("inspect") {
            None => None,
            Some(value) if value.as_str() == Some("*") => None,
            Some(value) => {
                let names = value
                    .as_array()
                    .ok_or_else(|| {
                        Error::Load(format!(
                            "element {}: inspect must be \"*\" or a list of port names",
                            definition.name
                        ))
                    })?
                    .iter()
                    .map(|v| {
                        v.as_str().map(str::to_string).ok_or_else(|| {
                            Error::Load(format!(
                                "element {}: inspect port names must be strings",
                                definition.name
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Some(names)
            }
        };

        let target = match definition.parameter("target").and_then(|v| v.as_str()) {
            None | Some("log") => InspectTarget::Log,
            Some("print") => InspectTarget::Print,
            Some(spec) => match spec.strip_prefix("file:") {
                Some(path) => InspectTarget::File(PathBuf::from(path)),
                None => {
                    return Err(Error::Load(format!(
                        "element {}: unknown inspect target {}",
                        definition.name, spec
                    )))
                }
            },
        };

        Ok(Self {
            name: definition.name.clone(),
            definition: definition.clone(),
            ports,
            target,
        })
    }

    fn enabled(&self, stream: &Stream) -> bool {
        self.definition
            .resolve_parameter(stream, "enable")
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    fn selected(&self, swag: &SMap) -> SMap {
        match &self.ports {
            None => swag.clone(),
            Some(ports) => ports
                .iter()
                .filter_map(|port| {
                    swag.get(port)
                        .map(|value| (SValue::symbol(port), value.clone()))
                })
                .collect(),
        }
    }

    fn emit(&self, line: &SValue) {
        match &self.target {
            InspectTarget::Log => tracing::info!(element = %self.name, "{}", line),
            InspectTarget::Print => println!("{}", line),
            InspectTarget::File(path) => {
                let appended = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .and_then(|mut file| writeln!(file, "{}", line));
                if let Err(error) = appended {
                    tracing::warn!(element = %self.name, %error, "inspect write failed");
                }
            }
        }
    }
}

impl PipelineElement for Inspect {
    fn start_stream(&mut self, stream: &mut Stream) -> StreamEvent {
        if self.enabled(stream) {
            let line = SValue::List(vec![
                SValue::symbol("start_stream"),
                SValue::symbol(&self.name),
                SValue::Int(stream.stream_id),
            ]);
            self.emit(&line);
        }
        StreamEvent::Okay
    }

    fn process_frame(
        &mut self,
        stream: &mut Stream,
        frame: &Frame,
        _inputs: &SMap,
    ) -> (StreamEvent, SMap) {
        if self.enabled(stream) {
            let line = SValue::List(vec![
                SValue::symbol("frame"),
                SValue::symbol(&self.name),
                SValue::Int(frame.stream_id),
                SValue::Int(frame.frame_id),
                SValue::Map(self.selected(&frame.swag)),
            ]);
            self.emit(&line);
        }
        (StreamEvent::Okay, SMap::new())
    }

    fn stop_stream(&mut self, stream: &mut Stream) -> StreamEvent {
        if self.enabled(stream) {
            let line = SValue::List(vec![
                SValue::symbol("stop_stream"),
                SValue::symbol(&self.name),
                SValue::Int(stream.stream_id),
            ]);
            self.emit(&line);
        }
        StreamEvent::Okay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::definition::json_to_svalue;

    fn definition(parameters: serde_json::Value) -> ElementDefinition {
        serde_json::from_value(serde_json::json!({
            "name": "inspect_0",
            "parameters": parameters,
            "deploy": {"local": {"module": "builtin"}}
        }))
        .unwrap()
    }

    #[test]
    fn metrics_rate_defaults_and_clamps() {
        let stream = Stream::new(0, SMap::new(), 0.0);
        let metrics = Metrics::new(&definition(serde_json::json!({})));
        assert_eq!(metrics.rate(&stream), 1);
        let metrics = Metrics::new(&definition(serde_json::json!({"rate": 20})));
        assert_eq!(metrics.rate(&stream), 20);
        let metrics = Metrics::new(&definition(serde_json::json!({"rate": 0})));
        assert_eq!(metrics.rate(&stream), 1);
    }

    #[test]
    fn metrics_rate_honors_stream_override() {
        let mut parameters = SMap::new();
        parameters.insert(SValue::symbol("rate"), SValue::Int(3));
        let stream = Stream::new(0, parameters, 0.0);
        let definition = definition(serde_json::json!({"rate": 20}));
        assert_eq!(Metrics::rate_for(&definition, &stream), 3);
    }

    #[test]
    fn inspect_writes_selected_ports_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inspect.txt");
        let mut inspect = Inspect::new(&definition(serde_json::json!({
            "inspect": ["a"],
            "target": format!("file:{}", path.display())
        })))
        .unwrap();

        let mut stream = Stream::new(7, SMap::new(), 0.0);
        let mut swag = SMap::new();
        swag.insert(SValue::symbol("a"), SValue::Int(1));
        swag.insert(SValue::symbol("b"), SValue::Int(2));
        let frame = Frame::new(7, 0, swag);

        inspect.start_stream(&mut stream);
        inspect.process_frame(&mut stream, &frame, &SMap::new());
        inspect.stop_stream(&mut stream);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "(start_stream inspect_0 7)");
        assert_eq!(lines[1], "(frame inspect_0 7 0 (a: 1))");
        assert_eq!(lines[2], "(stop_stream inspect_0 7)");
    }

    #[test]
    fn inspect_star_selects_whole_swag() {
        let inspect = Inspect::new(&definition(serde_json::json!({"inspect": "*"}))).unwrap();
        let mut swag = SMap::new();
        swag.insert(SValue::symbol("a"), SValue::Int(1));
        swag.insert(SValue::symbol("b"), SValue::Int(2));
        assert_eq!(inspect.selected(&swag).len(), 2);
    }

    #[test]
    fn inspect_rejects_unknown_target() {
        assert!(Inspect::new(&definition(serde_json::json!({"target": "socket:x"}))).is_err());
    }

    #[test]
    fn disabled_inspect_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inspect.txt");
        let mut inspect = Inspect::new(&definition(serde_json::json!({
            "enable": false,
            "target": format!("file:{}", path.display())
        })))
        .unwrap();
        let mut stream = Stream::new(0, SMap::new(), 0.0);
        inspect.start_stream(&mut stream);
        assert!(!path.exists());
    }

    #[test]
    fn json_parameters_cross_to_svalues() {
        let value = json_to_svalue(&serde_json::json!({"a": 1, "b": [true, null]}));
        let map = value.as_map().unwrap();
        assert_eq!(map.get("a"), Some(&SValue::Int(1)));
        let list = map.get("b").unwrap().as_list().unwrap();
        assert_eq!(list[0], SValue::Bool(true));
        assert_eq!(list[1], SValue::Null);
    }
}
