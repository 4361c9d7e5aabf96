//! Stream and frame state
//!
//! A stream is the long-lived context for a sequence of frames; a frame is
//! one unit of data traversing the pipeline graph, carrying its swag
//! scratchpad of port-name → value.

use chrono::{DateTime, Utc};

use crate::sexpr::{SMap, SValue};

/// Stream lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Built, elements not yet started
    Created,
    /// Accepting frames
    Running,
    /// An element requested stop; draining
    Stopping,
    /// Elements stopped, state about to be discarded
    Stopped,
}

impl StreamState {
    /// Lowercase tag for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Created => "created",
            StreamState::Running => "running",
            StreamState::Stopping => "stopping",
            StreamState::Stopped => "stopped",
        }
    }
}

/// Outcome of an element lifecycle or frame call
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Keep going
    Okay,
    /// Stop the stream after this frame
    Stop,
    /// The element failed
    Error {
        /// What went wrong, for the frame log record
        reason: String,
    },
}

/// Long-lived context shared by a sequence of frames
#[derive(Debug, Clone)]
pub struct Stream {
    /// Stream identity within the pipeline
    pub stream_id: i64,
    /// Merged parameters: element defaults < pipeline < per-stream
    pub parameters: SMap,
    /// Mutable per-stream variables, owned by the pipeline loop
    pub variables: SMap,
    /// Seconds of silence tolerated before reclamation
    pub grace_time: f64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Lifecycle state
    pub state: StreamState,
}

impl Stream {
    /// Build a stream in the `Created` state
    pub fn new(stream_id: i64, parameters: SMap, grace_time: f64) -> Self {
        Self {
            stream_id,
            parameters,
            variables: SMap::new(),
            grace_time,
            created_at: Utc::now(),
            state: StreamState::Created,
        }
    }

    /// Merged parameter by name
    pub fn parameter(&self, name: &str) -> Option<&SValue> {
        self.parameters.get(name)
    }
}

/// One unit of data flowing through the graph
#[derive(Debug, Clone)]
pub struct Frame {
    /// Stream this frame belongs to
    pub stream_id: i64,
    /// Position within the stream
    pub frame_id: i64,
    /// Port-name → value scratchpad accumulated during traversal
    pub swag: SMap,
}

impl Frame {
    /// Build a frame seeded with the caller's inputs
    pub fn new(stream_id: i64, frame_id: i64, swag: SMap) -> Self {
        Self {
            stream_id,
            frame_id,
            swag,
        }
    }

    /// Swag slice for an element: the values bound to the given ports
    pub fn swag_slice(&self, ports: &[String]) -> Option<SMap> {
        let mut slice = SMap::new();
        for port in ports {
            let value = self.swag.get(port)?;
            slice.insert(SValue::symbol(port), value.clone());
        }
        Some(slice)
    }

    /// Merge element outputs into the swag
    pub fn merge(&mut self, outputs: SMap) {
        for (key, value) in outputs.entries() {
            self.swag.insert(key.clone(), value.clone());
        }
    }
}
