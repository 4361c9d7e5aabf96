//! Error types for the Aiko core runtime

use thiserror::Error;

/// Result type alias for core runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the core runtime
#[derive(Debug, Error)]
pub enum Error {
    /// S-expression or definition text could not be parsed
    #[error("Parse error at offset {offset}: {reason}")]
    Parse {
        /// Byte offset into the input where parsing failed
        offset: usize,
        /// What the parser expected or found
        reason: String,
    },

    /// Broker connection or publish/subscribe failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Zero or ambiguous matches for a required service filter
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Pipeline element module or class could not be resolved
    #[error("Load error: {0}")]
    Load(String),

    /// Graph cycle, duplicate element, or unresolved port
    #[error("Invariant error: {0}")]
    Invariant(String),

    /// start_stream/stop_stream failed on an element
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Per-frame failure from an element
    #[error("Frame error: stream {stream_id} frame {frame_id} element {element}: {message}")]
    Frame {
        /// Stream the failing frame belongs to
        stream_id: i64,
        /// Frame identifier within the stream
        frame_id: i64,
        /// Name of the element that failed
        element: String,
        /// What went wrong
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Short kind tag used in structured log records
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Parse { .. } => "parse",
            Error::Transport(_) => "transport",
            Error::Discovery(_) => "discovery",
            Error::Load(_) => "load",
            Error::Invariant(_) => "invariant",
            Error::Lifecycle(_) => "lifecycle",
            Error::Frame { .. } => "frame",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }
}
