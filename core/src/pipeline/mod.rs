//! Pipeline engine: definitions, graph, elements, and the Pipeline actor

pub mod definition;
pub mod element;
pub mod elements;
pub mod graph;
mod pipeline;

pub use definition::{
    DeployDefinition, ElementDefinition, FilterDefinition, LocalDeploy, PipelineDefinition,
    PortDefinition, RemoteDeploy,
};
pub use element::{ElementFactory, ElementRegistry, PipelineElement};
pub use graph::PipelineGraph;
pub use pipeline::{start, PipelineHandle, DEFAULT_STREAM_GRACE};
