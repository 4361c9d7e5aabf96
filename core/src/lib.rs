//! Aiko core runtime - distributed streaming pipelines over a pub/sub bus
//!
//! This crate is the core of the framework: discoverable actors exchange
//! S-expression messages over an MQTT broker, and pipelines are actors
//! that run graph-structured per-frame dataflow across local and remote
//! processing elements.
//!
//! # Architecture
//!
//! Leaves first: the S-expression codec encodes every payload; one
//! cooperative event loop per process serializes all handler execution;
//! the transport adapts the broker to the loop's mailbox model; services
//! announce themselves to a registrar elected by retained message;
//! actors dispatch commands through a static method table; pipelines tie
//! it together with stream and frame lifecycle.
//!
//! # Example
//!
//! ```no_run
//! use aiko_core::config::Config;
//! use aiko_core::event_loop::EventLoop;
//! use aiko_core::pipeline::{self, ElementRegistry};
//! use aiko_core::service::ServiceContext;
//! use aiko_core::transport::{MemoryTransport, SharedTransport};
//! use std::sync::Arc;
//!
//! # fn load_definition() -> aiko_core::pipeline::PipelineDefinition { unimplemented!() }
//! # async fn run() -> aiko_core::Result<()> {
//! let config = Config::from_env();
//! let (event_loop, handle) = EventLoop::new();
//! let transport: SharedTransport = Arc::new(MemoryTransport::new());
//! let context = ServiceContext::new(handle, transport, config.registrar_topic());
//!
//! let registry = ElementRegistry::with_builtins();
//! pipeline::start(context, load_definition(), &registry, "1")?;
//! event_loop.run().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod actor;
pub mod config;
pub mod event_loop;
pub mod logging;
pub mod pipeline;
pub mod service;
pub mod sexpr;
pub mod stream;
pub mod transport;

mod error;
pub use error::{Error, Result};
