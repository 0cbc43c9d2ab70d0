//! Node façade tying the Reef components together.
//!
//! [`ReefNode`] owns the shard coordinator, the query coordinator and one
//! in-memory store per cluster node, and exposes them through the
//! [`ReefEngine`] trait. [`ReefConfig`] is the TOML file format and
//! [`telemetry`] installs the tracing subscriber.

pub mod config;
pub mod engine;
pub mod error;
pub mod node;
pub mod telemetry;

pub use config::{LogSection, ReefConfig, StorageSection};
pub use engine::ReefEngine;
pub use error::EngineError;
pub use node::{Backends, ReefNode};
