//! Worker-side execution of data Sources.
//!
//! A Source describes where and how to read. This crate implements
//! what a worker does with one:
//!
//! - [`operation::SourceFormat`] answers the coordinator's custom
//!   source operations: metadata estimates and splitting a bounded
//!   Source into bundles.
//! - [`inputs::create_reader`] turns a serialized Source into a
//!   [`inputs::ReaderIterator`] the engine can pull from.
//! - [`split::DynamicSplitHandle`] truncates a bounded reader while it
//!   is being read so the residual can be handed to another worker.
//! - [`session::UnboundedSession`] keeps unbounded readers alive
//!   between bundles and commits their checkpoints to a
//!   [`recovery::CheckpointStore`].
//!
//! Sources cross process boundaries as opaque strings; see
//! [`crate::serde`] for the format and [`crate::serde::SourceRegistry`]
//! for how they're decoded.
//!
//! [`worker::Worker`] ties these together for one process: it installs
//! logging ([`crate::tracing::setup`]) and metrics
//! ([`metrics::initialize_metrics`]) and opens the checkpoint store
//! named by the [`PipelineOptions`].

pub mod bundles;
pub mod config;
pub mod errors;
pub mod inputs;
pub mod iterator;
pub mod metadata;
pub mod metrics;
pub mod operation;
pub mod read;
pub mod recovery;
pub mod serde;
pub mod session;
pub mod source;
pub mod split;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tracing;
pub mod worker;

pub use crate::config::PipelineOptions;
pub use crate::errors::SourceError;
pub use crate::inputs::{create_reader, ExecutionContext, ReaderIterator, WorkerReader};
pub use crate::operation::SourceFormat;
pub use crate::read::Read;
pub use crate::serde::SourceRegistry;
pub use crate::session::{SlotKey, UnboundedSession};
pub use crate::source::{
    AnySource, BoundedReader, BoundedSource, CheckpointCoder, CheckpointMark, Reader,
    UnboundedReader, UnboundedSource,
};
pub use crate::worker::Worker;
