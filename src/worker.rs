//! Definition of a source worker.
//!
//! A worker owns everything a process needs to run Sources: logging
//! and metrics are installed from the [`PipelineOptions`], the
//! checkpoint store is opened from them, and a single
//! [`SourceFormat`] and [`UnboundedSession`] are shared by every
//! request the process serves.

use std::fmt;
use std::sync::Arc;

use crate::config::PipelineOptions;
use crate::errors::{Reraise, SourceError};
use crate::inputs::{create_reader, ExecutionContext, WorkerReader};
use crate::metrics::initialize_metrics;
use crate::operation::{SourceFormat, SourceSpec};
use crate::serde::SourceRegistry;
use crate::session::{SlotKey, UnboundedSession};

pub struct Worker<T> {
    options: PipelineOptions,
    format: SourceFormat<T>,
    session: UnboundedSession<T>,
}

impl<T> fmt::Debug for Worker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("options", &self.options)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl<T: 'static> Worker<T> {
    /// Validate the options, install logging and metrics, and open the
    /// checkpoint store.
    pub fn start(
        registry: Arc<SourceRegistry<T>>,
        options: PipelineOptions,
    ) -> Result<Self, SourceError> {
        options.validate()?;
        crate::tracing::setup(&options)?;
        initialize_metrics().reraise("error installing metrics")?;
        tracing::info!("Starting source worker with {options:?}");

        let session = UnboundedSession::from_options(registry.clone(), options.clone())
            .reraise("error opening checkpoint store")?;
        Ok(Self {
            format: SourceFormat::new(registry, options.clone()),
            session,
            options,
        })
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Answers the coordinator's source operations.
    pub fn format(&self) -> &SourceFormat<T> {
        &self.format
    }

    pub fn session(&self) -> &UnboundedSession<T> {
        &self.session
    }

    /// Reader for `spec`. A slot key means a bundle of that unbounded
    /// slot; without one the Source is read as a bounded bundle.
    pub fn create_reader(
        &self,
        spec: &SourceSpec,
        slot: Option<&SlotKey>,
    ) -> Result<WorkerReader<T>, SourceError> {
        let context = match slot {
            Some(key) => ExecutionContext::Streaming {
                session: &self.session,
                key,
            },
            None => ExecutionContext::Batch,
        };
        create_reader(spec, self.format.registry(), &self.options, context)
    }
}
