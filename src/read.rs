//! The `Read` transform: the pipeline-facing handle on a Source.

use std::fmt;
use std::sync::Arc;

use crate::config::PipelineOptions;
use crate::errors::{Reraise, SourceError};
use crate::source::{AnySource, BoundedSource, Timestamped, UnboundedSource};

/// Reads a Source into a pipeline.
///
/// Immutable; [`Read::named`] returns a new value.
pub struct Read<T> {
    name: Option<String>,
    source: AnySource<T>,
}

impl<T> Clone for Read<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            source: self.source.clone(),
        }
    }
}

impl<T> fmt::Debug for Read<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Read")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish()
    }
}

impl<T> Read<T> {
    pub fn bounded(source: Arc<dyn BoundedSource<T>>) -> Self {
        Self {
            name: None,
            source: AnySource::Bounded(source),
        }
    }

    pub fn unbounded(source: Arc<dyn UnboundedSource<T>>) -> Self {
        Self {
            name: None,
            source: AnySource::Unbounded(source),
        }
    }

    pub fn named(&self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            source: self.source.clone(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn source(&self) -> &AnySource<T> {
        &self.source
    }

    pub fn is_bounded(&self) -> bool {
        self.source.is_bounded()
    }

    /// Display name of the step, e.g. `Read(range)`.
    pub fn kind_string(&self) -> String {
        format!("Read({})", self.source.kind())
    }

    /// Check the Source before the step is added to a pipeline.
    pub fn apply(&self) -> Result<&AnySource<T>, SourceError> {
        self.source
            .validate()
            .reraise_with(|| format!("invalid source for {}", self.kind_string()))?;
        Ok(&self.source)
    }
}

/// Read a whole bounded Source in this process.
///
/// The reader is closed even when reading fails.
pub fn evaluate_bounded<T>(
    source: Arc<dyn BoundedSource<T>>,
    options: &PipelineOptions,
) -> Result<Vec<Timestamped<T>>, SourceError> {
    let mut reader = source.create_reader(options)?;
    let mut read_all = || -> Result<Vec<Timestamped<T>>, SourceError> {
        let mut out = Vec::new();
        let mut available = reader.start()?;
        while available {
            out.push(Timestamped::new(reader.current()?, reader.current_timestamp()?));
            available = reader.advance()?;
        }
        Ok(out)
    };
    let res = read_all();
    let closed = reader.close();
    let out = res?;
    closed?;
    Ok(out)
}
