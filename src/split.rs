//! Dynamic splitting of a bounded reader while it is being read.
//!
//! The coordinator may ask, from any thread, to truncate a running
//! reader at a fraction of its input. The reader keeps the primary
//! part and the residual becomes new work. Both halves must be new
//! Source instances that validate on their own; anything else is a bug
//! in the Source and is reported with all three Sources involved.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::errors::SourceError;
use crate::metrics::{kind_label, ReadMetrics};
use crate::operation::DynamicSplitRequest;
use crate::source::{same_instance, BoundedReader, BoundedSource};

/// A bounded reader shared between the thread draining it and the
/// threads that may split it.
pub(crate) type SharedBoundedReader<T> = Arc<Mutex<Box<dyn BoundedReader<T>>>>;

/// Readers keep no invariant a panic in another holder could break
/// halfway through a call, so a poisoned lock is still usable.
pub(crate) fn lock_reader<T>(reader: &SharedBoundedReader<T>) -> MutexGuard<'_, Box<dyn BoundedReader<T>>> {
    reader.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The two halves of a granted dynamic split.
pub struct BoundedSourceSplit<T> {
    /// What the existing reader continues to read.
    pub primary: Arc<dyn BoundedSource<T>>,
    /// What is left for someone else.
    pub residual: Arc<dyn BoundedSource<T>>,
}

impl<T> fmt::Debug for BoundedSourceSplit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedSourceSplit")
            .field("primary", &self.primary)
            .field("residual", &self.residual)
            .finish()
    }
}

/// Lets another thread split a reader that is being iterated.
///
/// Obtained from [`crate::inputs::BoundedReaderIterator::split_handle`].
pub struct DynamicSplitHandle<T> {
    reader: SharedBoundedReader<T>,
    metrics: ReadMetrics,
}

impl<T> Clone for DynamicSplitHandle<T> {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T> fmt::Debug for DynamicSplitHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicSplitHandle").finish_non_exhaustive()
    }
}

impl<T> DynamicSplitHandle<T> {
    pub(crate) fn new(reader: SharedBoundedReader<T>, metrics: ReadMetrics) -> Self {
        Self { reader, metrics }
    }

    /// Handle a split request from the coordinator.
    ///
    /// Only fractional stop positions are understood; any other kind
    /// is declined so reading keeps going.
    pub fn request_dynamic_split(
        &self,
        request: &DynamicSplitRequest,
    ) -> Result<Option<BoundedSourceSplit<T>>, SourceError> {
        match request.stop_position.fraction {
            Some(fraction) => self.split_at_fraction(fraction),
            None => {
                tracing::debug!(
                    "Declining dynamic split; only fraction stop positions are supported: {:?}",
                    request.stop_position
                );
                self.metrics.split_requests.add(1, &kind_label("bounded"));
                Ok(None)
            }
        }
    }

    /// Ask the reader to give up everything after `fraction`.
    ///
    /// `Ok(None)` means the reader declined, e.g. because it has
    /// already read past that point.
    pub fn split_at_fraction(&self, fraction: f64) -> Result<Option<BoundedSourceSplit<T>>, SourceError> {
        self.metrics.split_requests.add(1, &kind_label("bounded"));

        // Hold the lock across the whole exchange so the split lands
        // between two cursor calls.
        let (original, primary, residual) = {
            let mut reader = lock_reader(&self.reader);
            let original = reader.current_source();
            let Some(residual) = reader.split_at_fraction(fraction) else {
                tracing::debug!("Reader of {original:?} declined split at {fraction}");
                return Ok(None);
            };
            (original, reader.current_source(), residual)
        };

        let violation = |reason: String| SourceError::SplitInvariantViolation {
            reason,
            original: format!("{original:?}"),
            primary: format!("{primary:?}"),
            residual: format!("{residual:?}"),
        };
        if same_instance(&primary, &original) {
            return Err(violation(
                "Successful split did not change the current source: primary is same as original"
                    .to_string(),
            ));
        }
        if same_instance(&residual, &original) {
            return Err(violation(
                "Successful split did not change the current source: residual is same as original"
                    .to_string(),
            ));
        }
        if let Err(err) = primary.validate() {
            return Err(violation(format!("Primary source is invalid: {err}")));
        }
        if let Err(err) = residual.validate() {
            return Err(violation(format!("Residual source is invalid: {err}")));
        }

        tracing::debug!("Split {original:?} at {fraction} into {primary:?} and {residual:?}");
        self.metrics.splits_granted.add(1, &kind_label("bounded"));
        Ok(Some(BoundedSourceSplit { primary, residual }))
    }
}
