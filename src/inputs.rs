//! Readers as the execution engine sees them.
//!
//! The engine pulls records through a [`ReaderIterator`], asks it for
//! progress and forwards the coordinator's dynamic split requests to
//! it. There are two kinds:
//!
//! - [`BoundedReaderIterator`] reads one bundle of a bounded Source to
//!   the end. Its reader sits behind a lock so a
//!   [`DynamicSplitHandle`] can split it from another thread while it
//!   is being drained.
//!
//! - [`UnboundedReaderIterator`] reads one bundle of an unbounded
//!   slot. It stops at the bundle limits, tags every record with its
//!   [`RecordId`], and hands its reader back to the
//!   [`UnboundedSession`] at the end of the bundle.
//!
//! [`create_reader`] builds the right one from a [`SourceSpec`].

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::PipelineOptions;
use crate::errors::SourceError;
use crate::iterator::{Cursor, ReadState, ReaderIteratorAdapter};
use crate::metrics::{kind_label, ReadMetrics};
use crate::operation::{ApproximateProgress, DynamicSplitRequest, SourceSpec};
use crate::serde::SourceRegistry;
use crate::session::{BundleLimits, Clock, SlotKey, UnboundedSession};
use crate::source::*;
use crate::split::{lock_reader, BoundedSourceSplit, DynamicSplitHandle, SharedBoundedReader};

/// Pull interface over a running reader.
pub trait ReaderIterator<T> {
    type Item;

    /// Whether [`ReaderIterator::next`] will produce a record.
    fn has_next(&mut self) -> Result<bool, SourceError>;

    /// Next record. Fails with [`SourceError::NoSuchElement`] when
    /// there is none.
    fn next(&mut self) -> Result<Self::Item, SourceError>;

    /// `None` means progress is not available for this reader.
    fn progress(&self) -> Option<ApproximateProgress>;

    /// `Ok(None)` means no split happened.
    fn request_dynamic_split(
        &mut self,
        request: &DynamicSplitRequest,
    ) -> Result<Option<BoundedSourceSplit<T>>, SourceError>;

    fn close(&mut self) -> Result<(), SourceError>;
}

struct BoundedCursor<T> {
    reader: SharedBoundedReader<T>,
}

impl<T> Cursor for BoundedCursor<T> {
    type Item = T;

    fn start(&mut self) -> Result<bool, SourceError> {
        lock_reader(&self.reader).start()
    }

    fn advance(&mut self) -> Result<bool, SourceError> {
        lock_reader(&self.reader).advance()
    }

    fn current(&mut self) -> Result<Timestamped<T>, SourceError> {
        let reader = lock_reader(&self.reader);
        Ok(Timestamped::new(reader.current()?, reader.current_timestamp()?))
    }

    fn describe(&self) -> String {
        format!("{:?}", lock_reader(&self.reader).current_source())
    }
}

/// Iterates one bounded reader to the end.
pub struct BoundedReaderIterator<T> {
    adapter: ReaderIteratorAdapter<BoundedCursor<T>>,
    split: DynamicSplitHandle<T>,
    metrics: ReadMetrics,
}

impl<T> fmt::Debug for BoundedReaderIterator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedReaderIterator")
            .field("state", &self.adapter.state())
            .finish_non_exhaustive()
    }
}

impl<T> BoundedReaderIterator<T> {
    pub fn new(reader: Box<dyn BoundedReader<T>>, metrics: ReadMetrics) -> Self {
        let reader: SharedBoundedReader<T> = Arc::new(Mutex::new(reader));
        Self {
            adapter: ReaderIteratorAdapter::new(
                BoundedCursor {
                    reader: reader.clone(),
                },
                false,
            ),
            split: DynamicSplitHandle::new(reader, metrics.clone()),
            metrics,
        }
    }

    /// A handle that can split this reader from another thread.
    pub fn split_handle(&self) -> DynamicSplitHandle<T> {
        self.split.clone()
    }

    pub fn state(&self) -> ReadState {
        self.adapter.state()
    }

    /// The Source the reader is bound to right now.
    pub fn current_source(&self) -> Arc<dyn BoundedSource<T>> {
        lock_reader(&self.adapter.cursor().reader).current_source()
    }
}

impl<T> ReaderIterator<T> for BoundedReaderIterator<T> {
    type Item = Timestamped<T>;

    fn has_next(&mut self) -> Result<bool, SourceError> {
        self.adapter.has_next()
    }

    fn next(&mut self) -> Result<Timestamped<T>, SourceError> {
        let item = self.adapter.take_next()?;
        self.metrics.records_read.add(1, &kind_label("bounded"));
        Ok(item)
    }

    fn progress(&self) -> Option<ApproximateProgress> {
        let fraction = lock_reader(&self.adapter.cursor().reader).fraction_consumed();
        Some(ApproximateProgress {
            percent_complete: fraction,
        })
    }

    fn request_dynamic_split(
        &mut self,
        request: &DynamicSplitRequest,
    ) -> Result<Option<BoundedSourceSplit<T>>, SourceError> {
        self.split.request_dynamic_split(request)
    }

    fn close(&mut self) -> Result<(), SourceError> {
        lock_reader(&self.adapter.cursor().reader).close()
    }
}

struct UnboundedCursor<T> {
    reader: Box<dyn UnboundedReader<T>>,
}

impl<T> Cursor for UnboundedCursor<T> {
    type Item = ValueWithRecordId<T>;

    fn start(&mut self) -> Result<bool, SourceError> {
        self.reader.start()
    }

    fn advance(&mut self) -> Result<bool, SourceError> {
        self.reader.advance()
    }

    fn current(&mut self) -> Result<Timestamped<ValueWithRecordId<T>>, SourceError> {
        let value = ValueWithRecordId {
            value: self.reader.current()?,
            id: self.reader.current_record_id()?,
        };
        Ok(Timestamped::new(value, self.reader.current_timestamp()?))
    }

    fn describe(&self) -> String {
        format!("{:?}", self.reader.current_source())
    }
}

/// Iterates one bundle of an unbounded reader.
///
/// Reports no more records once the bundle limits are hit even if the
/// reader has more. The deadline starts counting when the iterator is
/// created.
pub struct UnboundedReaderIterator<T> {
    adapter: ReaderIteratorAdapter<UnboundedCursor<T>>,
    limits: BundleLimits,
    clock: Arc<dyn Clock>,
    deadline: Instant,
    elems_read: usize,
    metrics: ReadMetrics,
}

impl<T> fmt::Debug for UnboundedReaderIterator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnboundedReaderIterator")
            .field("state", &self.adapter.state())
            .field("limits", &self.limits)
            .field("elems_read", &self.elems_read)
            .finish_non_exhaustive()
    }
}

impl<T> UnboundedReaderIterator<T> {
    /// `state` is where the previous bundle left the reader, or
    /// [`ReadState::BeforeStart`] for a fresh one.
    pub fn new(
        reader: Box<dyn UnboundedReader<T>>,
        state: ReadState,
        limits: BundleLimits,
        clock: Arc<dyn Clock>,
        metrics: ReadMetrics,
    ) -> Self {
        let deadline = clock.now() + limits.max_read_time;
        Self {
            adapter: ReaderIteratorAdapter::resume(UnboundedCursor { reader }, state),
            limits,
            clock,
            deadline,
            elems_read: 0,
            metrics,
        }
    }

    pub fn elements_read(&self) -> usize {
        self.elems_read
    }

    pub fn state(&self) -> ReadState {
        self.adapter.state()
    }

    /// Snapshot of the reader's progress so far.
    pub fn checkpoint_mark(&self) -> Result<Box<dyn CheckpointMark>, SourceError> {
        self.adapter.cursor().reader.checkpoint_mark()
    }

    /// Give the reader back for parking, along with the state the
    /// next bundle resumes from.
    pub fn into_reader(self) -> (Box<dyn UnboundedReader<T>>, ReadState) {
        let state = self.adapter.state().parked();
        (self.adapter.into_cursor().reader, state)
    }

    fn bundle_done(&self) -> bool {
        if self.elems_read >= self.limits.max_records {
            tracing::trace!("Bundle reached {} records", self.elems_read);
            return true;
        }
        if self.clock.now() > self.deadline {
            tracing::trace!(
                "Bundle reached its read time limit of {:?} after {} records",
                self.limits.max_read_time,
                self.elems_read
            );
            return true;
        }
        false
    }
}

impl<T> ReaderIterator<T> for UnboundedReaderIterator<T> {
    type Item = Timestamped<ValueWithRecordId<T>>;

    /// A record the cursor already moved onto is always handed out,
    /// even past the bundle limits.
    fn has_next(&mut self) -> Result<bool, SourceError> {
        if self.adapter.state().has_record() {
            return Ok(true);
        }
        if self.bundle_done() {
            return Ok(false);
        }
        self.adapter.has_next()
    }

    fn next(&mut self) -> Result<Self::Item, SourceError> {
        let item = self.adapter.take_next()?;
        self.elems_read += 1;
        self.metrics.records_read.add(1, &kind_label("unbounded"));
        Ok(item)
    }

    fn progress(&self) -> Option<ApproximateProgress> {
        None
    }

    fn request_dynamic_split(
        &mut self,
        _request: &DynamicSplitRequest,
    ) -> Result<Option<BoundedSourceSplit<T>>, SourceError> {
        Ok(None)
    }

    /// The reader outlives the bundle; it is closed when the session
    /// retires or abandons it.
    fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Where a reader is being created.
pub enum ExecutionContext<'a, T> {
    /// Bounded bundles, read to the end.
    Batch,
    /// One bundle of an unbounded slot.
    Streaming {
        session: &'a UnboundedSession<T>,
        key: &'a SlotKey,
    },
}

/// A reader iterator of either kind.
#[derive(Debug)]
pub enum WorkerReader<T> {
    Bounded(BoundedReaderIterator<T>),
    Unbounded(UnboundedReaderIterator<T>),
}

/// Build the reader for `spec` in `context`.
///
/// Streaming contexts decode through the session's own registry and
/// options.
pub fn create_reader<T: 'static>(
    spec: &SourceSpec,
    registry: &SourceRegistry<T>,
    options: &PipelineOptions,
    context: ExecutionContext<'_, T>,
) -> Result<WorkerReader<T>, SourceError> {
    match context {
        ExecutionContext::Batch => match registry.decode(&spec.serialized_source)? {
            AnySource::Bounded(source) => {
                tracing::info!("Creating bounded reader for {source:?}");
                let reader = source.create_reader(options)?;
                Ok(WorkerReader::Bounded(BoundedReaderIterator::new(
                    reader,
                    ReadMetrics::new(),
                )))
            }
            AnySource::Unbounded(source) => Err(SourceError::UnsupportedOperation(format!(
                "unbounded source {source:?} can only be read in a streaming context"
            ))),
        },
        ExecutionContext::Streaming { session, key } => {
            Ok(WorkerReader::Unbounded(session.open_bundle(key, spec)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::operation::SourceFormat;
    use crate::read::evaluate_bounded;
    use crate::recovery::InMemCheckpointStore;
    use crate::testing::{registry, CountingSource, RangeSource, TestingClock};

    fn spec_for(source: AnySource<u64>) -> SourceSpec {
        SourceFormat::new(Arc::new(registry()), PipelineOptions::default())
            .serialize_to_cloud_source(&source)
            .unwrap()
            .spec
    }

    fn bounded_iterator(source: RangeSource) -> BoundedReaderIterator<u64> {
        let reader = Arc::new(source)
            .create_reader(&PipelineOptions::default())
            .unwrap();
        BoundedReaderIterator::new(reader, ReadMetrics::new())
    }

    fn values(source: Arc<dyn BoundedSource<u64>>) -> Vec<u64> {
        evaluate_bounded(source, &PipelineOptions::default())
            .unwrap()
            .into_iter()
            .map(|item| item.value)
            .collect()
    }

    #[test]
    fn bounded_progress_tracks_fraction_consumed() {
        let mut iterator = bounded_iterator(RangeSource::new(0, 4));
        assert_eq!(iterator.progress().unwrap().percent_complete, Some(0.0));
        iterator.next().unwrap();
        iterator.next().unwrap();
        iterator.has_next().unwrap();
        assert_eq!(iterator.progress().unwrap().percent_complete, Some(0.5));
        while iterator.has_next().unwrap() {
            iterator.next().unwrap();
        }
        assert_eq!(iterator.progress().unwrap().percent_complete, Some(1.0));
        iterator.close().unwrap();
    }

    #[test]
    fn bounded_split_through_iterator() {
        let mut iterator = bounded_iterator(RangeSource::new(0, 10));
        let mut seen = vec![iterator.next().unwrap().value];
        let split = iterator
            .request_dynamic_split(&DynamicSplitRequest::at_fraction(0.5))
            .unwrap()
            .unwrap();
        assert!(same_instance(&split.primary, &iterator.current_source()));
        while iterator.has_next().unwrap() {
            seen.push(iterator.next().unwrap().value);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(values(split.residual), vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn concurrent_splits_lose_nothing() {
        const LEN: u64 = 5_000;
        let mut iterator = bounded_iterator(RangeSource::new(0, LEN));
        let handle = iterator.split_handle();

        let (mut seen, residuals) = std::thread::scope(|scope| {
            let splitter = scope.spawn(move || {
                let mut residuals = Vec::new();
                for _ in 0..200 {
                    let fraction = fastrand::f64();
                    if let Some(split) = handle.split_at_fraction(fraction).unwrap() {
                        residuals.push(split.residual);
                    }
                    std::thread::yield_now();
                }
                residuals
            });
            let mut seen = Vec::new();
            while iterator.has_next().unwrap() {
                seen.push(iterator.next().unwrap().value);
            }
            (seen, splitter.join().unwrap())
        });

        for residual in residuals {
            seen.extend(values(residual));
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..LEN).collect::<Vec<_>>());
    }

    #[test]
    fn start_failure_is_wrapped_with_source() {
        let mut iterator = bounded_iterator(RangeSource {
            fail_start: true,
            ..RangeSource::new(0, 3)
        });
        match iterator.has_next() {
            Err(SourceError::ReadStart {
                source_description,
                cause,
            }) => {
                assert!(source_description.contains("RangeSource"));
                assert!(matches!(*cause, SourceError::Io(_)));
            }
            other => panic!("expected ReadStart, got {other:?}"),
        }
        assert!(matches!(
            iterator.next(),
            Err(SourceError::NoSuchElement)
        ));
    }

    #[test]
    fn unbounded_iterator_tags_records_and_declines_splits() {
        let reader = Arc::new(CountingSource::new())
            .create_reader(&PipelineOptions::default(), None)
            .unwrap();
        let mut iterator = UnboundedReaderIterator::new(
            reader,
            ReadState::BeforeStart,
            BundleLimits::default(),
            Arc::new(TestingClock::new(Duration::ZERO)),
            ReadMetrics::new(),
        );
        let item = iterator.next().unwrap();
        assert_eq!(item.value.value, 0);
        assert_eq!(item.value.id, RecordId(0u64.to_be_bytes().to_vec()));
        assert!(iterator.progress().is_none());
        assert!(iterator
            .request_dynamic_split(&DynamicSplitRequest::at_fraction(0.5))
            .unwrap()
            .is_none());
        let (_reader, state) = iterator.into_reader();
        assert_eq!(state, ReadState::BeforeAdvance);
    }

    #[test]
    fn unstarted_reader_is_parked_unstarted() {
        let reader = Arc::new(CountingSource::new())
            .create_reader(&PipelineOptions::default(), None)
            .unwrap();
        let mut iterator = UnboundedReaderIterator::new(
            reader,
            ReadState::BeforeStart,
            BundleLimits {
                max_records: 0,
                ..Default::default()
            },
            Arc::new(TestingClock::new(Duration::ZERO)),
            ReadMetrics::new(),
        );
        assert!(!iterator.has_next().unwrap());
        let (_reader, state) = iterator.into_reader();
        assert_eq!(state, ReadState::BeforeStart);
    }

    #[test]
    fn record_under_cursor_survives_the_deadline() {
        let reader = Arc::new(CountingSource::new())
            .create_reader(&PipelineOptions::default(), None)
            .unwrap();
        let clock = Arc::new(TestingClock::new(Duration::ZERO));
        let mut iterator = UnboundedReaderIterator::new(
            reader,
            ReadState::BeforeStart,
            BundleLimits::default(),
            clock.clone(),
            ReadMetrics::new(),
        );
        assert_eq!(iterator.next().unwrap().value.value, 0);
        assert!(iterator.has_next().unwrap());
        clock.advance(Duration::from_secs(11));
        assert!(iterator.has_next().unwrap());
        assert_eq!(iterator.next().unwrap().value.value, 1);
        assert!(!iterator.has_next().unwrap());
    }

    #[test]
    fn factory_picks_reader_by_context() {
        let registry = registry();
        let options = PipelineOptions::default();
        let bounded = spec_for(AnySource::Bounded(Arc::new(RangeSource::new(0, 3))));
        let unbounded = spec_for(AnySource::Unbounded(Arc::new(CountingSource::new())));

        assert!(matches!(
            create_reader(&bounded, &registry, &options, ExecutionContext::Batch),
            Ok(WorkerReader::Bounded(_))
        ));
        assert!(matches!(
            create_reader(&unbounded, &registry, &options, ExecutionContext::Batch),
            Err(SourceError::UnsupportedOperation(_))
        ));

        let session = UnboundedSession::new(
            Arc::new(crate::testing::registry()),
            options.clone(),
            Arc::new(InMemCheckpointStore::new()),
        );
        let key = SlotKey::for_split(0);
        let context = ExecutionContext::Streaming {
            session: &session,
            key: &key,
        };
        assert!(matches!(
            create_reader(&unbounded, &registry, &options, context),
            Ok(WorkerReader::Unbounded(_))
        ));
    }
}
