//! Unbounded reading, one bundle at a time.
//!
//! An unbounded Source is fanned out once into initial splits and each
//! split is owned by a slot that the surrounding scheduler runs over
//! and over as a sequence of bundles. Between bundles the slot's reader
//! is parked in a cache, so the next bundle on the same worker
//! continues where the last one stopped without calling `start` again.
//! When there is no cached reader (first bundle, or the slot moved to
//! this worker) the reader is rebuilt from the split's Source and the
//! last checkpoint mark committed for the slot.
//!
//! Bundles are cut short after [`MAX_BUNDLE_SIZE`] records or
//! [`MAX_BUNDLE_READ_TIME`] of reading, whichever comes first, so a
//! crash never loses much uncommitted work.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::PipelineOptions;
use crate::errors::{Reraise, SourceError};
use crate::inputs::UnboundedReaderIterator;
use crate::iterator::ReadState;
use crate::metrics::{kind_label, ReadMetrics};
use crate::operation::SourceSpec;
use crate::recovery::{open_store, CheckpointBytes, CheckpointStore};
use crate::serde::{decode_checkpoint, encode_checkpoint, SourceRegistry};
use crate::source::UnboundedReader;

/// Most records in one unbounded bundle.
pub const MAX_BUNDLE_SIZE: usize = 10_000;

/// Longest an unbounded bundle keeps reading.
pub const MAX_BUNDLE_READ_TIME: Duration = Duration::from_secs(10);

/// Width of the hex split index at the front of a slot key.
const SLOT_KEY_INDEX_DIGITS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleLimits {
    pub max_records: usize,
    pub max_read_time: Duration,
}

impl Default for BundleLimits {
    fn default() -> Self {
        Self {
            max_records: MAX_BUNDLE_SIZE,
            max_read_time: MAX_BUNDLE_READ_TIME,
        }
    }
}

/// Source of "now" for bundle deadlines.
pub trait Clock: fmt::Debug + Send + Sync {
    fn now(&self) -> Instant;
}

/// Real time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Stable identity of an unbounded work slot.
///
/// The first 16 characters are the zero-padded hex of the split index
/// plus one; anything after that is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey(String);

impl SlotKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key of the slot owning initial split `index`.
    pub fn for_split(index: usize) -> Self {
        Self(format!("{:016x}", index as u64 + 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Index of the initial split this slot reads.
    pub fn split_index(&self) -> Result<usize, SourceError> {
        let invalid = |reason: String| SourceError::InvalidSlotKey {
            key: self.0.clone(),
            reason,
        };
        let digits = self
            .0
            .get(..SLOT_KEY_INDEX_DIGITS)
            .ok_or_else(|| invalid(format!("expected at least {SLOT_KEY_INDEX_DIGITS} hex digits")))?;
        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid(format!("{digits:?} is not hex")));
        }
        let encoded = u64::from_str_radix(digits, 16).map_err(|err| invalid(err.to_string()))?;
        let index = encoded
            .checked_sub(1)
            .ok_or_else(|| invalid("split indexes are encoded starting at 1".to_string()))?;
        usize::try_from(index).map_err(|err| invalid(err.to_string()))
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct ParkedReader<T> {
    reader: Box<dyn UnboundedReader<T>>,
    state: ReadState,
}

/// Owns the readers of every unbounded slot on this worker.
///
/// Bundles of one slot run one after another; bundles of different
/// slots may run concurrently. The cache is only touched to take a
/// reader out at [`UnboundedSession::open_bundle`] and to put it back
/// at [`UnboundedSession::finish_bundle`], so no lock is held while
/// reading.
pub struct UnboundedSession<T> {
    registry: Arc<SourceRegistry<T>>,
    options: PipelineOptions,
    store: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
    limits: BundleLimits,
    cache: Mutex<HashMap<SlotKey, ParkedReader<T>>>,
    metrics: ReadMetrics,
}

impl<T> fmt::Debug for UnboundedSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut cached: Vec<SlotKey> = self.lock_cache().keys().cloned().collect();
        cached.sort();
        f.debug_struct("UnboundedSession")
            .field("store", &self.store)
            .field("limits", &self.limits)
            .field("cached", &cached)
            .finish()
    }
}

impl<T> UnboundedSession<T> {
    fn lock_cache(&self) -> MutexGuard<'_, HashMap<SlotKey, ParkedReader<T>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: 'static> UnboundedSession<T> {
    pub fn new(
        registry: Arc<SourceRegistry<T>>,
        options: PipelineOptions,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            registry,
            options,
            store,
            clock: Arc::new(SystemClock),
            limits: BundleLimits::default(),
            cache: Mutex::new(HashMap::new()),
            metrics: ReadMetrics::new(),
        }
    }

    /// Session whose checkpoint store is picked by
    /// [`open_store`] from the options.
    pub fn from_options(
        registry: Arc<SourceRegistry<T>>,
        options: PipelineOptions,
    ) -> Result<Self, SourceError> {
        let store = open_store(&options)?;
        Ok(Self::new(registry, options, store))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_limits(mut self, limits: BundleLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> BundleLimits {
        self.limits
    }

    pub fn is_cached(&self, key: &SlotKey) -> bool {
        self.lock_cache().contains_key(key)
    }

    /// Begin a bundle for the slot `key` of the unbounded Source in
    /// `spec`.
    pub fn open_bundle(
        &self,
        key: &SlotKey,
        spec: &SourceSpec,
    ) -> Result<UnboundedReaderIterator<T>, SourceError> {
        let parked = self.lock_cache().remove(key);
        let (reader, state) = match parked {
            Some(parked) => {
                tracing::debug!("Reusing cached reader for slot {key}");
                (parked.reader, parked.state)
            }
            None => (self.restore_reader(key, spec)?, ReadState::BeforeStart),
        };
        Ok(UnboundedReaderIterator::new(
            reader,
            state,
            self.limits,
            self.clock.clone(),
            self.metrics.clone(),
        ))
    }

    fn restore_reader(
        &self,
        key: &SlotKey,
        spec: &SourceSpec,
    ) -> Result<Box<dyn UnboundedReader<T>>, SourceError> {
        let index = key.split_index()?;
        let splits = spec.serialized_source_splits.as_ref().ok_or_else(|| {
            SourceError::deserialization(
                "unbounded source splits",
                "source spec did not contain splits",
            )
        })?;
        let encoded = splits.get(index).ok_or_else(|| {
            SourceError::deserialization(
                "unbounded source splits",
                format!(
                    "too few splits; requested index was {index}, size was {}",
                    splits.len()
                ),
            )
        })?;
        let source = self.registry.decode_unbounded(encoded)?;

        let checkpoint = match source.checkpoint_coder() {
            Some(coder) => match self.store.read(key)? {
                Some(bytes) => {
                    tracing::info!("Resuming split {index} of slot {key} from checkpoint");
                    Some(decode_checkpoint(&*coder, &bytes.0)?)
                }
                None => None,
            },
            None => None,
        };
        tracing::info!("Creating reader for split {index}: {source:?}");
        source
            .create_reader(&self.options, checkpoint)
            .reraise_with(|| format!("error creating reader for slot {key}"))
    }

    /// End a bundle: commit the reader's checkpoint and park the
    /// reader for the slot's next bundle.
    ///
    /// If committing fails the reader is closed instead of parked; the
    /// next bundle resumes from the last committed checkpoint.
    pub fn finish_bundle(
        &self,
        key: &SlotKey,
        iterator: UnboundedReaderIterator<T>,
    ) -> Result<(), SourceError> {
        let read = iterator.elements_read();
        let (mut reader, state) = iterator.into_reader();
        if let Err(err) = self.commit_checkpoint(key, &*reader) {
            if let Err(close_err) = reader.close() {
                tracing::warn!("Error closing reader for slot {key}: {close_err}");
            }
            return Err(err);
        }
        tracing::trace!("Finished bundle of {read} records for slot {key}");

        let replaced = self
            .lock_cache()
            .insert(key.clone(), ParkedReader { reader, state });
        if let Some(mut stale) = replaced {
            tracing::warn!("Replacing an already cached reader for slot {key}");
            stale.reader.close()?;
        }
        Ok(())
    }

    fn commit_checkpoint(
        &self,
        key: &SlotKey,
        reader: &dyn UnboundedReader<T>,
    ) -> Result<(), SourceError> {
        let Some(coder) = reader.current_source().checkpoint_coder() else {
            return Ok(());
        };
        let mark = reader.checkpoint_mark()?;
        let bytes = encode_checkpoint(&*coder, &*mark)?;
        self.store.write(key, CheckpointBytes(bytes))?;
        mark.finalize_checkpoint()?;
        self.metrics
            .checkpoints_committed
            .add(1, &kind_label("unbounded"));
        Ok(())
    }

    /// End a failed bundle without committing anything. The reader is
    /// closed; the slot's next bundle resumes from the last committed
    /// checkpoint.
    pub fn abandon_bundle(
        &self,
        key: &SlotKey,
        iterator: UnboundedReaderIterator<T>,
    ) -> Result<(), SourceError> {
        tracing::debug!(
            "Abandoning bundle for slot {key} after {} records",
            iterator.elements_read()
        );
        let (mut reader, _) = iterator.into_reader();
        reader.close()
    }

    /// Drop the cached reader for `key`, closing it. Returns whether
    /// one was cached. The committed checkpoint is kept.
    pub fn retire(&self, key: &SlotKey) -> Result<bool, SourceError> {
        let parked = self.lock_cache().remove(key);
        match parked {
            Some(mut parked) => {
                tracing::debug!("Retiring reader for slot {key}");
                parked.reader.close()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Retire `key` and discard its checkpoint, for a slot that will
    /// never be read again.
    pub fn retire_and_forget(&self, key: &SlotKey) -> Result<bool, SourceError> {
        let retired = self.retire(key)?;
        self.store.discard(key)?;
        Ok(retired)
    }
}
