//! The Source data model.
//!
//! A Source is an immutable description of where and how to read.
//! It comes in two capability sets: [`BoundedSource`] (finite,
//! statically splittable, truncatable at a fraction while being read)
//! and [`UnboundedSource`] (infinite, split once into a fixed initial
//! fan-out, resumable from a [`CheckpointMark`]). [`AnySource`] is the
//! sum of the two and is what crosses the coordinator boundary.
//!
//! Sources are shared as `Arc<dyn ...>`. Identity matters: a
//! successful dynamic split must hand back *new* instances, which is
//! checked with [`same_instance`].

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::PipelineOptions;
use crate::errors::SourceError;

/// Capabilities shared by both kinds of Source.
pub trait Source: fmt::Debug + Send + Sync {
    /// Registry name used to find the decoder for this Source.
    fn kind(&self) -> &str;

    /// Reject a Source that can't be read, split or serialized.
    fn validate(&self) -> Result<(), SourceError>;

    /// The Source's own fields, to be wrapped in a versioned envelope
    /// by [`crate::serde::encode_source`].
    fn encode_state(&self) -> Result<serde_json::Value, SourceError>;
}

/// A finite Source.
pub trait BoundedSource<T>: Source {
    /// Best-effort size estimate.
    fn estimated_size_bytes(&self, options: &PipelineOptions) -> Result<u64, SourceError>;

    /// Whether records come out ordered by key.
    fn produces_sorted_keys(&self, _options: &PipelineOptions) -> Result<bool, SourceError> {
        Ok(false)
    }

    /// Split into independent bundles of roughly the given size.
    fn split_into_bundles(
        &self,
        desired_bundle_size_bytes: u64,
        options: &PipelineOptions,
    ) -> Result<Vec<Arc<dyn BoundedSource<T>>>, SourceError>;

    fn create_reader(
        self: Arc<Self>,
        options: &PipelineOptions,
    ) -> Result<Box<dyn BoundedReader<T>>, SourceError>;
}

/// An infinite Source.
pub trait UnboundedSource<T>: Source {
    /// Fan out into independently readable splits. `desired_num_splits`
    /// is a hint.
    fn generate_initial_splits(
        &self,
        desired_num_splits: usize,
        options: &PipelineOptions,
    ) -> Result<Vec<Arc<dyn UnboundedSource<T>>>, SourceError>;

    /// Create a reader, resuming from `checkpoint` if given.
    fn create_reader(
        self: Arc<Self>,
        options: &PipelineOptions,
        checkpoint: Option<Box<dyn CheckpointMark>>,
    ) -> Result<Box<dyn UnboundedReader<T>>, SourceError>;

    /// Coder for this Source's checkpoint marks. `None` means readers
    /// of this Source are never resumed from a checkpoint.
    fn checkpoint_coder(&self) -> Option<Arc<dyn CheckpointCoder>>;
}

/// Either kind of Source.
pub enum AnySource<T> {
    Bounded(Arc<dyn BoundedSource<T>>),
    Unbounded(Arc<dyn UnboundedSource<T>>),
}

impl<T> AnySource<T> {
    pub fn kind(&self) -> &str {
        match self {
            AnySource::Bounded(source) => source.kind(),
            AnySource::Unbounded(source) => source.kind(),
        }
    }

    pub fn validate(&self) -> Result<(), SourceError> {
        match self {
            AnySource::Bounded(source) => source.validate(),
            AnySource::Unbounded(source) => source.validate(),
        }
    }

    pub fn encode_state(&self) -> Result<serde_json::Value, SourceError> {
        match self {
            AnySource::Bounded(source) => source.encode_state(),
            AnySource::Unbounded(source) => source.encode_state(),
        }
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self, AnySource::Bounded(_))
    }

    pub fn into_bounded(self) -> Option<Arc<dyn BoundedSource<T>>> {
        match self {
            AnySource::Bounded(source) => Some(source),
            AnySource::Unbounded(_) => None,
        }
    }

    pub fn into_unbounded(self) -> Option<Arc<dyn UnboundedSource<T>>> {
        match self {
            AnySource::Bounded(_) => None,
            AnySource::Unbounded(source) => Some(source),
        }
    }
}

impl<T> Clone for AnySource<T> {
    fn clone(&self) -> Self {
        match self {
            AnySource::Bounded(source) => AnySource::Bounded(source.clone()),
            AnySource::Unbounded(source) => AnySource::Unbounded(source.clone()),
        }
    }
}

impl<T> fmt::Debug for AnySource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnySource::Bounded(source) => fmt::Debug::fmt(&**source, f),
            AnySource::Unbounded(source) => fmt::Debug::fmt(&**source, f),
        }
    }
}

/// Are these the same Source object?
///
/// Compares data pointers only; vtable pointers for the same type can
/// differ between codegen units.
pub fn same_instance<S: ?Sized>(a: &Arc<S>, b: &Arc<S>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// A value with its event timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamped<T> {
    pub value: T,
    pub timestamp: DateTime<Utc>,
}

impl<T> Timestamped<T> {
    pub fn new(value: T, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }
}

/// Per-record identifier used downstream to drop replays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub Vec<u8>);

/// An unbounded record and its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueWithRecordId<T> {
    pub value: T,
    pub id: RecordId,
}

/// A pull-style cursor over one Source.
///
/// Readers are owned by exactly one execution context; they never
/// need to be `Sync`.
pub trait Reader<T>: Send {
    /// Move to the first record. Returns whether one is available.
    fn start(&mut self) -> Result<bool, SourceError>;

    /// Move to the next record. Returns whether one is available.
    fn advance(&mut self) -> Result<bool, SourceError>;

    /// The record at the cursor. Only valid after `start` or
    /// `advance` returned `true`.
    fn current(&self) -> Result<T, SourceError>;

    fn current_timestamp(&self) -> Result<DateTime<Utc>, SourceError> {
        Ok(DateTime::<Utc>::MIN_UTC)
    }

    fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// A reader of a [`BoundedSource`].
pub trait BoundedReader<T>: Reader<T> {
    /// The Source this reader is currently bound to. Changes (to a new
    /// instance) after a successful [`BoundedReader::split_at_fraction`].
    fn current_source(&self) -> Arc<dyn BoundedSource<T>>;

    /// Estimated completion in `[0, 1]`, if known.
    fn fraction_consumed(&self) -> Option<f64> {
        None
    }

    /// Truncate this reader's range at `fraction`.
    ///
    /// On success the reader keeps the primary (now
    /// [`BoundedReader::current_source`]) and returns the residual.
    /// `None` declines the split.
    fn split_at_fraction(&mut self, _fraction: f64) -> Option<Arc<dyn BoundedSource<T>>> {
        None
    }
}

/// A reader of an [`UnboundedSource`].
pub trait UnboundedReader<T>: Reader<T> {
    fn current_source(&self) -> Arc<dyn UnboundedSource<T>>;

    fn current_record_id(&self) -> Result<RecordId, SourceError> {
        Ok(RecordId::default())
    }

    /// Snapshot of everything read so far.
    fn checkpoint_mark(&self) -> Result<Box<dyn CheckpointMark>, SourceError>;
}

/// Opaque progress snapshot of an unbounded reader.
pub trait CheckpointMark: fmt::Debug + Send {
    /// Called once the mark has been durably committed.
    fn finalize_checkpoint(&self) -> Result<(), SourceError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Converts checkpoint marks to and from bytes.
pub trait CheckpointCoder: fmt::Debug + Send + Sync {
    fn encode(&self, mark: &dyn CheckpointMark) -> Result<Vec<u8>, SourceError>;

    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn CheckpointMark>, SourceError>;
}

/// [`CheckpointCoder`] for any serde-able mark type, stored as JSON.
pub struct JsonCheckpointCoder<M>(PhantomData<fn() -> M>);

impl<M> JsonCheckpointCoder<M> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<M> Default for JsonCheckpointCoder<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for JsonCheckpointCoder<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JsonCheckpointCoder<{}>", std::any::type_name::<M>())
    }
}

impl<M> CheckpointCoder for JsonCheckpointCoder<M>
where
    M: CheckpointMark + Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, mark: &dyn CheckpointMark) -> Result<Vec<u8>, SourceError> {
        let mark = mark.as_any().downcast_ref::<M>().ok_or_else(|| {
            SourceError::Codec(format!(
                "checkpoint mark {mark:?} is not a {}",
                std::any::type_name::<M>()
            ))
        })?;
        Ok(serde_json::to_vec(mark)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn CheckpointMark>, SourceError> {
        let mark: M = serde_json::from_slice(bytes)
            .map_err(|err| SourceError::deserialization("checkpoint mark", err))?;
        Ok(Box::new(mark))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OffsetMark {
        offset: u64,
    }

    impl CheckpointMark for OffsetMark {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug)]
    struct OtherMark;

    impl CheckpointMark for OtherMark {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn json_coder_restores_mark() {
        let coder = JsonCheckpointCoder::<OffsetMark>::new();
        let bytes = coder.encode(&OffsetMark { offset: 42 }).unwrap();
        let mark = coder.decode(&bytes).unwrap();
        assert_eq!(
            mark.as_any().downcast_ref::<OffsetMark>(),
            Some(&OffsetMark { offset: 42 })
        );
    }

    #[test]
    fn json_coder_rejects_foreign_mark() {
        let coder = JsonCheckpointCoder::<OffsetMark>::new();
        assert!(matches!(
            coder.encode(&OtherMark),
            Err(SourceError::Codec(_))
        ));
    }

    #[test]
    fn json_coder_garbage_is_deserialization_error() {
        let coder = JsonCheckpointCoder::<OffsetMark>::new();
        assert!(matches!(
            coder.decode(b"{"),
            Err(SourceError::Deserialization { .. })
        ));
    }

    #[test]
    fn same_instance_is_identity_not_equality() {
        let a: Arc<str> = Arc::from("x");
        let b: Arc<str> = Arc::from("x");
        assert!(same_instance(&a, &a.clone()));
        assert!(!same_instance(&a, &b));
    }
}
