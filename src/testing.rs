//! Reference Sources and a manual clock for exercising the read path.
//!
//! [`RangeSource`] is a bounded source of consecutive `u64`s that
//! supports static and fractional splitting. [`CountingSource`] is an
//! unbounded counter that can be split into strided partitions and
//! resumed from a [`CountingMark`]. Both carry knobs that make them
//! misbehave in the specific ways the read path must catch.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PipelineOptions;
use crate::errors::{tracked_err, SourceError};
use crate::serde::SourceRegistry;
use crate::session::Clock;
use crate::source::*;

fn timestamp_for(value: u64) -> Result<DateTime<Utc>, SourceError> {
    let secs = i64::try_from(value).map_err(|err| SourceError::Invalid(err.to_string()))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| SourceError::Invalid(format!("no timestamp for {value}")))
}

/// Bounded source over `[start, end)`.
///
/// Each record's timestamp is its value in seconds since the epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSource {
    pub start: u64,
    pub end: u64,
    /// Size estimation fails.
    #[serde(default)]
    pub fail_size_estimate: bool,
    /// Sortedness check fails.
    #[serde(default)]
    pub fail_sorted_keys: bool,
    /// The last static bundle has its bounds reversed.
    #[serde(default)]
    pub invalid_bundles: bool,
    /// Readers "split" by handing back their own Source.
    #[serde(default)]
    pub reuse_source_on_split: bool,
    /// Readers produce a primary with reversed bounds on split.
    #[serde(default)]
    pub invalid_primary: bool,
    /// Readers narrow themselves on split but hand back their old
    /// Source as the residual.
    #[serde(default)]
    pub reuse_source_as_residual: bool,
    /// Readers produce a residual with reversed bounds on split.
    #[serde(default)]
    pub invalid_residual: bool,
    /// Readers fail in `start`.
    #[serde(default)]
    pub fail_start: bool,
}

impl RangeSource {
    pub const KIND: &'static str = "range";

    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            ..Default::default()
        }
    }

    fn with_bounds(&self, start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            ..self.clone()
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Source for RangeSource {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn validate(&self) -> Result<(), SourceError> {
        if self.start > self.end {
            return Err(tracked_err(&format!(
                "range start {} is after end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    fn encode_state(&self) -> Result<serde_json::Value, SourceError> {
        Ok(serde_json::to_value(self)?)
    }
}

impl BoundedSource<u64> for RangeSource {
    fn estimated_size_bytes(&self, _options: &PipelineOptions) -> Result<u64, SourceError> {
        if self.fail_size_estimate {
            return Err(SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "size estimate unavailable",
            )));
        }
        Ok(self.len() * 8)
    }

    fn produces_sorted_keys(&self, _options: &PipelineOptions) -> Result<bool, SourceError> {
        if self.fail_sorted_keys {
            return Err(SourceError::Invalid("sortedness unknown".to_string()));
        }
        Ok(true)
    }

    fn split_into_bundles(
        &self,
        desired_bundle_size_bytes: u64,
        _options: &PipelineOptions,
    ) -> Result<Vec<Arc<dyn BoundedSource<u64>>>, SourceError> {
        let per_bundle = (desired_bundle_size_bytes / 8).max(1);
        let mut bundles: Vec<Arc<dyn BoundedSource<u64>>> = Vec::new();
        let mut lo = self.start;
        while lo < self.end {
            let hi = lo.saturating_add(per_bundle).min(self.end);
            bundles.push(Arc::new(self.with_bounds(lo, hi)));
            lo = hi;
        }
        if bundles.is_empty() {
            bundles.push(Arc::new(self.clone()));
        }
        if self.invalid_bundles {
            bundles.pop();
            bundles.push(Arc::new(self.with_bounds(self.end + 1, self.end)));
        }
        Ok(bundles)
    }

    fn create_reader(
        self: Arc<Self>,
        _options: &PipelineOptions,
    ) -> Result<Box<dyn BoundedReader<u64>>, SourceError> {
        let end = self.end;
        Ok(Box::new(RangeReader {
            source: self,
            end,
            position: None,
        }))
    }
}

/// Reader over a [`RangeSource`].
///
/// `position` is the record at the cursor; every value before it has
/// been handed out.
#[derive(Debug)]
pub struct RangeReader {
    source: Arc<RangeSource>,
    end: u64,
    position: Option<u64>,
}

impl Reader<u64> for RangeReader {
    fn start(&mut self) -> Result<bool, SourceError> {
        if self.source.fail_start {
            return Err(SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "range backend unavailable",
            )));
        }
        self.position = Some(self.source.start);
        Ok(self.source.start < self.end)
    }

    fn advance(&mut self) -> Result<bool, SourceError> {
        let next = self.position.map_or(self.source.start, |pos| pos + 1);
        self.position = Some(next.min(self.end));
        Ok(next < self.end)
    }

    fn current(&self) -> Result<u64, SourceError> {
        match self.position {
            Some(pos) if pos < self.end => Ok(pos),
            _ => Err(SourceError::NoSuchElement),
        }
    }

    fn current_timestamp(&self) -> Result<DateTime<Utc>, SourceError> {
        timestamp_for(self.current()?)
    }
}

impl BoundedReader<u64> for RangeReader {
    fn current_source(&self) -> Arc<dyn BoundedSource<u64>> {
        self.source.clone()
    }

    fn fraction_consumed(&self) -> Option<f64> {
        let start = self.source.start;
        let len = self.end.saturating_sub(start);
        if len == 0 {
            return Some(1.0);
        }
        let consumed = match self.position {
            None => 0,
            Some(pos) => pos.min(self.end).saturating_sub(start),
        };
        Some(consumed as f64 / len as f64)
    }

    fn split_at_fraction(&mut self, fraction: f64) -> Option<Arc<dyn BoundedSource<u64>>> {
        if !(fraction > 0.0 && fraction < 1.0) {
            return None;
        }
        let start = self.source.start;
        let split = start + (self.end.saturating_sub(start) as f64 * fraction).round() as u64;
        // The record at the cursor has already been claimed.
        let min_split = self.position.map_or(start + 1, |pos| pos + 1);
        if split < min_split || split >= self.end {
            return None;
        }
        if self.source.reuse_source_on_split {
            return Some(self.source.clone());
        }

        let residual: Arc<dyn BoundedSource<u64>> = if self.source.reuse_source_as_residual {
            self.source.clone()
        } else if self.source.invalid_residual {
            Arc::new(self.source.with_bounds(self.end, split.saturating_sub(1)))
        } else {
            Arc::new(self.source.with_bounds(split, self.end))
        };
        self.source = if self.source.invalid_primary {
            Arc::new(self.source.with_bounds(split, start))
        } else {
            Arc::new(self.source.with_bounds(start, split))
        };
        self.end = split;
        Some(residual)
    }
}

/// Checkpoint of a [`CountingReader`]: the next value it will emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountingMark {
    pub next: u64,
}

impl CheckpointMark for CountingMark {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Unbounded source counting up from `start` by `stride`, forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountingSource {
    pub start: u64,
    pub stride: u64,
    /// `generate_initial_splits` returns nothing.
    #[serde(default)]
    pub zero_splits: bool,
    /// The source declares no checkpoint coder.
    #[serde(default)]
    pub no_checkpoint_coder: bool,
    /// Readers fail in `close`.
    #[serde(default)]
    pub fail_close: bool,
}

impl Default for CountingSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CountingSource {
    pub const KIND: &'static str = "counting";

    pub fn new() -> Self {
        Self {
            start: 0,
            stride: 1,
            zero_splits: false,
            no_checkpoint_coder: false,
            fail_close: false,
        }
    }
}

impl Source for CountingSource {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn validate(&self) -> Result<(), SourceError> {
        if self.stride == 0 {
            return Err(tracked_err("counting stride must be positive"));
        }
        Ok(())
    }

    fn encode_state(&self) -> Result<serde_json::Value, SourceError> {
        Ok(serde_json::to_value(self)?)
    }
}

impl UnboundedSource<u64> for CountingSource {
    fn generate_initial_splits(
        &self,
        desired_num_splits: usize,
        _options: &PipelineOptions,
    ) -> Result<Vec<Arc<dyn UnboundedSource<u64>>>, SourceError> {
        if self.zero_splits {
            return Ok(Vec::new());
        }
        let n = desired_num_splits.max(1) as u64;
        Ok((0..n)
            .map(|i| -> Arc<dyn UnboundedSource<u64>> {
                Arc::new(Self {
                    start: self.start + i * self.stride,
                    stride: self.stride * n,
                    ..self.clone()
                })
            })
            .collect())
    }

    fn create_reader(
        self: Arc<Self>,
        _options: &PipelineOptions,
        checkpoint: Option<Box<dyn CheckpointMark>>,
    ) -> Result<Box<dyn UnboundedReader<u64>>, SourceError> {
        let next = match checkpoint {
            Some(mark) => {
                mark.as_any()
                    .downcast_ref::<CountingMark>()
                    .ok_or_else(|| {
                        SourceError::deserialization(
                            "checkpoint mark",
                            format!("{mark:?} is not a CountingMark"),
                        )
                    })?
                    .next
            }
            None => self.start,
        };
        Ok(Box::new(CountingReader {
            source: self,
            next,
            current: None,
        }))
    }

    fn checkpoint_coder(&self) -> Option<Arc<dyn CheckpointCoder>> {
        if self.no_checkpoint_coder {
            None
        } else {
            Some(Arc::new(JsonCheckpointCoder::<CountingMark>::new()))
        }
    }
}

/// Reader over a [`CountingSource`]. Never runs dry.
#[derive(Debug)]
pub struct CountingReader {
    source: Arc<CountingSource>,
    next: u64,
    current: Option<u64>,
}

impl CountingReader {
    fn step(&mut self) -> bool {
        self.current = Some(self.next);
        self.next += self.source.stride;
        true
    }
}

impl Reader<u64> for CountingReader {
    fn start(&mut self) -> Result<bool, SourceError> {
        Ok(self.step())
    }

    fn advance(&mut self) -> Result<bool, SourceError> {
        Ok(self.step())
    }

    fn current(&self) -> Result<u64, SourceError> {
        self.current.ok_or(SourceError::NoSuchElement)
    }

    fn current_timestamp(&self) -> Result<DateTime<Utc>, SourceError> {
        timestamp_for(self.current()?)
    }

    fn close(&mut self) -> Result<(), SourceError> {
        if self.source.fail_close {
            return Err(SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "counting backend went away",
            )));
        }
        Ok(())
    }
}

impl UnboundedReader<u64> for CountingReader {
    fn current_source(&self) -> Arc<dyn UnboundedSource<u64>> {
        self.source.clone()
    }

    fn current_record_id(&self) -> Result<RecordId, SourceError> {
        Ok(RecordId(self.current()?.to_be_bytes().to_vec()))
    }

    fn checkpoint_mark(&self) -> Result<Box<dyn CheckpointMark>, SourceError> {
        Ok(Box::new(CountingMark { next: self.next }))
    }
}

/// Simulated monotonic time. Every call to [`Clock::now`] moves time
/// forward by `step` after reporting.
#[derive(Debug)]
pub struct TestingClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
    step: Duration,
}

impl TestingClock {
    pub fn new(step: Duration) -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            step,
        }
    }

    /// Jump forward without reading.
    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(PoisonError::into_inner);
        *elapsed += by;
    }
}

impl Clock for TestingClock {
    fn now(&self) -> Instant {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.origin + *elapsed;
        *elapsed += self.step;
        now
    }
}

/// Registry that knows every Source in this module.
pub fn registry() -> SourceRegistry<u64> {
    let mut registry = SourceRegistry::new();
    registry
        .register_bounded::<RangeSource>(RangeSource::KIND)
        .register_unbounded::<CountingSource>(CountingSource::KIND);
    registry
}
