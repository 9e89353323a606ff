//! Static splitting.
//!
//! Bounded sources are cut into bundles once, before reading starts.
//! Unbounded sources are fanned out into a fixed set of initial splits
//! which then live for the lifetime of the pipeline.

use std::sync::Arc;

use crate::config::PipelineOptions;
use crate::errors::SourceError;
use crate::metrics::{kind_label, ReadMetrics};
use crate::source::{BoundedSource, UnboundedSource};

/// Bundle size used when neither the request nor the options name one.
pub const DEFAULT_DESIRED_BUNDLE_SIZE_BYTES: u64 = 64 * (1 << 20);

/// One independently schedulable piece of a bounded Source.
pub struct Bundle<T> {
    pub source: Arc<dyn BoundedSource<T>>,
    /// Always set by [`split_into_bundles`]: the bundle is already as
    /// small as it will get.
    pub does_not_need_splitting: bool,
}

impl<T> std::fmt::Debug for Bundle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundle")
            .field("source", &self.source)
            .field("does_not_need_splitting", &self.does_not_need_splitting)
            .finish()
    }
}

/// Resolve the target bundle size: request, then options, then the
/// default.
pub fn desired_bundle_size(requested: Option<u64>, options: &PipelineOptions) -> u64 {
    requested
        .filter(|size| *size > 0)
        .or(options.desired_bundle_size_bytes)
        .unwrap_or(DEFAULT_DESIRED_BUNDLE_SIZE_BYTES)
}

/// Split a bounded Source into bundles of roughly
/// `desired_bundle_size_bytes`.
///
/// Every bundle must validate on its own. One that does not fails the
/// whole split; the Source implementation is broken.
pub fn split_into_bundles<T>(
    source: &dyn BoundedSource<T>,
    desired_bundle_size_bytes: u64,
    options: &PipelineOptions,
    metrics: &ReadMetrics,
) -> Result<Vec<Bundle<T>>, SourceError> {
    let sources = source.split_into_bundles(desired_bundle_size_bytes, options)?;
    tracing::debug!(
        "Split {source:?} into {} bundles of ~{desired_bundle_size_bytes} bytes",
        sources.len()
    );

    let mut bundles = Vec::with_capacity(sources.len());
    for bundle in sources {
        if let Err(err) = bundle.validate() {
            return Err(SourceError::InvalidSplit {
                original: format!("{source:?}"),
                bundle: format!("{bundle:?}"),
                reason: err.to_string(),
            });
        }
        bundles.push(Bundle {
            source: bundle,
            does_not_need_splitting: true,
        });
    }
    metrics
        .bundles_created
        .add(bundles.len() as u64, &kind_label("bounded"));
    Ok(bundles)
}

/// Fan an unbounded Source out into its initial splits.
///
/// `desired_num_splits` is a hint. At least one split must come back;
/// a Source with nothing to read can never be scheduled.
pub fn generate_initial_splits<T>(
    source: &dyn UnboundedSource<T>,
    desired_num_splits: usize,
    options: &PipelineOptions,
) -> Result<Vec<Arc<dyn UnboundedSource<T>>>, SourceError> {
    let splits = source.generate_initial_splits(desired_num_splits, options)?;
    if splits.is_empty() {
        return Err(SourceError::EmptySplit {
            source_description: format!("{source:?}"),
        });
    }
    tracing::debug!(
        "Generated {} initial splits of {source:?} (asked for {desired_num_splits})",
        splits.len()
    );
    Ok(splits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingSource, RangeSource};

    fn bounds(bundles: &[Bundle<u64>]) -> Vec<String> {
        bundles
            .iter()
            .map(|bundle| format!("{:?}", bundle.source))
            .collect()
    }

    #[test]
    fn bundles_validate_and_are_minimal() {
        let options = PipelineOptions::default();
        for _ in 0..20 {
            let len = fastrand::u64(0..500);
            let size = fastrand::u64(1..200);
            let bundles = split_into_bundles::<u64>(
                &RangeSource::new(0, len),
                size,
                &options,
                &ReadMetrics::new(),
            )
            .unwrap();
            assert!(!bundles.is_empty());
            for bundle in &bundles {
                assert!(bundle.source.validate().is_ok());
                assert!(bundle.does_not_need_splitting);
            }
        }
    }

    #[test]
    fn bundle_boundaries() {
        let bundles = split_into_bundles::<u64>(
            &RangeSource::new(0, 10),
            32,
            &PipelineOptions::default(),
            &ReadMetrics::new(),
        )
        .unwrap();
        assert_eq!(
            bounds(&bundles),
            vec![
                format!("{:?}", RangeSource::new(0, 4)),
                format!("{:?}", RangeSource::new(4, 8)),
                format!("{:?}", RangeSource::new(8, 10)),
            ]
        );
    }

    #[test]
    fn invalid_bundle_fails_split_with_both_sources() {
        let source = RangeSource {
            invalid_bundles: true,
            ..RangeSource::new(0, 10)
        };
        let err = split_into_bundles::<u64>(&source, 16, &PipelineOptions::default(), &ReadMetrics::new())
            .unwrap_err();
        match err {
            SourceError::InvalidSplit {
                original, bundle, ..
            } => {
                assert!(original.contains("end: 10"));
                assert!(bundle.contains("start: 11"));
            }
            other => panic!("expected InvalidSplit, got {other:?}"),
        }
    }

    #[test]
    fn bundle_size_resolution() {
        let mut options = PipelineOptions::default();
        assert_eq!(
            desired_bundle_size(None, &options),
            DEFAULT_DESIRED_BUNDLE_SIZE_BYTES
        );
        options.desired_bundle_size_bytes = Some(1000);
        assert_eq!(desired_bundle_size(None, &options), 1000);
        assert_eq!(desired_bundle_size(Some(10), &options), 10);
        assert_eq!(desired_bundle_size(Some(0), &options), 1000);
    }

    #[test]
    fn initial_splits_are_never_empty() {
        let options = PipelineOptions::default();
        for n in 1..6 {
            let splits =
                generate_initial_splits::<u64>(&CountingSource::new(), n, &options).unwrap();
            assert_eq!(splits.len(), n);
        }
        let empty = CountingSource {
            zero_splits: true,
            ..CountingSource::new()
        };
        assert!(matches!(
            generate_initial_splits::<u64>(&empty, 4, &options),
            Err(SourceError::EmptySplit { .. })
        ));
    }
}
