//! Best-effort metadata for a Source.

use serde::{Deserialize, Serialize};

use crate::config::PipelineOptions;
use crate::source::{AnySource, BoundedSource};

/// What the coordinator learns about a Source before scheduling it.
///
/// An absent field means it could not be determined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces_sorted_keys: Option<bool>,
    #[serde(default)]
    pub infinite: bool,
}

/// Estimate metadata. Never fails.
pub fn estimate<T>(source: &AnySource<T>, options: &PipelineOptions) -> SourceMetadata {
    match source {
        AnySource::Bounded(source) => estimate_bounded(&**source, options),
        AnySource::Unbounded(_) => SourceMetadata {
            infinite: true,
            ..Default::default()
        },
    }
}

/// Estimate metadata of a bounded Source. Each field is computed
/// independently; a failure only drops that field.
pub fn estimate_bounded<T>(
    source: &dyn BoundedSource<T>,
    options: &PipelineOptions,
) -> SourceMetadata {
    let estimated_size_bytes = match source.estimated_size_bytes(options) {
        Ok(size) => Some(size),
        Err(err) => {
            tracing::warn!("Failed to estimate size of source {source:?}: {err}");
            None
        }
    };
    let produces_sorted_keys = match source.produces_sorted_keys(options) {
        Ok(sorted) => Some(sorted),
        Err(err) => {
            tracing::warn!("Failed to check whether source {source:?} produces sorted keys: {err}");
            None
        }
    };
    SourceMetadata {
        estimated_size_bytes,
        produces_sorted_keys,
        infinite: false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{CountingSource, RangeSource};

    #[test]
    fn bounded_metadata_has_both_fields() {
        let source: AnySource<u64> = AnySource::Bounded(Arc::new(RangeSource::new(0, 4)));
        assert_eq!(
            estimate(&source, &PipelineOptions::default()),
            SourceMetadata {
                estimated_size_bytes: Some(32),
                produces_sorted_keys: Some(true),
                infinite: false,
            }
        );
    }

    #[test]
    fn size_failure_drops_only_size() {
        let source = RangeSource {
            fail_size_estimate: true,
            ..RangeSource::new(0, 4)
        };
        let metadata = estimate_bounded::<u64>(&source, &PipelineOptions::default());
        assert_eq!(metadata.estimated_size_bytes, None);
        assert_eq!(metadata.produces_sorted_keys, Some(true));
        assert!(!metadata.infinite);
    }

    #[test]
    fn sortedness_failure_drops_only_sortedness() {
        let source = RangeSource {
            fail_sorted_keys: true,
            ..RangeSource::new(0, 4)
        };
        let metadata = estimate_bounded::<u64>(&source, &PipelineOptions::default());
        assert_eq!(metadata.estimated_size_bytes, Some(32));
        assert_eq!(metadata.produces_sorted_keys, None);
    }

    #[test]
    fn unbounded_is_infinite_with_nothing_else() {
        let source: AnySource<u64> = AnySource::Unbounded(Arc::new(CountingSource::new()));
        assert_eq!(
            estimate(&source, &PipelineOptions::default()),
            SourceMetadata {
                infinite: true,
                ..Default::default()
            }
        );
    }
}
