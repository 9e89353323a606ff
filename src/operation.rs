//! Source operations requested by the coordinator.
//!
//! The coordinator talks to a worker about Sources through a small
//! structured protocol: it can ask for metadata, ask for a bounded
//! Source to be cut into bundles, and (in-band with reading) ask for a
//! running reader to be split or to report progress. The types here
//! are the request and response shapes of that protocol, serialized as
//! camelCase JSON. [`SourceFormat`] answers the stateless requests.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bundles::{desired_bundle_size, generate_initial_splits, split_into_bundles};
use crate::config::PipelineOptions;
use crate::errors::{Reraise, SourceError};
use crate::metadata::{estimate, SourceMetadata};
use crate::metrics::ReadMetrics;
use crate::serde::{encode_any_source, encode_source, SourceRegistry};
use crate::source::{AnySource, BoundedSource};
use crate::split::BoundedSourceSplit;
use crate::with_timer;

/// `@type` written into every [`SourceSpec`] this crate produces.
pub const SOURCE_FORMAT_TYPE: &str = "flowsource.SourceFormat";

/// The opaque part of a [`CloudSource`]. Only this crate looks inside
/// the serialized fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    #[serde(rename = "@type")]
    pub format_type: String,
    pub serialized_source: String,
    /// One entry per initial split; unbounded Sources only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialized_source_splits: Option<Vec<String>>,
}

/// A Source as the coordinator sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudSource {
    pub spec: SourceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SourceMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub does_not_need_splitting: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DerivationMode {
    /// Schedulable with no relation to its siblings.
    #[serde(rename = "SOURCE_DERIVATION_MODE_INDEPENDENT")]
    Independent,
}

/// A Source derived from another by splitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedSource {
    pub source: CloudSource,
    pub derivation_mode: DerivationMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitOutcome {
    #[serde(rename = "SOURCE_SPLIT_OUTCOME_SPLITTING_HAPPENED")]
    SplittingHappened,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceGetMetadataRequest {
    pub source: CloudSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSplitOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_bundle_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSplitRequest {
    pub source: CloudSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<SourceSplitOptions>,
}

/// Exactly one field is expected to be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceOperationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_metadata: Option<SourceGetMetadataRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<SourceSplitRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceGetMetadataResponse {
    pub metadata: SourceMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSplitResponse {
    pub outcome: SplitOutcome,
    pub bundles: Vec<DerivedSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceOperationResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_metadata: Option<SourceGetMetadataResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<SourceSplitResponse>,
}

/// Estimated completion of a running reader. The value is a fraction
/// in `[0, 1]` despite the name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproximateProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_complete: Option<f64>,
}

/// Where a dynamic split should happen. Only `fraction` is acted on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPosition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_offset: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSplitRequest {
    pub stop_position: StopPosition,
}

impl DynamicSplitRequest {
    pub fn at_fraction(fraction: f64) -> Self {
        Self {
            stop_position: StopPosition {
                fraction: Some(fraction),
                ..Default::default()
            },
        }
    }
}

/// A granted dynamic split, ready to send back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSourceSplit {
    pub primary_source: DerivedSource,
    pub residual_source: DerivedSource,
}

/// Answers source operation requests for Sources producing `T`.
///
/// Holds no per-request state; one instance can serve any number of
/// requests concurrently.
pub struct SourceFormat<T> {
    registry: Arc<SourceRegistry<T>>,
    options: PipelineOptions,
    metrics: ReadMetrics,
}

impl<T: 'static> SourceFormat<T> {
    pub fn new(registry: Arc<SourceRegistry<T>>, options: PipelineOptions) -> Self {
        Self {
            registry,
            options,
            metrics: ReadMetrics::new(),
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn registry(&self) -> &SourceRegistry<T> {
        &self.registry
    }

    pub fn perform_source_operation(
        &self,
        request: &SourceOperationRequest,
    ) -> Result<SourceOperationResponse, SourceError> {
        if let Some(request) = &request.get_metadata {
            let labels = [opentelemetry::KeyValue::new("operation", "get_metadata")];
            let response = with_timer!(
                self.metrics.operation_duration,
                labels,
                self.perform_get_metadata(request)
            )?;
            Ok(SourceOperationResponse {
                get_metadata: Some(response),
                ..Default::default()
            })
        } else if let Some(request) = &request.split {
            let labels = [opentelemetry::KeyValue::new("operation", "split")];
            let response = with_timer!(
                self.metrics.operation_duration,
                labels,
                self.perform_split(request)
            )?;
            Ok(SourceOperationResponse {
                split: Some(response),
                ..Default::default()
            })
        } else {
            Err(SourceError::UnsupportedOperation(format!(
                "unknown source operation request {request:?}"
            )))
        }
    }

    /// Run a request arriving as JSON and answer in JSON.
    pub fn handle_json_request(&self, body: &str) -> Result<String, SourceError> {
        let request: SourceOperationRequest = serde_json::from_str(body)
            .map_err(|err| SourceError::deserialization("source operation request", err))?;
        let response = self.perform_source_operation(&request)?;
        Ok(serde_json::to_string(&response)?)
    }

    pub fn perform_get_metadata(
        &self,
        request: &SourceGetMetadataRequest,
    ) -> Result<SourceGetMetadataResponse, SourceError> {
        let source = self.deserialize_from_cloud_source(&request.source.spec)?;
        Ok(SourceGetMetadataResponse {
            metadata: estimate(&source, &self.options),
        })
    }

    pub fn perform_split(
        &self,
        request: &SourceSplitRequest,
    ) -> Result<SourceSplitResponse, SourceError> {
        let source = match self.deserialize_from_cloud_source(&request.source.spec)? {
            AnySource::Bounded(source) => source,
            AnySource::Unbounded(source) => {
                return Err(SourceError::UnsupportedOperation(format!(
                    "cannot split a non-bounded source: {source:?}"
                )))
            }
        };
        tracing::debug!("Splitting source: {source:?}");

        let requested = request
            .options
            .as_ref()
            .and_then(|options| options.desired_bundle_size_bytes);
        let desired = desired_bundle_size(requested, &self.options);
        let bundles = split_into_bundles(&*source, desired, &self.options, &self.metrics)?;

        let bundles = bundles
            .into_iter()
            .map(|bundle| {
                let mut cloud_source =
                    self.serialize_to_cloud_source(&AnySource::Bounded(bundle.source))?;
                cloud_source.does_not_need_splitting = Some(bundle.does_not_need_splitting);
                Ok(DerivedSource {
                    source: cloud_source,
                    derivation_mode: DerivationMode::Independent,
                })
            })
            .collect::<Result<Vec<_>, SourceError>>()?;
        Ok(SourceSplitResponse {
            outcome: SplitOutcome::SplittingHappened,
            bundles,
        })
    }

    /// Decode and validate the Source in a spec.
    pub fn deserialize_from_cloud_source(&self, spec: &SourceSpec) -> Result<AnySource<T>, SourceError> {
        self.registry.decode(&spec.serialized_source)
    }

    /// Build what the coordinator needs to know about `source`.
    ///
    /// Unbounded Sources are fanned out here, once; their splits ride
    /// along in the spec for the streaming workers.
    pub fn serialize_to_cloud_source(&self, source: &AnySource<T>) -> Result<CloudSource, SourceError> {
        let serialized_source = encode_any_source(source)
            .reraise_with(|| format!("error encoding source {source:?}"))?;

        let serialized_source_splits = match source {
            AnySource::Bounded(_) => None,
            AnySource::Unbounded(source) => {
                let splits = generate_initial_splits(
                    &**source,
                    self.options.desired_num_splits(),
                    &self.options,
                )?;
                let encoded = splits
                    .iter()
                    .map(|split| encode_source(&**split))
                    .collect::<Result<Vec<_>, _>>()?;
                Some(encoded)
            }
        };

        Ok(CloudSource {
            spec: SourceSpec {
                format_type: SOURCE_FORMAT_TYPE.to_string(),
                serialized_source,
                serialized_source_splits,
            },
            metadata: Some(estimate(source, &self.options)),
            does_not_need_splitting: None,
        })
    }

    /// Package a granted dynamic split for the coordinator.
    pub fn to_source_split(&self, split: &BoundedSourceSplit<T>) -> Result<DynamicSourceSplit, SourceError> {
        let derive = |source: &Arc<dyn BoundedSource<T>>| -> Result<DerivedSource, SourceError> {
            Ok(DerivedSource {
                source: self.serialize_to_cloud_source(&AnySource::Bounded(source.clone()))?,
                derivation_mode: DerivationMode::Independent,
            })
        };
        Ok(DynamicSourceSplit {
            primary_source: derive(&split.primary)?,
            residual_source: derive(&split.residual)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_test::{assert_tokens, Token};

    use super::*;
    use crate::read::evaluate_bounded;
    use crate::testing::{registry, CountingSource, RangeSource};

    fn format() -> SourceFormat<u64> {
        SourceFormat::new(Arc::new(registry()), PipelineOptions::default())
    }

    fn cloud(format: &SourceFormat<u64>, source: AnySource<u64>) -> CloudSource {
        format.serialize_to_cloud_source(&source).unwrap()
    }

    fn bounded(source: RangeSource) -> AnySource<u64> {
        AnySource::Bounded(Arc::new(source))
    }

    #[test]
    fn derivation_mode_and_outcome_wire_names() {
        assert_tokens(
            &DerivationMode::Independent,
            &[Token::UnitVariant {
                name: "DerivationMode",
                variant: "SOURCE_DERIVATION_MODE_INDEPENDENT",
            }],
        );
        assert_tokens(
            &SplitOutcome::SplittingHappened,
            &[Token::UnitVariant {
                name: "SplitOutcome",
                variant: "SOURCE_SPLIT_OUTCOME_SPLITTING_HAPPENED",
            }],
        );
    }

    #[test]
    fn stop_position_wire_form() {
        assert_tokens(
            &DynamicSplitRequest::at_fraction(0.25),
            &[
                Token::Struct {
                    name: "DynamicSplitRequest",
                    len: 1,
                },
                Token::Str("stopPosition"),
                Token::Struct {
                    name: "StopPosition",
                    len: 1,
                },
                Token::Str("fraction"),
                Token::Some,
                Token::F64(0.25),
                Token::StructEnd,
                Token::StructEnd,
            ],
        );
    }

    #[test]
    fn cloud_source_spec_json() {
        let format = format();
        let source = cloud(&format, bounded(RangeSource::new(0, 2)));
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["spec"]["@type"], SOURCE_FORMAT_TYPE);
        assert!(json["spec"]["serialized_source"].is_string());
        assert!(json["spec"].get("serialized_source_splits").is_none());
        assert_eq!(json["metadata"]["estimatedSizeBytes"], 16);
    }

    #[test]
    fn unbounded_cloud_source_carries_splits() {
        let options = PipelineOptions {
            num_workers: 3,
            ..Default::default()
        };
        let format = SourceFormat::new(Arc::new(registry()), options);
        let source = cloud(&format, AnySource::Unbounded(Arc::new(CountingSource::new())));
        let splits = source.spec.serialized_source_splits.unwrap();
        assert_eq!(splits.len(), 6);
        for split in &splits {
            assert!(format.registry().decode_unbounded(split).is_ok());
        }
        assert_eq!(source.metadata.map(|m| m.infinite), Some(true));
    }

    #[test]
    fn unbounded_source_without_splits_fails_serialization() {
        let format = format();
        let source = AnySource::Unbounded(Arc::new(CountingSource {
            zero_splits: true,
            ..CountingSource::new()
        }));
        assert!(matches!(
            format.serialize_to_cloud_source(&source),
            Err(SourceError::EmptySplit { .. })
        ));
    }

    #[test]
    fn get_metadata_survives_size_failure() {
        let format = format();
        let source = cloud(
            &format,
            bounded(RangeSource {
                fail_size_estimate: true,
                ..RangeSource::new(0, 4)
            }),
        );
        let request = SourceOperationRequest {
            get_metadata: Some(SourceGetMetadataRequest { source }),
            ..Default::default()
        };
        let response = format.perform_source_operation(&request).unwrap();
        let metadata = response.get_metadata.unwrap().metadata;
        assert_eq!(metadata.estimated_size_bytes, None);
        assert_eq!(metadata.produces_sorted_keys, Some(true));
    }

    #[test]
    fn split_request_produces_independent_minimal_bundles() {
        let format = format();
        let source = cloud(&format, bounded(RangeSource::new(0, 10)));
        let request = SourceOperationRequest {
            split: Some(SourceSplitRequest {
                source,
                options: Some(SourceSplitOptions {
                    desired_bundle_size_bytes: Some(24),
                }),
            }),
            ..Default::default()
        };
        let response = format.perform_source_operation(&request).unwrap();
        let split = response.split.unwrap();
        assert_eq!(split.outcome, SplitOutcome::SplittingHappened);
        assert_eq!(split.bundles.len(), 4);

        let mut values = Vec::new();
        for bundle in split.bundles {
            assert_eq!(bundle.derivation_mode, DerivationMode::Independent);
            assert_eq!(bundle.source.does_not_need_splitting, Some(true));
            let decoded = format
                .registry()
                .decode_bounded(&bundle.source.spec.serialized_source)
                .unwrap();
            values.extend(
                evaluate_bounded(decoded, format.options())
                    .unwrap()
                    .into_iter()
                    .map(|item| item.value),
            );
        }
        assert_eq!(values, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn split_of_unbounded_is_unsupported() {
        let format = format();
        let source = cloud(&format, AnySource::Unbounded(Arc::new(CountingSource::new())));
        let request = SourceOperationRequest {
            split: Some(SourceSplitRequest {
                source,
                options: None,
            }),
            ..Default::default()
        };
        assert!(matches!(
            format.perform_source_operation(&request),
            Err(SourceError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn empty_request_is_unsupported() {
        assert!(matches!(
            format().perform_source_operation(&SourceOperationRequest::default()),
            Err(SourceError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn json_channel_round_trip() {
        let format = format();
        let source = cloud(&format, bounded(RangeSource::new(0, 3)));
        let body = serde_json::to_string(&SourceOperationRequest {
            get_metadata: Some(SourceGetMetadataRequest { source }),
            ..Default::default()
        })
        .unwrap();
        let response: SourceOperationResponse =
            serde_json::from_str(&format.handle_json_request(&body).unwrap()).unwrap();
        assert_eq!(
            response.get_metadata.unwrap().metadata.estimated_size_bytes,
            Some(24)
        );
        assert!(matches!(
            format.handle_json_request("not json"),
            Err(SourceError::Deserialization { .. })
        ));
    }

    #[test]
    fn dynamic_split_is_packaged_as_two_independent_sources() {
        let format = format();
        let split = BoundedSourceSplit::<u64> {
            primary: Arc::new(RangeSource::new(0, 5)),
            residual: Arc::new(RangeSource::new(5, 10)),
        };
        let packaged = format.to_source_split(&split).unwrap();
        assert_eq!(
            packaged.primary_source.derivation_mode,
            DerivationMode::Independent
        );
        let residual = format
            .registry()
            .decode_bounded(&packaged.residual_source.source.spec.serialized_source)
            .unwrap();
        let values: Vec<u64> = evaluate_bounded(residual, format.options())
            .unwrap()
            .into_iter()
            .map(|item| item.value)
            .collect();
        assert_eq!(values, vec![5, 6, 7, 8, 9]);
    }
}
