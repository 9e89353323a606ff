//! Serialization bridge between Sources and the opaque strings the
//! coordinator carries around.
//!
//! A Source is written as base64 of a JSON envelope:
//!
//! ```text
//! {"version": 1, "kind": "<registry kind>", "state": <Source fields>}
//! ```
//!
//! Nothing outside this module looks inside that string. Every decode
//! re-validates the Source before handing it out.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::SourceError;
use crate::source::*;

/// Version stamp written into every envelope.
pub const CODEC_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    kind: String,
    state: serde_json::Value,
}

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// Encode any Source into its wire string.
///
/// Deterministic for a given Source value within one version of this
/// crate.
pub fn encode_source<S>(source: &S) -> Result<String, SourceError>
where
    S: Source + ?Sized,
{
    let envelope = Envelope {
        version: CODEC_VERSION,
        kind: source.kind().to_string(),
        state: source.encode_state()?,
    };
    let json = serde_json::to_vec(&envelope)?;
    Ok(b64().encode(json))
}

/// Encode either kind of Source.
pub fn encode_any_source<T>(source: &AnySource<T>) -> Result<String, SourceError> {
    match source {
        AnySource::Bounded(source) => encode_source(&**source),
        AnySource::Unbounded(source) => encode_source(&**source),
    }
}

/// Encode a checkpoint mark with the coder its Source declared.
pub fn encode_checkpoint(
    coder: &dyn CheckpointCoder,
    mark: &dyn CheckpointMark,
) -> Result<Vec<u8>, SourceError> {
    coder.encode(mark)
}

/// Decode a checkpoint mark with the coder its Source declared.
pub fn decode_checkpoint(
    coder: &dyn CheckpointCoder,
    bytes: &[u8],
) -> Result<Box<dyn CheckpointMark>, SourceError> {
    coder.decode(bytes).map_err(|err| match err {
        err @ SourceError::Deserialization { .. } => err,
        err => SourceError::deserialization("checkpoint mark", err),
    })
}

type Decoder<T> = Box<dyn Fn(serde_json::Value) -> Result<AnySource<T>, SourceError> + Send + Sync>;

/// Maps Source kinds to the functions that rebuild them.
///
/// Every Source type a worker may receive has to be registered here
/// under the same kind its [`Source::kind`] reports.
pub struct SourceRegistry<T> {
    decoders: HashMap<String, Decoder<T>>,
}

impl<T: 'static> SourceRegistry<T> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    pub fn register_bounded<S>(&mut self, kind: &str) -> &mut Self
    where
        S: BoundedSource<T> + DeserializeOwned + 'static,
    {
        self.decoders.insert(
            kind.to_string(),
            Box::new(|state: serde_json::Value| -> Result<AnySource<T>, SourceError> {
                let source: S = serde_json::from_value(state)
                    .map_err(|err| SourceError::deserialization("bounded source", err))?;
                Ok(AnySource::Bounded(Arc::new(source)))
            }),
        );
        self
    }

    pub fn register_unbounded<S>(&mut self, kind: &str) -> &mut Self
    where
        S: UnboundedSource<T> + DeserializeOwned + 'static,
    {
        self.decoders.insert(
            kind.to_string(),
            Box::new(|state: serde_json::Value| -> Result<AnySource<T>, SourceError> {
                let source: S = serde_json::from_value(state)
                    .map_err(|err| SourceError::deserialization("unbounded source", err))?;
                Ok(AnySource::Unbounded(Arc::new(source)))
            }),
        );
        self
    }

    /// Decode and validate one Source.
    pub fn decode(&self, encoded: &str) -> Result<AnySource<T>, SourceError> {
        let json = b64()
            .decode(encoded)
            .map_err(|err| SourceError::deserialization("source", err))?;
        let envelope: Envelope = serde_json::from_slice(&json)
            .map_err(|err| SourceError::deserialization("source envelope", err))?;
        if envelope.version != CODEC_VERSION {
            return Err(SourceError::deserialization(
                "source envelope",
                format!(
                    "unsupported codec version {} (expected {CODEC_VERSION})",
                    envelope.version
                ),
            ));
        }
        let decoder = self.decoders.get(&envelope.kind).ok_or_else(|| {
            SourceError::deserialization(
                "source",
                format!("unknown source kind {:?}", envelope.kind),
            )
        })?;
        let source = decoder(envelope.state)?;

        if let Err(err) = source.validate() {
            tracing::error!("Invalid source: {source:?}: {err}");
            return Err(SourceError::Deserialization {
                what: "source".to_string(),
                reason: err.to_string(),
                source_description: Some(format!("{source:?}")),
            });
        }
        Ok(source)
    }

    pub fn decode_bounded(&self, encoded: &str) -> Result<Arc<dyn BoundedSource<T>>, SourceError> {
        match self.decode(encoded)? {
            AnySource::Bounded(source) => Ok(source),
            AnySource::Unbounded(source) => Err(SourceError::deserialization(
                "bounded source",
                format!("expected a bounded source, got {source:?}"),
            )),
        }
    }

    pub fn decode_unbounded(
        &self,
        encoded: &str,
    ) -> Result<Arc<dyn UnboundedSource<T>>, SourceError> {
        match self.decode(encoded)? {
            AnySource::Unbounded(source) => Ok(source),
            AnySource::Bounded(source) => Err(SourceError::deserialization(
                "unbounded source",
                format!("expected an unbounded source, got {source:?}"),
            )),
        }
    }
}

impl<T: 'static> Default for SourceRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SourceRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.decoders.keys().collect();
        kinds.sort();
        f.debug_struct("SourceRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}
