//! Error taxonomy for the source layer.
//!
//! Validation and invariant failures mean a Source implementation is
//! broken; they are never retried here and always carry the debug
//! form of every Source involved. Cursor failures are wrapped with
//! the offending Source and passed up so the caller can decide on a
//! retry policy.

use std::panic::Location;

/// Every error this crate returns.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// A payload could not be decoded, or decoded into a Source that
    /// does not validate.
    #[error("error deserializing {what}: {reason}{}", described(.source_description))]
    Deserialization {
        what: String,
        reason: String,
        /// Debug form of the decoded Source, if decoding got that far.
        source_description: Option<String>,
    },

    /// Static splitting produced a bundle that does not validate.
    #[error(
        "splitting a valid source produced an invalid bundle: {reason}\n\
         Original source: {original}\nInvalid bundle: {bundle}"
    )]
    InvalidSplit {
        original: String,
        bundle: String,
        reason: String,
    },

    /// An unbounded Source generated no initial splits.
    #[error("unbounded sources must have at least one split: {source_description}")]
    EmptySplit { source_description: String },

    /// A granted dynamic split broke the immutability or validity
    /// contract.
    #[error(
        "{reason}\nOriginal: {original}\nPrimary: {primary}\nResidual: {residual}"
    )]
    SplitInvariantViolation {
        reason: String,
        original: String,
        primary: String,
        residual: String,
    },

    /// The underlying cursor failed in `start`.
    #[error("failed to start reading from source: {source_description}")]
    ReadStart {
        source_description: String,
        #[source]
        cause: Box<SourceError>,
    },

    /// The underlying cursor failed in `advance`.
    #[error("failed to advance reading from source: {source_description}")]
    ReadAdvance {
        source_description: String,
        #[source]
        cause: Box<SourceError>,
    },

    /// `next` was called with no record available.
    #[error("no such element")]
    NoSuchElement,

    /// The request kind or shape is not handled by this layer.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A Source's own `validate` rejected it.
    #[error("invalid source: {0}")]
    Invalid(String),

    /// Encoding a Source or checkpoint mark failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A slot key could not be resolved to a split index.
    #[error("invalid slot key {key:?}: {reason}")]
    InvalidSlotKey { key: String, reason: String },

    /// The checkpoint store failed.
    #[error("checkpoint store error: {0}")]
    Store(String),

    /// Bad configuration values.
    #[error("configuration error: {0}")]
    Config(String),

    /// Logging or metrics could not be installed.
    #[error("setup error: {0}")]
    Setup(String),

    /// Cursor I/O failure raised by a reader.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Another error with a message and caller location attached.
    #[error("({location}) {msg}\nCaused by => {cause}")]
    Context {
        location: String,
        msg: String,
        #[source]
        cause: Box<SourceError>,
    },
}

impl SourceError {
    /// Strip any [`SourceError::Context`] layers.
    pub fn root(&self) -> &SourceError {
        match self {
            SourceError::Context { cause, .. } => cause.root(),
            other => other,
        }
    }

    pub(crate) fn deserialization(what: &str, reason: impl ToString) -> Self {
        SourceError::Deserialization {
            what: what.to_string(),
            reason: reason.to_string(),
            source_description: None,
        }
    }
}

fn described(source_description: &Option<String>) -> String {
    match source_description {
        Some(desc) => format!("\nSource: {desc}"),
        None => String::new(),
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Codec(err.to_string())
    }
}

impl From<rusqlite::Error> for SourceError {
    fn from(err: rusqlite::Error) -> Self {
        SourceError::Store(err.to_string())
    }
}

impl From<rusqlite_migration::Error> for SourceError {
    fn from(err: rusqlite_migration::Error) -> Self {
        SourceError::Store(err.to_string())
    }
}

/// Attach a message and the caller's location to any error that can
/// become a [`SourceError`].
///
/// Example:
///     reader.start().reraise("error starting split reader")?;
pub trait Reraise<T> {
    #[track_caller]
    fn reraise(self, msg: &str) -> Result<T, SourceError>;

    /// Like [`Reraise::reraise`] but only builds the message on
    /// error.
    #[track_caller]
    fn reraise_with<F>(self, msg: F) -> Result<T, SourceError>
    where
        F: FnOnce() -> String;
}

impl<T, E> Reraise<T> for Result<T, E>
where
    E: Into<SourceError>,
{
    #[track_caller]
    fn reraise(self, msg: &str) -> Result<T, SourceError> {
        let caller = Location::caller();
        self.map_err(|err| wrap(caller, msg.to_string(), err.into()))
    }

    #[track_caller]
    fn reraise_with<F>(self, msg: F) -> Result<T, SourceError>
    where
        F: FnOnce() -> String,
    {
        let caller = Location::caller();
        self.map_err(|err| wrap(caller, msg(), err.into()))
    }
}

fn wrap(caller: &Location, msg: String, cause: SourceError) -> SourceError {
    SourceError::Context {
        location: caller.to_string(),
        msg,
        cause: Box::new(cause),
    }
}

/// Build an [`SourceError::Invalid`] tagged with the caller location.
#[cfg(any(test, feature = "testing"))]
#[track_caller]
pub(crate) fn tracked_err(msg: &str) -> SourceError {
    let caller = Location::caller();
    SourceError::Invalid(format!("({caller}) {msg}"))
}

#[test]
fn reraise_keeps_root_and_location() {
    let res: Result<(), SourceError> = Err(SourceError::NoSuchElement);
    let err = res.reraise("reading test cursor").unwrap_err();
    assert!(matches!(err.root(), SourceError::NoSuchElement));
    let msg = err.to_string();
    assert!(msg.contains("reading test cursor"));
    assert!(msg.contains("errors.rs"));
}

#[test]
fn reraise_with_is_lazy_on_success() {
    let res: Result<u8, SourceError> = Ok(3);
    let found = res.reraise_with(|| panic!("message built on success"));
    assert_eq!(found.unwrap(), 3);
}

#[test]
fn tracked_err_mentions_caller() {
    let err = tracked_err("bad range");
    assert!(err.to_string().contains("errors.rs"));
    assert!(err.to_string().contains("bad range"));
}

#[test]
fn deserialization_error_shows_source() {
    let err = SourceError::Deserialization {
        what: "source".to_string(),
        reason: "invalid source: range start 9 is after end 1".to_string(),
        source_description: Some("RangeSource { start: 9, end: 1 }".to_string()),
    };
    assert!(err
        .to_string()
        .ends_with("\nSource: RangeSource { start: 9, end: 1 }"));
    assert_eq!(
        SourceError::deserialization("source", "bad base64").to_string(),
        "error deserializing source: bad base64"
    );
}
