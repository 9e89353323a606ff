//! Internal code for logging.
//!
//! Logging to stdout is always enabled, at least at the "ERROR"
//! level, for events from this crate. The level can be raised with
//! [`PipelineOptions::log_level`], or overridden entirely with the
//! `FLOWSOURCE_LOG` env var using `EnvFilter` directives, e.g.:
//!
//! ```text
//! $ FLOWSOURCE_LOG="flowsource=debug,error" my-worker
//! ```
use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::config::PipelineOptions;
use crate::errors::SourceError;

/// Env var holding `EnvFilter` directives.
pub const LOG_ENV_VAR: &str = "FLOWSOURCE_LOG";

pub(crate) fn get_log_level(level: Option<&str>) -> Result<LevelFilter, SourceError> {
    if let Some(level) = level {
        match level.to_lowercase().as_str() {
            "trace" => Ok(LevelFilter::TRACE),
            "debug" => Ok(LevelFilter::DEBUG),
            "info" => Ok(LevelFilter::INFO),
            "warn" => Ok(LevelFilter::WARN),
            "error" => Ok(LevelFilter::ERROR),
            level => Err(SourceError::Config(format!("wrong log level: {level}"))),
        }
    } else {
        Ok(LevelFilter::ERROR)
    }
}

/// Install the global subscriber at the options' log level.
///
/// Calling this more than once keeps the first subscriber and logs a
/// warning.
pub fn setup(options: &PipelineOptions) -> Result<(), SourceError> {
    let log_level = get_log_level(options.log_level.as_deref())?;

    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true);

    match EnvFilter::try_from_env(LOG_ENV_VAR) {
        Ok(env_filter) => {
            set_global_subscriber(Registry::default().with(logs.with_filter(env_filter)));
        }
        Err(_) => {
            let targets = Targets::new().with_target("flowsource", log_level);
            set_global_subscriber(Registry::default().with(logs.with_filter(targets)));
        }
    }
    Ok(())
}

// Try to set a global default subscriber, logging the error without
// failing if it was already set.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if tracing was already initialized, which
    // happens in tests and when a worker embeds several pipelines.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert!(matches!(
        get_log_level(Some("loud")),
        Err(SourceError::Config(_))
    ));
}

#[test]
fn setup_twice_is_not_an_error() {
    let mut options = PipelineOptions {
        log_level: Some("info".to_string()),
        ..Default::default()
    };
    setup(&options).unwrap();
    options.log_level = Some("debug".to_string());
    setup(&options).unwrap();
}

#[test]
fn setup_rejects_unknown_level() {
    let options = PipelineOptions {
        log_level: Some("chatty".to_string()),
        ..Default::default()
    };
    assert!(matches!(setup(&options), Err(SourceError::Config(_))));
}
