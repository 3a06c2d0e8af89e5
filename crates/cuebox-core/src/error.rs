//! Error types, one enum per concern.
//!
//! Configuration problems (`CatalogError`, `LoadError`, `SchedulerError`) are
//! fatal before the scheduler starts. `BackendError` is recoverable: the
//! director logs it and keeps scheduling.

use std::path::PathBuf;

use thiserror::Error;

/// A structural violation found while validating a catalog.
#[derive(Debug, Error, PartialEq)]
pub enum CatalogError {
    #[error("catalog has no themes; at least one theme is required")]
    NoThemes,

    #[error("{owner}: key {key:?} is not allowed (a-z lowercase and 0-9 only)")]
    InvalidKey { owner: String, key: char },

    #[error("key {key:?} is used by both {first} and {second}")]
    DuplicateKey {
        key: char,
        first: String,
        second: String,
    },

    #[error("{owner}: {attribute} = {value} is outside {min}..={max}")]
    OutOfRange {
        owner: String,
        attribute: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{owner}: file pool is empty")]
    EmptyPool { owner: String },

    #[error("both {first} and {second} are marked as default theme")]
    MultipleDefaults { first: String, second: String },
}

/// Failure to turn a catalog document into a validated [`crate::Catalog`].
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid catalog document {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{owner}: {message}")]
    Invalid { owner: String, message: String },

    #[error("{owner}: pattern {pattern} matches no audio files")]
    NoMatch { owner: String, pattern: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Scheduler parameters that cannot work with the given catalog.
#[derive(Debug, Error, PartialEq)]
pub enum SchedulerError {
    #[error("tick length must be positive")]
    ZeroTick,

    #[error("at least one audio channel is required")]
    NoChannels,

    #[error(
        "theme {theme:?}, effect {effect:?}: per-tick firing probability {probability:.3} \
         exceeds {max}; shorten the tick or lower the occurrence"
    )]
    TickTooCoarse {
        theme: String,
        effect: String,
        probability: f64,
        max: f64,
    },
}

/// Errors reported by an [`crate::backend::AudioBackend`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// The file could not be opened or decoded. Only this file is affected.
    #[error("cannot play {path}: {reason}")]
    FileUnreadable { path: PathBuf, reason: String },

    /// Output device trouble. Every play fails until the device recovers.
    #[error("audio device unavailable: {0}")]
    Device(String),
}

/// Errors from the threaded [`crate::Engine`] runtime.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("scheduler loop is not running")]
    Stopped,

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}
