//! cuebox-core: ambient audio cue scheduler for tabletop sessions.
//!
//! A catalog groups sound into themes (a shuffled background playlist plus
//! randomly triggered effects) and global cues on their own keys. The
//! director runs the schedule one tick at a time against an audio backend;
//! the engine puts a director on its own thread.
//!
//! # Architecture
//!
//! ```text
//! Catalog   (themes, cues, keys; loaded from JSON or a directory tree)
//! Director  (phase machine, rotator, trigger, cooldowns, channel pool)
//! Backend   (play/stop/volume/idle; native cpal mixer or a test double)
//! Engine    (scheduler thread, command channel, published snapshot)
//! ```

pub mod backend;
pub mod catalog;
pub mod config;
pub mod cooldown;
pub mod director;
pub mod engine;
pub mod error;
pub mod models;
pub mod pool;
pub mod rotator;
pub mod trigger;

pub use backend::{AudioBackend, ChannelId, NoopBackend};
pub use catalog::loader::{load, Loaded};
pub use catalog::{BackgroundCue, Catalog, CueId, EffectCue, GlobalCue, Theme};
pub use config::{ReactivatePolicy, SchedulerConfig};
pub use director::{Director, Phase, Resume};
pub use engine::Engine;
pub use error::{BackendError, CatalogError, EngineError, LoadError, SchedulerError};
pub use models::*;
pub use pool::Priority;
