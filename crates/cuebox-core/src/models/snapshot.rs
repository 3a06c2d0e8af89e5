//! Read-only view of the scheduler, polled by display layers.

use serde::{Deserialize, Serialize};

use crate::catalog::CueId;
use crate::director::Phase;
use crate::pool::Priority;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeSummary {
    pub key: char,
    pub id: String,
    pub name: String,
}

/// One playing instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sounding {
    pub cue: CueId,
    pub label: String,
    pub priority: Priority,
    pub looped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub phase: Phase,
    pub theme: Option<ThemeSummary>,
    pub paused: bool,
    pub audio_enabled: bool,
    pub sound_enabled: bool,
    /// Set while the backend reports device failures.
    pub degraded: bool,
    /// Title of the current background track, if any.
    pub background: Option<String>,
    pub sounding: Vec<Sounding>,
    pub active_global: Option<char>,
    /// Scheduler clock in seconds. Only advances while playing.
    pub clock: f64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            theme: None,
            paused: false,
            audio_enabled: true,
            sound_enabled: true,
            degraded: false,
            background: None,
            sounding: Vec::new(),
            active_global: None,
            clock: 0.0,
        }
    }
}
