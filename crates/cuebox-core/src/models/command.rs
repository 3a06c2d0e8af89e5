//! Control commands and scheduler inputs.
//!
//! `Command` is the whole control surface exposed to key bindings, the FFI
//! and anything else that drives the scheduler. It is a tagged enum so it
//! travels as JSON unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::ChannelId;

/// One operator action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    ActivateTheme { key: char },
    DeactivateTheme,
    FireGlobal { key: char },
    TogglePause,
    SkipNext,
    SkipPrevious,
    SetAudioEnabled { enabled: bool },
    SetSoundEnabled { enabled: bool },
    /// Flip music on or off, relative to the state when applied.
    ToggleAudio,
    ToggleSound,
}

impl Command {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(v: &Value) -> Option<Self> {
        serde_json::from_value(v.clone()).ok()
    }
}

/// Everything the director consumes from its inbound queue, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Command(Command),
    ChannelIdle(ChannelId),
}

impl From<Command> for Input {
    fn from(cmd: Command) -> Self {
        Input::Command(cmd)
    }
}
