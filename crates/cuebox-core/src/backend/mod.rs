//! Audio backends.
//!
//! The director talks to audio output only through [`AudioBackend`]. A
//! backend owns its channels: `play` hands back a fresh [`ChannelId`], and
//! channels that finish on their own are reported through `take_idle`.
//!
//! - [`NoopBackend`] accepts everything and never finishes (headless use).
//! - [`RecordingBackend`] logs every call and lets tests finish channels.
//! - `NativeBackend` mixes decoded files to the default output device
//!   (feature `native`).

#[cfg(feature = "native")]
mod native;
mod recording;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::pool::Priority;

#[cfg(feature = "native")]
pub use native::NativeBackend;
pub use recording::{BackendCall, RecordingBackend};

/// Handle of one playing instance inside a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Output capability used by the director.
///
/// Methods take `&self` so a backend can be shared between the scheduler
/// thread and whoever inspects it. Stopping or re-volumeing a channel that
/// already finished is a no-op.
pub trait AudioBackend: Send + Sync {
    /// Start `file` at linear `volume` (0.0–1.0). The priority is a hint
    /// only; the director does all channel accounting itself.
    fn play(&self, file: &Path, priority: Priority, volume: f32) -> Result<ChannelId, BackendError>;

    fn stop(&self, channel: ChannelId);

    fn set_volume(&self, channel: ChannelId, volume: f32);

    /// Channels that reached end of stream since the last call.
    fn take_idle(&self) -> Vec<ChannelId>;

    /// Simultaneous channels the output can mix, if it has a limit.
    fn channel_count(&self) -> Option<usize> {
        None
    }
}

/// Backend that plays nothing. Channels never finish.
#[derive(Debug, Default)]
pub struct NoopBackend {
    next: AtomicU64,
}

impl NoopBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioBackend for NoopBackend {
    fn play(&self, file: &Path, _priority: Priority, _volume: f32) -> Result<ChannelId, BackendError> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        log::debug!("cuebox: noop play {} -> ch{}", file.display(), id);
        Ok(ChannelId(id))
    }

    fn stop(&self, _channel: ChannelId) {}

    fn set_volume(&self, _channel: ChannelId, _volume: f32) {}

    fn take_idle(&self) -> Vec<ChannelId> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_hands_out_distinct_channels() {
        let backend = NoopBackend::new();
        let a = backend.play(Path::new("a.wav"), Priority::Effect, 1.0).unwrap();
        let b = backend.play(Path::new("b.wav"), Priority::Effect, 1.0).unwrap();
        assert_ne!(a, b);
        assert!(backend.take_idle().is_empty());
        assert_eq!(backend.channel_count(), None);
    }

    #[test]
    fn channel_id_display() {
        assert_eq!(ChannelId(7).to_string(), "ch7");
    }
}
