//! In-memory backend that records every call.
//!
//! Used by the test suite and by `cuebox simulate`. Channels stay live until
//! `finish` (or `finish_all`) is called, which makes them show up in the
//! next `take_idle`.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{AudioBackend, ChannelId};
use crate::error::BackendError;
use crate::pool::Priority;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Play {
        channel: ChannelId,
        file: PathBuf,
        priority: Priority,
        volume: f32,
    },
    Stop(ChannelId),
    SetVolume(ChannelId, f32),
}

#[derive(Debug, Default)]
struct Recorder {
    next: u64,
    calls: Vec<BackendCall>,
    live: BTreeSet<ChannelId>,
    idle: Vec<ChannelId>,
    unreadable: HashSet<PathBuf>,
    device_down: bool,
}

#[derive(Debug, Default)]
pub struct RecordingBackend {
    inner: Mutex<Recorder>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call so far, oldest first.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.inner.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    /// Files passed to successful `play` calls, in order.
    pub fn plays(&self) -> Vec<PathBuf> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::Play { file, .. } => Some(file.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn live(&self) -> Vec<ChannelId> {
        self.inner.lock().live.iter().copied().collect()
    }

    pub fn is_live(&self, channel: ChannelId) -> bool {
        self.inner.lock().live.contains(&channel)
    }

    /// End a live channel as if its file ran out.
    pub fn finish(&self, channel: ChannelId) {
        let mut rec = self.inner.lock();
        if rec.live.remove(&channel) {
            rec.idle.push(channel);
        }
    }

    pub fn finish_all(&self) {
        let mut rec = self.inner.lock();
        let live = std::mem::take(&mut rec.live);
        rec.idle.extend(live);
    }

    /// End every live channel whose file matches `file`.
    pub fn finish_file(&self, file: &Path) {
        let mut rec = self.inner.lock();
        let matching: Vec<ChannelId> = rec
            .calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::Play { channel, file: f, .. } if f == file => Some(*channel),
                _ => None,
            })
            .filter(|ch| rec.live.contains(ch))
            .collect();
        for ch in matching {
            rec.live.remove(&ch);
            rec.idle.push(ch);
        }
    }

    /// Make future plays of `file` fail with `FileUnreadable`.
    pub fn mark_unreadable(&self, file: impl Into<PathBuf>) {
        self.inner.lock().unreadable.insert(file.into());
    }

    /// While down, every play fails with `Device`.
    pub fn set_device_down(&self, down: bool) {
        self.inner.lock().device_down = down;
    }
}

impl AudioBackend for RecordingBackend {
    fn play(&self, file: &Path, priority: Priority, volume: f32) -> Result<ChannelId, BackendError> {
        let mut rec = self.inner.lock();
        if rec.device_down {
            return Err(BackendError::Device("device unplugged".into()));
        }
        if rec.unreadable.contains(file) {
            return Err(BackendError::FileUnreadable {
                path: file.to_path_buf(),
                reason: "unsupported format".into(),
            });
        }
        let channel = ChannelId(rec.next);
        rec.next += 1;
        rec.live.insert(channel);
        rec.calls.push(BackendCall::Play {
            channel,
            file: file.to_path_buf(),
            priority,
            volume,
        });
        Ok(channel)
    }

    fn stop(&self, channel: ChannelId) {
        let mut rec = self.inner.lock();
        rec.live.remove(&channel);
        rec.calls.push(BackendCall::Stop(channel));
    }

    fn set_volume(&self, channel: ChannelId, volume: f32) {
        self.inner.lock().calls.push(BackendCall::SetVolume(channel, volume));
    }

    fn take_idle(&self) -> Vec<ChannelId> {
        std::mem::take(&mut self.inner.lock().idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_moves_channel_to_idle_once() {
        let backend = RecordingBackend::new();
        let ch = backend.play(Path::new("a.wav"), Priority::Effect, 0.5).unwrap();
        assert!(backend.is_live(ch));

        backend.finish(ch);
        backend.finish(ch);
        assert_eq!(backend.take_idle(), vec![ch]);
        assert!(backend.take_idle().is_empty());
        assert!(!backend.is_live(ch));
    }

    #[test]
    fn stopped_channels_never_go_idle() {
        let backend = RecordingBackend::new();
        let ch = backend.play(Path::new("a.wav"), Priority::Background, 1.0).unwrap();
        backend.stop(ch);
        backend.finish_all();
        assert!(backend.take_idle().is_empty());
        assert_eq!(backend.calls().last(), Some(&BackendCall::Stop(ch)));
    }

    #[test]
    fn failures_are_injected() {
        let backend = RecordingBackend::new();
        backend.mark_unreadable("bad.ogg");
        let err = backend.play(Path::new("bad.ogg"), Priority::Effect, 1.0).unwrap_err();
        assert!(matches!(err, BackendError::FileUnreadable { .. }));

        backend.set_device_down(true);
        let err = backend.play(Path::new("good.ogg"), Priority::Effect, 1.0).unwrap_err();
        assert!(matches!(err, BackendError::Device(_)));
        assert!(backend.plays().is_empty());

        backend.set_device_down(false);
        assert!(backend.play(Path::new("good.ogg"), Priority::Effect, 1.0).is_ok());
        assert_eq!(backend.plays(), vec![PathBuf::from("good.ogg")]);
    }

    #[test]
    fn finish_file_targets_matching_channels() {
        let backend = RecordingBackend::new();
        let a = backend.play(Path::new("a.wav"), Priority::Effect, 1.0).unwrap();
        let b = backend.play(Path::new("b.wav"), Priority::Effect, 1.0).unwrap();
        backend.finish_file(Path::new("b.wav"));
        assert_eq!(backend.take_idle(), vec![b]);
        assert!(backend.is_live(a));
    }
}
