//! Playback director: the top-level state machine.
//!
//! The director owns all scheduling state (active theme, pause state, the
//! channel pool, cooldowns, rotator and trigger) and is the only thing that
//! talks to the backend. It is driven by `tick()`, which first drains the
//! inbound queue (commands and channel-idle notices, in arrival order) and
//! then, while playing, advances the scheduler clock and starts whatever
//! should be sounding.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::backend::{AudioBackend, ChannelId};
use crate::catalog::{Catalog, CueId, Theme};
use crate::config::{ReactivatePolicy, SchedulerConfig};
use crate::cooldown::CooldownTracker;
use crate::error::{BackendError, SchedulerError};
use crate::models::{Command, Input, MediaFile, Snapshot, Sounding, ThemeSummary};
use crate::pool::{ChannelPool, Grant, InstanceId, Occupant, Priority};
use crate::rotator::{Rotator, Track};
use crate::trigger::TriggerEngine;

/// Phase to return to once an interrupting global cue ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resume {
    Idle,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Playing,
    /// Theme channels muted, clock and triggers suspended.
    Paused,
    /// An interrupting global cue is sounding; everything else is stopped.
    Interrupted { resume: Resume },
}

impl From<Resume> for Phase {
    fn from(r: Resume) -> Self {
        match r {
            Resume::Idle => Phase::Idle,
            Resume::Playing => Phase::Playing,
            Resume::Paused => Phase::Paused,
        }
    }
}

/// What the background does next time it is found silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextBackground {
    /// The last track ran out: move on.
    Advance,
    /// The track was cut short (skip, interrupt, music off): play the
    /// rotator's current track again.
    Replay,
}

/// Per-activation state of the active theme.
#[derive(Debug)]
struct ActiveTheme {
    key: char,
    rotator: Rotator,
    trigger: TriggerEngine,
    next_background: NextBackground,
    unreadable: HashSet<PathBuf>,
}

struct Launch {
    cue: CueId,
    priority: Priority,
    looped: bool,
    volume: f32,
    file: PathBuf,
    label: String,
}

pub struct Director {
    catalog: Arc<Catalog>,
    backend: Arc<dyn AudioBackend>,
    config: SchedulerConfig,
    dt: f64,
    rng: StdRng,
    pool: ChannelPool,
    cooldowns: CooldownTracker,
    phase: Phase,
    audio_enabled: bool,
    sound_enabled: bool,
    active: Option<ActiveTheme>,
    inbox: VecDeque<Input>,
    clock: f64,
    next_instance: u64,
    degraded: bool,
    unreadable_globals: HashSet<PathBuf>,
    exhausted_globals: HashSet<char>,
}

impl Director {
    pub fn new(
        catalog: Arc<Catalog>,
        backend: Arc<dyn AudioBackend>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        config.validate(&catalog)?;
        let capacity = match backend.channel_count() {
            Some(limit) => config.channels.min(limit),
            None => config.channels,
        };
        if capacity == 0 {
            return Err(SchedulerError::NoChannels);
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            catalog,
            backend,
            dt: config.dt(),
            config,
            rng,
            pool: ChannelPool::new(capacity),
            cooldowns: CooldownTracker::new(),
            phase: Phase::Idle,
            audio_enabled: true,
            sound_enabled: true,
            active: None,
            inbox: VecDeque::new(),
            clock: 0.0,
            next_instance: 0,
            degraded: false,
            unreadable_globals: HashSet::new(),
            exhausted_globals: HashSet::new(),
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Scheduler time in seconds. Only advances in `Playing`.
    pub fn clock(&self) -> f64 {
        self.clock
    }

    pub fn active_theme(&self) -> Option<char> {
        self.active.as_ref().map(|a| a.key)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Queue an input for the next tick.
    pub fn submit(&mut self, input: impl Into<Input>) {
        self.inbox.push_back(input.into());
    }

    /// One scheduler step of `config.tick`.
    pub fn tick(&mut self) {
        // Idle notices happened before anything queued since the last tick.
        for channel in self.backend.take_idle().into_iter().rev() {
            self.inbox.push_front(Input::ChannelIdle(channel));
        }
        while let Some(input) = self.inbox.pop_front() {
            match input {
                Input::Command(cmd) => self.apply(cmd),
                Input::ChannelIdle(channel) => self.channel_idle(channel),
            }
        }

        if self.phase != Phase::Playing {
            return;
        }
        self.clock += self.dt;
        self.refresh();
        self.run_trigger();
    }

    pub fn apply(&mut self, cmd: Command) {
        log::debug!("cuebox: command {:?}", cmd);
        match cmd {
            Command::ActivateTheme { key } => self.activate_theme(key),
            Command::DeactivateTheme => self.deactivate_theme(),
            Command::FireGlobal { key } => self.fire_global(key),
            Command::TogglePause => self.toggle_pause(),
            Command::SkipNext => self.skip_next(),
            Command::SkipPrevious => self.skip_previous(),
            Command::SetAudioEnabled { enabled } => self.set_audio_enabled(enabled),
            Command::SetSoundEnabled { enabled } => self.set_sound_enabled(enabled),
            Command::ToggleAudio => self.set_audio_enabled(!self.audio_enabled),
            Command::ToggleSound => self.set_sound_enabled(!self.sound_enabled),
        }
    }

    /// Activate the catalog's default theme, if it has one.
    pub fn activate_default(&mut self) {
        if let Some(key) = self.catalog.default_theme().map(|t| t.key) {
            self.activate_theme(key);
        }
    }

    // ------------------------------------------------------------------
    // Theme control
    // ------------------------------------------------------------------

    pub fn activate_theme(&mut self, key: char) {
        let catalog = Arc::clone(&self.catalog);
        let Some(theme) = catalog.theme(key) else {
            log::warn!("cuebox: no theme on key {:?}", key);
            return;
        };

        if self.active_theme() == Some(key) {
            match self.config.reactivate {
                ReactivatePolicy::Deactivate => self.deactivate_theme(),
                ReactivatePolicy::Restart => self.restart_theme(theme),
            }
            return;
        }

        self.stop_where(|o| is_theme_priority(o.priority));
        self.cooldowns.clear();

        let mut rotator = Rotator::new(background_tracks(theme));
        rotator.restart(&mut self.rng);
        self.active = Some(ActiveTheme {
            key,
            rotator,
            trigger: TriggerEngine::new(theme, self.dt),
            next_background: NextBackground::Replay,
            unreadable: HashSet::new(),
        });
        self.phase = match self.phase {
            Phase::Interrupted { .. } => Phase::Interrupted {
                resume: Resume::Playing,
            },
            _ => Phase::Playing,
        };
        log::info!("cuebox: theme {:?} ({}) active", theme.name, key);
        self.refresh();
    }

    /// Reset history, cooldowns and trigger state while audio keeps going.
    fn restart_theme(&mut self, theme: &Theme) {
        self.cooldowns.clear();
        if let Some(active) = self.active.as_mut() {
            active.rotator.forget_history();
            active.trigger = TriggerEngine::new(theme, self.dt);
        }
        log::info!("cuebox: theme {:?} restarted", theme.name);
    }

    pub fn deactivate_theme(&mut self) {
        if self.active.is_none() {
            return;
        }
        self.stop_where(|o| is_theme_priority(o.priority));
        self.cooldowns.clear();
        self.active = None;
        self.phase = match self.phase {
            Phase::Interrupted { .. } => Phase::Interrupted {
                resume: Resume::Idle,
            },
            _ => Phase::Idle,
        };
        log::info!("cuebox: theme deactivated");
    }

    pub fn toggle_pause(&mut self) {
        match self.phase {
            Phase::Playing => {
                self.phase = Phase::Paused;
                for (channel, _) in self.theme_channels() {
                    self.backend.set_volume(channel, 0.0);
                }
                log::info!("cuebox: paused");
            }
            Phase::Paused => {
                self.phase = Phase::Playing;
                for (channel, volume) in self.theme_channels() {
                    self.backend.set_volume(channel, volume);
                }
                log::info!("cuebox: resumed");
                self.refresh();
            }
            Phase::Idle | Phase::Interrupted { .. } => {}
        }
    }

    pub fn skip_next(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.rotator.advance(&mut self.rng).is_none() {
            return;
        }
        self.restart_background();
    }

    pub fn skip_previous(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.rotator.previous().is_none() {
            return;
        }
        self.restart_background();
    }

    fn restart_background(&mut self) {
        self.stop_where(|o| o.priority == Priority::Background);
        if let Some(active) = self.active.as_mut() {
            active.next_background = NextBackground::Replay;
        }
        self.refresh();
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        if self.audio_enabled == enabled {
            return;
        }
        self.audio_enabled = enabled;
        log::info!("cuebox: music {}", on_off(enabled));
        if enabled {
            self.refresh();
        } else {
            self.stop_where(|o| o.priority == Priority::Background);
        }
    }

    pub fn set_sound_enabled(&mut self, enabled: bool) {
        if self.sound_enabled == enabled {
            return;
        }
        self.sound_enabled = enabled;
        log::info!("cuebox: sounds {}", on_off(enabled));
        if enabled {
            self.refresh();
        } else {
            self.stop_where(|o| o.priority == Priority::Effect);
        }
    }

    // ------------------------------------------------------------------
    // Global cues
    // ------------------------------------------------------------------

    pub fn fire_global(&mut self, key: char) {
        let catalog = Arc::clone(&self.catalog);
        let Some(cue) = catalog.global(key) else {
            log::warn!("cuebox: no global cue on key {:?}", key);
            return;
        };
        let id = CueId::Global { key };

        // Pressing the key of a sounding global stops it.
        let running = self.pool.drain_where(|o| o.cue == id);
        if !running.is_empty() {
            let mut ended_interrupt = false;
            for o in running {
                self.backend.stop(o.channel);
                ended_interrupt |= o.priority == Priority::GlobalInterrupt;
            }
            if ended_interrupt {
                self.end_interrupt();
            }
            return;
        }

        let resume = match self.phase {
            Phase::Interrupted { .. } => {
                log::debug!("cuebox: ignoring global {:?} during interrupt", key);
                return;
            }
            Phase::Idle => Resume::Idle,
            Phase::Playing => Resume::Playing,
            Phase::Paused => Resume::Paused,
        };

        let Some(file) = pick_file(&mut self.rng, &cue.files, &self.unreadable_globals) else {
            if self.exhausted_globals.insert(key) {
                log::warn!("cuebox: global {:?} has no playable files left", cue.name);
            }
            return;
        };

        let priority = if cue.interrupting {
            self.stop_where(|o| o.priority != Priority::GlobalInterrupt);
            self.phase = Phase::Interrupted { resume };
            Priority::GlobalInterrupt
        } else {
            Priority::GlobalOverlay
        };

        let Ok(grant) = self.pool.acquire(priority) else {
            log::debug!("cuebox: no free channel for global {:?}", cue.name);
            if cue.interrupting {
                self.end_interrupt();
            }
            return;
        };

        let launched = self.launch(
            grant,
            Launch {
                cue: id,
                priority,
                looped: false,
                volume: catalog.global_volume(cue),
                file: file.path.clone(),
                label: cue.name.clone(),
            },
        );
        match launched {
            Ok(_) => log::info!("cuebox: global {:?} fired", cue.name),
            Err(err) => {
                if let BackendError::FileUnreadable { path, .. } = err {
                    self.unreadable_globals.insert(path);
                }
                if cue.interrupting {
                    self.end_interrupt();
                }
            }
        }
    }

    fn end_interrupt(&mut self) {
        if let Phase::Interrupted { resume } = self.phase {
            self.phase = resume.into();
            log::info!("cuebox: interrupt over, back to {:?}", self.phase);
            self.refresh();
        }
    }

    // ------------------------------------------------------------------
    // Backend notifications
    // ------------------------------------------------------------------

    fn channel_idle(&mut self, channel: ChannelId) {
        let Some(occupant) = self.pool.release_channel(channel) else {
            log::debug!("cuebox: ignoring idle notice for {}", channel);
            return;
        };
        match occupant.priority {
            Priority::Background => {
                if let Some(active) = self.active.as_mut() {
                    active.next_background = NextBackground::Advance;
                }
            }
            Priority::GlobalInterrupt => self.end_interrupt(),
            Priority::Effect | Priority::GlobalOverlay => {}
        }
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Start the background and loop cues if they should sound and don't.
    fn refresh(&mut self) {
        if self.phase != Phase::Playing {
            return;
        }
        self.service_background();
        self.service_loops();
    }

    fn service_background(&mut self) {
        if !self.audio_enabled
            || self.pool.occupants().iter().any(|o| o.priority == Priority::Background)
        {
            return;
        }
        let catalog = Arc::clone(&self.catalog);
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let Some(theme) = catalog.theme(active.key) else {
            return;
        };
        let track = match active.next_background {
            NextBackground::Replay => match active.rotator.current() {
                Some(track) => Some(track),
                None => active.rotator.advance(&mut self.rng),
            },
            NextBackground::Advance => active.rotator.advance(&mut self.rng),
        };
        let Some(track) = track else {
            return;
        };
        active.next_background = NextBackground::Replay;

        let cue = &theme.backgrounds[track.cue];
        let file = &cue.files[track.file];
        let Ok(grant) = self.pool.acquire(Priority::Background) else {
            return;
        };
        let launched = self.launch(
            grant,
            Launch {
                cue: CueId::Background {
                    theme: theme.key,
                    index: track.cue,
                },
                priority: Priority::Background,
                looped: false,
                volume: catalog.background_volume(theme, cue),
                file: file.path.clone(),
                label: file.title.clone(),
            },
        );
        if let Err(BackendError::FileUnreadable { .. }) = launched {
            if let Some(active) = self.active.as_mut() {
                if active.rotator.remove(track) {
                    log::warn!(
                        "cuebox: theme {:?} has no playable background tracks left",
                        theme.name
                    );
                }
            }
        }
    }

    fn service_loops(&mut self) {
        if !self.sound_enabled {
            return;
        }
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let key = active.key;
        for index in active.trigger.looped() {
            if !self.pool.is_playing(CueId::Effect { theme: key, index }) {
                self.start_effect(key, index);
            }
        }
    }

    fn run_trigger(&mut self) {
        if !self.sound_enabled {
            return;
        }
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let key = active.key;
        let fired = active.trigger.sample(&mut self.rng);
        if fired.is_empty() {
            return;
        }
        let catalog = Arc::clone(&self.catalog);
        let Some(theme) = catalog.theme(key) else {
            return;
        };
        for index in fired {
            let id = CueId::Effect { theme: key, index };
            let cue = &theme.effects[index];
            if !self.cooldowns.is_eligible(id, self.clock) {
                continue;
            }
            if !cue.allows_overlap() && self.pool.is_playing(id) {
                continue;
            }
            self.start_effect(key, index);
        }
    }

    fn start_effect(&mut self, key: char, index: usize) {
        let catalog = Arc::clone(&self.catalog);
        let Some(theme) = catalog.theme(key) else {
            return;
        };
        let Some(cue) = theme.effects.get(index) else {
            return;
        };
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let id = CueId::Effect { theme: key, index };

        let Some(file) = pick_file(&mut self.rng, &cue.files, &active.unreadable) else {
            active.trigger.disable(index);
            log::warn!(
                "cuebox: effect {:?} of theme {:?} has no playable files left; disabled",
                cue.name,
                theme.name
            );
            return;
        };
        let Ok(grant) = self.pool.acquire(Priority::Effect) else {
            log::debug!("cuebox: no free channel for effect {:?}", cue.name);
            return;
        };

        let launched = self.launch(
            grant,
            Launch {
                cue: id,
                priority: Priority::Effect,
                looped: cue.looped,
                volume: catalog.effect_volume(theme, cue),
                file: file.path.clone(),
                label: cue.name.clone(),
            },
        );
        match launched {
            // Device trouble does not stop the schedule.
            Ok(_) | Err(BackendError::Device(_)) => {
                self.cooldowns.start(id, self.clock, cue.cooldown);
            }
            Err(BackendError::FileUnreadable { path, .. }) => {
                if let Some(active) = self.active.as_mut() {
                    active.unreadable.insert(path);
                    if cue.files.iter().all(|f| active.unreadable.contains(&f.path)) {
                        active.trigger.disable(index);
                        log::warn!(
                            "cuebox: effect {:?} of theme {:?} has no playable files left; disabled",
                            cue.name,
                            theme.name
                        );
                    }
                }
            }
        }
    }

    /// Play into a granted slot. Stops the evicted occupant first.
    fn launch(&mut self, grant: Grant, launch: Launch) -> Result<ChannelId, BackendError> {
        if let Some(evicted) = grant.evicted {
            log::debug!("cuebox: evicting {:?} for {:?}", evicted.label, launch.label);
            self.backend.stop(evicted.channel);
            self.note_stopped(&evicted);
        }

        match self.backend.play(&launch.file, launch.priority, launch.volume) {
            Ok(channel) => {
                if self.degraded {
                    self.degraded = false;
                    log::info!("cuebox: audio device recovered");
                }
                let instance = InstanceId(self.next_instance);
                self.next_instance += 1;
                log::debug!("cuebox: {} <- {:?} ({})", channel, launch.label, launch.file.display());
                self.pool.assign(
                    grant.slot,
                    Occupant {
                        channel,
                        instance,
                        cue: launch.cue,
                        priority: launch.priority,
                        looped: launch.looped,
                        volume: launch.volume,
                        file: launch.file,
                        label: launch.label,
                    },
                );
                Ok(channel)
            }
            Err(err) => {
                match &err {
                    BackendError::Device(_) => {
                        if !self.degraded {
                            self.degraded = true;
                            log::error!("cuebox: {}; scheduling continues silently", err);
                        }
                    }
                    BackendError::FileUnreadable { .. } => log::warn!("cuebox: {}", err),
                }
                Err(err)
            }
        }
    }

    fn stop_where(&mut self, pred: impl FnMut(&Occupant) -> bool) {
        for occupant in self.pool.drain_where(pred) {
            self.backend.stop(occupant.channel);
            self.note_stopped(&occupant);
        }
    }

    fn note_stopped(&mut self, occupant: &Occupant) {
        if occupant.priority == Priority::Background {
            if let Some(active) = self.active.as_mut() {
                active.next_background = NextBackground::Replay;
            }
        }
    }

    fn theme_channels(&self) -> Vec<(ChannelId, f32)> {
        self.pool
            .occupants()
            .into_iter()
            .filter(|o| is_theme_priority(o.priority))
            .map(|o| (o.channel, o.volume))
            .collect()
    }

    // ------------------------------------------------------------------
    // Observation and teardown
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> Snapshot {
        let theme = self
            .active
            .as_ref()
            .and_then(|a| self.catalog.theme(a.key));
        let background = self.active.as_ref().zip(theme).and_then(|(active, theme)| {
            let track = active.rotator.current()?;
            theme
                .backgrounds
                .get(track.cue)?
                .files
                .get(track.file)
                .map(|f| f.title.clone())
        });
        let occupants = self.pool.occupants();
        let active_global = occupants.iter().rev().find_map(|o| match o.cue {
            CueId::Global { key } => Some(key),
            _ => None,
        });

        Snapshot {
            phase: self.phase,
            theme: theme.map(|t| ThemeSummary {
                key: t.key,
                id: t.id.clone(),
                name: t.name.clone(),
            }),
            paused: matches!(
                self.phase,
                Phase::Paused
                    | Phase::Interrupted {
                        resume: Resume::Paused
                    }
            ),
            audio_enabled: self.audio_enabled,
            sound_enabled: self.sound_enabled,
            degraded: self.degraded,
            background,
            sounding: occupants
                .iter()
                .map(|o| Sounding {
                    cue: o.cue,
                    label: o.label.clone(),
                    priority: o.priority,
                    looped: o.looped,
                })
                .collect(),
            active_global,
            clock: self.clock,
        }
    }

    /// Stop every channel and go idle.
    pub fn shutdown(&mut self) {
        for occupant in self.pool.stop_all(None) {
            self.backend.stop(occupant.channel);
        }
        self.inbox.clear();
        self.active = None;
        self.cooldowns.clear();
        self.phase = Phase::Idle;
    }
}

fn is_theme_priority(priority: Priority) -> bool {
    matches!(priority, Priority::Background | Priority::Effect)
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

fn background_tracks(theme: &Theme) -> Vec<Track> {
    theme
        .backgrounds
        .iter()
        .enumerate()
        .flat_map(|(cue, bg)| (0..bg.files.len()).map(move |file| Track { cue, file }))
        .collect()
}

fn pick_file<'a, R: Rng + ?Sized>(
    rng: &mut R,
    files: &'a [MediaFile],
    skip: &HashSet<PathBuf>,
) -> Option<&'a MediaFile> {
    let readable: Vec<&MediaFile> = files.iter().filter(|f| !skip.contains(&f.path)).collect();
    if readable.is_empty() {
        return None;
    }
    Some(readable[rng.random_range(0..readable.len())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, RecordingBackend};
    use crate::catalog::{BackgroundCue, EffectCue, GlobalCue};
    use std::path::Path;
    use std::time::Duration;

    fn files(names: &[&str]) -> Vec<MediaFile> {
        names.iter().map(|n| MediaFile::new(*n)).collect()
    }

    fn catalog() -> Catalog {
        let forest = Theme::new('f', "Forest")
            .background(BackgroundCue::new("music", files(&["f/a.mp3", "f/b.mp3", "f/c.mp3"])))
            .effect(EffectCue::new("owl", files(&["f/owl.wav"])).with_occurrence(0.0))
            .effect(EffectCue::new("wind", files(&["f/wind.wav"])).looped());
        let cave = Theme::new('c', "Cave")
            .background(BackgroundCue::new("drone", files(&["c/x.mp3", "c/y.mp3"])))
            .effect(EffectCue::new("drip", files(&["c/drip.wav"])).looped());
        let globals = vec![
            GlobalCue::new('1', "Thunder", files(&["g/thunder.wav"])).interrupting(),
            GlobalCue::new('2', "Bell", files(&["g/bell.wav"])),
        ];
        Catalog::new(vec![forest, cave], globals, 100).unwrap()
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_seed(7)
            .with_tick(Duration::from_secs(1))
    }

    fn rig_with(catalog: Catalog, config: SchedulerConfig) -> (Arc<RecordingBackend>, Director) {
        let backend = Arc::new(RecordingBackend::new());
        let dyn_backend: Arc<dyn AudioBackend> = backend.clone();
        let director = Director::new(Arc::new(catalog), dyn_backend, config).unwrap();
        (backend, director)
    }

    fn rig() -> (Arc<RecordingBackend>, Director) {
        rig_with(catalog(), config())
    }

    /// File of the live background channel, if any.
    fn live_background(backend: &RecordingBackend) -> Option<PathBuf> {
        backend.calls().into_iter().rev().find_map(|c| match c {
            BackendCall::Play {
                channel,
                file,
                priority: Priority::Background,
                ..
            } if backend.is_live(channel) => Some(file),
            _ => None,
        })
    }

    fn live_files(backend: &RecordingBackend) -> Vec<PathBuf> {
        backend
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                BackendCall::Play { channel, file, .. } if backend.is_live(channel) => Some(file),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn activation_starts_background_and_loops() {
        let (backend, mut director) = rig();
        director.activate_theme('f');

        assert_eq!(director.phase(), Phase::Playing);
        let bg = live_background(&backend).unwrap();
        assert!(bg.starts_with("f"));
        assert!(live_files(&backend).contains(&PathBuf::from("f/wind.wav")));

        let snap = director.snapshot();
        assert_eq!(snap.theme.unwrap().key, 'f');
        assert_eq!(snap.sounding.len(), 2);
        assert!(snap.background.is_some());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let (backend, mut director) = rig();
        director.activate_theme('z');
        director.fire_global('9');
        assert_eq!(director.phase(), Phase::Idle);
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn theme_switch_stops_old_channels_before_new_ones_start() {
        let (backend, mut director) = rig();
        director.activate_theme('f');
        director.tick();
        director.submit(Command::ActivateTheme { key: 'c' });
        director.tick();

        let calls = backend.calls();
        let first_cave = calls
            .iter()
            .position(|c| matches!(c, BackendCall::Play { file, .. } if file.starts_with("c")))
            .unwrap();
        let forest_channels: Vec<ChannelId> = calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::Play { channel, file, .. } if file.starts_with("f") => Some(*channel),
                _ => None,
            })
            .collect();
        assert_eq!(forest_channels.len(), 2);
        for ch in forest_channels {
            let stop = calls
                .iter()
                .position(|c| *c == BackendCall::Stop(ch))
                .unwrap();
            assert!(stop < first_cave);
        }
        assert_eq!(director.active_theme(), Some('c'));
    }

    #[test]
    fn cooldown_spaces_effect_starts() {
        let theme = Theme::new('r', "Rain")
            .with_basetime(60)
            .effect(
                EffectCue::new("drip", files(&["r/drip.wav"]))
                    .with_occurrence(3.0)
                    .with_cooldown(5.0),
            );
        let catalog = Catalog::new(vec![theme], vec![], 100).unwrap();
        let (backend, mut director) = rig_with(catalog, config());
        director.activate_theme('r');

        let mut starts = Vec::new();
        let mut seen = 0;
        for _ in 0..3000 {
            director.tick();
            let plays = backend.plays().len();
            if plays > seen {
                assert_eq!(plays, seen + 1);
                starts.push(director.clock());
                seen = plays;
            }
            backend.finish_all();
        }

        assert!(starts.len() > 50, "only {} starts", starts.len());
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= 5.0 - 1e-9, "gap {:?}", pair);
        }
    }

    #[test]
    fn interrupt_restores_playing() {
        let (backend, mut director) = rig();
        director.activate_theme('f');
        director.tick();
        let bg = live_background(&backend).unwrap();

        director.fire_global('1');
        assert_eq!(
            director.phase(),
            Phase::Interrupted {
                resume: Resume::Playing
            }
        );
        assert_eq!(live_files(&backend), vec![PathBuf::from("g/thunder.wav")]);

        // Clock is frozen while interrupted.
        let clock = director.clock();
        director.tick();
        assert_eq!(director.clock(), clock);

        backend.finish_file(Path::new("g/thunder.wav"));
        director.tick();
        assert_eq!(director.phase(), Phase::Playing);
        assert_eq!(live_background(&backend), Some(bg));
        assert!(live_files(&backend).contains(&PathBuf::from("f/wind.wav")));
    }

    #[test]
    fn interrupt_restores_paused() {
        let (backend, mut director) = rig();
        director.activate_theme('f');
        director.toggle_pause();

        director.fire_global('1');
        assert_eq!(
            director.phase(),
            Phase::Interrupted {
                resume: Resume::Paused
            }
        );
        assert!(director.snapshot().paused);

        backend.finish_file(Path::new("g/thunder.wav"));
        director.tick();
        assert_eq!(director.phase(), Phase::Paused);
        assert!(director.snapshot().paused);
        assert!(backend.live().is_empty());

        director.toggle_pause();
        assert_eq!(director.phase(), Phase::Playing);
        assert!(live_background(&backend).is_some());
    }

    #[test]
    fn interrupt_ignores_other_globals_and_stops_on_own_key() {
        let (backend, mut director) = rig();
        director.activate_theme('f');
        director.fire_global('1');
        director.fire_global('2');
        assert!(!backend.plays().contains(&PathBuf::from("g/bell.wav")));

        director.fire_global('1');
        assert_eq!(director.phase(), Phase::Playing);
        assert!(live_background(&backend).is_some());
    }

    #[test]
    fn theme_activated_during_interrupt_starts_afterwards() {
        let (backend, mut director) = rig();
        director.fire_global('1');
        assert_eq!(
            director.phase(),
            Phase::Interrupted {
                resume: Resume::Idle
            }
        );

        director.activate_theme('c');
        assert_eq!(
            director.phase(),
            Phase::Interrupted {
                resume: Resume::Playing
            }
        );
        assert!(live_background(&backend).is_none());

        backend.finish_all();
        director.tick();
        assert_eq!(director.phase(), Phase::Playing);
        assert!(live_background(&backend).unwrap().starts_with("c"));
    }

    #[test]
    fn overlay_global_leaves_theme_alone() {
        let (backend, mut director) = rig();
        director.activate_theme('f');
        director.fire_global('2');

        assert_eq!(director.phase(), Phase::Playing);
        assert_eq!(director.snapshot().active_global, Some('2'));
        assert!(live_files(&backend).contains(&PathBuf::from("g/bell.wav")));
        assert!(live_background(&backend).is_some());

        director.fire_global('2');
        assert!(!live_files(&backend).contains(&PathBuf::from("g/bell.wav")));
        assert_eq!(director.snapshot().active_global, None);
    }

    #[test]
    fn idle_notice_is_applied_before_keys_queued_after_it() {
        let (backend, mut director) = rig();
        director.activate_theme('f');
        director.fire_global('1');
        director.tick();

        // Thunder ends, then the operator presses the overlay key.
        backend.finish_file(Path::new("g/thunder.wav"));
        director.submit(Command::FireGlobal { key: '2' });
        director.tick();

        assert_eq!(director.phase(), Phase::Playing);
        assert!(live_files(&backend).contains(&PathBuf::from("g/bell.wav")));
        assert!(live_background(&backend).is_some());
    }

    #[test]
    fn interrupt_key_fires_again_once_it_has_ended() {
        let (backend, mut director) = rig();
        director.activate_theme('f');
        director.fire_global('1');
        director.tick();

        backend.finish_file(Path::new("g/thunder.wav"));
        director.submit(Command::FireGlobal { key: '1' });
        director.tick();

        let thunder = backend
            .plays()
            .iter()
            .filter(|p| p.as_path() == Path::new("g/thunder.wav"))
            .count();
        assert_eq!(thunder, 2);
        assert_eq!(
            director.phase(),
            Phase::Interrupted {
                resume: Resume::Playing
            }
        );
    }

    #[test]
    fn overlay_evicts_background_and_spares_loops() {
        let (backend, mut director) = rig_with(catalog(), config().with_channels(2));
        director.activate_theme('f');
        let bg = live_background(&backend).unwrap();
        let bg_channel = backend
            .calls()
            .into_iter()
            .find_map(|c| match c {
                BackendCall::Play {
                    channel,
                    priority: Priority::Background,
                    ..
                } => Some(channel),
                _ => None,
            })
            .unwrap();
        backend.clear_calls();

        director.fire_global('2');
        let calls = backend.calls();
        assert_eq!(calls[0], BackendCall::Stop(bg_channel));
        assert!(matches!(
            &calls[1],
            BackendCall::Play { file, priority: Priority::GlobalOverlay, .. } if file.as_path() == Path::new("g/bell.wav")
        ));
        assert_eq!(calls.len(), 2);

        let snap = director.snapshot();
        let cues: Vec<CueId> = snap.sounding.iter().map(|s| s.cue).collect();
        assert_eq!(
            cues,
            vec![CueId::Effect { theme: 'f', index: 1 }, CueId::Global { key: '2' }]
        );
        assert!(snap.sounding[0].looped);

        // The cut-short track comes back once a channel frees up.
        backend.finish_file(Path::new("g/bell.wav"));
        director.tick();
        assert_eq!(live_background(&backend), Some(bg));
        assert!(live_files(&backend).contains(&PathBuf::from("f/wind.wav")));
    }

    #[test]
    fn full_pool_drops_effects_and_overlays_silently() {
        let theme = Theme::new('r', "Rain")
            .with_basetime(10)
            .effect(EffectCue::new("hum", files(&["r/hum.wav"])).looped())
            .effect(EffectCue::new("crow", files(&["r/crow.wav"])).with_occurrence(1.0));
        let globals = vec![GlobalCue::new('2', "Bell", files(&["g/bell.wav"]))];
        let catalog = Catalog::new(vec![theme], globals, 100).unwrap();
        let (backend, mut director) = rig_with(catalog, config().with_channels(1));
        director.activate_theme('r');
        assert_eq!(backend.plays(), vec![PathBuf::from("r/hum.wav")]);

        director.fire_global('2');
        for _ in 0..200 {
            director.tick();
        }

        assert_eq!(backend.plays(), vec![PathBuf::from("r/hum.wav")]);
        assert!(!backend.calls().iter().any(|c| matches!(c, BackendCall::Stop(_))));
        assert_eq!(director.phase(), Phase::Playing);
        assert!(!director.is_degraded());
    }

    #[test]
    fn toggle_commands_flip_relative_to_current_state() {
        let (_backend, mut director) = rig();
        director.activate_theme('f');

        director.submit(Command::ToggleAudio);
        director.submit(Command::ToggleAudio);
        director.submit(Command::ToggleSound);
        director.tick();

        let snap = director.snapshot();
        assert!(snap.audio_enabled);
        assert!(!snap.sound_enabled);
        assert!(snap.sounding.iter().all(|s| s.priority == Priority::Background));
    }

    #[test]
    fn pause_toggles_and_mutes() {
        let (backend, mut director) = rig();
        director.toggle_pause();
        assert_eq!(director.phase(), Phase::Idle);

        director.activate_theme('f');
        backend.clear_calls();
        let mut expected = Phase::Playing;
        for _ in 0..6 {
            director.toggle_pause();
            expected = if expected == Phase::Playing {
                Phase::Paused
            } else {
                Phase::Playing
            };
            assert_eq!(director.phase(), expected);
        }

        director.toggle_pause();
        let muted = backend
            .calls()
            .into_iter()
            .rev()
            .take_while(|c| matches!(c, BackendCall::SetVolume(_, v) if *v == 0.0))
            .count();
        assert_eq!(muted, 2);

        let clock = director.clock();
        for _ in 0..10 {
            director.tick();
        }
        assert_eq!(director.clock(), clock);
    }

    #[test]
    fn music_toggle_is_idempotent_and_replays() {
        let (backend, mut director) = rig();
        director.activate_theme('f');
        let bg = live_background(&backend).unwrap();

        director.set_audio_enabled(false);
        let once = backend.calls();
        director.set_audio_enabled(false);
        assert_eq!(backend.calls(), once);
        assert!(live_background(&backend).is_none());

        director.tick();
        assert!(live_background(&backend).is_none());

        director.set_audio_enabled(true);
        assert_eq!(live_background(&backend), Some(bg));
        assert!(director.snapshot().audio_enabled);
    }

    #[test]
    fn sound_toggle_stops_and_restarts_loops() {
        let (backend, mut director) = rig();
        director.activate_theme('f');
        director.set_sound_enabled(false);
        assert!(!live_files(&backend).contains(&PathBuf::from("f/wind.wav")));
        director.tick();
        assert!(!live_files(&backend).contains(&PathBuf::from("f/wind.wav")));

        director.set_sound_enabled(true);
        assert!(live_files(&backend).contains(&PathBuf::from("f/wind.wav")));
    }

    #[test]
    fn loops_restart_when_they_end() {
        let (backend, mut director) = rig();
        director.activate_theme('f');
        backend.finish_file(Path::new("f/wind.wav"));
        director.tick();
        let winds = backend
            .plays()
            .iter()
            .filter(|p| p.as_path() == Path::new("f/wind.wav"))
            .count();
        assert_eq!(winds, 2);
    }

    #[test]
    fn skip_next_and_previous() {
        let (backend, mut director) = rig();
        director.skip_next();
        director.skip_previous();
        assert!(backend.calls().is_empty());

        director.activate_theme('f');
        let first = live_background(&backend).unwrap();

        director.skip_previous();
        assert_eq!(live_background(&backend), Some(first.clone()));

        director.skip_next();
        let second = live_background(&backend).unwrap();
        assert_ne!(second, first);

        director.skip_previous();
        assert_eq!(live_background(&backend), Some(first));

        director.skip_next();
        assert_eq!(live_background(&backend), Some(second));
    }

    #[test]
    fn background_advances_on_completion() {
        let (backend, mut director) = rig();
        director.activate_theme('f');
        let mut last = live_background(&backend).unwrap();
        for _ in 0..20 {
            backend.finish_file(&last);
            director.tick();
            let next = live_background(&backend).unwrap();
            assert_ne!(next, last);
            last = next;
        }
    }

    #[test]
    fn late_idle_notices_are_ignored() {
        let (backend, mut director) = rig();
        director.activate_theme('f');
        let old = backend.live()[0];
        director.skip_next();
        let current = live_background(&backend);

        director.submit(Input::ChannelIdle(old));
        director.submit(Input::ChannelIdle(ChannelId(12_345)));
        director.tick();
        assert_eq!(live_background(&backend), current);
    }

    #[test]
    fn reactivation_restarts_without_cutting_audio() {
        let (backend, mut director) = rig();
        director.activate_theme('f');
        director.skip_next();
        backend.clear_calls();

        director.activate_theme('f');
        assert_eq!(director.phase(), Phase::Playing);
        assert!(backend.calls().is_empty());

        // History is gone.
        director.skip_previous();
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn reactivation_can_deactivate() {
        let config = config().with_reactivate(ReactivatePolicy::Deactivate);
        let (backend, mut director) = rig_with(catalog(), config);
        director.activate_theme('f');
        director.activate_theme('f');
        assert_eq!(director.phase(), Phase::Idle);
        assert_eq!(director.active_theme(), None);
        assert!(backend.live().is_empty());
    }

    #[test]
    fn deactivate_goes_idle() {
        let (backend, mut director) = rig();
        director.fire_global('2');
        director.activate_theme('f');
        director.deactivate_theme();
        assert_eq!(director.phase(), Phase::Idle);
        assert_eq!(live_files(&backend), vec![PathBuf::from("g/bell.wav")]);
        director.deactivate_theme();
        assert_eq!(director.phase(), Phase::Idle);
    }

    #[test]
    fn unreadable_files_are_skipped_then_cue_disabled() {
        let theme = Theme::new('f', "Forest")
            .background(BackgroundCue::new("music", files(&["f/a.mp3"])))
            .effect(EffectCue::new("mixed", files(&["f/bad.wav", "f/good.wav"])).looped())
            .effect(EffectCue::new("broken", files(&["f/broken.wav"])).looped());
        let catalog = Catalog::new(vec![theme], vec![], 100).unwrap();
        let (backend, mut director) = rig_with(catalog, config());
        backend.mark_unreadable("f/bad.wav");
        backend.mark_unreadable("f/broken.wav");
        backend.mark_unreadable("f/a.mp3");

        director.activate_theme('f');
        for _ in 0..5 {
            director.tick();
        }

        assert_eq!(live_files(&backend), vec![PathBuf::from("f/good.wav")]);
        let active = director.active.as_ref().unwrap();
        assert!(!active.trigger.is_disabled(0));
        assert!(active.trigger.is_disabled(1));
        assert!(active.rotator.is_empty());
        assert_eq!(director.phase(), Phase::Playing);
    }

    #[test]
    fn device_failure_degrades_then_recovers() {
        let (backend, mut director) = rig();
        backend.set_device_down(true);
        director.activate_theme('f');
        director.tick();

        assert_eq!(director.phase(), Phase::Playing);
        assert!(director.snapshot().degraded);
        assert!(director.clock() > 0.0);

        backend.set_device_down(false);
        director.tick();
        assert!(!director.is_degraded());
        assert!(live_background(&backend).is_some());
    }

    #[test]
    fn shutdown_stops_everything() {
        let (backend, mut director) = rig();
        director.activate_theme('f');
        director.fire_global('2');
        director.shutdown();
        assert!(backend.live().is_empty());
        assert_eq!(director.phase(), Phase::Idle);
        assert!(director.snapshot().sounding.is_empty());
    }

    #[test]
    fn coarse_tick_is_rejected() {
        let theme = Theme::new('f', "Forest")
            .with_basetime(10)
            .effect(EffectCue::new("rain", files(&["r.wav"])).with_occurrence(10.0));
        let catalog = Catalog::new(vec![theme], vec![], 100).unwrap();
        let backend: Arc<dyn AudioBackend> = Arc::new(RecordingBackend::new());
        let err = Director::new(Arc::new(catalog), backend, config()).err();
        assert!(matches!(err, Some(SchedulerError::TickTooCoarse { .. })));
    }
}
