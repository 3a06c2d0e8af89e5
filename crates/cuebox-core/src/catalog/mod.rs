//! The catalog: themes, their background and effect cues, and global cues.
//!
//! A `Catalog` only exists in validated form. `Catalog::new` checks every
//! structural rule (key alphabet and uniqueness, numeric ranges, non-empty
//! file pools, a single default theme) and nothing downstream re-checks them.

pub mod loader;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::models::{Command, MediaFile};

pub const DEFAULT_BASETIME: u32 = 3600;
pub const MIN_BASETIME: u32 = 1;
pub const MAX_BASETIME: u32 = 36_000;
pub const DEFAULT_VOLUME: u32 = 100;
pub const MAX_VOLUME: u32 = 100;
pub const DEFAULT_OCCURRENCE: f64 = 1.0;
pub const DEFAULT_COOLDOWN: f64 = 0.0;

/// Identity of a cue definition (not of a playing instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CueId {
    Background { theme: char, index: usize },
    Effect { theme: char, index: usize },
    Global { key: char },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundCue {
    pub name: String,
    pub files: Vec<MediaFile>,
    pub volume: u32,
}

impl BackgroundCue {
    pub fn new(name: impl Into<String>, files: Vec<MediaFile>) -> Self {
        Self {
            name: name.into(),
            files,
            volume: DEFAULT_VOLUME,
        }
    }

    pub fn with_volume(mut self, volume: u32) -> Self {
        self.volume = volume;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectCue {
    pub name: String,
    pub files: Vec<MediaFile>,
    pub volume: u32,
    /// Expected firings per basetime window.
    pub occurrence: f64,
    /// Seconds between starts. Negative allows overlapping instances.
    pub cooldown: f64,
    pub looped: bool,
}

impl EffectCue {
    pub fn new(name: impl Into<String>, files: Vec<MediaFile>) -> Self {
        Self {
            name: name.into(),
            files,
            volume: DEFAULT_VOLUME,
            occurrence: DEFAULT_OCCURRENCE,
            cooldown: DEFAULT_COOLDOWN,
            looped: false,
        }
    }

    pub fn with_volume(mut self, volume: u32) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_occurrence(mut self, occurrence: f64) -> Self {
        self.occurrence = occurrence;
        self
    }

    pub fn with_cooldown(mut self, cooldown: f64) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn looped(mut self) -> Self {
        self.looped = true;
        self
    }

    pub fn allows_overlap(&self) -> bool {
        self.cooldown < 0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalCue {
    pub name: String,
    pub key: char,
    pub files: Vec<MediaFile>,
    pub volume: u32,
    pub interrupting: bool,
}

impl GlobalCue {
    pub fn new(key: char, name: impl Into<String>, files: Vec<MediaFile>) -> Self {
        Self {
            name: name.into(),
            key,
            files,
            volume: DEFAULT_VOLUME,
            interrupting: false,
        }
    }

    pub fn with_volume(mut self, volume: u32) -> Self {
        self.volume = volume;
        self
    }

    pub fn interrupting(mut self) -> Self {
        self.interrupting = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Theme {
    pub id: String,
    pub name: String,
    pub key: char,
    pub basetime: u32,
    pub volume: u32,
    pub default: bool,
    pub backgrounds: Vec<BackgroundCue>,
    pub effects: Vec<EffectCue>,
}

impl Theme {
    pub fn new(key: char, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: slug(&name),
            name,
            key,
            basetime: DEFAULT_BASETIME,
            volume: DEFAULT_VOLUME,
            default: false,
            backgrounds: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_basetime(mut self, basetime: u32) -> Self {
        self.basetime = basetime;
        self
    }

    pub fn with_volume(mut self, volume: u32) -> Self {
        self.volume = volume;
        self
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }

    pub fn background(mut self, cue: BackgroundCue) -> Self {
        self.backgrounds.push(cue);
        self
    }

    pub fn effect(mut self, cue: EffectCue) -> Self {
        self.effects.push(cue);
        self
    }

    fn owner(&self) -> String {
        format!("theme {:?} ({})", self.name, self.key)
    }
}

/// Validated, immutable set of themes and global cues.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    themes: Vec<Theme>,
    globals: Vec<GlobalCue>,
    volume: u32,
}

impl Catalog {
    /// Validate and freeze a catalog. `volume` is the master scope applied
    /// on top of every theme and global cue.
    pub fn new(
        themes: Vec<Theme>,
        globals: Vec<GlobalCue>,
        volume: u32,
    ) -> Result<Self, CatalogError> {
        if themes.is_empty() {
            return Err(CatalogError::NoThemes);
        }
        check_range("catalog", "volume", volume as f64, 0.0, MAX_VOLUME as f64)?;

        let mut keys: HashMap<char, String> = HashMap::new();
        let mut default: Option<String> = None;

        for theme in &themes {
            let owner = theme.owner();
            claim_key(&mut keys, theme.key, &owner)?;
            check_range(
                &owner,
                "basetime",
                theme.basetime as f64,
                MIN_BASETIME as f64,
                MAX_BASETIME as f64,
            )?;
            check_range(&owner, "volume", theme.volume as f64, 0.0, MAX_VOLUME as f64)?;

            if theme.default {
                if let Some(first) = default.take() {
                    return Err(CatalogError::MultipleDefaults {
                        first,
                        second: owner,
                    });
                }
                default = Some(owner.clone());
            }

            for cue in &theme.backgrounds {
                let owner = format!("{} background {:?}", owner, cue.name);
                check_range(&owner, "volume", cue.volume as f64, 0.0, MAX_VOLUME as f64)?;
                if cue.files.is_empty() {
                    return Err(CatalogError::EmptyPool { owner });
                }
            }

            for cue in &theme.effects {
                let owner = format!("{} effect {:?}", owner, cue.name);
                check_range(&owner, "volume", cue.volume as f64, 0.0, MAX_VOLUME as f64)?;
                check_range(
                    &owner,
                    "occurrence",
                    cue.occurrence,
                    0.0,
                    theme.basetime as f64,
                )?;
                if !cue.cooldown.is_finite() {
                    return Err(CatalogError::OutOfRange {
                        owner,
                        attribute: "cooldown",
                        value: cue.cooldown,
                        min: f64::MIN,
                        max: f64::MAX,
                    });
                }
                if cue.files.is_empty() {
                    return Err(CatalogError::EmptyPool { owner });
                }
            }
        }

        for cue in &globals {
            let owner = format!("global {:?} ({})", cue.name, cue.key);
            claim_key(&mut keys, cue.key, &owner)?;
            check_range(&owner, "volume", cue.volume as f64, 0.0, MAX_VOLUME as f64)?;
            if cue.files.is_empty() {
                return Err(CatalogError::EmptyPool { owner });
            }
        }

        Ok(Self {
            themes,
            globals,
            volume,
        })
    }

    pub fn themes(&self) -> &[Theme] {
        &self.themes
    }

    pub fn globals(&self) -> &[GlobalCue] {
        &self.globals
    }

    pub fn volume(&self) -> u32 {
        self.volume
    }

    pub fn theme(&self, key: char) -> Option<&Theme> {
        self.themes.iter().find(|t| t.key == key)
    }

    pub fn global(&self, key: char) -> Option<&GlobalCue> {
        self.globals.iter().find(|g| g.key == key)
    }

    pub fn default_theme(&self) -> Option<&Theme> {
        self.themes.iter().find(|t| t.default)
    }

    /// The command an assignable key triggers, if it is bound at all.
    pub fn command_for_key(&self, key: char) -> Option<Command> {
        if self.theme(key).is_some() {
            Some(Command::ActivateTheme { key })
        } else if self.global(key).is_some() {
            Some(Command::FireGlobal { key })
        } else {
            None
        }
    }

    /// Linear 0.0–1.0 volume of a background cue (master × theme × cue).
    pub fn background_volume(&self, theme: &Theme, cue: &BackgroundCue) -> f32 {
        compose_volume(&[self.volume, theme.volume, cue.volume])
    }

    /// Linear 0.0–1.0 volume of an effect cue (master × theme × cue).
    pub fn effect_volume(&self, theme: &Theme, cue: &EffectCue) -> f32 {
        compose_volume(&[self.volume, theme.volume, cue.volume])
    }

    /// Linear 0.0–1.0 volume of a global cue (master × cue).
    pub fn global_volume(&self, cue: &GlobalCue) -> f32 {
        compose_volume(&[self.volume, cue.volume])
    }
}

/// Compose nested percentage scopes into one linear gain.
pub fn compose_volume(scopes: &[u32]) -> f32 {
    scopes
        .iter()
        .fold(1.0f32, |acc, v| acc * (*v).min(MAX_VOLUME) as f32 / 100.0)
}

/// Keys are single characters from a-z or 0-9.
pub fn is_assignable_key(key: char) -> bool {
    key.is_ascii_lowercase() || key.is_ascii_digit()
}

fn claim_key(keys: &mut HashMap<char, String>, key: char, owner: &str) -> Result<(), CatalogError> {
    if !is_assignable_key(key) {
        return Err(CatalogError::InvalidKey {
            owner: owner.to_string(),
            key,
        });
    }
    if let Some(first) = keys.get(&key) {
        return Err(CatalogError::DuplicateKey {
            key,
            first: first.clone(),
            second: owner.to_string(),
        });
    }
    keys.insert(key, owner.to_string());
    Ok(())
}

fn check_range(
    owner: &str,
    attribute: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<(), CatalogError> {
    if value.is_nan() || value < min || value > max {
        return Err(CatalogError::OutOfRange {
            owner: owner.to_string(),
            attribute,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn slug(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}
