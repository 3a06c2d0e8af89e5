//! Catalog loading: JSON documents and plain directory layouts.
//!
//! A JSON catalog names its files with patterns resolved against the
//! document's directory: a single file, a directory (every audio file in
//! it), or a file name with `*` / `?` wildcards.
//!
//! A directory catalog needs no document at all:
//!
//! ```text
//! root/
//!   globals/        every file becomes an interrupting global cue, keys 1-9, 0
//!   forest/         every other directory becomes a theme
//!     night.mp3     compressed files join the background playlist
//!     owl.wav       uncompressed files become effects
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::{
    BackgroundCue, Catalog, EffectCue, GlobalCue, Theme, DEFAULT_BASETIME, DEFAULT_VOLUME,
};
use crate::config::{ReactivatePolicy, SchedulerConfig};
use crate::error::LoadError;
use crate::models::media::{is_audio_file, prettify, Format};
use crate::models::MediaFile;

/// Directory-layout effects fire on average once per hundred basetime seconds.
const DIR_OCCURRENCE_SHARE: f64 = 0.01;
const DIR_EFFECT_COOLDOWN: f64 = 10.0;
const GLOBALS_DIR: &str = "globals";
const GLOBAL_KEYS: &str = "1234567890";

/// A validated catalog plus the scheduler settings that came with it.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub catalog: Catalog,
    pub config: SchedulerConfig,
}

// ---------------------------------------------------------------------------
// Document shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogDoc {
    #[serde(default = "default_volume")]
    volume: u32,
    #[serde(default)]
    scheduler: SchedulerDoc,
    #[serde(default)]
    globals: Vec<GlobalDoc>,
    #[serde(default)]
    themes: Vec<ThemeDoc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchedulerDoc {
    tick_ms: Option<u64>,
    channels: Option<usize>,
    seed: Option<u64>,
    reactivate: Option<ReactivatePolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobalDoc {
    key: String,
    name: Option<String>,
    file: String,
    #[serde(default = "default_volume")]
    volume: u32,
    #[serde(default)]
    interrupting: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ThemeDoc {
    key: String,
    name: String,
    id: Option<String>,
    #[serde(default = "default_basetime")]
    basetime: u32,
    #[serde(default = "default_volume")]
    volume: u32,
    #[serde(default)]
    default: bool,
    #[serde(default)]
    background: Vec<BackgroundDoc>,
    #[serde(default)]
    effects: Vec<EffectDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackgroundDoc {
    file: String,
    name: Option<String>,
    #[serde(default = "default_volume")]
    volume: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EffectDoc {
    file: String,
    name: Option<String>,
    #[serde(default = "default_volume")]
    volume: u32,
    #[serde(default = "default_occurrence")]
    occurrence: f64,
    #[serde(default)]
    cooldown: f64,
    #[serde(default, rename = "loop")]
    looped: bool,
}

fn default_volume() -> u32 {
    DEFAULT_VOLUME
}

fn default_basetime() -> u32 {
    DEFAULT_BASETIME
}

fn default_occurrence() -> f64 {
    super::DEFAULT_OCCURRENCE
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Load a catalog from a JSON file or a directory layout.
pub fn load(path: &Path) -> Result<Loaded, LoadError> {
    if path.is_dir() {
        load_dir(path)
    } else {
        load_json(path)
    }
}

pub fn load_json(path: &Path) -> Result<Loaded, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_json(&text, path)
}

/// Parse a JSON catalog. `origin` names the document in errors and its
/// directory anchors relative patterns.
pub fn parse_json(text: &str, origin: &Path) -> Result<Loaded, LoadError> {
    let doc: CatalogDoc = serde_json::from_str(text).map_err(|source| LoadError::Json {
        path: origin.to_path_buf(),
        source,
    })?;
    let base = origin.parent().unwrap_or(Path::new("."));

    let mut globals = Vec::with_capacity(doc.globals.len());
    for g in doc.globals {
        let owner = format!("global {:?}", g.name.as_deref().unwrap_or(&g.file));
        let key = parse_key(&owner, &g.key)?;
        let name = g.name.unwrap_or_else(|| prettify(Path::new(&g.file)));
        let mut cue = GlobalCue::new(key, name, resolve(base, &g.file, &owner)?).with_volume(g.volume);
        cue.interrupting = g.interrupting;
        globals.push(cue);
    }

    let mut themes = Vec::with_capacity(doc.themes.len());
    for t in doc.themes {
        let owner = format!("theme {:?}", t.name);
        let key = parse_key(&owner, &t.key)?;
        let mut theme = Theme::new(key, t.name.clone())
            .with_basetime(t.basetime)
            .with_volume(t.volume);
        if let Some(id) = t.id {
            theme = theme.with_id(id);
        }
        theme.default = t.default;

        for b in t.background {
            let name = b.name.unwrap_or_else(|| pattern_name(&b.file));
            let owner = format!("{owner} background {name:?}");
            let files = resolve(base, &b.file, &owner)?;
            theme = theme.background(BackgroundCue::new(name, files).with_volume(b.volume));
        }
        for e in t.effects {
            let name = e.name.unwrap_or_else(|| pattern_name(&e.file));
            let owner = format!("{owner} effect {name:?}");
            let files = resolve(base, &e.file, &owner)?;
            let mut cue = EffectCue::new(name, files)
                .with_volume(e.volume)
                .with_occurrence(e.occurrence)
                .with_cooldown(e.cooldown);
            cue.looped = e.looped;
            theme = theme.effect(cue);
        }
        themes.push(theme);
    }

    let catalog = Catalog::new(themes, globals, doc.volume)?;

    let mut config = SchedulerConfig::default();
    if let Some(ms) = doc.scheduler.tick_ms {
        config.tick = Duration::from_millis(ms);
    }
    if let Some(channels) = doc.scheduler.channels {
        config.channels = channels;
    }
    config.seed = doc.scheduler.seed;
    if let Some(policy) = doc.scheduler.reactivate {
        config.reactivate = policy;
    }
    config.validate(&catalog)?;

    log::info!(
        "cuebox: loaded {} themes and {} global cues from {}",
        catalog.themes().len(),
        catalog.globals().len(),
        origin.display()
    );
    Ok(Loaded { catalog, config })
}

/// Build a catalog from a directory layout.
pub fn load_dir(root: &Path) -> Result<Loaded, LoadError> {
    let mut globals = Vec::new();
    let mut themes = Vec::new();
    let mut used: Vec<char> = Vec::new();

    let globals_dir = root.join(GLOBALS_DIR);
    if globals_dir.is_dir() {
        let files = audio_files_in(&globals_dir)?;
        if files.len() > GLOBAL_KEYS.len() {
            log::warn!(
                "cuebox: only the first {} of {} global files get a key",
                GLOBAL_KEYS.len(),
                files.len()
            );
        }
        for (key, path) in GLOBAL_KEYS.chars().zip(files) {
            let file = MediaFile::probe(path);
            let name = file.title.clone();
            globals.push(GlobalCue::new(key, name, vec![file]).interrupting());
            used.push(key);
        }
    }

    for dir in subdirs(root)? {
        let dir_name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if dir_name == GLOBALS_DIR {
            continue;
        }
        let files = audio_files_in(&dir)?;
        if files.is_empty() {
            log::warn!("cuebox: skipping {} (no audio files)", dir.display());
            continue;
        }
        let Some(key) = theme_key(&dir_name, &used) else {
            log::warn!("cuebox: no free key left for theme {:?}", dir_name);
            continue;
        };
        used.push(key);

        let name = prettify(&dir);
        let mut theme = Theme::new(key, name).with_id(dir_name);
        let mut music = Vec::new();
        for path in files {
            let effect_like = Format::from_path(&path).is_some_and(Format::is_effect_like);
            let file = MediaFile::probe(path);
            if effect_like {
                let cue = EffectCue::new(file.title.clone(), vec![file])
                    .with_occurrence(DIR_OCCURRENCE_SHARE * theme.basetime as f64)
                    .with_cooldown(DIR_EFFECT_COOLDOWN);
                theme = theme.effect(cue);
            } else {
                music.push(file);
            }
        }
        if !music.is_empty() {
            theme = theme.background(BackgroundCue::new("music", music));
        }
        themes.push(theme);
    }

    let catalog = Catalog::new(themes, globals, DEFAULT_VOLUME)?;
    let config = SchedulerConfig::default();
    config.validate(&catalog)?;
    log::info!(
        "cuebox: built {} themes and {} global cues from {}",
        catalog.themes().len(),
        catalog.globals().len(),
        root.display()
    );
    Ok(Loaded { catalog, config })
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// Expand a file pattern relative to `base`. Results are sorted.
pub fn expand_pattern(base: &Path, pattern: &str) -> Result<Vec<PathBuf>, LoadError> {
    let path = base.join(pattern);
    if path.is_dir() {
        return audio_files_in(&path);
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    if !file_name.contains(['*', '?']) {
        return Ok(if path.is_file() { vec![path] } else { Vec::new() });
    }

    let dir = path.parent().unwrap_or(base);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out: Vec<PathBuf> = audio_files_in(dir)?
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| wildcard_match(&file_name, n))
        })
        .collect();
    out.sort();
    Ok(out)
}

fn resolve(base: &Path, pattern: &str, owner: &str) -> Result<Vec<MediaFile>, LoadError> {
    let paths = expand_pattern(base, pattern)?;
    if paths.is_empty() {
        return Err(LoadError::NoMatch {
            owner: owner.to_string(),
            pattern: pattern.to_string(),
        });
    }
    Ok(paths.into_iter().map(MediaFile::probe).collect())
}

/// `*` matches any run of characters, `?` exactly one.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

fn pattern_name(pattern: &str) -> String {
    let name = prettify(Path::new(pattern));
    name.replace(['*', '?'], "").trim().to_string()
}

fn parse_key(owner: &str, raw: &str) -> Result<char, LoadError> {
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(LoadError::Invalid {
            owner: owner.to_string(),
            message: format!("key {raw:?} must be exactly one character"),
        }),
    }
}

/// First letter of the name that is still free, else the first free letter.
fn theme_key(name: &str, used: &[char]) -> Option<char> {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase())
        .chain('a'..='z')
        .find(|c| !used.contains(c))
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let entries = std::fs::read_dir(dir).map_err(|source| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut out: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(e) => Some(e.path()),
            Err(e) => {
                log::warn!("cuebox: skipping entry in {}: {}", dir.display(), e);
                None
            }
        })
        .collect();
    out.sort();
    Ok(out)
}

fn audio_files_in(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    Ok(read_dir_sorted(dir)?
        .into_iter()
        .filter(|p| is_audio_file(p))
        .collect())
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    Ok(read_dir_sorted(dir)?
        .into_iter()
        .filter(|p| p.is_dir())
        .collect())
}
