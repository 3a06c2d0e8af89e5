//! Media files and audio format classification.

use std::path::{Path, PathBuf};

use lofty::prelude::*;
use lofty::probe::Probe;
use serde::{Deserialize, Serialize};

/// Audio extensions the loader accepts when expanding directories and patterns.
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "m4a", "aac", "ogg", "wav", "opus", "aiff", "alac",
];

/// Container/codec family, used by the directory-layout loader to tell
/// background music from sound effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Mp3,
    Flac,
    Aac,
    Ogg,
    Wav,
    Opus,
    Aiff,
    Alac,
}

impl Format {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "mp3" => Some(Format::Mp3),
            "flac" => Some(Format::Flac),
            "aac" | "m4a" => Some(Format::Aac),
            "ogg" => Some(Format::Ogg),
            "wav" => Some(Format::Wav),
            "opus" => Some(Format::Opus),
            "aiff" => Some(Format::Aiff),
            "alac" => Some(Format::Alac),
            _ => None,
        }
    }

    /// Uncompressed short clips are treated as effects in directory catalogs.
    pub fn is_effect_like(self) -> bool {
        matches!(self, Format::Wav | Format::Aiff)
    }
}

pub fn is_audio_file(path: &Path) -> bool {
    path.is_file() && Format::from_path(path).is_some()
}

/// One playable file of a cue's pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFile {
    pub path: PathBuf,
    pub title: String,
}

impl MediaFile {
    /// Build from a path, using the file name as title. No I/O.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let title = prettify(&path);
        Self { path, title }
    }

    /// Build from a path, preferring the embedded tag title.
    pub fn probe(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let title = tag_title(&path).unwrap_or_else(|| prettify(&path));
        Self { path, title }
    }
}

/// File stem with underscores turned into spaces.
pub fn prettify(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Unknown")
        .replace('_', " ")
}

fn tag_title(path: &Path) -> Option<String> {
    let tagged = Probe::open(path).ok()?.read().ok()?;
    let tag = tagged.primary_tag().or_else(|| tagged.first_tag())?;
    tag.title()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prettify_strips_extension_and_underscores() {
        assert_eq!(prettify(Path::new("/sfx/wolf_howl_02.wav")), "wolf howl 02");
        assert_eq!(prettify(Path::new("tavern.mp3")), "tavern");
    }

    #[test]
    fn format_is_case_insensitive() {
        assert_eq!(Format::from_path(Path::new("A.MP3")), Some(Format::Mp3));
        assert_eq!(Format::from_path(Path::new("b.m4a")), Some(Format::Aac));
        assert_eq!(Format::from_path(Path::new("notes.txt")), None);
        assert_eq!(Format::from_path(Path::new("noext")), None);
    }

    #[test]
    fn probe_falls_back_to_file_name() {
        let file = MediaFile::probe("/nonexistent/dark_forest.ogg");
        assert_eq!(file.title, "dark forest");
    }
}
