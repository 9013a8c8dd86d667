//! Watermark font resolution.
//!
//! Fonts are named by file (`Roboto-Regular.ttf`) or by path. A bare file
//! name is looked up in the usual system font directories. Loaded fonts are
//! kept for the life of the library so each file is parsed once.

use crate::error::RelayError;
use ab_glyph::FontArc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

const SYSTEM_FONT_DIRS: [&str; 6] = [
    "/usr/share/fonts/truetype/roboto",
    "/usr/share/fonts/truetype/dejavu",
    "/usr/share/fonts/truetype",
    "/usr/share/fonts/TTF",
    "/usr/share/fonts",
    "/Library/Fonts",
];

const LAST_RESORT: [&str; 2] = [
    "/usr/share/fonts/truetype/roboto/Roboto-Regular.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
];

/// A parsed font plus the path it came from.
#[derive(Clone)]
pub struct LoadedFont {
    /// Identity used in tile cache keys.
    pub id: String,
    pub font: FontArc,
}

impl std::fmt::Debug for LoadedFont {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedFont").field("id", &self.id).finish()
    }
}

/// Resolves and caches watermark fonts.
pub struct FontLibrary {
    search_dirs: Vec<PathBuf>,
    loaded: Mutex<HashMap<PathBuf, LoadedFont>>,
}

impl Default for FontLibrary {
    fn default() -> Self {
        Self::new(SYSTEM_FONT_DIRS.iter().map(PathBuf::from).collect())
    }
}

impl FontLibrary {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self {
            search_dirs,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Paths tried for `preferred` then `fallback`, in order.
    pub fn candidates(&self, preferred: &Path, fallback: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for wanted in [preferred, fallback] {
            out.push(wanted.to_path_buf());
            if wanted.is_relative() {
                if let Some(name) = wanted.file_name() {
                    out.extend(self.search_dirs.iter().map(|d| d.join(name)));
                }
            }
        }
        out.extend(LAST_RESORT.iter().map(PathBuf::from));
        out.dedup();
        out
    }

    /// Load the first usable font among the candidates.
    pub fn resolve(&self, preferred: &Path, fallback: &Path) -> Result<LoadedFont, RelayError> {
        let candidates = self.candidates(preferred, fallback);
        for path in &candidates {
            if let Some(font) = self.cached(path) {
                return Ok(font);
            }
            if !path.is_file() {
                continue;
            }
            match std::fs::read(path).map(FontArc::try_from_vec) {
                Ok(Ok(font)) => {
                    let loaded = LoadedFont {
                        id: path.display().to_string(),
                        font,
                    };
                    info!(font = %loaded.id, "Loaded watermark font");
                    self.lock().insert(path.clone(), loaded.clone());
                    return Ok(loaded);
                }
                Ok(Err(e)) => debug!(path = %path.display(), error = %e, "Not a usable font"),
                Err(e) => debug!(path = %path.display(), error = %e, "Cannot read font"),
            }
        }
        Err(RelayError::FontUnavailable { candidates })
    }

    fn cached(&self, path: &Path) -> Option<LoadedFont> {
        self.lock().get(path).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, LoadedFont>> {
        self.loaded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_names_are_searched_in_font_dirs() {
        let lib = FontLibrary::new(vec![PathBuf::from("/fonts/a"), PathBuf::from("/fonts/b")]);
        let c = lib.candidates(Path::new("Roboto-Regular.ttf"), Path::new("/abs/DejaVuSans.ttf"));
        assert_eq!(c[0], PathBuf::from("Roboto-Regular.ttf"));
        assert_eq!(c[1], PathBuf::from("/fonts/a/Roboto-Regular.ttf"));
        assert_eq!(c[2], PathBuf::from("/fonts/b/Roboto-Regular.ttf"));
        assert_eq!(c[3], PathBuf::from("/abs/DejaVuSans.ttf"));
        assert_eq!(c.len(), 6);
    }

    #[test]
    fn missing_fonts_are_environment_errors() {
        let lib = FontLibrary::new(vec![]);
        let dir = tempfile::tempdir().unwrap();
        let junk = dir.path().join("junk.ttf");
        std::fs::write(&junk, b"not a font").unwrap();
        match lib.resolve(&junk, &dir.path().join("absent.ttf")) {
            Err(e) => assert_eq!(e.kind(), crate::error::FailureKind::Environment),
            // A system font from the last-resort list may exist on this host.
            Ok(font) => assert!(LAST_RESORT.contains(&font.id.as_str())),
        }
    }
}
