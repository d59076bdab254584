use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub mod afs;
pub mod asm;
pub mod disasm;
pub mod encoding;
pub mod glyph;
pub mod names;
pub mod opcode;
pub mod patch;
pub mod session;
pub mod translation;
pub mod typography;

use afs::ArchiveError;
use asm::CompileError;
use disasm::DisasmError;
use patch::PatchError;

pub use encoding::TextEncoding;
pub use glyph::{GlyphMetrics, WrapConfig};
pub use names::NameTable;
pub use session::{is_in_scope, DumpCache, Session};
pub use translation::TranslationSet;
pub use typography::TextPipeline;

/// Font metrics entry inside `FILE/FONTS_PC.AFS`.
pub const DEFAULT_FONT_ENTRY: &str = "DFKYK424.FNI";

#[derive(Debug, Error)]
pub enum LocaliserError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Disasm(#[from] DisasmError),

    #[error("{entry}:{source}")]
    Compile { entry: String, source: CompileError },

    #[error("{entry}: error applying patch: {source}")]
    Patch { entry: String, source: PatchError },

    #[error("no entry named '{0}' in the scene archive")]
    UnknownEntry(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LocaliserError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocaliserSettings {
    /// Game install directory, the one holding `FILE/`.
    pub game_path: PathBuf,
    pub target_encoding: TextEncoding,
    pub en_tweaks: bool,
    pub line_wrap: bool,
    pub wrap: WrapConfig,
    pub font_entry: String,
    /// JSON array of `[japanese, localised]` speaker name pairs.
    pub name_table: Option<PathBuf>,
}

impl Default for LocaliserSettings {
    fn default() -> Self {
        Self {
            game_path: PathBuf::from("."),
            target_encoding: TextEncoding::Big5,
            en_tweaks: true,
            line_wrap: true,
            wrap: WrapConfig::default(),
            font_entry: DEFAULT_FONT_ENTRY.to_string(),
            name_table: None,
        }
    }
}

impl LocaliserSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            LocaliserError::Config(format!(
                "Could not read settings file {}: {e}",
                path.display()
            ))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Text pipeline for these settings. `metrics` is only consulted when
    /// line wrapping is on.
    pub fn pipeline(&self, metrics: Option<Arc<GlyphMetrics>>) -> Result<TextPipeline> {
        let names = match &self.name_table {
            Some(path) => NameTable::load(path)?,
            None => NameTable::default(),
        };
        Ok(TextPipeline {
            target: self.target_encoding,
            en_tweaks: self.en_tweaks,
            line_wrap: self.line_wrap,
            wrap: self.wrap.clone(),
            metrics,
            names: Arc::new(names),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_settings_use_defaults() {
        let settings: LocaliserSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.target_encoding, TextEncoding::Big5);
        assert!(settings.en_tweaks);
        assert!(settings.line_wrap);
        assert_eq!(settings.wrap.max_line_width, 560);
        assert_eq!(settings.font_entry, DEFAULT_FONT_ENTRY);
        assert!(settings.name_table.is_none());
    }

    #[test]
    fn settings_file_overrides_fields() {
        let dir = tempfile::tempdir().unwrap();
        let names = dir.path().join("names.json");
        fs::write(&names, r#"[["【ミホ】", "【美保】"]]"#).unwrap();
        let path = dir.path().join("settings.json");
        let json = serde_json::json!({
            "game_path": dir.path(),
            "target_encoding": "sjis",
            "en_tweaks": false,
            "wrap": { "max_line_width": 400 },
            "name_table": names,
        });
        fs::write(&path, json.to_string()).unwrap();

        let settings = LocaliserSettings::load(&path).unwrap();
        assert_eq!(settings.game_path, dir.path());
        assert_eq!(settings.target_encoding, TextEncoding::Sjis);
        assert!(!settings.en_tweaks);
        assert!(settings.line_wrap);
        assert_eq!(settings.wrap.max_line_width, 400);
        assert_eq!(settings.wrap.glyphs, glyph::GlyphIndexMap::default());

        let pipeline = settings.pipeline(None).unwrap();
        assert_eq!(pipeline.names.len(), 1);
        assert_eq!(pipeline.transform("【美保】«x»"), "【ミホ】《x》");
    }

    #[test]
    fn missing_settings_file_is_a_config_error() {
        let err = LocaliserSettings::load(Path::new("/nonexistent/settings.json")).unwrap_err();
        assert!(matches!(err, LocaliserError::Config(_)));
    }

    #[test]
    fn compile_errors_name_the_entry() {
        let err = LocaliserError::Compile {
            entry: "SC01.BIN".into(),
            source: CompileError::MissingTrailer,
        };
        assert_eq!(err.to_string(), "SC01.BIN:script has no trailer");
    }
}
