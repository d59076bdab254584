use dashmap::{DashMap, DashSet};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::afs::{Archive, Entry};
use crate::asm::assemble;
use crate::disasm::{disassemble, is_record_file};
use crate::encoding::TextEncoding;
use crate::glyph::GlyphMetrics;
use crate::translation::{merge, TranslationSet};
use crate::typography::TextPipeline;
use crate::{LocaliserError, LocaliserSettings, Result};

pub const SCENE_ARCHIVE: &str = "FILE/SCENE00.afs";
pub const SCENE_BACKUP: &str = "FILE/SCENE00.afs.bak";
pub const FONT_ARCHIVE: &str = "FILE/FONTS_PC.AFS";
pub const DUMP_DIR: &str = "FILE/SCENE00TXT";

const IGNORED_PREFIXES: &[&str] = &[
    "DBG", "MAIN", "DMENU", "SHORTCUT", "INIT", "CLRFLG", "DICT",
];

/// Whether an entry is disassembled, exported and rebuilt on save.
pub fn is_in_scope(name: &str) -> bool {
    is_record_file(name) || !IGNORED_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Disassembled text per entry name. The first dump stored for a name
/// stays until it is explicitly edited.
#[derive(Default)]
pub struct DumpCache {
    dumps: DashMap<String, Arc<str>>,
    edited: DashSet<String>,
}

impl DumpCache {
    pub fn get(&self, name: &str) -> Option<Arc<str>> {
        self.dumps.get(name).map(|d| Arc::clone(d.value()))
    }

    /// Stores `text` unless `name` already has a dump, and returns whichever
    /// dump is cached afterwards.
    pub fn insert_first(&self, name: &str, text: String) -> Arc<str> {
        let cached = self
            .dumps
            .entry(name.to_string())
            .or_insert_with(|| Arc::from(text));
        Arc::clone(cached.value())
    }

    pub fn edit(&self, name: &str, text: String) {
        self.dumps.insert(name.to_string(), Arc::from(text));
        self.edited.insert(name.to_string());
    }

    pub fn is_edited(&self, name: &str) -> bool {
        self.edited.contains(name)
    }

    /// Names edited since the cache was created, sorted.
    pub fn edited(&self) -> Vec<String> {
        let mut names: Vec<String> = self.edited.iter().map(|n| n.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.dumps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dumps.is_empty()
    }

    pub fn clear(&self) {
        self.dumps.clear();
        self.edited.clear();
    }
}

/// Files under `dir` with extension `ext`, sorted by path.
fn collect_files(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .map(|s| s.eq_ignore_ascii_case(ext))
                .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();
    files
}

fn entry_name(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|s| s.to_str())
}

/// An opened game install: the scene archive, the text pipeline its
/// strings are encoded through, and the dumps made or edited so far.
pub struct Session {
    root: PathBuf,
    archive: Archive,
    pipeline: TextPipeline,
    dumps: DumpCache,
    preferred: Mutex<TextEncoding>,
}

impl Session {
    /// Opens a game whose scripts were already prepared.
    pub fn load(settings: &LocaliserSettings) -> Result<Self> {
        let scene = settings.game_path.join(SCENE_ARCHIVE);
        if !scene.exists() {
            return Err(LocaliserError::Config(format!(
                "{} does not exist; prepare the scripts first",
                scene.display()
            )));
        }
        Self::open(settings)
    }

    /// Backs up the scene archive (or restores a missing one from the
    /// backup) and opens it.
    pub fn prepare(settings: &LocaliserSettings) -> Result<Self> {
        let scene = settings.game_path.join(SCENE_ARCHIVE);
        let backup = settings.game_path.join(SCENE_BACKUP);
        if !scene.exists() && !backup.exists() {
            return Err(LocaliserError::Config(format!(
                "Could not find {} under {}",
                SCENE_ARCHIVE,
                settings.game_path.display()
            )));
        }
        if !backup.exists() {
            fs::copy(&scene, &backup)?;
            info!("Backed up scripts to {}", backup.display());
        }
        if !scene.exists() {
            fs::copy(&backup, &scene)?;
            info!("Restored {} from backup", scene.display());
        }
        Self::open(settings)
    }

    fn open(settings: &LocaliserSettings) -> Result<Self> {
        let root = settings.game_path.clone();
        let archive = Archive::open(root.join(SCENE_ARCHIVE))?;
        let metrics = if settings.line_wrap {
            load_metrics(&root, &settings.font_entry)
        } else {
            None
        };
        let pipeline = settings.pipeline(metrics.map(Arc::new))?;
        info!(
            "Loaded {} scripts from {}",
            archive.entries().len(),
            archive.save_path().display()
        );
        Ok(Self {
            root,
            archive,
            pipeline,
            dumps: DumpCache::default(),
            preferred: Mutex::new(settings.target_encoding),
        })
    }

    /// Copies the backup over the scene archive and drops every cached dump.
    pub fn revert(&mut self) -> Result<()> {
        let backup = self.root.join(SCENE_BACKUP);
        if !backup.exists() {
            return Err(LocaliserError::Config(format!(
                "No backup at {} to revert to",
                backup.display()
            )));
        }
        let scene = self.root.join(SCENE_ARCHIVE);
        fs::copy(&backup, &scene)?;
        self.archive = Archive::open(&scene)?;
        self.dumps.clear();
        info!("Reverted scripts from {}", backup.display());
        Ok(())
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn pipeline(&self) -> &TextPipeline {
        &self.pipeline
    }

    pub fn dumps(&self) -> &DumpCache {
        &self.dumps
    }

    fn in_scope(&self) -> Vec<&Entry> {
        self.archive
            .entries()
            .iter()
            .filter(|e| is_in_scope(e.name()))
            .collect()
    }

    fn entry(&self, name: &str) -> Result<&Entry> {
        self.archive
            .find(name)
            .ok_or_else(|| LocaliserError::UnknownEntry(name.to_string()))
    }

    /// Cached dump of `name`, disassembling it on first use. Decoding starts
    /// with whichever encoding the last entry turned out to use.
    pub fn decompile(&self, name: &str) -> Result<Arc<str>> {
        if let Some(dump) = self.dumps.get(name) {
            return Ok(dump);
        }
        let entry = self.entry(name)?;
        let bytes = self.archive.load(entry)?;
        let preferred = *self.preferred.lock();
        let dump = disassemble(name, &bytes, preferred)?;
        *self.preferred.lock() = dump.encoding;
        Ok(self.dumps.insert_first(name, dump.text))
    }

    pub fn edit(&self, name: &str, text: String) -> Result<()> {
        self.entry(name)?;
        self.dumps.edit(name, text);
        Ok(())
    }

    /// Writes the dump of every in-scope entry to `FILE/SCENE00TXT/`.
    pub fn export(&self) -> Result<PathBuf> {
        let dir = self.root.join(DUMP_DIR);
        fs::create_dir_all(&dir)?;
        let entries = self.in_scope();
        entries.par_iter().try_for_each(|entry| -> Result<()> {
            let dump = self.decompile(entry.name())?;
            fs::write(dir.join(format!("{}.txt", entry.name())), dump.as_bytes())?;
            Ok(())
        })?;
        info!("Exported {} scripts to {}", entries.len(), dir.display());
        Ok(dir)
    }

    /// Replaces cached dumps with the `<entry>.txt` files found under `dir`.
    pub fn apply_edits_dir(&self, dir: &Path) -> Result<usize> {
        let mut applied = 0;
        for path in collect_files(dir, "txt") {
            let Some(name) = entry_name(&path) else {
                continue;
            };
            if self.archive.find(name).is_none() {
                warn!("Skipping {}: no entry named {name}", path.display());
                continue;
            }
            let text = fs::read_to_string(&path)?;
            self.dumps.edit(name, text);
            applied += 1;
        }
        info!("Applied {applied} edited scripts from {}", dir.display());
        Ok(applied)
    }

    /// Merges every `<entry>.json` translation set under `dir` into the
    /// cached dumps. An entry whose patches fail keeps its previous dump.
    pub fn import_translations(&self, dir: &Path) -> Result<usize> {
        let mut imported = 0;
        for path in collect_files(dir, "json") {
            let Some(name) = entry_name(&path) else {
                continue;
            };
            if self.archive.find(name).is_none() {
                warn!("Skipping {}: no entry named {name}", path.display());
                continue;
            }
            let set = TranslationSet::load(&path)?;
            let dump = self.decompile(name)?;
            match merge(name, &dump, &set) {
                Ok(Some(text)) => {
                    self.dumps.edit(name, text);
                    imported += 1;
                    if !set.patches.is_empty() {
                        info!("{name}: success applying patches");
                    }
                }
                Ok(None) => debug!("{name}: nothing to import"),
                Err(e) => error!("{name}: error applying patch {e}"),
            }
        }
        info!("Imported {imported} translation sets from {}", dir.display());
        Ok(imported)
    }

    /// Re-assembles every in-scope entry and saves the archive. If any entry
    /// fails nothing is installed or written and the first failure in
    /// archive order is returned.
    pub fn save(&self) -> Result<()> {
        let entries = self.in_scope();
        let results: Vec<Result<(&Entry, Vec<u8>)>> = entries
            .par_iter()
            .map(|&entry| {
                let name = entry.name();
                let dump = self.decompile(name)?;
                let bytes = assemble(name, &dump, &self.pipeline).map_err(|source| {
                    LocaliserError::Compile {
                        entry: name.to_string(),
                        source,
                    }
                })?;
                Ok((entry, bytes))
            })
            .inspect(|result| {
                if let Err(e) = result {
                    error!("{e}");
                }
            })
            .collect();
        let built = results.into_iter().collect::<Result<Vec<_>>>()?;

        for (entry, bytes) in built {
            entry.set_data(bytes);
        }
        self.archive.save()?;
        info!("Saved {} scripts", entries.len());
        Ok(())
    }
}

fn load_metrics(root: &Path, font_entry: &str) -> Option<GlyphMetrics> {
    let path = root.join(FONT_ARCHIVE);
    match Archive::open(&path) {
        Ok(fonts) => GlyphMetrics::from_archive(&fonts, font_entry),
        Err(e) => {
            warn!("Could not open {}: {e}; line wrapping is off", path.display());
            None
        }
    }
}
