use log::warn;
use serde::{Deserialize, Serialize};

use crate::afs::Archive;

/// Largest glyph index that still addresses the Big5 glyph space. Indices
/// below it that fall outside the metrics table are characters the font does
/// not carry; they render as nothing and are allowed through.
const BIG5_GLYPH_LIMIT: u32 = 0xFEFE;
const INVALID_WIDTH: u8 = 0xFF;

/// Per-glyph width and padding, 4 bytes per glyph index:
/// `[flag, width, padding, reserved]`.
#[derive(Clone, Debug)]
pub struct GlyphMetrics {
    data: Vec<u8>,
}

impl GlyphMetrics {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Loads the metrics blob from the font archive. A missing entry is not
    /// fatal; line wrapping is simply disabled.
    pub fn from_archive(archive: &Archive, entry_name: &str) -> Option<Self> {
        let Some(entry) = archive.find(entry_name) else {
            warn!("Could not load font size data: no '{entry_name}' entry");
            return None;
        };
        match archive.load(entry) {
            Ok(data) => Some(Self::new(data.as_ref().clone())),
            Err(e) => {
                warn!("Could not load font size data: {e}");
                None
            }
        }
    }

    /// Width and padding for a glyph index, or `None` when the index has no
    /// usable metric.
    pub fn lookup(&self, index: u32) -> Option<(u8, u8)> {
        let base = index as usize * 4;
        if base + 3 > self.data.len() {
            if index <= BIG5_GLYPH_LIMIT {
                return Some((0, 0));
            }
            return None;
        }
        let width = self.data[base + 1];
        if width == INVALID_WIDTH {
            return None;
        }
        Some((width, self.data[base + 2]))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlyphRange {
    pub first: char,
    pub last: char,
    pub base: u32,
}

/// How characters map onto the font's glyph indices. The numbers were
/// measured against the shipped Big5 font and are kept as data so another
/// font can be described without code changes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GlyphIndexMap {
    pub fixed: Vec<(char, u32)>,
    pub ranges: Vec<GlyphRange>,
    /// Characters measured as a different character, e.g. `@` uses the
    /// full-width at sign.
    pub substitutes: Vec<(char, char)>,
    pub lead_min: u8,
    pub trail_min: u8,
    pub row_stride: u32,
}

impl Default for GlyphIndexMap {
    fn default() -> Self {
        let range = |first, last, base| GlyphRange { first, last, base };
        Self {
            fixed: vec![
                (' ', 0x0),
                (',', 0x1),
                ('.', 0x4),
                (';', 0x6),
                (':', 0x7),
                ('?', 0x8),
                ('!', 0x9),
                ('(', 0x1D),
                (')', 0x1E),
                ('#', 0x6D),
                ('&', 0x6E),
                ('+', 0x8F),
                ('-', 0x90),
                ('/', 0xBE),
                ('"', 0x1DA8),
                ('\u{1e}', 24),
                ('\u{1f}', 11),
            ],
            ranges: vec![
                range('0', '9', 0x12D),
                range('A', 'Z', 0x14E),
                range('a', 'z', 0x168),
                range('\u{1}', '\u{8}', 0x1D2E),
                range('\u{b}', '\u{19}', 0x1D36),
                range('\u{1a}', '\u{1d}', 101),
            ],
            substitutes: vec![('@', '＠')],
            lead_min: 0xA1,
            trail_min: 0x40,
            row_stride: 191,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GlyphIndex {
    Index(u32),
    /// Single-byte characters the font never draws.
    NoGlyph,
    /// Not representable in Big5 at all.
    Unmapped,
}

impl GlyphIndexMap {
    pub fn index_of(&self, c: char) -> GlyphIndex {
        if let Some((_, idx)) = self.fixed.iter().find(|(ch, _)| *ch == c) {
            return GlyphIndex::Index(*idx);
        }
        if let Some(r) = self.ranges.iter().find(|r| r.first <= c && c <= r.last) {
            return GlyphIndex::Index(r.base + (c as u32 - r.first as u32));
        }

        let c = self
            .substitutes
            .iter()
            .find(|(from, _)| *from == c)
            .map_or(c, |(_, to)| *to);

        let mut buf = [0u8; 4];
        let (bytes, _, had_errors) = encoding_rs::BIG5.encode(c.encode_utf8(&mut buf));
        if had_errors {
            return GlyphIndex::Unmapped;
        }
        if bytes.len() < 2 || bytes[0] < self.lead_min {
            return GlyphIndex::NoGlyph;
        }
        let row = (bytes[0] - self.lead_min) as u32;
        let column = bytes[1].wrapping_sub(self.trail_min) as u32;
        GlyphIndex::Index(row * self.row_stride + column)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WrapConfig {
    pub max_line_width: u32,
    pub glyphs: GlyphIndexMap,
}

impl Default for WrapConfig {
    fn default() -> Self {
        Self {
            max_line_width: 560,
            glyphs: GlyphIndexMap::default(),
        }
    }
}
