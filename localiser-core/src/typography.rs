use log::warn;
use std::sync::Arc;

use crate::encoding::TextEncoding;
use crate::glyph::{GlyphIndex, GlyphMetrics, WrapConfig};
use crate::names::NameTable;

// The font has no italic face; these Cyrillic code points are redrawn as
// italic Latin letters.
const UPPER_ITALICS: [char; 26] = [
    'А', 'Б', 'В', 'Г', 'Д', 'Е', 'Ж', 'З', 'И', 'Й', 'К', 'Л', 'М', 'Н', 'О', 'П', 'Р', 'С', 'Т',
    'У', 'Ф', 'Х', 'Ц', 'Ч', 'Ш', 'Щ',
];
const LOWER_ITALICS: [char; 26] = [
    'а', 'б', 'в', 'г', 'д', 'е', 'ж', 'з', 'и', 'й', 'к', 'л', 'м', 'н', 'о', 'п', 'р', 'с', 'т',
    'у', 'ф', 'х', 'ц', 'ч', 'ш', 'щ',
];

pub fn replace_guillemets(text: &str) -> String {
    text.replace('«', "《").replace('»', "》")
}

fn accented(c: char, italic: bool) -> Option<char> {
    let mapped = match (c, italic) {
        ('Ï', true) => 'Ъ',
        ('é', true) => 'Э',
        ('ï', true) => 'ъ',
        ('Ï', false) => 'Ю',
        ('é', false) => 'э',
        ('ï', false) => 'ю',
        ('ä', false) => 'ь',
        ('ö', false) => 'я',
        _ => return None,
    };
    Some(mapped)
}

fn pair_single_quotes(chars: &mut [char]) {
    let mut open_at = 0;
    let mut open = false;
    for k in 0..chars.len() {
        if chars[k] != '\'' {
            continue;
        }
        let at_edge = k == 0 || k + 1 >= chars.len();
        // An apostrophe inside a word is left alone, as is one closing a
        // word while no quote is open.
        let inside_word = !at_edge
            && chars[k - 1].is_alphabetic()
            && (!open || chars[k + 1].is_alphabetic());
        if at_edge || !inside_word {
            if open {
                chars[open_at] = '‘';
                chars[k] = '’';
            } else {
                open_at = k;
            }
            open = !open;
        }
    }
}

fn pair_double_quotes(chars: &mut [char]) {
    let mut open_at = None;
    for k in 0..chars.len() {
        if chars[k] != '"' {
            continue;
        }
        match open_at.take() {
            Some(start) => {
                chars[start] = '“';
                chars[k] = '”';
            }
            None => open_at = Some(k),
        }
    }
}

/// English typography for the Big5 font: curly quotes, em-dashes, ellipses,
/// `*italics*` and the handful of accented letters the font was patched with.
pub fn apply_en_tweaks(text: &str) -> String {
    let mut text = text.to_string();
    if text.contains("】「") && text.ends_with('」') {
        text.pop();
        text.push('”');
    }
    let text = text
        .replace("】「", "】“")
        .replace("」%", "”%")
        .replace("--", "—");

    let mut chars: Vec<char> = text.chars().collect();
    pair_single_quotes(&mut chars);
    pair_double_quotes(&mut chars);

    let mut out = String::with_capacity(text.len());
    let mut italic = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '.' && chars.get(i + 1) == Some(&'.') && chars.get(i + 2) == Some(&'.') {
            out.push('…');
            i += 3;
            continue;
        }
        i += 1;
        if c == '*' {
            italic = !italic;
            continue;
        }
        if italic && c.is_ascii_uppercase() {
            out.push(UPPER_ITALICS[(c as u8 - b'A') as usize]);
        } else if italic && c.is_ascii_lowercase() {
            out.push(LOWER_ITALICS[(c as u8 - b'a') as usize]);
        } else {
            out.push(accented(c, italic).unwrap_or(c));
        }
    }
    out
}

/// Number of characters an in-line escape at `i` occupies, or `None` if no
/// escape starts there. `%N`/`%P` additionally reset the line width.
fn escape_len(chars: &[char], i: usize) -> Option<(usize, bool)> {
    if chars[i] != '%' {
        return None;
    }
    match chars.get(i + 1) {
        Some('N') | Some('P') => Some((2, true)),
        Some('O') if i + 2 < chars.len() => {
            let digits = chars[i + 2..]
                .iter()
                .take_while(|c| c.is_ascii_digit())
                .count();
            Some((2 + digits, false))
        }
        Some('%') | None => None,
        Some(_) => Some((2, false)),
    }
}

fn glyph_size(c: char, metrics: &GlyphMetrics, config: &WrapConfig) -> Option<(u32, u32)> {
    match config.glyphs.index_of(c) {
        GlyphIndex::NoGlyph => None,
        GlyphIndex::Unmapped => {
            warn!("No glyph for char '{c}'");
            Some((0, 0))
        }
        GlyphIndex::Index(idx) => match metrics.lookup(idx) {
            Some((width, padding)) => Some((width as u32, padding as u32)),
            None => {
                warn!("Invalid glyph index {idx} for char '{c}'");
                Some((0, 0))
            }
        },
    }
}

/// Inserts `%N` breaks so that no dialogue line grows wider than
/// `config.max_line_width`. Words wider than a whole line are left to
/// overflow.
pub fn wrap_lines(text: &str, metrics: &GlyphMetrics, config: &WrapConfig) -> String {
    let mut chars: Vec<char> = text.chars().collect();

    let quote = chars.windows(2).position(|w| w == ['】', '“']).map(|p| p + 1);
    let spoken = quote.is_some();
    let start = quote.unwrap_or(0);

    let mut width = 0u32;
    let mut i = start;
    while i < chars.len() {
        if spoken && i > 0 && chars[i - 1] == '”' && chars[i] == '%' {
            break;
        }
        if let Some((len, resets)) = escape_len(&chars, i) {
            if resets {
                width = 0;
            }
            i += len;
            continue;
        }
        let c = chars[i];
        if c == '⑩' || c == '\u{3000}' {
            i += 1;
            continue;
        }
        let Some((glyph_width, padding)) = glyph_size(c, metrics, config) else {
            i += 1;
            continue;
        };

        width += glyph_width;
        if width > config.max_line_width && c != ' ' {
            if let Some(space) = break_point(&chars, start, i) {
                chars[space] = '%';
                chars.insert(space + 1, 'N');
                width = 0;
                i = space + 2;
                continue;
            }
        }
        width += padding;
        i += 1;
    }
    chars.into_iter().collect()
}

// Nearest space before `i` that does not lead into an em-dash. Stops at the
// first escape code.
fn break_point(chars: &[char], start: usize, i: usize) -> Option<usize> {
    for j in (start + 1..i).rev() {
        if chars[j] == ' ' && chars[j + 1] != '—' {
            return Some(j);
        }
        if chars[j] == '%' && chars[j + 1] != '%' {
            return None;
        }
    }
    None
}

/// Everything that happens to a string between the text dump and the bytes
/// in the string pool.
#[derive(Clone, Debug)]
pub struct TextPipeline {
    pub target: TextEncoding,
    pub en_tweaks: bool,
    pub line_wrap: bool,
    pub wrap: WrapConfig,
    pub metrics: Option<Arc<GlyphMetrics>>,
    pub names: Arc<NameTable>,
}

impl TextPipeline {
    pub fn new(target: TextEncoding) -> Self {
        Self {
            target,
            en_tweaks: false,
            line_wrap: false,
            wrap: WrapConfig::default(),
            metrics: None,
            names: Arc::new(NameTable::default()),
        }
    }

    pub fn transform(&self, text: &str) -> String {
        let mut text = replace_guillemets(text);
        if self.en_tweaks {
            text = apply_en_tweaks(&text);
            // Wrap finds the dialogue by the curly quotes the tweaks put in.
            if self.line_wrap && self.target == TextEncoding::Big5 {
                if let Some(metrics) = &self.metrics {
                    text = wrap_lines(&text, metrics, &self.wrap);
                }
            }
        }
        self.names.substitute(&text, self.target)
    }

    /// Transform and encode. The error is the first character the target
    /// encoding cannot represent.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>, char> {
        self.target.encode(&self.transform(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Every glyph is 10 wide with no padding.
    fn flat_metrics() -> GlyphMetrics {
        let mut data = vec![0u8; 0x1E00 * 4];
        for glyph in data.chunks_mut(4) {
            glyph[1] = 10;
        }
        GlyphMetrics::new(data)
    }

    fn measured(segment: &str) -> usize {
        segment.chars().count() * 10
    }

    #[test]
    fn speaker_quotes_become_curly() {
        assert_eq!(apply_en_tweaks("【A】「Hi」%K%P"), "【A】“Hi”%K%P");
        assert_eq!(apply_en_tweaks("【A】「Hi」"), "【A】“Hi”");
    }

    #[test]
    fn quotes_pair_up() {
        assert_eq!(apply_en_tweaks("say \"yes\" now"), "say “yes” now");
        assert_eq!(apply_en_tweaks("don't 'go'"), "don't ‘go’");
    }

    #[test]
    fn dashes_and_ellipses() {
        assert_eq!(apply_en_tweaks("wait--what..."), "wait—what…");
    }

    #[test]
    fn italics_use_cyrillic_glyphs() {
        assert_eq!(apply_en_tweaks("a *Bc* d"), "a Бв d");
        assert_eq!(apply_en_tweaks("naïve *ï*"), "naюve ъ");
        assert_eq!(apply_en_tweaks("café"), "cafэ");
    }

    #[test]
    fn guillemets_are_swapped() {
        assert_eq!(replace_guillemets("«x»"), "《x》");
    }

    #[test]
    fn wrap_keeps_every_line_within_bounds() {
        let metrics = flat_metrics();
        let config = WrapConfig::default();
        let text = vec!["word"; 60].join(" ");
        let wrapped = wrap_lines(&text, &metrics, &config);
        assert!(wrapped.contains("%N"));
        for line in wrapped.split("%N") {
            assert!(measured(line) <= 560, "{line:?} too wide");
            assert!(!line.starts_with(' '));
        }
        assert_eq!(wrapped.replace("%N", " "), text);
    }

    #[test]
    fn explicit_breaks_reset_the_width() {
        let metrics = flat_metrics();
        let config = WrapConfig::default();
        let half = vec!["abcd"; 8].join(" ");
        let text = format!("{half}%N{half}");
        assert_eq!(wrap_lines(&text, &metrics, &config), text);
    }

    #[test]
    fn unbreakable_runs_overflow() {
        let metrics = flat_metrics();
        let config = WrapConfig::default();
        let text = "x".repeat(80);
        assert_eq!(wrap_lines(&text, &metrics, &config), text);
    }

    #[test]
    fn spoken_lines_stop_at_the_closing_quote() {
        let metrics = flat_metrics();
        let config = WrapConfig {
            max_line_width: 60,
            ..WrapConfig::default()
        };
        let text = "【A】“ab cd ef”%K long tail words here";
        assert_eq!(
            wrap_lines(text, &metrics, &config),
            "【A】“ab cd%Nef”%K long tail words here"
        );
    }

    #[test]
    fn no_break_before_an_em_dash() {
        let metrics = flat_metrics();
        let config = WrapConfig {
            max_line_width: 50,
            ..WrapConfig::default()
        };
        assert_eq!(wrap_lines("ab —cdefg", &metrics, &config), "ab —cdefg");
    }

    #[test]
    fn pipeline_skips_wrap_for_sjis() {
        let mut pipeline = TextPipeline::new(TextEncoding::Sjis);
        pipeline.en_tweaks = true;
        pipeline.line_wrap = true;
        pipeline.wrap.max_line_width = 10;
        pipeline.metrics = Some(Arc::new(flat_metrics()));
        assert_eq!(pipeline.transform("ab cd"), "ab cd");

        pipeline.target = TextEncoding::Big5;
        assert_eq!(pipeline.transform("ab cd"), "ab%Ncd");
    }

    #[test]
    fn wrap_needs_typographic_tweaks() {
        let mut pipeline = TextPipeline::new(TextEncoding::Big5);
        pipeline.line_wrap = true;
        pipeline.wrap.max_line_width = 60;
        pipeline.metrics = Some(Arc::new(flat_metrics()));
        let line = "【A】「ab cd」%K tail words here";
        assert_eq!(pipeline.transform(line), line);

        pipeline.en_tweaks = true;
        assert_eq!(pipeline.transform(line), "【A】“ab%Ncd”%K tail words here");
    }
}
