use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::asm::line_mnemonic;
use crate::patch::{apply_patches, Patch, PatchError};

/// Translated strings for one entry, bucketed by the kind of line they
/// replace. Each bucket is consumed in dump order; an empty string keeps the
/// original text for that slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationSet {
    pub names: Vec<String>,
    /// `japanese//localised` pairs.
    pub routes: Vec<String>,
    /// `string` records before the first `title`.
    pub strings: Vec<String>,
    pub titles: Vec<String>,
    /// `string` records after the first `title`.
    pub post_title_strings: Vec<String>,
    /// Replacement text by 1-based `message` number. A `%R` marker replaces
    /// the line terminator with whatever follows it.
    pub lines: BTreeMap<usize, String>,
    /// One option list per `select`, in order.
    pub choices: Vec<Vec<String>>,
    pub patches: Vec<Patch>,
}

impl TranslationSet {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// A dump line split into everything before its strings and the strings
/// themselves, in order.
fn split_strings(line: &str) -> (&str, Vec<&str>) {
    let Some(first) = line.find(&['§', '@'][..]) else {
        return (line, Vec::new());
    };
    let head = line[..first].trim_end();
    let mut strings = Vec::new();
    let mut rest = &line[first..];
    while let Some(quoted) = rest.strip_prefix('§') {
        match quoted.find('§') {
            Some(end) => {
                strings.push(&quoted[..end]);
                rest = quoted[end + '§'.len_utf8()..].trim_start();
            }
            None => {
                strings.push(quoted);
                rest = "";
            }
        }
    }
    if let Some(last) = rest.strip_prefix('@') {
        strings.push(last);
    }
    (head, strings)
}

fn join_strings(head: &str, strings: &[String]) -> String {
    let mut out = head.to_string();
    for (k, s) in strings.iter().enumerate() {
        if k + 1 == strings.len() {
            out.push_str(" @");
            out.push_str(s);
        } else {
            out.push_str(" §");
            out.push_str(s);
            out.push('§');
        }
    }
    out
}

/// Replaces the strings of `line` by position. Slots without a non-empty
/// replacement keep their text. `None` if nothing changed.
fn replace_strings(line: &str, replacements: &[(usize, &str)]) -> Option<String> {
    let (head, strings) = split_strings(line);
    let mut strings: Vec<String> = strings.into_iter().map(str::to_string).collect();
    let mut changed = false;
    for &(slot, text) in replacements {
        if text.is_empty() {
            continue;
        }
        if let Some(s) = strings.get_mut(slot) {
            *s = text.to_string();
            changed = true;
        }
    }
    changed.then(|| join_strings(head, &strings))
}

fn replace_last(line: &str, text: &str) -> Option<String> {
    let count = split_strings(line).1.len();
    let slot = count.checked_sub(1)?;
    replace_strings(line, &[(slot, text)])
}

/// The run of two-character `%X` codes that ends `text`, never the whole
/// text.
fn trailing_escapes(text: &str) -> &str {
    let mut start = text.len();
    loop {
        let mut rev = text[..start].chars().rev();
        match (rev.next(), rev.next(), rev.next()) {
            (Some(code), Some('%'), Some(_)) if code != '%' => {
                start -= code.len_utf8() + 1;
            }
            _ => break,
        }
    }
    &text[start..]
}

/// New text for a `message` string. Spoken lines keep the speaker, the
/// opening quote and whatever follows the closing quote.
fn merge_message(original: &str, replacement: &str) -> Option<String> {
    let (replacement, terminator) = match replacement.find("%R") {
        Some(at) => (&replacement[..at], Some(&replacement[at + 2..])),
        None => (replacement, None),
    };

    if !original.starts_with('【') {
        let term = terminator.unwrap_or_else(|| trailing_escapes(original));
        return Some(format!("{replacement}{term}"));
    }

    let open = original.find('「')? + '「'.len_utf8();
    let (speaker, spoken) = original.split_at(open);
    Some(match spoken.rfind('」') {
        Some(close) => {
            let term = terminator.unwrap_or(&spoken[close..]);
            format!("{speaker}{replacement}{term}")
        }
        // Closing quote missing from the source line.
        None => {
            let term = terminator.unwrap_or_else(|| trailing_escapes(spoken));
            format!("{speaker}{replacement}」{term}")
        }
    })
}

/// Writes the strings of `set` into the dump of `entry`, then applies its
/// patches. `None` when the set changes nothing.
pub fn merge(entry: &str, dump: &str, set: &TranslationSet) -> Result<Option<String>, PatchError> {
    let mut lines: Vec<String> = dump.split('\n').map(str::to_string).collect();
    let mut names = set.names.iter();
    let mut routes = set.routes.iter();
    let mut strings = set.strings.iter();
    let mut titles = set.titles.iter();
    let mut post_title = set.post_title_strings.iter();
    let mut choices = set.choices.iter();
    let mut titles_reached = false;
    let mut message = 0;
    let mut modified = false;

    for line in lines.iter_mut() {
        let Some(mnemonic) = line_mnemonic(line) else {
            continue;
        };
        let merged = match mnemonic {
            "name" => names.next().and_then(|tl| replace_last(line, tl)),
            "route" | "route2" => routes.next().and_then(|tl| {
                let (jp, local) = tl.split_once("//")?;
                let last = split_strings(line).1.len().checked_sub(1)?;
                replace_strings(line, &[(0, jp.trim()), (last, local.trim())])
            }),
            "string" => {
                let next = if titles_reached {
                    post_title.next()
                } else {
                    strings.next()
                };
                next.and_then(|tl| replace_last(line, tl))
            }
            "title" => {
                titles_reached = true;
                titles.next().and_then(|tl| replace_last(line, tl))
            }
            "select" => choices
                .next()
                .filter(|options| options.len() > 1)
                .and_then(|options| {
                    let slots: Vec<(usize, &str)> = options
                        .iter()
                        .enumerate()
                        .map(|(k, o)| (k, o.trim()))
                        .collect();
                    replace_strings(line, &slots)
                }),
            "message" => {
                message += 1;
                set.lines.get(&message).and_then(|replacement| {
                    let at = line.find('@')?;
                    let text = merge_message(&line[at + 1..], replacement)?;
                    Some(format!("{}{text}", &line[..=at]))
                })
            }
            _ => None,
        };
        if let Some(merged) = merged {
            *line = merged;
            modified = true;
        }
    }

    if !modified && set.patches.is_empty() {
        return Ok(None);
    }
    let merged = lines.join("\n");
    if set.patches.is_empty() {
        return Ok(Some(merged));
    }
    apply_patches(entry, &merged, &set.patches).map(Some)
}
