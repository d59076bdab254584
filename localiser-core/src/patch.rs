use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::asm::line_mnemonic;
use crate::opcode::{LOOP_COND_NAME, NOP_NAME};

/// Smallest instruction that can hold a `Loop_Cond` jump.
pub const MIN_SLOT_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("malformed patch directive '{directive}': {reason}")]
    Malformed {
        directive: String,
        reason: &'static str,
    },

    #[error("patch {index} in {entry}: line {line} is past the end of the script")]
    LineOutOfRange {
        index: usize,
        entry: String,
        line: usize,
    },

    #[error("patch {index} in {entry}: line {line} does not match patch (found '{found}')")]
    Mismatch {
        index: usize,
        entry: String,
        line: usize,
        found: String,
    },

    #[error("patch {index} in {entry}: line {line} is not an instruction")]
    NotAnInstruction {
        index: usize,
        entry: String,
        line: usize,
    },

    #[error("patch {index} in {entry}: can only patch instructions of {MIN_SLOT_LEN} or higher length, found {length}")]
    SlotTooShort {
        index: usize,
        entry: String,
        length: usize,
    },

    #[error("patch {index} in {entry}: empty patch must be in replacement mode (=)")]
    EmptyPayload { index: usize, entry: String },

    #[error("patch {index} in {entry}: line {line} has no following instruction to return to")]
    NoResumeLine {
        index: usize,
        entry: String,
        line: usize,
    },

    #[error("patch {index} in {entry}: script has no trailer line")]
    MissingTrailer { index: usize, entry: String },
}

pub type Result<T> = std::result::Result<T, PatchError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PatchMode {
    InsertBefore,
    InsertAfter,
    Replace,
}

impl PatchMode {
    fn symbol(self) -> char {
        match self {
            PatchMode::InsertBefore => '<',
            PatchMode::InsertAfter => '>',
            PatchMode::Replace => '=',
        }
    }
}

/// A `:<mode><line>:<expected>[*]` directive and the instruction text that
/// goes with it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Patch {
    pub mode: PatchMode,
    /// 1-based line in the disassembled text.
    pub line: usize,
    pub expected: String,
    /// `expected` only needs to be a prefix of the line.
    pub prefix: bool,
    pub payload: Option<String>,
}

impl FromStr for Patch {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = |reason| PatchError::Malformed {
            directive: s.lines().next().unwrap_or_default().to_string(),
            reason,
        };

        let rest = s.strip_prefix(':').ok_or_else(|| malformed("must start with ':'"))?;
        let mut chars = rest.chars();
        let mode = match chars.next() {
            Some('<') => PatchMode::InsertBefore,
            Some('>') => PatchMode::InsertAfter,
            Some('=') => PatchMode::Replace,
            _ => return Err(malformed("mode must be one of '<', '>' or '='")),
        };
        let rest = chars.as_str();

        let (setup, payload) = match rest.split_once('\n') {
            Some((setup, payload)) => (setup, Some(payload)),
            None => (rest, None),
        };
        let setup = setup.trim_end_matches('\r');
        let (line, expected) = setup
            .split_once(':')
            .ok_or_else(|| malformed("missing ':' after the line number"))?;
        let line: usize = line
            .trim()
            .parse()
            .map_err(|_| malformed("line number is not a number"))?;
        if line == 0 {
            return Err(malformed("line numbers start at 1"));
        }

        let (expected, prefix) = match expected.strip_suffix('*') {
            Some(stem) => (stem, true),
            None => (expected, false),
        };
        let payload = payload
            .map(|p| p.trim_end().to_string())
            .filter(|p| !p.trim().is_empty());

        Ok(Patch {
            mode,
            line,
            expected: expected.to_string(),
            prefix,
            payload,
        })
    }
}

impl TryFrom<String> for Patch {
    type Error = PatchError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}{}:{}", self.mode.symbol(), self.line, self.expected)?;
        if self.prefix {
            write!(f, "*")?;
        }
        if let Some(payload) = &self.payload {
            write!(f, "\n{payload}")?;
        }
        Ok(())
    }
}

impl From<Patch> for String {
    fn from(p: Patch) -> Self {
        p.to_string()
    }
}

impl Patch {
    fn matches(&self, body: &str) -> bool {
        if self.prefix {
            body.starts_with(&self.expected)
        } else {
            body == self.expected
        }
    }
}

/// What applying one patch does to the script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Application {
    /// The slot already holds an injected branch or an erased no-op.
    AlreadyApplied,
    /// The slot becomes a zero-filled no-op of the same length.
    Erased { slot: String },
    /// The slot becomes a jump into `overflow`, which ends with a jump back
    /// to the line after the slot.
    Branched {
        slot: String,
        resume_label: String,
        overflow: Vec<String>,
    },
}

/// Splits leading `&label: ` markers off a line.
/// Splits `&name:` definitions off the front of a line. A label ends at its
/// colon; the space after it is optional, as in the assembler.
fn split_labels(line: &str) -> (&str, &str) {
    let mut body = line;
    while let Some(after) = body.trim_start().strip_prefix('&') {
        match after.split_once(':') {
            Some((_, tail)) => body = tail.trim_start(),
            None => break,
        }
    }
    line.split_at(line.len() - body.len())
}

fn declared_length(body: &str) -> Option<usize> {
    let (_, rest) = body.split_once('.')?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn zero_padding(count: usize) -> String {
    vec!["00"; count].join("-")
}

fn is_erased_slot(body: &str, length: Option<usize>) -> bool {
    if line_mnemonic(body) != Some(NOP_NAME) || declared_length(body) != length {
        return false;
    }
    body.split_once(' ')
        .map(|(_, bytes)| bytes.split('-').all(|b| b.trim() == "00"))
        .unwrap_or(false)
}

fn is_trailer(line: &str) -> bool {
    split_labels(line).1.starts_with("trailer.")
}

/// Works out what patch number `index` (1-based) does to `lines`, without
/// touching them.
pub fn plan(entry: &str, index: usize, patch: &Patch, lines: &[String]) -> Result<Application> {
    let target = patch
        .line
        .checked_sub(1)
        .and_then(|l| lines.get(l))
        .ok_or_else(|| PatchError::LineOutOfRange {
            index,
            entry: entry.to_string(),
            line: patch.line,
        })?;
    let (labels, body) = split_labels(target);

    if !patch.matches(body) {
        let applied = line_mnemonic(body) == Some(LOOP_COND_NAME)
            || (patch.mode == PatchMode::Replace
                && patch.payload.is_none()
                && is_erased_slot(body, declared_length(&patch.expected)));
        if applied {
            return Ok(Application::AlreadyApplied);
        }
        return Err(PatchError::Mismatch {
            index,
            entry: entry.to_string(),
            line: patch.line,
            found: body.to_string(),
        });
    }

    let length = declared_length(body).ok_or_else(|| PatchError::NotAnInstruction {
        index,
        entry: entry.to_string(),
        line: patch.line,
    })?;
    if length < MIN_SLOT_LEN {
        return Err(PatchError::SlotTooShort {
            index,
            entry: entry.to_string(),
            length,
        });
    }

    let Some(payload) = &patch.payload else {
        if patch.mode != PatchMode::Replace {
            return Err(PatchError::EmptyPayload {
                index,
                entry: entry.to_string(),
            });
        }
        let slot = format!("{labels}{NOP_NAME}.{length} {}", zero_padding(length - 2));
        return Ok(Application::Erased { slot });
    };

    match lines.get(patch.line) {
        Some(next) if !is_trailer(next) => {}
        _ => {
            return Err(PatchError::NoResumeLine {
                index,
                entry: entry.to_string(),
                line: patch.line,
            })
        }
    }

    // The jump target takes two of the payload bytes.
    let slot = format!(
        "{labels}{LOOP_COND_NAME}.{length} &P{index}-{}",
        zero_padding(length - 4)
    );
    let resume_label = format!("PR{index}");
    let jump_back = format!(
        "{LOOP_COND_NAME}.{MIN_SLOT_LEN} &{resume_label}-{}",
        zero_padding(MIN_SLOT_LEN - 4)
    );
    let overflow = match patch.mode {
        PatchMode::InsertBefore => vec![format!("&P{index}: {payload}"), body.to_string(), jump_back],
        PatchMode::InsertAfter => vec![format!("&P{index}: {body}"), payload.clone(), jump_back],
        PatchMode::Replace => vec![format!("&P{index}: {payload}"), jump_back],
    };
    Ok(Application::Branched {
        slot,
        resume_label,
        overflow,
    })
}

/// Applies `patches` in order to the disassembled text of `entry`. Patches
/// that were already applied are skipped, so running the same set twice is
/// harmless.
pub fn apply_patches(entry: &str, text: &str, patches: &[Patch]) -> Result<String> {
    if patches.is_empty() {
        return Ok(text.to_string());
    }
    let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
    let mut overflow = Vec::new();

    for (i, patch) in patches.iter().enumerate() {
        let index = i + 1;
        match plan(entry, index, patch, &lines)? {
            Application::AlreadyApplied => {
                warn!(
                    "Skipping patch {index} in {entry} as it appears to be applied; \
                     if it was updated, revert and import again"
                );
            }
            Application::Erased { slot } => {
                lines[patch.line - 1] = slot;
            }
            Application::Branched {
                slot,
                resume_label,
                overflow: block,
            } => {
                lines[patch.line - 1] = slot;
                let next = &mut lines[patch.line];
                *next = format!("&{resume_label}: {next}");
                overflow.extend(block);
            }
        }
    }

    if !overflow.is_empty() {
        let Some(trailer) = lines.iter().rposition(|l| is_trailer(l)) else {
            return Err(PatchError::MissingTrailer {
                index: patches.len(),
                entry: entry.to_string(),
            });
        };
        let tail = lines.split_off(trailer);
        lines.extend(overflow);
        lines.extend(tail);
    }
    info!("{entry}: applied {} patches", patches.len());
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;
    use crate::encoding::TextEncoding;
    use crate::typography::TextPipeline;

    fn script() -> String {
        let mut lines = vec!["header.2 00".to_string()];
        lines.extend((0..10).map(|_| "key_wait.2".to_string()));
        lines.push("fade_in.10 00-01-02-03-04-05-06-07".into());
        lines.push("key_wait.2".into());
        lines.push("ret2.2".into());
        lines.push("trailer.0".into());
        lines.join("\n")
    }

    fn patch(s: &str) -> Patch {
        s.parse().unwrap()
    }

    #[test]
    fn parses_directives() {
        let p = patch(":>12:fade_in.10 00-*\n&label: key_wait.4 00-00");
        assert_eq!(p.mode, PatchMode::InsertAfter);
        assert_eq!(p.line, 12);
        assert_eq!(p.expected, "fade_in.10 00-");
        assert!(p.prefix);
        assert_eq!(p.payload.as_deref(), Some("&label: key_wait.4 00-00"));

        let p = patch(":=3:key_wait.2");
        assert_eq!(p.mode, PatchMode::Replace);
        assert!(!p.prefix);
        assert_eq!(p.payload, None);
        assert_eq!(p.to_string(), ":=3:key_wait.2");
    }

    #[test]
    fn rejects_bad_directives() {
        for bad in ["=3:x", ":?3:x", ":=x:y", ":=0:y", ":=3"] {
            assert!(bad.parse::<Patch>().is_err(), "{bad}");
        }
    }

    #[test]
    fn insert_after_keeps_the_slot_size() {
        let p = patch(":>12:fade_in.10 00-*\n&label: key_wait.4 00-00");
        let patched = apply_patches("SC01", &script(), &[p]).unwrap();
        let lines: Vec<&str> = patched.lines().collect();
        assert_eq!(lines[11], "Loop_Cond.10 &P1-00-00-00-00-00-00");
        assert_eq!(lines[12], "&PR1: key_wait.2");
        assert_eq!(lines[14], "&P1: fade_in.10 00-01-02-03-04-05-06-07");
        assert_eq!(lines[15], "&label: key_wait.4 00-00");
        assert_eq!(lines[16], "Loop_Cond.10 &PR1-00-00-00-00-00-00");
        assert_eq!(lines[17], "trailer.0");

        let out = assemble("SC01", &patched, &TextPipeline::new(TextEncoding::Big5)).unwrap();
        // Slot 12 sits at 22..32 and still jumps to the overflow block at 36.
        assert_eq!(&out[22..32], &[0x06, 10, 36, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&out[32..34], &[0x15, 2]);
        assert_eq!(&out[36..38], &[0x31, 10]);
        assert_eq!(&out[50..54], &[0x06, 10, 32, 0]);
    }

    #[test]
    fn modes_order_the_overflow_block() {
        let before = patch(":<12:fade_in.10*\nkey_wait.2");
        let patched = apply_patches("SC01", &script(), &[before]).unwrap();
        let lines: Vec<&str> = patched.lines().collect();
        assert_eq!(lines[14], "&P1: key_wait.2");
        assert!(lines[15].starts_with("fade_in.10"));

        let replace = patch(":=12:fade_in.10*\nkey_wait.2");
        let patched = apply_patches("SC01", &script(), &[replace]).unwrap();
        let lines: Vec<&str> = patched.lines().collect();
        assert_eq!(lines[14], "&P1: key_wait.2");
        assert!(lines[15].starts_with("Loop_Cond.10 &PR1"));
    }

    #[test]
    fn applying_twice_is_a_no_op() {
        let patches = [
            patch(":>12:fade_in.10 00-*\nkey_wait.2"),
            patch(":=12:fade_in.10*"),
        ];
        let once = apply_patches("SC01", &script(), &patches[..1]).unwrap();
        let twice = apply_patches("SC01", &once, &patches[..1]).unwrap();
        assert_eq!(once, twice);

        let erased = apply_patches("SC01", &script(), &patches[1..]).unwrap();
        assert_eq!(
            erased.lines().nth(11),
            Some("nop.10 00-00-00-00-00-00-00-00")
        );
        let again = apply_patches("SC01", &erased, &patches[1..]).unwrap();
        assert_eq!(erased, again);
    }

    #[test]
    fn keeps_existing_labels_on_the_slot() {
        let text = script().replace("fade_in.10", "&L0016: fade_in.10");
        let patched = apply_patches("SC01", &text, &[patch(":=12:fade_in.10*\nkey_wait.2")]).unwrap();
        assert_eq!(
            patched.lines().nth(11),
            Some("&L0016: Loop_Cond.10 &P1-00-00-00-00-00-00")
        );
    }

    #[test]
    fn labels_without_a_space_still_match() {
        let text = script().replace("fade_in.10", "&x:fade_in.10");
        let patched = apply_patches("SC01", &text, &[patch(":=12:fade_in.10*\nkey_wait.2")]).unwrap();
        assert_eq!(
            patched.lines().nth(11),
            Some("&x:Loop_Cond.10 &P1-00-00-00-00-00-00")
        );
        assert_eq!(split_labels("&a:&b: nop.2"), ("&a:&b: ", "nop.2"));
    }

    #[test]
    fn reports_failures() {
        let text = script();
        let err = apply_patches("SC01", &text, &[patch(":=12:fade_out.10*\nx")]).unwrap_err();
        assert!(matches!(err, PatchError::Mismatch { index: 1, line: 12, .. }));

        let err = apply_patches("SC01", &text, &[patch(":=2:key_wait.2\nx")]).unwrap_err();
        assert!(matches!(err, PatchError::SlotTooShort { length: 2, .. }));

        let err = apply_patches("SC01", &text, &[patch(":>12:fade_in.10*")]).unwrap_err();
        assert!(matches!(err, PatchError::EmptyPayload { .. }));

        let err = apply_patches("SC01", &text, &[patch(":=99:x\ny")]).unwrap_err();
        assert!(matches!(err, PatchError::LineOutOfRange { line: 99, .. }));

        let short = "header.2 00\nfade_in.10 00-00-00-00-00-00-00-00\ntrailer.0";
        let err = apply_patches("SC02", short, &[patch(":=2:fade_in.10*\nx")]).unwrap_err();
        assert!(matches!(err, PatchError::NoResumeLine { .. }));
    }

    #[test]
    fn patches_round_trip_through_json() {
        let p = patch(":<5:a.10*\nb.2");
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(serde_json::from_str::<Patch>(&json).unwrap(), p);
    }
}
