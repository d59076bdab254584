use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;
use thiserror::Error;

use crate::disasm::is_record_file;
use crate::encoding::TextEncoding;
use crate::opcode;
use crate::typography::TextPipeline;

/// Errors raised while assembling one text dump. Lines and columns are
/// 1-based.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{line}:{column}: could not parse '{mnemonic}' into opcode")]
    UnknownOpcode {
        line: usize,
        column: usize,
        mnemonic: String,
    },

    #[error("{line}:{column}: expected instruction length after '.'")]
    MissingLength { line: usize, column: usize },

    #[error("{line}:{column}: could not parse '{token}' into instruction length")]
    BadLength {
        line: usize,
        column: usize,
        token: String,
    },

    #[error("{line}:1: instruction has length {actual} instead of the expected {expected}")]
    LengthMismatch {
        line: usize,
        expected: usize,
        actual: usize,
    },

    #[error("{line}:1: trailer has length {actual} instead of the expected {expected}")]
    TrailerLength {
        line: usize,
        expected: usize,
        actual: usize,
    },

    #[error("{line}:{column}: §-string must be terminated with another §")]
    UnterminatedString { line: usize, column: usize },

    #[error("{line}:{column}: unexpected character '{found}'")]
    UnexpectedChar {
        line: usize,
        column: usize,
        found: char,
    },

    #[error("{line}:{column}: label definition is missing its ':'")]
    UnterminatedLabel { line: usize, column: usize },

    #[error("{line}:{column}: could not parse label reference")]
    BadLabelRef { line: usize, column: usize },

    #[error("{line}:{column}: label '{label}' is never defined")]
    UndefinedLabel {
        line: usize,
        column: usize,
        label: String,
    },

    #[error("{line}:{column}: label '{label}' lies past the 64kb mark")]
    LabelOverflow {
        line: usize,
        column: usize,
        label: String,
    },

    #[error("{line}:{column}: string has no S cell to bind to")]
    StringWithoutCell { line: usize, column: usize },

    #[error("{line}:1: header must be the first instruction")]
    HeaderNotFirst { line: usize },

    #[error("script has no trailer")]
    MissingTrailer,

    #[error("{line}:{column}: string passes the 64kb mark")]
    PointerOverflow { line: usize, column: usize },

    #[error("{line}:{column}: '{found}' cannot be encoded as {encoding}")]
    Unencodable {
        line: usize,
        column: usize,
        found: char,
        encoding: TextEncoding,
    },
}

impl CompileError {
    /// Line the error points at, if any.
    pub fn line(&self) -> Option<usize> {
        use CompileError::*;
        match self {
            UnknownOpcode { line, .. }
            | MissingLength { line, .. }
            | BadLength { line, .. }
            | LengthMismatch { line, .. }
            | TrailerLength { line, .. }
            | UnterminatedString { line, .. }
            | UnexpectedChar { line, .. }
            | UnterminatedLabel { line, .. }
            | BadLabelRef { line, .. }
            | UndefinedLabel { line, .. }
            | LabelOverflow { line, .. }
            | StringWithoutCell { line, .. }
            | HeaderNotFirst { line }
            | PointerOverflow { line, .. }
            | Unencodable { line, .. } => Some(*line),
            MissingTrailer => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;

const ROUTE_SUFFIX: &[u8] = b"\0%T2";

struct PooledString {
    cell: usize,
    text: String,
    suffix: &'static [u8],
    line: usize,
    column: usize,
}

struct PendingLabel {
    at: usize,
    label: String,
    line: usize,
    column: usize,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum LineKind {
    Header,
    Trailer,
    /// Written as-is, without opcode or length byte.
    Raw,
    Instruction(u8),
}

#[derive(Default)]
struct Assembler {
    out: Vec<u8>,
    trailer: Option<Vec<u8>>,
    labels: HashMap<String, u16>,
    pending: Vec<PendingLabel>,
    strings: Vec<PooledString>,
}

fn is_hex(c: char) -> bool {
    c.is_ascii_hexdigit()
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl Assembler {
    fn define_label(&mut self, name: String, line: usize, column: usize) -> Result<()> {
        let at = u16::try_from(self.out.len()).map_err(|_| CompileError::LabelOverflow {
            line,
            column,
            label: name.clone(),
        })?;
        self.labels.insert(name, at);
        Ok(())
    }

    fn line(&mut self, line_no: usize, line: &str, records: bool) -> Result<()> {
        let chars: Vec<char> = line.chars().collect();

        // Label definitions, comments and the mnemonic.
        let mut i = 0;
        let dot = loop {
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            if i >= chars.len() || chars[i] == '#' {
                return Ok(());
            }
            if chars[i] == '&' {
                let Some(end) = chars[i + 1..].iter().position(|&c| c == ':') else {
                    return Err(CompileError::UnterminatedLabel {
                        line: line_no,
                        column: i + 1,
                    });
                };
                let name: String = chars[i + 1..i + 1 + end].iter().collect();
                self.define_label(name, line_no, i + 1)?;
                i += end + 2;
                continue;
            }
            match chars[i..].iter().position(|&c| c == '.') {
                Some(offset) => break i + offset,
                None => return Ok(()),
            }
        };

        let mnemonic: String = chars[i..dot].iter().collect();
        let kind = match mnemonic.as_str() {
            "header" => LineKind::Header,
            "trailer" => LineKind::Trailer,
            "data" => LineKind::Raw,
            _ if records => LineKind::Raw,
            name => match opcode::opcode(name) {
                Some(op) => LineKind::Instruction(op),
                None => {
                    return Err(CompileError::UnknownOpcode {
                        line: line_no,
                        column: i + 1,
                        mnemonic: name.to_string(),
                    })
                }
            },
        };

        let digits = chars[dot + 1..]
            .iter()
            .take_while(|c| c.is_ascii_digit())
            .count();
        if digits == 0 {
            return Err(CompileError::MissingLength {
                line: line_no,
                column: dot + 2,
            });
        }
        let token: String = chars[dot + 1..dot + 1 + digits].iter().collect();
        let bad_length = || CompileError::BadLength {
            line: line_no,
            column: dot + 2,
            token: token.clone(),
        };
        let length: usize = token.parse().map_err(|_| bad_length())?;

        let start = self.out.len();
        let mut side = match kind {
            LineKind::Header => {
                if start != 0 {
                    return Err(CompileError::HeaderNotFirst { line: line_no });
                }
                self.out.push(u8::try_from(length).map_err(|_| bad_length())?);
                None
            }
            LineKind::Instruction(op) => {
                let length = u8::try_from(length).map_err(|_| bad_length())?;
                self.out.extend_from_slice(&[op, length]);
                None
            }
            LineKind::Raw => None,
            LineKind::Trailer => Some(Vec::with_capacity(length)),
        };

        let in_trailer = side.is_some();
        let mut cells = Vec::new();
        let mut bound = 0;
        let mut i = dot + 1 + digits;
        while i < chars.len() {
            let c = chars[i];
            let column = i + 1;
            if c == '-' || c.is_whitespace() {
                // separator
            } else if c == 'S' && !in_trailer {
                cells.push(self.out.len());
                self.out.extend_from_slice(&[0, 0]);
            } else if c == '§' || c == '@' {
                let (text, next) = if c == '§' {
                    let Some(end) = chars[i + 1..].iter().position(|&c| c == '§') else {
                        return Err(CompileError::UnterminatedString {
                            line: line_no,
                            column,
                        });
                    };
                    (chars[i + 1..i + 1 + end].iter().collect(), i + 1 + end)
                } else {
                    (chars[i + 1..].iter().collect::<String>(), chars.len())
                };
                let Some(&cell) = cells.get(bound) else {
                    return Err(CompileError::StringWithoutCell {
                        line: line_no,
                        column,
                    });
                };
                bound += 1;
                let suffix: &'static [u8] = if c == '@' && mnemonic == "route" {
                    ROUTE_SUFFIX
                } else {
                    &[]
                };
                self.strings.push(PooledString {
                    cell,
                    text,
                    suffix,
                    line: line_no,
                    column,
                });
                i = next;
            } else if c == '&' && !in_trailer {
                let len = chars[i + 1..]
                    .iter()
                    .take_while(|&&c| is_label_char(c))
                    .count();
                if len == 0 {
                    return Err(CompileError::BadLabelRef {
                        line: line_no,
                        column,
                    });
                }
                let label: String = chars[i + 1..i + 1 + len].iter().collect();
                match self.labels.get(&label) {
                    Some(&at) => self.out.extend_from_slice(&at.to_le_bytes()),
                    None => {
                        self.pending.push(PendingLabel {
                            at: self.out.len(),
                            label,
                            line: line_no,
                            column,
                        });
                        self.out.extend_from_slice(&[0, 0]);
                    }
                }
                i += len;
            } else if is_hex(c) && chars.get(i + 1).copied().is_some_and(is_hex) {
                let pair: String = chars[i..i + 2].iter().collect();
                let byte = u8::from_str_radix(&pair, 16).map_err(|_| CompileError::UnexpectedChar {
                    line: line_no,
                    column,
                    found: c,
                })?;
                match side.as_mut() {
                    Some(trailer) => trailer.push(byte),
                    None => self.out.push(byte),
                }
                i += 1;
            } else {
                return Err(CompileError::UnexpectedChar {
                    line: line_no,
                    column,
                    found: c,
                });
            }
            i += 1;
        }

        match side {
            Some(trailer) => {
                if trailer.len() != length {
                    return Err(CompileError::TrailerLength {
                        line: line_no,
                        expected: length,
                        actual: trailer.len(),
                    });
                }
                self.trailer = Some(trailer);
            }
            None => {
                let actual = self.out.len() - start;
                if actual != length {
                    return Err(CompileError::LengthMismatch {
                        line: line_no,
                        expected: length,
                        actual,
                    });
                }
            }
        }
        Ok(())
    }

    fn resolve_labels(&mut self) -> Result<()> {
        for pending in &self.pending {
            let Some(&at) = self.labels.get(&pending.label) else {
                return Err(CompileError::UndefinedLabel {
                    line: pending.line,
                    column: pending.column,
                    label: pending.label.clone(),
                });
            };
            LittleEndian::write_u16(&mut self.out[pending.at..pending.at + 2], at);
        }
        Ok(())
    }

    fn write_strings(&mut self, pipeline: &TextPipeline) -> Result<()> {
        for s in &self.strings {
            let pos = u16::try_from(self.out.len()).map_err(|_| CompileError::PointerOverflow {
                line: s.line,
                column: s.column,
            })?;
            LittleEndian::write_u16(&mut self.out[s.cell..s.cell + 2], pos);
            let bytes = pipeline
                .encode(&s.text)
                .map_err(|found| CompileError::Unencodable {
                    line: s.line,
                    column: s.column,
                    found,
                    encoding: pipeline.target,
                })?;
            self.out.extend_from_slice(&bytes);
            self.out.extend_from_slice(s.suffix);
            self.out.push(0);
        }
        Ok(())
    }
}

/// Mnemonic of a dump line once any `&label: ` definitions are skipped.
/// Blank lines, comments and lines without a `.` have none.
pub fn line_mnemonic(line: &str) -> Option<&str> {
    let mut rest = line.trim_start();
    while let Some(after) = rest.strip_prefix('&') {
        let (_, tail) = after.split_once(':')?;
        rest = tail.trim_start();
    }
    if rest.starts_with('#') {
        return None;
    }
    rest.split_once('.').map(|(mnemonic, _)| mnemonic)
}

/// Assemble the text dump of entry `name` back into bytes.
///
/// The instruction stream is written first, then forward label references
/// are patched, then the string pool is laid out in declaration order and the
/// trailer appended.
pub fn assemble(name: &str, source: &str, pipeline: &TextPipeline) -> Result<Vec<u8>> {
    let records = is_record_file(name);
    let mut asm = Assembler::default();
    for (idx, line) in source.lines().enumerate() {
        asm.line(idx + 1, line, records)?;
    }
    asm.resolve_labels()?;
    asm.write_strings(pipeline)?;
    let trailer = asm.trailer.take().ok_or(CompileError::MissingTrailer)?;
    asm.out.extend_from_slice(&trailer);
    Ok(asm.out)
}
