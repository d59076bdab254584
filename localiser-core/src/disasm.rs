use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use thiserror::Error;

use crate::encoding::TextEncoding;
use crate::opcode::{self, LOOP_COND, MESSAGE, RET2, SELECT, SELECT2};

#[derive(Debug, Error)]
pub enum DisasmError {
    #[error("{name}: strings decode as neither big5 nor sjis")]
    Undecodable { name: String },

    #[error("{name}: unknown opcode {opcode:#04X} at {offset:#X}")]
    UnknownOpcode {
        name: String,
        opcode: u8,
        offset: usize,
    },

    #[error("{name}: {what} at {start:#X}..{end:#X} runs past the end of {len} bytes")]
    OutOfBounds {
        name: String,
        what: &'static str,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("{name}: declared length {length} at {offset:#X} is shorter than its own opcode")]
    BadLength {
        name: String,
        offset: usize,
        length: u8,
    },

    #[error("{name}: header length {length} does not fit a {len}-byte script")]
    BadHeader { name: String, length: u8, len: usize },
}

pub type Result<T> = std::result::Result<T, DisasmError>;

/// One fixed-size section of a record file.
pub(crate) struct Section {
    pub name: &'static str,
    pub size: usize,
    pub item_len: usize,
    /// Offsets of the string cells inside each record.
    pub cells: &'static [usize],
}

const fn section(
    name: &'static str,
    size: usize,
    item_len: usize,
    cells: &'static [usize],
) -> Section {
    Section {
        name,
        size,
        item_len,
        cells,
    }
}

pub(crate) const SECTIONS: &[Section] = &[
    section("name", 0x830, 16, &[0, 4]),
    section("route", 0x630, 24, &[4, 8]),
    section("route2", 0x60, 24, &[8, 12]),
    section("unk", 0x59C, 0x59C, &[]),
    section("scene", 0x2D8, 8, &[0]),
    section("unk2", 0x6A4, 0x6A4, &[]),
    section("string", 0x60C, 4, &[0]),
    section("chunk", 0x4, 4, &[]),
    section("title", 0xF0, 8, &[0]),
    section("chunk", 0x4, 4, &[]),
    section("string", 0xE4, 4, &[0]),
    section("chunk", 0x4, 4, &[]),
    section("string", 0x8, 4, &[0]),
    section("footer", 0x14, 0x14, &[]),
];

/// Entries holding fixed-layout record tables instead of scene bytecode.
pub fn is_record_file(name: &str) -> bool {
    name.starts_with("DATA")
}

pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push('-');
        }
        let _ = write!(out, "{b:02X}");
    }
    out
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disassembly {
    pub text: String,
    /// The encoding the strings were successfully decoded with.
    pub encoding: TextEncoding,
}

/// Disassemble one entry, starting with `preferred` and flipping to the
/// other encoding at most once.
pub fn disassemble(name: &str, bytes: &[u8], preferred: TextEncoding) -> Result<Disassembly> {
    for encoding in [preferred, preferred.flipped()] {
        match attempt(name, bytes, encoding) {
            Ok(text) => return Ok(Disassembly { text, encoding }),
            Err(Failure::Decode) if encoding == preferred => {
                debug!("{name}: not {encoding}, retrying as {}", encoding.flipped());
            }
            Err(Failure::Decode) => {}
            Err(Failure::Fatal(e)) => return Err(e),
        }
    }
    Err(DisasmError::Undecodable {
        name: name.to_string(),
    })
}

enum Failure {
    Decode,
    Fatal(DisasmError),
}

impl From<DisasmError> for Failure {
    fn from(e: DisasmError) -> Self {
        Failure::Fatal(e)
    }
}

enum Piece {
    Byte(u8),
    Cell,
    Jump(u16),
}

struct Row {
    start: Option<usize>,
    head: String,
    pieces: Vec<Piece>,
    strings: Vec<String>,
}

impl Row {
    fn raw(head: String, bytes: &[u8]) -> Self {
        Self {
            start: None,
            head,
            pieces: bytes.iter().copied().map(Piece::Byte).collect(),
            strings: Vec::new(),
        }
    }
}

struct Walker<'a> {
    name: &'a str,
    bytes: &'a [u8],
    encoding: TextEncoding,
    min_string: usize,
    max_string_end: usize,
    jumps: BTreeSet<u16>,
}

impl<'a> Walker<'a> {
    fn out_of_bounds(&self, what: &'static str, start: usize, end: usize) -> DisasmError {
        DisasmError::OutOfBounds {
            name: self.name.to_string(),
            what,
            start,
            end,
            len: self.bytes.len(),
        }
    }

    fn slice(&self, what: &'static str, start: usize, end: usize) -> Result<&'a [u8]> {
        self.bytes
            .get(start..end)
            .ok_or_else(|| self.out_of_bounds(what, start, end))
    }

    fn read_string(&mut self, ptr: usize) -> std::result::Result<String, Failure> {
        let tail = self
            .bytes
            .get(ptr..)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| self.out_of_bounds("string", ptr, ptr + 1))?;
        let Some(len) = tail.iter().position(|&b| b == 0) else {
            return Err(self.out_of_bounds("string", ptr, self.bytes.len() + 1).into());
        };
        self.min_string = self.min_string.min(ptr);
        self.max_string_end = self.max_string_end.max(ptr + len + 1);
        self.encoding.decode(&tail[..len]).ok_or(Failure::Decode)
    }

    /// Builds a row for `payload`, reading a string through each cell and
    /// reading a jump target at `jump` if given.
    fn row(
        &mut self,
        head: String,
        start: Option<usize>,
        payload: &[u8],
        cells: &[usize],
        jump: Option<usize>,
    ) -> std::result::Result<Row, Failure> {
        let mut pieces = Vec::with_capacity(payload.len());
        let mut strings = Vec::with_capacity(cells.len());
        let mut i = 0;
        while i < payload.len() {
            let wide = i + 2 <= payload.len();
            if wide && cells.contains(&i) {
                let ptr = LittleEndian::read_u16(&payload[i..]) as usize;
                strings.push(self.read_string(ptr)?);
                pieces.push(Piece::Cell);
                i += 2;
            } else if wide && jump == Some(i) {
                let dest = LittleEndian::read_u16(&payload[i..]);
                self.jumps.insert(dest);
                pieces.push(Piece::Jump(dest));
                i += 2;
            } else {
                pieces.push(Piece::Byte(payload[i]));
                i += 1;
            }
        }
        Ok(Row {
            start,
            head,
            pieces,
            strings,
        })
    }

    fn header(&self) -> Result<(Row, usize)> {
        let length = self.bytes.first().copied().unwrap_or(0);
        let end = length as usize;
        if end == 0 || end > self.bytes.len() {
            return Err(DisasmError::BadHeader {
                name: self.name.to_string(),
                length,
                len: self.bytes.len(),
            });
        }
        Ok((Row::raw(format!("header.{length}"), &self.bytes[1..end]), end))
    }

    fn walk_script(
        &mut self,
        rows: &mut Vec<Row>,
        mut pos: usize,
    ) -> std::result::Result<usize, Failure> {
        while pos < self.min_string && pos + 2 <= self.bytes.len() {
            let op = self.bytes[pos];
            let length = self.bytes[pos + 1];
            if length == 0 {
                break;
            }
            if length < 2 {
                return Err(DisasmError::BadLength {
                    name: self.name.to_string(),
                    offset: pos,
                    length,
                }
                .into());
            }
            let Some(mnemonic) = opcode::mnemonic(op) else {
                return Err(DisasmError::UnknownOpcode {
                    name: self.name.to_string(),
                    opcode: op,
                    offset: pos,
                }
                .into());
            };
            let end = pos + length as usize;
            let payload = self.slice("instruction", pos + 2, end)?;

            let select_cells: Vec<usize>;
            let (cells, jump): (&[usize], Option<usize>) = match op {
                MESSAGE | SELECT2 => (&[4], None),
                SELECT => {
                    let count = (length as usize / 8).saturating_sub(1);
                    select_cells = (0..count).map(|i| i * 8 + 6).collect();
                    (&select_cells, None)
                }
                LOOP_COND => (&[], Some(0)),
                _ => (&[], None),
            };
            let head = format!("{mnemonic}.{length}");
            let row = self.row(head, Some(pos), payload, cells, jump)?;
            rows.push(row);

            pos = end;
            if op == RET2 {
                break;
            }
        }
        Ok(pos)
    }

    fn walk_records(
        &mut self,
        rows: &mut Vec<Row>,
        mut pos: usize,
    ) -> std::result::Result<usize, Failure> {
        for section in SECTIONS {
            let section_end = pos + section.size;
            while pos < section_end {
                let end = pos + section.item_len;
                let record = self.slice(section.name, pos, end)?;
                let head = format!("{}.{}", section.name, section.item_len);
                let row = self.row(head, None, record, section.cells, None)?;
                rows.push(row);
                pos = end;
            }
        }
        Ok(pos)
    }
}

fn attempt(
    name: &str,
    bytes: &[u8],
    encoding: TextEncoding,
) -> std::result::Result<String, Failure> {
    let mut walker = Walker {
        name,
        bytes,
        encoding,
        min_string: usize::MAX,
        max_string_end: 0,
        jumps: BTreeSet::new(),
    };
    let (header, start) = walker.header()?;
    let mut rows = vec![header];

    let stream_end = if is_record_file(name) {
        walker.walk_records(&mut rows, start)?
    } else {
        walker.walk_script(&mut rows, start)?
    };

    // Padding between the last instruction and the first string.
    if walker.min_string != usize::MAX && walker.min_string > stream_end {
        let gap = &bytes[stream_end..walker.min_string];
        rows.push(Row::raw(format!("data.{}", gap.len()), gap));
    }

    let trailer_start = stream_end.max(walker.max_string_end).min(bytes.len());
    let trailer = &bytes[trailer_start..];
    rows.push(Row::raw(format!("trailer.{}", trailer.len()), trailer));

    Ok(render(&rows, &walker.jumps))
}

fn render(rows: &[Row], jumps: &BTreeSet<u16>) -> String {
    let starts: BTreeSet<usize> = rows.iter().filter_map(|r| r.start).collect();
    let labels: BTreeSet<u16> = jumps
        .iter()
        .copied()
        .filter(|dest| starts.contains(&(*dest as usize)))
        .collect();

    let mut out = String::new();
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if let Some(start) = row.start {
            if u16::try_from(start).is_ok_and(|s| labels.contains(&s)) {
                let _ = write!(out, "&L{start:04X}: ");
            }
        }
        out.push_str(&row.head);
        for (k, piece) in row.pieces.iter().enumerate() {
            out.push(if k == 0 { ' ' } else { '-' });
            match piece {
                Piece::Byte(b) => {
                    let _ = write!(out, "{b:02X}");
                }
                Piece::Cell => out.push('S'),
                Piece::Jump(dest) if labels.contains(dest) => {
                    let _ = write!(out, "&L{dest:04X}");
                }
                Piece::Jump(dest) => out.push_str(&hex(&dest.to_le_bytes())),
            }
        }
        for (k, s) in row.strings.iter().enumerate() {
            if k + 1 == row.strings.len() {
                let _ = write!(out, " @{s}");
            } else {
                let _ = write!(out, " §{s}§");
            }
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// header.4, a 12-byte message pointing at "AB", ret2, two trailer bytes.
    pub(crate) fn message_script() -> Vec<u8> {
        let mut bytes = vec![4, 0, 0, 0];
        bytes.extend_from_slice(&[MESSAGE, 12, 0, 0, 0, 0, 18, 0, 0, 0, 0, 0]);
        bytes.extend_from_slice(&[RET2, 2]);
        bytes.extend_from_slice(b"AB\0");
        bytes.extend_from_slice(&[0xFF, 0xEE]);
        bytes
    }

    /// A loop that jumps forward over one instruction, then backward to its
    /// own start.
    pub(crate) fn jump_script() -> Vec<u8> {
        let mut bytes = vec![2, 0];
        // 0x02: forward jump to 0x10
        bytes.extend_from_slice(&[LOOP_COND, 10, 0x10, 0x00, 1, 2, 3, 4, 5, 6]);
        // 0x0C: key_wait
        bytes.extend_from_slice(&[0x15, 4, 0xAA, 0xBB]);
        // 0x10: backward jump to 0x02
        bytes.extend_from_slice(&[LOOP_COND, 10, 0x02, 0x00, 0, 0, 0, 0, 0, 0]);
        // 0x1A: jump into the middle of an instruction stays raw
        bytes.extend_from_slice(&[LOOP_COND, 10, 0x05, 0x00, 0, 0, 0, 0, 0, 0]);
        bytes.extend_from_slice(&[RET2, 2]);
        bytes
    }

    #[test]
    fn message_line_and_trailer() {
        let out = disassemble("SC01", &message_script(), TextEncoding::Big5).unwrap();
        assert_eq!(out.encoding, TextEncoding::Big5);
        assert_eq!(
            out.text,
            "header.4 00-00-00\n\
             message.12 00-00-00-00-S-00-00-00-00 @AB\n\
             ret2.2\n\
             trailer.2 FF-EE"
        );
    }

    #[test]
    fn jumps_become_labels() {
        let out = disassemble("SC02", &jump_script(), TextEncoding::Big5).unwrap();
        let lines: Vec<&str> = out.text.lines().collect();
        assert_eq!(lines[0], "header.2 00");
        assert_eq!(lines[1], "&L0002: Loop_Cond.10 &L0010-01-02-03-04-05-06");
        assert_eq!(lines[2], "key_wait.4 AA-BB");
        assert_eq!(lines[3], "&L0010: Loop_Cond.10 &L0002-00-00-00-00-00-00");
        assert_eq!(lines[4], "Loop_Cond.10 05-00-00-00-00-00-00-00");
        assert_eq!(lines[5], "ret2.2");
        assert_eq!(lines[6], "trailer.0");
    }

    #[test]
    fn select_reads_every_choice() {
        let mut bytes = vec![2, 0];
        // select with two choices: 24 bytes, cells at payload 6 and 14
        let mut select = vec![SELECT, 24];
        select.extend_from_slice(&[0; 22]);
        select[2 + 6] = 28;
        select[2 + 14] = 30;
        bytes.extend_from_slice(&select);
        bytes.extend_from_slice(&[RET2, 2]);
        bytes.extend_from_slice(b"a\0b\0");
        let out = disassemble("SC03", &bytes, TextEncoding::Big5).unwrap();
        let line = out.text.lines().nth(1).unwrap();
        assert!(line.starts_with("select.24 00-00-00-00-00-00-S-"));
        assert!(line.ends_with(" §a§ @b"));
    }

    #[test]
    fn flips_to_sjis_once() {
        let mut bytes = vec![2, 0];
        bytes.extend_from_slice(&[MESSAGE, 8, 0, 0, 0, 0, 12, 0]);
        bytes.extend_from_slice(&[RET2, 2]);
        // "あ" in Shift-JIS is not valid Big5.
        bytes.extend_from_slice(&[0x82, 0xA0, 0]);
        let out = disassemble("SC04", &bytes, TextEncoding::Big5).unwrap();
        assert_eq!(out.encoding, TextEncoding::Sjis);
        assert!(out.text.contains("@あ"));
    }

    #[test]
    fn undecodable_in_both_encodings() {
        let mut bytes = vec![2, 0];
        bytes.extend_from_slice(&[MESSAGE, 8, 0, 0, 0, 0, 12, 0]);
        bytes.extend_from_slice(&[RET2, 2]);
        // A lone lead byte is malformed in both.
        bytes.extend_from_slice(&[0x81, 0]);
        let err = disassemble("SC05", &bytes, TextEncoding::Big5).unwrap_err();
        assert!(matches!(err, DisasmError::Undecodable { .. }));
    }

    #[test]
    fn either_encoding_is_tried_once() {
        let mut bytes = vec![2, 0];
        bytes.extend_from_slice(&[MESSAGE, 8, 0, 0, 0, 0, 12, 0]);
        bytes.extend_from_slice(&[RET2, 2]);
        bytes.extend_from_slice(&[0x81, 0]);
        for preferred in [TextEncoding::Big5, TextEncoding::Sjis] {
            let err = disassemble("SC05", &bytes, preferred).unwrap_err();
            assert!(matches!(err, DisasmError::Undecodable { ref name } if name == "SC05"));
        }
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let bytes = vec![2, 0, 0x01, 4, 0, 0];
        let err = disassemble("SC06", &bytes, TextEncoding::Big5).unwrap_err();
        assert!(matches!(
            err,
            DisasmError::UnknownOpcode {
                opcode: 0x01,
                offset: 2,
                ..
            }
        ));
    }

    #[test]
    fn truncated_instruction_is_reported() {
        let bytes = vec![2, 0, 0x15, 8, 0];
        let err = disassemble("SC07", &bytes, TextEncoding::Big5).unwrap_err();
        assert!(matches!(err, DisasmError::OutOfBounds { .. }));
    }

    #[test]
    fn padding_before_the_pool_is_kept() {
        let mut bytes = vec![2, 0];
        bytes.extend_from_slice(&[MESSAGE, 8, 0, 0, 0, 0, 16, 0]);
        bytes.extend_from_slice(&[RET2, 2]);
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes.extend_from_slice(b"x\0");
        let out = disassemble("SC08", &bytes, TextEncoding::Big5).unwrap();
        let lines: Vec<&str> = out.text.lines().collect();
        assert_eq!(lines[3], "data.4 00-00-00-00");
        assert_eq!(lines[4], "trailer.0");
    }

    #[test]
    fn zero_length_ends_the_stream() {
        let bytes = vec![2, 0, 0x15, 2, 0x15, 0, 0xAB];
        let out = disassemble("SC09", &bytes, TextEncoding::Big5).unwrap();
        assert_eq!(out.text, "header.2 00\nkey_wait.2\ntrailer.3 15-00-AB");
    }

    #[test]
    fn record_sections_cover_the_table() {
        let total: usize = SECTIONS.iter().map(|s| s.size).sum();
        for s in SECTIONS {
            assert_eq!(s.size % s.item_len, 0, "{}", s.name);
            assert!(s.cells.iter().all(|c| c + 2 <= s.item_len));
        }
        assert_eq!(total, 0x25E0);
    }
}
