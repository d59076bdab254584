use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::info;
use parking_lot::RwLock;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const ALIGNMENT: u64 = 0x800;

const MAGIC: &[u8; 3] = b"AFS";
const MAX_ENTRIES: u32 = 0xFFFFF;
const NAME_LEN: usize = 32;
// 32-byte name + 6 timestamp words + 4-byte size.
const FOOTER_RECORD_LEN: u32 = 0x30;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{path} is not an AFS archive (magic {found:02X?})")]
    BadMagic { path: PathBuf, found: [u8; 3] },

    #[error("{path}: entry count {count} exceeds the sanity limit")]
    TooManyEntries { path: PathBuf, count: u32 },

    #[error("{path}: archive is truncated while reading the {what}")]
    Truncated { path: PathBuf, what: &'static str },

    #[error("entry '{name}' has no backing file to load from")]
    NoBackingFile { name: String },

    #[error("archive image does not fit in 32-bit offsets")]
    TooLarge,
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

pub fn align(offset: u64, alignment: u64) -> u64 {
    (offset + alignment - 1) & !(alignment - 1)
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Timestamp {
    pub year: u16,
    pub month: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
}

enum Payload {
    OnDisk { offset: u32, size: u32 },
    Loaded(Arc<Vec<u8>>),
}

/// One named blob inside an [`Archive`].
///
/// The payload sits behind a lock so that worker threads can load entries
/// lazily and the assembler can install rebuilt buffers without needing
/// mutable access to the whole archive.
pub struct Entry {
    name: String,
    timestamp: Timestamp,
    payload: RwLock<Payload>,
}

impl Entry {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            timestamp: Timestamp::default(),
            payload: RwLock::new(Payload::Loaded(Arc::new(data))),
        }
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Payload size as written to the footer. Fails for buffers the format
    /// cannot describe.
    pub fn size(&self) -> Result<u32> {
        match &*self.payload.read() {
            Payload::OnDisk { size, .. } => Ok(*size),
            Payload::Loaded(data) => to_u32(data.len()),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(&*self.payload.read(), Payload::Loaded(_))
    }

    pub fn set_data(&self, data: Vec<u8>) {
        *self.payload.write() = Payload::Loaded(Arc::new(data));
    }

    fn load_from(&self, backing: Option<&Path>) -> Result<Arc<Vec<u8>>> {
        let (offset, size) = match &*self.payload.read() {
            Payload::Loaded(data) => return Ok(Arc::clone(data)),
            Payload::OnDisk { offset, size } => (*offset, *size),
        };

        let path = backing.ok_or_else(|| ArchiveError::NoBackingFile {
            name: self.name.clone(),
        })?;
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset as u64))?;
        let mut data = vec![0u8; size as usize];
        file.read_exact(&mut data)
            .map_err(|e| truncated(path, "entry payload", e))?;

        // Another thread may have loaded or replaced the payload meanwhile;
        // whatever is installed first stays.
        let mut guard = self.payload.write();
        match &*guard {
            Payload::Loaded(existing) => Ok(Arc::clone(existing)),
            Payload::OnDisk { .. } => {
                let data = Arc::new(data);
                *guard = Payload::Loaded(Arc::clone(&data));
                Ok(data)
            }
        }
    }
}

fn truncated(path: &Path, what: &'static str, err: io::Error) -> ArchiveError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ArchiveError::Truncated {
            path: path.to_path_buf(),
            what,
        }
    } else {
        ArchiveError::Io(err)
    }
}

/// An AFS container: a header table of (offset, size) pairs, 0x800-aligned
/// payloads, and a footer of per-entry names and timestamps.
pub struct Archive {
    load_path: Option<PathBuf>,
    save_path: PathBuf,
    entries: Arc<Vec<Entry>>,
}

impl Archive {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut rd = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        rd.read_exact(&mut magic)
            .map_err(|e| truncated(path, "header", e))?;
        if &magic[..3] != MAGIC {
            return Err(ArchiveError::BadMagic {
                path: path.to_path_buf(),
                found: [magic[0], magic[1], magic[2]],
            });
        }

        let count = rd
            .read_u32::<LittleEndian>()
            .map_err(|e| truncated(path, "header", e))?;
        if count > MAX_ENTRIES {
            return Err(ArchiveError::TooManyEntries {
                path: path.to_path_buf(),
                count,
            });
        }

        let mut table = Vec::with_capacity(count as usize);
        let mut end = 0u64;
        for _ in 0..count {
            let offset = rd
                .read_u32::<LittleEndian>()
                .map_err(|e| truncated(path, "header table", e))?;
            let size = rd
                .read_u32::<LittleEndian>()
                .map_err(|e| truncated(path, "header table", e))?;
            // Payloads are normally laid out in order, but take the furthest
            // end anyway so reordered archives still find their footer.
            end = end.max(offset as u64 + size as u64);
            table.push((offset, size));
        }

        rd.seek(SeekFrom::Start(align(end, ALIGNMENT)))?;

        let mut entries = Vec::with_capacity(table.len());
        for (offset, size) in table {
            let mut name_bytes = [0u8; NAME_LEN];
            rd.read_exact(&mut name_bytes)
                .map_err(|e| truncated(path, "footer", e))?;
            let nul = name_bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(NAME_LEN);
            let name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();

            let mut words = [0u16; 6];
            rd.read_u16_into::<LittleEndian>(&mut words)
                .map_err(|e| truncated(path, "footer", e))?;
            // Redundant copy of the size.
            rd.read_u32::<LittleEndian>()
                .map_err(|e| truncated(path, "footer", e))?;

            entries.push(Entry {
                name,
                timestamp: Timestamp {
                    year: words[0],
                    month: words[1],
                    day: words[2],
                    hour: words[3],
                    minute: words[4],
                    second: words[5],
                },
                payload: RwLock::new(Payload::OnDisk { offset, size }),
            });
        }

        Ok(Self {
            load_path: Some(path.to_path_buf()),
            save_path: path.to_path_buf(),
            entries: Arc::new(entries),
        })
    }

    /// Builds an archive from in-memory entries; nothing is loaded lazily.
    pub fn from_entries(save_path: impl Into<PathBuf>, entries: Vec<Entry>) -> Self {
        Self {
            load_path: None,
            save_path: save_path.into(),
            entries: Arc::new(entries),
        }
    }

    /// A second view over the same entries that saves somewhere else.
    pub fn clone_with_new_path(&self, save_path: impl Into<PathBuf>) -> Self {
        Self {
            load_path: self.load_path.clone(),
            save_path: save_path.into(),
            entries: Arc::clone(&self.entries),
        }
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn find(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn load(&self, entry: &Entry) -> Result<Arc<Vec<u8>>> {
        entry.load_from(self.load_path.as_deref())
    }

    /// Serialises the archive. Offsets are recomputed from scratch in entry
    /// order; whatever was on disk before is ignored.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let count = self.entries.len() as u64;
        // Table plus the two footer-location words that sit just before the
        // aligned end of the header region.
        let header_end = align(8 + 8 * count + 8, ALIGNMENT) as usize;

        let mut out = vec![0u8; header_end];
        out[..3].copy_from_slice(MAGIC);
        LittleEndian::write_u32(&mut out[4..8], count as u32);

        let mut pos = header_end;
        for (i, entry) in self.entries.iter().enumerate() {
            let data = self.load(entry)?;
            let cell = 8 + i * 8;
            LittleEndian::write_u32(&mut out[cell..cell + 4], to_u32(pos)?);
            LittleEndian::write_u32(&mut out[cell + 4..cell + 8], to_u32(data.len())?);

            out.extend_from_slice(&data);
            pos = align(out.len() as u64, ALIGNMENT) as usize;
            out.resize(pos, 0);
        }

        let footer_len = FOOTER_RECORD_LEN * count as u32;
        LittleEndian::write_u32(&mut out[header_end - 8..header_end - 4], to_u32(pos)?);
        LittleEndian::write_u32(&mut out[header_end - 4..header_end], footer_len);

        for entry in self.entries.iter() {
            let mut name = [0u8; NAME_LEN];
            let bytes = entry.name.as_bytes();
            let n = bytes.len().min(NAME_LEN);
            name[..n].copy_from_slice(&bytes[..n]);
            out.extend_from_slice(&name);

            let ts = entry.timestamp;
            for word in [ts.year, ts.month, ts.day, ts.hour, ts.minute, ts.second] {
                out.write_u16::<LittleEndian>(word)?;
            }
            out.write_u32::<LittleEndian>(entry.size()?)?;
        }

        Ok(out)
    }

    pub fn save(&self) -> Result<()> {
        let bytes = self.to_bytes()?;
        fs::write(&self.save_path, bytes)?;
        info!("Saved to {}", self.save_path.display());
        Ok(())
    }
}

fn to_u32(v: usize) -> Result<u32> {
    u32::try_from(v).map_err(|_| ArchiveError::TooLarge)
}
