use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

const HEADER_LEN: usize = 12;
const RECORD_LEN: usize = 64;
const NAME_LEN: usize = 56;
const MAX_PAK_ENTRIES: usize = 100_000;

#[derive(Debug, Error)]
pub enum PakError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid pak header")]
    InvalidHeader,
    #[error("pak directory out of bounds")]
    DirectoryOutOfBounds,
    #[error("pak directory size is not a multiple of {RECORD_LEN}")]
    DirectorySizeNotMultiple,
    #[error("pak directory has too many entries: {entries}")]
    TooManyEntries { entries: usize },
    #[error("pak entry out of bounds: {name}")]
    EntryOutOfBounds { name: String },
    #[error("pak entry {index} does not exist ({count} entries)")]
    NoSuchEntry { index: usize, count: usize },
    #[error("pak entry name is not utf-8")]
    NameNotUtf8,
    #[error("pak entry path is unsafe: {0}")]
    UnsafePath(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PakEntry {
    pub name: String,
    pub offset: u32,
    pub size: u32,
}

/// Directory of a `PACK` container. Entry payloads stay on disk; callers
/// read them through their own handle with [`PakDirectory::read_entry`].
#[derive(Debug, Clone, Default)]
pub struct PakDirectory {
    entries: Vec<PakEntry>,
}

impl PakDirectory {
    pub fn entries(&self) -> &[PakEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> Option<&PakEntry> {
        self.entries.get(index)
    }

    pub fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self, PakError> {
        let stream_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut header = [0u8; HEADER_LEN];
        reader
            .read_exact(&mut header)
            .map_err(|_| PakError::InvalidHeader)?;
        if &header[0..4] != b"PACK" {
            return Err(PakError::InvalidHeader);
        }

        let dir_offset = u64::from(read_u32_le(&header[4..8]));
        let dir_size = read_u32_le(&header[8..12]) as usize;
        if !dir_size.is_multiple_of(RECORD_LEN) {
            return Err(PakError::DirectorySizeNotMultiple);
        }
        let dir_end = dir_offset
            .checked_add(dir_size as u64)
            .ok_or(PakError::DirectoryOutOfBounds)?;
        if dir_end > stream_len {
            return Err(PakError::DirectoryOutOfBounds);
        }

        let entry_count = dir_size / RECORD_LEN;
        if entry_count > MAX_PAK_ENTRIES {
            return Err(PakError::TooManyEntries {
                entries: entry_count,
            });
        }

        let mut directory = vec![0u8; dir_size];
        reader.seek(SeekFrom::Start(dir_offset))?;
        reader.read_exact(&mut directory)?;

        let mut entries = Vec::with_capacity(entry_count);
        for record in directory.chunks_exact(RECORD_LEN) {
            let name_bytes = &record[..NAME_LEN];
            let name_len = name_bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(name_bytes.len());
            let name = std::str::from_utf8(&name_bytes[..name_len])
                .map_err(|_| PakError::NameNotUtf8)?;
            let name = sanitize_name(name);

            let offset = read_u32_le(&record[56..60]);
            let size = read_u32_le(&record[60..64]);
            let end = u64::from(offset) + u64::from(size);
            if end > stream_len {
                return Err(PakError::EntryOutOfBounds { name });
            }
            entries.push(PakEntry { name, offset, size });
        }

        Ok(Self { entries })
    }

    /// Reads entry `index` into `out`, replacing its contents. Returns the
    /// number of bytes written.
    pub fn read_entry<R: Read + Seek>(
        &self,
        reader: &mut R,
        index: usize,
        out: &mut Vec<u8>,
    ) -> Result<usize, PakError> {
        let entry = self.entries.get(index).ok_or(PakError::NoSuchEntry {
            index,
            count: self.entries.len(),
        })?;
        out.clear();
        out.resize(entry.size as usize, 0);
        reader.seek(SeekFrom::Start(u64::from(entry.offset)))?;
        reader
            .read_exact(out)
            .map_err(|_| PakError::EntryOutOfBounds {
                name: entry.name.clone(),
            })?;
        Ok(out.len())
    }

    pub fn extract_all<R: Read + Seek>(
        &self,
        reader: &mut R,
        out_dir: &Path,
    ) -> Result<(), PakError> {
        fs::create_dir_all(out_dir)?;
        let mut buffer = Vec::new();
        for (index, entry) in self.entries.iter().enumerate() {
            let out_path = safe_join(out_dir, &entry.name)?;
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            self.read_entry(reader, index, &mut buffer)?;
            fs::write(&out_path, &buffer)?;
        }
        Ok(())
    }
}

pub fn open_pak(path: &Path) -> Result<(File, PakDirectory), PakError> {
    let mut file = File::open(path)?;
    let directory = PakDirectory::read_from(&mut file)?;
    Ok((file, directory))
}

/// Builds an in-memory `PACK` container. Names longer than 55 bytes are
/// truncated.
pub fn build_pak<'a>(files: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Vec<u8> {
    let mut data = vec![0u8; HEADER_LEN];
    let mut directory = Vec::new();
    for (name, payload) in files {
        let offset = data.len() as u32;
        data.extend_from_slice(payload);

        let mut record = [0u8; RECORD_LEN];
        let name = name.as_bytes();
        let name_len = name.len().min(NAME_LEN - 1);
        record[..name_len].copy_from_slice(&name[..name_len]);
        record[56..60].copy_from_slice(&offset.to_le_bytes());
        record[60..64].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        directory.extend_from_slice(&record);
    }
    let dir_offset = data.len() as u32;
    let dir_size = directory.len() as u32;
    data.extend_from_slice(&directory);
    data[0..4].copy_from_slice(b"PACK");
    data[4..8].copy_from_slice(&dir_offset.to_le_bytes());
    data[8..12].copy_from_slice(&dir_size.to_le_bytes());
    data
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn sanitize_name(name: &str) -> String {
    let trimmed = name.trim_matches(char::from(0));
    trimmed.replace('\\', "/")
}

fn safe_join(base: &Path, entry: &str) -> Result<PathBuf, PakError> {
    let rel = Path::new(entry);
    let mut safe = PathBuf::from(base);
    for component in rel.components() {
        match component {
            Component::Normal(part) => safe.push(part),
            Component::CurDir => {}
            _ => return Err(PakError::UnsafePath(entry.to_string())),
        }
    }

    if safe.file_name() == Some(OsStr::new("")) || safe == base {
        return Err(PakError::UnsafePath(entry.to_string()));
    }

    Ok(safe)
}
