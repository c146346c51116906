use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use compat_pak::pak::{PakDirectory, PakError};
use thiserror::Error;
use zip::read::ZipArchive;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive open failed ({path}): {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("archive {path} is malformed: {message}")]
    Format { path: PathBuf, message: String },
    #[error("entry {entry} of {path} failed to extract: {message}")]
    Extract {
        path: PathBuf,
        entry: usize,
        message: String,
    },
    #[error("no archive with id {0}")]
    UnknownArchive(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerFormat {
    /// `.zip` and `.pk3`.
    Zip,
    /// Quake `PACK`.
    Pak,
}

impl ContainerFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "zip" | "pk3" => Some(Self::Zip),
            "pak" => Some(Self::Pak),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveContainer {
    pub path: PathBuf,
    pub format: ContainerFormat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub index: usize,
    /// Forward-slash separated, as stored.
    pub name: String,
    pub size: u64,
}

/// Upper bound on what an entry's recorded size may reserve up front.
pub const RESERVE_CAP_BYTES: usize = 64 * 1024 * 1024;

/// Up-front reservation for a payload whose size comes from an archive
/// header. Larger payloads grow the buffer as they are read.
pub fn reserve_hint(size: u64) -> usize {
    usize::try_from(size).map_or(RESERVE_CAP_BYTES, |size| size.min(RESERVE_CAP_BYTES))
}

/// Where an extracted payload sits inside the caller's scratch buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extracted {
    pub offset: usize,
    pub len: usize,
}

impl Extracted {
    pub fn slice<'a>(&self, scratch: &'a [u8]) -> &'a [u8] {
        &scratch[self.offset..self.offset + self.len]
    }
}

/// Containers discovered by the last index rebuild, addressed by id.
///
/// Nothing is held open: every extraction opens its own file handle so any
/// number of workers can read concurrently.
#[derive(Debug, Default)]
pub struct ArchiveReader {
    containers: Vec<ArchiveContainer>,
}

impl ArchiveReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, container: ArchiveContainer) -> usize {
        self.containers.push(container);
        self.containers.len() - 1
    }

    pub fn get(&self, id: usize) -> Option<&ArchiveContainer> {
        self.containers.get(id)
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn containers(&self) -> &[ArchiveContainer] {
        &self.containers
    }

    /// Decompresses one entry into `scratch`, replacing its contents.
    pub fn extract(
        &self,
        archive: usize,
        entry: usize,
        scratch: &mut Vec<u8>,
    ) -> Result<Extracted, ArchiveError> {
        let container = self
            .containers
            .get(archive)
            .ok_or(ArchiveError::UnknownArchive(archive))?;
        extract_entry(container, entry, scratch)
    }
}

pub fn list_entries(container: &ArchiveContainer) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let path = &container.path;
    let mut file = File::open(path).map_err(|source| ArchiveError::Open {
        path: path.clone(),
        source,
    })?;
    match container.format {
        ContainerFormat::Zip => {
            let mut archive = ZipArchive::new(file).map_err(|err| ArchiveError::Format {
                path: path.clone(),
                message: err.to_string(),
            })?;
            let mut entries = Vec::with_capacity(archive.len());
            for index in 0..archive.len() {
                let entry = archive.by_index(index).map_err(|err| ArchiveError::Format {
                    path: path.clone(),
                    message: format!("entry {index}: {err}"),
                })?;
                if entry.is_dir() {
                    continue;
                }
                entries.push(ArchiveEntry {
                    index,
                    name: entry.name().replace('\\', "/"),
                    size: entry.size(),
                });
            }
            Ok(entries)
        }
        ContainerFormat::Pak => {
            let directory =
                PakDirectory::read_from(&mut file).map_err(|err| pak_format(path, err))?;
            Ok(directory
                .entries()
                .iter()
                .enumerate()
                .map(|(index, entry)| ArchiveEntry {
                    index,
                    name: entry.name.clone(),
                    size: u64::from(entry.size),
                })
                .collect())
        }
    }
}

fn extract_entry(
    container: &ArchiveContainer,
    entry: usize,
    scratch: &mut Vec<u8>,
) -> Result<Extracted, ArchiveError> {
    let path = &container.path;
    let extract_err = |message: String| ArchiveError::Extract {
        path: path.clone(),
        entry,
        message,
    };
    let mut file = File::open(path).map_err(|source| ArchiveError::Open {
        path: path.clone(),
        source,
    })?;
    scratch.clear();
    let len = match container.format {
        ContainerFormat::Zip => {
            let mut archive = ZipArchive::new(&mut file).map_err(|err| ArchiveError::Format {
                path: path.clone(),
                message: err.to_string(),
            })?;
            let mut zipped = archive
                .by_index(entry)
                .map_err(|err| extract_err(err.to_string()))?;
            scratch.reserve(reserve_hint(zipped.size()));
            zipped
                .read_to_end(scratch)
                .map_err(|err| extract_err(err.to_string()))?
        }
        ContainerFormat::Pak => {
            let directory =
                PakDirectory::read_from(&mut file).map_err(|err| pak_format(path, err))?;
            directory
                .read_entry(&mut file, entry, scratch)
                .map_err(|err| extract_err(err.to_string()))?
        }
    };
    Ok(Extracted { offset: 0, len })
}

fn pak_format(path: &Path, err: PakError) -> ArchiveError {
    ArchiveError::Format {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};

    pub(crate) fn temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "inject_{}_{}_{}",
            label,
            std::process::id(),
            nanos
        ));
        let _ = fs::create_dir_all(&dir);
        dir
    }

    pub(crate) fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, payload) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(payload).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn container_format_from_extension() {
        assert_eq!(
            ContainerFormat::from_path(Path::new("a/B.PK3")),
            Some(ContainerFormat::Zip)
        );
        assert_eq!(
            ContainerFormat::from_path(Path::new("pak0.pak")),
            Some(ContainerFormat::Pak)
        );
        assert_eq!(ContainerFormat::from_path(Path::new("notes.txt")), None);
    }

    #[test]
    fn zip_entries_extract_into_scratch() {
        let root = temp_dir("archive_zip");
        let path = root.join("pack.zip");
        write_zip(
            &path,
            &[
                ("textures/streaming/00002000.png", b"streamed payload".as_slice()),
                ("readme.txt", b"hi".as_slice()),
            ],
        );
        let container = ArchiveContainer {
            path,
            format: ContainerFormat::Zip,
        };
        let entries = list_entries(&container).expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "textures/streaming/00002000.png");

        let mut reader = ArchiveReader::new();
        let id = reader.push(container);
        let mut scratch = b"stale".to_vec();
        let extracted = reader.extract(id, 0, &mut scratch).expect("extract");
        assert_eq!(extracted.slice(&scratch), b"streamed payload");
    }

    #[test]
    fn pak_entries_extract_into_scratch() {
        let root = temp_dir("archive_pak");
        let path = root.join("pak0.pak");
        let data = compat_pak::pak::build_pak([
            ("textures/blocking/00001000.png", b"blocking".as_slice()),
        ]);
        fs::write(&path, data).unwrap();
        let mut reader = ArchiveReader::new();
        let id = reader.push(ArchiveContainer {
            path,
            format: ContainerFormat::Pak,
        });
        let mut scratch = Vec::new();
        let extracted = reader.extract(id, 0, &mut scratch).expect("extract");
        assert_eq!(extracted.len, 8);
        assert!(matches!(
            reader.extract(id, 3, &mut scratch),
            Err(ArchiveError::Extract { entry: 3, .. })
        ));
    }

    #[test]
    fn header_sizes_reserve_at_most_the_cap() {
        assert_eq!(reserve_hint(4096), 4096);
        assert_eq!(reserve_hint(u64::MAX), RESERVE_CAP_BYTES);
        assert_eq!(reserve_hint(RESERVE_CAP_BYTES as u64 + 1), RESERVE_CAP_BYTES);
    }

    #[test]
    fn unknown_archive_id_is_an_error() {
        let reader = ArchiveReader::new();
        let mut scratch = Vec::new();
        assert!(matches!(
            reader.extract(2, 0, &mut scratch),
            Err(ArchiveError::UnknownArchive(2))
        ));
    }

    #[test]
    fn missing_container_reports_open_error() {
        let container = ArchiveContainer {
            path: temp_dir("archive_missing").join("gone.zip"),
            format: ContainerFormat::Zip,
        };
        assert!(matches!(
            list_entries(&container),
            Err(ArchiveError::Open { .. })
        ));
    }
}
