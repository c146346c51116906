//! Fingerprint -> replacement source map, rebuilt from the inject directory.
//!
//! Scan order decides precedence, first hit wins:
//! `inject/textures/blocking`, `inject/textures/streaming`, `inject/textures`,
//! then every archive directly under `inject/` in name order.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::archive::{list_entries, ArchiveContainer, ArchiveReader, ContainerFormat};
use crate::fingerprint::Fingerprint;
use crate::observability::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};

const LOG_TARGET: &str = "inject::index";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadMethod {
    Streaming,
    Blocking,
    Unspecified,
}

impl LoadMethod {
    /// Archive entries carry their method in their directory path.
    pub fn from_entry_path(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        if lower.contains("streaming") {
            LoadMethod::Streaming
        } else if lower.contains("blocking") {
            LoadMethod::Blocking
        } else {
            LoadMethod::Unspecified
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceLocation {
    Loose(PathBuf),
    Archive { archive: usize, entry: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceRecord {
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub location: SourceLocation,
    pub method: LoadMethod,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexSummary {
    pub records: usize,
    pub archives: usize,
    pub total_bytes: u64,
}

#[derive(Default)]
struct IndexState {
    records: HashMap<Fingerprint, SourceRecord>,
    archives: Arc<ArchiveReader>,
    total_bytes: u64,
}

pub struct FingerprintIndex {
    root: PathBuf,
    extension: String,
    state: RwLock<IndexState>,
    blacklist: Mutex<HashSet<Fingerprint>>,
}

impl FingerprintIndex {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
            state: RwLock::new(IndexState::default()),
            blacklist: Mutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn inject_dir(&self) -> PathBuf {
        self.root.join("inject")
    }

    /// Rescans the inject directory and swaps the new map in. Lookups keep
    /// seeing the previous map until the swap. Missing directories and
    /// unreadable archives are skipped.
    pub fn rebuild(&self) -> IndexSummary {
        let started = Instant::now();
        let blacklist = lock_unpoisoned(&self.blacklist).clone();
        let mut scan = Scan {
            extension: &self.extension,
            blacklist: &blacklist,
            records: HashMap::new(),
            archives: ArchiveReader::new(),
            total_bytes: 0,
        };

        let inject = self.inject_dir();
        let textures = inject.join("textures");
        scan.loose_dir(&textures.join("blocking"), LoadMethod::Blocking);
        scan.loose_dir(&textures.join("streaming"), LoadMethod::Streaming);
        scan.loose_dir(&textures, LoadMethod::Unspecified);
        for path in sorted_files(&inject) {
            if let Some(format) = ContainerFormat::from_path(&path) {
                scan.archive(ArchiveContainer { path, format });
            }
        }

        let summary = IndexSummary {
            records: scan.records.len(),
            archives: scan.archives.len(),
            total_bytes: scan.total_bytes,
        };
        {
            let mut state = write_unpoisoned(&self.state);
            state.records = scan.records;
            state.archives = Arc::new(scan.archives);
            state.total_bytes = scan.total_bytes;
        }
        log::info!(
            target: LOG_TARGET,
            "indexed {} replacements ({} MiB) across {} archives in {} ms",
            summary.records,
            summary.total_bytes / crate::MIB,
            summary.archives,
            started.elapsed().as_millis()
        );
        summary
    }

    pub fn lookup(&self, fingerprint: Fingerprint) -> Option<SourceRecord> {
        read_unpoisoned(&self.state).records.get(&fingerprint).cloned()
    }

    /// The record together with the archive set its ids refer to.
    pub fn lookup_source(
        &self,
        fingerprint: Fingerprint,
    ) -> Option<(SourceRecord, Arc<ArchiveReader>)> {
        let state = read_unpoisoned(&self.state);
        let record = state.records.get(&fingerprint)?.clone();
        Some((record, Arc::clone(&state.archives)))
    }

    pub fn contains(&self, fingerprint: Fingerprint) -> bool {
        read_unpoisoned(&self.state).records.contains_key(&fingerprint)
    }

    pub fn archives(&self) -> Arc<ArchiveReader> {
        Arc::clone(&read_unpoisoned(&self.state).archives)
    }

    pub fn len(&self) -> usize {
        read_unpoisoned(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> IndexSummary {
        let state = read_unpoisoned(&self.state);
        IndexSummary {
            records: state.records.len(),
            archives: state.archives.len(),
            total_bytes: state.total_bytes,
        }
    }

    /// Records sorted by fingerprint.
    pub fn records(&self) -> Vec<SourceRecord> {
        let mut records: Vec<SourceRecord> =
            read_unpoisoned(&self.state).records.values().cloned().collect();
        records.sort_by_key(|record| record.fingerprint);
        records
    }

    /// Drops the record and keeps it out of later rebuilds.
    pub fn forget(&self, fingerprint: Fingerprint) {
        lock_unpoisoned(&self.blacklist).insert(fingerprint);
        let mut state = write_unpoisoned(&self.state);
        if let Some(record) = state.records.remove(&fingerprint) {
            state.total_bytes = state.total_bytes.saturating_sub(record.size);
            log::warn!(
                target: LOG_TARGET,
                "replacement {} blacklisted after a failed load",
                fingerprint
            );
        }
    }

    pub fn is_blacklisted(&self, fingerprint: Fingerprint) -> bool {
        lock_unpoisoned(&self.blacklist).contains(&fingerprint)
    }
}

struct Scan<'a> {
    extension: &'a str,
    blacklist: &'a HashSet<Fingerprint>,
    records: HashMap<Fingerprint, SourceRecord>,
    archives: ArchiveReader,
    total_bytes: u64,
}

impl Scan<'_> {
    fn accept(&mut self, record: SourceRecord) -> bool {
        if self.blacklist.contains(&record.fingerprint)
            || self.records.contains_key(&record.fingerprint)
        {
            return false;
        }
        self.total_bytes += record.size;
        self.records.insert(record.fingerprint, record);
        true
    }

    fn loose_dir(&mut self, dir: &Path, method: LoadMethod) {
        for path in sorted_files(dir) {
            let Some(fingerprint) = Fingerprint::from_path(&path, self.extension) else {
                continue;
            };
            let size = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
            self.accept(SourceRecord {
                fingerprint,
                size,
                location: SourceLocation::Loose(path),
                method,
            });
        }
    }

    fn archive(&mut self, container: ArchiveContainer) {
        let entries = match list_entries(&container) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!(target: LOG_TARGET, "skipping archive: {}", err);
                return;
            }
        };
        let id = self.archives.len();
        let mut found = 0usize;
        for entry in entries {
            let file_name = entry.name.rsplit('/').next().unwrap_or(&entry.name);
            let Some(fingerprint) = Fingerprint::from_file_name(file_name, self.extension) else {
                continue;
            };
            let accepted = self.accept(SourceRecord {
                fingerprint,
                size: entry.size,
                location: SourceLocation::Archive {
                    archive: id,
                    entry: entry.index,
                },
                method: LoadMethod::from_entry_path(&entry.name),
            });
            if accepted {
                found += 1;
            }
        }
        if found > 0 {
            log::debug!(
                target: LOG_TARGET,
                "{} replacements in {}",
                found,
                container.path.display()
            );
            self.archives.push(container);
        }
    }
}

fn sorted_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = read_dir
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect();
    files.sort();
    files
}
