use std::fmt;
use std::path::Path;

/// CRC-32 of the raw, still-encoded source bytes. Two encodings of the same
/// image produce different fingerprints; that is intended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u32);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(crc32fast::hash(bytes))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Parses `<hex>.<extension>` (case-insensitive extension), the naming
    /// convention for replacement files.
    pub fn from_file_name(name: &str, extension: &str) -> Option<Self> {
        let (stem, ext) = name.rsplit_once('.')?;
        if !ext.eq_ignore_ascii_case(extension.trim_start_matches('.')) {
            return None;
        }
        Self::parse_hex(stem)
    }

    pub fn from_path(path: &Path, extension: &str) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        Self::from_file_name(name, extension)
    }

    pub fn parse_hex(text: &str) -> Option<Self> {
        let text = text.trim();
        let text = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        if text.is_empty() || text.len() > 8 {
            return None;
        }
        u32::from_str_radix(text, 16).ok().map(Self)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<u32> for Fingerprint {
    fn from(value: u32) -> Self {
        Self(value)
    }
}
