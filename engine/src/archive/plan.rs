//! Phase one of extraction: read the whole directory table, validate every
//! entry and total the declared sizes, without touching the filesystem.

use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::sync::LazyLock;

use flate2::read::GzDecoder;
use regex::Regex;
use serde::Serialize;
use tar::EntryType;

use crate::config::ExtractLimits;
use crate::error::{EngineError, Result};

#[allow(clippy::expect_used)] // literal pattern
static CATCH_ALL_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\[\.\.\.[A-Za-z_][A-Za-z0-9_-]*\]|\[\[\.\.\.[A-Za-z_][A-Za-z0-9_-]*\]\])$")
        .expect("valid catch-all regex")
});

/// Container formats the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Identify the format from magic bytes.
    pub fn sniff(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [b'P', b'K', 3, 4, ..] | [b'P', b'K', 5, 6, ..] | [b'P', b'K', 7, 8, ..] => {
                Ok(ArchiveFormat::Zip)
            }
            [0x1f, 0x8b, ..] => Ok(ArchiveFormat::TarGz),
            _ => Err(EngineError::InvalidArchive {
                entry: None,
                reason: "unrecognized archive format (expected zip or tar.gz)".to_string(),
            }),
        }
    }
}

/// One validated archive entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    /// `/`-separated, relative, free of traversal.
    pub path: String,
    /// Declared uncompressed size; zero for directories.
    pub size: u64,
    pub is_dir: bool,
    /// Executable bit recorded in the archive.
    #[serde(skip)]
    pub(crate) executable: bool,
    /// Position in the archive (zip index or tar entry ordinal).
    #[serde(skip)]
    pub(crate) index: usize,
}

/// Everything extraction would write, computed before writing anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionPlan {
    pub format: ArchiveFormat,
    pub entries: Vec<PlanEntry>,
    pub total_bytes: u64,
}

impl ExtractionPlan {
    /// Parse `bytes` and validate every entry against `limits`. The whole
    /// plan is rejected on the first violation.
    pub fn build(bytes: &[u8], limits: &ExtractLimits) -> Result<Self> {
        let format = ArchiveFormat::sniff(bytes)?;
        let mut builder = PlanBuilder::new(limits);
        match format {
            ArchiveFormat::Zip => scan_zip(bytes, &mut builder)?,
            ArchiveFormat::TarGz => scan_tar_gz(bytes, &mut builder)?,
        }
        Ok(ExtractionPlan {
            format,
            entries: builder.entries,
            total_bytes: builder.total,
        })
    }

    pub fn files(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(|e| !e.is_dir)
    }

    pub fn directories(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(|e| e.is_dir)
    }
}

/// Validate one raw entry name and return its normalized relative path.
///
/// `Ok(None)` means the entry names the archive root itself (`./`) and
/// carries nothing to write.
pub fn validate_entry_path(raw: &str) -> Result<Option<String>> {
    let name = raw.replace('\\', "/");
    if name.is_empty() || name.contains('\0') {
        return Err(EngineError::InvalidArchive {
            entry: Some(raw.to_string()),
            reason: "entry name is empty or contains NUL".to_string(),
        });
    }

    let bytes = name.as_bytes();
    let drive_prefix = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if name.starts_with('/') || drive_prefix {
        return Err(EngineError::AbsolutePath {
            entry: raw.to_string(),
        });
    }

    let mut segments = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(EngineError::PathTraversal {
                    entry: raw.to_string(),
                });
            }
            s if s.contains("..") && !CATCH_ALL_SEGMENT.is_match(s) => {
                return Err(EngineError::PathTraversal {
                    entry: raw.to_string(),
                });
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Ok(None);
    }
    Ok(Some(segments.join("/")))
}

pub(crate) enum EntryKind {
    File { executable: bool },
    Dir,
    Unsafe(&'static str),
}

struct PlanBuilder<'a> {
    limits: &'a ExtractLimits,
    entries: Vec<PlanEntry>,
    total: u64,
    seen_files: HashSet<String>,
    seen_dirs: HashSet<String>,
    scanned: usize,
}

impl<'a> PlanBuilder<'a> {
    fn new(limits: &'a ExtractLimits) -> Self {
        Self {
            limits,
            entries: Vec::new(),
            total: 0,
            seen_files: HashSet::new(),
            seen_dirs: HashSet::new(),
            scanned: 0,
        }
    }

    fn push(&mut self, index: usize, raw: &str, size: u64, kind: EntryKind) -> Result<()> {
        self.scanned += 1;
        if self.scanned > self.limits.max_entries {
            return Err(EngineError::TooManyEntries {
                count: self.scanned,
                limit: self.limits.max_entries,
            });
        }

        let Some(path) = validate_entry_path(raw)? else {
            return Ok(());
        };

        let executable = match kind {
            EntryKind::Unsafe(kind) => {
                return Err(EngineError::UnsafeEntryType {
                    entry: raw.to_string(),
                    kind: kind.to_string(),
                });
            }
            EntryKind::Dir => {
                if self.seen_dirs.insert(path.clone()) {
                    self.entries.push(PlanEntry {
                        path,
                        size: 0,
                        is_dir: true,
                        executable: false,
                        index,
                    });
                }
                return Ok(());
            }
            EntryKind::File { executable } => executable,
        };

        if size > self.limits.max_entry_bytes {
            return Err(EngineError::EntryTooLarge {
                entry: raw.to_string(),
                size,
                limit: self.limits.max_entry_bytes,
            });
        }
        self.total = self.total.saturating_add(size);
        if self.total > self.limits.max_total_bytes {
            return Err(EngineError::ArchiveTooLarge {
                entry: raw.to_string(),
                total: self.total,
                limit: self.limits.max_total_bytes,
            });
        }
        if !self.seen_files.insert(path.clone()) {
            return Err(EngineError::InvalidArchive {
                entry: Some(raw.to_string()),
                reason: "entry appears more than once".to_string(),
            });
        }

        self.entries.push(PlanEntry {
            path,
            size,
            is_dir: false,
            executable,
            index,
        });
        Ok(())
    }
}

fn invalid(reason: impl std::fmt::Display) -> EngineError {
    EngineError::InvalidArchive {
        entry: None,
        reason: reason.to_string(),
    }
}

fn scan_zip(bytes: &[u8], builder: &mut PlanBuilder<'_>) -> Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(invalid)?;

    // The central directory already says how many entries there are.
    if archive.len() > builder.limits.max_entries {
        return Err(EngineError::TooManyEntries {
            count: archive.len(),
            limit: builder.limits.max_entries,
        });
    }

    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index).map_err(invalid)?;
        let name = entry.name().to_string();
        let mode = entry.unix_mode().unwrap_or(0);
        let kind = match mode & 0o170000 {
            0o120000 => EntryKind::Unsafe("symlink"),
            0o020000 | 0o060000 => EntryKind::Unsafe("device"),
            0o010000 => EntryKind::Unsafe("fifo"),
            _ if entry.is_dir() => EntryKind::Dir,
            _ => EntryKind::File {
                executable: mode & 0o111 != 0,
            },
        };
        let size = entry.size();
        drop(entry);
        builder.push(index, &name, size, kind)?;
    }
    Ok(())
}

fn scan_tar_gz(bytes: &[u8], builder: &mut PlanBuilder<'_>) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    for_each_tar_entry(&mut archive, |index, name, size, kind, _| {
        builder.push(index, name, size, kind)
    })
}

/// Walk tar entries, classifying each one. Metadata-only entries (PAX and
/// GNU extension headers) are skipped without consuming an ordinal.
pub(crate) fn for_each_tar_entry<R, F>(archive: &mut tar::Archive<R>, mut visit: F) -> Result<()>
where
    R: Read,
    F: FnMut(usize, &str, u64, EntryKind, &mut tar::Entry<'_, R>) -> Result<()>,
{
    let entries = archive.entries().map_err(invalid)?;
    let mut index = 0;
    for entry in entries {
        let mut entry = entry.map_err(invalid)?;
        let header = entry.header();
        let entry_type = header.entry_type();
        let kind = match entry_type {
            EntryType::Regular | EntryType::Continuous => EntryKind::File {
                executable: header.mode().unwrap_or(0) & 0o111 != 0,
            },
            EntryType::Directory => EntryKind::Dir,
            EntryType::Symlink => EntryKind::Unsafe("symlink"),
            EntryType::Link => EntryKind::Unsafe("hard link"),
            EntryType::Char | EntryType::Block => EntryKind::Unsafe("device"),
            EntryType::Fifo => EntryKind::Unsafe("fifo"),
            EntryType::XGlobalHeader
            | EntryType::XHeader
            | EntryType::GNULongName
            | EntryType::GNULongLink => continue,
            _ => EntryKind::Unsafe("special"),
        };

        let raw = entry.path_bytes();
        let name = std::str::from_utf8(&raw)
            .map_err(|_| EngineError::InvalidArchive {
                entry: Some(String::from_utf8_lossy(&raw).into_owned()),
                reason: "entry name is not valid UTF-8".to_string(),
            })?
            .to_string();
        drop(raw);
        let size = entry.size();

        visit(index, &name, size, kind, &mut entry)?;
        index += 1;
    }
    Ok(())
}
