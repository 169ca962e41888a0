//! Phase two of extraction: write a validated plan into a staging tree and
//! swap it into place.

use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::Serialize;

use super::plan::{ArchiveFormat, ExtractionPlan, PlanEntry, for_each_tar_entry};
use crate::atomic::AtomicWriter;
use crate::config::ExtractLimits;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Replace a non-empty destination wholesale.
    pub overwrite: bool,
    /// Validate and report only.
    pub simulate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionResult {
    /// Relative file paths in archive order.
    pub files: Vec<String>,
    /// Relative directory paths listed by the archive.
    pub directories: Vec<String>,
    pub total_bytes: u64,
    pub simulated: bool,
}

impl ExtractionResult {
    fn from_plan(plan: &ExtractionPlan, simulated: bool) -> Self {
        Self {
            files: plan.files().map(|e| e.path.clone()).collect(),
            directories: plan.directories().map(|e| e.path.clone()).collect(),
            total_bytes: plan.total_bytes,
            simulated,
        }
    }
}

/// Validates archives completely before unpacking any of them.
#[derive(Debug, Clone, Default)]
pub struct Extractor {
    limits: ExtractLimits,
    writer: AtomicWriter,
}

impl Extractor {
    pub fn new(limits: ExtractLimits) -> Self {
        Self {
            limits,
            writer: AtomicWriter::new(),
        }
    }

    pub fn with_writer(mut self, writer: AtomicWriter) -> Self {
        self.writer = writer;
        self
    }

    pub fn limits(&self) -> &ExtractLimits {
        &self.limits
    }

    /// Unpack `blob` into `dest`.
    ///
    /// Fails with `CONFLICT_EXISTS` before reading the archive when `dest`
    /// has content and `overwrite` is off. Nothing under `dest` changes
    /// unless every entry validates and every write succeeds.
    pub fn extract(
        &self,
        blob: &[u8],
        dest: &Path,
        options: ExtractOptions,
    ) -> Result<ExtractionResult> {
        check_destination(dest, options.overwrite)?;

        let plan = ExtractionPlan::build(blob, &self.limits)?;
        let result = ExtractionResult::from_plan(&plan, options.simulate);
        if options.simulate {
            tracing::debug!(
                dest = %dest.display(),
                files = result.files.len(),
                "simulated extraction"
            );
            return Ok(result);
        }

        let swap = self
            .writer
            .swap_dir(dest, |staging| write_plan(blob, &plan, staging))?;
        let replaced = swap.backup().is_some();
        swap.commit();

        tracing::info!(
            dest = %dest.display(),
            format = ?plan.format,
            files = result.files.len(),
            bytes = result.total_bytes,
            replaced,
            "archive extracted"
        );
        Ok(result)
    }
}

fn check_destination(dest: &Path, overwrite: bool) -> Result<()> {
    match fs::metadata(dest) {
        Ok(meta) if !meta.is_dir() => Err(EngineError::InvalidDestination {
            path: dest.to_path_buf(),
            reason: "exists and is not a directory".to_string(),
        }),
        Ok(_) => {
            let mut listing = fs::read_dir(dest).map_err(|e| EngineError::io(dest, e))?;
            if listing.next().is_some() && !overwrite {
                return Err(EngineError::DestinationNotEmpty {
                    path: dest.to_path_buf(),
                });
            }
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(EngineError::io(dest, err)),
    }
}

fn write_plan(blob: &[u8], plan: &ExtractionPlan, staging: &Path) -> Result<()> {
    match plan.format {
        ArchiveFormat::Zip => write_zip(blob, plan, staging),
        ArchiveFormat::TarGz => write_tar_gz(blob, plan, staging),
    }
}

fn write_zip(blob: &[u8], plan: &ExtractionPlan, staging: &Path) -> Result<()> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(blob)).map_err(|e| EngineError::InvalidArchive {
            entry: None,
            reason: e.to_string(),
        })?;
    for entry in &plan.entries {
        if entry.is_dir {
            create_dir(staging, entry)?;
            continue;
        }
        let mut file = archive
            .by_index(entry.index)
            .map_err(|e| EngineError::InvalidArchive {
                entry: Some(entry.path.clone()),
                reason: e.to_string(),
            })?;
        write_file(staging, entry, &mut file)?;
    }
    Ok(())
}

fn write_tar_gz(blob: &[u8], plan: &ExtractionPlan, staging: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(blob));
    let mut pending = plan.entries.iter().peekable();
    for_each_tar_entry(&mut archive, |index, _, _, _, reader| {
        let Some(entry) = pending.next_if(|e| e.index == index) else {
            return Ok(());
        };
        if entry.is_dir {
            create_dir(staging, entry)
        } else {
            write_file(staging, entry, reader)
        }
    })?;
    if let Some(missing) = pending.next() {
        return Err(EngineError::InvalidArchive {
            entry: Some(missing.path.clone()),
            reason: "entry vanished between validation and extraction".to_string(),
        });
    }
    Ok(())
}

fn staged_path(staging: &Path, entry: &PlanEntry) -> PathBuf {
    entry
        .path
        .split('/')
        .fold(staging.to_path_buf(), |path, segment| path.join(segment))
}

fn create_dir(staging: &Path, entry: &PlanEntry) -> Result<()> {
    let path = staged_path(staging, entry);
    fs::create_dir_all(&path).map_err(|e| EngineError::io(&path, e))
}

/// Copy at most `declared + 1` bytes; any disagreement with the declared
/// size fails the extraction.
fn write_file(staging: &Path, entry: &PlanEntry, reader: &mut impl Read) -> Result<()> {
    let path = staged_path(staging, entry);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
    }
    let mut out = File::create(&path).map_err(|e| EngineError::io(&path, e))?;
    let copied = io::copy(&mut reader.take(entry.size.saturating_add(1)), &mut out).map_err(
        |e| EngineError::InvalidArchive {
            entry: Some(entry.path.clone()),
            reason: format!("cannot read entry data: {e}"),
        },
    )?;
    if copied != entry.size {
        let reason = if copied > entry.size {
            format!("entry holds more than its declared {} bytes", entry.size)
        } else {
            format!("entry declares {} bytes but holds {copied}", entry.size)
        };
        return Err(EngineError::InvalidArchive {
            entry: Some(entry.path.clone()),
            reason,
        });
    }
    if entry.executable {
        mark_executable(&path)?;
    }
    Ok(())
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|e| EngineError::io(path, e))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::FileOptions;

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, FileOptions::default()).unwrap();
            } else {
                writer.start_file(*name, FileOptions::default()).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    /// Builds tar headers by hand so hostile names survive.
    fn tar_gz_of(entries: &[(&str, tar::EntryType, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, kind, body) in entries {
            let mut header = tar::Header::new_gnu();
            let raw = name.as_bytes();
            header.as_old_mut().name[..raw.len()].copy_from_slice(raw);
            header.set_entry_type(*kind);
            header.set_mode(0o644);
            if *kind == tar::EntryType::Symlink {
                header.set_link_name("target.txt").unwrap();
                header.set_size(0);
            } else {
                header.set_size(body.len() as u64);
            }
            header.set_cksum();
            builder.append(&header, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn read(dir: &Path, rel: &str) -> String {
        fs::read_to_string(dir.join(rel)).unwrap()
    }

    fn is_empty_or_missing(dir: &Path) -> bool {
        !dir.exists() || fs::read_dir(dir).unwrap().next().is_none()
    }

    #[test]
    fn extracts_zip_in_archive_order() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("site1");
        let blob = zip_of(&[
            ("app/", ""),
            ("app/page.tsx", "export default function Page() {}"),
            ("app/blog/[...slug]/page.tsx", "catch-all"),
            ("package.json", "{}"),
        ]);

        let result = Extractor::default()
            .extract(&blob, &dest, ExtractOptions::default())
            .unwrap();

        assert_eq!(
            result.files,
            vec!["app/page.tsx", "app/blog/[...slug]/page.tsx", "package.json"]
        );
        assert_eq!(result.directories, vec!["app"]);
        assert_eq!(read(&dest, "app/blog/[...slug]/page.tsx"), "catch-all");
        assert!(!result.simulated);
    }

    #[test]
    fn traversal_entry_leaves_destination_empty() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("site1");
        fs::create_dir(&dest).unwrap();
        let blob = zip_of(&[("index.html", "ok"), ("../../etc/passwd", "root::0:0")]);

        let err = Extractor::default()
            .extract(&blob, &dest, ExtractOptions::default())
            .unwrap_err();

        assert_eq!(err.code().as_str(), "PATH_TRAVERSAL_BLOCKED");
        assert_eq!(err.details()["entry"], "../../etc/passwd");
        assert!(is_empty_or_missing(&dest));
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1, "no staging left behind");
    }

    #[test]
    fn tar_traversal_and_symlinks_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("site");

        let traversal = tar_gz_of(&[
            ("ok.txt", tar::EntryType::Regular, "fine"),
            ("../escape.txt", tar::EntryType::Regular, "bad"),
        ]);
        let err = Extractor::default()
            .extract(&traversal, &dest, ExtractOptions::default())
            .unwrap_err();
        assert_eq!(err.code().as_str(), "PATH_TRAVERSAL_BLOCKED");

        let symlink = tar_gz_of(&[("link", tar::EntryType::Symlink, "")]);
        let err = Extractor::default()
            .extract(&symlink, &dest, ExtractOptions::default())
            .unwrap_err();
        assert_eq!(err.code().as_str(), "UNSAFE_ENTRY_TYPE");

        assert!(is_empty_or_missing(&dest));
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[test]
    fn extracts_tar_gz() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("site");
        let blob = tar_gz_of(&[
            ("./", tar::EntryType::Directory, ""),
            ("src/", tar::EntryType::Directory, ""),
            ("src/index.css", tar::EntryType::Regular, ":root {}"),
        ]);

        let result = Extractor::default()
            .extract(&blob, &dest, ExtractOptions::default())
            .unwrap();

        assert_eq!(result.files, vec!["src/index.css"]);
        assert_eq!(read(&dest, "src/index.css"), ":root {}");
    }

    #[test]
    fn cumulative_size_ceiling_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("site");
        let limits = ExtractLimits {
            max_entries: 100,
            max_entry_bytes: 8,
            max_total_bytes: 12,
        };
        let blob = zip_of(&[("a.txt", "12345678"), ("b.txt", "12345678")]);

        let err = Extractor::new(limits)
            .extract(&blob, &dest, ExtractOptions::default())
            .unwrap_err();

        assert_eq!(err.code().as_str(), "ARCHIVE_TOO_LARGE");
        assert!(is_empty_or_missing(&dest));
    }

    #[test]
    fn entry_ceilings_are_enforced() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("site");
        let small = ExtractLimits {
            max_entries: 2,
            max_entry_bytes: 4,
            max_total_bytes: 1024,
        };

        let too_big = zip_of(&[("a.txt", "12345")]);
        let err = Extractor::new(small)
            .extract(&too_big, &dest, ExtractOptions::default())
            .unwrap_err();
        assert_eq!(err.code().as_str(), "ENTRY_TOO_LARGE");

        let too_many = zip_of(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let err = Extractor::new(small)
            .extract(&too_many, &dest, ExtractOptions::default())
            .unwrap_err();
        assert_eq!(err.code().as_str(), "TOO_MANY_ENTRIES");
    }

    #[test]
    fn non_empty_destination_requires_overwrite() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("site");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("keep.txt"), "mine").unwrap();

        let err = Extractor::default()
            .extract(b"garbage", &dest, ExtractOptions::default())
            .unwrap_err();

        assert_eq!(err.code().as_str(), "CONFLICT_EXISTS");
        assert_eq!(err.details()["reason"], "destination_not_empty");
        assert_eq!(read(&dest, "keep.txt"), "mine");
    }

    #[test]
    fn overwrite_replaces_the_tree_wholesale() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("site");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("stale.txt"), "old").unwrap();
        let blob = zip_of(&[("fresh.txt", "new")]);

        Extractor::default()
            .extract(
                &blob,
                &dest,
                ExtractOptions {
                    overwrite: true,
                    simulate: false,
                },
            )
            .unwrap();

        assert_eq!(read(&dest, "fresh.txt"), "new");
        assert!(!dest.join("stale.txt").exists());
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1, "backup removed");
    }

    #[test]
    fn simulate_reports_without_writing() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("site");
        let blob = zip_of(&[("a.txt", "abc"), ("b/c.txt", "de")]);

        let result = Extractor::default()
            .extract(
                &blob,
                &dest,
                ExtractOptions {
                    overwrite: false,
                    simulate: true,
                },
            )
            .unwrap();

        assert!(result.simulated);
        assert_eq!(result.files, vec!["a.txt", "b/c.txt"]);
        assert_eq!(result.total_bytes, 5);
        assert!(!dest.exists());
    }

    #[test]
    fn destination_that_is_a_file_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("site");
        fs::write(&dest, "i am a file").unwrap();

        let err = Extractor::default()
            .extract(&zip_of(&[("a", "b")]), &dest, ExtractOptions::default())
            .unwrap_err();

        assert_eq!(err.code().as_str(), "INVALID_DESTINATION");
    }
}
