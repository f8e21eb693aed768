use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use flate2::{write::GzEncoder, Compression};
use nightly_core::{ArtifactSlot, ParsedFilename, RunContext};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{Result, StageError};
use crate::crawl_artifacts;

/// Packs `src` into a gzip'd tarball at `dest`, rooted at `root_name`.
///
/// The archive is built in a temp file next to `dest` and persisted over it
/// once complete; on any error the temp file is removed, so discovery never
/// sees a truncated tarball.
pub fn write_tarball(src: &Path, dest: &Path, root_name: &str) -> Result<()> {
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(StageError::io("create temp file in", dir))?;

    let mut builder = tar::Builder::new(GzEncoder::new(tmp.as_file_mut(), Compression::default()));
    builder
        .append_dir_all(root_name, src)
        .map_err(StageError::io("archive", src))?;
    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .map_err(StageError::io("write", dest))?;
    tmp.as_file()
        .sync_all()
        .map_err(StageError::io("sync", dest))?;

    tmp.persist(dest)
        .map_err(|e| StageError::io("rename", dest)(e.error))?;
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| StageError::io("walk", src)(e.into()))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(StageError::io("create", &target))?;
        } else {
            fs::copy(entry.path(), &target).map_err(StageError::io("copy", entry.path()))?;
        }
    }
    Ok(())
}

/// Moves a directory into place, copying when a plain rename is not possible
/// (the work directory may sit on another filesystem).
pub fn move_dir(src: &Path, dest: &Path) -> Result<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    if let Err(err) = copy_tree(src, dest) {
        let _ = fs::remove_dir_all(dest);
        return Err(err);
    }
    fs::remove_dir_all(src).map_err(StageError::io("remove", src))?;
    debug!(from = %src.display(), to = %dest.display(), "copied across filesystems");
    Ok(())
}

/// Turns a night's output directories into named artifacts under the data directory.
pub struct Archiver<'a> {
    ctx: &'a RunContext,
}

impl<'a> Archiver<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    /// Removes every artifact already dated `date`, so a rerun on the same
    /// day replaces the earlier attempt instead of conflicting with it.
    /// Names that do not parse are left for discovery to report.
    pub fn clear_run(&self, date: NaiveDate) -> Result<usize> {
        let items = crawl_artifacts(&self.ctx.data_dir)?;

        let mut removed = 0;
        for item in items {
            let Ok(parsed) = ParsedFilename::parse(&item.file_name, item.slot) else {
                continue;
            };
            if parsed.date != date {
                continue;
            }
            let result = if item.slot.is_dir() {
                fs::remove_dir_all(&item.abs_path)
            } else {
                fs::remove_file(&item.abs_path)
            };
            result.map_err(StageError::io("remove", &item.abs_path))?;
            debug!(path = %item.rel_path, "cleared earlier artifact");
            removed += 1;
        }

        if removed > 0 {
            info!(%date, removed, "replacing earlier run of the same date");
        }
        Ok(removed)
    }

    /// Archives `src` as the tarball `parsed` names and returns its path.
    pub fn archive(&self, src: &Path, parsed: &ParsedFilename) -> Result<PathBuf> {
        let dest = self
            .ctx
            .artifact_path(parsed, ArtifactSlot::tarball(parsed.kind));
        write_tarball(src, &dest, &parsed.stem())?;
        info!(artifact = %dest.display(), "archived");
        Ok(dest)
    }
}
