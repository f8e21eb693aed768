use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use nightly_core::{ArtifactKind, ArtifactSet, ArtifactSlot, FilenameError, ParsedFilename, MISSING};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

pub mod pipeline;
pub mod retention;
pub mod stages;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to scan data directory {}: {source}", .root.display())]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("malformed artifact name at {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: FilenameError,
    },
    #[error("conflicting {slot}s for {date}: {} and {}", .first.display(), .second.display())]
    Conflict {
        slot: ArtifactSlot,
        date: NaiveDate,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("{kind} artifacts for {date} disagree on hash: `{first}` vs `{second}` ({})", .path.display())]
    HashMismatch {
        kind: ArtifactKind,
        date: NaiveDate,
        first: String,
        second: String,
        path: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct CrawlItem {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub file_name: String,
    pub slot: ArtifactSlot,
}

/// Walks `root` in file-name order and returns every entry whose name matches
/// an artifact pattern. Extracted report directories are returned but not
/// descended into. Any I/O error aborts the crawl.
pub fn crawl_artifacts(root: &Path) -> Result<Vec<CrawlItem>, DiscoveryError> {
    let mut items: Vec<CrawlItem> = vec![];
    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|source| DiscoveryError::Walk {
            root: root.to_path_buf(),
            source,
        })?;
        if entry.depth() == 0 {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy().to_string();
        let is_dir = entry.file_type().is_dir();
        let Some(slot) = ArtifactSlot::detect(&file_name, is_dir) else {
            continue;
        };
        if slot.is_dir() {
            walker.skip_current_dir();
        }

        let abs = entry.path().to_path_buf();
        let rel = abs
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");

        items.push(CrawlItem {
            rel_path: rel,
            abs_path: abs,
            file_name,
            slot,
        });
    }

    Ok(items)
}

fn attach(
    set: &mut ArtifactSet,
    parsed: ParsedFilename,
    slot: ArtifactSlot,
    path: PathBuf,
) -> Result<(), DiscoveryError> {
    if let Some(first) = set.path(slot) {
        return Err(DiscoveryError::Conflict {
            slot,
            date: set.date,
            first: first.to_path_buf(),
            second: path,
        });
    }

    let hash = set.hash_mut(parsed.kind);
    if hash.as_str() != MISSING && *hash != parsed.hash {
        return Err(DiscoveryError::HashMismatch {
            kind: parsed.kind,
            date: parsed.date,
            first: hash.clone(),
            second: parsed.hash,
            path,
        });
    }
    *hash = parsed.hash;
    *set.slot_mut(slot) = Some(path);
    Ok(())
}

/// Groups every artifact under `data_dir` into one `ArtifactSet` per date.
///
/// A name that matches an artifact pattern but does not parse, or two
/// artifacts competing for the same slot on the same date, fail the whole
/// discovery: the data directory needs manual attention before anything is
/// deleted or published. Kinds absent for a date stay `MISSING`.
///
/// Sets come back in ascending date order.
pub fn discover(data_dir: &Path) -> Result<Vec<ArtifactSet>, DiscoveryError> {
    let mut by_date: BTreeMap<NaiveDate, ArtifactSet> = BTreeMap::new();

    for item in crawl_artifacts(data_dir)? {
        let parsed = ParsedFilename::parse(&item.file_name, item.slot).map_err(|source| {
            DiscoveryError::Malformed {
                path: item.abs_path.clone(),
                source,
            }
        })?;
        debug!(path = %item.rel_path, slot = %item.slot, date = %parsed.date, hash = %parsed.hash, "artifact");

        let set = by_date
            .entry(parsed.date)
            .or_insert_with(|| ArtifactSet::empty(parsed.date));
        attach(set, parsed, item.slot, item.abs_path)?;
    }

    info!(data_dir = %data_dir.display(), runs = by_date.len(), "discovered artifact sets");
    Ok(by_date.into_values().collect())
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::Path;

    pub fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"x").unwrap();
    }

    /// Writes all four artifacts of one run.
    pub fn run(dir: &Path, date: &str, hash: &str) {
        touch(dir, &format!("test_{date}_{hash}.tar.gz"));
        touch(dir, &format!("bench_{date}_{hash}.tar.gz"));
        touch(dir, &format!("www_{date}_{hash}.tar.gz"));
        let www = dir.join(format!("www_{date}_{hash}"));
        std::fs::create_dir_all(&www).unwrap();
        touch(&www, "index.html");
    }
}
