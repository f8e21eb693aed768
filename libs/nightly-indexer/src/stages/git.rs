use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::info;

use super::{describe, run_output, run_status, Result, SourceSync, StageError};

fn invalid(path: &Path, reason: impl Into<String>) -> StageError {
    StageError::InvalidSource {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn existing_repo(path: &Path, name: &str) -> Result<PathBuf> {
    if !path.is_dir() {
        return Err(invalid(path, format!("{name} directory does not exist")));
    }
    if !path.join(".git").is_dir() {
        return Err(invalid(
            path,
            format!("{name} directory is not a git repository; cannot determine its commit hash"),
        ));
    }
    Ok(path.to_path_buf())
}

/// The CISM checkout must be a git repository with a `cism_driver` to build.
pub fn validate_cism(path: &Path) -> Result<PathBuf> {
    let path = existing_repo(path, "CISM")?;
    if !path.join("cism_driver").is_dir() {
        return Err(invalid(
            &path,
            "CISM directory does not contain a cism_driver subdirectory; cannot build CISM",
        ));
    }
    Ok(path)
}

/// The LIVVkit checkout must be a git repository holding `livv.py`.
pub fn validate_livv(path: &Path) -> Result<PathBuf> {
    let path = existing_repo(path, "LIVVkit")?;
    if !path.join("livv.py").is_file() {
        return Err(invalid(&path, "no livv.py script found in LIVVkit directory"));
    }
    Ok(path)
}

/// `git checkout <branch>`, `git pull --ff-only`, then the short HEAD hash.
#[derive(Debug, Clone, Default)]
pub struct GitSync;

fn git(repo: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(repo);
    cmd
}

impl SourceSync for GitSync {
    fn sync(&self, repo: &Path, branch: &str) -> Result<String> {
        run_status(git(repo).args(["checkout", branch]))?;
        run_status(git(repo).args(["pull", "--ff-only"]))?;

        let mut rev_parse = git(repo);
        rev_parse.args(["rev-parse", "--short", "HEAD"]);
        let output = run_output(&mut rev_parse)?;
        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if hash.is_empty() {
            return Err(StageError::EmptyHash {
                command: describe(&rev_parse),
            });
        }

        info!(repo = %repo.display(), branch, %hash, "source updated");
        Ok(hash)
    }
}
