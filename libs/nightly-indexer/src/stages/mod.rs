use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Output};

use nightly_protocol::ViewModelDTO;
use thiserror::Error;
use tracing::info;

pub mod archive;
pub mod bats;
pub mod git;
pub mod livv;
pub mod render;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{}: {reason}", .path.display())]
    InvalidSource { path: PathBuf, reason: String },
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with {status}")]
    Failed { command: String, status: ExitStatus },
    #[error("`{command}` printed no commit hash")]
    EmptyHash { command: String },
    #[error("verifier finished without writing {}", .path.display())]
    MissingReport { path: PathBuf },
    #[error("{} {}: {source}", .action, .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Discovery(#[from] crate::DiscoveryError),
}

pub type Result<T> = std::result::Result<T, StageError>;

impl StageError {
    pub(crate) fn io(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| StageError::Io {
            action,
            path,
            source,
        }
    }
}

/// Brings a checkout up to date and names its HEAD.
pub trait SourceSync {
    fn sync(&self, repo: &Path, branch: &str) -> Result<String>;
}

/// Builds the model and runs the regression suite; fails on a non-zero exit.
pub trait TestRunner {
    fn run_tests(&self, build_dir: &Path, out_dir: &Path, options: &[String]) -> Result<()>;
}

/// Compares test output against benchmark data and returns the report path.
pub trait Verifier {
    fn verify(&self, test_dir: &Path, bench_dir: &Path, out_dir: &Path) -> Result<PathBuf>;
}

pub trait PageRenderer {
    fn render(&self, view: &ViewModelDTO) -> String;
}

pub(crate) fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().to_string()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().to_string()));
    parts.join(" ")
}

/// Runs with inherited stdio so long harness output streams to the job log.
pub(crate) fn run_status(cmd: &mut Command) -> Result<()> {
    let command = describe(cmd);
    info!(%command, "running");
    let status = cmd.status().map_err(|source| StageError::Spawn {
        command: command.clone(),
        source,
    })?;
    if !status.success() {
        return Err(StageError::Failed { command, status });
    }
    Ok(())
}

pub(crate) fn run_output(cmd: &mut Command) -> Result<Output> {
    let command = describe(cmd);
    let output = cmd.output().map_err(|source| StageError::Spawn {
        command: command.clone(),
        source,
    })?;
    if !output.status.success() {
        return Err(StageError::Failed {
            command,
            status: output.status,
        });
    }
    Ok(output)
}
