use std::path::{Path, PathBuf};
use std::process::Command;

use super::{run_status, Result, StageError, Verifier};

/// Runs `livv.py` in verification mode and hands back its JSON report.
#[derive(Debug, Clone)]
pub struct LivvVerifier {
    livv_dir: PathBuf,
    python: String,
    report_file: String,
}

impl LivvVerifier {
    pub fn new(livv_dir: &Path, report_file: impl Into<String>) -> Self {
        Self {
            livv_dir: livv_dir.to_path_buf(),
            python: "python".to_string(),
            report_file: report_file.into(),
        }
    }

    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    pub fn command(&self, test_dir: &Path, bench_dir: &Path, out_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.python);
        cmd.current_dir(&self.livv_dir)
            .arg("livv.py")
            .arg("-v")
            .arg(test_dir)
            .arg(bench_dir)
            .arg("-o")
            .arg(out_dir);
        cmd
    }
}

impl Verifier for LivvVerifier {
    fn verify(&self, test_dir: &Path, bench_dir: &Path, out_dir: &Path) -> Result<PathBuf> {
        run_status(&mut self.command(test_dir, bench_dir, out_dir))?;
        let report = out_dir.join(&self.report_file);
        if !report.is_file() {
            return Err(StageError::MissingReport { path: report });
        }
        Ok(report)
    }
}
