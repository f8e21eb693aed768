use std::path::{Path, PathBuf};
use std::process::Command;

use super::{run_status, Result, TestRunner};

/// Drives CISM's build-and-test harness from `tests/regression`.
#[derive(Debug, Clone)]
pub struct BatsRunner {
    regression_dir: PathBuf,
}

impl BatsRunner {
    pub fn new(cism: &Path) -> Self {
        Self {
            regression_dir: cism.join("tests").join("regression"),
        }
    }

    pub fn command(&self, build_dir: &Path, out_dir: &Path, options: &[String]) -> Command {
        let mut cmd = Command::new("./build_and_test.py");
        cmd.current_dir(&self.regression_dir)
            .arg("-b")
            .arg(build_dir)
            .arg("-o")
            .arg(out_dir)
            .args(options);
        cmd
    }
}

impl TestRunner for BatsRunner {
    fn run_tests(&self, build_dir: &Path, out_dir: &Path, options: &[String]) -> Result<()> {
        run_status(&mut self.command(build_dir, out_dir, options))
    }
}
