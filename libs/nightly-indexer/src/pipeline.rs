use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use nightly_core::{
    ArtifactKind, ArtifactSet, ArtifactSlot, NightlyConfig, ParsedFilename, RunContext,
};
use nightly_protocol::{build, PlannedRunDTO, ViewModelDTO};
use nightly_report::{ReportAggregator, ReportFailure};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::retention::{self, DeletionReport, Partition, RetentionPolicy};
use crate::stages::archive::{move_dir, Archiver};
use crate::stages::git::{validate_cism, validate_livv};
use crate::stages::{PageRenderer, SourceSync, TestRunner, Verifier};

/// What retention decided for the data directory as discovered.
#[derive(Debug, Clone)]
pub struct RetentionPlan {
    pub policy: RetentionPolicy,
    pub partition: Partition,
}

impl RetentionPlan {
    /// Every discovered run with its retention class, oldest first.
    pub fn runs(&self) -> Vec<PlannedRunDTO> {
        let mut runs: Vec<PlannedRunDTO> = self
            .partition
            .kept
            .iter()
            .chain(&self.partition.deleted)
            .map(|set| PlannedRunDTO {
                date: set.date,
                retention: self.policy.classify(set.date).into(),
                missing: set.missing_slots().iter().map(|s| s.label().to_string()).collect(),
            })
            .collect();
        runs.sort_by_key(|r| r.date);
        runs
    }
}

#[derive(Debug)]
pub struct PublishOutcome {
    pub view: ViewModelDTO,
    pub deletion: DeletionReport,
    pub report_failures: Vec<ReportFailure>,
    pub page: PathBuf,
}

/// Writes `bytes` to a sibling temp file and renames it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("failed to write {}", tmp.path().display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync {}", tmp.path().display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Discover -> decide -> act over one data directory.
pub struct Pipeline {
    pub ctx: RunContext,
}

impl Pipeline {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy::from_context(&self.ctx)
    }

    /// Discovers the data directory and partitions it. Touches nothing.
    pub fn plan(&self) -> Result<RetentionPlan> {
        let sets = crate::discover(&self.ctx.data_dir)?;
        for set in &sets {
            let missing = set.missing_slots();
            if !missing.is_empty() {
                let labels: Vec<&str> = missing.iter().map(|s| s.label()).collect();
                warn!(date = %set.date, missing = ?labels, "incomplete artifact set");
            }
        }

        let policy = self.policy();
        let partition = policy.partition(sets);
        info!(
            now = %policy.now,
            kept = partition.kept.len(),
            expired = partition.deleted.len(),
            "retention decided"
        );
        Ok(RetentionPlan { policy, partition })
    }

    /// Plans and, unless `dry_run`, deletes every expired run.
    pub fn prune(&self, dry_run: bool) -> Result<(RetentionPlan, DeletionReport)> {
        let plan = self.plan()?;
        let deletion = if dry_run {
            DeletionReport::default()
        } else {
            retention::apply(&plan.partition.deleted)
        };
        Ok((plan, deletion))
    }

    /// Summarizes the kept runs and assembles the history view.
    pub fn view(&self, plan: &RetentionPlan) -> (ViewModelDTO, Vec<ReportFailure>) {
        let aggregation = ReportAggregator::new(&self.ctx).summarize_all(&plan.partition.kept);
        let (daily, weekly) = plan.policy.display_groups(&plan.partition.kept);
        let mut view = build(&daily, &weekly, &aggregation.summaries);

        let dirs: BTreeMap<NaiveDate, String> = plan
            .partition
            .kept
            .iter()
            .filter_map(|set| Some((set.date, self.relative_web_dir(set)?)))
            .collect();
        for row in view.daily.iter_mut().chain(view.weekly.iter_mut()) {
            row.report_dir = dirs.get(&row.date).cloned();
        }
        (view, aggregation.failures)
    }

    /// The set's extracted report directory as a page-relative link target.
    fn relative_web_dir(&self, set: &ArtifactSet) -> Option<String> {
        let dir = set.web_dir.as_deref()?;
        let rel = dir.strip_prefix(&self.ctx.data_dir).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        Some(parts.join("/"))
    }

    /// Prunes, then publishes `index.json` and `index.html` to the data
    /// directory. Deletion failures are carried in the outcome; any failure
    /// before the page is written leaves the previous page in place.
    pub fn publish(&self, renderer: &dyn PageRenderer) -> Result<PublishOutcome> {
        let (plan, deletion) = self.prune(false)?;
        let (view, report_failures) = self.view(&plan);

        let json = serde_json::to_vec_pretty(&view).context("failed to serialize view model")?;
        write_atomic(&self.ctx.view_path(), &json)?;

        let page = self.ctx.page_path();
        write_atomic(&page, renderer.render(&view).as_bytes())?;
        info!(
            page = %page.display(),
            daily = view.daily.len(),
            weekly = view.weekly.len(),
            "published"
        );

        Ok(PublishOutcome {
            view,
            deletion,
            report_failures,
            page,
        })
    }
}

/// Checkouts and directories the nightly job works from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sources {
    pub cism: PathBuf,
    pub cism_branch: String,
    pub livv: PathBuf,
    pub livv_branch: String,
    pub bench_dir: PathBuf,
    pub work_dir: PathBuf,
    pub test_options: Vec<String>,
}

impl Sources {
    pub fn from_config(cfg: &NightlyConfig) -> Self {
        Self {
            cism: cfg.cism.clone(),
            cism_branch: cfg.cism_branch.clone(),
            livv: cfg.livv.clone(),
            livv_branch: cfg.livv_branch.clone(),
            bench_dir: cfg.bench_dir.clone(),
            work_dir: cfg.work_dir.clone(),
            test_options: cfg.test_options.clone(),
        }
    }
}

/// The external programs a nightly run drives.
pub struct Collaborators<'a> {
    pub sync: &'a dyn SourceSync,
    pub tests: &'a dyn TestRunner,
    pub verifier: &'a dyn Verifier,
    pub renderer: &'a dyn PageRenderer,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub cism_hash: String,
    pub livv_hash: String,
    pub report: PathBuf,
    pub publish: PublishOutcome,
}

fn canonical_dir(path: &Path, create: bool) -> Result<PathBuf> {
    if create {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
    }
    std::fs::canonicalize(path).with_context(|| format!("failed to resolve {}", path.display()))
}

fn fresh_dir(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path)
            .with_context(|| format!("failed to clear {}", path.display()))?;
    }
    std::fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
}

/// One full nightly run: sync, test, verify, archive, publish. Each step
/// must succeed before the next starts.
pub struct NightlyJob<'a> {
    pub ctx: RunContext,
    pub sources: Sources,
    pub collaborators: Collaborators<'a>,
}

impl<'a> NightlyJob<'a> {
    pub fn new(ctx: RunContext, sources: Sources, collaborators: Collaborators<'a>) -> Self {
        Self {
            ctx,
            sources,
            collaborators,
        }
    }

    pub fn run(&self) -> Result<JobOutcome> {
        let s = &self.sources;
        let c = &self.collaborators;

        let cism = validate_cism(&s.cism)?;
        let livv = validate_livv(&s.livv)?;
        let cism_hash = c
            .sync
            .sync(&cism, &s.cism_branch)
            .context("failed to update CISM")?;
        let livv_hash = c
            .sync
            .sync(&livv, &s.livv_branch)
            .context("failed to update LIVVkit")?;

        // The harnesses run from their own checkouts, so every path they see
        // must be absolute.
        let ctx = RunContext {
            data_dir: canonical_dir(&self.ctx.data_dir, true)?,
            ..self.ctx.clone()
        };
        let work_dir = canonical_dir(&s.work_dir, true)?;
        let bench_dir = canonical_dir(&s.bench_dir, false)?;
        let date = ctx.now;

        let test = ParsedFilename::new(ArtifactKind::Test, date, cism_hash.as_str());
        let test_dir = work_dir.join(test.stem());
        fresh_dir(&test_dir)?;
        c.tests
            .run_tests(&work_dir.join("build"), &test_dir, &s.test_options)
            .context("regression tests failed")?;

        // The report is staged outside the data directory; an earlier run of
        // the same date stays published until this one has verified.
        let web = ParsedFilename::new(ArtifactKind::Web, date, livv_hash.as_str());
        let staged = work_dir.join(web.stem());
        fresh_dir(&staged)?;
        let staged_report = c
            .verifier
            .verify(&test_dir, &bench_dir, &staged)
            .context("verification failed")?;

        let archiver = Archiver::new(&ctx);
        archiver.clear_run(date)?;
        let web_dir = ctx.artifact_path(&web, ArtifactSlot::WebDir);
        move_dir(&staged, &web_dir)?;
        let report = match staged_report.strip_prefix(&staged) {
            Ok(rel) => web_dir.join(rel),
            Err(_) => staged_report.clone(),
        };

        let bench = ParsedFilename::new(ArtifactKind::Bench, date, cism_hash.as_str());
        archiver.archive(&test_dir, &test)?;
        archiver.archive(&bench_dir, &bench)?;
        archiver.archive(&web_dir, &web)?;

        let publish = Pipeline::new(ctx).publish(c.renderer)?;
        Ok(JobOutcome {
            cism_hash,
            livv_hash,
            report,
            publish,
        })
    }
}
