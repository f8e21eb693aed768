use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use nightly_core::{format_date, parse_date, today, NightlyConfig, RunContext};
use nightly_indexer::pipeline::{Collaborators, NightlyJob, Pipeline, Sources};
use nightly_indexer::retention::DeletionReport;
use nightly_indexer::stages::bats::BatsRunner;
use nightly_indexer::stages::git::GitSync;
use nightly_indexer::stages::livv::LivvVerifier;
use nightly_indexer::stages::render::HtmlRenderer;
use nightly_protocol::{PruneReportDTO, RetentionDTO};
use nightly_report::ReportFailure;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DELETION_FAILURE_EXIT: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "nightly",
    version,
    about = "Archive nightly regression runs, expire old ones and publish the history page"
)]
struct Cli {
    #[command(flatten)]
    core: CoreArgs,
    #[command(subcommand)]
    command: Command,
}

/// Overrides for `NightlyConfig`; anything left unset comes from `--config`
/// or the defaults.
#[derive(Args, Debug)]
struct CoreArgs {
    /// JSON config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the run artifacts and the published page.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Run date as YYYY-MM-DD (default: today, local time).
    #[arg(long, global = true, value_parser = parse_now)]
    now: Option<NaiveDate>,
    /// Days of nightly runs to keep.
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..))]
    keep_nights: Option<u32>,
    /// Weeks of Sunday runs to keep.
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..))]
    keep_weeks: Option<u32>,
    /// Report file name inside each extracted web directory.
    #[arg(long, global = true)]
    report_file: Option<String>,
    /// Log as JSON lines instead of plain text.
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync sources, run the regression suite, verify, archive and publish.
    Run(RunArgs),
    /// Expire old runs and regenerate the history page.
    Publish,
    /// Expire old runs without touching the page.
    Prune(PruneArgs),
    /// Print the bit-for-bit totals of one verification report.
    Summarize(SummarizeArgs),
    /// Print the history view model as JSON. Deletes nothing.
    View,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// CISM checkout.
    #[arg(long)]
    cism: Option<PathBuf>,
    #[arg(long)]
    cism_branch: Option<String>,
    /// LIVVkit checkout.
    #[arg(long)]
    livv: Option<PathBuf>,
    #[arg(long)]
    livv_branch: Option<String>,
    /// Benchmark data the test output is verified against.
    #[arg(long)]
    bench_dir: Option<PathBuf>,
    /// Scratch space for the build and test output.
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Extra option passed through to build_and_test.py (repeatable).
    #[arg(long = "test-option", allow_hyphen_values = true)]
    test_options: Vec<String>,
    /// Python interpreter for LIVVkit.
    #[arg(long, default_value = "python")]
    python: String,
}

#[derive(Args, Debug)]
struct PruneArgs {
    /// List what would be removed without removing it.
    #[arg(long)]
    dry_run: bool,
    /// Emit stable JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct SummarizeArgs {
    /// Path to a verification report JSON.
    report: PathBuf,
    /// Emit stable JSON output.
    #[arg(long)]
    json: bool,
}

fn parse_now(s: &str) -> Result<NaiveDate, String> {
    match parse_date(s) {
        Ok(d) if s.len() == 10 => Ok(d),
        _ => Err(format!("expected YYYY-MM-DD, got `{s}`")),
    }
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(core: &CoreArgs) -> Result<NightlyConfig> {
    let mut cfg = match &core.config {
        Some(path) => NightlyConfig::load(path)?,
        None => NightlyConfig::default(),
    };
    if let Some(v) = &core.data_dir {
        cfg.data_dir = v.clone();
    }
    if let Some(v) = core.keep_nights {
        cfg.keep_nights = v;
    }
    if let Some(v) = core.keep_weeks {
        cfg.keep_weeks = v;
    }
    if let Some(v) = &core.report_file {
        cfg.report_file = v.clone();
    }
    if cfg.keep_nights == 0 || cfg.keep_weeks == 0 {
        bail!(
            "keep_nights and keep_weeks must be positive (got {} and {})",
            cfg.keep_nights,
            cfg.keep_weeks
        );
    }
    Ok(cfg)
}

fn apply_run_args(cfg: &mut NightlyConfig, args: &RunArgs) {
    if let Some(v) = &args.cism {
        cfg.cism = v.clone();
    }
    if let Some(v) = &args.cism_branch {
        cfg.cism_branch = v.clone();
    }
    if let Some(v) = &args.livv {
        cfg.livv = v.clone();
    }
    if let Some(v) = &args.livv_branch {
        cfg.livv_branch = v.clone();
    }
    if let Some(v) = &args.bench_dir {
        cfg.bench_dir = v.clone();
    }
    if let Some(v) = &args.work_dir {
        cfg.work_dir = v.clone();
    }
    if !args.test_options.is_empty() {
        cfg.test_options = args.test_options.clone();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.core.log_json);
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("ERR: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut cfg = load_config(&cli.core)?;
    let now = cli.core.now.unwrap_or_else(today);
    debug!(?cfg, %now, "configuration");

    match cli.command {
        Command::Run(args) => {
            apply_run_args(&mut cfg, &args);
            handle_run(&cfg, cfg.run_context(now), &args.python)
        }
        Command::Publish => handle_publish(cfg.run_context(now)),
        Command::Prune(args) => handle_prune(cfg.run_context(now), &args),
        Command::Summarize(args) => handle_summarize(&args),
        Command::View => handle_view(cfg.run_context(now)),
    }
}

/// Prints one `ERR:` line per failed deletion and returns the exit code.
fn report_deletion(deletion: &DeletionReport, out: &mut impl Write) -> u8 {
    if deletion.is_clean() {
        return 0;
    }
    for err in &deletion.errors {
        let _ = writeln!(out, "ERR: {err}");
    }
    DELETION_FAILURE_EXIT
}

fn deletion_exit(deletion: &DeletionReport) -> ExitCode {
    ExitCode::from(report_deletion(deletion, &mut std::io::stderr()))
}

/// Reports that could not be summarized still get a row; say why.
fn warn_report_failures(failures: &[ReportFailure], out: &mut impl Write) {
    for failure in failures {
        let _ = writeln!(
            out,
            "WARN: {}: {}",
            format_date(failure.date),
            failure.error
        );
    }
}

fn handle_run(cfg: &NightlyConfig, ctx: RunContext, python: &str) -> Result<ExitCode> {
    let sources = Sources::from_config(cfg);
    let tests = BatsRunner::new(&sources.cism);
    let verifier = LivvVerifier::new(&sources.livv, cfg.report_file.clone()).with_python(python);
    let renderer = HtmlRenderer::default();
    let date = ctx.now;

    let job = NightlyJob::new(
        ctx,
        sources,
        Collaborators {
            sync: &GitSync,
            tests: &tests,
            verifier: &verifier,
            renderer: &renderer,
        },
    );
    let out = job.run()?;
    warn_report_failures(&out.publish.report_failures, &mut std::io::stderr());

    println!(
        "OK: nightly run {} cism={} livv={}",
        format_date(date),
        out.cism_hash,
        out.livv_hash
    );
    println!("page: {}", out.publish.page.display());
    Ok(deletion_exit(&out.publish.deletion))
}

fn handle_publish(ctx: RunContext) -> Result<ExitCode> {
    let out = Pipeline::new(ctx).publish(&HtmlRenderer::default())?;
    warn_report_failures(&out.report_failures, &mut std::io::stderr());
    println!(
        "OK: published {} ({} daily, {} weekly, {} removed)",
        out.page.display(),
        out.view.daily.len(),
        out.view.weekly.len(),
        out.deletion.removed.len()
    );
    Ok(deletion_exit(&out.deletion))
}

fn retention_label(r: RetentionDTO) -> &'static str {
    match r {
        RetentionDTO::Daily => "daily",
        RetentionDTO::Weekly => "weekly",
        RetentionDTO::Expired => "expired",
    }
}

fn handle_prune(ctx: RunContext, args: &PruneArgs) -> Result<ExitCode> {
    let pipeline = Pipeline::new(ctx);
    let (plan, deletion) = pipeline.prune(args.dry_run)?;
    let runs = plan.runs();

    if args.json {
        let output = PruneReportDTO {
            ok: deletion.is_clean(),
            dry_run: args.dry_run,
            now: pipeline.ctx.now,
            keep_nights: pipeline.ctx.keep_nights,
            keep_weeks: pipeline.ctx.keep_weeks,
            runs,
            deleted: deletion.removed.clone(),
            errors: deletion.errors.iter().map(|e| e.to_string()).collect(),
        };
        print_json(&output)?;
        return Ok(if deletion.is_clean() {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(DELETION_FAILURE_EXIT)
        });
    }

    for run in &runs {
        if run.missing.is_empty() {
            println!("{} {}", format_date(run.date), retention_label(run.retention));
        } else {
            println!(
                "{} {} missing: {}",
                format_date(run.date),
                retention_label(run.retention),
                run.missing.join(", ")
            );
        }
    }
    if args.dry_run {
        println!(
            "DRY RUN: would remove {} run(s)",
            plan.partition.deleted.len()
        );
    } else {
        println!("OK: removed {} run(s)", deletion.removed.len());
    }
    Ok(deletion_exit(&deletion))
}

fn handle_summarize(args: &SummarizeArgs) -> Result<ExitCode> {
    let summary = nightly_report::summarize(&args.report)?;
    if args.json {
        print_json(&summary)?;
    } else {
        println!(
            "bit_for_bit_pass={} bit_for_bit_fail={}",
            summary.bit_for_bit_pass, summary.bit_for_bit_fail
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_view(ctx: RunContext) -> Result<ExitCode> {
    let pipeline = Pipeline::new(ctx);
    let plan = pipeline.plan()?;
    let (view, failures) = pipeline.view(&plan);
    warn_report_failures(&failures, &mut std::io::stderr());
    print_json(&view)?;
    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize>(output: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(output).context("failed to serialize JSON output")?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightly_indexer::retention::DeletionError;
    use nightly_report::ReportParseError;
    use std::io;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn denied(date: &str, path: &str) -> DeletionError {
        DeletionError {
            date: d(date),
            path: PathBuf::from(path),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"),
        }
    }

    #[test]
    fn clean_deletion_exits_zero_silently() {
        let mut out = Vec::new();
        let deletion = DeletionReport {
            removed: vec![d("2024-01-08")],
            errors: vec![],
        };
        assert_eq!(report_deletion(&deletion, &mut out), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn each_deletion_failure_prints_one_err_line_and_exits_two() {
        let mut out = Vec::new();
        let deletion = DeletionReport {
            removed: vec![d("2024-01-14")],
            errors: vec![
                denied("2024-01-07", "/data/www_2024-01-07_a"),
                denied("2024-01-08", "/data/test_2024-01-08_b.tar.gz"),
            ],
        };
        assert_eq!(report_deletion(&deletion, &mut out), DELETION_FAILURE_EXIT);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.starts_with("ERR: ")), "{text}");
        assert!(lines[0].contains("www_2024-01-07_a"), "{text}");
        assert!(lines[1].contains("2024-01-08"), "{text}");
    }

    #[test]
    fn report_failures_are_warned_per_date() {
        let mut out = Vec::new();
        let failures = vec![ReportFailure {
            date: d("2024-03-07"),
            error: ReportParseError::MissingSection,
        }];
        warn_report_failures(&failures, &mut out);

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("WARN: 2024-03-07: "), "{text}");
    }
}
