use std::collections::BTreeMap;

use chrono::NaiveDate;
use nightly_core::{ArtifactKind, ArtifactSet, ReportSummary};
use serde::{Deserialize, Serialize};

/// One line of the published history table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewRowDTO {
    pub date: NaiveDate,
    pub web_hash: String,
    pub test_hash: String,
    pub bench_hash: String,
    pub pass_count: Option<u64>,
    pub fail_count: Option<u64>,
    /// Extracted report directory, `/`-separated and relative to the data
    /// directory. Left empty by `build`; the publisher fills it from disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<String>,
}

impl ViewRowDTO {
    pub fn summary(&self) -> Option<ReportSummary> {
        match (self.pass_count, self.fail_count) {
            (Some(pass), Some(fail)) => Some(ReportSummary::new(pass, fail)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewModelDTO {
    pub daily: Vec<ViewRowDTO>,
    pub weekly: Vec<ViewRowDTO>,
}

fn row(set: &ArtifactSet, summaries: &BTreeMap<NaiveDate, ReportSummary>) -> ViewRowDTO {
    let summary = summaries.get(&set.date);
    ViewRowDTO {
        date: set.date,
        web_hash: set.hash(ArtifactKind::Web).to_string(),
        test_hash: set.hash(ArtifactKind::Test).to_string(),
        bench_hash: set.hash(ArtifactKind::Bench).to_string(),
        pass_count: summary.map(|s| s.bit_for_bit_pass),
        fail_count: summary.map(|s| s.bit_for_bit_fail),
        report_dir: None,
    }
}

fn rows(sets: &[ArtifactSet], summaries: &BTreeMap<NaiveDate, ReportSummary>) -> Vec<ViewRowDTO> {
    let mut out: Vec<ViewRowDTO> = sets.iter().map(|s| row(s, summaries)).collect();
    out.sort_by(|a, b| b.date.cmp(&a.date));
    out
}

/// Pure: sorts each group newest first and copies hashes verbatim, `MISSING`
/// included. Dates absent from `summaries` get no counts.
pub fn build(
    kept_daily: &[ArtifactSet],
    kept_weekly: &[ArtifactSet],
    summaries: &BTreeMap<NaiveDate, ReportSummary>,
) -> ViewModelDTO {
    ViewModelDTO {
        daily: rows(kept_daily, summaries),
        weekly: rows(kept_weekly, summaries),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionDTO {
    Daily,
    Weekly,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedRunDTO {
    pub date: NaiveDate,
    pub retention: RetentionDTO,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneReportDTO {
    pub ok: bool,
    pub dry_run: bool,
    pub now: NaiveDate,
    pub keep_nights: u32,
    pub keep_weeks: u32,
    pub runs: Vec<PlannedRunDTO>,
    pub deleted: Vec<NaiveDate>,
    pub errors: Vec<String>,
}
