use std::io;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Days, NaiveDate, Weekday};
use nightly_core::{ArtifactSet, RunContext};
use nightly_protocol::RetentionDTO;
use thiserror::Error;
use tracing::{info, warn};

/// Weekday whose runs are eligible for the weekly window.
pub const ANCHOR_DAY: Weekday = Weekday::Sun;

/// Closed date interval `[start, end]`, optionally restricted to one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub weekday: Option<Weekday>,
}

impl RetentionWindow {
    fn ending_at(now: NaiveDate, days: u64, weekday: Option<Weekday>) -> Self {
        Self {
            start: now.checked_sub_days(Days::new(days)).unwrap_or(NaiveDate::MIN),
            end: now,
            weekday,
        }
    }

    pub fn daily(now: NaiveDate, keep_nights: u32) -> Self {
        Self::ending_at(now, u64::from(keep_nights), None)
    }

    pub fn weekly(now: NaiveDate, keep_weeks: u32) -> Self {
        Self::ending_at(now, u64::from(keep_weeks) * 7, Some(ANCHOR_DAY))
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date
            && date <= self.end
            && self.weekday.map_or(true, |w| date.weekday() == w)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Daily,
    Weekly,
    Expired,
}

impl Retention {
    pub fn is_kept(self) -> bool {
        !matches!(self, Retention::Expired)
    }
}

impl From<Retention> for RetentionDTO {
    fn from(r: Retention) -> Self {
        match r {
            Retention::Daily => RetentionDTO::Daily,
            Retention::Weekly => RetentionDTO::Weekly,
            Retention::Expired => RetentionDTO::Expired,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub kept: Vec<ArtifactSet>,
    pub deleted: Vec<ArtifactSet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub now: NaiveDate,
    pub keep_nights: u32,
    pub keep_weeks: u32,
}

impl RetentionPolicy {
    pub fn new(now: NaiveDate, keep_nights: u32, keep_weeks: u32) -> Self {
        Self {
            now,
            keep_nights,
            keep_weeks,
        }
    }

    pub fn from_context(ctx: &RunContext) -> Self {
        Self::new(ctx.now, ctx.keep_nights, ctx.keep_weeks)
    }

    pub fn daily_window(&self) -> RetentionWindow {
        RetentionWindow::daily(self.now, self.keep_nights)
    }

    pub fn weekly_window(&self) -> RetentionWindow {
        RetentionWindow::weekly(self.now, self.keep_weeks)
    }

    /// Daily wins when a date is in both windows.
    pub fn classify(&self, date: NaiveDate) -> Retention {
        if self.daily_window().contains(date) {
            Retention::Daily
        } else if self.weekly_window().contains(date) {
            Retention::Weekly
        } else {
            Retention::Expired
        }
    }

    pub fn partition(&self, sets: Vec<ArtifactSet>) -> Partition {
        let (kept, deleted): (Vec<_>, Vec<_>) = sets
            .into_iter()
            .partition(|s| self.classify(s.date).is_kept());
        Partition { kept, deleted }
    }

    /// Display groups for the history page. A Sunday inside the daily window
    /// shows up in both lists.
    pub fn display_groups(&self, kept: &[ArtifactSet]) -> (Vec<ArtifactSet>, Vec<ArtifactSet>) {
        let daily = self.daily_window();
        let weekly = self.weekly_window();
        let pick = |w: RetentionWindow| -> Vec<ArtifactSet> {
            kept.iter().filter(|s| w.contains(s.date)).cloned().collect()
        };
        (pick(daily), pick(weekly))
    }
}

pub fn partition(
    sets: Vec<ArtifactSet>,
    now: NaiveDate,
    keep_nights: u32,
    keep_weeks: u32,
) -> Partition {
    RetentionPolicy::new(now, keep_nights, keep_weeks).partition(sets)
}

#[derive(Debug, Error)]
#[error("failed to remove {} (run {date}): {source}", .path.display())]
pub struct DeletionError {
    pub date: NaiveDate,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Default)]
pub struct DeletionReport {
    pub removed: Vec<NaiveDate>,
    pub errors: Vec<DeletionError>,
}

impl DeletionReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

fn tolerate_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn remove(path: &Path, recursive: bool) -> io::Result<()> {
    if recursive {
        tolerate_missing(std::fs::remove_dir_all(path))
    } else {
        tolerate_missing(std::fs::remove_file(path))
    }
}

/// Removes every file of every set in `deleted`. Targets already gone count
/// as removed. A failure is recorded and the pass moves on, so one stuck
/// file never keeps other runs on disk; a set that fails half-way is left
/// with some kinds missing and shows up as such on the next discovery.
pub fn apply(deleted: &[ArtifactSet]) -> DeletionReport {
    let mut report = DeletionReport::default();

    for set in deleted {
        let targets = set
            .web_dir
            .iter()
            .map(|d| (d.as_path(), true))
            .chain(set.tarballs().map(|t| (t, false)));

        let mut failed = false;
        for (path, recursive) in targets {
            if let Err(source) = remove(path, recursive) {
                warn!(date = %set.date, path = %path.display(), error = %source, "failed to remove artifact");
                failed = true;
                report.errors.push(DeletionError {
                    date: set.date,
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        if !failed {
            info!(date = %set.date, "removed expired run");
            report.removed.push(set.date);
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discover;
    use crate::testutil::{run, touch};
    use nightly_core::parse_date;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn sets(dates: &[&str]) -> Vec<ArtifactSet> {
        dates.iter().map(|s| ArtifactSet::empty(d(s))).collect()
    }

    fn dates(sets: &[ArtifactSet]) -> Vec<String> {
        sets.iter().map(|s| s.date.to_string()).collect()
    }

    #[test]
    fn example_from_a_sunday() {
        let policy = RetentionPolicy::new(d("2024-03-10"), 4, 8);
        assert_eq!(d("2024-03-10").weekday(), Weekday::Sun);

        assert_eq!(policy.classify(d("2024-03-07")), Retention::Daily);
        assert_eq!(policy.classify(d("2024-03-06")), Retention::Daily);
        assert_eq!(policy.classify(d("2024-03-05")), Retention::Expired);
        assert_eq!(policy.classify(d("2024-02-04")), Retention::Weekly);
        assert_eq!(policy.classify(d("2024-01-14")), Retention::Weekly);
        assert_eq!(policy.classify(d("2024-01-07")), Retention::Expired);
        assert_eq!(policy.classify(d("2024-01-08")), Retention::Expired);
        assert_eq!(policy.classify(d("2024-03-10")), Retention::Daily);
        assert_eq!(policy.classify(d("2024-03-11")), Retention::Expired);

        let p = policy.partition(sets(&["2024-03-07", "2024-02-04", "2024-01-08"]));
        assert_eq!(dates(&p.kept), vec!["2024-03-07", "2024-02-04"]);
        assert_eq!(dates(&p.deleted), vec!["2024-01-08"]);
    }

    #[test]
    fn zero_horizons_keep_only_today() {
        let p = partition(sets(&["2024-03-10", "2024-03-09"]), d("2024-03-10"), 0, 0);
        assert_eq!(dates(&p.kept), vec!["2024-03-10"]);
    }

    #[test]
    fn windows_saturate_at_the_calendar_start() {
        let w = RetentionWindow::daily(NaiveDate::MIN, u32::MAX);
        assert_eq!(w.start, NaiveDate::MIN);
        assert!(w.contains(NaiveDate::MIN));
    }

    #[test]
    fn display_groups_split_daily_and_sundays() {
        let policy = RetentionPolicy::new(d("2024-03-10"), 4, 8);
        let kept = sets(&["2024-03-10", "2024-03-08", "2024-03-03", "2024-02-04"]);
        let (daily, weekly) = policy.display_groups(&kept);
        assert_eq!(dates(&daily), vec!["2024-03-10", "2024-03-08"]);
        assert_eq!(dates(&weekly), vec!["2024-03-10", "2024-03-03", "2024-02-04"]);
    }

    #[test]
    fn apply_removes_files_and_tolerates_missing_targets() {
        let td = TempDir::new().unwrap();
        run(td.path(), "2024-01-08", "old");
        run(td.path(), "2024-03-10", "new");
        touch(td.path(), "test_2024-01-09_gone.tar.gz");

        let all = discover(td.path()).unwrap();
        let p = partition(all, d("2024-03-10"), 4, 8);
        assert_eq!(dates(&p.deleted), vec!["2024-01-08", "2024-01-09"]);

        // Already removed by someone else; still counts as done.
        std::fs::remove_file(td.path().join("test_2024-01-09_gone.tar.gz")).unwrap();

        let report = apply(&p.deleted);
        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(report.removed.len(), 2);
        assert!(!td.path().join("www_2024-01-08_old").exists());
        assert!(!td.path().join("bench_2024-01-08_old.tar.gz").exists());
        assert!(td.path().join("www_2024-03-10_new").exists());
    }

    #[test]
    fn one_failing_set_does_not_stop_the_others() {
        let td = TempDir::new().unwrap();
        run(td.path(), "2024-01-01", "bad");
        run(td.path(), "2024-01-02", "good");

        let mut sets = discover(td.path()).unwrap();
        // A tarball path that is really a directory cannot be removed as a file.
        let bogus = td.path().join("not-a-file");
        std::fs::create_dir_all(&bogus).unwrap();
        sets[0].test_tarball = Some(bogus.clone());

        let report = apply(&sets);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].path, bogus);
        assert_eq!(report.removed, vec![d("2024-01-02")]);
        assert!(!td.path().join("test_2024-01-02_good.tar.gz").exists());
        // The rest of the failing set was still removed.
        assert!(!td.path().join("www_2024-01-01_bad").exists());
        assert!(td.path().join("test_2024-01-01_bad.tar.gz").exists());

        let after = discover(td.path()).unwrap();
        assert_eq!(after.len(), 1);
        assert!(!after[0].is_complete());
    }

    #[test]
    fn retention_is_idempotent_on_disk() {
        let td = TempDir::new().unwrap();
        for (i, date) in ["2024-01-07", "2024-02-04", "2024-02-05", "2024-03-08", "2024-03-10"]
            .iter()
            .enumerate()
        {
            run(td.path(), date, &format!("h{i}"));
        }
        let now = d("2024-03-10");

        let first = partition(discover(td.path()).unwrap(), now, 4, 6);
        assert_eq!(dates(&first.deleted), vec!["2024-01-07", "2024-02-05"]);
        assert!(apply(&first.deleted).is_clean());

        let second = partition(discover(td.path()).unwrap(), now, 4, 6);
        assert!(second.deleted.is_empty());
        assert_eq!(dates(&second.kept), dates(&first.kept));
    }

    #[test]
    fn consecutive_nights_are_all_kept() {
        let td = TempDir::new().unwrap();
        let now = d("2024-03-10");
        let n = 10u32;
        for i in 0..n {
            let date = now - Days::new(u64::from(i));
            run(td.path(), &date.to_string(), "abc");
        }
        let p = partition(discover(td.path()).unwrap(), now, n, 0);
        assert_eq!(p.kept.len(), n as usize);
        assert!(p.deleted.is_empty());
    }

    fn arb_date() -> impl Strategy<Value = NaiveDate> {
        (0u64..2_000).prop_map(|offset| d("2020-01-01") + Days::new(offset))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn kept_iff_daily_or_weekly_sunday(
            all in prop::collection::btree_set(arb_date(), 0..40),
            now in arb_date(),
            keep_nights in 0u32..30,
            keep_weeks in 0u32..20,
        ) {
            let input: Vec<ArtifactSet> = all.iter().map(|d| ArtifactSet::empty(*d)).collect();
            let p = partition(input, now, keep_nights, keep_weeks);
            prop_assert_eq!(p.kept.len() + p.deleted.len(), all.len());

            for set in &p.kept {
                let age = (now - set.date).num_days();
                let daily = (0..=i64::from(keep_nights)).contains(&age);
                let weekly = (0..=i64::from(keep_weeks) * 7).contains(&age)
                    && set.date.weekday() == Weekday::Sun;
                prop_assert!(daily || weekly, "kept {} outside both windows", set.date);
            }
            for set in &p.deleted {
                let age = (now - set.date).num_days();
                let daily = (0..=i64::from(keep_nights)).contains(&age);
                let weekly = (0..=i64::from(keep_weeks) * 7).contains(&age)
                    && set.date.weekday() == Weekday::Sun;
                prop_assert!(!daily && !weekly, "deleted {} inside a window", set.date);
            }
        }

        #[test]
        fn kept_set_is_a_fixed_point(
            all in prop::collection::btree_set(arb_date(), 0..40),
            now in arb_date(),
            keep_nights in 0u32..30,
            keep_weeks in 0u32..20,
        ) {
            let input: Vec<ArtifactSet> = all.iter().map(|d| ArtifactSet::empty(*d)).collect();
            let first = partition(input, now, keep_nights, keep_weeks);
            let again = partition(first.kept.clone(), now, keep_nights, keep_weeks);
            prop_assert!(again.deleted.is_empty());
            prop_assert_eq!(again.kept, first.kept);
        }
    }
}
