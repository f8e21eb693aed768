use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use nightly_core::{ArtifactSet, ReportSummary, RunContext};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub const VERIFICATION_TITLE: &str = "Verification";
pub const BIT_FOR_BIT: &str = "Bit for Bit";

#[derive(Debug, Error)]
pub enum ReportParseError {
    #[error("run {date} has no extracted report directory")]
    NoReportDir { date: NaiveDate },
    #[error("failed to read report {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in report {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("report has no `Verification` element under Data.Elements")]
    MissingSection,
    #[error("unexpected report shape at {location}: {reason}")]
    Shape { location: String, reason: String },
    #[error("bit-for-bit totals overflow")]
    Overflow,
}

pub type Result<T> = std::result::Result<T, ReportParseError>;

/// One `"Bit for Bit": [pass, fail]` pair and where it was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leaf<'a> {
    pub test: &'a str,
    pub scale: &'a str,
    pub counts: ReportSummary,
}

fn shape(location: String, reason: &str) -> ReportParseError {
    ReportParseError::Shape {
        location,
        reason: reason.to_string(),
    }
}

/// The `Data` mapping of the first element titled `Verification`.
pub fn verification_section(report: &Value) -> Result<&Map<String, Value>> {
    let elements = report
        .get("Data")
        .and_then(|d| d.get("Elements"))
        .and_then(Value::as_array)
        .ok_or(ReportParseError::MissingSection)?;

    let section = elements
        .iter()
        .find(|e| e.get("Title").and_then(Value::as_str) == Some(VERIFICATION_TITLE))
        .ok_or(ReportParseError::MissingSection)?;

    section
        .get("Data")
        .and_then(Value::as_object)
        .ok_or_else(|| shape(format!("{VERIFICATION_TITLE}.Data"), "expected an object"))
}

/// Lazily walks test -> scale -> `Bit for Bit`, yielding every leaf once.
/// Scales without a bit-for-bit entry yield nothing.
pub fn bit_for_bit_leaves<'a>(
    section: &'a Map<String, Value>,
) -> impl Iterator<Item = Result<Leaf<'a>>> + 'a {
    section
        .iter()
        .flat_map(|(test, scales)| test_leaves(test, scales))
}

fn test_leaves<'a>(
    test: &'a str,
    scales: &'a Value,
) -> Box<dyn Iterator<Item = Result<Leaf<'a>>> + 'a> {
    match scales.as_object() {
        Some(scales) => Box::new(
            scales
                .iter()
                .filter_map(move |(scale, metrics)| leaf(test, scale, metrics)),
        ),
        None => Box::new(std::iter::once(Err(shape(
            test.to_string(),
            "test entry is not an object",
        )))),
    }
}

fn leaf<'a>(test: &'a str, scale: &'a str, metrics: &'a Value) -> Option<Result<Leaf<'a>>> {
    let location = || format!("{test}/{scale}");
    let Some(metrics) = metrics.as_object() else {
        return Some(Err(shape(location(), "scale entry is not an object")));
    };
    let pair = metrics.get(BIT_FOR_BIT)?;

    let counts = match pair.as_array().map(Vec::as_slice) {
        Some([pass, fail]) => match (pass.as_u64(), fail.as_u64()) {
            (Some(pass), Some(fail)) => ReportSummary::new(pass, fail),
            _ => {
                return Some(Err(shape(
                    location(),
                    "bit-for-bit counts must be non-negative integers",
                )))
            }
        },
        _ => {
            return Some(Err(shape(
                location(),
                "bit-for-bit entry must be a [pass, fail] pair",
            )))
        }
    };

    Some(Ok(Leaf {
        test,
        scale,
        counts,
    }))
}

/// Element-wise sum of every leaf; stops at the first malformed leaf.
pub fn reduce<'a, I>(leaves: I) -> Result<ReportSummary>
where
    I: IntoIterator<Item = Result<Leaf<'a>>>,
{
    leaves
        .into_iter()
        .try_fold(ReportSummary::default(), |acc, leaf| {
            acc.checked_add(leaf?.counts)
                .ok_or(ReportParseError::Overflow)
        })
}

pub fn summarize_value(report: &Value) -> Result<ReportSummary> {
    reduce(bit_for_bit_leaves(verification_section(report)?))
}

pub fn summarize(report_path: &Path) -> Result<ReportSummary> {
    let bytes = std::fs::read(report_path).map_err(|source| ReportParseError::Io {
        path: report_path.to_path_buf(),
        source,
    })?;
    let report: Value = serde_json::from_slice(&bytes).map_err(|source| ReportParseError::Json {
        path: report_path.to_path_buf(),
        source,
    })?;
    summarize_value(&report)
}

#[derive(Debug)]
pub struct ReportFailure {
    pub date: NaiveDate,
    pub error: ReportParseError,
}

#[derive(Debug, Default)]
pub struct Aggregation {
    pub summaries: BTreeMap<NaiveDate, ReportSummary>,
    pub failures: Vec<ReportFailure>,
}

/// Summarizes the report of each run; one bad report never hides the others.
pub struct ReportAggregator<'a> {
    ctx: &'a RunContext,
}

impl<'a> ReportAggregator<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    pub fn summarize_set(&self, set: &ArtifactSet) -> Result<ReportSummary> {
        let path = self
            .ctx
            .report_path(set)
            .ok_or(ReportParseError::NoReportDir { date: set.date })?;
        summarize(&path)
    }

    pub fn summarize_all<'s, I>(&self, sets: I) -> Aggregation
    where
        I: IntoIterator<Item = &'s ArtifactSet>,
    {
        let mut out = Aggregation::default();
        for set in sets {
            if out.summaries.contains_key(&set.date) {
                continue;
            }
            match self.summarize_set(set) {
                Ok(summary) => {
                    debug!(
                        date = %set.date,
                        pass = summary.bit_for_bit_pass,
                        fail = summary.bit_for_bit_fail,
                        "summarized report"
                    );
                    out.summaries.insert(set.date, summary);
                }
                Err(error) => {
                    warn!(date = %set.date, %error, "report summary unavailable");
                    out.failures.push(ReportFailure {
                        date: set.date,
                        error,
                    });
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightly_core::parse_date;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn report(tests: Value) -> Value {
        json!({ "Data": { "Elements": [
            { "Title": "Performance", "Data": { "ignored": { "s0": { "Bit for Bit": [100, 100] } } } },
            { "Title": "Verification", "Data": tests },
        ] } })
    }

    #[test]
    fn sums_two_tests() {
        let r = report(json!({
            "dome": { "0030": { "Bit for Bit": [5, 0] } },
            "ismip-hom-a": { "0080": { "Bit for Bit": [3, 1] } },
        }));
        assert_eq!(summarize_value(&r).unwrap(), ReportSummary::new(8, 1));
    }

    #[test]
    fn repeated_scale_names_are_distinct_leaves() {
        let r = report(json!({
            "dome": { "s1": { "Bit for Bit": [2, 1] }, "s2": { "Bit for Bit": [1, 0] } },
            "shelf": { "s1": { "Bit for Bit": [2, 1] } },
        }));
        let section = verification_section(&r).unwrap();
        let leaves: Vec<_> = bit_for_bit_leaves(section)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(leaves.len(), 3);
        assert_eq!(reduce(leaves.into_iter().map(Ok)).unwrap(), ReportSummary::new(5, 2));
    }

    #[test]
    fn scales_without_bit_for_bit_contribute_nothing() {
        let r = report(json!({
            "dome": { "s1": { "Configurations": [1, 0] }, "s2": { "Bit for Bit": [4, 0] } },
            "empty": {},
        }));
        assert_eq!(summarize_value(&r).unwrap(), ReportSummary::new(4, 0));
    }

    #[test]
    fn missing_section_is_an_error() {
        let r = json!({ "Data": { "Elements": [ { "Title": "Performance", "Data": {} } ] } });
        assert!(matches!(summarize_value(&r), Err(ReportParseError::MissingSection)));
        assert!(matches!(summarize_value(&json!({})), Err(ReportParseError::MissingSection)));
    }

    #[test]
    fn malformed_leaves_are_errors() {
        for bad in [json!([1]), json!([1, -1]), json!([1.5, 0]), json!("8/1"), json!([1, 2, 3])] {
            let r = report(json!({ "dome": { "s1": { "Bit for Bit": bad } } }));
            let err = summarize_value(&r).unwrap_err();
            assert!(
                matches!(&err, ReportParseError::Shape { location, .. } if location == "dome/s1"),
                "unexpected error: {err}"
            );
        }
        let r = report(json!({ "dome": [1, 2] }));
        assert!(matches!(summarize_value(&r), Err(ReportParseError::Shape { .. })));
    }

    #[test]
    fn overflow_is_reported_not_wrapped() {
        let r = report(json!({
            "a": { "s": { "Bit for Bit": [u64::MAX, 0] } },
            "b": { "s": { "Bit for Bit": [1, 0] } },
        }));
        assert!(matches!(summarize_value(&r), Err(ReportParseError::Overflow)));
    }

    #[test]
    fn summarize_reads_missing_and_invalid_files_as_errors() {
        let td = TempDir::new().unwrap();
        let missing = td.path().join("index.json");
        assert!(matches!(summarize(&missing), Err(ReportParseError::Io { .. })));

        std::fs::write(&missing, "not json").unwrap();
        assert!(matches!(summarize(&missing), Err(ReportParseError::Json { .. })));

        let r = report(json!({ "dome": { "s1": { "Bit for Bit": [7, 2] } } }));
        std::fs::write(&missing, serde_json::to_vec(&r).unwrap()).unwrap();
        assert_eq!(summarize(&missing).unwrap(), ReportSummary::new(7, 2));
    }

    #[test]
    fn aggregator_isolates_failures_per_date() {
        let td = TempDir::new().unwrap();
        let now = parse_date("2024-03-10").unwrap();
        let ctx = RunContext::new(td.path(), now, 7, 8);

        let good_dir = td.path().join("www_2024-03-10_aaa");
        std::fs::create_dir_all(&good_dir).unwrap();
        let r = report(json!({ "dome": { "s1": { "Bit for Bit": [5, 0] } } }));
        std::fs::write(good_dir.join("index.json"), serde_json::to_vec(&r).unwrap()).unwrap();

        let bad_dir = td.path().join("www_2024-03-09_bbb");
        std::fs::create_dir_all(&bad_dir).unwrap();
        std::fs::write(bad_dir.join("index.json"), "{").unwrap();

        let mut good = ArtifactSet::empty(now);
        good.web_dir = Some(good_dir);
        let mut bad = ArtifactSet::empty(parse_date("2024-03-09").unwrap());
        bad.web_dir = Some(bad_dir);
        let no_dir = ArtifactSet::empty(parse_date("2024-03-08").unwrap());

        let agg = ReportAggregator::new(&ctx).summarize_all([&good, &bad, &no_dir]);
        assert_eq!(agg.summaries.len(), 1);
        assert_eq!(agg.summaries[&now], ReportSummary::new(5, 0));
        assert_eq!(agg.failures.len(), 2);
        assert!(agg
            .failures
            .iter()
            .any(|f| matches!(f.error, ReportParseError::NoReportDir { .. })));
    }

    fn arb_tests() -> impl Strategy<Value = Vec<(String, Vec<(u32, u32)>)>> {
        prop::collection::vec(
            ("[a-z]{1,8}", prop::collection::vec((0u32..10_000, 0u32..10_000), 0..5)),
            0..12,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn totals_do_not_depend_on_entry_order(tests in arb_tests(), seed in any::<u64>()) {
            // Distinct keys so permuting entries cannot merge or drop leaves.
            let entries: Vec<(String, Value)> = tests
                .iter()
                .enumerate()
                .map(|(i, (name, scales))| {
                    let scales: Map<String, Value> = scales
                        .iter()
                        .enumerate()
                        .map(|(j, (p, f))| (format!("s{j}"), json!({ "Bit for Bit": [p, f] })))
                        .collect();
                    (format!("{name}-{i}"), Value::Object(scales))
                })
                .collect();

            let mut permuted = entries.clone();
            let len = permuted.len();
            if len > 1 {
                permuted.rotate_left((seed as usize) % len);
                permuted.reverse();
            }

            let a = report(Value::Object(entries.into_iter().collect()));
            let b = report(Value::Object(permuted.into_iter().collect()));

            let expected = tests.iter().flat_map(|(_, s)| s.iter()).fold((0u64, 0u64), |acc, (p, f)| {
                (acc.0 + u64::from(*p), acc.1 + u64::from(*f))
            });

            let sa = summarize_value(&a).unwrap();
            let sb = summarize_value(&b).unwrap();
            prop_assert_eq!(sa, sb);
            prop_assert_eq!(sa, ReportSummary::new(expected.0, expected.1));
        }
    }
}
