use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Placeholder hash for an artifact kind that has no file on a given date.
pub const MISSING: &str = "MISSING";

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TARBALL_SUFFIX: &str = ".tar.gz";
pub const DEFAULT_REPORT_FILE: &str = "index.json";

pub fn parse_date(s: &str) -> std::result::Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Calendar day of the local clock; the run date when none is injected.
pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Web,
    Test,
    Bench,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [ArtifactKind::Web, ArtifactKind::Test, ArtifactKind::Bench];

    /// Leading filename token.
    pub fn prefix(self) -> &'static str {
        match self {
            ArtifactKind::Web => "www",
            ArtifactKind::Test => "test",
            ArtifactKind::Bench => "bench",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.prefix() == prefix)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Where a file sits inside an `ArtifactSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactSlot {
    WebDir,
    WebTarball,
    TestTarball,
    BenchTarball,
}

impl ArtifactSlot {
    pub fn kind(self) -> ArtifactKind {
        match self {
            ArtifactSlot::WebDir | ArtifactSlot::WebTarball => ArtifactKind::Web,
            ArtifactSlot::TestTarball => ArtifactKind::Test,
            ArtifactSlot::BenchTarball => ArtifactKind::Bench,
        }
    }

    pub fn tarball(kind: ArtifactKind) -> Self {
        match kind {
            ArtifactKind::Web => ArtifactSlot::WebTarball,
            ArtifactKind::Test => ArtifactSlot::TestTarball,
            ArtifactKind::Bench => ArtifactSlot::BenchTarball,
        }
    }

    pub fn is_dir(self) -> bool {
        matches!(self, ArtifactSlot::WebDir)
    }

    /// Classifies a directory entry name against the artifact name patterns
    /// (`test_*.tar.gz`, `bench_*.tar.gz`, `www_*.tar.gz`, `www_*/`).
    /// `None` means the entry is not an artifact at all.
    pub fn detect(file_name: &str, is_dir: bool) -> Option<Self> {
        if is_dir {
            return file_name
                .starts_with("www_")
                .then_some(ArtifactSlot::WebDir);
        }
        if !file_name.ends_with(TARBALL_SUFFIX) {
            return None;
        }
        ArtifactKind::ALL
            .into_iter()
            .find(|k| {
                file_name
                    .strip_prefix(k.prefix())
                    .is_some_and(|rest| rest.starts_with('_'))
            })
            .map(Self::tarball)
    }

    pub fn label(self) -> &'static str {
        match self {
            ArtifactSlot::WebDir => "www directory",
            ArtifactSlot::WebTarball => "www tarball",
            ArtifactSlot::TestTarball => "test tarball",
            ArtifactSlot::BenchTarball => "bench tarball",
        }
    }
}

impl fmt::Display for ArtifactSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilenameError {
    #[error("`{name}`: expected <kind>_<YYYY-MM-DD>_<hash>, found {fields} `_`-delimited field(s)")]
    FieldCount { name: String, fields: usize },
    #[error("`{name}`: `{prefix}` is not an artifact kind for a {slot}")]
    Kind {
        name: String,
        prefix: String,
        slot: ArtifactSlot,
    },
    #[error("`{name}`: invalid date `{date}` (expected YYYY-MM-DD)")]
    Date { name: String, date: String },
    #[error("`{name}`: empty hash")]
    EmptyHash { name: String },
}

/// An artifact name split on its `_` delimiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilename {
    pub kind: ArtifactKind,
    pub date: NaiveDate,
    pub hash: String,
}

impl ParsedFilename {
    pub fn new(kind: ArtifactKind, date: NaiveDate, hash: impl Into<String>) -> Self {
        Self {
            kind,
            date,
            hash: hash.into(),
        }
    }

    pub fn parse(file_name: &str, slot: ArtifactSlot) -> std::result::Result<Self, FilenameError> {
        let stem = if slot.is_dir() {
            file_name
        } else {
            file_name.strip_suffix(TARBALL_SUFFIX).unwrap_or(file_name)
        };

        let fields: Vec<&str> = stem.split('_').collect();
        let [prefix, date, hash] = fields.as_slice() else {
            return Err(FilenameError::FieldCount {
                name: file_name.to_string(),
                fields: fields.len(),
            });
        };

        let kind = ArtifactKind::from_prefix(prefix)
            .filter(|k| *k == slot.kind())
            .ok_or_else(|| FilenameError::Kind {
                name: file_name.to_string(),
                prefix: prefix.to_string(),
                slot,
            })?;

        // chrono accepts unpadded fields; the grammar does not.
        let date = match parse_date(date) {
            Ok(d) if date.len() == 10 => d,
            _ => {
                return Err(FilenameError::Date {
                    name: file_name.to_string(),
                    date: date.to_string(),
                })
            }
        };

        if hash.is_empty() {
            return Err(FilenameError::EmptyHash {
                name: file_name.to_string(),
            });
        }

        Ok(Self::new(kind, date, *hash))
    }

    /// `<kind>_<date>_<hash>`, without any suffix.
    pub fn stem(&self) -> String {
        format!("{}_{}_{}", self.kind.prefix(), format_date(self.date), self.hash)
    }

    pub fn tarball_name(&self) -> String {
        format!("{}{}", self.stem(), TARBALL_SUFFIX)
    }
}

/// Every artifact produced by one nightly run, keyed by its date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub date: NaiveDate,
    pub web_dir: Option<PathBuf>,
    pub web_tarball: Option<PathBuf>,
    pub test_tarball: Option<PathBuf>,
    pub bench_tarball: Option<PathBuf>,
    pub web_hash: String,
    pub test_hash: String,
    pub bench_hash: String,
}

impl ArtifactSet {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            web_dir: None,
            web_tarball: None,
            test_tarball: None,
            bench_tarball: None,
            web_hash: MISSING.to_string(),
            test_hash: MISSING.to_string(),
            bench_hash: MISSING.to_string(),
        }
    }

    pub fn hash(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::Web => &self.web_hash,
            ArtifactKind::Test => &self.test_hash,
            ArtifactKind::Bench => &self.bench_hash,
        }
    }

    pub fn hash_mut(&mut self, kind: ArtifactKind) -> &mut String {
        match kind {
            ArtifactKind::Web => &mut self.web_hash,
            ArtifactKind::Test => &mut self.test_hash,
            ArtifactKind::Bench => &mut self.bench_hash,
        }
    }

    pub fn path(&self, slot: ArtifactSlot) -> Option<&Path> {
        self.slot_ref(slot).as_deref()
    }

    pub fn slot_mut(&mut self, slot: ArtifactSlot) -> &mut Option<PathBuf> {
        match slot {
            ArtifactSlot::WebDir => &mut self.web_dir,
            ArtifactSlot::WebTarball => &mut self.web_tarball,
            ArtifactSlot::TestTarball => &mut self.test_tarball,
            ArtifactSlot::BenchTarball => &mut self.bench_tarball,
        }
    }

    fn slot_ref(&self, slot: ArtifactSlot) -> &Option<PathBuf> {
        match slot {
            ArtifactSlot::WebDir => &self.web_dir,
            ArtifactSlot::WebTarball => &self.web_tarball,
            ArtifactSlot::TestTarball => &self.test_tarball,
            ArtifactSlot::BenchTarball => &self.bench_tarball,
        }
    }

    /// Slots with no file on disk. A non-empty result on a set that still has
    /// other files usually means an interrupted deletion or archive step.
    pub fn missing_slots(&self) -> Vec<ArtifactSlot> {
        [
            ArtifactSlot::WebDir,
            ArtifactSlot::WebTarball,
            ArtifactSlot::TestTarball,
            ArtifactSlot::BenchTarball,
        ]
        .into_iter()
        .filter(|s| self.slot_ref(*s).is_none())
        .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_slots().is_empty()
    }

    /// Tarballs only; the extracted directory is reached through `web_dir`.
    pub fn tarballs(&self) -> impl Iterator<Item = &Path> {
        [&self.web_tarball, &self.test_tarball, &self.bench_tarball]
            .into_iter()
            .filter_map(|p| p.as_deref())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportSummary {
    pub bit_for_bit_pass: u64,
    pub bit_for_bit_fail: u64,
}

impl ReportSummary {
    pub fn new(bit_for_bit_pass: u64, bit_for_bit_fail: u64) -> Self {
        Self {
            bit_for_bit_pass,
            bit_for_bit_fail,
        }
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        Some(Self {
            bit_for_bit_pass: self.bit_for_bit_pass.checked_add(other.bit_for_bit_pass)?,
            bit_for_bit_fail: self.bit_for_bit_fail.checked_add(other.bit_for_bit_fail)?,
        })
    }
}

/// Everything one invocation needs to know about "now" and where its data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub data_dir: PathBuf,
    pub now: NaiveDate,
    pub keep_nights: u32,
    pub keep_weeks: u32,
    pub report_file: String,
}

impl RunContext {
    pub fn new(data_dir: impl Into<PathBuf>, now: NaiveDate, keep_nights: u32, keep_weeks: u32) -> Self {
        Self {
            data_dir: data_dir.into(),
            now,
            keep_nights,
            keep_weeks,
            report_file: DEFAULT_REPORT_FILE.to_string(),
        }
    }

    pub fn with_report_file(mut self, report_file: impl Into<String>) -> Self {
        self.report_file = report_file.into();
        self
    }

    /// Machine-readable report inside the set's extracted web directory.
    pub fn report_path(&self, set: &ArtifactSet) -> Option<PathBuf> {
        set.web_dir.as_ref().map(|d| d.join(&self.report_file))
    }

    pub fn page_path(&self) -> PathBuf {
        self.data_dir.join("index.html")
    }

    pub fn view_path(&self) -> PathBuf {
        self.data_dir.join("index.json")
    }

    pub fn artifact_path(&self, parsed: &ParsedFilename, slot: ArtifactSlot) -> PathBuf {
        if slot.is_dir() {
            self.data_dir.join(parsed.stem())
        } else {
            self.data_dir.join(parsed.tarball_name())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NightlyConfig {
    pub data_dir: PathBuf,
    pub keep_nights: u32,
    pub keep_weeks: u32,
    pub report_file: String,
    pub cism: PathBuf,
    pub cism_branch: String,
    pub livv: PathBuf,
    pub livv_branch: String,
    pub bench_dir: PathBuf,
    pub work_dir: PathBuf,
    pub test_options: Vec<String>,
}

impl Default for NightlyConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".into(),
            keep_nights: 7,
            keep_weeks: 8,
            report_file: DEFAULT_REPORT_FILE.into(),
            cism: "./cism".into(),
            cism_branch: "develop".into(),
            livv: "./livv".into(),
            livv_branch: "develop".into(),
            bench_dir: "./reg_bench".into(),
            work_dir: "./nightly-work".into(),
            test_options: Vec::new(),
        }
    }
}

impl NightlyConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = serde_json::from_slice(&bytes)
            .with_context(|| format!("invalid config JSON in {}", path.display()))?;
        Ok(config)
    }

    pub fn run_context(&self, now: NaiveDate) -> RunContext {
        RunContext::new(self.data_dir.clone(), now, self.keep_nights, self.keep_weeks)
            .with_report_file(self.report_file.clone())
    }
}
