//! Core domain model for the cohort leaderboard: platforms, rating columns,
//! participants, observations and the versioned scoring weights.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cpboard-core";

/// Allowed drift of the weight sum away from 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

/// The five external judges a participant may hold an account on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Codeforces,
    Geeksforgeeks,
    Leetcode,
    Codechef,
    Hackerrank,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Codeforces,
        Platform::Geeksforgeeks,
        Platform::Leetcode,
        Platform::Codechef,
        Platform::Hackerrank,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Codeforces => "codeforces",
            Platform::Geeksforgeeks => "geeksforgeeks",
            Platform::Leetcode => "leetcode",
            Platform::Codechef => "codechef",
            Platform::Hackerrank => "hackerrank",
        }
    }

    /// Column title used for the identifier cell in the published table.
    pub fn handle_header(self) -> &'static str {
        match self {
            Platform::Codeforces => "Codeforces_Handle",
            Platform::Geeksforgeeks => "Geeksforgeeks_Handle",
            Platform::Leetcode => "Leetcode_Handle",
            Platform::Codechef => "Codechef_Handle",
            Platform::Hackerrank => "Hackerrank_Handle",
        }
    }

    /// Rating columns fed by this platform, in table order.
    pub fn columns(self) -> &'static [RatingColumn] {
        match self {
            Platform::Codeforces => &[RatingColumn::Codeforces],
            Platform::Geeksforgeeks => &[RatingColumn::GfgContest, RatingColumn::GfgPractice],
            Platform::Leetcode => &[RatingColumn::Leetcode],
            Platform::Codechef => &[RatingColumn::Codechef],
            Platform::Hackerrank => &[RatingColumn::Hackerrank],
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rating column of the aggregated table. GeeksforGeeks feeds two of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingColumn {
    Codeforces,
    GfgContest,
    GfgPractice,
    Leetcode,
    Codechef,
    Hackerrank,
}

impl RatingColumn {
    pub const ALL: [RatingColumn; 6] = [
        RatingColumn::Codeforces,
        RatingColumn::GfgContest,
        RatingColumn::GfgPractice,
        RatingColumn::Leetcode,
        RatingColumn::Codechef,
        RatingColumn::Hackerrank,
    ];

    pub fn platform(self) -> Platform {
        match self {
            RatingColumn::Codeforces => Platform::Codeforces,
            RatingColumn::GfgContest | RatingColumn::GfgPractice => Platform::Geeksforgeeks,
            RatingColumn::Leetcode => Platform::Leetcode,
            RatingColumn::Codechef => Platform::Codechef,
            RatingColumn::Hackerrank => Platform::Hackerrank,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RatingColumn::Codeforces => "codeforces",
            RatingColumn::GfgContest => "gfg_contest",
            RatingColumn::GfgPractice => "gfg_practice",
            RatingColumn::Leetcode => "leetcode",
            RatingColumn::Codechef => "codechef",
            RatingColumn::Hackerrank => "hackerrank",
        }
    }

    pub fn rating_header(self) -> &'static str {
        match self {
            RatingColumn::Codeforces => "Codeforces_Rating",
            RatingColumn::GfgContest => "Geeksforgeeks_Rating",
            RatingColumn::GfgPractice => "Geeksforgeeks_Practice_Rating",
            RatingColumn::Leetcode => "Leetcode_Rating",
            RatingColumn::Codechef => "Codechef_Rating",
            RatingColumn::Hackerrank => "Hackerrank_Rating",
        }
    }
}

impl fmt::Display for RatingColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown rating column `{0}`")]
pub struct UnknownColumn(pub String);

impl FromStr for RatingColumn {
    type Err = UnknownColumn;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "codeforces" => Ok(RatingColumn::Codeforces),
            "gfg" | "gfg_contest" => Ok(RatingColumn::GfgContest),
            "gfg_practice" => Ok(RatingColumn::GfgPractice),
            "leetcode" => Ok(RatingColumn::Leetcode),
            "codechef" => Ok(RatingColumn::Codechef),
            "hackerrank" => Ok(RatingColumn::Hackerrank),
            other => Err(UnknownColumn(other.to_string())),
        }
    }
}

/// A participant's identifier on one platform plus the roster's existence flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformAccount {
    pub identifier: Option<String>,
    pub exists: bool,
}

impl PlatformAccount {
    pub fn new(identifier: Option<String>, exists: bool) -> Self {
        Self { identifier, exists }
    }

    /// The identifier to hand to an adapter. A present identifier with a false
    /// existence flag is never scraped.
    pub fn scrape_identifier(&self) -> Option<&str> {
        if !self.exists {
            return None;
        }
        self.identifier
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Cohort member keyed by `handle`, owning at most one account per platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub handle: String,
    pub accounts: BTreeMap<Platform, PlatformAccount>,
}

impl Participant {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            accounts: BTreeMap::new(),
        }
    }

    pub fn with_account(mut self, platform: Platform, identifier: Option<&str>, exists: bool) -> Self {
        self.accounts.insert(
            platform,
            PlatformAccount::new(identifier.map(ToString::to_string), exists),
        );
        self
    }

    pub fn account(&self, platform: Platform) -> Option<&PlatformAccount> {
        self.accounts.get(&platform)
    }

    pub fn identifier(&self, platform: Platform) -> Option<&str> {
        self.account(platform).and_then(|a| a.identifier.as_deref())
    }

    pub fn exists_on(&self, platform: Platform) -> bool {
        self.account(platform).map(|a| a.exists).unwrap_or(false)
    }

    pub fn scrape_target(&self, platform: Platform) -> Option<ScrapeTarget> {
        self.account(platform)
            .and_then(PlatformAccount::scrape_identifier)
            .map(|identifier| ScrapeTarget::new(&self.handle, identifier))
    }
}

/// Unit of work handed to a source adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScrapeTarget {
    pub handle: String,
    pub identifier: String,
}

impl ScrapeTarget {
    pub fn new(handle: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            identifier: identifier.into(),
        }
    }
}

/// A rating resolved by an adapter for one participant at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingObservation {
    pub handle: String,
    pub column: RatingColumn,
    pub identifier: String,
    pub rating: i64,
    pub observed_at: DateTime<Utc>,
}

impl RatingObservation {
    pub fn new(target: &ScrapeTarget, column: RatingColumn, rating: i64) -> Self {
        Self {
            handle: target.handle.clone(),
            column,
            identifier: target.identifier.clone(),
            rating,
            observed_at: Utc::now(),
        }
    }
}

/// One leaderboard row. Absent ratings were never observed; they only become
/// zero inside the percentile computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRecord {
    pub handle: String,
    /// Roster position, the stable tie-breaker for equal percentiles.
    pub position: i64,
    pub identifiers: BTreeMap<Platform, String>,
    pub ratings: BTreeMap<RatingColumn, i64>,
    pub percentile: Option<f64>,
}

impl AggregatedRecord {
    pub fn new(handle: impl Into<String>, position: i64) -> Self {
        Self {
            handle: handle.into(),
            position,
            identifiers: BTreeMap::new(),
            ratings: BTreeMap::new(),
            percentile: None,
        }
    }

    pub fn rating(&self, column: RatingColumn) -> Option<i64> {
        self.ratings.get(&column).copied()
    }

    pub fn identifier(&self, platform: Platform) -> Option<&str> {
        self.identifiers.get(&platform).map(String::as_str)
    }
}

/// How columns nobody in the cohort has a rating on are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingColumnPolicy {
    /// Divide by the weight of the columns that have a positive maximum.
    #[default]
    Renormalize,
    /// Keep the configured weights; empty columns contribute zero.
    Fixed,
}

#[derive(Debug, Error, PartialEq)]
pub enum WeightsError {
    #[error("no weight configured for column {0}")]
    MissingColumn(RatingColumn),
    #[error("weight for {column} must be a finite non-negative number, got {weight}")]
    Invalid { column: RatingColumn, weight: f64 },
    #[error("weights must sum to 1.0, got {0}")]
    BadSum(f64),
}

/// Versioned composite-score weights, one per rating column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub version: u32,
    #[serde(default)]
    pub missing_column_policy: MissingColumnPolicy,
    pub weights: BTreeMap<RatingColumn, f64>,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        let weights = BTreeMap::from([
            (RatingColumn::Codeforces, 0.30),
            (RatingColumn::GfgContest, 0.30),
            (RatingColumn::GfgPractice, 0.10),
            (RatingColumn::Leetcode, 0.10),
            (RatingColumn::Codechef, 0.10),
            (RatingColumn::Hackerrank, 0.10),
        ]);
        Self {
            version: 1,
            missing_column_policy: MissingColumnPolicy::Renormalize,
            weights,
        }
    }
}

impl ScoringWeights {
    pub fn weight(&self, column: RatingColumn) -> f64 {
        self.weights.get(&column).copied().unwrap_or(0.0)
    }

    pub fn validate(&self) -> Result<(), WeightsError> {
        let mut sum = 0.0;
        for column in RatingColumn::ALL {
            let Some(&weight) = self.weights.get(&column) else {
                return Err(WeightsError::MissingColumn(column));
            };
            if !weight.is_finite() || weight < 0.0 {
                return Err(WeightsError::Invalid { column, weight });
            }
            sum += weight;
        }
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(WeightsError::BadSum(sum));
        }
        Ok(())
    }
}

/// Round to two decimals, halves away from zero.
pub fn round_half_up_2(value: f64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    // micro-units absorb binary noise (1.005 is stored as 1.00499...)
    let micros = (value * 1_000_000.0).round() as i64;
    let hundredths = if micros >= 0 {
        (micros + 5_000) / 10_000
    } else {
        -((-micros + 5_000) / 10_000)
    };
    hundredths as f64 / 100.0
}

pub fn format_percentile(value: f64) -> String {
    format!("{:.2}", round_half_up_2(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_are_valid_and_sum_to_one() {
        let weights = ScoringWeights::default();
        weights.validate().expect("default weights");
        let sum: f64 = RatingColumn::ALL.iter().map(|c| weights.weight(*c)).sum();
        assert!((sum - 1.0).abs() <= WEIGHT_SUM_TOLERANCE);
        assert_eq!(weights.weight(RatingColumn::Codeforces), 0.30);
        assert_eq!(weights.weight(RatingColumn::GfgContest), 0.30);
    }

    #[test]
    fn weights_validation_rejects_bad_tables() {
        let mut weights = ScoringWeights::default();
        weights.weights.insert(RatingColumn::Leetcode, 0.2);
        assert!(matches!(weights.validate(), Err(WeightsError::BadSum(_))));

        let mut weights = ScoringWeights::default();
        weights.weights.remove(&RatingColumn::Hackerrank);
        assert_eq!(
            weights.validate(),
            Err(WeightsError::MissingColumn(RatingColumn::Hackerrank))
        );

        let mut weights = ScoringWeights::default();
        weights.weights.insert(RatingColumn::Codechef, -0.1);
        weights.weights.insert(RatingColumn::Leetcode, 0.3);
        assert!(matches!(weights.validate(), Err(WeightsError::Invalid { .. })));
    }

    #[test]
    fn weights_table_reads_from_yaml() {
        let yaml = "version: 3\nmissing_column_policy: fixed\nweights:\n  codeforces: 0.25\n  gfg_contest: 0.25\n  gfg_practice: 0.2\n  leetcode: 0.1\n  codechef: 0.1\n  hackerrank: 0.1\n";
        let weights: ScoringWeights = serde_yaml::from_str(yaml).expect("yaml");
        assert_eq!(weights.version, 3);
        assert_eq!(weights.missing_column_policy, MissingColumnPolicy::Fixed);
        weights.validate().expect("valid");
    }

    #[test]
    fn existence_flag_gates_scrape_identifier() {
        let participant = Participant::new("stu1")
            .with_account(Platform::Codeforces, Some("cf_stu1"), true)
            .with_account(Platform::Leetcode, Some("lc_stu1"), false)
            .with_account(Platform::Codechef, Some("   "), true);

        assert_eq!(
            participant.scrape_target(Platform::Codeforces),
            Some(ScrapeTarget::new("stu1", "cf_stu1"))
        );
        assert_eq!(participant.scrape_target(Platform::Leetcode), None);
        assert_eq!(participant.scrape_target(Platform::Codechef), None);
        assert_eq!(participant.scrape_target(Platform::Hackerrank), None);
        assert_eq!(participant.identifier(Platform::Leetcode), Some("lc_stu1"));
    }

    #[test]
    fn columns_parse_from_command_verbs() {
        assert_eq!("gfg".parse(), Ok(RatingColumn::GfgContest));
        assert_eq!("gfg_practice".parse(), Ok(RatingColumn::GfgPractice));
        assert_eq!("Codeforces".parse(), Ok(RatingColumn::Codeforces));
        assert!("topcoder".parse::<RatingColumn>().is_err());
        for column in RatingColumn::ALL {
            assert_eq!(column.as_str().parse(), Ok(column));
            assert!(column.platform().columns().contains(&column));
        }
    }

    #[test]
    fn half_up_rounding_to_two_places() {
        assert_eq!(format_percentile(100.0), "100.00");
        assert_eq!(format_percentile(1.005), "1.01");
        assert_eq!(format_percentile(2.344), "2.34");
        assert_eq!(format_percentile(2.345), "2.35");
        assert_eq!(format_percentile(0.0), "0.00");
        assert_eq!(round_half_up_2(33.333333), 33.33);
    }
}
