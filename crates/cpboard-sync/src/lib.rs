//! Board pipeline: roster ingestion, per-column scrapes, aggregation and publishing.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use cpboard_adapters::{
    adapter_for_source, sanitize_identifier, AdapterContext, Credentials, HandleVerifier, SourceRegistry,
};
use cpboard_core::{
    format_percentile, AggregatedRecord, MissingColumnPolicy, Participant, Platform,
    RatingColumn, RatingObservation, ScoringWeights, ScrapeTarget, WeightsError,
};
use cpboard_storage::{
    ArtifactStore, HttpClientConfig, HttpFetcher, ParticipantStore, RatingFileWriter, StoredArtifact,
    TokioClock,
};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpboard-sync";

#[derive(Debug, Clone)]
pub struct BoardConfig {
    pub database_url: String,
    pub roster_path: PathBuf,
    pub sources_path: PathBuf,
    pub weights_path: PathBuf,
    pub ratings_dir: PathBuf,
    pub output_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
}

impl BoardConfig {
    pub fn from_env() -> Self {
        let path = |name: &str, default: &str| {
            std::env::var(name)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(default))
        };
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://cpboard.db?mode=rwc".to_string()),
            roster_path: path("CPBOARD_ROSTER_PATH", "data/participant_details.csv"),
            sources_path: path("CPBOARD_SOURCES_PATH", "config/sources.yaml"),
            weights_path: path("CPBOARD_WEIGHTS_PATH", "config/weights.yaml"),
            ratings_dir: path("CPBOARD_RATINGS_DIR", "ratings"),
            output_dir: path("CPBOARD_OUTPUT_DIR", "leaderboards"),
            user_agent: std::env::var("CPBOARD_USER_AGENT")
                .unwrap_or_else(|_| "cpboard/0.1".to_string()),
            http_timeout_secs: std::env::var("CPBOARD_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("CPBOARD_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scrape_cron: std::env::var("CPBOARD_SCRAPE_CRON")
                .unwrap_or_else(|_| "0 0 3 * * *".to_string()),
        }
    }

    /// Every path under `root`, an in-memory database, scheduler off.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            database_url: "sqlite::memory:".to_string(),
            roster_path: root.join("data/participant_details.csv"),
            sources_path: root.join("config/sources.yaml"),
            weights_path: root.join("config/weights.yaml"),
            ratings_dir: root.join("ratings"),
            output_dir: root.join("leaderboards"),
            user_agent: "cpboard/0.1".to_string(),
            http_timeout_secs: 20,
            scheduler_enabled: false,
            scrape_cron: "0 0 3 * * *".to_string(),
        }
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let Some(text) = read_optional(path).await? else {
        info!(path = %path.display(), "no source registry; using built-in defaults");
        return Ok(SourceRegistry::default());
    };
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub async fn load_weights(path: &Path) -> Result<ScoringWeights> {
    let weights = match read_optional(path).await? {
        Some(text) => serde_yaml::from_str::<ScoringWeights>(&text)
            .with_context(|| format!("parsing {}", path.display()))?,
        None => {
            info!(path = %path.display(), "no weights table; using built-in defaults");
            ScoringWeights::default()
        }
    };
    weights
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(weights)
}

pub const ROSTER_HEADER: &str = "Handle,GeeksForGeeks Handle,Codeforces Handle,LeetCode Handle,CodeChef Handle,HackerRank Handle,GeeksForGeeks URL Exists,Codeforces URL Exists,LeetCode URL Exists,CodeChef URL Exists,HackerRank URL Exists";

/// Columns of a roster that carries identifiers but no existence flags yet.
const ROSTER_IDENTIFIER_COLUMNS: usize = 6;

/// Column order of the roster's identifier block (and, offset by five, its flag block).
const ROSTER_PLATFORMS: [Platform; 5] = [
    Platform::Geeksforgeeks,
    Platform::Codeforces,
    Platform::Leetcode,
    Platform::Codechef,
    Platform::Hackerrank,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("line {line}: expected 6 or 11 columns, found {found}")]
    ColumnCount { line: usize, found: usize },
    #[error("line {line}: empty participant handle")]
    EmptyHandle { line: usize },
    #[error("line {line}: `{value}` is not a true/false flag")]
    BadFlag { line: usize, value: String },
}

fn parse_flag(line: usize, value: &str) -> Result<bool, RosterError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(RosterError::BadFlag {
            line,
            value: value.trim().to_string(),
        }),
    }
}

fn identifier_cell(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty() && !value.eq_ignore_ascii_case("#N/A")).then_some(value)
}

/// Parses the roster export. Rows are returned in file order; a repeated handle
/// replaces the earlier row and takes its position at the end.
pub fn parse_roster(text: &str) -> Result<Vec<Participant>, RosterError> {
    let mut participants: Vec<Participant> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let row = raw.trim_start_matches('\u{feff}').trim();
        // The full header, or its identifier-only prefix.
        let is_header = row.starts_with("Handle,") && ROSTER_HEADER.starts_with(row);
        if row.is_empty() || is_header || row.starts_with("None") || row.starts_with("TOTAL") {
            continue;
        }
        let cells: Vec<&str> = row.split(',').collect();
        let has_flags = cells.len() >= ROSTER_IDENTIFIER_COLUMNS + ROSTER_PLATFORMS.len();
        if !has_flags && cells.len() != ROSTER_IDENTIFIER_COLUMNS {
            return Err(RosterError::ColumnCount {
                line,
                found: cells.len(),
            });
        }
        let handle = cells[0].trim();
        if handle.is_empty() {
            return Err(RosterError::EmptyHandle { line });
        }

        let mut participant = Participant::new(handle);
        for (offset, platform) in ROSTER_PLATFORMS.into_iter().enumerate() {
            let exists = if has_flags {
                parse_flag(line, cells[ROSTER_IDENTIFIER_COLUMNS + offset])?
            } else {
                false
            };
            participant = participant.with_account(platform, identifier_cell(cells[1 + offset]), exists);
        }

        if let Some(previous) = seen.remove(handle) {
            warn!(line, handle, "duplicate roster handle; later row wins");
            participants.remove(previous);
            for position in seen.values_mut() {
                if *position > previous {
                    *position -= 1;
                }
            }
        }
        seen.insert(handle.to_string(), participants.len());
        participants.push(participant);
    }
    Ok(participants)
}

/// The roster in its full 11-column form. Absent identifiers are written as `#N/A`.
pub fn render_roster(participants: &[Participant]) -> String {
    let mut out = String::from(ROSTER_HEADER);
    out.push('\n');
    for participant in participants {
        let mut cells = vec![participant.handle.clone()];
        cells.extend(
            ROSTER_PLATFORMS
                .iter()
                .map(|platform| participant.identifier(*platform).unwrap_or("#N/A").to_string()),
        );
        cells.extend(ROSTER_PLATFORMS.iter().map(|platform| {
            let flag = if participant.exists_on(*platform) { "True" } else { "False" };
            flag.to_string()
        }));
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

pub async fn load_roster_file(path: &Path) -> Result<Vec<Participant>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading roster {}", path.display()))?;
    parse_roster(&text).with_context(|| format!("parsing roster {}", path.display()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub records: Vec<AggregatedRecord>,
    /// Cohort maximum per column; zero when nobody holds a positive rating.
    pub maxima: BTreeMap<RatingColumn, i64>,
}

/// Folds stored observations into one record per participant and scores them.
#[derive(Debug, Clone)]
pub struct AggregationEngine {
    weights: ScoringWeights,
}

impl AggregationEngine {
    pub fn new(weights: ScoringWeights) -> Result<Self, WeightsError> {
        weights.validate()?;
        Ok(Self { weights })
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn aggregate(&self, participants: &[Participant], observations: &[RatingObservation]) -> Aggregation {
        let mut records: Vec<AggregatedRecord> = Vec::with_capacity(participants.len());
        let mut by_handle: HashMap<&str, usize> = HashMap::new();
        for (position, participant) in participants.iter().enumerate() {
            let mut record = AggregatedRecord::new(&participant.handle, position as i64);
            for platform in Platform::ALL {
                if let Some(identifier) = participant.identifier(platform) {
                    record.identifiers.insert(platform, identifier.to_string());
                }
            }
            by_handle.insert(&participant.handle, records.len());
            records.push(record);
        }

        for observation in observations {
            let Some(&idx) = by_handle.get(observation.handle.as_str()) else {
                warn!(handle = %observation.handle, column = %observation.column, "rating for handle outside the roster ignored");
                continue;
            };
            let platform = observation.column.platform();
            if !participants[idx].exists_on(platform) {
                warn!(handle = %observation.handle, column = %observation.column, "rating ignored; existence flag is false");
                continue;
            }
            records[idx].ratings.insert(observation.column, observation.rating);
        }

        let maxima: BTreeMap<RatingColumn, i64> = RatingColumn::ALL
            .into_iter()
            .map(|column| {
                let max = records
                    .iter()
                    .filter_map(|r| r.rating(column))
                    .max()
                    .unwrap_or(0)
                    .max(0);
                (column, max)
            })
            .collect();

        let live_weight: f64 = RatingColumn::ALL
            .into_iter()
            .filter(|c| maxima[c] > 0)
            .map(|c| self.weights.weight(c))
            .sum();
        let empty: Vec<&str> = RatingColumn::ALL
            .into_iter()
            .filter(|c| maxima[c] == 0)
            .map(RatingColumn::as_str)
            .collect();
        if !empty.is_empty() {
            info!(?empty, live_weight, policy = ?self.weights.missing_column_policy, "columns without ratings");
        }

        for record in &mut records {
            let mut composite = 0.0;
            for column in RatingColumn::ALL {
                let max = maxima[&column];
                if max <= 0 {
                    continue;
                }
                let rating = record.rating(column).unwrap_or(0) as f64;
                composite += rating / max as f64 * 100.0 * self.weights.weight(column);
            }
            let percentile = match self.weights.missing_column_policy {
                MissingColumnPolicy::Fixed => composite,
                MissingColumnPolicy::Renormalize if live_weight > 0.0 => composite / live_weight,
                MissingColumnPolicy::Renormalize => 0.0,
            };
            record.percentile = Some(percentile);
        }

        Aggregation { records, maxima }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedRow {
    pub rank: usize,
    pub record: AggregatedRecord,
}

/// Orders by percentile descending, ties by roster position, and numbers rows 1..N.
pub fn rank_records(mut records: Vec<AggregatedRecord>) -> Vec<RankedRow> {
    records.sort_by(|a, b| {
        let pa = a.percentile.unwrap_or(f64::NEG_INFINITY);
        let pb = b.percentile.unwrap_or(f64::NEG_INFINITY);
        pb.total_cmp(&pa)
            .then(a.position.cmp(&b.position))
            .then_with(|| a.handle.cmp(&b.handle))
    });
    records
        .into_iter()
        .enumerate()
        .map(|(idx, record)| RankedRow { rank: idx + 1, record })
        .collect()
}

/// Header of the published table, in column order.
pub fn leaderboard_header() -> Vec<&'static str> {
    let mut header = vec!["Rank", "Handle"];
    for platform in Platform::ALL {
        header.push(platform.handle_header());
        for column in platform.columns() {
            header.push(column.rating_header());
        }
    }
    header.push("Percentile");
    header
}

fn row_cells(row: &RankedRow) -> Vec<String> {
    let record = &row.record;
    let mut cells = vec![row.rank.to_string(), record.handle.clone()];
    for platform in Platform::ALL {
        cells.push(record.identifier(platform).unwrap_or_default().to_string());
        for column in platform.columns() {
            cells.push(record.rating(*column).map(|r| r.to_string()).unwrap_or_default());
        }
    }
    cells.push(record.percentile.map(format_percentile).unwrap_or_default());
    cells
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn render_csv(rows: &[RankedRow]) -> String {
    let mut out = leaderboard_header().join(",");
    out.push('\n');
    for row in rows {
        let line = row_cells(row)
            .iter()
            .map(|c| csv_field(c))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardMeta {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub weights_version: u32,
    pub missing_column_policy: MissingColumnPolicy,
    pub maxima: BTreeMap<RatingColumn, i64>,
}

pub fn render_markdown(rows: &[RankedRow], meta: &LeaderboardMeta) -> String {
    let cell = |v: &str| v.replace('|', "\\|");
    let mut lines = vec![
        "# Cohort Leaderboard".to_string(),
        String::new(),
        format!("- Run ID: `{}`", meta.run_id),
        format!("- Generated: {}", meta.generated_at.to_rfc3339()),
        format!("- Participants: {}", rows.len()),
        format!(
            "- Weights: version {} ({:?})",
            meta.weights_version, meta.missing_column_policy
        ),
        String::new(),
        "## Column maxima".to_string(),
    ];
    for (column, max) in &meta.maxima {
        lines.push(format!("- {}: {}", column.rating_header(), max));
    }
    lines.push(String::new());
    lines.push("## Ranking".to_string());
    lines.push(String::new());

    let header = leaderboard_header();
    lines.push(format!("| {} |", header.join(" | ")));
    lines.push(format!("|{}", "---|".repeat(header.len())));
    for row in rows {
        let cells: Vec<String> = row_cells(row).iter().map(|c| cell(c)).collect();
        lines.push(format!("| {} |", cells.join(" | ")));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn leaderboard_parquet(rows: &[RankedRow]) -> Result<Vec<u8>> {
    let mut fields = vec![
        ArrowField::new("rank", DataType::UInt32, false),
        ArrowField::new("handle", DataType::Utf8, false),
    ];
    for platform in Platform::ALL {
        fields.push(ArrowField::new(format!("{platform}_handle"), DataType::Utf8, true));
    }
    for column in RatingColumn::ALL {
        fields.push(ArrowField::new(format!("{column}_rating"), DataType::Int64, true));
    }
    fields.push(ArrowField::new("percentile", DataType::Float64, true));
    let schema = Arc::new(Schema::new(fields));

    let mut columns: Vec<Arc<dyn arrow_array::Array>> = vec![
        Arc::new(UInt32Array::from(
            rows.iter().map(|r| r.rank as u32).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| Some(r.record.handle.as_str()))
                .collect::<Vec<_>>(),
        )),
    ];
    for platform in Platform::ALL {
        columns.push(Arc::new(StringArray::from(
            rows.iter()
                .map(|r| r.record.identifier(platform))
                .collect::<Vec<_>>(),
        )));
    }
    for column in RatingColumn::ALL {
        columns.push(Arc::new(Int64Array::from(
            rows.iter().map(|r| r.record.rating(column)).collect::<Vec<_>>(),
        )));
    }
    columns.push(Arc::new(Float64Array::from(
        rows.iter().map(|r| r.record.percentile).collect::<Vec<_>>(),
    )));

    let batch = RecordBatch::try_new(schema, columns).context("building leaderboard record batch")?;
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(&batch).context("writing leaderboard record batch")?;
    writer.into_inner().context("closing parquet writer")
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub weights_version: u32,
    pub rows: usize,
    pub files: Vec<ManifestFile>,
}

fn manifest_entry(name: &str, artifact: &StoredArtifact) -> ManifestFile {
    ManifestFile {
        name: name.to_string(),
        path: artifact.relative_path.display().to_string(),
        sha256: artifact.content_hash.clone(),
        bytes: artifact.byte_size as u64,
    }
}

#[derive(Debug, Clone)]
pub struct PublishedLeaderboard {
    pub csv: StoredArtifact,
    pub markdown: StoredArtifact,
    pub parquet: StoredArtifact,
    pub manifest: StoredArtifact,
}

/// Writes the ranked table and its companions into the output directory.
#[derive(Debug, Clone)]
pub struct Publisher {
    artifacts: ArtifactStore,
}

impl Publisher {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifacts: ArtifactStore::new(output_dir),
        }
    }

    pub async fn publish(&self, rows: &[RankedRow], meta: &LeaderboardMeta) -> Result<PublishedLeaderboard> {
        let csv = self
            .artifacts
            .write_atomic("leaderboard.csv", render_csv(rows).as_bytes())
            .await?;
        let markdown = self
            .artifacts
            .write_atomic("leaderboard.md", render_markdown(rows, meta).as_bytes())
            .await?;
        let parquet = self
            .artifacts
            .write_atomic("leaderboard.parquet", &leaderboard_parquet(rows)?)
            .await?;

        let manifest = LeaderboardManifest {
            schema_version: 1,
            run_id: meta.run_id,
            generated_at: meta.generated_at,
            weights_version: meta.weights_version,
            rows: rows.len(),
            files: vec![
                manifest_entry("leaderboard_csv", &csv),
                manifest_entry("leaderboard_markdown", &markdown),
                manifest_entry("leaderboard_parquet", &parquet),
            ],
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing leaderboard manifest")?;
        let manifest = self.artifacts.write_atomic("manifest.json", &bytes).await?;

        info!(
            rows = rows.len(),
            dir = %self.artifacts.root().display(),
            csv_sha256 = %csv.content_hash,
            "leaderboard published"
        );
        Ok(PublishedLeaderboard {
            csv,
            markdown,
            parquet,
            manifest,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RosterSummary {
    pub path: String,
    pub participants: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifySummary {
    pub run_id: Uuid,
    pub path: String,
    pub participants: usize,
    pub checked: usize,
    pub found: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeSummary {
    pub run_id: Uuid,
    pub column: RatingColumn,
    pub targets: usize,
    pub observed: usize,
    pub ratings_file: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LeaderboardSummary {
    pub meta: LeaderboardMeta,
    pub rows: Vec<RankedRow>,
    pub published: PublishedLeaderboard,
}

/// Owns the store, source settings, weights and transport for one process.
pub struct BoardPipeline {
    config: BoardConfig,
    store: ParticipantStore,
    registry: SourceRegistry,
    engine: AggregationEngine,
    ctx: AdapterContext,
}

impl BoardPipeline {
    pub fn new(
        config: BoardConfig,
        store: ParticipantStore,
        registry: SourceRegistry,
        weights: ScoringWeights,
        ctx: AdapterContext,
    ) -> Result<Self> {
        let engine = AggregationEngine::new(weights).context("invalid scoring weights")?;
        Ok(Self {
            config,
            store,
            registry,
            engine,
            ctx,
        })
    }

    pub async fn from_config(config: BoardConfig) -> Result<Self> {
        let store = ParticipantStore::connect(&config.database_url).await?;
        let registry = load_source_registry(&config.sources_path).await?;
        let weights = load_weights(&config.weights_path).await?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let ctx = AdapterContext::new(
            Arc::new(http),
            Arc::new(TokioClock::default()),
            Credentials::from_env(),
        );
        Self::new(config, store, registry, weights, ctx)
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(BoardConfig::from_env()).await
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn store(&self) -> &ParticipantStore {
        &self.store
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub async fn load_roster(&self) -> Result<RosterSummary> {
        let participants = load_roster_file(&self.config.roster_path).await?;
        let count = self.store.upsert_participants(&participants).await?;
        Ok(RosterSummary {
            path: self.config.roster_path.display().to_string(),
            participants: count,
        })
    }

    /// Checks every roster identifier against its platform, rewrites the roster's
    /// existence flags in place and loads the result into the store. Identifiers
    /// are cleaned first; a failed check clears the flag.
    pub async fn verify_handles(&self) -> Result<VerifySummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("verify_handles", %run_id);
        async move {
            let path = &self.config.roster_path;
            let mut participants = load_roster_file(path).await?;
            for participant in &mut participants {
                for (platform, account) in participant.accounts.iter_mut() {
                    account.identifier = account
                        .identifier
                        .as_deref()
                        .and_then(|raw| sanitize_identifier(*platform, raw));
                }
            }

            let verifier = HandleVerifier::new(self.registry.verifier.clone());
            let (mut checked, mut found) = (0, 0);
            for platform in Platform::ALL {
                let targets: Vec<ScrapeTarget> = participants
                    .iter()
                    .filter_map(|p| p.identifier(platform).map(|id| ScrapeTarget::new(&p.handle, id)))
                    .collect();
                let checks = verifier.verify(&self.ctx, platform, &targets).await;
                let outcome: HashMap<&str, bool> =
                    checks.iter().map(|c| (c.handle.as_str(), c.exists)).collect();
                for participant in &mut participants {
                    let exists = outcome.get(participant.handle.as_str()).copied().unwrap_or(false);
                    if let Some(account) = participant.accounts.get_mut(&platform) {
                        account.exists = exists;
                    }
                }
                checked += checks.len();
                found += checks.iter().filter(|c| c.exists).count();
            }

            let file_name = path
                .file_name()
                .with_context(|| format!("roster path {} has no file name", path.display()))?;
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            ArtifactStore::new(dir)
                .write_atomic(file_name, render_roster(&participants).as_bytes())
                .await
                .with_context(|| format!("rewriting roster {}", path.display()))?;
            let count = self.store.upsert_participants(&participants).await?;
            info!(participants = count, checked, found, "roster verified");

            Ok::<_, anyhow::Error>(VerifySummary {
                run_id,
                path: path.display().to_string(),
                participants: count,
                checked,
                found,
            })
        }
        .instrument(span)
        .await
    }

    /// Replaces one column's ratings with a fresh scrape. On error the store keeps
    /// the previous ratings for that column.
    pub async fn scrape(&self, column: RatingColumn) -> Result<ScrapeSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scrape", %run_id, %column);
        async {
            let started_at = Utc::now();
            let source = self.registry.config_for(column);
            if !source.enabled() {
                warn!("source is disabled in the registry; scraping on explicit request");
            }
            let targets = self.store.scrape_targets(column.platform()).await?;
            info!(targets = targets.len(), "scrape started");

            let mut file = RatingFileWriter::create(&self.config.ratings_dir, column).await?;
            let observations = if targets.is_empty() {
                Vec::new()
            } else {
                adapter_for_source(&source)
                    .fetch_ratings(&self.ctx, &targets)
                    .await
                    .with_context(|| format!("{column} scrape failed"))?
            };

            let mut replace = self.store.begin_column_replace(column).await?;
            let mut observed = 0usize;
            for observation in &observations {
                if !targets.iter().any(|t| t.handle == observation.handle) {
                    warn!(handle = %observation.handle, "observation for a handle outside the work list dropped");
                    continue;
                }
                replace.record(observation).await?;
                file.append(observation).await?;
                observed += 1;
            }
            replace.commit().await?;

            let finished_at = Utc::now();
            info!(
                observed,
                skipped = targets.len().saturating_sub(observed),
                "scrape completed"
            );
            Ok::<_, anyhow::Error>(ScrapeSummary {
                run_id,
                column,
                targets: targets.len(),
                observed,
                ratings_file: file.path().display().to_string(),
                started_at,
                finished_at,
            })
        }
        .instrument(span)
        .await
    }

    /// Every enabled source in registry order; the first hard failure ends the run.
    pub async fn scrape_all(&self) -> Result<Vec<ScrapeSummary>> {
        let columns: Vec<RatingColumn> = self.registry.enabled().map(|s| s.column()).collect();
        let mut summaries = Vec::with_capacity(columns.len());
        for column in columns {
            summaries.push(self.scrape(column).await?);
        }
        Ok(summaries)
    }

    pub async fn build_leaderboard(&self) -> Result<LeaderboardSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("build_leaderboard", %run_id);
        async {
            let participants = self.store.participants().await?;
            let observations = self.store.ratings().await?;
            let aggregation = self.engine.aggregate(&participants, &observations);
            self.store.replace_leaderboard(&aggregation.records).await?;

            let rows = rank_records(self.store.leaderboard().await?);
            let weights = self.engine.weights();
            let meta = LeaderboardMeta {
                run_id,
                generated_at: Utc::now(),
                weights_version: weights.version,
                missing_column_policy: weights.missing_column_policy,
                maxima: aggregation.maxima,
            };
            let published = Publisher::new(&self.config.output_dir).publish(&rows, &meta).await?;
            Ok::<_, anyhow::Error>(LeaderboardSummary {
                meta,
                rows,
                published,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn run_scheduled(&self) -> Result<LeaderboardSummary> {
        self.scrape_all().await?;
        self.build_leaderboard().await
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.scrape_cron.clone();
        let pipeline = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_scheduled().await {
                    Ok(summary) => info!(rows = summary.rows.len(), "scheduled run finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn obs(handle: &str, column: RatingColumn, rating: i64) -> RatingObservation {
        RatingObservation {
            handle: handle.to_string(),
            column,
            identifier: format!("{handle}_{column}"),
            rating,
            observed_at: Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).single().unwrap(),
        }
    }

    fn everywhere(handle: &str) -> Participant {
        let mut participant = Participant::new(handle);
        for platform in Platform::ALL {
            let identifier = format!("{handle}_{platform}");
            participant = participant.with_account(platform, Some(identifier.as_str()), true);
        }
        participant
    }

    fn shown(record: &AggregatedRecord) -> String {
        format_percentile(record.percentile.expect("scored"))
    }

    fn engine(policy: MissingColumnPolicy) -> AggregationEngine {
        AggregationEngine::new(ScoringWeights {
            missing_column_policy: policy,
            ..ScoringWeights::default()
        })
        .expect("weights")
    }

    fn meta() -> LeaderboardMeta {
        LeaderboardMeta {
            run_id: Uuid::nil(),
            generated_at: Utc.with_ymd_and_hms(2026, 10, 19, 3, 0, 0).single().unwrap(),
            weights_version: 1,
            missing_column_policy: MissingColumnPolicy::Renormalize,
            maxima: RatingColumn::ALL.into_iter().map(|c| (c, 0)).collect(),
        }
    }

    const ROSTER: &str = "\u{feff}Handle,GeeksForGeeks Handle,Codeforces Handle,LeetCode Handle,CodeChef Handle,HackerRank Handle,GeeksForGeeks URL Exists,Codeforces URL Exists,LeetCode URL Exists,CodeChef URL Exists,HackerRank URL Exists
stu1,gfg_stu1,cf_stu1,lc_stu1,cc_stu1,hr_stu1,True,TRUE,true,false,true

stu2,#N/A,cf_stu2,,cc_stu2,hr_stu2,false,true,false,true,FALSE
stu1,gfg_new,cf_stu1,lc_stu1,cc_stu1,hr_stu1,true,true,true,true,true
None,,,,,,false,false,false,false,false
TOTAL,2,2,1,2,2,1,2,1,2,1
";

    #[test]
    fn roster_parsing_skips_headers_and_summary_rows() {
        let participants = parse_roster(ROSTER).expect("roster");
        let handles: Vec<&str> = participants.iter().map(|p| p.handle.as_str()).collect();
        assert_eq!(handles, vec!["stu2", "stu1"]);

        let stu2 = &participants[0];
        assert_eq!(stu2.identifier(Platform::Geeksforgeeks), None);
        assert_eq!(stu2.identifier(Platform::Leetcode), None);
        assert!(stu2.exists_on(Platform::Codeforces));
        assert!(!stu2.exists_on(Platform::Hackerrank));

        let stu1 = &participants[1];
        assert_eq!(stu1.identifier(Platform::Geeksforgeeks), Some("gfg_new"));
        assert!(stu1.exists_on(Platform::Codechef));
    }

    #[test]
    fn identifier_only_roster_loads_with_flags_cleared() {
        let text = "Handle,GeeksForGeeks Handle,Codeforces Handle,LeetCode Handle,CodeChef Handle,HackerRank Handle\nstu1,#N/A,cf_stu1,lc_stu1,,hr_stu1\n";
        let participants = parse_roster(text).expect("roster");
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].identifier(Platform::Codeforces), Some("cf_stu1"));
        assert!(Platform::ALL.iter().all(|p| !participants[0].exists_on(*p)));

        assert_eq!(
            parse_roster("stu1,g,c,l,cc,h,true,true\n"),
            Err(RosterError::ColumnCount { line: 1, found: 8 })
        );
    }

    #[test]
    fn rendered_roster_parses_back_to_the_same_participants() {
        let participants = parse_roster(ROSTER).expect("roster");
        let rendered = render_roster(&participants);
        assert!(rendered.starts_with(ROSTER_HEADER));
        assert!(rendered.contains("\nstu2,#N/A,cf_stu2,#N/A,cc_stu2,hr_stu2,False,True,False,True,False\n"));
        assert_eq!(parse_roster(&rendered).expect("reparse"), participants);
    }

    #[test]
    fn roster_errors_name_the_line() {
        let bad_flag = format!("{ROSTER_HEADER}\nstu1,g,c,l,cc,h,yes,true,true,true,true\n");
        assert_eq!(
            parse_roster(&bad_flag),
            Err(RosterError::BadFlag {
                line: 2,
                value: "yes".into()
            })
        );
        assert_eq!(
            parse_roster("stu1,g,c\n"),
            Err(RosterError::ColumnCount { line: 1, found: 3 })
        );
        assert_eq!(
            parse_roster(",g,c,l,cc,h,true,true,true,true,true\n"),
            Err(RosterError::EmptyHandle { line: 1 })
        );
    }

    #[test]
    fn single_rated_column_renormalizes_to_full_score() {
        let participants = vec![Participant::new("stu1").with_account(Platform::Codeforces, Some("cf_stu1"), true)];
        let ratings = vec![obs("stu1", RatingColumn::Codeforces, 1500)];

        let renormalized = engine(MissingColumnPolicy::Renormalize).aggregate(&participants, &ratings);
        assert_eq!(shown(&renormalized.records[0]), "100.00");

        let fixed = engine(MissingColumnPolicy::Fixed).aggregate(&participants, &ratings);
        assert_eq!(shown(&fixed.records[0]), "30.00");
        assert_eq!(fixed.maxima[&RatingColumn::Codeforces], 1500);
        assert_eq!(fixed.maxima[&RatingColumn::Leetcode], 0);
    }

    #[test]
    fn topping_every_column_scores_exactly_one_hundred() {
        let participants = vec![everywhere("stu1"), everywhere("stu2")];
        let mut ratings = Vec::new();
        for column in RatingColumn::ALL {
            ratings.push(obs("stu1", column, 1800));
            ratings.push(obs("stu2", column, 900));
        }
        for policy in [MissingColumnPolicy::Renormalize, MissingColumnPolicy::Fixed] {
            let aggregation = engine(policy).aggregate(&participants, &ratings);
            assert_eq!(format_percentile(aggregation.records[0].percentile.unwrap()), "100.00");
            assert_eq!(format_percentile(aggregation.records[1].percentile.unwrap()), "50.00");
        }
    }

    #[test]
    fn weighted_composite_uses_cohort_maxima() {
        let participants = vec![everywhere("stu1"), everywhere("stu2")];
        let ratings = vec![
            obs("stu1", RatingColumn::Codeforces, 2000),
            obs("stu2", RatingColumn::Codeforces, 1000),
            obs("stu2", RatingColumn::Leetcode, 1500),
            obs("stu1", RatingColumn::GfgContest, 300),
            obs("stu1", RatingColumn::GfgPractice, 120),
            obs("stu2", RatingColumn::GfgPractice, 360),
            obs("stu1", RatingColumn::Codechef, 1700),
            obs("stu2", RatingColumn::Hackerrank, 400),
        ];
        let aggregation = engine(MissingColumnPolicy::Fixed).aggregate(&participants, &ratings);
        // stu1: 100*.3 + 100*.3 + 33.33*.1 + 0 + 100*.1 + 0
        assert_eq!(shown(&aggregation.records[0]), "73.33");
        // stu2: 50*.3 + 0 + 100*.1 + 100*.1 + 0 + 100*.1
        assert_eq!(shown(&aggregation.records[1]), "45.00");
        assert_eq!(aggregation.records[1].rating(RatingColumn::GfgContest), None);
    }

    #[test]
    fn false_existence_flag_discards_stored_rating() {
        let participants = vec![
            Participant::new("stu1")
                .with_account(Platform::Leetcode, Some("lc_stu1"), false)
                .with_account(Platform::Codeforces, Some("cf_stu1"), true),
            Participant::new("stu2").with_account(Platform::Leetcode, Some("lc_stu2"), true),
        ];
        let ratings = vec![
            obs("stu1", RatingColumn::Leetcode, 2500),
            obs("stu1", RatingColumn::Codeforces, 1200),
            obs("stu2", RatingColumn::Leetcode, 1600),
            obs("ghost", RatingColumn::Leetcode, 9999),
        ];
        let aggregation = engine(MissingColumnPolicy::Renormalize).aggregate(&participants, &ratings);
        assert_eq!(aggregation.records.len(), 2);
        assert_eq!(aggregation.records[0].rating(RatingColumn::Leetcode), None);
        assert_eq!(aggregation.maxima[&RatingColumn::Leetcode], 1600);
    }

    #[test]
    fn empty_cohort_columns_never_divide_by_zero() {
        let participants = vec![everywhere("stu1")];
        let aggregation = engine(MissingColumnPolicy::Renormalize).aggregate(&participants, &[]);
        assert_eq!(aggregation.records[0].percentile, Some(0.0));
        let aggregation = engine(MissingColumnPolicy::Fixed).aggregate(&participants, &[]);
        assert_eq!(aggregation.records[0].percentile, Some(0.0));
    }

    #[test]
    fn aggregation_is_deterministic() {
        let participants = vec![everywhere("a"), everywhere("b"), everywhere("c")];
        let ratings = vec![
            obs("a", RatingColumn::Codeforces, 1234),
            obs("b", RatingColumn::Codeforces, 1777),
            obs("c", RatingColumn::Leetcode, 1500),
            obs("a", RatingColumn::Hackerrank, 77),
        ];
        let engine = engine(MissingColumnPolicy::Renormalize);
        let first = engine.aggregate(&participants, &ratings);
        let second = engine.aggregate(&participants, &ratings);
        let bits = |a: &Aggregation| {
            a.records
                .iter()
                .map(|r| r.percentile.map(f64::to_bits))
                .collect::<Vec<_>>()
        };
        assert_eq!(bits(&first), bits(&second));
    }

    #[test]
    fn ranking_uses_unrounded_percentiles() {
        let participants: Vec<Participant> = ["top", "a", "b"]
            .into_iter()
            .map(|h| Participant::new(h).with_account(Platform::Codeforces, Some(h), true))
            .collect();
        let ratings = vec![
            obs("top", RatingColumn::Codeforces, 100_000),
            obs("a", RatingColumn::Codeforces, 33_331),
            obs("b", RatingColumn::Codeforces, 33_334),
        ];
        let aggregation = engine(MissingColumnPolicy::Fixed).aggregate(&participants, &ratings);
        assert_eq!(shown(&aggregation.records[1]), "10.00");
        assert_eq!(shown(&aggregation.records[2]), "10.00");

        let ranked = rank_records(aggregation.records);
        let order: Vec<&str> = ranked.iter().map(|r| r.record.handle.as_str()).collect();
        assert_eq!(order, vec!["top", "b", "a"]);
        assert!(render_csv(&ranked).contains("\n2,b,b,33334,,,,,,,,,,10.00\n"));
    }

    #[test]
    fn ranking_is_stable_on_ties() {
        let mut records = Vec::new();
        for (handle, position, percentile) in [("d", 3, 10.0), ("b", 1, 50.0), ("a", 0, 10.0), ("c", 2, 50.0)] {
            let mut record = AggregatedRecord::new(handle, position);
            record.percentile = Some(percentile);
            records.push(record);
        }
        let ranked = rank_records(records);
        let order: Vec<(usize, &str)> = ranked
            .iter()
            .map(|r| (r.rank, r.record.handle.as_str()))
            .collect();
        assert_eq!(order, vec![(1, "b"), (2, "c"), (3, "a"), (4, "d")]);
    }

    #[test]
    fn csv_has_fixed_header_and_blank_unknown_cells() {
        let mut record = AggregatedRecord::new("stu1", 0);
        record.identifiers.insert(Platform::Codeforces, "cf_stu1".into());
        record.identifiers.insert(Platform::Hackerrank, "odd,\"name\"".into());
        record.ratings.insert(RatingColumn::Codeforces, 1500);
        record.percentile = Some(100.0);
        let csv = render_csv(&rank_records(vec![record]));
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("Rank,Handle,Codeforces_Handle,Codeforces_Rating,Geeksforgeeks_Handle,Geeksforgeeks_Rating,Geeksforgeeks_Practice_Rating,Leetcode_Handle,Leetcode_Rating,Codechef_Handle,Codechef_Rating,Hackerrank_Handle,Hackerrank_Rating,Percentile")
        );
        assert_eq!(
            lines.next(),
            Some("1,stu1,cf_stu1,1500,,,,,,,,\"odd,\"\"name\"\"\",,100.00")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn markdown_brief_lists_maxima_and_rows() {
        let mut record = AggregatedRecord::new("stu|1", 0);
        record.percentile = Some(12.5);
        let text = render_markdown(&rank_records(vec![record]), &meta());
        assert!(text.starts_with("# Cohort Leaderboard"));
        assert!(text.contains("- Codeforces_Rating: 0"));
        assert!(text.contains("| 1 | stu\\|1 |"));
        assert!(text.contains("| 12.50 |"));
    }

    #[tokio::test]
    async fn publisher_writes_artifacts_and_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut record = AggregatedRecord::new("stu1", 0);
        record.ratings.insert(RatingColumn::Codeforces, 1500);
        record.percentile = Some(100.0);
        let rows = rank_records(vec![record]);

        let published = Publisher::new(dir.path()).publish(&rows, &meta()).await.expect("publish");

        let csv = std::fs::read_to_string(dir.path().join("leaderboard.csv")).expect("csv");
        assert!(csv.ends_with("1,stu1,,1500,,,,,,,,,,100.00\n"));
        assert_eq!(published.csv.content_hash, ArtifactStore::sha256_hex(csv.as_bytes()));

        let parquet = std::fs::read(dir.path().join("leaderboard.parquet")).expect("parquet");
        assert_eq!(&parquet[..4], b"PAR1");

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("manifest.json")).expect("manifest"))
                .expect("json");
        assert_eq!(manifest["rows"], 1);
        assert_eq!(manifest["files"][0]["sha256"], published.csv.content_hash.as_str());
        assert_eq!(manifest["files"][2]["path"], "leaderboard.parquet");
    }

    #[tokio::test]
    async fn missing_config_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = load_source_registry(&dir.path().join("nope.yaml")).await.expect("registry");
        assert_eq!(registry, SourceRegistry::default());
        let weights = load_weights(&dir.path().join("nope.yaml")).await.expect("weights");
        assert_eq!(weights, ScoringWeights::default());

        let bad = dir.path().join("weights.yaml");
        std::fs::write(
            &bad,
            "version: 2\nweights:\n  codeforces: 0.5\n  gfg_contest: 0.5\n  gfg_practice: 0.5\n  leetcode: 0\n  codechef: 0\n  hackerrank: 0\n",
        )
        .expect("write");
        assert!(load_weights(&bad).await.is_err());
    }

    #[test]
    fn config_defaults_match_documented_values() {
        let config = BoardConfig::rooted_at("/srv/board");
        assert_eq!(config.ratings_dir, PathBuf::from("/srv/board/ratings"));
        assert_eq!(config.scrape_cron, "0 0 3 * * *");
        assert!(!config.scheduler_enabled);
    }
}
