//! Participant store, rating files, artifact writes and the rate/retry-controlled
//! HTTP transport used by every source adapter.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cpboard_core::{AggregatedRecord, Participant, Platform, RatingColumn, RatingObservation, ScrapeTarget};
pub use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, debug_span, info, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpboard-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub unchanged: bool,
}

/// Output directory for published artifacts. Every write is a temp file plus rename,
/// so readers never observe a half-written table.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn write_atomic(
        &self,
        relative_path: impl AsRef<Path>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let relative_path = relative_path.as_ref().to_path_buf();
        let absolute_path = self.root.join(&relative_path);
        let content_hash = Self::sha256_hex(bytes);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        if let Ok(existing) = fs::read(&absolute_path).await {
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(StoredArtifact {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            unchanged: false,
        })
    }
}

/// Plain-text `handle,identifier,rating` file for one rating column. Created
/// truncated at the start of a scrape and appended to line by line.
#[derive(Debug)]
pub struct RatingFileWriter {
    path: PathBuf,
    file: fs::File,
    lines: usize,
}

impl RatingFileWriter {
    pub fn path_for(dir: &Path, column: RatingColumn) -> PathBuf {
        dir.join(format!("{}_ratings.txt", column.as_str()))
    }

    pub async fn create(dir: &Path, column: RatingColumn) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating ratings directory {}", dir.display()))?;
        let path = Self::path_for(dir, column);
        let file = fs::File::create(&path)
            .await
            .with_context(|| format!("truncating {}", path.display()))?;
        Ok(Self { path, file, lines: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub async fn append(&mut self, observation: &RatingObservation) -> anyhow::Result<()> {
        // identifiers are written unescaped
        if observation.identifier.contains(',') {
            warn!(
                handle = %observation.handle,
                identifier = %observation.identifier,
                "identifier contains a comma; rating file line will be ambiguous"
            );
        }
        let line = format!(
            "{},{},{}\n",
            observation.handle, observation.identifier, observation.rating
        );
        self.file
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        self.file
            .flush()
            .await
            .with_context(|| format!("flushing {}", self.path.display()))?;
        self.lines += 1;
        Ok(())
    }
}

/// Source of monotonic time and sleeping for the rate/retry controller.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Time elapsed since the clock was created.
    fn elapsed(&self) -> Duration;

    async fn sleep(&self, duration: Duration);
}

#[derive(Debug)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl Default for TokioClock {
    fn default() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that only moves when something sleeps on it or it is advanced.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: StdMutex<Duration>,
    sleeps: StdMutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += duration;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().into_iter().sum()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        self.advance(duration);
    }
}

/// Minimum spacing between consecutive requests to one platform.
#[derive(Debug, Clone, Copy)]
pub struct RequestSpacer {
    interval: Duration,
    last_request: Option<Duration>,
}

impl RequestSpacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_request: None,
        }
    }

    pub fn per_second(max_requests: u32) -> Self {
        if max_requests == 0 {
            return Self::unthrottled();
        }
        Self::new(Duration::from_millis(1000 / u64::from(max_requests)))
    }

    pub fn unthrottled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleeps for whatever remains of the interval since the previous turn.
    pub async fn wait_turn(&mut self, clock: &dyn Clock) {
        if let Some(last) = self.last_request {
            let since_last = clock.elapsed().saturating_sub(last);
            if since_last < self.interval {
                clock.sleep(self.interval - since_last).await;
            }
        }
        self.last_request = Some(clock.elapsed());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    CoolDown,
    NonRetryable,
}

/// `busy` lists the platform's distinguished "server busy" codes.
pub fn classify_status(status: StatusCode, busy: &[u16]) -> RetryDisposition {
    if busy.contains(&status.as_u16()) {
        RetryDisposition::CoolDown
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Sleep after a "server busy" reply before repeating the same request.
    pub cooldown: Duration,
    /// Busy replies tolerated per request; beyond this they count as failures.
    pub max_cooldowns: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            cooldown: Duration::from_secs(30),
            max_cooldowns: 5,
        }
    }
}

/// Outcome of a single attempt that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    CoolDown(String),
    Transient(String),
    Fatal(String),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::CoolDown(reason) => write!(f, "server busy: {reason}"),
            AttemptError::Transient(reason) => write!(f, "transient failure: {reason}"),
            AttemptError::Fatal(reason) => write!(f, "{reason}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("{label}: gave up after {attempts} attempts: {last}")]
    Exhausted {
        label: String,
        attempts: u32,
        last: String,
    },
    #[error("{label}: {reason}")]
    Fatal { label: String, reason: String },
}

/// Per-platform request gate: spacing, bounded retry with backoff, and busy cool-downs.
#[derive(Debug)]
pub struct RequestController {
    policy: RetryPolicy,
    spacer: Mutex<RequestSpacer>,
    clock: Arc<dyn Clock>,
}

impl RequestController {
    pub fn new(policy: RetryPolicy, spacer: RequestSpacer, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            spacer: Mutex::new(spacer),
            clock,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn pace(&self) {
        let mut spacer = self.spacer.lock().await;
        spacer.wait_turn(self.clock.as_ref()).await;
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut cooldowns = 0u32;

        loop {
            self.pace().await;
            match op().await {
                Ok(value) => return Ok(value),
                Err(AttemptError::CoolDown(reason)) if cooldowns < self.policy.max_cooldowns => {
                    cooldowns += 1;
                    warn!(
                        label,
                        %reason,
                        cooldown_secs = self.policy.cooldown.as_secs(),
                        "server busy; cooling down before repeating request"
                    );
                    self.clock.sleep(self.policy.cooldown).await;
                }
                Err(AttemptError::CoolDown(reason)) | Err(AttemptError::Transient(reason)) => {
                    attempts += 1;
                    if attempts >= max_attempts {
                        return Err(RetryError::Exhausted {
                            label: label.to_string(),
                            attempts,
                            last: reason,
                        });
                    }
                    warn!(label, attempt = attempts, %reason, "request failed; retrying");
                    self.clock
                        .sleep(self.policy.backoff.delay_for_attempt(attempts as usize - 1))
                        .await;
                }
                Err(AttemptError::Fatal(reason)) => {
                    return Err(RetryError::Fatal {
                        label: label.to_string(),
                        reason,
                    })
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unreachable: {0}")]
    Unreachable(String),
}

pub fn attempt_error_for_fetch(err: &FetchError) -> AttemptError {
    match err {
        FetchError::Request(inner) => match classify_reqwest_error(inner) {
            RetryDisposition::NonRetryable => AttemptError::Fatal(err.to_string()),
            _ => AttemptError::Transient(err.to_string()),
        },
        FetchError::Unreachable(_) => AttemptError::Transient(err.to_string()),
    }
}

/// One GET round-trip. Retry policy lives in [`RequestController`], not here.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 1,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
        })
    }
}

#[async_trait]
impl Transport for HttpFetcher {
    async fn get(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;

        let span = debug_span!("http_get", url = %request.url);
        async {
            let mut builder = self.client.get(&request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let resp = builder.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "response received");
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Response { status: u16, body: String },
    /// Answers as if the request was redirected to `location`.
    Redirected { location: String, status: u16, body: String },
    Unreachable(String),
}

#[derive(Debug)]
struct ScriptedRoute {
    prefix: String,
    replies: VecDeque<ScriptedReply>,
}

/// In-memory [`Transport`] replaying canned replies by URL. An exact URL match wins,
/// otherwise the longest matching prefix; the last reply of a route repeats forever.
/// Unscripted URLs answer 404.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: StdMutex<Vec<ScriptedRoute>>,
    requests: StdMutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, prefix: impl Into<String>, reply: ScriptedReply) -> Self {
        let prefix = prefix.into();
        {
            let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
            match routes.iter_mut().find(|r| r.prefix == prefix) {
                Some(route) => route.replies.push_back(reply),
                None => routes.push(ScriptedRoute {
                    prefix,
                    replies: VecDeque::from([reply]),
                }),
            }
        }
        self
    }

    pub fn ok(self, prefix: impl Into<String>, body: impl Into<String>) -> Self {
        self.status(prefix, 200, body)
    }

    pub fn status(self, prefix: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        self.reply(
            prefix,
            ScriptedReply::Response {
                status,
                body: body.into(),
            },
        )
    }

    pub fn redirect(self, prefix: impl Into<String>, location: impl Into<String>) -> Self {
        self.reply(
            prefix,
            ScriptedReply::Redirected {
                location: location.into(),
                status: 200,
                body: String::new(),
            },
        )
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn request_urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url).collect()
    }

    fn next_reply(&self, url: &str) -> Option<ScriptedReply> {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let route = match routes.iter().position(|r| r.prefix == url) {
            Some(idx) => routes.get_mut(idx),
            None => routes
                .iter_mut()
                .filter(|r| url.starts_with(&r.prefix))
                .max_by_key(|r| r.prefix.len()),
        }?;
        if route.replies.len() > 1 {
            route.replies.pop_front()
        } else {
            route.replies.front().cloned()
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        match self.next_reply(&request.url) {
            Some(ScriptedReply::Response { status, body }) => Ok(FetchedResponse {
                status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                final_url: request.url.clone(),
                body: body.into_bytes(),
            }),
            Some(ScriptedReply::Redirected {
                location,
                status,
                body,
            }) => Ok(FetchedResponse {
                status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                final_url: location,
                body: body.into_bytes(),
            }),
            Some(ScriptedReply::Unreachable(reason)) => Err(FetchError::Unreachable(reason)),
            None => Ok(FetchedResponse {
                status: StatusCode::NOT_FOUND,
                final_url: request.url.clone(),
                body: b"not scripted".to_vec(),
            }),
        }
    }
}

/// Persistent record of participants, their per-column ratings and the last
/// aggregated leaderboard. One pooled connection, so at most one transaction is live.
#[derive(Debug, Clone)]
pub struct ParticipantStore {
    pool: SqlitePool,
}

impl ParticipantStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true);
        // the in-memory database lives only as long as its connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .with_context(|| format!("opening {database_url}"))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> anyhow::Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(&participants_ddl())
            .execute(&self.pool)
            .await
            .context("creating participants table")?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ratings (
                handle TEXT NOT NULL,
                rating_column TEXT NOT NULL,
                identifier TEXT NOT NULL,
                rating INTEGER NOT NULL,
                observed_at TEXT NOT NULL,
                PRIMARY KEY (handle, rating_column)
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating ratings table")?;
        sqlx::query(&leaderboard_ddl("CREATE TABLE IF NOT EXISTS"))
            .execute(&self.pool)
            .await
            .context("creating leaderboard table")?;
        Ok(())
    }

    /// Replaces the whole identifier record of every given handle. Position follows
    /// slice order.
    pub async fn upsert_participants(&self, participants: &[Participant]) -> anyhow::Result<usize> {
        let mut columns = vec!["handle".to_string(), "position".to_string()];
        for platform in Platform::ALL {
            columns.push(format!("{platform}_handle"));
            columns.push(format!("{platform}_exists"));
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO participants ({}) VALUES ({placeholders})",
            columns.join(", ")
        );

        let mut tx = self.pool.begin().await.context("starting roster transaction")?;
        for (position, participant) in participants.iter().enumerate() {
            let mut query = sqlx::query(&sql)
                .bind(&participant.handle)
                .bind(position as i64);
            for platform in Platform::ALL {
                let account = participant.account(platform).cloned().unwrap_or_default();
                query = query.bind(account.identifier).bind(account.exists);
            }
            query
                .execute(&mut *tx)
                .await
                .with_context(|| format!("upserting participant {}", participant.handle))?;
        }
        tx.commit().await.context("committing roster")?;
        info!(participants = participants.len(), "participant records upserted");
        Ok(participants.len())
    }

    pub async fn participants(&self) -> anyhow::Result<Vec<Participant>> {
        let rows = sqlx::query("SELECT * FROM participants ORDER BY position, handle")
            .fetch_all(&self.pool)
            .await
            .context("reading participants")?;
        rows.iter().map(participant_from_row).collect()
    }

    /// Work list for one platform: only participants whose existence flag is set.
    pub async fn scrape_targets(&self, platform: Platform) -> anyhow::Result<Vec<ScrapeTarget>> {
        Ok(self
            .participants()
            .await?
            .iter()
            .filter_map(|p| p.scrape_target(platform))
            .collect())
    }

    /// Opens the transaction that replaces every rating of `column`. Dropping the
    /// returned handle without committing leaves prior ratings untouched.
    pub async fn begin_column_replace(&self, column: RatingColumn) -> anyhow::Result<ColumnReplace> {
        let mut tx = self.pool.begin().await.context("starting rating transaction")?;
        let cleared = sqlx::query("DELETE FROM ratings WHERE rating_column = ?")
            .bind(column.as_str())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("clearing {column} ratings"))?
            .rows_affected();
        debug!(%column, cleared, "prior ratings staged for replacement");
        Ok(ColumnReplace {
            tx,
            column,
            recorded: 0,
        })
    }

    pub async fn ratings(&self) -> anyhow::Result<Vec<RatingObservation>> {
        let rows = sqlx::query(
            "SELECT handle, rating_column, identifier, rating, observed_at
             FROM ratings ORDER BY handle, rating_column",
        )
        .fetch_all(&self.pool)
        .await
        .context("reading ratings")?;

        rows.iter()
            .map(|row| -> anyhow::Result<RatingObservation> {
                let column: String = row.try_get("rating_column")?;
                let column = column
                    .parse::<RatingColumn>()
                    .with_context(|| format!("decoding stored column {column}"))?;
                Ok(RatingObservation {
                    handle: row.try_get("handle")?,
                    column,
                    identifier: row.try_get("identifier")?,
                    rating: row.try_get("rating")?,
                    observed_at: row.try_get::<DateTime<Utc>, _>("observed_at")?,
                })
            })
            .collect()
    }

    /// Drops and recreates the leaderboard table inside one transaction.
    pub async fn replace_leaderboard(&self, records: &[AggregatedRecord]) -> anyhow::Result<()> {
        let mut columns = vec![
            "handle".to_string(),
            "position".to_string(),
            "percentile".to_string(),
        ];
        for platform in Platform::ALL {
            columns.push(format!("{platform}_handle"));
        }
        for column in RatingColumn::ALL {
            columns.push(format!("{column}_rating"));
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        let insert = format!(
            "INSERT INTO leaderboard ({}) VALUES ({placeholders})",
            columns.join(", ")
        );

        let mut tx = self.pool.begin().await.context("starting leaderboard transaction")?;
        sqlx::query("DROP TABLE IF EXISTS leaderboard")
            .execute(&mut *tx)
            .await
            .context("dropping leaderboard")?;
        sqlx::query(&leaderboard_ddl("CREATE TABLE"))
            .execute(&mut *tx)
            .await
            .context("recreating leaderboard")?;
        for record in records {
            let mut query = sqlx::query(&insert)
                .bind(&record.handle)
                .bind(record.position)
                .bind(record.percentile);
            for platform in Platform::ALL {
                query = query.bind(record.identifier(platform).map(ToString::to_string));
            }
            for column in RatingColumn::ALL {
                query = query.bind(record.rating(column));
            }
            query
                .execute(&mut *tx)
                .await
                .with_context(|| format!("inserting leaderboard row {}", record.handle))?;
        }
        tx.commit().await.context("committing leaderboard")?;
        info!(rows = records.len(), "leaderboard table replaced");
        Ok(())
    }

    pub async fn leaderboard(&self) -> anyhow::Result<Vec<AggregatedRecord>> {
        let rows = sqlx::query("SELECT * FROM leaderboard ORDER BY position, handle")
            .fetch_all(&self.pool)
            .await
            .context("reading leaderboard")?;

        rows.iter()
            .map(|row| -> anyhow::Result<AggregatedRecord> {
                let mut record = AggregatedRecord::new(
                    row.try_get::<String, _>("handle")?,
                    row.try_get::<i64, _>("position")?,
                );
                record.percentile = row.try_get("percentile")?;
                for platform in Platform::ALL {
                    let id: Option<String> = row.try_get(format!("{platform}_handle").as_str())?;
                    if let Some(id) = id {
                        record.identifiers.insert(platform, id);
                    }
                }
                for column in RatingColumn::ALL {
                    let rating: Option<i64> = row.try_get(format!("{column}_rating").as_str())?;
                    if let Some(rating) = rating {
                        record.ratings.insert(column, rating);
                    }
                }
                Ok(record)
            })
            .collect()
    }
}

/// Staged replacement of one rating column; see [`ParticipantStore::begin_column_replace`].
pub struct ColumnReplace {
    tx: Transaction<'static, Sqlite>,
    column: RatingColumn,
    recorded: usize,
}

impl ColumnReplace {
    pub fn column(&self) -> RatingColumn {
        self.column
    }

    /// Merges one field: replaces this handle's rating in this column only.
    pub async fn record(&mut self, observation: &RatingObservation) -> anyhow::Result<()> {
        if observation.column != self.column {
            bail!(
                "observation for {} recorded into {} replacement",
                observation.column,
                self.column
            );
        }
        sqlx::query(
            "INSERT OR REPLACE INTO ratings (handle, rating_column, identifier, rating, observed_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&observation.handle)
        .bind(observation.column.as_str())
        .bind(&observation.identifier)
        .bind(observation.rating)
        .bind(observation.observed_at)
        .execute(&mut *self.tx)
        .await
        .with_context(|| format!("recording {} rating for {}", self.column, observation.handle))?;
        self.recorded += 1;
        Ok(())
    }

    pub async fn commit(self) -> anyhow::Result<usize> {
        let column = self.column;
        self.tx
            .commit()
            .await
            .with_context(|| format!("committing {column} ratings"))?;
        Ok(self.recorded)
    }
}

fn participants_ddl() -> String {
    let mut columns = vec![
        "handle TEXT PRIMARY KEY".to_string(),
        "position INTEGER NOT NULL".to_string(),
    ];
    for platform in Platform::ALL {
        columns.push(format!("{platform}_handle TEXT"));
        columns.push(format!("{platform}_exists INTEGER NOT NULL DEFAULT 0"));
    }
    format!("CREATE TABLE IF NOT EXISTS participants ({})", columns.join(", "))
}

fn leaderboard_ddl(create: &str) -> String {
    let mut columns = vec![
        "handle TEXT PRIMARY KEY".to_string(),
        "position INTEGER NOT NULL".to_string(),
        "percentile REAL".to_string(),
    ];
    for platform in Platform::ALL {
        columns.push(format!("{platform}_handle TEXT"));
    }
    for column in RatingColumn::ALL {
        columns.push(format!("{column}_rating INTEGER"));
    }
    format!("{create} leaderboard ({})", columns.join(", "))
}

fn participant_from_row(row: &SqliteRow) -> anyhow::Result<Participant> {
    let mut participant = Participant::new(row.try_get::<String, _>("handle")?);
    let mut accounts = BTreeMap::new();
    for platform in Platform::ALL {
        let identifier: Option<String> = row.try_get(format!("{platform}_handle").as_str())?;
        let exists: bool = row.try_get(format!("{platform}_exists").as_str())?;
        accounts.insert(platform, cpboard_core::PlatformAccount::new(identifier, exists));
    }
    participant.accounts = accounts;
    Ok(participant)
}
