//! Source adapters: one per rating column, sharing the [`SourceAdapter`] contract.
//!
//! Every adapter receives the existence-flag-filtered work list for its platform and
//! returns one [`RatingObservation`] per identifier the platform could resolve.
//! Not-found identifiers are dropped with a log line. Transport failures go through
//! the adapter's [`RequestController`]; only the Codeforces batch path lets retry
//! exhaustion escape as an error.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cpboard_core::{Platform, RatingColumn, RatingObservation, ScrapeTarget};
use cpboard_storage::{
    attempt_error_for_fetch, classify_status, AttemptError, BackoffPolicy, Clock, FetchedResponse,
    HttpRequest, RequestController, RequestSpacer, RetryDisposition, RetryError, RetryPolicy,
    StatusCode, Transport,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "cpboard-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Retry(#[from] RetryError),
    #[error("{column}: malformed response: {reason}")]
    Malformed { column: RatingColumn, reason: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Out-of-band secrets. Passed through untouched; the platforms decide whether they work.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub codeforces_key: Option<String>,
    pub codeforces_secret: Option<String>,
    pub leetcode_session: Option<String>,
    pub gfg_session: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            codeforces_key: var("CODEFORCES_KEY"),
            codeforces_secret: var("CODEFORCES_SECRET"),
            leetcode_session: var("LEETCODE_SESSION"),
            gfg_session: var("GFG_SESSION"),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = |v: &Option<String>| if v.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("Credentials")
            .field("codeforces_key", &shown(&self.codeforces_key))
            .field("codeforces_secret", &shown(&self.codeforces_secret))
            .field("leetcode_session", &shown(&self.leetcode_session))
            .field("gfg_session", &shown(&self.gfg_session))
            .finish()
    }
}

/// What an adapter gets to talk to the outside world with.
#[derive(Clone)]
pub struct AdapterContext {
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    pub credentials: Credentials,
}

impl AdapterContext {
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>, credentials: Credentials) -> Self {
        Self {
            transport,
            clock,
            credentials,
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn column(&self) -> RatingColumn;

    async fn fetch_ratings(
        &self,
        ctx: &AdapterContext,
        targets: &[ScrapeTarget],
    ) -> Result<Vec<RatingObservation>, AdapterError>;
}

fn retry_policy(max_attempts: u32, cooldown_secs: u64) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: BackoffPolicy::default(),
        cooldown: Duration::from_secs(cooldown_secs),
        ..RetryPolicy::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeforcesConfig {
    pub enabled: bool,
    pub base_url: String,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub min_interval_ms: u64,
}

impl Default for CodeforcesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://codeforces.com/api".to_string(),
            batch_size: 380,
            max_attempts: 10,
            min_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeetcodeConfig {
    pub enabled: bool,
    pub base_url: String,
    pub requests_per_second: u32,
    pub max_attempts: u32,
    pub cooldown_secs: u64,
    pub busy_statuses: Vec<u16>,
}

impl Default for LeetcodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://leetcode.com/graphql".to_string(),
            requests_per_second: 2,
            max_attempts: 3,
            cooldown_secs: 30,
            busy_statuses: vec![429, 524],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodechefConfig {
    pub enabled: bool,
    pub base_url: String,
    pub min_interval_ms: u64,
    pub max_attempts: u32,
    pub cooldown_secs: u64,
    pub busy_statuses: Vec<u16>,
}

impl Default for CodechefConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://code-chef-rating-api.vercel.app".to_string(),
            min_interval_ms: 0,
            max_attempts: 3,
            cooldown_secs: 30,
            busy_statuses: vec![500],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GfgContestConfig {
    pub enabled: bool,
    /// Leaderboard URL up to and including `page=`.
    pub base_url: String,
    pub page_ceiling: u32,
    pub floor_score: i64,
    pub max_attempts: u32,
    pub max_consecutive_failures: u32,
    pub min_interval_ms: u64,
}

impl Default for GfgContestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://practiceapi.geeksforgeeks.org/api/latest/events/recurring/gfg-weekly-coding-contest/leaderboard/?leaderboard_type=0&page=".to_string(),
            page_ceiling: 10_000,
            floor_score: 0,
            max_attempts: 3,
            max_consecutive_failures: 5,
            min_interval_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GfgPracticeConfig {
    pub enabled: bool,
    pub base_url: String,
    pub page_size: u32,
    pub page_ceiling: u32,
    pub max_attempts: u32,
    pub min_interval_ms: u64,
    pub profile_fallback: bool,
    pub profile_base_url: String,
    pub profile_min_interval_ms: u64,
}

impl Default for GfgPracticeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://practiceapi.geeksforgeeks.org/api/v1/institute/341/students/stats"
                .to_string(),
            page_size: 100_000,
            page_ceiling: 1,
            max_attempts: 3,
            min_interval_ms: 1000,
            profile_fallback: true,
            profile_base_url: "https://auth.geeksforgeeks.org/user".to_string(),
            profile_min_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HackerrankConfig {
    pub enabled: bool,
    pub base_url: String,
    pub trackers: Vec<String>,
    /// One tracker URL per line; read at scrape time and appended to `trackers`.
    pub tracker_file: Option<PathBuf>,
    pub page_size: u32,
    pub offset_ceiling: u32,
    pub max_attempts: u32,
    pub min_interval_ms: u64,
}

impl Default for HackerrankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://www.hackerrank.com/rest/contests".to_string(),
            trackers: Vec::new(),
            tracker_file: Some(PathBuf::from("config/hackerrank_urls.txt")),
            page_size: 100,
            offset_ceiling: 10_000,
            max_attempts: 3,
            min_interval_ms: 0,
        }
    }
}

/// Per-source settings carried as data, one variant per rating column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SourceConfig {
    Codeforces(CodeforcesConfig),
    GfgContest(GfgContestConfig),
    GfgPractice(GfgPracticeConfig),
    Leetcode(LeetcodeConfig),
    Codechef(CodechefConfig),
    Hackerrank(HackerrankConfig),
}

impl SourceConfig {
    pub fn default_for(column: RatingColumn) -> Self {
        match column {
            RatingColumn::Codeforces => SourceConfig::Codeforces(CodeforcesConfig::default()),
            RatingColumn::GfgContest => SourceConfig::GfgContest(GfgContestConfig::default()),
            RatingColumn::GfgPractice => SourceConfig::GfgPractice(GfgPracticeConfig::default()),
            RatingColumn::Leetcode => SourceConfig::Leetcode(LeetcodeConfig::default()),
            RatingColumn::Codechef => SourceConfig::Codechef(CodechefConfig::default()),
            RatingColumn::Hackerrank => SourceConfig::Hackerrank(HackerrankConfig::default()),
        }
    }

    pub fn column(&self) -> RatingColumn {
        match self {
            SourceConfig::Codeforces(_) => RatingColumn::Codeforces,
            SourceConfig::GfgContest(_) => RatingColumn::GfgContest,
            SourceConfig::GfgPractice(_) => RatingColumn::GfgPractice,
            SourceConfig::Leetcode(_) => RatingColumn::Leetcode,
            SourceConfig::Codechef(_) => RatingColumn::Codechef,
            SourceConfig::Hackerrank(_) => RatingColumn::Hackerrank,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            SourceConfig::Codeforces(c) => c.enabled,
            SourceConfig::GfgContest(c) => c.enabled,
            SourceConfig::GfgPractice(c) => c.enabled,
            SourceConfig::Leetcode(c) => c.enabled,
            SourceConfig::Codechef(c) => c.enabled,
            SourceConfig::Hackerrank(c) => c.enabled,
        }
    }
}

/// Ordered list of configured sources. The order is the order `all` scrapes in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub verifier: VerifierConfig,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        let order = [
            RatingColumn::Codechef,
            RatingColumn::Codeforces,
            RatingColumn::Leetcode,
            RatingColumn::GfgContest,
            RatingColumn::GfgPractice,
            RatingColumn::Hackerrank,
        ];
        Self {
            sources: order.into_iter().map(SourceConfig::default_for).collect(),
            verifier: VerifierConfig::default(),
        }
    }
}

impl SourceRegistry {
    /// The configured entry for `column`, or the built-in default when the registry
    /// does not mention it.
    pub fn config_for(&self, column: RatingColumn) -> SourceConfig {
        self.sources
            .iter()
            .find(|s| s.column() == column)
            .cloned()
            .unwrap_or_else(|| SourceConfig::default_for(column))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled())
    }
}

pub fn adapter_for_source(config: &SourceConfig) -> Box<dyn SourceAdapter> {
    match config {
        SourceConfig::Codeforces(c) => Box::new(CodeforcesAdapter::new(c.clone())),
        SourceConfig::GfgContest(c) => Box::new(GfgContestAdapter::new(c.clone())),
        SourceConfig::GfgPractice(c) => Box::new(GfgPracticeAdapter::new(c.clone())),
        SourceConfig::Leetcode(c) => Box::new(LeetcodeAdapter::new(c.clone())),
        SourceConfig::Codechef(c) => Box::new(CodechefAdapter::new(c.clone())),
        SourceConfig::Hackerrank(c) => Box::new(HackerrankAdapter::new(c.clone())),
    }
}

/// Consecutive chunks of at most `size` items, in input order.
pub fn split_into_batches<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(<[T]>::to_vec).collect()
}

/// `rand` followed by the hex SHA-512 of the canonical `user.info` call.
pub fn codeforces_api_sig(rand: &str, api_key: &str, handles: &str, time: i64, secret: &str) -> String {
    let to_hash = format!("{rand}/user.info?apiKey={api_key}&handles={handles}&time={time}#{secret}");
    let mut hasher = Sha512::new();
    hasher.update(to_hash.as_bytes());
    format!("{rand}{}", hex::encode(hasher.finalize()))
}

/// Contest slugs from a list of tracker URLs: the last path segment of each line.
/// A literal `null` ends the list.
pub fn parse_tracker_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for line in text.lines() {
        let line = line.trim().trim_end_matches('/');
        if line.is_empty() {
            continue;
        }
        let token = line.rsplit('/').next().unwrap_or(line).trim();
        if token == "null" {
            break;
        }
        if !token.is_empty() {
            tokens.push(token.to_string());
        }
    }
    tokens
}

/// Comparison key for platform identifiers: whitespace removed, lowercased.
fn identifier_key(raw: &str) -> String {
    raw.replace([' ', '\t'], "").to_lowercase()
}

/// Case-insensitive identifier lookup; one identifier may belong to several handles.
fn identifier_index(targets: &[ScrapeTarget]) -> HashMap<String, Vec<&ScrapeTarget>> {
    let mut index: HashMap<String, Vec<&ScrapeTarget>> = HashMap::new();
    for target in targets {
        index
            .entry(identifier_key(&target.identifier))
            .or_default()
            .push(target);
    }
    index
}

fn observe(
    out: &mut Vec<RatingObservation>,
    target: &ScrapeTarget,
    column: RatingColumn,
    rating: i64,
    total: usize,
) {
    let observation = RatingObservation::new(target, column, rating);
    info!(
        %column,
        handle = %observation.handle,
        identifier = %observation.identifier,
        rating,
        progress = %format!("{}/{}", out.len() + 1, total),
        "rating observed"
    );
    out.push(observation);
}

async fn send(ctx: &AdapterContext, request: &HttpRequest) -> Result<FetchedResponse, AttemptError> {
    ctx.transport
        .get(request)
        .await
        .map_err(|e| attempt_error_for_fetch(&e))
}

fn expect_success(response: FetchedResponse, busy: &[u16]) -> Result<FetchedResponse, AttemptError> {
    if response.status.is_success() {
        return Ok(response);
    }
    let reason = format!("HTTP {} from {}", response.status.as_u16(), response.final_url);
    Err(match classify_status(response.status, busy) {
        RetryDisposition::CoolDown => AttemptError::CoolDown(reason),
        RetryDisposition::Retryable => AttemptError::Transient(reason),
        RetryDisposition::NonRetryable => AttemptError::Fatal(reason),
    })
}

fn parse_body<T: serde::de::DeserializeOwned>(response: &FetchedResponse) -> Result<T, AttemptError> {
    serde_json::from_slice(&response.body)
        .map_err(|e| AttemptError::Fatal(format!("unexpected payload from {}: {e}", response.final_url)))
}

#[derive(Debug, Deserialize)]
struct CodeforcesEnvelope {
    status: String,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    result: Vec<CodeforcesUser>,
}

#[derive(Debug, Deserialize)]
struct CodeforcesUser {
    handle: String,
    #[serde(default)]
    rating: Option<i64>,
}

enum CodeforcesReply {
    Users(Vec<CodeforcesUser>),
    UnknownHandle(String),
}

fn unknown_handle_in(comment: &str) -> Option<String> {
    let rest = comment.split("User with handle ").nth(1)?;
    let handle = rest.split(" not found").next()?.trim();
    (!handle.is_empty()).then(|| handle.to_string())
}

/// Batch-capable signed `user.info` lookups.
#[derive(Debug, Clone)]
pub struct CodeforcesAdapter {
    config: CodeforcesConfig,
}

impl CodeforcesAdapter {
    pub fn new(config: CodeforcesConfig) -> Self {
        Self { config }
    }

    fn request_for(&self, ctx: &AdapterContext, handles: &str) -> HttpRequest {
        let mut url = format!(
            "{}/user.info?handles={}",
            self.config.base_url.trim_end_matches('/'),
            urlencoding::encode(handles)
        );
        if let (Some(key), Some(secret)) = (&ctx.credentials.codeforces_key, &ctx.credentials.codeforces_secret) {
            let time = chrono::Utc::now().timestamp();
            let rand: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(6)
                .map(char::from)
                .collect();
            let sig = codeforces_api_sig(&rand, key, handles, time, secret);
            url.push_str(&format!(
                "&apiKey={}&time={time}&apiSig={sig}",
                urlencoding::encode(key)
            ));
        }
        HttpRequest::get(url)
    }

    async fn fetch_batch(
        &self,
        ctx: &AdapterContext,
        controller: &RequestController,
        label: &str,
        handles: &str,
    ) -> Result<CodeforcesReply, RetryError> {
        controller
            .run(label, || async {
                // signature carries a timestamp, so every attempt is signed afresh
                let request = self.request_for(ctx, handles);
                let response = send(ctx, &request).await?;
                if response.status.is_server_error() {
                    return Err(AttemptError::Transient(format!("HTTP {}", response.status.as_u16())));
                }
                let envelope: CodeforcesEnvelope = serde_json::from_slice(&response.body)
                    .map_err(|e| AttemptError::Transient(format!("unreadable reply: {e}")))?;
                if envelope.status == "OK" {
                    return Ok(CodeforcesReply::Users(envelope.result));
                }
                let comment = envelope.comment.unwrap_or_default();
                match unknown_handle_in(&comment) {
                    Some(handle) => Ok(CodeforcesReply::UnknownHandle(handle)),
                    None => Err(AttemptError::Transient(format!("{}: {comment}", envelope.status))),
                }
            })
            .await
    }
}

#[async_trait]
impl SourceAdapter for CodeforcesAdapter {
    fn column(&self) -> RatingColumn {
        RatingColumn::Codeforces
    }

    async fn fetch_ratings(
        &self,
        ctx: &AdapterContext,
        targets: &[ScrapeTarget],
    ) -> Result<Vec<RatingObservation>, AdapterError> {
        let controller = RequestController::new(
            retry_policy(self.config.max_attempts, 0),
            RequestSpacer::new(Duration::from_millis(self.config.min_interval_ms)),
            ctx.clock.clone(),
        );
        let column = self.column();
        let mut out = Vec::new();

        for (idx, batch) in split_into_batches(targets, self.config.batch_size).into_iter().enumerate() {
            let label = format!("codeforces batch {}", idx + 1);
            let mut live: Vec<ScrapeTarget> = batch;
            loop {
                if live.is_empty() {
                    break;
                }
                let handles = live
                    .iter()
                    .map(|t| t.identifier.replace([' ', '\t'], ""))
                    .collect::<Vec<_>>()
                    .join(";");
                debug!(%label, size = live.len(), "requesting batch");
                match self.fetch_batch(ctx, &controller, &label, &handles).await? {
                    CodeforcesReply::UnknownHandle(unknown) => {
                        let unknown_key = identifier_key(&unknown);
                        let before = live.len();
                        live.retain(|t| {
                            let dropped = identifier_key(&t.identifier) == unknown_key;
                            if dropped {
                                warn!(handle = %t.handle, identifier = %t.identifier, reason = "not found", "skipped");
                            }
                            !dropped
                        });
                        if live.len() == before {
                            return Err(AdapterError::Malformed {
                                column,
                                reason: format!("platform rejected `{unknown}` which was not in the batch"),
                            });
                        }
                    }
                    CodeforcesReply::Users(users) => {
                        let index = identifier_index(&live);
                        let mut resolved: HashSet<String> = HashSet::new();
                        for user in users {
                            let key = identifier_key(&user.handle);
                            for target in index.get(&key).into_iter().flatten() {
                                observe(&mut out, target, column, user.rating.unwrap_or(0), targets.len());
                            }
                            resolved.insert(key);
                        }
                        for target in &live {
                            if !resolved.contains(&identifier_key(&target.identifier)) {
                                warn!(handle = %target.handle, identifier = %target.identifier, reason = "missing from OK reply", "skipped");
                            }
                        }
                        break;
                    }
                }
            }
        }
        Ok(out)
    }
}

pub fn leetcode_query_url(base_url: &str, username: &str) -> String {
    let query = format!("query{{userContestRanking(username:\"{username}\"){{rating}}}}");
    format!("{base_url}?query={}", urlencoding::encode(&query))
}

#[derive(Debug, Deserialize)]
struct LeetcodeEnvelope {
    #[serde(default)]
    data: Option<LeetcodeData>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeetcodeData {
    #[serde(default)]
    user_contest_ranking: Option<LeetcodeRanking>,
}

#[derive(Debug, Deserialize)]
struct LeetcodeRanking {
    rating: f64,
}

/// Per-identifier GraphQL lookups, self-throttled.
#[derive(Debug, Clone)]
pub struct LeetcodeAdapter {
    config: LeetcodeConfig,
}

impl LeetcodeAdapter {
    pub fn new(config: LeetcodeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SourceAdapter for LeetcodeAdapter {
    fn column(&self) -> RatingColumn {
        RatingColumn::Leetcode
    }

    async fn fetch_ratings(
        &self,
        ctx: &AdapterContext,
        targets: &[ScrapeTarget],
    ) -> Result<Vec<RatingObservation>, AdapterError> {
        let controller = RequestController::new(
            retry_policy(self.config.max_attempts, self.config.cooldown_secs),
            RequestSpacer::per_second(self.config.requests_per_second),
            ctx.clock.clone(),
        );
        let column = self.column();
        let mut out = Vec::new();

        for target in targets {
            let mut request = HttpRequest::get(leetcode_query_url(&self.config.base_url, target.identifier.trim()))
                .header("Referer", "https://leetcode.com");
            if let Some(session) = &ctx.credentials.leetcode_session {
                request = request.header("Cookie", format!("LEETCODE_SESSION={session}"));
            }
            let label = format!("leetcode {}", target.handle);
            let outcome = controller
                .run(&label, || async {
                    let response = expect_success(send(ctx, &request).await?, &self.config.busy_statuses)?;
                    let envelope: LeetcodeEnvelope = parse_body(&response)?;
                    if envelope.errors.is_some() {
                        return Ok(None);
                    }
                    let rating = envelope
                        .data
                        .and_then(|d| d.user_contest_ranking)
                        .map(|r| r.rating.trunc() as i64)
                        .unwrap_or(0);
                    Ok::<_, AttemptError>(Some(rating))
                })
                .await;
            match outcome {
                Ok(Some(rating)) => observe(&mut out, target, column, rating, targets.len()),
                Ok(None) => warn!(handle = %target.handle, identifier = %target.identifier, reason = "not found", "skipped"),
                Err(err) => warn!(handle = %target.handle, identifier = %target.identifier, reason = %err, "skipped"),
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodechefProfile {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    current_rating: Option<i64>,
}

fn default_true() -> bool {
    true
}

/// Per-identifier profile lookups with a server-busy cool-down.
#[derive(Debug, Clone)]
pub struct CodechefAdapter {
    config: CodechefConfig,
}

impl CodechefAdapter {
    pub fn new(config: CodechefConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SourceAdapter for CodechefAdapter {
    fn column(&self) -> RatingColumn {
        RatingColumn::Codechef
    }

    async fn fetch_ratings(
        &self,
        ctx: &AdapterContext,
        targets: &[ScrapeTarget],
    ) -> Result<Vec<RatingObservation>, AdapterError> {
        let controller = RequestController::new(
            retry_policy(self.config.max_attempts, self.config.cooldown_secs),
            RequestSpacer::new(Duration::from_millis(self.config.min_interval_ms)),
            ctx.clock.clone(),
        );
        let column = self.column();
        let mut out = Vec::new();

        for target in targets {
            let identifier = target.identifier.replace(' ', "");
            let request = HttpRequest::get(format!(
                "{}/{}",
                self.config.base_url.trim_end_matches('/'),
                urlencoding::encode(&identifier)
            ));
            let label = format!("codechef {}", target.handle);
            let outcome = controller
                .run(&label, || async {
                    let response = send(ctx, &request).await?;
                    if response.status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    let response = expect_success(response, &self.config.busy_statuses)?;
                    let profile: CodechefProfile = parse_body(&response)?;
                    if !profile.success {
                        return Ok(None);
                    }
                    profile
                        .current_rating
                        .map(Some)
                        .ok_or_else(|| AttemptError::Fatal("reply carries no currentRating".to_string()))
                })
                .await;
            match outcome {
                Ok(Some(rating)) => observe(&mut out, target, column, rating, targets.len()),
                Ok(None) => warn!(handle = %target.handle, identifier = %target.identifier, reason = "not found", "skipped"),
                Err(err) => warn!(handle = %target.handle, identifier = %target.identifier, reason = %err, "skipped"),
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Deserialize)]
struct GfgLeaderboardPage {
    #[serde(default)]
    results: Vec<GfgLeaderboardEntry>,
}

#[derive(Debug, Deserialize)]
struct GfgLeaderboardEntry {
    user_handle: String,
    user_score: f64,
}

/// Global weekly-contest leaderboard scan, descending by score.
#[derive(Debug, Clone)]
pub struct GfgContestAdapter {
    config: GfgContestConfig,
}

impl GfgContestAdapter {
    pub fn new(config: GfgContestConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SourceAdapter for GfgContestAdapter {
    fn column(&self) -> RatingColumn {
        RatingColumn::GfgContest
    }

    async fn fetch_ratings(
        &self,
        ctx: &AdapterContext,
        targets: &[ScrapeTarget],
    ) -> Result<Vec<RatingObservation>, AdapterError> {
        let controller = RequestController::new(
            retry_policy(self.config.max_attempts, 0),
            RequestSpacer::new(Duration::from_millis(self.config.min_interval_ms)),
            ctx.clock.clone(),
        );
        let column = self.column();
        let index = identifier_index(targets);
        let mut out = Vec::new();
        let mut consecutive_failures = 0u32;

        for page in 1..=self.config.page_ceiling {
            let request = HttpRequest::get(format!("{}{page}", self.config.base_url));
            let label = format!("gfg contest page {page}");
            let outcome = controller
                .run(&label, || async {
                    let response = expect_success(send(ctx, &request).await?, &[])?;
                    parse_body::<GfgLeaderboardPage>(&response)
                })
                .await;
            let entries = match outcome {
                Ok(page) => {
                    consecutive_failures = 0;
                    page.results
                }
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(page, reason = %err, "leaderboard page skipped");
                    if consecutive_failures >= self.config.max_consecutive_failures.max(1) {
                        warn!(page, consecutive_failures, "giving up on leaderboard scan");
                        break;
                    }
                    continue;
                }
            };
            if entries.is_empty() {
                debug!(page, "empty leaderboard page; scan complete");
                break;
            }

            let mut reached_floor = false;
            for entry in entries {
                if entry.user_score <= self.config.floor_score as f64 {
                    reached_floor = true;
                    break;
                }
                let key = identifier_key(&entry.user_handle);
                for target in index.get(&key).into_iter().flatten() {
                    observe(&mut out, target, column, entry.user_score.trunc() as i64, targets.len());
                }
            }
            if reached_floor {
                debug!(page, floor = self.config.floor_score, "score floor reached; scan complete");
                break;
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Deserialize)]
struct GfgInstitutePage {
    #[serde(default)]
    results: Vec<GfgInstituteEntry>,
}

#[derive(Debug, Deserialize)]
struct GfgInstituteEntry {
    handle: String,
    #[serde(default)]
    coding_score: Option<f64>,
}

/// Secondary lookup for identifiers the bulk endpoint did not cover.
#[async_trait]
pub trait ProfileResolver: Send + Sync {
    async fn resolve(&self, ctx: &AdapterContext, target: &ScrapeTarget) -> Result<Option<i64>, AdapterError>;
}

/// Extracts the number shown next to the "Overall Coding Score" label of a profile page.
pub fn parse_overall_coding_score(html: &str) -> Option<i64> {
    let document = Html::parse_document(html);
    let spans = Selector::parse("span").ok()?;
    let label = document
        .select(&spans)
        .find(|el| el.text().collect::<String>().contains("Overall Coding Score"))?;
    let value = label
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "span")?;
    value
        .text()
        .collect::<String>()
        .trim()
        .replace(',', "")
        .parse()
        .ok()
}

/// Fetches profile pages with the caller's session cookie.
#[derive(Debug)]
pub struct GfgProfileResolver {
    profile_base_url: String,
    controller: RequestController,
}

impl GfgProfileResolver {
    pub fn new(config: &GfgPracticeConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            profile_base_url: config.profile_base_url.trim_end_matches('/').to_string(),
            controller: RequestController::new(
                retry_policy(config.max_attempts, 0),
                RequestSpacer::new(Duration::from_millis(config.profile_min_interval_ms)),
                clock,
            ),
        }
    }
}

#[async_trait]
impl ProfileResolver for GfgProfileResolver {
    async fn resolve(&self, ctx: &AdapterContext, target: &ScrapeTarget) -> Result<Option<i64>, AdapterError> {
        let mut request = HttpRequest::get(format!(
            "{}/{}",
            self.profile_base_url,
            urlencoding::encode(target.identifier.trim())
        ));
        if let Some(session) = &ctx.credentials.gfg_session {
            request = request.header("Cookie", session.clone());
        }
        let label = format!("gfg profile {}", target.handle);
        let body = self
            .controller
            .run(&label, || async {
                let response = send(ctx, &request).await?;
                if response.status == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                Ok::<_, AttemptError>(Some(expect_success(response, &[])?.text()))
            })
            .await?;
        let Some(body) = body else {
            return Ok(None);
        };
        parse_overall_coding_score(&body)
            .map(Some)
            .ok_or_else(|| AdapterError::Malformed {
                column: RatingColumn::GfgPractice,
                reason: format!("no coding score on profile page of {}", target.identifier),
            })
    }
}

/// Institute stats endpoint first, profile pages for whatever it left unresolved.
#[derive(Clone)]
pub struct GfgPracticeAdapter {
    config: GfgPracticeConfig,
    resolver: Option<Arc<dyn ProfileResolver>>,
}

impl GfgPracticeAdapter {
    pub fn new(config: GfgPracticeConfig) -> Self {
        Self {
            config,
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ProfileResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    async fn primary(
        &self,
        ctx: &AdapterContext,
        targets: &[ScrapeTarget],
        out: &mut Vec<RatingObservation>,
    ) {
        let controller = RequestController::new(
            retry_policy(self.config.max_attempts, 0),
            RequestSpacer::new(Duration::from_millis(self.config.min_interval_ms)),
            ctx.clock.clone(),
        );
        let index = identifier_index(targets);

        for page in 1..=self.config.page_ceiling {
            let request = HttpRequest::get(format!(
                "{}?page_size={}&page={page}",
                self.config.base_url, self.config.page_size
            ));
            let label = format!("gfg practice page {page}");
            let outcome = controller
                .run(&label, || async {
                    let response = send(ctx, &request).await?;
                    if response.status == StatusCode::NOT_FOUND || response.status == StatusCode::BAD_REQUEST {
                        return Ok(None);
                    }
                    let response = expect_success(response, &[])?;
                    parse_body::<GfgInstitutePage>(&response).map(Some)
                })
                .await;
            let entries = match outcome {
                Ok(Some(page)) => page.results,
                Ok(None) => {
                    debug!(page, "institute stats exhausted");
                    break;
                }
                Err(err) => {
                    warn!(page, reason = %err, "institute stats page skipped");
                    continue;
                }
            };
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                let key = identifier_key(&entry.handle);
                let Some(matched) = index.get(&key) else {
                    continue;
                };
                let Some(score) = entry.coding_score else {
                    for target in matched {
                        warn!(handle = %target.handle, identifier = %target.identifier, reason = "no coding_score", "left for profile lookup");
                    }
                    continue;
                };
                for target in matched {
                    if !out.iter().any(|o| o.handle == target.handle) {
                        observe(out, target, self.column(), score as i64, targets.len());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for GfgPracticeAdapter {
    fn column(&self) -> RatingColumn {
        RatingColumn::GfgPractice
    }

    async fn fetch_ratings(
        &self,
        ctx: &AdapterContext,
        targets: &[ScrapeTarget],
    ) -> Result<Vec<RatingObservation>, AdapterError> {
        let mut out = Vec::new();
        self.primary(ctx, targets, &mut out).await;

        let unresolved: Vec<&ScrapeTarget> = targets
            .iter()
            .filter(|t| !out.iter().any(|o| o.handle == t.handle))
            .collect();
        if unresolved.is_empty() || !self.config.profile_fallback {
            return Ok(out);
        }

        let resolver: Arc<dyn ProfileResolver> = match &self.resolver {
            Some(resolver) => resolver.clone(),
            None => Arc::new(GfgProfileResolver::new(&self.config, ctx.clock.clone())),
        };
        info!(unresolved = unresolved.len(), "resolving remaining practice scores from profiles");
        let span = info_span!("profile_fallback");
        async {
            for target in unresolved {
                match resolver.resolve(ctx, target).await {
                    Ok(Some(score)) => observe(&mut out, target, RatingColumn::GfgPractice, score, targets.len()),
                    Ok(None) => warn!(handle = %target.handle, identifier = %target.identifier, reason = "not found", "skipped"),
                    Err(err) => warn!(handle = %target.handle, identifier = %target.identifier, reason = %err, "skipped"),
                }
            }
        }
        .instrument(span)
        .await;
        Ok(out)
    }
}

#[derive(Debug, Deserialize)]
struct HackerrankPage {
    #[serde(default)]
    models: Vec<HackerrankModel>,
}

#[derive(Debug, Deserialize)]
struct HackerrankModel {
    hacker: String,
    score: f64,
}

enum TrackerPage {
    Models(Vec<HackerrankModel>),
    Invalid,
}

/// Sums leaderboard scores across every configured contest tracker.
#[derive(Debug, Clone)]
pub struct HackerrankAdapter {
    config: HackerrankConfig,
}

impl HackerrankAdapter {
    pub fn new(config: HackerrankConfig) -> Self {
        Self { config }
    }

    fn trackers(&self) -> anyhow::Result<Vec<String>> {
        let mut trackers = self.config.trackers.clone();
        if let Some(path) = &self.config.tracker_file {
            match std::fs::read_to_string(path) {
                Ok(text) => trackers.extend(parse_tracker_tokens(&text)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "no tracker file");
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("reading tracker file {}", path.display()));
                }
            }
        }
        let mut seen = HashSet::new();
        trackers.retain(|t| seen.insert(t.clone()));
        Ok(trackers)
    }
}

#[async_trait]
impl SourceAdapter for HackerrankAdapter {
    fn column(&self) -> RatingColumn {
        RatingColumn::Hackerrank
    }

    async fn fetch_ratings(
        &self,
        ctx: &AdapterContext,
        targets: &[ScrapeTarget],
    ) -> Result<Vec<RatingObservation>, AdapterError> {
        let trackers = self.trackers()?;
        if trackers.is_empty() {
            warn!("no hackerrank trackers configured");
        }
        let controller = RequestController::new(
            retry_policy(self.config.max_attempts, 0),
            RequestSpacer::new(Duration::from_millis(self.config.min_interval_ms)),
            ctx.clock.clone(),
        );
        let index = identifier_index(targets);
        let mut totals: BTreeMap<String, i64> = BTreeMap::new();
        let step = self.config.page_size.max(1);

        for tracker in &trackers {
            let mut offset = 0u32;
            while offset < self.config.offset_ceiling {
                let request = HttpRequest::get(format!(
                    "{}/{tracker}/leaderboard?offset={offset}&limit={step}",
                    self.config.base_url.trim_end_matches('/')
                ));
                let label = format!("hackerrank {tracker} offset {offset}");
                let outcome = controller
                    .run(&label, || async {
                        let response = send(ctx, &request).await?;
                        if response.text().contains("INVALID URL") {
                            return Ok(TrackerPage::Invalid);
                        }
                        let response = expect_success(response, &[])?;
                        parse_body::<HackerrankPage>(&response).map(|p| TrackerPage::Models(p.models))
                    })
                    .await;
                offset += step;
                let models = match outcome {
                    Ok(TrackerPage::Models(models)) => models,
                    Ok(TrackerPage::Invalid) => {
                        warn!(%tracker, reason = "INVALID URL", "tracker abandoned");
                        break;
                    }
                    Err(err) => {
                        warn!(%tracker, reason = %err, "tracker page skipped");
                        continue;
                    }
                };
                if models.is_empty() {
                    break;
                }
                for model in models {
                    let key = identifier_key(&model.hacker);
                    if index.contains_key(&key) {
                        debug!(%tracker, hacker = %model.hacker, score = model.score, "tracker placement");
                        *totals.entry(key).or_insert(0) += model.score as i64;
                    }
                }
            }
        }

        let column = self.column();
        let mut out = Vec::new();
        for target in targets {
            match totals.get(&identifier_key(&target.identifier)) {
                Some(&rating) => observe(&mut out, target, column, rating, targets.len()),
                None => warn!(handle = %target.handle, identifier = %target.identifier, reason = "absent from every tracker", "skipped"),
            }
        }
        Ok(out)
    }
}

/// Where `verify_handles` looks for public profiles, and how hard it tries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub codeforces_profile_url: String,
    pub gfg_profile_url: String,
    pub leetcode_graphql_url: String,
    pub codechef_profile_url: String,
    pub hackerrank_profile_url: String,
    pub requests_per_second: u32,
    pub max_attempts: u32,
    pub cooldown_secs: u64,
    pub busy_statuses: Vec<u16>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            codeforces_profile_url: "https://codeforces.com/profile".to_string(),
            gfg_profile_url: "https://auth.geeksforgeeks.org/user".to_string(),
            leetcode_graphql_url: "https://leetcode.com/graphql".to_string(),
            codechef_profile_url: "https://www.codechef.com/users".to_string(),
            hackerrank_profile_url: "https://www.hackerrank.com/profile".to_string(),
            requests_per_second: 2,
            max_attempts: 2,
            cooldown_secs: 30,
            busy_statuses: vec![429, 524],
        }
    }
}

/// Roster identifier cleaned for lookups: control and non-ASCII characters dropped,
/// `@` removed on LeetCode and HackerRank, surrounding whitespace trimmed.
pub fn sanitize_identifier(platform: Platform, raw: &str) -> Option<String> {
    let strip_at = matches!(platform, Platform::Leetcode | Platform::Hackerrank);
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .filter(|c| !(strip_at && *c == '@'))
        .collect();
    let cleaned = cleaned.trim();
    (!cleaned.is_empty() && cleaned != "#N/A").then(|| cleaned.to_string())
}

/// A profile that redirects anywhere else (a landing or login page) does not exist.
fn lands_on_profile(final_url: &str, identifier: &str) -> bool {
    let path = final_url.split(['?', '#']).next().unwrap_or(final_url);
    let last = path.trim_end_matches('/').rsplit('/').next().unwrap_or(path);
    last.eq_ignore_ascii_case(&urlencoding::encode(identifier))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleCheck {
    pub handle: String,
    pub identifier: String,
    pub exists: bool,
}

/// Existence checks against each platform's public profile page (LeetCode: GraphQL).
#[derive(Debug, Clone)]
pub struct HandleVerifier {
    config: VerifierConfig,
}

impl HandleVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    pub fn profile_request(&self, platform: Platform, identifier: &str) -> HttpRequest {
        let base = match platform {
            Platform::Codeforces => &self.config.codeforces_profile_url,
            Platform::Geeksforgeeks => &self.config.gfg_profile_url,
            Platform::Codechef => &self.config.codechef_profile_url,
            Platform::Hackerrank => &self.config.hackerrank_profile_url,
            Platform::Leetcode => {
                return HttpRequest::get(leetcode_query_url(&self.config.leetcode_graphql_url, identifier))
                    .header("Referer", "https://leetcode.com");
            }
        };
        HttpRequest::get(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            urlencoding::encode(identifier)
        ))
    }

    fn profile_found(platform: Platform, identifier: &str, response: &FetchedResponse) -> Result<bool, AttemptError> {
        match platform {
            Platform::Leetcode => {
                let envelope: LeetcodeEnvelope = parse_body(response)?;
                Ok(envelope.errors.is_none())
            }
            _ => Ok(lands_on_profile(&response.final_url, identifier)),
        }
    }

    /// One check per target, in order. A check that exhausts its retries counts as missing.
    pub async fn verify(&self, ctx: &AdapterContext, platform: Platform, targets: &[ScrapeTarget]) -> Vec<HandleCheck> {
        let span = info_span!("verify_handles", %platform, targets = targets.len());
        async move {
            let controller = RequestController::new(
                retry_policy(self.config.max_attempts, self.config.cooldown_secs),
                RequestSpacer::per_second(self.config.requests_per_second),
                ctx.clock.clone(),
            );
            let mut checks = Vec::with_capacity(targets.len());
            for target in targets {
                let request = self.profile_request(platform, &target.identifier);
                let label = format!("verify {platform} {}", target.handle);
                let outcome = controller
                    .run(&label, || async {
                        let response = send(ctx, &request).await?;
                        if response.status == StatusCode::NOT_FOUND {
                            return Ok(false);
                        }
                        let response = expect_success(response, &self.config.busy_statuses)?;
                        Self::profile_found(platform, &target.identifier, &response)
                    })
                    .await;
                let exists = match outcome {
                    Ok(exists) => exists,
                    Err(err) => {
                        warn!(handle = %target.handle, identifier = %target.identifier, reason = %err, "check failed, marking missing");
                        false
                    }
                };
                debug!(handle = %target.handle, identifier = %target.identifier, exists, "handle checked");
                checks.push(HandleCheck {
                    handle: target.handle.clone(),
                    identifier: target.identifier.clone(),
                    exists,
                });
            }
            info!(
                found = checks.iter().filter(|c| c.exists).count(),
                checked = checks.len(),
                "platform verified"
            );
            checks
        }
        .instrument(span)
        .await
    }
}
