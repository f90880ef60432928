//! Persistence and transport plumbing for CRP: the provider HTTP client with
//! retry/backoff, content-addressed raw-payload snapshots, and the journal /
//! run / config / report stores with in-memory and Postgres backends.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crp_core::{
    ProviderConnection, ReportRecord, RunRecord, RunStatus, StepRecord, StepStatus,
    WorkflowConfig, WorkflowParams,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub use sqlx::PgPool;

/// Store-layer failure. `Corrupt` covers values that persisted fine but no
/// longer parse (enum tokens, params JSON).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt stored value for {context}: {message}")]
    Corrupt { context: String, message: String },
}

impl StoreError {
    fn corrupt(context: impl Into<String>, err: impl fmt::Display) -> Self {
        StoreError::Corrupt {
            context: context.into(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable store for raw provider response bodies, addressed by content
/// hash under one directory per provider. Identical payloads fetched twice
/// resolve to the same file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
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

    pub fn snapshot_relative_path(provider: &str, content_hash: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(provider).join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably via a temp file and an atomic rename. Returns
    /// `deduplicated = true` when an identical payload was already on disk.
    pub async fn store_bytes(
        &self,
        provider: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::snapshot_relative_path(provider, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .map(|p| p.join(&temp_name))
            .unwrap_or_else(|| PathBuf::from(&temp_name));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredSnapshot {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp snapshot {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx and 429 are worth retrying; everything else (auth failures, bad
/// requests) will not improve on its own.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
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
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_provider_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_provider_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
enum Payload {
    Get,
    Json(Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
enum RequestAuth {
    None,
    Bearer(String),
}

/// One provider API call, built by the adapters and executed by
/// [`ProviderClient`]. Rebuilt per retry attempt.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    url: String,
    payload: Payload,
    auth: RequestAuth,
    headers: Vec<(&'static str, String)>,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            payload: Payload::Get,
            auth: RequestAuth::None,
            headers: Vec::new(),
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            payload: Payload::Json(body),
            auth: RequestAuth::None,
            headers: Vec::new(),
        }
    }

    pub fn post_form(url: impl Into<String>, fields: &[(&str, &str)]) -> Self {
        Self {
            url: url.into(),
            payload: Payload::Form(
                fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            auth: RequestAuth::None,
            headers: Vec::new(),
        }
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.auth = RequestAuth::Bearer(token.into());
        self
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Status code of the upstream rejection, if this failure carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Shared HTTP client for all provider traffic. Bounds concurrency globally
/// and per provider, retries transient failures with capped exponential
/// backoff, and snapshots successful bodies when a [`SnapshotStore`] is
/// attached. The per-request timeout always comes from config.
#[derive(Debug)]
pub struct ProviderClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_provider_limit: usize,
    per_provider: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
    snapshots: Option<SnapshotStore>,
}

impl ProviderClient {
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_provider_limit: config.per_provider_concurrency.max(1),
            per_provider: Mutex::new(HashMap::new()),
            backoff: config.backoff,
            snapshots: None,
        })
    }

    pub fn with_snapshots(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    async fn per_provider_semaphore(&self, provider: &str) -> Arc<Semaphore> {
        let mut map = self.per_provider.lock().await;
        map.entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_limit)))
            .clone()
    }

    fn build_request(&self, request: &ApiRequest) -> reqwest::RequestBuilder {
        let mut builder = match &request.payload {
            Payload::Get => self.client.get(&request.url),
            Payload::Json(body) => self.client.post(&request.url).json(body),
            Payload::Form(fields) => self.client.post(&request.url).form(fields),
        };
        builder = match &request.auth {
            RequestAuth::None => builder,
            RequestAuth::Bearer(token) => builder.bearer_auth(token),
        };
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        builder
    }

    pub async fn execute(
        &self,
        run_id: Uuid,
        provider: &str,
        request: &ApiRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_provider = self.per_provider_semaphore(provider).await;
        let _provider = per_provider.acquire().await.expect("semaphore not closed");

        // The span has to ride the future rather than an entered guard: these
        // futures cross spawn boundaries and must stay Send.
        let span = info_span!("provider_call", %run_id, provider, url = request.url.as_str());
        async {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                match self.build_request(request).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            if let Some(snapshots) = &self.snapshots {
                                if let Err(err) =
                                    snapshots.store_bytes(provider, "json", &body).await
                                {
                                    warn!(provider, error = %err, "failed to snapshot response body");
                                }
                            }
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(provider, status = status.as_u16(), attempt, "retrying provider call");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(provider, attempt, error = %err, "retrying provider call");
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }

            Err(FetchError::Request(
                last_request_error.expect("retry loop should capture a request error"),
            ))
        }
        .instrument(span)
        .await
    }

    /// Execute and decode the JSON body in one go.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        provider: &str,
        request: &ApiRequest,
    ) -> Result<T, FetchError> {
        self.execute(run_id, provider, request).await?.json()
    }
}

/// Durable step journal keyed by `(run_id, step_name)`. Consulted before
/// every step execution; the upsert must tolerate concurrent writers.
#[async_trait]
pub trait JournalStore: Send + Sync {
    async fn journal(&self, run_id: Uuid) -> Result<Vec<StepRecord>, StoreError>;
    async fn upsert(&self, run_id: Uuid, entry: &StepRecord) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, run: &RunRecord) -> Result<(), StoreError>;
    async fn run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError>;
    async fn set_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn insert(&self, report: &ReportRecord) -> Result<(), StoreError>;
}

/// Workflow configs and provider connections, as managed outside the
/// pipeline; the pipeline reads them at trigger time and advances the
/// schedule at completion.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn workflow_config(&self, user_id: &str) -> Result<Option<WorkflowConfig>, StoreError>;
    async fn due_configs(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowConfig>, StoreError>;
    async fn connections(&self, user_id: &str) -> Result<Vec<ProviderConnection>, StoreError>;
    async fn advance_next_run(
        &self,
        user_id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
    async fn set_next_run(
        &self,
        user_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryJournalStore {
    entries: Mutex<HashMap<Uuid, BTreeMap<String, StepRecord>>>,
}

impl MemoryJournalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JournalStore for MemoryJournalStore {
    async fn journal(&self, run_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(&run_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert(&self, run_id: Uuid, entry: &StepRecord) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries
            .entry(run_id)
            .or_default()
            .insert(entry.step.clone(), entry.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<Uuid, RunRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, run: &RunRecord) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        runs.entry(run.run_id).or_insert_with(|| run.clone());
        Ok(())
    }

    async fn run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.runs.lock().await.get(&run_id).cloned())
    }

    async fn set_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        if let Some(run) = runs.get_mut(&run_id) {
            run.status = status;
            run.updated_at = at;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryReportStore {
    reports: Mutex<Vec<ReportRecord>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<ReportRecord> {
        self.reports.lock().await.clone()
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn insert(&self, report: &ReportRecord) -> Result<(), StoreError> {
        self.reports.lock().await.push(report.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    configs: Mutex<HashMap<String, WorkflowConfig>>,
    connections: Mutex<Vec<ProviderConnection>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_config(&self, config: WorkflowConfig) {
        self.configs
            .lock()
            .await
            .insert(config.user_id.clone(), config);
    }

    pub async fn put_connection(&self, connection: ProviderConnection) {
        self.connections.lock().await.push(connection);
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn workflow_config(&self, user_id: &str) -> Result<Option<WorkflowConfig>, StoreError> {
        Ok(self.configs.lock().await.get(user_id).cloned())
    }

    async fn due_configs(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowConfig>, StoreError> {
        Ok(self
            .configs
            .lock()
            .await
            .values()
            .filter(|c| c.enabled && c.next_run_at.map(|at| at <= now).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn connections(&self, user_id: &str) -> Result<Vec<ProviderConnection>, StoreError> {
        Ok(self
            .connections
            .lock()
            .await
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn advance_next_run(
        &self,
        user_id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut configs = self.configs.lock().await;
        if let Some(config) = configs.get_mut(user_id) {
            config.last_run_at = Some(last_run_at);
            config.next_run_at = next_run_at;
        }
        Ok(())
    }

    async fn set_next_run(
        &self,
        user_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut configs = self.configs.lock().await;
        if let Some(config) = configs.get_mut(user_id) {
            config.next_run_at = Some(next_run_at);
        }
        Ok(())
    }
}

pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgJournalStore {
    pool: PgPool,
}

impl PgJournalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JournalStore for PgJournalStore {
    async fn journal(&self, run_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT step_name, status, result, error, attempts, updated_at
              FROM workflow_steps
             WHERE run_id = $1
             ORDER BY step_name
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let status = match status.as_str() {
                "completed" => StepStatus::Completed,
                "failed" => StepStatus::Failed,
                other => return Err(StoreError::corrupt("workflow_steps.status", other)),
            };
            let attempts: i32 = row.try_get("attempts")?;
            entries.push(StepRecord {
                step: row.try_get("step_name")?,
                status,
                result: row.try_get::<Option<Value>, _>("result")?,
                error: row.try_get("error")?,
                attempts: attempts.max(0) as u32,
                updated_at: row.try_get("updated_at")?,
            });
        }
        Ok(entries)
    }

    async fn upsert(&self, run_id: Uuid, entry: &StepRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_steps (run_id, step_name, status, result, error, attempts, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (run_id, step_name) DO UPDATE
               SET status = EXCLUDED.status,
                   result = EXCLUDED.result,
                   error = EXCLUDED.error,
                   attempts = EXCLUDED.attempts,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(run_id)
        .bind(&entry.step)
        .bind(entry.status.as_str())
        .bind(&entry.result)
        .bind(&entry.error)
        .bind(entry.attempts as i32)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn create(&self, run: &RunRecord) -> Result<(), StoreError> {
        let params = serde_json::to_value(&run.params)
            .map_err(|err| StoreError::corrupt("workflow_runs.params", err))?;
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (run_id, user_id, params, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run.run_id)
        .bind(&run.user_id)
        .bind(params)
        .bind(run.status.as_str())
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT run_id, user_id, params, status, created_at, updated_at
              FROM workflow_runs
             WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status")?;
        let status = status
            .parse::<RunStatus>()
            .map_err(|err| StoreError::corrupt("workflow_runs.status", err))?;
        let params: Value = row.try_get("params")?;
        let params: WorkflowParams = serde_json::from_value(params)
            .map_err(|err| StoreError::corrupt("workflow_runs.params", err))?;

        Ok(Some(RunRecord {
            run_id: row.try_get("run_id")?,
            user_id: row.try_get("user_id")?,
            params,
            status,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn set_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_runs
               SET status = $2,
                   updated_at = $3
             WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn insert(&self, report: &ReportRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reports (id, user_id, run_id, content, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&report.id)
        .bind(&report.user_id)
        .bind(report.run_id)
        .bind(&report.content)
        .bind(report.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgConfigStore {
    pool: PgPool,
}

impl PgConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn config_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowConfig, StoreError> {
        let crm_provider: Option<String> = row.try_get("crm_provider")?;
        let crm_provider = crm_provider
            .map(|p| {
                p.parse()
                    .map_err(|err| StoreError::corrupt("workflow_configs.crm_provider", err))
            })
            .transpose()?;
        let support_provider: String = row.try_get("support_provider")?;
        let support_provider = support_provider
            .parse()
            .map_err(|err| StoreError::corrupt("workflow_configs.support_provider", err))?;
        let report_frequency: String = row.try_get("report_frequency")?;
        let report_frequency = report_frequency
            .parse()
            .map_err(|err| StoreError::corrupt("workflow_configs.report_frequency", err))?;
        let report_destination: String = row.try_get("report_destination")?;
        let report_destination = report_destination
            .parse()
            .map_err(|err| StoreError::corrupt("workflow_configs.report_destination", err))?;

        Ok(WorkflowConfig {
            user_id: row.try_get("user_id")?,
            crm_provider,
            support_provider,
            report_frequency,
            report_destination,
            destination_config: row.try_get("destination_config")?,
            enabled: row.try_get("enabled")?,
            last_run_at: row.try_get("last_run_at")?,
            next_run_at: row.try_get("next_run_at")?,
        })
    }
}

#[async_trait]
impl ConfigStore for PgConfigStore {
    async fn workflow_config(&self, user_id: &str) -> Result<Option<WorkflowConfig>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, crm_provider, support_provider, report_frequency,
                   report_destination, destination_config, enabled, last_run_at, next_run_at
              FROM workflow_configs
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Self::config_from_row(&row)).transpose()
    }

    async fn due_configs(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowConfig>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, crm_provider, support_provider, report_frequency,
                   report_destination, destination_config, enabled, last_run_at, next_run_at
              FROM workflow_configs
             WHERE enabled
               AND next_run_at IS NOT NULL
               AND next_run_at <= $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::config_from_row).collect()
    }

    async fn connections(&self, user_id: &str) -> Result<Vec<ProviderConnection>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, provider, metadata, connected_at
              FROM provider_connections
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut connections = Vec::with_capacity(rows.len());
        for row in rows {
            connections.push(ProviderConnection {
                user_id: row.try_get("user_id")?,
                provider: row.try_get("provider")?,
                metadata: row.try_get("metadata")?,
                connected_at: row.try_get("connected_at")?,
            });
        }
        Ok(connections)
    }

    async fn advance_next_run(
        &self,
        user_id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_configs
               SET last_run_at = $2,
                   next_run_at = $3
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(last_run_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_next_run(
        &self,
        user_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_configs
               SET next_run_at = $2
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
