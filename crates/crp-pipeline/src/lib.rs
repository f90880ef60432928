//! Churn-report run orchestration: company-name reconciliation, the durable
//! six-step run loop with journal replay, report generation and delivery, and
//! the cron scan that triggers due workflows.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Days, Months, Utc};
use crp_adapters::{
    crm_source_for, support_source_for, AdapterError, CrmSource, FetchContext, SupportSource,
    DEFAULT_TICKET_DETAIL_LIMIT,
};
use crp_core::{
    CombinedCompany, CrmCompany, CrmProvider, CrmWithSource, ReportDestination, ReportFrequency,
    ReportRecord, RunRecord, RunStatus, StepName, StepRecord, StepStatus, SupportCustomer,
    SupportProvider, SupportWithSource, WorkflowParams,
};
use crp_storage::{
    ApiRequest, BackoffPolicy, ConfigStore, FetchError, HttpClientConfig, JournalStore,
    MemoryConfigStore, MemoryJournalStore, MemoryReportStore, MemoryRunStore, PgConfigStore,
    PgJournalStore, PgPool, PgReportStore, PgRunStore, ProviderClient, ReportStore, RunStore,
    SnapshotStore, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const REPORT_SUBJECT: &str = "Customer Churn Risk Report";

/// Slack caps a section block's text at 3000 characters.
const SLACK_SECTION_LIMIT: usize = 3000;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct ResendConfig {
    pub api_key: String,
    pub base_url: String,
    pub from: String,
}

/// Per-step retry policy, one level above the HTTP client's own transient
/// retries. Attempt delays double from `base_delay` up to `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct StepRetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for StepRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl StepRetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    pub http: HttpClientConfig,
    pub step_retry: StepRetryPolicy,
    pub scheduler_cron: String,
    pub openrouter: OpenRouterConfig,
    pub resend: ResendConfig,
    pub ticket_detail_limit: usize,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            data_dir: std::env::var("CRP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            http: HttpClientConfig {
                timeout: Duration::from_secs(env_u64("CRP_HTTP_TIMEOUT_SECS", 20)),
                user_agent: Some(
                    std::env::var("CRP_USER_AGENT").unwrap_or_else(|_| "crp-bot/0.1".to_string()),
                ),
                global_concurrency: env_u64("CRP_HTTP_GLOBAL_CONCURRENCY", 16) as usize,
                per_provider_concurrency: env_u64("CRP_HTTP_PROVIDER_CONCURRENCY", 4) as usize,
                backoff: BackoffPolicy {
                    max_retries: env_u64("CRP_HTTP_MAX_RETRIES", 3) as usize,
                    base_delay: Duration::from_millis(env_u64("CRP_HTTP_BASE_DELAY_MS", 250)),
                    max_delay: Duration::from_millis(env_u64("CRP_HTTP_MAX_DELAY_MS", 5000)),
                },
            },
            step_retry: StepRetryPolicy {
                max_attempts: env_u64("CRP_STEP_MAX_ATTEMPTS", 3) as u32,
                base_delay: Duration::from_millis(env_u64("CRP_STEP_BASE_DELAY_MS", 500)),
                max_delay: Duration::from_millis(env_u64("CRP_STEP_MAX_DELAY_MS", 10_000)),
            },
            scheduler_cron: std::env::var("CRP_SCHEDULER_CRON")
                .unwrap_or_else(|_| "0 */5 * * * *".to_string()),
            openrouter: OpenRouterConfig {
                api_key: std::env::var("CRP_OPENROUTER_API_KEY").unwrap_or_default(),
                base_url: std::env::var("CRP_OPENROUTER_BASE_URL")
                    .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
                model: std::env::var("CRP_OPENROUTER_MODEL")
                    .unwrap_or_else(|_| "anthropic/claude-3.5-sonnet".to_string()),
            },
            resend: ResendConfig {
                api_key: std::env::var("CRP_RESEND_API_KEY").unwrap_or_default(),
                base_url: std::env::var("CRP_RESEND_BASE_URL")
                    .unwrap_or_else(|_| "https://api.resend.com".to_string()),
                from: std::env::var("CRP_EMAIL_FROM")
                    .unwrap_or_else(|_| "Churn Reports <reports@example.com>".to_string()),
            },
            ticket_detail_limit: env_u64(
                "CRP_TICKET_DETAIL_LIMIT",
                DEFAULT_TICKET_DETAIL_LIMIT as u64,
            ) as usize,
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "unparseable numeric env var, using default");
            default
        }),
        Err(_) => default,
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("user {user_id} has no workflow config")]
    MissingConfig { user_id: String },
    #[error("user {user_id} has no {provider} connection")]
    MissingConnection {
        user_id: String,
        provider: &'static str,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Run(#[from] PipelineError),
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("model response had no report content")]
    MalformedReport,
    #[error("failed to encode report prompt: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Api(#[from] FetchError),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{destination} delivery failed")]
    Api {
        destination: &'static str,
        #[source]
        source: FetchError,
    },
}

/// Failure of one step body. Recorded in the journal and retried by the
/// orchestrator until the step retry policy is exhausted.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode step result: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("run {run_id} already finished as {status:?}")]
    TerminalRun { run_id: Uuid, status: RunStatus },
    #[error("run {run_id} vanished from the run store")]
    UnknownRun { run_id: Uuid },
    #[error("journaled {step} result is corrupt: {message}")]
    CorruptJournal {
        step: &'static str,
        message: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Company-name reconciliation
// ---------------------------------------------------------------------------

const COMPANY_SUFFIXES: [&str; 10] = [
    "inc",
    "incorporated",
    "ltd",
    "limited",
    "corp",
    "corporation",
    "co",
    "company",
    "llc",
    "plc",
];

/// Lowercases, strips punctuation and corporate suffix words, and collapses
/// whitespace, so that "Acme Corp, Inc." and "ACME CORP" land on the same key.
pub fn normalize_company_key(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .filter(|word| !COMPANY_SUFFIXES.contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Joins CRM companies and support customers on the normalized company key.
///
/// The output carries one row per distinct raw name across both inputs,
/// support names first in first-seen order, so differently spelled names that
/// normalize to the same key each keep their own row with both sides attached.
/// A key collision inside one input keeps the later record.
pub fn combine_companies(
    crm: Option<&[CrmCompany]>,
    support: &[SupportCustomer],
    crm_source: &str,
    support_source: &str,
) -> Vec<CombinedCompany> {
    let mut crm_by_key: HashMap<String, &CrmCompany> = HashMap::new();
    for company in crm.unwrap_or_default() {
        let key = normalize_company_key(&company.company_name);
        if let Some(previous) = crm_by_key.insert(key.clone(), company) {
            warn!(
                key = %key,
                kept = %company.company_name,
                dropped = %previous.company_name,
                "duplicate CRM company key, keeping the later record"
            );
        }
    }

    let mut support_by_key: HashMap<String, &SupportCustomer> = HashMap::new();
    for customer in support {
        let key = normalize_company_key(&customer.name);
        if let Some(previous) = support_by_key.insert(key.clone(), customer) {
            warn!(
                key = %key,
                kept = %customer.name,
                dropped = %previous.name,
                "duplicate support customer key, keeping the later record"
            );
        }
    }

    let mut names: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for customer in support {
        if seen.insert(customer.name.as_str()) {
            names.push(customer.name.as_str());
        }
    }
    for company in crm.unwrap_or_default() {
        if seen.insert(company.company_name.as_str()) {
            names.push(company.company_name.as_str());
        }
    }

    names
        .into_iter()
        .map(|name| {
            let key = normalize_company_key(name);
            CombinedCompany {
                company_name: name.to_string(),
                crm_data: crm_by_key.get(&key).map(|company| CrmWithSource {
                    company: (*company).clone(),
                    source: crm_source.to_string(),
                }),
                support_data: support_by_key.get(&key).map(|customer| SupportWithSource {
                    customer: (*customer).clone(),
                    source: support_source.to_string(),
                }),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Report generation
// ---------------------------------------------------------------------------

const CHURN_PROMPT_HEADER: &str = "You are a customer success analyst. Analyze the following customer data and generate a churn risk report.\n\nFor each company, you have:\n- CRM data (revenue, deals, owner info, lifecycle stage, sentiment)\n- Customer support data (tickets, priorities, CSAT, health scores)\n\nIdentify customers at risk of churning and provide actionable recommendations.\n\nCustomer Data:\n";

const CHURN_PROMPT_FOOTER: &str = "\n\nGenerate a report in markdown format with:\n1. Executive Summary\n2. High-Risk Customers (sorted by risk level)\n3. Medium-Risk Customers\n4. Key Insights & Patterns\n5. Recommended Actions\n\nBe specific and data-driven. Focus on actionable insights.";

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate(
        &self,
        run_id: Uuid,
        companies: &[CombinedCompany],
    ) -> Result<String, ReportError>;
}

/// Chat-completion report generator against the OpenRouter API.
pub struct OpenRouterGenerator {
    http: Arc<ProviderClient>,
    config: OpenRouterConfig,
}

impl OpenRouterGenerator {
    pub fn new(http: Arc<ProviderClient>, config: OpenRouterConfig) -> Self {
        Self { http, config }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ReportGenerator for OpenRouterGenerator {
    async fn generate(
        &self,
        run_id: Uuid,
        companies: &[CombinedCompany],
    ) -> Result<String, ReportError> {
        let prompt = format!(
            "{CHURN_PROMPT_HEADER}{}{CHURN_PROMPT_FOOTER}",
            serde_json::to_string_pretty(companies)?
        );
        let body = json!({
            "model": self.config.model.as_str(),
            "messages": [{ "role": "user", "content": prompt }],
        });
        let request = ApiRequest::post_json(
            format!("{}/chat/completions", trim_base(&self.config.base_url)),
            body,
        )
        .bearer(self.config.api_key.as_str());

        let completion: ChatCompletion =
            self.http.execute_json(run_id, "openrouter", &request).await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(ReportError::MalformedReport)
    }
}

fn trim_base(url: &str) -> &str {
    url.trim_end_matches('/')
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(
        &self,
        run_id: Uuid,
        destination: ReportDestination,
        destination_config: &str,
        report: &str,
    ) -> Result<(), DeliveryError>;
}

/// Report delivery over HTTP: Resend for email, an incoming webhook for Slack.
pub struct HttpNotifier {
    http: Arc<ProviderClient>,
    resend: ResendConfig,
}

impl HttpNotifier {
    pub fn new(http: Arc<ProviderClient>, resend: ResendConfig) -> Self {
        Self { http, resend }
    }

    async fn send_email(&self, run_id: Uuid, to: &str, report: &str) -> Result<(), DeliveryError> {
        let body = json!({
            "from": self.resend.from.as_str(),
            "to": [to],
            "subject": REPORT_SUBJECT,
            "text": report,
        });
        let request = ApiRequest::post_json(
            format!("{}/emails", trim_base(&self.resend.base_url)),
            body,
        )
        .bearer(self.resend.api_key.as_str());
        self.http
            .execute(run_id, "resend", &request)
            .await
            .map_err(|source| DeliveryError::Api {
                destination: "email",
                source,
            })?;
        Ok(())
    }

    async fn send_slack(
        &self,
        run_id: Uuid,
        webhook_url: &str,
        report: &str,
    ) -> Result<(), DeliveryError> {
        let body = json!({
            "text": format!("📊 *{REPORT_SUBJECT}*"),
            "blocks": [
                {
                    "type": "header",
                    "text": { "type": "plain_text", "text": format!("📊 {REPORT_SUBJECT}") },
                },
                {
                    "type": "section",
                    "text": { "type": "mrkdwn", "text": truncate_for_slack(report) },
                },
            ],
        });
        let request = ApiRequest::post_json(webhook_url.to_string(), body);
        self.http
            .execute(run_id, "slack", &request)
            .await
            .map_err(|source| DeliveryError::Api {
                destination: "slack",
                source,
            })?;
        Ok(())
    }
}

fn truncate_for_slack(report: &str) -> String {
    report.chars().take(SLACK_SECTION_LIMIT).collect()
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn deliver(
        &self,
        run_id: Uuid,
        destination: ReportDestination,
        destination_config: &str,
        report: &str,
    ) -> Result<(), DeliveryError> {
        match destination {
            ReportDestination::Email => self.send_email(run_id, destination_config, report).await,
            ReportDestination::Slack => self.send_slack(run_id, destination_config, report).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Source registry
// ---------------------------------------------------------------------------

/// Where the orchestrator gets its provider adapters. Swapped for scripted
/// sources in tests.
pub trait SourceRegistry: Send + Sync {
    fn crm(&self, provider: CrmProvider) -> Box<dyn CrmSource>;
    fn support(&self, provider: SupportProvider) -> Box<dyn SupportSource>;
}

pub struct ProviderRegistry;

impl SourceRegistry for ProviderRegistry {
    fn crm(&self, provider: CrmProvider) -> Box<dyn CrmSource> {
        crm_source_for(provider)
    }

    fn support(&self, provider: SupportProvider) -> Box<dyn SupportSource> {
        support_source_for(provider)
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Stores {
    pub journal: Arc<dyn JournalStore>,
    pub runs: Arc<dyn RunStore>,
    pub reports: Arc<dyn ReportStore>,
    pub configs: Arc<dyn ConfigStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            journal: Arc::new(MemoryJournalStore::new()),
            runs: Arc::new(MemoryRunStore::new()),
            reports: Arc::new(MemoryReportStore::new()),
            configs: Arc::new(MemoryConfigStore::new()),
        }
    }

    pub fn postgres(pool: &PgPool) -> Self {
        Self {
            journal: Arc::new(PgJournalStore::new(pool.clone())),
            runs: Arc::new(PgRunStore::new(pool.clone())),
            reports: Arc::new(PgReportStore::new(pool.clone())),
            configs: Arc::new(PgConfigStore::new(pool.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Summary of one run, also written to `runs/<run_id>/run_summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub user_id: String,
    pub status: RunStatus,
    pub companies_combined: usize,
    pub steps_executed: Vec<String>,
    pub steps_reused: Vec<String>,
    pub error: Option<String>,
}

enum StepAttempt {
    Done(Value),
    Exhausted(String),
}

#[derive(Default)]
struct StepProgress {
    executed: Vec<String>,
    reused: Vec<String>,
    companies_combined: usize,
}

/// Drives one run through the fixed step sequence, journaling every step
/// outcome so a re-executed run replays completed steps instead of repeating
/// their side effects.
pub struct StepOrchestrator {
    http: Arc<ProviderClient>,
    journal: Arc<dyn JournalStore>,
    runs: Arc<dyn RunStore>,
    reports: Arc<dyn ReportStore>,
    configs: Arc<dyn ConfigStore>,
    sources: Arc<dyn SourceRegistry>,
    generator: Arc<dyn ReportGenerator>,
    notifier: Arc<dyn Notifier>,
    retry: StepRetryPolicy,
    data_dir: PathBuf,
    ticket_detail_limit: usize,
}

impl StepOrchestrator {
    pub fn new(
        http: Arc<ProviderClient>,
        stores: Stores,
        generator: Arc<dyn ReportGenerator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            http,
            journal: stores.journal,
            runs: stores.runs,
            reports: stores.reports,
            configs: stores.configs,
            sources: Arc::new(ProviderRegistry),
            generator,
            notifier,
            retry: StepRetryPolicy::default(),
            data_dir: PathBuf::from("./data"),
            ticket_detail_limit: DEFAULT_TICKET_DETAIL_LIMIT,
        }
    }

    pub fn with_retry_policy(mut self, retry: StepRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_ticket_detail_limit(mut self, limit: usize) -> Self {
        self.ticket_detail_limit = limit;
        self
    }

    pub fn with_sources(mut self, sources: Arc<dyn SourceRegistry>) -> Self {
        self.sources = sources;
        self
    }

    /// Assembles params from the user's stored config and executes a run.
    pub async fn trigger_user(&self, user_id: &str) -> Result<RunOutcome, TriggerError> {
        let params = assemble_params(self.configs.as_ref(), user_id, Utc::now()).await?;
        Ok(self.execute(&params).await?)
    }

    pub async fn execute(&self, params: &WorkflowParams) -> Result<RunOutcome, PipelineError> {
        let run_id = params.run_id();
        let span = info_span!("run", %run_id, user_id = params.user_id.as_str());
        self.execute_inner(run_id, params).instrument(span).await
    }

    async fn execute_inner(
        &self,
        run_id: Uuid,
        params: &WorkflowParams,
    ) -> Result<RunOutcome, PipelineError> {
        let now = Utc::now();
        self.runs
            .create(&RunRecord {
                run_id,
                user_id: params.user_id.clone(),
                params: params.clone(),
                status: RunStatus::Pending,
                created_at: now,
                updated_at: now,
            })
            .await?;
        let run = self
            .runs
            .run(run_id)
            .await?
            .ok_or(PipelineError::UnknownRun { run_id })?;
        if run.status.is_terminal() {
            return Err(PipelineError::TerminalRun {
                run_id,
                status: run.status,
            });
        }
        self.runs
            .set_status(run_id, RunStatus::Running, Utc::now())
            .await?;
        info!(
            support = params.support_provider.as_str(),
            crm = params.crm_provider.map(|p| p.as_str()).unwrap_or("none"),
            destination = params.report_destination.as_str(),
            "run started"
        );

        let journal: HashMap<String, StepRecord> = self
            .journal
            .journal(run_id)
            .await?
            .into_iter()
            .map(|entry| (entry.step.clone(), entry))
            .collect();
        let mut progress = StepProgress::default();
        let http = self.http.as_ref();
        let ctx = FetchContext::at(run_id, params.triggered_at)
            .with_ticket_detail_limit(self.ticket_detail_limit);
        let ctx_ref = &ctx;

        // Step 1: fetch-crm. Skipped (null result) when no CRM side is configured.
        let crm_attempt = self
            .settle_step(run_id, StepName::FetchCrm, &journal, &mut progress, || {
                async move {
                    let (Some(provider), Some(metadata)) =
                        (params.crm_provider, params.crm_metadata.as_ref())
                    else {
                        return Ok(Value::Null);
                    };
                    let source = self.sources.crm(provider);
                    let companies = source.fetch_companies(http, ctx_ref, metadata).await?;
                    Ok(serde_json::to_value(&companies)?)
                }
            })
            .await?;
        let crm_value = match crm_attempt {
            StepAttempt::Done(value) => value,
            StepAttempt::Exhausted(message) => {
                return self
                    .finish_failed(run_id, params, progress, StepName::FetchCrm, message)
                    .await
            }
        };

        // Step 2: fetch-support.
        let support_attempt = self
            .settle_step(
                run_id,
                StepName::FetchSupport,
                &journal,
                &mut progress,
                || async move {
                    let source = self.sources.support(params.support_provider);
                    let customers = source
                        .fetch_customers(http, ctx_ref, &params.support_metadata)
                        .await?;
                    Ok(serde_json::to_value(&customers)?)
                },
            )
            .await?;
        let support_value = match support_attempt {
            StepAttempt::Done(value) => value,
            StepAttempt::Exhausted(message) => {
                return self
                    .finish_failed(run_id, params, progress, StepName::FetchSupport, message)
                    .await
            }
        };

        let crm_companies: Option<Vec<CrmCompany>> = if crm_value.is_null() {
            None
        } else {
            Some(serde_json::from_value(crm_value).map_err(|err| {
                PipelineError::CorruptJournal {
                    step: StepName::FetchCrm.as_str(),
                    message: err.to_string(),
                }
            })?)
        };
        let support_customers: Vec<SupportCustomer> = serde_json::from_value(support_value)
            .map_err(|err| PipelineError::CorruptJournal {
                step: StepName::FetchSupport.as_str(),
                message: err.to_string(),
            })?;

        // Step 3: combine.
        let crm_slice = crm_companies.as_deref();
        let support_slice = support_customers.as_slice();
        let crm_tag = params.crm_provider.map(|p| p.as_str()).unwrap_or("none");
        let support_tag = params.support_provider.as_str();
        let combine_attempt = self
            .settle_step(run_id, StepName::Combine, &journal, &mut progress, || {
                async move {
                    let combined =
                        combine_companies(crm_slice, support_slice, crm_tag, support_tag);
                    Ok(serde_json::to_value(&combined)?)
                }
            })
            .await?;
        let combined_value = match combine_attempt {
            StepAttempt::Done(value) => value,
            StepAttempt::Exhausted(message) => {
                return self
                    .finish_failed(run_id, params, progress, StepName::Combine, message)
                    .await
            }
        };
        let combined: Vec<CombinedCompany> =
            serde_json::from_value(combined_value).map_err(|err| {
                PipelineError::CorruptJournal {
                    step: StepName::Combine.as_str(),
                    message: err.to_string(),
                }
            })?;
        progress.companies_combined = combined.len();

        // Step 4: generate-report.
        let combined_slice = combined.as_slice();
        let report_attempt = self
            .settle_step(
                run_id,
                StepName::GenerateReport,
                &journal,
                &mut progress,
                || async move {
                    let report = self.generator.generate(run_id, combined_slice).await?;
                    Ok(Value::String(report))
                },
            )
            .await?;
        let report = match report_attempt {
            StepAttempt::Done(Value::String(text)) => text,
            StepAttempt::Done(other) => {
                return Err(PipelineError::CorruptJournal {
                    step: StepName::GenerateReport.as_str(),
                    message: format!("expected a string result, got {other}"),
                })
            }
            StepAttempt::Exhausted(message) => {
                return self
                    .finish_failed(run_id, params, progress, StepName::GenerateReport, message)
                    .await
            }
        };

        // Step 5: deliver.
        let report_ref = report.as_str();
        let deliver_attempt = self
            .settle_step(run_id, StepName::Deliver, &journal, &mut progress, || {
                async move {
                    self.notifier
                        .deliver(
                            run_id,
                            params.report_destination,
                            &params.destination_config,
                            report_ref,
                        )
                        .await?;
                    Ok(json!({ "delivered": true }))
                }
            })
            .await?;
        if let StepAttempt::Exhausted(message) = deliver_attempt {
            return self
                .finish_failed(run_id, params, progress, StepName::Deliver, message)
                .await;
        }

        // Step 6: log-completion. Persists the report record under a
        // deterministic id and advances the user's schedule.
        let log_attempt = self
            .settle_step(
                run_id,
                StepName::LogCompletion,
                &journal,
                &mut progress,
                || async move {
                    let record = ReportRecord {
                        id: format!("rpt-{run_id}"),
                        user_id: params.user_id.clone(),
                        run_id,
                        content: report_ref.to_string(),
                        created_at: Utc::now(),
                    };
                    self.reports.insert(&record).await?;

                    let completed_at = Utc::now();
                    if let Some(config) = self.configs.workflow_config(&params.user_id).await? {
                        let next_run_at = next_run_after(completed_at, config.report_frequency);
                        self.configs
                            .advance_next_run(&params.user_id, completed_at, next_run_at)
                            .await?;
                    }
                    Ok(json!({ "reportId": record.id }))
                },
            )
            .await?;
        if let StepAttempt::Exhausted(message) = log_attempt {
            return self
                .finish_failed(run_id, params, progress, StepName::LogCompletion, message)
                .await;
        }

        self.runs
            .set_status(run_id, RunStatus::Completed, Utc::now())
            .await?;
        let outcome = RunOutcome {
            run_id,
            user_id: params.user_id.clone(),
            status: RunStatus::Completed,
            companies_combined: progress.companies_combined,
            steps_executed: progress.executed,
            steps_reused: progress.reused,
            error: None,
        };
        if let Err(err) = self.write_artifacts(&outcome, &report).await {
            warn!(error = %err, "failed to write run artifacts");
        }
        info!(
            companies = outcome.companies_combined,
            executed = outcome.steps_executed.len(),
            reused = outcome.steps_reused.len(),
            "run completed"
        );
        Ok(outcome)
    }

    /// Resolves one step: replays a journaled `Completed` result, otherwise
    /// runs the body under the step retry policy, journaling every attempt.
    async fn settle_step<F, Fut>(
        &self,
        run_id: Uuid,
        step: StepName,
        journal: &HashMap<String, StepRecord>,
        progress: &mut StepProgress,
        body: F,
    ) -> Result<StepAttempt, PipelineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, StepError>>,
    {
        if let Some(entry) = journal.get(step.as_str()) {
            if entry.status == StepStatus::Completed {
                info!(step = step.as_str(), "replaying journaled step result");
                progress.reused.push(step.as_str().to_string());
                return Ok(StepAttempt::Done(
                    entry.result.clone().unwrap_or(Value::Null),
                ));
            }
        }

        let prior_attempts = journal
            .get(step.as_str())
            .map(|entry| entry.attempts)
            .unwrap_or(0);
        let mut attempts = prior_attempts;

        loop {
            attempts += 1;
            let span = info_span!("step", step = step.as_str(), attempt = attempts);
            match body().instrument(span).await {
                Ok(result) => {
                    if attempts > prior_attempts + 1 {
                        self.runs
                            .set_status(run_id, RunStatus::Running, Utc::now())
                            .await?;
                    }
                    self.journal
                        .upsert(
                            run_id,
                            &StepRecord::completed(step, result.clone(), attempts, Utc::now()),
                        )
                        .await?;
                    progress.executed.push(step.as_str().to_string());
                    info!(step = step.as_str(), attempts, "step completed");
                    return Ok(StepAttempt::Done(result));
                }
                Err(err) => {
                    let message = err.to_string();
                    self.journal
                        .upsert(
                            run_id,
                            &StepRecord::failed(step, message.clone(), attempts, Utc::now()),
                        )
                        .await?;
                    if attempts >= prior_attempts + self.retry.max_attempts {
                        return Ok(StepAttempt::Exhausted(message));
                    }
                    let delay = self
                        .retry
                        .delay_for_attempt((attempts - prior_attempts - 1) as usize);
                    warn!(
                        step = step.as_str(),
                        attempts,
                        error = %message,
                        delay_ms = delay.as_millis() as u64,
                        "step failed, retrying"
                    );
                    self.runs
                        .set_status(run_id, RunStatus::StepRetrying, Utc::now())
                        .await?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn finish_failed(
        &self,
        run_id: Uuid,
        params: &WorkflowParams,
        progress: StepProgress,
        step: StepName,
        message: String,
    ) -> Result<RunOutcome, PipelineError> {
        self.runs
            .set_status(run_id, RunStatus::Failed, Utc::now())
            .await?;
        error!(step = step.as_str(), error = %message, "run failed");
        Ok(RunOutcome {
            run_id,
            user_id: params.user_id.clone(),
            status: RunStatus::Failed,
            companies_combined: progress.companies_combined,
            steps_executed: progress.executed,
            steps_reused: progress.reused,
            error: Some(format!("{}: {message}", step.as_str())),
        })
    }

    async fn write_artifacts(&self, outcome: &RunOutcome, report: &str) -> anyhow::Result<()> {
        let run_dir = self.data_dir.join("runs").join(outcome.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let report_path = run_dir.join("report.md");
        fs::write(&report_path, report)
            .await
            .with_context(|| format!("writing {}", report_path.display()))?;

        let summary_path = run_dir.join("run_summary.json");
        let summary = serde_json::to_vec_pretty(outcome).context("encoding run summary")?;
        fs::write(&summary_path, summary)
            .await
            .with_context(|| format!("writing {}", summary_path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Triggering
// ---------------------------------------------------------------------------

/// Builds `WorkflowParams` for one user from their stored workflow config and
/// provider connections. The support connection is required; the CRM side is
/// dropped with a warning when its connection is missing.
pub async fn assemble_params(
    configs: &dyn ConfigStore,
    user_id: &str,
    triggered_at: DateTime<Utc>,
) -> Result<WorkflowParams, TriggerError> {
    let config = configs
        .workflow_config(user_id)
        .await?
        .ok_or_else(|| TriggerError::MissingConfig {
            user_id: user_id.to_string(),
        })?;
    let connections = configs.connections(user_id).await?;

    let support_connection = connections
        .iter()
        .find(|c| c.provider == config.support_provider.as_str())
        .ok_or_else(|| TriggerError::MissingConnection {
            user_id: user_id.to_string(),
            provider: config.support_provider.as_str(),
        })?;
    let support_metadata = with_env_credentials(
        support_connection.metadata.clone(),
        config.support_provider.as_str(),
    );

    let (crm_provider, crm_metadata) = match config.crm_provider {
        Some(provider) => match connections.iter().find(|c| c.provider == provider.as_str()) {
            Some(connection) => (
                Some(provider),
                Some(with_env_credentials(
                    connection.metadata.clone(),
                    provider.as_str(),
                )),
            ),
            None => {
                warn!(
                    user_id,
                    provider = provider.as_str(),
                    "no CRM connection for configured provider, running support-only"
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    Ok(WorkflowParams {
        user_id: user_id.to_string(),
        crm_provider,
        crm_metadata,
        support_provider: config.support_provider,
        support_metadata,
        report_destination: config.report_destination,
        destination_config: config.destination_config,
        triggered_at,
    })
}

/// Fills `clientId`/`clientSecret` from `CRP_<PROVIDER>_CLIENT_ID` /
/// `_CLIENT_SECRET` when the stored connection metadata leaves them blank.
/// Values already present in the metadata win.
pub fn with_env_credentials(metadata: Value, provider: &str) -> Value {
    let mut fields = match metadata {
        Value::Object(fields) => fields,
        other => return other,
    };
    let upper = provider.to_ascii_uppercase();
    for (field, suffix) in [("clientId", "CLIENT_ID"), ("clientSecret", "CLIENT_SECRET")] {
        let present = fields
            .get(field)
            .and_then(Value::as_str)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if present {
            continue;
        }
        if let Ok(value) = std::env::var(format!("CRP_{upper}_{suffix}")) {
            if !value.is_empty() {
                fields.insert(field.to_string(), Value::String(value));
            }
        }
    }
    Value::Object(fields)
}

pub fn next_run_after(now: DateTime<Utc>, frequency: ReportFrequency) -> Option<DateTime<Utc>> {
    match frequency {
        ReportFrequency::Daily => now.checked_add_days(Days::new(1)),
        ReportFrequency::Weekly => now.checked_add_days(Days::new(7)),
        ReportFrequency::Monthly => now.checked_add_months(Months::new(1)),
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn build_orchestrator(
    config: &PipelineConfig,
    stores: Stores,
) -> anyhow::Result<StepOrchestrator> {
    let snapshots = SnapshotStore::new(config.data_dir.join("snapshots"));
    let http = Arc::new(ProviderClient::new(config.http.clone())?.with_snapshots(snapshots));
    let generator = Arc::new(OpenRouterGenerator::new(
        http.clone(),
        config.openrouter.clone(),
    ));
    let notifier = Arc::new(HttpNotifier::new(http.clone(), config.resend.clone()));
    Ok(StepOrchestrator::new(http, stores, generator, notifier)
        .with_retry_policy(config.step_retry)
        .with_data_dir(config.data_dir.clone())
        .with_ticket_detail_limit(config.ticket_detail_limit))
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Cron-driven scan over workflow configs. Each due config gets its
/// `next_run_at` bumped first, then a run is spawned, so a slow run is not
/// picked up again by the next tick.
#[derive(Clone)]
pub struct Scheduler {
    orchestrator: Arc<StepOrchestrator>,
    configs: Arc<dyn ConfigStore>,
    cron: String,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<StepOrchestrator>,
        configs: Arc<dyn ConfigStore>,
        cron: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            configs,
            cron: cron.into(),
        }
    }

    pub async fn scan_once(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let due = self.configs.due_configs(now).await?;
        let mut started = 0usize;
        for config in due {
            if let Some(next) = next_run_after(now, config.report_frequency) {
                self.configs.set_next_run(&config.user_id, next).await?;
            }
            let orchestrator = self.orchestrator.clone();
            let user_id = config.user_id.clone();
            tokio::spawn(async move {
                if let Err(err) = orchestrator.trigger_user(&user_id).await {
                    error!(user_id = %user_id, error = %err, "scheduled run failed");
                }
            });
            started += 1;
        }
        if started > 0 {
            info!(started, "scheduler spawned due runs");
        }
        Ok(started)
    }

    pub async fn start(&self) -> anyhow::Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let scanner = self.clone();
        let job = Job::new_async(self.cron.as_str(), move |_uuid, _lock| {
            let scanner = scanner.clone();
            Box::pin(async move {
                if let Err(err) = scanner.scan_once().await {
                    error!(error = %err, "scheduler scan failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", self.cron))?;
        sched.add(job).await.context("adding scheduler job")?;
        sched.start().await.context("starting scheduler")?;
        Ok(sched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crp_core::{ProviderConnection, WorkflowConfig};
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn crm_company(name: &str, id: &str) -> CrmCompany {
        CrmCompany::new(name, id)
    }

    fn support_customer(name: &str, id: &str) -> SupportCustomer {
        let mut customer = SupportCustomer::new(id, name);
        customer.ticket_count = 3;
        customer.open_tickets = 1;
        customer
    }

    fn params() -> WorkflowParams {
        WorkflowParams {
            user_id: "user-1".to_string(),
            crm_provider: Some(CrmProvider::Hubspot),
            crm_metadata: Some(json!({ "clientId": "id", "clientSecret": "secret" })),
            support_provider: SupportProvider::Zendesk,
            support_metadata: json!({
                "clientId": "id",
                "clientSecret": "secret",
                "subdomain": "acme",
            }),
            report_destination: ReportDestination::Email,
            destination_config: "csm@example.com".to_string(),
            triggered_at: Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap(),
        }
    }

    fn test_config() -> WorkflowConfig {
        WorkflowConfig {
            user_id: "user-1".to_string(),
            crm_provider: Some(CrmProvider::Hubspot),
            support_provider: SupportProvider::Zendesk,
            report_frequency: ReportFrequency::Weekly,
            report_destination: ReportDestination::Email,
            destination_config: "csm@example.com".to_string(),
            enabled: true,
            last_run_at: None,
            next_run_at: None,
        }
    }

    fn fast_retry() -> StepRetryPolicy {
        StepRetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    struct ScriptedCrm {
        companies: Vec<CrmCompany>,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl CrmSource for ScriptedCrm {
        fn provider(&self) -> CrmProvider {
            CrmProvider::Hubspot
        }

        async fn fetch_companies(
            &self,
            _http: &ProviderClient,
            _ctx: &FetchContext,
            _metadata: &Value,
        ) -> Result<Vec<CrmCompany>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.companies.clone())
        }
    }

    struct ScriptedSupport {
        customers: Vec<SupportCustomer>,
        remaining_failures: Arc<AtomicU32>,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl SupportSource for ScriptedSupport {
        fn provider(&self) -> SupportProvider {
            SupportProvider::Zendesk
        }

        async fn fetch_customers(
            &self,
            _http: &ProviderClient,
            _ctx: &FetchContext,
            _metadata: &Value,
        ) -> Result<Vec<SupportCustomer>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.remaining_failures.load(Ordering::SeqCst) > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(AdapterError::Api {
                    provider: "zendesk",
                    status: Some(500),
                    message: "upstream 500".to_string(),
                });
            }
            Ok(self.customers.clone())
        }
    }

    #[derive(Clone)]
    struct ScriptedSources {
        companies: Vec<CrmCompany>,
        customers: Vec<SupportCustomer>,
        support_failures: Arc<AtomicU32>,
        crm_calls: Arc<AtomicU32>,
        support_calls: Arc<AtomicU32>,
    }

    impl ScriptedSources {
        fn new(companies: Vec<CrmCompany>, customers: Vec<SupportCustomer>) -> Self {
            Self {
                companies,
                customers,
                support_failures: Arc::new(AtomicU32::new(0)),
                crm_calls: Arc::new(AtomicU32::new(0)),
                support_calls: Arc::new(AtomicU32::new(0)),
            }
        }

        fn failing_support_first(self, failures: u32) -> Self {
            self.support_failures.store(failures, Ordering::SeqCst);
            self
        }
    }

    impl SourceRegistry for ScriptedSources {
        fn crm(&self, _provider: CrmProvider) -> Box<dyn CrmSource> {
            Box::new(ScriptedCrm {
                companies: self.companies.clone(),
                calls: self.crm_calls.clone(),
            })
        }

        fn support(&self, _provider: SupportProvider) -> Box<dyn SupportSource> {
            Box::new(ScriptedSupport {
                customers: self.customers.clone(),
                remaining_failures: self.support_failures.clone(),
                calls: self.support_calls.clone(),
            })
        }
    }

    struct FakeGenerator {
        report: String,
        calls: Arc<AtomicU32>,
        remaining_failures: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ReportGenerator for FakeGenerator {
        async fn generate(
            &self,
            _run_id: Uuid,
            _companies: &[CombinedCompany],
        ) -> Result<String, ReportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.remaining_failures.load(Ordering::SeqCst) > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ReportError::MalformedReport);
            }
            Ok(self.report.clone())
        }
    }

    struct CountingNotifier {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn deliver(
            &self,
            _run_id: Uuid,
            _destination: ReportDestination,
            _destination_config: &str,
            _report: &str,
        ) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingReports;

    #[async_trait]
    impl ReportStore for FailingReports {
        async fn insert(&self, _report: &ReportRecord) -> Result<(), StoreError> {
            Err(StoreError::Corrupt {
                context: "reports".to_string(),
                message: "insert rejected".to_string(),
            })
        }
    }

    struct Harness {
        orchestrator: StepOrchestrator,
        runs: Arc<MemoryRunStore>,
        journal: Arc<MemoryJournalStore>,
        reports: Arc<MemoryReportStore>,
        configs: Arc<MemoryConfigStore>,
        notifier_calls: Arc<AtomicU32>,
        generator_calls: Arc<AtomicU32>,
        data_dir: tempfile::TempDir,
    }

    fn harness(sources: ScriptedSources) -> Harness {
        harness_with(sources, 0)
    }

    fn harness_with(sources: ScriptedSources, generator_failures: u32) -> Harness {
        let journal = Arc::new(MemoryJournalStore::new());
        let runs = Arc::new(MemoryRunStore::new());
        let reports = Arc::new(MemoryReportStore::new());
        let configs = Arc::new(MemoryConfigStore::new());
        let stores = Stores {
            journal: journal.clone(),
            runs: runs.clone(),
            reports: reports.clone(),
            configs: configs.clone(),
        };
        let http = Arc::new(ProviderClient::new(HttpClientConfig::default()).expect("client"));
        let notifier_calls = Arc::new(AtomicU32::new(0));
        let generator_calls = Arc::new(AtomicU32::new(0));
        let generator = Arc::new(FakeGenerator {
            report: "## Churn Risk Report\nwatch Acme".to_string(),
            calls: generator_calls.clone(),
            remaining_failures: Arc::new(AtomicU32::new(generator_failures)),
        });
        let notifier = Arc::new(CountingNotifier {
            calls: notifier_calls.clone(),
        });
        let data_dir = tempfile::tempdir().expect("tempdir");
        let orchestrator = StepOrchestrator::new(http, stores, generator, notifier)
            .with_retry_policy(fast_retry())
            .with_data_dir(data_dir.path())
            .with_sources(Arc::new(sources));
        Harness {
            orchestrator,
            runs,
            journal,
            reports,
            configs,
            notifier_calls,
            generator_calls,
            data_dir,
        }
    }

    #[test]
    fn normalize_company_key_strips_suffixes_and_punctuation() {
        assert_eq!(normalize_company_key("Acme Corp, Inc."), "acme");
        assert_eq!(normalize_company_key("TechStart Incorporated"), "techstart");
        assert_eq!(normalize_company_key("The Code Company LLC"), "the code");
        assert_eq!(normalize_company_key("GLOBEX  Plc"), "globex");
    }

    #[test]
    fn normalize_company_key_is_idempotent() {
        for name in ["Acme Corp, Inc.", "Wayne Enterprises Ltd", "Initech"] {
            let once = normalize_company_key(name);
            assert_eq!(normalize_company_key(&once), once);
        }
    }

    #[test]
    fn combine_joins_both_spellings_of_the_same_company() {
        let crm = vec![crm_company("Acme Corp, Inc.", "C1")];
        let support = vec![support_customer("ACME CORP", "S1")];

        let combined = combine_companies(Some(&crm), &support, "hubspot", "zendesk");

        assert_eq!(combined.len(), 2);
        assert_eq!(combined[0].company_name, "ACME CORP");
        assert_eq!(combined[1].company_name, "Acme Corp, Inc.");
        for row in &combined {
            let crm_side = row.crm_data.as_ref().expect("crm side");
            let support_side = row.support_data.as_ref().expect("support side");
            assert_eq!(crm_side.company.company_id, "C1");
            assert_eq!(crm_side.source, "hubspot");
            assert_eq!(support_side.customer.id, "S1");
            assert_eq!(support_side.source, "zendesk");
        }
    }

    #[test]
    fn combine_emits_every_raw_name_exactly_once_support_first() {
        let crm = vec![crm_company("Acme Corp", "C1"), crm_company("Gamma Inc", "C2")];
        let support = vec![
            support_customer("Beta LLC", "S1"),
            support_customer("Acme Corp", "S2"),
        ];

        let combined = combine_companies(Some(&crm), &support, "salesforce", "freshdesk");

        let names: Vec<&str> = combined.iter().map(|c| c.company_name.as_str()).collect();
        assert_eq!(names, ["Beta LLC", "Acme Corp", "Gamma Inc"]);
    }

    #[test]
    fn combine_without_crm_leaves_crm_side_absent() {
        let support = vec![support_customer("Beta LLC", "S1"), support_customer("Acme", "S2")];

        let combined = combine_companies(None, &support, "none", "zendesk");

        assert_eq!(combined.len(), 2);
        assert!(combined.iter().all(|c| c.crm_data.is_none()));
        assert!(combined.iter().all(|c| c.support_data.is_some()));
    }

    #[test]
    fn combine_key_collision_keeps_the_later_crm_record() {
        let crm = vec![crm_company("Acme Inc", "A1"), crm_company("Acme LLC", "A2")];
        let support = vec![support_customer("acme", "S1")];

        let combined = combine_companies(Some(&crm), &support, "hubspot", "zendesk");

        assert_eq!(combined.len(), 3);
        for row in &combined {
            let crm_side = row.crm_data.as_ref().expect("crm side");
            assert_eq!(crm_side.company.company_id, "A2");
        }
    }

    #[test]
    fn combine_keeps_rows_whose_key_normalizes_to_empty() {
        let support = vec![support_customer("Inc.", "S1")];

        let combined = combine_companies(None, &support, "none", "intercom");

        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].company_name, "Inc.");
        let support_side = combined[0].support_data.as_ref().expect("support side");
        assert_eq!(support_side.customer.id, "S1");
    }

    #[test]
    fn next_run_after_matches_report_frequency() {
        let base = Utc.with_ymd_and_hms(2025, 1, 31, 9, 30, 0).unwrap();
        assert_eq!(
            next_run_after(base, ReportFrequency::Daily),
            Some(Utc.with_ymd_and_hms(2025, 2, 1, 9, 30, 0).unwrap())
        );
        assert_eq!(
            next_run_after(base, ReportFrequency::Weekly),
            Some(Utc.with_ymd_and_hms(2025, 2, 7, 9, 30, 0).unwrap())
        );
        assert_eq!(
            next_run_after(base, ReportFrequency::Monthly),
            Some(Utc.with_ymd_and_hms(2025, 2, 28, 9, 30, 0).unwrap())
        );
    }

    #[test]
    fn step_retry_delays_double_and_cap() {
        let policy = StepRetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[test]
    fn slack_sections_are_truncated_to_the_block_limit() {
        let long = "a".repeat(SLACK_SECTION_LIMIT + 500);
        assert_eq!(truncate_for_slack(&long).chars().count(), SLACK_SECTION_LIMIT);
        assert_eq!(truncate_for_slack("short"), "short");
    }

    #[test]
    fn env_credentials_never_override_stored_metadata() {
        let metadata = json!({ "clientId": "stored-id", "clientSecret": "stored-secret" });
        let merged = with_env_credentials(metadata, "zendesk");
        assert_eq!(merged["clientId"], "stored-id");
        assert_eq!(merged["clientSecret"], "stored-secret");
    }

    #[tokio::test]
    async fn run_completes_all_six_steps_and_writes_artifacts() {
        let sources = ScriptedSources::new(
            vec![crm_company("Acme Corp, Inc.", "C1")],
            vec![support_customer("ACME CORP", "S1")],
        );
        let h = harness(sources);
        let params = params();
        let run_id = params.run_id();
        h.configs.put_config(test_config()).await;

        let outcome = h.orchestrator.execute(&params).await.expect("run");

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.companies_combined, 2);
        assert_eq!(outcome.steps_executed.len(), 6);
        assert!(outcome.steps_reused.is_empty());
        assert!(outcome.error.is_none());
        assert_eq!(h.notifier_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.generator_calls.load(Ordering::SeqCst), 1);

        let run = h.runs.run(run_id).await.expect("store").expect("run row");
        assert_eq!(run.status, RunStatus::Completed);

        let reports = h.reports.reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].id, format!("rpt-{run_id}"));
        assert_eq!(reports[0].run_id, run_id);
        assert_eq!(reports[0].user_id, "user-1");

        let config = h
            .configs
            .workflow_config("user-1")
            .await
            .expect("store")
            .expect("config");
        let last_run_at = config.last_run_at.expect("last run");
        assert!(config.next_run_at.expect("next run") > last_run_at);

        let run_dir = h.data_dir.path().join("runs").join(run_id.to_string());
        let report_text = std::fs::read_to_string(run_dir.join("report.md")).expect("report");
        assert!(report_text.contains("Churn Risk Report"));
        let summary: Value = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("run_summary.json")).expect("summary"),
        )
        .expect("summary json");
        assert_eq!(summary["companies_combined"], 2);
    }

    #[tokio::test]
    async fn transient_support_failure_retries_and_completes() {
        let sources = ScriptedSources::new(vec![], vec![support_customer("Beta", "S1")])
            .failing_support_first(1);
        let support_calls = sources.support_calls.clone();
        let h = harness(sources);
        let params = WorkflowParams {
            crm_provider: None,
            crm_metadata: None,
            ..params()
        };
        let run_id = params.run_id();

        let outcome = h.orchestrator.execute(&params).await.expect("run");

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(support_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.notifier_calls.load(Ordering::SeqCst), 1);

        let journal = h.journal.journal(run_id).await.expect("journal");
        let entry = journal
            .iter()
            .find(|e| e.step == "fetch-support")
            .expect("support entry");
        assert_eq!(entry.status, StepStatus::Completed);
        assert_eq!(entry.attempts, 2);
    }

    #[tokio::test]
    async fn exhausted_step_fails_the_run_and_halts_later_steps() {
        let sources = ScriptedSources::new(vec![], vec![support_customer("Beta", "S1")])
            .failing_support_first(u32::MAX);
        let h = harness(sources);
        let params = WorkflowParams {
            crm_provider: None,
            crm_metadata: None,
            ..params()
        };
        let run_id = params.run_id();

        let outcome = h.orchestrator.execute(&params).await.expect("run result");

        assert_eq!(outcome.status, RunStatus::Failed);
        let error = outcome.error.expect("error message");
        assert!(error.contains("fetch-support"), "unexpected error: {error}");
        assert_eq!(h.generator_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.notifier_calls.load(Ordering::SeqCst), 0);

        let run = h.runs.run(run_id).await.expect("store").expect("run row");
        assert_eq!(run.status, RunStatus::Failed);

        let journal = h.journal.journal(run_id).await.expect("journal");
        let entry = journal
            .iter()
            .find(|e| e.step == "fetch-support")
            .expect("support entry");
        assert_eq!(entry.status, StepStatus::Failed);
        assert_eq!(entry.attempts, 3);
        assert!(journal.iter().all(|e| e.step != "combine"));
    }

    #[tokio::test]
    async fn journaled_steps_are_replayed_without_side_effects() {
        let sources = ScriptedSources::new(vec![], vec![support_customer("Beta", "S1")]);
        let h = harness(sources);
        let params = WorkflowParams {
            crm_provider: None,
            crm_metadata: None,
            ..params()
        };
        let run_id = params.run_id();
        let seeded_at = Utc::now();

        let customers =
            serde_json::to_value(vec![support_customer("Beta", "S1")]).expect("encode customers");
        let combined = serde_json::to_value(combine_companies(
            None,
            &[support_customer("Beta", "S1")],
            "none",
            "zendesk",
        ))
        .expect("encode combined");
        for (step, result) in [
            (StepName::FetchCrm, Value::Null),
            (StepName::FetchSupport, customers),
            (StepName::Combine, combined),
            (
                StepName::GenerateReport,
                Value::String("journaled report".to_string()),
            ),
            (StepName::Deliver, json!({ "delivered": true })),
        ] {
            h.journal
                .upsert(run_id, &StepRecord::completed(step, result, 1, seeded_at))
                .await
                .expect("seed journal");
        }

        let outcome = h.orchestrator.execute(&params).await.expect("run");

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.steps_reused.len(), 5);
        assert_eq!(outcome.steps_executed, ["log-completion"]);
        assert_eq!(outcome.companies_combined, 1);
        assert_eq!(h.notifier_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.generator_calls.load(Ordering::SeqCst), 0);

        let reports = h.reports.reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].content, "journaled report");
    }

    #[tokio::test]
    async fn terminal_runs_are_never_re_entered() {
        let sources = ScriptedSources::new(vec![], vec![support_customer("Beta", "S1")]);
        let h = harness(sources);
        let params = WorkflowParams {
            crm_provider: None,
            crm_metadata: None,
            ..params()
        };

        let outcome = h.orchestrator.execute(&params).await.expect("first run");
        assert_eq!(outcome.status, RunStatus::Completed);

        let err = h.orchestrator.execute(&params).await.expect_err("second run");
        assert!(matches!(err, PipelineError::TerminalRun { .. }));
        assert_eq!(h.notifier_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn generator_exhaustion_never_reaches_delivery() {
        let sources = ScriptedSources::new(vec![], vec![support_customer("Beta", "S1")]);
        let h = harness_with(sources, u32::MAX);
        let params = WorkflowParams {
            crm_provider: None,
            crm_metadata: None,
            ..params()
        };

        let outcome = h.orchestrator.execute(&params).await.expect("run result");

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(h.generator_calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.notifier_calls.load(Ordering::SeqCst), 0);
        assert!(outcome.error.expect("error").contains("generate-report"));
    }

    #[tokio::test]
    async fn persistence_failure_after_delivery_does_not_redeliver() {
        let sources = ScriptedSources::new(vec![], vec![support_customer("Beta", "S1")]);
        let journal = Arc::new(MemoryJournalStore::new());
        let runs = Arc::new(MemoryRunStore::new());
        let stores = Stores {
            journal: journal.clone(),
            runs: runs.clone(),
            reports: Arc::new(FailingReports),
            configs: Arc::new(MemoryConfigStore::new()),
        };
        let http = Arc::new(ProviderClient::new(HttpClientConfig::default()).expect("client"));
        let notifier_calls = Arc::new(AtomicU32::new(0));
        let data_dir = tempfile::tempdir().expect("tempdir");
        let orchestrator = StepOrchestrator::new(
            http,
            stores,
            Arc::new(FakeGenerator {
                report: "report".to_string(),
                calls: Arc::new(AtomicU32::new(0)),
                remaining_failures: Arc::new(AtomicU32::new(0)),
            }),
            Arc::new(CountingNotifier {
                calls: notifier_calls.clone(),
            }),
        )
        .with_retry_policy(fast_retry())
        .with_data_dir(data_dir.path())
        .with_sources(Arc::new(sources));

        let params = WorkflowParams {
            crm_provider: None,
            crm_metadata: None,
            ..params()
        };
        let run_id = params.run_id();

        let outcome = orchestrator.execute(&params).await.expect("run result");

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(notifier_calls.load(Ordering::SeqCst), 1);

        let run = runs.run(run_id).await.expect("store").expect("run row");
        assert_eq!(run.status, RunStatus::Failed);

        let entries = journal.journal(run_id).await.expect("journal");
        let deliver = entries.iter().find(|e| e.step == "deliver").expect("deliver");
        assert_eq!(deliver.status, StepStatus::Completed);
        let log = entries
            .iter()
            .find(|e| e.step == "log-completion")
            .expect("log entry");
        assert_eq!(log.status, StepStatus::Failed);
        assert_eq!(log.attempts, 3);
    }

    #[tokio::test]
    async fn trigger_without_support_connection_creates_no_run() {
        let sources = ScriptedSources::new(vec![], vec![]);
        let h = harness(sources);
        h.configs.put_config(test_config()).await;

        let err = h
            .orchestrator
            .trigger_user("user-1")
            .await
            .expect_err("trigger");

        assert!(matches!(
            err,
            TriggerError::MissingConnection {
                provider: "zendesk",
                ..
            }
        ));
        assert_eq!(h.notifier_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn trigger_for_unknown_user_is_a_missing_config_error() {
        let sources = ScriptedSources::new(vec![], vec![]);
        let h = harness(sources);

        let err = h
            .orchestrator
            .trigger_user("nobody")
            .await
            .expect_err("trigger");

        assert!(matches!(err, TriggerError::MissingConfig { .. }));
    }

    #[tokio::test]
    async fn trigger_without_crm_connection_runs_support_only() {
        let sources = ScriptedSources::new(
            vec![crm_company("Acme", "C1")],
            vec![support_customer("Beta", "S1")],
        );
        let crm_calls = sources.crm_calls.clone();
        let h = harness(sources);
        h.configs.put_config(test_config()).await;
        h.configs
            .put_connection(ProviderConnection {
                user_id: "user-1".to_string(),
                provider: "zendesk".to_string(),
                metadata: json!({ "clientId": "id", "clientSecret": "secret" }),
                connected_at: Utc::now(),
            })
            .await;

        let outcome = h.orchestrator.trigger_user("user-1").await.expect("trigger");

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(crm_calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.companies_combined, 1);
    }

    #[tokio::test]
    async fn assembled_params_carry_connection_metadata() {
        let configs = MemoryConfigStore::new();
        configs.put_config(test_config()).await;
        configs
            .put_connection(ProviderConnection {
                user_id: "user-1".to_string(),
                provider: "zendesk".to_string(),
                metadata: json!({
                    "clientId": "z-id",
                    "clientSecret": "z-secret",
                    "subdomain": "acme",
                }),
                connected_at: Utc::now(),
            })
            .await;
        configs
            .put_connection(ProviderConnection {
                user_id: "user-1".to_string(),
                provider: "hubspot".to_string(),
                metadata: json!({ "clientId": "h-id", "clientSecret": "h-secret" }),
                connected_at: Utc::now(),
            })
            .await;

        let triggered_at = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        let params = assemble_params(&configs, "user-1", triggered_at)
            .await
            .expect("params");

        assert_eq!(params.user_id, "user-1");
        assert_eq!(params.crm_provider, Some(CrmProvider::Hubspot));
        assert_eq!(params.support_provider, SupportProvider::Zendesk);
        assert_eq!(params.support_metadata["subdomain"], "acme");
        assert_eq!(
            params.crm_metadata.as_ref().expect("crm metadata")["clientId"],
            "h-id"
        );
        assert_eq!(params.triggered_at, triggered_at);
    }

    #[tokio::test]
    async fn scheduler_scan_bumps_next_run_and_spawns_due_runs() {
        let sources = ScriptedSources::new(vec![], vec![support_customer("Beta", "S1")]);
        let h = harness(sources);
        let now = Utc::now();
        h.configs
            .put_config(WorkflowConfig {
                crm_provider: None,
                next_run_at: Some(now - chrono::Duration::minutes(5)),
                ..test_config()
            })
            .await;
        h.configs
            .put_config(WorkflowConfig {
                user_id: "user-2".to_string(),
                next_run_at: Some(now + chrono::Duration::hours(1)),
                ..test_config()
            })
            .await;
        h.configs
            .put_connection(ProviderConnection {
                user_id: "user-1".to_string(),
                provider: "zendesk".to_string(),
                metadata: json!({ "clientId": "id", "clientSecret": "secret" }),
                connected_at: now,
            })
            .await;

        let scheduler = Scheduler::new(
            Arc::new(h.orchestrator),
            h.configs.clone(),
            "0 * * * * *",
        );
        let started = scheduler.scan_once().await.expect("scan");
        assert_eq!(started, 1);

        let bumped = h
            .configs
            .workflow_config("user-1")
            .await
            .expect("store")
            .expect("config");
        assert!(bumped.next_run_at.expect("next run") > now);

        let mut delivered = 0;
        for _ in 0..100 {
            delivered = h.notifier_calls.load(Ordering::SeqCst);
            if delivered == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn openrouter_generator_extracts_report_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer or-key"))
            .and(body_string_contains("churn risk report"))
            .and(body_string_contains("companyName"))
            .and(body_partial_json(json!({ "model": "anthropic/claude-3.5-sonnet" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "## Executive Summary\nall good",
                    },
                }],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let http = Arc::new(ProviderClient::new(HttpClientConfig::default()).expect("client"));
        let generator = OpenRouterGenerator::new(
            http,
            OpenRouterConfig {
                api_key: "or-key".to_string(),
                base_url: server.uri(),
                model: "anthropic/claude-3.5-sonnet".to_string(),
            },
        );
        let companies =
            combine_companies(None, &[support_customer("Acme", "S1")], "none", "zendesk");

        let report = generator
            .generate(Uuid::new_v4(), &companies)
            .await
            .expect("report");

        assert_eq!(report, "## Executive Summary\nall good");
    }

    #[tokio::test]
    async fn empty_model_response_is_a_malformed_report() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let http = Arc::new(ProviderClient::new(HttpClientConfig::default()).expect("client"));
        let generator = OpenRouterGenerator::new(
            http,
            OpenRouterConfig {
                api_key: "or-key".to_string(),
                base_url: server.uri(),
                model: "anthropic/claude-3.5-sonnet".to_string(),
            },
        );

        let err = generator
            .generate(Uuid::new_v4(), &[])
            .await
            .expect_err("report");

        assert!(matches!(err, ReportError::MalformedReport));
    }

    #[tokio::test]
    async fn email_delivery_posts_the_resend_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .and(header("authorization", "Bearer re-key"))
            .and(body_partial_json(json!({
                "from": "Reports <reports@example.com>",
                "to": ["csm@example.com"],
                "subject": "Customer Churn Risk Report",
                "text": "report body",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "email-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let http = Arc::new(ProviderClient::new(HttpClientConfig::default()).expect("client"));
        let notifier = HttpNotifier::new(
            http,
            ResendConfig {
                api_key: "re-key".to_string(),
                base_url: server.uri(),
                from: "Reports <reports@example.com>".to_string(),
            },
        );

        notifier
            .deliver(
                Uuid::new_v4(),
                ReportDestination::Email,
                "csm@example.com",
                "report body",
            )
            .await
            .expect("deliver");
    }

    #[tokio::test]
    async fn slack_delivery_posts_header_and_section_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/T000/B000"))
            .and(body_partial_json(json!({
                "blocks": [
                    {
                        "type": "header",
                        "text": { "type": "plain_text", "text": "📊 Customer Churn Risk Report" },
                    },
                    {
                        "type": "section",
                        "text": { "type": "mrkdwn", "text": "report body" },
                    },
                ],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let http = Arc::new(ProviderClient::new(HttpClientConfig::default()).expect("client"));
        let notifier = HttpNotifier::new(
            http,
            ResendConfig {
                api_key: String::new(),
                base_url: "https://api.resend.com".to_string(),
                from: "Reports <reports@example.com>".to_string(),
            },
        );
        let webhook = format!("{}/hooks/T000/B000", server.uri());

        notifier
            .deliver(Uuid::new_v4(), ReportDestination::Slack, &webhook, "report body")
            .await
            .expect("deliver");
    }

    #[tokio::test]
    async fn failed_webhook_surfaces_as_a_delivery_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let http = Arc::new(
            ProviderClient::new(HttpClientConfig {
                backoff: BackoffPolicy {
                    max_retries: 0,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                },
                ..Default::default()
            })
            .expect("client"),
        );
        let notifier = HttpNotifier::new(
            http,
            ResendConfig {
                api_key: String::new(),
                base_url: "https://api.resend.com".to_string(),
                from: "Reports <reports@example.com>".to_string(),
            },
        );

        let err = notifier
            .deliver(Uuid::new_v4(), ReportDestination::Slack, &server.uri(), "report")
            .await
            .expect_err("deliver");

        assert!(matches!(
            err,
            DeliveryError::Api {
                destination: "slack",
                ..
            }
        ));
    }
}
