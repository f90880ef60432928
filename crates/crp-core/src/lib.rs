//! Core domain model for CRP: standardized CRM/support schemas, combined
//! records, workflow parameters, and the run/step vocabulary shared by the
//! stores and the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Failed parse of a stored enum token (provider names, destinations, run
/// statuses all round-trip through TEXT columns and env vars).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown CRM provider: {0}")]
    CrmProvider(String),
    #[error("unknown support provider: {0}")]
    SupportProvider(String),
    #[error("unknown report destination: {0}")]
    Destination(String),
    #[error("unknown report frequency: {0}")]
    Frequency(String),
    #[error("unknown run status: {0}")]
    RunStatus(String),
}

/// CRM platforms the pipeline can pull companies from. Closed set; provider
/// strings from config rows must parse into one of these before any fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrmProvider {
    Hubspot,
    Salesforce,
}

impl CrmProvider {
    pub const ALL: [CrmProvider; 2] = [CrmProvider::Hubspot, CrmProvider::Salesforce];

    pub fn as_str(&self) -> &'static str {
        match self {
            CrmProvider::Hubspot => "hubspot",
            CrmProvider::Salesforce => "salesforce",
        }
    }
}

impl fmt::Display for CrmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrmProvider {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hubspot" => Ok(CrmProvider::Hubspot),
            "salesforce" => Ok(CrmProvider::Salesforce),
            other => Err(ParseError::CrmProvider(other.to_string())),
        }
    }
}

/// Support platforms the pipeline can pull customers and tickets from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportProvider {
    Zendesk,
    Intercom,
    Freshdesk,
}

impl SupportProvider {
    pub const ALL: [SupportProvider; 3] = [
        SupportProvider::Zendesk,
        SupportProvider::Intercom,
        SupportProvider::Freshdesk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SupportProvider::Zendesk => "zendesk",
            SupportProvider::Intercom => "intercom",
            SupportProvider::Freshdesk => "freshdesk",
        }
    }
}

impl fmt::Display for SupportProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SupportProvider {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zendesk" => Ok(SupportProvider::Zendesk),
            "intercom" => Ok(SupportProvider::Intercom),
            "freshdesk" => Ok(SupportProvider::Freshdesk),
            other => Err(ParseError::SupportProvider(other.to_string())),
        }
    }
}

/// Where the finished report goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportDestination {
    Email,
    Slack,
}

impl ReportDestination {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportDestination::Email => "email",
            ReportDestination::Slack => "slack",
        }
    }
}

impl fmt::Display for ReportDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportDestination {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(ReportDestination::Email),
            "slack" => Ok(ReportDestination::Slack),
            other => Err(ParseError::Destination(other.to_string())),
        }
    }
}

/// How often a user's scheduled report recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl ReportFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportFrequency::Daily => "daily",
            ReportFrequency::Weekly => "weekly",
            ReportFrequency::Monthly => "monthly",
        }
    }
}

impl fmt::Display for ReportFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportFrequency {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(ReportFrequency::Daily),
            "weekly" => Ok(ReportFrequency::Weekly),
            "monthly" => Ok(ReportFrequency::Monthly),
            other => Err(ParseError::Frequency(other.to_string())),
        }
    }
}

/// Constraint violation detected when an adapter hands over a standardized
/// record.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("company name must be non-empty")]
    EmptyCompanyName,
    #[error("company id must be non-empty for {company:?}")]
    EmptyCompanyId { company: String },
    #[error("customer name must be non-empty for id {id:?}")]
    EmptyCustomerName { id: String },
    #[error("customer {id}: {open} open tickets exceeds {total} total")]
    OpenExceedsTotal { id: String, open: u32, total: u32 },
    #[error("customer {id}: avg CSAT {value} outside [0, 1]")]
    CsatOutOfRange { id: String, value: f64 },
}

/// Open sales opportunity attached to a CRM company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOpportunity {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_days: Option<i64>,
}

/// Open support case tracked inside the CRM itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenCase {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub age_hours: i64,
}

/// Open CRM task (follow-up call, renewal prep, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTask {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    pub age_hours: i64,
}

/// Provider-independent CRM company record. Date fields carry ISO-8601
/// strings as normalized by the adapters; fields with no common-schema home
/// ride in `platform_specific_data`. Serialized field names match the
/// camelCase wire shape the journal and the report prompt use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmCompany {
    pub company_name: String,
    pub company_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_assigned_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_revenue: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_open_deals: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_deal_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_deal_close_date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub open_opportunities: Vec<OpenOpportunity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub open_cases: Vec<OpenCase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub open_tasks: Vec<OpenTask>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csm_sentiment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prospect_rating: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub platform_specific_data: Map<String, Value>,
}

impl CrmCompany {
    /// Minimal record with the two required identity fields.
    pub fn new(company_name: impl Into<String>, company_id: impl Into<String>) -> Self {
        Self {
            company_name: company_name.into(),
            company_id: company_id.into(),
            owner_id: None,
            owner_assigned_date: None,
            lifecycle_stage: None,
            total_revenue: None,
            last_activity_date: None,
            number_of_open_deals: None,
            recent_deal_amount: None,
            recent_deal_close_date: None,
            open_opportunities: Vec::new(),
            open_cases: Vec::new(),
            open_tasks: Vec::new(),
            csm_sentiment: None,
            prospect_rating: None,
            platform_specific_data: Map::new(),
        }
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.company_name.trim().is_empty() {
            return Err(SchemaError::EmptyCompanyName);
        }
        if self.company_id.trim().is_empty() {
            return Err(SchemaError::EmptyCompanyId {
                company: self.company_name.clone(),
            });
        }
        Ok(())
    }
}

/// Standardized priority level for a support ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl TicketPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketPriority::Low => "low",
            TicketPriority::Medium => "medium",
            TicketPriority::High => "high",
            TicketPriority::Urgent => "urgent",
        }
    }

    /// Title-case label used in detailed ticket rows ("Low", "Urgent", ...).
    pub fn label(&self) -> &'static str {
        match self {
            TicketPriority::Low => "Low",
            TicketPriority::Medium => "Medium",
            TicketPriority::High => "High",
            TicketPriority::Urgent => "Urgent",
        }
    }
}

/// Histogram of currently-open tickets by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TicketPriorityCounts {
    pub low: u32,
    pub medium: u32,
    pub high: u32,
    pub urgent: u32,
}

impl TicketPriorityCounts {
    pub fn record(&mut self, priority: TicketPriority) {
        match priority {
            TicketPriority::Low => self.low += 1,
            TicketPriority::Medium => self.medium += 1,
            TicketPriority::High => self.high += 1,
            TicketPriority::Urgent => self.urgent += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.low + self.medium + self.high + self.urgent
    }
}

/// One open ticket in the detailed per-customer list. `subject` vs `title`
/// follows the originating platform's vocabulary; both are carried so the
/// report prompt keeps whichever the provider set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    pub created_at: String,
    pub age_hours: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment_score: Option<f64>,
}

/// Provider-independent support customer record with aggregated ticket
/// counts. `tickets` holds open tickets only and is bounded by the adapter;
/// `ticket_count` still covers everything the provider returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportCustomer {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub ticket_count: u32,
    pub open_tickets: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_csat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewal_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_ticket_priorities: Option<TicketPriorityCounts>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tickets: Vec<Ticket>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub platform_specific_data: Map<String, Value>,
}

impl SupportCustomer {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
            domain: None,
            ticket_count: 0,
            open_tickets: 0,
            avg_csat: None,
            health_score: None,
            account_tier: None,
            renewal_date: None,
            open_ticket_priorities: None,
            tickets: Vec::new(),
            platform_specific_data: Map::new(),
        }
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.name.trim().is_empty() {
            return Err(SchemaError::EmptyCustomerName {
                id: self.id.clone(),
            });
        }
        if self.open_tickets > self.ticket_count {
            return Err(SchemaError::OpenExceedsTotal {
                id: self.id.clone(),
                open: self.open_tickets,
                total: self.ticket_count,
            });
        }
        if let Some(avg) = self.avg_csat {
            if !(0.0..=1.0).contains(&avg) {
                return Err(SchemaError::CsatOutOfRange {
                    id: self.id.clone(),
                    value: avg,
                });
            }
        }
        Ok(())
    }
}

/// CRM record plus the provider it came from, as embedded in a combined row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmWithSource {
    #[serde(flatten)]
    pub company: CrmCompany,
    #[serde(rename = "CRMDataSource")]
    pub source: String,
}

/// Support record plus the provider it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportWithSource {
    #[serde(flatten)]
    pub customer: SupportCustomer,
    #[serde(rename = "supportDataSource")]
    pub source: String,
}

/// One reconciled company row. At least one side is always populated; both
/// sides serialize as explicit `null` when absent so downstream consumers see
/// the same shape for every row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedCompany {
    pub company_name: String,
    #[serde(rename = "CRMData")]
    pub crm_data: Option<CrmWithSource>,
    pub support_data: Option<SupportWithSource>,
}

/// Everything one run needs, assembled by the trigger from the user's config
/// and stored connections before any step executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowParams {
    pub user_id: String,
    pub crm_provider: Option<CrmProvider>,
    pub crm_metadata: Option<Value>,
    pub support_provider: SupportProvider,
    pub support_metadata: Value,
    pub report_destination: ReportDestination,
    pub destination_config: String,
    pub triggered_at: DateTime<Utc>,
}

impl WorkflowParams {
    /// Deterministic run id for this trigger. Two triggers with identical
    /// parameters but different trigger instants get distinct ids; re-deriving
    /// for the same trigger yields the same id.
    pub fn run_id(&self) -> Uuid {
        let crm = self
            .crm_provider
            .map(|p| p.as_str())
            .unwrap_or("none");
        let seed = format!(
            "crp-run:{}:{}:{}:{}:{}",
            self.user_id,
            crm,
            self.support_provider,
            self.report_destination,
            self.triggered_at.timestamp_millis()
        );
        Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes())
    }

    /// The fetch-crm step runs only when both a provider and its connection
    /// metadata were configured.
    pub fn crm_configured(&self) -> bool {
        self.crm_provider.is_some() && self.crm_metadata.is_some()
    }
}

/// Pipeline steps in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepName {
    FetchCrm,
    FetchSupport,
    Combine,
    GenerateReport,
    Deliver,
    LogCompletion,
}

impl StepName {
    pub const ORDER: [StepName; 6] = [
        StepName::FetchCrm,
        StepName::FetchSupport,
        StepName::Combine,
        StepName::GenerateReport,
        StepName::Deliver,
        StepName::LogCompletion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::FetchCrm => "fetch-crm",
            StepName::FetchSupport => "fetch-support",
            StepName::Combine => "combine",
            StepName::GenerateReport => "generate-report",
            StepName::Deliver => "deliver",
            StepName::LogCompletion => "log-completion",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

/// One journal entry: the durable record of a step's latest outcome. A
/// `Completed` entry's `result` is replayed instead of re-executing the step
/// body, which is what keeps external side effects at-most-once across
/// restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn completed(step: StepName, result: Value, attempts: u32, at: DateTime<Utc>) -> Self {
        Self {
            step: step.as_str().to_string(),
            status: StepStatus::Completed,
            result: Some(result),
            error: None,
            attempts,
            updated_at: at,
        }
    }

    pub fn failed(step: StepName, error: String, attempts: u32, at: DateTime<Utc>) -> Self {
        Self {
            step: step.as_str().to_string(),
            status: StepStatus::Failed,
            result: None,
            error: Some(error),
            attempts,
            updated_at: at,
        }
    }
}

/// Lifecycle of one run instance. `StepRetrying` flips back to `Running` when
/// an attempt succeeds; `Completed` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    StepRetrying,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::StepRetrying => "step_retrying",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "step_retrying" => Ok(RunStatus::StepRetrying),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(ParseError::RunStatus(other.to_string())),
        }
    }
}

/// Persisted run row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub user_id: String,
    pub params: WorkflowParams,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted report row written by the log-completion step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub id: String,
    pub user_id: String,
    pub run_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One user's standing report configuration, as managed outside the pipeline
/// and read by the trigger and the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub user_id: String,
    pub crm_provider: Option<CrmProvider>,
    pub support_provider: SupportProvider,
    pub report_frequency: ReportFrequency,
    pub report_destination: ReportDestination,
    pub destination_config: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Stored third-party connection for one user and provider. `metadata` is
/// the provider-specific connection blob (subdomain, instance URL, ...) the
/// adapters parse their credentials from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConnection {
    pub user_id: String,
    pub provider: String,
    pub metadata: Value,
    pub connected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn params(triggered_at: DateTime<Utc>) -> WorkflowParams {
        WorkflowParams {
            user_id: "user-1".into(),
            crm_provider: Some(CrmProvider::Hubspot),
            crm_metadata: Some(serde_json::json!({"portal": "123"})),
            support_provider: SupportProvider::Zendesk,
            support_metadata: serde_json::json!({"subdomain": "acme"}),
            report_destination: ReportDestination::Email,
            destination_config: "csm@example.com".into(),
            triggered_at,
        }
    }

    #[test]
    fn provider_names_round_trip() {
        for provider in CrmProvider::ALL {
            assert_eq!(provider.as_str().parse::<CrmProvider>().unwrap(), provider);
        }
        for provider in SupportProvider::ALL {
            assert_eq!(
                provider.as_str().parse::<SupportProvider>().unwrap(),
                provider
            );
        }
        assert!(matches!(
            "pipedrive".parse::<CrmProvider>(),
            Err(ParseError::CrmProvider(_))
        ));
        assert!(matches!(
            "helpscout".parse::<SupportProvider>(),
            Err(ParseError::SupportProvider(_))
        ));
    }

    #[test]
    fn run_id_is_stable_per_trigger_and_distinct_across_triggers() {
        let first = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 1).unwrap();
        let a = params(first);
        let b = params(first);
        let c = params(later);
        assert_eq!(a.run_id(), b.run_id());
        assert_ne!(a.run_id(), c.run_id());
    }

    #[test]
    fn crm_requires_both_provider_and_metadata() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let mut p = params(at);
        assert!(p.crm_configured());
        p.crm_metadata = None;
        assert!(!p.crm_configured());
        p.crm_provider = None;
        assert!(!p.crm_configured());
    }

    #[test]
    fn support_customer_invariants_are_enforced() {
        let mut customer = SupportCustomer::new("org-1", "Acme");
        customer.ticket_count = 3;
        customer.open_tickets = 1;
        customer.avg_csat = Some(0.5);
        assert!(customer.validate().is_ok());

        customer.open_tickets = 4;
        assert!(matches!(
            customer.validate(),
            Err(SchemaError::OpenExceedsTotal { open: 4, total: 3, .. })
        ));

        customer.open_tickets = 1;
        customer.avg_csat = Some(1.5);
        assert!(matches!(
            customer.validate(),
            Err(SchemaError::CsatOutOfRange { .. })
        ));
    }

    #[test]
    fn priority_counts_accumulate_per_bucket() {
        let mut counts = TicketPriorityCounts::default();
        counts.record(TicketPriority::High);
        counts.record(TicketPriority::High);
        counts.record(TicketPriority::Urgent);
        assert_eq!(counts.high, 2);
        assert_eq!(counts.urgent, 1);
        assert_eq!(counts.low + counts.medium, 0);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn combined_company_serializes_with_original_field_names() {
        let combined = CombinedCompany {
            company_name: "Acme Corp".into(),
            crm_data: Some(CrmWithSource {
                company: CrmCompany::new("Acme Corp", "C1"),
                source: "hubspot".into(),
            }),
            support_data: None,
        };
        let value = serde_json::to_value(&combined).unwrap();
        assert_eq!(value["companyName"], "Acme Corp");
        assert_eq!(value["CRMData"]["CRMDataSource"], "hubspot");
        assert_eq!(value["CRMData"]["companyId"], "C1");
        assert!(value["supportData"].is_null());
    }

    #[test]
    fn step_names_are_kebab_case_in_order() {
        let names: Vec<&str> = StepName::ORDER.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            [
                "fetch-crm",
                "fetch-support",
                "combine",
                "generate-report",
                "deliver",
                "log-completion"
            ]
        );
    }

    #[test]
    fn terminal_statuses_are_final() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::StepRetrying.is_terminal());
        assert_eq!(
            "step_retrying".parse::<RunStatus>().unwrap(),
            RunStatus::StepRetrying
        );
    }
}
