//! Provider adapters: one implementation per CRM/support platform that turns
//! that platform's wire payloads into the standardized records the rest of
//! the pipeline consumes.
//!
//! Every adapter splits fetching from parsing. The fetch half performs the
//! client-credentials token exchange and the data calls through the shared
//! [`ProviderClient`]; the parse half is a pure function from typed raw
//! payloads (plus the fetch instant) to standardized entities, so mapping
//! rules are testable without HTTP.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use crp_core::{
    CrmCompany, CrmProvider, OpenCase, OpenOpportunity, OpenTask, SupportCustomer,
    SupportProvider, Ticket, TicketPriority, TicketPriorityCounts,
};
use crp_storage::{ApiRequest, FetchError, ProviderClient};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Upper bound on the per-customer detailed ticket list. Counts and the
/// priority histogram still cover everything the provider returned.
pub const DEFAULT_TICKET_DETAIL_LIMIT: usize = 50;

const UNKNOWN_COMPANY_KEY: &str = "unknown_company";
const UNKNOWN_COMPANY_NAME: &str = "Unknown Company";

/// Per-fetch context. `fetched_at` is fixed once per fetch so every age in
/// one payload is computed against the same clock.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub ticket_detail_limit: usize,
}

impl FetchContext {
    pub fn new(run_id: Uuid) -> Self {
        Self::at(run_id, Utc::now())
    }

    pub fn at(run_id: Uuid, fetched_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            fetched_at,
            ticket_detail_limit: DEFAULT_TICKET_DETAIL_LIMIT,
        }
    }

    pub fn with_ticket_detail_limit(mut self, limit: usize) -> Self {
        self.ticket_detail_limit = limit;
        self
    }
}

/// Adapter-level failure. Any variant aborts the whole fetch; adapters never
/// hand back a partial merge of successful and failed calls.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{provider} authentication failed: {message}")]
    Auth {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} API call failed: {message}")]
    Api {
        provider: &'static str,
        status: Option<u16>,
        message: String,
    },
    #[error("{provider} connection metadata is unusable: {message}")]
    Credentials {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} returned an undecodable payload: {message}")]
    Decode {
        provider: &'static str,
        message: String,
    },
}

fn token_error(provider: &'static str, err: FetchError) -> AdapterError {
    AdapterError::Auth {
        provider,
        message: err.to_string(),
    }
}

fn api_error(provider: &'static str, err: FetchError) -> AdapterError {
    match &err {
        FetchError::Decode { .. } => AdapterError::Decode {
            provider,
            message: err.to_string(),
        },
        _ => AdapterError::Api {
            provider,
            status: err.status(),
            message: err.to_string(),
        },
    }
}

#[async_trait]
pub trait CrmSource: Send + Sync {
    fn provider(&self) -> CrmProvider;

    async fn fetch_companies(
        &self,
        http: &ProviderClient,
        ctx: &FetchContext,
        metadata: &Value,
    ) -> Result<Vec<CrmCompany>, AdapterError>;
}

#[async_trait]
pub trait SupportSource: Send + Sync {
    fn provider(&self) -> SupportProvider;

    async fn fetch_customers(
        &self,
        http: &ProviderClient,
        ctx: &FetchContext,
        metadata: &Value,
    ) -> Result<Vec<SupportCustomer>, AdapterError>;
}

pub fn hubspot_source() -> impl CrmSource {
    HubspotSource
}

pub fn salesforce_source() -> impl CrmSource {
    SalesforceSource
}

pub fn zendesk_source() -> impl SupportSource {
    ZendeskSource
}

pub fn intercom_source() -> impl SupportSource {
    IntercomSource
}

pub fn freshdesk_source() -> impl SupportSource {
    FreshdeskSource
}

/// Total over the closed provider enum; adding a CRM platform starts here.
pub fn crm_source_for(provider: CrmProvider) -> Box<dyn CrmSource> {
    match provider {
        CrmProvider::Hubspot => Box::new(HubspotSource),
        CrmProvider::Salesforce => Box::new(SalesforceSource),
    }
}

pub fn support_source_for(provider: SupportProvider) -> Box<dyn SupportSource> {
    match provider {
        SupportProvider::Zendesk => Box::new(ZendeskSource),
        SupportProvider::Intercom => Box::new(IntercomSource),
        SupportProvider::Freshdesk => Box::new(FreshdeskSource),
    }
}

fn connection_credentials<T: DeserializeOwned>(
    provider: &'static str,
    metadata: &Value,
) -> Result<T, AdapterError> {
    serde_json::from_value(metadata.clone()).map_err(|err| AdapterError::Credentials {
        provider,
        message: err.to_string(),
    })
}

fn trim_base(raw: &str) -> String {
    raw.trim_end_matches('/').to_string()
}

#[derive(Debug, Deserialize)]
struct OauthToken {
    access_token: String,
}

fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    // Salesforce stamps offsets without a colon ("+0000"), which RFC 3339
    // parsing rejects.
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn hours_between(created: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    ((now - created).num_seconds() as f64 / 3600.0).round() as i64
}

fn days_between(created: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    ((now - created).num_seconds() as f64 / 86_400.0).round() as i64
}

fn age_hours_from_iso(raw: Option<&str>, now: DateTime<Utc>) -> i64 {
    raw.and_then(parse_instant)
        .map(|created| hours_between(created, now))
        .unwrap_or(0)
}

fn instant_from_epoch_secs(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

fn iso_from_epoch_secs(secs: i64) -> Option<String> {
    instant_from_epoch_secs(secs).map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// HubSpot properties arrive as strings but fixtures and older portals carry
/// bare numbers; both count, everything else does not.
fn iso_from_epoch_ms(value: Option<&Value>) -> Option<String> {
    let ms = match value? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) if !s.trim().is_empty() => s.trim().parse().ok()?,
        _ => return None,
    };
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn numeric_or_zero(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn priority_bucket(label: &str) -> Option<TicketPriority> {
    match label.to_ascii_lowercase().as_str() {
        "low" => Some(TicketPriority::Low),
        "medium" => Some(TicketPriority::Medium),
        "high" => Some(TicketPriority::High),
        "urgent" => Some(TicketPriority::Urgent),
        _ => None,
    }
}

fn keep_valid_companies(provider: &'static str, companies: Vec<CrmCompany>) -> Vec<CrmCompany> {
    companies
        .into_iter()
        .filter(|company| match company.validate() {
            Ok(()) => true,
            Err(err) => {
                warn!(provider, error = %err, "dropping CRM record failing schema constraints");
                false
            }
        })
        .collect()
}

fn keep_valid_customers(
    provider: &'static str,
    customers: Vec<SupportCustomer>,
) -> Vec<SupportCustomer> {
    customers
        .into_iter()
        .filter(|customer| match customer.validate() {
            Ok(()) => true,
            Err(err) => {
                warn!(provider, error = %err, "dropping support record failing schema constraints");
                false
            }
        })
        .collect()
}

/// Tickets bucketed by company key, preserving first-seen key order so the
/// customer list is deterministic for a given payload.
struct TicketGroups<'a, T> {
    order: Vec<String>,
    by_key: HashMap<String, Vec<&'a T>>,
}

impl<'a, T> TicketGroups<'a, T> {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            by_key: HashMap::new(),
        }
    }

    fn push(&mut self, key: String, ticket: &'a T) {
        if !self.by_key.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.by_key.entry(key).or_default().push(ticket);
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &[&'a T])> + '_ {
        self.order
            .iter()
            .map(|key| (key.as_str(), self.by_key[key].as_slice()))
    }
}

// ---------------------------------------------------------------------------
// HubSpot
// ---------------------------------------------------------------------------

const HUBSPOT_API_BASE: &str = "https://api.hubapi.com";

const HUBSPOT_COMPANY_PROPERTIES: [&str; 13] = [
    "name",
    "hubspot_owner_id",
    "lifecyclestage",
    "total_revenue",
    "hs_csm_sentiment",
    "notes_last_contacted",
    "closedate",
    "notes_last_updated",
    "num_associated_deals",
    "hubspot_owner_assigneddate",
    "hs_num_open_deals",
    "recent_deal_close_date",
    "recent_deal_amount",
];

/// Connection blob written at connect time. `apiBase` overrides the public
/// endpoint for sandbox portals and tests.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HubspotCredentials {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    api_base: Option<String>,
}

impl HubspotCredentials {
    fn base_url(&self) -> String {
        trim_base(self.api_base.as_deref().unwrap_or(HUBSPOT_API_BASE))
    }
}

#[derive(Debug, Deserialize)]
struct HubspotCompanyList {
    #[serde(default)]
    results: Vec<HubspotRawCompany>,
}

#[derive(Debug, Deserialize)]
struct HubspotRawCompany {
    id: Option<String>,
    #[serde(default)]
    properties: HubspotProperties,
}

#[derive(Debug, Default, Deserialize)]
struct HubspotProperties {
    name: Option<String>,
    hubspot_owner_id: Option<String>,
    lifecyclestage: Option<String>,
    total_revenue: Option<Value>,
    hs_csm_sentiment: Option<String>,
    notes_last_contacted: Option<Value>,
    closedate: Option<Value>,
    notes_last_updated: Option<Value>,
    hubspot_owner_assigneddate: Option<Value>,
    hs_num_open_deals: Option<Value>,
    recent_deal_close_date: Option<Value>,
    recent_deal_amount: Option<Value>,
}

struct HubspotSource;

async fn hubspot_token(
    http: &ProviderClient,
    ctx: &FetchContext,
    creds: &HubspotCredentials,
    base: &str,
) -> Result<String, AdapterError> {
    let provider = CrmProvider::Hubspot.as_str();
    let request = ApiRequest::post_form(
        format!("{base}/oauth/v1/token"),
        &[
            ("grant_type", "client_credentials"),
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.as_str()),
        ],
    );
    let token: OauthToken = http
        .execute_json(ctx.run_id, provider, &request)
        .await
        .map_err(|err| token_error(provider, err))?;
    Ok(token.access_token)
}

fn parse_hubspot_companies(payload: &HubspotCompanyList) -> Vec<CrmCompany> {
    payload
        .results
        .iter()
        .map(|raw| {
            let props = &raw.properties;
            let mut company = CrmCompany::new(
                props.name.clone().unwrap_or_default(),
                raw.id.clone().unwrap_or_default(),
            );
            company.owner_id = props.hubspot_owner_id.clone();
            company.owner_assigned_date =
                iso_from_epoch_ms(props.hubspot_owner_assigneddate.as_ref());
            company.lifecycle_stage = props.lifecyclestage.clone();
            company.total_revenue = Some(numeric_or_zero(props.total_revenue.as_ref()));
            company.number_of_open_deals =
                Some(numeric_or_zero(props.hs_num_open_deals.as_ref()) as i64);
            company.recent_deal_amount = Some(numeric_or_zero(props.recent_deal_amount.as_ref()));
            company.recent_deal_close_date =
                iso_from_epoch_ms(props.recent_deal_close_date.as_ref());
            company.csm_sentiment = props.hs_csm_sentiment.clone();
            company.platform_specific_data = hubspot_platform_data(props);
            company
        })
        .collect()
}

/// Fields with no standardized home keep their original camelCase names so
/// downstream consumers of the combined record see the familiar shape.
fn hubspot_platform_data(props: &HubspotProperties) -> Map<String, Value> {
    let mut extra = Map::new();
    extra.insert(
        "companyCloseDate".to_string(),
        json_or_null(iso_from_epoch_ms(props.closedate.as_ref())),
    );
    extra.insert(
        "lastUpdated".to_string(),
        json_or_null(iso_from_epoch_ms(props.notes_last_updated.as_ref())),
    );
    extra.insert(
        "lastContacted".to_string(),
        json_or_null(iso_from_epoch_ms(props.notes_last_contacted.as_ref())),
    );
    extra
}

fn json_or_null(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

#[async_trait]
impl CrmSource for HubspotSource {
    fn provider(&self) -> CrmProvider {
        CrmProvider::Hubspot
    }

    async fn fetch_companies(
        &self,
        http: &ProviderClient,
        ctx: &FetchContext,
        metadata: &Value,
    ) -> Result<Vec<CrmCompany>, AdapterError> {
        let provider = self.provider().as_str();
        let creds: HubspotCredentials = connection_credentials(provider, metadata)?;
        let base = creds.base_url();
        let token = hubspot_token(http, ctx, &creds, &base).await?;

        let url = format!(
            "{base}/crm/v3/objects/companies?properties={}",
            HUBSPOT_COMPANY_PROPERTIES.join(",")
        );
        let payload: HubspotCompanyList = http
            .execute_json(
                ctx.run_id,
                provider,
                &ApiRequest::get(url).bearer(token.as_str()),
            )
            .await
            .map_err(|err| api_error(provider, err))?;

        Ok(keep_valid_companies(
            provider,
            parse_hubspot_companies(&payload),
        ))
    }
}

// ---------------------------------------------------------------------------
// Salesforce
// ---------------------------------------------------------------------------

const SALESFORCE_ACCOUNTS_QUERY: &str =
    "SELECT Id, Name, Type, LastActivityDate, Rating FROM Account";
const SALESFORCE_CASES_QUERY: &str = "SELECT Id, AccountId, Subject, Description, CreatedDate, \
     LastModifiedDate, Type, Priority, Status, Reason, IsEscalated, IsClosed, IsDeleted FROM Case";
const SALESFORCE_OPPORTUNITIES_QUERY: &str = "SELECT Id, AccountId, Name, Amount, Type, \
     StageName, Probability, CreatedDate, CloseDate, IsClosed, IsDeleted FROM Opportunity";
const SALESFORCE_TASKS_QUERY: &str = "SELECT Id, AccountId, Subject, Description, Status, \
     Priority, CreatedDate, ActivityDate, IsClosed, IsArchived FROM Task";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SalesforceCredentials {
    instance_url: String,
    client_id: String,
    client_secret: String,
}

impl SalesforceCredentials {
    fn base_url(&self) -> String {
        trim_base(&self.instance_url)
    }
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct SoqlResult<T> {
    #[serde(default)]
    records: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SalesforceAccount {
    id: Option<String>,
    name: Option<String>,
    #[serde(rename = "Type")]
    account_type: Option<String>,
    last_activity_date: Option<String>,
    rating: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SalesforceCase {
    id: Option<String>,
    account_id: Option<String>,
    subject: Option<String>,
    priority: Option<String>,
    status: Option<String>,
    created_date: Option<String>,
    #[serde(default)]
    is_closed: bool,
    #[serde(default)]
    is_deleted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SalesforceOpportunity {
    id: Option<String>,
    account_id: Option<String>,
    name: Option<String>,
    amount: Option<f64>,
    stage_name: Option<String>,
    probability: Option<f64>,
    created_date: Option<String>,
    #[serde(default)]
    is_closed: bool,
    #[serde(default)]
    is_deleted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SalesforceTask {
    id: Option<String>,
    account_id: Option<String>,
    subject: Option<String>,
    priority: Option<String>,
    created_date: Option<String>,
    activity_date: Option<String>,
    #[serde(default)]
    is_closed: bool,
    #[serde(default)]
    is_archived: bool,
}

struct SalesforceSource;

async fn salesforce_token(
    http: &ProviderClient,
    ctx: &FetchContext,
    creds: &SalesforceCredentials,
    base: &str,
) -> Result<String, AdapterError> {
    let provider = CrmProvider::Salesforce.as_str();
    let request = ApiRequest::post_form(
        format!("{base}/services/oauth2/token"),
        &[
            ("grant_type", "client_credentials"),
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.as_str()),
        ],
    );
    let token: OauthToken = http
        .execute_json(ctx.run_id, provider, &request)
        .await
        .map_err(|err| token_error(provider, err))?;
    Ok(token.access_token)
}

async fn soql_query<T: DeserializeOwned>(
    http: &ProviderClient,
    ctx: &FetchContext,
    base: &str,
    token: &str,
    query: &str,
) -> Result<SoqlResult<T>, AdapterError> {
    let provider = CrmProvider::Salesforce.as_str();
    let request =
        ApiRequest::get(format!("{base}/services/data/v65.0/query?q={query}")).bearer(token);
    http.execute_json(ctx.run_id, provider, &request)
        .await
        .map_err(|err| api_error(provider, err))
}

fn parse_salesforce_accounts(
    accounts: &[SalesforceAccount],
    cases: &[SalesforceCase],
    opportunities: &[SalesforceOpportunity],
    tasks: &[SalesforceTask],
    fetched_at: DateTime<Utc>,
) -> Vec<CrmCompany> {
    let mut cases_by_account: HashMap<&str, Vec<OpenCase>> = HashMap::new();
    for case in cases.iter().filter(|c| !c.is_closed && !c.is_deleted) {
        let Some(account_id) = case.account_id.as_deref() else {
            continue;
        };
        cases_by_account.entry(account_id).or_default().push(OpenCase {
            id: case.id.clone().unwrap_or_default(),
            subject: case.subject.clone(),
            priority: case.priority.clone(),
            status: case.status.clone(),
            age_hours: age_hours_from_iso(case.created_date.as_deref(), fetched_at),
        });
    }

    let mut opps_by_account: HashMap<&str, Vec<OpenOpportunity>> = HashMap::new();
    for opp in opportunities.iter().filter(|o| !o.is_closed && !o.is_deleted) {
        let Some(account_id) = opp.account_id.as_deref() else {
            continue;
        };
        opps_by_account.entry(account_id).or_default().push(OpenOpportunity {
            id: opp.id.clone().unwrap_or_default(),
            name: opp.name.clone().unwrap_or_default(),
            amount: opp.amount,
            stage: opp.stage_name.clone(),
            probability: opp.probability,
            age_days: opp
                .created_date
                .as_deref()
                .and_then(parse_instant)
                .map(|created| days_between(created, fetched_at)),
        });
    }

    let mut tasks_by_account: HashMap<&str, Vec<OpenTask>> = HashMap::new();
    for task in tasks.iter().filter(|t| !t.is_closed && !t.is_archived) {
        let Some(account_id) = task.account_id.as_deref() else {
            continue;
        };
        tasks_by_account.entry(account_id).or_default().push(OpenTask {
            id: task.id.clone().unwrap_or_default(),
            subject: task.subject.clone(),
            priority: task.priority.clone(),
            due_date: task.activity_date.clone(),
            age_hours: age_hours_from_iso(task.created_date.as_deref(), fetched_at),
        });
    }

    accounts
        .iter()
        .map(|account| {
            let account_id = account.id.clone().unwrap_or_default();
            let mut company =
                CrmCompany::new(account.name.clone().unwrap_or_default(), account_id.clone());
            company.last_activity_date = account.last_activity_date.clone();
            company.prospect_rating = account.rating.clone();
            company.open_cases = cases_by_account
                .remove(account_id.as_str())
                .unwrap_or_default();
            company.open_opportunities = opps_by_account
                .remove(account_id.as_str())
                .unwrap_or_default();
            company.open_tasks = tasks_by_account
                .remove(account_id.as_str())
                .unwrap_or_default();
            company.platform_specific_data.insert(
                "accountType".to_string(),
                account
                    .account_type
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            );
            company
        })
        .collect()
}

#[async_trait]
impl CrmSource for SalesforceSource {
    fn provider(&self) -> CrmProvider {
        CrmProvider::Salesforce
    }

    async fn fetch_companies(
        &self,
        http: &ProviderClient,
        ctx: &FetchContext,
        metadata: &Value,
    ) -> Result<Vec<CrmCompany>, AdapterError> {
        let provider = self.provider().as_str();
        let creds: SalesforceCredentials = connection_credentials(provider, metadata)?;
        let base = creds.base_url();
        let token = salesforce_token(http, ctx, &creds, &base).await?;

        let accounts: SoqlResult<SalesforceAccount> =
            soql_query(http, ctx, &base, &token, SALESFORCE_ACCOUNTS_QUERY).await?;
        let cases: SoqlResult<SalesforceCase> =
            soql_query(http, ctx, &base, &token, SALESFORCE_CASES_QUERY).await?;
        let opportunities: SoqlResult<SalesforceOpportunity> =
            soql_query(http, ctx, &base, &token, SALESFORCE_OPPORTUNITIES_QUERY).await?;
        let tasks: SoqlResult<SalesforceTask> =
            soql_query(http, ctx, &base, &token, SALESFORCE_TASKS_QUERY).await?;

        Ok(keep_valid_companies(
            provider,
            parse_salesforce_accounts(
                &accounts.records,
                &cases.records,
                &opportunities.records,
                &tasks.records,
                ctx.fetched_at,
            ),
        ))
    }
}

// ---------------------------------------------------------------------------
// Zendesk
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZendeskCredentials {
    subdomain: String,
    client_id: String,
    client_secret: String,
    #[serde(default)]
    api_base: Option<String>,
}

impl ZendeskCredentials {
    fn base_url(&self) -> String {
        match &self.api_base {
            Some(base) => trim_base(base),
            None => format!("https://{}.zendesk.com", self.subdomain),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ZendeskTicketList {
    #[serde(default)]
    tickets: Vec<ZendeskTicket>,
}

#[derive(Debug, Deserialize)]
struct ZendeskTicket {
    id: Option<i64>,
    subject: Option<String>,
    status: Option<String>,
    priority: Option<String>,
    created_at: Option<String>,
    organization_id: Option<i64>,
    #[serde(default)]
    tags: Vec<String>,
    satisfaction_rating: Option<ZendeskSatisfaction>,
}

#[derive(Debug, Deserialize)]
struct ZendeskSatisfaction {
    score: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ZendeskOrgList {
    #[serde(default)]
    organizations: Vec<ZendeskOrg>,
}

#[derive(Debug, Deserialize)]
struct ZendeskOrg {
    id: i64,
    name: Option<String>,
}

struct ZendeskSource;

async fn zendesk_token(
    http: &ProviderClient,
    ctx: &FetchContext,
    creds: &ZendeskCredentials,
    base: &str,
) -> Result<String, AdapterError> {
    let provider = SupportProvider::Zendesk.as_str();
    let request = ApiRequest::post_json(
        format!("{base}/oauth/tokens"),
        serde_json::json!({
            "grant_type": "client_credentials",
            "client_id": creds.client_id.as_str(),
            "client_secret": creds.client_secret.as_str(),
            "scope": "read write",
        }),
    );
    let token: OauthToken = http
        .execute_json(ctx.run_id, provider, &request)
        .await
        .map_err(|err| token_error(provider, err))?;
    Ok(token.access_token)
}

fn zendesk_is_open(ticket: &ZendeskTicket) -> bool {
    matches!(ticket.status.as_deref(), Some("open") | Some("pending"))
}

/// `good` counts as 1, any other recorded score as 0; `unoffered` and absent
/// ratings stay out of the average entirely.
fn zendesk_csat_score(ticket: &ZendeskTicket) -> Option<f64> {
    let score = ticket.satisfaction_rating.as_ref()?.score.as_deref()?;
    match score {
        "" | "unoffered" => None,
        "good" => Some(1.0),
        _ => Some(0.0),
    }
}

/// Missing priorities count as `normal`, and `normal` lands in the
/// standardized `medium` bucket.
fn zendesk_priority_bucket(raw: Option<&str>) -> Option<TicketPriority> {
    match raw.unwrap_or("normal") {
        "low" => Some(TicketPriority::Low),
        "normal" => Some(TicketPriority::Medium),
        "high" => Some(TicketPriority::High),
        "urgent" => Some(TicketPriority::Urgent),
        _ => None,
    }
}

fn parse_zendesk_customers(
    payload: &ZendeskTicketList,
    orgs: &ZendeskOrgList,
    ctx: &FetchContext,
) -> Vec<SupportCustomer> {
    let mut groups = TicketGroups::new();
    for ticket in &payload.tickets {
        let key = ticket
            .organization_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| UNKNOWN_COMPANY_KEY.to_string());
        groups.push(key, ticket);
    }

    let names: HashMap<String, &str> = orgs
        .organizations
        .iter()
        .filter_map(|org| org.name.as_deref().map(|name| (org.id.to_string(), name)))
        .collect();

    groups
        .iter()
        .map(|(company_id, tickets)| {
            let open: Vec<&ZendeskTicket> = tickets
                .iter()
                .copied()
                .filter(|t| zendesk_is_open(t))
                .collect();

            let mut priorities = TicketPriorityCounts::default();
            for ticket in &open {
                if let Some(bucket) = zendesk_priority_bucket(ticket.priority.as_deref()) {
                    priorities.record(bucket);
                }
            }

            let scores: Vec<f64> = tickets
                .iter()
                .copied()
                .filter(|t| t.status.as_deref() == Some("solved"))
                .filter_map(zendesk_csat_score)
                .collect();
            let avg_csat = if scores.is_empty() {
                None
            } else {
                Some(scores.iter().sum::<f64>() / scores.len() as f64)
            };

            let mut detail: Vec<Ticket> = open
                .iter()
                .map(|t| Ticket {
                    id: t.id.map(|id| id.to_string()).unwrap_or_default(),
                    subject: t.subject.clone(),
                    title: None,
                    status: t.status.clone().unwrap_or_default(),
                    priority: t.priority.clone(),
                    created_at: t.created_at.clone().unwrap_or_default(),
                    age_hours: age_hours_from_iso(t.created_at.as_deref(), ctx.fetched_at),
                    tags: t.tags.clone(),
                    sentiment_score: None,
                })
                .collect();
            detail.truncate(ctx.ticket_detail_limit);

            let mut customer = SupportCustomer::new(
                company_id,
                names.get(company_id).copied().unwrap_or(UNKNOWN_COMPANY_NAME),
            );
            customer.email = Some(String::new());
            customer.ticket_count = tickets.len() as u32;
            customer.open_tickets = open.len() as u32;
            customer.avg_csat = avg_csat;
            customer.open_ticket_priorities = Some(priorities);
            customer.tickets = detail;
            customer
        })
        .collect()
}

#[async_trait]
impl SupportSource for ZendeskSource {
    fn provider(&self) -> SupportProvider {
        SupportProvider::Zendesk
    }

    async fn fetch_customers(
        &self,
        http: &ProviderClient,
        ctx: &FetchContext,
        metadata: &Value,
    ) -> Result<Vec<SupportCustomer>, AdapterError> {
        let provider = self.provider().as_str();
        let creds: ZendeskCredentials = connection_credentials(provider, metadata)?;
        let base = creds.base_url();
        let token = zendesk_token(http, ctx, &creds, &base).await?;

        let tickets: ZendeskTicketList = http
            .execute_json(
                ctx.run_id,
                provider,
                &ApiRequest::get(format!("{base}/api/v2/tickets.json")).bearer(token.as_str()),
            )
            .await
            .map_err(|err| api_error(provider, err))?;
        let orgs: ZendeskOrgList = http
            .execute_json(
                ctx.run_id,
                provider,
                &ApiRequest::get(format!("{base}/api/v2/organizations.json"))
                    .bearer(token.as_str()),
            )
            .await
            .map_err(|err| api_error(provider, err))?;

        Ok(keep_valid_customers(
            provider,
            parse_zendesk_customers(&tickets, &orgs, ctx),
        ))
    }
}

// ---------------------------------------------------------------------------
// Intercom
// ---------------------------------------------------------------------------

const INTERCOM_API_BASE: &str = "https://api.intercom.io";
const INTERCOM_API_VERSION: &str = "2.14";
const INTERCOM_PAGE_SIZE: u32 = 150;
// Search requires at least one filter; this epoch-seconds floor predates the
// product and matches everything.
const INTERCOM_CREATED_AFTER: &str = "1306054154";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntercomCredentials {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    api_base: Option<String>,
}

impl IntercomCredentials {
    fn base_url(&self) -> String {
        trim_base(self.api_base.as_deref().unwrap_or(INTERCOM_API_BASE))
    }
}

#[derive(Debug, Deserialize)]
struct EagleToken {
    token: String,
}

#[derive(Debug, Deserialize)]
struct IntercomTicketList {
    #[serde(default)]
    tickets: Vec<IntercomTicket>,
}

#[derive(Debug, Deserialize)]
struct IntercomTicket {
    id: Option<String>,
    #[serde(default)]
    open: bool,
    company_id: Option<String>,
    ticket_attributes: Option<IntercomTicketAttributes>,
    ticket_state: Option<IntercomTicketState>,
    created_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct IntercomTicketAttributes {
    #[serde(rename = "_default_title_")]
    default_title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntercomTicketState {
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntercomCompanyList {
    #[serde(default)]
    data: Vec<IntercomCompany>,
}

#[derive(Debug, Deserialize)]
struct IntercomCompany {
    id: Option<String>,
    name: Option<String>,
}

struct IntercomSource;

async fn intercom_token(
    http: &ProviderClient,
    ctx: &FetchContext,
    creds: &IntercomCredentials,
    base: &str,
) -> Result<String, AdapterError> {
    let provider = SupportProvider::Intercom.as_str();
    let request = ApiRequest::post_json(
        format!("{base}/auth/eagle/token"),
        serde_json::json!({
            "client_id": creds.client_id.as_str(),
            "client_secret": creds.client_secret.as_str(),
        }),
    );
    let token: EagleToken = http
        .execute_json(ctx.run_id, provider, &request)
        .await
        .map_err(|err| token_error(provider, err))?;
    Ok(token.token)
}

fn parse_intercom_customers(
    payload: &IntercomTicketList,
    companies: &IntercomCompanyList,
    ctx: &FetchContext,
) -> Vec<SupportCustomer> {
    let mut groups = TicketGroups::new();
    for ticket in payload.tickets.iter().filter(|t| t.open) {
        let key = ticket
            .company_id
            .clone()
            .unwrap_or_else(|| UNKNOWN_COMPANY_KEY.to_string());
        groups.push(key, ticket);
    }

    let names: HashMap<&str, &str> = companies
        .data
        .iter()
        .filter_map(|company| match (company.id.as_deref(), company.name.as_deref()) {
            (Some(id), Some(name)) => Some((id, name)),
            _ => None,
        })
        .collect();

    groups
        .iter()
        .map(|(company_id, tickets)| {
            let mut detail: Vec<Ticket> = tickets
                .iter()
                .map(|t| Ticket {
                    id: t.id.clone().unwrap_or_default(),
                    subject: None,
                    title: t
                        .ticket_attributes
                        .as_ref()
                        .and_then(|attrs| attrs.default_title.clone()),
                    // The search filter already scopes to open tickets.
                    status: t
                        .ticket_state
                        .as_ref()
                        .and_then(|state| state.category.clone())
                        .unwrap_or_else(|| "open".to_string()),
                    priority: None,
                    created_at: t.created_at.and_then(iso_from_epoch_secs).unwrap_or_default(),
                    age_hours: t
                        .created_at
                        .and_then(instant_from_epoch_secs)
                        .map(|created| hours_between(created, ctx.fetched_at))
                        .unwrap_or(0),
                    tags: Vec::new(),
                    sentiment_score: None,
                })
                .collect();
            detail.truncate(ctx.ticket_detail_limit);

            let count = tickets.len() as u32;
            let mut customer = SupportCustomer::new(
                company_id,
                names.get(company_id).copied().unwrap_or(UNKNOWN_COMPANY_NAME),
            );
            customer.email = Some(String::new());
            customer.ticket_count = count;
            customer.open_tickets = count;
            customer.tickets = detail;
            customer
        })
        .collect()
}

#[async_trait]
impl SupportSource for IntercomSource {
    fn provider(&self) -> SupportProvider {
        SupportProvider::Intercom
    }

    async fn fetch_customers(
        &self,
        http: &ProviderClient,
        ctx: &FetchContext,
        metadata: &Value,
    ) -> Result<Vec<SupportCustomer>, AdapterError> {
        let provider = self.provider().as_str();
        let creds: IntercomCredentials = connection_credentials(provider, metadata)?;
        let base = creds.base_url();
        let token = intercom_token(http, ctx, &creds, &base).await?;

        let search = ApiRequest::post_json(
            format!("{base}/tickets/search"),
            serde_json::json!({
                "query": {
                    "operator": "AND",
                    "value": [{
                        "field": "created_at",
                        "operator": ">",
                        "value": INTERCOM_CREATED_AFTER,
                    }],
                },
                "pagination": { "per_page": INTERCOM_PAGE_SIZE },
            }),
        )
        .bearer(token.as_str())
        .header("Intercom-Version", INTERCOM_API_VERSION);
        let tickets: IntercomTicketList = http
            .execute_json(ctx.run_id, provider, &search)
            .await
            .map_err(|err| api_error(provider, err))?;

        let companies: IntercomCompanyList = http
            .execute_json(
                ctx.run_id,
                provider,
                &ApiRequest::get(format!("{base}/companies"))
                    .bearer(token.as_str())
                    .header("Intercom-Version", INTERCOM_API_VERSION),
            )
            .await
            .map_err(|err| api_error(provider, err))?;

        Ok(keep_valid_customers(
            provider,
            parse_intercom_customers(&tickets, &companies, ctx),
        ))
    }
}

// ---------------------------------------------------------------------------
// Freshdesk
// ---------------------------------------------------------------------------

const FRESHDESK_STATUS_OPEN: i64 = 2;
const FRESHDESK_UNKNOWN_KEY: &str = "Unknown";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FreshdeskCredentials {
    subdomain: String,
    client_id: String,
    client_secret: String,
    #[serde(default)]
    api_base: Option<String>,
}

impl FreshdeskCredentials {
    fn base_url(&self) -> String {
        match &self.api_base {
            Some(base) => trim_base(base),
            None => format!("https://{}.freshdesk.com", self.subdomain),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FreshdeskTicket {
    id: Option<i64>,
    subject: Option<String>,
    status: Option<i64>,
    priority: Option<i64>,
    created_at: Option<String>,
    company_id: Option<i64>,
    #[serde(default)]
    tags: Vec<String>,
    sentiment_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FreshdeskCompany {
    id: Option<i64>,
    name: Option<String>,
    health_score: Option<f64>,
    account_tier: Option<String>,
    renewal_date: Option<String>,
}

struct FreshdeskSource;

async fn freshdesk_token(
    http: &ProviderClient,
    ctx: &FetchContext,
    creds: &FreshdeskCredentials,
    base: &str,
) -> Result<String, AdapterError> {
    let provider = SupportProvider::Freshdesk.as_str();
    let request = ApiRequest::post_json(
        format!("{base}/oauth/token"),
        serde_json::json!({
            "grant_type": "client_credentials",
            "client_id": creds.client_id.as_str(),
            "client_secret": creds.client_secret.as_str(),
        }),
    );
    let token: OauthToken = http
        .execute_json(ctx.run_id, provider, &request)
        .await
        .map_err(|err| token_error(provider, err))?;
    Ok(token.access_token)
}

fn freshdesk_status_label(status: Option<i64>) -> String {
    match status {
        Some(2) => "Open".to_string(),
        Some(3) => "Pending".to_string(),
        Some(4) => "Resolved".to_string(),
        Some(5) => "Closed".to_string(),
        Some(other) => other.to_string(),
        None => "Unknown".to_string(),
    }
}

fn freshdesk_priority_label(priority: Option<i64>) -> Option<String> {
    match priority {
        Some(1) => Some("Low".to_string()),
        Some(2) => Some("Medium".to_string()),
        Some(3) => Some("High".to_string()),
        Some(4) => Some("Urgent".to_string()),
        Some(other) => Some(other.to_string()),
        None => None,
    }
}

fn parse_freshdesk_customers(
    tickets: &[FreshdeskTicket],
    companies: &[FreshdeskCompany],
    ctx: &FetchContext,
) -> Vec<SupportCustomer> {
    let mut groups = TicketGroups::new();
    for ticket in tickets {
        let key = ticket
            .company_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| FRESHDESK_UNKNOWN_KEY.to_string());
        groups.push(key, ticket);
    }

    let details: HashMap<String, &FreshdeskCompany> = companies
        .iter()
        .filter_map(|company| company.id.map(|id| (id.to_string(), company)))
        .collect();

    groups
        .iter()
        .map(|(company_id, group)| {
            let mut priorities = TicketPriorityCounts::default();
            let mut open_count = 0u32;
            for ticket in group
                .iter()
                .copied()
                .filter(|t| t.status == Some(FRESHDESK_STATUS_OPEN))
            {
                open_count += 1;
                if let Some(bucket) = freshdesk_priority_label(ticket.priority)
                    .as_deref()
                    .and_then(priority_bucket)
                {
                    priorities.record(bucket);
                }
            }

            let mut detail: Vec<Ticket> = group
                .iter()
                .copied()
                .filter(|t| t.status == Some(FRESHDESK_STATUS_OPEN))
                .map(|t| Ticket {
                    id: t.id.map(|id| id.to_string()).unwrap_or_default(),
                    subject: t.subject.clone(),
                    title: None,
                    status: freshdesk_status_label(t.status),
                    priority: freshdesk_priority_label(t.priority),
                    created_at: t.created_at.clone().unwrap_or_default(),
                    age_hours: age_hours_from_iso(t.created_at.as_deref(), ctx.fetched_at),
                    tags: t.tags.clone(),
                    sentiment_score: t.sentiment_score,
                })
                .collect();
            detail.truncate(ctx.ticket_detail_limit);

            let info = details.get(company_id);
            let mut customer = SupportCustomer::new(
                company_id,
                info.and_then(|c| c.name.as_deref())
                    .unwrap_or(UNKNOWN_COMPANY_NAME),
            );
            customer.ticket_count = group.len() as u32;
            customer.open_tickets = open_count;
            customer.health_score = info.and_then(|c| c.health_score);
            customer.account_tier = info.and_then(|c| c.account_tier.clone());
            customer.renewal_date = info.and_then(|c| c.renewal_date.clone());
            customer.open_ticket_priorities = Some(priorities);
            customer.tickets = detail;
            customer
        })
        .collect()
}

#[async_trait]
impl SupportSource for FreshdeskSource {
    fn provider(&self) -> SupportProvider {
        SupportProvider::Freshdesk
    }

    async fn fetch_customers(
        &self,
        http: &ProviderClient,
        ctx: &FetchContext,
        metadata: &Value,
    ) -> Result<Vec<SupportCustomer>, AdapterError> {
        let provider = self.provider().as_str();
        let creds: FreshdeskCredentials = connection_credentials(provider, metadata)?;
        let base = creds.base_url();
        let token = freshdesk_token(http, ctx, &creds, &base).await?;

        let tickets: Vec<FreshdeskTicket> = http
            .execute_json(
                ctx.run_id,
                provider,
                &ApiRequest::get(format!("{base}/api/v2/tickets")).bearer(token.as_str()),
            )
            .await
            .map_err(|err| api_error(provider, err))?;
        let companies: Vec<FreshdeskCompany> = http
            .execute_json(
                ctx.run_id,
                provider,
                &ApiRequest::get(format!("{base}/api/v2/companies")).bearer(token.as_str()),
            )
            .await
            .map_err(|err| api_error(provider, err))?;

        Ok(keep_valid_customers(
            provider,
            parse_freshdesk_customers(&tickets, &companies, ctx),
        ))
    }
}
