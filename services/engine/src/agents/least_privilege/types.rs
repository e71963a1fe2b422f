//! Least-Privilege Remediation Types
//!
//! Core types flowing through the pipeline: scoped account context,
//! principals, evidence, role specifications, provisioning results,
//! activation jobs and the final report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// IAM policy language version used for every generated document
pub const POLICY_VERSION: &str = "2012-10-17";

/// Short-lived credentials obtained by role assumption.
///
/// Read-only once brokered; shared by reference across concurrent tasks.
#[derive(Clone, Serialize)]
pub struct ScopedCredentials {
    pub access_key_id: String,
    #[serde(skip_serializing)]
    pub secret_access_key: String,
    #[serde(skip_serializing)]
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

impl ScopedCredentials {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl std::fmt::Debug for ScopedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Per-invocation view of the target account.
///
/// Created once by the credential broker and threaded through every
/// downstream call. Never persisted.
#[derive(Debug, Clone)]
pub struct AccountContext {
    /// Target account identifier
    pub account_id: String,
    /// ARN of the cross-account role that was assumed
    pub role_arn: String,
    /// External id presented on assumption, if any
    pub external_id: Option<String>,
    /// Credentials issued for the assumed role
    pub credentials: ScopedCredentials,
}

/// An identity whose activity is analyzed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
    pub arn: Option<String>,
    /// Excluded from role creation and destructive operations
    #[serde(default)]
    pub protected: bool,
}

impl Principal {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arn: None,
            protected: false,
        }
    }
}

/// Set of principal names that must never be mutated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedPrincipals(BTreeSet<String>);

impl ProtectedPrincipals {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    /// Split principals into (collectable, protected), flagging the protected ones
    pub fn partition(&self, principals: Vec<Principal>) -> (Vec<Principal>, Vec<Principal>) {
        principals
            .into_iter()
            .map(|mut p| {
                p.protected = p.protected || self.contains(&p.name);
                p
            })
            .partition(|p| !p.protected)
    }
}

/// Activity history the lookup API retains (90 days)
pub const MAX_LOOKBACK_HOURS: u32 = 90 * 24;

/// Time range over which activity events are sampled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl EvidenceWindow {
    /// Window ending now and reaching `hours` back, capped at [`MAX_LOOKBACK_HOURS`]
    pub fn lookback_hours(hours: u32) -> Self {
        let end = Utc::now();
        let span = chrono::Duration::hours(i64::from(hours.min(MAX_LOOKBACK_HOURS)));
        Self {
            start: end.checked_sub_signed(span).unwrap_or(end),
            end,
        }
    }
}

/// Resource referenced by an activity event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_type: Option<String>,
    pub resource_name: Option<String>,
}

/// Fields merged from the nested event-detail payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventDetail {
    pub event_version: Option<String>,
    pub user_identity: Option<serde_json::Value>,
    pub request_parameters: Option<serde_json::Value>,
    pub response_elements: Option<serde_json::Value>,
    pub additional_event_data: Option<serde_json::Value>,
    pub request_id: Option<String>,
    pub event_type: Option<String>,
    pub management_event: Option<bool>,
    pub recipient_account_id: Option<String>,
    pub event_category: Option<String>,
    pub tls_details: Option<serde_json::Value>,
    pub source_ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub aws_region: Option<String>,
}

/// A normalized, flat activity event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Option<String>,
    pub event_name: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    pub event_source: Option<String>,
    pub username: Option<String>,
    pub read_only: Option<bool>,
    pub resources: Vec<ResourceRef>,
    #[serde(flatten)]
    pub detail: EventDetail,
}

/// Bounded activity sample for one principal
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceRecord {
    pub principal: String,
    /// Events in the lookup API's native chronological order
    pub events: Vec<Event>,
    /// Collection failure for this principal, if any
    pub error: Option<String>,
    /// Whether a role may be created from this evidence
    pub eligible: bool,
}

impl EvidenceRecord {
    pub fn collected(principal: impl Into<String>, events: Vec<Event>) -> Self {
        let eligible = !events.is_empty();
        Self {
            principal: principal.into(),
            events,
            error: None,
            eligible,
        }
    }

    pub fn failed(principal: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            events: Vec::new(),
            error: Some(error.into()),
            eligible: false,
        }
    }
}

/// Trust statement: which services may assume the role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustStatement {
    pub service_principals: Vec<String>,
}

impl TrustStatement {
    pub fn to_document(&self) -> serde_json::Value {
        serde_json::json!({
            "Version": POLICY_VERSION,
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": self.service_principals },
                "Action": "sts:AssumeRole"
            }]
        })
    }
}

/// One allow statement of a permission policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionStatement {
    pub actions: BTreeSet<String>,
    pub resources: BTreeSet<String>,
    pub conditions: Option<serde_json::Value>,
}

impl PermissionStatement {
    pub fn to_document(&self) -> serde_json::Value {
        let mut statement = serde_json::json!({
            "Effect": "Allow",
            "Action": self.actions,
            "Resource": self.resources,
        });
        if let Some(conditions) = &self.conditions {
            statement["Condition"] = conditions.clone();
        }
        serde_json::json!({
            "Version": POLICY_VERSION,
            "Statement": [statement]
        })
    }
}

/// Specification of a least-privilege role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub name: String,
    pub description: Option<String>,
    /// Principal whose evidence produced this spec
    pub principal: Option<String>,
    pub trust: TrustStatement,
    pub statements: Vec<PermissionStatement>,
    /// Requested max session duration in seconds (clamped on provisioning)
    pub max_session_duration: u32,
    /// No resource references were found and `*` was substituted
    pub wildcard_resources: bool,
    /// No actions were observed and the fallback action was substituted
    pub fallback_action: bool,
}

impl RoleSpec {
    pub fn action_count(&self) -> usize {
        self.statements.iter().map(|s| s.actions.len()).sum()
    }

    pub fn resource_count(&self) -> usize {
        self.statements.iter().map(|s| s.resources.len()).sum()
    }
}

/// Role as reported by the directory API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleInfo {
    pub role_name: String,
    pub arn: String,
    pub role_id: Option<String>,
    pub path: Option<String>,
    pub create_date: Option<String>,
    pub max_session_duration: Option<u32>,
}

/// Outcome of a single provisioning call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStatus {
    Created,
    AlreadyExists,
    PartialFailure,
    Failed,
}

/// Result of provisioning one role
#[derive(Debug)]
pub struct ProvisionResult {
    pub status: ProvisionStatus,
    pub role_name: String,
    pub role_arn: Option<String>,
    /// Existing role attributes when status is `AlreadyExists`
    pub existing: Option<RoleInfo>,
    /// Names of inline policies that attached successfully
    pub attached: Vec<String>,
    /// Attachment (or creation) failures, never dropped
    pub errors: Vec<super::error::RemediationError>,
}

/// Lifecycle state of a remote activation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    InProgress,
    Success,
    Failure,
    TimedOut,
}

impl JobStatus {
    /// Map a remote status string; unrecognized values yield `None`
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "submitted" | "pending" | "queued" => Some(Self::Submitted),
            "inprogress" | "in_progress" | "running" => Some(Self::InProgress),
            "success" | "completed" => Some(Self::Success),
            "failure" | "failed" => Some(Self::Failure),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::TimedOut)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Submitted => write!(f, "submitted"),
            JobStatus::InProgress => write!(f, "in_progress"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failure => write!(f, "failure"),
            JobStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// One observation from the job status API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    /// Status string as returned by the service
    pub raw_status: String,
    /// Diagnostic payload, never interpreted
    pub detail: serde_json::Value,
}

impl JobStatusReport {
    pub fn from_payload(payload: serde_json::Value) -> Self {
        let raw_status = payload["status"].as_str().unwrap_or_default().to_string();
        Self {
            raw_status,
            detail: payload,
        }
    }

    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.raw_status)
    }
}

/// A remote activation job driven by the poller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub attempts: u32,
}

impl Job {
    pub fn submitted(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Submitted,
            attempts: 0,
        }
    }
}

/// Terminal result of waiting on a job that did not fail
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    /// `Success`, or `TimedOut` when the outcome is unconfirmed
    pub job: Job,
    /// Last status observed before returning
    pub last_observed: Option<JobStatusReport>,
}

impl JobOutcome {
    /// Only a confirmed success counts; a timeout is never a success
    pub fn is_confirmed(&self) -> bool {
        self.job.status == JobStatus::Success
    }
}

/// Per-principal result in the final report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalOutcome {
    Created,
    AlreadyExists,
    PartialFailure,
    Failed,
    /// Synthesized but not provisioned (dry run)
    Synthesized,
    SkippedProtected,
    SkippedInactive,
    CollectionFailed,
}

impl From<ProvisionStatus> for PrincipalOutcome {
    fn from(status: ProvisionStatus) -> Self {
        match status {
            ProvisionStatus::Created => PrincipalOutcome::Created,
            ProvisionStatus::AlreadyExists => PrincipalOutcome::AlreadyExists,
            ProvisionStatus::PartialFailure => PrincipalOutcome::PartialFailure,
            ProvisionStatus::Failed => PrincipalOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PrincipalReport {
    pub principal: String,
    pub outcome: PrincipalOutcome,
    pub events: usize,
    pub role_name: Option<String>,
    pub role_arn: Option<String>,
    pub actions: Vec<String>,
    pub resources: Vec<String>,
    /// Least-secure fallback: resource set is `*`
    pub wildcard_resources: bool,
    pub fallback_action: bool,
    pub attached_policies: Vec<String>,
    pub errors: Vec<String>,
}

impl PrincipalReport {
    pub fn skipped(principal: impl Into<String>, outcome: PrincipalOutcome) -> Self {
        Self {
            principal: principal.into(),
            outcome,
            events: 0,
            role_name: None,
            role_arn: None,
            actions: Vec::new(),
            resources: Vec::new(),
            wildcard_resources: false,
            fallback_action: false,
            attached_policies: Vec::new(),
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    /// Every job reported success
    Confirmed,
    /// A job timed out; outcome unknown
    Unconfirmed,
    Failed,
    /// Nothing to activate
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub kind: String,
    pub job_id: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub detail: Option<serde_json::Value>,
}

/// Directory user created so an activation policy can name it
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdentityUser {
    /// Login name, `user@tenant-suffix`
    pub name: String,
    pub mail: String,
    pub password: String,
    #[serde(default)]
    pub in_everybody_role: bool,
    #[serde(default)]
    pub in_sys_admin_role: bool,
}

impl IdentityUser {
    /// Regular member of the everybody role, no admin rights
    pub fn new(name: impl Into<String>, mail: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mail: mail.into(),
            password: password.into(),
            in_everybody_role: true,
            in_sys_admin_role: false,
        }
    }
}

impl std::fmt::Debug for IdentityUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityUser")
            .field("name", &self.name)
            .field("mail", &self.mail)
            .field("password", &"<redacted>")
            .field("in_everybody_role", &self.in_everybody_role)
            .field("in_sys_admin_role", &self.in_sys_admin_role)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivationReport {
    pub status: ActivationStatus,
    pub policy_name: String,
    pub roles: Vec<String>,
    /// Directory users created for this activation
    pub identities_created: Vec<String>,
    pub jobs: Vec<JobReport>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetirementStatus {
    Deleted,
    SkippedProtected,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetirementResult {
    pub principal: String,
    pub status: RetirementStatus,
    pub error: Option<String>,
}

/// Final report of one remediation invocation
#[derive(Debug, Clone, Serialize)]
pub struct RemediationReport {
    pub invocation_id: Uuid,
    pub account_id: String,
    pub assumed_role_arn: String,
    pub window: EvidenceWindow,
    pub principals_processed: usize,
    pub events_found: usize,
    pub principals: Vec<PrincipalReport>,
    pub collection_errors: Vec<String>,
    pub activation: Option<ActivationReport>,
    pub retirements: Vec<RetirementResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RemediationReport {
    pub fn count(&self, outcome: PrincipalOutcome) -> usize {
        self.principals
            .iter()
            .filter(|p| p.outcome == outcome)
            .count()
    }

    pub fn principal(&self, name: &str) -> Option<&PrincipalReport> {
        self.principals.iter().find(|p| p.principal == name)
    }

    /// ARNs of roles that exist after this run (created or pre-existing)
    pub fn role_arns(&self) -> Vec<String> {
        self.principals
            .iter()
            .filter(|p| {
                matches!(
                    p.outcome,
                    PrincipalOutcome::Created
                        | PrincipalOutcome::AlreadyExists
                        | PrincipalOutcome::PartialFailure
                )
            })
            .filter_map(|p| p.role_arn.clone())
            .collect()
    }

    /// Whether any partial failure was recorded anywhere in the run
    pub fn has_failures(&self) -> bool {
        !self.collection_errors.is_empty()
            || self.principals.iter().any(|p| !p.errors.is_empty())
            || self
                .activation
                .as_ref()
                .is_some_and(|a| a.status == ActivationStatus::Failed)
            || self
                .retirements
                .iter()
                .any(|r| r.status == RetirementStatus::Error)
    }
}
