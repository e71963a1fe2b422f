//! Platform Adapters
//!
//! Trait-based seams between the pipeline and the remote APIs it drives.
//! Every account-scoped call takes the [`AccountContext`] explicitly; no
//! adapter holds credentials of the target account on its own.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{
    AccountContext, IdentityUser, JobStatusReport, Principal, ResourceRef, RoleInfo,
    ScopedCredentials,
};

/// Parameters of a role assumption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumeRoleRequest {
    pub role_arn: String,
    pub session_name: String,
    /// Must be forwarded on every assumption when supplied
    pub external_id: Option<String>,
}

/// Issues short-lived credentials for a role
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<ScopedCredentials>;
}

/// One page of a paginated listing
#[derive(Debug, Clone, Default)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_marker: Option<String>,
}

/// Parameters of a role creation
#[derive(Debug, Clone)]
pub struct CreateRoleRequest {
    pub role_name: String,
    pub trust_policy: serde_json::Value,
    pub description: Option<String>,
    pub max_session_duration: u32,
}

/// Identity directory of the target account (principals and roles)
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    async fn list_principals(
        &self,
        ctx: &AccountContext,
        marker: Option<&str>,
    ) -> Result<Page<Principal>>;

    /// `Ok(None)` when the role does not exist
    async fn get_role(&self, ctx: &AccountContext, role_name: &str) -> Result<Option<RoleInfo>>;

    async fn create_role(&self, ctx: &AccountContext, request: &CreateRoleRequest)
        -> Result<RoleInfo>;

    async fn put_role_policy(
        &self,
        ctx: &AccountContext,
        role_name: &str,
        policy_name: &str,
        document: &serde_json::Value,
    ) -> Result<()>;

    async fn delete_principal(&self, ctx: &AccountContext, name: &str) -> Result<()>;
}

/// Activity lookup query for one principal
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub principal: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub next_token: Option<String>,
}

/// Event as returned by the lookup API, before normalization
#[derive(Debug, Clone, Default)]
pub struct RawEvent {
    pub event_id: Option<String>,
    pub event_name: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    pub event_source: Option<String>,
    pub username: Option<String>,
    pub read_only: Option<bool>,
    pub resources: Vec<ResourceRef>,
    /// Nested event-detail payload (JSON text)
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<RawEvent>,
    pub next_token: Option<String>,
}

/// Activity-event lookup for the target account
#[async_trait]
pub trait ActivityApi: Send + Sync {
    async fn lookup_events(&self, ctx: &AccountContext, query: &EventQuery) -> Result<EventPage>;
}

/// Status endpoint of the remote job service
#[async_trait]
pub trait JobApi: Send + Sync {
    async fn job_status(&self, job_id: &str) -> Result<JobStatusReport>;
}

/// External policy-activation service
#[async_trait]
pub trait ActivationApi: JobApi {
    /// Start a cloud rescan so new roles become visible; returns the job id
    async fn rescan(&self) -> Result<String>;

    /// Submit an access policy; returns the job id
    async fn create_policy(&self, payload: &serde_json::Value) -> Result<String>;

    /// Create a directory user; returns its directory id
    async fn create_identity_user(&self, user: &IdentityUser) -> Result<String>;
}
