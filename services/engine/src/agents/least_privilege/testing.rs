//! In-memory platform fakes for pipeline tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use super::providers::{
    ActivationApi, ActivityApi, AssumeRoleRequest, CreateRoleRequest, CredentialProvider,
    DirectoryApi, EventPage, EventQuery, JobApi, Page, RawEvent,
};
use super::types::{
    AccountContext, IdentityUser, JobStatusReport, Principal, ResourceRef, RoleInfo,
    ScopedCredentials,
};

pub fn test_credentials() -> ScopedCredentials {
    ScopedCredentials {
        access_key_id: "ASIATESTKEY".to_string(),
        secret_access_key: "secret".to_string(),
        session_token: "session".to_string(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
    }
}

pub fn test_context() -> AccountContext {
    AccountContext {
        account_id: "123456789012".to_string(),
        role_arn: "arn:aws:iam::123456789012:role/AuditRole".to_string(),
        external_id: None,
        credentials: test_credentials(),
    }
}

/// Raw event with `source` (e.g. `s3.amazonaws.com`) and resource names
pub fn raw_event(source: &str, name: &str, resources: &[&str]) -> RawEvent {
    RawEvent {
        event_id: Some(format!("{}-{}", name, resources.len())),
        event_name: Some(name.to_string()),
        event_time: Some(Utc::now()),
        event_source: Some(source.to_string()),
        username: None,
        read_only: Some(true),
        resources: resources
            .iter()
            .map(|r| ResourceRef {
                resource_type: Some("AWS::S3::Bucket".to_string()),
                resource_name: Some(r.to_string()),
            })
            .collect(),
        detail: None,
    }
}

pub struct FakeCredentials {
    denial: Option<String>,
    expired: bool,
    requests: Mutex<Vec<AssumeRoleRequest>>,
}

impl FakeCredentials {
    pub fn granting() -> Self {
        Self {
            denial: None,
            expired: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn denying(message: &str) -> Self {
        Self {
            denial: Some(message.to_string()),
            ..Self::granting()
        }
    }

    pub fn expired() -> Self {
        Self {
            expired: true,
            ..Self::granting()
        }
    }

    pub fn requests(&self) -> Vec<AssumeRoleRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<ScopedCredentials> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(denial) = &self.denial {
            anyhow::bail!("{}", denial);
        }
        let mut creds = test_credentials();
        if self.expired {
            creds.expires_at = Utc::now() - chrono::Duration::minutes(5);
        }
        Ok(creds)
    }
}

/// A mutating call observed by [`FakeDirectory`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    CreateRole(String),
    PutRolePolicy { role: String, policy: String },
    DeletePrincipal(String),
}

impl Mutation {
    /// Every identifier this call touches
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Mutation::CreateRole(role) => vec![role],
            Mutation::PutRolePolicy { role, policy } => vec![role, policy],
            Mutation::DeletePrincipal(name) => vec![name],
        }
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    principals: Vec<Principal>,
    page_size: usize,
    fail_listing: bool,
    fail_get_role: bool,
    fail_create: bool,
    failing_policies: HashSet<String>,
    failing_deletes: HashSet<String>,
    roles: Mutex<HashMap<String, RoleInfo>>,
    mutations: Mutex<Vec<Mutation>>,
    list_calls: AtomicUsize,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self {
            page_size: 100,
            ..Default::default()
        }
    }

    pub fn with_principals<I: IntoIterator<Item = &'static str>>(mut self, names: I) -> Self {
        self.principals = names.into_iter().map(Principal::named).collect();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_existing_role(self, role_name: &str) -> Self {
        self.roles
            .lock()
            .unwrap()
            .insert(role_name.to_string(), role_info(role_name));
        self
    }

    pub fn failing_listing(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    pub fn failing_get_role(mut self) -> Self {
        self.fail_get_role = true;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn failing_policy(mut self, policy_name: &str) -> Self {
        self.failing_policies.insert(policy_name.to_string());
        self
    }

    pub fn failing_delete(mut self, name: &str) -> Self {
        self.failing_deletes.insert(name.to_string());
        self
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.mutations.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn role(&self, role_name: &str) -> Option<RoleInfo> {
        self.roles.lock().unwrap().get(role_name).cloned()
    }
}

fn role_info(role_name: &str) -> RoleInfo {
    RoleInfo {
        role_name: role_name.to_string(),
        arn: format!("arn:aws:iam::123456789012:role/{}", role_name),
        role_id: Some(format!("AROA{}", role_name.len())),
        path: Some("/".to_string()),
        create_date: None,
        max_session_duration: Some(3600),
    }
}

#[async_trait]
impl DirectoryApi for FakeDirectory {
    async fn list_principals(
        &self,
        _ctx: &AccountContext,
        marker: Option<&str>,
    ) -> Result<Page<Principal>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_listing {
            anyhow::bail!("ListUsers throttled");
        }
        let offset: usize = marker.map(|m| m.parse()).transpose()?.unwrap_or(0);
        let end = (offset + self.page_size).min(self.principals.len());
        Ok(Page {
            items: self.principals[offset..end].to_vec(),
            next_marker: (end < self.principals.len()).then(|| end.to_string()),
        })
    }

    async fn get_role(&self, _ctx: &AccountContext, role_name: &str) -> Result<Option<RoleInfo>> {
        if self.fail_get_role {
            anyhow::bail!("GetRole: service unavailable");
        }
        Ok(self.roles.lock().unwrap().get(role_name).cloned())
    }

    async fn create_role(
        &self,
        _ctx: &AccountContext,
        request: &CreateRoleRequest,
    ) -> Result<RoleInfo> {
        self.mutations
            .lock()
            .unwrap()
            .push(Mutation::CreateRole(request.role_name.clone()));
        if self.fail_create {
            anyhow::bail!("CreateRole: MalformedPolicyDocument");
        }
        let mut info = role_info(&request.role_name);
        info.max_session_duration = Some(request.max_session_duration);
        self.roles
            .lock()
            .unwrap()
            .insert(request.role_name.clone(), info.clone());
        Ok(info)
    }

    async fn put_role_policy(
        &self,
        _ctx: &AccountContext,
        role_name: &str,
        policy_name: &str,
        _document: &serde_json::Value,
    ) -> Result<()> {
        self.mutations.lock().unwrap().push(Mutation::PutRolePolicy {
            role: role_name.to_string(),
            policy: policy_name.to_string(),
        });
        if self.failing_policies.contains(policy_name) {
            anyhow::bail!("PutRolePolicy: LimitExceeded");
        }
        Ok(())
    }

    async fn delete_principal(&self, _ctx: &AccountContext, name: &str) -> Result<()> {
        self.mutations
            .lock()
            .unwrap()
            .push(Mutation::DeletePrincipal(name.to_string()));
        if self.failing_deletes.contains(name) {
            anyhow::bail!("DeleteUser: DeleteConflict");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeActivity {
    events: HashMap<String, Vec<RawEvent>>,
    page_size: usize,
    failures: HashSet<String>,
    delay: Duration,
    active: AtomicUsize,
    high_water: AtomicUsize,
    queries: Mutex<Vec<EventQuery>>,
}

impl FakeActivity {
    pub fn new() -> Self {
        Self {
            page_size: 50,
            ..Default::default()
        }
    }

    pub fn with_events(mut self, principal: &str, events: Vec<RawEvent>) -> Self {
        self.events.insert(principal.to_string(), events);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn failing_for(mut self, principal: &str) -> Self {
        self.failures.insert(principal.to_string());
        self
    }

    /// Every lookup sleeps this long (tokio time)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Highest number of lookups observed in flight at once
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<EventQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActivityApi for FakeActivity {
    async fn lookup_events(&self, _ctx: &AccountContext, query: &EventQuery) -> Result<EventPage> {
        self.queries.lock().unwrap().push(query.clone());

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now_active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failures.contains(&query.principal) {
            anyhow::bail!("LookupEvents throttled for {}", query.principal);
        }

        let all = self.events.get(&query.principal).cloned().unwrap_or_default();
        let offset: usize = query
            .next_token
            .as_deref()
            .map(str::parse)
            .transpose()?
            .unwrap_or(0);
        let end = (offset + self.page_size).min(all.len());

        Ok(EventPage {
            events: all[offset..end].to_vec(),
            next_token: (end < all.len()).then(|| end.to_string()),
        })
    }
}

/// Scripted job service; a script's last entry repeats once exhausted.
/// Entries starting with `!` are returned as transport errors.
pub struct FakeJobs {
    scripts: Mutex<HashMap<String, VecDeque<String>>>,
    default_script: Vec<String>,
    polls: AtomicUsize,
    submitted_policies: Mutex<Vec<serde_json::Value>>,
    submissions: AtomicUsize,
    created_users: Mutex<Vec<String>>,
    failing_identities: HashSet<String>,
}

impl FakeJobs {
    pub fn scripted<I: IntoIterator<Item = &'static str>>(statuses: I) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_script: statuses.into_iter().map(str::to_string).collect(),
            polls: AtomicUsize::new(0),
            submitted_policies: Mutex::new(Vec::new()),
            submissions: AtomicUsize::new(0),
            created_users: Mutex::new(Vec::new()),
            failing_identities: HashSet::new(),
        }
    }

    pub fn failing_identity(mut self, name: &str) -> Self {
        self.failing_identities.insert(name.to_string());
        self
    }

    pub fn created_users(&self) -> Vec<String> {
        self.created_users.lock().unwrap().clone()
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn submitted_policies(&self) -> Vec<serde_json::Value> {
        self.submitted_policies.lock().unwrap().clone()
    }

    fn next_job_id(&self, kind: &str) -> String {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst);
        format!("{}-job-{}", kind, n)
    }
}

#[async_trait]
impl JobApi for FakeJobs {
    async fn job_status(&self, job_id: &str) -> Result<JobStatusReport> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts
            .entry(job_id.to_string())
            .or_insert_with(|| self.default_script.iter().cloned().collect());

        let status = if script.len() > 1 {
            script.pop_front().unwrap_or_default()
        } else {
            script.front().cloned().unwrap_or_default()
        };

        if let Some(message) = status.strip_prefix('!') {
            anyhow::bail!("{}", message.to_string());
        }
        Ok(JobStatusReport::from_payload(serde_json::json!({
            "jobId": job_id,
            "status": status,
        })))
    }
}

#[async_trait]
impl ActivationApi for FakeJobs {
    async fn rescan(&self) -> Result<String> {
        Ok(self.next_job_id("rescan"))
    }

    async fn create_policy(&self, payload: &serde_json::Value) -> Result<String> {
        self.submitted_policies.lock().unwrap().push(payload.clone());
        Ok(self.next_job_id("policy"))
    }

    async fn create_identity_user(&self, user: &IdentityUser) -> Result<String> {
        if self.failing_identities.contains(&user.name) {
            anyhow::bail!("CreateUser: user name already in use");
        }
        self.created_users.lock().unwrap().push(user.name.clone());
        Ok(format!("uid-{}", user.name))
    }
}
