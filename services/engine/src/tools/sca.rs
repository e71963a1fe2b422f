//! Policy Activation Service Tool
//!
//! Client for the external access-policy service that makes newly created
//! roles usable by identities. Every operation starts an asynchronous job;
//! the pipeline drives the job with the poller.
//!
//! ## Security Model
//!
//! - Client credentials come from the environment, never from code
//! - A fresh bearer token is requested per call and never logged
//! - Identity users are created with a separate service account scoped to
//!   the identity tenant (`scope=api`)

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::env;
use std::time::Duration;
use tracing::info;

use crate::agents::least_privilege::providers::{ActivationApi, JobApi};
use crate::agents::least_privilege::{IdentityUser, JobStatusReport};

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct CreateUserResponse {
    #[serde(default)]
    success: bool,
    #[serde(rename = "Result")]
    result: Option<serde_json::Value>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

/// Identity tenant and the service account allowed to create users there
struct IdentityService {
    tenant_url: String,
    service_user: String,
    service_password: String,
}

pub struct ScaTool {
    http_client: Client,
    auth_url: String,
    /// Base API URL, ends with `/`
    policy_url: String,
    username: String,
    password: String,
    identity: Option<IdentityService>,
}

impl std::fmt::Debug for ScaTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScaTool")
            .field("auth_url", &self.auth_url)
            .field("policy_url", &self.policy_url)
            .field("username", &self.username)
            .field("identity_tenant", &self.identity.as_ref().map(|i| &i.tenant_url))
            .finish_non_exhaustive()
    }
}

impl ScaTool {
    pub fn new(
        auth_url: impl Into<String>,
        policy_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let mut policy_url = policy_url.into();
        if !policy_url.ends_with('/') {
            policy_url.push('/');
        }

        Ok(Self {
            http_client,
            auth_url: auth_url.into(),
            policy_url,
            username: username.into(),
            password: password.into(),
            identity: None,
        })
    }

    /// Enable identity-user creation on `tenant_url`
    pub fn with_identity_service(
        mut self,
        tenant_url: impl Into<String>,
        service_user: impl Into<String>,
        service_password: impl Into<String>,
    ) -> Self {
        self.identity = Some(IdentityService {
            tenant_url: tenant_url.into().trim_end_matches('/').to_string(),
            service_user: service_user.into(),
            service_password: service_password.into(),
        });
        self
    }

    /// Reads `SCA_AUTH_URL`, `SCA_POLICY_URL`, `SCA_USERNAME`, `SCA_PASSWORD`.
    ///
    /// Identity-user creation is enabled when `SCA_IDENTITY_URL`,
    /// `SCA_SERVICE_USER` and `SCA_SERVICE_PASSWORD` are all set.
    pub fn from_env() -> Result<Self> {
        let mut tool = Self::new(
            env::var("SCA_AUTH_URL").context("SCA_AUTH_URL must be set")?,
            env::var("SCA_POLICY_URL").context("SCA_POLICY_URL must be set")?,
            env::var("SCA_USERNAME").context("SCA_USERNAME must be set")?,
            env::var("SCA_PASSWORD").context("SCA_PASSWORD must be set")?,
        )?;

        if let (Ok(tenant), Ok(user), Ok(password)) = (
            env::var("SCA_IDENTITY_URL"),
            env::var("SCA_SERVICE_USER"),
            env::var("SCA_SERVICE_PASSWORD"),
        ) {
            tool = tool.with_identity_service(tenant, user, password);
        }

        info!(
            policy_url = %tool.policy_url,
            identity_enabled = tool.identity.is_some(),
            "Activation service tool initialized"
        );
        Ok(tool)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.policy_url, path)
    }

    /// Client-credentials token for the policy API
    async fn access_token(&self) -> Result<String> {
        let response = self
            .http_client
            .post(&self.auth_url)
            .basic_auth(&self.username, Some(&self.password))
            .form(&[("grant_type", "client_credentials"), ("scope", "full")])
            .send()
            .await
            .context("Failed to request activation service token")?;

        if !response.status().is_success() {
            anyhow::bail!("Token request failed with {}", response.status());
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;
        Ok(token.access_token)
    }

    /// Platform token for the identity tenant's service account
    async fn identity_token(&self, identity: &IdentityService) -> Result<String> {
        let response = self
            .http_client
            .post(format!("{}/oauth2/platformtoken", identity.tenant_url))
            .basic_auth(&identity.service_user, Some(&identity.service_password))
            .form(&[("grant_type", "client_credentials"), ("scope", "api")])
            .send()
            .await
            .context("Failed to request identity platform token")?;

        if !response.status().is_success() {
            anyhow::bail!("Identity token request failed with {}", response.status());
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse identity token response")?;
        Ok(token.access_token)
    }

    async fn post_for_job(
        &self,
        path: &str,
        payload: &serde_json::Value,
        api_version: Option<&str>,
        job_field: &str,
    ) -> Result<String> {
        let token = self.access_token().await?;
        let mut request = self
            .http_client
            .post(self.endpoint(path))
            .bearer_auth(&token)
            .json(payload);
        if let Some(version) = api_version {
            request = request.header("X-API-Version", version);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to call {}", path))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} failed with {}: {}", path, status, body);
        }

        let body: serde_json::Value = response.json().await?;
        extract_job_id(&body, job_field)
            .with_context(|| format!("No {} in {} response: {}", job_field, path, body))
    }
}

fn extract_job_id(body: &serde_json::Value, field: &str) -> Option<String> {
    match &body[field] {
        serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Directory id of the created user, or the service's rejection message
fn created_user_id(body: serde_json::Value) -> Result<String> {
    let response: CreateUserResponse =
        serde_json::from_value(body).context("Failed to parse CreateUser response")?;
    if !response.success {
        anyhow::bail!(
            "CreateUser rejected: {}",
            response.message.as_deref().unwrap_or("no message")
        );
    }
    match response.result {
        Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id),
        other => anyhow::bail!("CreateUser returned no user id: {:?}", other),
    }
}

fn rescan_payload() -> serde_json::Value {
    serde_json::json!({
        "cloudProvider": 0,
        "accountType": "All",
    })
}

#[async_trait]
impl JobApi for ScaTool {
    async fn job_status(&self, job_id: &str) -> Result<JobStatusReport> {
        let token = self.access_token().await?;
        let response = self
            .http_client
            .get(self.endpoint("integrations/status"))
            .bearer_auth(&token)
            .query(&[("jobId", job_id), ("debug", "true")])
            .send()
            .await
            .context("Failed to fetch job status")?;

        if !response.status().is_success() {
            anyhow::bail!("Job status for {} failed with {}", job_id, response.status());
        }

        let payload: serde_json::Value = response.json().await?;
        Ok(JobStatusReport::from_payload(payload))
    }
}

#[async_trait]
impl ActivationApi for ScaTool {
    async fn rescan(&self) -> Result<String> {
        let job_id = self
            .post_for_job("cloud/rescan", &rescan_payload(), None, "jobId")
            .await?;
        info!(job_id = %job_id, "Rescan started");
        Ok(job_id)
    }

    async fn create_policy(&self, payload: &serde_json::Value) -> Result<String> {
        let job_id = self
            .post_for_job("policies/create-policy", payload, Some("2.0"), "job_id")
            .await?;
        info!(job_id = %job_id, policy = %payload["name"], "Policy creation started");
        Ok(job_id)
    }

    async fn create_identity_user(&self, user: &IdentityUser) -> Result<String> {
        let identity = self
            .identity
            .as_ref()
            .context("Identity service is not configured")?;
        let token = self.identity_token(identity).await?;

        let response = self
            .http_client
            .post(format!("{}/CDirectoryService/CreateUser", identity.tenant_url))
            .bearer_auth(&token)
            .header("X-IDAP-NATIVE-CLIENT", "Web")
            .json(user)
            .send()
            .await
            .context("Failed to call CreateUser")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("CreateUser failed with {}: {}", status, body);
        }

        let user_id = created_user_id(response.json().await?)?;
        info!(user = %user.name, user_id = %user_id, "Identity user created");
        Ok(user_id)
    }
}
