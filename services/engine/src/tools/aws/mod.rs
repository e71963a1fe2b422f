//! AWS Platform Clients
//!
//! Minimal signed-HTTP clients for the three services the remediation
//! pipeline drives: STS (role assumption), IAM (principals and roles) and
//! CloudTrail (activity lookup). Account-scoped calls sign with the
//! brokered [`ScopedCredentials`] passed on each call.

pub mod cloudtrail;
pub mod iam;
pub mod sigv4;
pub mod sts;

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::agents::least_privilege::ScopedCredentials;

pub use cloudtrail::CloudTrailClient;
pub use iam::IamClient;
pub use sts::StsClient;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.1";

/// Signing identity for one request
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Invoker's own identity from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            access_key_id: env::var("AWS_ACCESS_KEY_ID").context("AWS_ACCESS_KEY_ID not set")?,
            secret_access_key: env::var("AWS_SECRET_ACCESS_KEY")
                .context("AWS_SECRET_ACCESS_KEY not set")?,
            session_token: env::var("AWS_SESSION_TOKEN").ok().filter(|t| !t.is_empty()),
        })
    }
}

impl From<&ScopedCredentials> for AwsCredentials {
    fn from(scoped: &ScopedCredentials) -> Self {
        Self {
            access_key_id: scoped.access_key_id.clone(),
            secret_access_key: scoped.secret_access_key.clone(),
            session_token: Some(scoped.session_token.clone()),
        }
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Error reported by an AWS service
#[derive(Debug, Error)]
#[error("{service} returned {status} {code}: {message}")]
pub struct AwsServiceError {
    pub service: &'static str,
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl AwsServiceError {
    /// Whether `err` is a service error carrying `code`
    pub fn has_code(err: &anyhow::Error, code: &str) -> bool {
        err.downcast_ref::<AwsServiceError>()
            .is_some_and(|e| e.code == code)
    }
}

/// `<ErrorResponse><Error><Code>..</Code><Message>..</Message></Error></ErrorResponse>`
#[derive(Debug, Deserialize)]
struct QueryErrorResponse {
    #[serde(rename = "Error")]
    error: QueryError,
}

#[derive(Debug, Deserialize)]
struct QueryError {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

fn query_error(service: &'static str, status: u16, body: &str) -> AwsServiceError {
    match quick_xml::de::from_str::<QueryErrorResponse>(body) {
        Ok(parsed) => AwsServiceError {
            service,
            status,
            code: parsed.error.code,
            message: parsed.error.message,
        },
        Err(_) => AwsServiceError {
            service,
            status,
            code: "Unknown".to_string(),
            message: body.chars().take(512).collect(),
        },
    }
}

fn json_error(service: &'static str, status: u16, body: &str) -> AwsServiceError {
    let parsed: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
    let code = parsed["__type"]
        .as_str()
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    let message = parsed["message"]
        .as_str()
        .or_else(|| parsed["Message"].as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.chars().take(512).collect());
    AwsServiceError {
        service,
        status,
        code,
        message,
    }
}

/// Signed transport shared by the service clients
#[derive(Clone)]
pub struct AwsHttp {
    client: reqwest::Client,
    region: String,
}

impl AwsHttp {
    pub fn new(region: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            region: region.into(),
        })
    }

    /// Region from `AWS_REGION`, defaulting to `us-east-1`
    pub fn from_env() -> Result<Self> {
        Self::new(env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()))
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Same connection pool, signing for another region (IAM is global)
    pub fn for_region(&self, region: impl Into<String>) -> Self {
        Self {
            client: self.client.clone(),
            region: region.into(),
        }
    }

    /// POST a query-protocol action; returns the XML body
    pub async fn post_form(
        &self,
        service: &'static str,
        host: &str,
        credentials: &AwsCredentials,
        params: &[(&str, &str)],
    ) -> Result<String> {
        let body = sigv4::canonical_query(params);
        let signed = sigv4::sign(
            credentials,
            &self.region,
            service,
            Utc::now(),
            &sigv4::SignableRequest {
                method: "POST",
                host,
                path: "/",
                query: "",
                headers: vec![("content-type", FORM_CONTENT_TYPE)],
                payload: body.as_bytes(),
            },
        )?;

        let action = params
            .iter()
            .find(|(k, _)| *k == "Action")
            .map(|(_, v)| *v)
            .unwrap_or("unknown");
        debug!(service, action, "Calling AWS");

        let mut request = self
            .client
            .post(format!("https://{}/", host))
            .header("content-type", FORM_CONTENT_TYPE)
            .header("x-amz-date", &signed.amz_date)
            .header("authorization", &signed.authorization)
            .body(body);
        if let Some(token) = &signed.security_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to call {} {}", service, action))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(query_error(service, status.as_u16(), &text).into());
        }
        Ok(text)
    }

    /// POST a JSON 1.1 protocol operation (`X-Amz-Target`)
    pub async fn post_json(
        &self,
        service: &'static str,
        host: &str,
        credentials: &AwsCredentials,
        target: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let body = serde_json::to_vec(payload).context("Failed to encode request body")?;
        let signed = sigv4::sign(
            credentials,
            &self.region,
            service,
            Utc::now(),
            &sigv4::SignableRequest {
                method: "POST",
                host,
                path: "/",
                query: "",
                headers: vec![("content-type", JSON_CONTENT_TYPE), ("x-amz-target", target)],
                payload: &body,
            },
        )?;

        debug!(service, target, "Calling AWS");

        let mut request = self
            .client
            .post(format!("https://{}/", host))
            .header("content-type", JSON_CONTENT_TYPE)
            .header("x-amz-target", target)
            .header("x-amz-date", &signed.amz_date)
            .header("authorization", &signed.authorization)
            .body(body);
        if let Some(token) = &signed.security_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to call {}", target))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(json_error(service, status.as_u16(), &text).into());
        }
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {} response", target))
    }
}
