//! IAM query API client
//!
//! Users are the principals under analysis; roles are what we create.
//! Every call signs with the scoped credentials of the target account.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{AwsCredentials, AwsHttp, AwsServiceError};
use crate::agents::least_privilege::providers::{CreateRoleRequest, DirectoryApi, Page};
use crate::agents::least_privilege::{AccountContext, Principal, RoleInfo};

const API_VERSION: &str = "2010-05-08";
const HOST: &str = "iam.amazonaws.com";
/// IAM is a global service signed in this region
const SIGNING_REGION: &str = "us-east-1";
const ROLE_PATH: &str = "/";

#[derive(Debug, Deserialize)]
struct ListUsersResponse {
    #[serde(rename = "ListUsersResult")]
    result: ListUsersResult,
}

#[derive(Debug, Deserialize)]
struct ListUsersResult {
    #[serde(rename = "Users", default)]
    users: Members<IamUser>,
    #[serde(rename = "IsTruncated", default)]
    is_truncated: bool,
    #[serde(rename = "Marker")]
    marker: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Members<T> {
    #[serde(rename = "member", default)]
    member: Vec<T>,
}

impl<T> Default for Members<T> {
    fn default() -> Self {
        Self { member: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
struct IamUser {
    #[serde(rename = "UserName")]
    user_name: String,
    #[serde(rename = "Arn")]
    arn: Option<String>,
}

/// Children of `<GetRoleResponse>` or `<CreateRoleResponse>`
#[derive(Debug, Deserialize)]
struct RoleResponse {
    #[serde(rename = "GetRoleResult", alias = "CreateRoleResult")]
    result: RoleResult,
}

#[derive(Debug, Deserialize)]
struct RoleResult {
    #[serde(rename = "Role")]
    role: IamRole,
}

#[derive(Debug, Deserialize)]
struct IamRole {
    #[serde(rename = "RoleName")]
    role_name: String,
    #[serde(rename = "Arn")]
    arn: String,
    #[serde(rename = "RoleId")]
    role_id: Option<String>,
    #[serde(rename = "Path")]
    path: Option<String>,
    #[serde(rename = "CreateDate")]
    create_date: Option<String>,
    #[serde(rename = "MaxSessionDuration")]
    max_session_duration: Option<u32>,
}

impl From<IamRole> for RoleInfo {
    fn from(role: IamRole) -> Self {
        Self {
            role_name: role.role_name,
            arn: role.arn,
            role_id: role.role_id,
            path: role.path,
            create_date: role.create_date,
            max_session_duration: role.max_session_duration,
        }
    }
}

fn parse_role(body: &str) -> Result<RoleInfo> {
    let response: RoleResponse =
        quick_xml::de::from_str(body).context("Failed to parse IAM role response")?;
    Ok(response.result.role.into())
}

fn parse_users(body: &str) -> Result<Page<Principal>> {
    let response: ListUsersResponse =
        quick_xml::de::from_str(body).context("Failed to parse IAM ListUsers response")?;
    let result = response.result;

    Ok(Page {
        items: result
            .users
            .member
            .into_iter()
            .map(|u| Principal {
                name: u.user_name,
                arn: u.arn,
                protected: false,
            })
            .collect(),
        next_marker: if result.is_truncated { result.marker } else { None },
    })
}

pub struct IamClient {
    http: AwsHttp,
}

impl IamClient {
    pub fn new(http: &AwsHttp) -> Self {
        Self {
            http: http.for_region(SIGNING_REGION),
        }
    }

    async fn call(&self, ctx: &AccountContext, params: &[(&str, &str)]) -> Result<String> {
        let credentials = AwsCredentials::from(&ctx.credentials);
        let mut all = vec![("Version", API_VERSION)];
        all.extend_from_slice(params);
        self.http.post_form("iam", HOST, &credentials, &all).await
    }
}

#[async_trait]
impl DirectoryApi for IamClient {
    async fn list_principals(
        &self,
        ctx: &AccountContext,
        marker: Option<&str>,
    ) -> Result<Page<Principal>> {
        let mut params = vec![("Action", "ListUsers")];
        if let Some(marker) = marker {
            params.push(("Marker", marker));
        }
        let body = self.call(ctx, &params).await?;
        let page = parse_users(&body)?;
        debug!(count = page.items.len(), truncated = page.next_marker.is_some(), "Listed IAM users");
        Ok(page)
    }

    async fn get_role(&self, ctx: &AccountContext, role_name: &str) -> Result<Option<RoleInfo>> {
        match self
            .call(ctx, &[("Action", "GetRole"), ("RoleName", role_name)])
            .await
        {
            Ok(body) => parse_role(&body).map(Some),
            Err(e) if AwsServiceError::has_code(&e, "NoSuchEntity") => Ok(None),
            Err(e) => Err(e.context(format!("GetRole {} failed", role_name))),
        }
    }

    async fn create_role(
        &self,
        ctx: &AccountContext,
        request: &CreateRoleRequest,
    ) -> Result<RoleInfo> {
        let trust = serde_json::to_string(&request.trust_policy)?;
        let max_session = request.max_session_duration.to_string();
        let mut params = vec![
            ("Action", "CreateRole"),
            ("RoleName", request.role_name.as_str()),
            ("AssumeRolePolicyDocument", trust.as_str()),
            ("Path", ROLE_PATH),
            ("MaxSessionDuration", max_session.as_str()),
        ];
        if let Some(description) = request.description.as_deref() {
            params.push(("Description", description));
        }

        let body = self
            .call(ctx, &params)
            .await
            .with_context(|| format!("CreateRole {} failed", request.role_name))?;
        parse_role(&body)
    }

    async fn put_role_policy(
        &self,
        ctx: &AccountContext,
        role_name: &str,
        policy_name: &str,
        document: &serde_json::Value,
    ) -> Result<()> {
        let document = serde_json::to_string(document)?;
        self.call(
            ctx,
            &[
                ("Action", "PutRolePolicy"),
                ("RoleName", role_name),
                ("PolicyName", policy_name),
                ("PolicyDocument", document.as_str()),
            ],
        )
        .await
        .with_context(|| format!("PutRolePolicy {} on {} failed", policy_name, role_name))?;
        Ok(())
    }

    async fn delete_principal(&self, ctx: &AccountContext, name: &str) -> Result<()> {
        self.call(ctx, &[("Action", "DeleteUser"), ("UserName", name)])
            .await
            .with_context(|| format!("DeleteUser {} failed", name))?;
        Ok(())
    }
}
