//! Credential Broker
//!
//! Exchanges a target account + role name for scoped credentials.
//! Nothing is cached: every invocation re-brokers.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use super::error::{RemediationError, Result};
use super::providers::{AssumeRoleRequest, CredentialProvider};
use super::types::AccountContext;

/// Session name prefix presented on every assumption
const SESSION_NAME_PREFIX: &str = "LeastPrivilegeAgent";

pub struct CredentialBroker {
    provider: Arc<dyn CredentialProvider>,
}

impl CredentialBroker {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self { provider }
    }

    /// Canonical role reference for an account + role name
    pub fn role_arn(account_id: &str, role_name: &str) -> String {
        format!("arn:aws:iam::{}:role/{}", account_id, role_name)
    }

    /// Assume the cross-account role.
    ///
    /// Denials and malformed responses surface as `Authz` carrying the
    /// attempted role ARN. No retry is made here.
    pub async fn assume(
        &self,
        account_id: &str,
        role_name: &str,
        external_id: Option<&str>,
    ) -> Result<AccountContext> {
        let role_arn = Self::role_arn(account_id, role_name);

        if account_id.len() != 12 || !account_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(RemediationError::Authz {
                role_arn,
                cause: format!("account id must be 12 digits, got {:?}", account_id),
            });
        }
        if role_name.trim().is_empty() {
            return Err(RemediationError::Authz {
                role_arn,
                cause: "role name is empty".to_string(),
            });
        }

        let request = AssumeRoleRequest {
            role_arn: role_arn.clone(),
            session_name: format!("{}-{}", SESSION_NAME_PREFIX, Utc::now().format("%Y%m%d%H%M%S")),
            external_id: external_id.map(str::to_string),
        };

        let credentials = self.provider.assume_role(&request).await.map_err(|e| {
            warn!(role_arn = %role_arn, error = %e, "Role assumption denied");
            RemediationError::Authz {
                role_arn: role_arn.clone(),
                cause: format!("{:#}", e),
            }
        })?;

        if credentials.access_key_id.is_empty()
            || credentials.secret_access_key.is_empty()
            || credentials.session_token.is_empty()
        {
            return Err(RemediationError::Authz {
                role_arn,
                cause: "credential response is missing fields".to_string(),
            });
        }
        if credentials.is_expired() {
            return Err(RemediationError::Authz {
                role_arn,
                cause: format!("credentials already expired at {}", credentials.expires_at),
            });
        }

        info!(
            role_arn = %role_arn,
            expires_at = %credentials.expires_at,
            "Scoped credentials obtained"
        );

        Ok(AccountContext {
            account_id: account_id.to_string(),
            role_arn,
            external_id: request.external_id,
            credentials,
        })
    }
}
