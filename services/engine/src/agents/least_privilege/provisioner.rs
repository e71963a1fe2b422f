//! Resource Provisioner
//!
//! Create-if-absent for least-privilege roles. An existing role is reported
//! and left untouched; a new role gets each permission statement attached
//! as its own inline policy so one bad statement cannot block the rest.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::error::{RemediationError, Result};
use super::providers::{CreateRoleRequest, DirectoryApi};
use super::types::{
    AccountContext, ProtectedPrincipals, ProvisionResult, ProvisionStatus, RetirementResult,
    RetirementStatus, RoleSpec,
};

/// Platform-accepted bounds for a role's max session duration (seconds)
pub const MIN_SESSION_DURATION: u32 = 3600;
pub const MAX_SESSION_DURATION: u32 = 43200;

pub struct ResourceProvisioner {
    directory: Arc<dyn DirectoryApi>,
    protected: ProtectedPrincipals,
}

impl ResourceProvisioner {
    pub fn new(directory: Arc<dyn DirectoryApi>, protected: ProtectedPrincipals) -> Self {
        Self {
            directory,
            protected,
        }
    }

    /// Reject specs missing a name, a trust statement or a permission statement
    pub fn validate(spec: &RoleSpec) -> Result<()> {
        if spec.name.trim().is_empty() {
            return Err(RemediationError::Validation("role name is empty".to_string()));
        }
        if spec.trust.service_principals.is_empty() {
            return Err(RemediationError::Validation(format!(
                "role {} has no trusted service principals",
                spec.name
            )));
        }
        if spec.statements.is_empty() {
            return Err(RemediationError::Validation(format!(
                "role {} has no permission statements",
                spec.name
            )));
        }
        if let Some(empty) = spec
            .statements
            .iter()
            .position(|s| s.actions.is_empty() || s.resources.is_empty())
        {
            return Err(RemediationError::Validation(format!(
                "statement {} of role {} has no actions or resources",
                empty + 1,
                spec.name
            )));
        }
        Ok(())
    }

    pub fn clamp_session_duration(role_name: &str, requested: u32) -> u32 {
        let clamped = requested.clamp(MIN_SESSION_DURATION, MAX_SESSION_DURATION);
        if clamped != requested {
            warn!(
                role = %role_name,
                requested,
                clamped,
                "Max session duration outside accepted range, clamping"
            );
        }
        clamped
    }

    /// Inline policy name for the statement at `index`
    pub fn policy_name(role_name: &str, index: usize) -> String {
        format!("{}Policy{}", role_name, index + 1)
    }

    fn is_protected(&self, spec: &RoleSpec) -> Option<String> {
        spec.principal
            .iter()
            .chain(std::iter::once(&spec.name))
            .find(|name| self.protected.contains(name))
            .cloned()
    }

    /// Provision one role through the scoped account context.
    ///
    /// Validation and protected-principal violations are returned as `Err`
    /// before any remote call. Remote failures are reported in the result.
    pub async fn provision(&self, spec: &RoleSpec, ctx: &AccountContext) -> Result<ProvisionResult> {
        Self::validate(spec)?;
        if let Some(name) = self.is_protected(spec) {
            warn!(principal = %name, role = %spec.name, "Refusing to provision for protected principal");
            return Err(RemediationError::Protected(name));
        }

        let mut result = ProvisionResult {
            status: ProvisionStatus::Failed,
            role_name: spec.name.clone(),
            role_arn: None,
            existing: None,
            attached: Vec::new(),
            errors: Vec::new(),
        };

        match self.directory.get_role(ctx, &spec.name).await {
            Ok(Some(existing)) => {
                info!(
                    role = %spec.name,
                    arn = %existing.arn,
                    account_id = %ctx.account_id,
                    "Role already exists, leaving it unchanged"
                );
                result.status = ProvisionStatus::AlreadyExists;
                result.role_arn = Some(existing.arn.clone());
                result.existing = Some(existing);
                return Ok(result);
            }
            Ok(None) => {}
            Err(e) => {
                error!(role = %spec.name, error = %e, "Failed to check for existing role");
                result.errors.push(RemediationError::remote("get role", &e));
                return Ok(result);
            }
        }

        let request = CreateRoleRequest {
            role_name: spec.name.clone(),
            trust_policy: spec.trust.to_document(),
            description: spec.description.clone(),
            max_session_duration: Self::clamp_session_duration(&spec.name, spec.max_session_duration),
        };

        let role = match self.directory.create_role(ctx, &request).await {
            Ok(role) => role,
            Err(e) => {
                error!(role = %spec.name, error = %e, "Failed to create role");
                result.errors.push(RemediationError::remote("create role", &e));
                return Ok(result);
            }
        };

        info!(
            role = %spec.name,
            arn = %role.arn,
            account_id = %ctx.account_id,
            "Created role"
        );
        result.role_arn = Some(role.arn);

        for (index, statement) in spec.statements.iter().enumerate() {
            let policy_name = Self::policy_name(&spec.name, index);
            match self
                .directory
                .put_role_policy(ctx, &spec.name, &policy_name, &statement.to_document())
                .await
            {
                Ok(()) => {
                    info!(role = %spec.name, policy = %policy_name, "Attached policy");
                    result.attached.push(policy_name);
                }
                Err(e) => {
                    error!(role = %spec.name, policy = %policy_name, error = %e, "Failed to attach policy");
                    result.errors.push(RemediationError::Attachment {
                        role_name: spec.name.clone(),
                        policy_name,
                        cause: format!("{:#}", e),
                    });
                }
            }
        }

        result.status = if result.errors.is_empty() {
            ProvisionStatus::Created
        } else {
            ProvisionStatus::PartialFailure
        };
        Ok(result)
    }

    /// Delete the named principals, never touching protected ones.
    ///
    /// Every name gets a result; one failure does not stop the others.
    pub async fn retire_principals(
        &self,
        ctx: &AccountContext,
        names: &[String],
    ) -> Vec<RetirementResult> {
        let mut results = Vec::with_capacity(names.len());

        for name in names {
            if name.is_empty() || self.protected.contains(name) {
                info!(principal = %name, "Skipping deletion of protected principal");
                results.push(RetirementResult {
                    principal: name.clone(),
                    status: RetirementStatus::SkippedProtected,
                    error: None,
                });
                continue;
            }

            match self.directory.delete_principal(ctx, name).await {
                Ok(()) => {
                    info!(principal = %name, account_id = %ctx.account_id, "Deleted principal");
                    results.push(RetirementResult {
                        principal: name.clone(),
                        status: RetirementStatus::Deleted,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(principal = %name, error = %e, "Failed to delete principal");
                    results.push(RetirementResult {
                        principal: name.clone(),
                        status: RetirementStatus::Error,
                        error: Some(format!("{:#}", e)),
                    });
                }
            }
        }

        results
    }
}
