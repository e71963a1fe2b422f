//! Remediation error taxonomy

use thiserror::Error;

/// Errors raised or recorded by the remediation pipeline.
///
/// `Authz`, `Validation` and `JobFailure` abort the current operation.
/// `Collection` and `Attachment` are recorded alongside partial results
/// and isolated to one principal or one statement.
#[derive(Debug, Error)]
pub enum RemediationError {
    /// Credential brokering was denied or returned malformed credentials
    #[error("Failed to assume role {role_arn}: {cause}")]
    Authz { role_arn: String, cause: String },

    /// Evidence fetch failed for a single principal
    #[error("Evidence collection failed for {principal}: {cause}")]
    Collection { principal: String, cause: String },

    /// Role spec is incomplete
    #[error("Invalid role spec: {0}")]
    Validation(String),

    /// One permission statement could not be attached
    #[error("Failed to attach {policy_name} to {role_name}: {cause}")]
    Attachment {
        role_name: String,
        policy_name: String,
        cause: String,
    },

    /// Remote job reported failure
    #[error("Job {job_id} failed: {status}")]
    JobFailure {
        job_id: String,
        status: serde_json::Value,
    },

    /// A mutating operation targeted a protected principal
    #[error("Principal {0} is protected")]
    Protected(String),

    /// Invocation deadline reached
    #[error("Invocation deadline exceeded during {0}")]
    Cancelled(String),

    /// A remote call outside the categories above failed
    #[error("{operation} failed: {cause}")]
    Remote { operation: String, cause: String },
}

impl RemediationError {
    /// Wrap an adapter error, keeping its full context chain
    pub fn remote(operation: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::Remote {
            operation: operation.into(),
            cause: format!("{:#}", err),
        }
    }

    /// Whether the pipeline must stop on this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authz { .. } | Self::Validation(_) | Self::JobFailure { .. } | Self::Protected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RemediationError>;
