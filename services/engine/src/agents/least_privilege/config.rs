//! Remediation configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::types::{ProtectedPrincipals, MAX_LOOKBACK_HOURS};

/// Tunables for a remediation run.
///
/// Defaults match the platform limits the pipeline was built against:
/// a 12 hour lookback, 50 events per principal and 16 concurrent lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    /// Evidence window, hours back from now
    pub lookback_hours: u32,
    /// Hard cap on events kept per principal
    pub max_events_per_principal: usize,
    /// Worker-pool bound for evidence collection
    pub concurrency_limit: usize,
    /// Principals never selected for role creation or deletion
    pub protected_principals: ProtectedPrincipals,
    /// Services allowed to assume generated roles
    pub trust_service_principals: Vec<String>,
    /// Read-only action used when evidence yields no actions
    pub fallback_action: String,
    /// Prefix for generated role names
    pub role_name_prefix: String,
    /// Requested max session duration for generated roles (seconds)
    pub max_session_duration_secs: u32,
    /// Wait budget for activation jobs (seconds)
    pub job_max_wait_secs: u64,
    /// Interval between job status checks (seconds)
    pub job_poll_interval_secs: u64,
    /// Overall invocation deadline (seconds), unbounded when absent
    pub invocation_deadline_secs: Option<u64>,
    /// Time zone for activation access rules
    pub activation_time_zone: String,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            lookback_hours: 12,
            max_events_per_principal: 50,
            concurrency_limit: 16,
            protected_principals: ProtectedPrincipals::new(["DeploymentUser"]),
            trust_service_principals: vec![
                "ec2.amazonaws.com".to_string(),
                "lambda.amazonaws.com".to_string(),
            ],
            fallback_action: "s3:GetObject".to_string(),
            role_name_prefix: "LeastPrivilege-".to_string(),
            max_session_duration_secs: 3600,
            job_max_wait_secs: 300,
            job_poll_interval_secs: 10,
            invocation_deadline_secs: None,
            activation_time_zone: "UTC".to_string(),
        }
    }
}

impl RemediationConfig {
    pub fn job_max_wait(&self) -> Duration {
        Duration::from_secs(self.job_max_wait_secs)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_secs(self.job_poll_interval_secs)
    }

    pub fn invocation_deadline(&self) -> Option<Duration> {
        self.invocation_deadline_secs.map(Duration::from_secs)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lookback_hours == 0 || self.lookback_hours > MAX_LOOKBACK_HOURS {
            anyhow::bail!(
                "lookback_hours must be between 1 and {}, got {}",
                MAX_LOOKBACK_HOURS,
                self.lookback_hours
            );
        }
        if self.concurrency_limit == 0 {
            anyhow::bail!("concurrency_limit must be at least 1");
        }
        if self.max_events_per_principal == 0 {
            anyhow::bail!("max_events_per_principal must be at least 1");
        }
        if self.job_poll_interval_secs == 0 {
            anyhow::bail!("job_poll_interval_secs must be at least 1");
        }
        if self.trust_service_principals.is_empty() {
            anyhow::bail!("at least one trust service principal is required");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RemediationConfig::default();
        assert_eq!(config.lookback_hours, 12);
        assert_eq!(config.concurrency_limit, 16);
        assert_eq!(config.max_events_per_principal, 50);
        assert!(config.protected_principals.contains("DeploymentUser"));
        assert_eq!(config.job_max_wait(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: RemediationConfig =
            serde_json::from_str(r#"{"concurrency_limit": 4, "fallback_action": "iam:GetUser"}"#)
                .unwrap();

        assert_eq!(config.concurrency_limit, 4);
        assert_eq!(config.fallback_action, "iam:GetUser");
        assert_eq!(config.job_poll_interval_secs, 10);
    }

    #[test]
    fn test_lookback_beyond_retention_rejected() {
        let config = RemediationConfig {
            lookback_hours: u32::MAX,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RemediationConfig {
            lookback_hours: MAX_LOOKBACK_HOURS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = RemediationConfig {
            concurrency_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
