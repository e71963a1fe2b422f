//! Permission Synthesizer
//!
//! Reduces a principal's observed events into a single-statement role
//! specification: `service:EventName` actions over the resource names the
//! events referenced.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::config::RemediationConfig;
use super::error::{RemediationError, Result};
use super::types::{Event, EvidenceRecord, PermissionStatement, RoleSpec, TrustStatement};

/// Platform limit on role name length
pub const MAX_ROLE_NAME_LEN: usize = 64;

const SERVICE_SUFFIX: &str = ".amazonaws.com";
const WILDCARD: &str = "*";
const ROLE_DESCRIPTION: &str = "Least-privilege role created from CloudTrail analysis";
/// Hex digits of the principal digest appended to truncated names
const NAME_DIGEST_LEN: usize = 8;

pub struct PermissionSynthesizer {
    trust_service_principals: Vec<String>,
    fallback_action: String,
    role_name_prefix: String,
    max_session_duration: u32,
}

impl PermissionSynthesizer {
    pub fn new(config: &RemediationConfig) -> Self {
        Self {
            trust_service_principals: config.trust_service_principals.clone(),
            fallback_action: config.fallback_action.clone(),
            role_name_prefix: config.role_name_prefix.clone(),
            max_session_duration: config.max_session_duration_secs,
        }
    }

    /// Override the services allowed to assume synthesized roles
    pub fn with_trust<I, S>(mut self, service_principals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trust_service_principals = service_principals.into_iter().map(Into::into).collect();
        self
    }

    /// Role name for a principal, within the platform limit.
    ///
    /// Names that would exceed the limit are cut short and end in a digest
    /// of the full principal name, so two long principals sharing a prefix
    /// still map to different roles.
    pub fn role_name_for(&self, principal: &str) -> String {
        let full = format!("{}{}", self.role_name_prefix, principal);
        if full.chars().count() <= MAX_ROLE_NAME_LEN {
            return full;
        }

        let digest = hex::encode(Sha256::digest(principal.as_bytes()));
        let kept: String = full
            .chars()
            .take(MAX_ROLE_NAME_LEN - NAME_DIGEST_LEN - 1)
            .collect();
        format!("{}-{}", kept, &digest[..NAME_DIGEST_LEN])
    }

    /// `iam:GetUser` from source `iam.amazonaws.com` and name `GetUser`
    pub fn action_for(event: &Event) -> Option<String> {
        let name = event.event_name.as_deref().filter(|n| !n.is_empty())?;
        let source = event.event_source.as_deref().filter(|s| !s.is_empty())?;
        let service = source.strip_suffix(SERVICE_SUFFIX).unwrap_or(source);
        Some(format!("{}:{}", service, name))
    }

    /// Build a role spec from a principal's evidence.
    ///
    /// Ineligible records (no events or a collection error) are rejected.
    pub fn synthesize(&self, record: &EvidenceRecord) -> Result<RoleSpec> {
        if !record.eligible {
            return Err(RemediationError::Validation(format!(
                "principal {} has no usable evidence",
                record.principal
            )));
        }

        let actions: BTreeSet<String> = record.events.iter().filter_map(Self::action_for).collect();
        let resources: BTreeSet<String> = record
            .events
            .iter()
            .flat_map(|e| e.resources.iter())
            .filter_map(|r| r.resource_name.clone())
            .filter(|name| !name.is_empty())
            .collect();

        let mut spec = self.synthesize_from_parts(
            self.role_name_for(&record.principal),
            self.trust_service_principals.clone(),
            actions,
            resources,
            None,
        );
        spec.principal = Some(record.principal.clone());

        if spec.wildcard_resources {
            warn!(
                principal = %record.principal,
                role = %spec.name,
                "No resource references in evidence, falling back to wildcard resource"
            );
        }
        if spec.fallback_action {
            warn!(
                principal = %record.principal,
                action = %self.fallback_action,
                "No actions derived from evidence, using fallback action"
            );
        }
        info!(
            principal = %record.principal,
            role = %spec.name,
            actions = spec.action_count(),
            resources = spec.resource_count(),
            "Synthesized role spec"
        );

        Ok(spec)
    }

    /// Build a role spec from caller-supplied parts.
    ///
    /// Empty action and resource sets get the fallback action and the
    /// wildcard resource, each flagged on the spec.
    pub fn synthesize_from_parts(
        &self,
        name: impl Into<String>,
        service_principals: Vec<String>,
        actions: impl IntoIterator<Item = String>,
        resources: impl IntoIterator<Item = String>,
        conditions: Option<serde_json::Value>,
    ) -> RoleSpec {
        let mut actions: BTreeSet<String> = actions.into_iter().collect();
        let mut resources: BTreeSet<String> = resources.into_iter().collect();

        let fallback_action = actions.is_empty();
        if fallback_action {
            actions.insert(self.fallback_action.clone());
        }
        let wildcard_resources = resources.is_empty();
        if wildcard_resources {
            resources.insert(WILDCARD.to_string());
        }

        let service_principals = if service_principals.is_empty() {
            self.trust_service_principals.clone()
        } else {
            service_principals
        };

        RoleSpec {
            name: name.into(),
            description: Some(ROLE_DESCRIPTION.to_string()),
            principal: None,
            trust: TrustStatement { service_principals },
            statements: vec![PermissionStatement {
                actions,
                resources,
                conditions,
            }],
            max_session_duration: self.max_session_duration,
            wildcard_resources,
            fallback_action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::least_privilege::types::ResourceRef;

    fn event(source: &str, name: &str, resource: Option<&str>) -> Event {
        Event {
            event_name: Some(name.to_string()),
            event_source: Some(source.to_string()),
            resources: resource
                .map(|r| {
                    vec![ResourceRef {
                        resource_type: None,
                        resource_name: Some(r.to_string()),
                    }]
                })
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    fn synthesizer() -> PermissionSynthesizer {
        PermissionSynthesizer::new(&RemediationConfig::default())
    }

    #[test]
    fn test_actions_and_resources_deduplicated() {
        let record = EvidenceRecord::collected(
            "alice",
            vec![
                event("s3.amazonaws.com", "GetObject", Some("arn:aws:s3:::reports")),
                event("s3.amazonaws.com", "GetObject", Some("arn:aws:s3:::reports")),
                event("s3.amazonaws.com", "PutObject", None),
                event("s3.amazonaws.com", "GetObject", Some("arn:aws:s3:::reports")),
            ],
        );

        let spec = synthesizer().synthesize(&record).unwrap();

        assert_eq!(spec.name, "LeastPrivilege-alice");
        assert_eq!(spec.principal.as_deref(), Some("alice"));
        assert_eq!(spec.action_count(), 2);
        assert_eq!(spec.resource_count(), 1);
        assert!(spec.statements[0].actions.contains("s3:PutObject"));
        assert!(!spec.wildcard_resources);
        assert!(!spec.fallback_action);
    }

    #[test]
    fn test_wildcard_fallback_is_flagged() {
        let record = EvidenceRecord::collected(
            "bob",
            vec![event("ec2.amazonaws.com", "DescribeInstances", None)],
        );

        let spec = synthesizer().synthesize(&record).unwrap();

        assert!(spec.wildcard_resources);
        assert!(spec.statements[0].resources.contains("*"));
    }

    #[test]
    fn test_fallback_action_when_no_actions() {
        let record = EvidenceRecord::collected("carol", vec![Event::default()]);

        let spec = synthesizer().synthesize(&record).unwrap();

        assert!(spec.fallback_action);
        assert!(spec.statements[0].actions.contains("s3:GetObject"));
    }

    #[test]
    fn test_ineligible_record_rejected() {
        let record = EvidenceRecord::collected("idle", vec![]);
        assert!(matches!(
            synthesizer().synthesize(&record),
            Err(RemediationError::Validation(_))
        ));
    }

    #[test]
    fn test_action_keeps_non_aws_source() {
        let e = event("custom.example.com", "Invoke", None);
        assert_eq!(
            PermissionSynthesizer::action_for(&e).as_deref(),
            Some("custom.example.com:Invoke")
        );
    }

    #[test]
    fn test_role_name_truncated() {
        let long = "x".repeat(80);
        let name = synthesizer().role_name_for(&long);
        assert_eq!(name.len(), MAX_ROLE_NAME_LEN);
        assert!(name.starts_with("LeastPrivilege-"));
        assert_eq!(name, synthesizer().role_name_for(&long));
    }

    #[test]
    fn test_truncated_names_stay_distinct() {
        let shared = "x".repeat(60);
        let first = synthesizer().role_name_for(&format!("{}a", shared));
        let second = synthesizer().role_name_for(&format!("{}b", shared));

        assert_ne!(first, second);
        assert_eq!(first.len(), MAX_ROLE_NAME_LEN);
        assert_eq!(second.len(), MAX_ROLE_NAME_LEN);
    }

    #[test]
    fn test_short_name_kept_whole() {
        assert_eq!(synthesizer().role_name_for("alice"), "LeastPrivilege-alice");
    }

    #[test]
    fn test_trust_override() {
        let spec = synthesizer()
            .with_trust(["ecs-tasks.amazonaws.com"])
            .synthesize_from_parts("TaskRole", vec![], vec!["s3:ListBucket".to_string()], vec![], None);

        assert_eq!(
            spec.trust.service_principals,
            vec!["ecs-tasks.amazonaws.com".to_string()]
        );
        assert!(spec.wildcard_resources);
    }
}
