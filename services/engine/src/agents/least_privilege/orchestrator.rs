//! Remediation Orchestrator
//!
//! Sequences one invocation: broker credentials, collect evidence,
//! synthesize and provision roles for active principals, optionally retire
//! inactive ones, then submit and confirm a policy activation.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::broker::CredentialBroker;
use super::collector::{CollectionOutcome, CollectionRequest, EvidenceCollector};
use super::config::RemediationConfig;
use super::error::{RemediationError, Result};
use super::poller::JobPoller;
use super::progress::ProgressSink;
use super::providers::{ActivationApi, ActivityApi, CredentialProvider, DirectoryApi};
use super::provisioner::ResourceProvisioner;
use super::synthesizer::PermissionSynthesizer;
use super::types::{
    AccountContext, ActivationReport, ActivationStatus, EvidenceRecord, EvidenceWindow,
    IdentityUser, JobOutcome, JobReport, JobStatus, Principal, PrincipalOutcome, PrincipalReport,
    RemediationReport,
};

const WEEKDAYS: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

/// Identity granted access by an activation policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationIdentity {
    pub entity_name: String,
    pub entity_source_id: String,
    #[serde(default = "default_entity_class")]
    pub entity_class: String,
}

fn default_entity_class() -> String {
    "user".to_string()
}

/// Policy activation to run after provisioning
#[derive(Debug, Clone, Default)]
pub struct ActivationRequest {
    pub policy_name: String,
    pub identities: Vec<ActivationIdentity>,
    /// Directory users to create first; each joins the policy's identities
    pub new_users: Vec<IdentityUser>,
    /// Rescan the cloud account first so new roles are visible
    pub rescan_first: bool,
}

/// One remediation invocation
#[derive(Debug, Clone, Default)]
pub struct RemediationRequest {
    pub account_id: String,
    pub role_name: String,
    pub external_id: Option<String>,
    /// Restrict the run to these principals instead of enumerating
    pub principals: Option<Vec<String>>,
    /// Collect and synthesize only
    pub dry_run: bool,
    /// Delete principals found inactive in the window
    pub retire_inactive: bool,
    pub activation: Option<ActivationRequest>,
}

pub struct RemediationOrchestrator {
    config: RemediationConfig,
    broker: CredentialBroker,
    collector: EvidenceCollector,
    synthesizer: PermissionSynthesizer,
    provisioner: ResourceProvisioner,
    activation: Option<Arc<dyn ActivationApi>>,
    progress: Arc<dyn ProgressSink>,
}

impl RemediationOrchestrator {
    pub fn new(
        config: RemediationConfig,
        credentials: Arc<dyn CredentialProvider>,
        directory: Arc<dyn DirectoryApi>,
        activity: Arc<dyn ActivityApi>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            broker: CredentialBroker::new(credentials),
            collector: EvidenceCollector::new(directory.clone(), activity, progress.clone()),
            synthesizer: PermissionSynthesizer::new(&config),
            provisioner: ResourceProvisioner::new(directory, config.protected_principals.clone()),
            activation: None,
            progress,
            config,
        }
    }

    pub fn with_activation(mut self, activation: Arc<dyn ActivationApi>) -> Self {
        self.activation = Some(activation);
        self
    }

    /// Run the pipeline end to end.
    ///
    /// Only fatal errors (credential brokering, principal enumeration) are
    /// returned as `Err`. Everything else lands in the report.
    pub async fn run(&self, request: RemediationRequest) -> Result<RemediationReport> {
        self.config
            .validate()
            .map_err(|e| RemediationError::Validation(e.to_string()))?;

        let invocation_id = Uuid::new_v4();
        let started_at = Utc::now();
        let deadline = self.config.invocation_deadline().map(|d| Instant::now() + d);

        info!(
            invocation_id = %invocation_id,
            account_id = %request.account_id,
            dry_run = request.dry_run,
            "Starting least-privilege remediation"
        );

        self.progress.loading("assume_role", "Assuming cross-account role");
        let ctx = match self
            .broker
            .assume(
                &request.account_id,
                &request.role_name,
                request.external_id.as_deref(),
            )
            .await
        {
            Ok(ctx) => Arc::new(ctx),
            Err(e) => {
                self.progress.failed("assume_role", &e.to_string());
                return Err(e);
            }
        };
        self.progress.completed("assume_role", "Scoped credentials obtained");

        let window = EvidenceWindow::lookback_hours(self.config.lookback_hours);
        let collection = self
            .collector
            .collect(
                ctx.clone(),
                CollectionRequest {
                    principals: request
                        .principals
                        .as_ref()
                        .map(|names| names.iter().map(Principal::named).collect()),
                    window,
                    per_principal_cap: self.config.max_events_per_principal,
                    concurrency_limit: self.config.concurrency_limit,
                    protected: self.config.protected_principals.clone(),
                    deadline,
                },
            )
            .await?;

        let principals = self
            .remediate_principals(&ctx, &collection, request.dry_run, deadline)
            .await;

        let mut report = RemediationReport {
            invocation_id,
            account_id: ctx.account_id.clone(),
            assumed_role_arn: ctx.role_arn.clone(),
            window,
            principals_processed: collection.records.len() + collection.skipped_protected.len(),
            events_found: collection.events_found(),
            principals,
            collection_errors: collection.errors.iter().map(ToString::to_string).collect(),
            activation: None,
            retirements: Vec::new(),
            started_at,
            finished_at: started_at,
        };

        if request.retire_inactive && !request.dry_run {
            let inactive: Vec<String> = report
                .principals
                .iter()
                .filter(|p| p.outcome == PrincipalOutcome::SkippedInactive)
                .map(|p| p.principal.clone())
                .collect();
            if !inactive.is_empty() {
                self.progress.loading("retire", "Retiring inactive principals");
                report.retirements = self.provisioner.retire_principals(&ctx, &inactive).await;
                self.progress.completed("retire", "Retirement finished");
            }
        }

        if let (Some(activation), false) = (&request.activation, request.dry_run) {
            report.activation = Some(
                self.activate(&ctx, activation, report.role_arns(), deadline)
                    .await,
            );
        }

        report.finished_at = Utc::now();
        info!(
            invocation_id = %invocation_id,
            created = report.count(PrincipalOutcome::Created),
            existing = report.count(PrincipalOutcome::AlreadyExists),
            skipped_protected = report.count(PrincipalOutcome::SkippedProtected),
            skipped_inactive = report.count(PrincipalOutcome::SkippedInactive),
            failures = report.has_failures(),
            "Remediation finished"
        );

        Ok(report)
    }

    async fn remediate_principals(
        &self,
        ctx: &AccountContext,
        collection: &CollectionOutcome,
        dry_run: bool,
        deadline: Option<Instant>,
    ) -> Vec<PrincipalReport> {
        let mut reports: Vec<PrincipalReport> = collection
            .skipped_protected
            .iter()
            .map(|p| PrincipalReport::skipped(&p.name, PrincipalOutcome::SkippedProtected))
            .collect();

        let mut records: Vec<&EvidenceRecord> = collection.records.values().collect();
        records.sort_by(|a, b| a.principal.cmp(&b.principal));

        self.progress.loading("provision", "Creating least-privilege roles");
        for record in records {
            reports.push(self.remediate_one(ctx, record, dry_run, deadline).await);
        }
        self.progress.completed(
            "provision",
            &format!(
                "{} roles created",
                reports
                    .iter()
                    .filter(|r| r.outcome == PrincipalOutcome::Created)
                    .count()
            ),
        );

        reports
    }

    async fn remediate_one(
        &self,
        ctx: &AccountContext,
        record: &EvidenceRecord,
        dry_run: bool,
        deadline: Option<Instant>,
    ) -> PrincipalReport {
        if let Some(cause) = &record.error {
            let mut report = PrincipalReport::skipped(&record.principal, PrincipalOutcome::CollectionFailed);
            report.errors.push(cause.clone());
            return report;
        }
        if !record.eligible {
            info!(principal = %record.principal, "No activity in window, skipping role creation");
            return PrincipalReport::skipped(&record.principal, PrincipalOutcome::SkippedInactive);
        }

        let mut report = PrincipalReport::skipped(&record.principal, PrincipalOutcome::Failed);
        report.events = record.events.len();

        let spec = match self.synthesizer.synthesize(record) {
            Ok(spec) => spec,
            Err(e) => {
                report.errors.push(e.to_string());
                return report;
            }
        };

        report.role_name = Some(spec.name.clone());
        report.wildcard_resources = spec.wildcard_resources;
        report.fallback_action = spec.fallback_action;
        for statement in &spec.statements {
            report.actions.extend(statement.actions.iter().cloned());
            report.resources.extend(statement.resources.iter().cloned());
        }

        if dry_run {
            report.outcome = PrincipalOutcome::Synthesized;
            return report;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            report
                .errors
                .push(RemediationError::Cancelled("provisioning".to_string()).to_string());
            return report;
        }

        match self.provisioner.provision(&spec, ctx).await {
            Ok(result) => {
                report.outcome = result.status.into();
                report.role_arn = result.role_arn;
                report.attached_policies = result.attached;
                report
                    .errors
                    .extend(result.errors.iter().map(ToString::to_string));
            }
            Err(e) => {
                error!(principal = %record.principal, error = %e, "Provisioning rejected");
                report.errors.push(e.to_string());
            }
        }
        report
    }

    /// Rescan (optionally), submit the access policy and wait on both jobs
    async fn activate(
        &self,
        ctx: &AccountContext,
        request: &ActivationRequest,
        role_arns: Vec<String>,
        deadline: Option<Instant>,
    ) -> ActivationReport {
        let mut report = ActivationReport {
            status: ActivationStatus::Skipped,
            policy_name: request.policy_name.clone(),
            roles: role_arns,
            identities_created: Vec::new(),
            jobs: Vec::new(),
            error: None,
        };

        let Some(api) = self.activation.as_deref() else {
            warn!("Activation requested but no activation service is configured");
            report.error = Some("activation service not configured".to_string());
            return report;
        };
        if report.roles.is_empty() {
            info!("No roles to activate");
            return report;
        }

        let poller = JobPoller::new(self.config.job_max_wait(), self.config.job_poll_interval())
            .with_deadline(deadline);
        self.progress.loading("activate", "Activating access policy");

        let mut identities = request.identities.clone();
        for user in &request.new_users {
            match api.create_identity_user(user).await {
                Ok(user_id) => {
                    info!(user = %user.name, user_id = %user_id, "Created identity user");
                    report.identities_created.push(user.name.clone());
                    identities.push(ActivationIdentity {
                        entity_name: user.name.clone(),
                        entity_source_id: user_id,
                        entity_class: default_entity_class(),
                    });
                }
                Err(e) => {
                    let e = RemediationError::remote("create identity user", &e);
                    error!(user = %user.name, error = %e, "Failed to create identity user");
                    report.status = ActivationStatus::Failed;
                    report.error = Some(e.to_string());
                    self.progress.failed("activate", &e.to_string());
                    return report;
                }
            }
        }

        if request.rescan_first {
            let outcome = match api.rescan().await {
                Ok(job_id) => poller.wait_for_completion(api, &job_id).await,
                Err(e) => Err(RemediationError::remote("rescan", &e)),
            };
            if !self.record_job(&mut report, "rescan", outcome) {
                return report;
            }
        }

        let payload = activation_payload(
            &request.policy_name,
            &ctx.account_id,
            &report.roles,
            &identities,
            &self.config.activation_time_zone,
        );
        let outcome = match api.create_policy(&payload).await {
            Ok(job_id) => poller.wait_for_completion(api, &job_id).await,
            Err(e) => Err(RemediationError::remote("create policy", &e)),
        };
        if self.record_job(&mut report, "create_policy", outcome) {
            report.status = ActivationStatus::Confirmed;
            self.progress.completed("activate", "Access policy active");
        }
        report
    }

    /// Fold one job result into the report; `true` when it was confirmed
    fn record_job(
        &self,
        report: &mut ActivationReport,
        kind: &str,
        outcome: Result<JobOutcome>,
    ) -> bool {
        match outcome {
            Ok(outcome) => {
                let confirmed = outcome.is_confirmed();
                report.jobs.push(JobReport {
                    kind: kind.to_string(),
                    job_id: outcome.job.job_id,
                    status: outcome.job.status,
                    attempts: outcome.job.attempts,
                    detail: outcome.last_observed.map(|r| r.detail),
                });
                if !confirmed {
                    report.status = ActivationStatus::Unconfirmed;
                    self.progress
                        .failed("activate", &format!("{} timed out, outcome unconfirmed", kind));
                }
                confirmed
            }
            Err(e) => {
                if let RemediationError::JobFailure { job_id, status } = &e {
                    report.jobs.push(JobReport {
                        kind: kind.to_string(),
                        job_id: job_id.clone(),
                        status: JobStatus::Failure,
                        attempts: 0,
                        detail: Some(status.clone()),
                    });
                }
                error!(kind, error = %e, "Activation job failed");
                report.status = ActivationStatus::Failed;
                report.error = Some(e.to_string());
                self.progress.failed("activate", &e.to_string());
                false
            }
        }
    }
}

/// Access policy granting `identities` the given roles on every weekday
pub fn activation_payload(
    policy_name: &str,
    account_id: &str,
    role_arns: &[String],
    identities: &[ActivationIdentity],
    time_zone: &str,
) -> serde_json::Value {
    let roles: Vec<serde_json::Value> = role_arns
        .iter()
        .map(|arn| {
            serde_json::json!({
                "entityId": arn,
                "workspaceType": "account",
                "entitySourceId": account_id,
                "organizationId": account_id,
            })
        })
        .collect();

    serde_json::json!({
        "csp": "AWS",
        "name": policy_name,
        "description": "Least-privilege access policy",
        "startDate": null,
        "endDate": null,
        "policyType": "pre_defined",
        "roles": roles,
        "identities": identities,
        "accessRules": {
            "days": WEEKDAYS,
            "fromTime": null,
            "toTime": null,
            "maxSessionDuration": 1,
            "timeZone": time_zone,
        }
    })
}
