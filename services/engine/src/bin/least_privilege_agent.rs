//! Least-Privilege Agent - Standalone Binary
//!
//! Runs one remediation pass against a managed account and prints the
//! report as JSON. Suited to CronJob mode: exits non-zero when a fatal
//! error occurs or a requested activation fails.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use least_privilege_engine::least_privilege::{
    ActivationIdentity, ActivationRequest, ActivationStatus, IdentityUser, ProtectedPrincipals,
    RemediationConfig, RemediationOrchestrator, RemediationRequest, TracingProgress,
};
use least_privilege_engine::tools::{
    AwsCredentials, AwsHttp, CloudTrailClient, IamClient, ScaTool, StsClient,
};

/// Least-Privilege Agent - replaces broad principals with evidence-derived roles
#[derive(Parser, Debug)]
#[command(name = "least-privilege-agent", version, about)]
struct Args {
    /// Target account ID
    #[arg(long, env = "TARGET_ACCOUNT_ID")]
    account_id: String,

    /// Cross-account role to assume in the target account
    #[arg(long, env = "CROSS_ACCOUNT_ROLE_NAME")]
    role_name: String,

    /// External ID required by the role's trust policy
    #[arg(long, env = "CROSS_ACCOUNT_EXTERNAL_ID")]
    external_id: Option<String>,

    /// Analyze a single principal instead of enumerating the account
    #[arg(long)]
    principal: Option<String>,

    /// Additional protected principal (repeatable)
    #[arg(long = "protected")]
    protected: Vec<String>,

    /// Evidence window in hours
    #[arg(long, default_value = "12", env = "LOOKBACK_HOURS")]
    lookback_hours: u32,

    /// Maximum events kept per principal
    #[arg(long, default_value = "50")]
    max_events: usize,

    /// Concurrent activity lookups
    #[arg(long, default_value = "16")]
    concurrency: usize,

    /// Overall invocation deadline in seconds
    #[arg(long, env = "INVOCATION_DEADLINE_SECS")]
    deadline_secs: Option<u64>,

    /// Submit an activation policy with this name after provisioning
    #[arg(long)]
    activate: Option<String>,

    /// Identity granted by the activation policy, as NAME=SOURCE_ID (repeatable)
    #[arg(long = "identity", value_parser = parse_identity)]
    identities: Vec<ActivationIdentity>,

    /// Directory user to create and grant, as NAME=MAIL (repeatable)
    #[arg(long = "new-user", value_parser = parse_new_user, requires = "activate")]
    new_users: Vec<(String, String)>,

    /// Initial password for users created with --new-user
    #[arg(long, env = "NEW_IDENTITY_PASSWORD", hide_env_values = true)]
    new_user_password: Option<String>,

    /// Skip the cloud rescan before submitting the activation policy
    #[arg(long, default_value = "false")]
    skip_rescan: bool,

    /// Collect and synthesize only - don't create anything
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Delete principals with no activity in the window
    #[arg(long, default_value = "false")]
    retire_inactive: bool,
}

fn parse_identity(raw: &str) -> Result<ActivationIdentity, String> {
    let (name, source_id) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=SOURCE_ID, got {:?}", raw))?;
    if name.is_empty() || source_id.is_empty() {
        return Err(format!("expected NAME=SOURCE_ID, got {:?}", raw));
    }
    Ok(ActivationIdentity {
        entity_name: name.to_string(),
        entity_source_id: source_id.to_string(),
        entity_class: "user".to_string(),
    })
}

fn parse_new_user(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, mail)) if !name.is_empty() && mail.contains('@') => {
            Ok((name.to_string(), mail.to_string()))
        }
        _ => Err(format!("expected NAME=MAIL, got {:?}", raw)),
    }
}

impl Args {
    fn new_users(&self) -> Result<Vec<IdentityUser>> {
        if self.new_users.is_empty() {
            return Ok(Vec::new());
        }
        let password = self
            .new_user_password
            .as_deref()
            .context("--new-user requires NEW_IDENTITY_PASSWORD")?;
        Ok(self
            .new_users
            .iter()
            .map(|(name, mail)| IdentityUser::new(name.as_str(), mail.as_str(), password))
            .collect())
    }

    fn config(&self) -> RemediationConfig {
        let defaults = RemediationConfig::default();
        let protected = defaults
            .protected_principals
            .iter()
            .cloned()
            .chain(self.protected.iter().cloned())
            .collect::<Vec<_>>();

        RemediationConfig {
            lookback_hours: self.lookback_hours,
            max_events_per_principal: self.max_events,
            concurrency_limit: self.concurrency,
            protected_principals: ProtectedPrincipals::new(protected),
            invocation_deadline_secs: self.deadline_secs,
            ..defaults
        }
    }

    fn request(&self) -> Result<RemediationRequest> {
        let new_users = self.new_users()?;
        Ok(RemediationRequest {
            account_id: self.account_id.clone(),
            role_name: self.role_name.clone(),
            external_id: self.external_id.clone(),
            principals: self.principal.clone().map(|p| vec![p]),
            dry_run: self.dry_run,
            retire_inactive: self.retire_inactive,
            activation: self.activate.clone().map(|policy_name| ActivationRequest {
                policy_name,
                identities: self.identities.clone(),
                rescan_first: !self.skip_rescan,
                new_users,
            }),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .json()
        .init();

    let args = Args::parse();
    let config = args.config();
    config.validate()?;
    let request = args.request()?;

    info!(
        account_id = %args.account_id,
        role_name = %args.role_name,
        principal = ?args.principal,
        dry_run = args.dry_run,
        "Starting Least-Privilege Agent"
    );

    let http = AwsHttp::from_env()?;
    let invoker = AwsCredentials::from_env()?;

    let mut orchestrator = RemediationOrchestrator::new(
        config,
        Arc::new(StsClient::new(http.clone(), invoker)),
        Arc::new(IamClient::new(&http)),
        Arc::new(CloudTrailClient::new(&http)),
        Arc::new(TracingProgress),
    );

    if args.activate.is_some() && !args.dry_run {
        let sca = ScaTool::from_env().context("Activation requested but service is not configured")?;
        orchestrator = orchestrator.with_activation(Arc::new(sca));
    }

    let report = orchestrator.run(request).await.map_err(|e| {
        error!(error = %e, "Remediation aborted");
        anyhow::Error::new(e)
    })?;

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize report")?
    );

    info!(
        principals = report.principals_processed,
        events = report.events_found,
        failures = report.has_failures(),
        "Remediation pass complete"
    );

    if report
        .activation
        .as_ref()
        .is_some_and(|a| a.status == ActivationStatus::Failed)
    {
        anyhow::bail!("Policy activation failed");
    }

    Ok(())
}
