//! Evidence Collector
//!
//! Fans out one activity lookup task per principal under a fixed worker
//! bound. Each task paginates its principal's events until the cap is hit
//! or the API stops returning a continuation token. Failures stay with the
//! principal that produced them.
//!
//! Results are aggregated by the single loop draining the `JoinSet`, so the
//! record map has exactly one writer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::error::{RemediationError, Result};
use super::progress::ProgressSink;
use super::providers::{ActivityApi, DirectoryApi, EventQuery, RawEvent};
use super::types::{
    AccountContext, Event, EventDetail, EvidenceRecord, EvidenceWindow, Principal,
    ProtectedPrincipals,
};

const STAGE: &str = "collect";

/// Parameters of one collection pass
#[derive(Debug, Clone)]
pub struct CollectionRequest {
    /// Explicit principals; enumerated from the directory when `None`
    pub principals: Option<Vec<Principal>>,
    pub window: EvidenceWindow,
    pub per_principal_cap: usize,
    pub concurrency_limit: usize,
    pub protected: ProtectedPrincipals,
    /// Abandon in-flight tasks once this instant passes
    pub deadline: Option<Instant>,
}

/// Evidence for every collectable principal plus everything that went wrong
#[derive(Debug, Default)]
pub struct CollectionOutcome {
    /// Keyed by principal name; one entry per collectable principal
    pub records: HashMap<String, EvidenceRecord>,
    pub errors: Vec<RemediationError>,
    /// Principals removed by the protected list before fan-out
    pub skipped_protected: Vec<Principal>,
}

impl CollectionOutcome {
    pub fn events_found(&self) -> usize {
        self.records.values().map(|r| r.events.len()).sum()
    }

    pub fn cancelled(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, RemediationError::Cancelled(_)))
    }
}

pub struct EvidenceCollector {
    directory: Arc<dyn DirectoryApi>,
    activity: Arc<dyn ActivityApi>,
    progress: Arc<dyn ProgressSink>,
}

impl EvidenceCollector {
    pub fn new(
        directory: Arc<dyn DirectoryApi>,
        activity: Arc<dyn ActivityApi>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            directory,
            activity,
            progress,
        }
    }

    /// List every principal in the account, following pagination markers
    pub async fn enumerate(&self, ctx: &AccountContext) -> Result<Vec<Principal>> {
        let mut principals = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = self
                .directory
                .list_principals(ctx, marker.as_deref())
                .await
                .map_err(|e| RemediationError::remote("list principals", &e))?;

            principals.extend(page.items);

            match page.next_marker {
                Some(next) if !next.is_empty() => marker = Some(next),
                _ => break,
            }
        }

        debug!(count = principals.len(), "Enumerated principals");
        Ok(principals)
    }

    /// Collect evidence for every non-protected principal.
    ///
    /// Only enumeration failure is returned as `Err`. Per-principal failures
    /// and deadline cancellation are reported in the outcome.
    pub async fn collect(
        &self,
        ctx: Arc<AccountContext>,
        request: CollectionRequest,
    ) -> Result<CollectionOutcome> {
        let principals = match request.principals {
            Some(explicit) => explicit,
            None => self.enumerate(&ctx).await?,
        };

        let mut seen = HashSet::new();
        let principals: Vec<Principal> = principals
            .into_iter()
            .filter(|p| {
                let first = seen.insert(p.name.clone());
                if !first {
                    debug!(principal = %p.name, "Dropping duplicate principal");
                }
                first
            })
            .collect();

        let (open, skipped_protected) = request.protected.partition(principals);
        for p in &skipped_protected {
            info!(principal = %p.name, "Skipping protected principal");
        }

        self.progress.loading(
            STAGE,
            &format!("Collecting activity for {} principals", open.len()),
        );

        let semaphore = Arc::new(Semaphore::new(request.concurrency_limit.max(1)));
        let mut join_set = JoinSet::new();

        for principal in &open {
            let activity = self.activity.clone();
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let name = principal.name.clone();
            let window = request.window;
            let cap = request.per_principal_cap;

            join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => collect_principal(activity.as_ref(), &ctx, &name, window, cap).await,
                    Err(e) => Err(anyhow::anyhow!("worker pool closed: {}", e)),
                };
                (name, result)
            });
        }

        let mut outcome = CollectionOutcome {
            skipped_protected,
            ..Default::default()
        };

        loop {
            let next = match request.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(
                            in_flight = join_set.len(),
                            "Invocation deadline reached, abandoning evidence collection"
                        );
                        join_set.abort_all();
                        outcome
                            .errors
                            .push(RemediationError::Cancelled("evidence collection".to_string()));
                        break;
                    }
                },
                None => join_set.join_next().await,
            };

            let Some(joined) = next else { break };

            match joined {
                Ok((name, Ok(events))) => {
                    if events.is_empty() {
                        debug!(principal = %name, "No activity in window");
                    }
                    outcome
                        .records
                        .insert(name.clone(), EvidenceRecord::collected(name, events));
                }
                Ok((name, Err(e))) => {
                    warn!(principal = %name, error = %e, "Evidence collection failed");
                    let cause = format!("{:#}", e);
                    outcome
                        .records
                        .insert(name.clone(), EvidenceRecord::failed(name.clone(), cause.clone()));
                    outcome.errors.push(RemediationError::Collection {
                        principal: name,
                        cause,
                    });
                }
                Err(e) => {
                    // Panicked task; its principal is filled in below
                    error!(error = %e, "Collection task panicked");
                }
            }
        }

        let cancelled = outcome.cancelled();
        for principal in &open {
            if outcome.records.contains_key(&principal.name) {
                continue;
            }
            let cause = if cancelled {
                "abandoned at invocation deadline"
            } else {
                "collection task did not complete"
            };
            outcome.records.insert(
                principal.name.clone(),
                EvidenceRecord::failed(principal.name.clone(), cause),
            );
            if !cancelled {
                outcome.errors.push(RemediationError::Collection {
                    principal: principal.name.clone(),
                    cause: cause.to_string(),
                });
            }
        }

        let message = format!(
            "Collected {} events across {} principals ({} errors)",
            outcome.events_found(),
            outcome.records.len(),
            outcome.errors.len()
        );
        if cancelled {
            self.progress.failed(STAGE, &message);
        } else {
            self.progress.completed(STAGE, &message);
        }
        info!(
            principals = outcome.records.len(),
            events = outcome.events_found(),
            errors = outcome.errors.len(),
            "Evidence collection finished"
        );

        Ok(outcome)
    }
}

/// Page through one principal's events until `cap` or the last page
async fn collect_principal(
    activity: &dyn ActivityApi,
    ctx: &AccountContext,
    principal: &str,
    window: EvidenceWindow,
    cap: usize,
) -> anyhow::Result<Vec<Event>> {
    let mut events = Vec::new();
    let mut next_token: Option<String> = None;

    loop {
        let query = EventQuery {
            principal: principal.to_string(),
            start: window.start,
            end: window.end,
            next_token: next_token.take(),
        };

        let page = activity
            .lookup_events(ctx, &query)
            .await
            .with_context(|| format!("Failed to look up events for {}", principal))?;

        let room = cap.saturating_sub(events.len());
        events.extend(page.events.into_iter().take(room).map(normalize_event));

        if events.len() >= cap {
            break;
        }
        match page.next_token {
            Some(token) if !token.is_empty() => next_token = Some(token),
            _ => break,
        }
    }

    Ok(events)
}

/// Nested CloudTrail record carried in the event's detail payload
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DetailPayload {
    event_version: Option<String>,
    user_identity: Option<serde_json::Value>,
    request_parameters: Option<serde_json::Value>,
    response_elements: Option<serde_json::Value>,
    additional_event_data: Option<serde_json::Value>,
    #[serde(rename = "requestID")]
    request_id: Option<String>,
    event_type: Option<String>,
    management_event: Option<bool>,
    recipient_account_id: Option<String>,
    event_category: Option<String>,
    tls_details: Option<serde_json::Value>,
    #[serde(rename = "sourceIPAddress")]
    source_ip_address: Option<String>,
    user_agent: Option<String>,
    aws_region: Option<String>,
}

impl From<DetailPayload> for EventDetail {
    fn from(p: DetailPayload) -> Self {
        Self {
            event_version: p.event_version,
            user_identity: p.user_identity,
            request_parameters: p.request_parameters,
            response_elements: p.response_elements,
            additional_event_data: p.additional_event_data,
            request_id: p.request_id,
            event_type: p.event_type,
            management_event: p.management_event,
            recipient_account_id: p.recipient_account_id,
            event_category: p.event_category,
            tls_details: p.tls_details,
            source_ip_address: p.source_ip_address,
            user_agent: p.user_agent,
            aws_region: p.aws_region,
        }
    }
}

/// Flatten a raw event. An unparseable detail payload leaves the detail
/// fields empty.
pub fn normalize_event(raw: RawEvent) -> Event {
    let detail = match raw.detail.as_deref() {
        Some(text) => match serde_json::from_str::<DetailPayload>(text) {
            Ok(payload) => payload.into(),
            Err(e) => {
                debug!(event_id = ?raw.event_id, error = %e, "Unparseable event detail");
                EventDetail::default()
            }
        },
        None => EventDetail::default(),
    };

    Event {
        event_id: raw.event_id,
        event_name: raw.event_name,
        event_time: raw.event_time,
        event_source: raw.event_source,
        username: raw.username,
        read_only: raw.read_only,
        resources: raw.resources,
        detail,
    }
}
