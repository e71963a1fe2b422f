//! Least-Privilege Remediation Agent
//!
//! Replaces over-privileged principals in a managed account with roles
//! derived from what they actually did.
//!
//! ## Pipeline
//!
//! - **Broker**: assume the cross-account audit role, per invocation
//! - **Collector**: sample each principal's recent activity, bounded fan-out
//! - **Synthesizer**: reduce events to `service:Action` over observed resources
//! - **Provisioner**: create-if-absent roles, one inline policy per statement
//! - **Poller**: confirm the external policy activation landed
//!
//! ## Security
//!
//! - Scoped credentials are threaded explicitly through every call, never global
//! - Protected principals are filtered before collection and before any mutation

pub mod broker;
pub mod collector;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod poller;
pub mod progress;
pub mod providers;
pub mod provisioner;
pub mod synthesizer;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use broker::CredentialBroker;
pub use collector::{CollectionOutcome, CollectionRequest, EvidenceCollector};
pub use config::RemediationConfig;
pub use error::RemediationError;
pub use orchestrator::{
    ActivationIdentity, ActivationRequest, RemediationOrchestrator, RemediationRequest,
};
pub use poller::JobPoller;
pub use progress::{ProgressEvent, ProgressSink, ProgressStatus, TracingProgress};
pub use provisioner::ResourceProvisioner;
pub use synthesizer::PermissionSynthesizer;
pub use types::*;
