//! Least-Privilege Engine Library
//!
//! Remediation pipeline plus the platform clients it drives.

pub mod agents;
pub mod tools;

pub use agents::least_privilege;
pub use agents::RemediationOrchestrator;
pub use tools::{CloudTrailClient, IamClient, ScaTool, StsClient};
