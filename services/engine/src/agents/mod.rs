//! Agent modules for the least-privilege engine
//!
//! - `least_privilege`: evidence-driven role synthesis and provisioning

pub mod least_privilege;

pub use least_privilege::RemediationOrchestrator;
