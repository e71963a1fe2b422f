//! Platform Tools
//!
//! Clients behind the remediation pipeline's provider seams.
//! Invoker credentials come from the environment; account-scoped calls
//! carry the brokered credentials explicitly.

pub mod aws;
pub mod sca;

pub use aws::{AwsCredentials, AwsHttp, CloudTrailClient, IamClient, StsClient};
pub use sca::ScaTool;
