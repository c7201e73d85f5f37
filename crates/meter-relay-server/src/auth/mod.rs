//! Authentication and authorization modules.

pub mod policy;
pub mod rate_limit;
pub mod upgrade;

pub use policy::{AccessPolicy, Authorizer};
pub use rate_limit::RateLimiter;
pub use upgrade::UpgradeGuard;
