//! Connect-time authorization of the user named in a `connect` frame.

use std::collections::HashSet;

/// Decides whether a user may open a terminal on a meter.
///
/// The gateway only enforces "must pass"; the policy itself is pluggable.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, user_id: &str, meter_id: &str) -> Result<(), String>;
}

/// User allowlist. An empty list admits any non-empty user id.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    allowed_users: HashSet<String>,
}

impl AccessPolicy {
    pub fn new(allowed_users: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed_users: allowed_users.into_iter().collect(),
        }
    }
}

impl Authorizer for AccessPolicy {
    fn authorize(&self, user_id: &str, _meter_id: &str) -> Result<(), String> {
        if user_id.trim().is_empty() {
            return Err("missing user id".into());
        }
        if !self.allowed_users.is_empty() && !self.allowed_users.contains(user_id) {
            return Err(format!("user {user_id} is not allowed"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_policy_needs_a_user() {
        let policy = AccessPolicy::default();
        assert!(policy.authorize("op-1", "M-001").is_ok());
        assert!(policy.authorize("", "M-001").is_err());
        assert!(policy.authorize("   ", "M-001").is_err());
    }

    #[test]
    fn allowlist() {
        let policy = AccessPolicy::new(["op-1".to_string()]);
        assert!(policy.authorize("op-1", "M-001").is_ok());
        assert!(policy.authorize("op-2", "M-001").is_err());
    }
}
