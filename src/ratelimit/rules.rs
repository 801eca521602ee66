//! Per-operation rate limit policies.
//!
//! Operations are matched by exact name; anything without an entry falls
//! back to the default policy.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, SlotwardenError};

/// Window, suspension and threshold applied to one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePolicy {
    /// Length of a counting window
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u64,
    /// How long a subject stays suspended after crossing the threshold
    #[serde(default = "default_suspension_minutes")]
    pub suspension_minutes: u64,
    /// Admissions allowed per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            window_minutes: default_window_minutes(),
            suspension_minutes: default_suspension_minutes(),
            max_requests: default_max_requests(),
        }
    }
}

fn default_window_minutes() -> u64 {
    1
}

fn default_suspension_minutes() -> u64 {
    5
}

fn default_max_requests() -> u64 {
    10
}

impl RatePolicy {
    /// Check that the policy can actually be enforced.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.window_minutes == 0 {
            return Err("window_minutes must be at least 1".to_string());
        }
        if self.suspension_minutes == 0 {
            return Err("suspension_minutes must be at least 1".to_string());
        }
        if self.max_requests == 0 {
            return Err("max_requests must be at least 1".to_string());
        }
        Ok(())
    }
}

/// A policy bound to an operation name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPolicy {
    /// The operation this policy applies to
    pub name: String,
    #[serde(flatten)]
    pub policy: RatePolicy,
}

/// The full set of operation policies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRules {
    /// Applied to operations without their own entry
    #[serde(default)]
    pub default: RatePolicy,
    /// Operation-specific overrides
    #[serde(default)]
    pub operations: Vec<OperationPolicy>,
}

impl PolicyRules {
    /// Rules where every operation uses `default`.
    pub fn new(default: RatePolicy) -> Self {
        Self {
            default,
            operations: Vec::new(),
        }
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: PolicyRules = serde_yaml::from_str(yaml).map_err(|e| {
            SlotwardenError::Config(format!("Failed to parse rate limit policies: {}", e))
        })?;
        rules.validate()?;
        Ok(rules)
    }

    /// Reject unenforceable or duplicated policies.
    pub fn validate(&self) -> Result<()> {
        self.default
            .validate()
            .map_err(|e| SlotwardenError::Config(format!("default policy: {}", e)))?;

        for (i, op) in self.operations.iter().enumerate() {
            op.policy
                .validate()
                .map_err(|e| SlotwardenError::Config(format!("operation {}: {}", op.name, e)))?;

            if self.operations[..i].iter().any(|o| o.name == op.name) {
                return Err(SlotwardenError::Config(format!(
                    "operation {} is defined more than once",
                    op.name
                )));
            }
        }
        Ok(())
    }

    /// The policy governing `operation`.
    pub fn policy_for(&self, operation: &str) -> &RatePolicy {
        self.operations
            .iter()
            .find(|op| op.name == operation)
            .map(|op| &op.policy)
            .unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_policies() {
        let yaml = r#"
default:
  window_minutes: 2
  suspension_minutes: 10
  max_requests: 20
operations:
  - name: password_reset
    window_minutes: 10
    suspension_minutes: 60
    max_requests: 3
  - name: publish
    max_requests: 100
"#;
        let rules = PolicyRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.operations.len(), 2);

        let reset = rules.policy_for("password_reset");
        assert_eq!(reset.window_minutes, 10);
        assert_eq!(reset.suspension_minutes, 60);
        assert_eq!(reset.max_requests, 3);

        // Missing fields take the built-in defaults, not the rules' default.
        let publish = rules.policy_for("publish");
        assert_eq!(publish.max_requests, 100);
        assert_eq!(publish.window_minutes, 1);
        assert_eq!(publish.suspension_minutes, 5);
    }

    #[test]
    fn test_unknown_operation_uses_default() {
        let yaml = r#"
default:
  window_minutes: 2
  suspension_minutes: 10
  max_requests: 20
"#;
        let rules = PolicyRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.policy_for("anything").max_requests, 20);
    }

    #[test]
    fn test_empty_document_is_all_defaults() {
        let rules = PolicyRules::from_yaml("{}").unwrap();
        assert_eq!(rules, PolicyRules::default());
        assert_eq!(*rules.policy_for("login"), RatePolicy::default());
    }

    #[test]
    fn test_rejects_zero_limit() {
        let yaml = r#"
operations:
  - name: login
    max_requests: 0
"#;
        let err = PolicyRules::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("max_requests"));
    }

    #[test]
    fn test_rejects_zero_window() {
        let yaml = r#"
default:
  window_minutes: 0
"#;
        assert!(PolicyRules::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_duplicate_operation() {
        let yaml = r#"
operations:
  - name: login
  - name: login
"#;
        let err = PolicyRules::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(PolicyRules::from_yaml("operations: [").is_err());
    }
}
