//! Rate limit key generation and handling.

/// Identifies the counter and suspension flag for one subject performing
/// one operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Who is being limited (user id, IP, API key...)
    pub subject_id: String,
    /// What they are doing
    pub operation_name: String,
}

impl RateLimitKey {
    /// Create a new rate limit key.
    pub fn new(subject_id: &str, operation_name: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            operation_name: operation_name.to_string(),
        }
    }

    /// Store key of the count-with-expiry record.
    /// Format: "{subject}:{operation}:count"
    pub fn count_key(&self) -> String {
        format!("{}:{}:count", self.subject_id, self.operation_name)
    }

    /// Store key of the suspension flag.
    /// Format: "{subject}:{operation}:suspended"
    pub fn suspended_key(&self) -> String {
        format!("{}:{}:suspended", self.subject_id, self.operation_name)
    }

    /// Keys locked for the duration of a decision.
    pub fn lock_keys(&self) -> Vec<String> {
        vec![self.count_key(), self.suspended_key()]
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.subject_id, self.operation_name)
    }
}
