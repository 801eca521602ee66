//! Rate limiting logic and state management.

mod governor;
mod key;
mod rules;
mod state;

pub use governor::RateLimitGovernor;
pub use key::RateLimitKey;
pub use rules::{OperationPolicy, PolicyRules, RatePolicy};
pub use state::{KeyStatus, RateLimitState, SuspensionRecord};
