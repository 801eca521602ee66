//! Lowest-free-suffix search over a sibling set.

use tracing::trace;

/// A request to pick a free name among existing siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeduplicationRequest {
    /// The name the caller wants to use
    pub base_name: String,
    /// Existing names that may collide with `base_name`
    pub sibling_names: Vec<String>,
    /// Largest suffix that can be occupied; always `sibling_names.len()`
    pub max_suffix: usize,
}

impl DeduplicationRequest {
    /// Build a request, deriving `max_suffix` from the sibling count.
    pub fn new(base_name: impl Into<String>, sibling_names: Vec<String>) -> Self {
        let max_suffix = sibling_names.len();
        Self {
            base_name: base_name.into(),
            sibling_names,
            max_suffix,
        }
    }

    /// Resolve this request to the next available name.
    pub fn resolve(&self) -> String {
        resolve(&self.base_name, &self.sibling_names)
    }
}

/// Return `"<base_name> (<n>)"` for the smallest `n >= 1` not already taken.
///
/// A sibling occupies slot `n` when a `(` appears at or after the first
/// `base_name.chars().count()` characters and the text up to the next `)`
/// parses as an integer in `1..=siblings.len()`. Anything else is ignored.
/// A suffix is always appended, even when there are no siblings.
pub fn resolve<S: AsRef<str>>(base_name: &str, sibling_names: &[S]) -> String {
    let max_suffix = sibling_names.len();
    // Slot 0 is never used; slot max_suffix + 1 is always free.
    let mut occupied = vec![false; max_suffix + 2];

    for sibling in sibling_names {
        if let Some(n) = parse_suffix(base_name, sibling.as_ref()) {
            if (1..=max_suffix).contains(&n) {
                occupied[n] = true;
            }
        }
    }

    let slot = (1..=max_suffix + 1)
        .find(|&n| !occupied[n])
        .unwrap_or(max_suffix + 1);

    trace!(
        base_name = %base_name,
        siblings = max_suffix,
        slot = slot,
        "Resolved name slot"
    );

    format!("{} ({})", base_name, slot)
}

/// Extract the parenthesised integer following the base-name offset.
fn parse_suffix(base_name: &str, sibling: &str) -> Option<usize> {
    let offset = base_name.chars().count();
    let (start, _) = sibling.char_indices().nth(offset)?;

    let rest = &sibling[start..];
    let open = rest.find('(')?;
    let after_open = &rest[open + 1..];
    let close = after_open.find(')')?;

    after_open[..close].parse().ok()
}
