//! Duplicate name resolution.
//!
//! Given a base name and the sibling names that already exist next to it,
//! picks the smallest free `"<base> (<n>)"` suffix. The sibling set is
//! fetched by the caller; nothing here performs I/O.

mod resolver;

pub use resolver::{resolve, DeduplicationRequest};
