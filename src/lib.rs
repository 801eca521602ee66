//! Slotwarden - name deduplication and rate limit governance
//!
//! This crate holds the two pieces of a publishing backend that carry real
//! invariants: picking the lowest free `"name (n)"` suffix among existing
//! siblings, and a store-backed rate limit governor that counts requests in
//! fixed windows and escalates to a timed suspension. State for the governor
//! lives entirely in an external key-value store whose lock primitive
//! serialises decisions across instances.

pub mod clock;
pub mod config;
pub mod error;
pub mod naming;
pub mod ratelimit;
pub mod store;
pub mod telemetry;
