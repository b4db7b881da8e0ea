//! trafficgate - Sliding-Window API Quota Enforcement
//!
//! This crate admits or rejects per-user, per-endpoint API calls against a
//! sliding-window request quota. Window state lives in a shared sorted-set
//! store (Redis in production), so every instance of the service enforces the
//! same quota.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
pub mod usage;
