//! Turnstile - Fixed-Window Admission Limiter
//!
//! This crate limits requests per client IP or API token. Each identity gets
//! a short-lived request counter; exceeding the limit blocks the identity for
//! a configurable period. State lives either in this process or in Redis so
//! that several processes can enforce one shared limit.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
