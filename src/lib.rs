//! Burstguard - In-process API rate limiting
//!
//! This crate decides whether a request for an (API key, route) pair should
//! be admitted. Each key is capped per second, but short spikes are
//! tolerated as long as the key has not exceeded its burst budget for the
//! trailing minute. Counts live in a sharded in-memory store owned by the
//! embedding service and are evicted once they leave the burst window.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod replay;
