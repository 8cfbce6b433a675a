//! Floodgate - Sliding-Window Rate Limiting
//!
//! Callers record events for an identifier within a named scope. Events are
//! counted in fixed-width time buckets in a TTL-capable store; each scope's
//! policy evaluates its period checks over that history and, when one is
//! exceeded, blocks the identifier for a bounded time.

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use context::Context;
pub use error::{FloodgateError, Result};
