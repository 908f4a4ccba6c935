//! # taskq
//!
//! Persistent work queue for background tasks.
//!
//! Producers submit tasks; concurrent workers claim them one at a time
//! through an atomic peek; every outcome (success, failure, cancellation)
//! is archived with its timing and diagnostics. Postgres is the durable
//! store; an in-memory store backs tests and embedded use.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod ids;
pub mod model;
pub mod status;
pub mod telemetry;
