//! searcherd - prompt dispatch service for browser-automation search workers.
//!
//! Clients submit opaque prompt strings (singly or in batches); the service
//! persists them as durable jobs, dispatches each to exactly one available
//! worker, retries aggressively across workers on transient failure, and
//! exposes status/result lookup and aggregate batch progress.

pub mod admission;
pub mod batch;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod queue;
pub mod server;
pub mod store;
pub mod worker;
