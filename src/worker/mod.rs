//! Southbound HTTP client for the browser-automation workers.

mod client;
mod types;

pub use client::{WorkerClient, WorkerError};
pub use types::{SearchOutcome, WorkerHealth};
