//! # qtask-rs
//!
//! Lightweight job queue with pluggable durability.
//!
//! Producers enqueue typed [`model::TaskRecord`]s through a
//! [`queue::TaskQueue`]; [`engine::WorkerScheduler`]s lease and execute them.
//! Storage is Redis, Postgres or in-process memory, chosen by URI scheme.
//! Delivery is at-least-once: abandoned leases are requeued by an
//! [`engine::LeaseSupervisor`], and per-status TTLs are enforced by an
//! [`engine::ExpirySweeper`].

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
pub mod telemetry;

pub use error::{Error, Result};
