//! Core error definitions for the taskweave orchestration engine.
//!
//! This crate provides the error type shared across all taskweave crates.
//!
//! # Main types
//!
//! - [`TaskweaveError`] — Unified error enum for all taskweave subsystems.
//! - [`TaskweaveResult`] — Convenience alias for `Result<T, TaskweaveError>`.

mod error;

pub use error::{TaskweaveError, TaskweaveResult};
