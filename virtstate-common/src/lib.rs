//! # virtstate Common
//!
//! Shared utilities for the virtstate workspace.
//!
//! ## Logging
//!
//! ```rust
//! use virtstate_common::init_logging;
//!
//! init_logging("info").unwrap();
//! ```
//!
//! ## Deadlines
//!
//! [`Deadline`] carries an optional caller-supplied deadline through
//! long-running operations, so per-call timeouts can be truncated to the
//! time the caller actually has left.

pub mod deadline;
pub mod logging;

pub use deadline::Deadline;
pub use logging::{init_logging, init_logging_json};
