//! # Worker Host Testing Utils
//!
//! Shared testing utilities for the worker host workspace.
//!
//! - **Recorders**: [`CallRecorder`] and [`ErrorSink`] observe callbacks and error handlers
//! - **Span capture**: [`SpanCapture`] keeps the fields of closed spans for assertions
//! - **Helpers**: polling and fixed timestamps for paused-time tests
//!
//! ## Usage
//!
//! ```toml
//! [dev-dependencies]
//! worker-host-testing-utils = { path = "../testing-utils" }
//! ```

pub mod helpers;
pub mod mocks;
pub mod spans;

pub use helpers::*;
pub use mocks::*;
pub use spans::*;
