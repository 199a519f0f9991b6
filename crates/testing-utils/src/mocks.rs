//! Recording doubles for worker callbacks and error handlers
//!
//! Worker callbacks are closures, so instead of mocking a trait the tests hand a
//! recorder into the closure and assert on what it saw afterwards.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use worker_host_core::WorkerError;

/// Counts invocations and tracks how many are in flight at once
#[derive(Debug, Clone, Default)]
pub struct CallRecorder {
    inner: Arc<RecorderInner>,
}

#[derive(Debug, Default)]
struct RecorderInner {
    calls: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    started_at: Mutex<Vec<Instant>>,
}

impl CallRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of an invocation; the returned guard marks its end when dropped.
    /// Returns the 1-based call number alongside the guard.
    pub fn enter(&self) -> (u32, CallGuard) {
        let call = self.inner.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let in_flight = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        self.inner.started_at.lock().unwrap().push(Instant::now());
        (
            call,
            CallGuard {
                inner: Arc::clone(&self.inner),
            },
        )
    }

    pub fn calls(&self) -> u32 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> u32 {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> u32 {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn start_times(&self) -> Vec<Instant> {
        self.inner.started_at.lock().unwrap().clone()
    }
}

pub struct CallGuard {
    inner: Arc<RecorderInner>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One error delivered to a worker's error handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedError {
    pub exception_type: String,
    pub message: String,
    pub is_timeout: bool,
}

/// Collects everything passed to an error handler
#[derive(Debug, Clone, Default)]
pub struct ErrorSink {
    errors: Arc<Mutex<Vec<RecordedError>>>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler suitable for `WorkerBuilder::with_error_handler`
    pub fn handler(&self) -> impl Fn(&WorkerError) + Send + Sync + 'static {
        let errors = Arc::clone(&self.errors);
        move |error: &WorkerError| {
            errors.lock().unwrap().push(RecordedError {
                exception_type: error.exception_type().to_string(),
                message: error.to_string(),
                is_timeout: error.is_timeout(),
            });
        }
    }

    pub fn errors(&self) -> Vec<RecordedError> {
        self.errors.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}
