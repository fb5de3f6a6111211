//! The worker slot table.

use std::time::{Duration, Instant};

/// Bookkeeping for one worker process position.
///
/// The pid is only meaningful while `alive` is true. The error window starts
/// at the first abnormal exit and resets once the gap since the last error
/// exceeds the configured period.
#[derive(Debug)]
pub struct WorkerSlot {
    pub id: u32,
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    pub alive: bool,
    errors: u32,
    first_error: Option<Instant>,
    last_error: Option<Instant>,
}

impl WorkerSlot {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self {
            id,
            pid: None,
            started_at: None,
            alive: false,
            errors: 0,
            first_error: None,
            last_error: None,
        }
    }

    pub fn mark_spawned(&mut self, pid: u32) {
        self.pid = Some(pid);
        self.started_at = Some(Instant::now());
        self.alive = true;
    }

    pub fn mark_exited(&mut self) {
        self.alive = false;
        self.pid = None;
    }

    /// Records an abnormal exit and returns the error count inside the
    /// current window.
    pub fn record_error(&mut self, error_period: Duration) -> u32 {
        self.record_error_at(Instant::now(), error_period)
    }

    fn record_error_at(&mut self, now: Instant, error_period: Duration) -> u32 {
        let expired = self
            .last_error
            .is_some_and(|last| now.duration_since(last) > error_period);

        if expired || self.first_error.is_none() {
            self.errors = 0;
            self.first_error = Some(now);
        }

        self.errors += 1;
        self.last_error = Some(now);
        self.errors
    }

    /// Error count inside the current window.
    #[must_use]
    pub const fn error_count(&self) -> u32 {
        self.errors
    }
}
