//! Message and error counters for a running peripheral

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusSnapshot {
    pub uptime: Duration,
    pub total_messages: u64,
    pub error_count: u64,
    /// Errors per accepted message, 0 before the first message
    pub error_rate: f64,
}

/// Uptime plus RX message and error counts
#[derive(Debug, Default)]
pub struct ServerStatus {
    started: Mutex<Option<Instant>>,
    total_messages: AtomicU64,
    error_count: AtomicU64,
}

impl ServerStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of uptime; later calls keep the first instant
    pub fn start(&self) {
        if let Ok(mut started) = self.started.lock() {
            started.get_or_insert_with(Instant::now);
        }
    }

    pub fn record_message(&self) {
        self.total_messages.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Time since [`start`](Self::start), zero if never started
    pub fn uptime(&self) -> Duration {
        self.started
            .lock()
            .ok()
            .and_then(|started| *started)
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst)
    }

    pub fn error_rate(&self) -> f64 {
        match self.total_messages() {
            0 => 0.0,
            total => self.error_count() as f64 / total as f64,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            uptime: self.uptime(),
            total_messages: self.total_messages(),
            error_count: self.error_count(),
            error_rate: self.error_rate(),
        }
    }
}
