//! Per-loop liveness tracking.

use std::time::Duration;
use tokio::time::Instant;

/// Time since a periodic loop last completed successfully.
#[derive(Debug)]
pub struct Liveness {
    name: &'static str,
    last_success: Instant,
}

impl Liveness {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            last_success: Instant::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn reset(&mut self) {
        self.last_success = Instant::now();
    }

    pub fn age(&self) -> Duration {
        self.last_success.elapsed()
    }
}
