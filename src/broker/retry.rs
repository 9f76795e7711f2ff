//! Retry policy for the connect loop
//!
//! Every attempt ends in an [`AttemptOutcome`]. The loop never inspects error
//! variants itself; [`classify`] is the only place that decides.

use crate::{Error, ErrorClass, Result};
use std::time::Duration;
use tokio::time::Instant;

/// First backoff delay
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Backoff ceiling
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Result of one connect-and-ping attempt
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    /// Attempt produced a usable connection
    Success(T),
    /// Transient failure; try again within the budget
    Retry(Error),
    /// Failure that ends the loop
    Abort(Error),
}

/// Classify the result of one attempt
pub fn classify<T>(result: Result<T>) -> AttemptOutcome<T> {
    match result {
        Ok(value) => AttemptOutcome::Success(value),
        Err(err) if err.class() == ErrorClass::Canceled => AttemptOutcome::Abort(err),
        Err(err) if err.is_retryable() => AttemptOutcome::Retry(err),
        Err(err) => AttemptOutcome::Abort(err),
    }
}

/// Exponential backoff bounded by a total budget
#[derive(Debug, Clone)]
pub struct RetryBudget {
    deadline: Instant,
    timeout: Duration,
    next_delay: Duration,
}

impl RetryBudget {
    /// Budget of `timeout` starting now
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
            next_delay: INITIAL_BACKOFF,
        }
    }

    /// Configured total budget
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the budget is used up
    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Next sleep, doubled each call, capped at [`MAX_BACKOFF`] and the remaining budget
    ///
    /// Returns `None` once nothing is left to wait for.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return None;
        }
        let delay = self.next_delay.min(remaining);
        self.next_delay = (self.next_delay * 2).min(MAX_BACKOFF);
        Some(delay)
    }
}
