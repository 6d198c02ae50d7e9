//! Readiness polling
//!
//! [`StateChangeConf`] repeatedly refreshes an object and classifies it by a
//! state label until the label is one of the targets. An error from the
//! refresh function ends the wait immediately; every other label (pending
//! or not) keeps polling at a fixed interval until the timeout.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{Error, Result};

/// Overall time allowed for a component to become ready
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Delay between two refreshes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// State label for a ready object
pub const STATE_RUNNING: &str = "Running";

/// State label for an object that is not ready yet
pub const STATE_PENDING: &str = "Pending";

/// Wait configuration for a state transition
#[derive(Debug, Clone)]
pub struct StateChangeConf {
    description: String,
    target: Vec<String>,
    pending: Vec<String>,
    interval: Duration,
    timeout: Duration,
}

impl StateChangeConf {
    /// Wait for `Running`, treating `Pending` as expected, with default timings
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            target: vec![STATE_RUNNING.to_string()],
            pending: vec![STATE_PENDING.to_string()],
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    /// Replace the target labels
    pub fn with_target<I, S>(mut self, target: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target = target.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the expected pending labels
    pub fn with_pending<I, S>(mut self, pending: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pending = pending.into_iter().map(Into::into).collect();
        self
    }

    /// Set the delay between refreshes
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the overall timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Refresh until a target label is reported.
    ///
    /// Returns the object from the refresh that reached the target. The
    /// refresh function is invoked at most `timeout / interval + 1` times.
    pub async fn wait_for_state<T, F, Fut>(&self, mut refresh: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(T, String)>>,
    {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let (object, state) = refresh().await?;

            if self.target.iter().any(|t| *t == state) {
                debug!(
                    what = %self.description,
                    state = %state,
                    attempts,
                    "target state reached"
                );
                return Ok(object);
            }

            if self.pending.iter().any(|p| *p == state) {
                trace!(what = %self.description, state = %state, "still pending");
            } else {
                debug!(what = %self.description, state = %state, "unexpected state, polling on");
            }

            if Instant::now() + self.interval > deadline {
                tokio::time::sleep_until(deadline).await;
                return Err(Error::timeout(
                    format!(
                        "{} did not reach {:?} (last state {})",
                        self.description, self.target, state
                    ),
                    start.elapsed(),
                ));
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}
