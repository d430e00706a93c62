use std::time::Duration;
use tracing::warn;

/// How a single attempt at a unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    /// The worker never started (missing executable, conflict, spawn not found).
    LaunchFailed,
    /// Exited while the sentinel was still present.
    Crashed,
    /// The CPU-sampling check flagged the worker as hung.
    Hung,
    /// The inactivity bound passed.
    TimedOut,
    /// The sentinel vanished by the harness's own hand.
    Interrupted,
}

/// Decision returned after recording an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// The unit is done.
    Proceed,
    /// Launch again; `attempt` is the 0-based index of the next attempt.
    Retry { attempt: u32 },
    /// Every attempt is spent.
    Abandon,
}

/// Bound and pacing shared by all units.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Fresh per-unit state.
    pub fn start(&self) -> RetryState {
        RetryState {
            max_attempts: self.max_attempts,
            attempts: 0,
            history: Vec::new(),
        }
    }
}

/// Attempt bookkeeping for one unit. Discarded when the unit is done.
#[derive(Debug, Clone)]
pub struct RetryState {
    max_attempts: u32,
    attempts: u32,
    history: Vec<AttemptOutcome>,
}

impl RetryState {
    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[cfg(test)]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 0-based index of the attempt about to be made.
    pub fn next_attempt(&self) -> u32 {
        self.attempts
    }

    #[cfg(test)]
    pub fn last_outcome(&self) -> Option<AttemptOutcome> {
        self.history.last().copied()
    }

    pub fn history(&self) -> &[AttemptOutcome] {
        &self.history
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Record how an attempt ended and decide what comes next.
    ///
    /// Launch failures and worker failures both use up an attempt.
    pub fn record(&mut self, outcome: AttemptOutcome) -> RetryDecision {
        self.attempts += 1;
        self.history.push(outcome);

        if outcome == AttemptOutcome::Succeeded {
            return RetryDecision::Proceed;
        }
        if self.has_attempts_left() {
            warn!(
                ?outcome,
                attempt = self.attempts,
                max_attempts = self.max_attempts,
                "attempt failed, retrying"
            );
            RetryDecision::Retry {
                attempt: self.attempts,
            }
        } else {
            warn!(
                ?outcome,
                max_attempts = self.max_attempts,
                "attempts exhausted, abandoning unit"
            );
            RetryDecision::Abandon
        }
    }
}
