//! Cipher job lifecycle.
//!
//! ```text
//! Idle → Admitting → KeyReady → Streaming(0..n) → Finalizing → Completed
//!            │           │            │               │
//!            └───────────┴────────────┴───────────────┴──→ Failed
//! ```

use std::fmt;

use lockbox_core::{Direction, FileIdentifier, LockboxError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    /// Key obtained and storage admission in progress
    Admitting,
    /// Key in hand, admission granted, nothing streamed yet
    KeyReady,
    Streaming { chunk: u64 },
    /// All chunks processed; metadata and permissions being applied
    Finalizing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Idle => f.write_str("idle"),
            JobState::Admitting => f.write_str("admitting"),
            JobState::KeyReady => f.write_str("key-ready"),
            JobState::Streaming { chunk } => write!(f, "streaming({chunk})"),
            JobState::Finalizing => f.write_str("finalizing"),
            JobState::Completed => f.write_str("completed"),
            JobState::Failed => f.write_str("failed"),
        }
    }
}

/// Tracks one job's state and logs every transition.
#[derive(Debug)]
pub struct JobTracker {
    id: FileIdentifier,
    direction: Direction,
    state: JobState,
}

impl JobTracker {
    pub fn new(direction: Direction, id: &FileIdentifier) -> Self {
        Self {
            id: id.clone(),
            direction,
            state: JobState::Idle,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Move to `next`. Terminal states are sticky.
    pub fn advance(&mut self, next: JobState) {
        if self.state.is_terminal() {
            return;
        }
        debug!(
            job = %self.id,
            direction = %self.direction,
            from = %self.state,
            to = %next,
            "job transition"
        );
        self.state = next;
    }

    /// Settle the job according to its result.
    pub fn settle<T>(&mut self, result: &Result<T, LockboxError>) {
        match result {
            Ok(_) => self.advance(JobState::Completed),
            Err(e) => {
                debug!(job = %self.id, direction = %self.direction, error = %e, "job failed");
                self.advance(JobState::Failed);
            }
        }
    }
}
