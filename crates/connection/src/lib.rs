//! ia-cloud connection orchestrator.
//!
//! [`ConnectionOrchestrator`] is the protocol state machine. For each logical
//! operation it builds the request, submits it through whichever
//! [`protocol::Transport`] it was given, validates the response against the
//! request, updates and persists [`protocol::ConnectionInfo`], and repeats the
//! whole cycle a bounded number of times on failure.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** Sequences calls between the protocol rules in
//! the [`protocol`] crate and the transport and store ports. It contains no
//! transport details and no validation rules of its own.
//!
//! ## Retry
//!
//! | Operation | Attempts | Pause |
//! |-----------|----------|-------|
//! | `connect` | 1 | none |
//! | every other operation | [`RetrySchedule::max_attempts`] (3) | [`RetrySchedule::delay`] (1 s) |
//!
//! Local precondition failures (missing "file path", not connected,
//! unreadable attachment, store failure) are never retried.

mod orchestrator;

use std::time::Duration;

pub use orchestrator::ConnectionOrchestrator;

/// Bounded retry applied to every operation except `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}
