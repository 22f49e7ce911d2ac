//! Step matcher: walks a session's events against the funnel's ordered steps.

use chrono::{DateTime, Utc};

use crate::definition::CompiledFunnel;
use crate::session::Session;

/// How far one session progressed through a funnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProgress {
    /// Timestamp of each reached step; index is the step index.
    pub reached: Vec<DateTime<Utc>>,
    /// First in-window event of the session.
    pub first_seen: Option<DateTime<Utc>>,
}

impl SessionProgress {
    pub fn steps_reached(&self) -> usize {
        self.reached.len()
    }

    pub fn entered(&self) -> Option<DateTime<Utc>> {
        self.reached.first().copied()
    }

    pub fn completed(&self, step_count: usize) -> bool {
        step_count > 0 && self.reached.len() == step_count
    }

    /// Entry time for cohort purposes: the step-0 reach, or the first event
    /// for sessions that never entered the funnel.
    pub fn cohort_anchor(&self) -> Option<DateTime<Utc>> {
        self.entered().or(self.first_seen)
    }
}

/// Scans `session` once. An event advances the funnel by at most one step,
/// and step i can only be matched after step i-1.
///
/// When a time box expires, the attempt in progress is closed and matching
/// restarts at the next step-0 event. The deepest attempt wins; on equal
/// depth the earliest one is kept.
pub fn match_session(session: &Session, funnel: &CompiledFunnel) -> SessionProgress {
    let step_count = funnel.step_count();
    let mut best: Vec<DateTime<Utc>> = Vec::new();
    let mut attempt: Vec<DateTime<Utc>> = Vec::with_capacity(step_count);

    for event in &session.events {
        if attempt.len() == step_count {
            break;
        }
        if expired(funnel, &attempt, event.timestamp) {
            if attempt.len() > best.len() {
                best = std::mem::take(&mut attempt);
            } else {
                attempt.clear();
            }
        }

        if funnel.steps[attempt.len()].predicate.matches(event) {
            attempt.push(event.timestamp);
        }
    }
    if attempt.len() > best.len() {
        best = attempt;
    }

    SessionProgress {
        reached: best,
        first_seen: session.first_event().map(|e| e.timestamp),
    }
}

fn expired(funnel: &CompiledFunnel, attempt: &[DateTime<Utc>], at: DateTime<Utc>) -> bool {
    let gap_exceeded = match (funnel.limits.max_step_gap, attempt.last()) {
        (Some(gap), Some(previous)) => at - *previous > gap,
        _ => false,
    };
    let window_exceeded = match (funnel.limits.conversion_window, attempt.first()) {
        (Some(window), Some(entry)) => at - *entry > window,
        _ => false,
    };
    gap_exceeded || window_exceeded
}
