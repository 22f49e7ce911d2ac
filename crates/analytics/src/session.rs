//! Session builder: groups raw events into per-visitor, time-ordered sessions.

use std::collections::BTreeMap;

use funnel_core::types::{Period, RawEvent};

/// All in-window events sharing one session identifier, ordered by
/// `(timestamp, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub events: Vec<RawEvent>,
}

impl Session {
    pub fn first_event(&self) -> Option<&RawEvent> {
        self.events.first()
    }
}

/// Builds sessions from `events`, dropping anything outside `period`.
///
/// The output is ordered by session id and each session's events by
/// `(timestamp, sequence)`, so the result does not depend on arrival order.
pub fn build_sessions(events: Vec<RawEvent>, period: &Period) -> Vec<Session> {
    let mut grouped: BTreeMap<String, Vec<RawEvent>> = BTreeMap::new();
    for event in events {
        if !period.contains(event.timestamp) {
            continue;
        }
        grouped
            .entry(event.session_id.clone())
            .or_default()
            .push(event);
    }

    grouped
        .into_iter()
        .map(|(session_id, mut events)| {
            // Full key so events identical in time and sequence still land in a fixed order.
            events.sort_by(|a, b| {
                (a.timestamp, a.sequence, &a.event_type, &a.attributes).cmp(&(
                    b.timestamp,
                    b.sequence,
                    &b.event_type,
                    &b.attributes,
                ))
            });
            Session { session_id, events }
        })
        .collect()
}
