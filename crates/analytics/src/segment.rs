//! Segment bucketizer: groups sessions by an attribute of their first event.

use std::collections::BTreeMap;

use funnel_core::types::{RawEvent, SegmentDimension, SegmentRow};

use crate::dropoff::top_drop_off_step;
use crate::matcher::SessionProgress;
use crate::session::Session;
use crate::tally::{FunnelTally, SessionKey};

/// Segment name for sessions whose first event lacks the attribute.
pub const UNKNOWN_SEGMENT: &str = "unknown";

fn browser(event: &RawEvent) -> Option<&str> {
    event.attribute("browser")
}

fn device(event: &RawEvent) -> Option<&str> {
    event
        .attribute("device")
        .or_else(|| event.attribute("device_type"))
}

fn source(event: &RawEvent) -> Option<&str> {
    event
        .attribute("source")
        .or_else(|| event.attribute("utm_source"))
}

fn location(event: &RawEvent) -> Option<&str> {
    event
        .attribute("location")
        .or_else(|| event.attribute("country"))
}

/// The extraction function backing each dimension.
pub fn extractor(dimension: SegmentDimension) -> fn(&RawEvent) -> Option<&str> {
    match dimension {
        SegmentDimension::Browser => browser,
        SegmentDimension::Device => device,
        SegmentDimension::Source => source,
        SegmentDimension::Location => location,
    }
}

/// Value of `dimension` on the session's first event.
pub fn segment_value(session: &Session, dimension: SegmentDimension) -> String {
    session
        .first_event()
        .and_then(extractor(dimension))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(UNKNOWN_SEGMENT)
        .to_string()
}

#[derive(Debug, Clone, Copy)]
pub struct SegmentGrouping {
    pub dimension: SegmentDimension,
}

impl SessionKey for SegmentGrouping {
    type Key = String;

    fn key(&self, session: &Session, _progress: &SessionProgress) -> Option<String> {
        Some(segment_value(session, self.dimension))
    }
}

/// One row per non-empty segment, largest first, ties by name.
pub fn segment_rows(groups: &BTreeMap<String, FunnelTally>, step_names: &[String]) -> Vec<SegmentRow> {
    let mut rows: Vec<SegmentRow> = groups
        .iter()
        .filter(|(_, tally)| tally.sessions() > 0)
        .map(|(segment, tally)| {
            let completion = tally.completion();
            SegmentRow {
                segment: segment.clone(),
                total_users: completion.total_users,
                completed_users: completion.completed_users,
                completion_rate: completion.completion_rate,
                avg_completion_time: completion.avg_completion_time,
                top_drop_off_step: top_drop_off_step(tally.reached(), step_names),
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.total_users
            .cmp(&a.total_users)
            .then_with(|| a.segment.cmp(&b.segment))
    });
    rows
}
