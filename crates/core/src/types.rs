use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AnalysisError;

// ─── Funnel Definitions ─────────────────────────────────────────────────────

/// A named, ordered sequence of steps a session is expected to pass through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelDefinition {
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<FunnelStep>,
    /// Optional expiry for step matches. Absent means no expiry.
    #[serde(default)]
    pub time_box: Option<FunnelTimeBox>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelStep {
    pub name: String,
    pub order: u32,
    pub predicate: MatchPredicate,
}

/// Condition an event must satisfy to count as reaching a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchPredicate {
    EventType {
        equals: String,
    },
    PropertyEquals {
        key: String,
        value: String,
        #[serde(default)]
        event_type: Option<String>,
    },
    PropertyContains {
        key: String,
        value: String,
        #[serde(default)]
        event_type: Option<String>,
    },
    PropertyMatches {
        key: String,
        pattern: String,
        #[serde(default)]
        event_type: Option<String>,
    },
}

/// Bounds on how long a session may take between steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelTimeBox {
    /// Step i must be reached within this many seconds of step i-1.
    #[serde(default)]
    pub max_step_gap_secs: Option<u64>,
    /// Every step must be reached within this many seconds of step 0.
    #[serde(default)]
    pub conversion_window_secs: Option<u64>,
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// A single visitor event as handed over by the ingestion layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub session_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Ingestion sequence number, breaks ties between equal timestamps.
    /// Unset events are numbered by the event store in arrival order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl RawEvent {
    pub fn new(
        session_id: impl Into<String>,
        event_type: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            event_type: event_type.into(),
            timestamp,
            attributes: BTreeMap::new(),
            sequence: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

// ─── Query Parameters ───────────────────────────────────────────────────────

/// Inclusive analysis window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AnalysisError> {
        if start > end {
            return Err(AnalysisError::InvalidPeriod {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Cohort bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Day,
    /// ISO week, starting Monday.
    Week,
    Month,
}

impl FromStr for Granularity {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(Granularity::Day),
            "week" | "weekly" => Ok(Granularity::Week),
            "month" | "monthly" => Ok(Granularity::Month),
            other => Err(AnalysisError::Config(format!(
                "unsupported cohort granularity '{other}'"
            ))),
        }
    }
}

/// Session attribute a segment analysis can group by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentDimension {
    Browser,
    Device,
    Source,
    Location,
}

impl SegmentDimension {
    pub const ALL: [SegmentDimension; 4] = [
        SegmentDimension::Browser,
        SegmentDimension::Device,
        SegmentDimension::Source,
        SegmentDimension::Location,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentDimension::Browser => "browser",
            SegmentDimension::Device => "device",
            SegmentDimension::Source => "source",
            SegmentDimension::Location => "location",
        }
    }
}

impl FromStr for SegmentDimension {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SegmentDimension::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| AnalysisError::UnknownSegmentDimension(s.to_string()))
    }
}

/// Third component of the result-cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    Overall,
    Cohort(Granularity),
    Segment(SegmentDimension),
}

// ─── Results ────────────────────────────────────────────────────────────────

/// Per-step totals, rates (percent) and timings (seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAggregate {
    pub step: String,
    pub step_number: usize,
    pub total_users: u64,
    pub conversion_rate: f64,
    pub drop_off_rate: f64,
    pub avg_time_to_next: f64,
    pub avg_time_from_start: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropOffPoint {
    pub step: String,
    pub step_number: usize,
    pub drop_off_count: u64,
    pub drop_off_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelAnalysisResult {
    pub funnel_id: Uuid,
    pub funnel_name: String,
    pub period: Period,
    pub total_sessions: u64,
    pub completion_rate: f64,
    pub average_time_to_complete: f64,
    pub steps: Vec<StepAggregate>,
    pub drop_off_points: Vec<DropOffPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortRow {
    pub cohort_date: NaiveDate,
    pub total_users: u64,
    pub completed_users: u64,
    pub completion_rate: f64,
    pub avg_completion_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRow {
    pub segment: String,
    pub total_users: u64,
    pub completed_users: u64,
    pub completion_rate: f64,
    pub avg_completion_time: f64,
    pub top_drop_off_step: Option<String>,
}

/// Any of the three result shapes, as stored by the result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AnalysisOutput {
    Overall(FunnelAnalysisResult),
    Cohorts(Vec<CohortRow>),
    Segments(Vec<SegmentRow>),
}
