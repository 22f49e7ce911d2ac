//! Cohort bucketizer: groups sessions by the date they entered the funnel.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

use funnel_core::types::{CohortRow, Granularity};

use crate::matcher::SessionProgress;
use crate::session::Session;
use crate::tally::{FunnelTally, SessionKey};

/// Truncates `ts` to the first day of its bucket (UTC).
pub fn bucket_start(ts: DateTime<Utc>, granularity: Granularity) -> NaiveDate {
    let date = ts.date_naive();
    match granularity {
        Granularity::Day => date,
        Granularity::Week => date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
        Granularity::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date),
    }
}

/// Keys a session by the bucket of its step-0 reach. Sessions that never
/// entered the funnel use their first event, so every session lands in
/// exactly one bucket.
#[derive(Debug, Clone, Copy)]
pub struct CohortGrouping {
    pub granularity: Granularity,
}

impl SessionKey for CohortGrouping {
    type Key = NaiveDate;

    fn key(&self, _session: &Session, progress: &SessionProgress) -> Option<NaiveDate> {
        progress
            .cohort_anchor()
            .map(|ts| bucket_start(ts, self.granularity))
    }
}

/// One row per non-empty bucket, oldest first.
pub fn cohort_rows(groups: &BTreeMap<NaiveDate, FunnelTally>) -> Vec<CohortRow> {
    groups
        .iter()
        .filter(|(_, tally)| tally.sessions() > 0)
        .map(|(date, tally)| {
            let completion = tally.completion();
            CohortRow {
                cohort_date: *date,
                total_users: completion.total_users,
                completed_users: completion.completed_users,
                completion_rate: completion.completion_rate,
                avg_completion_time: completion.avg_completion_time,
            }
        })
        .collect()
}
