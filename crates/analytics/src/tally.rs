//! Partial tallies: the shared aggregation routine behind the overall,
//! cohort and segment views.
//!
//! A tally folds matched sessions into integer counters and millisecond sums,
//! so merging partial tallies from parallel workers is exact and the result
//! does not depend on how sessions were sharded.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::matcher::SessionProgress;
use crate::session::Session;

/// Something that can absorb matched sessions and be merged with a peer.
pub trait Tally: Clone + Send + 'static {
    fn observe(&mut self, session: &Session, progress: &SessionProgress);
    fn merge(&mut self, other: Self);
}

/// Completion metrics for a group of sessions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionMetrics {
    pub total_users: u64,
    pub completed_users: u64,
    /// Percent of sessions that reached the final step.
    pub completion_rate: f64,
    /// Mean seconds from step 0 to the final step, over completed sessions.
    pub avg_completion_time: f64,
}

/// Step counters and timing sums for one group of sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunnelTally {
    sessions: u64,
    reached: Vec<u64>,
    /// Index i: sum of `reach[i+1] - reach[i]` over sessions reaching both.
    to_next_ms: Vec<u64>,
    /// Index i: sum of `reach[i] - reach[0]` over sessions reaching i.
    from_start_ms: Vec<u64>,
}

impl FunnelTally {
    pub fn new(step_count: usize) -> Self {
        Self {
            sessions: 0,
            reached: vec![0; step_count],
            to_next_ms: vec![0; step_count],
            from_start_ms: vec![0; step_count],
        }
    }

    pub fn observe_progress(&mut self, progress: &SessionProgress) {
        self.sessions += 1;
        let Some(entry) = progress.entered() else {
            return;
        };
        for (i, ts) in progress.reached.iter().enumerate().take(self.reached.len()) {
            self.reached[i] += 1;
            self.from_start_ms[i] = self.from_start_ms[i].saturating_add(elapsed_ms(entry, *ts));
            if let Some(next) = progress.reached.get(i + 1) {
                self.to_next_ms[i] = self.to_next_ms[i].saturating_add(elapsed_ms(*ts, *next));
            }
        }
    }

    pub fn merge_from(&mut self, other: &FunnelTally) {
        self.sessions += other.sessions;
        for i in 0..self.reached.len().min(other.reached.len()) {
            self.reached[i] += other.reached[i];
            self.to_next_ms[i] = self.to_next_ms[i].saturating_add(other.to_next_ms[i]);
            self.from_start_ms[i] = self.from_start_ms[i].saturating_add(other.from_start_ms[i]);
        }
    }

    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    pub fn step_count(&self) -> usize {
        self.reached.len()
    }

    /// Sessions that reached each step, in step order.
    pub fn reached(&self) -> &[u64] {
        &self.reached
    }

    pub fn completed(&self) -> u64 {
        self.reached.last().copied().unwrap_or(0)
    }

    pub fn avg_time_to_next(&self, step: usize) -> f64 {
        match self.reached.get(step + 1) {
            Some(both) => mean_secs(self.to_next_ms[step], *both),
            None => 0.0,
        }
    }

    pub fn avg_time_from_start(&self, step: usize) -> f64 {
        match self.reached.get(step) {
            Some(count) => mean_secs(self.from_start_ms[step], *count),
            None => 0.0,
        }
    }

    pub fn completion(&self) -> CompletionMetrics {
        let completed = self.completed();
        let last = self.reached.len().saturating_sub(1);
        CompletionMetrics {
            total_users: self.sessions,
            completed_users: completed,
            completion_rate: percent(completed, self.sessions),
            avg_completion_time: if self.reached.is_empty() {
                0.0
            } else {
                self.avg_time_from_start(last)
            },
        }
    }
}

impl Tally for FunnelTally {
    fn observe(&mut self, _session: &Session, progress: &SessionProgress) {
        self.observe_progress(progress);
    }

    fn merge(&mut self, other: Self) {
        self.merge_from(&other);
    }
}

/// Chooses the group a session belongs to.
pub trait SessionKey: Clone + Send + Sync + 'static {
    type Key: Ord + Clone + Send + std::fmt::Debug + 'static;

    fn key(&self, session: &Session, progress: &SessionProgress) -> Option<Self::Key>;
}

/// One [`FunnelTally`] per group key.
#[derive(Debug, Clone)]
pub struct GroupedTally<G: SessionKey> {
    grouping: G,
    step_count: usize,
    groups: BTreeMap<G::Key, FunnelTally>,
}

impl<G: SessionKey> GroupedTally<G> {
    pub fn new(grouping: G, step_count: usize) -> Self {
        Self {
            grouping,
            step_count,
            groups: BTreeMap::new(),
        }
    }

    pub fn groups(&self) -> &BTreeMap<G::Key, FunnelTally> {
        &self.groups
    }
}

impl<G: SessionKey> Tally for GroupedTally<G> {
    fn observe(&mut self, session: &Session, progress: &SessionProgress) {
        let Some(key) = self.grouping.key(session, progress) else {
            return;
        };
        let step_count = self.step_count;
        self.groups
            .entry(key)
            .or_insert_with(|| FunnelTally::new(step_count))
            .observe_progress(progress);
    }

    fn merge(&mut self, other: Self) {
        for (key, tally) in other.groups {
            match self.groups.get_mut(&key) {
                Some(existing) => existing.merge_from(&tally),
                None => {
                    self.groups.insert(key, tally);
                }
            }
        }
    }
}

/// `numerator / denominator * 100`, bounded to [0, 100]; 0 when the
/// denominator is 0.
pub fn percent(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    (numerator as f64 / denominator as f64 * 100.0).clamp(0.0, 100.0)
}

/// Mean of a millisecond sum in seconds; 0 when there are no samples.
pub fn mean_secs(total_ms: u64, samples: u64) -> f64 {
    if samples == 0 {
        return 0.0;
    }
    total_ms as f64 / samples as f64 / 1000.0
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_milliseconds()).unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn progress(reached: &[i64]) -> SessionProgress {
        SessionProgress {
            reached: reached.iter().map(|s| t(*s)).collect(),
            first_seen: Some(t(0)),
        }
    }

    #[test]
    fn test_counts_and_timings() {
        let mut tally = FunnelTally::new(3);
        tally.observe_progress(&progress(&[0, 10, 40]));
        tally.observe_progress(&progress(&[0, 20]));
        tally.observe_progress(&progress(&[]));

        assert_eq!(tally.sessions(), 3);
        assert_eq!(tally.reached(), &[2, 2, 1]);
        assert_eq!(tally.avg_time_to_next(0), 15.0);
        assert_eq!(tally.avg_time_to_next(1), 30.0);
        assert_eq!(tally.avg_time_to_next(2), 0.0);
        assert_eq!(tally.avg_time_from_start(1), 15.0);
        assert_eq!(tally.avg_time_from_start(2), 40.0);

        let completion = tally.completion();
        assert_eq!(completion.completed_users, 1);
        assert!((completion.completion_rate - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(completion.avg_completion_time, 40.0);
    }

    #[test]
    fn test_merge_matches_single_pass() {
        let samples = [vec![0, 5, 9], vec![0], vec![0, 3], vec![], vec![0, 1, 2]];

        let mut single = FunnelTally::new(3);
        for s in &samples {
            single.observe_progress(&progress(s));
        }

        let mut left = FunnelTally::new(3);
        let mut right = FunnelTally::new(3);
        for (i, s) in samples.iter().enumerate() {
            if i % 2 == 0 {
                left.observe_progress(&progress(s));
            } else {
                right.observe_progress(&progress(s));
            }
        }
        right.merge_from(&left);
        assert_eq!(right, single);
    }

    #[test]
    fn test_empty_tally_is_all_zero() {
        let tally = FunnelTally::new(2);
        let completion = tally.completion();
        assert_eq!(completion.total_users, 0);
        assert_eq!(completion.completion_rate, 0.0);
        assert_eq!(completion.avg_completion_time, 0.0);
        assert_eq!(tally.avg_time_to_next(0), 0.0);
    }

    #[test]
    fn test_percent_guards_zero() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
        assert_eq!(mean_secs(1500, 0), 0.0);
        assert_eq!(mean_secs(3000, 2), 1.5);
    }
}
