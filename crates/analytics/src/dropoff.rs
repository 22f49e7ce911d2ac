//! Drop-off ranker.

use funnel_core::types::DropOffPoint;

use crate::tally::percent;

/// Ranks the steps where sessions were lost.
///
/// `drop_off_count[i] = reached[i-1] - reached[i]` for i > 0. Sorted by count
/// descending, ties by step order; steps that lost nobody are left out.
pub fn rank_drop_offs(reached: &[u64], step_names: &[String], limit: usize) -> Vec<DropOffPoint> {
    let mut points: Vec<DropOffPoint> = reached
        .windows(2)
        .zip(step_names.iter().skip(1))
        .enumerate()
        .filter_map(|(i, (pair, name))| {
            let lost = pair[0].saturating_sub(pair[1]);
            (lost > 0).then(|| DropOffPoint {
                step: name.clone(),
                step_number: i + 2,
                drop_off_count: lost,
                drop_off_rate: percent(lost, pair[0]),
            })
        })
        .collect();

    points.sort_by(|a, b| {
        b.drop_off_count
            .cmp(&a.drop_off_count)
            .then(a.step_number.cmp(&b.step_number))
    });
    points.truncate(limit);
    points
}

/// Name of the step with the largest drop-off, if any step lost sessions.
pub fn top_drop_off_step(reached: &[u64], step_names: &[String]) -> Option<String> {
    rank_drop_offs(reached, step_names, 1)
        .into_iter()
        .next()
        .map(|p| p.step)
}
