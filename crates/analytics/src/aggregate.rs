//! Step aggregator: per-step totals, conversion and drop-off rates, timings.

use funnel_core::types::StepAggregate;

use crate::tally::{percent, FunnelTally};

/// Reduces a tally into one [`StepAggregate`] per step.
///
/// Conversion is relative to step 0; drop-off is relative to the previous
/// step and is 0 for step 0.
pub fn aggregate_steps(tally: &FunnelTally, step_names: &[String]) -> Vec<StepAggregate> {
    let reached = tally.reached();
    let entered = reached.first().copied().unwrap_or(0);

    step_names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let total_users = reached.get(i).copied().unwrap_or(0);
            let drop_off_rate = match i.checked_sub(1).and_then(|p| reached.get(p)) {
                Some(previous) => percent(previous.saturating_sub(total_users), *previous),
                None => 0.0,
            };
            StepAggregate {
                step: name.clone(),
                step_number: i + 1,
                total_users,
                conversion_rate: percent(total_users, entered),
                drop_off_rate,
                avg_time_to_next: tally.avg_time_to_next(i),
                avg_time_from_start: tally.avg_time_from_start(i),
            }
        })
        .collect()
}
