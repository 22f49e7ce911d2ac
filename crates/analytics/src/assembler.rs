//! Result assembler: shapes tallies into the public result types.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use funnel_core::types::{CohortRow, FunnelAnalysisResult, Period, SegmentRow};

use crate::aggregate::aggregate_steps;
use crate::cohort::cohort_rows;
use crate::definition::CompiledFunnel;
use crate::dropoff::rank_drop_offs;
use crate::segment::segment_rows;
use crate::tally::FunnelTally;

pub fn assemble_analysis(
    funnel: &CompiledFunnel,
    period: Period,
    tally: &FunnelTally,
    drop_off_limit: usize,
) -> FunnelAnalysisResult {
    let names = funnel.step_names();
    let completion = tally.completion();

    FunnelAnalysisResult {
        funnel_id: funnel.id,
        funnel_name: funnel.name.clone(),
        period,
        total_sessions: completion.total_users,
        completion_rate: completion.completion_rate,
        average_time_to_complete: completion.avg_completion_time,
        steps: aggregate_steps(tally, &names),
        drop_off_points: rank_drop_offs(tally.reached(), &names, drop_off_limit),
    }
}

pub fn assemble_cohorts(groups: &BTreeMap<NaiveDate, FunnelTally>) -> Vec<CohortRow> {
    cohort_rows(groups)
}

pub fn assemble_segments(
    funnel: &CompiledFunnel,
    groups: &BTreeMap<String, FunnelTally>,
) -> Vec<SegmentRow> {
    segment_rows(groups, &funnel.step_names())
}
