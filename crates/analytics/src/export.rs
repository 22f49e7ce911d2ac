//! Tabular export of a funnel analysis: one row per step.

use serde::Serialize;

use funnel_core::types::FunnelAnalysisResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepExportRow {
    pub step: String,
    pub total_users: u64,
    /// Percent with two decimals, e.g. `"40.00"`.
    pub conversion_rate: String,
    pub drop_off_rate: String,
    /// Human duration, e.g. `"1h 02m 03s"`.
    pub avg_time_to_next: String,
}

impl StepExportRow {
    pub const HEADERS: [&'static str; 5] = [
        "step",
        "total_users",
        "conversion_rate",
        "drop_off_rate",
        "avg_time_to_next",
    ];

    pub fn fields(&self) -> [String; 5] {
        [
            self.step.clone(),
            self.total_users.to_string(),
            self.conversion_rate.clone(),
            self.drop_off_rate.clone(),
            self.avg_time_to_next.clone(),
        ]
    }
}

pub fn step_rows(result: &FunnelAnalysisResult) -> Vec<StepExportRow> {
    result
        .steps
        .iter()
        .map(|step| StepExportRow {
            step: step.step.clone(),
            total_users: step.total_users,
            conversion_rate: format!("{:.2}", step.conversion_rate),
            drop_off_rate: format!("{:.2}", step.drop_off_rate),
            avg_time_to_next: format_duration(step.avg_time_to_next),
        })
        .collect()
}

/// Formats seconds as `"12s"`, `"4m 05s"` or `"1h 02m 03s"`, rounded to the
/// nearest second. Negative and non-finite inputs render as `"0s"`.
pub fn format_duration(seconds: f64) -> String {
    if !seconds.is_finite() || seconds <= 0.0 {
        return "0s".to_string();
    }
    let total = seconds.round() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m {secs:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs:02}s")
    } else {
        format!("{secs}s")
    }
}
