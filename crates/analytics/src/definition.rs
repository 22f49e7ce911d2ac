//! Funnel definition validation and predicate compilation.

use chrono::Duration;
use regex::Regex;
use uuid::Uuid;

use funnel_core::error::{AnalysisError, AnalysisResult};
use funnel_core::types::{FunnelDefinition, MatchPredicate, RawEvent};

/// A predicate with its regex (if any) compiled once up front.
#[derive(Debug, Clone)]
pub enum CompiledPredicate {
    EventType(String),
    PropertyEquals {
        key: String,
        value: String,
        event_type: Option<String>,
    },
    PropertyContains {
        key: String,
        value: String,
        event_type: Option<String>,
    },
    PropertyMatches {
        key: String,
        pattern: Regex,
        event_type: Option<String>,
    },
}

impl CompiledPredicate {
    fn compile(step: &str, predicate: &MatchPredicate) -> AnalysisResult<Self> {
        let compiled = match predicate {
            MatchPredicate::EventType { equals } => {
                if equals.is_empty() {
                    return Err(AnalysisError::InvalidFunnelDefinition(format!(
                        "step '{step}' matches an empty event type"
                    )));
                }
                CompiledPredicate::EventType(equals.clone())
            }
            MatchPredicate::PropertyEquals {
                key,
                value,
                event_type,
            } => CompiledPredicate::PropertyEquals {
                key: non_empty_key(step, key)?,
                value: value.clone(),
                event_type: event_type.clone(),
            },
            MatchPredicate::PropertyContains {
                key,
                value,
                event_type,
            } => CompiledPredicate::PropertyContains {
                key: non_empty_key(step, key)?,
                value: value.clone(),
                event_type: event_type.clone(),
            },
            MatchPredicate::PropertyMatches {
                key,
                pattern,
                event_type,
            } => {
                let regex = Regex::new(pattern).map_err(|e| {
                    AnalysisError::InvalidFunnelDefinition(format!(
                        "step '{step}' has an invalid pattern: {e}"
                    ))
                })?;
                CompiledPredicate::PropertyMatches {
                    key: non_empty_key(step, key)?,
                    pattern: regex,
                    event_type: event_type.clone(),
                }
            }
        };
        Ok(compiled)
    }

    pub fn matches(&self, event: &RawEvent) -> bool {
        match self {
            CompiledPredicate::EventType(expected) => event.event_type == *expected,
            CompiledPredicate::PropertyEquals {
                key,
                value,
                event_type,
            } => {
                type_allows(event_type, event)
                    && event.attribute(key).is_some_and(|actual| actual == value)
            }
            CompiledPredicate::PropertyContains {
                key,
                value,
                event_type,
            } => {
                type_allows(event_type, event)
                    && event
                        .attribute(key)
                        .is_some_and(|actual| actual.contains(value.as_str()))
            }
            CompiledPredicate::PropertyMatches {
                key,
                pattern,
                event_type,
            } => {
                type_allows(event_type, event)
                    && event
                        .attribute(key)
                        .is_some_and(|actual| pattern.is_match(actual))
            }
        }
    }
}

fn type_allows(event_type: &Option<String>, event: &RawEvent) -> bool {
    event_type
        .as_ref()
        .map_or(true, |expected| event.event_type == *expected)
}

fn non_empty_key(step: &str, key: &str) -> AnalysisResult<String> {
    if key.is_empty() {
        return Err(AnalysisError::InvalidFunnelDefinition(format!(
            "step '{step}' matches on an empty property key"
        )));
    }
    Ok(key.to_string())
}

#[derive(Debug, Clone)]
pub struct CompiledStep {
    pub name: String,
    pub predicate: CompiledPredicate,
}

/// Time-box limits converted to durations.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepLimits {
    pub max_step_gap: Option<Duration>,
    pub conversion_window: Option<Duration>,
}

/// A validated funnel, ready for matching.
#[derive(Debug, Clone)]
pub struct CompiledFunnel {
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<CompiledStep>,
    pub limits: StepLimits,
}

impl CompiledFunnel {
    /// Validates `definition` and compiles its predicates.
    ///
    /// Rejects fewer than two steps, `order` values that are not exactly
    /// `0..n` in list order, and empty step names.
    pub fn compile(definition: &FunnelDefinition) -> AnalysisResult<Self> {
        if definition.steps.len() < 2 {
            return Err(AnalysisError::InvalidFunnelDefinition(format!(
                "funnel '{}' has {} step(s), at least 2 are required",
                definition.name,
                definition.steps.len()
            )));
        }

        let mut steps = Vec::with_capacity(definition.steps.len());
        for (position, step) in definition.steps.iter().enumerate() {
            if step.order as usize != position {
                return Err(AnalysisError::InvalidFunnelDefinition(format!(
                    "step '{}' has order {} at position {}; orders must be unique, contiguous and start at 0",
                    step.name, step.order, position
                )));
            }
            if step.name.trim().is_empty() {
                return Err(AnalysisError::InvalidFunnelDefinition(format!(
                    "step at position {position} has an empty name"
                )));
            }
            steps.push(CompiledStep {
                name: step.name.clone(),
                predicate: CompiledPredicate::compile(&step.name, &step.predicate)?,
            });
        }

        let time_box = definition.time_box.unwrap_or_default();
        let limits = StepLimits {
            max_step_gap: seconds(time_box.max_step_gap_secs)?,
            conversion_window: seconds(time_box.conversion_window_secs)?,
        };

        Ok(Self {
            id: definition.id,
            name: definition.name.clone(),
            steps,
            limits,
        })
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }
}

fn seconds(value: Option<u64>) -> AnalysisResult<Option<Duration>> {
    value
        .map(|secs| {
            i64::try_from(secs)
                .ok()
                .and_then(Duration::try_seconds)
                .ok_or_else(|| {
                    AnalysisError::InvalidFunnelDefinition(format!(
                        "time box of {secs}s is out of range"
                    ))
                })
        })
        .transpose()
}
