use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use funnel_cache::{CacheKey, ResultCache};
use funnel_core::config::{AnalysisConfig, AppConfig};
use funnel_core::error::{AnalysisError, AnalysisResult};
use funnel_core::types::{
    AnalysisOutput, CohortRow, FunnelAnalysisResult, FunnelDefinition, Granularity, GroupBy,
    Period, SegmentDimension, SegmentRow,
};

use crate::assembler::{assemble_analysis, assemble_cohorts, assemble_segments};
use crate::cohort::CohortGrouping;
use crate::definition::CompiledFunnel;
use crate::reduce::{reduce_parallel, ReduceOptions};
use crate::segment::SegmentGrouping;
use crate::session::build_sessions;
use crate::store::{EventRepository, FunnelRepository};
use crate::tally::{FunnelTally, GroupedTally};

/// Query facade over the funnel pipeline.
///
/// Resolves definitions and events through the injected repositories, runs
/// the parallel reduction and memoizes results in the optional cache.
#[derive(Clone)]
pub struct FunnelAnalyzer {
    funnels: Arc<dyn FunnelRepository>,
    events: Arc<dyn EventRepository>,
    cache: Option<Arc<ResultCache>>,
    config: AnalysisConfig,
}

impl std::fmt::Debug for FunnelAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunnelAnalyzer")
            .field("cached_results", &self.cache.as_ref().map(|c| c.len()))
            .field("config", &self.config)
            .finish()
    }
}

impl FunnelAnalyzer {
    pub fn new(
        funnels: Arc<dyn FunnelRepository>,
        events: Arc<dyn EventRepository>,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            funnels,
            events,
            cache: None,
            config,
        }
    }

    /// Builds an analyzer from the application config, attaching a result
    /// cache when caching is enabled.
    pub fn from_config(
        funnels: Arc<dyn FunnelRepository>,
        events: Arc<dyn EventRepository>,
        config: &AppConfig,
    ) -> Self {
        let analyzer = Self::new(funnels, events, config.analysis.clone());
        if config.cache.enabled {
            analyzer.with_cache(Arc::new(ResultCache::from_config(&config.cache)))
        } else {
            analyzer
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Stored definitions, oldest first.
    pub fn list_funnels(&self) -> AnalysisResult<Vec<FunnelDefinition>> {
        self.funnels.list_funnels()
    }

    /// Validates and stores a definition, dropping any cached results for it.
    pub fn define_funnel(&self, definition: FunnelDefinition) -> AnalysisResult<Uuid> {
        CompiledFunnel::compile(&definition)?;
        let id = definition.id;
        info!(funnel_id = %id, name = %definition.name, steps = definition.steps.len(), "Defining funnel");
        self.funnels.save_funnel(definition)?;
        self.invalidate(&id);
        Ok(id)
    }

    /// Drops cached results for `funnel_id`; call after events for it change.
    pub fn invalidate(&self, funnel_id: &Uuid) {
        if let Some(cache) = &self.cache {
            cache.invalidate_funnel(funnel_id);
        }
    }

    pub async fn analyze_funnel(
        &self,
        funnel_id: Uuid,
        period: Period,
        cancel: &CancellationToken,
    ) -> AnalysisResult<FunnelAnalysisResult> {
        match self.run(funnel_id, period, GroupBy::Overall, cancel).await? {
            AnalysisOutput::Overall(result) => Ok(result),
            other => Err(unexpected_output("overall", &other)),
        }
    }

    pub async fn cohort_analysis(
        &self,
        funnel_id: Uuid,
        period: Period,
        granularity: Granularity,
        cancel: &CancellationToken,
    ) -> AnalysisResult<Vec<CohortRow>> {
        match self
            .run(funnel_id, period, GroupBy::Cohort(granularity), cancel)
            .await?
        {
            AnalysisOutput::Cohorts(rows) => Ok(rows),
            other => Err(unexpected_output("cohorts", &other)),
        }
    }

    /// `dimension` is one of `browser`, `device`, `source`, `location`;
    /// anything else fails before the funnel or events are loaded.
    pub async fn segment_analysis(
        &self,
        funnel_id: Uuid,
        dimension: &str,
        period: Period,
        cancel: &CancellationToken,
    ) -> AnalysisResult<Vec<SegmentRow>> {
        let dimension: SegmentDimension = dimension.parse()?;
        match self
            .run(funnel_id, period, GroupBy::Segment(dimension), cancel)
            .await?
        {
            AnalysisOutput::Segments(rows) => Ok(rows),
            other => Err(unexpected_output("segments", &other)),
        }
    }

    async fn run(
        &self,
        funnel_id: Uuid,
        period: Period,
        group_by: GroupBy,
        cancel: &CancellationToken,
    ) -> AnalysisResult<AnalysisOutput> {
        let started = Instant::now();
        let result = self.run_uncounted(funnel_id, period, group_by, cancel).await;
        match &result {
            Ok(_) => {
                metrics::counter!("funnel.analysis.completed").increment(1);
                info!(
                    funnel_id = %funnel_id,
                    ?group_by,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Funnel analysis complete"
                );
            }
            Err(e) if e.is_cancellation() => {
                metrics::counter!("funnel.analysis.cancelled").increment(1);
                warn!(funnel_id = %funnel_id, ?group_by, error = %e, "Funnel analysis cancelled");
            }
            Err(e) => {
                metrics::counter!("funnel.analysis.failed").increment(1);
                warn!(funnel_id = %funnel_id, ?group_by, error = %e, "Funnel analysis failed");
            }
        }
        result
    }

    async fn run_uncounted(
        &self,
        funnel_id: Uuid,
        period: Period,
        group_by: GroupBy,
        cancel: &CancellationToken,
    ) -> AnalysisResult<AnalysisOutput> {
        let period = Period::new(period.start, period.end)?;
        let definition = self
            .funnels
            .get_funnel(&funnel_id)?
            .ok_or(AnalysisError::FunnelNotFound(funnel_id))?;
        let funnel = Arc::new(CompiledFunnel::compile(&definition)?);

        let key = CacheKey::new(funnel_id, period, group_by);
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&key) {
                metrics::counter!("funnel.cache.hit").increment(1);
                debug!(funnel_id = %funnel_id, ?group_by, "Serving funnel analysis from cache");
                return Ok(hit);
            }
            metrics::counter!("funnel.cache.miss").increment(1);
        }

        let events = self.events.events_between(&period)?;
        let event_count = events.len();
        let sessions = build_sessions(events, &period);
        debug!(
            funnel_id = %funnel_id,
            events = event_count,
            sessions = sessions.len(),
            "Built sessions"
        );

        let options = ReduceOptions {
            shard_size: self.config.shard_size,
            timeout: Duration::from_millis(self.config.timeout_ms),
        };
        let step_count = funnel.step_count();

        let output = match group_by {
            GroupBy::Overall => {
                let tally = reduce_parallel(
                    sessions,
                    Arc::clone(&funnel),
                    FunnelTally::new(step_count),
                    options,
                    cancel,
                )
                .await?;
                AnalysisOutput::Overall(assemble_analysis(
                    &funnel,
                    period,
                    &tally,
                    self.config.top_drop_off_points,
                ))
            }
            GroupBy::Cohort(granularity) => {
                let grouped = reduce_parallel(
                    sessions,
                    Arc::clone(&funnel),
                    GroupedTally::new(CohortGrouping { granularity }, step_count),
                    options,
                    cancel,
                )
                .await?;
                AnalysisOutput::Cohorts(assemble_cohorts(grouped.groups()))
            }
            GroupBy::Segment(dimension) => {
                let grouped = reduce_parallel(
                    sessions,
                    Arc::clone(&funnel),
                    GroupedTally::new(SegmentGrouping { dimension }, step_count),
                    options,
                    cancel,
                )
                .await?;
                AnalysisOutput::Segments(assemble_segments(&funnel, grouped.groups()))
            }
        };

        if let Some(cache) = &self.cache {
            cache.put(key, output.clone());
        }
        Ok(output)
    }
}

fn unexpected_output(expected: &str, output: &AnalysisOutput) -> AnalysisError {
    let found = match output {
        AnalysisOutput::Overall(_) => "overall",
        AnalysisOutput::Cohorts(_) => "cohorts",
        AnalysisOutput::Segments(_) => "segments",
    };
    AnalysisError::Internal(anyhow!("expected {expected} output, found {found}"))
}
