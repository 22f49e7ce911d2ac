//! Parallel map/merge over sessions.
//!
//! Sessions are cut into shards; each shard is matched and folded into a
//! private partial tally on the blocking pool, then the partials are merged
//! on the calling task. Workers never share counters.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use funnel_core::error::{AnalysisError, AnalysisResult, CancelReason};

use crate::definition::CompiledFunnel;
use crate::matcher::match_session;
use crate::session::Session;
use crate::tally::Tally;

/// Matches every session and folds it into `tally` on the current thread.
pub fn fold_sessions<T: Tally>(sessions: &[Session], funnel: &CompiledFunnel, mut tally: T) -> T {
    for session in sessions {
        let progress = match_session(session, funnel);
        tally.observe(session, &progress);
    }
    tally
}

/// Sharding and deadline for one parallel reduction.
#[derive(Debug, Clone, Copy)]
pub struct ReduceOptions {
    pub shard_size: usize,
    pub timeout: Duration,
}

/// Matches `sessions` in parallel shards and merges the partial tallies into
/// `seed`.
///
/// Returns `AnalysisCancelled` if `cancel` fires or `options.timeout`
/// elapses before every shard finished; no partial result is returned.
pub async fn reduce_parallel<T: Tally>(
    sessions: Vec<Session>,
    funnel: Arc<CompiledFunnel>,
    seed: T,
    options: ReduceOptions,
    cancel: &CancellationToken,
) -> AnalysisResult<T> {
    if cancel.is_cancelled() {
        return Err(AnalysisError::AnalysisCancelled(CancelReason::Caller));
    }

    let workers = cancel.child_token();
    let shard_size = options.shard_size.max(1);
    let mut set = JoinSet::new();
    let mut remaining = sessions.into_iter();

    loop {
        let shard: Vec<Session> = remaining.by_ref().take(shard_size).collect();
        if shard.is_empty() {
            break;
        }
        let funnel = Arc::clone(&funnel);
        let token = workers.clone();
        let mut partial = seed.clone();
        set.spawn_blocking(move || {
            for session in &shard {
                if token.is_cancelled() {
                    return None;
                }
                let progress = match_session(session, &funnel);
                partial.observe(session, &progress);
            }
            Some(partial)
        });
    }

    debug!(shards = set.len(), shard_size, "Dispatched session shards");
    if set.is_empty() {
        return Ok(seed);
    }

    let deadline_at = tokio::time::Instant::now() + options.timeout;
    let deadline = tokio::time::sleep_until(deadline_at);
    tokio::pin!(deadline);

    let mut merged = seed;
    loop {
        if tokio::time::Instant::now() >= deadline_at {
            return Err(abandon(&workers, &mut set, cancelled(CancelReason::DeadlineExceeded)));
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(abandon(&workers, &mut set, cancelled(CancelReason::Caller)));
            }
            _ = &mut deadline => {
                return Err(abandon(&workers, &mut set, cancelled(CancelReason::DeadlineExceeded)));
            }
            joined = set.join_next() => match joined {
                None => break,
                Some(Ok(Some(partial))) => merged.merge(partial),
                // A worker only bails out once the caller's token fired.
                Some(Ok(None)) => {
                    return Err(abandon(&workers, &mut set, cancelled(CancelReason::Caller)));
                }
                Some(Err(e)) => {
                    let err = AnalysisError::Internal(anyhow!("session shard failed: {e}"));
                    return Err(abandon(&workers, &mut set, err));
                }
            },
        }
    }

    Ok(merged)
}

fn cancelled(reason: CancelReason) -> AnalysisError {
    AnalysisError::AnalysisCancelled(reason)
}

/// Stops the remaining shards before `err` is handed back.
fn abandon<T: 'static>(
    workers: &CancellationToken,
    set: &mut JoinSet<T>,
    err: AnalysisError,
) -> AnalysisError {
    workers.cancel();
    set.abort_all();
    err
}
