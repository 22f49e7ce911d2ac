//! Repository seams for funnel definitions and raw events, plus in-memory
//! implementations. Persistent stores live with the ingestion layer.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use funnel_core::error::AnalysisResult;
use funnel_core::types::{FunnelDefinition, Period, RawEvent};

pub trait FunnelRepository: Send + Sync {
    fn get_funnel(&self, id: &Uuid) -> AnalysisResult<Option<FunnelDefinition>>;
    fn save_funnel(&self, definition: FunnelDefinition) -> AnalysisResult<()>;
    fn list_funnels(&self) -> AnalysisResult<Vec<FunnelDefinition>>;
}

pub trait EventRepository: Send + Sync {
    /// All events with a timestamp inside `period` (inclusive).
    fn events_between(&self, period: &Period) -> AnalysisResult<Vec<RawEvent>>;
}

pub struct InMemoryFunnelStore {
    funnels: DashMap<Uuid, FunnelDefinition>,
}

impl InMemoryFunnelStore {
    pub fn new() -> Self {
        Self {
            funnels: DashMap::new(),
        }
    }
}

impl Default for InMemoryFunnelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FunnelRepository for InMemoryFunnelStore {
    fn get_funnel(&self, id: &Uuid) -> AnalysisResult<Option<FunnelDefinition>> {
        Ok(self.funnels.get(id).map(|f| f.clone()))
    }

    fn save_funnel(&self, definition: FunnelDefinition) -> AnalysisResult<()> {
        self.funnels.insert(definition.id, definition);
        Ok(())
    }

    fn list_funnels(&self) -> AnalysisResult<Vec<FunnelDefinition>> {
        let mut funnels: Vec<FunnelDefinition> =
            self.funnels.iter().map(|f| f.value().clone()).collect();
        funnels.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(funnels)
    }
}

/// Append-only event log that assigns ingestion sequence numbers.
pub struct InMemoryEventStore {
    events: RwLock<Vec<RawEvent>>,
    next_sequence: AtomicU64,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Appends `event`, overwriting its sequence with the next ingestion number.
    pub fn record(&self, mut event: RawEvent) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        event.sequence = Some(sequence);
        self.events.write().push(event);
        sequence
    }

    /// Appends a batch in iteration order. Events that already carry a
    /// sequence keep it; the rest get the next ingestion number.
    pub fn extend(&self, events: impl IntoIterator<Item = RawEvent>) {
        let mut guard = self.events.write();
        for mut event in events {
            match event.sequence {
                Some(sequence) => {
                    self.next_sequence
                        .fetch_max(sequence.saturating_add(1), Ordering::Relaxed);
                }
                None => {
                    event.sequence = Some(self.next_sequence.fetch_add(1, Ordering::Relaxed));
                }
            }
            guard.push(event);
        }
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRepository for InMemoryEventStore {
    fn events_between(&self, period: &Period) -> AnalysisResult<Vec<RawEvent>> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| period.contains(e.timestamp))
            .cloned()
            .collect())
    }
}
