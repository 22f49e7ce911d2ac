//! End-to-end funnel analyses through the analyzer service.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use funnel_analytics::{EventRepository, FunnelAnalyzer, InMemoryEventStore, InMemoryFunnelStore};
use funnel_cache::ResultCache;
use funnel_core::config::AnalysisConfig;
use funnel_core::error::{AnalysisError, AnalysisResult, CancelReason};
use funnel_core::types::{
    FunnelDefinition, FunnelStep, Granularity, MatchPredicate, Period, RawEvent,
};

/// Event repository that counts how often it is queried.
struct CountingEvents {
    inner: InMemoryEventStore,
    calls: AtomicUsize,
}

impl EventRepository for CountingEvents {
    fn events_between(&self, period: &Period) -> AnalysisResult<Vec<RawEvent>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.events_between(period)
    }
}

fn checkout_funnel() -> FunnelDefinition {
    let steps = vec![
        FunnelStep {
            name: "Visit".into(),
            order: 0,
            predicate: MatchPredicate::EventType {
                equals: "page_view".into(),
            },
        },
        FunnelStep {
            name: "SignUp".into(),
            order: 1,
            predicate: MatchPredicate::EventType {
                equals: "signup".into(),
            },
        },
        FunnelStep {
            name: "Purchase".into(),
            order: 2,
            predicate: MatchPredicate::PropertyContains {
                key: "url".into(),
                value: "/checkout/complete".into(),
                event_type: Some("page_view".into()),
            },
        },
    ];
    FunnelDefinition {
        id: Uuid::new_v4(),
        name: "Checkout".into(),
        steps,
        time_box: None,
        created_at: Utc::now(),
    }
}

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, d, 9, 0, 0).unwrap()
}

fn march() -> Period {
    Period::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 59).unwrap(),
    )
    .unwrap()
}

/// Events for one session that progresses `depth` steps, starting at `start`.
fn journey(session: &str, depth: usize, start: DateTime<Utc>, device: &str) -> Vec<RawEvent> {
    let mut events = vec![RawEvent::new(session, "page_view", start)
        .with_attribute("url", "/")
        .with_attribute("device", device)];
    if depth >= 2 {
        events.push(RawEvent::new(session, "signup", start + ChronoDuration::minutes(2)));
    }
    if depth >= 3 {
        events.push(
            RawEvent::new(session, "page_view", start + ChronoDuration::minutes(10))
                .with_attribute("url", "/checkout/complete"),
        );
    }
    events
}

fn setup(config: AnalysisConfig) -> (FunnelAnalyzer, Arc<InMemoryEventStore>, Uuid) {
    let events = Arc::new(InMemoryEventStore::new());
    let analyzer = FunnelAnalyzer::new(Arc::new(InMemoryFunnelStore::new()), events.clone(), config);
    let id = analyzer.define_funnel(checkout_funnel()).unwrap();
    (analyzer, events, id)
}

/// 100 sessions visit, 40 sign up, 10 purchase.
fn load_scenario_a(events: &InMemoryEventStore) {
    for i in 0..100 {
        let depth = if i < 10 {
            3
        } else if i < 40 {
            2
        } else {
            1
        };
        let device = if i % 2 == 0 { "mobile" } else { "desktop" };
        for event in journey(&format!("s{i:03}"), depth, day(5), device) {
            events.record(event);
        }
    }
}

#[tokio::test]
async fn scenario_a_step_rates() {
    let (analyzer, events, id) = setup(AnalysisConfig::default());
    load_scenario_a(&events);

    let result = analyzer
        .analyze_funnel(id, march(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.total_sessions, 100);
    assert_eq!(result.completion_rate, 10.0);
    let totals: Vec<u64> = result.steps.iter().map(|s| s.total_users).collect();
    assert_eq!(totals, vec![100, 40, 10]);
    assert_eq!(result.steps[1].drop_off_rate, 60.0);
    assert_eq!(result.steps[2].drop_off_rate, 75.0);
    assert_eq!(result.steps[2].conversion_rate, 10.0);
    assert_eq!(result.steps[0].avg_time_to_next, 120.0);
    assert_eq!(result.average_time_to_complete, 600.0);

    assert_eq!(result.drop_off_points[0].step, "SignUp");
    assert_eq!(result.drop_off_points[0].drop_off_count, 60);
    assert_eq!(result.drop_off_points[1].step, "Purchase");
    assert_eq!(result.drop_off_points[1].drop_off_count, 30);

    for pair in result.steps.windows(2) {
        assert!(pair[1].total_users <= pair[0].total_users);
    }
}

#[tokio::test]
async fn scenario_b_empty_window() {
    let (analyzer, events, id) = setup(AnalysisConfig::default());
    // Outside the requested window.
    events.record(RawEvent::new("late", "page_view", Utc.with_ymd_and_hms(2024, 4, 2, 0, 0, 0).unwrap()));

    let result = analyzer
        .analyze_funnel(id, march(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.total_sessions, 0);
    assert_eq!(result.completion_rate, 0.0);
    assert_eq!(result.average_time_to_complete, 0.0);
    assert_eq!(result.steps.len(), 3);
    assert!(result.steps.iter().all(|s| s.total_users == 0 && s.drop_off_rate == 0.0));
    assert!(result.drop_off_points.is_empty());

    let cohorts = analyzer
        .cohort_analysis(id, march(), Granularity::Week, &CancellationToken::new())
        .await
        .unwrap();
    assert!(cohorts.is_empty());
}

#[tokio::test]
async fn scenario_c_daily_cohorts() {
    let (analyzer, events, id) = setup(AnalysisConfig::default());
    for event in journey("d1-a", 3, day(1), "mobile")
        .into_iter()
        .chain(journey("d1-b", 1, day(1), "mobile"))
        .chain(journey("d2-a", 2, day(2), "mobile"))
        .chain(journey("d2-b", 1, day(2), "mobile"))
        .chain(journey("d2-c", 1, day(2), "mobile"))
    {
        events.record(event);
    }

    let cohorts = analyzer
        .cohort_analysis(id, march(), Granularity::Day, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(cohorts.len(), 2);
    assert_eq!(cohorts[0].cohort_date, day(1).date_naive());
    assert_eq!(cohorts[0].total_users, 2);
    assert_eq!(cohorts[0].completed_users, 1);
    assert_eq!(cohorts[0].completion_rate, 50.0);
    assert_eq!(cohorts[0].avg_completion_time, 600.0);
    assert_eq!(cohorts[1].total_users, 3);
    assert_eq!(cohorts[1].completion_rate, 0.0);
    assert_eq!(cohorts[1].avg_completion_time, 0.0);
}

#[tokio::test]
async fn scenario_d_segments_by_device() {
    let (analyzer, events, id) = setup(AnalysisConfig::default());
    load_scenario_a(&events);

    let segments = analyzer
        .segment_analysis(id, "device", march(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(segments.len(), 2);
    assert!(segments.iter().all(|s| s.total_users > 0));
    assert_eq!(segments.iter().map(|s| s.total_users).sum::<u64>(), 100);
    assert!(segments.iter().all(|s| s.top_drop_off_step.as_deref() == Some("SignUp")));
    // Ties on size are ordered by name.
    assert_eq!(segments[0].segment, "desktop");
    assert_eq!(segments[1].segment, "mobile");

    // Nobody carries a browser attribute, so everything is "unknown".
    let browsers = analyzer
        .segment_analysis(id, "browser", march(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(browsers.len(), 1);
    assert_eq!(browsers[0].segment, "unknown");
    assert_eq!(browsers[0].completion_rate, 10.0);
}

#[tokio::test]
async fn cohort_totals_cover_every_session() {
    let (analyzer, events, id) = setup(AnalysisConfig::default());
    load_scenario_a(&events);
    // Sessions that never match step 0 still count.
    events.record(RawEvent::new("stray-1", "signup", day(20)));
    events.record(RawEvent::new("stray-2", "scroll", day(28)));

    let overall = analyzer
        .analyze_funnel(id, march(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(overall.total_sessions, 102);
    assert_eq!(overall.steps[0].total_users, 100);

    for granularity in [Granularity::Day, Granularity::Week, Granularity::Month] {
        let cohorts = analyzer
            .cohort_analysis(id, march(), granularity, &CancellationToken::new())
            .await
            .unwrap();
        let total: u64 = cohorts.iter().map(|c| c.total_users).sum();
        assert_eq!(total, overall.total_sessions, "{granularity:?}");
    }
}

#[tokio::test]
async fn identical_inputs_serialize_identically() {
    let small_shards = AnalysisConfig {
        shard_size: 3,
        ..AnalysisConfig::default()
    };
    let (analyzer, events, id) = setup(small_shards);
    load_scenario_a(&events);

    let first = analyzer
        .analyze_funnel(id, march(), &CancellationToken::new())
        .await
        .unwrap();
    let second = analyzer
        .analyze_funnel(id, march(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );

    // Same data, one big shard, fresh analyzer.
    let (other, other_events, _) = setup(AnalysisConfig::default());
    let mut definition = checkout_funnel();
    definition.id = id;
    other.define_funnel(definition).unwrap();
    load_scenario_a(&other_events);
    let third = other
        .analyze_funnel(id, march(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&third).unwrap()
    );
}

#[tokio::test]
async fn arrival_order_does_not_change_matches() {
    let ts = day(3);
    let tied = vec![
        RawEvent::new("s", "page_view", ts).with_sequence(1),
        RawEvent::new("s", "signup", ts).with_sequence(2),
        RawEvent::new("s", "page_view", ts)
            .with_attribute("url", "/checkout/complete")
            .with_sequence(3),
    ];

    let mut results = Vec::new();
    for permutation in [[0, 1, 2], [2, 1, 0], [1, 2, 0]] {
        let (analyzer, events, id) = setup(AnalysisConfig::default());
        events.extend(permutation.iter().map(|i| tied[*i].clone()));
        let result = analyzer
            .analyze_funnel(id, march(), &CancellationToken::new())
            .await
            .unwrap();
        results.push(result.steps.iter().map(|s| s.total_users).collect::<Vec<_>>());
    }
    assert!(results.iter().all(|r| r == &vec![1, 1, 1]));

    // The sequence number, not arrival, decides precedence on a tie.
    let (analyzer, events, id) = setup(AnalysisConfig::default());
    events.extend([
        RawEvent::new("s", "page_view", ts).with_sequence(5),
        RawEvent::new("s", "signup", ts).with_sequence(4),
    ]);
    let result = analyzer
        .analyze_funnel(id, march(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.steps[0].total_users, 1);
    assert_eq!(result.steps[1].total_users, 0);
}

#[tokio::test]
async fn invalid_definition_is_rejected_before_events_are_read() {
    let events = Arc::new(CountingEvents {
        inner: InMemoryEventStore::new(),
        calls: AtomicUsize::new(0),
    });
    let funnels = Arc::new(InMemoryFunnelStore::new());
    let analyzer = FunnelAnalyzer::new(funnels.clone(), events.clone(), AnalysisConfig::default());

    // Bypass define_funnel so the store holds a broken definition.
    let mut broken = checkout_funnel();
    broken.steps[2].order = 7;
    let id = broken.id;
    funnel_analytics::FunnelRepository::save_funnel(funnels.as_ref(), broken).unwrap();

    let err = analyzer
        .analyze_funnel(id, march(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::InvalidFunnelDefinition(_)));
    assert_eq!(events.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_is_reported_distinctly() {
    let (analyzer, events, id) = setup(AnalysisConfig::default());
    load_scenario_a(&events);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = analyzer.analyze_funnel(id, march(), &cancel).await.unwrap_err();
    assert!(err.is_cancellation());
    assert!(matches!(
        err,
        AnalysisError::AnalysisCancelled(CancelReason::Caller)
    ));
}

#[tokio::test]
async fn cached_results_skip_the_event_store_until_invalidated() {
    let events = Arc::new(CountingEvents {
        inner: InMemoryEventStore::new(),
        calls: AtomicUsize::new(0),
    });
    for i in 0..5 {
        for event in journey(&format!("c{i}"), 1 + i % 3, day(7), "tablet") {
            events.inner.record(event);
        }
    }
    let cache = Arc::new(ResultCache::new(Duration::from_secs(60), 100));
    let analyzer = FunnelAnalyzer::new(
        Arc::new(InMemoryFunnelStore::new()),
        events.clone(),
        AnalysisConfig::default(),
    )
    .with_cache(cache.clone());
    let definition = checkout_funnel();
    let id = analyzer.define_funnel(definition.clone()).unwrap();

    let first = analyzer
        .segment_analysis(id, "device", march(), &CancellationToken::new())
        .await
        .unwrap();
    let second = analyzer
        .segment_analysis(id, "device", march(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(events.calls.load(Ordering::SeqCst), 1);

    // A different grouping is a different cache entry.
    analyzer
        .segment_analysis(id, "source", march(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(events.calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 2);

    // Redefining the funnel drops its cached results.
    analyzer.define_funnel(definition).unwrap();
    assert!(cache.is_empty());
    analyzer
        .segment_analysis(id, "device", march(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(events.calls.load(Ordering::SeqCst), 3);
}
