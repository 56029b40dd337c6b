//! End-to-end tracking scenarios.
//!
//! Drives the full pipeline: city detection -> candidate lookup -> matching ->
//! dedup -> progress, through both the engine and the threaded session.
//!
//! Run with: `cargo test --test tracking_scenarios -- --nocapture`
//! (set `RUST_LOG=debug` for pipeline logging)

use city_walker::{
    locate, Advisory, CityBoundary, CityCatalogue, GpsPoint, InMemoryMapData, MatchOutcome,
    Position, ProgressAggregator, RoadSegment, TrackingConfig, TrackingEngine, TrackingEvent,
    TrackingSession, TrackingState, WalkedSegment,
};
use std::sync::Arc;

const T0: i64 = 1_700_000_000_000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn athens_boundary() -> CityBoundary {
    CityBoundary::new(
        "athens",
        vec![
            GpsPoint::new(37.95, 23.70),
            GpsPoint::new(37.95, 23.76),
            GpsPoint::new(37.97, 23.76),
            GpsPoint::new(37.97, 23.70),
        ],
    )
}

/// Ten east-west streets, 0.001° (~111m) apart, ids 1..=10.
fn athens_streets() -> Vec<RoadSegment> {
    (0..10u64)
        .map(|i| {
            let lat = 37.951 + i as f64 * 0.001;
            RoadSegment::new(
                i + 1,
                "athens",
                vec![GpsPoint::new(lat, 23.70), GpsPoint::new(lat, 23.72)],
            )
            .unwrap()
        })
        .collect()
}

fn street_fix(street: u64, offset: i64) -> Position {
    let lat = 37.951 + (street - 1) as f64 * 0.001 + 0.0001;
    Position::new(lat, 23.71, 8.0, T0 + offset)
}

fn athens_engine(config: TrackingConfig) -> TrackingEngine {
    let mut data = InMemoryMapData::new();
    data.add_city(athens_boundary(), athens_streets());
    TrackingEngine::new("walker", config, Box::new(data)).unwrap()
}

// ============================================================================
// Test: City Detection
// ============================================================================

#[test]
fn test_rectangular_city_detection() {
    let boundaries = [athens_boundary()];
    assert_eq!(locate(&GpsPoint::new(37.96, 23.73), &boundaries), Some("athens"));
    assert_eq!(locate(&GpsPoint::new(38.10, 23.73), &boundaries), None);
}

// ============================================================================
// Test: Single Road Credit
// ============================================================================

#[test]
fn test_single_road_credited_once() {
    init_logging();
    let road = RoadSegment::new(
        1,
        "athens",
        vec![GpsPoint::new(37.96, 23.70), GpsPoint::new(37.96, 23.72)],
    )
    .unwrap();
    let mut data = InMemoryMapData::new();
    data.add_city(athens_boundary(), vec![road]);
    let mut engine = TrackingEngine::new("walker", TrackingConfig::default(), Box::new(data)).unwrap();
    engine.start().unwrap();

    let first = engine.process_fix(&Position::new(37.9602, 23.71, 10.0, T0));
    let event = first.event.expect("first fix should credit the road");
    assert_eq!(
        event,
        WalkedSegment {
            user_id: "walker".to_string(),
            segment_id: 1,
            city_id: "athens".to_string(),
            walked_at: T0,
        }
    );

    let repeat = engine.process_fix(&Position::new(37.9602, 23.711, 10.0, T0 + 1_000));
    assert!(repeat.event.is_none());
    assert_eq!(engine.progress("athens").unwrap().segments_walked, 1);
}

// ============================================================================
// Test: Completion Percent
// ============================================================================

#[test]
fn test_three_of_ten_streets_is_thirty_percent() {
    let mut engine = athens_engine(TrackingConfig::default());
    engine.start().unwrap();

    for (i, street) in [2u64, 5, 9].iter().enumerate() {
        let outcome = engine.process_fix(&street_fix(*street, i as i64));
        assert!(matches!(outcome.outcome, MatchOutcome::Credited(m) if m.segment_id == *street));
    }

    let progress = engine.progress("athens").unwrap();
    assert_eq!(progress.segments_walked, 3);
    assert_eq!(progress.total_segments, 10);
    assert_eq!(progress.completion_percent, 30.0);
    assert!((progress.distance_walked_meters - 3.0 * 1756.0).abs() < 20.0);
}

// ============================================================================
// Test: Low Accuracy
// ============================================================================

#[test]
fn test_low_accuracy_fix_detects_city_but_never_credits() {
    let mut engine = athens_engine(TrackingConfig::default());
    engine.start().unwrap();
    let events = engine.subscribe();

    // ~5m north of street 1, accuracy 50m
    let outcome = engine.process_fix(&Position::new(37.95104, 23.71, 50.0, T0));
    assert!(outcome.event.is_none());
    assert_eq!(outcome.city_id.as_deref(), Some("athens"));

    let received: Vec<TrackingEvent> = events.try_iter().collect();
    assert!(!received.iter().any(|e| matches!(e, TrackingEvent::Walked(_))));
    assert!(received.contains(&TrackingEvent::Advisory(Advisory::LowAccuracyFix {
        accuracy_meters: 50.0
    })));
}

// ============================================================================
// Test: Advisories Never Halt The Stream
// ============================================================================

#[test]
fn test_stream_survives_every_advisory() {
    init_logging();
    let mut data = InMemoryMapData::new();
    data.add_boundary(athens_boundary());
    let mut engine =
        TrackingEngine::new("walker", TrackingConfig::default(), Box::new(data.clone())).unwrap();
    engine.start().unwrap();

    // Outside every city
    let outcome = engine.process_fix(&Position::new(38.10, 23.73, 5.0, T0));
    assert_eq!(outcome.advisories, vec![Advisory::CityUndetermined]);

    // Inside, but no road data yet
    let outcome = engine.process_fix(&street_fix(1, 1));
    assert_eq!(
        outcome.advisories,
        vec![Advisory::CatalogueMissing {
            city_id: "athens".to_string()
        }]
    );

    // Source drops out
    engine.position_lost();
    assert_eq!(engine.state(), TrackingState::Active);

    // Data arrives, fixes resume
    data.set_segments("athens", athens_streets());
    let outcome = engine.process_fix(&street_fix(1, 2));
    assert!(outcome.advisories.is_empty());
    assert!(matches!(outcome.outcome, MatchOutcome::Credited(_)));

    // Between two streets: nothing within 25m
    let outcome = engine.process_fix(&Position::new(37.9515, 23.71, 5.0, T0 + 3));
    assert_eq!(outcome.outcome, MatchOutcome::NoSegment);

    let stats = engine.stats();
    assert_eq!(stats.fixes_processed, 4);
    assert_eq!(stats.segments_credited, 1);
}

// ============================================================================
// Test: Progress Recovery
// ============================================================================

#[test]
fn test_recompute_matches_live_progress() {
    let config = TrackingConfig {
        record_revisits: true,
        ..TrackingConfig::default()
    };
    let mut engine = athens_engine(config);
    engine.start().unwrap();

    // Walk back and forth over a few streets
    let route = [1u64, 2, 3, 2, 1, 4, 4, 7, 3];
    for (i, street) in route.iter().enumerate() {
        engine.process_fix(&street_fix(*street, i as i64 * 1_000));
    }

    let live = engine.progress("athens").unwrap();
    assert_eq!(live.segments_walked, 5);
    assert!(engine.verify_consistency().is_empty());

    // Replay the recorded log into a fresh aggregator
    let history = engine
        .progress_handle()
        .read()
        .unwrap()
        .history("walker", "athens");
    assert_eq!(history.len(), route.len());

    let catalogue = Arc::new(CityCatalogue::new("athens", athens_streets()).unwrap());
    let rebuilt = city_walker::progress::recompute("walker", "athens", &history, Some(catalogue.as_ref()));
    assert_eq!(rebuilt, live);

    let mut replay = ProgressAggregator::new();
    replay.set_catalogue(catalogue);
    for event in &history {
        replay.apply(event);
    }
    assert_eq!(replay.progress("walker", "athens"), Some(live));
}

// ============================================================================
// Test: Threaded Session
// ============================================================================

#[test]
fn test_session_applies_queued_fixes_in_order() {
    init_logging();
    let mut session = TrackingSession::spawn(athens_engine(TrackingConfig::default()));
    let events = session.subscribe();
    session.start().unwrap();

    let sender = session.sender();
    let producer = std::thread::spawn(move || {
        for street in 1..=10u64 {
            sender.send(street_fix(street, street as i64)).unwrap();
        }
    });
    producer.join().unwrap();
    session.flush().unwrap();
    session.stop().unwrap();

    // Fixes after stop are dropped
    session.sender().send(street_fix(1, 99)).unwrap();
    session.flush().unwrap();

    let progress = session.progress("walker", "athens").unwrap();
    assert_eq!(progress.segments_walked, 10);
    assert_eq!(progress.completion_percent, 100.0);
    assert_eq!(progress.last_updated, Some(T0 + 10));

    let walked: Vec<u64> = events
        .try_iter()
        .filter_map(|e| match e {
            TrackingEvent::Walked(w) => Some(w.segment_id),
            _ => None,
        })
        .collect();
    assert_eq!(walked, (1..=10).collect::<Vec<u64>>());

    let json = session.with_engine(|engine| engine.progress_json()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed[0]["segments_walked"], 10);

    session.shutdown();
}

#[test]
fn test_stop_right_after_sending_keeps_every_fix() {
    let mut session = TrackingSession::spawn(athens_engine(TrackingConfig::default()));
    session.start().unwrap();

    let sender = session.sender();
    for street in 1..=10u64 {
        sender.send(street_fix(street, street as i64)).unwrap();
    }
    session.stop().unwrap();

    assert_eq!(session.state(), TrackingState::Idle);
    let progress = session.progress("walker", "athens").unwrap();
    assert_eq!(progress.segments_walked, 10);
    assert_eq!(session.with_engine(|engine| engine.stats()).fixes_ignored, 0);
}

#[test]
fn test_pause_right_after_sending_keeps_every_fix() {
    let mut session = TrackingSession::spawn(athens_engine(TrackingConfig::default()));
    session.start().unwrap();

    let sender = session.sender();
    for street in [2u64, 4, 6, 8] {
        sender.send(street_fix(street, street as i64)).unwrap();
    }
    session.pause().unwrap();
    assert_eq!(session.progress("walker", "athens").unwrap().segments_walked, 4);

    // While paused new fixes are dropped; after resume they count again
    sender.send(street_fix(1, 20)).unwrap();
    session.resume().unwrap();
    sender.send(street_fix(3, 21)).unwrap();
    session.stop().unwrap();

    let progress = session.progress("walker", "athens").unwrap();
    assert_eq!(progress.segments_walked, 5);
    assert_eq!(progress.last_updated, Some(T0 + 21));
}

#[test]
fn test_config_loaded_from_json() {
    let config = TrackingConfig::from_json(r#"{ "max_match_distance_meters": 15.0 }"#).unwrap();
    let mut engine = athens_engine(config);
    engine.start().unwrap();

    // ~11m from street 1: inside 15m
    assert!(engine.process_fix(&street_fix(1, 0)).event.is_some());
    // ~17m from street 2: outside 15m
    let far = Position::new(37.95215, 23.71, 5.0, T0 + 1);
    assert_eq!(engine.process_fix(&far).outcome, MatchOutcome::NoSegment);
}
