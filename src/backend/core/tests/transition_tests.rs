//! Tests for phase change handling.

mod common;

use common::{scheduler, FakeResults};
use laplink_core::jobs::{JobKey, PhaseTransitionController, TransitionOutcome};
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[tokio::test(start_paused = true)]
async fn test_leaving_active_phases_stops_job() {
    let results = FakeResults::new();
    results.script(42, 2, [3]);
    let controller = PhaseTransitionController::new(scheduler(&results));
    let scheduler = controller.scheduler().clone();

    let started_at = Instant::now();
    scheduler.start(42, 2).unwrap();
    sleep(Duration::from_secs(16)).await;

    let snapshot = scheduler.snapshot(42, 2).await.unwrap();
    assert_eq!(snapshot.last_rows_affected, Some(3));
    assert!(snapshot.last_effective_update > started_at);

    let outcome = controller.on_phase_changed(42, 2, 4).unwrap();
    assert_eq!(outcome.stopped, Some(JobKey::new(42, 2)));
    assert_eq!(outcome.started, None);
    assert!(scheduler.is_empty());

    assert!(scheduler.trigger(42, 2).await.unwrap().is_none());
    sleep(Duration::from_secs(60)).await;
    assert_eq!(results.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_phase_change_is_idempotent() {
    let results = FakeResults::new();
    let controller = PhaseTransitionController::new(scheduler(&results));

    controller.on_phase_changed(11, 0, 1).unwrap();
    let first = controller.on_phase_changed(11, 1, 2).unwrap();
    let keys_after_first = controller.scheduler().keys();
    let second = controller.on_phase_changed(11, 1, 2).unwrap();

    assert_eq!(first.stopped, Some(JobKey::new(11, 1)));
    assert_eq!(second.stopped, None);
    assert_eq!(second.started, Some(JobKey::new(11, 2)));
    assert_eq!(controller.scheduler().keys(), keys_after_first);
    assert_eq!(keys_after_first, vec![JobKey::new(11, 2)]);

    controller.on_phase_changed(11, 2, 5).unwrap();
    let repeat = controller.on_phase_changed(11, 2, 5).unwrap();
    assert_eq!(repeat, TransitionOutcome::default());
    assert!(controller.scheduler().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_custom_active_phases() {
    let results = FakeResults::new();
    let controller = PhaseTransitionController::with_active_phases(scheduler(&results), vec![7]);

    assert!(controller.on_phase_changed(1, 0, 2).unwrap().started.is_none());
    assert_eq!(
        controller.on_phase_changed(1, 2, 7).unwrap().started,
        Some(JobKey::new(1, 7))
    );
}

#[tokio::test(start_paused = true)]
async fn test_events_keep_separate_jobs() {
    let results = FakeResults::new();
    let controller = PhaseTransitionController::new(scheduler(&results));

    controller.on_phase_changed(1, 0, 1).unwrap();
    controller.on_phase_changed(2, 0, 1).unwrap();
    controller.on_phase_changed(1, 1, 3).unwrap();

    assert_eq!(
        controller.scheduler().keys(),
        vec![JobKey::new(1, 3), JobKey::new(2, 1)]
    );

    assert!(controller.on_event_deleted(2, 1));
    assert!(!controller.on_event_deleted(2, 1));
    assert_eq!(controller.scheduler().keys(), vec![JobKey::new(1, 3)]);
}
