use std::sync::Arc;
use std::time::Duration;

use draftsync_core::{FieldValue, QueuedUpdate, SaveStatus};
use draftsync_engine::{
    AutosaveConfig, AutosaveController, Connectivity, SaveError, SaveOutcome,
};
use draftsync_harness::{ObservedEvent, RecordingObserver, ScriptedBackend, fields, init_tracing};
use draftsync_storage::{KeyValueStore, MemoryStore, get_decoded};
use tokio::time::sleep;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

struct Fixture {
    backend: Arc<ScriptedBackend>,
    observer: Arc<RecordingObserver>,
    autosave: AutosaveController,
}

fn fixture(
    backend: ScriptedBackend,
    config: AutosaveConfig,
) -> Result<Fixture, Box<dyn std::error::Error>> {
    init_tracing();
    let backend = Arc::new(backend);
    let observer = Arc::new(RecordingObserver::new());
    let autosave = AutosaveController::builder(backend.clone())
        .config(config)
        .observer(observer.clone())
        .build(fields([("title", "".into()), ("summary", "".into())]), 1)?;
    Ok(Fixture {
        backend,
        observer,
        autosave,
    })
}

fn fast() -> AutosaveConfig {
    AutosaveConfig::default().with_delay(ms(100))
}

// ============================================================================
// Debounced flushing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn title_burst_saves_last_value_once() -> TestResult {
    let f = fixture(ScriptedBackend::new(1), fast())?;

    f.autosave.update_field("title", "a".into());
    sleep(ms(20)).await;
    f.autosave.update_field("title", "ab".into());
    sleep(ms(150)).await;

    let updates = f.backend.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].fields, fields([("title", "ab".into())]));
    assert_eq!(updates[0].version, Some(1));
    assert_eq!(f.autosave.status(), SaveStatus::Saved);
    assert_eq!(f.autosave.version(), 2);
    assert!(!f.autosave.is_dirty());
    assert!(f.autosave.last_saved().is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn distinct_fields_in_one_window_share_a_save() -> TestResult {
    let f = fixture(ScriptedBackend::new(1), fast())?;

    f.autosave.update_field("title", "Q3 plan".into());
    sleep(ms(50)).await;
    f.autosave.update_field("summary", "Grow retention".into());
    sleep(ms(200)).await;

    let updates = f.backend.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(
        updates[0].fields,
        fields([
            ("summary", "Grow retention".into()),
            ("title", "Q3 plan".into()),
        ])
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn field_delay_override_and_batch_use_shortest_delay() -> TestResult {
    let config = AutosaveConfig::default().with_field_delay("title", ms(50));
    let f = fixture(ScriptedBackend::new(1), config)?;

    f.autosave.update_fields(fields([
        ("title", "Fast".into()),
        ("summary", "Slow".into()),
    ]));
    assert!(f.autosave.is_flush_scheduled());
    sleep(ms(60)).await;

    assert_eq!(f.backend.call_count(), 1);
    assert_eq!(f.backend.updates()[0].fields.len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn optimistic_concurrency_can_be_disabled() -> TestResult {
    let config = AutosaveConfig {
        optimistic_concurrency: false,
        ..fast()
    };
    let f = fixture(ScriptedBackend::new(1).without_versions(), config)?;

    f.autosave.update_field("title", "x".into());
    sleep(ms(150)).await;

    assert_eq!(f.backend.updates()[0].version, None);
    assert_eq!(f.autosave.version(), 1);
    assert_eq!(f.autosave.status(), SaveStatus::Saved);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn edit_during_save_keeps_newer_value_dirty() -> TestResult {
    let f = fixture(ScriptedBackend::new(1).with_latency(ms(50)), fast())?;

    f.autosave.update_field("title", "a".into());
    sleep(ms(120)).await;
    f.autosave.update_field("title", "ab".into());
    sleep(ms(40)).await;

    // First ack landed at t=150 for "a"; "ab" is still pending.
    assert_eq!(f.autosave.status(), SaveStatus::Dirty);
    assert!(f.autosave.dirty_fields().contains("title"));

    sleep(ms(200)).await;
    let updates = f.backend.updates();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[1].fields, fields([("title", "ab".into())]));
    assert_eq!(updates[1].version, Some(2));
    assert_eq!(f.autosave.status(), SaveStatus::Saved);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn status_flows_through_save_cycle() -> TestResult {
    let f = fixture(ScriptedBackend::new(1), fast())?;
    let rx = f.autosave.subscribe_status();
    assert_eq!(*rx.borrow(), SaveStatus::Idle);

    f.autosave.update_field("title", "x".into());
    assert_eq!(f.autosave.status(), SaveStatus::Dirty);
    sleep(ms(150)).await;

    assert_eq!(*rx.borrow(), SaveStatus::Saved);
    assert_eq!(
        f.observer.statuses(),
        [SaveStatus::Dirty, SaveStatus::Saving, SaveStatus::Saved]
    );
    assert_eq!(f.observer.count(|e| matches!(e, ObservedEvent::Saved(2))), 1);
    Ok(())
}

// ============================================================================
// Supersession, reset, teardown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn superseded_save_does_not_overwrite_draft() -> TestResult {
    let f = fixture(ScriptedBackend::new(1), fast())?;
    f.backend.delay_next(ms(500));

    f.autosave.update_field("title", "a".into());
    let slow = tokio::spawn({
        let autosave = f.autosave.clone();
        async move { autosave.force_save().await }
    });
    sleep(ms(10)).await;
    assert_eq!(f.autosave.status(), SaveStatus::Saving);

    f.autosave.update_field("title", "ab".into());
    let outcome = f.autosave.force_save().await?;
    assert_eq!(outcome, SaveOutcome::Saved { version: 2 });
    assert_eq!(slow.await?, Ok(SaveOutcome::Superseded));

    sleep(ms(1_000)).await;
    assert_eq!(f.backend.call_count(), 2);
    assert_eq!(f.autosave.field("title"), Some(FieldValue::text("ab")));
    assert_eq!(f.autosave.version(), 2);
    assert_eq!(f.autosave.status(), SaveStatus::Saved);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn force_save_skips_the_debounce() -> TestResult {
    let f = fixture(ScriptedBackend::new(1), AutosaveConfig::default())?;

    f.autosave.update_field("title", "now".into());
    let outcome = f.autosave.force_save().await?;

    assert_eq!(outcome, SaveOutcome::Saved { version: 2 });
    assert!(!f.autosave.is_flush_scheduled());
    sleep(ms(5_000)).await;
    assert_eq!(f.backend.call_count(), 1);
    assert_eq!(f.autosave.force_save().await?, SaveOutcome::NothingToSave);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reset_discards_pending_edits() -> TestResult {
    let f = fixture(ScriptedBackend::new(1), fast())?;

    f.autosave.update_field("title", "draft".into());
    f.autosave.reset();
    sleep(ms(500)).await;

    assert_eq!(f.backend.call_count(), 0);
    assert_eq!(f.autosave.field("title"), Some(FieldValue::text("")));
    assert!(!f.autosave.is_dirty());
    assert_eq!(f.autosave.status(), SaveStatus::Idle);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn teardown_ignores_late_completion() -> TestResult {
    let f = fixture(ScriptedBackend::new(1), fast())?;
    f.backend.delay_next(ms(500));

    f.autosave.update_field("title", "a".into());
    sleep(ms(150)).await;
    assert_eq!(f.autosave.status(), SaveStatus::Saving);

    f.autosave.teardown();
    f.autosave.update_field("title", "ignored".into());
    sleep(ms(2_000)).await;

    assert!(f.autosave.is_torn_down());
    assert_eq!(f.backend.call_count(), 1);
    assert_eq!(f.autosave.version(), 1);
    assert_eq!(f.autosave.field("title"), Some(FieldValue::text("a")));
    assert_eq!(f.observer.count(|e| matches!(e, ObservedEvent::Saved(_))), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn teardown_cancels_pending_flush() -> TestResult {
    let f = fixture(ScriptedBackend::new(1), fast())?;
    f.autosave.update_field("title", "a".into());
    f.autosave.teardown();
    sleep(ms(500)).await;
    assert_eq!(f.backend.call_count(), 0);
    Ok(())
}

// ============================================================================
// Retry and conflicts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn network_failures_back_off_exponentially_then_stop() -> TestResult {
    let f = fixture(ScriptedBackend::new(1), fast())?;
    f.backend.fail_times(4, SaveError::Network("offline gateway".into()));

    f.autosave.update_field("title", "a".into());
    sleep(ms(150)).await;
    let retry = f.autosave.pending_retry().ok_or("retry not scheduled")?;
    assert_eq!((retry.attempt, retry.delay), (1, Duration::from_secs(2)));
    assert_eq!(f.autosave.status(), SaveStatus::Error);

    sleep(Duration::from_secs(20)).await;
    let calls = f.backend.calls();
    assert_eq!(calls.len(), 4);
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].at - w[0].at).collect();
    assert_eq!(
        gaps,
        [Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)]
    );
    assert_eq!(
        f.observer.retries(),
        [
            (1, Duration::from_secs(2)),
            (2, Duration::from_secs(4)),
            (3, Duration::from_secs(8)),
        ]
    );
    assert_eq!(f.observer.count(|e| matches!(e, ObservedEvent::Failed(_))), 1);
    assert_eq!(f.autosave.status(), SaveStatus::Error);
    assert!(f.autosave.pending_retry().is_none());
    assert!(f.autosave.last_error().is_some());
    assert!(f.autosave.is_dirty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retry_recovers_after_transient_failure() -> TestResult {
    let f = fixture(ScriptedBackend::new(1), fast())?;
    f.backend.fail_next(SaveError::Network("timeout".into()));

    f.autosave.update_field("title", "a".into());
    sleep(Duration::from_secs(3)).await;

    assert_eq!(f.backend.call_count(), 2);
    assert_eq!(f.autosave.status(), SaveStatus::Saved);
    assert_eq!(f.autosave.last_error(), None);
    assert_eq!(f.observer.count(|e| matches!(e, ObservedEvent::Saved(2))), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn new_edit_restores_the_retry_budget() -> TestResult {
    let f = fixture(ScriptedBackend::new(1), fast())?;
    f.backend.fail_times(3, SaveError::Network("timeout".into()));

    f.autosave.update_field("title", "a".into());
    sleep(ms(150)).await;
    f.autosave.update_field("title", "ab".into());
    sleep(Duration::from_secs(10)).await;

    assert_eq!(
        f.observer.retries(),
        [
            (1, Duration::from_secs(2)),
            (1, Duration::from_secs(2)),
            (2, Duration::from_secs(4)),
        ]
    );
    assert_eq!(f.backend.call_count(), 4);
    assert_eq!(f.autosave.status(), SaveStatus::Saved);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn version_conflict_is_not_retried() -> TestResult {
    let f = fixture(ScriptedBackend::new(1), fast())?;
    f.backend
        .fail_next(SaveError::Rejected("409: Version conflict on card".into()));

    f.autosave.update_field("title", "mine".into());
    sleep(Duration::from_secs(30)).await;

    assert_eq!(f.backend.call_count(), 1);
    assert_eq!(f.autosave.status(), SaveStatus::Error);
    assert!(f.observer.retries().is_empty());
    assert_eq!(f.observer.count(|e| matches!(e, ObservedEvent::Conflict(_))), 1);

    f.autosave
        .replace_draft(fields([("title", "theirs".into())]), 7);
    assert_eq!(f.autosave.status(), SaveStatus::Idle);
    assert_eq!(f.autosave.version(), 7);
    assert!(!f.autosave.is_dirty());

    f.autosave.update_field("title", "merged".into());
    sleep(ms(150)).await;
    assert_eq!(f.backend.updates()[1].version, Some(7));
    Ok(())
}

// ============================================================================
// Offline queue
// ============================================================================

#[tokio::test(start_paused = true)]
async fn offline_edits_queue_and_drain_per_entry() -> TestResult {
    let f = fixture(ScriptedBackend::new(1), fast())?;
    f.autosave.set_online(false).await;

    f.autosave.update_field("title", "plane".into());
    sleep(ms(200)).await;
    f.autosave.update_field("summary", "train".into());
    sleep(ms(200)).await;

    assert_eq!(f.backend.call_count(), 0);
    assert_eq!(f.autosave.offline_queue().len(), 2);
    assert_eq!(f.autosave.status(), SaveStatus::Offline);
    assert!(!f.autosave.is_dirty());

    f.backend.succeed_next();
    f.backend.fail_next(SaveError::Network("still flaky".into()));
    f.autosave.set_online(true).await;

    let updates = f.backend.updates();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].fields, fields([("title", "plane".into())]));
    assert_eq!(updates[1].fields, fields([("summary", "train".into())]));
    let remaining = f.autosave.offline_queue();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].fields, fields([("summary", "train".into())]));
    assert_eq!(f.autosave.status(), SaveStatus::Error);

    f.autosave.set_online(false).await;
    assert_eq!(f.autosave.status(), SaveStatus::Offline);
    f.autosave.set_online(true).await;

    assert_eq!(f.backend.call_count(), 3);
    assert!(f.autosave.offline_queue().is_empty());
    assert_eq!(f.autosave.status(), SaveStatus::Saved);
    assert_eq!(f.autosave.version(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn edit_during_drain_lands_after_queued_values() -> TestResult {
    let f = fixture(ScriptedBackend::new(1), fast())?;
    f.autosave.set_online(false).await;
    f.autosave.update_field("summary", "x".into());
    sleep(ms(200)).await;
    f.autosave.update_field("title", "a".into());
    sleep(ms(200)).await;
    assert_eq!(f.autosave.offline_queue().len(), 2);

    f.backend.delay_next(ms(500));
    let reconnect = tokio::spawn({
        let autosave = f.autosave.clone();
        async move { autosave.set_online(true).await }
    });
    sleep(ms(100)).await;
    f.autosave.update_field("title", "b".into());
    sleep(ms(150)).await;
    assert_eq!(f.backend.call_count(), 1);
    assert_eq!(f.autosave.status(), SaveStatus::Dirty);

    reconnect.await?;
    sleep(ms(200)).await;

    let updates = f.backend.updates();
    let titles: Vec<_> = updates
        .iter()
        .filter_map(|update| update.fields.get("title").cloned())
        .collect();
    assert_eq!(titles, [FieldValue::text("a"), FieldValue::text("b")]);
    assert_eq!(updates.len(), 3);
    assert!(f.autosave.offline_queue().is_empty());
    assert!(!f.autosave.is_dirty());
    assert_eq!(f.autosave.status(), SaveStatus::Saved);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn offline_without_queueing_attempts_the_save() -> TestResult {
    let config = AutosaveConfig {
        queue_offline: false,
        ..fast()
    };
    let f = fixture(ScriptedBackend::new(1), config)?;
    f.autosave.set_online(false).await;

    f.autosave.update_field("title", "direct".into());
    sleep(ms(150)).await;

    assert_eq!(f.backend.call_count(), 1);
    assert!(f.autosave.offline_queue().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connectivity_signal_drives_the_controller() -> TestResult {
    let f = fixture(ScriptedBackend::new(1), fast())?;
    let signal = Connectivity::new(true);
    f.autosave.attach_connectivity(signal.subscribe());

    signal.set_online(false);
    sleep(ms(1)).await;
    assert!(!f.autosave.is_online());

    f.autosave.update_field("title", "tunnel".into());
    sleep(ms(200)).await;
    assert_eq!(f.autosave.status(), SaveStatus::Offline);

    signal.set_online(true);
    sleep(ms(10)).await;
    assert_eq!(f.backend.call_count(), 1);
    assert!(f.autosave.offline_queue().is_empty());
    assert_eq!(f.autosave.status(), SaveStatus::Saved);

    f.autosave.teardown();
    signal.set_online(false);
    sleep(ms(10)).await;
    assert!(f.autosave.is_online());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn durable_queue_survives_a_restart() -> TestResult {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let config = fast();
    let key = config.offline_queue_key.clone();

    let backend = Arc::new(ScriptedBackend::new(1));
    let first = AutosaveController::builder(backend.clone())
        .config(config.clone())
        .queue_store(store.clone())
        .build(fields([("title", "".into())]), 1)?;
    first.set_online(false).await;
    first.update_field("title", "saved offline".into());
    sleep(ms(150)).await;
    first.teardown();
    drop(first);

    let stored: Option<Vec<QueuedUpdate>> = get_decoded(store.as_ref(), &key)?;
    assert_eq!(stored.map(|q| q.len()), Some(1));

    let second = AutosaveController::builder(backend.clone())
        .config(config)
        .queue_store(store.clone())
        .build(fields([("title", "".into())]), 1)?;
    assert_eq!(second.offline_queue().len(), 1);
    assert_eq!(second.drain_offline_queue().await, 1);

    assert_eq!(backend.updates()[0].fields, fields([("title", "saved offline".into())]));
    let stored: Option<Vec<QueuedUpdate>> = get_decoded(store.as_ref(), &key)?;
    assert_eq!(stored.map(|q| q.len()), Some(0));
    assert!(store.get(&key)?.is_some());
    Ok(())
}
