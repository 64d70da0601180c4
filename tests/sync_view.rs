use agency_sync::{
    ListQuery, MemoryBackend, PendingState, RawChangeEvent, Record, Scope, ScopeState, SyncError, SyncSettings,
    SyncedView, Table, TaskRecord, TaskStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn seeded_backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend
        .seed(
            Table::Tasks,
            vec![
                json!({
                    "id": "t1",
                    "title": "Kickoff call",
                    "client_id": "c1",
                    "status": "progress",
                    "updated_at": "2024-01-02T00:00:00Z"
                }),
                json!({
                    "id": "t2",
                    "title": "Logo concepts",
                    "client_id": "c2",
                    "status": "todo",
                    "updated_at": "2024-01-01T00:00:00Z"
                }),
            ],
        )
        .expect("seed");
    backend
}

fn view_with(backend: &MemoryBackend, overrides: serde_json::Value) -> SyncedView<TaskRecord> {
    let settings = SyncSettings::default().apply_overrides(overrides).expect("settings");
    SyncedView::new(Arc::new(backend.clone()), settings).expect("view")
}

fn draft(title: &str, client_id: &str) -> TaskRecord {
    agency_sync::models::parse_record(&json!({
        "id": "draft",
        "title": title,
        "client_id": client_id,
        "status": "todo"
    }))
    .expect("draft")
}

async fn wait_for<R, F>(view: &SyncedView<R>, condition: F) -> Vec<R>
where
    R: Record,
    F: Fn(&[R]) -> bool,
{
    let mut revisions = view.watch_revisions();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let records = view.get_collection().await;
            if condition(&records) {
                return records;
            }
            if revisions.changed().await.is_err() {
                return records;
            }
        }
    })
    .await
    .expect("view reached expected state")
}

#[tokio::test]
async fn attach_requires_resolved_scope() {
    let backend = seeded_backend();
    let view = view_with(&backend, json!({}));

    let result = view.attach(ScopeState::Unresolved).await;
    assert!(matches!(result, Err(SyncError::ScopeUnresolved(_))));
    assert!(!view.is_attached().await);
    assert_eq!(backend.subscriber_count(Table::Tasks).expect("count"), 0);
}

#[tokio::test]
async fn remote_inserts_and_deletes_reach_the_view() {
    let backend = seeded_backend();
    let view = view_with(&backend, json!({}));
    view.attach(Scope::admin()).await.expect("attach");
    assert_eq!(view.get_collection().await.len(), 2);

    backend
        .remote_upsert(
            Table::Tasks,
            json!({ "id": "t3", "title": "Added by teammate", "client_id": "c1", "updated_at": "2024-01-05T00:00:00Z" }),
        )
        .expect("remote insert");
    let records = wait_for(&view, |records| records.len() == 3).await;
    assert_eq!(records[0].id, "t3");

    backend.remote_delete(Table::Tasks, "t2").expect("remote delete");
    wait_for(&view, |records| records.iter().all(|task| task.id != "t2")).await;

    view.detach().await;
}

#[tokio::test]
async fn record_reassigned_to_another_client_disappears_for_member() {
    let backend = seeded_backend();
    let view = view_with(&backend, json!({}));
    view.attach(Scope::client("c1")).await.expect("attach");

    let ids = view
        .get_collection()
        .await
        .into_iter()
        .map(|task| task.id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["t1"]);

    backend
        .emit(
            Table::Tasks,
            RawChangeEvent::Updated(json!({
                "id": "t1",
                "title": "Kickoff call",
                "client_id": "c2",
                "status": "progress"
            })),
        )
        .expect("emit");
    wait_for(&view, |records| records.is_empty()).await;

    view.detach().await;
}

#[tokio::test]
async fn malformed_events_do_not_stop_the_feed() {
    let backend = seeded_backend();
    let view = view_with(&backend, json!({}));
    view.attach(Scope::admin()).await.expect("attach");

    backend
        .emit(Table::Tasks, RawChangeEvent::Inserted(json!({ "title": "no key" })))
        .expect("emit malformed");
    backend
        .emit(Table::Tasks, RawChangeEvent::Deleted(json!({})))
        .expect("emit malformed delete");
    backend
        .emit(
            Table::Tasks,
            RawChangeEvent::Inserted(json!({ "id": "t9", "title": "Valid" })),
        )
        .expect("emit valid");

    let records = wait_for(&view, |records| records.iter().any(|task| task.id == "t9")).await;
    assert_eq!(records.len(), 3);

    view.detach().await;
}

#[tokio::test]
async fn create_success_swaps_provisional_key_for_assigned_key() {
    let backend = seeded_backend();
    let view = view_with(&backend, json!({}));
    view.attach(Scope::admin()).await.expect("attach");

    let ticket = view
        .create_optimistic(draft("Moodboard", "c1"))
        .await
        .expect("create");
    let provisional = ticket.mutation.key.clone();
    assert!(provisional.starts_with("local-"));
    assert!(view.get(&provisional).await.is_some());

    let stored = ticket.settled().await.expect("create settled").expect("visible record");
    assert_ne!(stored.id, provisional);
    assert!(stored.created_at.timestamp() > 0);
    assert!(view.get(&provisional).await.is_none());
    assert_eq!(view.get(&stored.id).await.map(|task| task.title), Some("Moodboard".to_string()));
    assert!(backend.row(Table::Tasks, &stored.id).expect("row").is_some());
    assert_eq!(view.pending_count().await, 0);

    view.detach().await;
}

#[tokio::test]
async fn create_failure_removes_provisional_record() {
    let backend = seeded_backend();
    backend.fail_next_writes(1).expect("configure");
    let view = view_with(&backend, json!({}));
    view.attach(Scope::admin()).await.expect("attach");
    let before = view.get_collection().await;

    let ticket = view
        .create_optimistic(draft("Will fail", "c1"))
        .await
        .expect("create");
    let result = ticket.settled().await;
    assert!(matches!(result, Err(SyncError::Transport(_))));
    assert_eq!(view.get_collection().await, before);

    view.detach().await;
}

#[tokio::test]
async fn update_failure_restores_prior_value() {
    let backend = seeded_backend();
    let view = view_with(&backend, json!({}));
    view.attach(Scope::admin()).await.expect("attach");
    let prior = view.get("t1").await.expect("t1");

    backend.fail_next_writes(1).expect("configure");
    let ticket = view
        .update_optimistic("t1", json!({ "status": "done", "title": "Renamed" }))
        .await
        .expect("update");
    assert_eq!(view.get("t1").await.map(|task| task.status), Some(TaskStatus::Done));

    let error = ticket.settled().await.expect_err("update fails");
    assert!(error.is_retryable());
    assert_eq!(view.get("t1").await, Some(prior));
    assert_eq!(view.pending_count().await, 0);

    view.detach().await;
}

#[tokio::test]
async fn second_update_on_pending_key_is_rejected() {
    let backend = seeded_backend();
    backend.set_hang_writes(true).expect("configure");
    let view = view_with(&backend, json!({}));
    view.attach(Scope::admin()).await.expect("attach");

    let _first = view
        .update_optimistic("t1", json!({ "status": "review" }))
        .await
        .expect("first update");
    let after_first = view.get_collection().await;

    let second = view.update_optimistic("t1", json!({ "status": "done" })).await;
    assert!(matches!(second, Err(SyncError::MutationInProgress(key)) if key == "t1"));
    assert_eq!(view.get_collection().await, after_first);

    // Other keys are independent.
    view.update_optimistic("t2", json!({ "status": "progress" }))
        .await
        .expect("update on another key");

    view.detach().await;
}

#[tokio::test]
async fn delete_success_stays_deleted_after_echo() {
    let backend = seeded_backend();
    let view = view_with(&backend, json!({}));
    view.attach(Scope::admin()).await.expect("attach");

    let ticket = view.delete_optimistic("t2").await.expect("delete");
    assert!(view.get("t2").await.is_none());
    assert!(ticket.settled().await.expect("delete settled").is_none());
    assert!(backend.row(Table::Tasks, "t2").expect("row").is_none());
    assert!(view.get("t2").await.is_none());

    view.detach().await;
}

#[tokio::test]
async fn event_during_pending_write_is_authoritative() {
    let backend = seeded_backend();
    backend.set_hang_writes(true).expect("configure");
    let view = view_with(&backend, json!({ "writeTimeoutMs": 750 }));
    view.attach(Scope::admin()).await.expect("attach");

    let ticket = view
        .update_optimistic("t1", json!({ "title": "Local edit" }))
        .await
        .expect("update");

    backend
        .remote_upsert(
            Table::Tasks,
            json!({ "id": "t1", "title": "Edited elsewhere", "client_id": "c1", "status": "review" }),
        )
        .expect("remote update");
    wait_for(&view, |records| {
        records
            .iter()
            .any(|task| task.id == "t1" && task.title == "Edited elsewhere")
    })
    .await;
    assert_eq!(
        view.pending("t1").await.map(|mutation| mutation.state),
        Some(PendingState::Superseded)
    );

    let result = ticket.settled().await;
    assert!(matches!(result, Err(SyncError::OperationTimedOut { .. })));
    assert_eq!(
        view.get("t1").await.map(|task| task.title),
        Some("Edited elsewhere".to_string())
    );

    view.detach().await;
}

#[tokio::test(start_paused = true)]
async fn hanging_fetch_times_out_and_leaves_view_empty() {
    let backend = seeded_backend();
    backend.set_hang_queries(true).expect("configure");
    let view = view_with(&backend, json!({}));

    let started = tokio::time::Instant::now();
    let result = view.attach(Scope::admin()).await;
    assert!(matches!(
        result,
        Err(SyncError::OperationTimedOut { timeout_ms: 5_000, .. })
    ));
    assert!(started.elapsed() >= Duration::from_millis(5_000));
    assert!(view.get_collection().await.is_empty());
    assert!(!view.is_attached().await);
    assert_eq!(backend.subscriber_count(Table::Tasks).expect("count"), 0);
}

#[tokio::test(start_paused = true)]
async fn timed_out_write_rolls_back() {
    let backend = seeded_backend();
    let view = view_with(&backend, json!({}));
    view.attach(Scope::admin()).await.expect("attach");
    let prior = view.get("t2").await.expect("t2");

    backend.set_hang_writes(true).expect("configure");
    let ticket = view.delete_optimistic("t2").await.expect("delete");
    assert!(view.get("t2").await.is_none());

    let result = ticket.settled().await;
    assert!(matches!(
        result,
        Err(SyncError::OperationTimedOut { timeout_ms: 5_000, .. })
    ));
    assert_eq!(view.get("t2").await, Some(prior));

    view.detach().await;
}

#[tokio::test]
async fn detach_releases_feed_and_abandons_writes() {
    let backend = seeded_backend();
    let view = view_with(&backend, json!({}));
    view.attach(Scope::admin()).await.expect("attach");
    assert_eq!(backend.subscriber_count(Table::Tasks).expect("count"), 1);

    backend.set_hang_writes(true).expect("configure");
    let ticket = view
        .update_optimistic("t1", json!({ "status": "done" }))
        .await
        .expect("update");

    view.detach().await;
    assert_eq!(backend.subscriber_count(Table::Tasks).expect("count"), 0);
    assert!(matches!(ticket.settled().await, Err(SyncError::Detached)));
    assert!(view.get_collection().await.is_empty());

    backend
        .remote_upsert(Table::Tasks, json!({ "id": "t5", "title": "After teardown" }))
        .expect("remote insert");
    tokio::task::yield_now().await;
    assert!(view.get_collection().await.is_empty());
    assert!(matches!(
        view.create_optimistic(draft("Too late", "c1")).await,
        Err(SyncError::Detached)
    ));
}

#[tokio::test]
async fn refresh_recovers_missed_changes_and_keeps_pending_work() {
    let backend = seeded_backend();
    let view = view_with(&backend, json!({}));
    view.attach(Scope::admin()).await.expect("attach");

    backend.set_hang_writes(true).expect("configure");
    let pending = view
        .update_optimistic("t1", json!({ "title": "Pending rename" }))
        .await
        .expect("update");

    // Written behind the feed's back, as if the event had been dropped.
    backend
        .seed(
            Table::Tasks,
            vec![json!({ "id": "t7", "title": "Missed while offline", "updated_at": "2024-02-01T00:00:00Z" })],
        )
        .expect("seed");
    assert!(view.get("t7").await.is_none());

    view.refresh().await.expect("refresh");
    assert!(view.get("t7").await.is_some());
    assert_eq!(
        view.get("t1").await.map(|task| task.title),
        Some("Pending rename".to_string())
    );
    assert_eq!(pending.mutation.key, "t1");

    view.detach().await;
}

#[tokio::test]
async fn page_projects_the_live_collection() {
    let backend = seeded_backend();
    let view = view_with(&backend, json!({ "defaultPageSize": 1 }));
    view.attach(Scope::admin()).await.expect("attach");

    let first = view.page(&ListQuery::default()).await;
    assert_eq!(first.total, 2);
    assert_eq!(first.total_pages, 2);
    assert_eq!(first.items[0].id, "t1");

    let todo = view
        .page(&ListQuery {
            statuses: Some(vec!["todo".to_string()]),
            ..ListQuery::default()
        })
        .await;
    assert_eq!(todo.total, 1);
    assert_eq!(todo.items[0].id, "t2");

    view.detach().await;
}

#[test]
fn view_rejects_invalid_settings() {
    let settings = SyncSettings {
        event_buffer: 0,
        ..SyncSettings::default()
    };
    let result = SyncedView::<TaskRecord>::new(Arc::new(MemoryBackend::new()), settings);
    assert!(matches!(result, Err(SyncError::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn changes_during_attach_load_are_applied_after_attach() {
    let backend = seeded_backend();
    backend.set_query_delay(Some(Duration::from_millis(200))).expect("configure");
    let view = view_with(&backend, json!({}));

    let attaching = tokio::spawn({
        let view = view.clone();
        async move { view.attach(Scope::admin()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!view.is_attached().await);
    assert_eq!(backend.subscriber_count(Table::Tasks).expect("count"), 1);

    backend
        .remote_upsert(Table::Tasks, json!({ "id": "t9", "title": "Added during load" }))
        .expect("remote insert");
    backend.remote_delete(Table::Tasks, "t2").expect("remote delete");

    attaching.await.expect("join").expect("attach");
    let records = wait_for(&view, |records| {
        records.iter().any(|task| task.id == "t9") && records.iter().all(|task| task.id != "t2")
    })
    .await;
    assert_eq!(records.len(), 2);

    view.detach().await;
}

#[tokio::test(start_paused = true)]
async fn refresh_keeps_events_that_land_while_it_loads() {
    let backend = seeded_backend();
    let view = view_with(&backend, json!({}));
    view.attach(Scope::admin()).await.expect("attach");
    backend.set_query_delay(Some(Duration::from_millis(200))).expect("configure");

    let refreshing = tokio::spawn({
        let view = view.clone();
        async move { view.refresh().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    backend
        .remote_upsert(Table::Tasks, json!({ "id": "t9", "title": "Added during refresh" }))
        .expect("remote insert");
    backend.remote_delete(Table::Tasks, "t2").expect("remote delete");
    wait_for(&view, |records| {
        records.iter().any(|task| task.id == "t9") && records.iter().all(|task| task.id != "t2")
    })
    .await;

    refreshing.await.expect("join").expect("refresh");
    assert!(view.get("t9").await.is_some());
    assert!(view.get("t2").await.is_none());
    assert!(view.get("t1").await.is_some());

    view.detach().await;
}

#[tokio::test(start_paused = true)]
async fn refresh_keeps_create_acknowledged_while_it_loads() {
    let backend = seeded_backend();
    let view = view_with(&backend, json!({}));
    view.attach(Scope::admin()).await.expect("attach");
    backend.set_echo_writes(false).expect("configure");
    backend.set_write_delay(Some(Duration::from_millis(50))).expect("configure");
    backend.set_query_delay(Some(Duration::from_millis(200))).expect("configure");

    let ticket = view
        .create_optimistic(draft("Moodboard", "c1"))
        .await
        .expect("create");
    let provisional = ticket.mutation.key.clone();
    let refreshing = tokio::spawn({
        let view = view.clone();
        async move { view.refresh().await }
    });

    let stored = ticket.settled().await.expect("create settled").expect("visible record");
    refreshing.await.expect("join").expect("refresh");

    assert_eq!(view.get(&stored.id).await.map(|task| task.title), Some("Moodboard".to_string()));
    assert!(view.get(&provisional).await.is_none());
    assert_eq!(view.get_collection().await.len(), 3);

    view.detach().await;
}

#[tokio::test]
async fn dropping_an_attached_view_releases_its_feed() {
    let backend = seeded_backend();
    let view = view_with(&backend, json!({}));
    view.attach(Scope::admin()).await.expect("attach");
    assert_eq!(backend.subscriber_count(Table::Tasks).expect("count"), 1);

    backend.set_hang_writes(true).expect("configure");
    let ticket = view
        .update_optimistic("t1", json!({ "status": "done" }))
        .await
        .expect("update");

    drop(view);
    assert_eq!(backend.subscriber_count(Table::Tasks).expect("count"), 0);
    assert!(matches!(ticket.settled().await, Err(SyncError::Detached)));
}
