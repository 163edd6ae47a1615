mod common;

use common::{email, harness, harness_with, test_config, FakeThreadApi, ACCOUNT_ID};
use mailkeeper::errors::SyncError;
use mailkeeper::storage::LocalStore;
use mailkeeper::threads::BackfillProgress;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Syncs INBOX holding the given message ids, one UID each starting at 1. The essential
/// sync resolves threads before returning, so callers mark ids as failing beforehand
/// when the rows must stay unthreaded.
async fn seeded(ids: &[&str], api: &FakeThreadApi) -> common::Harness {
    let h = harness_with(test_config(), Some(api.clone())).await;
    h.server.add_folder("INBOX", 1);
    for (i, id) in ids.iter().enumerate() {
        h.server.put("INBOX", email(i as u32 + 1, id));
    }
    h.engine.sync_essential_folders().await.unwrap();
    h
}

#[tokio::test]
async fn backfill_resolves_from_listing_then_lookup_and_deletes_unknown() {
    let api = FakeThreadApi::new();
    for id in ["a@x", "b@x", "c@x"] {
        api.fail(id);
    }
    let h = seeded(&["a@x", "b@x", "c@x"], &api).await;
    api.state.lock().unwrap().failing.clear();

    api.add_page(&[("a@x", "thread-1"), ("zzz@x", "thread-9")]);
    api.add_page(&[]);
    api.knows("b@x", "thread-2");
    let lookups_before = api.lookups();

    let mut events = Vec::new();
    let report = h
        .engine
        .sync_thread_ids(|p| events.push(p), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.resolved, 2);
    assert_eq!(report.not_found, 1);
    assert_eq!(report.failed, 0);
    assert!(!report.cancelled);
    // a@x came from the listing; only b@x and c@x needed a lookup.
    assert_eq!(api.lookups() - lookups_before, 2);
    assert_eq!(api.lists(), 2);

    assert_eq!(events[0], BackfillProgress::Listing { page: 1, found: 2 });
    assert_eq!(events[1], BackfillProgress::Listing { page: 2, found: 2 });
    assert_eq!(events.last(), Some(&BackfillProgress::Fetching { processed: 3, total: 3 }));

    let folder = h.db.get_folder(ACCOUNT_ID, "INBOX").await.unwrap().unwrap();
    let a = h.db.email_by_uid(folder.id, 1).await.unwrap().unwrap();
    let b = h.db.email_by_uid(folder.id, 2).await.unwrap().unwrap();
    let c = h.db.email_by_uid(folder.id, 3).await.unwrap().unwrap();
    assert_eq!(a.thread_id.as_deref(), Some("thread-1"));
    assert_eq!(b.thread_id.as_deref(), Some("thread-2"));
    assert!(c.is_deleted);
    assert_eq!(report.not_found_ids, vec![c.id]);
}

#[tokio::test]
async fn thread_id_is_never_overwritten() {
    let api = FakeThreadApi::new();
    api.knows("a@x", "first");
    let h = seeded(&["a@x"], &api).await;

    let folder = h.db.get_folder(ACCOUNT_ID, "INBOX").await.unwrap().unwrap();
    let row = h.db.email_by_uid(folder.id, 1).await.unwrap().unwrap();
    assert_eq!(row.thread_id.as_deref(), Some("first"));

    api.knows("a@x", "second");
    api.add_page(&[("a@x", "second")]);
    let report = h
        .engine
        .sync_thread_ids(|_| {}, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.resolved, 0);

    let row = h.db.email_by_uid(folder.id, 1).await.unwrap().unwrap();
    assert_eq!(row.thread_id.as_deref(), Some("first"));
}

#[tokio::test]
async fn failed_lookups_leave_rows_for_the_next_pass() {
    let api = FakeThreadApi::new();
    api.fail("a@x");
    let h = seeded(&["a@x"], &api).await;

    let report = h
        .engine
        .sync_thread_ids(|_| {}, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.not_found, 0);

    let folder = h.db.get_folder(ACCOUNT_ID, "INBOX").await.unwrap().unwrap();
    let row = h.db.email_by_uid(folder.id, 1).await.unwrap().unwrap();
    assert!(!row.is_deleted);
    assert!(row.thread_id.is_none());
    assert_eq!(h.db.emails_missing_thread(ACCOUNT_ID).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancellation_interrupts_an_in_flight_lookup() {
    let api = FakeThreadApi::new();
    api.fail("a@x");
    api.fail("b@x");
    let h = seeded(&["a@x", "b@x"], &api).await;
    api.hang();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(2),
        h.engine.sync_thread_ids(|_| {}, &cancel),
    )
    .await
    .expect("backfill should stop promptly after cancel")
    .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.resolved, 0);
    assert_eq!(report.not_found, 0);
}

#[tokio::test]
async fn cancellation_keeps_writes_committed_before_it() {
    let api = FakeThreadApi::new();
    api.fail("quick@x");
    api.fail("slow@x");
    let h = harness_with(test_config(), Some(api.clone())).await;
    h.server.add_folder("INBOX", 1);
    // Candidates are walked newest first, so the resolvable message goes first.
    let quick = email(1, "quick@x");
    let mut slow = email(2, "slow@x");
    slow.date = quick.date.map(|d| d - 3600);
    h.server.put("INBOX", quick);
    h.server.put("INBOX", slow);
    h.engine.sync_essential_folders().await.unwrap();

    api.state.lock().unwrap().failing.clear();
    api.knows("quick@x", "t-quick");
    api.hang_on("slow@x");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(2),
        h.engine.sync_thread_ids(|_| {}, &cancel),
    )
    .await
    .expect("backfill should stop promptly after cancel")
    .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.resolved, 1);
    assert_eq!(report.not_found, 0);

    let folder = h.db.get_folder(ACCOUNT_ID, "INBOX").await.unwrap().unwrap();
    let quick = h.db.email_by_uid(folder.id, 1).await.unwrap().unwrap();
    let slow = h.db.email_by_uid(folder.id, 2).await.unwrap().unwrap();
    assert_eq!(quick.thread_id.as_deref(), Some("t-quick"));
    assert!(slow.thread_id.is_none());
    assert!(!slow.is_deleted);
    assert_eq!(h.db.emails_missing_thread(ACCOUNT_ID).await.unwrap().len(), 1);
}

#[tokio::test]
async fn already_cancelled_token_makes_no_requests() {
    let api = FakeThreadApi::new();
    api.fail("a@x");
    let h = seeded(&["a@x"], &api).await;
    let lookups_before = api.lookups();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = h.engine.sync_thread_ids(|_| {}, &cancel).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(api.lists(), 0);
    assert_eq!(api.lookups(), lookups_before);
}

#[tokio::test]
async fn backfill_without_api_is_unavailable() {
    let h = harness(test_config()).await;
    let err = h
        .engine
        .sync_thread_ids(|_| {}, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ThreadApiUnavailable));
}
