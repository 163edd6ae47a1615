mod common;

use common::{email, harness, test_config, ACCOUNT_ID};
use mailkeeper::config::SyncConfig;
use mailkeeper::errors::SyncError;
use mailkeeper::storage::LocalStore;

async fn seeded(config: SyncConfig, uids: std::ops::RangeInclusive<u32>) -> common::Harness {
    let h = harness(config).await;
    h.server.add_folder("INBOX", 1);
    for uid in uids {
        h.server.put("INBOX", email(uid, &format!("m{}@x", uid)));
    }
    h.engine.sync_folder("INBOX").await.unwrap();
    h.server.clear_calls();
    h
}

#[tokio::test]
async fn full_purge_soft_deletes_exactly_the_missing_uids() {
    let h = seeded(test_config(), 1..=5).await;
    h.server.remove("INBOX", 2);
    h.server.remove("INBOX", 4);

    let deleted = h.engine.purge_deleted("INBOX").await.unwrap();
    assert_eq!(deleted, 2);

    let folder = h.db.get_folder(ACCOUNT_ID, "INBOX").await.unwrap().unwrap();
    assert_eq!(h.db.live_uids(folder.id).await.unwrap(), vec![1, 3, 5]);

    // Soft delete: the rows are still there.
    let gone = h.db.email_by_uid(folder.id, 2).await.unwrap().unwrap();
    assert!(gone.is_deleted);
    assert_eq!(gone.subject, "Message 2");
}

#[tokio::test]
async fn deletion_survives_later_syncs() {
    let h = seeded(test_config(), 1..=3).await;
    h.server.remove("INBOX", 2);
    h.engine.purge_deleted("INBOX").await.unwrap();

    h.server.put("INBOX", email(4, "m4@x"));
    let result = h.engine.sync_folder("INBOX").await.unwrap();
    assert_eq!(result.new_emails, 1);
    assert_eq!(result.deleted, 0);

    let folder = h.db.get_folder(ACCOUNT_ID, "INBOX").await.unwrap().unwrap();
    assert!(h.db.email_by_uid(folder.id, 2).await.unwrap().unwrap().is_deleted);
    assert_eq!(h.db.live_uids(folder.id).await.unwrap(), vec![1, 3, 4]);
}

#[tokio::test]
async fn oversized_folder_skips_with_no_server_calls() {
    let config = SyncConfig {
        purge_max_folder_size: 3,
        ..test_config()
    };
    let h = seeded(config, 1..=5).await;
    h.server.remove("INBOX", 1);

    assert_eq!(h.engine.purge_deleted("INBOX").await.unwrap(), 0);
    assert!(h.server.calls().is_empty());
}

#[tokio::test]
async fn disabled_purge_is_a_no_op() {
    let config = SyncConfig {
        purge_enabled: false,
        ..test_config()
    };
    let h = seeded(config, 1..=2).await;
    h.server.remove("INBOX", 1);

    assert_eq!(h.engine.purge_deleted("INBOX").await.unwrap(), 0);
    assert!(h.server.calls().is_empty());
}

#[tokio::test]
async fn empty_server_listing_deletes_nothing() {
    let h = seeded(test_config(), 1..=3).await;
    for uid in 1..=3 {
        h.server.remove("INBOX", uid);
    }

    assert_eq!(h.engine.purge_deleted("INBOX").await.unwrap(), 0);
    let folder = h.db.get_folder(ACCOUNT_ID, "INBOX").await.unwrap().unwrap();
    assert_eq!(h.db.live_uids(folder.id).await.unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn targeted_purge_checks_only_the_given_uids() {
    let config = SyncConfig {
        purge_max_folder_size: 1,
        ..test_config()
    };
    let h = seeded(config, 1..=5).await;
    h.server.remove("INBOX", 2);
    h.server.remove("INBOX", 5);

    let absent = h.engine.purge_specific_uids("INBOX", &[3, 2, 1]).await.unwrap();
    assert_eq!(absent, vec![2]);
    assert_eq!(h.server.calls(), vec!["SEARCH INBOX UID 1:3".to_string()]);

    // UID 5 was not asked about, so it stays live.
    let folder = h.db.get_folder(ACCOUNT_ID, "INBOX").await.unwrap().unwrap();
    assert_eq!(h.db.live_uids(folder.id).await.unwrap(), vec![1, 3, 4, 5]);
}

#[tokio::test]
async fn purge_of_unknown_folder_is_rejected() {
    let h = harness(test_config()).await;
    let err = h.engine.purge_deleted("Nowhere").await.unwrap_err();
    assert!(matches!(err, SyncError::NoSuchFolder(ref f) if f == "Nowhere"));
}

#[tokio::test]
async fn retire_moves_old_deleted_rows_to_archive() {
    let h = seeded(test_config(), 1..=3).await;
    h.server.remove("INBOX", 3);
    h.engine.purge_deleted("INBOX").await.unwrap();

    // Deleted just now, so a 30 day cutoff keeps it.
    assert_eq!(h.engine.archive_retired(30).await.unwrap(), 0);
    assert_eq!(h.db.archived_count(ACCOUNT_ID).await.unwrap(), 0);

    // Cutoff of zero days retires it only once time has moved past the deletion second.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    assert_eq!(h.engine.archive_retired(0).await.unwrap(), 1);
    assert_eq!(h.db.archived_count(ACCOUNT_ID).await.unwrap(), 1);

    let folder = h.db.get_folder(ACCOUNT_ID, "INBOX").await.unwrap().unwrap();
    assert!(h.db.email_by_uid(folder.id, 3).await.unwrap().is_none());
    assert_eq!(h.db.live_uids(folder.id).await.unwrap(), vec![1, 2]);
}
