pub mod db;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{EmailRecord, FetchedEmail, FolderState, MailboxStatus, ThreadSummary, UpsertOutcome};

pub use db::{default_data_dir, Database};

pub const ARCHIVE_REASON_PURGED: &str = "server_purged";
pub const ARCHIVE_REASON_UIDVALIDITY: &str = "uidvalidity_changed";

/// Local persistence used by the sync engine. Rows are never physically dropped: deletion
/// is a flag, and retirement moves rows into the archive table.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn ensure_folder(&self, account_id: &str, name: &str) -> Result<FolderState>;

    async fn get_folder(&self, account_id: &str, name: &str) -> Result<Option<FolderState>>;

    async fn list_folders(&self, account_id: &str) -> Result<Vec<FolderState>>;

    async fn update_folder_status(
        &self,
        folder_id: i64,
        status: &MailboxStatus,
        synced_at: Option<i64>,
    ) -> Result<()>;

    /// High-water mark for the folder's current epoch, 0 when nothing was ever stored.
    /// Retiring rows does not lower it.
    async fn latest_uid(&self, folder_id: i64) -> Result<u32>;

    /// Writes one fetched batch in a single transaction, keyed by (account, folder, uid).
    /// Never clears `is_deleted` and never overwrites an existing thread id.
    async fn upsert_emails(
        &self,
        account_id: &str,
        folder_id: i64,
        emails: &[FetchedEmail],
    ) -> Result<UpsertOutcome>;

    /// UIDs of rows in the folder that are not soft-deleted.
    async fn live_uids(&self, folder_id: i64) -> Result<Vec<u32>>;

    async fn mark_deleted_by_uids(&self, folder_id: i64, uids: &[u32]) -> Result<usize>;

    async fn mark_deleted_by_ids(&self, ids: &[i64]) -> Result<usize>;

    /// Returns false when the row already had a thread id.
    async fn set_thread_id(&self, email_id: i64, thread_id: &str) -> Result<bool>;

    /// Live rows with a message id and no thread id yet.
    async fn emails_missing_thread(&self, account_id: &str) -> Result<Vec<EmailRecord>>;

    async fn emails_by_ids(&self, ids: &[i64]) -> Result<Vec<EmailRecord>>;

    /// Thread id already assigned to a live row with this message id, compared
    /// case-insensitively.
    async fn thread_for_message_id(&self, account_id: &str, message_id: &str) -> Result<Option<String>>;

    async fn email_by_uid(&self, folder_id: i64, uid: u32) -> Result<Option<EmailRecord>>;

    async fn set_archived(&self, folder_id: i64, uid: u32) -> Result<bool>;

    /// Moves every row of the folder into the archive table and resets its high-water mark.
    async fn archive_folder_rows(&self, folder_id: i64, reason: &str) -> Result<usize>;

    /// Moves soft-deleted rows last touched before `cutoff_ts` into the archive table.
    async fn archive_deleted_before(
        &self,
        account_id: &str,
        cutoff_ts: i64,
        reason: &str,
    ) -> Result<usize>;

    async fn thread_summaries(&self, account_id: &str, limit: usize) -> Result<Vec<ThreadSummary>>;
}
