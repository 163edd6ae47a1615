use std::time::Instant;
use tracing::{debug, warn};

use crate::errors::{SyncError, SyncOutcome};
use crate::imap::SessionHandle;
use crate::storage::LocalStore;
use crate::types::FolderState;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub created: usize,
    pub updated: usize,
    pub new_email_ids: Vec<i64>,
    /// Highest UID written by this run, 0 when nothing was written.
    pub latest_uid: u32,
}

/// Fetches `uids` in chunks of `batch_size`, one UID FETCH per chunk, and writes each
/// chunk in its own transaction. The session lock is released between chunks.
///
/// Any failed FETCH or write aborts the call. `uids` must be ascending: chunks committed
/// before the failure only ever raise the folder's high-water mark to below the failed
/// chunk, so the next sync asks for it again.
pub async fn fetch_and_store(
    session: &SessionHandle,
    store: &dyn LocalStore,
    folder: &FolderState,
    uids: &[u32],
    batch_size: usize,
) -> SyncOutcome<FetchOutcome> {
    let mut outcome = FetchOutcome::default();

    for chunk in uids.chunks(batch_size.max(1)) {
        let batch_start = Instant::now();

        let fetched = {
            let mut client = session.lock().await;
            client.fetch(&folder.name, chunk).await
        };
        let first_uid = chunk.first().copied().unwrap_or(0);
        let emails = match fetched {
            Ok(emails) => emails,
            Err(e) => {
                warn!(
                    account = %folder.account_id,
                    folder = %folder.name,
                    first_uid,
                    count = chunk.len(),
                    stored = outcome.created + outcome.updated,
                    error = %e,
                    "Batch fetch failed, aborting sync"
                );
                let err = e.context(format!(
                    "fetching {} uid(s) from {} starting at {}",
                    chunk.len(),
                    folder.name,
                    first_uid
                ));
                return Err(SyncError::remote(err));
            }
        };

        let written = store
            .upsert_emails(&folder.account_id, folder.id, &emails)
            .await
            .map_err(SyncError::store)?;

        outcome.created += written.created;
        outcome.updated += written.updated;
        outcome.new_email_ids.extend(written.new_email_ids);
        if let Some(max) = emails.iter().map(|e| e.uid).max() {
            outcome.latest_uid = outcome.latest_uid.max(max);
        }

        debug!(
            account = %folder.account_id,
            folder = %folder.name,
            requested = chunk.len(),
            received = emails.len(),
            created = written.created,
            elapsed_ms = ?batch_start.elapsed().as_millis(),
            "Stored fetch batch"
        );
    }

    Ok(outcome)
}
