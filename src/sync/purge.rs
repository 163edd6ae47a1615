use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::errors::{SyncError, SyncOutcome};
use crate::imap::{SearchCriteria, SessionHandle};
use crate::storage::LocalStore;
use crate::types::FolderState;

/// Soft-deletes local rows whose UID the server no longer lists. Skipped without any
/// server command when purging is disabled or the folder holds more live rows than
/// `purge_max_folder_size`.
pub async fn purge_folder(
    session: &SessionHandle,
    store: &dyn LocalStore,
    config: &SyncConfig,
    folder: &FolderState,
) -> SyncOutcome<usize> {
    if !config.purge_enabled {
        return Ok(0);
    }

    let started = Instant::now();
    let local = store.live_uids(folder.id).await.map_err(SyncError::store)?;
    if local.is_empty() {
        return Ok(0);
    }
    if local.len() > config.purge_max_folder_size {
        info!(
            account = %folder.account_id,
            folder = %folder.name,
            local = local.len(),
            ceiling = config.purge_max_folder_size,
            "Folder too large for full purge, skipping"
        );
        return Ok(0);
    }

    let server = {
        let mut client = session.lock().await;
        client.all_uids(&folder.name).await.map_err(SyncError::remote)?
    };

    // An empty listing almost always means a failed or truncated search.
    if server.is_empty() {
        warn!(
            account = %folder.account_id,
            folder = %folder.name,
            local = local.len(),
            "Server returned no UIDs, refusing to purge"
        );
        return Ok(0);
    }

    let server: HashSet<u32> = server.into_iter().collect();
    let missing: Vec<u32> = local.into_iter().filter(|uid| !server.contains(uid)).collect();
    let deleted = store
        .mark_deleted_by_uids(folder.id, &missing)
        .await
        .map_err(SyncError::store)?;

    info!(
        account = %folder.account_id,
        folder = %folder.name,
        server = server.len(),
        deleted,
        elapsed_ms = ?started.elapsed().as_millis(),
        "Full purge finished"
    );
    Ok(deleted)
}

/// Checks only `uids` against the server and soft-deletes the ones it no longer has.
/// Returns the absent UIDs.
pub async fn purge_uids(
    session: &SessionHandle,
    store: &dyn LocalStore,
    folder: &FolderState,
    uids: &[u32],
) -> SyncOutcome<Vec<u32>> {
    let mut wanted: Vec<u32> = uids.to_vec();
    wanted.sort_unstable();
    wanted.dedup();
    if wanted.is_empty() {
        return Ok(Vec::new());
    }

    let present = {
        let mut client = session.lock().await;
        client
            .search(&folder.name, &SearchCriteria::Uids(wanted.clone()))
            .await
            .map_err(SyncError::remote)?
    };
    let present: HashSet<u32> = present.into_iter().collect();

    let absent: Vec<u32> = wanted.into_iter().filter(|uid| !present.contains(uid)).collect();
    let deleted = store
        .mark_deleted_by_uids(folder.id, &absent)
        .await
        .map_err(SyncError::store)?;

    debug!(
        account = %folder.account_id,
        folder = %folder.name,
        checked = uids.len(),
        absent = absent.len(),
        deleted,
        "Targeted purge finished"
    );
    Ok(absent)
}
