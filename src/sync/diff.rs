use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::debug;

use crate::config::SyncConfig;
use crate::imap::{MailboxClient, SearchCriteria};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchMode {
    Initial,
    Incremental,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchPlan {
    pub mode: FetchMode,
    /// Ascending.
    pub uids: Vec<u32>,
}

/// Decides which UIDs to fetch. With a stored high-water mark only UIDs above it are
/// considered; otherwise a date-bounded window seeds the folder.
pub async fn plan_fetch(
    client: &mut dyn MailboxClient,
    folder: &str,
    last_uid: u32,
    config: &SyncConfig,
) -> Result<FetchPlan> {
    let (mode, criteria, limit) = if last_uid > 0 {
        (
            FetchMode::Incremental,
            SearchCriteria::UidsAfter(last_uid),
            config.incremental_batch_size,
        )
    } else {
        let since = (Utc::now() - Duration::days(config.initial_sync_days as i64)).date_naive();
        (FetchMode::Initial, SearchCriteria::Since(since), config.initial_max_per_folder)
    };

    let found = client.search(folder, &criteria).await?;
    let uids = select_window(found, last_uid, limit);

    debug!(folder = %folder, mode = ?mode, last_uid, selected = uids.len(), "Planned fetch");
    Ok(FetchPlan { mode, uids })
}

/// Keeps UIDs strictly above `floor`, sorted ascending, trimmed to the newest `limit`.
/// `UID n:*` answers with the highest existing UID even when it is below `n`, so the
/// floor filter is not redundant.
pub fn select_window(mut uids: Vec<u32>, floor: u32, limit: usize) -> Vec<u32> {
    uids.retain(|uid| *uid > floor);
    uids.sort_unstable();
    uids.dedup();
    if uids.len() > limit {
        let excess = uids.len() - limit;
        uids.drain(..excess);
    }
    uids
}
