pub mod background;
pub mod diff;
pub mod fetch;
pub mod locks;
pub mod purge;

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::errors::{SyncError, SyncOutcome};
use crate::imap::SessionHandle;
use crate::storage::{LocalStore, ARCHIVE_REASON_PURGED, ARCHIVE_REASON_UIDVALIDITY};
use crate::threads::{
    BackfillProgress, HeaderThreader, ThreadLookup, ThreadReconciler, ThreadSyncReport,
};
use crate::types::{now_ts, Account, FolderState, Provider, SyncResult, ThreadSummary};

use background::BackgroundTasks;
use locks::FolderLocks;

pub use diff::{FetchMode, FetchPlan};
pub use fetch::FetchOutcome;

/// Keeps one account's local store consistent with its server.
pub struct SyncEngine {
    account: Account,
    config: SyncConfig,
    store: Arc<dyn LocalStore>,
    session: SessionHandle,
    threads: Option<Arc<ThreadReconciler>>,
    /// Used only while no thread API is attached.
    header_threads: Option<HeaderThreader>,
    locks: FolderLocks,
    background: BackgroundTasks,
}

impl SyncEngine {
    pub fn new(
        account: Account,
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        session: SessionHandle,
    ) -> Self {
        let background = BackgroundTasks::new(config.background_workers);
        let header_threads = match account.provider {
            Provider::GenericImap => Some(HeaderThreader::new(&account.id, store.clone())),
            Provider::GmailImap => None,
        };
        Self {
            account,
            config,
            store,
            session,
            threads: None,
            header_threads,
            locks: FolderLocks::new(),
            background,
        }
    }

    pub fn with_thread_api(mut self, api: Arc<dyn ThreadLookup>) -> Self {
        self.threads = Some(Arc::new(ThreadReconciler::new(
            &self.account.id,
            self.store.clone(),
            api,
        )));
        self
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Syncs one folder: new mail, then a full purge. Thread ids for new mail resolve on
    /// the background pool after this returns.
    pub async fn sync_folder(&self, name: &str) -> SyncOutcome<SyncResult> {
        let _guard = self.locks.try_acquire(&self.account.id, name).await?;
        let result = self.sync_folder_locked(name, true).await?;

        if let Some(threads) = self.threads.clone() {
            if !result.new_email_ids.is_empty() {
                let ids = result.new_email_ids.clone();
                self.background.spawn("thread-reconcile", async move {
                    threads.reconcile_emails(&ids, &CancellationToken::new()).await
                });
            }
        }

        Ok(result)
    }

    /// Syncs the essential folders in order. A failing folder is reported in its own
    /// `SyncResult` and the rest still run. Only the first folder is purged. Thread ids for
    /// all new mail are resolved before returning.
    pub async fn sync_essential_folders(&self) -> SyncOutcome<Vec<SyncResult>> {
        let names = self.config.essential_folders.clone();
        self.sync_many(&names, false, "Essential folders synced").await
    }

    /// Syncs every folder already known locally, each with a full purge. Failures are
    /// collected per folder as in `sync_essential_folders`.
    pub async fn sync_all_folders(&self) -> SyncOutcome<Vec<SyncResult>> {
        let names: Vec<String> = self
            .store
            .list_folders(&self.account.id)
            .await
            .map_err(SyncError::store)?
            .into_iter()
            .map(|f| f.name)
            .collect();
        self.sync_many(&names, true, "All folders synced").await
    }

    async fn sync_many(
        &self,
        names: &[String],
        purge_all: bool,
        summary: &'static str,
    ) -> SyncOutcome<Vec<SyncResult>> {
        let started = Instant::now();
        let mut results = Vec::with_capacity(names.len());
        let mut new_ids: Vec<i64> = Vec::new();

        for (i, name) in names.iter().enumerate() {
            let guard = match self.locks.try_acquire(&self.account.id, name).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(account = %self.account.id, folder = %name, error = %e, "Skipping folder");
                    results.push(SyncResult::failed(name, e.to_string()));
                    continue;
                }
            };

            match self.sync_folder_locked(name, purge_all || i == 0).await {
                Ok(result) => {
                    new_ids.extend(result.new_email_ids.iter().copied());
                    results.push(result);
                }
                Err(e) => {
                    warn!(account = %self.account.id, folder = %name, error = %e, "Folder sync failed");
                    results.push(SyncResult::failed(name, e.to_string()));
                }
            }
            drop(guard);
        }

        if let Some(threads) = &self.threads {
            if !new_ids.is_empty() {
                if let Err(e) = threads.reconcile_emails(&new_ids, &CancellationToken::new()).await {
                    warn!(account = %self.account.id, error = %e, "Thread reconcile after sync failed");
                }
            }
        }

        info!(
            account = %self.account.id,
            folders = results.len(),
            failed = results.iter().filter(|r| !r.errors.is_empty()).count(),
            new_emails = new_ids.len(),
            elapsed_ms = ?started.elapsed().as_millis(),
            "{}",
            summary
        );
        Ok(results)
    }

    pub async fn purge_deleted(&self, name: &str) -> SyncOutcome<usize> {
        let folder = self.known_folder(name).await?;
        let _guard = self.locks.acquire(&self.account.id, name).await;
        purge::purge_folder(&self.session, self.store.as_ref(), &self.config, &folder).await
    }

    pub async fn purge_specific_uids(&self, name: &str, uids: &[u32]) -> SyncOutcome<Vec<u32>> {
        let folder = self.known_folder(name).await?;
        let _guard = self.locks.acquire(&self.account.id, name).await;
        purge::purge_uids(&self.session, self.store.as_ref(), &folder, uids).await
    }

    pub async fn sync_thread_ids<F>(
        &self,
        progress: F,
        cancel: &CancellationToken,
    ) -> SyncOutcome<ThreadSyncReport>
    where
        F: FnMut(BackfillProgress) + Send,
    {
        let threads = self.threads.as_ref().ok_or(SyncError::ThreadApiUnavailable)?;
        threads.backfill(progress, cancel).await
    }

    /// Moves one message to the archive folder on the server and flags it locally.
    pub async fn archive_email(&self, name: &str, uid: u32) -> SyncOutcome<bool> {
        let folder = self.known_folder(name).await?;
        {
            let mut client = self.session.lock().await;
            client
                .move_or_archive(name, uid, &self.config.archive_folder)
                .await
                .map_err(SyncError::remote)?;
        }
        let flagged = self
            .store
            .set_archived(folder.id, uid)
            .await
            .map_err(SyncError::store)?;
        info!(account = %self.account.id, folder = %name, uid, target = %self.config.archive_folder, "Archived email");
        Ok(flagged)
    }

    /// Moves soft-deleted rows older than `older_than_days` into the archive table.
    pub async fn archive_retired(&self, older_than_days: u32) -> SyncOutcome<usize> {
        let cutoff = now_ts() - i64::from(older_than_days) * 86_400;
        let moved = self
            .store
            .archive_deleted_before(&self.account.id, cutoff, ARCHIVE_REASON_PURGED)
            .await
            .map_err(SyncError::store)?;
        info!(account = %self.account.id, older_than_days, moved, "Retired deleted emails");
        Ok(moved)
    }

    pub async fn thread_summaries(&self, limit: usize) -> SyncOutcome<Vec<ThreadSummary>> {
        self.store
            .thread_summaries(&self.account.id, limit)
            .await
            .map_err(SyncError::store)
    }

    /// Lists the server's folders and records each one locally.
    pub async fn load_folders(&self) -> SyncOutcome<Vec<FolderState>> {
        let names = {
            let mut client = self.session.lock().await;
            client.list_folders().await.map_err(SyncError::remote)?
        };
        for name in &names {
            self.store
                .ensure_folder(&self.account.id, name)
                .await
                .map_err(SyncError::store)?;
        }
        debug!(account = %self.account.id, count = names.len(), "Loaded folder list");
        self.store
            .list_folders(&self.account.id)
            .await
            .map_err(SyncError::store)
    }

    /// Waits for detached thread reconciles to finish.
    pub async fn shutdown(&self) {
        self.background.shutdown().await;
    }

    async fn known_folder(&self, name: &str) -> SyncOutcome<FolderState> {
        self.store
            .get_folder(&self.account.id, name)
            .await
            .map_err(SyncError::store)?
            .ok_or_else(|| SyncError::NoSuchFolder(name.to_string()))
    }

    async fn sync_folder_locked(&self, name: &str, with_purge: bool) -> SyncOutcome<SyncResult> {
        let started = Instant::now();
        let account_id = self.account.id.as_str();

        let mut folder = self
            .store
            .ensure_folder(account_id, name)
            .await
            .map_err(SyncError::store)?;

        let status = {
            let mut client = self.session.lock().await;
            client.select(name).await.map_err(SyncError::remote)?
        };

        if let (Some(stored), Some(current)) = (folder.uidvalidity, status.uid_validity) {
            if stored != current {
                let archived = self
                    .store
                    .archive_folder_rows(folder.id, ARCHIVE_REASON_UIDVALIDITY)
                    .await
                    .map_err(SyncError::store)?;
                warn!(
                    account = %account_id,
                    folder = %name,
                    stored,
                    current,
                    archived,
                    "UIDVALIDITY changed, restarting folder from an initial sync"
                );
            }
        }
        self.store
            .update_folder_status(folder.id, &status, None)
            .await
            .map_err(SyncError::store)?;
        folder.uidvalidity = status.uid_validity.or(folder.uidvalidity);

        let last_uid = self.store.latest_uid(folder.id).await.map_err(SyncError::store)?;
        let plan = {
            let mut client = self.session.lock().await;
            diff::plan_fetch(&mut **client, name, last_uid, &self.config)
                .await
                .map_err(SyncError::remote)?
        };

        let fetched = fetch::fetch_and_store(
            &self.session,
            self.store.as_ref(),
            &folder,
            &plan.uids,
            self.config.fetch_batch_size,
        )
        .await?;

        let mut result = SyncResult {
            folder: name.to_string(),
            new_emails: fetched.created,
            new_email_ids: fetched.new_email_ids,
            latest_uid: last_uid.max(fetched.latest_uid),
            ..Default::default()
        };

        if self.threads.is_none() {
            if let Some(headers) = &self.header_threads {
                if let Err(e) = headers.assign(&result.new_email_ids).await {
                    warn!(account = %account_id, folder = %name, error = %e, "Header threading failed");
                }
            }
        }

        if with_purge {
            match purge::purge_folder(&self.session, self.store.as_ref(), &self.config, &folder).await {
                Ok(deleted) => result.deleted = deleted,
                Err(e) => {
                    warn!(account = %account_id, folder = %name, error = %e, "Purge after sync failed");
                }
            }
        }

        self.store
            .update_folder_status(folder.id, &status, Some(now_ts()))
            .await
            .map_err(SyncError::store)?;

        info!(
            account = %account_id,
            folder = %name,
            mode = ?plan.mode,
            new_emails = result.new_emails,
            deleted = result.deleted,
            latest_uid = result.latest_uid,
            errors = result.errors.len(),
            elapsed_ms = ?started.elapsed().as_millis(),
            "Folder sync completed"
        );
        Ok(result)
    }
}
