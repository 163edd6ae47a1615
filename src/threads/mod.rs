//! Conversation thread backfill through a secondary lookup API.
//!
//! A message the API does not know is treated as gone from the server and
//! soft-deleted locally; every other failure leaves the row for the next pass.
//! Accounts without such an API get header-derived ids from [`headers`].
pub mod gmail;
pub mod headers;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{SyncError, SyncOutcome};
use crate::storage::LocalStore;
use crate::types::EmailRecord;

pub use gmail::GmailThreadApi;
pub use headers::HeaderThreader;

const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("thread API rate limit exceeded")]
    RateLimited,
    #[error("thread API rejected the access token")]
    Unauthorized,
    #[error("thread API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("thread API request failed: {0}")]
    Transport(String),
    #[error("thread API response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Found { thread_id: String },
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub message_id: String,
    pub thread_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub messages: Vec<RemoteMessage>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait ThreadLookup: Send + Sync {
    async fn lookup_by_message_id(&self, message_id: &str) -> Result<LookupOutcome, LookupError>;

    async fn list_messages(&self, page_token: Option<&str>) -> Result<MessagePage, LookupError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillProgress {
    /// Upstream listing: pages read so far and messages seen in them.
    Listing { page: usize, found: usize },
    /// Local candidates processed out of the total.
    Fetching { processed: usize, total: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadSyncReport {
    pub resolved: usize,
    pub not_found: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    /// Rows soft-deleted because the API no longer knows their message id.
    pub not_found_ids: Vec<i64>,
}

enum Step {
    Continue,
    Cancelled,
}

pub struct ThreadReconciler {
    account_id: String,
    store: Arc<dyn LocalStore>,
    api: Arc<dyn ThreadLookup>,
}

impl ThreadReconciler {
    pub fn new(account_id: &str, store: Arc<dyn LocalStore>, api: Arc<dyn ThreadLookup>) -> Self {
        Self {
            account_id: account_id.to_string(),
            store,
            api,
        }
    }

    /// Resolves thread ids for the given local rows, typically the ones a sync just created.
    pub async fn reconcile_emails(
        &self,
        ids: &[i64],
        cancel: &CancellationToken,
    ) -> SyncOutcome<ThreadSyncReport> {
        let started = Instant::now();
        let mut report = ThreadSyncReport::default();
        let emails = self.store.emails_by_ids(ids).await.map_err(SyncError::store)?;

        for email in &emails {
            if email.is_deleted || email.message_id.is_empty() || email.has_thread() {
                report.skipped += 1;
                continue;
            }
            if let Step::Cancelled = self.resolve_one(email, &mut report, cancel).await? {
                report.cancelled = true;
                break;
            }
        }

        info!(
            account = %self.account_id,
            resolved = report.resolved,
            not_found = report.not_found,
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            elapsed_ms = ?started.elapsed().as_millis(),
            "Thread reconcile finished"
        );
        Ok(report)
    }

    /// Two phases: page the upstream message list into a message id -> thread map, then
    /// walk local rows still missing a thread id, resolving from the map first and falling
    /// back to a per-message lookup.
    pub async fn backfill<F>(
        &self,
        mut progress: F,
        cancel: &CancellationToken,
    ) -> SyncOutcome<ThreadSyncReport>
    where
        F: FnMut(BackfillProgress) + Send,
    {
        let started = Instant::now();
        let mut report = ThreadSyncReport::default();

        let Some(known) = self.list_upstream(&mut progress, cancel).await? else {
            report.cancelled = true;
            return Ok(report);
        };

        let candidates = self
            .store
            .emails_missing_thread(&self.account_id)
            .await
            .map_err(SyncError::store)?;
        let total = candidates.len();
        progress(BackfillProgress::Fetching { processed: 0, total });

        for (i, email) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            match known.get(email.message_id.as_str()) {
                Some(thread_id) => {
                    self.write_thread(email, thread_id, &mut report).await?;
                }
                None => {
                    if let Step::Cancelled = self.resolve_one(email, &mut report, cancel).await? {
                        report.cancelled = true;
                        break;
                    }
                }
            }

            progress(BackfillProgress::Fetching {
                processed: i + 1,
                total,
            });
        }

        info!(
            account = %self.account_id,
            listed = known.len(),
            candidates = total,
            resolved = report.resolved,
            not_found = report.not_found,
            failed = report.failed,
            cancelled = report.cancelled,
            elapsed_ms = ?started.elapsed().as_millis(),
            "Thread backfill finished"
        );
        Ok(report)
    }

    /// `None` when cancelled. A failing page ends the listing early; the fetching phase
    /// still covers every candidate through per-message lookups.
    async fn list_upstream<F>(
        &self,
        progress: &mut F,
        cancel: &CancellationToken,
    ) -> SyncOutcome<Option<HashMap<String, String>>>
    where
        F: FnMut(BackfillProgress) + Send,
    {
        let mut known: HashMap<String, String> = HashMap::new();
        let mut page_token: Option<String> = None;
        let mut page = 0usize;

        loop {
            let request = self.api.list_messages(page_token.as_deref());
            let Some(result) = until_cancelled(cancel, request).await else {
                return Ok(None);
            };

            let listing = match result {
                Ok(listing) => listing,
                Err(LookupError::Unauthorized) => {
                    return Err(SyncError::remote(LookupError::Unauthorized.into()));
                }
                Err(e) => {
                    warn!(account = %self.account_id, page, error = %e, "Thread listing stopped early");
                    break;
                }
            };

            page += 1;
            for msg in listing.messages {
                if !msg.message_id.is_empty() && !msg.thread_id.is_empty() {
                    known.insert(msg.message_id, msg.thread_id);
                }
            }
            progress(BackfillProgress::Listing {
                page,
                found: known.len(),
            });

            match listing.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(account = %self.account_id, pages = page, listed = known.len(), "Thread listing complete");
        Ok(Some(known))
    }

    async fn resolve_one(
        &self,
        email: &EmailRecord,
        report: &mut ThreadSyncReport,
        cancel: &CancellationToken,
    ) -> SyncOutcome<Step> {
        let request = self.api.lookup_by_message_id(&email.message_id);
        let Some(result) = until_cancelled(cancel, request).await else {
            return Ok(Step::Cancelled);
        };

        match result {
            Ok(LookupOutcome::Found { thread_id }) => {
                self.write_thread(email, &thread_id, report).await?;
            }
            Ok(LookupOutcome::NotFound) => {
                self.store
                    .mark_deleted_by_ids(&[email.id])
                    .await
                    .map_err(SyncError::store)?;
                report.not_found += 1;
                report.not_found_ids.push(email.id);
                debug!(account = %self.account_id, email_id = email.id, "Message unknown upstream, soft-deleted");
            }
            Err(LookupError::Unauthorized) => {
                return Err(SyncError::remote(LookupError::Unauthorized.into()));
            }
            Err(LookupError::RateLimited) => {
                report.failed += 1;
                warn!(account = %self.account_id, "Thread API rate limited, backing off");
                if until_cancelled(cancel, tokio::time::sleep(RATE_LIMIT_BACKOFF)).await.is_none() {
                    return Ok(Step::Cancelled);
                }
            }
            Err(e) => {
                report.failed += 1;
                warn!(account = %self.account_id, email_id = email.id, error = %e, "Thread lookup failed");
            }
        }
        Ok(Step::Continue)
    }

    async fn write_thread(
        &self,
        email: &EmailRecord,
        thread_id: &str,
        report: &mut ThreadSyncReport,
    ) -> SyncOutcome<()> {
        let written = self
            .store
            .set_thread_id(email.id, thread_id)
            .await
            .map_err(SyncError::store)?;
        if written {
            report.resolved += 1;
        } else {
            report.skipped += 1;
        }
        Ok(())
    }
}

/// Races `fut` against the token; `None` when the token fires first or was already fired.
async fn until_cancelled<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    if cancel.is_cancelled() {
        return None;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}
