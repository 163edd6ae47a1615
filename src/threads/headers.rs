//! Thread ids derived from message headers, for servers without a thread API.
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

use crate::errors::{SyncError, SyncOutcome};
use crate::storage::LocalStore;

static REPLY_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(re|fwd|fw|aw|sv|ref):\s*").expect("valid regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Lowercased subject with every leading reply/forward prefix removed.
pub fn normalize_subject(subject: &str) -> String {
    let mut rest = subject.trim();
    while let Some(m) = REPLY_PREFIX.find(rest) {
        rest = rest[m.end()..].trim_start();
    }
    WHITESPACE.replace_all(rest.trim(), " ").to_lowercase()
}

fn clean_message_id(raw: &str) -> String {
    raw.trim_matches(|c: char| c == '<' || c == '>' || c.is_whitespace())
        .to_lowercase()
}

/// Parent first, then a reply-prefixed subject, then the message's own id.
pub fn header_thread_id(message_id: &str, in_reply_to: &str, subject: &str) -> String {
    if !in_reply_to.trim().is_empty() {
        return clean_message_id(in_reply_to);
    }
    if REPLY_PREFIX.is_match(subject.trim()) || message_id.trim().is_empty() {
        return format!("subject:{}", normalize_subject(subject));
    }
    clean_message_id(message_id)
}

pub struct HeaderThreader {
    account_id: String,
    store: Arc<dyn LocalStore>,
}

impl HeaderThreader {
    pub fn new(account_id: &str, store: Arc<dyn LocalStore>) -> Self {
        Self {
            account_id: account_id.to_string(),
            store,
        }
    }

    /// Assigns thread ids to the given rows in order, so a reply stored after its parent
    /// in the same batch joins the parent's thread. Returns the number of rows written.
    pub async fn assign(&self, ids: &[i64]) -> SyncOutcome<usize> {
        let emails = self.store.emails_by_ids(ids).await.map_err(SyncError::store)?;
        let mut written = 0usize;

        for email in emails.iter().filter(|e| !e.is_deleted && !e.has_thread()) {
            let mut thread_id = header_thread_id(&email.message_id, &email.in_reply_to, &email.subject);

            let parent = clean_message_id(&email.in_reply_to);
            if !parent.is_empty() {
                if let Some(existing) = self
                    .store
                    .thread_for_message_id(&self.account_id, &parent)
                    .await
                    .map_err(SyncError::store)?
                {
                    thread_id = existing;
                }
            }

            if self
                .store
                .set_thread_id(email.id, &thread_id)
                .await
                .map_err(SyncError::store)?
            {
                written += 1;
            }
        }

        debug!(account = %self.account_id, candidates = emails.len(), written, "Header threading applied");
        Ok(written)
    }
}
