use anyhow::{Context, Result};
use async_imap::types::{Fetch, Name};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Instant;
use tracing::{debug, warn};

use super::decode::{decode_fetch, FetchParts};
use super::{uid_sequence_set, ImapClient, ImapSession, MailboxClient, SearchCriteria};
use crate::config::Credential;
use crate::types::{Account, FetchedEmail, MailboxStatus};

const FETCH_QUERY: &str = "(UID FLAGS RFC822.SIZE INTERNALDATE ENVELOPE BODYSTRUCTURE)";

/// A live async-imap session that remembers which folder is selected.
pub struct ImapMailbox {
    session: ImapSession,
    account_id: String,
    selected: Option<String>,
}

impl ImapMailbox {
    pub async fn connect(account: &Account, credential: &Credential) -> Result<Self> {
        let started = Instant::now();
        let session = ImapClient::connect(account, credential).await?;
        debug!(
            account = %account.id,
            host = %account.imap_host,
            elapsed_ms = ?started.elapsed().as_millis(),
            "IMAP session established"
        );
        Ok(Self {
            session,
            account_id: account.id.clone(),
            selected: None,
        })
    }

    async fn ensure_selected(&mut self, folder: &str) -> Result<()> {
        if self.selected.as_deref() == Some(folder) {
            return Ok(());
        }
        self.session
            .select(folder)
            .await
            .with_context(|| format!("selecting {}", folder))?;
        self.selected = Some(folder.to_string());
        Ok(())
    }
}

#[async_trait]
impl MailboxClient for ImapMailbox {
    async fn list_folders(&mut self) -> Result<Vec<String>> {
        let names: Vec<Name> = self
            .session
            .list(Some(""), Some("*"))
            .await
            .context("LIST folders")?
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .filter_map(|r| r.ok())
            .collect();

        Ok(names.iter().map(|n| n.name().to_string()).collect())
    }

    async fn select(&mut self, folder: &str) -> Result<MailboxStatus> {
        // STATUS reports the UNSEEN count; SELECT only reports the first unseen sequence number.
        let counts = self
            .session
            .status(folder, "(MESSAGES UNSEEN)")
            .await
            .with_context(|| format!("STATUS {}", folder))?;

        let mailbox = self
            .session
            .select(folder)
            .await
            .with_context(|| format!("selecting {}", folder))?;
        self.selected = Some(folder.to_string());

        Ok(MailboxStatus {
            exists: mailbox.exists,
            unseen: counts.unseen.unwrap_or(0),
            uid_validity: mailbox.uid_validity,
            uid_next: mailbox.uid_next,
        })
    }

    async fn search(&mut self, folder: &str, criteria: &SearchCriteria) -> Result<Vec<u32>> {
        if let SearchCriteria::Uids(uids) = criteria {
            if uids.is_empty() {
                return Ok(Vec::new());
            }
        }

        self.ensure_selected(folder).await?;
        let query = criteria.to_query();
        let started = Instant::now();
        let found = self
            .session
            .uid_search(&query)
            .await
            .with_context(|| format!("UID SEARCH {} in {}", query, folder))?;

        let mut uids: Vec<u32> = found.into_iter().collect();
        uids.sort_unstable();
        debug!(
            account = %self.account_id,
            folder = %folder,
            query = %query,
            count = uids.len(),
            elapsed_ms = ?started.elapsed().as_millis(),
            "UID SEARCH completed"
        );
        Ok(uids)
    }

    async fn fetch(&mut self, folder: &str, uids: &[u32]) -> Result<Vec<FetchedEmail>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        self.ensure_selected(folder).await?;
        let uid_seq = uid_sequence_set(uids);
        let started = Instant::now();

        let mut stream = self
            .session
            .uid_fetch(&uid_seq, FETCH_QUERY)
            .await
            .with_context(|| format!("UID FETCH {} in {}", uid_seq, folder))?;

        // A broken item fails the batch; skipping it would leave a hole below the mark.
        let mut fetches: Vec<Fetch> = Vec::with_capacity(uids.len());
        while let Some(fetch_result) = stream.next().await {
            let fetch = fetch_result
                .with_context(|| format!("reading UID FETCH {} response in {}", uid_seq, folder))?;
            fetches.push(fetch);
        }
        drop(stream);

        let emails: Vec<FetchedEmail> = fetches
            .iter()
            .filter_map(|fetch| decode_fetch(&FetchParts::from_fetch(fetch)))
            .collect();

        debug!(
            account = %self.account_id,
            folder = %folder,
            requested = uids.len(),
            decoded = emails.len(),
            elapsed_ms = ?started.elapsed().as_millis(),
            "UID FETCH completed"
        );
        Ok(emails)
    }

    async fn move_or_archive(&mut self, folder: &str, uid: u32, target: &str) -> Result<()> {
        self.ensure_selected(folder).await?;
        let uid_set = uid.to_string();

        match self.session.uid_mv(&uid_set, target).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    account = %self.account_id,
                    folder = %folder,
                    uid,
                    error = %e,
                    "UID MOVE failed, falling back to COPY + EXPUNGE"
                );
            }
        }

        self.session
            .uid_copy(&uid_set, target)
            .await
            .with_context(|| format!("UID COPY {} to {}", uid_set, target))?;

        let _: Vec<_> = self
            .session
            .uid_store(&uid_set, "+FLAGS.SILENT (\\Deleted)")
            .await
            .with_context(|| format!("flagging {} as deleted", uid_set))?
            .collect::<Vec<_>>()
            .await;

        // Plain EXPUNGE would also remove unrelated messages already flagged \Deleted.
        let capabilities = self.session.capabilities().await.context("CAPABILITY")?;
        if capabilities.has_str("UIDPLUS") {
            let _: Vec<_> = self
                .session
                .uid_expunge(&uid_set)
                .await
                .with_context(|| format!("UID EXPUNGE {}", uid_set))?
                .collect::<Vec<_>>()
                .await;
        } else {
            warn!(
                account = %self.account_id,
                folder = %folder,
                uid,
                "Server lacks UIDPLUS, falling back to plain EXPUNGE"
            );
            let _: Vec<_> = self
                .session
                .expunge()
                .await
                .context("EXPUNGE after copy")?
                .collect::<Vec<_>>()
                .await;
        }

        Ok(())
    }
}
