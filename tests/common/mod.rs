#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mailkeeper::config::SyncConfig;
use mailkeeper::imap::{MailboxClient, SearchCriteria, SessionHandle};
use mailkeeper::storage::Database;
use mailkeeper::sync::SyncEngine;
use mailkeeper::threads::{LookupError, LookupOutcome, MessagePage, RemoteMessage, ThreadLookup};
use mailkeeper::types::{now_ts, Account, FetchedEmail, MailboxStatus, Provider};

pub const ACCOUNT_ID: &str = "me@example.com";

pub fn account() -> Account {
    Account {
        id: ACCOUNT_ID.to_string(),
        email: ACCOUNT_ID.to_string(),
        provider: Provider::GmailImap,
        imap_host: "imap.gmail.com".to_string(),
        imap_port: 993,
    }
}

pub fn email(uid: u32, message_id: &str) -> FetchedEmail {
    FetchedEmail {
        uid,
        message_id: message_id.to_string(),
        subject: format!("Message {}", uid),
        from_name: "Alice".to_string(),
        from_email: "alice@example.com".to_string(),
        date: Some(now_ts() - 60),
        size_bytes: 1024,
        ..Default::default()
    }
}

#[derive(Default)]
pub struct FakeFolder {
    pub uid_validity: u32,
    pub messages: BTreeMap<u32, FetchedEmail>,
}

#[derive(Default)]
pub struct ServerState {
    pub folders: HashMap<String, FakeFolder>,
    pub calls: Vec<String>,
    pub select_delay: Option<Duration>,
    /// 1-based FETCH calls that fail instead of answering.
    pub failing_fetches: HashSet<usize>,
    pub fetch_count: usize,
}

/// In-memory IMAP server. Clones share state so a test can mutate the mailbox and
/// inspect issued commands after handing a clone to the engine.
#[derive(Clone, Default)]
pub struct FakeMailbox {
    pub state: Arc<Mutex<ServerState>>,
}

impl FakeMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_folder(&self, name: &str, uid_validity: u32) {
        let mut state = self.state.lock().unwrap();
        state.folders.insert(
            name.to_string(),
            FakeFolder {
                uid_validity,
                messages: BTreeMap::new(),
            },
        );
    }

    pub fn put(&self, folder: &str, email: FetchedEmail) {
        let mut state = self.state.lock().unwrap();
        state
            .folders
            .entry(folder.to_string())
            .or_insert_with(|| FakeFolder {
                uid_validity: 1,
                messages: BTreeMap::new(),
            })
            .messages
            .insert(email.uid, email);
    }

    pub fn remove(&self, folder: &str, uid: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(f) = state.folders.get_mut(folder) {
            f.messages.remove(&uid);
        }
    }

    pub fn reset_folder(&self, folder: &str, uid_validity: u32) {
        self.add_folder(folder, uid_validity);
    }

    pub fn set_select_delay(&self, delay: Duration) {
        self.state.lock().unwrap().select_delay = Some(delay);
    }

    pub fn fail_fetch_call(&self, n: usize) {
        self.state.lock().unwrap().failing_fetches.insert(n);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn has_uid(&self, folder: &str, uid: u32) -> bool {
        let state = self.state.lock().unwrap();
        state
            .folders
            .get(folder)
            .is_some_and(|f| f.messages.contains_key(&uid))
    }
}

#[async_trait]
impl MailboxClient for FakeMailbox {
    async fn list_folders(&mut self) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("LIST".to_string());
        let mut names: Vec<String> = state.folders.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn select(&mut self, folder: &str) -> Result<MailboxStatus> {
        let delay = self.state.lock().unwrap().select_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("SELECT {}", folder));
        let Some(f) = state.folders.get(folder) else {
            bail!("NO [NONEXISTENT] Unknown mailbox: {}", folder);
        };
        Ok(MailboxStatus {
            exists: f.messages.len() as u32,
            unseen: f.messages.values().filter(|m| !m.flags.read).count() as u32,
            uid_validity: Some(f.uid_validity),
            uid_next: Some(f.messages.keys().next_back().copied().unwrap_or(0) + 1),
        })
    }

    async fn search(&mut self, folder: &str, criteria: &SearchCriteria) -> Result<Vec<u32>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("SEARCH {} {}", folder, criteria.to_query()));
        let Some(f) = state.folders.get(folder) else {
            bail!("NO [NONEXISTENT] Unknown mailbox: {}", folder);
        };

        let uids: Vec<u32> = match criteria {
            SearchCriteria::All => f.messages.keys().copied().collect(),
            SearchCriteria::UidsAfter(last) => {
                let above: Vec<u32> = f.messages.keys().copied().filter(|u| u > last).collect();
                if above.is_empty() {
                    // `n:*` with n past the end still matches the highest UID.
                    f.messages.keys().next_back().copied().into_iter().collect()
                } else {
                    above
                }
            }
            SearchCriteria::Since(date) => {
                let floor = date
                    .and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc().timestamp())
                    .unwrap_or(0);
                f.messages
                    .values()
                    .filter(|m| m.date.map_or(true, |d| d >= floor))
                    .map(|m| m.uid)
                    .collect()
            }
            SearchCriteria::Uids(wanted) => {
                let wanted: HashSet<u32> = wanted.iter().copied().collect();
                f.messages.keys().copied().filter(|u| wanted.contains(u)).collect()
            }
        };
        Ok(uids)
    }

    async fn fetch(&mut self, folder: &str, uids: &[u32]) -> Result<Vec<FetchedEmail>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("FETCH {} {}", folder, uids.len()));
        state.fetch_count += 1;
        if state.failing_fetches.contains(&state.fetch_count) {
            bail!("connection reset by peer");
        }
        let Some(f) = state.folders.get(folder) else {
            bail!("NO [NONEXISTENT] Unknown mailbox: {}", folder);
        };
        Ok(uids.iter().filter_map(|u| f.messages.get(u).cloned()).collect())
    }

    async fn move_or_archive(&mut self, folder: &str, uid: u32, target: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("MOVE {} {} {}", folder, uid, target));
        let Some(msg) = state.folders.get_mut(folder).and_then(|f| f.messages.remove(&uid)) else {
            bail!("NO no such message {}", uid);
        };
        state
            .folders
            .entry(target.to_string())
            .or_insert_with(|| FakeFolder {
                uid_validity: 1,
                messages: BTreeMap::new(),
            })
            .messages
            .insert(msg.uid, msg);
        Ok(())
    }
}

#[derive(Default)]
pub struct ThreadApiState {
    /// message id -> thread id answered by per-message lookups.
    pub lookups: HashMap<String, String>,
    /// Pages returned by the listing, in order.
    pub pages: Vec<Vec<RemoteMessage>>,
    /// Message ids whose lookup fails with HTTP 500.
    pub failing: HashSet<String>,
    /// Lookups never complete.
    pub hang: bool,
    /// Lookups for these message ids never complete.
    pub hanging: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct FakeThreadApi {
    pub state: Arc<Mutex<ThreadApiState>>,
    pub lookup_calls: Arc<AtomicUsize>,
    pub list_calls: Arc<AtomicUsize>,
}

impl FakeThreadApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn knows(&self, message_id: &str, thread_id: &str) {
        self.state
            .lock()
            .unwrap()
            .lookups
            .insert(message_id.to_string(), thread_id.to_string());
    }

    pub fn add_page(&self, entries: &[(&str, &str)]) {
        let page = entries
            .iter()
            .map(|(m, t)| RemoteMessage {
                message_id: m.to_string(),
                thread_id: t.to_string(),
            })
            .collect();
        self.state.lock().unwrap().pages.push(page);
    }

    pub fn fail(&self, message_id: &str) {
        self.state.lock().unwrap().failing.insert(message_id.to_string());
    }

    pub fn hang(&self) {
        self.state.lock().unwrap().hang = true;
    }

    pub fn hang_on(&self, message_id: &str) {
        self.state.lock().unwrap().hanging.insert(message_id.to_string());
    }

    pub fn lookups(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    pub fn lists(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ThreadLookup for FakeThreadApi {
    async fn lookup_by_message_id(&self, message_id: &str) -> Result<LookupOutcome, LookupError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        let hang = {
            let state = self.state.lock().unwrap();
            state.hang || state.hanging.contains(message_id)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let state = self.state.lock().unwrap();
        if state.failing.contains(message_id) {
            return Err(LookupError::Http {
                status: 500,
                body: "backend error".to_string(),
            });
        }
        Ok(match state.lookups.get(message_id) {
            Some(thread_id) => LookupOutcome::Found {
                thread_id: thread_id.clone(),
            },
            None => LookupOutcome::NotFound,
        })
    }

    async fn list_messages(&self, page_token: Option<&str>) -> Result<MessagePage, LookupError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let index: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let messages = state.pages.get(index).cloned().unwrap_or_default();
        let next_page_token = if index + 1 < state.pages.len() {
            Some((index + 1).to_string())
        } else {
            None
        };
        Ok(MessagePage {
            messages,
            next_page_token,
        })
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        essential_folders: vec!["INBOX".to_string(), "Sent".to_string()],
        ..SyncConfig::default()
    }
}

pub struct Harness {
    pub server: FakeMailbox,
    pub db: Arc<Database>,
    pub engine: SyncEngine,
}

pub async fn harness(config: SyncConfig) -> Harness {
    harness_with(config, None).await
}

pub async fn harness_with(config: SyncConfig, api: Option<FakeThreadApi>) -> Harness {
    harness_for(account(), config, api).await
}

/// A plain IMAP account: threads come from headers unless an API is attached.
pub async fn generic_harness(config: SyncConfig) -> Harness {
    let account = Account {
        provider: Provider::GenericImap,
        imap_host: "imap.example.com".to_string(),
        ..account()
    };
    harness_for(account, config, None).await
}

pub async fn harness_for(account: Account, config: SyncConfig, api: Option<FakeThreadApi>) -> Harness {
    let server = FakeMailbox::new();
    let db = Arc::new(Database::open_in_memory().await.unwrap());
    let session = SessionHandle::new(ACCOUNT_ID, server.clone());
    let mut engine = SyncEngine::new(account, config, db.clone(), session);
    if let Some(api) = api {
        engine = engine.with_thread_api(Arc::new(api));
    }
    Harness { server, db, engine }
}
