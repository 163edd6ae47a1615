use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Provider {
    GmailImap,
    GenericImap,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GmailImap => "gmail-imap",
            Provider::GenericImap => "generic-imap",
        }
    }

    pub fn from_host(host: &str) -> Self {
        if host.eq_ignore_ascii_case("imap.gmail.com") {
            Provider::GmailImap
        } else {
            Provider::GenericImap
        }
    }
}

#[derive(Clone, Debug)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub provider: Provider,
    pub imap_host: String,
    pub imap_port: u16,
}

#[derive(Clone, Debug)]
pub struct FolderState {
    pub id: i64,
    pub account_id: String,
    pub name: String,
    pub total_count: u32,
    pub unread_count: u32,
    pub uidvalidity: Option<u32>,
    /// Highest UID ever stored for the current epoch, including since-retired rows.
    pub highest_uid: u32,
    pub last_sync_ts: Option<i64>,
}

/// Server-side mailbox counters reported by SELECT.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub exists: u32,
    pub unseen: u32,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailFlags {
    pub read: bool,
    pub starred: bool,
    pub replied: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub part_number: String,
    pub filename: String,
    pub content_type: String,
    pub content_id: String,
    pub encoding: String,
    pub charset: String,
    pub size: u64,
    pub is_inline: bool,
}

/// One decoded FETCH response: envelope, flags and attachment structure.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchedEmail {
    pub uid: u32,
    pub message_id: String,
    pub subject: String,
    pub from_name: String,
    pub from_email: String,
    pub to_addrs: String,
    pub cc_addrs: String,
    pub in_reply_to: String,
    pub date: Option<i64>,
    pub flags: EmailFlags,
    pub size_bytes: u32,
    pub has_attachments: bool,
    pub attachments: Vec<AttachmentMeta>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailRecord {
    pub id: i64,
    pub account_id: String,
    pub folder_id: i64,
    pub uid: u32,
    pub message_id: String,
    pub subject: String,
    pub from_name: String,
    pub from_email: String,
    pub to_addrs: String,
    pub cc_addrs: String,
    pub in_reply_to: String,
    pub date: Option<i64>,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_archived: bool,
    pub is_deleted: bool,
    pub is_replied: bool,
    pub thread_id: Option<String>,
    pub size_bytes: u32,
    pub has_attachments: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl EmailRecord {
    pub fn has_thread(&self) -> bool {
        self.thread_id.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Result of writing one fetched batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub created: usize,
    pub updated: usize,
    /// Local ids of rows created by this batch that carry a message id.
    pub new_email_ids: Vec<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub folder: String,
    pub new_emails: usize,
    pub deleted: usize,
    pub new_email_ids: Vec<i64>,
    pub latest_uid: u32,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn failed(folder: &str, error: String) -> Self {
        Self {
            folder: folder.to_string(),
            errors: vec![error],
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub subject: String,
    pub last_sender: String,
    pub last_date: Option<i64>,
    pub message_count: usize,
    pub unread_count: usize,
    pub has_attachments: bool,
    pub participants: Vec<String>,
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
