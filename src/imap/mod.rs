//! Remote mailbox access: the `MailboxClient` seam, the serialized session handle, and
//! the async-imap connector (XOAUTH2 or LOGIN over tokio-rustls).
pub mod decode;
mod session;

use anyhow::{Context, Result};
use async_imap::{Authenticator, Client};
use async_trait::async_trait;
use chrono::NaiveDate;
use rustls_native_certs::load_native_certs;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::debug;

use crate::config::Credential;
use crate::types::{Account, FetchedEmail, MailboxStatus};

pub use session::ImapMailbox;

pub type ImapSession = async_imap::Session<Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchCriteria {
    All,
    /// UIDs strictly greater than the given one.
    UidsAfter(u32),
    Since(NaiveDate),
    Uids(Vec<u32>),
}

impl SearchCriteria {
    pub fn to_query(&self) -> String {
        match self {
            SearchCriteria::All => "ALL".to_string(),
            SearchCriteria::UidsAfter(uid) => format!("UID {}:*", uid.saturating_add(1)),
            SearchCriteria::Since(date) => format!("SINCE {}", date.format("%d-%b-%Y")),
            SearchCriteria::Uids(uids) => format!("UID {}", uid_sequence_set(uids)),
        }
    }
}

/// Compresses UIDs into an IMAP sequence set, e.g. `[1,2,3,5,7,8]` -> `1:3,5,7:8`.
pub fn uid_sequence_set(uids: &[u32]) -> String {
    let mut sorted: Vec<u32> = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let (mut start, mut end) = (first, first);
    for uid in iter {
        if end.checked_add(1) == Some(uid) {
            end = uid;
            continue;
        }
        parts.push(range_to_string(start, end));
        start = uid;
        end = uid;
    }
    parts.push(range_to_string(start, end));
    parts.join(",")
}

fn range_to_string(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}:{}", start, end)
    }
}

/// Commands the sync engine issues against one account's server. Every method that
/// touches folder contents names the folder; implementations select it as needed.
#[async_trait]
pub trait MailboxClient: Send {
    async fn list_folders(&mut self) -> Result<Vec<String>>;

    async fn select(&mut self, folder: &str) -> Result<MailboxStatus>;

    async fn search(&mut self, folder: &str, criteria: &SearchCriteria) -> Result<Vec<u32>>;

    /// Envelope, flags, size and body structure for `uids` in a single round trip.
    async fn fetch(&mut self, folder: &str, uids: &[u32]) -> Result<Vec<FetchedEmail>>;

    async fn all_uids(&mut self, folder: &str) -> Result<Vec<u32>> {
        self.search(folder, &SearchCriteria::All).await
    }

    /// MOVE, falling back to COPY + `\Deleted` + EXPUNGE when MOVE is unsupported.
    async fn move_or_archive(&mut self, folder: &str, uid: u32, target: &str) -> Result<()>;
}

/// The account's single logical connection. Holding the guard serializes commands, so a
/// select followed by a search can never interleave with another task's select.
#[derive(Clone)]
pub struct SessionHandle {
    account_id: String,
    inner: Arc<Mutex<Box<dyn MailboxClient>>>,
}

impl SessionHandle {
    pub fn new(account_id: &str, client: impl MailboxClient + 'static) -> Self {
        Self {
            account_id: account_id.to_string(),
            inner: Arc::new(Mutex::new(Box::new(client))),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn MailboxClient>> {
        let wait_start = Instant::now();
        let guard = self.inner.lock().await;
        let waited = wait_start.elapsed().as_millis();
        if waited > 0 {
            debug!(account = %self.account_id, waited_ms = ?waited, "Acquired IMAP session");
        }
        guard
    }
}

pub struct ImapClient;

impl ImapClient {
    pub async fn connect(account: &Account, credential: &Credential) -> Result<ImapSession> {
        let mut root_store = RootCertStore::empty();
        for cert in load_native_certs().context("failed to load native certs")? {
            root_store
                .add(&tokio_rustls::rustls::Certificate(cert.0))
                .context("failed to add cert to root store")?;
        }

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(config));

        let host = account.imap_host.as_str();
        let tcp = TcpStream::connect((host, account.imap_port))
            .await
            .with_context(|| format!("connecting to {}:{}", host, account.imap_port))?;

        let server_name = ServerName::try_from(host).context("invalid DNS name")?;
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .context("starting TLS for IMAP")?;

        let mut client = Client::new(tls_stream.compat());

        let _greeting = client
            .read_response()
            .await
            .context("reading IMAP greeting")?
            .ok_or_else(|| anyhow::anyhow!("unexpected end of stream, expected greeting"))?;

        let session = match credential {
            Credential::AccessToken(token) => client
                .authenticate(
                    "XOAUTH2",
                    Xoauth2 {
                        user: account.email.clone(),
                        access_token: token.clone(),
                    },
                )
                .await
                .map_err(|(err, _client)| err)
                .context("XOAUTH2 authenticate")?,
            Credential::Password(password) => client
                .login(&account.email, password)
                .await
                .map_err(|(err, _client)| err)
                .context("IMAP LOGIN")?,
        };

        Ok(session)
    }
}

struct Xoauth2 {
    user: String,
    access_token: String,
}

impl Authenticator for Xoauth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> String {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}
