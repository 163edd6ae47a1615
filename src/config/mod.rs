use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;
use tracing::{debug, warn};

use crate::types::{Account, Provider};

const CONFIG_FILE_NAME: &str = "mailkeeper.toml";
const KEYRING_SERVICE: &str = "mailkeeper";

/// Sync tuning knobs. Defaults need no config file; `mailkeeper.toml` in the data
/// directory and `MAILKEEPER_*` env vars override them, in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub initial_sync_days: u32,
    pub initial_max_per_folder: usize,
    pub incremental_batch_size: usize,
    pub fetch_batch_size: usize,
    pub purge_enabled: bool,
    pub purge_max_folder_size: usize,
    pub essential_folders: Vec<String>,
    pub archive_folder: String,
    pub thread_page_size: u32,
    pub thread_lookup_concurrency: usize,
    pub background_workers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_sync_days: 30,
            initial_max_per_folder: 500,
            incremental_batch_size: 100,
            fetch_batch_size: 100,
            purge_enabled: true,
            purge_max_folder_size: 10_000,
            essential_folders: vec![
                "INBOX".to_string(),
                "[Gmail]/Sent Mail".to_string(),
                "[Gmail]/Trash".to_string(),
            ],
            archive_folder: "[Gmail]/All Mail".to_string(),
            thread_page_size: 500,
            thread_lookup_concurrency: 8,
            background_workers: 2,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    sync: SyncSection,
}

#[derive(Debug, Default, Deserialize)]
struct SyncSection {
    initial_sync_days: Option<u32>,
    initial_max_per_folder: Option<usize>,
    incremental_batch_size: Option<usize>,
    fetch_batch_size: Option<usize>,
    purge_enabled: Option<bool>,
    purge_max_folder_size: Option<usize>,
    essential_folders: Option<Vec<String>>,
    archive_folder: Option<String>,
    thread_page_size: Option<u32>,
    thread_lookup_concurrency: Option<usize>,
    background_workers: Option<usize>,
}

impl SyncConfig {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let mut config = Self::default();

        let path = data_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            config.apply_toml(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            debug!(path = %path.display(), "Loaded sync config file");
        }

        config.apply_env();
        Ok(config)
    }

    pub fn apply_toml(&mut self, raw: &str) -> Result<()> {
        let file: ConfigFile = toml::from_str(raw)?;
        let s = file.sync;
        if let Some(v) = s.initial_sync_days {
            self.initial_sync_days = v;
        }
        if let Some(v) = s.initial_max_per_folder {
            self.initial_max_per_folder = v;
        }
        if let Some(v) = s.incremental_batch_size {
            self.incremental_batch_size = v;
        }
        if let Some(v) = s.fetch_batch_size {
            self.fetch_batch_size = v;
        }
        if let Some(v) = s.purge_enabled {
            self.purge_enabled = v;
        }
        if let Some(v) = s.purge_max_folder_size {
            self.purge_max_folder_size = v;
        }
        if let Some(v) = s.essential_folders.filter(|f| !f.is_empty()) {
            self.essential_folders = v;
        }
        if let Some(v) = s.archive_folder {
            self.archive_folder = v;
        }
        if let Some(v) = s.thread_page_size {
            self.thread_page_size = v;
        }
        if let Some(v) = s.thread_lookup_concurrency {
            self.thread_lookup_concurrency = v.max(1);
        }
        if let Some(v) = s.background_workers {
            self.background_workers = v.max(1);
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_parse("MAILKEEPER_INITIAL_SYNC_DAYS") {
            self.initial_sync_days = v;
        }
        if let Some(v) = env_parse("MAILKEEPER_INITIAL_MAX_PER_FOLDER") {
            self.initial_max_per_folder = v;
        }
        if let Some(v) = env_parse("MAILKEEPER_INCREMENTAL_BATCH_SIZE") {
            self.incremental_batch_size = v;
        }
        if let Some(v) = env_parse("MAILKEEPER_FETCH_BATCH_SIZE") {
            self.fetch_batch_size = v;
        }
        if let Ok(v) = env::var("MAILKEEPER_PURGE_ENABLED") {
            self.purge_enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = env_parse("MAILKEEPER_PURGE_MAX_FOLDER_SIZE") {
            self.purge_max_folder_size = v;
        }
        if let Ok(v) = env::var("MAILKEEPER_ESSENTIAL_FOLDERS") {
            let folders: Vec<String> = v
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
            if !folders.is_empty() {
                self.essential_folders = folders;
            }
        }
        if let Ok(v) = env::var("MAILKEEPER_ARCHIVE_FOLDER") {
            self.archive_folder = v;
        }
        if let Some(v) = env_parse("MAILKEEPER_THREAD_PAGE_SIZE") {
            self.thread_page_size = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

#[derive(Clone)]
pub enum Credential {
    Password(String),
    AccessToken(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(***)"),
            Credential::AccessToken(_) => f.write_str("AccessToken(***)"),
        }
    }
}

impl Credential {
    pub fn access_token(&self) -> Option<&str> {
        match self {
            Credential::AccessToken(t) => Some(t),
            Credential::Password(_) => None,
        }
    }
}

/// Builds the single synced account from `MAILKEEPER_EMAIL`, `MAILKEEPER_IMAP_HOST`
/// and `MAILKEEPER_IMAP_PORT`.
pub fn account_from_env() -> Result<Account> {
    let email = env::var("MAILKEEPER_EMAIL").context("MAILKEEPER_EMAIL is not set")?;
    let imap_host = env::var("MAILKEEPER_IMAP_HOST").unwrap_or_else(|_| "imap.gmail.com".into());
    let imap_port = env_parse("MAILKEEPER_IMAP_PORT").unwrap_or(993);
    Ok(Account {
        id: email.clone(),
        provider: Provider::from_host(&imap_host),
        email,
        imap_host,
        imap_port,
    })
}

/// Env vars win over the keyring; an access token wins over a password.
pub fn load_credential(account: &Account) -> Result<Credential> {
    if let Ok(token) = env::var("MAILKEEPER_ACCESS_TOKEN") {
        return Ok(Credential::AccessToken(token));
    }
    if let Ok(password) = env::var("MAILKEEPER_PASSWORD") {
        return Ok(Credential::Password(password));
    }

    let entry = keyring::Entry::new(KEYRING_SERVICE, &account.id)
        .context("opening keyring entry")?;
    match entry.get_password() {
        Ok(secret) => Ok(parse_keyring_secret(&secret)),
        Err(keyring::Error::NoEntry) => anyhow::bail!(
            "no credential for {}: set MAILKEEPER_ACCESS_TOKEN / MAILKEEPER_PASSWORD or store one in the keyring",
            account.id
        ),
        Err(e) => {
            warn!(account = %account.id, error = %e, "Keyring read failed");
            Err(e).context("reading keyring credential")
        }
    }
}

/// Keyring secrets are stored as `token:<access token>` or `password:<password>`;
/// an unprefixed secret is treated as a password.
fn parse_keyring_secret(secret: &str) -> Credential {
    if let Some(token) = secret.strip_prefix("token:") {
        Credential::AccessToken(token.to_string())
    } else if let Some(password) = secret.strip_prefix("password:") {
        Credential::Password(password.to_string())
    } else {
        Credential::Password(secret.to_string())
    }
}
