use crate::storage::LocalStore;
use crate::types::{
    now_ts, AttachmentMeta, EmailRecord, FetchedEmail, FolderState, MailboxStatus, ThreadSummary,
    UpsertOutcome,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dirs::home_dir;

use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DB_FILE_NAME: &str = "mailkeeper.db";

/// SQLite caps bound parameters per statement; IN lists are split to stay well below it.
const IN_LIST_CHUNK: usize = 500;

const EMAIL_COLUMNS: &str = "account_id, folder_id, uid, message_id, subject, from_name, \
    from_email, to_addrs, cc_addrs, in_reply_to, date, is_read, is_starred, is_archived, \
    is_deleted, is_replied, thread_id, size_bytes, has_attachments, created_at, updated_at";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: PathBuf,
}

impl Database {
    pub async fn new_default() -> Result<Self> {
        let base = default_data_dir()?;
        Self::open(&base.join(DB_FILE_NAME)).await
    }

    pub async fn open(db_path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("connecting to sqlite at {}", db_path.display()))?;

        let db = Database {
            pool,
            path: db_path.to_path_buf(),
        };
        db.migrate().await?;
        Ok(db)
    }

    /// A private in-memory database. A single never-recycled connection keeps the data alive
    /// for the lifetime of the pool.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory sqlite")?;

        let db = Database {
            pool,
            path: PathBuf::from(":memory:"),
        };
        db.migrate().await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&self.pool)
            .await
            .context("enabling foreign keys")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                name TEXT NOT NULL,
                total_count INTEGER NOT NULL DEFAULT 0,
                unread_count INTEGER NOT NULL DEFAULT 0,
                uidvalidity INTEGER,
                highest_uid INTEGER NOT NULL DEFAULT 0,
                last_sync_ts INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(account_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_folders_account ON folders(account_id);

            CREATE TABLE IF NOT EXISTS emails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                folder_id INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                message_id TEXT NOT NULL DEFAULT '',
                subject TEXT NOT NULL DEFAULT '',
                from_name TEXT NOT NULL DEFAULT '',
                from_email TEXT NOT NULL DEFAULT '',
                to_addrs TEXT NOT NULL DEFAULT '',
                cc_addrs TEXT NOT NULL DEFAULT '',
                in_reply_to TEXT NOT NULL DEFAULT '',
                date INTEGER,
                is_read INTEGER NOT NULL DEFAULT 0,
                is_starred INTEGER NOT NULL DEFAULT 0,
                is_archived INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                is_replied INTEGER NOT NULL DEFAULT 0,
                thread_id TEXT,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(account_id, folder_id, uid),
                FOREIGN KEY (folder_id) REFERENCES folders(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_emails_folder_live ON emails(folder_id, is_deleted);
            CREATE INDEX IF NOT EXISTS idx_emails_thread ON emails(account_id, thread_id);
            CREATE INDEX IF NOT EXISTS idx_emails_message_id ON emails(account_id, message_id);

            CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email_id INTEGER NOT NULL,
                part_number TEXT NOT NULL,
                filename TEXT NOT NULL DEFAULT '',
                content_type TEXT NOT NULL DEFAULT '',
                content_id TEXT NOT NULL DEFAULT '',
                encoding TEXT NOT NULL DEFAULT '',
                charset TEXT NOT NULL DEFAULT '',
                size INTEGER NOT NULL DEFAULT 0,
                is_inline INTEGER NOT NULL DEFAULT 0,
                UNIQUE(email_id, part_number),
                FOREIGN KEY (email_id) REFERENCES emails(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS emails_archive (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original_id INTEGER NOT NULL,
                account_id TEXT NOT NULL,
                folder_id INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                message_id TEXT NOT NULL DEFAULT '',
                subject TEXT NOT NULL DEFAULT '',
                from_name TEXT NOT NULL DEFAULT '',
                from_email TEXT NOT NULL DEFAULT '',
                to_addrs TEXT NOT NULL DEFAULT '',
                cc_addrs TEXT NOT NULL DEFAULT '',
                in_reply_to TEXT NOT NULL DEFAULT '',
                date INTEGER,
                is_read INTEGER NOT NULL DEFAULT 0,
                is_starred INTEGER NOT NULL DEFAULT 0,
                is_archived INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                is_replied INTEGER NOT NULL DEFAULT 0,
                thread_id TEXT,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                attachments_json TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                archive_reason TEXT NOT NULL,
                archived_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_emails_archive_account ON emails_archive(account_id, archived_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("running migrations")?;

        Ok(())
    }

    /// Rows currently held in the archive table for an account.
    pub async fn archived_count(&self, account_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM emails_archive WHERE account_id = ?1")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await
            .context("counting archived emails")?;
        Ok(count as usize)
    }

    pub async fn attachments_for(&self, email_id: i64) -> Result<Vec<AttachmentMeta>> {
        let rows = sqlx::query(
            r#"
            SELECT part_number, filename, content_type, content_id, encoding, charset, size, is_inline
            FROM attachments WHERE email_id = ?1
            ORDER BY part_number
            "#,
        )
        .bind(email_id)
        .fetch_all(&self.pool)
        .await
        .context("loading attachments")?;

        Ok(rows
            .into_iter()
            .map(|row| AttachmentMeta {
                part_number: row.get("part_number"),
                filename: row.get("filename"),
                content_type: row.get("content_type"),
                content_id: row.get("content_id"),
                encoding: row.get("encoding"),
                charset: row.get("charset"),
                size: row.get::<i64, _>("size") as u64,
                is_inline: row.get::<i64, _>("is_inline") != 0,
            })
            .collect())
    }

    async fn existing_uids(
        tx: &mut Transaction<'_, Sqlite>,
        account_id: &str,
        folder_id: i64,
        uids: &[u32],
    ) -> Result<HashSet<u32>> {
        let mut out = HashSet::new();
        for chunk in uids.chunks(IN_LIST_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT uid FROM emails WHERE account_id = ");
            qb.push_bind(account_id);
            qb.push(" AND folder_id = ");
            qb.push_bind(folder_id);
            qb.push(" AND uid IN (");
            {
                let mut separated = qb.separated(", ");
                for uid in chunk {
                    separated.push_bind(*uid as i64);
                }
            }
            qb.push(")");

            let rows = qb
                .build()
                .fetch_all(&mut **tx)
                .await
                .context("loading existing uids for batch")?;
            out.extend(rows.into_iter().map(|row| row.get::<i64, _>(0) as u32));
        }
        Ok(out)
    }

    async fn upsert_attachments(
        tx: &mut Transaction<'_, Sqlite>,
        email_id: i64,
        attachments: &[AttachmentMeta],
    ) -> Result<()> {
        for att in attachments {
            sqlx::query(
                r#"
                INSERT INTO attachments (
                    email_id, part_number, filename, content_type, content_id,
                    encoding, charset, size, is_inline
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(email_id, part_number) DO UPDATE SET
                    filename = excluded.filename,
                    content_type = excluded.content_type,
                    content_id = excluded.content_id,
                    encoding = excluded.encoding,
                    charset = excluded.charset,
                    size = excluded.size,
                    is_inline = excluded.is_inline;
                "#,
            )
            .bind(email_id)
            .bind(&att.part_number)
            .bind(&att.filename)
            .bind(&att.content_type)
            .bind(&att.content_id)
            .bind(&att.encoding)
            .bind(&att.charset)
            .bind(att.size as i64)
            .bind(if att.is_inline { 1 } else { 0 })
            .execute(&mut **tx)
            .await
            .context("upserting attachment")?;
        }
        Ok(())
    }

    /// Copies the selected email rows into `emails_archive` and removes them from `emails`,
    /// all inside one transaction. `filter` is a WHERE clause over `emails` with `?1`.. binds.
    async fn move_to_archive(
        &self,
        filter: &str,
        binds: Vec<BindValue>,
        reason: &str,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("beginning archive tx")?;
        let now = now_ts();
        let offset = binds.len();

        let insert = format!(
            r#"
            INSERT INTO emails_archive (original_id, {cols}, attachments_json, archive_reason, archived_at)
            SELECT id, {cols},
                COALESCE((
                    SELECT json_group_array(json_object(
                        'part_number', a.part_number,
                        'filename', a.filename,
                        'content_type', a.content_type,
                        'content_id', a.content_id,
                        'size', a.size,
                        'is_inline', a.is_inline
                    ))
                    FROM attachments a WHERE a.email_id = emails.id
                ), '[]'),
                ?{reason_idx}, ?{at_idx}
            FROM emails WHERE {filter}
            "#,
            cols = EMAIL_COLUMNS,
            reason_idx = offset + 1,
            at_idx = offset + 2,
            filter = filter,
        );
        let mut query = sqlx::query(&insert);
        for bind in &binds {
            query = bind.apply(query);
        }
        query
            .bind(reason)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("copying rows into emails_archive")?;

        let delete_attachments = format!(
            "DELETE FROM attachments WHERE email_id IN (SELECT id FROM emails WHERE {})",
            filter
        );
        let mut query = sqlx::query(&delete_attachments);
        for bind in &binds {
            query = bind.apply(query);
        }
        query
            .execute(&mut *tx)
            .await
            .context("removing archived attachments")?;

        let delete_emails = format!("DELETE FROM emails WHERE {}", filter);
        let mut query = sqlx::query(&delete_emails);
        for bind in &binds {
            query = bind.apply(query);
        }
        let res = query
            .execute(&mut *tx)
            .await
            .context("removing archived emails")?;

        tx.commit().await.context("committing archive tx")?;
        Ok(res.rows_affected() as usize)
    }
}

enum BindValue {
    Int(i64),
    Text(String),
}

impl BindValue {
    fn apply<'a>(
        &self,
        query: sqlx::query::Query<'a, Sqlite, SqliteArguments<'a>>,
    ) -> sqlx::query::Query<'a, Sqlite, SqliteArguments<'a>> {
        match self {
            BindValue::Int(v) => query.bind(*v),
            BindValue::Text(v) => query.bind(v.clone()),
        }
    }
}

#[async_trait]
impl LocalStore for Database {
    async fn ensure_folder(&self, account_id: &str, name: &str) -> Result<FolderState> {
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO folders (account_id, name, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(account_id, name) DO NOTHING;
            "#,
        )
        .bind(account_id)
        .bind(name)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("ensuring folder row")?;

        self.get_folder(account_id, name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("folder {} missing after insert", name))
    }

    async fn get_folder(&self, account_id: &str, name: &str) -> Result<Option<FolderState>> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, name, total_count, unread_count, uidvalidity, highest_uid, last_sync_ts
            FROM folders WHERE account_id = ?1 AND name = ?2
            "#,
        )
        .bind(account_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("loading folder")?;

        Ok(row.map(|row| folder_from_row(&row)))
    }

    async fn list_folders(&self, account_id: &str) -> Result<Vec<FolderState>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, name, total_count, unread_count, uidvalidity, highest_uid, last_sync_ts
            FROM folders WHERE account_id = ?1
            ORDER BY name
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("listing folders")?;

        Ok(rows.iter().map(folder_from_row).collect())
    }

    async fn update_folder_status(
        &self,
        folder_id: i64,
        status: &MailboxStatus,
        synced_at: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE folders SET
                total_count = ?2,
                unread_count = ?3,
                uidvalidity = COALESCE(?4, uidvalidity),
                last_sync_ts = COALESCE(?5, last_sync_ts),
                updated_at = ?6
            WHERE id = ?1
            "#,
        )
        .bind(folder_id)
        .bind(status.exists as i64)
        .bind(status.unseen as i64)
        .bind(status.uid_validity.map(|v| v as i64))
        .bind(synced_at)
        .bind(now_ts())
        .execute(&self.pool)
        .await
        .context("updating folder status")?;
        Ok(())
    }

    /// The persisted mark wins over the live table: retired rows leave `emails` but their
    /// UIDs must stay below the mark.
    async fn latest_uid(&self, folder_id: i64) -> Result<u32> {
        let max: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(
                highest_uid,
                COALESCE((SELECT MAX(uid) FROM emails WHERE folder_id = ?1), 0)
            )
            FROM folders WHERE id = ?1
            "#,
        )
        .bind(folder_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading latest uid")?;
        Ok(max.unwrap_or(0) as u32)
    }

    async fn upsert_emails(
        &self,
        account_id: &str,
        folder_id: i64,
        emails: &[FetchedEmail],
    ) -> Result<UpsertOutcome> {
        let mut outcome = UpsertOutcome::default();
        if emails.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.pool.begin().await.context("beginning transaction")?;

        let uids: Vec<u32> = emails.iter().map(|e| e.uid).collect();
        let existing = Self::existing_uids(&mut tx, account_id, folder_id, &uids).await?;
        let now = now_ts();

        for email in emails {
            let email_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO emails (
                    account_id, folder_id, uid, message_id, subject, from_name, from_email,
                    to_addrs, cc_addrs, in_reply_to, date, is_read, is_starred, is_replied,
                    size_bytes, has_attachments, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)
                ON CONFLICT(account_id, folder_id, uid) DO UPDATE SET
                    message_id = CASE WHEN excluded.message_id != '' THEN excluded.message_id ELSE emails.message_id END,
                    subject = excluded.subject,
                    from_name = excluded.from_name,
                    from_email = excluded.from_email,
                    to_addrs = excluded.to_addrs,
                    cc_addrs = excluded.cc_addrs,
                    in_reply_to = excluded.in_reply_to,
                    date = COALESCE(excluded.date, emails.date),
                    is_read = excluded.is_read,
                    is_starred = excluded.is_starred,
                    is_replied = excluded.is_replied,
                    size_bytes = excluded.size_bytes,
                    has_attachments = excluded.has_attachments,
                    updated_at = excluded.updated_at
                RETURNING id;
                "#,
            )
            .bind(account_id)
            .bind(folder_id)
            .bind(email.uid as i64)
            .bind(&email.message_id)
            .bind(&email.subject)
            .bind(&email.from_name)
            .bind(&email.from_email)
            .bind(&email.to_addrs)
            .bind(&email.cc_addrs)
            .bind(&email.in_reply_to)
            .bind(email.date)
            .bind(if email.flags.read { 1 } else { 0 })
            .bind(if email.flags.starred { 1 } else { 0 })
            .bind(if email.flags.replied { 1 } else { 0 })
            .bind(email.size_bytes as i64)
            .bind(if email.has_attachments { 1 } else { 0 })
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("batch upserting email uid {}", email.uid))?;

            Self::upsert_attachments(&mut tx, email_id, &email.attachments).await?;

            if existing.contains(&email.uid) {
                outcome.updated += 1;
            } else {
                outcome.created += 1;
                if !email.message_id.is_empty() {
                    outcome.new_email_ids.push(email_id);
                }
            }
        }

        if let Some(max_uid) = emails.iter().map(|e| e.uid).max() {
            sqlx::query(
                "UPDATE folders SET highest_uid = MAX(highest_uid, ?2), updated_at = ?3 WHERE id = ?1",
            )
            .bind(folder_id)
            .bind(max_uid as i64)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("raising folder highest uid")?;
        }

        tx.commit().await.context("committing batch transaction")?;

        debug!(
            folder_id,
            created = outcome.created,
            updated = outcome.updated,
            "Upserted email batch"
        );
        Ok(outcome)
    }

    async fn live_uids(&self, folder_id: i64) -> Result<Vec<u32>> {
        let uids: Vec<i64> = sqlx::query_scalar(
            "SELECT uid FROM emails WHERE folder_id = ?1 AND is_deleted = 0 ORDER BY uid",
        )
        .bind(folder_id)
        .fetch_all(&self.pool)
        .await
        .context("loading live uids")?;
        Ok(uids.into_iter().map(|v| v as u32).collect())
    }

    async fn mark_deleted_by_uids(&self, folder_id: i64, uids: &[u32]) -> Result<usize> {
        if uids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context("beginning delete tx")?;
        let now = now_ts();
        let mut affected = 0u64;

        for chunk in uids.chunks(IN_LIST_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE emails SET is_deleted = 1, updated_at = ");
            qb.push_bind(now);
            qb.push(" WHERE folder_id = ");
            qb.push_bind(folder_id);
            qb.push(" AND is_deleted = 0 AND uid IN (");
            {
                let mut separated = qb.separated(", ");
                for uid in chunk {
                    separated.push_bind(*uid as i64);
                }
            }
            qb.push(")");

            let res = qb
                .build()
                .execute(&mut *tx)
                .await
                .context("soft-deleting emails by uid list")?;
            affected += res.rows_affected();
        }

        tx.commit().await.context("committing delete tx")?;
        Ok(affected as usize)
    }

    async fn mark_deleted_by_ids(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context("beginning delete tx")?;
        let now = now_ts();
        let mut affected = 0u64;

        for chunk in ids.chunks(IN_LIST_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE emails SET is_deleted = 1, updated_at = ");
            qb.push_bind(now);
            qb.push(" WHERE is_deleted = 0 AND id IN (");
            {
                let mut separated = qb.separated(", ");
                for id in chunk {
                    separated.push_bind(*id);
                }
            }
            qb.push(")");

            let res = qb
                .build()
                .execute(&mut *tx)
                .await
                .context("soft-deleting emails by id list")?;
            affected += res.rows_affected();
        }

        tx.commit().await.context("committing delete tx")?;
        Ok(affected as usize)
    }

    async fn set_thread_id(&self, email_id: i64, thread_id: &str) -> Result<bool> {
        if thread_id.is_empty() {
            return Ok(false);
        }
        let res = sqlx::query(
            r#"
            UPDATE emails SET thread_id = ?2, updated_at = ?3
            WHERE id = ?1 AND (thread_id IS NULL OR thread_id = '')
            "#,
        )
        .bind(email_id)
        .bind(thread_id)
        .bind(now_ts())
        .execute(&self.pool)
        .await
        .context("setting thread id")?;
        Ok(res.rows_affected() > 0)
    }

    async fn emails_missing_thread(&self, account_id: &str) -> Result<Vec<EmailRecord>> {
        let sql = format!(
            r#"
            SELECT id, {cols} FROM emails
            WHERE account_id = ?1
              AND is_deleted = 0
              AND message_id != ''
              AND (thread_id IS NULL OR thread_id = '')
            ORDER BY date DESC, id DESC
            "#,
            cols = EMAIL_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .context("loading emails missing thread ids")?;
        Ok(rows.iter().map(email_from_row).collect())
    }

    async fn thread_for_message_id(&self, account_id: &str, message_id: &str) -> Result<Option<String>> {
        let thread_id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT thread_id FROM emails
            WHERE account_id = ?1
              AND message_id = ?2 COLLATE NOCASE
              AND is_deleted = 0
              AND thread_id IS NOT NULL AND thread_id != ''
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .context("looking up parent thread")?;
        Ok(thread_id)
    }

    async fn emails_by_ids(&self, ids: &[i64]) -> Result<Vec<EmailRecord>> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(IN_LIST_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT id, {} FROM emails WHERE id IN (", EMAIL_COLUMNS));
            {
                let mut separated = qb.separated(", ");
                for id in chunk {
                    separated.push_bind(*id);
                }
            }
            qb.push(") ORDER BY id");

            let rows = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .context("loading emails by id list")?;
            out.extend(rows.iter().map(email_from_row));
        }
        Ok(out)
    }

    async fn email_by_uid(&self, folder_id: i64, uid: u32) -> Result<Option<EmailRecord>> {
        let sql = format!(
            "SELECT id, {} FROM emails WHERE folder_id = ?1 AND uid = ?2",
            EMAIL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(folder_id)
            .bind(uid as i64)
            .fetch_optional(&self.pool)
            .await
            .context("loading email by uid")?;
        Ok(row.as_ref().map(email_from_row))
    }

    async fn set_archived(&self, folder_id: i64, uid: u32) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE emails SET is_archived = 1, updated_at = ?3 WHERE folder_id = ?1 AND uid = ?2",
        )
        .bind(folder_id)
        .bind(uid as i64)
        .bind(now_ts())
        .execute(&self.pool)
        .await
        .context("marking email archived")?;
        Ok(res.rows_affected() > 0)
    }

    async fn archive_folder_rows(&self, folder_id: i64, reason: &str) -> Result<usize> {
        let moved = self
            .move_to_archive("folder_id = ?1", vec![BindValue::Int(folder_id)], reason)
            .await?;
        // Every archived UID belonged to the old epoch.
        sqlx::query("UPDATE folders SET highest_uid = 0, updated_at = ?2 WHERE id = ?1")
            .bind(folder_id)
            .bind(now_ts())
            .execute(&self.pool)
            .await
            .context("resetting folder highest uid")?;
        if moved > 0 {
            warn!(folder_id, moved, reason, "Moved folder rows into archive");
        }
        Ok(moved)
    }

    async fn archive_deleted_before(
        &self,
        account_id: &str,
        cutoff_ts: i64,
        reason: &str,
    ) -> Result<usize> {
        self.move_to_archive(
            "account_id = ?1 AND is_deleted = 1 AND updated_at < ?2",
            vec![BindValue::Text(account_id.to_string()), BindValue::Int(cutoff_ts)],
            reason,
        )
        .await
    }

    async fn thread_summaries(&self, account_id: &str, limit: usize) -> Result<Vec<ThreadSummary>> {
        let heads = sqlx::query(
            r#"
            SELECT thread_id,
                   COUNT(*) AS message_count,
                   SUM(CASE WHEN is_read = 0 THEN 1 ELSE 0 END) AS unread_count,
                   MAX(date) AS last_date,
                   MAX(has_attachments) AS has_attachments
            FROM emails
            WHERE account_id = ?1
              AND is_deleted = 0
              AND thread_id IS NOT NULL AND thread_id != ''
            GROUP BY thread_id
            ORDER BY last_date DESC
            LIMIT ?2
            "#,
        )
        .bind(account_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("grouping thread summaries")?;

        if heads.is_empty() {
            return Ok(Vec::new());
        }

        let mut summaries: Vec<ThreadSummary> = heads
            .iter()
            .map(|row| ThreadSummary {
                thread_id: row.get("thread_id"),
                subject: String::new(),
                last_sender: String::new(),
                last_date: row.get("last_date"),
                message_count: row.get::<i64, _>("message_count") as usize,
                unread_count: row.get::<i64, _>("unread_count") as usize,
                has_attachments: row.get::<i64, _>("has_attachments") != 0,
                participants: Vec::new(),
            })
            .collect();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT thread_id, subject, from_name, from_email FROM emails WHERE account_id = ",
        );
        qb.push_bind(account_id);
        qb.push(" AND is_deleted = 0 AND thread_id IN (");
        {
            let mut separated = qb.separated(", ");
            for summary in &summaries {
                separated.push_bind(summary.thread_id.clone());
            }
        }
        qb.push(") ORDER BY date DESC, id DESC");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("loading thread members")?;

        let index: HashMap<String, usize> = summaries
            .iter()
            .enumerate()
            .map(|(i, s)| (s.thread_id.clone(), i))
            .collect();

        let mut headed: HashSet<usize> = HashSet::new();
        for row in rows {
            let thread_id: String = row.get("thread_id");
            let Some(&i) = index.get(&thread_id) else {
                continue;
            };
            let summary = &mut summaries[i];
            let from_name: String = row.get("from_name");
            let from_email: String = row.get("from_email");
            let sender = if from_name.is_empty() { from_email.clone() } else { from_name };

            // Rows arrive newest first.
            if headed.insert(i) {
                summary.subject = row.get("subject");
                summary.last_sender = sender;
            }
            if !from_email.is_empty() && !summary.participants.contains(&from_email) {
                summary.participants.push(from_email);
            }
        }

        Ok(summaries)
    }
}

fn folder_from_row(row: &SqliteRow) -> FolderState {
    FolderState {
        id: row.get("id"),
        account_id: row.get("account_id"),
        name: row.get("name"),
        total_count: row.get::<i64, _>("total_count") as u32,
        unread_count: row.get::<i64, _>("unread_count") as u32,
        uidvalidity: row.get::<Option<i64>, _>("uidvalidity").map(|v| v as u32),
        highest_uid: row.get::<i64, _>("highest_uid") as u32,
        last_sync_ts: row.get("last_sync_ts"),
    }
}

fn email_from_row(row: &SqliteRow) -> EmailRecord {
    EmailRecord {
        id: row.get("id"),
        account_id: row.get("account_id"),
        folder_id: row.get("folder_id"),
        uid: row.get::<i64, _>("uid") as u32,
        message_id: row.get("message_id"),
        subject: row.get("subject"),
        from_name: row.get("from_name"),
        from_email: row.get("from_email"),
        to_addrs: row.get("to_addrs"),
        cc_addrs: row.get("cc_addrs"),
        in_reply_to: row.get("in_reply_to"),
        date: row.get("date"),
        is_read: row.get::<i64, _>("is_read") != 0,
        is_starred: row.get::<i64, _>("is_starred") != 0,
        is_archived: row.get::<i64, _>("is_archived") != 0,
        is_deleted: row.get::<i64, _>("is_deleted") != 0,
        is_replied: row.get::<i64, _>("is_replied") != 0,
        thread_id: row.get("thread_id"),
        size_bytes: row.get::<i64, _>("size_bytes") as u32,
        has_attachments: row.get::<i64, _>("has_attachments") != 0,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(custom) = env::var("MAILKEEPER_DATA_DIR") {
        let path = PathBuf::from(custom);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating MAILKEEPER_DATA_DIR at {}", path.display()))?;
        return Ok(path);
    }

    if let Some(home) = home_dir() {
        let path = home.join("mailkeeper");
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        } else {
            warn!(
                "Unable to create {}/mailkeeper; falling back to workspace-local storage",
                home.display()
            );
        }
    }

    let cwd = env::current_dir().context("determining current directory")?;
    let path = cwd.join("mailkeeper-data");
    std::fs::create_dir_all(&path)
        .with_context(|| format!("creating fallback data directory {}", path.display()))?;
    Ok(path)
}
