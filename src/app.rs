use crate::cli::{Cli, Command};
use crate::config::{account_from_env, load_credential, SyncConfig};
use crate::imap::{ImapMailbox, SessionHandle};
use crate::storage::{default_data_dir, Database};
use crate::sync::SyncEngine;
use crate::threads::{BackfillProgress, GmailThreadApi};
use crate::types::{Provider, SyncResult};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DB_FILE_NAME: &str = "mailkeeper.db";

pub async fn run(cli: Cli) -> Result<()> {
    let data_dir = default_data_dir()?;
    let config = SyncConfig::load(&data_dir)?;
    let db = Arc::new(Database::open(&data_dir.join(DB_FILE_NAME)).await?);
    info!(path = %db.path().display(), "Using SQLite store");

    let account = account_from_env()?;
    let credential = load_credential(&account)?;
    let mailbox = ImapMailbox::connect(&account, &credential).await?;
    let session = SessionHandle::new(&account.id, mailbox);

    let mut engine = SyncEngine::new(account.clone(), config.clone(), db.clone(), session);
    match (credential.access_token(), &account.provider) {
        (Some(token), Provider::GmailImap) => {
            let api = GmailThreadApi::new(
                token,
                config.thread_page_size,
                config.thread_lookup_concurrency,
            )?;
            engine = engine.with_thread_api(Arc::new(api));
        }
        _ => info!(account = %account.id, "No Gmail access token; thread backfill disabled"),
    }

    let outcome = dispatch(&engine, cli.command).await;
    engine.shutdown().await;
    outcome
}

async fn dispatch(engine: &SyncEngine, command: Command) -> Result<()> {
    match command {
        Command::Sync { folder: Some(folder), .. } => {
            let result = engine.sync_folder(&folder).await?;
            print_results(&[result]);
        }
        Command::Sync { folder: None, all: true } => {
            engine.load_folders().await?;
            let results = engine.sync_all_folders().await?;
            print_results(&results);
        }
        Command::Sync { folder: None, all: false } => {
            let results = engine.sync_essential_folders().await?;
            print_results(&results);
        }
        Command::Purge { folder, uids } if uids.is_empty() => {
            let deleted = engine.purge_deleted(&folder).await?;
            println!("{}: {} email(s) marked deleted", folder, deleted);
        }
        Command::Purge { folder, uids } => {
            let absent = engine.purge_specific_uids(&folder, &uids).await?;
            println!("{}: {} of {} UID(s) gone from server {:?}", folder, absent.len(), uids.len(), absent);
        }
        Command::Threads => {
            let cancel = CancellationToken::new();
            let watcher = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping thread backfill");
                    watcher.cancel();
                }
            });

            let report = engine
                .sync_thread_ids(
                    |progress| match progress {
                        BackfillProgress::Listing { page, found } => {
                            info!(page, found, "Listing upstream messages");
                        }
                        BackfillProgress::Fetching { processed, total } => {
                            if processed % 50 == 0 || processed == total {
                                info!(processed, total, "Resolving thread ids");
                            }
                        }
                    },
                    &cancel,
                )
                .await?;
            println!(
                "threads: {} resolved, {} not found, {} failed, {} skipped{}",
                report.resolved,
                report.not_found,
                report.failed,
                report.skipped,
                if report.cancelled { " (cancelled)" } else { "" }
            );
        }
        Command::Folders => {
            for folder in engine.load_folders().await? {
                println!(
                    "{:<40} total {:>6}  unread {:>5}  last sync {}",
                    folder.name,
                    folder.total_count,
                    folder.unread_count,
                    format_ts(folder.last_sync_ts)
                );
            }
        }
        Command::Summaries { limit } => {
            let summaries = engine.thread_summaries(limit).await?;
            if summaries.is_empty() {
                println!("No threads found");
            }
            for (i, t) in summaries.iter().enumerate() {
                let subject = if t.subject.is_empty() { "(No Subject)" } else { t.subject.as_str() };
                println!(
                    "{}. [{}] {} ({} messages, {} unread{})",
                    i + 1,
                    format_ts(t.last_date),
                    subject,
                    t.message_count,
                    t.unread_count,
                    if t.has_attachments { ", attachments" } else { "" }
                );
                println!("   Last from: {}", t.last_sender);
                println!("   Participants: {}", t.participants.join(", "));
            }
        }
        Command::Retire { days } => {
            let moved = engine.archive_retired(days).await?;
            println!("{} deleted email(s) moved to the archive table", moved);
        }
        Command::Archive { folder, uid } => {
            let flagged = engine.archive_email(&folder, uid).await?;
            if !flagged {
                warn!(folder = %folder, uid, "Archived on server but no local row matched");
            }
            println!("{} uid {} moved to {}", folder, uid, engine.config().archive_folder);
        }
    }
    Ok(())
}

fn print_results(results: &[SyncResult]) {
    for r in results {
        let status = if r.errors.is_empty() { "ok" } else { "error" };
        println!(
            "{:<24} [{}] new {:>4}  deleted {:>4}  latest uid {}",
            r.folder, status, r.new_emails, r.deleted, r.latest_uid
        );
        for e in &r.errors {
            println!("   {}", e);
        }
    }
}

fn format_ts(ts: Option<i64>) -> String {
    ts.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}
