use clap::{Parser, Subcommand};

/// Command-line options for mailkeeper.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sync the essential folders, a single folder with --folder, or every known folder with --all.
    Sync {
        #[arg(long, conflicts_with = "all")]
        folder: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Soft-delete local emails the server no longer has.
    Purge {
        folder: String,
        /// Check only these UIDs (comma separated) instead of the whole folder.
        #[arg(long, value_delimiter = ',')]
        uids: Vec<u32>,
    },
    /// Backfill thread ids for every local email that lacks one. Ctrl-C stops early.
    Threads,
    /// List server folders and record them locally.
    Folders,
    /// Print the most recent conversation threads.
    Summaries {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Move emails soft-deleted more than N days ago into the archive table.
    Retire {
        #[arg(long)]
        days: u32,
    },
    /// Move one email to the archive folder on the server.
    Archive {
        folder: String,
        uid: u32,
    },
}
