use thiserror::Error;

pub type SyncOutcome<T> = Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Folder not found: {0}")]
    NoSuchFolder(String),
    #[error("Folder is already syncing: {0}")]
    FolderBusy(String),
    #[error("Thread lookup API is not configured")]
    ThreadApiUnavailable,
    #[error("Remote mailbox error: {0:#}")]
    Remote(anyhow::Error),
    #[error("Local store error: {0:#}")]
    Store(anyhow::Error),
}

impl SyncError {
    pub fn remote(err: anyhow::Error) -> Self {
        SyncError::Remote(err)
    }

    pub fn store(err: anyhow::Error) -> Self {
        SyncError::Store(err)
    }
}
