use std::path::{Path, PathBuf};

use anyhow::Context as _;
use tokio::sync::watch;

use crate::formats::{OFFLINE_STATUS_ID, OfflineStatus};
use crate::worker::json_file::{read_json, remove_file_if_exists, write_json_atomic};

/// The single offline status record, observable through [`StatusStore::subscribe`].
///
/// Created once per process and handed to whoever needs it. Only the worker
/// writes; pages read through a subscription.
#[derive(Debug)]
pub struct StatusStore {
    tx: watch::Sender<Option<OfflineStatus>>,
    path: Option<PathBuf>,
}

impl StatusStore {
    pub fn in_memory() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx, path: None }
    }

    /// Opens the record persisted under `dir`, if any.
    pub async fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = dir.as_ref().join(format!("{OFFLINE_STATUS_ID}.json"));
        let existing: Option<OfflineStatus> = read_json(&path)
            .await
            .with_context(|| format!("read status: {}", path.display()))?;
        let (tx, _rx) = watch::channel(existing);
        Ok(Self {
            tx,
            path: Some(path),
        })
    }

    pub fn current(&self) -> Option<OfflineStatus> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<OfflineStatus>> {
        self.tx.subscribe()
    }

    pub async fn put(&self, status: OfflineStatus) -> anyhow::Result<()> {
        if let Some(path) = &self.path {
            write_json_atomic(path, &status)
                .await
                .with_context(|| format!("write status: {}", path.display()))?;
        }
        self.tx.send_replace(Some(status));
        Ok(())
    }

    /// Applies `f` to the current record and stores the result.
    pub async fn update<F>(&self, f: F) -> anyhow::Result<Option<OfflineStatus>>
    where
        F: FnOnce(&mut OfflineStatus),
    {
        let Some(mut status) = self.current() else {
            return Ok(None);
        };
        f(&mut status);
        status.updated_at = chrono::Utc::now();
        self.put(status.clone()).await?;
        Ok(Some(status))
    }

    pub async fn reset(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.path {
            remove_file_if_exists(path).await?;
        }
        self.tx.send_replace(None);
        Ok(())
    }
}
