use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use tokio::fs;
use tokio::sync::RwLock;

use crate::worker::json_file::{read_json, write_json_atomic};
use crate::worker::model::Response;

/// Named partitions of cached responses, one per deployed version.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Partition names, sorted.
    async fn keys(&self) -> anyhow::Result<Vec<String>>;
    async fn delete(&self, partition: &str) -> anyhow::Result<bool>;
    async fn put(&self, partition: &str, key: &str, response: &Response) -> anyhow::Result<()>;
    async fn get(&self, partition: &str, key: &str) -> anyhow::Result<Option<Response>>;

    async fn match_any(&self, key: &str) -> anyhow::Result<Option<Response>> {
        for partition in self.keys().await? {
            if let Some(response) = self.get(&partition, key).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    partitions: RwLock<BTreeMap<String, BTreeMap<String, Response>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.partitions.read().await.keys().cloned().collect())
    }

    async fn delete(&self, partition: &str) -> anyhow::Result<bool> {
        Ok(self.partitions.write().await.remove(partition).is_some())
    }

    async fn put(&self, partition: &str, key: &str, response: &Response) -> anyhow::Result<()> {
        self.partitions
            .write()
            .await
            .entry(partition.to_owned())
            .or_default()
            .insert(key.to_owned(), response.clone());
        Ok(())
    }

    async fn get(&self, partition: &str, key: &str) -> anyhow::Result<Option<Response>> {
        Ok(self
            .partitions
            .read()
            .await
            .get(partition)
            .and_then(|entries| entries.get(key))
            .cloned())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    key: String,
    stored_at: DateTime<Utc>,
    response: Response,
}

/// One directory per partition, one JSON file per cached key.
#[derive(Debug, Clone)]
pub struct LocalFsCacheStorage {
    base_dir: PathBuf,
}

impl LocalFsCacheStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn partitions_dir(&self) -> PathBuf {
        self.base_dir.join("partitions")
    }

    fn partition_dir(&self, partition: &str) -> anyhow::Result<PathBuf> {
        validate_partition_name(partition)?;
        Ok(self.partitions_dir().join(partition))
    }

    fn entry_path(&self, partition: &str, key: &str) -> anyhow::Result<PathBuf> {
        let mut hasher = sha2::Sha256::new();
        hasher.update(key.as_bytes());
        let name = format!("{}.json", hex::encode(hasher.finalize()));
        Ok(self.partition_dir(partition)?.join(name))
    }
}

#[async_trait]
impl CacheStorage for LocalFsCacheStorage {
    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        let dir = self.partitions_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read partitions: {}", dir.display()));
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, partition: &str) -> anyhow::Result<bool> {
        let dir = self.partition_dir(partition)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("delete partition: {}", dir.display())),
        }
    }

    async fn put(&self, partition: &str, key: &str, response: &Response) -> anyhow::Result<()> {
        let path = self.entry_path(partition, key)?;
        let entry = CacheEntry {
            key: key.to_owned(),
            stored_at: Utc::now(),
            response: response.clone(),
        };
        write_json_atomic(&path, &entry)
            .await
            .with_context(|| format!("store {key} in {partition}"))
    }

    async fn get(&self, partition: &str, key: &str) -> anyhow::Result<Option<Response>> {
        let path = self.entry_path(partition, key)?;
        let entry: Option<CacheEntry> = read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?;
        Ok(entry
            .filter(|entry| entry.key == key)
            .map(|entry| entry.response))
    }
}

fn validate_partition_name(partition: &str) -> anyhow::Result<()> {
    let valid = !partition.is_empty()
        && !partition.starts_with('.')
        && partition
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        anyhow::bail!("invalid cache partition name: {partition:?}");
    }
    Ok(())
}
