use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed key of the single offline status record.
pub const OFFLINE_STATUS_ID: &str = "cache";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub level: u8,
    pub title: String,
    pub content: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullTextMeta {
    pub route: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub sections: Vec<Section>,
    #[serde(rename = "mdFileHash")]
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineManifest {
    pub generated_at: DateTime<Utc>,
    pub routes: Vec<String>,
    pub assets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text_metas: Option<Vec<FullTextMeta>>,
}

impl OfflineManifest {
    /// Every path the worker should warm, routes first.
    pub fn cacheable_paths(&self) -> impl Iterator<Item = &str> {
        self.routes
            .iter()
            .chain(self.assets.iter())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    NotStarted,
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OfflineStatus {
    pub id: String,
    pub state: CacheState,
    pub version: String,
    pub total: usize,
    pub cached: usize,
    pub failed: usize,
    /// Search-index hashes already stored, keyed by document route.
    #[serde(default)]
    pub doc_hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl OfflineStatus {
    pub fn not_started(version: &str) -> Self {
        Self {
            id: OFFLINE_STATUS_ID.to_owned(),
            state: CacheState::NotStarted,
            version: version.to_owned(),
            total: 0,
            cached: 0,
            failed: 0,
            doc_hashes: BTreeMap::new(),
            message: None,
            updated_at: Utc::now(),
        }
    }

    pub fn progress_percent(&self) -> u32 {
        if self.total == 0 {
            return match self.state {
                CacheState::Complete => 100,
                _ => 0,
            };
        }
        let done = (self.cached + self.failed).min(self.total);
        ((done * 100) / self.total) as u32
    }
}
