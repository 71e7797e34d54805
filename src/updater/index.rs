use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::storage::Storage;
use crate::versions::IndexEntry;

/// The update index: `{"name": ..., "updated": ..., "packs": {dir: entry}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackIndex {
    pub name: String,
    pub updated: String,
    pub packs: BTreeMap<String, IndexEntry>,
}

impl PackIndex {
    pub fn load(storage: &Storage, rel: &str) -> Result<Self> {
        let bytes = storage.read(rel).with_context(|| format!("Failed to read /{}", rel))?;
        serde_json::from_slice(&bytes).with_context(|| format!("Unreadable index file /{}", rel))
    }
}
