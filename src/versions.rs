// Installed software versions. Each top-level directory named
// `v<N>.<hash>` (complete) or `v<N>-<M>.<hash>` (patch on top of v<M>) is a
// candidate; zero-byte marker files inside record its status, since
// directories cannot be renamed atomically on the target filesystem.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::storage::Storage;

/// Content verified against the pack hash.
pub const VALID_MARKER: &str = "@VALID";
/// Selected to run.
pub const ENABLED_MARKER: &str = "@ENABLED";
/// Whitespace-separated base directories a patch runs on top of.
pub const PATH_MARKER: &str = "@PATH";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionName {
    pub num: u32,
    /// Base version of a patch directory.
    pub base: Option<u32>,
}

impl VersionName {
    /// Parses a pack name such as `v12` or `v12-11`, or a directory name
    /// such as `v12.<hash>`.
    pub fn parse(name: &str) -> Option<Self> {
        let pack_name = name.split('.').next()?;
        let digits = pack_name.strip_prefix('v')?;
        let (num, base) = match digits.split_once('-') {
            Some((num, base)) => (num, Some(base.parse().ok()?)),
            None => (digits, None),
        };
        Some(Self { num: num.parse().ok()?, base })
    }

    pub fn is_complete(&self) -> bool {
        self.base.is_none()
    }
}

/// One entry of the update index: `{"hash": ..., "url": ..., "enabled": ...}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexEntry {
    pub hash: String,
    pub url: String,
    pub enabled: bool,
}

impl IndexEntry {
    pub fn dir_name(&self, pack_name: &str) -> String {
        format!("{}.{}", pack_name, self.hash)
    }
}

/// The newest enabled entry of an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub num: u32,
    pub url: String,
    pub dir_name: String,
}

/// Picks the highest-numbered enabled entry, preferring a complete directory
/// over a patch of the same number. Entries without a hash, a url or a
/// `v<N>` name are ignored.
pub fn select_latest_enabled(packs: &BTreeMap<String, IndexEntry>) -> Option<Selection> {
    let mut latest: Option<(u32, bool, Selection)> = None;
    for (pack_name, entry) in packs {
        let parsed = VersionName::parse(pack_name);
        let Some(name) = parsed.filter(|_| !entry.hash.is_empty() && !entry.url.is_empty()) else {
            warn!("Ignoring invalid pack entry: {}", pack_name);
            continue;
        };
        if !entry.enabled {
            continue;
        }
        let candidate = Selection {
            num: name.num,
            url: entry.url.clone(),
            dir_name: entry.dir_name(pack_name),
        };
        let key = (name.num, name.is_complete());
        let better = match &latest {
            None => true,
            Some((num, complete, current)) => match key.cmp(&(*num, *complete)) {
                Ordering::Greater => true,
                Ordering::Equal => candidate.dir_name > current.dir_name,
                Ordering::Less => false,
            },
        };
        if better {
            latest = Some((key.0, key.1, candidate));
        }
    }
    latest.map(|(_, _, selection)| selection)
}

#[derive(Debug, Clone)]
pub struct VersionStore {
    storage: Storage,
}

impl VersionStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Every installed version directory, in name order.
    pub fn candidates(&self) -> io::Result<Vec<(VersionName, String)>> {
        let mut found = Vec::new();
        for name in self.storage.list_root()? {
            if !name.contains('.') || !self.storage.is_dir(&name) {
                continue;
            }
            if let Some(version) = VersionName::parse(&name) {
                found.push((version, name));
            }
        }
        Ok(found)
    }

    pub fn has_marker(&self, dir_name: &str, marker: &str) -> bool {
        self.storage.is_file(&format!("{}/{}", dir_name, marker))
    }

    pub fn is_valid(&self, dir_name: &str) -> bool {
        self.has_marker(dir_name, VALID_MARKER)
    }

    pub fn set_enabled(&self, dir_name: &str, enabled: bool) -> io::Result<()> {
        let marker = format!("{}/{}", dir_name, ENABLED_MARKER);
        if enabled {
            self.storage.write_atomic(&marker, b"")
        } else {
            self.storage.destroy(&marker)
        }
    }

    /// Directories searched when running `dir_name`: the directory itself,
    /// then the base directories listed in its `@PATH` file.
    pub fn search_path(&self, dir_name: &str) -> Vec<String> {
        let mut path = vec![dir_name.to_string()];
        if let Ok(text) = self.storage.read_to_string(&format!("{}/{}", dir_name, PATH_MARKER)) {
            for dir in text.split_whitespace() {
                if !path.iter().any(|known| known == dir) {
                    path.push(dir.to_string());
                }
            }
        }
        path
    }

    /// True if every directory on the search path, the directory itself
    /// included, is `@VALID`.
    pub fn is_usable(&self, dir_name: &str) -> bool {
        self.search_path(dir_name).iter().all(|dir| self.is_valid(dir))
    }

    /// Enabled and usable.
    pub fn is_runnable(&self, dir_name: &str) -> bool {
        self.has_marker(dir_name, ENABLED_MARKER) && self.is_usable(dir_name)
    }

    /// The runnable candidate with the greatest `(N, name)`. At equal N a
    /// complete directory (`v3.`) sorts after a patch (`v3-2.`).
    pub fn select_boot(&self) -> io::Result<Option<(VersionName, String)>> {
        let runnable = self
            .candidates()?
            .into_iter()
            .filter(|(_, name)| self.is_runnable(name));
        Ok(runnable.max_by(|(a, a_name), (b, b_name)| (a.num, a_name).cmp(&(b.num, b_name))))
    }

    /// Names of all installed version directories.
    pub fn versions_present(&self) -> Vec<String> {
        self.candidates()
            .map(|found| found.into_iter().map(|(_, name)| name).collect())
            .unwrap_or_default()
    }

    /// Rewrites `@ENABLED` for every installed directory named by the index
    /// and returns the highest version number that is enabled and usable.
    pub fn write_enabled_flags(&self, packs: &BTreeMap<String, IndexEntry>) -> io::Result<u32> {
        let mut latest = 0;
        for (pack_name, entry) in packs {
            let dir_name = entry.dir_name(pack_name);
            if entry.hash.is_empty() || !self.storage.is_dir(&dir_name) {
                continue;
            }
            let usable = entry.enabled && self.is_usable(&dir_name);
            self.set_enabled(&dir_name, usable)?;
            if usable {
                debug!("Enabled: {}", dir_name);
                if let Some(version) = VersionName::parse(pack_name) {
                    latest = latest.max(version.num);
                }
            } else {
                debug!("Disabled: {}", dir_name);
            }
        }
        info!("Latest usable version: v{}", latest);
        Ok(latest)
    }
}
