// Flash filesystem helpers. All paths are relative to the storage root and
// every replacement of a live file goes through write-temp-then-rename.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const TEMP_SUFFIX: &str = ".new";

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel.trim_start_matches('/'))
    }

    pub fn is_dir(&self, rel: &str) -> bool {
        self.path(rel).is_dir()
    }

    pub fn is_file(&self, rel: &str) -> bool {
        self.path(rel).is_file()
    }

    /// Creates every missing parent directory of `rel`. A plain file standing
    /// where a directory is needed gets removed first.
    pub fn make_parent(&self, rel: &str) -> io::Result<()> {
        let parts: Vec<&str> = rel.trim_matches('/').split('/').collect();
        let mut current = self.root.clone();
        for part in &parts[..parts.len().saturating_sub(1)] {
            current.push(part);
            if current.is_file() {
                fs::remove_file(&current)?;
            }
            if !current.is_dir() {
                fs::create_dir(&current)?;
            }
        }
        Ok(())
    }

    /// Opens `rel` for writing from scratch, creating parents as needed.
    pub fn create(&self, rel: &str) -> io::Result<File> {
        self.make_parent(rel)?;
        File::create(self.path(rel))
    }

    /// Opens `rel` for appending, creating it and its parents as needed.
    pub fn open_append(&self, rel: &str) -> io::Result<File> {
        self.make_parent(rel)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(rel))
    }

    pub fn open(&self, rel: &str) -> io::Result<File> {
        File::open(self.path(rel))
    }

    pub fn read(&self, rel: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(rel))
    }

    pub fn read_to_string(&self, rel: &str) -> io::Result<String> {
        fs::read_to_string(self.path(rel))
    }

    /// Replaces `rel` with `data` without ever leaving a partial file at `rel`.
    pub fn write_atomic(&self, rel: &str, data: &[u8]) -> io::Result<()> {
        let temp = format!("{}{}", rel, TEMP_SUFFIX);
        {
            let mut file = self.create(&temp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        self.move_over(&temp, rel)
    }

    pub fn write_json_atomic<T: serde::Serialize>(&self, rel: &str, value: &T) -> anyhow::Result<()> {
        let json = serde_json::to_vec(value)?;
        self.write_atomic(rel, &json)?;
        Ok(())
    }

    /// Renames `from` to `to`, destroying whatever was at `to`.
    pub fn move_over(&self, from: &str, to: &str) -> io::Result<()> {
        self.destroy(to)?;
        self.make_parent(to)?;
        fs::rename(self.path(from), self.path(to))
    }

    /// Removes a file, or a directory and all its descendants. Missing paths
    /// are not an error.
    pub fn destroy(&self, rel: &str) -> io::Result<()> {
        let path = self.path(rel);
        if path.is_dir() {
            fs::remove_dir_all(&path)
        } else if path.exists() {
            fs::remove_file(&path)
        } else {
            Ok(())
        }
    }

    /// Names of the entries directly under the storage root.
    pub fn list_root(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Free bytes on the filesystem holding the root; 0 if unknown.
    pub fn free_bytes(&self) -> u64 {
        fs2::available_space(&self.root).unwrap_or(0)
    }
}
