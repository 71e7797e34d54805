use std::fs::File;
use std::io::Write;

use log::{debug, info, warn};
use md5::{Digest, Md5};

use super::{BlockTag, ByteSource, UnpackError, CHUNK_LENGTH, MAGIC, MAX_FORMAT_VERSION};
use crate::storage::Storage;
use crate::stream_buffer::StreamBuffer;
use crate::versions::{ENABLED_MARKER, VALID_MARKER};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnpackStatus {
    InProgress,
    /// The pack was written and verified into this directory.
    Complete(String),
    /// The target directory was already valid; nothing was written.
    AlreadyValid(String),
}

impl UnpackStatus {
    pub fn is_done(&self) -> bool {
        !matches!(self, UnpackStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Magic,
    BlockHeader,
    BlockContent { tag: [u8; 2], remaining: usize },
    Finished,
}

/// Streaming parser that writes a pack into `<name>.<hash>/` under the
/// storage root as its bytes arrive.
pub struct PackUnpacker {
    storage: Storage,
    max_unpacked_size: u64,
    buffer: StreamBuffer,
    stage: Stage,
    unpacked_size: u64,
    pack_name: String,
    pack_hash: String,
    dir_name: Option<String>,
    file: Option<File>,
    digest: Md5,
    source_ended: bool,
    outcome: UnpackStatus,
}

impl PackUnpacker {
    pub fn new(storage: Storage, max_unpacked_size: u64) -> Self {
        Self {
            storage,
            max_unpacked_size,
            buffer: StreamBuffer::new(),
            stage: Stage::Magic,
            unpacked_size: 0,
            pack_name: String::new(),
            pack_hash: String::new(),
            dir_name: None,
            file: None,
            digest: Md5::new(),
            source_ended: false,
            outcome: UnpackStatus::InProgress,
        }
    }

    /// Target directory, known once the pack-hash block has been read.
    pub fn dir_name(&self) -> Option<&str> {
        self.dir_name.as_deref()
    }

    pub fn unpacked_size(&self) -> u64 {
        self.unpacked_size
    }

    /// Pulls at most once from `source` and processes every complete unit
    /// now buffered.
    pub fn step(&mut self, source: &mut dyn ByteSource) -> Result<UnpackStatus, UnpackError> {
        if self.stage == Stage::Finished {
            return Ok(self.outcome.clone());
        }
        if self.buffer.len() < self.needed() && !self.source_ended {
            match source.pull()? {
                Some(bytes) => self.buffer.extend(&bytes),
                None => self.source_ended = true,
            }
        }

        while self.stage != Stage::Finished && self.buffer.len() >= self.needed() {
            if let Some(status) = self.advance()? {
                self.finish(status);
            }
        }

        if self.stage == Stage::Finished {
            return Ok(self.outcome.clone());
        }
        if self.source_ended {
            self.file = None;
            return Err(UnpackError::Truncated);
        }
        Ok(UnpackStatus::InProgress)
    }

    /// Bytes that must be buffered before the current stage can progress.
    fn needed(&self) -> usize {
        match self.stage {
            Stage::Magic | Stage::BlockHeader => 4,
            Stage::BlockContent { remaining, .. } => remaining.min(CHUNK_LENGTH),
            Stage::Finished => 0,
        }
    }

    fn advance(&mut self) -> Result<Option<UnpackStatus>, UnpackError> {
        match self.stage {
            Stage::Magic => {
                let header = self.buffer.take(4);
                let magic = [header[0], header[1]];
                if &magic != MAGIC {
                    return Err(UnpackError::BadMagic(magic));
                }
                let version = u16::from_be_bytes([header[2], header[3]]);
                if version > MAX_FORMAT_VERSION {
                    return Err(UnpackError::UnsupportedVersion(version));
                }
                info!("Receiving pack version {}", version);
                self.stage = Stage::BlockHeader;
                Ok(None)
            }
            Stage::BlockHeader => {
                let header = self.buffer.take(4);
                let tag = [header[0], header[1]];
                let length = u16::from_be_bytes([header[2], header[3]]) as usize;
                if length > CHUNK_LENGTH && BlockTag::from_bytes(tag) != Some(BlockTag::FileChunk) {
                    return Err(UnpackError::OversizedBlock(
                        String::from_utf8_lossy(&tag).into_owned(),
                        length,
                    ));
                }
                self.stage = Stage::BlockContent { tag, remaining: length };
                Ok(None)
            }
            Stage::BlockContent { tag, remaining } => {
                let count = remaining.min(CHUNK_LENGTH);
                let content = self.buffer.take(count);
                let remaining = remaining - count;
                self.stage = if remaining == 0 {
                    Stage::BlockHeader
                } else {
                    Stage::BlockContent { tag, remaining }
                };
                self.handle_block(tag, &content)
            }
            Stage::Finished => Ok(None),
        }
    }

    fn handle_block(&mut self, tag: [u8; 2], content: &[u8]) -> Result<Option<UnpackStatus>, UnpackError> {
        let Some(block) = BlockTag::from_bytes(tag) else {
            debug!("Skipping unknown {:?} block", String::from_utf8_lossy(&tag));
            return Ok(None);
        };
        if content.len() < 20 {
            debug!("Received {:?} block {:?}", block, String::from_utf8_lossy(content));
        } else {
            debug!("Received {:?} block ({} bytes)", block, content.len());
        }

        match block {
            BlockTag::PackName => {
                self.pack_name = String::from_utf8_lossy(content).replace('/', "");
            }
            BlockTag::PackHash => {
                if self.pack_name.is_empty() {
                    return Err(UnpackError::OutOfOrder("pack-hash"));
                }
                self.pack_hash = String::from_utf8_lossy(content).replace('/', "");
                let dir_name = format!("{}.{}", self.pack_name, self.pack_hash);
                if self.storage.is_dir(&dir_name) {
                    if self.storage.is_file(&format!("{}/{}", dir_name, VALID_MARKER)) {
                        info!("{} already exists and is valid", dir_name);
                        return Ok(Some(UnpackStatus::AlreadyValid(dir_name)));
                    }
                    info!("Removing incomplete {}", dir_name);
                    self.storage.destroy(&dir_name)?;
                }
                self.dir_name = Some(dir_name);
            }
            BlockTag::FileName => {
                let dir_name = self.dir_name.as_ref().ok_or(UnpackError::OutOfOrder("file-name"))?;
                let name = std::str::from_utf8(content)
                    .map_err(|_| UnpackError::BadFileName(String::from_utf8_lossy(content).into_owned()))?;
                if !is_safe_file_name(name) {
                    return Err(UnpackError::BadFileName(name.to_string()));
                }
                self.file = Some(self.storage.create(&format!("{}/{}", dir_name, name))?);
                self.digest.update(content);
            }
            BlockTag::FileChunk => {
                let file = self.file.as_mut().ok_or(UnpackError::OutOfOrder("file-chunk"))?;
                self.unpacked_size += content.len() as u64;
                if self.unpacked_size > self.max_unpacked_size {
                    return Err(UnpackError::SizeExceeded(self.max_unpacked_size));
                }
                self.digest.update(content);
                file.write_all(content)?;
            }
            BlockTag::PackEnd => {
                let dir_name = self.dir_name.clone().ok_or(UnpackError::OutOfOrder("pack-end"))?;
                if let Some(file) = self.file.take() {
                    file.sync_all()?;
                }
                let actual = format!("{:x}", self.digest.clone().finalize());
                if !actual.eq_ignore_ascii_case(&self.pack_hash) {
                    warn!("Pack {} failed verification", dir_name);
                    return Err(UnpackError::HashMismatch {
                        expected: self.pack_hash.clone(),
                        actual,
                    });
                }
                self.storage
                    .write_atomic(&format!("{}/{}", dir_name, VALID_MARKER), b"")?;
                info!(
                    "Pack {} unpacked successfully ({} bytes)",
                    dir_name, self.unpacked_size
                );
                return Ok(Some(UnpackStatus::Complete(dir_name)));
            }
        }
        Ok(None)
    }

    fn finish(&mut self, status: UnpackStatus) {
        self.file = None;
        self.buffer.clear();
        self.stage = Stage::Finished;
        self.outcome = status;
    }
}

/// Relative path with no empty, `.` or `..` components. `@PATH` ships with
/// patch packs; `@VALID` and `@ENABLED` are only ever written on the device.
fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != VALID_MARKER
        && name != ENABLED_MARKER
        && name
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{MemorySource, PackBuilder};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn run(unpacker: &mut PackUnpacker, source: &mut MemorySource) -> Result<UnpackStatus, UnpackError> {
        for _ in 0..10_000 {
            let status = unpacker.step(source)?;
            if status.is_done() {
                return Ok(status);
            }
        }
        panic!("unpacker did not finish");
    }

    fn sample() -> PackBuilder {
        PackBuilder::new("v3")
            .file("main.py", b"print('hello')\n".to_vec())
            .file("lib/fonts/big.bin", (0..5000u32).map(|i| (i % 251) as u8).collect())
            .file("empty.txt", Vec::new())
    }

    #[test]
    fn unpacks_and_marks_valid() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let pack = sample();
        let mut source = MemorySource::new(&pack.build().unwrap(), 700);

        let mut unpacker = PackUnpacker::new(storage.clone(), 1 << 20);
        let status = run(&mut unpacker, &mut source).unwrap();

        let dir_name = pack.dir_name();
        assert_eq!(status, UnpackStatus::Complete(dir_name.clone()));
        assert_eq!(storage.read(&format!("{}/main.py", dir_name)).unwrap(), b"print('hello')\n");
        assert_eq!(storage.read(&format!("{}/lib/fonts/big.bin", dir_name)).unwrap().len(), 5000);
        assert!(storage.read(&format!("{}/empty.txt", dir_name)).unwrap().is_empty());
        assert!(storage.is_file(&format!("{}/@VALID", dir_name)));
        assert_eq!(unpacker.unpacked_size(), 5015);
    }

    #[test]
    fn hash_mismatch_leaves_no_valid_marker() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let bogus = "0123456789abcdef0123456789abcdef";
        let bytes = sample().build_with_hash(bogus).unwrap();

        let mut unpacker = PackUnpacker::new(storage.clone(), 1 << 20);
        let error = run(&mut unpacker, &mut MemorySource::new(&bytes, 512)).unwrap_err();

        assert!(matches!(error, UnpackError::HashMismatch { .. }));
        assert_eq!(error.kind(), crate::ErrorClass::Integrity);
        assert!(storage.is_file(&format!("v3.{}/main.py", bogus)));
        assert!(!storage.is_file(&format!("v3.{}/@VALID", bogus)));
    }

    #[test]
    fn valid_directory_short_circuits() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let pack = sample();
        let bytes = pack.build().unwrap();
        run(&mut PackUnpacker::new(storage.clone(), 1 << 20), &mut MemorySource::new(&bytes, 4096)).unwrap();
        storage
            .write_atomic(&format!("{}/main.py", pack.dir_name()), b"untouched")
            .unwrap();

        // Only the header blocks fit in the first pull
        let mut source = MemorySource::new(&bytes, 64);
        let mut unpacker = PackUnpacker::new(storage.clone(), 1 << 20);
        let status = run(&mut unpacker, &mut source).unwrap();

        assert_eq!(status, UnpackStatus::AlreadyValid(pack.dir_name()));
        assert_eq!(source.pulls(), 1);
        assert_eq!(storage.read(&format!("{}/main.py", pack.dir_name())).unwrap(), b"untouched");
        assert_eq!(unpacker.step(&mut source).unwrap(), status);
        assert_eq!(source.pulls(), 1);
    }

    #[test]
    fn incomplete_directory_is_replaced() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let pack = sample();
        storage
            .write_atomic(&format!("{}/stale.py", pack.dir_name()), b"left over")
            .unwrap();

        let bytes = pack.build().unwrap();
        run(&mut PackUnpacker::new(storage.clone(), 1 << 20), &mut MemorySource::new(&bytes, 300)).unwrap();
        assert!(!storage.is_file(&format!("{}/stale.py", pack.dir_name())));
        assert!(storage.is_file(&format!("{}/@VALID", pack.dir_name())));
    }

    #[test]
    fn size_ceiling_stops_before_writing_past_it() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let pack = PackBuilder::new("v9").file("blob.bin", vec![7u8; 4000]);
        let bytes = pack.build().unwrap();

        let mut unpacker = PackUnpacker::new(storage.clone(), 2500);
        let error = run(&mut unpacker, &mut MemorySource::new(&bytes, 1460)).unwrap_err();

        assert!(matches!(error, UnpackError::SizeExceeded(2500)));
        drop(unpacker);
        let written = storage.read(&format!("{}/blob.bin", pack.dir_name())).unwrap();
        assert!(written.len() <= 2500);
        assert_eq!(written.len(), 2048);
        assert!(!storage.is_file(&format!("{}/@VALID", pack.dir_name())));
    }

    #[test]
    fn rejects_bad_magic_and_future_versions() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());

        let mut unpacker = PackUnpacker::new(storage.clone(), 1 << 20);
        let error = unpacker.step(&mut MemorySource::new(b"PK\x00\x01", 16)).unwrap_err();
        assert!(matches!(error, UnpackError::BadMagic(_)));

        let mut unpacker = PackUnpacker::new(storage, 1 << 20);
        let error = unpacker.step(&mut MemorySource::new(b"pk\x00\x02", 16)).unwrap_err();
        assert!(matches!(error, UnpackError::UnsupportedVersion(2)));
        assert_eq!(error.kind(), crate::ErrorClass::Protocol);
    }

    #[test]
    fn stream_ending_early_is_truncation() {
        let dir = TempDir::new().unwrap();
        let bytes = sample().build().unwrap();
        let mut unpacker = PackUnpacker::new(Storage::new(dir.path()), 1 << 20);
        let error = run(&mut unpacker, &mut MemorySource::new(&bytes[..bytes.len() - 10], 512)).unwrap_err();
        assert!(matches!(error, UnpackError::Truncated));
    }

    #[test]
    fn patch_pack_carries_search_path() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let pack = PackBuilder::new("v2-1")
            .file("main.py", b"print('patched')\n".to_vec())
            .file("@PATH", b"v2-1.x v1.aa".to_vec());
        let mut source = MemorySource::new(&pack.build().unwrap(), 300);

        let mut unpacker = PackUnpacker::new(storage.clone(), 1 << 20);
        let status = run(&mut unpacker, &mut source).unwrap();

        let dir_name = pack.dir_name();
        assert_eq!(status, UnpackStatus::Complete(dir_name.clone()));
        assert_eq!(storage.read(&format!("{}/@PATH", dir_name)).unwrap(), b"v2-1.x v1.aa");
        assert!(storage.is_file(&format!("{}/@VALID", dir_name)));
    }

    #[test]
    fn forged_markers_are_rejected() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let bytes = PackBuilder::new("v4")
            .file("@ENABLED", Vec::new())
            .build()
            .unwrap();

        let mut unpacker = PackUnpacker::new(storage, 1 << 20);
        let error = run(&mut unpacker, &mut MemorySource::new(&bytes, 512)).unwrap_err();
        assert!(matches!(error, UnpackError::BadFileName(ref name) if name == "@ENABLED"));
    }

    #[test]
    fn rejects_escaping_file_names() {
        assert!(is_safe_file_name("lib/app.py"));
        assert!(!is_safe_file_name("../boot.py"));
        assert!(!is_safe_file_name("/etc/passwd"));
        assert!(!is_safe_file_name("@VALID"));
        assert!(!is_safe_file_name("@ENABLED"));
        assert!(is_safe_file_name("@PATH"));
        assert!(!is_safe_file_name("lib//x"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn arbitrary_packs_unpack_exactly(
            files in prop::collection::btree_map("[a-z]{1,8}(/[a-z]{1,8})?", prop::collection::vec(any::<u8>(), 0..3000), 1..5),
            chunk_size in 1usize..2000,
            read_size in 1usize..1500,
        ) {
            // A name cannot be both a file and a directory
            prop_assume!(files.keys().all(|a| files.keys().all(|b| !b.starts_with(&format!("{}/", a)))));

            let dir = TempDir::new().unwrap();
            let storage = Storage::new(dir.path());
            let mut pack = PackBuilder::new("v5").chunk_size(chunk_size);
            for (name, contents) in &files {
                pack = pack.file(name, contents.clone());
            }

            let mut unpacker = PackUnpacker::new(storage.clone(), 1 << 20);
            let status = run(&mut unpacker, &mut MemorySource::new(&pack.build().unwrap(), read_size)).unwrap();
            prop_assert_eq!(status, UnpackStatus::Complete(pack.dir_name()));
            for (name, contents) in &files {
                prop_assert_eq!(&storage.read(&format!("{}/{}", pack.dir_name(), name)).unwrap(), contents);
            }
        }
    }
}
