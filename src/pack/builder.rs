use std::io;

use md5::{Digest, Md5};

use super::{BlockTag, MAGIC, MAX_FORMAT_VERSION};

const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Assembles a pack byte stream from a set of files.
#[derive(Debug, Clone)]
pub struct PackBuilder {
    name: String,
    files: Vec<(String, Vec<u8>)>,
    chunk_size: usize,
}

impl PackBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            files: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn file(mut self, name: &str, contents: Vec<u8>) -> Self {
        self.files.push((name.to_string(), contents));
        self
    }

    /// Maximum payload of each file-chunk block.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.clamp(1, u16::MAX as usize);
        self
    }

    /// Lowercase hex MD5 over every file name and its contents, in order.
    pub fn hash(&self) -> String {
        let mut digest = Md5::new();
        for (name, contents) in &self.files {
            digest.update(name.as_bytes());
            digest.update(contents);
        }
        format!("{:x}", digest.finalize())
    }

    /// Directory the pack unpacks into.
    pub fn dir_name(&self) -> String {
        format!("{}.{}", self.name, self.hash())
    }

    pub fn build(&self) -> io::Result<Vec<u8>> {
        self.build_with_hash(&self.hash())
    }

    /// Builds the pack declaring `hash`, whether or not it matches.
    pub fn build_with_hash(&self, hash: &str) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&MAX_FORMAT_VERSION.to_be_bytes());
        push_block(&mut out, BlockTag::PackName, self.name.as_bytes())?;
        push_block(&mut out, BlockTag::PackHash, hash.as_bytes())?;
        for (name, contents) in &self.files {
            push_block(&mut out, BlockTag::FileName, name.as_bytes())?;
            for chunk in contents.chunks(self.chunk_size) {
                push_block(&mut out, BlockTag::FileChunk, chunk)?;
            }
        }
        push_block(&mut out, BlockTag::PackEnd, b"")?;
        Ok(out)
    }
}

fn push_block(out: &mut Vec<u8>, tag: BlockTag, payload: &[u8]) -> io::Result<()> {
    let length = u16::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{:?} block of {} bytes does not fit", tag, payload.len()),
        )
    })?;
    out.extend_from_slice(tag.as_bytes());
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(())
}
