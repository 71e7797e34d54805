// Update-pack format: magic `pk`, a big-endian u16 format version, then
// blocks of `tag(2) + length(u16 BE) + payload`. The MD5 of every file name
// and file chunk, in block order, must match the declared pack hash.

pub mod builder;
pub mod source;
pub mod unpacker;

pub use builder::PackBuilder;
pub use source::{ByteSource, FetchSource, MemorySource};
pub use unpacker::{PackUnpacker, UnpackStatus};

use thiserror::Error;

use crate::http::FetchError;
use crate::ErrorClass;

pub const MAGIC: &[u8; 2] = b"pk";
pub const MAX_FORMAT_VERSION: u16 = 1;

/// Upper bound on the bytes handled per block step, so large file chunks
/// never need to be buffered whole.
pub const CHUNK_LENGTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    PackName,
    PackHash,
    FileName,
    FileChunk,
    PackEnd,
}

impl BlockTag {
    pub fn from_bytes(tag: [u8; 2]) -> Option<Self> {
        match &tag {
            b"pn" => Some(BlockTag::PackName),
            b"ph" => Some(BlockTag::PackHash),
            b"fn" => Some(BlockTag::FileName),
            b"fc" => Some(BlockTag::FileChunk),
            b"pe" => Some(BlockTag::PackEnd),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &'static [u8; 2] {
        match self {
            BlockTag::PackName => b"pn",
            BlockTag::PackHash => b"ph",
            BlockTag::FileName => b"fn",
            BlockTag::FileChunk => b"fc",
            BlockTag::PackEnd => b"pe",
        }
    }
}

#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("invalid pack magic {0:?}")]
    BadMagic([u8; 2]),
    #[error("unsupported pack format version {0}")]
    UnsupportedVersion(u16),
    #[error("{0:?} block of {1} bytes is too long")]
    OversizedBlock(String, usize),
    #[error("{0} block arrived before the pack name and hash")]
    OutOfOrder(&'static str),
    #[error("invalid file name {0:?} in pack")]
    BadFileName(String),
    #[error("pack exceeded limit of {0} bytes")]
    SizeExceeded(u64),
    #[error("bad MD5 hash {actual}; expected {expected}")]
    HashMismatch { expected: String, actual: String },
    #[error("pack stream ended before the pack-end block")]
    Truncated,
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

impl UnpackError {
    pub fn kind(&self) -> ErrorClass {
        match self {
            UnpackError::HashMismatch { .. } | UnpackError::SizeExceeded(_) => ErrorClass::Integrity,
            UnpackError::Fetch(e) => e.kind(),
            UnpackError::Truncated | UnpackError::Io(_) => ErrorClass::Transient,
            _ => ErrorClass::Protocol,
        }
    }
}
