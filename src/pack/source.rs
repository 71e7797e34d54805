use std::collections::VecDeque;

use crate::http::{FetchError, FetchEvent, HttpFetcher};
use crate::network::{NetworkLink, Radio};

/// An incremental byte stream. `pull` never blocks: `Some` with an empty
/// vector means nothing is available yet, `None` means the stream is over.
pub trait ByteSource {
    fn pull(&mut self) -> Result<Option<Vec<u8>>, FetchError>;
}

/// Feeds the body of an in-progress fetch.
pub struct FetchSource<'a, R: Radio> {
    fetcher: &'a mut HttpFetcher,
    link: &'a mut NetworkLink<R>,
}

impl<'a, R: Radio> FetchSource<'a, R> {
    pub fn new(fetcher: &'a mut HttpFetcher, link: &'a mut NetworkLink<R>) -> Self {
        Self { fetcher, link }
    }
}

impl<R: Radio> ByteSource for FetchSource<'_, R> {
    fn pull(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        match self.fetcher.read(self.link)? {
            FetchEvent::Data(data) => Ok(Some(data)),
            FetchEvent::Pending => Ok(Some(Vec::new())),
            FetchEvent::Done(_) => Ok(None),
        }
    }
}

/// Serves an in-memory byte string in fixed-size pieces.
#[derive(Debug, Clone)]
pub struct MemorySource {
    chunks: VecDeque<Vec<u8>>,
    pulls: usize,
}

impl MemorySource {
    pub fn new(bytes: &[u8], chunk_size: usize) -> Self {
        let chunks = bytes.chunks(chunk_size.max(1)).map(<[u8]>::to_vec).collect();
        Self { chunks, pulls: 0 }
    }

    /// Number of `pull` calls made so far.
    pub fn pulls(&self) -> usize {
        self.pulls
    }
}

impl ByteSource for MemorySource {
    fn pull(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        self.pulls += 1;
        Ok(self.chunks.pop_front())
    }
}
