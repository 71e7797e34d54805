// Incremental HTTP/1.1 GET client on top of the network link

pub mod fetcher;
pub mod url;

pub use fetcher::{FetchEvent, HttpFetcher, Validation};
pub use self::url::Url;

use thiserror::Error;

use crate::ErrorClass;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid URL {0:?}")]
    InvalidUrl(String),
    #[error("network is offline")]
    Offline,
    #[error("connection closed before the response was complete")]
    Closed,
    #[error("malformed status line {0:?}")]
    BadStatusLine(String),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("malformed or oversized header {0:?}")]
    BadHeader(String),
    #[error("redirect without a Location header")]
    MissingLocation,
    #[error("more than {0} redirects")]
    TooManyRedirects(u8),
    #[error("no data received for {0} ms")]
    Silence(u64),
    #[error("connection closed after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },
    #[error("fetch already finished")]
    Finished,
}

impl FetchError {
    pub fn kind(&self) -> ErrorClass {
        match self {
            FetchError::Offline
            | FetchError::Closed
            | FetchError::Silence(_)
            | FetchError::Truncated { .. } => ErrorClass::Transient,
            _ => ErrorClass::Protocol,
        }
    }
}
