use log::{debug, info, warn};

use super::{FetchError, Url};
use crate::network::{ConnectionState, NetworkLink, Radio, PACKET_LENGTH};
use crate::stream_buffer::StreamBuffer;

const MAX_REDIRECTS: u8 = 5;
const MAX_HEADER_LINE: usize = 2048;

/// Outcome of one `HttpFetcher::read` call.
#[derive(Debug, PartialEq, Eq)]
pub enum FetchEvent {
    /// A non-empty slice of the response body.
    Data(Vec<u8>),
    /// Nothing new yet; call again next tick.
    Pending,
    /// The response is complete.
    Done(Validation),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// A fresh body was received, with the server's ETag if it sent one.
    Modified { etag: Option<String> },
    /// The server answered 304 to our If-None-Match.
    NotModified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Requesting { sent: usize },
    AwaitingStatus,
    AwaitingHeaders,
    Body,
    Finished,
}

/// One GET request, driven by repeated `read` calls. Holds no socket of its
/// own: the link passed to `read` carries the single connection.
pub struct HttpFetcher {
    url: Url,
    etag: Option<String>,
    silence_timeout_ms: u64,
    phase: Phase,
    buffer: StreamBuffer,
    request: Vec<u8>,
    status: u16,
    content_length: Option<u64>,
    received: u64,
    response_etag: Option<String>,
    location: Option<String>,
    redirects: u8,
    connect_started: Option<u64>,
    last_activity: u64,
}

impl HttpFetcher {
    pub fn new(url: &str, etag: Option<&str>, silence_timeout_ms: u64) -> Result<Self, FetchError> {
        let url = Url::parse(url)?;
        Ok(Self::for_url(url, etag, silence_timeout_ms))
    }

    pub fn for_url(url: Url, etag: Option<&str>, silence_timeout_ms: u64) -> Self {
        Self {
            url,
            etag: etag.filter(|tag| !tag.is_empty()).map(str::to_string),
            silence_timeout_ms,
            phase: Phase::Connecting,
            buffer: StreamBuffer::new(),
            request: Vec::new(),
            status: 0,
            content_length: None,
            received: 0,
            response_etag: None,
            location: None,
            redirects: 0,
            connect_started: None,
            last_activity: 0,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// Body bytes delivered so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn read<R: Radio>(&mut self, link: &mut NetworkLink<R>) -> Result<FetchEvent, FetchError> {
        match self.phase {
            Phase::Finished => Err(FetchError::Finished),
            Phase::Connecting => self.connect_read(link),
            Phase::Requesting { sent } => self.request_read(link, sent),
            Phase::AwaitingStatus | Phase::AwaitingHeaders => self.header_read(link),
            Phase::Body => self.content_read(link),
        }
    }

    fn connect_read<R: Radio>(&mut self, link: &mut NetworkLink<R>) -> Result<FetchEvent, FetchError> {
        let now = link.now_millis();
        let started = *self.connect_started.get_or_insert(now);
        match link.state() {
            ConnectionState::Offline | ConnectionState::Joining => {
                return self.fail(link, FetchError::Offline);
            }
            ConnectionState::Online => link.connect(&self.url.host, self.url.port, self.url.ssl),
            ConnectionState::Connected => {}
        }
        if link.state() == ConnectionState::Connected {
            self.request = self.build_request();
            self.phase = Phase::Requesting { sent: 0 };
            self.last_activity = now;
            info!("GET {}{}", self.url.host, self.url.path);
        } else if now.saturating_sub(started) > link.connect_timeout_ms() + self.silence_timeout_ms {
            // The link has had one close-and-retry by now; this fetch gives up
            return self.fail(link, FetchError::Silence(now - started));
        }
        Ok(FetchEvent::Pending)
    }

    fn build_request(&self) -> Vec<u8> {
        let mut request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n",
            self.url.path,
            self.url.host_header()
        );
        if let Some(etag) = &self.etag {
            request.push_str(&format!("If-None-Match: {}\r\n", etag));
        }
        request.push_str("\r\n");
        request.into_bytes()
    }

    fn request_read<R: Radio>(
        &mut self,
        link: &mut NetworkLink<R>,
        sent: usize,
    ) -> Result<FetchEvent, FetchError> {
        if link.state() != ConnectionState::Connected {
            return self.fail(link, FetchError::Closed);
        }
        let sent = sent + link.send(&self.request[sent..]);
        if sent >= self.request.len() {
            self.phase = Phase::AwaitingStatus;
            self.last_activity = link.now_millis();
        } else {
            self.phase = Phase::Requesting { sent };
            if let Some(e) = self.silence(link) {
                return self.fail(link, e);
            }
        }
        Ok(FetchEvent::Pending)
    }

    fn pump<R: Radio>(&mut self, link: &mut NetworkLink<R>) {
        let data = link.receive(PACKET_LENGTH);
        if !data.is_empty() {
            self.last_activity = link.now_millis();
            self.buffer.extend(&data);
        }
    }

    fn silence<R: Radio>(&self, link: &NetworkLink<R>) -> Option<FetchError> {
        let quiet = link.now_millis().saturating_sub(self.last_activity);
        (quiet > self.silence_timeout_ms).then_some(FetchError::Silence(quiet))
    }

    fn header_read<R: Radio>(&mut self, link: &mut NetworkLink<R>) -> Result<FetchEvent, FetchError> {
        self.pump(link);
        while let Some(eol) = self.buffer.find(b"\r\n", 0) {
            let line = String::from_utf8_lossy(&self.buffer.as_slice()[..eol]).into_owned();
            self.buffer.consume(eol + 2);

            if self.phase == Phase::AwaitingStatus {
                if let Err(e) = self.parse_status(&line) {
                    return self.fail(link, e);
                }
                if self.status == 304 {
                    debug!("{} not modified", self.url.path);
                    return self.finish(link, Validation::NotModified);
                }
                self.phase = Phase::AwaitingHeaders;
            } else if line.is_empty() {
                return self.end_of_headers(link);
            } else if let Err(e) = self.parse_header(&line) {
                return self.fail(link, e);
            }
        }

        if self.buffer.len() > MAX_HEADER_LINE {
            let excerpt = String::from_utf8_lossy(&self.buffer.as_slice()[..32]).into_owned();
            return self.fail(link, FetchError::BadHeader(excerpt));
        }
        if link.state() != ConnectionState::Connected {
            return self.fail(link, FetchError::Closed);
        }
        if let Some(e) = self.silence(link) {
            return self.fail(link, e);
        }
        Ok(FetchEvent::Pending)
    }

    fn parse_status(&mut self, line: &str) -> Result<(), FetchError> {
        let mut words = line.split_whitespace();
        let status = match (words.next(), words.next()) {
            (Some(version), Some(code)) if version.starts_with("HTTP/") => code.parse::<u16>().ok(),
            _ => None,
        };
        let status = status.ok_or_else(|| FetchError::BadStatusLine(line.to_string()))?;
        if !(200..400).contains(&status) {
            return Err(FetchError::Status(status));
        }
        self.status = status;
        Ok(())
    }

    fn parse_header(&mut self, line: &str) -> Result<(), FetchError> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FetchError::BadHeader(line.to_string()))?;
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => {
                let length = value
                    .parse()
                    .map_err(|_| FetchError::BadHeader(line.to_string()))?;
                self.content_length = Some(length);
            }
            "etag" => self.response_etag = Some(value.to_string()),
            "location" => self.location = Some(value.to_string()),
            _ => {}
        }
        Ok(())
    }

    fn end_of_headers<R: Radio>(&mut self, link: &mut NetworkLink<R>) -> Result<FetchEvent, FetchError> {
        if !(300..400).contains(&self.status) {
            self.phase = Phase::Body;
            return self.content_read(link);
        }

        let Some(location) = self.location.take() else {
            return self.fail(link, FetchError::MissingLocation);
        };
        self.redirects += 1;
        if self.redirects > MAX_REDIRECTS {
            return self.fail(link, FetchError::TooManyRedirects(MAX_REDIRECTS));
        }
        let target = match self.url.resolve(&location) {
            Ok(target) => target,
            Err(e) => return self.fail(link, e),
        };
        info!("Redirected to {}{}", target.host, target.path);

        link.close();
        self.url = target;
        self.buffer.clear();
        self.status = 0;
        self.content_length = None;
        self.response_etag = None;
        self.connect_started = None;
        self.phase = Phase::Connecting;
        Ok(FetchEvent::Pending)
    }

    fn content_read<R: Radio>(&mut self, link: &mut NetworkLink<R>) -> Result<FetchEvent, FetchError> {
        let remaining = self.content_length.map(|len| len.saturating_sub(self.received));
        if remaining == Some(0) {
            let etag = self.response_etag.take();
            return self.finish(link, Validation::Modified { etag });
        }

        if self.buffer.is_empty() {
            self.pump(link);
        }
        if !self.buffer.is_empty() {
            let mut count = self.buffer.len().min(PACKET_LENGTH);
            if let Some(remaining) = remaining {
                count = count.min(remaining as usize);
            }
            let chunk = self.buffer.take(count);
            self.received += chunk.len() as u64;
            if self.content_length.is_some_and(|len| self.received >= len) {
                // Anything past Content-Length is not part of this response
                self.buffer.clear();
            }
            return Ok(FetchEvent::Data(chunk));
        }

        if link.state() != ConnectionState::Connected {
            return match self.content_length {
                None => {
                    let etag = self.response_etag.take();
                    self.finish(link, Validation::Modified { etag })
                }
                Some(expected) => self.fail(
                    link,
                    FetchError::Truncated {
                        received: self.received,
                        expected,
                    },
                ),
            };
        }
        if let Some(e) = self.silence(link) {
            return self.fail(link, e);
        }
        Ok(FetchEvent::Pending)
    }

    fn finish<R: Radio>(
        &mut self,
        link: &mut NetworkLink<R>,
        validation: Validation,
    ) -> Result<FetchEvent, FetchError> {
        link.close();
        self.phase = Phase::Finished;
        self.buffer.clear();
        Ok(FetchEvent::Done(validation))
    }

    fn fail<R: Radio>(&mut self, link: &mut NetworkLink<R>, error: FetchError) -> Result<FetchEvent, FetchError> {
        warn!("Fetch of {}{} failed: {}", self.url.host, self.url.path, error);
        link.close();
        self.phase = Phase::Finished;
        self.buffer.clear();
        Err(error)
    }
}
