// In-memory radio with a scripted HTTP peer, for tests and offline simulation

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::radio::{JoinStatus, Radio, RadioError, SocketStatus};

#[derive(Debug, Clone, Default)]
pub struct FakeResponse {
    pub bytes: Vec<u8>,
    /// Peer drops the connection after delivering this many bytes.
    pub drop_after: Option<usize>,
    /// Peer goes silent after delivering this many bytes.
    pub stall_after: Option<usize>,
}

impl FakeResponse {
    pub fn ok(body: &[u8]) -> Self {
        Self::with_headers("200 OK", &[], body)
    }

    pub fn with_headers(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Self {
        let mut bytes = format!("HTTP/1.1 {}\r\n", status).into_bytes();
        bytes.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        for (name, value) in headers {
            bytes.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        bytes.extend_from_slice(b"\r\n");
        bytes.extend_from_slice(body);
        Self { bytes, ..Default::default() }
    }

    pub fn raw(bytes: &[u8]) -> Self {
        Self { bytes: bytes.to_vec(), ..Default::default() }
    }

    pub fn dropped_after(mut self, count: usize) -> Self {
        self.drop_after = Some(count);
        self
    }

    pub fn stalled_after(mut self, count: usize) -> Self {
        self.stall_after = Some(count);
        self
    }
}

#[derive(Debug)]
struct FakeSocket {
    host: String,
    connected: bool,
    request: Vec<u8>,
    response: Option<FakeResponse>,
    sent: usize,
    peer_closed: bool,
}

/// Shared state of the simulated access point and server.
#[derive(Debug)]
pub struct FakeNet {
    /// Responses keyed by `host` + `path`, e.g. `example.com/packs.json`. A
    /// key without a query string also matches requests that carry one.
    pub responses: HashMap<String, FakeResponse>,
    pub chunk_size: usize,
    pub join_fails: bool,
    pub refuse_connect: bool,
    pub hang_connect: bool,
    pub joined: bool,
    pub initialized: bool,
    pub opens: usize,
    pub closes: usize,
    pub resets: usize,
    pub deinits: usize,
    pub requests: Vec<String>,
    socket: Option<FakeSocket>,
}

impl Default for FakeNet {
    fn default() -> Self {
        Self {
            responses: HashMap::new(),
            chunk_size: 256,
            join_fails: false,
            refuse_connect: false,
            hang_connect: false,
            joined: false,
            initialized: false,
            opens: 0,
            closes: 0,
            resets: 0,
            deinits: 0,
            requests: Vec::new(),
            socket: None,
        }
    }
}

impl FakeNet {
    pub fn serve(&mut self, host_and_path: &str, response: FakeResponse) {
        self.responses.insert(host_and_path.to_string(), response);
    }

    pub fn socket_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Simulates the access point going away.
    pub fn drop_association(&mut self) {
        self.joined = false;
        if let Some(socket) = self.socket.as_mut() {
            socket.peer_closed = true;
        }
    }
}

fn route(
    responses: &HashMap<String, FakeResponse>,
    host: &str,
    request: &[u8],
) -> Option<FakeResponse> {
    let text = String::from_utf8_lossy(request);
    let path = text.lines().next()?.split(' ').nth(1)?;
    let bare = path.split('?').next().unwrap_or(path);
    let response = responses
        .get(&format!("{}{}", host, path))
        .or_else(|| responses.get(&format!("{}{}", host, bare)))
        .cloned()
        .unwrap_or_else(|| FakeResponse::with_headers("404 Not Found", &[], b""));
    Some(response)
}

#[derive(Clone, Default)]
pub struct FakeRadio {
    net: Rc<RefCell<FakeNet>>,
}

impl FakeRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for scripting responses and inspecting counters.
    pub fn net(&self) -> Rc<RefCell<FakeNet>> {
        Rc::clone(&self.net)
    }
}

impl Radio for FakeRadio {
    fn is_initialized(&self) -> bool {
        self.net.borrow().initialized
    }

    fn init(&mut self) -> Result<(), RadioError> {
        self.net.borrow_mut().initialized = true;
        Ok(())
    }

    fn is_ready(&mut self) -> bool {
        true
    }

    fn begin_join(&mut self, _ssid: &str, _password: &str) -> Result<(), RadioError> {
        let mut net = self.net.borrow_mut();
        net.joined = !net.join_fails;
        Ok(())
    }

    fn join_status(&mut self) -> JoinStatus {
        let net = self.net.borrow();
        if net.joined {
            JoinStatus::Joined
        } else if net.join_fails {
            JoinStatus::Failed
        } else {
            JoinStatus::Idle
        }
    }

    fn reset(&mut self) {
        let mut net = self.net.borrow_mut();
        net.resets += 1;
        net.joined = false;
        net.socket = None;
    }

    fn open(&mut self, host: &str, _port: u16, _tls: bool) -> Result<(), RadioError> {
        let mut net = self.net.borrow_mut();
        if !net.joined {
            return Err(RadioError::Driver("not associated".into()));
        }
        net.opens += 1;
        net.socket = Some(FakeSocket {
            host: host.to_string(),
            connected: false,
            request: Vec::new(),
            response: None,
            sent: 0,
            peer_closed: false,
        });
        Ok(())
    }

    fn socket_status(&mut self) -> SocketStatus {
        let mut net = self.net.borrow_mut();
        let refuse = net.refuse_connect;
        let hang = net.hang_connect;
        match net.socket.as_mut() {
            None => SocketStatus::Closed,
            Some(socket) if socket.peer_closed => SocketStatus::Closed,
            Some(socket) if !socket.connected && hang => SocketStatus::Connecting,
            Some(socket) if !socket.connected => {
                if refuse {
                    socket.peer_closed = true;
                    SocketStatus::Closed
                } else {
                    socket.connected = true;
                    SocketStatus::Connecting
                }
            }
            Some(_) => SocketStatus::Connected,
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, RadioError> {
        let mut guard = self.net.borrow_mut();
        let net = &mut *guard;
        let socket = net.socket.as_mut().ok_or(RadioError::NoSocket)?;
        socket.request.extend_from_slice(data);
        if socket.response.is_none() && socket.request.windows(4).any(|w| w == b"\r\n\r\n") {
            socket.response = route(&net.responses, &socket.host, &socket.request);
            net.requests
                .push(String::from_utf8_lossy(&socket.request).into_owned());
        }
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, RadioError> {
        let mut net = self.net.borrow_mut();
        let chunk_size = net.chunk_size;
        let socket = net.socket.as_mut().ok_or(RadioError::NoSocket)?;
        let Some(response) = socket.response.as_ref() else {
            return Ok(0);
        };

        let mut limit = response.bytes.len();
        if let Some(drop_after) = response.drop_after {
            limit = limit.min(drop_after);
        }
        if let Some(stall_after) = response.stall_after {
            limit = limit.min(stall_after);
        }
        let count = (limit.saturating_sub(socket.sent)).min(buf.len()).min(chunk_size);
        buf[..count].copy_from_slice(&response.bytes[socket.sent..socket.sent + count]);
        socket.sent += count;

        let stalled = response.stall_after.is_some_and(|s| socket.sent >= s);
        if socket.sent >= limit && !stalled {
            // Connection: close
            socket.peer_closed = true;
        }
        Ok(count)
    }

    fn close(&mut self) {
        let mut net = self.net.borrow_mut();
        net.closes += 1;
        net.socket = None;
    }

    fn deinit(&mut self) {
        let mut net = self.net.borrow_mut();
        net.deinits += 1;
        net.initialized = false;
        net.joined = false;
        net.socket = None;
    }

    fn mac_address(&self) -> Option<[u8; 6]> {
        Some([0x02, 0, 0, 0, 0, 0x01])
    }
}
