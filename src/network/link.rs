use log::{info, warn};

use super::radio::{JoinStatus, Radio, SocketStatus};
use crate::clock::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Networking is disabled or the radio is not associated
    Offline,
    /// Credentials submitted, waiting for the access point
    Joining,
    /// Associated and routable, but no socket is open
    Online,
    /// A socket to one host is open, ready to send or receive
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Offline => "OFFLINE",
            ConnectionState::Joining => "JOINING",
            ConnectionState::Online => "ONLINE",
            ConnectionState::Connected => "CONNECTED",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinkTimeouts {
    pub join_ms: u64,
    pub connect_ms: u64,
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        Self {
            join_ms: 15_000,
            connect_ms: 15_000,
        }
    }
}

/// Non-blocking network API. Every method returns promptly; if an operation
/// is incomplete the state is unchanged and the caller tries again next tick.
/// Radio and socket failures degrade the state instead of being returned.
pub struct NetworkLink<R: Radio> {
    radio: R,
    clock: SharedClock,
    timeouts: LinkTimeouts,
    state: ConnectionState,
    state_since: u64,
    join_started: Option<u64>,
    connect_started: Option<u64>,
    socket_open: bool,
}

impl<R: Radio> NetworkLink<R> {
    pub fn new(radio: R, clock: SharedClock, timeouts: LinkTimeouts) -> Self {
        let state_since = clock.monotonic_millis();
        Self {
            radio,
            clock,
            timeouts,
            state: ConnectionState::Offline,
            state_since,
            join_started: None,
            connect_started: None,
            socket_open: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Milliseconds spent in the current state.
    pub fn state_elapsed(&self) -> u64 {
        self.now_millis().saturating_sub(self.state_since)
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.monotonic_millis()
    }

    /// How long one connection attempt may take before it is retried.
    pub fn connect_timeout_ms(&self) -> u64 {
        self.timeouts.connect_ms
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn mac_address(&self) -> String {
        match self.radio.mac_address() {
            Some(mac) => mac
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(":"),
            None => "None".to_string(),
        }
    }

    fn set_state(&mut self, new_state: ConnectionState) {
        if self.state != new_state {
            self.state = new_state;
            self.state_since = self.now_millis();
            info!("Network is now {}", new_state.as_str());
        }
    }

    /// Detects loss of the access point while online or connected.
    pub fn poll(&mut self) {
        if matches!(self.state, ConnectionState::Online | ConnectionState::Connected)
            && self.radio.join_status() != JoinStatus::Joined
        {
            warn!("Wi-Fi association lost");
            self.release_socket();
            self.set_state(ConnectionState::Offline);
        }
    }

    /// From OFFLINE or JOINING, advances towards ONLINE.
    pub fn join(&mut self, ssid: &str, password: &str) {
        if !matches!(self.state, ConnectionState::Offline | ConnectionState::Joining) {
            return;
        }
        if !self.radio.is_initialized() {
            info!("Initializing radio");
            if let Err(e) = self.radio.init() {
                warn!("Radio init failed: {}", e);
            }
            return;
        }

        let now = self.now_millis();
        let Some(started) = self.join_started else {
            if !self.radio.is_ready() {
                return;
            }
            info!("Joining Wi-Fi network {:?}", ssid);
            match self.radio.begin_join(ssid, password) {
                Ok(()) => {
                    self.join_started = Some(now);
                    self.set_state(ConnectionState::Joining);
                }
                Err(e) => {
                    warn!("Could not start joining {:?}: {}; resetting", ssid, e);
                    self.radio.reset();
                }
            }
            return;
        };

        match self.radio.join_status() {
            JoinStatus::Joined => {
                self.join_started = None;
                self.set_state(ConnectionState::Online);
            }
            JoinStatus::Failed => {
                warn!("Failed to join Wi-Fi network {:?}", ssid);
                self.join_started = None;
                self.set_state(ConnectionState::Offline);
            }
            JoinStatus::Idle | JoinStatus::Joining => {
                if now.saturating_sub(started) > self.timeouts.join_ms {
                    warn!(
                        "Could not join Wi-Fi network after {} s; resetting",
                        self.timeouts.join_ms / 1000
                    );
                    self.radio.reset();
                    self.join_started = None;
                    self.set_state(ConnectionState::Offline);
                }
            }
        }
    }

    /// From ONLINE, advances towards CONNECTED.
    pub fn connect(&mut self, host: &str, port: u16, ssl: bool) {
        if self.state != ConnectionState::Online {
            return;
        }
        let now = self.now_millis();
        let started = match self.connect_started {
            Some(started) => started,
            None => {
                info!("Connecting to {} port {}", host, port);
                if let Err(e) = self.radio.open(host, port, ssl) {
                    warn!("Failed to open socket to {}: {}", host, e);
                    return;
                }
                self.socket_open = true;
                self.connect_started = Some(now);
                now
            }
        };

        match self.radio.socket_status() {
            SocketStatus::Connected => {
                self.connect_started = None;
                self.set_state(ConnectionState::Connected);
            }
            SocketStatus::Closed => {
                warn!("Connection to {} failed; retrying", host);
                self.release_socket();
            }
            SocketStatus::Connecting => {
                if now.saturating_sub(started) > self.timeouts.connect_ms {
                    warn!(
                        "No connection after {} s; retrying",
                        self.timeouts.connect_ms / 1000
                    );
                    self.release_socket();
                }
            }
        }
    }

    /// In CONNECTED, writes what the socket accepts; returns the count written.
    pub fn send(&mut self, data: &[u8]) -> usize {
        if !self.check_connected() {
            return 0;
        }
        match self.radio.write(data) {
            Ok(count) => count,
            Err(e) => {
                warn!("Socket write failed: {}", e);
                self.degrade();
                0
            }
        }
    }

    /// In CONNECTED, returns up to `max_len` available bytes. An empty result
    /// is not end-of-stream; leaving CONNECTED is.
    pub fn receive(&mut self, max_len: usize) -> Vec<u8> {
        if !self.check_connected() {
            return Vec::new();
        }
        let mut buf = vec![0u8; max_len];
        match self.radio.read(&mut buf) {
            Ok(count) => {
                buf.truncate(count);
                buf
            }
            Err(e) => {
                warn!("Socket read failed: {}", e);
                self.degrade();
                Vec::new()
            }
        }
    }

    /// Releases the socket if one is open. Safe to call in any state.
    pub fn close(&mut self) {
        self.release_socket();
        if self.state == ConnectionState::Connected {
            self.degrade();
        }
    }

    /// Releases every radio resource and forces OFFLINE.
    pub fn disable(&mut self) {
        self.release_socket();
        if self.radio.is_initialized() {
            self.radio.deinit();
        }
        self.join_started = None;
        self.set_state(ConnectionState::Offline);
    }

    fn check_connected(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        if self.radio.socket_status() != SocketStatus::Connected {
            self.degrade();
            return false;
        }
        true
    }

    /// Drops the socket and falls back to ONLINE, or OFFLINE if the link is gone.
    fn degrade(&mut self) {
        self.release_socket();
        if self.radio.join_status() == JoinStatus::Joined {
            self.set_state(ConnectionState::Online);
        } else {
            self.set_state(ConnectionState::Offline);
        }
    }

    fn release_socket(&mut self) {
        if self.socket_open {
            self.radio.close();
            self.socket_open = false;
        }
        self.connect_started = None;
    }
}

impl<R: Radio> Drop for NetworkLink<R> {
    fn drop(&mut self) {
        self.release_socket();
    }
}
