// Development radio for running the firmware on a workstation: the access
// point is simulated, sockets are real non-blocking TCP connections.

use super::radio::{JoinStatus, Radio, RadioError, SocketStatus};
use super::tcp::TcpConnection;
use crate::clock::SharedClock;

const INIT_DELAY_MS: u64 = 750;

pub struct HostRadio {
    clock: SharedClock,
    /// Credentials the simulated access point accepts; `None` accepts any.
    access_point: Option<(String, String)>,
    join_delay_ms: u64,
    initialized_at: Option<u64>,
    join_started: Option<(u64, bool)>,
    connection: Option<TcpConnection>,
}

impl HostRadio {
    pub fn new(clock: SharedClock, access_point: Option<(String, String)>, join_delay_ms: u64) -> Self {
        Self {
            clock,
            access_point,
            join_delay_ms,
            initialized_at: None,
            join_started: None,
            connection: None,
        }
    }
}

impl Radio for HostRadio {
    fn is_initialized(&self) -> bool {
        self.initialized_at.is_some()
    }

    fn init(&mut self) -> Result<(), RadioError> {
        self.initialized_at = Some(self.clock.monotonic_millis());
        Ok(())
    }

    fn is_ready(&mut self) -> bool {
        match self.initialized_at {
            Some(at) => self.clock.monotonic_millis() >= at + INIT_DELAY_MS,
            None => false,
        }
    }

    fn begin_join(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
        if !self.is_initialized() {
            return Err(RadioError::NotInitialized);
        }
        let accepted = match &self.access_point {
            Some((ap_ssid, ap_password)) => ap_ssid == ssid && ap_password == password,
            None => true,
        };
        self.join_started = Some((self.clock.monotonic_millis(), accepted));
        Ok(())
    }

    fn join_status(&mut self) -> JoinStatus {
        match self.join_started {
            None => JoinStatus::Idle,
            Some((_, false)) => JoinStatus::Joining,
            Some((started, true)) => {
                if self.clock.monotonic_millis() >= started + self.join_delay_ms {
                    JoinStatus::Joined
                } else {
                    JoinStatus::Joining
                }
            }
        }
    }

    fn reset(&mut self) {
        self.close();
        self.join_started = None;
        self.initialized_at = Some(self.clock.monotonic_millis());
    }

    fn open(&mut self, host: &str, port: u16, tls: bool) -> Result<(), RadioError> {
        if tls {
            return Err(RadioError::TlsUnsupported);
        }
        self.close();
        self.connection = Some(TcpConnection::open(host, port)?);
        Ok(())
    }

    fn socket_status(&mut self) -> SocketStatus {
        match self.connection.as_mut() {
            Some(connection) => connection.status(),
            None => SocketStatus::Closed,
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, RadioError> {
        let connection = self.connection.as_mut().ok_or(RadioError::NoSocket)?;
        Ok(connection.write(data)?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, RadioError> {
        let connection = self.connection.as_mut().ok_or(RadioError::NoSocket)?;
        Ok(connection.read(buf)?)
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown();
        }
    }

    fn deinit(&mut self) {
        self.close();
        self.join_started = None;
        self.initialized_at = None;
    }

    fn mac_address(&self) -> Option<[u8; 6]> {
        None
    }
}
