use thiserror::Error;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("radio not initialized")]
    NotInitialized,
    #[error("no socket open")]
    NoSocket,
    #[error("TLS is not supported by this radio")]
    TlsUnsupported,
    #[error("invalid credentials: {0}")]
    Credentials(String),
    #[error("driver error: {0}")]
    Driver(String),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Idle,
    Joining,
    Joined,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Closed,
    Connecting,
    Connected,
}

/// A Wi-Fi radio with a single TCP/TLS socket. Every method must return
/// promptly; long operations are started and then polled.
pub trait Radio {
    fn is_initialized(&self) -> bool;

    /// Brings up the radio driver. May be called again after `deinit`.
    fn init(&mut self) -> Result<(), RadioError>;

    /// False while the radio is still settling after init or reset.
    fn is_ready(&mut self) -> bool;

    /// Submits credentials and starts joining; progress is polled via `join_status`.
    fn begin_join(&mut self, ssid: &str, password: &str) -> Result<(), RadioError>;

    fn join_status(&mut self) -> JoinStatus;

    /// Hard-resets the radio, dropping the association and any socket.
    fn reset(&mut self);

    /// Starts opening the socket; progress is polled via `socket_status`.
    fn open(&mut self, host: &str, port: u16, tls: bool) -> Result<(), RadioError>;

    fn socket_status(&mut self) -> SocketStatus;

    /// Writes what the socket accepts right now; returns the count written.
    fn write(&mut self, data: &[u8]) -> Result<usize, RadioError>;

    /// Reads what is available right now; 0 means nothing yet. A peer close
    /// shows up as `socket_status() == Closed`.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, RadioError>;

    fn close(&mut self);

    /// Releases every radio resource.
    fn deinit(&mut self);

    fn mac_address(&self) -> Option<[u8; 6]>;
}
