// Network link: radio driver abstraction and the non-blocking connection state machine

#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod host;
pub mod link;
pub mod radio;
pub mod tcp;
#[cfg(target_os = "espidf")]
pub mod wifi;

pub use link::{ConnectionState, LinkTimeouts, NetworkLink};
pub use radio::{JoinStatus, Radio, RadioError, SocketStatus};

/// Bytes read from the socket per call: 1500 - IP header (20) - TCP header (20).
pub const PACKET_LENGTH: usize = 1500 - 20 - 20;
