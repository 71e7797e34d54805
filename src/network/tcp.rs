// Non-blocking TCP connection shared by the host and ESP-IDF radios. The
// host name is resolved on a short-lived worker thread and the connect is
// started without waiting; `status` advances both from the tick loop.

use std::io::{self, ErrorKind, Read, Write};
use std::mem;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use log::{debug, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::radio::SocketStatus;

const RESOLVER_STACK_SIZE: usize = 8 * 1024;

enum Stage {
    Resolving(Receiver<io::Result<SocketAddr>>),
    Connecting(Socket),
    Connected(Socket),
    Closed,
}

pub struct TcpConnection {
    host: String,
    stage: Stage,
    peer_closed: bool,
}

impl TcpConnection {
    /// Starts resolving `host`. Returns before any network traffic.
    pub fn open(host: &str, port: u16) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let target = (host.to_string(), port);
        thread::Builder::new()
            .name("resolver".into())
            .stack_size(RESOLVER_STACK_SIZE)
            .spawn(move || {
                let result = target.to_socket_addrs().and_then(|mut addrs| {
                    addrs
                        .next()
                        .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "no address found"))
                });
                // The receiver is gone if the connection was closed meanwhile
                let _ = sender.send(result);
            })?;
        Ok(Self {
            host: host.to_string(),
            stage: Stage::Resolving(receiver),
            peer_closed: false,
        })
    }

    /// Advances the connect and reports where it stands. A failed attempt
    /// reports `Closed`.
    pub fn status(&mut self) -> SocketStatus {
        if let Err(e) = self.advance() {
            warn!("Connection to {} failed: {}", self.host, e);
            self.stage = Stage::Closed;
        }
        match self.stage {
            Stage::Resolving(_) | Stage::Connecting(_) => SocketStatus::Connecting,
            Stage::Connected(_) if !self.peer_closed => SocketStatus::Connected,
            _ => SocketStatus::Closed,
        }
    }

    fn advance(&mut self) -> io::Result<()> {
        self.stage = match mem::replace(&mut self.stage, Stage::Closed) {
            Stage::Resolving(receiver) => match receiver.try_recv() {
                Ok(addr) => {
                    let addr = addr?;
                    debug!("Resolved {} to {}", self.host, addr);
                    Stage::Connecting(start_connect(addr)?)
                }
                Err(TryRecvError::Empty) => Stage::Resolving(receiver),
                Err(TryRecvError::Disconnected) => {
                    return Err(io::Error::new(ErrorKind::Other, "resolver stopped"));
                }
            },
            Stage::Connecting(socket) => {
                if let Some(e) = socket.take_error()? {
                    return Err(e);
                }
                match socket.peer_addr() {
                    Ok(_) => Stage::Connected(socket),
                    Err(e) if e.kind() == ErrorKind::NotConnected => Stage::Connecting(socket),
                    Err(e) => return Err(e),
                }
            }
            other => other,
        };
        Ok(())
    }

    /// Writes what the socket accepts right now.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let Stage::Connected(socket) = &mut self.stage else {
            return Err(io::Error::new(ErrorKind::NotConnected, "socket is not connected"));
        };
        match socket.write(data) {
            Ok(count) => Ok(count),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Reads what is available right now; a peer close is reported through
    /// `status`.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Stage::Connected(socket) = &mut self.stage else {
            return Err(io::Error::new(ErrorKind::NotConnected, "socket is not connected"));
        };
        match socket.read(buf) {
            Ok(0) => {
                self.peer_closed = true;
                Ok(0)
            }
            Ok(count) => Ok(count),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn shutdown(self) {
        if let Stage::Connected(socket) | Stage::Connecting(socket) = self.stage {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

fn start_connect(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => Ok(socket),
        Err(e) if in_progress(&e) => Ok(socket),
        Err(e) => Err(e),
    }
}

fn in_progress(e: &io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock || is_einprogress(e)
}

#[cfg(unix)]
fn is_einprogress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(not(unix))]
fn is_einprogress(_e: &io::Error) -> bool {
    false
}
