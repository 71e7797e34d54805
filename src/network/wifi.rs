// ESP-IDF radio: station-mode Wi-Fi plus one socket (lwIP TCP or esp-tls)

use std::time::{Duration, Instant};

use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::tls::{self, EspTls, InternalSocket};
use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi};

use super::radio::{JoinStatus, Radio, RadioError, SocketStatus};
use super::tcp::TcpConnection;

// The driver needs this long after start/reset before accepting credentials
const SETTLE_TIME: Duration = Duration::from_millis(750);
const TLS_TIMEOUT_MS: u32 = 15_000;

enum Socket {
    Tcp(TcpConnection),
    Tls(EspTls<InternalSocket>),
}

pub struct EspRadio {
    wifi: EspWifi<'static>,
    started: bool,
    settle_until: Option<Instant>,
    socket: Option<Socket>,
    peer_closed: bool,
}

impl EspRadio {
    pub fn new(modem: Modem, sys_loop: EspSystemEventLoop) -> anyhow::Result<Self> {
        let nvs = EspDefaultNvsPartition::take()?;
        let wifi = EspWifi::new(modem, sys_loop, Some(nvs))?;
        Ok(Self {
            wifi,
            started: false,
            settle_until: None,
            socket: None,
            peer_closed: false,
        })
    }

    fn driver_err(e: esp_idf_svc::sys::EspError) -> RadioError {
        RadioError::Driver(format!("{:?}", e))
    }
}

impl Radio for EspRadio {
    fn is_initialized(&self) -> bool {
        self.started
    }

    fn init(&mut self) -> Result<(), RadioError> {
        self.wifi.start().map_err(Self::driver_err)?;
        self.started = true;
        self.settle_until = Some(Instant::now() + SETTLE_TIME);
        Ok(())
    }

    fn is_ready(&mut self) -> bool {
        match self.settle_until {
            Some(until) if Instant::now() < until => false,
            _ => {
                self.settle_until = None;
                self.started
            }
        }
    }

    fn begin_join(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
        let cfg = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| RadioError::Credentials(format!("invalid SSID {:?}", ssid)))?,
            password: password
                .try_into()
                .map_err(|_| RadioError::Credentials("invalid password".into()))?,
            auth_method: if password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        });
        self.wifi.set_configuration(&cfg).map_err(Self::driver_err)?;
        // Non-blocking: association and DHCP complete in the background
        self.wifi.connect().map_err(Self::driver_err)?;
        Ok(())
    }

    fn join_status(&mut self) -> JoinStatus {
        if !self.started {
            return JoinStatus::Idle;
        }
        match (self.wifi.is_connected(), self.wifi.is_up()) {
            (Ok(true), Ok(true)) => JoinStatus::Joined,
            (Ok(true), _) => JoinStatus::Joining,
            (Err(_), _) | (_, Err(_)) => JoinStatus::Failed,
            _ => JoinStatus::Joining,
        }
    }

    fn reset(&mut self) {
        self.close();
        let _ = self.wifi.disconnect();
        let _ = self.wifi.stop();
        match self.wifi.start() {
            Ok(()) => {
                self.started = true;
                self.settle_until = Some(Instant::now() + SETTLE_TIME);
            }
            Err(e) => {
                log::warn!("Wi-Fi restart after reset failed: {:?}", e);
                self.started = false;
            }
        }
    }

    fn open(&mut self, host: &str, port: u16, tls: bool) -> Result<(), RadioError> {
        let socket = if tls {
            let mut session = EspTls::new().map_err(Self::driver_err)?;
            session
                .connect(
                    host,
                    port,
                    &tls::Config {
                        common_name: Some(host),
                        use_crt_bundle_attach: true,
                        timeout_ms: TLS_TIMEOUT_MS,
                        ..Default::default()
                    },
                )
                .map_err(Self::driver_err)?;
            Socket::Tls(session)
        } else {
            Socket::Tcp(TcpConnection::open(host, port)?)
        };
        self.socket = Some(socket);
        self.peer_closed = false;
        Ok(())
    }

    fn socket_status(&mut self) -> SocketStatus {
        match self.socket.as_mut() {
            Some(Socket::Tcp(connection)) => connection.status(),
            Some(Socket::Tls(_)) if !self.peer_closed => SocketStatus::Connected,
            _ => SocketStatus::Closed,
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, RadioError> {
        match self.socket.as_mut().ok_or(RadioError::NoSocket)? {
            Socket::Tcp(connection) => Ok(connection.write(data)?),
            Socket::Tls(session) => session.write(data).map_err(Self::driver_err),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, RadioError> {
        match self.socket.as_mut().ok_or(RadioError::NoSocket)? {
            Socket::Tcp(connection) => Ok(connection.read(buf)?),
            Socket::Tls(session) => {
                let count = session.read(buf).map_err(Self::driver_err)?;
                if count == 0 {
                    self.peer_closed = true;
                }
                Ok(count)
            }
        }
    }

    fn close(&mut self) {
        if let Some(Socket::Tcp(connection)) = self.socket.take() {
            connection.shutdown();
        }
        self.peer_closed = false;
    }

    fn deinit(&mut self) {
        self.close();
        let _ = self.wifi.disconnect();
        let _ = self.wifi.stop();
        self.started = false;
        self.settle_until = None;
    }

    fn mac_address(&self) -> Option<[u8; 6]> {
        self.wifi.sta_netif().get_mac().ok()
    }
}
