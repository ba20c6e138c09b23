use super::*;
use std::sync::{MutexGuard, PoisonError};
use tokio::net::TcpStream;

/// Attach state of an exported device, with the `usbip_status` codes
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConnectionState {
    /// Ready to take a socket
    Available = 1,
    /// A connection is running
    Used = 2,
    /// A fatal error happened, teardown is pending
    Error = 3,
}

impl ConnectionState {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        FromPrimitive::from_u32(code)
    }
}

struct DeviceInner {
    state: ConnectionState,
    connection: Option<Arc<Connection>>,
}

/// A local device exported over USB/IP
///
/// Owns at most one [Connection] at a time. Sockets come in through
/// [StubDevice::set_socket] (or [StubDevice::attach_tcp]) and go away through
/// [StubDevice::clear_socket]. A connection-fatal error is picked up by a
/// per-connection event task, which marks the device [ConnectionState::Error]
/// and tears the connection down.
pub struct StubDevice {
    pub bus_id: String,
    /// `busnum << 16 | devnum`, as carried in every PDU header
    pub devid: u32,
    stack: Arc<dyn LocalUsbStack>,
    config: StubConfig,
    inner: Mutex<DeviceInner>,
}

impl StubDevice {
    pub fn new(
        bus_id: impl Into<String>,
        busnum: u16,
        devnum: u16,
        stack: Arc<dyn LocalUsbStack>,
        config: StubConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus_id: bus_id.into(),
            devid: ((busnum as u32) << 16) | devnum as u32,
            stack,
            config,
            inner: Mutex::new(DeviceInner {
                state: ConnectionState::Available,
                connection: None,
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, DeviceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ConnectionState {
        self.inner().state
    }

    /// The running connection, if any
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner().connection.clone()
    }

    /// Start a connection over a connected stream socket
    ///
    /// Fails with [StubError::NotAttachable] unless the device is
    /// [ConnectionState::Available] and the previous connection is fully torn
    /// down. Must be called from within a tokio runtime.
    pub fn set_socket<S>(self: &Arc<Self>, socket: S) -> Result<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut inner = self.inner();
        if inner.state != ConnectionState::Available || inner.connection.is_some() {
            warn!("Device {} is busy ({:?})", self.bus_id, inner.state);
            return Err(StubError::NotAttachable(inner.state));
        }

        let connection =
            Connection::start(socket, self.devid, self.stack.clone(), self.config.clone());
        inner.connection = Some(connection.clone());
        inner.state = ConnectionState::Used;
        drop(inner);

        info!("Device {} attached", self.bus_id);
        tokio::spawn(handle_events(self.clone(), connection.clone()));
        Ok(connection)
    }

    /// Attach a TCP connection, checking that it is connected first
    pub fn attach_tcp(self: &Arc<Self>, stream: TcpStream) -> Result<Arc<Connection>> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        debug!("Attaching {} to {}", peer, self.bus_id);
        self.set_socket(stream)
    }

    /// Store a socket, or `None` for the `-1` detach sentinel
    pub async fn store_sockfd<S>(
        self: &Arc<Self>,
        socket: Option<S>,
    ) -> Result<Option<Arc<Connection>>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        match socket {
            Some(socket) => self.set_socket(socket).map(Some),
            None => {
                if self.clear_socket().await.is_none() {
                    debug!("Device {} has no connection to clear", self.bus_id);
                }
                Ok(None)
            }
        }
    }

    /// Tear the current connection down and make the device available again
    ///
    /// Returns `None` if there was nothing to tear down. Concurrent callers all
    /// wait for the same teardown.
    pub async fn clear_socket(&self) -> Option<TeardownReport> {
        let connection = self.connection()?;
        let report = connection.shutdown().await;

        let mut inner = self.inner();
        let current = inner
            .connection
            .as_ref()
            .map_or(false, |c| Arc::ptr_eq(c, &connection));
        if current {
            inner.connection = None;
            inner.state = ConnectionState::Available;
            info!("Device {} detached", self.bus_id);
        }
        Some(report)
    }

    fn mark_error(&self, connection: &Arc<Connection>) {
        let mut inner = self.inner();
        if let Some(current) = &inner.connection {
            if Arc::ptr_eq(current, connection) {
                inner.state = ConnectionState::Error;
            }
        }
    }
}

impl std::fmt::Debug for StubDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubDevice")
            .field("bus_id", &self.bus_id)
            .field("devid", &self.devid)
            .field("state", &self.status())
            .finish()
    }
}

/// Consume the connection's fatal error and run teardown for it
async fn handle_events(device: Arc<StubDevice>, connection: Arc<Connection>) {
    tokio::select! {
        err = connection.fatal_error() => {
            if err.is_disconnect() {
                info!("Device {}: remote closed the connection", device.bus_id);
            } else {
                warn!("Device {}: {}", device.bus_id, err);
            }
            device.mark_error(&connection);
            device.clear_socket().await;
        }
        _ = connection.stopped() => {
            trace!("Device {}: connection stopped", device.bus_id);
        }
    }
}
