//! Socket endpoints announced by an application and their connection pools.
//!
//! Each pool is an index-addressed slot table. A slot is vacant, holds an
//! idle connection, or is checked out; a connection lives in at most one
//! slot and a checked-out slot belongs to exactly one [`PooledConnection`].
//! Dropping the guard returns the slot, so a caller that errors out while
//! holding a connection still releases it.

use std::fmt;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::task::Context;
use std::task::Poll;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::ReadBuf;
use tokio::net::TcpStream;
use tokio::net::UnixStream;
use tokio::sync::Notify;

use crate::handshake::EndpointAnnouncement;

const UNIX_SCHEME: &str = "unix:";
const TCP_SCHEME: &str = "tcp://";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocketAddress {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl SocketAddress {
    /// Parses `unix:/absolute/path` or `tcp://host:port`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if let Some(path) = raw.strip_prefix(UNIX_SCHEME) {
            let path = PathBuf::from(path);
            if !path.is_absolute() {
                return Err(format!("unix socket path {path:?} is not absolute"));
            }
            return Ok(Self::Unix(path));
        }
        if let Some(authority) = raw.strip_prefix(TCP_SCHEME) {
            let Some((host, port)) = authority.rsplit_once(':') else {
                return Err(format!("tcp address {raw:?} has no port"));
            };
            if host.is_empty() {
                return Err(format!("tcp address {raw:?} has no host"));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("tcp address {raw:?} has an invalid port"))?;
            return Ok(Self::Tcp {
                host: host.to_string(),
                port,
            });
        }
        Err(format!("unsupported socket address {raw:?}"))
    }

    pub async fn connect(&self) -> io::Result<ConnectionStream> {
        match self {
            Self::Unix(path) => Ok(ConnectionStream::Unix(UnixStream::connect(path).await?)),
            Self::Tcp { host, port } => Ok(ConnectionStream::Tcp(
                TcpStream::connect((host.as_str(), *port)).await?,
            )),
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "{UNIX_SCHEME}{}", path.display()),
            Self::Tcp { host, port } => write!(f, "{TCP_SCHEME}{host}:{port}"),
        }
    }
}

/// A connected stream to one of the application's sockets.
#[derive(Debug)]
pub enum ConnectionStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsRawFd for ConnectionStream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Unix(stream) => stream.as_raw_fd(),
            Self::Tcp(stream) => stream.as_raw_fd(),
        }
    }
}

impl AsyncRead for ConnectionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnectionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[derive(Debug)]
enum Slot {
    Vacant,
    Available(ConnectionStream),
    CheckedOut,
}

#[derive(Debug, Default)]
struct PoolState {
    slots: Vec<Slot>,
}

/// Bounded pool of connections to one address.
#[derive(Debug)]
pub struct ConnectionPool {
    address: SocketAddress,
    capacity: usize,
    state: Mutex<PoolState>,
    slot_freed: Notify,
}

impl ConnectionPool {
    /// `capacity` is clamped to at least one connection.
    pub fn new(address: SocketAddress, capacity: usize) -> Self {
        Self {
            address,
            capacity: capacity.max(1),
            state: Mutex::new(PoolState::default()),
            slot_freed: Notify::new(),
        }
    }

    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle_count(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Available(_)))
            .count()
    }

    pub fn checked_out_count(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::CheckedOut))
            .count()
    }

    /// Reserves a slot exclusively. An idle connection is handed out as is;
    /// otherwise a free slot is reserved and left unconnected (see
    /// [`PooledConnection::connect`]). Waits while the pool is at capacity.
    pub async fn checkout(self: &Arc<Self>) -> PooledConnection {
        loop {
            let notified = self.slot_freed.notified();
            tokio::pin!(notified);
            // Register before inspecting the slots so a check-in between the
            // inspection and the await is not lost.
            notified.as_mut().enable();

            if let Some(connection) = self.try_checkout() {
                return connection;
            }
            notified.await;
        }
    }

    /// Non-waiting variant of [`ConnectionPool::checkout`].
    pub fn try_checkout(self: &Arc<Self>) -> Option<PooledConnection> {
        let mut state = self.lock();
        let idle = state.slots.iter_mut().enumerate().find_map(|(index, slot)| {
            match std::mem::replace(slot, Slot::CheckedOut) {
                Slot::Available(stream) => Some((index, stream)),
                other => {
                    *slot = other;
                    None
                }
            }
        });
        if let Some((index, stream)) = idle {
            return Some(PooledConnection::new(Arc::clone(self), index, Some(stream)));
        }

        let vacant = state
            .slots
            .iter()
            .position(|slot| matches!(slot, Slot::Vacant));
        let index = match vacant {
            Some(index) => index,
            None if state.slots.len() < self.capacity => {
                state.slots.push(Slot::Vacant);
                state.slots.len() - 1
            }
            None => return None,
        };
        state.slots[index] = Slot::CheckedOut;
        Some(PooledConnection::new(Arc::clone(self), index, None))
    }

    fn check_in(&self, index: usize, stream: Option<ConnectionStream>) {
        {
            let mut state = self.lock();
            state.slots[index] = match stream {
                Some(stream) => Slot::Available(stream),
                None => Slot::Vacant,
            };
        }
        self.slot_freed.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Slot updates are single assignments, so a poisoned table is still consistent.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Exclusive hold on one pool slot. Returned to the pool on drop.
#[derive(Debug)]
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    index: usize,
    stream: Option<ConnectionStream>,
    reusable: bool,
}

impl PooledConnection {
    fn new(pool: Arc<ConnectionPool>, index: usize, stream: Option<ConnectionStream>) -> Self {
        Self {
            pool,
            index,
            stream,
            reusable: true,
        }
    }

    /// Index of the slot this connection occupies.
    pub fn slot(&self) -> usize {
        self.index
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connects the reserved slot if it does not hold a stream yet.
    pub async fn connect(&mut self) -> io::Result<&mut ConnectionStream> {
        if self.stream.is_none() {
            let stream = self.pool.address.connect().await?;
            tracing::debug!(
                "opened connection to {} in slot {}",
                self.pool.address,
                self.index
            );
            self.stream = Some(stream);
        }
        self.stream_mut()
    }

    pub fn stream_mut(&mut self) -> io::Result<&mut ConnectionStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection not initiated"))
    }

    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Keeps the slot's stream from going back to the idle set; it is closed
    /// when this guard drops.
    pub fn discard(&mut self) {
        self.reusable = false;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let stream = if self.reusable {
            self.stream.take()
        } else {
            None
        };
        self.pool.check_in(self.index, stream);
    }
}

/// One socket announced during the handshake.
#[derive(Debug, Clone)]
pub struct SocketEndpoint {
    name: String,
    protocol: String,
    concurrency: u32,
    pool: Arc<ConnectionPool>,
}

impl SocketEndpoint {
    pub fn new(announcement: EndpointAnnouncement, max_connections: usize) -> Self {
        let EndpointAnnouncement {
            name,
            address,
            protocol,
            concurrency,
        } = announcement;
        Self {
            name,
            protocol,
            concurrency,
            pool: Arc::new(ConnectionPool::new(address, max_connections)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &SocketAddress {
        self.pool.address()
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Concurrency the application advertised; 0 means unlimited.
    pub fn concurrency(&self) -> u32 {
        self.concurrency
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}
