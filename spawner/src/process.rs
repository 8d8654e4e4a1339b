use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio::process::Child;

use crate::pool::SocketEndpoint;
use crate::session::Session;

/// A running application that completed its handshake.
///
/// Dropping the handle never signals the OS process and never closes the
/// process's stdout or stderr targets: the child holds its own duplicates of
/// those descriptors. The control channel is closed once the handshake is
/// done, so nothing here depends on the application's output.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    sockets: Vec<SocketEndpoint>,
    connect_password: String,
    stderr_target: Option<Arc<OwnedFd>>,
    // Spawned with `kill_on_drop(false)`; tokio reaps it in the background
    // once both this handle and the process are gone.
    _child: Child,
}

impl ProcessHandle {
    pub(crate) fn new(
        pid: u32,
        child: Child,
        sockets: Vec<SocketEndpoint>,
        connect_password: String,
        stderr_target: Option<Arc<OwnedFd>>,
    ) -> Self {
        Self {
            pid,
            sockets,
            connect_password,
            stderr_target,
            _child: child,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Endpoints in announced order.
    pub fn sockets(&self) -> &[SocketEndpoint] {
        &self.sockets
    }

    pub fn default_socket(&self) -> Option<&SocketEndpoint> {
        self.sockets.first()
    }

    pub fn connect_password(&self) -> &str {
        &self.connect_password
    }

    /// The descriptor the application's stderr was duplicated from, if the
    /// spawner was given one.
    pub fn stderr_target(&self) -> Option<&Arc<OwnedFd>> {
        self.stderr_target.as_ref()
    }

    /// Checks out a connection slot on the default endpoint, waiting while
    /// its pool is at capacity. The session stays valid after this handle is
    /// dropped.
    pub async fn new_session(&self) -> io::Result<Session> {
        let Some(endpoint) = self.default_socket() else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "the application announced no sockets",
            ));
        };
        self.session_on(endpoint).await
    }

    /// Like [`ProcessHandle::new_session`] for a named endpoint.
    pub async fn new_session_on(&self, name: &str) -> io::Result<Session> {
        let Some(endpoint) = self.sockets.iter().find(|socket| socket.name() == name) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("the application announced no socket named {name:?}"),
            ));
        };
        self.session_on(endpoint).await
    }

    async fn session_on(&self, endpoint: &SocketEndpoint) -> io::Result<Session> {
        let connection = endpoint.pool().checkout().await;
        Ok(Session::new(connection, self.connect_password.clone()))
    }
}
