use std::io;
use std::os::fd::RawFd;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use crate::pool::ConnectionStream;
use crate::pool::PooledConnection;
use crate::request;

/// One checked-out connection to an application, plus the secret every
/// request must carry. The connection goes back to its pool when the
/// session drops, unless the session half-closed it or read it to EOF.
#[derive(Debug)]
pub struct Session {
    connection: PooledConnection,
    connect_password: String,
}

impl Session {
    pub(crate) fn new(connection: PooledConnection, connect_password: String) -> Self {
        Self {
            connection,
            connect_password,
        }
    }

    /// Establishes the connection if the reserved slot is not connected yet.
    pub async fn initiate(&mut self) -> io::Result<()> {
        self.connection.connect().await.map(|_| ())
    }

    /// Descriptor of the underlying socket, once initiated.
    pub fn fd(&self) -> Option<RawFd> {
        self.connection.as_raw_fd()
    }

    pub fn connect_password(&self) -> &str {
        &self.connect_password
    }

    /// Raw access to the stream for callers that drive the exchange themselves.
    pub fn stream_mut(&mut self) -> io::Result<&mut ConnectionStream> {
        self.connection.stream_mut()
    }

    /// Writes one framed request whose headers end with the connect password.
    pub async fn send_request(&mut self, headers: &[(&str, &str)]) -> io::Result<()> {
        let body = request::encode_headers(headers, &self.connect_password)?;
        let stream = self.connection.connect().await?;
        request::write_scalar_message(stream, &body).await
    }

    /// Writes raw bytes, initiating the connection first if needed.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let stream = self.connection.connect().await?;
        stream.write_all(data).await?;
        stream.flush().await
    }

    /// Half-closes the write side. The connection is not reused afterwards.
    pub async fn shutdown_writer(&mut self) -> io::Result<()> {
        self.connection.discard();
        self.connection.stream_mut()?.shutdown().await
    }

    /// Reads until the application closes its side.
    pub async fn read_response(&mut self) -> io::Result<Vec<u8>> {
        self.connection.discard();
        let mut response = Vec::new();
        self.connection
            .stream_mut()?
            .read_to_end(&mut response)
            .await?;
        Ok(response)
    }
}
