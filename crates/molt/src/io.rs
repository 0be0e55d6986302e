//! Capability traits for listeners and the connections they accept.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Something that accepts connections until it is closed.
#[async_trait]
pub trait Listener: Send + Sync {
    type Conn: Connection;

    /// Wait for the next connection.
    async fn accept(&self) -> io::Result<Self::Conn>;

    /// Stop accepting. Pending and later `accept` calls fail.
    fn close(&self);

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// A bidirectional byte stream that is closed explicitly.
#[async_trait]
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + Sized {
    async fn close(self) -> io::Result<()>;
}
