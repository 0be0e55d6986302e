//! Accepted connections that keep the owning listener from exiting.

use crate::drain::ConnectionGuard;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// A connection accepted by a [`RestartableListener`](crate::RestartableListener).
///
/// While it is open the listener's process will not exit. Call
/// [`close`](DrainingConnection::close) when done; dropping the connection
/// releases it as well, so the drain can never be wedged by a forgotten
/// close. The release happens exactly once either way.
#[derive(Debug)]
pub struct DrainingConnection {
    stream: TcpStream,
    guard: Option<ConnectionGuard>,
}

impl DrainingConnection {
    pub(crate) fn new(stream: TcpStream, guard: ConnectionGuard) -> Self {
        Self {
            stream,
            guard: Some(guard),
        }
    }

    /// Shut the stream down and release the connection.
    ///
    /// The release happens even when the shutdown fails; the shutdown error is
    /// returned to the caller.
    pub async fn close(mut self) -> io::Result<()> {
        let result = self.stream.shutdown().await;
        self.guard.take();
        result
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}

impl AsyncRead for DrainingConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for DrainingConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drain::ConnectionCounter;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_close_releases_counter() {
        let counter = ConnectionCounter::new();
        let (_client, server) = connected_pair().await;

        let conn = DrainingConnection::new(server, counter.register());
        assert_eq!(counter.active(), 1);

        conn.close().await.unwrap();
        assert_eq!(counter.active(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_counter() {
        let counter = ConnectionCounter::new();
        let (_client, server) = connected_pair().await;

        let conn = DrainingConnection::new(server, counter.register());
        assert_eq!(counter.active(), 1);
        drop(conn);
        assert_eq!(counter.active(), 0);
    }

    #[tokio::test]
    async fn test_reads_and_writes_forward() {
        let counter = ConnectionCounter::new();
        let (mut client, server) = connected_pair().await;
        let mut conn = DrainingConnection::new(server, counter.register());

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client.write_all(b"pong").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        assert_eq!(conn.peer_addr().unwrap(), client.local_addr().unwrap());
        conn.close().await.unwrap();

        // The peer observes EOF after close.
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_close_releases_even_when_shutdown_fails() {
        let counter = ConnectionCounter::new();
        let (client, server) = connected_pair().await;
        let mut conn = DrainingConnection::new(server, counter.register());

        // A second shutdown on a socket whose peer is gone may fail.
        drop(client);
        let _ = conn.shutdown().await;
        let _ = conn.close().await;
        assert_eq!(counter.active(), 0);
    }
}
