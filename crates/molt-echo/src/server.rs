//! Line echo service.
//!
//! Every connection is greeted with `hello from <pid>` so clients can tell
//! which generation of the process served them, then each line is echoed
//! back until the client disconnects or sends `quit`.

use molt::{is_transient, Connection, Listener};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn, Instrument};

/// Pause after the process runs out of descriptors before accepting again.
const RESOURCE_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections until the listener is closed.
///
/// Each connection is served on its own task. Returns once `accept` fails
/// with a non-transient error, which is how a closed listener reports itself.
pub async fn serve<L>(listener: Arc<L>)
where
    L: Listener + 'static,
    L::Conn: 'static,
{
    let pid = std::process::id();
    match listener.local_addr() {
        Ok(addr) => info!(%addr, pid, "Echo server accepting connections"),
        Err(e) => warn!(error = %e, pid, "Echo server accepting on unknown address"),
    }

    loop {
        match listener.accept().await {
            Ok(conn) => {
                let span = tracing::debug_span!("connection", pid);
                tokio::spawn(
                    async move {
                        if let Err(e) = handle(conn, pid).await {
                            debug!(error = %e, "Connection ended with error");
                        }
                    }
                    .instrument(span),
                );
            }
            Err(e) if is_transient(&e) => {
                warn!(error = %e, "Transient accept error");
                if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                    tokio::time::sleep(RESOURCE_BACKOFF).await;
                }
            }
            Err(e) => {
                info!(error = %e, "Accept loop stopped");
                break;
            }
        }
    }
}

/// Serve a single client, then close the connection.
async fn handle<C: Connection>(conn: C, pid: u32) -> io::Result<()> {
    let mut stream = BufReader::new(conn);
    stream
        .write_all(format!("hello from {pid}\n").as_bytes())
        .await?;

    let mut line = String::new();
    let result = loop {
        line.clear();
        match stream.read_line(&mut line).await {
            Ok(0) => break Ok(()),
            Ok(_) => {
                if line.trim_end() == "quit" {
                    break Ok(());
                }
                if let Err(e) = stream.write_all(line.as_bytes()).await {
                    break Err(e);
                }
            }
            Err(e) => break Err(e),
        }
    };

    let closed = stream.into_inner().close().await;
    debug!("Connection closed");
    result.and(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt::{ListenerState, RestartConfig, RestartableListener};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn test_config() -> RestartConfig {
        RestartConfig::default()
            .with_inherited_fd(4000)
            .with_restart_signal(libc::SIGWINCH)
            .with_exit_process(false)
            .with_label("echo-test")
    }

    async fn start() -> (Arc<RestartableListener>, tokio::task::JoinHandle<()>) {
        let listener = Arc::new(
            RestartableListener::bind("127.0.0.1:0", test_config())
                .await
                .unwrap(),
        );
        let task = tokio::spawn(serve(Arc::clone(&listener)));
        (listener, task)
    }

    async fn read_line(reader: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_greets_and_echoes() {
        let (listener, _task) = start().await;

        let stream = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut reader = BufReader::new(stream);

        let greeting = read_line(&mut reader).await;
        assert_eq!(greeting, format!("hello from {}\n", std::process::id()));

        reader.get_mut().write_all(b"ping\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "ping\n");

        reader.get_mut().write_all(b"second line\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "second line\n");

        listener.shutdown();
    }

    #[tokio::test]
    async fn test_quit_closes_connection() {
        let (listener, _task) = start().await;

        let stream = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut reader = BufReader::new(stream);
        read_line(&mut reader).await;

        reader.get_mut().write_all(b"quit\n").await.unwrap();

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        tokio::time::timeout(Duration::from_secs(5), async {
            while listener.active_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        listener.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_clients() {
        let (listener, task) = start().await;

        let stream = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut reader = BufReader::new(stream);
        read_line(&mut reader).await;

        listener.shutdown();

        // The accept loop ends as soon as the listener closes.
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let mut state = listener.subscribe();
        state
            .wait_for(|s| *s == ListenerState::Draining)
            .await
            .unwrap();

        // Existing clients are still served while draining.
        reader.get_mut().write_all(b"still here\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "still here\n");

        drop(reader);
        tokio::time::timeout(Duration::from_secs(5), listener.wait_exited())
            .await
            .unwrap();
        assert_eq!(listener.state(), ListenerState::Exited);
    }
}
