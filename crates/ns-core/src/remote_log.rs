//! Remote log listener (§5, router variant): accepts TCP connections on a
//! configured address and forwards each received line to the logger. It
//! owns its own accept loop; failures reconnect by accepting the next
//! connection; shutdown is by closing its listening socket (dropping the
//! `JoinHandle`'s owning task when the watch channel fires).

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Anything that can absorb a received log line. Kept generic so callers
/// can route lines into `tracing`, a buffer, or both.
pub trait LineSink: Send + Sync {
    fn accept_line(&self, line: &str);
}

/// Run the accept loop until `shutdown` fires. Each accepted connection is
/// read line-by-line until EOF or error; the loop then goes back to
/// accepting the next connection.
pub async fn run(
    bind_addr: &str,
    sink: Arc<dyn LineSink>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("remote log listener shutting down");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "remote log listener accept failed");
                        continue;
                    }
                };
                debug!(%peer, "remote log connection accepted");
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stream).lines();
                    loop {
                        match lines.next_line().await {
                            Ok(Some(line)) => sink.accept_line(&line),
                            Ok(None) => break,
                            Err(e) => {
                                warn!(error = %e, "remote log connection read failed");
                                break;
                            }
                        }
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    struct CollectingSink {
        lines: Mutex<Vec<String>>,
    }

    impl LineSink for CollectingSink {
        fn accept_line(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_owned());
        }
    }

    #[tokio::test]
    async fn forwards_received_lines_to_sink() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = Arc::new(CollectingSink {
            lines: Mutex::new(Vec::new()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let bind = addr.to_string();
        let sink_clone = Arc::clone(&sink);
        let server = tokio::spawn(async move { run(&bind, sink_clone, shutdown_rx).await });

        // Give the listener a moment to bind.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello\nworld\n").await.unwrap();
        client.shutdown().await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        let _ = server.await;

        let lines = sink.lines.lock().unwrap();
        assert_eq!(*lines, vec!["hello".to_owned(), "world".to_owned()]);
    }
}
