//! Accept loop and per-socket receive loop

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::dispatcher::{Dispatcher, InboundSource};
use super::events::{NodeEvent, OfflineReason};
use crate::error::{Error, Result};
use crate::protocol::{Message, ProtocolError};

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Open the listening socket
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::bind(addr, e))
}

/// Accept connections until `shutdown` flips to true
///
/// Each accepted socket gets its own receive task. The tasks are aborted
/// when the loop stops.
pub async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(%remote, "Accepted connection");
                    let (reader, writer) = stream.into_split();
                    sessions.spawn(receive_loop(
                        dispatcher.clone(),
                        BufReader::new(reader),
                        InboundSource::accepted(Box::new(writer)),
                        remote.to_string(),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    sessions.shutdown().await;
    info!("Listener stopped");
}

/// Longest accepted wire line, newline excluded
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// One newline-terminated chunk of a peer's stream
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(Vec<u8>),
    /// Longer than the limit; its bytes were discarded up to the newline
    Oversized,
    End,
}

/// Read the next line without buffering more than `limit` bytes of it
///
/// A final line without a newline is still returned before `End`.
async fn next_frame<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut oversized = false;

    loop {
        let (used, complete) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(if oversized {
                    Frame::Oversized
                } else if buf.is_empty() {
                    Frame::End
                } else {
                    Frame::Line(std::mem::take(buf))
                });
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let end = newline.unwrap_or(available.len());
            if !oversized {
                if buf.len() + end > limit {
                    oversized = true;
                    buf.clear();
                } else {
                    buf.extend_from_slice(&available[..end]);
                }
            }
            (newline.map_or(end, |i| i + 1), newline.is_some())
        };
        reader.consume(used);

        if complete {
            return Ok(if oversized {
                Frame::Oversized
            } else {
                Frame::Line(std::mem::take(buf))
            });
        }
    }
}

/// Read lines from one socket and hand each decoded message to the dispatcher
///
/// Ends at end of stream, on a read error, when the connection this
/// socket is registered as gets closed elsewhere, or when the node shuts
/// down. A malformed, oversized or non-UTF-8 line is logged and skipped.
pub async fn receive_loop<R>(
    dispatcher: Arc<Dispatcher>,
    mut reader: R,
    mut source: InboundSource,
    remote: String,
) where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();

    loop {
        let established = source.connection().cloned();
        let next = tokio::select! {
            frame = next_frame(&mut reader, &mut buf, MAX_LINE_LEN) => frame,
            _ = async {
                match &established {
                    Some(connection) => connection.closed().await,
                    None => std::future::pending().await,
                }
            } => {
                debug!(%remote, "Connection closed locally, ending receive loop");
                return;
            }
            _ = dispatcher.shutting_down() => {
                // Connections are closed by the node after it says goodbye
                debug!(%remote, "Node shutting down, ending receive loop");
                return;
            }
        };

        let frame = match next {
            Ok(Frame::End) => {
                debug!(%remote, "Peer closed the stream");
                break;
            }
            Ok(frame) => frame,
            Err(e) => {
                debug!(%remote, error = %e, "Read failed");
                break;
            }
        };

        // Any traffic proves liveness, even a line we cannot use
        if let Some(connection) = &established {
            connection.touch();
        }

        let bytes = match frame {
            Frame::Line(bytes) => bytes,
            _ => {
                drop_line(&dispatcher, &remote, ProtocolError::LineTooLong { limit: MAX_LINE_LEN });
                continue;
            }
        };

        let line = match String::from_utf8(bytes) {
            Ok(line) => line,
            Err(_) => {
                drop_line(&dispatcher, &remote, ProtocolError::InvalidEncoding);
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message = match Message::decode(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(%remote, %line, error = %e, "Dropping malformed line");
                dispatcher.events().error(format!("from {}", remote), &e);
                continue;
            }
        };

        if let Err(e) = dispatcher.on_message(message, Some(&mut source)).await {
            warn!(%remote, error = %e.format_for_log(), "Failed to handle message");
            dispatcher.events().error(format!("from {}", remote), &e);
        }
    }

    if let Some(connection) = source.take_connection() {
        if dispatcher.registry().remove_if_current(&connection).await {
            info!(peer = %connection.identity(), "Peer connection lost");
            dispatcher.events().emit(NodeEvent::PeerOffline {
                peer: connection.identity().clone(),
                reason: OfflineReason::ConnectionLost,
            });
        }
    }
}

fn drop_line(dispatcher: &Dispatcher, remote: &str, error: ProtocolError) {
    warn!(%remote, error = %error, "Dropping unreadable line");
    dispatcher.events().error(format!("from {}", remote), &error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::events::EventSink;
    use crate::peer::PeerRegistry;
    use crate::protocol::PeerIdentity;
    use tokio::io::AsyncWriteExt;

    fn dispatcher() -> (Arc<Dispatcher>, tokio::sync::mpsc::Receiver<NodeEvent>) {
        let (events, rx) = EventSink::channel(16);
        let local = PeerIdentity::new("127.0.0.1", 5000, "alice").unwrap();
        let dispatcher = Dispatcher::new(
            local,
            Arc::new(PeerRegistry::new()),
            events,
            Duration::from_secs(1),
        );
        (Arc::new(dispatcher), rx)
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_end_loop() {
        let (dispatcher, mut events) = dispatcher();
        let (mut remote, local) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(local);

        let task = tokio::spawn(receive_loop(
            dispatcher.clone(),
            BufReader::new(read_half),
            InboundSource::accepted(Box::new(write_half)),
            "test".into(),
        ));

        remote
            .write_all(b"GARBAGE\n\nPOKE 127.0.0.1 5001 bob\n")
            .await
            .unwrap();

        assert!(matches!(events.recv().await, Some(NodeEvent::Error { .. })));
        assert!(matches!(events.recv().await, Some(NodeEvent::PeerOnline { .. })));
        assert_eq!(dispatcher.registry().len(), 1);

        // End of stream drops the registration
        drop(remote);
        task.await.unwrap();
        assert!(dispatcher.registry().is_empty());
        assert!(matches!(
            events.recv().await,
            Some(NodeEvent::PeerOffline {
                reason: OfflineReason::ConnectionLost,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_non_utf8_line_does_not_end_loop() {
        let (dispatcher, mut events) = dispatcher();
        let (mut remote, local) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(local);

        tokio::spawn(receive_loop(
            dispatcher.clone(),
            BufReader::new(read_half),
            InboundSource::accepted(Box::new(write_half)),
            "test".into(),
        ));

        remote
            .write_all(b"MESSAGE 127.0.0.1 1 x caf\xe9\nPOKE 127.0.0.1 5001 bob\n")
            .await
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(NodeEvent::Error {
                context: "from test".into(),
                message: ProtocolError::InvalidEncoding.to_string(),
            })
        );
        assert!(matches!(events.recv().await, Some(NodeEvent::PeerOnline { .. })));
        assert_eq!(dispatcher.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_receive_loop_ends_on_shutdown_without_removing() {
        let (dispatcher, _events) = dispatcher();
        let (mut remote, local) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(local);

        let task = tokio::spawn(receive_loop(
            dispatcher.clone(),
            BufReader::new(read_half),
            InboundSource::accepted(Box::new(write_half)),
            "test".into(),
        ));
        remote.write_all(b"POKE 127.0.0.1 5001 bob\n").await.unwrap();
        let mut replies = BufReader::new(&mut remote).lines();
        replies.next_line().await.unwrap();

        dispatcher.begin_shutdown();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("receive loop should stop")
            .unwrap();

        // Left registered so the node can still say goodbye before closing
        assert_eq!(dispatcher.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_next_frame_skips_oversized_lines() {
        let mut reader: &[u8] = b"short\ntoolongline\nok";
        let mut buf = Vec::new();

        assert_eq!(
            next_frame(&mut reader, &mut buf, 5).await.unwrap(),
            Frame::Line(b"short".to_vec())
        );
        assert_eq!(next_frame(&mut reader, &mut buf, 5).await.unwrap(), Frame::Oversized);
        assert_eq!(
            next_frame(&mut reader, &mut buf, 5).await.unwrap(),
            Frame::Line(b"ok".to_vec())
        );
        assert_eq!(next_frame(&mut reader, &mut buf, 5).await.unwrap(), Frame::End);
    }

    #[tokio::test]
    async fn test_next_frame_across_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"aaaa")
            .read(b"aaaa\nPOKE")
            .read(b" x\n")
            .build();
        let mut reader = BufReader::new(mock);
        let mut buf = Vec::new();

        assert_eq!(next_frame(&mut reader, &mut buf, 6).await.unwrap(), Frame::Oversized);
        assert_eq!(
            next_frame(&mut reader, &mut buf, 6).await.unwrap(),
            Frame::Line(b"POKE x".to_vec())
        );
        assert_eq!(next_frame(&mut reader, &mut buf, 6).await.unwrap(), Frame::End);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let first = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let taken = first.local_addr().unwrap();

        let err = bind(taken).await.unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_accept_loop_stops_on_shutdown() {
        let (dispatcher, _events) = dispatcher();
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(listener, dispatcher, rx));
        tx.send_replace(true);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("accept loop should stop")
            .unwrap();
    }
}
