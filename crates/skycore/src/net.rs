//! Socket plumbing between the reactor and the outside world.
//!
//! Each accepted socket is split: a reader task forwards raw byte chunks to
//! the reactor's single event channel, and a writer task drains that
//! connection's outbound frames. All protocol state stays inside the reactor
//! task — the reader does not parse, the writer does not inspect. A dead
//! socket surfaces as a `Closed` event; the writer side fails quietly and
//! lets the reader report the loss.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::connection::{Connection, OutFrame};
use crate::ConnId;

/// Events flowing from socket tasks into the reactor.
#[derive(Debug)]
pub enum NetEvent {
    /// Raw bytes read from a peer.
    Bytes { id: ConnId, data: Bytes },
    /// The peer's socket is gone.
    Closed { id: ConnId, reason: Option<String> },
}

/// Writer-side handle the reactor holds per connection.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<OutFrame>,
}

impl Outbound {
    pub fn send(&self, frame: OutFrame) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// Move a connection's staged frames onto its socket writer.
///
/// Returns false when the writer is gone; the caller treats that like any
/// other connection error.
pub fn flush_outbox(conn: &mut Connection, outbound: &Outbound) -> bool {
    for frame in conn.take_outbox() {
        if !outbound.send(frame) {
            return false;
        }
    }
    true
}

/// Spawn the read side of a socket, forwarding chunks to the reactor.
pub fn spawn_reader(
    id: ConnId,
    mut read_half: OwnedReadHalf,
    events: mpsc::Sender<NetEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    debug!(conn = id.0, "peer closed connection");
                    let _ = events.send(NetEvent::Closed { id, reason: None }).await;
                    break;
                }
                Ok(n) => {
                    trace!(conn = id.0, bytes = n, "read");
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if events.send(NetEvent::Bytes { id, data }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = events
                        .send(NetEvent::Closed { id, reason: Some(e.to_string()) })
                        .await;
                    break;
                }
            }
        }
    })
}

/// Spawn the write side of a socket, draining one connection's frames.
pub fn spawn_writer(
    id: ConnId,
    mut write_half: OwnedWriteHalf,
) -> (Outbound, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutFrame>();
    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let bytes = match &frame {
                OutFrame::Line(line) => Bytes::copy_from_slice(line.as_bytes()),
                OutFrame::Raw(raw) => raw.clone(),
            };
            if let Err(e) = write_half.write_all(&bytes).await {
                debug!(conn = id.0, error = %e, "write failed, dropping writer");
                break;
            }
        }
    });
    (Outbound { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn reader_and_writer_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server_sock, _) = listener.accept().await.unwrap();

        let id = ConnId(1);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (server_read, server_write) = server_sock.into_split();
        spawn_reader(id, server_read, events_tx);
        let (outbound, _) = spawn_writer(id, server_write);

        // Server side stages a greeting through a Connection outbox.
        let mut conn = Connection::accepted(id, Instant::now());
        conn.send_line("S 3", Instant::now());
        assert!(flush_outbox(&mut conn, &outbound));

        let (mut client_read, mut client_write) = client.into_split();
        let mut buf = vec![0u8; 64];
        let n = client_read.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"S 3\n");

        // Client speaks; the reactor sees raw bytes then the close.
        client_write.write_all(b"login observer\n").await.unwrap();
        drop(client_write);
        drop(client_read);

        match events_rx.recv().await.unwrap() {
            NetEvent::Bytes { id: got, data } => {
                assert_eq!(got, id);
                assert_eq!(&data[..], b"login observer\n");
            }
            other => panic!("unexpected event {other:?}"),
        }
        match events_rx.recv().await.unwrap() {
            NetEvent::Closed { id: got, .. } => assert_eq!(got, id),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
