//! Per-connection read/write tasks and peer handles
//!
//! Each TCP connection gets a writer task draining a bounded outbound queue
//! and a reader task forwarding decoded frames to the node's mailbox. A
//! read or write timeout closes the connection and discards its queue.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use super::{NetworkMessage, MAX_FRAME_BYTES, MAX_PENDING_MESSAGES};
use crate::error::{ChainError, ChainResult};

/// Close an idle connection after this long without a frame
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Give up on a blocked socket write after this long
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Events delivered from connection tasks to the owning node
#[derive(Debug)]
pub enum PeerEvent {
    /// A decoded inbound frame; `reply` writes back on the same connection
    Message {
        message: NetworkMessage,
        reply: mpsc::Sender<NetworkMessage>,
        remote_addr: String,
    },
    /// The connection closed or timed out
    Disconnected { remote_addr: String },
}

/// A connected peer: its id, observed address, and outbound queue
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub peer_id: String,
    pub address: String,
    sender: mpsc::Sender<NetworkMessage>,
}

impl PeerHandle {
    pub fn new(peer_id: &str, address: &str, sender: mpsc::Sender<NetworkMessage>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            address: address.to_string(),
            sender,
        }
    }

    /// Queue a message without blocking; a full queue drops the message
    pub fn send(&self, message: NetworkMessage) -> ChainResult<()> {
        self.sender.try_send(message).map_err(|e| {
            warn!(peer = %self.peer_id, "outbound queue rejected message");
            ChainError::Network(format!("send to {} failed: {e}", self.peer_id))
        })
    }
}

/// Spawn reader and writer tasks for an established connection.
///
/// Returns the outbound sender; inbound frames and the eventual disconnect
/// arrive on `events`.
pub fn spawn_connection(
    stream: TcpStream,
    events: mpsc::Sender<PeerEvent>,
) -> mpsc::Sender<NetworkMessage> {
    let remote_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<NetworkMessage>(MAX_PENDING_MESSAGES);

    // writer: drain the bounded queue onto the socket
    let writer_addr = remote_addr.clone();
    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let frame = message.encode_frame();
            match timeout(WRITE_TIMEOUT, write_half.write_all(frame.as_bytes())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(peer = %writer_addr, error = %e, "write failed, closing connection");
                    break;
                }
                Err(_) => {
                    warn!(peer = %writer_addr, "write timed out, closing connection");
                    break;
                }
            }
        }
    });

    // reader: decode newline-delimited frames and forward them
    let reply = out_tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::with_capacity(MAX_FRAME_BYTES, read_half).lines();
        loop {
            match timeout(READ_IDLE_TIMEOUT, lines.next_line()).await {
                Ok(Ok(Some(line))) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match NetworkMessage::decode(&line) {
                        Ok(message) => {
                            let event = PeerEvent::Message {
                                message,
                                reply: reply.clone(),
                                remote_addr: remote_addr.clone(),
                            };
                            if events.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => debug!(peer = %remote_addr, error = %e, "dropping malformed frame"),
                    }
                }
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    debug!(peer = %remote_addr, error = %e, "read failed");
                    break;
                }
                Err(_) => {
                    debug!(peer = %remote_addr, "connection idle, closing");
                    break;
                }
            }
        }
        let _ = events.send(PeerEvent::Disconnected { remote_addr }).await;
    });

    out_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MessageType;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_flow_between_two_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server_events_tx, mut server_events_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            spawn_connection(stream, server_events_tx);
        });

        let (client_events_tx, _client_events_rx) = mpsc::channel(16);
        let client = TcpStream::connect(addr).await.unwrap();
        let client_out = spawn_connection(client, client_events_tx);

        let hello = NetworkMessage::new(MessageType::Handshake, "client", "hi".to_string());
        client_out.send(hello.clone()).await.unwrap();

        match server_events_rx.recv().await.unwrap() {
            PeerEvent::Message { message, reply, .. } => {
                assert_eq!(message, hello);
                // reply path works too
                reply
                    .send(NetworkMessage::new(MessageType::Ack, "server", String::new()))
                    .await
                    .unwrap();
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
