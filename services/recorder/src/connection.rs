//! Per-connection protocol state machine.
//!
//! One instance per accepted client. Drives handshake → recording → finish
//! as an explicit state variable with a switch over the message type in each
//! state. Every byte chunk is pushed into the unpacker and all complete
//! messages it yields are processed strictly in arrival order;
//! acknowledgements go out in the same order.
//!
//! Errors here are local to the connection: an invalid or unexpected message
//! gets a best-effort `status` error reply, the experiment's end time is set
//! and the connection closes. Other connections are unaffected.

use std::sync::Arc;

use rec_protocol::codec::{encode, MessageUnpacker};
use rec_protocol::messages::{Message, PROTOCOL_MAJOR};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::interface::ExperimentInterface;

/// Peer address of an accepted connection, as recorded in the `address`
/// metadata entry.
#[derive(Debug, Clone)]
pub enum PeerAddr {
    Tcp(std::net::SocketAddr),
    /// Bound socket path; UNIX peer sockets are typically unnamed.
    Unix(String),
    Unknown,
}

impl PeerAddr {
    fn metadata_value(&self) -> String {
        match self {
            PeerAddr::Tcp(addr) => format!("{}:{}", addr.ip(), addr.port()).to_lowercase(),
            PeerAddr::Unix(path) => path.clone(),
            PeerAddr::Unknown => {
                warn!("could not obtain address for client");
                String::new()
            }
        }
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{addr}"),
            PeerAddr::Unix(path) => write!(f, "{path}"),
            PeerAddr::Unknown => write!(f, "<unknown>"),
        }
    }
}

#[derive(Clone, Copy)]
enum ConnState {
    AwaitVersion,
    Recording { experiment_id: Uuid },
}

/// Whether the connection keeps running after a message or chunk.
enum Flow {
    Continue,
    Close,
}

pub struct Connection<S> {
    stream: S,
    peer: PeerAddr,
    interface: Arc<ExperimentInterface>,
    unpacker: MessageUnpacker,
    state: ConnState,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S, peer: PeerAddr, interface: Arc<ExperimentInterface>) -> Self {
        Connection {
            stream,
            peer,
            interface,
            unpacker: MessageUnpacker::new(),
            state: ConnState::AwaitVersion,
        }
    }

    /// Drive the connection until the client finishes, an error closes it,
    /// or shutdown is signalled. Never propagates errors to the caller.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(peer = %self.peer, "client connected");
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                res = self.stream.read(&mut buf) => match res {
                    Ok(0) => {
                        // Clean close counts as completion.
                        self.finish_assigned_experiment();
                        break;
                    }
                    Ok(n) => {
                        if matches!(self.process_chunk(&buf[..n]).await, Flow::Close) {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(peer = %self.peer, error = %err, "read failed");
                        self.finish_assigned_experiment();
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    debug!(peer = %self.peer, "closing connection for shutdown");
                    self.finish_assigned_experiment();
                    break;
                }
            }
        }
        info!(peer = %self.peer, "client disconnected");
    }

    /// Push a received chunk and process every complete message it yields,
    /// in order.
    async fn process_chunk(&mut self, chunk: &[u8]) -> Flow {
        self.unpacker.feed(chunk);
        loop {
            match self.unpacker.next_value() {
                Ok(Some(value)) => {
                    let msg = match Message::from_wire(&value) {
                        Ok(msg) => msg,
                        Err(err) => {
                            warn!(peer = %self.peer, error = %err, "invalid message");
                            return self.reject_and_close().await;
                        }
                    };
                    if matches!(self.handle_message(msg).await, Flow::Close) {
                        return Flow::Close;
                    }
                }
                Ok(None) => return Flow::Continue,
                Err(err) => {
                    warn!(peer = %self.peer, error = %err, "frame decode failed");
                    return self.reject_and_close().await;
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: Message) -> Flow {
        match (self.state, msg) {
            (ConnState::AwaitVersion, Message::Version { major, minor }) => {
                self.handle_version(major, minor).await
            }
            (
                ConnState::Recording { experiment_id },
                Message::Record {
                    timestamp,
                    variables,
                },
            ) => {
                match self
                    .interface
                    .record_variables(experiment_id, timestamp, &variables)
                {
                    Ok(count) => {
                        let count = i64::try_from(count).unwrap_or(i64::MAX);
                        self.reply(&Message::status_recorded(count)).await
                    }
                    Err(err) => {
                        warn!(peer = %self.peer, error = %err, "record failed");
                        self.internal_error_and_close().await
                    }
                }
            }
            (ConnState::Recording { experiment_id }, Message::Metadata(pairs)) => {
                match self.interface.add_metadata(experiment_id, &pairs) {
                    Ok(()) => self.reply(&Message::status_ok()).await,
                    Err(err) => {
                        warn!(peer = %self.peer, error = %err, "metadata upsert failed");
                        self.internal_error_and_close().await
                    }
                }
            }
            (ConnState::Recording { experiment_id }, Message::Finish) => {
                info!(peer = %self.peer, %experiment_id, "experiment finished by client");
                if let Err(err) = self.interface.finish_experiment_instance(experiment_id) {
                    warn!(peer = %self.peer, error = %err, "finish failed");
                }
                Flow::Close
            }
            (_, other) => {
                warn!(
                    peer = %self.peer,
                    message_type = other.type_name(),
                    "unexpected message for connection state"
                );
                self.reject_and_close().await
            }
        }
    }

    async fn handle_version(&mut self, major: i64, minor: i64) -> Flow {
        if major != PROTOCOL_MAJOR {
            // Incompatible client: no welcome, no experiment row.
            warn!(
                peer = %self.peer,
                client_version = format!("{major}.{minor}"),
                "incompatible protocol version"
            );
            return Flow::Close;
        }
        let experiment_id = match self.interface.new_experiment_instance() {
            Ok(id) => id,
            Err(err) => {
                warn!(peer = %self.peer, error = %err, "could not create experiment");
                return self.internal_error_and_close().await;
            }
        };
        let address: std::collections::BTreeMap<String, String> =
            std::iter::once(("address".to_owned(), self.peer.metadata_value())).collect();
        if let Err(err) = self.interface.add_metadata(experiment_id, &address) {
            warn!(peer = %self.peer, error = %err, "address metadata failed");
        }
        if matches!(
            self.send(&Message::Welcome {
                instance_id: experiment_id,
            })
            .await,
            Flow::Close
        ) {
            self.finish_experiment(experiment_id);
            return Flow::Close;
        }
        self.state = ConnState::Recording { experiment_id };
        Flow::Continue
    }

    /// Best-effort "Invalid message." reply, then finish and close.
    async fn reject_and_close(&mut self) -> Flow {
        let _ = self.send(&Message::status_error("Invalid message.")).await;
        self.finish_assigned_experiment();
        Flow::Close
    }

    /// Best-effort "Internal error." reply, then finish and close.
    async fn internal_error_and_close(&mut self) -> Flow {
        let _ = self.send(&Message::status_error("Internal error.")).await;
        self.finish_assigned_experiment();
        Flow::Close
    }

    /// Send a reply; a failed write closes the connection.
    async fn reply(&mut self, msg: &Message) -> Flow {
        match self.send(msg).await {
            Flow::Continue => Flow::Continue,
            Flow::Close => {
                self.finish_assigned_experiment();
                Flow::Close
            }
        }
    }

    async fn send(&mut self, msg: &Message) -> Flow {
        let bytes = match encode(&msg.to_wire()) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(peer = %self.peer, error = %err, "encode failed");
                return Flow::Close;
            }
        };
        match self.stream.write_all(&bytes).await {
            Ok(()) => Flow::Continue,
            Err(err) => {
                debug!(peer = %self.peer, error = %err, "write failed");
                Flow::Close
            }
        }
    }

    fn finish_assigned_experiment(&mut self) {
        if let ConnState::Recording { experiment_id } = self.state {
            self.finish_experiment(experiment_id);
        }
    }

    fn finish_experiment(&self, experiment_id: Uuid) {
        if let Err(err) = self.interface.finish_experiment_instance(experiment_id) {
            warn!(peer = %self.peer, error = %err, "could not set experiment end");
        }
    }
}
