//! Asynchronous client for the experiment recording protocol.
//!
//! Connects over TCP or a UNIX socket, performs the `version`/`welcome`
//! handshake and exposes the three client operations: metadata upserts,
//! variable records and the terminal finish. The protocol is strictly
//! request/response within one connection, so every send awaits its matching
//! `status` before returning.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rec_protocol::codec::{encode, DecodeError, EncodeError, MessageUnpacker};
use rec_protocol::messages::{
    InvalidMessage, Message, Sample, StatusDetail, PROTOCOL_MAJOR, PROTOCOL_MINOR,
};
use rec_protocol::value::WireValue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::net::ToSocketAddrs;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Invalid(#[from] InvalidMessage),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server rejected the request: {0}")]
    Rejected(String),
}

/// Experiment time source.
///
/// Maps monotonic elapsed run time onto UTC timestamps anchored at the epoch,
/// so recorded timestamps are relative offsets into the run.
#[derive(Debug, Clone)]
pub struct ExperimentClock {
    start: Instant,
}

impl ExperimentClock {
    pub fn new() -> Self {
        ExperimentClock {
            start: Instant::now(),
        }
    }

    /// Current experiment timestamp (epoch + elapsed, microsecond precision).
    pub fn timestamp(&self) -> DateTime<Utc> {
        let elapsed = self.start.elapsed();
        #[allow(clippy::cast_possible_wrap)]
        let micros = elapsed.as_micros() as i64;
        DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::UNIX_EPOCH)
    }
}

impl Default for ExperimentClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A connected, handshaken recording client.
pub struct RecorderClient<S> {
    stream: S,
    unpacker: MessageUnpacker,
    experiment_id: Uuid,
    clock: ExperimentClock,
}

impl RecorderClient<TcpStream> {
    /// Connect over TCP and perform the handshake.
    pub async fn connect_tcp<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        Self::handshake(stream).await
    }
}

#[cfg(unix)]
impl RecorderClient<UnixStream> {
    /// Connect over a UNIX socket and perform the handshake.
    pub async fn connect_unix(path: &std::path::Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).await?;
        Self::handshake(stream).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> RecorderClient<S> {
    /// Perform the `version`/`welcome` handshake on an established stream.
    ///
    /// The server answers a major-version mismatch by closing the connection
    /// without a `welcome`; that surfaces here as a protocol error.
    pub async fn handshake(stream: S) -> Result<Self, ClientError> {
        let mut client = RecorderClient {
            stream,
            unpacker: MessageUnpacker::new(),
            experiment_id: Uuid::nil(),
            clock: ExperimentClock::new(),
        };
        client
            .send(&Message::Version {
                major: PROTOCOL_MAJOR,
                minor: PROTOCOL_MINOR,
            })
            .await?;
        match client.recv().await? {
            Message::Welcome { instance_id } => {
                debug!(%instance_id, "handshake complete");
                client.experiment_id = instance_id;
                Ok(client)
            }
            Message::Status { detail, .. } => Err(ClientError::Rejected(detail_text(&detail))),
            other => Err(ClientError::Protocol(format!(
                "expected welcome, got {}",
                other.type_name()
            ))),
        }
    }

    /// The experiment instance id assigned by the server.
    pub fn experiment_id(&self) -> Uuid {
        self.experiment_id
    }

    pub fn clock(&self) -> &ExperimentClock {
        &self.clock
    }

    /// Upsert metadata pairs; awaits the acknowledgement.
    pub async fn send_metadata(
        &mut self,
        pairs: BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        self.send(&Message::Metadata(pairs)).await?;
        self.await_status().await?;
        Ok(())
    }

    /// Record variable samples stamped with the experiment clock.
    ///
    /// Returns the server-reported count of recorded samples.
    pub async fn record_variables(
        &mut self,
        variables: BTreeMap<String, Sample>,
    ) -> Result<i64, ClientError> {
        let timestamp = self.clock.timestamp();
        self.record_variables_at(timestamp, variables).await
    }

    /// Record variable samples with an explicit timestamp.
    pub async fn record_variables_at(
        &mut self,
        timestamp: DateTime<Utc>,
        variables: BTreeMap<String, Sample>,
    ) -> Result<i64, ClientError> {
        self.send(&Message::Record {
            timestamp,
            variables,
        })
        .await?;
        let detail = self.await_status().await?;
        Ok(recorded_count(&detail))
    }

    /// Send the terminal `finish` and wait for the server to close the
    /// connection, guaranteeing the experiment end time is set on return.
    pub async fn finish(mut self) -> Result<(), ClientError> {
        self.send(&Message::Finish).await?;
        let mut buf = [0u8; 1024];
        loop {
            if self.stream.read(&mut buf).await? == 0 {
                return Ok(());
            }
        }
    }

    async fn send(&mut self, msg: &Message) -> Result<(), ClientError> {
        let bytes = encode(&msg.to_wire())?;
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Message, ClientError> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(value) = self.unpacker.next_value()? {
                return Ok(Message::from_wire(&value)?);
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(ClientError::Protocol(
                    "connection closed by server".to_owned(),
                ));
            }
            self.unpacker.feed(&buf[..n]);
        }
    }

    /// Wait for the next `status`; a failure status is an error.
    async fn await_status(&mut self) -> Result<StatusDetail, ClientError> {
        match self.recv().await? {
            Message::Status { success: true, detail } => Ok(detail),
            Message::Status {
                success: false,
                detail,
            } => Err(ClientError::Rejected(detail_text(&detail))),
            other => Err(ClientError::Protocol(format!(
                "expected status, got {}",
                other.type_name()
            ))),
        }
    }
}

fn detail_text(detail: &StatusDetail) -> String {
    match detail {
        StatusDetail::None => "no detail".to_owned(),
        StatusDetail::Info(v) | StatusDetail::Error(v) => match v {
            WireValue::Str(s) => s.clone(),
            other => format!("{other:?}"),
        },
    }
}

fn recorded_count(detail: &StatusDetail) -> i64 {
    if let StatusDetail::Info(WireValue::Map(map)) = detail {
        if let Some(WireValue::Int(n)) = map.get("recorded") {
            return *n;
        }
    }
    0
}
