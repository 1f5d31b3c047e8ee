//! Mesh radio sink.
//!
//! Each entry of a snapshot becomes one short text message on a fixed
//! channel, e.g. `Temperature: 21.5 C`. The radio itself is reached through
//! the [`TextChannel`] trait; [`MeshtasticLink`] implements it over the
//! Meshtastic serial client framing:
//!
//! ```text
//! 0x94 0xC3 <len hi> <len lo> <protobuf ToRadio>
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fieldlink_common::DataBlock;
use prost::Message;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::task::JoinHandle;
use tokio_serial::SerialStream;

use crate::dispatcher::{DispatchReport, Sink, SinkError, SinkKind};
use crate::journal::Journal;
use crate::snapshot::Snapshot;

/// Largest text payload the radio accepts, in bytes.
pub const MESH_TEXT_LIMIT: usize = 228;

const FRAME_START1: u8 = 0x94;
const FRAME_START2: u8 = 0xC3;
const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;
const TEXT_MESSAGE_APP: i32 = 1;
const WAKE_PREAMBLE_LEN: usize = 32;

/// Errors from the mesh radio link.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("message is {len} bytes, limit is {limit}")]
    TooLong { len: usize, limit: usize },

    #[error("mesh link is down")]
    LinkDown,

    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("mesh I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Send-text capability of a mesh radio.
pub trait TextChannel: Send {
    /// Whether the link can still carry messages.
    fn is_alive(&self) -> bool;

    /// Broadcast `text` on the given channel index.
    fn send_text(
        &mut self,
        text: &str,
        channel: u32,
    ) -> impl Future<Output = Result<(), MeshError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Maps sensor keys to the labels shown on handheld radios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
    labels: HashMap<String, String>,
}

impl Default for LabelTable {
    fn default() -> Self {
        let labels = [
            ("RPI_TIMESTAMP", "Timestamp"),
            ("TEMP", "Temperature"),
            ("HUMIDITY", "Humidity"),
            ("PRESSURE", "Pressure"),
            ("UV", "UV Intensity"),
            ("NO2", "NO2"),
            ("C2H5OH", "C2H5OH"),
            ("VOC", "VOC"),
            ("CO", "CO"),
            ("CPM", "CPM"),
            ("USVH", "Radiation (uSv/h)"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self { labels }
    }
}

impl LabelTable {
    /// Built-in labels with configured overrides applied on top.
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Self {
        let mut table = Self::default();
        table
            .labels
            .extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        table
    }

    /// Label for a key; unmapped keys are shown as-is.
    pub fn label<'a>(&'a self, key: &'a str) -> &'a str {
        self.labels.get(key).map(String::as_str).unwrap_or(key)
    }
}

/// One message per entry, in block order.
pub fn format_mesh_messages(block: &DataBlock, labels: &LabelTable) -> Vec<String> {
    block
        .entries()
        .iter()
        .map(|e| format!("{}: {}", labels.label(&e.key), e.value))
        .collect()
}

// Minimal subset of the Meshtastic protobufs needed to broadcast text.

#[derive(Clone, PartialEq, prost::Message)]
struct Data {
    #[prost(int32, tag = "1")]
    portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    payload: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct MeshPacket {
    #[prost(fixed32, tag = "2")]
    to: u32,
    #[prost(uint32, tag = "3")]
    channel: u32,
    #[prost(message, optional, tag = "4")]
    decoded: Option<Data>,
    #[prost(uint32, tag = "9")]
    hop_limit: u32,
    #[prost(bool, tag = "10")]
    want_ack: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
struct ToRadio {
    #[prost(message, optional, tag = "1")]
    packet: Option<MeshPacket>,
    #[prost(uint32, optional, tag = "3")]
    want_config_id: Option<u32>,
}

fn frame(msg: &ToRadio) -> Vec<u8> {
    let payload = msg.encode_to_vec();
    let len = payload.len() as u16;
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&[FRAME_START1, FRAME_START2]);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

fn text_frame(text: &str, channel: u32, hop_limit: u32) -> Vec<u8> {
    frame(&ToRadio {
        packet: Some(MeshPacket {
            to: BROADCAST_ADDR,
            channel,
            decoded: Some(Data {
                portnum: TEXT_MESSAGE_APP,
                payload: text.as_bytes().to_vec(),
            }),
            hop_limit,
            want_ack: false,
        }),
        want_config_id: None,
    })
}

fn want_config_frame(id: u32) -> Vec<u8> {
    frame(&ToRadio {
        packet: None,
        want_config_id: Some(id),
    })
}

/// Meshtastic radio over a serial byte stream.
///
/// Inbound traffic (config dump, node info, received packets) is drained in
/// the background so the radio never stalls on a full buffer. End of the
/// inbound stream marks the link dead.
#[derive(Debug)]
pub struct MeshtasticLink<W> {
    path: String,
    writer: W,
    alive: Arc<AtomicBool>,
    drain: Option<JoinHandle<()>>,
    write_timeout: Duration,
    hop_limit: u32,
}

impl MeshtasticLink<WriteHalf<SerialStream>> {
    /// Open a radio on a serial port and wake it up.
    pub async fn open(
        path: &str,
        baud_rate: u32,
        write_timeout: Duration,
        hop_limit: u32,
    ) -> Result<Self, MeshError> {
        let builder = tokio_serial::new(path, baud_rate);
        let stream = SerialStream::open(&builder).map_err(|source| MeshError::Open {
            path: path.to_string(),
            source,
        })?;
        let (reader, writer) = tokio::io::split(stream);
        Self::attach(path, reader, writer, write_timeout, hop_limit).await
    }
}

impl<W: AsyncWrite + Unpin + Send> MeshtasticLink<W> {
    /// Wrap an already open stream pair and send the wake-up sequence.
    pub async fn attach<R>(
        path: &str,
        reader: R,
        writer: W,
        write_timeout: Duration,
        hop_limit: u32,
    ) -> Result<Self, MeshError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let drain = tokio::spawn(drain_inbound(path.to_string(), reader, alive.clone()));

        let mut link = Self {
            path: path.to_string(),
            writer,
            alive,
            drain: Some(drain),
            write_timeout,
            hop_limit,
        };

        link.write_frame(&[FRAME_START2; WAKE_PREAMBLE_LEN]).await?;
        let config_id = config_request_id();
        link.write_frame(&want_config_frame(config_id)).await?;
        tracing::info!(port = %path, want_config_id = format!("0x{:08x}", config_id), "Mesh radio link open");

        Ok(link)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn write_frame(&mut self, bytes: &[u8]) -> Result<(), MeshError> {
        let write = async {
            self.writer.write_all(bytes).await?;
            self.writer.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.alive.store(false, Ordering::SeqCst);
                Err(MeshError::Io(e))
            }
            Err(_) => Err(MeshError::Timeout(self.write_timeout)),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> TextChannel for MeshtasticLink<W> {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn send_text(&mut self, text: &str, channel: u32) -> Result<(), MeshError> {
        if !self.is_alive() {
            return Err(MeshError::LinkDown);
        }
        if text.len() > MESH_TEXT_LIMIT {
            return Err(MeshError::TooLong {
                len: text.len(),
                limit: MESH_TEXT_LIMIT,
            });
        }
        let bytes = text_frame(text, channel, self.hop_limit);
        self.write_frame(&bytes).await
    }

    async fn close(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(port = %self.path, error = %e, "Error shutting down mesh writer");
        }
        tracing::info!(port = %self.path, "Mesh radio link closed");
    }
}

async fn drain_inbound<R: AsyncRead + Unpin>(path: String, mut reader: R, alive: Arc<AtomicBool>) {
    let mut buf = [0u8; 512];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::warn!(port = %path, "Mesh radio closed the link");
                break;
            }
            Ok(n) => tracing::trace!(port = %path, bytes = n, "Mesh inbound drained"),
            Err(e) => {
                tracing::warn!(port = %path, error = %e, "Mesh radio read error");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
}

fn config_request_id() -> u32 {
    let nanos = chrono::Utc::now().timestamp_subsec_nanos();
    nanos.max(1)
}

/// Sends snapshots to the mesh, one message per entry.
#[derive(Debug)]
pub struct MeshSink<C> {
    channel: Option<C>,
    channel_index: u32,
    gap: Duration,
    labels: LabelTable,
    journal: Journal,
}

impl<C: TextChannel> MeshSink<C> {
    /// `channel` is `None` when no radio was found; every tick is then
    /// logged as skipped.
    pub fn new(
        channel: Option<C>,
        channel_index: u32,
        gap: Duration,
        labels: LabelTable,
        journal: Journal,
    ) -> Self {
        Self {
            channel,
            channel_index,
            gap,
            labels,
            journal,
        }
    }

    fn skip(&self, reason: &str, lines: usize) -> SinkError {
        self.journal.record(
            "mesh_send_skipped",
            json!({ "reason": reason, "num_data_lines": lines }),
        );
        SinkError::Unavailable(format!("mesh radio ({reason})"))
    }
}

impl<C: TextChannel> Sink for MeshSink<C> {
    fn kind(&self) -> SinkKind {
        SinkKind::Mesh
    }

    async fn dispatch(&mut self, snapshot: &Snapshot) -> Result<DispatchReport, SinkError> {
        let messages = format_mesh_messages(snapshot.block(), &self.labels);

        let alive = self.channel.as_ref().map(|c| c.is_alive());
        match alive {
            None => return Err(self.skip("interface not available", messages.len())),
            Some(false) => return Err(self.skip("link lost", messages.len())),
            Some(true) => {}
        }
        if messages.is_empty() {
            return Err(SinkError::Empty("block has no entries".to_string()));
        }

        self.journal.record(
            "mesh_send_batch_start",
            json!({ "num_data_lines": messages.len() }),
        );

        let mut report = DispatchReport::default();
        let count = messages.len();
        for (i, message) in messages.iter().enumerate() {
            let Some(channel) = self.channel.as_mut() else {
                break;
            };
            match channel.send_text(message, self.channel_index).await {
                Ok(()) => {
                    report.sent += 1;
                    tracing::debug!(channel = self.channel_index, message = %message, "Mesh message sent");
                    self.journal.record(
                        "mesh_send_text_success",
                        json!({ "message": message, "channel_index": self.channel_index }),
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(message = %message, error = %e, "Mesh message failed");
                    self.journal.record(
                        "mesh_send_text_error",
                        json!({ "message": message, "error": e.to_string() }),
                    );
                }
            }
            if i + 1 < count {
                tokio::time::sleep(self.gap).await;
            }
        }

        self.journal.record(
            "mesh_send_batch_complete",
            json!({ "sent": report.sent, "failed": report.failed }),
        );

        if report.sent == 0 {
            return Err(SinkError::AllFailed {
                failed: report.failed,
            });
        }
        Ok(report)
    }

    async fn close(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            channel.close().await;
        }
        self.journal.record("mesh_closed", json!({}));
    }
}
