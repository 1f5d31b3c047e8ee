//! Line-oriented serial session to the sensor terminal.

use std::future::Future;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_serial::SerialStream;

/// Errors on the sensor link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Link is closed")]
    Closed,
}

/// A stream of text lines from a device.
pub trait LineSource: Send {
    /// Device path this source reads from.
    fn path(&self) -> &str;

    /// Next line with surrounding whitespace removed.
    ///
    /// `Ok(None)` means the device went away. Must be cancel-safe: a
    /// partially received line is kept for the next call.
    fn next_line(&mut self) -> impl Future<Output = Result<Option<String>, LinkError>> + Send;

    /// Release the device.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens [`LineSource`]s by path.
pub trait LinkOpener: Send + Sync {
    type Source: LineSource;

    fn open(&self, path: &str) -> impl Future<Output = Result<Self::Source, LinkError>> + Send;
}

/// Serial link reading newline-terminated UTF-8.
///
/// Invalid UTF-8 is replaced rather than rejected; the terminal firmware
/// occasionally emits garbage right after a reset.
#[derive(Debug)]
pub struct SerialLink<S = SerialStream> {
    path: String,
    reader: Option<BufReader<S>>,
    buf: Vec<u8>,
}

impl SerialLink<SerialStream> {
    /// Open a serial port at the given baud rate.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, LinkError> {
        let builder = tokio_serial::new(path, baud_rate);
        let stream = SerialStream::open(&builder).map_err(|source| LinkError::Open {
            path: path.to_string(),
            source,
        })?;
        Ok(Self::from_stream(path, stream))
    }
}

impl<S: AsyncRead + Unpin + Send> SerialLink<S> {
    /// Wrap an already open byte stream.
    pub fn from_stream(path: impl Into<String>, stream: S) -> Self {
        Self {
            path: path.into(),
            reader: Some(BufReader::new(stream)),
            buf: Vec::with_capacity(256),
        }
    }

    /// Whether the link has not been closed.
    pub fn is_alive(&self) -> bool {
        self.reader.is_some()
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        line
    }
}

impl<S: AsyncRead + Unpin + Send> LineSource for SerialLink<S> {
    fn path(&self) -> &str {
        &self.path
    }

    async fn next_line(&mut self) -> Result<Option<String>, LinkError> {
        let reader = self.reader.as_mut().ok_or(LinkError::Closed)?;
        let n = reader.read_until(b'\n', &mut self.buf).await?;

        if n == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.take_line()))
    }

    async fn close(&mut self) {
        if self.reader.take().is_some() {
            tracing::debug!(port = %self.path, "Serial link closed");
        }
        self.buf.clear();
    }
}

/// Opens real serial ports.
#[derive(Debug, Clone, Copy)]
pub struct SerialOpener {
    baud_rate: u32,
}

impl SerialOpener {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl LinkOpener for SerialOpener {
    type Source = SerialLink;

    async fn open(&self, path: &str) -> Result<SerialLink, LinkError> {
        SerialLink::open(path, self.baud_rate)
    }
}
