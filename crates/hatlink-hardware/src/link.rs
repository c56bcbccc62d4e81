//! Serial link transport.
//!
//! The link is split once at start-up: the [`LinkReader`] is owned by a
//! single task (first the boot sequence, then the reader loop) while the
//! [`LinkWriter`] is shared by every caller. The HAT has no framing that
//! could disambiguate interleaved writes, so the writer holds an async mutex
//! across the whole of each write.
//!
//! Any `AsyncRead + AsyncWrite` stream works: a UART opened with
//! [`open_serial`], or one end of `tokio::io::duplex` in tests.

use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;
use tracing::debug;

use hatlink_core::{
    HatError, Result,
    constants::{ETX, STX},
};
use hatlink_protocol::HatLineCodec;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half of the link, yielding trimmed lines.
pub struct LinkReader {
    lines: FramedRead<BoxedRead, HatLineCodec>,
}

impl LinkReader {
    pub fn new(inner: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            lines: FramedRead::new(Box::new(inner), HatLineCodec::new()),
        }
    }

    /// Read the next line, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` if nothing complete arrived in time. Blank lines
    /// are returned as `""`.
    ///
    /// # Errors
    /// Returns `HatError::LinkClosed` at end of stream, or the underlying
    /// I/O error.
    pub async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        match tokio::time::timeout(timeout, self.lines.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(HatError::LinkClosed),
            Ok(Some(Err(e))) => Err(e),
            Ok(Some(Ok(line))) => {
                if !line.is_empty() {
                    debug!("< {line}");
                }
                Ok(Some(line))
            }
        }
    }
}

impl std::fmt::Debug for LinkReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkReader").finish_non_exhaustive()
    }
}

/// Serialized write half of the link.
pub struct LinkWriter {
    inner: Mutex<BoxedWrite>,
}

impl LinkWriter {
    pub fn new(inner: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            inner: Mutex::new(Box::new(inner)),
        }
    }

    /// Write one command line. `command` carries its own `\r` terminator.
    ///
    /// # Errors
    /// Returns `HatError::Io` if the write fails.
    pub async fn write_command(&self, command: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.write_all(command.as_bytes()).await?;
        inner.flush().await?;
        debug!("> {}", command.trim_end());
        Ok(())
    }

    /// Write a binary payload framed as `STX payload ETX \r`.
    ///
    /// The payload itself is not logged; `label` stands in for it.
    ///
    /// # Errors
    /// Returns `HatError::Io` if the write fails.
    pub async fn write_framed(&self, payload: &[u8], label: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.write_all(&[STX]).await?;
        inner.write_all(payload).await?;
        inner.write_all(&[ETX, b'\r']).await?;
        inner.flush().await?;
        debug!("> <STX> {label} ({} bytes) <ETX>", payload.len());
        Ok(())
    }
}

impl std::fmt::Debug for LinkWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkWriter").finish_non_exhaustive()
    }
}

/// Split a bidirectional stream into its reader and writer.
pub fn split<S>(stream: S) -> (LinkReader, LinkWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    (LinkReader::new(read), LinkWriter::new(write))
}

/// Open the HAT UART: 8 data bits, no parity, one stop bit, no flow control.
///
/// # Errors
/// Returns `HatError::Io` if the device cannot be opened.
#[cfg(feature = "serial")]
pub fn open_serial(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| HatError::Io(e.into()))?;
    debug!(path, baud_rate, "Opened serial link");
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_command_bytes() {
        let (ours, mut theirs) = tokio::io::duplex(256);
        let (_reader, writer) = split(ours);

        writer.write_command("port 0 ; on\r").await.unwrap();

        let mut buf = vec![0u8; 12];
        theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"port 0 ; on\r");
    }

    #[tokio::test]
    async fn test_write_framed_bytes() {
        let (ours, mut theirs) = tokio::io::duplex(256);
        let (_reader, writer) = split(ours);

        writer.write_framed(&[0xaa, 0xbb], "payload").await.unwrap();

        let mut buf = vec![0u8; 5];
        theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [STX, 0xaa, 0xbb, ETX, b'\r']);
    }

    #[tokio::test]
    async fn test_read_line_and_timeout() {
        let (ours, mut theirs) = tokio::io::duplex(256);
        let (mut reader, _writer) = split(ours);

        theirs.write_all(b"P0: ramp done\r\n").await.unwrap();
        assert_eq!(
            reader.read_line(Duration::from_millis(100)).await.unwrap(),
            Some("P0: ramp done".to_string())
        );
        assert_eq!(reader.read_line(Duration::from_millis(20)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_line_reports_closed_link() {
        let (ours, theirs) = tokio::io::duplex(256);
        let (mut reader, _writer) = split(ours);
        drop(theirs);

        let err = reader.read_line(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, HatError::LinkClosed));
    }
}
