use log::{debug, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::error::{FramingError, HeaderField, TransferError, TransferPhase};
use super::events::{EventSink, TransferDirection};
use super::progress::{ProgressObserver, PROGRESS_UPDATE_INTERVAL};
use super::sinks::SinkFactory;

// Constants for file transfer
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024; // 64KB chunks
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_MAX_FILENAME_LEN: u64 = 64 * 1024;
pub const DEFAULT_MAX_CONTENT_LEN: u64 = 64 * 1024 * 1024 * 1024; // 64GB

/// Upper bounds applied to incoming headers before anything is allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_filename_len: u64,
    pub max_content_len: u64,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_filename_len: DEFAULT_MAX_FILENAME_LEN,
            max_content_len: DEFAULT_MAX_CONTENT_LEN,
        }
    }
}

/// Configuration for sending and receiving frames
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Size of chunks used when streaming payload bytes
    pub chunk_size: usize,
    /// Limits enforced on received headers
    pub limits: FrameLimits,
    /// Minimum time between progress events
    pub progress_interval: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            limits: FrameLimits::default(),
            progress_interval: PROGRESS_UPDATE_INTERVAL,
        }
    }
}

/// Header of one frame: `i64 filename_len | filename | i64 content_len`,
/// integers little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub filename: String,
    pub content_length: u64,
}

impl TransferHeader {
    /// Serialize the header into its wire form
    pub fn encode(&self) -> Result<Vec<u8>, TransferError> {
        let name = self.filename.as_bytes();
        let name_len = i64::try_from(name.len()).map_err(|_| TransferError::FilenameTooLong)?;
        let content_len = i64::try_from(self.content_length).map_err(|_| TransferError::Send {
            phase: TransferPhase::Header,
            source: io::Error::new(io::ErrorKind::InvalidInput, "content length exceeds i64"),
        })?;

        let mut buf = Vec::with_capacity(16 + name.len());
        buf.extend_from_slice(&name_len.to_le_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&content_len.to_le_bytes());
        Ok(buf)
    }

    /// Read a header, returning `PeerClosed` if the stream ends before the
    /// first byte of it.
    pub async fn read_from<R>(reader: &mut R, limits: &FrameLimits) -> Result<Self, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let name_len = match read_i64_or_eof(reader).await {
            Ok(Some(value)) => value,
            Ok(None) => return Err(TransferError::PeerClosed),
            Err(source) => {
                return Err(FramingError::Read {
                    field: HeaderField::FilenameLength,
                    source,
                }
                .into())
            }
        };
        let name_len = non_negative(HeaderField::FilenameLength, name_len)?;
        if name_len > limits.max_filename_len {
            return Err(FramingError::FilenameTooLong {
                len: name_len,
                max: limits.max_filename_len,
            }
            .into());
        }

        let mut name_buf = vec![0u8; name_len as usize];
        reader
            .read_exact(&mut name_buf)
            .await
            .map_err(|source| FramingError::Read {
                field: HeaderField::Filename,
                source,
            })?;
        let filename = String::from_utf8(name_buf).map_err(|_| FramingError::InvalidFilename)?;

        let mut len_buf = [0u8; 8];
        reader
            .read_exact(&mut len_buf)
            .await
            .map_err(|source| FramingError::Read {
                field: HeaderField::ContentLength,
                source,
            })?;
        let content_length =
            non_negative(HeaderField::ContentLength, i64::from_le_bytes(len_buf))?;
        if content_length > limits.max_content_len {
            return Err(FramingError::ContentTooLarge {
                len: content_length,
                max: limits.max_content_len,
            }
            .into());
        }

        Ok(Self {
            filename,
            content_length,
        })
    }
}

/// Outcome of one received frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub transfer_id: Uuid,
    pub filename: String,
    pub bytes_written: u64,
}

/// Write one frame carrying `file_size` bytes read from `source`.
///
/// Returns the number of payload bytes sent. Nothing is rolled back on
/// failure; the receiver sees a truncated frame.
pub async fn send_file<R, W>(
    source: &mut R,
    file_size: u64,
    filename: &str,
    transport: &mut W,
    options: &TransferOptions,
    events: &EventSink,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let header = TransferHeader {
        filename: filename.to_string(),
        content_length: file_size,
    };
    transport
        .write_all(&header.encode()?)
        .await
        .map_err(|source| TransferError::Send {
            phase: TransferPhase::Header,
            source,
        })?;
    debug!("Sent header for {} ({} bytes)", filename, file_size);

    let mut observer =
        ProgressObserver::new(filename, file_size, TransferDirection::Sending, events.clone())
            .with_interval(options.progress_interval);
    let mut buffer = vec![0u8; options.chunk_size.max(1)];
    let mut sent: u64 = 0;

    while sent < file_size {
        let max_bytes = std::cmp::min(buffer.len() as u64, file_size - sent) as usize;
        let n = source
            .read(&mut buffer[..max_bytes])
            .await
            .map_err(TransferError::SourceRead)?;

        if n == 0 {
            return Err(TransferError::SourceExhausted {
                expected: file_size,
                read: sent,
            });
        }

        transport
            .write_all(&buffer[..n])
            .await
            .map_err(|source| TransferError::Send {
                phase: TransferPhase::Payload,
                source,
            })?;
        sent += n as u64;
        observer.on_write(n);
    }

    transport.flush().await.map_err(|source| TransferError::Send {
        phase: TransferPhase::Payload,
        source,
    })?;
    observer.finish();

    Ok(sent)
}

/// Read one frame from `transport` and stream its payload into a sink
/// opened for it.
///
/// Exactly `content_length` bytes are consumed, so the next frame can follow
/// on the same stream.
pub async fn receive_one<R>(
    transport: &mut R,
    sinks: &dyn SinkFactory,
    options: &TransferOptions,
    events: &EventSink,
) -> Result<ReceivedFile, TransferError>
where
    R: AsyncRead + Unpin,
{
    let header = TransferHeader::read_from(transport, &options.limits).await?;
    info!(
        "Receiving file: {}, size: {}B",
        header.filename, header.content_length
    );

    let mut sink = sinks
        .open(&header)
        .await
        .map_err(|source| TransferError::SinkOpen {
            filename: header.filename.clone(),
            source,
        })?;

    let mut observer = ProgressObserver::new(
        header.filename.clone(),
        header.content_length,
        TransferDirection::Receiving,
        events.clone(),
    )
    .with_interval(options.progress_interval);
    let mut buffer = vec![0u8; options.chunk_size.max(1)];
    let mut received: u64 = 0;

    while received < header.content_length {
        let remaining = header.content_length - received;
        let max_bytes = std::cmp::min(buffer.len() as u64, remaining) as usize;
        let n = match transport.read(&mut buffer[..max_bytes]).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Read failed after {} bytes of {}: {}", received, header.filename, e);
                0
            }
        };

        if n == 0 {
            // Flush what arrived; the sink owner decides whether to keep it
            if let Err(e) = sink.flush().await {
                warn!("Failed to flush partial {}: {}", header.filename, e);
            }
            return Err(TransferError::Truncated {
                expected: header.content_length,
                received,
            });
        }

        sink.write_all(&buffer[..n])
            .await
            .map_err(TransferError::SinkWrite)?;
        observer.on_write(n);
        received += n as u64;
    }

    sink.flush().await.map_err(TransferError::SinkWrite)?;
    sink.shutdown().await.map_err(TransferError::SinkWrite)?;
    observer.finish();

    Ok(ReceivedFile {
        transfer_id: observer.transfer_id(),
        filename: header.filename,
        bytes_written: received,
    })
}

/// Dial `destination` and send one frame read from `source`.
///
/// Emits exactly one log notice describing the outcome.
pub async fn send_stream_to<R>(
    source: &mut R,
    file_size: u64,
    filename: &str,
    destination: &str,
    options: &TransferOptions,
    events: &EventSink,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
{
    let result = dial_and_send(source, file_size, filename, destination, options, events).await;
    report_send(events, filename, destination, &result);
    result
}

/// Send the file at `path` to `destination`, taking size and name from
/// the file's metadata.
pub async fn send_path_to(
    path: &Path,
    destination: &str,
    options: &TransferOptions,
    events: &EventSink,
) -> Result<u64, TransferError> {
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let result = async {
        if path.file_name().is_none() {
            return Err(TransferError::SourceRead(io::Error::new(
                io::ErrorKind::InvalidInput,
                "path has no file name",
            )));
        }
        let file = File::open(path).await.map_err(TransferError::SourceRead)?;
        let file_size = file
            .metadata()
            .await
            .map_err(TransferError::SourceRead)?
            .len();
        let mut reader = BufReader::new(file);
        dial_and_send(&mut reader, file_size, &filename, destination, options, events).await
    }
    .await;

    report_send(events, &filename, destination, &result);
    result
}

/// Start sending `path` to `destination` in the background
pub fn initiate_send(
    path: PathBuf,
    destination: String,
    options: TransferOptions,
    events: EventSink,
) -> JoinHandle<Result<u64, TransferError>> {
    tokio::spawn(async move { send_path_to(&path, &destination, &options, &events).await })
}

async fn dial_and_send<R>(
    source: &mut R,
    file_size: u64,
    filename: &str,
    destination: &str,
    options: &TransferOptions,
    events: &EventSink,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut socket = TcpStream::connect(destination).await?;
    info!("Sending {} ({} bytes) to {}", filename, file_size, destination);

    let sent = send_file(source, file_size, filename, &mut socket, options, events).await?;

    // Half-close so the receiver sees a clean end of stream
    if let Err(e) = socket.shutdown().await {
        debug!("Failed to shut down connection to {}: {}", destination, e);
    }
    Ok(sent)
}

fn report_send(
    events: &EventSink,
    filename: &str,
    destination: &str,
    result: &Result<u64, TransferError>,
) {
    match result {
        Ok(bytes) => {
            info!("Finished sending {} to {} ({} bytes)", filename, destination, bytes);
            events.notice(format!("Finished sending {}", filename));
        }
        Err(e) => {
            warn!("Failed to send {} to {}: {}", filename, destination, e);
            events.notice(format!("Failed to send {} to {}: {}", filename, destination, e));
        }
    }
}

async fn read_i64_or_eof<R>(reader: &mut R) -> io::Result<Option<i64>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    Ok(Some(i64::from_le_bytes(buf)))
}

fn non_negative(field: HeaderField, value: i64) -> Result<u64, FramingError> {
    u64::try_from(value).map_err(|_| FramingError::NegativeLength { field, value })
}
