//! Framing for the two channels every client holds.
//!
//! The text channel carries newline-terminated UTF-8 lines. The file channel
//! carries self-delimited blobs: a `u16` big-endian name length, the name
//! bytes, a `u64` big-endian payload length, then exactly that many raw bytes.

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
};
use tracing::debug;

use crate::error::{RelayError, Result};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub const MAX_FILE_NAME_LEN: usize = u16::MAX as usize;

// Upper bound on what a declared length may reserve up front; the rest grows as bytes arrive.
const PREALLOCATE_LIMIT: u64 = 1024 * 1024;

const COPY_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub len: u64,
}

/// Reads one line, without its terminator. `None` means the peer closed the
/// stream before sending anything else.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let bytes = reader.read_until(b'\n', &mut buf).await?;
    if bytes == 0 {
        return Ok(None);
    }
    // Exactly one terminator: `\n`, optionally preceded by a single `\r`.
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }

    let line = match String::from_utf8(buf) {
        Ok(line) => line,
        Err(err) => {
            debug!("line is not valid UTF-8; decoding lossily");
            String::from_utf8_lossy(err.as_bytes()).into_owned()
        }
    };

    Ok(Some(line))
}

/// Writes `line` plus the terminator and flushes. Lines carrying their own
/// line break are refused before anything reaches the stream.
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if line.contains(LINE_ENDINGS) {
        return Err(RelayError::EmbeddedNewline);
    }

    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_file_header<W>(writer: &mut W, name: &str, len: u64) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let name_len =
        u16::try_from(name.len()).map_err(|_| RelayError::FileNameTooLong(name.len()))?;

    let mut header = Vec::with_capacity(2 + name.len() + 8);
    header.extend_from_slice(&name_len.to_be_bytes());
    header.extend_from_slice(name.as_bytes());
    header.extend_from_slice(&len.to_be_bytes());
    writer.write_all(&header).await?;
    Ok(())
}

pub async fn write_file_frame<W>(writer: &mut W, name: &str, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_file_header(writer, name, payload.len() as u64).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_file_header<R>(reader: &mut R) -> Result<FileHeader>
where
    R: AsyncRead + Unpin,
{
    let name_len = reader.read_u16().await?;
    let mut name = vec![0u8; usize::from(name_len)];
    reader.read_exact(&mut name).await?;
    let len = reader.read_u64().await?;

    let name = match String::from_utf8(name) {
        Ok(name) => name,
        Err(err) => {
            debug!("file name is not valid UTF-8; decoding lossily");
            String::from_utf8_lossy(err.as_bytes()).into_owned()
        }
    };

    Ok(FileHeader { name, len })
}

// A stream that ends early is a failed transfer, not a short file.
pub async fn read_payload<R>(reader: &mut R, len: u64) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut payload = Vec::with_capacity(len.min(PREALLOCATE_LIMIT) as usize);
    let received = (&mut *reader).take(len).read_to_end(&mut payload).await? as u64;
    if received < len {
        return Err(RelayError::Truncated {
            expected: len,
            received,
        });
    }
    Ok(payload)
}

pub async fn discard_payload<R>(reader: &mut R, len: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut limited = (&mut *reader).take(len);
    let received = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
    if received < len {
        return Err(RelayError::Truncated {
            expected: len,
            received,
        });
    }
    Ok(())
}

/// Streams exactly `len` payload bytes from `reader` into `sink`.
///
/// Read failures are fatal and returned as such. A failing `sink` does not
/// stop the read: the remaining bytes are drained and the first write error
/// is reported once the payload has been consumed.
pub async fn copy_payload<R, W>(
    reader: &mut R,
    sink: &mut W,
    len: u64,
) -> Result<std::result::Result<(), std::io::Error>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut received = 0u64;
    let mut write_error = None;

    while received < len {
        let want = (len - received).min(COPY_BUFFER_SIZE as u64) as usize;
        let read = reader.read(&mut buffer[..want]).await?;
        if read == 0 {
            return Err(RelayError::Truncated {
                expected: len,
                received,
            });
        }
        received += read as u64;

        if write_error.is_none() {
            if let Err(err) = sink.write_all(&buffer[..read]).await {
                write_error = Some(err);
            }
        }
    }

    if write_error.is_none() {
        if let Err(err) = sink.flush().await {
            write_error = Some(err);
        }
    }

    Ok(match write_error {
        Some(err) => Err(err),
        None => Ok(()),
    })
}
