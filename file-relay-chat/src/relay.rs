//! Chat and file relay protocol built on top of [`crate::frame`].
//!
//! A file travels in two steps on two independent connections: an announce
//! line on the recipient's text channel (`FILE_TRANSFER <name> <len>`), then
//! the matching file frame on its file channel. Readers must consume the frame
//! right after the announce that describes it; nothing else ties them together.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use tokio::{
    fs::File,
    io::{AsyncRead, AsyncWrite},
};
use tracing::{debug, warn};

use crate::{
    error::{RelayError, Result},
    frame::{self, FileHeader},
};

pub const ANNOUNCE_PREFIX: &str = "FILE_TRANSFER";

pub const UPLOAD_DIRECTIVE: &str = "/upload";

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
        }
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.sender, self.text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl FileTransfer {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn announce(&self) -> String {
        announce(&self.name, self.len())
    }
}

// An argument after the directive is tolerated and ignored.
pub fn is_upload_directive(line: &str) -> bool {
    line == UPLOAD_DIRECTIVE
        || line
            .strip_prefix(UPLOAD_DIRECTIVE)
            .is_some_and(|rest| rest.starts_with(' '))
}

pub fn announce(name: &str, len: u64) -> String {
    format!("{ANNOUNCE_PREFIX} {name} {len}")
}

/// Parses an announce line. `Ok(None)` means the line is ordinary chat.
pub fn parse_announce(line: &str) -> Result<Option<FileHeader>> {
    let Some(rest) = line
        .strip_prefix(ANNOUNCE_PREFIX)
        .and_then(|rest| rest.strip_prefix(' '))
    else {
        return Ok(None);
    };

    let (name, len) = rest
        .rsplit_once(' ')
        .ok_or_else(|| RelayError::MalformedAnnounce(line.to_string()))?;
    let len = len
        .parse::<u64>()
        .map_err(|_| RelayError::MalformedAnnounce(line.to_string()))?;
    if name.is_empty() {
        return Err(RelayError::MalformedAnnounce(line.to_string()));
    }

    Ok(Some(FileHeader {
        name: name.to_string(),
        len,
    }))
}

pub async fn send_payload<W>(writer: &mut W, transfer: &FileTransfer) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    frame::write_file_frame(writer, &transfer.name, &transfer.bytes).await
}

pub async fn receive_payload<R>(reader: &mut R, declared_len: u64) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    frame::read_payload(reader, declared_len).await
}

/// Reads one upload frame from a client's file channel.
///
/// Rejections that are not fatal (see [`RelayError::is_fatal`]) have already
/// drained the payload, so the channel is positioned on the next frame.
pub async fn receive_upload<R>(reader: &mut R, max_bytes: u64) -> Result<FileTransfer>
where
    R: AsyncRead + Unpin,
{
    let header = frame::read_file_header(reader).await?;

    if header.len > max_bytes {
        frame::discard_payload(reader, header.len).await?;
        return Err(RelayError::PayloadTooLarge {
            len: header.len,
            limit: max_bytes,
        });
    }

    // The name is echoed into announce lines, which cannot carry a line break.
    if header.name.is_empty() || header.name.contains(['\n', '\r']) {
        frame::discard_payload(reader, header.len).await?;
        return Err(RelayError::InvalidFileName(header.name));
    }

    let bytes = receive_payload(reader, header.len).await?;
    Ok(FileTransfer::new(header.name, bytes))
}

// Only the final path component of the announced name is used.
pub fn local_path(dir: &Path, announced: &str) -> Result<PathBuf> {
    let file_name = Path::new(announced)
        .file_name()
        .ok_or_else(|| RelayError::InvalidFileName(announced.to_string()))?;
    Ok(dir.join(file_name))
}

/// Streams the payload described by `header` into `dir`, replacing any
/// existing file of the same name.
///
/// Local failures abort only this transfer: the rest of the payload is drained
/// and a non-fatal error returned.
pub async fn save_payload<R>(reader: &mut R, header: &FileHeader, dir: &Path) -> Result<PathBuf>
where
    R: AsyncRead + Unpin,
{
    let path = match local_path(dir, &header.name) {
        Ok(path) => path,
        Err(err) => {
            frame::discard_payload(reader, header.len).await?;
            return Err(err);
        }
    };

    let mut file = match File::create(&path).await {
        Ok(file) => file,
        Err(source) => {
            warn!(path = %path.display(), error = %source, "cannot create download target");
            frame::discard_payload(reader, header.len).await?;
            return Err(RelayError::Storage { path, source });
        }
    };

    match frame::copy_payload(reader, &mut file, header.len).await? {
        Ok(()) => {
            debug!(path = %path.display(), bytes = header.len, "payload stored");
            Ok(path)
        }
        Err(source) => Err(RelayError::Storage { path, source }),
    }
}
