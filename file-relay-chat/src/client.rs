use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    config::ClientConfig,
    error::RelayError,
    frame::{self, FileHeader},
    relay::{self, FileTransfer, UPLOAD_DIRECTIVE},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A line relayed from another participant.
    Chat(String),
    FileReceived {
        name: String,
        path: PathBuf,
        len: u64,
    },
    /// An incoming file could not be stored; the connection is still usable.
    TransferFailed { name: String, reason: String },
}

/// Inbound side of a client connection.
pub struct ClientReader {
    text: BufReader<OwnedReadHalf>,
    file: BufReader<OwnedReadHalf>,
    download_dir: PathBuf,
}

/// Outbound side of a client connection.
pub struct ClientWriter {
    text: OwnedWriteHalf,
    file: OwnedWriteHalf,
}

/// Opens the text connection, then the file connection, and sends the display name.
pub async fn connect(config: &ClientConfig) -> Result<(ClientReader, ClientWriter)> {
    let host = config.host.as_str();
    let text = TcpStream::connect((host, config.text_port))
        .await
        .with_context(|| format!("failed to connect to {host}:{}", config.text_port))?;
    let file = TcpStream::connect((host, config.file_port))
        .await
        .with_context(|| format!("failed to connect to {host}:{}", config.file_port))?;

    info!(host, text_port = config.text_port, file_port = config.file_port, "connected");

    let (text_reader, text_writer) = text.into_split();
    let (file_reader, file_writer) = file.into_split();

    let reader = ClientReader {
        text: BufReader::new(text_reader),
        file: BufReader::new(file_reader),
        download_dir: config.download_dir.clone(),
    };
    let mut writer = ClientWriter {
        text: text_writer,
        file: file_writer,
    };

    frame::write_line(&mut writer.text, &config.name)
        .await
        .context("failed to send display name")?;

    Ok((reader, writer))
}

impl ClientReader {
    /// Waits for the next relayed line. An announce is followed straight away
    /// by reading its file frame, so only one transfer is ever in flight.
    /// `None` means the server closed the connection.
    pub async fn next_event(&mut self) -> Result<Option<ClientEvent>, RelayError> {
        let Some(line) = frame::read_line(&mut self.text).await? else {
            return Ok(None);
        };

        match relay::parse_announce(&line) {
            Ok(Some(announced)) => self.receive_file(announced).await.map(Some),
            Ok(None) => Ok(Some(ClientEvent::Chat(line))),
            Err(err) => {
                warn!(error = %err, "treating malformed announce as chat");
                Ok(Some(ClientEvent::Chat(line)))
            }
        }
    }

    async fn receive_file(&mut self, announced: FileHeader) -> Result<ClientEvent, RelayError> {
        let header = frame::read_file_header(&mut self.file).await?;
        if header != announced {
            // The frame's own length decides how many bytes follow.
            warn!(?announced, framed = ?header, "announce does not match file frame");
        }

        match relay::save_payload(&mut self.file, &header, &self.download_dir).await {
            Ok(path) => {
                info!(file = %header.name, bytes = header.len, path = %path.display(), "file received");
                Ok(ClientEvent::FileReceived {
                    name: header.name,
                    path,
                    len: header.len,
                })
            }
            Err(err) if !err.is_fatal() => {
                warn!(file = %header.name, error = %err, "file transfer aborted");
                Ok(ClientEvent::TransferFailed {
                    name: header.name,
                    reason: err.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn forward_events(mut self, events: mpsc::Sender<Result<ClientEvent, RelayError>>) {
        loop {
            let event = match self.next_event().await {
                Ok(Some(event)) => Ok(event),
                Ok(None) => return,
                Err(err) => Err(err),
            };
            let fatal = event.is_err();
            if events.send(event).await.is_err() || fatal {
                return;
            }
        }
    }
}

impl ClientWriter {
    pub async fn send_chat(&mut self, text: &str) -> Result<(), RelayError> {
        frame::write_line(&mut self.text, text).await
    }

    /// Reads the whole file first, then sends the upload directive followed by
    /// the file frame, so a local read failure never leaves a half-sent upload.
    pub async fn upload(&mut self, path: &Path) -> Result<FileTransfer, RelayError> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| RelayError::InvalidFileName(path.display().to_string()))?;
        if name.len() > frame::MAX_FILE_NAME_LEN {
            return Err(RelayError::FileNameTooLong(name.len()));
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| RelayError::Storage {
                path: path.to_path_buf(),
                source,
            })?;
        let transfer = FileTransfer::new(name, bytes);

        frame::write_line(&mut self.text, UPLOAD_DIRECTIVE).await?;
        relay::send_payload(&mut self.file, &transfer).await?;
        Ok(transfer)
    }

    pub async fn shutdown(&mut self) {
        if let Err(error) = self.text.shutdown().await {
            warn!(?error, "failed to shutdown text channel cleanly");
        }
        if let Err(error) = self.file.shutdown().await {
            warn!(?error, "failed to shutdown file channel cleanly");
        }
    }
}

/// Interactive terminal client: stdin lines become chat or commands, relayed
/// lines and received files are printed as they arrive.
pub async fn run(config: ClientConfig) -> Result<()> {
    let (reader, mut writer) = connect(&config).await?;
    write_stdout(&format!("*** connected to {} as {}", config.host, config.name)).await?;

    let (events_tx, mut events) = mpsc::channel(32);
    let reader_task = tokio::spawn(reader.forward_events(events_tx));

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut events, &mut writer, &mut stdin, &mut input).await?;
    writer.shutdown().await;
    reader_task.abort();

    Ok(())
}

async fn run_client_loop(
    events: &mut mpsc::Receiver<Result<ClientEvent, RelayError>>,
    writer: &mut ClientWriter,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        select! {
            event = events.recv() => {
                if !handle_server_event(event).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                let keep_going = handle_stdin_input(bytes_read, input, writer).await?;
                input.clear();
                if !keep_going {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_event(event: Option<Result<ClientEvent, RelayError>>) -> Result<bool> {
    match event {
        Some(Ok(event)) => {
            render_event(event).await?;
            Ok(true)
        }
        Some(Err(err)) => {
            write_stderr(&format!("!!! connection error: {err}")).await?;
            Ok(false)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut ClientWriter,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if relay::is_upload_directive(text) {
        return handle_upload_command(text, writer).await;
    }

    writer.send_chat(text).await?;
    Ok(true)
}

async fn handle_upload_command(text: &str, writer: &mut ClientWriter) -> Result<bool> {
    let path = text
        .strip_prefix(UPLOAD_DIRECTIVE)
        .map(str::trim)
        .unwrap_or_default();
    if path.is_empty() {
        write_stdout("Usage: /upload <file_path>").await?;
        return Ok(true);
    }

    let path = Path::new(path);
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        write_stdout(&format!("File not found: {}", path.display())).await?;
        return Ok(true);
    }

    match writer.upload(path).await {
        Ok(transfer) => {
            write_stdout(&format!(
                "*** file sent: {} ({} bytes)",
                transfer.name,
                transfer.len()
            ))
            .await?;
            Ok(true)
        }
        Err(err) if !err.is_fatal() => {
            write_stderr(&format!("!!! upload failed: {err}")).await?;
            Ok(true)
        }
        Err(err) => Err(err).context("upload interrupted"),
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn render_event(event: ClientEvent) -> io::Result<()> {
    match event {
        ClientEvent::Chat(line) => write_stdout(&line).await,
        ClientEvent::FileReceived { name, len, .. } => {
            write_stdout(&format!("*** file received: {name} ({len} bytes)")).await
        }
        ClientEvent::TransferFailed { name, reason } => {
            write_stderr(&format!("!!! could not save {name}: {reason}")).await
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
