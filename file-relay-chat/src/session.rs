//! Server-side state for one connected client.
//!
//! A session owns the write halves of the client's text and file connections
//! behind one lock, so every delivery to it (a chat line, or an announce plus
//! its payload) goes out whole. The read halves belong to [`Session::run`],
//! which walks the session through `Connecting -> Named -> Active -> Closed`.

use std::{
    fmt,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU8, Ordering},
    },
};

use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt},
    select,
    sync::{Mutex, watch},
};
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    frame,
    registry::Registry,
    relay::{self, ChatMessage, FileTransfer},
};

pub type SessionId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Named = 1,
    Active = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Named,
            2 => SessionState::Active,
            _ => SessionState::Closed,
        }
    }
}

struct Outbound {
    text: BoxedWriter,
    file: BoxedWriter,
}

pub struct Session {
    id: SessionId,
    name: OnceLock<String>,
    state: AtomicU8,
    outbound: Mutex<Option<Outbound>>,
    closed: watch::Sender<bool>,
}

impl Session {
    pub fn new<T, F>(id: SessionId, text: T, file: F) -> Arc<Self>
    where
        T: AsyncWrite + Send + Unpin + 'static,
        F: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id,
            name: OnceLock::new(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            outbound: Mutex::new(Some(Outbound {
                text: Box::new(text),
                file: Box::new(file),
            })),
            closed,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    fn display_name(&self) -> &str {
        self.name().unwrap_or("<unnamed>")
    }

    pub(crate) fn mark_named(&self, name: String) -> bool {
        if self.name.set(name).is_err() {
            return false;
        }
        self.advance(SessionState::Connecting, SessionState::Named)
    }

    pub(crate) fn activate(&self) -> bool {
        self.advance(SessionState::Named, SessionState::Active)
    }

    // Closed is terminal: a transition only succeeds from the expected state.
    fn advance(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub async fn send_message(&self, line: &str) -> bool {
        let mut outbound = self.outbound.lock().await;
        if !self.is_active() {
            return false;
        }
        let Some(channels) = outbound.as_mut() else {
            return false;
        };

        let mut pending = PendingDelivery::new(self);
        let mut closed = self.closed.subscribe();
        let outcome = select! {
            outcome = frame::write_line(&mut channels.text, line) => Some(outcome),
            _ = closed.wait_for(|is_closed| *is_closed) => None,
        };
        pending.finish();

        match outcome {
            Some(Ok(())) => true,
            Some(Err(err)) => {
                debug!(session = self.id, name = self.display_name(), error = %err, "failed to deliver message");
                self.close_locked(&mut outbound).await;
                false
            }
            None => {
                self.close_locked(&mut outbound).await;
                false
            }
        }
    }

    // The outbound lock is held across the announce and the payload so
    // concurrent transfers to this session never interleave.
    pub async fn send_file(&self, transfer: &FileTransfer) -> bool {
        let mut outbound = self.outbound.lock().await;
        if !self.is_active() {
            return false;
        }
        let Some(channels) = outbound.as_mut() else {
            return false;
        };

        let mut pending = PendingDelivery::new(self);
        let mut closed = self.closed.subscribe();
        let outcome = select! {
            outcome = deliver_file(channels, transfer) => Some(outcome),
            _ = closed.wait_for(|is_closed| *is_closed) => None,
        };
        pending.finish();

        match outcome {
            Some(Ok(())) => {
                debug!(session = self.id, name = self.display_name(), file = %transfer.name, "file delivered");
                true
            }
            Some(Err(err)) => {
                warn!(session = self.id, name = self.display_name(), file = %transfer.name, error = %err, "failed to deliver file");
                self.close_locked(&mut outbound).await;
                false
            }
            None => {
                debug!(session = self.id, file = %transfer.name, "delivery abandoned, session closed");
                self.close_locked(&mut outbound).await;
                false
            }
        }
    }

    /// Moves the session to `Closed`, wakes its receive loop and shuts down
    /// both outbound connections. Safe to call any number of times.
    pub async fn close(&self) {
        // Signal first: a delivery stuck on an unresponsive client holds the
        // outbound lock until it sees the signal.
        self.mark_closed();
        let mut outbound = self.outbound.lock().await;
        self.close_locked(&mut outbound).await;
    }

    fn mark_closed(&self) {
        let previous =
            SessionState::from_u8(self.state.swap(SessionState::Closed as u8, Ordering::AcqRel));
        self.closed.send_replace(true);
        if previous != SessionState::Closed {
            debug!(session = self.id, ?previous, "session closed");
        }
    }

    async fn close_locked(&self, outbound: &mut Option<Outbound>) {
        self.mark_closed();
        let Some(mut channels) = outbound.take() else {
            return;
        };

        // Each connection is shut down on its own; one failing must not skip the other.
        if let Err(err) = channels.text.shutdown().await {
            debug!(session = self.id, error = %err, "failed to shut down text channel");
        }
        if let Err(err) = channels.file.shutdown().await {
            debug!(session = self.id, error = %err, "failed to shut down file channel");
        }
    }

    /// Runs the receive loop until the client disconnects, a read fails, or
    /// [`Session::close`] is called from elsewhere. Afterwards the session is
    /// closed and removed from `registry`.
    ///
    /// Closure only interrupts reads. A fan-out this session already started
    /// runs to completion, so no recipient is left with half a delivery.
    /// The session must already be registered so broadcasts that start while
    /// it is naming itself do not miss it once it turns active.
    pub async fn run<T, F>(
        self: Arc<Self>,
        mut text: T,
        mut file: F,
        registry: Arc<Registry>,
        max_upload_bytes: u64,
    ) where
        T: AsyncBufRead + Unpin + Send,
        F: AsyncRead + Unpin + Send,
    {
        let mut closed = self.closed.subscribe();
        let outcome = self
            .receive_loop(&mut text, &mut file, &registry, &mut closed, max_upload_bytes)
            .await;

        if let Err(err) = outcome {
            warn!(session = self.id, name = self.display_name(), error = %err, "session ended with error");
        }

        self.close().await;
        if registry.deregister(self.id).await.is_some() {
            info!(session = self.id, name = self.display_name(), "client left");
        }
    }

    async fn receive_loop<T, F>(
        &self,
        text: &mut T,
        file: &mut F,
        registry: &Registry,
        closed: &mut watch::Receiver<bool>,
        max_upload_bytes: u64,
    ) -> Result<()>
    where
        T: AsyncBufRead + Unpin,
        F: AsyncRead + Unpin,
    {
        let Some(first) = unless_closed(closed, frame::read_line(text)).await else {
            return Ok(());
        };
        let Some(name) = first? else {
            debug!(session = self.id, "connection closed before a name arrived");
            return Ok(());
        };

        if !self.mark_named(name.clone()) || !self.activate() {
            return Ok(());
        }
        info!(session = self.id, %name, "client joined");

        loop {
            let Some(next) = unless_closed(closed, frame::read_line(text)).await else {
                return Ok(());
            };
            let Some(line) = next? else {
                return Ok(());
            };

            if relay::is_upload_directive(&line) {
                debug!(session = self.id, %name, "waiting for upload frame");
                let Some(upload) =
                    unless_closed(closed, relay::receive_upload(file, max_upload_bytes)).await
                else {
                    return Ok(());
                };
                self.relay_upload(upload, registry, &name).await?;
            } else {
                let message = ChatMessage::new(name.as_str(), line);
                let delivered = registry.broadcast_text(&message, self.id).await;
                debug!(session = self.id, %name, delivered, "chat relayed");
            }
        }
    }

    async fn relay_upload(
        &self,
        upload: Result<FileTransfer>,
        registry: &Registry,
        name: &str,
    ) -> Result<()> {
        match upload {
            Ok(transfer) => {
                info!(session = self.id, %name, file = %transfer.name, bytes = transfer.len(), "upload received");
                let delivered = registry.broadcast_file(&transfer, self.id).await;
                info!(session = self.id, file = %transfer.name, recipients = delivered, "file broadcast");
                Ok(())
            }
            Err(err) if !err.is_fatal() => {
                warn!(session = self.id, %name, error = %err, "upload dropped");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

// A delivery future dropped before it finished has left a partial write on
// the wire; the recipient can no longer trust its channels.
struct PendingDelivery<'a> {
    session: &'a Session,
    finished: bool,
}

impl<'a> PendingDelivery<'a> {
    fn new(session: &'a Session) -> Self {
        Self {
            session,
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for PendingDelivery<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(session = self.session.id, "delivery dropped part way, closing session");
            self.session.mark_closed();
        }
    }
}

async fn unless_closed<T>(
    closed: &mut watch::Receiver<bool>,
    read: impl Future<Output = T>,
) -> Option<T> {
    select! {
        value = read => Some(value),
        _ = closed.wait_for(|is_closed| *is_closed) => None,
    }
}

async fn deliver_file(channels: &mut Outbound, transfer: &FileTransfer) -> Result<()> {
    frame::write_line(&mut channels.text, &transfer.announce()).await?;
    relay::send_payload(&mut channels.file, transfer).await
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex, split},
        time::timeout,
    };

    use super::*;
    use crate::frame::{read_file_header, read_line, read_payload, write_file_frame, write_line};

    const WAIT: Duration = Duration::from_secs(1);

    struct Client {
        session: Arc<Session>,
        text_in: BufReader<tokio::io::ReadHalf<DuplexStream>>,
        text_out: tokio::io::WriteHalf<DuplexStream>,
        file_in: tokio::io::ReadHalf<DuplexStream>,
        file_out: tokio::io::WriteHalf<DuplexStream>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn connect(registry: &Arc<Registry>) -> Client {
        let (client_text, server_text) = duplex(64 * 1024);
        let (client_file, server_file) = duplex(64 * 1024);
        let (server_text_in, server_text_out) = split(server_text);
        let (server_file_in, server_file_out) = split(server_file);

        let session = Session::new(registry.next_id(), server_text_out, server_file_out);
        registry.register(Arc::clone(&session)).await;
        let task = tokio::spawn(Arc::clone(&session).run(
            BufReader::new(server_text_in),
            server_file_in,
            Arc::clone(registry),
            1024 * 1024,
        ));

        let (text_in, text_out) = split(client_text);
        let (file_in, file_out) = split(client_file);
        Client {
            session,
            text_in: BufReader::new(text_in),
            text_out,
            file_in,
            file_out,
            task,
        }
    }

    async fn join(registry: &Arc<Registry>, name: &str) -> Client {
        let mut client = connect(registry).await;
        write_line(&mut client.text_out, name).await.unwrap();
        wait_until(|| client.session.is_active()).await;
        client
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn first_line_names_the_session() {
        let registry = Arc::new(Registry::new());
        let mut client = connect(&registry).await;
        assert_eq!(client.session.state(), SessionState::Connecting);

        write_line(&mut client.text_out, "alice").await.unwrap();
        wait_until(|| client.session.is_active()).await;

        assert_eq!(client.session.name(), Some("alice"));
    }

    #[tokio::test]
    async fn unnamed_sessions_are_skipped_by_deliveries() {
        let registry = Arc::new(Registry::new());
        let client = connect(&registry).await;

        assert!(!client.session.send_message("alice: hi").await);
        assert!(!client.session.send_file(&FileTransfer::new("a", vec![1])).await);
    }

    #[tokio::test]
    async fn end_of_stream_closes_and_deregisters() {
        let registry = Arc::new(Registry::new());
        let client = join(&registry, "alice").await;
        assert_eq!(registry.len().await, 1);

        let Client {
            session,
            mut text_out,
            task,
            ..
        } = client;
        text_out.shutdown().await.unwrap();

        timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn close_from_elsewhere_stops_the_loop() {
        let registry = Arc::new(Registry::new());
        let mut client = join(&registry, "alice").await;

        client.session.close().await;
        timeout(WAIT, &mut client.task).await.unwrap().unwrap();

        assert!(registry.is_empty().await);
        // Both outbound connections were shut down.
        let mut rest = Vec::new();
        client.text_in.read_to_end(&mut rest).await.unwrap();
        client.file_in.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn failed_write_closes_the_recipient() {
        let registry = Arc::new(Registry::new());
        let client = join(&registry, "bob").await;
        let Client {
            session,
            file_in,
            file_out,
            task,
            ..
        } = client;

        // Dropping both halves of the client's file pipe breaks the server's writes.
        drop(file_in);
        drop(file_out);
        let transfer = FileTransfer::new("a.txt", b"payload".to_vec());
        assert!(!session.send_file(&transfer).await);
        assert_eq!(session.state(), SessionState::Closed);

        timeout(WAIT, task).await.unwrap().unwrap();
        assert!(registry.is_empty().await);
        assert!(!session.send_message("alice: hello?").await);
    }

    #[tokio::test]
    async fn chat_is_relayed_with_the_sender_name() {
        let registry = Arc::new(Registry::new());
        let mut alice = join(&registry, "alice").await;
        let mut bob = join(&registry, "bob").await;

        write_line(&mut alice.text_out, "hello bob").await.unwrap();

        let line = timeout(WAIT, read_line(&mut bob.text_in))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.as_deref(), Some("alice: hello bob"));
        assert!(
            timeout(Duration::from_millis(50), read_line(&mut alice.text_in))
                .await
                .is_err(),
            "sender must not hear its own message"
        );
    }

    #[tokio::test]
    async fn upload_is_announced_then_streamed_to_others() {
        let registry = Arc::new(Registry::new());
        let mut alice = join(&registry, "alice").await;
        let mut bob = join(&registry, "bob").await;

        write_line(&mut alice.text_out, "/upload").await.unwrap();
        write_file_frame(&mut alice.file_out, "notes.txt", b"meeting at noon")
            .await
            .unwrap();

        let announce = timeout(WAIT, read_line(&mut bob.text_in))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(announce.as_deref(), Some("FILE_TRANSFER notes.txt 15"));

        let header = read_file_header(&mut bob.file_in).await.unwrap();
        assert_eq!(header.name, "notes.txt");
        let payload = read_payload(&mut bob.file_in, header.len).await.unwrap();
        assert_eq!(payload, b"meeting at noon");
    }

    #[tokio::test]
    async fn rejected_upload_keeps_the_session_alive() {
        let registry = Arc::new(Registry::new());
        let mut alice = join(&registry, "alice").await;
        let mut bob = join(&registry, "bob").await;

        write_line(&mut alice.text_out, "/upload").await.unwrap();
        write_file_frame(&mut alice.file_out, "huge.bin", &vec![0u8; 2 * 1024 * 1024])
            .await
            .unwrap();
        write_line(&mut alice.text_out, "still here").await.unwrap();

        let line = timeout(WAIT, read_line(&mut bob.text_in))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.as_deref(), Some("alice: still here"));
        assert!(alice.session.is_active());
    }

    #[tokio::test]
    async fn sender_closed_mid_fan_out_still_completes_the_delivery() {
        let registry = Arc::new(Registry::new());
        let mut alice = join(&registry, "alice").await;
        let mut bob = join(&registry, "bob").await;
        let big: Vec<u8> = (0..200 * 1024u32).map(|i| (i % 253) as u8).collect();

        write_line(&mut alice.text_out, "/upload").await.unwrap();
        write_file_frame(&mut alice.file_out, "big.bin", &big)
            .await
            .unwrap();

        // Bob has not read his file channel yet, so the payload is stuck part way.
        let announce = timeout(WAIT, read_line(&mut bob.text_in))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(announce.as_deref(), Some("FILE_TRANSFER big.bin 204800"));

        alice.session.close().await;
        let next = {
            let bob_session = Arc::clone(&bob.session);
            tokio::spawn(async move {
                bob_session
                    .send_file(&FileTransfer::new("x.txt", b"xyz".to_vec()))
                    .await
            })
        };

        let header = read_file_header(&mut bob.file_in).await.unwrap();
        assert_eq!(header.len, big.len() as u64);
        assert_eq!(read_payload(&mut bob.file_in, header.len).await.unwrap(), big);

        let announce = timeout(WAIT, read_line(&mut bob.text_in))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(announce.as_deref(), Some("FILE_TRANSFER x.txt 3"));
        let header = read_file_header(&mut bob.file_in).await.unwrap();
        assert_eq!(header.name, "x.txt");
        assert_eq!(read_payload(&mut bob.file_in, header.len).await.unwrap(), b"xyz");

        assert!(timeout(WAIT, next).await.unwrap().unwrap());
        assert!(bob.session.is_active());
        timeout(WAIT, &mut alice.task).await.unwrap().unwrap();
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn close_interrupts_a_stalled_delivery() {
        let registry = Arc::new(Registry::new());
        let mut bob = join(&registry, "bob").await;
        let transfer = FileTransfer::new("big.bin", vec![1u8; 200 * 1024]);

        let stalled = {
            let bob_session = Arc::clone(&bob.session);
            tokio::spawn(async move { bob_session.send_file(&transfer).await })
        };
        let announce = timeout(WAIT, read_line(&mut bob.text_in))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(announce.as_deref(), Some("FILE_TRANSFER big.bin 204800"));

        timeout(WAIT, bob.session.close()).await.unwrap();

        assert!(!timeout(WAIT, stalled).await.unwrap().unwrap());
        timeout(WAIT, &mut bob.task).await.unwrap().unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn dropped_delivery_closes_the_recipient() {
        let registry = Arc::new(Registry::new());
        let mut bob = join(&registry, "bob").await;
        let transfer = FileTransfer::new("big.bin", vec![1u8; 200 * 1024]);

        let abandoned = timeout(Duration::from_millis(50), bob.session.send_file(&transfer)).await;
        assert!(abandoned.is_err());

        assert_eq!(bob.session.state(), SessionState::Closed);
        timeout(WAIT, &mut bob.task).await.unwrap().unwrap();
        assert!(registry.is_empty().await);
        assert!(!bob.session.send_message("alice: hello?").await);
    }

    #[tokio::test]
    async fn truncated_upload_ends_the_session() {
        let registry = Arc::new(Registry::new());
        let alice = join(&registry, "alice").await;
        let Client {
            session,
            mut text_out,
            mut file_out,
            task,
            ..
        } = alice;

        write_line(&mut text_out, "/upload").await.unwrap();
        crate::frame::write_file_header(&mut file_out, "a.txt", 10)
            .await
            .unwrap();
        file_out.write_all(b"abc").await.unwrap();
        file_out.shutdown().await.unwrap();

        timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.is_empty().await);
    }
}
