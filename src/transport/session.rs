//! One live connection to the peer
//!
//! A session owns the read half with its own inbound [`Assembler`], and a
//! [`SessionSender`] whose task owns the write half and the outbound
//! [`Framer`]. It is created per connection and never reopened:
//! reconnecting always builds a new session, so no reassembly state leaks
//! from one connection into the next.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{Assembler, Framer, FramingError, Payload, Result, TransportConfig, TransportError};
use crate::crypto::Cipher;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Stream connected, handshake not sent yet
    Connecting,

    /// Handshake sent, messages may flow
    Open,

    /// Stream ended or failed; terminal
    Closed,
}

/// Inbound half: stream reads feeding the assembler
pub struct SessionReader<R> {
    stream: R,
    assembler: Assembler,
    cipher: Arc<Cipher>,
    buf: Vec<u8>,
    bytes_received: u64,
}

impl<R: AsyncRead + Unpin> SessionReader<R> {
    /// Wrap a read half
    pub fn new(stream: R, assembler: Assembler, cipher: Arc<Cipher>, read_buffer_size: usize) -> Self {
        Self {
            stream,
            assembler,
            cipher,
            buf: vec![0u8; read_buffer_size.max(1)],
            bytes_received: 0,
        }
    }

    /// Read until at least one message is complete.
    ///
    /// Returns `Ok(None)` on end of stream. Cancel safe: a cancelled call
    /// loses no bytes, because assembly only happens after a read completes.
    pub async fn recv(&mut self) -> Result<Option<Vec<Bytes>>> {
        loop {
            let n = self.stream.read(&mut self.buf).await?;
            if n == 0 {
                if self.assembler.has_partial() {
                    debug!(
                        "Stream ended with {} bytes of an incomplete message",
                        self.assembler.pending_len()
                    );
                    self.assembler.reset();
                }
                return Ok(None);
            }
            self.bytes_received += n as u64;

            let mut messages = Vec::new();
            self.assembler.add_data(&self.buf[..n], |message| messages.push(message))?;
            if !messages.is_empty() {
                return Ok(Some(messages));
            }
        }
    }

    /// Read, decrypt and parse the next batch of messages.
    ///
    /// Messages with an unknown tag are logged and skipped. Decryption and
    /// encoding failures are errors, since they mean the stream cannot be
    /// trusted.
    pub async fn recv_payloads(&mut self) -> Result<Option<Vec<Payload>>> {
        let Some(messages) = self.recv().await? else {
            return Ok(None);
        };

        let mut payloads = Vec::with_capacity(messages.len());
        for message in &messages {
            if let Some(payload) = open_message(&self.cipher, message)? {
                payloads.push(payload);
            }
        }
        Ok(Some(payloads))
    }

    /// Total bytes read from the stream
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

/// Outbound half: framing onto the stream
pub struct SessionWriter<W> {
    stream: W,
    framer: Framer,
    cipher: Arc<Cipher>,
    messages_sent: u64,
    bytes_sent: u64,
}

impl<W: AsyncWrite + Unpin> SessionWriter<W> {
    /// Wrap a write half
    pub fn new(stream: W, framer: Framer, cipher: Arc<Cipher>) -> Self {
        Self {
            stream,
            framer,
            cipher,
            messages_sent: 0,
            bytes_sent: 0,
        }
    }

    /// Send an already encrypted message
    pub async fn send(&mut self, message: &[u8]) -> Result<()> {
        self.framer.frame_and_send(message, &mut self.stream).await?;
        self.messages_sent += 1;
        self.bytes_sent += self.framer.encoded_len(message.len()) as u64;
        Ok(())
    }

    /// Encrypt and send a payload. Returns the encrypted size.
    pub async fn send_payload(&mut self, payload: &Payload) -> Result<usize> {
        let plaintext = Zeroizing::new(payload.encode());
        let envelope = self.cipher.encrypt(plaintext.as_bytes())?;
        self.send(&envelope).await?;
        debug!("Sent {} as {} encrypted bytes", payload, envelope.len());
        Ok(envelope.len())
    }

    /// Shut down the write direction of the stream
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Messages written so far
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    /// Bytes written so far, including fragment headers
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

/// Outbound half running on its own task.
///
/// Messages are queued without waiting on the stream, so the inbound side
/// keeps draining the connection while a large message is written. Every
/// queued message produces one delivery report, in queue order. The task
/// stops after the first write error and is aborted when the sender is
/// dropped.
pub struct SessionSender {
    id: u64,
    cipher: Arc<Cipher>,
    queue: mpsc::UnboundedSender<Vec<u8>>,
    deliveries: mpsc::UnboundedReceiver<Result<usize>>,
    close_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
    stats: Arc<WriteStats>,
}

#[derive(Debug, Default)]
struct WriteStats {
    messages: AtomicU64,
    bytes: AtomicU64,
}

impl WriteStats {
    fn record<W: AsyncWrite + Unpin>(&self, writer: &SessionWriter<W>) {
        self.messages.store(writer.messages_sent(), Ordering::Relaxed);
        self.bytes.store(writer.bytes_sent(), Ordering::Relaxed);
    }
}

impl SessionSender {
    /// Move a writer onto a background task
    pub fn spawn<W>(id: u64, writer: SessionWriter<W>) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (queue, queued) = mpsc::unbounded_channel();
        let (delivery_tx, deliveries) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();

        let stats = Arc::new(WriteStats::default());
        stats.record(&writer);
        let cipher = Arc::clone(&writer.cipher);

        let task = tokio::spawn(write_queued(
            id,
            writer,
            queued,
            delivery_tx,
            close_rx,
            Arc::clone(&stats),
        ));

        Self {
            id,
            cipher,
            queue,
            deliveries,
            close_tx: Some(close_tx),
            task: Some(task),
            stats,
        }
    }

    /// Queue an already encrypted message
    pub fn send(&self, message: Vec<u8>) -> Result<()> {
        if message.is_empty() {
            return Err(FramingError::EmptyPayload.into());
        }
        self.queue
            .send(message)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Encrypt and queue a payload. Returns the encrypted size.
    pub fn send_payload(&self, payload: &Payload) -> Result<usize> {
        let plaintext = Zeroizing::new(payload.encode());
        let envelope = self.cipher.encrypt(plaintext.as_bytes())?;
        let len = envelope.len();
        self.send(envelope)?;
        debug!("Session {} queued {} as {} encrypted bytes", self.id, payload, len);
        Ok(len)
    }

    /// Wait for the next delivery report.
    ///
    /// `Ok(n)` means a queued message of `n` bytes reached the stream. An
    /// error is the write failure that stopped the task. `None` once the
    /// task is gone. Cancel safe.
    pub async fn next_delivery(&mut self) -> Option<Result<usize>> {
        self.deliveries.recv().await
    }

    /// Stop the writer task and shut down the write direction.
    ///
    /// Messages still queued are dropped.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        match self.task.take() {
            Some(task) => task.await.map_err(|_| TransportError::ConnectionClosed)?,
            None => Ok(()),
        }
    }

    /// Messages written so far, handshake included
    pub fn messages_sent(&self) -> u64 {
        self.stats.messages.load(Ordering::Relaxed)
    }

    /// Bytes written so far, including fragment headers
    pub fn bytes_sent(&self) -> u64 {
        self.stats.bytes.load(Ordering::Relaxed)
    }
}

impl Drop for SessionSender {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn write_queued<W>(
    id: u64,
    mut writer: SessionWriter<W>,
    mut queued: mpsc::UnboundedReceiver<Vec<u8>>,
    deliveries: mpsc::UnboundedSender<Result<usize>>,
    mut close_rx: oneshot::Receiver<()>,
    stats: Arc<WriteStats>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug!("Writer task started for session {}", id);

    loop {
        let message = tokio::select! {
            _ = &mut close_rx => break,
            message = queued.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        // A close request abandons a message that is only partly written
        let result = tokio::select! {
            _ = &mut close_rx => break,
            result = writer.send(&message) => result,
        };
        stats.record(&writer);

        match result {
            Ok(()) => {
                let _ = deliveries.send(Ok(message.len()));
            }
            Err(e) => {
                debug!("Writer task for session {} stopped: {}", id, e);
                let _ = deliveries.send(Err(e));
                return Ok(());
            }
        }
    }

    debug!("Writer task for session {} closing the stream", id);
    writer.shutdown().await
}

/// A connection with its own framing and reassembly state
pub struct Session<S> {
    id: u64,
    state: SessionState,
    reader: SessionReader<ReadHalf<S>>,
    sender: SessionSender,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Take over a connected stream and send the handshake.
    ///
    /// The handshake is written before anything can be queued, so it is
    /// always the first message of a session.
    pub async fn open(id: u64, stream: S, config: &TransportConfig, cipher: Arc<Cipher>) -> Result<Self> {
        let framer = config.framer()?;
        let (read_half, write_half) = tokio::io::split(stream);

        let mut writer = SessionWriter::new(write_half, framer, Arc::clone(&cipher));
        writer.send_payload(&Payload::hello()).await?;

        let session = Self {
            id,
            state: SessionState::Open,
            reader: SessionReader::new(read_half, config.assembler(), cipher, config.read_buffer_size),
            sender: SessionSender::spawn(id, writer),
        };

        info!("Session {} open, handshake sent", id);
        Ok(session)
    }

    /// Session identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether messages may still flow
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Borrow both halves at once, for driving reads and writes concurrently
    pub fn halves(&mut self) -> Result<(&mut SessionReader<ReadHalf<S>>, &mut SessionSender)> {
        self.ensure_open()?;
        Ok((&mut self.reader, &mut self.sender))
    }

    /// Queue an encrypted message
    pub fn send(&mut self, message: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let result = self.sender.send(message.to_vec());
        self.close_on_error(result)
    }

    /// Encrypt and queue a payload
    pub fn send_payload(&mut self, payload: &Payload) -> Result<usize> {
        self.ensure_open()?;
        let result = self.sender.send_payload(payload);
        self.close_on_error(result)
    }

    /// Receive the next batch of complete messages; `None` once the peer ends the stream
    pub async fn recv(&mut self) -> Result<Option<Vec<Bytes>>> {
        self.ensure_open()?;
        let result = self.reader.recv().await;
        if matches!(result, Ok(None)) {
            self.mark_closed();
        }
        self.close_on_error(result)
    }

    /// Receive, decrypt and parse the next batch of messages
    pub async fn recv_payloads(&mut self) -> Result<Option<Vec<Payload>>> {
        self.ensure_open()?;
        let result = self.reader.recv_payloads().await;
        if matches!(result, Ok(None)) {
            self.mark_closed();
        }
        self.close_on_error(result)
    }

    /// Wait for the next delivery report of a queued message
    pub async fn next_delivery(&mut self) -> Option<Result<usize>> {
        self.sender.next_delivery().await
    }

    /// Record that the stream is gone. Nothing queued afterwards is sent.
    pub fn mark_closed(&mut self) {
        if self.state != SessionState::Closed {
            debug!(
                "Session {} closed after {} messages ({} bytes) sent, {} bytes received",
                self.id,
                self.sender.messages_sent(),
                self.sender.bytes_sent(),
                self.reader.bytes_received()
            );
        }
        self.state = SessionState::Closed;
    }

    /// Close the session: stop the writer task and shut down the write direction
    pub async fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.mark_closed();
        self.sender.close().await
    }

    /// Messages sent on this session, handshake included
    pub fn messages_sent(&self) -> u64 {
        self.sender.messages_sent()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed)
        }
    }

    fn close_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.mark_closed();
        }
        result
    }
}

fn open_message(cipher: &Cipher, message: &[u8]) -> Result<Option<Payload>> {
    let plaintext = cipher.decrypt(message)?;
    let text = std::str::from_utf8(&plaintext).map_err(|_| TransportError::InvalidEncoding)?;

    match Payload::decode(text) {
        Some(payload) => Ok(Some(payload)),
        None => {
            warn!("Ignoring message of unknown kind ({} bytes)", text.len());
            Ok(None)
        }
    }
}
