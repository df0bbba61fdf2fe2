//! Persistent duplex WebSocket transport.
//!
//! One [`Transport`] exists per listening session.  Outbound
//! [`AudioFrame`]s go out as binary messages in production order, one
//! message per frame, with no batching and no buffering: a frame arriving
//! while the connection is not open is silently dropped.  Inbound messages
//! surface as [`WireMessage`]s, discriminated purely by the WebSocket
//! envelope (binary vs text), never by content sniffing.
//!
//! The writer and reader halves run as two tokio tasks wired to the split
//! socket.  [`Connector`] is the seam the session uses to establish a
//! connection, so tests can substitute an in-memory link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::audio::{AudioFrame, FrameSender};
use crate::session::ByteCounters;

// ---------------------------------------------------------------------------
// WireMessage
// ---------------------------------------------------------------------------

/// An inbound message, tagged by its transport envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Binary payload: synthesized-speech audio.
    Binary(Vec<u8>),
    /// Text payload: a JSON control message.
    Text(String),
}

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

/// Errors surfaced by the transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("failed to connect: {0}")]
    Connect(String),
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Outcome of a successful connection: the transport handle plus the
/// inbound message stream (consumed by the dispatcher).
pub struct TransportLink {
    pub transport: Transport,
    pub inbound: mpsc::UnboundedReceiver<WireMessage>,
}

/// Handle to an established duplex connection.
pub struct Transport {
    frames: FrameSender,
    open: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Transport {
    /// Open a WebSocket connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] when the connection cannot be
    /// established.  No internal timeout is imposed; the attempt fails only
    /// via the platform's own failure signal.
    pub async fn connect(
        url: &str,
        counters: Arc<ByteCounters>,
    ) -> Result<TransportLink, TransportError> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        log::info!("connected to {url}");
        let (sink, stream) = socket.split();
        Ok(Self::from_parts(sink, stream, counters))
    }

    /// Assemble a transport from an already-split sink/stream pair.
    pub(crate) fn from_parts<Si, St>(
        sink: Si,
        stream: St,
        counters: Arc<ByteCounters>,
    ) -> TransportLink
    where
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: std::fmt::Display,
        St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
    {
        let open = Arc::new(AtomicBool::new(true));
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let writer = spawn_writer(sink, frame_rx, shutdown_rx, counters, Arc::clone(&open));
        let reader = spawn_reader(stream, in_tx, Arc::clone(&open));

        TransportLink {
            transport: Transport {
                frames: frame_tx,
                open,
                shutdown: Some(shutdown_tx),
                writer,
                reader,
            },
            inbound: in_rx,
        }
    }

    /// Endpoint the capture callback sends frames into.
    pub fn sender(&self) -> FrameSender {
        self.frames.clone()
    }

    /// Returns `true` while the connection can carry outbound frames.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Close the connection and join both halves.
    ///
    /// The writer sends a close frame and exits promptly even if frame
    /// senders are still alive elsewhere; the reader is aborted.
    pub async fn close(mut self) {
        self.open.store(false, Ordering::Release);
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.writer.await;
        self.reader.abort();
        let _ = self.reader.await;
        log::debug!("transport closed");
    }
}

// ---------------------------------------------------------------------------
// Writer / reader tasks
// ---------------------------------------------------------------------------

/// Forward frames to the socket, one binary message per frame, counting
/// payload bytes for every frame actually handed to an open connection.
/// Frames arriving while the connection is not open are dropped.
fn spawn_writer<Si>(
    mut sink: Si,
    mut frames: mpsc::UnboundedReceiver<AudioFrame>,
    mut shutdown: oneshot::Receiver<()>,
    counters: Arc<ByteCounters>,
    open: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: std::fmt::Display,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = frames.recv() => match maybe {
                    Some(frame) => {
                        if !open.load(Ordering::Acquire) {
                            continue;
                        }
                        let bytes = frame.into_le_bytes();
                        let n = bytes.len() as u64;
                        match sink.send(Message::Binary(bytes)).await {
                            Ok(()) => counters.add_sent(n),
                            Err(e) => {
                                log::warn!("outbound send failed: {e}");
                                open.store(false, Ordering::Release);
                            }
                        }
                    }
                    None => break,
                },
                _ = &mut shutdown => break,
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    })
}

/// Surface inbound messages as [`WireMessage`]s until the stream ends.
/// Ping/pong keepalive frames are invisible to the dispatcher.
fn spawn_reader<St>(
    mut stream: St,
    inbound: mpsc::UnboundedSender<WireMessage>,
    open: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(Message::Binary(payload)) => {
                    let _ = inbound.send(WireMessage::Binary(payload));
                }
                Ok(Message::Text(text)) => {
                    let _ = inbound.send(WireMessage::Text(text));
                }
                Ok(Message::Close(_)) => {
                    log::info!("remote closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("inbound stream error: {e}");
                    break;
                }
            }
        }
        open.store(false, Ordering::Release);
        // Dropping `inbound` ends the dispatcher, which reports the closure.
    })
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Connection seam used by the session.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish the duplex connection for one listening session.
    async fn connect(
        &self,
        url: &str,
        counters: Arc<ByteCounters>,
    ) -> Result<TransportLink, TransportError>;
}

/// Production connector backed by `tokio-tungstenite`.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
        counters: Arc<ByteCounters>,
    ) -> Result<TransportLink, TransportError> {
        Transport::connect(url, counters).await
    }
}

// ---------------------------------------------------------------------------
// Test doubles (in-memory sink + scripted connector)
// ---------------------------------------------------------------------------

/// In-memory [`Sink`] recording every message, with a switchable failure
/// mode to simulate a dead connection.
#[cfg(test)]
pub(crate) struct VecSink {
    pub(crate) messages: Arc<std::sync::Mutex<Vec<Message>>>,
    pub(crate) fail: Arc<AtomicBool>,
}

#[cfg(test)]
impl VecSink {
    pub(crate) fn new() -> (Self, Arc<std::sync::Mutex<Vec<Message>>>, Arc<AtomicBool>) {
        let messages = Arc::new(std::sync::Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(false));
        (
            Self {
                messages: Arc::clone(&messages),
                fail: Arc::clone(&fail),
            },
            messages,
            fail,
        )
    }
}

#[cfg(test)]
impl Sink<Message> for VecSink {
    type Error = tungstenite::Error;

    fn poll_ready(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn start_send(self: std::pin::Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        if self.fail.load(Ordering::Acquire) {
            return Err(tungstenite::Error::ConnectionClosed);
        }
        self.messages.lock().unwrap().push(item);
        Ok(())
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }
}

/// [`Connector`] double: refuses, or hands out an in-memory link whose
/// inbound side replays a script (or stays silent when `script` is `None`).
#[cfg(test)]
pub(crate) struct MockConnector {
    pub(crate) sent: Arc<std::sync::Mutex<Vec<Message>>>,
    pub(crate) fail_sends: Arc<AtomicBool>,
    script: std::sync::Mutex<Option<Vec<Result<Message, tungstenite::Error>>>>,
    refuse: bool,
    pub(crate) connects: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockConnector {
    /// A connector whose sessions never receive inbound traffic.
    pub(crate) fn silent() -> Self {
        Self {
            sent: Arc::new(std::sync::Mutex::new(Vec::new())),
            fail_sends: Arc::new(AtomicBool::new(false)),
            script: std::sync::Mutex::new(None),
            refuse: false,
            connects: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// A connector whose next session replays `script` on the inbound side,
    /// then sees the remote close.
    pub(crate) fn scripted(script: Vec<Message>) -> Self {
        let conn = Self::silent();
        *conn.script.lock().unwrap() = Some(script.into_iter().map(Ok).collect());
        conn
    }

    /// A connector that always refuses.
    pub(crate) fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::silent()
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _url: &str,
        counters: Arc<ByteCounters>,
    ) -> Result<TransportLink, TransportError> {
        if self.refuse {
            return Err(TransportError::Connect("connection refused".into()));
        }
        self.connects
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);

        let sink = VecSink {
            messages: Arc::clone(&self.sent),
            fail: Arc::clone(&self.fail_sends),
        };

        match self.script.lock().unwrap().take() {
            Some(script) => Ok(Transport::from_parts(
                sink,
                futures_util::stream::iter(script),
                counters,
            )),
            None => Ok(Transport::from_parts(
                sink,
                futures_util::stream::pending(),
                counters,
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(samples: usize) -> AudioFrame {
        AudioFrame::from_samples(&vec![1_i16; samples])
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn binary_count(messages: &std::sync::Mutex<Vec<Message>>) -> usize {
        messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| matches!(m, Message::Binary(_)))
            .count()
    }

    // ---- writer ------------------------------------------------------------

    #[tokio::test]
    async fn frames_go_out_in_order_as_binary() {
        let (sink, messages, _fail) = VecSink::new();
        let counters = Arc::new(ByteCounters::new());
        let link = Transport::from_parts(sink, futures_util::stream::pending(), counters);

        let tx = link.transport.sender();
        tx.send(AudioFrame::from_samples(&[1])).unwrap();
        tx.send(AudioFrame::from_samples(&[2])).unwrap();
        tx.send(AudioFrame::from_samples(&[3])).unwrap();

        wait_for(|| binary_count(&messages) == 3).await;

        let got: Vec<Vec<u8>> = messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                Message::Binary(b) => Some(b.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(got, vec![vec![1, 0], vec![2, 0], vec![3, 0]]);

        link.transport.close().await;
    }

    #[tokio::test]
    async fn sent_bytes_counted_only_while_open() {
        let (sink, messages, fail) = VecSink::new();
        let counters = Arc::new(ByteCounters::new());
        let link = Transport::from_parts(
            sink,
            futures_util::stream::pending(),
            Arc::clone(&counters),
        );

        let tx = link.transport.sender();
        tx.send(frame(160)).unwrap();
        tx.send(frame(100)).unwrap();
        wait_for(|| counters.sent() == 520).await;

        // Kill the connection: the next send fails and is not counted.
        fail.store(true, Ordering::Release);
        tx.send(frame(160)).unwrap();
        wait_for(|| !link.transport.is_open()).await;

        // Frames after the failure are dropped without reaching the sink.
        tx.send(frame(160)).unwrap();
        tx.send(frame(160)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(counters.sent(), 520);
        assert_eq!(binary_count(&messages), 2);

        link.transport.close().await;
    }

    #[tokio::test]
    async fn close_emits_close_frame_and_joins() {
        let (sink, messages, _fail) = VecSink::new();
        let counters = Arc::new(ByteCounters::new());
        let link = Transport::from_parts(sink, futures_util::stream::pending(), counters);

        // Keep an extra sender alive; close must still return.
        let _extra = link.transport.sender();
        link.transport.close().await;

        let messages = messages.lock().unwrap();
        assert!(messages
            .iter()
            .any(|m| matches!(m, Message::Close(_))));
    }

    // ---- reader ------------------------------------------------------------

    #[tokio::test]
    async fn inbound_classified_by_envelope_only() {
        let script = vec![
            Ok(Message::Binary(vec![9, 9])),
            Ok(Message::Ping(Vec::new())),
            Ok(Message::Text("{\"final\":true}".into())),
            Ok(Message::Pong(Vec::new())),
        ];
        let (sink, _messages, _fail) = VecSink::new();
        let counters = Arc::new(ByteCounters::new());
        let mut link = Transport::from_parts(sink, futures_util::stream::iter(script), counters);

        assert_eq!(
            link.inbound.recv().await,
            Some(WireMessage::Binary(vec![9, 9]))
        );
        assert_eq!(
            link.inbound.recv().await,
            Some(WireMessage::Text("{\"final\":true}".into()))
        );
        // Stream exhausted: channel closes and the transport is no longer open.
        assert_eq!(link.inbound.recv().await, None);
        assert!(!link.transport.is_open());

        link.transport.close().await;
    }

    #[tokio::test]
    async fn remote_close_ends_inbound() {
        let script = vec![Ok(Message::Close(None))];
        let (sink, _messages, _fail) = VecSink::new();
        let counters = Arc::new(ByteCounters::new());
        let mut link = Transport::from_parts(sink, futures_util::stream::iter(script), counters);

        assert_eq!(link.inbound.recv().await, None);
        assert!(!link.transport.is_open());

        link.transport.close().await;
    }

    // ---- connect -----------------------------------------------------------

    #[tokio::test]
    async fn connect_to_invalid_url_fails() {
        let counters = Arc::new(ByteCounters::new());
        let err = Transport::connect("not a url", counters).await.err();
        assert!(matches!(err, Some(TransportError::Connect(_))));
    }
}
