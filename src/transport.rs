//! Duplex streaming connection to the voice agent
//!
//! One websocket carries both frame kinds: textual frames are JSON control
//! messages, binary frames are PCM16 audio. The frame kind is the only
//! demultiplexing signal.
//!
//! A background task owns the socket. Callers push frames into a bounded
//! outbound queue and read [`TransportEvent`]s in arrival order. Sends are
//! accepted only while the socket is open; anything else is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::audio::FrameSink;
use crate::error::TransportError;
use crate::protocol::ControlMessage;

/// Capacity of the outbound frame queue
const OUTBOUND_CAPACITY: usize = 256;

/// How long to wait for the peer's close frame after sending ours
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Something that happened on the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Socket is open; sends are now accepted
    Open,
    /// Textual frame (control JSON)
    Text(String),
    /// Binary frame (audio)
    Binary(Vec<u8>),
    /// Failure; always followed by `Closed`
    Error(TransportError),
    /// Socket is gone; terminal
    Closed(Option<u16>),
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

impl Outbound {
    fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text.into()),
            Self::Binary(bytes) => Message::Binary(bytes.into()),
        }
    }
}

/// Send-side state shared by every handle of one connection
#[derive(Debug)]
struct SendState {
    open: AtomicBool,
    dropped: AtomicU64,
}

impl SendState {
    fn offer(&self, tx: &mpsc::Sender<Outbound>, frame: Outbound) -> bool {
        if !self.open.load(Ordering::Acquire) {
            return false;
        }
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(dropped, "outbound queue full, dropping frames");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Handle to one streaming connection
pub struct Connection {
    endpoint: String,
    state: Arc<SendState>,
    outbound: mpsc::Sender<Outbound>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    /// Close request, kept apart from the outbound queue so a full queue
    /// cannot hold it back. Dropping it also closes.
    close_signal: Option<oneshot::Sender<()>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Start connecting to `endpoint`
    ///
    /// Returns immediately; the result arrives as [`TransportEvent::Open`] or
    /// as [`TransportEvent::Error`] followed by [`TransportEvent::Closed`].
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn connect(endpoint: &str) -> Self {
        let state = Arc::new(SendState {
            open: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (close_signal, close_rx) = oneshot::channel();

        tokio::spawn(run_socket(
            endpoint.to_string(),
            Arc::clone(&state),
            outbound_rx,
            close_rx,
            events_tx,
        ));

        Self {
            endpoint: endpoint.to_string(),
            state,
            outbound,
            events,
            close_signal: Some(close_signal),
        }
    }

    /// Address this connection targets
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Check if sends are currently accepted
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    /// Queue a control message; returns `false` if it was dropped
    pub fn send_text(&self, message: &ControlMessage) -> bool {
        match message.to_json() {
            Ok(json) => self.state.offer(&self.outbound, Outbound::Text(json)),
            Err(e) => {
                tracing::warn!(kind = message.kind(), error = %e, "control message not serializable");
                false
            }
        }
    }

    /// Queue an audio frame; returns `false` if it was dropped
    pub fn send_binary(&self, bytes: Vec<u8>) -> bool {
        self.state.offer(&self.outbound, Outbound::Binary(bytes))
    }

    /// Cheap handle for the capture path
    #[must_use]
    pub fn audio_sender(&self) -> AudioSender {
        AudioSender {
            state: Arc::clone(&self.state),
            outbound: self.outbound.clone(),
        }
    }

    /// Frames dropped because the outbound queue was full
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    /// Begin a clean close; later sends are dropped. Idempotent.
    ///
    /// Frames already queued are written before the close frame.
    pub fn close(&mut self) {
        self.state.open.store(false, Ordering::Release);
        if let Some(signal) = self.close_signal.take() {
            let _ = signal.send(());
        }
    }

    /// Wait for the next event; `None` once the socket task has finished
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Take an already delivered event without waiting
    pub fn try_next_event(&mut self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Send-only handle used by microphone capture
#[derive(Debug, Clone)]
pub struct AudioSender {
    state: Arc<SendState>,
    outbound: mpsc::Sender<Outbound>,
}

impl AudioSender {
    /// Queue an audio frame; returns `false` if it was dropped
    pub fn send_binary(&self, bytes: Vec<u8>) -> bool {
        self.state.offer(&self.outbound, Outbound::Binary(bytes))
    }

    /// Check if sends are currently accepted
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }
}

impl FrameSink for AudioSender {
    fn send_frame(&self, pcm: Vec<u8>) -> bool {
        self.send_binary(pcm)
    }
}

async fn run_socket(
    endpoint: String,
    state: Arc<SendState>,
    mut outbound: mpsc::Receiver<Outbound>,
    mut close_rx: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let socket = match tokio_tungstenite::connect_async(endpoint.as_str()).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            tracing::debug!(endpoint = %endpoint, error = %e, "websocket connect failed");
            let _ = events.send(TransportEvent::Error(TransportError::ConnectFailed(
                e.to_string(),
            )));
            let _ = events.send(TransportEvent::Closed(None));
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    // A close requested while connecting wins over the open
    if !matches!(close_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
        let _ = sink.send(Message::Close(None)).await;
        let _ = events.send(TransportEvent::Closed(None));
        return;
    }

    state.open.store(true, Ordering::Release);
    tracing::debug!(endpoint = %endpoint, "websocket open");
    let _ = events.send(TransportEvent::Open);

    let mut closing = false;
    let mut frames_out: u64 = 0;
    let close_timer = tokio::time::sleep(CLOSE_GRACE);
    tokio::pin!(close_timer);

    let close_code = loop {
        tokio::select! {
            out = outbound.recv(), if !closing => match out {
                Some(frame) => {
                    if matches!(frame, Outbound::Binary(_)) {
                        frames_out += 1;
                    }
                    if let Err(e) = sink.send(frame.into_message()).await {
                        let _ = events.send(TransportEvent::Error(TransportError::AbnormalClose(
                            e.to_string(),
                        )));
                        break None;
                    }
                }
                // Every sender is gone, so the handle was dropped
                None => {
                    closing = true;
                    close_timer.as_mut().reset(Instant::now() + CLOSE_GRACE);
                    if sink.send(Message::Close(None)).await.is_err() {
                        break None;
                    }
                }
            },
            _ = &mut close_rx, if !closing => {
                closing = true;
                state.open.store(false, Ordering::Release);
                close_timer.as_mut().reset(Instant::now() + CLOSE_GRACE);
                if let Err(e) = send_close(&mut sink, &mut outbound, &mut frames_out).await {
                    tracing::debug!(endpoint = %endpoint, error = %e, "close frame not sent");
                    break None;
                }
            }
            () = &mut close_timer, if closing => {
                tracing::debug!(endpoint = %endpoint, "peer did not answer close frame");
                break None;
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Text(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = events.send(TransportEvent::Binary(bytes.to_vec()));
                }
                Some(Ok(Message::Close(frame))) => {
                    // Writes the queued close reply
                    let _ = sink.close().await;
                    break frame.map(|f| u16::from(f.code));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    if !closing {
                        let _ = events.send(TransportEvent::Error(TransportError::AbnormalClose(
                            e.to_string(),
                        )));
                    }
                    break None;
                }
                None => {
                    if !closing {
                        let _ = events.send(TransportEvent::Error(TransportError::AbnormalClose(
                            "connection dropped without close frame".to_string(),
                        )));
                    }
                    break None;
                }
            }
        }
    };

    state.open.store(false, Ordering::Release);
    tracing::debug!(endpoint = %endpoint, frames_out, ?close_code, "websocket closed");
    let _ = events.send(TransportEvent::Closed(close_code));
}

/// Write every frame still queued, then the close frame
async fn send_close<S>(
    sink: &mut S,
    outbound: &mut mpsc::Receiver<Outbound>,
    frames_out: &mut u64,
) -> Result<(), tungstenite::Error>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Ok(frame) = outbound.try_recv() {
        if matches!(frame, Outbound::Binary(_)) {
            *frames_out += 1;
        }
        sink.send(frame.into_message()).await?;
    }
    sink.send(Message::Close(None)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sends_before_open_are_dropped() {
        // Nothing listens here; the connect attempt fails later
        let mut conn = Connection::connect("ws://127.0.0.1:9/ws");
        assert!(!conn.is_open());
        assert!(!conn.send_binary(vec![0, 1]));
        assert!(!conn.send_text(&ControlMessage::Ping));
        assert!(!conn.audio_sender().send_frame(vec![0, 1]));

        let first = conn.next_event().await.unwrap();
        assert!(matches!(
            first,
            TransportEvent::Error(TransportError::ConnectFailed(_))
        ));
        assert_eq!(conn.next_event().await, Some(TransportEvent::Closed(None)));
    }

    #[tokio::test]
    async fn test_unknown_message_not_serialized() {
        let conn = Connection::connect("ws://127.0.0.1:9/ws");
        assert!(!conn.send_text(&ControlMessage::Unknown {
            kind: "x".to_string()
        }));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut conn = Connection::connect("ws://127.0.0.1:9/ws");
        conn.close();
        conn.close();
        assert!(!conn.is_open());
    }
}
