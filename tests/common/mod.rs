//! Shared test utilities

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;

use vocal_live::audio::{AudioStream, FillCallback, SampleCallback};
use vocal_live::error::{CaptureError, PlaybackError};
use vocal_live::{AudioBackend, CaptureConstraints, EventLog, HandshakeClient, LogCategory};

pub type ServerSocket = WebSocketStream<TcpStream>;

struct NullStream;
impl AudioStream for NullStream {}

/// Audio backend without hardware
///
/// Input delivers `mic_samples` once on open; output streams are counted.
#[derive(Clone, Default)]
pub struct FakeAudio {
    pub mic_samples: Vec<f32>,
    pub outputs: Arc<AtomicUsize>,
}

impl FakeAudio {
    pub fn outputs_opened(&self) -> usize {
        self.outputs.load(Ordering::SeqCst)
    }
}

impl AudioBackend for FakeAudio {
    fn open_input(
        &self,
        _constraints: &CaptureConstraints,
        mut on_samples: SampleCallback,
    ) -> Result<Box<dyn AudioStream>, CaptureError> {
        if !self.mic_samples.is_empty() {
            on_samples(&self.mic_samples);
        }
        Ok(Box::new(NullStream))
    }

    fn open_output(
        &self,
        _sample_rate: u32,
        _fill: FillCallback,
    ) -> Result<Box<dyn AudioStream>, PlaybackError> {
        self.outputs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(NullStream))
    }
}

/// Accept one websocket connection on a local port and hand it to `handler`
pub async fn spawn_ws_server<F, Fut>(handler: F) -> SocketAddr
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().expect("listener has no address");

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept failed");
        let socket = tokio_tungstenite::accept_async(stream)
            .await
            .expect("websocket handshake failed");
        handler(socket).await;
    });

    addr
}

/// REST client for a mock server
pub fn handshake_client(base_url: &str) -> HandshakeClient {
    HandshakeClient::new(base_url, None, Duration::from_secs(5))
        .expect("failed to build handshake client")
}

/// Messages of one category, oldest first
pub fn messages(log: &EventLog, category: LogCategory) -> Vec<String> {
    log.by_category(category)
        .into_iter()
        .map(|e| e.message)
        .collect()
}
