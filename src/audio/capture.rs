//! Microphone capture pipeline
//!
//! Microphone samples are cut into fixed-size frames, encoded as PCM16 and
//! handed to a [`FrameSink`]. Nothing is buffered beyond the frame being
//! filled: if the sink refuses a frame it is gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::codec::encode_pcm16;
use super::device::{AudioBackend, AudioStream, CaptureConstraints};
use crate::error::CaptureError;

/// Samples per outbound frame
pub const FRAME_SAMPLES: usize = 4096;

/// Destination for encoded capture frames
pub trait FrameSink: Send + 'static {
    /// Offer one PCM16 frame; returns `false` if it was dropped
    fn send_frame(&self, pcm: Vec<u8>) -> bool;
}

/// Splits a continuous sample stream into fixed-size frames
#[derive(Debug)]
pub struct FrameChunker {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameChunker {
    /// Create a chunker producing frames of `frame_samples` samples
    #[must_use]
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        }
    }

    /// Append samples, calling `emit` once per completed frame
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(&[f32])) {
        while !samples.is_empty() {
            let room = self.frame_samples - self.pending.len();
            let take = room.min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.frame_samples {
                emit(&self.pending);
                self.pending.clear();
            }
        }
    }

    /// Samples waiting for the current frame to fill
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// A running microphone capture; dropping it releases the device
pub struct CaptureHandle {
    stream: Box<dyn AudioStream>,
    frames_sent: Arc<AtomicU64>,
    frames_dropped: Arc<AtomicU64>,
}

impl CaptureHandle {
    /// Frames accepted by the sink so far
    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Frames the sink refused so far
    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Release the input device
    pub fn stop(self) {
        let sent = self.frames_sent();
        let dropped = self.frames_dropped();
        drop(self.stream);
        tracing::debug!(sent, dropped, "audio capture stopped");
    }
}

/// Owns at most one active microphone capture
pub struct CapturePipeline {
    constraints: CaptureConstraints,
    frame_samples: usize,
    handle: Option<CaptureHandle>,
}

impl CapturePipeline {
    /// Create an idle pipeline
    #[must_use]
    pub const fn new(constraints: CaptureConstraints, frame_samples: usize) -> Self {
        Self {
            constraints,
            frame_samples,
            handle: None,
        }
    }

    /// Start capturing into `sink`
    ///
    /// Starting an already running pipeline is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` or `DeviceUnavailable` if the microphone cannot be opened
    pub fn start(
        &mut self,
        backend: &dyn AudioBackend,
        sink: impl FrameSink,
    ) -> Result<(), CaptureError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let frames_sent = Arc::new(AtomicU64::new(0));
        let frames_dropped = Arc::new(AtomicU64::new(0));
        let sent = Arc::clone(&frames_sent);
        let dropped = Arc::clone(&frames_dropped);
        let mut chunker = FrameChunker::new(self.frame_samples);

        let stream = backend.open_input(
            &self.constraints,
            Box::new(move |samples: &[f32]| {
                chunker.push(samples, |frame| {
                    if sink.send_frame(encode_pcm16(frame)) {
                        sent.fetch_add(1, Ordering::Relaxed);
                    } else {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }),
        )?;

        tracing::debug!(
            sample_rate = self.constraints.sample_rate,
            frame_samples = self.frame_samples,
            "audio capture started"
        );

        self.handle = Some(CaptureHandle {
            stream,
            frames_sent,
            frames_dropped,
        });
        Ok(())
    }

    /// Stop capturing and release the device; safe to call at any time
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.handle.is_some()
    }

    /// The running capture, if any
    #[must_use]
    pub const fn handle(&self) -> Option<&CaptureHandle> {
        self.handle.as_ref()
    }
}
