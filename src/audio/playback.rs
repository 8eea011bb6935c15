//! Gapless playback of inbound audio frames
//!
//! Decoded frames go into a FIFO that the output device drains from its
//! callback. The device pulls continuously, so each frame starts as soon as
//! the previous one ends.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::codec::{RateConverter, decode_pcm16};
use super::device::{AudioBackend, AudioStream};
use crate::error::PlaybackError;

/// Output rate of the playback context (matches TTS output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<Vec<f32>>,
    cursor: usize,
    played_frames: u64,
}

/// FIFO of decoded frames shared with the output callback
#[derive(Debug, Clone, Default)]
pub struct PlaybackQueue {
    inner: Arc<Mutex<QueueState>>,
}

impl PlaybackQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one decoded frame
    pub fn push(&self, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }
        if let Ok(mut state) = self.inner.lock() {
            state.frames.push_back(samples);
        }
    }

    /// Fill `out` from the head of the queue, padding with silence
    ///
    /// Returns the number of queued samples written.
    pub fn fill(&self, out: &mut [f32]) -> usize {
        let Ok(mut state) = self.inner.lock() else {
            out.fill(0.0);
            return 0;
        };

        let mut written = 0;
        while written < out.len() {
            let cursor = state.cursor;
            let Some(front) = state.frames.front() else {
                break;
            };

            let take = (front.len() - cursor).min(out.len() - written);
            out[written..written + take].copy_from_slice(&front[cursor..cursor + take]);
            written += take;

            if cursor + take == front.len() {
                state.frames.pop_front();
                state.cursor = 0;
                state.played_frames += 1;
            } else {
                state.cursor = cursor + take;
            }
        }

        out[written..].fill(0.0);
        written
    }

    /// Drop everything not yet played
    pub fn clear(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.frames.clear();
            state.cursor = 0;
        }
    }

    /// Frames waiting (including a partially played one)
    #[must_use]
    pub fn queued_frames(&self) -> usize {
        self.inner.lock().map(|s| s.frames.len()).unwrap_or_default()
    }

    /// Frames played to the end
    #[must_use]
    pub fn played_frames(&self) -> u64 {
        self.inner.lock().map(|s| s.played_frames).unwrap_or_default()
    }

    /// Check if nothing is waiting to play
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queued_frames() == 0
    }
}

enum Context {
    Unopened,
    Open(#[allow(dead_code)] Box<dyn AudioStream>),
    Failed,
}

/// Decodes inbound frames and schedules them on a lazily opened output context
pub struct PlaybackPipeline {
    sample_rate: u32,
    input_rate: u32,
    queue: PlaybackQueue,
    converter: Option<RateConverter>,
    context: Context,
}

impl PlaybackPipeline {
    /// Create a pipeline whose context will run at `sample_rate`
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            input_rate: sample_rate,
            queue: PlaybackQueue::new(),
            converter: None,
            context: Context::Unopened,
        }
    }

    /// Set the sample rate of subsequent inbound frames
    pub fn set_input_rate(&mut self, rate: u32) {
        if rate == 0 || rate == self.input_rate {
            return;
        }
        self.flush_converter();
        self.input_rate = rate;
        self.converter = None;
        tracing::debug!(input_rate = rate, output_rate = self.sample_rate, "inbound audio rate changed");
    }

    /// Rate of inbound frames currently assumed
    #[must_use]
    pub const fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Decode a PCM16 frame and queue it behind everything already queued
    ///
    /// # Errors
    ///
    /// Returns `DecodeFailed` for a malformed frame (which is dropped), or
    /// `OutputUnavailable` the first time the output context cannot be opened
    pub fn enqueue(
        &mut self,
        backend: &dyn AudioBackend,
        frame: Vec<u8>,
    ) -> Result<(), PlaybackError> {
        let samples = decode_pcm16(&frame)?;
        let samples = self.convert(&samples)?;

        self.ensure_context(backend)?;
        if matches!(self.context, Context::Failed) {
            tracing::trace!(bytes = frame.len(), "no playback context, frame dropped");
            return Ok(());
        }

        self.queue.push(samples);
        Ok(())
    }

    /// Mark the end of an utterance, pushing out any resampler tail
    pub fn finish_utterance(&mut self) {
        self.flush_converter();
    }

    /// Stop output, drop queued audio and release the context
    pub fn close(&mut self) {
        self.queue.clear();
        self.converter = None;
        self.input_rate = self.sample_rate;
        if matches!(self.context, Context::Open(_)) {
            tracing::debug!(played = self.queue.played_frames(), "playback context closed");
        }
        self.context = Context::Unopened;
    }

    /// Check if an output context is running
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.context, Context::Open(_))
    }

    /// Queue shared with the output callback
    #[must_use]
    pub const fn queue(&self) -> &PlaybackQueue {
        &self.queue
    }

    fn ensure_context(&mut self, backend: &dyn AudioBackend) -> Result<(), PlaybackError> {
        if !matches!(self.context, Context::Unopened) {
            return Ok(());
        }

        let queue = self.queue.clone();
        match backend.open_output(
            self.sample_rate,
            Box::new(move |out: &mut [f32]| {
                queue.fill(out);
            }),
        ) {
            Ok(stream) => {
                tracing::debug!(sample_rate = self.sample_rate, "playback context opened");
                self.context = Context::Open(stream);
                Ok(())
            }
            Err(e) => {
                self.context = Context::Failed;
                Err(e)
            }
        }
    }

    fn convert(&mut self, samples: &[f32]) -> Result<Vec<f32>, PlaybackError> {
        if self.input_rate == self.sample_rate {
            return Ok(samples.to_vec());
        }
        if self.converter.is_none() {
            self.converter = Some(RateConverter::new(self.input_rate, self.sample_rate)?);
        }
        match self.converter.as_mut() {
            Some(converter) => converter.process(samples),
            None => Ok(samples.to_vec()),
        }
    }

    fn flush_converter(&mut self) {
        let Some(converter) = self.converter.as_mut() else {
            return;
        };
        match converter.flush() {
            Ok(tail) if matches!(self.context, Context::Open(_)) => self.queue.push(tail),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to flush resampler"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::audio::codec::encode_pcm16;
    use crate::audio::device::{CaptureConstraints, FillCallback, SampleCallback};
    use crate::error::CaptureError;

    struct Stream;
    impl AudioStream for Stream {}

    #[derive(Default)]
    struct CountingOutput {
        opened: AtomicUsize,
        fail: bool,
    }

    impl AudioBackend for CountingOutput {
        fn open_input(
            &self,
            _constraints: &CaptureConstraints,
            _on_samples: SampleCallback,
        ) -> Result<Box<dyn AudioStream>, CaptureError> {
            Err(CaptureError::DeviceUnavailable("output only".to_string()))
        }

        fn open_output(
            &self,
            _sample_rate: u32,
            _fill: FillCallback,
        ) -> Result<Box<dyn AudioStream>, PlaybackError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PlaybackError::OutputUnavailable("no speaker".to_string()));
            }
            Ok(Box::new(Stream))
        }
    }

    #[test]
    fn test_fill_preserves_fifo_order() {
        let queue = PlaybackQueue::new();
        queue.push(vec![1.0, 2.0, 3.0]);
        queue.push(vec![4.0]);
        queue.push(vec![5.0, 6.0]);

        let mut out = [0.0; 4];
        assert_eq!(queue.fill(&mut out), 4);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);

        let mut out = [9.0; 4];
        assert_eq!(queue.fill(&mut out), 2);
        assert_eq!(out, [5.0, 6.0, 0.0, 0.0]);
        assert!(queue.is_empty());
        assert_eq!(queue.played_frames(), 3);
    }

    #[test]
    fn test_fill_partial_frame_resumes() {
        let queue = PlaybackQueue::new();
        queue.push(vec![1.0, 2.0, 3.0, 4.0, 5.0]);

        let mut out = [0.0; 2];
        queue.fill(&mut out);
        assert_eq!(out, [1.0, 2.0]);
        queue.fill(&mut out);
        assert_eq!(out, [3.0, 4.0]);
        assert_eq!(queue.queued_frames(), 1);
    }

    #[test]
    fn test_fifo_under_concurrent_burst() {
        let queue = PlaybackQueue::new();
        let producer_queue = queue.clone();

        #[allow(clippy::cast_precision_loss)]
        let producer = std::thread::spawn(move || {
            for i in 0..2000 {
                let base = (i * 3) as f32;
                producer_queue.push(vec![base, base + 1.0, base + 2.0]);
            }
        });

        let mut played = Vec::new();
        let mut out = [0.0_f32; 7];
        while played.len() < 6000 {
            let n = queue.fill(&mut out);
            played.extend_from_slice(&out[..n]);
            if n == 0 && producer.is_finished() && queue.is_empty() {
                break;
            }
        }
        producer.join().unwrap();

        #[allow(clippy::cast_precision_loss)]
        let expected: Vec<f32> = (0..6000).map(|i| i as f32).collect();
        assert_eq!(played, expected);
    }

    #[test]
    fn test_context_opened_lazily_once() {
        let backend = CountingOutput::default();
        let mut pipeline = PlaybackPipeline::new(PLAYBACK_SAMPLE_RATE);
        assert!(!pipeline.is_open());

        pipeline.enqueue(&backend, encode_pcm16(&[0.1, 0.2])).unwrap();
        pipeline.enqueue(&backend, encode_pcm16(&[0.3])).unwrap();

        assert!(pipeline.is_open());
        assert_eq!(backend.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.queue().queued_frames(), 2);
    }

    #[test]
    fn test_malformed_frame_dropped_alone() {
        let backend = CountingOutput::default();
        let mut pipeline = PlaybackPipeline::new(PLAYBACK_SAMPLE_RATE);

        pipeline.enqueue(&backend, encode_pcm16(&[0.5])).unwrap();
        let err = pipeline.enqueue(&backend, vec![0x01]).unwrap_err();
        assert!(matches!(err, PlaybackError::DecodeFailed(_)));
        pipeline.enqueue(&backend, encode_pcm16(&[-0.5])).unwrap();

        let mut out = [0.0; 2];
        assert_eq!(pipeline.queue().fill(&mut out), 2);
        assert!(out[0] > 0.49 && out[1] < -0.49);
    }

    #[test]
    fn test_output_failure_reported_once() {
        let backend = CountingOutput {
            fail: true,
            ..CountingOutput::default()
        };
        let mut pipeline = PlaybackPipeline::new(PLAYBACK_SAMPLE_RATE);

        assert!(matches!(
            pipeline.enqueue(&backend, encode_pcm16(&[0.1])),
            Err(PlaybackError::OutputUnavailable(_))
        ));
        assert!(pipeline.enqueue(&backend, encode_pcm16(&[0.1])).is_ok());
        assert_eq!(backend.opened.load(Ordering::SeqCst), 1);
        assert!(pipeline.queue().is_empty());

        // Closing resets so the next session retries
        pipeline.close();
        let _ = pipeline.enqueue(&backend, encode_pcm16(&[0.1]));
        assert_eq!(backend.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_resamples_announced_rate() {
        let backend = CountingOutput::default();
        let mut pipeline = PlaybackPipeline::new(PLAYBACK_SAMPLE_RATE);
        pipeline.set_input_rate(16_000);
        assert_eq!(pipeline.input_rate(), 16_000);

        pipeline.enqueue(&backend, encode_pcm16(&vec![0.2; 4096])).unwrap();
        pipeline.finish_utterance();

        let mut out = vec![0.0; 8000];
        let played = pipeline.queue().fill(&mut out);
        assert_eq!(played, 6144);
        // Both edges carry the utterance, not resampler delay
        assert!(out[..16].iter().all(|&s| s > 0.05), "{:?}", &out[..16]);
        assert!(out[6100..6140].iter().all(|&s| (s - 0.2).abs() < 0.05));
        assert!(out[400..5700].iter().all(|&s| (s - 0.2).abs() < 0.02));
    }

    #[test]
    fn test_close_clears_queue() {
        let backend = CountingOutput::default();
        let mut pipeline = PlaybackPipeline::new(PLAYBACK_SAMPLE_RATE);
        pipeline.enqueue(&backend, encode_pcm16(&[0.1; 10])).unwrap();

        pipeline.close();
        assert!(!pipeline.is_open());
        assert!(pipeline.queue().is_empty());
    }
}
