//! Microphone capture, speaker playback and the PCM16 wire format
//!
//! Capture runs at 16 kHz mono and hands fixed-size PCM16 frames to a
//! [`FrameSink`]. Playback decodes inbound PCM16 frames and queues them for
//! gapless output on a lazily opened device stream.

mod capture;
pub mod codec;
mod device;
mod playback;

pub use capture::{CaptureHandle, CapturePipeline, FRAME_SAMPLES, FrameChunker, FrameSink};
pub use codec::{RateConverter, decode_pcm16, encode_pcm16};
pub use device::{
    AudioBackend, AudioStream, CaptureConstraints, CpalBackend, FillCallback, SampleCallback,
    classify_capture_error,
};
pub use playback::{PLAYBACK_SAMPLE_RATE, PlaybackPipeline, PlaybackQueue};

/// Sample rate of outbound microphone audio
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
