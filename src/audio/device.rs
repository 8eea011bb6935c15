//! Audio device access
//!
//! [`AudioBackend`] is the seam between the session and the sound hardware.
//! [`CpalBackend`] talks to the default host devices; tests inject their own
//! backend so no hardware is needed.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};

use super::codec::{RateConverter, downmix};
use crate::error::{CaptureError, PlaybackError};

/// Receives mono input samples at the requested capture rate
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Fills a mono output buffer at the playback rate
pub type FillCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// A running device stream; dropping it releases the device
pub trait AudioStream {}

impl AudioStream for cpal::Stream {}

/// Requested microphone settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    /// Sample rate delivered to the callback
    pub sample_rate: u32,
    /// Channel count delivered to the callback (always mono here)
    pub channels: u16,
    /// Ask the host for acoustic echo cancellation
    pub echo_cancellation: bool,
    /// Ask the host for noise suppression
    pub noise_suppression: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: super::CAPTURE_SAMPLE_RATE,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Opens input and output streams
pub trait AudioBackend {
    /// Open the microphone and start delivering samples
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` or `DeviceUnavailable` if the device cannot be acquired
    fn open_input(
        &self,
        constraints: &CaptureConstraints,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn AudioStream>, CaptureError>;

    /// Open the speaker and start pulling samples
    ///
    /// # Errors
    ///
    /// Returns `OutputUnavailable` if no output stream can be built
    fn open_output(
        &self,
        sample_rate: u32,
        fill: FillCallback,
    ) -> Result<Box<dyn AudioStream>, PlaybackError>;
}

/// Default host devices through cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    /// Create a backend bound to the default host
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        constraints: &CaptureConstraints,
        mut on_samples: SampleCallback,
    ) -> Result<Box<dyn AudioStream>, CaptureError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no input device available".to_string()))?;

        let wanted = SampleRate(constraints.sample_rate);
        let native = device
            .supported_input_configs()
            .map_err(|e| classify_capture_error(&e.to_string()))?
            .find(|c| {
                c.channels() == constraints.channels
                    && c.sample_format() == SampleFormat::F32
                    && c.min_sample_rate() <= wanted
                    && c.max_sample_rate() >= wanted
            });

        let config: StreamConfig = if let Some(range) = native {
            range.with_sample_rate(wanted).config()
        } else {
            // Fall back to the device default and convert in the callback
            let default = device
                .default_input_config()
                .map_err(|e| classify_capture_error(&e.to_string()))?;
            if default.sample_format() != SampleFormat::F32 {
                return Err(CaptureError::DeviceUnavailable(format!(
                    "unsupported input sample format {:?}",
                    default.sample_format()
                )));
            }
            default.config()
        };

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            device_rate = config.sample_rate.0,
            channels = config.channels,
            target_rate = constraints.sample_rate,
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            "opening audio input (echo cancellation and noise suppression are host-controlled)"
        );

        let channels = usize::from(config.channels);
        let mut converter = if config.sample_rate.0 == constraints.sample_rate {
            None
        } else {
            Some(
                RateConverter::new(config.sample_rate.0, constraints.sample_rate)
                    .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?,
            )
        };

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = downmix(data, channels);
                    match converter.as_mut() {
                        None => on_samples(&mono),
                        Some(conv) => match conv.process(&mono) {
                            Ok(converted) if !converted.is_empty() => on_samples(&converted),
                            Ok(_) => {}
                            Err(e) => tracing::warn!(error = %e, "input resample failed"),
                        },
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| classify_capture_error(&e.to_string()))?;

        stream
            .play()
            .map_err(|e| classify_capture_error(&e.to_string()))?;

        Ok(Box::new(stream))
    }

    fn open_output(
        &self,
        sample_rate: u32,
        mut fill: FillCallback,
    ) -> Result<Box<dyn AudioStream>, PlaybackError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            PlaybackError::OutputUnavailable("no output device available".to_string())
        })?;

        let wanted = SampleRate(sample_rate);
        let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= wanted
                && c.max_sample_rate() >= wanted
        };

        let supported = device
            .supported_output_configs()
            .map_err(|e| PlaybackError::OutputUnavailable(e.to_string()))?
            .find(|c| supports(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| supports(c, 2))
            })
            .ok_or_else(|| {
                PlaybackError::OutputUnavailable("no suitable output config found".to_string())
            })?;

        let config = supported.with_sample_rate(wanted).config();
        let channels = usize::from(config.channels);

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels,
            "opening audio output"
        );

        let mut mono = Vec::new();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    mono.resize(data.len() / channels, 0.0);
                    fill(&mut mono);
                    for (frame, sample) in data.chunks_mut(channels).zip(mono.iter()) {
                        frame.fill(*sample);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| PlaybackError::OutputUnavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| PlaybackError::OutputUnavailable(e.to_string()))?;

        Ok(Box::new(stream))
    }
}

/// Map a host error message onto the capture error kinds
#[must_use]
pub fn classify_capture_error(message: &str) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        CaptureError::PermissionDenied(message.to_string())
    } else {
        CaptureError::DeviceUnavailable(message.to_string())
    }
}
