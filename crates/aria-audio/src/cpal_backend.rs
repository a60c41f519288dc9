//! System audio output through cpal.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, StreamConfig};
use tracing::{info, warn};

use crate::sink::{AudioBackend, AudioError, PullFn, SinkConfig, SinkHandle};

/// Plays through the host's default output device.
#[derive(Debug, Default)]
pub struct CpalBackend;

struct CpalSinkHandle {
    // Dropping the stream stops playback and joins the data callback.
    _stream: cpal::Stream,
}

impl SinkHandle for CpalSinkHandle {}

fn log_stream_error(err: cpal::StreamError) {
    warn!(%err, "host audio stream error");
}

impl AudioBackend for CpalBackend {
    fn open(&mut self, config: &SinkConfig, mut pull: PullFn) -> Result<Box<dyn SinkHandle>, AudioError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::NoDevice)?;

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: SampleRate(config.sample_rate_hz),
            buffer_size: BufferSize::Fixed(config.frames_per_period),
        };

        let native_i16 = device
            .supported_output_configs()
            .map(|mut configs| configs.any(|c| c.sample_format() == SampleFormat::I16))
            .unwrap_or(false);

        info!(
            name = %config.name,
            rate = config.sample_rate_hz,
            channels = config.channels,
            frames_per_period = config.frames_per_period,
            native_i16,
            "opening host audio sink"
        );

        let stream = if native_i16 {
            device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| pull(data),
                log_stream_error,
                None,
            )
        } else {
            // Device only does float output; pull S16 and convert.
            let mut staging = Vec::new();
            device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    staging.resize(data.len(), 0i16);
                    pull(&mut staging);
                    for (dst, &s) in data.iter_mut().zip(staging.iter()) {
                        *dst = f32::from(s) / 32_768.0;
                    }
                },
                log_stream_error,
                None,
            )
        }
        .map_err(|e| AudioError::OpenFailed(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::OpenFailed(e.to_string()))?;

        Ok(Box::new(CpalSinkHandle { _stream: stream }))
    }
}
