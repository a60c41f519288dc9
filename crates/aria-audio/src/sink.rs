//! Host audio sink seam.
//!
//! The device opens a sink when a stream is prepared and closes it on
//! release. The backend owns the playback thread and pulls S16 frames
//! through the callback; the device never pushes.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    /// Human-readable stream name handed to the host audio system.
    pub name: String,
    pub sample_rate_hz: u32,
    pub channels: u16,
    /// Frame count per pull-callback invocation.
    pub frames_per_period: u32,
}

/// Pull callback. Invoked on the backend's playback thread with a buffer of
/// `frames_per_period * channels` interleaved S16 samples to fill.
pub type PullFn = Box<dyn FnMut(&mut [i16]) + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no output device available")]
    NoDevice,
    #[error("failed to open audio stream: {0}")]
    OpenFailed(String),
}

/// Keep-alive for an open sink. Dropping it stops playback and joins the
/// pull callback, after which the callback is never invoked again.
pub trait SinkHandle {}

pub trait AudioBackend: Send {
    fn open(&mut self, config: &SinkConfig, pull: PullFn) -> Result<Box<dyn SinkHandle>, AudioError>;
}

impl fmt::Debug for dyn SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SinkHandle")
    }
}

/// Backend that opens successfully and never pulls. Useful for headless
/// hosts and for exercising the control plane without an audio device.
#[derive(Debug, Default)]
pub struct NullBackend;

struct NullSinkHandle {
    _pull: PullFn,
}

impl SinkHandle for NullSinkHandle {}

impl AudioBackend for NullBackend {
    fn open(&mut self, _config: &SinkConfig, pull: PullFn) -> Result<Box<dyn SinkHandle>, AudioError> {
        Ok(Box::new(NullSinkHandle { _pull: pull }))
    }
}
