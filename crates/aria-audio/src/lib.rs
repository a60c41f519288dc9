//! Host-side audio primitives for the aria virtio-sound device: the
//! lock-free PCM byte ring bridging the guest TX path to the host audio
//! callback, and the host sink abstraction the device plays through.

pub mod ring;
pub mod sink;

#[cfg(feature = "cpal-backend")]
pub mod cpal_backend;
