//! Paravirtualized sound device for a machine emulator: virtio-mmio
//! transport, split-virtqueue walker over guest RAM, and the virtio-snd
//! device model bridging guest PCM writes to a host audio sink.

pub mod devices;
pub mod memory;
pub mod mmio;
pub mod queue;
