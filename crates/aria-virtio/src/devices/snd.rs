//! virtio-snd device model (device id 25).
//!
//! One output jack, one S16/44.1kHz mono playback stream, one channel map.
//! Control requests arrive on queue 0 and are handled inline on the hart
//! thread; TX buffers arrive on queue 2 and are drained by a dedicated
//! producer thread into the stream's PCM ring, which the host audio callback
//! consumes on the backend's playback thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use aria_audio::ring::{PcmRingBuffer, RingConsumer, RingProducer, MAX_RING_BYTES};
use aria_audio::sink::{AudioBackend, PullFn, SinkConfig, SinkHandle};
use tracing::{debug, warn};

use crate::memory::{read_u32_le, write_u32_le, GuestMemory};
use crate::mmio::{
    check_access, AccessWidth, MmioFault, MmioRegs, MMIO_DEVICE_VERSION, REG_CONFIG,
    REG_CONFIG_GENERATION, REG_DEVICE_FEATURES, REG_DEVICE_FEATURES_SEL, REG_DEVICE_ID,
    REG_DRIVER_FEATURES, REG_DRIVER_FEATURES_SEL, REG_INTERRUPT_ACK, REG_INTERRUPT_STATUS,
    REG_MAGIC_VALUE, REG_QUEUE_DESC_HIGH, REG_QUEUE_DESC_LOW, REG_QUEUE_DEVICE_HIGH,
    REG_QUEUE_DEVICE_LOW, REG_QUEUE_DRIVER_HIGH, REG_QUEUE_DRIVER_LOW, REG_QUEUE_NOTIFY,
    REG_QUEUE_NUM, REG_QUEUE_NUM_MAX, REG_QUEUE_READY, REG_QUEUE_SEL, REG_STATUS, REG_VENDOR_ID,
    REG_VERSION, VIRTIO_DEVICE_ID_SOUND, VIRTIO_INT_USED_RING, VIRTIO_VENDOR_ID, VIRT_MAGIC,
};
use crate::queue::{Descriptor, DescriptorChain, VirtQueue, VirtQueueError, QUEUE_NUM_MAX};

pub const VIRTIO_SND_QUEUE_CONTROL: u32 = 0;
pub const VIRTIO_SND_QUEUE_EVENT: u32 = 1;
pub const VIRTIO_SND_QUEUE_TX: u32 = 2;
const QUEUE_COUNT: usize = 3;

/// Control request codes.
pub const VIRTIO_SND_R_JACK_INFO: u32 = 0x0001;
pub const VIRTIO_SND_R_PCM_INFO: u32 = 0x0100;
pub const VIRTIO_SND_R_PCM_SET_PARAMS: u32 = 0x0101;
pub const VIRTIO_SND_R_PCM_PREPARE: u32 = 0x0102;
pub const VIRTIO_SND_R_PCM_RELEASE: u32 = 0x0103;
pub const VIRTIO_SND_R_PCM_START: u32 = 0x0104;
pub const VIRTIO_SND_R_PCM_STOP: u32 = 0x0105;
pub const VIRTIO_SND_R_CHMAP_INFO: u32 = 0x0200;

/// Control status codes.
pub const VIRTIO_SND_S_OK: u32 = 0x8000;
pub const VIRTIO_SND_S_BAD_MSG: u32 = 0x8001;
pub const VIRTIO_SND_S_NOT_SUPP: u32 = 0x8002;
pub const VIRTIO_SND_S_IO_ERR: u32 = 0x8003;

pub const VIRTIO_SND_D_OUTPUT: u8 = 0;
pub const VIRTIO_SND_D_INPUT: u8 = 1;

/// PCM frame rates by negotiation index.
pub const PCM_RATE_HZ: [u32; 14] = [
    5512, 8000, 11025, 16000, 22050, 32000, 44100, 48000, 64000, 88200, 96000, 176_400, 192_000,
    384_000,
];

pub const VIRTIO_SND_PCM_RATE_5512: u8 = 0;
pub const VIRTIO_SND_PCM_RATE_8000: u8 = 1;
pub const VIRTIO_SND_PCM_RATE_11025: u8 = 2;
pub const VIRTIO_SND_PCM_RATE_16000: u8 = 3;
pub const VIRTIO_SND_PCM_RATE_22050: u8 = 4;
pub const VIRTIO_SND_PCM_RATE_32000: u8 = 5;
pub const VIRTIO_SND_PCM_RATE_44100: u8 = 6;
pub const VIRTIO_SND_PCM_RATE_48000: u8 = 7;
pub const VIRTIO_SND_PCM_RATE_64000: u8 = 8;
pub const VIRTIO_SND_PCM_RATE_88200: u8 = 9;
pub const VIRTIO_SND_PCM_RATE_96000: u8 = 10;
pub const VIRTIO_SND_PCM_RATE_176400: u8 = 11;
pub const VIRTIO_SND_PCM_RATE_192000: u8 = 12;
pub const VIRTIO_SND_PCM_RATE_384000: u8 = 13;

pub fn pcm_rate_hz(index: u8) -> Option<u32> {
    PCM_RATE_HZ.get(usize::from(index)).copied()
}

/// PCM sample formats by negotiation index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PcmFormat {
    ImaAdpcm = 0,
    MuLaw,
    ALaw,
    S8,
    U8,
    S16,
    U16,
    S18_3,
    U18_3,
    S20_3,
    U20_3,
    S24_3,
    U24_3,
    S20,
    U20,
    S24,
    U24,
    S32,
    U32,
    Float,
    Float64,
    DsdU8,
    DsdU16,
    DsdU32,
    Iec958Subframe,
}

pub const VIRTIO_SND_PCM_FMT_S16: u8 = PcmFormat::S16 as u8;

/// Standard speaker positions for channel maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChmapPosition {
    None = 0,
    Na,
    Mono,
    Fl,
    Fr,
    Rl,
    Rr,
    Fc,
    Lfe,
    Sl,
    Sr,
    Rc,
    Flc,
    Frc,
    Rlc,
    Rrc,
    Flw,
    Frw,
    Flh,
    Fch,
    Frh,
    Tc,
    Tfl,
    Tfr,
    Tfc,
    Trl,
    Trr,
    Trc,
    Tflc,
    Tfrc,
    Tsl,
    Tsr,
    Llfe,
    Rlfe,
    Bc,
    Blc,
    Brc,
}

pub const VIRTIO_SND_CHMAP_MONO: u8 = ChmapPosition::Mono as u8;
pub const VIRTIO_SND_CHMAP_MAX_SIZE: usize = 18;

/// Wire sizes of the info response elements.
pub const JACK_INFO_SIZE: u32 = 24;
pub const PCM_INFO_SIZE: u32 = 32;
pub const CHMAP_INFO_SIZE: u32 = 24;
const PCM_STATUS_SIZE: u32 = 8;

/// Per-chain cap on TX payload bytes; larger transfers are refused.
pub const MAX_PCM_XFER_BYTES: u32 = 256 * 1024;

/// Guest-visible topology, exposed verbatim in the config window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SndConfig {
    pub jacks: u32,
    pub streams: u32,
    pub chmaps: u32,
    pub controls: u32,
}

impl Default for SndConfig {
    fn default() -> Self {
        Self {
            jacks: 1,
            streams: 1,
            chmaps: 1,
            // No control elements.
            controls: 0,
        }
    }
}

/// PCM stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Released,
    ParamsSet,
    Prepared,
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmParams {
    pub buffer_bytes: u32,
    pub period_bytes: u32,
    pub features: u32,
    pub channels: u8,
    pub format: u8,
    pub rate: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum SndError {
    #[error("device limit of {max} virtio-snd instance(s) reached")]
    TooManyDevices { max: usize },
    #[error("failed to spawn TX thread: {0}")]
    TxThread(std::io::Error),
}

/// Gate between the control plane and the audio callback. The callback
/// parks here while the guest is not playing; START/STOP flip the counter
/// and wake it, and `closing` lets a sink close join a parked callback.
struct PlaybackGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    playing: u32,
    closing: bool,
}

impl PlaybackGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
        }
    }

    fn start(&self) {
        self.state.lock().unwrap().playing += 1;
        self.cond.notify_all();
    }

    fn stop(&self) {
        let mut st = self.state.lock().unwrap();
        st.playing = st.playing.saturating_sub(1);
        self.cond.notify_all();
    }

    fn reset(&self) {
        let mut st = self.state.lock().unwrap();
        st.playing = 0;
        st.closing = false;
    }

    fn begin_close(&self) {
        self.state.lock().unwrap().closing = true;
        self.cond.notify_all();
    }

    fn playing(&self) -> u32 {
        self.state.lock().unwrap().playing
    }

    /// Parks until the guest is playing, zero-filling `out` on every pass.
    /// Returns `false` when the gate is closing and the callback must bail.
    fn wait_playable(&self, out: &mut [i16]) -> bool {
        let mut st = self.state.lock().unwrap();
        while st.playing == 0 && !st.closing {
            out.fill(0);
            st = self.cond.wait(st).unwrap();
        }
        if st.closing {
            out.fill(0);
            return false;
        }
        true
    }
}

struct PcmStream {
    state: StreamState,
    params: Option<PcmParams>,
    /// Write end of the PCM ring, present between PREPARE and RELEASE. The
    /// read end lives inside the pull callback and dies with the sink.
    producer: Option<RingProducer>,
    gate: Arc<PlaybackGate>,
}

impl PcmStream {
    fn new() -> Self {
        Self {
            state: StreamState::Released,
            params: None,
            producer: None,
            gate: Arc::new(PlaybackGate::new()),
        }
    }
}

struct DeviceState {
    regs: MmioRegs,
    queues: [VirtQueue; QUEUE_COUNT],
    config: SndConfig,
    streams: Vec<PcmStream>,
}

#[derive(Debug, Default)]
struct TxSignal {
    pending: u32,
    shutdown: bool,
}

struct SndShared {
    state: Mutex<DeviceState>,
    tx: Mutex<TxSignal>,
    tx_cond: Condvar,
}

static DEVICE_COUNT: AtomicUsize = AtomicUsize::new(0);
const DEVICE_COUNT_MAX: usize = 1;

/// The virtio-snd device. Owned by the emulator's hart/MMIO thread; the TX
/// producer thread it spawns lives until drop.
pub struct VirtioSnd<M: GuestMemory + 'static> {
    shared: Arc<SndShared>,
    mem: Arc<M>,
    backend: Box<dyn AudioBackend>,
    /// Open host sink, present between PREPARE and RELEASE. Kept out of the
    /// shared state because sink handles need not be `Send`.
    sink: Option<Box<dyn SinkHandle>>,
    tx_thread: Option<JoinHandle<()>>,
}

impl<M: GuestMemory + 'static> VirtioSnd<M> {
    pub fn new(mem: Arc<M>, backend: Box<dyn AudioBackend>) -> Result<Self, SndError> {
        Self::with_config(mem, backend, SndConfig::default())
    }

    pub fn with_config(
        mem: Arc<M>,
        backend: Box<dyn AudioBackend>,
        config: SndConfig,
    ) -> Result<Self, SndError> {
        if DEVICE_COUNT
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < DEVICE_COUNT_MAX).then_some(n + 1)
            })
            .is_err()
        {
            return Err(SndError::TooManyDevices {
                max: DEVICE_COUNT_MAX,
            });
        }

        let streams = (0..config.streams).map(|_| PcmStream::new()).collect();
        let shared = Arc::new(SndShared {
            state: Mutex::new(DeviceState {
                regs: MmioRegs::new(),
                queues: Default::default(),
                config,
                streams,
            }),
            tx: Mutex::new(TxSignal::default()),
            tx_cond: Condvar::new(),
        });

        let tx_thread = {
            let shared = Arc::clone(&shared);
            let mem = Arc::clone(&mem);
            thread::Builder::new()
                .name("aria-snd-tx".into())
                .spawn(move || tx_worker(shared, mem))
        };
        let tx_thread = match tx_thread {
            Ok(handle) => handle,
            Err(e) => {
                DEVICE_COUNT.fetch_sub(1, Ordering::SeqCst);
                return Err(SndError::TxThread(e));
            }
        };

        Ok(Self {
            shared,
            mem,
            backend,
            sink: None,
            tx_thread: Some(tx_thread),
        })
    }

    /// Guest load from the device window. `offset` is relative to the
    /// window base.
    pub fn mmio_load(&self, offset: u64, width: AccessWidth) -> Result<u32, MmioFault> {
        check_access(offset, width)?;
        let state = self.shared.state.lock().unwrap();
        let value = match offset {
            REG_MAGIC_VALUE => VIRT_MAGIC,
            REG_VERSION => MMIO_DEVICE_VERSION,
            REG_DEVICE_ID => VIRTIO_DEVICE_ID_SOUND,
            REG_VENDOR_ID => VIRTIO_VENDOR_ID,
            REG_DEVICE_FEATURES => state.regs.device_features_bank(),
            REG_QUEUE_NUM_MAX => u32::from(QUEUE_NUM_MAX),
            REG_QUEUE_READY => u32::from(state.queues[state.regs.queue_sel as usize].ready),
            REG_INTERRUPT_STATUS => state.regs.interrupt_status,
            REG_STATUS => state.regs.status,
            REG_CONFIG_GENERATION => 0,
            _ => config_word(&state.config, offset).ok_or(MmioFault::BadOffset { offset })?,
        };
        Ok(value)
    }

    /// Guest store into the device window.
    pub fn mmio_store(&mut self, offset: u64, width: AccessWidth, value: u32) -> Result<(), MmioFault> {
        check_access(offset, width)?;
        if offset == REG_QUEUE_NOTIFY {
            self.queue_notify(value);
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock().unwrap();
        let st = &mut *state;
        match offset {
            REG_DEVICE_FEATURES_SEL => st.regs.device_features_sel = value,
            REG_DRIVER_FEATURES => {
                if st.regs.driver_features_sel == 0 {
                    st.regs.driver_features = value;
                }
            }
            REG_DRIVER_FEATURES_SEL => st.regs.driver_features_sel = value,
            REG_QUEUE_SEL => {
                if (value as usize) < QUEUE_COUNT {
                    st.regs.queue_sel = value;
                } else {
                    st.regs.mark_needs_reset();
                }
            }
            REG_QUEUE_NUM => {
                if (1..=u32::from(QUEUE_NUM_MAX)).contains(&value) {
                    st.queues[st.regs.queue_sel as usize].size = value as u16;
                } else {
                    st.regs.mark_needs_reset();
                }
            }
            REG_QUEUE_READY => {
                let sel = st.regs.queue_sel as usize;
                st.queues[sel].ready = value & 1 == 1;
                if value & 1 == 1 {
                    // Only buffers posted from now on belong to the device.
                    if let Err(e) = st.queues[sel].snapshot_last_avail(&*self.mem) {
                        warn!(queue = sel, error = %e, "avail ring unreadable at QueueReady");
                        st.regs.mark_needs_reset();
                    }
                }
            }
            REG_QUEUE_DESC_LOW => {
                st.queues[st.regs.queue_sel as usize].desc_addr = self.checked_queue_addr(st, value);
            }
            REG_QUEUE_DRIVER_LOW => {
                st.queues[st.regs.queue_sel as usize].avail_addr =
                    self.checked_queue_addr(st, value);
            }
            REG_QUEUE_DEVICE_LOW => {
                st.queues[st.regs.queue_sel as usize].used_addr = self.checked_queue_addr(st, value);
            }
            REG_QUEUE_DESC_HIGH | REG_QUEUE_DRIVER_HIGH | REG_QUEUE_DEVICE_HIGH => {
                // 32-bit guest physical space only.
                if value != 0 {
                    st.regs.mark_needs_reset();
                }
            }
            REG_INTERRUPT_ACK => st.regs.interrupt_status &= !value,
            REG_STATUS => {
                if value != 0 {
                    st.regs.status |= value;
                } else {
                    self.reset_device(st);
                }
            }
            _ => {
                if !config_word_write(&mut st.config, offset, value) {
                    return Err(MmioFault::BadOffset { offset });
                }
            }
        }
        Ok(())
    }

    /// Pending interrupt causes, as the platform interrupt controller would
    /// sample them.
    pub fn interrupt_status(&self) -> u32 {
        self.shared.state.lock().unwrap().regs.interrupt_status
    }

    pub fn debug_stream_state(&self, stream_id: u32) -> Option<StreamState> {
        let state = self.shared.state.lock().unwrap();
        state.streams.get(stream_id as usize).map(|s| s.state)
    }

    /// Current guest-playing counter for a stream.
    pub fn debug_guest_playing(&self, stream_id: u32) -> Option<u32> {
        let state = self.shared.state.lock().unwrap();
        state
            .streams
            .get(stream_id as usize)
            .map(|s| s.gate.playing())
    }

    /// `(prod.tail, cons.tail)` of the stream's ring, if one is allocated.
    pub fn debug_ring_counters(&self, stream_id: u32) -> Option<(u32, u32)> {
        let state = self.shared.state.lock().unwrap();
        state
            .streams
            .get(stream_id as usize)?
            .producer
            .as_ref()
            .map(|p| (p.produced_bytes(), p.consumed_bytes()))
    }

    /// Validates a queue structure address: word-aligned and inside RAM.
    /// Failures poison the device and program address zero, like the origin
    /// transport.
    fn checked_queue_addr(&self, st: &mut DeviceState, value: u32) -> u64 {
        let addr = u64::from(value);
        if addr >= self.mem.len() || addr % 4 != 0 {
            warn!(addr, "invalid queue address");
            st.regs.mark_needs_reset();
            return 0;
        }
        addr
    }

    fn reset_device(&self, st: &mut DeviceState) {
        st.regs.reset();
        for q in &mut st.queues {
            q.reset();
        }
        // Swallow TX notifications raised before the reset; the queues they
        // referred to no longer exist.
        self.shared.tx.lock().unwrap().pending = 0;
    }

    fn queue_notify(&mut self, value: u32) {
        match value {
            VIRTIO_SND_QUEUE_CONTROL => self.process_control_queue(),
            VIRTIO_SND_QUEUE_EVENT => {
                // No guest-bound events are defined; nothing to complete.
                debug!("event queue notify ignored");
            }
            VIRTIO_SND_QUEUE_TX => {
                let mut sig = self.shared.tx.lock().unwrap();
                sig.pending += 1;
                self.shared.tx_cond.notify_one();
            }
            _ => {
                warn!(queue = value, "notify for nonexistent queue");
                self.shared.state.lock().unwrap().regs.mark_needs_reset();
            }
        }
    }

    fn process_control_queue(&mut self) {
        let shared = Arc::clone(&self.shared);
        let mem = Arc::clone(&self.mem);
        let mut state = shared.state.lock().unwrap();
        let backend = self.backend.as_mut();
        let sink = &mut self.sink;
        process_queue(
            &mut state,
            &*mem,
            VIRTIO_SND_QUEUE_CONTROL as usize,
            |st, mem, chain| handle_ctrl_chain(st, mem, chain, backend, sink),
        );
    }
}

impl<M: GuestMemory + 'static> Drop for VirtioSnd<M> {
    fn drop(&mut self) {
        {
            let state = self.shared.state.lock().unwrap();
            for stream in &state.streams {
                stream.gate.begin_close();
            }
        }
        // Joins the pull callback before the ring consumer goes away.
        self.sink = None;

        {
            let mut sig = self.shared.tx.lock().unwrap();
            sig.shutdown = true;
        }
        self.shared.tx_cond.notify_all();
        if let Some(thread) = self.tx_thread.take() {
            let _ = thread.join();
        }

        DEVICE_COUNT.fetch_sub(1, Ordering::SeqCst);
    }
}

fn config_word(config: &SndConfig, offset: u64) -> Option<u32> {
    match offset.checked_sub(REG_CONFIG)? {
        0x0 => Some(config.jacks),
        0x4 => Some(config.streams),
        0x8 => Some(config.chmaps),
        0xc => Some(config.controls),
        _ => None,
    }
}

fn config_word_write(config: &mut SndConfig, offset: u64, value: u32) -> bool {
    let Some(rel) = offset.checked_sub(REG_CONFIG) else {
        return false;
    };
    match rel {
        0x0 => config.jacks = value,
        0x4 => config.streams = value,
        0x8 => config.chmaps = value,
        0xc => config.controls = value,
        _ => return false,
    }
    true
}

fn tx_worker<M: GuestMemory>(shared: Arc<SndShared>, mem: Arc<M>) {
    loop {
        {
            let mut sig = shared.tx.lock().unwrap();
            while sig.pending == 0 && !sig.shutdown {
                sig = shared.tx_cond.wait(sig).unwrap();
            }
            if sig.shutdown {
                return;
            }
            sig.pending -= 1;
        }
        let mut state = shared.state.lock().unwrap();
        process_queue(
            &mut state,
            &*mem,
            VIRTIO_SND_QUEUE_TX as usize,
            handle_tx_chain,
        );
    }
}

/// Drains every chain the driver has posted since `last_avail`, posting a
/// used entry per chain. Handler errors and walk errors poison the device;
/// the driver has handed us structurally broken rings at that point.
fn process_queue<M, F>(st: &mut DeviceState, mem: &M, queue_index: usize, mut handler: F)
where
    M: GuestMemory + ?Sized,
    F: FnMut(&mut DeviceState, &M, &DescriptorChain) -> Result<u32, VirtQueueError>,
{
    if st.regs.needs_reset() {
        return;
    }
    if !st.regs.driver_ok() || !st.queues[queue_index].ready {
        warn!(queue = queue_index, "notify before the queue is live");
        st.regs.mark_needs_reset();
        return;
    }

    loop {
        let popped = st.queues[queue_index].pop_chain(mem);
        match popped {
            Ok(None) => break,
            Ok(Some(chain)) => {
                let used_len = match handler(st, mem, &chain) {
                    Ok(len) => len,
                    Err(e) => {
                        warn!(queue = queue_index, error = %e, "request handling failed");
                        st.regs.mark_needs_reset();
                        return;
                    }
                };
                match st.queues[queue_index].add_used(mem, chain.head_index(), used_len) {
                    Ok(true) => st.regs.interrupt_status |= VIRTIO_INT_USED_RING,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(queue = queue_index, error = %e, "used ring unreachable");
                        st.regs.mark_needs_reset();
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(queue = queue_index, error = %e, "descriptor walk failed");
                st.regs.mark_needs_reset();
                return;
            }
        }
    }
}

/// Control chain shape: request header, response header, then an optional
/// device-writable payload descriptor for the info queries.
fn handle_ctrl_chain<M: GuestMemory + ?Sized>(
    st: &mut DeviceState,
    mem: &M,
    chain: &DescriptorChain,
    backend: &mut dyn AudioBackend,
    sink: &mut Option<Box<dyn SinkHandle>>,
) -> Result<u32, VirtQueueError> {
    let descs = chain.descriptors();
    let (Some(req), Some(resp)) = (descs.first(), descs.get(1)) else {
        warn!("control chain without a response descriptor");
        return Ok(0);
    };
    if req.len < 4 || !resp.is_write_only() || resp.len < 4 {
        warn!("malformed control chain");
        return Ok(0);
    }

    let code = read_u32_le(mem, req.addr)?;
    let payload = descs.get(2);
    let (status, plen) = match code {
        VIRTIO_SND_R_JACK_INFO => {
            let total = st.config.jacks;
            handle_query_info(mem, req, payload, total, JACK_INFO_SIZE, encode_jack_info)?
        }
        VIRTIO_SND_R_PCM_INFO => {
            let total = st.config.streams;
            handle_query_info(mem, req, payload, total, PCM_INFO_SIZE, encode_pcm_info)?
        }
        VIRTIO_SND_R_CHMAP_INFO => {
            let total = st.config.chmaps;
            handle_query_info(mem, req, payload, total, CHMAP_INFO_SIZE, encode_chmap_info)?
        }
        VIRTIO_SND_R_PCM_SET_PARAMS => (handle_set_params(st, mem, req)?, 0),
        VIRTIO_SND_R_PCM_PREPARE => (handle_prepare(st, mem, req, backend, sink)?, 0),
        VIRTIO_SND_R_PCM_START => (handle_start(st, mem, req)?, 0),
        VIRTIO_SND_R_PCM_STOP => (handle_stop(st, mem, req)?, 0),
        VIRTIO_SND_R_PCM_RELEASE => (handle_release(st, mem, req, sink)?, 0),
        other => {
            debug!(code = other, "unsupported control request");
            (VIRTIO_SND_S_NOT_SUPP, 0)
        }
    };

    write_u32_le(mem, resp.addr, status)?;
    Ok(plen)
}

struct QueryInfo {
    start_id: u32,
    count: u32,
}

fn parse_query<M: GuestMemory + ?Sized>(
    mem: &M,
    req: &Descriptor,
) -> Result<Option<QueryInfo>, VirtQueueError> {
    if req.len < 16 {
        return Ok(None);
    }
    Ok(Some(QueryInfo {
        start_id: read_u32_le(mem, req.addr + 4)?,
        count: read_u32_le(mem, req.addr + 8)?,
    }))
}

/// Shared shape of the three info queries: bounds-check the id range, check
/// the payload descriptor can hold the whole array, then write one encoded
/// element per id.
fn handle_query_info<M: GuestMemory + ?Sized>(
    mem: &M,
    req: &Descriptor,
    payload: Option<&Descriptor>,
    total: u32,
    elem_size: u32,
    encode: fn(&mut [u8]),
) -> Result<(u32, u32), VirtQueueError> {
    let Some(query) = parse_query(mem, req)? else {
        return Ok((VIRTIO_SND_S_BAD_MSG, 0));
    };
    let in_range = query.count != 0
        && query
            .start_id
            .checked_add(query.count)
            .is_some_and(|end| end <= total);
    if !in_range {
        warn!(
            start_id = query.start_id,
            count = query.count,
            total,
            "info query out of range"
        );
        return Ok((VIRTIO_SND_S_BAD_MSG, 0));
    }
    let Some(needed) = query.count.checked_mul(elem_size) else {
        return Ok((VIRTIO_SND_S_BAD_MSG, 0));
    };
    let fits = payload.is_some_and(|p| p.is_write_only() && p.len >= needed);
    let Some(payload) = payload.filter(|_| fits) else {
        warn!("info query without a large enough payload descriptor");
        return Ok((VIRTIO_SND_S_BAD_MSG, 0));
    };

    let mut elem = vec![0u8; elem_size as usize];
    for i in 0..query.count {
        elem.fill(0);
        encode(&mut elem);
        mem.write(payload.addr + u64::from(i) * u64::from(elem_size), &elem)?;
    }
    Ok((VIRTIO_SND_S_OK, needed))
}

/// One permanently connected jack with no HDA function node.
fn encode_jack_info(elem: &mut [u8]) {
    // hda_fn_nid, features, hda_reg_defconf, hda_reg_caps all zero.
    elem[16] = 1; // connected
}

/// One output stream: S16 only, 44.1kHz only, mono.
fn encode_pcm_info(elem: &mut [u8]) {
    let formats = 1u64 << VIRTIO_SND_PCM_FMT_S16;
    let rates = 1u64 << VIRTIO_SND_PCM_RATE_44100;
    elem[8..16].copy_from_slice(&formats.to_le_bytes());
    elem[16..24].copy_from_slice(&rates.to_le_bytes());
    elem[24] = VIRTIO_SND_D_OUTPUT;
    elem[25] = 1; // channels_min
    elem[26] = 1; // channels_max
}

/// One mono output map.
fn encode_chmap_info(elem: &mut [u8]) {
    elem[4] = VIRTIO_SND_D_OUTPUT;
    elem[5] = 1; // channels
    elem[6] = VIRTIO_SND_CHMAP_MONO; // positions[0]
}

fn stream_mut<'a>(
    st: &'a mut DeviceState,
    stream_id: u32,
    request: &str,
) -> Option<&'a mut PcmStream> {
    let stream = st.streams.get_mut(stream_id as usize);
    if stream.is_none() {
        warn!(stream_id, request, "request for nonexistent stream");
    }
    stream
}

fn handle_set_params<M: GuestMemory + ?Sized>(
    st: &mut DeviceState,
    mem: &M,
    req: &Descriptor,
) -> Result<u32, VirtQueueError> {
    if req.len < 24 {
        return Ok(VIRTIO_SND_S_BAD_MSG);
    }
    let stream_id = read_u32_le(mem, req.addr + 4)?;
    let buffer_bytes = read_u32_le(mem, req.addr + 8)?;
    let period_bytes = read_u32_le(mem, req.addr + 12)?;
    let features = read_u32_le(mem, req.addr + 16)?;
    let mut tail = [0u8; 4];
    mem.read(req.addr + 20, &mut tail)?;
    let [channels, format, rate, _padding] = tail;

    let Some(stream) = stream_mut(st, stream_id, "SET_PARAMS") else {
        return Ok(VIRTIO_SND_S_BAD_MSG);
    };
    match stream.state {
        StreamState::Released | StreamState::ParamsSet | StreamState::Prepared => {}
        state => {
            warn!(stream_id, ?state, "SET_PARAMS in invalid state");
            return Ok(VIRTIO_SND_S_BAD_MSG);
        }
    }

    // The ring requires a power-of-two capacity, and everything else must
    // match what PCM_INFO advertised.
    let frame_bytes = u32::from(channels) * 2;
    let valid = buffer_bytes.is_power_of_two()
        && buffer_bytes <= MAX_RING_BYTES
        && period_bytes > 0
        && period_bytes <= buffer_bytes
        && period_bytes % frame_bytes.max(1) == 0
        && features == 0
        && channels == 1
        && format == VIRTIO_SND_PCM_FMT_S16
        && rate == VIRTIO_SND_PCM_RATE_44100;
    if !valid {
        warn!(
            stream_id,
            buffer_bytes, period_bytes, features, channels, format, rate,
            "SET_PARAMS rejected"
        );
        return Ok(VIRTIO_SND_S_BAD_MSG);
    }

    stream.params = Some(PcmParams {
        buffer_bytes,
        period_bytes,
        features,
        channels,
        format,
        rate,
    });
    stream.state = StreamState::ParamsSet;
    debug!(
        stream_id,
        rate_hz = pcm_rate_hz(rate),
        buffer_bytes,
        period_bytes,
        channels,
        "pcm params set"
    );
    Ok(VIRTIO_SND_S_OK)
}

fn parse_stream_id<M: GuestMemory + ?Sized>(
    mem: &M,
    req: &Descriptor,
) -> Result<Option<u32>, VirtQueueError> {
    if req.len < 8 {
        return Ok(None);
    }
    Ok(Some(read_u32_le(mem, req.addr + 4)?))
}

fn handle_prepare<M: GuestMemory + ?Sized>(
    st: &mut DeviceState,
    mem: &M,
    req: &Descriptor,
    backend: &mut dyn AudioBackend,
    sink: &mut Option<Box<dyn SinkHandle>>,
) -> Result<u32, VirtQueueError> {
    let Some(stream_id) = parse_stream_id(mem, req)? else {
        return Ok(VIRTIO_SND_S_BAD_MSG);
    };
    let Some(stream) = stream_mut(st, stream_id, "PREPARE") else {
        return Ok(VIRTIO_SND_S_BAD_MSG);
    };
    match stream.state {
        StreamState::Released | StreamState::ParamsSet | StreamState::Prepared => {}
        state => {
            warn!(stream_id, ?state, "PREPARE in invalid state");
            return Ok(VIRTIO_SND_S_BAD_MSG);
        }
    }
    let Some(params) = stream.params else {
        warn!(stream_id, "PREPARE before SET_PARAMS");
        return Ok(VIRTIO_SND_S_BAD_MSG);
    };

    // Re-entry: close the previous sink (joining its callback) and free the
    // previous ring before allocating fresh ones.
    if sink.is_some() {
        stream.gate.begin_close();
        *sink = None;
    }
    stream.producer = None;

    let (producer, consumer) = match PcmRingBuffer::with_capacity(params.buffer_bytes) {
        Ok(ring) => ring,
        Err(e) => {
            warn!(stream_id, error = %e, "ring allocation rejected");
            return Ok(VIRTIO_SND_S_BAD_MSG);
        }
    };
    let Some(rate_hz) = pcm_rate_hz(params.rate) else {
        return Ok(VIRTIO_SND_S_BAD_MSG);
    };
    let frames_per_period = params.period_bytes / (u32::from(params.channels) * 2);

    stream.gate.reset();
    let config = SinkConfig {
        name: "aria-virtio-snd".into(),
        sample_rate_hz: rate_hz,
        channels: u16::from(params.channels),
        frames_per_period,
    };
    let pull = make_pull_callback(Arc::clone(&stream.gate), consumer);
    match backend.open(&config, pull) {
        Ok(handle) => {
            *sink = Some(handle);
            stream.producer = Some(producer);
            stream.state = StreamState::Prepared;
            debug!(stream_id, rate_hz, frames_per_period, "stream prepared");
            Ok(VIRTIO_SND_S_OK)
        }
        Err(e) => {
            warn!(stream_id, error = %e, "host sink open failed");
            Ok(VIRTIO_SND_S_IO_ERR)
        }
    }
}

fn handle_start<M: GuestMemory + ?Sized>(
    st: &mut DeviceState,
    mem: &M,
    req: &Descriptor,
) -> Result<u32, VirtQueueError> {
    let Some(stream_id) = parse_stream_id(mem, req)? else {
        return Ok(VIRTIO_SND_S_BAD_MSG);
    };
    let Some(stream) = stream_mut(st, stream_id, "START") else {
        return Ok(VIRTIO_SND_S_BAD_MSG);
    };
    match stream.state {
        StreamState::Prepared | StreamState::Stopped => {}
        state => {
            warn!(stream_id, ?state, "START in invalid state");
            return Ok(VIRTIO_SND_S_BAD_MSG);
        }
    }
    stream.state = StreamState::Started;
    stream.gate.start();
    Ok(VIRTIO_SND_S_OK)
}

fn handle_stop<M: GuestMemory + ?Sized>(
    st: &mut DeviceState,
    mem: &M,
    req: &Descriptor,
) -> Result<u32, VirtQueueError> {
    let Some(stream_id) = parse_stream_id(mem, req)? else {
        return Ok(VIRTIO_SND_S_BAD_MSG);
    };
    let Some(stream) = stream_mut(st, stream_id, "STOP") else {
        return Ok(VIRTIO_SND_S_BAD_MSG);
    };
    if stream.state != StreamState::Started {
        warn!(stream_id, state = ?stream.state, "STOP in invalid state");
        return Ok(VIRTIO_SND_S_BAD_MSG);
    }
    stream.state = StreamState::Stopped;
    stream.gate.stop();
    Ok(VIRTIO_SND_S_OK)
}

fn handle_release<M: GuestMemory + ?Sized>(
    st: &mut DeviceState,
    mem: &M,
    req: &Descriptor,
    sink: &mut Option<Box<dyn SinkHandle>>,
) -> Result<u32, VirtQueueError> {
    let Some(stream_id) = parse_stream_id(mem, req)? else {
        return Ok(VIRTIO_SND_S_BAD_MSG);
    };
    let Some(stream) = stream_mut(st, stream_id, "RELEASE") else {
        return Ok(VIRTIO_SND_S_BAD_MSG);
    };
    match stream.state {
        StreamState::Prepared | StreamState::Stopped => {}
        state => {
            warn!(stream_id, ?state, "RELEASE in invalid state");
            return Ok(VIRTIO_SND_S_BAD_MSG);
        }
    }

    // Close order matters: unpark the callback, join it by closing the sink,
    // and only then free the ring.
    stream.gate.begin_close();
    *sink = None;
    stream.producer = None;
    stream.state = StreamState::Released;
    Ok(VIRTIO_SND_S_OK)
}

fn make_pull_callback(gate: Arc<PlaybackGate>, mut consumer: RingConsumer) -> PullFn {
    let mut scratch: Vec<u8> = Vec::new();
    Box::new(move |out: &mut [i16]| {
        // Parks between STOP and START; zero-filled output while parked or
        // once the stream is being torn down.
        if !gate.wait_playable(out) {
            return;
        }
        scratch.resize(out.len() * 2, 0);
        consumer.dequeue(&mut scratch);
        for (sample, bytes) in out.iter_mut().zip(scratch.chunks_exact(2)) {
            *sample = i16::from_le_bytes([bytes[0], bytes[1]]);
        }
    })
}

/// TX chain shape: transfer header, any number of payload descriptors, then
/// a device-writable status descriptor.
fn handle_tx_chain<M: GuestMemory + ?Sized>(
    st: &mut DeviceState,
    mem: &M,
    chain: &DescriptorChain,
) -> Result<u32, VirtQueueError> {
    let descs = chain.descriptors();
    if descs.len() < 2 {
        warn!("tx chain without a status descriptor");
        return Ok(0);
    }
    let header = &descs[0];
    let status_desc = &descs[descs.len() - 1];
    if !status_desc.is_write_only() || status_desc.len < 4 {
        warn!("tx chain status descriptor unusable");
        return Ok(0);
    }
    let payloads = &descs[1..descs.len() - 1];

    if header.len < 4 {
        return complete_tx(mem, status_desc, VIRTIO_SND_S_BAD_MSG, 0);
    }
    let stream_id = read_u32_le(mem, header.addr)?;

    let total: u64 = payloads.iter().map(|d| u64::from(d.len)).sum();
    let writable_payload = payloads.iter().any(Descriptor::is_write_only);
    let producer = st
        .streams
        .get_mut(stream_id as usize)
        .and_then(|s| s.producer.as_mut());
    let Some(producer) = producer else {
        warn!(stream_id, "tx for a stream with no ring");
        return complete_tx(mem, status_desc, VIRTIO_SND_S_BAD_MSG, 0);
    };
    if writable_payload || total > u64::from(MAX_PCM_XFER_BYTES) {
        warn!(stream_id, total, "tx payload rejected");
        return complete_tx(mem, status_desc, VIRTIO_SND_S_BAD_MSG, 0);
    }

    let mut ret_len = 0u32;
    let mut buf = Vec::new();
    for desc in payloads {
        buf.resize(desc.len as usize, 0);
        mem.read(desc.addr, &mut buf)?;
        producer.enqueue(&buf);
        ret_len += desc.len;
    }

    complete_tx(mem, status_desc, VIRTIO_SND_S_OK, ret_len)
}

/// Writes the PCM status structure, tolerating a short descriptor that only
/// has room for the code.
fn complete_tx<M: GuestMemory + ?Sized>(
    mem: &M,
    status_desc: &Descriptor,
    status: u32,
    latency_bytes: u32,
) -> Result<u32, VirtQueueError> {
    write_u32_le(mem, status_desc.addr, status)?;
    if status_desc.len >= PCM_STATUS_SIZE {
        write_u32_le(mem, status_desc.addr + 4, latency_bytes)?;
        Ok(PCM_STATUS_SIZE)
    } else {
        Ok(4)
    }
}
