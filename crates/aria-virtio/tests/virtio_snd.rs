use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use aria_audio::sink::{AudioBackend, AudioError, PullFn, SinkConfig, SinkHandle};
use aria_virtio::devices::snd::{
    StreamState, VirtioSnd, JACK_INFO_SIZE, VIRTIO_SND_QUEUE_CONTROL, VIRTIO_SND_QUEUE_TX,
    VIRTIO_SND_R_CHMAP_INFO, VIRTIO_SND_R_JACK_INFO, VIRTIO_SND_R_PCM_INFO,
    VIRTIO_SND_R_PCM_PREPARE, VIRTIO_SND_R_PCM_RELEASE, VIRTIO_SND_R_PCM_SET_PARAMS,
    VIRTIO_SND_R_PCM_START, VIRTIO_SND_R_PCM_STOP, VIRTIO_SND_S_NOT_SUPP, VIRTIO_SND_S_OK,
    VIRTIO_SND_PCM_FMT_S16, VIRTIO_SND_PCM_RATE_44100,
};
use aria_virtio::memory::{read_u16_le, read_u32_le, read_u64_le, write_u16_le, write_u32_le, write_u64_le, GuestMemory, GuestRam};
use aria_virtio::mmio::{
    AccessWidth, REG_DEVICE_FEATURES, REG_DEVICE_FEATURES_SEL, REG_DEVICE_ID, REG_DRIVER_FEATURES,
    REG_DRIVER_FEATURES_SEL, REG_INTERRUPT_ACK, REG_INTERRUPT_STATUS, REG_MAGIC_VALUE,
    REG_QUEUE_DESC_HIGH, REG_QUEUE_DESC_LOW, REG_QUEUE_DEVICE_HIGH, REG_QUEUE_DEVICE_LOW,
    REG_QUEUE_DRIVER_HIGH, REG_QUEUE_DRIVER_LOW, REG_QUEUE_NOTIFY, REG_QUEUE_NUM, REG_QUEUE_READY,
    REG_QUEUE_SEL, REG_STATUS, REG_VERSION, VIRTIO_INT_USED_RING, VIRTIO_STATUS_ACKNOWLEDGE,
    VIRTIO_STATUS_DRIVER, VIRTIO_STATUS_DRIVER_OK, VIRTIO_STATUS_FEATURES_OK,
};
use aria_virtio::queue::{VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};

fn device_serial() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Backend that records sink configs and hands the pull callback to the
/// test.
#[derive(Clone, Default)]
struct TestBackend {
    configs: Arc<Mutex<Vec<SinkConfig>>>,
    pull: Arc<Mutex<Option<PullFn>>>,
}

impl TestBackend {
    fn take_pull(&self) -> PullFn {
        self.pull.lock().unwrap().take().expect("sink is not open")
    }

    fn sink_open(&self) -> bool {
        self.pull.lock().unwrap().is_some()
    }
}

struct TestSink {
    pull: Arc<Mutex<Option<PullFn>>>,
}

impl SinkHandle for TestSink {}

impl Drop for TestSink {
    fn drop(&mut self) {
        self.pull.lock().unwrap().take();
    }
}

impl AudioBackend for TestBackend {
    fn open(&mut self, config: &SinkConfig, pull: PullFn) -> Result<Box<dyn SinkHandle>, AudioError> {
        self.configs.lock().unwrap().push(config.clone());
        *self.pull.lock().unwrap() = Some(pull);
        Ok(Box::new(TestSink {
            pull: Arc::clone(&self.pull),
        }))
    }
}

const CTRL_DESC: u64 = 0x1000;
const CTRL_AVAIL: u64 = 0x2000;
const CTRL_USED: u64 = 0x3000;
const TX_DESC: u64 = 0x4000;
const TX_AVAIL: u64 = 0x5000;
const TX_USED: u64 = 0x6000;
const CTRL_REQ: u64 = 0x7000;
const CTRL_RESP: u64 = 0x7100;
const CTRL_PAYLOAD: u64 = 0x7200;
const TX_HDR: u64 = 0x8000;
const TX_PAYLOAD: u64 = 0x8100;
const TX_STATUS: u64 = 0x9000;

fn load(dev: &VirtioSnd<GuestRam>, offset: u64) -> u32 {
    dev.mmio_load(offset, AccessWidth::U32).unwrap()
}

fn store(dev: &mut VirtioSnd<GuestRam>, offset: u64, value: u32) {
    dev.mmio_store(offset, AccessWidth::U32, value).unwrap();
}

fn negotiate(dev: &mut VirtioSnd<GuestRam>) {
    store(dev, REG_STATUS, VIRTIO_STATUS_ACKNOWLEDGE);
    store(dev, REG_STATUS, VIRTIO_STATUS_ACKNOWLEDGE | VIRTIO_STATUS_DRIVER);

    store(dev, REG_DEVICE_FEATURES_SEL, 0);
    let f0 = load(dev, REG_DEVICE_FEATURES);
    store(dev, REG_DRIVER_FEATURES_SEL, 0);
    store(dev, REG_DRIVER_FEATURES, f0);
    store(dev, REG_DEVICE_FEATURES_SEL, 1);
    let _f1 = load(dev, REG_DEVICE_FEATURES);

    store(
        dev,
        REG_STATUS,
        VIRTIO_STATUS_ACKNOWLEDGE | VIRTIO_STATUS_DRIVER | VIRTIO_STATUS_FEATURES_OK,
    );
    store(
        dev,
        REG_STATUS,
        VIRTIO_STATUS_ACKNOWLEDGE
            | VIRTIO_STATUS_DRIVER
            | VIRTIO_STATUS_FEATURES_OK
            | VIRTIO_STATUS_DRIVER_OK,
    );
}

fn write_desc(mem: &GuestRam, table: u64, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
    let base = table + u64::from(index) * 16;
    write_u64_le(mem, base, addr).unwrap();
    write_u32_le(mem, base + 8, len).unwrap();
    write_u16_le(mem, base + 12, flags).unwrap();
    write_u16_le(mem, base + 14, next).unwrap();
}

fn configure_queue(
    dev: &mut VirtioSnd<GuestRam>,
    mem: &GuestRam,
    queue: u32,
    desc: u64,
    avail: u64,
    used: u64,
) {
    write_u16_le(mem, avail, 0).unwrap();
    write_u16_le(mem, avail + 2, 0).unwrap();
    write_u16_le(mem, used, 0).unwrap();
    write_u16_le(mem, used + 2, 0).unwrap();

    store(dev, REG_QUEUE_SEL, queue);
    store(dev, REG_QUEUE_NUM, 64);
    store(dev, REG_QUEUE_DESC_LOW, desc as u32);
    store(dev, REG_QUEUE_DESC_HIGH, 0);
    store(dev, REG_QUEUE_DRIVER_LOW, avail as u32);
    store(dev, REG_QUEUE_DRIVER_HIGH, 0);
    store(dev, REG_QUEUE_DEVICE_LOW, used as u32);
    store(dev, REG_QUEUE_DEVICE_HIGH, 0);
    store(dev, REG_QUEUE_READY, 1);
}

/// Submits a control chain (request, response, optional payload descriptor)
/// and returns the response status code. Control chains complete inline.
fn submit_ctrl(
    dev: &mut VirtioSnd<GuestRam>,
    mem: &GuestRam,
    req: &[u8],
    payload_len: Option<u32>,
    avail_idx: &mut u16,
) -> u32 {
    mem.write(CTRL_REQ, req).unwrap();
    mem.write(CTRL_RESP, &[0xffu8; 4]).unwrap();
    write_desc(mem, CTRL_DESC, 0, CTRL_REQ, req.len() as u32, VIRTQ_DESC_F_NEXT, 1);
    match payload_len {
        Some(len) => {
            write_desc(
                mem,
                CTRL_DESC,
                1,
                CTRL_RESP,
                64,
                VIRTQ_DESC_F_WRITE | VIRTQ_DESC_F_NEXT,
                2,
            );
            write_desc(mem, CTRL_DESC, 2, CTRL_PAYLOAD, len, VIRTQ_DESC_F_WRITE, 0);
        }
        None => {
            write_desc(mem, CTRL_DESC, 1, CTRL_RESP, 64, VIRTQ_DESC_F_WRITE, 0);
        }
    }

    let slot = *avail_idx % 64;
    write_u16_le(mem, CTRL_AVAIL + 4 + u64::from(slot) * 2, 0).unwrap();
    write_u16_le(mem, CTRL_AVAIL + 2, avail_idx.wrapping_add(1)).unwrap();
    *avail_idx = avail_idx.wrapping_add(1);

    store(dev, REG_QUEUE_NOTIFY, VIRTIO_SND_QUEUE_CONTROL);
    read_u32_le(mem, CTRL_RESP).unwrap()
}

fn query_req(code: u32, start_id: u32, count: u32, size: u32) -> Vec<u8> {
    let mut req = Vec::new();
    req.extend_from_slice(&code.to_le_bytes());
    req.extend_from_slice(&start_id.to_le_bytes());
    req.extend_from_slice(&count.to_le_bytes());
    req.extend_from_slice(&size.to_le_bytes());
    req
}

fn lifecycle_req(code: u32, stream_id: u32) -> Vec<u8> {
    [code.to_le_bytes(), stream_id.to_le_bytes()].concat()
}

fn set_params_req(stream_id: u32, buffer_bytes: u32, period_bytes: u32) -> Vec<u8> {
    let mut req = Vec::new();
    req.extend_from_slice(&VIRTIO_SND_R_PCM_SET_PARAMS.to_le_bytes());
    req.extend_from_slice(&stream_id.to_le_bytes());
    req.extend_from_slice(&buffer_bytes.to_le_bytes());
    req.extend_from_slice(&period_bytes.to_le_bytes());
    req.extend_from_slice(&0u32.to_le_bytes()); // features
    req.push(1); // channels
    req.push(VIRTIO_SND_PCM_FMT_S16);
    req.push(VIRTIO_SND_PCM_RATE_44100);
    req.push(0); // padding
    req
}

/// Submits a TX chain (header, one payload descriptor, status) and waits for
/// the producer thread to publish the used entry.
fn submit_tx(
    dev: &mut VirtioSnd<GuestRam>,
    mem: &GuestRam,
    stream_id: u32,
    payload: &[u8],
    avail_idx: &mut u16,
) {
    let mut hdr = Vec::new();
    hdr.extend_from_slice(&stream_id.to_le_bytes());
    hdr.extend_from_slice(&0u32.to_le_bytes()); // reserved
    mem.write(TX_HDR, &hdr).unwrap();
    mem.write(TX_PAYLOAD, payload).unwrap();
    mem.write(TX_STATUS, &[0xffu8; 8]).unwrap();

    write_desc(mem, TX_DESC, 0, TX_HDR, 8, VIRTQ_DESC_F_NEXT, 1);
    write_desc(
        mem,
        TX_DESC,
        1,
        TX_PAYLOAD,
        payload.len() as u32,
        VIRTQ_DESC_F_NEXT,
        2,
    );
    write_desc(mem, TX_DESC, 2, TX_STATUS, 8, VIRTQ_DESC_F_WRITE, 0);

    let slot = *avail_idx % 64;
    write_u16_le(mem, TX_AVAIL + 4 + u64::from(slot) * 2, 0).unwrap();
    write_u16_le(mem, TX_AVAIL + 2, avail_idx.wrapping_add(1)).unwrap();
    *avail_idx = avail_idx.wrapping_add(1);

    store(dev, REG_QUEUE_NOTIFY, VIRTIO_SND_QUEUE_TX);
    wait_tx_used(mem, *avail_idx);
}

fn wait_tx_used(mem: &GuestRam, want: u16) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while read_u16_le(mem, TX_USED + 2).unwrap() != want {
        assert!(Instant::now() < deadline, "TX completion timed out");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn identity_probe_reads_sound_device() {
    let _serial = device_serial();
    let mem = Arc::new(GuestRam::new(0x20000));
    let dev = VirtioSnd::new(Arc::clone(&mem), Box::new(TestBackend::default())).unwrap();

    assert_eq!(load(&dev, REG_MAGIC_VALUE), 0x7472_6976);
    assert_eq!(load(&dev, REG_VERSION), 2);
    assert_eq!(load(&dev, REG_DEVICE_ID), 25);
}

#[test]
fn info_queries_describe_the_fixed_topology() {
    let _serial = device_serial();
    let mem = Arc::new(GuestRam::new(0x20000));
    let mut dev = VirtioSnd::new(Arc::clone(&mem), Box::new(TestBackend::default())).unwrap();
    negotiate(&mut dev);
    configure_queue(
        &mut dev,
        &mem,
        VIRTIO_SND_QUEUE_CONTROL,
        CTRL_DESC,
        CTRL_AVAIL,
        CTRL_USED,
    );
    let mut avail_idx = 0u16;

    // Jack 0: permanently connected, no HDA registers.
    mem.write(CTRL_PAYLOAD, &[0xffu8; 64]).unwrap();
    let status = submit_ctrl(
        &mut dev,
        &mem,
        &query_req(VIRTIO_SND_R_JACK_INFO, 0, 1, JACK_INFO_SIZE),
        Some(64),
        &mut avail_idx,
    );
    assert_eq!(status, VIRTIO_SND_S_OK);
    let jack = mem.to_vec(CTRL_PAYLOAD, 24).unwrap();
    assert!(jack[..16].iter().all(|&b| b == 0));
    assert_eq!(jack[16], 1); // connected
    assert!(jack[17..].iter().all(|&b| b == 0));

    // The used entry reports the payload bytes written.
    assert_eq!(read_u16_le(&*mem, CTRL_USED + 2).unwrap(), 1);
    assert_eq!(read_u32_le(&*mem, CTRL_USED + 8).unwrap(), JACK_INFO_SIZE);
    assert_ne!(load(&dev, REG_INTERRUPT_STATUS) & VIRTIO_INT_USED_RING, 0);
    store(&mut dev, REG_INTERRUPT_ACK, VIRTIO_INT_USED_RING);

    // Stream 0: S16 / 44.1kHz / mono output.
    mem.write(CTRL_PAYLOAD, &[0xffu8; 64]).unwrap();
    let status = submit_ctrl(
        &mut dev,
        &mem,
        &query_req(VIRTIO_SND_R_PCM_INFO, 0, 1, 32),
        Some(64),
        &mut avail_idx,
    );
    assert_eq!(status, VIRTIO_SND_S_OK);
    assert_eq!(read_u64_le(&*mem, CTRL_PAYLOAD + 8).unwrap(), 1 << 5); // S16
    assert_eq!(read_u64_le(&*mem, CTRL_PAYLOAD + 16).unwrap(), 1 << 6); // 44100
    let tail = mem.to_vec(CTRL_PAYLOAD + 24, 3).unwrap();
    assert_eq!(tail, vec![0, 1, 1]); // output, channels_min, channels_max

    // Channel map 0: one mono position.
    mem.write(CTRL_PAYLOAD, &[0xffu8; 64]).unwrap();
    let status = submit_ctrl(
        &mut dev,
        &mem,
        &query_req(VIRTIO_SND_R_CHMAP_INFO, 0, 1, 24),
        Some(64),
        &mut avail_idx,
    );
    assert_eq!(status, VIRTIO_SND_S_OK);
    let chmap = mem.to_vec(CTRL_PAYLOAD, 24).unwrap();
    assert_eq!(chmap[4], 0); // output
    assert_eq!(chmap[5], 1); // channels
    assert_eq!(chmap[6], 2); // MONO
    assert!(chmap[7..].iter().all(|&b| b == 0));
}

#[test]
fn playback_path_moves_guest_frames_to_the_callback() {
    let _serial = device_serial();
    let backend = TestBackend::default();
    let mem = Arc::new(GuestRam::new(0x20000));
    let mut dev = VirtioSnd::new(Arc::clone(&mem), Box::new(backend.clone())).unwrap();
    negotiate(&mut dev);
    configure_queue(
        &mut dev,
        &mem,
        VIRTIO_SND_QUEUE_CONTROL,
        CTRL_DESC,
        CTRL_AVAIL,
        CTRL_USED,
    );
    configure_queue(&mut dev, &mem, VIRTIO_SND_QUEUE_TX, TX_DESC, TX_AVAIL, TX_USED);
    let mut ctrl_idx = 0u16;
    let mut tx_idx = 0u16;

    // SET_PARAMS -> PREPARE -> START.
    let status = submit_ctrl(&mut dev, &mem, &set_params_req(0, 4096, 1024), None, &mut ctrl_idx);
    assert_eq!(status, VIRTIO_SND_S_OK);
    assert_eq!(dev.debug_stream_state(0), Some(StreamState::ParamsSet));

    let status = submit_ctrl(
        &mut dev,
        &mem,
        &lifecycle_req(VIRTIO_SND_R_PCM_PREPARE, 0),
        None,
        &mut ctrl_idx,
    );
    assert_eq!(status, VIRTIO_SND_S_OK);
    assert_eq!(dev.debug_stream_state(0), Some(StreamState::Prepared));
    assert_eq!(dev.debug_ring_counters(0), Some((0, 0)));
    {
        let configs = backend.configs.lock().unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].sample_rate_hz, 44_100);
        assert_eq!(configs[0].channels, 1);
        assert_eq!(configs[0].frames_per_period, 512);
    }

    let status = submit_ctrl(
        &mut dev,
        &mem,
        &lifecycle_req(VIRTIO_SND_R_PCM_START, 0),
        None,
        &mut ctrl_idx,
    );
    assert_eq!(status, VIRTIO_SND_S_OK);
    assert_eq!(dev.debug_stream_state(0), Some(StreamState::Started));
    assert_eq!(dev.debug_guest_playing(0), Some(1));

    // Guest pushes 32 payload bytes through the TX queue.
    let payload: Vec<u8> = (1..=32).collect();
    submit_tx(&mut dev, &mem, 0, &payload, &mut tx_idx);

    let status_bytes = mem.to_vec(TX_STATUS, 8).unwrap();
    assert_eq!(
        u32::from_le_bytes(status_bytes[0..4].try_into().unwrap()),
        VIRTIO_SND_S_OK
    );
    assert_eq!(
        u32::from_le_bytes(status_bytes[4..8].try_into().unwrap()),
        32
    );
    assert_eq!(read_u32_le(&*mem, TX_USED + 8).unwrap(), 8); // sizeof(status)
    assert_eq!(dev.debug_ring_counters(0), Some((32, 0)));

    // Host pulls one period of 16 mono frames; the first 32 bytes are the
    // guest payload verbatim.
    let mut pull = backend.take_pull();
    let mut out = [0i16; 16];
    pull(&mut out);
    for (i, sample) in out.iter().enumerate() {
        let expect = i16::from_le_bytes([payload[i * 2], payload[i * 2 + 1]]);
        assert_eq!(*sample, expect);
    }
    assert_eq!(dev.debug_ring_counters(0), Some((32, 32)));

    // STOP and RELEASE wind the stream down and close the sink.
    let status = submit_ctrl(
        &mut dev,
        &mem,
        &lifecycle_req(VIRTIO_SND_R_PCM_STOP, 0),
        None,
        &mut ctrl_idx,
    );
    assert_eq!(status, VIRTIO_SND_S_OK);
    assert_eq!(dev.debug_guest_playing(0), Some(0));

    let status = submit_ctrl(
        &mut dev,
        &mem,
        &lifecycle_req(VIRTIO_SND_R_PCM_RELEASE, 0),
        None,
        &mut ctrl_idx,
    );
    assert_eq!(status, VIRTIO_SND_S_OK);
    assert_eq!(dev.debug_stream_state(0), Some(StreamState::Released));
    assert_eq!(dev.debug_ring_counters(0), None);
    assert!(!backend.sink_open());

    // A released pull callback returns silence instead of blocking.
    let mut out = [0x55i16; 4];
    pull(&mut out);
    assert_eq!(out, [0i16; 4]);
}

#[test]
fn unsupported_request_code_returns_not_supp() {
    let _serial = device_serial();
    let mem = Arc::new(GuestRam::new(0x20000));
    let mut dev = VirtioSnd::new(Arc::clone(&mem), Box::new(TestBackend::default())).unwrap();
    negotiate(&mut dev);
    configure_queue(
        &mut dev,
        &mem,
        VIRTIO_SND_QUEUE_CONTROL,
        CTRL_DESC,
        CTRL_AVAIL,
        CTRL_USED,
    );
    let mut avail_idx = 0u16;

    let status = submit_ctrl(&mut dev, &mem, &lifecycle_req(0x4242, 0), None, &mut avail_idx);
    assert_eq!(status, VIRTIO_SND_S_NOT_SUPP);
    // No state change.
    assert_eq!(dev.debug_stream_state(0), Some(StreamState::Released));
}
