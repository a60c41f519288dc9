//! Single-producer / single-consumer PCM byte ring.
//!
//! The guest TX thread stages frames with [`RingProducer::enqueue`]; the host
//! audio callback drains them with [`RingConsumer::dequeue`]. Each end keeps a
//! `head` (reservation) and `tail` (publication) index pair; the tail is
//! published with `Release` ordering after the payload copy and observed by
//! the opposite end with `Acquire`, so payload bytes are visible before the
//! index that covers them. Indices grow monotonically in wrapping u32
//! arithmetic; capacity math uses unsigned subtraction and the power-of-two
//! mask.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Upper bound on ring capacity, matching the transport's ring-size mask.
pub const MAX_RING_BYTES: u32 = 1 << 28;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RingError {
    #[error("ring capacity must be a nonzero power of two, got {0}")]
    CapacityNotPowerOfTwo(u32),
    #[error("ring capacity {0} exceeds the maximum of {max} bytes", max = MAX_RING_BYTES)]
    CapacityTooLarge(u32),
}

/// Cumulative byte counts for writes that found no room and reads that found
/// no data. Not reset by anything short of reallocating the ring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RingTelemetry {
    pub overrun_bytes: u64,
    pub underrun_bytes: u64,
}

struct Shared {
    // `UnsafeCell<u8>` cells rather than one `UnsafeCell<Box<[u8]>>` so both
    // ends can derive raw pointers without ever materialising a `&mut` over
    // the whole buffer.
    buf: Box<[UnsafeCell<u8>]>,
    size: u32,
    mask: u32,
    prod_head: AtomicU32,
    prod_tail: AtomicU32,
    cons_head: AtomicU32,
    cons_tail: AtomicU32,
    overrun_bytes: AtomicU64,
    underrun_bytes: AtomicU64,
}

// SAFETY: the producer only writes bytes in `[prod_head, prod_head + n)` with
// `n` bounded by the free count, the consumer only reads `[cons_head,
// cons_head + m)` with `m` bounded by the published count, and the two ranges
// never overlap while both indices respect the Acquire/Release tail
// publications. The handle types below are not clonable, so each side is
// exclusive.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn data_ptr(&self) -> *mut u8 {
        self.buf.as_ptr() as *mut u8
    }

    /// Copies `src` into the ring starting at logical index `idx`, in one or
    /// two segments depending on wrap.
    unsafe fn copy_in(&self, idx: u32, src: &[u8]) {
        let idx = idx as usize;
        let size = self.size as usize;
        let n = src.len();
        if idx + n <= size {
            ptr::copy_nonoverlapping(src.as_ptr(), self.data_ptr().add(idx), n);
        } else {
            let first = size - idx;
            ptr::copy_nonoverlapping(src.as_ptr(), self.data_ptr().add(idx), first);
            ptr::copy_nonoverlapping(src.as_ptr().add(first), self.data_ptr(), n - first);
        }
    }

    unsafe fn copy_out(&self, idx: u32, dst: &mut [u8]) {
        let idx = idx as usize;
        let size = self.size as usize;
        let n = dst.len();
        if idx + n <= size {
            ptr::copy_nonoverlapping(self.data_ptr().add(idx), dst.as_mut_ptr(), n);
        } else {
            let first = size - idx;
            ptr::copy_nonoverlapping(self.data_ptr().add(idx), dst.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(self.data_ptr(), dst.as_mut_ptr().add(first), n - first);
        }
    }
}

pub struct PcmRingBuffer;

impl PcmRingBuffer {
    /// Allocates a zeroed ring of exactly `capacity` bytes and returns the
    /// two ends. `capacity` must be a nonzero power of two no larger than
    /// [`MAX_RING_BYTES`]; one byte of capacity is kept in reserve to
    /// distinguish full from empty.
    pub fn with_capacity(capacity: u32) -> Result<(RingProducer, RingConsumer), RingError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(RingError::CapacityNotPowerOfTwo(capacity));
        }
        if capacity > MAX_RING_BYTES {
            return Err(RingError::CapacityTooLarge(capacity));
        }
        let buf = (0..capacity).map(|_| UnsafeCell::new(0u8)).collect();
        let shared = Arc::new(Shared {
            buf,
            size: capacity,
            mask: capacity - 1,
            prod_head: AtomicU32::new(0),
            prod_tail: AtomicU32::new(0),
            cons_head: AtomicU32::new(0),
            cons_tail: AtomicU32::new(0),
            overrun_bytes: AtomicU64::new(0),
            underrun_bytes: AtomicU64::new(0),
        });
        Ok((
            RingProducer {
                shared: shared.clone(),
            },
            RingConsumer { shared },
        ))
    }
}

/// Write end. Owned by the guest TX path.
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Stages `payload` for the consumer, returning the number of bytes
    /// actually written. When the payload exceeds the free space the excess
    /// is dropped and counted as overrun; previously staged bytes are never
    /// overwritten.
    pub fn enqueue(&mut self, payload: &[u8]) -> usize {
        let s = &*self.shared;
        let prod_head = s.prod_head.load(Ordering::Relaxed);
        let cons_tail = s.cons_tail.load(Ordering::Acquire);
        let free = s.mask.wrapping_add(cons_tail).wrapping_sub(prod_head);
        let wanted = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        let n = wanted.min(free);
        if wanted > free {
            let dropped = payload.len() as u64 - u64::from(n);
            s.overrun_bytes.fetch_add(dropped, Ordering::Relaxed);
            warn!(dropped, free, "pcm ring overrun, dropping newest bytes");
        }
        let next = prod_head.wrapping_add(n);
        s.prod_head.store(next, Ordering::Relaxed);
        // SAFETY: `n <= free`, so the target range holds no unconsumed bytes.
        unsafe { s.copy_in(prod_head & s.mask, &payload[..n as usize]) };
        s.prod_tail.store(next, Ordering::Release);
        n as usize
    }

    /// Total bytes ever published, i.e. `prod.tail`.
    pub fn produced_bytes(&self) -> u32 {
        self.shared.prod_tail.load(Ordering::Relaxed)
    }

    /// Total bytes the consumer has drained, i.e. `cons.tail`. The device
    /// reports staged-minus-drained as its latency estimate.
    pub fn consumed_bytes(&self) -> u32 {
        self.shared.cons_tail.load(Ordering::Acquire)
    }

    pub fn free_bytes(&self) -> u32 {
        let s = &*self.shared;
        s.mask
            .wrapping_add(s.cons_tail.load(Ordering::Acquire))
            .wrapping_sub(s.prod_head.load(Ordering::Relaxed))
    }

    pub fn capacity(&self) -> u32 {
        self.shared.size
    }

    pub fn telemetry(&self) -> RingTelemetry {
        telemetry(&self.shared)
    }
}

/// Read end. Owned by the host audio callback.
pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl RingConsumer {
    /// Fills `out` from the ring, returning the number of real bytes copied.
    /// When fewer bytes are staged than requested the deficit is zero-filled
    /// and counted as underrun.
    pub fn dequeue(&mut self, out: &mut [u8]) -> usize {
        let s = &*self.shared;
        let cons_head = s.cons_head.load(Ordering::Relaxed);
        let prod_tail = s.prod_tail.load(Ordering::Acquire);
        let entries = prod_tail.wrapping_sub(cons_head);
        let wanted = u32::try_from(out.len()).unwrap_or(u32::MAX);
        let n = wanted.min(entries);
        if wanted > entries {
            let deficit = out.len() as u64 - u64::from(n);
            s.underrun_bytes.fetch_add(deficit, Ordering::Relaxed);
            warn!(deficit, entries, "pcm ring underrun, zero-filling");
            out[n as usize..].fill(0);
        }
        let next = cons_head.wrapping_add(n);
        s.cons_head.store(next, Ordering::Relaxed);
        // SAFETY: `n <= entries`, so the source range is fully published.
        unsafe { s.copy_out(cons_head & s.mask, &mut out[..n as usize]) };
        s.cons_tail.store(next, Ordering::Release);
        n as usize
    }

    /// Bytes currently staged and readable.
    pub fn available_bytes(&self) -> u32 {
        let s = &*self.shared;
        s.prod_tail
            .load(Ordering::Acquire)
            .wrapping_sub(s.cons_head.load(Ordering::Relaxed))
    }

    /// Total bytes ever consumed, i.e. `cons.tail`.
    pub fn consumed_bytes(&self) -> u32 {
        self.shared.cons_tail.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> u32 {
        self.shared.size
    }

    pub fn telemetry(&self) -> RingTelemetry {
        telemetry(&self.shared)
    }
}

fn telemetry(shared: &Shared) -> RingTelemetry {
    RingTelemetry {
        overrun_bytes: shared.overrun_bytes.load(Ordering::Relaxed),
        underrun_bytes: shared.underrun_bytes.load(Ordering::Relaxed),
    }
}
