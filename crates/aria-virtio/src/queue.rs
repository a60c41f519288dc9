//! Split-virtqueue walker.
//!
//! A virtqueue is three guest-allocated structures: the descriptor table,
//! the avail ring (driver to device) and the used ring (device to driver).
//! The device tracks how far it has consumed the avail ring in `last_avail`
//! and publishes completions by appending to the used ring.

use crate::memory::{read_u16_le, read_u32_le, read_u64_le, write_u16_le, write_u32_le, GuestMemory, GuestMemoryError};

/// Buffer continues in the descriptor named by `next`.
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
/// Buffer is device write-only (otherwise device read-only).
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

/// Driver does not want a used-buffer interrupt.
pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Largest queue size the device accepts (`QueueNumMax`).
pub const QUEUE_NUM_MAX: u16 = 1024;

const DESC_SIZE: u64 = 16;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum VirtQueueError {
    #[error(transparent)]
    GuestMemory(#[from] GuestMemoryError),
    #[error("descriptor buffer {addr:#x}+{len} is outside guest memory")]
    DescriptorOutOfRange { addr: u64, len: u32 },
    #[error("descriptor buffer address {addr:#x} is not 4-byte aligned")]
    MisalignedDescriptor { addr: u64 },
    #[error("descriptor index {index} out of range for queue size {size}")]
    BadDescriptorIndex { index: u16, size: u16 },
    #[error("avail ring advanced {advanced} entries, queue size is {size}")]
    AvailIndexOverrun { advanced: u16, size: u16 },
    #[error("descriptor chain exceeds queue size {size}")]
    ChainTooLong { size: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }
}

/// One logical request popped from the avail ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorChain {
    head_index: u16,
    descriptors: Vec<Descriptor>,
}

impl DescriptorChain {
    pub fn head_index(&self) -> u16 {
        self.head_index
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }
}

/// Device-side state for one virtqueue. Ring addresses are programmed
/// through the MMIO register file and pre-validated there; descriptor buffer
/// addresses are validated during the walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtQueue {
    /// Queue size as programmed via `QueueNum` (0 until the driver sets it).
    pub size: u16,
    pub ready: bool,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
    /// Next avail-ring entry to consume.
    pub last_avail: u16,
}

impl VirtQueue {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Current avail-ring producer index, as published by the driver.
    pub fn avail_idx<M: GuestMemory + ?Sized>(&self, mem: &M) -> Result<u16, VirtQueueError> {
        Ok(read_u16_le(mem, self.avail_addr.wrapping_add(2))?)
    }

    /// Records the driver's current avail index so only buffers posted from
    /// now on are processed. Called when the queue is marked ready.
    pub fn snapshot_last_avail<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &M,
    ) -> Result<(), VirtQueueError> {
        self.last_avail = self.avail_idx(mem)?;
        Ok(())
    }

    /// Pops the next pending descriptor chain, or `None` when the device has
    /// caught up with the driver.
    pub fn pop_chain<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &M,
    ) -> Result<Option<DescriptorChain>, VirtQueueError> {
        let avail = self.avail_idx(mem)?;
        let advanced = avail.wrapping_sub(self.last_avail);
        if advanced == 0 {
            return Ok(None);
        }
        if self.size == 0 || advanced > self.size {
            return Err(VirtQueueError::AvailIndexOverrun {
                advanced,
                size: self.size,
            });
        }

        let slot = self.last_avail % self.size;
        let head_index = read_u16_le(mem, self.avail_addr.wrapping_add(4 + u64::from(slot) * 2))?;

        let mut descriptors = Vec::new();
        let mut index = head_index;
        loop {
            if index >= self.size {
                return Err(VirtQueueError::BadDescriptorIndex {
                    index,
                    size: self.size,
                });
            }
            let base = self
                .desc_addr
                .checked_add(u64::from(index) * DESC_SIZE)
                .ok_or(GuestMemoryError::OutOfBounds {
                    addr: self.desc_addr,
                    len: DESC_SIZE,
                })?;
            let desc = Descriptor {
                addr: read_u64_le(mem, base)?,
                len: read_u32_le(mem, base.wrapping_add(8))?,
                flags: read_u16_le(mem, base.wrapping_add(12))?,
                next: read_u16_le(mem, base.wrapping_add(14))?,
            };
            if desc.addr % 4 != 0 {
                return Err(VirtQueueError::MisalignedDescriptor { addr: desc.addr });
            }
            let in_range = desc
                .addr
                .checked_add(u64::from(desc.len))
                .is_some_and(|end| end <= mem.len());
            if !in_range {
                return Err(VirtQueueError::DescriptorOutOfRange {
                    addr: desc.addr,
                    len: desc.len,
                });
            }
            let has_next = desc.has_next();
            let next = desc.next;
            descriptors.push(desc);
            if descriptors.len() > usize::from(self.size) {
                return Err(VirtQueueError::ChainTooLong { size: self.size });
            }
            if !has_next {
                break;
            }
            index = next;
        }

        self.last_avail = self.last_avail.wrapping_add(1);
        Ok(Some(DescriptorChain {
            head_index,
            descriptors,
        }))
    }

    /// Publishes a completion for the chain headed by `head`, returning
    /// whether the driver wants a used-buffer interrupt.
    pub fn add_used<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &M,
        head: u16,
        len: u32,
    ) -> Result<bool, VirtQueueError> {
        if self.size == 0 {
            return Err(VirtQueueError::AvailIndexOverrun {
                advanced: 0,
                size: 0,
            });
        }
        let idx = read_u16_le(mem, self.used_addr.wrapping_add(2))?;
        let elem = self
            .used_addr
            .wrapping_add(4 + u64::from(idx % self.size) * 8);
        write_u32_le(mem, elem, u32::from(head))?;
        write_u32_le(mem, elem.wrapping_add(4), len)?;
        write_u16_le(mem, self.used_addr.wrapping_add(2), idx.wrapping_add(1))?;

        let avail_flags = read_u16_le(mem, self.avail_addr)?;
        Ok(avail_flags & VIRTQ_AVAIL_F_NO_INTERRUPT == 0)
    }
}
