//! Guest physical memory window.
//!
//! The device sees RAM as a flat byte window it DMAs into: descriptor
//! tables, avail/used rings and PCM payloads all live here. The TX producer
//! thread walks it concurrently with the hart, so accessors take `&self` and
//! the canonical [`GuestRam`] stores byte-atomic cells — the same guarantee a
//! real bus master gets.

use std::ops::Range;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum GuestMemoryError {
    #[error("guest memory access out of bounds: {len} bytes at {addr:#x}")]
    OutOfBounds { addr: u64, len: u64 },
}

pub trait GuestMemory: Send + Sync {
    /// Size of the RAM window in bytes.
    fn len(&self) -> u64;

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), GuestMemoryError>;

    fn write(&self, addr: u64, buf: &[u8]) -> Result<(), GuestMemoryError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct GuestRam {
    cells: Box<[AtomicU8]>,
}

impl GuestRam {
    /// Allocates a zeroed RAM window of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    fn range(&self, addr: u64, len: u64) -> Result<Range<usize>, GuestMemoryError> {
        let end = addr
            .checked_add(len)
            .filter(|&end| end <= self.cells.len() as u64)
            .ok_or(GuestMemoryError::OutOfBounds { addr, len })?;
        Ok(addr as usize..end as usize)
    }

    /// Copies `len` bytes out into a fresh buffer. Test convenience.
    pub fn to_vec(&self, addr: u64, len: usize) -> Result<Vec<u8>, GuestMemoryError> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }
}

impl GuestMemory for GuestRam {
    fn len(&self) -> u64 {
        self.cells.len() as u64
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), GuestMemoryError> {
        let range = self.range(addr, buf.len() as u64)?;
        for (dst, cell) in buf.iter_mut().zip(&self.cells[range]) {
            *dst = cell.load(Ordering::Relaxed);
        }
        Ok(())
    }

    fn write(&self, addr: u64, buf: &[u8]) -> Result<(), GuestMemoryError> {
        let range = self.range(addr, buf.len() as u64)?;
        for (cell, src) in self.cells[range].iter().zip(buf) {
            cell.store(*src, Ordering::Relaxed);
        }
        Ok(())
    }
}

pub fn read_u16_le<M: GuestMemory + ?Sized>(mem: &M, addr: u64) -> Result<u16, GuestMemoryError> {
    let mut buf = [0u8; 2];
    mem.read(addr, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub fn read_u32_le<M: GuestMemory + ?Sized>(mem: &M, addr: u64) -> Result<u32, GuestMemoryError> {
    let mut buf = [0u8; 4];
    mem.read(addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64_le<M: GuestMemory + ?Sized>(mem: &M, addr: u64) -> Result<u64, GuestMemoryError> {
    let mut buf = [0u8; 8];
    mem.read(addr, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_u16_le<M: GuestMemory + ?Sized>(
    mem: &M,
    addr: u64,
    value: u16,
) -> Result<(), GuestMemoryError> {
    mem.write(addr, &value.to_le_bytes())
}

pub fn write_u32_le<M: GuestMemory + ?Sized>(
    mem: &M,
    addr: u64,
    value: u32,
) -> Result<(), GuestMemoryError> {
    mem.write(addr, &value.to_le_bytes())
}

pub fn write_u64_le<M: GuestMemory + ?Sized>(
    mem: &M,
    addr: u64,
    value: u64,
) -> Result<(), GuestMemoryError> {
    mem.write(addr, &value.to_le_bytes())
}
