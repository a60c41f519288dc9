//! virtio-mmio v2 register surface.
//!
//! Register layout per the virtio spec, section 4.2.2 "MMIO Device Register
//! Layout". The emulator traps guest loads/stores into the device window and
//! forwards them here; only aligned 32-bit accesses are legal, and the
//! returned [`MmioFault`] tells the hart glue which exception to raise.

/// Byte offsets of the MMIO registers within the device window.
pub const REG_MAGIC_VALUE: u64 = 0x000;
pub const REG_VERSION: u64 = 0x004;
pub const REG_DEVICE_ID: u64 = 0x008;
pub const REG_VENDOR_ID: u64 = 0x00c;
pub const REG_DEVICE_FEATURES: u64 = 0x010;
pub const REG_DEVICE_FEATURES_SEL: u64 = 0x014;
pub const REG_DRIVER_FEATURES: u64 = 0x020;
pub const REG_DRIVER_FEATURES_SEL: u64 = 0x024;
pub const REG_QUEUE_SEL: u64 = 0x030;
pub const REG_QUEUE_NUM_MAX: u64 = 0x034;
pub const REG_QUEUE_NUM: u64 = 0x038;
pub const REG_QUEUE_READY: u64 = 0x044;
pub const REG_QUEUE_NOTIFY: u64 = 0x050;
pub const REG_INTERRUPT_STATUS: u64 = 0x060;
pub const REG_INTERRUPT_ACK: u64 = 0x064;
pub const REG_STATUS: u64 = 0x070;
pub const REG_QUEUE_DESC_LOW: u64 = 0x080;
pub const REG_QUEUE_DESC_HIGH: u64 = 0x084;
pub const REG_QUEUE_DRIVER_LOW: u64 = 0x090;
pub const REG_QUEUE_DRIVER_HIGH: u64 = 0x094;
pub const REG_QUEUE_DEVICE_LOW: u64 = 0x0a0;
pub const REG_QUEUE_DEVICE_HIGH: u64 = 0x0a4;
pub const REG_CONFIG_GENERATION: u64 = 0x0fc;
/// Start of the device-specific configuration window.
pub const REG_CONFIG: u64 = 0x100;

/// Little-endian "virt".
pub const VIRT_MAGIC: u32 = 0x7472_6976;
/// Modern (non-legacy) MMIO transport.
pub const MMIO_DEVICE_VERSION: u32 = 2;
pub const VIRTIO_DEVICE_ID_SOUND: u32 = 25;
pub const VIRTIO_VENDOR_ID: u32 = 0x554d_4551;

pub const VIRTIO_STATUS_ACKNOWLEDGE: u32 = 1;
pub const VIRTIO_STATUS_DRIVER: u32 = 2;
pub const VIRTIO_STATUS_DRIVER_OK: u32 = 4;
pub const VIRTIO_STATUS_FEATURES_OK: u32 = 8;
pub const VIRTIO_STATUS_DEVICE_NEEDS_RESET: u32 = 64;
pub const VIRTIO_STATUS_FAILED: u32 = 128;

pub const VIRTIO_INT_USED_RING: u32 = 1;
pub const VIRTIO_INT_CONFIG_CHANGE: u32 = 2;

/// The only feature the device offers: the modern virtio interface.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    U8,
    U16,
    U32,
    U64,
}

/// MMIO access failure, mapped by the emulator glue onto a hart exception:
/// `Misaligned` to a load/store misalignment, `UnsupportedWidth` to illegal
/// instruction, `BadOffset` to a load/store access fault.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum MmioFault {
    #[error("misaligned or sub-word MMIO access at offset {offset:#x}")]
    Misaligned { offset: u64 },
    #[error("unsupported MMIO access width at offset {offset:#x}")]
    UnsupportedWidth { offset: u64 },
    #[error("no register at offset {offset:#x}")]
    BadOffset { offset: u64 },
}

/// Rejects everything but aligned 32-bit accesses.
pub fn check_access(offset: u64, width: AccessWidth) -> Result<(), MmioFault> {
    match width {
        AccessWidth::U32 if offset % 4 == 0 => Ok(()),
        AccessWidth::U32 | AccessWidth::U8 | AccessWidth::U16 => {
            Err(MmioFault::Misaligned { offset })
        }
        AccessWidth::U64 => Err(MmioFault::UnsupportedWidth { offset }),
    }
}

/// Transport-level register state shared by virtio-mmio devices.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MmioRegs {
    pub device_features_sel: u32,
    pub driver_features: u32,
    pub driver_features_sel: u32,
    pub queue_sel: u32,
    pub interrupt_status: u32,
    pub status: u32,
}

impl MmioRegs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Selected 32-bit window of the 64-bit device feature word.
    pub fn device_features_bank(&self) -> u32 {
        match self.device_features_sel {
            0 => VIRTIO_F_VERSION_1 as u32,
            1 => (VIRTIO_F_VERSION_1 >> 32) as u32,
            _ => 0,
        }
    }

    /// Poisons the device. The driver is told through DEVICE_NEEDS_RESET,
    /// plus a config-change interrupt once it has set DRIVER_OK.
    pub fn mark_needs_reset(&mut self) {
        self.status |= VIRTIO_STATUS_DEVICE_NEEDS_RESET;
        if self.status & VIRTIO_STATUS_DRIVER_OK != 0 {
            self.interrupt_status |= VIRTIO_INT_CONFIG_CHANGE;
        }
    }

    pub fn needs_reset(&self) -> bool {
        self.status & VIRTIO_STATUS_DEVICE_NEEDS_RESET != 0
    }

    pub fn driver_ok(&self) -> bool {
        self.status & VIRTIO_STATUS_DRIVER_OK != 0
    }
}
