//! Guest-visible register file: layout constants and typed accessors.
//!
//! The device maps two contiguous 4KiB pages into the guest. The data page
//! (offset 0x0000) is an array of [`URB_SLOT_COUNT`] fixed-size URB slot
//! records the guest normally writes through a direct read-write mapping.
//! The control page (offset 0x1000) holds the root-hub registers and is
//! mapped read-only, so guest writes always trap.
//!
//! All multi-byte fields are little-endian. Offsets are part of the guest
//! ABI and must not change.

use crate::host::{SetupPacket, SETUP_PACKET_SIZE};

/// Bytes per register page.
pub const PAGE_SIZE: usize = 0x1000;
/// Offset of the root-hub control page within the MMIO region.
pub const CTRL_PAGE_OFFSET: usize = 0x1000;
/// Total guest-mapped size of the device.
pub const MMIO_SIZE: u64 = 0x2000;

/// Downstream ports exposed by the virtual root hub.
pub const NUM_PORTS: u32 = 3;

/// Number of URB slots in the data page.
pub const URB_SLOT_COUNT: usize = 10;
/// Bytes per URB slot record.
pub const URB_SLOT_SIZE: usize = 52;
/// The guest marks a slot ready for dispatch by storing this in its status
/// word; the device overwrites it with the completion byte count.
pub const URB_STATUS_PENDING: u32 = 1 << 31;

// URB slot field offsets.
const SLOT_DEV_ADDR: usize = 0;
const SLOT_HUB_ADDR: usize = 1;
const SLOT_HUB_PORT: usize = 2;
const SLOT_SPEED: usize = 3;
const SLOT_ENDPOINT: usize = 4;
const SLOT_MAX_PACKET: usize = 6;
const SLOT_RATE_MS: usize = 8;
const SLOT_NXACT: usize = 10;
const SLOT_TOKEN: usize = 12;
const SLOT_STATUS: usize = 16;
const SLOT_DESC: usize = 20;

/// Bytes per transfer descriptor within a slot: four dwords holding paddr,
/// length, phase, and a reserved word.
pub const URB_DESC_SIZE: usize = 16;
const DESC_PADDR: usize = 0;
const DESC_LEN: usize = 4;
const DESC_PHASE: usize = 8;

// Control page register offsets (relative to the control page).
pub const REG_STATUS: usize = 0x0;
pub const REG_REPLY: usize = 0x4;
pub const REG_NPORTS: usize = 0x8;
pub const REG_REQUEST: usize = 0xc;
/// Bytes in the reply window at [`REG_REPLY`]. Control replies longer than
/// this are truncated to the window.
pub const REPLY_WINDOW_SIZE: usize = 4;

/// Guest speed code for a high-speed device.
pub const SPEED_CODE_HIGH: u8 = 3;

/// One transfer descriptor of a [`UrbSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UrbDescriptor {
    /// Guest physical address of the data buffer.
    pub paddr: u32,
    /// Transfer length in bytes.
    pub len: i32,
    /// Phase code: -1 setup, 0 in, 1 out.
    pub phase: i32,
}

/// Decoded URB slot record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UrbSlot {
    pub dev_addr: u8,
    pub hub_addr: u8,
    pub hub_port: u8,
    pub speed: u8,
    pub endpoint: u16,
    pub max_packet: u16,
    /// Polling interval in milliseconds; nonzero marks a periodic transfer.
    pub rate_ms: u16,
    /// Number of valid entries in `desc` (1 or 2).
    pub nxact: u16,
    /// Opaque guest cookie; passed through untouched.
    pub token: u32,
    pub status: u32,
    pub desc: [UrbDescriptor; 2],
}

impl UrbSlot {
    /// Bus speed the slot dispatches at.
    pub fn bus_speed(&self) -> crate::host::UsbSpeed {
        // Code 3 (high) is the only speed current guests submit; unknown
        // codes also dispatch at high speed until the ABI grows more codes.
        crate::host::UsbSpeed::High
    }
}

/// Backing store for the two guest-visible register pages.
pub struct RegisterFile {
    data: [u8; PAGE_SIZE],
    ctrl: [u8; PAGE_SIZE],
}

impl RegisterFile {
    pub fn new() -> Self {
        let mut regs = Self {
            data: [0; PAGE_SIZE],
            ctrl: [0; PAGE_SIZE],
        };
        regs.write_u32(CTRL_PAGE_OFFSET + REG_NPORTS, NUM_PORTS);
        regs
    }

    fn page(&self, offset: usize) -> (&[u8; PAGE_SIZE], usize) {
        if offset < PAGE_SIZE {
            (&self.data, offset)
        } else {
            (&self.ctrl, offset - PAGE_SIZE)
        }
    }

    fn page_mut(&mut self, offset: usize) -> (&mut [u8; PAGE_SIZE], usize) {
        if offset < PAGE_SIZE {
            (&mut self.data, offset)
        } else {
            (&mut self.ctrl, offset - PAGE_SIZE)
        }
    }

    /// Reads the little-endian word at `offset`. `offset` must be
    /// word-aligned and below [`MMIO_SIZE`]; the fault interceptor
    /// guarantees both.
    pub fn read_u32(&self, offset: usize) -> u32 {
        debug_assert_eq!(offset & 0x3, 0);
        let (page, off) = self.page(offset);
        u32::from_le_bytes([page[off], page[off + 1], page[off + 2], page[off + 3]])
    }

    /// Stores the little-endian word at `offset`. Same contract as
    /// [`Self::read_u32`].
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        debug_assert_eq!(offset & 0x3, 0);
        let (page, off) = self.page_mut(offset);
        page[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn data_u16(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.data[off], self.data[off + 1]])
    }

    fn data_u32(&self, off: usize) -> u32 {
        u32::from_le_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ])
    }

    fn slot_base(index: usize) -> usize {
        assert!(index < URB_SLOT_COUNT, "URB slot index out of range");
        index * URB_SLOT_SIZE
    }

    /// Decodes one URB slot record from the data page.
    pub fn urb_slot(&self, index: usize) -> UrbSlot {
        let base = Self::slot_base(index);
        let mut desc = [UrbDescriptor::default(); 2];
        for (i, d) in desc.iter_mut().enumerate() {
            let db = base + SLOT_DESC + i * URB_DESC_SIZE;
            *d = UrbDescriptor {
                paddr: self.data_u32(db + DESC_PADDR),
                len: self.data_u32(db + DESC_LEN) as i32,
                phase: self.data_u32(db + DESC_PHASE) as i32,
            };
        }
        UrbSlot {
            dev_addr: self.data[base + SLOT_DEV_ADDR],
            hub_addr: self.data[base + SLOT_HUB_ADDR],
            hub_port: self.data[base + SLOT_HUB_PORT],
            speed: self.data[base + SLOT_SPEED],
            endpoint: self.data_u16(base + SLOT_ENDPOINT),
            max_packet: self.data_u16(base + SLOT_MAX_PACKET),
            rate_ms: self.data_u16(base + SLOT_RATE_MS),
            nxact: self.data_u16(base + SLOT_NXACT),
            token: self.data_u32(base + SLOT_TOKEN),
            status: self.data_u32(base + SLOT_STATUS),
            desc,
        }
    }

    /// Encodes a URB slot record into the data page, as the guest would
    /// through its direct mapping. Reserved descriptor dwords are zeroed.
    pub fn set_urb_slot(&mut self, index: usize, slot: &UrbSlot) {
        let base = Self::slot_base(index);
        self.data[base + SLOT_DEV_ADDR] = slot.dev_addr;
        self.data[base + SLOT_HUB_ADDR] = slot.hub_addr;
        self.data[base + SLOT_HUB_PORT] = slot.hub_port;
        self.data[base + SLOT_SPEED] = slot.speed;
        self.data[base + SLOT_ENDPOINT..base + SLOT_ENDPOINT + 2]
            .copy_from_slice(&slot.endpoint.to_le_bytes());
        self.data[base + SLOT_MAX_PACKET..base + SLOT_MAX_PACKET + 2]
            .copy_from_slice(&slot.max_packet.to_le_bytes());
        self.data[base + SLOT_RATE_MS..base + SLOT_RATE_MS + 2]
            .copy_from_slice(&slot.rate_ms.to_le_bytes());
        self.data[base + SLOT_NXACT..base + SLOT_NXACT + 2]
            .copy_from_slice(&slot.nxact.to_le_bytes());
        self.data[base + SLOT_TOKEN..base + SLOT_TOKEN + 4]
            .copy_from_slice(&slot.token.to_le_bytes());
        self.data[base + SLOT_STATUS..base + SLOT_STATUS + 4]
            .copy_from_slice(&slot.status.to_le_bytes());
        for (i, d) in slot.desc.iter().enumerate() {
            let db = base + SLOT_DESC + i * URB_DESC_SIZE;
            self.data[db..db + 4].copy_from_slice(&d.paddr.to_le_bytes());
            self.data[db + DESC_LEN..db + DESC_LEN + 4].copy_from_slice(&d.len.to_le_bytes());
            self.data[db + DESC_PHASE..db + DESC_PHASE + 4]
                .copy_from_slice(&d.phase.to_le_bytes());
            self.data[db + 12..db + 16].fill(0);
        }
    }

    pub fn urb_status(&self, index: usize) -> u32 {
        self.data_u32(Self::slot_base(index) + SLOT_STATUS)
    }

    /// Writes back a slot's completion status.
    pub fn set_urb_status(&mut self, index: usize, status: u32) {
        let off = Self::slot_base(index) + SLOT_STATUS;
        self.data[off..off + 4].copy_from_slice(&status.to_le_bytes());
    }

    /// Decodes the stored control request.
    pub fn setup_request(&self) -> SetupPacket {
        let mut bytes = [0u8; SETUP_PACKET_SIZE];
        bytes.copy_from_slice(&self.ctrl[REG_REQUEST..REG_REQUEST + SETUP_PACKET_SIZE]);
        SetupPacket::parse(bytes)
    }

    pub fn num_ports(&self) -> u32 {
        self.read_u32(CTRL_PAGE_OFFSET + REG_NPORTS)
    }

    pub fn reply_bytes(&self) -> [u8; REPLY_WINDOW_SIZE] {
        let mut bytes = [0u8; REPLY_WINDOW_SIZE];
        bytes.copy_from_slice(&self.ctrl[REG_REPLY..REG_REPLY + REPLY_WINDOW_SIZE]);
        bytes
    }

    /// Disjoint mutable windows over the stored control request and the
    /// reply register, handed to the host-controller driver for the setup
    /// and data stages of a root-hub control transfer.
    pub fn control_windows(&mut self) -> (&mut [u8], &mut [u8]) {
        let (head, tail) = self.ctrl.split_at_mut(REG_REQUEST);
        (
            &mut tail[..SETUP_PACKET_SIZE],
            &mut head[REG_REPLY..REG_REPLY + REPLY_WINDOW_SIZE],
        )
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}
