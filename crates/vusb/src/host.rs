//! Driver-facing dispatch boundary.
//!
//! Everything the external host-controller driver sees lives here: the
//! transaction and addressing types produced by the translators, and the
//! [`UsbHostController`] trait the driver implements. The dispatcher performs
//! no protocol logic of its own; phase ordering and handshake synthesis are
//! the translators' job.

use crate::Result;

/// USB bus speeds carried through to the host-controller driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
}

/// The role of one transaction within a transfer.
///
/// `Setup`/`In`/`Out` come straight from guest descriptor phase codes;
/// `Interrupt` is the reclassification applied to periodic slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pid {
    Setup,
    In,
    Out,
    Interrupt,
}

// Guest descriptor phase codes (data-page ABI).
pub const PHASE_SETUP: i32 = -1;
pub const PHASE_IN: i32 = 0;
pub const PHASE_OUT: i32 = 1;

impl Pid {
    /// Decodes a guest descriptor phase code. Periodic reclassification never
    /// comes from a phase code, so `Interrupt` is never returned.
    pub fn from_phase_code(code: i32) -> Option<Self> {
        match code {
            PHASE_SETUP => Some(Pid::Setup),
            PHASE_IN => Some(Pid::In),
            PHASE_OUT => Some(Pid::Out),
            _ => None,
        }
    }

    /// Direction of the zero-length status phase terminating a control or
    /// bulk transfer whose final data phase was `self`: always the opposite
    /// direction, and IN when the transfer carried no IN data.
    pub fn handshake(self) -> Self {
        if self == Pid::In {
            Pid::Out
        } else {
            Pid::In
        }
    }
}

/// Size of the standard eight-byte control request.
pub const SETUP_PACKET_SIZE: usize = 8;

/// Standard USB control request, stored little-endian in the control page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn parse(bytes: [u8; SETUP_PACKET_SIZE]) -> Self {
        Self {
            bm_request_type: bytes[0],
            b_request: bytes[1],
            w_value: u16::from_le_bytes([bytes[2], bytes[3]]),
            w_index: u16::from_le_bytes([bytes[4], bytes[5]]),
            w_length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; SETUP_PACKET_SIZE] {
        let mut bytes = [0u8; SETUP_PACKET_SIZE];
        bytes[0] = self.bm_request_type;
        bytes[1] = self.b_request;
        bytes[2..4].copy_from_slice(&self.w_value.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.w_index.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.w_length.to_le_bytes());
        bytes
    }

    /// Bit 7 of `bmRequestType`: set means the data stage moves
    /// device-to-host.
    pub fn is_device_to_host(self) -> bool {
        self.bm_request_type & 0x80 != 0
    }
}

/// Where a transaction's data stage lives.
#[derive(Debug)]
pub enum XactBuffer<'a> {
    /// Guest physical memory; the host-controller driver performs the DMA.
    Guest(u64),
    /// Bytes resident in the device model itself (root-hub register
    /// traffic). The driver reads setup bytes from, and writes reply bytes
    /// into, this window during the synchronous schedule call.
    Host(&'a mut [u8]),
    /// No data buffer: zero-length handshakes and descriptor-only
    /// registrations.
    Absent,
}

impl XactBuffer<'_> {
    pub fn guest_paddr(&self) -> Option<u64> {
        match self {
            XactBuffer::Guest(paddr) => Some(*paddr),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, XactBuffer::Absent)
    }
}

/// One bus transaction handed to the host-controller driver.
#[derive(Debug)]
pub struct Xact<'a> {
    pub pid: Pid,
    /// Requested transfer length in bytes. May exceed the capacity of a
    /// `Host` buffer; drivers write at most the buffer's length.
    pub len: u32,
    pub buf: XactBuffer<'a>,
}

/// Addressing and scheduling parameters for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParams {
    pub dev_addr: u8,
    /// Address of the upstream hub, or `None` for a device on the root hub.
    pub hub_addr: Option<u8>,
    pub hub_port: u8,
    pub speed: UsbSpeed,
    pub endpoint: u16,
    pub max_packet: u16,
    /// Polling interval in milliseconds; 0 schedules a one-shot transfer.
    pub interval_ms: u16,
}

/// Outcome the driver reports to periodic completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactStatus {
    Success,
    Error,
    Cancelled,
}

/// Completion callback attached to a periodic registration.
///
/// One-shot transfers complete synchronously inside
/// [`UsbHostController::schedule`] and pass no callback. Context the C-style
/// API would thread through an opaque token pointer is captured by the boxed
/// implementation instead.
pub trait XactCompletion {
    /// Called by the driver each time the registered transaction completes,
    /// with the transferred bytes. Returns `true` to keep the registration
    /// scheduled.
    fn on_complete(&mut self, status: XactStatus, data: &[u8]) -> bool;
}

/// Scheduling entry point of the external host-controller driver.
///
/// This is the sole boundary across which the translation layer depends on
/// real bus hardware behaviour. A one-shot call (`params.interval_ms == 0`,
/// no callback) blocks until the transaction list completes and returns the
/// number of bytes transferred. A periodic call registers the list with the
/// driver's schedule and returns once the registration is accepted; its
/// completions are delivered through `completion`.
///
/// Driver-reported transfer failures surface as
/// [`VusbError::DispatchFailure`](crate::VusbError::DispatchFailure) carrying
/// the driver's negative status code.
pub trait UsbHostController {
    fn schedule(
        &mut self,
        params: &TransferParams,
        xacts: &mut [Xact<'_>],
        completion: Option<Box<dyn XactCompletion>>,
    ) -> Result<usize>;
}
