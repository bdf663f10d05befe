//! The virtual USB host-controller device.
//!
//! This module ties the register file, the translators, and the driver
//! boundary together: fault interception for the guest's MMIO accesses, the
//! notify path that dispatches guest-submitted URBs, and installation
//! against the VM monitor's device framework.

use std::cell::RefCell;
use std::rc::Rc;

use crate::host::{
    Pid, TransferParams, UsbHostController, UsbSpeed, Xact, XactBuffer, XactCompletion, XactStatus,
};
use crate::regs::{RegisterFile, CTRL_PAGE_OFFSET, MMIO_SIZE, NUM_PORTS, REG_NPORTS, REG_STATUS};
use crate::urb::{control_xacts, translate_urb};
use crate::{Result, VusbError};

/// USB address of the virtual root hub itself.
pub const ROOT_HUB_ADDR: u8 = 1;
/// Interrupt endpoint carrying the port-status-change bitmap.
const ROOT_HUB_STATUS_ENDPOINT: u16 = 1;
/// Max packet size of the port-status-change endpoint.
const ROOT_HUB_STATUS_MAX_PACKET: u16 = 2;
/// Period of the port-status-change poll.
const PORT_POLL_INTERVAL_MS: u16 = 10;

/// Addressing for transfers targeting the virtual root hub itself.
fn root_hub_params(endpoint: u16, max_packet: u16, interval_ms: u16) -> TransferParams {
    TransferParams {
        dev_addr: ROOT_HUB_ADDR,
        hub_addr: None,
        hub_port: 0,
        speed: UsbSpeed::Full,
        endpoint,
        max_packet,
        interval_ms,
    }
}

/// A virtual interrupt line into the guest.
pub trait IrqLine {
    /// Injects one edge of the device interrupt.
    fn inject(&mut self);
}

/// Receives guest end-of-interrupt notifications.
///
/// The monitor calls [`VusbDevice::irq_acked`] when the guest completes its
/// interrupt handler; the device forwards to this capability. Nothing is
/// gated on acknowledgment yet, so [`NullAcknowledger`] is a complete
/// default implementation.
pub trait InterruptAcknowledger {
    fn irq_acked(&mut self);
}

/// Default acknowledger: nothing to do.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAcknowledger;

impl InterruptAcknowledger for NullAcknowledger {
    fn irq_acked(&mut self) {}
}

/// Observes completions of the root-hub port-status-change poll.
///
/// `bitmap` carries one bit per downstream port, `ceil(port_count / 8)`
/// bytes. The observer runs on the driver's completion context; returning
/// `false` drops the periodic registration.
pub trait PortStatusObserver {
    fn port_status_changed(&mut self, status: XactStatus, bitmap: &[u8]) -> bool;
}

/// Default observer: ignore the bitmap and keep polling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPortObserver;

impl PortStatusObserver for NullPortObserver {
    fn port_status_changed(&mut self, _status: XactStatus, _bitmap: &[u8]) -> bool {
        true
    }
}

/// Adapts the device's observer to the dispatcher's completion interface.
struct PortPollCompletion {
    observer: Box<dyn PortStatusObserver>,
}

impl XactCompletion for PortPollCompletion {
    fn on_complete(&mut self, status: XactStatus, data: &[u8]) -> bool {
        self.observer.port_status_changed(status, data)
    }
}

/// Installation-time services provided by the VM monitor.
///
/// Each method is invoked at most once per [`VusbDevice::install`] call, in
/// declaration order. Implementations report failures as
/// [`VusbError::InstallFailure`].
pub trait VmMonitor {
    /// Maps one 4KiB register page into the guest at `gpa`. Trapped accesses
    /// are emulated regardless of the mapping protection.
    fn map_register_page(&mut self, gpa: u64, writable: bool) -> Result<()>;
    /// Allocates virtual interrupt line `line` and returns its injector.
    fn allocate_virq(&mut self, line: u32) -> Result<Box<dyn IrqLine>>;
    /// Registers `[base, base + len)` with the monitor's fault-dispatch
    /// table, routing register faults to this device.
    fn register_mmio_region(&mut self, base: u64, len: u64) -> Result<()>;
    /// Wires the guest-to-monitor doorbell that later triggers
    /// [`VusbDevice::notify`].
    fn connect_notify_channel(&mut self) -> Result<()>;
}

/// The virtual USB host-controller device model.
pub struct VusbDevice {
    base: u64,
    regs: RegisterFile,
    hcd: Rc<RefCell<dyn UsbHostController>>,
    irq: Box<dyn IrqLine>,
    ack: Box<dyn InterruptAcknowledger>,
    /// The standing port-status poll registered with the driver at install.
    poll_xact: Xact<'static>,
    in_flight: bool,
}

impl std::fmt::Debug for VusbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VusbDevice")
            .field("base", &self.base)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl VusbDevice {
    /// Creates the device model without monitor-side installation: register
    /// file initialised, no pages mapped, no port poll registered.
    ///
    /// Embedders that drive mapping and scheduling themselves can wire the
    /// returned model directly; [`VusbDevice::install`] is the full
    /// construction path.
    pub fn new(
        hcd: Rc<RefCell<dyn UsbHostController>>,
        base: u64,
        irq: Box<dyn IrqLine>,
        ack: Box<dyn InterruptAcknowledger>,
    ) -> Self {
        Self {
            base,
            regs: RegisterFile::new(),
            hcd,
            irq,
            ack,
            poll_xact: Xact {
                pid: Pid::Interrupt,
                len: NUM_PORTS.div_ceil(8),
                buf: XactBuffer::Absent,
            },
            in_flight: false,
        }
    }

    /// Installs the device: maps the register pages (data page read-write,
    /// control page read-only), allocates the virtual interrupt line,
    /// registers the fault region and notify channel, and schedules the
    /// periodic port-status poll against the root hub.
    ///
    /// Any failing step aborts the installation; nothing is scheduled with
    /// the driver until every monitor-side step has succeeded.
    pub fn install(
        vm: &mut dyn VmMonitor,
        hcd: Rc<RefCell<dyn UsbHostController>>,
        base: u64,
        irq_line: u32,
        ack: Box<dyn InterruptAcknowledger>,
        observer: Box<dyn PortStatusObserver>,
    ) -> Result<Self> {
        vm.map_register_page(base, true)?;
        vm.map_register_page(base + CTRL_PAGE_OFFSET as u64, false)?;
        let irq = vm.allocate_virq(irq_line)?;
        vm.register_mmio_region(base, MMIO_SIZE)?;
        vm.connect_notify_channel()?;

        let mut dev = Self::new(hcd, base, irq, ack);
        dev.schedule_port_poll(observer)?;
        Ok(dev)
    }

    /// Registers the periodic port-status-change poll: one interrupt-phase
    /// transaction of `ceil(port_count / 8)` bytes every 10ms against the
    /// root hub's status endpoint.
    fn schedule_port_poll(&mut self, observer: Box<dyn PortStatusObserver>) -> Result<()> {
        let params = root_hub_params(
            ROOT_HUB_STATUS_ENDPOINT,
            ROOT_HUB_STATUS_MAX_PACKET,
            PORT_POLL_INTERVAL_MS,
        );
        let completion = Box::new(PortPollCompletion { observer });
        self.hcd
            .borrow_mut()
            .schedule(
                &params,
                core::slice::from_mut(&mut self.poll_xact),
                Some(completion),
            )
            .map_err(|err| {
                tracing::warn!(%err, "port-status poll registration failed");
                VusbError::InstallFailure("port-status poll registration")
            })?;
        Ok(())
    }

    /// Guest physical base address of the register region.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// The register pages as the guest sees them.
    pub fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    /// Mutable register pages; this is the path guest writes through the
    /// data page's direct read-write mapping take.
    pub fn regs_mut(&mut self) -> &mut RegisterFile {
        &mut self.regs
    }

    /// Forwarded by the monitor when the guest completes its interrupt
    /// handler.
    pub fn irq_acked(&mut self) {
        self.ack.irq_acked();
    }

    /// Resolves a faulting address to the containing word's offset and the
    /// bit position of the addressed byte lane.
    fn decode_offset(&self, gpa: u64) -> Option<(usize, u32)> {
        let offset = gpa.checked_sub(self.base)?;
        if offset >= MMIO_SIZE {
            return None;
        }
        Some(((offset as usize) & !0x3, ((offset & 0x3) as u32) * 8))
    }

    /// Emulates a guest read fault at guest-physical address `gpa`.
    ///
    /// The faulting access resolves to the containing word; the addressed
    /// byte lanes are extracted and masked to the access size. Reads outside
    /// the mapped window return `0xFFFF_FFFF`. The control status word is
    /// write-only: reads return zero, never the last value written.
    pub fn mmio_read(&mut self, gpa: u64, size: usize) -> u32 {
        let Some((offset, shift)) = self.decode_offset(gpa) else {
            return 0xFFFF_FFFF;
        };
        let word = if offset == CTRL_PAGE_OFFSET + REG_STATUS {
            0
        } else {
            self.regs.read_u32(offset)
        };
        let value = word >> shift;
        match size {
            1 => value & 0xFF,
            2 => value & 0xFFFF,
            4 => value,
            _ => 0xFFFF_FFFF,
        }
    }

    /// Emulates a guest write fault at guest-physical address `gpa`.
    ///
    /// A write to the control status word is never stored; it starts a
    /// root-hub control transfer from the current request registers. The
    /// port-count register is read-only. Every other register stores the
    /// written bytes, with sub-word writes merged into the addressed word by
    /// byte lane. Writes outside the mapped window are ignored.
    pub fn mmio_write(&mut self, gpa: u64, size: usize, value: u32) {
        let Some((offset, shift)) = self.decode_offset(gpa) else {
            return;
        };
        if !matches!(size, 1 | 2 | 4) {
            return;
        }
        if offset == CTRL_PAGE_OFFSET + REG_STATUS {
            // Write-triggered action register: dispatch the stored request,
            // regardless of the value written.
            if let Err(err) = self.start_control_transfer() {
                tracing::warn!(%err, "root hub control transfer failed");
            }
        } else if offset == CTRL_PAGE_OFFSET + REG_NPORTS {
            // Logically read-only; drop the write.
        } else {
            let merged = merge_lanes(self.regs.read_u32(offset), size, shift, value);
            self.regs.write_u32(offset, merged);
        }
    }

    /// Starts a control transfer on the virtual root hub from the current
    /// contents of the request registers.
    ///
    /// Fire-and-forget from the fault path: the reply window is populated by
    /// the time the guest next reads it, and the dispatch result is only
    /// logged.
    fn start_control_transfer(&mut self) -> Result<usize> {
        let setup = self.regs.setup_request();
        let params = root_hub_params(0, 64, 0);
        let (request, reply) = self.regs.control_windows();
        let mut xacts = control_xacts(setup, request, reply);
        let len = self.hcd.borrow_mut().schedule(&params, &mut xacts, None)?;
        tracing::debug!(len, "root hub control transfer complete");
        Ok(len)
    }

    /// Dispatches the guest transfer described by URB slot 0.
    ///
    /// Invoked by the monitor when the guest rings the notify doorbell. Only
    /// slot 0 is inspected; concurrent transfers are rejected by the
    /// in-flight guard. Errors are recoverable: a failed translation leaves
    /// the slot untouched, a failed dispatch stores the driver's negative
    /// code in the slot status, and neither injects the completion
    /// interrupt.
    pub fn notify(&mut self) -> Result<()> {
        if self.in_flight {
            return Err(VusbError::TransferInFlight);
        }
        self.in_flight = true;
        let result = self.dispatch_slot0();
        self.in_flight = false;
        result
    }

    fn dispatch_slot0(&mut self) -> Result<()> {
        let slot = self.regs.urb_slot(0);
        if slot.rate_ms != 0 {
            // Periodic guest transfers are classified by the translator but
            // not dispatched yet; drop them without failing the slot.
            tracing::warn!(rate_ms = slot.rate_ms, "dropping periodic guest URB");
            return Ok(());
        }

        let mut xacts = match translate_urb(&slot) {
            Ok(xacts) => xacts,
            Err(err) => {
                tracing::warn!(%err, "guest URB rejected");
                return Err(err);
            }
        };
        let params = TransferParams {
            dev_addr: slot.dev_addr,
            hub_addr: Some(slot.hub_addr),
            hub_port: slot.hub_port,
            speed: slot.bus_speed(),
            endpoint: slot.endpoint,
            max_packet: slot.max_packet,
            interval_ms: slot.rate_ms,
        };

        match self.hcd.borrow_mut().schedule(&params, &mut xacts, None) {
            Ok(len) => {
                self.regs.set_urb_status(0, len as u32);
                self.irq.inject();
                tracing::debug!(len, "guest transfer complete");
                Ok(())
            }
            Err(err) => {
                if let VusbError::DispatchFailure(code) = err {
                    // Fail the slot without raising the completion interrupt.
                    self.regs.set_urb_status(0, code as u32);
                }
                tracing::warn!(%err, "guest transfer failed");
                Err(err)
            }
        }
    }
}

/// Merges a 1/2/4-byte write into the addressed byte lanes of a word.
fn merge_lanes(current: u32, size: usize, shift: u32, value: u32) -> u32 {
    let mask = match size {
        1 => 0xFFu32,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    } << shift;
    (current & !mask) | ((value << shift) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::REG_REQUEST;

    const BASE: u64 = 0x3000_0000;

    #[derive(Default)]
    struct CountingHcd {
        calls: usize,
        reply: Vec<u8>,
    }

    impl UsbHostController for CountingHcd {
        fn schedule(
            &mut self,
            _params: &TransferParams,
            xacts: &mut [Xact<'_>],
            _completion: Option<Box<dyn XactCompletion>>,
        ) -> Result<usize> {
            self.calls += 1;
            for xact in xacts.iter_mut() {
                if xact.pid != Pid::Setup {
                    if let XactBuffer::Host(buf) = &mut xact.buf {
                        let n = self.reply.len().min(buf.len());
                        buf[..n].copy_from_slice(&self.reply[..n]);
                    }
                }
            }
            Ok(self.reply.len())
        }
    }

    struct NoIrq;

    impl IrqLine for NoIrq {
        fn inject(&mut self) {}
    }

    fn device(hcd: Rc<RefCell<CountingHcd>>) -> VusbDevice {
        VusbDevice::new(hcd, BASE, Box::new(NoIrq), Box::new(NullAcknowledger))
    }

    #[test]
    fn status_write_always_triggers_control_transfer() {
        let hcd = Rc::new(RefCell::new(CountingHcd::default()));
        let mut dev = device(hcd.clone());
        let status = BASE + CTRL_PAGE_OFFSET as u64;
        dev.mmio_write(status, 4, 0);
        dev.mmio_write(status, 4, 0xffff_ffff);
        assert_eq!(hcd.borrow().calls, 2);
    }

    #[test]
    fn status_reads_never_reflect_written_values() {
        let hcd = Rc::new(RefCell::new(CountingHcd::default()));
        let mut dev = device(hcd);
        let status = BASE + CTRL_PAGE_OFFSET as u64;
        dev.mmio_write(status, 4, 0x1234_5678);
        assert_eq!(dev.mmio_read(status, 4), 0);
    }

    #[test]
    fn port_count_register_is_read_only() {
        let hcd = Rc::new(RefCell::new(CountingHcd::default()));
        let mut dev = device(hcd);
        let nports = BASE + (CTRL_PAGE_OFFSET + REG_NPORTS) as u64;
        dev.mmio_write(nports, 4, 99);
        assert_eq!(dev.mmio_read(nports, 4), NUM_PORTS);
    }

    #[test]
    fn request_register_writes_merge_by_lane() {
        let hcd = Rc::new(RefCell::new(CountingHcd::default()));
        let mut dev = device(hcd);
        let request = BASE + (CTRL_PAGE_OFFSET + REG_REQUEST) as u64;
        dev.mmio_write(request, 4, 0x0102_0304);
        dev.mmio_write(request, 1, 0xaa);
        assert_eq!(dev.mmio_read(request, 4), 0x0102_03aa);
        dev.mmio_write(request, 2, 0xbbcc);
        assert_eq!(dev.mmio_read(request, 4), 0x0102_bbcc);
        assert_eq!(dev.mmio_read(request, 1), 0xcc);
        // A byte store at an interior lane leaves its neighbours alone.
        dev.mmio_write(request + 1, 1, 0xee);
        assert_eq!(dev.mmio_read(request, 4), 0x0102_eecc);
        assert_eq!(dev.mmio_read(request + 1, 1), 0xee);
    }

    #[test]
    fn faults_outside_the_window_are_harmless() {
        let hcd = Rc::new(RefCell::new(CountingHcd::default()));
        let mut dev = device(hcd);
        assert_eq!(dev.mmio_read(BASE + MMIO_SIZE, 4), 0xFFFF_FFFF);
        assert_eq!(dev.mmio_read(BASE - 4, 4), 0xFFFF_FFFF);
        dev.mmio_write(BASE + MMIO_SIZE, 4, 0x5555_5555);
        dev.mmio_write(BASE - 4, 4, 0x5555_5555);
        assert_eq!(dev.regs().read_u32(0), 0);
    }

    #[test]
    fn irq_ack_reaches_the_acknowledger() {
        struct CountingAck(Rc<RefCell<u32>>);

        impl InterruptAcknowledger for CountingAck {
            fn irq_acked(&mut self) {
                *self.0.borrow_mut() += 1;
            }
        }

        let acks = Rc::new(RefCell::new(0));
        let hcd = Rc::new(RefCell::new(CountingHcd::default()));
        let mut dev = VusbDevice::new(
            hcd,
            BASE,
            Box::new(NoIrq),
            Box::new(CountingAck(Rc::clone(&acks))),
        );
        dev.irq_acked();
        dev.irq_acked();
        assert_eq!(*acks.borrow(), 2);
    }

    #[test]
    fn unaligned_reads_extract_the_addressed_lanes() {
        let hcd = Rc::new(RefCell::new(CountingHcd::default()));
        let mut dev = device(hcd);
        dev.mmio_write(BASE + 0x10, 4, 0xcafe_f00d);
        assert_eq!(dev.mmio_read(BASE + 0x10, 4), 0xcafe_f00d);
        assert_eq!(dev.mmio_read(BASE + 0x12, 2), 0xcafe);
        assert_eq!(dev.mmio_read(BASE + 0x11, 1), 0xf0);
    }
}
