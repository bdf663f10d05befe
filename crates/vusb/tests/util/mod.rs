#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use vusb::{
    IrqLine, Pid, PortStatusObserver, Result, TransferParams, UsbHostController, VmMonitor,
    VusbDevice, VusbError, Xact, XactBuffer, XactCompletion, XactStatus,
};

pub const BASE: u64 = 0x3000_0000;
pub const IRQ_LINE: u32 = 27;

/// Owned summary of one dispatched transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XactRecord {
    pub pid: Pid,
    pub len: u32,
    /// Guest physical buffer address, for `Guest` buffers.
    pub paddr: Option<u64>,
    /// Capacity of the device-resident window, for `Host` buffers.
    pub host_window: Option<usize>,
}

/// One recorded `schedule` call.
#[derive(Debug, Clone)]
pub struct ScheduleRecord {
    pub params: TransferParams,
    pub xacts: Vec<XactRecord>,
    /// Whether a completion callback accompanied the call.
    pub periodic: bool,
}

/// Scripted host-controller driver that records every dispatch.
#[derive(Default)]
pub struct FakeHcd {
    pub calls: Vec<ScheduleRecord>,
    /// Result returned from `schedule`. Defaults to `Ok(0)`.
    pub result: Option<Result<usize>>,
    /// Bytes written through the data-stage `Host` window of each call.
    pub reply: Vec<u8>,
    /// Completion callbacks captured from periodic registrations.
    pub completions: Vec<Box<dyn XactCompletion>>,
}

impl FakeHcd {
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::default()))
    }

    /// Fires the captured periodic completion at `index` as the driver
    /// would, returning the callback's keep-scheduled decision.
    pub fn fire_completion(&mut self, index: usize, status: XactStatus, data: &[u8]) -> bool {
        self.completions[index].on_complete(status, data)
    }
}

impl UsbHostController for FakeHcd {
    fn schedule(
        &mut self,
        params: &TransferParams,
        xacts: &mut [Xact<'_>],
        completion: Option<Box<dyn XactCompletion>>,
    ) -> Result<usize> {
        let mut records = Vec::with_capacity(xacts.len());
        for xact in xacts.iter_mut() {
            let (paddr, host_window) = match &xact.buf {
                XactBuffer::Guest(paddr) => (Some(*paddr), None),
                XactBuffer::Host(buf) => (None, Some(buf.len())),
                XactBuffer::Absent => (None, None),
            };
            records.push(XactRecord {
                pid: xact.pid,
                len: xact.len,
                paddr,
                host_window,
            });
        }
        if !self.reply.is_empty() {
            for xact in xacts.iter_mut() {
                if xact.pid == Pid::Setup {
                    continue;
                }
                if let XactBuffer::Host(buf) = &mut xact.buf {
                    let n = self.reply.len().min(buf.len()).min(xact.len as usize);
                    buf[..n].copy_from_slice(&self.reply[..n]);
                }
            }
        }
        self.calls.push(ScheduleRecord {
            params: *params,
            xacts: records,
            periodic: completion.is_some(),
        });
        if let Some(completion) = completion {
            self.completions.push(completion);
        }
        self.result.clone().unwrap_or(Ok(0))
    }
}

/// Interrupt line that counts injections through a shared cell.
pub struct SharedIrq(pub Rc<RefCell<u32>>);

impl IrqLine for SharedIrq {
    fn inject(&mut self) {
        *self.0.borrow_mut() += 1;
    }
}

/// Install stage the fake monitor can be scripted to fail at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    MapPage,
    Virq,
    MmioRegion,
    NotifyChannel,
}

/// Recording VM monitor for installation tests.
#[derive(Default)]
pub struct FakeVmm {
    pub mapped: Vec<(u64, bool)>,
    pub mmio_regions: Vec<(u64, u64)>,
    pub virq_lines: Vec<u32>,
    pub notify_connected: bool,
    pub irq_count: Rc<RefCell<u32>>,
    pub fail_at: Option<FailAt>,
}

impl VmMonitor for FakeVmm {
    fn map_register_page(&mut self, gpa: u64, writable: bool) -> Result<()> {
        if self.fail_at == Some(FailAt::MapPage) {
            return Err(VusbError::InstallFailure("map register page"));
        }
        self.mapped.push((gpa, writable));
        Ok(())
    }

    fn allocate_virq(&mut self, line: u32) -> Result<Box<dyn IrqLine>> {
        if self.fail_at == Some(FailAt::Virq) {
            return Err(VusbError::InstallFailure("allocate virq"));
        }
        self.virq_lines.push(line);
        Ok(Box::new(SharedIrq(Rc::clone(&self.irq_count))))
    }

    fn register_mmio_region(&mut self, base: u64, len: u64) -> Result<()> {
        if self.fail_at == Some(FailAt::MmioRegion) {
            return Err(VusbError::InstallFailure("register mmio region"));
        }
        self.mmio_regions.push((base, len));
        Ok(())
    }

    fn connect_notify_channel(&mut self) -> Result<()> {
        if self.fail_at == Some(FailAt::NotifyChannel) {
            return Err(VusbError::InstallFailure("connect notify channel"));
        }
        self.notify_connected = true;
        Ok(())
    }
}

/// Port-status observer that records every completion it sees.
pub struct RecordingObserver {
    pub events: Rc<RefCell<Vec<(XactStatus, Vec<u8>)>>>,
    pub keep_polling: bool,
}

impl PortStatusObserver for RecordingObserver {
    fn port_status_changed(&mut self, status: XactStatus, bitmap: &[u8]) -> bool {
        self.events.borrow_mut().push((status, bitmap.to_vec()));
        self.keep_polling
    }
}

/// Installs a device against fresh fakes, returning the device, the fake
/// driver, and the shared interrupt-injection counter.
pub fn install_device() -> (VusbDevice, Rc<RefCell<FakeHcd>>, Rc<RefCell<u32>>) {
    let hcd = FakeHcd::new();
    let mut vmm = FakeVmm::default();
    let irq_count = Rc::clone(&vmm.irq_count);
    let dev = VusbDevice::install(
        &mut vmm,
        hcd.clone(),
        BASE,
        IRQ_LINE,
        Box::new(vusb::NullAcknowledger),
        Box::new(vusb::NullPortObserver),
    )
    .expect("install");
    (dev, hcd, irq_count)
}
