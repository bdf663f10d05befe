//! Virtual USB host-controller device for trap-and-emulate VM monitors.
//!
//! The guest sees a two-page MMIO register file: a data page of URB slots it
//! fills with transfer descriptors, and a root-hub control page whose status
//! word starts control transfers when written. The monitor forwards register
//! faults to [`VusbDevice::mmio_read`] / [`VusbDevice::mmio_write`] and
//! rings [`VusbDevice::notify`] when the guest submits a transfer; the
//! device translates guest descriptors into host-controller transactions,
//! hands them to the [`UsbHostController`] driver, writes completion status
//! back into the register file, and injects the completion interrupt.
//!
//! The monitor's fault dispatch, guest memory mapping, interrupt injection,
//! and the real host-controller driver are collaborators behind the
//! [`VmMonitor`], [`IrqLine`], and [`UsbHostController`] traits; this crate
//! implements only the register model and the translation rules between
//! them.

#![forbid(unsafe_code)]

mod error;

pub mod device;
pub mod host;
pub mod regs;
pub mod urb;

pub use device::{
    InterruptAcknowledger, IrqLine, NullAcknowledger, NullPortObserver, PortStatusObserver,
    VmMonitor, VusbDevice, ROOT_HUB_ADDR,
};
pub use error::{Result, VusbError};
pub use host::{
    Pid, SetupPacket, TransferParams, UsbHostController, UsbSpeed, Xact, XactBuffer,
    XactCompletion, XactStatus, SETUP_PACKET_SIZE,
};
pub use regs::{RegisterFile, UrbDescriptor, UrbSlot};
