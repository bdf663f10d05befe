//! Descriptor-to-transaction translation.
//!
//! Two translators live here. [`translate_urb`] turns one guest URB slot
//! into the ordered transaction sequence the host-controller driver expects,
//! synthesizing the terminating handshake for one-shot transfers.
//! [`control_xacts`] builds the fixed two-transaction pair for a root-hub
//! control transfer out of the control-page registers.

use crate::host::{Pid, SetupPacket, Xact, XactBuffer, SETUP_PACKET_SIZE};
use crate::regs::{UrbSlot, URB_STATUS_PENDING};
use crate::{Result, VusbError};

/// Translates one pending URB slot into its transaction sequence.
///
/// The slot must carry the pending status sentinel and one or two
/// descriptors. Each descriptor's length and guest physical address are
/// copied verbatim. A slot with a nonzero polling interval is a periodic
/// transfer: its single transaction is reclassified as interrupt-phase and
/// returned alone. Everything else is a one-shot control/bulk transfer and
/// is terminated with a zero-length handshake of direction opposite the
/// final data phase.
pub fn translate_urb(slot: &UrbSlot) -> Result<Vec<Xact<'static>>> {
    if slot.status != URB_STATUS_PENDING || !(1..=2).contains(&slot.nxact) {
        return Err(VusbError::MalformedUrb {
            status: slot.status,
            nxact: slot.nxact,
        });
    }

    let nxact = slot.nxact as usize;
    let mut xacts = Vec::with_capacity(nxact + 1);
    for desc in &slot.desc[..nxact] {
        let pid = Pid::from_phase_code(desc.phase).ok_or(VusbError::UnknownPhase(desc.phase))?;
        xacts.push(Xact {
            pid,
            len: desc.len as u32,
            buf: XactBuffer::Guest(desc.paddr.into()),
        });
    }

    if slot.rate_ms != 0 {
        // Periodic transfers carry exactly one descriptor and no handshake.
        if nxact != 1 {
            return Err(VusbError::InvalidPollingUrb(slot.nxact));
        }
        xacts[0].pid = Pid::Interrupt;
        return Ok(xacts);
    }

    let handshake = xacts[nxact - 1].pid.handshake();
    xacts.push(Xact {
        pid: handshake,
        len: 0,
        buf: XactBuffer::Absent,
    });
    Ok(xacts)
}

/// Builds the fixed two-transaction sequence for a root-hub control
/// transfer.
///
/// Transaction 0 is the setup stage over the stored request bytes.
/// Transaction 1 is the data stage: IN when bit 7 of `bmRequestType` is set,
/// OUT otherwise, sized by `wLength` and pointed at the reply window.
/// `setup` is the already-decoded copy of `request` used to pick direction
/// and length.
pub fn control_xacts<'a>(
    setup: SetupPacket,
    request: &'a mut [u8],
    reply: &'a mut [u8],
) -> [Xact<'a>; 2] {
    let data_pid = if setup.is_device_to_host() {
        Pid::In
    } else {
        Pid::Out
    };
    [
        Xact {
            pid: Pid::Setup,
            len: SETUP_PACKET_SIZE as u32,
            buf: XactBuffer::Host(request),
        },
        Xact {
            pid: data_pid,
            len: setup.w_length.into(),
            buf: XactBuffer::Host(reply),
        },
    ]
}
