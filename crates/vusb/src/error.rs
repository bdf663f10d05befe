use thiserror::Error;

pub type Result<T> = std::result::Result<T, VusbError>;

/// Unified error type for the virtual USB host-controller device.
///
/// Translation errors (`MalformedUrb`, `UnknownPhase`, `InvalidPollingUrb`)
/// are recoverable: the notify path reports them to the caller without
/// touching the slot or injecting an interrupt. `DispatchFailure` carries the
/// driver's negative status code, which is also written back into the failed
/// slot's status word.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VusbError {
    /// The notified slot was not marked pending, or its descriptor count is
    /// outside the supported range of 1..=2.
    #[error("malformed URB: status {status:#010x}, descriptor count {nxact}")]
    MalformedUrb { status: u32, nxact: u16 },

    /// A transfer descriptor carried an undecodable phase code.
    #[error("unknown descriptor phase code {0}")]
    UnknownPhase(i32),

    /// A periodic slot must carry exactly one descriptor.
    #[error("periodic URB with {0} descriptors")]
    InvalidPollingUrb(u16),

    /// The host-controller driver reported a transfer failure.
    #[error("host controller transfer failed with code {0}")]
    DispatchFailure(i32),

    /// A notify arrived while the previous transfer was still unresolved.
    #[error("guest transfer already in flight")]
    TransferInFlight,

    /// Mapping, allocation, or registration failed during construction.
    #[error("device installation failed at {0}")]
    InstallFailure(&'static str),
}
