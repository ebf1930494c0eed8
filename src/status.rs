//! Status codes and selectors crossing the foreign driver boundary.

use std::fmt;

/// Outcome of a driver entry point or completion callback.
///
/// `Pending` is the sentinel by which a driver declares that the result of a
/// request will arrive later through the matching completion callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverStatus {
    Success,
    Pending,
    NotAccepted,
    NotSupported,
    InvalidLength,
    InvalidData,
    Resources,
    ResetInProgress,
    DeviceFailed,
    Failure,
}

impl DriverStatus {
    #[inline]
    pub fn is_pending(self) -> bool {
        self == DriverStatus::Pending
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverStatus::Success => "success",
            DriverStatus::Pending => "pending",
            DriverStatus::NotAccepted => "not accepted",
            DriverStatus::NotSupported => "not supported",
            DriverStatus::InvalidLength => "invalid length",
            DriverStatus::InvalidData => "invalid data",
            DriverStatus::Resources => "out of resources",
            DriverStatus::ResetInProgress => "reset in progress",
            DriverStatus::DeviceFailed => "device failed",
            DriverStatus::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// Object identifier selecting what a query or set request targets.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub(crate) u32);

impl Oid {
    pub const GEN_MAXIMUM_FRAME_SIZE: Oid = Oid(0x0001_0106);
    pub const GEN_LINK_SPEED: Oid = Oid(0x0001_0107);
    pub const GEN_CURRENT_PACKET_FILTER: Oid = Oid(0x0001_010e);
    pub const GEN_CURRENT_LOOKAHEAD: Oid = Oid(0x0001_010f);
    pub const GEN_MEDIA_CONNECT_STATUS: Oid = Oid(0x0001_0114);
    pub const X802_3_PERMANENT_ADDRESS: Oid = Oid(0x0101_0101);
    pub const X802_3_CURRENT_ADDRESS: Oid = Oid(0x0101_0102);
}

impl From<u32> for Oid {
    fn from(val: u32) -> Self {
        Self(val)
    }
}

impl From<Oid> for u32 {
    fn from(val: Oid) -> u32 {
        val.0
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({:#010x})", self.0)
    }
}

/// Physical medium offered to the driver at initialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Medium {
    /// IEEE 802.3.
    Ethernet,
}

/// Plug-and-play notification forwarded to the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PnpEvent {
    SurpriseRemoved,
    PowerProfileChanged(u32),
}
