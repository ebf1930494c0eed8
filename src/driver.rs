//! The two boundary seams of the shim.
//!
//! [`Miniport`] stands in for the foreign driver's entry-point table: in a
//! deployed build each method is a trampoline into the binary driver's
//! calling convention, resolved at load time; the trampoline layer sits
//! outside this crate. [`HostStack`] is the host networking stack's side of
//! the boundary.

use crate::device::AdapterHandle;
use crate::native::NativeChain;
use crate::packet::PacketHandle;
use crate::status::{DriverStatus, Medium, Oid, PnpEvent};
use crate::view::SegmentView;

/// Outcome of a query or set request: the status plus how many buffer bytes
/// the driver wrote and how many it would have needed.
#[derive(Clone, Copy, Debug)]
pub struct InfoResult {
    pub status: DriverStatus,
    pub written: u32,
    pub needed: u32,
}

impl InfoResult {
    pub fn done(status: DriverStatus, written: u32, needed: u32) -> Self {
        Self {
            status,
            written,
            needed,
        }
    }

    /// The pending sentinel; the driver completes through the callback.
    pub fn pending() -> Self {
        Self {
            status: DriverStatus::Pending,
            written: 0,
            needed: 0,
        }
    }
}

/// Outcome of a reset. `addressing_reset` is the driver's request to have
/// its addressing state reprogrammed; it is surfaced to the host-stack
/// collaborator uninterpreted.
#[derive(Clone, Copy, Debug)]
pub struct ResetOutcome {
    pub status: DriverStatus,
    pub addressing_reset: bool,
}

/// Attributes the driver declares at registration. `serialized` decides
/// whether the shim must wrap entry-point calls in the exclusion lock.
#[derive(Clone, Copy, Debug)]
pub struct MiniportAttrs {
    pub serialized: bool,
    pub surprise_remove_ok: bool,
}

impl Default for MiniportAttrs {
    fn default() -> Self {
        Self {
            serialized: true,
            surprise_remove_ok: false,
        }
    }
}

/// Entry points of a miniport driver instance.
///
/// Implementations are invoked under the contract of the foreign driver
/// model: when `MiniportAttrs::serialized` is set, the shim guarantees at
/// most one of query/set/send/reset is inside the driver at a time.
/// Asynchronous completions are delivered through the [`AdapterHandle`]
/// received at initialization.
///
/// A method given a [`SegmentView`] that returns [`DriverStatus::Pending`]
/// may retain the view, but only until it fires the matching completion.
pub trait Miniport: Send + Sync {
    fn attributes(&self) -> MiniportAttrs {
        MiniportAttrs::default()
    }

    /// Brings the adapter up. `mediums` lists the media the host supports;
    /// the driver picks one or fails.
    fn initialize(&self, handle: AdapterHandle, mediums: &[Medium]) -> DriverStatus;

    /// Stops the adapter. After this returns no further entry point is
    /// invoked.
    fn halt(&self);

    fn shutdown(&self) {}

    /// Polled watchdog. `true` asks the host to reset the adapter.
    fn check_for_hang(&self) -> bool {
        false
    }

    fn enable_interrupts(&self) {}

    fn disable_interrupts(&self) {}

    fn reset(&self) -> ResetOutcome;

    fn query_info(&self, oid: Oid, buf: SegmentView) -> InfoResult;

    fn set_info(&self, oid: Oid, buf: SegmentView) -> InfoResult;

    /// Transmits one packet. `Pending` defers the outcome to
    /// [`AdapterHandle::send_complete`].
    fn send(&self, packet: PacketHandle) -> DriverStatus;

    /// Transmits a batch. The driver consumes entries it completed itself
    /// (setting them to `None`), marks per-packet out-of-band status for the
    /// rest, and leaves `Pending` entries to complete asynchronously.
    fn send_multiple(&self, packets: &mut [Option<PacketHandle>]);

    /// Takes back a receive packet whose native aliases have all been
    /// released. The driver owns the packet's memory again and frees the
    /// handle.
    fn return_packet(&self, packet: PacketHandle);

    fn pnp_event(&self, _event: PnpEvent) {}
}

/// The host networking stack's side of the shim.
///
/// `receive` and `send_done` take ownership of the chain; dropping it
/// releases the aliased memory (and, on the receive path, drives packet
/// reclamation). All methods may be called from completion context and must
/// not block or call back into blocking adapter operations.
pub trait HostStack: Send + Sync {
    /// Delivery of a received frame.
    fn receive(&self, chain: NativeChain);

    /// A transmitted chain is done; the host frees its buffers.
    fn send_done(&self, chain: NativeChain, status: DriverStatus);

    /// General status indication from the driver.
    fn indicate_status(&self, _status: DriverStatus) {}

    /// The driver finished a run of status indications.
    fn status_complete(&self) {}

    /// Transmit resources freed up after an earlier rejection.
    fn resources_available(&self) {}
}
