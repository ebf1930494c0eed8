//! Per-adapter state and the synchronous face of the asynchronous driver.
//!
//! A [`Device`] owns one miniport driver instance plus the shared
//! [`DeviceBlock`] that the driver's completion callbacks and the host's
//! release hooks both reach. The request adapter here makes the driver's
//! query/set/reset protocol look synchronous to the host stack: issue under
//! the serialization gate, then, if the driver answered with the pending
//! sentinel, wait on the matching completion signal with a bounded timeout.

use std::sync::Arc as StdArc;
use std::thread;
use std::time::Duration;

use eui48::MacAddress;
use parking_lot::Mutex;
use smallvec::SmallVec;
use triomphe::Arc;

use crate::bridge;
use crate::driver::{HostStack, InfoResult, Miniport, MiniportAttrs, ResetOutcome};
use crate::errors::{Error, Result};
use crate::native::{NativeChain, SegBudget};
use crate::packet::{PacketHandle, PacketPool, SegId, SegPool};
use crate::reclaim::{self, ReclaimQueue};
use crate::status::{DriverStatus, Medium, Oid, PnpEvent};
use crate::sync::Signal;
use crate::view::SegmentView;

/// Sizing and timing knobs for one adapter.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Host MTU used to derive the maximum acceptable frame size.
    pub mtu: u32,
    /// Capacity of the foreign packet arena.
    pub max_packets: usize,
    /// Capacity of the buffer-descriptor arena.
    pub max_segments: usize,
    /// Budget of outstanding native segments aliasing driver memory.
    pub host_segments: usize,
    /// Bound on waiting for a pending request to complete.
    pub request_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            max_packets: 64,
            max_segments: 256,
            host_segments: 256,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared per-adapter state: everything the driver's callbacks and the
/// host's release hooks need without a path back to the driver object.
pub(crate) struct DeviceBlock {
    pub(crate) config: DeviceConfig,
    pub(crate) serialized: bool,
    pub(crate) surprise_remove_ok: bool,
    exclusion: Mutex<()>,
    query_signal: Signal<InfoResult>,
    set_signal: Signal<InfoResult>,
    reset_signal: Signal<ResetOutcome>,
    pub(crate) pool: PacketPool,
    pub(crate) segs: SegPool,
    pub(crate) native_budget: SegBudget,
    pub(crate) reclaim: ReclaimQueue,
    pub(crate) host: Box<dyn HostStack>,
    ready: Mutex<bool>,
}

impl DeviceBlock {
    pub(crate) fn new(
        config: DeviceConfig,
        attrs: MiniportAttrs,
        host: Box<dyn HostStack>,
    ) -> Self {
        Self {
            serialized: attrs.serialized,
            surprise_remove_ok: attrs.surprise_remove_ok,
            exclusion: Mutex::new(()),
            query_signal: Signal::new(),
            set_signal: Signal::new(),
            reset_signal: Signal::new(),
            pool: PacketPool::new(config.max_packets),
            segs: SegPool::new(config.max_segments),
            native_budget: SegBudget::new(config.host_segments),
            reclaim: ReclaimQueue::new(),
            host,
            ready: Mutex::new(false),
            config,
        }
    }

    /// Serialization gate: the exclusion lock wraps exactly one driver call
    /// and only when the driver declared it needs serializing. Never held
    /// across a completion wait.
    fn gated<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.serialized {
            let _gate = self.exclusion.lock();
            f()
        } else {
            f()
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if *self.ready.lock() {
            Ok(())
        } else {
            Err(Error::AdapterNotReady)
        }
    }

    fn set_ready(&self, ready: bool) {
        *self.ready.lock() = ready;
    }
}

/// Runs send-completion handling for one packet: detach the host backing,
/// return the packet to the arena, hand the chain back to the host. Invoked
/// exactly once per transmitted packet, inline or from the driver's
/// asynchronous callback.
pub(crate) fn complete_send(block: &DeviceBlock, packet: PacketHandle, status: DriverStatus) {
    let backing = block.pool.take_backing(packet);
    block.pool.free(packet, &block.segs);
    match backing {
        Some(chain) => block.host.send_done(chain, status),
        None => debug_assert!(false, "send completion for a packet without host backing"),
    }
}

#[derive(Clone, Copy)]
enum RequestKind {
    Query,
    Set,
}

impl RequestKind {
    fn name(self) -> &'static str {
        match self {
            RequestKind::Query => "query",
            RequestKind::Set => "set",
        }
    }
}

/// One attached adapter.
pub struct Device {
    block: Arc<DeviceBlock>,
    driver: StdArc<dyn Miniport>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Device {
    /// Wires a driver instance to the host stack and starts the deferred
    /// reclamation worker. The adapter stays unusable until [`Device::init`]
    /// succeeds.
    pub fn attach(
        driver: StdArc<dyn Miniport>,
        host: Box<dyn HostStack>,
        config: DeviceConfig,
    ) -> Result<Device> {
        let attrs = driver.attributes();
        let block = Arc::new(DeviceBlock::new(config, attrs, host));
        let worker = {
            let block = block.clone();
            let driver = driver.clone();
            thread::Builder::new()
                .name("miniwrap-return".into())
                .spawn(move || reclaim::drain(&block, &*driver))?
        };
        Ok(Device {
            block,
            driver,
            worker: Some(worker),
        })
    }

    /// The handle the driver uses for completions and indications. Handed to
    /// the driver at initialization; exposed for drivers wired up manually
    /// in tests and tools.
    pub fn handle(&self) -> AdapterHandle {
        AdapterHandle {
            block: self.block.clone(),
        }
    }

    /// Drives the driver's initialize entry point with the media the host
    /// supports. Failure leaves the adapter refusing every later operation.
    pub fn init(&self) -> Result<()> {
        let status = self
            .driver
            .initialize(self.handle(), &[Medium::Ethernet]);
        if status == DriverStatus::Success {
            self.block.set_ready(true);
            Ok(())
        } else {
            Err(Error::Driver(status))
        }
    }

    fn request_info(&self, kind: RequestKind, oid: Oid, buf: &mut [u8]) -> Result<InfoResult> {
        self.block.ensure_ready()?;
        let signal = match kind {
            RequestKind::Query => &self.block.query_signal,
            RequestKind::Set => &self.block.set_signal,
        };
        // Reset before issuing, so a stale completion from an earlier
        // request cannot satisfy this one.
        signal.reset();
        let view = unsafe { SegmentView::of_slice(buf) };
        let immediate = self.block.gated(|| match kind {
            RequestKind::Query => self.driver.query_info(oid, view),
            RequestKind::Set => self.driver.set_info(oid, view),
        });
        if immediate.status != DriverStatus::Pending {
            return Ok(immediate);
        }
        let timeout = self.block.config.request_timeout;
        match signal.wait(timeout) {
            Some(done) => Ok(done),
            None => {
                tracing::warn!(?oid, op = kind.name(), ?timeout, "completion never fired");
                Err(Error::RequestTimeout {
                    op: kind.name(),
                    timeout,
                })
            }
        }
    }

    /// Synchronous query. The driver may answer immediately or complete
    /// asynchronously; either way the final outcome is returned here.
    pub fn query_info(&self, oid: Oid, buf: &mut [u8]) -> Result<InfoResult> {
        self.request_info(RequestKind::Query, oid, buf)
    }

    /// Synchronous set, same protocol as [`Device::query_info`].
    pub fn set_info(&self, oid: Oid, buf: &mut [u8]) -> Result<InfoResult> {
        self.request_info(RequestKind::Set, oid, buf)
    }

    pub fn query_u32(&self, oid: Oid) -> Result<u32> {
        let mut buf = [0u8; 4];
        let done = self.query_info(oid, &mut buf)?;
        match done.status {
            DriverStatus::Success => Ok(u32::from_ne_bytes(buf)),
            status => Err(Error::Driver(status)),
        }
    }

    pub fn set_u32(&self, oid: Oid, val: u32) -> Result<()> {
        let mut buf = val.to_ne_bytes();
        let done = self.set_info(oid, &mut buf)?;
        match done.status {
            DriverStatus::Success => Ok(()),
            status => Err(Error::Driver(status)),
        }
    }

    pub fn query_mac(&self, oid: Oid) -> Result<MacAddress> {
        let mut buf = [0u8; 6];
        let done = self.query_info(oid, &mut buf)?;
        match done.status {
            DriverStatus::Success => Ok(MacAddress::new(buf)),
            status => Err(Error::Driver(status)),
        }
    }

    /// Resets the adapter, waiting out an asynchronous completion. The
    /// outcome carries the driver's addressing-reset flag as a passthrough.
    pub fn reset(&self) -> Result<ResetOutcome> {
        self.block.ensure_ready()?;
        self.block.reset_signal.reset();
        let immediate = self.block.gated(|| self.driver.reset());
        if immediate.status != DriverStatus::Pending {
            return Ok(immediate);
        }
        let timeout = self.block.config.request_timeout;
        match self.block.reset_signal.wait(timeout) {
            Some(done) => Ok(done),
            None => {
                tracing::warn!(?timeout, "reset completion never fired");
                Err(Error::RequestTimeout {
                    op: "reset",
                    timeout,
                })
            }
        }
    }

    /// Hands one packet to the driver's send entry point.
    ///
    /// A pending answer is reported as success; the driver finishes through
    /// [`AdapterHandle::send_complete`]. Any other answer runs completion
    /// handling inline and is returned.
    pub fn send_packet(&self, packet: PacketHandle) -> Result<DriverStatus> {
        self.block.ensure_ready()?;
        let status = self.block.gated(|| self.driver.send(packet));
        if status == DriverStatus::Pending {
            tracing::trace!(packet = u32::from(packet), "send pending");
            return Ok(DriverStatus::Success);
        }
        complete_send(&self.block, packet, status);
        Ok(status)
    }

    /// Hands a batch to the driver's multiple-send entry point, then
    /// completes every packet the driver neither consumed nor left pending.
    pub fn send_packets(&self, packets: &mut [Option<PacketHandle>]) -> Result<()> {
        self.block.ensure_ready()?;
        self.block.gated(|| self.driver.send_multiple(packets));
        for slot in packets.iter_mut() {
            let Some(packet) = *slot else { continue };
            let status = self.block.pool.status(packet);
            if status == DriverStatus::Pending {
                continue;
            }
            complete_send(&self.block, packet, status);
            *slot = None;
        }
        Ok(())
    }

    /// Converts a native chain to a foreign packet without sending it yet.
    /// The chain stays claimed as the packet's backing until completion.
    pub fn prepare(&self, chain: NativeChain) -> Result<PacketHandle> {
        self.block.ensure_ready()?;
        bridge::to_foreign(&self.block, chain)
    }

    /// Converts a native chain to a foreign packet and sends it.
    pub fn transmit(&self, chain: NativeChain) -> Result<DriverStatus> {
        let packet = self.prepare(chain)?;
        self.send_packet(packet)
    }

    /// Stops the adapter: flush the reclamation queue, stop the worker,
    /// then call the driver's halt entry point.
    pub fn halt(&mut self) {
        self.stop_worker();
        let was_ready = {
            let mut ready = self.block.ready.lock();
            std::mem::replace(&mut *ready, false)
        };
        if was_ready {
            self.driver.halt();
        }
    }

    pub fn shutdown(&self) {
        self.driver.shutdown();
    }

    /// Polls the driver's hang watchdog. Not gated: the watchdog runs
    /// concurrently with traffic by contract.
    pub fn check_for_hang(&self) -> bool {
        if self.block.ensure_ready().is_err() {
            return false;
        }
        self.driver.check_for_hang()
    }

    pub fn enable_interrupts(&self) {
        if self.block.ensure_ready().is_ok() {
            self.driver.enable_interrupts();
        }
    }

    pub fn disable_interrupts(&self) {
        if self.block.ensure_ready().is_ok() {
            self.driver.disable_interrupts();
        }
    }

    /// Forwards a plug-and-play event, honoring the surprise-removal
    /// attribute.
    pub fn pnp_event(&self, event: PnpEvent) {
        if let PnpEvent::SurpriseRemoved = event {
            if !self.block.surprise_remove_ok {
                return;
            }
        }
        self.driver.pnp_event(event);
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.block.reclaim.stop();
            let _ = worker.join();
        }
    }

    #[cfg(test)]
    pub(crate) fn block(&self) -> &Arc<DeviceBlock> {
        &self.block
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

/// The driver's view of its adapter: completion callbacks, receive
/// indication, and packet-arena access.
///
/// Every method is bounded and non-blocking; the driver may call them from
/// its own elevated execution context.
#[derive(Clone)]
pub struct AdapterHandle {
    block: Arc<DeviceBlock>,
}

impl AdapterHandle {
    /// Allocates an empty foreign packet, typically for a receive
    /// indication.
    pub fn alloc_packet(&self) -> Result<PacketHandle> {
        self.block.pool.alloc().ok_or(Error::OutOfResources)
    }

    /// Appends one descriptor aliasing `view` to the packet's chain.
    pub fn append_segment(&self, packet: PacketHandle, view: SegmentView) -> Result<SegId> {
        let id = self.block.segs.alloc(view).ok_or(Error::OutOfResources)?;
        self.block.pool.append(packet, id, &self.block.segs);
        Ok(id)
    }

    /// Frees a packet the driver owns again (after return or on its own
    /// error paths).
    pub fn free_packet(&self, packet: PacketHandle) {
        self.block.pool.free(packet, &self.block.segs);
    }

    pub fn packet_status(&self, packet: PacketHandle) -> DriverStatus {
        self.block.pool.status(packet)
    }

    pub fn set_packet_status(&self, packet: PacketHandle, status: DriverStatus) {
        self.block.pool.set_status(packet, status);
    }

    pub fn total_len(&self, packet: PacketHandle) -> u32 {
        self.block.pool.total_len(packet)
    }

    /// The packet's segment views in transmission order.
    pub fn segments(&self, packet: PacketHandle) -> SmallVec<[SegmentView; 8]> {
        self.block.pool.views(packet, &self.block.segs)
    }

    /// Completion of an asynchronous query.
    pub fn query_done(&self, result: InfoResult) {
        self.block.query_signal.fire(result);
    }

    /// Completion of an asynchronous set.
    pub fn set_done(&self, result: InfoResult) {
        self.block.set_signal.fire(result);
    }

    /// Completion of an asynchronous reset.
    pub fn reset_done(&self, status: DriverStatus, addressing_reset: bool) {
        self.block.reset_signal.fire(ResetOutcome {
            status,
            addressing_reset,
        });
    }

    /// Completion of a send the driver earlier answered with the pending
    /// sentinel.
    pub fn send_complete(&self, packet: PacketHandle, status: DriverStatus) {
        complete_send(&self.block, packet, status);
    }

    /// Delivers received packets to the host stack. Conversion failures
    /// route the packet straight back to the driver through the
    /// reclamation queue.
    pub fn indicate_receive(&self, packets: &[PacketHandle]) {
        for &packet in packets {
            match bridge::to_native(&self.block, packet) {
                Ok(chain) => self.block.host.receive(chain),
                Err(err) => {
                    tracing::debug!(packet = u32::from(packet), %err, "receive indication dropped");
                    self.block.reclaim.push(packet);
                }
            }
        }
    }

    pub fn indicate_status(&self, status: DriverStatus) {
        self.block.host.indicate_status(status);
    }

    pub fn status_complete(&self) {
        self.block.host.status_complete();
    }

    pub fn resources_available(&self) {
        self.block.host.resources_available();
    }
}
