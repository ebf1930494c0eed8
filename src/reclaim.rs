//! Packet lifetime tracking and deferred reclamation.
//!
//! Native segments built by the bridge alias memory the driver owns. Each
//! released segment drops one reference; the final drop queues the packet
//! for return to the driver. The return itself happens on a worker thread
//! because release hooks may fire from contexts that must not block and
//! must never call into the driver.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use triomphe::Arc;

use crate::device::DeviceBlock;
use crate::driver::Miniport;
use crate::packet::PacketHandle;

/// Packets fully dereferenced and awaiting return to the driver, FIFO.
///
/// Guarded by its own lock, distinct from the exclusion lock: pushes happen
/// from release hooks that may already run under host locks, and the drain
/// side must be able to call the driver without holding anything here.
pub(crate) struct ReclaimQueue {
    queue: Mutex<VecDeque<PacketHandle>>,
    ready: Condvar,
    shutdown: AtomicBool,
}

impl ReclaimQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Non-blocking enqueue plus worker wake-up.
    pub(crate) fn push(&self, packet: PacketHandle) {
        self.queue.lock().push_back(packet);
        self.ready.notify_one();
    }

    /// Tells the worker to finish the queue and exit.
    pub(crate) fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.ready.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<PacketHandle> {
        self.queue.lock().iter().copied().collect()
    }
}

/// Drops one native alias of `packet`. On the final release the packet goes
/// onto the reclamation queue. Never blocks, never calls the driver.
pub(crate) fn release_reference(block: &Arc<DeviceBlock>, packet: PacketHandle) {
    let remaining = block.pool.ref_dec(packet);
    if remaining > 0 {
        return;
    }
    block.reclaim.push(packet);
}

/// Worker loop: return queued packets to the driver, one at a time, with
/// the queue lock dropped around the driver call. The driver's return
/// routine may take its own locks or re-enter the adapter, so holding the
/// queue lock across it is not an option.
pub(crate) fn drain(block: &Arc<DeviceBlock>, driver: &dyn Miniport) {
    let mut queue = block.reclaim.queue.lock();
    loop {
        if let Some(packet) = queue.pop_front() {
            drop(queue);
            tracing::trace!(packet = u32::from(packet), "returning packet to driver");
            driver.return_packet(packet);
            queue = block.reclaim.queue.lock();
        } else if block.reclaim.shutdown.load(Ordering::Acquire) {
            return;
        } else {
            block.reclaim.ready.wait(&mut queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge;
    use crate::device::DeviceConfig;
    use crate::testutil::{leak_buf, test_block};
    use crate::view::SegmentView;

    fn rx_packet(block: &Arc<DeviceBlock>, lens: &[usize]) -> PacketHandle {
        let packet = block.pool.alloc().unwrap();
        for &len in lens {
            let view = unsafe { SegmentView::of_slice(leak_buf(len)) };
            let id = block.segs.alloc(view).unwrap();
            block.pool.append(packet, id, &block.segs);
        }
        packet
    }

    #[test]
    fn reclaim_fires_only_on_last_release() {
        let block = test_block(DeviceConfig::default());
        let packet = rx_packet(&block, &[20, 20, 20]);
        let chain = bridge::to_native(&block, packet).unwrap();
        assert_eq!(block.pool.refs(packet), 3);

        let mut segs: Vec<_> = chain.into_iter().collect();
        segs.pop();
        segs.pop();
        assert_eq!(block.pool.refs(packet), 1);
        assert!(block.reclaim.is_empty());

        segs.pop();
        assert_eq!(block.pool.refs(packet), 0);
        assert_eq!(block.reclaim.snapshot(), vec![packet]);
    }

    #[test]
    fn fully_dereferenced_packets_queue_in_fifo_order() {
        let block = test_block(DeviceConfig::default());
        let a = rx_packet(&block, &[20]);
        let b = rx_packet(&block, &[20]);
        let c = rx_packet(&block, &[20]);

        let chain_a = bridge::to_native(&block, a).unwrap();
        let chain_b = bridge::to_native(&block, b).unwrap();
        let chain_c = bridge::to_native(&block, c).unwrap();

        drop(chain_a);
        drop(chain_b);
        drop(chain_c);
        assert_eq!(block.reclaim.snapshot(), vec![a, b, c]);
    }

    #[test]
    fn budget_returns_with_each_release() {
        let config = DeviceConfig {
            host_segments: 4,
            ..DeviceConfig::default()
        };
        let block = test_block(config);
        let packet = rx_packet(&block, &[20, 20]);
        let chain = bridge::to_native(&block, packet).unwrap();
        assert_eq!(block.native_budget.available(), 2);
        drop(chain);
        assert_eq!(block.native_budget.available(), 4);
    }
}
