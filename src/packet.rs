//! Foreign packet and buffer-descriptor arenas.
//!
//! The foreign driver model works with packet objects that carry an ordered
//! chain of buffer descriptors. Both live in fixed-capacity arenas and are
//! addressed by index handles; descriptor chains link through indices rather
//! than pointers, so no raw aliasing crosses the ownership boundary
//! implicitly.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::native::NativeChain;
use crate::status::DriverStatus;
use crate::view::SegmentView;

/// Handle addressing one foreign packet in its arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PacketHandle(pub(crate) u32);

impl From<u32> for PacketHandle {
    fn from(val: u32) -> Self {
        Self(val)
    }
}

impl From<PacketHandle> for u32 {
    fn from(val: PacketHandle) -> u32 {
        val.0
    }
}

/// Handle addressing one buffer descriptor in its arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SegId(pub(crate) u32);

impl From<u32> for SegId {
    fn from(val: u32) -> Self {
        Self(val)
    }
}

impl From<SegId> for u32 {
    fn from(val: SegId) -> u32 {
        val.0
    }
}

#[derive(Clone, Copy)]
struct SegSlot {
    view: SegmentView,
    next: Option<SegId>,
}

/// Arena of buffer descriptors: a view plus a next-link, owned by the shim,
/// aliasing memory owned by one side or the other.
pub(crate) struct SegPool {
    slots: Box<[Mutex<Option<SegSlot>>]>,
    free: Mutex<Vec<u32>>,
}

impl SegPool {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Mutex::new(None));
        }
        Self {
            slots: slots.into_boxed_slice(),
            free: Mutex::new((0..capacity as u32).rev().collect()),
        }
    }

    pub(crate) fn alloc(&self, view: SegmentView) -> Option<SegId> {
        let idx = self.free.lock().pop()?;
        *self.slots[idx as usize].lock() = Some(SegSlot { view, next: None });
        Some(SegId(idx))
    }

    pub(crate) fn free(&self, id: SegId) {
        let prev = self.slots[id.0 as usize].lock().take();
        debug_assert!(prev.is_some(), "freeing an unallocated descriptor");
        self.free.lock().push(id.0);
    }

    fn get(&self, id: SegId) -> SegSlot {
        let slot = self.slots[id.0 as usize].lock();
        match *slot {
            Some(s) => s,
            None => panic!("dangling descriptor {:?}", id),
        }
    }

    fn set_next(&self, id: SegId, next: Option<SegId>) {
        if let Some(slot) = self.slots[id.0 as usize].lock().as_mut() {
            slot.next = next;
        }
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

struct PacketState {
    head: Option<SegId>,
    tail: Option<SegId>,
    total_len: u32,
    status: DriverStatus,
    backing: Option<NativeChain>,
}

impl PacketState {
    fn cleared() -> Self {
        Self {
            head: None,
            tail: None,
            total_len: 0,
            status: DriverStatus::Success,
            backing: None,
        }
    }
}

struct PacketSlot {
    refs: AtomicU32,
    state: Mutex<PacketState>,
}

/// Arena of foreign packets.
///
/// The reference count tracks live native aliases of the packet's memory;
/// the lifetime tracker performs the final decrement-and-test, so the count
/// must be atomic with respect to release hooks firing from different host
/// contexts concurrently.
pub(crate) struct PacketPool {
    slots: Box<[PacketSlot]>,
    free: Mutex<Vec<u32>>,
}

impl PacketPool {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(PacketSlot {
                refs: AtomicU32::new(0),
                state: Mutex::new(PacketState::cleared()),
            });
        }
        Self {
            slots: slots.into_boxed_slice(),
            free: Mutex::new((0..capacity as u32).rev().collect()),
        }
    }

    pub(crate) fn alloc(&self) -> Option<PacketHandle> {
        let idx = self.free.lock().pop()?;
        let slot = &self.slots[idx as usize];
        slot.refs.store(0, Ordering::Relaxed);
        *slot.state.lock() = PacketState::cleared();
        Some(PacketHandle(idx))
    }

    /// Returns the packet and its descriptor chain to the arenas. The tx
    /// backing chain, if any, is dropped here and with it the host's claim
    /// on the aliased memory.
    pub(crate) fn free(&self, handle: PacketHandle, segs: &SegPool) {
        let slot = &self.slots[handle.0 as usize];
        debug_assert_eq!(
            slot.refs.load(Ordering::Acquire),
            0,
            "freeing a packet with live native aliases"
        );
        let state = std::mem::replace(&mut *slot.state.lock(), PacketState::cleared());
        let mut cur = state.head;
        while let Some(id) = cur {
            cur = segs.get(id).next;
            segs.free(id);
        }
        self.free.lock().push(handle.0);
    }

    /// Appends a descriptor to the packet's chain, keeping transmission
    /// order, and accounts its length into the declared total.
    pub(crate) fn append(&self, handle: PacketHandle, id: SegId, segs: &SegPool) {
        let mut state = self.slots[handle.0 as usize].state.lock();
        match state.tail {
            Some(tail) => segs.set_next(tail, Some(id)),
            None => state.head = Some(id),
        }
        state.tail = Some(id);
        state.total_len += segs.get(id).view.len() as u32;
    }

    /// The packet's views in transmission order.
    pub(crate) fn views(&self, handle: PacketHandle, segs: &SegPool) -> SmallVec<[SegmentView; 8]> {
        let mut out = SmallVec::new();
        let mut cur = self.slots[handle.0 as usize].state.lock().head;
        while let Some(id) = cur {
            let slot = segs.get(id);
            out.push(slot.view);
            cur = slot.next;
        }
        out
    }

    pub(crate) fn total_len(&self, handle: PacketHandle) -> u32 {
        self.slots[handle.0 as usize].state.lock().total_len
    }

    pub(crate) fn status(&self, handle: PacketHandle) -> DriverStatus {
        self.slots[handle.0 as usize].state.lock().status
    }

    pub(crate) fn set_status(&self, handle: PacketHandle, status: DriverStatus) {
        self.slots[handle.0 as usize].state.lock().status = status;
    }

    pub(crate) fn set_backing(&self, handle: PacketHandle, chain: NativeChain) {
        self.slots[handle.0 as usize].state.lock().backing = Some(chain);
    }

    pub(crate) fn take_backing(&self, handle: PacketHandle) -> Option<NativeChain> {
        self.slots[handle.0 as usize].state.lock().backing.take()
    }

    pub(crate) fn ref_reset(&self, handle: PacketHandle) {
        self.slots[handle.0 as usize].refs.store(0, Ordering::Release);
    }

    pub(crate) fn ref_inc(&self, handle: PacketHandle) {
        self.slots[handle.0 as usize]
            .refs
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements and returns the remaining count. The 1 -> 0 transition is
    /// observed by exactly one caller.
    pub(crate) fn ref_dec(&self, handle: PacketHandle) -> u32 {
        let prev = self.slots[handle.0 as usize]
            .refs
            .fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "reference underflow on {:?}", handle);
        prev - 1
    }

    #[cfg(test)]
    pub(crate) fn refs(&self, handle: PacketHandle) -> u32 {
        self.slots[handle.0 as usize].refs.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_of(buf: &mut [u8]) -> SegmentView {
        unsafe { SegmentView::of_slice(buf) }
    }

    #[test]
    fn chain_keeps_transmission_order() {
        let pool = PacketPool::new(4);
        let segs = SegPool::new(8);
        let mut a = vec![0u8; 10];
        let mut b = vec![0u8; 20];
        let mut c = vec![0u8; 30];

        let h = pool.alloc().unwrap();
        for buf in [&mut a, &mut b, &mut c] {
            let id = segs.alloc(view_of(buf)).unwrap();
            pool.append(h, id, &segs);
        }

        let views = pool.views(h, &segs);
        assert_eq!(
            views.iter().map(|v| v.len()).collect::<Vec<_>>(),
            vec![10, 20, 30]
        );
        assert_eq!(pool.total_len(h), 60);

        pool.free(h, &segs);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(segs.free_count(), 8);
    }

    #[test]
    fn alloc_fails_when_exhausted() {
        let pool = PacketPool::new(1);
        let h = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        pool.free(h, &SegPool::new(1));
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn refcount_transitions() {
        let pool = PacketPool::new(1);
        let h = pool.alloc().unwrap();
        pool.ref_inc(h);
        pool.ref_inc(h);
        assert_eq!(pool.ref_dec(h), 1);
        assert_eq!(pool.ref_dec(h), 0);
    }
}
