//! The host stack's packet representation.
//!
//! A native chain is an ordered run of segments; the first position carries
//! the packet-level total length. Segments built by the bridge from a
//! foreign packet are armed with a release hook so the lifetime tracker
//! learns, segment by segment, when the host is done with the aliased
//! memory.

use std::sync::atomic::{AtomicUsize, Ordering};

use triomphe::Arc;

use crate::device::DeviceBlock;
use crate::packet::PacketHandle;
use crate::reclaim;
use crate::view::SegmentView;

/// Budget of native segments the host side is willing to have outstanding.
/// Exhaustion is the out-of-resources condition of the receive bridge.
pub(crate) struct SegBudget(AtomicUsize);

impl SegBudget {
    pub(crate) fn new(limit: usize) -> Self {
        Self(AtomicUsize::new(limit))
    }

    pub(crate) fn try_acquire(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Release callback attached to a native segment, carrying the owning
/// foreign packet as context.
pub(crate) struct ReleaseHook {
    pub(crate) block: Arc<DeviceBlock>,
    pub(crate) packet: PacketHandle,
}

impl ReleaseHook {
    fn fire(self) {
        self.block.native_budget.release();
        reclaim::release_reference(&self.block, self.packet);
    }

    /// Returns the segment budget without touching the packet's reference
    /// count. Used when unwinding a partially built chain.
    fn cancel(self) {
        self.block.native_budget.release();
    }
}

/// One native buffer segment. Dropping it fires the release hook, if armed,
/// exactly once.
pub struct NativeSeg {
    view: SegmentView,
    hook: Option<ReleaseHook>,
}

impl NativeSeg {
    /// A segment without a release hook, aliasing host-owned memory.
    pub fn new(view: SegmentView) -> Self {
        Self { view, hook: None }
    }

    pub(crate) fn with_hook(view: SegmentView, hook: ReleaseHook) -> Self {
        Self {
            view,
            hook: Some(hook),
        }
    }

    pub fn len(&self) -> usize {
        self.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    pub fn view(&self) -> SegmentView {
        self.view
    }

    /// # Safety
    ///
    /// See [`SegmentView::slice`].
    pub unsafe fn bytes<'a>(&self) -> &'a [u8] {
        unsafe { self.view.slice() }
    }

    pub(crate) fn shrink(&mut self, len: usize) {
        self.view.truncate(len);
    }

    pub(crate) fn disarm(&mut self) {
        if let Some(hook) = self.hook.take() {
            hook.cancel();
        }
    }
}

impl Drop for NativeSeg {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            hook.fire();
        }
    }
}

/// An ordered native buffer chain with its declared total length.
pub struct NativeChain {
    segs: Vec<NativeSeg>,
    total_len: u32,
}

impl NativeChain {
    pub fn new() -> Self {
        Self {
            segs: Vec::new(),
            total_len: 0,
        }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            segs: Vec::with_capacity(n),
            total_len: 0,
        }
    }

    pub fn push(&mut self, seg: NativeSeg) {
        self.total_len += seg.len() as u32;
        self.segs.push(seg);
    }

    pub fn total_len(&self) -> u32 {
        self.total_len
    }

    pub fn len(&self) -> usize {
        self.segs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&NativeSeg> {
        self.segs.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NativeSeg> {
        self.segs.iter()
    }

    /// Copies the chain's payload into one contiguous buffer. A host-side
    /// convenience; the bridge itself never copies.
    pub fn copy_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len as usize);
        let mut remaining = self.total_len as usize;
        for seg in &self.segs {
            let take = remaining.min(seg.len());
            out.extend_from_slice(unsafe { &seg.bytes()[..take] });
            remaining -= take;
        }
        out
    }

    /// Cuts the chain down to `max` bytes, shortening or dropping segments
    /// from the tail. Dropped segments fire their release hooks.
    pub(crate) fn truncate_to(&mut self, max: u32) {
        let mut excess = (self.total_len - max) as usize;
        while excess > 0 {
            let last = match self.segs.last_mut() {
                Some(seg) => seg,
                None => break,
            };
            let len = last.len();
            if len <= excess {
                self.segs.pop();
                excess -= len;
            } else {
                last.shrink(len - excess);
                excess = 0;
            }
        }
        self.total_len = max;
    }

    /// Disarms every hook and drops the chain without reference-count side
    /// effects. Unwind path of the bridge.
    pub(crate) fn abandon(mut self) {
        for seg in &mut self.segs {
            seg.disarm();
        }
    }
}

impl Default for NativeChain {
    fn default() -> Self {
        Self::new()
    }
}

impl IntoIterator for NativeChain {
    type Item = NativeSeg;
    type IntoIter = std::vec::IntoIter<NativeSeg>;

    fn into_iter(self) -> Self::IntoIter {
        self.segs.into_iter()
    }
}
