//! Shared fixtures for the in-module test suites.

use std::sync::Arc as StdArc;

use parking_lot::Mutex;
use triomphe::Arc;

use crate::device::{DeviceBlock, DeviceConfig};
use crate::driver::{HostStack, MiniportAttrs};
use crate::native::{NativeChain, NativeSeg};
use crate::status::DriverStatus;
use crate::view::SegmentView;

/// Leaked zeroed buffer standing in for memory owned by one side of the
/// shim for the whole test run.
pub(crate) fn leak_buf(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

/// Host-built transmit chain over leaked buffers.
pub(crate) fn tx_chain(bufs: Vec<&'static mut [u8]>) -> NativeChain {
    let mut chain = NativeChain::with_capacity(bufs.len());
    for buf in bufs {
        chain.push(NativeSeg::new(unsafe { SegmentView::of_slice(buf) }));
    }
    chain
}

pub(crate) struct NullHost;

impl HostStack for NullHost {
    fn receive(&self, _chain: NativeChain) {}
    fn send_done(&self, _chain: NativeChain, _status: DriverStatus) {}
}

pub(crate) fn test_block(config: DeviceConfig) -> Arc<DeviceBlock> {
    Arc::new(DeviceBlock::new(
        config,
        MiniportAttrs::default(),
        Box::new(NullHost),
    ))
}

#[derive(Default)]
pub(crate) struct HostLog {
    pub(crate) received: Mutex<Vec<Vec<u8>>>,
    pub(crate) send_done: Mutex<Vec<DriverStatus>>,
}

/// Host stack that records deliveries and releases chains immediately.
#[derive(Clone, Default)]
pub(crate) struct RecordingHost(pub(crate) StdArc<HostLog>);

impl HostStack for RecordingHost {
    fn receive(&self, chain: NativeChain) {
        self.0.received.lock().push(chain.copy_to_vec());
    }

    fn send_done(&self, _chain: NativeChain, status: DriverStatus) {
        self.0.send_done.lock().push(status);
    }
}

/// Host stack that parks received chains so a test controls release order.
#[derive(Clone, Default)]
pub(crate) struct HoldingHost(pub(crate) StdArc<Mutex<Vec<NativeChain>>>);

impl HostStack for HoldingHost {
    fn receive(&self, chain: NativeChain) {
        self.0.lock().push(chain);
    }

    fn send_done(&self, _chain: NativeChain, _status: DriverStatus) {}
}
