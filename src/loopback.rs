//! Software loopback miniport.
//!
//! Behaves like a serialized hardware driver: transmitted frames are copied
//! into adapter-owned receive buffers (the device's own DMA, not the
//! bridge's) and indicated back to the host. Exercises both bridge
//! directions, per-packet status, and the reclamation path end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use eui48::MacAddress;
use parking_lot::Mutex;

use crate::device::AdapterHandle;
use crate::driver::{InfoResult, Miniport, MiniportAttrs, ResetOutcome};
use crate::packet::PacketHandle;
use crate::status::{DriverStatus, Medium, Oid};
use crate::view::SegmentView;

/// Link speed reported to the host, in units of 100 bit/s.
const LINK_SPEED_100BPS: u32 = 10_000_000;

struct LoopState {
    handle: Option<AdapterHandle>,
    bufs: Vec<Box<[u8]>>,
    free: Vec<usize>,
    live: HashMap<PacketHandle, usize>,
}

pub struct Loopback {
    mac: MacAddress,
    mtu: u32,
    state: Mutex<LoopState>,
    packet_filter: AtomicU32,
    lookahead: AtomicU32,
    starved: AtomicBool,
}

impl Loopback {
    /// `rx_bufs` receive buffers of `buf_len` bytes each back the echo path.
    pub fn new(mac: MacAddress, rx_bufs: usize, buf_len: usize) -> Self {
        let bufs = (0..rx_bufs)
            .map(|_| vec![0u8; buf_len].into_boxed_slice())
            .collect();
        Self {
            mac,
            mtu: 1500,
            state: Mutex::new(LoopState {
                handle: None,
                bufs,
                free: (0..rx_bufs).collect(),
                live: HashMap::new(),
            }),
            packet_filter: AtomicU32::new(0),
            lookahead: AtomicU32::new(256),
            starved: AtomicBool::new(false),
        }
    }

    fn echo(&self, packet: PacketHandle) -> DriverStatus {
        let (handle, rx) = {
            let mut st = self.state.lock();
            let Some(handle) = st.handle.clone() else {
                return DriverStatus::DeviceFailed;
            };
            let total = handle.total_len(packet) as usize;
            let Some(idx) = st.free.pop() else {
                self.starved.store(true, Ordering::Release);
                return DriverStatus::Resources;
            };
            if total > st.bufs[idx].len() {
                st.free.push(idx);
                return DriverStatus::InvalidLength;
            }
            let mut off = 0;
            for view in handle.segments(packet) {
                let bytes = unsafe { view.slice() };
                st.bufs[idx][off..off + bytes.len()].copy_from_slice(bytes);
                off += bytes.len();
            }
            let rx = match handle.alloc_packet() {
                Ok(rx) => rx,
                Err(_) => {
                    st.free.push(idx);
                    self.starved.store(true, Ordering::Release);
                    return DriverStatus::Resources;
                }
            };
            let view = unsafe { SegmentView::of_slice(&mut st.bufs[idx][..off]) };
            if handle.append_segment(rx, view).is_err() {
                handle.free_packet(rx);
                st.free.push(idx);
                self.starved.store(true, Ordering::Release);
                return DriverStatus::Resources;
            }
            st.live.insert(rx, idx);
            (handle, rx)
        };
        handle.indicate_receive(&[rx]);
        DriverStatus::Success
    }

    fn fill(out: &mut [u8], val: &[u8]) -> InfoResult {
        if out.len() < val.len() {
            return InfoResult::done(DriverStatus::InvalidLength, 0, val.len() as u32);
        }
        out[..val.len()].copy_from_slice(val);
        InfoResult::done(DriverStatus::Success, val.len() as u32, 0)
    }

    fn store_u32(target: &AtomicU32, buf: &[u8]) -> InfoResult {
        if buf.len() < 4 {
            return InfoResult::done(DriverStatus::InvalidLength, 0, 4);
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[..4]);
        target.store(u32::from_ne_bytes(raw), Ordering::Release);
        InfoResult::done(DriverStatus::Success, 4, 0)
    }

    #[cfg(test)]
    pub(crate) fn free_rx(&self) -> usize {
        self.state.lock().free.len()
    }
}

impl Miniport for Loopback {
    fn attributes(&self) -> MiniportAttrs {
        MiniportAttrs {
            serialized: true,
            surprise_remove_ok: true,
        }
    }

    fn initialize(&self, handle: AdapterHandle, mediums: &[Medium]) -> DriverStatus {
        if !mediums.contains(&Medium::Ethernet) {
            return DriverStatus::NotSupported;
        }
        self.state.lock().handle = Some(handle);
        DriverStatus::Success
    }

    fn halt(&self) {
        let mut st = self.state.lock();
        st.handle = None;
        st.live.clear();
    }

    fn reset(&self) -> ResetOutcome {
        ResetOutcome {
            status: DriverStatus::Success,
            addressing_reset: false,
        }
    }

    fn query_info(&self, oid: Oid, buf: SegmentView) -> InfoResult {
        let out = unsafe { buf.slice_mut() };
        match oid {
            Oid::X802_3_CURRENT_ADDRESS | Oid::X802_3_PERMANENT_ADDRESS => {
                Self::fill(out, self.mac.as_bytes())
            }
            Oid::GEN_MAXIMUM_FRAME_SIZE => Self::fill(out, &self.mtu.to_ne_bytes()),
            Oid::GEN_LINK_SPEED => Self::fill(out, &LINK_SPEED_100BPS.to_ne_bytes()),
            Oid::GEN_MEDIA_CONNECT_STATUS => Self::fill(out, &0u32.to_ne_bytes()),
            Oid::GEN_CURRENT_PACKET_FILTER => {
                Self::fill(out, &self.packet_filter.load(Ordering::Acquire).to_ne_bytes())
            }
            Oid::GEN_CURRENT_LOOKAHEAD => {
                Self::fill(out, &self.lookahead.load(Ordering::Acquire).to_ne_bytes())
            }
            _ => InfoResult::done(DriverStatus::NotSupported, 0, 0),
        }
    }

    fn set_info(&self, oid: Oid, buf: SegmentView) -> InfoResult {
        let input = unsafe { buf.slice() };
        match oid {
            Oid::GEN_CURRENT_PACKET_FILTER => Self::store_u32(&self.packet_filter, input),
            Oid::GEN_CURRENT_LOOKAHEAD => Self::store_u32(&self.lookahead, input),
            _ => InfoResult::done(DriverStatus::NotSupported, 0, 0),
        }
    }

    fn send(&self, packet: PacketHandle) -> DriverStatus {
        self.echo(packet)
    }

    fn send_multiple(&self, packets: &mut [Option<PacketHandle>]) {
        for slot in packets.iter_mut() {
            let Some(packet) = *slot else { continue };
            let status = self.echo(packet);
            if let Some(handle) = self.state.lock().handle.clone() {
                handle.set_packet_status(packet, status);
            }
        }
    }

    fn return_packet(&self, packet: PacketHandle) {
        let handle = {
            let mut st = self.state.lock();
            let Some(handle) = st.handle.clone() else {
                return;
            };
            if let Some(idx) = st.live.remove(&packet) {
                st.free.push(idx);
            }
            handle.free_packet(packet);
            handle
        };
        if self.starved.swap(false, Ordering::AcqRel) {
            handle.resources_available();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceConfig};
    use crate::driver::HostStack;
    use crate::native::{NativeChain, NativeSeg};
    use crate::testutil::{leak_buf, RecordingHost};
    use std::sync::atomic::AtomicU32 as StdAtomicU32;
    use std::sync::Arc as StdArc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn mac() -> MacAddress {
        MacAddress::new([0x02, 0x4c, 0x4f, 0x4f, 0x50, 0x01])
    }

    fn frame(len: usize) -> &'static mut [u8] {
        let buf = leak_buf(len);
        for (i, b) in buf.iter_mut().enumerate() {
            *b = i as u8;
        }
        // IPv4 ether type.
        buf[12] = 0x08;
        buf[13] = 0x00;
        buf
    }

    fn chain_of(buf: &'static mut [u8]) -> NativeChain {
        let mut chain = NativeChain::new();
        chain.push(NativeSeg::new(unsafe { SegmentView::of_slice(buf) }));
        chain
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition never became true");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn echoed_frame_reaches_the_host_intact() {
        let driver = StdArc::new(Loopback::new(mac(), 8, 2048));
        let host = RecordingHost::default();
        let dev = Device::attach(
            driver.clone(),
            Box::new(host.clone()),
            DeviceConfig::default(),
        )
        .unwrap();
        dev.init().unwrap();

        let buf = frame(128);
        let expect = buf.to_vec();
        assert_eq!(dev.transmit(chain_of(buf)).unwrap(), DriverStatus::Success);

        assert_eq!(*host.0.received.lock(), vec![expect]);
        assert_eq!(*host.0.send_done.lock(), vec![DriverStatus::Success]);

        // The host released the chain on delivery; the worker hands the
        // packet back and the adapter reclaims its receive buffer.
        wait_until(|| driver.free_rx() == 8);
        assert_eq!(
            dev.block().pool.free_count(),
            dev.block().config.max_packets
        );
    }

    #[test]
    fn batch_send_echoes_every_frame() {
        let driver = StdArc::new(Loopback::new(mac(), 8, 2048));
        let host = RecordingHost::default();
        let dev = Device::attach(
            driver.clone(),
            Box::new(host.clone()),
            DeviceConfig::default(),
        )
        .unwrap();
        dev.init().unwrap();

        let mut batch: Vec<Option<_>> = (0..4)
            .map(|_| Some(dev.prepare(chain_of(frame(96))).unwrap()))
            .collect();
        dev.send_packets(&mut batch).unwrap();
        assert!(batch.iter().all(Option::is_none));
        assert_eq!(host.0.received.lock().len(), 4);
        assert_eq!(host.0.send_done.lock().len(), 4);
    }

    struct StarveHost {
        chains: Mutex<Vec<NativeChain>>,
        resources: StdAtomicU32,
    }

    impl HostStack for StarveHost {
        fn receive(&self, chain: NativeChain) {
            self.chains.lock().push(chain);
        }
        fn send_done(&self, _chain: NativeChain, _status: DriverStatus) {}
        fn resources_available(&self) {
            self.resources.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn starvation_reports_resources_and_recovers() {
        let driver = StdArc::new(Loopback::new(mac(), 1, 2048));
        let host = StdArc::new(StarveHost {
            chains: Mutex::new(Vec::new()),
            resources: StdAtomicU32::new(0),
        });
        struct Fwd(StdArc<StarveHost>);
        impl HostStack for Fwd {
            fn receive(&self, chain: NativeChain) {
                self.0.receive(chain)
            }
            fn send_done(&self, chain: NativeChain, status: DriverStatus) {
                self.0.send_done(chain, status)
            }
            fn resources_available(&self) {
                self.0.resources_available()
            }
        }
        let dev = Device::attach(
            driver.clone(),
            Box::new(Fwd(host.clone())),
            DeviceConfig::default(),
        )
        .unwrap();
        dev.init().unwrap();

        assert_eq!(dev.transmit(chain_of(frame(64))).unwrap(), DriverStatus::Success);
        // Only receive buffer is parked at the host; the next send starves.
        assert_eq!(
            dev.transmit(chain_of(frame(64))).unwrap(),
            DriverStatus::Resources
        );

        host.chains.lock().clear();
        wait_until(|| host.resources.load(std::sync::atomic::Ordering::SeqCst) == 1);
        wait_until(|| driver.free_rx() == 1);
        assert_eq!(dev.transmit(chain_of(frame(64))).unwrap(), DriverStatus::Success);
    }

    #[test]
    fn info_requests_answer_from_adapter_state() {
        let driver = StdArc::new(Loopback::new(mac(), 4, 2048));
        let dev = Device::attach(
            driver,
            Box::new(RecordingHost::default()),
            DeviceConfig::default(),
        )
        .unwrap();
        dev.init().unwrap();

        assert_eq!(dev.query_mac(Oid::X802_3_CURRENT_ADDRESS).unwrap(), mac());
        assert_eq!(
            dev.query_u32(Oid::GEN_MAXIMUM_FRAME_SIZE).unwrap(),
            1500
        );
        dev.set_u32(Oid::GEN_CURRENT_PACKET_FILTER, 0x2b).unwrap();
        assert_eq!(
            dev.query_u32(Oid::GEN_CURRENT_PACKET_FILTER).unwrap(),
            0x2b
        );

        // Undersized buffer: the driver reports how much it needed.
        let mut short = [0u8; 2];
        let done = dev
            .query_info(Oid::X802_3_CURRENT_ADDRESS, &mut short)
            .unwrap();
        assert_eq!(done.status, DriverStatus::InvalidLength);
        assert_eq!(done.needed, 6);

        assert!(matches!(
            dev.query_u32(Oid::from(0xdead_0000)).unwrap_err(),
            crate::errors::Error::Driver(DriverStatus::NotSupported)
        ));
    }
}
