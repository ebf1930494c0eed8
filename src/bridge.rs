//! Conversion between the foreign and native packet representations.
//!
//! Both directions alias the payload region; no payload byte is ever
//! copied. `to_native` maps a foreign packet's descriptor chain to a native
//! chain for delivery into the host stack; `to_foreign` maps a native chain
//! onto a freshly allocated foreign packet for the driver's send path.

use etherparse::{EtherType, Ethernet2HeaderSlice};
use smallvec::SmallVec;
use triomphe::Arc;

use crate::device::DeviceBlock;
use crate::errors::{Error, Result};
use crate::native::{NativeChain, NativeSeg, ReleaseHook};
use crate::packet::PacketHandle;

const ETHER_HDR_LEN: usize = 14;
const VLAN_ENCAP_LEN: u32 = 4;

/// Largest on-wire frame the host will accept for the given Ethernet type.
/// Some drivers overpad their frames; anything beyond this is clamped.
fn max_frame_len(mtu: u32, first: &NativeSeg) -> u32 {
    let mut max = mtu + ETHER_HDR_LEN as u32;
    if first.len() >= ETHER_HDR_LEN {
        let header = unsafe { &first.bytes()[..ETHER_HDR_LEN] };
        if let Ok(eth) = Ethernet2HeaderSlice::from_slice(header) {
            if eth.ether_type() == EtherType::VLAN_TAGGED_FRAME {
                max += VLAN_ENCAP_LEN;
            }
        }
    }
    max
}

/// Maps a foreign packet to a native chain aliasing the same memory.
///
/// One native segment is built per descriptor, in transmission order, each
/// armed with a release hook so the lifetime tracker sees every alias go
/// away. The packet's reference count ends up equal to the number of
/// segments built. On budget exhaustion the partial chain is discarded
/// without side effects and the caller keeps ownership of the packet.
pub(crate) fn to_native(block: &Arc<DeviceBlock>, packet: PacketHandle) -> Result<NativeChain> {
    let views = block.pool.views(packet, &block.segs);
    if views.is_empty() {
        return Err(Error::EmptyChain);
    }

    block.pool.ref_reset(packet);
    let mut chain = NativeChain::with_capacity(views.len());
    for view in views {
        if !block.native_budget.try_acquire() {
            chain.abandon();
            block.pool.ref_reset(packet);
            return Err(Error::OutOfResources);
        }
        block.pool.ref_inc(packet);
        chain.push(NativeSeg::with_hook(
            view,
            ReleaseHook {
                block: block.clone(),
                packet,
            },
        ));
    }

    let max = match chain.get(0) {
        Some(first) => max_frame_len(block.config.mtu, first),
        None => u32::MAX,
    };
    if chain.total_len() > max {
        tracing::debug!(
            packet = u32::from(packet),
            total = chain.total_len(),
            max,
            "clamping overpadded frame"
        );
        chain.truncate_to(max);
    }
    Ok(chain)
}

/// Maps a native chain onto a new foreign packet, one descriptor per
/// non-empty segment, and stashes the chain as the packet's backing so the
/// host memory stays claimed until send completion.
pub(crate) fn to_foreign(block: &Arc<DeviceBlock>, chain: NativeChain) -> Result<PacketHandle> {
    let views: SmallVec<[_; 8]> = chain
        .iter()
        .filter(|seg| !seg.is_empty())
        .map(|seg| seg.view())
        .collect();
    if views.is_empty() {
        return Err(Error::EmptyChain);
    }

    let packet = block.pool.alloc().ok_or(Error::OutOfResources)?;
    for view in views {
        match block.segs.alloc(view) {
            Some(id) => block.pool.append(packet, id, &block.segs),
            None => {
                block.pool.free(packet, &block.segs);
                return Err(Error::OutOfResources);
            }
        }
    }
    block.pool.set_backing(packet, chain);
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{leak_buf, test_block, tx_chain};
    use crate::device::DeviceConfig;

    fn rx_packet(block: &Arc<DeviceBlock>, lens: &[usize]) -> PacketHandle {
        let packet = block.pool.alloc().unwrap();
        for (i, &len) in lens.iter().enumerate() {
            let buf = leak_buf(len);
            if i == 0 && len >= ETHER_HDR_LEN {
                // IPv4 ether type so the frame-size clamp has a header to read.
                buf[12] = 0x08;
                buf[13] = 0x00;
            }
            let view = unsafe { crate::view::SegmentView::of_slice(buf) };
            let id = block.segs.alloc(view).unwrap();
            block.pool.append(packet, id, &block.segs);
        }
        packet
    }

    #[test]
    fn round_trip_preserves_segments_and_bytes() {
        let block = test_block(DeviceConfig::default());
        let bufs: Vec<&'static mut [u8]> = [14usize, 20, 30]
            .iter()
            .enumerate()
            .map(|(i, &len)| {
                let buf = leak_buf(len);
                for (j, b) in buf.iter_mut().enumerate() {
                    *b = (i * 64 + j) as u8;
                }
                buf
            })
            .collect();
        let expect: Vec<Vec<u8>> = bufs.iter().map(|b| b.to_vec()).collect();

        let chain = tx_chain(bufs);
        let total = chain.total_len();
        let packet = to_foreign(&block, chain).unwrap();
        assert_eq!(block.pool.total_len(packet), total);

        let back = to_native(&block, packet).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back.total_len(), total);
        for (seg, want) in back.iter().zip(&expect) {
            assert_eq!(unsafe { seg.bytes() }, &want[..]);
        }
        assert_eq!(block.pool.refs(packet), 3);
    }

    #[test]
    fn to_foreign_skips_empty_segments() {
        let block = test_block(DeviceConfig::default());
        let chain = tx_chain(vec![leak_buf(16), leak_buf(0), leak_buf(24)]);
        let packet = to_foreign(&block, chain).unwrap();
        assert_eq!(block.pool.views(packet, &block.segs).len(), 2);
        assert_eq!(block.pool.total_len(packet), 40);
    }

    #[test]
    fn to_foreign_rejects_empty_chain() {
        let block = test_block(DeviceConfig::default());
        assert!(matches!(
            to_foreign(&block, NativeChain::new()),
            Err(Error::EmptyChain)
        ));
        assert!(matches!(
            to_foreign(&block, tx_chain(vec![leak_buf(0)])),
            Err(Error::EmptyChain)
        ));
    }

    #[test]
    fn to_foreign_unwinds_on_descriptor_exhaustion() {
        let config = DeviceConfig {
            max_segments: 1,
            ..DeviceConfig::default()
        };
        let block = test_block(config);
        let chain = tx_chain(vec![leak_buf(16), leak_buf(16)]);
        assert!(matches!(
            to_foreign(&block, chain),
            Err(Error::OutOfResources)
        ));
        // Nothing left reachable: both arenas back to full.
        assert_eq!(block.pool.free_count(), block.config.max_packets);
        assert_eq!(block.segs.free_count(), 1);
    }

    #[test]
    fn to_native_unwinds_on_budget_exhaustion() {
        let config = DeviceConfig {
            host_segments: 2,
            ..DeviceConfig::default()
        };
        let block = test_block(config);
        let packet = rx_packet(&block, &[14, 20, 30]);
        assert!(matches!(
            to_native(&block, packet),
            Err(Error::OutOfResources)
        ));
        assert_eq!(block.pool.refs(packet), 0);
        assert_eq!(block.native_budget.available(), 2);
        // No reclamation was triggered by the failed conversion.
        assert!(block.reclaim.is_empty());
    }

    #[test]
    fn oversize_frame_is_clamped_to_max() {
        let block = test_block(DeviceConfig::default());
        let packet = rx_packet(&block, &[1000, 522]);
        let chain = to_native(&block, packet).unwrap();
        assert_eq!(chain.total_len(), 1514);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.get(1).unwrap().len(), 514);
    }

    #[test]
    fn clamp_drops_fully_overpadded_tail_segment() {
        let block = test_block(DeviceConfig::default());
        let packet = rx_packet(&block, &[1514, 8]);
        let chain = to_native(&block, packet).unwrap();
        assert_eq!(chain.total_len(), 1514);
        assert_eq!(chain.len(), 1);
        // The dropped tail released its reference.
        assert_eq!(block.pool.refs(packet), 1);
    }

    #[test]
    fn in_budget_frame_is_untouched() {
        let block = test_block(DeviceConfig::default());
        let packet = rx_packet(&block, &[14, 1500]);
        let chain = to_native(&block, packet).unwrap();
        assert_eq!(chain.total_len(), 1514);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.get(1).unwrap().len(), 1500);
    }
}
