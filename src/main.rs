use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use arrayvec::ArrayVec;
use clap::Parser;
use etherparse::{NetHeaders, PacketBuilder, PacketHeaders};
use eui48::MacAddress;

use miniwrap::device::{Device, DeviceConfig};
use miniwrap::driver::HostStack;
use miniwrap::loopback::Loopback;
use miniwrap::native::{NativeChain, NativeSeg};
use miniwrap::packet::PacketHandle;
use miniwrap::status::{DriverStatus, Oid};
use miniwrap::view::SegmentView;

const STATION: [u8; 6] = [0x02, 0x4d, 0x57, 0x00, 0x00, 0x01];
const BULK: usize = 16;

/// Command line options.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Number of frames to push through the adapter.
    #[clap(short, long, default_value_t = 1_000_000)]
    frames: u64,

    /// UDP payload bytes per frame.
    #[clap(short, long, default_value_t = 512)]
    payload: usize,

    /// Use the multiple-packet send entry point in batches.
    #[clap(short, long)]
    batch: bool,

    /// Print the parsed addresses of the generated frame.
    #[clap(short, long)]
    debug: bool,
}

#[derive(Default)]
struct Counters {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_done: AtomicU64,
}

/// Host-stack collaborator counting delivered traffic.
#[derive(Clone, Default)]
struct Meter(Arc<Counters>);

impl HostStack for Meter {
    fn receive(&self, chain: NativeChain) {
        self.0.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.0
            .rx_bytes
            .fetch_add(chain.total_len() as u64, Ordering::Relaxed);
    }

    fn send_done(&self, _chain: NativeChain, _status: DriverStatus) {
        self.0.tx_done.fetch_add(1, Ordering::Relaxed);
    }
}

/// Try to parse Ethernet/IP headers using etherparse and return a formatted string.
fn print_addrs(frame: &[u8]) -> Result<String> {
    let headers = PacketHeaders::from_ethernet_slice(frame)?;
    let net = headers
        .net
        .ok_or(anyhow::anyhow!("Error: IP header not found"))?;
    match net {
        NetHeaders::Ipv4(hdr, _) => Ok(format!(
            "IP: {} > {}",
            std::net::Ipv4Addr::from(hdr.source),
            std::net::Ipv4Addr::from(hdr.destination)
        )),
        NetHeaders::Ipv6(hdr, _) => Ok(format!(
            "IP: {} > {}",
            std::net::Ipv6Addr::from(hdr.source),
            std::net::Ipv6Addr::from(hdr.destination)
        )),
        _ => anyhow::bail!("Error: IP header not found"),
    }
}

/// Chain aliasing the shared frame buffer. The loopback adapter copies the
/// bytes into its own receive area before the send completes, so the buffer
/// is reusable as soon as each send call returns.
fn frame_chain(frame: &mut [u8]) -> NativeChain {
    let mut chain = NativeChain::new();
    chain.push(NativeSeg::new(unsafe { SegmentView::of_slice(frame) }));
    chain
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    println!("loopback meter started with parameters:");
    println!("* frames: {}", args.frames);
    println!("* payload: {} bytes", args.payload);
    println!("* batch: {}", if args.batch { "ON" } else { "OFF" });

    let term = Arc::new(AtomicBool::new(false));
    {
        let term = term.clone();
        ctrlc::set_handler(move || {
            term.store(true, Ordering::SeqCst);
        })
        .expect("Error setting Ctrl-C handler");
    }

    let driver = Arc::new(Loopback::new(MacAddress::new(STATION), 64, 2048));
    let meter = Meter::default();
    let mut dev = Device::attach(driver, Box::new(meter.clone()), DeviceConfig::default())?;
    dev.init()?;

    println!(
        "station address: {}",
        dev.query_mac(Oid::X802_3_CURRENT_ADDRESS)?
    );
    println!(
        "link speed: {} Mbit/s",
        dev.query_u32(Oid::GEN_LINK_SPEED)? / 10_000
    );
    dev.set_u32(Oid::GEN_CURRENT_PACKET_FILTER, 0x1)?;

    let payload = vec![0xa5u8; args.payload];
    let builder =
        PacketBuilder::ethernet2(STATION, [0xff; 6]).ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64).udp(9000, 9001);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, &payload)?;
    if args.debug {
        println!("{}", print_addrs(&frame)?);
    }

    let done = Arc::new(AtomicBool::new(false));
    let stats_handle = {
        let counters = meter.0.clone();
        let term = term.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut old_total = 0;
            while !term.load(Ordering::SeqCst) && !done.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_secs(1));
                let count = counters.rx_packets.load(Ordering::Relaxed);
                println!("pkt/sec: {}", count.saturating_sub(old_total));
                old_total = count;
            }
        })
    };

    let mut sent: u64 = 0;
    if args.batch {
        while sent < args.frames && !term.load(Ordering::SeqCst) {
            let n = BULK.min((args.frames - sent) as usize);
            let mut batch: ArrayVec<Option<PacketHandle>, BULK> = ArrayVec::new();
            for _ in 0..n {
                batch.push(Some(dev.prepare(frame_chain(&mut frame))?));
            }
            dev.send_packets(&mut batch)?;
            sent += n as u64;
        }
    } else {
        while sent < args.frames && !term.load(Ordering::SeqCst) {
            dev.transmit(frame_chain(&mut frame))?;
            sent += 1;
        }
    }

    done.store(true, Ordering::SeqCst);
    stats_handle.join().expect("Stats thread panicked");

    println!(
        "sent {} frames, received {} frames ({} bytes), {} send completions",
        sent,
        meter.0.rx_packets.load(Ordering::Relaxed),
        meter.0.rx_bytes.load(Ordering::Relaxed),
        meter.0.tx_done.load(Ordering::Relaxed)
    );
    dev.halt();
    Ok(())
}
