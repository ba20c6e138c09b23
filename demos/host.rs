use std::env;
use std::net::*;

use usbip_stub::{host::HostStack, server, StubConfig, StubDevice};

fn parse_id(arg: Option<String>) -> Option<u16> {
    u16::from_str_radix(arg?.trim_start_matches("0x"), 16).ok()
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let mut args = env::args().skip(1);
    let (vendor_id, product_id) = match (parse_id(args.next()), parse_id(args.next())) {
        (Some(vid), Some(pid)) => (vid, pid),
        _ => {
            eprintln!("usage: host <vendor id> <product id>");
            return;
        }
    };

    let stack = match HostStack::open_with_vid_pid(vendor_id, product_id) {
        Some(stack) => stack,
        None => {
            eprintln!("no usable device {:04x}:{:04x}", vendor_id, product_id);
            return;
        }
    };
    let bus_id = format!("{}-{}", stack.bus_number(), stack.address());
    let device = StubDevice::new(
        bus_id,
        stack.bus_number() as u16,
        stack.address() as u16,
        stack,
        StubConfig::default(),
    );
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 3240);
    if let Err(err) = server(addr, device).await {
        eprintln!("{}", err);
    }
}
