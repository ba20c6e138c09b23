use std::env;
use std::net::*;

use usbip_stub::{server, sim::SimulatedStack, StubConfig, StubDevice};

#[tokio::main]
async fn main() {
    env_logger::init();
    let device = StubDevice::new("1-1", 1, 2, SimulatedStack::new(), StubConfig::default());
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 3240);

    if let Err(err) = server(addr, device).await {
        eprintln!("{}: {}", env::args().next().unwrap_or_default(), err);
    }
}
