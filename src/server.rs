use super::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// First pause after a failed accept
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
/// Longest pause between failing accepts
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause before retrying after `failures` consecutive accept errors
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    (ACCEPT_BACKOFF_MIN * (1 << shift)).min(ACCEPT_BACKOFF_MAX)
}

/// Accept TCP connections and attach each one to `device`
///
/// Stands in for the daemon that hands a connected socket to the stub. While
/// the device is in use, further clients are refused by closing their socket.
/// Never returns on its own: accept errors (such as running out of file
/// descriptors) are logged and retried with a growing pause.
pub async fn serve(listener: TcpListener, device: Arc<StubDevice>) -> std::io::Result<()> {
    info!(
        "Exporting {} (devid {:#x}) on {}",
        device.bus_id,
        device.devid,
        listener.local_addr()?
    );
    let mut failures: u32 = 0;
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                failures = 0;
                info!("Got connection from {:?}", addr);
                if let Err(err) = device.attach_tcp(socket) {
                    warn!("Refusing {}: {}", addr, err);
                }
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                let pause = accept_backoff(failures);
                warn!("Got error {:?}, retrying in {:?}", err, pause);
                tokio::time::sleep(pause).await;
            }
        }
    }
}

/// Bind `addr` and [serve] `device` on it
pub async fn server(addr: SocketAddr, device: Arc<StubDevice>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, device).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedStack;
    use crate::usbip_protocol::{UsbIpCommand, UsbIpReply};
    use crate::util::tests::*;

    fn get_device_descriptor(devid: u32, seqnum: u32) -> Vec<u8> {
        let mut cmd = submit_cmd(devid, seqnum, Direction::In, 0, 18, vec![]);
        cmd.setup = SetupPacket {
            request_type: 0x80,
            request: StandardRequest::GetDescriptor as u8,
            value: (DescriptorType::Device as u16) << 8,
            index: 0,
            length: 18,
        }
        .to_bytes();
        UsbIpCommand::Submit(cmd).to_bytes()
    }

    async fn reply(socket: &mut tokio::net::TcpStream) -> UsbIpReply {
        tokio::time::timeout(
            Duration::from_secs(5),
            UsbIpReply::read_from_socket(socket, |_| Direction::In),
        )
        .await
        .expect("reply in time")
        .expect("valid reply")
    }

    #[test]
    fn accept_errors_back_off() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(4), Duration::from_millis(80));
        assert_eq!(accept_backoff(8), Duration::from_secs(1));
        assert_eq!(accept_backoff(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serve_simulated_device() {
        setup_test_logger();
        let device = StubDevice::new(
            "0-0-0",
            3,
            1,
            SimulatedStack::new(),
            StubConfig::default(),
        );
        let addr = get_free_address().await;
        tokio::spawn(server(addr, device.clone()));

        let mut client = poll_connect(addr).await;
        client
            .write_all(&get_device_descriptor(device.devid, 1))
            .await
            .unwrap();
        match reply(&mut client).await {
            UsbIpReply::Submit(ret) => {
                assert_eq!(ret.header.seqnum, 1);
                assert_eq!(ret.status, 0);
                assert_eq!(ret.actual_length, 18);
                assert_eq!(ret.transfer_buffer[1], DescriptorType::Device as u8);
                verify_descriptor(&ret.transfer_buffer);
            }
            other => panic!("expected RET_SUBMIT, got {:?}", other),
        }

        // a second client is turned away while the first one is attached
        let mut second = poll_connect(addr).await;
        let mut rest = vec![];
        second.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(device.status(), ConnectionState::Used);

        // once the first leaves, the device can be attached again
        drop(client);
        let wait = async {
            while device.status() != ConnectionState::Available {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap();

        let mut third = poll_connect(addr).await;
        third
            .write_all(&get_device_descriptor(device.devid, 7))
            .await
            .unwrap();
        assert_eq!(reply(&mut third).await.seqnum(), 7);
    }
}
