//! In-memory loopback device
//!
//! Bulk and interrupt data written to an OUT endpoint comes back on the IN
//! endpoint with the same number. IN URBs with nothing to read wait until data
//! arrives or they are cancelled. Isochronous IN packets are filled with a
//! counting pattern. Endpoint 0 answers GET_DESCRIPTOR for the device and
//! configuration descriptors.
use super::*;
use tokio::runtime::Handle;

const VENDOR_ID: u16 = 0x1d6b;
const PRODUCT_ID: u16 = 0x0104;
const EP0_MAX_PACKET_SIZE: u16 = 64;

#[derive(Default)]
struct SimState {
    /// Bytes written per endpoint number, not yet read back
    fifo: HashMap<u8, VecDeque<u8>>,
    /// IN URBs waiting for data, per endpoint number
    parked: HashMap<u8, VecDeque<(Urb, Completion)>>,
}

/// A [LocalUsbStack] backed by a simulated loopback device
pub struct SimulatedStack {
    endpoints: Vec<UsbEndpoint>,
    sg: bool,
    state: Mutex<SimState>,
    runtime: Option<Handle>,
}

impl SimulatedStack {
    pub fn new() -> Arc<Self> {
        Self::build(true)
    }

    /// Same device, but large bulk transfers have to be split
    pub fn without_sg() -> Arc<Self> {
        Self::build(false)
    }

    fn build(sg: bool) -> Arc<Self> {
        Arc::new(Self {
            endpoints: vec![
                UsbEndpoint::new(0, Direction::Out, TransferKind::Control, EP0_MAX_PACKET_SIZE),
                UsbEndpoint::new(1, Direction::In, TransferKind::Bulk, 512),
                UsbEndpoint::new(1, Direction::Out, TransferKind::Bulk, 512),
                UsbEndpoint {
                    interval: 10,
                    ..UsbEndpoint::new(2, Direction::In, TransferKind::Interrupt, 8)
                },
                UsbEndpoint {
                    interval: 10,
                    ..UsbEndpoint::new(2, Direction::Out, TransferKind::Interrupt, 8)
                },
                UsbEndpoint {
                    interval: 1,
                    ..UsbEndpoint::new(3, Direction::In, TransferKind::Isochronous, 192)
                },
            ],
            sg,
            state: Mutex::new(SimState::default()),
            // completions run on the runtime when there is one
            runtime: Handle::try_current().ok(),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn deliver(&self, done: Vec<(Urb, Completion)>) {
        for (urb, completion) in done {
            match &self.runtime {
                Some(runtime) => {
                    runtime.spawn(async move { completion.complete(urb) });
                }
                None => completion.complete(urb),
            }
        }
    }

    pub fn device_descriptor(&self) -> Vec<u8> {
        let mut desc = vec![
            0x12, // bLength
            DescriptorType::Device as u8,
            0x00, 0x02, // bcdUSB 2.00
            0xFF, // bDeviceClass: vendor specific
            0x00, // bDeviceSubClass
            0x00, // bDeviceProtocol
            EP0_MAX_PACKET_SIZE as u8,
        ];
        desc.extend_from_slice(&VENDOR_ID.to_le_bytes());
        desc.extend_from_slice(&PRODUCT_ID.to_le_bytes());
        desc.extend_from_slice(&[
            0x00, 0x01, // bcdDevice
            0x00, // iManufacturer
            0x00, // iProduct
            0x00, // iSerialNumber
            0x01, // bNumConfigurations
        ]);
        desc
    }

    pub fn configuration_descriptor(&self) -> Vec<u8> {
        let endpoints: Vec<&UsbEndpoint> =
            self.endpoints.iter().filter(|ep| !ep.is_ep0()).collect();
        let total = 9 + 9 + 7 * endpoints.len();

        let mut desc = vec![
            0x09, // bLength
            DescriptorType::Configuration as u8,
        ];
        desc.extend_from_slice(&(total as u16).to_le_bytes());
        desc.extend_from_slice(&[
            0x01, // bNumInterfaces
            0x01, // bConfigurationValue
            0x00, // iConfiguration
            0x80, // bmAttributes: bus powered
            0x32, // bMaxPower: 100mA
            // interface
            0x09,
            0x04, // INTERFACE
            0x00, // bInterfaceNumber
            0x00, // bAlternateSetting
            endpoints.len() as u8,
            0xFF, // bInterfaceClass: vendor specific
            0x00,
            0x00,
            0x00, // iInterface
        ]);
        for ep in endpoints {
            desc.extend_from_slice(&[0x07, 0x05, ep.address, ep.attributes]);
            desc.extend_from_slice(&ep.max_packet_size.to_le_bytes());
            desc.push(ep.interval);
        }
        desc
    }

    fn control(&self, urb: Urb) -> Urb {
        let setup = urb.setup_packet();
        match (setup.direction(), setup.standard_request()) {
            (Direction::In, Some(StandardRequest::GetDescriptor)) => {
                let desc = match FromPrimitive::from_u16(setup.value >> 8) {
                    Some(DescriptorType::Device) => self.device_descriptor(),
                    Some(DescriptorType::Configuration) => self.configuration_descriptor(),
                    _ => {
                        debug!("Unsupported descriptor request {:?}", setup);
                        return urb.finish(status::EPIPE, 0);
                    }
                };
                fill(urb, &desc)
            }
            (Direction::In, Some(StandardRequest::GetStatus)) => fill(urb, &[0, 0]),
            (Direction::In, Some(StandardRequest::GetConfiguration)) => fill(urb, &[1]),
            (Direction::Out, Some(_)) => urb.finish(status::OK, 0),
            _ => {
                debug!("Stalling control request {:?}", setup);
                urb.finish(status::EPIPE, 0)
            }
        }
    }

    fn isochronous(&self, mut urb: Urb) -> Urb {
        let mut total = 0;
        for (index, packet) in urb.iso_packets.iter_mut().enumerate() {
            let start = packet.offset as usize;
            let end = (start + packet.length as usize).min(urb.buffer.len());
            if urb.direction == Direction::In {
                for byte in &mut urb.buffer[start.min(end)..end] {
                    *byte = index as u8;
                }
            }
            packet.actual_length = (end - start.min(end)) as u32;
            packet.status = status::OK;
            total += packet.actual_length as usize;
        }
        urb.error_count = 0;
        urb.finish(status::OK, total)
    }
}

/// Copy `data` into an IN URB, truncated to the buffer
fn fill(mut urb: Urb, data: &[u8]) -> Urb {
    let len = data.len().min(urb.buffer.len());
    urb.buffer[..len].copy_from_slice(&data[..len]);
    urb.finish(status::OK, len)
}

/// Serve parked IN URBs of `ep` from its fifo
fn drain_parked(state: &mut SimState, ep: u8, done: &mut Vec<(Urb, Completion)>) {
    let SimState { fifo, parked } = state;
    let (fifo, parked) = match (fifo.get_mut(&ep), parked.get_mut(&ep)) {
        (Some(fifo), Some(parked)) => (fifo, parked),
        _ => return,
    };
    while !fifo.is_empty() {
        let (urb, completion) = match parked.pop_front() {
            Some(entry) => entry,
            None => break,
        };
        let data: Vec<u8> = {
            let len = urb.buffer.len().min(fifo.len());
            fifo.drain(..len).collect()
        };
        done.push((fill(urb, &data), completion));
    }
}

impl LocalUsbStack for SimulatedStack {
    fn endpoint(&self, number: u8, direction: Direction) -> Option<UsbEndpoint> {
        find_endpoint(&self.endpoints, number, direction)
    }

    fn supports_sg(&self) -> bool {
        self.sg
    }

    fn submit(&self, urb: Urb, completion: Completion) -> std::result::Result<(), LocalStackError> {
        trace!(
            "Simulated {:?} {:?} ep{} len {}",
            urb.kind,
            urb.direction,
            urb.endpoint,
            urb.buffer.len()
        );
        let mut done = vec![];
        match (urb.kind, urb.direction) {
            (TransferKind::Control, _) => done.push((self.control(urb), completion)),
            (TransferKind::Isochronous, _) => done.push((self.isochronous(urb), completion)),
            (_, Direction::Out) => {
                let ep = urb.endpoint;
                let len = urb.buffer.len();
                let mut state = self.state();
                state.fifo.entry(ep).or_default().extend(&urb.buffer);
                done.push((urb.finish(status::OK, len), completion));
                drain_parked(&mut state, ep, &mut done);
            }
            (_, Direction::In) => {
                let ep = urb.endpoint;
                let mut state = self.state();
                state.parked.entry(ep).or_default().push_back((urb, completion));
                drain_parked(&mut state, ep, &mut done);
            }
        }
        self.deliver(done);
        Ok(())
    }

    fn cancel(&self, id: UrbId) {
        let cancelled = {
            let mut state = self.state();
            state.parked.values_mut().find_map(|queue| {
                let index = queue.iter().position(|(urb, _)| urb.id == id)?;
                queue.remove(index)
            })
        };
        match cancelled {
            Some((urb, completion)) => {
                debug!("Cancelled seqnum {} part {}", id.seqnum, id.part);
                self.deliver(vec![(urb.finish(status::ECONNRESET, 0), completion)]);
            }
            None => trace!("seqnum {} part {} already done", id.seqnum, id.part),
        }
    }
}
