//! Host USB
use super::*;
use rusb::{Device, DeviceHandle, GlobalContext, TransferType};
use std::collections::HashMap;
use tokio::runtime::Handle;

/// Timeout for OUT and control transfers
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);
/// IN transfers wait in slices of this, checking for cancellation in between
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A [LocalUsbStack] that passes URBs to a USB device of the host
///
/// Transfers run on tokio's blocking pool (or a plain thread outside a
/// runtime) and complete from there. Isochronous transfers are not supported.
pub struct HostStack {
    handle: Arc<DeviceHandle<GlobalContext>>,
    endpoints: Vec<UsbEndpoint>,
    in_flight: Arc<InFlight>,
    runtime: Option<Handle>,
}

/// URBs handed to a worker and not finished yet, with their cancel flag
#[derive(Debug, Default)]
struct InFlight(Mutex<HashMap<UrbId, bool>>);

impl InFlight {
    fn urbs(&self) -> std::sync::MutexGuard<'_, HashMap<UrbId, bool>> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn begin(&self, id: UrbId) {
        self.urbs().insert(id, false);
    }

    /// Returns false if `id` already finished (or never started)
    fn cancel(&self, id: UrbId) -> bool {
        match self.urbs().get_mut(&id) {
            Some(cancelled) => {
                *cancelled = true;
                true
            }
            None => false,
        }
    }

    fn is_cancelled(&self, id: UrbId) -> bool {
        self.urbs().get(&id).copied().unwrap_or(false)
    }

    fn finish(&self, id: UrbId) {
        self.urbs().remove(&id);
    }

    fn len(&self) -> usize {
        self.urbs().len()
    }
}

impl HostStack {
    /// Open `device` and claim its interfaces
    pub fn open(device: &Device<GlobalContext>) -> rusb::Result<Arc<Self>> {
        Self::new(device.open()?)
    }

    /// First device matching `vendor_id:product_id`
    pub fn open_with_vid_pid(vendor_id: u16, product_id: u16) -> Option<Arc<Self>> {
        let handle = rusb::open_device_with_vid_pid(vendor_id, product_id)?;
        match Self::new(handle) {
            Ok(stack) => Some(stack),
            Err(err) => {
                warn!(
                    "Impossible to share {:04x}:{:04x}: {}",
                    vendor_id, product_id, err
                );
                None
            }
        }
    }

    pub fn new(handle: DeviceHandle<GlobalContext>) -> rusb::Result<Arc<Self>> {
        let device = handle.device();
        let desc = device.device_descriptor()?;
        let cfg = device.active_config_descriptor()?;

        handle.set_auto_detach_kernel_driver(true).ok();
        let mut endpoints = vec![UsbEndpoint::new(
            0,
            Direction::Out,
            TransferKind::Control,
            desc.max_packet_size() as u16,
        )];
        for intf in cfg.interfaces() {
            // ignore alternate settings
            let intf_desc = match intf.descriptors().next() {
                Some(intf_desc) => intf_desc,
                None => continue,
            };
            if let Err(err) = handle.claim_interface(intf.number()) {
                warn!("Cannot claim interface {}: {}", intf.number(), err);
            }
            for ep_desc in intf_desc.endpoint_descriptors() {
                endpoints.push(UsbEndpoint {
                    address: ep_desc.address(),
                    attributes: transfer_kind(ep_desc.transfer_type()) as u8,
                    max_packet_size: ep_desc.max_packet_size(),
                    interval: ep_desc.interval(),
                });
            }
        }
        info!(
            "Opened host device {:04x}:{:04x} at {}-{} with {} endpoints",
            desc.vendor_id(),
            desc.product_id(),
            device.bus_number(),
            device.address(),
            endpoints.len()
        );

        Ok(Arc::new(Self {
            handle: Arc::new(handle),
            endpoints,
            in_flight: Arc::new(InFlight::default()),
            runtime: Handle::try_current().ok(),
        }))
    }

    pub fn bus_number(&self) -> u8 {
        self.handle.device().bus_number()
    }

    pub fn address(&self) -> u8 {
        self.handle.device().address()
    }
}

fn transfer_kind(transfer_type: TransferType) -> TransferKind {
    match transfer_type {
        TransferType::Control => TransferKind::Control,
        TransferType::Isochronous => TransferKind::Isochronous,
        TransferType::Bulk => TransferKind::Bulk,
        TransferType::Interrupt => TransferKind::Interrupt,
    }
}

/// Map a libusb error to the URB status the client expects
pub fn map_rusb_error(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Timeout => status::ETIMEDOUT,
        rusb::Error::Pipe => status::EPIPE,
        rusb::Error::NoDevice => status::ENODEV,
        rusb::Error::NotFound => status::ENOENT,
        rusb::Error::Overflow => status::EOVERFLOW,
        rusb::Error::Interrupted => status::ECONNRESET,
        rusb::Error::InvalidParam => status::EINVAL,
        rusb::Error::Io => status::EIO,
        _ => status::EPROTO,
    }
}

/// Run one URB to completion on the calling thread
fn execute(
    handle: &DeviceHandle<GlobalContext>,
    in_flight: &InFlight,
    mut urb: Urb,
) -> Urb {
    let address = urb.endpoint_address();
    let result = match (urb.kind, urb.direction) {
        (TransferKind::Control, direction) => {
            let setup = urb.setup_packet();
            match direction {
                Direction::In => handle.read_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &mut urb.buffer,
                    TRANSFER_TIMEOUT,
                ),
                Direction::Out => handle.write_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &urb.buffer,
                    TRANSFER_TIMEOUT,
                ),
            }
        }
        (TransferKind::Bulk, Direction::Out) => {
            handle.write_bulk(address, &urb.buffer, TRANSFER_TIMEOUT)
        }
        (TransferKind::Interrupt, Direction::Out) => {
            handle.write_interrupt(address, &urb.buffer, TRANSFER_TIMEOUT)
        }
        (kind, Direction::In) => loop {
            let read = if kind == TransferKind::Interrupt {
                handle.read_interrupt(address, &mut urb.buffer, POLL_INTERVAL)
            } else {
                handle.read_bulk(address, &mut urb.buffer, POLL_INTERVAL)
            };
            match read {
                Err(rusb::Error::Timeout) if in_flight.is_cancelled(urb.id) => {
                    break Err(rusb::Error::Interrupted);
                }
                Err(rusb::Error::Timeout) => continue,
                other => break other,
            }
        },
        (TransferKind::Isochronous, Direction::Out) => Err(rusb::Error::NotSupported),
    };
    in_flight.finish(urb.id);

    match result {
        Ok(len) => urb.finish(status::OK, len),
        Err(err) => {
            debug!(
                "seqnum {} on ep {:#04x} failed: {}",
                urb.id.seqnum, address, err
            );
            urb.finish(map_rusb_error(err), 0)
        }
    }
}

impl LocalUsbStack for HostStack {
    fn endpoint(&self, number: u8, direction: Direction) -> Option<UsbEndpoint> {
        find_endpoint(&self.endpoints, number, direction)
    }

    fn submit(&self, urb: Urb, completion: Completion) -> std::result::Result<(), LocalStackError> {
        if urb.kind == TransferKind::Isochronous {
            return Err(LocalStackError::Unsupported("isochronous transfers"));
        }
        trace!(
            "To host device: ep={:#04x} {:?} len={}",
            urb.endpoint_address(),
            urb.kind,
            urb.buffer.len()
        );

        let id = urb.id;
        self.in_flight.begin(id);
        let handle = self.handle.clone();
        let in_flight = self.in_flight.clone();
        let work = move || completion.complete(execute(&handle, &in_flight, urb));
        match &self.runtime {
            Some(runtime) => {
                runtime.spawn_blocking(work);
            }
            None => {
                let spawned = std::thread::Builder::new()
                    .name("usbip-host-urb".into())
                    .spawn(work);
                if spawned.is_err() {
                    self.in_flight.finish(id);
                    return Err(LocalStackError::Rejected(status::ENOMEM));
                }
            }
        }
        Ok(())
    }

    fn cancel(&self, id: UrbId) {
        // picked up by the polling IN read; OUT and control run to their timeout
        if !self.in_flight.cancel(id) {
            trace!("seqnum {} part {} is not in flight", id.seqnum, id.part);
        }
    }
}
