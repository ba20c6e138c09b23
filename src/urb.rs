use super::*;
use crate::usbip_protocol::IsoPacketDescriptor;

/// Identifies one local URB: the client seqnum plus the part index when a
/// transfer had to be split.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UrbId {
    pub seqnum: u32,
    pub part: usize,
}

/// A local transfer task handed to the [LocalUsbStack]
///
/// The URB owns its buffer while it is in flight. The stack fills in
/// `status`, `actual_length` (and the iso packet results) and gives the URB
/// back through [Completion::complete].
#[derive(Debug)]
pub struct Urb {
    pub id: UrbId,
    /// Endpoint number, without the direction bit
    pub endpoint: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    pub transfer_flags: u32,
    /// Raw SETUP packet, only meaningful for control transfers
    pub setup: [u8; 8],
    /// OUT: data to send. IN: zeroed space for the device to fill.
    pub buffer: Vec<u8>,
    pub actual_length: u32,
    pub status: i32,
    pub start_frame: u32,
    pub interval: u32,
    pub error_count: u32,
    pub iso_packets: Vec<IsoPacketDescriptor>,
}

impl Urb {
    pub fn setup_packet(&self) -> SetupPacket {
        SetupPacket::parse(&self.setup)
    }

    /// Endpoint address with the direction bit
    pub fn endpoint_address(&self) -> u8 {
        match self.direction {
            Direction::In => self.endpoint | 0x80,
            Direction::Out => self.endpoint,
        }
    }

    /// Record a result and hand the URB back
    pub fn finish(mut self, status: i32, actual_length: usize) -> Self {
        self.status = status;
        self.actual_length = actual_length.min(self.buffer.len()) as u32;
        self
    }
}

/// The local USB host stack a stub forwards URBs to
///
/// `submit` must not block on the transfer itself: results are delivered
/// later, exactly once per accepted URB, through the [Completion] passed in.
/// Completions may arrive on any thread, concurrently with each other.
/// `submit` and `cancel` are never called with the connection lock held, so
/// an implementation may complete synchronously from inside either.
pub trait LocalUsbStack: Send + Sync {
    /// Endpoint descriptor for a pipe, `None` if the device has no such endpoint
    fn endpoint(&self, number: u8, direction: Direction) -> Option<UsbEndpoint>;

    /// Whether one URB may carry a bulk buffer of any size.
    ///
    /// When this returns false, large bulk transfers are split into several
    /// URBs of at most [StubConfig::sg_chunk_size] bytes.
    fn supports_sg(&self) -> bool {
        true
    }

    /// Start a transfer. On error the URB is dropped and no completion follows.
    fn submit(&self, urb: Urb, completion: Completion) -> std::result::Result<(), LocalStackError>;

    /// Ask the stack to give up on an URB. Its completion still arrives,
    /// usually with [status::ECONNRESET].
    fn cancel(&self, id: UrbId);
}
