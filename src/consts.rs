use super::*;

/// Command code: Submit an URB
pub const USBIP_CMD_SUBMIT: u32 = 0x0001;
/// Command code: Unlink an URB
pub const USBIP_CMD_UNLINK: u32 = 0x0002;
/// Reply code: Reply for submitting an URB
pub const USBIP_RET_SUBMIT: u32 = 0x0003;
/// Reply code: Reply for URB unlink
pub const USBIP_RET_UNLINK: u32 = 0x0004;

/// `direction` field value for host-to-device transfers
pub const USBIP_DIR_OUT: u32 = 0;
/// `direction` field value for device-to-host transfers
pub const USBIP_DIR_IN: u32 = 1;

/// Upper bound on isochronous packets per URB
pub const USBIP_MAX_ISO_PACKETS: u32 = 1024;

/// Highest endpoint number a pipe may address
pub const MAX_ENDPOINT_NUMBER: u32 = 15;

/// USB transfer type of an endpoint, as encoded in `bmAttributes`
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TransferKind {
    Control = 0,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferKind {
    /// Decode from the low two bits of an endpoint's `bmAttributes`
    pub fn from_attributes(attributes: u8) -> Self {
        // two bits always map to one of the four variants
        FromPrimitive::from_u8(attributes & 0x3).unwrap_or(TransferKind::Control)
    }
}

/// USB endpoint direction: IN or OUT
/// Already exists in rusb crate
pub use rusb::Direction;

/// Decode the wire `direction` field
pub fn direction_from_wire(direction: u32) -> std::result::Result<Direction, ProtocolError> {
    match direction {
        USBIP_DIR_OUT => Ok(Direction::Out),
        USBIP_DIR_IN => Ok(Direction::In),
        other => Err(ProtocolError::InvalidDirection(other)),
    }
}

/// Encode a [Direction] as the wire `direction` field
pub fn direction_to_wire(direction: Direction) -> u32 {
    match direction {
        Direction::Out => USBIP_DIR_OUT,
        Direction::In => USBIP_DIR_IN,
    }
}

/// URB completion statuses, as negative errno values on the wire
pub mod status {
    pub const OK: i32 = 0;
    pub const ENOENT: i32 = -2;
    pub const EIO: i32 = -5;
    pub const ENOMEM: i32 = -12;
    pub const ENODEV: i32 = -19;
    pub const EINVAL: i32 = -22;
    pub const EPIPE: i32 = -32;
    pub const EPROTO: i32 = -71;
    pub const EOVERFLOW: i32 = -75;
    pub const ECONNRESET: i32 = -104;
    pub const ETIMEDOUT: i32 = -110;
    pub const EINPROGRESS: i32 = -115;
}

/// URB `transfer_flags` bits, as carried in CMD_SUBMIT
pub mod urb_flags {
    pub const URB_SHORT_NOT_OK: u32 = 0x0001;
    pub const URB_ISO_ASAP: u32 = 0x0002;
    pub const URB_NO_TRANSFER_DMA_MAP: u32 = 0x0004;
    pub const URB_ZERO_PACKET: u32 = 0x0040;
    pub const URB_NO_INTERRUPT: u32 = 0x0080;
    pub const URB_FREE_BUFFER: u32 = 0x0100;
    pub const URB_DIR_IN: u32 = 0x0200;
    pub const URB_DIR_MASK: u32 = URB_DIR_IN;
}

/// Drop the `transfer_flags` bits a client may not request for this pipe
pub fn mask_transfer_flags(flags: u32, kind: TransferKind, direction: Direction) -> u32 {
    use urb_flags::*;

    let mut allowed = URB_NO_TRANSFER_DMA_MAP | URB_NO_INTERRUPT | URB_DIR_MASK | URB_FREE_BUFFER;
    match kind {
        TransferKind::Isochronous => allowed |= URB_ISO_ASAP,
        TransferKind::Bulk if direction == Direction::Out => allowed |= URB_ZERO_PACKET,
        _ => {}
    }
    if kind != TransferKind::Isochronous && direction == Direction::In {
        allowed |= URB_SHORT_NOT_OK;
    }
    flags & allowed
}

/// A list of defined USB standard requests
/// from USB 2.0 standard Table 9.4. Standard Request Codes
#[derive(Copy, Clone, Debug, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StandardRequest {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
    SynchFrame = 12,
}

/// Descriptor types the simulated device answers
/// from USB 2.0 standard Table 9.5. Descriptor Types
#[derive(Copy, Clone, Debug, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
}

#[cfg(test)]
mod tests {
    use super::*;
    use urb_flags::*;

    #[test]
    fn transfer_kind_from_attributes() {
        assert_eq!(TransferKind::from_attributes(0x00), TransferKind::Control);
        assert_eq!(TransferKind::from_attributes(0x05), TransferKind::Isochronous);
        assert_eq!(TransferKind::from_attributes(0x02), TransferKind::Bulk);
        assert_eq!(TransferKind::from_attributes(0x03), TransferKind::Interrupt);
    }

    #[test]
    fn wire_direction() {
        assert_eq!(direction_from_wire(0).unwrap(), Direction::Out);
        assert_eq!(direction_from_wire(1).unwrap(), Direction::In);
        assert!(matches!(
            direction_from_wire(2),
            Err(ProtocolError::InvalidDirection(2))
        ));
        assert_eq!(direction_to_wire(Direction::In), USBIP_DIR_IN);
    }

    #[test]
    fn flag_masking_per_pipe() {
        let all = URB_SHORT_NOT_OK | URB_ISO_ASAP | URB_ZERO_PACKET | URB_NO_INTERRUPT | 0x8000;

        assert_eq!(
            mask_transfer_flags(all, TransferKind::Bulk, Direction::Out),
            URB_ZERO_PACKET | URB_NO_INTERRUPT
        );
        assert_eq!(
            mask_transfer_flags(all, TransferKind::Bulk, Direction::In),
            URB_SHORT_NOT_OK | URB_NO_INTERRUPT
        );
        assert_eq!(
            mask_transfer_flags(all, TransferKind::Isochronous, Direction::In),
            URB_ISO_ASAP | URB_NO_INTERRUPT
        );
        assert_eq!(
            mask_transfer_flags(all, TransferKind::Control, Direction::Out),
            URB_NO_INTERRUPT
        );
    }
}
