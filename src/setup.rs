use super::*;

/// Parse the SETUP packet of control transfers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Parse a [SetupPacket] from raw setup packet
    pub fn parse(setup: &[u8; 8]) -> SetupPacket {
        SetupPacket {
            request_type: setup[0],
            request: setup[1],
            value: u16::from_le_bytes([setup[2], setup[3]]),
            index: u16::from_le_bytes([setup[4], setup[5]]),
            length: u16::from_le_bytes([setup[6], setup[7]]),
        }
    }

    /// Raw little-endian form, as carried in CMD_SUBMIT
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut setup = [0u8; 8];
        setup[0] = self.request_type;
        setup[1] = self.request;
        setup[2..4].copy_from_slice(&self.value.to_le_bytes());
        setup[4..6].copy_from_slice(&self.index.to_le_bytes());
        setup[6..8].copy_from_slice(&self.length.to_le_bytes());
        setup
    }

    /// Data stage direction from bit 7 of `bmRequestType`
    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// The request code, if this is a standard request
    pub fn standard_request(&self) -> Option<StandardRequest> {
        // type bits 5..6 are zero for standard requests
        if self.request_type & 0x60 == 0 {
            FromPrimitive::from_u8(self.request)
        } else {
            None
        }
    }
}
