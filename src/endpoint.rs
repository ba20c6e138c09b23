use super::*;

/// Endpoint descriptor of the exported device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UsbEndpoint {
    /// bEndpointAddress, bit 7 set for IN
    pub address: u8,
    /// bmAttributes
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl UsbEndpoint {
    pub fn new(number: u8, direction: Direction, kind: TransferKind, max_packet_size: u16) -> Self {
        let address = match direction {
            Direction::In => number | 0x80,
            Direction::Out => number,
        };
        Self {
            address,
            attributes: kind as u8,
            max_packet_size,
            interval: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    pub fn kind(&self) -> TransferKind {
        TransferKind::from_attributes(self.attributes)
    }

    pub fn is_ep0(&self) -> bool {
        self.address & 0x7F == 0
    }
}

/// Look up the endpoint a pipe addresses.
///
/// Endpoint 0 is bidirectional, so it matches either direction.
pub fn find_endpoint(
    endpoints: &[UsbEndpoint],
    number: u8,
    direction: Direction,
) -> Option<UsbEndpoint> {
    endpoints
        .iter()
        .find(|ep| ep.number() == number && (ep.is_ep0() || ep.direction() == direction))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_address_fields() {
        let ep = UsbEndpoint::new(2, Direction::In, TransferKind::Bulk, 512);
        assert_eq!(ep.address, 0x82);
        assert_eq!(ep.number(), 2);
        assert_eq!(ep.direction(), Direction::In);
        assert_eq!(ep.kind(), TransferKind::Bulk);
        assert!(!ep.is_ep0());
    }

    #[test]
    fn lookup_respects_direction() {
        let endpoints = [
            UsbEndpoint::new(0, Direction::Out, TransferKind::Control, 64),
            UsbEndpoint::new(1, Direction::In, TransferKind::Interrupt, 8),
            UsbEndpoint::new(2, Direction::Out, TransferKind::Bulk, 512),
        ];
        assert!(find_endpoint(&endpoints, 0, Direction::In).is_some());
        assert!(find_endpoint(&endpoints, 1, Direction::In).is_some());
        assert!(find_endpoint(&endpoints, 1, Direction::Out).is_none());
        assert_eq!(
            find_endpoint(&endpoints, 2, Direction::Out).map(|ep| ep.kind()),
            Some(TransferKind::Bulk)
        );
    }
}
