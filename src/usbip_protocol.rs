//! USB/IP protocol structs
//!
//! This module contains the PDUs exchanged once a device is attached
//! (CMD_SUBMIT, RET_SUBMIT, CMD_UNLINK, RET_UNLINK), functions to serialize and
//! deserialize them, and functions to receive them from a socket.
//!
//! Every PDU starts with a 48 byte header: the 20 byte [UsbIpHeaderBasic]
//! followed by 28 bytes of command specific fields. All integers are
//! big-endian on the wire; conversion happens here and nowhere else.
//!
//! They are based on the [Linux kernel documentation](https://docs.kernel.org/usb/usbip_protocol.html).

use super::*;
use crate::transfer::ReadyTransfer;

/// Size of every PDU header, command specific fields included
pub const USBIP_HEADER_SIZE: usize = 48;

/// `number_of_packets` value some clients send for non-iso transfers
const NO_ISO_PACKETS: u32 = 0xFFFF_FFFF;

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_be_bytes(word)
}

fn be_i32(bytes: &[u8], offset: usize) -> i32 {
    be_u32(bytes, offset) as i32
}

fn has_iso_packets(number_of_packets: u32) -> bool {
    number_of_packets != 0 && number_of_packets != NO_ISO_PACKETS
}

/// Common header for all context sensitive packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsbIpHeaderBasic {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

impl UsbIpHeaderBasic {
    pub const SIZE: usize = 20;

    /// Header of a stub reply. The stub leaves devid, direction and ep zero.
    pub fn reply(command: u32, seqnum: u32) -> Self {
        Self {
            command,
            seqnum,
            ..Self::default()
        }
    }

    /// Converts the first 20 bytes of `bytes` into a [UsbIpHeaderBasic].
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, ProtocolError> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                needed: Self::SIZE,
                got: bytes.len(),
            });
        }
        Ok(Self {
            command: be_u32(bytes, 0),
            seqnum: be_u32(bytes, 4),
            devid: be_u32(bytes, 8),
            direction: be_u32(bytes, 12),
            ep: be_u32(bytes, 16),
        })
    }

    /// Converts the [UsbIpHeaderBasic] into a byte array.
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut result = [0u8; 20];
        result[0..4].copy_from_slice(&self.command.to_be_bytes());
        result[4..8].copy_from_slice(&self.seqnum.to_be_bytes());
        result[8..12].copy_from_slice(&self.devid.to_be_bytes());
        result[12..16].copy_from_slice(&self.direction.to_be_bytes());
        result[16..20].copy_from_slice(&self.ep.to_be_bytes());
        result
    }
}

/// Decode a basic header; fails if fewer than 20 bytes are given
pub fn decode_header(bytes: &[u8]) -> std::result::Result<UsbIpHeaderBasic, ProtocolError> {
    UsbIpHeaderBasic::from_bytes(bytes)
}

pub fn encode_header(header: &UsbIpHeaderBasic) -> [u8; 20] {
    header.to_bytes()
}

/// Per-packet descriptor of an isochronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacketDescriptor {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacketDescriptor {
    pub const SIZE: usize = 16;

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            offset: be_u32(bytes, 0),
            length: be_u32(bytes, 4),
            actual_length: be_u32(bytes, 8),
            status: be_i32(bytes, 12),
        }
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut result = [0u8; 16];
        result[0..4].copy_from_slice(&self.offset.to_be_bytes());
        result[4..8].copy_from_slice(&self.length.to_be_bytes());
        result[8..12].copy_from_slice(&self.actual_length.to_be_bytes());
        result[12..16].copy_from_slice(&self.status.to_be_bytes());
        result
    }
}

async fn read_iso_packets<T: AsyncRead + Unpin>(
    socket: &mut T,
    count: u32,
) -> Result<Vec<IsoPacketDescriptor>> {
    let mut raw = alloc_buffer(count as usize * IsoPacketDescriptor::SIZE)?;
    socket.read_exact(&mut raw).await?;
    Ok(raw
        .chunks_exact(IsoPacketDescriptor::SIZE)
        .map(IsoPacketDescriptor::from_bytes)
        .collect())
}

/// USBIP_CMD_SUBMIT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdSubmit {
    pub header: UsbIpHeaderBasic,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub setup: [u8; 8],
    /// OUT payload; empty for IN transfers
    pub data: Vec<u8>,
    pub iso_packets: Vec<IsoPacketDescriptor>,
}

/// USBIP_CMD_UNLINK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdUnlink {
    pub header: UsbIpHeaderBasic,
    pub unlink_seqnum: u32,
}

/// Client side commands from the Virtual Host Controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbIpCommand {
    Submit(CmdSubmit),
    Unlink(CmdUnlink),
}

impl UsbIpCommand {
    pub fn header(&self) -> &UsbIpHeaderBasic {
        match self {
            UsbIpCommand::Submit(cmd) => &cmd.header,
            UsbIpCommand::Unlink(cmd) => &cmd.header,
        }
    }

    /// Receive exactly one command from a socket
    ///
    /// Reads the fixed 48 byte header first, then the OUT payload and the iso
    /// packet descriptors. Declared sizes are checked against `config` before
    /// anything is allocated. Descriptors follow only when `is_iso_pipe`
    /// reports the target endpoint as isochronous; `number_of_packets` is
    /// ignored on other pipes.
    pub async fn read_from_socket<T, F>(
        socket: &mut T,
        config: &StubConfig,
        is_iso_pipe: F,
    ) -> Result<UsbIpCommand>
    where
        T: AsyncRead + Unpin,
        F: Fn(u32, Direction) -> bool,
    {
        let mut raw = [0u8; USBIP_HEADER_SIZE];
        socket.read_exact(&mut raw).await?;
        let header = decode_header(&raw)?;
        let body = &raw[UsbIpHeaderBasic::SIZE..];

        match header.command {
            USBIP_CMD_SUBMIT => {
                let direction = direction_from_wire(header.direction)?;
                let transfer_buffer_length = be_i32(body, 4);
                if transfer_buffer_length < 0
                    || transfer_buffer_length as u32 > config.max_transfer_length
                {
                    return Err(ProtocolError::SizeLimit {
                        length: transfer_buffer_length.into(),
                        max: config.max_transfer_length,
                    }
                    .into());
                }
                let number_of_packets = be_u32(body, 12);
                let iso = is_iso_pipe(header.ep, direction) && has_iso_packets(number_of_packets);
                // negative counts wrap above any limit
                if iso && number_of_packets > config.max_iso_packets {
                    return Err(ProtocolError::InvalidIsoPacketCount {
                        count: (number_of_packets as i32).into(),
                        max: config.max_iso_packets,
                    }
                    .into());
                }

                let mut setup = [0u8; 8];
                setup.copy_from_slice(&body[20..28]);

                let data = if direction == Direction::Out && transfer_buffer_length > 0 {
                    let mut data = alloc_buffer(transfer_buffer_length as usize)?;
                    socket.read_exact(&mut data).await?;
                    data
                } else {
                    vec![]
                };

                // The kernel docs specifies that this should be set to 0xFFFFFFFF for all
                // non-ISO packets, however the actual implementation resorts to 0x00000000
                let iso_packets = if iso {
                    read_iso_packets(socket, number_of_packets).await?
                } else {
                    vec![]
                };

                Ok(UsbIpCommand::Submit(CmdSubmit {
                    header,
                    transfer_flags: be_u32(body, 0),
                    transfer_buffer_length: transfer_buffer_length as u32,
                    start_frame: be_u32(body, 8),
                    number_of_packets,
                    interval: be_u32(body, 16),
                    setup,
                    data,
                    iso_packets,
                }))
            }
            USBIP_CMD_UNLINK => Ok(UsbIpCommand::Unlink(CmdUnlink {
                header,
                unlink_seqnum: be_u32(body, 0),
            })),
            other => Err(ProtocolError::UnknownCommand(other).into()),
        }
    }

    /// Converts the [UsbIpCommand] into a byte vector, as a client sends it
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            UsbIpCommand::Submit(cmd) => {
                let mut result = Vec::with_capacity(
                    USBIP_HEADER_SIZE
                        + cmd.data.len()
                        + cmd.iso_packets.len() * IsoPacketDescriptor::SIZE,
                );
                result.extend_from_slice(&cmd.header.to_bytes());
                result.extend_from_slice(&cmd.transfer_flags.to_be_bytes());
                result.extend_from_slice(&cmd.transfer_buffer_length.to_be_bytes());
                result.extend_from_slice(&cmd.start_frame.to_be_bytes());
                result.extend_from_slice(&cmd.number_of_packets.to_be_bytes());
                result.extend_from_slice(&cmd.interval.to_be_bytes());
                result.extend_from_slice(&cmd.setup);
                result.extend_from_slice(&cmd.data);
                for packet in &cmd.iso_packets {
                    result.extend_from_slice(&packet.to_bytes());
                }
                result
            }
            UsbIpCommand::Unlink(cmd) => {
                let mut result = Vec::with_capacity(USBIP_HEADER_SIZE);
                result.extend_from_slice(&cmd.header.to_bytes());
                result.extend_from_slice(&cmd.unlink_seqnum.to_be_bytes());
                result.extend_from_slice(&[0; 24]);
                result
            }
        }
    }
}

/// USBIP_RET_SUBMIT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetSubmit {
    pub header: UsbIpHeaderBasic,
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
    /// IN payload; iso data is packed without gaps between packets
    pub transfer_buffer: Vec<u8>,
    pub iso_packets: Vec<IsoPacketDescriptor>,
}

impl RetSubmit {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(
            USBIP_HEADER_SIZE
                + self.transfer_buffer.len()
                + self.iso_packets.len() * IsoPacketDescriptor::SIZE,
        );
        result.extend_from_slice(&self.header.to_bytes());
        result.extend_from_slice(&self.status.to_be_bytes());
        result.extend_from_slice(&self.actual_length.to_be_bytes());
        result.extend_from_slice(&self.start_frame.to_be_bytes());
        result.extend_from_slice(&self.number_of_packets.to_be_bytes());
        result.extend_from_slice(&self.error_count.to_be_bytes());
        result.extend_from_slice(&[0; 8]);
        result.extend_from_slice(&self.transfer_buffer);
        for packet in &self.iso_packets {
            result.extend_from_slice(&packet.to_bytes());
        }
        result
    }
}

/// USBIP_RET_UNLINK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub header: UsbIpHeaderBasic,
    pub status: i32,
}

impl RetUnlink {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(USBIP_HEADER_SIZE);
        result.extend_from_slice(&self.header.to_bytes());
        result.extend_from_slice(&self.status.to_be_bytes());
        result.extend_from_slice(&[0; 24]);
        result
    }
}

/// Server side replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbIpReply {
    Submit(RetSubmit),
    Unlink(RetUnlink),
}

impl UsbIpReply {
    pub fn seqnum(&self) -> u32 {
        match self {
            UsbIpReply::Submit(ret) => ret.header.seqnum,
            UsbIpReply::Unlink(ret) => ret.header.seqnum,
        }
    }

    /// Receive one reply, as the vhci side does
    ///
    /// RET_SUBMIT does not say whether a payload follows, so the caller maps
    /// the seqnum back to the direction of the request it submitted.
    pub async fn read_from_socket<T, F>(socket: &mut T, direction_of: F) -> Result<UsbIpReply>
    where
        T: AsyncRead + Unpin,
        F: Fn(u32) -> Direction,
    {
        let mut raw = [0u8; USBIP_HEADER_SIZE];
        socket.read_exact(&mut raw).await?;
        let header = decode_header(&raw)?;
        let body = &raw[UsbIpHeaderBasic::SIZE..];

        match header.command {
            USBIP_RET_SUBMIT => {
                let actual_length = be_u32(body, 4);
                let number_of_packets = be_u32(body, 12);
                let transfer_buffer =
                    if direction_of(header.seqnum) == Direction::In && actual_length > 0 {
                        let mut data = alloc_buffer(actual_length as usize)?;
                        socket.read_exact(&mut data).await?;
                        data
                    } else {
                        vec![]
                    };
                let iso_packets = if has_iso_packets(number_of_packets) {
                    if number_of_packets > USBIP_MAX_ISO_PACKETS {
                        return Err(ProtocolError::InvalidIsoPacketCount {
                            count: number_of_packets.into(),
                            max: USBIP_MAX_ISO_PACKETS,
                        }
                        .into());
                    }
                    read_iso_packets(socket, number_of_packets).await?
                } else {
                    vec![]
                };
                Ok(UsbIpReply::Submit(RetSubmit {
                    header,
                    status: be_i32(body, 0),
                    actual_length,
                    start_frame: be_u32(body, 8),
                    number_of_packets,
                    error_count: be_u32(body, 16),
                    transfer_buffer,
                    iso_packets,
                }))
            }
            USBIP_RET_UNLINK => Ok(UsbIpReply::Unlink(RetUnlink {
                header,
                status: be_i32(body, 0),
            })),
            other => Err(ProtocolError::UnknownCommand(other).into()),
        }
    }
}

/// Serialize a finished transfer as RET_SUBMIT, consuming its buffers
///
/// IN data of split transfers is concatenated in part order. Iso IN data is
/// taken packet by packet (`actual_length` bytes at each packet's offset) and
/// packed back to back, followed by the packet descriptors.
pub fn encode_ret_submit(
    transfer: ReadyTransfer,
) -> std::result::Result<Vec<u8>, ProtocolError> {
    let actual_length = transfer.actual_length();
    let iso = transfer.kind == TransferKind::Isochronous;

    let mut payload = Vec::new();
    if transfer.direction == Direction::In && actual_length > 0 {
        if iso {
            let buffer = transfer
                .parts
                .first()
                .map(|part| part.buffer.as_slice())
                .unwrap_or(&[]);
            let mut packed = 0u32;
            for (index, packet) in transfer.iso_packets.iter().enumerate() {
                let start = packet.offset as usize;
                let end = start + packet.actual_length as usize;
                let chunk = buffer
                    .get(start..end)
                    .ok_or(ProtocolError::InvalidIsoPacket { index })?;
                payload.extend_from_slice(chunk);
                packed += packet.actual_length;
            }
            if packed != actual_length {
                return Err(ProtocolError::IsoLengthMismatch {
                    seqnum: transfer.seqnum,
                    packets: packed,
                    actual: actual_length,
                });
            }
        } else {
            payload.reserve(actual_length as usize);
            for part in &transfer.parts {
                payload.extend_from_slice(&part.buffer[..part.actual_length as usize]);
            }
        }
    }

    let number_of_packets = if iso {
        transfer.iso_packets.len() as u32
    } else {
        0
    };
    Ok(RetSubmit {
        header: UsbIpHeaderBasic::reply(USBIP_RET_SUBMIT, transfer.seqnum),
        status: transfer.status,
        actual_length,
        start_frame: transfer.start_frame,
        number_of_packets,
        error_count: transfer.error_count,
        transfer_buffer: payload,
        iso_packets: if iso { transfer.iso_packets } else { vec![] },
    }
    .to_bytes())
}

/// Serialize RET_UNLINK; `seqnum` is the seqnum of the CMD_UNLINK being answered
pub fn encode_ret_unlink(seqnum: u32, status: i32) -> Vec<u8> {
    RetUnlink {
        header: UsbIpHeaderBasic::reply(USBIP_RET_UNLINK, seqnum),
        status,
    }
    .to_bytes()
}
