use super::*;
use thiserror::Error;

/// Malformed or disallowed traffic from the client
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Truncated header: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Transfer length {length} exceeds limit {max}")]
    SizeLimit { length: i64, max: u32 },

    #[error("Duplicate sequence number {0}")]
    DuplicateSeq(u32),

    #[error("Unknown command: {0:#06X}")]
    UnknownCommand(u32),

    #[error("Invalid direction: {0}")]
    InvalidDirection(u32),

    #[error("Invalid endpoint {ep} ({direction:?})")]
    InvalidEndpoint { ep: u32, direction: Direction },

    #[error("Request for devid {got:#x}, exported device is {expected:#x}")]
    InvalidDevid { expected: u32, got: u32 },

    #[error("Invalid number of iso packets: {count} (max: {max})")]
    InvalidIsoPacketCount { count: i64, max: u32 },

    #[error("Iso packet {index} does not fit the transfer buffer")]
    InvalidIsoPacket { index: usize },

    #[error("Iso packets of seqnum {seqnum} account for {packets} bytes, URB reports {actual}")]
    IsoLengthMismatch {
        seqnum: u32,
        packets: u32,
        actual: u32,
    },
}

/// Errors reported by a [LocalUsbStack] when it refuses an URB
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocalStackError {
    #[error("Device is gone")]
    NoDevice,

    #[error("Unsupported transfer: {0}")]
    Unsupported(&'static str),

    #[error("Submission rejected with status {0}")]
    Rejected(i32),
}

/// Everything that can stop a stub connection
///
/// All variants except [StubError::NotAttachable] are connection-fatal.
#[derive(Debug, Error)]
pub enum StubError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of memory allocating {0} bytes")]
    Resource(usize),

    #[error("Local USB stack rejected seqnum {seqnum}: {source}")]
    LocalStack {
        seqnum: u32,
        #[source]
        source: LocalStackError,
    },

    #[error("Device is not attachable in state {0:?}")]
    NotAttachable(ConnectionState),
}

impl StubError {
    /// Whether this error only means the peer went away
    pub fn is_disconnect(&self) -> bool {
        match self {
            StubError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Type alias for stub results
pub type Result<T> = std::result::Result<T, StubError>;

/// Allocate a zeroed transfer buffer without aborting on allocation failure
pub(crate) fn alloc_buffer(len: usize) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| StubError::Resource(len))?;
    buffer.resize(len, 0);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err: StubError = ProtocolError::SizeLimit {
            length: 1 << 30,
            max: 1 << 24,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Protocol error: Transfer length 1073741824 exceeds limit 16777216"
        );

        let err = StubError::LocalStack {
            seqnum: 7,
            source: LocalStackError::Rejected(status::ENODEV),
        };
        assert_eq!(
            err.to_string(),
            "Local USB stack rejected seqnum 7: Submission rejected with status -19"
        );
    }

    #[test]
    fn eof_is_disconnect() {
        let err = StubError::from(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(err.is_disconnect());
        assert!(!StubError::from(ProtocolError::DuplicateSeq(1)).is_disconnect());
    }

    #[test]
    fn huge_allocation_is_resource_error() {
        assert!(matches!(
            alloc_buffer(usize::MAX),
            Err(StubError::Resource(usize::MAX))
        ));
        assert_eq!(alloc_buffer(4).unwrap(), vec![0; 4]);
    }
}
