use super::*;
use crate::usbip_protocol::IsoPacketDescriptor;

/// Where a client-submitted transfer is in its life
///
/// `Submitted -> (Completing | Unlinking) -> ReadyToSend`. A ready transfer
/// leaves the table as a [ReadyTransfer] and is consumed when encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    /// All parts are with the local stack
    Submitted,
    /// Some parts have reported back, some are still in flight
    Completing,
    /// A CMD_UNLINK arrived; the completion turns into a RET_UNLINK
    Unlinking,
    /// Every part reported and no unlink is pending
    ReadyToSend,
}

/// One client-submitted transfer, possibly split into several local URBs
#[derive(Debug)]
pub struct TransferExecutor {
    seqnum: u32,
    direction: Direction,
    kind: TransferKind,
    state: TransferState,
    /// Returned URBs, indexed by part; `None` while the part is in flight
    parts: Vec<Option<Urb>>,
    completed: usize,
    status: i32,
    /// Seqnum of the CMD_UNLINK to answer instead of sending RET_SUBMIT
    unlink_seqnum: Option<u32>,
}

/// What a fully completed transfer turns into
#[derive(Debug)]
pub enum Finished {
    Reply(ReadyTransfer),
    Unlinked(UnlinkRequest),
}

impl TransferExecutor {
    pub fn new(seqnum: u32, direction: Direction, kind: TransferKind, num_parts: usize) -> Self {
        let num_parts = num_parts.max(1);
        Self {
            seqnum,
            direction,
            kind,
            state: TransferState::Submitted,
            parts: (0..num_parts).map(|_| None).collect(),
            completed: 0,
            status: status::OK,
            unlink_seqnum: None,
        }
    }

    pub fn seqnum(&self) -> u32 {
        self.seqnum
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }

    pub fn completed_parts(&self) -> usize {
        self.completed
    }

    pub fn is_unlinking(&self) -> bool {
        self.unlink_seqnum.is_some()
    }

    /// Status reported so far: the first non-zero part status
    pub fn merged_status(&self) -> i32 {
        self.status
    }

    /// Parts still held by the local stack
    pub fn outstanding(&self) -> Vec<UrbId> {
        self.parts
            .iter()
            .enumerate()
            .filter(|(_, part)| part.is_none())
            .map(|(part, _)| UrbId {
                seqnum: self.seqnum,
                part,
            })
            .collect()
    }

    /// Record one returned part. Returns true once every part has reported.
    ///
    /// Only the first non-zero status survives the merge; later errors are
    /// logged and dropped.
    pub fn on_local_completion(&mut self, urb: Urb) -> bool {
        let part = urb.id.part;
        match self.parts.get(part) {
            Some(None) => {}
            Some(Some(_)) => {
                error!("seqnum {} part {} completed twice", self.seqnum, part);
                return false;
            }
            None => {
                error!(
                    "seqnum {} has {} parts, got completion for part {}",
                    self.seqnum,
                    self.parts.len(),
                    part
                );
                return false;
            }
        }

        if urb.status != status::OK {
            if self.status == status::OK {
                self.status = urb.status;
            } else {
                debug!(
                    "seqnum {} part {}: dropping status {} after {}",
                    self.seqnum, part, urb.status, self.status
                );
            }
        }
        self.parts[part] = Some(urb);
        self.completed += 1;

        if self.completed < self.parts.len() {
            if self.state == TransferState::Submitted {
                self.state = TransferState::Completing;
            }
            return false;
        }
        if self.state != TransferState::Unlinking {
            self.state = TransferState::ReadyToSend;
        }
        true
    }

    /// Divert the result into a RET_UNLINK for `unlink_seqnum`.
    ///
    /// Returns the parts that still need cancelling at the local stack.
    pub fn mark_unlinking(&mut self, unlink_seqnum: u32) -> Vec<UrbId> {
        self.unlink_seqnum = Some(unlink_seqnum);
        self.state = TransferState::Unlinking;
        self.outstanding()
    }

    /// Turn a fully completed executor into its reply
    ///
    /// An unlinked transfer releases its buffers here and only its status
    /// travels on.
    pub fn finish(self) -> Finished {
        debug_assert_eq!(self.completed, self.parts.len());

        if let Some(unlink_seqnum) = self.unlink_seqnum {
            return Finished::Unlinked(UnlinkRequest {
                seqnum: unlink_seqnum,
                unlink_seqnum: self.seqnum,
                status: self.status,
            });
        }

        let mut urbs = self.parts.into_iter().flatten();
        let first = urbs.next();
        let (start_frame, mut error_count, iso_packets) = match &first {
            Some(urb) => (urb.start_frame, urb.error_count, urb.iso_packets.clone()),
            None => (0, 0, vec![]),
        };

        let mut parts = Vec::new();
        for urb in first.into_iter().chain(urbs) {
            if urb.id.part > 0 {
                error_count += urb.error_count;
            }
            let mut actual_length = urb.actual_length;
            if actual_length as usize > urb.buffer.len() {
                error!(
                    "seqnum {} part {}: actual_length {} exceeds buffer of {}",
                    self.seqnum,
                    urb.id.part,
                    actual_length,
                    urb.buffer.len()
                );
                actual_length = urb.buffer.len() as u32;
            }
            parts.push(TransferPart {
                buffer: urb.buffer,
                actual_length,
            });
        }

        Finished::Reply(ReadyTransfer {
            seqnum: self.seqnum,
            direction: self.direction,
            kind: self.kind,
            status: self.status,
            start_frame,
            error_count,
            iso_packets,
            parts,
        })
    }
}

/// The buffer of one returned URB
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPart {
    pub buffer: Vec<u8>,
    pub actual_length: u32,
}

/// A transfer waiting for TX to write its RET_SUBMIT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyTransfer {
    pub seqnum: u32,
    pub direction: Direction,
    pub kind: TransferKind,
    pub status: i32,
    pub start_frame: u32,
    pub error_count: u32,
    pub iso_packets: Vec<IsoPacketDescriptor>,
    /// Part buffers in part order
    pub parts: Vec<TransferPart>,
}

impl ReadyTransfer {
    /// Sum of the actual lengths of all parts
    pub fn actual_length(&self) -> u32 {
        self.parts.iter().map(|part| part.actual_length).sum()
    }
}
