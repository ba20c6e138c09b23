use super::*;

/// A RET_UNLINK waiting to be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkRequest {
    /// Seqnum of the CMD_UNLINK; the reply carries it
    pub seqnum: u32,
    /// Seqnum of the transfer the client wanted cancelled
    pub unlink_seqnum: u32,
    pub status: i32,
}

/// FIFO of RET_UNLINK replies
#[derive(Debug, Default)]
pub struct UnlinkQueue {
    queue: VecDeque<UnlinkRequest>,
}

impl UnlinkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, seqnum: u32, unlink_seqnum: u32, status: i32) {
        self.push(UnlinkRequest {
            seqnum,
            unlink_seqnum,
            status,
        });
    }

    pub fn push(&mut self, request: UnlinkRequest) {
        self.queue.push_back(request);
    }

    /// Take every queued reply, oldest first
    pub fn drain(&mut self) -> Vec<UnlinkRequest> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_is_fifo() {
        let mut queue = UnlinkQueue::new();
        queue.enqueue(10, 1, status::ECONNRESET);
        queue.enqueue(11, 2, status::OK);
        queue.enqueue(12, 3, status::OK);

        let seqnums: Vec<u32> = queue.drain().iter().map(|r| r.seqnum).collect();
        assert_eq!(seqnums, vec![10, 11, 12]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }
}
