use super::*;

/// In-flight transfers of one connection, keyed by seqnum
///
/// Lives inside the connection lock together with the ready and unlink
/// queues, so every method runs inside one short critical section.
#[derive(Debug, Default)]
pub struct PendingTransferTable {
    entries: HashMap<u32, TransferExecutor>,
}

impl PendingTransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new transfer; a seqnum already in flight is a protocol violation
    pub fn insert(
        &mut self,
        seqnum: u32,
        executor: TransferExecutor,
    ) -> std::result::Result<(), ProtocolError> {
        if self.entries.contains_key(&seqnum) {
            return Err(ProtocolError::DuplicateSeq(seqnum));
        }
        self.entries.insert(seqnum, executor);
        Ok(())
    }

    /// Remove and return a transfer
    pub fn take(&mut self, seqnum: u32) -> Option<TransferExecutor> {
        self.entries.remove(&seqnum)
    }

    pub fn get_mut(&mut self, seqnum: u32) -> Option<&mut TransferExecutor> {
        self.entries.get_mut(&seqnum)
    }

    pub fn contains(&self, seqnum: u32) -> bool {
        self.entries.contains_key(&seqnum)
    }

    /// Remove every transfer, for teardown
    pub fn drain_all(&mut self) -> Vec<TransferExecutor> {
        self.entries.drain().map(|(_, executor)| executor).collect()
    }

    /// Every URB the local stack still holds
    pub fn outstanding_urbs(&self) -> Vec<UrbId> {
        self.entries
            .values()
            .flat_map(|executor| executor.outstanding())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(seqnum: u32, parts: usize) -> TransferExecutor {
        TransferExecutor::new(seqnum, Direction::In, TransferKind::Bulk, parts)
    }

    #[test]
    fn duplicate_seqnum_is_rejected() {
        let mut table = PendingTransferTable::new();
        table.insert(1, executor(1, 1)).unwrap();
        assert_eq!(
            table.insert(1, executor(1, 1)),
            Err(ProtocolError::DuplicateSeq(1))
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn take_is_once() {
        let mut table = PendingTransferTable::new();
        table.insert(7, executor(7, 1)).unwrap();
        assert_eq!(table.take(7).map(|e| e.seqnum()), Some(7));
        assert!(table.take(7).is_none());
        assert!(!table.contains(7));
        // the seqnum is free again once taken
        table.insert(7, executor(7, 1)).unwrap();
    }

    #[test]
    fn drain_returns_everything() {
        let mut table = PendingTransferTable::new();
        for seqnum in 1..=3 {
            table.insert(seqnum, executor(seqnum, 2)).unwrap();
        }
        assert_eq!(table.outstanding_urbs().len(), 6);

        let mut drained: Vec<u32> = table.drain_all().iter().map(|e| e.seqnum()).collect();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2, 3]);
        assert!(table.is_empty());
    }
}
