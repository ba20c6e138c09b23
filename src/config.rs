use super::*;

/// Default CMD_SUBMIT buffer limit (16 MiB)
pub const DEFAULT_MAX_TRANSFER_LENGTH: u32 = 16 * 1024 * 1024;
/// Default part size for split bulk transfers
pub const DEFAULT_SG_CHUNK_SIZE: usize = 4096;

/// Tunables for a stub connection
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StubConfig {
    /// Largest `transfer_buffer_length` accepted in CMD_SUBMIT
    pub max_transfer_length: u32,
    /// Largest `number_of_packets` accepted for isochronous transfers
    pub max_iso_packets: u32,
    /// Part size when a bulk transfer has to be split for the local stack
    pub sg_chunk_size: usize,
    /// How many times teardown polls for outstanding completions
    pub teardown_retries: u32,
    /// Delay between teardown polls, in milliseconds
    pub teardown_retry_interval_ms: u64,
    /// Reject PDUs addressed to another devid
    pub check_devid: bool,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            max_transfer_length: DEFAULT_MAX_TRANSFER_LENGTH,
            max_iso_packets: USBIP_MAX_ISO_PACKETS,
            sg_chunk_size: DEFAULT_SG_CHUNK_SIZE,
            teardown_retries: 5,
            teardown_retry_interval_ms: 100,
            check_devid: true,
        }
    }
}

impl StubConfig {
    pub fn teardown_retry_interval(&self) -> Duration {
        Duration::from_millis(self.teardown_retry_interval_ms)
    }

    /// Number of parts a bulk transfer of `len` bytes is split into
    pub(crate) fn split_parts(&self, len: usize) -> usize {
        let chunk = self.sg_chunk_size.max(1);
        ((len + chunk - 1) / chunk).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_part_count() {
        let config = StubConfig::default();
        assert_eq!(config.split_parts(0), 1);
        assert_eq!(config.split_parts(1), 1);
        assert_eq!(config.split_parts(4096), 1);
        assert_eq!(config.split_parts(4097), 2);
        assert_eq!(config.split_parts(4 * 4096), 4);
    }
}
