use crate::program::ChecksumAlgorithm;
use log::LevelFilter;

pub mod logger;

pub use logger::Logger;

/// Options control certain aspects like journal and revision table sizing,
/// the program checksum algorithm, and the log level. They are passed in
/// when creating or opening a store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// The size in bytes of one journal slot; bounds the size of a single
    /// transaction's program.
    journal_slot_size: u32,
    /// The number of journal slots; bounds the number of concurrent
    /// read-write transactions.
    journal_slot_count: u32,
    /// The number of revision table slots; bounds how much issuance history
    /// is retained.
    table_slot_count: u32,
    /// The checksum algorithm stamped into committed programs.
    checksum: ChecksumAlgorithm,
    /// The log level for the store.
    log_level: LevelFilter,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    // Setters
    pub fn with_journal_slot_size(mut self, journal_slot_size: u32) -> Self {
        self.journal_slot_size = journal_slot_size;
        self
    }

    pub fn with_journal_slot_count(mut self, journal_slot_count: u32) -> Self {
        self.journal_slot_count = journal_slot_count;
        self
    }

    pub fn with_table_slot_count(mut self, table_slot_count: u32) -> Self {
        self.table_slot_count = table_slot_count;
        self
    }

    pub fn with_checksum(mut self, checksum: ChecksumAlgorithm) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_log_level(mut self, log_level: LevelFilter) -> Self {
        self.log_level = log_level;
        self
    }

    // Getters
    pub const fn journal_slot_size(&self) -> u32 {
        self.journal_slot_size
    }

    pub const fn journal_slot_count(&self) -> u32 {
        self.journal_slot_count
    }

    pub const fn table_slot_count(&self) -> u32 {
        self.table_slot_count
    }

    pub const fn checksum(&self) -> ChecksumAlgorithm {
        self.checksum
    }

    pub const fn log_level(&self) -> LevelFilter {
        self.log_level
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            // Large enough for a few thousand commands per transaction.
            journal_slot_size: 256 * 1024,
            journal_slot_count: 64,
            table_slot_count: 1024,
            checksum: ChecksumAlgorithm::Crc32,
            log_level: LevelFilter::Info,
        }
    }
}
