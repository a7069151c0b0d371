use metrics::Histogram;
use metrics_derive::Metrics;

#[derive(Metrics, Clone)]
#[metrics(scope = "revfs")]
pub struct StoreMetrics {
    /// The number of read-only transactions opened
    #[metrics(describe = "The number of read-only transactions opened")]
    pub(crate) ro_transactions_opened: Histogram,
    /// The number of read-write transactions opened
    #[metrics(describe = "The number of read-write transactions opened")]
    pub(crate) rw_transactions_opened: Histogram,
    /// The size in bytes of committed transaction programs
    #[metrics(describe = "The size in bytes of committed transaction programs")]
    pub(crate) commit_program_bytes: Histogram,
    /// The number of commands applied per commit
    #[metrics(describe = "The number of commands applied per commit")]
    pub(crate) commit_commands: Histogram,
    /// The number of transactions rolled back
    #[metrics(describe = "The number of transactions rolled back")]
    pub(crate) rollbacks: Histogram,
    /// The number of files reclaimed per garbage collector sweep
    #[metrics(describe = "The number of files reclaimed per garbage collector sweep")]
    pub(crate) gc_files_reclaimed: Histogram,
}
