//! Write-ahead transaction log for Vellum.
//!
//! Dirty blocks are appended to the log as checksummed transaction frames
//! before they reach the data file. On startup the log is replayed forward
//! to reapply committed-but-unsynchronized writes, which restores
//! consistency after a crash.

pub mod record;
pub mod recovery;
pub mod writer;

pub use record::{BlockImage, TxnFrame};
pub use recovery::replay;
pub use writer::TransactionLog;
