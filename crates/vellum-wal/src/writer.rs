//! Append-side of the transaction log.

use crate::record::TxnFrame;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use vellum_common::{Result, VellumError};

/// Magic bytes identifying a Vellum transaction log.
pub const LOG_MAGIC: [u8; 4] = *b"VWAL";

/// Current log format version.
pub const LOG_VERSION: u32 = 1;

/// Size of the log file header in bytes.
pub const LOG_HEADER_SIZE: usize = 8;

/// Appends committed transaction frames to the log file.
///
/// The log starts empty (recovery replays and truncates any previous log
/// before the store comes up) and grows by one frame per commit. After
/// `txns_before_sync` commits the caller synchronizes the logged blocks into
/// the data file and calls [`TransactionLog::truncate`].
pub struct TransactionLog {
    path: PathBuf,
    file: File,
    fsync_enabled: bool,
    pending_txns: usize,
    next_seq: u64,
}

impl TransactionLog {
    /// Creates a fresh, empty log at `path`, replacing any existing file.
    pub fn create(path: &Path, fsync_enabled: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.write_all(&LOG_MAGIC)?;
        file.write_all(&LOG_VERSION.to_le_bytes())?;
        if fsync_enabled {
            file.sync_all()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            fsync_enabled,
            pending_txns: 0,
            next_seq: 1,
        })
    }

    /// Returns the log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of committed frames since the last truncation.
    pub fn pending_txns(&self) -> usize {
        self.pending_txns
    }

    /// Allocates the next commit sequence number.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Appends a transaction frame to the log.
    ///
    /// The frame is not durable until [`TransactionLog::sync`] returns.
    pub fn append(&mut self, frame: &TxnFrame) -> Result<()> {
        if frame.txn_seq != self.next_seq {
            return Err(VellumError::Internal(format!(
                "out-of-order commit sequence: expected {}, got {}",
                self.next_seq, frame.txn_seq
            )));
        }

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&frame.serialize())?;
        self.pending_txns += 1;
        self.next_seq += 1;
        Ok(())
    }

    /// Forces appended frames to disk.
    pub fn sync(&mut self) -> Result<()> {
        if self.fsync_enabled {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Discards all logged frames after they have been synchronized into
    /// the data file.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(LOG_HEADER_SIZE as u64)?;
        self.file.seek(SeekFrom::End(0))?;
        if self.fsync_enabled {
            self.file.sync_all()?;
        }
        self.pending_txns = 0;
        Ok(())
    }

    /// Syncs and closes the log file.
    pub fn close(mut self) -> Result<()> {
        self.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::BlockImage;
    use bytes::Bytes;
    use tempfile::tempdir;
    use vellum_common::BLOCK_SIZE;

    fn frame(seq: u64, block_id: u64) -> TxnFrame {
        TxnFrame::new(
            seq,
            vec![BlockImage::new(
                block_id,
                Bytes::from(vec![seq as u8; BLOCK_SIZE]),
            )],
        )
    }

    #[test]
    fn test_log_create() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lg");
        let log = TransactionLog::create(&path, false).unwrap();

        assert_eq!(log.pending_txns(), 0);
        assert_eq!(log.next_seq(), 1);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            LOG_HEADER_SIZE as u64
        );
    }

    #[test]
    fn test_log_append_and_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lg");
        let mut log = TransactionLog::create(&path, false).unwrap();

        log.append(&frame(1, 10)).unwrap();
        log.append(&frame(2, 11)).unwrap();
        log.sync().unwrap();
        assert_eq!(log.pending_txns(), 2);
        assert!(std::fs::metadata(&path).unwrap().len() > LOG_HEADER_SIZE as u64);

        log.truncate().unwrap();
        assert_eq!(log.pending_txns(), 0);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            LOG_HEADER_SIZE as u64
        );

        // Sequence numbers keep increasing across truncation
        assert_eq!(log.next_seq(), 3);
        log.append(&frame(3, 12)).unwrap();
    }

    #[test]
    fn test_log_rejects_out_of_order_seq() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lg");
        let mut log = TransactionLog::create(&path, false).unwrap();

        let result = log.append(&frame(5, 1));
        assert!(matches!(result, Err(VellumError::Internal(_))));
    }

    #[test]
    fn test_log_create_replaces_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lg");

        {
            let mut log = TransactionLog::create(&path, false).unwrap();
            log.append(&frame(1, 1)).unwrap();
            log.sync().unwrap();
        }

        let log = TransactionLog::create(&path, false).unwrap();
        assert_eq!(log.pending_txns(), 0);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            LOG_HEADER_SIZE as u64
        );
    }
}
