//! Forward replay of the transaction log.

use crate::record::TxnFrame;
use crate::writer::{LOG_HEADER_SIZE, LOG_MAGIC, LOG_VERSION};
use log::{debug, info, warn};
use std::io::Read;
use std::path::Path;
use vellum_common::{BlockId, Result, VellumError};

/// Replays committed frames from the log at `path`, invoking `apply` for
/// every block image in commit order.
///
/// Returns the number of frames applied. A missing or empty log yields 0.
/// Scanning stops at the first corrupt or truncated frame: everything from
/// that point on belongs to a commit that never completed and is discarded.
///
/// The caller is responsible for syncing the applied blocks and truncating
/// the log afterwards.
pub fn replay<F>(path: &Path, mut apply: F) -> Result<usize>
where
    F: FnMut(BlockId, &[u8]) -> Result<()>,
{
    if !path.exists() {
        return Ok(0);
    }

    let mut data = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut data)?;

    if data.is_empty() {
        return Ok(0);
    }
    if data.len() < LOG_HEADER_SIZE || data[..4] != LOG_MAGIC {
        return Err(VellumError::Corrupted {
            reason: "transaction log magic mismatch".to_string(),
        });
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != LOG_VERSION {
        return Err(VellumError::Corrupted {
            reason: format!("unsupported transaction log version: {}", version),
        });
    }

    let mut offset = LOG_HEADER_SIZE;
    let mut applied = 0usize;

    while offset < data.len() {
        match TxnFrame::deserialize(&data[offset..]) {
            Ok((frame, consumed)) => {
                debug!(
                    "replaying txn {} ({} blocks)",
                    frame.txn_seq,
                    frame.blocks.len()
                );
                for image in &frame.blocks {
                    apply(image.block_id, &image.data)?;
                }
                offset += consumed;
                applied += 1;
            }
            Err(VellumError::LogCorrupted { reason }) => {
                // Torn tail from an interrupted commit; the preceding
                // frames are still valid.
                warn!(
                    "discarding incomplete log tail at offset {}: {}",
                    offset, reason
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }

    if applied > 0 {
        info!("recovery replayed {} committed transactions", applied);
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::BlockImage;
    use crate::writer::TransactionLog;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::tempdir;
    use vellum_common::BLOCK_SIZE;

    fn frame(seq: u64, entries: &[(u64, u8)]) -> TxnFrame {
        TxnFrame::new(
            seq,
            entries
                .iter()
                .map(|&(id, fill)| BlockImage::new(id, Bytes::from(vec![fill; BLOCK_SIZE])))
                .collect(),
        )
    }

    fn collect_replay(path: &Path) -> (usize, HashMap<u64, u8>) {
        let mut state = HashMap::new();
        let applied = replay(path, |block_id, data| {
            state.insert(block_id, data[0]);
            Ok(())
        })
        .unwrap();
        (applied, state)
    }

    #[test]
    fn test_replay_missing_log() {
        let dir = tempdir().unwrap();
        let (applied, state) = collect_replay(&dir.path().join("absent.lg"));
        assert_eq!(applied, 0);
        assert!(state.is_empty());
    }

    #[test]
    fn test_replay_empty_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lg");
        TransactionLog::create(&path, false).unwrap();

        let (applied, state) = collect_replay(&path);
        assert_eq!(applied, 0);
        assert!(state.is_empty());
    }

    #[test]
    fn test_replay_applies_in_commit_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lg");
        {
            let mut log = TransactionLog::create(&path, false).unwrap();
            log.append(&frame(1, &[(1, 0x10), (2, 0x20)])).unwrap();
            // Second txn overwrites block 1; its image must win.
            log.append(&frame(2, &[(1, 0x11)])).unwrap();
            log.sync().unwrap();
        }

        let (applied, state) = collect_replay(&path);
        assert_eq!(applied, 2);
        assert_eq!(state[&1], 0x11);
        assert_eq!(state[&2], 0x20);
    }

    #[test]
    fn test_replay_stops_at_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lg");
        {
            let mut log = TransactionLog::create(&path, false).unwrap();
            log.append(&frame(1, &[(1, 0xAA)])).unwrap();
            log.sync().unwrap();
        }

        // Simulate a crash mid-append: write half of a second frame.
        let torn = frame(2, &[(2, 0xBB)]).serialize();
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(&torn[..torn.len() / 2]).unwrap();
        drop(file);

        let (applied, state) = collect_replay(&path);
        assert_eq!(applied, 1);
        assert_eq!(state[&1], 0xAA);
        assert!(!state.contains_key(&2));
    }

    #[test]
    fn test_replay_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lg");
        std::fs::write(&path, b"NOTALOGFILE").unwrap();

        let result = replay(&path, |_, _| Ok(()));
        assert!(matches!(result, Err(VellumError::Corrupted { .. })));
    }
}
