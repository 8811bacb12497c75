//! Transaction frame format for the write-ahead log.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use vellum_common::{BlockId, Result, VellumError, BLOCK_SIZE};

/// Upper bound on blocks per frame, used to reject garbage counts while
/// parsing a possibly torn log tail.
const MAX_BLOCKS_PER_FRAME: usize = 1 << 20;

/// A full block image captured at commit time.
#[derive(Debug, Clone)]
pub struct BlockImage {
    /// Id of the block in the data file.
    pub block_id: BlockId,
    /// The 4096-byte block contents.
    pub data: Bytes,
}

impl BlockImage {
    /// Creates a block image, asserting the block-sized payload.
    pub fn new(block_id: BlockId, data: Bytes) -> Self {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        Self { block_id, data }
    }
}

/// One committed transaction in the log: every block the transaction
/// dirtied, as full images, protected by a trailing CRC32.
///
/// Frame format on disk:
/// - frame_len: 4 bytes (length of everything after this field)
/// - txn_seq: 8 bytes (monotonic commit sequence number)
/// - block_count: 4 bytes
/// - blocks: block_count times (block_id: 8 bytes, data: 4096 bytes)
/// - checksum: 4 bytes (CRC32 of txn_seq through the last block)
///
/// A torn write leaves a frame whose checksum does not verify; replay
/// treats that frame and everything after it as uncommitted.
#[derive(Debug, Clone)]
pub struct TxnFrame {
    /// Commit sequence number of this transaction.
    pub txn_seq: u64,
    /// Block images written by this transaction, in write order.
    pub blocks: Vec<BlockImage>,
}

impl TxnFrame {
    /// Size of the frame length prefix in bytes.
    pub const LEN_PREFIX_SIZE: usize = 4;
    /// Size of the checksum in bytes.
    pub const CHECKSUM_SIZE: usize = 4;

    /// Creates a new transaction frame.
    pub fn new(txn_seq: u64, blocks: Vec<BlockImage>) -> Self {
        Self { txn_seq, blocks }
    }

    /// Returns the total size of this frame on disk.
    pub fn size_on_disk(&self) -> usize {
        Self::LEN_PREFIX_SIZE + self.body_len()
    }

    /// Length of the frame body (everything after the length prefix).
    fn body_len(&self) -> usize {
        8 + 4 + self.blocks.len() * (8 + BLOCK_SIZE) + Self::CHECKSUM_SIZE
    }

    /// Serializes this frame to bytes.
    pub fn serialize(&self) -> Bytes {
        let body_len = self.body_len();
        let mut buf = BytesMut::with_capacity(Self::LEN_PREFIX_SIZE + body_len);

        buf.put_u32_le(body_len as u32);

        let body_start = buf.len();
        buf.put_u64_le(self.txn_seq);
        buf.put_u32_le(self.blocks.len() as u32);
        for image in &self.blocks {
            buf.put_u64_le(image.block_id);
            buf.put_slice(&image.data);
        }

        let checksum = crc32fast::hash(&buf[body_start..]);
        buf.put_u32_le(checksum);

        buf.freeze()
    }

    /// Deserializes one frame from the front of `data`.
    ///
    /// Returns the frame and the number of bytes consumed.
    pub fn deserialize(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < Self::LEN_PREFIX_SIZE {
            return Err(VellumError::LogCorrupted {
                reason: "truncated frame length".to_string(),
            });
        }

        let mut cursor = data;
        let body_len = cursor.get_u32_le() as usize;

        if body_len < 8 + 4 + Self::CHECKSUM_SIZE || cursor.len() < body_len {
            return Err(VellumError::LogCorrupted {
                reason: "truncated frame body".to_string(),
            });
        }

        let body = &data[Self::LEN_PREFIX_SIZE..Self::LEN_PREFIX_SIZE + body_len];
        let (payload, checksum_bytes) = body.split_at(body_len - Self::CHECKSUM_SIZE);
        let stored_checksum = u32::from_le_bytes([
            checksum_bytes[0],
            checksum_bytes[1],
            checksum_bytes[2],
            checksum_bytes[3],
        ]);
        let computed_checksum = crc32fast::hash(payload);
        if stored_checksum != computed_checksum {
            return Err(VellumError::LogCorrupted {
                reason: format!(
                    "checksum mismatch: stored={}, computed={}",
                    stored_checksum, computed_checksum
                ),
            });
        }

        let mut payload_cursor = payload;
        let txn_seq = payload_cursor.get_u64_le();
        let block_count = payload_cursor.get_u32_le() as usize;

        if block_count > MAX_BLOCKS_PER_FRAME
            || payload_cursor.len() != block_count * (8 + BLOCK_SIZE)
        {
            return Err(VellumError::LogCorrupted {
                reason: format!("invalid block count: {}", block_count),
            });
        }

        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let block_id = payload_cursor.get_u64_le();
            let data = Bytes::copy_from_slice(&payload_cursor[..BLOCK_SIZE]);
            payload_cursor.advance(BLOCK_SIZE);
            blocks.push(BlockImage { block_id, data });
        }

        Ok((
            Self { txn_seq, blocks },
            Self::LEN_PREFIX_SIZE + body_len,
        ))
    }
}
