//! cinfo sidecar codec.
//!
//! Each cached data file is paired with a sidecar holding the block
//! bitmap, the checksum state, and a bounded ring of access records. The
//! layout is a little-endian binary format gated by a magic and a version;
//! anything that fails validation invalidates the cached copy.
//!
//! Layout v1:
//!
//! ```text
//! magic    [u8; 4]  = "XPCI"
//! version  u32      = 1
//! block_size u64
//! file_size  u64
//! creation   i64    unix seconds
//! cksum      u8     checksum state
//! reserved   [u8; 7]
//! bitmap     ceil(n_blocks / 8) bytes
//! ring_len   u32    number of stored access records (<= RING_CAPACITY)
//! records    ring_len x 56 bytes
//! ```

use serde::Serialize;

/// Sidecar magic bytes.
pub const MAGIC: [u8; 4] = *b"XPCI";
/// Current layout version.
pub const VERSION: u32 = 1;
/// Bound on retained access records.
pub const RING_CAPACITY: usize = 20;

const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 8 + 1 + 7;
const RECORD_LEN: usize = 8 + 8 + 4 + 4 + 8 + 8 + 8 + 8;

/// Checksum verification state of the cached copy.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub enum CkSumState {
    /// No checksum policy applied.
    #[default]
    None,
    /// Verified against the cache-side checksum.
    Cache,
    /// Verified against the network-side checksum.
    Net,
    /// Verified against both.
    Both,
    /// Required but not yet verified; subject to `uvkeep` purging.
    Unverified,
}

impl CkSumState {
    fn to_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Cache => 1,
            Self::Net => 2,
            Self::Both => 3,
            Self::Unverified => 4,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::None,
            1 => Self::Cache,
            2 => Self::Net,
            3 => Self::Both,
            4 => Self::Unverified,
            _ => return None,
        })
    }
}

/// One attach/detach episode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct AccessRecord {
    /// Attach time, unix seconds.
    pub attach_time: i64,
    /// Detach time, unix seconds (0 while attached).
    pub detach_time: i64,
    /// I/O operations in the episode.
    pub num_ios: u32,
    /// Merged adjacent requests.
    pub num_merges: u32,
    /// Bytes served from local blocks.
    pub bytes_hit: u64,
    /// Bytes fetched from upstream.
    pub bytes_missed: u64,
    /// Bytes passed through without caching.
    pub bytes_bypassed: u64,
    /// Bytes written by the client.
    pub bytes_written: u64,
}

/// Decoded sidecar.
#[derive(Clone, Debug, PartialEq)]
pub struct CInfo {
    block_size: u64,
    file_size: u64,
    creation_time: i64,
    cksum_state: CkSumState,
    bitmap: Vec<u8>,
    ring: Vec<AccessRecord>,
}

impl CInfo {
    /// Creates a fresh sidecar with an all-clear bitmap.
    #[must_use]
    pub fn new(block_size: u64, file_size: u64, creation_time: i64) -> Self {
        let blocks = n_blocks_for(file_size, block_size);
        Self {
            block_size,
            file_size,
            creation_time,
            cksum_state: CkSumState::None,
            bitmap: vec![0u8; blocks.div_ceil(8) as usize],
            ring: Vec::new(),
        }
    }

    /// Block size recorded for this file.
    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    /// File size recorded for this file.
    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Creation time, unix seconds.
    #[must_use]
    pub const fn creation_time(&self) -> i64 {
        self.creation_time
    }

    /// Checksum state of the cached copy.
    #[must_use]
    pub const fn cksum_state(&self) -> CkSumState {
        self.cksum_state
    }

    /// Sets the checksum state.
    pub fn set_cksum_state(&mut self, state: CkSumState) {
        self.cksum_state = state;
    }

    /// Number of blocks covered by the bitmap.
    #[must_use]
    pub const fn n_blocks(&self) -> u64 {
        n_blocks_for(self.file_size, self.block_size)
    }

    /// True when block `index` is present on disk.
    #[must_use]
    pub fn test_bit(&self, index: u64) -> bool {
        let byte = (index / 8) as usize;
        let mask = 1u8 << (index % 8);
        self.bitmap.get(byte).is_some_and(|b| b & mask != 0)
    }

    /// Marks block `index` present.
    pub fn set_bit(&mut self, index: u64) {
        let byte = (index / 8) as usize;
        if byte < self.bitmap.len() {
            self.bitmap[byte] |= 1u8 << (index % 8);
        }
    }

    /// Clears block `index`, e.g. after a failed write-back.
    pub fn clear_bit(&mut self, index: u64) {
        let byte = (index / 8) as usize;
        if byte < self.bitmap.len() {
            self.bitmap[byte] &= !(1u8 << (index % 8));
        }
    }

    /// Number of present blocks.
    #[must_use]
    pub fn bits_set(&self) -> u64 {
        self.bitmap.iter().map(|b| u64::from(b.count_ones())).sum()
    }

    /// True when every block is present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.bits_set() == self.n_blocks()
    }

    /// Access-record ring, oldest first.
    #[must_use]
    pub fn accesses(&self) -> &[AccessRecord] {
        &self.ring
    }

    /// Appends an access record, dropping the oldest past the bound.
    pub fn record_access(&mut self, record: AccessRecord) {
        if self.ring.len() == RING_CAPACITY {
            self.ring.remove(0);
        }
        self.ring.push(record);
    }

    /// Time of the most recent recorded detach, falling back to creation.
    #[must_use]
    pub fn last_access_time(&self) -> i64 {
        self.ring
            .last()
            .map(|r| if r.detach_time > 0 { r.detach_time } else { r.attach_time })
            .unwrap_or(self.creation_time)
    }

    /// Encodes the sidecar.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            HEADER_LEN + self.bitmap.len() + 4 + self.ring.len() * RECORD_LEN,
        );
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&self.block_size.to_le_bytes());
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out.extend_from_slice(&self.creation_time.to_le_bytes());
        out.push(self.cksum_state.to_u8());
        out.extend_from_slice(&[0u8; 7]);
        out.extend_from_slice(&self.bitmap);
        out.extend_from_slice(&(self.ring.len() as u32).to_le_bytes());
        for record in &self.ring {
            out.extend_from_slice(&record.attach_time.to_le_bytes());
            out.extend_from_slice(&record.detach_time.to_le_bytes());
            out.extend_from_slice(&record.num_ios.to_le_bytes());
            out.extend_from_slice(&record.num_merges.to_le_bytes());
            out.extend_from_slice(&record.bytes_hit.to_le_bytes());
            out.extend_from_slice(&record.bytes_missed.to_le_bytes());
            out.extend_from_slice(&record.bytes_bypassed.to_le_bytes());
            out.extend_from_slice(&record.bytes_written.to_le_bytes());
        }
        out
    }

    /// Decodes a sidecar, reporting the first inconsistency found.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < HEADER_LEN {
            return Err(format!("truncated header: {} bytes", bytes.len()));
        }
        if bytes[0..4] != MAGIC {
            return Err("bad magic".to_owned());
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().expect("slice len"));
        if version != VERSION {
            return Err(format!("unsupported version {version}"));
        }
        let block_size = u64::from_le_bytes(bytes[8..16].try_into().expect("slice len"));
        let file_size = u64::from_le_bytes(bytes[16..24].try_into().expect("slice len"));
        let creation_time = i64::from_le_bytes(bytes[24..32].try_into().expect("slice len"));
        let cksum_state = CkSumState::from_u8(bytes[32])
            .ok_or_else(|| format!("bad checksum state {}", bytes[32]))?;
        if block_size == 0 {
            return Err("zero block size".to_owned());
        }

        let blocks = n_blocks_for(file_size, block_size);
        let bitmap_len = blocks.div_ceil(8) as usize;
        let bitmap_end = HEADER_LEN + bitmap_len;
        if bytes.len() < bitmap_end + 4 {
            return Err("truncated bitmap".to_owned());
        }
        let bitmap = bytes[HEADER_LEN..bitmap_end].to_vec();

        let ring_len = u32::from_le_bytes(
            bytes[bitmap_end..bitmap_end + 4].try_into().expect("slice len"),
        ) as usize;
        if ring_len > RING_CAPACITY {
            return Err(format!("ring length {ring_len} exceeds capacity"));
        }
        let need = bitmap_end + 4 + ring_len * RECORD_LEN;
        if bytes.len() < need {
            return Err("truncated access ring".to_owned());
        }

        let mut ring = Vec::with_capacity(ring_len);
        let mut at = bitmap_end + 4;
        for _ in 0..ring_len {
            let f = |range: std::ops::Range<usize>| -> [u8; 8] {
                bytes[at + range.start..at + range.end]
                    .try_into()
                    .expect("slice len")
            };
            let g = |range: std::ops::Range<usize>| -> [u8; 4] {
                bytes[at + range.start..at + range.end]
                    .try_into()
                    .expect("slice len")
            };
            ring.push(AccessRecord {
                attach_time: i64::from_le_bytes(f(0..8)),
                detach_time: i64::from_le_bytes(f(8..16)),
                num_ios: u32::from_le_bytes(g(16..20)),
                num_merges: u32::from_le_bytes(g(20..24)),
                bytes_hit: u64::from_le_bytes(f(24..32)),
                bytes_missed: u64::from_le_bytes(f(32..40)),
                bytes_bypassed: u64::from_le_bytes(f(40..48)),
                bytes_written: u64::from_le_bytes(f(48..56)),
            });
            at += RECORD_LEN;
        }

        Ok(Self {
            block_size,
            file_size,
            creation_time,
            cksum_state,
            bitmap,
            ring,
        })
    }
}

/// Blocks needed to cover `file_size` at `block_size`.
#[must_use]
pub const fn n_blocks_for(file_size: u64, block_size: u64) -> u64 {
    if block_size == 0 {
        return 0;
    }
    file_size.div_ceil(block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_length_matches_block_count() {
        let info = CInfo::new(1 << 20, (10 << 20) + 5, 1_700_000_000);
        assert_eq!(info.n_blocks(), 11);
        assert!(!info.is_complete());
    }

    #[test]
    fn bits_flip_independently() {
        let mut info = CInfo::new(1024, 10 * 1024, 0);
        info.set_bit(0);
        info.set_bit(9);
        assert!(info.test_bit(0));
        assert!(!info.test_bit(1));
        assert!(info.test_bit(9));
        assert_eq!(info.bits_set(), 2);

        info.clear_bit(0);
        assert!(!info.test_bit(0));
        assert_eq!(info.bits_set(), 1);
    }

    #[test]
    fn complete_when_all_bits_set() {
        let mut info = CInfo::new(4096, 3 * 4096, 0);
        for block in 0..3 {
            info.set_bit(block);
        }
        assert!(info.is_complete());
    }

    #[test]
    fn round_trip_preserves_everything() {
        let mut info = CInfo::new(1 << 20, 5 << 20, 1_699_999_999);
        info.set_bit(2);
        info.set_bit(4);
        info.set_cksum_state(CkSumState::Unverified);
        info.record_access(AccessRecord {
            attach_time: 1_700_000_000,
            detach_time: 1_700_000_060,
            num_ios: 42,
            num_merges: 3,
            bytes_hit: 1024,
            bytes_missed: 2048,
            bytes_bypassed: 0,
            bytes_written: 512,
        });

        let bytes = info.serialize();
        let decoded = CInfo::deserialize(&bytes).expect("valid sidecar");
        assert_eq!(decoded, info);
        assert_eq!(decoded.last_access_time(), 1_700_000_060);
    }

    #[test]
    fn ring_is_bounded() {
        let mut info = CInfo::new(4096, 4096, 0);
        for i in 0..(RING_CAPACITY as i64 + 5) {
            info.record_access(AccessRecord {
                attach_time: i,
                ..AccessRecord::default()
            });
        }
        assert_eq!(info.accesses().len(), RING_CAPACITY);
        assert_eq!(info.accesses()[0].attach_time, 5);
    }

    #[test]
    fn corrupt_inputs_are_rejected() {
        assert!(CInfo::deserialize(b"short").is_err());

        let mut bytes = CInfo::new(4096, 8192, 0).serialize();
        bytes[0] = b'?';
        assert!(CInfo::deserialize(&bytes).is_err());

        let mut bytes = CInfo::new(4096, 8192, 0).serialize();
        bytes[4] = 99; // version
        assert!(CInfo::deserialize(&bytes).is_err());

        let bytes = CInfo::new(4096, 8192, 0).serialize();
        assert!(CInfo::deserialize(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn last_access_falls_back_to_creation() {
        let info = CInfo::new(4096, 4096, 123);
        assert_eq!(info.last_access_time(), 123);
    }
}
