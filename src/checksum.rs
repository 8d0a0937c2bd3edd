//! Weak rolling checksum and strong digests for block matching.

/// Strong digest algorithms. Blake3 is the default; Md5 is kept for the
/// 16-byte compatibility width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    Blake3,
    Md5,
}

impl Default for ChecksumType {
    fn default() -> Self {
        Self::Blake3
    }
}

impl ChecksumType {
    pub fn digest_len(self) -> usize {
        match self {
            ChecksumType::Blake3 => 32,
            ChecksumType::Md5 => 16,
        }
    }

    /// Recover the algorithm from a digest width seen on the wire.
    pub fn from_digest_len(len: usize) -> Option<Self> {
        match len {
            32 => Some(ChecksumType::Blake3),
            16 => Some(ChecksumType::Md5),
            _ => None,
        }
    }
}

pub const MIN_BLOCK_SIZE: u32 = 1024;
pub const MAX_BLOCK_SIZE: u32 = 128 * 1024;

/// Per-file block size: the power of two nearest sqrt(size), clamped to
/// [1 KiB, 128 KiB].
pub fn block_size_for(file_size: u64) -> u32 {
    let root = (file_size as f64).sqrt();
    let mut upper: u64 = 1;
    while (upper as f64) < root {
        upper <<= 1;
    }
    let lower = upper >> 1;
    let nearest = if lower > 0 && (root - lower as f64) < (upper as f64 - root) {
        lower
    } else {
        upper
    };
    nearest.clamp(MIN_BLOCK_SIZE as u64, MAX_BLOCK_SIZE as u64) as u32
}

/// Rolling weak checksum over a sliding window: byte sum in the low half,
/// positional sum in the high half, both mod 2^16. O(1) per byte of slide.
pub struct RollingChecksum {
    s1: u32,
    s2: u32,
    window: usize,
}

impl RollingChecksum {
    pub fn new(window: usize) -> Self {
        Self { s1: 0, s2: 0, window }
    }

    /// Seed the checksum from a full window of data.
    pub fn init(&mut self, data: &[u8]) {
        self.s1 = 0;
        self.s2 = 0;

        let len = data.len();
        let mut i = 0;

        // Four bytes per step, same unrolling as the scalar loop below
        while i + 4 <= len {
            let b0 = data[i] as u32;
            let b1 = data[i + 1] as u32;
            let b2 = data[i + 2] as u32;
            let b3 = data[i + 3] as u32;

            self.s2 = self.s2.wrapping_add(
                4u32.wrapping_mul(self.s1.wrapping_add(b0))
                    .wrapping_add(3u32.wrapping_mul(b1))
                    .wrapping_add(2u32.wrapping_mul(b2))
                    .wrapping_add(b3),
            );
            self.s1 = self
                .s1
                .wrapping_add(b0.wrapping_add(b1).wrapping_add(b2).wrapping_add(b3));

            i += 4;
        }

        while i < len {
            self.s1 = self.s1.wrapping_add(data[i] as u32);
            self.s2 = self.s2.wrapping_add(self.s1);
            i += 1;
        }
    }

    /// Slide the window one byte: drop `old_byte`, append `new_byte`.
    pub fn roll(&mut self, old_byte: u8, new_byte: u8) {
        let old = old_byte as u32;
        let new = new_byte as u32;
        self.s1 = self.s1.wrapping_sub(old).wrapping_add(new);
        self.s2 = self
            .s2
            .wrapping_sub((self.window as u32).wrapping_mul(old))
            .wrapping_add(self.s1);
    }

    /// Packed value: s1 in the low 16 bits, s2 in the high 16 bits.
    pub fn value(&self) -> u32 {
        (self.s1 & 0xFFFF) | (self.s2 << 16)
    }
}

/// One-shot weak checksum of a block.
pub fn weak_checksum(data: &[u8]) -> u32 {
    let mut c = RollingChecksum::new(data.len());
    c.init(data);
    c.value()
}

/// Strong digest of a block, truncated to the algorithm's width.
pub fn strong_checksum(data: &[u8], checksum_type: ChecksumType) -> Vec<u8> {
    match checksum_type {
        ChecksumType::Blake3 => blake3::hash(data).as_bytes().to_vec(),
        ChecksumType::Md5 => md5::compute(data).to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weak_checksum_is_deterministic() {
        let data = b"Hello, World!";
        assert_eq!(weak_checksum(data), weak_checksum(data));
        assert_ne!(weak_checksum(data), weak_checksum(b"Hello, World?"));
    }

    #[test]
    fn rolling_matches_fresh_computation() {
        let data = b"abcdefgh";
        let mut rolling = RollingChecksum::new(3);
        rolling.init(&data[0..3]);

        for start in 1..=data.len() - 3 {
            rolling.roll(data[start - 1], data[start + 2]);
            assert_eq!(
                rolling.value(),
                weak_checksum(&data[start..start + 3]),
                "window at {start}"
            );
        }
    }

    #[test]
    fn init_unrolled_matches_scalar() {
        // Lengths around the 4-byte unrolling boundary
        for len in [1usize, 3, 4, 5, 7, 8, 13] {
            let data: Vec<u8> = (0..len as u8).map(|b| b.wrapping_mul(37)).collect();
            let mut scalar = (0u32, 0u32);
            for &b in &data {
                scalar.0 = scalar.0.wrapping_add(b as u32);
                scalar.1 = scalar.1.wrapping_add(scalar.0);
            }
            let expected = (scalar.0 & 0xFFFF) | (scalar.1 << 16);
            assert_eq!(weak_checksum(&data), expected, "len {len}");
        }
    }

    #[test]
    fn block_size_clamps_and_rounds() {
        assert_eq!(block_size_for(0), 1024);
        assert_eq!(block_size_for(10 * 1024), 1024);
        assert_eq!(block_size_for(1024 * 1024), 1024);
        // sqrt(64 MiB) = 8192, already a power of two
        assert_eq!(block_size_for(64 * 1024 * 1024), 8192);
        // sqrt is between 8192 and 16384; nearest wins
        assert_eq!(block_size_for(100 * 1024 * 1024), 8192);
        assert_eq!(block_size_for(u64::MAX), 128 * 1024);
    }

    #[test]
    fn strong_checksum_widths() {
        let data = b"payload";
        assert_eq!(strong_checksum(data, ChecksumType::Blake3).len(), 32);
        assert_eq!(strong_checksum(data, ChecksumType::Md5).len(), 16);
        assert_eq!(ChecksumType::from_digest_len(16), Some(ChecksumType::Md5));
        assert_eq!(ChecksumType::from_digest_len(20), None);
    }

}
