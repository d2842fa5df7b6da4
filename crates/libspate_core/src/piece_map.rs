use bitvec::{order::Lsb0, vec::BitVec};
use byteorder::{BE, ByteOrder};

type Bits = BitVec<u8, Lsb0>;

const TAG_COMPLETE: u8 = 1;
const TAG_PARTIAL: u8 = 0;

#[derive(thiserror::Error, Debug)]
pub enum PieceMapDecodeError {
    #[error("piece map record truncated")]
    Truncated,
    #[error("piece map has zero pieces")]
    ZeroPieces,
    #[error("unknown piece map tag {0}")]
    UnknownTag(u8),
}

/// Tracks which pieces of one file are present.
///
/// The complete form is a counter only; the partial form carries one bit per
/// piece and upgrades itself to complete when the last bit fills.
#[derive(Clone, PartialEq, Eq)]
pub enum PieceMap {
    Complete { pieces: u32 },
    Partial { bits: Bits, set: u32 },
}

impl PieceMap {
    pub fn new_empty(pieces: u32) -> Self {
        assert!(pieces > 0, "a file has at least one piece");
        let mut bits = Bits::new();
        bits.resize(pieces as usize, false);
        Self::Partial { bits, set: 0 }
    }

    pub fn new_complete(pieces: u32) -> Self {
        assert!(pieces > 0, "a file has at least one piece");
        Self::Complete { pieces }
    }

    pub fn pieces(&self) -> u32 {
        match self {
            Self::Complete { pieces } => *pieces,
            Self::Partial { bits, .. } => bits.len() as u32,
        }
    }

    pub fn count_set(&self) -> u32 {
        match self {
            Self::Complete { pieces } => *pieces,
            Self::Partial { set, .. } => *set,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    pub fn get(&self, index: u32) -> bool {
        match self {
            Self::Complete { pieces } => index < *pieces,
            Self::Partial { bits, .. } => bits.get(index as usize).map(|b| *b).unwrap_or(false),
        }
    }

    /// Returns true if the bit was newly set.
    pub fn set(&mut self, index: u32) -> bool {
        let newly_set = match self {
            Self::Complete { .. } => false,
            Self::Partial { bits, set } => {
                let index = index as usize;
                if index >= bits.len() || bits[index] {
                    false
                } else {
                    bits.set(index, true);
                    *set += 1;
                    true
                }
            }
        };
        if let Self::Partial { bits, set } = self {
            if *set as usize == bits.len() {
                *self = Self::Complete { pieces: *set };
            }
        }
        newly_set
    }

    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.pieces()).filter(move |i| self.get(*i))
    }

    /// Explicit on-disk encoding: a tag byte, a big-endian piece count, and
    /// for the partial form the raw bitmap bytes (LSB-first within a byte).
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut count = [0u8; 4];
        BE::write_u32(&mut count, self.pieces());
        match self {
            Self::Complete { .. } => {
                out.push(TAG_COMPLETE);
                out.extend_from_slice(&count);
            }
            Self::Partial { bits, .. } => {
                out.push(TAG_PARTIAL);
                out.extend_from_slice(&count);
                out.extend_from_slice(bits.as_raw_slice());
            }
        }
    }

    /// Decodes a map and returns it with the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), PieceMapDecodeError> {
        use PieceMapDecodeError::*;
        let tag = *buf.first().ok_or(Truncated)?;
        let pieces = BE::read_u32(buf.get(1..5).ok_or(Truncated)?);
        if pieces == 0 {
            return Err(ZeroPieces);
        }
        match tag {
            TAG_COMPLETE => Ok((Self::Complete { pieces }, 5)),
            TAG_PARTIAL => {
                let nbytes = (pieces as usize).div_ceil(8);
                let raw = buf.get(5..5 + nbytes).ok_or(Truncated)?;
                let mut bits = Bits::from_slice(raw);
                bits.truncate(pieces as usize);
                let set = bits.count_ones() as u32;
                let mut map = Self::Partial { bits, set };
                if set == pieces {
                    map = Self::Complete { pieces };
                }
                Ok((map, 5 + nbytes))
            }
            other => Err(UnknownTag(other)),
        }
    }
}

impl std::fmt::Debug for PieceMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PieceMap({}/{})", self.count_set(), self.pieces())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_upgrades_to_complete() {
        let mut m = PieceMap::new_empty(3);
        assert!(!m.is_complete());
        assert!(m.set(1));
        assert!(!m.set(1), "setting twice is a no-op");
        assert!(m.set(0));
        assert!(!m.is_complete());
        assert!(m.set(2));
        assert!(m.is_complete());
        assert_eq!(m, PieceMap::new_complete(3));
        assert!(!m.set(0));
    }

    #[test]
    fn test_single_piece() {
        let mut m = PieceMap::new_empty(1);
        assert!(m.set(0));
        assert!(m.is_complete());
    }

    #[test]
    fn test_out_of_range() {
        let mut m = PieceMap::new_empty(2);
        assert!(!m.set(5));
        assert!(!m.get(5));
    }

    #[test]
    fn test_encode_vectors() {
        let mut out = Vec::new();
        PieceMap::new_complete(3).encode(&mut out);
        assert_eq!(out, [1, 0, 0, 0, 3]);

        let mut m = PieceMap::new_empty(10);
        m.set(0);
        m.set(9);
        out.clear();
        m.encode(&mut out);
        // LSB-first: bit 0 -> 0x01 in the first byte, bit 9 -> 0x02 in the second.
        assert_eq!(out, [0, 0, 0, 0, 10, 0x01, 0x02]);
    }

    #[test]
    fn test_decode_round_trip() {
        let mut m = PieceMap::new_empty(13);
        for i in [0, 3, 7, 12] {
            m.set(i);
        }
        let mut out = Vec::new();
        m.encode(&mut out);
        out.extend_from_slice(b"trailing");
        let (decoded, consumed) = PieceMap::decode(&out).unwrap();
        assert_eq!(decoded, m);
        assert_eq!(consumed, 5 + 2);
    }

    #[test]
    fn test_decode_full_partial_is_complete() {
        let mut out = Vec::new();
        out.push(0);
        out.extend_from_slice(&3u32.to_be_bytes());
        out.push(0b111);
        let (decoded, _) = PieceMap::decode(&out).unwrap();
        assert!(decoded.is_complete());
    }

    #[test]
    fn test_decode_errors() {
        assert!(PieceMap::decode(&[]).is_err());
        assert!(PieceMap::decode(&[0, 0, 0, 0, 9, 0xff]).is_err());
        assert!(PieceMap::decode(&[7, 0, 0, 0, 1, 0]).is_err());
        assert!(PieceMap::decode(&[1, 0, 0, 0, 0]).is_err());
    }
}
