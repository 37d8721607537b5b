// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Match sequences in the layout zstd's external sequence producer expects.

use thiserror::Error;

/// One literal run followed by a backward match.
///
/// Field order and widths match zstd's `ZSTD_Sequence`. A record with
/// `match_length == 0` carries trailing literals only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Sequence {
    /// Distance back from the current position.
    pub offset: u32,
    /// Literal bytes preceding the match.
    pub lit_length: u32,
    /// Match length, 0 for a literal-only record.
    pub match_length: u32,
    /// Repeat-offset code; always 0 from this producer.
    pub rep: u32,
}

impl Sequence {
    #[inline]
    pub const fn new(lit_length: u32, offset: u32, match_length: u32) -> Self {
        Self {
            offset,
            lit_length,
            match_length,
            rep: 0,
        }
    }

    /// Literal-only record.
    #[inline]
    pub const fn literals(lit_length: u32) -> Self {
        Self::new(lit_length, 0, 0)
    }

    /// Bytes of the block this record covers.
    #[inline]
    pub fn covered(&self) -> usize {
        self.lit_length as usize + self.match_length as usize
    }
}

const _: () = assert!(std::mem::size_of::<Sequence>() == 16);

/// Why a set of sequences does not describe a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReconstructError {
    /// Sequences reach past the end of the block.
    #[error("sequence {index} runs past the block end ({len} bytes)")]
    Overrun { index: usize, len: usize },

    /// A match points before the start of the block.
    #[error("sequence {index} has offset {offset} at position {position}")]
    BadOffset {
        index: usize,
        offset: u32,
        position: usize,
    },

    /// Sequences end before the block does.
    #[error("sequences cover {covered} of {len} bytes")]
    Incomplete { covered: usize, len: usize },
}

/// Rebuild a block from its sequences, taking literals from `src`.
///
/// This is what the host encoder does with produced sequences; comparing the
/// output with `src` proves the matches are correct.
pub fn reconstruct(src: &[u8], seqs: &[Sequence]) -> Result<Vec<u8>, ReconstructError> {
    let mut out = Vec::with_capacity(src.len());
    for (index, seq) in seqs.iter().enumerate() {
        let lit = seq.lit_length as usize;
        let start = out.len();
        if start + seq.covered() > src.len() {
            return Err(ReconstructError::Overrun {
                index,
                len: src.len(),
            });
        }
        out.extend_from_slice(&src[start..start + lit]);

        if seq.match_length == 0 {
            continue;
        }
        let position = out.len();
        let offset = seq.offset as usize;
        if offset == 0 || offset > position {
            return Err(ReconstructError::BadOffset {
                index,
                offset: seq.offset,
                position,
            });
        }
        // Byte by byte: matches may overlap their own output.
        for i in 0..seq.match_length as usize {
            let byte = out[position - offset + i];
            out.push(byte);
        }
    }

    if out.len() != src.len() {
        return Err(ReconstructError::Incomplete {
            covered: out.len(),
            len: src.len(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlapping_match() {
        let src = b"abababab";
        let seqs = [Sequence::new(2, 2, 6)];
        assert_eq!(reconstruct(src, &seqs).unwrap(), src);
    }

    #[test]
    fn test_trailing_literals() {
        let src = b"xyzxyz-tail";
        let seqs = [Sequence::new(3, 3, 3), Sequence::literals(5)];
        assert_eq!(reconstruct(src, &seqs).unwrap(), src);
    }

    #[test]
    fn test_bad_offset() {
        let src = b"aaaa";
        let seqs = [Sequence::new(1, 2, 3)];
        assert_eq!(
            reconstruct(src, &seqs),
            Err(ReconstructError::BadOffset {
                index: 0,
                offset: 2,
                position: 1
            })
        );
    }

    #[test]
    fn test_incomplete_and_overrun() {
        let src = b"abcdef";
        assert_eq!(
            reconstruct(src, &[Sequence::literals(4)]),
            Err(ReconstructError::Incomplete { covered: 4, len: 6 })
        );
        assert_eq!(
            reconstruct(src, &[Sequence::literals(7)]),
            Err(ReconstructError::Overrun { index: 0, len: 6 })
        );
    }

    #[test]
    fn test_empty_block() {
        assert_eq!(reconstruct(b"", &[Sequence::literals(0)]).unwrap(), b"");
    }
}
