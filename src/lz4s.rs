// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! LZ4S token stream decoder.
//!
//! # Format
//!
//! QAT emits LZ4 sequences without the LZ4 block framing rules:
//!
//! | Field | Size | Meaning |
//! |-------|------|---------|
//! | token | 1 | high nibble: literal length, low nibble: match length code |
//! | literal length extension | 0+ | present when the high nibble is 15 |
//! | literals | n | raw bytes |
//! | offset | 2 | little-endian match distance |
//! | match length extension | 0+ | present when the low nibble is 15 |
//!
//! Extensions are summed bytes, continuing while a byte equals 255. A
//! non-zero match code `c` means a match of `c + 2` bytes. A zero match code
//! is used by the hardware to split a literal run; its literals are carried
//! into the next record. The stream ends with a token whose literals reach
//! the end of the input.

use crate::error::DecodeError;
use crate::sequence::Sequence;

const ML_BITS: u32 = 4;
const ML_MASK: usize = (1 << ML_BITS) - 1;
const RUN_MASK: usize = (1 << (8 - ML_BITS)) - 1;

/// Added to every non-zero match length code.
pub const LZ4S_MIN_MATCH: u32 = 2;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    #[inline]
    fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    #[inline]
    fn byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(DecodeError::Truncated { at: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    /// Nibble value plus extension bytes when the nibble is saturated.
    fn length(&mut self, nibble: usize, mask: usize) -> Result<usize, DecodeError> {
        let mut len = nibble;
        if nibble == mask {
            loop {
                let s = self.byte()?;
                len += s as usize;
                if s != 255 {
                    break;
                }
            }
        }
        Ok(len)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        if n > self.buf.len() - self.pos {
            return Err(DecodeError::Truncated { at: self.pos });
        }
        self.pos += n;
        Ok(())
    }

    /// Always little-endian, whatever the host.
    fn le16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + 2)
            .ok_or(DecodeError::Truncated { at: self.pos })?;
        self.pos += 2;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

fn push(out: &mut [Sequence], count: &mut usize, seq: Sequence) -> Result<(), DecodeError> {
    let capacity = out.len();
    let slot = out
        .get_mut(*count)
        .ok_or(DecodeError::OutputOverflow { capacity })?;
    *slot = seq;
    *count += 1;
    Ok(())
}

/// Decode `stream` into `out`, returning the number of sequences written.
///
/// The last sequence written is always literal-only. An empty stream yields
/// no sequences. Nothing is written past `out.len()`; a stream needing more
/// room fails with [`DecodeError::OutputOverflow`].
pub fn decode_lz4s(stream: &[u8], out: &mut [Sequence]) -> Result<usize, DecodeError> {
    let mut reader = Reader {
        buf: stream,
        pos: 0,
    };
    let mut count = 0;
    let mut carried: usize = 0;

    if stream.is_empty() {
        return Ok(0);
    }

    while !reader.at_end() {
        let token = reader.byte()? as usize;
        let lit_len = reader.length(token >> ML_BITS, RUN_MASK)?;
        reader.skip(lit_len)?;

        if reader.at_end() {
            let last = Sequence::literals((lit_len + carried) as u32);
            log::trace!("Last sequence, literalLen: {}", last.lit_length);
            push(out, &mut count, last)?;
            return Ok(count);
        }

        let offset_at = reader.pos;
        let offset = reader.le16()?;
        let code = reader.length(token & ML_MASK, ML_MASK)?;

        if code == 0 {
            carried += lit_len;
            continue;
        }
        if offset == 0 {
            return Err(DecodeError::InvalidOffset { at: offset_at });
        }

        let seq = Sequence::new(
            (lit_len + carried) as u32,
            offset as u32,
            code as u32 + LZ4S_MIN_MATCH,
        );
        log::trace!(
            "sequence, literalLen: {}, offset: {}, matchlen: {}",
            seq.lit_length,
            seq.offset,
            seq.match_length
        );
        push(out, &mut count, seq)?;
        carried = 0;
    }

    // Stream ended right after a match: close the block explicitly.
    push(out, &mut count, Sequence::literals(carried as u32))?;
    Ok(count)
}
