//! HDLC frame extraction from a raw demodulated bit stream.
//!
//! One [`HdlcDecoder`] runs per (channel, subchannel, slicer) slot. Each
//! incoming raw (pre-NRZI) bit steps a small state machine; when a closing
//! flag arrives with enough bits accumulated, the recorded raw bits are
//! handed off as a [`Candidate`] for FCS validation and, if configured,
//! bit-flip repair.

use crate::ax25::{MAX_FRAME_LEN, MIN_FRAME_LEN};
use crate::fcs::fcs_check;

const FLAG_PATTERN: u8 = 0x7E;
const ABORT_PATTERN: u8 = 0xFE;

/// Raw bits can outnumber data bits by one stuff per five, plus the seed.
const RAW_CAP_BITS: usize = MAX_FRAME_LEN * 8 + MAX_FRAME_LEN * 8 / 5 + 8;

/// Recording of the raw (pre-NRZI-decode) bits of one frame candidate.
///
/// The first bit is the closing bit of the opening flag and seeds NRZI
/// decoding; N+1 raw bits therefore carry N data bits.
#[derive(Clone)]
pub struct RawBitBuffer {
    bits: [u8; RAW_CAP_BITS / 8 + 1],
    len: usize,
}

impl RawBitBuffer {
    pub fn new() -> Self {
        Self {
            bits: [0u8; RAW_CAP_BITS / 8 + 1],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn push(&mut self, bit: bool) {
        if self.len >= RAW_CAP_BITS {
            // Oversized candidates are rejected later by the length check.
            return;
        }
        let byte = self.len / 8;
        let mask = 1u8 << (self.len % 8);
        if bit {
            self.bits[byte] |= mask;
        } else {
            self.bits[byte] &= !mask;
        }
        self.len += 1;
    }

    pub fn get(&self, index: usize) -> bool {
        self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    fn flip(&mut self, index: usize) {
        self.bits[index / 8] ^= 1 << (index % 8);
    }

    /// Drop the trailing flag octet.
    pub fn chop8(&mut self) {
        self.len = self.len.saturating_sub(8);
    }
}

impl Default for RawBitBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// How hard the repair stage may try to recover a corrupted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FixBits {
    /// FCS must match as received.
    None,
    /// Additionally try inverting each single raw bit.
    Single,
    /// Additionally try inverting each adjacent raw bit pair.
    Double,
}

/// Correction effort that produced a delivered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RetryLevel {
    None,
    SingleBit,
    DoubleBit,
}

impl RetryLevel {
    pub fn label(&self) -> &'static str {
        match self {
            RetryLevel::None => "none",
            RetryLevel::SingleBit => "single",
            RetryLevel::DoubleBit => "double",
        }
    }
}

/// Validated frame bytes produced from a candidate.
#[derive(Clone)]
pub struct DecodedFrame {
    buf: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl DecodedFrame {
    /// Frame bytes excluding the two FCS octets.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[0..self.len - 2]
    }
}

/// A completed flag-to-flag stretch of raw bits, ready for validation.
pub struct Candidate {
    pub raw: RawBitBuffer,
    /// Octets accumulated live by the state machine, already FCS-checked.
    /// When present the repair stage can skip re-deriving the bits.
    pub quick: Option<DecodedFrame>,
}

/// Receive state for one decoder slot.
pub struct HdlcDecoder {
    /// Previous raw bit, for NRZI.
    prev_raw: bool,
    /// Last eight decoded bits, newest in the MSB.
    pat_det: u8,
    /// Accumulator for the octet in progress.
    oacc: u8,
    /// Bits in `oacc`; -1 while not inside a frame.
    olen: i32,
    frame_buf: [u8; MAX_FRAME_LEN],
    frame_len: usize,
    raw: RawBitBuffer,
}

impl HdlcDecoder {
    pub fn new() -> Self {
        Self {
            prev_raw: false,
            pat_det: 0,
            oacc: 0,
            olen: -1,
            frame_buf: [0u8; MAX_FRAME_LEN],
            frame_len: 0,
            raw: RawBitBuffer::new(),
        }
    }

    /// Process one raw bit. Returns a candidate when a closing flag
    /// completes a plausible frame.
    pub fn rec_bit(&mut self, raw: bool) -> Option<Candidate> {
        // NRZI: a 0 is a transition, a 1 is no change.
        let dbit = raw == self.prev_raw;
        self.prev_raw = raw;

        self.pat_det >>= 1;
        if dbit {
            self.pat_det |= 0x80;
        }

        self.raw.push(raw);

        if self.pat_det == FLAG_PATTERN {
            self.raw.chop8();

            let candidate = if self.raw.len() >= MIN_FRAME_LEN * 8 {
                let quick = self.quick_frame();
                let raw = core::mem::take(&mut self.raw);
                Some(Candidate { raw, quick })
            } else {
                self.raw.clear();
                None
            };

            self.olen = 0;
            self.frame_len = 0;
            // Closing bit of this flag seeds NRZI for the next frame.
            self.raw.push(self.prev_raw);
            return candidate;
        }

        if self.pat_det == ABORT_PATTERN {
            // Seven ones in a row: loss of signal. Discard the partial frame.
            self.olen = -1;
            self.frame_len = 0;
            self.raw.clear();
        } else if self.pat_det & 0xFC == 0x7C {
            // Five ones then a zero: the zero was stuffed, drop it.
        } else if self.olen >= 0 {
            self.oacc >>= 1;
            if dbit {
                self.oacc |= 0x80;
            }
            self.olen += 1;
            if self.olen == 8 {
                self.olen = 0;
                if self.frame_len < MAX_FRAME_LEN {
                    self.frame_buf[self.frame_len] = self.oacc;
                    self.frame_len += 1;
                }
            }
        }
        None
    }

    // Fast path: the live octet accumulation, if it already passes FCS.
    fn quick_frame(&self) -> Option<DecodedFrame> {
        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&self.frame_len) {
            return None;
        }
        if !fcs_check(&self.frame_buf[0..self.frame_len]) {
            return None;
        }
        Some(DecodedFrame {
            buf: self.frame_buf,
            len: self.frame_len,
        })
    }
}

impl Default for HdlcDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a candidate, trying progressively harder repairs up to `fix`.
///
/// Search order is deterministic: the unmodified bits first, then each
/// single raw-bit inversion in ascending position, then each adjacent
/// pair. The first FCS-valid decode wins.
pub fn try_decode(candidate: &Candidate, fix: FixBits) -> Option<(DecodedFrame, RetryLevel)> {
    if let Some(quick) = &candidate.quick {
        return Some((quick.clone(), RetryLevel::None));
    }
    if let Some(frame) = decode_raw(&candidate.raw) {
        return Some((frame, RetryLevel::None));
    }
    if fix < FixBits::Single {
        return None;
    }

    let mut work = candidate.raw.clone();
    for i in 0..work.len() {
        work.flip(i);
        if let Some(frame) = decode_raw(&work) {
            log::debug!("recovered frame by inverting raw bit {}", i);
            return Some((frame, RetryLevel::SingleBit));
        }
        work.flip(i);
    }
    if fix < FixBits::Double {
        return None;
    }

    for i in 0..work.len() - 1 {
        work.flip(i);
        work.flip(i + 1);
        if let Some(frame) = decode_raw(&work) {
            log::debug!("recovered frame by inverting raw bits {},{}", i, i + 1);
            return Some((frame, RetryLevel::DoubleBit));
        }
        work.flip(i);
        work.flip(i + 1);
    }
    None
}

// NRZI-decode and unstuff the raw recording into octets, then FCS-check.
fn decode_raw(raw: &RawBitBuffer) -> Option<DecodedFrame> {
    let mut buf = [0u8; MAX_FRAME_LEN];
    let mut len = 0usize;
    let mut oacc = 0u8;
    let mut olen = 0u32;
    let mut ones = 0u32;

    for i in 1..raw.len() {
        let dbit = raw.get(i) == raw.get(i - 1);
        if dbit {
            ones += 1;
            if ones > 5 {
                // Six data ones cannot occur inside a stuffed frame.
                return None;
            }
        } else {
            if ones == 5 {
                // Stuffed zero, not data.
                ones = 0;
                continue;
            }
            ones = 0;
        }

        oacc >>= 1;
        if dbit {
            oacc |= 0x80;
        }
        olen += 1;
        if olen == 8 {
            olen = 0;
            if len >= MAX_FRAME_LEN {
                return None;
            }
            buf[len] = oacc;
            len += 1;
        }
    }

    if olen != 0 || !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&len) {
        return None;
    }
    if !fcs_check(&buf[0..len]) {
        return None;
    }
    Some(DecodedFrame { buf, len })
}
