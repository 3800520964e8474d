//! Dictionary + Bitmask encoder (tag 0xD0, spec §4.6.1 #1 / §4.6.2).
//!
//! Best for near-constant streams: each sample is diffed against a fixed
//! dictionary of 16 predefined "typical quiescent value" baselines (one per
//! register slot position), a bitmask records which registers actually
//! moved off baseline, and only those deltas are bit-packed.

use super::bits::{bits_for_signed, BitReader, BitWriter};

pub const TAG: u8 = 0xD0;

/// Sixteen predefined baseline ("quiescent") values, one per register slot
/// position (not per physical register — the active layout's Nth register
/// is diffed against `BASELINE[N]`, matching the spec's framing of a fixed
/// 16-entry dictionary rather than a per-RegId table).
pub const BASELINE: [u16; 16] = [
    2300, 0, 0, 2300, 0, 0, 5000, 450, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Encode `values` (row-major: sample, then register) using the dictionary
/// method. Returns `None` if the output would not fit `CAP`.
pub fn encode<const CAP: usize>(
    values: &[u16],
    register_count: usize,
    sample_count: usize,
) -> Option<heapless::Vec<u8, CAP>> {
    if register_count == 0 || register_count > 16 || values.len() != register_count * sample_count {
        return None;
    }

    // Per-register bit width: max over all samples of bits needed for that
    // register's signed delta against its baseline.
    let mut widths = [0u8; 16];
    for j in 0..register_count {
        let mut max_bits = 0u8;
        for s in 0..sample_count {
            let v = values[s * register_count + j];
            let delta = i32::from(v) - i32::from(BASELINE[j]);
            max_bits = max_bits.max(bits_for_signed(delta));
        }
        widths[j] = max_bits;
    }

    let mut w: BitWriter<CAP> = BitWriter::new();
    if !w.write_byte(TAG) {
        return None;
    }
    if !w.write_byte(register_count as u8) {
        return None;
    }
    if !w.write_u16_be(sample_count as u16) {
        return None;
    }
    for j in 0..register_count {
        if !w.write_byte(widths[j]) {
            return None;
        }
    }

    for s in 0..sample_count {
        let mut bitmask: u16 = 0;
        for j in 0..register_count {
            let v = values[s * register_count + j];
            if v != BASELINE[j] {
                bitmask |= 1 << j;
            }
        }
        if !w.write_u16_be(bitmask) {
            return None;
        }
        for j in 0..register_count {
            if bitmask & (1 << j) != 0 {
                let v = values[s * register_count + j];
                let delta = i32::from(v) - i32::from(BASELINE[j]);
                if !w.write_signed(delta, widths[j]) {
                    return None;
                }
            }
        }
    }

    Some(w.finish())
}

/// Decode a dictionary-encoded stream into `out` (row-major). Returns the
/// number of `u16` values written, or `None` on malformed input.
pub fn decode(data: &[u8], out: &mut [u16]) -> Option<usize> {
    let mut r = BitReader::new(data);
    if r.read_byte()? != TAG {
        return None;
    }
    let register_count = r.read_byte()? as usize;
    let sample_count = r.read_u16_be()? as usize;
    if register_count == 0 || register_count > 16 {
        return None;
    }
    let total = register_count * sample_count;
    if out.len() < total {
        return None;
    }

    let mut widths = [0u8; 16];
    for w in widths.iter_mut().take(register_count) {
        *w = r.read_byte()?;
    }

    for s in 0..sample_count {
        let bitmask = r.read_u16_be()?;
        for j in 0..register_count {
            let value = if bitmask & (1 << j) != 0 {
                let delta = r.read_signed(widths[j])?;
                (i32::from(BASELINE[j]) + delta) as u16
            } else {
                BASELINE[j]
            };
            out[s * register_count + j] = value;
        }
    }
    Some(total)
}
