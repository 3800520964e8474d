//! Bitpack encoder (tag 0xBF, spec §4.6.1 #4 / §4.6.2). Universal fallback:
//! no structure assumed, every value packed to the minimum width the batch
//! needs. Always succeeds for any input that fits within capacity, so this
//! is the last candidate `compress_smart` tries before giving up to Raw.

use super::bits::{bits_for_unsigned, BitReader, BitWriter};

pub const TAG: u8 = 0xBF;

pub fn encode<const CAP: usize>(values: &[u16]) -> Option<heapless::Vec<u8, CAP>> {
    if values.is_empty() {
        return None;
    }

    let max_val = values.iter().copied().map(u32::from).max().unwrap_or(0);
    let bits_per_value = bits_for_unsigned(max_val).max(1);

    let mut w: BitWriter<CAP> = BitWriter::new();
    if !w.write_byte(TAG) {
        return None;
    }
    if !w.write_byte(bits_per_value) {
        return None;
    }
    if !w.write_u32_be(values.len() as u32) {
        return None;
    }
    for &v in values {
        if !w.write_bits(u32::from(v), bits_per_value) {
            return None;
        }
    }
    Some(w.finish())
}

pub fn decode(data: &[u8], out: &mut [u16]) -> Option<usize> {
    let mut r = BitReader::new(data);
    if r.read_byte()? != TAG {
        return None;
    }
    let bits_per_value = r.read_byte()?;
    let count = r.read_u32_be()? as usize;
    if out.len() < count {
        return None;
    }
    for slot in out.iter_mut().take(count) {
        *slot = r.read_bits(bits_per_value)? as u16;
    }
    Some(count)
}
