//! Semantic RLE encoder (tag 0x50, spec §4.6.1 #3 / §4.6.2). Best when many
//! registers are constant over the batch: each register's raw value series
//! is run-length-encoded independently across the time axis.

use super::bits::{bits_for_unsigned, BitReader, BitWriter};

pub const TAG: u8 = 0x50;
const MAX_RUN_LEN: u32 = 255;

pub fn encode<const CAP: usize>(
    values: &[u16],
    register_count: usize,
    sample_count: usize,
) -> Option<heapless::Vec<u8, CAP>> {
    if register_count == 0 || register_count > 16 || sample_count == 0
        || values.len() != register_count * sample_count
    {
        return None;
    }

    let mut widths = [0u8; 16];
    for j in 0..register_count {
        let mut max_val = 0u32;
        for s in 0..sample_count {
            max_val = max_val.max(u32::from(values[s * register_count + j]));
        }
        let width = bits_for_unsigned(max_val);
        if width > 15 {
            return None; // doesn't fit the spec's 4-bit width field
        }
        widths[j] = width;
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
        if !w.write_bits(u32::from(widths[j]), 4) {
            return None;
        }
    }

    for j in 0..register_count {
        let mut s = 0;
        while s < sample_count {
            let value = values[s * register_count + j];
            let mut run = 1u32;
            while s + (run as usize) < sample_count
                && run < MAX_RUN_LEN
                && values[(s + run as usize) * register_count + j] == value
            {
                run += 1;
            }
            if !w.write_byte(run as u8) || !w.write_bits(u32::from(value), widths[j]) {
                return None;
            }
            s += run as usize;
        }
    }

    Some(w.finish())
}

pub fn decode(data: &[u8], out: &mut [u16]) -> Option<usize> {
    let mut r = BitReader::new(data);
    if r.read_byte()? != TAG {
        return None;
    }
    let register_count = r.read_byte()? as usize;
    let sample_count = r.read_u16_be()? as usize;
    if register_count == 0 || register_count > 16 || sample_count == 0 {
        return None;
    }
    let total = register_count * sample_count;
    if out.len() < total {
        return None;
    }

    let mut widths = [0u8; 16];
    for w in widths.iter_mut().take(register_count) {
        *w = r.read_bits(4)? as u8;
    }

    for j in 0..register_count {
        let mut s = 0;
        while s < sample_count {
            let run = r.read_byte()? as usize;
            let run = run.max(1).min(sample_count - s);
            let value = r.read_bits(widths[j])? as u16;
            for k in 0..run {
                out[(s + k) * register_count + j] = value;
            }
            s += run;
        }
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_constant_column_is_single_run() {
        let values: Vec<u16> = vec![7; 20];
        let encoded: heapless::Vec<u8, 4096> = encode(&values, 1, 20).unwrap();
        assert_eq!(encoded[0], TAG);
        let mut out = [0u16; 32];
        let n = decode(&encoded, &mut out).unwrap();
        assert_eq!(&out[..n], values.as_slice());
    }

    #[test]
    fn mixed_constant_registers_round_trip() {
        let values: Vec<u16> = vec![7, 100, 7, 100, 7, 101, 7, 100];
        let encoded: heapless::Vec<u8, 4096> = encode(&values, 2, 4).unwrap();
        let mut out = [0u16; 16];
        let n = decode(&encoded, &mut out).unwrap();
        assert_eq!(&out[..n], values.as_slice());
    }

    #[test]
    fn run_longer_than_255_splits_into_multiple_tokens() {
        let values: Vec<u16> = vec![3; 300];
        let encoded: heapless::Vec<u8, 4096> = encode(&values, 1, 300).unwrap();
        let mut out = [0u16; 512];
        let n = decode(&encoded, &mut out).unwrap();
        assert_eq!(&out[..n], values.as_slice());
    }
}
