//! `Sample` and `SampleBatch` — the data crossing the ring stage between
//! Acquisition and Compression.
//!
//! No element crosses a queue by reference: everything here is `Copy` and
//! fixed-capacity, matching the teacher's no-heap-on-the-hot-path discipline
//! (`heapless::Vec` throughout `rpc::channels`).

use crate::registers::{RegId, MAX_REGISTERS};

/// One poll of the active register set at a single timestamp.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    /// Milliseconds since epoch, or monotonic ms if time has not synced yet.
    pub timestamp: u64,
    pub register_count: usize,
    pub registers: [RegId; MAX_REGISTERS],
    pub values: [u16; MAX_REGISTERS],
}

impl Sample {
    pub fn new(timestamp: u64, registers: &[RegId], values: &[u16]) -> Self {
        debug_assert_eq!(registers.len(), values.len());
        let n = registers.len().min(MAX_REGISTERS);
        let mut regs = [RegId::AcVoltage; MAX_REGISTERS];
        let mut vals = [0u16; MAX_REGISTERS];
        regs[..n].copy_from_slice(&registers[..n]);
        vals[..n].copy_from_slice(&values[..n]);
        Self { timestamp, register_count: n, registers: regs, values: vals }
    }

    pub fn registers(&self) -> &[RegId] {
        &self.registers[..self.register_count]
    }

    pub fn values(&self) -> &[u16] {
        &self.values[..self.register_count]
    }

    /// True if `other` has the same register layout (length and contents)
    /// as `self`. A layout mismatch invalidates an in-flight batch.
    pub fn same_layout(&self, other: &Sample) -> bool {
        self.register_count == other.register_count
            && self.registers() == other.registers()
    }
}

/// Upper bound on samples per batch: `upload_period / poll_period` can never
/// exceed this without a config rejection (see `config::EcoWattConfig::validate`).
pub const MAX_BATCH_SAMPLES: usize = 64;

/// Contiguous run of `N = upload_period / poll_period` samples sharing one
/// register layout. Built incrementally in the Compression task's local
/// scratch; destroyed after compression finishes, successful or not.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    samples: heapless::Vec<Sample, MAX_BATCH_SAMPLES>,
    target_len: usize,
}

impl SampleBatch {
    pub fn new(target_len: usize) -> Self {
        Self { samples: heapless::Vec::new(), target_len: target_len.min(MAX_BATCH_SAMPLES) }
    }

    /// Push a sample. Rejects (and the caller should discard the batch) if
    /// the layout differs from the batch's first sample.
    pub fn push(&mut self, sample: Sample) -> bool {
        if let Some(first) = self.samples.first() {
            if !first.same_layout(&sample) {
                return false;
            }
        }
        self.samples.push(sample).is_ok()
    }

    pub fn is_full(&self) -> bool {
        !self.samples.is_empty() && self.samples.len() >= self.target_len
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    /// The active register layout (from the first sample), or `None` if empty.
    pub fn layout(&self) -> Option<&[RegId]> {
        self.samples.first().map(Sample::registers)
    }

    /// Linearize `N x register_count` values row-major (sample order, then
    /// register order within a sample) into `out`. Returns the count written.
    pub fn linearize(&self, out: &mut [u16]) -> usize {
        let mut n = 0;
        for s in &self.samples {
            for &v in s.values() {
                if n >= out.len() {
                    return n;
                }
                out[n] = v;
                n += 1;
            }
        }
        n
    }

    /// Timestamp of the most recently pushed sample.
    pub fn last_timestamp(&self) -> Option<u64> {
        self.samples.last().map(|s| s.timestamp)
    }
}
