//! Compression engine (spec §4.6). Four independently lossless encoders,
//! each tagged with a leading method byte, plus a `compress_smart` selector
//! that tries all of them and keeps the smallest output that fits.
//!
//! Grounded on the teacher's `rpc::codec` module for the tagged-frame shape
//! (leading type byte, fixed header, payload) and on its `flatbuffers`-based
//! telemetry envelope for the idea of a self-describing packet struct; here
//! the payload formats are hand-rolled bit streams instead (see `bits.rs`)
//! since the wire format itself is the thing under spec, not a transport
//! detail a serialization crate could paper over.

pub mod bitpack;
pub mod bits;
pub mod dictionary;
pub mod semantic;
pub mod temporal;

use crate::registers::{RegId, MAX_REGISTERS};
use crate::sample::SampleBatch;

/// Worst case: 64 samples * 16 registers * 16 bits/value, plus headers.
pub const MAX_COMPRESSED_BYTES: usize = 2200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodTag {
    Dictionary,
    Temporal,
    Semantic,
    Bitpack,
    Raw,
}

impl MethodTag {
    pub fn wire_tag(self) -> u8 {
        match self {
            MethodTag::Dictionary => dictionary::TAG,
            MethodTag::Temporal => temporal::TAG_MULTI, // TAG_SINGLE also valid; see data[0]
            MethodTag::Semantic => semantic::TAG,
            MethodTag::Bitpack => bitpack::TAG,
            MethodTag::Raw => 0x00,
        }
    }

    pub fn from_wire_tag(tag: u8) -> Option<MethodTag> {
        match tag {
            dictionary::TAG => Some(MethodTag::Dictionary),
            temporal::TAG_MULTI | temporal::TAG_SINGLE => Some(MethodTag::Temporal),
            semantic::TAG => Some(MethodTag::Semantic),
            bitpack::TAG => Some(MethodTag::Bitpack),
            _ => None,
        }
    }
}

/// The compressed output handed from the compression task to the uploader
/// (spec §3, §4.6). `data` is empty iff `method == Raw`.
pub struct CompressedPacket {
    pub data: heapless::Vec<u8, MAX_COMPRESSED_BYTES>,
    pub timestamp: u64,
    pub sample_count: usize,
    pub register_count: usize,
    pub registers: [RegId; MAX_REGISTERS],
    pub uncompressed_size: usize,
    pub compressed_size: usize,
    pub method: MethodTag,
}

impl CompressedPacket {
    pub fn compression_ratio(&self) -> f32 {
        if self.uncompressed_size == 0 {
            return 1.0;
        }
        self.compressed_size as f32 / self.uncompressed_size as f32
    }
}

/// Try every encoder in spec-listed order (Dictionary, Temporal, Semantic,
/// Bitpack) and keep the smallest output that fits. Falls back to an empty
/// Raw representation if every encoder fails or overflows capacity — this
/// is a bug-escape path, not the happy path (spec §4.6.1).
pub fn compress_smart(batch: &SampleBatch) -> CompressedPacket {
    let register_count = batch.layout().map(|l| l.len()).unwrap_or(0);
    let sample_count = batch.len();
    let mut registers = [RegId::AcVoltage; MAX_REGISTERS];
    if let Some(layout) = batch.layout() {
        for (slot, r) in registers.iter_mut().zip(layout.iter()) {
            *slot = *r;
        }
    }
    let timestamp = batch.last_timestamp().unwrap_or(0);

    let mut values = [0u16; MAX_REGISTERS * crate::sample::MAX_BATCH_SAMPLES];
    let written = batch.linearize(&mut values);
    let values = &values[..written];
    let uncompressed_size = written * 2;

    let candidates: [(MethodTag, Option<heapless::Vec<u8, MAX_COMPRESSED_BYTES>>); 4] = [
        (
            MethodTag::Dictionary,
            dictionary::encode::<MAX_COMPRESSED_BYTES>(values, register_count, sample_count),
        ),
        (
            MethodTag::Temporal,
            temporal::encode::<MAX_COMPRESSED_BYTES>(values, register_count, sample_count),
        ),
        (
            MethodTag::Semantic,
            semantic::encode::<MAX_COMPRESSED_BYTES>(values, register_count, sample_count),
        ),
        (MethodTag::Bitpack, bitpack::encode::<MAX_COMPRESSED_BYTES>(values)),
    ];

    let mut best: Option<(MethodTag, heapless::Vec<u8, MAX_COMPRESSED_BYTES>)> = None;
    for (tag, candidate) in candidates {
        if let Some(data) = candidate {
            if data.len() >= uncompressed_size {
                continue; // spec: larger-than-raw output doesn't count as a win
            }
            match &best {
                Some((_, best_data)) if best_data.len() <= data.len() => {}
                _ => best = Some((tag, data)),
            }
        }
    }

    match best {
        Some((method, data)) => {
            let compressed_size = data.len();
            CompressedPacket {
                data,
                timestamp,
                sample_count,
                register_count,
                registers,
                uncompressed_size,
                compressed_size,
                method,
            }
        }
        None => CompressedPacket {
            data: heapless::Vec::new(),
            timestamp,
            sample_count,
            register_count,
            registers,
            uncompressed_size,
            compressed_size: 0,
            method: MethodTag::Raw,
        },
    }
}

/// Decode a `CompressedPacket`'s `data` back into row-major (sample, then
/// register) values, dispatching on the leading method byte.
pub fn decode_packet(packet: &CompressedPacket, out: &mut [u16]) -> Option<usize> {
    if packet.method == MethodTag::Raw || packet.data.is_empty() {
        return Some(0);
    }
    match packet.data[0] {
        dictionary::TAG => dictionary::decode(&packet.data, out),
        temporal::TAG_MULTI | temporal::TAG_SINGLE => temporal::decode(&packet.data, out),
        semantic::TAG => semantic::decode(&packet.data, out),
        bitpack::TAG => bitpack::decode(&packet.data, out),
        _ => None,
    }
}
