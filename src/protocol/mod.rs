//! Protocol Adapter (spec §4.2) — synchronous request/response over HTTP to
//! the inverter, with frame integrity checks and bounded retries.
//!
//! Modeled as a hexagonal port, the same way the teacher models
//! `SensorPort`/`ActuatorPort`/`StoragePort` at the domain boundary
//! (`app::ports`): the domain logic here never touches a socket directly,
//! it calls through `HttpTransport`.

pub mod crc16;
pub mod frame;

use crate::error::ProtocolError;
use frame::{MAX_FRAME_BYTES, ParsedResponse};
use heapless::Vec as HVec;

/// HTTP transport: posts a JSON body of `{"frame": "<hex>"}` and returns the
/// response body's `frame` hex string. Implementations own retry-free,
/// single-attempt request semantics; the backoff loop lives in this module.
pub trait HttpTransport {
    type Error: core::fmt::Debug;

    fn post_frame(&mut self, endpoint: &str, frame_hex: &str) -> Result<heapless::String<128>, Self::Error>;
}

/// Up to 3 attempts, exponential backoff starting at 500ms and doubling.
const MAX_HTTP_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

/// Sleep hook, abstracted so tests run instantly. On ESP-IDF and host this
/// is `std::thread::sleep`; tests inject a no-op.
pub trait Sleeper {
    fn sleep_ms(&mut self, ms: u64);
}

pub struct RealSleeper;
impl Sleeper for RealSleeper {
    fn sleep_ms(&mut self, ms: u64) {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
}

/// Issue `frame_hex` against `endpoint` with up to `MAX_HTTP_ATTEMPTS`,
/// exponential backoff between attempts (spec §4.2).
fn post_with_retry<T: HttpTransport, S: Sleeper>(
    transport: &mut T,
    sleeper: &mut S,
    endpoint: &str,
    frame_hex: &str,
) -> Result<heapless::String<128>, ProtocolError> {
    let mut backoff = INITIAL_BACKOFF_MS;
    for attempt in 0..MAX_HTTP_ATTEMPTS {
        match transport.post_frame(endpoint, frame_hex) {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                log::warn!("protocol: HTTP attempt {} failed: {e:?}", attempt + 1);
                if attempt + 1 < MAX_HTTP_ATTEMPTS {
                    sleeper.sleep_ms(backoff);
                    backoff *= 2;
                }
            }
        }
    }
    Err(ProtocolError::TransportExhausted)
}

/// Perform one logical read, applying the single-retry-on-corruption policy
/// (spec §4.2): if the parsed response is `Corrupted`, retry the HTTP call
/// once more; a second corruption is dropped.
fn read_with_corruption_retry<T: HttpTransport, S: Sleeper>(
    transport: &mut T,
    sleeper: &mut S,
    endpoint: &str,
    frame_hex: &str,
) -> Result<HVec<u8, MAX_FRAME_BYTES>, ProtocolError> {
    for attempt in 0..2 {
        let resp = post_with_retry(transport, sleeper, endpoint, frame_hex)?;
        match frame::parse_response(&resp) {
            ParsedResponse::Ok(bytes) => return Ok(bytes),
            ParsedResponse::Exception(code) => return Err(ProtocolError::Exception(code)),
            ParsedResponse::Corrupted => {
                log::warn!("protocol: corrupted response (attempt {})", attempt + 1);
            }
        }
    }
    Err(ProtocolError::CrcMismatch)
}

/// Read `count` holding registers starting at `start_addr`.
pub fn read_registers<T: HttpTransport, S: Sleeper>(
    transport: &mut T,
    sleeper: &mut S,
    endpoint: &str,
    slave: u8,
    start_addr: u16,
    count: u16,
) -> Result<HVec<u8, MAX_FRAME_BYTES>, ProtocolError> {
    let hex = frame::build_read_request(slave, start_addr, count);
    read_with_corruption_retry(transport, sleeper, endpoint, &hex)
}

/// Write a single register.
pub fn write_register<T: HttpTransport, S: Sleeper>(
    transport: &mut T,
    sleeper: &mut S,
    endpoint: &str,
    slave: u8,
    addr: u16,
    value: u16,
) -> Result<HVec<u8, MAX_FRAME_BYTES>, ProtocolError> {
    let hex = frame::build_write_request(slave, addr, value);
    read_with_corruption_retry(transport, sleeper, endpoint, &hex)
}
