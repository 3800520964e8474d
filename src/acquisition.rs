//! Acquisition (spec §4.3) — groups a requested register set into the
//! minimum contiguous read and decodes the response into caller order.

use crate::error::AcquisitionError;
use crate::protocol::{self, HttpTransport, Sleeper};
use crate::registers::{self, RegId, MAX_REGISTERS};

/// Decoded register values in the order `regs` was given, independent of the
/// underlying contiguous window's address order.
#[derive(Debug, Clone, Copy)]
pub struct DecodedValues {
    pub count: usize,
    pub values: [u16; MAX_REGISTERS],
}

impl DecodedValues {
    pub fn values(&self) -> &[u16] {
        &self.values[..self.count]
    }
}

/// Read `regs` (in the given order) from the inverter, returning a
/// `DecodedValues` with `count == regs.len()` on full success, or
/// `count < regs.len()` on any partial/failed read — callers must not emit
/// a sample in that case (spec §4.3).
pub fn read_request<T: HttpTransport, S: Sleeper>(
    transport: &mut T,
    sleeper: &mut S,
    endpoint: &str,
    slave: u8,
    regs: &[RegId],
) -> DecodedValues {
    let mut out = DecodedValues { count: 0, values: [0u16; MAX_REGISTERS] };

    let Some((start_addr, window)) = registers::minimum_window(regs) else {
        return out;
    };
    if regs.len() > MAX_REGISTERS {
        log::warn!("acquisition: requested register count exceeds MAX_REGISTERS");
        return out;
    }

    let response = match protocol::read_registers(transport, sleeper, endpoint, slave, start_addr, window) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("acquisition: read failed: {e}");
            let _: AcquisitionError = AcquisitionError::ReadFailed(e);
            return out;
        }
    };

    // Response body after slave+function: [byte_count][register values...].
    if response.len() < 3 {
        log::warn!("acquisition: response too short");
        return out;
    }
    let byte_count = response[2] as usize;
    let payload = &response[3..];
    if payload.len() < byte_count || byte_count < window as usize * 2 {
        log::warn!("acquisition: response payload shorter than declared window");
        return out;
    }

    for (i, &reg) in regs.iter().enumerate() {
        let addr = registers::lookup(reg).address;
        let offset = (addr - start_addr) as usize * 2;
        if offset + 1 >= payload.len() {
            log::warn!("acquisition: register offset out of bounds");
            return out;
        }
        let raw = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
        out.values[i] = raw;
    }
    out.count = regs.len();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc16;
    use heapless::Vec as HVec;

    struct FixedTransport {
        window_start: u16,
        window_count: u16,
        register_values: Vec<(u16, u16)>,
    }

    struct NoopSleeper;
    impl Sleeper for NoopSleeper {
        fn sleep_ms(&mut self, _ms: u64) {}
    }

    impl HttpTransport for FixedTransport {
        type Error = &'static str;
        fn post_frame(
            &mut self,
            _endpoint: &str,
            _frame_hex: &str,
        ) -> Result<heapless::String<128>, Self::Error> {
            let byte_count = (self.window_count as usize) * 2;
            let mut buf: HVec<u8, { crate::protocol::frame::MAX_FRAME_BYTES }> = HVec::new();
            let _ = buf.push(0x01);
            let _ = buf.push(0x03);
            let _ = buf.push(byte_count as u8);
            for i in 0..self.window_count {
                let addr = self.window_start + i;
                let val = self
                    .register_values
                    .iter()
                    .find(|(a, _)| *a == addr)
                    .map_or(0, |(_, v)| *v);
                let _ = buf.push((val >> 8) as u8);
                let _ = buf.push((val & 0xFF) as u8);
            }
            let crc = crc16::compute(&buf);
            let [lo, hi] = crc16::to_bytes(crc);
            let _ = buf.push(lo);
            let _ = buf.push(hi);
            let mut s = heapless::String::new();
            for b in &buf {
                let _ = core::fmt::write(&mut s, format_args!("{b:02x}"));
            }
            Ok(s)
        }
    }

    #[test]
    fn decodes_in_caller_order_regardless_of_address_order() {
        let mut transport = FixedTransport {
            window_start: 0,
            window_count: 4,
            register_values: vec![(0, 2300), (1, 0), (2, 500), (3, 100)],
        };
        let mut sleeper = NoopSleeper;
        let regs = [RegId::AcPowerWatts, RegId::AcVoltage, RegId::DcVoltage];
        let decoded = read_request(&mut transport, &mut sleeper, "http://x", 1, &regs);
        assert_eq!(decoded.count, 3);
        assert_eq!(decoded.values(), &[500, 2300, 100]);
    }

    #[test]
    fn empty_register_list_yields_zero_count() {
        let mut transport = FixedTransport { window_start: 0, window_count: 0, register_values: vec![] };
        let mut sleeper = NoopSleeper;
        let decoded = read_request(&mut transport, &mut sleeper, "http://x", 1, &[]);
        assert_eq!(decoded.count, 0);
    }
}
