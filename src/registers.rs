//! Static inverter register map.
//!
//! The register set is fixed at build time: each `RegId` maps to a Modbus
//! holding-register address, a display scale, and a human label. Acquisition
//! uses this table to compute the minimum contiguous window covering a
//! requested set of registers.

/// Upper bound on the number of registers sampled in a single `Sample`.
pub const MAX_REGISTERS: usize = 16;

/// Identifier of an inverter register. Order here has no bearing on wire
/// order — the *active list* in `EcoWattConfig` determines sample layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum RegId {
    AcVoltage = 0,
    AcCurrent = 1,
    AcPowerWatts = 2,
    DcVoltage = 3,
    DcCurrent = 4,
    DcPowerWatts = 5,
    FrequencyHz = 6,
    TemperatureC = 7,
    EnergyTodayWh = 8,
    EnergyTotalKwh = 9,
    FaultCode = 10,
}

/// A single row of the static register map.
#[derive(Debug, Clone, Copy)]
pub struct RegisterDef {
    pub id: RegId,
    /// Modbus holding-register address.
    pub address: u16,
    /// Divide the raw 16-bit value by this to get engineering units.
    pub scale: u16,
    pub label: &'static str,
}

/// The full static register map, address-ordered.
pub const REGISTER_MAP: [RegisterDef; 11] = [
    RegisterDef { id: RegId::AcVoltage, address: 0x0000, scale: 10, label: "ac_voltage_v" },
    RegisterDef { id: RegId::AcCurrent, address: 0x0001, scale: 100, label: "ac_current_a" },
    RegisterDef { id: RegId::AcPowerWatts, address: 0x0002, scale: 1, label: "ac_power_w" },
    RegisterDef { id: RegId::DcVoltage, address: 0x0003, scale: 10, label: "dc_voltage_v" },
    RegisterDef { id: RegId::DcCurrent, address: 0x0004, scale: 100, label: "dc_current_a" },
    RegisterDef { id: RegId::DcPowerWatts, address: 0x0005, scale: 1, label: "dc_power_w" },
    RegisterDef { id: RegId::FrequencyHz, address: 0x0006, scale: 100, label: "grid_freq_hz" },
    RegisterDef { id: RegId::TemperatureC, address: 0x0007, scale: 10, label: "heatsink_temp_c" },
    RegisterDef { id: RegId::EnergyTodayWh, address: 0x0008, scale: 1, label: "energy_today_wh" },
    RegisterDef { id: RegId::EnergyTotalKwh, address: 0x0009, scale: 10, label: "energy_total_kwh" },
    RegisterDef { id: RegId::FaultCode, address: 0x000A, scale: 1, label: "fault_code" },
];

pub fn lookup(id: RegId) -> &'static RegisterDef {
    REGISTER_MAP
        .iter()
        .find(|r| r.id == id)
        .expect("RegId always present in REGISTER_MAP")
}

/// The minimum contiguous Modbus window `[start_addr, start_addr + count)`
/// covering every register in `regs`. `regs` need not be address-sorted.
///
/// Returns `None` for an empty slice.
pub fn minimum_window(regs: &[RegId]) -> Option<(u16, u16)> {
    let mut min_addr = u16::MAX;
    let mut max_addr = 0u16;
    let mut any = false;
    for &r in regs {
        let addr = lookup(r).address;
        min_addr = min_addr.min(addr);
        max_addr = max_addr.max(addr);
        any = true;
    }
    if !any {
        return None;
    }
    Some((min_addr, max_addr - min_addr + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_covers_scattered_registers() {
        let regs = [RegId::AcPowerWatts, RegId::AcVoltage, RegId::DcVoltage];
        let (start, count) = minimum_window(&regs).unwrap();
        assert_eq!(start, 0x0000);
        assert_eq!(count, 4); // addresses 0,1,2,3 -> window of 4
    }

    #[test]
    fn window_of_single_register_is_width_one() {
        let regs = [RegId::FaultCode];
        let (start, count) = minimum_window(&regs).unwrap();
        assert_eq!(start, 0x000A);
        assert_eq!(count, 1);
    }

    #[test]
    fn empty_slice_has_no_window() {
        assert!(minimum_window(&[]).is_none());
    }

    #[test]
    fn every_regid_resolves() {
        for r in REGISTER_MAP {
            assert_eq!(lookup(r.id).id, r.id);
        }
    }
}
