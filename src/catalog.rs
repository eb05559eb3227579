//! Static register catalog: one descriptor per controller register, with
//! lookup by address and by stable key, and the raw <-> user-space value
//! conversions.
//!
//! Two-word quantities (the f32 pack voltage/current, the u32 state of
//! charge) are described at their base address; the partner word above it
//! is polled raw and reassembled by the model, never interpreted on its
//! own.

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueClass {
    Numeric,
    Enum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    U16,
    I16,
    /// Low word of a u32 spanning this address and the next.
    U32,
    /// Low word of an IEEE-754 f32 spanning this address and the next.
    F32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
    WriteOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    Cell,
    Pack,
    Temperature,
    Status,
    Config,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumItem {
    pub value: u16,
    pub label: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDescriptor {
    pub address: u16,
    pub key: &'static str,
    pub label: &'static str,
    pub unit: &'static str,
    pub class: ValueClass,
    pub storage: Storage,
    pub scale: f64,
    pub precision: u8,
    pub step_raw: u16,
    pub min_raw: Option<u16>,
    pub max_raw: Option<u16>,
    pub default_raw: u16,
    pub access: Access,
    pub group: Group,
    pub enum_items: &'static [EnumItem],
}

/// The register the restart command writes to, and the value it writes.
pub const RESTART_ADDRESS: u16 = 0x0086;
pub const RESTART_MAGIC: u16 = 0xA55A;

/// Writable configuration window.
pub const CONFIG_RANGE_START: u16 = 0x012C;
pub const CONFIG_RANGE_END: u16 = 0x018F;

// Derived-telemetry addresses (see the protocol document).
pub const ADDR_CELL_FIRST: u16 = 0;
pub const ADDR_CELL_LAST: u16 = 15;
pub const ADDR_PACK_VOLTAGE: u16 = 36; // f32 across 36..=37
pub const ADDR_PACK_CURRENT: u16 = 38; // f32 across 38..=39
pub const ADDR_CELL_MIN_MV: u16 = 40;
pub const ADDR_CELL_MAX_MV: u16 = 41;
pub const ADDR_TEMP_SENSOR_1: u16 = 42;
pub const ADDR_TEMP_SENSOR_2: u16 = 43;
pub const ADDR_SOH: u16 = 45;
pub const ADDR_SOC: u16 = 46; // u32 across 46..=47
pub const ADDR_TEMP_INTERNAL: u16 = 48;
pub const ADDR_BMS_STATE: u16 = 50;
pub const ADDR_BALANCING_BITS: u16 = 52;

const BMS_STATES: &[EnumItem] = &[
    EnumItem { value: 0, label: "standby" },
    EnumItem { value: 1, label: "charge" },
    EnumItem { value: 2, label: "discharge" },
    EnumItem { value: 3, label: "protect" },
    EnumItem { value: 4, label: "fault" },
];

const BALANCE_MODES: &[EnumItem] = &[
    EnumItem { value: 0, label: "off" },
    EnumItem { value: 1, label: "charge_only" },
    EnumItem { value: 2, label: "always" },
];

const LED_MODES: &[EnumItem] = &[
    EnumItem { value: 0, label: "off" },
    EnumItem { value: 1, label: "on" },
    EnumItem { value: 2, label: "blink_on_activity" },
];

macro_rules! reg {
    (
        $address:expr, $key:expr, $label:expr, $unit:expr,
        $class:ident, $storage:ident, $scale:expr, $precision:expr,
        step $step:expr, min $min:expr, max $max:expr, default $default:expr,
        $access:ident, $group:ident, $items:expr
    ) => {
        RegisterDescriptor {
            address: $address,
            key: $key,
            label: $label,
            unit: $unit,
            class: ValueClass::$class,
            storage: Storage::$storage,
            scale: $scale,
            precision: $precision,
            step_raw: $step,
            min_raw: $min,
            max_raw: $max,
            default_raw: $default,
            access: Access::$access,
            group: Group::$group,
            enum_items: $items,
        }
    };
}

macro_rules! cell {
    ($n:literal, $key:literal) => {
        reg!(
            $n, $key, concat!("Cell ", $n, " voltage"), "V",
            Numeric, U16, 0.0001, 4,
            step 1, min None, max None, default 0,
            ReadOnly, Cell, &[]
        )
    };
}

macro_rules! cfg_u16 {
    (
        $address:expr, $key:expr, $label:expr, $unit:expr, $scale:expr, $precision:expr,
        step $step:expr, min $min:expr, max $max:expr, default $default:expr
    ) => {
        reg!(
            $address, $key, $label, $unit,
            Numeric, U16, $scale, $precision,
            step $step, min Some($min), max Some($max), default $default,
            ReadWrite, Config, &[]
        )
    };
}

#[rustfmt::skip]
static REGISTERS: &[RegisterDescriptor] = &[
    // Live set: per-cell voltages.
    cell!(0, "cell_0_v"), cell!(1, "cell_1_v"), cell!(2, "cell_2_v"),
    cell!(3, "cell_3_v"), cell!(4, "cell_4_v"), cell!(5, "cell_5_v"),
    cell!(6, "cell_6_v"), cell!(7, "cell_7_v"), cell!(8, "cell_8_v"),
    cell!(9, "cell_9_v"), cell!(10, "cell_10_v"), cell!(11, "cell_11_v"),
    cell!(12, "cell_12_v"), cell!(13, "cell_13_v"), cell!(14, "cell_14_v"),
    cell!(15, "cell_15_v"),

    // Live set: pack-level quantities.
    reg!(ADDR_PACK_VOLTAGE, "pack_voltage_v", "Pack voltage", "V",
         Numeric, F32, 1.0, 2, step 1, min None, max None, default 0,
         ReadOnly, Pack, &[]),
    reg!(ADDR_PACK_CURRENT, "pack_current_a", "Pack current", "A",
         Numeric, F32, 1.0, 2, step 1, min None, max None, default 0,
         ReadOnly, Pack, &[]),
    reg!(ADDR_CELL_MIN_MV, "cell_min_mv", "Lowest cell voltage", "mV",
         Numeric, U16, 1.0, 0, step 1, min None, max None, default 0,
         ReadOnly, Cell, &[]),
    reg!(ADDR_CELL_MAX_MV, "cell_max_mv", "Highest cell voltage", "mV",
         Numeric, U16, 1.0, 0, step 1, min None, max None, default 0,
         ReadOnly, Cell, &[]),
    reg!(ADDR_TEMP_SENSOR_1, "temp_sensor_1_c", "Temperature sensor 1", "°C",
         Numeric, I16, 0.1, 1, step 1, min None, max None, default 0,
         ReadOnly, Temperature, &[]),
    reg!(ADDR_TEMP_SENSOR_2, "temp_sensor_2_c", "Temperature sensor 2", "°C",
         Numeric, I16, 0.1, 1, step 1, min None, max None, default 0,
         ReadOnly, Temperature, &[]),
    reg!(ADDR_SOH, "soh_pct", "State of health", "%",
         Numeric, U16, 0.01, 2, step 1, min None, max None, default 10000,
         ReadOnly, Pack, &[]),
    reg!(ADDR_SOC, "soc_pct", "State of charge", "%",
         Numeric, U32, 1e-6, 2, step 1, min None, max None, default 0,
         ReadOnly, Pack, &[]),
    reg!(ADDR_TEMP_INTERNAL, "temp_internal_c", "Internal temperature", "°C",
         Numeric, I16, 0.1, 1, step 1, min None, max None, default 0,
         ReadOnly, Temperature, &[]),
    reg!(ADDR_BMS_STATE, "bms_state", "BMS state", "",
         Enum, U16, 1.0, 0, step 0, min None, max None, default 0,
         ReadOnly, Status, BMS_STATES),
    reg!(ADDR_BALANCING_BITS, "balancing_bits", "Balancing bitmask", "",
         Numeric, U16, 1.0, 0, step 1, min None, max None, default 0,
         ReadOnly, Status, &[]),

    // System.
    reg!(RESTART_ADDRESS, "system_restart", "Controller restart", "",
         Numeric, U16, 1.0, 0, step 1, min None, max None, default 0,
         WriteOnly, System, &[]),

    // Configuration window (0x012C..): cell voltage setpoints, mV.
    cfg_u16!(0x012C, "fully_charged_voltage_mv", "Fully charged cell voltage", "mV",
             1.0, 0, step 1, min 3000, max 4500, default 4200),
    cfg_u16!(0x012D, "fully_discharged_voltage_mv", "Fully discharged cell voltage", "mV",
             1.0, 0, step 1, min 2000, max 3500, default 3000),
    cfg_u16!(0x012E, "cell_overvoltage_trip_mv", "Cell overvoltage trip", "mV",
             1.0, 0, step 1, min 3500, max 4600, default 4250),
    cfg_u16!(0x012F, "cell_overvoltage_release_mv", "Cell overvoltage release", "mV",
             1.0, 0, step 1, min 3400, max 4500, default 4150),
    cfg_u16!(0x0130, "cell_undervoltage_trip_mv", "Cell undervoltage trip", "mV",
             1.0, 0, step 1, min 2000, max 3200, default 2700),
    cfg_u16!(0x0131, "cell_undervoltage_release_mv", "Cell undervoltage release", "mV",
             1.0, 0, step 1, min 2100, max 3400, default 2900),

    // Pack voltage setpoints, raw in units of 10 mV.
    cfg_u16!(0x0132, "pack_overvoltage_trip_mv", "Pack overvoltage trip", "mV",
             10.0, 0, step 1, min 1200, max 6500, default 5800),
    cfg_u16!(0x0133, "pack_overvoltage_release_mv", "Pack overvoltage release", "mV",
             10.0, 0, step 1, min 1200, max 6500, default 5600),
    cfg_u16!(0x0134, "pack_undervoltage_trip_mv", "Pack undervoltage trip", "mV",
             10.0, 0, step 1, min 800, max 5000, default 4000),
    cfg_u16!(0x0135, "pack_undervoltage_release_mv", "Pack undervoltage release", "mV",
             10.0, 0, step 1, min 800, max 5200, default 4400),

    // Current protection.
    cfg_u16!(0x0136, "charge_overcurrent_trip_a", "Charge overcurrent trip", "A",
             0.1, 1, step 1, min 10, max 5000, default 1000),
    cfg_u16!(0x0137, "charge_overcurrent_delay_s", "Charge overcurrent delay", "s",
             1.0, 0, step 1, min 0, max 60, default 5),
    cfg_u16!(0x0138, "discharge_overcurrent_trip_a", "Discharge overcurrent trip", "A",
             0.1, 1, step 1, min 10, max 5000, default 1500),
    cfg_u16!(0x0139, "discharge_overcurrent_delay_s", "Discharge overcurrent delay", "s",
             1.0, 0, step 1, min 0, max 60, default 5),

    // Temperature protection. The undertemperature pair can go below zero,
    // so those two are i16 and carry no raw bounds.
    cfg_u16!(0x013A, "charge_overtemp_trip_c", "Charge overtemperature trip", "°C",
             0.1, 1, step 1, min 200, max 800, default 550),
    cfg_u16!(0x013B, "charge_overtemp_release_c", "Charge overtemperature release", "°C",
             0.1, 1, step 1, min 200, max 800, default 500),
    reg!(0x013C, "charge_undertemp_trip_c", "Charge undertemperature trip", "°C",
         Numeric, I16, 0.1, 1, step 1, min None, max None, default 0,
         ReadWrite, Config, &[]),
    reg!(0x013D, "charge_undertemp_release_c", "Charge undertemperature release", "°C",
         Numeric, I16, 0.1, 1, step 1, min None, max None, default 50,
         ReadWrite, Config, &[]),
    cfg_u16!(0x013E, "discharge_overtemp_trip_c", "Discharge overtemperature trip", "°C",
             0.1, 1, step 1, min 200, max 800, default 600),
    cfg_u16!(0x013F, "discharge_overtemp_release_c", "Discharge overtemperature release", "°C",
             0.1, 1, step 1, min 200, max 800, default 550),

    // Balancing.
    cfg_u16!(0x0140, "balance_start_voltage_mv", "Balancing start voltage", "mV",
             1.0, 0, step 1, min 3000, max 4500, default 3900),
    cfg_u16!(0x0141, "balance_trigger_delta_mv", "Balancing trigger delta", "mV",
             1.0, 0, step 1, min 5, max 200, default 30),
    reg!(0x0142, "balance_mode", "Balancing mode", "",
         Enum, U16, 1.0, 0, step 0, min None, max None, default 1,
         ReadWrite, Config, BALANCE_MODES),

    // Pack layout and capacity.
    cfg_u16!(0x0143, "cell_count", "Cells in series", "",
             1.0, 0, step 1, min 4, max 32, default 16),
    cfg_u16!(0x0144, "design_capacity_ah", "Design capacity", "Ah",
             0.1, 1, step 1, min 10, max 10000, default 1000),
    cfg_u16!(0x0145, "charge_current_limit_a", "Charge current limit", "A",
             0.1, 1, step 1, min 10, max 5000, default 500),
    cfg_u16!(0x0146, "discharge_current_limit_a", "Discharge current limit", "A",
             0.1, 1, step 1, min 10, max 5000, default 1000),

    // State-of-charge bookkeeping.
    cfg_u16!(0x0147, "soc_low_alarm_pct", "SOC low alarm", "%",
             1.0, 0, step 1, min 0, max 100, default 10),
    cfg_u16!(0x0148, "soc_empty_voltage_mv", "SOC empty voltage", "mV",
             1.0, 0, step 1, min 2000, max 3500, default 2800),
    cfg_u16!(0x0149, "shunt_resistance_uohm", "Shunt resistance", "µΩ",
             1.0, 0, step 1, min 50, max 1000, default 100),

    // Housekeeping.
    cfg_u16!(0x014A, "sleep_idle_minutes", "Sleep after idle", "min",
             1.0, 0, step 1, min 0, max 1440, default 0),
    reg!(0x014B, "led_mode", "LED mode", "",
         Enum, U16, 1.0, 0, step 0, min None, max None, default 2,
         ReadWrite, Config, LED_MODES),
    cfg_u16!(0x014C, "precharge_time_ms", "Precharge time", "ms",
             10.0, 0, step 1, min 0, max 1000, default 50),
    cfg_u16!(0x014D, "num_temperature_sensors", "Temperature sensors", "",
             1.0, 0, step 1, min 1, max 4, default 2),
];

/// The ~2 s poll set: everything the derived telemetry model consumes.
/// Includes the raw high words of the two-register quantities.
#[rustfmt::skip]
pub static LIVE_ADDRESSES: &[u16] = &[
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
    36, 37, 38, 39, 40, 41, 42, 43, 45, 46, 47, 48, 50, 52,
];

/// The slow (default-off) poll set: the writable configuration window.
#[rustfmt::skip]
pub static CONFIG_ADDRESSES: &[u16] = &[
    0x012C, 0x012D, 0x012E, 0x012F, 0x0130, 0x0131, 0x0132, 0x0133,
    0x0134, 0x0135, 0x0136, 0x0137, 0x0138, 0x0139, 0x013A, 0x013B,
    0x013C, 0x013D, 0x013E, 0x013F, 0x0140, 0x0141, 0x0142, 0x0143,
    0x0144, 0x0145, 0x0146, 0x0147, 0x0148, 0x0149, 0x014A, 0x014B,
    0x014C, 0x014D,
];

pub struct Catalog {
    by_addr: FxHashMap<u16, &'static RegisterDescriptor>,
    by_key: FxHashMap<&'static str, &'static RegisterDescriptor>,
}

impl Catalog {
    pub fn new() -> Self {
        let mut by_addr = FxHashMap::default();
        let mut by_key = FxHashMap::default();
        for descriptor in REGISTERS {
            let prev = by_addr.insert(descriptor.address, descriptor);
            debug_assert!(prev.is_none(), "duplicate address {}", descriptor.address);
            let prev = by_key.insert(descriptor.key, descriptor);
            debug_assert!(prev.is_none(), "duplicate key {}", descriptor.key);
        }
        Catalog { by_addr, by_key }
    }

    pub fn by_address(&self, address: u16) -> Option<&'static RegisterDescriptor> {
        self.by_addr.get(&address).copied()
    }

    pub fn by_key(&self, key: &str) -> Option<&'static RegisterDescriptor> {
        self.by_key.get(key).copied()
    }

    /// Resolves a CLI-style register reference: a key, a decimal address,
    /// or a hex address with 0x prefix.
    pub fn resolve(&self, reference: &str) -> Result<&'static RegisterDescriptor> {
        if let Some(descriptor) = self.by_key(reference) {
            return Ok(descriptor);
        }
        let parsed = if let Some(hex) = reference.strip_prefix("0x") {
            u16::from_str_radix(hex, 16).ok()
        } else {
            reference.parse::<u16>().ok()
        };
        parsed
            .and_then(|addr| self.by_address(addr))
            .ok_or_else(|| Error::UnknownRegister(reference.to_string()))
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &'static RegisterDescriptor> + '_ {
        REGISTERS.iter()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Catalog::new()
    }
}

fn round_to_precision(value: f64, precision: u8) -> f64 {
    let factor = 10f64.powi(i32::from(precision));
    (value * factor).round() / factor
}

impl RegisterDescriptor {
    /// Number of consecutive registers this descriptor's value occupies.
    pub fn width_regs(&self) -> u16 {
        match self.storage {
            Storage::U16 | Storage::I16 => 1,
            Storage::U32 | Storage::F32 => 2,
        }
    }

    /// Converts a raw register word to its user-space value. Enum-class
    /// registers pass through unchanged; numeric ones are scaled and
    /// rounded to the declared precision.
    pub fn raw_to_user(&self, raw: u16) -> f64 {
        if self.class == ValueClass::Enum {
            return f64::from(raw);
        }
        let signed = match self.storage {
            Storage::I16 => f64::from(raw as i16),
            _ => f64::from(raw),
        };
        round_to_precision(signed * self.scale, self.precision)
    }

    pub fn min_user(&self) -> Option<f64> {
        self.min_raw.map(|raw| self.raw_to_user(raw))
    }

    pub fn max_user(&self) -> Option<f64> {
        self.max_raw.map(|raw| self.raw_to_user(raw))
    }

    /// Converts a user-space value to the raw word for a write.
    ///
    /// Out-of-bounds values are rejected rather than silently clamped;
    /// in-bounds values snap to the nearest step, and the snapped result is
    /// clamped back into the raw bounds so snapping can never escape them.
    pub fn user_to_raw(&self, user: f64) -> Result<u16> {
        if self.class == ValueClass::Enum {
            let raw = user as u16;
            if f64::from(raw) != user || !self.enum_items.iter().any(|item| item.value == raw) {
                return Err(Error::OutOfRange {
                    key: self.key,
                    value: user,
                    min: 0.0,
                    max: f64::from(u16::MAX),
                });
            }
            return Ok(raw);
        }

        let min_user = self.min_user();
        let max_user = self.max_user();
        if let (Some(min), Some(max)) = (min_user, max_user) {
            // Tolerate rounding noise up to half a precision digit.
            let slack = 0.5 * 10f64.powi(-i32::from(self.precision));
            if user < min - slack || user > max + slack {
                return Err(Error::OutOfRange {
                    key: self.key,
                    value: user,
                    min,
                    max,
                });
            }
        }

        let raw_exact = user / self.scale;
        let step = f64::from(self.step_raw.max(1));
        let mut raw = (raw_exact / step).round() * step;

        if let Some(min_raw) = self.min_raw {
            raw = raw.max(f64::from(min_raw));
        }
        if let Some(max_raw) = self.max_raw {
            raw = raw.min(f64::from(max_raw));
        }

        if self.storage == Storage::I16 {
            if raw < f64::from(i16::MIN) || raw > f64::from(i16::MAX) {
                return Err(Error::OutOfRange {
                    key: self.key,
                    value: user,
                    min: f64::from(i16::MIN) * self.scale,
                    max: f64::from(i16::MAX) * self.scale,
                });
            }
            return Ok((raw as i16) as u16);
        }

        if raw < 0.0 || raw > f64::from(u16::MAX) {
            return Err(Error::OutOfRange {
                key: self.key,
                value: user,
                min: 0.0,
                max: f64::from(u16::MAX) * self.scale,
            });
        }
        Ok(raw as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_and_keys_are_unique() {
        let catalog = Catalog::new();
        assert_eq!(catalog.by_addr.len(), REGISTERS.len());
        assert_eq!(catalog.by_key.len(), REGISTERS.len());
    }

    #[test]
    fn lookup_by_address_and_key_agree() {
        let catalog = Catalog::new();
        let by_key = catalog.by_key("fully_charged_voltage_mv").unwrap();
        let by_addr = catalog.by_address(0x012C).unwrap();
        assert_eq!(by_key.key, by_addr.key);
    }

    #[test]
    fn resolve_accepts_key_decimal_and_hex() {
        let catalog = Catalog::new();
        assert_eq!(catalog.resolve("cell_0_v").unwrap().address, 0);
        assert_eq!(catalog.resolve("40").unwrap().key, "cell_min_mv");
        assert_eq!(catalog.resolve("0x012C").unwrap().key, "fully_charged_voltage_mv");
        assert!(matches!(
            catalog.resolve("bogus"),
            Err(Error::UnknownRegister(_))
        ));
    }

    #[test]
    fn cell_voltage_scaling_matches_protocol() {
        let catalog = Catalog::new();
        let cell = catalog.by_address(0).unwrap();
        // Raw 0x1068 = 4200 -> 0.4200 V at 0.0001 V/LSB, precision 4.
        assert_eq!(cell.raw_to_user(0x1068), 0.42);
    }

    #[test]
    fn i16_registers_sign_extend() {
        let catalog = Catalog::new();
        let temp = catalog.by_address(ADDR_TEMP_INTERNAL).unwrap();
        // -5.0 °C encodes as -50 in two's complement.
        assert_eq!(temp.raw_to_user((-50i16) as u16), -5.0);
    }

    #[test]
    fn enum_registers_pass_through() {
        let catalog = Catalog::new();
        let state = catalog.by_address(ADDR_BMS_STATE).unwrap();
        assert_eq!(state.raw_to_user(2), 2.0);
        assert_eq!(state.user_to_raw(2.0).unwrap(), 2);
        assert!(state.user_to_raw(9.0).is_err());
    }

    #[test]
    fn round_trip_is_identity_within_bounds_and_step() {
        let catalog = Catalog::new();
        for descriptor in catalog.descriptors() {
            if descriptor.class == ValueClass::Enum || descriptor.access == Access::ReadOnly {
                continue;
            }
            let (Some(min), Some(max)) = (descriptor.min_raw, descriptor.max_raw) else {
                continue;
            };
            for raw in [min, (min + max) / 2, max] {
                let user = descriptor.raw_to_user(raw);
                let back = descriptor.user_to_raw(user).unwrap();
                assert_eq!(back, raw, "register {} raw {}", descriptor.key, raw);
            }
        }
    }

    #[test]
    fn raw_to_user_is_idempotent_under_rounding() {
        let catalog = Catalog::new();
        let soh = catalog.by_address(ADDR_SOH).unwrap();
        let once = soh.raw_to_user(9876);
        assert_eq!(once, round_to_precision(once, soh.precision));
    }

    #[test]
    fn write_at_bounds_accepted_one_step_beyond_rejected() {
        let catalog = Catalog::new();
        let reg = catalog.by_key("fully_charged_voltage_mv").unwrap();
        assert_eq!(reg.user_to_raw(3000.0).unwrap(), 3000);
        assert_eq!(reg.user_to_raw(4500.0).unwrap(), 4500);
        assert!(reg.user_to_raw(2999.0).is_err());
        assert!(reg.user_to_raw(4501.0).is_err());
    }

    #[test]
    fn write_snaps_to_nearest_step() {
        let catalog = Catalog::new();
        let reg = catalog.by_key("precharge_time_ms").unwrap();
        // scale 10 ms per LSB: 123 ms is between raw 12 (120 ms) and 13 (130 ms).
        assert_eq!(reg.user_to_raw(123.0).unwrap(), 12);
        assert_eq!(reg.user_to_raw(127.0).unwrap(), 13);
    }

    #[test]
    fn scenario_fully_charged_voltage_write() {
        let catalog = Catalog::new();
        let reg = catalog.by_key("fully_charged_voltage_mv").unwrap();
        assert_eq!(reg.address, 0x012C);
        assert_eq!(reg.user_to_raw(4200.0).unwrap(), 4200);
    }

    #[test]
    fn live_and_config_sets_have_expected_shape() {
        assert_eq!(LIVE_ADDRESSES.len(), 30);
        assert_eq!(CONFIG_ADDRESSES.len(), 34);
        let catalog = Catalog::new();
        for &addr in CONFIG_ADDRESSES {
            let descriptor = catalog.by_address(addr).unwrap();
            assert!(
                (CONFIG_RANGE_START..=CONFIG_RANGE_END).contains(&descriptor.address),
                "{} outside the writable window",
                descriptor.key
            );
            assert_ne!(descriptor.access, Access::ReadOnly);
        }
    }

    #[test]
    fn two_word_registers_report_their_width() {
        let catalog = Catalog::new();
        assert_eq!(catalog.by_address(ADDR_PACK_VOLTAGE).unwrap().width_regs(), 2);
        assert_eq!(catalog.by_address(ADDR_SOC).unwrap().width_regs(), 2);
        assert_eq!(catalog.by_address(ADDR_CELL_MIN_MV).unwrap().width_regs(), 1);
    }
}
