//! Register block decoding
//!
//! Pure functions from raw register arrays to named, scaled fields. Nothing
//! here performs I/O; structural problems (wrong length, wrong model header)
//! are `Decode` errors while odd physical values pass through untouched.

use serde::{Deserialize, Serialize};

use super::events::{decode_vendor_events, status_description, EventRecord};
use super::measurement::{Fields, MpptString, Readings};
use super::models::{
    mppt_block_len, ModelLayout, ACTIVE_STATUS_CODES, COMMON_BLOCK_LEN, CONTROLS_LEN,
    CONTROLS_MODEL, MPPT_HEADER_LEN, MPPT_MAX_MODULES, MPPT_MODEL, MPPT_MODULE_LEN, STATUS_FAULT,
    STORAGE_LEN, STORAGE_MODEL, SUNSPEC_MARKER,
};
use super::scale::{
    decode_power_factor, decode_string, normalize_float_pf, regs_to_f32, regs_to_u32,
    scale_factor, scaled_i16, scaled_u16, scaled_u32, NOT_IMPLEMENTED_U16,
};
use crate::error::{Result, SunSrvError};

/// Identity strings from the common block
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub manufacturer: String,
    pub model: String,
    pub version: String,
    pub serial_number: String,
}

/// Integer register scaled by a companion SF register
#[derive(Clone, Copy)]
struct ScaledField {
    name: &'static str,
    offset: usize,
    sf: usize,
    signed: bool,
}

const fn unsigned(name: &'static str, offset: usize, sf: usize) -> ScaledField {
    ScaledField {
        name,
        offset,
        sf,
        signed: false,
    }
}

const fn signed(name: &'static str, offset: usize, sf: usize) -> ScaledField {
    ScaledField {
        name,
        offset,
        sf,
        signed: true,
    }
}

const INVERTER_INT_FIELDS: &[ScaledField] = &[
    unsigned("ac_current", 0, 4),
    unsigned("ac_current_a", 1, 4),
    unsigned("ac_current_b", 2, 4),
    unsigned("ac_current_c", 3, 4),
    unsigned("ac_voltage_ab", 5, 11),
    unsigned("ac_voltage_bc", 6, 11),
    unsigned("ac_voltage_ca", 7, 11),
    unsigned("ac_voltage_an", 8, 11),
    unsigned("ac_voltage_bn", 9, 11),
    unsigned("ac_voltage_cn", 10, 11),
    signed("ac_power", 12, 13),
    unsigned("ac_frequency", 14, 15),
    signed("apparent_power", 16, 17),
    signed("reactive_power", 18, 19),
    unsigned("dc_current", 25, 26),
    unsigned("dc_voltage", 27, 28),
    signed("dc_power", 29, 30),
    signed("temp_cabinet", 31, 35),
    signed("temp_heatsink", 32, 35),
    signed("temp_transformer", 33, 35),
    signed("temp_other", 34, 35),
];

/// Offsets of float pairs in models 111-113
const INVERTER_FLOAT_FIELDS: &[(&str, usize)] = &[
    ("ac_current", 0),
    ("ac_current_a", 2),
    ("ac_current_b", 4),
    ("ac_current_c", 6),
    ("ac_voltage_ab", 8),
    ("ac_voltage_bc", 10),
    ("ac_voltage_ca", 12),
    ("ac_voltage_an", 14),
    ("ac_voltage_bn", 16),
    ("ac_voltage_cn", 18),
    ("ac_power", 20),
    ("ac_frequency", 22),
    ("apparent_power", 24),
    ("reactive_power", 26),
    ("lifetime_energy", 30),
    ("dc_current", 32),
    ("dc_voltage", 34),
    ("dc_power", 36),
    ("temp_cabinet", 38),
    ("temp_heatsink", 40),
    ("temp_transformer", 42),
    ("temp_other", 44),
];

const METER_FIELDS: &[ScaledField] = &[
    signed("current_total", 0, 4),
    signed("current_a", 1, 4),
    signed("current_b", 2, 4),
    signed("current_c", 3, 4),
    signed("voltage_ln_avg", 5, 13),
    signed("voltage_an", 6, 13),
    signed("voltage_bn", 7, 13),
    signed("voltage_cn", 8, 13),
    signed("voltage_ll_avg", 9, 13),
    signed("voltage_ab", 10, 13),
    signed("voltage_bc", 11, 13),
    signed("voltage_ca", 12, 13),
    signed("frequency", 14, 15),
    signed("power_total", 16, 20),
    signed("power_a", 17, 20),
    signed("power_b", 18, 20),
    signed("power_c", 19, 20),
    signed("va_total", 21, 25),
    signed("va_a", 22, 25),
    signed("va_b", 23, 25),
    signed("va_c", 24, 25),
    signed("var_total", 26, 30),
    signed("var_a", 27, 30),
    signed("var_b", 28, 30),
    signed("var_c", 29, 30),
];

const METER_PF_FIELDS: &[(&str, usize)] =
    &[("pf_avg", 31), ("pf_a", 32), ("pf_b", 33), ("pf_c", 34)];

/// acc32 energy counters sharing TotWh_SF at offset 52
const METER_ENERGY_FIELDS: &[(&str, usize)] = &[
    ("energy_exported", 36),
    ("energy_exported_a", 38),
    ("energy_exported_b", 40),
    ("energy_exported_c", 42),
    ("energy_imported", 44),
    ("energy_imported_a", 46),
    ("energy_imported_b", 48),
    ("energy_imported_c", 50),
];
const METER_ENERGY_SF: usize = 52;

const STORAGE_FIELDS: &[ScaledField] = &[
    unsigned("max_charge_power", 0, 16),
    unsigned("charge_ramp_rate", 1, 17),
    unsigned("discharge_ramp_rate", 2, 17),
    unsigned("max_charge_va", 4, 18),
    unsigned("min_reserve_pct", 5, 19),
    unsigned("charge_state_pct", 6, 20),
    unsigned("available_storage_ah", 7, 21),
    unsigned("battery_voltage", 8, 22),
    signed("discharge_rate_pct", 10, 23),
    signed("charge_rate_pct", 11, 23),
];

fn ensure_len(what: &str, regs: &[u16], expected: usize) -> Result<()> {
    if regs.len() != expected {
        return Err(SunSrvError::decode(format!(
            "{what} block needs {expected} registers, got {}",
            regs.len()
        )));
    }
    Ok(())
}

fn apply_scaled(fields: &mut Fields, regs: &[u16], table: &[ScaledField]) {
    for field in table {
        let sf = scale_factor(regs[field.sf]);
        let value = if field.signed {
            scaled_i16(regs[field.offset], sf)
        } else {
            scaled_u16(regs[field.offset], sf)
        };
        fields.set_opt(field.name, value);
    }
}

fn u16_field(raw: u16) -> Option<i64> {
    (raw != NOT_IMPLEMENTED_U16).then_some(raw as i64)
}

/// Operating state, alarm and event summary shared by both inverter layouts
fn apply_status(fields: &mut Fields, status_code: u16, vendor_code: u16, events: &[EventRecord]) {
    fields.set("status_code", status_code as i64);
    fields.set("status_vendor", vendor_code as i64);
    fields.set("status", status_description(status_code));
    fields.set("is_active", ACTIVE_STATUS_CODES.contains(&status_code));
    let event_count: usize = events.iter().map(|e| e.codes.len()).sum();
    fields.set("event_count", event_count as i64);
    fields.set(
        "status_alarm",
        status_code == STATUS_FAULT || event_count > 0,
    );
}

/// Decode a device model block read from the main block start
pub fn decode(model_id: u16, regs: &[u16]) -> Result<Readings> {
    match ModelLayout::for_model(model_id) {
        Some(ModelLayout::InverterIntSf) => decode_inverter_int(regs),
        Some(ModelLayout::InverterFloat) => decode_inverter_float(regs),
        Some(ModelLayout::Meter) => decode_meter(regs),
        None => match model_id {
            CONTROLS_MODEL => Ok(Readings {
                fields: decode_controls(regs)?,
                events: Vec::new(),
            }),
            STORAGE_MODEL => Ok(Readings {
                fields: decode_storage(regs)?,
                events: Vec::new(),
            }),
            other => Err(SunSrvError::decode(format!("unsupported model {other}"))),
        },
    }
}

/// Models 101-103
pub fn decode_inverter_int(regs: &[u16]) -> Result<Readings> {
    ensure_len("inverter", regs, ModelLayout::InverterIntSf.block_len() as usize)?;

    let mut fields = Fields::new();
    apply_scaled(&mut fields, regs, INVERTER_INT_FIELDS);
    fields.set_opt("power_factor", decode_power_factor(regs[20]));
    fields.set_opt(
        "lifetime_energy",
        scaled_u32(regs[22], regs[23], scale_factor(regs[24])),
    );
    fields.set("event_flags_1", regs_to_u32(regs[38], regs[39]) as i64);
    fields.set("event_flags_2", regs_to_u32(regs[40], regs[41]) as i64);

    let events = decode_vendor_events(&regs[42..50])?;
    apply_status(&mut fields, regs[36], regs[37], &events);

    Ok(Readings { fields, events })
}

/// Models 111-113
pub fn decode_inverter_float(regs: &[u16]) -> Result<Readings> {
    ensure_len("inverter", regs, ModelLayout::InverterFloat.block_len() as usize)?;

    let mut fields = Fields::new();
    for &(name, offset) in INVERTER_FLOAT_FIELDS {
        fields.set_opt(name, regs_to_f32(regs[offset], regs[offset + 1]));
    }
    fields.set_opt(
        "power_factor",
        regs_to_f32(regs[28], regs[29]).map(normalize_float_pf),
    );
    fields.set("event_flags_1", regs_to_u32(regs[48], regs[49]) as i64);
    fields.set("event_flags_2", regs_to_u32(regs[50], regs[51]) as i64);

    let events = decode_vendor_events(&regs[52..60])?;
    apply_status(&mut fields, regs[46], regs[47], &events);

    Ok(Readings { fields, events })
}

/// Models 201-204
pub fn decode_meter(regs: &[u16]) -> Result<Readings> {
    ensure_len("meter", regs, ModelLayout::Meter.block_len() as usize)?;

    let mut fields = Fields::new();
    apply_scaled(&mut fields, regs, METER_FIELDS);
    for &(name, offset) in METER_PF_FIELDS {
        fields.set_opt(name, decode_power_factor(regs[offset]));
    }
    let energy_sf = scale_factor(regs[METER_ENERGY_SF]);
    for &(name, offset) in METER_ENERGY_FIELDS {
        fields.set_opt(name, scaled_u32(regs[offset], regs[offset + 1], energy_sf));
    }

    Ok(Readings {
        fields,
        events: Vec::new(),
    })
}

/// Model 124 data registers (header excluded)
pub fn decode_storage(regs: &[u16]) -> Result<Fields> {
    ensure_len("storage", regs, STORAGE_LEN as usize)?;

    let mut fields = Fields::new();
    apply_scaled(&mut fields, regs, STORAGE_FIELDS);

    if let Some(mode) = u16_field(regs[3]) {
        fields.set("storage_control_mode", mode);
        fields.set("charge_limit_active", mode & 0x1 != 0);
        fields.set("discharge_limit_active", mode & 0x2 != 0);
    }

    if let Some(status) = u16_field(regs[9]) {
        fields.set("charge_status_code", status);
        fields.set("charge_status", charge_status_name(status as u16));
    }

    fields.set_opt("rate_window_secs", u16_field(regs[12]));
    fields.set_opt("rate_revert_secs", u16_field(regs[13]));
    fields.set_opt("rate_ramp_secs", u16_field(regs[14]));

    if let Some(grid) = u16_field(regs[15]) {
        fields.set("grid_charging_code", grid);
        fields.set("grid_charging", if grid == 1 { "GRID" } else { "PV" });
    }

    Ok(fields)
}

fn charge_status_name(code: u16) -> &'static str {
    match code {
        1 => "OFF",
        2 => "EMPTY",
        3 => "DISCHARGING",
        4 => "CHARGING",
        5 => "FULL",
        6 => "HOLDING",
        7 => "TESTING",
        _ => "UNKNOWN",
    }
}

/// Model 123 block including its two header registers
pub fn decode_controls(regs: &[u16]) -> Result<Fields> {
    ensure_len("controls", regs, CONTROLS_LEN as usize)?;
    if regs[0] != CONTROLS_MODEL {
        return Err(SunSrvError::decode(format!(
            "controls header carries model {}",
            regs[0]
        )));
    }

    let wmax_sf = scale_factor(regs[23]);
    let var_sf = scale_factor(regs[25]);

    let mut fields = Fields::new();
    fields.set("connected", regs[4] == 1);
    fields.set_opt("connect_window_secs", u16_field(regs[2]));
    fields.set_opt("connect_revert_secs", u16_field(regs[3]));

    fields.set_opt("power_limit_pct", scaled_u16(regs[5], wmax_sf));
    fields.set_opt("power_limit_window_secs", u16_field(regs[6]));
    fields.set_opt("power_limit_revert_secs", u16_field(regs[7]));
    fields.set_opt("power_limit_ramp_secs", u16_field(regs[8]));
    fields.set("power_limit_enabled", regs[9] == 1);

    fields.set_opt("power_factor", decode_power_factor(regs[10]));
    fields.set_opt("power_factor_window_secs", u16_field(regs[11]));
    fields.set_opt("power_factor_revert_secs", u16_field(regs[12]));
    fields.set_opt("power_factor_ramp_secs", u16_field(regs[13]));
    fields.set("power_factor_enabled", regs[14] == 1);

    fields.set_opt("var_w_max_pct", scaled_i16(regs[15], var_sf));
    fields.set_opt("var_max_pct", scaled_i16(regs[16], var_sf));
    fields.set_opt("var_aval_pct", scaled_i16(regs[17], var_sf));
    fields.set_opt("var_window_secs", u16_field(regs[18]));
    fields.set_opt("var_revert_secs", u16_field(regs[19]));
    fields.set_opt("var_ramp_secs", u16_field(regs[20]));
    fields.set_opt("var_mode", u16_field(regs[21]));
    fields.set("var_enabled", regs[22] == 1);

    Ok(fields)
}

/// Model 160 header plus `string_count` module blocks
pub fn decode_mppt(regs: &[u16], string_count: u16) -> Result<Vec<MpptString>> {
    if string_count == 0 {
        return Err(SunSrvError::decode("MPPT decode needs at least one string"));
    }
    let expected = mppt_block_len(string_count).ok_or_else(|| {
        SunSrvError::decode(format!("MPPT module count {string_count} out of range"))
    })?;
    ensure_len("MPPT", regs, expected as usize)?;
    if regs[0] != MPPT_MODEL {
        return Err(SunSrvError::decode(format!(
            "MPPT header carries model {}",
            regs[0]
        )));
    }

    let dca_sf = scale_factor(regs[2]);
    let dcv_sf = scale_factor(regs[3]);
    let dcw_sf = scale_factor(regs[4]);
    let dcwh_sf = scale_factor(regs[5]);

    let strings = (0..string_count)
        .map(|i| {
            let base = MPPT_HEADER_LEN as usize + MPPT_MODULE_LEN as usize * i as usize;
            let module = &regs[base..base + MPPT_MODULE_LEN as usize];
            MpptString {
                index: i + 1,
                label: decode_string(&module[1..9]),
                current: scaled_u16(module[9], dca_sf),
                voltage: scaled_u16(module[10], dcv_sf),
                power: scaled_u16(module[11], dcw_sf),
                energy: scaled_u32(module[12], module[13], dcwh_sf),
                temperature: scaled_i16(module[16], Some(0)),
            }
        })
        .collect();

    Ok(strings)
}

/// Number of modules announced by a Model 160 header
///
/// `None` when the header is absent, the count is outside `1..=MPPT_MAX_MODULES`
/// or the length register disagrees with it (`L == 8 + 20 * N`).
pub fn mppt_module_count(header: &[u16]) -> Option<u16> {
    if header.len() < MPPT_HEADER_LEN as usize || header[0] != MPPT_MODEL {
        return None;
    }
    let count = header[8];
    if count == 0 || count > MPPT_MAX_MODULES {
        return None;
    }
    let body_len = mppt_block_len(count)? - 2;
    (header[1] == body_len).then_some(count)
}

/// SunSpec common block (Model 1) starting at the "SunS" marker
pub fn decode_common_block(regs: &[u16]) -> Result<DeviceIdentity> {
    ensure_len("common", regs, COMMON_BLOCK_LEN as usize)?;
    if regs[0..2] != SUNSPEC_MARKER {
        return Err(SunSrvError::decode(format!(
            "missing SunS marker: 0x{:04X}{:04X}",
            regs[0], regs[1]
        )));
    }

    Ok(DeviceIdentity {
        manufacturer: decode_string(&regs[4..20]),
        model: decode_string(&regs[20..36]),
        version: decode_string(&regs[44..52]),
        serial_number: decode_string(&regs[52..68]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sunspec::events::EventClass;
    use crate::sunspec::measurement::FieldValue;

    /// Symo-style Model 103 block: 230 V, 1500 W, PF 14 (low precision)
    fn inverter_int_block() -> Vec<u16> {
        let mut regs = vec![0u16; 50];
        regs[0] = 652; // A
        regs[1] = 217;
        regs[2] = 218;
        regs[3] = 217;
        regs[4] = (-2i16) as u16; // A_SF
        regs[8] = 2301; // PhVphA
        regs[9] = 2299;
        regs[10] = 2305;
        regs[5] = 3990;
        regs[6] = 3985;
        regs[7] = 3992;
        regs[11] = (-1i16) as u16; // V_SF
        regs[12] = 1500; // W
        regs[13] = 0;
        regs[14] = 5001; // Hz
        regs[15] = (-2i16) as u16;
        regs[16] = 1510;
        regs[17] = 0;
        regs[18] = (-120i16) as u16;
        regs[19] = 0;
        regs[20] = 14; // PF
        regs[21] = 0;
        regs[22] = 0x0001; // WH = 65536 + 1000
        regs[23] = 1000;
        regs[24] = 0;
        regs[25] = 402; // DCA
        regs[26] = (-2i16) as u16;
        regs[27] = 3800; // DCV
        regs[28] = (-1i16) as u16;
        regs[29] = 1560;
        regs[30] = 0;
        regs[31] = 0x8000; // TmpCab not implemented
        regs[32] = 41;
        regs[33] = 0x8000;
        regs[34] = 0x8000;
        regs[35] = 0;
        regs[36] = 4; // MPPT
        regs[37] = 4;
        regs
    }

    #[test]
    fn test_inverter_int_fields() {
        let readings = decode(103, &inverter_int_block()).unwrap();
        let f = &readings.fields;
        assert_eq!(f.f64("ac_current"), Some(6.52));
        assert_eq!(f.f64("ac_voltage_an"), Some(230.1));
        assert_eq!(f.f64("ac_power"), Some(1500.0));
        assert_eq!(f.f64("ac_frequency"), Some(50.01));
        assert_eq!(f.f64("reactive_power"), Some(-120.0));
        assert_eq!(f.f64("power_factor"), Some(0.14));
        assert_eq!(f.f64("lifetime_energy"), Some(66536.0));
        assert_eq!(f.f64("dc_voltage"), Some(380.0));
        assert_eq!(f.f64("temp_heatsink"), Some(41.0));
        assert!(!f.contains("temp_cabinet"));
        assert_eq!(f.get("status"), Some(&FieldValue::Text("MPPT".into())));
        assert_eq!(f.get("is_active"), Some(&FieldValue::Bool(true)));
        assert_eq!(f.get("status_alarm"), Some(&FieldValue::Bool(false)));
        assert_eq!(f.get("event_count"), Some(&FieldValue::Int(0)));
        assert!(readings.events.is_empty());
    }

    #[test]
    fn test_primo_power_factor_uses_high_precision() {
        let mut regs = inverter_int_block();
        regs[20] = 9995;
        let readings = decode(102, &regs).unwrap();
        assert_eq!(readings.fields.f64("power_factor"), Some(0.9995));
    }

    #[test]
    fn test_vendor_events_in_int_block() {
        let mut regs = inverter_int_block();
        regs[42] = 307;
        regs[43] = 522;
        let readings = decode(103, &regs).unwrap();

        assert_eq!(readings.events.len(), 1);
        assert_eq!(readings.events[0].codes, vec![307, 522]);
        assert_eq!(readings.events[0].class, EventClass::Warning);
        assert_eq!(readings.fields.get("event_count"), Some(&FieldValue::Int(2)));
        assert_eq!(
            readings.fields.get("status_alarm"),
            Some(&FieldValue::Bool(true))
        );
    }

    #[test]
    fn test_last_vendor_register_is_decoded() {
        // EvtVnd4 low word sits in register 50 of the block
        let mut regs = inverter_int_block();
        regs[49] = 447;
        let readings = decode(103, &regs).unwrap();
        assert_eq!(readings.events.len(), 1);
        assert_eq!(readings.events[0].group, 4);
        assert_eq!(readings.events[0].codes, vec![447]);
    }

    #[test]
    fn test_fault_status_sets_alarm_without_events() {
        let mut regs = inverter_int_block();
        regs[36] = 7;
        let readings = decode(103, &regs).unwrap();
        assert!(readings.events.is_empty());
        assert_eq!(
            readings.fields.get("status_alarm"),
            Some(&FieldValue::Bool(true))
        );
        assert_eq!(readings.fields.get("is_active"), Some(&FieldValue::Bool(false)));
    }

    #[test]
    fn test_wrong_length_is_decode_error() {
        assert!(matches!(
            decode(103, &vec![0; 49]),
            Err(SunSrvError::Decode(_))
        ));
        assert!(matches!(decode(113, &vec![0; 50]), Err(SunSrvError::Decode(_))));
        assert!(matches!(decode(203, &vec![0; 50]), Err(SunSrvError::Decode(_))));
        assert!(matches!(decode(999, &vec![0; 50]), Err(SunSrvError::Decode(_))));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let regs = inverter_int_block();
        assert_eq!(decode(103, &regs).unwrap(), decode(103, &regs).unwrap());
    }

    fn put_f32(regs: &mut [u16], offset: usize, value: f32) {
        let bits = value.to_bits();
        regs[offset] = (bits >> 16) as u16;
        regs[offset + 1] = bits as u16;
    }

    #[test]
    fn test_inverter_float_fields() {
        let mut regs = vec![0u16; 60];
        put_f32(&mut regs, 20, 2450.5);
        put_f32(&mut regs, 22, 49.98);
        put_f32(&mut regs, 28, 99.0);
        put_f32(&mut regs, 4, f32::NAN);
        regs[46] = 5;
        regs[53] = 509;

        let readings = decode(113, &regs).unwrap();
        assert_eq!(readings.fields.f64("ac_power"), Some(2450.5));
        assert_eq!(readings.fields.f64("ac_frequency"), Some(49.98f32 as f64));
        assert_eq!(readings.fields.f64("power_factor"), Some(0.99));
        assert!(!readings.fields.contains("ac_current_b"));
        assert_eq!(readings.events.len(), 1);
        assert_eq!(readings.events[0].codes, vec![509]);
        assert_eq!(readings.fields.get("is_active"), Some(&FieldValue::Bool(true)));
    }

    #[test]
    fn test_meter_fields() {
        let mut regs = vec![0u16; 53];
        regs[0] = (-52i16) as u16; // A
        regs[4] = (-1i16) as u16;
        regs[6] = 2311;
        regs[13] = (-1i16) as u16;
        regs[14] = 4999;
        regs[15] = (-2i16) as u16;
        regs[16] = (-1200i16) as u16; // exporting
        regs[20] = 0;
        regs[31] = 9650;
        regs[32] = 0x8000;
        regs[35] = 0;
        regs[36] = 0x0002; // TotWhExp
        regs[37] = 0x0000;
        regs[44] = 0x0000;
        regs[45] = 1234;
        regs[52] = 0;

        let readings = decode(203, &regs).unwrap();
        let f = &readings.fields;
        assert_eq!(f.f64("current_total"), Some(-5.2));
        assert_eq!(f.f64("voltage_an"), Some(231.1));
        assert_eq!(f.f64("frequency"), Some(49.99));
        assert_eq!(f.f64("power_total"), Some(-1200.0));
        assert_eq!(f.f64("pf_avg"), Some(0.965));
        assert!(!f.contains("pf_a"));
        assert_eq!(f.f64("energy_exported"), Some(131072.0));
        assert_eq!(f.f64("energy_imported"), Some(1234.0));
        assert!(readings.events.is_empty());
    }

    #[test]
    fn test_storage_fields() {
        let mut regs = vec![0u16; 24];
        regs[0] = 5000;
        regs[3] = 0x3;
        regs[4] = 0xFFFF;
        regs[6] = 8750;
        regs[8] = 512;
        regs[9] = 4;
        regs[10] = (-500i16) as u16;
        regs[15] = 1;
        regs[16] = 0;
        regs[20] = (-2i16) as u16;
        regs[22] = (-1i16) as u16;
        regs[23] = (-2i16) as u16;

        let f = decode_storage(&regs).unwrap();
        assert_eq!(f.f64("max_charge_power"), Some(5000.0));
        assert_eq!(f.f64("charge_state_pct"), Some(87.5));
        assert_eq!(f.f64("battery_voltage"), Some(51.2));
        assert_eq!(f.f64("discharge_rate_pct"), Some(-5.0));
        assert!(!f.contains("max_charge_va"));
        assert_eq!(f.get("charge_status"), Some(&FieldValue::Text("CHARGING".into())));
        assert_eq!(f.get("grid_charging"), Some(&FieldValue::Text("GRID".into())));
        assert_eq!(f.get("charge_limit_active"), Some(&FieldValue::Bool(true)));
        assert_eq!(f.get("discharge_limit_active"), Some(&FieldValue::Bool(true)));
    }

    #[test]
    fn test_controls_fields() {
        let mut regs = vec![0u16; 26];
        regs[0] = 123;
        regs[1] = 24;
        regs[4] = 1;
        regs[5] = 10000;
        regs[9] = 1;
        regs[10] = 9800;
        regs[14] = 0;
        regs[21] = 0xFFFF;
        regs[22] = 0;
        regs[23] = (-2i16) as u16;
        regs[24] = 0;
        regs[25] = 0;

        let f = decode_controls(&regs).unwrap();
        assert_eq!(f.get("connected"), Some(&FieldValue::Bool(true)));
        assert_eq!(f.f64("power_limit_pct"), Some(100.0));
        assert_eq!(f.get("power_limit_enabled"), Some(&FieldValue::Bool(true)));
        assert_eq!(f.f64("power_factor"), Some(0.98));
        assert_eq!(f.get("power_factor_enabled"), Some(&FieldValue::Bool(false)));
        assert!(!f.contains("var_mode"));

        regs[0] = 160;
        assert!(decode_controls(&regs).is_err());
    }

    fn mppt_block(strings: u16) -> Vec<u16> {
        let mut regs = vec![0u16; (10 + 20 * strings) as usize];
        regs[0] = 160;
        regs[1] = 8 + 20 * strings;
        regs[2] = (-2i16) as u16;
        regs[3] = (-1i16) as u16;
        regs[4] = 0;
        regs[5] = 0;
        regs[8] = strings;
        for i in 0..strings as usize {
            let base = 10 + 20 * i;
            regs[base] = i as u16 + 1;
            regs[base + 1] = 0x4D50; // "MP"
            regs[base + 2] = 0x5054; // "PT"
            regs[base + 9] = 410 + i as u16;
            regs[base + 10] = 3500;
            regs[base + 11] = 1435;
            regs[base + 12] = 0;
            regs[base + 13] = 5000;
            regs[base + 16] = 0x8000;
        }
        regs
    }

    #[test]
    fn test_mppt_two_strings() {
        let strings = decode_mppt(&mppt_block(2), 2).unwrap();
        assert_eq!(strings.len(), 2);
        assert_eq!(strings[0].index, 1);
        assert_eq!(strings[0].label, "MPPT");
        assert_eq!(strings[0].current, Some(4.1));
        assert_eq!(strings[1].current, Some(4.11));
        assert_eq!(strings[1].voltage, Some(350.0));
        assert_eq!(strings[1].energy, Some(5000.0));
        assert_eq!(strings[1].temperature, None);
    }

    #[test]
    fn test_mppt_single_and_many_strings() {
        assert_eq!(decode_mppt(&mppt_block(1), 1).unwrap().len(), 1);
        assert_eq!(decode_mppt(&mppt_block(4), 4).unwrap().len(), 4);
        // Block sized for two strings cannot be decoded as three
        assert!(decode_mppt(&mppt_block(2), 3).is_err());
        assert!(decode_mppt(&mppt_block(2), 0).is_err());
    }

    #[test]
    fn test_mppt_module_count() {
        let block = mppt_block(2);
        assert_eq!(mppt_module_count(&block[..10]), Some(2));
        assert_eq!(mppt_module_count(&[0u16; 10]), None);
    }

    #[test]
    fn test_mppt_module_count_rejects_bogus_headers() {
        let mut header = mppt_block(2)[..10].to_vec();
        header[8] = 0xFFFF;
        assert_eq!(mppt_module_count(&header), None);

        // Count and length register disagree
        let mut header = mppt_block(2)[..10].to_vec();
        header[8] = 3;
        assert_eq!(mppt_module_count(&header), None);

        let mut header = mppt_block(2)[..10].to_vec();
        header[8] = 0;
        assert_eq!(mppt_module_count(&header), None);

        assert!(decode_mppt(&mppt_block(2), u16::MAX).is_err());
    }

    #[test]
    fn test_common_block() {
        let mut regs = vec![0u16; 69];
        regs[0] = 0x5375;
        regs[1] = 0x6E53;
        regs[2] = 1;
        regs[3] = 65;
        regs[4] = 0x4672; // "Fr"
        regs[5] = 0x6F6E; // "on"
        regs[6] = 0x6975; // "iu"
        regs[7] = 0x7300; // "s"
        regs[20] = 0x5379; // "Sy"
        regs[21] = 0x6D6F; // "mo"
        regs[52] = 0x3132; // "12"
        regs[53] = 0x3334; // "34"

        let identity = decode_common_block(&regs).unwrap();
        assert_eq!(identity.manufacturer, "Fronius");
        assert_eq!(identity.model, "Symo");
        assert_eq!(identity.serial_number, "1234");

        regs[0] = 0;
        assert!(decode_common_block(&regs).is_err());
    }
}
