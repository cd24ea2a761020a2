//! Scale factors and raw register conversions

/// Not-implemented markers
pub const NOT_IMPLEMENTED_U16: u16 = 0xFFFF;
pub const NOT_IMPLEMENTED_I16: u16 = 0x8000;
pub const NOT_IMPLEMENTED_U32: u32 = 0xFFFF_FFFF;

/// `raw * 10^sf`, dividing for negative exponents so decimal results stay exact
pub fn apply_scale(raw: f64, sf: i16) -> f64 {
    if sf < 0 {
        raw / 10f64.powi(-(sf as i32))
    } else {
        raw * 10f64.powi(sf as i32)
    }
}

/// Scale factor register, `None` when not implemented
pub fn scale_factor(raw: u16) -> Option<i16> {
    if raw == NOT_IMPLEMENTED_I16 {
        None
    } else {
        Some(raw as i16)
    }
}

/// Unsigned 16-bit value with its scale factor
pub fn scaled_u16(raw: u16, sf: Option<i16>) -> Option<f64> {
    if raw == NOT_IMPLEMENTED_U16 {
        return None;
    }
    Some(apply_scale(raw as f64, sf?))
}

/// Signed 16-bit value with its scale factor
pub fn scaled_i16(raw: u16, sf: Option<i16>) -> Option<f64> {
    if raw == NOT_IMPLEMENTED_I16 {
        return None;
    }
    Some(apply_scale(raw as i16 as f64, sf?))
}

/// 32-bit accumulator (big-endian register pair) with its scale factor
pub fn scaled_u32(hi: u16, lo: u16, sf: Option<i16>) -> Option<f64> {
    let raw = regs_to_u32(hi, lo);
    if raw == NOT_IMPLEMENTED_U32 {
        return None;
    }
    Some(apply_scale(raw as f64, sf?))
}

pub fn regs_to_u32(hi: u16, lo: u16) -> u32 {
    ((hi as u32) << 16) | lo as u32
}

/// IEEE-754 single from a register pair, `None` for NaN
pub fn regs_to_f32(hi: u16, lo: u16) -> Option<f64> {
    let value = f32::from_bits(regs_to_u32(hi, lo));
    if value.is_nan() {
        None
    } else {
        Some(value as f64)
    }
}

/// Effective power factor exponent
///
/// The DataManager reports `PF_SF = 0` for every model. Primo units encode
/// the value with four decimals, Symo units with two.
pub fn pf_scale_factor(raw: i16) -> i16 {
    if raw.unsigned_abs() > 100 {
        -4
    } else {
        -2
    }
}

/// Power factor as a fraction in [-1, 1]
pub fn decode_power_factor(raw: u16) -> Option<f64> {
    if raw == NOT_IMPLEMENTED_I16 {
        return None;
    }
    let value = raw as i16;
    Some(apply_scale(value as f64, pf_scale_factor(value)))
}

/// Float models report PF either as a fraction or as a percentage
pub fn normalize_float_pf(value: f64) -> f64 {
    if value.abs() > 1.0 {
        value / 100.0
    } else {
        value
    }
}

/// ASCII string packed two characters per register
pub fn decode_string(regs: &[u16]) -> String {
    let bytes: Vec<u8> = regs.iter().flat_map(|r| r.to_be_bytes()).collect();
    String::from_utf8_lossy(&bytes)
        .trim_end_matches(&['\0', ' '][..])
        .trim_start()
        .chars()
        .filter(|c| !c.is_control())
        .collect()
}
