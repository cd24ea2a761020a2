//! Fronius state codes and vendor event decoding
//!
//! `EvtVnd1..EvtVnd4` occupy four register pairs at the end of the inverter
//! block. Each non-zero register in a pair carries one active state code.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::{Result, SunSrvError};

/// Number of vendor event groups
pub const VENDOR_EVENT_GROUPS: usize = 4;

/// Registers per vendor event group
pub const REGISTERS_PER_GROUP: usize = 2;

/// Severity category of a state code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventClass {
    Info,
    Warning,
    Fault,
}

impl EventClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Fault => "Fault",
        }
    }
}

/// Static description of one state code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventInfo {
    pub description: &'static str,
    pub class: EventClass,
}

/// Active codes of one vendor event group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// 1-based group number (EvtVnd1 = 1)
    pub group: u8,
    pub codes: Vec<u16>,
    pub descriptions: Vec<String>,
    /// Most severe class among `codes`
    pub class: EventClass,
}

use EventClass::{Fault, Info, Warning};

const STATE_CODES: &[(u16, &str, EventClass)] = &[
    (102, "AC voltage too high", Warning),
    (103, "AC voltage too low", Warning),
    (105, "AC frequency too high", Warning),
    (106, "AC frequency too low", Warning),
    (107, "No AC grid detected", Warning),
    (108, "Island operation detected", Warning),
    (112, "Residual current monitoring error", Fault),
    (301, "AC overcurrent", Warning),
    (302, "DC overcurrent", Warning),
    (303, "DC module overtemperature", Warning),
    (304, "AC module overtemperature", Warning),
    (305, "No feed-in despite closed relay", Warning),
    (306, "PV output too low for feed-in", Info),
    (307, "DC voltage too low", Info),
    (308, "Intermediate circuit voltage too high", Warning),
    (309, "DC input voltage MPPT1 too high", Warning),
    (311, "DC strings polarity reversed", Fault),
    (313, "DC input voltage MPPT2 too high", Warning),
    (314, "Current sensor calibration timeout", Warning),
    (315, "AC current sensor error", Fault),
    (316, "Interrupt check failed", Warning),
    (325, "Overtemperature in connection area", Warning),
    (326, "Fan 1 error", Warning),
    (327, "Fan 2 error", Warning),
    (401, "No communication with power stage set", Fault),
    (406, "AC module temperature sensor faulty", Fault),
    (407, "Heat sink temperature sensor faulty", Fault),
    (408, "DC feed-in detected", Fault),
    (412, "Fixed voltage mode active instead of MPP", Warning),
    (415, "Safety cut-out via option card", Fault),
    (416, "No communication between power stage and control", Fault),
    (417, "Hardware ID problem", Fault),
    (419, "Unique ID conflict", Fault),
    (420, "No communication with hybrid manager", Fault),
    (421, "HID range error", Fault),
    (425, "No communication with power stage set", Fault),
    (426, "Possible hardware fault", Fault),
    (427, "Possible hardware fault", Fault),
    (428, "Possible hardware fault", Fault),
    (431, "Software problem", Fault),
    (436, "Functional incompatibility", Fault),
    (437, "Power stage set problem", Fault),
    (438, "Functional incompatibility", Fault),
    (443, "Intermediate circuit voltage too low or asymmetric", Fault),
    (445, "Compatibility error", Fault),
    (447, "Insulation fault", Fault),
    (448, "Neutral conductor not connected", Fault),
    (450, "Guard cannot be found", Fault),
    (451, "Memory error detected", Fault),
    (452, "Communication error between processors", Fault),
    (453, "Grid voltage and power stage incompatible", Fault),
    (454, "Grid frequency and power stage incompatible", Fault),
    (456, "Anti-islanding function error", Fault),
    (457, "Grid relay sticking", Fault),
    (458, "Measuring signal error", Fault),
    (459, "Insulation test measuring signal error", Fault),
    (460, "DSP reference voltage out of tolerance", Fault),
    (461, "DSP data memory fault", Fault),
    (462, "DC feed-in monitoring error", Fault),
    (463, "AC polarity reversed", Fault),
    (474, "RCMU sensor faulty", Fault),
    (475, "Insulation fault between PV array and ground", Fault),
    (476, "Driver supply voltage too low", Fault),
    (479, "Intermediate circuit relay switched off", Fault),
    (480, "Functional incompatibility", Fault),
    (481, "Functional incompatibility", Fault),
    (482, "Setup after initial start-up aborted", Fault),
    (483, "MPP2 fixed voltage out of limits", Fault),
    (485, "CAN transmit buffer full", Fault),
    (489, "Permanent overvoltage on intermediate circuit", Fault),
    (502, "Insulation error on solar modules", Warning),
    (509, "No feed-in within the last 24 hours", Warning),
    (515, "Communication with filter not possible", Warning),
    (516, "Communication with storage unit not possible", Warning),
    (517, "Power derating due to overtemperature", Warning),
    (518, "Internal DSP malfunction", Warning),
    (519, "Communication with storage unit not possible", Warning),
    (520, "No feed-in from MPPT1 within the last 24 hours", Warning),
    (522, "DC low string 1", Warning),
    (523, "DC low string 2", Warning),
    (558, "Functional incompatibility", Warning),
    (559, "Functional incompatibility", Warning),
    (560, "Power derating due to overfrequency", Warning),
    (564, "Functional incompatibility", Warning),
    (566, "Arc detector switched off", Warning),
    (567, "Grid voltage dependent power reduction active", Info),
    (601, "CAN bus full", Fault),
    (603, "AC module temperature sensor faulty (L3)", Fault),
    (604, "DC module temperature sensor faulty", Fault),
    (607, "Residual current monitoring error", Fault),
    (608, "Functional incompatibility", Fault),
    (721, "EEPROM re-initialised", Info),
    (722, "EEPROM data faulty", Warning),
    (751, "Time lost", Info),
    (752, "Real time clock communication error", Info),
    (757, "Real time clock hardware error", Warning),
    (758, "Real time clock in emergency mode", Warning),
    (760, "Internal hardware error", Warning),
    (766, "Emergency power derating active", Warning),
    (768, "Different power limitation in hardware modules", Warning),
    (772, "Storage unit not available", Warning),
    (773, "Invalid country setup", Warning),
    (775, "Power stage set not available", Warning),
    (776, "Invalid device type", Warning),
];

static EVENT_TABLE: OnceLock<HashMap<u16, EventInfo>> = OnceLock::new();

/// Code table, built on first use
pub fn event_table() -> &'static HashMap<u16, EventInfo> {
    EVENT_TABLE.get_or_init(|| {
        STATE_CODES
            .iter()
            .map(|&(code, description, class)| (code, EventInfo { description, class }))
            .collect()
    })
}

/// Look up a code; unknown codes are reported as warnings
pub fn describe_event(code: u16) -> (String, EventClass) {
    match event_table().get(&code) {
        Some(info) => (info.description.to_string(), info.class),
        None => (format!("Unknown state code {code}"), Warning),
    }
}

/// Decode the eight `EvtVnd1..4` registers into one record per active group
pub fn decode_vendor_events(regs: &[u16]) -> Result<Vec<EventRecord>> {
    let expected = VENDOR_EVENT_GROUPS * REGISTERS_PER_GROUP;
    if regs.len() != expected {
        return Err(SunSrvError::decode(format!(
            "vendor event block needs {expected} registers, got {}",
            regs.len()
        )));
    }

    let records = regs
        .chunks_exact(REGISTERS_PER_GROUP)
        .enumerate()
        .filter_map(|(index, group)| {
            let codes: Vec<u16> = group.iter().copied().filter(|c| *c != 0).collect();
            if codes.is_empty() {
                return None;
            }
            let mut class = Info;
            let descriptions = codes
                .iter()
                .map(|code| {
                    let (description, code_class) = describe_event(*code);
                    class = class.max(code_class);
                    description
                })
                .collect();
            Some(EventRecord {
                group: index as u8 + 1,
                codes,
                descriptions,
                class,
            })
        })
        .collect();

    Ok(records)
}

/// SunSpec operating state text
pub fn status_description(code: u16) -> &'static str {
    match code {
        1 => "Off",
        2 => "Sleeping",
        3 => "Starting",
        4 => "MPPT",
        5 => "Throttled",
        6 => "Shutting down",
        7 => "Fault",
        8 => "Standby",
        _ => "Unknown",
    }
}
