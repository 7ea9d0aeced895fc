//! Diagnostic Trouble Codes
//!
//! Normalisation, classification and SAE two-byte decoding of DTCs.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// System a DTC belongs to, derived from its first letter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcCategory {
    Powertrain,
    Body,
    Chassis,
    Network,
}

impl DtcCategory {
    fn from_prefix(prefix: char) -> Option<Self> {
        match prefix {
            'P' => Some(DtcCategory::Powertrain),
            'B' => Some(DtcCategory::Body),
            'C' => Some(DtcCategory::Chassis),
            'U' => Some(DtcCategory::Network),
            _ => None,
        }
    }
}

/// Severity tier shown to the customer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcSeverity {
    Info,
    Warning,
    Critical,
}

/// A normalised diagnostic trouble code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dtc {
    /// Normalised code, e.g. `P0300`
    pub code: String,
    pub category: DtcCategory,
    pub severity: DtcSeverity,
    pub description: String,
}

impl Dtc {
    /// Build a DTC from any accepted spelling of its code
    pub fn parse(raw: &str) -> Option<Self> {
        let code = normalize_code(raw)?;
        let prefix = code.chars().next()?;
        let category = DtcCategory::from_prefix(prefix)?;
        Some(Self {
            severity: severity_for(&code),
            description: describe(&code),
            category,
            code,
        })
    }
}

impl fmt::Display for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

/// Normalise a code to `[PBCU]` followed by four hex digits.
///
/// Whitespace is trimmed, letters are upper-cased and a short numeric part is
/// zero padded on the left (`P300` becomes `P0300`).
pub fn normalize_code(raw: &str) -> Option<String> {
    let upper = raw.trim().to_ascii_uppercase();
    let mut chars = upper.chars();
    let prefix = chars.next()?;
    DtcCategory::from_prefix(prefix)?;

    let digits: String = chars.collect();
    if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("{}{:0>4}", prefix, digits))
}

/// Normalise, drop invalid codes and duplicates, keeping first-seen order
pub fn dedupe_codes<I, S>(codes: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    codes
        .into_iter()
        .filter_map(|c| normalize_code(c.as_ref()))
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

/// Decode two raw bytes into a standard DTC code string (e.g., "P0300").
///
/// `00 00` is padding and yields `None`.
pub fn decode_dtc_bytes(b1: u8, b2: u8) -> Option<String> {
    if b1 == 0x00 && b2 == 0x00 {
        return None;
    }

    let category = match (b1 >> 6) & 0x03 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };

    let digit1 = (b1 >> 4) & 0x03;
    let digit2 = b1 & 0x0F;
    let digit3 = (b2 >> 4) & 0x0F;
    let digit4 = b2 & 0x0F;

    Some(format!("{category}{digit1}{digit2:X}{digit3:X}{digit4:X}"))
}

/// Encode a normalised code back into its two wire bytes
pub fn encode_dtc_bytes(code: &str) -> Option<(u8, u8)> {
    let code = normalize_code(code)?;
    let bytes = code.as_bytes();
    let category: u8 = match bytes[0] {
        b'P' => 0,
        b'C' => 1,
        b'B' => 2,
        _ => 3,
    };
    let nibble = |c: u8| (c as char).to_digit(16).map(|d| d as u8);
    let d1 = nibble(bytes[1])?;
    if d1 > 3 {
        return None;
    }
    let b1 = (category << 6) | (d1 << 4) | nibble(bytes[2])?;
    let b2 = (nibble(bytes[3])? << 4) | nibble(bytes[4])?;
    Some((b1, b2))
}

/// Numeric part of a normalised code, `None` for manufacturer hex codes
fn numeric(code: &str) -> Option<u16> {
    code.get(1..)?.parse().ok()
}

fn severity_for(code: &str) -> DtcSeverity {
    let prefix = code.as_bytes()[0];
    let Some(n) = numeric(code) else {
        return DtcSeverity::Warning;
    };
    match prefix {
        b'P' => match n {
            // misfire and ignition
            300..=399 => DtcSeverity::Critical,
            // engine control module and outputs
            600..=699 => DtcSeverity::Critical,
            // fuel/air metering and emissions controls
            100..=299 | 400..=499 => DtcSeverity::Warning,
            // transmission
            700..=999 => DtcSeverity::Warning,
            // speed/idle control and manufacturer codes
            _ => DtcSeverity::Info,
        },
        b'C' => match n {
            0..=299 => DtcSeverity::Critical,
            _ => DtcSeverity::Warning,
        },
        b'U' => DtcSeverity::Critical,
        _ => DtcSeverity::Info,
    }
}

const KNOWN_CODES: &[(&str, &str)] = &[
    ("P0100", "Mass or Volume Air Flow Circuit Malfunction"),
    ("P0101", "Mass or Volume Air Flow Circuit Range/Performance"),
    ("P0113", "Intake Air Temperature Circuit High Input"),
    ("P0128", "Coolant Thermostat Below Regulating Temperature"),
    ("P0171", "System Too Lean (Bank 1)"),
    ("P0172", "System Too Rich (Bank 1)"),
    ("P0300", "Random/Multiple Cylinder Misfire Detected"),
    ("P0301", "Cylinder 1 Misfire Detected"),
    ("P0302", "Cylinder 2 Misfire Detected"),
    ("P0303", "Cylinder 3 Misfire Detected"),
    ("P0304", "Cylinder 4 Misfire Detected"),
    ("P0325", "Knock Sensor 1 Circuit Malfunction"),
    ("P0335", "Crankshaft Position Sensor A Circuit Malfunction"),
    ("P0401", "Exhaust Gas Recirculation Flow Insufficient"),
    ("P0420", "Catalyst System Efficiency Below Threshold (Bank 1)"),
    ("P0430", "Catalyst System Efficiency Below Threshold (Bank 2)"),
    ("P0442", "Evaporative Emission System Leak Detected (small leak)"),
    ("P0455", "Evaporative Emission System Leak Detected (large leak)"),
    ("P0500", "Vehicle Speed Sensor Malfunction"),
    ("P0505", "Idle Control System Malfunction"),
    ("P0606", "Control Module Processor Fault"),
    ("P0700", "Transmission Control System Malfunction"),
    ("U0100", "Lost Communication With ECM/PCM A"),
    ("U0121", "Lost Communication With ABS Control Module"),
];

fn describe(code: &str) -> String {
    if let Some((_, text)) = KNOWN_CODES.iter().find(|(c, _)| *c == code) {
        return (*text).to_string();
    }

    let prefix = code.as_bytes()[0];
    let generic = match (prefix, numeric(code)) {
        (b'P', Some(100..=199)) => "Fuel and air metering",
        (b'P', Some(200..=299)) => "Fuel and air metering (injector circuit)",
        (b'P', Some(300..=399)) => "Ignition system or misfire",
        (b'P', Some(400..=499)) => "Auxiliary emissions controls",
        (b'P', Some(500..=599)) => "Vehicle speed, idle control and auxiliary inputs",
        (b'P', Some(600..=699)) => "Computer and auxiliary outputs",
        (b'P', Some(700..=999)) => "Transmission",
        (b'P', _) => "Powertrain (manufacturer specific)",
        (b'B', _) => "Body system fault",
        (b'C', _) => "Chassis system fault",
        _ => "Network communication fault",
    };
    generic.to_string()
}
