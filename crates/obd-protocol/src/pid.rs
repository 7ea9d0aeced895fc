//! OBD-II PID Definitions and Response Parsing
//!
//! Defines the Mode 01 Parameter IDs (PIDs) the kiosk samples, together
//! with their payload width and conversion formula.

use crate::error::ObdError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Standard OBD-II PIDs for Mode 01 (current data)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Pid {
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Short-term fuel trim bank 1 (0x06)
    ShortFuelTrim = 0x06,
    /// Long-term fuel trim bank 1 (0x07)
    LongFuelTrim = 0x07,
    /// Intake manifold absolute pressure (0x0B)
    IntakeManifoldPressure = 0x0B,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Timing advance (0x0E)
    TimingAdvance = 0x0E,
    /// Intake air temperature (0x0F)
    IntakeAirTemp = 0x0F,
    /// Mass air flow rate (0x10)
    Maf = 0x10,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
    /// Oxygen sensor voltage bank 1, sensor 1 (0x14)
    O2Voltage = 0x14,
    /// Fuel tank level (0x2F)
    FuelLevel = 0x2F,
    /// Control module voltage (0x42)
    ControlModuleVoltage = 0x42,
}

impl Pid {
    /// Every PID with a definition, in table order
    pub const ALL: [Pid; 14] = [
        Pid::EngineLoad,
        Pid::CoolantTemp,
        Pid::ShortFuelTrim,
        Pid::LongFuelTrim,
        Pid::IntakeManifoldPressure,
        Pid::Rpm,
        Pid::Speed,
        Pid::TimingAdvance,
        Pid::IntakeAirTemp,
        Pid::Maf,
        Pid::ThrottlePosition,
        Pid::O2Voltage,
        Pid::FuelLevel,
        Pid::ControlModuleVoltage,
    ];

    /// PIDs read by `read_live_data` when the caller does not choose
    pub const LIVE_DEFAULT: [Pid; 6] = [
        Pid::Rpm,
        Pid::Speed,
        Pid::CoolantTemp,
        Pid::EngineLoad,
        Pid::ThrottlePosition,
        Pid::IntakeAirTemp,
    ];

    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Look up a PID by its hex value
    pub fn from_hex(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_hex() == code)
    }

    /// Get the number of response bytes for this PID
    pub fn response_bytes(&self) -> usize {
        self.definition().bytes
    }

    /// Get the sampling priority (higher = more frequent)
    pub fn sampling_priority(&self) -> u8 {
        match self {
            Pid::Rpm | Pid::Speed | Pid::CoolantTemp | Pid::EngineLoad => 10,
            Pid::Maf | Pid::ThrottlePosition | Pid::IntakeManifoldPressure => 5,
            _ => 2,
        }
    }

    /// Static definition of this PID
    pub fn definition(&self) -> &'static PidDefinition {
        PID_TABLE
            .iter()
            .find(|d| d.pid == *self)
            .unwrap_or(&PID_TABLE[0])
    }

    /// Short machine name (`rpm`, `coolant_temp`, ...)
    pub fn name(&self) -> &'static str {
        self.definition().name
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Pid {
    type Err = ObdError;

    /// Accepts a machine name (`rpm`) or a hex code (`0C`, `0x0c`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(def) = PID_TABLE
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(trimmed))
        {
            return Ok(def.pid);
        }

        let hex = trimmed.trim_start_matches("0x").trim_start_matches("0X");
        u8::from_str_radix(hex, 16)
            .ok()
            .and_then(Pid::from_hex)
            .ok_or_else(|| ObdError::InvalidResponse(format!("unknown PID '{}'", s)))
    }
}

/// Static description of a Mode 01 PID
#[derive(Debug)]
pub struct PidDefinition {
    /// Identifier
    pub pid: Pid,
    /// OBD service (always 0x01 for this table)
    pub mode: u8,
    /// Short machine name
    pub name: &'static str,
    /// Human readable label
    pub label: &'static str,
    /// Engineering unit
    pub unit: &'static str,
    /// Payload width in bytes
    pub bytes: usize,
    /// Conversion from payload bytes to engineering units
    pub convert: fn(&[u8]) -> f64,
}

impl PidDefinition {
    /// The request sent to the adapter, e.g. `010C`
    pub fn command(&self) -> String {
        format!("{:02X}{:02X}", self.mode, self.pid.as_hex())
    }

    /// Decode a payload, rejecting any width other than the declared one
    pub fn decode(&self, data: &[u8]) -> Result<f64, ObdError> {
        if data.len() != self.bytes {
            return Err(ObdError::ParseError {
                pid: self.pid.as_hex(),
                expected: self.bytes,
                actual: data.len(),
            });
        }
        Ok(round2((self.convert)(data)))
    }
}

/// Round to two decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn word(b: &[u8]) -> f64 {
    (b[0] as f64 * 256.0) + b[1] as f64
}

/// Mode 01 definitions
pub static PID_TABLE: [PidDefinition; 14] = [
    PidDefinition {
        pid: Pid::EngineLoad,
        mode: 0x01,
        name: "engine_load",
        label: "Calculated engine load",
        unit: "%",
        bytes: 1,
        convert: |b| b[0] as f64 * 100.0 / 255.0,
    },
    PidDefinition {
        pid: Pid::CoolantTemp,
        mode: 0x01,
        name: "coolant_temp",
        label: "Engine coolant temperature",
        unit: "°C",
        bytes: 1,
        convert: |b| b[0] as f64 - 40.0,
    },
    PidDefinition {
        pid: Pid::ShortFuelTrim,
        mode: 0x01,
        name: "short_fuel_trim",
        label: "Short term fuel trim (bank 1)",
        unit: "%",
        bytes: 1,
        convert: |b| (b[0] as f64 - 128.0) * 100.0 / 128.0,
    },
    PidDefinition {
        pid: Pid::LongFuelTrim,
        mode: 0x01,
        name: "long_fuel_trim",
        label: "Long term fuel trim (bank 1)",
        unit: "%",
        bytes: 1,
        convert: |b| (b[0] as f64 - 128.0) * 100.0 / 128.0,
    },
    PidDefinition {
        pid: Pid::IntakeManifoldPressure,
        mode: 0x01,
        name: "intake_pressure",
        label: "Intake manifold absolute pressure",
        unit: "kPa",
        bytes: 1,
        convert: |b| b[0] as f64,
    },
    PidDefinition {
        pid: Pid::Rpm,
        mode: 0x01,
        name: "rpm",
        label: "Engine speed",
        unit: "rpm",
        bytes: 2,
        convert: |b| word(b) / 4.0,
    },
    PidDefinition {
        pid: Pid::Speed,
        mode: 0x01,
        name: "speed",
        label: "Vehicle speed",
        unit: "km/h",
        bytes: 1,
        convert: |b| b[0] as f64,
    },
    PidDefinition {
        pid: Pid::TimingAdvance,
        mode: 0x01,
        name: "timing_advance",
        label: "Timing advance",
        unit: "°",
        bytes: 1,
        convert: |b| b[0] as f64 / 2.0 - 64.0,
    },
    PidDefinition {
        pid: Pid::IntakeAirTemp,
        mode: 0x01,
        name: "intake_air_temp",
        label: "Intake air temperature",
        unit: "°C",
        bytes: 1,
        convert: |b| b[0] as f64 - 40.0,
    },
    PidDefinition {
        pid: Pid::Maf,
        mode: 0x01,
        name: "maf",
        label: "Mass air flow rate",
        unit: "g/s",
        bytes: 2,
        convert: |b| word(b) / 100.0,
    },
    PidDefinition {
        pid: Pid::ThrottlePosition,
        mode: 0x01,
        name: "throttle_position",
        label: "Throttle position",
        unit: "%",
        bytes: 1,
        convert: |b| b[0] as f64 * 100.0 / 255.0,
    },
    PidDefinition {
        pid: Pid::O2Voltage,
        mode: 0x01,
        name: "o2_voltage",
        label: "Oxygen sensor voltage (bank 1, sensor 1)",
        unit: "V",
        bytes: 2,
        convert: |b| b[0] as f64 / 200.0,
    },
    PidDefinition {
        pid: Pid::FuelLevel,
        mode: 0x01,
        name: "fuel_level",
        label: "Fuel tank level input",
        unit: "%",
        bytes: 1,
        convert: |b| b[0] as f64 * 100.0 / 255.0,
    },
    PidDefinition {
        pid: Pid::ControlModuleVoltage,
        mode: 0x01,
        name: "module_voltage",
        label: "Control module voltage",
        unit: "V",
        bytes: 2,
        convert: |b| word(b) / 1000.0,
    },
];

/// One decoded sample of a live parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveReading {
    /// The PID that was queried
    pub pid: Pid,
    /// Decoded value in engineering units
    pub value: f64,
    /// Unit of `value`
    pub unit: String,
    /// Time the response was received
    pub captured_at: DateTime<Utc>,
}

impl LiveReading {
    /// Decode a payload into a reading stamped with the current time
    pub fn decode(pid: Pid, data: &[u8]) -> Result<Self, ObdError> {
        let def = pid.definition();
        Ok(Self {
            pid,
            value: def.decode(data)?,
            unit: def.unit.to_string(),
            captured_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_table_matches_enum() {
        for pid in Pid::ALL {
            assert_eq!(pid.definition().pid, pid);
        }
    }

    #[test]
    fn test_rpm_decode() {
        // 1A 2B => ((0x1A * 256) + 0x2B) / 4 = 6699/4 = 1674.75
        let reading = LiveReading::decode(Pid::Rpm, &[0x1A, 0x2B]).unwrap();
        assert!((reading.value - 1674.75).abs() < 0.001);
        assert_eq!(reading.unit, "rpm");
    }

    #[test]
    fn test_coolant_temp_decode() {
        // 0x73 = 115, so temp = 115 - 40 = 75°C
        let value = Pid::CoolantTemp.definition().decode(&[0x73]).unwrap();
        assert_eq!(value, 75.0);
    }

    #[test]
    fn test_engine_load_rounded() {
        // 0x80 * 100 / 255 = 50.196...
        let value = Pid::EngineLoad.definition().decode(&[0x80]).unwrap();
        assert_eq!(value, 50.2);
    }

    #[test]
    fn test_fuel_trim_decode() {
        let def = Pid::ShortFuelTrim.definition();
        assert_eq!(def.decode(&[0x80]).unwrap(), 0.0);
        assert_eq!(def.decode(&[0x90]).unwrap(), 12.5);
    }

    #[test]
    fn test_width_mismatch_is_parse_error() {
        let err = Pid::Rpm.definition().decode(&[0x1A]).unwrap_err();
        assert_eq!(
            err,
            ObdError::ParseError {
                pid: 0x0C,
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_command_and_lookup() {
        assert_eq!(Pid::Rpm.definition().command(), "010C");
        assert_eq!("rpm".parse::<Pid>().unwrap(), Pid::Rpm);
        assert_eq!("0x0d".parse::<Pid>().unwrap(), Pid::Speed);
        assert_eq!("2F".parse::<Pid>().unwrap(), Pid::FuelLevel);
        assert!("boost".parse::<Pid>().is_err());
    }

    proptest! {
        #[test]
        fn prop_decode_only_accepts_declared_width(
            idx in 0usize..14,
            data in proptest::collection::vec(any::<u8>(), 0..6),
        ) {
            let def = &PID_TABLE[idx];
            let result = def.decode(&data);
            prop_assert_eq!(result.is_ok(), data.len() == def.bytes);
        }
    }
}
