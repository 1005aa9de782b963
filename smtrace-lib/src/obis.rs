//! OBIS object names and DLMS unit codes.
//!
//! References:
//! * IEC 62056-61, Object identification system (OBIS)
//! * IEC 62056-62, Interface classes, unit enumeration
use std::collections::HashMap;

use crate::sml::ObisCode;

/// Human readable names for OBIS codes and DLMS units.
pub trait ObisLookup: Send + Sync {
    /// Description of `code`. Unknown codes are rendered as `A-B:C.D.E*F`.
    fn describe(&self, code: &ObisCode) -> String;

    /// Symbol of a DLMS unit code, `None` if the code is unknown.
    fn unit_name(&self, unit: u8) -> Option<String>;
}

const DESCRIPTIONS: &[([u8; 6], &str)] = &[
    ([1, 0, 0, 0, 9, 255], "Device identification"),
    ([1, 0, 0, 2, 0, 0], "Firmware version"),
    ([1, 0, 1, 8, 0, 255], "Positive active energy, total"),
    ([1, 0, 1, 8, 1, 255], "Positive active energy, tariff 1"),
    ([1, 0, 1, 8, 2, 255], "Positive active energy, tariff 2"),
    ([1, 0, 2, 8, 0, 255], "Negative active energy, total"),
    ([1, 0, 2, 8, 1, 255], "Negative active energy, tariff 1"),
    ([1, 0, 2, 8, 2, 255], "Negative active energy, tariff 2"),
    ([1, 0, 14, 7, 0, 255], "Supply frequency"),
    ([1, 0, 16, 7, 0, 255], "Active power, sum"),
    ([1, 0, 31, 7, 0, 255], "Current L1"),
    ([1, 0, 32, 7, 0, 255], "Voltage L1"),
    ([1, 0, 36, 7, 0, 255], "Active power L1"),
    ([1, 0, 51, 7, 0, 255], "Current L2"),
    ([1, 0, 52, 7, 0, 255], "Voltage L2"),
    ([1, 0, 56, 7, 0, 255], "Active power L2"),
    ([1, 0, 71, 7, 0, 255], "Current L3"),
    ([1, 0, 72, 7, 0, 255], "Voltage L3"),
    ([1, 0, 76, 7, 0, 255], "Active power L3"),
    ([1, 0, 81, 7, 1, 255], "Phase angle U-L2 to U-L1"),
    ([1, 0, 81, 7, 2, 255], "Phase angle U-L3 to U-L1"),
    ([1, 0, 81, 7, 4, 255], "Phase angle I-L1 to U-L1"),
    ([1, 0, 81, 7, 15, 255], "Phase angle I-L2 to U-L2"),
    ([1, 0, 81, 7, 26, 255], "Phase angle I-L3 to U-L3"),
    ([1, 0, 96, 1, 0, 255], "Meter serial number"),
    ([1, 0, 96, 5, 0, 255], "Operating status"),
    ([1, 0, 96, 50, 1, 1], "Manufacturer"),
    ([1, 0, 96, 90, 2, 1], "Firmware checksum"),
    ([129, 129, 199, 130, 3, 255], "Manufacturer"),
    ([129, 129, 199, 130, 5, 255], "Public key"),
];

const UNITS: &[(u8, &str)] = &[
    (1, "a"),
    (2, "mo"),
    (3, "wk"),
    (4, "d"),
    (5, "h"),
    (6, "min"),
    (7, "s"),
    (8, "°"),
    (9, "°C"),
    (10, "currency"),
    (11, "m"),
    (12, "m/s"),
    (13, "m³"),
    (14, "m³"),
    (15, "m³/h"),
    (16, "m³/h"),
    (17, "m³/d"),
    (18, "m³/d"),
    (19, "l"),
    (20, "kg"),
    (21, "N"),
    (22, "Nm"),
    (23, "Pa"),
    (24, "bar"),
    (25, "J"),
    (26, "J/h"),
    (27, "W"),
    (28, "VA"),
    (29, "var"),
    (30, "Wh"),
    (31, "VAh"),
    (32, "varh"),
    (33, "A"),
    (34, "C"),
    (35, "V"),
    (36, "V/m"),
    (37, "F"),
    (38, "Ω"),
    (39, "Ωm²/m"),
    (40, "Wb"),
    (41, "T"),
    (42, "A/m"),
    (43, "H"),
    (44, "Hz"),
    (45, "1/(Wh)"),
    (46, "1/(varh)"),
    (47, "1/(VAh)"),
    (48, "V²h"),
    (49, "A²h"),
    (50, "kg/s"),
    (51, "S"),
    (52, "K"),
    (53, "1/(V²h)"),
    (54, "1/(A²h)"),
    (55, "1/m³"),
    (56, "%"),
    (57, "Ah"),
    (60, "Wh/m³"),
    (61, "J/m³"),
    (62, "Mol %"),
    (63, "g/m³"),
    (64, "Pa s"),
    (254, "other"),
    (255, "count"),
];

/// Built-in [ObisLookup] covering common electricity meter registers.
///
/// Codes not found verbatim are retried with the billing period group (`F`) set to
/// 255, the value meters commonly use for "current".
#[derive(Debug, Clone)]
pub struct ObisRegistry {
    descriptions: HashMap<ObisCode, String>,
    units: HashMap<u8, String>,
}

impl Default for ObisRegistry {
    fn default() -> Self {
        ObisRegistry {
            descriptions: DESCRIPTIONS
                .iter()
                .map(|(code, descr)| (ObisCode(*code), (*descr).to_string()))
                .collect(),
            units: UNITS
                .iter()
                .map(|(code, name)| (*code, (*name).to_string()))
                .collect(),
        }
    }
}

impl ObisRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the description of `code`.
    #[must_use]
    pub fn with_description(mut self, code: ObisCode, description: &str) -> Self {
        self.descriptions.insert(code, description.to_string());
        self
    }
}

impl ObisLookup for ObisRegistry {
    fn describe(&self, code: &ObisCode) -> String {
        if let Some(descr) = self.descriptions.get(code) {
            return descr.clone();
        }
        let mut current = *code;
        current.0[5] = 255;
        match self.descriptions.get(&current) {
            Some(descr) => descr.clone(),
            None => code.to_string(),
        }
    }

    fn unit_name(&self, unit: u8) -> Option<String> {
        self.units.get(&unit).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ObisCode::new(1, 0, 1, 8, 0, 255), "Positive active energy, total"; "exact")]
    #[test_case(ObisCode::new(1, 0, 16, 7, 0, 0), "Active power, sum"; "billing period fallback")]
    #[test_case(ObisCode::new(7, 0, 3, 0, 0, 255), "7-0:3.0.0*255"; "unknown")]
    fn describe(code: ObisCode, expected: &str) {
        assert_eq!(ObisRegistry::new().describe(&code), expected);
    }

    #[test]
    fn units() {
        let registry = ObisRegistry::new();
        assert_eq!(registry.unit_name(30).as_deref(), Some("Wh"));
        assert_eq!(registry.unit_name(27).as_deref(), Some("W"));
        assert_eq!(registry.unit_name(200), None);
    }

    #[test]
    fn custom_description() {
        let code = ObisCode::new(1, 0, 0, 0, 0, 255);
        let registry = ObisRegistry::new().with_description(code, "Property number");
        assert_eq!(registry.describe(&code), "Property number");
    }
}
