//! ITU emissions designator decoding.
//!
//! A designator such as `11K2F3E` packs the necessary bandwidth into its
//! first four characters (the multiplier letter marks the decimal point)
//! followed by the modulation type, the nature of the modulating signal and
//! the type of information transmitted.

use crate::error::{RelayError, Result};

/// Modulation type codes and their descriptions.
const MODULATION_TYPES: &[(char, &str)] = &[
    ('N', "None"),
    ('A', "AM, double sideband, full carrier"),
    ('H', "AM, single sideband, full carrier"),
    ('R', "AM, single sideband, reduced or controlled carrier"),
    ('J', "AM, single sideband, suppressed carrier"),
    ('B', "AM, independent sidebands"),
    ('C', "AM, vestigial sideband"),
    ('F', "Angle-modulated, straight FM"),
    ('G', "Angle-modulated, phase modulation"),
    ('D', "Carrier is amplitude and angle modulated"),
    ('P', "Pulse, no modulation"),
    ('K', "Pulse, amplitude modulation"),
    ('L', "Pulse, width modulation"),
    ('M', "Pulse, phase or position modulation"),
    ('Q', "Pulse, carrier also angle-modulated during pulse"),
    ('W', "Pulse, two or more modes used"),
];

/// Decoded emissions designator.
#[derive(Debug, Clone, PartialEq)]
pub struct Designator {
    pub code: String,
    pub bandwidth_hz: u64,
    pub modulation_type: char,
    pub description: &'static str,
}

impl Designator {
    /// Decodes a designator code of 6 to 8 characters.
    pub fn decode(code: &str) -> Result<Self> {
        let invalid = |message: String| RelayError::Designator {
            code: code.to_string(),
            message,
        };

        let chars: Vec<char> = code.chars().collect();
        if !(6..=8).contains(&chars.len()) {
            return Err(invalid(format!("unexpected length {}", chars.len())));
        }

        let bandwidth_hz = bandwidth_from_prefix(&chars[..4]).ok_or_else(|| {
            invalid("could not determine bandwidth from first four characters".to_string())
        })?;

        let modulation_type = chars[4];
        let description = MODULATION_TYPES
            .iter()
            .find(|(c, _)| *c == modulation_type)
            .map(|(_, d)| *d)
            .ok_or_else(|| invalid(format!("unknown modulation type '{}'", modulation_type)))?;

        Ok(Self {
            code: code.to_string(),
            bandwidth_hz,
            modulation_type,
            description,
        })
    }

    pub fn is_fm(&self) -> bool {
        self.modulation_type == 'F'
    }

    /// Fixed gain applied to forwarded audio for this emission.
    ///
    /// Narrow FM channels are quieter after demodulation than wide ones, so
    /// they get more makeup gain. Everything else is left at unity.
    pub fn output_gain(&self) -> f32 {
        if !self.is_fm() {
            return 1.0;
        }
        match self.bandwidth_hz {
            16000 => 1.5,
            11000..12000 => 2.0,
            _ => 1.0,
        }
    }
}

/// Parses `11K2` style bandwidth. Exactly one multiplier letter must appear.
fn bandwidth_from_prefix(prefix: &[char]) -> Option<u64> {
    let (pos, multiplier) = prefix.iter().enumerate().find_map(|(i, c)| {
        let m = match c {
            'H' => 1.0,
            'K' => 1e3,
            'M' => 1e6,
            'G' => 1e9,
            _ => return None,
        };
        Some((i, m))
    })?;

    let digits: String = prefix
        .iter()
        .enumerate()
        .map(|(i, c)| if i == pos { '.' } else { *c })
        .collect();
    if !digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let value: f64 = digits.parse().ok()?;
    Some((value * multiplier).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_narrow_fm() {
        let d = Designator::decode("11K2F3E").unwrap();
        assert_eq!(d.bandwidth_hz, 11200);
        assert_eq!(d.modulation_type, 'F');
        assert!(d.is_fm());
        assert_eq!(d.description, "Angle-modulated, straight FM");
    }

    #[test]
    fn decodes_aeronautical_am() {
        let d = Designator::decode("6K00A3E").unwrap();
        assert_eq!(d.bandwidth_hz, 6000);
        assert_eq!(d.modulation_type, 'A');
        assert_eq!(d.output_gain(), 1.0);
    }

    #[test]
    fn decodes_hertz_and_megahertz_multipliers() {
        assert_eq!(Designator::decode("400HN0N").unwrap().bandwidth_hz, 400);
        assert_eq!(Designator::decode("1M25F9W").unwrap().bandwidth_hz, 1_250_000);
    }

    #[test]
    fn rejects_bad_length() {
        assert!(Designator::decode("11K2F").is_err());
        assert!(Designator::decode("11K2F3EXX").is_err());
    }

    #[test]
    fn rejects_missing_multiplier() {
        let err = Designator::decode("1120F3E").unwrap_err();
        assert!(err.to_string().contains("bandwidth"));
    }

    #[test]
    fn rejects_unknown_modulation() {
        let err = Designator::decode("11K2X3E").unwrap_err();
        assert!(err.to_string().contains("unknown modulation type 'X'"));
    }

    #[test]
    fn output_gain_follows_fm_bandwidth() {
        assert_eq!(Designator::decode("16K0F3E").unwrap().output_gain(), 1.5);
        assert_eq!(Designator::decode("11K2F3E").unwrap().output_gain(), 2.0);
        assert_eq!(Designator::decode("11K0F3E").unwrap().output_gain(), 2.0);
        assert_eq!(Designator::decode("12K5F2E").unwrap().output_gain(), 1.0);
        assert_eq!(Designator::decode("16K0G3E").unwrap().output_gain(), 1.0);
    }
}
