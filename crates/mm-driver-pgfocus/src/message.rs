//! Lines streamed by the pgFocus board.
//!
//! Every message is one CR-terminated line led by a tag word:
//!
//! ```text
//! STATS: 1042 15 120 900 2048 10.5 0.48 10000 512 3
//! VERSION: 0.7
//! SLOPE: 0.48
//! INFO: Calibration Activated
//! ```

use mm_core::error::ParseError;
use mm_core::parse::{fields_after, parse_after, Value};

/// Number of samples in a `LIGHT:` profile.
pub const LIGHT_PROFILE_LEN: usize = 128;

/// One `STATS:` line.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub start_time: i64,
    pub loop_time: i64,
    pub light_min: i64,
    pub light_max: i64,
    /// Output voltage in DAC units.
    pub dac: f64,
    /// Distance from the lock point, in pixels.
    pub offset: f64,
    pub slope: f64,
    pub exposure: i64,
    /// Input voltage in ADC units.
    pub adc: f64,
    pub diff_adc: f64,
}

impl Stats {
    fn from_fields(fields: &[Value]) -> Result<Self, ParseError> {
        let field = |i: usize| {
            fields.get(i).ok_or_else(|| ParseError::Empty {
                token: format!("STATS field {}", i + 1),
            })
        };
        Ok(Self {
            start_time: field(0)?.to_i64()?,
            loop_time: field(1)?.to_i64()?,
            light_min: field(2)?.to_i64()?,
            light_max: field(3)?.to_i64()?,
            dac: field(4)?.to_f64()?,
            offset: field(5)?.to_f64()?,
            slope: field(6)?.to_f64()?,
            exposure: field(7)?.to_i64()?,
            adc: field(8)?.to_f64()?,
            diff_adc: field(9)?.to_f64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FocusMessage {
    Stats(Stats),
    LightProfile { time: String, profile: Vec<i64> },
    Version(String),
    /// One calibration point: output in DAC units and the pixel it moved to.
    CalibrationPoint { dau: f64, pixel: f64 },
    CalibrationActivated,
    ReturningToDefault,
    Intercept(f64),
    Slope(f64),
    Gain(f64),
    MicronsPerVolt(f64),
    Residuals(f64),
    Info(String),
    Error(String),
    /// A line with a tag this driver does not know.
    Unrecognized(String),
}

impl FocusMessage {
    /// Parse one line (terminator already removed).
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let tag = line.split_whitespace().next().unwrap_or_default();
        let rest = || line[tag.len()..].trim().to_string();

        let message = match tag {
            "STATS:" => FocusMessage::Stats(Stats::from_fields(&fields_after(line, tag)?)?),
            "LIGHT:" => {
                let fields = fields_after(line, tag)?;
                let (time, values) = fields.split_first().ok_or_else(|| ParseError::Empty {
                    token: tag.to_string(),
                })?;
                let profile = values
                    .iter()
                    .take(LIGHT_PROFILE_LEN)
                    .map(Value::to_i64)
                    .collect::<Result<Vec<_>, _>>()?;
                FocusMessage::LightProfile {
                    time: time.to_string(),
                    profile,
                }
            }
            "VERSION:" => FocusMessage::Version(rest()),
            "CAL:" => {
                let fields = fields_after(line, tag)?;
                let point = |i: usize| {
                    fields
                        .get(i)
                        .ok_or_else(|| ParseError::Empty {
                            token: tag.to_string(),
                        })
                        .and_then(Value::to_f64)
                };
                FocusMessage::CalibrationPoint {
                    dau: point(0)?,
                    pixel: point(1)?,
                }
            }
            "INTERCEPT:" => FocusMessage::Intercept(parse_after(line, tag)?.to_f64()?),
            "SLOPE:" => FocusMessage::Slope(parse_after(line, tag)?.to_f64()?),
            "GAIN:" => FocusMessage::Gain(parse_after(line, tag)?.to_f64()?),
            "MPV:" => FocusMessage::MicronsPerVolt(parse_after(line, tag)?.to_f64()?),
            "RESIDUALS:" => FocusMessage::Residuals(parse_after(line, tag)?.to_f64()?),
            "INFO:" => match rest().as_str() {
                "Calibration Activated" => FocusMessage::CalibrationActivated,
                "Returning objective to default position" => FocusMessage::ReturningToDefault,
                _ => FocusMessage::Info(rest()),
            },
            "ERROR:" => FocusMessage::Error(rest()),
            _ => FocusMessage::Unrecognized(line.to_string()),
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stats_line() {
        let msg = FocusMessage::parse("STATS: 1042 15 120 900 2048 -10.5 0.48 10000 512 3\r").unwrap();
        let FocusMessage::Stats(stats) = msg else {
            panic!("expected stats");
        };
        assert_eq!(stats.start_time, 1042);
        assert_eq!(stats.dac, 2048.0);
        assert_eq!(stats.offset, -10.5);
        assert_eq!(stats.exposure, 10000);
        assert_eq!(stats.diff_adc, 3.0);
    }

    #[test]
    fn short_stats_line_is_a_parse_error() {
        assert!(FocusMessage::parse("STATS: 1042 15 120").is_err());
        assert!(FocusMessage::parse("STATS: 1 2 3 4 5 six 7 8 9 10").is_err());
    }

    #[test]
    fn parses_scalar_replies() {
        assert_eq!(FocusMessage::parse("SLOPE: 0.5").unwrap(), FocusMessage::Slope(0.5));
        assert_eq!(FocusMessage::parse("MPV: 10").unwrap(), FocusMessage::MicronsPerVolt(10.0));
        assert_eq!(
            FocusMessage::parse("VERSION: 1.20").unwrap(),
            FocusMessage::Version("1.20".into())
        );
        assert_eq!(
            FocusMessage::parse("CAL: 2048 61.5").unwrap(),
            FocusMessage::CalibrationPoint {
                dau: 2048.0,
                pixel: 61.5
            }
        );
    }

    #[test]
    fn info_lines_with_mode_changes() {
        assert_eq!(
            FocusMessage::parse("INFO: Calibration Activated").unwrap(),
            FocusMessage::CalibrationActivated
        );
        assert_eq!(
            FocusMessage::parse("INFO: Returning objective to default position").unwrap(),
            FocusMessage::ReturningToDefault
        );
        assert_eq!(
            FocusMessage::parse("INFO: laser on").unwrap(),
            FocusMessage::Info("laser on".into())
        );
        assert_eq!(
            FocusMessage::parse("ERROR: not calibrated").unwrap(),
            FocusMessage::Error("not calibrated".into())
        );
    }

    #[test]
    fn light_profile_is_capped() {
        let values: Vec<String> = (0..130).map(|v| v.to_string()).collect();
        let line = format!("LIGHT: 77 {}", values.join(" "));
        let FocusMessage::LightProfile { time, profile } = FocusMessage::parse(&line).unwrap() else {
            panic!("expected light profile");
        };
        assert_eq!(time, "77");
        assert_eq!(profile.len(), LIGHT_PROFILE_LEN);
        assert_eq!(profile[127], 127);
    }

    #[test]
    fn unknown_tag_is_kept() {
        assert_eq!(
            FocusMessage::parse("HELLO world").unwrap(),
            FocusMessage::Unrecognized("HELLO world".into())
        );
    }
}
