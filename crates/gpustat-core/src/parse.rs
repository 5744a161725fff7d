//! Parsers for the query tool's comma-delimited output.
//!
//! Output has no header line. Each line is one device; fields are separated
//! by commas and appear in the order the parameters were requested.

use crate::error::ParseError;
use crate::metric::{MetricValue, ValueType};

/// Splits one output line into trimmed fields.
pub fn split_row(line: &str) -> Vec<&str> {
    line.split(',').map(str::trim).collect()
}

/// Non-empty output lines.
pub fn rows(output: &str) -> impl Iterator<Item = &str> {
    output.lines().map(str::trim).filter(|line| !line.is_empty())
}

/// Converts a raw field to its declared type.
///
/// Integer fields are parsed as floating point and truncated, since the tool
/// may print a decimal point for integral values. Numbers must be finite.
/// Text is kept verbatim.
pub fn parse_value(raw: &str, value_type: ValueType) -> Result<MetricValue, ParseError> {
    let raw = raw.trim();
    let invalid = || ParseError::Value {
        raw: raw.to_string(),
        expected: value_type.name(),
    };

    match value_type {
        ValueType::Int => {
            let value: f64 = raw.parse().map_err(|_| invalid())?;
            if !value.is_finite() {
                return Err(invalid());
            }
            Ok(MetricValue::Int(value.trunc() as i64))
        }
        ValueType::Float => {
            let value: f64 = raw.parse().map_err(|_| invalid())?;
            if !value.is_finite() {
                return Err(invalid());
            }
            Ok(MetricValue::Float(value))
        }
        ValueType::Text => Ok(MetricValue::Text(raw.to_string())),
    }
}

/// Parses the device index column.
pub fn parse_device_index(raw: &str) -> Result<u32, ParseError> {
    raw.trim()
        .parse()
        .map_err(|_| ParseError::DeviceIndex(raw.trim().to_string()))
}

/// Parses a device listing (one index per line) into a sorted, duplicate-free list.
pub fn parse_device_list(output: &str) -> Result<Vec<u32>, ParseError> {
    let mut devices = rows(output)
        .map(parse_device_index)
        .collect::<Result<Vec<_>, _>>()?;
    devices.sort_unstable();
    devices.dedup();
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int_with_decimal_point() {
        assert_eq!(parse_value("2048.0", ValueType::Int), Ok(MetricValue::Int(2048)));
        assert_eq!(parse_value(" 41 ", ValueType::Int), Ok(MetricValue::Int(41)));
        assert_eq!(parse_value("99.9", ValueType::Int), Ok(MetricValue::Int(99)));
    }

    #[test]
    fn test_parse_float_and_text() {
        assert_eq!(
            parse_value("72.51", ValueType::Float),
            Ok(MetricValue::Float(72.51))
        );
        assert_eq!(
            parse_value("  NVIDIA A100-SXM4-80GB ", ValueType::Text),
            Ok(MetricValue::Text("NVIDIA A100-SXM4-80GB".to_string()))
        );
    }

    #[test]
    fn test_parse_unavailable_value() {
        let err = parse_value("[N/A]", ValueType::Int).unwrap_err();
        assert_eq!(
            err,
            ParseError::Value {
                raw: "[N/A]".to_string(),
                expected: "int",
            }
        );
        assert!(parse_value("inf", ValueType::Int).is_err());
        assert!(parse_value("", ValueType::Float).is_err());
    }

    #[test]
    fn test_parse_rejects_non_finite_floats() {
        for raw in ["nan", "NaN", "inf", "-inf"] {
            assert_eq!(
                parse_value(raw, ValueType::Float),
                Err(ParseError::Value {
                    raw: raw.to_string(),
                    expected: "float",
                })
            );
        }
    }

    #[test]
    fn test_split_row() {
        assert_eq!(
            split_row("NVIDIA T4, 15360, 0"),
            vec!["NVIDIA T4", "15360", "0"]
        );
    }

    #[test]
    fn test_parse_device_list_sorts_and_dedups() {
        assert_eq!(parse_device_list("2\n0\n1\n0\n\n"), Ok(vec![0, 1, 2]));
        assert_eq!(parse_device_list(""), Ok(vec![]));
    }

    #[test]
    fn test_parse_device_list_rejects_garbage() {
        let err = parse_device_list("0\nNo devices were found\n").unwrap_err();
        assert_eq!(err, ParseError::DeviceIndex("No devices were found".to_string()));
        assert!(parse_device_list("-1\n").is_err());
    }
}
