// crates/canopen-rs-eds/src/parser.rs

//! The internal INI parser and the CiA 306 lexical-form helpers.

use crate::error::EdsError;
use canopen_rs::od::{DataType, ObjectValue, TimeDifference, TimeOfDay};
use canopen_rs::types::NodeId;
use ini::Ini;
use std::collections::BTreeMap;

/// The raw properties of one `[hhhh]` or `[hhhhsubSS]` section.
#[derive(Debug, Clone, Default)]
pub(crate) struct RawObject {
    pub section: String,
    pub parameter_name: Option<String>,
    pub object_type: Option<u8>,
    pub data_type: Option<u16>,
    pub access_type: Option<String>,
    pub default_value: Option<String>,
    pub parameter_value: Option<String>,
    pub pdo_mapping: bool,
    pub low_limit: Option<String>,
    pub high_limit: Option<String>,
    pub compact_sub_obj: Option<u8>,
}

/// Every object of the file: index -> (main section, sub-index sections).
pub(crate) type RawObjects = BTreeMap<u16, (RawObject, BTreeMap<u8, RawObject>)>;

/// Parses the INI text into raw object sections. Non-object sections
/// ([FileInfo], [DeviceInfo], ...) are skipped.
pub(crate) fn parse_sections(source: &str) -> Result<RawObjects, EdsError> {
    let ini =
        Ini::load_from_str(source).map_err(|error| EdsError::Syntax(error.to_string()))?;
    let mut objects: RawObjects = BTreeMap::new();

    for (name, properties) in ini.iter() {
        let Some(name) = name else {
            continue;
        };
        let Some((index, sub_index)) = parse_section_name(name) else {
            continue;
        };
        let mut raw = RawObject {
            section: name.to_owned(),
            ..RawObject::default()
        };
        for (key, value) in properties.iter() {
            match key {
                "ParameterName" => raw.parameter_name = Some(value.to_owned()),
                "ObjectType" => {
                    raw.object_type = Some(parse_u32(value).ok_or_else(|| bad(name, "ObjectType", value))? as u8)
                }
                "DataType" => {
                    raw.data_type = Some(parse_u32(value).ok_or_else(|| bad(name, "DataType", value))? as u16)
                }
                "AccessType" => raw.access_type = Some(value.to_ascii_lowercase()),
                "DefaultValue" => raw.default_value = Some(value.to_owned()),
                "ParameterValue" => raw.parameter_value = Some(value.to_owned()),
                "PDOMapping" => raw.pdo_mapping = parse_u32(value).unwrap_or(0) != 0,
                "LowLimit" => raw.low_limit = Some(value.to_owned()),
                "HighLimit" => raw.high_limit = Some(value.to_owned()),
                "CompactSubObj" => {
                    raw.compact_sub_obj =
                        Some(parse_u32(value).ok_or_else(|| bad(name, "CompactSubObj", value))? as u8)
                }
                _ => {}
            }
        }

        let entry = objects.entry(index).or_default();
        match sub_index {
            None => entry.0 = raw,
            Some(sub) => {
                entry.1.insert(sub, raw);
            }
        }
    }
    Ok(objects)
}

fn bad(section: &str, key: &'static str, value: &str) -> EdsError {
    EdsError::BadValue {
        section: section.to_owned(),
        key,
        value: value.to_owned(),
    }
}

/// Parses `hhhh` or `hhhhsubSS` section names. Returns `None` for the
/// administrative sections.
fn parse_section_name(name: &str) -> Option<(u16, Option<u8>)> {
    let lower = name.to_ascii_lowercase();
    if let Some(position) = lower.find("sub") {
        let index = u16::from_str_radix(&lower[..position], 16).ok()?;
        let sub = u8::from_str_radix(&lower[position + 3..], 16).ok()?;
        return Some((index, Some(sub)));
    }
    if lower.len() == 4 {
        return u16::from_str_radix(&lower, 16).ok().map(|index| (index, None));
    }
    None
}

/// Parses an unsigned integer literal: `0x...` hexadecimal, `0...` octal or
/// plain decimal.
pub(crate) fn parse_u32(value: &str) -> Option<u32> {
    let trimmed = value.trim();
    if let Some(hexadecimal) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        return u32::from_str_radix(hexadecimal, 16).ok();
    }
    trimmed.parse().ok()
}

fn parse_u64(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    if let Some(hexadecimal) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        return u64::from_str_radix(hexadecimal, 16).ok();
    }
    trimmed.parse().ok()
}

fn parse_i64(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if let Some(rest) = trimmed.strip_prefix('-') {
        return parse_u64(rest).map(|magnitude| -(magnitude as i64));
    }
    parse_u64(trimmed).map(|magnitude| magnitude as i64)
}

/// Evaluates a numeric literal with the `$NODEID+` form of CiA 306.
fn evaluate_numeric(value: &str, node_id: NodeId) -> Option<u64> {
    let trimmed = value.trim();
    if let Some(rest) = trimmed.strip_prefix("$NODEID") {
        let rest = rest.trim_start();
        let rest = rest.strip_prefix('+')?;
        return parse_u64(rest.trim()).map(|base| base + node_id.0 as u64);
    }
    parse_u64(trimmed)
}

/// Parses a value literal into an `ObjectValue` of the given type,
/// substituting `$NODEID` where the lexical form allows it.
pub(crate) fn parse_value(
    section: &str,
    ty: DataType,
    literal: &str,
    node_id: NodeId,
) -> Result<ObjectValue, EdsError> {
    let bad_value = || EdsError::BadValue {
        section: section.to_owned(),
        key: "value",
        value: literal.to_owned(),
    };

    Ok(match ty {
        DataType::Boolean => ObjectValue::Boolean(parse_u32(literal).ok_or_else(bad_value)? != 0),
        DataType::Integer8 => ObjectValue::Integer8(parse_i64(literal).ok_or_else(bad_value)? as i8),
        DataType::Integer16 => {
            ObjectValue::Integer16(parse_i64(literal).ok_or_else(bad_value)? as i16)
        }
        DataType::Integer24 => {
            ObjectValue::Integer24(parse_i64(literal).ok_or_else(bad_value)? as i32)
        }
        DataType::Integer32 => {
            ObjectValue::Integer32(parse_i64(literal).ok_or_else(bad_value)? as i32)
        }
        DataType::Integer40 => {
            ObjectValue::Integer40(parse_i64(literal).ok_or_else(bad_value)?)
        }
        DataType::Integer48 => {
            ObjectValue::Integer48(parse_i64(literal).ok_or_else(bad_value)?)
        }
        DataType::Integer56 => {
            ObjectValue::Integer56(parse_i64(literal).ok_or_else(bad_value)?)
        }
        DataType::Integer64 => {
            ObjectValue::Integer64(parse_i64(literal).ok_or_else(bad_value)?)
        }
        DataType::Unsigned8 => {
            ObjectValue::Unsigned8(evaluate_numeric(literal, node_id).ok_or_else(bad_value)? as u8)
        }
        DataType::Unsigned16 => ObjectValue::Unsigned16(
            evaluate_numeric(literal, node_id).ok_or_else(bad_value)? as u16,
        ),
        DataType::Unsigned24 => ObjectValue::Unsigned24(
            evaluate_numeric(literal, node_id).ok_or_else(bad_value)? as u32,
        ),
        DataType::Unsigned32 => ObjectValue::Unsigned32(
            evaluate_numeric(literal, node_id).ok_or_else(bad_value)? as u32,
        ),
        DataType::Unsigned40 => {
            ObjectValue::Unsigned40(evaluate_numeric(literal, node_id).ok_or_else(bad_value)?)
        }
        DataType::Unsigned48 => {
            ObjectValue::Unsigned48(evaluate_numeric(literal, node_id).ok_or_else(bad_value)?)
        }
        DataType::Unsigned56 => {
            ObjectValue::Unsigned56(evaluate_numeric(literal, node_id).ok_or_else(bad_value)?)
        }
        DataType::Unsigned64 => {
            ObjectValue::Unsigned64(evaluate_numeric(literal, node_id).ok_or_else(bad_value)?)
        }
        DataType::Real32 => {
            ObjectValue::Real32(literal.trim().parse().map_err(|_| bad_value())?)
        }
        DataType::Real64 => {
            ObjectValue::Real64(literal.trim().parse().map_err(|_| bad_value())?)
        }
        DataType::VisibleString => ObjectValue::VisibleString(literal.to_owned()),
        DataType::UnicodeString => {
            ObjectValue::UnicodeString(literal.encode_utf16().collect())
        }
        DataType::OctetString => {
            ObjectValue::OctetString(parse_hex_string(literal).ok_or_else(bad_value)?)
        }
        DataType::Domain => {
            ObjectValue::Domain(parse_hex_string(literal).ok_or_else(bad_value)?)
        }
        DataType::TimeOfDay => {
            let raw = parse_u64(literal).ok_or_else(bad_value)?;
            ObjectValue::TimeOfDay(TimeOfDay {
                millis: (raw & 0x0FFF_FFFF) as u32,
                days: (raw >> 32) as u16,
            })
        }
        DataType::TimeDifference => {
            let raw = parse_u64(literal).ok_or_else(bad_value)?;
            ObjectValue::TimeDifference(TimeDifference {
                millis: (raw & 0x0FFF_FFFF) as u32,
                days: (raw >> 32) as u16,
            })
        }
    })
}

/// Parses a `0x...` (or bare) hex string into bytes, padding odd lengths
/// with a leading zero.
pub(crate) fn parse_hex_string(value: &str) -> Option<Vec<u8>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    let without_prefix = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if without_prefix.len() % 2 != 0 {
        let mut padded = String::with_capacity(without_prefix.len() + 1);
        padded.push('0');
        padded.push_str(without_prefix);
        hex::decode(padded).ok()
    } else {
        hex::decode(without_prefix).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_names() {
        assert_eq!(parse_section_name("1017"), Some((0x1017, None)));
        assert_eq!(parse_section_name("1018sub2"), Some((0x1018, Some(2))));
        assert_eq!(parse_section_name("1A00sub0"), Some((0x1A00, Some(0))));
        assert_eq!(parse_section_name("FileInfo"), None);
        assert_eq!(parse_section_name("DeviceInfo"), None);
    }

    #[test]
    fn test_node_id_substitution() {
        let value = parse_value(
            "1200sub1",
            DataType::Unsigned32,
            "$NODEID+0x600",
            NodeId(5),
        )
        .unwrap();
        assert_eq!(value, ObjectValue::Unsigned32(0x605));
    }

    #[test]
    fn test_numeric_forms() {
        assert_eq!(parse_u32("0x1F80"), Some(0x1F80));
        assert_eq!(parse_u32(" 1000 "), Some(1000));
        assert_eq!(parse_u32("banana"), None);
    }

    #[test]
    fn test_hex_string_padding() {
        assert_eq!(parse_hex_string("0x0102"), Some(vec![1, 2]));
        assert_eq!(parse_hex_string("102"), Some(vec![1, 2]));
        assert_eq!(parse_hex_string(""), Some(Vec::new()));
    }
}
