// crates/canopen-rs-eds/src/converter.rs

//! Converts parsed EDS/DCF sections into the core `ObjectDictionary` and
//! into concise-DCF byte streams.

use crate::error::EdsError;
use crate::parser::{parse_value, RawObject, RawObjects};
use canopen_rs::od::{
    AccessType, DataType, Object, ObjectDictionary, ObjectEntry, ObjectValue, PdoMapping,
};
use canopen_rs::types::NodeId;

const OBJECT_TYPE_VAR: u8 = 0x07;
const OBJECT_TYPE_ARRAY: u8 = 0x08;
const OBJECT_TYPE_RECORD: u8 = 0x09;

/// Which value column seeds the dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueMode {
    /// DCF: prefer `ParameterValue`, fall back to `DefaultValue`.
    Actual,
    /// EDS: use `DefaultValue` only.
    Default,
}

pub(crate) fn to_object_dictionary(
    objects: &RawObjects,
    node_id: NodeId,
    mode: ValueMode,
) -> Result<ObjectDictionary, EdsError> {
    let mut od = ObjectDictionary::new();
    for (&index, (main, subs)) in objects {
        let entry = build_entry(index, main, subs, node_id, mode)?;
        od.insert(index, entry);
    }
    Ok(od)
}

fn build_entry(
    index: u16,
    main: &RawObject,
    subs: &std::collections::BTreeMap<u8, RawObject>,
    node_id: NodeId,
    mode: ValueMode,
) -> Result<ObjectEntry, EdsError> {
    let object_type = main.object_type.unwrap_or(OBJECT_TYPE_VAR);
    let name = leak_name(main.parameter_name.as_deref(), index);

    let object = match object_type {
        OBJECT_TYPE_ARRAY | OBJECT_TYPE_RECORD => {
            let values = if let Some(count) = main.compact_sub_obj {
                // CompactSubObj: N identical sub-objects described by the
                // main section.
                let template = sub_value(main, node_id, mode)?;
                vec![template; count as usize]
            } else {
                let count = subs
                    .get(&0)
                    .and_then(|sub| value_literal(sub, mode))
                    .and_then(crate::parser::parse_u32)
                    .unwrap_or_else(|| {
                        subs.keys().copied().filter(|&sub| sub != 0).max().unwrap_or(0) as u32
                    }) as u8;
                let mut values = Vec::with_capacity(count as usize);
                for sub_index in 1..=count {
                    let sub = subs.get(&sub_index).ok_or(EdsError::MissingSubObject {
                        index,
                        sub_index,
                    })?;
                    values.push(sub_value(sub, node_id, mode)?);
                }
                values
            };
            if object_type == OBJECT_TYPE_ARRAY {
                Object::Array(values)
            } else {
                Object::Record(values)
            }
        }
        _ => Object::Variable(sub_value(main, node_id, mode)?),
    };

    // Access and mapping come from the main section for variables and
    // compact arrays, from the first data sub-object otherwise.
    let meta_source = if object_type == OBJECT_TYPE_VAR || main.compact_sub_obj.is_some() {
        main
    } else {
        subs.get(&1).unwrap_or(main)
    };
    let access = parse_access(meta_source)?;
    let pdo_mapping = mapping_of(meta_source.pdo_mapping, access);

    let mut entry = ObjectEntry {
        object,
        name,
        access,
        pdo_mapping,
        default: None,
    };
    entry = entry.with_default();
    Ok(entry)
}

fn value_literal(raw: &RawObject, mode: ValueMode) -> Option<&str> {
    match mode {
        ValueMode::Actual => raw
            .parameter_value
            .as_deref()
            .or(raw.default_value.as_deref()),
        ValueMode::Default => raw.default_value.as_deref(),
    }
}

/// Decodes one section's value, defaulting absent literals to zero, and
/// enforces the declared limits.
fn sub_value(raw: &RawObject, node_id: NodeId, mode: ValueMode) -> Result<ObjectValue, EdsError> {
    let code = raw.data_type.ok_or_else(|| EdsError::MissingKey {
        section: raw.section.clone(),
        key: "DataType",
    })?;
    let ty = DataType::from_code(code).ok_or_else(|| EdsError::UnknownDataType {
        section: raw.section.clone(),
        code,
    })?;
    let value = match value_literal(raw, mode) {
        Some(literal) if !literal.trim().is_empty() => {
            parse_value(&raw.section, ty, literal, node_id)?
        }
        _ => zero_of(ty),
    };

    if let Some(key) = integer_key(&value) {
        for (limit, is_low) in [(&raw.low_limit, true), (&raw.high_limit, false)] {
            let Some(limit) = limit else {
                continue;
            };
            let limit = parse_value(&raw.section, ty, limit, node_id)?;
            let Some(limit_key) = integer_key(&limit) else {
                continue;
            };
            if (is_low && key < limit_key) || (!is_low && key > limit_key) {
                return Err(EdsError::LimitViolation {
                    section: raw.section.clone(),
                });
            }
        }
    }
    Ok(value)
}

fn zero_of(ty: DataType) -> ObjectValue {
    match ty {
        DataType::Boolean => ObjectValue::Boolean(false),
        DataType::Integer8 => ObjectValue::Integer8(0),
        DataType::Integer16 => ObjectValue::Integer16(0),
        DataType::Integer24 => ObjectValue::Integer24(0),
        DataType::Integer32 => ObjectValue::Integer32(0),
        DataType::Integer40 => ObjectValue::Integer40(0),
        DataType::Integer48 => ObjectValue::Integer48(0),
        DataType::Integer56 => ObjectValue::Integer56(0),
        DataType::Integer64 => ObjectValue::Integer64(0),
        DataType::Unsigned8 => ObjectValue::Unsigned8(0),
        DataType::Unsigned16 => ObjectValue::Unsigned16(0),
        DataType::Unsigned24 => ObjectValue::Unsigned24(0),
        DataType::Unsigned32 => ObjectValue::Unsigned32(0),
        DataType::Unsigned40 => ObjectValue::Unsigned40(0),
        DataType::Unsigned48 => ObjectValue::Unsigned48(0),
        DataType::Unsigned56 => ObjectValue::Unsigned56(0),
        DataType::Unsigned64 => ObjectValue::Unsigned64(0),
        DataType::Real32 => ObjectValue::Real32(0.0),
        DataType::Real64 => ObjectValue::Real64(0.0),
        DataType::VisibleString => ObjectValue::VisibleString(String::new()),
        DataType::OctetString => ObjectValue::OctetString(Vec::new()),
        DataType::UnicodeString => ObjectValue::UnicodeString(Vec::new()),
        DataType::TimeOfDay => ObjectValue::TimeOfDay(Default::default()),
        DataType::TimeDifference => ObjectValue::TimeDifference(Default::default()),
        DataType::Domain => ObjectValue::Domain(Vec::new()),
    }
}

fn integer_key(value: &ObjectValue) -> Option<i128> {
    Some(match value {
        ObjectValue::Integer8(v) => *v as i128,
        ObjectValue::Integer16(v) => *v as i128,
        ObjectValue::Integer24(v) | ObjectValue::Integer32(v) => *v as i128,
        ObjectValue::Integer40(v)
        | ObjectValue::Integer48(v)
        | ObjectValue::Integer56(v)
        | ObjectValue::Integer64(v) => *v as i128,
        ObjectValue::Unsigned8(v) => *v as i128,
        ObjectValue::Unsigned16(v) => *v as i128,
        ObjectValue::Unsigned24(v) | ObjectValue::Unsigned32(v) => *v as i128,
        ObjectValue::Unsigned40(v)
        | ObjectValue::Unsigned48(v)
        | ObjectValue::Unsigned56(v)
        | ObjectValue::Unsigned64(v) => *v as i128,
        _ => return None,
    })
}

fn parse_access(raw: &RawObject) -> Result<AccessType, EdsError> {
    let Some(access) = raw.access_type.as_deref() else {
        return Ok(AccessType::ReadWrite);
    };
    Ok(match access {
        "ro" => AccessType::ReadOnly,
        "wo" => AccessType::WriteOnly,
        "rw" => AccessType::ReadWrite,
        "rwr" => AccessType::ReadWriteRead,
        "rww" => AccessType::ReadWriteWrite,
        "const" => AccessType::Constant,
        other => {
            return Err(EdsError::UnknownAccessType {
                section: raw.section.clone(),
                value: other.to_owned(),
            })
        }
    })
}

/// PDOMapping=1 maps into the direction the access type permits.
fn mapping_of(mappable: bool, access: AccessType) -> PdoMapping {
    if !mappable {
        return PdoMapping::No;
    }
    match access {
        AccessType::ReadOnly | AccessType::Constant | AccessType::ReadWriteRead => {
            PdoMapping::Tpdo
        }
        AccessType::WriteOnly | AccessType::ReadWriteWrite => PdoMapping::Rpdo,
        AccessType::ReadWrite => PdoMapping::Both,
    }
}

/// Builds a concise DCF stream (the 0x1F22 / SDO-configuration format) from
/// every section carrying a `ParameterValue`.
pub(crate) fn to_concise_dcf(objects: &RawObjects, node_id: NodeId) -> Result<Vec<u8>, EdsError> {
    let mut entries: Vec<(u16, u8, Vec<u8>)> = Vec::new();
    for (&index, (main, subs)) in objects {
        if let Some(bytes) = concise_entry(main, node_id)? {
            entries.push((index, 0, bytes));
        }
        for (&sub_index, sub) in subs {
            if let Some(bytes) = concise_entry(sub, node_id)? {
                entries.push((index, sub_index, bytes));
            }
        }
    }

    let mut stream = Vec::new();
    stream.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (index, sub_index, bytes) in entries {
        stream.extend_from_slice(&index.to_le_bytes());
        stream.push(sub_index);
        stream.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        stream.extend_from_slice(&bytes);
    }
    Ok(stream)
}

fn concise_entry(raw: &RawObject, node_id: NodeId) -> Result<Option<Vec<u8>>, EdsError> {
    let Some(literal) = raw.parameter_value.as_deref() else {
        return Ok(None);
    };
    let Some(code) = raw.data_type else {
        return Ok(None);
    };
    let ty = DataType::from_code(code).ok_or_else(|| EdsError::UnknownDataType {
        section: raw.section.clone(),
        code,
    })?;
    let value = parse_value(&raw.section, ty, literal, node_id)?;
    Ok(Some(value.serialize()))
}

fn leak_name(name: Option<&str>, index: u16) -> &'static str {
    // Entry names are 'static in the core; device descriptions are loaded
    // once per process, so leaking the strings is the pragmatic trade.
    match name {
        Some(name) => Box::leak(name.to_owned().into_boxed_str()),
        None => Box::leak(format!("Object{:04X}", index).into_boxed_str()),
    }
}
