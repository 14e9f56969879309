// crates/canopen-rs-eds/src/error.rs

use std::fmt;

/// Errors produced while parsing an EDS/DCF file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdsError {
    /// The INI syntax itself is broken.
    Syntax(String),
    /// A section name looks like an object but cannot be parsed.
    BadSectionName(String),
    /// A required key is missing from a section.
    MissingKey { section: String, key: &'static str },
    /// A value does not conform to its CiA 306 lexical form.
    BadValue {
        section: String,
        key: &'static str,
        value: String,
    },
    /// The DataType code is unknown.
    UnknownDataType { section: String, code: u16 },
    /// The AccessType string is unknown.
    UnknownAccessType { section: String, value: String },
    /// A ParameterValue violates the declared LowLimit/HighLimit.
    LimitViolation { section: String },
    /// An array or record is missing a declared sub-object section.
    MissingSubObject { index: u16, sub_index: u8 },
}

impl fmt::Display for EdsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax(message) => write!(f, "INI syntax error: {}", message),
            Self::BadSectionName(name) => write!(f, "Malformed section name [{}]", name),
            Self::MissingKey { section, key } => {
                write!(f, "Section [{}] is missing key {}", section, key)
            }
            Self::BadValue {
                section,
                key,
                value,
            } => write!(f, "Section [{}]: bad {} value '{}'", section, key, value),
            Self::UnknownDataType { section, code } => {
                write!(f, "Section [{}]: unknown DataType {:#06X}", section, code)
            }
            Self::UnknownAccessType { section, value } => {
                write!(f, "Section [{}]: unknown AccessType '{}'", section, value)
            }
            Self::LimitViolation { section } => {
                write!(f, "Section [{}]: ParameterValue outside limits", section)
            }
            Self::MissingSubObject { index, sub_index } => write!(
                f,
                "Object {:#06X} declares sub-object {} but has no section for it",
                index, sub_index
            ),
        }
    }
}

impl std::error::Error for EdsError {}
