//! Parses CANopen EDS/DCF (CiA 306) device description files.
//!
//! This library provides the out-of-core loader for the `canopen-rs` stack:
//!
//! - **Parsing**: loading `.eds`/`.dcf` INI text into raw object sections.
//! - **Conversion**: building a core `ObjectDictionary` from the sections,
//!   with `$NODEID` substitution and limit checking.
//! - **Concise DCF**: generating the binary configuration stream consumed
//!   by the boot-slave procedure (object 0x1F22).

mod converter;
mod error;
mod parser;

pub use error::EdsError;

use canopen_rs::od::ObjectDictionary;
use canopen_rs::types::NodeId;
use converter::ValueMode;

/// Loads a DCF (configuration) string into an object dictionary, preferring
/// `ParameterValue` over `DefaultValue`.
pub fn load_dcf_from_str(source: &str, node_id: NodeId) -> Result<ObjectDictionary, EdsError> {
    let objects = parser::parse_sections(source)?;
    converter::to_object_dictionary(&objects, node_id, ValueMode::Actual)
}

/// Loads an EDS (device description) string into an object dictionary using
/// the firmware defaults.
pub fn load_eds_from_str(source: &str, node_id: NodeId) -> Result<ObjectDictionary, EdsError> {
    let objects = parser::parse_sections(source)?;
    converter::to_object_dictionary(&objects, node_id, ValueMode::Default)
}

/// Builds the concise-DCF byte stream of every `ParameterValue` in a DCF,
/// suitable for storing in object 0x1F22 of a master.
pub fn concise_dcf_from_str(source: &str, node_id: NodeId) -> Result<Vec<u8>, EdsError> {
    let objects = parser::parse_sections(source)?;
    converter::to_concise_dcf(&objects, node_id)
}
