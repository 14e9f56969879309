use super::value::{DataType, ObjectValue};
use alloc::vec::Vec;

/// Represents the structure of a single object dictionary entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Variable(ObjectValue),
    Array(Vec<ObjectValue>),
    Record(Vec<ObjectValue>),
}

/// Defines the access rights for an object dictionary entry.
/// (CiA 301, Section 7.4.3 and CiA 306 `AccessType`.)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// read only access
    ReadOnly,
    /// write only access
    WriteOnly,
    /// read and write access
    ReadWrite,
    /// read and write access, readable when mapped into a TPDO (`rwr`)
    ReadWriteRead,
    /// read and write access, writable when mapped into an RPDO (`rww`)
    ReadWriteWrite,
    /// read only access, value is constant
    Constant,
}

impl AccessType {
    pub fn readable(&self) -> bool {
        !matches!(self, AccessType::WriteOnly)
    }

    pub fn writable(&self) -> bool {
        !matches!(self, AccessType::ReadOnly | AccessType::Constant)
    }
}

/// PDO mapping eligibility of an object, per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PdoMapping {
    /// Not mappable.
    #[default]
    No,
    /// Mappable into transmit PDOs only.
    Tpdo,
    /// Mappable into receive PDOs only.
    Rpdo,
    /// Mappable in both directions.
    Both,
}

impl PdoMapping {
    /// True if the entry may appear in a TPDO mapping.
    pub fn tx(&self) -> bool {
        matches!(self, PdoMapping::Tpdo | PdoMapping::Both)
    }

    /// True if the entry may appear in an RPDO mapping.
    pub fn rx(&self) -> bool {
        matches!(self, PdoMapping::Rpdo | PdoMapping::Both)
    }
}

/// A complete entry in the object dictionary: data plus access metadata.
///
/// Download/upload indication callbacks are not stored here (they are not
/// `Clone`); the dictionary keeps them in side tables keyed by
/// (index, sub-index).
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEntry {
    /// The actual data.
    pub object: Object,
    /// A descriptive name for the object.
    pub name: &'static str,
    /// The access rights. For arrays and records this applies to the data
    /// sub-indices; sub-index 0 is always read-only.
    pub access: AccessType,
    /// The PDO mapping possibility.
    pub pdo_mapping: PdoMapping,
    /// Power-on defaults, used by the reset-application / reset-communication
    /// services. `None` means the current value survives resets.
    pub default: Option<Object>,
}

impl ObjectEntry {
    /// A read-write variable with no reset default.
    pub fn variable(name: &'static str, value: ObjectValue) -> Self {
        Self {
            object: Object::Variable(value),
            name,
            access: AccessType::ReadWrite,
            pdo_mapping: PdoMapping::No,
            default: None,
        }
    }

    /// A read-only variable.
    pub fn read_only(name: &'static str, value: ObjectValue) -> Self {
        Self {
            access: AccessType::ReadOnly,
            ..Self::variable(name, value)
        }
    }

    /// A constant.
    pub fn constant(name: &'static str, value: ObjectValue) -> Self {
        Self {
            access: AccessType::Constant,
            ..Self::variable(name, value)
        }
    }

    /// An array object with identical access on every data sub-index.
    pub fn array(name: &'static str, values: Vec<ObjectValue>, access: AccessType) -> Self {
        Self {
            object: Object::Array(values),
            name,
            access,
            pdo_mapping: PdoMapping::No,
            default: None,
        }
    }

    /// A record object.
    pub fn record(name: &'static str, values: Vec<ObjectValue>, access: AccessType) -> Self {
        Self {
            object: Object::Record(values),
            name,
            access,
            pdo_mapping: PdoMapping::No,
            default: None,
        }
    }

    /// Marks the entry PDO-mappable.
    pub fn with_pdo_mapping(mut self, mapping: PdoMapping) -> Self {
        self.pdo_mapping = mapping;
        self
    }

    /// Snapshots the current value as the power-on default.
    pub fn with_default(mut self) -> Self {
        self.default = Some(self.object.clone());
        self
    }

    /// The data type of a given sub-index, if it exists.
    pub fn data_type(&self, sub_index: u8) -> Option<DataType> {
        match &self.object {
            Object::Variable(value) => (sub_index == 0).then(|| value.data_type()),
            Object::Array(values) | Object::Record(values) => {
                if sub_index == 0 {
                    Some(DataType::Unsigned8)
                } else {
                    values
                        .get(sub_index as usize - 1)
                        .map(ObjectValue::data_type)
                }
            }
        }
    }

    /// The highest valid sub-index (the value reported at sub-index 0 for
    /// arrays and records).
    pub fn max_sub_index(&self) -> u8 {
        match &self.object {
            Object::Variable(_) => 0,
            Object::Array(values) | Object::Record(values) => values.len() as u8,
        }
    }
}
