// crates/canopen-rs/src/od/predefined.rs

//! Seeds the communication-profile objects every master node relies on.
//!
//! The application (or a device-description loader) may insert these objects
//! itself before calling `populate`; existing entries are never overwritten.

use super::{AccessType, ObjectDictionary, ObjectEntry, ObjectValue};
use crate::types::{NodeId, C_ADR_MAX_NODE_ID, COBID_SYNC_DEFAULT, COBID_TIME_DEFAULT};
use alloc::vec;
use alloc::vec::Vec;

/// Number of per-slave sub-indices in the network-configuration arrays.
const SLAVE_SLOTS: usize = C_ADR_MAX_NODE_ID as usize;

fn insert_if_absent(od: &mut ObjectDictionary, index: u16, entry: ObjectEntry) {
    if od.entry(index).is_none() {
        od.insert(index, entry);
    }
}

fn u32_slots(value: u32) -> Vec<ObjectValue> {
    vec![ObjectValue::Unsigned32(value); SLAVE_SLOTS]
}

/// Populates the mandatory communication and network-management objects for
/// a master with the given node-ID.
pub fn populate(od: &mut ObjectDictionary, node_id: NodeId) {
    insert_if_absent(
        od,
        0x1000,
        ObjectEntry::read_only("DeviceType", ObjectValue::Unsigned32(0)),
    );
    insert_if_absent(
        od,
        0x1001,
        ObjectEntry::read_only("ErrorRegister", ObjectValue::Unsigned8(0)),
    );
    insert_if_absent(
        od,
        0x1003,
        ObjectEntry::array(
            "PreDefinedErrorField",
            Vec::new(),
            AccessType::ReadOnly,
        ),
    );
    insert_if_absent(
        od,
        0x1005,
        ObjectEntry::variable(
            "CobIdSync",
            ObjectValue::Unsigned32(COBID_SYNC_DEFAULT as u32),
        )
        .with_default(),
    );
    insert_if_absent(
        od,
        0x1006,
        ObjectEntry::variable("CommunicationCyclePeriod", ObjectValue::Unsigned32(0))
            .with_default(),
    );
    insert_if_absent(
        od,
        0x1007,
        ObjectEntry::variable("SynchronousWindowLength", ObjectValue::Unsigned32(0))
            .with_default(),
    );
    insert_if_absent(
        od,
        0x100C,
        ObjectEntry::variable("GuardTime", ObjectValue::Unsigned16(0)).with_default(),
    );
    insert_if_absent(
        od,
        0x100D,
        ObjectEntry::variable("LifeTimeFactor", ObjectValue::Unsigned8(0)).with_default(),
    );
    insert_if_absent(
        od,
        0x1012,
        ObjectEntry::variable(
            "CobIdTimeStamp",
            ObjectValue::Unsigned32(COBID_TIME_DEFAULT as u32),
        )
        .with_default(),
    );
    insert_if_absent(
        od,
        0x1014,
        ObjectEntry::variable(
            "CobIdEmcy",
            ObjectValue::Unsigned32(node_id.emcy_cob_id() as u32),
        )
        .with_default(),
    );
    insert_if_absent(
        od,
        0x1015,
        ObjectEntry::variable("InhibitTimeEmcy", ObjectValue::Unsigned16(0)).with_default(),
    );
    insert_if_absent(
        od,
        0x1016,
        ObjectEntry::array(
            "ConsumerHeartbeatTime",
            u32_slots(0),
            AccessType::ReadWrite,
        ),
    );
    insert_if_absent(
        od,
        0x1017,
        ObjectEntry::variable("ProducerHeartbeatTime", ObjectValue::Unsigned16(0))
            .with_default(),
    );
    insert_if_absent(
        od,
        0x1018,
        ObjectEntry::record(
            "IdentityObject",
            vec![
                ObjectValue::Unsigned32(0), // VendorId
                ObjectValue::Unsigned32(0), // ProductCode
                ObjectValue::Unsigned32(0), // RevisionNumber
                ObjectValue::Unsigned32(0), // SerialNumber
            ],
            AccessType::ReadOnly,
        ),
    );
    insert_if_absent(
        od,
        0x1019,
        ObjectEntry::variable("SynchronousCounterOverflow", ObjectValue::Unsigned8(0))
            .with_default(),
    );

    // --- CiA 302 network management objects ---

    insert_if_absent(
        od,
        0x1F22,
        ObjectEntry::array(
            "ConciseDcf",
            vec![ObjectValue::Domain(Vec::new()); SLAVE_SLOTS],
            AccessType::ReadWrite,
        ),
    );
    insert_if_absent(
        od,
        0x1F55,
        ObjectEntry::array(
            "ExpectedSoftwareVersion",
            u32_slots(0),
            AccessType::ReadWrite,
        ),
    );
    insert_if_absent(
        od,
        0x1F80,
        ObjectEntry::variable("NmtStartup", ObjectValue::Unsigned32(0)).with_default(),
    );
    insert_if_absent(
        od,
        0x1F81,
        ObjectEntry::array("SlaveAssignment", u32_slots(0), AccessType::ReadWrite),
    );
    insert_if_absent(
        od,
        0x1F82,
        ObjectEntry::array(
            "RequestNmt",
            vec![ObjectValue::Unsigned8(0); SLAVE_SLOTS],
            AccessType::ReadWrite,
        ),
    );
    insert_if_absent(
        od,
        0x1F84,
        ObjectEntry::array("DeviceTypeIdentification", u32_slots(0), AccessType::ReadWrite),
    );
    insert_if_absent(
        od,
        0x1F85,
        ObjectEntry::array("VendorIdentification", u32_slots(0), AccessType::ReadWrite),
    );
    insert_if_absent(
        od,
        0x1F86,
        ObjectEntry::array("ProductCode", u32_slots(0), AccessType::ReadWrite),
    );
    insert_if_absent(
        od,
        0x1F87,
        ObjectEntry::array("RevisionNumber", u32_slots(0), AccessType::ReadWrite),
    );
    insert_if_absent(
        od,
        0x1F88,
        ObjectEntry::array("SerialNumber", u32_slots(0), AccessType::ReadWrite),
    );
    insert_if_absent(
        od,
        0x1F89,
        ObjectEntry::variable("BootTime", ObjectValue::Unsigned32(0)).with_default(),
    );
}
