// crates/canopen-rs/src/lss/mod.rs

//! Layer Setting Services (CiA 305): master-side assignment of node-IDs and
//! bit rates to unconfigured slaves over the fixed 0x7E5/0x7E4 channel.

pub mod master;

pub use master::{LssHandle, LssMaster, LssOutcome, LssResult};

use crate::types::NodeId;

/// The 128-bit LSS address of a slave: the identity object quartet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LssAddress {
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision: u32,
    pub serial: u32,
}

impl LssAddress {
    pub fn new(vendor_id: u32, product_code: u32, revision: u32, serial: u32) -> Self {
        Self {
            vendor_id,
            product_code,
            revision,
            serial,
        }
    }

    /// The element selected by an LSS sub value 0..=3.
    pub fn element(&self, sub: LssSub) -> u32 {
        match sub {
            LssSub::Vendor => self.vendor_id,
            LssSub::Product => self.product_code,
            LssSub::Revision => self.revision,
            LssSub::Serial => self.serial,
        }
    }

    pub fn set_element(&mut self, sub: LssSub, value: u32) {
        match sub {
            LssSub::Vendor => self.vendor_id = value,
            LssSub::Product => self.product_code = value,
            LssSub::Revision => self.revision = value,
            LssSub::Serial => self.serial = value,
        }
    }
}

/// The LSS state machine mode of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LssMode {
    /// Waiting: the slave ignores configuration services.
    Waiting = 0,
    /// Configuration: the slave accepts configuration services.
    Configuration = 1,
}

/// Which element of the LSS address a fastscan pass determines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LssSub {
    Vendor = 0,
    Product = 1,
    Revision = 2,
    Serial = 3,
}

impl LssSub {
    pub fn next(self) -> LssSub {
        match self {
            LssSub::Vendor => LssSub::Product,
            LssSub::Product => LssSub::Revision,
            LssSub::Revision => LssSub::Serial,
            // lss_next wraps on the final confirm frame.
            LssSub::Serial => LssSub::Vendor,
        }
    }
}

/// The thirteen LSS operations a master can issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LssRequest {
    /// Switch every slave's LSS state. Unconfirmed.
    SwitchGlobal(LssMode),
    /// Switch exactly the addressed slave into configuration state.
    SwitchSelective(LssAddress),
    /// Assign a node-ID to the slave in configuration state. `None`
    /// unconfigures (0xFF).
    ConfigureNodeId(Option<NodeId>),
    /// Select a new bit rate from a bit-timing table.
    ConfigureBitRate { table: u8, index: u8 },
    /// Activate the previously configured bit rate after `delay_ms`.
    ActivateBitRate { delay_ms: u16 },
    /// Persist the pending configuration in the slave.
    StoreConfiguration,
    InquireVendorId,
    InquireProductCode,
    InquireRevision,
    InquireSerial,
    InquireNodeId,
    /// Ask all slaves without a node-ID to identify themselves.
    IdentifyNonConfigured,
    /// Binary search for a single slave inside `[lo, hi]`. Vendor-ID and
    /// product code must be equal in both bounds.
    Slowscan { lo: LssAddress, hi: LssAddress },
    /// Bit-by-bit determination of one address element of a single
    /// unconfigured slave. Set mask bits select the bits to scan; clear
    /// bits are taken from `address`.
    Fastscan {
        sub: LssSub,
        address: u32,
        mask: u32,
    },
}

/// CiA 305 command specifiers (byte 0 of every LSS frame).
pub(crate) mod cs {
    pub const SWITCH_GLOBAL: u8 = 0x04;
    pub const CONFIGURE_NODE_ID: u8 = 0x11;
    pub const CONFIGURE_BIT_TIMING: u8 = 0x13;
    pub const ACTIVATE_BIT_TIMING: u8 = 0x15;
    pub const STORE_CONFIGURATION: u8 = 0x17;
    pub const SWITCH_SELECTIVE_VENDOR: u8 = 0x40;
    pub const SWITCH_SELECTIVE_PRODUCT: u8 = 0x41;
    pub const SWITCH_SELECTIVE_REVISION: u8 = 0x42;
    pub const SWITCH_SELECTIVE_SERIAL: u8 = 0x43;
    pub const SWITCH_SELECTIVE_RESPONSE: u8 = 0x44;
    pub const IDENTIFY_VENDOR: u8 = 0x46;
    pub const IDENTIFY_PRODUCT: u8 = 0x47;
    pub const IDENTIFY_REVISION_LO: u8 = 0x48;
    pub const IDENTIFY_REVISION_HI: u8 = 0x49;
    pub const IDENTIFY_SERIAL_LO: u8 = 0x4A;
    pub const IDENTIFY_SERIAL_HI: u8 = 0x4B;
    pub const IDENTIFY_NON_CONFIGURED: u8 = 0x4C;
    pub const IDENTIFY_SLAVE: u8 = 0x4F;
    pub const IDENTIFY_NON_CONFIGURED_SLAVE: u8 = 0x50;
    pub const FASTSCAN: u8 = 0x51;
    pub const INQUIRE_VENDOR: u8 = 0x5A;
    pub const INQUIRE_PRODUCT: u8 = 0x5B;
    pub const INQUIRE_REVISION: u8 = 0x5C;
    pub const INQUIRE_SERIAL: u8 = 0x5D;
    pub const INQUIRE_NODE_ID: u8 = 0x5E;
}

/// The CiA 301 bit-timing table: index -> bit rate in bit/s. Index 5 is
/// reserved.
pub fn bit_rate_from_table(table: u8, index: u8) -> Option<u32> {
    if table != 0 {
        // Only the standard table is defined.
        return None;
    }
    match index {
        0 => Some(1_000_000),
        1 => Some(800_000),
        2 => Some(500_000),
        3 => Some(250_000),
        4 => Some(125_000),
        6 => Some(50_000),
        7 => Some(20_000),
        8 => Some(10_000),
        _ => None,
    }
}
