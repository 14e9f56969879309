// crates/canopen-rs/src/od/mod.rs

mod entry;
pub mod predefined;
mod value;

pub use entry::{AccessType, Object, ObjectEntry, PdoMapping};
pub use value::{DataType, ObjectValue, TimeDifference, TimeOfDay};

use crate::sdo::AbortCode;
use alloc::{borrow::Cow, boxed::Box, collections::BTreeMap, vec::Vec};
use core::fmt;
use log::trace;

/// Download indication: called instead of the default store when registered.
///
/// Returning `Ok(Some(value))` stores the decoded value; `Ok(None)` means the
/// callback consumed the data itself (virtual object).
pub type DownloadIndication =
    Box<dyn FnMut(u16, u8, &[u8]) -> Result<Option<ObjectValue>, AbortCode>>;

/// Upload indication: called instead of the default fetch when registered.
pub type UploadIndication = Box<dyn FnMut(u16, u8) -> Result<Vec<u8>, AbortCode>>;

/// The object dictionary of one node: an ordered, typed map from
/// (index, sub-index) to values with access metadata.
///
/// Single-owner: it belongs to one node instance, and every mutation happens
/// from that node's engines or from user code holding the node.
#[derive(Default)]
pub struct ObjectDictionary {
    entries: BTreeMap<u16, ObjectEntry>,
    download_indications: BTreeMap<(u16, u8), DownloadIndication>,
    upload_indications: BTreeMap<(u16, u8), UploadIndication>,
}

impl fmt::Debug for ObjectDictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDictionary")
            .field("entries", &self.entries.len())
            .field("download_indications", &self.download_indications.len())
            .field("upload_indications", &self.upload_indications.len())
            .finish()
    }
}

impl ObjectDictionary {
    /// Creates a new, empty dictionary. Call `od::predefined::populate` (or
    /// load a device description) before handing it to a node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new object entry at a given index.
    pub fn insert(&mut self, index: u16, entry: ObjectEntry) {
        self.entries.insert(index, entry);
    }

    /// True if `(index, sub_index)` names an existing sub-object.
    pub fn contains(&self, index: u16, sub_index: u8) -> bool {
        self.entries
            .get(&index)
            .is_some_and(|entry| sub_index <= entry.max_sub_index())
    }

    /// Reads a value by index and sub-index.
    ///
    /// Sub-index 0 of arrays and records reports the highest valid sub-index
    /// as an owned UNSIGNED8.
    pub fn read(&self, index: u16, sub_index: u8) -> Option<Cow<'_, ObjectValue>> {
        self.entries
            .get(&index)
            .and_then(|entry| match &entry.object {
                Object::Variable(value) => (sub_index == 0).then_some(Cow::Borrowed(value)),
                Object::Array(values) | Object::Record(values) => {
                    if sub_index == 0 {
                        Some(Cow::Owned(ObjectValue::Unsigned8(values.len() as u8)))
                    } else {
                        values.get(sub_index as usize - 1).map(Cow::Borrowed)
                    }
                }
            })
    }

    /// Reads an object's structural enum by index.
    pub fn read_object(&self, index: u16) -> Option<&Object> {
        self.entries.get(&index).map(|entry| &entry.object)
    }

    /// Returns the entry metadata for an index.
    pub fn entry(&self, index: u16) -> Option<&ObjectEntry> {
        self.entries.get(&index)
    }

    // --- Type-safe accessors ---

    pub fn read_u8(&self, index: u16, sub_index: u8) -> Option<u8> {
        self.read(index, sub_index).and_then(|cow| cow.as_u8())
    }

    pub fn read_u16(&self, index: u16, sub_index: u8) -> Option<u16> {
        self.read(index, sub_index).and_then(|cow| cow.as_u16())
    }

    pub fn read_u32(&self, index: u16, sub_index: u8) -> Option<u32> {
        self.read(index, sub_index).and_then(|cow| cow.as_u32())
    }

    pub fn read_u64(&self, index: u16, sub_index: u8) -> Option<u64> {
        self.read(index, sub_index).and_then(|cow| cow.as_u64())
    }

    /// Public write that respects access rights.
    pub fn write(
        &mut self,
        index: u16,
        sub_index: u8,
        value: ObjectValue,
    ) -> Result<(), AbortCode> {
        self.write_internal(index, sub_index, value, true)
    }

    /// Internal write with an option to bypass access checks (used by the
    /// engines for status mirrors like 0x1003).
    pub(crate) fn write_internal(
        &mut self,
        index: u16,
        sub_index: u8,
        value: ObjectValue,
        check_access: bool,
    ) -> Result<(), AbortCode> {
        let entry = self.entries.get_mut(&index).ok_or(AbortCode::NoObj)?;
        if check_access && !entry.access.writable() {
            return Err(AbortCode::NoWrite);
        }
        match &mut entry.object {
            Object::Variable(current) => {
                if sub_index != 0 {
                    return Err(AbortCode::NoSub);
                }
                if current.data_type() != value.data_type() {
                    return Err(AbortCode::Param);
                }
                *current = value;
                Ok(())
            }
            Object::Array(values) | Object::Record(values) => {
                if sub_index == 0 {
                    // The element count is synthesized and never writable.
                    return Err(AbortCode::NoWrite);
                }
                let slot = values
                    .get_mut(sub_index as usize - 1)
                    .ok_or(AbortCode::NoSub)?;
                if slot.data_type() != value.data_type() {
                    return Err(AbortCode::Param);
                }
                *slot = value;
                Ok(())
            }
        }
    }

    // --- SDO-facing transfer operations ---

    /// Writes raw transfer bytes into an entry, honouring access rights and
    /// any registered download indication.
    pub fn download(&mut self, index: u16, sub_index: u8, data: &[u8]) -> Result<(), AbortCode> {
        if !self.entries.contains_key(&index) {
            return Err(AbortCode::NoObj);
        }

        // An indication replaces the default store entirely.
        if let Some(mut indication) = self.download_indications.remove(&(index, sub_index)) {
            let result = indication(index, sub_index, data);
            self.download_indications
                .insert((index, sub_index), indication);
            return match result? {
                Some(value) => self.write_internal(index, sub_index, value, false),
                None => Ok(()),
            };
        }

        let entry = self.entries.get(&index).ok_or(AbortCode::NoObj)?;
        if !entry.access.writable() {
            return Err(AbortCode::NoWrite);
        }
        let ty = entry.data_type(sub_index).ok_or(AbortCode::NoSub)?;
        let value = ObjectValue::read(ty, data)?;
        trace!(
            "[OD] download {:#06X}:{:#04X} <- {} byte(s)",
            index,
            sub_index,
            data.len()
        );
        self.write_internal(index, sub_index, value, false)
    }

    /// Reads an entry as raw transfer bytes, honouring access rights and any
    /// registered upload indication.
    pub fn upload(&mut self, index: u16, sub_index: u8) -> Result<Vec<u8>, AbortCode> {
        if !self.entries.contains_key(&index) {
            return Err(AbortCode::NoObj);
        }

        if let Some(mut indication) = self.upload_indications.remove(&(index, sub_index)) {
            let result = indication(index, sub_index);
            self.upload_indications
                .insert((index, sub_index), indication);
            return result;
        }

        let entry = self.entries.get(&index).ok_or(AbortCode::NoObj)?;
        if !entry.access.readable() {
            return Err(AbortCode::NoRead);
        }
        let value = self.read(index, sub_index).ok_or(AbortCode::NoSub)?;
        Ok(value.serialize())
    }

    /// Registers a download indication, replacing any previous one.
    pub fn set_download_indication(
        &mut self,
        index: u16,
        sub_index: u8,
        indication: DownloadIndication,
    ) {
        self.download_indications
            .insert((index, sub_index), indication);
    }

    /// Registers an upload indication, replacing any previous one.
    pub fn set_upload_indication(
        &mut self,
        index: u16,
        sub_index: u8,
        indication: UploadIndication,
    ) {
        self.upload_indications
            .insert((index, sub_index), indication);
    }

    /// Removes the indications for one sub-object.
    pub fn clear_indications(&mut self, index: u16, sub_index: u8) {
        self.download_indications.remove(&(index, sub_index));
        self.upload_indications.remove(&(index, sub_index));
    }

    /// Restores power-on defaults for every entry in `lo..=hi` that carries
    /// one. Used by the reset-application and reset-communication services.
    pub fn restore_power_on_values(&mut self, lo: u16, hi: u16) {
        for (_, entry) in self.entries.range_mut(lo..=hi) {
            if let Some(default) = &entry.default {
                entry.object = default.clone();
            }
        }
    }

    /// Iterates over (index, entry) pairs in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = (&u16, &ObjectEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::string::ToString;
    use alloc::vec;
    use core::cell::RefCell;

    #[test]
    fn test_read_variable() {
        let mut od = ObjectDictionary::new();
        od.insert(
            0x1006,
            ObjectEntry::variable("CommCyclePeriod", ObjectValue::Unsigned32(12345)),
        );
        let value = od.read(0x1006, 0).unwrap();
        assert_eq!(*value, ObjectValue::Unsigned32(12345));
    }

    #[test]
    fn test_sub_index_zero_reports_count() {
        let mut od = ObjectDictionary::new();
        od.insert(
            0x1016,
            ObjectEntry::array(
                "ConsumerHeartbeatTime",
                vec![ObjectValue::Unsigned32(0), ObjectValue::Unsigned32(0)],
                AccessType::ReadWrite,
            ),
        );
        assert_eq!(*od.read(0x1016, 0).unwrap(), ObjectValue::Unsigned8(2));
        assert!(matches!(od.read(0x1016, 0).unwrap(), Cow::Owned(_)));
    }

    #[test]
    fn test_write_to_readonly_fails() {
        let mut od = ObjectDictionary::new();
        od.insert(
            0x1000,
            ObjectEntry::read_only("DeviceType", ObjectValue::Unsigned32(0x0000_0191)),
        );
        assert_eq!(
            od.write(0x1000, 0, ObjectValue::Unsigned32(0)),
            Err(AbortCode::NoWrite)
        );
        assert_eq!(od.read_u32(0x1000, 0), Some(0x0000_0191));
    }

    #[test]
    fn test_download_decodes_with_entry_type() {
        let mut od = ObjectDictionary::new();
        od.insert(
            0x2005,
            ObjectEntry::variable("Setpoint", ObjectValue::Unsigned8(0)),
        );
        od.download(0x2005, 0, &[0x42]).unwrap();
        assert_eq!(od.read_u8(0x2005, 0), Some(0x42));
        assert_eq!(od.download(0x2005, 0, &[1, 2]), Err(AbortCode::TypeLenHi));
    }

    #[test]
    fn test_download_unknown_object() {
        let mut od = ObjectDictionary::new();
        assert_eq!(od.download(0x2000, 0, &[0]), Err(AbortCode::NoObj));
        od.insert(
            0x2000,
            ObjectEntry::variable("X", ObjectValue::Unsigned8(0)),
        );
        assert_eq!(od.download(0x2000, 1, &[0]), Err(AbortCode::NoSub));
    }

    #[test]
    fn test_upload_write_only_fails() {
        let mut od = ObjectDictionary::new();
        let mut entry = ObjectEntry::variable("Command", ObjectValue::Unsigned8(0));
        entry.access = AccessType::WriteOnly;
        od.insert(0x2100, entry);
        assert_eq!(od.upload(0x2100, 0), Err(AbortCode::NoRead));
    }

    #[test]
    fn test_download_indication_virtual_object() {
        let mut od = ObjectDictionary::new();
        od.insert(
            0x1F51,
            ObjectEntry::variable("ProgramControl", ObjectValue::Unsigned8(0)),
        );
        let captured = Rc::new(RefCell::new(Vec::new()));
        let captured_clone = Rc::clone(&captured);
        od.set_download_indication(
            0x1F51,
            0,
            Box::new(move |_, _, data| {
                captured_clone.borrow_mut().extend_from_slice(data);
                Ok(None)
            }),
        );
        od.download(0x1F51, 0, &[0x01]).unwrap();
        assert_eq!(*captured.borrow(), vec![0x01]);
        // The stored value is untouched; the indication consumed the data.
        assert_eq!(od.read_u8(0x1F51, 0), Some(0));
    }

    #[test]
    fn test_upload_indication_overrides_fetch() {
        let mut od = ObjectDictionary::new();
        od.insert(
            0x1008,
            ObjectEntry::constant(
                "DeviceName",
                ObjectValue::VisibleString("stale".to_string()),
            ),
        );
        od.set_upload_indication(0x1008, 0, Box::new(|_, _| Ok(b"fresh".to_vec())));
        assert_eq!(od.upload(0x1008, 0).unwrap(), b"fresh".to_vec());
    }

    #[test]
    fn test_restore_power_on_values() {
        let mut od = ObjectDictionary::new();
        od.insert(
            0x1017,
            ObjectEntry::variable("ProducerHeartbeatTime", ObjectValue::Unsigned16(1000))
                .with_default(),
        );
        od.write(0x1017, 0, ObjectValue::Unsigned16(0)).unwrap();
        od.restore_power_on_values(0x1000, 0x1FFF);
        assert_eq!(od.read_u16(0x1017, 0), Some(1000));
    }
}
