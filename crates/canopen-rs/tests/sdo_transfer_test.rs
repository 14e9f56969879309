// crates/canopen-rs/tests/sdo_transfer_test.rs

mod simulator;

use simulator::{Harness, SimulatedSlave};

use canopen_rs::od::{AccessType, ObjectDictionary, ObjectEntry, ObjectValue};
use canopen_rs::sdo::client::SdoRequestKind;
use canopen_rs::types::NodeId;
use canopen_rs::MasterNode;

fn slave_with_objects() -> SimulatedSlave {
    let mut od = ObjectDictionary::new();
    od.insert(
        0x2005,
        ObjectEntry::variable("Setpoint", ObjectValue::Unsigned8(0)),
    );
    // 1024 printable bytes behind a visible string.
    let blob: String = (0..1024).map(|i| (b'a' + (i % 26) as u8) as char).collect();
    let mut entry = ObjectEntry::variable("Blob", ObjectValue::VisibleString(blob));
    entry.access = AccessType::ReadWrite;
    od.insert(0x2009, entry);
    SimulatedSlave::new(NodeId(2), od)
}

fn started_harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut harness = Harness::new(MasterNode::new(ObjectDictionary::new(), NodeId(1)));
    harness.add_slave(slave_with_objects());
    let actions = harness.master.start(0);
    harness.settle(actions);
    harness.clear_sent();
    harness
}

#[test]
fn test_expedited_download_wire_and_effect() {
    let mut harness = started_harness();

    let (_, promise, actions) =
        harness
            .master
            .sdo_download(NodeId(2), 0x2005, 0x00, vec![0x42], harness.now);
    harness.settle(actions);

    // Client-to-server frame, bit-exact.
    let requests = harness.sent_on(0x602);
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].payload(),
        &[0x2F, 0x05, 0x20, 0x00, 0x42, 0x00, 0x00, 0x00]
    );

    // Server-to-client confirmation, bit-exact.
    let responses: Vec<_> = harness
        .received
        .iter()
        .filter(|frame| frame.cob_id() == Some(0x582))
        .collect();
    assert_eq!(responses.len(), 1);
    assert_eq!(
        responses[0].payload(),
        &[0x60, 0x05, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00]
    );

    assert_eq!(promise.peek(), Some(Ok(Vec::new())));
    assert_eq!(harness.slaves[0].od.read_u8(0x2005, 0), Some(0x42));
}

#[test]
fn test_block_upload_of_1024_bytes() {
    let mut harness = started_harness();
    let expected = harness.slaves[0].od.upload(0x2009, 0).unwrap();
    assert_eq!(expected.len(), 1024);

    let (_, promise, actions) = harness.master.sdo_submit(
        NodeId(2),
        0x2009,
        0x00,
        SdoRequestKind::BlockUpload,
        1_000_000,
        harness.now,
    );
    harness.settle(actions);

    // The client verifies the closing CRC itself; a mismatch would have
    // failed the promise.
    assert_eq!(promise.peek(), Some(Ok(expected)));

    // The server's end-of-transfer frame is flagged "no more data" and
    // carries the CRC of the full payload.
    let end = harness
        .received
        .iter()
        .filter(|frame| frame.cob_id() == Some(0x582))
        .find(|frame| frame.payload()[0] & 0xE3 == 0xC1)
        .expect("end-of-transfer frame");
    let crc = u16::from_le_bytes([end.payload()[1], end.payload()[2]]);
    let uploaded = harness.slaves[0].od.upload(0x2009, 0).unwrap();
    assert_eq!(crc, canopen_rs::sdo::crc16(&uploaded));
}

#[test]
fn test_segmented_download_to_string_object() {
    let mut harness = started_harness();
    let payload = b"segmented payload!".to_vec();

    let (_, promise, actions) =
        harness
            .master
            .sdo_download(NodeId(2), 0x2009, 0x00, payload.clone(), harness.now);
    harness.settle(actions);

    assert_eq!(promise.peek(), Some(Ok(Vec::new())));
    assert_eq!(harness.slaves[0].od.upload(0x2009, 0).unwrap(), payload);
}

#[test]
fn test_upload_of_missing_object_reports_abort() {
    let mut harness = started_harness();
    let (_, promise, actions) = harness.master.sdo_upload(NodeId(2), 0x7ABC, 0, harness.now);
    harness.settle(actions);

    use canopen_rs::{AbortCode, CanOpenError};
    assert_eq!(
        promise.peek(),
        Some(Err(CanOpenError::SdoAbort(AbortCode::NoObj)))
    );
}
