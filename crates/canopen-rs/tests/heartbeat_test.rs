// crates/canopen-rs/tests/heartbeat_test.rs

mod simulator;

use simulator::Harness;

use canopen_rs::can::CanFrame;
use canopen_rs::od::{ObjectDictionary, ObjectValue};
use canopen_rs::types::NodeId;
use canopen_rs::{MasterNode, NmtState, Notification};

fn harness_with_consumer(consumer_ms: u16) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut od = ObjectDictionary::new();
    canopen_rs::od::predefined::populate(&mut od, NodeId(1));
    od.write(
        0x1016,
        1,
        ObjectValue::Unsigned32((5u32 << 16) | consumer_ms as u32),
    )
    .unwrap();
    let mut harness = Harness::new(MasterNode::new(od, NodeId(1)));
    let actions = harness.master.start(0);
    harness.settle(actions);
    harness
}

#[test]
fn test_exactly_one_timeout_within_150ms_of_last_beat() {
    let mut harness = harness_with_consumer(100);

    // Node 5 beats once at t = 10 ms, then goes silent.
    harness.now = 10_000;
    harness.inject(CanFrame::new(0x705, &[0x05]).unwrap());
    assert!(harness.notifications.contains(&Notification::HeartbeatStateChange(
        NodeId(5),
        NmtState::Operational
    )));
    harness.notifications.clear();

    // 150 ms after the last heartbeat the timeout must have fired, once.
    harness.advance_to(10_000 + 150_000);
    let timeouts: Vec<_> = harness
        .notifications
        .iter()
        .filter(|notification| **notification == Notification::HeartbeatTimeout(NodeId(5)))
        .collect();
    assert_eq!(timeouts.len(), 1);

    // No further timeout without a new heartbeat.
    harness.advance_to(1_000_000);
    let timeouts = harness
        .notifications
        .iter()
        .filter(|notification| **notification == Notification::HeartbeatTimeout(NodeId(5)))
        .count();
    assert_eq!(timeouts, 1);
}

#[test]
fn test_heartbeat_restarts_window() {
    let mut harness = harness_with_consumer(100);

    // Regular beats every 50 ms keep the consumer quiet.
    for beat in 1..=10u64 {
        harness.now = beat * 50_000;
        harness.inject(CanFrame::new(0x705, &[0x05]).unwrap());
    }
    harness.advance_to(10 * 50_000 + 99_000);
    assert!(!harness
        .notifications
        .contains(&Notification::HeartbeatTimeout(NodeId(5))));

    // Silence afterwards expires the window once.
    harness.advance_to(10 * 50_000 + 200_000);
    assert!(harness
        .notifications
        .contains(&Notification::HeartbeatTimeout(NodeId(5))));
}

#[test]
fn test_state_change_reported_per_transition() {
    let mut harness = harness_with_consumer(500);

    harness.now = 1_000;
    harness.inject(CanFrame::new(0x705, &[0x7F]).unwrap());
    harness.now = 2_000;
    harness.inject(CanFrame::new(0x705, &[0x7F]).unwrap());
    harness.now = 3_000;
    harness.inject(CanFrame::new(0x705, &[0x05]).unwrap());

    let changes: Vec<_> = harness
        .notifications
        .iter()
        .filter(|notification| {
            matches!(notification, Notification::HeartbeatStateChange(node, _) if *node == NodeId(5))
        })
        .collect();
    assert_eq!(changes.len(), 2);
}

#[test]
fn test_local_heartbeat_producer() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut od = ObjectDictionary::new();
    canopen_rs::od::predefined::populate(&mut od, NodeId(1));
    od.write(0x1017, 0, ObjectValue::Unsigned16(50)).unwrap();
    let mut harness = Harness::new(MasterNode::new(od, NodeId(1)));
    let actions = harness.master.start(0);
    harness.settle(actions);
    harness.clear_sent();

    harness.advance_to(175_000);
    let beats = harness.sent_on(0x701);
    assert_eq!(beats.len(), 3);
    // PRE-OPERATIONAL is reported as 0x7F.
    assert!(beats.iter().all(|beat| beat.payload() == [0x7F]));
}
