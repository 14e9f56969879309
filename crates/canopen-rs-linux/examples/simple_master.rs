// crates/canopen-rs-linux/examples/simple_master.rs

//! Minimal driver loop: boots the master on "can0", monitors slave 2 and
//! logs everything the stack reports.
//!
//! Run with: cargo run --example simple_master -- can0

use canopen_rs::node::{NodeAction, Notification};
use canopen_rs::od::{ObjectDictionary, ObjectValue};
use canopen_rs::types::NodeId;
use canopen_rs::{CanDriver, MasterNode};
use canopen_rs_linux::SocketCanDriver;
use std::time::{Duration, Instant};

fn now_us(epoch: Instant) -> u64 {
    epoch.elapsed().as_micros() as u64
}

fn perform(driver: &mut SocketCanDriver, actions: Vec<NodeAction>) {
    for action in actions {
        match action {
            NodeAction::SendFrame(frame) => {
                if let Err(e) = driver.send(&frame) {
                    log::warn!("send failed: {}", e);
                }
            }
            NodeAction::Notify(notification) => match notification {
                Notification::BootResult { node, es: 0 } => {
                    log::info!("slave {} operational", node)
                }
                Notification::BootResult { node, es } => {
                    log::warn!("slave {} boot failed: '{}'", node, es as char)
                }
                other => log::info!("{:?}", other),
            },
        }
    }
}

fn main() {
    env_logger::init();
    let interface = std::env::args().nth(1).unwrap_or_else(|| "can0".into());
    let mut driver = SocketCanDriver::new(&interface).expect("CAN interface");

    // Manage slave 2 (identity checks disabled) and watch its heartbeat.
    let mut od = ObjectDictionary::new();
    canopen_rs::od::predefined::populate(&mut od, NodeId(1));
    od.write(0x1F81, 2, ObjectValue::Unsigned32(0x01)).unwrap();
    od.write(0x1016, 1, ObjectValue::Unsigned32(2 << 16 | 1000))
        .unwrap();
    od.write(0x1017, 0, ObjectValue::Unsigned16(500)).unwrap();

    let mut node = MasterNode::new(od, NodeId(1));
    let epoch = Instant::now();
    let actions = node.start(now_us(epoch));
    perform(&mut driver, actions);

    loop {
        let now = now_us(epoch);
        while let Ok(Some(frame)) = driver.try_receive() {
            let actions = node.process_frame(&frame, now);
            perform(&mut driver, actions);
        }
        let actions = node.tick(now);
        perform(&mut driver, actions);
        node.executor().run_pending();

        let sleep = node
            .next_action_time()
            .map(|deadline| deadline.saturating_sub(now_us(epoch)).min(10_000))
            .unwrap_or(10_000);
        std::thread::sleep(Duration::from_micros(sleep.max(100)));
    }
}
