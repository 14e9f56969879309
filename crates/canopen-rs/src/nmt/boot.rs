// crates/canopen-rs/src/nmt/boot.rs

//! The boot-slave procedure (CiA 302, Section 4.4): identity verification,
//! software check, error-history check and configuration download, run per
//! slave when its boot-up frame is seen.
//!
//! The engine is transport-free: it emits `BootRequest`s which the node
//! maps onto the SDO client, and consumes the resulting completions.

use super::master::SlaveAssignment;
use crate::node::TimerEvent;
use crate::od::{ObjectDictionary, ObjectValue};
use crate::sdo::client::SdoResult;
use crate::timer::{TimerHandle, TimerQueue};
use crate::types::NodeId;
use alloc::borrow::Cow;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::{debug, info, warn};

/// Default per-step timeout when object 0x1F89 is absent or zero.
const DEFAULT_BOOT_TIMEOUT_US: u64 = 1_000_000;

/// Work the boot engine asks the node to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum BootRequest {
    /// SDO upload from the slave.
    Upload { index: u16, sub_index: u8 },
    /// Concise-DCF download to the slave via the SDO client.
    DownloadDcf(Vec<u8>),
    /// Suspend the slave's heartbeat consumer while its error history is
    /// inspected.
    SuspendErrorControl,
    /// Resume the slave's heartbeat consumer.
    ResumeErrorControl,
    /// Deliver the slave to the operational network (NMT start unless
    /// autostart is disabled).
    StartSlave,
}

/// Final result of one boot job: `es == 0` on success, else the CiA 302
/// error-status letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOutcome {
    pub node: NodeId,
    pub es: u8,
}

/// The steps of the procedure, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootStep {
    CheckVendor,
    CheckProduct,
    CheckRevision,
    CheckSerial,
    CheckSoftware,
    CheckErrorCount,
    Configure,
    Finish,
}

impl BootStep {
    fn next(self) -> Option<BootStep> {
        match self {
            BootStep::CheckVendor => Some(BootStep::CheckProduct),
            BootStep::CheckProduct => Some(BootStep::CheckRevision),
            BootStep::CheckRevision => Some(BootStep::CheckSerial),
            BootStep::CheckSerial => Some(BootStep::CheckSoftware),
            BootStep::CheckSoftware => Some(BootStep::CheckErrorCount),
            BootStep::CheckErrorCount => Some(BootStep::Configure),
            BootStep::Configure => Some(BootStep::Finish),
            BootStep::Finish => None,
        }
    }

    /// The error-status letter reported when this step fails.
    fn error_status(self) -> u8 {
        match self {
            BootStep::CheckVendor
            | BootStep::CheckProduct
            | BootStep::CheckRevision
            | BootStep::CheckSerial => b'B',
            BootStep::CheckSoftware => b'D',
            BootStep::CheckErrorCount => b'H',
            BootStep::Configure => b'J',
            BootStep::Finish => b'L',
        }
    }

    /// The master-side object holding the expected value, and the slave-side
    /// object uploaded for comparison, for the verification steps.
    fn objects(self) -> Option<(u16, (u16, u8))> {
        match self {
            BootStep::CheckVendor => Some((0x1F85, (0x1018, 1))),
            BootStep::CheckProduct => Some((0x1F86, (0x1018, 2))),
            BootStep::CheckRevision => Some((0x1F87, (0x1018, 3))),
            BootStep::CheckSerial => Some((0x1F88, (0x1018, 4))),
            BootStep::CheckSoftware => Some((0x1F55, (0x1F56, 1))),
            _ => None,
        }
    }
}

struct BootJob {
    step: BootStep,
    assignment: SlaveAssignment,
    /// Expected value for the verification step currently in flight.
    expected: u32,
    timer: Option<TimerHandle>,
}

/// The boot engine: one concurrent job per slave, serialized per slave by
/// construction (a job advances only on its own completions).
#[derive(Default)]
pub struct BootEngine {
    jobs: BTreeMap<NodeId, BootJob>,
}

impl BootEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_booting(&self, node: NodeId) -> bool {
        self.jobs.contains_key(&node)
    }

    fn timeout_us(od: &ObjectDictionary) -> u64 {
        match od.read_u32(0x1F89, 0) {
            Some(0) | None => DEFAULT_BOOT_TIMEOUT_US,
            Some(ms) => ms as u64 * 1000,
        }
    }

    /// Starts the procedure for `node` after its boot-up frame.
    ///
    /// `assignment` is the slave's 0x1F81 entry; a node without one is
    /// rejected with status 'A'.
    pub fn start(
        &mut self,
        od: &ObjectDictionary,
        node: NodeId,
        assignment: Option<SlaveAssignment>,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> (Vec<BootRequest>, Vec<BootOutcome>) {
        let Some(assignment) = assignment else {
            warn!("[NMT] boot-up from unconfigured node {}", node);
            return (Vec::new(), alloc::vec![BootOutcome { node, es: b'A' }]);
        };
        if self.jobs.contains_key(&node) {
            debug!("[NMT] node {} rebooted mid-procedure; restarting", node);
            self.abort_job(node, timers);
        }
        info!("[NMT] booting slave {}", node);
        let mut job = BootJob {
            step: BootStep::CheckVendor,
            assignment,
            expected: 0,
            timer: None,
        };
        let requests = self.advance(od, node, &mut job, timers, now);
        match requests {
            Advance::Requests(requests) => {
                self.jobs.insert(node, job);
                (requests, Vec::new())
            }
            Advance::Done => (
                alloc::vec![BootRequest::StartSlave],
                alloc::vec![BootOutcome { node, es: 0 }],
            ),
        }
    }

    /// An SDO completion for the slave's in-flight boot request arrived.
    pub fn on_sdo_result(
        &mut self,
        od: &ObjectDictionary,
        node: NodeId,
        result: &SdoResult,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> (Vec<BootRequest>, Vec<BootOutcome>) {
        let Some(mut job) = self.jobs.remove(&node) else {
            return (Vec::new(), Vec::new());
        };
        if let Some(handle) = job.timer.take() {
            timers.cancel(handle);
        }

        let step = job.step;
        let verdict = match result {
            Err(_) => Err(step.error_status()),
            Ok(data) => match step {
                BootStep::CheckVendor
                | BootStep::CheckProduct
                | BootStep::CheckRevision
                | BootStep::CheckSerial
                | BootStep::CheckSoftware => {
                    let actual = u32_from_upload(data);
                    if actual == Some(job.expected) {
                        Ok(())
                    } else {
                        warn!(
                            "[NMT] node {} {:?} mismatch: expected {:#010X}, got {:?}",
                            node, step, job.expected, actual
                        );
                        Err(step.error_status())
                    }
                }
                BootStep::CheckErrorCount => {
                    let count = data.first().copied().unwrap_or(0);
                    if count > 0 && job.assignment.error_not_recoverable() {
                        warn!(
                            "[NMT] node {} reports {} stored error(s), not recoverable",
                            node, count
                        );
                        Err(b'H')
                    } else {
                        Ok(())
                    }
                }
                BootStep::Configure => Ok(()),
                BootStep::Finish => Ok(()),
            },
        };

        match verdict {
            Err(es) => {
                let mut requests = Vec::new();
                if step == BootStep::CheckErrorCount {
                    requests.push(BootRequest::ResumeErrorControl);
                }
                (requests, alloc::vec![BootOutcome { node, es }])
            }
            Ok(()) => {
                job.step = match step.next() {
                    Some(next) => next,
                    None => {
                        return (
                            alloc::vec![BootRequest::StartSlave],
                            alloc::vec![BootOutcome { node, es: 0 }],
                        );
                    }
                };
                let mut requests = Vec::new();
                if step == BootStep::CheckErrorCount {
                    // The history was inspected; monitoring may resume.
                    requests.push(BootRequest::ResumeErrorControl);
                }
                match self.advance(od, node, &mut job, timers, now) {
                    Advance::Requests(more) => {
                        requests.extend(more);
                        self.jobs.insert(node, job);
                        (requests, Vec::new())
                    }
                    Advance::Done => {
                        requests.push(BootRequest::StartSlave);
                        (requests, alloc::vec![BootOutcome { node, es: 0 }])
                    }
                }
            }
        }
    }

    /// The per-step timeout of `node` fired.
    pub fn on_timeout(&mut self, node: NodeId) -> Vec<BootOutcome> {
        let Some(job) = self.jobs.remove(&node) else {
            return Vec::new();
        };
        warn!("[NMT] boot step {:?} of node {} timed out", job.step, node);
        alloc::vec![BootOutcome {
            node,
            es: job.step.error_status(),
        }]
    }

    /// Bus-off: every running job fails with status 'K'.
    pub fn on_bus_off(&mut self, timers: &mut TimerQueue<TimerEvent>) -> Vec<BootOutcome> {
        let mut outcomes = Vec::new();
        for (node, mut job) in core::mem::take(&mut self.jobs) {
            if let Some(handle) = job.timer.take() {
                timers.cancel(handle);
            }
            outcomes.push(BootOutcome { node, es: b'K' });
        }
        outcomes
    }

    /// Drops a job without reporting, e.g. when the slave reboots.
    pub fn abort_job(&mut self, node: NodeId, timers: &mut TimerQueue<TimerEvent>) {
        if let Some(mut job) = self.jobs.remove(&node) {
            if let Some(handle) = job.timer.take() {
                timers.cancel(handle);
            }
        }
    }

    /// Moves the job forward from `job.step`, skipping steps with nothing
    /// configured, until a request goes out or the procedure finishes.
    fn advance(
        &mut self,
        od: &ObjectDictionary,
        node: NodeId,
        job: &mut BootJob,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> Advance {
        loop {
            match job.step {
                BootStep::CheckVendor
                | BootStep::CheckProduct
                | BootStep::CheckRevision
                | BootStep::CheckSerial
                | BootStep::CheckSoftware => {
                    let (expected_index, (index, sub_index)) =
                        job.step.objects().expect("verification step");
                    let expected = od.read_u32(expected_index, node.0).unwrap_or(0);
                    if expected == 0 {
                        // Nothing configured: the check is skipped.
                        match job.step.next() {
                            Some(next) => {
                                job.step = next;
                                continue;
                            }
                            None => return Advance::Done,
                        }
                    }
                    job.expected = expected;
                    self.arm(od, job, node, timers, now);
                    return Advance::Requests(alloc::vec![BootRequest::Upload {
                        index,
                        sub_index
                    }]);
                }
                BootStep::CheckErrorCount => {
                    self.arm(od, job, node, timers, now);
                    return Advance::Requests(alloc::vec![
                        BootRequest::SuspendErrorControl,
                        BootRequest::Upload {
                            index: 0x1003,
                            sub_index: 0,
                        },
                    ]);
                }
                BootStep::Configure => {
                    let dcf = match od.read(0x1F22, node.0) {
                        Some(Cow::Borrowed(ObjectValue::Domain(data))) if !data.is_empty() => {
                            data.clone()
                        }
                        _ => {
                            job.step = BootStep::Finish;
                            continue;
                        }
                    };
                    debug!(
                        "[NMT] downloading {} byte(s) of configuration to node {}",
                        dcf.len(),
                        node
                    );
                    self.arm(od, job, node, timers, now);
                    return Advance::Requests(alloc::vec![BootRequest::DownloadDcf(dcf)]);
                }
                BootStep::Finish => return Advance::Done,
            }
        }
    }

    fn arm(
        &mut self,
        od: &ObjectDictionary,
        job: &mut BootJob,
        node: NodeId,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) {
        if let Some(handle) = job.timer.take() {
            timers.cancel(handle);
        }
        job.timer = Some(timers.schedule(now + Self::timeout_us(od), TimerEvent::BootStep(node)));
    }
}

enum Advance {
    Requests(Vec<BootRequest>),
    Done,
}

fn u32_from_upload(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::CanOpenError;
    use crate::od;

    fn boot_od() -> ObjectDictionary {
        let mut dictionary = ObjectDictionary::new();
        od::predefined::populate(&mut dictionary, NodeId(1));
        // Expected identity of slave 2: 0x360 / 0x2 / 0x3 / 0x4.
        dictionary
            .write(0x1F85, 2, ObjectValue::Unsigned32(0x360))
            .unwrap();
        dictionary
            .write(0x1F86, 2, ObjectValue::Unsigned32(0x2))
            .unwrap();
        dictionary
            .write(0x1F87, 2, ObjectValue::Unsigned32(0x3))
            .unwrap();
        dictionary
            .write(0x1F88, 2, ObjectValue::Unsigned32(0x4))
            .unwrap();
        dictionary
    }

    fn ok_u32(value: u32) -> SdoResult {
        Ok(value.to_le_bytes().to_vec())
    }

    #[test]
    fn test_unconfigured_node_fails_with_a() {
        let dictionary = boot_od();
        let mut timers = TimerQueue::new();
        let mut engine = BootEngine::new();
        let (requests, outcomes) =
            engine.start(&dictionary, NodeId(9), None, &mut timers, 0);
        assert!(requests.is_empty());
        assert_eq!(outcomes, alloc::vec![BootOutcome { node: NodeId(9), es: b'A' }]);
    }

    #[test]
    fn test_successful_boot_walks_identity() {
        let dictionary = boot_od();
        let mut timers = TimerQueue::new();
        let mut engine = BootEngine::new();
        let node = NodeId(2);
        let assignment = Some(SlaveAssignment(0x01));

        let (requests, outcomes) = engine.start(&dictionary, node, assignment, &mut timers, 0);
        assert!(outcomes.is_empty());
        assert_eq!(
            requests,
            alloc::vec![BootRequest::Upload {
                index: 0x1018,
                sub_index: 1
            }]
        );

        // Vendor, product, revision, serial in order.
        let (requests, _) =
            engine.on_sdo_result(&dictionary, node, &ok_u32(0x360), &mut timers, 1);
        assert_eq!(
            requests,
            alloc::vec![BootRequest::Upload {
                index: 0x1018,
                sub_index: 2
            }]
        );
        let (requests, _) = engine.on_sdo_result(&dictionary, node, &ok_u32(0x2), &mut timers, 2);
        assert_eq!(
            requests,
            alloc::vec![BootRequest::Upload {
                index: 0x1018,
                sub_index: 3
            }]
        );
        let (requests, _) = engine.on_sdo_result(&dictionary, node, &ok_u32(0x3), &mut timers, 3);
        assert_eq!(
            requests,
            alloc::vec![BootRequest::Upload {
                index: 0x1018,
                sub_index: 4
            }]
        );

        // Serial matches; no software check or DCF configured, error check
        // runs, then the slave is started.
        let (requests, outcomes) =
            engine.on_sdo_result(&dictionary, node, &ok_u32(0x4), &mut timers, 4);
        assert!(outcomes.is_empty());
        assert_eq!(
            requests,
            alloc::vec![
                BootRequest::SuspendErrorControl,
                BootRequest::Upload {
                    index: 0x1003,
                    sub_index: 0
                }
            ]
        );

        // Empty error history.
        let (requests, outcomes) =
            engine.on_sdo_result(&dictionary, node, &Ok(alloc::vec![0]), &mut timers, 5);
        assert_eq!(
            requests,
            alloc::vec![BootRequest::ResumeErrorControl, BootRequest::StartSlave]
        );
        assert_eq!(outcomes, alloc::vec![BootOutcome { node, es: 0 }]);
        assert!(!engine.is_booting(node));
    }

    #[test]
    fn test_identity_mismatch_yields_b() {
        let dictionary = boot_od();
        let mut timers = TimerQueue::new();
        let mut engine = BootEngine::new();
        let node = NodeId(2);

        engine.start(&dictionary, node, Some(SlaveAssignment(0x01)), &mut timers, 0);
        let (_, outcomes) =
            engine.on_sdo_result(&dictionary, node, &ok_u32(0x999), &mut timers, 1);
        assert_eq!(outcomes, alloc::vec![BootOutcome { node, es: b'B' }]);
    }

    #[test]
    fn test_software_mismatch_yields_d() {
        let mut dictionary = boot_od();
        dictionary
            .write(0x1F55, 2, ObjectValue::Unsigned32(0x0102_0304))
            .unwrap();
        let mut timers = TimerQueue::new();
        let mut engine = BootEngine::new();
        let node = NodeId(2);

        engine.start(&dictionary, node, Some(SlaveAssignment(0x01)), &mut timers, 0);
        for value in [0x360u32, 0x2, 0x3, 0x4] {
            engine.on_sdo_result(&dictionary, node, &ok_u32(value), &mut timers, 1);
        }
        // The software check is now in flight (slave object 0x1F56:1).
        let (_, outcomes) =
            engine.on_sdo_result(&dictionary, node, &ok_u32(0xBAD), &mut timers, 2);
        assert_eq!(outcomes, alloc::vec![BootOutcome { node, es: b'D' }]);
    }

    #[test]
    fn test_error_history_not_recoverable_yields_h() {
        let dictionary = boot_od();
        let mut timers = TimerQueue::new();
        let mut engine = BootEngine::new();
        let node = NodeId(2);

        // Bit 2: errors are not recoverable.
        engine.start(&dictionary, node, Some(SlaveAssignment(0x05)), &mut timers, 0);
        for value in [0x360u32, 0x2, 0x3, 0x4] {
            engine.on_sdo_result(&dictionary, node, &ok_u32(value), &mut timers, 1);
        }
        let (requests, outcomes) =
            engine.on_sdo_result(&dictionary, node, &Ok(alloc::vec![2]), &mut timers, 2);
        assert_eq!(requests, alloc::vec![BootRequest::ResumeErrorControl]);
        assert_eq!(outcomes, alloc::vec![BootOutcome { node, es: b'H' }]);
    }

    #[test]
    fn test_dcf_failure_yields_j() {
        let mut dictionary = boot_od();
        let mut dcf = Vec::new();
        dcf.extend_from_slice(&1u32.to_le_bytes());
        dcf.extend_from_slice(&0x1017u16.to_le_bytes());
        dcf.push(0);
        dcf.extend_from_slice(&2u32.to_le_bytes());
        dcf.extend_from_slice(&100u16.to_le_bytes());
        dictionary
            .write(0x1F22, 2, ObjectValue::Domain(dcf.clone()))
            .unwrap();

        let mut timers = TimerQueue::new();
        let mut engine = BootEngine::new();
        let node = NodeId(2);

        engine.start(&dictionary, node, Some(SlaveAssignment(0x01)), &mut timers, 0);
        for value in [0x360u32, 0x2, 0x3, 0x4] {
            engine.on_sdo_result(&dictionary, node, &ok_u32(value), &mut timers, 1);
        }
        // Error history clean; the configure step goes out.
        let (requests, _) =
            engine.on_sdo_result(&dictionary, node, &Ok(alloc::vec![0]), &mut timers, 2);
        assert!(requests.contains(&BootRequest::DownloadDcf(dcf)));

        let (_, outcomes) = engine.on_sdo_result(
            &dictionary,
            node,
            &Err(CanOpenError::Timeout),
            &mut timers,
            3,
        );
        assert_eq!(outcomes, alloc::vec![BootOutcome { node, es: b'J' }]);
    }

    #[test]
    fn test_step_timeout_reports_step_letter() {
        let dictionary = boot_od();
        let mut timers = TimerQueue::new();
        let mut engine = BootEngine::new();
        let node = NodeId(2);

        engine.start(&dictionary, node, Some(SlaveAssignment(0x01)), &mut timers, 0);
        assert_eq!(
            timers.pop_due(DEFAULT_BOOT_TIMEOUT_US),
            Some(TimerEvent::BootStep(node))
        );
        assert_eq!(
            engine.on_timeout(node),
            alloc::vec![BootOutcome { node, es: b'B' }]
        );
    }

    #[test]
    fn test_bus_off_reports_k() {
        let dictionary = boot_od();
        let mut timers = TimerQueue::new();
        let mut engine = BootEngine::new();
        engine.start(&dictionary, NodeId(2), Some(SlaveAssignment(0x01)), &mut timers, 0);
        assert_eq!(
            engine.on_bus_off(&mut timers),
            alloc::vec![BootOutcome {
                node: NodeId(2),
                es: b'K'
            }]
        );
    }
}
