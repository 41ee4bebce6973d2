#![allow(dead_code)]

use bandgame_core::domain::classifier::{ClassifierFactory, GestureClassifier};
use bandgame_core::domain::models::{
    BandSample, CoreEvent, GestureEvent, GestureMask, UsageSlot,
};
use bandgame_core::infrastructure::transport::{
    Attribute, AttributeSet, CommandStatus, LinkError, LinkEvents, PeerLink,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Every attribute a real band exposes.
pub fn full_caps() -> AttributeSet {
    AttributeSet::new()
        .with(Attribute::InertiaData)
        .with(Attribute::InertiaZero)
        .with(Attribute::VibeControl)
        .with(Attribute::TimesyncGroup)
        .with(Attribute::TimesyncMode)
        .with(Attribute::TimesyncCounter)
}

/// A 16-byte inertia packet whose gyro-x field smuggles the gesture id
/// the scripted classifier should report.
pub fn sample_bytes(timestamp: i64, gesture: u32) -> Vec<u8> {
    let mut data = vec![0u8; BandSample::WIRE_SIZE];
    data[0..4].copy_from_slice(&(timestamp as i32).to_le_bytes());
    data[4..6].copy_from_slice(&(gesture as i16).to_le_bytes());
    data
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedOp {
    Read(Attribute),
    Write(Attribute, Vec<u8>),
    SetNotify(Attribute, bool),
}

impl RecordedOp {
    pub fn attribute(&self) -> Attribute {
        match self {
            Self::Read(attr) => *attr,
            Self::Write(attr, _) => *attr,
            Self::SetNotify(attr, _) => *attr,
        }
    }

    pub fn is_sync(&self) -> bool {
        matches!(
            self.attribute(),
            Attribute::TimesyncGroup | Attribute::TimesyncMode | Attribute::TimesyncCounter
        )
    }
}

#[derive(Default)]
struct LinkState {
    events: Option<Arc<dyn LinkEvents>>,
    ops: Vec<RecordedOp>,
    pending: VecDeque<RecordedOp>,
}

/// Scripted stand-in for the wireless link. `auto` mode answers every
/// submission with an immediate success; `manual` mode records pending
/// operations for the test to complete one by one.
pub struct MockLink {
    caps: AttributeSet,
    auto_complete: bool,
    read_values: Mutex<HashMap<Attribute, Vec<u8>>>,
    state: Mutex<LinkState>,
}

impl MockLink {
    pub fn auto(caps: AttributeSet) -> Arc<Self> {
        Self::build(caps, true)
    }

    pub fn manual(caps: AttributeSet) -> Arc<Self> {
        Self::build(caps, false)
    }

    fn build(caps: AttributeSet, auto_complete: bool) -> Arc<Self> {
        let mut read_values = HashMap::new();
        // A calibrated band: nonzero stored offset.
        read_values.insert(Attribute::InertiaZero, vec![1u8; 12]);
        Arc::new(Self {
            caps,
            auto_complete,
            read_values: Mutex::new(read_values),
            state: Mutex::new(LinkState::default()),
        })
    }

    pub fn set_read_value(&self, attr: Attribute, value: Vec<u8>) {
        self.read_values.lock().unwrap().insert(attr, value);
    }

    /// All submissions seen so far, in order.
    pub fn ops(&self) -> Vec<RecordedOp> {
        self.state.lock().unwrap().ops.clone()
    }

    /// Only the clock-sync submissions.
    pub fn sync_ops(&self) -> Vec<RecordedOp> {
        self.ops().into_iter().filter(RecordedOp::is_sync).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    fn events(&self) -> Option<Arc<dyn LinkEvents>> {
        self.state.lock().unwrap().events.clone()
    }

    /// Deliver an unsolicited change notification.
    pub fn notify(&self, attr: Attribute, value: &[u8]) {
        if let Some(events) = self.events() {
            events.on_attribute_changed(attr, value);
        }
    }

    pub fn disconnect(&self) {
        if let Some(events) = self.events() {
            events.on_connection_changed(false);
        }
    }

    /// Manual mode: complete the oldest outstanding operation.
    pub fn complete_next(&self, status: CommandStatus) {
        let (op, events) = {
            let mut state = self.state.lock().unwrap();
            let op = state.pending.pop_front().expect("no pending operation");
            let events = state.events.clone().expect("link not opened");
            (op, events)
        };
        let value = match (&op, status) {
            (RecordedOp::Read(attr), CommandStatus::Success) => Some(self.read_value(*attr)),
            _ => None,
        };
        events.on_operation_complete(status, value);
    }

    fn read_value(&self, attr: Attribute) -> Vec<u8> {
        self.read_values
            .lock()
            .unwrap()
            .get(&attr)
            .cloned()
            .unwrap_or_else(|| vec![0])
    }

    fn submit(&self, op: RecordedOp) -> Result<(), LinkError> {
        let events = {
            let mut state = self.state.lock().unwrap();
            state.ops.push(op.clone());
            if !self.auto_complete {
                state.pending.push_back(op);
                return Ok(());
            }
            state.events.clone()
        };
        if let Some(events) = events {
            let value = match &op {
                RecordedOp::Read(attr) => Some(self.read_value(*attr)),
                _ => None,
            };
            events.on_operation_complete(CommandStatus::Success, value);
        }
        Ok(())
    }
}

impl PeerLink for MockLink {
    fn open(&self, events: Arc<dyn LinkEvents>) -> Result<(), LinkError> {
        self.state.lock().unwrap().events = Some(events.clone());
        events.on_connection_changed(true);
        events.on_capabilities(self.caps.clone());
        Ok(())
    }

    fn read(&self, attr: Attribute) -> Result<(), LinkError> {
        self.submit(RecordedOp::Read(attr))
    }

    fn write(&self, attr: Attribute, value: &[u8]) -> Result<(), LinkError> {
        self.submit(RecordedOp::Write(attr, value.to_vec()))
    }

    fn set_notify(&self, attr: Attribute, enable: bool) -> Result<(), LinkError> {
        self.submit(RecordedOp::SetNotify(attr, enable))
    }

    fn close(&self) {}
}

/// Scripted classifier: reports the gesture id carried in a sample's
/// gyro-x field, as long as it is enabled. Availability is a fixed
/// function of the attached slots, mirroring the regions of the real
/// gesture table.
pub struct FakeClassifier {
    enabled: GestureMask,
}

/// Gestures realizable with the given slot mask: ids 1..=5 for the left
/// hand, 6..=10 for the right, 11..=15 with both hands, 16..=18 / 19..=21
/// / 22..=24 for legs, squat (25) with a torso band.
pub fn availability(slot_mask: u8) -> GestureMask {
    let has = |slot: UsageSlot| slot_mask & slot.bit() != 0;
    let mut mask = 0u64;
    if has(UsageSlot::LeftHand) {
        mask |= 0x3e;
    }
    if has(UsageSlot::RightHand) {
        mask |= 0x7c0;
    }
    if has(UsageSlot::LeftHand) && has(UsageSlot::RightHand) {
        mask |= 0xf800;
    }
    if has(UsageSlot::LeftLeg) {
        mask |= 0x7_0000;
    }
    if has(UsageSlot::RightLeg) {
        mask |= 0x38_0000;
    }
    if has(UsageSlot::LeftLeg) && has(UsageSlot::RightLeg) {
        mask |= 0x1c0_0000;
    }
    if has(UsageSlot::Torso) {
        mask |= 1 << 25;
    }
    mask
}

impl GestureClassifier for FakeClassifier {
    fn available_gestures(&self, slot_mask: u8) -> GestureMask {
        availability(slot_mask)
    }

    fn set_enabled(&mut self, mask: GestureMask) {
        self.enabled = mask;
    }

    fn process(&mut self, _slot: UsageSlot, sample: &BandSample) -> Vec<GestureEvent> {
        let id = sample.gx;
        if id > 0 && id < 64 && self.enabled & (1u64 << id) != 0 {
            vec![GestureEvent {
                timestamp: sample.timestamp,
                gesture: id as u32,
            }]
        } else {
            Vec::new()
        }
    }

    fn reset(&mut self) {}
}

pub struct FakeClassifierFactory;

impl ClassifierFactory for FakeClassifierFactory {
    fn create(&self) -> Box<dyn GestureClassifier> {
        Box::new(FakeClassifier { enabled: 0 })
    }
}

/// Await the next event matching `pred`, skipping everything else.
pub async fn wait_for_event<F>(
    events: &mut UnboundedReceiver<CoreEvent>,
    mut pred: F,
) -> CoreEvent
where
    F: FnMut(&CoreEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("timed out waiting for core event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Pop the next already-queued `RoundStarted` gesture without awaiting.
pub fn queued_round_gesture(events: &mut UnboundedReceiver<CoreEvent>) -> u32 {
    loop {
        match events.try_recv() {
            Ok(CoreEvent::RoundStarted { gesture }) => return gesture,
            Ok(_) => continue,
            Err(_) => panic!("no RoundStarted event queued"),
        }
    }
}

/// Pop the next already-queued `MatchFinished` outcome without awaiting.
pub fn queued_match_result(
    events: &mut UnboundedReceiver<CoreEvent>,
) -> Option<bandgame_core::domain::models::PlayerId> {
    loop {
        match events.try_recv() {
            Ok(CoreEvent::MatchFinished { winner }) => return winner,
            Ok(_) => continue,
            Err(_) => panic!("no MatchFinished event queued"),
        }
    }
}
