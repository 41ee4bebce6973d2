//! One connected band peer.
//!
//! A `BandDevice` owns the peer's command queue and clock-sync session,
//! checks capabilities after discovery, parses inertial packets, and
//! drives the sync negotiation step by step. Sample delivery happens on
//! the transport's own context; everything that needs the main loop is
//! forwarded through channels.

use crate::domain::models::{BandSample, CalibrationStatus, CoreEvent, PeerId, SyncStatus};
use crate::domain::settings::SyncFailurePolicy;
use crate::infrastructure::manager::BandManager;
use crate::infrastructure::queue::{CommandQueue, Operation};
use crate::infrastructure::timesync::{
    ClockRole, SyncPhase, SyncSession, SyncSlot, MODE_DISABLED, MODE_MASTER, MODE_SLAVE,
};
use crate::infrastructure::transport::{
    Attribute, AttributeSet, CommandStatus, LinkError, LinkEvents, PeerLink,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Attributes a peer must expose to count as a band at all.
pub const BAND_ATTRIBUTES: [Attribute; 1] = [Attribute::InertiaData];

/// Attributes a peer must expose to take part in clock sync.
pub const SYNC_ATTRIBUTES: [Attribute; 3] = [
    Attribute::TimesyncGroup,
    Attribute::TimesyncMode,
    Attribute::TimesyncCounter,
];

/// Byte length of the zero-offset calibration block.
pub const ZERO_OFFSET_LEN: usize = 12;

/// Longest pulse pattern the vibe attribute takes in one write.
pub const MAX_PULSE_LEN: usize = 8;

/// Connection lifecycle of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Disconnected,
    Connecting,
    Discovering,
    Ready,
    Lost,
}

/// Installed by the player aggregation to tap the raw sample stream.
/// Invoked on the transport's delivery context, not the main loop.
pub type SampleHook = Box<dyn Fn(&BandSample) + Send + Sync>;

pub struct BandDevice {
    peer: PeerId,
    name: String,
    link: Arc<dyn PeerLink>,
    queue: CommandQueue,
    manager: Weak<BandManager>,
    events: UnboundedSender<CoreEvent>,
    self_ref: Weak<BandDevice>,
    phase: Mutex<PeerPhase>,
    caps: Mutex<AttributeSet>,
    sync: Mutex<SyncSlot>,
    calibration: Mutex<CalibrationStatus>,
    listening: AtomicBool,
    sample_hook: Mutex<Option<SampleHook>>,
}

impl BandDevice {
    pub(crate) fn new(
        peer: PeerId,
        name: String,
        link: Arc<dyn PeerLink>,
        manager: Weak<BandManager>,
        events: UnboundedSender<CoreEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            peer,
            name,
            queue: CommandQueue::new(link.clone()),
            link,
            manager,
            events,
            self_ref: self_ref.clone(),
            phase: Mutex::new(PeerPhase::Disconnected),
            caps: Mutex::new(AttributeSet::new()),
            sync: Mutex::new(SyncSlot::Pending),
            calibration: Mutex::new(CalibrationStatus::Unavailable),
            listening: AtomicBool::new(false),
            sample_hook: Mutex::new(None),
        })
    }

    pub(crate) fn open(self: &Arc<Self>) -> Result<(), LinkError> {
        *self.phase.lock().unwrap() = PeerPhase::Connecting;
        info!("{}: connecting", self.identity());
        self.link.open(self.clone())
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn identity(&self) -> String {
        format!("{} ({:#x})", self.name, self.peer)
    }

    pub fn phase(&self) -> PeerPhase {
        *self.phase.lock().unwrap()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync.lock().unwrap().status()
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        *self.calibration.lock().unwrap()
    }

    /// Install or clear the raw-sample tap.
    pub fn set_sample_hook(&self, hook: Option<SampleHook>) {
        *self.sample_hook.lock().unwrap() = hook;
    }

    /// Turn the inertial sample stream on.
    pub fn start_listening(&self) {
        if self.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue
            .enqueue(Operation::SetNotify(Attribute::InertiaData, true), None);
    }

    pub fn stop_listening(&self) {
        if !self.listening.swap(false, Ordering::SeqCst) {
            return;
        }
        self.queue
            .enqueue(Operation::SetNotify(Attribute::InertiaData, false), None);
    }

    /// Fire a vibration pattern. Empty patterns are ignored; over-long
    /// ones are rejected. Peers without a motor swallow the call.
    pub fn pulse(&self, pattern: &[u8]) -> anyhow::Result<()> {
        if pattern.is_empty() {
            return Ok(());
        }
        if pattern.len() > MAX_PULSE_LEN {
            anyhow::bail!("pulse pattern longer than {} bytes", MAX_PULSE_LEN);
        }
        if !self.caps.lock().unwrap().contains(Attribute::VibeControl) {
            return Ok(());
        }
        self.queue
            .enqueue(Operation::Write(Attribute::VibeControl, pattern.to_vec()), None);
        Ok(())
    }

    pub(crate) fn cleanup(&self) {
        self.stop_listening();
        self.link.close();
    }

    // ---- calibration -------------------------------------------------

    /// Wipe the stored zero offset so the band recalibrates.
    pub fn reset_calibration(self: &Arc<Self>) {
        if !self.caps.lock().unwrap().contains(Attribute::InertiaZero) {
            warn!("{}: no zero-offset attribute, cannot reset calibration", self.identity());
            return;
        }
        info!("{}: resetting zero-offset calibration", self.identity());
        self.set_calibration(CalibrationStatus::Pending);
        self.write_zero_offset([0u8; ZERO_OFFSET_LEN]);
    }

    fn read_zero_offset(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        self.queue.enqueue(
            Operation::Read(Attribute::InertiaZero),
            Some(Box::new(move |status: CommandStatus, value: Option<Vec<u8>>| {
                let Some(dev) = this.upgrade() else { return };
                let calib = match (status.is_success(), value) {
                    (true, Some(bytes)) => Self::offset_status(&bytes),
                    _ => CalibrationStatus::Unavailable,
                };
                dev.set_calibration(calib);
            })),
        );
    }

    /// Zero-offset writes retry until the band takes them; this is the
    /// one path in the protocol with automatic retry.
    fn write_zero_offset(self: &Arc<Self>, data: [u8; ZERO_OFFSET_LEN]) {
        let this = Arc::downgrade(self);
        self.queue.enqueue(
            Operation::Write(Attribute::InertiaZero, data.to_vec()),
            Some(Box::new(move |status: CommandStatus, _| {
                let Some(dev) = this.upgrade() else { return };
                if status.is_success() {
                    dev.set_calibration(Self::offset_status(&data));
                } else {
                    warn!("{}: zero-offset write failed, retrying", dev.identity());
                    dev.write_zero_offset(data);
                }
            })),
        );
    }

    fn offset_status(bytes: &[u8]) -> CalibrationStatus {
        if bytes.iter().all(|&b| b == 0) {
            CalibrationStatus::Pending
        } else {
            CalibrationStatus::Ok
        }
    }

    fn set_calibration(&self, status: CalibrationStatus) {
        *self.calibration.lock().unwrap() = status;
        let _ = self.events.send(CoreEvent::CalibrationChanged {
            peer: self.peer,
            status,
        });
    }

    // ---- clock sync --------------------------------------------------

    /// Re-run the negotiation after the timing master was lost. Peers
    /// that already subscribed resume from the notifications-enabled
    /// step; re-subscribing is not needed.
    pub(crate) fn restart_sync(self: &Arc<Self>) {
        let phase = {
            let mut sync = self.sync.lock().unwrap();
            match sync.session_mut() {
                None => return,
                Some(session) => {
                    if session.phase == SyncPhase::Initial {
                        SyncPhase::Initial
                    } else {
                        SyncPhase::NotifyEnabled
                    }
                }
            }
        };
        self.advance_sync(phase, CommandStatus::Success);
    }

    /// Enter `phase` and issue the remote operation that gates the next
    /// one. Called with the completion status of the previous step.
    fn advance_sync(self: &Arc<Self>, phase: SyncPhase, status: CommandStatus) {
        if !status.is_success() {
            let policy = self
                .manager
                .upgrade()
                .map(|m| m.sync_failure_policy())
                .unwrap_or(SyncFailurePolicy::Halt);
            match policy {
                SyncFailurePolicy::Halt => {
                    warn!(
                        "{}: timesync step toward {:?} failed, parking the peer",
                        self.identity(),
                        phase
                    );
                    return;
                }
                SyncFailurePolicy::Restart => {
                    warn!(
                        "{}: timesync step toward {:?} failed, restarting negotiation",
                        self.identity(),
                        phase
                    );
                    self.restart_sync();
                    return;
                }
            }
        }

        {
            let mut sync = self.sync.lock().unwrap();
            let Some(session) = sync.session_mut() else { return };
            // Synced is only reachable while waiting in slave mode.
            if phase == SyncPhase::Synced && session.phase != SyncPhase::SlaveMode {
                return;
            }
            session.phase = phase;
        }
        debug!("{}: timesync phase -> {:?}", self.identity(), phase);
        self.emit_sync_status();

        match phase {
            SyncPhase::Initial => self.issue_sync_step(
                Operation::SetNotify(Attribute::TimesyncCounter, true),
                SyncPhase::NotifyEnabled,
            ),
            SyncPhase::NotifyEnabled => self.issue_sync_step(
                Operation::Write(Attribute::TimesyncMode, vec![MODE_DISABLED]),
                SyncPhase::ModeDisabled,
            ),
            SyncPhase::ModeDisabled => self.issue_sync_step(
                Operation::Read(Attribute::TimesyncCounter),
                SyncPhase::CounterObtained,
            ),
            SyncPhase::CounterObtained => {
                let Some(manager) = self.manager.upgrade() else { return };
                self.issue_sync_step(
                    Operation::Write(Attribute::TimesyncGroup, manager.group_token().to_vec()),
                    SyncPhase::GroupAssigned,
                );
            }
            SyncPhase::GroupAssigned => {
                let Some(manager) = self.manager.upgrade() else { return };
                // The election is serialized by the manager: exactly one
                // peer can observe "no master" here.
                let (mode, next) = match manager.claim_role(self.peer) {
                    ClockRole::Master => (MODE_MASTER, SyncPhase::MasterMode),
                    ClockRole::Slave => (MODE_SLAVE, SyncPhase::SlaveMode),
                };
                self.issue_sync_step(
                    Operation::Write(Attribute::TimesyncMode, vec![mode]),
                    next,
                );
            }
            SyncPhase::SlaveMode | SyncPhase::Synced | SyncPhase::MasterMode => {}
        }
    }

    fn issue_sync_step(self: &Arc<Self>, op: Operation, next: SyncPhase) {
        let seq = {
            let mut sync = self.sync.lock().unwrap();
            match sync.session_mut() {
                Some(session) => session.next_seq(),
                None => return,
            }
        };
        let this = Arc::downgrade(self);
        self.queue.enqueue(
            op,
            Some(Box::new(move |status: CommandStatus, value: Option<Vec<u8>>| {
                let Some(dev) = this.upgrade() else { return };
                {
                    let mut sync = dev.sync.lock().unwrap();
                    let Some(session) = sync.session_mut() else { return };
                    if !session.is_current(seq) {
                        debug!("{}: stale timesync completion dropped", dev.identity());
                        return;
                    }
                    if next == SyncPhase::CounterObtained && status.is_success() {
                        if let Some(bytes) = value.as_deref() {
                            session.update_counter(bytes);
                        }
                    }
                }
                dev.advance_sync(next, status);
            })),
        );
    }

    fn emit_sync_status(&self) {
        let status = self.sync_status();
        let _ = self.events.send(CoreEvent::SyncStatusChanged {
            peer: self.peer,
            status,
        });
    }

    // ---- sample path -------------------------------------------------

    fn handle_sample(&self, data: &[u8]) {
        let sample = match BandSample::parse(data) {
            Ok(sample) => sample,
            Err(e) => {
                debug!("{}: bad sample packet: {}", self.identity(), e);
                return;
            }
        };
        let _ = self.events.send(CoreEvent::SampleData {
            peer: self.peer,
            sample,
        });
        if let Some(hook) = self.sample_hook.lock().unwrap().as_ref() {
            hook(&sample);
        }
    }
}

impl LinkEvents for BandDevice {
    fn on_connection_changed(&self, connected: bool) {
        if connected {
            info!("{}: connected, discovering capabilities", self.identity());
            *self.phase.lock().unwrap() = PeerPhase::Discovering;
        } else {
            info!("{}: disconnected", self.identity());
            *self.phase.lock().unwrap() = PeerPhase::Lost;
            if let Some(manager) = self.manager.upgrade() {
                manager.drop_peer(self.peer);
            }
        }
    }

    fn on_capabilities(&self, attrs: AttributeSet) {
        let Some(this) = self.self_ref.upgrade() else { return };

        if !attrs.contains_all(&BAND_ATTRIBUTES) {
            warn!("{}: inertia data attribute missing, not a band", self.identity());
            if let Some(manager) = self.manager.upgrade() {
                manager.drop_peer(self.peer);
            }
            return;
        }

        let sync_capable = attrs.contains_all(&SYNC_ATTRIBUTES);
        let has_zero_offset = attrs.contains(Attribute::InertiaZero);
        *self.caps.lock().unwrap() = attrs;
        *self.phase.lock().unwrap() = PeerPhase::Ready;

        if has_zero_offset {
            this.read_zero_offset();
        } else {
            self.set_calibration(CalibrationStatus::Unavailable);
        }

        {
            let mut sync = self.sync.lock().unwrap();
            if matches!(*sync, SyncSlot::Pending) {
                if sync_capable {
                    *sync = SyncSlot::Active(SyncSession::new());
                } else {
                    warn!("{}: timesync attributes incomplete, sync unsupported", self.identity());
                    *sync = SyncSlot::Unsupported;
                }
            }
        }
        self.emit_sync_status();
        if sync_capable {
            this.advance_sync(SyncPhase::Initial, CommandStatus::Success);
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.peer_ready(self.peer);
        }
    }

    fn on_operation_complete(&self, status: CommandStatus, value: Option<Vec<u8>>) {
        self.queue.operation_finished(status, value);
    }

    fn on_attribute_changed(&self, attr: Attribute, value: &[u8]) {
        match attr {
            Attribute::InertiaData => self.handle_sample(value),
            Attribute::TimesyncCounter => {
                {
                    let mut sync = self.sync.lock().unwrap();
                    match sync.session_mut() {
                        Some(session) => session.update_counter(value),
                        None => return,
                    }
                }
                if let Some(this) = self.self_ref.upgrade() {
                    this.advance_sync(SyncPhase::Synced, CommandStatus::Success);
                }
            }
            other => debug!("{}: unexpected notification for {}", self.identity(), other.name()),
        }
    }
}
