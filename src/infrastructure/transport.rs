//! Transport abstraction over the wireless link.
//!
//! Real deployments back [`PeerLink`] with an OS Bluetooth stack; tests
//! use a scripted mock. The link is half duplex with a single outstanding
//! operation: submitting an operation either fails synchronously or is
//! answered later by exactly one [`LinkEvents::on_operation_complete`].

use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Remote data points a band exposes. Capability discovery reports which
/// of these a given peer actually has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Notifying attribute carrying raw inertial sample packets.
    InertiaData,
    /// Readable/writable zero-offset calibration block.
    InertiaZero,
    /// Write-only vibration motor control.
    VibeControl,
    /// Shared clock-sync group token.
    TimesyncGroup,
    /// Clock-sync mode selector (disabled/slave/master).
    TimesyncMode,
    /// Rolling clock-sync counter, notifying.
    TimesyncCounter,
}

impl Attribute {
    pub fn name(self) -> &'static str {
        match self {
            Self::InertiaData => "inertia data",
            Self::InertiaZero => "inertia zero offset",
            Self::VibeControl => "vibe control",
            Self::TimesyncGroup => "timesync group",
            Self::TimesyncMode => "timesync mode",
            Self::TimesyncCounter => "timesync counter",
        }
    }
}

/// The set of attributes a peer was discovered to expose.
#[derive(Debug, Clone, Default)]
pub struct AttributeSet {
    attrs: HashSet<Attribute>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, attr: Attribute) -> Self {
        self.attrs.insert(attr);
        self
    }

    pub fn insert(&mut self, attr: Attribute) {
        self.attrs.insert(attr);
    }

    pub fn contains(&self, attr: Attribute) -> bool {
        self.attrs.contains(&attr)
    }

    pub fn contains_all(&self, attrs: &[Attribute]) -> bool {
        attrs.iter().all(|a| self.attrs.contains(a))
    }
}

/// Completion status of one remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Failure,
}

impl CommandStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Synchronous submission failures.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("peer does not expose {}", .0.name())]
    MissingAttribute(Attribute),
    #[error("link is not connected")]
    NotConnected,
    #[error("operation rejected by transport: {0}")]
    Rejected(String),
}

/// One peer's end of the wireless link.
pub trait PeerLink: Send + Sync {
    /// Begin connecting and discovering; `events` receives every
    /// asynchronous signal for this peer from now on.
    fn open(&self, events: Arc<dyn LinkEvents>) -> Result<(), LinkError>;

    /// Submit a read of `attr`. Completion carries the value bytes.
    fn read(&self, attr: Attribute) -> Result<(), LinkError>;

    /// Submit a write of `value` to `attr`.
    fn write(&self, attr: Attribute, value: &[u8]) -> Result<(), LinkError>;

    /// Submit a change-notification toggle for `attr`.
    fn set_notify(&self, attr: Attribute, enable: bool) -> Result<(), LinkError>;

    /// Tear the link down. No further events are expected.
    fn close(&self);
}

/// Asynchronous signals from a [`PeerLink`].
pub trait LinkEvents: Send + Sync {
    fn on_connection_changed(&self, connected: bool);

    /// Capability discovery finished.
    fn on_capabilities(&self, attrs: AttributeSet);

    /// The single outstanding operation finished. `value` is present for
    /// reads that succeeded.
    fn on_operation_complete(&self, status: CommandStatus, value: Option<Vec<u8>>);

    /// Unsolicited change notification.
    fn on_attribute_changed(&self, attr: Attribute, value: &[u8]);
}
