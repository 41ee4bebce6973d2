use serde::{Deserialize, Serialize};

/// Identifies one physical band peer. Real transports use the 48-bit
/// device address widened to 64 bits; tests pick small integers.
pub type PeerId = u64;

/// Logical player number. Zero is reserved for "not associated".
pub type PlayerId = u32;

/// Bit set of gesture ids (bit `n` set = gesture `n`).
pub type GestureMask = u64;

/// One inertial sample as delivered by a band.
///
/// Timestamps are in the band's own clock domain; the clock sync protocol
/// is what makes them comparable across bands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandSample {
    pub timestamp: i64,
    pub gx: i16,
    pub gy: i16,
    pub gz: i16,
    pub ax: i16,
    pub ay: i16,
    pub az: i16,
}

impl BandSample {
    /// Wire size of one sample packet.
    pub const WIRE_SIZE: usize = 16;

    /// Parse a 16-byte little-endian sample packet:
    /// u32 timestamp, then gyro x/y/z and accel x/y/z as i16.
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < Self::WIRE_SIZE {
            anyhow::bail!("sample packet too short: {} bytes", data.len());
        }

        let le16 = |off: usize| i16::from_le_bytes([data[off], data[off + 1]]);

        Ok(Self {
            timestamp: i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64,
            gx: le16(4),
            gy: le16(6),
            gz: le16(8),
            ax: le16(10),
            ay: le16(12),
            az: le16(14),
        })
    }
}

/// One recognized gesture occurrence from the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GestureEvent {
    /// Band-domain timestamp of the recognition.
    pub timestamp: i64,
    /// Gesture id, see [`crate::domain::gestures`].
    pub gesture: u32,
}

/// Where on the body a band is strapped. A player has at most one band
/// per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageSlot {
    LeftHand = 0,
    RightHand = 1,
    LeftLeg = 2,
    RightLeg = 3,
    Torso = 4,
}

impl UsageSlot {
    /// Bit position used in attached-slot bitmasks.
    pub fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::LeftHand => "left hand",
            Self::RightHand => "right hand",
            Self::LeftLeg => "left leg",
            Self::RightLeg => "right leg",
            Self::Torso => "torso",
        }
    }
}

/// Clock sync state of a peer as surfaced to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Capability discovery showed the peer cannot take part in clock sync.
    Unsupported,
    /// The negotiation sequence is still running.
    Negotiating,
    /// Slave peer that has seen its first counter notification.
    Synced,
    /// This peer supplies the shared time base.
    Master,
}

/// Zero-offset calibration state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStatus {
    /// The peer has no readable zero-offset attribute.
    Unavailable,
    /// Offset is all zeros (or a write is still in flight).
    Pending,
    Ok,
}

/// Structured events for the presentation layer.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    BandFound { peer: PeerId, identity: String },
    BandLost { peer: PeerId },
    PlayerListChanged { players: Vec<PlayerId> },
    RoundStarted { gesture: u32 },
    PlayerHit { player: PlayerId },
    /// `winner` is `None` when nobody completed a single gesture.
    MatchFinished { winner: Option<PlayerId> },
    SyncStatusChanged { peer: PeerId, status: SyncStatus },
    CalibrationChanged { peer: PeerId, status: CalibrationStatus },
    SampleData { peer: PeerId, sample: BandSample },
}

/// Internal signals posted onto the engine loop by the scheduler's
/// asynchronous collaborators (player sample paths, the round timer).
#[derive(Debug, Clone, Copy)]
pub enum GameSignal {
    PlayerHit(PlayerId),
    RoundTimeout { seq: u64 },
}
