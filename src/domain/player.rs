//! Aggregation of physical bands into one logical player.
//!
//! A player owns its classifier instance and its armed/hit state. The
//! sample path runs on the transport's delivery context and may be
//! entered concurrently from several attached bands, so the wanted-mask
//! check-and-clear happens under the player lock.

use crate::domain::classifier::GestureClassifier;
use crate::domain::gestures::ALL_GESTURES_MASK;
use crate::domain::models::{BandSample, GameSignal, GestureMask, PeerId, PlayerId, UsageSlot};
use crate::infrastructure::band::BandDevice;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

struct Attachment {
    band: Arc<BandDevice>,
    /// Timestamp of the newest sample seen from this band.
    last_ts: Arc<AtomicI64>,
    /// Value of `last_ts` when the current round was armed; hit times
    /// are reported relative to this.
    start_ts: Arc<AtomicI64>,
}

struct ArmedState {
    wanted: GestureMask,
    hit_timestamp: Option<i64>,
}

#[derive(Default)]
struct MatchTotals {
    completed: u32,
    delay_sum: i64,
}

pub struct PlayerState {
    id: PlayerId,
    bands: Mutex<HashMap<UsageSlot, Attachment>>,
    classifier: Mutex<Box<dyn GestureClassifier>>,
    armed: Mutex<ArmedState>,
    totals: Mutex<MatchTotals>,
    signals: UnboundedSender<GameSignal>,
}

impl PlayerState {
    pub fn new(
        id: PlayerId,
        classifier: Box<dyn GestureClassifier>,
        signals: UnboundedSender<GameSignal>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            bands: Mutex::new(HashMap::new()),
            classifier: Mutex::new(classifier),
            armed: Mutex::new(ArmedState {
                wanted: 0,
                hit_timestamp: None,
            }),
            totals: Mutex::new(MatchTotals::default()),
            signals,
        })
    }

    pub fn id(&self) -> PlayerId {
        self.id
    }

    /// Strap a band onto `slot`, replacing any previous occupant.
    pub fn attach(self: &Arc<Self>, band: Arc<BandDevice>, slot: UsageSlot) {
        if let Some(old) = self.bands.lock().unwrap().remove(&slot) {
            old.band.set_sample_hook(None);
        }

        let last_ts = Arc::new(AtomicI64::new(0));
        let start_ts = Arc::new(AtomicI64::new(0));
        let hook_last = last_ts.clone();
        let hook_start = start_ts.clone();
        let player = Arc::downgrade(self);
        band.set_sample_hook(Some(Box::new(move |sample: &BandSample| {
            hook_last.store(sample.timestamp, Ordering::SeqCst);
            if let Some(player) = player.upgrade() {
                player.process_sample(slot, hook_start.load(Ordering::SeqCst), sample);
            }
        })));

        self.bands.lock().unwrap().insert(
            slot,
            Attachment {
                band,
                last_ts,
                start_ts,
            },
        );
    }

    /// Remove the band with this peer id, if attached. Returns whether
    /// anything changed.
    pub fn detach(&self, peer: PeerId) -> bool {
        let mut bands = self.bands.lock().unwrap();
        let slot = bands
            .iter()
            .find(|(_, attachment)| attachment.band.peer() == peer)
            .map(|(slot, _)| *slot);
        match slot {
            Some(slot) => {
                if let Some(attachment) = bands.remove(&slot) {
                    attachment.band.set_sample_hook(None);
                }
                true
            }
            None => false,
        }
    }

    pub fn has_bands(&self) -> bool {
        !self.bands.lock().unwrap().is_empty()
    }

    /// Bitmask of occupied usage slots.
    pub fn bands_present(&self) -> u8 {
        self.bands
            .lock()
            .unwrap()
            .keys()
            .fold(0, |mask, slot| mask | slot.bit())
    }

    /// Gestures this player can perform with the bands currently on.
    pub fn available_gestures(&self) -> GestureMask {
        let slot_mask = self.bands_present();
        self.classifier
            .lock()
            .unwrap()
            .available_gestures(slot_mask)
            & ALL_GESTURES_MASK
    }

    pub fn enable_gestures(&self, mask: GestureMask) {
        self.classifier.lock().unwrap().set_enabled(mask);
    }

    /// Arm the player for a round: fresh detection state, per-band time
    /// bases captured, then the wanted mask goes live.
    pub fn arm(&self, wanted: GestureMask) {
        {
            let bands = self.bands.lock().unwrap();
            for attachment in bands.values() {
                attachment
                    .start_ts
                    .store(attachment.last_ts.load(Ordering::SeqCst), Ordering::SeqCst);
            }
        }
        self.classifier.lock().unwrap().reset();

        let mut armed = self.armed.lock().unwrap();
        armed.wanted = wanted;
        armed.hit_timestamp = None;
    }

    /// Disarm without recording a hit (round over).
    pub fn stop_waiting(&self) {
        self.armed.lock().unwrap().wanted = 0;
    }

    pub fn hit_timestamp(&self) -> Option<i64> {
        self.armed.lock().unwrap().hit_timestamp
    }

    /// Fold this round's hit into the match totals, measured against the
    /// round's earliest hit.
    pub fn update_round_totals(&self, reference: i64) {
        let Some(hit) = self.hit_timestamp() else { return };
        let mut totals = self.totals.lock().unwrap();
        totals.delay_sum += hit - reference;
        totals.completed += 1;
    }

    pub fn completed_hits(&self) -> u32 {
        self.totals.lock().unwrap().completed
    }

    pub fn delay_sum(&self) -> i64 {
        self.totals.lock().unwrap().delay_sum
    }

    fn process_sample(&self, slot: UsageSlot, start_ts: i64, sample: &BandSample) {
        let events = self.classifier.lock().unwrap().process(slot, sample);
        for event in events {
            self.check_gesture(event.gesture, event.timestamp - start_ts);
        }
    }

    /// Check-and-clear against the wanted mask. Bands deliver samples
    /// concurrently; the lock makes sure only one of them scores.
    fn check_gesture(&self, gesture: u32, rel_ts: i64) {
        {
            let mut armed = self.armed.lock().unwrap();
            if gesture >= 64 || (1u64 << gesture) & armed.wanted == 0 {
                return;
            }
            armed.wanted = 0;
            armed.hit_timestamp = Some(rel_ts);
        }
        let _ = self.signals.send(GameSignal::PlayerHit(self.id));
    }

    /// Buzz every band the player wears.
    pub fn pulse_all(&self, pattern: &[u8]) {
        for attachment in self.bands.lock().unwrap().values() {
            if let Err(e) = attachment.band.pulse(pattern) {
                warn!("player {}: pulse failed: {}", self.id, e);
            }
        }
    }

    pub fn cleanup(&self) {
        for (_, attachment) in self.bands.lock().unwrap().drain() {
            attachment.band.set_sample_hook(None);
        }
    }
}
