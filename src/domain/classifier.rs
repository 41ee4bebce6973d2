//! Adapter surface for the native gesture-recognition engine.
//!
//! The engine itself is an external component; the core only depends on
//! this trait. Each player owns an independent classifier instance so
//! detection state never bleeds between players.

use crate::domain::models::{BandSample, GestureEvent, GestureMask, UsageSlot};

pub trait GestureClassifier: Send {
    /// Gestures realizable with the given attached-slot bitmask
    /// (see [`UsageSlot::bit`]). Deterministic for a given mask.
    fn available_gestures(&self, slot_mask: u8) -> GestureMask;

    /// Restrict which gestures the classifier reports.
    fn set_enabled(&mut self, mask: GestureMask);

    /// Feed one raw sample from one slot; returns zero or more
    /// recognized gestures.
    fn process(&mut self, slot: UsageSlot, sample: &BandSample) -> Vec<GestureEvent>;

    /// Drop any in-progress detection state.
    fn reset(&mut self);
}

/// Creates one classifier per player.
pub trait ClassifierFactory: Send + Sync {
    fn create(&self) -> Box<dyn GestureClassifier>;
}

impl<F> ClassifierFactory for F
where
    F: Fn() -> Box<dyn GestureClassifier> + Send + Sync,
{
    fn create(&self) -> Box<dyn GestureClassifier> {
        self()
    }
}
