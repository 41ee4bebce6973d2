//! Gesture id space and round-to-round selection rules.
//!
//! Ids and capability masks mirror the native classifier's numbering:
//! arm point gestures come in per-limb blocks of five heights
//! (down/low/level/high/up), leg point gestures in blocks of three
//! (down/low/level). Each region has a third block for gestures performed
//! with both limbs at once.

use crate::domain::models::GestureMask;
use rand::Rng;

/// First arm point gesture ("left hand down").
pub const FIRST_ARM_GESTURE: u32 = 1;
/// First leg point gesture ("left leg down").
pub const FIRST_LEG_GESTURE: u32 = 16;
pub const SQUAT_GESTURE: u32 = 25;
pub const STEERING_WHEEL_GESTURE: u32 = 26;
/// First punch gesture; punches come in blocks of four (any/left/right).
pub const PUNCH_GESTURE: u32 = 29;

/// Heights per limb in the arm region.
pub const ARM_BLOCK: u32 = 5;
/// Heights per limb in the leg region.
pub const LEG_BLOCK: u32 = 3;

/// All point gestures (ids 1..=24).
pub const POINT_GESTURE_MASK: GestureMask = 0x1ff_fffe;
/// Point gestures performed with both limbs (ids 11..=15 and 22..=24).
pub const POINT_ANY_MASK: GestureMask = 0x1c0_f800;
pub const SQUAT_GESTURE_MASK: GestureMask = 1 << SQUAT_GESTURE;
pub const STEERING_WHEEL_MASK: GestureMask = 1 << STEERING_WHEEL_GESTURE;
pub const PUNCHES_MASK: GestureMask = 0x111 << PUNCH_GESTURE;
/// Gestures reported continuously rather than as one-shot hits; the
/// round scheduler never selects these.
pub const CONTINUOUS_GESTURES_MASK: GestureMask = STEERING_WHEEL_MASK | PUNCHES_MASK;
/// Everything the round scheduler may select from.
pub const ALL_GESTURES_MASK: GestureMask = POINT_GESTURE_MASK | SQUAT_GESTURE_MASK;

/// List the set bit positions of a mask, lowest first.
pub fn mask_bits(mask: GestureMask) -> Vec<u32> {
    let mut bits = Vec::with_capacity(mask.count_ones() as usize);
    let mut v = mask;
    let mut i = 0;
    while v != 0 {
        if v & 1 != 0 {
            bits.push(i);
        }
        v >>= 1;
        i += 1;
    }
    bits
}

/// Gestures that must not follow `prev` in the next round: `prev` itself,
/// plus its same-height counterparts. A one-limb gesture excludes the
/// both-limbs variant at its height; a both-limbs gesture excludes the
/// left and right variants at its height.
pub fn excluded_after(prev: u32) -> GestureMask {
    let prev_mask = 1u64 << prev;
    if prev_mask & POINT_GESTURE_MASK == 0 {
        return prev_mask;
    }

    let (block, base) = if prev < FIRST_LEG_GESTURE {
        (ARM_BLOCK, FIRST_ARM_GESTURE)
    } else {
        (LEG_BLOCK, FIRST_LEG_GESTURE)
    };
    let height = (prev - base) % block;

    let same_height = if prev_mask & POINT_ANY_MASK != 0 {
        (1u64 | (1u64 << block)) << (base + height)
    } else {
        1u64 << (base + 2 * block + height)
    };
    prev_mask | same_height
}

/// Pick the next round's gesture uniformly from `allowed`, avoiding
/// `prev` and its same-height counterparts. When the exclusion empties
/// the pool, fall back to the unrestricted set. `None` only when
/// `allowed` itself is empty.
pub fn pick_gesture<R: Rng + ?Sized>(allowed: GestureMask, prev: u32, rng: &mut R) -> Option<u32> {
    if allowed == 0 {
        return None;
    }

    let invalid = excluded_after(prev);
    let pool = if allowed & !invalid == 0 {
        allowed
    } else {
        allowed & !invalid
    };

    let bits = mask_bits(pool);
    Some(bits[rng.gen_range(0..bits.len())])
}

/// Human-readable gesture name for logs and announcements.
pub fn gesture_name(id: u32) -> &'static str {
    match id {
        1 => "left hand down",
        2 => "left hand low",
        3 => "left hand level",
        4 => "left hand high",
        5 => "left hand up",
        6 => "right hand down",
        7 => "right hand low",
        8 => "right hand level",
        9 => "right hand high",
        10 => "right hand up",
        11 => "hand down",
        12 => "hand low",
        13 => "hand level",
        14 => "hand high",
        15 => "hand up",
        16 => "left leg down",
        17 => "left leg low",
        18 => "left leg level",
        19 => "right leg down",
        20 => "right leg low",
        21 => "right leg level",
        22 => "leg down",
        23 => "leg low",
        24 => "leg level",
        25 => "squat",
        26 => "steering wheel",
        27 => "guard up",
        28 => "guard down",
        29 => "punch",
        30 => "punch low",
        31 => "punch straight",
        32 => "punch high",
        33 => "left punch",
        34 => "left punch low",
        35 => "left punch straight",
        36 => "left punch high",
        37 => "right punch",
        38 => "right punch low",
        39 => "right punch straight",
        40 => "right punch high",
        _ => "(unknown)",
    }
}
