// Copyright (c) 2024 The raypack developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The liveness oracle: which lifetime classes occupy storage in which
//! serialization layouts.
//!
//! For every pair of [`LifetimeClass`] and [`SerializationLayoutKind`], a
//! class is [`Live`](LivenessStatus::Live) (its fields are part of the
//! layout), [`Dead`](LivenessStatus::Dead) (absent, storage reusable), or
//! [`Dummy`](LivenessStatus::Dummy) (absent, but its storage stays reserved
//! so classes packed later keep stable offsets). The whole table is derived
//! from the packing order once and is pure data afterwards.

use crate::layout::{SerializationLayoutKind, LAYOUT_KIND_COUNT};
use crate::lifetime::{LifetimeClass, PackingOrder, LIFETIME_CLASS_COUNT};

/// A bit set over [`SerializationLayoutKind`], bit = discriminant.
pub type LayoutKindMask = u8;

/// Status of a lifetime class (and hence of its fields) in one layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LivenessStatus {
    /// Included in the layout.
    Live,
    /// Not included; its storage may be reused by other classes.
    Dead,
    /// Not included, but its storage is reserved: a class packed later is
    /// live in this layout and would otherwise lose its stable offset.
    Dummy,
}

/// Returns whether a lifetime class is functionally live in the given layout
/// kind. Even when dead, its storage may still be reserved in the layout;
/// see [`LivenessTable::status`].
pub fn is_live(class: LifetimeClass, kind: SerializationLayoutKind) -> bool {
    use SerializationLayoutKind as Kind;

    // Consistent criteria for whether a from-X or to-X class is live,
    // derived from the kind's position in the pipeline.
    let from_caller = true;
    let from_any_hit = kind != Kind::CallerOut;
    let from_closest_hit = kind == Kind::ClosestHitOut;
    let from_miss = kind == Kind::MissOut;
    let to_caller = true;
    let to_any_hit = kind as usize <= Kind::AnyHitOutAcceptHit as usize;
    let to_closest_hit = kind != Kind::MissIn && kind as usize <= Kind::ClosestHitIn as usize;
    let to_closest_hit_and_miss = kind as usize <= Kind::MissIn as usize;

    match class {
        LifetimeClass::CallerToCaller => from_caller && to_caller,
        LifetimeClass::AnyHitToCaller => from_any_hit && to_caller,
        LifetimeClass::CallerToClosestHitAndMiss => from_caller && to_closest_hit_and_miss,
        LifetimeClass::CallerToClosestHit => from_caller && to_closest_hit,
        LifetimeClass::AnyHitToClosestHitAndMiss => from_any_hit && to_closest_hit_and_miss,
        LifetimeClass::AnyHitToClosestHit => from_any_hit && to_closest_hit,
        LifetimeClass::CallerToAnyHit => from_caller && to_any_hit,
        LifetimeClass::AnyHitToAnyHit => from_any_hit && to_any_hit,
        LifetimeClass::ClosestHitAndMissToCaller => (from_closest_hit || from_miss) && to_caller,
        LifetimeClass::ClosestHitToCaller => from_closest_hit && to_caller,
        LifetimeClass::MissToCaller => from_miss && to_caller,
    }
}

/// Returns whether two lifetime classes can never be live in the same layout
/// kind. Mutually exclusive classes may legally share storage; for example,
/// closesthit-to-caller and miss-to-caller, because only one of the two
/// stages ever executes for a given ray.
pub fn mutually_exclusive(a: LifetimeClass, b: LifetimeClass) -> bool {
    SerializationLayoutKind::ALL
        .iter()
        .all(|&kind| !(is_live(a, kind) && is_live(b, kind)))
}

/// The liveness status of every (lifetime class, layout kind) combination,
/// plus the per-class live-kind bit masks consumed by the layout computer.
///
/// Computed once per packing order; this used to be a large hand-maintained
/// case distinction and is much less error-prone as a derived table.
#[derive(Clone, Debug)]
pub struct LivenessTable {
    live_kinds: [LayoutKindMask; LIFETIME_CLASS_COUNT],
    status: [[LivenessStatus; LAYOUT_KIND_COUNT]; LIFETIME_CLASS_COUNT],
    positions: [u32; LIFETIME_CLASS_COUNT],
}

impl LivenessTable {
    /// Computes the table for the given packing order.
    pub fn new(order: &PackingOrder) -> Self {
        let mut live_kinds = [0 as LayoutKindMask; LIFETIME_CLASS_COUNT];
        for class in LifetimeClass::ALL {
            for kind in SerializationLayoutKind::ALL {
                if is_live(class, kind) {
                    live_kinds[class as usize] |= 1 << kind as usize;
                }
            }
        }

        // The packing position of a class: one past the maximum position of
        // any earlier class it shares a layout with, or zero. Mutually
        // exclusive classes collapse onto the same position and overlay each
        // other's storage instead of reserving dummy slots.
        let mut positions = [0u32; LIFETIME_CLASS_COUNT];
        for (index, &class) in order.classes().iter().enumerate() {
            let mut position = 0;
            for &earlier in &order.classes()[..index] {
                if live_kinds[class as usize] & live_kinds[earlier as usize] != 0 {
                    position = position.max(positions[earlier as usize] + 1);
                }
            }
            positions[class as usize] = position;
        }

        let mut status = [[LivenessStatus::Dead; LAYOUT_KIND_COUNT]; LIFETIME_CLASS_COUNT];
        for class in LifetimeClass::ALL {
            for kind in SerializationLayoutKind::ALL {
                status[class as usize][kind as usize] = if is_live(class, kind) {
                    LivenessStatus::Live
                } else {
                    let position = positions[class as usize];
                    let overlaid = LifetimeClass::ALL.iter().any(|&other| {
                        other != class
                            && is_live(other, kind)
                            && positions[other as usize] == position
                    });
                    let followed = LifetimeClass::ALL
                        .iter()
                        .any(|&other| is_live(other, kind) && positions[other as usize] > position);
                    if followed && !overlaid {
                        LivenessStatus::Dummy
                    } else {
                        LivenessStatus::Dead
                    }
                };
            }
        }

        Self {
            live_kinds,
            status,
            positions,
        }
    }

    /// The status of `class` in `kind`.
    #[inline]
    pub fn status(&self, class: LifetimeClass, kind: SerializationLayoutKind) -> LivenessStatus {
        self.status[class as usize][kind as usize]
    }

    /// The set of layout kinds in which `class` is live.
    #[inline]
    pub fn live_kinds(&self, class: LifetimeClass) -> LayoutKindMask {
        self.live_kinds[class as usize]
    }

    /// The packing position of `class`; classes sharing a position are
    /// mutually exclusive and overlay each other's storage.
    #[inline]
    pub fn position(&self, class: LifetimeClass) -> u32 {
        self.positions[class as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LivenessTable {
        LivenessTable::new(&PackingOrder::default())
    }

    #[test]
    fn live_kind_masks() {
        // Golden values; bit = layout kind discriminant in the order
        // caller_out, anyhit_in, anyhit_out_accept, closesthit_in, miss_in,
        // closesthit_out, miss_out.
        let expected: [(LifetimeClass, LayoutKindMask); LIFETIME_CLASS_COUNT] = [
            (LifetimeClass::CallerToCaller, 0b111_1111),
            (LifetimeClass::AnyHitToCaller, 0b111_1110),
            (LifetimeClass::CallerToClosestHitAndMiss, 0b001_1111),
            (LifetimeClass::CallerToClosestHit, 0b000_1111),
            (LifetimeClass::AnyHitToClosestHitAndMiss, 0b001_1110),
            (LifetimeClass::AnyHitToClosestHit, 0b000_1110),
            (LifetimeClass::CallerToAnyHit, 0b000_0111),
            (LifetimeClass::AnyHitToAnyHit, 0b000_0110),
            (LifetimeClass::ClosestHitAndMissToCaller, 0b110_0000),
            (LifetimeClass::ClosestHitToCaller, 0b010_0000),
            (LifetimeClass::MissToCaller, 0b100_0000),
        ];
        let table = table();
        for (class, mask) in expected {
            assert_eq!(table.live_kinds(class), mask, "class {}", class);
        }
    }

    #[test]
    fn packing_positions() {
        let table = table();
        let expected = [
            (LifetimeClass::CallerToCaller, 0),
            (LifetimeClass::AnyHitToCaller, 1),
            (LifetimeClass::CallerToClosestHitAndMiss, 2),
            (LifetimeClass::CallerToClosestHit, 3),
            (LifetimeClass::AnyHitToClosestHitAndMiss, 4),
            (LifetimeClass::AnyHitToClosestHit, 5),
            (LifetimeClass::CallerToAnyHit, 6),
            (LifetimeClass::AnyHitToAnyHit, 7),
            // The to-caller classes overlay the dead caller-to-* storage.
            (LifetimeClass::ClosestHitAndMissToCaller, 2),
            (LifetimeClass::ClosestHitToCaller, 3),
            (LifetimeClass::MissToCaller, 3),
        ];
        for (class, position) in expected {
            assert_eq!(table.position(class), position, "class {}", class);
        }
    }

    #[test]
    fn dummy_statuses() {
        use SerializationLayoutKind as Kind;
        let table = table();

        // Reserved so caller-to-anyhit keeps a stable offset in caller_out.
        assert_eq!(
            table.status(LifetimeClass::AnyHitToCaller, Kind::CallerOut),
            LivenessStatus::Dummy,
        );
        assert_eq!(
            table.status(LifetimeClass::AnyHitToClosestHit, Kind::CallerOut),
            LivenessStatus::Dummy,
        );
        // Reserved in miss_in so anyhit-to-closesthit+miss stays stable.
        assert_eq!(
            table.status(LifetimeClass::CallerToClosestHit, Kind::MissIn),
            LivenessStatus::Dummy,
        );
        // Overlaid by its mutually exclusive partner, not reserved.
        assert_eq!(
            table.status(LifetimeClass::ClosestHitToCaller, Kind::MissOut),
            LivenessStatus::Dead,
        );
        assert_eq!(
            table.status(LifetimeClass::CallerToClosestHitAndMiss, Kind::ClosestHitOut),
            LivenessStatus::Dead,
        );
        // Nothing packed after it is live here.
        assert_eq!(
            table.status(LifetimeClass::CallerToAnyHit, Kind::ClosestHitIn),
            LivenessStatus::Dead,
        );
    }

    #[test]
    fn mutually_exclusive_pairs() {
        assert!(mutually_exclusive(
            LifetimeClass::ClosestHitToCaller,
            LifetimeClass::MissToCaller,
        ));
        assert!(mutually_exclusive(
            LifetimeClass::CallerToClosestHitAndMiss,
            LifetimeClass::ClosestHitAndMissToCaller,
        ));
        assert!(!mutually_exclusive(
            LifetimeClass::CallerToCaller,
            LifetimeClass::MissToCaller,
        ));
        assert!(!mutually_exclusive(
            LifetimeClass::CallerToClosestHit,
            LifetimeClass::AnyHitToClosestHit,
        ));
    }

    #[test]
    fn shipped_order_respects_domination() {
        // If A is live wherever B is live, A must precede B in the order.
        let order = PackingOrder::default();
        let table = LivenessTable::new(&order);
        for a in LifetimeClass::ALL {
            for b in LifetimeClass::ALL {
                if a == b {
                    continue;
                }
                let a_mask = table.live_kinds(a);
                let b_mask = table.live_kinds(b);
                let dominates = a_mask & b_mask == b_mask && a_mask != b_mask;
                if dominates {
                    assert!(
                        order.index_of(a) < order.index_of(b),
                        "{} dominates {} but is packed later",
                        a,
                        b,
                    );
                }
            }
        }
    }
}
