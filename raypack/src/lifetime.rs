// Copyright (c) 2024 The raypack developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Lifetime classes of payload fields, and the packing order policy.
//!
//! The lifetime class of a field is derived from its access mask by the
//! outermost write and the outermost read: fields in the same class are live
//! over the same span of the pipeline and can be grouped in serialization
//! layouts. The class decides *which* layouts contain a field; copies in and
//! out of shaders still consult the original access mask.

use crate::access::{AccessMask, PayloadStage};
use std::fmt::{Display, Error as FmtError, Formatter};

/// Number of distinct lifetime classes.
pub const LIFETIME_CLASS_COUNT: usize = 11;

/// The lifetime of a payload field, named writer-to-reader.
///
/// The declaration order doubles as the shipped packing order, see
/// [`PackingOrder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum LifetimeClass {
    /// Always live (written in the caller, read back in the caller).
    CallerToCaller = 0,
    AnyHitToCaller = 1,
    /// Written in the caller, read in miss and possibly closest-hit.
    CallerToClosestHitAndMiss = 2,
    CallerToClosestHit = 3,
    /// Written in any-hit, read in miss and possibly closest-hit.
    AnyHitToClosestHitAndMiss = 4,
    /// Also the class of hit attribute storage.
    AnyHitToClosestHit = 5,
    CallerToAnyHit = 6,
    AnyHitToAnyHit = 7,
    /// Written in both closest-hit and miss.
    ClosestHitAndMissToCaller = 8,
    /// Written only in closest-hit.
    ClosestHitToCaller = 9,
    /// Written only in miss.
    MissToCaller = 10,
}

impl LifetimeClass {
    /// All lifetime classes, in declaration order.
    pub const ALL: [LifetimeClass; LIFETIME_CLASS_COUNT] = [
        LifetimeClass::CallerToCaller,
        LifetimeClass::AnyHitToCaller,
        LifetimeClass::CallerToClosestHitAndMiss,
        LifetimeClass::CallerToClosestHit,
        LifetimeClass::AnyHitToClosestHitAndMiss,
        LifetimeClass::AnyHitToClosestHit,
        LifetimeClass::CallerToAnyHit,
        LifetimeClass::AnyHitToAnyHit,
        LifetimeClass::ClosestHitAndMissToCaller,
        LifetimeClass::ClosestHitToCaller,
        LifetimeClass::MissToCaller,
    ];

    /// Derives the lifetime class of a non-empty access mask.
    ///
    /// The class is determined by the outermost writing and reading stages;
    /// the case split is exhaustive over the legal mask space. Returns
    /// `None` for the empty mask (such fields have no lifetime and appear in
    /// no layout) and for masks outside the legal space: a mask without any
    /// write, a caller or any-hit write without any read, or a closest-hit
    /// or miss write that is not read back in the caller.
    pub fn from_access_mask(mask: AccessMask) -> Option<LifetimeClass> {
        use PayloadStage::{AnyHit, Caller, ClosestHit, Miss};

        if mask.writes(Caller) {
            if mask.reads(Caller) {
                return Some(LifetimeClass::CallerToCaller);
            }
            if mask.reads(Miss) {
                return Some(LifetimeClass::CallerToClosestHitAndMiss);
            }
            if mask.reads(ClosestHit) {
                return Some(LifetimeClass::CallerToClosestHit);
            }
            if mask.reads(AnyHit) {
                return Some(LifetimeClass::CallerToAnyHit);
            }
            return None;
        }
        if mask.writes(AnyHit) {
            if mask.reads(Caller) {
                return Some(LifetimeClass::AnyHitToCaller);
            }
            if mask.reads(Miss) {
                return Some(LifetimeClass::AnyHitToClosestHitAndMiss);
            }
            if mask.reads(ClosestHit) {
                return Some(LifetimeClass::AnyHitToClosestHit);
            }
            if mask.reads(AnyHit) {
                return Some(LifetimeClass::AnyHitToAnyHit);
            }
            return None;
        }
        // Closest-hit and miss run last; their writes can only be observed
        // by the caller.
        if !mask.reads(Caller) {
            return None;
        }
        if mask.writes(ClosestHit) {
            if mask.writes(Miss) {
                return Some(LifetimeClass::ClosestHitAndMissToCaller);
            }
            return Some(LifetimeClass::ClosestHitToCaller);
        }
        if mask.writes(Miss) {
            return Some(LifetimeClass::MissToCaller);
        }
        None
    }
}

impl Display for LifetimeClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "{}",
            match self {
                LifetimeClass::CallerToCaller => "caller to caller",
                LifetimeClass::AnyHitToCaller => "anyhit to caller",
                LifetimeClass::CallerToClosestHitAndMiss => "caller to closesthit+miss",
                LifetimeClass::CallerToClosestHit => "caller to closesthit",
                LifetimeClass::AnyHitToClosestHitAndMiss => "anyhit to closesthit+miss",
                LifetimeClass::AnyHitToClosestHit => "anyhit to closesthit",
                LifetimeClass::CallerToAnyHit => "caller to anyhit",
                LifetimeClass::AnyHitToAnyHit => "anyhit to anyhit",
                LifetimeClass::ClosestHitAndMissToCaller => "closesthit+miss to caller",
                LifetimeClass::ClosestHitToCaller => "closesthit to caller",
                LifetimeClass::MissToCaller => "miss to caller",
            }
        )
    }
}

/// A permutation of all lifetime classes, specifying their relative order in
/// serialization layouts.
///
/// Storage is allocated greedily in this order. Changing the order changes
/// which layouts contain holes for dead-but-reserved fields, trading payload
/// size at one stage against another. The one hard constraint: if class A is
/// live in every layout kind in which class B is live, A must precede B, or
/// an avoidable hole appears for A. The shipped order is fixed; the size
/// trade-offs it produces are relied upon by the rest of the pipeline.
#[derive(Clone, Debug)]
pub struct PackingOrder {
    classes: [LifetimeClass; LIFETIME_CLASS_COUNT],
    indices: [u32; LIFETIME_CLASS_COUNT],
}

impl PackingOrder {
    /// Creates a packing order from a permutation of all lifetime classes.
    ///
    /// # Panics
    ///
    /// - Panics if `classes` is not a permutation (contains duplicates).
    pub fn new(classes: [LifetimeClass; LIFETIME_CLASS_COUNT]) -> Self {
        let mut indices = [u32::MAX; LIFETIME_CLASS_COUNT];
        for (index, &class) in classes.iter().enumerate() {
            assert!(
                indices[class as usize] == u32::MAX,
                "duplicate lifetime class in packing order: {}",
                class,
            );
            indices[class as usize] = index as u32;
        }
        Self { classes, indices }
    }

    /// The classes in packing order.
    #[inline]
    pub fn classes(&self) -> &[LifetimeClass; LIFETIME_CLASS_COUNT] {
        &self.classes
    }

    /// The position of `class` in the order.
    #[inline]
    pub fn index_of(&self, class: LifetimeClass) -> u32 {
        self.indices[class as usize]
    }
}

impl Default for PackingOrder {
    /// The shipped fixed order, equal to the declaration order of
    /// [`LifetimeClass`]. Only the relative order of classes with shared
    /// lifetime is relevant.
    fn default() -> Self {
        Self::new(LifetimeClass::ALL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessKind;

    fn mask_of(write: PayloadStage, read: PayloadStage) -> AccessMask {
        AccessMask::empty()
            .with(write, AccessKind::Write)
            .with(read, AccessKind::Read)
    }

    #[test]
    fn classification_table() {
        use PayloadStage::{AnyHit, Caller, ClosestHit, Miss};

        let cases = [
            (Caller, Caller, LifetimeClass::CallerToCaller),
            (Caller, ClosestHit, LifetimeClass::CallerToClosestHit),
            (Caller, Miss, LifetimeClass::CallerToClosestHitAndMiss),
            (Caller, AnyHit, LifetimeClass::CallerToAnyHit),
            (AnyHit, Caller, LifetimeClass::AnyHitToCaller),
            (AnyHit, ClosestHit, LifetimeClass::AnyHitToClosestHit),
            (AnyHit, Miss, LifetimeClass::AnyHitToClosestHitAndMiss),
            (AnyHit, AnyHit, LifetimeClass::AnyHitToAnyHit),
            (ClosestHit, Caller, LifetimeClass::ClosestHitToCaller),
            (Miss, Caller, LifetimeClass::MissToCaller),
        ];
        for (write, read, expected) in cases {
            assert_eq!(
                LifetimeClass::from_access_mask(mask_of(write, read)),
                Some(expected),
            );
        }

        // Written in both closest-hit and miss.
        let both = mask_of(ClosestHit, Caller).with(Miss, AccessKind::Write);
        assert_eq!(
            LifetimeClass::from_access_mask(both),
            Some(LifetimeClass::ClosestHitAndMissToCaller),
        );
    }

    #[test]
    fn outermost_access_wins() {
        use PayloadStage::{AnyHit, Caller, ClosestHit, Miss};

        // Extra inner accesses do not change the class.
        let mask = mask_of(Caller, Miss)
            .with(AnyHit, AccessKind::Write)
            .with(ClosestHit, AccessKind::Read);
        assert_eq!(
            LifetimeClass::from_access_mask(mask),
            Some(LifetimeClass::CallerToClosestHitAndMiss),
        );
    }

    #[test]
    fn exhaustive_over_legal_masks() {
        use PayloadStage::{AnyHit, Caller, ClosestHit, Miss};

        // A mask is legal if it is empty, or its outermost writer can reach
        // a reader: caller/any-hit writes need any read at all, while
        // closest-hit/miss writes need a caller read.
        for bits in 0..=u8::MAX {
            let mask = AccessMask::from_bits(bits);
            let any_read = PayloadStage::ALL.iter().any(|&s| mask.reads(s));
            let legal = if mask.writes(Caller) || mask.writes(AnyHit) {
                any_read
            } else if mask.writes(ClosestHit) || mask.writes(Miss) {
                mask.reads(Caller)
            } else {
                false
            };

            let class = LifetimeClass::from_access_mask(mask);
            assert_eq!(
                class.is_some(),
                legal,
                "mask {} classified as {:?}",
                mask,
                class,
            );
        }
    }

    #[test]
    fn empty_mask_has_no_class() {
        assert_eq!(LifetimeClass::from_access_mask(AccessMask::empty()), None);
    }

    #[test]
    fn default_order_is_declaration_order() {
        let order = PackingOrder::default();
        for (index, &class) in LifetimeClass::ALL.iter().enumerate() {
            assert_eq!(order.index_of(class), index as u32);
            assert_eq!(order.classes()[index], class);
        }
    }

    #[test]
    #[should_panic]
    fn duplicate_order_entry_panics() {
        let mut classes = LifetimeClass::ALL;
        classes[1] = LifetimeClass::CallerToCaller;
        let _ = PackingOrder::new(classes);
    }
}
