// Copyright (c) 2024 The raypack developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Serialization layouts and the layout computer.
//!
//! For every payload copy into or out of a shader (caller out, anyhit in,
//! and so on) there is a [`SerializationLayout`]: for every field live at
//! that point, the register units storing it. Fields are typically live in
//! several layouts, and a field's storage must be identical in all of them,
//! so that exporting through one layout and importing through another reads
//! the data back correctly. This sometimes forces holes of unused units in a
//! layout.
//!
//! The layout computer assigns storage to all layouts of a payload at once.
//! Nodes with fixed positions (hit attribute storage) are placed first; the
//! remaining nodes are sorted by the packing order of their lifetime classes
//! and greedily take the lowest units that are free in every layout the node
//! is live in, tracked in a per-unit usage matrix. Because absolute unit
//! indices are recorded, offset stability across layouts is inherent, and
//! dead-but-reserved storage shows up simply as a hole. If the resulting
//! allocation exceeds the register budget, a single-unit overflow pointer is
//! placed at unit 0 and the allocation is rerun unbounded; units past the
//! budget live in memory addressed by that pointer.

use crate::access::{AccessKind, AccessMask, PayloadStage};
use crate::field::{FieldTree, NodeId, PayloadShape};
use crate::lifetime::PackingOrder;
use crate::liveness::LayoutKindMask;
use crate::OVERFLOW_POINTER_REGISTER;
use indexmap::IndexMap;
use smallvec::SmallVec;
use std::error::Error;
use std::fmt::{Display, Error as FmtError, Formatter};

/// Number of distinct serialization layout kinds.
pub const LAYOUT_KIND_COUNT: usize = 7;

/// A stage entry or exit point with its own serialization layout.
///
/// The discriminant order mirrors the pipeline order and is relied upon by
/// the liveness predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum SerializationLayoutKind {
    CallerOut = 0,
    /// Includes the maximum possible hit attribute storage, because the size
    /// of the currently committed hit attributes is unknown.
    AnyHitIn = 1,
    /// Separate from `AnyHitIn` because accepting the hit overrides the
    /// committed attributes with a known size.
    AnyHitOutAcceptHit = 2,
    /// Separate so lifetimes ending in any-hit can be omitted.
    ClosestHitIn = 3,
    MissIn = 4,
    ClosestHitOut = 5,
    MissOut = 6,
}

impl SerializationLayoutKind {
    /// Ignoring the hit leaves the committed attributes untouched, so the
    /// outgoing layout equals the incoming one.
    pub const ANY_HIT_OUT_IGNORE_HIT: Self = Self::AnyHitIn;
    /// Ending the search commits the hit; the payload next materializes on
    /// closest-hit entry.
    pub const ANY_HIT_OUT_ACCEPT_HIT_AND_END_SEARCH: Self = Self::ClosestHitIn;

    /// All layout kinds, in pipeline order.
    pub const ALL: [SerializationLayoutKind; LAYOUT_KIND_COUNT] = [
        SerializationLayoutKind::CallerOut,
        SerializationLayoutKind::AnyHitIn,
        SerializationLayoutKind::AnyHitOutAcceptHit,
        SerializationLayoutKind::ClosestHitIn,
        SerializationLayoutKind::MissIn,
        SerializationLayoutKind::ClosestHitOut,
        SerializationLayoutKind::MissOut,
    ];
}

impl Display for SerializationLayoutKind {
    /// Also used in serialization layout names, hence no spaces.
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "{}",
            match self {
                SerializationLayoutKind::CallerOut => "caller_out",
                SerializationLayoutKind::AnyHitIn => "anyhit_in",
                SerializationLayoutKind::AnyHitOutAcceptHit => "anyhit_out_accept",
                SerializationLayoutKind::ClosestHitIn => "closesthit_in",
                SerializationLayoutKind::MissIn => "miss_in",
                SerializationLayoutKind::ClosestHitOut => "closesthit_out",
                SerializationLayoutKind::MissOut => "miss_out",
            }
        )
    }
}

/// Tries to determine the unique layout kind for a stage and access
/// direction (entering a stage reads the payload, leaving writes it).
///
/// Returns `None` in the two ambiguous positions, which callers must resolve
/// themselves: reading in the caller imports from several layouts
/// (closesthit out, miss out), and leaving any-hit has three outgoing
/// layouts depending on the exit kind.
pub fn layout_kind_for(
    stage: PayloadStage,
    access: AccessKind,
) -> Option<SerializationLayoutKind> {
    match (stage, access) {
        (PayloadStage::Caller, AccessKind::Write) => Some(SerializationLayoutKind::CallerOut),
        (PayloadStage::Caller, AccessKind::Read) => None,
        (PayloadStage::AnyHit, AccessKind::Read) => Some(SerializationLayoutKind::AnyHitIn),
        (PayloadStage::AnyHit, AccessKind::Write) => None,
        (PayloadStage::ClosestHit, AccessKind::Read) => Some(SerializationLayoutKind::ClosestHitIn),
        (PayloadStage::ClosestHit, AccessKind::Write) => {
            Some(SerializationLayoutKind::ClosestHitOut)
        }
        (PayloadStage::Miss, AccessKind::Read) => Some(SerializationLayoutKind::MissIn),
        (PayloadStage::Miss, AccessKind::Write) => Some(SerializationLayoutKind::MissOut),
    }
}

/// A half-open interval `[begin, end)` of register unit indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexInterval {
    /// First unit in the interval.
    pub begin: u32,
    /// First unit not included in the interval.
    pub end: u32,
}

impl IndexInterval {
    /// Number of units in the interval.
    #[inline]
    pub const fn size(self) -> u32 {
        self.end - self.begin
    }
}

impl Display for IndexInterval {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// The register units storing one field. Typically a single interval; a
/// field is split only when a fixed-position field (hit attribute storage)
/// sits in the middle of the units it would otherwise occupy.
pub type IndexIntervals = SmallVec<[IndexInterval; 2]>;

/// Storage assignment of a single field in a serialization layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeStorage {
    pub intervals: IndexIntervals,
}

impl NodeStorage {
    /// Total number of units across all intervals.
    pub fn total_units(&self) -> u32 {
        self.intervals.iter().map(|interval| interval.size()).sum()
    }
}

impl Display for NodeStorage {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        if self.intervals.len() > 1 {
            write!(f, "{{ ")?;
        }
        let mut first = true;
        for interval in &self.intervals {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}", interval)?;
        }
        if self.intervals.len() > 1 {
            write!(f, " }}")?;
        }
        Ok(())
    }
}

/// Insertion-ordered map from field node to its storage.
pub type NodeStorageMap = IndexMap<NodeId, NodeStorage, foldhash::fast::RandomState>;

/// One concrete serialization layout: which field occupies which units at
/// one stage transition point.
///
/// Within one layout, intervals of distinct fields never overlap. Across
/// layouts, a field occupies the same units everywhere it is live; fields of
/// mutually exclusive lifetime classes may occupy the same units because
/// they are never part of the same layout.
#[derive(Clone, Debug)]
pub struct SerializationLayout {
    /// Diagnostic name, derived from the payload and the layout kind.
    pub name: String,
    /// Storage of every field included in the layout.
    pub storage: NodeStorageMap,
    /// Root node of the field tree this layout was computed for.
    pub root: NodeId,
    /// Node of the overflow memory pointer, if the payload needed one.
    pub overflow_pointer: Option<NodeId>,
    /// Node of the hit attribute storage, if this layout carries any.
    pub hit_attributes: Option<NodeId>,
    /// Total number of units; the maximum `end` over all intervals.
    pub storage_units: u32,
}

impl SerializationLayout {
    /// Returns whether no payload state is live in this layout.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.storage_units == 0
    }

    /// The storage assigned to `node`, if it is part of this layout.
    #[inline]
    pub fn node_storage(&self, node: NodeId) -> Option<&NodeStorage> {
        self.storage.get(&node)
    }

    /// The number of units resident in registers under the given budget;
    /// the remainder is memory-backed via the overflow pointer.
    #[inline]
    pub fn register_resident_units(&self, register_budget: u32) -> u32 {
        self.storage_units.min(register_budget)
    }
}

impl Display for SerializationLayout {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        if self.is_empty() {
            return write!(f, "<empty serialization layout `{}`>", self.name);
        }
        writeln!(f, "serialization layout `{}`: {} units", self.name, self.storage_units)?;
        write!(f, "  overflow pointer: ")?;
        match self.overflow_pointer.and_then(|node| self.storage.get(&node)) {
            Some(storage) => writeln!(f, "at {}", storage)?,
            None => writeln!(f, "no")?,
        }
        write!(f, "  hit attributes: ")?;
        match self.hit_attributes.and_then(|node| self.storage.get(&node)) {
            Some(storage) => writeln!(f, "at {}", storage)?,
            None => writeln!(f, "no")?,
        }
        writeln!(f, "  field storage intervals:")?;
        let mut sorted: Vec<_> = self.storage.iter().collect();
        sorted.sort_by(|(_, lhs), (_, rhs)| lhs.intervals.cmp(&rhs.intervals));
        for (node, storage) in sorted {
            writeln!(f, "    node {} at {}", node.index(), storage)?;
        }
        Ok(())
    }
}

/// Error during layout computation. All of these indicate a configuration
/// that can never produce a usable layout; running out of registers is not
/// an error and is handled by the overflow pointer instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutError {
    /// The register budget cannot hold even the overflow pointer.
    RegisterBudgetTooSmall { available: u32, required: u32 },
    /// The hit attribute byte budget is not a multiple of the unit width.
    HitAttributesMisaligned { bytes: u32, register_bytes: u32 },
    /// The hit attribute byte budget exceeds the global maximum.
    HitAttributesTooLarge { bytes: u32, max: u32 },
    /// An actual hit attribute size exceeds the payload's declared budget.
    HitAttributesExceedBudget { bytes: u32, budget: u32 },
}

impl Error for LayoutError {}

impl Display for LayoutError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            LayoutError::RegisterBudgetTooSmall {
                available,
                required,
            } => write!(
                f,
                "register budget of {} units cannot hold a payload needing at least {}",
                available, required,
            ),
            LayoutError::HitAttributesMisaligned {
                bytes,
                register_bytes,
            } => write!(
                f,
                "hit attribute budget of {} bytes is not a multiple of the {}-byte unit width",
                bytes, register_bytes,
            ),
            LayoutError::HitAttributesTooLarge { bytes, max } => write!(
                f,
                "hit attribute budget of {} bytes exceeds the maximum of {} bytes",
                bytes, max,
            ),
            LayoutError::HitAttributesExceedBudget { bytes, budget } => write!(
                f,
                "hit attributes of {} bytes exceed the payload budget of {} bytes",
                bytes, budget,
            ),
        }
    }
}

/// One node to be included in computed layouts.
#[derive(Clone, Debug)]
pub(crate) struct LayoutNodeInfo {
    pub node: NodeId,
    /// If non-empty, the exact units to use as storage for the node.
    pub fixed: IndexIntervals,
    /// The layouts the node is part of, by layout index.
    pub live_kinds: LayoutKindMask,
}

/// A request to compute a set of layouts over one field tree.
///
/// One layout is produced per name, in order; the computer itself is
/// agnostic of what the layouts mean. The correspondence between layout
/// indices and `SerializationLayoutKind` (or the single call-shader layout)
/// is handled entirely by the callers.
#[derive(Debug)]
pub(crate) struct LayoutRequest {
    pub nodes: Vec<LayoutNodeInfo>,
    pub layout_names: Vec<String>,
    pub root: NodeId,
    pub hit_attributes: Option<NodeId>,
    /// Maximum units before an overflow pointer becomes necessary.
    pub register_budget: u32,
}

/// Result of [`compute_layouts`].
#[derive(Debug)]
pub(crate) struct ComputedLayouts {
    pub layouts: Vec<SerializationLayout>,
    /// Set if the allocation did not fit the budget; the node is stored in
    /// the same tree as the payload fields.
    pub overflow_pointer: Option<NodeId>,
    /// Maximum unit count over all computed layouts.
    pub max_storage_units: u32,
}

/// The intermediate allocation: per sorted node its intervals, plus the
/// usage matrix (bit j of `usage[i]` = unit i is taken in layout j).
struct Allocation {
    intervals: Vec<IndexIntervals>,
    usage: Vec<LayoutKindMask>,
}

impl Allocation {
    fn ensure_size(&mut self, units: u32) {
        if self.usage.len() < units as usize {
            self.usage.resize(units as usize, 0);
        }
    }
}

/// Computes the layouts for `request`.
///
/// The overflow pointer node, if one turns out to be required, is appended
/// to `tree`; this is the only mutation.
pub(crate) fn compute_layouts(
    tree: &mut FieldTree,
    order: &PackingOrder,
    register_bytes: u32,
    request: LayoutRequest,
) -> Result<ComputedLayouts, LayoutError> {
    assert!(
        request.layout_names.len() <= LAYOUT_KIND_COUNT,
        "too many layouts for the kind mask width",
    );

    let mut sorted = request.nodes;
    sorted.sort_by_key(|info| {
        // Nodes with fixed storage come first; the rest follow the packing
        // order of their lifetime classes. The sort is stable, so original
        // declaration order breaks ties.
        let class = tree
            .node(info.node)
            .lifetime()
            .expect("layout nodes carry a lifetime class");
        let fixed_rank = u32::from(info.fixed.is_empty());
        (fixed_rank, order.index_of(class))
    });

    if request.register_budget == 0 && !sorted.is_empty() {
        return Err(LayoutError::RegisterBudgetTooSmall {
            available: 0,
            required: 1,
        });
    }

    let mut overflow_pointer = None;
    let allocation = match try_allocate(tree, &sorted, request.register_budget, register_bytes) {
        Some(allocation) => allocation,
        None => {
            // Too large for registers: reserve unit 0 for a pointer to
            // memory-backed storage and rerun unbounded. The pointer is
            // written by the caller and read by every stage.
            let node = push_overflow_pointer_node(tree, register_bytes);
            overflow_pointer = Some(node);
            sorted.insert(
                0,
                LayoutNodeInfo {
                    node,
                    fixed: smallvec::smallvec![IndexInterval {
                        begin: OVERFLOW_POINTER_REGISTER,
                        end: OVERFLOW_POINTER_REGISTER + 1,
                    }],
                    live_kinds: LayoutKindMask::MAX,
                },
            );
            match try_allocate(tree, &sorted, u32::MAX, register_bytes) {
                Some(allocation) => allocation,
                None => unreachable!("unbounded allocation failed: conflicting fixed intervals"),
            }
        }
    };

    let mut layouts = Vec::with_capacity(request.layout_names.len());
    let mut max_storage_units = 0;
    for (layout_index, name) in request.layout_names.into_iter().enumerate() {
        let mut layout = SerializationLayout {
            name,
            storage: NodeStorageMap::default(),
            root: request.root,
            overflow_pointer,
            hit_attributes: None,
            storage_units: 0,
        };
        for (node_index, info) in sorted.iter().enumerate() {
            if info.live_kinds & (1 << layout_index) == 0 {
                continue;
            }
            let intervals = allocation.intervals[node_index].clone();
            for interval in &intervals {
                assert!(interval.size() != 0, "empty interval in allocation");
                layout.storage_units = layout.storage_units.max(interval.end);
            }
            layout.storage.insert(info.node, NodeStorage { intervals });
        }
        if let Some(node) = request.hit_attributes {
            if layout.storage.contains_key(&node) {
                layout.hit_attributes = Some(node);
            }
        }
        max_storage_units = max_storage_units.max(layout.storage_units);
        layouts.push(layout);
    }

    Ok(ComputedLayouts {
        layouts,
        overflow_pointer,
        max_storage_units,
    })
}

/// Tries to allocate all nodes within `max_units`. Returns `None` if the
/// budget does not suffice or a fixed interval cannot be honored.
fn try_allocate(
    tree: &FieldTree,
    sorted: &[LayoutNodeInfo],
    max_units: u32,
    register_bytes: u32,
) -> Option<Allocation> {
    let mut allocation = Allocation {
        intervals: Vec::with_capacity(sorted.len()),
        usage: Vec::new(),
    };

    // Instead of searching for the first free unit from scratch for every
    // node, continue at the previous node's position unless the liveness
    // mask changes.
    let mut resume: Option<(LayoutKindMask, u32)> = None;

    for info in sorted {
        let bytes = tree.node(info.node).size_bytes();
        let units = bytes.div_ceil(register_bytes);
        assert!(units != 0, "zero-sized node in layout request");

        if !info.fixed.is_empty() {
            let mut allocated = 0;
            for interval in &info.fixed {
                assert!(interval.size() != 0, "empty fixed interval");
                if interval.end > max_units {
                    return None;
                }
                allocation.ensure_size(interval.end);
                for unit in interval.begin..interval.end {
                    if allocation.usage[unit as usize] & info.live_kinds != 0 {
                        return None;
                    }
                    allocation.usage[unit as usize] |= info.live_kinds;
                    allocated += 1;
                }
            }
            assert_eq!(allocated, units, "fixed intervals disagree with node size");
            allocation.intervals.push(info.fixed.clone());
            continue;
        }

        let mut intervals = IndexIntervals::new();
        let mut unit = match resume {
            Some((mask, next)) if mask == info.live_kinds => next,
            _ => 0,
        };
        let mut remaining = units;
        while remaining > 0 {
            if unit >= max_units {
                return None;
            }
            allocation.ensure_size(unit + 1);
            if allocation.usage[unit as usize] & info.live_kinds == 0 {
                allocation.usage[unit as usize] |= info.live_kinds;
                match intervals.last_mut() {
                    Some(last) if last.end == unit => last.end += 1,
                    _ => intervals.push(IndexInterval {
                        begin: unit,
                        end: unit + 1,
                    }),
                }
                remaining -= 1;
            }
            unit += 1;
        }
        resume = Some((info.live_kinds, unit));
        allocation.intervals.push(intervals);
    }

    Some(allocation)
}

fn push_overflow_pointer_node(tree: &mut FieldTree, register_bytes: u32) -> NodeId {
    let mut mask = AccessMask::empty().with(PayloadStage::Caller, AccessKind::Write);
    for stage in PayloadStage::ALL {
        mask = mask.with(stage, AccessKind::Read);
    }
    tree.push_detached(
        PayloadShape::Primitive {
            size: register_bytes,
        },
        mask,
    )
}

/// Checks the internal invariants of a single layout: the overflow pointer
/// comes first if present, interval sizes match node sizes, and intervals of
/// distinct fields are disjoint.
///
/// `hit_attributes` storage may be smaller than its node (size-specialized
/// layouts trim it in place), so only an upper bound is checked for it.
///
/// # Panics
///
/// Panics on any violation; these indicate a bug in the layout computer and
/// are never tolerated.
pub(crate) fn validate_layout(tree: &FieldTree, layout: &SerializationLayout, register_bytes: u32) {
    if layout.is_empty() {
        assert!(
            layout.storage.is_empty(),
            "empty serialization layout `{}` with contained fields",
            layout.name,
        );
        return;
    }

    if let Some(pointer) = layout.overflow_pointer {
        let storage = layout
            .storage
            .get(&pointer)
            .expect("layout is missing its overflow pointer");
        assert!(
            storage.intervals.len() == 1 && storage.intervals[0].size() == 1,
            "overflow pointer must occupy a single unit",
        );
        assert_eq!(
            storage.intervals[0].begin, OVERFLOW_POINTER_REGISTER,
            "overflow pointer at incorrect unit",
        );
    }

    let mut used = vec![false; layout.storage_units as usize];
    for (&node, storage) in &layout.storage {
        let mut units = 0;
        for interval in &storage.intervals {
            assert!(interval.begin < interval.end, "malformed interval");
            for unit in interval.begin..interval.end {
                assert!(
                    !used[unit as usize],
                    "unit {} used twice in layout `{}`",
                    unit, layout.name,
                );
                used[unit as usize] = true;
                units += 1;
            }
        }
        let required = tree.node(node).size_bytes().div_ceil(register_bytes);
        if layout.hit_attributes == Some(node) {
            assert!(
                units <= required,
                "hit attribute storage larger than its node in layout `{}`",
                layout.name,
            );
        } else {
            assert_eq!(
                units, required,
                "incorrect storage size for node {} in layout `{}`",
                node.index(),
                layout.name,
            );
        }
    }
}

/// Checks offset stability across layouts: a node included in several
/// layouts occupies identical units in all of them. For `hit_attributes`,
/// whose storage may be trimmed per layout, the interval lists must agree up
/// to a prefix of the last interval.
///
/// # Panics
///
/// Panics on any violation.
pub(crate) fn validate_cross_layout_consistency(
    layouts: &[&SerializationLayout],
    hit_attributes: Option<NodeId>,
) {
    let mut merged: IndexMap<NodeId, IndexIntervals, foldhash::fast::RandomState> =
        IndexMap::default();
    for layout in layouts {
        for (&node, storage) in &layout.storage {
            match merged.get(&node) {
                None => {
                    merged.insert(node, storage.intervals.clone());
                }
                Some(existing) => {
                    if hit_attributes == Some(node) {
                        assert!(
                            intervals_prefix_compatible(existing, &storage.intervals),
                            "inconsistent hit attribute storage in layout `{}`",
                            layout.name,
                        );
                    } else {
                        assert!(
                            *existing == storage.intervals,
                            "inconsistent storage for node {} in layout `{}`",
                            node.index(),
                            layout.name,
                        );
                    }
                }
            }
        }
    }
}

/// Whether one of the interval lists is a prefix of the other: all but the
/// last interval equal, and the last sharing its begin with a smaller or
/// equal end.
fn intervals_prefix_compatible(lhs: &IndexIntervals, rhs: &IndexIntervals) -> bool {
    if lhs.is_empty() || rhs.is_empty() {
        return true;
    }
    let (prefix, containing) = if rhs.len() < lhs.len()
        || (rhs.len() == lhs.len() && rhs.last().unwrap().end < lhs.last().unwrap().end)
    {
        (rhs, lhs)
    } else {
        (lhs, rhs)
    };
    for index in 0..prefix.len() {
        if index + 1 < prefix.len() {
            if prefix[index] != containing[index] {
                return false;
            }
        } else if prefix[index].begin != containing[index].begin
            || prefix[index].end > containing[index].end
        {
            return false;
        }
    }
    true
}
