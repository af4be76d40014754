// Copyright (c) 2024 The raypack developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Serialization infos: all layouts of one payload over its whole lifetime.
//!
//! For a trace call, one layout per [`SerializationLayoutKind`] is computed,
//! plus on-demand specializations of the two hit-attribute-carrying layouts
//! for smaller actual attribute sizes. For a callable-shader call, access
//! qualifiers do not apply and a single layout containing every field is
//! computed; using the same machinery keeps the implementation free of
//! special cases.
//!
//! Infos are immutable once created (the specialization cache is written
//! through an insert-once map) and are shared behind [`Arc`].

use crate::access::{AccessKind, AccessMask, PayloadStage};
use crate::cache::OnceCache;
use crate::field::{FieldTree, NodeId, PayloadShape};
use crate::layout::{
    compute_layouts, validate_cross_layout_consistency, validate_layout, IndexInterval,
    LayoutError, LayoutNodeInfo, LayoutRequest, NodeStorage, SerializationLayout,
    SerializationLayoutKind, LAYOUT_KIND_COUNT,
};
use crate::lifetime::PackingOrder;
use crate::liveness::LivenessTable;
use crate::{LayoutConfig, FIRST_HIT_ATTRIBUTE_REGISTER, MAX_HIT_ATTRIBUTE_BYTES};
use log::{debug, trace};
use smallvec::smallvec;
use std::sync::Arc;

/// Everything that determines the serialization layouts of one payload:
/// its shape and the worst-case hit attribute byte budget (the latter is
/// only relevant for trace calls). Used as the structural cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PayloadConfig {
    pub payload: PayloadShape,
    /// Maximum hit attribute size the pipeline may commit, in bytes. Must
    /// be a multiple of the unit width and at most
    /// [`MAX_HIT_ATTRIBUTE_BYTES`].
    pub max_hit_attribute_bytes: u32,
}

impl PayloadConfig {
    pub fn new(payload: PayloadShape, max_hit_attribute_bytes: u32) -> Self {
        Self {
            payload,
            max_hit_attribute_bytes,
        }
    }
}

/// Specialized layouts for one known hit attribute size.
///
/// Accepting a hit makes any previously committed attributes obsolete, so
/// `AnyHitOutAcceptHit` only needs storage for the new, known-size
/// attributes; in `ClosestHitIn` the attribute size is likewise known. The
/// worst-case interval is trimmed in place, which never moves another
/// field, so the total only shrinks when attribute storage was the trailing
/// field of the layout.
#[derive(Clone, Debug)]
pub struct HitGroupLayouts {
    /// Units of payload-resident hit attribute storage in these layouts,
    /// strictly smaller than the worst case of the owning info.
    pub hit_attribute_units: u32,
    pub any_hit_out_accept_hit: Arc<SerializationLayout>,
    pub closest_hit_in: Arc<SerializationLayout>,
}

/// Complete serialization info of one payload type for the whole trace
/// pipeline.
#[derive(Debug)]
pub struct TraceRaySerializationInfo {
    /// The payload configuration this info was computed for.
    pub config: PayloadConfig,
    /// The layout configuration this info was computed under.
    pub layout_config: LayoutConfig,
    /// The qualified field tree, including the detached overflow-pointer
    /// and hit-attribute nodes if present.
    pub tree: FieldTree,
    /// One layout per [`SerializationLayoutKind`], indexed by discriminant.
    /// The two hit-attribute-carrying layouts reserve worst-case attribute
    /// storage here; shaders that know the actual attribute type use
    /// [`Self::specialized_hit_group`].
    pub layouts: [Arc<SerializationLayout>; LAYOUT_KIND_COUNT],
    /// Node of the overflow memory pointer, if any layout exceeded the
    /// register budget.
    pub overflow_pointer: Option<NodeId>,
    /// Node reserving worst-case hit attribute storage, if the budget
    /// leaves any attributes in the payload.
    pub hit_attributes: Option<NodeId>,
    /// Maximum possible units of payload-resident hit attribute storage.
    pub max_hit_attribute_units: u32,
    /// Maximum unit count over all layouts. Stack space for the payload is
    /// sized from this before any concrete layout is chosen.
    pub max_storage_units: u32,
    /// Specialized layouts, keyed by actual attribute units. Populated on
    /// demand, each entry written at most once.
    specialized: OnceCache<u32, HitGroupLayouts>,
}

impl TraceRaySerializationInfo {
    /// Computes the serialization info for `config`. The tree must be the
    /// qualified field tree of `config.payload`.
    pub fn create(
        config: &PayloadConfig,
        layout_config: &LayoutConfig,
        order: &PackingOrder,
        mut tree: FieldTree,
    ) -> Result<Arc<TraceRaySerializationInfo>, LayoutError> {
        let register_bytes = layout_config.register_bytes;
        if config.max_hit_attribute_bytes % register_bytes != 0 {
            return Err(LayoutError::HitAttributesMisaligned {
                bytes: config.max_hit_attribute_bytes,
                register_bytes,
            });
        }
        if config.max_hit_attribute_bytes > MAX_HIT_ATTRIBUTE_BYTES {
            return Err(LayoutError::HitAttributesTooLarge {
                bytes: config.max_hit_attribute_bytes,
                max: MAX_HIT_ATTRIBUTE_BYTES,
            });
        }

        // The actually committed attribute sizes are unknown here (the
        // pipeline may contain intersection shaders), so worst-case storage
        // is reserved. The leading part of the attributes lives inline in
        // system data and never occupies payload units.
        let inline_bytes = layout_config
            .inline_hit_attribute_bytes
            .min(config.max_hit_attribute_bytes);
        let attribute_units =
            (config.max_hit_attribute_bytes - inline_bytes).div_ceil(register_bytes);
        let hit_attributes = if attribute_units != 0 {
            Some(tree.push_detached(
                PayloadShape::Primitive {
                    size: attribute_units * register_bytes,
                },
                hit_attribute_mask(),
            ))
        } else {
            None
        };

        let table = LivenessTable::new(order);
        let mut nodes = layout_nodes(&tree, &table);
        if let Some(node) = hit_attributes {
            // Hit attributes are accessed from intersection shaders that
            // have no payload type, so they sit at fixed units.
            let class = tree.node(node).lifetime().expect("attributes have a class");
            nodes.push(LayoutNodeInfo {
                node,
                fixed: smallvec![IndexInterval {
                    begin: FIRST_HIT_ATTRIBUTE_REGISTER,
                    end: FIRST_HIT_ATTRIBUTE_REGISTER + attribute_units,
                }],
                live_kinds: table.live_kinds(class),
            });
        }

        let prefix = info_prefix(config, register_bytes);
        let layout_names = SerializationLayoutKind::ALL
            .iter()
            .map(|&kind| format!("{}.{}", prefix, layout_suffix(Some(kind), None)))
            .collect();

        let root = tree.root();
        let computed = compute_layouts(
            &mut tree,
            order,
            register_bytes,
            LayoutRequest {
                nodes,
                layout_names,
                root,
                hit_attributes,
                register_budget: layout_config.payload_register_count,
            },
        )?;

        let layouts: [Arc<SerializationLayout>; LAYOUT_KIND_COUNT] = computed
            .layouts
            .into_iter()
            .map(Arc::new)
            .collect::<Vec<_>>()
            .try_into()
            .expect("one layout per kind");

        // Validation is cheap relative to the computation and a violation
        // is a layout computer bug, so it stays on in release builds.
        for layout in &layouts {
            validate_layout(&tree, layout, register_bytes);
        }
        let refs: Vec<&SerializationLayout> = layouts.iter().map(Arc::as_ref).collect();
        validate_cross_layout_consistency(&refs, hit_attributes);

        debug!(
            "computed trace serialization info `{}`: {} units worst case, overflow pointer: {}",
            prefix,
            computed.max_storage_units,
            computed.overflow_pointer.is_some(),
        );
        for layout in &layouts {
            trace!("{}", layout);
        }

        Ok(Arc::new(TraceRaySerializationInfo {
            config: config.clone(),
            layout_config: *layout_config,
            tree,
            layouts,
            overflow_pointer: computed.overflow_pointer,
            hit_attributes,
            max_hit_attribute_units: attribute_units,
            max_storage_units: computed.max_storage_units,
            specialized: OnceCache::new(),
        }))
    }

    /// The layout for `kind` with worst-case hit attribute storage.
    #[inline]
    pub fn layout(&self, kind: SerializationLayoutKind) -> &Arc<SerializationLayout> {
        &self.layouts[kind as usize]
    }

    /// Returns the specialized `AnyHitOutAcceptHit`/`ClosestHitIn` layout
    /// pair for an actual attribute size of `units`, building and caching
    /// it on first use.
    ///
    /// # Panics
    ///
    /// Panics if `units` is not strictly smaller than the worst case (the
    /// worst-case layouts cover that) or if this info reserves no attribute
    /// storage at all.
    pub fn specialized_hit_group(&self, units: u32) -> Arc<HitGroupLayouts> {
        assert!(
            units < self.max_hit_attribute_units,
            "worst-case layouts already cover {} attribute units",
            units,
        );
        self.specialized
            .get_or_insert(units, || self.build_hit_group(units))
    }

    fn build_hit_group(&self, units: u32) -> HitGroupLayouts {
        let node = self
            .hit_attributes
            .expect("specialization requires hit attribute storage");
        let register_bytes = self.layout_config.register_bytes;
        let prefix = info_prefix(&self.config, register_bytes);

        let mut specialized = [None, None];
        for (slot, kind) in [
            SerializationLayoutKind::AnyHitOutAcceptHit,
            SerializationLayoutKind::ClosestHitIn,
        ]
        .into_iter()
        .enumerate()
        {
            let base = self.layout(kind);
            let storage = base
                .node_storage(node)
                .expect("worst-case layout carries the attribute node");
            assert!(
                storage.intervals.len() == 1,
                "hit attribute storage must be contiguous",
            );
            let begin = storage.intervals[0].begin;

            // Start from a copy, then trim the attribute interval in place.
            // Offsets of all other fields are untouched.
            let mut layout = (**base).clone();
            if units == 0 {
                layout.storage.shift_remove(&node);
                layout.hit_attributes = None;
            } else {
                layout.storage.insert(
                    node,
                    NodeStorage {
                        intervals: smallvec![IndexInterval {
                            begin,
                            end: begin + units,
                        }],
                    },
                );
            }
            layout.storage_units = layout
                .storage
                .values()
                .flat_map(|storage| storage.intervals.iter())
                .map(|interval| interval.end)
                .max()
                .unwrap_or(0);
            layout.name = format!("{}.{}", prefix, layout_suffix(Some(kind), Some(units)));

            validate_layout(&self.tree, &layout, register_bytes);
            validate_cross_layout_consistency(&[base.as_ref(), &layout], self.hit_attributes);
            trace!("{}", layout);

            specialized[slot] = Some(Arc::new(layout));
        }

        let [any_hit, closest_hit] = specialized;
        HitGroupLayouts {
            hit_attribute_units: units,
            any_hit_out_accept_hit: any_hit.expect("built above"),
            closest_hit_in: closest_hit.expect("built above"),
        }
    }

    /// Bytes of memory-backed storage the payload needs beyond the register
    /// budget; zero when everything fits in registers.
    pub fn memory_storage_bytes(&self) -> u32 {
        self.max_storage_units
            .saturating_sub(self.layout_config.payload_register_count)
            * self.layout_config.register_bytes
    }
}

/// Serialization info for a callable-shader call. Access qualifiers do not
/// apply here; every field is copied in and out, through a single layout.
#[derive(Debug)]
pub struct CallShaderSerializationInfo {
    /// The payload shape this info was computed for. The hit attribute
    /// budget is irrelevant for callable shaders and is not part of the
    /// identity of this info.
    pub payload: PayloadShape,
    /// The layout configuration this info was computed under.
    pub layout_config: LayoutConfig,
    pub tree: FieldTree,
    pub layout: Arc<SerializationLayout>,
    pub overflow_pointer: Option<NodeId>,
    pub max_storage_units: u32,
}

impl CallShaderSerializationInfo {
    /// Computes the serialization info for `payload`. The tree must be the
    /// trivially qualified field tree of `payload`.
    pub fn create(
        payload: &PayloadShape,
        layout_config: &LayoutConfig,
        order: &PackingOrder,
        mut tree: FieldTree,
    ) -> Result<Arc<CallShaderSerializationInfo>, LayoutError> {
        // Every field is live in the single layout.
        let nodes = tree
            .collect_representatives()
            .into_iter()
            .map(|node| LayoutNodeInfo {
                node,
                fixed: smallvec![],
                live_kinds: 1,
            })
            .collect();

        let name = format!(
            "{}.{}",
            payload.name().unwrap_or("payload"),
            layout_suffix(None, None),
        );
        let root = tree.root();
        let computed = compute_layouts(
            &mut tree,
            order,
            layout_config.register_bytes,
            LayoutRequest {
                nodes,
                layout_names: vec![name],
                root,
                hit_attributes: None,
                register_budget: layout_config.payload_register_count,
            },
        )?;

        let mut layouts = computed.layouts;
        let layout = layouts.pop().expect("one layout requested");

        validate_layout(&tree, &layout, layout_config.register_bytes);

        debug!(
            "computed callable serialization info `{}`: {} units, overflow pointer: {}",
            layout.name,
            computed.max_storage_units,
            computed.overflow_pointer.is_some(),
        );
        trace!("{}", layout);

        Ok(Arc::new(CallShaderSerializationInfo {
            payload: payload.clone(),
            layout_config: *layout_config,
            tree,
            layout: Arc::new(layout),
            overflow_pointer: computed.overflow_pointer,
            max_storage_units: computed.max_storage_units,
        }))
    }

    /// Bytes of memory-backed storage needed beyond the register budget.
    pub fn memory_storage_bytes(&self) -> u32 {
        self.max_storage_units
            .saturating_sub(self.layout_config.payload_register_count)
            * self.layout_config.register_bytes
    }
}

/// Serialization info of a payload for either kind of call.
#[derive(Clone, Debug)]
pub enum SerializationInfo {
    TraceRay(Arc<TraceRaySerializationInfo>),
    CallShader(Arc<CallShaderSerializationInfo>),
}

impl SerializationInfo {
    /// Maximum unit count over every layout of this info.
    pub fn max_storage_units(&self) -> u32 {
        match self {
            SerializationInfo::TraceRay(info) => info.max_storage_units,
            SerializationInfo::CallShader(info) => info.max_storage_units,
        }
    }

    /// Node of the overflow memory pointer, if one is needed.
    pub fn overflow_pointer(&self) -> Option<NodeId> {
        match self {
            SerializationInfo::TraceRay(info) => info.overflow_pointer,
            SerializationInfo::CallShader(info) => info.overflow_pointer,
        }
    }

    /// The trace variant, if this is one.
    pub fn as_trace_ray(&self) -> Option<&Arc<TraceRaySerializationInfo>> {
        match self {
            SerializationInfo::TraceRay(info) => Some(info),
            SerializationInfo::CallShader(_) => None,
        }
    }

    /// The callable variant, if this is one.
    pub fn as_call_shader(&self) -> Option<&Arc<CallShaderSerializationInfo>> {
        match self {
            SerializationInfo::CallShader(info) => Some(info),
            SerializationInfo::TraceRay(_) => None,
        }
    }
}

/// The access mask of payload-resident hit attribute storage: written by
/// any-hit, read back in any-hit and closest-hit.
fn hit_attribute_mask() -> AccessMask {
    AccessMask::empty()
        .with(PayloadStage::AnyHit, AccessKind::Write)
        .with(PayloadStage::AnyHit, AccessKind::Read)
        .with(PayloadStage::ClosestHit, AccessKind::Read)
}

/// Layout node infos for the representative fields of the tree.
fn layout_nodes(tree: &FieldTree, table: &LivenessTable) -> Vec<LayoutNodeInfo> {
    tree.collect_representatives()
        .into_iter()
        .map(|node| {
            let class = tree
                .node(node)
                .lifetime()
                .expect("representatives carry a lifetime class");
            LayoutNodeInfo {
                node,
                fixed: smallvec![],
                live_kinds: table.live_kinds(class),
            }
        })
        .collect()
}

fn info_prefix(config: &PayloadConfig, register_bytes: u32) -> String {
    let mut prefix = config.payload.name().unwrap_or("payload").to_owned();
    if config.max_hit_attribute_bytes != 0 {
        prefix.push_str(&format!(
            ".attr_max_{}",
            config.max_hit_attribute_bytes / register_bytes,
        ));
    }
    prefix
}

/// The name suffix of one layout; `None` marks the callable-shader layout.
fn layout_suffix(kind: Option<SerializationLayoutKind>, attribute_units: Option<u32>) -> String {
    let mut suffix = match kind {
        Some(kind) => format!("layout_{}_{}", kind as usize, kind),
        None => "layout_callshader".to_owned(),
    };
    if let Some(units) = attribute_units {
        suffix.push_str(&format!(".payload_attr_{}", units));
    }
    suffix
}
