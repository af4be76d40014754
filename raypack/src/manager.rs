// Copyright (c) 2024 The raypack developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The serialization info manager: imports payload annotations, memoizes
//! serialization infos per payload configuration, and answers the layout
//! queries of the code generator.
//!
//! All caches are keyed structurally, so two requests describing the same
//! payload shape and budget return the same info without recomputation.
//! Entries are written at most once; concurrent callers with the same key
//! race benignly and all observe the first inserted value.

use crate::access::{AccessKind, PayloadStage};
use crate::cache::OnceCache;
use crate::field::{
    AnnotationError, AnnotationRegistry, FieldAnnotation, FieldTree, PayloadShape,
};
use crate::layout::{layout_kind_for, LayoutError, SerializationLayout, SerializationLayoutKind};
use crate::lifetime::PackingOrder;
use crate::serialization::{
    CallShaderSerializationInfo, PayloadConfig, SerializationInfo, TraceRaySerializationInfo,
};
use crate::LayoutConfig;
use std::error::Error;
use std::fmt::{Display, Error as FmtError, Formatter};
use std::sync::Arc;

/// The shader kinds of the surrounding pipeline, used to pick the
/// serialization flavor of a payload use site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    RayGeneration,
    Intersection,
    AnyHit,
    ClosestHit,
    Miss,
    Callable,
}

/// How an any-hit shader exits, selecting among its outgoing layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AnyHitExitKind {
    IgnoreHit,
    AcceptHit,
    AcceptHitAndEndSearch,
}

/// Which serialization flavors to consider when sizing payload storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MaxStorageConsideration {
    TraceRayOnly,
    CallShaderOnly,
    TraceRayAndCallShader,
}

/// Error while building serialization data for a payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SerializationError {
    /// Malformed annotation metadata; indicates an upstream tooling defect.
    Annotation(AnnotationError),
    /// A layout configuration that can never produce a usable layout.
    Layout(LayoutError),
}

impl Error for SerializationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SerializationError::Annotation(err) => Some(err),
            SerializationError::Layout(err) => Some(err),
        }
    }
}

impl Display for SerializationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            SerializationError::Annotation(_) => write!(f, "malformed payload annotations"),
            SerializationError::Layout(_) => write!(f, "invalid layout configuration"),
        }
    }
}

impl From<AnnotationError> for SerializationError {
    fn from(err: AnnotationError) -> Self {
        SerializationError::Annotation(err)
    }
}

impl From<LayoutError> for SerializationError {
    fn from(err: LayoutError) -> Self {
        SerializationError::Layout(err)
    }
}

/// Builds, caches and serves serialization infos for every payload type of
/// one compilation unit.
#[derive(Debug)]
pub struct SerializationInfoManager {
    layout_config: LayoutConfig,
    order: PackingOrder,
    registry: AnnotationRegistry,
    trace_ray: OnceCache<PayloadConfig, TraceRaySerializationInfo>,
    call_shader: OnceCache<PayloadShape, CallShaderSerializationInfo>,
}

impl SerializationInfoManager {
    /// Creates a manager over the given layout configuration and the
    /// annotation tables of the compilation unit.
    pub fn new<I>(layout_config: LayoutConfig, annotations: I) -> Result<Self, AnnotationError>
    where
        I: IntoIterator<Item = (PayloadShape, Vec<FieldAnnotation>)>,
    {
        Ok(Self {
            layout_config,
            order: PackingOrder::default(),
            registry: AnnotationRegistry::import(annotations)?,
            trace_ray: OnceCache::new(),
            call_shader: OnceCache::new(),
        })
    }

    /// The layout configuration of this manager.
    #[inline]
    pub fn layout_config(&self) -> &LayoutConfig {
        &self.layout_config
    }

    /// Returns the serialization info appropriate for a payload used from
    /// the given shader stage.
    ///
    /// # Panics
    ///
    /// Panics for [`ShaderStage::RayGeneration`], which has no incoming
    /// payload.
    pub fn get_or_create(
        &self,
        config: &PayloadConfig,
        stage: ShaderStage,
    ) -> Result<SerializationInfo, SerializationError> {
        match stage {
            ShaderStage::RayGeneration => {
                panic!("ray generation shaders have no incoming payload")
            }
            ShaderStage::Intersection
            | ShaderStage::AnyHit
            | ShaderStage::ClosestHit
            | ShaderStage::Miss => Ok(SerializationInfo::TraceRay(
                self.get_or_create_trace_ray(config)?,
            )),
            ShaderStage::Callable => Ok(SerializationInfo::CallShader(
                self.get_or_create_call_shader(config)?,
            )),
        }
    }

    /// Returns the trace serialization info for `config`, computing it if
    /// this payload configuration has not been seen before. Payload types
    /// without registered annotations get the trivial qualification (every
    /// stage reads and writes everything).
    pub fn get_or_create_trace_ray(
        &self,
        config: &PayloadConfig,
    ) -> Result<Arc<TraceRaySerializationInfo>, SerializationError> {
        self.trace_ray.get_or_try_insert(config, || {
            let tree = FieldTree::with_annotations(&config.payload, &self.registry)?;
            let info = TraceRaySerializationInfo::create(
                config,
                &self.layout_config,
                &self.order,
                tree,
            )?;
            Ok::<_, SerializationError>((config.clone(), info))
        })
    }

    /// Returns the callable-shader serialization info for `config`. Access
    /// qualifiers and the hit attribute budget do not apply to callable
    /// shaders, so the cache is keyed by the payload shape alone.
    pub fn get_or_create_call_shader(
        &self,
        config: &PayloadConfig,
    ) -> Result<Arc<CallShaderSerializationInfo>, SerializationError> {
        self.call_shader.get_or_try_insert(&config.payload, || {
            let tree = FieldTree::trivial(&config.payload);
            let info = CallShaderSerializationInfo::create(
                &config.payload,
                &self.layout_config,
                &self.order,
                tree,
            )?;
            Ok::<_, SerializationError>((config.payload.clone(), info))
        })
    }

    /// Returns the layout of `kind` for a trace payload.
    ///
    /// For `AnyHitOutAcceptHit` and `ClosestHitIn` the layout depends on
    /// the actually committed hit attribute type, whose size must be given
    /// in `hit_attribute_bytes`; a specialized layout is built and cached
    /// when it is smaller than the worst case. All other kinds ignore the
    /// argument.
    pub fn trace_ray_layout(
        &self,
        info: &TraceRaySerializationInfo,
        kind: SerializationLayoutKind,
        hit_attribute_bytes: Option<u32>,
    ) -> Result<Arc<SerializationLayout>, SerializationError> {
        if kind != SerializationLayoutKind::AnyHitOutAcceptHit
            && kind != SerializationLayoutKind::ClosestHitIn
        {
            return Ok(info.layout(kind).clone());
        }

        let bytes = hit_attribute_bytes.expect("hit attribute size required for this layout");
        if bytes > info.config.max_hit_attribute_bytes {
            return Err(LayoutError::HitAttributesExceedBudget {
                bytes,
                budget: info.config.max_hit_attribute_bytes,
            }
            .into());
        }
        let inline_bytes = self.layout_config.inline_hit_attribute_bytes;
        let payload_bytes = bytes.saturating_sub(inline_bytes);
        let units = payload_bytes.div_ceil(self.layout_config.register_bytes);
        assert!(
            units <= info.max_hit_attribute_units,
            "hit attributes exceed the reserved worst case",
        );
        if units == info.max_hit_attribute_units {
            // Worst-case attributes; the default layout already fits.
            return Ok(info.layout(kind).clone());
        }

        let group = info.specialized_hit_group(units);
        Ok(match kind {
            SerializationLayoutKind::AnyHitOutAcceptHit => group.any_hit_out_accept_hit.clone(),
            SerializationLayoutKind::ClosestHitIn => group.closest_hit_in.clone(),
            _ => unreachable!(),
        })
    }

    /// The layout of the payload incoming to a shader on entry.
    ///
    /// # Panics
    ///
    /// Panics for ray generation and intersection shaders (no payload
    /// layout), and if `info` does not match the stage's flavor.
    pub fn shader_entry_layout(
        &self,
        info: &SerializationInfo,
        stage: ShaderStage,
        hit_attribute_bytes: Option<u32>,
    ) -> Result<Arc<SerializationLayout>, SerializationError> {
        match stage {
            ShaderStage::Callable => Ok(info
                .as_call_shader()
                .expect("callable stage with a trace payload")
                .layout
                .clone()),
            ShaderStage::AnyHit | ShaderStage::ClosestHit | ShaderStage::Miss => {
                let kind = layout_kind_for(payload_stage(stage), AccessKind::Read)
                    .expect("entry layout is unique for non-caller stages");
                let info = info
                    .as_trace_ray()
                    .expect("trace stage with a callable payload");
                self.trace_ray_layout(info, kind, hit_attribute_bytes)
            }
            ShaderStage::RayGeneration | ShaderStage::Intersection => {
                panic!("{:?} shaders have no payload serialization layout", stage)
            }
        }
    }

    /// The layout of the payload outgoing from a shader on exit. For
    /// any-hit shaders the exit kind selects among the three outgoing
    /// layouts and must be given.
    ///
    /// # Panics
    ///
    /// Panics for ray generation and intersection shaders, for an any-hit
    /// exit without `exit_kind`, and if `info` does not match the stage's
    /// flavor.
    pub fn shader_exit_layout(
        &self,
        info: &SerializationInfo,
        stage: ShaderStage,
        hit_attribute_bytes: Option<u32>,
        exit_kind: Option<AnyHitExitKind>,
    ) -> Result<Arc<SerializationLayout>, SerializationError> {
        match stage {
            ShaderStage::Callable => Ok(info
                .as_call_shader()
                .expect("callable stage with a trace payload")
                .layout
                .clone()),
            ShaderStage::AnyHit | ShaderStage::ClosestHit | ShaderStage::Miss => {
                let kind = match layout_kind_for(payload_stage(stage), AccessKind::Write) {
                    Some(kind) => kind,
                    None => match exit_kind.expect("any-hit exits need an exit kind") {
                        AnyHitExitKind::IgnoreHit => {
                            SerializationLayoutKind::ANY_HIT_OUT_IGNORE_HIT
                        }
                        AnyHitExitKind::AcceptHit => SerializationLayoutKind::AnyHitOutAcceptHit,
                        AnyHitExitKind::AcceptHitAndEndSearch => {
                            SerializationLayoutKind::ANY_HIT_OUT_ACCEPT_HIT_AND_END_SEARCH
                        }
                    },
                };
                let info = info
                    .as_trace_ray()
                    .expect("trace stage with a callable payload");
                self.trace_ray_layout(info, kind, hit_attribute_bytes)
            }
            ShaderStage::RayGeneration | ShaderStage::Intersection => {
                panic!("{:?} shaders have no payload serialization layout", stage)
            }
        }
    }

    /// The maximum number of units needed to store any serialization of the
    /// payload, over the considered flavors. Callers size stack space for
    /// the payload from this before any concrete layout is chosen.
    pub fn max_payload_storage_units(
        &self,
        config: &PayloadConfig,
        consideration: MaxStorageConsideration,
    ) -> Result<u32, SerializationError> {
        let mut result = 0;
        if matches!(
            consideration,
            MaxStorageConsideration::TraceRayOnly | MaxStorageConsideration::TraceRayAndCallShader,
        ) {
            result = result.max(self.get_or_create_trace_ray(config)?.max_storage_units);
        }
        if matches!(
            consideration,
            MaxStorageConsideration::CallShaderOnly
                | MaxStorageConsideration::TraceRayAndCallShader,
        ) {
            result = result.max(self.get_or_create_call_shader(config)?.max_storage_units);
        }
        Ok(result)
    }
}

/// The payload stage touched when entering or leaving a shader of `stage`.
fn payload_stage(stage: ShaderStage) -> PayloadStage {
    match stage {
        ShaderStage::AnyHit => PayloadStage::AnyHit,
        ShaderStage::ClosestHit => PayloadStage::ClosestHit,
        ShaderStage::Miss => PayloadStage::Miss,
        ShaderStage::RayGeneration | ShaderStage::Intersection | ShaderStage::Callable => {
            unreachable!("stage has no payload stage")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessMask;
    use crate::layout::IndexInterval;

    fn mask_of(write: PayloadStage, read: PayloadStage) -> AccessMask {
        AccessMask::empty()
            .with(write, AccessKind::Write)
            .with(read, AccessKind::Read)
    }

    fn manager_with(
        shape: &PayloadShape,
        masks: &[AccessMask],
        register_count: u32,
    ) -> SerializationInfoManager {
        let table: Vec<FieldAnnotation> =
            masks.iter().copied().map(FieldAnnotation::access).collect();
        SerializationInfoManager::new(
            LayoutConfig {
                payload_register_count: register_count,
                ..LayoutConfig::default()
            },
            [(shape.clone(), table)],
        )
        .unwrap()
    }

    #[test]
    fn memoizes_structurally_equal_requests() {
        let shape = PayloadShape::named_record("Payload", vec![PayloadShape::primitive(4)]);
        let manager = manager_with(
            &shape,
            &[mask_of(PayloadStage::Caller, PayloadStage::Caller)],
            8,
        );

        let config = PayloadConfig::new(shape.clone(), 0);
        let first = manager.get_or_create_trace_ray(&config).unwrap();
        // A structurally equal but separately built config hits the cache.
        let equal_config =
            PayloadConfig::new(PayloadShape::named_record("Payload", vec![PayloadShape::primitive(4)]), 0);
        let second = manager.get_or_create_trace_ray(&equal_config).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // A different hit attribute budget is a different configuration.
        let other = manager
            .get_or_create_trace_ray(&PayloadConfig::new(shape, 16))
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn call_shader_cache_ignores_attribute_budget() {
        let shape = PayloadShape::named_record("Payload", vec![PayloadShape::primitive(4)]);
        let manager = manager_with(
            &shape,
            &[mask_of(PayloadStage::Caller, PayloadStage::Caller)],
            8,
        );
        let a = manager
            .get_or_create_call_shader(&PayloadConfig::new(shape.clone(), 0))
            .unwrap();
        let b = manager
            .get_or_create_call_shader(&PayloadConfig::new(shape, 16))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn dispatches_by_shader_stage() {
        let shape = PayloadShape::named_record("Payload", vec![PayloadShape::primitive(4)]);
        let manager = manager_with(
            &shape,
            &[mask_of(PayloadStage::Caller, PayloadStage::Caller)],
            8,
        );
        let config = PayloadConfig::new(shape, 0);

        let trace = manager.get_or_create(&config, ShaderStage::ClosestHit).unwrap();
        assert!(trace.as_trace_ray().is_some());
        let callable = manager.get_or_create(&config, ShaderStage::Callable).unwrap();
        assert!(callable.as_call_shader().is_some());
    }

    #[test]
    #[should_panic]
    fn ray_generation_has_no_payload() {
        let shape = PayloadShape::record(vec![PayloadShape::primitive(4)]);
        let manager = SerializationInfoManager::new(LayoutConfig::default(), []).unwrap();
        let _ = manager.get_or_create(&PayloadConfig::new(shape, 0), ShaderStage::RayGeneration);
    }

    #[test]
    fn write_read_round_trip_uses_identical_intervals() {
        use PayloadStage::{Caller, ClosestHit, Miss};

        // A field written by the caller and read in closesthit and miss:
        // the interval used to write it at caller exit equals the interval
        // used to read it at both entries.
        let shape = PayloadShape::named_record(
            "RoundTrip",
            vec![PayloadShape::primitive(4), PayloadShape::primitive(8)],
        );
        let manager = manager_with(
            &shape,
            &[mask_of(Caller, Caller), {
                let mut mask = mask_of(Caller, ClosestHit);
                mask.set(Miss, AccessKind::Read, true);
                mask
            }],
            8,
        );
        let config = PayloadConfig::new(shape, 0);
        let info = manager.get_or_create_trace_ray(&config).unwrap();

        let field = info.tree.node(info.tree.root()).children()[1];
        let written = manager
            .trace_ray_layout(&info, SerializationLayoutKind::CallerOut, None)
            .unwrap();
        let read_closest = manager
            .trace_ray_layout(&info, SerializationLayoutKind::ClosestHitIn, Some(0))
            .unwrap();
        let read_miss = manager
            .trace_ray_layout(&info, SerializationLayoutKind::MissIn, None)
            .unwrap();

        let interval = written.node_storage(field).unwrap();
        assert_eq!(read_closest.node_storage(field).unwrap(), interval);
        assert_eq!(read_miss.node_storage(field).unwrap(), interval);
        assert_eq!(
            interval.intervals.as_slice(),
            &[IndexInterval { begin: 1, end: 3 }],
        );
    }

    #[test]
    fn entry_and_exit_layout_selection() {
        let shape = PayloadShape::named_record("Payload", vec![PayloadShape::primitive(4)]);
        let manager = manager_with(
            &shape,
            &[mask_of(PayloadStage::Caller, PayloadStage::Caller)],
            8,
        );
        let config = PayloadConfig::new(shape, 8);
        let info = manager.get_or_create(&config, ShaderStage::Miss).unwrap();

        let entry = manager
            .shader_entry_layout(&info, ShaderStage::Miss, None)
            .unwrap();
        assert!(entry.name.ends_with("miss_in"));
        let exit = manager
            .shader_exit_layout(&info, ShaderStage::Miss, None, None)
            .unwrap();
        assert!(exit.name.ends_with("miss_out"));

        // Any-hit exits disambiguate through the exit kind; ignoring the
        // hit keeps the incoming layout.
        let ignore = manager
            .shader_exit_layout(
                &info,
                ShaderStage::AnyHit,
                Some(8),
                Some(AnyHitExitKind::IgnoreHit),
            )
            .unwrap();
        let entry_any_hit = manager
            .shader_entry_layout(&info, ShaderStage::AnyHit, Some(8))
            .unwrap();
        assert_eq!(ignore.name, entry_any_hit.name);
    }

    #[test]
    fn specialization_only_below_worst_case() {
        let shape = PayloadShape::named_record("Attrs", vec![PayloadShape::primitive(4)]);
        let manager = manager_with(
            &shape,
            &[mask_of(PayloadStage::Caller, PayloadStage::ClosestHit)],
            8,
        );
        let config = PayloadConfig::new(shape, 16);
        let info = manager.get_or_create_trace_ray(&config).unwrap();
        assert_eq!(info.max_hit_attribute_units, 2);

        // Worst-case attributes use the default layout.
        let full = manager
            .trace_ray_layout(&info, SerializationLayoutKind::ClosestHitIn, Some(16))
            .unwrap();
        assert!(Arc::ptr_eq(&full, info.layout(SerializationLayoutKind::ClosestHitIn)));

        // Attributes fitting inline storage need no payload units at all.
        let inline_only = manager
            .trace_ray_layout(&info, SerializationLayoutKind::ClosestHitIn, Some(8))
            .unwrap();
        assert_eq!(inline_only.hit_attributes, None);
        assert_eq!(inline_only.storage_units, 1);

        // Oversized attributes are a configuration error.
        let result =
            manager.trace_ray_layout(&info, SerializationLayoutKind::ClosestHitIn, Some(32));
        assert_eq!(
            result.unwrap_err(),
            SerializationError::Layout(LayoutError::HitAttributesExceedBudget {
                bytes: 32,
                budget: 16,
            }),
        );
    }

    #[test]
    fn max_storage_considers_requested_flavors() {
        use PayloadStage::{Caller, ClosestHit};

        // Two fields of which only one is ever live per trace layout, but
        // both are always live for callable shaders: the callable layout is
        // larger.
        let shape = PayloadShape::named_record(
            "Sized",
            vec![PayloadShape::primitive(4), PayloadShape::primitive(4)],
        );
        let manager = manager_with(
            &shape,
            &[mask_of(Caller, ClosestHit), mask_of(ClosestHit, Caller)],
            8,
        );
        let config = PayloadConfig::new(shape, 0);

        let trace_only = manager
            .max_payload_storage_units(&config, MaxStorageConsideration::TraceRayOnly)
            .unwrap();
        let call_only = manager
            .max_payload_storage_units(&config, MaxStorageConsideration::CallShaderOnly)
            .unwrap();
        let both = manager
            .max_payload_storage_units(&config, MaxStorageConsideration::TraceRayAndCallShader)
            .unwrap();
        assert_eq!(trace_only, 1);
        assert_eq!(call_only, 2);
        assert_eq!(both, 2);
    }

    #[test]
    fn recomputation_is_deterministic() {
        use PayloadStage::{AnyHit, Caller, ClosestHit, Miss};

        // Two independent managers compute structurally identical infos
        // for the same inputs.
        let shape = PayloadShape::named_record(
            "Deterministic",
            vec![
                PayloadShape::primitive(4),
                PayloadShape::primitive(12),
                PayloadShape::primitive(4),
            ],
        );
        let masks = [
            mask_of(Caller, Caller),
            mask_of(AnyHit, ClosestHit),
            mask_of(Miss, Caller),
        ];
        let config = PayloadConfig::new(shape.clone(), 16);

        let first = manager_with(&shape, &masks, 16)
            .get_or_create_trace_ray(&config)
            .unwrap();
        let second = manager_with(&shape, &masks, 16)
            .get_or_create_trace_ray(&config)
            .unwrap();

        assert_eq!(first.max_storage_units, second.max_storage_units);
        assert_eq!(first.overflow_pointer, second.overflow_pointer);
        for kind in SerializationLayoutKind::ALL {
            let (lhs, rhs) = (first.layout(kind), second.layout(kind));
            assert_eq!(lhs.name, rhs.name);
            assert_eq!(lhs.storage_units, rhs.storage_units);
            let lhs_storage: Vec<_> = lhs.storage.iter().collect();
            let rhs_storage: Vec<_> = rhs.storage.iter().collect();
            assert_eq!(lhs_storage, rhs_storage);
        }
    }

    #[test]
    fn unannotated_shapes_get_trivial_qualifiers() {
        let manager = SerializationInfoManager::new(LayoutConfig::default(), []).unwrap();
        let shape = PayloadShape::record(vec![PayloadShape::primitive(4)]);
        let info = manager
            .get_or_create_trace_ray(&PayloadConfig::new(shape, 0))
            .unwrap();
        // All stages read and write, so the field is live in every layout.
        for kind in SerializationLayoutKind::ALL {
            assert_eq!(info.layout(kind).storage_units, 1);
        }
    }
}
