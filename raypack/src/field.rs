// Copyright (c) 2024 The raypack developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Payload shapes, access annotations, and the qualified field tree.
//!
//! For every payload record, the access qualifiers of its possibly nested
//! fields are stored in a [`FieldTree`], whose structure follows the nested
//! field structure of the record. Fields of record type get one child node
//! per element, even when elements share a type; arrays and vectors are not
//! dissolved and stay leaf nodes.
//!
//! A payload may contain unannotated fields of a previously registered
//! payload record type; the qualifiers of such a field's subtree are copied
//! from the registered type (same shape, same qualifiers), never re-derived.
//! When no annotations exist at all, every field is readable and writable by
//! every stage.
//!
//! The tree is an arena owned as one value: nodes reference each other by
//! [`NodeId`], and all downstream maps are keyed by node id, never by
//! address.

use crate::access::AccessMask;
use crate::lifetime::LifetimeClass;
use foldhash::HashMap;
use std::error::Error;
use std::fmt::{Display, Error as FmtError, Formatter};

/// The annotation tag marking a field access annotation.
pub const FIELD_ACCESS_TAG: u32 = 0;

/// Structural description of a payload field type.
///
/// Only field order and sizes are semantically relevant; record names are
/// optional and take part in identity the way a nominal type name would.
/// Shape values are used as cache keys, so two structurally equal
/// descriptions always reach the same serialization info.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PayloadShape {
    /// A non-record field of the given byte size. Vectors, arrays and
    /// matrices are described as one primitive of their total size.
    Primitive { size: u32 },
    /// A record with ordered fields.
    Record {
        name: Option<String>,
        fields: Vec<PayloadShape>,
    },
}

impl PayloadShape {
    /// A primitive field of `size` bytes.
    #[inline]
    pub fn primitive(size: u32) -> Self {
        PayloadShape::Primitive { size }
    }

    /// An anonymous record.
    #[inline]
    pub fn record(fields: Vec<PayloadShape>) -> Self {
        PayloadShape::Record { name: None, fields }
    }

    /// A named record.
    #[inline]
    pub fn named_record(name: impl Into<String>, fields: Vec<PayloadShape>) -> Self {
        PayloadShape::Record {
            name: Some(name.into()),
            fields,
        }
    }

    /// The serialized size of the shape in bytes; for records, the sum of
    /// the field sizes (the serialized form is tightly packed).
    pub fn size_bytes(&self) -> u32 {
        match self {
            PayloadShape::Primitive { size } => *size,
            PayloadShape::Record { fields, .. } => {
                fields.iter().map(PayloadShape::size_bytes).sum()
            }
        }
    }

    /// Whether this shape is a record.
    #[inline]
    pub fn is_record(&self) -> bool {
        matches!(self, PayloadShape::Record { .. })
    }

    /// The record name, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            PayloadShape::Primitive { .. } => None,
            PayloadShape::Record { name, .. } => name.as_deref(),
        }
    }
}

/// One entry of a per-field annotation table, in the fixed tuple-of-tags
/// format: a tag and a value. For [`FIELD_ACCESS_TAG`], the value is the raw
/// bit representation of an [`AccessMask`]; a value of zero means the field
/// carries no mask of its own (it is either `write() : read()` or a nested
/// payload field, which is disambiguated while building the tree).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldAnnotation {
    pub tag: u32,
    pub value: u32,
}

impl FieldAnnotation {
    /// The annotation encoding of `mask`. Importing the result yields the
    /// same mask bit for bit.
    #[inline]
    pub fn access(mask: AccessMask) -> Self {
        FieldAnnotation {
            tag: FIELD_ACCESS_TAG,
            value: mask.bits() as u32,
        }
    }
}

/// Error while importing annotation metadata or deriving qualifiers from
/// it. All variants indicate a defect in the tooling that produced the
/// metadata, not a recoverable data condition; callers abort the
/// compilation unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnnotationError {
    /// An annotated payload type is not a record.
    NonRecordPayload,
    /// The annotation table length disagrees with the record's field count.
    FieldCountMismatch { expected: usize, provided: usize },
    /// An annotation carries an unknown tag.
    UnrecognizedTag { tag: u32 },
    /// An access annotation value does not fit the mask encoding.
    InvalidMaskValue { value: u32 },
    /// The same payload shape was registered twice.
    DuplicatePayload { name: Option<String> },
    /// A non-empty access mask matches no lifetime class.
    UnclassifiableMask { mask: AccessMask },
}

impl Error for AnnotationError {}

impl Display for AnnotationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            AnnotationError::NonRecordPayload => {
                write!(f, "annotated payload type is not a record")
            }
            AnnotationError::FieldCountMismatch { expected, provided } => write!(
                f,
                "annotation table has {} entries for a record with {} fields",
                provided, expected,
            ),
            AnnotationError::UnrecognizedTag { tag } => {
                write!(f, "unrecognized field annotation tag {}", tag)
            }
            AnnotationError::InvalidMaskValue { value } => {
                write!(f, "field access annotation value {:#x} is not a valid mask", value)
            }
            AnnotationError::DuplicatePayload { name } => write!(
                f,
                "duplicate annotations for payload type `{}`",
                name.as_deref().unwrap_or("<unnamed>"),
            ),
            AnnotationError::UnclassifiableMask { mask } => {
                write!(f, "access mask `{}` matches no lifetime class", mask)
            }
        }
    }
}

/// Validated per-field access masks of every annotated payload type,
/// keyed structurally by shape.
#[derive(Clone, Debug, Default)]
pub struct AnnotationRegistry {
    entries: HashMap<PayloadShape, Vec<Option<AccessMask>>>,
}

impl AnnotationRegistry {
    /// Creates an empty registry.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Imports a set of `(payload shape, annotation table)` pairs.
    pub fn import<I>(annotations: I) -> Result<Self, AnnotationError>
    where
        I: IntoIterator<Item = (PayloadShape, Vec<FieldAnnotation>)>,
    {
        let mut registry = Self::new();
        for (shape, table) in annotations {
            registry.insert(shape, &table)?;
        }
        Ok(registry)
    }

    /// Registers the annotation table of one payload type.
    pub fn insert(
        &mut self,
        shape: PayloadShape,
        table: &[FieldAnnotation],
    ) -> Result<(), AnnotationError> {
        let PayloadShape::Record { fields, .. } = &shape else {
            return Err(AnnotationError::NonRecordPayload);
        };
        if fields.len() != table.len() {
            return Err(AnnotationError::FieldCountMismatch {
                expected: fields.len(),
                provided: table.len(),
            });
        }

        let mut masks = Vec::with_capacity(table.len());
        for annotation in table {
            if annotation.tag != FIELD_ACCESS_TAG {
                return Err(AnnotationError::UnrecognizedTag {
                    tag: annotation.tag,
                });
            }
            if annotation.value > u8::MAX as u32 {
                return Err(AnnotationError::InvalidMaskValue {
                    value: annotation.value,
                });
            }
            // A zero value stays unset rather than becoming an empty mask;
            // whether it means `write() : read()` or a nested payload field
            // is only decidable during tree expansion.
            masks.push(if annotation.value == 0 {
                None
            } else {
                Some(AccessMask::from_bits(annotation.value as u8))
            });
        }

        if self.entries.contains_key(&shape) {
            return Err(AnnotationError::DuplicatePayload {
                name: shape.name().map(str::to_owned),
            });
        }
        self.entries.insert(shape, masks);
        Ok(())
    }

    /// Whether annotations for `shape` are registered.
    #[inline]
    pub fn contains(&self, shape: &PayloadShape) -> bool {
        self.entries.contains_key(shape)
    }

    fn field_masks(&self, shape: &PayloadShape) -> Option<&[Option<AccessMask>]> {
        self.entries.get(shape).map(Vec::as_slice)
    }
}

/// Identifies a node within one [`FieldTree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// The index of the node in its tree.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One node of a field tree: the payload itself for the root, otherwise a
/// field of the parent record.
#[derive(Clone, Debug)]
pub struct FieldNode {
    shape: PayloadShape,
    children: Vec<NodeId>,
    access_mask: Option<AccessMask>,
    lifetime: Option<LifetimeClass>,
}

impl FieldNode {
    /// The shape of the field this node represents.
    #[inline]
    pub fn shape(&self) -> &PayloadShape {
        &self.shape
    }

    /// Child nodes, in field declaration order. Empty for primitives and
    /// empty records.
    #[inline]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// The access mask, if one is known for this node. When set, the same
    /// mask applies to the node's whole subtree.
    #[inline]
    pub fn access_mask(&self) -> Option<AccessMask> {
        self.access_mask
    }

    /// The lifetime class: set for leaves with a non-empty mask, and for
    /// records whose children all share one class. Fields without a class
    /// appear in no serialization layout.
    #[inline]
    pub fn lifetime(&self) -> Option<LifetimeClass> {
        self.lifetime
    }

    /// The serialized size of the field in bytes.
    #[inline]
    pub fn size_bytes(&self) -> u32 {
        self.shape.size_bytes()
    }
}

/// The qualified field tree of one payload record, stored as an arena.
///
/// Auxiliary nodes that are not part of the record (the overflow pointer
/// and hit attribute storage) live in the same arena, detached from the
/// root, so that serialization layouts key every field uniformly by
/// [`NodeId`]. The tree is immutable once its serialization info has been
/// constructed.
#[derive(Clone, Debug)]
pub struct FieldTree {
    nodes: Vec<FieldNode>,
    root: NodeId,
}

impl FieldTree {
    /// Builds the qualified tree for `shape`, taking annotations from
    /// `registry`. An unregistered shape gets the trivial qualification
    /// (every stage reads and writes every field).
    pub fn with_annotations(
        shape: &PayloadShape,
        registry: &AnnotationRegistry,
    ) -> Result<FieldTree, AnnotationError> {
        let mut tree = FieldTree {
            nodes: Vec::new(),
            root: NodeId(0),
        };
        let root = tree.alloc(shape.clone());

        match registry.field_masks(shape) {
            Some(masks) => {
                let PayloadShape::Record { fields, .. } = shape else {
                    // The registry only ever holds records.
                    unreachable!("annotations registered for a non-record shape");
                };
                for (field, mask) in fields.iter().zip(masks) {
                    let child = tree.alloc(field.clone());
                    tree.nodes[child.index()].access_mask = *mask;
                    tree.nodes[root.index()].children.push(child);
                }
            }
            None => {
                tree.nodes[root.index()].access_mask = Some(AccessMask::read_write_all());
            }
        }

        tree.expand(root, registry)?;
        Ok(tree)
    }

    /// Builds the tree with trivial qualifiers, ignoring any annotations.
    /// Used for call-shader payloads, whose fields are always fully copied.
    pub fn trivial(shape: &PayloadShape) -> FieldTree {
        Self::with_annotations(shape, &AnnotationRegistry::new())
            .expect("trivial qualifiers always classify")
    }

    /// The root node, representing the payload itself.
    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The node behind `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not an id of this tree.
    #[inline]
    pub fn node(&self, id: NodeId) -> &FieldNode {
        &self.nodes[id.index()]
    }

    /// Number of nodes, including detached auxiliary nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Appends a node that is not part of the payload record, deriving its
    /// lifetime class from `mask`. Used for the overflow pointer and hit
    /// attribute storage.
    pub(crate) fn push_detached(&mut self, shape: PayloadShape, mask: AccessMask) -> NodeId {
        let id = self.alloc(shape);
        let node = &mut self.nodes[id.index()];
        node.lifetime = LifetimeClass::from_access_mask(mask);
        node.access_mask = Some(mask);
        id
    }

    /// Collects the representative nodes of the payload: a minimal set
    /// covering every non-empty field exactly once. A record node with a
    /// uniform mask and class represents its whole subtree as one field,
    /// which avoids per-field padding of smaller-than-unit members; mixed
    /// records are dissolved into their children. Fields without a lifetime
    /// class, and empty fields, are not collected.
    pub(crate) fn collect_representatives(&self) -> Vec<NodeId> {
        let mut result = Vec::new();
        self.collect_into(self.root, &mut result);
        result
    }

    fn collect_into(&self, id: NodeId, result: &mut Vec<NodeId>) {
        let node = &self.nodes[id.index()];
        if node.shape.is_record() {
            if node.lifetime.is_some() && node.access_mask.is_some() {
                if node.size_bytes() != 0 {
                    result.push(id);
                }
            } else {
                for &child in &node.children {
                    self.collect_into(child, result);
                }
            }
        } else if node.lifetime.is_some() && node.size_bytes() != 0 {
            result.push(id);
        }
    }

    fn alloc(&mut self, shape: PayloadShape) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(FieldNode {
            shape,
            children: Vec::new(),
            access_mask: None,
            lifetime: None,
        });
        id
    }

    /// Recursively creates child nodes and derives masks and lifetime
    /// classes.
    ///
    /// A set mask on a node propagates to its whole subtree. An unset mask
    /// either marks a nested payload field (children take the registered
    /// masks of that payload type) or a `write() : read()` field, which
    /// receives the empty mask. Leaves with a non-empty mask get their
    /// lifetime class; records get the common class of their children if
    /// there is exactly one, and the common mask likewise.
    fn expand(&mut self, id: NodeId, registry: &AnnotationRegistry) -> Result<(), AnnotationError> {
        let shape = self.nodes[id.index()].shape.clone();

        let mut nested_masks: Option<Vec<Option<AccessMask>>> = None;
        if self.nodes[id.index()].access_mask.is_none() {
            if id == self.root && registry.contains(&shape) {
                // The root of an annotated payload: children are already
                // populated from its own table.
            } else if let Some(masks) = registry.field_masks(&shape) {
                nested_masks = Some(masks.to_vec());
            } else {
                // Not a nested payload, so this must be an unqualified
                // `write() : read()` field.
                self.nodes[id.index()].access_mask = Some(AccessMask::empty());
            }
        }

        let fields: &[PayloadShape] = match &shape {
            PayloadShape::Record { fields, .. } if !fields.is_empty() => fields,
            _ => {
                // A leaf: primitive or empty record.
                if let Some(mask) = self.nodes[id.index()].access_mask {
                    if !mask.is_empty() {
                        match LifetimeClass::from_access_mask(mask) {
                            Some(class) => self.nodes[id.index()].lifetime = Some(class),
                            None => return Err(AnnotationError::UnclassifiableMask { mask }),
                        }
                    }
                }
                return Ok(());
            }
        };

        let prepopulated = !self.nodes[id.index()].children.is_empty();
        if prepopulated {
            assert_eq!(
                self.nodes[id.index()].children.len(),
                fields.len(),
                "prepopulated children disagree with the record shape",
            );
        }
        for (index, field) in fields.iter().enumerate() {
            let inherited = if let Some(mask) = self.nodes[id.index()].access_mask {
                Some(mask)
            } else if let Some(masks) = &nested_masks {
                masks[index]
            } else {
                None
            };
            if !prepopulated {
                let child = self.alloc(field.clone());
                self.nodes[child.index()].access_mask = inherited;
                self.nodes[id.index()].children.push(child);
            }
        }

        let children = self.nodes[id.index()].children.clone();
        for &child in &children {
            self.expand(child, registry)?;
        }

        let first = &self.nodes[children[0].index()];
        let (first_lifetime, first_mask) = (first.lifetime, first.access_mask);
        let uniform_lifetime = children
            .iter()
            .all(|&child| self.nodes[child.index()].lifetime == first_lifetime);
        let uniform_mask = children
            .iter()
            .all(|&child| self.nodes[child.index()].access_mask == first_mask);
        if uniform_lifetime {
            self.nodes[id.index()].lifetime = first_lifetime;
        }
        if uniform_mask && first_mask.is_some() {
            self.nodes[id.index()].access_mask = first_mask;
        }
        Ok(())
    }

    fn fmt_node(&self, f: &mut Formatter<'_>, id: NodeId, depth: usize) -> Result<(), FmtError> {
        let node = &self.nodes[id.index()];
        write!(f, "{:indent$}access: ", "", indent = 2 * (depth + 1))?;
        match node.access_mask {
            Some(mask) => write!(f, "{}", mask)?,
            None => write!(f, "<from nested payload type>")?,
        }
        write!(f, ", lifetime: ")?;
        match node.lifetime {
            Some(class) => write!(f, "{}", class)?,
            None => write!(f, "<none>")?,
        }
        if let Some(name) = node.shape.name() {
            write!(f, ", type: {}", name)?;
        }
        writeln!(f)?;
        for &child in &node.children {
            self.fmt_node(f, child, depth + 1)?;
        }
        Ok(())
    }
}

impl Display for FieldTree {
    /// Prints the tree one line per node, indented by depth.
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        self.fmt_node(f, self.root, 0)
    }
}
