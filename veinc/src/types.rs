//! # Type Graph
//!
//! The statically known graph of user aggregate types. Nodes are types,
//! edges are reference fields. Shape classification and back-edge detection
//! both work on this graph.
//!
//! ## Representation
//!
//! Types live in a `Vec` and are addressed by [`TypeId`] index. Fields are
//! addressed by [`FieldId`] (owner type plus declaration index). Traversals
//! use explicit stacks and per-run side tables, so deeply nested or highly
//! recursive type graphs cannot overflow the native stack.
//!
//! A field whose target cannot be resolved in this compilation unit (for
//! example a type from another module that was never declared here) is kept
//! as [`FieldTarget::Unresolved`]; every analysis treats it conservatively.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::error::{AnalysisError, AnalysisResult};

// ============================================================================
// Identifiers
// ============================================================================

/// Index of a type in a [`TypeGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl TypeId {
    /// Create a new TypeId.
    pub const fn new(index: u32) -> Self {
        TypeId(index)
    }

    /// Get the index value.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// A field, identified by its owner type and declaration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId {
    /// The type declaring the field.
    pub owner: TypeId,
    /// Position in the owner's field list.
    pub index: u32,
}

impl FieldId {
    /// Create a new FieldId.
    pub const fn new(owner: TypeId, index: u32) -> Self {
        FieldId { owner, index }
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner, self.index)
    }
}

// ============================================================================
// Fields
// ============================================================================

/// Whether a reference field owns its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Strength {
    /// Owning reference, counted by every strategy.
    #[default]
    Strong,
    /// Non-owning reference, skipped by every release path.
    Weak,
}

/// An explicit user annotation on a field. Annotations override inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Annotation {
    /// `#[weak]`
    Weak,
    /// `#[strong]`
    Strong,
}

/// What a field points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldTarget {
    /// A reference to a type in this graph.
    Type(TypeId),
    /// A plain scalar, not a reference.
    Scalar,
    /// A reference to a type that could not be discovered.
    Unresolved(String),
}

impl FieldTarget {
    /// The target type, if the field is a resolved reference.
    pub fn type_id(&self) -> Option<TypeId> {
        match self {
            FieldTarget::Type(id) => Some(*id),
            FieldTarget::Scalar | FieldTarget::Unresolved(_) => None,
        }
    }

    /// Whether the field holds a reference (resolved or not).
    pub fn is_reference(&self) -> bool {
        !matches!(self, FieldTarget::Scalar)
    }
}

/// A field of a user type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEdge {
    /// Field identity.
    pub id: FieldId,
    /// Source-level field name.
    pub name: String,
    /// Field target.
    pub target: FieldTarget,
    /// Inferred or annotated strength.
    pub strength: Strength,
    /// User annotation, if any.
    pub annotation: Option<Annotation>,
}

impl FieldEdge {
    /// Whether the field is a weak reference.
    pub fn is_weak(&self) -> bool {
        self.strength == Strength::Weak
    }

    /// Whether the field is a strong reference to a resolved type.
    pub fn strong_target(&self) -> Option<TypeId> {
        match self.strength {
            Strength::Strong => self.target.type_id(),
            Strength::Weak => None,
        }
    }
}

/// A user aggregate type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeNode {
    /// Type identity.
    pub id: TypeId,
    /// Source-level type name.
    pub name: String,
    /// Fields in declaration order.
    pub fields: Vec<FieldEdge>,
}

impl TypeNode {
    /// Number of reference fields (strong or weak).
    pub fn reference_count(&self) -> usize {
        self.fields.iter().filter(|f| f.target.is_reference()).count()
    }
}

// ============================================================================
// Type Graph
// ============================================================================

/// Bytes of runtime header in front of every object.
pub const OBJECT_HEADER_SIZE: usize = 48;

/// Bytes per field slot in a runtime object.
pub const FIELD_SIZE: usize = 8;

/// The type graph of a compilation unit.
#[derive(Debug, Clone, Default)]
pub struct TypeGraph {
    nodes: Vec<TypeNode>,
    by_name: FxHashMap<String, TypeId>,
}

impl TypeGraph {
    /// Create an empty type graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a type, returning the existing id when the name is known.
    pub fn add_type(&mut self, name: impl Into<String>) -> TypeId {
        let name = name.into();
        if let Some(&id) = self.by_name.get(&name) {
            return id;
        }
        let id = TypeId::new(self.nodes.len() as u32);
        self.by_name.insert(name.clone(), id);
        self.nodes.push(TypeNode {
            id,
            name,
            fields: Vec::new(),
        });
        id
    }

    /// Add a field to a type.
    pub fn add_field(
        &mut self,
        owner: TypeId,
        name: impl Into<String>,
        target: FieldTarget,
        annotation: Option<Annotation>,
    ) -> AnalysisResult<FieldId> {
        let name = name.into();
        if let FieldTarget::Type(target) = &target {
            self.node(*target)?;
        }
        let node = self.node_mut(owner)?;
        if node.fields.iter().any(|f| f.name == name) {
            return Err(AnalysisError::DuplicateField {
                name: node.name.clone(),
                field: name,
            });
        }
        let id = FieldId::new(owner, node.fields.len() as u32);
        let strength = match annotation {
            Some(Annotation::Weak) => Strength::Weak,
            Some(Annotation::Strong) | None => Strength::Strong,
        };
        node.fields.push(FieldEdge {
            id,
            name,
            target,
            strength,
            annotation,
        });
        Ok(id)
    }

    /// Add an unannotated reference field.
    pub fn add_ref(
        &mut self,
        owner: TypeId,
        name: impl Into<String>,
        target: TypeId,
    ) -> AnalysisResult<FieldId> {
        self.add_field(owner, name, FieldTarget::Type(target), None)
    }

    /// Add a scalar field.
    pub fn add_scalar(&mut self, owner: TypeId, name: impl Into<String>) -> AnalysisResult<FieldId> {
        self.add_field(owner, name, FieldTarget::Scalar, None)
    }

    /// Look up a type by name.
    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    /// Get a type node.
    pub fn node(&self, id: TypeId) -> AnalysisResult<&TypeNode> {
        self.nodes.get(id.index()).ok_or(AnalysisError::UnknownType { id })
    }

    fn node_mut(&mut self, id: TypeId) -> AnalysisResult<&mut TypeNode> {
        self.nodes
            .get_mut(id.index())
            .ok_or(AnalysisError::UnknownType { id })
    }

    /// Get a field.
    pub fn field(&self, id: FieldId) -> AnalysisResult<&FieldEdge> {
        self.node(id.owner)?
            .fields
            .get(id.index as usize)
            .ok_or(AnalysisError::UnknownField { field: id })
    }

    /// Set the strength of a field.
    pub fn set_strength(&mut self, id: FieldId, strength: Strength) -> AnalysisResult<()> {
        let field = self
            .node_mut(id.owner)?
            .fields
            .get_mut(id.index as usize)
            .ok_or(AnalysisError::UnknownField { field: id })?;
        field.strength = strength;
        Ok(())
    }

    /// Iterate over all types in declaration order.
    pub fn types(&self) -> impl Iterator<Item = &TypeNode> {
        self.nodes.iter()
    }

    /// Iterate over every field of every type.
    pub fn fields(&self) -> impl Iterator<Item = &FieldEdge> {
        self.nodes.iter().flat_map(|n| n.fields.iter())
    }

    /// Number of types.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph has no types.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Estimated runtime size of one object of this type.
    pub fn estimated_size(&self, id: TypeId) -> AnalysisResult<usize> {
        Ok(OBJECT_HEADER_SIZE + self.node(id)?.fields.len() * FIELD_SIZE)
    }

    /// Types reachable from `root` through reference fields, including
    /// `root`, in DFS preorder. Weak fields are followed.
    pub fn reachable(&self, root: TypeId) -> AnalysisResult<Vec<TypeId>> {
        self.node(root)?;
        let mut visited = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        let mut stack = vec![root];

        while let Some(ty) = stack.pop() {
            if visited[ty.index()] {
                continue;
            }
            visited[ty.index()] = true;
            order.push(ty);

            for field in self.node(ty)?.fields.iter().rev() {
                if let Some(target) = field.target.type_id() {
                    if !visited[target.index()] {
                        stack.push(target);
                    }
                }
            }
        }

        Ok(order)
    }

    /// Whether `to` is reachable from `from` through reference fields.
    pub fn reaches(&self, from: TypeId, to: TypeId) -> AnalysisResult<bool> {
        Ok(self.reachable(from)?.contains(&to))
    }

    /// Strongly connected components of the subgraph induced by `nodes`,
    /// over the edges accepted by `follow`.
    ///
    /// Iterative Tarjan. Self edges are ignored: a component is reported
    /// only when it contains at least two types.
    pub fn cyclic_components<F>(&self, nodes: &[TypeId], follow: F) -> AnalysisResult<Vec<Vec<TypeId>>>
    where
        F: Fn(&FieldEdge) -> bool,
    {
        const UNVISITED: u32 = u32::MAX;

        let mut in_set = vec![false; self.nodes.len()];
        for &n in nodes {
            in_set[n.index()] = true;
        }

        let mut index = vec![UNVISITED; self.nodes.len()];
        let mut lowlink = vec![0u32; self.nodes.len()];
        let mut on_stack = vec![false; self.nodes.len()];
        let mut tarjan_stack: Vec<TypeId> = Vec::new();
        let mut components = Vec::new();
        let mut next_index = 0u32;

        for &start in nodes {
            if index[start.index()] != UNVISITED {
                continue;
            }

            // (node, next field position)
            let mut call_stack: Vec<(TypeId, usize)> = vec![(start, 0)];
            index[start.index()] = next_index;
            lowlink[start.index()] = next_index;
            next_index += 1;
            tarjan_stack.push(start);
            on_stack[start.index()] = true;

            while let Some(frame) = call_stack.last_mut() {
                let node = frame.0;
                let fields = &self.node(node)?.fields;
                let mut descend = None;

                while frame.1 < fields.len() {
                    let field = &fields[frame.1];
                    frame.1 += 1;
                    let Some(target) = field.target.type_id() else {
                        continue;
                    };
                    if target == node || !in_set[target.index()] || !follow(field) {
                        continue;
                    }
                    if index[target.index()] == UNVISITED {
                        descend = Some(target);
                        break;
                    } else if on_stack[target.index()] {
                        lowlink[node.index()] = lowlink[node.index()].min(index[target.index()]);
                    }
                }

                if let Some(target) = descend {
                    index[target.index()] = next_index;
                    lowlink[target.index()] = next_index;
                    next_index += 1;
                    tarjan_stack.push(target);
                    on_stack[target.index()] = true;
                    call_stack.push((target, 0));
                    continue;
                }

                call_stack.pop();
                if let Some(&(parent, _)) = call_stack.last() {
                    lowlink[parent.index()] = lowlink[parent.index()].min(lowlink[node.index()]);
                }

                if lowlink[node.index()] == index[node.index()] {
                    let mut component = Vec::new();
                    while let Some(member) = tarjan_stack.pop() {
                        on_stack[member.index()] = false;
                        component.push(member);
                        if member == node {
                            break;
                        }
                    }
                    if component.len() > 1 {
                        components.push(component);
                    }
                }
            }
        }

        Ok(components)
    }
}
