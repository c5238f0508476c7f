//! # Shape Classification
//!
//! Labels the pointer graph reachable from an allocation site as TREE, DAG
//! or CYCLIC, using only the static type graph.
//!
//! ## Rules
//!
//! Let R be the set of types reachable from the allocated type through
//! reference fields (strong and weak).
//!
//! | Shape | Condition |
//! |-------|-----------|
//! | CYCLIC | a cycle through two or more types in R, or a weak self reference |
//! | DAG | no cycle, but some type in R has two strong incoming fields from other types, two strong self references, or an incoming weak field |
//! | TREE | otherwise: at most one strong self reference per type, no sharing |
//!
//! A CYCLIC fact is `cycle_broken` when the cycle disappears once weak fields
//! are removed. Run back-edge detection first so that strengths are final.
//!
//! Any unresolved field target in R makes the fact CYCLIC and `unknown`.
//!
//! The lattice TREE < DAG < CYCLIC is joined by maximum; classifying the
//! whole reachable set at once is the join over the nested types.

use std::fmt;

use crate::error::AnalysisResult;
use crate::types::{FieldTarget, Strength, TypeGraph, TypeId};

/// Pointer-graph shape. Ordered TREE < DAG < CYCLIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Shape {
    /// No sharing, no cycles.
    #[default]
    Tree,
    /// Sharing, no cycles.
    Dag,
    /// Cycles possible.
    Cyclic,
}

impl Shape {
    /// All shapes, in lattice order.
    pub const ALL: [Shape; 3] = [Shape::Tree, Shape::Dag, Shape::Cyclic];

    /// Join two shapes (least upper bound).
    pub fn join(self, other: Shape) -> Shape {
        std::cmp::max(self, other)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Shape::Tree => "TREE",
            Shape::Dag => "DAG",
            Shape::Cyclic => "CYCLIC",
        })
    }
}

/// Shape of an allocation site plus the facts the router needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShapeFact {
    /// Classified shape.
    pub shape: Shape,
    /// For CYCLIC: every cycle passes through a weak field.
    pub cycle_broken: bool,
    /// Part of the reachable graph could not be resolved.
    pub unknown: bool,
}

impl ShapeFact {
    /// A resolved fact without cycles.
    pub const fn acyclic(shape: Shape) -> Self {
        ShapeFact {
            shape,
            cycle_broken: false,
            unknown: false,
        }
    }

    /// The conservative fact for unresolved types.
    pub const UNKNOWN: ShapeFact = ShapeFact {
        shape: Shape::Cyclic,
        cycle_broken: false,
        unknown: true,
    };

    /// Join two facts.
    ///
    /// A cycle stays broken only if every cyclic part is broken.
    pub fn join(self, other: ShapeFact) -> ShapeFact {
        let shape = self.shape.join(other.shape);
        let broken = |f: &ShapeFact| f.shape != Shape::Cyclic || f.cycle_broken;
        ShapeFact {
            shape,
            cycle_broken: shape == Shape::Cyclic && broken(&self) && broken(&other),
            unknown: self.unknown || other.unknown,
        }
    }
}

impl fmt::Display for ShapeFact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.shape)?;
        if self.cycle_broken {
            f.write_str(" (broken)")?;
        }
        if self.unknown {
            f.write_str(" (unknown)")?;
        }
        Ok(())
    }
}

/// Classify the shape of objects of type `ty`.
pub fn classify_shape(graph: &TypeGraph, ty: TypeId) -> AnalysisResult<ShapeFact> {
    let reachable = graph.reachable(ty)?;

    let mut in_set = vec![false; graph.len()];
    for &t in &reachable {
        in_set[t.index()] = true;
    }

    let mut weak_self = false;
    let mut strong_in = vec![0u32; graph.len()];
    let mut strong_self = vec![0u32; graph.len()];
    let mut weak_in = vec![false; graph.len()];

    for &t in &reachable {
        for field in &graph.node(t)?.fields {
            let target = match &field.target {
                FieldTarget::Type(target) => *target,
                FieldTarget::Scalar => continue,
                FieldTarget::Unresolved(_) => return Ok(ShapeFact::UNKNOWN),
            };
            if !in_set[target.index()] {
                continue;
            }
            match (field.strength, target == t) {
                (Strength::Weak, true) => weak_self = true,
                (Strength::Weak, false) => weak_in[target.index()] = true,
                (Strength::Strong, true) => strong_self[target.index()] += 1,
                (Strength::Strong, false) => strong_in[target.index()] += 1,
            }
        }
    }

    let cyclic = weak_self || !graph.cyclic_components(&reachable, |_| true)?.is_empty();
    if cyclic {
        let strong_cycles =
            graph.cyclic_components(&reachable, |f| f.strength == Strength::Strong)?;
        return Ok(ShapeFact {
            shape: Shape::Cyclic,
            cycle_broken: strong_cycles.is_empty(),
            unknown: false,
        });
    }

    let shared = reachable.iter().any(|t| {
        let i = t.index();
        strong_in[i] >= 2 || strong_self[i] >= 2 || weak_in[i]
    });

    Ok(ShapeFact::acyclic(if shared { Shape::Dag } else { Shape::Tree }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backedge::BackEdgeDetector;
    use crate::types::Annotation;

    #[test]
    fn test_shape_ordering_and_join() {
        assert!(Shape::Tree < Shape::Dag);
        assert!(Shape::Dag < Shape::Cyclic);
        assert_eq!(Shape::Tree.join(Shape::Dag), Shape::Dag);
        assert_eq!(Shape::Cyclic.join(Shape::Tree), Shape::Cyclic);
    }

    #[test]
    fn test_leaf_is_tree() {
        let mut graph = TypeGraph::new();
        let p = graph.add_type("Point");
        graph.add_scalar(p, "x").unwrap();
        assert_eq!(classify_shape(&graph, p).unwrap(), ShapeFact::acyclic(Shape::Tree));
    }

    #[test]
    fn test_singly_linked_list_is_tree() {
        let mut graph = TypeGraph::new();
        let list = graph.add_type("List");
        let node = graph.add_type("Node");
        graph.add_ref(list, "head", node).unwrap();
        graph.add_ref(node, "next", node).unwrap();
        assert_eq!(classify_shape(&graph, list).unwrap().shape, Shape::Tree);
    }

    #[test]
    fn test_two_self_references_is_dag() {
        let mut graph = TypeGraph::new();
        let n = graph.add_type("Bin");
        graph.add_ref(n, "left", n).unwrap();
        graph.add_ref(n, "right", n).unwrap();
        assert_eq!(classify_shape(&graph, n).unwrap().shape, Shape::Dag);
    }

    #[test]
    fn test_diamond_is_dag() {
        let mut graph = TypeGraph::new();
        let a = graph.add_type("A");
        let b = graph.add_type("B");
        let c = graph.add_type("C");
        let d = graph.add_type("D");
        graph.add_ref(a, "b", b).unwrap();
        graph.add_ref(a, "c", c).unwrap();
        graph.add_ref(b, "d", d).unwrap();
        graph.add_ref(c, "d", d).unwrap();
        assert_eq!(classify_shape(&graph, a).unwrap(), ShapeFact::acyclic(Shape::Dag));
        // From B alone there is no sharing.
        assert_eq!(classify_shape(&graph, b).unwrap().shape, Shape::Tree);
    }

    #[test]
    fn test_unbroken_cycle() {
        let mut graph = TypeGraph::new();
        let a = graph.add_type("A");
        let b = graph.add_type("B");
        graph.add_ref(a, "b", b).unwrap();
        graph.add_ref(b, "a", a).unwrap();
        let fact = classify_shape(&graph, a).unwrap();
        assert_eq!(fact.shape, Shape::Cyclic);
        assert!(!fact.cycle_broken);
        assert!(!fact.unknown);
    }

    #[test]
    fn test_cycle_broken_after_backedge_detection() {
        let mut graph = TypeGraph::new();
        let a = graph.add_type("A");
        let b = graph.add_type("B");
        graph.add_ref(a, "b", b).unwrap();
        graph.add_ref(b, "a", a).unwrap();
        BackEdgeDetector::default().detect(&mut graph).unwrap();
        let fact = classify_shape(&graph, a).unwrap();
        assert_eq!(fact.shape, Shape::Cyclic);
        assert!(fact.cycle_broken);
    }

    #[test]
    fn test_doubly_linked_list_is_broken_cycle() {
        let mut graph = TypeGraph::new();
        let node = graph.add_type("Node");
        graph.add_ref(node, "next", node).unwrap();
        graph
            .add_field(node, "prev", FieldTarget::Type(node), Some(Annotation::Weak))
            .unwrap();
        let fact = classify_shape(&graph, node).unwrap();
        assert_eq!(fact.shape, Shape::Cyclic);
        assert!(fact.cycle_broken);
    }

    #[test]
    fn test_unresolved_is_unknown_cyclic() {
        let mut graph = TypeGraph::new();
        let a = graph.add_type("A");
        let b = graph.add_type("B");
        graph.add_ref(a, "b", b).unwrap();
        graph
            .add_field(b, "ext", FieldTarget::Unresolved("other::Thing".into()), None)
            .unwrap();
        assert_eq!(classify_shape(&graph, a).unwrap(), ShapeFact::UNKNOWN);
        // Unreachable unresolved fields do not affect other roots.
        let c = graph.add_type("C");
        assert_eq!(classify_shape(&graph, c).unwrap().shape, Shape::Tree);
    }

    #[test]
    fn test_fact_join() {
        let tree = ShapeFact::acyclic(Shape::Tree);
        let broken = ShapeFact {
            shape: Shape::Cyclic,
            cycle_broken: true,
            unknown: false,
        };
        let unbroken = ShapeFact {
            shape: Shape::Cyclic,
            cycle_broken: false,
            unknown: false,
        };
        assert_eq!(tree.join(broken), broken);
        assert_eq!(broken.join(unbroken), unbroken);
        assert_eq!(tree.join(ShapeFact::UNKNOWN), ShapeFact::UNKNOWN);
    }

    #[test]
    fn test_property_classification_deterministic() {
        let mut graph = TypeGraph::new();
        let ids: Vec<_> = (0..8).map(|i| graph.add_type(format!("T{i}"))).collect();
        for i in 0..8 {
            graph.add_ref(ids[i], "n", ids[(i * 3 + 1) % 8]).unwrap();
        }
        for &id in &ids {
            assert_eq!(classify_shape(&graph, id).unwrap(), classify_shape(&graph, id).unwrap());
        }
    }
}
