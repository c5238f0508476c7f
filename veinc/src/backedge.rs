//! # Back-Edge Detection
//!
//! Marks reference fields that point backward in an ownership hierarchy as
//! weak, so that the strong-edge graph of every type becomes acyclic
//! wherever the program allows it.
//!
//! ## Rules
//!
//! Applied in order; the first rule that decides a field wins.
//!
//! 1. **Annotations.** `#[weak]` and `#[strong]` are final.
//! 2. **Name heuristics.** A field whose name contains a back-edge word
//!    (`parent`, `prev`, ...) as a whole word is weak, provided it closes a
//!    cycle: its target can reach its owner. A sole owning reference that
//!    happens to be called `parent` stays strong.
//! 3. **Structure.** A DFS over strong fields, starting from each type in
//!    declaration order, marks a field weak when its target is an ancestor
//!    on the current DFS path. Self references are never marked here: a
//!    single strong self reference is the spine of a list or tree.
//!
//! Weak fields carry no reference-count contribution and are skipped by
//! every release path in the runtime.

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::config::AnalysisConfig;
use crate::error::AnalysisResult;
use crate::types::{Annotation, FieldId, Strength, TypeGraph, TypeId};

/// Why a field was marked weak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeakReason {
    /// `#[weak]` annotation.
    Annotated,
    /// Field name matched a back-edge word.
    Heuristic,
    /// Field closes a cycle found by DFS.
    Structural,
}

/// Result of back-edge detection over a type graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackEdgeReport {
    /// Weak fields, in the order they were decided.
    pub weak: Vec<(FieldId, WeakReason)>,
}

impl BackEdgeReport {
    /// Whether a field was marked weak.
    pub fn is_weak(&self, field: FieldId) -> bool {
        self.weak.iter().any(|(f, _)| *f == field)
    }

    /// Why a field was marked weak, if it was.
    pub fn reason(&self, field: FieldId) -> Option<WeakReason> {
        self.weak.iter().find(|(f, _)| *f == field).map(|(_, r)| *r)
    }

    /// Number of weak fields.
    pub fn len(&self) -> usize {
        self.weak.len()
    }

    /// Check if no field was marked weak.
    pub fn is_empty(&self) -> bool {
        self.weak.is_empty()
    }
}

/// Back-edge detector.
#[derive(Debug, Clone)]
pub struct BackEdgeDetector {
    words: Vec<String>,
    structural: bool,
}

impl BackEdgeDetector {
    /// Create a detector from the analysis configuration.
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            words: config.backedge_words.iter().map(|w| w.to_lowercase()).collect(),
            structural: config.structural_back_edges,
        }
    }

    /// Run all rules over `graph`, updating field strengths in place.
    ///
    /// Running the detector twice yields the same strengths.
    pub fn detect(&self, graph: &mut TypeGraph) -> AnalysisResult<BackEdgeReport> {
        let mut report = BackEdgeReport::default();

        // Reset inferred strengths so repeated runs are stable.
        let fields: Vec<_> = graph.fields().map(|f| (f.id, f.annotation)).collect();
        for (id, annotation) in &fields {
            let strength = match annotation {
                Some(Annotation::Weak) => {
                    report.weak.push((*id, WeakReason::Annotated));
                    Strength::Weak
                }
                Some(Annotation::Strong) | None => Strength::Strong,
            };
            graph.set_strength(*id, strength)?;
        }

        // Name heuristics.
        let candidates: Vec<_> = graph
            .fields()
            .filter(|f| f.annotation.is_none() && self.matches_word(&f.name))
            .filter_map(|f| f.target.type_id().map(|t| (f.id, t)))
            .collect();
        for (id, target) in candidates {
            if graph.reaches(target, id.owner)? {
                graph.set_strength(id, Strength::Weak)?;
                report.weak.push((id, WeakReason::Heuristic));
            }
        }

        if self.structural {
            for id in structural_back_edges(graph)? {
                graph.set_strength(id, Strength::Weak)?;
                report.weak.push((id, WeakReason::Structural));
            }
        }

        debug!(weak = report.len(), "back-edge detection complete");
        Ok(report)
    }

    /// Whether `name` contains a back-edge word as a whole word.
    pub fn matches_word(&self, name: &str) -> bool {
        split_identifier(name)
            .iter()
            .any(|part| self.words.iter().any(|w| w == part))
    }
}

impl Default for BackEdgeDetector {
    fn default() -> Self {
        Self::new(&AnalysisConfig::default())
    }
}

/// Weak fields declared by `ty`.
pub fn weak_fields(graph: &TypeGraph, ty: TypeId) -> AnalysisResult<FxHashSet<FieldId>> {
    Ok(graph
        .node(ty)?
        .fields
        .iter()
        .filter(|f| f.is_weak())
        .map(|f| f.id)
        .collect())
}

/// Split an identifier into lowercase words on `_`, `-` and camelCase humps.
pub fn split_identifier(name: &str) -> Vec<String> {
    let mut parts = Vec::new();
    for chunk in name.split(|c: char| c == '_' || c == '-') {
        let mut current = String::new();
        let mut prev_lower = false;
        for c in chunk.chars() {
            if c.is_uppercase() && prev_lower && !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            current.extend(c.to_lowercase());
        }
        if !current.is_empty() {
            parts.push(current);
        }
    }
    parts
}

/// DFS over strong, non-annotated-weak fields in declaration order.
/// Returns unannotated fields that point at a gray ancestor other than the
/// field's own type.
fn structural_back_edges(graph: &TypeGraph) -> AnalysisResult<Vec<FieldId>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color = vec![Color::White; graph.len()];
    let mut found = Vec::new();

    for root in graph.types().map(|t| t.id).collect::<Vec<_>>() {
        if color[root.index()] != Color::White {
            continue;
        }
        color[root.index()] = Color::Gray;
        let mut stack: Vec<(TypeId, usize)> = vec![(root, 0)];

        while let Some(frame) = stack.last_mut() {
            let ty = frame.0;
            let fields = &graph.node(ty)?.fields;
            let mut descend = None;

            while frame.1 < fields.len() {
                let field = &fields[frame.1];
                frame.1 += 1;
                let Some(target) = field.strong_target() else {
                    continue;
                };
                if target == ty {
                    continue;
                }
                match color[target.index()] {
                    Color::White => {
                        descend = Some(target);
                        break;
                    }
                    Color::Gray if field.annotation.is_none() => found.push(field.id),
                    Color::Gray | Color::Black => {}
                }
            }

            match descend {
                Some(target) => {
                    color[target.index()] = Color::Gray;
                    stack.push((target, 0));
                }
                None => {
                    color[ty.index()] = Color::Black;
                    stack.pop();
                }
            }
        }
    }

    Ok(found)
}
