//! # Escape Analysis
//!
//! Determines whether each local's value can outlive the scope that defines
//! it.
//!
//! ## Escape States
//!
//! | State | Cause |
//! |-------|-------|
//! | NoEscape | only used locally, or passed to callees that borrow |
//! | ArgEscape | passed to a callee that may retain it |
//! | GlobalEscape | returned, stored in a static or through a pointer, captured by a closure, sent on a channel, moved into a spawned task |
//!
//! ## Algorithm
//!
//! A lattice-based dataflow over the body:
//!
//! ```text
//! NoEscape < ArgEscape < GlobalEscape
//! ```
//!
//! Escape flows backwards through assignments: in `a = b`, `a.f = b` or
//! `a = Alloc { b, .. }`, `b` escapes at least as far as `a`. Iteration
//! continues until a fixed point is reached.
//!
//! Two further facts ride along: values captured by closures (ownership
//! moves into the closure, the defining scope never frees them) and values
//! that cross a thread boundary (they need atomic reference counts).
//! Crossing a thread flows backwards through assignments the same way.

use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::AnalysisConfig;
use crate::mir::{
    ArgMode, Body, LocalId, Operand, Place, Rvalue, StatementKind, TerminatorKind,
};

// ============================================================================
// Escape State
// ============================================================================

/// The escape state of a value.
///
/// Forms a lattice: NoEscape < ArgEscape < GlobalEscape
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum EscapeState {
    /// Value does not escape its defining scope.
    #[default]
    NoEscape,
    /// Value escapes via a function argument.
    ArgEscape,
    /// Value escapes to the caller, a global, another thread or a closure.
    GlobalEscape,
}

impl EscapeState {
    /// All states, in lattice order.
    pub const ALL: [EscapeState; 3] = [
        EscapeState::NoEscape,
        EscapeState::ArgEscape,
        EscapeState::GlobalEscape,
    ];

    /// Join two escape states (least upper bound in lattice).
    pub fn join(self, other: EscapeState) -> EscapeState {
        std::cmp::max(self, other)
    }
}

impl fmt::Display for EscapeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EscapeState::NoEscape => "NONE",
            EscapeState::ArgEscape => "ARG",
            EscapeState::GlobalEscape => "GLOBAL",
        })
    }
}

// ============================================================================
// Escape Results
// ============================================================================

/// Results of escape analysis for a body.
#[derive(Debug, Clone, Default)]
pub struct EscapeResults {
    /// Escape state for each local.
    pub states: FxHashMap<LocalId, EscapeState>,
    /// Closures and their captured locals.
    pub closure_captures: FxHashMap<LocalId, Vec<LocalId>>,
    /// Locals captured by any closure.
    pub captured_by_closure: FxHashSet<LocalId>,
    /// Locals whose value is reachable from another thread.
    pub crosses_thread: FxHashSet<LocalId>,
}

impl EscapeResults {
    /// Create new empty results.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the escape state for a local.
    pub fn get(&self, local: LocalId) -> EscapeState {
        self.states.get(&local).copied().unwrap_or_default()
    }

    /// Check if a local is captured by a closure.
    pub fn is_closure_captured(&self, local: LocalId) -> bool {
        self.captured_by_closure.contains(&local)
    }

    /// Check if a local crosses a thread boundary.
    pub fn crosses_thread(&self, local: LocalId) -> bool {
        self.crosses_thread.contains(&local)
    }

    /// Get the captures for a specific closure.
    pub fn get_captures(&self, closure: LocalId) -> Option<&Vec<LocalId>> {
        self.closure_captures.get(&closure)
    }
}

/// Classify the escape state of `local` in `body`.
pub fn classify_escape(body: &Body, local: LocalId, config: &AnalysisConfig) -> EscapeState {
    EscapeAnalyzer::new(config).analyze(body).get(local)
}

// ============================================================================
// Escape Analyzer
// ============================================================================

/// Escape analysis pass.
#[derive(Debug)]
pub struct EscapeAnalyzer {
    unknown_callee: EscapeState,
    states: FxHashMap<LocalId, EscapeState>,
    crosses: FxHashSet<LocalId>,
    closure_captures: FxHashMap<LocalId, Vec<LocalId>>,
    captured_by_closure: FxHashSet<LocalId>,
}

impl EscapeAnalyzer {
    /// Create a new escape analyzer.
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            unknown_callee: config.unknown_callee_escape,
            states: FxHashMap::default(),
            crosses: FxHashSet::default(),
            closure_captures: FxHashMap::default(),
            captured_by_closure: FxHashSet::default(),
        }
    }

    /// Analyze a body and return escape results.
    pub fn analyze(&mut self, body: &Body) -> EscapeResults {
        self.states.clear();
        self.crosses.clear();
        self.closure_captures.clear();
        self.captured_by_closure.clear();

        for local in &body.locals {
            self.states.insert(local.id, EscapeState::NoEscape);
        }
        self.states.insert(body.return_place(), EscapeState::GlobalEscape);
        for param in body.param_ids() {
            self.states.insert(param, EscapeState::ArgEscape);
        }

        for (_, block) in body.blocks() {
            for stmt in &block.statements {
                if let StatementKind::Assign(place, Rvalue::Closure { captures }) = &stmt.kind {
                    let locals: Vec<_> = captures
                        .iter()
                        .filter_map(|op| op.place())
                        .map(|p| p.local)
                        .collect();
                    self.captured_by_closure.extend(locals.iter().copied());
                    self.closure_captures.insert(place.local, locals);
                }
            }
        }

        loop {
            let mut changed = false;

            for (_, block) in body.blocks() {
                for stmt in &block.statements {
                    changed |= self.analyze_statement(&stmt.kind);
                }
                if let Some(term) = &block.terminator {
                    changed |= self.analyze_terminator(&term.kind);
                }
            }

            if !changed {
                break;
            }
        }

        EscapeResults {
            states: self.states.clone(),
            closure_captures: self.closure_captures.clone(),
            captured_by_closure: self.captured_by_closure.clone(),
            crosses_thread: self.crosses.clone(),
        }
    }

    /// Analyze a statement, returning true if state changed.
    fn analyze_statement(&mut self, kind: &StatementKind) -> bool {
        match kind {
            StatementKind::Assign(place, rvalue) => self.analyze_assignment(place, rvalue),
            StatementKind::StoreGlobal { value, .. } => {
                self.propagate_to_operand(value, EscapeState::GlobalEscape)
            }
            StatementKind::Send { value, .. } => {
                let mut changed = self.propagate_to_operand(value, EscapeState::GlobalEscape);
                changed |= self.mark_crossing(value);
                changed
            }
            StatementKind::Spawn { captures } => {
                let mut changed = false;
                for op in captures {
                    changed |= self.propagate_to_operand(op, EscapeState::GlobalEscape);
                    changed |= self.mark_crossing(op);
                }
                changed
            }
            StatementKind::StorageLive(_) | StatementKind::StorageDead(_) | StatementKind::Nop => {
                false
            }
        }
    }

    /// Analyze an assignment.
    fn analyze_assignment(&mut self, place: &Place, rvalue: &Rvalue) -> bool {
        let mut changed = false;
        let target_state = self.place_escape_state(place);
        let target_crosses = self.crosses.contains(&place.local);

        match rvalue {
            Rvalue::Use(operand) => {
                changed |= self.propagate_to_operand(operand, target_state);
                if target_crosses {
                    changed |= self.mark_crossing(operand);
                }
            }
            Rvalue::Alloc { fields, .. } => {
                for op in fields {
                    changed |= self.propagate_to_operand(op, target_state);
                    if target_crosses {
                        changed |= self.mark_crossing(op);
                    }
                }
            }
            Rvalue::Closure { captures } => {
                for op in captures {
                    changed |= self.propagate_to_operand(op, EscapeState::GlobalEscape);
                    if target_crosses {
                        changed |= self.mark_crossing(op);
                    }
                }
            }
            Rvalue::Ref(referent) => {
                changed |= self.update_state(referent.local, target_state);
                if target_crosses {
                    changed |= self.crosses.insert(referent.local);
                }
            }
            Rvalue::BinaryOp { .. } => {}
        }

        changed
    }

    /// Analyze a terminator.
    fn analyze_terminator(&mut self, kind: &TerminatorKind) -> bool {
        let mut changed = false;

        if let TerminatorKind::Call { callee, args, .. } = kind {
            for (i, arg) in args.iter().enumerate() {
                let state = match callee.mode(i) {
                    Some(ArgMode::Borrow) => EscapeState::NoEscape,
                    Some(ArgMode::Retain) => EscapeState::ArgEscape,
                    None => self.unknown_callee,
                };
                changed |= self.propagate_to_operand(arg, state);
            }
        }

        changed
    }

    /// Get the escape state of a place being written.
    fn place_escape_state(&self, place: &Place) -> EscapeState {
        if place.is_indirect() {
            return EscapeState::GlobalEscape;
        }
        self.states.get(&place.local).copied().unwrap_or_default()
    }

    /// Propagate escape state to an operand.
    fn propagate_to_operand(&mut self, operand: &Operand, state: EscapeState) -> bool {
        match operand.place() {
            Some(place) => self.update_state(place.local, state),
            None => false,
        }
    }

    fn mark_crossing(&mut self, operand: &Operand) -> bool {
        match operand.place() {
            Some(place) => self.crosses.insert(place.local),
            None => false,
        }
    }

    /// Update the escape state of a local, returning true if changed.
    fn update_state(&mut self, local: LocalId, new_state: EscapeState) -> bool {
        let current = self.states.get(&local).copied().unwrap_or_default();
        let joined = current.join(new_state);

        if joined != current {
            self.states.insert(local, joined);
            true
        } else {
            false
        }
    }
}

impl Default for EscapeAnalyzer {
    fn default() -> Self {
        Self::new(&AnalysisConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{Callee, GlobalId, LocalKind, SiteId, Statement};
    use crate::types::TypeId;

    fn alloc(site: u32) -> Rvalue {
        Rvalue::Alloc {
            site: SiteId(site),
            ty: TypeId::new(0),
            frozen: false,
            fields: Vec::new(),
        }
    }

    fn body_with(stmts: Vec<StatementKind>, locals: usize) -> (Body, Vec<LocalId>) {
        let mut body = Body::new("f", 0);
        let ids: Vec<_> = (0..locals).map(|_| body.new_local(LocalKind::Temp, None)).collect();
        let bb = body.new_block();
        for kind in stmts {
            body.push_statement(bb, Statement::new(kind));
        }
        body.set_terminator(bb, TerminatorKind::Return);
        (body, ids)
    }

    fn l(i: u32) -> LocalId {
        LocalId::new(i)
    }

    fn copy(i: u32) -> Operand {
        Operand::Copy(Place::local(l(i)))
    }

    #[test]
    fn test_escape_state_ordering() {
        assert!(EscapeState::NoEscape < EscapeState::ArgEscape);
        assert!(EscapeState::ArgEscape < EscapeState::GlobalEscape);
    }

    #[test]
    fn test_unused_local_does_not_escape() {
        let (body, ids) = body_with(vec![StatementKind::Assign(Place::local(l(1)), alloc(0))], 1);
        let results = EscapeAnalyzer::default().analyze(&body);
        assert_eq!(results.get(ids[0]), EscapeState::NoEscape);
        assert_eq!(results.get(body.return_place()), EscapeState::GlobalEscape);
    }

    #[test]
    fn test_returned_value_is_global() {
        let (body, ids) = body_with(
            vec![
                StatementKind::Assign(Place::local(l(1)), alloc(0)),
                StatementKind::Assign(Place::local(l(0)), Rvalue::Use(Operand::Move(Place::local(l(1))))),
            ],
            1,
        );
        assert_eq!(
            classify_escape(&body, ids[0], &AnalysisConfig::default()),
            EscapeState::GlobalEscape
        );
    }

    #[test]
    fn test_call_modes() {
        let mut body = Body::new("f", 0);
        let a = body.new_local(LocalKind::Temp, None);
        let b = body.new_local(LocalKind::Temp, None);
        let c = body.new_local(LocalKind::Temp, None);
        let b0 = body.new_block();
        let b1 = body.new_block();
        let b2 = body.new_block();
        body.set_terminator(
            b0,
            TerminatorKind::Call {
                callee: Callee::known("g", vec![ArgMode::Borrow, ArgMode::Retain]),
                args: vec![copy(a.0), copy(b.0)],
                destination: Place::local(l(0)),
                target: Some(b1),
            },
        );
        body.set_terminator(
            b1,
            TerminatorKind::Call {
                callee: Callee::unknown("h"),
                args: vec![copy(c.0)],
                destination: Place::local(l(0)),
                target: Some(b2),
            },
        );
        body.set_terminator(b2, TerminatorKind::Return);

        let results = EscapeAnalyzer::default().analyze(&body);
        assert_eq!(results.get(a), EscapeState::NoEscape);
        assert_eq!(results.get(b), EscapeState::ArgEscape);
        assert_eq!(results.get(c), EscapeState::ArgEscape);

        let config = AnalysisConfig::default().with_unknown_callee_escape(EscapeState::GlobalEscape);
        assert_eq!(EscapeAnalyzer::new(&config).analyze(&body).get(c), EscapeState::GlobalEscape);
    }

    #[test]
    fn test_closure_capture_is_global() {
        let (body, _) = body_with(
            vec![
                StatementKind::Assign(Place::local(l(1)), alloc(0)),
                StatementKind::Assign(Place::local(l(2)), Rvalue::Closure { captures: vec![copy(1)] }),
            ],
            2,
        );
        let results = EscapeAnalyzer::default().analyze(&body);
        assert_eq!(results.get(l(1)), EscapeState::GlobalEscape);
        assert!(results.is_closure_captured(l(1)));
        assert_eq!(results.get_captures(l(2)), Some(&vec![l(1)]));
    }

    #[test]
    fn test_send_and_spawn_cross_threads() {
        let (body, _) = body_with(
            vec![
                StatementKind::Assign(Place::local(l(1)), alloc(0)),
                StatementKind::Assign(Place::local(l(2)), alloc(1)),
                StatementKind::Assign(Place::local(l(3)), alloc(2)),
                // _1.0 = _4: the child becomes reachable from the sent value.
                StatementKind::Assign(Place::local(l(1)).field(0), Rvalue::Use(copy(4))),
                StatementKind::Send { channel: Operand::Constant(0), value: copy(1) },
                StatementKind::Spawn { captures: vec![copy(2)] },
            ],
            4,
        );
        let results = EscapeAnalyzer::default().analyze(&body);
        assert!(results.crosses_thread(l(1)));
        assert!(results.crosses_thread(l(2)));
        assert!(results.crosses_thread(l(4)));
        assert!(!results.crosses_thread(l(3)));
        assert_eq!(results.get(l(1)), EscapeState::GlobalEscape);
        assert_eq!(results.get(l(4)), EscapeState::GlobalEscape);
        assert_eq!(results.get(l(3)), EscapeState::NoEscape);
    }

    #[test]
    fn test_store_global_and_deref() {
        let (body, _) = body_with(
            vec![
                StatementKind::StoreGlobal { global: GlobalId(0), value: copy(1) },
                StatementKind::Assign(Place::local(l(3)).deref(), Rvalue::Use(copy(2))),
            ],
            3,
        );
        let results = EscapeAnalyzer::default().analyze(&body);
        assert_eq!(results.get(l(1)), EscapeState::GlobalEscape);
        assert_eq!(results.get(l(2)), EscapeState::GlobalEscape);
    }

    #[test]
    fn test_escape_flows_backwards_through_chain() {
        // _3 = _2; _2 = _1; _0 = _3  -- needs two iterations.
        let (body, _) = body_with(
            vec![
                StatementKind::Assign(Place::local(l(3)), Rvalue::Use(copy(2))),
                StatementKind::Assign(Place::local(l(2)), Rvalue::Use(copy(1))),
                StatementKind::Assign(Place::local(l(0)), Rvalue::Use(copy(3))),
            ],
            3,
        );
        let results = EscapeAnalyzer::default().analyze(&body);
        for i in 1..=3 {
            assert_eq!(results.get(l(i)), EscapeState::GlobalEscape, "_{i}");
        }
    }

    #[test]
    fn test_property_join_commutative_and_idempotent() {
        for a in EscapeState::ALL {
            assert_eq!(a.join(a), a);
            for b in EscapeState::ALL {
                assert_eq!(a.join(b), b.join(a));
                assert!(a.join(b) >= a);
            }
        }
    }

    #[test]
    fn test_property_analysis_deterministic() {
        let (body, _) = body_with(
            vec![
                StatementKind::Assign(Place::local(l(1)), alloc(0)),
                StatementKind::Assign(Place::local(l(2)), Rvalue::Ref(Place::local(l(1)))),
                StatementKind::Assign(Place::local(l(0)), Rvalue::Use(copy(2))),
            ],
            2,
        );
        let first = EscapeAnalyzer::default().analyze(&body);
        let second = EscapeAnalyzer::default().analyze(&body);
        assert_eq!(first.states, second.states);
        assert_eq!(first.get(l(1)), EscapeState::GlobalEscape);
    }
}
