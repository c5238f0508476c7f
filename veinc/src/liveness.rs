//! # Liveness
//!
//! Backward liveness over locals, used to find where each local dies: the
//! program points after which no path reads it again. ASAP frees and
//! reference-count decrements are placed at these points.
//!
//! A local dies either right after a statement or terminator that last
//! touches it, or on a CFG edge into a block where it is no longer live
//! (for example, used in one branch of a switch but not the other).

use rustc_hash::{FxHashMap, FxHashSet};

use crate::mir::{
    BasicBlockId, Body, LocalId, Location, Operand, Place, Rvalue, StatementKind, TerminatorKind,
};

/// A program point where a local stops being live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeathPoint {
    /// Immediately after the statement or terminator at this location.
    After(Location),
    /// On the edge between two blocks.
    OnEdge {
        /// Source block.
        from: BasicBlockId,
        /// Destination block.
        to: BasicBlockId,
    },
}

/// Liveness results for a body.
#[derive(Debug, Clone, Default)]
pub struct LivenessResults {
    /// Locals live on entry to each block.
    pub live_in: Vec<FxHashSet<LocalId>>,
    /// Locals live on exit from each block.
    pub live_out: Vec<FxHashSet<LocalId>>,
    deaths: FxHashMap<LocalId, Vec<DeathPoint>>,
}

impl LivenessResults {
    /// Where `local` dies, sorted.
    pub fn death_points(&self, local: LocalId) -> &[DeathPoint] {
        self.deaths.get(&local).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Locations of the last uses of `local`.
    pub fn last_uses(&self, local: LocalId) -> Vec<Location> {
        self.death_points(local)
            .iter()
            .filter_map(|d| match d {
                DeathPoint::After(loc) => Some(*loc),
                DeathPoint::OnEdge { .. } => None,
            })
            .collect()
    }

    /// Whether `local` is live on exit from `block`.
    pub fn is_live_out(&self, block: BasicBlockId, local: LocalId) -> bool {
        self.live_out
            .get(block.index())
            .is_some_and(|set| set.contains(&local))
    }
}

/// Compute liveness for a body.
pub fn compute_liveness(body: &Body) -> LivenessResults {
    let n = body.basic_blocks.len();
    let mut live_in: Vec<FxHashSet<LocalId>> = vec![FxHashSet::default(); n];
    let mut live_out: Vec<FxHashSet<LocalId>> = vec![FxHashSet::default(); n];

    // Iterate in postorder (reverse of RPO) for fast convergence.
    let mut order = body.reverse_postorder();
    order.reverse();

    loop {
        let mut changed = false;
        for &block in &order {
            let data = &body.basic_blocks[block.index()];
            let mut out = FxHashSet::default();
            for succ in data.successors() {
                if let Some(set) = live_in.get(succ.index()) {
                    out.extend(set.iter().copied());
                }
            }
            let mut live = out.clone();
            if let Some(term) = &data.terminator {
                transfer(&mut live, &terminator_effects(&term.kind));
            }
            for stmt in data.statements.iter().rev() {
                transfer(&mut live, &statement_effects(&stmt.kind));
            }
            if live != live_in[block.index()] || out != live_out[block.index()] {
                live_in[block.index()] = live;
                live_out[block.index()] = out;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut deaths: FxHashMap<LocalId, Vec<DeathPoint>> = FxHashMap::default();
    for &block in &order {
        let data = &body.basic_blocks[block.index()];
        let mut live = live_out[block.index()].clone();

        for succ in data.successors() {
            let Some(succ_in) = live_in.get(succ.index()) else {
                continue;
            };
            for &local in &live {
                if !succ_in.contains(&local) {
                    deaths
                        .entry(local)
                        .or_default()
                        .push(DeathPoint::OnEdge { from: block, to: succ });
                }
            }
        }

        let mut record = |live: &mut FxHashSet<LocalId>, loc: Location, fx: &Effects| {
            for &local in fx.uses.iter().chain(fx.defs.iter()) {
                if !live.contains(&local) {
                    let points = deaths.entry(local).or_default();
                    let point = DeathPoint::After(loc);
                    if !points.contains(&point) {
                        points.push(point);
                    }
                }
            }
            transfer(live, fx);
        };

        if let Some(term) = &data.terminator {
            let fx = terminator_effects(&term.kind);
            record(&mut live, data.terminator_location(block), &fx);
        }
        for (i, stmt) in data.statements.iter().enumerate().rev() {
            let fx = statement_effects(&stmt.kind);
            record(&mut live, Location::new(block, i), &fx);
        }
    }

    for points in deaths.values_mut() {
        points.sort();
        points.dedup();
    }

    LivenessResults {
        live_in,
        live_out,
        deaths,
    }
}

#[derive(Debug, Default)]
struct Effects {
    uses: Vec<LocalId>,
    defs: Vec<LocalId>,
}

fn transfer(live: &mut FxHashSet<LocalId>, fx: &Effects) {
    for def in &fx.defs {
        live.remove(def);
    }
    live.extend(fx.uses.iter().copied());
}

fn use_operand(fx: &mut Effects, op: &Operand) {
    if let Some(place) = op.place() {
        fx.uses.push(place.local);
    }
}

fn write_place(fx: &mut Effects, place: &Place) {
    match place.as_local() {
        Some(local) => fx.defs.push(local),
        // Writing through a projection reads the base.
        None => fx.uses.push(place.local),
    }
}

fn statement_effects(kind: &StatementKind) -> Effects {
    let mut fx = Effects::default();
    match kind {
        StatementKind::Assign(place, rvalue) => {
            match rvalue {
                Rvalue::Use(op) => use_operand(&mut fx, op),
                Rvalue::Alloc { fields, .. } => fields.iter().for_each(|op| use_operand(&mut fx, op)),
                Rvalue::Closure { captures } => captures.iter().for_each(|op| use_operand(&mut fx, op)),
                Rvalue::Ref(p) => fx.uses.push(p.local),
                Rvalue::BinaryOp { left, right, .. } => {
                    use_operand(&mut fx, left);
                    use_operand(&mut fx, right);
                }
            }
            write_place(&mut fx, place);
        }
        StatementKind::StoreGlobal { value, .. } => use_operand(&mut fx, value),
        StatementKind::Send { channel, value } => {
            use_operand(&mut fx, channel);
            use_operand(&mut fx, value);
        }
        StatementKind::Spawn { captures } => captures.iter().for_each(|op| use_operand(&mut fx, op)),
        StatementKind::StorageLive(_) | StatementKind::StorageDead(_) | StatementKind::Nop => {}
    }
    fx
}

fn terminator_effects(kind: &TerminatorKind) -> Effects {
    let mut fx = Effects::default();
    match kind {
        TerminatorKind::SwitchInt { discr, .. } => use_operand(&mut fx, discr),
        TerminatorKind::Call {
            args, destination, ..
        } => {
            args.iter().for_each(|op| use_operand(&mut fx, op));
            write_place(&mut fx, destination);
        }
        TerminatorKind::Return => fx.uses.push(LocalId::new(0)),
        TerminatorKind::Goto { .. } | TerminatorKind::Unreachable => {}
    }
    fx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{LocalKind, Statement};

    fn copy(l: LocalId) -> Operand {
        Operand::Copy(Place::local(l))
    }

    #[test]
    fn test_straight_line_last_use() {
        let mut body = Body::new("f", 0);
        let a = body.new_local(LocalKind::Temp, None);
        let b = body.new_local(LocalKind::Temp, None);
        let bb = body.new_block();
        body.push_statement(bb, Statement::assign(Place::local(a), Rvalue::Use(Operand::Constant(1))));
        body.push_statement(bb, Statement::assign(Place::local(b), Rvalue::Use(copy(a))));
        body.push_statement(bb, Statement::assign(Place::local(LocalId::new(0)), Rvalue::Use(copy(b))));
        body.set_terminator(bb, TerminatorKind::Return);

        let live = compute_liveness(&body);
        assert_eq!(live.last_uses(a), vec![Location::new(bb, 1)]);
        assert_eq!(live.last_uses(b), vec![Location::new(bb, 2)]);
        // The return place dies at the return.
        assert_eq!(live.last_uses(LocalId::new(0)), vec![Location::new(bb, 3)]);
    }

    #[test]
    fn test_dead_definition_dies_immediately() {
        let mut body = Body::new("f", 0);
        let a = body.new_local(LocalKind::Temp, None);
        let bb = body.new_block();
        body.push_statement(bb, Statement::assign(Place::local(a), Rvalue::Use(Operand::Constant(1))));
        body.set_terminator(bb, TerminatorKind::Return);
        let live = compute_liveness(&body);
        assert_eq!(live.death_points(a), &[DeathPoint::After(Location::new(bb, 0))]);
    }

    #[test]
    fn test_branch_death_on_edge() {
        let mut body = Body::new("f", 0);
        let a = body.new_local(LocalKind::Temp, None);
        let b0 = body.new_block();
        let b1 = body.new_block();
        let b2 = body.new_block();
        let b3 = body.new_block();
        body.push_statement(b0, Statement::assign(Place::local(a), Rvalue::Use(Operand::Constant(1))));
        body.set_terminator(
            b0,
            TerminatorKind::SwitchInt {
                discr: Operand::Constant(0),
                targets: vec![b1],
                otherwise: b2,
            },
        );
        body.push_statement(b1, Statement::new(StatementKind::StoreGlobal {
            global: crate::mir::GlobalId(0),
            value: copy(a),
        }));
        body.set_terminator(b1, TerminatorKind::Goto { target: b3 });
        body.set_terminator(b2, TerminatorKind::Goto { target: b3 });
        body.set_terminator(b3, TerminatorKind::Return);

        let live = compute_liveness(&body);
        assert!(live.is_live_out(b0, a));
        let points = live.death_points(a);
        assert!(points.contains(&DeathPoint::After(Location::new(b1, 0))));
        assert!(points.contains(&DeathPoint::OnEdge { from: b0, to: b2 }));
        assert_eq!(points.len(), 2);
    }

    #[test]
    fn test_loop_keeps_local_live() {
        let mut body = Body::new("f", 0);
        let a = body.new_local(LocalKind::Temp, None);
        let b0 = body.new_block();
        let b1 = body.new_block();
        let b2 = body.new_block();
        body.push_statement(b0, Statement::assign(Place::local(a), Rvalue::Use(Operand::Constant(1))));
        body.set_terminator(b0, TerminatorKind::Goto { target: b1 });
        body.set_terminator(
            b1,
            TerminatorKind::SwitchInt {
                discr: copy(a),
                targets: vec![b1],
                otherwise: b2,
            },
        );
        body.set_terminator(b2, TerminatorKind::Return);

        let live = compute_liveness(&body);
        assert!(live.is_live_out(b1, a));
        assert_eq!(live.death_points(a), &[DeathPoint::OnEdge { from: b1, to: b2 }]);
    }

    #[test]
    fn test_field_write_reads_base() {
        let mut body = Body::new("f", 0);
        let a = body.new_local(LocalKind::Temp, None);
        let bb = body.new_block();
        body.push_statement(bb, Statement::assign(Place::local(a), Rvalue::Use(Operand::Constant(0))));
        body.push_statement(bb, Statement::assign(Place::local(a).field(0), Rvalue::Use(Operand::Constant(1))));
        body.set_terminator(bb, TerminatorKind::Return);
        let live = compute_liveness(&body);
        assert_eq!(live.last_uses(a), vec![Location::new(bb, 1)]);
    }
}
