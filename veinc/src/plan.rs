//! # Memory Planning
//!
//! Runs the analysis pipeline over a compilation unit and decides, for every
//! allocation site, how and where its memory is reclaimed.
//!
//! ## Pipeline
//!
//! ```text
//! TypeGraph ──► Back-Edge Detection ──► (weak fields fixed)
//!                                            │
//! Body ──► Escape ──► Liveness ──► Sites ──► Shape ──► Router ──► PlannedCalls
//! ```
//!
//! Back-edge detection runs once per unit, before shape classification,
//! because whether a cycle is broken depends on which fields are weak.
//!
//! ## Ownership Tracking
//!
//! The local an allocation is assigned to owns it. `b = move a` transfers
//! ownership (a's death at the move is not a release). `b = copy a` makes
//! `b` a second owner: counted strategies acquire a reference there, and a
//! TREE value becomes aliased and is promoted to RC. Allocations written
//! straight into a field are owned by the enclosing object and are never
//! released on their own.
//!
//! ## Placement
//!
//! | Strategy | Calls |
//! |---|---|
//! | ASAP | `free_tree` at every death point of every owner |
//! | RC | `inc_ref` at copies, `dec_ref` at deaths |
//! | SCC | `scc_freeze` after the last field write, `scc_release` at deaths |
//! | Arena | one arena per body, created at entry, destroyed before each return |
//! | Symmetric RC | scope entered at entry and exited before each return, `sym_acquire` at copies and on escaping values, `sym_release` at deaths |

use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;
use vein_abi::{RuntimeFn, Strategy};

use crate::backedge::{BackEdgeDetector, BackEdgeReport};
use crate::config::AnalysisConfig;
use crate::error::AnalysisResult;
use crate::escape::{EscapeAnalyzer, EscapeResults, EscapeState};
use crate::liveness::{compute_liveness, DeathPoint, LivenessResults};
use crate::mir::{BasicBlockId, Body, LocalId, Location, Operand, Place, Rvalue, SiteId, StatementKind};
use crate::router::{route, RouteDecision, RouteInput, RouteOptions};
use crate::shape::{classify_shape, ShapeFact};
use crate::types::{TypeGraph, TypeId};

// ============================================================================
// Plan Types
// ============================================================================

/// Where a runtime call is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramPoint {
    /// Start of the body.
    Entry,
    /// Replaces the statement at this location.
    At(Location),
    /// Immediately before the statement or terminator.
    Before(Location),
    /// Immediately after the statement or terminator.
    After(Location),
    /// On a CFG edge.
    OnEdge {
        /// Source block.
        from: BasicBlockId,
        /// Destination block.
        to: BasicBlockId,
    },
}

impl From<DeathPoint> for ProgramPoint {
    fn from(point: DeathPoint) -> Self {
        match point {
            DeathPoint::After(loc) => ProgramPoint::After(loc),
            DeathPoint::OnEdge { from, to } => ProgramPoint::OnEdge { from, to },
        }
    }
}

impl fmt::Display for ProgramPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramPoint::Entry => f.write_str("entry"),
            ProgramPoint::At(loc) => write!(f, "at {loc}"),
            ProgramPoint::Before(loc) => write!(f, "before {loc}"),
            ProgramPoint::After(loc) => write!(f, "after {loc}"),
            ProgramPoint::OnEdge { from, to } => write!(f, "edge {from}->{to}"),
        }
    }
}

/// An analyzed allocation site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationSite {
    /// Site identifier.
    pub id: SiteId,
    /// Allocated type.
    pub ty: TypeId,
    /// Estimated object size in bytes.
    pub size: usize,
    /// Location of the allocation statement.
    pub location: Location,
    /// Place the new object is written to.
    pub place: Place,
    /// Locals that own the value. Empty when written into a field.
    pub owners: Vec<LocalId>,
    /// Immutable after construction.
    pub frozen: bool,
    /// Shape of the allocated structure.
    pub fact: ShapeFact,
    /// Joined escape state of the owners.
    pub escape: EscapeState,
    /// Router output.
    pub decision: RouteDecision,
}

impl AllocationSite {
    /// Chosen strategy.
    pub fn strategy(&self) -> Strategy {
        self.decision.strategy
    }

    /// Whether the object is owned by an enclosing object's field.
    pub fn is_embedded(&self) -> bool {
        self.owners.is_empty()
    }

    /// Runtime function that performs the allocation.
    pub fn alloc_fn(&self) -> RuntimeFn {
        if self.decision.needs_handle {
            return RuntimeFn::SlotPoolAlloc;
        }
        match self.decision.strategy {
            Strategy::Arena => RuntimeFn::ArenaAlloc,
            Strategy::SymmetricRc => RuntimeFn::SymAlloc,
            Strategy::Asap | Strategy::Rc | Strategy::SccRelease => RuntimeFn::Alloc,
        }
    }
}

/// A runtime call chosen by the planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCall {
    /// Placement.
    pub point: ProgramPoint,
    /// Runtime entry point.
    pub func: RuntimeFn,
    /// Site the call belongs to; `None` for body-level calls.
    pub site: Option<SiteId>,
    /// Local passed to the call, if any.
    pub local: Option<LocalId>,
}

/// Memory plan for one body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPlan {
    /// Body name.
    pub body: String,
    /// Allocation sites in program order.
    pub sites: Vec<AllocationSite>,
    /// Runtime calls in emission order.
    pub calls: Vec<PlannedCall>,
}

impl MemoryPlan {
    /// Look up a site.
    pub fn site(&self, id: SiteId) -> Option<&AllocationSite> {
        self.sites.iter().find(|s| s.id == id)
    }

    /// Calls belonging to a site.
    pub fn calls_for(&self, id: SiteId) -> impl Iterator<Item = &PlannedCall> {
        self.calls.iter().filter(move |c| c.site == Some(id))
    }

    /// Calls to a given runtime function.
    pub fn calls_to(&self, func: RuntimeFn) -> impl Iterator<Item = &PlannedCall> {
        self.calls.iter().filter(move |c| c.func == func)
    }

    /// Number of sites per strategy.
    pub fn strategy_counts(&self) -> FxHashMap<Strategy, usize> {
        let mut counts = FxHashMap::default();
        for site in &self.sites {
            *counts.entry(site.strategy()).or_insert(0) += 1;
        }
        counts
    }
}

/// Plans for every body of a compilation unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPlan {
    /// Back-edge detection results.
    pub backedges: BackEdgeReport,
    /// One plan per body, in input order.
    pub bodies: Vec<MemoryPlan>,
}

// ============================================================================
// Planner
// ============================================================================

/// Drives the analysis passes and the router.
#[derive(Debug, Clone, Default)]
pub struct MemoryPlanner {
    config: AnalysisConfig,
}

impl MemoryPlanner {
    /// Create a planner.
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    /// The planner's configuration.
    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Fix field strengths for the unit. Must run before [`plan`](Self::plan).
    pub fn prepare(&self, graph: &mut TypeGraph) -> AnalysisResult<BackEdgeReport> {
        BackEdgeDetector::new(&self.config).detect(graph)
    }

    /// Prepare the type graph and plan every body.
    pub fn plan_unit(&self, graph: &mut TypeGraph, bodies: &[Body]) -> AnalysisResult<UnitPlan> {
        let backedges = self.prepare(graph)?;
        let bodies = bodies
            .iter()
            .map(|body| self.plan(graph, body))
            .collect::<AnalysisResult<Vec<_>>>()?;
        Ok(UnitPlan { backedges, bodies })
    }

    /// Plan one body against a prepared type graph.
    pub fn plan(&self, graph: &TypeGraph, body: &Body) -> AnalysisResult<MemoryPlan> {
        body.validate()?;
        let escape = EscapeAnalyzer::new(&self.config).analyze(body);
        let liveness = compute_liveness(body);
        let ownership = Ownership::collect(body);
        let returns = body.return_locations();
        let options = RouteOptions {
            arena_opt_in: self.config.arena_opt_in,
        };

        let mut sites = Vec::new();
        let mut calls = Vec::new();

        for (location, place, site, ty, frozen) in allocations(body) {
            let owners = ownership.owners_of(&place);
            let fact = classify_shape(graph, ty)?;

            let (escape_state, captured, crosses) = if owners.is_empty() {
                (escape.get(place.local), false, escape.crosses_thread(place.local))
            } else {
                join_escape(&escape, &owners)
            };

            let input = RouteInput {
                fact,
                escape: escape_state,
                frozen,
                captured,
                crosses_thread: crosses,
                aliased: owners.iter().any(|o| ownership.copies_of(*o).next().is_some()),
            };
            let decision = route(&input, &options);

            debug!(
                body = %body.name,
                %site,
                shape = %fact,
                escape = %escape_state,
                strategy = %decision.strategy,
                reasons = ?decision.reasons,
                "routed allocation site"
            );

            let alloc = AllocationSite {
                id: site,
                ty,
                size: graph.estimated_size(ty)?,
                location,
                place,
                owners,
                frozen,
                fact,
                escape: escape_state,
                decision,
            };
            place_site_calls(&alloc, &ownership, &liveness, &returns, &mut calls);
            sites.push(alloc);
        }

        // Entry calls first, exits last, so a value acquired before a return
        // is counted before its scope drops.
        let mut body_calls = Vec::new();
        let mut exit_calls = Vec::new();
        let uses = |s: Strategy| sites.iter().any(|site: &AllocationSite| site.strategy() == s);
        if uses(Strategy::Arena) {
            body_calls.push(body_call(ProgramPoint::Entry, RuntimeFn::ArenaCreate));
            for &ret in &returns {
                exit_calls.push(body_call(ProgramPoint::Before(ret), RuntimeFn::ArenaDestroy));
            }
        }
        if uses(Strategy::SymmetricRc) {
            body_calls.push(body_call(ProgramPoint::Entry, RuntimeFn::SymEnterScope));
            for &ret in &returns {
                exit_calls.push(body_call(ProgramPoint::Before(ret), RuntimeFn::SymExitScope));
            }
        }
        body_calls.extend(calls);
        body_calls.extend(exit_calls);

        Ok(MemoryPlan {
            body: body.name.clone(),
            sites,
            calls: body_calls,
        })
    }
}

fn body_call(point: ProgramPoint, func: RuntimeFn) -> PlannedCall {
    PlannedCall {
        point,
        func,
        site: None,
        local: None,
    }
}

fn join_escape(escape: &EscapeResults, owners: &[LocalId]) -> (EscapeState, bool, bool) {
    owners.iter().fold(
        (EscapeState::NoEscape, false, false),
        |(state, captured, crosses), &o| {
            (
                state.join(escape.get(o)),
                captured || escape.is_closure_captured(o),
                crosses || escape.crosses_thread(o),
            )
        },
    )
}

fn allocations(body: &Body) -> Vec<(Location, Place, SiteId, TypeId, bool)> {
    let mut found = Vec::new();
    for (block, data) in body.blocks() {
        for (i, stmt) in data.statements.iter().enumerate() {
            if let StatementKind::Assign(place, Rvalue::Alloc { site, ty, frozen, .. }) = &stmt.kind {
                found.push((Location::new(block, i), place.clone(), *site, *ty, *frozen));
            }
        }
    }
    found
}

fn place_site_calls(
    site: &AllocationSite,
    ownership: &Ownership,
    liveness: &LivenessResults,
    returns: &[Location],
    calls: &mut Vec<PlannedCall>,
) {
    let first_owner = site.owners.first().copied();
    let mut push = |point: ProgramPoint, func: RuntimeFn, local: Option<LocalId>| {
        calls.push(PlannedCall {
            point,
            func,
            site: Some(site.id),
            local,
        });
    };

    push(ProgramPoint::At(site.location), site.alloc_fn(), first_owner);
    if site.decision.needs_handle && first_owner.is_some() {
        push(ProgramPoint::After(site.location), RuntimeFn::MakeHandle, first_owner);
    }

    if site.is_embedded() {
        return;
    }

    let strategy = site.strategy();

    if site.decision.transfers_ownership {
        // The scope's own reference drops at exit; the escaping value needs
        // one of its own.
        if strategy == Strategy::SymmetricRc {
            for &ret in returns {
                push(ProgramPoint::Before(ret), RuntimeFn::SymAcquire, first_owner);
            }
        }
        return;
    }

    if strategy == Strategy::SccRelease {
        let freeze_at = ownership
            .last_field_write(&site.owners)
            .unwrap_or(site.location);
        push(ProgramPoint::After(freeze_at), RuntimeFn::SccFreeze, first_owner);
    }

    if let Some(acquire) = strategy.acquire_fn() {
        for &owner in &site.owners {
            for (loc, dst) in ownership.copies_of(owner) {
                push(ProgramPoint::After(loc), acquire, Some(dst));
            }
        }
    }

    if strategy == Strategy::Arena {
        return;
    }

    let release = strategy.release_fn();
    for &owner in &site.owners {
        for &death in liveness.death_points(owner) {
            if let DeathPoint::After(loc) = death {
                if ownership.is_move_out(owner, loc) {
                    continue;
                }
            }
            push(death.into(), release, Some(owner));
        }
    }
}

// ============================================================================
// Ownership
// ============================================================================

#[derive(Debug, Default)]
struct Ownership {
    /// (location, source, destination, is_move) for `dst = copy|move src`.
    transfers: Vec<(Location, LocalId, LocalId, bool)>,
    /// Locations of field writes, by base local.
    field_writes: FxHashMap<LocalId, Vec<Location>>,
}

impl Ownership {
    fn collect(body: &Body) -> Self {
        let mut own = Ownership::default();
        for (block, data) in body.blocks() {
            for (i, stmt) in data.statements.iter().enumerate() {
                let loc = Location::new(block, i);
                let StatementKind::Assign(place, rvalue) = &stmt.kind else {
                    continue;
                };
                match (place.as_local(), rvalue) {
                    (Some(dst), Rvalue::Use(op)) => {
                        let (src, is_move) = match op {
                            Operand::Copy(p) => (p.as_local(), false),
                            Operand::Move(p) => (p.as_local(), true),
                            Operand::Constant(_) => (None, false),
                        };
                        if let Some(src) = src {
                            if src != dst {
                                own.transfers.push((loc, src, dst, is_move));
                            }
                        }
                    }
                    (None, _) => own.field_writes.entry(place.local).or_default().push(loc),
                    (Some(_), _) => {}
                }
            }
        }
        own
    }

    /// Every local that owns the value first written to `place`.
    fn owners_of(&self, place: &Place) -> Vec<LocalId> {
        let Some(root) = place.as_local() else {
            return Vec::new();
        };
        let mut owners = vec![root];
        let mut seen: FxHashSet<LocalId> = owners.iter().copied().collect();
        let mut i = 0;
        while i < owners.len() {
            let src = owners[i];
            for &(_, from, to, _) in &self.transfers {
                if from == src && seen.insert(to) {
                    owners.push(to);
                }
            }
            i += 1;
        }
        owners
    }

    fn copies_of(&self, owner: LocalId) -> impl Iterator<Item = (Location, LocalId)> + '_ {
        self.transfers
            .iter()
            .filter(move |(_, from, _, is_move)| *from == owner && !is_move)
            .map(|(loc, _, to, _)| (*loc, *to))
    }

    fn is_move_out(&self, owner: LocalId, loc: Location) -> bool {
        self.transfers
            .iter()
            .any(|(l, from, _, is_move)| *is_move && *from == owner && *l == loc)
    }

    /// Last field write through any owner, in block then statement order.
    fn last_field_write(&self, owners: &[LocalId]) -> Option<Location> {
        owners
            .iter()
            .filter_map(|o| self.field_writes.get(o))
            .flatten()
            .copied()
            .max()
    }
}
