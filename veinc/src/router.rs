//! # Strategy Router
//!
//! Combines shape, escape and mutability facts into one reclamation
//! strategy per allocation site.
//!
//! ## Decision Table
//!
//! | Shape | Cycle status | Frozen | Strategy |
//! |---|---|---|---|
//! | TREE | n/a | n/a | ASAP direct free |
//! | DAG | n/a | n/a | Standard RC |
//! | CYCLIC | broken by weak edges | n/a | Standard RC |
//! | CYCLIC | unbroken | yes | SCC Release |
//! | CYCLIC | unbroken | no | Symmetric RC |
//! | unknown | n/a | n/a | Symmetric RC |
//!
//! [`choose_strategy`] is the table itself: pure, total and deterministic.
//! [`route`] applies the adjustments that depend on escape facts: arena
//! opt-in, promotion of escaping or aliased trees, handles for captured
//! values and atomic counts for values that cross threads.

use std::fmt;

use vein_abi::{RuntimeFn, Strategy};

use crate::escape::EscapeState;
use crate::shape::{Shape, ShapeFact};

/// Pick a strategy from the decision table.
pub fn choose_strategy(shape: Shape, cycle_broken: bool, frozen: bool) -> Strategy {
    match (shape, cycle_broken, frozen) {
        (Shape::Tree, _, _) => Strategy::Asap,
        (Shape::Dag, _, _) => Strategy::Rc,
        (Shape::Cyclic, true, _) => Strategy::Rc,
        (Shape::Cyclic, false, true) => Strategy::SccRelease,
        (Shape::Cyclic, false, false) => Strategy::SymmetricRc,
    }
}

/// Pick a strategy for a shape fact, sending unknown shapes to Symmetric RC.
pub fn choose_for_fact(fact: ShapeFact, frozen: bool) -> Strategy {
    if fact.unknown {
        Strategy::SymmetricRc
    } else {
        choose_strategy(fact.shape, fact.cycle_broken, frozen)
    }
}

/// Facts about one allocation site, as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RouteInput {
    /// Shape of the allocated structure.
    pub fact: ShapeFact,
    /// Joined escape state of every local that owns the value.
    pub escape: EscapeState,
    /// Immutable after construction.
    pub frozen: bool,
    /// Captured by a closure.
    pub captured: bool,
    /// Reachable from another thread.
    pub crosses_thread: bool,
    /// Copied into a second owning local.
    pub aliased: bool,
}

/// Options that change routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RouteOptions {
    /// Allow arena allocation.
    pub arena_opt_in: bool,
}

/// A fact that influenced a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteReason {
    /// Shape could not be resolved.
    UnknownShape,
    /// Arena chosen on opt-in.
    Arena,
    /// Arena requested but the site does not qualify.
    ArenaDeclined,
    /// Tree escapes via an argument; no static last use in this scope.
    EscapingTree,
    /// Tree copied into a second owner.
    AliasedTree,
    /// Ownership leaves this scope; no release is emitted here.
    OwnershipTransferred,
    /// Captured by a closure; handles guard the captures.
    ClosureCapture,
    /// Shared with another thread; counts are atomic.
    CrossesThread,
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RouteReason::UnknownShape => "shape unknown",
            RouteReason::Arena => "arena opt-in",
            RouteReason::ArenaDeclined => "arena opt-in ignored",
            RouteReason::EscapingTree => "tree escapes via argument",
            RouteReason::AliasedTree => "tree is aliased",
            RouteReason::OwnershipTransferred => "ownership transferred",
            RouteReason::ClosureCapture => "captured by closure",
            RouteReason::CrossesThread => "crosses thread",
        })
    }
}

/// The router's output for one allocation site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    /// Chosen strategy.
    pub strategy: Strategy,
    /// References to the value must go through generational handles.
    pub needs_handle: bool,
    /// Reference counts must use atomic operations.
    pub atomic_rc: bool,
    /// The value leaves this scope; no release is emitted here.
    pub transfers_ownership: bool,
    /// Facts that moved the decision away from the plain table.
    pub reasons: Vec<RouteReason>,
}

impl RouteDecision {
    /// Runtime function emitted at release points.
    pub fn release_fn(&self) -> RuntimeFn {
        self.strategy.release_fn()
    }
}

/// Route one allocation site.
pub fn route(input: &RouteInput, options: &RouteOptions) -> RouteDecision {
    let mut reasons = Vec::new();
    let fact = input.fact;

    let mut strategy = choose_for_fact(fact, input.frozen);
    if fact.unknown {
        reasons.push(RouteReason::UnknownShape);
    }

    if options.arena_opt_in {
        let qualifies = !fact.unknown
            && fact.shape == Shape::Cyclic
            && input.escape == EscapeState::NoEscape
            && !input.captured
            && !input.crosses_thread;
        if qualifies {
            strategy = Strategy::Arena;
            reasons.push(RouteReason::Arena);
        } else {
            reasons.push(RouteReason::ArenaDeclined);
        }
    }

    if strategy == Strategy::Asap {
        if input.escape == EscapeState::ArgEscape {
            strategy = Strategy::Rc;
            reasons.push(RouteReason::EscapingTree);
        } else if input.aliased {
            strategy = Strategy::Rc;
            reasons.push(RouteReason::AliasedTree);
        }
    }

    let transfers_ownership = input.escape == EscapeState::GlobalEscape || input.captured;
    if transfers_ownership {
        reasons.push(RouteReason::OwnershipTransferred);
    }

    let needs_handle = input.captured || input.crosses_thread;
    if input.captured {
        reasons.push(RouteReason::ClosureCapture);
    }

    let atomic_rc = input.crosses_thread && strategy.is_counted();
    if input.crosses_thread {
        reasons.push(RouteReason::CrossesThread);
    }

    RouteDecision {
        strategy,
        needs_handle,
        atomic_rc,
        transfers_ownership,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(shape: Shape, broken: bool) -> ShapeFact {
        ShapeFact {
            shape,
            cycle_broken: broken,
            unknown: false,
        }
    }

    #[test]
    fn test_decision_table() {
        assert_eq!(choose_strategy(Shape::Tree, false, false), Strategy::Asap);
        assert_eq!(choose_strategy(Shape::Tree, true, true), Strategy::Asap);
        assert_eq!(choose_strategy(Shape::Dag, false, true), Strategy::Rc);
        assert_eq!(choose_strategy(Shape::Cyclic, true, false), Strategy::Rc);
        assert_eq!(choose_strategy(Shape::Cyclic, true, true), Strategy::Rc);
        assert_eq!(choose_strategy(Shape::Cyclic, false, true), Strategy::SccRelease);
        assert_eq!(choose_strategy(Shape::Cyclic, false, false), Strategy::SymmetricRc);
    }

    #[test]
    fn test_unknown_routes_to_symmetric() {
        for frozen in [false, true] {
            assert_eq!(choose_for_fact(ShapeFact::UNKNOWN, frozen), Strategy::SymmetricRc);
        }
        let d = route(
            &RouteInput {
                fact: ShapeFact::UNKNOWN,
                frozen: true,
                ..Default::default()
            },
            &RouteOptions::default(),
        );
        assert_eq!(d.strategy, Strategy::SymmetricRc);
        assert!(d.reasons.contains(&RouteReason::UnknownShape));
    }

    #[test]
    fn test_arena_requires_opt_in_cyclic_and_no_escape() {
        let opt_in = RouteOptions { arena_opt_in: true };
        let cyclic = RouteInput {
            fact: fact(Shape::Cyclic, false),
            ..Default::default()
        };
        assert_eq!(route(&cyclic, &opt_in).strategy, Strategy::Arena);
        assert_eq!(route(&cyclic, &RouteOptions::default()).strategy, Strategy::SymmetricRc);

        let escaping = RouteInput {
            escape: EscapeState::ArgEscape,
            ..cyclic
        };
        let d = route(&escaping, &opt_in);
        assert_eq!(d.strategy, Strategy::SymmetricRc);
        assert!(d.reasons.contains(&RouteReason::ArenaDeclined));

        let tree = RouteInput::default();
        assert_eq!(route(&tree, &opt_in).strategy, Strategy::Asap);
    }

    #[test]
    fn test_escaping_tree_promoted_to_rc() {
        let d = route(
            &RouteInput {
                escape: EscapeState::ArgEscape,
                ..Default::default()
            },
            &RouteOptions::default(),
        );
        assert_eq!(d.strategy, Strategy::Rc);
        assert!(!d.transfers_ownership);
        assert!(d.reasons.contains(&RouteReason::EscapingTree));
    }

    #[test]
    fn test_aliased_tree_promoted_to_rc() {
        let d = route(
            &RouteInput {
                aliased: true,
                ..Default::default()
            },
            &RouteOptions::default(),
        );
        assert_eq!(d.strategy, Strategy::Rc);
    }

    #[test]
    fn test_global_escape_transfers_ownership() {
        let d = route(
            &RouteInput {
                escape: EscapeState::GlobalEscape,
                ..Default::default()
            },
            &RouteOptions::default(),
        );
        assert_eq!(d.strategy, Strategy::Asap);
        assert!(d.transfers_ownership);
    }

    #[test]
    fn test_capture_and_thread_flags() {
        let d = route(
            &RouteInput {
                fact: fact(Shape::Dag, false),
                escape: EscapeState::GlobalEscape,
                captured: true,
                crosses_thread: true,
                ..Default::default()
            },
            &RouteOptions::default(),
        );
        assert_eq!(d.strategy, Strategy::Rc);
        assert!(d.needs_handle);
        assert!(d.atomic_rc);
        assert!(d.transfers_ownership);
        assert_eq!(d.release_fn(), RuntimeFn::DecRef);
    }

    #[test]
    fn test_property_router_total() {
        let mut inputs = Vec::new();
        for shape in Shape::ALL {
            for broken in [false, true] {
                for unknown in [false, true] {
                    for escape in EscapeState::ALL {
                        for bits in 0u8..16 {
                            inputs.push(RouteInput {
                                fact: ShapeFact {
                                    shape,
                                    cycle_broken: broken,
                                    unknown,
                                },
                                escape,
                                frozen: bits & 1 != 0,
                                captured: bits & 2 != 0,
                                crosses_thread: bits & 4 != 0,
                                aliased: bits & 8 != 0,
                            });
                        }
                    }
                }
            }
        }
        for input in &inputs {
            for arena_opt_in in [false, true] {
                let options = RouteOptions { arena_opt_in };
                let d = route(input, &options);
                assert_eq!(d, route(input, &options), "deterministic");
                assert!(Strategy::ALL.contains(&d.strategy));
                if d.strategy == Strategy::Arena {
                    assert!(arena_opt_in);
                    assert_eq!(input.escape, EscapeState::NoEscape);
                    assert_eq!(input.fact.shape, Shape::Cyclic);
                }
                if input.fact.unknown && !arena_opt_in {
                    assert_eq!(d.strategy, Strategy::SymmetricRc);
                }
            }
        }
    }
}
