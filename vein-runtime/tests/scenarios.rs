//! End-to-end runtime scenarios.
//!
//! Each test drives one or more engines through a complete object lifetime
//! and checks the statistics afterwards: everything allocated is freed
//! exactly once and nothing live is freed early.

use std::sync::Arc;
use std::thread;

use vein_runtime::{
    arena::{Arena, ArenaRelease},
    asap, rc, scc, Closure, ObjPtr, ObjectBuilder, RegistryContext, RuntimeConfig, RuntimeError,
    SymContext,
};

// ============================================================================
// Helpers
// ============================================================================

const NODE: u32 = 1;
const LIST_NODE: u32 = 2;

fn context() -> RegistryContext {
    let ctx = RegistryContext::default();
    // Two strong fields.
    ctx.register_type(NODE, 2, 0);
    // `next` strong, `prev` weak.
    ctx.register_type(LIST_NODE, 2, 0b10);
    ctx
}

/// Allocate `n` nodes and drop nothing.
fn nodes(ctx: &RegistryContext, tag: u32, n: usize) -> Vec<ObjPtr> {
    (0..n).map(|_| ctx.alloc(tag, false).unwrap()).collect()
}

/// Drop the caller's reference to each node.
unsafe fn release_locals(ctx: &RegistryContext, nodes: &[ObjPtr]) {
    for &node in nodes {
        rc::dec_ref(ctx, node).unwrap();
    }
}

// ============================================================================
// Standard RC
// ============================================================================

#[test]
fn test_doubly_linked_list_released_once() {
    let ctx = context();
    let list = nodes(&ctx, LIST_NODE, 5);
    unsafe {
        for pair in list.windows(2) {
            ctx.set_field(pair[0], 0, Some(pair[1])).unwrap();
            ctx.set_field(pair[1], 1, Some(pair[0])).unwrap();
        }
        release_locals(&ctx, &list[1..]);
        assert_eq!(ctx.stats().live(), 5);

        // `prev` is weak, so the list is acyclic under strong references.
        assert_eq!(rc::dec_ref(&ctx, list[0]).unwrap(), 5);
    }
    let stats = ctx.stats();
    assert_eq!(stats.freed, 5);
    assert_eq!(stats.live(), 0);
    assert_eq!(stats.weak_invalidated, 4);
    assert_eq!(ctx.weak_refs().tracked_targets(), 0);
}

#[test]
fn test_weak_field_never_decremented() {
    let ctx = context();
    let holder = ctx.alloc(LIST_NODE, false).unwrap();
    let target = ctx.alloc(LIST_NODE, false).unwrap();
    unsafe {
        ctx.set_field(holder, 1, Some(target)).unwrap();
        assert_eq!(target.get().ref_count(), 1);

        assert_eq!(rc::dec_ref(&ctx, holder).unwrap(), 1);
        assert_eq!(target.get().ref_count(), 1);
        assert!(!target.get().is_releasing());
        assert_eq!(rc::dec_ref(&ctx, target).unwrap(), 1);
    }
    assert_eq!(ctx.stats().live(), 0);
}

#[test]
fn test_concurrent_inc_dec_settles() {
    let ctx = Arc::new(context());
    let obj = ctx.alloc(NODE, true).unwrap();

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                for _ in 0..1000 {
                    unsafe {
                        rc::inc_ref(&ctx, obj);
                        rc::dec_ref(&ctx, obj).unwrap();
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(unsafe { obj.get() }.ref_count(), 1);
    assert_eq!(ctx.stats().freed, 0);
    unsafe { rc::dec_ref(&ctx, obj).unwrap() };
    assert_eq!(ctx.stats().live(), 0);
}

#[test]
fn test_deferred_safe_points_bounded() {
    let config = RuntimeConfig::builder()
        .deferred_rc(true)
        .deferred_batch(3)
        .deferred_max(100)
        .build()
        .unwrap();
    let ctx = RegistryContext::new(config);
    ctx.register_type(NODE, 2, 0);

    let objs = nodes(&ctx, NODE, 10);
    unsafe {
        for &obj in &objs {
            rc::defer_dec_ref(&ctx, obj).unwrap();
        }
    }
    assert_eq!(ctx.stats().live(), 10);

    let mut rounds = 0;
    loop {
        let applied = rc::safe_point(&ctx).unwrap();
        assert!(applied <= 3);
        if applied == 0 {
            break;
        }
        rounds += 1;
    }
    assert_eq!(rounds, 4);
    assert_eq!(ctx.stats().live(), 0);
}

// ============================================================================
// ASAP
// ============================================================================

#[test]
fn test_free_tree_then_handles_invalid() {
    let ctx = context();
    let root = ctx.alloc_slot(NODE, false).unwrap();
    let leaf = ctx.alloc_slot(NODE, false).unwrap();
    let root_handle = ctx.make_handle(root).unwrap();
    let leaf_handle = ctx.make_handle(leaf).unwrap();
    unsafe {
        ctx.set_field(root, 0, Some(leaf)).unwrap();
        rc::dec_ref(&ctx, leaf).unwrap();
        assert_eq!(asap::free_tree(&ctx, root).unwrap(), 2);
    }
    assert!(!ctx.handle_is_valid(root_handle));
    assert!(!ctx.handle_is_valid(leaf_handle));
    assert_eq!(
        ctx.resolve_handle(leaf_handle),
        Err(RuntimeError::InvalidHandle)
    );
}

// ============================================================================
// SCC Release
// ============================================================================

#[test]
fn test_disjoint_cycles_keep_separate_sccs() {
    let ctx = context();
    let root = ctx.alloc(NODE, false).unwrap();
    let a = nodes(&ctx, NODE, 2);
    let b = nodes(&ctx, NODE, 3);
    unsafe {
        ctx.set_field(a[0], 0, Some(a[1])).unwrap();
        ctx.set_field(a[1], 0, Some(a[0])).unwrap();
        for i in 0..3 {
            ctx.set_field(b[i], 0, Some(b[(i + 1) % 3])).unwrap();
        }
        // Interleave: each ring also points into the other, one way only.
        ctx.set_field(a[1], 1, Some(b[2])).unwrap();
        ctx.set_field(root, 0, Some(a[0])).unwrap();
        ctx.set_field(root, 1, Some(b[0])).unwrap();
        release_locals(&ctx, &a);
        release_locals(&ctx, &b);

        let ids = scc::freeze(&ctx, root).unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert_eq!(root.get().scc_id(), 0);

        let id_a = a[0].get().scc_id();
        let id_b = b[0].get().scc_id();
        assert_ne!(id_a, id_b);
        assert!(a.iter().all(|n| n.get().scc_id() == id_a));
        assert!(b.iter().all(|n| n.get().scc_id() == id_b));
        assert_eq!(ctx.sccs().live_count(), 2);

        assert_eq!(rc::dec_ref(&ctx, root).unwrap(), 6);
    }
    let stats = ctx.stats();
    assert_eq!(stats.sccs_created, 2);
    assert_eq!(stats.sccs_released, 2);
    assert_eq!(stats.live(), 0);
}

#[test]
fn test_scc_held_by_two_owners() {
    let ctx = context();
    let ring = nodes(&ctx, NODE, 4);
    unsafe {
        for i in 0..4 {
            ctx.set_field(ring[i], 0, Some(ring[(i + 1) % 4])).unwrap();
        }
        release_locals(&ctx, &ring[1..]);
        let ids = scc::freeze(&ctx, ring[0]).unwrap();
        scc::scc_inc(&ctx, ring[3]).unwrap();
        assert_eq!(ctx.sccs().external(ids[0]), Some(2));

        assert_eq!(scc::scc_release(&ctx, ring[0]).unwrap(), 0);
        assert_eq!(ctx.stats().live(), 4);
        assert_eq!(scc::scc_release(&ctx, ring[3]).unwrap(), 4);
    }
    assert_eq!(ctx.stats().live(), 0);
}

// ============================================================================
// Arenas
// ============================================================================

#[test]
fn test_arena_bulk_free_counts_chunks() {
    let ctx = context();
    let arena = Arena::new(&ctx.config().arena);
    for _ in 0..10_000 {
        arena.alloc(&ctx, NODE).unwrap();
    }
    let chunks = arena.chunk_count();
    assert!(chunks < arena.len() / 10);
    assert_eq!(arena.destroy(&ctx).unwrap(), chunks);
}

#[test]
fn test_arena_destroy_refused_then_deferred() {
    let ctx = context();
    let arena = Arena::new(&ctx.config().arena);
    let escaped = arena.alloc(&ctx, NODE).unwrap();
    unsafe { arena.register_external(escaped).unwrap() };

    assert_eq!(
        arena.destroy(&ctx),
        Err(RuntimeError::ArenaHasExternals { outstanding: 1 })
    );
    assert_eq!(
        arena.destroy_when_resolved(&ctx).unwrap(),
        ArenaRelease::Deferred { outstanding: 1 }
    );
    assert!(!arena.is_destroyed());
    assert!(arena.resolve_external(&ctx, escaped).unwrap());
    assert!(arena.is_destroyed());
    assert_eq!(ctx.stats().arenas_destroyed, 1);
}

// ============================================================================
// Symmetric RC
// ============================================================================

#[test]
fn test_inner_scope_cycle_freed_at_exit() {
    let ctx = context();
    let mut sym = SymContext::new();
    sym.enter_scope();
    sym.enter_scope();
    let a = sym.alloc(&ctx, NODE).unwrap();
    let b = sym.alloc(&ctx, NODE).unwrap();
    unsafe {
        sym.link(&ctx, a, 0, Some(b)).unwrap();
        sym.link(&ctx, b, 0, Some(a)).unwrap();
    }
    assert_eq!(sym.exit_scope(&ctx).unwrap(), 2);
    assert_eq!(ctx.stats().live(), 0);
    assert_eq!(sym.exit_scope(&ctx).unwrap(), 0);
}

#[test]
fn test_cycle_referenced_from_outer_scope_survives() {
    let ctx = context();
    let mut sym = SymContext::new();
    sym.enter_scope();
    let outer = sym.alloc(&ctx, NODE).unwrap();

    sym.enter_scope();
    let a = sym.alloc(&ctx, NODE).unwrap();
    let b = sym.alloc(&ctx, NODE).unwrap();
    unsafe {
        sym.link(&ctx, a, 0, Some(b)).unwrap();
        sym.link(&ctx, b, 0, Some(a)).unwrap();
        sym.link(&ctx, outer, 0, Some(a)).unwrap();
    }
    assert_eq!(sym.exit_scope(&ctx).unwrap(), 0);
    assert_eq!(ctx.stats().live(), 3);

    // Cutting the outer link strands the cycle.
    unsafe { sym.link(&ctx, outer, 0, None).unwrap() };
    assert_eq!(ctx.stats().live(), 1);
    assert_eq!(sym.exit_scope(&ctx).unwrap(), 1);
    assert_eq!(ctx.stats().live(), 0);
}

// ============================================================================
// Closures
// ============================================================================

#[test]
fn test_closure_reports_freed_capture() {
    let ctx = context();
    let x = ctx.alloc_slot_with(ObjectBuilder::new(NODE).int(42)).unwrap();
    let closure = Closure::capture(&ctx, &[x], |vals: &[ObjPtr]| unsafe {
        match vals[0].get().payload() {
            vein_runtime::Payload::Int(v) => *v,
            _ => 0,
        }
    })
    .unwrap();
    assert_eq!(closure.call(&ctx), Ok(42));

    unsafe { rc::dec_ref(&ctx, x).unwrap() };
    assert_eq!(
        closure.call(&ctx),
        Err(RuntimeError::InvalidCapture { index: 0 })
    );

    // Reusing the slot does not revive the capture.
    let y = ctx.alloc_slot_with(ObjectBuilder::new(NODE).int(7)).unwrap();
    assert_eq!(y, x);
    assert_eq!(
        closure.call(&ctx),
        Err(RuntimeError::InvalidCapture { index: 0 })
    );
    unsafe { rc::dec_ref(&ctx, y).unwrap() };
}
