//! Shared teardown machinery.
//!
//! Every engine ends in the same place: a reference is dropped, some count
//! reaches zero and a set of objects must be freed without recursion and
//! without touching freed memory. [`Reclaimer`] is that worklist.
//!
//! Two kinds of reference exist:
//!
//! - *external* references, held by locals and scopes (`drop_ref`);
//! - *edges*, held by strong fields of other objects (`drop_edge`).
//!
//! They differ only for symmetric objects, which count them separately.
//! SCC members redirect both to the SCC's shared count.

use std::collections::HashSet;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use tracing::{debug, trace, warn};

use crate::context::RegistryContext;
use crate::error::RuntimeResult;
use crate::object::ObjPtr;
use crate::scc::SccId;
use crate::symmetric;

enum Doomed {
    Object(ObjPtr),
    Scc(SccId),
}

fn increment(count: &AtomicU32, shared: bool) {
    if shared {
        count.fetch_add(1, Ordering::Relaxed);
    } else {
        count.store(count.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
    }
}

/// Returns true when the count reached zero.
fn decrement(count: &AtomicU32, shared: bool) -> bool {
    if shared {
        if count.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            return true;
        }
        false
    } else {
        match count.load(Ordering::Relaxed) {
            0 => {
                warn!("count decremented below zero, ignoring");
                debug_assert!(false, "count decremented below zero");
                false
            }
            n => {
                count.store(n - 1, Ordering::Relaxed);
                n == 1
            }
        }
    }
}

/// Take an external reference.
///
/// # Safety
///
/// `obj` must be live.
pub(crate) unsafe fn acquire(ctx: &RegistryContext, obj: ObjPtr) {
    let o = obj.get();
    if o.arena_id().is_some() {
        return;
    }
    let scc = o.scc_id();
    if scc != 0 && ctx.sccs.inc(SccId::from_raw(scc)) {
        return;
    }
    increment(&o.rc, o.is_shared());
}

/// Worklist of objects and SCCs whose last reference is gone.
pub(crate) struct Reclaimer<'a> {
    ctx: &'a RegistryContext,
    work: Vec<Doomed>,
    symmetric: Vec<ObjPtr>,
    freed: usize,
}

impl<'a> Reclaimer<'a> {
    pub(crate) fn new(ctx: &'a RegistryContext) -> Self {
        Self {
            ctx,
            work: Vec::new(),
            symmetric: Vec::new(),
            freed: 0,
        }
    }

    /// Take the reference a strong field holds on `target`.
    pub(crate) unsafe fn acquire_edge(&mut self, target: ObjPtr) {
        let t = target.get();
        if t.is_symmetric() {
            increment(&t.internal, t.is_shared());
        } else {
            acquire(self.ctx, target);
        }
    }

    /// Drop a reference held by a strong field.
    pub(crate) unsafe fn drop_edge(&mut self, target: ObjPtr) {
        let t = target.get();
        if t.is_releasing() || t.arena_id().is_some() {
            return;
        }
        if t.is_symmetric() {
            decrement(&t.internal, t.is_shared());
            if t.ref_count() == 0 {
                self.symmetric.push(target);
            }
            return;
        }
        self.drop_count(target);
    }

    /// Drop a reference held by a local or a scope.
    pub(crate) unsafe fn drop_ref(&mut self, target: ObjPtr) {
        let t = target.get();
        if t.is_releasing() || t.arena_id().is_some() {
            return;
        }
        if t.is_symmetric() {
            if decrement(&t.rc, t.is_shared()) {
                self.symmetric.push(target);
            }
            return;
        }
        self.drop_count(target);
    }

    /// Free `root` whatever its count, then whatever only it kept alive.
    pub(crate) fn free_root(&mut self, root: ObjPtr) {
        self.work.push(Doomed::Object(root));
    }

    /// Release an SCC whose shared count is already zero.
    pub(crate) fn release_scc(&mut self, id: SccId) {
        self.work.push(Doomed::Scc(id));
    }

    unsafe fn drop_count(&mut self, target: ObjPtr) {
        let t = target.get();
        let scc = t.scc_id();
        if scc != 0 {
            let id = SccId::from_raw(scc);
            match self.ctx.sccs.dec(id) {
                Some(0) => self.work.push(Doomed::Scc(id)),
                Some(_) => {}
                None => {
                    if decrement(&t.rc, t.is_shared()) {
                        self.work.push(Doomed::Object(target));
                    }
                }
            }
            return;
        }
        if decrement(&t.rc, t.is_shared()) {
            self.work.push(Doomed::Object(target));
        }
    }

    /// Free everything queued. Returns the number of objects freed.
    pub(crate) unsafe fn run(mut self) -> RuntimeResult<usize> {
        loop {
            while let Some(doomed) = self.work.pop() {
                match doomed {
                    Doomed::Object(obj) => self.free_one(obj)?,
                    Doomed::Scc(id) => {
                        if let Some(members) = self.ctx.sccs.take(id) {
                            debug!(scc = %id, members = members.len(), "releasing SCC");
                            self.teardown(&members)?;
                            self.ctx.counters().record_scc(true);
                        }
                    }
                }
            }
            if self.symmetric.is_empty() {
                break;
            }
            let candidates = std::mem::take(&mut self.symmetric);
            let garbage = symmetric::garbage(&candidates);
            if !garbage.is_empty() {
                trace!(candidates = candidates.len(), garbage = garbage.len(), "symmetric collection");
                self.teardown(&garbage)?;
            }
        }
        Ok(self.freed)
    }

    unsafe fn free_one(&mut self, obj: ObjPtr) -> RuntimeResult<()> {
        let o = obj.get();
        o.mark_releasing();
        for field in o.fields().iter().filter(|f| !f.is_weak()) {
            if let Some(child) = field.take() {
                self.drop_edge(child);
            }
        }
        self.ctx.free_object(obj)?;
        self.freed += 1;
        Ok(())
    }

    /// Two-phase release of a set of objects that reference each other.
    ///
    /// Phase 1 marks every member releasing. Phase 2 nulls each member's
    /// strong fields, invalidates weak references to it and frees it.
    /// References leaving the set are dropped last.
    unsafe fn teardown(&mut self, members: &[ObjPtr]) -> RuntimeResult<()> {
        let set: HashSet<usize> = members.iter().map(|m| m.addr()).collect();

        for member in members {
            member.get().mark_releasing();
        }

        let mut outside = Vec::new();
        for &member in members {
            let o = member.get();
            for field in o.fields().iter().filter(|f| !f.is_weak()) {
                if let Some(child) = field.take() {
                    if !set.contains(&child.addr()) {
                        outside.push(child);
                    }
                }
            }
            o.scc.store(0, Ordering::Release);
            self.ctx.free_object(member)?;
            self.freed += 1;
        }

        for child in outside {
            self.drop_edge(child);
        }
        Ok(())
    }
}
