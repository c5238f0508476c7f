//! # Symmetric Reference Counting
//!
//! For values that may form cycles the compiler cannot prove away. Each
//! object carries two counts:
//!
//! | Count | Held by |
//! |-------|---------|
//! | external (`rc`) | scopes and locals |
//! | internal | strong fields of other objects |
//!
//! Allocation registers the object in the innermost [`SymContext`] scope,
//! which owns its first external reference. Leaving the scope drops those
//! references. When an object's external count reaches zero it becomes a
//! candidate, and the set of candidates is checked for garbage:
//!
//! 1. `S` is everything reachable from the candidates through strong fields
//!    that is symmetric and has no external references.
//! 2. An object in `S` whose internal count exceeds the references it gets
//!    from inside `S` is referenced from somewhere live. It and everything
//!    it reaches in `S` is kept.
//! 3. The rest of `S` is unreachable and is torn down in two phases.
//!
//! Objects stored in scopes are tracked through generational handles, so a
//! value freed early never leaves a dangling entry behind.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;

use tracing::debug;

use crate::context::RegistryContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::handle::Handle;
use crate::object::{ObjPtr, ObjectBuilder, TypeTag};
use crate::reclaim::{self, Reclaimer};

/// Objects among `candidates` (and what they reach) that nothing live holds.
///
/// # Safety
///
/// Every candidate and every object reachable from one must be live.
pub(crate) unsafe fn garbage(candidates: &[ObjPtr]) -> Vec<ObjPtr> {
    let unowned = |obj: ObjPtr| {
        let o = obj.get();
        o.is_symmetric() && !o.is_releasing() && o.ref_count() == 0
    };

    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<ObjPtr> = candidates.iter().copied().filter(|&c| unowned(c)).collect();
    while let Some(obj) = stack.pop() {
        if !seen.insert(obj.addr()) {
            continue;
        }
        order.push(obj);
        stack.extend(obj.get().strong_children().filter(|&c| unowned(c)));
    }

    let mut inner: HashMap<usize, u32> = HashMap::new();
    for obj in &order {
        for child in obj.get().strong_children() {
            if seen.contains(&child.addr()) {
                *inner.entry(child.addr()).or_default() += 1;
            }
        }
    }

    let mut kept = HashSet::new();
    let mut stack: Vec<ObjPtr> = order
        .iter()
        .copied()
        .filter(|o| o.get().internal_count() > inner.get(&o.addr()).copied().unwrap_or(0))
        .collect();
    while let Some(obj) = stack.pop() {
        if !kept.insert(obj.addr()) {
            continue;
        }
        stack.extend(
            obj.get()
                .strong_children()
                .filter(|c| seen.contains(&c.addr())),
        );
    }

    order.retain(|o| !kept.contains(&o.addr()));
    order
}

/// Per-thread stack of symmetric scopes.
#[derive(Debug)]
pub struct SymContext {
    scopes: Vec<HashMap<usize, Handle>>,
    _not_send: PhantomData<*const ()>,
}

impl SymContext {
    /// No open scopes.
    pub fn new() -> Self {
        Self {
            scopes: Vec::new(),
            _not_send: PhantomData,
        }
    }

    /// Open a scope.
    pub fn enter_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Close the innermost scope, dropping the reference it holds on each
    /// of its objects. Returns the number of objects freed.
    pub fn exit_scope(&mut self, ctx: &RegistryContext) -> RuntimeResult<usize> {
        let scope = self.scopes.pop().ok_or(RuntimeError::NoActiveScope)?;
        let owned = scope.len();

        let mut reclaimer = Reclaimer::new(ctx);
        for handle in scope.into_values() {
            if let Some(obj) = ctx.handle_deref(handle) {
                // Safety: a handle that still derefs names a live object, and
                // the scope owns one external reference to it.
                unsafe { reclaimer.drop_ref(obj) };
            }
        }
        // Safety: as above.
        let freed = unsafe { reclaimer.run()? };
        debug!(depth = self.scopes.len(), owned, freed, "exit symmetric scope");
        Ok(freed)
    }

    /// Allocate a registered type in the innermost scope.
    pub fn alloc(&mut self, ctx: &RegistryContext, tag: TypeTag) -> RuntimeResult<ObjPtr> {
        let builder = ctx.builder(tag)?;
        self.alloc_with(ctx, builder)
    }

    /// Allocate a custom object in the innermost scope.
    pub fn alloc_with(
        &mut self,
        ctx: &RegistryContext,
        builder: ObjectBuilder,
    ) -> RuntimeResult<ObjPtr> {
        let scope = self.scopes.last_mut().ok_or(RuntimeError::NoActiveScope)?;
        let obj = ctx.alloc_slot_with(builder.symmetric(true))?;
        let handle = ctx.make_handle(obj)?;
        scope.insert(obj.addr(), handle);
        Ok(obj)
    }

    /// Take one more external reference.
    ///
    /// # Safety
    ///
    /// `obj` must be live.
    pub unsafe fn acquire(&self, ctx: &RegistryContext, obj: ObjPtr) {
        reclaim::acquire(ctx, obj);
    }

    /// Drop one external reference. If a scope still owns the object, its
    /// entry is removed so the scope does not drop it again. Returns the
    /// number of objects freed.
    ///
    /// # Safety
    ///
    /// `obj` must be live and the caller must own the reference it drops.
    pub unsafe fn release(&mut self, ctx: &RegistryContext, obj: ObjPtr) -> RuntimeResult<usize> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(&handle) = scope.get(&obj.addr()) {
                if ctx.handle_deref(handle) == Some(obj) {
                    scope.remove(&obj.addr());
                    break;
                }
            }
        }
        let mut reclaimer = Reclaimer::new(ctx);
        reclaimer.drop_ref(obj);
        reclaimer.run()
    }

    /// Store `target` into field `index` of `obj`.
    ///
    /// # Safety
    ///
    /// As [`RegistryContext::set_field`].
    pub unsafe fn link(
        &self,
        ctx: &RegistryContext,
        obj: ObjPtr,
        index: u32,
        target: Option<ObjPtr>,
    ) -> RuntimeResult<()> {
        ctx.set_field(obj, index, target)
    }
}

impl Default for SymContext {
    fn default() -> Self {
        Self::new()
    }
}
