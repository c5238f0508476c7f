//! # FFI Exports
//!
//! C-compatible exports for linking compiled Vein programs against the
//! runtime.
//!
//! ## Design
//!
//! Every entry point named by [`vein_abi::RuntimeFn`] is exported here under
//! the same symbol. [`export_address`] and [`export_name`] are generated from
//! one table that maps each `RuntimeFn` variant to its export, so a missing
//! export fails to compile and a renamed one fails the ABI test.
//!
//! The process-wide [`RegistryContext`] is created by `vein_runtime_init`,
//! or lazily by the first call that needs it. Symmetric RC scopes live in a
//! thread-local [`SymContext`], and arenas are boxed and passed back to the
//! program as opaque pointers.
//!
//! ## Errors
//!
//! Fallible entry points return a [`vein_abi::status`] code. Entry points
//! returning a pointer return null on a recoverable error. Allocation
//! exhaustion is fatal: it is logged and the process aborts.
//!
//! ## Usage
//!
//! Build as a cdylib or staticlib, then link compiled Vein programs with
//! `-lvein_runtime`.

use std::cell::RefCell;
use std::ffi::c_void;
use std::ptr;
use std::sync::OnceLock;

use tracing::{error, warn};
use vein_abi::{status, RuntimeFn};

use crate::arena::{Arena, ArenaRelease};
use crate::asap;
use crate::config::RuntimeConfig;
use crate::context::RegistryContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::handle::Handle;
use crate::log::init_logging;
use crate::object::ObjPtr;
use crate::rc;
use crate::scc;
use crate::symmetric::SymContext;

static CONTEXT: OnceLock<RegistryContext> = OnceLock::new();

thread_local! {
    static SYM: RefCell<SymContext> = RefCell::new(SymContext::new());
}

/// The process-wide context, created from the environment on first use.
pub fn context() -> &'static RegistryContext {
    CONTEXT.get_or_init(|| {
        let config = RuntimeConfig::from_env();
        init_logging(&config.log);
        RegistryContext::new(config)
    })
}

fn object(ptr: *mut c_void) -> Option<ObjPtr> {
    ObjPtr::new(ptr.cast())
}

fn to_status(result: RuntimeResult<impl Sized>) -> i32 {
    match result {
        Ok(_) => status::OK,
        Err(err) => err.status(),
    }
}

fn to_ptr(result: RuntimeResult<ObjPtr>, what: &str) -> *mut c_void {
    match result {
        Ok(obj) => obj.as_ptr().cast(),
        Err(
            err @ (RuntimeError::PoolExhausted { .. } | RuntimeError::ArenaExhausted { .. }),
        ) => fatal(&err, what),
        Err(err) => {
            warn!(%err, what, "allocation refused");
            ptr::null_mut()
        }
    }
}

fn fatal(err: &RuntimeError, what: &str) -> ! {
    error!(%err, what, "out of memory, aborting");
    std::process::abort()
}

// ============================================================================
// Context
// ============================================================================

/// Create the process-wide runtime context from `VEIN_*` variables and
/// install logging. Calling it again is a no-op.
#[no_mangle]
pub extern "C" fn vein_runtime_init() -> i32 {
    context();
    status::OK
}

/// Register the layout of a type: `field_count` reference fields, bit `i`
/// of `weak_mask` marking field `i` weak.
#[no_mangle]
pub extern "C" fn vein_register_type(tag: u32, field_count: u32, weak_mask: u64) -> i32 {
    context().register_type(tag, field_count, weak_mask);
    status::OK
}

/// Allocate a heap object of a registered type with a count of one.
/// Returns null for an unregistered tag.
#[no_mangle]
pub extern "C" fn vein_alloc(tag: u32, shared: i32) -> *mut c_void {
    to_ptr(context().alloc(tag, shared != 0), "vein_alloc")
}

/// Store `target` (possibly null) into field `index` of `obj`.
///
/// # Safety
/// `obj` and `target` must be null or live runtime objects.
#[no_mangle]
pub unsafe extern "C" fn vein_set_field(obj: *mut c_void, index: u32, target: *mut c_void) -> i32 {
    let Some(obj) = object(obj) else {
        return status::INVALID_OBJECT;
    };
    to_status(context().set_field(obj, index, object(target)))
}

// ============================================================================
// ASAP and Reference Counting
// ============================================================================

/// Free the tree rooted at `root` at its last use.
///
/// # Safety
/// `root` must be null or a live object whose only reference is the caller's.
#[no_mangle]
pub unsafe extern "C" fn vein_free_tree(root: *mut c_void) {
    if let Some(root) = object(root) {
        if let Err(err) = asap::free_tree(context(), root) {
            warn!(%err, "free_tree failed");
        }
    }
}

/// Take one more strong reference.
///
/// # Safety
/// `obj` must be null or a live object.
#[no_mangle]
pub unsafe extern "C" fn vein_inc_ref(obj: *mut c_void) {
    if let Some(obj) = object(obj) {
        rc::inc_ref(context(), obj);
    }
}

/// Drop one strong reference. With `VEIN_DEFERRED_RC` set the decrement is
/// queued for a later safe point.
///
/// # Safety
/// `obj` must be null or a live object, and the caller must own the
/// reference it drops.
#[no_mangle]
pub unsafe extern "C" fn vein_dec_ref(obj: *mut c_void) {
    let Some(obj) = object(obj) else {
        return;
    };
    let ctx = context();
    let result = if ctx.deferred.is_enabled() {
        rc::defer_dec_ref(ctx, obj)
    } else {
        rc::dec_ref(ctx, obj)
    };
    if let Err(err) = result {
        warn!(%err, "dec_ref failed");
    }
}

/// Apply at most one batch of deferred decrements. Returns how many ran.
#[no_mangle]
pub extern "C" fn vein_safe_point() -> u32 {
    match rc::safe_point(context()) {
        Ok(n) => n as u32,
        Err(err) => {
            warn!(%err, "safe point failed");
            0
        }
    }
}

// ============================================================================
// SCC Release
// ============================================================================

/// Freeze the cycles reachable from `root`. Returns the number of SCCs
/// created, or a negative status.
///
/// # Safety
/// `root` must be null or a live object.
#[no_mangle]
pub unsafe extern "C" fn vein_scc_freeze(root: *mut c_void) -> i32 {
    let Some(root) = object(root) else {
        return status::INVALID_OBJECT;
    };
    match scc::freeze(context(), root) {
        Ok(ids) => ids.len() as i32,
        Err(err) => err.status(),
    }
}

/// Drop one reference to the SCC containing `obj`.
///
/// # Safety
/// `obj` must be null or a live object, and the caller must own the
/// reference it drops.
#[no_mangle]
pub unsafe extern "C" fn vein_scc_release(obj: *mut c_void) -> i32 {
    let Some(obj) = object(obj) else {
        return status::INVALID_OBJECT;
    };
    to_status(scc::scc_release(context(), obj))
}

// ============================================================================
// Arenas
// ============================================================================

/// Create an arena owned by the calling thread.
#[no_mangle]
pub extern "C" fn vein_arena_create() -> *mut c_void {
    let arena = Box::new(Arena::new(&context().config().arena));
    Box::into_raw(arena).cast()
}

/// Bump-allocate an object of a registered type.
///
/// # Safety
/// `arena` must be null or a live arena from `vein_arena_create` on this
/// thread.
#[no_mangle]
pub unsafe extern "C" fn vein_arena_alloc(arena: *mut c_void, tag: u32) -> *mut c_void {
    let Some(arena) = arena.cast::<Arena>().as_ref() else {
        return ptr::null_mut();
    };
    to_ptr(arena.alloc(context(), tag), "vein_arena_alloc")
}

/// Record a reference to `obj` that outlives the arena's region.
///
/// # Safety
/// `arena` must be null or a live arena on this thread; `obj` must be null
/// or a live object.
#[no_mangle]
pub unsafe extern "C" fn vein_arena_register_external(arena: *mut c_void, obj: *mut c_void) -> i32 {
    let (Some(arena), Some(obj)) = (arena.cast::<Arena>().as_ref(), object(obj)) else {
        return status::INVALID_OBJECT;
    };
    to_status(arena.register_external(obj))
}

/// Resolve an external reference. If the arena's destruction was deferred
/// and this was the last one, the arena is destroyed and `arena` becomes
/// invalid.
///
/// # Safety
/// As [`vein_arena_register_external`].
#[no_mangle]
pub unsafe extern "C" fn vein_arena_resolve_external(arena: *mut c_void, obj: *mut c_void) -> i32 {
    let raw = arena.cast::<Arena>();
    let (Some(arena), Some(obj)) = (raw.as_ref(), object(obj)) else {
        return status::INVALID_OBJECT;
    };
    match arena.resolve_external(context(), obj) {
        Ok(true) => {
            drop(Box::from_raw(raw));
            status::OK
        }
        Ok(false) => status::OK,
        Err(err) => err.status(),
    }
}

/// Destroy an arena. Returns `DEFERRED` while external references remain;
/// the last `vein_arena_resolve_external` then completes the destruction.
///
/// # Safety
/// `arena` must be null or a live arena on this thread, and must not be
/// used after a return of `OK`.
#[no_mangle]
pub unsafe extern "C" fn vein_arena_destroy(arena: *mut c_void) -> i32 {
    let raw = arena.cast::<Arena>();
    let Some(arena) = raw.as_ref() else {
        return status::INVALID_OBJECT;
    };
    match arena.destroy_when_resolved(context()) {
        Ok(ArenaRelease::Destroyed { .. }) => {
            drop(Box::from_raw(raw));
            status::OK
        }
        Ok(ArenaRelease::Deferred { .. }) => status::DEFERRED,
        Err(err) => err.status(),
    }
}

// ============================================================================
// Symmetric RC
// ============================================================================

/// Open a symmetric RC scope on the calling thread.
#[no_mangle]
pub extern "C" fn vein_sym_enter_scope() {
    SYM.with(|sym| sym.borrow_mut().enter_scope());
}

/// Close the innermost scope on the calling thread.
#[no_mangle]
pub extern "C" fn vein_sym_exit_scope() -> i32 {
    SYM.with(|sym| to_status(sym.borrow_mut().exit_scope(context())))
}

/// Allocate an object owned by the innermost scope. Returns null when no
/// scope is open or the tag is unregistered.
#[no_mangle]
pub extern "C" fn vein_sym_alloc(tag: u32) -> *mut c_void {
    SYM.with(|sym| to_ptr(sym.borrow_mut().alloc(context(), tag), "vein_sym_alloc"))
}

/// Take one more external reference.
///
/// # Safety
/// `obj` must be null or a live object.
#[no_mangle]
pub unsafe extern "C" fn vein_sym_acquire(obj: *mut c_void) -> i32 {
    let Some(obj) = object(obj) else {
        return status::INVALID_OBJECT;
    };
    SYM.with(|sym| sym.borrow().acquire(context(), obj));
    status::OK
}

/// Drop one external reference.
///
/// # Safety
/// `obj` must be null or a live object, and the caller must own the
/// reference it drops.
#[no_mangle]
pub unsafe extern "C" fn vein_sym_release(obj: *mut c_void) -> i32 {
    let Some(obj) = object(obj) else {
        return status::INVALID_OBJECT;
    };
    SYM.with(|sym| to_status(sym.borrow_mut().release(context(), obj)))
}

/// Store `target` (possibly null) into field `index` of `obj`.
///
/// # Safety
/// As [`vein_set_field`].
#[no_mangle]
pub unsafe extern "C" fn vein_sym_link(obj: *mut c_void, index: u32, target: *mut c_void) -> i32 {
    let Some(obj) = object(obj) else {
        return status::INVALID_OBJECT;
    };
    SYM.with(|sym| to_status(sym.borrow().link(context(), obj, index, object(target))))
}

// ============================================================================
// Slot Pool and Handles
// ============================================================================

/// Allocate a registered type in the slot pool, addressable by handles.
///
/// A nonzero `shared` gives the object atomic counts. A nonzero `symmetric`
/// makes it a symmetric RC object owned by the innermost scope on this
/// thread; null is returned when no scope is open.
#[no_mangle]
pub extern "C" fn vein_slot_pool_alloc(tag: u32, shared: i32, symmetric: i32) -> *mut c_void {
    let ctx = context();
    let result = if symmetric != 0 {
        SYM.with(|sym| {
            let builder = ctx.builder(tag)?.shared(shared != 0);
            sym.borrow_mut().alloc_with(ctx, builder)
        })
    } else {
        ctx.alloc_slot(tag, shared != 0)
    };
    to_ptr(result, "vein_slot_pool_alloc")
}

/// Free a slot-pool object and what only it kept alive. Every handle to it
/// becomes invalid. A second free returns `INVALID_HANDLE`.
///
/// # Safety
/// `obj` must be null or a pointer returned by a slot-pool allocation.
#[no_mangle]
pub unsafe extern "C" fn vein_slot_pool_free(obj: *mut c_void) -> i32 {
    let Some(obj) = object(obj) else {
        return status::INVALID_OBJECT;
    };
    let ctx = context();
    match ctx.slots().slot_of(obj.addr()) {
        Some(slot) if slot.is_in_use() => to_status(asap::free_tree(ctx, obj)),
        Some(_) => status::INVALID_HANDLE,
        None => status::INVALID_OBJECT,
    }
}

/// Handle for a slot-pool object, or 0 if `obj` is not one.
///
/// # Safety
/// `obj` must be null or a live object.
#[no_mangle]
pub unsafe extern "C" fn vein_make_handle(obj: *mut c_void) -> u64 {
    let Some(obj) = object(obj) else {
        return Handle::NULL.into_raw();
    };
    match context().make_handle(obj) {
        Ok(handle) => handle.into_raw(),
        Err(err) => {
            warn!(%err, "make_handle refused");
            Handle::NULL.into_raw()
        }
    }
}

/// 1 if the handle still names its object, otherwise 0.
#[no_mangle]
pub extern "C" fn vein_handle_is_valid(handle: u64) -> i32 {
    context().handle_is_valid(Handle::from_raw(handle)) as i32
}

/// The object behind a valid handle, or null.
#[no_mangle]
pub extern "C" fn vein_handle_deref(handle: u64) -> *mut c_void {
    context()
        .handle_deref(Handle::from_raw(handle))
        .map_or(ptr::null_mut(), |obj| obj.as_ptr().cast())
}

// ============================================================================
// Export Table
// ============================================================================

macro_rules! export_table {
    ($($variant:ident => $func:ident,)*) => {
        /// Address of the export implementing `f`.
        pub fn export_address(f: RuntimeFn) -> usize {
            match f {
                $(RuntimeFn::$variant => $func as usize,)*
            }
        }

        /// Name of the export implementing `f`; always its linker symbol.
        pub fn export_name(f: RuntimeFn) -> &'static str {
            match f {
                $(RuntimeFn::$variant => stringify!($func),)*
            }
        }
    };
}

export_table! {
    RuntimeInit => vein_runtime_init,
    Alloc => vein_alloc,
    RegisterType => vein_register_type,
    SetField => vein_set_field,
    FreeTree => vein_free_tree,
    IncRef => vein_inc_ref,
    DecRef => vein_dec_ref,
    SafePoint => vein_safe_point,
    SccFreeze => vein_scc_freeze,
    SccRelease => vein_scc_release,
    ArenaCreate => vein_arena_create,
    ArenaAlloc => vein_arena_alloc,
    ArenaRegisterExternal => vein_arena_register_external,
    ArenaResolveExternal => vein_arena_resolve_external,
    ArenaDestroy => vein_arena_destroy,
    SymEnterScope => vein_sym_enter_scope,
    SymExitScope => vein_sym_exit_scope,
    SymAlloc => vein_sym_alloc,
    SymAcquire => vein_sym_acquire,
    SymRelease => vein_sym_release,
    SymLink => vein_sym_link,
    SlotPoolAlloc => vein_slot_pool_alloc,
    SlotPoolFree => vein_slot_pool_free,
    MakeHandle => vein_make_handle,
    HandleIsValid => vein_handle_is_valid,
    HandleDeref => vein_handle_deref,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    // Tests share the process-wide context, so each uses its own type tags.

    #[test]
    fn test_exports_match_abi_symbols() {
        let mut addresses = HashSet::new();
        for &f in RuntimeFn::ALL {
            assert_eq!(export_name(f), f.symbol());
            assert!(addresses.insert(export_address(f)), "{f:?} shares an address");
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        assert_eq!(vein_runtime_init(), status::OK);
        assert_eq!(vein_runtime_init(), status::OK);
    }

    #[test]
    fn test_rc_through_abi() {
        assert_eq!(vein_register_type(9001, 1, 0), status::OK);
        let parent = vein_alloc(9001, 0);
        let child = vein_alloc(9001, 1);
        assert!(!parent.is_null() && !child.is_null());
        unsafe {
            assert_eq!(vein_set_field(parent, 0, child), status::OK);
            vein_dec_ref(child);
            assert_eq!((*child.cast::<crate::object::HeapObject>()).ref_count(), 1);
            assert_eq!(vein_set_field(parent, 5, ptr::null_mut()), status::FIELD_OUT_OF_RANGE);
            vein_dec_ref(parent);
        }
        assert!(vein_alloc(9999, 0).is_null());
    }

    #[test]
    fn test_handles_through_abi() {
        vein_register_type(9002, 0, 0);
        let obj = vein_slot_pool_alloc(9002, 0, 0);
        unsafe {
            let handle = vein_make_handle(obj);
            assert_ne!(handle, 0);
            assert_eq!(vein_handle_is_valid(handle), 1);
            assert_eq!(vein_handle_deref(handle), obj);

            assert_eq!(vein_slot_pool_free(obj), status::OK);
            assert_eq!(vein_handle_is_valid(handle), 0);
            assert!(vein_handle_deref(handle).is_null());
            assert_eq!(vein_slot_pool_free(obj), status::INVALID_HANDLE);
        }
    }

    #[test]
    fn test_slot_pool_alloc_honors_flags() {
        vein_register_type(9005, 1, 0);
        let shared = vein_slot_pool_alloc(9005, 1, 0);
        let local = vein_slot_pool_alloc(9005, 0, 0);
        unsafe {
            let shared_obj = &*shared.cast::<crate::object::HeapObject>();
            assert!(shared_obj.is_shared());
            assert!(!shared_obj.is_symmetric());
            assert!(!(*local.cast::<crate::object::HeapObject>()).is_shared());
            assert_eq!(vein_slot_pool_free(shared), status::OK);
            assert_eq!(vein_slot_pool_free(local), status::OK);
        }

        assert!(vein_slot_pool_alloc(9005, 0, 1).is_null());
        vein_sym_enter_scope();
        let a = vein_slot_pool_alloc(9005, 0, 1);
        let b = vein_slot_pool_alloc(9005, 0, 1);
        assert!(!a.is_null() && !b.is_null());
        unsafe {
            assert!((*a.cast::<crate::object::HeapObject>()).is_symmetric());
            assert_eq!(vein_sym_link(a, 0, b), status::OK);
            assert_eq!(vein_sym_link(b, 0, a), status::OK);
        }
        let handle = unsafe { vein_make_handle(a) };
        assert_eq!(vein_handle_is_valid(handle), 1);
        assert_eq!(vein_sym_exit_scope(), status::OK);
        assert_eq!(vein_handle_is_valid(handle), 0);
    }

    #[test]
    fn test_arena_destroy_deferred_through_abi() {
        vein_register_type(9003, 1, 0);
        let arena = vein_arena_create();
        unsafe {
            let obj = vein_arena_alloc(arena, 9003);
            assert!(!obj.is_null());
            assert_eq!(vein_arena_register_external(arena, obj), status::OK);
            assert_eq!(vein_arena_destroy(arena), status::DEFERRED);
            assert_eq!(vein_arena_resolve_external(arena, obj), status::OK);
        }
    }

    #[test]
    fn test_symmetric_scope_through_abi() {
        vein_register_type(9004, 1, 0);
        assert!(vein_sym_alloc(9004).is_null());
        assert_eq!(vein_sym_exit_scope(), status::NO_SCOPE);

        vein_sym_enter_scope();
        let a = vein_sym_alloc(9004);
        let b = vein_sym_alloc(9004);
        unsafe {
            assert_eq!(vein_sym_link(a, 0, b), status::OK);
            assert_eq!(vein_sym_link(b, 0, a), status::OK);
        }
        let handle = unsafe { vein_make_handle(a) };
        assert_eq!(vein_sym_exit_scope(), status::OK);
        assert_eq!(vein_handle_is_valid(handle), 0);
    }
}
