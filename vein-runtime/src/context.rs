//! # Registry Context
//!
//! All process-level runtime state lives in one explicitly owned
//! [`RegistryContext`]: the type registry, the weak-reference registry, the
//! SCC registry, the slot pool with its handle codec, the deferred decrement
//! queue and statistics. Every engine operation takes the context by
//! reference; the C ABI layer owns the single process-wide instance.
//!
//! Field stores go through [`RegistryContext::set_field`], which keeps
//! counts consistent for every strategy: a strong store takes its own
//! reference to the new target and drops the one held on the old target.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::handle::{Handle, HandleCodec};
use crate::object::{Field, ObjPtr, ObjectBuilder, Origin, TypeTag};
use crate::rc::DeferredDecrements;
use crate::reclaim::Reclaimer;
use crate::scc::SccRegistry;
use crate::slot::SlotPool;

// ============================================================================
// Type Registry
// ============================================================================

/// Field layout of a registered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeLayout {
    /// Number of reference fields.
    pub field_count: u32,
    /// Bit `i` set marks field `i` weak. Fields past 64 are strong.
    pub weak_mask: u64,
}

impl TypeLayout {
    /// Whether field `index` is weak.
    pub fn is_weak(&self, index: u32) -> bool {
        index < 64 && self.weak_mask & (1 << index) != 0
    }

    /// Weak flag per field.
    pub fn weak_flags(&self) -> Vec<bool> {
        (0..self.field_count).map(|i| self.is_weak(i)).collect()
    }
}

// ============================================================================
// Weak Registry
// ============================================================================

/// Weak fields indexed by the object they point at.
///
/// When a target is freed every weak field still pointing at it is nulled,
/// so a weak read never observes freed memory.
#[derive(Debug, Default)]
pub struct WeakRegistry {
    by_target: Mutex<HashMap<usize, Vec<usize>>>,
}

impl WeakRegistry {
    fn register(&self, field: &Field, target: ObjPtr) {
        self.by_target
            .lock()
            .entry(target.addr())
            .or_default()
            .push(field as *const Field as usize);
    }

    fn unregister(&self, field: &Field, target: ObjPtr) {
        let addr = field as *const Field as usize;
        let mut map = self.by_target.lock();
        if let Some(fields) = map.get_mut(&target.addr()) {
            if let Some(pos) = fields.iter().position(|&f| f == addr) {
                fields.swap_remove(pos);
            }
            if fields.is_empty() {
                map.remove(&target.addr());
            }
        }
    }

    /// Null every weak field pointing at `target`. Returns how many.
    fn invalidate(&self, target: ObjPtr) -> usize {
        let fields = self.by_target.lock().remove(&target.addr());
        let Some(fields) = fields else {
            return 0;
        };
        for &field in &fields {
            // Safety: registered fields belong to live objects; an object
            // unregisters its weak fields before it is freed.
            unsafe { (*(field as *const Field)).clear_if(target) };
        }
        fields.len()
    }

    /// Number of objects with weak referrers.
    pub fn tracked_targets(&self) -> usize {
        self.by_target.lock().len()
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Runtime counters.
#[derive(Debug, Default)]
pub struct Stats {
    allocated: AtomicU64,
    freed: AtomicU64,
    sccs_created: AtomicU64,
    sccs_released: AtomicU64,
    arenas_destroyed: AtomicU64,
    deferred_processed: AtomicU64,
    weak_invalidated: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Objects allocated outside arenas.
    pub allocated: u64,
    /// Objects freed outside arenas.
    pub freed: u64,
    /// SCCs frozen.
    pub sccs_created: u64,
    /// SCCs released.
    pub sccs_released: u64,
    /// Arenas destroyed.
    pub arenas_destroyed: u64,
    /// Deferred decrements applied.
    pub deferred_processed: u64,
    /// Weak fields nulled by frees.
    pub weak_invalidated: u64,
}

impl Stats {
    pub(crate) fn record_alloc(&self) {
        self.allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_free(&self) {
        self.freed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_scc(&self, released: bool) {
        let counter = if released {
            &self.sccs_released
        } else {
            &self.sccs_created
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_arena_destroyed(&self) {
        self.arenas_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deferred(&self, n: usize) {
        self.deferred_processed.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allocated: self.allocated.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            sccs_created: self.sccs_created.load(Ordering::Relaxed),
            sccs_released: self.sccs_released.load(Ordering::Relaxed),
            arenas_destroyed: self.arenas_destroyed.load(Ordering::Relaxed),
            deferred_processed: self.deferred_processed.load(Ordering::Relaxed),
            weak_invalidated: self.weak_invalidated.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Objects allocated and not yet freed.
    pub fn live(&self) -> u64 {
        self.allocated - self.freed
    }
}

// ============================================================================
// Context
// ============================================================================

/// Runtime state shared by every engine.
#[derive(Debug)]
pub struct RegistryContext {
    config: RuntimeConfig,
    types: RwLock<HashMap<TypeTag, TypeLayout>>,
    weak: WeakRegistry,
    pub(crate) sccs: SccRegistry,
    slots: SlotPool,
    handles: HandleCodec,
    pub(crate) deferred: DeferredDecrements,
    stats: Stats,
}

impl RegistryContext {
    /// Create a context from a configuration.
    pub fn new(config: RuntimeConfig) -> Self {
        let handles = match config.handle.secret {
            Some(secret) => HandleCodec::new(secret),
            None => HandleCodec::random(),
        };
        Self {
            types: RwLock::new(HashMap::new()),
            weak: WeakRegistry::default(),
            sccs: SccRegistry::new(config.scc.capacity),
            slots: SlotPool::new(&config.slots),
            handles,
            deferred: DeferredDecrements::new(&config.deferred),
            stats: Stats::default(),
            config,
        }
    }

    /// The configuration this context was built from.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &Stats {
        &self.stats
    }

    /// The slot pool.
    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }

    /// The SCC registry.
    pub fn sccs(&self) -> &SccRegistry {
        &self.sccs
    }

    /// The weak-reference registry.
    pub fn weak_refs(&self) -> &WeakRegistry {
        &self.weak
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    /// Register or replace the layout of a type tag.
    pub fn register_type(&self, tag: TypeTag, field_count: u32, weak_mask: u64) {
        self.types.write().insert(
            tag,
            TypeLayout {
                field_count,
                weak_mask,
            },
        );
    }

    /// Layout of a registered tag.
    pub fn layout(&self, tag: TypeTag) -> RuntimeResult<TypeLayout> {
        self.types
            .read()
            .get(&tag)
            .copied()
            .ok_or(RuntimeError::UnknownType { tag })
    }

    /// Builder pre-filled with a registered layout.
    pub fn builder(&self, tag: TypeTag) -> RuntimeResult<ObjectBuilder> {
        let layout = self.layout(tag)?;
        Ok(ObjectBuilder::new(tag).fields(&layout.weak_flags()))
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate a registered type on the general heap.
    pub fn alloc(&self, tag: TypeTag, shared: bool) -> RuntimeResult<ObjPtr> {
        let builder = self.builder(tag)?.shared(shared);
        Ok(self.alloc_with(builder))
    }

    /// Allocate a custom object on the general heap.
    pub fn alloc_with(&self, builder: ObjectBuilder) -> ObjPtr {
        let obj = ObjPtr::from_box(Box::new(builder.origin(Origin::Heap).build()));
        self.stats.record_alloc();
        obj
    }

    /// Allocate a registered type in the slot pool.
    pub fn alloc_slot(&self, tag: TypeTag, shared: bool) -> RuntimeResult<ObjPtr> {
        let builder = self.builder(tag)?.shared(shared);
        self.alloc_slot_with(builder)
    }

    /// Allocate a custom object in the slot pool.
    pub fn alloc_slot_with(&self, builder: ObjectBuilder) -> RuntimeResult<ObjPtr> {
        let obj = self.slots.alloc(builder.origin(Origin::Slot).build())?;
        self.stats.record_alloc();
        Ok(obj)
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    /// Handle for a live slot-pool object.
    pub fn make_handle(&self, obj: ObjPtr) -> RuntimeResult<Handle> {
        self.handles.make(&self.slots, obj)
    }

    /// Whether a handle still names its object.
    pub fn handle_is_valid(&self, handle: Handle) -> bool {
        self.handles.is_valid(&self.slots, handle)
    }

    /// The object behind a valid handle.
    pub fn handle_deref(&self, handle: Handle) -> Option<ObjPtr> {
        self.handles.deref(&self.slots, handle)
    }

    /// The object behind a handle, or `InvalidHandle`.
    pub fn resolve_handle(&self, handle: Handle) -> RuntimeResult<ObjPtr> {
        self.handles.resolve(&self.slots, handle)
    }

    // ------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------

    /// Store `target` into field `index` of `obj`.
    ///
    /// Strong stores acquire the new target and release the old one; weak
    /// stores only update the weak registry. Arena objects may only point
    /// into their own arena and are never counted.
    ///
    /// # Safety
    ///
    /// `obj` and `target` must be live.
    pub unsafe fn set_field(
        &self,
        obj: ObjPtr,
        index: u32,
        target: Option<ObjPtr>,
    ) -> RuntimeResult<()> {
        let o = obj.get();
        if o.is_releasing() {
            return Err(RuntimeError::ObjectReleasing);
        }
        if o.is_frozen() {
            return Err(RuntimeError::FrozenObject);
        }
        let fields = o.fields();
        let field = fields
            .get(index as usize)
            .ok_or(RuntimeError::FieldOutOfRange {
                index,
                count: fields.len() as u32,
            })?;

        if let Some(t) = target {
            let t_ref = t.get();
            if t_ref.is_releasing() {
                return Err(RuntimeError::ObjectReleasing);
            }
            let crosses = o.arena_id() != t_ref.arena_id();
            if crosses && (o.arena_id().is_some() || t_ref.arena_id().is_some()) {
                return Err(RuntimeError::CrossArenaReference);
            }
        }

        if o.arena_id().is_some() {
            field.swap(target);
            return Ok(());
        }

        if field.is_weak() {
            if let Some(old) = field.swap(target) {
                self.weak.unregister(field, old);
            }
            if let Some(new) = target {
                self.weak.register(field, new);
            }
            return Ok(());
        }

        let mut reclaimer = Reclaimer::new(self);
        if let Some(new) = target {
            reclaimer.acquire_edge(new);
        }
        if let Some(old) = field.swap(target) {
            reclaimer.drop_edge(old);
        }
        reclaimer.run()?;
        Ok(())
    }

    /// Free one object's storage.
    ///
    /// Weak fields pointing at the object are nulled and its own weak fields
    /// are unregistered. Strong fields must already be released.
    ///
    /// # Safety
    ///
    /// `obj` must be live and unreachable through strong references.
    pub(crate) unsafe fn free_object(&self, obj: ObjPtr) -> RuntimeResult<()> {
        let o = obj.get();
        let nulled = self.weak.invalidate(obj);
        if nulled > 0 {
            self.stats
                .weak_invalidated
                .fetch_add(nulled as u64, Ordering::Relaxed);
        }
        for field in o.fields().iter().filter(|f| f.is_weak()) {
            if let Some(target) = field.take() {
                self.weak.unregister(field, target);
            }
        }

        trace!(?obj, tag = o.tag(), origin = ?o.origin(), "free");
        match o.origin() {
            Origin::Heap => {
                drop(Box::from_raw(obj.as_ptr()));
                self.stats.record_free();
            }
            Origin::Slot => {
                self.slots.free(obj)?;
                self.stats.record_free();
            }
            // Arena storage goes with its chunks.
            Origin::Arena => {}
        }
        Ok(())
    }
}

impl Default for RegistryContext {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}
