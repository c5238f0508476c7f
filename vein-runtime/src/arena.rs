//! # Region Arenas
//!
//! Objects whose lifetime is bounded by a region are bump-allocated in an
//! [`Arena`] and freed together when the arena is destroyed. Arena objects
//! are never counted: increments and decrements on them are no-ops, and
//! their fields may only point at objects in the same arena.
//!
//! ## Layout
//!
//! Each object is placed in a chunk as a [`HeapObject`] header immediately
//! followed by its fields:
//!
//! ```text
//! ┌──────────────┬─────────┬─────────┬─────┐
//! │  HeapObject  │ field 0 │ field 1 │ ... │
//! └──────────────┴─────────┴─────────┴─────┘
//! ```
//!
//! New chunks are allocated as needed, up to the configured maximum.
//!
//! ## External References
//!
//! A reference to an arena object that must outlive a region boundary is
//! registered with [`Arena::register_external`]. While any remain the arena
//! refuses [`Arena::destroy`]; [`Arena::destroy_when_resolved`] instead marks
//! it pending and the last [`Arena::resolve_external`] completes it.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::config::ArenaConfig;
use crate::context::RegistryContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::object::{Field, FieldArray, HeapObject, ObjPtr, ObjectBuilder, TypeTag};

/// Alignment of every chunk.
const CHUNK_ALIGN: usize = 16;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// A chunk of memory in the arena.
struct Chunk {
    data: NonNull<u8>,
    layout: Layout,
    offset: usize,
}

impl Chunk {
    fn new(capacity: usize) -> Option<Self> {
        let layout = Layout::from_size_align(capacity, CHUNK_ALIGN).ok()?;
        // Safety: capacity is never zero.
        let data = NonNull::new(unsafe { alloc(layout) })
            .unwrap_or_else(|| handle_alloc_error(layout));
        Some(Self {
            data,
            layout,
            offset: 0,
        })
    }

    fn try_alloc(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let aligned = (self.offset + layout.align() - 1) & !(layout.align() - 1);
        let end = aligned.checked_add(layout.size())?;
        if end > self.layout.size() {
            return None;
        }
        self.offset = end;
        // Safety: aligned + size is within the chunk.
        Some(unsafe { NonNull::new_unchecked(self.data.as_ptr().add(aligned)) })
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // Safety: allocated with this layout.
        unsafe { dealloc(self.data.as_ptr(), self.layout) }
    }
}

/// Outcome of [`Arena::destroy_when_resolved`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaRelease {
    /// Freed now; the number of chunks released.
    Destroyed {
        /// Chunks released.
        chunks: usize,
    },
    /// External references remain; destruction waits for the last one.
    Deferred {
        /// External references still registered.
        outstanding: u32,
    },
}

/// A region of bump-allocated objects freed together.
pub struct Arena {
    id: u64,
    chunks: RefCell<Vec<Chunk>>,
    chunk_size: usize,
    max_chunks: usize,
    objects: RefCell<Vec<ObjPtr>>,
    externals: RefCell<HashMap<usize, u32>>,
    pending: Cell<bool>,
    destroyed: Cell<bool>,
}

impl Arena {
    /// Create an empty arena. No memory is allocated until the first object.
    pub fn new(config: &ArenaConfig) -> Self {
        Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            chunks: RefCell::new(Vec::new()),
            chunk_size: config.chunk_size.max(1),
            max_chunks: config.max_chunks,
            objects: RefCell::new(Vec::new()),
            externals: RefCell::new(HashMap::new()),
            pending: Cell::new(false),
            destroyed: Cell::new(false),
        }
    }

    /// Process-unique id stored in every object of this arena.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Objects allocated.
    pub fn len(&self) -> usize {
        self.objects.borrow().len()
    }

    /// Whether nothing has been allocated.
    pub fn is_empty(&self) -> bool {
        self.objects.borrow().is_empty()
    }

    /// Chunks currently held.
    pub fn chunk_count(&self) -> usize {
        self.chunks.borrow().len()
    }

    /// External references still registered.
    pub fn outstanding_externals(&self) -> u32 {
        self.externals.borrow().values().sum()
    }

    /// Whether the arena has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    /// Whether destruction is waiting on external references.
    pub fn is_pending(&self) -> bool {
        self.pending.get()
    }

    /// Allocate a registered type.
    pub fn alloc(&self, ctx: &RegistryContext, tag: TypeTag) -> RuntimeResult<ObjPtr> {
        let layout = ctx.layout(tag)?;
        self.alloc_fields(tag, &layout.weak_flags())
    }

    /// Allocate a record with one field per entry of `weak`.
    pub fn alloc_fields(&self, tag: TypeTag, weak: &[bool]) -> RuntimeResult<ObjPtr> {
        if self.destroyed.get() {
            return Err(RuntimeError::ObjectReleasing);
        }
        let exhausted = RuntimeError::ArenaExhausted {
            max_chunks: self.max_chunks,
        };
        let fields = Layout::array::<Field>(weak.len()).map_err(|_| exhausted.clone())?;
        let (layout, fields_offset) = Layout::new::<HeapObject>()
            .extend(fields)
            .map_err(|_| exhausted.clone())?;

        let base = self.alloc_raw(layout).ok_or(exhausted)?;

        // Safety: `base` points to `layout.size()` fresh bytes aligned for
        // HeapObject, and `fields_offset` is aligned for Field.
        unsafe {
            let fields_ptr = base.as_ptr().add(fields_offset).cast::<Field>();
            for (i, &w) in weak.iter().enumerate() {
                fields_ptr.add(i).write(Field::new(w));
            }
            let fields = FieldArray::borrowed(NonNull::new_unchecked(fields_ptr), weak.len());
            let object = ObjectBuilder::new(tag).in_arena(self.id, fields).build();
            let object_ptr = base.as_ptr().cast::<HeapObject>();
            object_ptr.write(object);

            let obj = ObjPtr::new(object_ptr).ok_or(RuntimeError::ArenaExhausted {
                max_chunks: self.max_chunks,
            })?;
            self.objects.borrow_mut().push(obj);
            Ok(obj)
        }
    }

    fn alloc_raw(&self, layout: Layout) -> Option<NonNull<u8>> {
        let mut chunks = self.chunks.borrow_mut();
        if let Some(ptr) = chunks.last_mut().and_then(|c| c.try_alloc(layout)) {
            return Some(ptr);
        }
        if chunks.len() >= self.max_chunks {
            return None;
        }
        let capacity = self.chunk_size.max(layout.size() + layout.align());
        let mut chunk = Chunk::new(capacity)?;
        let ptr = chunk.try_alloc(layout);
        chunks.push(chunk);
        ptr
    }

    /// Record one external reference to `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be live.
    pub unsafe fn register_external(&self, obj: ObjPtr) -> RuntimeResult<()> {
        if obj.get().arena_id() != Some(self.id) {
            return Err(RuntimeError::CrossArenaReference);
        }
        *self.externals.borrow_mut().entry(obj.addr()).or_default() += 1;
        Ok(())
    }

    /// Drop one external reference to `obj`.
    ///
    /// Returns `true` if this was the last reference holding up a pending
    /// destruction and the arena has now been destroyed.
    pub fn resolve_external(&self, ctx: &RegistryContext, obj: ObjPtr) -> RuntimeResult<bool> {
        {
            let mut externals = self.externals.borrow_mut();
            let count = externals
                .get_mut(&obj.addr())
                .ok_or(RuntimeError::UnknownExternal)?;
            *count -= 1;
            if *count == 0 {
                externals.remove(&obj.addr());
            }
        }
        if self.pending.get() && self.outstanding_externals() == 0 {
            self.destroy(ctx)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Free every object and chunk.
    ///
    /// Refused with `ArenaHasExternals` while external references remain.
    /// Returns the number of chunks released.
    pub fn destroy(&self, ctx: &RegistryContext) -> RuntimeResult<usize> {
        let outstanding = self.outstanding_externals();
        if outstanding > 0 {
            warn!(arena = self.id, outstanding, "arena destroy refused");
            return Err(RuntimeError::ArenaHasExternals { outstanding: outstanding as usize });
        }
        if self.destroyed.replace(true) {
            return Ok(0);
        }
        self.pending.set(false);

        let objects = self.release_objects();
        let chunks = std::mem::take(&mut *self.chunks.borrow_mut());
        let released = chunks.len();
        drop(chunks);

        ctx.counters().record_arena_destroyed();
        debug!(arena = self.id, objects, chunks = released, "arena destroyed");
        Ok(released)
    }

    /// Destroy now, or mark pending until the last external reference is
    /// resolved.
    pub fn destroy_when_resolved(&self, ctx: &RegistryContext) -> RuntimeResult<ArenaRelease> {
        let outstanding = self.outstanding_externals();
        if outstanding > 0 {
            self.pending.set(true);
            debug!(arena = self.id, outstanding, "arena destroy deferred");
            return Ok(ArenaRelease::Deferred { outstanding });
        }
        let chunks = self.destroy(ctx)?;
        Ok(ArenaRelease::Destroyed { chunks })
    }

    fn release_objects(&self) -> usize {
        let objects = std::mem::take(&mut *self.objects.borrow_mut());
        for obj in &objects {
            // Safety: every object was written by `alloc_fields` and is
            // dropped exactly once, before its chunk is freed.
            unsafe {
                obj.get().mark_releasing();
                ptr::drop_in_place(obj.as_ptr());
            }
        }
        objects.len()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.destroyed.get() {
            return;
        }
        let outstanding = self.outstanding_externals();
        if outstanding > 0 {
            warn!(arena = self.id, outstanding, "arena dropped with external references; leaking");
            std::mem::forget(std::mem::take(self.chunks.get_mut()));
            return;
        }
        self.release_objects();
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("objects", &self.len())
            .field("chunks", &self.chunk_count())
            .field("outstanding", &self.outstanding_externals())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
