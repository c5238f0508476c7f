//! # Heap Objects
//!
//! Every value managed by the runtime is a [`HeapObject`]: a type tag, a
//! payload and the bookkeeping fields all five engines share.
//!
//! ## Bookkeeping
//!
//! | Field | Used by |
//! |-------|---------|
//! | `rc` | RC (strong count), Symmetric RC (external count) |
//! | `internal` | Symmetric RC (object-to-object references) |
//! | `scc` | SCC membership, `0` when none |
//! | `state` | every engine: `LIVE` or `RELEASING` |
//! | `generation` | generation of the backing storage at allocation |
//! | `arena` | id of the owning arena, `0` when heap-owned |
//! | `frozen` | SCC members refuse field writes |
//!
//! Objects are only ever built through [`ObjectBuilder`], which initializes
//! every field. Engines reach objects through [`ObjPtr`]; dereferencing one
//! is only valid while the object is live, so engine entry points taking
//! pointers are `unsafe fn`.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Runtime type discriminant.
pub type TypeTag = u32;

/// Generation constants shared by the slot pool and handles.
pub mod generation {
    /// First generation of fresh storage. Zero is never used.
    pub const FIRST: u32 = 1;

    /// Storage whose generation reaches this value is retired.
    ///
    /// Handle tags carry the generation modulo 2^16, so generations stay
    /// strictly below it.
    pub const OVERFLOW_GUARD: u32 = u16::MAX as u32;
}

/// Lifecycle phase.
pub mod state {
    /// Reachable and usable.
    pub const LIVE: u8 = 0;
    /// Marked by the first phase of a teardown. No further access.
    pub const RELEASING: u8 = 1;
}

/// Where an object's storage came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Boxed on the general heap.
    Heap,
    /// A slot of the slot pool; addressable through handles.
    Slot,
    /// Bump-allocated inside an arena chunk.
    Arena,
}

// ============================================================================
// Fields
// ============================================================================

/// A reference field.
#[derive(Debug)]
pub struct Field {
    target: AtomicPtr<HeapObject>,
    weak: bool,
}

impl Field {
    /// Create an empty field.
    pub fn new(weak: bool) -> Self {
        Self {
            target: AtomicPtr::new(ptr::null_mut()),
            weak,
        }
    }

    /// Whether the field is non-owning.
    pub fn is_weak(&self) -> bool {
        self.weak
    }

    /// Current target.
    pub fn get(&self) -> Option<ObjPtr> {
        ObjPtr::new(self.target.load(Ordering::Acquire))
    }

    /// Replace the target and return the previous one. No counts change.
    pub(crate) fn swap(&self, target: Option<ObjPtr>) -> Option<ObjPtr> {
        let new = target.map_or(ptr::null_mut(), ObjPtr::as_ptr);
        ObjPtr::new(self.target.swap(new, Ordering::AcqRel))
    }

    /// Null the field and return what it held.
    pub(crate) fn take(&self) -> Option<ObjPtr> {
        self.swap(None)
    }

    /// Null the field only if it still points at `target`.
    pub(crate) fn clear_if(&self, target: ObjPtr) {
        let _ = self.target.compare_exchange(
            target.as_ptr(),
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Field storage, either boxed or carved from an arena chunk.
pub struct FieldArray {
    ptr: NonNull<Field>,
    len: usize,
    owned: bool,
}

impl FieldArray {
    /// No fields.
    pub fn empty() -> Self {
        Self::boxed(Box::new([]))
    }

    /// Take ownership of boxed fields.
    pub fn boxed(fields: Box<[Field]>) -> Self {
        let len = fields.len();
        let raw = Box::into_raw(fields) as *mut Field;
        Self {
            // Safety: Box::into_raw never returns null.
            ptr: unsafe { NonNull::new_unchecked(raw) },
            len,
            owned: true,
        }
    }

    /// Borrow fields placed in memory the caller owns.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` initialized fields that outlive the array.
    pub(crate) unsafe fn borrowed(ptr: NonNull<Field>, len: usize) -> Self {
        Self {
            ptr,
            len,
            owned: false,
        }
    }

    /// The fields as a slice.
    pub fn as_slice(&self) -> &[Field] {
        // Safety: ptr/len describe initialized fields for the array's life.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for FieldArray {
    fn drop(&mut self) {
        if self.owned {
            // Safety: built by `boxed` from a Box<[Field]> of this length.
            unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                    self.ptr.as_ptr(),
                    self.len,
                )));
            }
        }
    }
}

impl fmt::Debug for FieldArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

// Safety: fields are atomics; ownership of the storage follows the object.
unsafe impl Send for FieldArray {}
unsafe impl Sync for FieldArray {}

/// Object contents.
#[derive(Debug)]
pub enum Payload {
    /// Integer scalar.
    Int(i64),
    /// Float scalar.
    Float(f64),
    /// Record of reference fields.
    Record(FieldArray),
}

// ============================================================================
// Heap Object
// ============================================================================

/// A runtime-managed value.
#[derive(Debug)]
pub struct HeapObject {
    tag: TypeTag,
    origin: Origin,
    shared: bool,
    symmetric: bool,
    arena: u64,
    generation: u32,
    pub(crate) rc: AtomicU32,
    pub(crate) internal: AtomicU32,
    pub(crate) scc: AtomicU64,
    pub(crate) state: AtomicU8,
    pub(crate) frozen: AtomicBool,
    payload: Payload,
}

impl HeapObject {
    /// Type tag.
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// Storage origin.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Whether counts use atomic read-modify-write.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Whether the object is managed by symmetric RC.
    pub fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    /// Owning arena id, if any.
    pub fn arena_id(&self) -> Option<u64> {
        (self.arena != 0).then_some(self.arena)
    }

    /// Generation of the storage when the object was placed in it.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Strong count, or external count for symmetric objects.
    pub fn ref_count(&self) -> u32 {
        self.rc.load(Ordering::Acquire)
    }

    /// References from other objects' fields (symmetric objects only).
    pub fn internal_count(&self) -> u32 {
        self.internal.load(Ordering::Acquire)
    }

    /// Raw SCC id, `0` when not a member.
    pub fn scc_id(&self) -> u64 {
        self.scc.load(Ordering::Acquire)
    }

    /// Whether field writes are refused.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Whether a teardown has started.
    pub fn is_releasing(&self) -> bool {
        self.state.load(Ordering::Acquire) == state::RELEASING
    }

    /// Contents.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Reference fields; empty for scalars.
    pub fn fields(&self) -> &[Field] {
        match &self.payload {
            Payload::Record(fields) => fields.as_slice(),
            Payload::Int(_) | Payload::Float(_) => &[],
        }
    }

    /// Targets of the strong fields.
    pub fn strong_children(&self) -> impl Iterator<Item = ObjPtr> + '_ {
        self.fields()
            .iter()
            .filter(|f| !f.is_weak())
            .filter_map(Field::get)
    }

    pub(crate) fn mark_releasing(&self) {
        self.state.store(state::RELEASING, Ordering::Release);
    }

    pub(crate) fn set_generation(&mut self, generation: u32) {
        self.generation = generation;
    }
}

/// Builds a [`HeapObject`] with every bookkeeping field initialized.
#[derive(Debug)]
pub struct ObjectBuilder {
    tag: TypeTag,
    origin: Origin,
    shared: bool,
    symmetric: bool,
    arena: u64,
    payload: Payload,
}

impl ObjectBuilder {
    /// Start an object of the given tag with no fields.
    pub fn new(tag: TypeTag) -> Self {
        Self {
            tag,
            origin: Origin::Heap,
            shared: false,
            symmetric: false,
            arena: 0,
            payload: Payload::Record(FieldArray::empty()),
        }
    }

    /// Record with one field per entry; `true` marks a weak field.
    pub fn fields(mut self, weak: &[bool]) -> Self {
        let fields: Box<[Field]> = weak.iter().map(|&w| Field::new(w)).collect();
        self.payload = Payload::Record(FieldArray::boxed(fields));
        self
    }

    /// Integer scalar payload.
    pub fn int(mut self, value: i64) -> Self {
        self.payload = Payload::Int(value);
        self
    }

    /// Float scalar payload.
    pub fn float(mut self, value: f64) -> Self {
        self.payload = Payload::Float(value);
        self
    }

    /// Use atomic counts.
    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    /// Manage with symmetric RC.
    pub fn symmetric(mut self, symmetric: bool) -> Self {
        self.symmetric = symmetric;
        self
    }

    pub(crate) fn origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub(crate) fn in_arena(mut self, arena: u64, fields: FieldArray) -> Self {
        self.origin = Origin::Arena;
        self.arena = arena;
        self.payload = Payload::Record(fields);
        self
    }

    /// Finish with a count of one.
    pub fn build(self) -> HeapObject {
        HeapObject {
            tag: self.tag,
            origin: self.origin,
            shared: self.shared,
            symmetric: self.symmetric,
            arena: self.arena,
            generation: generation::FIRST,
            rc: AtomicU32::new(1),
            internal: AtomicU32::new(0),
            scc: AtomicU64::new(0),
            state: AtomicU8::new(state::LIVE),
            frozen: AtomicBool::new(false),
            payload: self.payload,
        }
    }
}

// ============================================================================
// Object Pointers
// ============================================================================

/// Non-null pointer to a heap object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjPtr(NonNull<HeapObject>);

// Safety: ObjPtr is an address. Dereferencing it is unsafe and the
// object's strategy synchronizes access.
unsafe impl Send for ObjPtr {}
unsafe impl Sync for ObjPtr {}

impl ObjPtr {
    /// Wrap a raw pointer; `None` for null.
    pub fn new(ptr: *mut HeapObject) -> Option<Self> {
        NonNull::new(ptr).map(ObjPtr)
    }

    /// Leak a boxed object into a pointer.
    pub(crate) fn from_box(object: Box<HeapObject>) -> Self {
        ObjPtr(NonNull::from(Box::leak(object)))
    }

    /// Raw pointer.
    pub fn as_ptr(self) -> *mut HeapObject {
        self.0.as_ptr()
    }

    /// Address as an integer.
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Borrow the object.
    ///
    /// # Safety
    ///
    /// The object must be live for the returned lifetime.
    pub unsafe fn get<'a>(self) -> &'a HeapObject {
        &*self.0.as_ptr()
    }
}

impl fmt::Debug for ObjPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjPtr({:#x})", self.addr())
    }
}
