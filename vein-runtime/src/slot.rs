//! # Slot Pool
//!
//! Stable storage for objects that may be reached through handles.
//!
//! A slot holds an object, a generation and an in-use flag. Slot memory is
//! never returned to the allocator while the pool lives, so reading a slot's
//! generation is always safe, even after its object was freed. That is what
//! lets a handle check validity without touching freed program memory.
//!
//! ## Layout
//!
//! ```text
//! directory: [chunk0 | chunk1 | chunk2 | ... ]   (fixed array of atomics)
//!              256     512      1024             (geometric growth)
//! ```
//!
//! The object sits at offset 0 of its slot, so an object pointer and its
//! slot address are the same.
//!
//! ## Generations
//!
//! The generation advances when a slot is allocated and again when it is
//! freed. It starts at [`generation::FIRST`] and never wraps: a slot that
//! would reach [`generation::OVERFLOW_GUARD`] is retired instead of being
//! returned to the free list.

use std::cell::UnsafeCell;
use std::mem::{size_of, MaybeUninit};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::SlotPoolConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::object::{generation, HeapObject, ObjPtr};

/// Maximum number of chunks in the directory.
pub const MAX_CHUNKS: usize = 32;

/// One cell of the pool.
#[repr(C)]
pub struct Slot {
    object: UnsafeCell<MaybeUninit<HeapObject>>,
    generation: AtomicU32,
    in_use: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            object: UnsafeCell::new(MaybeUninit::uninit()),
            generation: AtomicU32::new(generation::FIRST),
            in_use: AtomicBool::new(false),
        }
    }

    /// Current generation.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether the slot holds a live object.
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    fn object_ptr(&self) -> *mut HeapObject {
        self.object.get().cast()
    }
}

#[derive(Debug, Default)]
struct FreeList {
    slots: Vec<usize>,
    capacity: usize,
    retired: usize,
}

/// Chunked pool of slots.
pub struct SlotPool {
    chunks: [AtomicPtr<Slot>; MAX_CHUNKS],
    lens: [AtomicUsize; MAX_CHUNKS],
    chunk_count: AtomicUsize,
    free: Mutex<FreeList>,
    live: AtomicUsize,
    initial: usize,
    max: usize,
}

impl SlotPool {
    /// Create an empty pool. Chunks are added on demand.
    pub fn new(config: &SlotPoolConfig) -> Self {
        Self {
            chunks: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            lens: std::array::from_fn(|_| AtomicUsize::new(0)),
            chunk_count: AtomicUsize::new(0),
            free: Mutex::new(FreeList::default()),
            live: AtomicUsize::new(0),
            initial: config.initial_slots.max(1),
            max: config.max_slots,
        }
    }

    /// Place an object in a free slot.
    pub fn alloc(&self, mut object: HeapObject) -> RuntimeResult<ObjPtr> {
        let addr = {
            let mut free = self.free.lock();
            if free.slots.is_empty() {
                self.grow(&mut free)?;
            }
            free.slots.pop().ok_or(RuntimeError::PoolExhausted {
                capacity: self.max,
            })?
        };

        // Safety: addresses on the free list are slots of a live chunk.
        let slot = unsafe { &*(addr as *const Slot) };
        let gen = slot.generation.load(Ordering::Relaxed) + 1;
        object.set_generation(gen);
        // Safety: the slot is off the free list, so nothing else writes it.
        unsafe { (*slot.object.get()).write(object) };
        slot.generation.store(gen, Ordering::Release);
        slot.in_use.store(true, Ordering::Release);
        self.live.fetch_add(1, Ordering::Relaxed);

        ObjPtr::new(slot.object_ptr()).ok_or(RuntimeError::AddressOutOfRange { address: addr })
    }

    /// Drop the object in a slot and advance the slot's generation.
    ///
    /// # Safety
    ///
    /// No reference to the object may be used after this call.
    pub unsafe fn free(&self, obj: ObjPtr) -> RuntimeResult<()> {
        let slot = self
            .slot_of(obj.addr())
            .ok_or(RuntimeError::AddressOutOfRange { address: obj.addr() })?;
        if !slot.in_use.swap(false, Ordering::AcqRel) {
            return Err(RuntimeError::InvalidHandle);
        }
        let gen = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
        ptr::drop_in_place(slot.object_ptr());
        self.live.fetch_sub(1, Ordering::Relaxed);

        let mut free = self.free.lock();
        // The next allocation and free must both stay below the guard.
        if gen + 2 >= generation::OVERFLOW_GUARD {
            free.retired += 1;
            trace!(addr = obj.addr(), gen, "slot retired");
        } else {
            free.slots.push(obj.addr());
        }
        Ok(())
    }

    /// The slot at `addr`, if the address is a slot of this pool.
    ///
    /// Lock-free: reads only the chunk directory.
    pub fn slot_of(&self, addr: usize) -> Option<&Slot> {
        let size = size_of::<Slot>();
        let count = self.chunk_count.load(Ordering::Acquire);
        for i in 0..count {
            let base = self.chunks[i].load(Ordering::Acquire) as usize;
            let len = self.lens[i].load(Ordering::Acquire);
            if addr >= base && addr < base + len * size && (addr - base) % size == 0 {
                // Safety: in range and aligned to a slot of a live chunk.
                return Some(unsafe { &*(addr as *const Slot) });
            }
        }
        None
    }

    /// Whether `obj` lives in this pool.
    pub fn contains(&self, obj: ObjPtr) -> bool {
        self.slot_of(obj.addr()).is_some()
    }

    /// Slots in use.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Slots allocated so far across all chunks.
    pub fn capacity(&self) -> usize {
        self.free.lock().capacity
    }

    /// Slots retired by the overflow guard.
    pub fn retired(&self) -> usize {
        self.free.lock().retired
    }

    /// Chunks in the directory.
    pub fn chunk_count(&self) -> usize {
        self.chunk_count.load(Ordering::Acquire)
    }

    fn grow(&self, free: &mut FreeList) -> RuntimeResult<()> {
        let index = self.chunk_count.load(Ordering::Acquire);
        if index >= MAX_CHUNKS || free.capacity >= self.max {
            return Err(RuntimeError::PoolExhausted { capacity: self.max });
        }

        let wanted = self.initial.checked_shl(index as u32).unwrap_or(usize::MAX);
        let len = wanted.min(self.max - free.capacity);
        let chunk: Box<[Slot]> = (0..len).map(|_| Slot::new()).collect();
        let base = Box::into_raw(chunk) as *mut Slot;

        self.lens[index].store(len, Ordering::Release);
        self.chunks[index].store(base, Ordering::Release);
        self.chunk_count.store(index + 1, Ordering::Release);

        let size = size_of::<Slot>();
        free.slots
            .extend((0..len).rev().map(|i| base as usize + i * size));
        free.capacity += len;

        debug!(chunk = index, slots = len, capacity = free.capacity, "slot pool grew");
        Ok(())
    }
}

impl Drop for SlotPool {
    fn drop(&mut self) {
        let count = *self.chunk_count.get_mut();
        for i in 0..count {
            let base = *self.chunks[i].get_mut();
            let len = *self.lens[i].get_mut();
            // Safety: base/len came from Box::into_raw in `grow`, and the pool
            // is being dropped so no other reference exists.
            unsafe {
                let chunk = Box::from_raw(ptr::slice_from_raw_parts_mut(base, len));
                for slot in chunk.iter() {
                    if slot.is_in_use() {
                        ptr::drop_in_place(slot.object_ptr());
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("chunks", &self.chunk_count())
            .field("live", &self.live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectBuilder;

    fn pool(initial: usize, max: usize) -> SlotPool {
        SlotPool::new(&SlotPoolConfig {
            initial_slots: initial,
            max_slots: max,
        })
    }

    #[test]
    fn test_object_sits_at_slot_address() {
        let pool = pool(4, 16);
        let obj = pool.alloc(ObjectBuilder::new(1).build()).unwrap();
        let slot = pool.slot_of(obj.addr()).unwrap();
        assert!(slot.is_in_use());
        assert_eq!(unsafe { obj.get() }.tag(), 1);
        unsafe { pool.free(obj).unwrap() };
    }

    #[test]
    fn test_generation_advances_on_alloc_and_free() {
        let pool = pool(1, 1);
        let obj = pool.alloc(ObjectBuilder::new(0).build()).unwrap();
        let slot = pool.slot_of(obj.addr()).unwrap();
        assert_eq!(slot.generation(), generation::FIRST + 1);
        assert_eq!(unsafe { obj.get() }.generation(), generation::FIRST + 1);

        unsafe { pool.free(obj).unwrap() };
        assert_eq!(slot.generation(), generation::FIRST + 2);
        assert!(!slot.is_in_use());

        let again = pool.alloc(ObjectBuilder::new(0).build()).unwrap();
        assert_eq!(again, obj);
        assert_eq!(slot.generation(), generation::FIRST + 3);
        unsafe { pool.free(again).unwrap() };
    }

    #[test]
    fn test_double_free_rejected() {
        let pool = pool(2, 2);
        let obj = pool.alloc(ObjectBuilder::new(0).build()).unwrap();
        unsafe {
            pool.free(obj).unwrap();
            assert_eq!(pool.free(obj), Err(RuntimeError::InvalidHandle));
        }
    }

    #[test]
    fn test_geometric_growth_and_exhaustion() {
        let pool = pool(2, 6);
        let objs: Vec<_> = (0..6)
            .map(|i| pool.alloc(ObjectBuilder::new(i).build()).unwrap())
            .collect();
        assert_eq!(pool.chunk_count(), 2);
        assert_eq!(pool.capacity(), 6);
        assert_eq!(pool.live(), 6);
        assert_eq!(
            pool.alloc(ObjectBuilder::new(0).build()),
            Err(RuntimeError::PoolExhausted { capacity: 6 })
        );
        for obj in objs {
            unsafe { pool.free(obj).unwrap() };
        }
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_foreign_address_not_in_pool() {
        let pool = pool(4, 4);
        let _obj = pool.alloc(ObjectBuilder::new(0).build()).unwrap();
        let mut outside = ObjectBuilder::new(0).build();
        let foreign = ObjPtr::new(&mut outside).unwrap();
        assert!(!pool.contains(foreign));
        assert!(pool.slot_of(foreign.addr() + 1).is_none());
    }

    #[test]
    fn test_slot_retired_at_guard() {
        let pool = pool(1, 1);
        let mut obj = pool.alloc(ObjectBuilder::new(0).build()).unwrap();
        loop {
            let gen = pool.slot_of(obj.addr()).unwrap().generation();
            unsafe { pool.free(obj).unwrap() };
            if gen + 3 >= generation::OVERFLOW_GUARD {
                break;
            }
            obj = pool.alloc(ObjectBuilder::new(0).build()).unwrap();
        }
        assert_eq!(pool.retired(), 1);
        assert!(pool.alloc(ObjectBuilder::new(0).build()).is_err());
        let slot = pool.slot_of(obj.addr()).unwrap();
        assert!(slot.generation() < generation::OVERFLOW_GUARD);
    }
}
