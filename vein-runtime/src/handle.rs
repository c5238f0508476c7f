//! # Generational Handles
//!
//! A [`Handle`] is one machine word naming a slot-pool object:
//!
//! ```text
//! 63            48 47                                   0
//! ┌──────────────┬──────────────────────────────────────┐
//! │   tag (16)   │        slot address (48)             │
//! └──────────────┴──────────────────────────────────────┘
//! ```
//!
//! The tag is recomputed from the slot's current generation on every check:
//!
//! ```text
//! tag = hi16(mix64(addr ^ secret)) + generation * K   (mod 2^16, K odd)
//! ```
//!
//! For a fixed slot the map from generation to tag is a bijection modulo
//! 2^16, and the slot pool keeps generations below 2^16, so a handle made
//! before a free never validates afterwards, even if the slot is reused
//! immediately. A check reads only slot-pool memory, which is never freed.

use std::fmt;

use tracing::warn;

use crate::error::{RuntimeError, RuntimeResult};
use crate::object::ObjPtr;
use crate::slot::SlotPool;

/// Bits of a handle holding the slot address.
pub const ADDR_BITS: u32 = 48;

const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;

/// Odd multiplier applied to the generation.
const TAG_STEP: u16 = 0x9E37;

/// splitmix64 finalizer.
pub fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Tag for a slot address at a generation.
pub fn compute_tag(addr: usize, generation: u32, secret: u64) -> u16 {
    let base = (mix64(addr as u64 ^ secret) >> 48) as u16;
    base.wrapping_add((generation as u16).wrapping_mul(TAG_STEP))
}

/// Tagged reference to a slot-pool object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle(u64);

impl Handle {
    /// Never valid.
    pub const NULL: Handle = Handle(0);

    /// Rebuild from the raw word.
    pub const fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// The raw word.
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    /// Encoded slot address.
    pub fn addr(self) -> usize {
        (self.0 & ADDR_MASK) as usize
    }

    /// Encoded tag.
    pub fn tag(self) -> u16 {
        (self.0 >> ADDR_BITS) as u16
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x}, tag={:#06x})", self.addr(), self.tag())
    }
}

/// Makes and checks handles against one slot pool.
#[derive(Debug, Clone, Copy)]
pub struct HandleCodec {
    secret: u64,
}

impl HandleCodec {
    /// Codec with a fixed secret.
    pub fn new(secret: u64) -> Self {
        Self { secret }
    }

    /// Codec with a random per-process secret.
    pub fn random() -> Self {
        Self::new(rand::random())
    }

    /// Handle for a live slot-pool object.
    pub fn make(&self, pool: &SlotPool, obj: ObjPtr) -> RuntimeResult<Handle> {
        let addr = obj.addr();
        if addr as u64 & !ADDR_MASK != 0 {
            return Err(RuntimeError::AddressOutOfRange { address: addr });
        }
        let slot = pool
            .slot_of(addr)
            .ok_or(RuntimeError::AddressOutOfRange { address: addr })?;
        if !slot.is_in_use() {
            return Err(RuntimeError::InvalidHandle);
        }
        let tag = compute_tag(addr, slot.generation(), self.secret);
        Ok(Handle(((tag as u64) << ADDR_BITS) | addr as u64))
    }

    /// Whether the handle still names the object it was made for.
    pub fn is_valid(&self, pool: &SlotPool, handle: Handle) -> bool {
        let addr = handle.addr();
        let Some(slot) = pool.slot_of(addr) else {
            return false;
        };
        slot.is_in_use() && compute_tag(addr, slot.generation(), self.secret) == handle.tag()
    }

    /// The object, or `None` whenever [`is_valid`](Self::is_valid) is false.
    pub fn deref(&self, pool: &SlotPool, handle: Handle) -> Option<ObjPtr> {
        if self.is_valid(pool, handle) {
            ObjPtr::new(handle.addr() as *mut _)
        } else {
            None
        }
    }

    /// Like [`deref`](Self::deref), reporting failure as an error.
    pub fn resolve(&self, pool: &SlotPool, handle: Handle) -> RuntimeResult<ObjPtr> {
        self.deref(pool, handle).ok_or_else(|| {
            warn!(?handle, "dereference of invalid handle");
            RuntimeError::InvalidHandle
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlotPoolConfig;
    use crate::object::ObjectBuilder;

    fn pool() -> SlotPool {
        SlotPool::new(&SlotPoolConfig {
            initial_slots: 1,
            max_slots: 4,
        })
    }

    #[test]
    fn test_tag_is_injective_in_generation() {
        let mut seen = std::collections::HashSet::new();
        for gen in 0..=u16::MAX as u32 {
            assert!(seen.insert(compute_tag(0x1000, gen, 42)));
        }
    }

    #[test]
    fn test_handle_roundtrip() {
        let pool = pool();
        let codec = HandleCodec::new(7);
        let obj = pool.alloc(ObjectBuilder::new(3).build()).unwrap();
        let h = codec.make(&pool, obj).unwrap();
        assert_eq!(h.addr(), obj.addr());
        assert!(codec.is_valid(&pool, h));
        assert_eq!(codec.deref(&pool, h), Some(obj));
        assert_eq!(Handle::from_raw(h.into_raw()), h);
        unsafe { pool.free(obj).unwrap() };
    }

    #[test]
    fn test_stale_handle_after_immediate_reuse() {
        let pool = pool();
        let codec = HandleCodec::new(7);
        let obj = pool.alloc(ObjectBuilder::new(3).build()).unwrap();
        let old = codec.make(&pool, obj).unwrap();
        unsafe { pool.free(obj).unwrap() };
        assert!(!codec.is_valid(&pool, old));

        let reused = pool.alloc(ObjectBuilder::new(4).build()).unwrap();
        assert_eq!(reused, obj);
        assert!(!codec.is_valid(&pool, old));
        assert_eq!(codec.deref(&pool, old), None);
        assert_eq!(codec.resolve(&pool, old), Err(RuntimeError::InvalidHandle));
        assert!(codec.is_valid(&pool, codec.make(&pool, reused).unwrap()));
        unsafe { pool.free(reused).unwrap() };
    }

    #[test]
    fn test_foreign_objects_rejected() {
        let pool = pool();
        let codec = HandleCodec::random();
        let mut outside = ObjectBuilder::new(0).build();
        let foreign = ObjPtr::new(&mut outside).unwrap();
        assert!(matches!(
            codec.make(&pool, foreign),
            Err(RuntimeError::AddressOutOfRange { .. })
        ));
        assert!(!codec.is_valid(&pool, Handle::NULL));
    }

    #[test]
    fn test_secret_changes_tags() {
        assert_ne!(compute_tag(0x1000, 2, 1), compute_tag(0x1000, 2, 2));
    }
}
