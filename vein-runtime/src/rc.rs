//! # Reference Counting
//!
//! Standard RC: [`inc_ref`] when a value is shared, [`dec_ref`] when a
//! reference dies. An object whose count reaches zero is freed and its strong
//! children lose one reference each, through an explicit worklist. Weak
//! fields are never followed.
//!
//! Objects proven to cross threads use atomic read-modify-write on their
//! count; thread-local objects use plain loads and stores. Decrements on SCC
//! members go to the SCC's shared count.
//!
//! ## Deferred Decrements
//!
//! [`DeferredDecrements`] batches decrements and applies at most `k` of them
//! per [`safe_point`], bounding the pause of any single safe point.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::trace;

use crate::config::DeferredConfig;
use crate::context::RegistryContext;
use crate::error::RuntimeResult;
use crate::object::ObjPtr;
use crate::reclaim::{self, Reclaimer};

/// Take one more reference to `obj`.
///
/// # Safety
///
/// `obj` must be live.
pub unsafe fn inc_ref(ctx: &RegistryContext, obj: ObjPtr) {
    reclaim::acquire(ctx, obj);
}

/// Drop one reference to `obj`. Returns the number of objects freed.
///
/// # Safety
///
/// `obj` must be live and the caller must own the reference it drops.
pub unsafe fn dec_ref(ctx: &RegistryContext, obj: ObjPtr) -> RuntimeResult<usize> {
    let mut reclaimer = Reclaimer::new(ctx);
    reclaimer.drop_ref(obj);
    reclaimer.run()
}

/// Queue a decrement for a later safe point.
///
/// Returns the number of decrements applied by a forced batch when the queue
/// was full, otherwise 0.
///
/// # Safety
///
/// As [`dec_ref`]; the reference stays owned by the queue until processed.
pub unsafe fn defer_dec_ref(ctx: &RegistryContext, obj: ObjPtr) -> RuntimeResult<usize> {
    ctx.deferred.push(ctx, obj)
}

/// Apply up to `k` queued decrements. Returns how many were applied.
pub fn safe_point(ctx: &RegistryContext) -> RuntimeResult<usize> {
    ctx.deferred.process(ctx, ctx.deferred.batch())
}

/// Apply every queued decrement.
pub fn drain_deferred(ctx: &RegistryContext) -> RuntimeResult<usize> {
    let mut total = 0;
    loop {
        let n = ctx.deferred.process(ctx, usize::MAX)?;
        if n == 0 {
            return Ok(total);
        }
        total += n;
    }
}

/// Bounded queue of pending decrements.
#[derive(Debug)]
pub struct DeferredDecrements {
    queue: Mutex<VecDeque<ObjPtr>>,
    enabled: bool,
    batch: usize,
    max_queue: usize,
}

impl DeferredDecrements {
    /// Create a queue from configuration.
    pub fn new(config: &DeferredConfig) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            enabled: config.enabled,
            batch: config.batch.max(1),
            max_queue: config.max_queue.max(1),
        }
    }

    /// Whether the C ABI routes decrements here.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// `k`: decrements applied per safe point.
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Decrements waiting.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    unsafe fn push(&self, ctx: &RegistryContext, obj: ObjPtr) -> RuntimeResult<usize> {
        let full = {
            let mut queue = self.queue.lock();
            queue.push_back(obj);
            queue.len() >= self.max_queue
        };
        if full {
            self.process(ctx, self.batch)
        } else {
            Ok(0)
        }
    }

    fn process(&self, ctx: &RegistryContext, max: usize) -> RuntimeResult<usize> {
        let batch: Vec<ObjPtr> = {
            let mut queue = self.queue.lock();
            let n = queue.len().min(max);
            queue.drain(..n).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let mut reclaimer = Reclaimer::new(ctx);
        for &obj in &batch {
            // Safety: the reference was handed over by `defer_dec_ref`, whose
            // caller guaranteed the object stays live until it is dropped.
            unsafe { reclaimer.drop_ref(obj) };
        }
        // Safety: as above.
        let freed = unsafe { reclaimer.run()? };

        ctx.counters().record_deferred(batch.len());
        trace!(applied = batch.len(), freed, "deferred decrements");
        Ok(batch.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn ctx() -> RegistryContext {
        let config = RuntimeConfig::builder()
            .deferred_batch(2)
            .deferred_max(4)
            .build()
            .unwrap();
        let ctx = RegistryContext::new(config);
        ctx.register_type(1, 1, 0);
        ctx
    }

    #[test]
    fn test_inc_dec_balance() {
        let ctx = ctx();
        let obj = ctx.alloc(1, false).unwrap();
        unsafe {
            inc_ref(&ctx, obj);
            assert_eq!(obj.get().ref_count(), 2);
            assert_eq!(dec_ref(&ctx, obj).unwrap(), 0);
            assert_eq!(obj.get().ref_count(), 1);
            assert_eq!(dec_ref(&ctx, obj).unwrap(), 1);
        }
        assert_eq!(ctx.stats().live(), 0);
    }

    #[test]
    fn test_free_cascades_through_chain() {
        let ctx = ctx();
        let nodes: Vec<_> = (0..5).map(|_| ctx.alloc(1, false).unwrap()).collect();
        unsafe {
            for pair in nodes.windows(2) {
                ctx.set_field(pair[0], 0, Some(pair[1])).unwrap();
            }
            for &node in &nodes[1..] {
                dec_ref(&ctx, node).unwrap();
            }
            assert_eq!(ctx.stats().live(), 5);
            assert_eq!(dec_ref(&ctx, nodes[0]).unwrap(), 5);
        }
        assert_eq!(ctx.stats().live(), 0);
    }

    #[test]
    fn test_shared_counts_are_atomic() {
        let ctx = ctx();
        let obj = ctx.alloc(1, true).unwrap();
        assert!(unsafe { obj.get() }.is_shared());
        unsafe {
            inc_ref(&ctx, obj);
            dec_ref(&ctx, obj).unwrap();
            assert_eq!(obj.get().ref_count(), 1);
            dec_ref(&ctx, obj).unwrap();
        }
    }

    #[test]
    fn test_safe_point_bounded_by_batch() {
        let ctx = ctx();
        let objs: Vec<_> = (0..3).map(|_| ctx.alloc(1, false).unwrap()).collect();
        unsafe {
            for &obj in &objs {
                defer_dec_ref(&ctx, obj).unwrap();
            }
        }
        assert_eq!(ctx.deferred.pending(), 3);
        assert_eq!(safe_point(&ctx).unwrap(), 2);
        assert_eq!(ctx.deferred.pending(), 1);
        assert_eq!(safe_point(&ctx).unwrap(), 1);
        assert_eq!(safe_point(&ctx).unwrap(), 0);
        assert_eq!(ctx.stats().live(), 0);
        assert_eq!(ctx.stats().deferred_processed, 3);
    }

    #[test]
    fn test_full_queue_forces_batch() {
        let ctx = ctx();
        let objs: Vec<_> = (0..4).map(|_| ctx.alloc(1, false).unwrap()).collect();
        unsafe {
            for &obj in &objs[..3] {
                assert_eq!(defer_dec_ref(&ctx, obj).unwrap(), 0);
            }
            assert_eq!(defer_dec_ref(&ctx, objs[3]).unwrap(), 2);
        }
        // The fourth push hit the limit and applied one batch of two.
        assert_eq!(ctx.deferred.pending(), 2);
        assert_eq!(drain_deferred(&ctx).unwrap(), 2);
        assert_eq!(ctx.stats().live(), 0);
    }
}
