//! Closures over generational handles.
//!
//! A closure does not own its captures. It keeps one [`Handle`] per captured
//! value and checks every handle before the body runs, so a closure that
//! outlives a capture reports the stale capture instead of reading freed
//! memory.

use tracing::warn;

use crate::context::RegistryContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::handle::Handle;
use crate::object::ObjPtr;

/// A body plus handles to the values it captured.
pub struct Closure<F> {
    captures: Vec<Handle>,
    body: F,
}

impl<F, R> Closure<F>
where
    F: Fn(&[ObjPtr]) -> R,
{
    /// Closure over already-issued handles.
    pub fn new(captures: Vec<Handle>, body: F) -> Self {
        Self { captures, body }
    }

    /// Capture slot-pool objects by handle.
    pub fn capture(ctx: &RegistryContext, values: &[ObjPtr], body: F) -> RuntimeResult<Self> {
        let captures = values
            .iter()
            .map(|&v| ctx.make_handle(v))
            .collect::<RuntimeResult<Vec<_>>>()?;
        Ok(Self::new(captures, body))
    }

    /// Handles held by the closure.
    pub fn captures(&self) -> &[Handle] {
        &self.captures
    }

    /// Validate every capture, then run the body on the captured objects.
    pub fn call(&self, ctx: &RegistryContext) -> RuntimeResult<R> {
        let mut values = Vec::with_capacity(self.captures.len());
        for (index, &handle) in self.captures.iter().enumerate() {
            match ctx.handle_deref(handle) {
                Some(obj) => values.push(obj),
                None => {
                    warn!(index, ?handle, "closure capture no longer valid");
                    return Err(RuntimeError::InvalidCapture { index });
                }
            }
        }
        Ok((self.body)(&values))
    }
}

impl<F> std::fmt::Debug for Closure<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closure")
            .field("captures", &self.captures)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectBuilder;
    use crate::rc;

    #[test]
    fn test_call_sees_captures() {
        let ctx = RegistryContext::default();
        let x = ctx.alloc_slot_with(ObjectBuilder::new(1).int(7)).unwrap();
        let closure = Closure::capture(&ctx, &[x], |vals: &[ObjPtr]| vals[0]).unwrap();
        assert_eq!(closure.call(&ctx), Ok(x));
        unsafe { rc::dec_ref(&ctx, x).unwrap() };
    }

    #[test]
    fn test_freed_capture_reported() {
        let ctx = RegistryContext::default();
        let a = ctx.alloc_slot_with(ObjectBuilder::new(1)).unwrap();
        let b = ctx.alloc_slot_with(ObjectBuilder::new(1)).unwrap();
        let closure = Closure::capture(&ctx, &[a, b], |vals: &[ObjPtr]| vals.len()).unwrap();

        unsafe { rc::dec_ref(&ctx, b).unwrap() };
        assert_eq!(closure.call(&ctx), Err(RuntimeError::InvalidCapture { index: 1 }));
        unsafe { rc::dec_ref(&ctx, a).unwrap() };
        assert_eq!(closure.call(&ctx), Err(RuntimeError::InvalidCapture { index: 0 }));
    }

    #[test]
    fn test_heap_objects_cannot_be_captured() {
        let ctx = RegistryContext::default();
        let obj = ctx.alloc_with(ObjectBuilder::new(1));
        let result = Closure::capture(&ctx, &[obj], |_: &[ObjPtr]| ());
        assert!(result.is_err());
        unsafe { rc::dec_ref(&ctx, obj).unwrap() };
    }
}
