//! ASAP reclamation.
//!
//! The compiler places a [`free_tree`] at the last static use of a value
//! whose shape is a tree and whose only owner is one local. The root is
//! freed without consulting its count. Strong children lose the parent's
//! reference, so children owned only by the tree go with it while a child
//! with another owner survives.

use tracing::trace;

use crate::context::RegistryContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::object::ObjPtr;
use crate::reclaim::Reclaimer;

/// Free a tree rooted at `root`. Returns the number of objects freed.
///
/// Arena objects are left to their arena. Roots managed by a counting
/// strategy (SCC members, symmetric objects) drop one reference instead.
///
/// # Safety
///
/// `root` must be live and the caller must hold its only reference.
pub unsafe fn free_tree(ctx: &RegistryContext, root: ObjPtr) -> RuntimeResult<usize> {
    let r = root.get();
    if r.is_releasing() {
        return Err(RuntimeError::ObjectReleasing);
    }
    if r.arena_id().is_some() {
        return Ok(0);
    }

    let mut reclaimer = Reclaimer::new(ctx);
    if r.scc_id() != 0 || r.is_symmetric() {
        reclaimer.drop_ref(root);
    } else {
        reclaimer.free_root(root);
    }
    let freed = reclaimer.run()?;
    trace!(?root, freed, "free_tree");
    Ok(freed)
}
