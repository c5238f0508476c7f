//! # SCC Release
//!
//! A frozen cyclic structure is collapsed into one reference-counted unit.
//!
//! ## Freezing
//!
//! [`freeze`] runs Tarjan's algorithm over the subgraph reachable from a
//! root through strong fields only. It never enters objects that are
//! arena-owned, symmetric, releasing, or already members of a live SCC, so
//! an object is never in two SCCs. A component becomes an SCC when it has
//! more than one member, or one member with a strong reference to itself.
//!
//! The SCC's shared count is the number of strong references from outside
//! the component:
//!
//! ```text
//! external = Σ member counts − strong edges between members
//! ```
//!
//! Members are frozen: field writes on them are refused.
//!
//! ## Release
//!
//! Increments and decrements on any member go to the shared count. When it
//! reaches zero the whole component is released in two phases (see
//! [`crate::reclaim`]) and its id is retired. Ids carry an epoch so a stale
//! id never aliases a later SCC in the same registry entry.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context::RegistryContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::object::{HeapObject, ObjPtr};
use crate::reclaim::{self, Reclaimer};

// ============================================================================
// Ids
// ============================================================================

/// Identifier of a live SCC: epoch in the high half, index + 1 in the low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SccId(u64);

impl SccId {
    fn new(index: usize, epoch: u32) -> Self {
        SccId(((epoch as u64) << 32) | (index as u64 + 1))
    }

    /// Rebuild from the raw value stored in an object.
    pub fn from_raw(raw: u64) -> Self {
        SccId(raw)
    }

    /// Raw value; never zero.
    pub fn raw(self) -> u64 {
        self.0
    }

    fn index(self) -> Option<usize> {
        ((self.0 & 0xffff_ffff) as usize).checked_sub(1)
    }

    fn epoch(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for SccId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index() {
            Some(index) => write!(f, "scc{}@{}", index, self.epoch()),
            None => write!(f, "scc?"),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Default)]
struct SccEntry {
    epoch: u32,
    live: bool,
    external: u32,
    members: Vec<ObjPtr>,
}

#[derive(Debug, Default)]
struct SccTable {
    entries: Vec<SccEntry>,
    free: Vec<usize>,
    live: usize,
}

impl SccTable {
    fn entry_mut(&mut self, id: SccId) -> Option<&mut SccEntry> {
        let index = id.index()?;
        self.entries
            .get_mut(index)
            .filter(|e| e.live && e.epoch == id.epoch())
    }
}

/// Bounded table of live SCCs.
#[derive(Debug)]
pub struct SccRegistry {
    table: Mutex<SccTable>,
    capacity: usize,
}

impl SccRegistry {
    /// Registry holding at most `capacity` live SCCs.
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(SccTable::default()),
            capacity,
        }
    }

    fn register(&self, members: Vec<ObjPtr>, external: u32) -> RuntimeResult<SccId> {
        let mut table = self.table.lock();
        let index = match table.free.pop() {
            Some(index) => index,
            None if table.entries.len() < self.capacity => {
                table.entries.push(SccEntry::default());
                table.entries.len() - 1
            }
            None => {
                return Err(RuntimeError::SccRegistryExhausted {
                    capacity: self.capacity,
                })
            }
        };
        table.live += 1;
        let entry = &mut table.entries[index];
        entry.epoch = entry.epoch.wrapping_add(1);
        entry.live = true;
        entry.external = external;
        entry.members = members;
        Ok(SccId::new(index, entry.epoch))
    }

    /// Whether `id` names a live SCC.
    pub fn is_live(&self, id: SccId) -> bool {
        self.table.lock().entry_mut(id).is_some()
    }

    /// Shared count of a live SCC.
    pub fn external(&self, id: SccId) -> Option<u32> {
        self.table.lock().entry_mut(id).map(|e| e.external)
    }

    /// Members of a live SCC.
    pub fn members(&self, id: SccId) -> Option<Vec<ObjPtr>> {
        self.table.lock().entry_mut(id).map(|e| e.members.clone())
    }

    /// Number of live SCCs.
    pub fn live_count(&self) -> usize {
        self.table.lock().live
    }

    pub(crate) fn inc(&self, id: SccId) -> bool {
        match self.table.lock().entry_mut(id) {
            Some(entry) => {
                entry.external += 1;
                true
            }
            None => false,
        }
    }

    /// Decrement the shared count; `None` for a stale id.
    pub(crate) fn dec(&self, id: SccId) -> Option<u32> {
        let mut table = self.table.lock();
        let entry = table.entry_mut(id)?;
        entry.external = entry.external.saturating_sub(1);
        Some(entry.external)
    }

    /// Retire an SCC and hand back its members.
    pub(crate) fn take(&self, id: SccId) -> Option<Vec<ObjPtr>> {
        let mut table = self.table.lock();
        let index = id.index()?;
        let entry = table.entry_mut(id)?;
        entry.live = false;
        let members = std::mem::take(&mut entry.members);
        table.free.push(index);
        table.live -= 1;
        Some(members)
    }
}

// ============================================================================
// Tarjan
// ============================================================================

fn eligible(o: &HeapObject) -> bool {
    !o.is_symmetric() && o.arena_id().is_none() && !o.is_releasing() && o.scc_id() == 0
}

#[derive(Default)]
struct Tarjan {
    index: HashMap<usize, u32>,
    low: HashMap<usize, u32>,
    on_stack: HashSet<usize>,
    stack: Vec<ObjPtr>,
    counter: u32,
    components: Vec<Vec<ObjPtr>>,
}

impl Tarjan {
    fn open(&mut self, node: ObjPtr, call: &mut Vec<(ObjPtr, usize)>) {
        self.index.insert(node.addr(), self.counter);
        self.low.insert(node.addr(), self.counter);
        self.counter += 1;
        self.stack.push(node);
        self.on_stack.insert(node.addr());
        call.push((node, 0));
    }

    fn lower(&mut self, node: ObjPtr, value: u32) {
        if let Some(low) = self.low.get_mut(&node.addr()) {
            *low = (*low).min(value);
        }
    }

    /// Components reachable from `root`, sinks first.
    unsafe fn run(mut self, root: ObjPtr) -> Vec<Vec<ObjPtr>> {
        let mut call = Vec::new();
        self.open(root, &mut call);

        while let Some(&(node, next)) = call.last() {
            let fields = node.get().fields();
            if next < fields.len() {
                if let Some(frame) = call.last_mut() {
                    frame.1 += 1;
                }
                let field = &fields[next];
                if field.is_weak() {
                    continue;
                }
                let Some(child) = field.get() else {
                    continue;
                };
                if !eligible(child.get()) {
                    continue;
                }
                match self.index.get(&child.addr()).copied() {
                    None => self.open(child, &mut call),
                    Some(child_index) => {
                        if self.on_stack.contains(&child.addr()) {
                            self.lower(node, child_index);
                        }
                    }
                }
                continue;
            }

            call.pop();
            let node_low = self.low[&node.addr()];
            if let Some(&(parent, _)) = call.last() {
                self.lower(parent, node_low);
            }
            if node_low == self.index[&node.addr()] {
                let mut component = Vec::new();
                while let Some(member) = self.stack.pop() {
                    self.on_stack.remove(&member.addr());
                    component.push(member);
                    if member == node {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
        self.components
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Find the cycles reachable from `root` and freeze each into an SCC.
///
/// Returns the ids of the SCCs created. Objects that are already SCC
/// members are skipped, so freezing twice creates nothing new.
///
/// # Safety
///
/// `root` and everything reachable from it must be live.
pub unsafe fn freeze(ctx: &RegistryContext, root: ObjPtr) -> RuntimeResult<Vec<SccId>> {
    if !eligible(root.get()) {
        return Ok(Vec::new());
    }

    let mut ids = Vec::new();
    let mut reclaimer = Reclaimer::new(ctx);
    for members in Tarjan::default().run(root) {
        let set: HashSet<usize> = members.iter().map(|m| m.addr()).collect();
        let mut total = 0u64;
        let mut internal = 0u64;
        for member in &members {
            let o = member.get();
            total += o.ref_count() as u64;
            internal += o
                .strong_children()
                .filter(|c| set.contains(&c.addr()))
                .count() as u64;
        }
        if members.len() == 1 && internal == 0 {
            continue;
        }

        let external = total.saturating_sub(internal).min(u32::MAX as u64) as u32;
        let size = members.len();
        let id = match ctx.sccs.register(members.clone(), external) {
            Ok(id) => id,
            Err(err) => {
                // Components frozen so far stay valid SCCs; any already
                // unreferenced one is released before reporting.
                warn!(%err, frozen = ids.len(), "SCC registry full, freeze stopped");
                reclaimer.run()?;
                return Err(err);
            }
        };
        for member in &members {
            let o = member.get();
            o.scc.store(id.raw(), Ordering::Release);
            o.frozen.store(true, Ordering::Release);
        }
        ctx.counters().record_scc(false);
        debug!(scc = %id, size, external, "froze SCC");

        if external == 0 {
            reclaimer.release_scc(id);
        }
        ids.push(id);
    }
    reclaimer.run()?;
    Ok(ids)
}

/// Take one more reference to the SCC containing `obj`.
///
/// # Safety
///
/// `obj` must be live.
pub unsafe fn scc_inc(ctx: &RegistryContext, obj: ObjPtr) -> RuntimeResult<()> {
    let id = SccId::from_raw(obj.get().scc_id());
    if !ctx.sccs.is_live(id) {
        return Err(RuntimeError::NotInScc);
    }
    reclaim::acquire(ctx, obj);
    Ok(())
}

/// Drop one reference to the SCC containing `obj`.
///
/// An object that never became part of an SCC falls back to a plain
/// decrement. Returns the number of objects freed.
///
/// # Safety
///
/// `obj` must be live and the caller must own the reference it drops.
pub unsafe fn scc_release(ctx: &RegistryContext, obj: ObjPtr) -> RuntimeResult<usize> {
    let mut reclaimer = Reclaimer::new(ctx);
    reclaimer.drop_ref(obj);
    reclaimer.run()
}
