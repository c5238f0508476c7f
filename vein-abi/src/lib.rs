//! # Vein Runtime ABI
//!
//! The single description of the boundary between compiled Vein programs and
//! `vein-runtime`. The compiler names release calls through [`RuntimeFn`] and
//! the runtime generates its C exports from the same list, so the two sides
//! cannot drift apart silently.
//!
//! ## Contents
//!
//! - [`Strategy`]: the five reclamation strategies chosen at compile time
//! - [`RuntimeFn`]: every exported runtime entry point with its C signature
//! - [`status`]: integer status codes returned across the C boundary
//!
//! ## Calling Convention
//!
//! All entry points use the C calling convention. Object references are
//! passed as raw pointers (`AbiType::Ptr`), handles as one 64-bit word
//! (`AbiType::Handle`), and fallible operations return an `i32` status.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

// ============================================================================
// Strategies
// ============================================================================

/// Reclamation strategy assigned to an allocation site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Strategy {
    /// Direct free at the statically known last use.
    Asap,
    /// Standard reference counting.
    Rc,
    /// Frozen cyclic structure released as one strongly connected component.
    SccRelease,
    /// Bulk deallocation with the owning arena.
    Arena,
    /// Scope-as-node reference counting for mutable cycles.
    SymmetricRc,
}

impl Strategy {
    /// All strategies, in declaration order.
    pub const ALL: [Strategy; 5] = [
        Strategy::Asap,
        Strategy::Rc,
        Strategy::SccRelease,
        Strategy::Arena,
        Strategy::SymmetricRc,
    ];

    /// Short lowercase name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Strategy::Asap => "asap",
            Strategy::Rc => "rc",
            Strategy::SccRelease => "scc",
            Strategy::Arena => "arena",
            Strategy::SymmetricRc => "symmetric-rc",
        }
    }

    /// Runtime function emitted at a release point for this strategy.
    pub fn release_fn(self) -> RuntimeFn {
        match self {
            Strategy::Asap => RuntimeFn::FreeTree,
            Strategy::Rc => RuntimeFn::DecRef,
            Strategy::SccRelease => RuntimeFn::SccRelease,
            Strategy::Arena => RuntimeFn::ArenaDestroy,
            Strategy::SymmetricRc => RuntimeFn::SymRelease,
        }
    }

    /// Runtime function emitted when a new reference is taken, if any.
    pub fn acquire_fn(self) -> Option<RuntimeFn> {
        match self {
            Strategy::Rc => Some(RuntimeFn::IncRef),
            Strategy::SymmetricRc => Some(RuntimeFn::SymAcquire),
            Strategy::Asap | Strategy::SccRelease | Strategy::Arena => None,
        }
    }

    /// Whether values under this strategy carry a reference count.
    pub fn is_counted(self) -> bool {
        !matches!(self, Strategy::Asap | Strategy::Arena)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Runtime Functions
// ============================================================================

/// Type of a parameter or return value at the C boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiType {
    /// No value.
    Void,
    /// `int32_t`, used for status codes and booleans.
    I32,
    /// `uint32_t`.
    U32,
    /// `uint64_t`.
    U64,
    /// `void *` pointing at a runtime object or arena.
    Ptr,
    /// One-word generational handle (`uint64_t`).
    Handle,
}

impl AbiType {
    /// C spelling of the type.
    pub fn c_name(self) -> &'static str {
        match self {
            AbiType::Void => "void",
            AbiType::I32 => "int32_t",
            AbiType::U32 => "uint32_t",
            AbiType::U64 => "uint64_t",
            AbiType::Ptr => "void *",
            AbiType::Handle => "uint64_t",
        }
    }
}

/// C signature of a runtime entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    /// Parameter types, in order.
    pub params: &'static [AbiType],
    /// Return type.
    pub ret: AbiType,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.ret.c_name())?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(p.c_name())?;
        }
        f.write_str(")")
    }
}

macro_rules! runtime_fns {
    ($(
        $(#[$doc:meta])*
        $variant:ident = $symbol:literal : ($($param:ident),*) -> $ret:ident;
    )*) => {
        /// An exported runtime entry point.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum RuntimeFn {
            $(
                $(#[$doc])*
                $variant,
            )*
        }

        impl RuntimeFn {
            /// Every entry point, in declaration order.
            pub const ALL: &'static [RuntimeFn] = &[$(RuntimeFn::$variant),*];

            /// Linker symbol of the entry point.
            pub fn symbol(self) -> &'static str {
                match self {
                    $(RuntimeFn::$variant => $symbol,)*
                }
            }

            /// C signature of the entry point.
            pub fn signature(self) -> Signature {
                match self {
                    $(RuntimeFn::$variant => Signature {
                        params: &[$(AbiType::$param),*],
                        ret: AbiType::$ret,
                    },)*
                }
            }
        }
    };
}

runtime_fns! {
    /// Initialize the process-wide runtime context.
    RuntimeInit = "vein_runtime_init" : () -> I32;
    /// Allocate a heap object of a registered type.
    Alloc = "vein_alloc" : (U32, I32) -> Ptr;
    /// Register the field layout of a type.
    RegisterType = "vein_register_type" : (U32, U32, U64) -> I32;
    /// Store a reference into a field.
    SetField = "vein_set_field" : (Ptr, U32, Ptr) -> I32;
    /// Free an acyclic structure at its last use.
    FreeTree = "vein_free_tree" : (Ptr) -> Void;
    /// Take a new strong reference.
    IncRef = "vein_inc_ref" : (Ptr) -> Void;
    /// Drop a strong reference, freeing on zero.
    DecRef = "vein_dec_ref" : (Ptr) -> Void;
    /// Process a bounded batch of deferred decrements.
    SafePoint = "vein_safe_point" : () -> U32;
    /// Collapse the cycles reachable from a root into SCCs.
    SccFreeze = "vein_scc_freeze" : (Ptr) -> I32;
    /// Release one external reference to an SCC.
    SccRelease = "vein_scc_release" : (Ptr) -> I32;
    /// Create an arena on the calling thread.
    ArenaCreate = "vein_arena_create" : () -> Ptr;
    /// Bump-allocate an object in an arena.
    ArenaAlloc = "vein_arena_alloc" : (Ptr, U32) -> Ptr;
    /// Record a pointer that escapes the arena.
    ArenaRegisterExternal = "vein_arena_register_external" : (Ptr, Ptr) -> I32;
    /// Resolve a previously registered external pointer.
    ArenaResolveExternal = "vein_arena_resolve_external" : (Ptr, Ptr) -> I32;
    /// Destroy an arena, or defer destruction while externals remain.
    ArenaDestroy = "vein_arena_destroy" : (Ptr) -> I32;
    /// Enter a symmetric RC scope.
    SymEnterScope = "vein_sym_enter_scope" : () -> Void;
    /// Exit the innermost symmetric RC scope.
    SymExitScope = "vein_sym_exit_scope" : () -> I32;
    /// Allocate an object owned by the innermost scope.
    SymAlloc = "vein_sym_alloc" : (U32) -> Ptr;
    /// Add a scope reference to an object.
    SymAcquire = "vein_sym_acquire" : (Ptr) -> I32;
    /// Drop a scope reference to an object.
    SymRelease = "vein_sym_release" : (Ptr) -> I32;
    /// Store an object-to-object reference under symmetric RC.
    SymLink = "vein_sym_link" : (Ptr, U32, Ptr) -> I32;
    /// Allocate a slot-pool object: type tag, atomic counts, owned by the
    /// innermost symmetric scope.
    SlotPoolAlloc = "vein_slot_pool_alloc" : (U32, I32, I32) -> Ptr;
    /// Free a slot-pool object, invalidating its handles.
    SlotPoolFree = "vein_slot_pool_free" : (Ptr) -> I32;
    /// Make a handle for a slot-pool object.
    MakeHandle = "vein_make_handle" : (Ptr) -> Handle;
    /// Check a handle without dereferencing it.
    HandleIsValid = "vein_handle_is_valid" : (Handle) -> I32;
    /// Dereference a handle, or return null when it is stale.
    HandleDeref = "vein_handle_deref" : (Handle) -> Ptr;
}

/// Error returned when a symbol does not name a runtime function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown runtime symbol `{0}`")]
pub struct UnknownSymbol(pub String);

impl FromStr for RuntimeFn {
    type Err = UnknownSymbol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuntimeFn::ALL
            .iter()
            .copied()
            .find(|f| f.symbol() == s)
            .ok_or_else(|| UnknownSymbol(s.to_string()))
    }
}

impl fmt::Display for RuntimeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

// ============================================================================
// Status Codes
// ============================================================================

/// Status codes returned by fallible entry points.
///
/// Zero is success. Negative values are recoverable errors. Positive values
/// carry a successful result with extra information.
pub mod status {
    /// Success.
    pub const OK: i32 = 0;
    /// Arena destruction deferred until outstanding externals resolve.
    pub const DEFERRED: i32 = 1;
    /// Null or unrecognized object pointer.
    pub const INVALID_OBJECT: i32 = -1;
    /// Handle is stale or was never issued.
    pub const INVALID_HANDLE: i32 = -2;
    /// Field index outside the object's layout.
    pub const FIELD_OUT_OF_RANGE: i32 = -3;
    /// Write to a frozen SCC member.
    pub const FROZEN: i32 = -4;
    /// SCC registry capacity reached.
    pub const SCC_EXHAUSTED: i32 = -5;
    /// Slot pool capacity reached.
    pub const POOL_EXHAUSTED: i32 = -6;
    /// Reference between two different arenas.
    pub const CROSS_ARENA: i32 = -7;
    /// No symmetric RC scope is active on this thread.
    pub const NO_SCOPE: i32 = -8;
    /// Runtime context not initialized.
    pub const NOT_INITIALIZED: i32 = -9;
    /// Object is not a member of a live SCC.
    pub const NOT_IN_SCC: i32 = -10;
    /// Type tag is not registered.
    pub const UNKNOWN_TYPE: i32 = -11;
    /// Any other failure.
    pub const INTERNAL: i32 = -100;
}
