//! Runtime errors.
//!
//! Every recoverable condition an engine can hit is a [`RuntimeError`]. The
//! C ABI layer maps each variant to a status code from [`vein_abi::status`].

use thiserror::Error;
use vein_abi::status;

/// Errors reported by the reclamation engines and the handle layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// A handle's tag does not match its slot, or the slot is free.
    #[error("invalid handle")]
    InvalidHandle,

    /// A closure capture no longer refers to a live object.
    #[error("closure capture {index} is no longer valid")]
    InvalidCapture {
        /// Position of the capture in the closure's environment.
        index: usize,
    },

    /// Arena destruction refused while escaping pointers are registered.
    #[error("arena has {outstanding} outstanding external reference(s)")]
    ArenaHasExternals {
        /// Registered externals not yet resolved.
        outstanding: usize,
    },

    /// An arena object may only point into its own arena.
    #[error("reference crosses an arena boundary")]
    CrossArenaReference,

    /// Resolving a pointer that was never registered as external.
    #[error("pointer is not a registered arena external")]
    UnknownExternal,

    /// The arena reached its chunk limit.
    #[error("arena exhausted after {max_chunks} chunk(s)")]
    ArenaExhausted {
        /// Configured chunk limit.
        max_chunks: usize,
    },

    /// No free SCC id is left.
    #[error("SCC registry exhausted (capacity {capacity})")]
    SccRegistryExhausted {
        /// Maximum number of live SCCs.
        capacity: usize,
    },

    /// The slot pool cannot grow any further.
    #[error("slot pool exhausted (capacity {capacity})")]
    PoolExhausted {
        /// Maximum number of slots.
        capacity: usize,
    },

    /// Field write on a frozen SCC member.
    #[error("object is frozen")]
    FrozenObject,

    /// Field index beyond the object's layout.
    #[error("field {index} out of range for {count} field(s)")]
    FieldOutOfRange {
        /// Requested field.
        index: u32,
        /// Fields in the layout.
        count: u32,
    },

    /// SCC id is stale or the object belongs to no SCC.
    #[error("object is not a member of a live SCC")]
    NotInScc,

    /// Symmetric RC operation with no open scope.
    #[error("no active symmetric RC scope")]
    NoActiveScope,

    /// The object is being torn down.
    #[error("object is being released")]
    ObjectReleasing,

    /// Allocation of an unregistered type tag.
    #[error("unknown type tag {tag}")]
    UnknownType {
        /// The tag that was not registered.
        tag: u32,
    },

    /// Address does not fit in a handle or lies outside the slot pool.
    #[error("address {address:#x} is outside the slot pool")]
    AddressOutOfRange {
        /// Offending address.
        address: usize,
    },
}

impl RuntimeError {
    /// Status code returned across the C ABI.
    pub fn status(&self) -> i32 {
        match self {
            RuntimeError::InvalidHandle | RuntimeError::InvalidCapture { .. } => {
                status::INVALID_HANDLE
            }
            RuntimeError::ArenaHasExternals { .. } => status::DEFERRED,
            RuntimeError::CrossArenaReference | RuntimeError::UnknownExternal => {
                status::CROSS_ARENA
            }
            RuntimeError::ArenaExhausted { .. } | RuntimeError::PoolExhausted { .. } => {
                status::POOL_EXHAUSTED
            }
            RuntimeError::SccRegistryExhausted { .. } => status::SCC_EXHAUSTED,
            RuntimeError::FrozenObject => status::FROZEN,
            RuntimeError::FieldOutOfRange { .. } => status::FIELD_OUT_OF_RANGE,
            RuntimeError::NotInScc => status::NOT_IN_SCC,
            RuntimeError::NoActiveScope => status::NO_SCOPE,
            RuntimeError::ObjectReleasing | RuntimeError::AddressOutOfRange { .. } => {
                status::INVALID_OBJECT
            }
            RuntimeError::UnknownType { .. } => status::UNKNOWN_TYPE,
        }
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
