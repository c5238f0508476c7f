//! # Vein Runtime Library
//!
//! The Vein runtime executes the memory plan chosen by `veinc`. It provides:
//!
//! - **ASAP**: direct frees of acyclic structures at their last use
//! - **Reference Counting**: atomic or plain counts, optionally deferred to
//!   bounded safe points
//! - **SCC Release**: frozen cycles collapsed into one shared count
//! - **Arenas**: bump allocation freed per region
//! - **Symmetric RC**: scope-owned counting that reclaims mutable cycles
//! - **Generational Handles**: stale references detected, never dereferenced
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          VEIN RUNTIME                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │     ASAP     │  │   RC + Def.  │  │     SCC      │           │
//! │  │  (asap.rs)   │  │   (rc.rs)    │  │   (scc.rs)   │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │  ┌──────────────┐  ┌──────────────┐                             │
//! │  │    Arena     │  │  Symmetric   │    all teardown goes         │
//! │  │  (arena.rs)  │  │(symmetric.rs)│    through reclaim.rs        │
//! │  └──────────────┘  └──────────────┘                             │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Context    │  │  Slot Pool   │  │   Handles    │           │
//! │  │ (context.rs) │  │  (slot.rs)   │  │ (handle.rs)  │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Compiled programs reach the runtime through the C exports in
//! [`ffi_exports`], whose names and signatures come from
//! [`vein_abi::RuntimeFn`]. Rust callers use [`RegistryContext`] and the
//! engine modules directly.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod arena;
pub mod asap;
pub mod closure;
pub mod config;
pub mod context;
pub mod error;
pub mod ffi_exports;
pub mod handle;
pub mod log;
pub mod object;
pub mod rc;
mod reclaim;
pub mod scc;
pub mod slot;
pub mod symmetric;

// Re-exports
pub use arena::{Arena, ArenaRelease};
pub use closure::Closure;
pub use config::{ConfigError, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use context::{RegistryContext, StatsSnapshot, TypeLayout};
pub use error::{RuntimeError, RuntimeResult};
pub use handle::{Handle, HandleCodec};
pub use object::{HeapObject, ObjPtr, ObjectBuilder, Origin, Payload, TypeTag};
pub use scc::{SccId, SccRegistry};
pub use slot::SlotPool;
pub use symmetric::SymContext;
pub use vein_abi::{status, RuntimeFn, Strategy};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build a context from `VEIN_*` environment variables and install logging.
///
/// The C ABI uses its own process-wide instance; this is for Rust hosts
/// that own their context.
pub fn init_from_env() -> RegistryContext {
    let config = RuntimeConfig::from_env();
    log::init_logging(&config.log);
    RegistryContext::new(config)
}
