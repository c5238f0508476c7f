//! # Mid-level IR
//!
//! The scoped control-flow representation consumed by escape analysis,
//! liveness and the memory planner.

pub mod body;
pub mod types;

pub use body::{Body, LocalDecl, LocalKind};
pub use types::{
    ArgMode, BasicBlockData, BasicBlockId, BinOp, Callee, GlobalId, LocalId, Location, Operand,
    Place, PlaceElem, Rvalue, SiteId, Statement, StatementKind, Terminator, TerminatorKind,
};
