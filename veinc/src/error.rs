//! Analysis errors.
//!
//! Inconclusive analysis never produces an error: it degrades to the most
//! conservative strategy instead. These errors report malformed input only.

use thiserror::Error;

use crate::mir::{BasicBlockId, LocalId};
use crate::types::{FieldId, TypeId};

/// Errors raised while building or analyzing a compilation unit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("unknown type id {id}")]
    UnknownType { id: TypeId },

    #[error("unknown field {field}")]
    UnknownField { field: FieldId },

    #[error("type `{name}` already declares a field named `{field}`")]
    DuplicateField { name: String, field: String },

    #[error("local {local} is not declared in `{body}`")]
    UnknownLocal { body: String, local: LocalId },

    #[error("block {block} in `{body}` has no terminator")]
    UnterminatedBlock { body: String, block: BasicBlockId },

    #[error("block {block} in `{body}` jumps to missing block {target}")]
    InvalidSuccessor {
        body: String,
        block: BasicBlockId,
        target: BasicBlockId,
    },

    #[error("body `{body}` has no blocks")]
    EmptyBody { body: String },

    #[error("`{symbol}` takes {expected} arguments, lowering produced {found}")]
    AbiArity {
        symbol: &'static str,
        expected: usize,
        found: usize,
    },
}

/// Result alias for analysis operations.
pub type AnalysisResult<T> = Result<T, AnalysisError>;
