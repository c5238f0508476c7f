//! # Core MIR Types
//!
//! A scoped control-flow IR in the style of Rust MIR, reduced to what the
//! memory analyses consume.
//!
//! ```text
//! Body
//! └── BasicBlockData
//!     ├── Vec<Statement>
//!     │   └── StatementKind
//!     │       ├── Assign(Place, Rvalue)      Rvalue::Alloc is an allocation site
//!     │       ├── StoreGlobal { .. }
//!     │       ├── Send { .. }
//!     │       └── Spawn { .. }
//!     └── Terminator
//!         └── TerminatorKind
//!             ├── Goto { target }
//!             ├── SwitchInt { discr, targets, otherwise }
//!             ├── Call { callee, args, destination, target }
//!             ├── Return
//!             └── Unreachable
//! ```

use std::fmt;

use crate::types::TypeId;

// ============================================================================
// Identifiers
// ============================================================================

/// A local variable within a body. `_0` is the return place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

impl LocalId {
    /// Create a new LocalId.
    pub const fn new(index: u32) -> Self {
        LocalId(index)
    }

    /// Get the index value.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_{}", self.0)
    }
}

/// A unique identifier for a basic block within a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BasicBlockId(pub u32);

impl BasicBlockId {
    /// The entry block ID (always 0).
    pub const ENTRY: BasicBlockId = BasicBlockId(0);

    /// Create a new BasicBlockId.
    pub const fn new(id: u32) -> Self {
        BasicBlockId(id)
    }

    /// Get the index value.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BasicBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Identifier of an allocation expression, stable across passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId(pub u32);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "site{}", self.0)
    }
}

/// Identifier of a static.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalId(pub u32);

/// A statement position. `statement_index == statements.len()` denotes the
/// block's terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    /// Block containing the position.
    pub block: BasicBlockId,
    /// Statement index within the block.
    pub statement_index: usize,
}

impl Location {
    /// Create a new location.
    pub const fn new(block: BasicBlockId, statement_index: usize) -> Self {
        Location { block, statement_index }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.block, self.statement_index)
    }
}

// ============================================================================
// Places and Operands
// ============================================================================

/// A projection applied to a place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaceElem {
    /// Field access by declaration index.
    Field(u32),
    /// Dereference through a pointer.
    Deref,
}

/// A memory location: a local plus projections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Place {
    /// Base local.
    pub local: LocalId,
    /// Projections applied in order.
    pub projection: Vec<PlaceElem>,
}

impl Place {
    /// A place naming a local directly.
    pub fn local(local: LocalId) -> Self {
        Place {
            local,
            projection: Vec::new(),
        }
    }

    /// Project a field.
    pub fn field(mut self, index: u32) -> Self {
        self.projection.push(PlaceElem::Field(index));
        self
    }

    /// Project a dereference.
    pub fn deref(mut self) -> Self {
        self.projection.push(PlaceElem::Deref);
        self
    }

    /// Whether the place names a local without projections.
    pub fn as_local(&self) -> Option<LocalId> {
        if self.projection.is_empty() {
            Some(self.local)
        } else {
            None
        }
    }

    /// Whether any projection dereferences a pointer.
    pub fn is_indirect(&self) -> bool {
        self.projection.contains(&PlaceElem::Deref)
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = self.local.to_string();
        for elem in &self.projection {
            text = match elem {
                PlaceElem::Field(i) => format!("{text}.{i}"),
                PlaceElem::Deref => format!("(*{text})"),
            };
        }
        f.write_str(&text)
    }
}

/// An operand of an rvalue or call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Copy the value (for references: create an alias).
    Copy(Place),
    /// Move the value, ending the source's ownership.
    Move(Place),
    /// Integer constant.
    Constant(i64),
}

impl Operand {
    /// The place read by this operand, if any.
    pub fn place(&self) -> Option<&Place> {
        match self {
            Operand::Copy(p) | Operand::Move(p) => Some(p),
            Operand::Constant(_) => None,
        }
    }
}

/// Binary operators on scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `==`
    Eq,
    /// `<`
    Lt,
}

/// The right-hand side of an assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rvalue {
    /// Use an operand.
    Use(Operand),
    /// Heap allocation: the allocation site.
    Alloc {
        /// Site identifier.
        site: SiteId,
        /// Allocated type.
        ty: TypeId,
        /// Whether the value is immutable after construction.
        frozen: bool,
        /// Initial field values.
        fields: Vec<Operand>,
    },
    /// Closure literal capturing operands by value.
    Closure {
        /// Captured values.
        captures: Vec<Operand>,
    },
    /// Take a reference to a place.
    Ref(Place),
    /// Scalar arithmetic or comparison.
    BinaryOp {
        /// Operator.
        op: BinOp,
        /// Left operand.
        left: Operand,
        /// Right operand.
        right: Operand,
    },
}

// ============================================================================
// Statements
// ============================================================================

/// A statement with no control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// What the statement does.
    pub kind: StatementKind,
}

impl Statement {
    /// Create a new statement.
    pub fn new(kind: StatementKind) -> Self {
        Statement { kind }
    }

    /// `place = rvalue`
    pub fn assign(place: Place, rvalue: Rvalue) -> Self {
        Statement::new(StatementKind::Assign(place, rvalue))
    }
}

/// Statement kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    /// `place = rvalue`
    Assign(Place, Rvalue),
    /// Store a value into a static.
    StoreGlobal {
        /// Target static.
        global: GlobalId,
        /// Stored value.
        value: Operand,
    },
    /// Send a value on a channel to another thread.
    Send {
        /// Channel operand.
        channel: Operand,
        /// Sent value.
        value: Operand,
    },
    /// Spawn a task that owns the given values.
    Spawn {
        /// Values moved into the task.
        captures: Vec<Operand>,
    },
    /// Start of a local's storage.
    StorageLive(LocalId),
    /// End of a local's storage.
    StorageDead(LocalId),
    /// No operation.
    Nop,
}

// ============================================================================
// Terminators
// ============================================================================

/// How a callee treats a reference argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgMode {
    /// The callee only reads through the argument during the call.
    Borrow,
    /// The callee may keep the reference after returning.
    Retain,
}

/// The function called by a `Call` terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callee {
    /// Callee name, for diagnostics.
    pub name: String,
    /// Per-argument summary; `None` when the callee is not analyzable.
    pub modes: Option<Vec<ArgMode>>,
}

impl Callee {
    /// A callee with a known argument summary.
    pub fn known(name: impl Into<String>, modes: Vec<ArgMode>) -> Self {
        Callee {
            name: name.into(),
            modes: Some(modes),
        }
    }

    /// A callee whose behavior is unknown.
    pub fn unknown(name: impl Into<String>) -> Self {
        Callee {
            name: name.into(),
            modes: None,
        }
    }

    /// Summary for argument `index`, if known.
    pub fn mode(&self, index: usize) -> Option<ArgMode> {
        self.modes.as_ref().and_then(|m| m.get(index).copied())
    }
}

/// A block terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminator {
    /// What the terminator does.
    pub kind: TerminatorKind,
}

impl Terminator {
    /// Create a new terminator.
    pub fn new(kind: TerminatorKind) -> Self {
        Terminator { kind }
    }

    /// Successor blocks.
    pub fn successors(&self) -> Vec<BasicBlockId> {
        match &self.kind {
            TerminatorKind::Goto { target } => vec![*target],
            TerminatorKind::SwitchInt {
                targets, otherwise, ..
            } => {
                let mut succ = targets.clone();
                succ.push(*otherwise);
                succ
            }
            TerminatorKind::Call { target, .. } => target.iter().copied().collect(),
            TerminatorKind::Return | TerminatorKind::Unreachable => Vec::new(),
        }
    }
}

/// Terminator kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminatorKind {
    /// Unconditional jump.
    Goto {
        /// Jump target.
        target: BasicBlockId,
    },
    /// Multi-way branch on an integer.
    SwitchInt {
        /// Discriminant.
        discr: Operand,
        /// Targets for values 0, 1, ...
        targets: Vec<BasicBlockId>,
        /// Target for any other value.
        otherwise: BasicBlockId,
    },
    /// Function call.
    Call {
        /// Called function.
        callee: Callee,
        /// Arguments.
        args: Vec<Operand>,
        /// Where the result is written.
        destination: Place,
        /// Continuation block; `None` for diverging calls.
        target: Option<BasicBlockId>,
    },
    /// Return `_0` to the caller.
    Return,
    /// Control never reaches here.
    Unreachable,
}

/// A basic block in the control-flow graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicBlockData {
    /// Statements executed sequentially.
    pub statements: Vec<Statement>,
    /// The terminator that ends this block.
    pub terminator: Option<Terminator>,
}

impl BasicBlockData {
    /// Create a new empty basic block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the block has a terminator.
    pub fn is_terminated(&self) -> bool {
        self.terminator.is_some()
    }

    /// Successor blocks (empty when unterminated).
    pub fn successors(&self) -> Vec<BasicBlockId> {
        self.terminator
            .as_ref()
            .map(Terminator::successors)
            .unwrap_or_default()
    }

    /// Location of the terminator.
    pub fn terminator_location(&self, block: BasicBlockId) -> Location {
        Location::new(block, self.statements.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_place_display() {
        let p = Place::local(LocalId::new(2)).field(1).deref();
        assert_eq!(p.to_string(), "(*_2.1)");
        assert!(p.is_indirect());
        assert_eq!(p.as_local(), None);
        assert_eq!(Place::local(LocalId::new(3)).as_local(), Some(LocalId::new(3)));
    }

    #[test]
    fn test_terminator_successors() {
        let t = Terminator::new(TerminatorKind::SwitchInt {
            discr: Operand::Constant(0),
            targets: vec![BasicBlockId::new(1), BasicBlockId::new(2)],
            otherwise: BasicBlockId::new(3),
        });
        assert_eq!(
            t.successors(),
            vec![BasicBlockId::new(1), BasicBlockId::new(2), BasicBlockId::new(3)]
        );
        assert!(Terminator::new(TerminatorKind::Return).successors().is_empty());
    }

    #[test]
    fn test_callee_modes() {
        let c = Callee::known("f", vec![ArgMode::Borrow, ArgMode::Retain]);
        assert_eq!(c.mode(0), Some(ArgMode::Borrow));
        assert_eq!(c.mode(1), Some(ArgMode::Retain));
        assert_eq!(c.mode(2), None);
        assert_eq!(Callee::unknown("g").mode(0), None);
    }
}
