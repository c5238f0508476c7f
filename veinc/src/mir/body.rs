//! # MIR Function Bodies
//!
//! ## Local Convention
//!
//! - `_0`: Return place
//! - `_1..=_n`: Parameters (where n = param_count)
//! - `_(n+1)..`: Temporaries and user variables

use rustc_hash::FxHashMap;

use super::types::{
    BasicBlockData, BasicBlockId, LocalId, Location, Statement, Terminator, TerminatorKind,
};
use crate::error::{AnalysisError, AnalysisResult};
use crate::types::TypeId;

/// The role of a local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalKind {
    /// `_0`
    ReturnPlace,
    /// Function parameter.
    Arg,
    /// User variable.
    Var,
    /// Compiler temporary.
    Temp,
}

/// A local variable declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDecl {
    /// Local identity.
    pub id: LocalId,
    /// Role of the local.
    pub kind: LocalKind,
    /// Referenced heap type, if the local holds a reference.
    pub ty: Option<TypeId>,
    /// Source name, if any.
    pub name: Option<String>,
}

/// A function body.
#[derive(Debug, Clone)]
pub struct Body {
    /// Function name.
    pub name: String,
    /// All locals (return place at index 0, then params, then the rest).
    pub locals: Vec<LocalDecl>,
    /// Number of parameters (not counting the return place).
    pub param_count: usize,
    /// The basic blocks of the CFG.
    pub basic_blocks: Vec<BasicBlockData>,
}

impl Body {
    /// Create a body with its return place and `param_count` parameters.
    pub fn new(name: impl Into<String>, param_count: usize) -> Self {
        let mut body = Body {
            name: name.into(),
            locals: Vec::new(),
            param_count: 0,
            basic_blocks: Vec::new(),
        };
        body.new_local(LocalKind::ReturnPlace, None);
        for _ in 0..param_count {
            body.new_local(LocalKind::Arg, None);
        }
        body.param_count = param_count;
        body
    }

    /// Get the return place (always local 0).
    pub fn return_place(&self) -> LocalId {
        LocalId::new(0)
    }

    /// Iterate over parameter local IDs.
    pub fn param_ids(&self) -> impl Iterator<Item = LocalId> {
        (1..=self.param_count).map(|i| LocalId::new(i as u32))
    }

    /// Allocate a new local and return its ID.
    pub fn new_local(&mut self, kind: LocalKind, ty: Option<TypeId>) -> LocalId {
        let id = LocalId::new(self.locals.len() as u32);
        self.locals.push(LocalDecl {
            id,
            kind,
            ty,
            name: None,
        });
        id
    }

    /// Allocate a named user variable.
    pub fn new_var(&mut self, name: impl Into<String>, ty: Option<TypeId>) -> LocalId {
        let id = self.new_local(LocalKind::Var, ty);
        self.locals[id.index()].name = Some(name.into());
        id
    }

    /// Get a local by ID.
    pub fn local(&self, id: LocalId) -> AnalysisResult<&LocalDecl> {
        self.locals.get(id.index()).ok_or_else(|| AnalysisError::UnknownLocal {
            body: self.name.clone(),
            local: id,
        })
    }

    /// Allocate a new basic block and return its ID.
    pub fn new_block(&mut self) -> BasicBlockId {
        let id = BasicBlockId::new(self.basic_blocks.len() as u32);
        self.basic_blocks.push(BasicBlockData::new());
        id
    }

    /// Get a basic block by ID.
    pub fn block(&self, id: BasicBlockId) -> Option<&BasicBlockData> {
        self.basic_blocks.get(id.index())
    }

    /// Iterate over all blocks.
    pub fn blocks(&self) -> impl Iterator<Item = (BasicBlockId, &BasicBlockData)> {
        self.basic_blocks
            .iter()
            .enumerate()
            .map(|(i, bb)| (BasicBlockId::new(i as u32), bb))
    }

    /// Get all block IDs.
    pub fn block_ids(&self) -> impl Iterator<Item = BasicBlockId> {
        (0..self.basic_blocks.len()).map(|i| BasicBlockId::new(i as u32))
    }

    /// Add a statement to a block.
    pub fn push_statement(&mut self, block: BasicBlockId, stmt: Statement) -> Location {
        match self.basic_blocks.get_mut(block.index()) {
            Some(bb) => {
                bb.statements.push(stmt);
                Location::new(block, bb.statements.len() - 1)
            }
            None => Location::new(block, 0),
        }
    }

    /// Set the terminator for a block.
    pub fn set_terminator(&mut self, block: BasicBlockId, kind: TerminatorKind) {
        if let Some(bb) = self.basic_blocks.get_mut(block.index()) {
            bb.terminator = Some(Terminator::new(kind));
        }
    }

    /// Compute predecessors for all blocks.
    pub fn predecessors(&self) -> FxHashMap<BasicBlockId, Vec<BasicBlockId>> {
        let mut preds: FxHashMap<_, Vec<_>> = FxHashMap::default();
        for id in self.block_ids() {
            preds.insert(id, Vec::new());
        }
        for (id, block) in self.blocks() {
            for succ in block.successors() {
                preds.entry(succ).or_default().push(id);
            }
        }
        preds
    }

    /// Blocks reachable from entry, in reverse postorder.
    pub fn reverse_postorder(&self) -> Vec<BasicBlockId> {
        if self.basic_blocks.is_empty() {
            return Vec::new();
        }
        let mut visited = vec![false; self.basic_blocks.len()];
        let mut postorder = Vec::with_capacity(self.basic_blocks.len());
        let mut stack = vec![(BasicBlockId::ENTRY, 0usize)];
        visited[0] = true;

        while let Some(frame) = stack.last_mut() {
            let succs = self.basic_blocks[frame.0.index()].successors();
            if frame.1 < succs.len() {
                let next = succs[frame.1];
                frame.1 += 1;
                if next.index() < visited.len() && !visited[next.index()] {
                    visited[next.index()] = true;
                    stack.push((next, 0));
                }
            } else {
                postorder.push(frame.0);
                stack.pop();
            }
        }

        postorder.reverse();
        postorder
    }

    /// Locations of every `Return` terminator.
    pub fn return_locations(&self) -> Vec<Location> {
        self.blocks()
            .filter(|(_, bb)| {
                matches!(
                    bb.terminator.as_ref().map(|t| &t.kind),
                    Some(TerminatorKind::Return)
                )
            })
            .map(|(id, bb)| bb.terminator_location(id))
            .collect()
    }

    /// Check that the body is well formed: non-empty, every block
    /// terminated, and every successor in range.
    pub fn validate(&self) -> AnalysisResult<()> {
        if self.basic_blocks.is_empty() {
            return Err(AnalysisError::EmptyBody {
                body: self.name.clone(),
            });
        }
        for (id, block) in self.blocks() {
            if !block.is_terminated() {
                return Err(AnalysisError::UnterminatedBlock {
                    body: self.name.clone(),
                    block: id,
                });
            }
            for succ in block.successors() {
                if succ.index() >= self.basic_blocks.len() {
                    return Err(AnalysisError::InvalidSuccessor {
                        body: self.name.clone(),
                        block: id,
                        target: succ,
                    });
                }
            }
        }
        Ok(())
    }
}
