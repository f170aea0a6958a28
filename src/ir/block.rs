//! Basic blocks (C2): straight-line instruction sequences joined into a
//! graph via index-based edges, per function, rather than shared-ownership
//! pointers.

use crate::common::Set;
use crate::ir::instruction::Instruction;

/// A stable index into a `Function`'s block arena. Never reused once
/// assigned, even if the block it names is later removed (merged away);
/// this keeps references recorded elsewhere (loop headers, conditional
/// follows) valid without a generation counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub usize);

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub address: u64,
    pub instructions: Vec<Instruction>,
    pub terminator: Option<Instruction>,
    /// Net stack-pointer movement contributed by this block, relative to
    /// its entry. Used to resolve `Stack` offsets across block boundaries
    /// before a function's stack variables are flattened.
    pub sp_delta: i64,
    pub successors: Set<BlockId>,
    pub predecessors: Set<BlockId>,
    /// The block reached by falling off the end without taking a branch,
    /// if any; `None` for unconditional jumps with no natural successor.
    pub next_bb: Option<BlockId>,
    /// Set once this block has been spliced out of the live graph (merged
    /// into a predecessor, or cloned away into a new function). Dead
    /// blocks are skipped by iteration helpers but keep their slot so
    /// other `BlockId`s referencing them don't dangle.
    pub removed: bool,
}

impl BasicBlock {
    pub fn new(address: u64) -> BasicBlock {
        BasicBlock {
            address,
            instructions: Vec::new(),
            terminator: None,
            sp_delta: 0,
            successors: Set::new(),
            predecessors: Set::new(),
            next_bb: None,
            removed: false,
        }
    }

    /// Instructions plus the terminator, for passes that don't care about
    /// the distinction (constant folding, generic expression rewrites).
    pub fn all_instructions(&self) -> Vec<&Instruction> {
        let mut v: Vec<&Instruction> = self.instructions.iter().collect();
        if let Some(t) = &self.terminator {
            v.push(t);
        }
        v
    }

    /// Adjacent instruction pairs, skipping unused assignments, the shape
    /// `generate_mem_seqs` and similar peephole rewrites scan over.
    pub fn instruction_pairs(&self) -> impl Iterator<Item = (&Instruction, &Instruction)> {
        let live: Vec<&Instruction> = self
            .instructions
            .iter()
            .filter(|ins| !crate::ir::instruction::is_unused_assignment(ins))
            .collect();
        live.windows(2).map(|w| (w[0], w[1])).collect::<Vec<_>>().into_iter()
    }

    pub fn has_imprecise_successors(&self) -> bool {
        use crate::ir::instruction::{Instruction as I, Location};
        match &self.terminator {
            Some(I::Jump { loc }) | Some(I::Jcond { loc, .. }) => !matches!(loc, Location::Literal(_)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_block_has_no_edges() {
        let bb = BasicBlock::new(0x10);
        assert!(bb.successors.is_empty());
        assert!(bb.predecessors.is_empty());
    }
}
