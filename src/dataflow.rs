//! Dataflow analysis (C4): the identifier equality oracle every later pass
//! builds on, plus `DefUseExplorer`, the reusable backward/forward walker
//! that subscribes to def/use events along every path from a program point.

use crate::common::{Map, Settings, Word};
use crate::ir::block::BlockId;
use crate::ir::expr::Expr;
use crate::ir::function::Function;
use crate::ir::instruction::Instruction;

/// A point in a function: "at this instruction, within this block" (the
/// terminator counts as the final instruction of its block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgramPoint {
    pub node: BlockId,
    /// Index into `node`'s instructions; `instructions.len()` denotes the
    /// terminator itself.
    pub ins_index: usize,
}

/// True only when `e1` and `e2` are provably the same identifier/value —
/// the conservative direction used to justify propagation and elimination.
pub fn exprs_must_be_equal(e1: &Expr, e2: &Expr, same_bb: bool) -> bool {
    match (e1, e2) {
        (Expr::Lit(a), Expr::Lit(b)) => a == b,
        (Expr::Var(a), Expr::Var(b)) => a == b,
        (Expr::Mem { address: a1, length: l1 }, Expr::Mem { address: a2, length: l2 }) => {
            match (a1.as_lit(), l1.as_lit(), a2.as_lit(), l2.as_lit()) {
                (Some(a1), Some(l1), Some(a2), Some(l2)) => a1 == a2 && l1 == l2,
                _ => exprs_must_be_equal(a1, a2, same_bb) && exprs_must_be_equal(l1, l2, same_bb),
            }
        }
        (Expr::Stack(a), Expr::Stack(b)) => same_bb && a == b,
        (Expr::Storage { address: a }, Expr::Storage { address: b }) => exprs_must_be_equal(a, b, same_bb),
        (Expr::GlobalVar(a), Expr::GlobalVar(b)) => a == b,
        (
            Expr::MappingAccess { mapping_num: n1, offset: o1 },
            Expr::MappingAccess { mapping_num: n2, offset: o2 },
        ) => n1 == n2 && exprs_must_be_equal(o1, o2, same_bb),
        (
            Expr::ArrayAccess { array_num: n1, offset: o1 },
            Expr::ArrayAccess { array_num: n2, offset: o2 },
        ) => n1 == n2 && exprs_must_be_equal(o1, o2, same_bb),
        (Expr::UnusedValue, Expr::UnusedValue) => true,
        _ => false,
    }
}

/// True unless `e1` and `e2` can be proven disjoint — the conservative
/// direction used to justify treating two writes as potentially aliasing.
pub fn exprs_may_be_equal(e1: &Expr, e2: &Expr, same_bb: bool, settings: &Settings) -> bool {
    match (e1, e2) {
        (Expr::Lit(a), Expr::Lit(b)) => a == b,
        (Expr::Var(a), Expr::Var(b)) => a == b,
        (Expr::Mem { address: a1, length: l1 }, Expr::Mem { address: a2, length: l2 }) => {
            if settings.simplify_free_mem_ptr && is_free_mem_ptr(e1) && is_free_mem_ptr_source(a2) {
                return false;
            }
            match (a1.as_lit(), l1.as_lit(), a2.as_lit(), l2.as_lit()) {
                (Some(a1), Some(l1), Some(a2), Some(l2)) => ranges_intersect(a1, l1, a2, l2),
                _ => true,
            }
        }
        (Expr::Stack(a), Expr::Stack(b)) => !same_bb || a == b,
        (Expr::Storage { address: a }, Expr::Storage { address: b }) => {
            match (a.as_lit(), b.as_lit()) {
                (Some(a), Some(b)) => a == b,
                _ => exprs_may_be_equal(a, b, same_bb, settings),
            }
        }
        (Expr::GlobalVar(a), Expr::GlobalVar(b)) => a == b,
        (
            Expr::MappingAccess { mapping_num: n1, offset: o1 },
            Expr::MappingAccess { mapping_num: n2, offset: o2 },
        ) => n1 == n2 && exprs_may_be_equal(o1, o2, same_bb, settings),
        (
            Expr::ArrayAccess { array_num: n1, offset: o1 },
            Expr::ArrayAccess { array_num: n2, offset: o2 },
        ) => n1 == n2 && exprs_may_be_equal(o1, o2, same_bb, settings),
        _ => std::mem::discriminant(e1) == std::mem::discriminant(e2),
    }
}

fn is_free_mem_ptr(e: &Expr) -> bool {
    matches!(e, Expr::Mem { address, length }
        if address.as_lit() == Some(Word::from(0x40u64)) && length.as_lit() == Some(Word::from(0x20u64)))
}

fn is_free_mem_ptr_source(addr: &Expr) -> bool {
    matches!(addr, Expr::Mem { .. }) && is_free_mem_ptr(addr)
}

fn ranges_intersect(a1: Word, l1: Word, a2: Word, l2: Word) -> bool {
    let end1 = a1.saturating_add(l1);
    let end2 = a2.saturating_add(l2);
    a1 < end2 && a2 < end1
}

/// Is this identifier something a second later pass could legitimately
/// treat as "defined at exactly one place" (a `Var`), as opposed to an
/// aliasable location (`Mem`, `Storage`)?
pub fn is_definitely_identified(e: &Expr) -> bool {
    matches!(e, Expr::Var(_) | Expr::Stack(_))
}

/// Backward-walk from `offset` looking for the instruction that assigned
/// that virtual-stack slot, honoring each block's `sp_delta`. Gives up the
/// moment there's more than one predecessor, matching the original's
/// conservative single-path requirement.
pub fn resolve_stackvar(func: &Function, mut offset: i64, mut node: BlockId) -> Option<ProgramPoint> {
    loop {
        let bb = func.block(node);
        for (i, ins) in bb.instructions.iter().enumerate().rev() {
            if let Instruction::Assign { result: Expr::Stack(o), .. } = ins {
                if *o == offset {
                    return Some(ProgramPoint { node, ins_index: i });
                }
            }
        }
        offset += bb.sp_delta;
        if bb.predecessors.len() != 1 {
            return None;
        }
        node = *bb.predecessors.iter().next().unwrap();
    }
}

/// Step budget exceeded during a `DefUseExplorer` walk; callers fold this
/// into "answer conservatively" rather than treating it as a hard error.
#[derive(Debug)]
pub struct ExplorationGaveUp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExploreAction {
    Continue,
    StopPath,
    StopAll,
}

/// Direction- and scope-parameterized walker over every path from a program
/// point, notifying subscribers of must-define/may-define/may-use events as
/// it goes. A single step budget (`Settings::max_steps`) bounds the whole
/// exploration.
pub struct DefUseExplorer<'a> {
    func: &'a Function,
    settings: &'a Settings,
    forward: bool,
    inter_bb: bool,
    steps: usize,
    pub path: Vec<BlockId>,
}

pub type Handler<'h> = Box<dyn FnMut(ProgramPoint) -> ExploreAction + 'h>;

impl<'a> DefUseExplorer<'a> {
    pub fn new(func: &'a Function, settings: &'a Settings, inter_bb: bool, forward: bool) -> Self {
        DefUseExplorer {
            func,
            settings,
            forward,
            inter_bb,
            steps: 0,
            path: Vec::new(),
        }
    }

    fn step(&mut self) -> Result<(), ExplorationGaveUp> {
        self.steps += 1;
        if self.steps > self.settings.max_steps {
            Err(ExplorationGaveUp)
        } else {
            Ok(())
        }
    }

    /// Shifts a running stack-pointer offset as the walk crosses from `node`
    /// into `next_node`, mirroring `dataflow.py`'s `adjust_sp_offset`: moving
    /// forward adds the node being entered's `sp_delta`; moving backward
    /// subtracts the node being left's. Either direction collapses to
    /// `None` once the walk passes through a block whose successors aren't
    /// known precisely (an unresolved indirect jump), since the offset can
    /// no longer be trusted past that point.
    fn adjust_sp_offset(&self, node: BlockId, next_node: BlockId, sp_offset: Option<i64>) -> Option<i64> {
        let mut offset = if self.forward {
            sp_offset.map(|o| o + self.func.block(next_node).sp_delta)
        } else {
            sp_offset.map(|o| o - self.func.block(node).sp_delta)
        };
        let imprecise_at = if self.forward { node } else { next_node };
        if self.func.block(imprecise_at).has_imprecise_successors() {
            offset = None;
        }
        offset
    }

    /// Explore every path from `start`, calling `on_point` for every
    /// instruction (including the terminator) encountered along the way,
    /// together with the accumulated stack-pointer offset between `start`
    /// and that point (`None` once precision has been lost to an indirect
    /// jump). `on_point` returns what to do next; the scan honors
    /// `ExploreAction::StopAll` by returning immediately, and `StopPath` by
    /// abandoning only the current path.
    pub fn explore(
        &mut self,
        start: ProgramPoint,
        mut on_point: impl FnMut(&Instruction, ProgramPoint, Option<i64>) -> ExploreAction,
    ) -> Result<(), ExplorationGaveUp> {
        let func_nodes: std::collections::BTreeSet<BlockId> = self.func.nodes().into_iter().collect();
        let mut stack: Vec<(BlockId, Vec<BlockId>, bool, Option<i64>)> = vec![(start.node, vec![], true, Some(0))];

        while let Some((node, seen, is_first, sp_offset)) = stack.pop() {
            if seen.contains(&node) || !func_nodes.contains(&node) {
                continue;
            }
            self.step()?;

            let bb = self.func.block(node);
            let total = bb.instructions.len() + 1;
            let indices: Vec<usize> = if is_first {
                if self.forward {
                    (start.ins_index + 1..total).collect()
                } else {
                    (0..start.ins_index).collect()
                }
            } else {
                (0..total).collect()
            };
            let ordered: Vec<usize> = if self.forward { indices } else { indices.into_iter().rev().collect() };

            let mut stop_path = false;
            for idx in ordered {
                let ins = if idx < bb.instructions.len() {
                    &bb.instructions[idx]
                } else {
                    match &bb.terminator {
                        Some(t) => t,
                        None => continue,
                    }
                };
                let point = ProgramPoint { node, ins_index: idx };
                match on_point(ins, point, sp_offset) {
                    ExploreAction::StopAll => return Ok(()),
                    ExploreAction::StopPath => {
                        stop_path = true;
                        break;
                    }
                    ExploreAction::Continue => {}
                }
            }
            if stop_path {
                continue;
            }

            let next: Vec<BlockId> = if self.forward {
                bb.successors.iter().copied().collect()
            } else {
                bb.predecessors.iter().copied().collect()
            };
            if next.len() > 1 && !self.inter_bb {
                return Ok(());
            }
            let mut new_seen = seen.clone();
            if !is_first {
                new_seen.push(node);
            }
            self.path = new_seen.clone();
            for n in next {
                let new_offset = self.adjust_sp_offset(node, n, sp_offset);
                stack.push((n, new_seen.clone(), false, new_offset));
            }
        }
        Ok(())
    }
}

/// Backward-walk from `use_point` collecting every definite ("must")
/// definition of `ident` reaching it, each paired with the stack-pointer
/// offset accumulated between that definition and `use_point` (so a
/// propagated `Stack` reference can be re-based into the use's frame).
/// Bails (returns `None`) the instant some path could redefine `ident`
/// ambiguously, the same definition point is reached with two different
/// offsets along different paths, the offset becomes unknowable (crossed an
/// indirect jump), or the explorer runs out of budget.
pub fn get_certain_definitions(
    func: &Function,
    settings: &Settings,
    ident: &Expr,
    use_point: ProgramPoint,
    inter_bb: bool,
) -> Option<Map<ProgramPoint, i64>> {
    let mut explorer = DefUseExplorer::new(func, settings, inter_bb, false);
    let mut defs: Map<ProgramPoint, i64> = Map::new();
    let mut aborted = false;

    let result = explorer.explore(use_point, |ins, point, sp_offset| {
        if aborted {
            return ExploreAction::StopAll;
        }
        for res in ins.results() {
            if exprs_may_be_equal(ident, res, false, settings) {
                if exprs_must_be_equal(ident, res, false) {
                    let Some(offset) = sp_offset else {
                        aborted = true;
                        return ExploreAction::StopAll;
                    };
                    if let Some(&existing) = defs.get(&point) {
                        if existing != offset {
                            aborted = true;
                            return ExploreAction::StopAll;
                        }
                    } else {
                        defs.insert(point, offset);
                    }
                    return ExploreAction::StopPath;
                } else {
                    aborted = true;
                    return ExploreAction::StopAll;
                }
            }
        }
        ExploreAction::Continue
    });

    match result {
        Ok(()) if !aborted => Some(defs),
        _ => None,
    }
}

/// Can a terminating vmcall instruction be reached from `ins`? Used by
/// safety checks that must not eliminate or reorder around a halt/revert.
pub fn is_terminating_call(ins: &Instruction) -> bool {
    matches!(ins, Instruction::VmCall { name, .. } if name.is_terminating())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::expr::VarId;

    #[test]
    fn literals_must_be_equal_only_when_identical() {
        assert!(exprs_must_be_equal(&Expr::lit(1u64), &Expr::lit(1u64), false));
        assert!(!exprs_must_be_equal(&Expr::lit(1u64), &Expr::lit(2u64), false));
    }

    #[test]
    fn stack_must_be_equal_requires_same_bb() {
        let a = Expr::Stack(-1);
        let b = Expr::Stack(-1);
        assert!(exprs_must_be_equal(&a, &b, true));
        assert!(!exprs_must_be_equal(&a, &b, false));
    }

    #[test]
    fn vars_compare_by_identity() {
        let v1 = Expr::Var(VarId::fresh());
        let v2 = Expr::Var(VarId::fresh());
        assert!(!exprs_must_be_equal(&v1, &v2, false));
        assert!(exprs_must_be_equal(&v1, &v1.clone(), false));
    }

    #[test]
    fn disjoint_literal_mem_ranges_may_not_be_equal() {
        let settings = Settings::default();
        let a = Expr::Mem {
            address: Box::new(Expr::lit(0u64)),
            length: Box::new(Expr::lit(0x20u64)),
        };
        let b = Expr::Mem {
            address: Box::new(Expr::lit(0x20u64)),
            length: Box::new(Expr::lit(0x20u64)),
        };
        assert!(!exprs_may_be_equal(&a, &b, false, &settings));
    }

    #[test]
    fn overlapping_literal_mem_ranges_may_be_equal() {
        let settings = Settings::default();
        let a = Expr::Mem {
            address: Box::new(Expr::lit(0u64)),
            length: Box::new(Expr::lit(0x20u64)),
        };
        let b = Expr::Mem {
            address: Box::new(Expr::lit(0x10u64)),
            length: Box::new(Expr::lit(0x20u64)),
        };
        assert!(exprs_may_be_equal(&a, &b, false, &settings));
    }
}
