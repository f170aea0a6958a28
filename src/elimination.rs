//! Dead-code elimination (C6b): drops assignments whose value is never
//! read. Grounded in `original_source/source/elimination.py`'s
//! `UnusedVariableElimination`, `LocalVariableElimination`, `DCE`,
//! `InterBBDCE`, `IntraBBDCE`.

use crate::common::Settings;
use crate::dataflow::{self, ExploreAction, ProgramPoint};
use crate::ir::block::BlockId;
use crate::ir::expr::Expr;
use crate::ir::function::Function;
use crate::ir::instruction::Instruction;

/// Drop every instruction whose result is the explicit `UnusedValue`
/// marker — it was kept around only so later passes had something concrete
/// to look for.
pub fn unused_value_elimination(func: &mut Function, id: BlockId) -> bool {
    let before = func.block(id).instructions.len();
    func.block_mut(id).instructions.retain(|ins| !crate::ir::instruction::is_unused_assignment(ins));
    func.block(id).instructions.len() != before
}

fn collect_vars(func: &Function, e: &Expr, out: &mut std::collections::HashSet<Expr>) {
    if matches!(e, Expr::Var(_)) {
        out.insert(e.clone());
    }
    for c in e.children() {
        collect_vars(func, c, out);
    }
    let _ = func;
}

/// Every `Var` read anywhere in the function, regardless of block.
fn used_vars(func: &Function) -> std::collections::HashSet<Expr> {
    let mut out = std::collections::HashSet::new();
    for id in func.nodes() {
        let bb = func.block(id);
        for ins in bb.all_instructions() {
            for arg in ins.args() {
                collect_vars(func, arg, &mut out);
            }
        }
    }
    out
}

/// A cheap, whole-function pre-pass: an assignment to a `Var` that's never
/// read anywhere is dead, full stop — no path analysis needed. Subsumed by
/// `InterBBDCE` but much cheaper, so it runs first.
pub fn local_variable_elimination(func: &mut Function) -> bool {
    let live = used_vars(func);
    let mut changed = false;
    for id in func.nodes() {
        let before = func.block(id).instructions.len();
        func.block_mut(id).instructions.retain(|ins| match ins {
            Instruction::Assign { result: Expr::Var(_), value } if !matches!(value, Expr::UnusedValue) => {
                live.contains(result_of(ins))
            }
            _ => true,
        });
        changed |= func.block(id).instructions.len() != before;
    }
    changed
}

fn result_of(ins: &Instruction) -> &Expr {
    match ins {
        Instruction::Assign { result, .. } => result,
        _ => unreachable!("result_of called on a non-assign instruction"),
    }
}

/// Is it safe to delete the instruction at `def_point`, whose sole result is
/// `var`? Walks every path forward from the definition: each one must
/// either redefine `var` (including an `UnusedValue` write) before any
/// read, or run off the end of the function (terminate) without ever
/// reading it.
fn safe_to_eliminate(func: &Function, settings: &Settings, inter_bb: bool, var: &Expr, def_point: ProgramPoint) -> bool {
    let mut used = false;
    let mut reached_redefinition = false;
    let mut terminated = false;

    let mut explorer = dataflow::DefUseExplorer::new(func, settings, inter_bb, true);
    let result = explorer.explore(def_point, |ins, _point, _sp_offset| {
        if ins.is_terminating_vmcall() || matches!(ins, Instruction::Ret { .. }) {
            terminated = true;
        }
        for res in ins.results() {
            if dataflow::exprs_may_be_equal(var, res, true, settings) {
                if dataflow::exprs_must_be_equal(var, res, true) || matches!(ins, Instruction::Assign { value: Expr::UnusedValue, .. }) {
                    reached_redefinition = true;
                    return ExploreAction::StopPath;
                }
            }
        }
        for arg in ins.args() {
            if expr_may_use(arg, var, settings) {
                used = true;
                return ExploreAction::StopAll;
            }
        }
        ExploreAction::Continue
    });

    if result.is_err() || used {
        return false;
    }
    if !inter_bb && !reached_redefinition && !terminated {
        return false;
    }
    true
}

fn expr_may_use(e: &Expr, var: &Expr, settings: &Settings) -> bool {
    if dataflow::exprs_may_be_equal(e, var, true, settings) {
        return true;
    }
    e.children().iter().any(|c| expr_may_use(c, var, settings))
}

/// Try to delete a single assignment if nothing downstream can observe its
/// absence. Never eliminates stores to `Storage`/`MappingAccess`/
/// `ArrayAccess` (too easy to get aliasing wrong there); a `Mem` store is
/// only eliminated when the path it's on is known to terminate.
fn attempt_to_eliminate(func: &Function, settings: &Settings, inter_bb: bool, id: BlockId, ins_index: usize) -> bool {
    let bb = func.block(id);
    let ins = if ins_index < bb.instructions.len() {
        &bb.instructions[ins_index]
    } else {
        return false;
    };
    let Instruction::Assign { result: var, .. } = ins else {
        return false;
    };
    if matches!(var, Expr::Storage { .. } | Expr::MappingAccess { .. } | Expr::ArrayAccess { .. }) {
        return false;
    }

    let def_point = ProgramPoint { node: id, ins_index };
    if !safe_to_eliminate(func, settings, inter_bb, var, def_point) {
        return false;
    }

    if matches!(var, Expr::Mem { .. }) {
        let terminates_here = path_from_terminates(func, settings, id, ins_index);
        if inter_bb || !terminates_here {
            return false;
        }
    }
    true
}

/// Conservative check used only for the intra-BB `Mem` exception: does the
/// straight-line path starting here hit a terminator before leaving the
/// block?
fn path_from_terminates(func: &Function, _settings: &Settings, id: BlockId, ins_index: usize) -> bool {
    let bb = func.block(id);
    if bb.instructions[ins_index..].iter().any(|ins| ins.is_terminating_vmcall()) {
        return true;
    }
    matches!(&bb.terminator, Some(t) if t.is_terminating_vmcall() || matches!(t, Instruction::Ret { .. }))
}

fn eliminate_once(func: &mut Function, settings: &Settings, inter_bb: bool) -> bool {
    for id in func.nodes() {
        let len = func.block(id).instructions.len();
        for idx in 0..len {
            if attempt_to_eliminate(func, settings, inter_bb, id, idx) {
                func.block_mut(id).instructions.remove(idx);
                return true;
            }
        }
    }
    false
}

/// Full cross-block dead-code elimination: subsumes `intra_bb_dce`.
pub fn inter_bb_dce(func: &mut Function, settings: &Settings) -> bool {
    let mut changed = false;
    while eliminate_once(func, settings, true) {
        changed = true;
    }
    changed
}

/// Cheap same-block-only dead-code elimination, run before the inter-block
/// pass to cut its work down.
pub fn intra_bb_dce(func: &mut Function, settings: &Settings) -> bool {
    let mut changed = false;
    while eliminate_once(func, settings, false) {
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::block::BasicBlock;
    use crate::ir::expr::VarId;

    #[test]
    fn unused_value_assignments_are_dropped() {
        let mut f = Function::new(0, BasicBlock::new(0));
        f.block_mut(f.header).instructions.push(Instruction::Assign {
            result: Expr::Stack(-1),
            value: Expr::UnusedValue,
        });
        let changed = unused_value_elimination(&mut f, f.header);
        assert!(changed);
        assert!(f.block(f.header).instructions.is_empty());
    }

    #[test]
    fn local_elimination_drops_never_read_vars() {
        let mut f = Function::new(0, BasicBlock::new(0));
        let dead = Expr::Var(VarId::fresh());
        f.block_mut(f.header).instructions.push(Instruction::Assign {
            result: dead.clone(),
            value: Expr::lit(1u64),
        });
        let changed = local_variable_elimination(&mut f);
        assert!(changed);
        assert!(f.block(f.header).instructions.is_empty());
    }

    #[test]
    fn local_elimination_keeps_used_vars() {
        let mut f = Function::new(0, BasicBlock::new(0));
        let v = Expr::Var(VarId::fresh());
        f.block_mut(f.header).instructions.push(Instruction::Assign {
            result: v.clone(),
            value: Expr::lit(1u64),
        });
        f.block_mut(f.header).terminator = Some(Instruction::Ret { args: vec![v] });
        let changed = local_variable_elimination(&mut f);
        assert!(!changed);
        assert_eq!(f.block(f.header).instructions.len(), 1);
    }

    #[test]
    fn dce_removes_dead_assignment_before_return() {
        let settings = Settings::default();
        let mut f = Function::new(0, BasicBlock::new(0));
        let dead = Expr::Var(VarId::fresh());
        f.block_mut(f.header).instructions.push(Instruction::Assign {
            result: dead,
            value: Expr::lit(7u64),
        });
        f.block_mut(f.header).terminator = Some(Instruction::Ret { args: vec![] });
        let changed = inter_bb_dce(&mut f, &settings);
        assert!(changed);
        assert!(f.block(f.header).instructions.is_empty());
    }

    #[test]
    fn dce_keeps_assignment_used_by_return() {
        let settings = Settings::default();
        let mut f = Function::new(0, BasicBlock::new(0));
        let v = Expr::Var(VarId::fresh());
        f.block_mut(f.header).instructions.push(Instruction::Assign {
            result: v.clone(),
            value: Expr::lit(7u64),
        });
        f.block_mut(f.header).terminator = Some(Instruction::Ret { args: vec![v] });
        let changed = inter_bb_dce(&mut f, &settings);
        assert!(!changed);
        assert_eq!(f.block(f.header).instructions.len(), 1);
    }

    #[test]
    fn dce_never_eliminates_storage_writes() {
        let settings = Settings::default();
        let mut f = Function::new(0, BasicBlock::new(0));
        f.block_mut(f.header).instructions.push(Instruction::Assign {
            result: Expr::Storage { address: Box::new(Expr::lit(0u64)) },
            value: Expr::lit(7u64),
        });
        f.block_mut(f.header).terminator = Some(Instruction::Ret { args: vec![] });
        let changed = inter_bb_dce(&mut f, &settings);
        assert!(!changed);
        assert_eq!(f.block(f.header).instructions.len(), 1);
    }
}
