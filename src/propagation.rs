//! Forward substitution of definitions into uses (C6a). When exactly one
//! definition reaches a use and nothing along the way could redefine what
//! it reads, the use is replaced by the defining expression directly.
//! Grounded in `original_source/source/propagation.py`'s `Propagation`,
//! `InterBBPropagation`, `IntraBBPropagation`, and `InsPairUnification`.

use crate::common::Settings;
use crate::dataflow::{self, ExploreAction, ProgramPoint};
use crate::ir::block::BlockId;
use crate::ir::expr::Expr;
use crate::ir::function::Function;
use crate::ir::instruction::{is_unused_assignment, Instruction, Location};
use crate::vmcall::VmCall;

fn is_propagatable_target(e: &Expr) -> bool {
    matches!(e, Expr::Var(_) | Expr::Mem { .. } | Expr::Stack(_))
}

/// `Var`/`Stack` leaves inside `e` — the identifiers a redefinition of which
/// would invalidate propagating `e` past that point.
fn identifier_leaves(e: &Expr) -> Vec<Expr> {
    let mut out = Vec::new();
    collect_identifier_leaves(e, &mut out);
    out
}

fn collect_identifier_leaves(e: &Expr, out: &mut Vec<Expr>) {
    if dataflow::is_definitely_identified(e) {
        out.push(e.clone());
    }
    for c in e.children() {
        collect_identifier_leaves(c, out);
    }
}

fn instruction_at(func: &Function, point: ProgramPoint) -> &Instruction {
    let bb = func.block(point.node);
    if point.ins_index < bb.instructions.len() {
        &bb.instructions[point.ins_index]
    } else {
        bb.terminator.as_ref().unwrap()
    }
}

/// Checks that substituting `def_ins` (whose results are `results`, reading
/// `watch`) in place of a use at `use_point` can't change meaning: nothing it
/// reads may alias one of its own results, and nothing it reads may be
/// redefined on any path from def to use.
fn safe_to_propagate(
    func: &Function,
    settings: &Settings,
    inter_bb: bool,
    def_point: ProgramPoint,
    use_point: ProgramPoint,
    results: &[Expr],
    watch: &[Expr],
) -> bool {
    for r in watch {
        if results.iter().any(|lhs| dataflow::exprs_may_be_equal(lhs, r, true, settings)) {
            return false;
        }
    }

    let mut safe = true;
    let mut reached_use = false;
    let mut explorer = dataflow::DefUseExplorer::new(func, settings, inter_bb, true);
    let result = explorer.explore(def_point, |ins, point, _sp_offset| {
        if point == use_point {
            reached_use = true;
            return ExploreAction::StopPath;
        }
        for res in ins.results() {
            if watch.iter().any(|r| dataflow::exprs_may_be_equal(res, r, true, settings)) {
                safe = false;
                return ExploreAction::StopAll;
            }
        }
        ExploreAction::Continue
    });
    result.is_ok() && safe && reached_use
}

/// Shifts every `Stack` leaf in `e` by `delta`, re-basing a propagated
/// definition's `Stack` references when the definition and its use live in
/// different blocks and the stack pointer has shifted between them.
fn shift_stack_offsets(e: &Expr, delta: i64) -> Expr {
    if delta == 0 {
        return e.clone();
    }
    match e {
        Expr::Stack(off) => Expr::Stack(off + delta),
        other => other.map_children(&mut |child| shift_stack_offsets(&child, delta)),
    }
}

/// If `ident` (at `use_point`) has exactly one certain definition and it's
/// safe to inline, returns the defining expression, its `Stack` offsets
/// re-based by the accumulated sp offset between def and use; otherwise
/// returns `ident` unchanged. A vmcall-produced definition can't be inlined
/// as a sub-expression this way — see `propagate_vmcall_def`.
fn propagate_id(func: &Function, settings: &Settings, inter_bb: bool, ident: &Expr, use_point: ProgramPoint) -> Expr {
    if !is_propagatable_target(ident) {
        return ident.clone();
    }
    if func.params.iter().any(|p| p == ident) {
        // a function's incoming parameters have no explicit defining
        // instruction the explorer could ever find.
        return ident.clone();
    }
    let Some(defs) = dataflow::get_certain_definitions(func, settings, ident, use_point, inter_bb) else {
        return ident.clone();
    };
    if defs.len() != 1 {
        return ident.clone();
    }
    let (&def_point, &offset) = defs.iter().next().unwrap();
    let Instruction::Assign { result, value } = instruction_at(func, def_point) else {
        return ident.clone();
    };
    if matches!(value, Expr::UnusedValue) {
        return ident.clone();
    }
    let watch = identifier_leaves(value);
    if !safe_to_propagate(func, settings, inter_bb, def_point, use_point, std::slice::from_ref(result), &watch) {
        return ident.clone();
    }
    shift_stack_offsets(value, offset)
}

/// If `ident`'s single certain definition is a vmcall, returns that
/// definition's name and args (its `Stack` args re-based by the accumulated
/// sp offset). A vmcall can produce several results at once, so there is no
/// single expression to substitute for `ident`; instead the caller replaces
/// the whole use instruction — which must be a trivial copy assign of
/// `ident` — with a fresh invocation of the same vmcall bound to the use's
/// own result.
fn propagate_vmcall_def(
    func: &Function,
    settings: &Settings,
    inter_bb: bool,
    ident: &Expr,
    use_point: ProgramPoint,
) -> Option<(VmCall, Vec<Expr>)> {
    if !is_propagatable_target(ident) {
        return None;
    }
    if func.params.iter().any(|p| p == ident) {
        return None;
    }
    let defs = dataflow::get_certain_definitions(func, settings, ident, use_point, inter_bb)?;
    if defs.len() != 1 {
        return None;
    }
    let (&def_point, &offset) = defs.iter().next().unwrap();
    let Instruction::VmCall { name, args, results } = instruction_at(func, def_point) else {
        return None;
    };
    let watch: Vec<Expr> = args.iter().flat_map(identifier_leaves).collect();
    if !safe_to_propagate(func, settings, inter_bb, def_point, use_point, results, &watch) {
        return None;
    }
    let shifted = args.iter().map(|a| shift_stack_offsets(a, offset)).collect();
    Some((*name, shifted))
}

fn propagate_expr(func: &Function, settings: &Settings, inter_bb: bool, use_point: ProgramPoint, e: &Expr) -> Expr {
    let rewritten = e.map_children(&mut |child| propagate_expr(func, settings, inter_bb, use_point, &child));
    if is_propagatable_target(&rewritten) {
        propagate_id(func, settings, inter_bb, &rewritten, use_point)
    } else {
        rewritten
    }
}

/// Rewrite every *argument* expression of `ins` with `f`, leaving its
/// result/results (the LHS) untouched.
pub(crate) fn map_args(ins: &Instruction, f: impl Fn(&Expr) -> Expr) -> Instruction {
    let loc_of = |loc: &Location| match loc {
        Location::Indirect(e) => Location::Indirect(f(e)),
        other => other.clone(),
    };
    match ins {
        Instruction::Assign { result, value } => Instruction::Assign { result: result.clone(), value: f(value) },
        Instruction::Jump { loc } => Instruction::Jump { loc: loc_of(loc) },
        Instruction::Jcond { cond, loc } => Instruction::Jcond { cond: f(cond), loc: loc_of(loc) },
        Instruction::Call { target, args, results } => Instruction::Call {
            target: *target,
            args: args.iter().map(&f).collect(),
            results: results.clone(),
        },
        Instruction::VmCall { name, args, results } => Instruction::VmCall {
            name: *name,
            args: args.iter().map(&f).collect(),
            results: results.clone(),
        },
        Instruction::Ret { args } => Instruction::Ret { args: args.iter().map(&f).collect() },
        Instruction::Assertion { cond } => Instruction::Assertion { cond: f(cond) },
    }
}

/// Queues whole-instruction vmcall-copy replacements into `pending` (applied
/// only after every node in the function has been visited, mirroring the
/// original's def-use exploration running over the pre-pass function) and
/// applies ordinary sub-expression substitutions in place.
fn propagate_in_node(
    func: &mut Function,
    settings: &Settings,
    id: BlockId,
    inter_bb: bool,
    pending: &mut Vec<(ProgramPoint, Instruction)>,
) -> bool {
    let mut changed = false;
    let total = func.block(id).instructions.len();
    for idx in 0..total {
        let point = ProgramPoint { node: id, ins_index: idx };
        let ins = func.block(id).instructions[idx].clone();
        if let Instruction::Assign { result, value } = &ins {
            if is_propagatable_target(value) {
                if let Some((name, args)) = propagate_vmcall_def(func, settings, inter_bb, value, point) {
                    pending.push((point, Instruction::VmCall { name, args, results: vec![result.clone()] }));
                    continue;
                }
            }
        }
        let rewritten = map_args(&ins, |e| propagate_expr(func, settings, inter_bb, point, e));
        if rewritten != ins {
            func.block_mut(id).instructions[idx] = rewritten;
            changed = true;
        }
    }
    let point = ProgramPoint { node: id, ins_index: total };
    if let Some(term) = func.block(id).terminator.clone() {
        let rewritten = map_args(&term, |e| propagate_expr(func, settings, inter_bb, point, e));
        if rewritten != term {
            func.block_mut(id).terminator = Some(rewritten);
            changed = true;
        }
    }
    changed
}

fn apply_pending(func: &mut Function, pending: Vec<(ProgramPoint, Instruction)>) -> bool {
    let mut changed = false;
    for (point, ins) in pending {
        let bb = func.block_mut(point.node);
        if point.ins_index < bb.instructions.len() {
            bb.instructions[point.ins_index] = ins;
            changed = true;
        }
    }
    changed
}

/// Propagates across block boundaries; subsumes `intra_bb_propagation` but
/// costs a full dataflow exploration per use.
pub fn inter_bb_propagation(func: &mut Function, settings: &Settings) -> bool {
    let mut changed = false;
    let mut pending = Vec::new();
    for id in func.nodes() {
        changed |= propagate_in_node(func, settings, id, true, &mut pending);
    }
    changed |= apply_pending(func, pending);
    changed
}

/// Cheap same-block-only propagation, run first so the expensive inter-block
/// pass has less left to do.
pub fn intra_bb_propagation(func: &mut Function, settings: &Settings) -> bool {
    let mut changed = false;
    let mut pending = Vec::new();
    for id in func.nodes() {
        changed |= propagate_in_node(func, settings, id, false, &mut pending);
    }
    changed |= apply_pending(func, pending);
    changed
}

fn compatible_pair(settings: &Settings, id1: &Expr, ins2: &Instruction) -> bool {
    match ins2 {
        Instruction::Assign { result: id2, .. } => dataflow::exprs_must_be_equal(id1, id2, true),
        Instruction::VmCall { name, args, .. } if name.is_terminating() => args
            .iter()
            .flat_map(identifier_leaves)
            .all(|r| !(dataflow::exprs_may_be_equal(id1, &r, true, settings) && !dataflow::exprs_must_be_equal(id1, &r, true))),
        _ => false,
    }
}

fn rewrite_bottom_up(e: &Expr, f: &impl Fn(&Expr) -> Expr) -> Expr {
    let children = e.map_children(&mut |c| rewrite_bottom_up(&c, f));
    f(&children)
}

/// `v := rhs; v := (... v ...)` -> `v := (... rhs ...)` with the first
/// assignment dropped, when `v` is unambiguously the same variable in both.
/// Unblocks propagation in cases like `v = v/3; v = 5+v`.
pub fn ins_pair_unification(func: &mut Function, settings: &Settings, id: BlockId) -> bool {
    let instructions = func.block(id).instructions.clone();
    let live: Vec<(usize, &Instruction)> = instructions
        .iter()
        .enumerate()
        .filter(|(_, ins)| !is_unused_assignment(ins))
        .collect();

    for pair in live.windows(2) {
        let (i1, ins1) = pair[0];
        let (i2, ins2) = pair[1];
        let Instruction::Assign { result: id1, value: rhs1 } = ins1 else {
            continue;
        };
        if !compatible_pair(settings, id1, ins2) {
            continue;
        }
        let replace = |e: &Expr| {
            if dataflow::exprs_must_be_equal(e, id1, true) {
                rhs1.clone()
            } else {
                e.clone()
            }
        };
        let new_ins2 = map_args(ins2, |e| rewrite_bottom_up(e, &replace));
        if new_ins2 != *ins2 {
            let bb = func.block_mut(id);
            bb.instructions.remove(i1);
            let new_i2 = if i2 > i1 { i2 - 1 } else { i2 };
            if new_i2 < bb.instructions.len() {
                bb.instructions[new_i2] = new_ins2;
            } else {
                bb.terminator = Some(new_ins2);
            }
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::block::BasicBlock;
    use crate::ir::expr::{BinOp, VarId};

    #[test]
    fn propagates_single_definition_into_use() {
        let settings = Settings::default();
        let mut f = Function::new(0, BasicBlock::new(0));
        let v = Expr::Var(VarId::fresh());
        f.block_mut(f.header).instructions.push(Instruction::Assign {
            result: v.clone(),
            value: Expr::lit(5u64),
        });
        f.block_mut(f.header).instructions.push(Instruction::Assign {
            result: Expr::fresh_var(),
            value: Expr::BinaryOp(BinOp::Add, Box::new(v.clone()), Box::new(Expr::lit(1u64))),
        });

        let changed = inter_bb_propagation(&mut f, &settings);
        assert!(changed);
        let Instruction::Assign { value, .. } = &f.block(f.header).instructions[1] else {
            panic!("expected assign")
        };
        assert_eq!(*value, Expr::BinaryOp(BinOp::Add, Box::new(Expr::lit(5u64)), Box::new(Expr::lit(1u64))));
    }

    #[test]
    fn does_not_propagate_across_redefinition() {
        let settings = Settings::default();
        let mut f = Function::new(0, BasicBlock::new(0));
        let param = Expr::fresh_var();
        f.params.push(param.clone());
        f.num_params = 1;
        let v = Expr::fresh_var();
        // v := param + 1; param := 99; x := v
        // propagating v's definition would carry along a stale read of param.
        f.block_mut(f.header).instructions.push(Instruction::Assign {
            result: v.clone(),
            value: Expr::BinaryOp(BinOp::Add, Box::new(param.clone()), Box::new(Expr::lit(1u64))),
        });
        f.block_mut(f.header).instructions.push(Instruction::Assign {
            result: param.clone(),
            value: Expr::lit(99u64),
        });
        f.block_mut(f.header).instructions.push(Instruction::Assign {
            result: Expr::fresh_var(),
            value: v.clone(),
        });

        inter_bb_propagation(&mut f, &settings);
        let Instruction::Assign { value, .. } = &f.block(f.header).instructions[2] else {
            panic!("expected assign")
        };
        assert_eq!(*value, v);
    }

    #[test]
    fn unifies_self_referencing_pair() {
        let settings = Settings::default();
        let mut f = Function::new(0, BasicBlock::new(0));
        let v = Expr::Var(VarId::fresh());
        f.block_mut(f.header).instructions.push(Instruction::Assign {
            result: v.clone(),
            value: Expr::BinaryOp(BinOp::Div, Box::new(v.clone()), Box::new(Expr::lit(3u64))),
        });
        f.block_mut(f.header).instructions.push(Instruction::Assign {
            result: v.clone(),
            value: Expr::BinaryOp(BinOp::Add, Box::new(Expr::lit(5u64)), Box::new(v.clone())),
        });

        let changed = ins_pair_unification(&mut f, &settings, f.header);
        assert!(changed);
        assert_eq!(f.block(f.header).instructions.len(), 1);
    }
}
