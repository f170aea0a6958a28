//! The middle-end fixed-point driver (C3's output feeds C5/C6/C7 through
//! here). Grounded directly in `original_source/source/middleend.py`'s
//! `Optimizer` and `otheranalyses.py`'s `SuccessorReduction`,
//! `PredecessorReduction`, `BBMerging`, and `AssertReconstruction`.
//!
//! Passes are grouped exactly as the original groups them: cheap passes run
//! to a local fixed point first; only once none of them can make further
//! progress do the expensive ones run, then function discovery, then the
//! passes deliberately delayed to the very end so they see the cleanest
//! possible function.

use crate::common::{Set, Settings};
use crate::elimination;
use crate::functions;
use crate::ir::block::BlockId;
use crate::ir::contract::{AddressDispenser, Contract};
use crate::ir::expr::{Expr, UnOp};
use crate::ir::function::{Function, FunctionId};
use crate::ir::instruction::{Instruction, Location};
use crate::propagation;
use crate::rewrites;
use crate::vmcall::VmCall;

fn backward_reach(func: &Function, from: BlockId) -> Vec<BlockId> {
    let mut seen: Set<BlockId> = Set::new();
    let mut order = Vec::new();
    let mut stack = vec![from];
    while let Some(n) = stack.pop() {
        if !seen.insert(n) {
            continue;
        }
        order.push(n);
        for &p in func.block(n).predecessors.iter() {
            stack.push(p);
        }
    }
    order
}

/// Recomputes each node's successor set from its terminator, now that
/// constant folding may have exposed a literal jump target or narrowed an
/// indirect jump's candidates. Two rounds: the first computes every node's
/// replacement set, the second applies them, so a node visited early in
/// round one never sees another node's round-one update to its own
/// predecessors.
fn successor_reduction(func: &mut Function) -> bool {
    let mut updates: Vec<(BlockId, Set<BlockId>)> = Vec::new();

    for id in func.nodes() {
        let bb = func.block(id);
        let new_succs = match &bb.terminator {
            Some(Instruction::Jump { loc: Location::Literal(addr) }) => {
                func.get_block_by_addr(*addr).into_iter().collect()
            }
            Some(Instruction::Jcond { loc: Location::Literal(addr), .. }) => {
                let mut s: Set<BlockId> = func.get_block_by_addr(*addr).into_iter().collect();
                if let Some(next) = bb.next_bb {
                    s.insert(next);
                }
                s
            }
            Some(Instruction::Jump { loc: Location::Indirect(_) }) => {
                let backward = backward_reach(func, id);
                functions::compute_indirect_jump_successors(func, &backward)
            }
            Some(Instruction::Jcond { loc: Location::Indirect(_), .. }) => {
                let backward = backward_reach(func, id);
                let mut s = functions::compute_indirect_jump_successors(func, &backward);
                if let Some(next) = bb.next_bb {
                    s.insert(next);
                }
                s
            }
            _ => continue,
        };
        updates.push((id, new_succs));
    }

    let mut changed = false;
    for (id, new_succs) in updates {
        // an empty heuristic result means "no improvement found yet", not
        // "this node has no successors" - never apply it.
        if new_succs.is_empty() {
            continue;
        }
        let old_succs: Vec<BlockId> = func.block(id).successors.iter().copied().collect();
        if new_succs.len() < old_succs.len() {
            for s in old_succs {
                func.remove_successor(id, s);
            }
            for s in new_succs {
                func.add_successor(id, s);
            }
            changed = true;
        }
    }
    changed
}

/// A predecessor edge pointing at a live node from a block that's dropped
/// out of `nodes()` (removed by a previous split) is stale; clear it so the
/// live node's predecessor set only ever names blocks actually reachable.
fn predecessor_reduction(func: &mut Function) -> bool {
    let mut changed = false;
    let live: Set<BlockId> = func.nodes().into_iter().collect();
    for &id in &live {
        let preds: Vec<BlockId> = func.block(id).predecessors.iter().copied().collect();
        for p in preds {
            if !live.contains(&p) {
                func.remove_successor(p, id);
                changed = true;
            }
        }
    }
    changed
}

/// Undoes straight-line "goto" edges: a block that unconditionally jumps to
/// a literal target which has no other predecessor (and isn't the header)
/// gets that target spliced directly into it.
fn bb_merge(func: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let mut merged = false;
        for id in func.nodes() {
            let bb = func.block(id);
            if !matches!(bb.terminator, Some(Instruction::Jump { loc: Location::Literal(_) })) {
                continue;
            }
            if bb.successors.len() != 1 {
                continue;
            }
            let succ = *bb.successors.iter().next().unwrap();
            if succ == func.header {
                continue;
            }
            if func.block(succ).predecessors.len() != 1 {
                continue;
            }
            func.merge(id, succ);
            changed = true;
            merged = true;
            break;
        }
        if !merged {
            break;
        }
    }
    changed
}

fn looks_like_revert(func: &Function, n: BlockId) -> bool {
    let bb = func.block(n);
    if bb.address == 0 {
        // jumping back into the loader's initial bytes always runs out of
        // gas eventually; a compiler emits this instead of an explicit
        // revert when it can share the trap across call sites.
        return true;
    }
    bb.instructions.is_empty()
        && matches!(&bb.terminator, Some(Instruction::VmCall { name: VmCall::Revert, .. }))
}

/// `jcond(x, R); R: revert(...)` (or the same with the branches swapped) is
/// a compiled `require`/`assert`; reconstructing it as an explicit assertion
/// lets `bb_merge` fuse the two blocks the compiler only split apart for the
/// trap. Skips jconds that look like a calldata-selector dispatch arm,
/// which happens to have the same two-literal-target shape.
fn assert_reconstruction(func: &mut Function, id: BlockId) -> bool {
    let Some(term) = func.block(id).terminator.clone() else {
        return false;
    };
    let Instruction::Jcond { cond, loc: Location::Literal(target_addr) } = &term else {
        return false;
    };
    if functions::matches_dispatch_pattern(&term).is_some() {
        return false;
    }
    let Some(next) = func.block(id).next_bb else { return false };
    let Some(taken) = func.get_block_by_addr(*target_addr) else { return false };

    let (other, new_cond) = if looks_like_revert(func, taken) {
        (next, Expr::UnaryOp(UnOp::Not, Box::new(cond.clone())))
    } else if looks_like_revert(func, next) {
        (taken, cond.clone())
    } else {
        return false;
    };

    func.block_mut(id).instructions.push(Instruction::Assertion { cond: new_cond });
    let other_addr = func.block(other).address;
    let old_succs: Vec<BlockId> = func.block(id).successors.iter().copied().collect();
    for s in old_succs {
        func.remove_successor(id, s);
    }
    func.block_mut(id).terminator = Some(Instruction::Jump { loc: Location::Literal(other_addr) });
    func.add_successor(id, other);
    true
}

fn apply_assert_reconstruction(func: &mut Function) -> bool {
    let mut changed = false;
    for id in func.nodes() {
        changed |= assert_reconstruction(func, id);
    }
    changed
}

/// Replaces every `Stack` slot with a canonical `Var`, once the function's
/// successor graph has stopped changing shape (an imprecise successor set
/// means there may still be unseen paths through the stack).
fn stack_flattening(func: &mut Function) -> bool {
    if func.flattened {
        return false;
    }
    for id in func.nodes() {
        if func.block(id).has_imprecise_successors() {
            return false;
        }
    }
    functions::flatten(func)
}

fn apply_unused_value_elimination(func: &mut Function) -> bool {
    let mut changed = false;
    for id in func.nodes() {
        changed |= elimination::unused_value_elimination(func, id);
    }
    changed
}

fn apply_ins_pair_unification(func: &mut Function, settings: &Settings) -> bool {
    let mut changed = false;
    for id in func.nodes() {
        changed |= propagation::ins_pair_unification(func, settings, id);
    }
    changed
}

/// Runs `rewrite_node` over every block to a local fixed point, matching
/// the original `Rewrites.optimize`'s own inner loop.
fn apply_rewrites(func: &mut Function, settings: &Settings, dispenser: &AddressDispenser) -> bool {
    let mut changed = false;
    loop {
        let mut progress = false;
        for id in func.nodes() {
            progress |= rewrites::rewrite_node(func, id, settings, dispenser);
        }
        changed |= progress;
        if !progress {
            break;
        }
    }
    changed
}

/// Re-checks the structural invariants every pass implicitly relies on:
/// unique block addresses and successor/predecessor symmetry among live
/// nodes. Compiled out in release builds, same as the rest of the crate's
/// `debug_assert!` usage.
fn sanity_check(func: &Function) {
    if !cfg!(debug_assertions) {
        return;
    }
    let nodes = func.nodes();
    let mut seen_addrs: Set<u64> = Set::new();
    for &id in &nodes {
        let bb = func.block(id);
        debug_assert!(seen_addrs.insert(bb.address), "duplicate block address {:#x}", bb.address);
        for &s in bb.successors.iter() {
            debug_assert!(func.block(s).predecessors.contains(&id));
        }
        for &p in bb.predecessors.iter() {
            debug_assert!(func.block(p).successors.contains(&id));
        }
    }
}

/// Drives every pass against a single function until none of them change
/// anything. Mirrors `Optimizer.optimize_until_fixed_point`'s four rounds:
/// cheap, expensive, delayed (external-function discovery), and
/// more-delayed (BB merging, final unused-value cleanup).
fn optimize_function(contract: &mut Contract, fid: FunctionId, settings: &Settings, dispenser: &AddressDispenser) -> bool {
    let mut changed = false;
    loop {
        let mut round_changed = false;

        {
            let func = contract.function_mut(fid);
            round_changed |= successor_reduction(func);
            round_changed |= predecessor_reduction(func);
            round_changed |= elimination::local_variable_elimination(func);
            round_changed |= elimination::intra_bb_dce(func, settings);
            round_changed |= propagation::intra_bb_propagation(func, settings);
            round_changed |= apply_ins_pair_unification(func, settings);
            round_changed |= apply_assert_reconstruction(func);
            round_changed |= stack_flattening(func);
            sanity_check(func);
        }
        if round_changed {
            changed = true;
            continue;
        }

        {
            let func = contract.function_mut(fid);
            round_changed |= elimination::inter_bb_dce(func, settings);
            round_changed |= propagation::inter_bb_propagation(func, settings);
            round_changed |= apply_rewrites(func, settings, dispenser);
            sanity_check(func);
        }
        round_changed |= functions::identify_functions(contract, fid);
        if round_changed {
            changed = true;
            continue;
        }

        round_changed |= functions::discover_external_functions(contract, fid);
        if round_changed {
            changed = true;
            continue;
        }

        {
            let func = contract.function_mut(fid);
            round_changed |= bb_merge(func);
            round_changed |= apply_unused_value_elimination(func);
            sanity_check(func);
        }
        if !round_changed {
            break;
        }
        changed = true;
    }
    changed
}

/// Runs every function in the contract (including ones discovered partway
/// through, since `functions` appends new entries as it splits callees out)
/// to its own local fixed point.
pub fn optimize_contract(contract: &mut Contract, settings: &Settings, dispenser: &AddressDispenser) -> bool {
    let mut changed = false;
    let mut idx = 0;
    while idx < contract.functions.len() {
        let fid = FunctionId(idx);
        changed |= optimize_function(contract, fid, settings, dispenser);
        idx += 1;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::block::BasicBlock;
    use crate::ir::expr::VarId;

    fn single_block_loader() -> Contract {
        let f = Function::new(0, BasicBlock::new(0));
        Contract::new(f, vec![])
    }

    #[test]
    fn optimize_contract_removes_dead_assignment() {
        let mut contract = single_block_loader();
        let settings = Settings::default();
        let dispenser = AddressDispenser::starting_after(0);

        let dead = Expr::Var(VarId::fresh());
        let fid = contract.loader();
        let header = contract.function(fid).header;
        contract.function_mut(fid).block_mut(header).instructions.push(Instruction::Assign {
            result: dead,
            value: Expr::lit(7u64),
        });
        contract.function_mut(fid).block_mut(header).terminator = Some(Instruction::VmCall {
            name: VmCall::Stop,
            args: vec![],
            results: vec![],
        });

        let changed = optimize_contract(&mut contract, &settings, &dispenser);
        assert!(changed);
        assert!(contract.function(fid).block(header).instructions.is_empty());
    }

    #[test]
    fn bb_merge_fuses_straight_line_jump() {
        let mut f = Function::new(0, BasicBlock::new(0));
        let succ = f.push_block(BasicBlock::new(1));
        f.block_mut(f.header).terminator = Some(Instruction::Jump { loc: Location::Literal(1) });
        f.add_successor(f.header, succ);
        f.block_mut(succ).terminator = Some(Instruction::VmCall {
            name: VmCall::Stop,
            args: vec![],
            results: vec![],
        });

        let changed = bb_merge(&mut f);
        assert!(changed);
        assert!(f.block(succ).removed);
        assert_eq!(
            f.block(f.header).terminator,
            Some(Instruction::VmCall { name: VmCall::Stop, args: vec![], results: vec![] })
        );
    }

    #[test]
    fn assert_reconstruction_folds_guarded_revert() {
        let mut f = Function::new(0, BasicBlock::new(0));
        let revert_bb = f.push_block(BasicBlock::new(0x20));
        f.block_mut(revert_bb).terminator = Some(Instruction::VmCall {
            name: VmCall::Revert,
            args: vec![],
            results: vec![],
        });
        let next = f.push_block(BasicBlock::new(0x30));
        f.block_mut(f.header).next_bb = Some(next);
        let cond = Expr::Var(VarId::fresh());
        f.block_mut(f.header).terminator = Some(Instruction::Jcond {
            cond: cond.clone(),
            loc: Location::Literal(0x20),
        });
        f.add_successor(f.header, revert_bb);
        f.add_successor(f.header, next);

        let changed = assert_reconstruction(&mut f, f.header);
        assert!(changed);
        assert_eq!(
            f.block(f.header).instructions.last(),
            Some(&Instruction::Assertion { cond: Expr::UnaryOp(UnOp::Not, Box::new(cond)) })
        );
        assert_eq!(f.block(f.header).terminator, Some(Instruction::Jump { loc: Location::Literal(0x30) }));
    }

    #[test]
    fn predecessor_reduction_drops_edge_from_removed_block() {
        let mut f = Function::new(0, BasicBlock::new(0));
        let stale = f.push_block(BasicBlock::new(1));
        let live = f.push_block(BasicBlock::new(2));
        f.add_successor(stale, live);
        f.block_mut(stale).removed = true;

        let changed = predecessor_reduction(&mut f);
        assert!(changed);
        assert!(!f.block(live).predecessors.contains(&stale));
    }
}
