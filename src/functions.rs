//! Function discovery (C7): turns a return-address pattern into a proper
//! call/ret pair and a freestanding `Function`, then flattens its stack
//! slots into canonical `Var`s. Grounded in
//! `original_source/source/functionid.py`'s `FunctionIdentification` and
//! `ExternalFunctionDiscovery`.

use crate::common::{Map, Set};
use crate::dataflow;
use crate::ir::block::{BasicBlock, BlockId};
use crate::ir::contract::Contract;
use crate::ir::expr::{BinOp, Expr};
use crate::ir::function::{Function, FunctionId};
use crate::ir::instruction::{Instruction, Location};
use crate::vmcall::VmCall;

fn instruction_at(func: &Function, node: BlockId, ins_index: usize) -> &Instruction {
    let bb = func.block(node);
    if ins_index < bb.instructions.len() {
        &bb.instructions[ins_index]
    } else {
        bb.terminator.as_ref().unwrap()
    }
}

fn is_indirect_jump(ins: &Instruction) -> bool {
    matches!(ins, Instruction::Jump { loc: Location::Indirect(_) })
}

fn has_calldataload(func: &Function, id: BlockId) -> bool {
    func.block(id).instructions.iter().any(|ins| {
        matches!(ins, Instruction::VmCall { name: VmCall::Calldataload, .. })
    })
}

/// Forward walk from `h` tallying net `sp_delta` to each indirect-jump
/// terminator reachable from it. Fails (returns `None`) the instant a cycle
/// reports an inconsistent delta for a node already visited.
fn compute_reachable_rets(func: &Function, h: BlockId) -> Option<(Map<BlockId, i64>, Set<BlockId>)> {
    let mut ret_deltas: Map<BlockId, i64> = Map::new();
    let mut reach: Set<BlockId> = Set::new();
    let mut stack = vec![(h, 0i64)];

    while let Some((node, delta)) = stack.pop() {
        if reach.contains(&node) {
            continue;
        }
        reach.insert(node);
        let bb = func.block(node);
        let delta = delta + bb.sp_delta;

        if let Some(term) = &bb.terminator {
            if is_indirect_jump(term) {
                match ret_deltas.get(&node) {
                    Some(&existing) if existing != delta => return None,
                    Some(_) => {}
                    None => {
                        ret_deltas.insert(node, delta);
                    }
                }
                continue;
            }
        }
        for &s in bb.successors.iter() {
            stack.push((s, delta));
        }
    }

    Some((ret_deltas, reach))
}

/// Per-node absolute sp offset relative to `h`, consistent across every path
/// that reaches a node (cycles must agree). `None` on inconsistency.
fn compute_deltas(func: &Function, h: BlockId) -> Option<Map<BlockId, i64>> {
    let mut deltas: Map<BlockId, i64> = Map::new();
    fn visit(func: &Function, node: BlockId, delta: i64, path: &mut Vec<BlockId>, deltas: &mut Map<BlockId, i64>) -> bool {
        let delta = delta + func.block(node).sp_delta;
        match deltas.get(&node) {
            Some(&existing) if existing != delta => return false,
            Some(_) => return true,
            None => {
                deltas.insert(node, delta);
            }
        }
        if path.contains(&node) {
            return true;
        }
        path.push(node);
        for &s in func.block(node).successors.iter() {
            if !visit(func, s, delta, path, deltas) {
                path.pop();
                return false;
            }
        }
        path.pop();
        true
    }

    let mut path = Vec::new();
    if visit(func, h, 0, &mut path, &mut deltas) {
        Some(deltas)
    } else {
        None
    }
}

fn rewrite_stack_offsets(e: &Expr, f: &impl Fn(i64) -> Expr) -> Expr {
    match e {
        Expr::Stack(off) => f(*off),
        other => other.map_children(&mut |child| rewrite_stack_offsets(&child, f)),
    }
}

/// Adjusts every `Stack` offset so the function's header reads as delta 0,
/// then replaces every remaining `Stack(offset)` with a canonical `Var`
/// shared by every reference to that offset. Fails if any node's delta is
/// inconsistent across incoming paths.
pub(crate) fn flatten(func: &mut Function) -> bool {
    let Some(deltas) = compute_deltas(func, func.header) else {
        return false;
    };

    for id in func.nodes() {
        let delta = deltas[&id];
        let shift = |off: i64| Expr::Stack(off - delta);
        let bb = func.block_mut(id);
        bb.instructions = bb.instructions.iter().map(|ins| ins.map_exprs(|e| rewrite_stack_offsets(e, &shift))).collect();
        bb.terminator = bb.terminator.as_ref().map(|ins| ins.map_exprs(|e| rewrite_stack_offsets(e, &shift)));
        bb.sp_delta = 0;
    }

    let mut variables: Map<i64, Expr> = Map::new();
    let canonicalize = |off: i64, variables: &mut Map<i64, Expr>| {
        variables.entry(off).or_insert_with(Expr::fresh_var).clone()
    };
    for id in func.nodes() {
        let bb = func.block_mut(id);
        bb.instructions = bb
            .instructions
            .iter()
            .map(|ins| ins.map_exprs(|e| rewrite_stack_offsets(e, &|off| canonicalize(off, &mut variables))))
            .collect();
        bb.terminator = bb
            .terminator
            .as_ref()
            .map(|ins| ins.map_exprs(|e| rewrite_stack_offsets(e, &|off| canonicalize(off, &mut variables))));
    }
    for p in func.params.iter_mut() {
        *p = rewrite_stack_offsets(p, &|off| canonicalize(off, &mut variables));
    }

    func.flattened = true;
    true
}

/// Minimum (most negative) `Stack` offset read anywhere on any path from `h`
/// up to (and including) a reachable ret; that slot is the return address.
fn compute_ret_delta(func: &Function, h: BlockId, reachable_rets: &Map<BlockId, i64>) -> Option<i64> {
    let mut result: Option<i64> = None;
    let mut stack = vec![(h, 0i64)];
    let mut seen: Set<BlockId> = Set::new();

    while let Some((node, offset)) = stack.pop() {
        if seen.contains(&node) {
            continue;
        }
        seen.insert(node);
        let bb = func.block(node);
        let offset = offset + bb.sp_delta;

        fn scan(e: &Expr, offset: i64, result: &mut Option<i64>) {
            if let Expr::Stack(o) = e {
                let total = o + offset;
                if result.map_or(true, |r| total < r) {
                    *result = Some(total);
                }
            }
            for c in e.children() {
                scan(c, offset, result);
            }
        }
        for ins in bb.all_instructions() {
            for e in ins.results().into_iter().chain(ins.args()) {
                scan(e, offset, &mut result);
            }
        }

        if reachable_rets.contains_key(&node) {
            continue;
        }
        for &s in bb.successors.iter() {
            stack.push((s, offset));
        }
    }

    result
}

/// Is `h` a viable call target (≥2 predecessors, a consistent return-address
/// slot, every non-reach predecessor a direct jump that sets it)? If so,
/// rewrite the caller's edges into a call/ret pair, flatten the callee's
/// stack, and splice it out into a brand-new `Function`.
fn attempt_function_creation(contract: &mut Contract, fid: FunctionId, h: BlockId) -> bool {
    let func = contract.function(fid);
    if func.block(h).predecessors.len() < 2 {
        return false;
    }

    let Some((reachable_rets, reach)) = compute_reachable_rets(func, h) else {
        return false;
    };
    if reachable_rets.is_empty() {
        return false;
    }

    for f in &contract.functions {
        if reach.contains(&f.header) {
            return false;
        }
    }

    for &pred in func.block(h).predecessors.iter() {
        if reach.contains(&pred) {
            continue;
        }
        let bb = func.block(pred);
        match &bb.terminator {
            Some(Instruction::Jump { loc: Location::Literal(_) }) if bb.successors.len() == 1 => {}
            _ => return false,
        }
    }

    for &r in &reach {
        if r == h {
            continue;
        }
        if func.block(r).predecessors.iter().any(|p| !reach.contains(p)) {
            return false;
        }
    }

    for &r in &reach {
        if has_calldataload(func, r) {
            return false;
        }
    }

    let Some(ret_delta) = compute_ret_delta(func, h, &reachable_rets) else {
        return false;
    };
    if ret_delta > 0 {
        return false;
    }

    let bb_delta = *reachable_rets.values().next().unwrap();
    if reachable_rets.values().any(|&d| d != bb_delta) {
        return false;
    }

    let node_addrs: Map<u64, BlockId> = func.nodes().into_iter().map(|id| (func.block(id).address, id)).collect();
    let mut ret_addrs: Map<BlockId, (u64, dataflow::ProgramPoint)> = Map::new();
    let mut def_points: Set<(BlockId, usize)> = Set::new();

    for &pred in func.block(h).predecessors.iter() {
        if reach.contains(&pred) {
            continue;
        }
        let Some(point) = dataflow::resolve_stackvar(func, ret_delta, pred) else {
            return false;
        };
        let Instruction::Assign { value, .. } = instruction_at(func, point.node, point.ins_index) else {
            return false;
        };
        let Some(lit) = value.as_lit() else {
            return false;
        };
        let addr = lit.to::<u64>();
        if !node_addrs.contains_key(&addr) {
            return false;
        }
        ret_addrs.insert(pred, (addr, point));
        def_points.insert((point.node, point.ins_index));
    }

    if def_points.len() == 1 {
        return false;
    }

    let num_params = (-ret_delta) as usize;
    let num_retvals = num_params as i64 + bb_delta + 1;
    if num_retvals < 0 {
        return false;
    }
    let num_retvals = num_retvals as usize;

    let (new_blocks, translate) = contract.function(fid).clone_subgraph(h);
    let header_addr = new_blocks[0].address;
    let new_header = translate[&h];
    let mut new_func = Function::new(header_addr, new_blocks[0].clone());
    new_func.blocks = new_blocks;
    new_func.header = new_header;
    new_func.num_params = num_params;
    new_func.num_retvals = num_retvals;
    new_func.params = (0..num_params).map(|i| Expr::Stack(-(i as i64))).rev().collect();

    let new_fid = contract.push_function(new_func);

    let func = contract.function_mut(fid);
    for (&pred, &(ret_addr, _)) in &ret_addrs {
        let args: Vec<Expr> = (-(num_params as i64) + 1..=0).map(Expr::Stack).collect();
        func.block_mut(pred).instructions.push(Instruction::Call {
            target: new_fid,
            args,
            results: Vec::new(),
        });

        let succ = node_addrs[&ret_addr];
        let old_succs: Vec<BlockId> = func.block(pred).successors.iter().copied().collect();
        for s in old_succs {
            func.remove_successor(pred, s);
        }
        func.block_mut(pred).terminator = Some(Instruction::Jump { loc: Location::Literal(ret_addr) });
        func.add_successor(pred, succ);

        func.adjust_sp_delta(pred, num_retvals as i64 - (num_params as i64 + 1));

        let retvals: Vec<Expr> = (-(num_retvals as i64) + 1..=0).map(Expr::Stack).collect();
        if let Some(Instruction::Call { results, .. }) = func.block_mut(pred).instructions.last_mut() {
            *results = retvals;
        }
    }

    for &r in &reach {
        contract.function_mut(fid).block_mut(r).removed = true;
    }

    let callee = contract.function_mut(new_fid);
    for &r in &reach {
        let new_id = translate[&r];
        if reachable_rets.contains_key(&r) {
            let retvals: Vec<Expr> = (-(num_retvals as i64) + 1..=0).map(Expr::Stack).collect();
            callee.block_mut(new_id).terminator = Some(Instruction::Ret { args: retvals });
            let old_succs: Vec<BlockId> = callee.block(new_id).successors.iter().copied().collect();
            for s in old_succs {
                callee.remove_successor(new_id, s);
            }
        }
    }

    if !flatten(callee) {
        return false;
    }
    true
}

/// Repeatedly scans a function's nodes for a viable call target and, on
/// success, restarts the scan (the rewrite invalidates both the node list
/// and the edges `attempt_function_creation` itself depends on).
pub fn identify_functions(contract: &mut Contract, fid: FunctionId) -> bool {
    if !contract.function(fid).external {
        return false;
    }
    let mut changed = false;
    loop {
        let nodes = contract.function(fid).nodes();
        let header = contract.function(fid).header;
        let mut progress = false;
        for node in nodes {
            if node == header {
                continue;
            }
            if attempt_function_creation(contract, fid, node) {
                progress = true;
                changed = true;
                break;
            }
        }
        if !progress {
            break;
        }
    }
    changed
}

pub(crate) fn matches_dispatch_pattern(ins: &Instruction) -> Option<u64> {
    let Instruction::Jcond { cond, loc: Location::Literal(_) } = ins else {
        return None;
    };
    let Expr::BinaryOp(BinOp::Eq, lhs, rhs) = cond else {
        return None;
    };
    for side in [lhs.as_ref(), rhs.as_ref()] {
        if let Some(lit) = side.as_lit() {
            let v = lit.to::<u64>();
            if v != 0 && v <= 0x1_0000_0000 {
                return Some(v);
            }
        }
    }
    None
}

fn has_call(func: &Function, id: BlockId) -> bool {
    func.block(id).instructions.iter().any(|ins| matches!(ins, Instruction::Call { .. }))
}

/// Heuristic recovery for an indirect jump's successor set: any literal
/// assigned anywhere in `subset` that happens to name a known block address
/// is a plausible target. Used by the optimizer's successor-reduction pass
/// once enough constant folding has exposed these literals. Grounded in
/// `utils.compute_indirect_jump_successors`.
pub(crate) fn compute_indirect_jump_successors(func: &Function, subset: &[BlockId]) -> Set<BlockId> {
    let valid_addrs: Map<u64, BlockId> = func
        .nodes()
        .into_iter()
        .filter(|&id| func.block(id).address != 0)
        .map(|id| (func.block(id).address, id))
        .collect();

    let mut result = Set::new();
    for &id in subset {
        for ins in &func.block(id).instructions {
            if !matches!(ins, Instruction::Assign { .. }) {
                continue;
            }
            for arg in ins.args() {
                if let Some(lit) = arg.as_lit() {
                    if let Some(&target) = valid_addrs.get(&lit.to::<u64>()) {
                        result.insert(target);
                    }
                }
            }
        }
    }
    result
}

fn make_function_at(contract: &mut Contract, caller_fid: FunctionId, calling_bb: BlockId, target: BlockId) {
    let (new_blocks, translate) = contract.function(caller_fid).clone_subgraph(target);
    let header_addr = new_blocks[0].address;
    let new_header = translate[&target];
    let mut new_func = Function::new(header_addr, new_blocks[0].clone());
    new_func.blocks = new_blocks;
    new_func.header = new_header;
    new_func.external = true;
    let new_fid = contract.push_function(new_func);

    let caller = contract.function_mut(caller_fid);
    for &old in translate.keys() {
        caller.block_mut(old).removed = true;
    }
    let old_succs: Vec<BlockId> = caller.block(calling_bb).successors.iter().copied().collect();
    for s in old_succs {
        caller.remove_successor(calling_bb, s);
    }
    caller.block_mut(calling_bb).instructions.clear();
    caller.block_mut(calling_bb).terminator = Some(Instruction::Call {
        target: new_fid,
        args: Vec::new(),
        results: Vec::new(),
    });
}

/// Walks the loader looking for `jcond(Eq(selector, Lit), target)` dispatch
/// arms; every distinct target becomes its own external `Function`, leaving
/// the dispatcher block holding a `Call` to it.
pub fn discover_external_functions(contract: &mut Contract, fid: FunctionId) -> bool {
    if contract.function(fid).address != 0 {
        return false;
    }
    let mut changed = false;
    let mut seen: Set<BlockId> = Set::new();
    let known_addrs: Set<u64> = contract.functions.iter().map(|f| f.address).collect();
    let mut stack = vec![contract.function(fid).header];

    while let Some(cur) = stack.pop() {
        if seen.contains(&cur) {
            continue;
        }
        seen.insert(cur);

        let func = contract.function(fid);
        if !func.nodes().contains(&cur) {
            continue;
        }
        if has_calldataload(func, cur) || has_call(func, cur) {
            continue;
        }

        let next_bb = func.block(cur).next_bb;
        let terminator = func.block(cur).terminator.clone();

        if let Some(term) = &terminator {
            if let Some(addr) = matches_dispatch_pattern(term) {
                if !known_addrs.contains(&addr) {
                    if let Some(target) = func.get_block_by_addr(addr) {
                        make_function_at(contract, fid, cur, target);
                        changed = true;
                    }
                }
                if let Some(n) = next_bb {
                    stack.push(n);
                }
                continue;
            }
        }

        if !func.block(cur).has_imprecise_successors() {
            for s in func.block(cur).successors.iter().copied() {
                stack.push(s);
            }
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::function::FunctionId;

    #[test]
    fn flatten_replaces_stack_with_vars() {
        let mut f = Function::new(0, BasicBlock::new(0));
        f.block_mut(f.header).instructions.push(Instruction::Assign {
            result: Expr::Stack(-1),
            value: Expr::lit(5u64),
        });
        f.block_mut(f.header).terminator = Some(Instruction::Ret { args: vec![Expr::Stack(-1)] });
        assert!(flatten(&mut f));
        for ins in f.block(f.header).all_instructions() {
            for e in ins.results().into_iter().chain(ins.args()) {
                assert!(!matches!(e, Expr::Stack(_)));
            }
        }
    }

    #[test]
    fn reachable_rets_collects_indirect_jump_terminators() {
        let mut f = Function::new(0, BasicBlock::new(0));
        f.block_mut(f.header).terminator = Some(Instruction::Jump {
            loc: Location::Indirect(Expr::Stack(0)),
        });
        let (rets, reach) = compute_reachable_rets(&f, f.header).unwrap();
        assert_eq!(rets.len(), 1);
        assert!(reach.contains(&f.header));
    }

    #[test]
    fn dispatch_pattern_extracts_selector_literal() {
        let ins = Instruction::Jcond {
            cond: Expr::BinaryOp(BinOp::Eq, Box::new(Expr::Stack(0)), Box::new(Expr::lit(0xdeadbeefu64))),
            loc: Location::Literal(0x100),
        };
        assert_eq!(matches_dispatch_pattern(&ins), Some(0xdeadbeef));
    }

    #[test]
    fn external_discovery_skips_loader_with_no_dispatch() {
        let mut contract = Contract::new(Function::new(0, BasicBlock::new(0)), vec![]);
        contract.function_mut(FunctionId(0)).block_mut(BlockId(0)).terminator =
            Some(Instruction::VmCall { name: VmCall::Stop, args: vec![], results: vec![] });
        let changed = discover_external_functions(&mut contract, FunctionId(0));
        assert!(!changed);
        assert_eq!(contract.functions.len(), 1);
    }
}
