//! Structured AST conversion (C9): turns the optimized, loop- and
//! follow-annotated CFG into a tree-shaped-as-far-as-possible program:
//! `if`/`else`, `while`, `break`, `continue`, falling back to `goto` only
//! where structuring couldn't find a shape (indirect jumps, irreducible
//! control flow). Grounded in `original_source/source/astconverter.py`'s
//! `Converter` and `absyn.py`'s node types.
//!
//! The original builds this as a graph of mutable, identity-hashed Python
//! objects — a node can be any other node's successor, and predecessor sets
//! get recomputed as the graph is rewired. Here that graph lives in the same
//! arena-plus-stable-id shape as `ir::function::Function`'s basic blocks,
//! which sidesteps the aliasing this crate otherwise avoids entirely.

use crate::common::{Map, Set};
use crate::ir::block::BlockId;
use crate::ir::contract::Contract;
use crate::ir::expr::Expr;
use crate::ir::function::{Function, FunctionId};
use crate::ir::instruction::{Instruction, Location};
use crate::structuring::Loop;

/// A stable index into a `StructuredFunction`'s node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AstNodeId(pub usize);

#[derive(Debug, Clone)]
pub enum AstNode {
    /// A straight-line run of instructions. Keeps a leftover `terminator`
    /// only when structuring couldn't turn it into anything else (an
    /// unresolved indirect jump, or a jcond that `remove_jconds` skipped);
    /// codegen renders that case as a `goto`.
    Sequence {
        address: u64,
        instructions: Vec<Instruction>,
        terminator: Option<Instruction>,
        sp_delta: i64,
        successors: Set<AstNodeId>,
    },
    /// The fallback for a jump whose target couldn't be resolved to a
    /// literal address.
    IndirectJump { dest: Expr, successors: Set<AstNodeId> },
    IfElse {
        cond: Expr,
        true_node: Option<AstNodeId>,
        false_node: Option<AstNodeId>,
        follow: Option<AstNodeId>,
    },
    Loop {
        header: AstNodeId,
        follow: Option<AstNodeId>,
    },
    Break,
    Continue,
}

impl AstNode {
    pub fn successors_list(&self) -> Vec<AstNodeId> {
        match self {
            AstNode::Sequence { successors, .. } | AstNode::IndirectJump { successors, .. } => {
                successors.iter().copied().collect()
            }
            AstNode::IfElse { true_node, false_node, follow, .. } => {
                [*true_node, *false_node, *follow].into_iter().flatten().collect()
            }
            AstNode::Loop { header, follow } => [Some(*header), *follow].into_iter().flatten().collect(),
            AstNode::Break | AstNode::Continue => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StructuredFunction {
    /// Indexes into the same `ir::Contract::functions` space this function
    /// was converted from, so a `Call`'s `FunctionId` target still resolves
    /// after `convert` sorts functions by address for display.
    pub id: FunctionId,
    pub address: u64,
    pub header: AstNodeId,
    pub nodes: Vec<AstNode>,
    pub params: Vec<Expr>,
    pub num_retvals: usize,
    pub external: bool,
}

impl StructuredFunction {
    pub fn node(&self, id: AstNodeId) -> &AstNode {
        &self.nodes[id.0]
    }

    /// Every node reachable from the header, in discovery order.
    pub fn nodes_in_order(&self) -> Vec<AstNodeId> {
        reachable_from(&self.nodes, self.header)
    }
}

#[derive(Debug, Clone)]
pub struct StructuredContract {
    pub functions: Vec<StructuredFunction>,
    pub bytecode: Vec<u8>,
    /// Which function, if any, is the constructor path discovered while
    /// decompiling deployment bytecode. `None` when converting runtime
    /// bytecode with no constructor stage of its own.
    pub constructor: Option<FunctionId>,
}

struct Converter {
    nodes: Vec<AstNode>,
    bb_to_ast: Map<BlockId, AstNodeId>,
    ast_to_bb: Map<AstNodeId, BlockId>,
}

impl Converter {
    fn push(&mut self, node: AstNode) -> AstNodeId {
        let id = AstNodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    fn convert_bb(&mut self, func: &Function, bb: BlockId) -> AstNodeId {
        if let Some(&id) = self.bb_to_ast.get(&bb) {
            return id;
        }
        let block = func.block(bb);
        let id = self.push(AstNode::Sequence {
            address: block.address,
            instructions: block.instructions.clone(),
            terminator: block.terminator.clone(),
            sp_delta: block.sp_delta,
            successors: Set::new(),
        });
        self.bb_to_ast.insert(bb, id);
        self.ast_to_bb.insert(id, bb);

        let succs: Vec<BlockId> = block.successors.iter().copied().collect();
        for s in succs {
            let s_id = self.convert_bb(func, s);
            if let AstNode::Sequence { successors, .. } = &mut self.nodes[id.0] {
                successors.insert(s_id);
            }
        }
        id
    }

    fn address_of(&self, id: AstNodeId) -> Option<u64> {
        match &self.nodes[id.0] {
            AstNode::Sequence { address, .. } => Some(*address),
            _ => None,
        }
    }
}

fn reachable_from(nodes: &[AstNode], header: AstNodeId) -> Vec<AstNodeId> {
    let mut seen: Set<AstNodeId> = Set::new();
    let mut order = Vec::new();
    let mut stack = vec![header];
    while let Some(n) = stack.pop() {
        if !seen.insert(n) {
            continue;
        }
        order.push(n);
        for s in nodes[n.0].successors_list() {
            if !seen.contains(&s) {
                stack.push(s);
            }
        }
    }
    order
}

fn run_pass(conv: &mut Converter, header: AstNodeId, f: fn(&mut Converter, AstNodeId)) {
    for id in reachable_from(&conv.nodes, header) {
        f(conv, id);
    }
}

/// Replaces an indirect `Jump` terminator with an `IndirectJump` node
/// wrapping the same successor set, so later passes never have to special
/// case "a Sequence whose terminator still computes its own target". Must
/// run before `remove_jconds`/`remove_follow_edges` so those never have to
/// decide whether to follow an edge they can't resolve.
fn remove_indirect_jumps_at(conv: &mut Converter, id: AstNodeId) {
    let info = match &conv.nodes[id.0] {
        AstNode::Sequence { terminator: Some(Instruction::Jump { loc: Location::Indirect(e) }), successors, .. } => {
            Some((e.clone(), successors.clone()))
        }
        _ => None,
    };
    let Some((dest, successors)) = info else { return };

    let ij_id = conv.push(AstNode::IndirectJump { dest, successors });
    if let AstNode::Sequence { terminator, successors, .. } = &mut conv.nodes[id.0] {
        *terminator = None;
        successors.clear();
        successors.insert(ij_id);
    }
}

/// Turns a `jcond` terminator into an `IfElse` node with its true/false
/// branches pointed at the jump-taken and fallthrough successors. Left
/// untouched if the jcond's target isn't a literal address — can't yet
/// structure an indirect conditional.
fn remove_jconds_at(conv: &mut Converter, id: AstNodeId) {
    let info = match &conv.nodes[id.0] {
        AstNode::Sequence { terminator: Some(Instruction::Jcond { cond, loc: Location::Literal(addr) }), successors, .. } => {
            Some((cond.clone(), *addr, successors.clone()))
        }
        _ => None,
    };
    let Some((cond, addr, successors)) = info else { return };
    if successors.len() != 2 {
        return;
    }

    let mut it = successors.iter().copied();
    let a = it.next().unwrap();
    let b = it.next().unwrap();
    let (jump_taken, fallthrough) = if conv.address_of(a) == Some(addr) { (a, b) } else { (b, a) };
    if conv.address_of(jump_taken) != Some(addr) {
        return;
    }
    debug_assert_ne!(jump_taken, fallthrough);

    let ifelse_id = conv.push(AstNode::IfElse {
        cond,
        true_node: Some(jump_taken),
        false_node: Some(fallthrough),
        follow: None,
    });
    if let AstNode::Sequence { terminator, successors, .. } = &mut conv.nodes[id.0] {
        *terminator = None;
        successors.clear();
        successors.insert(ifelse_id);
    }
}

/// Once a direct jump's only successor is implied by the AST edge itself,
/// the terminator carries no information codegen needs.
fn remove_direct_jumps_at(conv: &mut Converter, id: AstNodeId) {
    let drop = matches!(
        &conv.nodes[id.0],
        AstNode::Sequence { terminator: Some(Instruction::Jump { loc: Location::Literal(_) }), .. }
    );
    if drop {
        if let AstNode::Sequence { terminator, .. } = &mut conv.nodes[id.0] {
            *terminator = None;
        }
    }
}

/// A call, vmcall, or return terminator isn't control flow codegen needs to
/// render specially — it reads exactly like any other instruction, so it
/// moves into the instruction list and the terminator slot empties out.
fn move_terminators_at(conv: &mut Converter, id: AstNodeId) {
    if let AstNode::Sequence { terminator, instructions, .. } = &mut conv.nodes[id.0] {
        let movable = matches!(terminator, Some(Instruction::VmCall { .. } | Instruction::Ret { .. } | Instruction::Call { .. }));
        if movable {
            instructions.push(terminator.take().unwrap());
        }
    }
}

fn set_conditional_follows_at(conv: &mut Converter, fid: FunctionId, follows: &Map<(FunctionId, BlockId), BlockId>, id: AstNodeId) {
    let succ = match &conv.nodes[id.0] {
        AstNode::Sequence { successors, .. } if successors.len() == 1 => *successors.iter().next().unwrap(),
        _ => return,
    };
    if !matches!(conv.nodes[succ.0], AstNode::IfElse { .. }) {
        return;
    }
    let Some(&orig_bb) = conv.ast_to_bb.get(&id) else { return };
    let Some(&follow_bb) = follows.get(&(fid, orig_bb)) else { return };
    let Some(&follow_ast) = conv.bb_to_ast.get(&follow_bb) else { return };
    if let AstNode::IfElse { follow, .. } = &mut conv.nodes[succ.0] {
        *follow = Some(follow_ast);
    }
}

fn replace_successor(conv: &mut Converter, id: AstNodeId, old: AstNodeId, new: AstNodeId) {
    match &mut conv.nodes[id.0] {
        AstNode::Sequence { successors, .. } | AstNode::IndirectJump { successors, .. } => {
            successors.remove(&old);
            successors.insert(new);
        }
        AstNode::IfElse { true_node, false_node, follow, .. } => {
            if *true_node == Some(old) {
                *true_node = Some(new);
            } else if *false_node == Some(old) {
                *false_node = Some(new);
            } else {
                debug_assert_eq!(*follow, Some(old));
                *follow = Some(new);
            }
        }
        AstNode::Loop { follow, .. } => {
            debug_assert_eq!(*follow, Some(old));
            *follow = Some(new);
        }
        AstNode::Break | AstNode::Continue => unreachable!("leaf node has no successor to replace"),
    }
}

fn compute_ast_preds(conv: &Converter, header: AstNodeId) -> Map<AstNodeId, Set<AstNodeId>> {
    let mut preds: Map<AstNodeId, Set<AstNodeId>> = Map::new();
    let mut seen: Set<AstNodeId> = Set::new();
    let mut stack = vec![header];
    while let Some(n) = stack.pop() {
        if !seen.insert(n) {
            continue;
        }
        for s in conv.nodes[n.0].successors_list() {
            preds.entry(s).or_default().insert(n);
            if !seen.contains(&s) {
                stack.push(s);
            }
        }
    }
    preds
}

/// Walks everything reachable from `cur` inside the loop, redirecting edges
/// back to the header into fresh `Continue` nodes and edges out to the
/// follow into fresh `Break` nodes. `seen` stops this from looping forever
/// on the loop's own back edge.
fn replace_loop_edges(conv: &mut Converter, header: AstNodeId, follow: Option<AstNodeId>, cur: AstNodeId, seen: &mut Set<AstNodeId>) {
    if !seen.insert(cur) {
        return;
    }
    for s in conv.nodes[cur.0].successors_list() {
        if s == header {
            let cont = conv.push(AstNode::Continue);
            replace_successor(conv, cur, s, cont);
        } else if Some(s) == follow {
            let brk = conv.push(AstNode::Break);
            replace_successor(conv, cur, s, brk);
        } else {
            replace_loop_edges(conv, header, follow, s, seen);
        }
    }
}

/// Materializes every structured loop as a `Loop` AST node, splices it in
/// before its header (rewiring every predecessor that isn't itself inside
/// the loop), and patches up any other loop or conditional whose follow
/// pointed at the now-replaced header.
fn fix_loops(conv: &mut Converter, header: &mut AstNodeId, cfg_loops: &[Loop]) {
    let mut loop_ast_ids = Vec::new();
    for l in cfg_loops {
        let Some(&header_ast) = conv.bb_to_ast.get(&l.header) else { continue };
        let follow_ast = l.follow.and_then(|f| conv.bb_to_ast.get(&f).copied());
        let loop_id = conv.push(AstNode::Loop { header: header_ast, follow: follow_ast });
        loop_ast_ids.push(loop_id);
    }

    for &loop_id in &loop_ast_ids {
        let (header_node, follow_node) = match &conv.nodes[loop_id.0] {
            AstNode::Loop { header, follow } => (*header, *follow),
            _ => unreachable!(),
        };

        let mut seen = Set::new();
        replace_loop_edges(conv, header_node, follow_node, header_node, &mut seen);

        let preds = compute_ast_preds(conv, *header);
        if let Some(pred_set) = preds.get(&header_node) {
            let pred_list: Vec<AstNodeId> = pred_set.iter().copied().collect();
            for pred in pred_list {
                if !seen.contains(&pred) {
                    replace_successor(conv, pred, header_node, loop_id);
                }
            }
        }
        if *header == header_node {
            *header = loop_id;
        }

        for &other in &loop_ast_ids {
            if other == loop_id {
                continue;
            }
            if let AstNode::Loop { follow, .. } = &mut conv.nodes[other.0] {
                if *follow == Some(header_node) {
                    *follow = Some(loop_id);
                }
            }
        }
        for node in conv.nodes.iter_mut() {
            if let AstNode::IfElse { follow, .. } = node {
                if *follow == Some(header_node) {
                    *follow = Some(loop_id);
                }
            }
        }
    }
}

fn remove_follow_edges_at(conv: &mut Converter, id: AstNodeId) {
    let (true_node, false_node, follow) = match &conv.nodes[id.0] {
        AstNode::IfElse { true_node, false_node, follow, .. } => (*true_node, *false_node, *follow),
        _ => return,
    };
    let Some(follow) = follow else { return };

    if true_node == Some(follow) {
        if let AstNode::IfElse { true_node, .. } = &mut conv.nodes[id.0] {
            *true_node = None;
        }
    } else if let Some(t) = true_node {
        do_remove_follow_edges(conv, id, t, follow);
    }

    if false_node == Some(follow) {
        if let AstNode::IfElse { false_node, .. } = &mut conv.nodes[id.0] {
            *false_node = None;
        }
    } else if let Some(f) = false_node {
        do_remove_follow_edges(conv, id, f, follow);
    }
}

fn do_remove_follow_edges(conv: &mut Converter, orig: AstNodeId, start: AstNodeId, follow: AstNodeId) {
    let mut seen: Set<AstNodeId> = Set::new();
    let mut stack = vec![start];
    while let Some(n) = stack.pop() {
        if !seen.insert(n) {
            continue;
        }
        if matches!(conv.nodes[n.0], AstNode::IndirectJump { .. }) {
            continue;
        }
        if n == orig {
            continue;
        }
        for s in conv.nodes[n.0].successors_list() {
            if s == follow {
                remove_follow(conv, n, follow);
            } else {
                stack.push(s);
            }
        }
    }
}

fn remove_follow(conv: &mut Converter, n: AstNodeId, follow: AstNodeId) {
    match &mut conv.nodes[n.0] {
        AstNode::Sequence { successors, .. } => {
            debug_assert!(successors.len() == 1 && successors.contains(&follow));
            successors.clear();
        }
        AstNode::Loop { follow: loop_follow, .. } => {
            debug_assert_eq!(*loop_follow, Some(follow));
            *loop_follow = None;
        }
        AstNode::IfElse { true_node, false_node, follow: f, .. } => {
            if *f == Some(follow) {
                *f = None;
            }
            debug_assert!(*false_node != Some(follow) || *true_node != Some(follow));
            if *true_node == Some(follow) {
                debug_assert!(false_node.is_some());
                *true_node = None;
            }
            if *false_node == Some(follow) {
                debug_assert!(true_node.is_some());
                *false_node = None;
            }
        }
        other => unreachable!("remove_follow called on {other:?}, which has no follow edge"),
    }
}

fn sanity_check(nodes: &[AstNode], header: AstNodeId) {
    if !cfg!(debug_assertions) {
        return;
    }
    for id in reachable_from(nodes, header) {
        if let AstNode::IfElse { true_node, false_node, .. } = &nodes[id.0] {
            debug_assert!(true_node.is_some() || false_node.is_some(), "an IfElse with both branches removed goes nowhere");
        }
    }
}

fn convert_function(func: &Function, fid: FunctionId, cfg_loops: &[Loop], follows: &Map<(FunctionId, BlockId), BlockId>) -> StructuredFunction {
    let mut conv = Converter { nodes: Vec::new(), bb_to_ast: Map::new(), ast_to_bb: Map::new() };
    let mut header = conv.convert_bb(func, func.header);

    // Order matters: indirect jumps must be walled off into their own node
    // before jconds/direct-jumps/follow-removal run, so those passes never
    // have to reason about an edge they can't resolve.
    run_pass(&mut conv, header, remove_indirect_jumps_at);
    run_pass(&mut conv, header, remove_jconds_at);
    run_pass(&mut conv, header, remove_direct_jumps_at);
    run_pass(&mut conv, header, move_terminators_at);

    for id in reachable_from(&conv.nodes, header) {
        set_conditional_follows_at(&mut conv, fid, follows, id);
    }

    fix_loops(&mut conv, &mut header, cfg_loops);

    run_pass(&mut conv, header, remove_follow_edges_at);

    sanity_check(&conv.nodes, header);

    StructuredFunction {
        id: fid,
        address: func.address,
        header,
        nodes: conv.nodes,
        params: func.params.clone(),
        num_retvals: func.num_retvals,
        external: func.external,
    }
}

/// Converts every function in `contract` into its structured form, given
/// the loops and conditional follows already discovered over its CFG, and
/// which function (if any) is the constructor entry point.
pub fn convert(
    contract: &Contract,
    loops: &[Loop],
    follows: &Map<(FunctionId, BlockId), BlockId>,
    constructor: Option<FunctionId>,
) -> StructuredContract {
    let mut functions = Vec::new();
    for (idx, func) in contract.functions.iter().enumerate() {
        let fid = FunctionId(idx);
        let func_loops: Vec<Loop> = loops.iter().filter(|l| l.function == fid).cloned().collect();
        functions.push(convert_function(func, fid, &func_loops, follows));
    }
    functions.sort_by_key(|f| f.address);

    StructuredContract { functions, bytecode: contract.bytecode.clone(), constructor }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::block::BasicBlock;
    use crate::ir::expr::Expr;

    fn no_loops() -> Vec<Loop> {
        Vec::new()
    }
    fn no_follows() -> Map<(FunctionId, BlockId), BlockId> {
        Map::new()
    }

    #[test]
    fn straight_line_function_becomes_one_sequence_with_no_terminator() {
        let mut f = Function::new(0, BasicBlock::new(0));
        f.block_mut(f.header).terminator = Some(Instruction::Ret { args: vec![] });
        let sf = convert_function(&f, FunctionId(0), &no_loops(), &no_follows());
        assert_eq!(sf.nodes.len(), 1);
        match &sf.nodes[sf.header.0] {
            AstNode::Sequence { terminator, instructions, .. } => {
                assert!(terminator.is_none());
                assert_eq!(instructions.last(), Some(&Instruction::Ret { args: vec![] }));
            }
            other => panic!("expected a Sequence, got {other:?}"),
        }
    }

    #[test]
    fn diamond_becomes_ifelse_with_follow_removed() {
        let mut f = Function::new(0, BasicBlock::new(0));
        let true_branch = f.push_block(BasicBlock::new(1));
        let false_branch = f.push_block(BasicBlock::new(2));
        let follow = f.push_block(BasicBlock::new(3));

        f.block_mut(f.header).terminator = Some(Instruction::Jcond {
            cond: Expr::lit(1u64),
            loc: Location::Literal(1),
        });
        f.add_successor(f.header, true_branch);
        f.add_successor(f.header, false_branch);
        f.block_mut(true_branch).terminator = Some(Instruction::Jump { loc: Location::Literal(3) });
        f.add_successor(true_branch, follow);
        f.block_mut(false_branch).terminator = Some(Instruction::Jump { loc: Location::Literal(3) });
        f.add_successor(false_branch, follow);
        f.block_mut(follow).terminator = Some(Instruction::Ret { args: vec![] });

        let mut follows = Map::new();
        follows.insert((FunctionId(0), f.header), follow);

        let sf = convert_function(&f, FunctionId(0), &no_loops(), &follows);

        let AstNode::Sequence { successors, .. } = &sf.nodes[sf.header.0] else { panic!("expected Sequence header") };
        assert_eq!(successors.len(), 1);
        let ifelse_id = *successors.iter().next().unwrap();
        let (true_node, false_node) = match &sf.nodes[ifelse_id.0] {
            AstNode::IfElse { true_node, false_node, follow: f, .. } => {
                assert!(f.is_some());
                (true_node.expect("true branch kept, only its edge to follow is pruned"), false_node.expect("false branch kept"))
            }
            other => panic!("expected an IfElse, got {other:?}"),
        };
        // both branches jumped straight to the follow; remove_follow_edges
        // should have severed that edge rather than nulling the branch out.
        for branch in [true_node, false_node] {
            match &sf.nodes[branch.0] {
                AstNode::Sequence { successors, .. } => assert!(successors.is_empty()),
                other => panic!("expected a Sequence branch, got {other:?}"),
            }
        }
    }

    #[test]
    fn loop_header_gets_spliced_in_with_continue_and_break() {
        let mut f = Function::new(0, BasicBlock::new(0));
        let body = f.push_block(BasicBlock::new(1));
        let follow = f.push_block(BasicBlock::new(2));

        f.block_mut(f.header).terminator = Some(Instruction::Jcond {
            cond: Expr::lit(1u64),
            loc: Location::Literal(1),
        });
        f.add_successor(f.header, body);
        f.add_successor(f.header, follow);
        f.block_mut(body).terminator = Some(Instruction::Jump { loc: Location::Literal(0) });
        f.add_successor(body, f.header);
        f.block_mut(follow).terminator = Some(Instruction::Ret { args: vec![] });

        let l = Loop {
            function: FunctionId(0),
            header: f.header,
            follow: Some(follow),
            nodes: [f.header, body].into_iter().collect(),
        };

        let sf = convert_function(&f, FunctionId(0), std::slice::from_ref(&l), &no_follows());

        match &sf.nodes[sf.header.0] {
            AstNode::Loop { .. } => {}
            other => panic!("expected the function header to become a Loop, got {other:?}"),
        }
    }
}
