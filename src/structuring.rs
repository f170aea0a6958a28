//! Control-flow structuring (C8): recovers loop bodies and if/else follow
//! nodes from the optimized CFG so C9 can turn it into nested statements
//! instead of gotos. Grounded in `original_source/source/cfa.py`'s
//! `LoopStructuring` and `ConditionalFollowDiscoverer`, with node numbering
//! ported from `numbering.py`'s `NumberComputer`.
//!
//! The interval algorithm (Cifuentes, "Reverse Compilation Techniques")
//! collapses the CFG one interval at a time until either a single node
//! remains or `Settings::max_interval_iterations` is hit; indirect jumps
//! that haven't been resolved yet are the usual reason a graph stays
//! irreducible.

use crate::common::{Map, Set, Settings};
use crate::ir::block::BlockId;
use crate::ir::contract::Contract;
use crate::ir::function::{Function, FunctionId};
use crate::ir::instruction::{Instruction, Location};

/// A structured loop: the header and, if control can fall out to a single
/// place, the follow node it falls out to. `nodes` is every block the loop
/// body owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loop {
    pub function: FunctionId,
    pub header: BlockId,
    pub follow: Option<BlockId>,
    pub nodes: Set<BlockId>,
}

impl Loop {
    pub fn contains(&self, bb: BlockId) -> bool {
        self.nodes.contains(&bb)
    }
}

/// An interval-collapsing node id; fresh per round, scoped to one
/// `IntervalGraph` instance.
type INode = usize;

/// The interval algorithm's working graph: starts out one node per basic
/// block, then gets collapsed one interval at a time. Distinct from
/// `Function`'s own block arena because a single `IntervalGraph` node can
/// come to wrap many original blocks.
struct IntervalGraph {
    header: INode,
    bbs: Map<INode, Set<BlockId>>,
    header_bb: Map<INode, BlockId>,
    successors: Map<INode, Set<INode>>,
    predecessors: Map<INode, Set<INode>>,
}

impl IntervalGraph {
    fn nodes(&self) -> Vec<INode> {
        let mut seen: Set<INode> = Set::new();
        let mut stack = vec![self.header];
        let mut order = Vec::new();
        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            order.push(n);
            if let Some(succs) = self.successors.get(&n) {
                for &s in succs {
                    if !seen.contains(&s) {
                        stack.push(s);
                    }
                }
            }
        }
        order
    }

    fn is_reducible(&self) -> bool {
        self.nodes().len() != 1
    }
}

fn make_initial_graph(func: &Function) -> IntervalGraph {
    let bb_list = func.nodes();
    let bb_to_inode: Map<BlockId, INode> = bb_list.iter().enumerate().map(|(i, &b)| (b, i)).collect();

    let mut bbs = Map::new();
    let mut header_bb = Map::new();
    let mut successors = Map::new();
    let mut predecessors = Map::new();

    for &bb in &bb_list {
        let i = bb_to_inode[&bb];
        let mut singleton = Set::new();
        singleton.insert(bb);
        bbs.insert(i, singleton);
        header_bb.insert(i, bb);

        let succs: Set<INode> = func.block(bb).successors.iter().filter_map(|s| bb_to_inode.get(s).copied()).collect();
        let preds: Set<INode> = func.block(bb).predecessors.iter().filter_map(|p| bb_to_inode.get(p).copied()).collect();
        successors.insert(i, succs);
        predecessors.insert(i, preds);
    }

    IntervalGraph {
        header: bb_to_inode[&func.header],
        bbs,
        header_bb,
        successors,
        predecessors,
    }
}

fn find_intervals(g: &IntervalGraph) -> Vec<Vec<INode>> {
    let mut intervals: Vec<Vec<INode>> = Vec::new();
    let mut header_nodes = vec![g.header];
    let mut remaining: Set<INode> = g.nodes().into_iter().collect();
    remaining.remove(&g.header);

    let mut i = 0;
    while i < header_nodes.len() {
        let h = header_nodes[i];
        i += 1;

        let mut interval_nodes = vec![h];
        loop {
            let mut progress = false;
            for m in remaining.clone() {
                if g.predecessors[&m].iter().all(|p| interval_nodes.contains(p)) {
                    remaining.remove(&m);
                    interval_nodes.push(m);
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        intervals.push(interval_nodes.clone());

        for m in remaining.clone() {
            if g.predecessors[&m].iter().any(|p| interval_nodes.contains(p)) {
                remaining.remove(&m);
                header_nodes.push(m);
            }
        }
    }

    intervals
}

fn find_latching_nodes(interval: &[INode], g: &IntervalGraph) -> Vec<INode> {
    let header = interval[0];
    interval.iter().copied().filter(|&n| g.successors[&n].contains(&header)).collect()
}

/// DFS reachability from `n`, restricted to `allowed` (an interval, or the
/// whole function's live node set when no restriction is wanted).
fn reachable_within<T: Copy + Ord>(n: T, allowed: &Set<T>, succ_func: &impl Fn(T) -> Set<T>) -> Set<T> {
    let mut result = Set::new();
    let mut stack = vec![n];
    while let Some(node) = stack.pop() {
        if !result.insert(node) {
            continue;
        }
        for s in succ_func(node) {
            if allowed.contains(&s) {
                stack.push(s);
            }
        }
    }
    result
}

fn dfs_visit<T: Copy + Ord>(
    n: T,
    seen: &mut Set<T>,
    interval_set: &Set<T>,
    succ_func: &impl Fn(T) -> Set<T>,
    dfs_number: &mut Map<T, i64>,
    cur: &mut i64,
) {
    if !seen.insert(n) {
        return;
    }
    for s in succ_func(n) {
        if interval_set.contains(&s) {
            dfs_visit(s, seen, interval_set, succ_func, dfs_number, cur);
        }
    }
    dfs_number.insert(n, *cur);
    *cur -= 1;
}

/// Interval node numbering (Cifuentes §7.2): orders the nodes of an
/// interval (or an arbitrary reach-intersection, for the conditional-follow
/// pass) so loop-body membership and follow selection reduce to a range
/// check and a min-by-number lookup. Ties between mutually-reachable nodes
/// fall back to DFS discovery order, same as the ported source.
fn compute_node_numbering<T: Copy + Ord>(interval: &[T], succ_func: impl Fn(T) -> Set<T>) -> Map<T, usize> {
    let interval_set: Set<T> = interval.iter().copied().collect();
    let header = interval[0];
    let mut seen = Set::new();
    let mut dfs_number: Map<T, i64> = Map::new();
    let mut cur = interval.len() as i64;
    dfs_visit(header, &mut seen, &interval_set, &succ_func, &mut dfs_number, &mut cur);

    let path_exists = |a: T, b: T| reachable_within(a, &interval_set, &succ_func).contains(&b);
    let break_ties = |a: T, b: T| -> i64 {
        match (dfs_number.get(&a), dfs_number.get(&b)) {
            (Some(&da), Some(&db)) => db - da,
            _ => 0,
        }
    };
    let compare = |a: T, b: T| -> i64 {
        let a_to_b = path_exists(a, b);
        let b_to_a = path_exists(b, a);
        if a_to_b && b_to_a {
            return break_ties(a, b);
        }
        if a_to_b {
            return 1;
        }
        if b_to_a {
            return -1;
        }
        break_ties(a, b)
    };

    let mut nodes: Vec<T> = interval.to_vec();
    nodes.sort_by(|&a, &b| compare(a, b).cmp(&0));

    let mut numbering = Map::new();
    for (i, node) in nodes.iter().rev().enumerate() {
        numbering.insert(*node, i + 1);
    }
    numbering
}

/// Attempts to turn one interval into a loop. May fail silently (returns
/// `None`) — the interval might not be a loop at all, might contain an
/// unresolved indirect jump, or might have more than one way out that can't
/// yet be collapsed to a single follow.
fn make_loop_from_interval(func: &Function, fid: FunctionId, g: &IntervalGraph, interval: &[INode]) -> Option<Loop> {
    let latching_nodes = find_latching_nodes(interval, g);
    if latching_nodes.is_empty() {
        return None;
    }

    let g_succ = |n: INode| g.successors.get(&n).cloned().unwrap_or_default();
    let numbering = compute_node_numbering(interval, g_succ);

    let header_node = interval[0];
    let max_latching = latching_nodes.iter().copied().max_by_key(|n| numbering[n])?;
    let header_num = numbering[&header_node];
    let max_num = numbering[&max_latching];
    debug_assert!(header_num <= max_num);

    let interval_set: Set<INode> = interval.iter().copied().collect();
    let mut loop_nodes: Vec<INode> = interval
        .iter()
        .copied()
        .filter(|&n| {
            let num = numbering[&n];
            if num < header_num || num > max_num {
                return false;
            }
            let reach = reachable_within(n, &interval_set, &g_succ);
            latching_nodes.iter().any(|l| reach.contains(l))
        })
        .collect();

    for &n in &loop_nodes {
        for &bb in &g.bbs[&n] {
            if func.block(bb).has_imprecise_successors() {
                return None;
            }
        }
    }

    let follow_node: Option<INode>;
    loop {
        let loop_set: Set<INode> = loop_nodes.iter().copied().collect();
        let mut out_reachable: Set<INode> = Set::new();
        for &n in &loop_nodes {
            for s in g_succ(n) {
                if !loop_set.contains(&s) {
                    out_reachable.insert(s);
                }
            }
        }

        if out_reachable.is_empty() {
            follow_node = None;
            break;
        }
        if out_reachable.len() == 1 {
            follow_node = out_reachable.into_iter().next();
            break;
        }

        for &n in &out_reachable {
            for &bb in &g.bbs[&n] {
                if func.block(bb).has_imprecise_successors() {
                    return None;
                }
            }
        }

        let mut pulled = false;
        for &n in &out_reachable {
            let preds = &g.predecessors[&n];
            if preds.iter().all(|p| loop_set.contains(p)) && interval.contains(&n) {
                loop_nodes.push(n);
                pulled = true;
                break;
            }
        }
        if !pulled {
            return None;
        }
    }

    let header_bb = g.header_bb[&header_node];
    let follow_bb = follow_node.map(|n| g.header_bb[&n]);
    let mut loop_bbs = Set::new();
    for &n in &loop_nodes {
        loop_bbs.extend(g.bbs[&n].iter().copied());
    }

    Some(Loop {
        function: fid,
        header: header_bb,
        follow: follow_bb,
        nodes: loop_bbs,
    })
}

/// Collapses each interval into a single node. Successor/predecessor edges
/// are recomputed from the underlying basic blocks' real edges, not from
/// the graph being replaced — an interval's reach never changes once the
/// function is built, only which node currently owns which block does.
fn collapse_intervals(old: &IntervalGraph, intervals: &[Vec<INode>], func: &Function) -> IntervalGraph {
    let mut next_id: INode = 0;
    let mut idx_to_new: Vec<INode> = Vec::with_capacity(intervals.len());
    let mut bbs: Map<INode, Set<BlockId>> = Map::new();
    let mut header_bb: Map<INode, BlockId> = Map::new();
    let mut containing_node: Map<BlockId, INode> = Map::new();

    for interval in intervals {
        let new_id = next_id;
        next_id += 1;
        idx_to_new.push(new_id);

        let mut bbset = Set::new();
        for &inode in interval {
            bbset.extend(old.bbs[&inode].iter().copied());
        }
        header_bb.insert(new_id, old.header_bb[&interval[0]]);
        for &bb in &bbset {
            containing_node.insert(bb, new_id);
        }
        bbs.insert(new_id, bbset);
    }

    let mut successors: Map<INode, Set<INode>> = bbs.keys().map(|&id| (id, Set::new())).collect();
    let mut predecessors: Map<INode, Set<INode>> = bbs.keys().map(|&id| (id, Set::new())).collect();

    for (pos, interval) in intervals.iter().enumerate() {
        let new_id = idx_to_new[pos];
        let bbset = bbs[&new_id].clone();

        let mut reach = Set::new();
        for &bb in &bbset {
            reach.extend(func.block(bb).successors.iter().copied());
        }
        for bb in &bbset {
            reach.remove(bb);
        }
        for s in reach {
            successors.get_mut(&new_id).unwrap().insert(containing_node[&s]);
        }

        let header_node = interval[0];
        let mut preach = Set::new();
        for &p in &old.predecessors[&header_node] {
            preach.extend(old.bbs[&p].iter().copied());
        }
        for bb in &bbset {
            preach.remove(bb);
        }
        for p in preach {
            predecessors.get_mut(&new_id).unwrap().insert(containing_node[&p]);
        }
    }

    let new_header = containing_node[&old.header_bb[&old.header]];

    IntervalGraph {
        header: new_header,
        bbs,
        header_bb,
        successors,
        predecessors,
    }
}

fn find_loops(func: &Function, fid: FunctionId, max_iterations: usize) -> Vec<Loop> {
    let mut found = Vec::new();
    let mut g = make_initial_graph(func);
    let mut iterations = 0;

    while g.is_reducible() {
        let intervals = find_intervals(&g);
        for interval in &intervals {
            if let Some(l) = make_loop_from_interval(func, fid, &g, interval) {
                found.push(l);
            }
        }
        g = collapse_intervals(&g, &intervals, func);

        iterations += 1;
        if iterations > max_iterations {
            // The graph still has more than one node after the budgeted
            // number of collapses — almost always an unresolved indirect
            // jump leaving the CFG irreducible. Whatever loops we already
            // found stand; the rest falls back to goto-shaped output in C9.
            break;
        }
    }

    found
}

/// Runs the interval algorithm over every function in the contract.
pub fn discover_loops(contract: &Contract, settings: &Settings) -> Vec<Loop> {
    let mut result = Vec::new();
    for (idx, func) in contract.functions.iter().enumerate() {
        let fid = FunctionId(idx);
        result.extend(find_loops(func, fid, settings.max_interval_iterations));
    }
    result
}

/// Per-function bookkeeping for `discover_follow_in_func`: which edges are
/// loop continues/breaks (never followed), and which loop headers should be
/// redirected to their follow node when reached.
struct FollowContext {
    continues: Set<(BlockId, BlockId)>,
    breaks: Set<(BlockId, BlockId)>,
    loop_header_follow: Map<BlockId, Option<BlockId>>,
}

fn build_follow_context(func: &Function, loops: &[Loop]) -> FollowContext {
    let mut continues = Set::new();
    let mut breaks = Set::new();
    let mut loop_header_follow: Map<BlockId, Option<BlockId>> = Map::new();

    for l in loops {
        loop_header_follow.insert(l.header, l.follow);
        for &bb in &l.nodes {
            for &s in &func.block(bb).successors {
                if s == l.header {
                    continues.insert((bb, s));
                }
                if Some(s) == l.follow {
                    breaks.insert((bb, s));
                }
            }
        }
    }

    FollowContext { continues, breaks, loop_header_follow }
}

impl FollowContext {
    /// A filtered successor function: drops imprecise edges, continues,
    /// breaks, and self-edges back to the conditional under inspection, and
    /// redirects an edge into another loop's header to that loop's follow
    /// (dropping it if that loop has none).
    fn successors(&self, func: &Function, current_header: BlockId, n: BlockId) -> Set<BlockId> {
        let mut result = Set::new();
        if func.block(n).has_imprecise_successors() {
            return result;
        }
        for &s in &func.block(n).successors {
            if func.block(s).has_imprecise_successors() {
                continue;
            }
            if self.continues.contains(&(n, s)) {
                continue;
            }
            if self.breaks.contains(&(n, s)) {
                continue;
            }
            if s == current_header {
                continue;
            }
            if let Some(&follow) = self.loop_header_follow.get(&s) {
                if let Some(f) = follow {
                    result.insert(f);
                }
                continue;
            }
            result.insert(s);
        }
        result
    }
}

fn is_end_point(func: &Function, n: BlockId) -> bool {
    func.block(n).successors.is_empty() && func.block(n).predecessors.len() == 1
}

/// Picks, for every `jcond` in `func`, the node where its two branches
/// rejoin (its "follow"), if one exists. Nodes are visited in reverse DFS
/// order so a conditional's follow can itself already have a follow
/// computed for an enclosing conditional, matching the ported source's
/// bottom-up traversal.
fn discover_follow_in_func(func: &Function, loops: &[Loop]) -> Map<BlockId, BlockId> {
    let ctx = build_follow_context(func, loops);
    let mut follows = Map::new();
    let live: Set<BlockId> = func.nodes().into_iter().collect();

    let mut order = func.nodes();
    order.reverse();

    for node in order {
        let Some(term) = func.block(node).terminator.clone() else { continue };
        let Instruction::Jcond { loc, .. } = &term else { continue };
        let Location::Literal(target_addr) = loc else {
            // can't structure indirect jconds
            continue;
        };
        if func.block(node).successors.len() != 2 {
            continue;
        }

        let current_header = node;
        let succs = ctx.successors(func, current_header, node);
        if succs.len() != 2 {
            continue;
        }
        if succs != func.block(node).successors {
            continue;
        }

        let Some(target) = func.get_block_by_addr(*target_addr) else { continue };
        if !succs.contains(&target) {
            continue;
        }
        let false_node = *succs.iter().find(|&&s| s != target).expect("succs has exactly 2 members");
        let true_node = target;

        let succ_fn = |n: BlockId| ctx.successors(func, current_header, n);
        let true_reach = reachable_within(true_node, &live, &succ_fn);
        let false_reach = reachable_within(false_node, &live, &succ_fn);

        if true_reach.contains(&node) || false_reach.contains(&node) {
            continue;
        }

        let intersection: Set<BlockId> = true_reach.intersection(&false_reach).copied().collect();

        let follow = if intersection.is_empty() {
            // No traditional follow, but if one branch is a dead end (and
            // nothing else merges into it) the other branch can still act
            // as the follow without making the generated code worse.
            if is_end_point(func, true_node) {
                Some(false_node)
            } else if is_end_point(func, false_node) {
                Some(true_node)
            } else {
                None
            }
        } else {
            let items: Vec<BlockId> = intersection.iter().copied().collect();
            let numbering = compute_node_numbering(&items, succ_fn);
            items.into_iter().min_by_key(|n| numbering[n])
        };

        if let Some(f) = follow {
            debug_assert!(f != node);
            follows.insert(node, f);
        }
    }

    follows
}

/// Discovers every conditional's follow node across the whole contract,
/// keyed by the conditional's own block so C9 can look it up while walking
/// each function independently.
pub fn discover_cond_follows(contract: &Contract, loops: &[Loop]) -> Map<(FunctionId, BlockId), BlockId> {
    let mut follows = Map::new();
    for (idx, func) in contract.functions.iter().enumerate() {
        let fid = FunctionId(idx);
        let func_loops: Vec<Loop> = loops.iter().filter(|l| l.function == fid).cloned().collect();
        let fls = discover_follow_in_func(func, &func_loops);
        for (cond, follow) in fls {
            follows.insert((fid, cond), follow);
        }
    }
    follows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::block::BasicBlock;
    use crate::ir::expr::Expr;
    use crate::ir::function::Function;

    /// header -> body -> header (back edge), header -> follow.
    fn simple_while_loop() -> Function {
        let mut f = Function::new(0, BasicBlock::new(0));
        let body = f.push_block(BasicBlock::new(1));
        let follow = f.push_block(BasicBlock::new(2));

        f.block_mut(f.header).terminator = Some(Instruction::Jcond {
            cond: Expr::lit(1u64),
            loc: Location::Literal(1),
        });
        f.block_mut(f.header).next_bb = Some(follow);
        f.add_successor(f.header, body);
        f.add_successor(f.header, follow);

        f.block_mut(body).terminator = Some(Instruction::Jump { loc: Location::Literal(0) });
        f.add_successor(body, f.header);

        f.block_mut(follow).terminator = Some(Instruction::Ret { args: vec![] });

        f
    }

    #[test]
    fn discovers_single_back_edge_loop() {
        let f = simple_while_loop();
        let settings = Settings::default();
        let loops = find_loops(&f, FunctionId(0), settings.max_interval_iterations);
        assert_eq!(loops.len(), 1);
        let l = &loops[0];
        assert_eq!(l.header, f.header);
        assert!(l.nodes.contains(&f.header));
        assert!(l.nodes.contains(&BlockId(1)));
        assert_eq!(l.follow, Some(BlockId(2)));
    }

    #[test]
    fn no_loop_for_acyclic_function() {
        let mut f = Function::new(0, BasicBlock::new(0));
        let b1 = f.push_block(BasicBlock::new(1));
        f.block_mut(f.header).terminator = Some(Instruction::Jump { loc: Location::Literal(1) });
        f.add_successor(f.header, b1);
        f.block_mut(b1).terminator = Some(Instruction::Ret { args: vec![] });

        let settings = Settings::default();
        let loops = find_loops(&f, FunctionId(0), settings.max_interval_iterations);
        assert!(loops.is_empty());
    }

    /// header: jcond -> {true_branch, false_branch}, both -> follow.
    fn diamond_function() -> Function {
        let mut f = Function::new(0, BasicBlock::new(0));
        let true_branch = f.push_block(BasicBlock::new(1));
        let false_branch = f.push_block(BasicBlock::new(2));
        let follow = f.push_block(BasicBlock::new(3));

        f.block_mut(f.header).terminator = Some(Instruction::Jcond {
            cond: Expr::lit(1u64),
            loc: Location::Literal(1),
        });
        f.block_mut(f.header).next_bb = Some(false_branch);
        f.add_successor(f.header, true_branch);
        f.add_successor(f.header, false_branch);

        f.block_mut(true_branch).terminator = Some(Instruction::Jump { loc: Location::Literal(3) });
        f.add_successor(true_branch, follow);

        f.block_mut(false_branch).terminator = Some(Instruction::Jump { loc: Location::Literal(3) });
        f.add_successor(false_branch, follow);

        f.block_mut(follow).terminator = Some(Instruction::Ret { args: vec![] });

        f
    }

    #[test]
    fn discovers_diamond_follow() {
        let f = diamond_function();
        let follows = discover_follow_in_func(&f, &[]);
        assert_eq!(follows.get(&f.header), Some(&BlockId(3)));
    }

    #[test]
    fn end_point_branch_becomes_follow_when_no_merge_point() {
        let mut f = Function::new(0, BasicBlock::new(0));
        let true_branch = f.push_block(BasicBlock::new(1));
        let false_branch = f.push_block(BasicBlock::new(2));

        f.block_mut(f.header).terminator = Some(Instruction::Jcond {
            cond: Expr::lit(1u64),
            loc: Location::Literal(1),
        });
        f.block_mut(f.header).next_bb = Some(false_branch);
        f.add_successor(f.header, true_branch);
        f.add_successor(f.header, false_branch);

        // true branch reverts (dead end); false branch keeps going.
        f.block_mut(true_branch).terminator = Some(Instruction::Assertion { cond: Expr::lit(0u64) });
        f.block_mut(false_branch).terminator = Some(Instruction::Ret { args: vec![] });

        let follows = discover_follow_in_func(&f, &[]);
        assert_eq!(follows.get(&f.header), Some(&false_branch));
    }
}
