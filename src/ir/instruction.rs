//! HLIR instructions: the statement-level IR a basic block is made of.
//! Every basic block is a straight-line list of these plus one terminator.

use crate::ir::expr::Expr;
use crate::ir::function::FunctionId;
use crate::vmcall::VmCall;

/// Where a control-transfer or call instruction goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// A direct jump/call to a literal address (resolved to a `BlockId` by
    /// the pass that owns successor edges).
    Literal(u64),
    /// An indirect jump/call whose target is computed at runtime.
    Indirect(Expr),
    /// A call to another lifted function.
    Function(FunctionId),
    /// A call into one of the fixed vmcall names.
    VmCall(VmCall),
}

impl Location {
    pub fn as_literal(&self) -> Option<u64> {
        match self {
            Location::Literal(addr) => Some(*addr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `results[0] = args[0]`.
    Assign { result: Expr, value: Expr },
    /// Unconditional control transfer.
    Jump { loc: Location },
    /// Conditional control transfer: falls through to the block's `next_bb`
    /// when `cond` is false, jumps to `loc` when true.
    Jcond { cond: Expr, loc: Location },
    /// A call to another lifted function.
    Call {
        target: FunctionId,
        args: Vec<Expr>,
        results: Vec<Expr>,
    },
    /// A call to a vmcall.
    VmCall {
        name: VmCall,
        args: Vec<Expr>,
        results: Vec<Expr>,
    },
    /// Function return.
    Ret { args: Vec<Expr> },
    /// A reconstructed `assert(cond)`, synthesized from a `jcond` that
    /// guarded a `revert`.
    Assertion { cond: Expr },
}

impl Instruction {
    pub fn results(&self) -> Vec<&Expr> {
        match self {
            Instruction::Assign { result, .. } => vec![result],
            Instruction::Call { results, .. } | Instruction::VmCall { results, .. } => {
                results.iter().collect()
            }
            _ => vec![],
        }
    }

    pub fn args(&self) -> Vec<&Expr> {
        match self {
            Instruction::Assign { value, .. } => vec![value],
            Instruction::Jcond { cond, .. } => vec![cond],
            Instruction::Call { args, .. } | Instruction::VmCall { args, .. } => args.iter().collect(),
            Instruction::Ret { args } => args.iter().collect(),
            Instruction::Assertion { cond } => vec![cond],
            Instruction::Jump { .. } => vec![],
        }
    }

    pub fn map_exprs(&self, mut f: impl FnMut(&Expr) -> Expr) -> Instruction {
        match self {
            Instruction::Assign { result, value } => Instruction::Assign {
                result: f(result),
                value: f(value),
            },
            Instruction::Jump { loc } => Instruction::Jump { loc: map_loc(loc, &mut f) },
            Instruction::Jcond { cond, loc } => Instruction::Jcond {
                cond: f(cond),
                loc: map_loc(loc, &mut f),
            },
            Instruction::Call { target, args, results } => Instruction::Call {
                target: *target,
                args: args.iter().map(&mut f).collect(),
                results: results.iter().map(&mut f).collect(),
            },
            Instruction::VmCall { name, args, results } => Instruction::VmCall {
                name: *name,
                args: args.iter().map(&mut f).collect(),
                results: results.iter().map(&mut f).collect(),
            },
            Instruction::Ret { args } => Instruction::Ret {
                args: args.iter().map(&mut f).collect(),
            },
            Instruction::Assertion { cond } => Instruction::Assertion { cond: f(cond) },
        }
    }

    pub fn is_terminating_vmcall(&self) -> bool {
        matches!(self, Instruction::VmCall { name, .. } if name.is_terminating())
    }
}

fn map_loc(loc: &Location, f: &mut impl FnMut(&Expr) -> Expr) -> Location {
    match loc {
        Location::Indirect(e) => Location::Indirect(f(e)),
        other => other.clone(),
    }
}

/// An instruction whose result is `Expr::UnusedValue`: a value was computed
/// (for its side effects, or because the lifter couldn't avoid it) but never
/// consumed. Dead-code elimination looks for exactly this shape.
pub fn is_unused_assignment(ins: &Instruction) -> bool {
    matches!(ins, Instruction::Assign { value: Expr::UnusedValue, .. })
}
