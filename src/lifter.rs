//! The lifter (C3): turns the raw opcode stream into HLIR basic blocks by
//! symbolically executing a virtual stack. Grounded directly in the
//! original lifter's two-pass block conversion (`ll2hl.py`): a first pass
//! over a block computes its net stack-pointer delta, then a second pass
//! re-runs the symbolic execution, seeded so the virtual stack pointer
//! lands on zero exactly at the block's end.
//!
//! Unlike the original, expressions here are plain immutable values (no
//! shared mutable node graph), so the "temp-ify on pop, mark the old slot
//! `UnusedValue`" dance the original uses to avoid aliasing two references
//! to the same mutable node is unnecessary: cloning an `Expr` can never
//! create spurious aliasing, because equality and mutation both work
//! structurally (except for `Var`, whose identity is its `VarId`, which
//! `Clone` preserves correctly).

use crate::common::Id;
use crate::ir::block::{BasicBlock, BlockId};
use crate::ir::expr::{BinOp, Expr, UnOp};
use crate::ir::function::Function;
use crate::ir::instruction::{Instruction, Location};
use crate::ir::opcode::{self, Opcode, RawInstruction};
use crate::vmcall::VmCall;

/// A basic block at the raw-opcode level, before lifting: bytecode starts a
/// new one at every `JUMPDEST` and closes the current one after every
/// "ending instruction" (`JUMP`, `JUMPI`, the halting/reverting vmcalls, and
/// unrecognized bytes).
struct LowBlock {
    address: u64,
    instructions: Vec<RawInstruction>,
}

fn split(raw: &[RawInstruction]) -> Vec<LowBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<LowBlock> = None;
    for ins in raw {
        if ins.opcode == Opcode::Jumpdest {
            if let Some(b) = current.take() {
                blocks.push(b);
            }
            current = Some(LowBlock {
                address: ins.address as u64,
                instructions: vec![],
            });
        }
        if current.is_none() {
            current = Some(LowBlock {
                address: ins.address as u64,
                instructions: vec![],
            });
        }
        current.as_mut().unwrap().instructions.push(ins.clone());
        if opcode::is_ending_instruction(ins.opcode) {
            blocks.push(current.take().unwrap());
        }
    }
    if let Some(b) = current {
        if !b.instructions.is_empty() {
            blocks.push(b);
        }
    }
    blocks
}

fn global_var_name(op: Opcode) -> Option<&'static str> {
    Some(match op {
        Opcode::Address => "this",
        Opcode::Balance => return None,
        Opcode::Origin => "tx.origin",
        Opcode::Caller => "msg.sender",
        Opcode::Callvalue => "msg.value",
        Opcode::Calldatasize => "msg.data.length",
        Opcode::Gasprice => "tx.gasprice",
        Opcode::Coinbase => "block.coinbase",
        Opcode::Timestamp => "block.timestamp",
        Opcode::Number => "block.number",
        Opcode::Difficulty => "block.difficulty",
        Opcode::Gaslimit => "block.gaslimit",
        Opcode::Pc => "pc",
        Opcode::Gas => "gasleft()",
        _ => return None,
    })
}

/// Per-block symbolic-execution state.
struct Converter<'a> {
    func: &'a mut Function,
    bb: BlockId,
    stack: Vec<Expr>,
    /// How far the virtual stack pointer has moved since the block's entry.
    virtual_sp: i64,
    /// Set on the first `PUSH` so an immediately-following `JUMP`/`JUMPI`
    /// can recover the literal target directly instead of going through a
    /// `Stack`/`Var` reference that later passes would have to re-derive.
    just_pushed: Option<Expr>,
}

impl<'a> Converter<'a> {
    fn push(&mut self, v: Expr) {
        self.stack.push(v);
        self.virtual_sp += 1;
    }

    fn pop(&mut self) -> Expr {
        self.virtual_sp -= 1;
        self.stack.pop().unwrap_or(Expr::Stack(self.virtual_sp))
    }

    fn emit(&mut self, ins: Instruction) {
        self.func.block_mut(self.bb).instructions.push(ins);
    }

    fn convert_ins(&mut self, ins: &RawInstruction) {
        let pushed_before = self.just_pushed.take();
        match ins.opcode {
            Opcode::Push(_) => {
                let lit = Expr::Lit(ins.push_value.unwrap_or(crate::common::Word::ZERO));
                self.push(lit.clone());
                self.just_pushed = Some(lit);
                return;
            }
            Opcode::Dup(n) => {
                let idx = self.stack.len().checked_sub(n as usize);
                let v = match idx {
                    Some(i) => self.stack[i].clone(),
                    None => Expr::Stack(self.virtual_sp - n as i64),
                };
                self.push(v);
                return;
            }
            Opcode::Swap(n) => {
                let len = self.stack.len();
                if len > n as usize {
                    let top = len - 1;
                    let other = len - 1 - n as usize;
                    self.stack.swap(top, other);
                } else {
                    // underflow beyond what this block has pushed locally;
                    // swapping two below-entry slots is a no-op for our
                    // purposes since both sides are symbolic `Stack` refs.
                }
                return;
            }
            Opcode::Pop => {
                self.pop();
                return;
            }
            Opcode::Jumpdest => return,
            _ => {}
        }

        match ins.opcode {
            Opcode::Stop => {
                self.func.block_mut(self.bb).terminator = Some(Instruction::VmCall {
                    name: VmCall::Stop,
                    args: vec![],
                    results: vec![],
                });
            }
            Opcode::Add | Opcode::Mul | Opcode::Sub | Opcode::Div | Opcode::Sdiv | Opcode::Mod
            | Opcode::Smod | Opcode::Exp | Opcode::Lt | Opcode::Gt | Opcode::Slt | Opcode::Sgt
            | Opcode::Eq | Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Shl | Opcode::Shr
            | Opcode::Sar | Opcode::Byte | Opcode::Signextend => {
                let a = self.pop();
                let b = self.pop();
                let op = bin_op_for(ins.opcode);
                self.push(Expr::BinaryOp(op, Box::new(a), Box::new(b)));
            }
            Opcode::Addmod => {
                let a = self.pop();
                let b = self.pop();
                let m = self.pop();
                self.push(Expr::BinaryOp(
                    BinOp::AddMod3,
                    Box::new(Expr::Sequence(vec![a, b])),
                    Box::new(m),
                ));
            }
            Opcode::Mulmod => {
                let a = self.pop();
                let b = self.pop();
                let m = self.pop();
                self.push(Expr::BinaryOp(
                    BinOp::MulMod3,
                    Box::new(Expr::Sequence(vec![a, b])),
                    Box::new(m),
                ));
            }
            Opcode::Iszero => {
                let a = self.pop();
                self.push(Expr::UnaryOp(UnOp::Not, Box::new(a)));
            }
            Opcode::Not => {
                let a = self.pop();
                self.push(Expr::UnaryOp(UnOp::BitNot, Box::new(a)));
            }
            Opcode::Sha3 => {
                let offset = self.pop();
                let length = self.pop();
                // the argument is the *read* of the hashed memory range, not the
                // range itself, so propagation can later substitute in whatever
                // was written there (see rewrites::detect_mapping_access).
                self.push(Expr::PureFunctionCall {
                    name: VmCall::Sha3,
                    args: vec![Expr::Mem {
                        address: Box::new(offset),
                        length: Box::new(length),
                    }],
                });
            }
            Opcode::Balance => {
                let addr = self.pop();
                let result = Expr::fresh_var();
                self.emit_vmcall(VmCall::Balance, vec![addr], vec![result.clone()]);
                self.push(result);
            }
            Opcode::Extcodesize => {
                let addr = self.pop();
                let result = Expr::fresh_var();
                self.emit_vmcall(VmCall::Extcodesize, vec![addr], vec![result.clone()]);
                self.push(result);
            }
            Opcode::Blockhash => {
                let n = self.pop();
                let result = Expr::fresh_var();
                self.emit_vmcall(VmCall::Blockhash, vec![n], vec![result.clone()]);
                self.push(result);
            }
            Opcode::Calldataload => {
                let off = self.pop();
                let result = Expr::fresh_var();
                self.emit_vmcall(VmCall::Calldataload, vec![off], vec![result.clone()]);
                self.push(result);
            }
            Opcode::Codesize => {
                let result = Expr::fresh_var();
                self.emit_vmcall(VmCall::Codesize, vec![], vec![result.clone()]);
                self.push(result);
            }
            Opcode::Returndatasize => {
                let result = Expr::fresh_var();
                self.emit_vmcall(VmCall::Returndatasize, vec![], vec![result.clone()]);
                self.push(result);
            }
            Opcode::Msize => {
                let result = Expr::fresh_var();
                self.emit_vmcall(VmCall::Msize, vec![], vec![result.clone()]);
                self.push(result);
            }
            Opcode::Codecopy | Opcode::Calldatacopy | Opcode::Returndatacopy => {
                let dest = self.pop();
                let src = self.pop();
                let len = self.pop();
                let name = match ins.opcode {
                    Opcode::Codecopy => VmCall::Coderead,
                    Opcode::Calldatacopy => VmCall::Calldataread,
                    _ => VmCall::Returndataread,
                };
                let result = Expr::fresh_var();
                self.emit_vmcall(name, vec![src, len], vec![result.clone()]);
                self.emit(Instruction::Assign {
                    result: Expr::Mem {
                        address: Box::new(dest),
                        length: Box::new(len_placeholder()),
                    },
                    value: result,
                });
            }
            Opcode::Extcodecopy => {
                let addr = self.pop();
                let dest = self.pop();
                let src = self.pop();
                let len = self.pop();
                let _ = (addr, src, len);
                self.emit(Instruction::Assign {
                    result: Expr::Mem {
                        address: Box::new(dest),
                        length: Box::new(len_placeholder()),
                    },
                    value: Expr::UnusedValue,
                });
            }
            Opcode::Mload => {
                let addr = self.pop();
                self.push(Expr::Mem {
                    address: Box::new(addr),
                    length: Box::new(Expr::Lit(crate::common::Word::from(32u8))),
                });
            }
            Opcode::Mstore => {
                let addr = self.pop();
                let val = self.pop();
                self.emit(Instruction::Assign {
                    result: Expr::Mem {
                        address: Box::new(addr),
                        length: Box::new(Expr::Lit(crate::common::Word::from(32u8))),
                    },
                    value: val,
                });
            }
            Opcode::Mstore8 => {
                let addr = self.pop();
                let val = self.pop();
                self.emit(Instruction::Assign {
                    result: Expr::Mem {
                        address: Box::new(addr),
                        length: Box::new(Expr::Lit(crate::common::Word::from(1u8))),
                    },
                    value: Expr::BinaryOp(BinOp::And, Box::new(val), Box::new(Expr::Lit(crate::common::Word::from(0xffu64)))),
                });
            }
            Opcode::Sload => {
                let addr = self.pop();
                self.push(Expr::Storage { address: Box::new(addr) });
            }
            Opcode::Sstore => {
                let addr = self.pop();
                let val = self.pop();
                self.emit(Instruction::Assign {
                    result: Expr::Storage { address: Box::new(addr) },
                    value: val,
                });
            }
            Opcode::Log(n) => {
                let offset = self.pop();
                let len = self.pop();
                let mut args = vec![offset, len];
                for _ in 0..n {
                    args.push(self.pop());
                }
                self.emit(Instruction::VmCall {
                    name: VmCall::Log,
                    args,
                    results: vec![],
                });
            }
            Opcode::Messagecall | Opcode::Delegatecall | Opcode::Callcode => {
                let gas = self.pop();
                let addr = self.pop();
                let value = if ins.opcode == Opcode::Messagecall || ins.opcode == Opcode::Callcode {
                    Some(self.pop())
                } else {
                    None
                };
                let in_off = self.pop();
                let in_len = self.pop();
                let out_off = self.pop();
                let out_len = self.pop();
                let mut args = vec![gas, addr];
                if let Some(v) = value {
                    args.push(v);
                }
                args.extend([in_off, in_len, out_off, out_len]);
                let name = match ins.opcode {
                    Opcode::Messagecall => VmCall::Messagecall,
                    Opcode::Delegatecall => VmCall::Delegatecall,
                    _ => VmCall::Messagecall,
                };
                let result = Expr::fresh_var();
                self.emit_vmcall(name, args, vec![result.clone()]);
                self.push(result);
            }
            Opcode::Create | Opcode::Create2 => {
                let value = self.pop();
                let off = self.pop();
                let len = self.pop();
                let mut args = vec![value, off, len];
                if ins.opcode == Opcode::Create2 {
                    args.push(self.pop());
                }
                let result = Expr::fresh_var();
                self.emit_vmcall(VmCall::Create, args, vec![result.clone()]);
                self.push(result);
            }
            Opcode::Haltreturn | Opcode::Revert => {
                let off = self.pop();
                let len = self.pop();
                let name = if ins.opcode == Opcode::Haltreturn {
                    VmCall::Haltreturn
                } else {
                    VmCall::Revert
                };
                self.func.block_mut(self.bb).terminator = Some(Instruction::VmCall {
                    name,
                    args: vec![off, len],
                    results: vec![],
                });
            }
            Opcode::Selfdestruct => {
                let addr = self.pop();
                self.func.block_mut(self.bb).terminator = Some(Instruction::VmCall {
                    name: VmCall::Selfdestruct,
                    args: vec![addr],
                    results: vec![],
                });
            }
            Opcode::Invalid | Opcode::Unknown(_) => {
                self.func.block_mut(self.bb).terminator = Some(Instruction::VmCall {
                    name: VmCall::Revert,
                    args: vec![Expr::Lit(crate::common::Word::ZERO), Expr::Lit(crate::common::Word::ZERO)],
                    results: vec![],
                });
            }
            Opcode::Jump => {
                let popped = self.pop();
                let loc = location_from_expr(pushed_before.unwrap_or(popped));
                self.func.block_mut(self.bb).terminator = Some(Instruction::Jump { loc });
            }
            Opcode::Jumpi => {
                let popped = self.pop();
                let loc = location_from_expr(pushed_before.unwrap_or(popped));
                let cond = self.pop();
                self.func.block_mut(self.bb).terminator = Some(Instruction::Jcond { cond, loc });
            }
            other => {
                if let Some(name) = global_var_name(other) {
                    self.push(Expr::GlobalVar(Id::from(name.to_string())));
                }
            }
        }
    }

    fn emit_vmcall(&mut self, name: VmCall, args: Vec<Expr>, results: Vec<Expr>) {
        self.emit(Instruction::VmCall { name, args, results });
    }
}

fn len_placeholder() -> Expr {
    Expr::Lit(crate::common::Word::ZERO)
}

fn location_from_expr(e: Expr) -> Location {
    match e {
        Expr::Lit(w) => Location::Literal(w.to::<u64>()),
        other => Location::Indirect(other),
    }
}

fn bin_op_for(op: Opcode) -> BinOp {
    match op {
        Opcode::Add => BinOp::Add,
        Opcode::Mul => BinOp::Mul,
        Opcode::Sub => BinOp::Sub,
        Opcode::Div => BinOp::Div,
        Opcode::Sdiv => BinOp::SDiv,
        Opcode::Mod => BinOp::Mod,
        Opcode::Smod => BinOp::SMod,
        Opcode::Exp => BinOp::Exp,
        Opcode::Lt => BinOp::Lt,
        Opcode::Gt => BinOp::Gt,
        Opcode::Slt => BinOp::SLt,
        Opcode::Sgt => BinOp::SGt,
        Opcode::Eq => BinOp::Eq,
        Opcode::And => BinOp::And,
        Opcode::Or => BinOp::Or,
        Opcode::Xor => BinOp::Xor,
        Opcode::Shl => BinOp::Shl,
        Opcode::Shr => BinOp::Shr,
        Opcode::Sar => BinOp::Sar,
        Opcode::Byte => BinOp::Byte,
        Opcode::Signextend => BinOp::SignExtend,
        _ => unreachable!("bin_op_for called with non-binary opcode"),
    }
}

/// Lift a flat bytecode buffer into a single function's worth of basic
/// blocks (the "loader" function at address 0). Function discovery (C7)
/// later splits pieces of this into separate `Function`s.
pub fn lift(bytecode: &[u8]) -> Function {
    let raw = opcode::decode(bytecode);
    let low_blocks = split(&raw);

    let mut func = Function::new(0, BasicBlock::new(0));
    func.blocks.clear();

    let mut addr_to_id = std::collections::BTreeMap::new();
    for lb in &low_blocks {
        let id = func.push_block(BasicBlock::new(lb.address));
        addr_to_id.insert(lb.address, id);
    }
    func.header = *addr_to_id.get(&0).unwrap_or(&BlockId(0));

    for (i, lb) in low_blocks.iter().enumerate() {
        let id = addr_to_id[&lb.address];
        convert_block(&mut func, id, lb);
        if i + 1 < low_blocks.len() {
            func.block_mut(id).next_bb = Some(addr_to_id[&low_blocks[i + 1].address]);
        }
    }

    wire_terminators(&mut func, &addr_to_id);
    func
}

fn convert_block(func: &mut Function, id: BlockId, lb: &LowBlock) {
    // first pass: compute the block's net stack-pointer delta.
    let delta = {
        let mut probe = Converter {
            func,
            bb: id,
            stack: Vec::new(),
            virtual_sp: 0,
            just_pushed: None,
        };
        for ins in &lb.instructions {
            probe.convert_ins(ins);
        }
        let delta = probe.virtual_sp;
        func.block_mut(id).instructions.clear();
        func.block_mut(id).terminator = None;
        delta
    };

    // second pass: real conversion, seeded so virtual_sp ends at 0.
    let mut conv = Converter {
        func,
        bb: id,
        stack: Vec::new(),
        virtual_sp: -delta,
        just_pushed: None,
    };
    for ins in &lb.instructions {
        conv.convert_ins(ins);
    }
    func.block_mut(id).sp_delta = delta;
}

/// Resolve jump/jcond targets into real successor edges now that every
/// block has an address. A literal target with no matching block (or an
/// indirect jump with no discoverable targets yet) is redirected to a
/// synthesized `revert`, matching the original's handling of invalid jumps.
fn wire_terminators(func: &mut Function, addr_to_id: &std::collections::BTreeMap<u64, BlockId>) {
    let ids: Vec<BlockId> = addr_to_id.values().copied().collect();
    for id in ids {
        let terminator = func.block(id).terminator.clone();
        match terminator {
            Some(Instruction::Jump { loc: Location::Literal(addr) }) => {
                if let Some(&target) = addr_to_id.get(&addr) {
                    func.add_successor(id, target);
                } else {
                    make_revert_terminator(func, id);
                }
            }
            Some(Instruction::Jcond { loc: Location::Literal(addr), .. }) => {
                if let Some(&target) = addr_to_id.get(&addr) {
                    func.add_successor(id, target);
                }
                if let Some(next) = func.block(id).next_bb {
                    func.add_successor(id, next);
                }
            }
            Some(Instruction::Jump { loc: Location::Indirect(_) }) => {
                // left with no successors; `functions::compute_indirect_jump_successors`
                // heuristically reconnects these during optimization.
            }
            None => {
                // fell off the end of the block without a terminator:
                // synthesize an unconditional jump to the next address.
                if let Some(next) = func.block(id).next_bb {
                    let next_addr = func.block(next).address;
                    func.block_mut(id).terminator = Some(Instruction::Jump {
                        loc: Location::Literal(next_addr),
                    });
                    func.add_successor(id, next);
                }
            }
            _ => {}
        }
    }
}

fn make_revert_terminator(func: &mut Function, id: BlockId) {
    func.block_mut(id).terminator = Some(Instruction::VmCall {
        name: VmCall::Revert,
        args: vec![Expr::Lit(crate::common::Word::ZERO), Expr::Lit(crate::common::Word::ZERO)],
        results: vec![],
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifts_push_stop_into_one_block() {
        let code = [0x60, 0x2a, 0x00]; // PUSH1 0x2a; STOP
        let f = lift(&code);
        assert_eq!(f.blocks.len(), 1);
        assert!(matches!(
            f.block(f.header).terminator,
            Some(Instruction::VmCall { name: VmCall::Stop, .. })
        ));
    }

    #[test]
    fn push_jump_peephole_resolves_literal_target() {
        // block 0: PUSH1 0x05; JUMP
        // block at 0x05: JUMPDEST; STOP
        let code = [0x60, 0x05, 0x56, 0x5b, 0x00];
        let f = lift(&code);
        let header = f.header;
        match &f.block(header).terminator {
            Some(Instruction::Jump { loc: Location::Literal(addr) }) => assert_eq!(*addr, 5),
            other => panic!("expected a resolved literal jump, got {:?}", other),
        }
        assert_eq!(f.block(header).successors.len(), 1);
    }

    #[test]
    fn jumpi_keeps_both_branch_and_fallthrough_successors() {
        // PUSH1 0x07; PUSH1 0x01; JUMPI; STOP; JUMPDEST; STOP
        let code = [0x60, 0x07, 0x60, 0x01, 0x57, 0x00, 0x5b, 0x00];
        let f = lift(&code);
        let header = f.header;
        assert_eq!(f.block(header).successors.len(), 2);
    }

    #[test]
    fn invalid_opcode_becomes_revert() {
        let code = [0x0c]; // unassigned
        let f = lift(&code);
        assert!(matches!(
            f.block(f.header).terminator,
            Some(Instruction::VmCall { name: VmCall::Revert, .. })
        ));
    }
}
