//! The intermediate representation: expressions (C1), low-level opcodes,
//! HLIR instructions and basic blocks (C2), and the function/contract
//! containers that own them.

pub mod block;
pub mod contract;
pub mod expr;
pub mod function;
pub mod instruction;
pub mod opcode;

pub use block::{BasicBlock, BlockId};
pub use contract::{AddressDispenser, Contract};
pub use expr::{BinOp, Expr, UnOp, VarId};
pub use function::{Function, FunctionId};
pub use instruction::{Instruction, Location};
pub use opcode::{decode, Opcode, RawInstruction};
