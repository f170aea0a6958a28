//! The contract-level container: all functions discovered so far, plus the
//! raw bytecode they were lifted from (kept around for `coderead` vmcalls
//! and for extracting a constructor's embedded runtime bytecode).

use crate::ir::function::{Function, FunctionId};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub struct Contract {
    pub functions: Vec<Function>,
    pub bytecode: Vec<u8>,
}

impl Contract {
    pub fn new(loader: Function, bytecode: Vec<u8>) -> Contract {
        assert_eq!(loader.address, 0, "the loader function must start at address 0");
        Contract {
            functions: vec![loader],
            bytecode,
        }
    }

    pub fn loader(&self) -> FunctionId {
        FunctionId(0)
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.0]
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[id.0]
    }

    pub fn push_function(&mut self, f: Function) -> FunctionId {
        let id = FunctionId(self.functions.len());
        self.functions.push(f);
        id
    }
}

/// Hands out addresses for basic blocks synthesized during optimization
/// (e.g. `duplicate_terminating_successors`' cloned return blocks) that
/// don't correspond to any real bytecode offset. Starts well past any
/// plausible bytecode length so synthesized and real addresses never
/// collide.
#[derive(Debug)]
pub struct AddressDispenser {
    next: AtomicU64,
}

impl AddressDispenser {
    pub fn starting_after(bytecode_len: usize) -> AddressDispenser {
        AddressDispenser {
            next: AtomicU64::new(bytecode_len as u64 + 0x1_0000),
        }
    }

    pub fn next_address(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::block::BasicBlock;

    #[test]
    fn synthesized_addresses_never_collide_with_bytecode() {
        let dispenser = AddressDispenser::starting_after(10);
        let addr = dispenser.next_address();
        assert!(addr > 10);
    }

    #[test]
    fn loader_is_function_zero() {
        let f = Function::new(0, BasicBlock::new(0));
        let c = Contract::new(f, vec![]);
        assert_eq!(c.loader(), FunctionId(0));
    }
}
