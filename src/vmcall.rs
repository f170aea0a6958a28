//! Names of the "virtual machine calls" the lifter synthesizes for
//! instructions that don't fit the plain assign/jump/jcond/call shape:
//! environment queries, logging, and the handful of terminating operations.

use derive_more::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum VmCall {
    Balance,
    Blockhash,
    Byte,
    Calldataload,
    Calldataread,
    Coderead,
    Returndataread,
    Haltreturn,
    Log,
    Messagecall,
    Delegatecall,
    Msize,
    Returndatasize,
    Revert,
    Selfdestruct,
    Sha3,
    Stop,
    Extcodesize,
    Codesize,
    Create,
}

impl VmCall {
    pub fn name(self) -> &'static str {
        match self {
            VmCall::Balance => "balance",
            VmCall::Blockhash => "blockhash",
            VmCall::Byte => "byte",
            VmCall::Calldataload => "calldataload",
            VmCall::Calldataread => "calldataread",
            VmCall::Coderead => "coderead",
            VmCall::Returndataread => "returndataread",
            VmCall::Haltreturn => "haltreturn",
            VmCall::Log => "log",
            VmCall::Messagecall => "messagecall",
            VmCall::Delegatecall => "delegatecall",
            VmCall::Msize => "msize",
            VmCall::Returndatasize => "returndatasize",
            VmCall::Revert => "revert",
            VmCall::Selfdestruct => "selfdestruct",
            VmCall::Sha3 => "sha3",
            VmCall::Stop => "stop",
            VmCall::Extcodesize => "extcodesize",
            VmCall::Codesize => "codesize",
            VmCall::Create => "create",
        }
    }

    /// Calls whose result depends only on their arguments, so duplicate
    /// calls can be treated as definitely equal and eliminated if unused.
    pub fn is_pure(self) -> bool {
        matches!(self, VmCall::Calldataload | VmCall::Sha3)
    }

    /// Calls that never return control to the calling basic block.
    pub fn is_terminating(self) -> bool {
        matches!(
            self,
            VmCall::Haltreturn | VmCall::Stop | VmCall::Revert | VmCall::Selfdestruct
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_and_stop_terminate() {
        assert!(VmCall::Revert.is_terminating());
        assert!(VmCall::Stop.is_terminating());
        assert!(!VmCall::Log.is_terminating());
    }

    #[test]
    fn calldataload_and_sha3_are_pure() {
        assert!(VmCall::Calldataload.is_pure());
        assert!(VmCall::Sha3.is_pure());
        assert!(!VmCall::Log.is_pure());
    }
}
