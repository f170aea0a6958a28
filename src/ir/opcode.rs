//! The raw, byte-level instruction set (low-level IR): one `Opcode` per
//! mnemonic plus the handful that carry an inline operand (`PUSH`, `DUP`,
//! `SWAP`, `LOG`). Named the way the original renamed two opcodes that would
//! otherwise collide with reserved words in a target language: `CALL` here
//! is `Messagecall`, and `RETURN` is `Haltreturn`.

use derive_more::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum Opcode {
    Stop,
    Add,
    Mul,
    Sub,
    Div,
    Sdiv,
    Mod,
    Smod,
    Addmod,
    Mulmod,
    Exp,
    Signextend,
    Lt,
    Gt,
    Slt,
    Sgt,
    Eq,
    Iszero,
    And,
    Or,
    Xor,
    Not,
    Byte,
    Shl,
    Shr,
    Sar,
    Sha3,
    Address,
    Balance,
    Origin,
    Caller,
    Callvalue,
    Calldataload,
    Calldatasize,
    Calldatacopy,
    Codesize,
    Codecopy,
    Gasprice,
    Extcodesize,
    Extcodecopy,
    Returndatasize,
    Returndatacopy,
    Blockhash,
    Coinbase,
    Timestamp,
    Number,
    Difficulty,
    Gaslimit,
    Pop,
    Mload,
    Mstore,
    Mstore8,
    Sload,
    Sstore,
    Jump,
    Jumpi,
    Pc,
    Msize,
    Gas,
    Jumpdest,
    /// Inline operand: how many bytes were pushed (1-32).
    Push(u8),
    /// Inline operand: which stack slot, 1-16.
    Dup(u8),
    /// Inline operand: which stack slot, 1-16.
    Swap(u8),
    /// Inline operand: how many topics, 0-4.
    Log(u8),
    Create,
    /// Renamed from `CALL` to avoid colliding with the host language's own
    /// call vocabulary.
    Messagecall,
    Callcode,
    /// Renamed from `RETURN`.
    Haltreturn,
    Delegatecall,
    Create2,
    Staticcall,
    Revert,
    Invalid,
    Selfdestruct,
    /// Any byte value this table doesn't recognize; the decoder never fails
    /// outright, it degrades to this and lets later passes decide.
    Unknown(u8),
}

/// Opcodes after which a basic block always ends: unconditional control
/// transfers and the halting instructions.
pub fn is_ending_instruction(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::Jump
            | Opcode::Jumpi
            | Opcode::Haltreturn
            | Opcode::Stop
            | Opcode::Revert
            | Opcode::Invalid
            | Opcode::Selfdestruct
            | Opcode::Unknown(_)
    )
}

fn is_push(b: u8) -> bool {
    (0x60..=0x7f).contains(&b)
}
fn is_dup(b: u8) -> bool {
    (0x80..=0x8f).contains(&b)
}
fn is_swap(b: u8) -> bool {
    (0x90..=0x9f).contains(&b)
}
fn is_log(b: u8) -> bool {
    (0xa0..=0xa4).contains(&b)
}

fn fixed_opcode(b: u8) -> Option<Opcode> {
    use Opcode::*;
    Some(match b {
        0x00 => Stop,
        0x01 => Add,
        0x02 => Mul,
        0x03 => Sub,
        0x04 => Div,
        0x05 => Sdiv,
        0x06 => Mod,
        0x07 => Smod,
        0x08 => Addmod,
        0x09 => Mulmod,
        0x0a => Exp,
        0x0b => Signextend,
        0x10 => Lt,
        0x11 => Gt,
        0x12 => Slt,
        0x13 => Sgt,
        0x14 => Eq,
        0x15 => Iszero,
        0x16 => And,
        0x17 => Or,
        0x18 => Xor,
        0x19 => Not,
        0x1a => Byte,
        0x1b => Shl,
        0x1c => Shr,
        0x1d => Sar,
        0x20 => Sha3,
        0x30 => Address,
        0x31 => Balance,
        0x32 => Origin,
        0x33 => Caller,
        0x34 => Callvalue,
        0x35 => Calldataload,
        0x36 => Calldatasize,
        0x37 => Calldatacopy,
        0x38 => Codesize,
        0x39 => Codecopy,
        0x3a => Gasprice,
        0x3b => Extcodesize,
        0x3c => Extcodecopy,
        0x3d => Returndatasize,
        0x3e => Returndatacopy,
        0x40 => Blockhash,
        0x41 => Coinbase,
        0x42 => Timestamp,
        0x43 => Number,
        0x44 => Difficulty,
        0x45 => Gaslimit,
        0x50 => Pop,
        0x51 => Mload,
        0x52 => Mstore,
        0x53 => Mstore8,
        0x54 => Sload,
        0x55 => Sstore,
        0x56 => Jump,
        0x57 => Jumpi,
        0x58 => Pc,
        0x59 => Msize,
        0x5a => Gas,
        0x5b => Jumpdest,
        0xf0 => Create,
        0xf1 => Messagecall,
        0xf2 => Callcode,
        0xf3 => Haltreturn,
        0xf4 => Delegatecall,
        0xf5 => Create2,
        0xfa => Staticcall,
        0xfd => Revert,
        0xfe => Invalid,
        0xff => Selfdestruct,
        _ => return None,
    })
}

/// One decoded low-level instruction: its opcode, address, and (for `PUSH`)
/// the literal pushed, carried separately since it can be wider than a byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInstruction {
    pub opcode: Opcode,
    pub address: usize,
    /// Present only for `PUSH`; the big-endian immediate that follows it.
    pub push_value: Option<crate::common::Word>,
    pub raw_bytes: Vec<u8>,
}

/// Decode a flat bytecode buffer into the sequence of low-level
/// instructions, mirroring the original's byte-walking loop: `PUSH1..32`
/// consume their immediate, `DUP`/`SWAP`/`LOG` encode their operand in the
/// opcode byte itself, anything else unrecognized becomes `Unknown`.
pub fn decode(bytecode: &[u8]) -> Vec<RawInstruction> {
    let mut result = Vec::new();
    let mut index = 0usize;
    while index < bytecode.len() {
        let addr = index;
        let byte = bytecode[index];
        index += 1;

        let (opcode, push_value) = if is_push(byte) {
            let length = (byte - 0x60 + 1) as usize;
            let end = (index + length).min(bytecode.len());
            let value = big_endian_decode(&bytecode[index..end]);
            index = end;
            (Opcode::Push(length as u8), Some(value))
        } else if is_dup(byte) {
            (Opcode::Dup(byte - 0x80 + 1), None)
        } else if is_swap(byte) {
            (Opcode::Swap(byte - 0x90 + 1), None)
        } else if is_log(byte) {
            (Opcode::Log(byte - 0xa0), None)
        } else if let Some(op) = fixed_opcode(byte) {
            (op, None)
        } else {
            (Opcode::Unknown(byte), None)
        };

        let raw_bytes = bytecode[addr..index].to_vec();
        result.push(RawInstruction {
            opcode,
            address: addr,
            push_value,
            raw_bytes,
        });
    }
    result
}

pub fn big_endian_decode(bytes: &[u8]) -> crate::common::Word {
    let mut v = crate::common::Word::ZERO;
    for &b in bytes {
        v = (v << 8) | crate::common::Word::from(b);
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_push1_followed_by_stop() {
        let code = [0x60, 0x2a, 0x00];
        let ins = decode(&code);
        assert_eq!(ins.len(), 2);
        assert_eq!(ins[0].opcode, Opcode::Push(1));
        assert_eq!(ins[0].push_value, Some(crate::common::Word::from(0x2au64)));
        assert_eq!(ins[1].opcode, Opcode::Stop);
        assert_eq!(ins[1].address, 2);
    }

    #[test]
    fn decodes_dup_swap_log_operands() {
        let code = [0x82, 0x93, 0xa2];
        let ins = decode(&code);
        assert_eq!(ins[0].opcode, Opcode::Dup(3));
        assert_eq!(ins[1].opcode, Opcode::Swap(4));
        assert_eq!(ins[2].opcode, Opcode::Log(2));
    }

    #[test]
    fn truncated_push_at_end_of_code_does_not_panic() {
        let code = [0x61, 0xff];
        let ins = decode(&code);
        assert_eq!(ins.len(), 1);
        assert_eq!(ins[0].opcode, Opcode::Push(2));
    }

    #[test]
    fn unknown_byte_becomes_unknown_opcode() {
        let code = [0x0c];
        let ins = decode(&code);
        assert_eq!(ins[0].opcode, Opcode::Unknown(0x0c));
    }
}
