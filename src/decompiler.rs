//! Top-level pipeline driver: lift, optimize to a fixed point, structure,
//! convert to the AST, emit code. Grounded in `original_source/source/
//! decompiler.py`'s top-level `decompile`, including its two-pass handling
//! of a JSON artifact's separate `bytecode` (constructor) and
//! `deployedBytecode` (runtime) fields.

use tracing::info_span;

use crate::ast::{self, StructuredContract};
use crate::codegen::{self, Stats};
use crate::common::Settings;
use crate::error::InputError;
use crate::input::{self, Artifact};
use crate::ir::contract::{AddressDispenser, Contract};
use crate::ir::function::FunctionId;
use crate::ir::instruction::Instruction;
use crate::ir::opcode;
use crate::lifter;
use crate::optimize;
use crate::structuring;

pub struct DecompileResult {
    pub code: String,
    pub stats: Stats,
}

/// Runs the full pipeline over one already-decoded bytecode blob: lift,
/// optimize to a local fixed point, structure, convert to the AST.
fn decompile_bytecode(bytecode: &[u8], settings: &Settings) -> (StructuredContract, usize) {
    let bytecode = input::remove_swarm_hash(bytecode).to_vec();
    let num_evm_instrs = {
        let _span = info_span!("decode").entered();
        opcode::decode(&bytecode).len()
    };

    let mut contract = {
        let _span = info_span!("lift").entered();
        let loader = lifter::lift(&bytecode);
        Contract::new(loader, bytecode.clone())
    };

    {
        let _span = info_span!("optimize").entered();
        let dispenser = AddressDispenser::starting_after(contract.bytecode.len());
        while optimize::optimize_contract(&mut contract, settings, &dispenser) {}
    }

    let structured = {
        let _span = info_span!("structure").entered();
        let loops = structuring::discover_loops(&contract, settings);
        let follows = structuring::discover_cond_follows(&contract, &loops);
        let _emit = info_span!("emit").entered();
        ast::convert(&contract, &loops, &follows, None)
    };

    (structured, num_evm_instrs)
}

/// Shifts every `FunctionId` this contract's own functions were numbered
/// with by `base`, so it can be appended after another contract's function
/// list without its `Call` targets resolving to the wrong function.
fn renumber(mut contract: StructuredContract, base: usize) -> StructuredContract {
    for f in &mut contract.functions {
        f.id = FunctionId(f.id.0 + base);
        for node in &mut f.nodes {
            if let crate::ast::AstNode::Sequence { instructions, .. } = node {
                for ins in instructions.iter_mut() {
                    if let Instruction::Call { target, .. } = ins {
                        *target = FunctionId(target.0 + base);
                    }
                }
            }
        }
    }
    contract.constructor = contract.constructor.map(|id| FunctionId(id.0 + base));
    contract
}

/// Appends `extra`'s functions onto `base`'s, renumbering `extra` to a
/// disjoint `FunctionId` space, and marks `constructor` as the renumbered
/// id of `extra`'s own loader (function 0 in its original numbering).
fn merge_constructor(mut base: StructuredContract, extra: StructuredContract) -> StructuredContract {
    let offset = base.functions.len();
    let extra = renumber(extra, offset);
    let constructor_id = extra.functions.iter().find(|f| f.id.0 == offset).map(|f| f.id);
    base.functions.extend(extra.functions);
    base.constructor = constructor_id;
    base
}

/// Decompiles a complete input (raw hex or JSON artifact). A JSON artifact
/// with a `deployedBytecode` field is decompiled in two passes: the runtime
/// bytecode becomes the primary listing (`loader` plus discovered external
/// functions), and the constructor's own init-code bytecode is decompiled
/// separately and spliced in as the `constructor` function.
pub fn decompile(input_text: &str, settings: &Settings) -> Result<DecompileResult, InputError> {
    let artifact: Artifact = input::load(input_text)?;

    let (structured, num_evm_instrs) = match artifact.deployed_bytecode {
        Some(deployed) => {
            let (runtime, runtime_instrs) = decompile_bytecode(&deployed, settings);
            let (constructor, ctor_instrs) = decompile_bytecode(&artifact.bytecode, settings);
            (merge_constructor(runtime, constructor), runtime_instrs + ctor_instrs)
        }
        None => decompile_bytecode(&artifact.bytecode, settings),
    };

    let (code, stats) = codegen::generate_code(&structured, num_evm_instrs);
    Ok(DecompileResult { code, stats })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decompiles_trivial_stop_program() {
        // PUSH1 0x00, PUSH1 0x00, STOP - a minimal, already-terminating
        // loader with nothing to structure.
        let bytecode = hex::decode("600060000000").unwrap();
        let hex_input = format!("0x{}", hex::encode(&bytecode));
        let settings = Settings::default();
        let result = decompile(&hex_input, &settings).unwrap();
        assert!(result.code.contains("function loader("));
        assert!(result.stats.num_evm_instrs > 0);
    }

    #[test]
    fn odd_length_hex_is_a_fatal_input_error() {
        let settings = Settings::default();
        assert!(matches!(decompile("0x600", &settings), Err(InputError::OddLength)));
    }

    #[test]
    fn json_artifact_splices_in_a_constructor() {
        // Both stages are the same trivial STOP program; what's under test
        // is that the merge produces a `constructor` function distinct
        // from `loader` with no FunctionId collision.
        let text = r#"{"bytecode": "0x600060000000", "deployedBytecode": "0x600060000000"}"#;
        let settings = Settings::default();
        let result = decompile(text, &settings).unwrap();
        assert!(result.code.contains("function loader("));
        assert!(result.code.contains("function constructor("));
    }
}
