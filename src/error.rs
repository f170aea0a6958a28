//! Error taxonomy for the decompiler.
//!
//! Fatal errors (`InputError`) abort the pipeline with a message. The
//! remaining variants describe *recoverable* failures: a pass that cannot
//! make progress reports one of these and the caller folds it into "no
//! change" rather than propagating a `Result` through the optimizer driver.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("malformed hex input")]
    MalformedHex,
    #[error("hex input has an odd number of digits")]
    OddLength,
    #[error("malformed JSON input: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("JSON input is missing a `bytecode` or `deployedBytecode` field")]
    MissingBytecodeField,
}

/// Raised when a bounded analysis (dataflow exploration, etc.) exceeds its
/// step budget before reaching a conclusive answer. Callers treat this as
/// "assume the conservative answer" rather than an error to report.
#[derive(Debug, Error)]
pub enum AnalysisGaveUp {
    #[error("exploration exceeded its step budget")]
    StepBudgetExceeded,
}

/// Raised when the control-flow structuring passes cannot find a valid
/// structure for some part of the graph. Callers fold this into leaving the
/// corresponding node un-structured (later emitted via `goto`).
#[derive(Debug, Error)]
pub enum StructuringFailure {
    #[error("could not determine a follow node for a loop")]
    NoLoopFollow,
    #[error("could not determine a follow node for a conditional")]
    NoCondFollow,
    #[error("control-flow graph is irreducible within the iteration budget")]
    Irreducible,
}

/// Represented for completeness: no interpreter ships in this crate, but the
/// taxonomy spec.md names would need this variant if one were added.
#[derive(Debug, Error)]
pub enum InvalidJumpTarget {
    #[error("jump to an address that is not a valid basic block start")]
    NotABlockStart,
}

/// Represented for completeness: no long-running harness ships in this
/// crate, so this marker type is never constructed.
#[derive(Debug, Error)]
pub enum TimeBudgetExceeded {}
