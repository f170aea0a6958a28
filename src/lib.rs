//! A stack-machine bytecode decompiler, as a library. See `src/bin` for the
//! CLI binary using it.

#![allow(dead_code)]

pub mod common;
pub mod error;
pub mod settings;
pub mod vmcall;
pub mod ir;
pub mod lifter;
pub mod dataflow;
pub mod rewrites;
pub mod propagation;
pub mod elimination;
pub mod functions;
pub mod optimize;
pub mod structuring;
pub mod ast;
pub mod codegen;
pub mod input;
pub mod decompiler;
