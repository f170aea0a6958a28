//! the decompiler CLI. takes a bytecode file (raw hex or JSON build
//! artifact) and prints the recovered pseudo-program plus statistics.
//!
//! run with `--help` for more info.

use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use stackdecomp::common::Settings;
use stackdecomp::decompiler;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the input file: raw hex bytecode, or a JSON build artifact with
    /// `bytecode`/`deployedBytecode` fields
    file: String,
    /// print statistics (num_evm_instrs, num_gotos, funcs_with_gotos) as
    /// JSON alongside the code
    #[arg(short, long, default_value_t = false)]
    stats: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let input = std::fs::read_to_string(&args.file)
        .with_context(|| format!("could not read {}", args.file))?;
    let settings = Settings::default();

    let start = Instant::now();
    match decompiler::decompile(&input, &settings) {
        Ok(result) => {
            println!("{}", result.code);
            if args.stats {
                println!("{}", serde_json::to_string_pretty(&result.stats)?);
            }
        }
        Err(err) => {
            let running_time = start.elapsed().as_secs_f64();
            let record = serde_json::json!({
                "failure": { "error": err.to_string() },
                "running_time": running_time,
            });
            println!("{}", serde_json::to_string_pretty(&record)?);
            std::process::exit(1);
        }
    }

    Ok(())
}
