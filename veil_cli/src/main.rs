//! Veil obfuscator command-line interface
//!
//! Loads an IR module from JSON, runs the selected obfuscation passes over
//! it, re-verifies the result, and writes it back out.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use veil_ir::{verify_module, Module};
use veil_passes::{
    BogusFlowPass, FlatteningPass, Pipeline, StringObfuscationPass, SubstitutionPass,
};

/// IR obfuscation driver
#[derive(Parser)]
#[command(name = "veil")]
#[command(about = "Obfuscate IR modules: bogus control flow, flattening, substitution, strings")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured pass pipeline over a module
    Obfuscate {
        /// Input module (JSON)
        input: PathBuf,

        /// Where to write the transformed module
        #[arg(short, long)]
        output: PathBuf,

        /// Insert bogus control flow
        #[arg(long)]
        boguscf: bool,

        /// Probability [%] each basic block is obfuscated by --boguscf
        #[arg(long, default_value_t = 70, value_parser = clap::value_parser!(u32).range(0..=100))]
        bcf_prob: u32,

        /// Flatten the control-flow graph
        #[arg(long)]
        flattening: bool,

        /// Substitute arithmetic instructions
        #[arg(long)]
        subobf: bool,

        /// How many times --subobf loops on a function
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..))]
        sub_loop: u32,

        /// Probability [%] each instruction is rewritten by --subobf
        #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u32).range(0..=100))]
        sub_prob: u32,

        /// Encrypt single-use constant strings
        #[arg(long)]
        obfstr: bool,
    },

    /// Print a module in textual form
    Show {
        /// Input module (JSON)
        input: PathBuf,
    },

    /// Check a module against the verifier
    Verify {
        /// Input module (JSON)
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    match cli.command {
        Commands::Obfuscate {
            input,
            output,
            boguscf,
            bcf_prob,
            flattening,
            subobf,
            sub_loop,
            sub_prob,
            obfstr,
        } => {
            let mut module = load_module(&input)?;
            verify_module(&module)
                .with_context(|| format!("input module {} is not verifier-clean", input.display()))?;

            // Strings first, so the inserted runtime calls are themselves
            // fed through the control-flow passes.
            let mut pipeline = Pipeline::new();
            if obfstr {
                pipeline.add_module_pass(Box::new(StringObfuscationPass::new()));
            }
            if subobf {
                pipeline.add_function_pass(Box::new(SubstitutionPass::new(sub_loop, sub_prob)));
            }
            if boguscf {
                pipeline.add_function_pass(Box::new(BogusFlowPass::new(bcf_prob)));
            }
            if flattening {
                pipeline.add_function_pass(Box::new(FlatteningPass::new()));
            }
            if pipeline.is_empty() {
                bail!("no passes selected; try --boguscf, --flattening, --subobf or --obfstr");
            }

            let changed = pipeline.run(&mut module);
            verify_module(&module).context("pass pipeline produced an invalid module")?;
            save_module(&output, &module)?;
            log::info!(
                "wrote {} ({})",
                output.display(),
                if changed { "transformed" } else { "unchanged" }
            );
            Ok(())
        }
        Commands::Show { input } => {
            let module = load_module(&input)?;
            print!("{module}");
            Ok(())
        }
        Commands::Verify { input } => {
            let module = load_module(&input)?;
            verify_module(&module)
                .with_context(|| format!("{} failed verification", input.display()))?;
            println!("{}: ok", input.display());
            Ok(())
        }
    }
}

fn load_module(path: &Path) -> Result<Module> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn save_module(path: &Path, module: &Module) -> Result<()> {
    let text = serde_json::to_string_pretty(module).context("serializing module")?;
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}
