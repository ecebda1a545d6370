use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use cilantro_backend_c::emit_module;
use cilantro_core::Module;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cilantro", about = "Bytecode-to-C ahead-of-time recompiler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a summary of a JSON module description.
    Info {
        /// Path to a JSON module file.
        module: PathBuf,
    },
    /// Compile a module to a C translation unit.
    Compile {
        /// Path to a JSON module file.
        module: PathBuf,
        /// Output path for the generated C source.
        #[arg(short, long, default_value = "out.c")]
        output: PathBuf,
        /// Fail instead of stubbing when any method does not lower.
        #[arg(long)]
        strict: bool,
    },
}

fn load_module(path: &Path) -> Result<Module> {
    let file =
        File::open(path).with_context(|| format!("failed to open module: {}", path.display()))?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader)
        .with_context(|| format!("failed to parse module: {}", path.display()))
}

fn run_info(path: &Path) -> Result<()> {
    let module = load_module(path)?;
    println!("module: {}", module.name);
    println!("pointer size: {}", module.pointer_size);
    println!("types: {}", module.types.len());
    println!("methods: {}", module.methods.len());
    println!("fields: {}", module.fields.len());
    let with_bodies = module
        .methods
        .iter()
        .filter(|(_, m)| m.body.is_some())
        .count();
    println!("method bodies: {with_bodies}");
    Ok(())
}

fn run_compile(path: &Path, output: &Path, strict: bool) -> Result<()> {
    let module = load_module(path)?;
    eprintln!(
        "[compile] {} ({} methods)",
        module.name,
        module.methods.len()
    );
    let compiled = emit_module(&module)
        .with_context(|| format!("failed to compile module `{}`", module.name))?;
    for diag in &compiled.diagnostics {
        eprintln!("[stub] {}: {}", diag.name, diag.error);
    }
    if strict && !compiled.diagnostics.is_empty() {
        bail!(
            "{} method(s) failed to lower (strict mode)",
            compiled.diagnostics.len()
        );
    }
    fs::write(output, compiled.source)
        .with_context(|| format!("failed to write output: {}", output.display()))?;
    eprintln!(
        "[compile] wrote {} ({} stubbed)",
        output.display(),
        compiled.diagnostics.len()
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Info { module } => run_info(&module),
        Command::Compile {
            module,
            output,
            strict,
        } => run_compile(&module, &output, strict),
    }
}
