use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod compiler;
mod config;
mod stdlib;
mod vm;

use config::{ProjectManifest, RuntimeConfig};
use vm::{bytecode, debug, VM};

#[derive(Parser)]
#[command(name = "opal")]
#[command(about = "A small dynamically-typed scripting language", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an opal source file
    Run {
        /// The source file to run (defaults to the opal.toml entry)
        file: Option<PathBuf>,

        /// Trace garbage collection cycles
        #[arg(long)]
        trace_gc: bool,

        /// Print GC statistics after the run
        #[arg(long)]
        gc_stats: bool,

        /// Override the heap capacity (objects)
        #[arg(long)]
        heap_capacity: Option<usize>,

        /// Override the operand stack capacity (slots)
        #[arg(long)]
        stack_capacity: Option<usize>,

        /// Override the call-frame capacity
        #[arg(long)]
        frame_capacity: Option<usize>,
    },
    /// Compile a source file to a bytecode container
    Build {
        /// The source file to compile
        file: PathBuf,

        /// Output path (defaults to the input with an .opalb extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run a precompiled bytecode container
    Exec {
        /// The .opalb file to execute
        file: PathBuf,
    },
    /// Disassemble a source file or bytecode container
    Disasm {
        /// The .opal or .opalb file to list
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            file,
            trace_gc,
            gc_stats,
            heap_capacity,
            stack_capacity,
            frame_capacity,
        } => run_command(
            file,
            trace_gc,
            gc_stats,
            heap_capacity,
            stack_capacity,
            frame_capacity,
        ),
        Commands::Build { file, output } => build_command(&file, output),
        Commands::Exec { file } => exec_command(&file),
        Commands::Disasm { file } => disasm_command(&file),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_command(
    file: Option<PathBuf>,
    trace_gc: bool,
    gc_stats: bool,
    heap_capacity: Option<usize>,
    stack_capacity: Option<usize>,
    frame_capacity: Option<usize>,
) -> Result<(), String> {
    let mut config = RuntimeConfig {
        trace_gc,
        gc_stats,
        ..Default::default()
    };

    let path = match file {
        Some(p) => p,
        None => {
            let cwd = std::env::current_dir().map_err(|e| e.to_string())?;
            match ProjectManifest::load(&cwd) {
                Ok(manifest) => {
                    manifest.apply(&mut config);
                    cwd.join(&manifest.package.entry)
                }
                Err(_) => {
                    return Err(
                        "no file specified and no opal.toml found\n\
                         usage: opal run <file> or run from an opal project directory"
                            .to_string(),
                    );
                }
            }
        }
    };

    // Command-line overrides win over the manifest.
    if let Some(n) = heap_capacity {
        config.heap_capacity = n;
    }
    if let Some(n) = stack_capacity {
        config.stack_capacity = n;
    }
    if let Some(n) = frame_capacity {
        config.frame_capacity = n;
    }

    compiler::run_file(&path, &config)
}

fn build_command(file: &Path, output: Option<PathBuf>) -> Result<(), String> {
    let source = std::fs::read_to_string(file)
        .map_err(|e| format!("failed to read {}: {}", file.display(), e))?;
    let chunk = compiler::compile_source(&source)
        .map_err(|errors| compiler::format_errors(&errors))?;
    let out_path = output.unwrap_or_else(|| file.with_extension("opalb"));
    bytecode::write_file(&out_path, &chunk).map_err(|e| e.to_string())?;
    println!("wrote {}", out_path.display());
    Ok(())
}

fn exec_command(file: &Path) -> Result<(), String> {
    let chunk = bytecode::read_file(file).map_err(|e| e.to_string())?;
    let config = RuntimeConfig::default();
    let mut vm = VM::new(&config);
    stdlib::register_default_natives(&mut vm).map_err(|e| e.to_string())?;
    vm.run(&chunk).map_err(|e| e.to_string())
}

fn disasm_command(file: &Path) -> Result<(), String> {
    let chunk = if file.extension().is_some_and(|e| e == "opalb") {
        bytecode::read_file(file).map_err(|e| e.to_string())?
    } else {
        let source = std::fs::read_to_string(file)
            .map_err(|e| format!("failed to read {}: {}", file.display(), e))?;
        compiler::compile_source(&source).map_err(|errors| compiler::format_errors(&errors))?
    };
    let name = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "chunk".to_string());
    print!("{}", debug::disassemble(&chunk, &name));
    Ok(())
}
