//! kenaf-vm: loads a packed `code_script` blob and runs it.
//!
//! This does not parse kenaf source text (lexing/parsing is out of
//! scope); it consumes the binary format `kenaf_compiler::code_unit`
//! packs, the same bytes a compiler front end or a test fixture would
//! hand to `kenaf_runtime::loader::load_script`.

use std::path::PathBuf;
use std::process;

use clap::{Parser as ClapParser, Subcommand};
use kenaf_runtime::Kenaf;

#[derive(ClapParser)]
#[command(name = "kenaf-vm")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a compiled kenaf code_script", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and call a code_script's entry function
    Run {
        /// Packed code_script blob
        input: PathBuf,

        /// Print the heap object count and bytes allocated after the call
        #[arg(long)]
        stats: bool,
    },
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { input, stats } => run(&input, stats),
    }
}

fn run(input: &std::path::Path, stats: bool) {
    let bytes = match std::fs::read(input) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("error reading {}: {e}", input.display());
            process::exit(1);
        }
    };

    let kenaf = Kenaf::new();
    let entry = match kenaf.load(&bytes) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("error loading {}: {e}", input.display());
            process::exit(1);
        }
    };

    match kenaf.call(entry, &[]) {
        Ok(results) => {
            for v in &results {
                println!("{v:?}");
            }
        }
        Err(e) => {
            eprintln!("{}: {e}", input.display());
            process::exit(1);
        }
    }

    kenaf.safepoint();

    if stats {
        eprintln!("objects: {}, bytes: {}", kenaf.object_count(), kenaf.heap_bytes());
    }
}
