//! Kenaf compiler library.
//!
//! Turns a resolved `AstModule` into a packed `code_script` blob: resolve
//! scopes, build each function's SSA IR, fold constants and dead phis,
//! compute liveness, inline constants and build that function's own
//! constant/selector tables, allocate registers, emit bytecode, and pack
//! the whole module (§4-6).
//!
//! ```rust,ignore
//! use kenaf_compiler::{compile_module, CompilerConfig};
//!
//! let bytes = compile_module(&mut ast_module, "main.kf", &CompilerConfig::new())?;
//! ```

pub mod ast;
pub mod bytecode;
pub mod code_unit;
pub mod config;
pub mod error;
pub mod ir;
pub mod ir_alloc;
pub mod ir_build;
pub mod ir_emit;
pub mod ir_fold;
pub mod ir_foldk;
pub mod ir_live;
pub mod regmap;
pub mod resolver;

pub use config::CompilerConfig;
pub use error::{CompileError, Diagnostic};

use ast::AstModule;
use code_unit::{pack_script, CompiledFunction};
use ir_foldk::{ConstTable, SelectorTable};

/// Everything one function's compile produced, kept alive long enough to
/// be packed once every function in the module has compiled.
struct Compiled {
    ir: ir::IrFunction,
    emitted: ir_emit::Emitted,
    constants: ConstTable,
    selectors: SelectorTable,
}

/// Result of a successful compile: the packed bytecode blob plus any
/// locally-recovered diagnostics `ir_fold` collected along the way
/// (§7 "Locally recovered" -- these never fail the compile).
pub struct CompileOutput {
    pub bytes: Vec<u8>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Resolve every function in `module`, then run each one through the full
/// IR pipeline and pack the result into a `code_script` blob.
pub fn compile_module(
    module: &mut AstModule,
    script_name: &str,
    config: &CompilerConfig,
) -> Result<CompileOutput, CompileError> {
    let func_indices: Vec<_> = module.functions.indices().collect();

    for &func in &func_indices {
        let mut resolver = resolver::Resolver::new(module);
        resolver.resolve_function(func)?;
    }

    let mut diagnostics = Vec::new();
    let mut compiled = Vec::with_capacity(module.functions.len());

    for &func in &func_indices {
        if config.trace_pipeline {
            tracing::debug!(function = func.0, "building IR");
        }

        let mut f = ir_build::build_function(module, func)?;

        ir_live::analyze(&mut f);
        let fold_diagnostics = ir_fold::fold(&mut f);
        if config.fold_diagnostics {
            diagnostics.extend(fold_diagnostics);
        }
        ir_live::analyze(&mut f);

        let mut constants = ConstTable::default();
        let mut selectors = SelectorTable::default();
        ir_foldk::fold_constants_and_build_tables(&mut f, &mut constants, &mut selectors)?;

        ir_alloc::allocate(&mut f, config)?;
        let emitted = ir_emit::emit(&f)?;

        if config.trace_pipeline {
            tracing::debug!(
                function = func.0,
                ops = f.ops.len(),
                instrs = emitted.instrs.len(),
                stack_size = f.stack_size,
                "emitted function"
            );
        }

        compiled.push(Compiled { ir: f, emitted, constants, selectors });
    }

    let functions: Vec<CompiledFunction> = compiled
        .iter()
        .map(|c| CompiledFunction {
            ir: &c.ir,
            emitted: &c.emitted,
            constants: &c.constants,
            selectors: &c.selectors,
        })
        .collect();

    let bytes = pack_script(script_name, &functions)?;
    Ok(CompileOutput { bytes, diagnostics })
}
