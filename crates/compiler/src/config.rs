//! Compiler configuration surface.
//!
//! `CompilerConfig` is a small builder struct in the style of the teacher's
//! `CompilerConfig`/`ExternalBuiltin` extensibility pattern: host-tunable
//! knobs that do not belong on the pipeline's fixed call signature.
//!
//! # Example
//!
//! ```rust,ignore
//! use kenaf_compiler::config::CompilerConfig;
//!
//! let config = CompilerConfig::new()
//!     .with_max_registers(200)
//!     .with_fold_diagnostics(true);
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Upper bound on stack_size a single function may allocate. The
    /// original has no hard cap beyond `u8::MAX` (stack_size is a byte in
    /// the code_function header, §6.1); this lets a host clamp lower.
    pub max_registers: u8,
    /// Whether `ir_fold`'s locally-recovered diagnostics ("this op always
    /// throws") are collected and returned alongside a successful compile.
    pub fold_diagnostics: bool,
    /// Whether `ir_emit`/`ir_alloc` pipeline-stage op/register counts are
    /// logged at `tracing::debug!` (§6.5).
    pub trace_pipeline: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            max_registers: u8::MAX,
            fold_diagnostics: true,
            trace_pipeline: false,
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_registers(mut self, max: u8) -> Self {
        self.max_registers = max;
        self
    }

    pub fn with_fold_diagnostics(mut self, enabled: bool) -> Self {
        self.fold_diagnostics = enabled;
        self
    }

    pub fn with_trace_pipeline(mut self, enabled: bool) -> Self {
        self.trace_pipeline = enabled;
        self
    }

    /// Load a `CompilerConfig` from a TOML file, the way the teacher's
    /// lint configuration is loaded from disk.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allows_full_register_range() {
        assert_eq!(CompilerConfig::new().max_registers, u8::MAX);
    }

    #[test]
    fn from_toml_round_trips() {
        let cfg = CompilerConfig::from_toml_str("max_registers = 64\n").unwrap();
        assert_eq!(cfg.max_registers, 64);
        assert!(cfg.fold_diagnostics);
    }
}
