use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BasicError {
    #[error("?SYNTAX ERROR in line {line}: {message}")]
    Compile { line: u32, message: String },

    #[error("{0}")]
    Runtime(Box<RuntimeError>),
}

pub const MAX_CAPTURED_VARS: usize = 10;

/// Runtime failure with enough context to debug a program from the error
/// text alone: line, disassembled instruction, pc, stack depth, original
/// source line and a capture of up to ten variables.
#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    pub line: u32,
    pub pc: usize,
    pub instruction: String,
    pub stack_size: usize,
    pub source: Option<String>,
    pub variables: Vec<(String, String)>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "?RUNTIME ERROR in line {}: {} [pc={} {} stack={}]",
            self.line, self.message, self.pc, self.instruction, self.stack_size
        )?;
        if let Some(src) = &self.source {
            write!(f, "\n  {} {}", self.line, src)?;
        }
        if !self.variables.is_empty() {
            let vars: Vec<String> = self
                .variables
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, "\n  vars: {}", vars.join(" "))?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}
