//! Error types for the DNX VM
//!
//! One enum covers image loading, name resolution, execution faults and
//! host-call failures. Execution faults are wrapped with the offending
//! opcode and instruction pointer before they reach the host.

use crate::opcodes::Opcode;
use thiserror::Error;

/// Result type for VM operations
pub type VmResult<T> = Result<T, VmError>;

/// VM errors
#[derive(Error, Debug)]
pub enum VmError {
    /// Malformed or truncated binary image
    #[error("load error: {reason}")]
    Load { reason: String },

    /// I/O failure while reading an image or translation file
    #[error("load error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown scene, function, definition or external name
    #[error("unknown {kind} '{name}'")]
    Lookup { kind: &'static str, name: String },

    /// Operator applied to incompatible value tags
    #[error("type error: {reason}")]
    Type { reason: String },

    /// Operation issued in the wrong VM state
    #[error("state error: {reason}")]
    State { reason: String },

    /// Index outside a table, array or locals range
    #[error("{what} index {index} out of range (len {len})")]
    Bounds {
        what: &'static str,
        index: i64,
        len: usize,
    },

    /// Operand stack underflow
    #[error("stack underflow: need {needed} values, have {available}")]
    StackUnderflow { needed: usize, available: usize },

    /// Integer division or modulo by zero
    #[error("division by zero")]
    DivisionByZero,

    /// External function raised through the registry
    #[error("host function '{name}' failed: {message}")]
    Host { name: String, message: String },

    /// Execution fault, tagged with the instruction that raised it
    #[error("{source} (opcode {opcode:?} at ip {ip})")]
    Fault {
        opcode: Opcode,
        ip: usize,
        #[source]
        source: Box<VmError>,
    },
}

impl VmError {
    /// Create a load error from anything stringy
    pub fn load(reason: impl Into<String>) -> Self {
        VmError::Load {
            reason: reason.into(),
        }
    }

    /// Create a type error from anything stringy
    pub fn type_error(reason: impl Into<String>) -> Self {
        VmError::Type {
            reason: reason.into(),
        }
    }

    /// Create a state error from anything stringy
    pub fn state(reason: impl Into<String>) -> Self {
        VmError::State {
            reason: reason.into(),
        }
    }

    /// Wrap an execution fault with the opcode and ip that raised it.
    /// Faults already tagged are left as-is so the innermost location wins.
    pub fn at(self, opcode: Opcode, ip: usize) -> Self {
        match self {
            VmError::Fault { .. } => self,
            other => VmError::Fault {
                opcode,
                ip,
                source: Box::new(other),
            },
        }
    }
}
