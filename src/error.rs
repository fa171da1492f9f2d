//! Error types for the runtime crate.
//!
//! These are host-facing setup/configuration errors only (§7 of the spec):
//! a bad call to `Context::new`, `Context::add_machine`, or
//! `StateMachine::verify` before the context is ready. The interpreter's
//! hot loop never returns a `Result` — cycle-by-cycle outcomes are recorded
//! as `ExecStatus` on the machine itself so execution never unwinds through
//! `Context::exec`.

use thiserror::Error;

/// Runtime setup/configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The shared evaluation stack was given zero capacity.
    #[error("stack capacity must be non-zero")]
    EmptyStack,

    /// A machine was registered with a locals array too large to index
    /// with the 1-byte/2-byte `LDL`/`STL` operand width.
    #[error("too many locals: {count} exceeds the addressable range")]
    TooManyLocals { count: usize },

    /// A machine was registered with more handlers than a 2-byte state
    /// index (`SST2`) can address.
    #[error("too many handlers: {count} exceeds the addressable range")]
    TooManyHandlers { count: usize },

    /// `Context::exec` or a syscall callback referenced a machine index
    /// that does not exist.
    #[error("machine index {index} out of bounds ({count} machines registered)")]
    NoSuchMachine { index: usize, count: usize },

    /// A syscall table had more entries than a 2-byte index (`SYS2`) can
    /// address.
    #[error("too many syscalls: {count} exceeds the addressable range")]
    TooManySyscalls { count: usize },
}

impl RuntimeError {
    /// Creates a new [`RuntimeError::TooManyLocals`].
    pub fn too_many_locals(count: usize) -> Self {
        Self::TooManyLocals { count }
    }

    /// Creates a new [`RuntimeError::TooManyHandlers`].
    pub fn too_many_handlers(count: usize) -> Self {
        Self::TooManyHandlers { count }
    }

    /// Creates a new [`RuntimeError::NoSuchMachine`].
    pub fn no_such_machine(index: usize, count: usize) -> Self {
        Self::NoSuchMachine { index, count }
    }

    /// Creates a new [`RuntimeError::TooManySyscalls`].
    pub fn too_many_syscalls(count: usize) -> Self {
        Self::TooManySyscalls { count }
    }
}

/// Convenience alias for runtime setup results.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
