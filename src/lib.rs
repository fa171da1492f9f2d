//! # trex-rt
//!
//! An embedded cooperative runtime: a verified stack-bytecode interpreter
//! and scheduler for many small state machines sharing one execution
//! budget per tick.
//!
//! Bytecode is verified once, ahead of time, by a two-pass verifier that
//! proves every instruction's stack and branch behavior is safe before the
//! interpreter ever runs it. A scheduler then round-robins a fixed cycle
//! budget across every verified, runnable machine, handing each one a
//! resumable slice of execution and rotating away only at a handler
//! boundary.
//!
//! ## Architecture
//!
//! - **OpCode**: the closed, fixed-width instruction set
//! - **StateHandler / VerifyStatus**: one verified byte range and its outcome
//! - **StateMachine / ExecStatus**: a handler table, locals, and lifecycle state
//! - **SyscallTable / SyscallDescriptor**: the host-call ABI
//! - **Context**: the shared evaluation stack, syscall table, and working registers
//! - **verifier**: the two-pass ahead-of-time soundness proof
//! - **interpreter**: the cycle-by-cycle dispatch loop
//! - **scheduler**: round-robin execution across a context's machines
//!
//! ## Example
//!
//! ```rust,no_run
//! use trex_rt::{Context, OpCode, RuntimeLimits, StateMachine, SyscallTable};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // RET: a handler that does nothing and returns immediately.
//! let code = vec![OpCode::Ret as u8];
//!
//! let mut ctx = Context::new(64, 1000, SyscallTable::default(), RuntimeLimits::default())?;
//! let machine = ctx.add_machine(StateMachine::new(code.clone(), 0, 10));
//! ctx.verify_machine(machine, &[(0, code.len())])?;
//!
//! let report = trex_rt::scheduler::exec(&mut ctx);
//! println!("spent {} cycles", report.cycles_spent);
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

extern crate std;

/// Runtime setup/configuration errors.
pub mod error;
/// The fixed instruction set.
pub mod opcode;
/// State handlers and verification outcomes.
pub mod handler;
/// State machines and execution status.
pub mod machine;
/// The syscall ABI.
pub mod syscall;
/// The runtime context: shared stack, syscalls, and machines.
pub mod context;
/// The two-pass ahead-of-time verifier.
pub mod verifier;
/// The cycle-by-cycle dispatch loop.
pub mod interpreter;
/// Round-robin scheduling across a context's machines.
pub mod scheduler;

pub use context::{Context, RuntimeLimits};
pub use error::{RuntimeError, RuntimeResult};
pub use handler::{StateHandler, VerifyStatus};
pub use interpreter::{ExecOutcome, YieldReason};
pub use machine::{ExecStatus, StateMachine};
pub use opcode::OpCode;
pub use scheduler::ExecReport;
pub use syscall::{SyscallDescriptor, SyscallFn, SyscallTable};
