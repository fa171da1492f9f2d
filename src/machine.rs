//! State machines (§3): handlers sharing locals and a current state.

use crate::handler::StateHandler;

/// Execution status of a [`StateMachine`] (§6).
///
/// The `error-*` variants are terminal: once reached, the scheduler skips
/// the machine forever (§7). `Halted` is also terminal but not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// At least one handler failed verification; the machine cannot run.
    NotExecutable,
    /// Waiting to enter its next state (`nxst`).
    Ready,
    /// Inside a handler, between cycles.
    Executing,
    /// Transiently inside a host syscall callback.
    InSyscall,
    /// Reached `HALT`; terminal.
    Halted,
    /// Hit a handler that was never verified. Terminal.
    ErrorUnverified,
    /// A syscall didn't pop exactly its declared `args`. Terminal.
    ErrorSyscMismatchedArgs,
    /// A syscall didn't push exactly its declared `returns`. Terminal.
    ErrorSyscMismatchedRets,
    /// A syscall signalled a bad argument. Terminal.
    ErrorSyscInvalidArg,
    /// A syscall signalled it was called in an invalid machine state. Terminal.
    ErrorSyscInvalidState,
}

impl ExecStatus {
    /// `true` for `Halted` or any `Error*` variant — states the scheduler
    /// never selects again.
    pub fn is_terminal(self) -> bool {
        use ExecStatus::*;
        matches!(
            self,
            Halted
                | ErrorUnverified
                | ErrorSyscMismatchedArgs
                | ErrorSyscMismatchedRets
                | ErrorSyscInvalidArg
                | ErrorSyscInvalidState
        )
    }

    /// `true` for any of the `Error*` variants.
    pub fn is_error(self) -> bool {
        use ExecStatus::*;
        matches!(
            self,
            ErrorUnverified
                | ErrorSyscMismatchedArgs
                | ErrorSyscMismatchedRets
                | ErrorSyscInvalidArg
                | ErrorSyscInvalidState
        )
    }
}

/// A state machine: a handler table, its own locals, and a current state.
///
/// Locals and the handler table are exclusively owned here. The shared
/// evaluation stack and the syscall table live on [`crate::context::Context`]
/// instead, since at most one machine executes at a time (§5).
pub struct StateMachine {
    code: Vec<u8>,
    handlers: Vec<StateHandler>,
    locals: Vec<u32>,

    st: u16,
    nxst: u16,
    exec_status: ExecStatus,

    /// Configured per-tick iteration budget (§4.4, §9).
    iterations: u32,
    /// Counts down from `iterations` each time the handler reaches `RET`
    /// or `pc_end`; the scheduler rotates away when it hits zero.
    iterations_remaining: u32,
}

impl StateMachine {
    /// Creates a machine over `code`, with `locals_count` zeroed local
    /// slots and a per-entry iteration budget of `iterations`. The machine
    /// starts `NotExecutable` until [`StateMachine::verify_all`] succeeds.
    pub fn new(code: Vec<u8>, locals_count: usize, iterations: u32) -> Self {
        Self {
            code,
            handlers: Vec::new(),
            locals: vec![0; locals_count],
            st: 0,
            nxst: 0,
            exec_status: ExecStatus::NotExecutable,
            iterations: iterations.max(1),
            iterations_remaining: 0,
        }
    }

    /// The machine's code buffer, shared read-only by every handler's
    /// `[pc_start, pc_end)` range.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// The machine's handler table.
    pub fn handlers(&self) -> &[StateHandler] {
        &self.handlers
    }

    /// Replaces the handler table, resetting `exec_status` to
    /// `NotExecutable` until the new table is verified.
    pub fn set_handlers(&mut self, handlers: Vec<StateHandler>) {
        self.handlers = handlers;
        self.exec_status = ExecStatus::NotExecutable;
    }

    /// Mutable access to a single handler, e.g. for the verifier to record
    /// its outcome.
    pub fn handler_mut(&mut self, index: usize) -> Option<&mut StateHandler> {
        self.handlers.get_mut(index)
    }

    /// `true` once every handler is `Verified`; transitions the machine to
    /// `Ready` as a side effect (§3: initialized -> verified -> ready).
    pub fn mark_ready_if_all_verified(&mut self) -> bool {
        let all_verified = !self.handlers.is_empty()
            && self.handlers.iter().all(|h| h.is_verified());
        if all_verified {
            self.exec_status = ExecStatus::Ready;
        }
        all_verified
    }

    /// Read-only view of the locals array.
    pub fn locals(&self) -> &[u32] {
        &self.locals
    }

    /// Mutable view of the locals array, used by the interpreter.
    pub fn locals_mut(&mut self) -> &mut [u32] {
        &mut self.locals
    }

    /// The currently executing state index.
    pub fn current_state(&self) -> u16 {
        self.st
    }

    /// The state the machine will enter on its next `READY -> EXECUTING`
    /// transition.
    pub fn next_state(&self) -> u16 {
        self.nxst
    }

    /// Sets the next state (`SST*`'s effect).
    pub fn set_next_state(&mut self, state: u16) {
        self.nxst = state;
    }

    /// Adopts `nxst` as the current state; called by the interpreter on
    /// the `READY -> EXECUTING` transition.
    pub fn enter_next_state(&mut self) {
        self.st = self.nxst;
    }

    /// Current execution status.
    pub fn exec_status(&self) -> ExecStatus {
        self.exec_status
    }

    /// Sets the execution status.
    pub fn set_exec_status(&mut self, status: ExecStatus) {
        self.exec_status = status;
    }

    /// The configured per-entry iteration budget.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Iterations left before the scheduler rotates away from this machine.
    pub fn iterations_remaining(&self) -> u32 {
        self.iterations_remaining
    }

    /// Refills `iterations_remaining` from the configured budget; called by
    /// the scheduler when it picks this machine up (§4.4).
    pub fn refresh_iterations(&mut self) {
        self.iterations_remaining = self.iterations;
    }

    /// Decrements `iterations_remaining`, saturating at zero.
    pub fn decrement_iterations(&mut self) {
        self.iterations_remaining = self.iterations_remaining.saturating_sub(1);
    }

    /// `true` if the scheduler may ever pick this machine: it has handlers,
    /// every handler verified, and it isn't halted or errored.
    ///
    /// `NotExecutable` is checked explicitly, not just via `is_terminal`: a
    /// machine whose handlers failed verification is never terminal in the
    /// sense of having run and failed, it simply never became runnable in
    /// the first place, so it must never reach the interpreter (§4.3).
    pub fn is_runnable(&self) -> bool {
        !self.handlers.is_empty()
            && self.exec_status != ExecStatus::NotExecutable
            && !self.exec_status.is_terminal()
    }
}
