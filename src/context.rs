//! The runtime context (§3, §6): owns the shared evaluation stack, the
//! syscall table, the cycle budget, and every state machine.

use std::any::Any;

use crate::error::{RuntimeError, RuntimeResult};
use crate::handler::StateHandler;
use crate::machine::{ExecStatus, StateMachine};
use crate::syscall::SyscallTable;
use crate::verifier;

/// Host-overridable limits on the verifier and scheduler (§9 open
/// questions, Expansion: Configuration).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct RuntimeLimits {
    /// Bound on the number of distinct branch targets the Pass 1 linear
    /// decode may have pending at once (§4.2). The canonical value is 128;
    /// older verifier variants used 8.
    pub pending_target_capacity: usize,
    /// Optional hard stop on the number of Pass 2 symbolic-execution forks
    /// a single handler may take, guarding against pathological branch
    /// nesting (§4.2: "may impose a path-cap at its discretion").
    pub max_branch_paths: u32,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            pending_target_capacity: 128,
            max_branch_paths: 4096,
        }
    }
}

/// The runtime instance (§3 `Context`). Exactly one machine is "current" at
/// any instant; `pc`/`sp`/`a` are the interpreter's working registers for
/// whichever machine that is (§4.3), loaded fresh whenever a machine enters
/// `Ready -> Executing` and otherwise carried across cycle-budget yields.
pub struct Context {
    stack: Vec<u32>,
    syscalls: SyscallTable,
    machines: Vec<StateMachine>,
    cycles_per_exec: u32,
    limits: RuntimeLimits,
    host_data: Option<Box<dyn Any>>,

    pub(crate) curr_machine: Option<usize>,
    pub(crate) pc: usize,
    pub(crate) sp: usize,
    pub(crate) a: u32,
    pub(crate) expected_pops: i32,
    pub(crate) expected_push: i32,
    /// PC at the time of the most recent error, for host inspection (§7).
    pub(crate) fault_pc: Option<usize>,
}

impl Context {
    /// Creates a new context with a shared evaluation stack of `stack_size`
    /// words, a per-tick cycle budget of `cycles_per_exec`, and the given
    /// syscall table.
    pub fn new(
        stack_size: usize,
        cycles_per_exec: u32,
        syscalls: SyscallTable,
        limits: RuntimeLimits,
    ) -> RuntimeResult<Self> {
        if stack_size == 0 {
            return Err(RuntimeError::EmptyStack);
        }
        if syscalls.len() > u16::MAX as usize {
            return Err(RuntimeError::too_many_syscalls(syscalls.len()));
        }
        Ok(Self {
            stack: vec![0; stack_size],
            syscalls,
            machines: Vec::new(),
            cycles_per_exec,
            limits,
            host_data: None,
            curr_machine: None,
            pc: 0,
            sp: stack_size,
            a: 0,
            expected_pops: 0,
            expected_push: 0,
            fault_pc: None,
        })
    }

    /// Attaches opaque host data, retrievable from syscalls via
    /// [`Context::host_data`] / [`Context::host_data_mut`] (§6
    /// `context_init(ctx, hostdata, ...)`).
    pub fn with_host_data<T: 'static>(mut self, data: T) -> Self {
        self.host_data = Some(Box::new(data));
        self
    }

    /// Downcasts the attached host data, if any was set and matches `T`.
    pub fn host_data<T: 'static>(&self) -> Option<&T> {
        self.host_data.as_ref().and_then(|d| d.downcast_ref())
    }

    /// Mutable downcast of the attached host data.
    pub fn host_data_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.host_data.as_mut().and_then(|d| d.downcast_mut())
    }

    /// The shared evaluation stack's capacity (`stack_max - stack_min`).
    pub fn stack_capacity(&self) -> usize {
        self.stack.len()
    }

    /// Current relative stack depth of the active machine.
    pub fn stack_depth(&self) -> usize {
        self.stack.len() - self.sp
    }

    /// The per-tick cycle budget.
    pub fn cycles_per_exec(&self) -> u32 {
        self.cycles_per_exec
    }

    /// The verifier/scheduler limits this context was configured with.
    pub fn limits(&self) -> RuntimeLimits {
        self.limits
    }

    /// The syscall table (read-only after init, §5).
    pub fn syscalls(&self) -> &SyscallTable {
        &self.syscalls
    }

    /// Registers a new machine (`machine_init`, §6) and returns its index.
    /// The machine is `NotExecutable` until [`Context::verify_machine`]
    /// succeeds.
    pub fn add_machine(&mut self, machine: StateMachine) -> usize {
        self.machines.push(machine);
        self.machines.len() - 1
    }

    /// Number of registered machines.
    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }

    /// Read-only access to a machine.
    pub fn machine(&self, index: usize) -> Option<&StateMachine> {
        self.machines.get(index)
    }

    /// Mutable access to a machine.
    pub fn machine_mut(&mut self, index: usize) -> Option<&mut StateMachine> {
        self.machines.get_mut(index)
    }

    /// Populates `machine`'s handler table from `(pc_start, pc_end)` ranges
    /// and verifies every handler (`machine_verify`, §6). The machine
    /// becomes `Ready` only if every handler passes.
    pub fn verify_machine(
        &mut self,
        machine_index: usize,
        handler_ranges: &[(usize, usize)],
    ) -> RuntimeResult<()> {
        let count = self.machines.len();
        let machine = self
            .machines
            .get_mut(machine_index)
            .ok_or_else(|| RuntimeError::no_such_machine(machine_index, count))?;

        if handler_ranges.len() > u16::MAX as usize {
            return Err(RuntimeError::too_many_handlers(handler_ranges.len()));
        }
        if machine.locals().len() > u16::MAX as usize {
            return Err(RuntimeError::too_many_locals(machine.locals().len()));
        }

        let handlers = handler_ranges
            .iter()
            .map(|&(start, end)| StateHandler::new(start, end))
            .collect();
        machine.set_handlers(handlers);

        let locals_count = machine.locals().len();
        let handlers_count = handler_ranges.len();
        let code = machine.code().to_vec();
        let stack_capacity = self.stack.len();

        for index in 0..handlers_count {
            let outcome = verifier::verify(
                &code,
                machine.handlers()[index].pc_start,
                machine.handlers()[index].pc_end,
                locals_count,
                handlers_count,
                self.syscalls.len(),
                |n| self.syscalls.get(n).map(|d| (d.args, d.returns)),
                stack_capacity,
                self.limits,
            );
            let sh = machine.handler_mut(index).expect("index in range");
            outcome.apply_to(sh);
            log::debug!(
                "machine {machine_index} handler {index} verified: {:?}",
                sh.verify_status
            );
        }

        machine.mark_ready_if_all_verified();
        Ok(())
    }

    /// For syscall usage: pushes a value onto the shared stack (§6).
    ///
    /// While the current machine is `InSyscall`, decrements the pending
    /// `expected_push` audit counter (§4.3); outside a syscall it's a plain
    /// push, matching the original's `trex_sm_push`.
    pub fn push(&mut self, val: u32) {
        if let Some(idx) = self.curr_machine {
            if self.machines[idx].exec_status() == ExecStatus::InSyscall {
                self.expected_push -= 1;
            }
        }
        self.sp -= 1;
        self.stack[self.sp] = val;
    }

    /// For syscall usage: pops a value off the shared stack (§6).
    pub fn pop(&mut self) -> u32 {
        if let Some(idx) = self.curr_machine {
            if self.machines[idx].exec_status() == ExecStatus::InSyscall {
                self.expected_pops -= 1;
            }
        }
        let val = self.stack[self.sp];
        self.sp += 1;
        val
    }

    /// For syscall usage: signals that the call received an argument it
    /// can't act on. Only meaningful while the current machine is
    /// `InSyscall`; the interpreter yields with `ErrorSyscInvalidArg`
    /// once the call returns (§7).
    pub fn signal_invalid_arg(&mut self) {
        if let Some(idx) = self.curr_machine {
            self.machines[idx].set_exec_status(ExecStatus::ErrorSyscInvalidArg);
        }
    }

    /// For syscall usage: signals that the call was invoked while the
    /// machine was in a state the syscall doesn't support.
    pub fn signal_invalid_state(&mut self) {
        if let Some(idx) = self.curr_machine {
            self.machines[idx].set_exec_status(ExecStatus::ErrorSyscInvalidState);
        }
    }

    /// PC at the time of the most recently observed error, for host
    /// inspection (§7).
    pub fn fault_pc(&self) -> Option<usize> {
        self.fault_pc
    }
}
