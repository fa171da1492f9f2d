//! The cycle-by-cycle dispatch loop (§4.3, §4.4).
//!
//! Verified handlers execute with no per-instruction bounds checks: the
//! verifier already proved every access in range. The loop below trusts
//! that proof completely — it indexes `code`/`locals`/the shared stack
//! directly, the same way the original interpreter dereferenced raw
//! pointers once a handler had passed its own verification pass.

use crate::context::Context;
use crate::machine::ExecStatus;
use crate::opcode::OpCode;

/// Why [`run_cycles`] returned control to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldReason {
    /// The cycle budget for this call was exhausted mid-handler.
    BudgetExhausted,
    /// The handler reached `RET` or fell off the end of its range.
    HandlerReturned,
    /// The handler executed `HALT`.
    Halted,
    /// A syscall's push/pop counts didn't match its declared arity, or it
    /// signalled an error itself.
    SyscallFaulted,
    /// The state about to be entered names a handler that never verified.
    Unverified,
}

/// Result of one [`run_cycles`] call: why it stopped, and exactly how many
/// instructions it actually decoded. The scheduler needs the real count to
/// keep a per-tick cycle budget meaningful across many calls (§4.4) --
/// without it, handing out the whole remaining budget on every call would
/// let a single long handler consume far more than its share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOutcome {
    pub reason: YieldReason,
    pub cycles_used: u32,
}

/// Loads the handler that owns `pc`, or `None` if `pc` isn't inside any
/// handler's range (shouldn't happen for a verified machine, but resuming
/// at `pc_end` exactly is the normal "fell through to caller" case).
fn load_immediate(code: &[u8], pc: usize, len: usize) -> u32 {
    let mut value: u32 = 0;
    for i in 0..len {
        value |= (code[pc + i] as u32) << (8 * i);
    }
    value
}

/// Runs the current machine for up to `budget` cycles, or until it yields
/// for a structural reason. `Context::curr_machine` must already be set to
/// a `Ready` or `Executing` machine; on a fresh `Ready -> Executing`
/// transition the working registers are reset before the first cycle.
///
/// One "cycle" is one decoded instruction.
pub fn run_cycles(ctx: &mut Context, budget: u32) -> ExecOutcome {
    let idx = ctx.curr_machine.expect("run_cycles requires a current machine");

    if ctx.machine(idx).unwrap().exec_status() == ExecStatus::Ready {
        ctx.machine_mut(idx).unwrap().enter_next_state();
        let handler_index = ctx.machine(idx).unwrap().current_state() as usize;

        // §4.3: a machine only ever becomes `Ready` once every handler in
        // its table verified (`mark_ready_if_all_verified`), but the state
        // about to be entered is still checked here rather than trusted,
        // since it's the one place the interpreter is about to start
        // indexing into a handler's verified byte range.
        let verified = ctx
            .machine(idx)
            .unwrap()
            .handlers()
            .get(handler_index)
            .is_some_and(|h| h.is_verified());
        if !verified {
            ctx.machine_mut(idx)
                .unwrap()
                .set_exec_status(ExecStatus::ErrorUnverified);
            log::warn!("machine {idx} entered unverified state {handler_index}");
            return ExecOutcome {
                reason: YieldReason::Unverified,
                cycles_used: 0,
            };
        }

        let pc_start = ctx.machine(idx).unwrap().handlers()[handler_index].pc_start;
        ctx.pc = pc_start;
        ctx.sp = ctx.stack_capacity();
        ctx.a = 0;
        ctx.machine_mut(idx)
            .unwrap()
            .set_exec_status(ExecStatus::Executing);
    }

    let mut remaining = budget;
    macro_rules! yield_with {
        ($reason:expr) => {
            return ExecOutcome {
                reason: $reason,
                cycles_used: budget - remaining,
            }
        };
    }
    loop {
        if remaining == 0 {
            yield_with!(YieldReason::BudgetExhausted);
        }
        remaining -= 1;

        let handler_index = ctx.machine(idx).unwrap().current_state() as usize;
        let pc_end = ctx.machine(idx).unwrap().handlers()[handler_index].pc_end;

        if ctx.pc == pc_end {
            ctx.machine_mut(idx)
                .unwrap()
                .set_exec_status(ExecStatus::Ready);
            ctx.machine_mut(idx).unwrap().decrement_iterations();
            yield_with!(YieldReason::HandlerReturned);
        }

        // SAFETY-BY-PROOF: `code[pc]` and its immediate bytes are in range,
        // and `locals`/branch targets/syscall indices are all valid,
        // because this handler already passed verification (§4.3).
        let code_byte = ctx.machine(idx).unwrap().code()[ctx.pc];
        let op = OpCode::from_byte(code_byte).expect("verified handler decodes cleanly");
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("cycle pc={} sp={} a={} op={op:?}", ctx.pc, ctx.sp, ctx.a);
        }
        let imm_len = op.immediate_len();
        let immediate = if imm_len > 0 {
            load_immediate(ctx.machine(idx).unwrap().code(), ctx.pc + 1, imm_len)
        } else {
            0
        };
        let next_pc = ctx.pc + 1 + imm_len;

        match op {
            OpCode::Imm1 | OpCode::Imm2 | OpCode::Imm3 | OpCode::Imm4 => {
                ctx.a = immediate;
                ctx.pc = next_pc;
            }
            OpCode::Psh1 | OpCode::Psh2 | OpCode::Psh3 | OpCode::Psh4 => {
                ctx.push(immediate);
                ctx.pc = next_pc;
            }
            OpCode::Psha => {
                ctx.push(ctx.a);
                ctx.pc = next_pc;
            }
            OpCode::Pop => {
                ctx.a = ctx.pop();
                ctx.pc = next_pc;
            }
            OpCode::Ldl1 | OpCode::Ldl2 => {
                ctx.a = ctx.machine(idx).unwrap().locals()[immediate as usize];
                ctx.pc = next_pc;
            }
            OpCode::Stl1 | OpCode::Stl2 => {
                let a = ctx.a;
                ctx.machine_mut(idx).unwrap().locals_mut()[immediate as usize] = a;
                ctx.pc = next_pc;
            }
            OpCode::Sst1 | OpCode::Sst2 => {
                ctx.machine_mut(idx)
                    .unwrap()
                    .set_next_state(immediate as u16);
                ctx.pc = next_pc;
            }
            OpCode::Bz => {
                ctx.pc = if ctx.a == 0 {
                    next_pc + immediate as usize
                } else {
                    next_pc
                };
            }
            OpCode::Bnz => {
                ctx.pc = if ctx.a != 0 {
                    next_pc + immediate as usize
                } else {
                    next_pc
                };
            }
            op if op.is_binary_op() => {
                let rhs = ctx.pop();
                ctx.a = apply_binary_op(op, ctx.a, rhs);
                ctx.pc = next_pc;
            }
            OpCode::Sys1 | OpCode::Sys2 => {
                let n = immediate as usize;
                let descriptor = ctx
                    .syscalls()
                    .get(n)
                    .expect("verified handler names a bound syscall")
                    .clone();

                ctx.machine_mut(idx)
                    .unwrap()
                    .set_exec_status(ExecStatus::InSyscall);
                ctx.expected_pops = descriptor.args as i32;
                ctx.expected_push = descriptor.returns as i32;

                (descriptor.call)(ctx);

                let status = ctx.machine(idx).unwrap().exec_status();
                if status == ExecStatus::InSyscall {
                    if ctx.expected_pops != 0 {
                        ctx.fault_pc = Some(ctx.pc);
                        ctx.machine_mut(idx)
                            .unwrap()
                            .set_exec_status(ExecStatus::ErrorSyscMismatchedArgs);
                        log::warn!(
                            "machine {idx} syscall {n} mismatched args at pc={}",
                            ctx.pc
                        );
                        yield_with!(YieldReason::SyscallFaulted);
                    }
                    if ctx.expected_push != 0 {
                        ctx.fault_pc = Some(ctx.pc);
                        ctx.machine_mut(idx)
                            .unwrap()
                            .set_exec_status(ExecStatus::ErrorSyscMismatchedRets);
                        log::warn!(
                            "machine {idx} syscall {n} mismatched returns at pc={}",
                            ctx.pc
                        );
                        yield_with!(YieldReason::SyscallFaulted);
                    }
                    ctx.machine_mut(idx)
                        .unwrap()
                        .set_exec_status(ExecStatus::Executing);
                    ctx.pc = next_pc;
                } else {
                    // The call signalled its own error (`signal_invalid_arg`,
                    // `signal_invalid_state`) or the host reached into the
                    // machine directly; either way it's terminal.
                    ctx.fault_pc = Some(ctx.pc);
                    log::warn!("machine {idx} syscall {n} signalled {status:?} at pc={}", ctx.pc);
                    yield_with!(YieldReason::SyscallFaulted);
                }
            }
            OpCode::Ret => {
                ctx.machine_mut(idx)
                    .unwrap()
                    .set_exec_status(ExecStatus::Ready);
                ctx.machine_mut(idx).unwrap().decrement_iterations();
                yield_with!(YieldReason::HandlerReturned);
            }
            OpCode::Halt => {
                ctx.machine_mut(idx)
                    .unwrap()
                    .set_exec_status(ExecStatus::Halted);
                yield_with!(YieldReason::Halted);
            }
        }
    }
}

/// Evaluates one binary operator: pops `rhs`, combines with `lhs` (the
/// accumulator before the pop), leaves the result for the accumulator.
/// Comparisons yield `1`/`0`; signed variants cast both operands to `i32`
/// first. Shift amounts are masked to `0..=31`.
fn apply_binary_op(op: OpCode, lhs: u32, rhs: u32) -> u32 {
    use OpCode::*;
    match op {
        Or => lhs | rhs,
        Xor => lhs ^ rhs,
        And => lhs & rhs,
        Eq => (lhs == rhs) as u32,
        Ne => (lhs != rhs) as u32,
        Ltu => (lhs < rhs) as u32,
        Lts => ((lhs as i32) < (rhs as i32)) as u32,
        Gtu => (lhs > rhs) as u32,
        Gts => ((lhs as i32) > (rhs as i32)) as u32,
        Leu => (lhs <= rhs) as u32,
        Les => ((lhs as i32) <= (rhs as i32)) as u32,
        Geu => (lhs >= rhs) as u32,
        Ges => ((lhs as i32) >= (rhs as i32)) as u32,
        Shl => lhs.wrapping_shl(rhs & 0x1F),
        Shru => lhs.wrapping_shr(rhs & 0x1F),
        Shrs => ((lhs as i32).wrapping_shr(rhs & 0x1F)) as u32,
        Add => lhs.wrapping_add(rhs),
        Sub => lhs.wrapping_sub(rhs),
        Mul => lhs.wrapping_mul(rhs),
        _ => unreachable!("apply_binary_op called with a non-binary opcode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RuntimeLimits;
    use crate::machine::StateMachine;
    use crate::syscall::{SyscallDescriptor, SyscallTable};

    fn single_handler_ctx(code: Vec<u8>, locals: usize) -> Context {
        let mut ctx = Context::new(16, 1000, SyscallTable::default(), RuntimeLimits::default())
            .unwrap();
        let len = code.len();
        let idx = ctx.add_machine(StateMachine::new(code, locals, 10));
        ctx.verify_machine(idx, &[(0, len)]).unwrap();
        ctx.curr_machine = Some(idx);
        ctx
    }

    #[test]
    fn halt_is_terminal() {
        let mut ctx = single_handler_ctx(vec![0x28], 0); // HALT
        let outcome = run_cycles(&mut ctx, 10);
        assert_eq!(outcome.reason, YieldReason::Halted);
        assert_eq!(ctx.machine(0).unwrap().exec_status(), ExecStatus::Halted);
    }

    #[test]
    fn single_return_consumes_one_iteration() {
        let mut ctx = single_handler_ctx(vec![0x27], 0); // RET
        ctx.machine_mut(0).unwrap().refresh_iterations();
        let before = ctx.machine(0).unwrap().iterations_remaining();
        let outcome = run_cycles(&mut ctx, 10);
        assert_eq!(outcome.reason, YieldReason::HandlerReturned);
        assert_eq!(ctx.machine(0).unwrap().iterations_remaining(), before - 1);
    }

    #[test]
    fn accumulator_roundtrips_through_locals_and_branch() {
        // IMM1 #7 ; STL1 #0 ; LDL1 #0 ; BZ +0 (not taken, A=7) ; RET
        let code = vec![0x00, 0x07, 0x0C, 0x00, 0x0A, 0x00, 0x10, 0x00, 0x27];
        let mut ctx = single_handler_ctx(code, 1);
        let outcome = run_cycles(&mut ctx, 10);
        assert_eq!(outcome.reason, YieldReason::HandlerReturned);
        assert_eq!(ctx.machine(0).unwrap().locals()[0], 7);
    }

    #[test]
    fn budget_exhaustion_preserves_registers_across_calls() {
        // IMM1 #1 ; IMM1 #2 ; RET -- yield mid-handler, then resume.
        let code = vec![0x00, 0x01, 0x00, 0x02, 0x27];
        let mut ctx = single_handler_ctx(code, 0);
        let outcome = run_cycles(&mut ctx, 1);
        assert_eq!(outcome.reason, YieldReason::BudgetExhausted);
        assert_eq!(outcome.cycles_used, 1);
        assert_eq!(ctx.a, 1);
        let outcome = run_cycles(&mut ctx, 10);
        assert_eq!(outcome.reason, YieldReason::HandlerReturned);
        assert_eq!(ctx.a, 2);
    }

    fn echo_one(ctx: &mut Context) {
        let v = ctx.pop();
        ctx.push(v);
    }

    #[test]
    fn syscall_with_matching_arity_continues_executing() {
        // PSHA ; SYS1 #0 ; POP ; RET  (A starts 0, syscall echoes it back)
        let code = vec![0x08, 0x25, 0x00, 0x09, 0x27];
        let table = SyscallTable::new(vec![SyscallDescriptor::new("echo", 1, 1, echo_one)]);
        let mut ctx = Context::new(16, 1000, table, RuntimeLimits::default()).unwrap();
        let idx = ctx.add_machine(StateMachine::new(code.clone(), 0, 10));
        ctx.verify_machine(idx, &[(0, code.len())]).unwrap();
        ctx.curr_machine = Some(idx);
        let outcome = run_cycles(&mut ctx, 10);
        assert_eq!(outcome.reason, YieldReason::HandlerReturned);
        assert_eq!(ctx.machine(0).unwrap().exec_status(), ExecStatus::Ready);
    }

    #[test]
    fn entering_an_unverified_handler_yields_instead_of_decoding() {
        // A machine that never went through `Context::verify_machine`: its
        // single handler sits at `Unverified`, and `curr_machine`/`Ready`
        // are forced by hand to simulate a scheduler bug that hands the
        // interpreter a machine it should never have picked up.
        let mut ctx = Context::new(16, 1000, SyscallTable::default(), RuntimeLimits::default())
            .unwrap();
        let idx = ctx.add_machine(StateMachine::new(vec![0xAA], 0, 10));
        ctx.machine_mut(idx)
            .unwrap()
            .set_handlers(vec![crate::handler::StateHandler::new(0, 1)]);
        ctx.machine_mut(idx).unwrap().set_exec_status(ExecStatus::Ready);
        ctx.curr_machine = Some(idx);

        let outcome = run_cycles(&mut ctx, 10);
        assert_eq!(outcome.reason, YieldReason::Unverified);
        assert_eq!(
            ctx.machine(idx).unwrap().exec_status(),
            ExecStatus::ErrorUnverified
        );
    }

    #[test]
    fn syscall_that_forgets_to_pop_traps() {
        fn forgets_to_pop(_ctx: &mut Context) {}
        // PSHA ; SYS1 #0 (declares args=1 but never pops) ; RET
        let code = vec![0x08, 0x25, 0x00, 0x27];
        let table = SyscallTable::new(vec![SyscallDescriptor::new(
            "broken",
            1,
            0,
            forgets_to_pop,
        )]);
        let mut ctx = Context::new(16, 1000, table, RuntimeLimits::default()).unwrap();
        let idx = ctx.add_machine(StateMachine::new(code.clone(), 0, 10));
        ctx.verify_machine(idx, &[(0, code.len())]).unwrap();
        ctx.curr_machine = Some(idx);
        let outcome = run_cycles(&mut ctx, 10);
        assert_eq!(outcome.reason, YieldReason::SyscallFaulted);
        assert_eq!(
            ctx.machine(0).unwrap().exec_status(),
            ExecStatus::ErrorSyscMismatchedArgs
        );
    }
}
