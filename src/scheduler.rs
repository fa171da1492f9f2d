//! Cooperative round-robin scheduling across a context's machines (§4.4).
//!
//! One call to [`exec`] spends up to `cycles_per_exec` cycles, handing the
//! whole budget to whichever machine is "current" and rotating to the next
//! runnable machine only when the current one reaches `Ready` (between
//! handler invocations), `Halted`, or an error — never mid-handler. A
//! machine that never yields keeps the entire budget to itself; that's a
//! host authoring bug, not something the scheduler works around (§7).

use crate::context::Context;
use crate::interpreter::{self, YieldReason};

/// Summary of one [`exec`] call, useful for host diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecReport {
    /// Total cycles actually spent.
    pub cycles_spent: u32,
    /// Number of times the scheduler rotated to a different machine.
    pub rotations: u32,
    /// `true` if every machine is halted or errored (nothing left to run).
    pub all_terminal: bool,
}

/// Finds the next runnable machine at or after `from`, wrapping around.
/// Returns `None` if no machine is runnable.
fn next_runnable(ctx: &Context, from: usize) -> Option<usize> {
    let count = ctx.machine_count();
    if count == 0 {
        return None;
    }
    for step in 0..count {
        let idx = (from + step) % count;
        if ctx.machine(idx).unwrap().is_runnable() {
            return Some(idx);
        }
    }
    None
}

/// Runs the context for one tick: up to `ctx.cycles_per_exec()` cycles,
/// round-robin across every runnable machine.
///
/// Machines with no verified handlers, or that are `Halted`/erroring, are
/// skipped permanently (§7: "scheduler treats it as permanently absent").
pub fn exec(ctx: &mut Context) -> ExecReport {
    let budget = ctx.cycles_per_exec();
    let mut report = ExecReport::default();

    let start_from = ctx.curr_machine.unwrap_or(0);
    let Some(first) = next_runnable(ctx, start_from) else {
        report.all_terminal = true;
        return report;
    };
    ctx.curr_machine = Some(first);
    log::trace!("scheduler picked machine {first}");
    if ctx.machine(first).unwrap().iterations_remaining() == 0 {
        ctx.machine_mut(first).unwrap().refresh_iterations();
    }

    let mut remaining = budget;
    while remaining > 0 {
        let idx = ctx.curr_machine.expect("scheduler always keeps a current machine");

        let outcome = interpreter::run_cycles(ctx, remaining);
        remaining = remaining.saturating_sub(outcome.cycles_used.max(1));
        report.cycles_spent += outcome.cycles_used.max(1);

        match outcome.reason {
            YieldReason::BudgetExhausted => {
                break;
            }
            YieldReason::HandlerReturned => {
                let machine = ctx.machine(idx).unwrap();
                if machine.iterations_remaining() == 0 {
                    rotate(ctx, idx, &mut report);
                }
                // else: keep `idx` current, it has iterations left; the
                // next loop turn re-enters via the `Ready` state.
            }
            YieldReason::Halted | YieldReason::SyscallFaulted | YieldReason::Unverified => {
                rotate(ctx, idx, &mut report);
            }
        }

        if ctx.curr_machine.is_none() {
            report.all_terminal = true;
            break;
        }
    }

    report
}

/// Releases `idx` as current and rotates to the next runnable machine, if
/// any; refreshes its iteration budget on pickup.
fn rotate(ctx: &mut Context, idx: usize, report: &mut ExecReport) {
    match next_runnable(ctx, idx + 1) {
        Some(next) => {
            log::debug!("scheduler released machine {idx}, rotating to {next}");
            ctx.curr_machine = Some(next);
            if ctx.machine(next).unwrap().iterations_remaining() == 0 {
                ctx.machine_mut(next).unwrap().refresh_iterations();
            }
            report.rotations += 1;
        }
        None => {
            log::debug!("scheduler released machine {idx}, nothing left runnable");
            ctx.curr_machine = None;
        }
    }
}
