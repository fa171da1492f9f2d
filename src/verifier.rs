//! The ahead-of-time verifier (§4.2).
//!
//! Two passes over a handler's `[pc_start, pc_end)` byte range:
//!
//! - Pass 1 is a linear decode. It walks every instruction exactly once,
//!   checks the opcode and its immediate fit inside the range, and collects
//!   the set of branch targets named by `BZ`/`BNZ` so Pass 2 can confirm
//!   each one lands on an instruction boundary.
//! - Pass 2 is a symbolic executor. It walks the same instructions again,
//!   this time tracking stack depth (not values) and forking at every
//!   branch so both the taken and fall-through edges get checked. It proves
//!   the handler never over/underflows the stack and always leaves it empty
//!   at `RET`, `HALT`, or `pc_end`.
//!
//! A handler that survives both passes needs no per-instruction bounds
//! checks at execution time (§4.3): the interpreter trusts the proof.

use std::collections::BTreeSet;

use crate::context::RuntimeLimits;
use crate::handler::{StateHandler, VerifyStatus};
use crate::opcode::OpCode;

/// Outcome of verifying one handler; applied onto its [`StateHandler`] once
/// computed so the caller doesn't have to borrow the handler mutably while
/// also reading its own `pc_start`/`pc_end`.
pub struct VerifyOutcome {
    status: VerifyStatus,
    invalid_pc: Option<usize>,
    invalid_target: Option<usize>,
    branch_paths: u32,
    max_depth: u32,
    max_targets: u32,
}

impl VerifyOutcome {
    fn ok(branch_paths: u32, max_depth: u32, max_targets: u32) -> Self {
        Self {
            status: VerifyStatus::Verified,
            invalid_pc: None,
            invalid_target: None,
            branch_paths,
            max_depth,
            max_targets,
        }
    }

    fn fail(status: VerifyStatus, pc: usize) -> Self {
        Self {
            status,
            invalid_pc: Some(pc),
            invalid_target: None,
            branch_paths: 0,
            max_depth: 0,
            max_targets: 0,
        }
    }

    /// Same as [`VerifyOutcome::fail`] but also records the offending
    /// branch target, for `InvalidBranchTarget` failures.
    fn fail_branch(pc: usize, target: usize) -> Self {
        Self {
            status: VerifyStatus::InvalidBranchTarget,
            invalid_pc: Some(pc),
            invalid_target: Some(target),
            branch_paths: 0,
            max_depth: 0,
            max_targets: 0,
        }
    }

    /// Records this outcome onto `handler`.
    pub fn apply_to(&self, handler: &mut StateHandler) {
        handler.verify_status = self.status;
        handler.invalid_pc = self.invalid_pc;
        handler.invalid_target = self.invalid_target;
        handler.branch_paths = self.branch_paths;
        handler.max_depth = self.max_depth;
        handler.max_targets = self.max_targets;
    }
}

/// Internal verification failure: a status, the pc it was detected at, and
/// (for `InvalidBranchTarget`) the offending target offset.
struct Failure {
    status: VerifyStatus,
    pc: usize,
    target: Option<usize>,
}

impl Failure {
    fn plain(status: VerifyStatus, pc: usize) -> Self {
        Self {
            status,
            pc,
            target: None,
        }
    }

    fn branch(pc: usize, target: usize) -> Self {
        Self {
            status: VerifyStatus::InvalidBranchTarget,
            pc,
            target: Some(target),
        }
    }
}

/// Reads a little-endian immediate of `len` bytes (1..=4) starting at `pc`.
/// Caller guarantees `pc + len <= code.len()`.
fn load_immediate(code: &[u8], pc: usize, len: usize) -> u32 {
    let mut value: u32 = 0;
    for i in 0..len {
        value |= (code[pc + i] as u32) << (8 * i);
    }
    value
}

/// Decoded instruction at some `pc`: the opcode plus its pc and the pc of
/// the next instruction.
#[derive(Clone, Copy)]
struct Decoded {
    op: OpCode,
    pc: usize,
    next_pc: usize,
    immediate: u32,
}

/// Pass 1: linear decode of `[pc_start, pc_end)`. Returns the ordered
/// instruction list plus the set of branch targets seen, or the failing
/// status and pc.
fn decode_linear(
    code: &[u8],
    pc_start: usize,
    pc_end: usize,
    limits: RuntimeLimits,
) -> Result<(Vec<Decoded>, BTreeSet<usize>, u32), Failure> {
    let mut instructions = Vec::new();
    let mut targets = BTreeSet::new();
    let mut max_targets = 0u32;
    let mut pc = pc_start;

    while pc < pc_end {
        let op = OpCode::from_byte(code[pc]).ok_or(Failure::plain(VerifyStatus::InvalidOpcode, pc))?;
        log::trace!("pass1 decode pc={pc} op={op:?}");
        let imm_len = op.immediate_len();
        if pc + 1 + imm_len > pc_end {
            return Err(Failure::plain(VerifyStatus::InvalidOpcodeIncomplete, pc));
        }
        let immediate = if imm_len > 0 {
            load_immediate(code, pc + 1, imm_len)
        } else {
            0
        };
        let next_pc = pc + 1 + imm_len;

        if op.is_branch() {
            let target = next_pc + immediate as usize;
            targets.insert(target);
            max_targets = max_targets.max(targets.len() as u32);
            if targets.len() > limits.pending_target_capacity {
                return Err(Failure::plain(VerifyStatus::InvalidTooManyBranches, pc));
            }
        }

        instructions.push(Decoded {
            op,
            pc,
            next_pc,
            immediate,
        });
        pc = next_pc;
    }

    Ok((instructions, targets, max_targets))
}

/// Pass 2 symbolic-execution state at one program point.
///
/// `aknown` mirrors the accumulator's value when it's a compile-time
/// constant (set by `IMM1..4`, cleared by anything that loads `A` from a
/// place this pass doesn't track: the stack, a local, or a binary op's
/// result). `BZ`/`BNZ` use it to follow only the reachable edge instead of
/// forking when the branch direction is already decided.
#[derive(Clone, Copy)]
struct SymState {
    pc: usize,
    depth: u32,
    aknown: Option<u32>,
}

/// Pass 2: forks at every branch, tracking stack depth only. Returns the
/// number of distinct paths walked and the max depth observed, or a
/// failing status and pc.
fn walk_symbolic(
    instructions: &[Decoded],
    index_of_pc: &std::collections::HashMap<usize, usize>,
    pc_start: usize,
    pc_end: usize,
    stack_capacity: usize,
    locals_count: usize,
    handlers_count: usize,
    syscalls_count: usize,
    syscall_arity: &dyn Fn(usize) -> Option<(u8, u8)>,
    limits: RuntimeLimits,
) -> Result<(u32, u32), Failure> {
    let mut worklist = vec![SymState {
        pc: pc_start,
        depth: 0,
        aknown: Some(0),
    }];
    let mut visited: BTreeSet<(usize, u32)> = BTreeSet::new();
    let mut paths = 0u32;
    let mut max_depth = 0u32;

    while let Some(state) = worklist.pop() {
        if !visited.insert((state.pc, state.depth)) {
            continue;
        }
        paths += 1;
        if paths > limits.max_branch_paths {
            return Err(Failure::plain(VerifyStatus::InvalidTooManyBranches, state.pc));
        }

        let mut pc = state.pc;
        let mut depth = state.depth;
        let mut aknown = state.aknown;

        loop {
            if pc == pc_end {
                if depth != 0 {
                    return Err(Failure::plain(VerifyStatus::InvalidStackMustBeEmptyOnReturn, pc));
                }
                break;
            }

            let idx = *index_of_pc.get(&pc).ok_or_else(|| Failure::branch(pc, pc))?;
            let instr = instructions[idx];
            log::trace!("pass2 walk pc={pc} op={:?} depth={depth}", instr.op);

            let mut next_pc = instr.next_pc;

            match instr.op {
                OpCode::Imm1 | OpCode::Imm2 | OpCode::Imm3 | OpCode::Imm4 => {
                    aknown = Some(instr.immediate);
                }
                OpCode::Psh1 | OpCode::Psh2 | OpCode::Psh3 | OpCode::Psh4 | OpCode::Psha => {
                    depth = depth
                        .checked_add(1)
                        .filter(|&d| (d as usize) <= stack_capacity)
                        .ok_or(Failure::plain(VerifyStatus::InvalidStackOverflow, instr.pc))?;
                }
                OpCode::Pop => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or(Failure::plain(VerifyStatus::InvalidStackUnderflow, instr.pc))?;
                    aknown = None;
                }
                OpCode::Ldl1 | OpCode::Ldl2 => {
                    if instr.immediate as usize >= locals_count {
                        return Err(Failure::plain(VerifyStatus::InvalidLocal, instr.pc));
                    }
                    aknown = None;
                }
                OpCode::Stl1 | OpCode::Stl2 => {
                    if instr.immediate as usize >= locals_count {
                        return Err(Failure::plain(VerifyStatus::InvalidLocal, instr.pc));
                    }
                }
                OpCode::Sst1 | OpCode::Sst2 => {
                    if instr.immediate as usize >= handlers_count {
                        return Err(Failure::plain(VerifyStatus::InvalidState, instr.pc));
                    }
                }
                OpCode::Bz | OpCode::Bnz => {
                    let target = instr.next_pc + instr.immediate as usize;
                    if target != instr.next_pc && !index_of_pc.contains_key(&target)
                        && target != pc_end
                    {
                        return Err(Failure::branch(instr.pc, target));
                    }

                    let taken = aknown.map(|v| match instr.op {
                        OpCode::Bz => v == 0,
                        OpCode::Bnz => v != 0,
                        _ => unreachable!(),
                    });

                    match taken {
                        Some(true) => next_pc = target,
                        Some(false) => next_pc = instr.next_pc,
                        None if target != instr.next_pc => {
                            worklist.push(SymState {
                                pc: target,
                                depth,
                                aknown,
                            });
                        }
                        None => {}
                    }
                }
                op if op.is_binary_op() => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or(Failure::plain(VerifyStatus::InvalidStackUnderflow, instr.pc))?;
                    aknown = None;
                }
                OpCode::Sys1 | OpCode::Sys2 => {
                    let n = instr.immediate as usize;
                    if n >= syscalls_count {
                        return Err(Failure::plain(VerifyStatus::InvalidSyscallNumber, instr.pc));
                    }
                    let (args, returns) = syscall_arity(n)
                        .ok_or(Failure::plain(VerifyStatus::InvalidSyscallUnmapped, instr.pc))?;
                    depth = depth
                        .checked_sub(args as u32)
                        .ok_or(Failure::plain(VerifyStatus::InvalidStackUnderflow, instr.pc))?;
                    depth = depth
                        .checked_add(returns as u32)
                        .filter(|&d| (d as usize) <= stack_capacity)
                        .ok_or(Failure::plain(VerifyStatus::InvalidStackOverflow, instr.pc))?;
                }
                OpCode::Ret => {
                    if depth != 0 {
                        return Err(Failure::plain(VerifyStatus::InvalidStackMustBeEmptyOnReturn, instr.pc));
                    }
                    break;
                }
                OpCode::Halt => {
                    if depth != 0 {
                        return Err(Failure::plain(VerifyStatus::InvalidStackMustBeEmptyOnReturn, instr.pc));
                    }
                    break;
                }
            }

            max_depth = max_depth.max(depth);
            pc = next_pc;
        }
    }

    Ok((paths, max_depth))
}

/// Runs both verification passes over `[pc_start, pc_end)` and returns the
/// outcome to record on the handler.
///
/// `syscall_arity(n)` must return `(args, returns)` for syscall index `n`,
/// or `None` if no descriptor is bound there. `stack_capacity` is the
/// context's shared evaluation stack size, used to catch `PSH*`/syscall
/// returns that would overflow it.
#[allow(clippy::too_many_arguments)]
pub fn verify(
    code: &[u8],
    pc_start: usize,
    pc_end: usize,
    locals_count: usize,
    handlers_count: usize,
    syscalls_count: usize,
    syscall_arity: impl Fn(usize) -> Option<(u8, u8)>,
    stack_capacity: usize,
    limits: RuntimeLimits,
) -> VerifyOutcome {
    if pc_end > code.len() || pc_start > pc_end {
        return VerifyOutcome::fail(VerifyStatus::InvalidOpcodeIncomplete, pc_start);
    }

    let (instructions, _targets, max_targets) =
        match decode_linear(code, pc_start, pc_end, limits) {
            Ok(v) => v,
            Err(failure) => return outcome_from_failure(failure),
        };

    let index_of_pc: std::collections::HashMap<usize, usize> = instructions
        .iter()
        .enumerate()
        .map(|(i, d)| (d.pc, i))
        .collect();

    match walk_symbolic(
        &instructions,
        &index_of_pc,
        pc_start,
        pc_end,
        stack_capacity,
        locals_count,
        handlers_count,
        syscalls_count,
        &syscall_arity,
        limits,
    ) {
        Ok((paths, max_depth)) => VerifyOutcome::ok(paths, max_depth, max_targets),
        Err(failure) => outcome_from_failure(failure),
    }
}

fn outcome_from_failure(failure: Failure) -> VerifyOutcome {
    match failure.target {
        Some(target) => VerifyOutcome::fail_branch(failure.pc, target),
        None => VerifyOutcome::fail(failure.status, failure.pc),
    }
}
