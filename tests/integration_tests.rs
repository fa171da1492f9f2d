//! End-to-end scenarios exercising the verifier, interpreter, and scheduler
//! together through the public API.

use trex_rt::{
    Context, ExecStatus, OpCode, RuntimeLimits, StateMachine, SyscallDescriptor, SyscallTable,
    VerifyStatus,
};

fn single_handler(code: Vec<u8>, locals: usize, stack_size: usize) -> Context {
    let mut ctx = Context::new(
        stack_size,
        1000,
        SyscallTable::default(),
        RuntimeLimits::default(),
    )
    .expect("valid context config");
    let len = code.len();
    let idx = ctx.add_machine(StateMachine::new(code, locals, 10));
    ctx.verify_machine(idx, &[(0, len)]).expect("verify call succeeds");
    ctx
}

#[test]
fn single_return_handler_runs_to_ready() {
    let mut ctx = single_handler(vec![OpCode::Ret as u8], 0, 16);
    assert_eq!(ctx.machine(0).unwrap().exec_status(), ExecStatus::Ready);

    let report = trex_rt::scheduler::exec(&mut ctx);
    assert!(report.cycles_spent >= 1);
    assert_eq!(ctx.machine(0).unwrap().exec_status(), ExecStatus::Ready);
}

#[test]
fn branch_into_instruction_interior_fails_verification() {
    // BZ +1 targets the second byte of the following IMM2, not a boundary.
    let code = vec![
        OpCode::Bz as u8,
        0x01,
        OpCode::Imm2 as u8,
        0xAA,
        0xBB,
        OpCode::Ret as u8,
    ];
    let mut ctx = Context::new(16, 1000, SyscallTable::default(), RuntimeLimits::default()).unwrap();
    let len = code.len();
    let idx = ctx.add_machine(StateMachine::new(code, 0, 1));
    ctx.verify_machine(idx, &[(0, len)]).unwrap();

    assert_eq!(ctx.machine(0).unwrap().exec_status(), ExecStatus::NotExecutable);
    assert_eq!(
        ctx.machine(0).unwrap().handlers()[0].verify_status,
        VerifyStatus::InvalidBranchTarget
    );

    // A machine that failed verification must never reach the interpreter:
    // the scheduler has nothing runnable here, not a machine to execute.
    let report = trex_rt::scheduler::exec(&mut ctx);
    assert!(report.all_terminal);
    assert_eq!(ctx.machine(0).unwrap().exec_status(), ExecStatus::NotExecutable);
}

#[test]
fn accumulator_local_and_state_transition_via_syscall() {
    fn echo(ctx: &mut Context) {
        let v = ctx.pop();
        ctx.push(v);
    }

    // Handler 0: IMM1 #9 ; STL1 #0 ; LDL1 #0 ; PSHA ; SYS1 #0 ; POP ; SST1 #1 ; RET
    let code = vec![
        OpCode::Imm1 as u8,
        9,
        OpCode::Stl1 as u8,
        0,
        OpCode::Ldl1 as u8,
        0,
        OpCode::Psha as u8,
        OpCode::Sys1 as u8,
        0,
        OpCode::Pop as u8,
        OpCode::Sst1 as u8,
        1,
        OpCode::Ret as u8,
        // Handler 1: RET
        OpCode::Ret as u8,
    ];
    let table = SyscallTable::new(vec![SyscallDescriptor::new("echo", 1, 1, echo)]);
    let mut ctx = Context::new(16, 1000, table, RuntimeLimits::default()).unwrap();
    let idx = ctx.add_machine(StateMachine::new(code, 1, 10));
    ctx.verify_machine(idx, &[(0, 13), (13, 14)]).unwrap();
    assert_eq!(ctx.machine(0).unwrap().exec_status(), ExecStatus::Ready);

    let _ = trex_rt::scheduler::exec(&mut ctx);

    assert_eq!(ctx.machine(0).unwrap().locals()[0], 9);
    assert_eq!(ctx.machine(0).unwrap().next_state(), 1);
}

#[test]
fn halt_is_permanently_terminal() {
    let mut ctx = single_handler(vec![OpCode::Halt as u8], 0, 16);
    let _ = trex_rt::scheduler::exec(&mut ctx);
    assert_eq!(ctx.machine(0).unwrap().exec_status(), ExecStatus::Halted);

    let before = ctx.machine(0).unwrap().exec_status();
    let report = trex_rt::scheduler::exec(&mut ctx);
    assert!(report.all_terminal);
    assert_eq!(ctx.machine(0).unwrap().exec_status(), before);
}

#[test]
fn syscall_underflow_traps_the_machine() {
    fn forgets_to_push(_ctx: &mut Context) {}

    // SYS1 #0 declares returns=1 but the callback never pushes anything.
    let code = vec![OpCode::Sys1 as u8, 0, OpCode::Ret as u8];
    let table = SyscallTable::new(vec![SyscallDescriptor::new(
        "broken",
        0,
        1,
        forgets_to_push,
    )]);
    let mut ctx = Context::new(16, 1000, table, RuntimeLimits::default()).unwrap();
    let idx = ctx.add_machine(StateMachine::new(code.clone(), 0, 10));
    ctx.verify_machine(idx, &[(0, code.len())]).unwrap();

    let _ = trex_rt::scheduler::exec(&mut ctx);
    assert_eq!(
        ctx.machine(0).unwrap().exec_status(),
        ExecStatus::ErrorSyscMismatchedRets
    );
}

#[test]
fn round_robins_across_two_independent_machines() {
    let ret = vec![OpCode::Ret as u8];
    let mut ctx = Context::new(16, 200, SyscallTable::default(), RuntimeLimits::default()).unwrap();
    let m0 = ctx.add_machine(StateMachine::new(ret.clone(), 0, 1));
    ctx.verify_machine(m0, &[(0, 1)]).unwrap();
    let m1 = ctx.add_machine(StateMachine::new(ret, 0, 1));
    ctx.verify_machine(m1, &[(0, 1)]).unwrap();

    let report = trex_rt::scheduler::exec(&mut ctx);
    assert!(report.rotations >= 1);
    assert_eq!(ctx.machine(m0).unwrap().exec_status(), ExecStatus::Ready);
    assert_eq!(ctx.machine(m1).unwrap().exec_status(), ExecStatus::Ready);
}

#[test]
fn machine_with_no_handlers_is_never_runnable() {
    let mut ctx = Context::new(16, 100, SyscallTable::default(), RuntimeLimits::default()).unwrap();
    let idx = ctx.add_machine(StateMachine::new(vec![], 0, 1));
    assert!(!ctx.machine(idx).unwrap().is_runnable());
    let report = trex_rt::scheduler::exec(&mut ctx);
    assert!(report.all_terminal);
}
