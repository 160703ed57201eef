//! The kernel-side monitoring routine
//!
//! A raw `sys_enter` program that filters for one syscall number and
//! emits a 24-byte record (uid, pid, comm) into the perf event array.
//!
//! Stack frame layout, relative to the frame pointer:
//!
//! ```text
//! FP-24 .. FP-20   uid   (u32)
//! FP-20 .. FP-16   pid   (u32)
//! FP-16 .. FP      comm  (16 bytes)
//! ```
//!
//! The record is emitted from FP-24 as one contiguous 24-byte block,
//! matching [`ExecEvent`](crate::event::ExecEvent) exactly.

use std::os::fd::RawFd;

use crate::asm::{Assembler, AssemblyError, Program};
use crate::event::ExecEvent;
use crate::insn::{Helper, Insn, JumpCond, Register, Target, Width};

/// Tells perf_event_output to use the current CPU's ring.
const CURRENT_CPU: u64 = 0xffff_ffff;

/// Build the monitor program against the perf event array `map_fd`,
/// reporting only invocations of `syscall_nr`.
///
/// On a raw tracepoint the context holds the syscall id at offset 8
/// (second u64 argument).
pub fn exec_monitor(map_fd: RawFd, syscall_nr: i32) -> Result<Program, AssemblyError> {
    use Register::*;

    let mut a = Assembler::new();

    // R1 is clobbered by helper calls; keep the context in R6/R7.
    a.emit(Insn::mov_reg(R7, R1));
    a.emit(Insn::load(R6, R1, 8, Width::Word));
    a.emit(Insn::branch_imm(
        JumpCond::Ne,
        R6,
        syscall_nr,
        Target::Label("exit".into()),
    ));

    emit_report(&mut a, map_fd);

    a.label("exit");
    a.emit(Insn::mov_imm(R0, 0));
    a.emit(Insn::exit());

    a.resolve()
}

/// Build the kprobe variant against `map_fd`. A kprobe context is
/// `pt_regs`, which carries no syscall id; the probed symbol already
/// selects the call, so every firing is reported unconditionally.
pub fn kprobe_monitor(map_fd: RawFd) -> Result<Program, AssemblyError> {
    use Register::*;

    let mut a = Assembler::new();
    a.emit(Insn::mov_reg(R7, R1));
    emit_report(&mut a, map_fd);
    a.resolve()
}

/// Emit the shared record body: uid, pid and comm into the stack
/// frame, one perf_event_output call, then a clean exit. Expects the
/// context saved in R7.
fn emit_report(a: &mut Assembler, map_fd: RawFd) {
    use Register::*;

    // uid into FP-24, pid into FP-20 (both in the low 32 bits of R0).
    a.emit(Insn::call(Helper::GetCurrentUidGid));
    a.emit(Insn::store(Register::FP, -24, R0, Width::Word));
    a.emit(Insn::call(Helper::GetCurrentPidTgid));
    a.emit(Insn::store(Register::FP, -20, R0, Width::Word));

    // comm into the 16 bytes at FP-16.
    a.emit(Insn::mov_reg(R1, Register::FP));
    a.emit(Insn::add_imm(R1, -16));
    a.emit(Insn::mov_imm(R2, 16));
    a.emit(Insn::call(Helper::GetCurrentComm));

    // perf_event_output(ctx, map, CURRENT_CPU, FP-24, 24)
    a.emit(Insn::mov_reg(R1, R7));
    a.emit(Insn::load_map_fd(R2, map_fd));
    a.emit(Insn::load_imm64(R3, CURRENT_CPU));
    a.emit(Insn::mov_reg(R4, Register::FP));
    a.emit(Insn::add_imm(R4, -24));
    a.emit(Insn::mov_imm(R5, ExecEvent::SIZE as i32));
    a.emit(Insn::call(Helper::PerfEventOutput));

    a.emit(Insn::mov_imm(R0, 0));
    a.emit(Insn::exit());
}
