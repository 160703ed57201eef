//! Integration tests for the instruction assembler and codec,
//! including property-based coverage of label resolution and the
//! record round trip.

use centinela::asm::{Assembler, AssemblyError};
use centinela::event::{DecodeError, ExecEvent};
use centinela::insn::{Insn, JumpCond, Register, Target};
use proptest::prelude::*;

#[test]
fn resolved_offset_plus_position_plus_width_equals_target() {
    // Branch over a mixed run of narrow and wide instructions.
    let mut a = Assembler::new();
    let jump_at = a.emit(Insn::branch_imm(
        JumpCond::Ne,
        Register::R6,
        59,
        Target::Label("target".into()),
    ));
    a.emit(Insn::mov_imm(Register::R0, 1));
    a.emit(Insn::load_imm64(Register::R3, u64::MAX));
    a.emit(Insn::mov_imm(Register::R0, 2));
    let target_at = a.position();
    a.label("target");
    a.emit(Insn::exit());

    let prog = a.resolve().unwrap();
    let offset = prog.insns()[jump_at].offset as usize;
    assert_eq!(jump_at + 1 + offset, target_at);
}

#[test]
fn multiple_jumps_to_one_label_all_resolve() {
    let mut a = Assembler::new();
    a.emit(Insn::branch_imm(
        JumpCond::Eq,
        Register::R1,
        1,
        Target::Label("out".into()),
    ));
    a.emit(Insn::branch_imm(
        JumpCond::Eq,
        Register::R1,
        2,
        Target::Label("out".into()),
    ));
    a.emit(Insn::mov_imm(Register::R0, 0));
    a.label("out");
    a.emit(Insn::exit());

    let prog = a.resolve().unwrap();
    assert_eq!(prog.insns()[0].offset, 2);
    assert_eq!(prog.insns()[1].offset, 1);
}

#[test]
fn unresolved_label_reports_branch_position() {
    let mut a = Assembler::new();
    a.emit(Insn::mov_imm(Register::R0, 0));
    a.emit(Insn::jump(Target::Label("missing".into())));
    a.emit(Insn::exit());

    match a.resolve() {
        Err(AssemblyError::UnresolvedLabel { label, position }) => {
            assert_eq!(label, "missing");
            assert_eq!(position, 1);
        }
        other => panic!("expected UnresolvedLabel, got {other:?}"),
    }
}

proptest! {
    /// For any amount of straight-line padding between a forward
    /// branch and its label, the resolved offset lands exactly on the
    /// label.
    #[test]
    fn forward_branch_lands_on_label(padding in 0usize..200) {
        let mut a = Assembler::new();
        let jump_at = a.emit(Insn::jump(Target::Label("end".into())));
        for i in 0..padding {
            a.emit(Insn::mov_imm(Register::R0, i as i32));
        }
        let target_at = padding + 1;
        a.label("end");
        a.emit(Insn::exit());

        let prog = a.resolve().unwrap();
        let offset = prog.insns()[jump_at].offset as i64;
        prop_assert_eq!(jump_at as i64 + 1 + offset, target_at as i64);
    }

    #[test]
    fn backward_branch_lands_on_label(padding in 0usize..200) {
        let mut a = Assembler::new();
        a.label("top");
        let top_at = a.position();
        for i in 0..padding {
            a.emit(Insn::mov_imm(Register::R0, i as i32));
        }
        let jump_at = a.emit(Insn::jump(Target::Label("top".into())));
        a.emit(Insn::exit());

        let prog = a.resolve().unwrap();
        let offset = prog.insns()[jump_at].offset as i64;
        prop_assert_eq!(jump_at as i64 + 1 + offset, top_at as i64);
    }

    #[test]
    fn record_round_trip(uid in any::<u32>(), pid in any::<u32>(), comm in any::<[u8; 16]>()) {
        let original = ExecEvent { uid, pid, comm };
        let decoded = ExecEvent::decode(&original.encode()).unwrap();
        prop_assert_eq!(decoded, original);
        prop_assert_eq!(decoded.encode(), original.encode());
    }

    #[test]
    fn short_input_never_decodes(bytes in proptest::collection::vec(any::<u8>(), 0..ExecEvent::SIZE)) {
        let len = bytes.len();
        prop_assert_eq!(
            ExecEvent::decode(&bytes),
            Err(DecodeError::ShortRecord { len })
        );
    }
}
