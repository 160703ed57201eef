//! eBPF instruction model
//!
//! Instructions are 64 bits (8 bytes) wide:
//!
//! ```text
//! +--------+----+----+--------+------------+
//! | opcode | dst| src| offset |  immediate |
//! | 8 bits | 4b | 4b | 16 bits|   32 bits  |
//! +--------+----+----+--------+------------+
//! ```
//!
//! 64-bit immediate loads are "wide": they occupy two consecutive
//! instruction slots, with the upper 32 bits carried in the second
//! slot's immediate field. Jump offsets are counted in slots, so a
//! wide instruction advances the program counter by two.
//!
//! The register roles, opcode values and helper ids below are the
//! kernel engine's ABI and must match it bit for bit.

use std::fmt;
use std::os::fd::RawFd;

/// eBPF registers R0-R10.
///
/// - R0: return value from helpers and program exit code
/// - R1-R5: helper arguments (R1 holds the context pointer at entry)
/// - R6-R9: callee-saved
/// - R10: frame pointer, read-only; stack slots sit at negative offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Register {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
}

impl Register {
    /// Frame pointer alias.
    pub const FP: Register = Register::R10;

    #[inline]
    pub const fn raw(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.raw())
    }
}

/// Access width for memory loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Half,
    Word,
    Double,
}

impl Width {
    /// Size bits as encoded in the opcode (BPF_B/H/W/DW).
    #[inline]
    const fn size_bits(self) -> u8 {
        match self {
            Width::Word => 0x00,
            Width::Half => 0x08,
            Width::Byte => 0x10,
            Width::Double => 0x18,
        }
    }

}

/// 64-bit ALU operations (operation bits of the opcode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AluOp {
    Add = 0x00,
    Sub = 0x10,
    Mul = 0x20,
    Div = 0x30,
    Or = 0x40,
    And = 0x50,
    Lsh = 0x60,
    Rsh = 0x70,
    Neg = 0x80,
    Mod = 0x90,
    Xor = 0xa0,
    Mov = 0xb0,
    Arsh = 0xc0,
}

/// Conditional branch comparisons (operation bits of the opcode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JumpCond {
    Eq = 0x10,
    Gt = 0x20,
    Ge = 0x30,
    Set = 0x40,
    Ne = 0x50,
    SGt = 0x60,
    SGe = 0x70,
    Lt = 0xa0,
    Le = 0xb0,
    SLt = 0xc0,
    SLe = 0xd0,
}

/// Helper functions the kernel engine exposes, by fixed id.
///
/// Only the helpers this agent emits are listed; the ids come from the
/// engine's ABI and are stable across kernel versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Helper {
    /// Current pid/tgid packed into a u64 (pid in the low 32 bits).
    GetCurrentPidTgid = 14,
    /// Current uid/gid packed into a u64 (uid in the low 32 bits).
    GetCurrentUidGid = 15,
    /// Copy the current task comm into a caller-provided buffer.
    GetCurrentComm = 16,
    /// Emit a record into a perf event array map.
    PerfEventOutput = 25,
}

/// Second operand of an ALU op or branch comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Imm(i32),
    Reg(Register),
}

/// Branch destination: a literal slot offset or a symbolic label
/// resolved by the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Offset(i16),
    Label(String),
}

/// One instruction as built by the assembler, before encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    /// 64-bit ALU operation, `dst = dst op src`.
    Alu {
        op: AluOp,
        dst: Register,
        src: Operand,
    },
    /// Memory load, `dst = *(base + offset)`.
    Load {
        dst: Register,
        base: Register,
        offset: i16,
        width: Width,
    },
    /// Memory store from a register, `*(base + offset) = src`.
    Store {
        base: Register,
        offset: i16,
        src: Register,
        width: Width,
    },
    /// 64-bit immediate load; occupies two slots.
    LoadImm64 { dst: Register, imm: u64 },
    /// Map-fd pseudo load; occupies two slots. The verifier rewrites
    /// the fd into a kernel map pointer at load time.
    LoadMapFd { dst: Register, fd: RawFd },
    /// Unconditional jump.
    Jump { target: Target },
    /// Conditional branch, taken when `dst cond src`.
    Branch {
        cond: JumpCond,
        dst: Register,
        src: Operand,
        target: Target,
    },
    /// Helper function call.
    Call { helper: Helper },
    /// Program exit; R0 holds the return value.
    Exit,
}

// Opcode classes.
const CLASS_LD: u8 = 0x00;
const CLASS_LDX: u8 = 0x01;
const CLASS_STX: u8 = 0x03;
const CLASS_JMP: u8 = 0x05;
const CLASS_ALU64: u8 = 0x07;

// Mode and source bits.
const MODE_MEM: u8 = 0x60;
const MODE_IMM: u8 = 0x00;
const SRC_REG: u8 = 0x08;

const OP_CALL: u8 = 0x85;
const OP_EXIT: u8 = 0x95;
const OP_JA: u8 = 0x05;
const OP_LDDW: u8 = 0x18;

/// Marks the imm of a wide load as a map fd rather than a literal.
const PSEUDO_MAP_FD: u8 = 1;

impl Insn {
    /// Number of 8-byte slots this instruction occupies.
    pub fn slots(&self) -> usize {
        match self {
            Insn::LoadImm64 { .. } | Insn::LoadMapFd { .. } => 2,
            _ => 1,
        }
    }

    /// Symbolic label referenced by this instruction, if any.
    pub fn label(&self) -> Option<&str> {
        match self {
            Insn::Jump {
                target: Target::Label(name),
            }
            | Insn::Branch {
                target: Target::Label(name),
                ..
            } => Some(name.as_str()),
            _ => None,
        }
    }

    /// Encode into raw slots. `branch_offset` supplies the resolved
    /// relative offset for branch instructions and is ignored otherwise.
    pub(crate) fn encode(&self, branch_offset: i16) -> Encoded {
        match *self {
            Insn::Alu { op, dst, src } => match src {
                Operand::Imm(imm) => Encoded::one(RawInsn::new(
                    op as u8 | CLASS_ALU64,
                    dst.raw(),
                    0,
                    0,
                    imm,
                )),
                Operand::Reg(src) => Encoded::one(RawInsn::new(
                    op as u8 | SRC_REG | CLASS_ALU64,
                    dst.raw(),
                    src.raw(),
                    0,
                    0,
                )),
            },
            Insn::Load {
                dst,
                base,
                offset,
                width,
            } => Encoded::one(RawInsn::new(
                CLASS_LDX | MODE_MEM | width.size_bits(),
                dst.raw(),
                base.raw(),
                offset,
                0,
            )),
            Insn::Store {
                base,
                offset,
                src,
                width,
            } => Encoded::one(RawInsn::new(
                CLASS_STX | MODE_MEM | width.size_bits(),
                base.raw(),
                src.raw(),
                offset,
                0,
            )),
            Insn::LoadImm64 { dst, imm } => Encoded::two(
                RawInsn::new(OP_LDDW, dst.raw(), 0, 0, imm as u32 as i32),
                RawInsn::new(CLASS_LD | MODE_IMM, 0, 0, 0, (imm >> 32) as u32 as i32),
            ),
            Insn::LoadMapFd { dst, fd } => Encoded::two(
                RawInsn::new(OP_LDDW, dst.raw(), PSEUDO_MAP_FD, 0, fd),
                RawInsn::new(CLASS_LD | MODE_IMM, 0, 0, 0, 0),
            ),
            Insn::Jump { .. } => Encoded::one(RawInsn::new(OP_JA, 0, 0, branch_offset, 0)),
            Insn::Branch { cond, dst, src, .. } => match src {
                Operand::Imm(imm) => Encoded::one(RawInsn::new(
                    cond as u8 | CLASS_JMP,
                    dst.raw(),
                    0,
                    branch_offset,
                    imm,
                )),
                Operand::Reg(src) => Encoded::one(RawInsn::new(
                    cond as u8 | SRC_REG | CLASS_JMP,
                    dst.raw(),
                    src.raw(),
                    branch_offset,
                    0,
                )),
            },
            Insn::Call { helper } => Encoded::one(RawInsn::new(OP_CALL, 0, 0, 0, helper as i32)),
            Insn::Exit => Encoded::one(RawInsn::new(OP_EXIT, 0, 0, 0, 0)),
        }
    }

    // Convenience constructors mirroring the usual asm mnemonics.

    pub fn mov_reg(dst: Register, src: Register) -> Self {
        Insn::Alu {
            op: AluOp::Mov,
            dst,
            src: Operand::Reg(src),
        }
    }

    pub fn mov_imm(dst: Register, imm: i32) -> Self {
        Insn::Alu {
            op: AluOp::Mov,
            dst,
            src: Operand::Imm(imm),
        }
    }

    pub fn add_imm(dst: Register, imm: i32) -> Self {
        Insn::Alu {
            op: AluOp::Add,
            dst,
            src: Operand::Imm(imm),
        }
    }

    pub fn load(dst: Register, base: Register, offset: i16, width: Width) -> Self {
        Insn::Load {
            dst,
            base,
            offset,
            width,
        }
    }

    pub fn store(base: Register, offset: i16, src: Register, width: Width) -> Self {
        Insn::Store {
            base,
            offset,
            src,
            width,
        }
    }

    pub fn load_imm64(dst: Register, imm: u64) -> Self {
        Insn::LoadImm64 { dst, imm }
    }

    pub fn load_map_fd(dst: Register, fd: RawFd) -> Self {
        Insn::LoadMapFd { dst, fd }
    }

    pub fn branch_imm(cond: JumpCond, dst: Register, imm: i32, target: Target) -> Self {
        Insn::Branch {
            cond,
            dst,
            src: Operand::Imm(imm),
            target,
        }
    }

    pub fn jump(target: Target) -> Self {
        Insn::Jump { target }
    }

    pub fn call(helper: Helper) -> Self {
        Insn::Call { helper }
    }

    pub fn exit() -> Self {
        Insn::Exit
    }
}

/// One or two encoded slots.
pub(crate) struct Encoded {
    pub slots: [RawInsn; 2],
    pub len: usize,
}

impl Encoded {
    fn one(insn: RawInsn) -> Self {
        Encoded {
            slots: [insn, RawInsn::default()],
            len: 1,
        }
    }

    fn two(first: RawInsn, second: RawInsn) -> Self {
        Encoded {
            slots: [first, second],
            len: 2,
        }
    }
}

/// The engine's fixed 8-byte instruction encoding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RawInsn {
    pub opcode: u8,
    /// dst in the low nibble, src in the high nibble.
    pub regs: u8,
    pub offset: i16,
    pub imm: i32,
}

impl RawInsn {
    /// Size of an encoded instruction in bytes.
    pub const SIZE: usize = 8;

    #[inline]
    pub const fn new(opcode: u8, dst: u8, src: u8, offset: i16, imm: i32) -> Self {
        RawInsn {
            opcode,
            regs: (src << 4) | (dst & 0x0f),
            offset,
            imm,
        }
    }

    #[inline]
    pub const fn dst_reg(&self) -> u8 {
        self.regs & 0x0f
    }

    #[inline]
    pub const fn src_reg(&self) -> u8 {
        (self.regs >> 4) & 0x0f
    }

    /// Little-endian wire encoding, as handed to the engine.
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.opcode;
        out[1] = self.regs;
        out[2..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4..8].copy_from_slice(&self.imm.to_le_bytes());
        out
    }
}
