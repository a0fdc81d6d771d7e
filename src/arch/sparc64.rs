//! SPARC64 variant: register windows and delayed branches.
//!
//! The trap state carries a PC/NPC pair, and the current window's locals and
//! ins live on the native stack, flushed at the biased stack pointer; capture
//! has to read them through the true stack pointer before it is sentineled.

use core::fmt;
use core::mem;
use core::ptr;

use crate::arch::{decode_trap_op, Arch, RawBytes, TrapOp, REG_SENTINEL};

/// V9 stack bias: the stack pointer register sits this far below the frame
/// it addresses.
pub const STACK_BIAS: u64 = 2047;

/// u_regs slots (globals then outs).
const O6: usize = 14;
const O7: usize = 15;

/// Trap register file as delivered to the handler.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapRegs {
    /// G0-G7 then O0-O7.
    pub u_regs: [u64; 16],
    pub tstate: u64,
    pub tpc: u64,
    pub tnpc: u64,
    pub y: u32,
    pub fprs: u32,
}

/// FPU save area, present only when the trapped code had live FP state.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FpuSave {
    pub float_regs: [u32; 64],
    pub fsr: u64,
    pub gsr: u64,
    pub fprs: u32,
}

/// Raw machine context at trap delivery.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MachineContext {
    pub regs: TrapRegs,
    pub fpu_save: *const FpuSave,
}

/// Snapshot of architectural state at one trap.
#[repr(C)]
#[derive(Clone)]
pub struct RegInfo {
    pub faulting_insn: u32,
    pub ccr: u32,
    pub pc: u64,
    pub npc: u64,
    pub g: [u64; 8],
    pub o: [u64; 8],
    pub l: [u64; 8],
    pub i: [u64; 8],
    pub y: u64,
    pub fsr: u64,
    pub fregs: [u64; 32],
}

unsafe impl RawBytes for RegInfo {}

impl RegInfo {
    /// All-zero image, the documented pre-population state.
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

pub struct Sparc64;

impl Arch for Sparc64 {
    type Context = MachineContext;
    type RegInfo = RegInfo;
    type Config = ();

    const NAME: &'static str = "sparc64";
    const TRAP_KEY: u32 = 0x000d_ead0;

    unsafe fn capture(ctx: &MachineContext, _config: &(), load_base: u64) -> RegInfo {
        let mut ri = RegInfo::zeroed();

        ri.pc = ctx.regs.tpc;
        ri.npc = ctx.regs.tnpc;
        ri.ccr = ((ctx.regs.tstate >> 32) & 0xff) as u32;
        ri.y = ctx.regs.y as u64;

        ri.g.copy_from_slice(&ctx.regs.u_regs[..8]);
        ri.o.copy_from_slice(&ctx.regs.u_regs[8..]);

        // L and I are flushed to the regular stack frame.
        let window = ctx.regs.u_regs[O6].wrapping_add(STACK_BIAS) as usize as *const u64;
        for n in 0..8 {
            ri.l[n] = ptr::read_unaligned(window.add(n));
            ri.i[n] = ptr::read_unaligned(window.add(8 + n));
        }

        if !ctx.fpu_save.is_null() {
            let fpu = &*ctx.fpu_save;
            ri.fsr = fpu.fsr;
            // TODO: capture %gsr once the save area is populated for it.
            for (dst, pair) in ri.fregs.iter_mut().zip(fpu.float_regs.chunks_exact(2)) {
                let mut raw = [0u8; 8];
                raw[..4].copy_from_slice(&pair[0].to_ne_bytes());
                raw[4..].copy_from_slice(&pair[1].to_ne_bytes());
                *dst = u64::from_ne_bytes(raw);
            }
        }

        ri.g[7] = REG_SENTINEL; /* tp */
        ri.o[6] = REG_SENTINEL; /* sp */
        ri.i[6] = REG_SENTINEL; /* fp */

        ri.faulting_insn = ptr::read(ri.pc as usize as *const u32);

        ri.pc = ri.pc.wrapping_sub(load_base);
        ri.npc = ri.npc.wrapping_sub(load_base);

        ri
    }

    fn active_len(_ri: &RegInfo) -> usize {
        mem::size_of::<RegInfo>()
    }

    fn dump(ri: &RegInfo, f: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(f, "  insn   : {:08x}", ri.faulting_insn)?;
        writeln!(f, "  ccr    : {:02x}", ri.ccr)?;
        writeln!(f, "  pc     : {:016x}", ri.pc)?;
        writeln!(f, "  npc    : {:016x}", ri.npc)?;

        for i in 1..8 {
            writeln!(f, "  G{}     : {:016x}", i, ri.g[i])?;
        }
        for i in 0..8 {
            writeln!(f, "  O{}     : {:016x}", i, ri.o[i])?;
        }
        for i in 0..8 {
            writeln!(f, "  L{}     : {:016x}", i, ri.l[i])?;
        }
        for i in 0..8 {
            writeln!(f, "  I{}     : {:016x}", i, ri.i[i])?;
        }

        writeln!(f, "  y      : {:016x}", ri.y)?;
        writeln!(f, "  fsr    : {:016x}", ri.fsr)?;

        for i in 0..32 {
            writeln!(f, "  F{:<2}    : {:016x}", i * 2, ri.fregs[i])?;
        }
        Ok(())
    }

    fn dump_mismatch(a: &RegInfo, b: &RegInfo, f: &mut dyn fmt::Write) -> fmt::Result {
        if a.faulting_insn != b.faulting_insn {
            writeln!(f, "  insn   : {:08x} vs {:08x}", a.faulting_insn, b.faulting_insn)?;
        }
        if a.ccr != b.ccr {
            writeln!(f, "  ccr    : {:02x} vs {:02x}", a.ccr, b.ccr)?;
        }
        if a.pc != b.pc {
            writeln!(f, "  pc     : {:016x} vs {:016x}", a.pc, b.pc)?;
        }
        if a.npc != b.npc {
            writeln!(f, "  npc    : {:016x} vs {:016x}", a.npc, b.npc)?;
        }

        for i in 1..8 {
            if a.g[i] != b.g[i] {
                writeln!(f, "  G{}     : {:016x} vs {:016x}", i, a.g[i], b.g[i])?;
            }
        }
        for i in 0..8 {
            if a.o[i] != b.o[i] {
                writeln!(f, "  O{}     : {:016x} vs {:016x}", i, a.o[i], b.o[i])?;
            }
        }
        for i in 0..8 {
            if a.l[i] != b.l[i] {
                writeln!(f, "  L{}     : {:016x} vs {:016x}", i, a.l[i], b.l[i])?;
            }
        }
        for i in 0..8 {
            if a.i[i] != b.i[i] {
                writeln!(f, "  I{}     : {:016x} vs {:016x}", i, a.i[i], b.i[i])?;
            }
        }

        if a.y != b.y {
            writeln!(f, "  y      : {:016x} vs {:016x}", a.y, b.y)?;
        }
        if a.fsr != b.fsr {
            writeln!(f, "  fsr    : {:016x} vs {:016x}", a.fsr, b.fsr)?;
        }

        for i in 0..32 {
            if a.fregs[i] != b.fregs[i] {
                writeln!(
                    f,
                    "  F{:<2}    : {:016x} vs {:016x}",
                    i * 2,
                    a.fregs[i],
                    b.fregs[i]
                )?;
            }
        }
        Ok(())
    }

    /// Promote NPC into PC, keeping delayed-branch semantics across repeated
    /// single-instruction trapping.
    fn advance_pc(ctx: &mut MachineContext) {
        ctx.regs.tpc = ctx.regs.tnpc;
        ctx.regs.tnpc += 4;
    }

    fn set_transfer_reg(ctx: &mut MachineContext, value: u64) {
        ctx.regs.u_regs[O7] = value;
    }

    fn transfer_reg(ri: &RegInfo) -> u64 {
        ri.o[7]
    }

    fn trap_op(ri: &RegInfo) -> TrapOp {
        decode_trap_op(ri.faulting_insn, Self::TRAP_KEY)
    }

    fn pc_offset(ri: &RegInfo) -> u64 {
        ri.pc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Window spill area: eight locals then eight ins.
    fn spill_frame() -> [u64; 16] {
        let mut frame = [0u64; 16];
        for n in 0..8 {
            frame[n] = 0x4c00 + n as u64;
            frame[8 + n] = 0x4900 + n as u64;
        }
        frame
    }

    fn test_context(insn: &u32, frame: &[u64; 16], fpu: *const FpuSave) -> MachineContext {
        let mut regs = TrapRegs {
            u_regs: [0; 16],
            tstate: 0x0000_00ab_0000_0000,
            tpc: insn as *const u32 as u64,
            tnpc: insn as *const u32 as u64 + 4,
            y: 0x1234_5678,
            fprs: 0,
        };
        for i in 0..16 {
            regs.u_regs[i] = 0x100 + i as u64;
        }
        regs.u_regs[O6] = (frame.as_ptr() as u64).wrapping_sub(STACK_BIAS);
        MachineContext {
            regs,
            fpu_save: fpu,
        }
    }

    #[test]
    fn capture_is_reflexive() {
        let insn: u32 = 0x000d_ead0;
        let frame = spill_frame();
        let ctx = test_context(&insn, &frame, core::ptr::null());
        let base = ctx.regs.tpc;

        let a = unsafe { Sparc64::capture(&ctx, &(), base) };
        let b = unsafe { Sparc64::capture(&ctx, &(), base) };
        assert!(Sparc64::is_eq(&a, &b));
    }

    #[test]
    fn capture_reads_the_spilled_window_before_sentineling() {
        let insn: u32 = 0x000d_ead0;
        let frame = spill_frame();
        let ctx = test_context(&insn, &frame, core::ptr::null());

        let ri = unsafe { Sparc64::capture(&ctx, &(), ctx.regs.tpc) };
        assert_eq!(ri.l[0], 0x4c00);
        assert_eq!(ri.l[7], 0x4c07);
        assert_eq!(ri.i[0], 0x4900);
        assert_eq!(ri.i[6], REG_SENTINEL, "fp must be sentineled after the read");
        assert_eq!(ri.o[6], REG_SENTINEL, "sp must be sentineled");
        assert_eq!(ri.g[7], REG_SENTINEL, "tp must be sentineled");
    }

    #[test]
    fn capture_extracts_condition_codes_and_normalizes_pcs() {
        let insn: u32 = 0x000d_ead1;
        let frame = spill_frame();
        let ctx = test_context(&insn, &frame, core::ptr::null());
        let base = ctx.regs.tpc - 0x80;

        let ri = unsafe { Sparc64::capture(&ctx, &(), base) };
        assert_eq!(ri.ccr, 0xab, "ccr comes from tstate bits 39:32");
        assert_eq!(ri.pc, 0x80);
        assert_eq!(ri.npc, 0x84);
        assert_eq!(ri.y, 0x1234_5678);
        assert_eq!(ri.faulting_insn, insn);
        assert_eq!(ri.fsr, 0, "no fpu save area leaves fsr zero");
    }

    #[test]
    fn fpu_save_area_is_copied_verbatim() {
        let insn: u32 = 0x000d_ead0;
        let frame = spill_frame();
        let mut fpu = FpuSave {
            float_regs: [0; 64],
            fsr: 0xf5f5,
            gsr: 0,
            fprs: 0,
        };
        fpu.float_regs[0] = 0x1111_1111;
        fpu.float_regs[1] = 0x2222_2222;
        let ctx = test_context(&insn, &frame, &fpu);

        let ri = unsafe { Sparc64::capture(&ctx, &(), ctx.regs.tpc) };
        assert_eq!(ri.fsr, 0xf5f5);
        let raw = ri.fregs[0].to_ne_bytes();
        assert_eq!(raw[..4], 0x1111_1111u32.to_ne_bytes());
        assert_eq!(raw[4..], 0x2222_2222u32.to_ne_bytes());
    }

    #[test]
    fn advance_pc_matches_manual_npc_promotion() {
        let frame = spill_frame();
        let insn: u32 = 0;
        let mut ctx = test_context(&insn, &frame, core::ptr::null());
        ctx.regs.tpc = 0x1000;
        ctx.regs.tnpc = 0x2000; // delayed branch pending

        Sparc64::advance_pc(&mut ctx);
        assert_eq!((ctx.regs.tpc, ctx.regs.tnpc), (0x2000, 0x2004));
        Sparc64::advance_pc(&mut ctx);
        assert_eq!((ctx.regs.tpc, ctx.regs.tnpc), (0x2004, 0x2008));
    }

    #[test]
    fn transfer_register_round_trips() {
        let insn: u32 = 0x000d_ead2;
        let frame = spill_frame();
        for value in [0u64, u64::MAX, 0x0123_4567_89ab_cdef] {
            let mut ctx = test_context(&insn, &frame, core::ptr::null());
            Sparc64::set_transfer_reg(&mut ctx, value);
            let ri = unsafe { Sparc64::capture(&ctx, &(), ctx.regs.tpc) };
            assert_eq!(Sparc64::transfer_reg(&ri), value);
        }
    }

    #[test]
    fn sideband_decode_uses_the_magic_key() {
        let mut ri = RegInfo::zeroed();
        ri.faulting_insn = 0x000d_ead7;
        assert_eq!(Sparc64::trap_op(&ri), TrapOp::Reserved(7));
        assert_eq!(Sparc64::trap_op(&ri).opcode(), Some(7));

        ri.faulting_insn = 0x1234_5678;
        assert_eq!(Sparc64::trap_op(&ri), TrapOp::Sigill);
    }

    #[test]
    fn mismatch_dump_lists_only_differing_fields() {
        let a = RegInfo::zeroed();
        let mut b = RegInfo::zeroed();

        let mut out = String::new();
        Sparc64::dump_mismatch(&a, &b, &mut out).unwrap();
        assert!(out.is_empty(), "equal snapshots must dump nothing: {out}");

        b.l[3] = 0xbad;
        b.npc = 4;
        let mut out = String::new();
        Sparc64::dump_mismatch(&a, &b, &mut out).unwrap();
        assert_eq!(out.lines().count(), 2, "dump was: {out}");
        assert!(out.contains("L3"), "dump was: {out}");
        assert!(out.contains("npc"), "dump was: {out}");
    }

    #[test]
    fn dump_skips_the_hardwired_zero_register() {
        let ri = RegInfo::zeroed();
        let mut out = String::new();
        Sparc64::dump(&ri, &mut out).unwrap();
        assert!(!out.contains("G0"), "dump was: {out}");
        assert!(out.contains("G1"), "dump was: {out}");
        assert!(out.contains("F62"), "dump was: {out}");
    }
}
