//! AArch64 variant: scalable vectors, streaming mode, and tile storage.
//!
//! The kernel delivers extended state as a linked list of tagged records in
//! the context's reserved area: FP/SIMD status and vectors always, scalable
//! vector and tile records when the process enabled them, and an indirection
//! record pointing at an out-of-line continuation buffer when the state no
//! longer fits. The snapshot folds all of it into one length-tagged region
//! whose sub-register offsets derive from the stored vector length and mode
//! flags, never from memory layout.

use core::fmt;
use core::mem;
use core::ptr;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::arch::{decode_trap_op, Arch, RawBytes, TrapOp, REG_SENTINEL};
use crate::error::{DecodeError, OptionError, StartupError};
use crate::options::ArchOption;

/// Architectural ceiling for the vector quantity.
pub const VQ_MAX: u16 = 16;

/// Bytes per vector quantum.
const VQ_BYTES: usize = 16;

const NUM_ZREGS: usize = 32;
const NUM_PREGS: usize = 16;

/// Record tags in the reserved area.
const FPSIMD_MAGIC: u32 = 0x4650_8001;
const SVE_MAGIC: u32 = 0x5356_4501;
const ZA_MAGIC: u32 = 0x5436_6345;
const EXTRA_MAGIC: u32 = 0x4558_5401;

/// Streaming-mode and tile-active bits of the stored SVCR image.
pub const SVCR_SM: u16 = 1;
pub const SVCR_ZA: u16 = 2;

/// Every record starts with a tag and its declared size, header included.
const RECORD_HEADER: usize = 8;

/// FP/SIMD record: header, fpsr, fpcr, 32 q-registers.
const FPSIMD_RECORD_SIZE: usize = RECORD_HEADER + 8 + SIMD_REGS_SIZE;

/// Vector and tile records place their register payload at this offset.
const RECORD_REGS_OFFSET: usize = 16;

/// Indirection record: header, target address, target size, reserved word.
const EXTRA_RECORD_SIZE: usize = 24;

/// Reserved-area size in the kernel context.
pub const RESERVED_SIZE: usize = 4096;

const SIMD_REGS_SIZE: usize = 32 * 16;

const fn round_up(n: usize, pow2: usize) -> usize {
    (n + pow2 - 1) & !(pow2 - 1)
}

const fn vl_from_vq(vq: u16) -> u16 {
    vq * VQ_BYTES as u16
}

const fn vq_from_vl(vl: u16) -> u16 {
    vl / VQ_BYTES as u16
}

/// Unpadded vector register file: 32 Z registers, 16 predicates, FFR.
const fn sve_sig_regs_size(vq: usize) -> usize {
    NUM_ZREGS * vq * VQ_BYTES + (NUM_PREGS + 1) * vq * 2
}

/// Vector register file as laid out in the snapshot's extended region.
const fn sve_regs_size(vq: usize) -> usize {
    round_up(sve_sig_regs_size(vq), 16)
}

/// Tile storage: VQ*16 rows of VQ*16 bytes.
const fn za_regs_size(vq: usize) -> usize {
    vq * vq * VQ_BYTES * VQ_BYTES
}

const fn sve_record_size(vq: usize) -> usize {
    RECORD_REGS_OFFSET + sve_sig_regs_size(vq)
}

const fn za_record_size(vq: usize) -> usize {
    RECORD_REGS_OFFSET + za_regs_size(vq)
}

/// Worst-case extended region: full vector state plus full tile storage.
const EXTRA_MAX: usize = sve_regs_size(VQ_MAX as usize) + za_regs_size(VQ_MAX as usize);

/// Fixed-header size; also the offset of the extended region.
pub const HEADER_SIZE: usize = 304;

/// Raw machine context at trap delivery.
#[repr(C, align(16))]
#[derive(Clone)]
pub struct MachineContext {
    pub fault_address: u64,
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
    /// Tagged record list holding the extended state.
    pub reserved: [u8; RESERVED_SIZE],
}

/// Snapshot of architectural state at one trap.
#[repr(C, align(16))]
#[derive(Clone)]
pub struct RegInfo {
    pub fault_address: u64,
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub flags: u32,
    pub faulting_insn: u32,
    pub fpsr: u32,
    pub fpcr: u32,
    /// Vector length in bytes; zero when no vector extension is configured.
    pub sve_vl: u16,
    /// Streaming-mode and tile-active bits.
    pub svcr: u16,
    _pad: [u8; 12],
    /// Vector, predicate, and tile storage, addressed through the length
    /// and mode fields above. Base SIMD vectors when `sve_vl` is zero.
    pub extra: [u8; EXTRA_MAX],
}

const _: () = assert!(mem::size_of::<RegInfo>() == HEADER_SIZE + EXTRA_MAX);
const _: () = assert!(mem::offset_of!(RegInfo, extra) == HEADER_SIZE);

unsafe impl RawBytes for RegInfo {}

impl RegInfo {
    /// All-zero image, the documented pre-population state.
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }

    fn vq(&self) -> usize {
        vq_from_vl(self.sve_vl) as usize
    }

    /// 128-bit SIMD register `i`; live when no vector extension is
    /// configured.
    pub fn vreg(&self, i: usize) -> &[u8] {
        &self.extra[i * 16..(i + 1) * 16]
    }

    /// Z vector register `i` at vector quantity `vq`.
    pub fn zreg(&self, vq: usize, i: usize) -> &[u8] {
        let off = i * vq * VQ_BYTES;
        &self.extra[off..off + vq * VQ_BYTES]
    }

    /// Predicate register `i`; index [`NUM_PREGS`] is the FFR.
    pub fn preg(&self, vq: usize, i: usize) -> &[u8] {
        let off = NUM_ZREGS * vq * VQ_BYTES + i * vq * 2;
        &self.extra[off..off + vq * 2]
    }

    /// Tile storage row `row` (of `vq * 16`).
    pub fn za_row(&self, vq: usize, row: usize) -> &[u8] {
        let off = sve_regs_size(vq) + row * vq * VQ_BYTES;
        &self.extra[off..off + vq * VQ_BYTES]
    }
}

/// Startup vector configuration, agreed with the peer before any capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Vector quantity to compare vector registers at; zero disables.
    pub sve_vq: u16,
    /// Vector quantity to compare tile storage at; zero disables.
    pub za_vq: u16,
}

impl VectorConfig {
    /// Effective vector quantity for the snapshot layout.
    pub fn vq(&self) -> u16 {
        if self.sve_vq != 0 {
            self.sve_vq
        } else {
            self.za_vq
        }
    }
}

const OPTIONS: &[ArchOption] = &[
    ArchOption {
        name: "test-sve",
        help: "Compare SVE registers with the given VQ",
        min: 1,
        max: VQ_MAX as i64,
        power_of_two: false,
    },
    ArchOption {
        name: "test-za",
        help: "Compare ZA storage with the given VQ",
        min: 1,
        max: VQ_MAX as i64,
        power_of_two: true,
    },
];

const PR_SVE_SET_VL: i32 = 50;
/// Not in libc yet.
const PR_SME_SET_VL: i32 = 63;

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn set_vector_length(feature: &'static str, op: i32, vq: u16) -> Result<(), StartupError> {
    let want = vl_from_vq(vq);
    let got = unsafe { libc::prctl(op, want as libc::c_ulong) };
    if got < 0 {
        let err = std::io::Error::last_os_error();
        return Err(if err.raw_os_error() == Some(libc::EINVAL) {
            StartupError::HostUnsupported { feature }
        } else {
            StartupError::Syscall(err)
        });
    }
    if got as u16 != want {
        return Err(StartupError::VectorLengthRejected {
            feature,
            want: vq,
            got: vq_from_vl(got as u16),
        });
    }
    tracing::debug!(feature, vq, "vector length activated");
    Ok(())
}

#[cfg(not(all(target_os = "linux", target_arch = "aarch64")))]
fn set_vector_length(_feature: &'static str, _op: i32, _vq: u16) -> Result<(), StartupError> {
    Err(StartupError::WrongHost)
}

/// Records of interest located by one walk of the tagged list.
struct ExtendedState<'a> {
    fpsimd: Option<&'a [u8]>,
    sve: Option<&'a [u8]>,
    za: Option<&'a [u8]>,
}

/// Walk the tagged record list. Records may appear in any order; unknown
/// tags are skipped over their declared size; the terminator of the primary
/// buffer hands the walk over to a pending indirection target, once.
///
/// # Safety
///
/// An indirection record's target address must be readable for its declared
/// size.
unsafe fn scan_records(buf: &[u8]) -> Result<ExtendedState<'_>, DecodeError> {
    let mut state = ExtendedState {
        fpsimd: None,
        sve: None,
        za: None,
    };
    let mut buf = buf;
    let mut pos = 0usize;
    let mut pending: Option<&[u8]> = None;
    let mut in_extra = false;

    loop {
        if pos + RECORD_HEADER > buf.len() {
            return Err(DecodeError::RecordOverrun {
                offset: pos,
                size: RECORD_HEADER as u32,
            });
        }
        let magic = read_u32(buf, pos);
        let size = read_u32(buf, pos + 4);

        if magic == 0 {
            match pending.take() {
                Some(target) => {
                    buf = target;
                    pos = 0;
                    in_extra = true;
                    continue;
                }
                None => break,
            }
        }

        let len = size as usize;
        if len < RECORD_HEADER || pos + len > buf.len() {
            return Err(DecodeError::RecordOverrun { offset: pos, size });
        }
        let body = &buf[pos..pos + len];

        match magic {
            FPSIMD_MAGIC => state.fpsimd = Some(body),
            SVE_MAGIC => state.sve = Some(body),
            ZA_MAGIC => state.za = Some(body),
            EXTRA_MAGIC => {
                if in_extra {
                    return Err(DecodeError::NestedIndirection);
                }
                if len < EXTRA_RECORD_SIZE {
                    return Err(DecodeError::TruncatedRecord {
                        magic,
                        size,
                        need: EXTRA_RECORD_SIZE as u32,
                    });
                }
                let datap = read_u64(body, 8);
                let target_len = read_u32(body, 16) as usize;
                pending = Some(core::slice::from_raw_parts(
                    datap as usize as *const u8,
                    target_len,
                ));
            }
            _ => {}
        }
        pos += len;
    }
    Ok(state)
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[off..off + 2]);
    u16::from_ne_bytes(raw)
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_ne_bytes(raw)
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_ne_bytes(raw)
}

/// Locate and copy FP/SIMD, vector, and tile state out of the reserved
/// area. On failure the snapshot keeps whatever was populated before the
/// bad record was reached.
unsafe fn capture_extended(
    ri: &mut RegInfo,
    ctx: &MachineContext,
    config: &VectorConfig,
) -> Result<(), DecodeError> {
    let state = scan_records(&ctx.reserved)?;

    let fp = state.fpsimd.ok_or(DecodeError::MissingFpRecord)?;
    if fp.len() != FPSIMD_RECORD_SIZE {
        return Err(DecodeError::BadFpRecordSize(fp.len() as u32));
    }
    ri.fpsr = read_u32(fp, 8);
    ri.fpcr = read_u32(fp, 12);
    let fp_vregs = &fp[16..16 + SIMD_REGS_SIZE];

    // Layout requires one vector length across normal and streaming mode,
    // enforced at activation; both configurations agree when nonzero.
    let vq = config.vq() as usize;
    ri.sve_vl = vl_from_vq(config.vq());

    if config.za_vq != 0 {
        let za = state.za.ok_or(DecodeError::MissingTileRecord)?;
        if za.len() < za_record_size(0) {
            return Err(DecodeError::TruncatedRecord {
                magic: ZA_MAGIC,
                size: za.len() as u32,
                need: za_record_size(0) as u32,
            });
        }
        let vl = read_u16(za, 8);
        if vl != ri.sve_vl {
            return Err(DecodeError::VectorLengthMismatch {
                found: vl,
                expected: ri.sve_vl,
            });
        }
        if za.len() == za_record_size(0) {
            // Tile storage is disabled.
        } else if za.len() < za_record_size(vq) {
            return Err(DecodeError::TruncatedRecord {
                magic: ZA_MAGIC,
                size: za.len() as u32,
                need: za_record_size(vq) as u32,
            });
        } else {
            ri.svcr |= SVCR_ZA;
            let rows = &za[RECORD_REGS_OFFSET..za_record_size(vq)];
            let off = sve_regs_size(vq);
            ri.extra[off..off + rows.len()].copy_from_slice(rows);
        }
    }

    if config.sve_vq != 0 {
        let sve = state.sve.ok_or(DecodeError::MissingVectorRecord)?;
        if sve.len() < sve_record_size(0) {
            return Err(DecodeError::TruncatedRecord {
                magic: SVE_MAGIC,
                size: sve.len() as u32,
                need: sve_record_size(0) as u32,
            });
        }
        let vl = read_u16(sve, 8);
        if vl != ri.sve_vl {
            return Err(DecodeError::VectorLengthMismatch {
                found: vl,
                expected: ri.sve_vl,
            });
        }
        ri.svcr |= read_u16(sve, 10) & SVCR_SM;
        if sve.len() <= sve_record_size(0) {
            // Only base SIMD state is present.
        } else if sve.len() < sve_record_size(vq) {
            return Err(DecodeError::TruncatedRecord {
                magic: SVE_MAGIC,
                size: sve.len() as u32,
                need: sve_record_size(vq) as u32,
            });
        } else {
            let regs = &sve[RECORD_REGS_OFFSET..sve_record_size(vq)];
            ri.extra[..regs.len()].copy_from_slice(regs);
            return Ok(());
        }
    }

    // Tile state can be live while the vector record carries no registers;
    // the base SIMD vectors then land in the low lanes of the Z slots and
    // the predicates stay zero.
    if vq == 0 {
        ri.extra[..SIMD_REGS_SIZE].copy_from_slice(fp_vregs);
    } else {
        for i in 0..NUM_ZREGS {
            let dst = i * vq * VQ_BYTES;
            ri.extra[dst..dst + 16].copy_from_slice(&fp_vregs[i * 16..(i + 1) * 16]);
        }
    }
    Ok(())
}

/// One vector-register value, quadword per line, most-significant half
/// first.
fn dump_vector(f: &mut dyn fmt::Write, bytes: &[u8]) -> fmt::Result {
    let mut pad = "";
    for (q, quad) in bytes.chunks_exact(16).enumerate() {
        let lo = read_u64(quad, 0);
        let hi = read_u64(quad, 8);
        writeln!(f, "{pad}[{q:<2}] {hi:016x}{lo:016x}")?;
        pad = "           ";
    }
    Ok(())
}

fn dump_vector_diff(f: &mut dyn fmt::Write, a: &[u8], b: &[u8]) -> fmt::Result {
    let mut pad = "";
    for (q, (qa, qb)) in a.chunks_exact(16).zip(b.chunks_exact(16)).enumerate() {
        if qa != qb {
            let (alo, ahi) = (read_u64(qa, 0), read_u64(qa, 8));
            let (blo, bhi) = (read_u64(qb, 0), read_u64(qb, 8));
            writeln!(f, "{pad}[{q:<2}]: {ahi:016x}{alo:016x} vs {bhi:016x}{blo:016x}")?;
            pad = "           ";
        }
    }
    Ok(())
}

/// Predicate value, 16-bit lanes from the most significant down.
fn dump_predicate(f: &mut dyn fmt::Write, bytes: &[u8]) -> fmt::Result {
    for lane in (0..bytes.len() / 2).rev() {
        write!(f, "{:04x}", read_u16(bytes, lane * 2))?;
    }
    Ok(())
}

fn dump_predicate_diff(f: &mut dyn fmt::Write, a: &[u8], b: &[u8]) -> fmt::Result {
    dump_predicate(f, a)?;
    write!(f, " vs ")?;
    dump_predicate(f, b)?;
    writeln!(f)
}

pub struct Aarch64;

impl Arch for Aarch64 {
    type Context = MachineContext;
    type RegInfo = RegInfo;
    type Config = VectorConfig;

    const NAME: &'static str = "aarch64";
    const TRAP_KEY: u32 = 0x0000_5af0;

    fn options() -> &'static [ArchOption] {
        OPTIONS
    }

    fn apply_option(config: &mut VectorConfig, name: &str, value: i64) -> Result<(), OptionError> {
        match name {
            "test-sve" => config.sve_vq = OPTIONS[0].validate(value)? as u16,
            "test-za" => config.za_vq = OPTIONS[1].validate(value)? as u16,
            _ => return Err(OptionError::Unknown(name.to_string())),
        }
        Ok(())
    }

    fn activate(config: &VectorConfig) -> Result<(), StartupError> {
        if config.za_vq != 0 {
            // The snapshot layout keeps one vector length for normal and
            // streaming mode.
            if config.sve_vq != 0 && config.sve_vq != config.za_vq {
                return Err(StartupError::VectorLengthConflict {
                    sve: config.sve_vq,
                    za: config.za_vq,
                });
            }
            set_vector_length("SME", PR_SME_SET_VL, config.za_vq)?;
        }
        if config.sve_vq != 0 {
            set_vector_length("SVE", PR_SVE_SET_VL, config.sve_vq)?;
        }
        Ok(())
    }

    unsafe fn capture(ctx: &MachineContext, config: &VectorConfig, load_base: u64) -> RegInfo {
        let mut ri = RegInfo::zeroed();

        ri.regs = ctx.regs;
        ri.pc = ctx.pc.wrapping_sub(load_base);
        ri.flags = (ctx.pstate & 0xf000_0000) as u32; /* condition flags only */
        ri.fault_address = ctx.fault_address.wrapping_sub(load_base);
        ri.faulting_insn = ptr::read(ctx.pc as usize as *const u32);

        if let Err(err) = capture_extended(&mut ri, ctx, config) {
            error!(%err, "failed to capture extended state");
        }

        ri.sp = REG_SENTINEL;

        ri
    }

    fn active_len(ri: &RegInfo) -> usize {
        let mut size = HEADER_SIZE;
        if ri.sve_vl != 0 {
            let vq = ri.vq();
            size += sve_regs_size(vq);
            if ri.svcr & SVCR_ZA != 0 {
                size += za_regs_size(vq);
            }
        } else {
            size += SIMD_REGS_SIZE;
        }
        size
    }

    fn dump(ri: &RegInfo, f: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(f, "  faulting insn {:08x}", ri.faulting_insn)?;

        for i in 0..31 {
            writeln!(f, "  X{i:<2}    : {:016x}", ri.regs[i])?;
        }

        writeln!(f, "  sp     : {:016x}", ri.sp)?;
        writeln!(f, "  pc     : {:016x}", ri.pc)?;
        writeln!(f, "  flags  : {:08x}", ri.flags)?;
        writeln!(f, "  fpsr   : {:08x}", ri.fpsr)?;
        writeln!(f, "  fpcr   : {:08x}", ri.fpcr)?;

        if ri.sve_vl != 0 {
            let vq = ri.vq();

            writeln!(f, "  vl     : {}", ri.sve_vl)?;
            writeln!(f, "  svcr   : {}", ri.svcr)?;

            for i in 0..NUM_ZREGS {
                write!(f, "  Z{i:<2}    : ")?;
                dump_vector(f, ri.zreg(vq, i))?;
            }

            for i in 0..=NUM_PREGS {
                if i == NUM_PREGS {
                    write!(f, "  FFR    : ")?;
                } else {
                    write!(f, "  P{i:<2}    : ")?;
                }
                dump_predicate(f, ri.preg(vq, i))?;
                writeln!(f)?;
            }

            if ri.svcr & SVCR_ZA != 0 {
                for row in 0..vq * VQ_BYTES {
                    write!(f, "  ZA[{row:<3}]: ")?;
                    dump_vector(f, ri.za_row(vq, row))?;
                }
            }
            return Ok(());
        }

        for i in 0..32 {
            let v = ri.vreg(i);
            let lo = read_u64(v, 0);
            let hi = read_u64(v, 8);
            writeln!(f, "  V{i:<2}    : {hi:016x}{lo:016x}")?;
        }
        Ok(())
    }

    fn dump_mismatch(a: &RegInfo, b: &RegInfo, f: &mut dyn fmt::Write) -> fmt::Result {
        if a.faulting_insn != b.faulting_insn {
            writeln!(
                f,
                "  faulting insn: {:08x} vs {:08x}",
                a.faulting_insn, b.faulting_insn
            )?;
        }

        for i in 0..31 {
            if a.regs[i] != b.regs[i] {
                writeln!(f, "  X{i:<2}    : {:016x} vs {:016x}", a.regs[i], b.regs[i])?;
            }
        }

        if a.sp != b.sp {
            writeln!(f, "  sp     : {:016x} vs {:016x}", a.sp, b.sp)?;
        }
        if a.pc != b.pc {
            writeln!(f, "  pc     : {:016x} vs {:016x}", a.pc, b.pc)?;
        }
        if a.flags != b.flags {
            writeln!(f, "  flags  : {:08x} vs {:08x}", a.flags, b.flags)?;
        }
        if a.fpsr != b.fpsr {
            writeln!(f, "  fpsr   : {:08x} vs {:08x}", a.fpsr, b.fpsr)?;
        }
        if a.fpcr != b.fpcr {
            writeln!(f, "  fpcr   : {:08x} vs {:08x}", a.fpcr, b.fpcr)?;
        }
        if a.sve_vl != b.sve_vl {
            writeln!(f, "  vl     : {} vs {}", a.sve_vl, b.sve_vl)?;
        }
        if a.svcr != b.svcr {
            writeln!(f, "  svcr   : {} vs {}", a.svcr, b.svcr)?;
        }

        if a.sve_vl != 0 {
            let vq = a.vq();

            for i in 0..NUM_ZREGS {
                let (za, zb) = (a.zreg(vq, i), b.zreg(vq, i));
                if za != zb {
                    write!(f, "  Z{i:<2}    : ")?;
                    dump_vector_diff(f, za, zb)?;
                }
            }
            for i in 0..=NUM_PREGS {
                let (pa, pb) = (a.preg(vq, i), b.preg(vq, i));
                if pa != pb {
                    if i == NUM_PREGS {
                        write!(f, "  FFR    : ")?;
                    } else {
                        write!(f, "  P{i:<2}    : ")?;
                    }
                    dump_predicate_diff(f, pa, pb)?;
                }
            }

            if a.svcr & b.svcr & SVCR_ZA != 0 {
                for row in 0..vq * VQ_BYTES {
                    let (ra, rb) = (a.za_row(vq, row), b.za_row(vq, row));
                    if ra != rb {
                        write!(f, "  ZA[{row:<3}]: ")?;
                        dump_vector_diff(f, ra, rb)?;
                    }
                }
            }
            return Ok(());
        }

        for i in 0..32 {
            let (va, vb) = (a.vreg(i), b.vreg(i));
            if va != vb {
                let (alo, ahi) = (read_u64(va, 0), read_u64(va, 8));
                let (blo, bhi) = (read_u64(vb, 0), read_u64(vb, 8));
                writeln!(
                    f,
                    "  V{i:<2}    : {ahi:016x}{alo:016x} vs {bhi:016x}{blo:016x}"
                )?;
            }
        }
        Ok(())
    }

    fn advance_pc(ctx: &mut MachineContext) {
        ctx.pc += 4;
    }

    fn set_transfer_reg(ctx: &mut MachineContext, value: u64) {
        ctx.regs[0] = value;
    }

    fn transfer_reg(ri: &RegInfo) -> u64 {
        ri.regs[0]
    }

    fn trap_op(ri: &RegInfo) -> TrapOp {
        decode_trap_op(ri.faulting_insn, Self::TRAP_KEY)
    }

    fn pc_offset(ri: &RegInfo) -> u64 {
        ri.pc
    }
}
