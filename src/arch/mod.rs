//! Architecture capability interface.
//!
//! One implementing type per supported architecture. The orchestration loop
//! and the transport go through [`Arch`] exclusively; nothing outside this
//! module tree inspects architecture-specific snapshot fields.

pub mod aarch64;
pub mod m68k;
pub mod ppc64;
pub mod sparc64;

use core::fmt;

use crate::error::{OptionError, StartupError};
use crate::options::ArchOption;

/// Marker written over environment-bound registers (stack pointer, thread
/// pointer and friends) after capture. Not a canonical address on any
/// supported architecture, so it can never collide with a live value.
/// 32-bit architectures store the low half.
pub const REG_SENTINEL: u64 = 0xdead_beef_dead_beef;

/// Sideband operation encoded in the low nibble of a trapping instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOp {
    /// Compare register state with the peer.
    Compare,
    /// End of the test image.
    TestEnd,
    /// Publish the memory block address through the transfer register.
    SetMemBlock,
    /// Fetch the memory block address into the transfer register.
    GetMemBlock,
    /// Compare the contents of the memory block.
    CompareMem,
    /// Encoded nibble with no assigned operation.
    Reserved(u8),
    /// Not a sideband request: the trap was a genuine illegal instruction.
    Sigill,
}

impl TrapOp {
    fn from_nibble(n: u8) -> Self {
        match n {
            0 => TrapOp::Compare,
            1 => TrapOp::TestEnd,
            2 => TrapOp::SetMemBlock,
            3 => TrapOp::GetMemBlock,
            4 => TrapOp::CompareMem,
            n => TrapOp::Reserved(n & 0xf),
        }
    }

    /// Numeric opcode, for anything that was a sideband request.
    pub fn opcode(self) -> Option<u8> {
        match self {
            TrapOp::Compare => Some(0),
            TrapOp::TestEnd => Some(1),
            TrapOp::SetMemBlock => Some(2),
            TrapOp::GetMemBlock => Some(3),
            TrapOp::CompareMem => Some(4),
            TrapOp::Reserved(n) => Some(n),
            TrapOp::Sigill => None,
        }
    }
}

/// Decode the sideband operation from a faulting instruction word. The low
/// nibble is the candidate opcode; the remaining bits must equal the
/// architecture's magic key, otherwise the trap was a genuine fault.
pub(crate) fn decode_trap_op(insn: u32, key: u32) -> TrapOp {
    if insn & !0xf == key {
        TrapOp::from_nibble((insn & 0xf) as u8)
    } else {
        TrapOp::Sigill
    }
}

/// Raw byte image of a snapshot.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with explicit padding fields only and
/// every field plain old data, so the image has no uninitialized bytes and
/// two identically-populated values are byte-identical.
pub unsafe trait RawBytes: Sized {
    /// The full backing image, sized for the architecture's worst case.
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: the trait contract rules out implicit padding.
        unsafe {
            core::slice::from_raw_parts(
                self as *const Self as *const u8,
                core::mem::size_of::<Self>(),
            )
        }
    }
}

/// Capability set implemented once per target architecture.
///
/// The per-trap lifecycle is capture → compare (or transmit) → discard; a
/// snapshot never outlives a single trap event. The byte image of a snapshot
/// up to [`Arch::active_len`] is the exact payload the external transport
/// exchanges, so both peers must agree on architecture and configuration.
pub trait Arch {
    /// Raw machine context as delivered to the trap handler.
    type Context;
    /// Canonical snapshot of architectural state at one trap.
    type RegInfo: RawBytes;
    /// Startup configuration; `()` for fixed-layout architectures.
    type Config: Default;

    /// Architecture name, checked during the peer handshake.
    const NAME: &'static str;
    /// Key identifying sideband trap instructions.
    const TRAP_KEY: u32;

    /// Startup options this architecture understands.
    fn options() -> &'static [ArchOption] {
        &[]
    }

    /// Apply a named option value to the configuration.
    fn apply_option(
        _config: &mut Self::Config,
        name: &str,
        _value: i64,
    ) -> Result<(), OptionError> {
        Err(OptionError::Unknown(name.to_string()))
    }

    /// One-time capability activation, e.g. selecting a vector length.
    /// Runs once at process start; failure is fatal to startup.
    fn activate(_config: &Self::Config) -> Result<(), StartupError> {
        Ok(())
    }

    /// Capture a snapshot from a trapped context.
    ///
    /// Always returns. A decode failure in the extended state is logged and
    /// leaves the unreached fields zero; the caller only sees it as a later
    /// comparison mismatch.
    ///
    /// # Safety
    ///
    /// `ctx` must describe a live trap frame in this process: the program
    /// counter must point at the readable faulting instruction, and any
    /// side areas the architecture keeps out of line (spilled register
    /// windows, vector save buffers, indirection targets) must stay valid
    /// for the duration of the call.
    unsafe fn capture(ctx: &Self::Context, config: &Self::Config, load_base: u64)
        -> Self::RegInfo;

    /// Number of meaningful leading bytes of the snapshot's byte image.
    /// A pure function of the snapshot's own length and mode fields.
    fn active_len(ri: &Self::RegInfo) -> usize;

    /// Byte-exact comparison over the active prefix. A shape mismatch
    /// between peers shows up as plain inequality.
    fn is_eq(a: &Self::RegInfo, b: &Self::RegInfo) -> bool {
        let n = Self::active_len(a);
        a.as_bytes()[..n] == b.as_bytes()[..n]
    }

    /// Print every field in canonical architectural order.
    fn dump(ri: &Self::RegInfo, f: &mut dyn fmt::Write) -> fmt::Result;

    /// Print one line per differing field-group.
    fn dump_mismatch(
        a: &Self::RegInfo,
        b: &Self::RegInfo,
        f: &mut dyn fmt::Write,
    ) -> fmt::Result;

    /// Move the context's program counter past the trapping instruction so
    /// execution resumes on the next one.
    fn advance_pc(ctx: &mut Self::Context);

    /// Write the control-transfer register in a live context.
    fn set_transfer_reg(ctx: &mut Self::Context, value: u64);

    /// Read the control-transfer register back from a snapshot.
    fn transfer_reg(ri: &Self::RegInfo) -> u64;

    /// Decode the sideband operation from the captured faulting instruction.
    fn trap_op(ri: &Self::RegInfo) -> TrapOp;

    /// Base-relative program counter stored in the snapshot.
    fn pc_offset(ri: &Self::RegInfo) -> u64;
}

/// The architecture this process runs on.
#[cfg(target_arch = "aarch64")]
pub type Host = aarch64::Aarch64;
#[cfg(target_arch = "sparc64")]
pub type Host = sparc64::Sparc64;
#[cfg(target_arch = "powerpc64")]
pub type Host = ppc64::Ppc64;
#[cfg(target_arch = "m68k")]
pub type Host = m68k::M68k;
