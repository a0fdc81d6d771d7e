//! Register-state snapshot codec and comparator for lockstep instruction
//! conformance testing.
//!
//! Two independent execution engines (for instance an emulator and real
//! silicon) run one identical random instruction stream and trap after every
//! instruction. This crate turns each trapped machine context into a
//! canonical snapshot that compares bit-for-bit across processes:
//!
//! * Program counters (and every other captured instruction address) are
//!   rebased against the image load address, so peers mapping the test
//!   image at different addresses still produce identical snapshots.
//! * Environment-bound registers (stack pointer, thread pointer and
//!   friends) are overwritten with [`REG_SENTINEL`] after any internal use
//!   of their true value.
//! * Variable-length vector and tile state is folded into a length-tagged
//!   trailing region whose sub-register offsets derive from the stored
//!   vector length and mode flags.
//!
//! Everything goes through the [`Arch`] capability trait, implemented once
//! per supported architecture and selected at build time; the byte image of
//! a snapshot up to `active_len` is the exact payload the transport layer
//! exchanges between the two peers.
//!
//! ```
//! use regsnap::arch::ppc64::{MachineContext, Ppc64, VectorRegs, NIP};
//! use regsnap::{Arch, TrapOp};
//!
//! // A trap frame whose PC sits on a sideband "compare" instruction.
//! let insn: u32 = 0x0000_5af0;
//! let altivec = VectorRegs { vrregs: [[0; 4]; 32], vscr: [0; 4], vrsave: 0 };
//! let mut ctx = MachineContext {
//!     gp_regs: [0; 48],
//!     fp_regs: [0; 33],
//!     v_regs: &altivec,
//! };
//! ctx.gp_regs[NIP] = &insn as *const u32 as u64;
//!
//! let base = ctx.gp_regs[NIP];
//! let snap = unsafe { Ppc64::capture(&ctx, &(), base) };
//! assert_eq!(Ppc64::trap_op(&snap), TrapOp::Compare);
//! assert_eq!(Ppc64::pc_offset(&snap), 0);
//! ```
//!
//! A decode failure while walking a context's extended state is reported
//! through `tracing` and leaves the affected snapshot partially zeroed; the
//! next comparison against the peer then reports the mismatch. Capture
//! itself never fails.

pub mod arch;
pub mod error;
pub mod options;

pub use arch::{Arch, RawBytes, TrapOp, REG_SENTINEL};
#[cfg(any(
    target_arch = "aarch64",
    target_arch = "sparc64",
    target_arch = "powerpc64",
    target_arch = "m68k"
))]
pub use arch::Host;
pub use error::{DecodeError, OptionError, StartupError};
pub use options::ArchOption;
