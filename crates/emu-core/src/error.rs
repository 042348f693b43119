//! Error kinds surfaced by the CPU core.
//!
//! Four kinds only, matching the error-handling design: undefined encodings,
//! out-of-bounds memory/stack access, arithmetic traps (DIV/IDIV by zero),
//! and cooperative host termination. None of these are recoverable from
//! inside the core — a bad instruction leaves guest state inconsistent, so
//! the caller's job is to report and stop, not to retry.

use std::fmt;

/// Snapshot of decoder state captured at the point an error was raised, for
/// diagnostics. Cheap to construct; carried by value inside [`CpuError`].
#[derive(Debug, Clone, Default)]
pub struct FaultContext {
    pub rip: u64,
    pub opcode_bytes: Vec<u8>,
    pub mnemonic_hint: Option<&'static str>,
}

impl fmt::Display for FaultContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rip={:#018x} bytes=[", self.rip)?;
        for (i, b) in self.opcode_bytes.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{b:02x}")?;
        }
        write!(f, "]")?;
        if let Some(m) = self.mnemonic_hint {
            write!(f, " ({m})")?;
        }
        Ok(())
    }
}

/// The guest's chosen exit status, extracted from `exit`/`exit_group` or
/// inferred as 0 on a bare HLT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

#[derive(Debug, thiserror::Error)]
pub enum CpuError {
    #[error("undefined encoding at {ctx}")]
    UndefinedEncoding { ctx: FaultContext },

    #[error("memory access out of bounds: addr={addr:#018x} len={len} mem_size={mem_size:#x} at {ctx}")]
    BoundsViolation {
        addr: u64,
        len: usize,
        mem_size: usize,
        ctx: FaultContext,
    },

    #[error("stack pointer {rsp:#018x} outside window [{low:#018x}, {high:#018x}) at {ctx}")]
    StackWindowViolation {
        rsp: u64,
        low: u64,
        high: u64,
        ctx: FaultContext,
    },

    #[error("arithmetic trap (#DE) at {ctx}")]
    ArithmeticTrap { ctx: FaultContext },

    #[error("host requested termination, exit code {0}")]
    HostTermination(ExitCode),
}

impl CpuError {
    /// `true` for the one error kind that is not actually a failure: a
    /// cooperative exit requested by the guest (via syscall) or the host.
    pub fn is_termination(&self) -> bool {
        matches!(self, CpuError::HostTermination(_))
    }
}

pub type Result<T> = std::result::Result<T, CpuError>;
