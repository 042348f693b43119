//! Construction-time configuration for a [`crate::cpu::Cpu`].
//!
//! The distilled spec never names this struct explicitly, but §5's "bounds
//! checks" paragraph and §3's memory/stack model both imply knobs a loader
//! has to supply. Gathering them here (rather than as loose `Cpu::new`
//! parameters) keeps the constructor readable and gives tests a single place
//! to vary `strict_bounds` independently of the build profile.

/// CPU operating mode. The core always stores 64-bit register state; `Mode`
/// only affects default operand-size selection and a handful of 32-bit-only
/// encodings (e.g. legacy `int 0x80` accounting is left to the host loader).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Long,
    Compat32,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Long
    }
}

#[derive(Debug, Clone)]
pub struct CpuConfig {
    /// Total size of the flat linear memory region.
    pub mem_size: usize,
    /// Address the stack pointer starts at (grows down from here).
    pub stack_top: u64,
    /// Size of the valid stack window below `stack_top`.
    pub stack_size: u64,
    /// Small amount of slack above `stack_top` tolerated by the bounds
    /// check (call frames occasionally push just past the nominal top
    /// before the first `sub rsp`).
    pub stack_slack: u64,
    /// Initial RIP (guest entry point).
    pub entry_rip: u64,
    /// Initial operating mode.
    pub mode: Mode,
    /// When `true`, every memory access and every RSP write is bounds
    /// checked and a violation raises [`crate::error::CpuError`] instead of
    /// continuing. Matches "debug builds" from §5; exposed as a runtime
    /// flag so both behaviors are testable from one build.
    pub strict_bounds: bool,
}

impl Default for CpuConfig {
    fn default() -> Self {
        CpuConfig {
            mem_size: 64 * 1024 * 1024,
            stack_top: 0x7fff_0000_0000,
            stack_size: 8 * 1024 * 1024,
            stack_slack: 4096,
            entry_rip: 0,
            mode: Mode::Long,
            strict_bounds: true,
        }
    }
}
