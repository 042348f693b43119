//! CPUID surface (§6).
//!
//! Real CPUID is a leaf-indexed table of feature bits; this core only
//! needs to convince guest code's feature-detection probes that it's
//! running on a CPU with nothing exotic to discover. `eax=1` advertising
//! no feature bits means guest libc startup code takes the conservative,
//! widely-compatible path rather than branching into SSE3+/AVX code this
//! core doesn't execute.

use crate::error::{CpuError, FaultContext, Result};

/// Result registers for one CPUID query, in encoding order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// `GenuineIntel`, split across EBX/EDX/ECX the way leaf 0 always returns
/// a vendor string (not EBX/ECX/EDX order — that's the historical quirk
/// real CPUID leaf 0 has).
const VENDOR_EBX: u32 = u32::from_le_bytes(*b"Genu");
const VENDOR_EDX: u32 = u32::from_le_bytes(*b"ineI");
const VENDOR_ECX: u32 = u32::from_le_bytes(*b"ntel");

/// Execute one CPUID query. `rip` is only used to attribute a fault if
/// `eax` names a leaf this core doesn't model.
pub fn cpuid(eax: u32, rip: u64) -> Result<CpuidResult> {
    match eax {
        0 => Ok(CpuidResult {
            eax: 1,
            ebx: VENDOR_EBX,
            ecx: VENDOR_ECX,
            edx: VENDOR_EDX,
        }),
        1 => Ok(CpuidResult::default()),
        0x8000_0000 => Ok(CpuidResult::default()),
        _ => Err(CpuError::UndefinedEncoding {
            ctx: FaultContext {
                rip,
                mnemonic_hint: Some("cpuid: unsupported leaf"),
                ..Default::default()
            },
        }),
    }
}
