//! Per-instruction trace hook (§6).
//!
//! Deliberately separate from the `log` crate's diagnostic output: tracing
//! is architectural instrumentation the guest's own behavior drives one
//! line per executed instruction, at a volume that would drown a normal
//! log stream, and a caller may want it routed somewhere other than
//! `env_logger`'s destination (a ring buffer, a file, a test harness's
//! `Vec<String>`). [`TraceSink`] keeps that a pluggable collaborator
//! instead.

use crate::registers::REG_NAMES64;

/// One fully-assembled trace line's components, handed to a [`TraceSink`]
/// rather than pre-formatted, so a sink that only wants RIPs doesn't pay
/// for the rest of the formatting.
pub struct TraceEvent<'a> {
    pub rip: u64,
    pub symbol: Option<&'a str>,
    pub raw_bytes: &'a [u8],
    pub nonzero_gprs: &'a [(usize, u64)],
    pub flags_digest: u64,
    pub mnemonic: &'a str,
    pub operands: &'a str,
}

impl<'a> TraceEvent<'a> {
    /// Render the one-line human-readable form described in §6: RIP,
    /// optional symbol, raw bytes, a compact nonzero-GPR dump, a flag
    /// digest, then the disassembled mnemonic and operands.
    pub fn format_line(&self) -> String {
        let bytes_hex: String = self
            .raw_bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        let gprs: String = self
            .nonzero_gprs
            .iter()
            .map(|(idx, v)| format!("{}={v:#x}", REG_NAMES64[*idx]))
            .collect::<Vec<_>>()
            .join(" ");
        let symbol = self.symbol.map(|s| format!(" <{s}>")).unwrap_or_default();
        format!(
            "{:#018x}{symbol}  {bytes_hex:<24}  {:<8}{}  [{gprs}] flags={:#06x}",
            self.rip, self.mnemonic, self.operands, self.flags_digest
        )
    }
}

/// External collaborator that receives one [`TraceEvent`] per executed
/// instruction when tracing is enabled. Symbol lookup for `TraceEvent::symbol`
/// is the sink's responsibility, not the CPU's — per §6 it's an external
/// collaborator, not architectural state.
pub trait TraceSink {
    fn on_instruction(&mut self, event: &TraceEvent);
}

/// Sends each trace line to the `log` crate at `trace` level, for the
/// common case of "print trace lines to wherever `env_logger` is
/// configured to write."
#[derive(Debug, Default)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn on_instruction(&mut self, event: &TraceEvent) {
        log::trace!("{}", event.format_line());
    }
}

/// Collects every trace line into memory, for tests and offline analysis.
#[derive(Debug, Default)]
pub struct VecTraceSink {
    pub lines: Vec<String>,
}

impl TraceSink for VecTraceSink {
    fn on_instruction(&mut self, event: &TraceEvent) {
        self.lines.push(event.format_line());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_line_includes_rip_and_mnemonic() {
        let event = TraceEvent {
            rip: 0x401000,
            symbol: Some("_start"),
            raw_bytes: &[0x48, 0x89, 0xe5],
            nonzero_gprs: &[(4, 0x7fff_0000_0000)],
            flags_digest: 0x0202,
            mnemonic: "mov",
            operands: "rbp, rsp",
        };
        let line = event.format_line();
        assert!(line.contains("_start"));
        assert!(line.contains("mov"));
        assert!(line.contains("rsp=0x7fff0000"));
    }

    #[test]
    fn vec_sink_accumulates_lines() {
        let mut sink = VecTraceSink::default();
        let event = TraceEvent {
            rip: 0,
            symbol: None,
            raw_bytes: &[0x90],
            nonzero_gprs: &[],
            flags_digest: 0,
            mnemonic: "nop",
            operands: "",
        };
        sink.on_instruction(&event);
        sink.on_instruction(&event);
        assert_eq!(sink.lines.len(), 2);
    }
}
