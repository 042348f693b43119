//! Shared harness the boundary-scenario tests, the property tests, and
//! [`emu-test-runner`](bin/main.rs) all build on: lay a flat program (and
//! any data it references) into a byte buffer the caller owns, drive a
//! [`Cpu`] over it to completion, and hand back what it wrote to `stdout`
//! so assertions don't need a real file descriptor.

use emu_core::config::CpuConfig;
use emu_core::registers::{RAX, RDI, RDX, RSI};
use emu_core::syscall::{SyscallHandler, SyscallOutcome};
use emu_core::{Cpu, CpuError};

pub fn setup_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

/// Captures `write` payloads instead of forwarding them to a real fd, and
/// terminates the guest on `exit`/`exit_group` — the same syscalls
/// `emu-cli`'s `HostForwardingSyscallHandler` forwards to the host kernel,
/// kept in-process here so a test can inspect exactly what the guest wrote.
#[derive(Debug, Default)]
pub struct CapturingSyscallHandler {
    pub writes: Vec<Vec<u8>>,
}

impl CapturingSyscallHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyscallHandler for CapturingSyscallHandler {
    fn handle_syscall(&mut self, cpu: &mut Cpu) -> SyscallOutcome {
        let nr = cpu.regs.read64(RAX);
        match nr {
            1 => {
                let addr = cpu.regs.read64(RSI);
                let count = cpu.regs.read64(RDX) as usize;
                if let Ok(data) = cpu.mem.read_bytes(addr, count, cpu.rip) {
                    self.writes.push(data.to_vec());
                }
                cpu.regs.write64(RAX, count as u64);
                SyscallOutcome::Continue
            }
            60 | 231 => SyscallOutcome::Terminate(cpu.regs.read64(RDI) as i32),
            _ => {
                log::warn!("boundary scenario issued unhandled syscall {nr}");
                SyscallOutcome::Continue
            }
        }
    }
}

/// Run a flat program already placed at the front of `mem` (by the
/// caller — this just wires up `CpuConfig` and drives the loop), starting
/// at `entry_rip` with a stack growing down from `stack_top`. Returns the
/// instruction count, the guest's exit code, and whatever it wrote to fd 1.
pub fn run_program(
    mem: &mut [u8],
    entry_rip: u64,
    stack_top: u64,
) -> std::result::Result<(u64, i32, CapturingSyscallHandler), CpuError> {
    let config = CpuConfig {
        mem_size: mem.len(),
        stack_top,
        entry_rip,
        ..CpuConfig::default()
    };
    let mut cpu = Cpu::new(mem, config);
    let mut handler = CapturingSyscallHandler::new();
    let (instructions, exit_code) = cpu.run(&mut handler)?;
    Ok((instructions, exit_code, handler))
}

/// Place `code` at address 0 and each `(addr, bytes)` data blob at its
/// address, in a freshly zeroed buffer of `mem_size` bytes.
pub fn flat_image(mem_size: usize, code: &[u8], data: &[(usize, &[u8])]) -> Vec<u8> {
    let mut mem = vec![0u8; mem_size];
    mem[0..code.len()].copy_from_slice(code);
    for (addr, bytes) in data {
        mem[*addr..*addr + bytes.len()].copy_from_slice(bytes);
    }
    mem
}
