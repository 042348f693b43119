#![no_main]
// Decode/execute fuzzer: feeds arbitrary bytes to the CPU as a flat guest
// image and drives it for a bounded number of steps, the same shape the
// donor project's VFS path fuzzer used for its own subsystem — any panic,
// not a returned `CpuError`, is the bug this is looking for.

use emu_core::config::CpuConfig;
use emu_core::syscall::{NullSyscallHandler, SyscallHandler, SyscallOutcome};
use emu_core::Cpu;
use libfuzzer_sys::fuzz_target;

const MEM_SIZE: usize = 1 << 16;
const MAX_STEPS: usize = 10_000;

/// Treats every syscall as an immediate, harmless exit so a fuzz input
/// that happens to hit `SYSCALL` doesn't spin the guest forever waiting
/// on state this harness never sets up (no open fds, no argv).
struct ImmediateExitHandler;

impl SyscallHandler for ImmediateExitHandler {
    fn handle_syscall(&mut self, _cpu: &mut Cpu) -> SyscallOutcome {
        SyscallOutcome::Terminate(0)
    }
}

fuzz_target!(|data: &[u8]| {
    if data.is_empty() || data.len() > MEM_SIZE {
        return;
    }

    let mut mem = vec![0u8; MEM_SIZE];
    mem[..data.len()].copy_from_slice(data);

    let config = CpuConfig {
        mem_size: MEM_SIZE,
        stack_top: (MEM_SIZE as u64) - 4096,
        entry_rip: 0,
        ..CpuConfig::default()
    };

    let mut cpu = Cpu::new(&mut mem, config);
    let mut handler = ImmediateExitHandler;

    for _ in 0..MAX_STEPS {
        match cpu.step(&mut handler) {
            Ok(true) => continue,
            Ok(false) => break,
            Err(_) => break,
        }
    }
});
