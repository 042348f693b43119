//! Thin harness binary: flat-image loader, host-forwarding syscall bridge,
//! and hand-rolled CLI argument parsing (`emu-core` itself takes no
//! dependency on an args crate, so neither does this binary).

use std::fs;
use std::process::ExitCode;

use emu_core::config::{CpuConfig, Mode};
use emu_core::registers::{RAX, RDI, RDX, RSI};
use emu_core::syscall::{SyscallHandler, SyscallOutcome};
use emu_core::trace::LogTraceSink;
use emu_core::Cpu;

/// Guest code is loaded at a fixed address, the way a statically linked
/// binary's `.text` would sit relative to its own load bias; this harness
/// does no ELF parsing, so there's no program header to read a real base
/// address from.
const DEFAULT_LOAD_ADDR: u64 = 0x0040_0000;
const DEFAULT_MEM_MB: usize = 64;
const DEFAULT_STACK_SIZE: u64 = 8 * 1024 * 1024;

struct Args {
    trace: bool,
    mode32: bool,
    mem_mb: usize,
    entry: Option<u64>,
    path: String,
    guest_argv: Vec<String>,
}

fn parse_args(raw: &[String]) -> Result<Args, String> {
    let mut trace = false;
    let mut mode32 = false;
    let mut mem_mb = DEFAULT_MEM_MB;
    let mut entry = None;
    let mut path = None;
    let mut guest_argv = Vec::new();

    let mut iter = raw.iter();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            guest_argv.extend(iter.by_ref().cloned());
            break;
        } else if arg == "--trace" {
            trace = true;
        } else if arg == "--mode32" {
            mode32 = true;
        } else if let Some(v) = arg.strip_prefix("--mem-mb=") {
            mem_mb = v.parse::<usize>().map_err(|_| format!("invalid --mem-mb value: {v}"))?;
        } else if let Some(v) = arg.strip_prefix("--entry=") {
            let v = v.strip_prefix("0x").unwrap_or(v);
            entry = Some(u64::from_str_radix(v, 16).map_err(|_| format!("invalid --entry value: {v}"))?);
        } else if path.is_none() {
            path = Some(arg.clone());
        } else {
            return Err(format!("unrecognized argument: {arg}"));
        }
    }

    let path = path.ok_or_else(|| "missing flat-binary path".to_string())?;
    Ok(Args {
        trace,
        mode32,
        mem_mb,
        entry,
        path,
        guest_argv,
    })
}

/// Forwards the handful of syscalls the boundary-scenario programs need to
/// the real host kernel via `libc`, the same number-to-handler dispatch
/// shape the donor kernel's own `syscall_dispatcher` uses, run in the
/// opposite direction (host-emulating rather than guest-emulating).
struct HostForwardingSyscallHandler {
    brk: u64,
}

impl HostForwardingSyscallHandler {
    fn new(initial_brk: u64) -> Self {
        HostForwardingSyscallHandler { brk: initial_brk }
    }
}

impl SyscallHandler for HostForwardingSyscallHandler {
    fn handle_syscall(&mut self, cpu: &mut Cpu) -> SyscallOutcome {
        let nr = cpu.regs.read64(RAX);
        match nr {
            // write(fd, buf, count)
            1 => {
                let fd = cpu.regs.read64(RDI) as i32;
                let addr = cpu.regs.read64(RSI);
                let count = cpu.regs.read64(RDX) as usize;
                let ret = match cpu.mem.read_bytes(addr, count, cpu.rip) {
                    Ok(data) => unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) },
                    Err(_) => -(libc::EFAULT as isize) as isize,
                };
                cpu.regs.write64(RAX, ret as u64);
                SyscallOutcome::Continue
            }
            // exit, exit_group
            60 | 231 => {
                let code = cpu.regs.read64(RDI) as i32;
                SyscallOutcome::Terminate(code)
            }
            // brk: no real heap is tracked, just the one pointer a guest's
            // allocator probes to find out where its arena starts/ends.
            12 => {
                let requested = cpu.regs.read64(RDI);
                if requested != 0 {
                    self.brk = requested;
                }
                cpu.regs.write64(RAX, self.brk);
                SyscallOutcome::Continue
            }
            _ => {
                log::warn!("unimplemented syscall forwarded to host: {nr}");
                cpu.regs.write64(RAX, -(libc::ENOSYS as i64) as u64);
                SyscallOutcome::Continue
            }
        }
    }
}

fn setup_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn run() -> Result<i32, String> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&argv)?;

    let code = fs::read(&args.path).map_err(|e| format!("reading {}: {e}", args.path))?;
    let entry = args.entry.unwrap_or(DEFAULT_LOAD_ADDR);
    let mem_size = args.mem_mb * 1024 * 1024;
    if (DEFAULT_LOAD_ADDR as usize) + code.len() > mem_size {
        return Err(format!(
            "flat image ({} bytes) does not fit at load address {:#x} in a {}MB guest memory",
            code.len(),
            DEFAULT_LOAD_ADDR,
            args.mem_mb
        ));
    }

    let mut mem = vec![0u8; mem_size];
    mem[DEFAULT_LOAD_ADDR as usize..DEFAULT_LOAD_ADDR as usize + code.len()].copy_from_slice(&code);

    let config = CpuConfig {
        mem_size,
        stack_top: mem_size as u64 - 4096,
        stack_size: DEFAULT_STACK_SIZE,
        entry_rip: entry,
        mode: if args.mode32 { Mode::Compat32 } else { Mode::Long },
        ..CpuConfig::default()
    };

    let mut cpu = Cpu::new(&mut mem, config);
    if args.trace {
        cpu.trace_instructions(true);
        cpu.set_trace_sink(Box::new(LogTraceSink));
    }
    if args.mode32 {
        cpu.mode32(true);
    }

    if !args.guest_argv.is_empty() {
        log::debug!("guest argv (not injected into guest memory by this harness): {:?}", args.guest_argv);
    }

    let mut handler = HostForwardingSyscallHandler::new(mem_size as u64 / 2);
    match cpu.run(&mut handler) {
        Ok((instructions, exit_code)) => {
            log::info!("guest exited after {instructions} instructions with status {exit_code}");
            Ok(exit_code)
        }
        Err(e) => Err(format!("{e}")),
    }
}

fn main() -> ExitCode {
    setup_logging();
    match run() {
        Ok(code) => {
            if let Ok(code) = u8::try_from(code.rem_euclid(256)) {
                ExitCode::from(code)
            } else {
                ExitCode::FAILURE
            }
        }
        Err(msg) => {
            eprintln!("emu-cli: {msg}");
            ExitCode::FAILURE
        }
    }
}
