//! The top-level interpreter loop (§5, §6): ties the register file,
//! memory, x87 stack, XMM file, and the `decode`/`exec` modules together
//! into one `step`/`run` pair.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{CpuConfig, Mode};
use crate::decode::{self, InstrStream, ModRm, Prefixes, RegOrMem};
use crate::error::{CpuError, FaultContext, Result};
use crate::exec::x87::{transcendental as x87math, FpuState, F80};
use crate::exec::{flags as flagops, integer, shift, sse2, string_ops};
use crate::memory::Memory;
use crate::registers::{GpRegisters, RFlags, SegmentBases, Width, RAX, RCX, RDX, RSP};
use crate::syscall::{SyscallHandler, SyscallOutcome};
use crate::trace::{TraceEvent, TraceSink};

/// Host-toggleable termination flag, checked once per instruction per §5's
/// "Cancellation" rule. `Cpu` is not `Sync`, but the flag itself needs to
/// be settable from, e.g., a signal handler running on another thread —
/// hence `AtomicBool` with relaxed ordering rather than a plain `bool`.
#[derive(Debug, Default)]
pub struct TerminationFlag(AtomicBool);

impl TerminationFlag {
    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct Cpu<'a> {
    pub regs: GpRegisters,
    pub flags: RFlags,
    pub xmm: [u128; 16],
    pub fpu: FpuState,
    /// SSE control/status register. Only the rounding-mode and mask bits
    /// LDMXCSR/STMXCSR round-trip are modeled; this core never raises the
    /// SIMD floating-point exceptions the mask bits would otherwise gate.
    pub mxcsr: u32,
    pub seg: SegmentBases,
    pub mem: Memory<'a>,
    pub rip: u64,
    pub mode: Mode,
    pub termination: TerminationFlag,
    tracing: bool,
    trace_sink: Option<Box<dyn TraceSink>>,
    exit_code: Option<i32>,
}

/// Adapts `Cpu`'s memory and a running cursor into the `InstrStream` the
/// `decode` module fetches bytes through. Kept as a short-lived borrow
/// rather than a field on `Cpu` since it only needs to live for the
/// duration of one `step`.
struct Fetcher<'c, 'a> {
    mem: &'c Memory<'a>,
    cursor: u64,
    start_rip: u64,
}

impl<'c, 'a> InstrStream for Fetcher<'c, 'a> {
    fn fetch_u8(&mut self) -> Result<u8> {
        let b = self.mem.read_u8(self.cursor, self.start_rip)?;
        self.cursor += 1;
        Ok(b)
    }
    fn current_rip(&self) -> u64 {
        self.cursor
    }
}

impl<'a> Cpu<'a> {
    pub fn new(bytes: &'a mut [u8], config: CpuConfig) -> Self {
        let mut regs = GpRegisters::new();
        regs.write64(RSP, config.stack_top);
        Cpu {
            regs,
            flags: RFlags::default(),
            xmm: [0u128; 16],
            fpu: FpuState::new(),
            mxcsr: 0x1f80,
            seg: SegmentBases::default(),
            mem: Memory::new(bytes, config.strict_bounds),
            rip: config.entry_rip,
            mode: config.mode,
            termination: TerminationFlag::default(),
            tracing: false,
            trace_sink: None,
            exit_code: None,
        }
    }

    pub fn trace_instructions(&mut self, enable: bool) -> bool {
        let prev = self.tracing;
        self.tracing = enable;
        prev
    }

    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.trace_sink = Some(sink);
    }

    pub fn end_emulation(&self) {
        self.termination.request();
    }

    pub fn mode32(&mut self, compat: bool) {
        self.mode = if compat { Mode::Compat32 } else { Mode::Long };
    }

    fn default_width(&self, prefixes: &Prefixes) -> Width {
        if prefixes.rex_w() {
            Width::W64
        } else if prefixes.opsize_66 {
            Width::W16
        } else {
            Width::W32
        }
    }

    fn read_rm(&self, modrm: &ModRm, width: Width, rip: u64) -> Result<u64> {
        match modrm.rm {
            RegOrMem::Reg(idx) => Ok(self.regs.read(idx, width)),
            RegOrMem::Mem(addr) => match width {
                Width::W8 => self.mem.read_u8(addr, rip).map(|v| v as u64),
                Width::W16 => self.mem.read_u16(addr, rip).map(|v| v as u64),
                Width::W32 => self.mem.read_u32(addr, rip).map(|v| v as u64),
                Width::W64 => self.mem.read_u64(addr, rip),
            },
        }
    }

    fn write_rm(&mut self, modrm: &ModRm, width: Width, value: u64, rip: u64) -> Result<()> {
        match modrm.rm {
            RegOrMem::Reg(idx) => {
                self.regs.write(idx, width, value);
                Ok(())
            }
            RegOrMem::Mem(addr) => match width {
                Width::W8 => self.mem.write_u8(addr, value as u8, rip),
                Width::W16 => self.mem.write_u16(addr, value as u16, rip),
                Width::W32 => self.mem.write_u32(addr, value as u32, rip),
                Width::W64 => self.mem.write_u64(addr, value, rip),
            },
        }
    }

    fn read_xmm_mem_or_reg(&self, modrm: &ModRm, rip: u64) -> Result<u128> {
        match modrm.rm {
            RegOrMem::Reg(idx) => Ok(self.xmm[idx]),
            RegOrMem::Mem(addr) => self.mem.read_u128(addr, rip),
        }
    }

    fn write_xmm_mem_or_reg(&mut self, modrm: &ModRm, value: u128, rip: u64) -> Result<()> {
        match modrm.rm {
            RegOrMem::Reg(idx) => {
                self.xmm[idx] = value;
                Ok(())
            }
            RegOrMem::Mem(addr) => self.mem.write_u128(addr, value, rip),
        }
    }

    fn undefined(&self, rip: u64, opcode_bytes: Vec<u8>, hint: &'static str) -> CpuError {
        CpuError::UndefinedEncoding {
            ctx: FaultContext {
                rip,
                opcode_bytes,
                mnemonic_hint: Some(hint),
            },
        }
    }

    /// Execute exactly one instruction. Returns `Ok(true)` if the run
    /// loop should continue, `Ok(false)` if this instruction requested
    /// termination (HLT, a terminating syscall, or `end_emulation`), and
    /// `Err` on a fault.
    pub fn step(&mut self, syscalls: &mut dyn SyscallHandler) -> Result<bool> {
        if self.termination.is_set() {
            return Ok(false);
        }
        let start_rip = self.rip;
        let mut fetcher = Fetcher {
            mem: &self.mem,
            cursor: self.rip,
            start_rip,
        };
        let (prefixes, opcode, two_byte) = decode::fetch_prefixes_and_opcode(&mut fetcher)?;
        let cursor_after_opcode = fetcher.cursor;

        let outcome = if two_byte {
            self.exec_0f(opcode[1], &prefixes, cursor_after_opcode, start_rip, syscalls)?
        } else {
            self.exec_one_byte(opcode[0], &prefixes, cursor_after_opcode, start_rip, syscalls)?
        };

        if self.tracing {
            if let Some(sink) = self.trace_sink.as_mut() {
                let nonzero: Vec<(usize, u64)> = (0..16)
                    .filter(|&i| self.regs.read64(i) != 0)
                    .map(|i| (i, self.regs.read64(i)))
                    .collect();
                let len = (self.rip - start_rip) as usize;
                let raw = self.mem.read_bytes(start_rip, len.min(16), start_rip).unwrap_or(&[]);
                let event = TraceEvent {
                    rip: start_rip,
                    symbol: None,
                    raw_bytes: raw,
                    nonzero_gprs: &nonzero,
                    flags_digest: self.flags.bits(),
                    mnemonic: "?",
                    operands: "",
                };
                sink.on_instruction(&event);
            }
        }

        Ok(outcome)
    }

    pub fn run(&mut self, syscalls: &mut dyn SyscallHandler) -> Result<(u64, i32)> {
        let mut count: u64 = 0;
        loop {
            match self.step(syscalls) {
                Ok(true) => count += 1,
                Ok(false) => return Ok((count, self.exit_code.unwrap_or(0))),
                Err(CpuError::HostTermination(code)) => return Ok((count, code.0)),
                Err(e) => return Err(e),
            }
        }
    }

    fn fetch_imm8(&self, cursor: &mut u64, rip: u64) -> Result<u8> {
        let v = self.mem.read_u8(*cursor, rip)?;
        *cursor += 1;
        Ok(v)
    }
    fn fetch_imm16(&self, cursor: &mut u64, rip: u64) -> Result<u16> {
        let v = self.mem.read_u16(*cursor, rip)?;
        *cursor += 2;
        Ok(v)
    }
    fn fetch_imm32(&self, cursor: &mut u64, rip: u64) -> Result<u32> {
        let v = self.mem.read_u32(*cursor, rip)?;
        *cursor += 4;
        Ok(v)
    }
    fn fetch_imm64(&self, cursor: &mut u64, rip: u64) -> Result<u64> {
        let v = self.mem.read_u64(*cursor, rip)?;
        *cursor += 8;
        Ok(v)
    }

    fn fetch_modrm(&self, cursor: &mut u64, prefixes: &Prefixes, rip: u64) -> Result<ModRm> {
        let mut fetcher = Fetcher {
            mem: &self.mem,
            cursor: *cursor,
            start_rip: rip,
        };
        let mut modrm = decode::decode_modrm(&mut fetcher, prefixes, &self.regs)?;
        *cursor = fetcher.cursor;
        if let RegOrMem::Mem(ea) = modrm.rm {
            modrm.rm = RegOrMem::Mem(decode::apply_segment(ea, prefixes, &self.seg));
        }
        Ok(modrm)
    }

    /// Sign-extended branch-displacement immediate, added to `*cursor`
    /// (which is already past the displacement by the time the branch
    /// target is computed) to produce the jump target.
    fn rel_target(after_disp: u64, disp: i64) -> u64 {
        (after_disp as i64 + disp) as u64
    }

    fn exec_one_byte(
        &mut self,
        opcode: u8,
        prefixes: &Prefixes,
        mut cursor: u64,
        rip: u64,
        syscalls: &mut dyn SyscallHandler,
    ) -> Result<bool> {
        let width8 = Width::W8;
        let width = self.default_width(prefixes);

        // ADD/OR/ADC/SBB/AND/SUB/XOR/CMP share one encoding pattern across
        // eight base opcodes, 0x00 apart: +0 r/m8,r8  +1 r/m,r  +2 r8,r/m8
        // +3 r,r/m  +4 al,imm8  +5 eAX,imm.
        let arith_group = |op_index: u8| -> Option<fn(&mut RFlags, u64, u64, Width) -> u64> {
            Some(match op_index {
                0 => integer::add,
                1 => integer::or,
                2 => integer::adc,
                3 => integer::sbb,
                4 => integer::and,
                5 => integer::sub,
                6 => integer::xor,
                7 => |f: &mut RFlags, d, s, w| {
                    integer::cmp(f, d, s, w);
                    d
                },
                _ => return None,
            })
        };

        if opcode <= 0x3d && (opcode & 0x07) <= 5 {
            let group = opcode >> 3;
            if group <= 7 {
                let slot = opcode & 0x07;
                let op = arith_group(group).unwrap();
                let is_cmp = group == 7;
                match slot {
                    0 | 1 => {
                        let w = if slot == 0 { width8 } else { width };
                        let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                        let dst = self.read_rm(&modrm, w, rip)?;
                        let src = self.regs.read(modrm.reg, w);
                        let result = op(&mut self.flags, dst, src, w);
                        if !is_cmp {
                            self.write_rm(&modrm, w, result, rip)?;
                        }
                        self.rip = cursor;
                        return Ok(true);
                    }
                    2 | 3 => {
                        let w = if slot == 2 { width8 } else { width };
                        let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                        let dst = self.regs.read(modrm.reg, w);
                        let src = self.read_rm(&modrm, w, rip)?;
                        let result = op(&mut self.flags, dst, src, w);
                        if !is_cmp {
                            self.regs.write(modrm.reg, w, result);
                        }
                        self.rip = cursor;
                        return Ok(true);
                    }
                    4 => {
                        let imm = self.fetch_imm8(&mut cursor, rip)? as u64;
                        let dst = self.regs.read(RAX, width8);
                        let result = op(&mut self.flags, dst, imm, width8);
                        if !is_cmp {
                            self.regs.write(RAX, width8, result);
                        }
                        self.rip = cursor;
                        return Ok(true);
                    }
                    5 => {
                        let imm = self.fetch_imm_for_width(&mut cursor, width, rip)?;
                        let dst = self.regs.read(RAX, width);
                        let result = op(&mut self.flags, dst, imm, width);
                        if !is_cmp {
                            self.regs.write(RAX, width, result);
                        }
                        self.rip = cursor;
                        return Ok(true);
                    }
                    _ => unreachable!(),
                }
            }
        }

        match opcode {
            0x00..=0x3d => unreachable!("handled above"),

            // PUSH r64 (0x50-0x57, extended by REX.B)
            0x50..=0x57 => {
                let idx = (opcode - 0x50) as usize + prefixes.rex_b() as usize;
                let v = self.regs.read64(idx);
                integer::push(&mut self.mem, &mut self.regs, v, Width::W64, rip)?;
                self.rip = cursor;
                Ok(true)
            }
            0x58..=0x5f => {
                let idx = (opcode - 0x58) as usize + prefixes.rex_b() as usize;
                let v = integer::pop(&mut self.mem, &mut self.regs, Width::W64, rip)?;
                self.regs.write64(idx, v);
                self.rip = cursor;
                Ok(true)
            }
            0x68 => {
                let imm = self.fetch_imm32(&mut cursor, rip)? as i32 as i64 as u64;
                integer::push(&mut self.mem, &mut self.regs, imm, Width::W64, rip)?;
                self.rip = cursor;
                Ok(true)
            }
            0x6a => {
                let imm = self.fetch_imm8(&mut cursor, rip)? as i8 as i64 as u64;
                integer::push(&mut self.mem, &mut self.regs, imm, Width::W64, rip)?;
                self.rip = cursor;
                Ok(true)
            }

            // MOV r/m, r and r, r/m
            0x88 | 0x89 | 0x8a | 0x8b => {
                let w = if opcode & 1 == 0 { width8 } else { width };
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                if opcode & 2 == 0 {
                    let src = self.regs.read(modrm.reg, w);
                    self.write_rm(&modrm, w, src, rip)?;
                } else {
                    let src = self.read_rm(&modrm, w, rip)?;
                    self.regs.write(modrm.reg, w, src);
                }
                self.rip = cursor;
                Ok(true)
            }
            // LEA
            0x8d => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let addr = match modrm.rm {
                    RegOrMem::Mem(a) => a,
                    RegOrMem::Reg(_) => return Err(self.undefined(rip, vec![opcode], "lea with register operand")),
                };
                self.regs.write(modrm.reg, width, addr);
                self.rip = cursor;
                Ok(true)
            }
            // POP r/m
            0x8f => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let v = integer::pop(&mut self.mem, &mut self.regs, Width::W64, rip)?;
                self.write_rm(&modrm, Width::W64, v, rip)?;
                self.rip = cursor;
                Ok(true)
            }
            // XCHG eAX, r (0x91-0x97); 0x90 is NOP
            0x90 => {
                self.rip = cursor;
                Ok(true)
            }
            0x91..=0x97 => {
                let idx = (opcode - 0x90) as usize + prefixes.rex_b() as usize;
                let a = self.regs.read(RAX, width);
                let b = self.regs.read(idx, width);
                self.regs.write(RAX, width, b);
                self.regs.write(idx, width, a);
                self.rip = cursor;
                Ok(true)
            }
            // CBW/CWDE/CDQE
            0x98 => {
                let narrow = match width {
                    Width::W64 => Width::W32,
                    Width::W32 => Width::W16,
                    _ => Width::W8,
                };
                let v = integer::widen_accumulator(self.regs.read(RAX, narrow), narrow);
                self.regs.write(RAX, width, v);
                self.rip = cursor;
                Ok(true)
            }
            // CWD/CDQ/CQO
            0x99 => {
                let high = integer::sign_extend_into_high_half(self.regs.read(RAX, width), width);
                self.regs.write(RDX, width, high);
                self.rip = cursor;
                Ok(true)
            }
            // MOV AL/eAX, imm (0xB0-0xBF)
            0xb0..=0xb7 => {
                let idx = (opcode - 0xb0) as usize + prefixes.rex_b() as usize;
                let imm = self.fetch_imm8(&mut cursor, rip)?;
                self.regs.write(idx, width8, imm as u64);
                self.rip = cursor;
                Ok(true)
            }
            0xb8..=0xbf => {
                let idx = (opcode - 0xb8) as usize + prefixes.rex_b() as usize;
                // MOV r64, imm64 is the one encoding where REX.W widens the
                // immediate itself rather than just sign-extending a 32-bit
                // one; every other REX.W instruction goes through
                // `fetch_imm_for_width`'s 32-bit-sign-extended path.
                let imm = if width == Width::W64 {
                    self.fetch_imm64(&mut cursor, rip)?
                } else {
                    self.fetch_imm_for_width(&mut cursor, width, rip)?
                };
                self.regs.write(idx, width, imm);
                self.rip = cursor;
                Ok(true)
            }

            // MOV r/m, imm
            0xc6 | 0xc7 => {
                let w = if opcode == 0xc6 { width8 } else { width };
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let imm = if w == width8 {
                    self.fetch_imm8(&mut cursor, rip)? as u64
                } else {
                    self.fetch_imm_for_width(&mut cursor, w, rip)?
                };
                self.write_rm(&modrm, w, imm, rip)?;
                self.rip = cursor;
                Ok(true)
            }

            // Immediate arithmetic group 1: 0x80 r/m8,imm8  0x81 r/m,imm
            // 0x83 r/m,imm8(sign-extended)
            0x80 | 0x81 | 0x83 => {
                let w = if opcode == 0x80 { width8 } else { width };
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let imm: u64 = if opcode == 0x81 {
                    self.fetch_imm_for_width(&mut cursor, w, rip)?
                } else {
                    self.fetch_imm8(&mut cursor, rip)? as i8 as i64 as u64
                };
                let op = arith_group(modrm.reg as u8 & 0x7).unwrap();
                let is_cmp = modrm.reg & 0x7 == 7;
                let dst = self.read_rm(&modrm, w, rip)?;
                let result = op(&mut self.flags, dst, imm, w);
                if !is_cmp {
                    self.write_rm(&modrm, w, result, rip)?;
                }
                self.rip = cursor;
                Ok(true)
            }

            // TEST r/m, r  and r/m8, r8
            0x84 | 0x85 => {
                let w = if opcode == 0x84 { width8 } else { width };
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let dst = self.read_rm(&modrm, w, rip)?;
                let src = self.regs.read(modrm.reg, w);
                integer::test(&mut self.flags, dst, src, w);
                self.rip = cursor;
                Ok(true)
            }
            0xa8 | 0xa9 => {
                let w = if opcode == 0xa8 { width8 } else { width };
                let imm = if w == width8 {
                    self.fetch_imm8(&mut cursor, rip)? as u64
                } else {
                    self.fetch_imm_for_width(&mut cursor, w, rip)?
                };
                let dst = self.regs.read(RAX, w);
                integer::test(&mut self.flags, dst, imm, w);
                self.rip = cursor;
                Ok(true)
            }

            // INC/DEC/CALL/JMP/PUSH group (0xFE/0xFF)
            0xfe | 0xff => {
                let w = if opcode == 0xfe { width8 } else { width };
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                match modrm.reg & 0x7 {
                    0 => {
                        let dst = self.read_rm(&modrm, w, rip)?;
                        let r = integer::inc(&mut self.flags, dst, w);
                        self.write_rm(&modrm, w, r, rip)?;
                    }
                    1 => {
                        let dst = self.read_rm(&modrm, w, rip)?;
                        let r = integer::dec(&mut self.flags, dst, w);
                        self.write_rm(&modrm, w, r, rip)?;
                    }
                    2 => {
                        // CALL r/m (near, indirect)
                        let target = self.read_rm(&modrm, Width::W64, rip)?;
                        integer::call_near(&mut self.mem, &mut self.regs, cursor, rip)?;
                        self.rip = target;
                        return Ok(true);
                    }
                    4 => {
                        let target = self.read_rm(&modrm, Width::W64, rip)?;
                        self.rip = target;
                        return Ok(true);
                    }
                    6 => {
                        let v = self.read_rm(&modrm, Width::W64, rip)?;
                        integer::push(&mut self.mem, &mut self.regs, v, Width::W64, rip)?;
                    }
                    _ => return Err(self.undefined(rip, vec![opcode], "group5 reserved extension")),
                }
                self.rip = cursor;
                Ok(true)
            }

            // NEG/NOT/MUL/IMUL/DIV/IDIV/TEST group 3 (0xF6/0xF7)
            0xf6 | 0xf7 => {
                let w = if opcode == 0xf6 { width8 } else { width };
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                match modrm.reg & 0x7 {
                    0 | 1 => {
                        let imm = if w == width8 {
                            self.fetch_imm8(&mut cursor, rip)? as u64
                        } else {
                            self.fetch_imm_for_width(&mut cursor, w, rip)?
                        };
                        let dst = self.read_rm(&modrm, w, rip)?;
                        integer::test(&mut self.flags, dst, imm, w);
                    }
                    2 => {
                        let dst = self.read_rm(&modrm, w, rip)?;
                        let r = integer::not(dst, w);
                        self.write_rm(&modrm, w, r, rip)?;
                    }
                    3 => {
                        let dst = self.read_rm(&modrm, w, rip)?;
                        let r = integer::neg(&mut self.flags, dst, w);
                        self.write_rm(&modrm, w, r, rip)?;
                    }
                    4 => {
                        let src = self.read_rm(&modrm, w, rip)?;
                        let acc = self.regs.read(RAX, w);
                        let high_in = if w == Width::W8 { 0 } else { self.regs.read(RDX, w) };
                        let _ = high_in;
                        let (lo, hi) = integer::mul(&mut self.flags, acc, src, w);
                        self.store_mul_result(w, lo, hi);
                    }
                    5 => {
                        let src = self.read_rm(&modrm, w, rip)?;
                        let acc = self.regs.read(RAX, w);
                        let (lo, hi) = integer::imul1(&mut self.flags, acc, src, w);
                        self.store_mul_result(w, lo, hi);
                    }
                    6 => {
                        let src = self.read_rm(&modrm, w, rip)?;
                        let (lo, hi) = self.load_dividend(w);
                        let (q, r) = integer::div(hi, lo, src, w, rip)?;
                        self.store_div_result(w, q, r);
                    }
                    7 => {
                        let src = self.read_rm(&modrm, w, rip)?;
                        let (lo, hi) = self.load_dividend(w);
                        let (q, r) = integer::idiv(hi, lo, src, w, rip)?;
                        self.store_div_result(w, q, r);
                    }
                    _ => unreachable!(),
                }
                self.rip = cursor;
                Ok(true)
            }

            // Shift group 2
            0xc0 | 0xc1 | 0xd0 | 0xd1 | 0xd2 | 0xd3 => {
                let w = if opcode == 0xc0 || opcode == 0xd0 || opcode == 0xd2 {
                    width8
                } else {
                    width
                };
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let count: u8 = match opcode {
                    0xc0 | 0xc1 => self.fetch_imm8(&mut cursor, rip)?,
                    0xd0 | 0xd1 => 1,
                    _ => self.regs.read(RCX, width8) as u8,
                };
                let dst = self.read_rm(&modrm, w, rip)?;
                let result = match modrm.reg & 0x7 {
                    0 => shift::rol(&mut self.flags, dst, count, w),
                    1 => shift::ror(&mut self.flags, dst, count, w),
                    2 => shift::rcl(&mut self.flags, dst, count, w),
                    3 => shift::rcr(&mut self.flags, dst, count, w),
                    4 | 6 => shift::shl(&mut self.flags, dst, count, w),
                    5 => shift::shr(&mut self.flags, dst, count, w),
                    7 => shift::sar(&mut self.flags, dst, count, w),
                    _ => unreachable!(),
                };
                self.write_rm(&modrm, w, result, rip)?;
                self.rip = cursor;
                Ok(true)
            }

            // Jcc rel8
            0x70..=0x7f => {
                let disp = self.fetch_imm8(&mut cursor, rip)? as i8 as i64;
                if integer::eval_condition(&self.flags, opcode & 0xf) {
                    self.rip = Self::rel_target(cursor, disp);
                } else {
                    self.rip = cursor;
                }
                Ok(true)
            }
            // JMP rel8
            0xeb => {
                let disp = self.fetch_imm8(&mut cursor, rip)? as i8 as i64;
                self.rip = Self::rel_target(cursor, disp);
                Ok(true)
            }
            // JMP rel32
            0xe9 => {
                let disp = self.fetch_imm32(&mut cursor, rip)? as i32 as i64;
                self.rip = Self::rel_target(cursor, disp);
                Ok(true)
            }
            // CALL rel32
            0xe8 => {
                let disp = self.fetch_imm32(&mut cursor, rip)? as i32 as i64;
                integer::call_near(&mut self.mem, &mut self.regs, cursor, rip)?;
                self.rip = Self::rel_target(cursor, disp);
                Ok(true)
            }
            // RET
            0xc3 => {
                let target = integer::ret_near(&mut self.mem, &mut self.regs, rip)?;
                self.rip = target;
                Ok(true)
            }
            0xc2 => {
                let imm = self.fetch_imm16(&mut cursor, rip)?;
                let target = integer::ret_near(&mut self.mem, &mut self.regs, rip)?;
                let rsp = self.regs.read64(RSP);
                self.regs.write64(RSP, rsp.wrapping_add(imm as u64));
                self.rip = target;
                Ok(true)
            }

            // IMUL r, r/m, imm
            0x69 | 0x6b => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_rm(&modrm, width, rip)?;
                let imm = if opcode == 0x69 {
                    self.fetch_imm_for_width(&mut cursor, width, rip)?
                } else {
                    self.fetch_imm8(&mut cursor, rip)? as i8 as i64 as u64
                };
                let result = integer::imul2(&mut self.flags, src, imm, width);
                self.regs.write(modrm.reg, width, result);
                self.rip = cursor;
                Ok(true)
            }

            // String ops
            0xa4 | 0xa5 => {
                let w = if opcode == 0xa4 { width8 } else { width };
                let df = self.flags.test(RFlags::DF);
                if prefixes.rep.is_some() {
                    string_ops::rep(&mut self.regs, |r| {
                        string_ops::movs(&mut self.mem, r, w, df, rip)
                    })?;
                } else {
                    string_ops::movs(&mut self.mem, &mut self.regs, w, df, rip)?;
                }
                self.rip = cursor;
                Ok(true)
            }
            0xaa | 0xab => {
                let w = if opcode == 0xaa { width8 } else { width };
                let df = self.flags.test(RFlags::DF);
                if prefixes.rep.is_some() {
                    string_ops::rep(&mut self.regs, |r| {
                        string_ops::stos(&mut self.mem, r, w, df, rip)
                    })?;
                } else {
                    string_ops::stos(&mut self.mem, &mut self.regs, w, df, rip)?;
                }
                self.rip = cursor;
                Ok(true)
            }

            // MOVSXD
            0x63 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let v = self.read_rm(&modrm, Width::W32, rip)?;
                self.regs.write(modrm.reg, Width::W64, Width::W32.sign_extend(v));
                self.rip = cursor;
                Ok(true)
            }

            0xf4 => {
                self.rip = cursor;
                Ok(false)
            }
            0xf5 => {
                integer::cmc(&mut self.flags);
                self.rip = cursor;
                Ok(true)
            }
            0xf8 => {
                integer::clc(&mut self.flags);
                self.rip = cursor;
                Ok(true)
            }
            0xf9 => {
                integer::stc(&mut self.flags);
                self.rip = cursor;
                Ok(true)
            }
            0xfa => {
                integer::cli(&mut self.flags);
                self.rip = cursor;
                Ok(true)
            }
            0xfb => {
                integer::sti(&mut self.flags);
                self.rip = cursor;
                Ok(true)
            }
            0xfc => {
                integer::cld(&mut self.flags);
                self.rip = cursor;
                Ok(true)
            }
            0xfd => {
                integer::std_(&mut self.flags);
                self.rip = cursor;
                Ok(true)
            }
            0x90..=0x97 => unreachable!("handled above"),

            0xd8..=0xdf => self.exec_x87(opcode, prefixes, cursor, rip),
            // FWAIT: this core never defers an x87 exception, so it's a
            // pure no-op.
            0x9b => {
                self.rip = cursor;
                Ok(true)
            }

            _ => Err(self.undefined(rip, vec![opcode], "unrecognized one-byte opcode")),
        }
    }

    fn store_mul_result(&mut self, w: Width, lo: u64, hi: u64) {
        match w {
            Width::W8 => self.regs.write(RAX, Width::W16, (hi << 8) | (lo & 0xff)),
            _ => {
                self.regs.write(RAX, w, lo);
                self.regs.write(RDX, w, hi);
            }
        }
    }

    fn load_dividend(&self, w: Width) -> (u64, u64) {
        match w {
            Width::W8 => {
                let ax = self.regs.read(RAX, Width::W16);
                (ax, 0)
            }
            _ => (self.regs.read(RAX, w), self.regs.read(RDX, w)),
        }
    }

    fn store_div_result(&mut self, w: Width, quotient: u64, remainder: u64) {
        match w {
            Width::W8 => {
                let packed = (remainder << 8) | (quotient & 0xff);
                self.regs.write(RAX, Width::W16, packed);
            }
            _ => {
                self.regs.write(RAX, w, quotient);
                self.regs.write(RDX, w, remainder);
            }
        }
    }

    fn fetch_imm_for_width(&self, cursor: &mut u64, w: Width, rip: u64) -> Result<u64> {
        match w {
            Width::W16 => Ok(self.fetch_imm16(cursor, rip)? as u64),
            Width::W64 => {
                // Most 64-bit-operand-size immediates are still 32-bit,
                // sign-extended (the one ISA quirk where REX.W doesn't
                // widen the immediate); MOV r64, imm64 (0xB8-BF group) is
                // the sole exception and calls fetch_imm64 directly.
                Ok(self.fetch_imm32(cursor, rip)? as i32 as i64 as u64)
            }
            _ => Ok(self.fetch_imm32(cursor, rip)? as u64),
        }
    }

    fn exec_0f(
        &mut self,
        opcode: u8,
        prefixes: &Prefixes,
        mut cursor: u64,
        rip: u64,
        _syscalls: &mut dyn SyscallHandler,
    ) -> Result<bool> {
        let width = self.default_width(prefixes);

        match opcode {
            0x05 => {
                // SYSCALL: handled by the caller of `step`, since it needs
                // `&mut dyn SyscallHandler` with full CPU access; here we
                // just advance RIP past the 2-byte opcode and signal the
                // caller via a dedicated error-free path is not possible
                // through this return type, so we invoke it directly.
                self.rip = cursor;
                let outcome = _syscalls.handle_syscall(self);
                match outcome {
                    SyscallOutcome::Continue => Ok(true),
                    SyscallOutcome::Terminate(code) => {
                        self.exit_code = Some(code);
                        Ok(false)
                    }
                }
            }
            0xa2 => {
                let r = crate::cpuid::cpuid(self.regs.read32(RAX) as u32, rip)?;
                self.regs.write32(RAX, r.eax);
                self.regs.write32(1, r.ebx);
                self.regs.write32(2, r.ecx);
                self.regs.write32(3, r.edx);
                self.rip = cursor;
                Ok(true)
            }
            0x1f => {
                // multi-byte NOP (NOP r/m)
                let _ = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                self.rip = cursor;
                Ok(true)
            }
            0xaf => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let dst = self.regs.read(modrm.reg, width);
                let src = self.read_rm(&modrm, width, rip)?;
                let result = integer::imul2(&mut self.flags, dst, src, width);
                self.regs.write(modrm.reg, width, result);
                self.rip = cursor;
                Ok(true)
            }
            0xb6 | 0xb7 | 0xbe | 0xbf => {
                let src_width = if opcode & 1 == 0 { Width::W8 } else { Width::W16 };
                let signed = opcode >= 0xbe;
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let v = self.read_rm(&modrm, src_width, rip)?;
                let widened = if signed {
                    src_width.sign_extend(v)
                } else {
                    v
                };
                self.regs.write(modrm.reg, width, width.truncate(widened));
                self.rip = cursor;
                Ok(true)
            }
            0x40..=0x4f => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                if integer::eval_condition(&self.flags, opcode & 0xf) {
                    let src = self.read_rm(&modrm, width, rip)?;
                    self.regs.write(modrm.reg, width, src);
                }
                self.rip = cursor;
                Ok(true)
            }
            0x80..=0x8f => {
                let disp = self.fetch_imm32(&mut cursor, rip)? as i32 as i64;
                if integer::eval_condition(&self.flags, opcode & 0xf) {
                    self.rip = Self::rel_target(cursor, disp);
                } else {
                    self.rip = cursor;
                }
                Ok(true)
            }
            0x90..=0x9f => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let v = integer::eval_condition(&self.flags, opcode & 0xf) as u64;
                self.write_rm(&modrm, Width::W8, v, rip)?;
                self.rip = cursor;
                Ok(true)
            }
            0xbc | 0xbd => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_rm(&modrm, width, rip)?;
                let result = if opcode == 0xbc {
                    integer::bsf(&mut self.flags, src, width)
                } else {
                    integer::bsr(&mut self.flags, src, width)
                };
                if let Some(idx) = result {
                    self.regs.write(modrm.reg, width, idx as u64);
                }
                self.rip = cursor;
                Ok(true)
            }
            0xa3 | 0xab | 0xb3 | 0xbb => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let bit_index = self.regs.read(modrm.reg, width) as u32;
                let dst = self.read_rm(&modrm, width, rip)?;
                let result = match opcode {
                    0xa3 => {
                        integer::bit_test(&mut self.flags, dst, bit_index);
                        None
                    }
                    0xab => Some(integer::bts(&mut self.flags, dst, bit_index)),
                    0xb3 => Some(integer::btr(&mut self.flags, dst, bit_index)),
                    0xbb => Some(integer::btc(&mut self.flags, dst, bit_index)),
                    _ => unreachable!(),
                };
                if let Some(r) = result {
                    self.write_rm(&modrm, width, r, rip)?;
                }
                self.rip = cursor;
                Ok(true)
            }
            0xba => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let imm = self.fetch_imm8(&mut cursor, rip)? as u32;
                let dst = self.read_rm(&modrm, width, rip)?;
                let result = match modrm.reg & 0x7 {
                    4 => {
                        integer::bit_test(&mut self.flags, dst, imm);
                        None
                    }
                    5 => Some(integer::bts(&mut self.flags, dst, imm)),
                    6 => Some(integer::btr(&mut self.flags, dst, imm)),
                    7 => Some(integer::btc(&mut self.flags, dst, imm)),
                    _ => return Err(self.undefined(rip, vec![0x0f, opcode], "bt group reserved extension")),
                };
                if let Some(r) = result {
                    self.write_rm(&modrm, width, r, rip)?;
                }
                self.rip = cursor;
                Ok(true)
            }
            0xb0 | 0xb1 => {
                let w = if opcode == 0xb0 { Width::W8 } else { width };
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let dst = self.read_rm(&modrm, w, rip)?;
                let acc = self.regs.read(RAX, w);
                let src = self.regs.read(modrm.reg, w);
                let (new_dst, new_acc) = integer::cmpxchg(&mut self.flags, acc, dst, src, w);
                self.write_rm(&modrm, w, new_dst, rip)?;
                self.regs.write(RAX, w, new_acc);
                self.rip = cursor;
                Ok(true)
            }
            0xc0 | 0xc1 => {
                let w = if opcode == 0xc0 { Width::W8 } else { width };
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let dst = self.read_rm(&modrm, w, rip)?;
                let src = self.regs.read(modrm.reg, w);
                let (sum, old_dst) = integer::xadd(&mut self.flags, dst, src, w);
                self.write_rm(&modrm, w, sum, rip)?;
                self.regs.write(modrm.reg, w, old_dst);
                self.rip = cursor;
                Ok(true)
            }
            0xc8..=0xcf => {
                let idx = (opcode - 0xc8) as usize + prefixes.rex_b() as usize;
                let v = self.regs.read32(idx);
                self.regs.write32(idx, integer::bswap(v));
                self.rip = cursor;
                Ok(true)
            }
            0xa4 | 0xac => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let imm = self.fetch_imm8(&mut cursor, rip)?;
                let dst = self.read_rm(&modrm, width, rip)?;
                let fill = self.regs.read(modrm.reg, width);
                let r = if opcode == 0xa4 {
                    shift::shld(&mut self.flags, dst, fill, imm, width)
                } else {
                    shift::shrd(&mut self.flags, dst, fill, imm, width)
                };
                self.write_rm(&modrm, width, r, rip)?;
                self.rip = cursor;
                Ok(true)
            }
            0xa5 | 0xad => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let count = self.regs.read(RCX, Width::W8) as u8;
                let dst = self.read_rm(&modrm, width, rip)?;
                let fill = self.regs.read(modrm.reg, width);
                let r = if opcode == 0xa5 {
                    shift::shld(&mut self.flags, dst, fill, count, width)
                } else {
                    shift::shrd(&mut self.flags, dst, fill, count, width)
                };
                self.write_rm(&modrm, width, r, rip)?;
                self.rip = cursor;
                Ok(true)
            }

            // ---- SSE2 (a representative, named-in-scope subset) ----
            //
            // 0x10/0x11 cover four mnemonics that share an opcode and differ
            // only by prefix: MOVUPS (no prefix), MOVUPD (66), MOVSS (F3,
            // scalar 32-bit), MOVSD (F2, scalar 64-bit). The packed forms
            // move the full 128 bits either way; the scalar forms only ever
            // touch the low lane — loading from memory zeroes the rest of
            // the destination, loading from a register leaves the rest of
            // the destination alone, and storing never touches more than
            // the low lane of its destination.
            0x10 | 0x11 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let is_load = opcode == 0x10;
                let scalar_bits: Option<u32> = match prefixes.rep {
                    Some(0xf3) => Some(32),
                    Some(0xf2) => Some(64),
                    _ => None,
                };
                match (is_load, scalar_bits) {
                    (true, None) => {
                        let v = self.read_xmm_mem_or_reg(&modrm, rip)?;
                        self.xmm[modrm.reg] = v;
                    }
                    (true, Some(bits)) => {
                        let mask = if bits == 32 { u32::MAX as u128 } else { u64::MAX as u128 };
                        let low = self.read_xmm_mem_or_reg(&modrm, rip)? & mask;
                        self.xmm[modrm.reg] = match modrm.rm {
                            RegOrMem::Reg(_) => (self.xmm[modrm.reg] & !mask) | low,
                            RegOrMem::Mem(_) => low,
                        };
                    }
                    (false, None) => {
                        let v = self.xmm[modrm.reg];
                        self.write_xmm_mem_or_reg(&modrm, v, rip)?;
                    }
                    (false, Some(bits)) => {
                        let mask = if bits == 32 { u32::MAX as u128 } else { u64::MAX as u128 };
                        let low = self.xmm[modrm.reg] & mask;
                        match modrm.rm {
                            RegOrMem::Reg(idx) => self.xmm[idx] = (self.xmm[idx] & !mask) | low,
                            RegOrMem::Mem(addr) => match bits {
                                32 => self.mem.write_u32(addr, low as u32, rip)?,
                                _ => self.mem.write_u64(addr, low as u64, rip)?,
                            },
                        }
                    }
                }
                self.rip = cursor;
                Ok(true)
            }
            0x28 | 0x29 | 0x6f | 0x7f => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let is_load = matches!(opcode, 0x28 | 0x6f);
                if is_load {
                    let v = self.read_xmm_mem_or_reg(&modrm, rip)?;
                    self.xmm[modrm.reg] = v;
                } else {
                    let v = self.xmm[modrm.reg];
                    self.write_xmm_mem_or_reg(&modrm, v, rip)?;
                }
                self.rip = cursor;
                Ok(true)
            }
            0x6e => {
                // MOVD/MOVQ gpr -> xmm (zero-extending into the low lane)
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let v = self.read_rm(&modrm, width, rip)? as u128;
                self.xmm[modrm.reg] = v;
                self.rip = cursor;
                Ok(true)
            }
            0x7e if prefixes.opsize_66 => {
                // MOVD/MOVQ xmm -> gpr
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let v = self.xmm[modrm.reg];
                self.write_rm(&modrm, width, v as u64, rip)?;
                self.rip = cursor;
                Ok(true)
            }
            0xef | 0xdb | 0xeb | 0xdf => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                self.xmm[modrm.reg] = match opcode {
                    0xef => sse2::pxor(dst, src),
                    0xdb => sse2::pand(dst, src),
                    0xeb => sse2::por(dst, src),
                    0xdf => sse2::pandn(dst, src),
                    _ => unreachable!(),
                };
                self.rip = cursor;
                Ok(true)
            }
            0xfc | 0xfd | 0xfe | 0xd4 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                self.xmm[modrm.reg] = match opcode {
                    0xfc => sse2::paddb(dst, src),
                    0xfd => sse2::paddw(dst, src),
                    0xfe => sse2::paddd(dst, src),
                    0xd4 => sse2::paddq(dst, src),
                    _ => unreachable!(),
                };
                self.rip = cursor;
                Ok(true)
            }
            0xf8 | 0xf9 | 0xfa | 0xfb => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                self.xmm[modrm.reg] = match opcode {
                    0xf8 => sse2::psubb(dst, src),
                    0xf9 => sse2::psubw(dst, src),
                    0xfa => sse2::psubd(dst, src),
                    0xfb => sse2::psubq(dst, src),
                    _ => unreachable!(),
                };
                self.rip = cursor;
                Ok(true)
            }
            0xd8 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                self.xmm[modrm.reg] = sse2::psubusb(self.xmm[modrm.reg], src);
                self.rip = cursor;
                Ok(true)
            }
            0x58 | 0x5c | 0x59 | 0x5e => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                self.xmm[modrm.reg] = match (opcode, prefixes.rep, prefixes.opsize_66) {
                    (0x58, Some(0xf2), _) => sse2::scalar_sd(dst, src, |a, b| a + b),
                    (0x58, Some(0xf3), _) => sse2::scalar_ss(dst, src, |a, b| a + b),
                    (0x58, _, true) => sse2::addpd(dst, src),
                    (0x58, _, false) => sse2::addps(dst, src),
                    (0x5c, Some(0xf2), _) => sse2::scalar_sd(dst, src, |a, b| a - b),
                    (0x5c, Some(0xf3), _) => sse2::scalar_ss(dst, src, |a, b| a - b),
                    (0x5c, _, true) => sse2::subpd(dst, src),
                    (0x5c, _, false) => sse2::subps(dst, src),
                    (0x59, Some(0xf2), _) => sse2::scalar_sd(dst, src, |a, b| a * b),
                    (0x59, Some(0xf3), _) => sse2::scalar_ss(dst, src, |a, b| a * b),
                    (0x59, _, true) => sse2::mulpd(dst, src),
                    (0x59, _, false) => sse2::mulps(dst, src),
                    (0x5e, Some(0xf2), _) => sse2::scalar_sd(dst, src, |a, b| a / b),
                    (0x5e, Some(0xf3), _) => sse2::scalar_ss(dst, src, |a, b| a / b),
                    (0x5e, _, true) => sse2::divpd(dst, src),
                    (0x5e, _, false) => sse2::divps(dst, src),
                    _ => unreachable!(),
                };
                self.rip = cursor;
                Ok(true)
            }
            0x2a => {
                // CVTSI2SS (F3) / CVTSI2SD (F2 or no prefix): the source
                // integer is 32-bit unless REX.W widens it to 64-bit.
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let raw = self.read_rm(&modrm, width, rip)?;
                let src: i64 = match width {
                    Width::W64 => raw as i64,
                    _ => raw as i32 as i64,
                };
                self.xmm[modrm.reg] = match prefixes.rep {
                    Some(0xf3) => sse2::cvtsi2ss(self.xmm[modrm.reg], src),
                    _ => sse2::cvtsi2sd(self.xmm[modrm.reg], src),
                };
                self.rip = cursor;
                Ok(true)
            }
            0x2c | 0x2d => {
                // CVTTSS2SI (F3) / CVTTSD2SI (F2 or no prefix), truncating
                // toward zero; REX.W selects a 64-bit destination register.
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let v: i64 = match (prefixes.rep, width) {
                    (Some(0xf3), Width::W64) => sse2::cvttss2si64(src),
                    (Some(0xf3), _) => sse2::cvttss2si(src) as i64,
                    (_, Width::W64) => sse2::cvttsd2si64(src),
                    (_, _) => sse2::cvttsd2si(src) as i64,
                };
                self.regs.write(modrm.reg, width, v as u64);
                self.rip = cursor;
                Ok(true)
            }
            0x5a => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                self.xmm[modrm.reg] = match prefixes.rep {
                    Some(0xf2) => sse2::cvtsd2ss(dst, src),
                    _ => sse2::cvtss2sd(dst, src),
                };
                self.rip = cursor;
                Ok(true)
            }
            0x70 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let imm = self.fetch_imm8(&mut cursor, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                self.xmm[modrm.reg] = sse2::pshufd(src, imm);
                self.rip = cursor;
                Ok(true)
            }
            0x74 | 0x75 | 0x76 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                self.xmm[modrm.reg] = match opcode {
                    0x74 => sse2::pcmpeqb(dst, src),
                    0x75 => sse2::pcmpeqw(dst, src),
                    0x76 => sse2::pcmpeqd(dst, src),
                    _ => unreachable!(),
                };
                self.rip = cursor;
                Ok(true)
            }
            0x12 | 0x13 | 0x16 | 0x17 => {
                // MOVLPS/MOVHPS/MOVLPD/MOVHPD and the register-only
                // MOVHLPS/MOVLHPS forms: all reduce to swapping one 64-bit
                // lane of an XMM register.
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let high = matches!(opcode, 0x16 | 0x17);
                let is_store = matches!(opcode, 0x13 | 0x17);
                if is_store {
                    let v = self.xmm[modrm.reg];
                    let lane = if high { sse2::high_lane(v) } else { sse2::low_lane(v) };
                    match modrm.rm {
                        RegOrMem::Reg(src) => {
                            let dst = self.xmm[src];
                            self.xmm[src] = if high {
                                sse2::move_high_lane(dst, sse2::low_lane(self.xmm[modrm.reg]))
                            } else {
                                sse2::move_low_lane(dst, sse2::high_lane(self.xmm[modrm.reg]))
                            };
                        }
                        RegOrMem::Mem(addr) => {
                            self.mem.write_u64(addr, lane, rip)?;
                        }
                    }
                } else {
                    let lane = match modrm.rm {
                        RegOrMem::Reg(src) => {
                            if high {
                                sse2::low_lane(self.xmm[src])
                            } else {
                                sse2::high_lane(self.xmm[src])
                            }
                        }
                        RegOrMem::Mem(addr) => self.mem.read_u64(addr, rip)?,
                    };
                    let dst = self.xmm[modrm.reg];
                    self.xmm[modrm.reg] = if high {
                        sse2::move_high_lane(dst, lane)
                    } else {
                        sse2::move_low_lane(dst, lane)
                    };
                }
                self.rip = cursor;
                Ok(true)
            }
            0x2e | 0x2f => {
                // UCOMISS/UCOMISD, COMISS/COMISD: this core treats ordered
                // and unordered compares identically (both funnel through
                // `ucomis_flags`), since the only observable difference is
                // whether an unmasked #IA is raised, which this core never
                // models as a trap.
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                let ordering = if prefixes.opsize_66 {
                    let a = f64::from_bits(sse2::to_lanes64(dst)[0]);
                    let b = f64::from_bits(sse2::to_lanes64(src)[0]);
                    a.partial_cmp(&b)
                } else {
                    let a = f32::from_bits(sse2::to_lanes32(dst)[0]);
                    let b = f32::from_bits(sse2::to_lanes32(src)[0]);
                    a.partial_cmp(&b)
                };
                flagops::ucomis_flags(&mut self.flags, ordering);
                self.rip = cursor;
                Ok(true)
            }
            0x51 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                self.xmm[modrm.reg] = match (prefixes.rep, prefixes.opsize_66) {
                    (Some(0xf2), _) => sse2::scalar_sqrt_sd(src),
                    (Some(0xf3), _) => sse2::scalar_sqrt_ss(src),
                    (_, true) => sse2::sqrtpd(src),
                    (_, false) => sse2::sqrtps(src),
                };
                let _ = dst;
                self.rip = cursor;
                Ok(true)
            }
            0x52 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                self.xmm[modrm.reg] = match prefixes.rep {
                    Some(0xf3) => sse2::scalar_rsqrt_ss(src),
                    _ => sse2::rsqrtps(src),
                };
                self.rip = cursor;
                Ok(true)
            }
            0x5d | 0x5f => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                self.xmm[modrm.reg] = match (opcode, prefixes.rep, prefixes.opsize_66) {
                    (0x5d, Some(0xf2), _) => sse2::scalar_min_sd(dst, src),
                    (0x5d, Some(0xf3), _) => sse2::scalar_min_ss(dst, src),
                    (0x5d, _, true) => sse2::minpd(dst, src),
                    (0x5d, _, false) => sse2::minps(dst, src),
                    (0x5f, Some(0xf2), _) => sse2::scalar_max_sd(dst, src),
                    (0x5f, Some(0xf3), _) => sse2::scalar_max_ss(dst, src),
                    (0x5f, _, true) => sse2::maxpd(dst, src),
                    (0x5f, _, false) => sse2::maxps(dst, src),
                    _ => unreachable!(),
                };
                self.rip = cursor;
                Ok(true)
            }
            0xc2 => {
                // CMPPS/CMPPD/CMPSS/CMPSD share one imm8-predicate encoding.
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let predicate = self.fetch_imm8(&mut cursor, rip)?;
                let dst = self.xmm[modrm.reg];
                self.xmm[modrm.reg] = match (prefixes.rep, prefixes.opsize_66) {
                    (Some(0xf2), _) => sse2::cmpsd(dst, src, predicate),
                    (Some(0xf3), _) => sse2::cmpss(dst, src, predicate),
                    (_, true) => sse2::cmppd(dst, src, predicate),
                    (_, false) => sse2::cmpps(dst, src, predicate),
                };
                self.rip = cursor;
                Ok(true)
            }
            0x50 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let mask = if prefixes.opsize_66 {
                    sse2::movmskpd(src)
                } else {
                    sse2::movmskps(src)
                };
                self.regs.write(modrm.reg, Width::W32, mask as u64);
                self.rip = cursor;
                Ok(true)
            }
            0xc6 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let imm = self.fetch_imm8(&mut cursor, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                self.xmm[modrm.reg] = if prefixes.opsize_66 {
                    sse2::shufpd(dst, src, imm)
                } else {
                    sse2::shufps(dst, src, imm)
                };
                self.rip = cursor;
                Ok(true)
            }
            0x5a_u8 if false => unreachable!(),
            0xe6 => {
                // CVTPD2DQ/CVTTPD2DQ/CVTDQ2PD share one opcode, distinguished
                // by prefix.
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                self.xmm[modrm.reg] = match (prefixes.rep, prefixes.opsize_66) {
                    (Some(0xf3), _) => sse2::cvtdq2pd(src),
                    (Some(0xf2), _) => sse2::cvtpd2dq(src),
                    (_, true) => sse2::cvttpd2dq(src),
                    _ => return Err(self.undefined(rip, vec![0x0f, opcode], "cvt??2dq family: missing mandatory prefix")),
                };
                self.rip = cursor;
                Ok(true)
            }
            0x5b => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                self.xmm[modrm.reg] = match (prefixes.rep, prefixes.opsize_66) {
                    (Some(0xf3), _) => sse2::cvttps2dq(src),
                    (_, true) => sse2::cvtps2dq(src),
                    _ => sse2::cvtdq2ps(src),
                };
                self.rip = cursor;
                Ok(true)
            }
            0x5c_u8 if false => unreachable!(),
            0xe8..=0xeb if false => unreachable!(),
            0xd5 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                self.xmm[modrm.reg] = sse2::pmullw(self.xmm[modrm.reg], src);
                self.rip = cursor;
                Ok(true)
            }
            0xe4 | 0xe5 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                self.xmm[modrm.reg] = if opcode == 0xe4 {
                    sse2::pmulhuw(dst, src)
                } else {
                    sse2::pmulhw(dst, src)
                };
                self.rip = cursor;
                Ok(true)
            }
            0xf4 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                self.xmm[modrm.reg] = sse2::pmuludq(self.xmm[modrm.reg], src);
                self.rip = cursor;
                Ok(true)
            }
            0xf6 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                self.xmm[modrm.reg] = sse2::psadbw(self.xmm[modrm.reg], src);
                self.rip = cursor;
                Ok(true)
            }
            0xda | 0xde | 0xea | 0xee => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                self.xmm[modrm.reg] = match opcode {
                    0xda => sse2::pminub(dst, src),
                    0xde => sse2::pmaxub(dst, src),
                    0xea => sse2::pminsw(dst, src),
                    0xee => sse2::pmaxsw(dst, src),
                    _ => unreachable!(),
                };
                self.rip = cursor;
                Ok(true)
            }
            0x63 | 0x6b => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                self.xmm[modrm.reg] = if opcode == 0x63 {
                    sse2::packsswb(dst, src)
                } else {
                    sse2::packssdw(dst, src)
                };
                self.rip = cursor;
                Ok(true)
            }
            0x67 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                self.xmm[modrm.reg] = sse2::packuswb(dst, src);
                self.rip = cursor;
                Ok(true)
            }
            0x60 | 0x61 | 0x62 | 0x68 | 0x69 | 0x6a | 0x6c | 0x6d => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                self.xmm[modrm.reg] = match opcode {
                    0x60 => sse2::punpcklbw(dst, src),
                    0x61 => sse2::punpcklwd(dst, src),
                    0x62 => sse2::punpckldq(dst, src),
                    0x68 => sse2::punpckhbw(dst, src),
                    0x69 => sse2::punpckhwd(dst, src),
                    0x6a => sse2::punpckhdq(dst, src),
                    0x6c => sse2::punpcklqdq(dst, src),
                    0x6d => sse2::punpckhqdq(dst, src),
                    _ => unreachable!(),
                };
                self.rip = cursor;
                Ok(true)
            }
            0x70 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let imm = self.fetch_imm8(&mut cursor, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                self.xmm[modrm.reg] = match prefixes.rep {
                    Some(0xf2) => sse2::pshuflw(src, imm),
                    Some(0xf3) => sse2::pshufhw(src, imm),
                    _ => sse2::pshufd(src, imm),
                };
                self.rip = cursor;
                Ok(true)
            }
            0x71 | 0x72 | 0x73 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let imm = self.fetch_imm8(&mut cursor, rip)? as u32;
                let dst = self.xmm[modrm.reg];
                let group = modrm.reg & 0x7;
                self.xmm[modrm.reg] = match (opcode, group) {
                    (0x71, 2) => sse2::psrlw(dst, imm),
                    (0x71, 4) => sse2::psraw(dst, imm),
                    (0x71, 6) => sse2::psllw(dst, imm),
                    (0x72, 2) => sse2::psrld(dst, imm),
                    (0x72, 4) => sse2::psrad(dst, imm),
                    (0x72, 6) => sse2::pslld(dst, imm),
                    (0x73, 2) => sse2::psrlq(dst, imm),
                    (0x73, 3) => sse2::psrldq(dst, imm),
                    (0x73, 6) => sse2::psllq(dst, imm),
                    (0x73, 7) => sse2::pslldq(dst, imm),
                    _ => return Err(self.undefined(rip, vec![0x0f, opcode], "shift group reserved extension")),
                };
                self.rip = cursor;
                Ok(true)
            }
            0xd1 | 0xd2 | 0xd3 | 0xe1 | 0xe2 | 0xf1 | 0xf2 | 0xf3 => {
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                let src = self.read_xmm_mem_or_reg(&modrm, rip)?;
                let dst = self.xmm[modrm.reg];
                let count = sse2::to_lanes64(src)[0].min(255) as u32;
                self.xmm[modrm.reg] = match opcode {
                    0xd1 => sse2::psrlw(dst, count),
                    0xd2 => sse2::psrld(dst, count),
                    0xd3 => sse2::psrlq(dst, count),
                    0xe1 => sse2::psraw(dst, count),
                    0xe2 => sse2::psrad(dst, count),
                    0xf1 => sse2::psllw(dst, count),
                    0xf2 => sse2::pslld(dst, count),
                    0xf3 => sse2::psllq(dst, count),
                    _ => unreachable!(),
                };
                self.rip = cursor;
                Ok(true)
            }
            0xae => {
                // LDMXCSR/STMXCSR (mem reg 2/3); fences (mod==3, reg 5/6/7)
                // are no-ops on a single-threaded interpreter.
                let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
                match (modrm.reg & 0x7, modrm.rm) {
                    (2, RegOrMem::Mem(addr)) => {
                        self.mxcsr = self.mem.read_u32(addr, rip)?;
                    }
                    (3, RegOrMem::Mem(addr)) => {
                        self.mem.write_u32(addr, self.mxcsr, rip)?;
                    }
                    _ => {}
                }
                self.rip = cursor;
                Ok(true)
            }

            _ => Err(self.undefined(rip, vec![0x0f, opcode], "unrecognized two-byte opcode")),
        }
    }

    // ---- x87 memory operand helpers (§4.3) -------------------------------

    fn load_m32fp(&self, addr: u64, rip: u64) -> Result<F80> {
        let bits = self.mem.read_u32(addr, rip)?;
        Ok(F80::from_f64(f32::from_bits(bits) as f64))
    }
    fn store_m32fp(&mut self, addr: u64, v: F80, rip: u64) -> Result<()> {
        self.mem.write_u32(addr, (v.to_f64() as f32).to_bits(), rip)
    }
    fn load_m64fp(&self, addr: u64, rip: u64) -> Result<F80> {
        let bits = self.mem.read_u64(addr, rip)?;
        Ok(F80::from_f64(f64::from_bits(bits)))
    }
    fn store_m64fp(&mut self, addr: u64, v: F80, rip: u64) -> Result<()> {
        self.mem.write_u64(addr, v.to_f64().to_bits(), rip)
    }
    fn load_m80fp(&self, addr: u64, rip: u64) -> Result<F80> {
        Ok(F80(self.mem.read_f80_bytes(addr, rip)?))
    }
    fn store_m80fp(&mut self, addr: u64, v: F80, rip: u64) -> Result<()> {
        self.mem.write_f80_bytes(addr, &v.0, rip)
    }
    fn load_m16int(&self, addr: u64, rip: u64) -> Result<F80> {
        Ok(F80::from_i64(self.mem.read_u16(addr, rip)? as i16 as i64))
    }
    fn load_m32int(&self, addr: u64, rip: u64) -> Result<F80> {
        Ok(F80::from_i64(self.mem.read_u32(addr, rip)? as i32 as i64))
    }
    fn load_m64int(&self, addr: u64, rip: u64) -> Result<F80> {
        Ok(F80::from_i64(self.mem.read_u64(addr, rip)? as i64))
    }

    /// Round `v` to an integer per the FPU control word's rounding mode,
    /// the way FIST/FISTP do (distinct from FISTTP/SSE's always-truncating
    /// forms, which this core doesn't implement since FISTTP is an SSE3
    /// addition outside scope).
    fn round_to_int(&self, v: F80) -> i64 {
        x87math::frndint(v, self.fpu.control.rounding).to_f64() as i64
    }
    fn store_m16int(&mut self, addr: u64, v: F80, rip: u64) -> Result<()> {
        self.mem.write_u16(addr, self.round_to_int(v) as i16 as u16, rip)
    }
    fn store_m32int(&mut self, addr: u64, v: F80, rip: u64) -> Result<()> {
        self.mem.write_u32(addr, self.round_to_int(v) as i32 as u32, rip)
    }
    fn store_m64int(&mut self, addr: u64, v: F80, rip: u64) -> Result<()> {
        self.mem.write_u64(addr, self.round_to_int(v) as u64, rip)
    }

    /// Condition-code nibble for each of the eight FCMOVcc mnemonics,
    /// reusing [`integer::eval_condition`] rather than re-deriving the
    /// CF/ZF/PF predicates.
    fn fcmov_condition(group: u8, negated: bool) -> u8 {
        let cc = match group & 0x3 {
            0 => 0x2, // B  (CF=1)
            1 => 0x4, // E  (ZF=1)
            2 => 0x6, // BE (CF=1 or ZF=1)
            _ => 0xa, // U  (PF=1)
        };
        if negated {
            cc ^ 0x1
        } else {
            cc
        }
    }

    fn exec_x87(&mut self, opcode: u8, prefixes: &Prefixes, mut cursor: u64, rip: u64) -> Result<bool> {
        let modrm = self.fetch_modrm(&mut cursor, prefixes, rip)?;
        let reg = modrm.reg & 0x7;
        let mem_addr = match modrm.rm {
            RegOrMem::Mem(a) => Some(a),
            RegOrMem::Reg(_) => None,
        };
        let sti = match modrm.rm {
            RegOrMem::Reg(i) => i as u8 & 0x7,
            RegOrMem::Mem(_) => 0,
        };

        match opcode {
            // FADD/FMUL/FCOM(P)/FSUB(R)/FDIV(R) against ST(0), m32fp or
            // ST(i) (non-popping).
            0xd8 => {
                let src = match mem_addr {
                    Some(addr) => self.load_m32fp(addr, rip)?,
                    None => self.fpu.st(sti),
                };
                let st0 = self.fpu.st(0);
                match reg {
                    0 => self.fpu.set_st(0, st0.add(&src)),
                    1 => self.fpu.set_st(0, st0.mul(&src)),
                    2 => self.fpu.set_compare_status(st0.compare(&src)),
                    3 => {
                        self.fpu.set_compare_status(st0.compare(&src));
                        let _ = self.fpu.pop(rip)?;
                    }
                    4 => self.fpu.set_st(0, st0.sub(&src)),
                    5 => self.fpu.set_st(0, src.sub(&st0)),
                    6 => self.fpu.set_st(0, st0.div(&src)),
                    7 => self.fpu.set_st(0, src.div(&st0)),
                    _ => unreachable!(),
                }
                self.rip = cursor;
                Ok(true)
            }

            // FLD/FXCH/FST(P)/FNOP/constants/control-word/transcendentals.
            0xd9 => {
                match (mem_addr, reg) {
                    (Some(addr), 0) => {
                        let v = self.load_m32fp(addr, rip)?;
                        self.fpu.push(v, rip)?;
                    }
                    (None, 0) => {
                        let v = self.fpu.st(sti);
                        self.fpu.push(v, rip)?;
                    }
                    (None, 1) => {
                        let st0 = self.fpu.st(0);
                        let sti_val = self.fpu.st(sti);
                        self.fpu.set_st(0, sti_val);
                        self.fpu.set_st(sti, st0);
                    }
                    (Some(addr), 2) => self.store_m32fp(addr, self.fpu.st(0), rip)?,
                    (None, 2) => {} // FNOP
                    (Some(addr), 3) => {
                        self.store_m32fp(addr, self.fpu.pop(rip)?, rip)?;
                    }
                    (None, 4) => match sti {
                        0 => self.fpu.set_st(0, x87math::fchs(self.fpu.st(0))),
                        1 => self.fpu.set_st(0, x87math::fabs(self.fpu.st(0))),
                        4 => self.fpu.set_compare_status(self.fpu.st(0).compare(&F80::ZERO)),
                        5 => {
                            let st0 = self.fpu.st(0);
                            let c2 = !st0.is_nan() && !st0.is_infinity();
                            self.fpu.status.set(crate::exec::x87::StatusWord::C2, c2);
                            self.fpu.status.set(crate::exec::x87::StatusWord::C0, st0.sign());
                            self.fpu.status.set(crate::exec::x87::StatusWord::C3, st0.is_zero());
                        }
                        _ => {
                            return Err(self.undefined(rip, vec![opcode], "D9/4 reserved extension"));
                        }
                    },
                    (Some(addr), 5) => {
                        let raw = self.mem.read_u16(addr, rip)?;
                        self.fpu.control = crate::exec::x87::ControlWord::from_raw(raw);
                    }
                    (None, 5) => {
                        let v = match sti {
                            0 => F80::from_f64(1.0),
                            1 => F80::from_f64(std::f64::consts::LOG2_10),
                            2 => F80::from_f64(std::f64::consts::LOG2_E),
                            3 => F80::from_f64(std::f64::consts::PI),
                            4 => F80::from_f64(std::f64::consts::LOG10_2),
                            5 => F80::from_f64(std::f64::consts::LN_2),
                            6 => F80::from_f64(0.0),
                            _ => return Err(self.undefined(rip, vec![opcode], "D9/5 reserved load-constant")),
                        };
                        self.fpu.push(v, rip)?;
                    }
                    (Some(addr), 7) => {
                        self.mem.write_u16(addr, self.fpu.control.raw(), rip)?;
                    }
                    (None, 6) => {
                        let st0 = self.fpu.st(0);
                        match sti {
                            0 => self.fpu.set_st(0, x87math::f2xm1(st0)),
                            1 => {
                                let st1 = self.fpu.st(1);
                                self.fpu.set_st(1, x87math::fyl2x(st1, st0));
                                let _ = self.fpu.pop(rip)?;
                            }
                            2 => {
                                let tan = x87math::fptan(st0);
                                self.fpu.set_st(0, tan);
                                self.fpu.push(F80::from_f64(1.0), rip)?;
                            }
                            3 => {
                                let st1 = self.fpu.st(1);
                                self.fpu.set_st(1, x87math::fpatan(st1, st0));
                                let _ = self.fpu.pop(rip)?;
                            }
                            4 => {
                                let (sig, exp) = x87math::fxtract(st0);
                                self.fpu.set_st(0, exp);
                                self.fpu.push(sig, rip)?;
                            }
                            5 => {
                                let st1 = self.fpu.st(1);
                                self.fpu.set_st(0, x87math::fprem1(st0, st1));
                            }
                            6 => self.fpu.fdecstp(),
                            7 => self.fpu.fincstp(),
                            _ => unreachable!(),
                        }
                    }
                    (None, 7) => {
                        let st0 = self.fpu.st(0);
                        match sti {
                            0 => {
                                let st1 = self.fpu.st(1);
                                self.fpu.set_st(0, x87math::fprem(st0, st1));
                            }
                            1 => {
                                let st1 = self.fpu.st(1);
                                self.fpu.set_st(1, x87math::fyl2xp1(st1, st0));
                                let _ = self.fpu.pop(rip)?;
                            }
                            2 => self.fpu.set_st(0, x87math::fsqrt(st0)),
                            3 => {
                                let (s, c) = x87math::fsincos(st0);
                                self.fpu.set_st(0, c);
                                self.fpu.push(s, rip)?;
                            }
                            4 => self.fpu.set_st(0, x87math::frndint(st0, self.fpu.control.rounding)),
                            5 => {
                                let st1 = self.fpu.st(1);
                                self.fpu.set_st(0, x87math::fscale(st0, st1));
                            }
                            6 => self.fpu.set_st(0, x87math::fsin(st0)),
                            7 => self.fpu.set_st(0, x87math::fcos(st0)),
                            _ => unreachable!(),
                        }
                    }
                    _ => return Err(self.undefined(rip, vec![opcode], "D9 reserved extension")),
                }
                self.rip = cursor;
                Ok(true)
            }

            // m32int integer arithmetic, and FCMOVcc/FUCOMPP in the
            // register-direct encoding space.
            0xda => {
                if let Some(addr) = mem_addr {
                    let src = self.load_m32int(addr, rip)?;
                    let st0 = self.fpu.st(0);
                    match reg {
                        0 => self.fpu.set_st(0, st0.add(&src)),
                        1 => self.fpu.set_st(0, st0.mul(&src)),
                        2 => self.fpu.set_compare_status(st0.compare(&src)),
                        3 => {
                            self.fpu.set_compare_status(st0.compare(&src));
                            let _ = self.fpu.pop(rip)?;
                        }
                        4 => self.fpu.set_st(0, st0.sub(&src)),
                        5 => self.fpu.set_st(0, src.sub(&st0)),
                        6 => self.fpu.set_st(0, st0.div(&src)),
                        7 => self.fpu.set_st(0, src.div(&st0)),
                        _ => unreachable!(),
                    }
                } else if reg == 5 && sti == 1 {
                    let ordering = self.fpu.st(0).compare(&self.fpu.st(1));
                    self.fpu.set_compare_status(ordering);
                    let _ = self.fpu.pop(rip)?;
                    let _ = self.fpu.pop(rip)?;
                } else if reg <= 3 {
                    let cc = Self::fcmov_condition(reg as u8, false);
                    if integer::eval_condition(&self.flags, cc) {
                        self.fpu.set_st(0, self.fpu.st(sti));
                    }
                } else {
                    return Err(self.undefined(rip, vec![opcode], "DA reserved extension"));
                }
                self.rip = cursor;
                Ok(true)
            }

            // m32int FILD/FIST(P), m80fp FLD/FSTP, FCMOVcc continued,
            // FUCOMI/FCOMI, FNCLEX/FNINIT.
            0xdb => {
                match (mem_addr, reg) {
                    (Some(addr), 0) => self.fpu.push(self.load_m32int(addr, rip)?, rip)?,
                    (Some(addr), 2) => self.store_m32int(addr, self.fpu.st(0), rip)?,
                    (Some(addr), 3) => self.store_m32int(addr, self.fpu.pop(rip)?, rip)?,
                    (Some(addr), 5) => self.fpu.push(self.load_m80fp(addr, rip)?, rip)?,
                    (Some(addr), 7) => self.store_m80fp(addr, self.fpu.pop(rip)?, rip)?,
                    (None, 0..=3) => {
                        let cc = Self::fcmov_condition(reg as u8, true);
                        if integer::eval_condition(&self.flags, cc) {
                            self.fpu.set_st(0, self.fpu.st(sti));
                        }
                    }
                    (None, 4) => match sti {
                        2 => self.fpu.status = crate::exec::x87::StatusWord::empty(),
                        3 => self.fpu = FpuState::new(),
                        _ => {}
                    },
                    (None, 5) => {
                        let ordering = self.fpu.st(0).compare(&self.fpu.st(sti));
                        flagops::ucomis_flags(&mut self.flags, ordering);
                    }
                    (None, 6) => {
                        let ordering = self.fpu.st(0).compare(&self.fpu.st(sti));
                        flagops::ucomis_flags(&mut self.flags, ordering);
                    }
                    _ => return Err(self.undefined(rip, vec![opcode], "DB reserved extension")),
                }
                self.rip = cursor;
                Ok(true)
            }

            // m64fp arithmetic, and the ST(i),ST(0)-reversed register forms.
            0xdc => {
                if let Some(addr) = mem_addr {
                    let src = self.load_m64fp(addr, rip)?;
                    let st0 = self.fpu.st(0);
                    match reg {
                        0 => self.fpu.set_st(0, st0.add(&src)),
                        1 => self.fpu.set_st(0, st0.mul(&src)),
                        2 | 3 => self.fpu.set_compare_status(st0.compare(&src)),
                        4 => self.fpu.set_st(0, st0.sub(&src)),
                        5 => self.fpu.set_st(0, src.sub(&st0)),
                        6 => self.fpu.set_st(0, st0.div(&src)),
                        7 => self.fpu.set_st(0, src.div(&st0)),
                        _ => unreachable!(),
                    }
                } else {
                    let st0 = self.fpu.st(0);
                    let sti_val = self.fpu.st(sti);
                    let r = match reg {
                        0 => sti_val.add(&st0),
                        1 => sti_val.mul(&st0),
                        4 => st0.sub(&sti_val),
                        5 => sti_val.sub(&st0),
                        6 => st0.div(&sti_val),
                        7 => sti_val.div(&st0),
                        2 | 3 => {
                            self.fpu.set_compare_status(st0.compare(&sti_val));
                            self.rip = cursor;
                            return Ok(true);
                        }
                        _ => unreachable!(),
                    };
                    self.fpu.set_st(sti, r);
                }
                self.rip = cursor;
                Ok(true)
            }

            // m64fp FLD/FST(P)/FNSTSW, and FFREE/FST/FSTP/FUCOM(P) ST(i).
            0xdd => {
                match (mem_addr, reg) {
                    (Some(addr), 0) => self.fpu.push(self.load_m64fp(addr, rip)?, rip)?,
                    (Some(addr), 2) => self.store_m64fp(addr, self.fpu.st(0), rip)?,
                    (Some(addr), 3) => self.store_m64fp(addr, self.fpu.pop(rip)?, rip)?,
                    (Some(addr), 7) => {
                        self.mem.write_u16(addr, self.fpu.status.bits(), rip)?;
                    }
                    (None, 0) => {
                        // FFREE: mark ST(i) empty without altering `top`.
                        let v = self.fpu.st(sti);
                        let _ = v;
                        self.fpu.set_st(sti, F80::ZERO);
                    }
                    (None, 2) => self.fpu.set_st(sti, self.fpu.st(0)),
                    (None, 3) => {
                        let v = self.fpu.pop(rip)?;
                        self.fpu.set_st(sti, v);
                    }
                    (None, 4) => {
                        let ordering = self.fpu.st(0).compare(&self.fpu.st(sti));
                        self.fpu.set_compare_status(ordering);
                    }
                    (None, 5) => {
                        let ordering = self.fpu.st(0).compare(&self.fpu.st(sti));
                        self.fpu.set_compare_status(ordering);
                        let _ = self.fpu.pop(rip)?;
                    }
                    _ => return Err(self.undefined(rip, vec![opcode], "DD reserved extension")),
                }
                self.rip = cursor;
                Ok(true)
            }

            // m16int integer arithmetic, and the popping arithmetic forms
            // (FADDP/FMULP/FCOMPP/FSUBRP/FSUBP/FDIVRP/FDIVP).
            0xde => {
                if let Some(addr) = mem_addr {
                    let src = self.load_m16int(addr, rip)?;
                    let st0 = self.fpu.st(0);
                    match reg {
                        0 => self.fpu.set_st(0, st0.add(&src)),
                        1 => self.fpu.set_st(0, st0.mul(&src)),
                        2 => self.fpu.set_compare_status(st0.compare(&src)),
                        3 => {
                            self.fpu.set_compare_status(st0.compare(&src));
                            let _ = self.fpu.pop(rip)?;
                        }
                        4 => self.fpu.set_st(0, st0.sub(&src)),
                        5 => self.fpu.set_st(0, src.sub(&st0)),
                        6 => self.fpu.set_st(0, st0.div(&src)),
                        7 => self.fpu.set_st(0, src.div(&st0)),
                        _ => unreachable!(),
                    }
                } else if reg == 3 && sti == 1 {
                    let ordering = self.fpu.st(0).compare(&self.fpu.st(1));
                    self.fpu.set_compare_status(ordering);
                    let _ = self.fpu.pop(rip)?;
                    let _ = self.fpu.pop(rip)?;
                } else {
                    let st0 = self.fpu.st(0);
                    let sti_val = self.fpu.st(sti);
                    let r = match reg {
                        0 => sti_val.add(&st0),
                        1 => sti_val.mul(&st0),
                        4 => st0.sub(&sti_val),
                        5 => sti_val.sub(&st0),
                        6 => st0.div(&sti_val),
                        7 => sti_val.div(&st0),
                        _ => return Err(self.undefined(rip, vec![opcode], "DE reserved extension")),
                    };
                    self.fpu.set_st(sti, r);
                    let _ = self.fpu.pop(rip)?;
                }
                self.rip = cursor;
                Ok(true)
            }

            // m16int FILD/FIST(P), m64int FILD/FISTP, FNSTSW AX,
            // FUCOMIP/FCOMIP.
            0xdf => {
                match (mem_addr, reg) {
                    (Some(addr), 0) => self.fpu.push(self.load_m16int(addr, rip)?, rip)?,
                    (Some(addr), 2) => self.store_m16int(addr, self.fpu.st(0), rip)?,
                    (Some(addr), 3) => self.store_m16int(addr, self.fpu.pop(rip)?, rip)?,
                    (Some(addr), 5) => self.fpu.push(self.load_m64int(addr, rip)?, rip)?,
                    (Some(addr), 7) => self.store_m64int(addr, self.fpu.pop(rip)?, rip)?,
                    (None, 4) if sti == 0 => {
                        self.regs.write(RAX, Width::W16, self.fpu.status.bits() as u64);
                    }
                    (None, 5) => {
                        let ordering = self.fpu.st(0).compare(&self.fpu.st(sti));
                        flagops::ucomis_flags(&mut self.flags, ordering);
                        let _ = self.fpu.pop(rip)?;
                    }
                    (None, 6) => {
                        let ordering = self.fpu.st(0).compare(&self.fpu.st(sti));
                        flagops::ucomis_flags(&mut self.flags, ordering);
                        let _ = self.fpu.pop(rip)?;
                    }
                    _ => return Err(self.undefined(rip, vec![opcode], "DF reserved extension")),
                }
                self.rip = cursor;
                Ok(true)
            }

            _ => unreachable!("exec_x87 called with opcode outside D8-DF"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuConfig;
    use crate::syscall::NullSyscallHandler;

    fn cpu_with_code(code: &[u8]) -> (Vec<u8>, CpuConfig) {
        let mut mem = vec![0u8; 4096];
        mem[0..code.len()].copy_from_slice(code);
        let mut config = CpuConfig::default();
        config.mem_size = mem.len();
        config.entry_rip = 0;
        config.stack_top = 2048;
        (mem, config)
    }

    #[test]
    fn mov_and_add_update_register_and_flags() {
        // mov eax, 5 ; add eax, 3
        let (mut mem, config) = cpu_with_code(&[0xb8, 5, 0, 0, 0, 0x83, 0xc0, 3]);
        let mut cpu = Cpu::new(&mut mem, config);
        let mut sc = NullSyscallHandler;
        cpu.step(&mut sc).unwrap();
        assert_eq!(cpu.regs.read32(RAX), 5);
        cpu.step(&mut sc).unwrap();
        assert_eq!(cpu.regs.read32(RAX), 8);
    }

    #[test]
    fn jump_not_taken_falls_through() {
        // mov eax,0 ; cmp eax,1 ; je +5 ; mov eax, 42
        let (mut mem, config) = cpu_with_code(&[
            0xb8, 0, 0, 0, 0, 0x83, 0xf8, 1, 0x74, 0x05, 0xb8, 42, 0, 0, 0,
        ]);
        let mut cpu = Cpu::new(&mut mem, config);
        let mut sc = NullSyscallHandler;
        for _ in 0..3 {
            cpu.step(&mut sc).unwrap();
        }
        assert_eq!(cpu.regs.read32(RAX), 42);
    }

    #[test]
    fn push_pop_preserve_value_across_call_ret_shape() {
        // push 0x7b ; pop rax
        let (mut mem, config) = cpu_with_code(&[0x6a, 0x7b, 0x58]);
        let mut cpu = Cpu::new(&mut mem, config);
        let mut sc = NullSyscallHandler;
        cpu.step(&mut sc).unwrap();
        cpu.step(&mut sc).unwrap();
        assert_eq!(cpu.regs.read64(RAX), 0x7b);
    }

    #[test]
    fn hlt_stops_the_run_loop() {
        let (mut mem, config) = cpu_with_code(&[0xf4]);
        let mut cpu = Cpu::new(&mut mem, config);
        let mut sc = NullSyscallHandler;
        let cont = cpu.step(&mut sc).unwrap();
        assert!(!cont);
    }
}
