use crate::error::{VmError, VmResult};
use crate::memory::{AddressSpace, WordStore};

use super::decode::{AluOp, FpuOp, Insn, decode_insn};
use super::{A0, A1, A2, A3, INSN_LEN, RETURN_SENTINEL, Reg, is_stub};

/// Value left in registers a callee is allowed to clobber.
pub const POISON: u32 = 0xDEAD_C0DE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    /// `CALL8`/`CALLX8`: arguments in a10..a15, results in a10/a11.
    Windowed,
    /// `CALLX0`: arguments in a2..a7, results in a2/a3.
    Call0,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuExit {
    /// The entry function returned to the host.
    Returned,
    /// Code called a host routine stub. The program counter already points
    /// past the call; finish with [`Cpu::complete_host_call`].
    HostCall { target: u32, kind: CallKind },
}

/// Simulated windowed core. Memory is passed in per call so the host can
/// touch the address space while the core is parked on a host call.
pub struct Cpu {
    phys: Vec<u32>,
    window_base: usize,
    callinc: u32,
    pc: u32,
    sar: u32,
    fregs: [u32; 16],
    steps: u64,
    budget: Option<u64>,
    stack_limit: u32,
}

impl Cpu {
    pub fn new(stack_limit: u32, budget: Option<u64>) -> Self {
        Self {
            phys: vec![0; 64],
            window_base: 0,
            callinc: 0,
            pc: RETURN_SENTINEL,
            sar: 0,
            fregs: [0; 16],
            steps: 0,
            budget,
            stack_limit,
        }
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Register index of the current window, for tests and dumps.
    pub fn window_base(&self) -> usize {
        self.window_base
    }

    pub fn reg(&self, r: Reg) -> u32 {
        self.phys[self.window_base + r.index() as usize]
    }

    pub fn set_reg(&mut self, r: Reg, value: u32) {
        let index = self.window_base + r.index() as usize;
        self.phys[index] = value;
    }

    /// Starts `entry` as if the host had issued `CALL8` with `args` in
    /// a10.. and `sp` in a1.
    pub fn enter(&mut self, entry: u32, sp: u32, args: &[u32]) {
        self.window_base = 0;
        self.set_reg(A1, sp);
        self.set_reg(super::A8, (2 << 30) | (RETURN_SENTINEL & 0x3FFF_FFFF));
        for (i, value) in args.iter().take(6).enumerate() {
            if let Some(r) = Reg::from_index(10 + i as u8) {
                self.set_reg(r, *value);
            }
        }
        self.callinc = 2;
        self.pc = entry;
    }

    pub fn run(&mut self, mem: &mut AddressSpace) -> VmResult<CpuExit> {
        loop {
            if self.pc == RETURN_SENTINEL {
                return Ok(CpuExit::Returned);
            }
            if let Some(budget) = self.budget.filter(|budget| self.steps >= *budget) {
                return Err(VmError::StepBudgetExceeded(budget));
            }
            self.steps += 1;
            if let Some(exit) = self.step(mem)? {
                return Ok(exit);
            }
        }
    }

    /// Writes the host routine's result and clobbers what the convention
    /// lets a callee clobber.
    pub fn complete_host_call(&mut self, kind: CallKind, lo: u32, hi: u32) {
        match kind {
            CallKind::Windowed => {
                for index in [8u8, 9, 12, 13, 14, 15] {
                    if let Some(r) = Reg::from_index(index) {
                        self.set_reg(r, POISON);
                    }
                }
                if let (Some(r10), Some(r11)) = (Reg::from_index(10), Reg::from_index(11)) {
                    self.set_reg(r10, lo);
                    self.set_reg(r11, hi);
                }
            }
            CallKind::Call0 => {
                for index in 4u8..=11 {
                    if let Some(r) = Reg::from_index(index) {
                        self.set_reg(r, POISON);
                    }
                }
                self.set_reg(A2, lo);
                self.set_reg(A3, hi);
            }
        }
    }

    fn fault(&self, message: impl Into<String>) -> VmError {
        VmError::NativeFault {
            pc: self.pc,
            message: message.into(),
        }
    }

    fn memory_fault(&self, error: VmError) -> VmError {
        self.fault(error.to_string())
    }

    fn fetch(&self, mem: &AddressSpace) -> VmResult<u32> {
        if !mem.is_iram(self.pc) {
            return Err(self.fault("instruction fetch outside instruction memory"));
        }
        let aligned = self.pc & !3;
        let shift = (self.pc & 3) * 8;
        let lo = mem.load_word(aligned).map_err(|e| self.memory_fault(e))? as u64;
        let hi = if shift > 8 {
            mem.load_word(aligned + 4).map_err(|e| self.memory_fault(e))? as u64
        } else {
            0
        };
        Ok((((hi << 32) | lo) >> shift) as u32 & 0xFF_FFFF)
    }

    fn step(&mut self, mem: &mut AddressSpace) -> VmResult<Option<CpuExit>> {
        let word = self.fetch(mem)?;
        let insn = decode_insn(word)
            .ok_or_else(|| self.fault(format!("illegal instruction {word:#08x}")))?;
        let pc = self.pc;
        let mut next = pc.wrapping_add(INSN_LEN);

        match insn {
            Insn::Ill => return Err(self.fault("ill instruction")),
            Insn::Nop => {}
            Insn::Ret => next = self.reg(A0),
            Insn::Retw => {
                let a0 = self.reg(A0);
                let n = (a0 >> 30) as usize * 4;
                if n == 0 || self.window_base < n {
                    return Err(self.fault("retw without a matching windowed call"));
                }
                self.window_base -= n;
                next = (a0 & 0x3FFF_FFFF) | (pc & 0xC000_0000);
            }
            Insn::Jx { s } => next = self.reg(s),
            Insn::Callx0 { s } => {
                let target = self.reg(s);
                self.set_reg(A0, next);
                self.callinc = 0;
                if is_stub(target) {
                    self.pc = next;
                    return Ok(Some(CpuExit::HostCall {
                        target,
                        kind: CallKind::Call0,
                    }));
                }
                next = target;
            }
            Insn::Callx8 { s } => {
                let target = self.reg(s);
                return Ok(self.call8(target, next));
            }
            Insn::Call8 { disp } => {
                let target = (pc & !3).wrapping_add(disp as u32).wrapping_add(4);
                return Ok(self.call8(target, next));
            }
            Insn::Alu { op, r, s, t } => {
                let (a, b) = (self.reg(s), self.reg(t));
                let value = match op {
                    AluOp::And => a & b,
                    AluOp::Or => a | b,
                    AluOp::Xor => a ^ b,
                    AluOp::Add => a.wrapping_add(b),
                    AluOp::Addx2 => (a << 1).wrapping_add(b),
                    AluOp::Addx4 => (a << 2).wrapping_add(b),
                    AluOp::Addx8 => (a << 3).wrapping_add(b),
                    AluOp::Sub => a.wrapping_sub(b),
                    AluOp::Mull => a.wrapping_mul(b),
                    AluOp::Muluh => ((a as u64 * b as u64) >> 32) as u32,
                    AluOp::Mulsh => ((a as i32 as i64 * b as i32 as i64) >> 32) as u32,
                    AluOp::Quou | AluOp::Quos | AluOp::Remu | AluOp::Rems if b == 0 => {
                        return Err(self.fault("integer divide by zero"));
                    }
                    AluOp::Quou => a / b,
                    AluOp::Quos => (a as i32).wrapping_div(b as i32) as u32,
                    AluOp::Remu => a % b,
                    AluOp::Rems => (a as i32).wrapping_rem(b as i32) as u32,
                };
                self.set_reg(r, value);
            }
            Insn::Neg { r, t } => {
                let value = self.reg(t).wrapping_neg();
                self.set_reg(r, value);
            }
            Insn::Ssr { s } => self.sar = self.reg(s) & 0x1F,
            Insn::Ssl { s } => self.sar = 32 - (self.reg(s) & 0x1F),
            Insn::Ssai { sa } => self.sar = sa,
            Insn::Slli { r, s, sa } => {
                let value = self.reg(s) << sa;
                self.set_reg(r, value);
            }
            Insn::Srai { r, t, sa } => {
                let value = ((self.reg(t) as i32) >> sa) as u32;
                self.set_reg(r, value);
            }
            Insn::Srli { r, t, sa } => {
                let value = self.reg(t) >> sa;
                self.set_reg(r, value);
            }
            Insn::Src { r, s, t } => {
                let pair = ((self.reg(s) as u64) << 32) | self.reg(t) as u64;
                self.set_reg(r, (pair >> self.sar) as u32);
            }
            Insn::Srl { r, t } => {
                let value = (self.reg(t) as u64 >> self.sar) as u32;
                self.set_reg(r, value);
            }
            Insn::Sll { r, s } => {
                let value = ((self.reg(s) as u64) << (32 - self.sar)) as u32;
                self.set_reg(r, value);
            }
            Insn::Sra { r, t } => {
                let value = ((self.reg(t) as i32 as i64) >> self.sar) as u32;
                self.set_reg(r, value);
            }
            Insn::Extui { r, t, shift, bits } => {
                let value = ((self.reg(t) as u64 >> shift) & ((1u64 << bits) - 1)) as u32;
                self.set_reg(r, value);
            }
            Insn::CondMove { eqz, r, s, t } => {
                if (self.reg(t) == 0) == eqz {
                    let value = self.reg(s);
                    self.set_reg(r, value);
                }
            }
            Insn::Fpu { op, r, s, t } => {
                let a = f32::from_bits(self.fregs[s.index() as usize]);
                let b = f32::from_bits(self.fregs[t.index() as usize]);
                let value = match op {
                    FpuOp::Add => a + b,
                    FpuOp::Sub => a - b,
                    FpuOp::Mul => a * b,
                };
                self.fregs[r.index() as usize] = value.to_bits();
            }
            Insn::Rfr { r, s } => {
                let value = self.fregs[s.index() as usize];
                self.set_reg(r, value);
            }
            Insn::Wfr { r, s } => self.fregs[r.index() as usize] = self.reg(s),
            Insn::L32r { t, disp } => {
                let address = (pc.wrapping_add(3) & !3).wrapping_add(disp as u32);
                let value = mem.read_u32(address).map_err(|e| self.memory_fault(e))?;
                self.set_reg(t, value);
            }
            Insn::Load {
                width,
                signed,
                t,
                s,
                offset,
            } => {
                let address = self.reg(s).wrapping_add(offset);
                let value = match (width, signed) {
                    (1, _) => mem.read_u8(address).map(u32::from),
                    (2, false) => mem.read_u16(address).map(u32::from),
                    (2, true) => mem.read_u16(address).map(|v| v as i16 as i32 as u32),
                    _ => mem.read_u32(address),
                }
                .map_err(|e| self.memory_fault(e))?;
                self.set_reg(t, value);
            }
            Insn::Store {
                width,
                t,
                s,
                offset,
            } => {
                let address = self.reg(s).wrapping_add(offset);
                let value = self.reg(t);
                match width {
                    1 => mem.write_u8(address, value as u8),
                    2 => mem.write_u16(address, value as u16),
                    _ => mem.write_u32(address, value),
                }
                .map_err(|e| self.memory_fault(e))?;
            }
            Insn::Movi { t, imm } => self.set_reg(t, imm as u32),
            Insn::Addi { t, s, imm } | Insn::Addmi { t, s, imm } => {
                let value = self.reg(s).wrapping_add(imm as u32);
                self.set_reg(t, value);
            }
            Insn::J { disp } => {
                if disp == -4 {
                    return Err(VmError::NativeTrap { pc });
                }
                next = pc.wrapping_add(4).wrapping_add(disp as u32);
            }
            Insn::BranchZ { cond, s, disp } => {
                if cond.holds(self.reg(s)) {
                    next = pc.wrapping_add(4).wrapping_add(disp as u32);
                }
            }
            Insn::Branch { cond, s, t, disp } => {
                if cond.holds(self.reg(s), self.reg(t)) {
                    next = pc.wrapping_add(4).wrapping_add(disp as u32);
                }
            }
            Insn::Entry { s, frame } => {
                let sp = self.reg(s).wrapping_sub(frame);
                if sp < self.stack_limit {
                    return Err(self.fault("native stack overflow"));
                }
                self.window_base += self.callinc as usize * 4;
                let needed = self.window_base + 16;
                if self.phys.len() < needed {
                    self.phys.resize(needed, 0);
                }
                self.set_reg(s, sp);
                self.callinc = 0;
            }
        }

        self.pc = next;
        Ok(None)
    }

    fn call8(&mut self, target: u32, ret: u32) -> Option<CpuExit> {
        self.pc = ret;
        if is_stub(target) {
            return Some(CpuExit::HostCall {
                target,
                kind: CallKind::Windowed,
            });
        }
        self.set_reg(super::A8, (2 << 30) | (ret & 0x3FFF_FFFF));
        self.callinc = 2;
        self.pc = target;
        None
    }
}

/// Registers a call under `kind` reads its argument words from.
pub fn arg_registers(kind: CallKind) -> [Reg; 6] {
    let first = match kind {
        CallKind::Windowed => 10,
        CallKind::Call0 => 2,
    };
    let mut regs = [A3; 6];
    for (i, slot) in regs.iter_mut().enumerate() {
        if let Some(r) = Reg::from_index(first + i as u8) {
            *slot = r;
        }
    }
    regs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DRAM_BASE, IRAM_BASE};
    use crate::xtensa::encode::{self, BranchCond};
    use crate::xtensa::{A4, A5, A6, A10, A11, HELPER_BASE};

    fn load(mem: &mut AddressSpace, at: u32, insns: &[u32]) {
        let mut bytes = Vec::new();
        for insn in insns {
            bytes.extend_from_slice(&encode::bytes(*insn));
        }
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        for (i, chunk) in bytes.chunks(4).enumerate() {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            mem.write_u32(at + 4 * i as u32, word).expect("store");
        }
    }

    fn space() -> AddressSpace {
        AddressSpace::new(1024, 4096)
    }

    #[test]
    fn windowed_entry_and_return_rotate_registers() {
        let mut mem = space();
        // a2 = a2 + a3 (caller's a10 + a11), result written to caller a10 via
        // the register file in memory.
        load(
            &mut mem,
            IRAM_BASE,
            &[
                encode::entry(A1, 32).expect("entry"),
                encode::add(A4, A2, A3),
                encode::s32i(A4, A1, 0).expect("s32i"),
                encode::retw(),
            ],
        );
        let top = DRAM_BASE + 4096;
        let mut cpu = Cpu::new(DRAM_BASE, Some(1000));
        cpu.enter(IRAM_BASE, top, &[40, 2]);
        assert_eq!(cpu.run(&mut mem), Ok(CpuExit::Returned));
        assert_eq!(mem.read_u32(top - 32), Ok(42));
        assert_eq!(cpu.window_base(), 0);
        assert_eq!(cpu.reg(A1), top);
    }

    #[test]
    fn host_stub_calls_are_intercepted_and_clobber_caller_registers() {
        let mut mem = space();
        mem.write_u32(IRAM_BASE, HELPER_BASE + 8).expect("literal");
        load(
            &mut mem,
            IRAM_BASE + 4,
            &[
                encode::entry(A1, 16).expect("entry"),
                encode::l32r(A6, -8).expect("l32r"),
                encode::movi(A10, 7).expect("movi"),
                encode::movi(A5, 0x55).expect("movi"),
                encode::callx8(A6),
                encode::add(A2, A10, A5),
                encode::retw(),
            ],
        );
        let mut cpu = Cpu::new(DRAM_BASE, Some(1000));
        cpu.enter(IRAM_BASE + 4, DRAM_BASE + 4096, &[0, 0]);
        assert_eq!(
            cpu.run(&mut mem),
            Ok(CpuExit::HostCall {
                target: HELPER_BASE + 8,
                kind: CallKind::Windowed
            })
        );
        assert_eq!(cpu.reg(A10), 7);
        cpu.complete_host_call(CallKind::Windowed, 100, 0);
        assert_eq!(cpu.reg(A11), 0);
        assert_eq!(cpu.reg(crate::xtensa::A12), POISON);
        assert_eq!(cpu.run(&mut mem), Ok(CpuExit::Returned));
        assert_eq!(cpu.reg(A10), 100 + 0x55);
    }

    #[test]
    fn self_jump_is_a_trap_and_budget_bounds_loops() {
        let mut mem = space();
        load(&mut mem, IRAM_BASE, &[encode::j(-4).expect("j")]);
        let mut cpu = Cpu::new(DRAM_BASE, Some(100));
        cpu.enter(IRAM_BASE, DRAM_BASE + 4096, &[]);
        assert_eq!(cpu.run(&mut mem), Err(VmError::NativeTrap { pc: IRAM_BASE }));

        load(
            &mut mem,
            IRAM_BASE,
            &[
                encode::nop(),
                encode::branch(BranchCond::Eq, A4, A4, -7).expect("beq"),
            ],
        );
        let mut cpu = Cpu::new(DRAM_BASE, Some(100));
        cpu.enter(IRAM_BASE, DRAM_BASE + 4096, &[]);
        assert_eq!(cpu.run(&mut mem), Err(VmError::StepBudgetExceeded(100)));
    }

    #[test]
    fn l32r_reads_backward_literals_from_instruction_memory() {
        let mut mem = space();
        mem.write_u32(IRAM_BASE, 0x1234_5678).expect("literal");
        load(
            &mut mem,
            IRAM_BASE + 4,
            &[
                encode::entry(A1, 16).expect("entry"),
                encode::l32r(A2, -8).expect("l32r"),
                encode::retw(),
            ],
        );
        let mut cpu = Cpu::new(DRAM_BASE, Some(100));
        cpu.enter(IRAM_BASE + 4, DRAM_BASE + 4096, &[]);
        assert_eq!(cpu.run(&mut mem), Ok(CpuExit::Returned));
        assert_eq!(cpu.reg(A10), 0x1234_5678);
    }

    #[test]
    fn shifts_follow_the_shift_amount_register() {
        let mut mem = space();
        load(
            &mut mem,
            IRAM_BASE,
            &[
                encode::entry(A1, 16).expect("entry"),
                encode::movi(A4, 4).expect("movi"),
                encode::ssl(A4),
                encode::sll(A2, A3),
                encode::ssr(A4),
                encode::sra(A3, A3),
                encode::retw(),
            ],
        );
        let mut cpu = Cpu::new(DRAM_BASE, Some(100));
        cpu.enter(IRAM_BASE, DRAM_BASE + 4096, &[0, 0x8000_0010]);
        assert_eq!(cpu.run(&mut mem), Ok(CpuExit::Returned));
        assert_eq!(cpu.reg(A10), 0x0000_0100);
        assert_eq!(cpu.reg(A11), 0xF800_0001);
    }
}
