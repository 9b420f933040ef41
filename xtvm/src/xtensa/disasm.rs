use crate::memory::WordStore;

use super::decode::{FpuOp, Insn, decode_insn};
use super::INSN_LEN;

/// Renders one instruction located at `pc`. Branch targets are printed as
/// absolute addresses.
pub fn format_insn(pc: u32, insn: &Insn) -> String {
    let rel = |disp: i32| pc.wrapping_add(4).wrapping_add(disp as u32);
    match *insn {
        Insn::Ill => "ill".to_string(),
        Insn::Nop => "nop".to_string(),
        Insn::Ret => "ret".to_string(),
        Insn::Retw => "retw".to_string(),
        Insn::Jx { s } => format!("jx {s}"),
        Insn::Callx0 { s } => format!("callx0 {s}"),
        Insn::Callx8 { s } => format!("callx8 {s}"),
        Insn::Alu { op, r, s, t } => format!("{} {r}, {s}, {t}", op.mnemonic()),
        Insn::Neg { r, t } => format!("neg {r}, {t}"),
        Insn::Ssr { s } => format!("ssr {s}"),
        Insn::Ssl { s } => format!("ssl {s}"),
        Insn::Ssai { sa } => format!("ssai {sa}"),
        Insn::Slli { r, s, sa } => format!("slli {r}, {s}, {sa}"),
        Insn::Srai { r, t, sa } => format!("srai {r}, {t}, {sa}"),
        Insn::Srli { r, t, sa } => format!("srli {r}, {t}, {sa}"),
        Insn::Src { r, s, t } => format!("src {r}, {s}, {t}"),
        Insn::Srl { r, t } => format!("srl {r}, {t}"),
        Insn::Sll { r, s } => format!("sll {r}, {s}"),
        Insn::Sra { r, t } => format!("sra {r}, {t}"),
        Insn::Extui { r, t, shift, bits } => format!("extui {r}, {t}, {shift}, {bits}"),
        Insn::CondMove { eqz, r, s, t } => {
            let name = if eqz { "moveqz" } else { "movnez" };
            format!("{name} {r}, {s}, {t}")
        }
        Insn::Fpu { op, r, s, t } => {
            let name = match op {
                FpuOp::Add => "add.s",
                FpuOp::Sub => "sub.s",
                FpuOp::Mul => "mul.s",
            };
            format!("{name} {r}, {s}, {t}")
        }
        Insn::Rfr { r, s } => format!("rfr {r}, {s}"),
        Insn::Wfr { r, s } => format!("wfr {r}, {s}"),
        Insn::L32r { t, disp } => {
            let literal = (pc.wrapping_add(3) & !3).wrapping_add(disp as u32);
            format!("l32r {t}, {literal:#010x}")
        }
        Insn::Load {
            width,
            signed,
            t,
            s,
            offset,
        } => {
            let name = match (width, signed) {
                (1, _) => "l8ui",
                (2, false) => "l16ui",
                (2, true) => "l16si",
                _ => "l32i",
            };
            format!("{name} {t}, {s}, {offset}")
        }
        Insn::Store {
            width,
            t,
            s,
            offset,
        } => {
            let name = match width {
                1 => "s8i",
                2 => "s16i",
                _ => "s32i",
            };
            format!("{name} {t}, {s}, {offset}")
        }
        Insn::Movi { t, imm } => format!("movi {t}, {imm}"),
        Insn::Addi { t, s, imm } => format!("addi {t}, {s}, {imm}"),
        Insn::Addmi { t, s, imm } => format!("addmi {t}, {s}, {imm}"),
        Insn::Call8 { disp } => {
            let target = (pc & !3).wrapping_add(disp as u32).wrapping_add(4);
            format!("call8 {target:#010x}")
        }
        Insn::J { disp } => format!("j {:#010x}", rel(disp)),
        Insn::BranchZ { cond, s, disp } => {
            format!("{} {s}, {:#010x}", cond.mnemonic(), rel(disp))
        }
        Insn::Entry { s, frame } => format!("entry {s}, {frame}"),
        Insn::Branch { cond, s, t, disp } => {
            format!("{} {s}, {t}, {:#010x}", cond.mnemonic(), rel(disp))
        }
    }
}

/// Disassembles `len` bytes of code starting at `start`. Literal pools show up
/// as whatever their words decode to, so callers pass the literal ranges to
/// print them as data instead.
pub fn disassemble<S: WordStore + ?Sized>(
    mem: &S,
    start: u32,
    len: u32,
    literal_ranges: &[(u32, u32)],
) -> Vec<String> {
    let mut out = Vec::new();
    let end = start + len;
    let mut pc = start;
    while pc < end {
        if let Some(&(_, lit_end)) = literal_ranges
            .iter()
            .find(|(lit_start, lit_end)| (*lit_start..*lit_end).contains(&pc))
        {
            while pc < lit_end.min(end) {
                let word = mem.load_word(pc & !3).unwrap_or(0);
                out.push(format!("{pc:#010x}:  .word {word:#010x}"));
                pc = (pc & !3) + 4;
            }
            continue;
        }
        let Some(word) = read_insn(mem, pc) else {
            out.push(format!("{pc:#010x}:  <unreadable>"));
            break;
        };
        let text = match decode_insn(word) {
            Some(insn) => format_insn(pc, &insn),
            None => format!(".byte {word:#08x}"),
        };
        out.push(format!("{pc:#010x}:  {word:06x}  {text}"));
        pc += INSN_LEN;
    }
    out
}

fn read_insn<S: WordStore + ?Sized>(mem: &S, pc: u32) -> Option<u32> {
    let aligned = pc & !3;
    let shift = (pc & 3) * 8;
    let lo = mem.load_word(aligned).ok()? as u64;
    let hi = if shift > 8 {
        mem.load_word(aligned + 4).ok()? as u64
    } else {
        0
    };
    Some((((hi << 32) | lo) >> shift) as u32 & 0xFF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xtensa::decode::decode_insn;
    use crate::xtensa::encode;
    use crate::xtensa::{A2, A3, A4};

    #[test]
    fn formats_branch_targets_as_absolute_addresses() {
        let insn = decode_insn(encode::beqz(A4, 2).expect("beqz")).expect("decode");
        assert_eq!(format_insn(0x4008_0000, &insn), "beqz a4, 0x40080006");
        let insn = decode_insn(encode::add(A2, A3, A4)).expect("decode");
        assert_eq!(format_insn(0, &insn), "add a2, a3, a4");
    }
}
