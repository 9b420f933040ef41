use crate::memory::WordStore;
use crate::xtensa::{Reg, encode};

use super::JitFailure;
use super::emitter::CodeEmitter;

/// Farthest backward reach of `L32R`.
const L32R_REACH: i64 = 262_144;

#[derive(Clone, Copy, Debug)]
struct Literal {
    value: u32,
    /// Code offset once materialized.
    offset: Option<u32>,
}

/// De-duplicating table of 32-bit constants loaded with `L32R`.
///
/// `L32R` can only address backward, so a constant must already sit in the
/// code stream before the load that uses it. A miss therefore materializes
/// the pending entries right away, behind a jump that skips over them.
#[derive(Debug)]
pub struct LiteralPool {
    capacity: usize,
    entries: Vec<Literal>,
    flushes: u32,
    resets: u32,
    ranges: Vec<(u32, u32)>,
}

impl LiteralPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::new(),
            flushes: 0,
            resets: 0,
            ranges: Vec::new(),
        }
    }

    /// Queues values to be materialized by the next flush.
    pub fn seed(&mut self, values: impl IntoIterator<Item = u32>) {
        for value in values {
            if self.entries.len() >= self.capacity {
                break;
            }
            if self.position_of(value).is_none() {
                self.entries.push(Literal {
                    value,
                    offset: None,
                });
            }
        }
    }

    pub fn flushes(&self) -> u32 {
        self.flushes
    }

    /// Number of times a full pool was abandoned for a fresh one.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// `(start, end)` code offsets of every materialized table.
    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position_of(&self, value: u32) -> Option<usize> {
        self.entries.iter().position(|entry| entry.value == value)
    }

    fn reset(&mut self) {
        self.entries.clear();
        self.resets += 1;
    }

    fn reachable(offset: u32, load_at: u32) -> bool {
        let disp = offset as i64 - ((load_at as i64 + 3) & !3);
        (-L32R_REACH..=-4).contains(&disp)
    }

    /// Returns the code offset holding `value`, materializing it first when
    /// needed. The caller emits its `L32R` at the emitter position right
    /// after this returns.
    pub fn get_or_add<S: WordStore + ?Sized>(
        &mut self,
        em: &mut CodeEmitter<'_, S>,
        value: u32,
    ) -> Result<u32, JitFailure> {
        match self.position_of(value) {
            Some(index) => match self.entries[index].offset {
                Some(offset) if Self::reachable(offset, em.position()) => return Ok(offset),
                Some(_) => {
                    self.reset();
                    self.entries.push(Literal {
                        value,
                        offset: None,
                    });
                }
                None => {}
            },
            None => {
                if self.entries.len() >= self.capacity {
                    self.reset();
                }
                self.entries.push(Literal {
                    value,
                    offset: None,
                });
            }
        }
        self.flush(em)?;
        self.position_of(value)
            .and_then(|index| self.entries[index].offset)
            .ok_or(JitFailure::EncodingRange {
                what: "literal pool entry",
                value: value as i64,
            })
    }

    /// Materializes every pending entry: `J` over the table, zero padding up
    /// to a word boundary, then one word per entry.
    pub fn flush<S: WordStore + ?Sized>(
        &mut self,
        em: &mut CodeEmitter<'_, S>,
    ) -> Result<(), JitFailure> {
        let pending = self
            .entries
            .iter()
            .filter(|entry| entry.offset.is_none())
            .count() as u32;
        if pending == 0 {
            return Ok(());
        }
        let start = em.position();
        let table = (start + 3 + 3) & !3;
        let end = table + 4 * pending;
        let skip = encode::j((end as i64 - (start as i64 + 4)) as i32).map_err(JitFailure::from)?;
        em.emit_insn(skip)?;
        em.align_word()?;
        let mut offset = table;
        for entry in self.entries.iter_mut().filter(|entry| entry.offset.is_none()) {
            em.emit_word(entry.value)?;
            entry.offset = Some(offset);
            offset += 4;
        }
        self.flushes += 1;
        self.ranges.push((table, end));
        Ok(())
    }

    /// Emits `L32R reg, <value>`.
    pub fn load<S: WordStore + ?Sized>(
        &mut self,
        em: &mut CodeEmitter<'_, S>,
        reg: Reg,
        value: u32,
    ) -> Result<(), JitFailure> {
        let offset = self.get_or_add(em, value)?;
        let disp = offset as i64 - ((em.position() as i64 + 3) & !3);
        let insn = encode::l32r(reg, disp as i32).map_err(JitFailure::from)?;
        em.emit_insn(insn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AddressSpace, IRAM_BASE};
    use crate::xtensa::{A4, Insn, decode_insn};

    /// Resolves every `L32R` in `[0, len)` to the word it loads, skipping over
    /// the tables themselves.
    fn loaded_values(mem: &AddressSpace, len: u32, ranges: &[(u32, u32)]) -> Vec<u32> {
        let mut out = Vec::new();
        let mut pc = 0u32;
        while pc < len {
            if let Some(&(_, end)) = ranges.iter().find(|(start, end)| (*start..*end).contains(&pc)) {
                pc = end;
                continue;
            }
            let aligned = (IRAM_BASE + pc) & !3;
            let shift = ((IRAM_BASE + pc) & 3) * 8;
            let lo = mem.load_word(aligned).expect("lo") as u64;
            let hi = mem.load_word(aligned + 4).unwrap_or(0) as u64;
            let word = ((((hi << 32) | lo) >> shift) & 0xFF_FFFF) as u32;
            match decode_insn(word) {
                Some(Insn::L32r { disp, .. }) => {
                    let address = ((IRAM_BASE + pc + 3) & !3).wrapping_add(disp as u32);
                    out.push(mem.load_word(address).expect("literal"));
                }
                Some(Insn::J { disp }) => {
                    // Pool skip: land past the table.
                    pc = (pc as i64 + 4 + disp as i64) as u32;
                    continue;
                }
                _ => {}
            }
            pc += 3;
        }
        out
    }

    #[test]
    fn repeated_values_are_materialized_once() {
        let mut mem = AddressSpace::new(1024, 64);
        let mut pool = LiteralPool::new(4);
        let mut em = CodeEmitter::new(&mut mem, IRAM_BASE, 256);
        pool.load(&mut em, A4, 0x1234_5678).expect("first");
        pool.load(&mut em, A4, 0x1234_5678).expect("second");
        assert_eq!(pool.flushes(), 1);
        let len = em.finish().expect("finish");
        let ranges = pool.ranges().to_vec();
        assert_eq!(
            loaded_values(&mem, len, &ranges),
            vec![0x1234_5678, 0x1234_5678]
        );
    }

    #[test]
    fn seeded_values_share_one_table() {
        let mut mem = AddressSpace::new(1024, 64);
        let mut pool = LiteralPool::new(8);
        let mut em = CodeEmitter::new(&mut mem, IRAM_BASE, 256);
        em.emit_insn(encode::nop()).expect("nop");
        pool.seed([0x4000_0000, 0x4000_0004, 0x4000_0008]);
        pool.flush(&mut em).expect("flush");
        pool.load(&mut em, A4, 0x4000_0004).expect("seeded");
        pool.load(&mut em, A4, 0x4000_0008).expect("seeded");
        assert_eq!(pool.flushes(), 1);
        assert_eq!(pool.ranges(), &[(8, 20)]);
        let len = em.finish().expect("finish");
        let ranges = pool.ranges().to_vec();
        assert_eq!(
            loaded_values(&mem, len, &ranges),
            vec![0x4000_0004, 0x4000_0008]
        );
    }

    #[test]
    fn capacity_miss_starts_a_fresh_pool() {
        let mut mem = AddressSpace::new(4096, 64);
        let mut pool = LiteralPool::new(2);
        let mut em = CodeEmitter::new(&mut mem, IRAM_BASE, 1024);
        let values: Vec<u32> = (0..5).map(|i| 0x1000_0000 + i).collect();
        for value in &values {
            pool.load(&mut em, A4, *value).expect("load");
        }
        assert_eq!(pool.flushes(), 5);
        assert_eq!(pool.resets(), 2);
        // Still within the current pool.
        pool.load(&mut em, A4, values[4]).expect("reuse");
        assert_eq!(pool.flushes(), 5);
        let len = em.finish().expect("finish");
        let ranges = pool.ranges().to_vec();
        let mut expected = values.clone();
        expected.push(values[4]);
        assert_eq!(loaded_values(&mem, len, &ranges), expected);
    }

    #[test]
    fn flush_with_nothing_pending_emits_nothing() {
        let mut mem = AddressSpace::new(256, 64);
        let mut pool = LiteralPool::new(4);
        let mut em = CodeEmitter::new(&mut mem, IRAM_BASE, 64);
        pool.flush(&mut em).expect("flush");
        assert_eq!(em.position(), 0);
        assert_eq!(pool.flushes(), 0);
    }
}
