use std::collections::BTreeMap;

use crate::error::{VmError, VmResult};

/// Base of the instruction RAM that holds compiled code and literal pools.
pub const IRAM_BASE: u32 = 0x4008_0000;
/// Base of the data RAM that holds every VM-visible structure.
pub const DRAM_BASE: u32 = 0x3FFB_0000;

/// Word-granular access to instruction memory. Implementors only ever see
/// aligned 32-bit loads and stores.
pub trait WordStore {
    fn load_word(&self, address: u32) -> VmResult<u32>;
    fn store_word(&mut self, address: u32, word: u32) -> VmResult<()>;
}

/// The simulated 32-bit address space: instruction RAM plus data RAM.
pub struct AddressSpace {
    iram: Vec<u32>,
    dram: Vec<u8>,
    exec: FirstFit,
    iram_word_writes: u64,
}

impl AddressSpace {
    pub fn new(iram_bytes: u32, dram_bytes: u32) -> Self {
        let iram_bytes = iram_bytes & !3;
        Self {
            iram: vec![0; (iram_bytes / 4) as usize],
            dram: vec![0; dram_bytes as usize],
            exec: FirstFit::new(IRAM_BASE, iram_bytes, 4),
            iram_word_writes: 0,
        }
    }

    pub fn iram_end(&self) -> u32 {
        IRAM_BASE + (self.iram.len() as u32) * 4
    }

    pub fn dram_end(&self) -> u32 {
        DRAM_BASE + self.dram.len() as u32
    }

    pub fn is_iram(&self, address: u32) -> bool {
        (IRAM_BASE..self.iram_end()).contains(&address)
    }

    pub fn is_dram(&self, address: u32) -> bool {
        (DRAM_BASE..self.dram_end()).contains(&address)
    }

    /// Number of word stores issued to instruction RAM so far.
    pub fn iram_word_writes(&self) -> u64 {
        self.iram_word_writes
    }

    fn dram_span(&self, address: u32, len: u32, width: u8) -> VmResult<std::ops::Range<usize>> {
        let start = address
            .checked_sub(DRAM_BASE)
            .ok_or(VmError::MemoryFault { address, width })? as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|end| *end <= self.dram.len())
            .ok_or(VmError::MemoryFault { address, width })?;
        Ok(start..end)
    }

    fn iram_index(&self, address: u32, width: u8) -> VmResult<usize> {
        if address & 3 != 0 {
            return Err(VmError::MisalignedAccess { address, width });
        }
        let index = ((address - IRAM_BASE) / 4) as usize;
        if index >= self.iram.len() {
            return Err(VmError::MemoryFault { address, width });
        }
        Ok(index)
    }

    pub fn read_u8(&self, address: u32) -> VmResult<u8> {
        if self.is_iram(address) {
            return Err(VmError::MemoryFault { address, width: 1 });
        }
        let span = self.dram_span(address, 1, 1)?;
        Ok(self.dram[span.start])
    }

    pub fn read_u16(&self, address: u32) -> VmResult<u16> {
        if address & 1 != 0 {
            return Err(VmError::MisalignedAccess { address, width: 2 });
        }
        if self.is_iram(address) {
            return Err(VmError::MemoryFault { address, width: 2 });
        }
        let span = self.dram_span(address, 2, 2)?;
        let bytes = &self.dram[span];
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&self, address: u32) -> VmResult<u32> {
        if self.is_iram(address) {
            let index = self.iram_index(address, 4)?;
            return Ok(self.iram[index]);
        }
        if address & 3 != 0 {
            return Err(VmError::MisalignedAccess { address, width: 4 });
        }
        let span = self.dram_span(address, 4, 4)?;
        let bytes = &self.dram[span];
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// 64-bit values are two little-endian words and need word alignment.
    pub fn read_u64(&self, address: u32) -> VmResult<u64> {
        let lo = self.read_u32(address)?;
        let hi = self.read_u32(address.wrapping_add(4))?;
        Ok(((hi as u64) << 32) | lo as u64)
    }

    pub fn write_u8(&mut self, address: u32, value: u8) -> VmResult<()> {
        if self.is_iram(address) {
            return Err(VmError::NarrowInstructionWrite { address, width: 1 });
        }
        let span = self.dram_span(address, 1, 1)?;
        self.dram[span.start] = value;
        Ok(())
    }

    pub fn write_u16(&mut self, address: u32, value: u16) -> VmResult<()> {
        if self.is_iram(address) {
            return Err(VmError::NarrowInstructionWrite { address, width: 2 });
        }
        if address & 1 != 0 {
            return Err(VmError::MisalignedAccess { address, width: 2 });
        }
        let span = self.dram_span(address, 2, 2)?;
        self.dram[span].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_u32(&mut self, address: u32, value: u32) -> VmResult<()> {
        if self.is_iram(address) {
            let index = self.iram_index(address, 4)?;
            self.iram[index] = value;
            self.iram_word_writes += 1;
            return Ok(());
        }
        if address & 3 != 0 {
            return Err(VmError::MisalignedAccess { address, width: 4 });
        }
        let span = self.dram_span(address, 4, 4)?;
        self.dram[span].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_u64(&mut self, address: u32, value: u64) -> VmResult<()> {
        self.write_u32(address, value as u32)?;
        self.write_u32(address.wrapping_add(4), (value >> 32) as u32)
    }

    pub fn read_bytes(&self, address: u32, len: u32) -> VmResult<&[u8]> {
        let span = self.dram_span(address, len, 1)?;
        Ok(&self.dram[span])
    }

    pub fn write_bytes(&mut self, address: u32, bytes: &[u8]) -> VmResult<()> {
        let span = self.dram_span(address, bytes.len() as u32, 1)?;
        self.dram[span].copy_from_slice(bytes);
        Ok(())
    }

    pub fn fill(&mut self, address: u32, value: u8, len: u32) -> VmResult<()> {
        let span = self.dram_span(address, len, 1)?;
        self.dram[span].fill(value);
        Ok(())
    }

    /// Overlap-safe copy inside data RAM.
    pub fn copy_within(&mut self, dst: u32, src: u32, len: u32) -> VmResult<()> {
        let from = self.dram_span(src, len, 1)?;
        let to = self.dram_span(dst, len, 1)?;
        self.dram.copy_within(from, to.start);
        Ok(())
    }

    pub fn alloc_exec(&mut self, bytes: u32) -> VmResult<u32> {
        self.exec
            .alloc(bytes)
            .ok_or(VmError::ExecMemoryExhausted { requested: bytes })
    }

    pub fn shrink_exec(&mut self, address: u32, bytes: u32) -> bool {
        self.exec.shrink(address, bytes)
    }

    pub fn free_exec(&mut self, address: u32) -> bool {
        self.exec.free(address)
    }

    pub fn exec_available(&self) -> u32 {
        self.exec.available()
    }

    pub fn exec_largest_free(&self) -> u32 {
        self.exec.largest_free()
    }
}

impl WordStore for AddressSpace {
    fn load_word(&self, address: u32) -> VmResult<u32> {
        if !self.is_iram(address) {
            return Err(VmError::MemoryFault { address, width: 4 });
        }
        self.read_u32(address)
    }

    fn store_word(&mut self, address: u32, word: u32) -> VmResult<()> {
        if !self.is_iram(address) {
            return Err(VmError::MemoryFault { address, width: 4 });
        }
        self.write_u32(address, word)
    }
}

/// First-fit allocator over an address range, used for executable memory and
/// for the VM heap.
#[derive(Debug, Clone)]
pub struct FirstFit {
    align: u32,
    free: Vec<(u32, u32)>,
    used: BTreeMap<u32, u32>,
}

impl FirstFit {
    pub fn new(base: u32, size: u32, align: u32) -> Self {
        let align = align.max(1);
        let start = round_up(base, align);
        let size = size.saturating_sub(start - base) / align * align;
        let free = if size > 0 { vec![(start, size)] } else { Vec::new() };
        Self {
            align,
            free,
            used: BTreeMap::new(),
        }
    }

    pub fn alloc(&mut self, bytes: u32) -> Option<u32> {
        let bytes = round_up(bytes.max(1), self.align);
        let slot = self.free.iter().position(|(_, len)| *len >= bytes)?;
        let (start, len) = self.free[slot];
        if len == bytes {
            self.free.remove(slot);
        } else {
            self.free[slot] = (start + bytes, len - bytes);
        }
        self.used.insert(start, bytes);
        Some(start)
    }

    /// Returns the tail of an allocation to the free list.
    pub fn shrink(&mut self, address: u32, bytes: u32) -> bool {
        let bytes = round_up(bytes.max(1), self.align);
        let Some(len) = self.used.get_mut(&address) else {
            return false;
        };
        if bytes >= *len {
            return bytes == *len;
        }
        let tail = (address + bytes, *len - bytes);
        *len = bytes;
        self.release(tail);
        true
    }

    pub fn free(&mut self, address: u32) -> bool {
        match self.used.remove(&address) {
            Some(len) => {
                self.release((address, len));
                true
            }
            None => false,
        }
    }

    pub fn size_of(&self, address: u32) -> Option<u32> {
        self.used.get(&address).copied()
    }

    pub fn available(&self) -> u32 {
        self.free.iter().map(|(_, len)| *len).sum()
    }

    pub fn largest_free(&self) -> u32 {
        self.free.iter().map(|(_, len)| *len).max().unwrap_or(0)
    }

    fn release(&mut self, (start, len): (u32, u32)) {
        let index = self.free.partition_point(|(addr, _)| *addr < start);
        self.free.insert(index, (start, len));
        if index + 1 < self.free.len() {
            let (next_start, next_len) = self.free[index + 1];
            if start + self.free[index].1 == next_start {
                self.free[index].1 += next_len;
                self.free.remove(index + 1);
            }
        }
        if index > 0 {
            let (prev_start, prev_len) = self.free[index - 1];
            if prev_start + prev_len == self.free[index].0 {
                self.free[index - 1].1 += self.free[index].1;
                self.free.remove(index);
            }
        }
    }
}

/// Bump allocator with mark/reset, used for call frames and `alloca`.
#[derive(Debug, Clone)]
pub struct Arena {
    base: u32,
    end: u32,
    top: u32,
}

impl Arena {
    pub fn new(base: u32, size: u32) -> Self {
        Self {
            base,
            end: base + size,
            top: base,
        }
    }

    pub fn push(&mut self, bytes: u32) -> Option<u32> {
        let start = round_up(self.top, 8);
        let end = start.checked_add(bytes)?;
        if end > self.end {
            return None;
        }
        self.top = end;
        Some(start)
    }

    pub fn mark(&self) -> u32 {
        self.top
    }

    pub fn reset_to(&mut self, mark: u32) {
        self.top = mark.clamp(self.base, self.end);
    }

    pub fn reset(&mut self) {
        self.top = self.base;
    }

    pub fn used(&self) -> u32 {
        self.top - self.base
    }
}

pub fn round_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_ram_rejects_narrow_stores() {
        let mut mem = AddressSpace::new(256, 256);
        assert_eq!(
            mem.write_u8(IRAM_BASE + 1, 7),
            Err(VmError::NarrowInstructionWrite {
                address: IRAM_BASE + 1,
                width: 1
            })
        );
        assert_eq!(
            mem.write_u16(IRAM_BASE, 7),
            Err(VmError::NarrowInstructionWrite {
                address: IRAM_BASE,
                width: 2
            })
        );
        assert_eq!(
            mem.write_u32(IRAM_BASE + 2, 7),
            Err(VmError::MisalignedAccess {
                address: IRAM_BASE + 2,
                width: 4
            })
        );
        mem.write_u32(IRAM_BASE + 4, 0xAABB_CCDD).expect("word store");
        assert_eq!(mem.load_word(IRAM_BASE + 4), Ok(0xAABB_CCDD));
        assert_eq!(mem.iram_word_writes(), 1);
    }

    #[test]
    fn data_ram_is_little_endian_with_bounds() {
        let mut mem = AddressSpace::new(16, 64);
        mem.write_u64(DRAM_BASE + 8, 0x1122_3344_5566_7788)
            .expect("store");
        assert_eq!(mem.read_u32(DRAM_BASE + 8), Ok(0x5566_7788));
        assert_eq!(mem.read_u8(DRAM_BASE + 15), Ok(0x11));
        assert_eq!(
            mem.read_u32(DRAM_BASE + 64),
            Err(VmError::MemoryFault {
                address: DRAM_BASE + 64,
                width: 4
            })
        );
    }

    #[test]
    fn first_fit_reuses_and_coalesces_blocks() {
        let mut heap = FirstFit::new(0x1000, 64, 8);
        let a = heap.alloc(16).expect("a");
        let b = heap.alloc(16).expect("b");
        let c = heap.alloc(32).expect("c");
        assert_eq!((a, b, c), (0x1000, 0x1010, 0x1020));
        assert_eq!(heap.alloc(1), None);

        assert!(heap.free(a));
        assert!(heap.free(b));
        assert_eq!(heap.largest_free(), 32);
        assert_eq!(heap.alloc(24), Some(0x1000));

        assert!(heap.shrink(c, 8));
        assert_eq!(heap.available(), 8 + 24);
        assert!(!heap.free(0x2000));
    }

    #[test]
    fn arena_resets_to_mark() {
        let mut arena = Arena::new(0x100, 64);
        let mark = arena.mark();
        assert_eq!(arena.push(12), Some(0x100));
        assert_eq!(arena.push(8), Some(0x110));
        assert_eq!(arena.push(64), None);
        arena.reset_to(mark);
        assert_eq!(arena.used(), 0);
    }
}
