use crate::memory::WordStore;

use super::JitFailure;
use crate::xtensa::encode;

/// Append-only code buffer over word-store-only instruction memory.
///
/// Bytes accumulate in `pending` until a word fills up; only then is the word
/// stored. A forced flush stores the partial word merged with whatever the
/// rest of that word already holds in memory, and later appends keep
/// accumulating into the same word. No store narrower than 32 bits is ever
/// issued.
pub struct CodeEmitter<'a, S: WordStore + ?Sized> {
    store: &'a mut S,
    base: u32,
    capacity: u32,
    len: u32,
    pending: u32,
    word_stores: u64,
}

impl<'a, S: WordStore + ?Sized> CodeEmitter<'a, S> {
    /// `base` must be word aligned.
    pub fn new(store: &'a mut S, base: u32, capacity: u32) -> Self {
        Self {
            store,
            base,
            capacity,
            len: 0,
            pending: 0,
            word_stores: 0,
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Offset of the next byte, relative to `base`.
    pub fn position(&self) -> u32 {
        self.len
    }

    pub fn address(&self) -> u32 {
        self.base + self.len
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn word_stores(&self) -> u64 {
        self.word_stores
    }

    fn pending_bytes(&self) -> u32 {
        self.len & 3
    }

    fn current_word_offset(&self) -> u32 {
        self.len & !3
    }

    fn ensure_room(&self, bytes: u32) -> Result<(), JitFailure> {
        if self.len + bytes > self.capacity {
            return Err(JitFailure::CodeBufferExhausted {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn store_word(&mut self, offset: u32, word: u32) -> Result<(), JitFailure> {
        let address = self.base + offset;
        self.store
            .store_word(address, word)
            .map_err(|_| JitFailure::InstructionMemory { address })?;
        self.word_stores += 1;
        Ok(())
    }

    fn load_word(&self, offset: u32) -> Result<u32, JitFailure> {
        let address = self.base + offset;
        self.store
            .load_word(address)
            .map_err(|_| JitFailure::InstructionMemory { address })
    }

    pub fn emit_u8(&mut self, byte: u8) -> Result<(), JitFailure> {
        self.ensure_room(1)?;
        let shift = self.pending_bytes() * 8;
        self.pending = (self.pending & !(0xFF << shift)) | ((byte as u32) << shift);
        self.len += 1;
        if self.pending_bytes() == 0 {
            let offset = self.len - 4;
            let word = self.pending;
            self.store_word(offset, word)?;
            self.pending = 0;
        }
        Ok(())
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) -> Result<(), JitFailure> {
        self.ensure_room(bytes.len() as u32)?;
        for byte in bytes {
            self.emit_u8(*byte)?;
        }
        Ok(())
    }

    /// Appends one 24-bit instruction.
    pub fn emit_insn(&mut self, insn: u32) -> Result<(), JitFailure> {
        self.emit_bytes(&encode::bytes(insn))
    }

    /// Appends a full word. The position must be word aligned.
    pub fn emit_word(&mut self, word: u32) -> Result<(), JitFailure> {
        if self.pending_bytes() != 0 {
            return self.emit_bytes(&word.to_le_bytes());
        }
        self.ensure_room(4)?;
        let offset = self.len;
        self.store_word(offset, word)?;
        self.len += 4;
        Ok(())
    }

    /// Pads with zero bytes up to the next word boundary.
    pub fn align_word(&mut self) -> Result<(), JitFailure> {
        while self.pending_bytes() != 0 {
            self.emit_u8(0)?;
        }
        Ok(())
    }

    /// Stores the partially filled word, keeping the bytes memory already
    /// holds past the current position.
    pub fn force_flush(&mut self) -> Result<(), JitFailure> {
        let filled = self.pending_bytes();
        if filled == 0 {
            return Ok(());
        }
        let offset = self.current_word_offset();
        let keep_mask = u32::MAX << (filled * 8);
        let merged = (self.load_word(offset)? & keep_mask) | (self.pending & !keep_mask);
        self.store_word(offset, merged)
    }

    pub fn read_byte(&self, at: u32) -> Result<u8, JitFailure> {
        if at >= self.len {
            return Err(JitFailure::CodeBufferExhausted {
                capacity: self.capacity,
            });
        }
        let shift = (at & 3) * 8;
        if at >= self.current_word_offset() {
            return Ok((self.pending >> shift) as u8);
        }
        Ok((self.load_word(at & !3)? >> shift) as u8)
    }

    /// Rewrites one already emitted byte. Bytes in the word still being
    /// filled are updated in place; committed words go through a
    /// read-modify-write of the whole word.
    pub fn patch_byte(&mut self, at: u32, byte: u8) -> Result<(), JitFailure> {
        if at >= self.len {
            return Err(JitFailure::CodeBufferExhausted {
                capacity: self.capacity,
            });
        }
        let shift = (at & 3) * 8;
        let mask = 0xFFu32 << shift;
        if at >= self.current_word_offset() {
            self.pending = (self.pending & !mask) | ((byte as u32) << shift);
            return Ok(());
        }
        let offset = at & !3;
        let word = (self.load_word(offset)? & !mask) | ((byte as u32) << shift);
        self.store_word(offset, word)
    }

    pub fn patch_insn(&mut self, at: u32, insn: u32) -> Result<(), JitFailure> {
        for (i, byte) in encode::bytes(insn).into_iter().enumerate() {
            self.patch_byte(at + i as u32, byte)?;
        }
        Ok(())
    }

    pub fn read_insn(&self, at: u32) -> Result<u32, JitFailure> {
        let mut insn = 0u32;
        for i in 0..3 {
            insn |= (self.read_byte(at + i)? as u32) << (i * 8);
        }
        Ok(insn)
    }

    /// Flushes the tail and returns the number of bytes emitted.
    pub fn finish(mut self) -> Result<u32, JitFailure> {
        self.force_flush()?;
        Ok(self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{VmError, VmResult};

    /// Instruction memory stand-in that records every store.
    struct RecordingStore {
        words: Vec<u32>,
        stores: Vec<(u32, u32)>,
    }

    impl RecordingStore {
        fn new(words: usize) -> Self {
            Self {
                words: vec![0xCCCC_CCCC; words],
                stores: Vec::new(),
            }
        }
    }

    impl WordStore for RecordingStore {
        fn load_word(&self, address: u32) -> VmResult<u32> {
            self.words
                .get((address / 4) as usize)
                .copied()
                .ok_or(VmError::MemoryFault { address, width: 4 })
        }

        fn store_word(&mut self, address: u32, word: u32) -> VmResult<()> {
            if address & 3 != 0 {
                return Err(VmError::MisalignedAccess { address, width: 4 });
            }
            let slot = self
                .words
                .get_mut((address / 4) as usize)
                .ok_or(VmError::MemoryFault { address, width: 4 })?;
            *slot = word;
            self.stores.push((address, word));
            Ok(())
        }
    }

    #[test]
    fn full_words_are_stored_as_they_fill() {
        let mut store = RecordingStore::new(4);
        let mut em = CodeEmitter::new(&mut store, 0, 16);
        em.emit_bytes(&[1, 2, 3]).expect("emit");
        assert_eq!(em.word_stores(), 0);
        em.emit_bytes(&[4, 5]).expect("emit");
        assert_eq!(em.finish(), Ok(5));
        assert_eq!(store.words[0], 0x0403_0201);
        // The tail word keeps the bytes memory held past the position.
        assert_eq!(store.words[1], 0xCCCC_CC05);
        assert_eq!(store.stores.len(), 2);
    }

    #[test]
    fn mid_stream_flush_does_not_corrupt_earlier_bytes() {
        let mut store = RecordingStore::new(4);
        let mut em = CodeEmitter::new(&mut store, 0, 16);
        em.emit_bytes(&[0xA1, 0xA2]).expect("emit");
        em.force_flush().expect("flush");
        em.emit_bytes(&[0xA3]).expect("emit");
        em.force_flush().expect("flush");
        em.emit_bytes(&[0xA4, 0xB1]).expect("emit");
        em.finish().expect("finish");
        assert_eq!(store.words[0], 0xA4A3_A2A1);
        assert_eq!(store.words[1], 0xCCCC_CCB1);
    }

    #[test]
    fn patches_reach_committed_and_pending_bytes() {
        let mut store = RecordingStore::new(4);
        let mut em = CodeEmitter::new(&mut store, 0, 16);
        em.emit_bytes(&[1, 2, 3, 4, 5, 6]).expect("emit");
        em.patch_byte(1, 0x22).expect("committed");
        em.patch_byte(5, 0x66).expect("pending");
        assert_eq!(em.read_byte(1), Ok(0x22));
        assert_eq!(em.read_byte(5), Ok(0x66));
        assert!(em.patch_byte(6, 0).is_err());
        em.finish().expect("finish");
        assert_eq!(store.words[0], 0x0403_2201);
        assert_eq!(store.words[1] & 0xFFFF, 0x6605);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut store = RecordingStore::new(2);
        let mut em = CodeEmitter::new(&mut store, 0, 6);
        em.emit_insn(encode::nop()).expect("first");
        em.emit_insn(encode::nop()).expect("second");
        assert_eq!(
            em.emit_insn(encode::nop()),
            Err(JitFailure::CodeBufferExhausted { capacity: 6 })
        );
    }

    #[test]
    fn unaligned_word_emission_falls_back_to_bytes() {
        let mut store = RecordingStore::new(4);
        let mut em = CodeEmitter::new(&mut store, 0, 16);
        em.emit_insn(encode::nop()).expect("nop");
        em.align_word().expect("align");
        em.emit_word(0xDEAD_BEEF).expect("word");
        assert_eq!(em.position(), 8);
        em.finish().expect("finish");
        assert_eq!(store.words[1], 0xDEAD_BEEF);
        assert!(store.stores.iter().all(|(address, _)| address % 4 == 0));
    }
}
