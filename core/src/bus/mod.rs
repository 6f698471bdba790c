pub mod testbus;

use crate::types::{Byte, Long, Word};

/// Offset of a register within the chip's register window
pub type RegOffset = u8;

/// Register access to a memory-mapped peripheral.
///
/// Reads can have side effects (e.g. interrupt status registers clear on
/// read), so every access takes `&mut self`. Multi-byte accesses are
/// little-endian and are composed from byte accesses unless an
/// implementation overrides them.
pub trait RegisterBus {
    fn read8(&mut self, reg: RegOffset) -> Byte;
    fn write8(&mut self, reg: RegOffset, val: Byte);

    fn read16(&mut self, reg: RegOffset) -> Word {
        Word::from_le_bytes([self.read8(reg), self.read8(reg.wrapping_add(1))])
    }

    fn write16(&mut self, reg: RegOffset, val: Word) {
        for (i, b) in val.to_le_bytes().into_iter().enumerate() {
            self.write8(reg.wrapping_add(i as u8), b);
        }
    }

    fn read32(&mut self, reg: RegOffset) -> Long {
        let mut bytes = [0; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.read8(reg.wrapping_add(i as u8));
        }
        Long::from_le_bytes(bytes)
    }

    fn write32(&mut self, reg: RegOffset, val: Long) {
        for (i, b) in val.to_le_bytes().into_iter().enumerate() {
            self.write8(reg.wrapping_add(i as u8), b);
        }
    }
}

impl core::fmt::Debug for dyn RegisterBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "RegisterBus")
    }
}
