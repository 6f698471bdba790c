//! Layout of the control structures shared with the chip
//!
//! Everything here is little-endian and lives in [`DmaMemory`]. The host
//! writes through the posted view and fences before handing anything to the
//! chip; the chip reads and writes through the device view.

use anyhow::Result;
use serde::Serialize;

use crate::dma::DmaMemory;
use crate::ncr::script::{KVAR_COUNT, SCR_JUMP};
use crate::ncr::{MAX_LUN, MAX_TAGS, MAX_TARGET};
use crate::types::PhysAddr;

/// Start queue position, written by the chip as it walks the try loop
pub const NCB_STARTPOS: u32 = 0x00;
/// Next done queue slot the chip writes to
pub const NCB_DONE_PUT: u32 = 0x04;
/// Non-zero while a CCB waits for its autosense to be restarted
pub const NCB_RESTART_TRAP: u32 = 0x08;
/// Bit bucket for status bytes and surplus data
pub const NCB_SCRATCH: u32 = 0x0C;
pub const NCB_KVARS: u32 = 0x10;
/// Message buffer for negotiation answers sent by the host
pub const NCB_MSGOUT: u32 = NCB_KVARS + 4 * KVAR_COUNT as u32 + 4;
/// Message buffer for extended messages received from a target
pub const NCB_MSGIN: u32 = NCB_MSGOUT + 8;
/// Reselect lookup: one LCB table address per target/LUN
pub const NCB_LUN_TABLE: u32 = NCB_MSGIN + 8;
pub const NCB_DONE_QUEUE: u32 = NCB_LUN_TABLE + 4 * (MAX_TARGET * MAX_LUN) as u32;

/// Adapter-wide control block
#[derive(Debug, Clone, Copy)]
pub struct NcbLayout {
    pub base: PhysAddr,
    pub done_slots: usize,
}

impl NcbLayout {
    pub const fn size(done_slots: usize) -> usize {
        NCB_DONE_QUEUE as usize + 4 * done_slots
    }

    pub const fn startpos(&self) -> PhysAddr {
        self.base + NCB_STARTPOS
    }

    pub const fn done_put(&self) -> PhysAddr {
        self.base + NCB_DONE_PUT
    }

    pub const fn restart_trap(&self) -> PhysAddr {
        self.base + NCB_RESTART_TRAP
    }

    pub const fn scratch(&self) -> PhysAddr {
        self.base + NCB_SCRATCH
    }

    pub const fn kvar(&self, index: usize) -> PhysAddr {
        self.base + NCB_KVARS + 4 * index as u32
    }

    pub const fn msgout(&self) -> PhysAddr {
        self.base + NCB_MSGOUT
    }

    pub const fn msgin(&self) -> PhysAddr {
        self.base + NCB_MSGIN
    }

    pub const fn lun_entry(&self, target: u8, lun: u8) -> PhysAddr {
        self.base + NCB_LUN_TABLE + 4 * (target as u32 * MAX_LUN as u32 + lun as u32)
    }

    pub const fn done_slot(&self, slot: usize) -> PhysAddr {
        self.base + NCB_DONE_QUEUE + 4 * slot as u32
    }
}

/// Offsets within a CCB block
pub mod ccb {
    /// JUMP opcode executed when the try loop CALLs the CCB
    pub const LAUNCH_CMD: u32 = 0x00;
    /// Target of the launch jump: `select`, or `skip` once neutralized
    pub const LAUNCH_ADDR: u32 = 0x04;
    pub const SAVEP: u32 = 0x08;
    pub const LASTP: u32 = 0x0C;
    pub const GOALP: u32 = 0x10;
    pub const HOST_STATUS: u32 = 0x14;
    pub const SCSI_STATUS: u32 = 0x15;
    pub const PARITY_STATUS: u32 = 0x16;
    pub const XERR_STATUS: u32 = 0x17;
    pub const NEGO_STATUS: u32 = 0x18;
    pub const TAG: u32 = 0x19;
    pub const LUN: u32 = 0x1A;
    /// SELECT table: reserved, SXFER, target id, SCNTL3
    pub const SELECT: u32 = 0x1C;
    pub const SMSG_TBL: u32 = 0x20;
    pub const CMD_TBL: u32 = 0x28;
    /// Tick counter sampled when the CCB was selected
    pub const STAMP: u32 = 0x30;
    pub const RESUME: [u32; 2] = [0x40, 0x50];
    pub const MSGOUT: u32 = 0x60;
    pub const MSGOUT_LEN: usize = 16;
    pub const CDB: u32 = 0x70;
    pub const SENSE: u32 = 0x80;
    pub const SENSE_LEN: usize = 32;
    pub const SENSE_CDB: u32 = 0xA0;
    pub const SENSE_CMD_TBL: u32 = 0xA8;
    pub const SENSE_TBL: u32 = 0xB0;
    pub const DATA_TBL: u32 = 0xB8;

    pub const fn block_size(max_scatter: usize) -> usize {
        (DATA_TBL as usize + 8 * max_scatter + 15) & !15
    }

    pub const fn data_entry(index: usize) -> u32 {
        DATA_TBL + 8 * index as u32
    }
}

/// Byte size of a LUN's reselect table: untagged entry plus one per tag
pub const LCB_TABLE_SIZE: usize = 4 * (MAX_TAGS + 1);

/// Offset of a tag's entry in the reselect table, tag 0 is the untagged nexus
pub const fn lcb_slot(tag: u8) -> u32 {
    4 * tag as u32
}

/// Table indirect move entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ScatterEntry {
    pub len: u32,
    pub addr: PhysAddr,
}

impl ScatterEntry {
    pub fn write(&self, mem: &mut DmaMemory, at: PhysAddr) -> Result<()> {
        mem.write_u32(at, self.len)?;
        mem.write_u32(at + 4, self.addr)
    }

    pub fn read(mem: &DmaMemory, at: PhysAddr) -> Result<Self> {
        Ok(Self {
            len: mem.read_u32(at)?,
            addr: mem.read_u32(at + 4)?,
        })
    }

    pub fn dev_read(mem: &DmaMemory, at: PhysAddr) -> Result<Self> {
        Ok(Self {
            len: mem.dev_read_u32(at)? & 0x00FF_FFFF,
            addr: mem.dev_read_u32(at + 4)?,
        })
    }
}

/// Script fragment built by the host to finish a partially moved entry:
/// a direct MOVE of the untransferred bytes followed by a JUMP to the
/// instruction that was next in line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ResumeDescriptor {
    /// MOVE opcode byte, carries the data phase
    pub opcode: u8,
    pub remaining: u32,
    pub addr: PhysAddr,
    pub next: PhysAddr,
}

impl ResumeDescriptor {
    pub const SIZE: u32 = 16;

    pub fn write(&self, mem: &mut DmaMemory, at: PhysAddr) -> Result<()> {
        mem.write_u32(at, (u32::from(self.opcode) << 24) | (self.remaining & 0x00FF_FFFF))?;
        mem.write_u32(at + 4, self.addr)?;
        mem.write_u32(at + 8, SCR_JUMP)?;
        mem.write_u32(at + 12, self.next)
    }

    fn decode(words: [u32; 4]) -> Self {
        Self {
            opcode: (words[0] >> 24) as u8,
            remaining: words[0] & 0x00FF_FFFF,
            addr: words[1],
            next: words[3],
        }
    }

    pub fn read(mem: &DmaMemory, at: PhysAddr) -> Result<Self> {
        Ok(Self::decode([
            mem.read_u32(at)?,
            mem.read_u32(at + 4)?,
            mem.read_u32(at + 8)?,
            mem.read_u32(at + 12)?,
        ]))
    }

    pub fn dev_read(mem: &DmaMemory, at: PhysAddr) -> Result<Self> {
        Ok(Self::decode([
            mem.dev_read_u32(at)?,
            mem.dev_read_u32(at + 4)?,
            mem.dev_read_u32(at + 8)?,
            mem.dev_read_u32(at + 12)?,
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ncb_regions_do_not_overlap() {
        let ncb = NcbLayout {
            base: 0x1000,
            done_slots: 65,
        };
        assert!(ncb.kvar(KVAR_COUNT - 1) < ncb.msgout());
        assert!(ncb.msgin() + 8 <= ncb.lun_entry(0, 0));
        assert_eq!(ncb.lun_entry(15, 7) + 4, ncb.done_slot(0));
        assert_eq!(
            ncb.done_slot(64) + 4,
            ncb.base + NcbLayout::size(65) as u32
        );
    }

    #[test]
    fn ccb_block_is_aligned() {
        assert_eq!(ccb::block_size(17) % 16, 0);
        assert!(ccb::block_size(17) >= ccb::data_entry(17) as usize);
        assert!(ccb::RESUME[1] + ResumeDescriptor::SIZE <= ccb::MSGOUT);
        assert!(ccb::SENSE + ccb::SENSE_LEN as u32 <= ccb::SENSE_CDB);
    }

    #[test]
    fn resume_descriptor_layout() {
        let mut mem = DmaMemory::new(0, 0x100);
        let d = ResumeDescriptor {
            opcode: 0x01,
            remaining: 37,
            addr: 0x2000,
            next: 0x3000,
        };
        d.write(&mut mem, 0x40).unwrap();
        mem.fence();
        assert_eq!(mem.dev_read_u32(0x40).unwrap(), 0x0100_0025);
        assert_eq!(mem.dev_read_u32(0x48).unwrap(), SCR_JUMP);
        assert_eq!(ResumeDescriptor::dev_read(&mem, 0x40).unwrap(), d);
    }
}
