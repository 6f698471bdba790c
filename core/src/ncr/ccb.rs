//! Command control blocks and their arena

use std::ops::{Index, IndexMut};

use anyhow::{Result, bail};
use log::*;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use serde::Serialize;

use crate::bus::RegisterBus;
use crate::dma::DmaMemory;
use crate::ncr::adapter::Adapter;
use crate::ncr::layout::{ResumeDescriptor, ccb, lcb_slot};
use crate::ncr::lifecycle::{CommandId, ScsiCommand};
use crate::ncr::script::Label;
use crate::scsi::Direction;
use crate::tickable::Ticks;
use crate::types::PhysAddr;

/// No extended error
pub const XE_OK: u8 = 0;
/// Target sent or asked for more data than described
pub const XE_EXTRA_DATA: u8 = 1;
/// Data phase went the wrong direction
pub const XE_BAD_PHASE: u8 = 2;

/// Host status byte in the CCB header, shared with the script.
/// Values with [`HostStatus::DONE_MASK`] set are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum HostStatus {
    Idle = 0,
    Busy = 1,
    Negotiate = 2,
    Disconnect = 3,
    Complete = 0x84,
    SelTimeout = 0x85,
    Reset = 0x86,
    Aborted = 0x87,
    Timeout = 0x88,
    Fail = 0x89,
    Unexpected = 0x8A,
}

impl HostStatus {
    pub const DONE_MASK: u8 = 0x80;

    pub const fn is_done(self) -> bool {
        self as u8 & Self::DONE_MASK != 0
    }
}

/// Negotiation carried by a command
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive, ToPrimitive, Serialize, strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum NegoKind {
    #[default]
    None = 0,
    Sync = 1,
    Wide = 2,
}

pub type CcbIndex = usize;

/// Host side bookkeeping of a CCB. The chip-visible part lives in DMA
/// memory at `phys`.
#[derive(Debug)]
pub struct Ccb {
    pub(crate) index: CcbIndex,
    pub(crate) phys: PhysAddr,
    pub(crate) target: u8,
    pub(crate) lun: u8,
    pub(crate) in_use: bool,
    pub(crate) tag: u8,
    pub(crate) cmd: Option<ScsiCommand>,
    pub(crate) deadline: Ticks,
    pub(crate) direction: Direction,
    pub(crate) segments: usize,
    pub(crate) data_len: u32,
    pub(crate) nego: NegoKind,
    /// Start queue slot the CCB was handed to the chip in
    pub(crate) queued_slot: Option<usize>,
    pub(crate) abort_requested: bool,
    /// Already sent with an ORDERED tag escalation
    pub(crate) escalated: bool,
    /// Bytes the target declared as not transferred (IGNORE WIDE RESIDUE)
    pub(crate) residue_adjust: u32,
}

impl Ccb {
    fn new(index: CcbIndex, phys: PhysAddr, target: u8, lun: u8) -> Self {
        Self {
            index,
            phys,
            target,
            lun,
            in_use: false,
            tag: 0,
            cmd: None,
            deadline: 0,
            direction: Direction::None,
            segments: 0,
            data_len: 0,
            nego: NegoKind::None,
            queued_slot: None,
            abort_requested: false,
            escalated: false,
            residue_adjust: 0,
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::new(self.index, self.phys, self.target, self.lun);
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub(crate) const fn field(&self, offset: u32) -> PhysAddr {
        self.phys + offset
    }

    pub(crate) fn command_id(&self) -> Option<CommandId> {
        self.cmd.as_ref().map(|c| c.id)
    }
}

/// All CCBs ever allocated. Blocks are never freed; a released CCB stays
/// attached to its LUN for reuse.
pub struct CcbArena {
    ccbs: Vec<Ccb>,
    capacity: usize,
    block_size: usize,
}

impl CcbArena {
    pub fn new(capacity: usize, max_scatter: usize) -> Self {
        Self {
            ccbs: Vec::with_capacity(capacity),
            capacity,
            block_size: ccb::block_size(max_scatter),
        }
    }

    pub fn len(&self) -> usize {
        self.ccbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ccbs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ccb> {
        self.ccbs.iter()
    }

    pub fn in_use(&self) -> impl Iterator<Item = &Ccb> {
        self.ccbs.iter().filter(|c| c.in_use)
    }

    /// Allocates a new CCB block, `None` once the arena is at capacity.
    pub(crate) fn allocate(
        &mut self,
        mem: &mut DmaMemory,
        target: u8,
        lun: u8,
    ) -> Result<Option<CcbIndex>> {
        if self.ccbs.len() >= self.capacity {
            return Ok(None);
        }
        let phys = mem.alloc(self.block_size, 16)?;
        let index = self.ccbs.len();
        self.ccbs.push(Ccb::new(index, phys, target, lun));
        Ok(Some(index))
    }

    pub fn find_command(&self, id: CommandId) -> Option<CcbIndex> {
        self.in_use()
            .find(|c| c.command_id() == Some(id))
            .map(|c| c.index)
    }

    /// Maps a DSA value reported by the chip to a CCB
    pub fn lookup_by_dsa(&self, dsa: PhysAddr) -> Option<CcbIndex> {
        self.ccbs.iter().find(|c| c.phys == dsa).map(|c| c.index)
    }
}

impl Index<CcbIndex> for CcbArena {
    type Output = Ccb;

    fn index(&self, index: CcbIndex) -> &Self::Output {
        &self.ccbs[index]
    }
}

impl IndexMut<CcbIndex> for CcbArena {
    fn index_mut(&mut self, index: CcbIndex) -> &mut Self::Output {
        &mut self.ccbs[index]
    }
}

/// Chip-visible state of a CCB as read back by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CcbView {
    pub phys: PhysAddr,
    pub host_status: Option<HostStatus>,
    pub scsi_status: u8,
    pub xerr_status: u8,
    pub tag: u8,
    pub launch: PhysAddr,
    pub savep: PhysAddr,
    pub lastp: PhysAddr,
    pub goalp: PhysAddr,
    pub resume: [ResumeDescriptor; 2],
}

impl<C: RegisterBus> Adapter<C> {
    pub(crate) fn host_status(&self, idx: CcbIndex) -> Result<HostStatus> {
        let raw = self
            .mem
            .read_u8(self.ccbs[idx].field(ccb::HOST_STATUS))?;
        match HostStatus::from_u8(raw) {
            Some(hs) => Ok(hs),
            None => bail!("CCB {:#010X}: invalid host status {:#04X}", self.ccbs[idx].phys, raw),
        }
    }

    pub(crate) fn set_host_status(&mut self, idx: CcbIndex, hs: HostStatus) -> Result<()> {
        let at = self.ccbs[idx].field(ccb::HOST_STATUS);
        self.mem.write_u8(at, hs as u8)
    }

    /// Takes a free CCB of the LUN together with one unit of its credit.
    /// `None` if the LUN has no credit left or no CCB can be had.
    pub(crate) fn acquire_ccb(&mut self, target: u8, lun: u8) -> Result<Option<CcbIndex>> {
        self.ensure_lcb(target, lun)?;
        let Some(lcb) = self.targets[usize::from(target)].lcbs[usize::from(lun)].as_mut() else {
            bail!("LCB {}:{} missing", target, lun);
        };
        if !lcb.has_credit() {
            return Ok(None);
        }
        let idx = match lcb.ccbs.iter().copied().find(|&i| !self.ccbs[i].in_use) {
            Some(i) => i,
            None => match self.ccbs.allocate(&mut self.mem, target, lun)? {
                Some(i) => {
                    lcb.ccbs.push(i);
                    i
                }
                None => return Ok(None),
            },
        };
        let Some(tag) = lcb.alloc_tag() else {
            return Ok(None);
        };
        lcb.take_credit();

        let c = &mut self.ccbs[idx];
        c.in_use = true;
        c.tag = tag;
        Ok(Some(idx))
    }

    /// Returns a CCB to its LUN. Clears its reselect table entry, takes it
    /// out of the start queue if the chip did not get to it yet and parks
    /// the header at IDLE.
    pub(crate) fn release_ccb(&mut self, idx: CcbIndex) -> Result<()> {
        let (phys, target, lun, tag, slot) = {
            let c = &self.ccbs[idx];
            if !c.in_use {
                bail!("Releasing free CCB {:#010X}", c.phys);
            }
            (c.phys, c.target, c.lun, c.tag, c.queued_slot)
        };
        let skip = self.script.addr(Label::Skip);

        if let Some(slot) = slot {
            if self.slot_pending(slot, phys)? {
                self.mem.write_u32(self.script.slot_operand(slot), skip)?;
            }
        }

        let Some(lcb) = self.targets[usize::from(target)].lcbs[usize::from(lun)].as_mut() else {
            bail!("CCB {:#010X} without LCB", phys);
        };
        let entry = lcb.phys + lcb_slot(tag);
        if self.mem.read_u32(entry)? == phys {
            self.mem.write_u32(entry, 0)?;
        }
        lcb.free_tag(tag);
        lcb.return_credit();

        self.mem.write_u32(phys + ccb::LAUNCH_ADDR, skip)?;
        self.mem.write_u8(phys + ccb::HOST_STATUS, HostStatus::Idle as u8)?;
        self.ccbs[idx].clear();
        Ok(())
    }

    pub(crate) fn lookup_by_dsa(&self, dsa: PhysAddr) -> Option<CcbIndex> {
        let found = self.ccbs.lookup_by_dsa(dsa);
        if found.is_none() {
            warn!("{}: DSA {:#010X} matches no CCB", self.name, dsa);
        }
        found
    }

    /// Reads back the chip-visible part of the CCB running a command
    pub fn ccb_view(&self, id: CommandId) -> Result<Option<CcbView>> {
        let Some(idx) = self.ccbs.find_command(id) else {
            return Ok(None);
        };
        let p = self.ccbs[idx].phys;
        let m = &self.mem;
        Ok(Some(CcbView {
            phys: p,
            host_status: HostStatus::from_u8(m.read_u8(p + ccb::HOST_STATUS)?),
            scsi_status: m.read_u8(p + ccb::SCSI_STATUS)?,
            xerr_status: m.read_u8(p + ccb::XERR_STATUS)?,
            tag: m.read_u8(p + ccb::TAG)?,
            launch: m.read_u32(p + ccb::LAUNCH_ADDR)?,
            savep: m.read_u32(p + ccb::SAVEP)?,
            lastp: m.read_u32(p + ccb::LASTP)?,
            goalp: m.read_u32(p + ccb::GOALP)?,
            resume: [
                ResumeDescriptor::read(m, p + ccb::RESUME[0])?,
                ResumeDescriptor::read(m, p + ccb::RESUME[1])?,
            ],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_statuses() {
        assert!(!HostStatus::Busy.is_done());
        assert!(!HostStatus::Disconnect.is_done());
        assert!(HostStatus::Complete.is_done());
        assert!(HostStatus::Unexpected.is_done());
        assert_eq!(HostStatus::from_u8(0x85), Some(HostStatus::SelTimeout));
        assert_eq!(HostStatus::from_u8(0x05), None);
    }

    #[test]
    fn arena_capacity_and_lookup() {
        let mut mem = DmaMemory::new(0x10_0000, 0x1000);
        let mut arena = CcbArena::new(2, 4);
        let a = arena.allocate(&mut mem, 1, 0).unwrap().unwrap();
        let b = arena.allocate(&mut mem, 1, 1).unwrap().unwrap();
        assert!(arena.allocate(&mut mem, 2, 0).unwrap().is_none());
        assert_eq!(arena.len(), 2);
        assert_eq!(arena[b].phys - arena[a].phys, ccb::block_size(4) as u32);
        assert_eq!(arena.lookup_by_dsa(arena[b].phys), Some(b));
        assert_eq!(arena.lookup_by_dsa(arena[b].phys + 4), None);
        assert_eq!(arena.in_use().count(), 0);
    }
}
