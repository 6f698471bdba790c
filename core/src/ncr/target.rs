//! Target and logical unit control blocks

use std::collections::VecDeque;

use anyhow::{Result, bail};
use log::*;
use serde::Serialize;

use crate::bus::RegisterBus;
use crate::ncr::adapter::Adapter;
use crate::ncr::ccb::{CcbIndex, NegoKind};
use crate::ncr::config::{AdapterConfig, Quirks};
use crate::ncr::layout::LCB_TABLE_SIZE;
use crate::ncr::{MAX_LUN, MAX_TAGS, MAX_TARGET};
use crate::scsi::{INQ7_CMDQUE, INQ7_SYNC, INQ7_WBUS16};
use crate::types::PhysAddr;

/// Negotiated transfer agreement with a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TransferParams {
    /// Synchronous period factor, 0 when asynchronous
    pub period: u8,
    /// Synchronous REQ/ACK offset, 0 when asynchronous
    pub offset: u8,
    /// Width exponent, 0 = 8 bit, 1 = 16 bit
    pub width: u8,
}

/// Queue credit of a logical unit.
///
/// `active + openings == reqlink` holds at all times. Lowering the depth
/// while more commands are active than the new depth allows is done lazily:
/// returned credit is swallowed until `reqlink` reaches the wanted depth.
#[derive(Debug)]
pub struct Lcb {
    /// Reselect table: untagged nexus followed by one entry per tag
    pub(crate) phys: PhysAddr,
    pub(crate) ccbs: Vec<CcbIndex>,
    pub(crate) active: u8,
    pub(crate) openings: u8,
    pub(crate) reqlink: u8,
    wanted: u8,
    pub(crate) maxtags: u8,
    pub(crate) usetags: bool,
    free_tags: VecDeque<u8>,
    /// Good completions since the last change of depth
    pub(crate) num_good: u32,
    pub(crate) force_ordered: bool,
    pub(crate) queue_full_events: u32,
}

impl Lcb {
    pub(crate) fn new(phys: PhysAddr) -> Self {
        Self {
            phys,
            ccbs: vec![],
            active: 0,
            openings: 1,
            reqlink: 1,
            wanted: 1,
            maxtags: 1,
            usetags: false,
            free_tags: (1..=MAX_TAGS as u8).collect(),
            num_good: 0,
            force_ordered: false,
            queue_full_events: 0,
        }
    }

    pub fn depth(&self) -> u8 {
        self.reqlink
    }

    pub(crate) fn has_credit(&self) -> bool {
        self.openings > 0
    }

    pub(crate) fn take_credit(&mut self) {
        debug_assert!(self.openings > 0);
        self.openings -= 1;
        self.active += 1;
    }

    pub(crate) fn return_credit(&mut self) {
        debug_assert!(self.active > 0);
        self.active -= 1;
        if self.reqlink > self.wanted {
            self.reqlink -= 1;
        } else {
            self.openings += 1;
        }
    }

    /// Moves the queue depth towards `want`, at once as far as free credit allows.
    pub(crate) fn set_depth(&mut self, want: u8) {
        let want = want.max(1);
        self.wanted = want;
        while self.reqlink > want && self.openings > 0 {
            self.reqlink -= 1;
            self.openings -= 1;
        }
        if want > self.reqlink {
            self.openings += want - self.reqlink;
            self.reqlink = want;
        }
    }

    /// Enables or disables tagged queueing with the given ceiling.
    pub(crate) fn setup_tags(&mut self, usetags: bool, maxtags: u8) {
        self.usetags = usetags && maxtags > 1;
        self.maxtags = if self.usetags { maxtags } else { 1 };
        self.num_good = 0;
        self.set_depth(self.maxtags);
    }

    pub(crate) fn alloc_tag(&mut self) -> Option<u8> {
        if !self.usetags {
            return Some(0);
        }
        self.free_tags.pop_front()
    }

    pub(crate) fn free_tag(&mut self, tag: u8) {
        if tag != 0 {
            self.free_tags.push_back(tag);
        }
    }

    /// Target reported QUEUE FULL, shrinks the depth by one.
    /// Returns the new depth if it changed.
    pub(crate) fn queue_full(&mut self) -> Option<u8> {
        self.queue_full_events += 1;
        self.num_good = 0;
        if self.wanted <= 1 {
            return None;
        }
        self.set_depth(self.wanted - 1);
        Some(self.wanted)
    }

    /// Counts a good completion, grows the depth back after `recovery` of them.
    /// Returns the new depth if it changed.
    pub(crate) fn success(&mut self, recovery: u32) -> Option<u8> {
        self.num_good += 1;
        if self.num_good < recovery || self.wanted >= self.maxtags {
            return None;
        }
        self.num_good = 0;
        self.set_depth(self.wanted + 1);
        Some(self.wanted)
    }

    pub(crate) fn outstanding_tags(&self) -> usize {
        MAX_TAGS - self.free_tags.len()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TargetStats {
    pub commands: u64,
    pub bytes: u64,
}

pub struct Tcb {
    pub(crate) id: u8,
    /// Smallest period factor the user allows, 0 for asynchronous only
    pub(crate) usrsync: u8,
    pub(crate) usrwide: u8,
    pub(crate) usrtags: u8,
    pub(crate) quirks: Quirks,
    pub(crate) no_disconnect: bool,
    pub(crate) no_scan: bool,
    pub(crate) trace: bool,
    /// First bytes of the target's standard INQUIRY data
    pub(crate) inquiry: Option<[u8; 8]>,
    pub(crate) params: TransferParams,
    pub(crate) sxfer: u8,
    pub(crate) scntl3: u8,
    pub(crate) sync_done: bool,
    pub(crate) wide_done: bool,
    /// Negotiation in flight and the CCB that carries it
    pub(crate) nego: NegoKind,
    pub(crate) nego_ccb: Option<CcbIndex>,
    /// CCB waiting for its autosense to be restarted
    pub(crate) hold_ccb: Option<CcbIndex>,
    pub(crate) lcbs: [Option<Lcb>; MAX_LUN],
    pub(crate) stats: TargetStats,
}

impl Tcb {
    pub(crate) fn new(id: u8, config: &AdapterConfig, async_scntl3: u8) -> Self {
        let tc = config.target(id).cloned().unwrap_or_default();
        let no_message = tc.quirks.no_message;
        let mut tcb = Self {
            id,
            usrsync: tc.sync_period.unwrap_or(config.min_sync),
            usrwide: if config.wide {
                tc.wide.unwrap_or(1)
            } else {
                0
            },
            usrtags: if no_message {
                1
            } else {
                tc.tags.unwrap_or(config.default_tags)
            },
            quirks: tc.quirks,
            no_disconnect: tc.no_disconnect || no_message || !config.disconnect,
            no_scan: tc.no_scan,
            trace: tc.trace,
            inquiry: None,
            params: TransferParams::default(),
            sxfer: 0,
            scntl3: 0,
            sync_done: false,
            wide_done: false,
            nego: NegoKind::None,
            nego_ccb: None,
            hold_ccb: None,
            lcbs: Default::default(),
            stats: TargetStats::default(),
        };
        tcb.reset_transfer(async_scntl3);
        tcb
    }

    /// Drops back to asynchronous narrow transfers, to be renegotiated.
    pub(crate) fn reset_transfer(&mut self, async_scntl3: u8) {
        self.params = TransferParams::default();
        self.sxfer = 0;
        self.scntl3 = async_scntl3;
        self.sync_done = !self.wants_sync();
        self.wide_done = !self.wants_wide();
        self.nego = NegoKind::None;
        self.nego_ccb = None;
        self.hold_ccb = None;
    }

    /// Synchronous transfers are possible as far as quirks and INQUIRY data tell
    pub(crate) fn sync_capable(&self) -> bool {
        !self.quirks.no_sync
            && !self.quirks.no_message
            && (self.inquiry.is_none() || self.supports(INQ7_SYNC))
    }

    pub(crate) fn wide_capable(&self) -> bool {
        !self.quirks.no_wide16
            && !self.quirks.no_message
            && (self.inquiry.is_none() || self.supports(INQ7_WBUS16))
    }

    pub(crate) fn wants_sync(&self) -> bool {
        self.usrsync != 0 && self.sync_capable()
    }

    pub(crate) fn wants_wide(&self) -> bool {
        self.usrwide != 0 && self.wide_capable()
    }

    pub(crate) fn supports(&self, inq7_bit: u8) -> bool {
        self.inquiry.is_some_and(|inq| inq[7] & inq7_bit != 0)
    }

    pub(crate) fn wants_tags(&self) -> bool {
        self.usrtags > 1 && !self.quirks.no_message && self.supports(INQ7_CMDQUE)
    }

    /// Applies the capabilities announced in INQUIRY data. LUNs keep their
    /// current depth unless tagged queueing was switched on or off.
    pub(crate) fn set_inquiry(&mut self, inq: [u8; 8]) {
        self.inquiry = Some(inq);
        self.sync_done |= !self.sync_capable();
        self.wide_done |= !self.wide_capable();
        let tags = self.wants_tags();
        for lcb in self.lcbs.iter_mut().flatten().filter(|l| l.usetags != tags) {
            lcb.setup_tags(tags, self.usrtags);
        }
    }

    pub fn params(&self) -> TransferParams {
        self.params
    }
}

/// Snapshot of a logical unit's credit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LunCredit {
    pub reqlink: u8,
    pub active: u8,
    pub openings: u8,
    pub maxtags: u8,
    pub tagged: bool,
    pub num_good: u32,
    pub queue_full_events: u32,
}

impl<C: RegisterBus> Adapter<C> {
    /// Returns the LCB of a target/LUN, creating it and its reselect table
    /// on first use.
    pub(crate) fn ensure_lcb(&mut self, target: u8, lun: u8) -> Result<&mut Lcb> {
        if usize::from(target) >= MAX_TARGET || usize::from(lun) >= MAX_LUN {
            bail!("No such nexus {}:{}", target, lun);
        }
        let tcb = &mut self.targets[usize::from(target)];
        if tcb.lcbs[usize::from(lun)].is_none() {
            let phys = self.mem.alloc(LCB_TABLE_SIZE, 16)?;
            self.mem
                .write_u32(self.ncb.lun_entry(target, lun), phys)?;
            let mut lcb = Lcb::new(phys);
            if tcb.inquiry.is_some() {
                lcb.setup_tags(tcb.wants_tags(), tcb.usrtags);
            }
            debug!(
                "{}: target {} lun {}: reselect table at {:#010X}",
                self.name, target, lun, phys
            );
            tcb.lcbs[usize::from(lun)] = Some(lcb);
        }
        match tcb.lcbs[usize::from(lun)].as_mut() {
            Some(lcb) => Ok(lcb),
            None => bail!("LCB {}:{} vanished", target, lun),
        }
    }

    pub(crate) fn lcb(&self, target: u8, lun: u8) -> Option<&Lcb> {
        self.targets
            .get(usize::from(target))?
            .lcbs
            .get(usize::from(lun))?
            .as_ref()
    }

    pub(crate) fn lcb_mut(&mut self, target: u8, lun: u8) -> Option<&mut Lcb> {
        self.targets
            .get_mut(usize::from(target))?
            .lcbs
            .get_mut(usize::from(lun))?
            .as_mut()
    }

    /// Current credit of a logical unit, if it was ever addressed
    pub fn lun_credit(&self, target: u8, lun: u8) -> Option<LunCredit> {
        self.lcb(target, lun).map(|l| LunCredit {
            reqlink: l.reqlink,
            active: l.active,
            openings: l.openings,
            maxtags: l.maxtags,
            tagged: l.usetags,
            num_good: l.num_good,
            queue_full_events: l.queue_full_events,
        })
    }

    pub fn transfer_params(&self, target: u8) -> Option<TransferParams> {
        self.targets.get(usize::from(target)).map(Tcb::params)
    }
}
