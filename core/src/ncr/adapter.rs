//! Adapter instance: chip, shared memory and all control blocks

use std::collections::VecDeque;

use anyhow::{Result, bail};
use itertools::Itertools;
use log::*;
use serde::{Deserialize, Serialize};

use crate::bus::RegisterBus;
use crate::dma::DmaMemory;
use crate::ncr::ccb::{CcbArena, HostStatus};
use crate::ncr::config::AdapterConfig;
use crate::ncr::layout::{NcbLayout, ccb, lcb_slot};
use crate::ncr::lifecycle::{Completion, ScsiCommand};
use crate::ncr::regs::*;
use crate::ncr::script::{BoundScript, KVAR_TICKS, Label, ScriptTemplate};
use crate::ncr::target::{LunCredit, TargetStats, Tcb, TransferParams};
use crate::ncr::{MAX_LUN, MAX_TARGET};
use crate::tickable::{Tickable, Ticks};
use crate::types::PhysAddr;

/// Communication channel (sender) for command completions
pub type CompletionSender = crossbeam_channel::Sender<Completion>;

/// Communication channel (receiver) for command completions
pub type CompletionReceiver = crossbeam_channel::Receiver<Completion>;

/// Adapter-wide counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Profile {
    pub num_trans: u64,
    pub num_bytes: u64,
    pub num_int: u64,
    pub num_fly: u64,
    pub num_sir: u64,
    pub num_break: u64,
    pub num_sel_timeout: u64,
    pub num_reset: u64,
    pub num_timeout: u64,
    pub num_queue_full: u64,
    pub num_parity: u64,
    pub num_deferred: u64,
}

/// Tag message used for tagged commands
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::IntoStaticStr,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum TagOrder {
    /// SIMPLE, escalated to ORDERED for commands close to their deadline
    #[default]
    Default,
    Simple,
    Ordered,
}

/// Runtime trace switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DebugFlags {
    pub queue: bool,
    pub nego: bool,
    pub tags: bool,
    pub irq: bool,
    pub recovery: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StartQueue {
    /// Next slot the host fills
    pub(crate) put: usize,
    /// Slot the sequencer was last told to resume at
    pub(crate) resume: usize,
}

pub struct Adapter<C: RegisterBus> {
    pub(crate) name: String,
    pub(crate) config: AdapterConfig,
    pub(crate) chip: C,
    pub(crate) mem: DmaMemory,
    pub(crate) ncb: NcbLayout,
    pub(crate) script: BoundScript,
    pub(crate) ccbs: CcbArena,
    pub(crate) targets: Vec<Tcb>,
    pub(crate) squeue: StartQueue,
    pub(crate) done_get: usize,
    /// Commands accepted but not yet handed to the chip, in arrival order
    pub(crate) waiting: VecDeque<ScsiCommand>,
    pub(crate) completions: CompletionSender,
    pub(crate) now: Ticks,
    pub(crate) next_housekeeping: Ticks,
    pub(crate) settle_until: Option<Ticks>,
    pub(crate) async_scntl3: u8,
    pub(crate) order: TagOrder,
    pub(crate) debug: DebugFlags,
    pub(crate) profile: Profile,
}

impl<C: RegisterBus> Adapter<C> {
    /// Binds the script into `mem`, initializes all queues and starts the chip.
    pub fn attach(
        config: AdapterConfig,
        chip: C,
        mut mem: DmaMemory,
        completions: CompletionSender,
    ) -> Result<Self> {
        config.validate()?;

        let done_slots = config.max_ccbs + 1;
        let ncb = NcbLayout {
            base: mem.alloc(NcbLayout::size(done_slots), 16)?,
            done_slots,
        };
        let mut template = ScriptTemplate::new(config.max_start, config.max_scatter);
        template.fill_variable_length_sections();
        let script = BoundScript::bind(&template, &mut mem, config.chip_base, &ncb)?;

        let async_scntl3 = Scntl3(0).with_ccf(async_ccf(config.clock_khz)).0;
        let targets = (0..MAX_TARGET as u8)
            .map(|id| Tcb::new(id, &config, async_scntl3))
            .collect();

        let mut adapter = Self {
            name: config.name.clone(),
            ccbs: CcbArena::new(config.max_ccbs, config.max_scatter),
            next_housekeeping: config.tick_period,
            config,
            chip,
            mem,
            ncb,
            script,
            targets,
            squeue: StartQueue::default(),
            done_get: 0,
            waiting: VecDeque::new(),
            completions,
            now: 0,
            settle_until: None,
            async_scntl3,
            order: TagOrder::Default,
            debug: DebugFlags::default(),
            profile: Profile::default(),
        };
        adapter.init_queues()?;
        adapter.chip_init();

        info!(
            "{}: attached, script at {:#010X} ({} bytes), NCB at {:#010X}",
            adapter.name,
            adapter.script.base(),
            adapter.script.size(),
            adapter.ncb.base
        );
        Ok(adapter)
    }

    pub(crate) fn inb(&mut self, reg: NcrReg) -> u8 {
        self.chip.read8(reg.offset())
    }

    pub(crate) fn outb(&mut self, reg: NcrReg, val: u8) {
        self.chip.write8(reg.offset(), val);
    }

    pub(crate) fn inw(&mut self, reg: NcrReg) -> u16 {
        self.chip.read16(reg.offset())
    }

    pub(crate) fn outw(&mut self, reg: NcrReg, val: u16) {
        self.chip.write16(reg.offset(), val);
    }

    pub(crate) fn inl(&mut self, reg: NcrReg) -> u32 {
        self.chip.read32(reg.offset())
    }

    pub(crate) fn outl(&mut self, reg: NcrReg, val: u32) {
        self.chip.write32(reg.offset(), val);
    }

    /// Resets the start queue, done queue and restart trap to their idle
    /// state. The chip must be stopped.
    pub(crate) fn init_queues(&mut self) -> Result<()> {
        let idle = self.script.addr(Label::Idle);
        for slot in 0..self.script.max_start() {
            self.mem.write_u32(self.script.slot_operand(slot), idle)?;
        }
        self.mem
            .write_u32(self.ncb.startpos(), self.script.tryloop_slot(0))?;
        for slot in 0..self.ncb.done_slots {
            self.mem.write_u32(self.ncb.done_slot(slot), 0)?;
        }
        self.mem.write_u32(self.ncb.done_put(), 0)?;
        self.mem.write_u32(self.ncb.restart_trap(), 0)?;
        self.mem
            .write_u32(self.ncb.kvar(KVAR_TICKS as usize), self.now as u32)?;
        self.squeue = StartQueue::default();
        self.done_get = 0;
        self.mem.fence();
        Ok(())
    }

    /// Soft-resets the chip, programs its registers and starts the script.
    pub(crate) fn chip_init(&mut self) {
        self.outb(NcrReg::ISTAT, Istat(0).with_srst(true).0);
        self.outb(NcrReg::ISTAT, 0);

        let own_id = self.config.own_id;
        self.outb(NcrReg::SCNTL0, SCNTL0_ARB_FULL | SCNTL0_EPC);
        self.outb(NcrReg::SCNTL1, 0);
        self.outb(NcrReg::SCNTL3, self.async_scntl3);
        self.outb(NcrReg::SCID, SCID_RRE | own_id);
        self.outw(NcrReg::RESPID, 1 << own_id);
        self.outb(NcrReg::SXFER, 0);
        self.outb(NcrReg::DMODE, DMODE_BURST8);
        self.outb(NcrReg::DCNTL, 0);
        self.outb(NcrReg::STIME0, STIME0_SEL_204MS);
        self.outb(NcrReg::STEST3, STEST3_TE);
        self.outw(NcrReg::SIEN0, SIEN_ENABLED);
        self.outb(NcrReg::DIEN, DIEN_ENABLED);

        self.resume_chip(Label::Start);
    }

    /// Makes all posted writes visible and restarts the sequencer at `label`.
    pub(crate) fn resume_chip(&mut self, label: Label) {
        self.mem.fence();
        let addr = self.script.addr(label);
        self.outl(NcrReg::DSP, addr);
    }

    /// Makes all posted writes visible, then signals the sequencer.
    pub(crate) fn ring_doorbell(&mut self) {
        self.mem.fence();
        self.outb(NcrReg::ISTAT, Istat(0).with_sigp(true).0);
    }

    /// Start queue slot the sequencer will try next
    pub(crate) fn chip_position(&self) -> Result<Option<usize>> {
        let pos = self.mem.read_u32(self.ncb.startpos())?;
        Ok(self.script.slot_of(pos))
    }

    fn pending_range(&self) -> Result<Option<(usize, usize)>> {
        let n = self.script.max_start();
        Ok(self
            .chip_position()?
            .map(|pos| (pos, (self.squeue.put + n - pos) % n)))
    }

    /// Whether `slot` still holds `phys` and the sequencer has not consumed it
    pub(crate) fn slot_pending(&self, slot: usize, phys: PhysAddr) -> Result<bool> {
        let Some((pos, len)) = self.pending_range()? else {
            return Ok(false);
        };
        let n = self.script.max_start();
        Ok((slot + n - pos) % n < len && self.mem.read_u32(self.script.slot_operand(slot))? == phys)
    }

    pub(crate) fn start_queue_has_room(&self) -> Result<bool> {
        let n = self.script.max_start();
        Ok(match self.pending_range()? {
            Some((_, len)) => len < n - 1,
            None => false,
        })
    }

    /// Publishes a prepared CCB in the start queue. The following slot is
    /// turned into the new terminator before the entry itself is written.
    pub(crate) fn queue_ccb(&mut self, idx: usize) -> Result<()> {
        let n = self.script.max_start();
        let put = self.squeue.put;
        let next = (put + 1) % n;

        self.mem
            .write_u32(self.script.slot_operand(next), self.script.addr(Label::Idle))?;
        self.mem.fence();
        self.mem
            .write_u32(self.script.slot_operand(put), self.ccbs[idx].phys)?;
        self.ccbs[idx].queued_slot = Some(put);
        self.squeue.put = next;

        if self.debug.queue {
            debug!(
                "{}: CCB {:#010X} queued in slot {}",
                self.name, self.ccbs[idx].phys, put
            );
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn chip(&self) -> &C {
        &self.chip
    }

    pub fn chip_mut(&mut self) -> &mut C {
        &mut self.chip
    }

    pub fn memory(&self) -> &DmaMemory {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut DmaMemory {
        &mut self.mem
    }

    /// Both halves of the hardware boundary, for driving a simulated chip
    pub fn chip_and_memory(&mut self) -> (&mut C, &mut DmaMemory) {
        (&mut self.chip, &mut self.mem)
    }

    pub fn script(&self) -> &BoundScript {
        &self.script
    }

    pub fn ncb(&self) -> &NcbLayout {
        &self.ncb
    }

    pub fn now(&self) -> Ticks {
        self.now
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn is_settling(&self) -> bool {
        self.settle_until.is_some()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn active_len(&self) -> usize {
        self.ccbs.in_use().count()
    }

    /// Slot the sequencer was last restarted at
    pub fn start_queue_resume(&self) -> usize {
        self.squeue.resume
    }

    pub fn tag_order(&self) -> TagOrder {
        self.order
    }

    pub fn debug_flags(&self) -> DebugFlags {
        self.debug
    }

    /// Checks the bookkeeping shared between host structures and the
    /// chip-visible headers.
    pub fn verify_invariants(&self) -> Result<()> {
        for c in self.ccbs.iter() {
            let hs = self.mem.read_u8(c.phys + ccb::HOST_STATUS)?;
            if c.in_use == (hs == HostStatus::Idle as u8) {
                bail!(
                    "CCB {:#010X}: in use {} with host status {:#04X}",
                    c.phys,
                    c.in_use,
                    hs
                );
            }
        }

        for tcb in &self.targets {
            for (lun, lcb) in tcb.lcbs.iter().enumerate() {
                let Some(lcb) = lcb else { continue };
                if lcb.active + lcb.openings != lcb.reqlink {
                    bail!(
                        "{}:{}: active {} + openings {} != reqlink {}",
                        tcb.id,
                        lun,
                        lcb.active,
                        lcb.openings,
                        lcb.reqlink
                    );
                }
                let busy: Vec<_> = lcb
                    .ccbs
                    .iter()
                    .map(|&i| &self.ccbs[i])
                    .filter(|c| c.in_use)
                    .collect();
                if busy.len() != usize::from(lcb.active) {
                    bail!(
                        "{}:{}: {} CCBs in use, {} active",
                        tcb.id,
                        lun,
                        busy.len(),
                        lcb.active
                    );
                }
                let tags = busy.iter().map(|c| c.tag).filter(|&t| t != 0).collect_vec();
                if !tags.iter().all_unique() || tags.len() != lcb.outstanding_tags() {
                    bail!("{}:{}: tag accounting mismatch", tcb.id, lun);
                }
                for c in &busy {
                    let entry = self.mem.read_u32(lcb.phys + lcb_slot(c.tag))?;
                    if entry != 0 && entry != c.phys {
                        bail!(
                            "{}:{}: tag {} maps to {:#010X}, owned by {:#010X}",
                            tcb.id,
                            lun,
                            c.tag,
                            entry,
                            c.phys
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> AdapterSnapshot {
        AdapterSnapshot {
            name: self.name.clone(),
            now: self.now,
            settling: self.is_settling(),
            waiting: self.waiting.len(),
            active: self.active_len(),
            allocated_ccbs: self.ccbs.len(),
            queue_put: self.squeue.put,
            queue_resume: self.squeue.resume,
            order: self.order,
            profile: self.profile,
            targets: self
                .targets
                .iter()
                .filter(|t| t.inquiry.is_some() || t.lcbs.iter().any(Option::is_some))
                .map(|t| TargetSnapshot {
                    id: t.id,
                    params: t.params,
                    sync_done: t.sync_done,
                    wide_done: t.wide_done,
                    stats: t.stats,
                    luns: (0..MAX_LUN as u8)
                        .filter_map(|l| self.lun_credit(t.id, l).map(|c| (l, c)))
                        .collect(),
                })
                .collect(),
        }
    }
}

impl<C: RegisterBus> Tickable for Adapter<C> {
    fn tick(&mut self, ticks: Ticks) -> Result<Ticks> {
        self.now += ticks;
        self.mem
            .write_u32(self.ncb.kvar(KVAR_TICKS as usize), self.now as u32)?;
        if self.now >= self.next_housekeeping {
            self.next_housekeeping = self.now + self.config.tick_period;
            self.housekeeping()?;
        }
        Ok(ticks)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetSnapshot {
    pub id: u8,
    pub params: TransferParams,
    pub sync_done: bool,
    pub wide_done: bool,
    pub stats: TargetStats,
    pub luns: Vec<(u8, LunCredit)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterSnapshot {
    pub name: String,
    pub now: Ticks,
    pub settling: bool,
    pub waiting: usize,
    pub active: usize,
    pub allocated_ccbs: usize,
    pub queue_put: usize,
    pub queue_resume: usize,
    pub order: TagOrder,
    pub profile: Profile,
    pub targets: Vec<TargetSnapshot>,
}
