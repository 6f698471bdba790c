//! Behavioral model of the NCR 53C8xx SCRIPTS processor
//!
//! The model does not fetch instructions. It knows the entry points of the
//! bound script and carries out what the code at each of them does, reading
//! and writing the shared structures through the device view of DMA memory.
//! Host-visible state lives in the register window only, so the adapter
//! drives it exactly like the real chip.

use std::collections::VecDeque;

use anyhow::{Result, bail};
use log::*;
use serde::{Deserialize, Serialize};

use crate::bus::{RegOffset, RegisterBus};
use crate::dma::{DmaMemory, VisibilityClock};
use crate::ncr::MAX_TARGET;
use crate::ncr::ccb::{HostStatus, XE_BAD_PHASE, XE_EXTRA_DATA};
use crate::ncr::layout::{NcbLayout, ResumeDescriptor, ScatterEntry, ccb, lcb_slot};
use crate::ncr::regs::*;
use crate::ncr::script::{BoundScript, DATA_ENTRY_SIZE, Label, PHASE_DATA_IN, PHASE_DATA_OUT, Sir};
use crate::scsi::{Direction, MSG_EXTENDED, MSG_IDENTIFY, MSG_IGN_RESIDUE, MSG_REJECT};
use crate::scsi::{MSG_X_SYNC_REQ, MSG_X_WIDE_REQ, STATUS_CHECK_CONDITION};
use crate::sim::target::{SimTarget, Step};
use crate::tickable::Ticks;
use crate::types::{LatchingEvent, PhysAddr};

const ISTAT: RegOffset = NcrReg::ISTAT.offset();
const DSTAT: RegOffset = NcrReg::DSTAT.offset();
const SIST0: RegOffset = NcrReg::SIST0.offset();
const SIST1: RegOffset = NcrReg::SIST1.offset();
const SCNTL1: RegOffset = NcrReg::SCNTL1.offset();
const CTEST3: RegOffset = NcrReg::CTEST3.offset();
/// Writing the top byte of DSP starts the sequencer
const DSP_START: RegOffset = NcrReg::DSP.offset() + 3;

/// Upper bound of sequencer steps per [`SimChip::run`]
const STEP_BUDGET: usize = 10_000;

/// Hardware event injected into the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum Fault {
    /// SCSI RST driven by another device
    BusReset,
    /// SE/LVD transition on the bus
    BusModeChange,
    /// Parity error on the PCI side
    MasterParity,
    BusFault,
    IllegalInstruction,
    /// Parity error on the SCSI side, the sequencer waits for the host
    ScsiParity,
}

/// Where the sequencer continues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cont {
    Start,
    Idle,
    Dispatch,
    DisconnectFinish,
    Getcc,
    SendMsgOut(usize),
    Reject,
}

enum Flow {
    Next(Cont),
    /// Blocked on the bus or on the host, retried on the next run
    Wait,
    /// Stopped with an interrupt pending
    Halt,
}

#[derive(Debug, Clone, Copy)]
struct Nexus {
    target: u8,
    lun: u8,
    tag: u8,
    ccb: PhysAddr,
    sense: bool,
    nego_pending: bool,
}

struct Firmware {
    script: BoundScript,
    ncb: NcbLayout,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SimChipStats {
    pub steps: u64,
    pub selections: u64,
    pub reselections: u64,
    pub interrupts: u64,
    pub done_posted: u64,
    /// Reselections that found no CCB in the LUN table
    pub orphans: u64,
}

pub struct SimChip {
    regs: [u8; NCR_REG_WINDOW],
    firmware: Option<Firmware>,
    /// DSP written before the firmware was known
    unbound_start: Option<PhysAddr>,
    targets: Vec<Option<SimTarget>>,
    clock: VisibilityClock,
    doorbell: LatchingEvent,
    doorbell_stamps: Vec<u64>,
    pc: Option<Cont>,
    /// DSP at a parity stop and the continuation to restore when the host
    /// writes it back
    stall: Option<(PhysAddr, Cont)>,
    nexus: Option<Nexus>,
    dstat: u8,
    sist: u16,
    intf: bool,
    dfe: bool,
    faults: VecDeque<Fault>,
    now: Ticks,
    stats: SimChipStats,
}

impl SimChip {
    pub fn new(clock: VisibilityClock) -> Self {
        Self {
            regs: [0; NCR_REG_WINDOW],
            firmware: None,
            unbound_start: None,
            targets: (0..MAX_TARGET).map(|_| None).collect(),
            clock,
            doorbell: LatchingEvent::default(),
            doorbell_stamps: vec![],
            pc: None,
            stall: None,
            nexus: None,
            dstat: 0,
            sist: 0,
            intf: false,
            dfe: true,
            faults: VecDeque::new(),
            now: 0,
            stats: SimChipStats::default(),
        }
    }

    /// Tells the model where the bound script and the NCB are. Needed
    /// before the first DSP write can be decoded.
    pub fn load_firmware(&mut self, script: BoundScript, ncb: NcbLayout) {
        self.firmware = Some(Firmware { script, ncb });
        if let Some(addr) = self.unbound_start.take() {
            self.resume(addr);
        }
    }

    pub fn attach_target(&mut self, target: SimTarget) -> Result<()> {
        let id = usize::from(target.id());
        let Some(slot) = self.targets.get_mut(id) else {
            bail!("Invalid SCSI ID {}", id);
        };
        *slot = Some(target);
        Ok(())
    }

    pub fn detach_target(&mut self, id: u8) -> Option<SimTarget> {
        self.targets.get_mut(usize::from(id))?.take()
    }

    pub fn target(&self, id: u8) -> Option<&SimTarget> {
        self.targets.get(usize::from(id))?.as_ref()
    }

    pub fn target_mut(&mut self, id: u8) -> Option<&mut SimTarget> {
        self.targets.get_mut(usize::from(id))?.as_mut()
    }

    pub fn inject(&mut self, fault: Fault) {
        self.faults.push_back(fault);
    }

    pub fn advance(&mut self, ticks: Ticks) {
        self.now += ticks;
    }

    /// Whether an interrupt line would be asserted
    pub fn irq_pending(&self) -> bool {
        self.intf || self.dstat != 0 || self.sist != 0
    }

    /// Sequence numbers of all doorbell writes, on the memory's clock
    pub fn doorbell_stamps(&self) -> &[u64] {
        &self.doorbell_stamps
    }

    pub fn is_idle(&self) -> bool {
        self.pc == Some(Cont::Idle) && self.nexus.is_none()
    }

    pub fn is_connected(&self) -> bool {
        self.nexus.is_some()
    }

    pub fn stats(&self) -> &SimChipStats {
        &self.stats
    }

    fn reg32(&self, reg: NcrReg) -> u32 {
        let o = usize::from(reg.offset());
        u32::from_le_bytes([self.regs[o], self.regs[o + 1], self.regs[o + 2], self.regs[o + 3]])
    }

    fn set_reg32(&mut self, reg: NcrReg, val: u32) {
        let o = usize::from(reg.offset());
        self.regs[o..o + 4].copy_from_slice(&val.to_le_bytes());
    }

    fn set_reg(&mut self, reg: NcrReg, val: u8) {
        self.regs[usize::from(reg.offset())] = val;
    }

    fn soft_reset(&mut self) {
        trace!("chip: soft reset");
        self.regs = [0; NCR_REG_WINDOW];
        self.pc = None;
        self.stall = None;
        self.unbound_start = None;
        self.nexus = None;
        self.dstat = 0;
        self.sist = 0;
        self.intf = false;
        self.dfe = true;
        self.doorbell.get_clear();
    }

    /// SCSI RST seen on the bus: every device drops what it was doing
    fn bus_reset(&mut self) {
        for t in self.targets.iter_mut().flatten() {
            t.bus_reset();
        }
        self.nexus = None;
    }

    /// Host restarted the sequencer at `addr`
    fn resume(&mut self, addr: PhysAddr) {
        if let Some((dsp, cont)) = self.stall.take() {
            if dsp == addr {
                self.pc = Some(cont);
                return;
            }
        }
        let Some(fw) = self.firmware.as_ref() else {
            self.unbound_start = Some(addr);
            return;
        };
        let label = fw.script.label_at(addr);
        let cont = match label {
            Some(Label::Start | Label::TryLoop) => Cont::Start,
            Some(Label::Idle) => Cont::Idle,
            Some(Label::Dispatch | Label::Clrack) => Cont::Dispatch,
            Some(Label::Disconnect) => Cont::DisconnectFinish,
            Some(Label::Getcc) => Cont::Getcc,
            Some(Label::SdtrResp) => Cont::SendMsgOut(5),
            Some(Label::WdtrResp) => Cont::SendMsgOut(4),
            Some(Label::MsgBad) => Cont::Reject,
            _ => {
                warn!("chip: started at {:#010X} ({:?})", addr, label);
                self.dstat |= Dstat(0).with_iid(true).0;
                self.pc = None;
                return;
            }
        };
        if cont == Cont::Start {
            self.nexus = None;
        }
        if cont == Cont::Dispatch {
            // the last message went through without MESSAGE REJECT
            if let Some(n) = self.nexus {
                if let Some(t) = self.target_mut(n.target) {
                    t.message_accepted();
                }
            }
        }
        self.pc = Some(cont);
    }

    /// Runs the sequencer until it halts on an interrupt or blocks
    pub fn run(&mut self, mem: &mut DmaMemory) -> Result<()> {
        let Some(fw) = self.firmware.take() else {
            return Ok(());
        };
        let result = self.run_with(&fw, mem);
        self.firmware = Some(fw);
        result
    }

    fn run_with(&mut self, fw: &Firmware, mem: &mut DmaMemory) -> Result<()> {
        if self.deliver_fault(fw) {
            return Ok(());
        }
        for _ in 0..STEP_BUDGET {
            let Some(cont) = self.pc else {
                return Ok(());
            };
            self.stats.steps += 1;
            let flow = match self.step(fw, mem, cont) {
                Ok(f) => f,
                Err(e) => {
                    warn!("chip: bus master access failed: {:#}", e);
                    self.dma_int(Dstat(0).with_bf(true))
                }
            };
            match flow {
                Flow::Next(next) => self.pc = Some(next),
                Flow::Wait => return Ok(()),
                Flow::Halt => {
                    self.pc = None;
                    return Ok(());
                }
            }
        }
        bail!("Sequencer did not settle within {} steps", STEP_BUDGET)
    }

    fn deliver_fault(&mut self, fw: &Firmware) -> bool {
        if self.pc.is_none() || self.irq_pending() {
            return false;
        }
        let Some(fault) = self.faults.pop_front() else {
            return false;
        };
        debug!("chip: injecting {:?}", fault);
        match fault {
            Fault::BusReset => {
                self.bus_reset();
                self.scsi_int(Sist(0).with_rst(true));
            }
            Fault::BusModeChange => {
                self.scsi_int(Sist(0).with_sbmc(true));
            }
            Fault::MasterParity => {
                self.dma_int(Dstat(0).with_mdpe(true));
            }
            Fault::BusFault => {
                self.dma_int(Dstat(0).with_bf(true));
            }
            Fault::IllegalInstruction => {
                self.dma_int(Dstat(0).with_iid(true));
            }
            Fault::ScsiParity => {
                let cont = self.pc.unwrap_or(Cont::Start);
                let dsp = fw.script.addr(label_of(cont));
                self.set_reg32(NcrReg::DSP, dsp);
                self.stall = Some((dsp, cont));
                self.scsi_int(Sist(0).with_par(true));
            }
        }
        self.pc = None;
        true
    }

    fn sir(&mut self, sir: Sir) -> Flow {
        trace!("chip: INT {:?}", sir);
        self.set_reg32(NcrReg::DSPS, sir as u32);
        self.dma_int(Dstat(0).with_sir(true))
    }

    fn dma_int(&mut self, dstat: Dstat) -> Flow {
        self.stats.interrupts += 1;
        self.dstat |= dstat.0;
        Flow::Halt
    }

    fn scsi_int(&mut self, sist: Sist) -> Flow {
        self.stats.interrupts += 1;
        self.sist |= sist.0;
        Flow::Halt
    }

    fn step(&mut self, fw: &Firmware, mem: &mut DmaMemory, cont: Cont) -> Result<Flow> {
        self.set_reg32(NcrReg::DSP, fw.script.addr(label_of(cont)));
        match cont {
            Cont::Start => self.start(fw, mem),
            Cont::Idle => self.idle(fw, mem),
            Cont::Dispatch => self.dispatch(fw, mem),
            Cont::DisconnectFinish => {
                if let Some(n) = self.nexus.take() {
                    mem.dev_write_u8(n.ccb + ccb::HOST_STATUS, HostStatus::Disconnect as u8)?;
                }
                Ok(Flow::Next(Cont::Start))
            }
            Cont::Getcc => self.getcc(mem),
            Cont::SendMsgOut(len) => {
                let mut msg = vec![0; len];
                mem.dev_read_bytes(fw.ncb.msgout(), &mut msg)?;
                if let Some(n) = self.nexus {
                    if let Some(t) = self.target_mut(n.target) {
                        t.message_out(&msg);
                    }
                }
                Ok(Flow::Next(Cont::Dispatch))
            }
            Cont::Reject => {
                if let Some(n) = self.nexus {
                    if let Some(t) = self.target_mut(n.target) {
                        t.message_out(&[MSG_REJECT]);
                    }
                }
                Ok(self.sir(Sir::RejectSent))
            }
        }
    }

    /// Walks the start queue from the saved position
    fn start(&mut self, fw: &Firmware, mem: &mut DmaMemory) -> Result<Flow> {
        self.nexus = None;
        if mem.dev_read_u32(fw.ncb.restart_trap())? != 0 {
            return Ok(self.sir(Sir::SenseRestart));
        }
        let script = &fw.script;
        let idle = script.addr(Label::Idle);
        let skip = script.addr(Label::Skip);
        let select = script.addr(Label::Select);

        let mut pos = mem.dev_read_u32(fw.ncb.startpos())?;
        for _ in 0..=script.max_start() {
            if pos == script.addr(Label::TryLoopEnd) {
                pos = script.tryloop_slot(0);
            }
            if script.slot_of(pos).is_none() {
                warn!("chip: start queue position {:#010X} is not a slot", pos);
                return Ok(self.dma_int(Dstat(0).with_iid(true)));
            }
            let operand = mem.dev_read_u32(pos + 4)?;
            let ret = pos + 8;
            if operand == idle {
                return Ok(Flow::Next(Cont::Idle));
            }
            if operand != skip {
                let launch = mem.dev_read_u32(operand + ccb::LAUNCH_ADDR)?;
                if launch == select {
                    return self.select(fw, mem, operand, ret);
                }
                if launch != skip {
                    warn!("chip: CCB {:#010X} launches at {:#010X}", operand, launch);
                    return Ok(self.dma_int(Dstat(0).with_iid(true)));
                }
            }
            mem.dev_write_u32(fw.ncb.startpos(), ret)?;
            pos = ret;
        }
        warn!("chip: start queue has no terminator");
        Ok(self.dma_int(Dstat(0).with_iid(true)))
    }

    fn select(
        &mut self,
        fw: &Firmware,
        mem: &mut DmaMemory,
        phys: PhysAddr,
        ret: PhysAddr,
    ) -> Result<Flow> {
        mem.dev_write_u32(fw.ncb.startpos(), ret)?;
        self.set_reg32(NcrReg::SCRATCHA, ret);
        self.set_reg32(NcrReg::DSA, phys);

        let mut sel = [0; 4];
        mem.dev_read_bytes(phys + ccb::SELECT, &mut sel)?;
        let [_, sxfer, id, scntl3] = sel;
        if self.target(id).is_none() {
            trace!("chip: no answer from target {}", id);
            return Ok(self.scsi_int(Sist(0).with_sto(true)));
        }
        self.set_reg(NcrReg::SXFER, sxfer);
        self.set_reg(NcrReg::SCNTL3, scntl3);

        let msgout = read_table(mem, phys + ccb::SMSG_TBL)?;
        let cdb = read_table(mem, phys + ccb::CMD_TBL)?;
        let savep = mem.dev_read_u32(phys + ccb::SAVEP)?;
        self.set_reg32(NcrReg::TEMP, savep);
        let nego_pending = mem.dev_read_u8(phys + ccb::NEGO_STATUS)? != 0;

        self.stats.selections += 1;
        let Some(t) = self.target_mut(id) else {
            return Ok(self.scsi_int(Sist(0).with_sto(true)));
        };
        let (lun, tag) = t.select(&msgout, &cdb, false);
        self.nexus = Some(Nexus {
            target: id,
            lun,
            tag,
            ccb: phys,
            sense: false,
            nego_pending,
        });
        Ok(Flow::Next(Cont::Dispatch))
    }

    /// Selects the target again to fetch sense data for the CCB in DSA
    fn getcc(&mut self, mem: &mut DmaMemory) -> Result<Flow> {
        let phys = self.reg32(NcrReg::DSA);
        let id = mem.dev_read_u8(phys + ccb::SELECT + 2)?;
        let lun = mem.dev_read_u8(phys + ccb::LUN)?;
        let cdb = read_table(mem, phys + ccb::SENSE_CMD_TBL)?;
        let Some(t) = self.target_mut(id) else {
            return Ok(self.scsi_int(Sist(0).with_sto(true)));
        };
        if t.take_preempt() {
            debug!("chip: lost arbitration for REQUEST SENSE to {}", id);
            return Ok(self.sir(Sir::SenseFailed));
        }
        let (lun, tag) = t.select(&[MSG_IDENTIFY | lun], &cdb, true);
        self.stats.selections += 1;
        self.nexus = Some(Nexus {
            target: id,
            lun,
            tag,
            ccb: phys,
            sense: true,
            nego_pending: false,
        });
        Ok(Flow::Next(Cont::Dispatch))
    }

    /// WAIT RESELECT: a target coming back wins over the doorbell
    fn idle(&mut self, fw: &Firmware, mem: &mut DmaMemory) -> Result<Flow> {
        let now = self.now;
        let ready = self
            .targets
            .iter()
            .flatten()
            .find_map(|t| t.reselect_ready(now).map(|(lun, tag)| (t.id(), lun, tag)));
        if let Some((id, lun, tag)) = ready {
            return self.reselected(fw, mem, id, lun, tag);
        }
        if self.doorbell.get_clear() {
            return Ok(Flow::Next(Cont::Start));
        }
        Ok(Flow::Wait)
    }

    fn reselected(
        &mut self,
        fw: &Firmware,
        mem: &mut DmaMemory,
        id: u8,
        lun: u8,
        tag: u8,
    ) -> Result<Flow> {
        let lcb = mem.dev_read_u32(fw.ncb.lun_entry(id, lun))?;
        let phys = if lcb == 0 {
            0
        } else {
            mem.dev_read_u32(lcb + lcb_slot(tag))?
        };
        let Some(t) = self.target_mut(id) else {
            return Ok(Flow::Next(Cont::Idle));
        };
        if phys == 0 {
            warn!(
                "chip: reselected by {}:{} tag {} without a CCB, aborting",
                id, lun, tag
            );
            t.drop_job(lun, tag);
            self.stats.orphans += 1;
            return Ok(Flow::Next(Cont::Idle));
        }
        t.reconnect(lun, tag);
        self.stats.reselections += 1;

        self.set_reg32(NcrReg::DSA, phys);
        let savep = mem.dev_read_u32(phys + ccb::SAVEP)?;
        self.set_reg32(NcrReg::TEMP, savep);
        let mut sel = [0; 4];
        mem.dev_read_bytes(phys + ccb::SELECT, &mut sel)?;
        self.set_reg(NcrReg::SXFER, sel[1]);
        self.set_reg(NcrReg::SCNTL3, sel[3]);
        mem.dev_write_u8(phys + ccb::HOST_STATUS, HostStatus::Busy as u8)?;
        self.nexus = Some(Nexus {
            target: id,
            lun,
            tag,
            ccb: phys,
            sense: false,
            nego_pending: false,
        });
        Ok(Flow::Next(Cont::Dispatch))
    }

    /// Posts a finished CCB to the done queue and interrupts on the fly
    fn post_done(&mut self, fw: &Firmware, mem: &mut DmaMemory, phys: PhysAddr) -> Result<()> {
        let ncb = &fw.ncb;
        let put = mem.dev_read_u32(ncb.done_put())? as usize % ncb.done_slots;
        mem.dev_write_u32(ncb.done_slot(put), phys)?;
        let next = ((put + 1) % ncb.done_slots) as u32;
        mem.dev_write_u32(ncb.done_put(), next)?;
        self.set_reg32(NcrReg::SCRATCHB, next);
        self.intf = true;
        self.stats.done_posted += 1;
        Ok(())
    }

    fn dispatch(&mut self, fw: &Firmware, mem: &mut DmaMemory) -> Result<Flow> {
        let Some(n) = self.nexus else {
            warn!("chip: dispatch without a connection");
            return Ok(Flow::Next(Cont::Start));
        };
        let step = self
            .target(n.target)
            .and_then(|t| t.peek(n.lun, n.tag))
            .cloned();
        let Some(step) = step else {
            // the target released the bus
            return Ok(self.scsi_int(Sist(0).with_udc(true)));
        };

        if n.nego_pending && !matches!(step, Step::MsgIn(_)) {
            self.clear_nego_pending();
            return Ok(self.sir(Sir::NegoFailed));
        }
        if matches!(step, Step::Stall) {
            return Ok(Flow::Wait);
        }
        // direction not known when the command was queued
        if !n.sense && self.reg32(NcrReg::TEMP) == fw.script.addr(Label::DataIo) {
            match step {
                Step::DataIn(_) => return Ok(self.sir(Sir::DataIoIsIn)),
                Step::DataOut(_) => return Ok(self.sir(Sir::DataIoIsOut)),
                _ => {}
            }
        }
        self.pop(n);

        match step {
            Step::MsgIn(msg) => {
                self.clear_nego_pending();
                let len = msg.len().min(8);
                mem.dev_write_bytes(fw.ncb.msgin(), &msg[..len])?;
                Ok(match msg.as_slice() {
                    [MSG_EXTENDED, 3, MSG_X_SYNC_REQ, _, _] => self.sir(Sir::NegoSync),
                    [MSG_EXTENDED, 2, MSG_X_WIDE_REQ, _] => self.sir(Sir::NegoWide),
                    [MSG_EXTENDED, ..] => self.sir(Sir::NegoProto),
                    [MSG_REJECT] => self.sir(Sir::RejectReceived),
                    [MSG_IGN_RESIDUE, _] => self.sir(Sir::IgnResidue),
                    _ => Flow::Next(Cont::Reject),
                })
            }
            Step::DataIn(_) | Step::DataOut(_) => self.data_phase(fw, mem, n, step),
            Step::Status(s) => {
                if !n.sense {
                    mem.dev_write_u8(n.ccb + ccb::SCSI_STATUS, s)?;
                }
                Ok(Flow::Next(Cont::Dispatch))
            }
            Step::Complete => {
                if let Some(t) = self.target_mut(n.target) {
                    t.finish(n.lun, n.tag);
                }
                self.nexus = None;
                if !n.sense {
                    let dp = self.reg32(NcrReg::TEMP);
                    mem.dev_write_u32(n.ccb + ccb::LASTP, dp)?;
                    if mem.dev_read_u8(n.ccb + ccb::SCSI_STATUS)? == STATUS_CHECK_CONDITION {
                        return Ok(Flow::Next(Cont::Getcc));
                    }
                }
                mem.dev_write_u8(n.ccb + ccb::HOST_STATUS, HostStatus::Complete as u8)?;
                self.post_done(fw, mem, n.ccb)?;
                Ok(Flow::Next(Cont::Start))
            }
            Step::Disconnect { save, hold } => {
                let dp = self.reg32(NcrReg::TEMP);
                if save {
                    mem.dev_write_u32(n.ccb + ccb::SAVEP, dp)?;
                }
                let at = hold.map(|h| self.now + h);
                if let Some(t) = self.target_mut(n.target) {
                    t.disconnect(n.lun, n.tag, save, at);
                }
                if mem.dev_read_u32(n.ccb + ccb::SAVEP)? != dp {
                    return Ok(self.sir(Sir::MissingSave));
                }
                Ok(Flow::Next(Cont::DisconnectFinish))
            }
            Step::BusFree => {
                if let Some(t) = self.target_mut(n.target) {
                    t.drop_job(n.lun, n.tag);
                }
                Ok(self.scsi_int(Sist(0).with_udc(true)))
            }
            Step::HandshakeTimeout => Ok(self.scsi_int(Sist(0).with_hth(true))),
            Step::Stall => Ok(Flow::Wait),
        }
    }

    fn pop(&mut self, n: Nexus) {
        if let Some(t) = self.target_mut(n.target) {
            t.pop(n.lun, n.tag);
        }
    }

    fn clear_nego_pending(&mut self) {
        if let Some(n) = self.nexus.as_mut() {
            n.nego_pending = false;
        }
    }

    /// Moves one data phase through the data pointer in TEMP. The pointer
    /// is either a move entry, a resume descriptor in the CCB or the end of
    /// a data section.
    fn data_phase(
        &mut self,
        fw: &Firmware,
        mem: &mut DmaMemory,
        n: Nexus,
        step: Step,
    ) -> Result<Flow> {
        let (phase, dir, total) = match &step {
            Step::DataIn(d) => (PHASE_DATA_IN, Direction::In, d.len()),
            Step::DataOut(len) => (PHASE_DATA_OUT, Direction::Out, *len),
            _ => return Ok(Flow::Next(Cont::Dispatch)),
        };

        if n.sense {
            if let Step::DataIn(d) = &step {
                let e = ScatterEntry::dev_read(mem, n.ccb + ccb::SENSE_TBL)?;
                let len = d.len().min(e.len as usize);
                mem.dev_write_bytes(e.addr, &d[..len])?;
            }
            return Ok(Flow::Next(Cont::Dispatch));
        }

        let mut dp = self.reg32(NcrReg::TEMP);

        let mut pos = 0;
        // (DSP after the interrupted move, next byte address, bytes left)
        let mut broken = None;
        while pos < total {
            let left = total - pos;
            if let Some(i) = fw.script.entry_index(dir, dp) {
                let e = ScatterEntry::dev_read(mem, n.ccb + ccb::data_entry(i))?;
                let k = (e.len as usize).min(left);
                self.transfer(mem, n, &step, pos, e.addr, k)?;
                pos += k;
                if k == e.len as usize {
                    dp += DATA_ENTRY_SIZE;
                } else {
                    broken = Some((dp + DATA_ENTRY_SIZE, e.addr + k as u32, e.len - k as u32));
                }
            } else if let Some(at) = ccb::RESUME.iter().map(|&o| n.ccb + o).find(|&a| a == dp) {
                let d = ResumeDescriptor::dev_read(mem, at)?;
                if d.opcode != phase {
                    mem.dev_write_u8(n.ccb + ccb::XERR_STATUS, XE_BAD_PHASE)?;
                    break;
                }
                let k = (d.remaining as usize).min(left);
                self.transfer(mem, n, &step, pos, d.addr, k)?;
                pos += k;
                if k == d.remaining as usize {
                    dp = d.next;
                } else {
                    broken = Some((at + 8, d.addr + k as u32, d.remaining - k as u32));
                }
            } else if Some(dp) == fw.script.data_end(dir) {
                debug!("chip: {} bytes beyond the data table", left);
                mem.dev_write_u8(n.ccb + ccb::XERR_STATUS, XE_EXTRA_DATA)?;
                break;
            } else {
                debug!("chip: data phase {} with pointer {:#010X}", phase, dp);
                mem.dev_write_u8(n.ccb + ccb::XERR_STATUS, XE_BAD_PHASE)?;
                break;
            }
            if broken.is_some() {
                break;
            }
        }
        self.set_reg32(NcrReg::TEMP, dp);

        let Some((dsp, dnad, rest)) = broken else {
            return Ok(Flow::Next(Cont::Dispatch));
        };
        // the target leaves the data phase in the middle of a move
        match self.target(n.target).and_then(|t| t.peek(n.lun, n.tag)) {
            Some(Step::BusFree) => {
                self.pop(n);
                if let Some(t) = self.target_mut(n.target) {
                    t.drop_job(n.lun, n.tag);
                }
                return Ok(self.scsi_int(Sist(0).with_udc(true)));
            }
            Some(Step::HandshakeTimeout) => {
                self.pop(n);
                return Ok(self.scsi_int(Sist(0).with_hth(true)));
            }
            _ => {}
        }
        self.set_reg32(NcrReg::DSP, dsp);
        self.set_reg32(NcrReg::DNAD, dnad);
        if dir == Direction::Out {
            // prefetched bytes sit in the DMA FIFO and SODL
            let fifo = rest.min(3);
            self.set_reg32(NcrReg::DBC, (u32::from(phase) << 24) | (rest - fifo));
            self.set_reg(NcrReg::DFIFO, (rest.wrapping_sub(1) & 0x7F) as u8);
            self.set_reg(NcrReg::SSTAT0, Sstat0(0).with_olf(true).0);
            self.dfe = false;
        } else {
            self.set_reg32(NcrReg::DBC, (u32::from(phase) << 24) | rest);
            self.dfe = true;
        }
        Ok(self.scsi_int(Sist(0).with_ma(true)))
    }

    fn transfer(
        &mut self,
        mem: &mut DmaMemory,
        n: Nexus,
        step: &Step,
        pos: usize,
        addr: PhysAddr,
        len: usize,
    ) -> Result<()> {
        match step {
            Step::DataIn(d) => mem.dev_write_bytes(addr, &d[pos..pos + len]),
            Step::DataOut(_) => {
                let mut buf = vec![0; len];
                mem.dev_read_bytes(addr, &mut buf)?;
                if let Some(t) = self.target_mut(n.target) {
                    t.receive(n.lun, n.tag, &buf);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Script address the sequencer reports while at a continuation
fn label_of(cont: Cont) -> Label {
    match cont {
        Cont::Start => Label::Start,
        Cont::Idle => Label::Idle,
        Cont::Dispatch => Label::Dispatch,
        Cont::DisconnectFinish => Label::Disconnect,
        Cont::Getcc => Label::Getcc,
        Cont::SendMsgOut(5) => Label::SdtrResp,
        Cont::SendMsgOut(_) => Label::WdtrResp,
        Cont::Reject => Label::MsgBad,
    }
}

/// Bytes described by a table entry in a CCB
fn read_table(mem: &DmaMemory, at: PhysAddr) -> Result<Vec<u8>> {
    let e = ScatterEntry::dev_read(mem, at)?;
    let mut buf = vec![0; e.len as usize];
    mem.dev_read_bytes(e.addr, &mut buf)?;
    Ok(buf)
}

impl RegisterBus for SimChip {
    fn read8(&mut self, reg: RegOffset) -> u8 {
        match reg {
            ISTAT => Istat(0)
                .with_dip(self.dstat != 0)
                .with_sip(self.sist != 0)
                .with_intf(self.intf)
                .with_sigp(self.doorbell.peek())
                .with_con(self.nexus.is_some())
                .0,
            DSTAT => {
                let v = Dstat(self.dstat).with_dfe(self.dfe).0;
                self.dstat = 0;
                v
            }
            SIST0 => {
                let v = self.sist as u8;
                self.sist &= 0xFF00;
                v
            }
            SIST1 => {
                let v = (self.sist >> 8) as u8;
                self.sist &= 0x00FF;
                v
            }
            _ => self.regs.get(usize::from(reg)).copied().unwrap_or(0),
        }
    }

    fn write8(&mut self, reg: RegOffset, val: u8) {
        match reg {
            ISTAT => {
                let v = Istat(val);
                if v.srst() {
                    self.soft_reset();
                }
                if v.sigp() {
                    self.doorbell.set();
                    self.doorbell_stamps.push(self.clock.stamp());
                }
                if v.intf() {
                    self.intf = false;
                }
            }
            DSTAT | SIST0 | SIST1 => {}
            SCNTL1 => {
                self.regs[usize::from(reg)] = val;
                if Scntl1(val).rst() {
                    debug!("chip: asserting SCSI RST");
                    self.bus_reset();
                }
            }
            CTEST3 => {
                self.regs[usize::from(reg)] = val & !CTEST3_CLF;
                if val & CTEST3_CLF != 0 {
                    self.dfe = true;
                    self.set_reg(NcrReg::DFIFO, 0);
                    self.set_reg(NcrReg::SSTAT0, 0);
                }
            }
            DSP_START => {
                self.regs[usize::from(reg)] = val;
                let dsp = self.reg32(NcrReg::DSP);
                self.resume(dsp);
            }
            _ => {
                if let Some(r) = self.regs.get_mut(usize::from(reg)) {
                    *r = val;
                } else {
                    warn!("chip: write to {:#04X} outside the register window", reg);
                }
            }
        }
    }
}
