//! Command lifecycle: submission, completion, abort and reset

use std::collections::{HashSet, VecDeque};
use std::fmt;

use anyhow::{Result, bail};
use arrayvec::ArrayVec;
use log::*;
use serde::{Deserialize, Serialize};

use crate::bus::RegisterBus;
use crate::ncr::adapter::{Adapter, TagOrder};
use crate::ncr::ccb::{CcbIndex, HostStatus, NegoKind, XE_OK};
use crate::ncr::error::SubmitError;
use crate::ncr::layout::{ResumeDescriptor, ScatterEntry, ccb, lcb_slot};
use crate::ncr::script::{Label, SCR_JUMP};
use crate::ncr::{MAX_LUN, MAX_TARGET};
use crate::scsi::*;
use crate::tickable::{TICKS_PER_SECOND, Ticks};
use crate::types::PhysAddr;

/// Caller-chosen handle of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A DMA-reachable buffer mapped by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSegment {
    pub addr: PhysAddr,
    pub len: u32,
}

pub const DEFAULT_TIMEOUT: Ticks = 10 * TICKS_PER_SECOND;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiCommand {
    pub id: CommandId,
    pub target: u8,
    pub lun: u8,
    pub cdb: Cdb,
    pub segments: Vec<DataSegment>,
    /// Relative deadline, counted from the moment the command is started
    pub timeout: Ticks,
}

impl ScsiCommand {
    pub fn new(id: CommandId, target: u8, lun: u8, cdb: Cdb) -> Self {
        Self {
            id,
            target,
            lun,
            cdb,
            segments: vec![],
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_segments(mut self, segments: Vec<DataSegment>) -> Self {
        self.segments = segments;
        self
    }

    pub fn with_timeout(mut self, timeout: Ticks) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn data_len(&self) -> u32 {
        self.segments.iter().map(|s| s.len).sum()
    }
}

/// Outcome of a command as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum CommandResult {
    Ok,
    CheckCondition,
    Busy,
    QueueFull,
    /// No device answered the selection
    SelectionTimeout,
    TimedOut,
    Reset,
    Aborted,
    ProtocolError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub id: CommandId,
    pub result: CommandResult,
    pub transferred: u32,
    pub residual: u32,
    /// Autosense data, present with [`CommandResult::CheckCondition`]
    pub sense: Option<Vec<u8>>,
}

impl Completion {
    /// Completion of a command that never reached the chip
    fn not_started(cmd: &ScsiCommand, result: CommandResult) -> Self {
        Self {
            id: cmd.id,
            result,
            transferred: 0,
            residual: cmd.data_len(),
            sense: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Submitted {
    /// Handed to the chip
    Accepted,
    /// Parked on the waiting list until resources free up
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AbortOutcome {
    /// Completed with `Aborted` before returning
    Done,
    /// Completion follows from housekeeping
    Pending,
    NotFound,
}

impl<C: RegisterBus> Adapter<C> {
    /// Accepts a command. It is either started right away or deferred; a
    /// completion is sent for every command that is not rejected here.
    pub fn submit(&mut self, cmd: ScsiCommand) -> Result<Submitted, SubmitError> {
        self.validate(&cmd)?;

        let lun_waiting = self
            .waiting
            .iter()
            .any(|w| w.target == cmd.target && w.lun == cmd.lun);
        if self.is_settling() || lun_waiting {
            return Ok(self.defer(cmd));
        }
        match self.try_start(cmd)? {
            None => {
                self.ring_doorbell();
                Ok(Submitted::Accepted)
            }
            Some(cmd) => Ok(self.defer(cmd)),
        }
    }

    fn validate(&mut self, cmd: &ScsiCommand) -> Result<(), SubmitError> {
        if cmd.target == self.config.own_id {
            return Err(SubmitError::OwnId(cmd.target));
        }
        if usize::from(cmd.target) >= MAX_TARGET {
            return Err(SubmitError::BadTarget(cmd.target));
        }
        if usize::from(cmd.lun) >= MAX_LUN {
            return Err(SubmitError::BadLun(cmd.lun));
        }
        match cdb_len(cmd.cdb.opcode()) {
            Some(len) if len != cmd.cdb.len() => return Err(SubmitError::BadCdb(cmd.cdb.len())),
            _ => {}
        }

        let tcb = &mut self.targets[usize::from(cmd.target)];
        if tcb.no_scan && tcb.inquiry.is_none() && cmd.cdb.opcode() == CMD_TEST_UNIT_READY {
            // Only the first scan command is refused
            tcb.no_scan = false;
            return Err(SubmitError::NoScan(cmd.target));
        }

        let max = self.script.max_scatter();
        if cmd.segments.len() > max {
            return Err(SubmitError::TooManySegments {
                count: cmd.segments.len(),
                max,
            });
        }
        for seg in &cmd.segments {
            if seg.len > 0x00FF_FFFF {
                return Err(SubmitError::SegmentTooLarge(seg.len));
            }
            if !self.mem.contains(seg.addr, seg.len as usize) {
                return Err(SubmitError::SegmentOutOfRange(seg.addr));
            }
        }
        Ok(())
    }

    fn defer(&mut self, cmd: ScsiCommand) -> Submitted {
        if self.debug.queue {
            debug!(
                "{}: {} to {}:{} deferred, {} waiting",
                self.name,
                cmd.id,
                cmd.target,
                cmd.lun,
                self.waiting.len() + 1
            );
        }
        self.profile.num_deferred += 1;
        self.waiting.push_back(cmd);
        Submitted::Deferred
    }

    /// Builds and queues a CCB for `cmd`. Hands the command back when no
    /// start queue slot, credit or CCB is available.
    pub(crate) fn try_start(&mut self, cmd: ScsiCommand) -> Result<Option<ScsiCommand>> {
        if !self.start_queue_has_room()? {
            return Ok(Some(cmd));
        }
        let Some(idx) = self.acquire_ccb(cmd.target, cmd.lun)? else {
            return Ok(Some(cmd));
        };
        self.prepare_ccb(idx, cmd)?;
        self.queue_ccb(idx)?;
        Ok(None)
    }

    fn tag_message(&mut self, target: u8, lun: u8) -> u8 {
        let order = self.order;
        let forced = self
            .lcb_mut(target, lun)
            .is_some_and(|l| std::mem::take(&mut l.force_ordered));
        match (forced, order) {
            (true, _) | (_, TagOrder::Ordered) => MSG_ORDERED_TAG,
            _ => MSG_SIMPLE_TAG,
        }
    }

    fn prepare_ccb(&mut self, idx: CcbIndex, cmd: ScsiCommand) -> Result<()> {
        let (t, lun) = (cmd.target, cmd.lun);
        let phys = self.ccbs[idx].phys;
        let tag = self.ccbs[idx].tag;
        let n = cmd.segments.len();

        let direction = match data_direction(cmd.cdb.opcode()) {
            _ if n == 0 => Direction::None,
            Direction::None => Direction::Unknown,
            d => d,
        };
        let (start, goal) = match direction {
            Direction::None => {
                let Some(end) = self.script.data_end(Direction::In) else {
                    bail!("No data section in script");
                };
                (end, end)
            }
            Direction::Unknown => {
                let io = self.script.addr(Label::DataIo);
                (io, io)
            }
            dir => match (self.script.data_start(dir, n), self.script.data_end(dir)) {
                (Some(s), Some(e)) => (s, e),
                _ => bail!("{} segments do not fit the data section", n),
            },
        };

        let first = self.script.max_scatter() - n;
        for (i, seg) in cmd.segments.iter().enumerate() {
            ScatterEntry {
                len: seg.len,
                addr: seg.addr,
            }
            .write(&mut self.mem, phys + ccb::data_entry(first + i))?;
        }

        let nego = self.choose_negotiation(t, lun);
        let tcb = &self.targets[usize::from(t)];
        let mut msg = ArrayVec::<u8, { ccb::MSGOUT_LEN }>::new();
        msg.push(MSG_IDENTIFY | lun | if tcb.no_disconnect { 0 } else { MSG_IDENTIFY_DISC });
        if tag != 0 {
            msg.push(self.tag_message(t, lun));
            msg.push(tag);
        }
        if nego != NegoKind::None {
            let extra = self.nego_message(t, nego);
            if msg.try_extend_from_slice(&extra).is_err() {
                bail!("Message out buffer overflow");
            }
        }

        let tcb = &self.targets[usize::from(t)];
        let (sxfer, scntl3) = (tcb.sxfer, tcb.scntl3);
        let lcb_phys = match self.lcb(t, lun) {
            Some(l) => l.phys,
            None => bail!("LCB {}:{} missing", t, lun),
        };

        let m = &mut self.mem;
        m.write_bytes(phys + ccb::MSGOUT, &msg)?;
        ScatterEntry {
            len: msg.len() as u32,
            addr: phys + ccb::MSGOUT,
        }
        .write(m, phys + ccb::SMSG_TBL)?;
        m.write_bytes(phys + ccb::CDB, cmd.cdb.as_slice())?;
        ScatterEntry {
            len: cmd.cdb.len() as u32,
            addr: phys + ccb::CDB,
        }
        .write(m, phys + ccb::CMD_TBL)?;

        let mut sense_cdb = Cdb::request_sense(ccb::SENSE_LEN as u8).as_slice().to_vec();
        sense_cdb[1] = lun << 5;
        m.write_bytes(phys + ccb::SENSE_CDB, &sense_cdb)?;
        ScatterEntry {
            len: sense_cdb.len() as u32,
            addr: phys + ccb::SENSE_CDB,
        }
        .write(m, phys + ccb::SENSE_CMD_TBL)?;
        ScatterEntry {
            len: ccb::SENSE_LEN as u32,
            addr: phys + ccb::SENSE,
        }
        .write(m, phys + ccb::SENSE_TBL)?;
        m.write_bytes(phys + ccb::SENSE, &[0; ccb::SENSE_LEN])?;

        m.write_bytes(phys + ccb::SELECT, &[0, sxfer, t, scntl3])?;
        m.write_u8(phys + ccb::LUN, lun)?;
        m.write_u8(phys + ccb::TAG, tag)?;
        m.write_u8(phys + ccb::SCSI_STATUS, 0xFF)?;
        m.write_u8(phys + ccb::PARITY_STATUS, 0)?;
        m.write_u8(phys + ccb::XERR_STATUS, XE_OK)?;
        m.write_u8(phys + ccb::NEGO_STATUS, nego as u8)?;
        for at in ccb::RESUME {
            ResumeDescriptor::default().write(m, phys + at)?;
        }
        m.write_u32(phys + ccb::SAVEP, start)?;
        m.write_u32(phys + ccb::LASTP, start)?;
        m.write_u32(phys + ccb::GOALP, goal)?;
        m.write_u32(phys + ccb::LAUNCH_CMD, SCR_JUMP)?;
        let select = self.script.addr(Label::Select);
        m.write_u32(phys + ccb::LAUNCH_ADDR, select)?;
        let hs = if nego == NegoKind::None {
            HostStatus::Busy
        } else {
            HostStatus::Negotiate
        };
        m.write_u8(phys + ccb::HOST_STATUS, hs as u8)?;
        m.write_u32(lcb_phys + lcb_slot(tag), phys)?;

        if nego != NegoKind::None {
            let tcb = &mut self.targets[usize::from(t)];
            tcb.nego = nego;
            tcb.nego_ccb = Some(idx);
        }

        trace!(
            "{}: {} -> CCB {:#010X}, {}:{} tag {} {:?} {} bytes",
            self.name,
            cmd.id,
            phys,
            t,
            lun,
            tag,
            direction,
            cmd.data_len()
        );

        let c = &mut self.ccbs[idx];
        c.deadline = self.now + cmd.timeout;
        c.direction = direction;
        c.segments = n;
        c.data_len = cmd.data_len();
        c.nego = nego;
        c.cmd = Some(cmd);
        Ok(())
    }

    /// Translates the final status bytes of a CCB, reports the command and
    /// returns the CCB to its LUN.
    pub(crate) fn complete_ccb(&mut self, idx: CcbIndex) -> Result<()> {
        let phys = self.ccbs[idx].phys;
        let Some(cmd) = self.ccbs[idx].cmd.take() else {
            bail!("CCB {:#010X} completed without a command", phys);
        };
        let hs = self.host_status(idx)?;
        let status = self.mem.read_u8(phys + ccb::SCSI_STATUS)?;
        let xerr = self.mem.read_u8(phys + ccb::XERR_STATUS)?;
        let (t, lun) = (cmd.target, cmd.lun);

        let aborted = self.ccbs[idx].abort_requested;
        let result = match hs {
            HostStatus::Complete if xerr != XE_OK => CommandResult::ProtocolError,
            HostStatus::Complete => match status {
                STATUS_GOOD | STATUS_CONDITION_MET => CommandResult::Ok,
                STATUS_CHECK_CONDITION => CommandResult::CheckCondition,
                STATUS_BUSY | STATUS_RESERVATION_CONFLICT => CommandResult::Busy,
                STATUS_QUEUE_FULL => CommandResult::QueueFull,
                _ => CommandResult::ProtocolError,
            },
            HostStatus::SelTimeout => CommandResult::SelectionTimeout,
            HostStatus::Reset => CommandResult::Reset,
            HostStatus::Aborted | HostStatus::Timeout if aborted => CommandResult::Aborted,
            HostStatus::Aborted | HostStatus::Timeout => CommandResult::TimedOut,
            HostStatus::Fail | HostStatus::Unexpected => CommandResult::ProtocolError,
            HostStatus::Idle | HostStatus::Busy | HostStatus::Negotiate | HostStatus::Disconnect => {
                error!(
                    "{}: CCB {:#010X} completed in state {:?}",
                    self.name, phys, hs
                );
                CommandResult::ProtocolError
            }
        };
        if xerr != XE_OK {
            warn!(
                "{}: {} on {}:{}: extended error {:#04X}",
                self.name, cmd.id, t, lun, xerr
            );
        }

        let data_len = self.ccbs[idx].data_len;
        let residual = if hs == HostStatus::Complete {
            self.residual(idx)?.min(data_len)
        } else {
            data_len
        };
        let transferred = data_len - residual;

        let sense = if result == CommandResult::CheckCondition {
            let mut buf = [0; ccb::SENSE_LEN];
            self.mem.read_bytes(phys + ccb::SENSE, &mut buf)?;
            let n = match sense_len(&buf) {
                0 => ccb::SENSE_LEN,
                n => n,
            };
            Some(buf[..n].to_vec())
        } else {
            None
        };

        if self.targets[usize::from(t)].nego_ccb == Some(idx) {
            self.nego_abandoned(idx)?;
        }
        let tcb = &mut self.targets[usize::from(t)];
        if tcb.hold_ccb == Some(idx) {
            tcb.hold_ccb = None;
        }

        if result == CommandResult::Ok
            && lun == 0
            && cmd.cdb.opcode() == CMD_INQUIRY
            && transferred >= 8
        {
            let data = self.read_segments(&cmd.segments, 8)?;
            let mut inq = [0; 8];
            inq.copy_from_slice(&data);
            debug!(
                "{}: target {}: inquiry version {} flags {:#04X}",
                self.name,
                t,
                inq[2] & 7,
                inq[7]
            );
            self.targets[usize::from(t)].set_inquiry(inq);
        }

        self.release_ccb(idx)?;

        match result {
            CommandResult::QueueFull => {
                self.profile.num_queue_full += 1;
                if let Some(depth) = self.lcb_mut(t, lun).and_then(|l| l.queue_full()) {
                    warn!(
                        "{}: {}:{}: queue full, depth lowered to {}",
                        self.name, t, lun, depth
                    );
                }
            }
            CommandResult::Ok => {
                let recovery = self.config.queue_full_recovery;
                if let Some(depth) = self.lcb_mut(t, lun).and_then(|l| l.success(recovery)) {
                    if self.debug.tags {
                        info!(
                            "{}: {}:{}: depth raised to {}",
                            self.name, t, lun, depth
                        );
                    }
                }
            }
            CommandResult::TimedOut => self.profile.num_timeout += 1,
            _ => {}
        }

        self.profile.num_trans += 1;
        self.profile.num_bytes += u64::from(transferred);
        let stats = &mut self.targets[usize::from(t)].stats;
        stats.commands += 1;
        stats.bytes += u64::from(transferred);

        if self.targets[usize::from(t)].trace || self.debug.queue {
            debug!(
                "{}: {} done: {:?}, {} transferred, {} residual",
                self.name, cmd.id, result, transferred, residual
            );
        }
        self.send_completion(Completion {
            id: cmd.id,
            result,
            transferred,
            residual,
            sense,
        });
        self.drain_waiting()
    }

    /// Bytes the chip did not move, derived from the last data pointer
    fn residual(&self, idx: CcbIndex) -> Result<u32> {
        let c = &self.ccbs[idx];
        let lastp = self.mem.read_u32(c.phys + ccb::LASTP)?;
        let goalp = self.mem.read_u32(c.phys + ccb::GOALP)?;
        if lastp == goalp {
            return Ok(c.residue_adjust);
        }

        let table_rest = |from: usize| -> Result<u32> {
            let mut sum = 0;
            for i in from..self.script.max_scatter() {
                sum += ScatterEntry::read(&self.mem, c.phys + ccb::data_entry(i))?.len;
            }
            Ok(sum)
        };

        let rest = if lastp == self.script.addr(Label::DataIo) {
            c.data_len
        } else if let Some(i) = self.script.entry_index(c.direction, lastp) {
            table_rest(i)?
        } else if ccb::RESUME.iter().any(|&o| c.phys + o == lastp) {
            let d = ResumeDescriptor::read(&self.mem, lastp)?;
            let next = match self.script.entry_index(c.direction, d.next) {
                Some(i) => table_rest(i)?,
                None => 0,
            };
            d.remaining + next
        } else {
            warn!(
                "{}: CCB {:#010X}: last pointer {:#010X} outside the data section",
                self.name, c.phys, lastp
            );
            c.data_len
        };
        Ok(rest + c.residue_adjust)
    }

    fn read_segments(&self, segments: &[DataSegment], len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        for seg in segments {
            if out.len() >= len {
                break;
            }
            let mut buf = vec![0; (len - out.len()).min(seg.len as usize)];
            self.mem.read_bytes(seg.addr, &mut buf)?;
            out.extend_from_slice(&buf);
        }
        if out.len() < len {
            bail!("Data buffer shorter than {} bytes", len);
        }
        Ok(out)
    }

    fn send_completion(&mut self, completion: Completion) {
        let id = completion.id;
        if let Err(e) = self.completions.send(completion) {
            warn!("{}: completion of {} lost: {}", self.name, id, e);
        }
    }

    /// Completes every CCB the chip posted to the done queue
    pub(crate) fn drain_done_queue(&mut self) -> Result<()> {
        loop {
            let put = self.mem.read_u32(self.ncb.done_put())? as usize;
            if put == self.done_get {
                return Ok(());
            }
            if put >= self.ncb.done_slots {
                bail!("Done queue index {} out of range", put);
            }
            let slot = self.ncb.done_slot(self.done_get);
            let phys = self.mem.read_u32(slot)?;
            self.mem.write_u32(slot, 0)?;
            self.done_get = (self.done_get + 1) % self.ncb.done_slots;

            match self.ccbs.lookup_by_dsa(phys) {
                Some(idx) if self.ccbs[idx].in_use => self.complete_ccb(idx)?,
                _ => warn!(
                    "{}: stale done queue entry {:#010X}",
                    self.name, phys
                ),
            }
        }
    }

    /// Starts waiting commands in arrival order. A LUN that cannot take a
    /// command blocks the ones behind it, other LUNs go ahead.
    pub(crate) fn drain_waiting(&mut self) -> Result<()> {
        if self.is_settling() || self.waiting.is_empty() {
            return Ok(());
        }
        let mut blocked = HashSet::new();
        let mut keep = VecDeque::new();
        let mut started = 0;
        while let Some(cmd) = self.waiting.pop_front() {
            let nexus = (cmd.target, cmd.lun);
            if blocked.contains(&nexus) {
                keep.push_back(cmd);
                continue;
            }
            match self.try_start(cmd)? {
                None => started += 1,
                Some(cmd) => {
                    blocked.insert(nexus);
                    keep.push_back(cmd);
                }
            }
        }
        self.waiting = keep;
        if started > 0 {
            if self.debug.queue {
                debug!(
                    "{}: started {} waiting commands, {} left",
                    self.name,
                    started,
                    self.waiting.len()
                );
            }
            self.ring_doorbell();
        }
        Ok(())
    }

    /// Aborts a command. A waiting command completes before this returns,
    /// one the chip may already see is neutralized and finalized by the
    /// next housekeeping pass.
    pub fn abort(&mut self, id: CommandId) -> Result<AbortOutcome> {
        if let Some(pos) = self.waiting.iter().position(|c| c.id == id) {
            if let Some(cmd) = self.waiting.remove(pos) {
                debug!("{}: {} aborted while waiting", self.name, id);
                self.send_completion(Completion::not_started(&cmd, CommandResult::Aborted));
            }
            return Ok(AbortOutcome::Done);
        }

        let Some(idx) = self.ccbs.find_command(id) else {
            return Ok(AbortOutcome::NotFound);
        };
        let (phys, slot) = (self.ccbs[idx].phys, self.ccbs[idx].queued_slot);
        if let Some(slot) = slot {
            if self.slot_pending(slot, phys)? {
                let skip = self.script.addr(Label::Skip);
                self.mem.write_u32(phys + ccb::LAUNCH_ADDR, skip)?;
                self.mem.fence();
            }
        }
        let c = &mut self.ccbs[idx];
        c.abort_requested = true;
        c.deadline = 0;
        debug!("{}: {} abort pending", self.name, id);
        Ok(AbortOutcome::Pending)
    }

    /// Resets the SCSI bus on behalf of `id`. Every outstanding and waiting
    /// command completes with `Reset`, `id` exactly once even if it is
    /// unknown.
    pub fn reset(&mut self, id: CommandId) -> Result<()> {
        let mut found = self.ccbs.find_command(id).is_some();
        warn!("{}: bus reset requested by {}", self.name, id);
        self.reset_bus(None)?;

        for cmd in std::mem::take(&mut self.waiting) {
            found |= cmd.id == id;
            self.send_completion(Completion::not_started(&cmd, CommandResult::Reset));
        }
        if !found {
            self.send_completion(Completion {
                id,
                result: CommandResult::Reset,
                transferred: 0,
                residual: 0,
                sense: None,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testbus::Testbus;
    use crate::dma::DmaMemory;
    use crate::ncr::adapter::CompletionReceiver;
    use crate::ncr::config::{AdapterConfig, TargetConfig};
    use crate::ncr::regs::NcrReg;

    fn attach_with(config: AdapterConfig) -> (Adapter<Testbus>, CompletionReceiver) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mem = DmaMemory::new(config.memory_base, config.memory_size);
        (Adapter::attach(config, Testbus::new(), mem, tx).unwrap(), rx)
    }

    fn attach() -> (Adapter<Testbus>, CompletionReceiver) {
        attach_with(AdapterConfig::default())
    }

    fn buffer(a: &mut Adapter<Testbus>, len: usize) -> DataSegment {
        DataSegment {
            addr: a.memory_mut().alloc(len, 16).unwrap(),
            len: len as u32,
        }
    }

    fn read(a: &mut Adapter<Testbus>, id: u64, target: u8, len: usize) -> ScsiCommand {
        let seg = buffer(a, len);
        ScsiCommand::new(CommandId(id), target, 0, Cdb::read_10(0, (len / 512) as u16))
            .with_segments(vec![seg])
    }

    #[test]
    fn rejects_invalid_commands() {
        let (mut a, rx) = attach();
        let tur = |t, l| ScsiCommand::new(CommandId(1), t, l, Cdb::test_unit_ready());
        assert!(matches!(a.submit(tur(7, 0)), Err(SubmitError::OwnId(7))));
        assert!(matches!(a.submit(tur(16, 0)), Err(SubmitError::BadTarget(16))));
        assert!(matches!(a.submit(tur(1, 8)), Err(SubmitError::BadLun(8))));

        let short = Cdb::from_slice(&[CMD_READ_10, 0, 0, 0, 0, 0]).unwrap();
        assert!(matches!(
            a.submit(ScsiCommand::new(CommandId(2), 1, 0, short)),
            Err(SubmitError::BadCdb(6))
        ));

        let segs = vec![
            DataSegment {
                addr: a.memory().base(),
                len: 512
            };
            18
        ];
        assert!(matches!(
            a.submit(tur(1, 0).with_segments(segs)),
            Err(SubmitError::TooManySegments { count: 18, max: 17 })
        ));
        let huge = DataSegment {
            addr: a.memory().base(),
            len: 0x0100_0000,
        };
        assert!(matches!(
            a.submit(tur(1, 0).with_segments(vec![huge])),
            Err(SubmitError::SegmentTooLarge(_))
        ));
        let outside = DataSegment {
            addr: 0x10,
            len: 512,
        };
        assert!(matches!(
            a.submit(tur(1, 0).with_segments(vec![outside])),
            Err(SubmitError::SegmentOutOfRange(0x10))
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(a.active_len(), 0);
    }

    #[test]
    fn no_scan_refuses_first_scan_only() {
        let (mut a, _rx) = attach_with(AdapterConfig {
            targets: vec![TargetConfig {
                id: 3,
                no_scan: true,
                ..Default::default()
            }],
            ..Default::default()
        });
        let tur = ScsiCommand::new(CommandId(1), 3, 0, Cdb::test_unit_ready());
        assert!(matches!(a.submit(tur.clone()), Err(SubmitError::NoScan(3))));
        assert_eq!(a.submit(tur).unwrap(), Submitted::Accepted);
    }

    #[test]
    fn submit_builds_ccb_before_doorbell() {
        let (mut a, _rx) = attach();
        let cmd = read(&mut a, 1, 2, 4096);
        a.chip_mut().reset_trace();
        assert_eq!(a.submit(cmd).unwrap(), Submitted::Accepted);

        assert_eq!(a.chip().writes_to(NcrReg::ISTAT.offset()), vec![0x20]);
        assert!(!a.memory().has_posted_writes());
        let idx = a.ccbs.find_command(CommandId(1)).unwrap();
        let phys = a.ccbs[idx].phys;
        let m = a.memory();
        assert_eq!(m.dev_read_u32(a.script().slot_operand(0)).unwrap(), phys);
        assert_eq!(
            m.dev_read_u32(a.script().slot_operand(1)).unwrap(),
            a.script().addr(Label::Idle)
        );
        assert_eq!(
            m.dev_read_u32(phys + ccb::LAUNCH_ADDR).unwrap(),
            a.script().addr(Label::Select)
        );
        // identify with the disconnect privilege, no negotiation before INQUIRY
        assert_eq!(m.dev_read_u8(phys + ccb::MSGOUT).unwrap(), 0xC0);
        assert_eq!(
            m.dev_read_u8(phys + ccb::HOST_STATUS).unwrap(),
            HostStatus::Busy as u8
        );
        let start = a.script().data_start(Direction::In, 1).unwrap();
        assert_eq!(m.dev_read_u32(phys + ccb::SAVEP).unwrap(), start);
        assert_eq!(
            m.dev_read_u32(phys + ccb::GOALP).unwrap(),
            a.script().data_end(Direction::In).unwrap()
        );
        assert_eq!(m.dev_read_u32(phys + ccb::data_entry(16)).unwrap(), 4096);
        let lcb = a.lcb(2, 0).unwrap().phys;
        assert_eq!(m.dev_read_u32(lcb + lcb_slot(0)).unwrap(), phys);
        a.verify_invariants().unwrap();
    }

    #[test]
    fn second_command_to_untagged_lun_waits() {
        let (mut a, rx) = attach();
        let first = read(&mut a, 1, 2, 512);
        let second = read(&mut a, 2, 2, 512);
        let other = read(&mut a, 3, 4, 512);
        assert_eq!(a.submit(first).unwrap(), Submitted::Accepted);
        assert_eq!(a.submit(second).unwrap(), Submitted::Deferred);
        assert_eq!(a.submit(other).unwrap(), Submitted::Accepted);
        assert_eq!(a.waiting_len(), 1);
        assert_eq!(a.profile().num_deferred, 1);

        assert_eq!(a.abort(CommandId(2)).unwrap(), AbortOutcome::Done);
        let c = rx.try_recv().unwrap();
        assert_eq!(c.id, CommandId(2));
        assert_eq!(c.result, CommandResult::Aborted);
        assert_eq!(c.residual, 512);
        assert_eq!(a.abort(CommandId(9)).unwrap(), AbortOutcome::NotFound);
    }

    #[test]
    fn abort_neutralizes_queued_ccb() {
        let (mut a, _rx) = attach();
        let cmd = read(&mut a, 1, 2, 512);
        a.submit(cmd).unwrap();
        assert_eq!(a.abort(CommandId(1)).unwrap(), AbortOutcome::Pending);
        let idx = a.ccbs.find_command(CommandId(1)).unwrap();
        let phys = a.ccbs[idx].phys;
        assert_eq!(
            a.memory().dev_read_u32(phys + ccb::LAUNCH_ADDR).unwrap(),
            a.script().addr(Label::Skip)
        );
        assert!(a.ccbs[idx].abort_requested);
        assert_eq!(a.ccbs[idx].deadline, 0);
    }

    #[test]
    fn completion_translates_status() {
        let (mut a, rx) = attach();
        let cmd = read(&mut a, 1, 2, 1024);
        a.submit(cmd).unwrap();
        let idx = a.ccbs.find_command(CommandId(1)).unwrap();
        let phys = a.ccbs[idx].phys;
        let goal = a.script().data_end(Direction::In).unwrap();
        let m = a.memory_mut();
        m.dev_write_u8(phys + ccb::HOST_STATUS, HostStatus::Complete as u8)
            .unwrap();
        m.dev_write_u8(phys + ccb::SCSI_STATUS, STATUS_GOOD).unwrap();
        m.dev_write_u32(phys + ccb::LASTP, goal).unwrap();

        a.complete_ccb(idx).unwrap();
        let c = rx.try_recv().unwrap();
        assert_eq!(c.result, CommandResult::Ok);
        assert_eq!(c.transferred, 1024);
        assert_eq!(c.residual, 0);
        assert_eq!(a.active_len(), 0);
        assert_eq!(
            a.memory().read_u8(phys + ccb::HOST_STATUS).unwrap(),
            HostStatus::Idle as u8
        );
        a.verify_invariants().unwrap();
    }

    #[test]
    fn residual_from_untouched_table() {
        let (mut a, rx) = attach();
        let s1 = buffer(&mut a, 512);
        let s2 = buffer(&mut a, 1024);
        let cmd = ScsiCommand::new(CommandId(1), 2, 0, Cdb::read_10(0, 3))
            .with_segments(vec![s1, s2]);
        a.submit(cmd).unwrap();
        let idx = a.ccbs.find_command(CommandId(1)).unwrap();
        let phys = a.ccbs[idx].phys;
        let second = a.script().data_start(Direction::In, 1).unwrap();
        let m = a.memory_mut();
        m.dev_write_u8(phys + ccb::HOST_STATUS, HostStatus::Complete as u8)
            .unwrap();
        m.dev_write_u8(phys + ccb::SCSI_STATUS, STATUS_GOOD).unwrap();
        m.dev_write_u32(phys + ccb::LASTP, second).unwrap();
        a.complete_ccb(idx).unwrap();

        let c = rx.try_recv().unwrap();
        assert_eq!(c.transferred, 512);
        assert_eq!(c.residual, 1024);
    }

    #[test]
    fn reset_completes_unknown_command_once() {
        let (mut a, rx) = attach();
        a.reset(CommandId(42)).unwrap();
        let c = rx.try_recv().unwrap();
        assert_eq!(c.id, CommandId(42));
        assert_eq!(c.result, CommandResult::Reset);
        assert!(rx.try_recv().is_err());
        assert!(a.is_settling());
        assert_eq!(a.profile().num_reset, 1);
    }

    #[test]
    fn reset_flushes_waiting_and_active() {
        let (mut a, rx) = attach();
        let first = read(&mut a, 1, 2, 512);
        let second = read(&mut a, 2, 2, 512);
        a.submit(first).unwrap();
        a.submit(second).unwrap();
        a.reset(CommandId(2)).unwrap();

        let mut got: Vec<_> = rx.try_iter().map(|c| (c.id.0, c.result)).collect();
        got.sort_unstable_by_key(|&(id, _)| id);
        assert_eq!(
            got,
            vec![(1, CommandResult::Reset), (2, CommandResult::Reset)]
        );
        assert_eq!(a.active_len(), 0);
        assert_eq!(a.waiting_len(), 0);
        a.verify_invariants().unwrap();

        // settling defers new work
        let third = read(&mut a, 3, 2, 512);
        assert_eq!(a.submit(third).unwrap(), Submitted::Deferred);
    }
}
