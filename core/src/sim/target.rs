//! Simulated SCSI devices
//!
//! A target turns every selection into a job: a queue of bus phases it
//! will drive once connected. Behaviors queued with
//! [`SimTarget::push_behavior`] reshape the job of the next command.

use std::collections::VecDeque;

use log::*;
use serde::Serialize;

use crate::ncr::MAX_LUN;
use crate::ncr::negotiation::{sdtr, wdtr};
use crate::scsi::*;
use crate::tickable::Ticks;

/// Vendor specific READ, 16 bytes per count in byte 4
pub const VENDOR_READ: u8 = 0xE8;
/// Vendor specific WRITE, 16 bytes per count in byte 4
pub const VENDOR_WRITE: u8 = 0xEA;

/// Result of a command
#[derive(Debug, Clone, PartialEq, Eq)]
enum CmdResult {
    /// Immediately turn to the Status phase
    Status(u8),
    /// Returns data to the initiator
    DataIn(Vec<u8>),
    /// Expects data written to target
    DataOut(usize),
}

/// Bus phase driven by a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    MsgIn(Vec<u8>),
    DataIn(Vec<u8>),
    DataOut(usize),
    Status(u8),
    Complete,
    /// SAVE DATA POINTER (if `save`) and DISCONNECT. `hold` is the time until
    /// reselection, `None` never comes back.
    Disconnect { save: bool, hold: Option<Ticks> },
    /// Drops BSY without a message
    BusFree,
    /// Stops handshaking in the middle of a phase
    HandshakeTimeout,
    /// Holds the bus forever
    Stall,
}

/// Scripted deviation from normal operation, applied to one command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SimBehavior {
    #[default]
    Normal,
    /// No data, just this status byte
    Status(u8),
    CheckCondition { sense: Vec<u8> },
    /// CHECK CONDITION, and the first REQUEST SENSE selection loses arbitration
    SensePreempted { sense: Vec<u8> },
    /// Disconnects after the command phase
    Disconnect { hold: Ticks },
    /// Disconnects after `at` bytes, with SAVE DATA POINTER
    PhaseMismatch { at: usize, hold: Ticks },
    /// Disconnects after `at` bytes without saving, restarts from the last
    /// saved pointer on reselection
    DisconnectWithoutSave { at: usize, hold: Ticks },
    /// Disconnects and never reselects
    Hang,
    /// Holds the bus after the command phase
    Stuck,
    /// Goes bus free after `at` bytes of data
    UnexpectedDisconnect { at: usize },
    HandshakeTimeout { at: usize },
    /// Moves `extra` bytes more than the command asked for
    Overrun { extra: usize },
    /// Moves `short` bytes less than the command asked for
    Underrun { short: usize },
    /// Last data byte is flagged invalid with IGNORE WIDE RESIDUE
    IgnoreWideResidue,
    /// Sends SDTR before the command executes
    InitiateSync { period: u8, offset: u8 },
    /// Sends WDTR before the command executes
    InitiateWide { width: u8 },
    /// Answers negotiation with MESSAGE REJECT
    RejectNegotiation,
    /// Goes on to the command as if no negotiation was offered
    IgnoreNegotiation,
    /// Answers SDTR with WDTR and vice versa
    WrongNegotiationAnswer,
    /// Answers with a truncated extended message
    MalformedNegotiation,
    /// Sends a message the initiator does not know
    UnknownMessage,
}

/// Device capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SimCaps {
    pub sync: bool,
    pub wide: bool,
    pub tagged: bool,
    /// Fastest period factor accepted in an SDTR answer
    pub min_period: u8,
    pub max_offset: u8,
}

impl Default for SimCaps {
    fn default() -> Self {
        Self {
            sync: true,
            wide: true,
            tagged: true,
            min_period: 25,
            max_offset: 8,
        }
    }
}

/// Transfer agreement as the target sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Agreement {
    pub period: u8,
    pub offset: u8,
    pub width: u8,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SimTargetStats {
    pub commands: u64,
    /// Selections that reused the nexus of a job still in progress
    pub tag_collisions: u64,
    pub reselections: u64,
    /// Jobs dropped by the initiator or a bus reset
    pub dropped: u64,
}

#[derive(Debug)]
struct Job {
    lun: u8,
    tag: u8,
    steps: VecDeque<Step>,
    /// Set while disconnected; `None` inside means never
    reselect_at: Option<Option<Ticks>>,
    write_lba: Option<u32>,
    received: Vec<u8>,
    /// Bytes of `received` covered by the last saved data pointer
    saved: usize,
}

/// Negotiation message received during selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegoRequest {
    Sync { period: u8, offset: u8 },
    Wide { width: u8 },
}

pub struct SimTarget {
    id: u8,
    caps: SimCaps,
    block_size: usize,
    inquiry: [u8; 36],
    behaviors: VecDeque<SimBehavior>,
    jobs: Vec<Job>,
    sense: [Option<Vec<u8>>; MAX_LUN],
    preempt: bool,
    agreed: Agreement,
    /// Negotiation answer sent, reverted if the initiator rejects it
    proposed: Option<Agreement>,
    tag_messages: Vec<u8>,
    writes: Vec<(u32, Vec<u8>)>,
    stats: SimTargetStats,
}

/// Fixed format sense data
pub fn sense_data(key: u8, asc: u8, ascq: u8) -> Vec<u8> {
    let mut s = vec![0; 18];
    s[0] = 0x70;
    s[2] = key & 0x0F;
    s[7] = 10;
    s[12] = asc;
    s[13] = ascq;
    s
}

impl SimTarget {
    pub fn new(id: u8) -> Self {
        Self::with_caps(id, SimCaps::default())
    }

    pub fn with_caps(id: u8, caps: SimCaps) -> Self {
        let mut inquiry = [0; 36];
        inquiry[2] = 2;
        inquiry[3] = 2;
        inquiry[4] = 31;
        inquiry[7] = if caps.wide { INQ7_WBUS16 } else { 0 }
            | if caps.sync { INQ7_SYNC } else { 0 }
            | if caps.tagged { INQ7_CMDQUE } else { 0 };
        inquiry[8..16].copy_from_slice(b"NCRSIM  ");
        inquiry[16..32].copy_from_slice(b"VIRTUAL DISK    ");
        inquiry[32..36].copy_from_slice(b"1.00");
        Self {
            id,
            caps,
            block_size: 512,
            inquiry,
            behaviors: VecDeque::new(),
            jobs: vec![],
            sense: Default::default(),
            preempt: false,
            agreed: Agreement::default(),
            proposed: None,
            tag_messages: vec![],
            writes: vec![],
            stats: SimTargetStats::default(),
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn caps(&self) -> SimCaps {
        self.caps
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Queues a behavior for the next command that is not a REQUEST SENSE
    pub fn push_behavior(&mut self, behavior: SimBehavior) {
        self.behaviors.push_back(behavior);
    }

    pub fn agreement(&self) -> Agreement {
        self.agreed
    }

    /// Tag message type of every tagged selection, in order
    pub fn tag_messages(&self) -> &[u8] {
        &self.tag_messages
    }

    /// Data of completed writes with their starting block
    pub fn writes(&self) -> &[(u32, Vec<u8>)] {
        &self.writes
    }

    pub fn stats(&self) -> &SimTargetStats {
        &self.stats
    }

    /// Jobs selected and not yet completed
    pub fn jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn disconnected_jobs(&self) -> usize {
        self.jobs.iter().filter(|j| j.reselect_at.is_some()).count()
    }

    /// Read data pattern of this target
    pub fn pattern(&self, lba: u32, len: usize) -> Vec<u8> {
        let base = lba as usize * self.block_size;
        (0..len)
            .map(|i| (base + i) as u8 ^ self.id.wrapping_mul(0x11))
            .collect()
    }

    fn cmd(&mut self, lun: u8, cdb: &[u8]) -> CmdResult {
        let alloc = usize::from(cdb.get(4).copied().unwrap_or(0));
        match cdb[0] {
            CMD_TEST_UNIT_READY | CMD_SYNCHRONIZE_CACHE | CMD_VERIFY => {
                CmdResult::Status(STATUS_GOOD)
            }
            CMD_REQUEST_SENSE => {
                let mut s = self.sense[usize::from(lun)]
                    .take()
                    .unwrap_or_else(|| sense_data(0, 0, 0));
                s.truncate(alloc);
                CmdResult::DataIn(s)
            }
            CMD_INQUIRY => {
                let mut inq = self.inquiry.to_vec();
                if lun != 0 {
                    // no device at this LUN
                    inq[0] = 0x7F;
                }
                inq.truncate(alloc);
                CmdResult::DataIn(inq)
            }
            CMD_READ_CAPACITY => {
                let mut result = vec![0; 8];
                result[0..4].copy_from_slice(&0x000F_FFFFu32.to_be_bytes());
                result[4..8].copy_from_slice(&(self.block_size as u32).to_be_bytes());
                CmdResult::DataIn(result)
            }
            CMD_READ_6 | CMD_READ_10 | CMD_WRITE_6 | CMD_WRITE_10 => {
                let Some((lba, blocks)) =
                    Cdb::from_slice(cdb).and_then(|c| Some((c.lba()?, c.blocks()?)))
                else {
                    self.sense[usize::from(lun)] = Some(sense_data(5, 0x24, 0));
                    return CmdResult::Status(STATUS_CHECK_CONDITION);
                };
                let len = blocks as usize * self.block_size;
                if matches!(cdb[0], CMD_READ_6 | CMD_READ_10) {
                    CmdResult::DataIn(self.pattern(lba, len))
                } else {
                    CmdResult::DataOut(len)
                }
            }
            VENDOR_READ => CmdResult::DataIn(self.pattern(0, alloc * 16)),
            VENDOR_WRITE => CmdResult::DataOut(alloc * 16),
            op => {
                debug!("target {}: unsupported opcode {:#04X}", self.id, op);
                // ILLEGAL REQUEST, invalid command operation code
                self.sense[usize::from(lun)] = Some(sense_data(5, 0x20, 0));
                CmdResult::Status(STATUS_CHECK_CONDITION)
            }
        }
    }

    fn answer(&mut self, req: NegoRequest, behavior: &SimBehavior) -> Option<Vec<u8>> {
        match behavior {
            SimBehavior::RejectNegotiation => return Some(vec![MSG_REJECT]),
            SimBehavior::IgnoreNegotiation => return None,
            SimBehavior::WrongNegotiationAnswer => {
                return Some(match req {
                    NegoRequest::Sync { .. } => wdtr(0).to_vec(),
                    NegoRequest::Wide { .. } => sdtr(self.caps.min_period, 0).to_vec(),
                });
            }
            SimBehavior::MalformedNegotiation => {
                return Some(match req {
                    NegoRequest::Sync { period, .. } => vec![MSG_EXTENDED, 2, MSG_X_SYNC_REQ, period],
                    NegoRequest::Wide { width } => vec![MSG_EXTENDED, 1, MSG_X_WIDE_REQ, width],
                });
            }
            _ => {}
        }
        match req {
            NegoRequest::Sync { .. } if !self.caps.sync => Some(vec![MSG_REJECT]),
            NegoRequest::Wide { .. } if !self.caps.wide => Some(vec![MSG_REJECT]),
            NegoRequest::Sync { period, offset } => {
                let offset = offset.min(self.caps.max_offset);
                let period = if offset == 0 {
                    0
                } else {
                    period.max(self.caps.min_period)
                };
                self.propose(Agreement {
                    period,
                    offset,
                    ..self.agreed
                });
                Some(sdtr(period, offset).to_vec())
            }
            NegoRequest::Wide { width } => {
                let width = width.min(1);
                self.propose(Agreement {
                    period: 0,
                    offset: 0,
                    width,
                });
                Some(wdtr(width).to_vec())
            }
        }
    }

    fn propose(&mut self, agreement: Agreement) {
        self.proposed = Some(self.agreed);
        self.agreed = agreement;
    }

    /// Selection with ATN: `msgout` holds IDENTIFY, an optional tag message
    /// and an optional negotiation message. Returns the nexus (LUN, tag).
    pub(super) fn select(&mut self, msgout: &[u8], cdb: &[u8], sense: bool) -> (u8, u8) {
        let identify = msgout.first().copied().unwrap_or(MSG_IDENTIFY);
        let lun = identify & 7;
        let may_disconnect = identify & MSG_IDENTIFY_DISC != 0;
        let mut rest = msgout.get(1..).unwrap_or(&[]);

        let mut tag = 0;
        if let [t @ (MSG_SIMPLE_TAG | MSG_HEAD_TAG | MSG_ORDERED_TAG), n, tail @ ..] = rest {
            self.tag_messages.push(*t);
            tag = *n;
            rest = tail;
        }
        let nego = match rest {
            [MSG_EXTENDED, 3, MSG_X_SYNC_REQ, period, offset, ..] => Some(NegoRequest::Sync {
                period: *period,
                offset: *offset,
            }),
            [MSG_EXTENDED, 2, MSG_X_WIDE_REQ, width, ..] => Some(NegoRequest::Wide { width: *width }),
            _ => None,
        };

        if let Some(pos) = self.jobs.iter().position(|j| j.lun == lun && j.tag == tag) {
            warn!(
                "target {}: selected for {}:{} with a job outstanding",
                self.id, lun, tag
            );
            self.stats.tag_collisions += 1;
            self.jobs.remove(pos);
        }

        let behavior = if sense {
            SimBehavior::Normal
        } else {
            self.behaviors.pop_front().unwrap_or_default()
        };
        self.stats.commands += 1;
        self.proposed = None;

        let mut steps = VecDeque::new();
        if let Some(req) = nego {
            if let Some(msg) = self.answer(req, &behavior) {
                steps.push_back(Step::MsgIn(msg));
            }
        }
        match behavior {
            SimBehavior::InitiateSync { period, offset } => {
                self.proposed = Some(self.agreed);
                steps.push_back(Step::MsgIn(sdtr(period, offset).to_vec()));
            }
            SimBehavior::InitiateWide { width } => {
                self.proposed = Some(self.agreed);
                steps.push_back(Step::MsgIn(wdtr(width).to_vec()));
            }
            _ => {}
        }

        let mut result = self.cmd(lun, cdb);
        match &behavior {
            SimBehavior::Status(s) => result = CmdResult::Status(*s),
            SimBehavior::CheckCondition { sense } => {
                self.sense[usize::from(lun)] = Some(sense.clone());
                result = CmdResult::Status(STATUS_CHECK_CONDITION);
            }
            SimBehavior::SensePreempted { sense } => {
                self.sense[usize::from(lun)] = Some(sense.clone());
                self.preempt = true;
                result = CmdResult::Status(STATUS_CHECK_CONDITION);
            }
            _ => {}
        }
        let status = match result {
            CmdResult::Status(s) => s,
            _ => STATUS_GOOD,
        };
        let write_lba = match (&result, Cdb::from_slice(cdb)) {
            (CmdResult::DataOut(_), Some(c)) => Some(c.lba().unwrap_or(0)),
            _ => None,
        };

        let (first, second): (Vec<Step>, Vec<Step>) = match (&behavior, result) {
            (SimBehavior::Hang, _) if may_disconnect => (
                vec![Step::Disconnect {
                    save: false,
                    hold: None,
                }],
                vec![],
            ),
            (SimBehavior::Hang | SimBehavior::Stuck, _) => (vec![Step::Stall], vec![]),
            (SimBehavior::UnexpectedDisconnect { at }, r) => {
                (vec![partial(&r, *at), Step::BusFree], vec![])
            }
            (SimBehavior::HandshakeTimeout { at }, r) => {
                (vec![partial(&r, *at), Step::HandshakeTimeout], vec![])
            }
            (SimBehavior::Disconnect { hold }, r) if may_disconnect => (
                vec![Step::Disconnect {
                    save: false,
                    hold: Some(*hold),
                }],
                data_steps(r),
            ),
            (SimBehavior::PhaseMismatch { at, hold }, r) if may_disconnect => {
                let (head, tail) = split(r, *at);
                (
                    vec![
                        head,
                        Step::Disconnect {
                            save: true,
                            hold: Some(*hold),
                        },
                    ],
                    vec![tail],
                )
            }
            (SimBehavior::DisconnectWithoutSave { at, hold }, r) if may_disconnect => {
                let full = data_steps(r.clone());
                let (head, _) = split(r, *at);
                (
                    vec![
                        head,
                        Step::Disconnect {
                            save: false,
                            hold: Some(*hold),
                        },
                    ],
                    full,
                )
            }
            (SimBehavior::Overrun { extra }, CmdResult::DataIn(mut d)) => {
                d.resize(d.len() + extra, 0xA5);
                (vec![Step::DataIn(d)], vec![])
            }
            (SimBehavior::Overrun { extra }, CmdResult::DataOut(n)) => {
                (vec![Step::DataOut(n + extra)], vec![])
            }
            (SimBehavior::Underrun { short }, CmdResult::DataIn(mut d)) => {
                d.truncate(d.len().saturating_sub(*short));
                (vec![Step::DataIn(d)], vec![])
            }
            (SimBehavior::Underrun { short }, CmdResult::DataOut(n)) => {
                (vec![Step::DataOut(n.saturating_sub(*short))], vec![])
            }
            (SimBehavior::IgnoreWideResidue, r) => {
                let mut s = data_steps(r);
                s.push(Step::MsgIn(vec![MSG_IGN_RESIDUE, 1]));
                (s, vec![])
            }
            (SimBehavior::UnknownMessage, r) => {
                let mut s = vec![Step::MsgIn(vec![0x55])];
                s.extend(data_steps(r));
                (s, vec![])
            }
            (_, r) => (data_steps(r), vec![]),
        };

        let ends_early = first
            .iter()
            .any(|s| matches!(s, Step::BusFree | Step::HandshakeTimeout | Step::Stall))
            || first
                .iter()
                .any(|s| matches!(s, Step::Disconnect { hold: None, .. }));
        steps.extend(first.into_iter().filter(|s| !is_empty_data(s)));
        steps.extend(second.into_iter().filter(|s| !is_empty_data(s)));
        if !ends_early {
            steps.push_back(Step::Status(status));
            steps.push_back(Step::Complete);
        }

        trace!(
            "target {}: {}:{} cdb {:02X?} -> {:?}",
            self.id, lun, tag, cdb, steps
        );
        self.jobs.push(Job {
            lun,
            tag,
            steps,
            reselect_at: None,
            write_lba,
            received: vec![],
            saved: 0,
        });
        (lun, tag)
    }

    fn job(&self, lun: u8, tag: u8) -> Option<&Job> {
        self.jobs.iter().find(|j| j.lun == lun && j.tag == tag)
    }

    fn job_mut(&mut self, lun: u8, tag: u8) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.lun == lun && j.tag == tag)
    }

    pub(super) fn peek(&self, lun: u8, tag: u8) -> Option<&Step> {
        self.job(lun, tag)?.steps.front()
    }

    pub(super) fn pop(&mut self, lun: u8, tag: u8) -> Option<Step> {
        self.job_mut(lun, tag)?.steps.pop_front()
    }

    /// Data phase OUT bytes taken from the initiator
    pub(super) fn receive(&mut self, lun: u8, tag: u8, data: &[u8]) {
        if let Some(job) = self.job_mut(lun, tag) {
            job.received.extend_from_slice(data);
        }
    }

    /// Message bytes sent by the initiator while connected
    pub(super) fn message_out(&mut self, msg: &[u8]) {
        match msg {
            [MSG_REJECT, ..] => {
                if let Some(previous) = self.proposed.take() {
                    debug!("target {}: negotiation rejected", self.id);
                    self.agreed = previous;
                }
            }
            [MSG_EXTENDED, 3, MSG_X_SYNC_REQ, period, offset, ..] => {
                self.proposed = None;
                self.agreed.period = if *offset == 0 { 0 } else { *period };
                self.agreed.offset = *offset;
            }
            [MSG_EXTENDED, 2, MSG_X_WIDE_REQ, width, ..] => {
                self.proposed = None;
                self.agreed = Agreement {
                    width: *width,
                    ..Agreement::default()
                };
            }
            _ => debug!("target {}: message {:02X?} ignored", self.id, msg),
        }
    }

    /// The initiator accepted the last message without objection
    pub(super) fn message_accepted(&mut self) {
        self.proposed = None;
    }

    /// Takes the pre-emption flag set by [`SimBehavior::SensePreempted`]
    pub(super) fn take_preempt(&mut self) -> bool {
        std::mem::take(&mut self.preempt)
    }

    pub(super) fn disconnect(&mut self, lun: u8, tag: u8, save: bool, reselect_at: Option<Ticks>) {
        if let Some(job) = self.job_mut(lun, tag) {
            if save {
                job.saved = job.received.len();
            } else {
                job.received.truncate(job.saved);
            }
            job.reselect_at = Some(reselect_at);
        }
    }

    /// Nexus of a disconnected job due for reselection
    pub(super) fn reselect_ready(&self, now: Ticks) -> Option<(u8, u8)> {
        self.jobs
            .iter()
            .filter_map(|j| match j.reselect_at {
                Some(Some(at)) if at <= now => Some((at, j.lun, j.tag)),
                _ => None,
            })
            .min()
            .map(|(_, lun, tag)| (lun, tag))
    }

    pub(super) fn reconnect(&mut self, lun: u8, tag: u8) {
        if let Some(job) = self.job_mut(lun, tag) {
            job.reselect_at = None;
            self.stats.reselections += 1;
        }
    }

    /// Command complete: the job ends, written data is kept
    pub(super) fn finish(&mut self, lun: u8, tag: u8) {
        let Some(pos) = self.jobs.iter().position(|j| j.lun == lun && j.tag == tag) else {
            return;
        };
        let job = self.jobs.remove(pos);
        if let Some(lba) = job.write_lba {
            self.writes.push((lba, job.received));
        }
    }

    /// The initiator aborted the nexus or the connection was lost
    pub(super) fn drop_job(&mut self, lun: u8, tag: u8) {
        if let Some(pos) = self.jobs.iter().position(|j| j.lun == lun && j.tag == tag) {
            self.jobs.remove(pos);
            self.stats.dropped += 1;
        }
    }

    /// SCSI bus reset: all jobs and agreements are gone
    pub(super) fn bus_reset(&mut self) {
        self.stats.dropped += self.jobs.len() as u64;
        self.jobs.clear();
        self.agreed = Agreement::default();
        self.proposed = None;
        self.preempt = false;
    }
}

fn data_steps(result: CmdResult) -> Vec<Step> {
    match result {
        CmdResult::Status(_) => vec![],
        CmdResult::DataIn(d) => vec![Step::DataIn(d)],
        CmdResult::DataOut(n) => vec![Step::DataOut(n)],
    }
}

/// First `at` bytes of the data phase
fn partial(result: &CmdResult, at: usize) -> Step {
    match result {
        CmdResult::DataIn(d) => Step::DataIn(d[..at.min(d.len())].to_vec()),
        CmdResult::DataOut(n) => Step::DataOut(at.min(*n)),
        CmdResult::Status(_) => Step::DataIn(vec![]),
    }
}

fn split(result: CmdResult, at: usize) -> (Step, Step) {
    match result {
        CmdResult::DataIn(mut d) => {
            let tail = d.split_off(at.min(d.len()));
            (Step::DataIn(d), Step::DataIn(tail))
        }
        CmdResult::DataOut(n) => (Step::DataOut(at.min(n)), Step::DataOut(n - at.min(n))),
        CmdResult::Status(_) => (Step::DataIn(vec![]), Step::DataIn(vec![])),
    }
}

fn is_empty_data(step: &Step) -> bool {
    matches!(step, Step::DataIn(d) if d.is_empty()) || matches!(step, Step::DataOut(0))
}
