//! Synchronous and wide transfer negotiation

use anyhow::Result;
use arrayvec::ArrayVec;
use log::*;

use crate::bus::RegisterBus;
use crate::ncr::adapter::Adapter;
use crate::ncr::ccb::{CcbIndex, HostStatus, NegoKind};
use crate::ncr::layout::ccb;
use crate::ncr::regs::{NcrReg, Scntl3, Sxfer};
use crate::ncr::script::Label;
use crate::scsi::{MSG_EXTENDED, MSG_X_SYNC_REQ, MSG_X_WIDE_REQ};

/// Clock divisors of the synchronous core, times 10 MHz
const DIV_10M: [u64; 7] = [
    2 * 5_000_000,
    3 * 5_000_000,
    4 * 5_000_000,
    6 * 5_000_000,
    8 * 5_000_000,
    12 * 5_000_000,
    16 * 5_000_000,
];

/// Transfer period of an SDTR period factor, in tenths of ns
pub const fn period_tenths_ns(factor: u8) -> u64 {
    match factor {
        0..=10 => 250,
        11 => 303,
        12 => 500,
        f => 40 * f as u64,
    }
}

/// Chip settings for a synchronous period factor: the SXFER period field and
/// SCNTL3 with divisor and ultra bit. `None` if the period is too slow for
/// the SXFER field, the transfer has to stay asynchronous.
pub fn sync_params(factor: u8, clock_khz: u32, divn: usize) -> Option<(u8, Scntl3)> {
    let kpc = period_tenths_ns(factor) * u64::from(clock_khz);
    let div = (0..divn.min(DIV_10M.len()))
        .rev()
        .find(|&d| kpc >= DIV_10M[d] << 2)
        .unwrap_or(0);
    let fak = (kpc.saturating_sub(1) / DIV_10M[div] + 1).max(4) - 4;
    if fak > 7 {
        return None;
    }
    Some((
        fak as u8,
        Scntl3(0).with_scf(div as u8 + 1).with_ultra(factor < 25),
    ))
}

pub fn sdtr(period: u8, offset: u8) -> [u8; 5] {
    [MSG_EXTENDED, 3, MSG_X_SYNC_REQ, period, offset]
}

pub fn wdtr(width: u8) -> [u8; 4] {
    [MSG_EXTENDED, 2, MSG_X_WIDE_REQ, width]
}

impl<C: RegisterBus> Adapter<C> {
    /// Negotiation to piggy-back on the next command to `target`, if any.
    /// Wide goes first since agreeing on a width resets the sync agreement.
    pub(crate) fn choose_negotiation(&self, target: u8, lun: u8) -> NegoKind {
        let tcb = &self.targets[usize::from(target)];
        if lun != 0 || tcb.nego != NegoKind::None || tcb.quirks.no_message {
            return NegoKind::None;
        }
        let Some(inq) = tcb.inquiry else {
            return NegoKind::None;
        };
        if inq[2] & 7 < 2 || inq[7] == 0 {
            return NegoKind::None;
        }
        if !tcb.wide_done {
            NegoKind::Wide
        } else if !tcb.sync_done {
            NegoKind::Sync
        } else {
            NegoKind::None
        }
    }

    /// Fastest period and largest offset we offer to `target`
    fn sync_offer(&self, target: u8) -> (u8, u8) {
        let tcb = &self.targets[usize::from(target)];
        let offset = if tcb.usrsync == 0 {
            0
        } else {
            self.config.max_offset
        };
        (tcb.usrsync.max(self.config.min_sync), offset)
    }

    fn wide_offer(&self, target: u8) -> u8 {
        let tcb = &self.targets[usize::from(target)];
        if tcb.wide_capable() {
            tcb.usrwide.min(1)
        } else {
            0
        }
    }

    pub(crate) fn nego_message(&self, target: u8, kind: NegoKind) -> ArrayVec<u8, 5> {
        match kind {
            NegoKind::Sync => {
                let (period, offset) = self.sync_offer(target);
                ArrayVec::from(sdtr(period, offset))
            }
            NegoKind::Wide => wdtr(self.wide_offer(target)).into_iter().collect(),
            NegoKind::None => ArrayVec::new(),
        }
    }

    /// Records a synchronous agreement and updates the select tables of
    /// queued commands. Registers are left alone.
    fn apply_sync(&mut self, target: u8, period: u8, offset: u8) -> Result<()> {
        let params = if offset == 0 {
            None
        } else {
            sync_params(period, self.config.clock_khz, self.config.clock_divn)
        };
        let async_scntl3 = Scntl3(self.async_scntl3);
        let tcb = &mut self.targets[usize::from(target)];
        let wide = tcb.params.width != 0;
        let (sxfer, scntl3) = match params {
            Some((tp, s)) => {
                tcb.params.period = period;
                tcb.params.offset = offset;
                (
                    Sxfer(0).with_tp(tp).with_offset(offset),
                    async_scntl3.with_scf(s.scf()).with_ultra(s.ultra()),
                )
            }
            None => {
                tcb.params.period = 0;
                tcb.params.offset = 0;
                (Sxfer(0), async_scntl3)
            }
        };
        tcb.sxfer = sxfer.0;
        tcb.scntl3 = scntl3.with_ews(wide).0;
        tcb.sync_done = true;

        match params {
            Some(_) => info!(
                "{}: target {}: {} ns, offset {}{}",
                self.name,
                target,
                period_tenths_ns(period) as f64 / 10.0,
                offset,
                if wide { ", wide" } else { "" }
            ),
            None => info!("{}: target {}: asynchronous", self.name, target),
        }
        self.update_select_tables(target)
    }

    /// Records a width agreement. Any synchronous agreement is void after a
    /// width change and falls back to asynchronous until renegotiated.
    fn apply_wide(&mut self, target: u8, width: u8) -> Result<()> {
        let async_scntl3 = self.async_scntl3;
        let tcb = &mut self.targets[usize::from(target)];
        tcb.params.width = width;
        tcb.params.period = 0;
        tcb.params.offset = 0;
        tcb.sxfer = 0;
        tcb.scntl3 = Scntl3(async_scntl3).with_ews(width != 0).0;
        tcb.wide_done = true;
        tcb.sync_done = !tcb.wants_sync();

        info!(
            "{}: target {}: {} bit transfers",
            self.name,
            target,
            8 << width
        );
        self.update_select_tables(target)
    }

    fn update_select_tables(&mut self, target: u8) -> Result<()> {
        let tcb = &self.targets[usize::from(target)];
        let (sxfer, scntl3) = (tcb.sxfer, tcb.scntl3);
        let queued: Vec<_> = self
            .ccbs
            .in_use()
            .filter(|c| c.target == target)
            .map(|c| c.phys)
            .collect();
        for phys in queued {
            self.mem.write_u8(phys + ccb::SELECT + 1, sxfer)?;
            self.mem.write_u8(phys + ccb::SELECT + 3, scntl3)?;
        }
        Ok(())
    }

    /// Loads the agreed parameters of the connected target into the chip
    fn load_transfer_regs(&mut self, target: u8) {
        let tcb = &self.targets[usize::from(target)];
        let (sxfer, scntl3) = (tcb.sxfer, tcb.scntl3);
        self.outb(NcrReg::SXFER, sxfer);
        self.outb(NcrReg::SCNTL3, scntl3);
    }

    fn finish_nego(&mut self, idx: CcbIndex) -> Result<()> {
        let (phys, target) = (self.ccbs[idx].phys, self.ccbs[idx].target);
        let tcb = &mut self.targets[usize::from(target)];
        if tcb.nego_ccb == Some(idx) {
            tcb.nego = NegoKind::None;
            tcb.nego_ccb = None;
        }
        self.ccbs[idx].nego = NegoKind::None;
        self.mem.write_u8(phys + ccb::NEGO_STATUS, 0)?;
        if self.host_status(idx)? == HostStatus::Negotiate {
            self.set_host_status(idx, HostStatus::Busy)?;
        }
        Ok(())
    }

    /// Gives up on a negotiation: the parameter reverts to its default and
    /// is not offered again.
    fn nego_fallback(&mut self, idx: CcbIndex, kind: NegoKind) -> Result<()> {
        let target = self.ccbs[idx].target;
        match kind {
            NegoKind::Sync => self.apply_sync(target, 0, 0)?,
            NegoKind::Wide => self.apply_wide(target, 0)?,
            NegoKind::None => {}
        }
        self.finish_nego(idx)
    }

    /// The command carrying a negotiation ended before the target answered
    pub(crate) fn nego_abandoned(&mut self, idx: CcbIndex) -> Result<()> {
        let target = self.ccbs[idx].target;
        let kind = self.targets[usize::from(target)].nego;
        if self.debug.nego {
            debug!(
                "{}: target {}: {:?} negotiation abandoned",
                self.name, target, kind
            );
        }
        self.nego_fallback(idx, kind)
    }

    fn pending_nego(&self, idx: CcbIndex) -> NegoKind {
        let tcb = &self.targets[usize::from(self.ccbs[idx].target)];
        if tcb.nego_ccb == Some(idx) {
            tcb.nego
        } else {
            NegoKind::None
        }
    }

    fn read_msgin<const N: usize>(&self) -> Result<[u8; N]> {
        let mut msg = [0; N];
        self.mem.read_bytes(self.ncb.msgin(), &mut msg)?;
        Ok(msg)
    }

    /// SDTR received: either the answer to our offer or a request from the
    /// target that needs a counter-offer.
    pub(crate) fn handle_nego_sync(&mut self, idx: CcbIndex) -> Result<Label> {
        let target = self.ccbs[idx].target;
        let [_, _, _, period, offset] = self.read_msgin::<5>()?;
        let pending = self.pending_nego(idx);
        if self.debug.nego {
            debug!(
                "{}: target {}: SDTR {}/{} received, pending {:?}",
                self.name, target, period, offset, pending
            );
        }

        match pending {
            NegoKind::Sync => {
                let (min_period, max_offset) = self.sync_offer(target);
                let usable = offset == 0
                    || (period >= min_period
                        && sync_params(period, self.config.clock_khz, self.config.clock_divn)
                            .is_some());
                if offset > max_offset || !usable {
                    warn!(
                        "{}: target {}: unacceptable SDTR answer {}/{}, staying asynchronous",
                        self.name, target, period, offset
                    );
                    self.nego_fallback(idx, NegoKind::Sync)?;
                    self.load_transfer_regs(target);
                    return Ok(Label::MsgBad);
                }
                self.apply_sync(target, period, offset)?;
                self.finish_nego(idx)?;
                self.load_transfer_regs(target);
                Ok(Label::Clrack)
            }
            NegoKind::None => {
                let tcb = &self.targets[usize::from(target)];
                let period = period.max(tcb.usrsync).max(self.config.min_sync);
                let mut offset = offset.min(self.config.max_offset);
                if tcb.usrsync == 0
                    || !tcb.sync_capable()
                    || sync_params(period, self.config.clock_khz, self.config.clock_divn).is_none()
                {
                    offset = 0;
                }
                self.mem.write_bytes(self.ncb.msgout(), &sdtr(period, offset))?;
                self.apply_sync(target, period, offset)?;
                self.load_transfer_regs(target);
                Ok(Label::SdtrResp)
            }
            NegoKind::Wide => {
                warn!(
                    "{}: target {}: SDTR in answer to WDTR",
                    self.name, target
                );
                self.nego_fallback(idx, NegoKind::Wide)?;
                self.load_transfer_regs(target);
                Ok(Label::MsgBad)
            }
        }
    }

    /// WDTR received, handled like [`Self::handle_nego_sync`]
    pub(crate) fn handle_nego_wide(&mut self, idx: CcbIndex) -> Result<Label> {
        let target = self.ccbs[idx].target;
        let [_, _, _, width] = self.read_msgin::<4>()?;
        let pending = self.pending_nego(idx);
        if self.debug.nego {
            debug!(
                "{}: target {}: WDTR {} received, pending {:?}",
                self.name, target, width, pending
            );
        }

        match pending {
            NegoKind::Wide => {
                if width > self.wide_offer(target) {
                    warn!(
                        "{}: target {}: unacceptable WDTR answer {}, staying narrow",
                        self.name, target, width
                    );
                    self.nego_fallback(idx, NegoKind::Wide)?;
                    self.load_transfer_regs(target);
                    return Ok(Label::MsgBad);
                }
                self.apply_wide(target, width)?;
                self.finish_nego(idx)?;
                self.load_transfer_regs(target);
                Ok(Label::Clrack)
            }
            NegoKind::None => {
                let width = width.min(self.wide_offer(target));
                self.mem.write_bytes(self.ncb.msgout(), &wdtr(width))?;
                self.apply_wide(target, width)?;
                self.load_transfer_regs(target);
                Ok(Label::WdtrResp)
            }
            NegoKind::Sync => {
                warn!(
                    "{}: target {}: WDTR in answer to SDTR",
                    self.name, target
                );
                self.nego_fallback(idx, NegoKind::Sync)?;
                self.load_transfer_regs(target);
                Ok(Label::MsgBad)
            }
        }
    }

    /// Target went on without answering our negotiation message
    pub(crate) fn handle_nego_failed(&mut self, idx: CcbIndex) -> Result<Label> {
        let target = self.ccbs[idx].target;
        let kind = self.pending_nego(idx);
        warn!(
            "{}: target {}: no answer to {:?} negotiation, using defaults",
            self.name, target, kind
        );
        self.nego_fallback(idx, kind)?;
        self.load_transfer_regs(target);
        Ok(Label::Dispatch)
    }

    /// Malformed negotiation message
    pub(crate) fn handle_nego_proto(&mut self, idx: CcbIndex) -> Result<Label> {
        let target = self.ccbs[idx].target;
        let kind = self.pending_nego(idx);
        warn!(
            "{}: target {}: negotiation protocol error, using defaults",
            self.name, target
        );
        self.nego_fallback(idx, kind)?;
        self.load_transfer_regs(target);
        Ok(Label::MsgBad)
    }

    /// MESSAGE REJECT received
    pub(crate) fn handle_reject_received(&mut self, idx: CcbIndex) -> Result<Label> {
        let target = self.ccbs[idx].target;
        let kind = self.pending_nego(idx);
        if kind != NegoKind::None {
            warn!(
                "{}: target {}: {:?} negotiation rejected, using defaults",
                self.name, target, kind
            );
            self.nego_fallback(idx, kind)?;
            self.load_transfer_regs(target);
        } else if self.ccbs[idx].tag != 0 {
            warn!("{}: target {}: tag message rejected", self.name, target);
        } else {
            warn!("{}: target {}: message rejected", self.name, target);
        }
        Ok(Label::Clrack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testbus::Testbus;
    use crate::dma::DmaMemory;
    use crate::ncr::config::AdapterConfig;
    use crate::ncr::lifecycle::{CommandId, DataSegment, ScsiCommand};
    use crate::scsi::{Cdb, INQ7_SYNC, INQ7_WBUS16};

    #[test]
    fn period_table() {
        assert_eq!(period_tenths_ns(9), 250);
        assert_eq!(period_tenths_ns(11), 303);
        assert_eq!(period_tenths_ns(12), 500);
        assert_eq!(period_tenths_ns(25), 1000);
    }

    #[test]
    fn sync_params_at_80mhz() {
        let (tp, s) = sync_params(12, 80_000, 5).unwrap();
        assert_eq!(tp, 0);
        assert_eq!(s.0, 0x90);

        let (tp, s) = sync_params(25, 80_000, 5).unwrap();
        assert_eq!(tp, 0);
        assert_eq!(s.scf(), 3);
        assert!(!s.ultra());

        let (tp, s) = sync_params(50, 80_000, 5).unwrap();
        assert_eq!(tp, 0);
        assert_eq!(s.scf(), 5);

        let (tp, s) = sync_params(100, 80_000, 5).unwrap();
        assert_eq!(tp, 4);
        assert_eq!(s.scf(), 5);

        assert_eq!(sync_params(255, 80_000, 5), None);
    }

    #[test]
    fn sync_params_at_40mhz() {
        // 40 MHz cannot clock Fast-20, the lowest divisor is used
        let (tp, s) = sync_params(12, 40_000, 4).unwrap();
        assert_eq!(s.scf(), 1);
        assert_eq!(tp, 0);
        let (tp, s) = sync_params(50, 40_000, 4).unwrap();
        assert_eq!(s.scf(), 3);
        assert_eq!(tp, 0);
    }

    #[test]
    fn messages() {
        assert_eq!(sdtr(12, 16), [0x01, 3, 0x01, 12, 16]);
        assert_eq!(wdtr(1), [0x01, 2, 0x03, 1]);
    }

    fn attach_known(inq7: u8) -> Adapter<Testbus> {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let config = AdapterConfig::default();
        let mem = DmaMemory::new(config.memory_base, config.memory_size);
        let mut a = Adapter::attach(config, Testbus::new(), mem, tx).unwrap();
        a.targets[2].set_inquiry([0, 0, 2, 2, 31, 0, 0, inq7]);
        a
    }

    #[test]
    fn wide_then_sync() {
        let mut a = attach_known(INQ7_SYNC | INQ7_WBUS16);
        assert_eq!(a.choose_negotiation(2, 1), NegoKind::None);
        assert_eq!(a.choose_negotiation(2, 0), NegoKind::Wide);
        a.apply_wide(2, 1).unwrap();
        assert_eq!(a.choose_negotiation(2, 0), NegoKind::Sync);
        a.apply_sync(2, 12, 16).unwrap();
        assert_eq!(a.choose_negotiation(2, 0), NegoKind::None);

        let tcb = &a.targets[2];
        assert_eq!(tcb.params.width, 1);
        assert_eq!(tcb.params.period, 12);
        assert_eq!(Sxfer(tcb.sxfer).offset(), 16);
        assert!(Scntl3(tcb.scntl3).ews());
        assert!(Scntl3(tcb.scntl3).ultra());
    }

    #[test]
    fn width_change_voids_sync() {
        let mut a = attach_known(INQ7_SYNC | INQ7_WBUS16);
        a.apply_sync(2, 25, 8).unwrap();
        a.apply_wide(2, 1).unwrap();
        let tcb = &a.targets[2];
        assert_eq!(tcb.params.offset, 0);
        assert_eq!(tcb.sxfer, 0);
        assert!(!tcb.sync_done);
    }

    #[test]
    fn no_negotiation_without_capabilities() {
        let mut a = attach_known(0);
        assert_eq!(a.choose_negotiation(2, 0), NegoKind::None);
        a.targets[2].set_inquiry([0, 0, 1, 1, 31, 0, 0, INQ7_SYNC]);
        assert_eq!(a.choose_negotiation(2, 0), NegoKind::None);
    }

    #[test]
    fn select_tables_follow_agreement() {
        let mut a = attach_known(INQ7_SYNC);
        let addr = a.memory_mut().alloc(512, 16).unwrap();
        let cmd = ScsiCommand::new(CommandId(1), 2, 0, Cdb::read_10(0, 1))
            .with_segments(vec![DataSegment { addr, len: 512 }]);
        a.submit(cmd).unwrap();
        let idx = a.ccbs.find_command(CommandId(1)).unwrap();
        let phys = a.ccbs[idx].phys;
        assert_eq!(a.ccbs[idx].nego, NegoKind::Sync);
        assert_eq!(
            a.memory().read_u8(phys + ccb::HOST_STATUS).unwrap(),
            HostStatus::Negotiate as u8
        );
        let mut msg = [0; 6];
        a.memory().read_bytes(phys + ccb::MSGOUT, &mut msg).unwrap();
        assert_eq!(msg, [0xC0, 0x01, 3, 0x01, 12, 16]);

        a.apply_sync(2, 25, 8).unwrap();
        a.finish_nego(idx).unwrap();
        assert_eq!(
            a.memory().read_u8(phys + ccb::SELECT + 1).unwrap(),
            Sxfer(0).with_offset(8).0
        );
        assert_eq!(
            a.memory().read_u8(phys + ccb::HOST_STATUS).unwrap(),
            HostStatus::Busy as u8
        );
        assert_eq!(a.targets[2].nego, NegoKind::None);
    }
}
