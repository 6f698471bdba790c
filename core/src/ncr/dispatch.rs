//! Interrupt classification and handlers
//!
//! All pending DMA and SCSI interrupt bits are read at once and mapped to a
//! single [`Cause`] through [`PRIORITY`]. Lower ranked bits raised together
//! with the winner are symptoms of the same event and only get logged.

use anyhow::Result;
use log::*;
use num_traits::FromPrimitive;

use crate::bus::RegisterBus;
use crate::ncr::adapter::Adapter;
use crate::ncr::ccb::{CcbIndex, HostStatus};
use crate::ncr::layout::{ResumeDescriptor, ScatterEntry, ccb};
use crate::ncr::regs::*;
use crate::ncr::script::{DATA_ENTRY_SIZE, Label, PHASE_DATA_IN, Sir};
use crate::scsi::Direction;
use crate::types::PhysAddr;

/// Interrupt cause, in decreasing order of priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum Cause {
    BusModeChange,
    BusReset,
    FatalDma,
    SelectionTimeout,
    UnexpectedDisconnect,
    HandshakeTimeout,
    PhaseMismatch,
    ProgrammedInterrupt,
    ParityError,
}

type Predicate = fn(Dstat, Sist) -> bool;

fn bus_mode_change(_: Dstat, sist: Sist) -> bool {
    sist.sbmc()
}

fn bus_reset(_: Dstat, sist: Sist) -> bool {
    sist.rst()
}

fn fatal_dma(dstat: Dstat, _: Sist) -> bool {
    dstat.0 & Dstat::FATAL != 0
}

fn selection_timeout(_: Dstat, sist: Sist) -> bool {
    sist.sto()
}

fn unexpected_disconnect(_: Dstat, sist: Sist) -> bool {
    sist.udc()
}

fn handshake_timeout(_: Dstat, sist: Sist) -> bool {
    sist.hth()
}

fn phase_mismatch(_: Dstat, sist: Sist) -> bool {
    sist.ma()
}

fn programmed(dstat: Dstat, _: Sist) -> bool {
    dstat.sir()
}

fn parity(_: Dstat, sist: Sist) -> bool {
    sist.par()
}

pub const PRIORITY: [(Cause, Predicate); 9] = [
    (Cause::BusModeChange, bus_mode_change),
    (Cause::BusReset, bus_reset),
    (Cause::FatalDma, fatal_dma),
    (Cause::SelectionTimeout, selection_timeout),
    (Cause::UnexpectedDisconnect, unexpected_disconnect),
    (Cause::HandshakeTimeout, handshake_timeout),
    (Cause::PhaseMismatch, phase_mismatch),
    (Cause::ProgrammedInterrupt, programmed),
    (Cause::ParityError, parity),
];

/// Highest priority cause among the pending bits
pub fn classify(dstat: Dstat, sist: Sist) -> Option<Cause> {
    PRIORITY
        .iter()
        .find(|(_, pred)| pred(dstat, sist))
        .map(|&(cause, _)| cause)
}

/// Bytes of an interrupted move that never made it across the bus: the
/// byte counter plus whatever is still sitting in the DMA FIFO and the
/// SCSI output latches.
pub fn mismatch_residual(
    dbc: u32,
    dfifo: u8,
    dstat: Dstat,
    sstat0: Sstat0,
    sstat2: Option<Sstat2>,
) -> u32 {
    let mut rest = dbc & 0x00FF_FFFF;
    if dstat.dfe() {
        return rest;
    }
    rest += u32::from(dfifo).wrapping_sub(rest) & 0x7F;
    rest += u32::from(sstat0.olf()) + u32::from(sstat0.orf());
    if let Some(s2) = sstat2 {
        rest += u32::from(s2.olf1()) + u32::from(s2.orf1());
    }
    rest
}

impl<C: RegisterBus> Adapter<C> {
    /// Whether the chip requests attention
    pub fn interrupt_pending(&mut self) -> bool {
        let istat = Istat(self.inb(NcrReg::ISTAT));
        istat.dip() || istat.sip() || istat.intf()
    }

    /// Interrupt handler. Finished commands are always collected first,
    /// then the highest priority error condition is handled.
    pub fn handle_interrupt(&mut self) -> Result<()> {
        let istat = Istat(self.inb(NcrReg::ISTAT));
        if istat.intf() {
            self.outb(NcrReg::ISTAT, Istat(0).with_intf(true).0);
            self.profile.num_fly += 1;
        }
        self.drain_done_queue()?;
        if !istat.dip() && !istat.sip() {
            return Ok(());
        }

        self.profile.num_int += 1;
        let dstat = Dstat(self.inb(NcrReg::DSTAT));
        let sist = Sist(self.inw(NcrReg::SIST0));
        let Some(cause) = classify(dstat, sist) else {
            warn!(
                "{}: spurious interrupt, istat {:?} dstat {:?} sist {:?}",
                self.name, istat, dstat, sist
            );
            return Ok(());
        };
        if self.debug.irq {
            debug!(
                "{}: {:?}, dstat {:#04X} sist {:#06X}",
                self.name, cause, dstat.0, sist.0
            );
        }
        if cause != Cause::ParityError && sist.par() {
            self.profile.num_parity += 1;
            warn!("{}: SCSI parity error during {:?}", self.name, cause);
        }

        match cause {
            Cause::BusModeChange => {
                error!("{}: SCSI bus mode change", self.name);
                self.reset_bus(None)
            }
            Cause::BusReset => self.int_bus_reset(),
            Cause::FatalDma => self.int_fatal(dstat, sist),
            Cause::SelectionTimeout => self.int_sto(),
            Cause::UnexpectedDisconnect | Cause::HandshakeTimeout => self.int_disconnect(cause),
            Cause::PhaseMismatch => self.int_ma(dstat),
            Cause::ProgrammedInterrupt => self.int_sir(),
            Cause::ParityError => self.int_par(),
        }
    }

    /// CCB the chip was working on, if the reported address is a live one
    fn current_ccb(&self, dsa: PhysAddr) -> Option<CcbIndex> {
        self.lookup_by_dsa(dsa).filter(|&i| self.ccbs[i].in_use)
    }

    /// CCB to blame for an error. DSA keeps pointing at a disconnected
    /// CCB after the target left the bus, that one is not connected.
    fn culprit(&self, dsa: PhysAddr, hs: HostStatus) -> Option<(CcbIndex, HostStatus)> {
        self.current_ccb(dsa)
            .filter(|&i| {
                matches!(
                    self.host_status(i),
                    Ok(HostStatus::Busy | HostStatus::Negotiate)
                )
            })
            .map(|i| (i, hs))
    }

    fn clear_fifos(&mut self) {
        self.outb(NcrReg::CTEST3, CTEST3_CLF);
        self.outb(NcrReg::STEST3, STEST3_TE | STEST3_CSF);
    }

    fn int_bus_reset(&mut self) -> Result<()> {
        warn!("{}: SCSI bus reset detected", self.name);
        self.profile.num_reset += 1;
        self.settle_until = Some(self.now + self.config.settle_delay);
        self.reinit(None)
    }

    fn int_fatal(&mut self, dstat: Dstat, sist: Sist) -> Result<()> {
        let istat = self.inb(NcrReg::ISTAT);
        let dsp = self.inl(NcrReg::DSP);
        let dsa = self.inl(NcrReg::DSA);
        let dbc = self.inl(NcrReg::DBC);
        error!(
            "{}: fatal DMA error: dstat {:?} sist {:?} istat {:#04X} dsp {:#010X} ({:?}) dsa {:#010X} dbc {:#010X}",
            self.name,
            dstat,
            sist,
            istat,
            dsp,
            self.script.label_at(dsp),
            dsa,
            dbc
        );
        self.clear_fifos();
        let culprit = self.culprit(dsa, HostStatus::Fail);
        self.reset_bus(culprit)
    }

    /// Selection timeout. The sequencer stopped on the slot it failed to
    /// select from; SCRATCHA holds the slot after it.
    fn int_sto(&mut self) -> Result<()> {
        self.profile.num_sel_timeout += 1;
        let dsa = self.inl(NcrReg::DSA);
        let ret = self.inl(NcrReg::SCRATCHA);
        let Some(next) = self.script.slot_of(ret) else {
            error!(
                "{}: selection timeout with queue position {:#010X}",
                self.name, ret
            );
            return self.reset_bus(None);
        };

        self.mem
            .write_u32(self.ncb.startpos(), self.script.tryloop_slot(next))?;
        self.squeue.resume = next;

        if let Some(idx) = self.current_ccb(dsa) {
            warn!(
                "{}: target {}: selection timeout",
                self.name, self.ccbs[idx].target
            );
            self.ccbs[idx].queued_slot = None;
            self.set_host_status(idx, HostStatus::SelTimeout)?;
            self.complete_ccb(idx)?;
        }
        self.resume_chip(Label::Start);
        Ok(())
    }

    fn int_disconnect(&mut self, cause: Cause) -> Result<()> {
        let dsa = self.inl(NcrReg::DSA);
        let culprit = self.culprit(dsa, HostStatus::Unexpected);
        match culprit {
            Some((idx, _)) => error!(
                "{}: target {}: {:?}",
                self.name, self.ccbs[idx].target, cause
            ),
            None => error!("{}: {:?}", self.name, cause),
        }
        self.reset_bus(culprit)
    }

    /// Phase mismatch inside a data move. Builds a resume descriptor for
    /// the untransferred part and points the data pointer at it.
    fn int_ma(&mut self, dstat: Dstat) -> Result<()> {
        self.profile.num_break += 1;
        let dsp = self.inl(NcrReg::DSP);
        let dbc = self.inl(NcrReg::DBC);
        let dsa = self.inl(NcrReg::DSA);
        let dfifo = self.inb(NcrReg::DFIFO);
        let sstat0 = Sstat0(self.inb(NcrReg::SSTAT0));

        let Some(idx) = self.current_ccb(dsa) else {
            error!("{}: phase mismatch without a CCB", self.name);
            return self.reset_bus(None);
        };
        let (phys, target, dir) = {
            let c = &self.ccbs[idx];
            (c.phys, c.target, c.direction)
        };
        let sstat2 = (self.targets[usize::from(target)].params.width != 0)
            .then(|| Sstat2(self.inb(NcrReg::SSTAT2)));
        let rest = mismatch_residual(dbc, dfifo, dstat, sstat0, sstat2);
        if !dstat.dfe() {
            self.clear_fifos();
        }

        let phase = ((dbc >> 24) & 7) as u8;
        if phase > PHASE_DATA_IN {
            error!(
                "{}: phase mismatch in phase {} at {:#010X}",
                self.name, phase, dsp
            );
            return self.reset_bus(Some((idx, HostStatus::Fail)));
        }

        let interrupted = if let Some(i) = self
            .script
            .entry_index(dir, dsp.wrapping_sub(DATA_ENTRY_SIZE))
        {
            let e = ScatterEntry::read(&self.mem, phys + ccb::data_entry(i))?;
            Some((e.addr, e.len, dsp))
        } else if ccb::RESUME.iter().any(|&o| phys + o + 8 == dsp) {
            let d = ResumeDescriptor::read(&self.mem, dsp - 8)?;
            Some((d.addr, d.remaining, d.next))
        } else {
            None
        };
        let Some((addr, len, next)) = interrupted.filter(|&(_, len, _)| rest <= len) else {
            error!(
                "{}: phase mismatch at {:#010X} ({:?}), {} bytes left",
                self.name,
                dsp,
                self.script.label_at(dsp),
                rest
            );
            return self.reset_bus(Some((idx, HostStatus::Fail)));
        };

        // the descriptor the data pointer may still reference stays intact
        let savep = self.mem.read_u32(phys + ccb::SAVEP)?;
        let slot = usize::from(savep == phys + ccb::RESUME[0]);
        let at = phys + ccb::RESUME[slot];
        let d = ResumeDescriptor {
            opcode: phase,
            remaining: rest,
            addr: addr + (len - rest),
            next,
        };
        d.write(&mut self.mem, at)?;
        if self.debug.irq {
            debug!(
                "{}: CCB {:#010X}: resume {} bytes at {:#010X}",
                self.name, phys, rest, d.addr
            );
        }

        self.outl(NcrReg::TEMP, at);
        self.resume_chip(Label::Dispatch);
        Ok(())
    }

    fn int_sir(&mut self) -> Result<()> {
        self.profile.num_sir += 1;
        let code = self.inl(NcrReg::DSPS);
        let dsa = self.inl(NcrReg::DSA);
        let Some(sir) = Sir::from_u32(code) else {
            error!("{}: unknown script interrupt {}", self.name, code);
            return self.reset_bus(None);
        };
        if self.debug.irq {
            debug!("{}: script interrupt {:?}", self.name, sir);
        }

        let label = match sir {
            Sir::SenseRestart => self.sir_sense_restart()?,
            _ => match self.current_ccb(dsa) {
                Some(idx) => self.sir_for_ccb(sir, idx)?,
                None => Label::Dispatch,
            },
        };
        self.resume_chip(label);
        Ok(())
    }

    fn sir_for_ccb(&mut self, sir: Sir, idx: CcbIndex) -> Result<Label> {
        let target = self.ccbs[idx].target;
        Ok(match sir {
            Sir::SenseRestart => self.sir_sense_restart()?,
            Sir::SenseFailed => {
                warn!(
                    "{}: target {}: request sense pre-empted, held for restart",
                    self.name, target
                );
                self.targets[usize::from(target)].hold_ccb = Some(idx);
                self.mem.write_u32(self.ncb.restart_trap(), 1)?;
                Label::Start
            }
            Sir::NegoSync => self.handle_nego_sync(idx)?,
            Sir::NegoWide => self.handle_nego_wide(idx)?,
            Sir::NegoFailed => self.handle_nego_failed(idx)?,
            Sir::NegoProto => self.handle_nego_proto(idx)?,
            Sir::RejectReceived => self.handle_reject_received(idx)?,
            Sir::RejectSent => {
                warn!("{}: target {}: message rejected", self.name, target);
                Label::Dispatch
            }
            Sir::IgnResidue => {
                let n = self.mem.read_u8(self.ncb.msgin() + 1)?;
                self.ccbs[idx].residue_adjust += u32::from(n);
                Label::Clrack
            }
            Sir::MissingSave => {
                warn!(
                    "{}: target {}: disconnect without SAVE DATA POINTER",
                    self.name, target
                );
                Label::Disconnect
            }
            Sir::DataIoIsOut => self.sir_data_io(idx, Direction::Out)?,
            Sir::DataIoIsIn => self.sir_data_io(idx, Direction::In)?,
        })
    }

    /// The restart trap fired: continue the autosense of a held CCB
    fn sir_sense_restart(&mut self) -> Result<Label> {
        let trap = self.ncb.restart_trap();
        let held = self.targets.iter_mut().find_map(|t| t.hold_ccb.take());
        if !self.targets.iter().any(|t| t.hold_ccb.is_some()) {
            self.mem.write_u32(trap, 0)?;
        }
        let Some(idx) = held else {
            return Ok(Label::Start);
        };
        let phys = self.ccbs[idx].phys;
        debug!(
            "{}: target {}: restarting request sense",
            self.name, self.ccbs[idx].target
        );
        self.outl(NcrReg::DSA, phys);
        Ok(Label::Getcc)
    }

    /// The target chose the data direction of a command the opcode table
    /// does not know. Points the data pointers into the matching section.
    fn sir_data_io(&mut self, idx: CcbIndex, dir: Direction) -> Result<Label> {
        let (phys, n) = (self.ccbs[idx].phys, self.ccbs[idx].segments);
        let (Some(start), Some(end)) = (self.script.data_start(dir, n), self.script.data_end(dir))
        else {
            return Ok(Label::Dispatch);
        };
        self.mem.write_u32(phys + ccb::SAVEP, start)?;
        self.mem.write_u32(phys + ccb::LASTP, start)?;
        self.mem.write_u32(phys + ccb::GOALP, end)?;
        self.ccbs[idx].direction = dir;
        debug!(
            "{}: CCB {:#010X}: data phase is {:?}",
            self.name, phys, dir
        );
        self.outl(NcrReg::TEMP, start);
        Ok(Label::Dispatch)
    }

    /// Parity errors are handled by the sequencer; it only waits for the
    /// host to acknowledge.
    fn int_par(&mut self) -> Result<()> {
        self.profile.num_parity += 1;
        warn!("{}: SCSI parity error", self.name);
        let dsp = self.inl(NcrReg::DSP);
        self.outl(NcrReg::DSP, dsp);
        Ok(())
    }
}
