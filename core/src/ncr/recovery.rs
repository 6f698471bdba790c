//! Periodic housekeeping, command expiry and bus reset recovery

use anyhow::Result;
use log::*;

use crate::bus::RegisterBus;
use crate::ncr::adapter::Adapter;
use crate::ncr::ccb::{CcbIndex, HostStatus};
use crate::ncr::layout::ccb;
use crate::ncr::regs::*;
use crate::ncr::script::Label;

impl<C: RegisterBus> Adapter<C> {
    /// Runs once per tick period
    pub(crate) fn housekeeping(&mut self) -> Result<()> {
        if let Some(until) = self.settle_until {
            if self.now >= until {
                info!("{}: bus settled", self.name);
                self.settle_until = None;
            }
        }
        self.drain_done_queue()?;
        self.expire_commands()?;
        self.drain_waiting()
    }

    fn escalate(&mut self, idx: CcbIndex) {
        let (t, lun) = (self.ccbs[idx].target, self.ccbs[idx].lun);
        let Some(lcb) = self.lcb_mut(t, lun) else {
            return;
        };
        if !lcb.usetags {
            return;
        }
        lcb.force_ordered = true;
        self.ccbs[idx].escalated = true;
        if self.debug.tags {
            info!(
                "{}: {}:{}: command near its deadline, next tag ORDERED",
                self.name, t, lun
            );
        }
    }

    /// Finalizes commands past their deadline. A command the chip has not
    /// picked up, or that is disconnected, is completed right away. One the
    /// chip is still connected to can only be taken back by a bus reset,
    /// issued once the others have been finalized.
    fn expire_commands(&mut self) -> Result<()> {
        let now = self.now;
        let margin = self.config.timeout_margin;
        let skip = self.script.addr(Label::Skip);
        let mut overdue = None;

        let live: Vec<CcbIndex> = self.ccbs.in_use().map(|c| c.index).collect();
        for idx in live {
            let (deadline, phys, slot, escalated, aborted) = {
                let c = &self.ccbs[idx];
                (c.deadline, c.phys, c.queued_slot, c.escalated, c.abort_requested)
            };
            if now < deadline {
                if !escalated && now + margin >= deadline {
                    self.escalate(idx);
                }
                continue;
            }

            let what = if aborted { "abort" } else { "timeout" };
            let pending = match slot {
                Some(s) => self.slot_pending(s, phys)?,
                None => false,
            };
            let launch = self.mem.read_u32(phys + ccb::LAUNCH_ADDR)?;
            let hs = self.host_status(idx)?;

            if pending || launch == skip || hs == HostStatus::Disconnect {
                if !aborted {
                    warn!(
                        "{}: {:?} on {}:{} timed out ({:?})",
                        self.name,
                        self.ccbs[idx].command_id(),
                        self.ccbs[idx].target,
                        self.ccbs[idx].lun,
                        hs
                    );
                } else if self.debug.recovery {
                    debug!("{}: CCB {:#010X}: {} finalized", self.name, phys, what);
                }
                self.mem.write_u32(phys + ccb::LAUNCH_ADDR, skip)?;
                self.set_host_status(idx, HostStatus::Aborted)?;
                self.complete_ccb(idx)?;
            } else {
                error!(
                    "{}: CCB {:#010X}: {} while connected ({:?})",
                    self.name, phys, what, hs
                );
                overdue.get_or_insert(idx);
            }
        }
        self.mem.fence();
        match overdue {
            Some(idx) => self.reset_bus(Some((idx, HostStatus::Timeout))),
            None => Ok(()),
        }
    }

    /// Asserts SCSI RST and restarts from a clean slate. `culprit` completes
    /// with its own host status, every other command with `Reset`.
    pub(crate) fn reset_bus(&mut self, culprit: Option<(CcbIndex, HostStatus)>) -> Result<()> {
        warn!("{}: resetting SCSI bus", self.name);
        self.profile.num_reset += 1;
        self.settle_until = Some(self.now + self.config.settle_delay);

        self.outb(NcrReg::SCNTL1, Scntl1(0).with_rst(true).0);
        self.outb(NcrReg::SCNTL1, 0);
        self.reinit(culprit)
    }

    /// Stops the chip, fails all outstanding commands and restarts the
    /// script with empty queues and renegotiation pending for every target.
    pub(crate) fn reinit(&mut self, culprit: Option<(CcbIndex, HostStatus)>) -> Result<()> {
        self.drain_done_queue()?;
        self.outb(NcrReg::ISTAT, Istat(0).with_srst(true).0);
        self.outb(NcrReg::ISTAT, 0);

        let live: Vec<CcbIndex> = self.ccbs.in_use().map(|c| c.index).collect();
        if self.debug.recovery || !live.is_empty() {
            info!(
                "{}: reinitializing, {} commands outstanding",
                self.name,
                live.len()
            );
        }
        for idx in live {
            let hs = match culprit {
                Some((c, hs)) if c == idx => hs,
                _ => HostStatus::Reset,
            };
            self.ccbs[idx].queued_slot = None;
            self.set_host_status(idx, hs)?;
            self.complete_ccb(idx)?;
        }

        self.init_queues()?;
        let async_scntl3 = self.async_scntl3;
        for tcb in &mut self.targets {
            tcb.reset_transfer(async_scntl3);
        }
        self.chip_init();
        Ok(())
    }
}
