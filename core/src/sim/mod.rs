//! Simulated bus for driving the engine without hardware
//!
//! [`SimHarness`] couples an [`Adapter`] with a [`chip::SimChip`] sharing
//! one DMA memory, and runs the chip whenever the host gives it a chance:
//! after submissions, interrupts and clock ticks.

pub mod chip;
pub mod target;

#[cfg(test)]
mod tests;

use anyhow::{Result, bail};
use log::*;

use crate::dma::{DmaMemory, VisibilityClock};
use crate::ncr::usercmd::UserCommand;
use crate::ncr::{
    AbortOutcome, Adapter, AdapterConfig, CommandId, CompletionReceiver, Completion, DataSegment,
    ScsiCommand, Submitted,
};
use crate::tickable::{Tickable, Ticks};

use chip::SimChip;
use target::SimTarget;

/// Interrupts serviced per pump before the chip is considered stuck
const PUMP_LIMIT: usize = 1000;

pub struct SimHarness {
    adapter: Adapter<SimChip>,
    completions: CompletionReceiver,
    clock: VisibilityClock,
    next_id: u64,
}

impl SimHarness {
    pub fn new(config: AdapterConfig) -> Result<Self> {
        let clock = VisibilityClock::new();
        let mem =
            DmaMemory::new(config.memory_base, config.memory_size).with_clock(clock.clone());
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut adapter = Adapter::attach(config, SimChip::new(clock.clone()), mem, tx)?;
        let (script, ncb) = (adapter.script().clone(), *adapter.ncb());
        adapter.chip_mut().load_firmware(script, ncb);

        let mut harness = Self {
            adapter,
            completions: rx,
            clock,
            next_id: 1,
        };
        harness.pump()?;
        Ok(harness)
    }

    pub fn adapter(&self) -> &Adapter<SimChip> {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut Adapter<SimChip> {
        &mut self.adapter
    }

    pub fn chip(&self) -> &SimChip {
        self.adapter.chip()
    }

    pub fn chip_mut(&mut self) -> &mut SimChip {
        self.adapter.chip_mut()
    }

    pub fn clock(&self) -> &VisibilityClock {
        &self.clock
    }

    pub fn attach_target(&mut self, target: SimTarget) -> Result<()> {
        self.chip_mut().attach_target(target)
    }

    pub fn target(&self, id: u8) -> Option<&SimTarget> {
        self.chip().target(id)
    }

    pub fn target_mut(&mut self, id: u8) -> Option<&mut SimTarget> {
        self.chip_mut().target_mut(id)
    }

    pub fn next_id(&mut self) -> CommandId {
        let id = CommandId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Carves a data buffer out of the shared memory
    pub fn alloc_buffer(&mut self, len: usize) -> Result<DataSegment> {
        let addr = self.adapter.memory_mut().alloc(len, 4)?;
        Ok(DataSegment {
            addr,
            len: len as u32,
        })
    }

    pub fn fill_buffer(&mut self, seg: DataSegment, data: &[u8]) -> Result<()> {
        if data.len() > seg.len as usize {
            bail!("{} bytes do not fit a {} byte buffer", data.len(), seg.len);
        }
        self.adapter.memory_mut().write_bytes(seg.addr, data)
    }

    pub fn read_buffer(&self, seg: DataSegment) -> Result<Vec<u8>> {
        let mut buf = vec![0; seg.len as usize];
        self.adapter.memory().read_bytes(seg.addr, &mut buf)?;
        Ok(buf)
    }

    pub fn submit(&mut self, cmd: ScsiCommand) -> Result<Submitted> {
        let submitted = self.adapter.submit(cmd)?;
        self.pump()?;
        Ok(submitted)
    }

    pub fn abort(&mut self, id: CommandId) -> Result<AbortOutcome> {
        let outcome = self.adapter.abort(id)?;
        self.pump()?;
        Ok(outcome)
    }

    pub fn reset(&mut self, id: CommandId) -> Result<()> {
        self.adapter.reset(id)?;
        self.pump()
    }

    pub fn user_command(&mut self, cmd: &str) -> Result<()> {
        let cmd: UserCommand = cmd.parse()?;
        self.adapter.user_command(cmd)?;
        self.pump()
    }

    /// Lets the chip run and services its interrupts until it blocks
    pub fn pump(&mut self) -> Result<()> {
        for _ in 0..PUMP_LIMIT {
            let (chip, mem) = self.adapter.chip_and_memory();
            chip.run(mem)?;
            if !self.adapter.interrupt_pending() {
                return Ok(());
            }
            self.adapter.handle_interrupt()?;
        }
        bail!("Chip still interrupting after {} rounds", PUMP_LIMIT)
    }

    /// Moves simulated time forward in tick periods
    pub fn advance(&mut self, ticks: Ticks) -> Result<()> {
        let period = self.adapter.config().tick_period.max(1);
        let mut left = ticks;
        while left > 0 {
            let step = left.min(period);
            self.chip_mut().advance(step);
            self.adapter.tick(step)?;
            self.pump()?;
            left -= step;
        }
        Ok(())
    }

    /// Advances until nothing is active or waiting, at most `limit` ticks
    pub fn settle(&mut self, limit: Ticks) -> Result<Vec<Completion>> {
        let period = self.adapter.config().tick_period.max(1);
        let mut spent = 0;
        while (self.adapter.active_len() > 0 || self.adapter.waiting_len() > 0) && spent < limit {
            self.advance(period)?;
            spent += period;
        }
        if self.adapter.active_len() > 0 {
            debug!(
                "sim: {} commands still active after {} ticks",
                self.adapter.active_len(),
                spent
            );
        }
        Ok(self.take_completions())
    }

    pub fn take_completions(&mut self) -> Vec<Completion> {
        self.completions.try_iter().collect()
    }
}
