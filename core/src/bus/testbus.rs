use super::{RegOffset, RegisterBus};
use crate::types::Byte;

use std::collections::HashMap;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Copy, Clone, Debug)]
pub struct TraceEntry {
    pub reg: RegOffset,
    pub access: Access,
    pub val: Byte,
    pub seq: usize,
}

/// Plain register file without side effects that records every access.
pub struct Testbus {
    pub regs: HashMap<RegOffset, Byte>,
    trace: Vec<TraceEntry>,
    seq: usize,
    trace_enabled: bool,
}

impl Testbus {
    pub fn new() -> Self {
        Self {
            regs: HashMap::new(),
            trace: vec![],
            seq: 0,
            trace_enabled: false,
        }
    }

    pub fn reset_trace(&mut self) {
        self.trace.clear();
        self.trace_enabled = true;
    }

    pub fn get_trace(&self) -> Vec<TraceEntry> {
        self.trace.clone()
    }

    /// Values written to a single register, in order
    pub fn writes_to(&self, reg: RegOffset) -> Vec<Byte> {
        self.trace
            .iter()
            .filter(|e| e.reg == reg && e.access == Access::Write)
            .map(|e| e.val)
            .collect()
    }

    fn record(&mut self, reg: RegOffset, access: Access, val: Byte) {
        self.seq += 1;
        if self.trace_enabled {
            self.trace.push(TraceEntry {
                reg,
                access,
                val,
                seq: self.seq,
            });
        }
    }
}

impl RegisterBus for Testbus {
    fn read8(&mut self, reg: RegOffset) -> Byte {
        let val = *self.regs.get(&reg).unwrap_or(&0);
        self.record(reg, Access::Read, val);
        val
    }

    fn write8(&mut self, reg: RegOffset, val: Byte) {
        self.record(reg, Access::Write, val);
        self.regs.insert(reg, val);
    }
}
