//! Adapter and per-target configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ncr::error::ConfigError;
use crate::ncr::{MAX_LUN, MAX_SCATTER_LIMIT, MAX_START_LIMIT, MAX_TAGS, MAX_TARGET};
use crate::tickable::{TICKS_PER_SECOND, Ticks};
use crate::types::PhysAddr;

/// Target quirks that restrict what the engine attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quirks {
    /// Only IDENTIFY is understood: no tags, negotiation or disconnects
    pub no_message: bool,
    pub no_sync: bool,
    pub no_wide16: bool,
}

/// Per-target user limits. Unset fields fall back to the adapter defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub id: u8,
    /// Smallest synchronous period factor to offer, 0 for asynchronous only
    pub sync_period: Option<u8>,
    /// Transfer width exponent to offer (0 = 8 bit, 1 = 16 bit)
    pub wide: Option<u8>,
    /// Tag queue depth, 1 disables tagged queueing
    pub tags: Option<u8>,
    pub no_disconnect: bool,
    pub no_scan: bool,
    pub quirks: Quirks,
    pub trace: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub name: String,
    pub own_id: u8,
    /// Bus address of the register window as seen by the chip
    pub chip_base: PhysAddr,
    pub memory_base: PhysAddr,
    pub memory_size: usize,
    /// Slots in the start queue
    pub max_start: usize,
    /// Scatter/gather entries per command
    pub max_scatter: usize,
    /// Upper bound on allocated CCBs
    pub max_ccbs: usize,
    /// Chip supports 16-bit transfers
    pub wide: bool,
    pub max_offset: u8,
    /// Fastest synchronous period factor supported by the chip
    pub min_sync: u8,
    pub clock_khz: u32,
    /// Number of usable entries in the clock divisor table
    pub clock_divn: usize,
    pub default_tags: u8,
    pub disconnect: bool,
    pub settle_delay: Ticks,
    pub tick_period: Ticks,
    /// Commands this close to their deadline get an ORDERED tag next
    pub timeout_margin: Ticks,
    /// Consecutive good completions before a LUN's depth grows again
    pub queue_full_recovery: u32,
    pub targets: Vec<TargetConfig>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            name: "ncr53c8xx-0".to_string(),
            own_id: 7,
            chip_base: 0xFEBF_0000,
            memory_base: 0x0010_0000,
            memory_size: 512 * 1024,
            max_start: 16,
            max_scatter: 17,
            max_ccbs: 64,
            wide: true,
            max_offset: 16,
            min_sync: 12,
            clock_khz: 80_000,
            clock_divn: 5,
            default_tags: 8,
            disconnect: true,
            settle_delay: 2 * TICKS_PER_SECOND,
            tick_period: TICKS_PER_SECOND / 10,
            timeout_margin: 3 * TICKS_PER_SECOND,
            queue_full_recovery: 100,
            targets: vec![],
        }
    }
}

impl AdapterConfig {
    /// Parses a JSON configuration, missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Parsing adapter configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn target(&self, id: u8) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.id == id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
            if value < min || value > max {
                return Err(ConfigError::Range {
                    field,
                    value,
                    min,
                    max,
                });
            }
            Ok(())
        }

        if usize::from(self.own_id) >= MAX_TARGET {
            return Err(ConfigError::OwnId(self.own_id));
        }
        if self.memory_base & 0xF != 0 {
            return Err(ConfigError::Misaligned(self.memory_base));
        }
        range("max_start", self.max_start as u64, 2, MAX_START_LIMIT as u64)?;
        range("max_scatter", self.max_scatter as u64, 1, MAX_SCATTER_LIMIT as u64)?;
        range("max_ccbs", self.max_ccbs as u64, 1, (MAX_TARGET * MAX_LUN * MAX_TAGS) as u64)?;
        range("max_offset", self.max_offset.into(), 0, 31)?;
        range("min_sync", self.min_sync.into(), 10, 255)?;
        range("clock_divn", self.clock_divn as u64, 1, 7)?;
        range("default_tags", self.default_tags.into(), 1, MAX_TAGS as u64)?;
        range("tick_period", self.tick_period, 1, u64::MAX)?;
        range("queue_full_recovery", self.queue_full_recovery.into(), 1, u64::from(u32::MAX))?;

        let mut seen = [false; MAX_TARGET];
        for t in &self.targets {
            let id = usize::from(t.id);
            if id >= MAX_TARGET {
                return Err(ConfigError::BadTarget(t.id));
            }
            if std::mem::replace(&mut seen[id], true) {
                return Err(ConfigError::DuplicateTarget(t.id));
            }
            if let Some(tags) = t.tags {
                range("tags", tags.into(), 1, MAX_TAGS as u64)?;
            }
            if let Some(wide) = t.wide {
                range("wide", wide.into(), 0, 1)?;
            }
        }
        Ok(())
    }
}
