use anyhow::Result;

/// Representation of X amount of ticks of adapter time.
/// One tick is one millisecond.
pub type Ticks = u64;

pub const TICKS_PER_SECOND: Ticks = 1000;

pub trait Tickable {
    fn tick(&mut self, ticks: Ticks) -> Result<Ticks>;
}
