//! DMA-visible memory shared between the host and the chip
//!
//! The region keeps two views. The host view is what the driver reads and
//! writes; the device view is what the chip's bus master observes. Host writes
//! are posted: they only reach the device view at the next [`DmaMemory::fence`].
//! Writes done by the chip land in both views immediately.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering, fence};

use anyhow::{Result, bail};

use crate::types::{Long, PhysAddr};

/// Most recent commits kept for inspection
pub const COMMIT_LOG_DEPTH: usize = 1024;

/// Shared sequence counter used to order fences against doorbell writes.
#[derive(Debug, Clone, Default)]
pub struct VisibilityClock(Arc<AtomicU64>);

impl VisibilityClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next sequence number
    pub fn stamp(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// A posted host write that became visible to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRecord {
    pub addr: PhysAddr,
    pub len: usize,
    pub seq: u64,
}

pub struct DmaMemory {
    base: PhysAddr,
    host: Vec<u8>,
    device: Vec<u8>,
    posted: Vec<(usize, usize)>,
    next_free: usize,
    clock: Option<VisibilityClock>,
    commits: VecDeque<CommitRecord>,
}

impl DmaMemory {
    pub fn new(base: PhysAddr, size: usize) -> Self {
        Self {
            base,
            host: vec![0; size],
            device: vec![0; size],
            posted: vec![],
            next_free: 0,
            clock: None,
            commits: VecDeque::new(),
        }
    }

    /// Stamps every fence with the given clock so commits can be ordered
    /// against other observers of the same clock.
    pub fn with_clock(mut self, clock: VisibilityClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.host.len()
    }

    /// Bytes still available to [`DmaMemory::alloc`]
    pub fn available(&self) -> usize {
        self.host.len() - self.next_free
    }

    /// Carves a zeroed block out of the region. Blocks are never returned.
    pub fn alloc(&mut self, len: usize, align: usize) -> Result<PhysAddr> {
        if !align.is_power_of_two() {
            bail!("Invalid alignment {}", align);
        }
        let abs = self.base as usize + self.next_free;
        let start = (abs + align - 1) & !(align - 1);
        let offset = start - self.base as usize;
        if offset + len > self.host.len() {
            bail!(
                "DMA region exhausted: {} bytes requested, {} available",
                len,
                self.available()
            );
        }
        self.next_free = offset + len;
        Ok(start as PhysAddr)
    }

    pub fn contains(&self, addr: PhysAddr, len: usize) -> bool {
        addr >= self.base && (addr - self.base) as usize + len <= self.host.len()
    }

    fn offset(&self, addr: PhysAddr, len: usize) -> Result<usize> {
        if !self.contains(addr, len) {
            bail!("DMA access out of range: {:#010X} len {}", addr, len);
        }
        Ok((addr - self.base) as usize)
    }

    pub fn read_bytes(&self, addr: PhysAddr, buf: &mut [u8]) -> Result<()> {
        let off = self.offset(addr, buf.len())?;
        buf.copy_from_slice(&self.host[off..off + buf.len()]);
        Ok(())
    }

    pub fn read_u8(&self, addr: PhysAddr) -> Result<u8> {
        let off = self.offset(addr, 1)?;
        Ok(self.host[off])
    }

    pub fn read_u32(&self, addr: PhysAddr) -> Result<Long> {
        let mut b = [0; 4];
        self.read_bytes(addr, &mut b)?;
        Ok(Long::from_le_bytes(b))
    }

    /// Posts a host write. The chip does not observe it until the next fence.
    pub fn write_bytes(&mut self, addr: PhysAddr, data: &[u8]) -> Result<()> {
        let off = self.offset(addr, data.len())?;
        self.host[off..off + data.len()].copy_from_slice(data);
        if !data.is_empty() {
            self.posted.push((off, data.len()));
        }
        Ok(())
    }

    pub fn write_u8(&mut self, addr: PhysAddr, val: u8) -> Result<()> {
        self.write_bytes(addr, &[val])
    }

    pub fn write_u32(&mut self, addr: PhysAddr, val: Long) -> Result<()> {
        self.write_bytes(addr, &val.to_le_bytes())
    }

    pub fn has_posted_writes(&self) -> bool {
        !self.posted.is_empty()
    }

    /// Write barrier: makes every posted host write visible to the device.
    pub fn fence(&mut self) {
        fence(Ordering::SeqCst);
        if self.posted.is_empty() {
            return;
        }
        let seq = self.clock.as_ref().map(VisibilityClock::stamp);
        for (off, len) in self.posted.drain(..) {
            self.device[off..off + len].copy_from_slice(&self.host[off..off + len]);
            let Some(seq) = seq else { continue };
            if self.commits.len() == COMMIT_LOG_DEPTH {
                self.commits.pop_front();
            }
            self.commits.push_back(CommitRecord {
                addr: self.base + off as PhysAddr,
                len,
                seq,
            });
        }
    }

    /// The last [`COMMIT_LOG_DEPTH`] commits performed by
    /// [`DmaMemory::fence`], oldest first. Only recorded with a clock attached.
    pub fn commits(&self) -> impl Iterator<Item = &CommitRecord> {
        self.commits.iter()
    }

    pub fn clear_commits(&mut self) {
        self.commits.clear();
    }

    pub fn dev_read_bytes(&self, addr: PhysAddr, buf: &mut [u8]) -> Result<()> {
        let off = self.offset(addr, buf.len())?;
        buf.copy_from_slice(&self.device[off..off + buf.len()]);
        Ok(())
    }

    pub fn dev_read_u8(&self, addr: PhysAddr) -> Result<u8> {
        let off = self.offset(addr, 1)?;
        Ok(self.device[off])
    }

    pub fn dev_read_u32(&self, addr: PhysAddr) -> Result<Long> {
        let mut b = [0; 4];
        self.dev_read_bytes(addr, &mut b)?;
        Ok(Long::from_le_bytes(b))
    }

    /// Bus master write by the chip, visible to both sides at once.
    pub fn dev_write_bytes(&mut self, addr: PhysAddr, data: &[u8]) -> Result<()> {
        let off = self.offset(addr, data.len())?;
        self.device[off..off + data.len()].copy_from_slice(data);
        self.host[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn dev_write_u8(&mut self, addr: PhysAddr, val: u8) -> Result<()> {
        self.dev_write_bytes(addr, &[val])
    }

    pub fn dev_write_u32(&mut self, addr: PhysAddr, val: Long) -> Result<()> {
        self.dev_write_bytes(addr, &val.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_aligns_and_exhausts() {
        let mut mem = DmaMemory::new(0x1000, 0x100);
        let a = mem.alloc(3, 1).unwrap();
        let b = mem.alloc(16, 16).unwrap();
        assert_eq!(a, 0x1000);
        assert_eq!(b, 0x1010);
        assert_eq!(mem.available(), 0x100 - 0x20);
        assert!(mem.alloc(0x100, 4).is_err());
        assert!(mem.alloc(4, 3).is_err());
    }

    #[test]
    fn posted_writes_need_fence() {
        let mut mem = DmaMemory::new(0x1000, 0x100);
        mem.write_u32(0x1010, 0xDEAD_BEEF).unwrap();
        assert_eq!(mem.read_u32(0x1010).unwrap(), 0xDEAD_BEEF);
        assert_eq!(mem.dev_read_u32(0x1010).unwrap(), 0);
        assert!(mem.has_posted_writes());

        mem.fence();
        assert_eq!(mem.dev_read_u32(0x1010).unwrap(), 0xDEAD_BEEF);
        assert!(!mem.has_posted_writes());
    }

    #[test]
    fn device_writes_are_immediate() {
        let mut mem = DmaMemory::new(0x1000, 0x100);
        mem.dev_write_u8(0x10FF, 0x5A).unwrap();
        assert_eq!(mem.read_u8(0x10FF).unwrap(), 0x5A);
        assert!(mem.dev_write_u32(0x10FE, 0).is_err());
        assert!(mem.read_u8(0x0FFF).is_err());
    }

    #[test]
    fn commits_are_stamped() {
        let clock = VisibilityClock::new();
        let mut mem = DmaMemory::new(0, 0x40).with_clock(clock.clone());
        mem.write_u8(4, 1).unwrap();
        mem.fence();
        let marker = clock.stamp();
        mem.write_u8(8, 1).unwrap();
        mem.fence();

        let commits = mem.commits().collect::<Vec<_>>();
        assert_eq!(commits.len(), 2);
        assert!(commits[0].seq < marker);
        assert!(commits[1].seq > marker);
        assert_eq!(commits[1].addr, 8);
    }

    #[test]
    fn commit_log_is_bounded() {
        let mut mem = DmaMemory::new(0, 0x40);
        mem.write_u8(4, 1).unwrap();
        mem.fence();
        assert_eq!(mem.commits().count(), 0);

        let mut mem = mem.with_clock(VisibilityClock::new());
        for i in 0..COMMIT_LOG_DEPTH + 10 {
            mem.write_u8((i % 0x40) as PhysAddr, i as u8).unwrap();
            mem.fence();
        }
        assert_eq!(mem.commits().count(), COMMIT_LOG_DEPTH);
        let first = mem.commits().next().unwrap();
        assert_eq!(first.seq, 11);
        assert_eq!(first.addr, 10);
    }
}
