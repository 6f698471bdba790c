//! SCSI protocol vocabulary shared by the script engine and simulated devices

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK_CONDITION: u8 = 0x02;
pub const STATUS_CONDITION_MET: u8 = 0x04;
pub const STATUS_BUSY: u8 = 0x08;
pub const STATUS_RESERVATION_CONFLICT: u8 = 0x18;
pub const STATUS_QUEUE_FULL: u8 = 0x28;

pub const CMD_TEST_UNIT_READY: u8 = 0x00;
pub const CMD_REQUEST_SENSE: u8 = 0x03;
pub const CMD_FORMAT_UNIT: u8 = 0x04;
pub const CMD_READ_BLOCK_LIMITS: u8 = 0x05;
pub const CMD_REASSIGN_BLOCKS: u8 = 0x07;
pub const CMD_READ_6: u8 = 0x08;
pub const CMD_WRITE_6: u8 = 0x0A;
pub const CMD_SEEK_6: u8 = 0x0B;
pub const CMD_WRITE_FILEMARKS: u8 = 0x10;
pub const CMD_SPACE: u8 = 0x11;
pub const CMD_INQUIRY: u8 = 0x12;
pub const CMD_MODE_SELECT_6: u8 = 0x15;
pub const CMD_RESERVE: u8 = 0x16;
pub const CMD_RELEASE: u8 = 0x17;
pub const CMD_MODE_SENSE_6: u8 = 0x1A;
pub const CMD_START_STOP: u8 = 0x1B;
pub const CMD_RECEIVE_DIAGNOSTIC: u8 = 0x1C;
pub const CMD_SEND_DIAGNOSTIC: u8 = 0x1D;
pub const CMD_PREVENT_ALLOW_REMOVAL: u8 = 0x1E;
pub const CMD_READ_CAPACITY: u8 = 0x25;
pub const CMD_READ_10: u8 = 0x28;
pub const CMD_WRITE_10: u8 = 0x2A;
pub const CMD_SEEK_10: u8 = 0x2B;
pub const CMD_WRITE_VERIFY: u8 = 0x2E;
pub const CMD_VERIFY: u8 = 0x2F;
pub const CMD_SYNCHRONIZE_CACHE: u8 = 0x35;
pub const CMD_WRITE_BUFFER: u8 = 0x3B;
pub const CMD_READ_BUFFER: u8 = 0x3C;
pub const CMD_MODE_SELECT_10: u8 = 0x55;
pub const CMD_MODE_SENSE_10: u8 = 0x5A;
pub const CMD_READ_12: u8 = 0xA8;
pub const CMD_WRITE_12: u8 = 0xAA;

pub const MSG_COMPLETE: u8 = 0x00;
pub const MSG_EXTENDED: u8 = 0x01;
pub const MSG_SAVE_DP: u8 = 0x02;
pub const MSG_RESTORE_DP: u8 = 0x03;
pub const MSG_DISCONNECT: u8 = 0x04;
pub const MSG_ABORT: u8 = 0x06;
pub const MSG_REJECT: u8 = 0x07;
pub const MSG_NOOP: u8 = 0x08;
pub const MSG_PARITY: u8 = 0x09;
pub const MSG_ABORT_TAG: u8 = 0x0D;
pub const MSG_SIMPLE_TAG: u8 = 0x20;
pub const MSG_HEAD_TAG: u8 = 0x21;
pub const MSG_ORDERED_TAG: u8 = 0x22;
pub const MSG_IGN_RESIDUE: u8 = 0x23;
pub const MSG_IDENTIFY: u8 = 0x80;
/// Identify modifier granting the target the disconnect privilege
pub const MSG_IDENTIFY_DISC: u8 = 0x40;

pub const MSG_X_SYNC_REQ: u8 = 0x01;
pub const MSG_X_WIDE_REQ: u8 = 0x03;

/// Byte 7 of standard INQUIRY data
pub const INQ7_WBUS16: u8 = 0x20;
pub const INQ7_SYNC: u8 = 0x10;
pub const INQ7_CMDQUE: u8 = 0x02;

/// Length of a command descriptor block, derived from its group code
pub const fn cdb_len(opcode: u8) -> Option<usize> {
    match opcode >> 5 {
        0 => Some(6),
        1 | 2 => Some(10),
        4 => Some(16),
        5 => Some(12),
        _ => None,
    }
}

/// Direction of the data phase of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum Direction {
    /// No data phase
    None,
    /// Target to initiator
    In,
    /// Initiator to target
    Out,
    /// Not known up front, decided by the target's phase
    Unknown,
}

/// Expected data direction for well-known opcodes
pub const fn data_direction(opcode: u8) -> Direction {
    match opcode {
        CMD_REQUEST_SENSE
        | CMD_READ_BLOCK_LIMITS
        | CMD_READ_6
        | CMD_INQUIRY
        | CMD_MODE_SENSE_6
        | CMD_RECEIVE_DIAGNOSTIC
        | CMD_READ_CAPACITY
        | CMD_READ_10
        | CMD_READ_BUFFER
        | CMD_MODE_SENSE_10
        | CMD_READ_12 => Direction::In,
        CMD_FORMAT_UNIT
        | CMD_REASSIGN_BLOCKS
        | CMD_WRITE_6
        | CMD_MODE_SELECT_6
        | CMD_SEND_DIAGNOSTIC
        | CMD_WRITE_10
        | CMD_WRITE_VERIFY
        | CMD_WRITE_BUFFER
        | CMD_MODE_SELECT_10
        | CMD_WRITE_12 => Direction::Out,
        CMD_TEST_UNIT_READY
        | CMD_SEEK_6
        | CMD_WRITE_FILEMARKS
        | CMD_SPACE
        | CMD_RESERVE
        | CMD_RELEASE
        | CMD_START_STOP
        | CMD_PREVENT_ALLOW_REMOVAL
        | CMD_SEEK_10
        | CMD_VERIFY
        | CMD_SYNCHRONIZE_CACHE => Direction::None,
        _ => Direction::Unknown,
    }
}

/// A command descriptor block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cdb(ArrayVec<u8, 16>);

impl Cdb {
    /// Builds a CDB from raw bytes, rejecting empty or oversized blocks.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        ArrayVec::try_from(bytes).ok().map(Self)
    }

    pub fn test_unit_ready() -> Self {
        Self(ArrayVec::from_iter([CMD_TEST_UNIT_READY, 0, 0, 0, 0, 0]))
    }

    pub fn inquiry(alloc: u8) -> Self {
        Self(ArrayVec::from_iter([CMD_INQUIRY, 0, 0, 0, alloc, 0]))
    }

    pub fn request_sense(alloc: u8) -> Self {
        Self(ArrayVec::from_iter([CMD_REQUEST_SENSE, 0, 0, 0, alloc, 0]))
    }

    pub fn read_10(lba: u32, blocks: u16) -> Self {
        Self::rw_10(CMD_READ_10, lba, blocks)
    }

    pub fn write_10(lba: u32, blocks: u16) -> Self {
        Self::rw_10(CMD_WRITE_10, lba, blocks)
    }

    fn rw_10(opcode: u8, lba: u32, blocks: u16) -> Self {
        let l = lba.to_be_bytes();
        let b = blocks.to_be_bytes();
        Self(ArrayVec::from_iter([
            opcode, 0, l[0], l[1], l[2], l[3], 0, b[0], b[1], 0,
        ]))
    }

    pub fn opcode(&self) -> u8 {
        self.0[0]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Logical block address of READ/WRITE (6) and (10)
    pub fn lba(&self) -> Option<u32> {
        let c = self.as_slice();
        match c[0] {
            CMD_READ_6 | CMD_WRITE_6 if c.len() >= 6 => {
                Some(u32::from_be_bytes([0, c[1] & 0x1F, c[2], c[3]]))
            }
            CMD_READ_10 | CMD_WRITE_10 if c.len() >= 10 => {
                Some(u32::from_be_bytes([c[2], c[3], c[4], c[5]]))
            }
            _ => None,
        }
    }

    /// Transfer length in blocks of READ/WRITE (6) and (10)
    pub fn blocks(&self) -> Option<u32> {
        let c = self.as_slice();
        match c[0] {
            CMD_READ_6 | CMD_WRITE_6 if c.len() >= 6 => Some(if c[4] == 0 { 256 } else { c[4].into() }),
            CMD_READ_10 | CMD_WRITE_10 if c.len() >= 10 => {
                Some(u16::from_be_bytes([c[7], c[8]]).into())
            }
            _ => None,
        }
    }
}

/// Valid length of fixed-format sense data
pub fn sense_len(sense: &[u8]) -> usize {
    if sense.len() < 8 || sense[0] & 0x70 != 0x70 {
        return 0;
    }
    (8 + sense[7] as usize).min(sense.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdb_len_by_group() {
        assert_eq!(cdb_len(CMD_INQUIRY), Some(6));
        assert_eq!(cdb_len(CMD_READ_10), Some(10));
        assert_eq!(cdb_len(CMD_MODE_SENSE_10), Some(10));
        assert_eq!(cdb_len(CMD_READ_12), Some(12));
        assert_eq!(cdb_len(0x88), Some(16));
        assert_eq!(cdb_len(0x60), None);
        assert_eq!(cdb_len(0xC0), None);
    }

    #[test]
    fn directions() {
        assert_eq!(data_direction(CMD_READ_10), Direction::In);
        assert_eq!(data_direction(CMD_WRITE_6), Direction::Out);
        assert_eq!(data_direction(CMD_TEST_UNIT_READY), Direction::None);
        assert_eq!(data_direction(0xC5), Direction::Unknown);
    }

    #[test]
    fn rw10_fields() {
        let cdb = Cdb::read_10(0x0102_0304, 13);
        assert_eq!(cdb.len(), 10);
        assert_eq!(cdb.lba(), Some(0x0102_0304));
        assert_eq!(cdb.blocks(), Some(13));
        assert_eq!(Cdb::test_unit_ready().lba(), None);
    }

    #[test]
    fn cdb_from_slice_bounds() {
        assert!(Cdb::from_slice(&[]).is_none());
        assert!(Cdb::from_slice(&[0; 17]).is_none());
        assert_eq!(Cdb::from_slice(&[0x12, 0, 0, 0, 36, 0]), Some(Cdb::inquiry(36)));
    }

    #[test]
    fn sense_length() {
        let mut sense = [0u8; 32];
        assert_eq!(sense_len(&sense), 0);
        sense[0] = 0x70;
        sense[7] = 10;
        assert_eq!(sense_len(&sense), 18);
        sense[7] = 0xF0;
        assert_eq!(sense_len(&sense), 32);
    }
}
