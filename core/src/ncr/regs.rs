//! NCR 53C8xx register window

use num_derive::{FromPrimitive, ToPrimitive};
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

/// Size of the memory-mapped register window
pub const NCR_REG_WINDOW: usize = 0x80;

#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive, strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum NcrReg {
    /// SCSI Control 0
    SCNTL0 = 0x00,
    /// SCSI Control 1
    SCNTL1 = 0x01,
    SCNTL2 = 0x02,
    /// SCSI Control 3, clock divisors and wide enable
    SCNTL3 = 0x03,
    /// SCSI Chip ID
    SCID = 0x04,
    /// SCSI Transfer, period and offset
    SXFER = 0x05,
    /// SCSI Destination ID
    SDID = 0x06,
    GPREG = 0x07,
    /// SCSI First Byte Received
    SFBR = 0x08,
    SOCL = 0x09,
    SSID = 0x0A,
    SBCL = 0x0B,
    /// DMA Status (clears on read)
    DSTAT = 0x0C,
    SSTAT0 = 0x0D,
    SSTAT1 = 0x0E,
    SSTAT2 = 0x0F,
    /// Data Structure Address (32)
    DSA = 0x10,
    /// Interrupt Status
    ISTAT = 0x14,
    CTEST0 = 0x18,
    CTEST1 = 0x19,
    CTEST2 = 0x1A,
    CTEST3 = 0x1B,
    /// Return address of the last CALL (32)
    TEMP = 0x1C,
    /// DMA FIFO byte counter
    DFIFO = 0x20,
    CTEST4 = 0x21,
    CTEST5 = 0x22,
    CTEST6 = 0x23,
    /// DMA Byte Counter (24)
    DBC = 0x24,
    /// DMA Command
    DCMD = 0x27,
    DNAD = 0x28,
    /// DMA SCRIPTS Pointer (32), writing the top byte starts the sequencer
    DSP = 0x2C,
    /// DMA SCRIPTS Pointer Save, holds the INT operand (32)
    DSPS = 0x30,
    SCRATCHA = 0x34,
    DMODE = 0x38,
    DIEN = 0x39,
    SBR = 0x3A,
    DCNTL = 0x3B,
    ADDER = 0x3C,
    SIEN0 = 0x40,
    SIEN1 = 0x41,
    /// SCSI Interrupt Status 0 (clears on read)
    SIST0 = 0x42,
    /// SCSI Interrupt Status 1 (clears on read)
    SIST1 = 0x43,
    SLPAR = 0x44,
    SWIDE = 0x45,
    MACNTL = 0x46,
    GPCNTL = 0x47,
    /// SCSI Timer 0, handshake and selection timeout
    STIME0 = 0x48,
    STIME1 = 0x49,
    /// Response ID (16)
    RESPID = 0x4A,
    STEST0 = 0x4C,
    STEST1 = 0x4D,
    STEST2 = 0x4E,
    STEST3 = 0x4F,
    SIDL = 0x50,
    SODL = 0x54,
    SBDL = 0x58,
    SCRATCHB = 0x5C,
}

impl NcrReg {
    pub const fn offset(self) -> u8 {
        self as u8
    }
}

bitfield! {
    /// Interrupt Status
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Istat(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// DMA interrupt pending
        pub dip: bool @ 0,
        /// SCSI interrupt pending
        pub sip: bool @ 1,
        /// Interrupt on the fly (write 1 to clear)
        pub intf: bool @ 2,
        pub con: bool @ 3,
        pub sem: bool @ 4,
        /// Signal process, wakes up a WAIT RESELECT
        pub sigp: bool @ 5,
        /// Software reset
        pub srst: bool @ 6,
        pub abrt: bool @ 7,
    }
}

bitfield! {
    /// DMA Status
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Dstat(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Illegal instruction detected
        pub iid: bool @ 0,
        /// SCRIPTS interrupt instruction received
        pub sir: bool @ 2,
        /// Single step interrupt
        pub ssi: bool @ 3,
        pub abrt: bool @ 4,
        /// Bus fault
        pub bf: bool @ 5,
        /// Master data parity error
        pub mdpe: bool @ 6,
        /// DMA FIFO empty (state, not an interrupt)
        pub dfe: bool @ 7,
    }
}

impl Dstat {
    /// Bits that raise a fatal DMA interrupt
    pub const FATAL: u8 = 0x01 | 0x10 | 0x20 | 0x40;
}

bitfield! {
    /// SCSI Interrupt Status, SIST0 in the low byte and SIST1 in the high byte
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Sist(pub u16): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Parity error
        pub par: bool @ 0,
        /// SCSI RST received
        pub rst: bool @ 1,
        /// Unexpected disconnect
        pub udc: bool @ 2,
        /// SCSI gross error
        pub sge: bool @ 3,
        /// Reselected
        pub rsl: bool @ 4,
        /// Selected
        pub sel: bool @ 5,
        /// Function complete
        pub cmp: bool @ 6,
        /// Phase mismatch
        pub ma: bool @ 7,
        /// Handshake to handshake timer expired
        pub hth: bool @ 8,
        /// General purpose timer expired
        pub gpt: bool @ 9,
        /// Selection timeout
        pub sto: bool @ 10,
        /// SCSI bus mode change
        pub sbmc: bool @ 12,
    }
}

bitfield! {
    /// SCSI Status 0
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Sstat0(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub sdp0: bool @ 0,
        pub rst: bool @ 1,
        pub woa: bool @ 2,
        pub loa: bool @ 3,
        pub aip: bool @ 4,
        /// SODL register full
        pub olf: bool @ 5,
        /// SODR register full
        pub orf: bool @ 6,
        /// SIDL register full
        pub ilf: bool @ 7,
    }
}

bitfield! {
    /// SCSI Status 2, upper byte lane of the wide registers
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Sstat2(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub sdp1: bool @ 0,
        pub olf1: bool @ 5,
        pub orf1: bool @ 6,
        pub ilf1: bool @ 7,
    }
}

bitfield! {
    /// SCSI Control 1
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Scntl1(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Assert SCSI RST
        pub rst: bool @ 3,
        pub con: bool @ 4,
    }
}

bitfield! {
    /// SCSI Control 3
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Scntl3(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Clock conversion factor (asynchronous)
        pub ccf: u8 @ 0..=2,
        /// Enable wide SCSI
        pub ews: bool @ 3,
        /// Synchronous clock conversion factor
        pub scf: u8 @ 4..=6,
        /// Fast-20 timing
        pub ultra: bool @ 7,
    }
}

bitfield! {
    /// SCSI Transfer
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Sxfer(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Maximum synchronous offset, 0 is asynchronous
        pub offset: u8 @ 0..=4,
        /// Transfer period in clocks minus 4
        pub tp: u8 @ 5..=7,
    }
}

pub const SCNTL0_ARB_FULL: u8 = 0xC0;
pub const SCNTL0_EPC: u8 = 0x08;
pub const SCID_RRE: u8 = 0x40;
pub const CTEST3_CLF: u8 = 0x04;
pub const STEST3_TE: u8 = 0x80;
pub const STEST3_CSF: u8 = 0x02;
pub const DCNTL_STD: u8 = 0x04;
pub const DMODE_BURST8: u8 = 0x80;
/// Selection timeout of about 204.8 ms
pub const STIME0_SEL_204MS: u8 = 0x0C;

/// Interrupt sources enabled in SIEN0/SIEN1
pub const SIEN_ENABLED: u16 = 0x0001 | 0x0002 | 0x0004 | 0x0008 | 0x0080 | 0x0100 | 0x0400 | 0x1000;
/// Interrupt sources enabled in DIEN
pub const DIEN_ENABLED: u8 = 0x01 | 0x04 | 0x10 | 0x20 | 0x40;

/// Asynchronous clock conversion factor for a given SCSI core clock
pub const fn async_ccf(clock_khz: u32) -> u8 {
    match clock_khz {
        0..=25_000 => 1,
        25_001..=37_500 => 2,
        37_501..=50_000 => 3,
        50_001..=75_000 => 4,
        _ => 5,
    }
}
