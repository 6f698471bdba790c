//! SCRIPTS program: template, relocation and binding
//!
//! The template is a flat array of 32-bit words laid out exactly as the chip
//! will fetch them. Operands that hold addresses are tagged in their top
//! nibble with the kind of relocation the binder applies once the final
//! locations of the script, the NCB and the register window are known:
//!
//! | Tag   | Meaning                                 |
//! |-------|-----------------------------------------|
//! | `0x4` | offset into the NCB (host memory)       |
//! | `0x5` | offset of a label within the script     |
//! | `0x6` | register offset within the chip window  |
//! | `0x7` | index of a kernel variable              |
//!
//! The start queue slots and the data move sections depend on the adapter
//! geometry and are generated by [`ScriptTemplate::fill_variable_length_sections`]
//! before binding.

use std::collections::HashMap;

use anyhow::Result;
use num_derive::{FromPrimitive, ToPrimitive};

use crate::dma::DmaMemory;
use crate::ncr::error::BindError;
use crate::ncr::layout::{NCB_DONE_PUT, NCB_LUN_TABLE, NCB_MSGIN, NCB_MSGOUT, NCB_RESTART_TRAP};
use crate::ncr::layout::{NCB_SCRATCH, NCB_STARTPOS, NcbLayout, ccb};
use crate::ncr::regs::NcrReg;
use crate::scsi::{Direction, MSG_COMPLETE, MSG_DISCONNECT, MSG_EXTENDED, MSG_IGN_RESIDUE};
use crate::scsi::{MSG_REJECT, MSG_SAVE_DP, MSG_X_SYNC_REQ, MSG_X_WIDE_REQ};
use crate::types::PhysAddr;

pub const RELOC_MASK: u32 = 0xF000_0000;
pub const RELOC_SOFTC: u32 = 0x4000_0000;
pub const RELOC_LABEL: u32 = 0x5000_0000;
pub const RELOC_REGISTER: u32 = 0x6000_0000;
pub const RELOC_KVAR: u32 = 0x7000_0000;

/// Tick counter maintained by the host
pub const KVAR_TICKS: u32 = 0;
pub const KVAR_COUNT: usize = 1;

pub const PHASE_DATA_OUT: u8 = 0;
pub const PHASE_DATA_IN: u8 = 1;
pub const PHASE_COMMAND: u8 = 2;
pub const PHASE_STATUS: u8 = 3;
pub const PHASE_MSG_OUT: u8 = 6;
pub const PHASE_MSG_IN: u8 = 7;

pub const SCR_MOVE_ABS: u32 = 0x0000_0000;
pub const SCR_MOVE_TBL: u32 = 0x1000_0000;
pub const SCR_SEL_TBL_ATN: u32 = 0x4300_0000;
pub const SCR_WAIT_DISC: u32 = 0x4800_0000;
pub const SCR_WAIT_RESEL: u32 = 0x5000_0000;
pub const SCR_SET: u32 = 0x5800_0000;
pub const SCR_CLR: u32 = 0x6000_0000;
pub const SCR_LOAD_REG: u32 = 0x7800_0000;
pub const SCR_JUMP: u32 = 0x8008_0000;
pub const SCR_CALL: u32 = 0x8808_0000;
pub const SCR_RETURN: u32 = 0x9008_0000;
pub const SCR_INT: u32 = 0x9808_0000;
pub const SCR_INT_FLY: u32 = 0x9810_0000;
pub const SCR_COPY: u32 = 0xC100_0000;

/// Transfer control when the condition is true (cleared: when false)
pub const SCR_JMP_TRUE: u32 = 0x0008_0000;
/// Relative jump, the operand is a displacement
pub const SCR_JMP_REL: u32 = 0x0080_0000;

pub const SCR_ACK: u32 = 0x0000_0040;
pub const SCR_ATN: u32 = 0x0000_0008;

/// Wait for REQ, then compare the phase
pub const fn when(phase: u8) -> u32 {
    0x0003_0000 | (phase as u32) << 24
}

/// Compare the phase without waiting
pub const fn if_phase(phase: u8) -> u32 {
    0x0002_0000 | (phase as u32) << 24
}

/// Compare SFBR against a byte
pub const fn data(d: u8) -> u32 {
    0x0004_0000 | d as u32
}

const fn unless(op: u32, cond: u32) -> u32 {
    (op & !SCR_JMP_TRUE) | cond
}

const fn phase(p: u8) -> u32 {
    (p as u32) << 24
}

const fn load_reg(reg: NcrReg, val: u8) -> u32 {
    SCR_LOAD_REG | (reg.offset() as u32) << 16 | (val as u32) << 8
}

/// Operand of a SCRIPTS INT instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, strum::IntoStaticStr)]
pub enum Sir {
    /// Autosense restart trap fired
    SenseRestart = 1,
    /// Autosense could not be started
    SenseFailed = 2,
    /// Synchronous transfer request received
    NegoSync = 5,
    /// Wide transfer request received
    NegoWide = 6,
    /// Target went to a different phase instead of answering
    NegoFailed = 7,
    /// Negotiation protocol error
    NegoProto = 8,
    RejectReceived = 9,
    RejectSent = 10,
    IgnResidue = 11,
    /// Target disconnected without saving the data pointer
    MissingSave = 12,
    /// Data phase of a command with unknown direction is OUT
    DataIoIsOut = 13,
    /// Data phase of a command with unknown direction is IN
    DataIoIsIn = 14,
}

/// Entry points and fixed locations within the script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::IntoStaticStr, strum::EnumIter)]
pub enum Label {
    Start,
    TryLoop,
    TryLoopEnd,
    Idle,
    Skip,
    Select,
    Dispatch,
    Clrack,
    CheckAtn,
    NoData,
    Status,
    MsgIn,
    MsgExtended,
    MsgSdtr,
    MsgWdtr,
    MsgBad,
    SdtrResp,
    WdtrResp,
    SaveDp,
    Disconnect,
    Complete,
    Reselect,
    Reselected,
    DataIn,
    DataInEnd,
    DataOut,
    DataOutEnd,
    DataIo,
    Getcc,
}

enum Operand {
    Label(Label),
    Ncb(u32),
    Reg(NcrReg),
    Kvar(u32),
    Raw(u32),
}

#[derive(Default)]
struct ScriptBuilder {
    words: Vec<u32>,
    labels: HashMap<Label, usize>,
    fixups: Vec<(usize, Label)>,
}

impl ScriptBuilder {
    fn label(&mut self, label: Label) {
        self.labels.insert(label, self.words.len());
    }

    fn emit(&mut self, op: u32, operands: &[Operand]) {
        self.words.push(op);
        for o in operands {
            let w = match *o {
                Operand::Label(l) => {
                    self.fixups.push((self.words.len(), l));
                    0
                }
                Operand::Ncb(off) => RELOC_SOFTC | off,
                Operand::Reg(r) => RELOC_REGISTER | u32::from(r.offset()),
                Operand::Kvar(i) => RELOC_KVAR | i,
                Operand::Raw(v) => v,
            };
            self.words.push(w);
        }
    }

    fn reserve(&mut self, words: usize) {
        self.words.resize(self.words.len() + words, 0);
    }

    fn finish(mut self) -> (Vec<u32>, HashMap<Label, u32>) {
        for (at, label) in self.fixups.drain(..) {
            self.words[at] = RELOC_LABEL | (4 * self.labels[&label]) as u32;
        }
        let labels = self
            .labels
            .into_iter()
            .map(|(l, idx)| (l, (4 * idx) as u32))
            .collect();
        (self.words, labels)
    }
}

/// Label offsets and geometry of a script
#[derive(Debug, Clone)]
pub struct ScriptLayout {
    labels: HashMap<Label, u32>,
    max_start: usize,
    max_scatter: usize,
    size: usize,
}

impl ScriptLayout {
    pub fn offset(&self, label: Label) -> u32 {
        self.labels[&label]
    }
}

/// Unbound script, all addresses are still tagged offsets
#[derive(Debug, Clone)]
pub struct ScriptTemplate {
    words: Vec<u32>,
    layout: ScriptLayout,
}

/// Bytes per start queue slot (CALL + operand)
pub const TRYLOOP_SLOT_SIZE: u32 = 8;
/// Bytes per data move entry (CALL checkatn + MOVE_TBL)
pub const DATA_ENTRY_SIZE: u32 = 16;

impl ScriptTemplate {
    pub fn new(max_start: usize, max_scatter: usize) -> Self {
        use Label::*;
        use Operand::{Kvar, Ncb, Raw, Reg};

        let l = Operand::Label;
        let mut b = ScriptBuilder::default();

        b.label(Start);
        b.emit(SCR_COPY | 1, &[Ncb(NCB_RESTART_TRAP), Reg(NcrReg::SFBR)]);
        b.emit(unless(SCR_INT, data(0)), &[Raw(Sir::SenseRestart as u32)]);
        b.emit(SCR_COPY | 4, &[Ncb(NCB_STARTPOS), Reg(NcrReg::TEMP)]);
        b.emit(SCR_RETURN, &[Raw(0)]);

        b.label(TryLoop);
        b.reserve(2 * max_start);
        b.label(TryLoopEnd);
        b.emit(SCR_JUMP, &[l(TryLoop)]);

        // SIGP aborts the wait and sends us back to the start queue
        b.label(Idle);
        b.emit(SCR_WAIT_RESEL, &[l(Start)]);
        b.emit(SCR_JUMP, &[l(Reselected)]);

        b.label(Skip);
        b.emit(SCR_COPY | 4, &[Reg(NcrReg::TEMP), Ncb(NCB_STARTPOS)]);
        b.emit(SCR_RETURN, &[Raw(0)]);

        b.label(Select);
        b.emit(SCR_COPY | 4, &[Reg(NcrReg::TEMP), Ncb(NCB_STARTPOS)]);
        b.emit(SCR_COPY | 4, &[Kvar(KVAR_TICKS), Ncb(NCB_SCRATCH)]);
        b.emit(SCR_SEL_TBL_ATN | ccb::SELECT, &[l(Reselect)]);
        b.emit(SCR_MOVE_TBL | phase(PHASE_MSG_OUT), &[Raw(ccb::SMSG_TBL)]);
        b.emit(SCR_JUMP | when(PHASE_MSG_IN), &[l(MsgIn)]);
        b.emit(SCR_MOVE_TBL | phase(PHASE_COMMAND), &[Raw(ccb::CMD_TBL)]);

        b.label(Dispatch);
        b.emit(SCR_RETURN | when(PHASE_DATA_OUT), &[Raw(0)]);
        b.emit(SCR_RETURN | if_phase(PHASE_DATA_IN), &[Raw(0)]);
        b.emit(SCR_JUMP | if_phase(PHASE_STATUS), &[l(Status)]);
        b.emit(SCR_JUMP | if_phase(PHASE_MSG_IN), &[l(MsgIn)]);
        b.emit(SCR_JUMP, &[l(Dispatch)]);

        b.label(Clrack);
        b.emit(SCR_CLR | SCR_ACK, &[Raw(0)]);
        b.emit(SCR_JUMP, &[l(Dispatch)]);

        b.label(CheckAtn);
        b.emit(unless(SCR_RETURN, when(PHASE_MSG_OUT)), &[Raw(0)]);
        b.emit(SCR_MOVE_ABS | 1 | phase(PHASE_MSG_OUT), &[Ncb(NCB_MSGOUT)]);
        b.emit(SCR_RETURN, &[Raw(0)]);

        // Target wants more data than described, sink it
        b.label(NoData);
        b.emit(load_reg(NcrReg::SCRATCHA, crate::ncr::ccb::XE_EXTRA_DATA), &[Raw(0)]);
        b.emit(SCR_COPY | 1, &[Reg(NcrReg::SCRATCHA), Ncb(NCB_SCRATCH)]);
        b.emit(SCR_MOVE_ABS | 1 | phase(PHASE_DATA_IN), &[Ncb(NCB_SCRATCH)]);
        b.emit(SCR_JUMP | when(PHASE_DATA_IN), &[l(NoData)]);
        b.emit(SCR_JUMP, &[l(Dispatch)]);

        b.label(Status);
        b.emit(SCR_MOVE_ABS | 1 | phase(PHASE_STATUS), &[Ncb(NCB_SCRATCH)]);
        b.emit(SCR_JUMP, &[l(Dispatch)]);

        b.label(MsgIn);
        b.emit(SCR_MOVE_ABS | 1 | phase(PHASE_MSG_IN), &[Ncb(NCB_MSGIN)]);
        b.emit(SCR_JUMP | data(MSG_COMPLETE), &[l(Complete)]);
        b.emit(SCR_JUMP | data(MSG_DISCONNECT), &[l(Disconnect)]);
        b.emit(SCR_JUMP | data(MSG_SAVE_DP), &[l(SaveDp)]);
        b.emit(SCR_JUMP | data(MSG_EXTENDED), &[l(MsgExtended)]);
        b.emit(SCR_INT | data(MSG_REJECT), &[Raw(Sir::RejectReceived as u32)]);
        b.emit(SCR_INT | data(MSG_IGN_RESIDUE), &[Raw(Sir::IgnResidue as u32)]);
        b.emit(SCR_JUMP, &[l(MsgBad)]);

        b.label(MsgExtended);
        b.emit(SCR_CLR | SCR_ACK, &[Raw(0)]);
        b.emit(SCR_MOVE_ABS | 1 | phase(PHASE_MSG_IN), &[Ncb(NCB_MSGIN + 1)]);
        b.emit(SCR_CLR | SCR_ACK, &[Raw(0)]);
        b.emit(SCR_MOVE_ABS | 1 | phase(PHASE_MSG_IN), &[Ncb(NCB_MSGIN + 2)]);
        b.emit(SCR_JUMP | data(MSG_X_SYNC_REQ), &[l(MsgSdtr)]);
        b.emit(SCR_JUMP | data(MSG_X_WIDE_REQ), &[l(MsgWdtr)]);
        b.emit(SCR_JUMP, &[l(MsgBad)]);

        b.label(MsgSdtr);
        b.emit(SCR_CLR | SCR_ACK, &[Raw(0)]);
        b.emit(SCR_MOVE_ABS | 2 | phase(PHASE_MSG_IN), &[Ncb(NCB_MSGIN + 3)]);
        b.emit(SCR_INT, &[Raw(Sir::NegoSync as u32)]);

        b.label(MsgWdtr);
        b.emit(SCR_CLR | SCR_ACK, &[Raw(0)]);
        b.emit(SCR_MOVE_ABS | 1 | phase(PHASE_MSG_IN), &[Ncb(NCB_MSGIN + 3)]);
        b.emit(SCR_INT, &[Raw(Sir::NegoWide as u32)]);

        b.label(MsgBad);
        b.emit(load_reg(NcrReg::SCRATCHA, MSG_REJECT), &[Raw(0)]);
        b.emit(SCR_COPY | 1, &[Reg(NcrReg::SCRATCHA), Ncb(NCB_MSGOUT)]);
        b.emit(SCR_SET | SCR_ATN, &[Raw(0)]);
        b.emit(SCR_JUMP, &[l(Clrack)]);

        b.label(SdtrResp);
        b.emit(SCR_SET | SCR_ATN, &[Raw(0)]);
        b.emit(SCR_CLR | SCR_ACK, &[Raw(0)]);
        b.emit(SCR_MOVE_ABS | 5 | phase(PHASE_MSG_OUT), &[Ncb(NCB_MSGOUT)]);
        b.emit(SCR_JUMP, &[l(Dispatch)]);

        b.label(WdtrResp);
        b.emit(SCR_SET | SCR_ATN, &[Raw(0)]);
        b.emit(SCR_CLR | SCR_ACK, &[Raw(0)]);
        b.emit(SCR_MOVE_ABS | 4 | phase(PHASE_MSG_OUT), &[Ncb(NCB_MSGOUT)]);
        b.emit(SCR_JUMP, &[l(Dispatch)]);

        b.label(SaveDp);
        b.emit(SCR_CLR | SCR_ACK, &[Raw(0)]);
        b.emit(SCR_COPY | 4, &[Reg(NcrReg::TEMP), Ncb(NCB_SCRATCH)]);
        b.emit(SCR_JUMP, &[l(Dispatch)]);

        b.label(Disconnect);
        b.emit(SCR_CLR | SCR_ACK, &[Raw(0)]);
        b.emit(SCR_WAIT_DISC, &[Raw(0)]);
        b.emit(SCR_JUMP, &[l(Start)]);

        b.label(Complete);
        b.emit(SCR_CLR | SCR_ACK | SCR_ATN, &[Raw(0)]);
        b.emit(SCR_WAIT_DISC, &[Raw(0)]);
        b.emit(SCR_COPY | 4, &[Ncb(NCB_DONE_PUT), Reg(NcrReg::SCRATCHB)]);
        b.emit(SCR_INT_FLY, &[Raw(0)]);
        b.emit(SCR_JUMP, &[l(Start)]);

        b.label(Reselect);
        b.emit(SCR_JUMP, &[l(Reselected)]);

        b.label(Reselected);
        b.emit(SCR_MOVE_ABS | 1 | phase(PHASE_MSG_IN), &[Ncb(NCB_MSGIN)]);
        b.emit(SCR_COPY | 4, &[Ncb(NCB_LUN_TABLE), Reg(NcrReg::DSA)]);
        b.emit(SCR_JUMP, &[l(Clrack)]);

        b.label(DataIn);
        b.reserve(4 * max_scatter);
        b.label(DataInEnd);
        b.emit(SCR_CALL, &[l(CheckAtn)]);
        b.emit(SCR_JUMP, &[l(NoData)]);

        b.label(DataOut);
        b.reserve(4 * max_scatter);
        b.label(DataOutEnd);
        b.emit(SCR_CALL, &[l(CheckAtn)]);
        b.emit(SCR_JUMP, &[l(NoData)]);

        b.label(DataIo);
        b.emit(SCR_INT | when(PHASE_DATA_OUT), &[Raw(Sir::DataIoIsOut as u32)]);
        b.emit(SCR_INT | if_phase(PHASE_DATA_IN), &[Raw(Sir::DataIoIsIn as u32)]);
        b.emit(SCR_JUMP, &[l(NoData)]);

        b.label(Getcc);
        b.emit(SCR_SEL_TBL_ATN | ccb::SELECT, &[l(Reselect)]);
        b.emit(SCR_MOVE_TBL | phase(PHASE_MSG_OUT), &[Raw(ccb::SMSG_TBL)]);
        b.emit(SCR_MOVE_TBL | phase(PHASE_COMMAND), &[Raw(ccb::SENSE_CMD_TBL)]);
        b.emit(SCR_MOVE_TBL | phase(PHASE_DATA_IN), &[Raw(ccb::SENSE_TBL)]);
        b.emit(SCR_JUMP, &[l(Dispatch)]);

        let (words, labels) = b.finish();
        let size = 4 * words.len();
        Self {
            words,
            layout: ScriptLayout {
                labels,
                max_start,
                max_scatter,
                size,
            },
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn layout(&self) -> &ScriptLayout {
        &self.layout
    }

    /// Generates the start queue and data move sections.
    ///
    /// Every start queue slot initially CALLs `idle`. Each data entry CALLs
    /// `checkatn` unless the target is still in the data phase, then moves
    /// one scatter/gather entry through the CCB's data table.
    pub fn fill_variable_length_sections(&mut self) {
        let label = |l: Label| RELOC_LABEL | self.layout.offset(l);
        let idle = label(Label::Idle);
        let checkatn = label(Label::CheckAtn);
        let tryloop = self.layout.offset(Label::TryLoop) as usize / 4;

        for slot in 0..self.layout.max_start {
            self.words[tryloop + 2 * slot] = SCR_CALL;
            self.words[tryloop + 2 * slot + 1] = idle;
        }

        for (section, p) in [
            (Label::DataIn, PHASE_DATA_IN),
            (Label::DataOut, PHASE_DATA_OUT),
        ] {
            let start = self.layout.offset(section) as usize / 4;
            for i in 0..self.layout.max_scatter {
                let w = start + 4 * i;
                self.words[w] = unless(SCR_CALL, when(p));
                self.words[w + 1] = checkatn;
                self.words[w + 2] = SCR_MOVE_TBL | phase(p);
                self.words[w + 3] = ccb::data_entry(i);
            }
        }
    }
}

/// Final addresses applied by [`copy_and_relocate`]
pub struct RelocContext<'a> {
    pub chip_base: PhysAddr,
    pub script_base: PhysAddr,
    pub ncb_base: PhysAddr,
    pub kvars: &'a [PhysAddr],
}

/// Instruction length in words and how many of its operands are relocated
const fn instruction_shape(opcode: u32) -> (usize, usize) {
    match opcode >> 28 {
        // COPY: source and destination
        0xC => (3, 2),
        // MOVE absolute
        0x0 => (2, 1),
        0x8 if opcode & SCR_JMP_REL != 0 => (2, 0),
        0x8 => (2, 1),
        // SELECT, WAIT, SET/CLR, register moves
        0x4..=0x7 => (2, 1),
        _ => (2, 0),
    }
}

fn relocate(word: u32, offset: usize, ctx: &RelocContext) -> Result<u32, BindError> {
    let value = word & !RELOC_MASK;
    Ok(match word & RELOC_MASK {
        RELOC_REGISTER => ctx.chip_base + value,
        RELOC_LABEL => ctx.script_base + value,
        RELOC_SOFTC => ctx.ncb_base + value,
        RELOC_KVAR => *ctx
            .kvars
            .get(value as usize)
            .ok_or(BindError::KvarOutOfRange {
                offset,
                index: value,
            })?,
        0 if word == 0 => 0,
        _ => return Err(BindError::BadRelocation { offset, word }),
    })
}

/// Copies a script into `dest`, resolving all tagged operands.
/// Returns the number of relocated operands.
pub fn copy_and_relocate(
    src: &[u32],
    dest: &mut [u32],
    ctx: &RelocContext,
) -> Result<usize, BindError> {
    if dest.len() < src.len() {
        return Err(BindError::DestinationTooSmall {
            have: dest.len(),
            need: src.len(),
        });
    }

    let mut relocated = 0;
    let mut i = 0;
    while i < src.len() {
        let opcode = src[i];
        if opcode == 0 {
            return Err(BindError::ZeroOpcode(i));
        }
        let (len, relocs) = instruction_shape(opcode);
        if i + len > src.len() {
            return Err(BindError::Truncated(i));
        }
        dest[i] = opcode;
        for k in 1..len {
            let w = src[i + k];
            dest[i + k] = if k <= relocs {
                relocated += 1;
                relocate(w, i + k, ctx)?
            } else {
                w
            };
        }
        i += len;
    }
    Ok(relocated)
}

/// Script as loaded into DMA memory
#[derive(Debug, Clone)]
pub struct BoundScript {
    base: PhysAddr,
    layout: ScriptLayout,
}

impl BoundScript {
    /// Relocates a filled template into freshly allocated DMA memory.
    pub fn bind(
        template: &ScriptTemplate,
        mem: &mut DmaMemory,
        chip_base: PhysAddr,
        ncb: &NcbLayout,
    ) -> Result<Self> {
        let base = mem.alloc(template.layout.size, 16)?;
        let kvars: Vec<PhysAddr> = (0..KVAR_COUNT).map(|i| ncb.kvar(i)).collect();
        let ctx = RelocContext {
            chip_base,
            script_base: base,
            ncb_base: ncb.base,
            kvars: &kvars,
        };
        let mut image = vec![0; template.words.len()];
        copy_and_relocate(&template.words, &mut image, &ctx)?;

        let bytes: Vec<u8> = image.iter().flat_map(|w| w.to_le_bytes()).collect();
        mem.write_bytes(base, &bytes)?;
        Ok(Self {
            base,
            layout: template.layout.clone(),
        })
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.layout.size
    }

    pub fn max_start(&self) -> usize {
        self.layout.max_start
    }

    pub fn max_scatter(&self) -> usize {
        self.layout.max_scatter
    }

    pub fn addr(&self, label: Label) -> PhysAddr {
        self.base + self.layout.offset(label)
    }

    pub fn label_at(&self, addr: PhysAddr) -> Option<Label> {
        let off = addr.checked_sub(self.base)?;
        self.layout
            .labels
            .iter()
            .find(|&(_, &o)| o == off)
            .map(|(&l, _)| l)
    }

    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.base && ((addr - self.base) as usize) < self.layout.size
    }

    /// Address of a start queue slot's CALL instruction
    pub fn tryloop_slot(&self, slot: usize) -> PhysAddr {
        self.addr(Label::TryLoop) + TRYLOOP_SLOT_SIZE * slot as u32
    }

    /// Address of the operand the host patches to queue a CCB
    pub fn slot_operand(&self, slot: usize) -> PhysAddr {
        self.tryloop_slot(slot) + 4
    }

    /// Maps an address the chip reports for the start queue back to a slot.
    /// The end of the try loop wraps around to slot 0.
    pub fn slot_of(&self, addr: PhysAddr) -> Option<usize> {
        if addr == self.addr(Label::TryLoopEnd) {
            return Some(0);
        }
        let off = addr.checked_sub(self.addr(Label::TryLoop))?;
        let slot = (off / TRYLOOP_SLOT_SIZE) as usize;
        (off % TRYLOOP_SLOT_SIZE == 0 && slot < self.layout.max_start).then_some(slot)
    }

    fn section(dir: Direction) -> Option<(Label, Label)> {
        match dir {
            Direction::In => Some((Label::DataIn, Label::DataInEnd)),
            Direction::Out => Some((Label::DataOut, Label::DataOutEnd)),
            _ => None,
        }
    }

    /// Address of the move entry for data table index `index`
    pub fn data_entry(&self, dir: Direction, index: usize) -> Option<PhysAddr> {
        let (start, _) = Self::section(dir)?;
        (index <= self.layout.max_scatter)
            .then(|| self.addr(start) + DATA_ENTRY_SIZE * index as u32)
    }

    /// End of the data section, the goal pointer of every command
    pub fn data_end(&self, dir: Direction) -> Option<PhysAddr> {
        let (_, end) = Self::section(dir)?;
        Some(self.addr(end))
    }

    /// Initial data pointer for a transfer of `segments` entries. The entries
    /// occupy the tail of the table so the pointer runs into the section end.
    pub fn data_start(&self, dir: Direction, segments: usize) -> Option<PhysAddr> {
        let index = self.layout.max_scatter.checked_sub(segments)?;
        self.data_entry(dir, index)
    }

    /// Data table index of a move entry address in the given section
    pub fn entry_index(&self, dir: Direction, addr: PhysAddr) -> Option<usize> {
        let (start, _) = Self::section(dir)?;
        let off = addr.checked_sub(self.addr(start))?;
        let index = (off / DATA_ENTRY_SIZE) as usize;
        (off % DATA_ENTRY_SIZE == 0 && index < self.layout.max_scatter).then_some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ncr::layout::NCB_KVARS;

    fn ctx(kvars: &[PhysAddr]) -> RelocContext<'_> {
        RelocContext {
            chip_base: 0xFEBF_0000,
            script_base: 0x0010_0000,
            ncb_base: 0x0020_0000,
            kvars,
        }
    }

    #[test]
    fn relocates_each_kind() {
        let kvars = [0x0020_0010];
        let src = [
            SCR_COPY | 4,
            RELOC_SOFTC | 0x08,
            RELOC_REGISTER | 0x1C,
            SCR_JUMP,
            RELOC_LABEL | 0x40,
            SCR_INT,
            0x0000_0005,
            SCR_COPY | 4,
            RELOC_KVAR | KVAR_TICKS,
            RELOC_SOFTC,
            SCR_JUMP | SCR_JMP_REL,
            0x0000_0010,
            SCR_WAIT_DISC,
            0,
        ];
        let mut dest = [0; 14];
        let n = copy_and_relocate(&src, &mut dest, &ctx(&kvars)).unwrap();
        assert_eq!(n, 6);
        assert_eq!(dest[1], 0x0020_0008);
        assert_eq!(dest[2], 0xFEBF_001C);
        assert_eq!(dest[4], 0x0010_0040);
        assert_eq!(dest[6], 5);
        assert_eq!(dest[8], 0x0020_0010);
        assert_eq!(dest[9], 0x0020_0000);
        assert_eq!(dest[11], 0x10);
        assert_eq!(dest[13], 0);
    }

    #[test]
    fn rejects_bad_input() {
        let kvars = [0];
        let mut dest = [0; 4];
        assert_eq!(
            copy_and_relocate(&[SCR_JUMP, 0x1234], &mut dest, &ctx(&kvars)),
            Err(BindError::BadRelocation {
                offset: 1,
                word: 0x1234
            })
        );
        assert_eq!(
            copy_and_relocate(&[SCR_JUMP, RELOC_KVAR | 1], &mut dest, &ctx(&kvars)),
            Err(BindError::KvarOutOfRange {
                offset: 1,
                index: 1
            })
        );
        assert_eq!(
            copy_and_relocate(&[SCR_INT, 1, 0, 0], &mut dest, &ctx(&kvars)),
            Err(BindError::ZeroOpcode(2))
        );
        assert_eq!(
            copy_and_relocate(&[SCR_COPY | 1, 0], &mut dest, &ctx(&kvars)),
            Err(BindError::Truncated(0))
        );
        assert!(matches!(
            copy_and_relocate(&[0; 5], &mut dest, &ctx(&kvars)),
            Err(BindError::DestinationTooSmall { .. })
        ));
    }

    #[test]
    fn unfilled_template_does_not_bind() {
        let t = ScriptTemplate::new(4, 3);
        let mut dest = vec![0; t.words().len()];
        let kvars = [0];
        let tryloop = t.layout().offset(Label::TryLoop) as usize / 4;
        assert_eq!(
            copy_and_relocate(t.words(), &mut dest, &ctx(&kvars)),
            Err(BindError::ZeroOpcode(tryloop))
        );
    }

    #[test]
    fn fill_is_idempotent() {
        let mut a = ScriptTemplate::new(16, 17);
        a.fill_variable_length_sections();
        let mut b = a.clone();
        b.fill_variable_length_sections();
        assert_eq!(a.words(), b.words());
    }

    #[test]
    fn rebinding_only_moves_relocated_operands() {
        let mut t = ScriptTemplate::new(16, 17);
        t.fill_variable_length_sections();
        let kv_a = [0x0020_0000 + NCB_KVARS];
        let kv_b = [0x0030_0000 + NCB_KVARS];
        let a_ctx = ctx(&kv_a);
        let b_ctx = RelocContext {
            chip_base: 0xE000_0000,
            script_base: 0x0040_0000,
            ncb_base: 0x0030_0000,
            kvars: &kv_b,
        };
        let mut a = vec![0; t.words().len()];
        let mut b = vec![0; t.words().len()];
        let na = copy_and_relocate(t.words(), &mut a, &a_ctx).unwrap();
        let nb = copy_and_relocate(t.words(), &mut b, &b_ctx).unwrap();
        assert_eq!(na, nb);

        for (i, &w) in t.words().iter().enumerate() {
            let delta = b[i].wrapping_sub(a[i]);
            match w & RELOC_MASK {
                RELOC_REGISTER if a[i] != w => {
                    assert_eq!(delta, b_ctx.chip_base.wrapping_sub(a_ctx.chip_base));
                }
                RELOC_LABEL if a[i] != w => {
                    assert_eq!(delta, 0x0030_0000);
                }
                RELOC_SOFTC | RELOC_KVAR if a[i] != w => {
                    assert_eq!(delta, 0x0010_0000);
                }
                _ => assert_eq!(a[i], b[i], "word {} moved", i),
            }
        }
    }

    #[test]
    fn bound_geometry() {
        let mut t = ScriptTemplate::new(16, 17);
        t.fill_variable_length_sections();
        let mut mem = DmaMemory::new(0x0010_0000, 0x4000);
        let ncb = NcbLayout {
            base: mem.alloc(NcbLayout::size(65), 16).unwrap(),
            done_slots: 65,
        };
        let s = BoundScript::bind(&t, &mut mem, 0xFEBF_0000, &ncb).unwrap();
        mem.fence();

        assert_eq!(s.slot_of(s.tryloop_slot(3)), Some(3));
        assert_eq!(s.slot_of(s.tryloop_slot(3) + 4), None);
        assert_eq!(s.slot_of(s.addr(Label::TryLoopEnd)), Some(0));
        assert_eq!(
            mem.dev_read_u32(s.slot_operand(5)).unwrap(),
            s.addr(Label::Idle)
        );
        assert_eq!(s.label_at(s.addr(Label::Getcc)), Some(Label::Getcc));

        let start = s.data_start(Direction::In, 5).unwrap();
        assert_eq!(s.entry_index(Direction::In, start), Some(12));
        assert_eq!(
            s.data_start(Direction::In, 0),
            s.data_end(Direction::In)
        );
        assert_eq!(s.entry_index(Direction::Out, start), None);
        assert!(s.data_start(Direction::None, 1).is_none());
        assert_eq!(
            mem.dev_read_u32(start + 12).unwrap(),
            ccb::data_entry(12)
        );
    }
}
