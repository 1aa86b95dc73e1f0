//! On-wire form of control notices exchanged between instances.
//!
//! All integers travel in network byte order. The layout is fixed:
//!
//! ```text
//! history address : htype (1) | id (16)
//! update data     : ver (8) | orig_ver (8) | rule (1)
//! update descr    : address (17) | data (17)
//! op descr        : nr (4) | nr x update descr
//! notice          : address (17) | ver (8) | opcode (1) | has_op (1)
//!                   | [op descr] | is_last (1)
//! ```
//!
//! A notice references the history as the *receiver* names it: the sender
//! packs the conjugate type id (a FOL travels as a remote FOL and vice
//! versa), so unpacking resolves directly in the receiver's catalogues.

use static_assertions::const_assert_eq;

use crate::combine_traits;
use crate::errors::{DecResult, DecodeError};
use crate::types::{InstanceId, UpdateRule, Version};

pub const ADDR_LEN: usize = 1 + 16;
pub const UPDATE_DATA_LEN: usize = 8 + 8 + 1;
pub const UPDATE_DESCR_LEN: usize = ADDR_LEN + UPDATE_DATA_LEN;
pub const NOTICE_MIN_LEN: usize = ADDR_LEN + 8 + 1 + 1 + 1;

const_assert_eq!(ADDR_LEN, 17);
const_assert_eq!(UPDATE_DESCR_LEN, 34);
const_assert_eq!(NOTICE_MIN_LEN, 28);

/// Control notice opcodes. The single externally visible RPC opcode is the
/// notification carrying one of these records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeOpcode {
    Persistent = 1,
    Fixed = 2,
    Reset = 3,
    Undo = 4,
    Redo = 5,
}

impl NoticeOpcode {
    fn from_wire(raw: u8) -> DecResult<NoticeOpcode> {
        Ok(match raw {
            1 => NoticeOpcode::Persistent,
            2 => NoticeOpcode::Fixed,
            3 => NoticeOpcode::Reset,
            4 => NoticeOpcode::Undo,
            5 => NoticeOpcode::Redo,
            other => return Err(DecodeError::UnknownOpcode(other)),
        })
    }
}

/// How a history is named on the wire: the receiver-side type id plus the
/// 128-bit history id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryAddr {
    pub htype: u8,
    pub id: InstanceId,
}

/// Version payload of one update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateData {
    pub ver: Version,
    pub orig_ver: Version,
    pub rule: UpdateRule,
}

impl UpdateData {
    /// An update whose version the sender did not know yet. Receivers skip
    /// these when applying descriptors.
    pub fn is_unknown(&self) -> bool {
        self.ver == 0 && self.orig_ver == 0 && self.rule == UpdateRule::Inc
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateDescr {
    pub id: HistoryAddr,
    pub data: UpdateData,
}

/// Full description of one operation: every update with the history it
/// belongs to, as the receiver would name it.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct OpDescr {
    pub updates: Vec<UpdateDescr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub id: HistoryAddr,
    pub ver: Version,
    pub opcode: NoticeOpcode,
    pub op: Option<OpDescr>,
    /// Meaningful for REDO only: marks the end of a replay batch.
    pub is_last: bool,
}

/// Byte reader over a received buffer.
pub struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> DecResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(DecodeError::TooShortHeader);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self) -> DecResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> DecResult<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> DecResult<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn id(&mut self) -> DecResult<InstanceId> {
        Ok(InstanceId::from_slice(self.take(16)?))
    }
}

pub trait Wire: Sized {
    fn pack_into(&self, out: &mut Vec<u8>);
    fn unpack(cur: &mut Cursor) -> DecResult<Self>;

    fn pack(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.pack_into(&mut out);
        out
    }

    /// Unpacks a whole buffer; trailing bytes are an error.
    fn unpack_all(buf: &[u8]) -> DecResult<Self> {
        let mut cur = Cursor::new(buf);
        let out = Self::unpack(&mut cur)?;
        if !cur.is_empty() {
            return Err(DecodeError::IncorrectLength);
        }
        Ok(out)
    }
}

combine_traits!(WireRecord: Wire + Clone + PartialEq + ::std::fmt::Debug);

impl Wire for HistoryAddr {
    fn pack_into(&self, out: &mut Vec<u8>) {
        out.push(self.htype);
        out.extend_from_slice(self.id.as_bytes());
    }

    fn unpack(cur: &mut Cursor) -> DecResult<Self> {
        Ok(HistoryAddr {
            htype: cur.u8()?,
            id: cur.id()?,
        })
    }
}

impl Wire for UpdateData {
    fn pack_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ver.to_be_bytes());
        out.extend_from_slice(&self.orig_ver.to_be_bytes());
        out.push(self.rule.to_wire());
    }

    fn unpack(cur: &mut Cursor) -> DecResult<Self> {
        let ver = cur.u64()?;
        let orig_ver = cur.u64()?;
        let raw_rule = cur.u8()?;
        let rule = UpdateRule::from_wire(raw_rule).ok_or(DecodeError::UnknownRule(raw_rule))?;
        Ok(UpdateData { ver, orig_ver, rule })
    }
}

impl Wire for UpdateDescr {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.id.pack_into(out);
        self.data.pack_into(out);
    }

    fn unpack(cur: &mut Cursor) -> DecResult<Self> {
        Ok(UpdateDescr {
            id: HistoryAddr::unpack(cur)?,
            data: UpdateData::unpack(cur)?,
        })
    }
}

impl Wire for OpDescr {
    fn pack_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.updates.len() as u32).to_be_bytes());
        for ud in &self.updates {
            ud.pack_into(out);
        }
    }

    fn unpack(cur: &mut Cursor) -> DecResult<Self> {
        let nr = cur.u32()? as usize;
        let mut updates = Vec::with_capacity(nr.min(1024));
        for _ in 0..nr {
            updates.push(UpdateDescr::unpack(cur)?);
        }
        Ok(OpDescr { updates })
    }
}

impl Wire for Notice {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.id.pack_into(out);
        out.extend_from_slice(&self.ver.to_be_bytes());
        out.push(self.opcode as u8);
        match &self.op {
            Some(descr) => {
                out.push(1);
                descr.pack_into(out);
            }
            None => out.push(0),
        }
        out.push(self.is_last as u8);
    }

    fn unpack(cur: &mut Cursor) -> DecResult<Self> {
        let id = HistoryAddr::unpack(cur)?;
        let ver = cur.u64()?;
        let opcode = NoticeOpcode::from_wire(cur.u8()?)?;
        let op = match cur.u8()? {
            0 => None,
            _ => Some(OpDescr::unpack(cur)?),
        };
        let is_last = cur.u8()? != 0;
        Ok(Notice {
            id,
            ver,
            opcode,
            op,
            is_last,
        })
    }
}
