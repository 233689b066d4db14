//! Checkpoint entry store.
//!
//! A checkpoint is a flat sequence of fixed-size [`CpEntry`] records. Each
//! subsystem that takes part in migration writes one function entry naming
//! itself (carrying one pointer-sized value) followed by size entries, and
//! reads them back in the same order on restore. The records are plain old
//! data so the byte image can be shipped to the target as-is.

use alloc::vec::Vec;

use bytemuck::{Pod, Zeroable};
use graft_error::define_shim_error;
use linux_raw_sys::errno::EINVAL;

const CP_KIND_FUNC: u32 = 1;
const CP_KIND_SIZE: u32 = 2;

define_shim_error! {
    /// Checkpoint encoding errors.
    pub enum CpError(0x05) {
        /// Ran out of entries mid-record
        Truncated = 0x01, EINVAL => "Checkpoint truncated",
        /// Found a different entry than the reader asked for
        UnexpectedEntry = 0x02, EINVAL => "Unexpected checkpoint entry",
        /// Entry kind or function id is not known
        UnknownEntry = 0x03, EINVAL => "Unknown checkpoint entry",
        /// Byte image is not a whole number of entries
        Misaligned = 0x04, EINVAL => "Checkpoint image size mismatch",
        /// Record decodes but describes an impossible state
        InvalidRecord = 0x05, EINVAL => "Invalid checkpoint record",
    }
}

/// Subsystems with a checkpoint function.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpFunc {
    Brk = 1,
}

impl CpFunc {
    pub const fn from_u32(id: u32) -> Option<Self> {
        match id {
            1 => Some(Self::Brk),
            _ => None,
        }
    }
}

/// One checkpoint record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CpEntry {
    pub kind: u32,
    /// `CpFunc` id for function entries, zero otherwise
    pub func: u32,
    pub value: u64,
}

impl CpEntry {
    fn validate(&self) -> Result<(), CpError> {
        match self.kind {
            CP_KIND_FUNC if CpFunc::from_u32(self.func).is_some() => Ok(()),
            CP_KIND_SIZE if self.func == 0 => Ok(()),
            _ => Err(CpError::UnknownEntry),
        }
    }
}

/// Append-only checkpoint being built, or a received one being read.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CpStore {
    entries: Vec<CpEntry>,
}

impl CpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a subsystem's record with its function entry.
    pub fn add_func_entry(&mut self, func: CpFunc, value: usize) {
        self.entries.push(CpEntry {
            kind: CP_KIND_FUNC,
            func: func as u32,
            value: value as u64,
        });
    }

    pub fn add_size_entry(&mut self, value: usize) {
        self.entries.push(CpEntry {
            kind: CP_KIND_SIZE,
            func: 0,
            value: value as u64,
        });
    }

    pub fn entries(&self) -> &[CpEntry] {
        &self.entries
    }

    pub fn reader(&self) -> CpReader<'_> {
        CpReader {
            entries: &self.entries,
            pos: 0,
        }
    }

    /// Byte image for transfer.
    pub fn to_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.entries).to_vec()
    }

    /// Rebuild a store from a byte image produced by [`CpStore::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CpError> {
        const ENTRY_SIZE: usize = core::mem::size_of::<CpEntry>();

        if bytes.len() % ENTRY_SIZE != 0 {
            return Err(CpError::Misaligned);
        }
        let entries = bytes
            .chunks_exact(ENTRY_SIZE)
            .map(bytemuck::pod_read_unaligned::<CpEntry>)
            .map(|entry| entry.validate().map(|()| entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }
}

/// Cursor over a checkpoint's entries.
#[derive(Debug)]
pub struct CpReader<'a> {
    entries: &'a [CpEntry],
    pos: usize,
}

impl CpReader<'_> {
    fn next_entry(&mut self) -> Result<CpEntry, CpError> {
        let entry = *self.entries.get(self.pos).ok_or(CpError::Truncated)?;
        self.pos += 1;
        Ok(entry)
    }

    /// Function entry of the next record, without consuming it.
    pub fn peek_func(&self) -> Option<CpFunc> {
        self.entries
            .get(self.pos)
            .filter(|e| e.kind == CP_KIND_FUNC)
            .and_then(|e| CpFunc::from_u32(e.func))
    }

    /// Consume the function entry for `func` and return its value.
    pub fn next_func_entry(&mut self, func: CpFunc) -> Result<usize, CpError> {
        let entry = self.next_entry()?;
        if entry.kind != CP_KIND_FUNC || entry.func != func as u32 {
            return Err(CpError::UnexpectedEntry);
        }
        Ok(entry.value as usize)
    }

    pub fn next_size_entry(&mut self) -> Result<usize, CpError> {
        let entry = self.next_entry()?;
        if entry.kind != CP_KIND_SIZE {
            return Err(CpError::UnexpectedEntry);
        }
        Ok(entry.value as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.entries.len()
    }
}
