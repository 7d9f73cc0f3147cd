//! A small bounds-checked byte cursor. Every BSS/remap walk in
//! [`crate::parser`] goes through this so that an out-of-range read becomes
//! `BinError::InvalidBin` rather than a panic (`SPEC_FULL.md` §4.2: "Out of
//! range pointer while walking -> fail INVALID_BIN").

use crate::binary::BinError;

pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Cursor<'a> {
        Cursor { data, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BinError> {
        let end = self.pos.checked_add(n).ok_or_else(oob)?;
        let slice = self.data.get(self.pos..end).ok_or_else(oob)?;
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, BinError> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32, BinError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn i32(&mut self) -> Result<i32, BinError> {
        Ok(self.u32()? as i32)
    }

    pub fn f32(&mut self) -> Result<f32, BinError> {
        Ok(f32::from_bits(self.u32()?))
    }

    pub fn u64(&mut self) -> Result<u64, BinError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn skip(&mut self, n: usize) -> Result<(), BinError> {
        self.take(n)?;
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

fn oob() -> BinError {
    BinError::InvalidBin("out-of-range pointer while walking section".into())
}
