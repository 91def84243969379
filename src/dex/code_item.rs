//! Binary `code_item` container
//!
//! This is the on-disk layout of a method body in a dex file, minus the debug program (which lives
//! elsewhere in the file and so is always written with a zero `debug_info_off`). All multi-byte
//! values are little-endian.
//!
//! [0]: https://source.android.com/docs/core/runtime/dex-format#code-item

use super::{DexCatch, DexCode, DexTryItem, Error, TypeId};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Result};

/// Utility trait for serializing parts of a dex file
pub trait Serialize: Sized {
    /// Serialize construct into a binary output stream
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()>;
}

impl Serialize for u16 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<LittleEndian>(*self)
    }
}

impl Serialize for u32 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(*self)
    }
}

pub fn write_uleb128<W: WriteBytesExt>(writer: &mut W, mut value: u32) -> Result<()> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            return writer.write_u8(byte);
        }
        writer.write_u8(byte | 0x80)?;
    }
}

pub fn write_sleb128<W: WriteBytesExt>(writer: &mut W, mut value: i32) -> Result<()> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            return writer.write_u8(byte);
        }
        writer.write_u8(byte | 0x80)?;
    }
}

pub fn read_uleb128<R: Read>(reader: &mut R) -> std::result::Result<u32, Error> {
    let mut result: u32 = 0;
    for shift in (0..35).step_by(7) {
        let byte = reader.read_u8()?;
        result |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(Error::MalformedLeb128)
}

pub fn read_sleb128<R: Read>(reader: &mut R) -> std::result::Result<i32, Error> {
    let mut result: i32 = 0;
    for shift in (0..35).step_by(7) {
        let byte = reader.read_u8()?;
        result |= ((byte & 0x7f) as i32) << shift;
        if byte & 0x80 == 0 {
            if shift < 25 && byte & 0x40 != 0 {
                result |= -1 << (shift + 7);
            }
            return Ok(result);
        }
    }
    Err(Error::MalformedLeb128)
}

/// Handler list in `encoded_catch_handler` form
fn write_handler<W: WriteBytesExt>(writer: &mut W, catches: &[DexCatch]) -> Result<()> {
    let typed: Vec<&DexCatch> = catches.iter().filter(|c| c.catch_type.is_some()).collect();
    let catch_all = catches.iter().find(|c| c.catch_type.is_none());
    let size = typed.len() as i32;
    write_sleb128(writer, if catch_all.is_some() { -size } else { size })?;
    for catch in typed {
        write_uleb128(writer, catch.catch_type.map_or(0, |t| t.0))?;
        write_uleb128(writer, catch.handler_addr)?;
    }
    if let Some(catch_all) = catch_all {
        write_uleb128(writer, catch_all.handler_addr)?;
    }
    Ok(())
}

fn read_handler<R: Read>(reader: &mut R) -> std::result::Result<Vec<DexCatch>, Error> {
    let size = read_sleb128(reader)?;
    let mut catches = vec![];
    for _ in 0..size.unsigned_abs() {
        let catch_type = TypeId(read_uleb128(reader)?);
        let handler_addr = read_uleb128(reader)?;
        catches.push(DexCatch {
            catch_type: Some(catch_type),
            handler_addr,
        });
    }
    if size <= 0 {
        catches.push(DexCatch {
            catch_type: None,
            handler_addr: read_uleb128(reader)?,
        });
    }
    Ok(catches)
}

impl Serialize for DexCode {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.registers_size.serialize(writer)?;
        self.ins_size.serialize(writer)?;
        self.outs_size.serialize(writer)?;
        (self.tries.len() as u16).serialize(writer)?;
        0u32.serialize(writer)?; // debug_info_off
        (self.insns.len() as u32).serialize(writer)?;
        for unit in &self.insns {
            unit.serialize(writer)?;
        }
        if self.tries.is_empty() {
            return Ok(());
        }
        if self.insns.len() % 2 == 1 {
            0u16.serialize(writer)?;
        }

        // Identical handler lists are shared between try items
        let mut handler_lists: Vec<&[DexCatch]> = vec![];
        let mut handler_indices = vec![];
        for try_item in &self.tries {
            let idx = match handler_lists.iter().position(|l| *l == &try_item.catches[..]) {
                Some(idx) => idx,
                None => {
                    handler_lists.push(&try_item.catches);
                    handler_lists.len() - 1
                }
            };
            handler_indices.push(idx);
        }
        let mut handler_bytes: Vec<u8> = vec![];
        write_uleb128(&mut handler_bytes, handler_lists.len() as u32)?;
        let mut handler_offsets = vec![];
        for list in &handler_lists {
            handler_offsets.push(handler_bytes.len() as u16);
            write_handler(&mut handler_bytes, list)?;
        }

        for (try_item, idx) in self.tries.iter().zip(handler_indices) {
            try_item.start_addr.serialize(writer)?;
            try_item.insn_count.serialize(writer)?;
            handler_offsets[idx].serialize(writer)?;
        }
        writer.write_all(&handler_bytes)
    }
}

impl DexCode {
    /// Parse a `code_item` that spans all of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<DexCode, Error> {
        let mut reader = Cursor::new(bytes);
        let registers_size = reader.read_u16::<LittleEndian>()?;
        let ins_size = reader.read_u16::<LittleEndian>()?;
        let outs_size = reader.read_u16::<LittleEndian>()?;
        let tries_size = reader.read_u16::<LittleEndian>()?;
        let _debug_info_off = reader.read_u32::<LittleEndian>()?;
        let insns_size = reader.read_u32::<LittleEndian>()?;
        let mut insns = vec![0u16; insns_size as usize];
        reader.read_u16_into::<LittleEndian>(&mut insns)?;

        let mut tries = vec![];
        if tries_size > 0 {
            if insns_size % 2 == 1 {
                let _padding = reader.read_u16::<LittleEndian>()?;
            }
            let mut raw_tries = vec![];
            for _ in 0..tries_size {
                let start_addr = reader.read_u32::<LittleEndian>()?;
                let insn_count = reader.read_u16::<LittleEndian>()?;
                let handler_off = reader.read_u16::<LittleEndian>()?;
                raw_tries.push((start_addr, insn_count, handler_off));
            }
            let handlers_start = reader.position() as usize;
            let handler_bytes = &bytes[handlers_start..];
            let mut list_reader = Cursor::new(handler_bytes);
            let list_size = read_uleb128(&mut list_reader)?;
            let mut handlers_end = list_reader.position();
            for (start_addr, insn_count, handler_off) in raw_tries {
                if handler_off as usize >= handler_bytes.len() || handler_off == 0 {
                    return Err(Error::BadHandlerOffset(handler_off));
                }
                let mut handler_reader = Cursor::new(handler_bytes);
                handler_reader.set_position(handler_off as u64);
                let catches = read_handler(&mut handler_reader)?;
                handlers_end = handlers_end.max(handler_reader.position());
                tries.push(DexTryItem {
                    start_addr,
                    insn_count,
                    catches,
                });
            }
            log::trace!("Read {} try items sharing {} handler lists", tries_size, list_size);
            reader.set_position((handlers_start as u64) + handlers_end);
        }

        let consumed = reader.position() as usize;
        if consumed != bytes.len() {
            return Err(Error::TrailingData(bytes.len() - consumed));
        }

        Ok(DexCode {
            registers_size,
            ins_size,
            outs_size,
            insns,
            tries,
            debug_item: None,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![];
        // Writing into a `Vec` cannot fail
        let _ = self.serialize(&mut bytes);
        bytes
    }
}
