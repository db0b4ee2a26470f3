//! buffer primitives for the wire codec
//!
//! `PacketCursor` is a non-owning read view over a complete message; it can
//! jump to any absolute offset, which is what compression pointers need.
//! `PacketWriter` is the growable counterpart used when encoding.

use std::collections::HashMap;

use derive_more::Display;

use crate::dns::name::{LabelSequence, MAX_NAME_LEN};

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[display(fmt = "position {} is outside a buffer of {} bytes", pos, len)]
    OutOfRange { pos: usize, len: usize },
    #[display(fmt = "invalid label length byte {:#04x}", _0)]
    InvalidLabelLength(u8),
    #[display(fmt = "compression pointer at {} targets {}, which is not behind it", at, target)]
    ForwardPointer { at: usize, target: usize },
    #[display(fmt = "too many compression pointers in one name")]
    TooManyPointers,
    #[display(fmt = "domain name exceeds 255 bytes")]
    NameTooLong,
    #[display(fmt = "label of {} bytes exceeds 63 bytes", _0)]
    LabelTooLong(usize),
    #[display(fmt = "empty label inside a domain name")]
    EmptyLabel,
    #[display(fmt = "section holds fewer records than its count")]
    RecordCountMismatch,
    #[display(fmt = "message of {} bytes exceeds the maximum size", _0)]
    MessageTooLarge(usize),
}

impl std::error::Error for CodecError {}

pub type Result<T> = std::result::Result<T, CodecError>;

#[derive(Clone, Copy, Debug)]
pub struct PacketCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketCursor<'a> {
    pub fn new(buf: &'a [u8]) -> PacketCursor<'a> {
        PacketCursor { buf, pos: 0 }
    }

    /// Creates a cursor already positioned at `pos`.
    pub fn at(buf: &'a [u8], pos: usize) -> Result<PacketCursor<'a>> {
        let mut cursor = PacketCursor::new(buf);
        cursor.seek(pos)?;
        Ok(cursor)
    }

    /// The full underlying buffer, independent of the current position.
    pub fn buffer(&self) -> &'a [u8] {
        self.buf
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Moves to an absolute offset. The end of the buffer is a valid
    /// position; anything past it is not.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(CodecError::OutOfRange {
                pos,
                len: self.buf.len(),
            });
        }
        self.pos = pos;

        Ok(())
    }

    pub fn seek_relative(&mut self, delta: isize) -> Result<()> {
        let target = if delta < 0 {
            self.pos.checked_sub(delta.unsigned_abs())
        } else {
            self.pos.checked_add(delta as usize)
        };

        match target {
            Some(pos) => self.seek(pos),
            None => Err(CodecError::OutOfRange {
                pos: self.pos,
                len: self.buf.len(),
            }),
        }
    }

    /// Peeks at the byte under the cursor.
    pub fn current(&self) -> Result<u8> {
        self.get(self.pos)
    }

    pub fn get(&self, pos: usize) -> Result<u8> {
        match self.buf.get(pos) {
            Some(b) => Ok(*b),
            None => Err(CodecError::OutOfRange {
                pos,
                len: self.buf.len(),
            }),
        }
    }

    pub fn read_next(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = match self.pos.checked_add(count) {
            Some(end) if end <= self.buf.len() => end,
            _ => {
                return Err(CodecError::OutOfRange {
                    pos: self.pos.saturating_add(count),
                    len: self.buf.len(),
                })
            }
        };

        let res = &self.buf[self.pos..end];
        self.pos = end;

        Ok(res)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let res = self.current()?;
        self.pos += 1;

        Ok(res)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_next(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_next(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Growable encoder. Names written through `write_name` are compressed
/// against suffixes written earlier in the same message.
#[derive(Debug)]
pub struct PacketWriter {
    buffer: Vec<u8>,
    names: HashMap<Vec<u8>, u16>,
    compress: bool,
}

impl Default for PacketWriter {
    fn default() -> Self {
        PacketWriter::new()
    }
}

impl PacketWriter {
    pub fn new() -> PacketWriter {
        PacketWriter {
            buffer: Vec::with_capacity(512),
            names: HashMap::new(),
            compress: true,
        }
    }

    pub fn without_compression() -> PacketWriter {
        PacketWriter {
            compress: false,
            ..PacketWriter::new()
        }
    }

    pub fn pos(&self) -> usize {
        self.buffer.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    /// Drops everything from `len` on, forgetting any compression targets
    /// that lived in the discarded tail.
    pub fn truncate(&mut self, len: usize) {
        self.buffer.truncate(len);
        self.names.retain(|_, offset| (*offset as usize) < len);
    }

    pub fn write_u8(&mut self, val: u8) {
        self.buffer.push(val);
    }

    pub fn write_u16(&mut self, val: u16) {
        self.buffer.extend_from_slice(&val.to_be_bytes());
    }

    pub fn write_u32(&mut self, val: u32) {
        self.buffer.extend_from_slice(&val.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Overwrites bytes already written, starting at `pos`.
    pub fn set_bytes(&mut self, pos: usize, bytes: &[u8]) -> Result<()> {
        let end = pos + bytes.len();
        if end > self.buffer.len() {
            return Err(CodecError::OutOfRange {
                pos: end,
                len: self.buffer.len(),
            });
        }
        self.buffer[pos..end].copy_from_slice(bytes);

        Ok(())
    }

    pub fn write_name(&mut self, name: &LabelSequence<'_>) -> Result<()> {
        let labels = name.labels().collect::<Result<Vec<_>>>()?;

        let wire_len = labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1;
        if wire_len > MAX_NAME_LEN {
            return Err(CodecError::NameTooLong);
        }

        for i in 0..labels.len() {
            if self.compress {
                let key = suffix_key(labels[i..].iter().map(|l| l.as_bytes()));
                if let Some(&offset) = self.names.get(&key) {
                    self.write_u16(0xC000 | offset);
                    return Ok(());
                }

                // Pointers only carry 14 bits of offset
                if self.buffer.len() < 0x4000 {
                    self.names.insert(key, self.buffer.len() as u16);
                }
            }

            let label = labels[i].as_bytes();
            self.write_u8(label.len() as u8);
            self.write_bytes(label);
        }

        self.write_u8(0);

        Ok(())
    }
}

fn suffix_key<'b, I: Iterator<Item = &'b [u8]>>(labels: I) -> Vec<u8> {
    let mut key = Vec::new();
    for label in labels {
        key.push(label.len() as u8);
        key.extend(label.iter().map(|b| b.to_ascii_lowercase()));
    }
    key
}
