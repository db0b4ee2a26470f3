//! resource records and record sections
//!
//! A section is either an array built in memory or a region of a received
//! message holding a known number of records. Records in the second form are
//! decoded on demand, from the start of the region, every time the section
//! is walked.

use std::borrow::Cow;
use std::slice;

use crate::dns::buffer::{CodecError, PacketCursor, PacketWriter, Result};
use crate::dns::name::LabelSequence;
use crate::dns::protocol::{QueryType, CLASS_IN};

#[derive(Clone, Debug)]
pub struct ResourceRecord<'a> {
    pub name: LabelSequence<'a>,
    pub rtype: QueryType,
    pub class: u16,
    pub ttl: u32,
    /// Type specific data, copied verbatim on encode.
    pub data: Cow<'a, [u8]>,
    /// Message and absolute offset the data was decoded from, if any.
    origin: Option<(&'a [u8], usize)>,
}

impl<'a> ResourceRecord<'a> {
    pub fn new<N, D>(name: N, rtype: QueryType, ttl: u32, data: D) -> ResourceRecord<'a>
    where
        N: Into<LabelSequence<'a>>,
        D: Into<Cow<'a, [u8]>>,
    {
        ResourceRecord {
            name: name.into(),
            rtype,
            class: CLASS_IN,
            ttl,
            data: data.into(),
            origin: None,
        }
    }

    pub fn with_class(mut self, class: u16) -> ResourceRecord<'a> {
        self.class = class;
        self
    }

    pub fn read(cursor: &mut PacketCursor<'a>) -> Result<ResourceRecord<'a>> {
        let name = LabelSequence::parse(cursor)?;
        let rtype = QueryType::from_num(cursor.read_u16()?);
        let class = cursor.read_u16()?;
        let ttl = cursor.read_u32()?;
        let data_len = cursor.read_u16()? as usize;

        let data_pos = cursor.pos();
        let data = cursor.read_next(data_len)?;

        Ok(ResourceRecord {
            name,
            rtype,
            class,
            ttl,
            data: Cow::Borrowed(data),
            origin: Some((cursor.buffer(), data_pos)),
        })
    }

    pub fn write(&self, writer: &mut PacketWriter) -> Result<()> {
        if self.data.len() > u16::MAX as usize {
            return Err(CodecError::MessageTooLarge(self.data.len()));
        }

        writer.write_name(&self.name)?;
        writer.write_u16(self.rtype.to_num());
        writer.write_u16(self.class);
        writer.write_u32(self.ttl);
        writer.write_u16(self.data.len() as u16);
        writer.write_bytes(&self.data);

        Ok(())
    }

    /// Decodes a domain name at the start of the data, as carried by NS,
    /// CNAME and PTR records. Decoded records resolve pointers against the
    /// message they came from.
    pub fn data_name(&self) -> Result<LabelSequence<'_>> {
        let mut cursor = match self.origin {
            Some((message, pos)) => PacketCursor::at(message, pos)?,
            None => PacketCursor::new(&self.data),
        };

        LabelSequence::parse(&mut cursor)
    }

    /// Detaches the record from its message. The data names of NS, CNAME
    /// and PTR records are written out in full, since a pointer in them
    /// would refer into the message being left behind.
    pub fn into_owned(self) -> Result<ResourceRecord<'static>> {
        let data = match (self.origin, self.rtype) {
            (Some(_), QueryType::NS | QueryType::CNAME | QueryType::PTR) => {
                let mut writer = PacketWriter::without_compression();
                writer.write_name(&self.data_name()?)?;
                writer.into_inner()
            }
            _ => self.data.into_owned(),
        };

        Ok(ResourceRecord {
            name: self.name.into_owned()?,
            rtype: self.rtype,
            class: self.class,
            ttl: self.ttl,
            data: Cow::Owned(data),
            origin: None,
        })
    }
}

impl<'a, 'b> PartialEq<ResourceRecord<'b>> for ResourceRecord<'a> {
    fn eq(&self, other: &ResourceRecord<'b>) -> bool {
        self.rtype == other.rtype
            && self.class == other.class
            && self.ttl == other.ttl
            && self.data == other.data
            && self.name == other.name
    }
}

#[derive(Clone, Debug)]
pub enum ResourceRecordCollection<'a> {
    Array(Vec<ResourceRecord<'a>>),
    /// `count` records encoded back to back from `offset` in `message`.
    Wire {
        message: &'a [u8],
        offset: usize,
        count: u16,
    },
}

impl<'a> Default for ResourceRecordCollection<'a> {
    fn default() -> Self {
        ResourceRecordCollection::Array(Vec::new())
    }
}

impl<'a> ResourceRecordCollection<'a> {
    /// Validates `count` records under the cursor and returns them as a
    /// lazy section. The cursor ends up behind the last record; on failure
    /// it is left where it was.
    pub fn parse(
        cursor: &mut PacketCursor<'a>,
        count: u16,
    ) -> Result<ResourceRecordCollection<'a>> {
        let offset = cursor.pos();

        let mut probe = *cursor;
        for _ in 0..count {
            match ResourceRecord::read(&mut probe) {
                Ok(_) => {}
                Err(CodecError::OutOfRange { .. }) if probe.remaining() == 0 => {
                    return Err(CodecError::RecordCountMismatch)
                }
                Err(e) => return Err(e),
            }
        }
        *cursor = probe;

        Ok(ResourceRecordCollection::Wire {
            message: cursor.buffer(),
            offset,
            count,
        })
    }

    pub fn len(&self) -> usize {
        match self {
            ResourceRecordCollection::Array(records) => records.len(),
            ResourceRecordCollection::Wire { count, .. } => *count as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Records<'_, 'a> {
        match self {
            ResourceRecordCollection::Array(records) => Records::Array {
                records,
                iter: records.iter(),
            },
            ResourceRecordCollection::Wire {
                message,
                offset,
                count,
            } => Records::Wire {
                message: *message,
                offset: *offset,
                count: *count,
                cursor: None,
                produced: 0,
            },
        }
    }

    pub fn to_vec(&self) -> Result<Vec<ResourceRecord<'a>>> {
        self.iter().collect()
    }

    pub fn into_owned(self) -> Result<ResourceRecordCollection<'static>> {
        let records = match self {
            ResourceRecordCollection::Array(records) => records,
            wire => wire.to_vec()?,
        };

        let owned = records
            .into_iter()
            .map(|r| r.into_owned())
            .collect::<Result<Vec<_>>>()?;

        Ok(ResourceRecordCollection::Array(owned))
    }
}

impl<'a> From<Vec<ResourceRecord<'a>>> for ResourceRecordCollection<'a> {
    fn from(records: Vec<ResourceRecord<'a>>) -> Self {
        ResourceRecordCollection::Array(records)
    }
}

impl<'a, 'b> PartialEq<ResourceRecordCollection<'b>> for ResourceRecordCollection<'a> {
    fn eq(&self, other: &ResourceRecordCollection<'b>) -> bool {
        if self.len() != other.len() {
            return false;
        }

        self.iter().zip(other.iter()).all(|pair| match pair {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        })
    }
}

/// Restartable iterator over a record section.
///
/// The wire form starts a fresh cursor at the section start on first use
/// and after every `reset`, so repeated walks never share state.
pub enum Records<'c, 'a> {
    Array {
        records: &'c [ResourceRecord<'a>],
        iter: slice::Iter<'c, ResourceRecord<'a>>,
    },
    Wire {
        message: &'a [u8],
        offset: usize,
        count: u16,
        cursor: Option<PacketCursor<'a>>,
        produced: u16,
    },
}

impl<'c, 'a> Records<'c, 'a> {
    pub fn reset(&mut self) {
        match self {
            Records::Array { records, iter } => *iter = records.iter(),
            Records::Wire {
                cursor, produced, ..
            } => {
                *cursor = None;
                *produced = 0;
            }
        }
    }
}

impl<'c, 'a> Iterator for Records<'c, 'a> {
    type Item = Result<ResourceRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Records::Array { iter, .. } => iter.next().cloned().map(Ok),
            Records::Wire {
                message,
                offset,
                count,
                cursor,
                produced,
            } => {
                if *produced >= *count {
                    return None;
                }

                if cursor.is_none() {
                    match PacketCursor::at(*message, *offset) {
                        Ok(cur) => *cursor = Some(cur),
                        Err(e) => {
                            *produced = *count;
                            return Some(Err(e));
                        }
                    }
                }
                let cur = cursor.as_mut()?;

                match ResourceRecord::read(cur) {
                    Ok(record) => {
                        *produced += 1;
                        Some(Ok(record))
                    }
                    Err(e) => {
                        *produced = *count;
                        Some(Err(e))
                    }
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = match self {
            Records::Array { iter, .. } => iter.len(),
            Records::Wire {
                count, produced, ..
            } => (*count - *produced) as usize,
        };
        (left, Some(left))
    }
}
