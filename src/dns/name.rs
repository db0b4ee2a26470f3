//! domain names as lazy label sequences
//!
//! A name is either text held in memory (`www.example.com`) or a position
//! inside a received message. Both forms enumerate the same way, one label
//! at a time, and compare equal whenever their labels do.

use std::borrow::Cow;
use std::fmt;

use crate::dns::buffer::{CodecError, PacketCursor, Result};

pub const MAX_LABEL_LEN: usize = 63;
pub const MAX_NAME_LEN: usize = 255;

/// Upper bound on compression pointers followed while decoding one name.
/// A name of at most 255 bytes has at most 127 labels, and no encoder needs
/// more than one pointer per label to reach them.
pub const MAX_POINTER_HOPS: usize = 127;

const POINTER_FLAG: u8 = 0xC0;

#[derive(Clone, Copy, Debug)]
pub struct Label<'a> {
    bytes: &'a [u8],
    compressed: bool,
}

impl<'a> Label<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether a compression pointer was followed to reach this label.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }
}

impl<'a> PartialEq for Label<'a> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.eq_ignore_ascii_case(other.bytes)
    }
}

impl<'a> fmt::Display for Label<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.bytes))
    }
}

#[derive(Clone, Debug)]
pub enum LabelSequence<'a> {
    /// Dot separated text; a single trailing dot is accepted.
    Text(Cow<'a, str>),
    /// A name encoded at `offset` inside `message`. `message` must start at
    /// the first byte of the DNS message, since pointers are absolute.
    Wire { message: &'a [u8], offset: usize },
}

impl<'a> LabelSequence<'a> {
    pub fn root() -> LabelSequence<'static> {
        LabelSequence::Text(Cow::Borrowed(""))
    }

    pub fn from_wire(message: &'a [u8], offset: usize) -> LabelSequence<'a> {
        LabelSequence::Wire { message, offset }
    }

    /// Decodes the name under the cursor, validating every label, and leaves
    /// the cursor just past the encoded name (after the first pointer, if
    /// the name is compressed).
    pub fn parse(cursor: &mut PacketCursor<'a>) -> Result<LabelSequence<'a>> {
        let message = cursor.buffer();
        let offset = cursor.pos();

        let mut labels = WireLabels::new(message, offset);
        while let Some(label) = labels.next_label() {
            label?;
        }

        match labels.end {
            Some(end) => cursor.seek(end)?,
            None => return Err(CodecError::OutOfRange {
                pos: offset,
                len: message.len(),
            }),
        }

        Ok(LabelSequence::Wire { message, offset })
    }

    pub fn labels(&self) -> Labels<'_> {
        match self {
            LabelSequence::Text(text) => Labels::Text(TextLabels::new(text)),
            LabelSequence::Wire { message, offset } => {
                Labels::Wire(WireLabels::new(message, *offset))
            }
        }
    }

    pub fn label_count(&self) -> Result<usize> {
        let mut count = 0;
        for label in self.labels() {
            label?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_root(&self) -> bool {
        self.labels().next().is_none()
    }

    /// Uncompressed wire length, root label included.
    pub fn wire_len(&self) -> Result<usize> {
        let mut len = 1;
        for label in self.labels() {
            len += label?.len() + 1;
        }
        Ok(len)
    }

    pub fn to_text(&self) -> Result<String> {
        let mut text = String::new();
        for label in self.labels() {
            if !text.is_empty() {
                text.push('.');
            }
            text.push_str(&String::from_utf8_lossy(label?.as_bytes()));
        }
        Ok(text)
    }

    /// Detaches the name from any message buffer.
    pub fn into_owned(self) -> Result<LabelSequence<'static>> {
        match self {
            LabelSequence::Text(text) => Ok(LabelSequence::Text(Cow::Owned(text.into_owned()))),
            wire @ LabelSequence::Wire { .. } => Ok(LabelSequence::Text(Cow::Owned(wire.to_text()?))),
        }
    }
}

impl<'a> From<&'a str> for LabelSequence<'a> {
    fn from(text: &'a str) -> Self {
        LabelSequence::Text(Cow::Borrowed(text))
    }
}

impl From<String> for LabelSequence<'static> {
    fn from(text: String) -> Self {
        LabelSequence::Text(Cow::Owned(text))
    }
}

impl<'a, 'b> PartialEq<LabelSequence<'b>> for LabelSequence<'a> {
    fn eq(&self, other: &LabelSequence<'b>) -> bool {
        let mut ours = self.labels();
        let mut theirs = other.labels();
        loop {
            match (ours.next(), theirs.next()) {
                (None, None) => return true,
                (Some(Ok(a)), Some(Ok(b))) if a == b => continue,
                _ => return false,
            }
        }
    }
}

impl<'a> fmt::Display for LabelSequence<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut delim = "";
        for label in self.labels() {
            match label {
                Ok(label) => write!(f, "{}{}", delim, label)?,
                Err(_) => return write!(f, "{}<invalid>", delim),
            }
            delim = ".";
        }

        if delim.is_empty() {
            write!(f, ".")?;
        }

        Ok(())
    }
}

/// Restartable iterator over the labels of a `LabelSequence`.
///
/// Errors end the iteration: after yielding an `Err` the iterator only
/// returns `None` until it is reset.
pub enum Labels<'a> {
    Text(TextLabels<'a>),
    Wire(WireLabels<'a>),
}

impl<'a> Labels<'a> {
    pub fn reset(&mut self) {
        match self {
            Labels::Text(labels) => labels.reset(),
            Labels::Wire(labels) => labels.reset(),
        }
    }
}

impl<'a> Iterator for Labels<'a> {
    type Item = Result<Label<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Labels::Text(labels) => labels.next_label(),
            Labels::Wire(labels) => labels.next_label(),
        }
    }
}

pub struct TextLabels<'a> {
    text: &'a str,
    rest: Option<&'a str>,
}

impl<'a> TextLabels<'a> {
    fn new(text: &'a str) -> TextLabels<'a> {
        let text = if text == "." { "" } else { text };
        TextLabels {
            text,
            rest: Some(text),
        }
    }

    fn reset(&mut self) {
        self.rest = Some(self.text);
    }

    fn next_label(&mut self) -> Option<Result<Label<'a>>> {
        let rest = self.rest.take()?;
        if rest.is_empty() {
            return None;
        }

        let label = match rest.find('.') {
            Some(idx) => {
                self.rest = Some(&rest[idx + 1..]);
                &rest[..idx]
            }
            None => rest,
        };

        if label.is_empty() {
            self.rest = None;
            return Some(Err(CodecError::EmptyLabel));
        }
        if label.len() > MAX_LABEL_LEN {
            self.rest = None;
            return Some(Err(CodecError::LabelTooLong(label.len())));
        }

        Some(Ok(Label {
            bytes: label.as_bytes(),
            compressed: false,
        }))
    }
}

pub struct WireLabels<'a> {
    message: &'a [u8],
    start: usize,
    pos: usize,
    hops: usize,
    name_len: usize,
    jumped: bool,
    done: bool,
    /// Position just past the name in the original byte stream, known once
    /// the first pointer or the root label has been seen.
    end: Option<usize>,
}

impl<'a> WireLabels<'a> {
    fn new(message: &'a [u8], start: usize) -> WireLabels<'a> {
        WireLabels {
            message,
            start,
            pos: start,
            hops: 0,
            name_len: 0,
            jumped: false,
            done: false,
            end: None,
        }
    }

    fn reset(&mut self) {
        *self = WireLabels::new(self.message, self.start);
    }

    fn next_label(&mut self) -> Option<Result<Label<'a>>> {
        if self.done {
            return None;
        }

        match self.decode_next() {
            Ok(Some(label)) => Some(Ok(label)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }

    fn decode_next(&mut self) -> Result<Option<Label<'a>>> {
        let mut cursor = PacketCursor::at(self.message, self.pos)?;

        let mut len = cursor.current()?;
        while len & POINTER_FLAG == POINTER_FLAG {
            let at = cursor.pos();
            let lo = cursor.get(at + 1)? as usize;
            let target = (((len & !POINTER_FLAG) as usize) << 8) | lo;

            // Anything else could loop forever
            if target >= at {
                return Err(CodecError::ForwardPointer { at, target });
            }

            self.hops += 1;
            if self.hops > MAX_POINTER_HOPS {
                return Err(CodecError::TooManyPointers);
            }

            if self.end.is_none() {
                self.end = Some(at + 2);
            }
            self.jumped = true;

            cursor.seek(target)?;
            len = cursor.current()?;
        }

        if len as usize > MAX_LABEL_LEN {
            return Err(CodecError::InvalidLabelLength(len));
        }

        cursor.seek_relative(1)?;

        if len == 0 {
            if self.end.is_none() {
                self.end = Some(cursor.pos());
            }
            return Ok(None);
        }

        let bytes = cursor.read_next(len as usize)?;
        self.name_len += bytes.len() + 1;
        if self.name_len + 1 > MAX_NAME_LEN {
            return Err(CodecError::NameTooLong);
        }
        self.pos = cursor.pos();

        Ok(Some(Label {
            bytes,
            compressed: self.jumped,
        }))
    }
}
