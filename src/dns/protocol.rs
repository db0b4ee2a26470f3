//! implements the DNS message envelope: header, questions and the three
//! record sections

use std::fmt;

use crate::dns::buffer::{CodecError, PacketCursor, PacketWriter, Result};
use crate::dns::name::LabelSequence;
use crate::dns::record::ResourceRecordCollection;

pub const CLASS_IN: u16 = 1;
pub const HEADER_LEN: usize = 12;

/// Largest message a two byte length prefix can carry.
pub const MAX_MESSAGE_SIZE: usize = 65535;

#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, PartialOrd, Ord)]
#[allow(clippy::upper_case_acronyms)]
pub enum QueryType {
    UNKNOWN(u16),
    A,     // 1
    NS,    // 2
    CNAME, // 5
    SOA,   // 6
    PTR,   // 12
    MX,    // 15
    TXT,   // 16
    AAAA,  // 28
    SRV,   // 33
    OPT,   // 41
    ANY,   // 255
}

impl QueryType {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::UNKNOWN(x) => x,
            QueryType::A => 1,
            QueryType::NS => 2,
            QueryType::CNAME => 5,
            QueryType::SOA => 6,
            QueryType::PTR => 12,
            QueryType::MX => 15,
            QueryType::TXT => 16,
            QueryType::AAAA => 28,
            QueryType::SRV => 33,
            QueryType::OPT => 41,
            QueryType::ANY => 255,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            2 => QueryType::NS,
            5 => QueryType::CNAME,
            6 => QueryType::SOA,
            12 => QueryType::PTR,
            15 => QueryType::MX,
            16 => QueryType::TXT,
            28 => QueryType::AAAA,
            33 => QueryType::SRV,
            41 => QueryType::OPT,
            255 => QueryType::ANY,
            _ => QueryType::UNKNOWN(num),
        }
    }

    pub fn from_name(name: &str) -> Option<QueryType> {
        let qtype = match name.to_ascii_uppercase().as_str() {
            "A" => QueryType::A,
            "NS" => QueryType::NS,
            "CNAME" => QueryType::CNAME,
            "SOA" => QueryType::SOA,
            "PTR" => QueryType::PTR,
            "MX" => QueryType::MX,
            "TXT" => QueryType::TXT,
            "AAAA" => QueryType::AAAA,
            "SRV" => QueryType::SRV,
            "ANY" => QueryType::ANY,
            other => QueryType::UNKNOWN(other.strip_prefix("TYPE")?.parse().ok()?),
        };

        Some(qtype)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum ResultCode {
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
}

impl Default for ResultCode {
    fn default() -> Self {
        ResultCode::NOERROR
    }
}

impl ResultCode {
    /// Codes outside the classic set are reported as SERVFAIL.
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            0 => ResultCode::NOERROR,
            1 => ResultCode::FORMERR,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            _ => ResultCode::SERVFAIL,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: u8,                 // 4 bits
    pub response: bool,             // 1 bit

    pub rescode: ResultCode,       // 4 bits
    pub checking_disabled: bool,   // 1 bit
    pub authed_data: bool,         // 1 bit
    pub z: bool,                   // 1 bit
    pub recursion_available: bool, // 1 bit

    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl DnsHeader {
    pub fn new() -> DnsHeader {
        DnsHeader::default()
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0; HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.id.to_be_bytes());

        bytes[2] = (self.recursion_desired as u8)
            | ((self.truncated_message as u8) << 1)
            | ((self.authoritative_answer as u8) << 2)
            | ((self.opcode & 0x0F) << 3)
            | ((self.response as u8) << 7);

        bytes[3] = (self.rescode as u8)
            | ((self.checking_disabled as u8) << 4)
            | ((self.authed_data as u8) << 5)
            | ((self.z as u8) << 6)
            | ((self.recursion_available as u8) << 7);

        bytes[4..6].copy_from_slice(&self.questions.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.answers.to_be_bytes());
        bytes[8..10].copy_from_slice(&self.authoritative_entries.to_be_bytes());
        bytes[10..12].copy_from_slice(&self.resource_entries.to_be_bytes());

        bytes
    }

    pub fn write(&self, writer: &mut PacketWriter) {
        writer.write_bytes(&self.to_bytes());
    }

    pub fn read(cursor: &mut PacketCursor<'_>) -> Result<DnsHeader> {
        let id = cursor.read_u16()?;

        let flags = cursor.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;

        Ok(DnsHeader {
            id,

            recursion_desired: (a & (1 << 0)) > 0,
            truncated_message: (a & (1 << 1)) > 0,
            authoritative_answer: (a & (1 << 2)) > 0,
            opcode: (a >> 3) & 0x0F,
            response: (a & (1 << 7)) > 0,

            rescode: ResultCode::from_num(b & 0x0F),
            checking_disabled: (b & (1 << 4)) > 0,
            authed_data: (b & (1 << 5)) > 0,
            z: (b & (1 << 6)) > 0,
            recursion_available: (b & (1 << 7)) > 0,

            questions: cursor.read_u16()?,
            answers: cursor.read_u16()?,
            authoritative_entries: cursor.read_u16()?,
            resource_entries: cursor.read_u16()?,
        })
    }
}

impl fmt::Display for DnsHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id {} {} opcode {} rcode {:?}",
            self.id,
            if self.response { "response" } else { "query" },
            self.opcode,
            self.rescode
        )?;

        for (flag, set) in [
            ("rd", self.recursion_desired),
            ("tc", self.truncated_message),
            ("aa", self.authoritative_answer),
            ("ra", self.recursion_available),
        ] {
            if set {
                write!(f, " {}", flag)?;
            }
        }

        write!(
            f,
            " qd {} an {} ns {} ar {}",
            self.questions, self.answers, self.authoritative_entries, self.resource_entries
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DnsQuestion<'a> {
    pub name: LabelSequence<'a>,
    pub qtype: QueryType,
    pub class: u16,
}

impl<'a> DnsQuestion<'a> {
    pub fn new<N: Into<LabelSequence<'a>>>(name: N, qtype: QueryType) -> DnsQuestion<'a> {
        DnsQuestion {
            name: name.into(),
            qtype,
            class: CLASS_IN,
        }
    }

    pub fn write(&self, writer: &mut PacketWriter) -> Result<()> {
        writer.write_name(&self.name)?;
        writer.write_u16(self.qtype.to_num());
        writer.write_u16(self.class);

        Ok(())
    }

    pub fn read(cursor: &mut PacketCursor<'a>) -> Result<DnsQuestion<'a>> {
        let name = LabelSequence::parse(cursor)?;
        let qtype = QueryType::from_num(cursor.read_u16()?);
        let class = cursor.read_u16()?;

        Ok(DnsQuestion { name, qtype, class })
    }

    pub fn into_owned(self) -> Result<DnsQuestion<'static>> {
        Ok(DnsQuestion {
            name: self.name.into_owned()?,
            qtype: self.qtype,
            class: self.class,
        })
    }
}

impl<'a> fmt::Display for DnsQuestion<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.name, self.qtype)
    }
}

/// A complete message. The section counts in the header always match the
/// sections themselves; every builder below keeps them in step.
#[derive(Clone, Debug, PartialEq)]
pub struct DnsMessage<'a> {
    header: DnsHeader,
    questions: Vec<DnsQuestion<'a>>,
    answers: ResourceRecordCollection<'a>,
    authorities: ResourceRecordCollection<'a>,
    resources: ResourceRecordCollection<'a>,
}

fn count(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

impl<'a> DnsMessage<'a> {
    pub fn new(
        header: DnsHeader,
        questions: Vec<DnsQuestion<'a>>,
        answers: ResourceRecordCollection<'a>,
        authorities: ResourceRecordCollection<'a>,
        resources: ResourceRecordCollection<'a>,
    ) -> DnsMessage<'a> {
        let mut message = DnsMessage {
            header,
            questions,
            answers,
            authorities,
            resources,
        };
        message.sync_counts();
        message
    }

    /// A recursive query with a single question.
    pub fn query(id: u16, question: DnsQuestion<'a>) -> DnsMessage<'a> {
        let mut header = DnsHeader::new();
        header.id = id;
        header.recursion_desired = true;

        DnsMessage::new(
            header,
            vec![question],
            ResourceRecordCollection::default(),
            ResourceRecordCollection::default(),
            ResourceRecordCollection::default(),
        )
    }

    /// An empty response echoing the id, opcode, recursion flag and
    /// questions of `request`.
    pub fn response_to(request: &DnsMessage<'a>) -> DnsMessage<'a> {
        let mut header = DnsHeader::new();
        header.id = request.header.id;
        header.opcode = request.header.opcode;
        header.recursion_desired = request.header.recursion_desired;
        header.response = true;

        DnsMessage::new(
            header,
            request.questions.clone(),
            ResourceRecordCollection::default(),
            ResourceRecordCollection::default(),
            ResourceRecordCollection::default(),
        )
    }

    pub fn from_bytes(message: &'a [u8]) -> Result<DnsMessage<'a>> {
        let mut cursor = PacketCursor::new(message);
        let header = DnsHeader::read(&mut cursor)?;

        let mut questions = Vec::new();
        for _ in 0..header.questions {
            questions.push(DnsQuestion::read(&mut cursor)?);
        }

        let answers = ResourceRecordCollection::parse(&mut cursor, header.answers)?;
        let authorities =
            ResourceRecordCollection::parse(&mut cursor, header.authoritative_entries)?;
        let resources = ResourceRecordCollection::parse(&mut cursor, header.resource_entries)?;

        Ok(DnsMessage {
            header,
            questions,
            answers,
            authorities,
            resources,
        })
    }

    fn sync_counts(&mut self) {
        self.header.questions = count(self.questions.len());
        self.header.answers = count(self.answers.len());
        self.header.authoritative_entries = count(self.authorities.len());
        self.header.resource_entries = count(self.resources.len());
    }

    pub fn header(&self) -> &DnsHeader {
        &self.header
    }

    pub fn id(&self) -> u16 {
        self.header.id
    }

    pub fn questions(&self) -> &[DnsQuestion<'a>] {
        &self.questions
    }

    pub fn answers(&self) -> &ResourceRecordCollection<'a> {
        &self.answers
    }

    pub fn authorities(&self) -> &ResourceRecordCollection<'a> {
        &self.authorities
    }

    pub fn resources(&self) -> &ResourceRecordCollection<'a> {
        &self.resources
    }

    /// Replaces id and flags; the counts of `header` are ignored.
    pub fn with_header(mut self, header: DnsHeader) -> DnsMessage<'a> {
        self.header = header;
        self.sync_counts();
        self
    }

    pub fn with_id(mut self, id: u16) -> DnsMessage<'a> {
        self.header.id = id;
        self
    }

    pub fn with_rescode(mut self, rescode: ResultCode) -> DnsMessage<'a> {
        self.header.rescode = rescode;
        self
    }

    pub fn with_questions(mut self, questions: Vec<DnsQuestion<'a>>) -> DnsMessage<'a> {
        self.questions = questions;
        self.header.questions = count(self.questions.len());
        self
    }

    pub fn with_answers<C>(mut self, answers: C) -> DnsMessage<'a>
    where
        C: Into<ResourceRecordCollection<'a>>,
    {
        self.answers = answers.into();
        self.header.answers = count(self.answers.len());
        self
    }

    pub fn with_authorities<C>(mut self, authorities: C) -> DnsMessage<'a>
    where
        C: Into<ResourceRecordCollection<'a>>,
    {
        self.authorities = authorities.into();
        self.header.authoritative_entries = count(self.authorities.len());
        self
    }

    pub fn with_resources<C>(mut self, resources: C) -> DnsMessage<'a>
    where
        C: Into<ResourceRecordCollection<'a>>,
    {
        self.resources = resources.into();
        self.header.resource_entries = count(self.resources.len());
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.encode(MAX_MESSAGE_SIZE)
    }

    /// Encodes the message into at most `max_size` bytes. Records that do
    /// not fit are left out, in which case the TC flag is set and the header
    /// counts describe what was actually written. Questions always have to
    /// fit.
    pub fn encode(&self, max_size: usize) -> Result<Vec<u8>> {
        let max_size = max_size.min(MAX_MESSAGE_SIZE);

        let mut writer = PacketWriter::new();
        let mut header = self.header.clone();
        header.write(&mut writer);

        for question in &self.questions {
            question.write(&mut writer)?;
        }
        if writer.pos() > max_size {
            return Err(CodecError::MessageTooLarge(writer.pos()));
        }

        let mut counts = [0u16; 3];
        let sections = [&self.answers, &self.authorities, &self.resources];

        'sections: for (idx, section) in sections.iter().enumerate() {
            for record in section.iter() {
                let record = record?;
                let mark = writer.pos();
                record.write(&mut writer)?;

                if writer.pos() > max_size {
                    writer.truncate(mark);
                    header.truncated_message = true;
                    break 'sections;
                }
                counts[idx] += 1;
            }
        }

        header.answers = counts[0];
        header.authoritative_entries = counts[1];
        header.resource_entries = counts[2];
        writer.set_bytes(0, &header.to_bytes())?;

        Ok(writer.into_inner())
    }

    /// Copies every name and record out of the underlying buffer.
    pub fn into_owned(self) -> Result<DnsMessage<'static>> {
        Ok(DnsMessage {
            header: self.header,
            questions: self
                .questions
                .into_iter()
                .map(|q| q.into_owned())
                .collect::<Result<Vec<_>>>()?,
            answers: self.answers.into_owned()?,
            authorities: self.authorities.into_owned()?,
            resources: self.resources.into_owned()?,
        })
    }
}

impl<'a> fmt::Display for DnsMessage<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.header)?;

        writeln!(f, "questions:")?;
        for question in &self.questions {
            writeln!(f, "\t{}", question)?;
        }

        for (title, section) in [
            ("answers", &self.answers),
            ("authorities", &self.authorities),
            ("resources", &self.resources),
        ] {
            writeln!(f, "{}:", title)?;
            for record in section.iter() {
                match record {
                    Ok(rec) => writeln!(
                        f,
                        "\t{} {:?} ttl {} ({} bytes)",
                        rec.name,
                        rec.rtype,
                        rec.ttl,
                        rec.data.len()
                    )?,
                    Err(e) => writeln!(f, "\t<{}>", e)?,
                }
            }
        }

        Ok(())
    }
}
