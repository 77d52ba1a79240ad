// DNS message encoding for the carrier channel
//
// Header, question and answer sections only. Authority and additional
// sections (e.g. EDNS OPT records added by dig) are ignored on parse.

use super::{DnsError, Result};
use crate::protocol::MAX_NAME_LEN;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::net::Ipv4Addr;

const MAX_LABEL_LEN: usize = 63;

/// A name of at most 255 octets can't hold more labels than this
const MAX_LABELS: usize = 128;

pub const CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_RD: u16 = 0x0100;

/// Record types the carrier channel understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    #[default]
    A,
    Txt,
}

impl RecordType {
    pub fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Txt => 16,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(RecordType::A),
            16 => Some(RecordType::Txt),
            _ => None,
        }
    }
}

/// DNS message header (12 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    /// Standard query, recursion desired
    pub fn new_query(id: u16) -> Self {
        Self {
            id,
            flags: FLAG_RD,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    /// Authoritative response to `query`; RD is echoed back
    pub fn new_response(query: &DnsHeader, qdcount: u16, ancount: u16) -> Self {
        Self {
            id: query.id,
            flags: FLAG_QR | FLAG_AA | (query.flags & FLAG_RD),
            qdcount,
            ancount,
            nscount: 0,
            arcount: 0,
        }
    }

    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        if buf.remaining() < 12 {
            return Err(DnsError::InvalidMessage("Header too short".into()));
        }

        Ok(Self {
            id: buf.get_u16(),
            flags: buf.get_u16(),
            qdcount: buf.get_u16(),
            ancount: buf.get_u16(),
            nscount: buf.get_u16(),
            arcount: buf.get_u16(),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.id);
        buf.put_u16(self.flags);
        buf.put_u16(self.qdcount);
        buf.put_u16(self.ancount);
        buf.put_u16(self.nscount);
        buf.put_u16(self.arcount);
    }

    pub fn is_response(&self) -> bool {
        (self.flags & FLAG_QR) != 0
    }
}

/// DNS question. The type is kept raw so unsupported types can still be
/// echoed back in an empty response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn new(qname: &str, record_type: RecordType) -> Self {
        Self {
            qname: qname.to_string(),
            qtype: record_type.code(),
            qclass: CLASS_IN,
        }
    }

    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_code(self.qtype)
    }

    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let qname = read_domain_name(buf)?;

        if buf.remaining() < 4 {
            return Err(DnsError::InvalidMessage("Question too short".into()));
        }

        Ok(Self {
            qname,
            qtype: buf.get_u16(),
            qclass: buf.get_u16(),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        write_domain_name(&self.qname, buf);
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);
    }
}

/// DNS resource record (answer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    pub fn new_a(name: &str, addr: Ipv4Addr, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: RecordType::A.code(),
            rclass: CLASS_IN,
            ttl,
            rdata: addr.octets().to_vec(),
        }
    }

    /// TXT record holding one character-string (at most 255 bytes)
    pub fn new_txt(name: &str, text: &str, ttl: u32) -> Self {
        let bytes = &text.as_bytes()[..text.len().min(255)];
        let mut rdata = Vec::with_capacity(bytes.len() + 1);
        rdata.push(bytes.len() as u8);
        rdata.extend_from_slice(bytes);

        Self {
            name: name.to_string(),
            rtype: RecordType::Txt.code(),
            rclass: CLASS_IN,
            ttl,
            rdata,
        }
    }

    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let name = read_domain_name(buf)?;

        if buf.remaining() < 10 {
            return Err(DnsError::InvalidMessage("Record too short".into()));
        }

        let rtype = buf.get_u16();
        let rclass = buf.get_u16();
        let ttl = buf.get_u32();
        let rdlen = buf.get_u16() as usize;

        if buf.remaining() < rdlen {
            return Err(DnsError::InvalidMessage("Truncated record data".into()));
        }

        let mut rdata = vec![0u8; rdlen];
        buf.copy_to_slice(&mut rdata);

        Ok(Self {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        write_domain_name(&self.name, buf);
        buf.put_u16(self.rtype);
        buf.put_u16(self.rclass);
        buf.put_u32(self.ttl);
        buf.put_u16(self.rdata.len() as u16);
        buf.put_slice(&self.rdata);
    }

    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        if self.rtype != RecordType::A.code() || self.rdata.len() != 4 {
            return None;
        }
        Some(Ipv4Addr::new(
            self.rdata[0],
            self.rdata[1],
            self.rdata[2],
            self.rdata[3],
        ))
    }

    /// Concatenated character-strings of a TXT record
    pub fn txt_data(&self) -> Result<String> {
        if self.rtype != RecordType::Txt.code() {
            return Err(DnsError::UnexpectedAnswer("Not a TXT record".into()));
        }

        let mut result = Vec::new();
        let mut cursor = Cursor::new(&self.rdata[..]);

        while cursor.has_remaining() {
            let len = cursor.get_u8() as usize;
            if cursor.remaining() < len {
                return Err(DnsError::InvalidMessage("Truncated TXT data".into()));
            }

            let mut chunk = vec![0u8; len];
            cursor.copy_to_slice(&mut chunk);
            result.extend_from_slice(&chunk);
        }

        String::from_utf8(result)
            .map_err(|_| DnsError::UnexpectedAnswer("TXT data is not UTF-8".into()))
    }
}

/// DNS message (complete query or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
}

impl DnsMessage {
    /// Single-question query. The name is validated against RFC 1035 limits.
    pub fn new_query(name: &str, record_type: RecordType, id: u16) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            header: DnsHeader::new_query(id),
            questions: vec![DnsQuestion::new(name, record_type)],
            answers: Vec::new(),
        })
    }

    /// Response to `query` echoing its questions with the given answers
    pub fn new_response(query: &DnsMessage, answers: Vec<DnsRecord>) -> Self {
        Self {
            header: DnsHeader::new_response(
                &query.header,
                query.questions.len() as u16,
                answers.len() as u16,
            ),
            questions: query.questions.clone(),
            answers,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let header = DnsHeader::parse(&mut cursor)?;

        let mut questions = Vec::with_capacity(header.qdcount.min(4) as usize);
        for _ in 0..header.qdcount {
            questions.push(DnsQuestion::parse(&mut cursor)?);
        }

        let mut answers = Vec::with_capacity(header.ancount.min(4) as usize);
        for _ in 0..header.ancount {
            answers.push(DnsRecord::parse(&mut cursor)?);
        }

        Ok(Self {
            header,
            questions,
            answers,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(512);

        self.header.write(&mut buf);

        for q in &self.questions {
            q.write(&mut buf);
        }

        for a in &self.answers {
            a.write(&mut buf);
        }

        buf.to_vec()
    }

    pub fn first_question(&self) -> Option<&DnsQuestion> {
        self.questions.first()
    }
}

/// Reject names that can't be put on the wire as-is
pub fn validate_name(name: &str) -> Result<()> {
    let name = name.trim_end_matches('.');
    if name.len() > MAX_NAME_LEN {
        return Err(DnsError::InvalidName(format!(
            "{} characters (max {})",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(DnsError::InvalidName(format!(
                "label of {} characters in {:?}",
                label.len(),
                name
            )));
        }
    }
    Ok(())
}

/// Read a domain name from a DNS message.
///
/// A compression pointer ends the name; only answer names (which are never
/// inspected) use them in practice.
fn read_domain_name(buf: &mut Cursor<&[u8]>) -> Result<String> {
    let mut labels = Vec::new();

    loop {
        if labels.len() > MAX_LABELS {
            return Err(DnsError::InvalidMessage("Too many labels".into()));
        }

        if !buf.has_remaining() {
            return Err(DnsError::InvalidMessage("Truncated domain name".into()));
        }

        let len = buf.get_u8();

        if len == 0 {
            break;
        }

        if (len & 0xC0) == 0xC0 {
            if !buf.has_remaining() {
                return Err(DnsError::InvalidMessage("Truncated name pointer".into()));
            }
            buf.get_u8();
            break;
        }

        let label_len = len as usize;
        if buf.remaining() < label_len {
            return Err(DnsError::InvalidMessage("Truncated label".into()));
        }

        let mut label = vec![0u8; label_len];
        buf.copy_to_slice(&mut label);

        labels.push(
            String::from_utf8(label)
                .map_err(|_| DnsError::InvalidMessage("Invalid UTF-8 in domain name".into()))?,
        );
    }

    Ok(labels.join("."))
}

fn write_domain_name(domain: &str, buf: &mut BytesMut) {
    for label in domain.trim_end_matches('.').split('.') {
        if label.is_empty() {
            continue;
        }
        let bytes = label.as_bytes();
        buf.put_u8(bytes.len().min(MAX_LABEL_LEN) as u8);
        buf.put_slice(&bytes[..bytes.len().min(MAX_LABEL_LEN)]);
    }
    buf.put_u8(0);
}
