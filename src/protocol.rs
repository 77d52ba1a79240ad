//! Carrier-name message framing
//!
//! Every protocol message is one DNS question name ending in the operator's
//! carrier suffix:
//!
//! ```text
//! i.<sid>.0.<total>.<b36 salt>.<b36 filename labels...>.<suffix>
//! d.<sid>.<seq>.<total>.<b36 chunk labels...>.<suffix>
//! f.<sid>.<total>.<total>.<b36 checksum>.<suffix>
//! ```
//!
//! The receiver answers each question with one sentinel address ([`Reply`]).

use crate::codec::{self, CodecError, MAX_LABEL_LEN};
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Maximum total QNAME length
pub const MAX_NAME_LEN: usize = 253;

/// Characters used by the non-payload labels of a Data name:
/// `d.SSSSSSSS.NNNNN.NNNNN.` is 23, rounded up to 24.
pub const META_OVERHEAD: usize = 24;

/// Sequence and total fields are budgeted at five decimal digits
pub const MAX_CHUNKS: usize = 99_999;

pub const TYPE_INIT: &str = "i";
pub const TYPE_DATA: &str = "d";
pub const TYPE_FIN: &str = "f";

const SESSION_ID_LEN: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("query {name:?} does not match carrier domain {suffix:?}")]
    DomainMismatch { name: String, suffix: String },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("bad {field}: {source}")]
    Encoding {
        field: &'static str,
        #[source]
        source: CodecError,
    },
}

/// Sentinel answers. The receiver returns one of these as the only answer
/// record (A record address, or its dotted-quad text in a TXT record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reply {
    Ack,
    Nack,
    Complete,
    Incomplete,
}

impl Reply {
    pub fn addr(self) -> Ipv4Addr {
        match self {
            Reply::Ack => Ipv4Addr::new(1, 0, 0, 1),
            Reply::Nack => Ipv4Addr::new(1, 0, 0, 2),
            Reply::Complete => Ipv4Addr::new(1, 0, 0, 3),
            Reply::Incomplete => Ipv4Addr::new(1, 0, 0, 4),
        }
    }

    pub fn from_addr(addr: Ipv4Addr) -> Option<Self> {
        [Reply::Ack, Reply::Nack, Reply::Complete, Reply::Incomplete]
            .into_iter()
            .find(|r| r.addr() == addr)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reply::Ack => "ACK",
            Reply::Nack => "NACK",
            Reply::Complete => "COMPLETE",
            Reply::Incomplete => "INCOMPLETE",
        };
        write!(f, "{} ({})", name, self.addr())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitMessage {
    pub session_id: String,
    pub total: u32,
    pub salt: Vec<u8>,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub session_id: String,
    pub seq: u32,
    pub total: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinMessage {
    pub session_id: String,
    pub total: u32,
    pub checksum: Vec<u8>,
}

/// A parsed carrier name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Init(InitMessage),
    Data(DataMessage),
    Fin(FinMessage),
}

impl Message {
    pub fn session_id(&self) -> &str {
        match self {
            Message::Init(m) => &m.session_id,
            Message::Data(m) => &m.session_id,
            Message::Fin(m) => &m.session_id,
        }
    }
}

/// Largest raw chunk (in bytes) whose Data name fits under [`MAX_NAME_LEN`]
/// for this carrier suffix. Zero means the suffix leaves no room at all.
pub fn chunk_size(suffix: &str) -> usize {
    let suffix = suffix.trim_end_matches('.');
    let available = MAX_NAME_LEN as isize - suffix.len() as isize - 1 - META_OVERHEAD as isize;
    if available <= 0 {
        return 0;
    }
    let available = available as usize;

    // Whole labels only; every label after the first costs a separating dot
    let mut labels = 0usize;
    let mut used = 0usize;
    loop {
        let need = if labels == 0 { MAX_LABEL_LEN } else { MAX_LABEL_LEN + 1 };
        if used + need > available {
            break;
        }
        used += need;
        labels += 1;
    }

    if labels == 0 {
        return 0;
    }

    let total_chars = labels * MAX_LABEL_LEN;
    let raw = (total_chars as f64 * (36f64.ln() / 256f64.ln())).floor() as usize;
    raw.max(1)
}

pub fn build_init(sid: &str, total: u32, salt: &[u8], filename: &str, suffix: &str) -> String {
    let b36_name = codec::encode(filename.as_bytes());
    format!(
        "{}.{}.0.{}.{}.{}.{}",
        TYPE_INIT,
        sid,
        total,
        codec::encode(salt),
        codec::split_labels(&b36_name, MAX_LABEL_LEN).join("."),
        suffix.trim_end_matches('.')
    )
}

pub fn build_data(sid: &str, seq: u32, total: u32, chunk: &[u8], suffix: &str) -> String {
    let b36 = codec::encode(chunk);
    format!(
        "{}.{}.{}.{}.{}.{}",
        TYPE_DATA,
        sid,
        seq,
        total,
        codec::split_labels(&b36, MAX_LABEL_LEN).join("."),
        suffix.trim_end_matches('.')
    )
}

pub fn build_fin(sid: &str, total: u32, checksum: &[u8], suffix: &str) -> String {
    format!(
        "{}.{}.{}.{}.{}.{}",
        TYPE_FIN,
        sid,
        total,
        total,
        codec::encode(checksum),
        suffix.trim_end_matches('.')
    )
}

/// Shorten `filename` (dropping leading characters, so the extension
/// survives) until its Init name fits under [`MAX_NAME_LEN`].
pub fn fit_filename(filename: &str, salt: &[u8], suffix: &str) -> String {
    let sid = "0".repeat(SESSION_ID_LEN);
    let total = MAX_CHUNKS as u32;
    let mut name = filename;
    while !name.is_empty() && build_init(&sid, total, salt, name, suffix).len() > MAX_NAME_LEN {
        let mut chars = name.chars();
        chars.next();
        name = chars.as_str();
    }
    name.to_string()
}

/// Parse a question name into a [`Message`].
///
/// Names are compared case-insensitively (resolvers may randomize case) and
/// trailing root dots are ignored.
pub fn parse_query(name: &str, suffix: &str) -> Result<Message, ParseError> {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    let suffix = suffix.trim_end_matches('.').to_ascii_lowercase();

    let prefix = name
        .strip_suffix(suffix.as_str())
        .and_then(|p| p.strip_suffix('.'))
        .ok_or_else(|| ParseError::DomainMismatch {
            name: name.clone(),
            suffix: suffix.clone(),
        })?;

    let parts: Vec<&str> = prefix.split('.').collect();
    if parts.len() < 4 {
        return Err(ParseError::Malformed(format!(
            "too few labels in query: {}",
            parts.len()
        )));
    }

    let sid = parts[1];
    if sid.len() != SESSION_ID_LEN || !sid.bytes().all(|c| c.is_ascii_hexdigit()) {
        return Err(ParseError::Malformed(format!("bad session id {:?}", sid)));
    }

    match parts[0] {
        TYPE_INIT => parse_init(sid, &parts[2..]).map(Message::Init),
        TYPE_DATA => parse_data(sid, &parts[2..]).map(Message::Data),
        TYPE_FIN => parse_fin(sid, &parts[2..]).map(Message::Fin),
        other => Err(ParseError::Malformed(format!(
            "unknown message type: {:?}",
            other
        ))),
    }
}

// parts: [0, total, salt, filename labels...]
fn parse_init(sid: &str, parts: &[&str]) -> Result<InitMessage, ParseError> {
    if parts.len() < 4 {
        return Err(ParseError::Malformed(format!(
            "init: expected at least 4 labels after sid, got {}",
            parts.len()
        )));
    }

    let total = parse_number("init total", parts[1])?;
    let salt = decode_field("init salt", parts[2])?;
    let filename = decode_field("init filename", &codec::join_labels(&parts[3..]))?;

    Ok(InitMessage {
        session_id: sid.to_string(),
        total,
        salt,
        filename: String::from_utf8_lossy(&filename).into_owned(),
    })
}

// parts: [seq, total, chunk labels...]
fn parse_data(sid: &str, parts: &[&str]) -> Result<DataMessage, ParseError> {
    if parts.len() < 3 {
        return Err(ParseError::Malformed(format!(
            "data: expected at least 3 labels after sid, got {}",
            parts.len()
        )));
    }

    let seq = parse_number("data seq", parts[0])?;
    let total = parse_number("data total", parts[1])?;
    let data = decode_field("data chunk", &codec::join_labels(&parts[2..]))?;

    Ok(DataMessage {
        session_id: sid.to_string(),
        seq,
        total,
        data,
    })
}

// parts: [total, total, checksum]
fn parse_fin(sid: &str, parts: &[&str]) -> Result<FinMessage, ParseError> {
    if parts.len() < 3 {
        return Err(ParseError::Malformed(format!(
            "fin: expected at least 3 labels after sid, got {}",
            parts.len()
        )));
    }

    let total = parse_number("fin total", parts[0])?;
    let repeated = parse_number("fin total", parts[1])?;
    if total != repeated {
        return Err(ParseError::Malformed(format!(
            "fin: total fields disagree ({} vs {})",
            total, repeated
        )));
    }
    let checksum = decode_field("fin checksum", parts[2])?;

    Ok(FinMessage {
        session_id: sid.to_string(),
        total,
        checksum,
    })
}

fn parse_number(field: &str, label: &str) -> Result<u32, ParseError> {
    label
        .parse::<u32>()
        .map_err(|e| ParseError::Malformed(format!("{}: {:?}: {}", field, label, e)))
}

fn decode_field(field: &'static str, text: &str) -> Result<Vec<u8>, ParseError> {
    codec::decode(text).map_err(|source| ParseError::Encoding { field, source })
}
