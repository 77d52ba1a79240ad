// Minimal DNS plumbing for the carrier channel
//
// Just enough of RFC 1035 to:
// - Send one A/TXT question and read back the first answer (sender side)
// - Answer a question with a single A/TXT record (receiver side)

pub mod transport;
pub mod wire;

pub use transport::{DnsServer, UdpResolver};
pub use wire::{DnsHeader, DnsMessage, DnsQuestion, DnsRecord, RecordType};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("Invalid DNS message: {0}")]
    InvalidMessage(String),

    #[error("Invalid query name: {0}")]
    InvalidName(String),

    #[error("Query timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("No answer records")]
    NoAnswer,

    #[error("Unexpected answer: {0}")]
    UnexpectedAnswer(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DnsError>;
