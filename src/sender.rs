//! Sending side: file chunking and three-phase reliable delivery
//!
//! ```text
//! Init (blocking) → Data (worker pool) → Fin ─ Complete → done
//!                        ↑                 └─ Incomplete → resend all Data
//!                        └────────────────────────────────┘
//! ```

use crate::assembler::safe_file_name;
use crate::crypto::{self, Envelope, EnvelopeError, CHECKSUM_LEN, SALT_LEN};
use crate::dns::DnsError;
use crate::protocol::{self, Reply, MAX_CHUNKS};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

/// One carrier name out, one answer address back
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(&self, name: &str) -> Result<Ipv4Addr, DnsError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Data,
    Fin,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Init => write!(f, "init"),
            Phase::Data => write!(f, "data"),
            Phase::Fin => write!(f, "fin"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Encryption failed: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Domain {0:?} leaves no room for payload")]
    NoRoom(String),

    #[error("File needs {chunks} chunks (max {max})")]
    TooLarge { chunks: usize, max: usize },

    #[error("{phase} exchange failed after {attempts} attempts: {source}")]
    Transport {
        phase: Phase,
        attempts: u32,
        #[source]
        source: DnsError,
    },

    #[error("{phase} rejected: receiver answered {reply}")]
    Rejected { phase: Phase, reply: Reply },

    #[error("Receiver still incomplete after {0} resend rounds")]
    ResendsExhausted(u32),

    #[error("Data worker failed: {0}")]
    Worker(String),
}

/// An encrypted file split into Data-sized chunks
#[derive(Debug, Clone)]
pub struct ChunkedFile {
    pub filename: String,
    pub salt: [u8; SALT_LEN],
    /// Checksum of the plaintext
    pub checksum: [u8; CHECKSUM_LEN],
    pub chunks: Vec<Vec<u8>>,
    pub chunk_size: usize,
}

impl ChunkedFile {
    pub fn total(&self) -> u32 {
        self.chunks.len() as u32
    }
}

/// Read, checksum, encrypt and split the file at `path` for `suffix`
pub async fn chunk_file(
    path: impl AsRef<Path>,
    envelope: &Envelope,
    suffix: &str,
) -> Result<ChunkedFile, SendError> {
    let path = path.as_ref();

    let chunk_size = protocol::chunk_size(suffix);
    if chunk_size == 0 {
        return Err(SendError::NoRoom(suffix.to_string()));
    }

    let plaintext = tokio::fs::read(path).await?;
    let checksum = crypto::checksum(&plaintext);
    let salt = crypto::generate_salt();

    let sealer = envelope.clone();
    let ciphertext = tokio::task::spawn_blocking(move || sealer.seal(&salt, &plaintext))
        .await
        .map_err(|e| SendError::Worker(e.to_string()))??;

    let chunks: Vec<Vec<u8>> = ciphertext.chunks(chunk_size).map(<[u8]>::to_vec).collect();
    if chunks.len() > MAX_CHUNKS {
        return Err(SendError::TooLarge {
            chunks: chunks.len(),
            max: MAX_CHUNKS,
        });
    }

    let base = safe_file_name(&path.to_string_lossy()).unwrap_or_else(|| "file".to_string());
    let filename = protocol::fit_filename(&base, &salt, suffix);
    if filename != base {
        warn!("Filename shortened to {:?} to fit the Init query", filename);
    }

    Ok(ChunkedFile {
        filename,
        salt,
        checksum,
        chunks,
        chunk_size,
    })
}

/// Delivery tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderOptions {
    /// Data-phase workers
    pub concurrency: usize,
    /// Retries per exchange after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry
    pub backoff_base: Duration,
    /// Full Data resends allowed while Fin answers Incomplete
    pub fin_resends: u32,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            fin_resends: 3,
        }
    }
}

impl SenderOptions {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exp)
    }
}

/// Outcome of a completed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub session_id: String,
    pub chunks: u32,
    pub resend_rounds: u32,
}

pub struct Sender<T> {
    transport: Arc<T>,
    suffix: String,
    options: SenderOptions,
}

impl<T: Exchange + 'static> Sender<T> {
    pub fn new(transport: Arc<T>, suffix: impl Into<String>, options: SenderOptions) -> Self {
        Self {
            transport,
            suffix: suffix.into().trim_end_matches('.').to_string(),
            options,
        }
    }

    /// Deliver `file` under a fresh session id
    pub async fn send(&self, file: &ChunkedFile) -> Result<TransferReport, SendError> {
        let sid = crypto::generate_session_id();
        self.send_as(&sid, file).await
    }

    /// Deliver `file` under the given session id
    pub async fn send_as(&self, sid: &str, file: &ChunkedFile) -> Result<TransferReport, SendError> {
        let total = file.total();
        info!(
            "[{}] Sending {:?}: {} chunks of up to {} bytes",
            sid, file.filename, total, file.chunk_size
        );

        let init = protocol::build_init(sid, total, &file.salt, &file.filename, &self.suffix);
        match exchange_with_retry(&*self.transport, &init, Phase::Init, &self.options).await? {
            Reply::Ack => info!("[{}] Init acknowledged", sid),
            reply => {
                return Err(SendError::Rejected {
                    phase: Phase::Init,
                    reply,
                })
            }
        }

        self.send_data(sid, file).await?;

        let fin = protocol::build_fin(sid, total, &file.checksum, &self.suffix);
        let mut resend_rounds = 0;
        loop {
            match exchange_with_retry(&*self.transport, &fin, Phase::Fin, &self.options).await? {
                Reply::Complete => {
                    info!("[{}] Transfer complete", sid);
                    return Ok(TransferReport {
                        session_id: sid.to_string(),
                        chunks: total,
                        resend_rounds,
                    });
                }
                Reply::Incomplete => {
                    if resend_rounds >= self.options.fin_resends {
                        return Err(SendError::ResendsExhausted(resend_rounds));
                    }
                    resend_rounds += 1;
                    warn!(
                        "[{}] Receiver incomplete, resending all chunks ({}/{})",
                        sid, resend_rounds, self.options.fin_resends
                    );
                    self.send_data(sid, file).await?;
                }
                reply => {
                    return Err(SendError::Rejected {
                        phase: Phase::Fin,
                        reply,
                    })
                }
            }
        }
    }

    /// Push every chunk through the worker pool; succeeds only if all are acked.
    ///
    /// A failing worker stops the others from taking new chunks but does
    /// not interrupt sends already in flight.
    async fn send_data(&self, sid: &str, file: &ChunkedFile) -> Result<(), SendError> {
        let total = file.total();

        let (tx, rx) = mpsc::unbounded_channel();
        for (i, chunk) in file.chunks.iter().enumerate() {
            if tx.send((i as u32 + 1, chunk.clone())).is_err() {
                break;
            }
        }
        drop(tx);

        let queue = Arc::new(Mutex::new(rx));
        let failed = Arc::new(AtomicBool::new(false));
        let mut workers = JoinSet::new();

        for _ in 0..self.options.concurrency.clamp(1, file.chunks.len().max(1)) {
            let queue = Arc::clone(&queue);
            let failed = Arc::clone(&failed);
            let transport = Arc::clone(&self.transport);
            let options = self.options;
            let sid = sid.to_string();
            let suffix = self.suffix.clone();

            workers.spawn(async move {
                loop {
                    if failed.load(Ordering::Acquire) {
                        return Ok(());
                    }

                    let (seq, chunk) = match queue.lock().await.recv().await {
                        Some(job) => job,
                        None => return Ok(()),
                    };

                    let name = protocol::build_data(&sid, seq, total, &chunk, &suffix);
                    match exchange_with_retry(&*transport, &name, Phase::Data, &options).await {
                        Ok(Reply::Ack) => debug!("[{}] Chunk {}/{} acknowledged", sid, seq, total),
                        Ok(reply) => {
                            warn!("[{}] Chunk {}/{} answered {}", sid, seq, total, reply);
                            failed.store(true, Ordering::Release);
                            return Err(SendError::Rejected {
                                phase: Phase::Data,
                                reply,
                            });
                        }
                        Err(e) => {
                            warn!("[{}] Chunk {}/{} failed: {}", sid, seq, total, e);
                            failed.store(true, Ordering::Release);
                            return Err(e);
                        }
                    }
                }
            });
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.map_err(|e| SendError::Worker(e.to_string())).and_then(|r| r);
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// One exchange with exponential-backoff retries.
///
/// Transport errors and addresses that aren't a known reply are retried; a
/// recognized reply is returned as-is for the phase to judge.
async fn exchange_with_retry<T: Exchange + ?Sized>(
    transport: &T,
    name: &str,
    phase: Phase,
    options: &SenderOptions,
) -> Result<Reply, SendError> {
    let mut last_error = DnsError::NoAnswer;

    for attempt in 0..=options.max_retries {
        if attempt > 0 {
            let delay = options.backoff(attempt);
            debug!(
                "{} retry {}/{} in {:?} after: {}",
                phase, attempt, options.max_retries, delay, last_error
            );
            tokio::time::sleep(delay).await;
        }

        match transport.exchange(name).await {
            Ok(addr) => match Reply::from_addr(addr) {
                Some(reply) => return Ok(reply),
                None => last_error = DnsError::UnexpectedAnswer(format!("address {}", addr)),
            },
            Err(e) => last_error = e,
        }
    }

    Err(SendError::Transport {
        phase,
        attempts: options.max_retries + 1,
        source: last_error,
    })
}
