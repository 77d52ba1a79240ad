//! dnsexfil configuration

use crate::crypto::{Envelope, KdfConfig};
use crate::dns::RecordType;
use crate::protocol;
use crate::sender::SenderOptions;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main dnsexfil configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExfilConfig {
    /// Settings both ends must agree on
    #[serde(default)]
    pub common: CommonConfig,

    #[serde(default)]
    pub sender: SenderConfig,

    #[serde(default)]
    pub receiver: ReceiverConfig,
}

/// Shared transfer settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    /// Carrier suffix the receiver is authoritative for
    pub domain: String,

    /// Encryption passphrase
    pub passphrase: String,

    /// Query/answer record type
    pub record_type: RecordType,

    /// Key derivation function
    pub kdf: KdfConfig,
}

/// Sending side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Resolver (or the receiver itself) to send queries to
    pub resolver: SocketAddr,

    /// Concurrent Data-phase workers
    pub concurrency: usize,

    /// Per-query timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Retries per query after the first attempt
    pub max_retries: u32,

    /// Full Data resends while the receiver reports Incomplete
    pub fin_resends: u32,

    /// First retry delay, doubled on each further retry
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            resolver: SocketAddr::from(([127, 0, 0, 1], 53)),
            concurrency: 10,
            timeout: Duration::from_secs(2),
            max_retries: 3,
            fin_resends: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// Receiving side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// UDP listen address
    pub listen: SocketAddr,

    /// Where completed files are written
    pub output_dir: PathBuf,

    /// Idle time after which a session is dropped
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,

    /// How often idle sessions are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 53)),
            output_dir: PathBuf::from("."),
            session_timeout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl ExfilConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.common.passphrase.is_empty() {
            bail!("passphrase must be set");
        }

        if self.common.domain.trim_end_matches('.').is_empty() {
            bail!("domain must be set");
        }

        if protocol::chunk_size(&self.common.domain) == 0 {
            bail!(
                "domain {:?} is too long to leave room for any payload",
                self.common.domain
            );
        }

        if self.sender.concurrency == 0 {
            bail!("sender concurrency must be at least 1");
        }

        if self.sender.timeout.is_zero() {
            bail!("sender timeout must be non-zero");
        }

        if self.receiver.sweep_interval.is_zero() {
            bail!("receiver sweep interval must be non-zero");
        }

        Ok(())
    }

    pub fn envelope(&self) -> Envelope {
        Envelope::new(self.common.passphrase.clone(), self.common.kdf.clone())
    }

    pub fn sender_options(&self) -> SenderOptions {
        SenderOptions {
            concurrency: self.sender.concurrency,
            max_retries: self.sender.max_retries,
            backoff_base: self.sender.backoff_base,
            fin_resends: self.sender.fin_resends,
        }
    }
}
