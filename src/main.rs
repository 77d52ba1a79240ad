//! dnsexfil - encrypted file transfer over DNS query names

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;

use dnsexfil::{ExfilConfig, KdfType, RecordType};

#[derive(Parser)]
#[command(name = "dnsexfil")]
#[command(version = env!("DNSEXFIL_VERSION"))]
#[command(about = "Encrypted file transfer carried in DNS query names", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Settings both ends must agree on
#[derive(clap::Args)]
struct CommonArgs {
    /// Carrier domain the receiver is authoritative for
    #[arg(short, long, global = true)]
    domain: Option<String>,

    /// Encryption passphrase
    #[arg(short, long, global = true, env = "DNSEXFIL_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Ask for and answer with TXT records instead of A
    #[arg(long, global = true)]
    txt: bool,

    /// Key derivation function (argon2, pbkdf2)
    #[arg(long, global = true, value_parser = parse_kdf)]
    kdf: Option<KdfType>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file
    Send {
        /// File to send
        file: PathBuf,

        /// Resolver address (ip:port)
        #[arg(short, long)]
        resolver: Option<SocketAddr>,

        /// Concurrent Data workers
        #[arg(long)]
        concurrency: Option<usize>,

        /// Per-query timeout (e.g. 2s, 500ms)
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,

        /// Maximum retries per query
        #[arg(long)]
        retries: Option<u32>,
    },

    /// Receive files as an authoritative DNS server
    Serve {
        /// UDP listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Directory completed files are written to
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Drop sessions idle for this long (e.g. 5m)
        #[arg(long, value_parser = humantime::parse_duration)]
        session_timeout: Option<Duration>,
    },
}

fn parse_kdf(s: &str) -> std::result::Result<KdfType, String> {
    match s {
        "argon2" => Ok(KdfType::Argon2),
        "pbkdf2" => Ok(KdfType::Pbkdf2),
        other => Err(format!("unknown KDF {:?} (expected argon2 or pbkdf2)", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let mut config = match &cli.config {
        Some(path) => ExfilConfig::from_file(path)?,
        None => ExfilConfig::default(),
    };
    apply_common(&mut config, cli.common);

    match cli.command {
        Commands::Send {
            file,
            resolver,
            concurrency,
            timeout,
            retries,
        } => {
            if let Some(resolver) = resolver {
                config.sender.resolver = resolver;
            }
            if let Some(concurrency) = concurrency {
                config.sender.concurrency = concurrency;
            }
            if let Some(timeout) = timeout {
                config.sender.timeout = timeout;
            }
            if let Some(retries) = retries {
                config.sender.max_retries = retries;
            }
            run_send(&config, file).await?;
        }
        Commands::Serve {
            listen,
            output_dir,
            session_timeout,
        } => {
            if let Some(listen) = listen {
                config.receiver.listen = listen;
            }
            if let Some(output_dir) = output_dir {
                config.receiver.output_dir = output_dir;
            }
            if let Some(session_timeout) = session_timeout {
                config.receiver.session_timeout = session_timeout;
            }
            run_serve(&config).await?;
        }
    }

    Ok(())
}

fn apply_common(config: &mut ExfilConfig, args: CommonArgs) {
    if let Some(domain) = args.domain {
        config.common.domain = domain;
    }
    if let Some(passphrase) = args.passphrase {
        config.common.passphrase = passphrase;
    }
    if args.txt {
        config.common.record_type = RecordType::Txt;
    }
    if let Some(kdf) = args.kdf {
        config.common.kdf.kind = kdf;
    }
}

async fn run_send(config: &ExfilConfig, file: PathBuf) -> Result<()> {
    config.validate().context("invalid sender configuration")?;

    info!(
        "Sending {} via {} under {}",
        file.display(),
        config.sender.resolver,
        config.common.domain
    );

    let report = dnsexfil::send_file(config, &file)
        .await
        .with_context(|| format!("sending {}", file.display()))?;

    info!(
        "Session {}: {} chunks delivered, {} resend round(s)",
        report.session_id, report.chunks, report.resend_rounds
    );
    Ok(())
}

async fn run_serve(config: &ExfilConfig) -> Result<()> {
    config.validate().context("invalid receiver configuration")?;

    let server = dnsexfil::bind_receiver(config)
        .await
        .with_context(|| format!("binding {}", config.receiver.listen))?;

    info!(
        "Receiving for {} into {} (session timeout {})",
        config.common.domain,
        config.receiver.output_dir.display(),
        humantime::format_duration(config.receiver.session_timeout)
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
        }
        let _ = shutdown_tx.send(());
    });

    server.run(shutdown_rx).await?;
    info!("Receiver stopped");
    Ok(())
}
