//! End-to-end transfer scenarios through the public API

use async_trait::async_trait;
use dnsexfil::protocol::{self, Message};
use dnsexfil::{
    chunk_file, AssembleError, Assembler, Dispatcher, DnsError, Envelope, Exchange, ExfilConfig,
    KdfConfig, KdfType, RecordType, Reply, SendError, Sender, SenderOptions, Session,
    SessionStore,
};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const SUFFIX: &str = "exfil.test";

fn fast_kdf() -> KdfConfig {
    KdfConfig {
        kind: KdfType::Pbkdf2,
        pbkdf2_iterations: 1_000,
        ..KdfConfig::default()
    }
}

fn fast_options() -> SenderOptions {
    SenderOptions {
        concurrency: 4,
        max_retries: 2,
        backoff_base: Duration::from_millis(5),
        fin_resends: 3,
    }
}

fn dispatcher(passphrase: &str, output_dir: &Path) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        SUFFIX,
        Arc::new(SessionStore::new(Duration::from_secs(60))),
        Assembler::new(Envelope::new(passphrase, fast_kdf()), output_dir),
    ))
}

/// In-process transport with optional interference on Data queries
struct Loopback {
    dispatcher: Arc<Dispatcher>,
    /// Swallow the first delivery of this sequence but still answer Ack
    drop_once: Option<u32>,
    dropped: AtomicBool,
    /// Flip one byte of this sequence's chunk on every delivery
    corrupt: Option<u32>,
}

impl Loopback {
    fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            drop_once: None,
            dropped: AtomicBool::new(false),
            corrupt: None,
        }
    }
}

#[async_trait]
impl Exchange for Loopback {
    async fn exchange(&self, name: &str) -> Result<Ipv4Addr, DnsError> {
        if let Ok(Message::Data(data)) = protocol::parse_query(name, SUFFIX) {
            if Some(data.seq) == self.drop_once && !self.dropped.swap(true, Ordering::SeqCst) {
                return Ok(Reply::Ack.addr());
            }

            if Some(data.seq) == self.corrupt {
                let mut chunk = data.data.clone();
                chunk[0] ^= 0x01;
                let tampered =
                    protocol::build_data(&data.session_id, data.seq, data.total, &chunk, SUFFIX);
                return Ok(self.dispatcher.handle(&tampered).await.addr());
            }
        }

        Ok(self.dispatcher.handle(name).await.addr())
    }
}

async fn write_source(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, contents).await.unwrap();
    path
}

#[tokio::test]
async fn test_udp_end_to_end() {
    for record_type in [RecordType::A, RecordType::Txt] {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let source = write_source(src.path(), "hello.txt", b"hello world").await;

        let mut config = ExfilConfig::default();
        config.common.domain = SUFFIX.into();
        config.common.passphrase = "k".into();
        config.common.record_type = record_type;
        config.common.kdf = fast_kdf();
        config.receiver.listen = "127.0.0.1:0".parse().unwrap();
        config.receiver.output_dir = out.path().to_path_buf();
        config.receiver.sweep_interval = Duration::from_millis(50);

        let server = dnsexfil::bind_receiver(&config).await.unwrap();
        config.sender.resolver = server.local_addr().unwrap();
        config.sender.backoff_base = Duration::from_millis(5);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let running = tokio::spawn(server.run(shutdown_rx));

        let report = dnsexfil::send_file(&config, &source).await.unwrap();
        assert_eq!(report.resend_rounds, 0);
        assert!(report.chunks >= 1);

        let written = tokio::fs::read(out.path().join("hello.txt")).await.unwrap();
        assert_eq!(written, b"hello world");

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("server should stop on shutdown")
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_dropped_chunk_is_resent_after_incomplete() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let plaintext: Vec<u8> = (0..400u32).map(|i| (i % 251) as u8).collect();
    let source = write_source(src.path(), "data.bin", &plaintext).await;

    let envelope = Envelope::new("k", fast_kdf());
    let file = chunk_file(&source, &envelope, SUFFIX).await.unwrap();
    assert!(file.total() >= 3);

    let mut transport = Loopback::new(dispatcher("k", out.path()));
    transport.drop_once = Some(2);
    let transport = Arc::new(transport);

    let sender = Sender::new(Arc::clone(&transport), SUFFIX, fast_options());
    let report = sender.send(&file).await.unwrap();

    assert!(transport.dropped.load(Ordering::SeqCst));
    assert_eq!(report.resend_rounds, 1);
    assert_eq!(
        tokio::fs::read(out.path().join("data.bin")).await.unwrap(),
        plaintext
    );
}

#[tokio::test]
async fn test_full_resend_fills_gap_and_keeps_stored_chunks() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let plaintext: Vec<u8> = (0..400u32).map(|i| (i * 7 % 256) as u8).collect();
    let source = write_source(src.path(), "gap.bin", &plaintext).await;

    let envelope = Envelope::new("k", fast_kdf());
    let file = chunk_file(&source, &envelope, SUFFIX).await.unwrap();
    assert!(file.total() >= 3);

    let receiver = dispatcher("k", out.path());
    let sid = "5e5510a1";
    let total = file.total();
    let data = |seq: u32| {
        protocol::build_data(sid, seq, total, &file.chunks[seq as usize - 1], SUFFIX)
    };
    let fin = protocol::build_fin(sid, total, &file.checksum, SUFFIX);

    let init = protocol::build_init(sid, total, &file.salt, &file.filename, SUFFIX);
    assert_eq!(receiver.handle(&init).await, Reply::Ack);
    for seq in (1..=total).filter(|&seq| seq != 2) {
        assert_eq!(receiver.handle(&data(seq)).await, Reply::Ack);
    }
    assert_eq!(receiver.handle(&fin).await, Reply::Incomplete);

    let session = receiver.store().get(sid).await.unwrap();
    assert_eq!(session.missing().await, vec![2]);
    let first = session.chunk(1).await.unwrap();
    let third = session.chunk(3).await.unwrap();
    assert!(session.chunk(2).await.is_none());

    for seq in 1..=total {
        assert_eq!(receiver.handle(&data(seq)).await, Reply::Ack);
    }

    assert_eq!(session.chunk(1).await.unwrap(), first);
    assert_eq!(session.chunk(3).await.unwrap(), third);
    assert_eq!(session.chunk(2).await.unwrap(), file.chunks[1]);
    assert!(session.is_complete().await);

    assert_eq!(receiver.handle(&fin).await, Reply::Complete);
    assert!(receiver.store().get(sid).await.is_none());
    assert_eq!(
        tokio::fs::read(out.path().join("gap.bin")).await.unwrap(),
        plaintext
    );
}

#[tokio::test]
async fn test_tampered_chunk_is_nacked_and_session_kept() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let source = write_source(src.path(), "hello.txt", b"hello world").await;

    let envelope = Envelope::new("k", fast_kdf());
    let file = chunk_file(&source, &envelope, SUFFIX).await.unwrap();

    let receiver = dispatcher("k", out.path());
    let mut transport = Loopback::new(Arc::clone(&receiver));
    transport.corrupt = Some(1);

    let sender = Sender::new(Arc::new(transport), SUFFIX, fast_options());
    let err = sender.send_as("7a3f00e1", &file).await.unwrap_err();

    assert!(matches!(
        err,
        SendError::Rejected {
            reply: Reply::Nack,
            ..
        }
    ));
    let session = receiver.store().get("7a3f00e1").await.unwrap();
    assert!(session.is_complete().await);
    assert!(!out.path().join("hello.txt").exists());
}

#[tokio::test]
async fn test_wrong_passphrase_never_yields_plaintext() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let source = write_source(src.path(), "hello.txt", b"hello world").await;

    let file = chunk_file(&source, &Envelope::new("passphrase-a", fast_kdf()), SUFFIX)
        .await
        .unwrap();

    // Assembler directly
    let session = Session::new("00000001", file.filename.clone(), file.salt.to_vec(), file.total());
    for (i, chunk) in file.chunks.iter().enumerate() {
        session.store_chunk(i as u32 + 1, chunk.clone()).await.unwrap();
    }
    let result = Assembler::new(Envelope::new("passphrase-b", fast_kdf()), out.path())
        .assemble(&session, &file.checksum)
        .await;
    assert!(matches!(result, Err(AssembleError::DecryptionFailed(_))));

    // and through the whole exchange
    let transport = Loopback::new(dispatcher("passphrase-b", out.path()));
    let sender = Sender::new(Arc::new(transport), SUFFIX, fast_options());
    assert!(sender.send(&file).await.is_err());
    assert!(!out.path().join("hello.txt").exists());
}
