//! UDP transport for the carrier channel
//!
//! [`UdpResolver`] is the sender's side: one question out, first answer back.
//! [`DnsServer`] is the receiver's authoritative listener; every datagram is
//! handled on its own task and answered through the [`Dispatcher`].

use super::wire::{DnsMessage, RecordType};
use super::{DnsError, Result};
use crate::dispatcher::Dispatcher;
use crate::sender::Exchange;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};

/// Largest datagram we accept or expect back
const MAX_DATAGRAM: usize = 4096;

/// Sends one question per exchange to a fixed resolver
#[derive(Debug, Clone)]
pub struct UdpResolver {
    server: SocketAddr,
    record_type: RecordType,
    timeout: Duration,
}

impl UdpResolver {
    pub fn new(server: SocketAddr, record_type: RecordType, timeout: Duration) -> Self {
        Self {
            server,
            record_type,
            timeout,
        }
    }

    /// Ask for `name` and return the IPv4 address carried by the first answer.
    ///
    /// TXT answers are expected to hold the address in dotted-quad form.
    pub async fn query(&self, name: &str) -> Result<Ipv4Addr> {
        let txid = rand::random::<u16>();
        let query = DnsMessage::new_query(name, self.record_type, txid)?;

        // Match the server's interface for localhost receivers
        let local_addr: SocketAddr = if self.server.is_ipv4() {
            if self.server.ip().is_loopback() {
                "127.0.0.1:0"
            } else {
                "0.0.0.0:0"
            }
        } else if self.server.ip().is_loopback() {
            "[::1]:0"
        } else {
            "[::]:0"
        }
        .parse()
        .map_err(|_| DnsError::InvalidMessage("bad local bind address".into()))?;

        let socket = UdpSocket::bind(local_addr).await?;
        socket.connect(self.server).await?;
        socket.send(&query.to_bytes()).await?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let n = timeout(remaining, socket.recv(&mut buf))
                .await
                .map_err(|_| DnsError::Timeout(self.timeout))??;

            let response = match DnsMessage::parse(&buf[..n]) {
                Ok(response) => response,
                Err(e) => {
                    debug!("Ignoring unparsable datagram from {}: {}", self.server, e);
                    continue;
                }
            };

            if !response.header.is_response() || response.header.id != txid {
                debug!(
                    "Ignoring stray response id {:#06x} (want {:#06x})",
                    response.header.id, txid
                );
                continue;
            }

            return first_address(&response);
        }
    }
}

#[async_trait]
impl Exchange for UdpResolver {
    async fn exchange(&self, name: &str) -> Result<Ipv4Addr> {
        self.query(name).await
    }
}

fn first_address(response: &DnsMessage) -> Result<Ipv4Addr> {
    let answer = response.answers.first().ok_or(DnsError::NoAnswer)?;

    if let Some(addr) = answer.as_ipv4() {
        return Ok(addr);
    }

    if answer.rtype == RecordType::Txt.code() {
        let text = answer.txt_data()?;
        return text
            .trim()
            .parse()
            .map_err(|_| DnsError::UnexpectedAnswer(format!("TXT {:?}", text)));
    }

    Err(DnsError::UnexpectedAnswer(format!(
        "record type {}",
        answer.rtype
    )))
}

/// Authoritative UDP listener for the transfer suffix
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    sweep_interval: Duration,
}

impl DnsServer {
    pub async fn bind(
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        sweep_interval: Duration,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("DNS server listening on UDP {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            dispatcher,
            sweep_interval,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until `shutdown` fires.
    ///
    /// Handlers already running are allowed to finish and the idle-session
    /// sweeper is stopped before this returns.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let sweeper = Arc::clone(self.dispatcher.store())
            .spawn_sweeper(self.sweep_interval, shutdown.resubscribe());

        let mut handlers = JoinSet::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("DNS server shutting down");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (n, src) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            error!("UDP receive error: {}", e);
                            continue;
                        }
                    };

                    let datagram = buf[..n].to_vec();
                    let socket = Arc::clone(&self.socket);
                    let dispatcher = Arc::clone(&self.dispatcher);
                    handlers.spawn(async move {
                        handle_datagram(&socket, &dispatcher, &datagram, src).await;
                    });
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Query handler failed: {}", e);
                    }
                }
            }
        }

        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                warn!("Query handler failed: {}", e);
            }
        }

        if let Err(e) = sweeper.await {
            warn!("Session sweeper failed: {}", e);
        }

        Ok(())
    }
}

async fn handle_datagram(socket: &UdpSocket, dispatcher: &Dispatcher, datagram: &[u8], src: SocketAddr) {
    let query = match DnsMessage::parse(datagram) {
        Ok(query) => query,
        Err(e) => {
            debug!("Dropping malformed datagram from {}: {}", src, e);
            return;
        }
    };

    if query.header.is_response() {
        debug!("Dropping response datagram from {}", src);
        return;
    }

    let response = dispatcher.respond(&query).await;
    if let Err(e) = socket.send_to(&response.to_bytes(), src).await {
        warn!("Failed to answer {}: {}", src, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::wire::DnsRecord;

    /// One-shot responder that answers the first query with `answer_for(query)`
    async fn fake_server<F>(answer_for: F) -> SocketAddr
    where
        F: Fn(&DnsMessage) -> Vec<Vec<u8>> + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let (n, src) = socket.recv_from(&mut buf).await.unwrap();
            let query = DnsMessage::parse(&buf[..n]).unwrap();
            for datagram in answer_for(&query) {
                socket.send_to(&datagram, src).await.unwrap();
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_query_reads_a_answer() {
        let addr = fake_server(|q| {
            let name = q.questions[0].qname.clone();
            let answer = DnsRecord::new_a(&name, Ipv4Addr::new(1, 0, 0, 1), 0);
            vec![DnsMessage::new_response(q, vec![answer]).to_bytes()]
        })
        .await;

        let resolver = UdpResolver::new(addr, RecordType::A, Duration::from_secs(2));
        assert_eq!(
            resolver.query("x.exfil.test").await.unwrap(),
            Ipv4Addr::new(1, 0, 0, 1)
        );
    }

    #[tokio::test]
    async fn test_query_reads_txt_answer_and_skips_stray_ids() {
        let addr = fake_server(|q| {
            let name = q.questions[0].qname.clone();
            let answer = DnsRecord::new_txt(&name, "1.0.0.3", 0);

            let mut stray = DnsMessage::new_response(q, vec![DnsRecord::new_txt(&name, "1.0.0.2", 0)]);
            stray.header.id = q.header.id.wrapping_add(1);

            vec![
                stray.to_bytes(),
                DnsMessage::new_response(q, vec![answer]).to_bytes(),
            ]
        })
        .await;

        let resolver = UdpResolver::new(addr, RecordType::Txt, Duration::from_secs(2));
        assert_eq!(
            resolver.exchange("x.exfil.test").await.unwrap(),
            Ipv4Addr::new(1, 0, 0, 3)
        );
    }

    #[tokio::test]
    async fn test_empty_answer_is_no_answer() {
        let addr = fake_server(|q| vec![DnsMessage::new_response(q, Vec::new()).to_bytes()]).await;

        let resolver = UdpResolver::new(addr, RecordType::A, Duration::from_secs(2));
        assert!(matches!(
            resolver.query("x.exfil.test").await,
            Err(DnsError::NoAnswer)
        ));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let resolver = UdpResolver::new(addr, RecordType::A, Duration::from_millis(100));
        assert!(matches!(
            resolver.query("x.exfil.test").await,
            Err(DnsError::Timeout(_))
        ));
        drop(socket);
    }

    #[tokio::test]
    async fn test_overlong_name_rejected_before_sending() {
        let resolver = UdpResolver::new(
            "127.0.0.1:9".parse().unwrap(),
            RecordType::A,
            Duration::from_millis(100),
        );
        let name = format!("{}.exfil.test", "a".repeat(64));
        assert!(matches!(
            resolver.query(&name).await,
            Err(DnsError::InvalidName(_))
        ));
    }
}
