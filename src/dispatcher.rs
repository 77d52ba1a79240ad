//! Receiver-side routing of carrier names to session operations
//!
//! Every failure here is local to one exchange: it becomes a Nack (or
//! Incomplete) on the wire and a log line, never an error to the listener.

use crate::assembler::Assembler;
use crate::dns::wire::{DnsMessage, DnsRecord, RecordType};
use crate::protocol::{self, DataMessage, FinMessage, InitMessage, Message, Reply};
use crate::session::{Session, SessionStore};
use log::{debug, info, warn};
use std::sync::Arc;

/// Answers are never worth caching
const ANSWER_TTL: u32 = 0;

pub struct Dispatcher {
    suffix: String,
    store: Arc<SessionStore>,
    assembler: Assembler,
}

impl Dispatcher {
    pub fn new(suffix: impl Into<String>, store: Arc<SessionStore>, assembler: Assembler) -> Self {
        Self {
            suffix: suffix.into().trim_end_matches('.').to_ascii_lowercase(),
            store,
            assembler,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Answer a DNS query.
    ///
    /// Queries without a question or with an unsupported type get an empty
    /// response; everything else gets exactly one record echoing the name.
    pub async fn respond(&self, query: &DnsMessage) -> DnsMessage {
        let question = match query.first_question() {
            Some(q) => q,
            None => return DnsMessage::new_response(query, Vec::new()),
        };

        let record_type = match question.record_type() {
            Some(rt) => rt,
            None => {
                debug!(
                    "Unsupported query type {} for {}",
                    question.qtype, question.qname
                );
                return DnsMessage::new_response(query, Vec::new());
            }
        };

        let reply = self.handle(&question.qname).await;
        let record = match record_type {
            RecordType::A => DnsRecord::new_a(&question.qname, reply.addr(), ANSWER_TTL),
            RecordType::Txt => {
                DnsRecord::new_txt(&question.qname, &reply.addr().to_string(), ANSWER_TTL)
            }
        };

        DnsMessage::new_response(query, vec![record])
    }

    /// Route one question name and return the sentinel to answer with
    pub async fn handle(&self, name: &str) -> Reply {
        match protocol::parse_query(name, &self.suffix) {
            Ok(Message::Init(init)) => self.on_init(init).await,
            Ok(Message::Data(data)) => self.on_data(data).await,
            Ok(Message::Fin(fin)) => self.on_fin(fin).await,
            Err(e) => {
                debug!("Rejecting query {}: {}", name, e);
                Reply::Nack
            }
        }
    }

    async fn on_init(&self, init: InitMessage) -> Reply {
        info!(
            "[{}] New transfer: {:?} ({} chunks)",
            init.session_id, init.filename, init.total
        );
        self.store
            .create(Session::new(
                init.session_id,
                init.filename,
                init.salt,
                init.total,
            ))
            .await;
        Reply::Ack
    }

    async fn on_data(&self, data: DataMessage) -> Reply {
        let session = match self.store.get(&data.session_id).await {
            Some(s) => s,
            None => {
                warn!("[{}] Data for unknown session", data.session_id);
                return Reply::Nack;
            }
        };

        if data.total != session.total() {
            warn!(
                "[{}] Data declares {} chunks, session has {}",
                data.session_id,
                data.total,
                session.total()
            );
            return Reply::Nack;
        }

        let len = data.data.len();
        match session.store_chunk(data.seq, data.data).await {
            Ok(()) => {
                debug!(
                    "[{}] Chunk {}/{} ({} bytes)",
                    data.session_id, data.seq, data.total, len
                );
                Reply::Ack
            }
            Err(e) => {
                warn!("[{}] Chunk rejected: {}", data.session_id, e);
                Reply::Nack
            }
        }
    }

    async fn on_fin(&self, fin: FinMessage) -> Reply {
        let session = match self.store.get(&fin.session_id).await {
            Some(s) => s,
            None => {
                warn!("[{}] Fin for unknown session", fin.session_id);
                return Reply::Nack;
            }
        };

        if !session.is_complete().await {
            let missing = session.missing().await;
            warn!(
                "[{}] Fin with {} of {} chunks missing: {:?}",
                fin.session_id,
                missing.len(),
                session.total(),
                missing
            );
            return Reply::Incomplete;
        }

        match self.assembler.assemble(&session, &fin.checksum).await {
            Ok(path) => {
                self.store.remove_if_same(&session).await;
                info!(
                    "[{}] Transfer complete after {:?}: {}",
                    fin.session_id,
                    session.age(),
                    path.display()
                );
                Reply::Complete
            }
            Err(e) => {
                // session stays so a corrected resend can finish it
                warn!("[{}] Assembly failed: {}", fin.session_id, e);
                Reply::Nack
            }
        }
    }
}
