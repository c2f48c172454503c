//! SIP transaction engine
//!
//! A pull-based engine in the style of RFC 3261 section 17: raw datagrams are
//! fed in, protocol events are drained out, and outgoing datagrams are polled.
//! Server transactions are keyed by top Via branch and method. Retransmission
//! timers are not run; request retransmissions are absorbed by re-sending the
//! last response.
//!
//! `Transaction` handles are shared with routing tasks, so answering one from
//! any task goes through the engine's command channel and is transmitted on
//! the next poll of the owning loop.

use super::builder::{build_ack, reason_phrase, ResponseBuilder};
use super::message::{SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse};
use super::transport::OutgoingMessage;
use crate::domain::shared::CallHandle;
use parking_lot::Mutex;
use rsip::Header;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// How long a transaction may wait for its ACK or final response
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(32);

/// How long a cleared server transaction keeps absorbing retransmissions
pub const LINGER: Duration = Duration::from_secs(32);

static NEXT_TRANSACTION: AtomicU64 = AtomicU64::new(1);

/// Transaction state as seen by the call-control layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransactionState {
    /// New request, not yet looked at
    Trying,
    /// Handed to the application, awaiting an answer
    Process,
    /// Final response sent or received
    Finish,
    /// Done; no further messages will be delivered
    Cleared,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Trying => "Trying",
            TransactionState::Process => "Process",
            TransactionState::Finish => "Finish",
            TransactionState::Cleared => "Cleared",
        };
        f.write_str(name)
    }
}

/// Work queued for the engine by transaction handles
#[derive(Debug)]
pub enum EngineCommand {
    Respond {
        transaction: Transaction,
        response: SipResponse,
    },
    NewClient(Transaction),
}

#[derive(Debug)]
struct TransactionData {
    state: TransactionState,
    final_response: Option<(u16, String)>,
    last_response: Option<SipResponse>,
    recent: Option<SipMessage>,
    user_data: Option<CallHandle>,
    finished_at: Option<Instant>,
    cleared_at: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    id: u64,
    incoming: bool,
    method: String,
    request: SipRequest,
    branch: String,
    local_tag: String,
    peer: SocketAddr,
    created_at: Instant,
    commands: mpsc::UnboundedSender<EngineCommand>,
    data: Mutex<TransactionData>,
}

/// Counted handle to one request/response exchange
#[derive(Clone)]
pub struct Transaction(Arc<Inner>);

impl Transaction {
    fn new(
        incoming: bool,
        request: SipRequest,
        peer: SocketAddr,
        local_tag: String,
        commands: mpsc::UnboundedSender<EngineCommand>,
    ) -> Self {
        let state = if incoming {
            TransactionState::Trying
        } else {
            TransactionState::Process
        };
        let recent = SipMessage::Request(request.clone());
        Self(Arc::new(Inner {
            id: NEXT_TRANSACTION.fetch_add(1, Ordering::Relaxed),
            incoming,
            method: request.method_name(),
            branch: request.branch().unwrap_or_default(),
            request,
            local_tag,
            peer,
            created_at: Instant::now(),
            commands,
            data: Mutex::new(TransactionData {
                state,
                final_response: None,
                last_response: None,
                recent: Some(recent),
                user_data: None,
                finished_at: None,
                cleared_at: None,
            }),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn method(&self) -> &str {
        &self.0.method
    }

    pub fn is_invite(&self) -> bool {
        self.0.method == SipMethod::Invite.as_str()
    }

    pub fn is_incoming(&self) -> bool {
        self.0.incoming
    }

    pub fn is_outgoing(&self) -> bool {
        !self.0.incoming
    }

    pub fn call_id(&self) -> String {
        self.0.request.call_id().unwrap_or_default()
    }

    pub fn initial_request(&self) -> &SipRequest {
        &self.0.request
    }

    /// Tag this side puts in the To header of its responses
    pub fn local_tag(&self) -> &str {
        &self.0.local_tag
    }

    /// Transport address of the other side
    pub fn peer(&self) -> SocketAddr {
        self.0.peer
    }

    pub fn state(&self) -> TransactionState {
        self.0.data.lock().state
    }

    pub fn recent_message(&self) -> Option<SipMessage> {
        self.0.data.lock().recent.clone()
    }

    /// Final status code and reason, once answered (or answered to us)
    pub fn final_response(&self) -> Option<(u16, String)> {
        self.0.data.lock().final_response.clone()
    }

    pub fn is_answered(&self) -> bool {
        self.0.data.lock().final_response.is_some()
    }

    /// Connection bound to this transaction
    pub fn user_data(&self) -> Option<CallHandle> {
        self.0.data.lock().user_data.clone()
    }

    pub fn set_user_data(&self, handle: Option<CallHandle>) {
        self.0.data.lock().user_data = handle;
    }

    /// Response builder pre-filled with this transaction's local tag
    pub fn response(&self, code: u16) -> ResponseBuilder {
        ResponseBuilder::new(code).to_tag(Some(self.0.local_tag.clone()))
    }

    /// Answer with a status code. Returns false if the transaction was
    /// already finally answered or cleared.
    pub fn set_response(&self, code: u16, reason: &str) -> bool {
        let response = self
            .response(code)
            .reason(reason)
            .build_for_request(&self.0.request);
        self.answer(response, reason)
    }

    /// Answer with a complete response message
    pub fn set_response_message(&self, response: SipResponse) -> bool {
        let reason = reason_phrase(response.status_code()).to_string();
        self.answer(response, &reason)
    }

    fn answer(&self, response: SipResponse, reason: &str) -> bool {
        if !self.0.incoming {
            warn!("Attempt to answer outgoing {} transaction {}", self.0.method, self.0.id);
            return false;
        }
        let code = response.status_code();
        {
            let mut data = self.0.data.lock();
            if data.state == TransactionState::Cleared || data.final_response.is_some() {
                debug!(
                    "Transaction {} already answered, dropping {} {}",
                    self.0.id, code, reason
                );
                return false;
            }
            if code >= 200 {
                data.state = TransactionState::Finish;
                data.final_response = Some((code, reason.to_string()));
                data.finished_at = Some(Instant::now());
            }
            data.last_response = Some(response.clone());
        }
        debug!("Transaction {} answered {} {}", self.0.id, code, reason);
        self.0
            .commands
            .send(EngineCommand::Respond {
                transaction: self.clone(),
                response,
            })
            .is_ok()
    }

    fn set_state(&self, state: TransactionState) {
        let mut data = self.0.data.lock();
        if state == TransactionState::Cleared && data.state != TransactionState::Cleared {
            data.cleared_at = Some(Instant::now());
        }
        data.state = state;
    }

    fn set_recent(&self, message: SipMessage) {
        self.0.data.lock().recent = Some(message);
    }

    fn last_response(&self) -> Option<SipResponse> {
        self.0.data.lock().last_response.clone()
    }

    fn record_remote_final(&self, code: u16) {
        let mut data = self.0.data.lock();
        if data.final_response.is_none() {
            data.final_response = Some((code, reason_phrase(code).to_string()));
            data.finished_at = Some(Instant::now());
        }
    }

    fn cleared_at(&self) -> Option<Instant> {
        self.0.data.lock().cleared_at
    }

    /// Whether the transaction has waited too long for its ACK (answered
    /// INVITE) or for any response at all (our own requests)
    fn is_expired(&self, now: Instant) -> bool {
        let data = self.0.data.lock();
        match data.state {
            TransactionState::Finish if self.0.incoming && self.is_invite() => data
                .finished_at
                .map_or(false, |at| now.duration_since(at) >= TRANSACTION_TIMEOUT),
            TransactionState::Process if !self.0.incoming => {
                matches!(data.recent, Some(SipMessage::Request(_)))
                    && now.duration_since(self.0.created_at) >= TRANSACTION_TIMEOUT
            }
            _ => false,
        }
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Transaction {}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.0.id)
            .field("method", &self.0.method)
            .field("incoming", &self.0.incoming)
            .field("state", &self.state())
            .finish()
    }
}

/// One protocol event drained from the engine
#[derive(Debug, Clone)]
pub struct SipEvent {
    pub transaction: Transaction,
    /// Transaction state when the event was produced
    pub state: TransactionState,
    pub message: Option<SipMessage>,
    /// Whether `message` arrived from the network
    pub incoming: bool,
}

impl SipEvent {
    /// New request that nobody has looked at yet
    pub fn is_new_request(&self) -> bool {
        self.state == TransactionState::Trying
            && self.incoming
            && self.transaction.is_incoming()
            && self.message.as_ref().map_or(false, SipMessage::is_request)
    }
}

/// Cloneable access to the engine for tasks that do not own it
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    local_addr: SocketAddr,
}

impl EngineHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start a client transaction for `request`, bound to `user_data`
    /// before the engine can see any response to it
    pub fn send_request(
        &self,
        request: SipRequest,
        destination: SocketAddr,
        user_data: Option<CallHandle>,
    ) -> Transaction {
        let local_tag = request.from_tag().unwrap_or_default();
        let transaction = Transaction::new(
            false,
            request,
            destination,
            local_tag,
            self.commands.clone(),
        );
        transaction.set_user_data(user_data);
        if self
            .commands
            .send(EngineCommand::NewClient(transaction.clone()))
            .is_err()
        {
            warn!("Transaction engine is gone, {} not sent", transaction.method());
            transaction.set_state(TransactionState::Cleared);
        }
        transaction
    }
}

/// Contract between the event loop and the protocol engine
pub trait TransactionEngine: Send {
    /// Queue a received datagram for parsing
    fn feed(&mut self, data: &[u8], source: SocketAddr);

    fn next_event(&mut self) -> Option<SipEvent>;

    /// Default handling of an event the application did not consume
    fn process_event(&mut self, event: SipEvent);

    fn poll_transmit(&mut self) -> Option<OutgoingMessage>;

    /// Expire waiting transactions
    fn tick(&mut self, now: Instant);

    fn handle(&self) -> EngineHandle;
}

type TransactionKey = (String, String);

/// UDP transaction engine
pub struct SipEngine {
    handle: EngineHandle,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    server: HashMap<TransactionKey, Transaction>,
    client: HashMap<TransactionKey, Transaction>,
    events: VecDeque<SipEvent>,
    outbox: VecDeque<OutgoingMessage>,
    allow: String,
}

impl SipEngine {
    pub fn new(local_addr: SocketAddr, allow_register: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut allow = vec!["INVITE", "ACK", "BYE", "CANCEL"];
        if allow_register {
            allow.push("REGISTER");
        }
        Self {
            handle: EngineHandle {
                commands: tx,
                local_addr,
            },
            commands: rx,
            server: HashMap::new(),
            client: HashMap::new(),
            events: VecDeque::new(),
            outbox: VecDeque::new(),
            allow: allow.join(", "),
        }
    }

    pub fn active_transactions(&self) -> usize {
        self.server
            .values()
            .chain(self.client.values())
            .filter(|t| t.state() != TransactionState::Cleared)
            .count()
    }

    fn transmit(&mut self, data: bytes::Bytes, destination: SocketAddr) {
        self.outbox.push_back(OutgoingMessage { data, destination });
    }

    fn clear(&mut self, transaction: &Transaction) {
        if transaction.state() == TransactionState::Cleared {
            return;
        }
        transaction.set_state(TransactionState::Cleared);
        debug!(
            "Transaction {} {} cleared",
            transaction.id(),
            transaction.method()
        );
        self.events.push_back(SipEvent {
            transaction: transaction.clone(),
            state: TransactionState::Cleared,
            message: None,
            incoming: false,
        });
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                EngineCommand::Respond {
                    transaction,
                    response,
                } => {
                    let code = response.status_code();
                    self.transmit(response.to_bytes(), transaction.peer());
                    if code >= 200 && !transaction.is_invite() {
                        self.clear(&transaction);
                    }
                }
                EngineCommand::NewClient(transaction) => {
                    let request = transaction.initial_request();
                    let key = (transaction.0.branch.clone(), transaction.method().to_string());
                    self.transmit(request.to_bytes(), transaction.peer());
                    debug!(
                        "Sent {} to {} (transaction {})",
                        transaction.method(),
                        transaction.peer(),
                        transaction.id()
                    );
                    self.client.insert(key, transaction);
                }
            }
        }
    }

    fn on_request(&mut self, request: SipRequest, source: SocketAddr) {
        let method = request.method_name();
        let Some(branch) = request.branch() else {
            warn!("Dropping {} from {} without Via branch", method, source);
            return;
        };

        if method == SipMethod::Ack.as_str() {
            self.on_ack(request, branch);
            return;
        }

        let key = (branch, method.clone());
        if let Some(existing) = self.server.get(&key) {
            trace!("Retransmitted {} on transaction {}", method, existing.id());
            if let Some(response) = existing.last_response() {
                let peer = existing.peer();
                self.transmit(response.to_bytes(), peer);
            }
            return;
        }

        let local_tag = request
            .to_tag()
            .unwrap_or_else(super::builder::generate_tag);
        let transaction = Transaction::new(
            true,
            request.clone(),
            source,
            local_tag,
            self.handle.commands.clone(),
        );
        debug!(
            "New {} transaction {} from {}",
            method,
            transaction.id(),
            source
        );

        if transaction.is_invite() {
            let trying = ResponseBuilder::new(100).build_for_request(&request);
            self.transmit(trying.to_bytes(), source);
        }

        self.server.insert(key, transaction.clone());
        self.events.push_back(SipEvent {
            transaction,
            state: TransactionState::Trying,
            message: Some(SipMessage::Request(request)),
            incoming: true,
        });
    }

    fn on_ack(&mut self, ack: SipRequest, branch: String) {
        let by_branch = self
            .server
            .get(&(branch, SipMethod::Invite.as_str().to_string()))
            .cloned();
        let invite = by_branch.or_else(|| {
            let call_id = ack.call_id();
            let seq = ack.cseq().map(|(seq, _)| seq);
            self.server
                .values()
                .find(|t| {
                    t.is_invite()
                        && t.state() == TransactionState::Finish
                        && Some(t.call_id()) == call_id
                        && t.initial_request().cseq().map(|(s, _)| s) == seq
                })
                .cloned()
        });

        match invite {
            Some(invite) if invite.state() == TransactionState::Finish => {
                let message = SipMessage::Request(ack);
                invite.set_recent(message.clone());
                self.events.push_back(SipEvent {
                    transaction: invite.clone(),
                    state: TransactionState::Finish,
                    message: Some(message),
                    incoming: true,
                });
                self.clear(&invite);
            }
            _ => trace!("Ignoring ACK without pending INVITE"),
        }
    }

    fn on_response(&mut self, response: SipResponse) {
        let (Some(branch), Some((_, method))) = (response.branch(), response.cseq()) else {
            warn!("Dropping response without Via branch or CSeq");
            return;
        };
        let Some(transaction) = self.client.get(&(branch, method)).cloned() else {
            trace!("No client transaction for {} response", response.status_code());
            return;
        };
        if transaction.state() == TransactionState::Cleared {
            return;
        }

        let code = response.status_code();
        let message = SipMessage::Response(response.clone());
        transaction.set_recent(message.clone());
        if code >= 200 {
            transaction.record_remote_final(code);
            transaction.set_state(TransactionState::Finish);
        }
        self.events.push_back(SipEvent {
            transaction: transaction.clone(),
            state: transaction.state(),
            message: Some(message),
            incoming: true,
        });

        if code >= 200 {
            if transaction.is_invite() {
                let ack = build_ack(transaction.initial_request(), &response);
                self.transmit(ack.to_bytes(), transaction.peer());
            }
            self.clear(&transaction);
        }
    }
}

impl TransactionEngine for SipEngine {
    fn feed(&mut self, data: &[u8], source: SocketAddr) {
        match SipMessage::parse(data) {
            Ok(SipMessage::Request(request)) => self.on_request(request, source),
            Ok(SipMessage::Response(response)) => self.on_response(response),
            Err(e) => warn!("Failed to parse SIP message from {}: {}", source, e),
        }
    }

    fn next_event(&mut self) -> Option<SipEvent> {
        self.drain_commands();
        let event = self.events.pop_front()?;
        if event.state == TransactionState::Trying
            && event.transaction.state() == TransactionState::Trying
        {
            event.transaction.set_state(TransactionState::Process);
        }
        Some(event)
    }

    fn process_event(&mut self, event: SipEvent) {
        if !event.is_new_request() || event.transaction.is_answered() {
            return;
        }
        debug!(
            "Unhandled {} transaction {}, answering 405",
            event.transaction.method(),
            event.transaction.id()
        );
        let response = event
            .transaction
            .response(405)
            .header(Header::Allow(rsip::headers::Allow::from(self.allow.clone())))
            .build_for_request(event.transaction.initial_request());
        event.transaction.set_response_message(response);
        self.drain_commands();
    }

    fn poll_transmit(&mut self) -> Option<OutgoingMessage> {
        self.drain_commands();
        self.outbox.pop_front()
    }

    fn tick(&mut self, now: Instant) {
        self.drain_commands();

        let expired: Vec<Transaction> = self
            .server
            .values()
            .chain(self.client.values())
            .filter(|t| t.is_expired(now))
            .cloned()
            .collect();
        for transaction in expired {
            if transaction.is_outgoing() {
                transaction.record_remote_final(408);
            }
            debug!("Transaction {} timed out", transaction.id());
            self.clear(&transaction);
        }

        let lingering = |t: &Transaction| t.cleared_at().map_or(true, |at| now.duration_since(at) < LINGER);
        self.server.retain(|_, t| lingering(t));
        self.client.retain(|_, t| lingering(t));
    }

    fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }
}
