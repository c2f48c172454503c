//! Per-dialog call state machine
//!
//! A `Connection` owns one SIP dialog from the initial INVITE until it is
//! cleared. The event loop feeds it transaction events through `process`;
//! host requests (answer, ringing, hangup) arrive through the facade or
//! the routing task. Work that has to wait on the bus is split into a
//! snapshot taken under the connection lock, the awaited dispatch with the
//! lock released, and a re-check before the result is applied.

use super::builder::{
    build_cancel, generate_branch, generate_call_id, generate_tag, reason_phrase,
    RequestBuilder,
};
use super::context::{SipContext, SDP_OWNER};
use super::dialog::{uri_text, Dialog};
use super::message::{SipError, SipHeaders, SipMessage, SipMethod};
use super::sdp::{parse_offer, MediaOffer, SdpBuilder};
use super::transaction::{SipEvent, Transaction, TransactionState};
use crate::domain::shared::{CallDirection, CallHandle, DomainError, SipUri};
use crate::infrastructure::bus::{
    BusReply, BusRequest, CallEvent, CallEventKind, ExecuteRequest, MediaForward,
    RelayRequest, RouteRequest,
};
use crate::infrastructure::media::codec::{Codec, CodecList};
use parking_lot::{Mutex, MutexGuard};
use rsip::{Header, Method};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEFAULT_REASON: &str = "Request Terminated";
const DEFAULT_CODE: u16 = 487;
const DEFAULT_SIP_PORT: u16 = 5060;

/// Progress of a call leg, ordered so later stages compare greater
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallState {
    Incoming,
    Outgoing,
    Ringing,
    Established,
    Cleared,
}

/// Who still owes a BYE on teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByeState {
    /// Dialog not confirmed yet, nothing to send
    Unconfirmed,
    /// Confirmed both ways; teardown must send a BYE
    Confirmed,
    ByeSent,
    ByeReceived,
}

/// How media is anchored for this call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayState {
    Unallocated,
    /// Endpoints exchange media directly
    PassThrough,
    /// Local relay chosen but not allocated until the remote end is known
    Placeholder,
    Allocated(String),
}

impl RelayState {
    pub fn is_local(&self) -> bool {
        matches!(self, RelayState::Placeholder | RelayState::Allocated(_))
    }
}

/// Bus work `process` asks the caller to run off the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    StartRelay,
    AnnounceRinging,
    AnnounceAnswered,
}

/// One SIP call leg: its dialog, the INVITE transaction it is bound to and
/// the media relay anchoring its audio.
///
/// Always reached through a [`ConnectionRef`]. The connection lock is taken
/// before the registry lock and is never held across an await.
pub struct Connection {
    handle: CallHandle,
    ctx: Arc<SipContext>,
    direction: CallDirection,
    state: CallState,
    bye: ByeState,
    dialog: Dialog,
    transaction: Option<Transaction>,
    target: Option<String>,
    /// Request-URI for requests we send inside the dialog
    remote_uri: String,
    /// Transport destination for requests we send inside the dialog
    party: SocketAddr,
    local_ip: IpAddr,
    local_cseq: u32,
    remote: MediaOffer,
    format: Option<Codec>,
    relay: RelayState,
    relay_address: Option<String>,
    local_port: Option<u16>,
    sdp: SdpBuilder,
    reason: String,
    code: u16,
}

/// Shared handle to a connection; the handle is readable without locking
#[derive(Clone)]
pub struct ConnectionRef {
    handle: CallHandle,
    inner: Arc<Mutex<Connection>>,
}

impl ConnectionRef {
    fn new(connection: Connection) -> Self {
        Self {
            handle: connection.handle.clone(),
            inner: Arc::new(Mutex::new(connection)),
        }
    }

    pub fn handle(&self) -> &CallHandle {
        &self.handle
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.inner.lock()
    }
}

impl fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionRef").field(&self.handle).finish()
    }
}

/// Transport address of a Contact, when it names an IP literal
fn contact_address(contact: &str) -> Option<SocketAddr> {
    let uri = SipUri::parse(contact).ok()?;
    let ip: IpAddr = uri.host().parse().ok()?;
    Some(SocketAddr::new(ip, uri.port().unwrap_or(DEFAULT_SIP_PORT)))
}

impl Connection {
    /// Build the leg for a routed inbound INVITE and register it
    pub async fn incoming(
        ctx: &Arc<SipContext>,
        transaction: &Transaction,
        route: &RouteRequest,
    ) -> Result<ConnectionRef, DomainError> {
        let request = transaction.initial_request();
        let dialog = Dialog::from_incoming(request, Some(transaction.local_tag().to_string()));
        let contact = request.contact();
        let party = match contact.as_deref().and_then(contact_address) {
            Some(addr) if !ctx.settings.ignore_via => addr,
            _ => transaction.peer(),
        };
        let remote = request
            .sdp()
            .map(|body| parse_offer(body, &ctx.codecs))
            .unwrap_or_default();
        let local_ip = ctx.local_ip_for(transaction.peer()).await;

        let handle = CallHandle::generate();
        let connection = Connection {
            handle: handle.clone(),
            ctx: ctx.clone(),
            direction: CallDirection::Inbound,
            state: CallState::Incoming,
            bye: ByeState::Unconfirmed,
            remote_uri: contact
                .map(|c| uri_text(&c))
                .unwrap_or_else(|| dialog.remote_uri.clone()),
            dialog: dialog.clone(),
            transaction: Some(transaction.clone()),
            target: None,
            party,
            local_ip,
            local_cseq: 0,
            format: remote.codecs.first(),
            remote,
            relay: RelayState::Unallocated,
            relay_address: None,
            local_port: None,
            sdp: SdpBuilder::new(SDP_OWNER),
            reason: DEFAULT_REASON.to_string(),
            code: DEFAULT_CODE,
        };

        let connection = ConnectionRef::new(connection);
        ctx.registry.insert(handle.clone(), dialog, connection.clone())?;
        transaction.set_user_data(Some(handle.clone()));

        info!(
            "Incoming call {} from {} to {} ({})",
            handle,
            route.caller.as_deref().unwrap_or("-"),
            route.called.as_deref().unwrap_or("-"),
            party
        );
        ctx.publish(CallEvent::new(
            handle,
            None,
            CallEventKind::Started {
                address: party.to_string(),
                direction: CallDirection::Inbound,
            },
        ));
        Ok(connection)
    }

    /// Place a call to a `sip/<uri>` destination. The INVITE offers the
    /// caller's media directly when a complete forward is supplied,
    /// otherwise a local relay if the bus grants one.
    pub async fn outgoing(
        ctx: &Arc<SipContext>,
        request: ExecuteRequest,
    ) -> Result<ConnectionRef, SipError> {
        let uri = request
            .callto
            .strip_prefix(CallHandle::PREFIX)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                SipError::InvalidMessage(format!("Not a SIP destination: {}", request.callto))
            })?
            .to_string();
        let target = SipUri::parse(&uri).map_err(SipError::ParseError)?;

        let host = request
            .host
            .clone()
            .unwrap_or_else(|| target.host().to_string());
        let port = request
            .port
            .or(target.port())
            .unwrap_or(DEFAULT_SIP_PORT);
        let party = tokio::net::lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| SipError::TransportError(format!("Cannot resolve {}", host)))?;

        let local_ip = ctx.local_ip_for(party).await;
        let local = SocketAddr::new(local_ip, ctx.engine.local_addr().port());
        let caller = request.caller.clone().unwrap_or_else(|| "anonymous".to_string());
        let domain = request
            .domain
            .clone()
            .unwrap_or_else(|| local_ip.to_string());
        let from_uri = format!("sip:{}@{}", caller, domain);
        let contact = format!("sip:{}@{}", caller, local);

        let handle = CallHandle::generate();
        let mut connection = Connection {
            handle: handle.clone(),
            ctx: ctx.clone(),
            direction: CallDirection::Outbound,
            state: CallState::Outgoing,
            bye: ByeState::Unconfirmed,
            dialog: Dialog::default(),
            transaction: None,
            target: request.id.clone(),
            remote_uri: uri.clone(),
            party,
            local_ip,
            local_cseq: 1,
            remote: MediaOffer::default(),
            format: None,
            relay: RelayState::Unallocated,
            relay_address: None,
            local_port: None,
            sdp: SdpBuilder::new(SDP_OWNER),
            reason: DEFAULT_REASON.to_string(),
            code: DEFAULT_CODE,
        };

        let formats = request.formats.clone().unwrap_or_default();
        let body = match connection.pass_through_sdp(request.forward.as_ref()) {
            Some(body) => Some(body),
            None => {
                let allocate = RelayRequest {
                    call: handle.clone(),
                    relay_id: None,
                    remote_ip: None,
                    remote_port: None,
                    format: formats.first(),
                    start: false,
                };
                let reply = ctx.bus.dispatch(BusRequest::RelayAllocate(allocate)).await;
                if !connection.take_relay_grant(reply) {
                    debug!("No relay for {}, offering held media", handle);
                }
                connection.build_local_sdp(&formats, None)
            }
        };

        let mut builder = RequestBuilder::new(Method::Invite, &uri)?
            .via(local, &generate_branch())
            .from_party(&from_uri, &generate_tag())
            .to_party(&uri, None)
            .call_id(&generate_call_id(&local_ip.to_string()))
            .cseq(connection.local_cseq)
            .contact(&contact)
            .user_agent(&ctx.settings.user_agent);
        if let Some(body) = body {
            builder = builder.sdp(body);
        }
        let invite = builder.build();
        connection.dialog = Dialog::from_outgoing(&invite);

        let dialog = connection.dialog.clone();
        let connection = ConnectionRef::new(connection);
        ctx.registry
            .insert(handle.clone(), dialog, connection.clone())
            .map_err(|e| SipError::Internal(e.to_string()))?;

        {
            // hold the lock so events for the new transaction wait for it
            let mut conn = connection.lock();
            conn.transaction = Some(ctx.engine.send_request(invite, party, Some(handle.clone())));
        }

        info!("Outgoing call {} to {} via {}", handle, uri, party);
        ctx.publish(CallEvent::new(
            handle,
            request.id,
            CallEventKind::Started {
                address: party.to_string(),
                direction: CallDirection::Outbound,
            },
        ));
        Ok(connection)
    }

    pub fn handle(&self) -> &CallHandle {
        &self.handle
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn bye_state(&self) -> ByeState {
        self.bye
    }

    pub fn dialog(&self) -> &Dialog {
        &self.dialog
    }

    pub fn relay(&self) -> &RelayState {
        &self.relay
    }

    pub fn remote_media(&self) -> &MediaOffer {
        &self.remote
    }

    pub fn format(&self) -> Option<Codec> {
        self.format
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn set_target(&mut self, target: Option<String>) {
        self.target = target;
    }

    pub fn reason(&self) -> (&str, u16) {
        (&self.reason, self.code)
    }

    pub fn set_reason(&mut self, reason: &str, code: u16) {
        self.reason = reason.to_string();
        self.code = code;
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    fn publish(&self, kind: CallEventKind) {
        self.ctx
            .publish(CallEvent::new(self.handle.clone(), self.target.clone(), kind));
    }

    /// Remote media as learned from the last SDP, for the other leg
    fn forward(&self) -> Option<MediaForward> {
        Some(MediaForward {
            address: self.remote.address.clone()?,
            port: self.remote.port,
            codecs: self.remote.codecs.clone(),
        })
    }

    /// Inbound INVITE still waiting for our final answer
    fn pending_incoming(&self) -> Option<Transaction> {
        self.transaction
            .clone()
            .filter(|tr| tr.is_incoming() && tr.state() == TransactionState::Process)
    }

    fn local_contact(&self) -> String {
        format!(
            "<sip:{}>",
            SocketAddr::new(self.local_ip, self.ctx.engine.local_addr().port())
        )
    }

    /// Offer of the other leg's media, switching this call to pass-through
    fn pass_through_sdp(&mut self, forward: Option<&MediaForward>) -> Option<String> {
        let forward = forward.filter(|f| f.is_complete())?;
        let body = self.sdp.build(
            Some(&forward.address),
            forward.port,
            &forward.codecs,
            None,
            &self.ctx.codecs,
        )?;
        self.release_relay();
        self.relay = RelayState::PassThrough;
        Some(body)
    }

    fn build_local_sdp(&mut self, formats: &CodecList, chosen: Option<Codec>) -> Option<String> {
        let address = self
            .relay_address
            .clone()
            .unwrap_or_else(|| self.local_ip.to_string());
        self.sdp.build(
            Some(&address),
            self.local_port,
            formats,
            chosen,
            &self.ctx.codecs,
        )
    }

    /// Relay request carrying the best known remote end, if any
    fn relay_request(&self, start: bool) -> Option<RelayRequest> {
        let remote_ip = self.remote.address.clone()?;
        Some(RelayRequest {
            call: self.handle.clone(),
            relay_id: None,
            remote_ip: Some(remote_ip),
            remote_port: self.remote.port,
            format: self.format,
            start,
        })
    }

    /// Adopt a relay grant; returns whether one was given
    fn take_relay_grant(&mut self, reply: Option<BusReply>) -> bool {
        match reply {
            Some(BusReply::Relay(grant)) => {
                debug!("Call {} got relay {}", self.handle, grant.relay_id);
                self.relay = RelayState::Allocated(grant.relay_id);
                if grant.local_ip.is_some() {
                    self.relay_address = grant.local_ip;
                }
                self.local_port = grant.local_port;
                if grant.format.is_some() {
                    self.format = grant.format;
                }
                true
            }
            _ => false,
        }
    }

    fn release_relay(&mut self) {
        if let RelayState::Allocated(relay_id) =
            std::mem::replace(&mut self.relay, RelayState::Unallocated)
        {
            debug!("Call {} releasing relay {}", self.handle, relay_id);
            self.local_port = None;
            self.publish(CallEventKind::RelayReleased { relay_id });
        }
    }

    /// Sever the transaction link, answering it if it is ours and unanswered
    fn clear_transaction(&mut self) {
        let Some(transaction) = self.transaction.take() else {
            return;
        };
        transaction.set_user_data(None);
        if transaction.is_incoming() {
            transaction.set_response(self.code, &self.reason);
        }
    }

    fn update_dialog(&mut self) {
        if let Err(e) = self
            .ctx
            .registry
            .update_dialog(&self.handle, self.dialog.clone())
        {
            warn!("Call {} cannot re-key dialog {}: {}", self.handle, self.dialog, e);
        }
    }

    /// Handle one event of the bound transaction. Returns bus work to run
    /// outside the event loop.
    pub fn process(&mut self, event: &SipEvent) -> Vec<Followup> {
        let mut followups = Vec::new();
        if self.transaction.as_ref() != Some(&event.transaction) {
            debug!("Call {} ignoring event of stale transaction", self.handle);
            return followups;
        }

        if event.state == TransactionState::Cleared {
            let transaction = self.transaction.take();
            if let Some(tr) = &transaction {
                tr.set_user_data(None);
            }
            if self.state != CallState::Established {
                if let Some((code, reason)) = transaction
                    .filter(Transaction::is_outgoing)
                    .and_then(|tr| tr.final_response())
                    .filter(|(code, _)| *code >= 300)
                {
                    self.set_reason(&reason, code);
                }
                self.hangup();
            }
            return followups;
        }

        let Some(message) = &event.message else {
            return followups;
        };

        if let Some(body) = message.sdp() {
            self.remote = parse_offer(body, &self.ctx.codecs);
            self.format = self.remote.codecs.first();
            debug!(
                "Call {} remote media {:?}:{:?} [{}]",
                self.handle, self.remote.address, self.remote.port, self.remote.codecs
            );
        }

        match message {
            SipMessage::Response(response) if event.transaction.is_outgoing() => {
                if self.dialog.learn_remote_tag(response) {
                    self.update_dialog();
                }
                let code = response.status_code();
                if response.is_success() && self.state < CallState::Established {
                    self.state = CallState::Established;
                    self.bye = ByeState::Confirmed;
                    if let Some(contact) = response.contact() {
                        self.remote_uri = uri_text(&contact);
                        if !self.ctx.settings.ignore_via {
                            if let Some(addr) = contact_address(&contact) {
                                self.party = addr;
                            }
                        }
                    }
                    info!("Call {} answered by {}", self.handle, self.remote_uri);
                    followups.push(Followup::AnnounceAnswered);
                } else if code == 180 && self.state < CallState::Ringing {
                    self.state = CallState::Ringing;
                    followups.push(Followup::AnnounceRinging);
                }
            }
            SipMessage::Request(request) if request.method() == Some(SipMethod::Ack) => {
                followups.push(Followup::StartRelay);
            }
            _ => {}
        }
        followups
    }

    /// Remote side hung up
    pub fn bye(&mut self, bye: &Transaction) {
        bye.set_response(200, reason_phrase(200));
        self.bye = ByeState::ByeReceived;
        self.set_reason("Remote Hangup", 200);
        self.hangup();
    }

    /// CANCEL for this call; only clears a pending unanswered INVITE
    pub fn cancel(&mut self, cancel: &Transaction) {
        if self.pending_incoming().is_some() {
            cancel.set_response(200, reason_phrase(200));
            self.set_reason("Cancelled", 487);
            self.hangup();
        } else {
            cancel.set_response(481, reason_phrase(481));
        }
    }

    /// Tell the caller the far end is ringing, with early media if the
    /// other leg supplied it
    pub fn ringing(&mut self, forward: Option<&MediaForward>) -> bool {
        let Some(transaction) = self.pending_incoming() else {
            return false;
        };
        let mut response = transaction.response(180);
        if let Some(body) = self.pass_through_sdp(forward) {
            response = response.sdp(body);
        }
        transaction.set_response_message(response.build_for_request(transaction.initial_request()));
        if self.state < CallState::Ringing {
            self.state = CallState::Ringing;
            self.publish(CallEventKind::Ringing { forward: None });
        }
        true
    }

    fn accept(&mut self, transaction: &Transaction, body: Option<String>) {
        let mut response = transaction
            .response(200)
            .header(Header::Contact(self.local_contact().into()));
        if let Some(body) = body {
            response = response.sdp(body);
        }
        transaction.set_response_message(response.build_for_request(transaction.initial_request()));
        self.state = CallState::Established;
        self.bye = ByeState::Confirmed;
        info!("Call {} answered", self.handle);

        let forward = match self.relay {
            RelayState::Allocated(_) => None,
            _ => self.forward(),
        };
        self.publish(CallEventKind::Answered { forward });
    }

    /// Answer an inbound call. Media is passed through when the other leg
    /// offered a complete forward, otherwise anchored on a local relay.
    pub async fn answer(connection: &ConnectionRef, forward: Option<MediaForward>) -> bool {
        let (ctx, transaction, allocate) = {
            let mut conn = connection.lock();
            let Some(transaction) = conn.pending_incoming() else {
                debug!("Call {} has nothing to answer", conn.handle);
                return false;
            };
            if let Some(body) = conn.pass_through_sdp(forward.as_ref()) {
                conn.accept(&transaction, Some(body));
                return true;
            }
            match conn.relay_request(false) {
                Some(allocate) => (conn.ctx.clone(), transaction, allocate),
                None => {
                    // no remote address yet: answer held, allocate on re-INVITE
                    conn.relay = RelayState::Placeholder;
                    let formats = conn.remote.codecs.clone();
                    let body = conn.build_local_sdp(&formats, None);
                    conn.accept(&transaction, body);
                    return true;
                }
            }
        };

        let reply = ctx.bus.dispatch(BusRequest::RelayAllocate(allocate)).await;

        let mut conn = connection.lock();
        if conn.pending_incoming().as_ref() != Some(&transaction) {
            debug!("Call {} vanished while allocating relay", conn.handle);
            if let Some(BusReply::Relay(grant)) = reply {
                conn.publish(CallEventKind::RelayReleased {
                    relay_id: grant.relay_id,
                });
            }
            return false;
        }
        let body = if conn.take_relay_grant(reply) {
            let (formats, chosen) = (conn.remote.codecs.clone(), conn.format);
            conn.build_local_sdp(&formats, chosen)
        } else {
            None
        };
        conn.accept(&transaction, body);
        true
    }

    /// Media renegotiation inside an established, locally anchored call
    pub async fn reinvite(connection: &ConnectionRef, transaction: Transaction) {
        let (ctx, allocate) = {
            let mut conn = connection.lock();
            let offer = transaction
                .initial_request()
                .sdp()
                .map(|body| parse_offer(body, &conn.ctx.codecs))
                .unwrap_or_default();
            if conn.state != CallState::Established
                || !conn.relay.is_local()
                || offer.address.is_none()
                || offer.port.is_none()
                || offer.codecs.is_empty()
            {
                debug!("Call {} refusing re-INVITE", conn.handle);
                transaction.set_response(488, reason_phrase(488));
                return;
            }
            conn.release_relay();
            conn.relay = RelayState::Placeholder;
            conn.format = offer.codecs.first();
            conn.remote = offer;
            match conn.relay_request(true) {
                Some(allocate) => (conn.ctx.clone(), allocate),
                None => {
                    transaction.set_response(488, reason_phrase(488));
                    return;
                }
            }
        };

        let reply = ctx.bus.dispatch(BusRequest::RelayAllocate(allocate)).await;

        let mut conn = connection.lock();
        if conn.state != CallState::Established {
            if let Some(BusReply::Relay(grant)) = reply {
                conn.publish(CallEventKind::RelayReleased {
                    relay_id: grant.relay_id,
                });
            }
            transaction.set_response(481, reason_phrase(481));
            return;
        }
        if !conn.take_relay_grant(reply) {
            transaction.set_response(488, reason_phrase(488));
            return;
        }
        let (formats, chosen) = (conn.remote.codecs.clone(), conn.format);
        match conn.build_local_sdp(&formats, chosen) {
            Some(body) => {
                let response = transaction
                    .response(200)
                    .header(Header::Contact(conn.local_contact().into()))
                    .sdp(body);
                transaction.set_response_message(response.build_for_request(transaction.initial_request()));
                info!("Call {} media renegotiated", conn.handle);
            }
            None => {
                transaction.set_response(488, reason_phrase(488));
            }
        }
    }

    /// Start an allocated relay once the remote end is known
    async fn start_relay(connection: &ConnectionRef) -> bool {
        let (ctx, request) = {
            let conn = connection.lock();
            let RelayState::Allocated(relay_id) = &conn.relay else {
                return false;
            };
            let (Some(remote_ip), Some(remote_port), Some(format)) =
                (conn.remote.address.clone(), conn.remote.port, conn.format)
            else {
                debug!("Call {} cannot start relay, remote end unknown", conn.handle);
                return false;
            };
            let request = RelayRequest {
                call: conn.handle.clone(),
                relay_id: Some(relay_id.clone()),
                remote_ip: Some(remote_ip),
                remote_port: Some(remote_port),
                format: Some(format),
                start: true,
            };
            (conn.ctx.clone(), request)
        };
        let started = ctx.bus.dispatch(BusRequest::RelayStart(request)).await.is_some();
        if !started {
            warn!("Relay for {} did not start", connection.handle());
        }
        started
    }

    /// Run bus work requested by `process`
    pub async fn run_followup(connection: ConnectionRef, followup: Followup) {
        match followup {
            Followup::StartRelay => {
                Self::start_relay(&connection).await;
            }
            Followup::AnnounceRinging | Followup::AnnounceAnswered => {
                let started = Self::start_relay(&connection).await;
                let conn = connection.lock();
                if conn.state == CallState::Cleared {
                    return;
                }
                // the other leg must never be pointed at the remote end past our relay
                let forward = if started || conn.relay.is_local() {
                    None
                } else {
                    conn.forward()
                };
                let kind = if followup == Followup::AnnounceAnswered {
                    CallEventKind::Answered { forward }
                } else {
                    CallEventKind::Ringing { forward }
                };
                conn.publish(kind);
            }
        }
    }

    fn send_bye(&mut self) {
        self.local_cseq += 1;
        let local = SocketAddr::new(self.local_ip, self.ctx.engine.local_addr().port());
        let Some(local_tag) = self.dialog.local_tag.clone() else {
            return;
        };
        let request = match RequestBuilder::new(Method::Bye, &self.remote_uri) {
            Ok(builder) => builder
                .via(local, &generate_branch())
                .from_party(&self.dialog.local_uri, &local_tag)
                .to_party(&self.dialog.remote_uri, self.dialog.remote_tag.as_deref())
                .call_id(&self.dialog.call_id)
                .cseq(self.local_cseq)
                .user_agent(&self.ctx.settings.user_agent)
                .build(),
            Err(e) => {
                warn!("Call {} cannot build BYE for {}: {}", self.handle, self.remote_uri, e);
                return;
            }
        };
        debug!("Call {} sending BYE to {}", self.handle, self.party);
        self.ctx.engine.send_request(request, self.party, None);
    }

    /// Tear the call down. Runs once; later calls are no-ops.
    pub fn hangup(&mut self) {
        if self.state == CallState::Cleared {
            return;
        }
        let previous = std::mem::replace(&mut self.state, CallState::Cleared);
        info!(
            "Call {} hung up in {:?}: {} {}",
            self.handle, previous, self.code, self.reason
        );

        if let Some(transaction) = &self.transaction {
            if transaction.is_outgoing()
                && transaction.is_invite()
                && transaction.state() == TransactionState::Process
            {
                let cancel = build_cancel(transaction.initial_request());
                self.ctx
                    .engine
                    .send_request(cancel, transaction.peer(), None);
            }
        }
        self.clear_transaction();

        if self.bye == ByeState::Confirmed {
            self.send_bye();
            self.bye = ByeState::ByeSent;
        }
        self.release_relay();
        self.ctx.registry.remove(&self.handle);
        self.publish(CallEventKind::Hangup {
            reason: self.reason.clone(),
            code: self.code,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bus::{MockMessageBus, RelayGrant};
    use crate::infrastructure::media::codec::CodecPolicy;
    use crate::infrastructure::protocols::sip::context::SipSettings;
    use crate::infrastructure::protocols::sip::message::{SipRequest, SipResponse};
    use crate::infrastructure::protocols::sip::transaction::{SipEngine, TransactionEngine};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const OFFER: &str = "v=0\r\n\
        o=alice 1 1 IN IP4 10.0.0.5\r\n\
        s=call\r\n\
        c=IN IP4 10.0.0.5\r\n\
        t=0 0\r\n\
        m=audio 20000 RTP/AVP 8 0 101\r\n";

    fn invite(branch: &str, body: Option<&str>) -> Vec<u8> {
        let body = body.unwrap_or_default();
        format!(
            "INVITE sip:100@127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5070;branch={branch}\r\n\
             From: <sip:alice@127.0.0.1>;tag=caller\r\n\
             To: <sip:100@127.0.0.1>\r\n\
             Call-ID: {branch}@test\r\n\
             CSeq: 1 INVITE\r\n\
             Contact: <sip:alice@127.0.0.1:5070>\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {}\r\n\r\n{body}",
            body.len()
        )
        .into_bytes()
    }

    fn cancel(branch: &str) -> Vec<u8> {
        format!(
            "CANCEL sip:100@127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5070;branch={branch}\r\n\
             From: <sip:alice@127.0.0.1>;tag=caller\r\n\
             To: <sip:100@127.0.0.1>\r\n\
             Call-ID: {branch}@test\r\n\
             CSeq: 1 CANCEL\r\n\
             Content-Length: 0\r\n\r\n"
        )
        .into_bytes()
    }

    fn route() -> RouteRequest {
        RouteRequest {
            caller: Some("alice".into()),
            called: Some("100".into()),
            uri: "sip:100@127.0.0.1".into(),
            from: "<sip:alice@127.0.0.1>".into(),
            call_id: "test".into(),
            contact: None,
            user_agent: None,
            received: "127.0.0.1:5070".parse().unwrap(),
            forward: None,
        }
    }

    fn setup(bus: MockMessageBus) -> (SipEngine, Arc<SipContext>) {
        let engine = SipEngine::new("127.0.0.1:5060".parse().unwrap(), false);
        let ctx = SipContext::new(
            Arc::new(bus),
            engine.handle(),
            CodecPolicy::default(),
            SipSettings::default(),
        );
        (engine, ctx)
    }

    fn responses(engine: &mut SipEngine) -> Vec<SipResponse> {
        let mut out = Vec::new();
        while let Some(msg) = engine.poll_transmit() {
            if let Ok(SipMessage::Response(resp)) = SipMessage::parse(&msg.data) {
                out.push(resp);
            }
        }
        out
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:5070".parse().unwrap()
    }

    fn execute() -> ExecuteRequest {
        ExecuteRequest {
            callto: "sip/sip:200@127.0.0.1:5070".into(),
            id: Some("local/1".into()),
            caller: Some("100".into()),
            ..Default::default()
        }
    }

    fn sent_invite(engine: &mut SipEngine) -> SipRequest {
        std::iter::from_fn(|| engine.poll_transmit())
            .find_map(|m| match SipMessage::parse(&m.data) {
                Ok(SipMessage::Request(request)) => Some(request),
                _ => None,
            })
            .unwrap()
    }

    /// Response of the called phone to our INVITE
    fn reply(invite: &SipRequest, status: &str, body: Option<&str>) -> Vec<u8> {
        let body = body.unwrap_or_default();
        format!(
            "SIP/2.0 {status}\r\n\
             Via: {}\r\n\
             From: {}\r\n\
             To: {};tag=phone\r\n\
             Call-ID: {}\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {}\r\n\r\n{body}",
            invite.top_via().unwrap(),
            invite.from_value().unwrap(),
            invite.to_value().unwrap(),
            invite.call_id().unwrap(),
            body.len()
        )
        .into_bytes()
    }

    /// Feed a response and run whatever bus work it asks for
    async fn deliver(engine: &mut SipEngine, conn: &ConnectionRef, data: &[u8]) {
        engine.feed(data, peer());
        while let Some(event) = engine.next_event() {
            let followups = conn.lock().process(&event);
            for followup in followups {
                Connection::run_followup(conn.clone(), followup).await;
            }
        }
    }

    fn recorded(events: &Arc<Mutex<Vec<CallEventKind>>>) -> MockMessageBus {
        let mut bus = MockMessageBus::new();
        let events = events.clone();
        bus.expect_publish()
            .returning(move |event| events.lock().push(event.kind));
        bus
    }

    #[tokio::test]
    async fn test_answer_allocates_relay() {
        let mut bus = MockMessageBus::new();
        bus.expect_publish().returning(|_| ());
        bus.expect_dispatch().returning(|request| match request {
            BusRequest::RelayAllocate(relay) => {
                assert_eq!(relay.remote_ip.as_deref(), Some("10.0.0.5"));
                assert_eq!(relay.remote_port, Some(20000));
                Some(BusReply::Relay(RelayGrant {
                    relay_id: "rtp/1".into(),
                    local_ip: Some("192.168.1.1".into()),
                    local_port: Some(30000),
                    format: None,
                }))
            }
            _ => None,
        });
        let (mut engine, ctx) = setup(bus);
        engine.feed(&invite("z9hG4bKa1", Some(OFFER)), peer());
        let tr = engine.next_event().unwrap().transaction;
        responses(&mut engine);

        let conn = Connection::incoming(&ctx, &tr, &route()).await.unwrap();
        assert_eq!(tr.user_data().as_ref(), Some(conn.handle()));
        assert_eq!(conn.lock().format(), Some(Codec::Alaw));

        assert!(Connection::answer(&conn, None).await);
        let sent = responses(&mut engine);
        assert_eq!(sent[0].status_code(), 200);
        let body = sent[0].sdp().unwrap();
        assert!(body.contains("c=IN IP4 192.168.1.1\r\n"));
        assert!(body.contains("m=audio 30000 RTP/AVP 8 101\r\n"));

        let conn = conn.lock();
        assert_eq!(conn.state(), CallState::Established);
        assert_eq!(conn.bye_state(), ByeState::Confirmed);
        assert_eq!(conn.relay(), &RelayState::Allocated("rtp/1".into()));
    }

    #[tokio::test]
    async fn test_answer_without_remote_address_is_held() {
        let mut bus = MockMessageBus::new();
        bus.expect_publish().returning(|_| ());
        bus.expect_dispatch().never();
        let (mut engine, ctx) = setup(bus);
        engine.feed(&invite("z9hG4bKa2", None), peer());
        let tr = engine.next_event().unwrap().transaction;
        responses(&mut engine);

        let conn = Connection::incoming(&ctx, &tr, &route()).await.unwrap();
        assert!(Connection::answer(&conn, None).await);
        let sent = responses(&mut engine);
        let body = sent[0].sdp().unwrap();
        assert!(body.contains("c=IN IP4 0.0.0.0\r\n"));
        assert!(body.contains("m=audio 1 RTP/AVP"));
        assert_eq!(conn.lock().relay(), &RelayState::Placeholder);

        // a second answer finds nothing pending
        assert!(!Connection::answer(&conn, None).await);
    }

    #[tokio::test]
    async fn test_cancel_before_answer() {
        let mut bus = MockMessageBus::new();
        bus.expect_publish().returning(|_| ());
        let (mut engine, ctx) = setup(bus);
        engine.feed(&invite("z9hG4bKa3", None), peer());
        let tr = engine.next_event().unwrap().transaction;
        let conn = Connection::incoming(&ctx, &tr, &route()).await.unwrap();
        responses(&mut engine);

        engine.feed(&cancel("z9hG4bKa3"), peer());
        let cancel_tr = engine.next_event().unwrap().transaction;
        conn.lock().cancel(&cancel_tr);

        let codes: Vec<u16> = responses(&mut engine).iter().map(|r| r.status_code()).collect();
        assert!(codes.contains(&200));
        assert!(codes.contains(&487));
        assert_eq!(tr.final_response(), Some((487, "Cancelled".to_string())));
        assert_eq!(conn.lock().state(), CallState::Cleared);
        assert!(ctx.registry.is_empty());
        assert_eq!(tr.user_data(), None);
    }

    #[tokio::test]
    async fn test_hangup_runs_once_and_releases_relay_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let hangups = Arc::new(AtomicUsize::new(0));
        let mut bus = MockMessageBus::new();
        let (r, h) = (released.clone(), hangups.clone());
        bus.expect_publish().returning(move |event| match event.kind {
            CallEventKind::RelayReleased { .. } => {
                r.fetch_add(1, Ordering::SeqCst);
            }
            CallEventKind::Hangup { .. } => {
                h.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        });
        bus.expect_dispatch().returning(|_| {
            Some(BusReply::Relay(RelayGrant {
                relay_id: "rtp/9".into(),
                local_ip: None,
                local_port: Some(30002),
                format: None,
            }))
        });
        let (mut engine, ctx) = setup(bus);
        engine.feed(&invite("z9hG4bKa4", Some(OFFER)), peer());
        let tr = engine.next_event().unwrap().transaction;
        let conn = Connection::incoming(&ctx, &tr, &route()).await.unwrap();
        assert!(Connection::answer(&conn, None).await);

        conn.lock().hangup();
        conn.lock().hangup();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(hangups.load(Ordering::SeqCst), 1);
        let conn = conn.lock();
        assert_eq!(conn.bye_state(), ByeState::ByeSent);
        assert_eq!(conn.relay(), &RelayState::Unallocated);

        // the BYE goes to the caller's Contact
        let bye = std::iter::from_fn(|| engine.poll_transmit())
            .find(|m| m.data.starts_with(b"BYE "))
            .unwrap();
        assert_eq!(bye.destination, peer());
    }

    #[tokio::test]
    async fn test_ringing_sent_each_time_announced_once() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (mut engine, ctx) = setup(recorded(&events));
        engine.feed(&invite("z9hG4bKa5", None), peer());
        let tr = engine.next_event().unwrap().transaction;
        let conn = Connection::incoming(&ctx, &tr, &route()).await.unwrap();
        responses(&mut engine);

        assert!(conn.lock().ringing(None));
        assert!(conn.lock().ringing(None));
        let codes: Vec<u16> = responses(&mut engine).iter().map(|r| r.status_code()).collect();
        assert_eq!(codes, vec![180, 180]);
        assert_eq!(conn.lock().state(), CallState::Ringing);

        let ringing = events
            .lock()
            .iter()
            .filter(|kind| matches!(kind, CallEventKind::Ringing { .. }))
            .count();
        assert_eq!(ringing, 1);
    }

    #[tokio::test]
    async fn test_cancel_after_answer_gets_481() {
        let mut bus = MockMessageBus::new();
        bus.expect_publish().returning(|_| ());
        let (mut engine, ctx) = setup(bus);
        engine.feed(&invite("z9hG4bKa6", None), peer());
        let tr = engine.next_event().unwrap().transaction;
        let conn = Connection::incoming(&ctx, &tr, &route()).await.unwrap();
        assert!(Connection::answer(&conn, None).await);
        responses(&mut engine);

        engine.feed(&cancel("z9hG4bKa6"), peer());
        let cancel_tr = std::iter::from_fn(|| engine.next_event())
            .find(|event| event.is_new_request())
            .unwrap()
            .transaction;
        conn.lock().cancel(&cancel_tr);

        let codes: Vec<u16> = responses(&mut engine).iter().map(|r| r.status_code()).collect();
        assert_eq!(codes, vec![481]);
        assert_eq!(conn.lock().state(), CallState::Established);
        assert_eq!(ctx.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_outgoing_ringing_with_relay_starts_it_and_hides_remote() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let starts = Arc::new(Mutex::new(Vec::new()));
        let mut bus = recorded(&events);
        let seen = starts.clone();
        bus.expect_dispatch().returning(move |request| {
            if let BusRequest::RelayStart(relay) = &request {
                seen.lock().push((relay.remote_ip.clone(), relay.remote_port));
            }
            Some(BusReply::Relay(RelayGrant {
                relay_id: "rtp/7".into(),
                local_ip: Some("192.168.1.1".into()),
                local_port: Some(30004),
                format: None,
            }))
        });
        let (mut engine, ctx) = setup(bus);
        let conn = Connection::outgoing(&ctx, execute()).await.unwrap();
        assert_eq!(conn.lock().relay(), &RelayState::Allocated("rtp/7".into()));
        let invite = sent_invite(&mut engine);

        let early = "v=0\r\n\
            o=phone 1 1 IN IP4 10.0.0.9\r\n\
            s=call\r\n\
            c=IN IP4 10.0.0.9\r\n\
            t=0 0\r\n\
            m=audio 40000 RTP/AVP 8\r\n";
        deliver(&mut engine, &conn, &reply(&invite, "180 Ringing", Some(early))).await;
        deliver(&mut engine, &conn, &reply(&invite, "180 Ringing", Some(early))).await;

        assert_eq!(conn.lock().state(), CallState::Ringing);
        assert_eq!(
            starts.lock().as_slice(),
            &[(Some("10.0.0.9".to_string()), Some(40000))]
        );
        let ringing: Vec<CallEventKind> = events
            .lock()
            .iter()
            .filter(|kind| matches!(kind, CallEventKind::Ringing { .. }))
            .cloned()
            .collect();
        assert_eq!(ringing, vec![CallEventKind::Ringing { forward: None }]);
    }

    #[tokio::test]
    async fn test_outgoing_failure_becomes_hangup_reason() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut bus = recorded(&events);
        bus.expect_dispatch().returning(|_| None);
        let (mut engine, ctx) = setup(bus);
        let conn = Connection::outgoing(&ctx, execute()).await.unwrap();
        let invite = sent_invite(&mut engine);

        deliver(&mut engine, &conn, &reply(&invite, "486 Busy Here", None)).await;

        assert_eq!(conn.lock().state(), CallState::Cleared);
        assert!(ctx.registry.is_empty());
        let hangup = events.lock().iter().find_map(|kind| match kind {
            CallEventKind::Hangup { code, .. } => Some(*code),
            _ => None,
        });
        assert_eq!(hangup, Some(486));
    }

    #[test]
    fn test_contact_address() {
        assert_eq!(
            contact_address("<sip:bob@10.0.0.7:5062>"),
            Some("10.0.0.7:5062".parse().unwrap())
        );
        assert_eq!(
            contact_address("sip:bob@10.0.0.7"),
            Some("10.0.0.7:5060".parse().unwrap())
        );
        assert_eq!(contact_address("<sip:bob@example.com>"), None);
    }
}
