//! SIP endpoint: UDP transport, transaction engine and event dispatch
//!
//! `EventProcessor` is the synchronous half of the loop. It drains engine
//! events and hands them to bound connections or to new-request handling,
//! spawning anything that must wait on the bus. `SipEndpoint` wraps it with
//! the socket and runs the receive/tick/transmit cycle.

use super::builder::reason_phrase;
use super::connection::Connection;
use super::context::{SipContext, SipSettings};
use super::dialog::Dialog;
use super::message::{SipError, SipHeaders, SipMethod};
use super::registrar;
use super::routing::{RoutingGate, RoutingTask};
use super::sdp::parse_offer;
use super::transaction::{SipEngine, SipEvent, Transaction, TransactionEngine};
use super::transport::{OutgoingMessage, UdpTransport};
use crate::domain::shared::SipUri;
use crate::infrastructure::bus::{MediaForward, MessageBus, RouteRequest};
use crate::infrastructure::media::codec::CodecPolicy;
use metrics::counter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long one loop iteration waits for a datagram
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Drains the transaction engine, handing each event to the call leg it
/// belongs to or starting routing for a new INVITE.
pub struct EventProcessor {
    engine: Box<dyn TransactionEngine>,
    ctx: Arc<SipContext>,
    gate: Arc<RoutingGate>,
    tasks: JoinSet<()>,
}

impl EventProcessor {
    pub fn new(engine: Box<dyn TransactionEngine>, ctx: Arc<SipContext>) -> Self {
        let gate = RoutingGate::new(ctx.settings.max_pending_routes);
        Self {
            engine,
            ctx,
            gate,
            tasks: JoinSet::new(),
        }
    }

    pub fn context(&self) -> &Arc<SipContext> {
        &self.ctx
    }

    pub fn gate(&self) -> &Arc<RoutingGate> {
        &self.gate
    }

    pub fn feed(&mut self, data: &[u8], source: SocketAddr) {
        self.engine.feed(data, source);
    }

    pub fn poll_transmit(&mut self) -> Option<OutgoingMessage> {
        self.engine.poll_transmit()
    }

    pub fn tick(&mut self, now: Instant) {
        self.engine.tick(now);
    }

    /// Handle every queued event; returns how many there were
    pub fn step(&mut self) -> usize {
        while self.tasks.try_join_next().is_some() {}

        let mut handled = 0;
        while let Some(event) = self.engine.next_event() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    /// Wait for all spawned routing and follow-up tasks
    pub async fn wait_tasks(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!("SIP task failed: {}", e);
            }
        }
    }

    fn dispatch(&mut self, event: SipEvent) {
        if let Some(handle) = event.transaction.user_data() {
            match self.ctx.registry.find(&handle) {
                Some(connection) => {
                    let followups = connection.lock().process(&event);
                    for followup in followups {
                        self.tasks
                            .spawn(Connection::run_followup(connection.clone(), followup));
                    }
                    return;
                }
                None => {
                    debug!("Transaction bound to vanished call {}", handle);
                    event.transaction.set_user_data(None);
                }
            }
        }

        if event.is_new_request() && self.incoming(&event.transaction) {
            return;
        }
        self.engine.process_event(event);
    }

    /// New-request handling; false leaves the request to the engine
    fn incoming(&mut self, transaction: &Transaction) -> bool {
        let transaction = transaction.clone();
        match transaction.initial_request().method() {
            Some(SipMethod::Invite) => self.invite(transaction),
            Some(SipMethod::Bye) => self.bye(transaction),
            Some(SipMethod::Cancel) => self.cancel(transaction),
            Some(SipMethod::Register) if self.ctx.settings.registrar => {
                self.register(transaction)
            }
            _ => return false,
        }
        true
    }

    fn invite(&mut self, transaction: Transaction) {
        if self.ctx.is_exiting() {
            warn!("Dropping call, shutting down");
            transaction.set_response(500, "Server Shutting Down");
            return;
        }

        let request = transaction.initial_request();
        if request.to_tag().is_some() {
            let dialog = Dialog::from_incoming(request, None);
            match self.ctx.registry.find_by_dialog(&dialog) {
                Some(connection) => {
                    self.tasks.spawn(async move {
                        Connection::reinvite(&connection, transaction).await;
                    });
                }
                None => {
                    warn!("Got re-INVITE for missing dialog {}", dialog);
                    transaction.set_response(481, reason_phrase(481));
                }
            }
            return;
        }

        let Some(permit) = self.gate.admit(&transaction) else {
            warn!(
                "Dropping call, there are already {} waiting",
                self.gate.in_flight()
            );
            counter!("sip_routing_total", "outcome" => "rejected").increment(1);
            transaction.set_response(503, reason_phrase(503));
            return;
        };

        let route = self.route_request(&transaction);
        let task = RoutingTask::new(self.ctx.clone(), transaction, route, permit);
        self.tasks.spawn(async move {
            task.run().await;
        });
    }

    fn route_request(&self, transaction: &Transaction) -> RouteRequest {
        let request = transaction.initial_request();
        let uri = request.uri().to_string();
        let forward = request
            .sdp()
            .map(|body| parse_offer(body, &self.ctx.codecs))
            .and_then(|offer| {
                Some(MediaForward {
                    address: offer.address?,
                    port: offer.port,
                    codecs: offer.codecs,
                })
            });

        RouteRequest {
            caller: request
                .from_uri()
                .and_then(|u| u.user().map(String::from)),
            called: SipUri::parse(&uri)
                .ok()
                .and_then(|u| u.user().map(String::from)),
            uri,
            from: request.from_value().unwrap_or_default(),
            call_id: transaction.call_id(),
            contact: request.contact(),
            user_agent: request.user_agent(),
            received: transaction.peer(),
            forward,
        }
    }

    fn bye(&mut self, transaction: Transaction) {
        let dialog = Dialog::from_incoming(transaction.initial_request(), None);
        match self.ctx.registry.find_by_dialog(&dialog) {
            Some(connection) => connection.lock().bye(&transaction),
            None => {
                debug!("BYE for unknown dialog {}", dialog);
                transaction.set_response(481, reason_phrase(481));
            }
        }
    }

    fn cancel(&mut self, transaction: Transaction) {
        let call_id = transaction.call_id();
        if let Some(connection) = self.ctx.registry.find_by_call_id(&call_id) {
            connection.lock().cancel(&transaction);
            return;
        }

        // still waiting on the routing decision
        if let Some(invite) = self.gate.pending(&call_id) {
            if invite.set_response(487, reason_phrase(487)) {
                debug!("Cancelled {} while routing", call_id);
                transaction.set_response(200, reason_phrase(200));
                return;
            }
        }
        transaction.set_response(481, reason_phrase(481));
    }

    fn register(&mut self, transaction: Transaction) {
        if let Some(request) = registrar::prepare(&self.ctx, &transaction) {
            self.tasks
                .spawn(registrar::complete(self.ctx.clone(), transaction, request));
        }
    }
}

/// UDP SIP endpoint owning the socket and the transaction engine
pub struct SipEndpoint {
    transport: UdpTransport,
    processor: EventProcessor,
}

impl SipEndpoint {
    pub async fn bind(
        bind_addr: SocketAddr,
        bus: Arc<dyn MessageBus>,
        codecs: CodecPolicy,
        settings: SipSettings,
    ) -> Result<Self, SipError> {
        let transport = UdpTransport::bind_with_fallback(bind_addr).await?;
        let local_addr = transport.local_addr()?;
        let engine = SipEngine::new(local_addr, settings.registrar);
        let ctx = SipContext::new(bus, engine.handle(), codecs, settings);
        Ok(Self {
            transport,
            processor: EventProcessor::new(Box::new(engine), ctx),
        })
    }

    pub fn context(&self) -> Arc<SipContext> {
        self.processor.context().clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SipError> {
        self.transport.local_addr()
    }

    async fn flush(&mut self) {
        while let Some(message) = self.processor.poll_transmit() {
            if let Err(e) = self.transport.send(&message).await {
                warn!("Failed to send to {}: {}", message.destination, e);
            }
        }
    }

    /// Run until `shutdown` changes or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("SIP endpoint running on {:?}", self.transport.local_addr().ok());

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.transport.recv_timeout(POLL_INTERVAL) => match received {
                    Ok(Some((data, source))) => self.processor.feed(&data, source),
                    Ok(None) => {}
                    Err(e) => warn!("Error reading SIP socket: {}", e),
                },
            }

            self.processor.tick(Instant::now());
            self.processor.step();
            self.flush().await;
        }

        // last hangups queued by the shutdown
        self.processor.step();
        self.flush().await;
        info!("SIP endpoint stopped");
    }
}
