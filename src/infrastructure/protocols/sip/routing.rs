//! Routing of new inbound calls
//!
//! Each initial INVITE gets one `RoutingTask`, spawned off the event loop so
//! the bus may take as long as it needs. A `RoutingGate` caps how many run at
//! once; excess INVITEs are refused with 503 before any task exists.

use super::builder::reason_phrase;
use super::connection::{CallState, Connection};
use super::context::SipContext;
use super::transaction::{Transaction, TransactionState};
use crate::domain::shared::CallHandle;
use crate::infrastructure::bus::{BusReply, BusRequest, ExecuteRequest, RouteRequest};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Admission control for routing tasks
pub struct RoutingGate {
    max: usize,
    pending: Mutex<HashMap<u64, Transaction>>,
}

impl RoutingGate {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Reserve a slot for `transaction`; `None` when the gate is full
    pub fn admit(self: &Arc<Self>, transaction: &Transaction) -> Option<RoutePermit> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.max {
            return None;
        }
        pending.insert(transaction.id(), transaction.clone());
        gauge!("sip_routing_in_flight").set(pending.len() as f64);
        Some(RoutePermit {
            gate: self.clone(),
            id: transaction.id(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// INVITE still being routed for `call_id`
    pub fn pending(&self, call_id: &str) -> Option<Transaction> {
        self.pending
            .lock()
            .values()
            .find(|tr| tr.call_id() == call_id)
            .cloned()
    }
}

/// Slot held by a running routing task, returned on drop
pub struct RoutePermit {
    gate: Arc<RoutingGate>,
    id: u64,
}

impl Drop for RoutePermit {
    fn drop(&mut self) {
        let mut pending = self.gate.pending.lock();
        pending.remove(&self.id);
        gauge!("sip_routing_in_flight").set(pending.len() as f64);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingOutcome {
    /// The INVITE was answered or cancelled while the bus was deciding
    Abandoned,
    NotFound,
    Failed,
    Connected(CallHandle),
}

impl RoutingOutcome {
    fn label(&self) -> &'static str {
        match self {
            RoutingOutcome::Abandoned => "abandoned",
            RoutingOutcome::NotFound => "not_found",
            RoutingOutcome::Failed => "failed",
            RoutingOutcome::Connected(_) => "connected",
        }
    }
}

pub struct RoutingTask {
    ctx: Arc<SipContext>,
    transaction: Transaction,
    request: RouteRequest,
    _permit: RoutePermit,
}

impl RoutingTask {
    pub fn new(
        ctx: Arc<SipContext>,
        transaction: Transaction,
        request: RouteRequest,
        permit: RoutePermit,
    ) -> Self {
        Self {
            ctx,
            transaction,
            request,
            _permit: permit,
        }
    }

    pub async fn run(self) -> RoutingOutcome {
        let outcome = self.route().await;
        debug!(
            "Routing of {} finished: {}",
            self.request.call_id,
            outcome.label()
        );
        counter!("sip_routing_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    fn still_waiting(&self) -> bool {
        self.transaction.state() == TransactionState::Process
    }

    async fn route(&self) -> RoutingOutcome {
        let tr = &self.transaction;
        let reply = self
            .ctx
            .bus
            .dispatch(BusRequest::Route(self.request.clone()))
            .await;

        if !self.still_waiting() {
            debug!("Call {} vanished while routing", self.request.call_id);
            return RoutingOutcome::Abandoned;
        }

        let destination = match reply {
            Some(BusReply::Routed { destination }) => destination,
            _ => {
                info!(
                    "No route for {} -> {}",
                    self.request.caller.as_deref().unwrap_or("-"),
                    self.request.called.as_deref().unwrap_or("-")
                );
                tr.set_response(404, reason_phrase(404));
                return RoutingOutcome::NotFound;
            }
        };

        let connection = match Connection::incoming(&self.ctx, tr, &self.request).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Cannot create call for {}: {}", self.request.call_id, e);
                tr.set_response(500, reason_phrase(500));
                return RoutingOutcome::Failed;
            }
        };
        let handle = connection.handle().clone();
        if !self.still_waiting() {
            debug!("Call {} answered before it could be bound", handle);
            let mut conn = connection.lock();
            conn.set_reason("Cancelled", 487);
            conn.hangup();
            return RoutingOutcome::Abandoned;
        }

        let execute = ExecuteRequest {
            callto: destination.clone(),
            id: Some(handle.to_string()),
            caller: self.request.caller.clone(),
            called: self.request.called.clone(),
            forward: self.request.forward.clone(),
            ..ExecuteRequest::default()
        };
        let reply = self.ctx.bus.dispatch(BusRequest::Execute(execute)).await;

        let target = match reply {
            Some(BusReply::Executed { target_id, .. }) => target_id,
            _ => {
                warn!("Destination {} refused call {}", destination, handle);
                let mut conn = connection.lock();
                conn.set_reason(reason_phrase(500), 500);
                conn.hangup();
                return RoutingOutcome::Failed;
            }
        };

        {
            let mut conn = connection.lock();
            if conn.state() == CallState::Cleared {
                debug!("Call {} cleared while connecting", handle);
                return RoutingOutcome::Abandoned;
            }
            info!("Call {} routed to {}", handle, destination);
            conn.set_target(target.clone());
            if target.is_some() {
                if self.still_waiting() {
                    tr.set_response(183, reason_phrase(183));
                }
                return RoutingOutcome::Connected(handle);
            }
        }

        Connection::answer(&connection, None).await;
        RoutingOutcome::Connected(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bus::{CallEventKind, MockMessageBus};
    use crate::infrastructure::media::codec::CodecPolicy;
    use crate::infrastructure::protocols::sip::context::SipSettings;
    use crate::infrastructure::protocols::sip::message::SipMessage;
    use crate::infrastructure::protocols::sip::transaction::{SipEngine, TransactionEngine};
    use std::net::SocketAddr;

    fn invite(branch: &str) -> Vec<u8> {
        format!(
            "INVITE sip:100@127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5070;branch={branch}\r\n\
             From: <sip:alice@127.0.0.1>;tag=caller\r\n\
             To: <sip:100@127.0.0.1>\r\n\
             Call-ID: {branch}@test\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Length: 0\r\n\r\n"
        )
        .into_bytes()
    }

    fn route_request(call_id: &str) -> RouteRequest {
        RouteRequest {
            caller: Some("alice".into()),
            called: Some("100".into()),
            uri: "sip:100@127.0.0.1".into(),
            from: "<sip:alice@127.0.0.1>".into(),
            call_id: call_id.into(),
            contact: None,
            user_agent: None,
            received: peer(),
            forward: None,
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:5070".parse().unwrap()
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

    fn final_codes(engine: &mut SipEngine) -> Vec<u16> {
        std::iter::from_fn(|| engine.poll_transmit())
            .filter_map(|m| match SipMessage::parse(&m.data) {
                Ok(SipMessage::Response(r)) if r.status_code() > 100 => Some(r.status_code()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_gate_caps_in_flight_tasks() {
        let (mut engine, _ctx) = setup(MockMessageBus::new());
        let gate = RoutingGate::new(2);
        let mut transactions = Vec::new();
        for branch in ["z9hG4bKg1", "z9hG4bKg2", "z9hG4bKg3"] {
            engine.feed(&invite(branch), peer());
            transactions.push(engine.next_event().unwrap().transaction);
        }

        let first = gate.admit(&transactions[0]).unwrap();
        let _second = gate.admit(&transactions[1]).unwrap();
        assert!(gate.admit(&transactions[2]).is_none());
        assert_eq!(gate.pending("z9hG4bKg1@test"), Some(transactions[0].clone()));

        drop(first);
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.pending("z9hG4bKg1@test").is_none());
        assert!(gate.admit(&transactions[2]).is_some());
    }

    #[tokio::test]
    async fn test_no_route_answers_404() {
        let mut bus = MockMessageBus::new();
        bus.expect_dispatch().times(1).returning(|_| None);
        let (mut engine, ctx) = setup(bus);
        engine.feed(&invite("z9hG4bKr1"), peer());
        let tr = engine.next_event().unwrap().transaction;
        let gate = RoutingGate::new(5);
        let permit = gate.admit(&tr).unwrap();

        let task = RoutingTask::new(ctx.clone(), tr, route_request("z9hG4bKr1@test"), permit);
        assert_eq!(task.run().await, RoutingOutcome::NotFound);
        assert_eq!(final_codes(&mut engine), vec![404]);
        assert_eq!(gate.in_flight(), 0);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_paired_leg_gets_session_progress() {
        let mut bus = MockMessageBus::new();
        bus.expect_publish().returning(|_| ());
        bus.expect_dispatch().returning(|request| match request {
            BusRequest::Route(_) => Some(BusReply::Routed {
                destination: "local/desk".into(),
            }),
            BusRequest::Execute(execute) => {
                assert!(execute.id.unwrap().starts_with("sip/"));
                Some(BusReply::Executed {
                    target_id: Some("local/7".into()),
                    forward_accepted: false,
                })
            }
            _ => None,
        });
        let (mut engine, ctx) = setup(bus);
        engine.feed(&invite("z9hG4bKr2"), peer());
        let tr = engine.next_event().unwrap().transaction;
        let permit = RoutingGate::new(5).admit(&tr).unwrap();

        let task = RoutingTask::new(ctx.clone(), tr.clone(), route_request("z9hG4bKr2@test"), permit);
        let RoutingOutcome::Connected(handle) = task.run().await else {
            panic!("call was not connected");
        };
        assert_eq!(final_codes(&mut engine), vec![183]);
        let conn = ctx.registry.find(&handle).unwrap();
        assert_eq!(conn.lock().target(), Some("local/7"));
        assert_eq!(conn.lock().state(), CallState::Incoming);
        assert_eq!(tr.state(), TransactionState::Process);
    }

    #[tokio::test]
    async fn test_refused_execute_answers_500() {
        let mut bus = MockMessageBus::new();
        bus.expect_publish().returning(|_| ());
        bus.expect_dispatch().returning(|request| match request {
            BusRequest::Route(_) => Some(BusReply::Routed {
                destination: "local/nowhere".into(),
            }),
            _ => None,
        });
        let (mut engine, ctx) = setup(bus);
        engine.feed(&invite("z9hG4bKr3"), peer());
        let tr = engine.next_event().unwrap().transaction;
        let permit = RoutingGate::new(5).admit(&tr).unwrap();

        let task = RoutingTask::new(ctx.clone(), tr.clone(), route_request("z9hG4bKr3@test"), permit);
        assert_eq!(task.run().await, RoutingOutcome::Failed);
        assert_eq!(final_codes(&mut engine), vec![500]);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_answered_elsewhere_is_abandoned() {
        let mut bus = MockMessageBus::new();
        bus.expect_dispatch().returning(|_| {
            Some(BusReply::Routed {
                destination: "local/desk".into(),
            })
        });
        let (mut engine, ctx) = setup(bus);
        engine.feed(&invite("z9hG4bKr4"), peer());
        let tr = engine.next_event().unwrap().transaction;
        let permit = RoutingGate::new(5).admit(&tr).unwrap();
        tr.set_response(487, reason_phrase(487));

        let task = RoutingTask::new(ctx.clone(), tr, route_request("z9hG4bKr4@test"), permit);
        assert_eq!(task.run().await, RoutingOutcome::Abandoned);
        assert_eq!(final_codes(&mut engine), vec![487]);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_answered_while_binding_is_abandoned() {
        let mut engine = SipEngine::new("127.0.0.1:5060".parse().unwrap(), false);
        engine.feed(&invite("z9hG4bKr5"), peer());
        let tr = engine.next_event().unwrap().transaction;

        let hangups = Arc::new(Mutex::new(Vec::new()));
        let (cancelled, seen) = (tr.clone(), hangups.clone());
        let mut bus = MockMessageBus::new();
        bus.expect_publish().returning(move |event| match event.kind {
            // the CANCEL lands while the connection is being created
            CallEventKind::Started { .. } => {
                cancelled.set_response(487, reason_phrase(487));
            }
            CallEventKind::Hangup { code, .. } => seen.lock().push(code),
            _ => {}
        });
        bus.expect_dispatch().times(1).returning(|request| match request {
            BusRequest::Route(_) => Some(BusReply::Routed {
                destination: "local/desk".into(),
            }),
            _ => None,
        });
        let ctx = SipContext::new(
            Arc::new(bus),
            engine.handle(),
            CodecPolicy::default(),
            SipSettings::default(),
        );
        let permit = RoutingGate::new(5).admit(&tr).unwrap();

        let task = RoutingTask::new(ctx.clone(), tr.clone(), route_request("z9hG4bKr5@test"), permit);
        assert_eq!(task.run().await, RoutingOutcome::Abandoned);
        assert_eq!(final_codes(&mut engine), vec![487]);
        assert!(ctx.registry.is_empty());
        assert_eq!(hangups.lock().as_slice(), &[487]);
        assert_eq!(tr.user_data(), None);
    }
}
