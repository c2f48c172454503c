//! In-process bus backing the standalone binary
//!
//! Routes called numbers through a static table and registered users,
//! accepts `local/` destinations as auto-answering legs, records
//! registrations, and refuses media relays so calls fall back to on-hold SDP.

use super::events::CallEvent;
use super::messages::{BusReply, BusRequest, RegisterRequest};
use super::MessageBus;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub struct LocalBus {
    routes: HashMap<String, String>,
    registrations: Mutex<HashMap<String, RegisterRequest>>,
}

impl LocalBus {
    pub fn new(routes: HashMap<String, String>) -> Self {
        Self {
            routes,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Contact registered for `username`
    pub fn registration(&self, username: &str) -> Option<String> {
        self.registrations
            .lock()
            .get(username)
            .map(|r| r.data.clone())
    }

    fn route(&self, called: Option<&str>) -> Option<String> {
        let called = called?;
        self.routes
            .get(called)
            .cloned()
            .or_else(|| self.registration(called))
    }
}

#[async_trait::async_trait]
impl MessageBus for LocalBus {
    async fn dispatch(&self, request: BusRequest) -> Option<BusReply> {
        debug!("Local bus dispatching {}", request.name());
        match request {
            BusRequest::Route(route) => {
                let destination = self.route(route.called.as_deref())?;
                info!(
                    "Routing {} -> {} to {}",
                    route.caller.as_deref().unwrap_or("-"),
                    route.called.as_deref().unwrap_or("-"),
                    destination
                );
                Some(BusReply::Routed { destination })
            }
            BusRequest::Execute(execute) if execute.callto.starts_with("local/") => {
                Some(BusReply::Executed {
                    target_id: None,
                    forward_accepted: false,
                })
            }
            BusRequest::Execute(execute) => {
                warn!("No local handler for destination {}", execute.callto);
                None
            }
            BusRequest::RelayAllocate(_) | BusRequest::RelayStart(_) => None,
            BusRequest::Register(register) => {
                let username = register.username.clone()?;
                info!("Registered {} at {}", username, register.data);
                self.registrations.lock().insert(username, register);
                Some(BusReply::Registered)
            }
            BusRequest::Unregister(register) => {
                let username = register.username?;
                let removed = self.registrations.lock().remove(&username);
                info!("Unregistered {}", username);
                removed.map(|_| BusReply::Registered)
            }
        }
    }

    fn publish(&self, event: CallEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "sipchan::events", "{}", json),
            Err(e) => warn!("Failed to serialize {}: {}", event.metadata.event_type, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bus::{ExecuteRequest, RouteRequest};

    fn route(called: &str) -> BusRequest {
        BusRequest::Route(RouteRequest {
            caller: Some("alice".into()),
            called: Some(called.into()),
            uri: format!("sip:{}@10.0.0.1", called),
            from: "<sip:alice@10.0.0.5>".into(),
            call_id: "c1".into(),
            contact: None,
            user_agent: None,
            received: "10.0.0.5:5060".parse().unwrap(),
            forward: None,
        })
    }

    fn register(expires: &str) -> RegisterRequest {
        RegisterRequest {
            username: Some("bob".into()),
            data: "sip/sip:bob@10.0.0.7:5060".into(),
            expires: Some(expires.into()),
            received: "10.0.0.7:5060".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_routes_from_table_and_registrations() {
        let bus = LocalBus::new(HashMap::from([("100".to_string(), "local/echo".to_string())]));
        assert_eq!(
            bus.dispatch(route("100")).await,
            Some(BusReply::Routed {
                destination: "local/echo".into()
            })
        );
        assert_eq!(bus.dispatch(route("bob")).await, None);

        bus.dispatch(BusRequest::Register(register("3600"))).await;
        assert_eq!(
            bus.dispatch(route("bob")).await,
            Some(BusReply::Routed {
                destination: "sip/sip:bob@10.0.0.7:5060".into()
            })
        );

        assert!(bus.dispatch(BusRequest::Unregister(register("0"))).await.is_some());
        assert_eq!(bus.registration("bob"), None);
    }

    #[tokio::test]
    async fn test_execute_accepts_local_only() {
        let bus = LocalBus::new(HashMap::new());
        let local = ExecuteRequest {
            callto: "local/echo".into(),
            ..Default::default()
        };
        assert!(matches!(
            bus.dispatch(BusRequest::Execute(local)).await,
            Some(BusReply::Executed { target_id: None, .. })
        ));
        let remote = ExecuteRequest {
            callto: "sip/sip:bob@10.0.0.7".into(),
            ..Default::default()
        };
        assert_eq!(bus.dispatch(BusRequest::Execute(remote)).await, None);
    }
}
