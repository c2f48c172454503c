//! Shared state handed to connections, routing tasks and the event loop

use super::registry::CallRegistry;
use super::transaction::EngineHandle;
use crate::config::Config;
use crate::infrastructure::bus::{CallEvent, MessageBus};
use crate::infrastructure::media::codec::CodecPolicy;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::debug;

/// Owner field of the SDP bodies we build
pub const SDP_OWNER: &str = "sipchan";

/// Behaviour switches taken from configuration
#[derive(Debug, Clone)]
pub struct SipSettings {
    /// Trust the transport source address over Contact/Via addressing
    pub ignore_via: bool,
    pub registrar: bool,
    pub max_pending_routes: usize,
    pub user_agent: String,
}

impl Default for SipSettings {
    fn default() -> Self {
        Self {
            ignore_via: false,
            registrar: false,
            max_pending_routes: 5,
            user_agent: "sipchan".to_string(),
        }
    }
}

impl From<&Config> for SipSettings {
    fn from(config: &Config) -> Self {
        Self {
            ignore_via: config.sip.ignore_via,
            registrar: config.sip.registrar,
            max_pending_routes: config.routing.max_pending,
            user_agent: config.sip.user_agent.clone(),
        }
    }
}

pub struct SipContext {
    pub bus: Arc<dyn MessageBus>,
    pub engine: EngineHandle,
    pub registry: CallRegistry,
    pub codecs: CodecPolicy,
    pub settings: SipSettings,
    exiting: AtomicBool,
}

impl SipContext {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        engine: EngineHandle,
        codecs: CodecPolicy,
        settings: SipSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            engine,
            registry: CallRegistry::new(),
            codecs,
            settings,
            exiting: AtomicBool::new(false),
        })
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    pub fn set_exiting(&self) {
        self.exiting.store(true, Ordering::Release);
    }

    pub fn publish(&self, event: CallEvent) {
        self.bus.publish(event);
    }

    /// Local IP a peer can reach us at. When bound to the wildcard address
    /// the kernel's route choice towards `peer` decides.
    pub async fn local_ip_for(&self, peer: SocketAddr) -> IpAddr {
        let bound = self.engine.local_addr().ip();
        if !bound.is_unspecified() {
            return bound;
        }
        let discover = async {
            let socket = UdpSocket::bind(SocketAddr::new(bound, 0)).await?;
            socket.connect(peer).await?;
            socket.local_addr()
        };
        match discover.await {
            Ok(addr) if !addr.ip().is_unspecified() => addr.ip(),
            Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Err(e) => {
                debug!("No route towards {}: {}", peer, e);
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
        }
    }
}
