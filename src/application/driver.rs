//! SIP channel driver
//!
//! Binds the endpoint into the host process and exposes the call-control
//! operations the host drives: placing calls, signalling ringing and
//! answer for calls it routed, hanging up and dropping calls.

use crate::config::Config;
use crate::domain::shared::CallHandle;
use crate::infrastructure::bus::{BusReply, ExecuteRequest, MediaForward, MessageBus};
use crate::infrastructure::media::codec::CodecPolicy;
use crate::infrastructure::protocols::sip::{
    Connection, ConnectionRef, RelayState, SipContext, SipEndpoint, SipError, SipSettings,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct SipDriver {
    ctx: Arc<SipContext>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    endpoint: Mutex<Option<JoinHandle<()>>>,
}

impl SipDriver {
    /// Bind the endpoint and start its event loop
    pub async fn initialize(config: &Config, bus: Arc<dyn MessageBus>) -> Result<Self, SipError> {
        let bind_addr = config
            .sip
            .bind_addr()
            .map_err(|e| SipError::Internal(e.to_string()))?;
        let endpoint = SipEndpoint::bind(
            bind_addr,
            bus,
            CodecPolicy::from(&config.codecs),
            SipSettings::from(config),
        )
        .await?;

        let ctx = endpoint.context();
        let local_addr = endpoint.local_addr()?;
        let (shutdown, signal) = watch::channel(false);
        let handle = tokio::spawn(endpoint.run(signal));

        info!("SIP driver listening on {}", local_addr);
        Ok(Self {
            ctx,
            local_addr,
            shutdown,
            endpoint: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<SipContext> {
        &self.ctx
    }

    /// Number of live calls
    pub fn calls(&self) -> usize {
        self.ctx.registry.len()
    }

    fn find(&self, id: &str) -> Option<ConnectionRef> {
        let handle = CallHandle::parse(id)?;
        self.ctx.registry.find(&handle)
    }

    /// Place an outgoing call to a `sip/<uri>` destination
    pub async fn execute(&self, request: ExecuteRequest) -> Result<BusReply, SipError> {
        if CallHandle::parse(&request.callto).is_none() {
            return Err(SipError::InvalidMessage(format!(
                "Not a SIP destination: {}",
                request.callto
            )));
        }
        if self.ctx.is_exiting() {
            return Err(SipError::Internal("Driver is shutting down".to_string()));
        }

        let connection = Connection::outgoing(&self.ctx, request).await?;
        let forward_accepted = *connection.lock().relay() == RelayState::PassThrough;
        Ok(BusReply::Executed {
            target_id: Some(connection.handle().to_string()),
            forward_accepted,
        })
    }

    /// The other leg of call `id` is ringing
    pub fn ringing(&self, id: &str, forward: Option<&MediaForward>) -> bool {
        match self.find(id) {
            Some(connection) => connection.lock().ringing(forward),
            None => false,
        }
    }

    /// The other leg of call `id` answered
    pub async fn answered(&self, id: &str, forward: Option<MediaForward>) -> bool {
        match self.find(id) {
            Some(connection) => Connection::answer(&connection, forward).await,
            None => false,
        }
    }

    pub fn hangup(&self, id: &str, reason: Option<&str>) -> bool {
        let Some(connection) = self.find(id) else {
            debug!("Hangup for unknown call {}", id);
            return false;
        };
        let mut conn = connection.lock();
        if let Some(reason) = reason {
            let code = conn.reason().1;
            conn.set_reason(reason, code);
        }
        conn.hangup();
        true
    }

    /// Drop one call, or every call when `id` is missing or not ours.
    /// Returns how many were dropped.
    pub fn drop_call(&self, id: Option<&str>) -> usize {
        let targets = match id.and_then(CallHandle::parse) {
            Some(handle) => self.ctx.registry.find(&handle).into_iter().collect(),
            None => self.ctx.registry.values(),
        };
        let count = targets.len();
        for connection in targets {
            connection.lock().hangup();
        }
        if count > 0 {
            info!("Dropped {} call(s)", count);
        }
        count
    }

    /// Refuse new calls, hang up the live ones and stop the event loop
    pub async fn shutdown(&self) {
        info!("Stopping SIP driver");
        self.ctx.set_exiting();
        self.drop_call(None);

        if self.shutdown.send(true).is_err() {
            debug!("SIP endpoint already stopped");
        }
        let handle = self.endpoint.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("SIP endpoint task failed: {}", e);
            }
        }
    }
}
