//! Requests dispatched on the bus and their replies

use crate::domain::shared::CallHandle;
use crate::infrastructure::media::codec::{Codec, CodecList};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Remote media parameters offered for direct (pass-through) exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaForward {
    pub address: String,
    pub port: Option<u16>,
    pub codecs: CodecList,
}

impl MediaForward {
    /// Address and port are both known
    pub fn is_complete(&self) -> bool {
        !self.address.is_empty() && self.port.is_some()
    }
}

/// Where should this inbound call go?
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub caller: Option<String>,
    pub called: Option<String>,
    pub uri: String,
    pub from: String,
    pub call_id: String,
    pub contact: Option<String>,
    pub user_agent: Option<String>,
    /// Transport address the INVITE came from
    pub received: SocketAddr,
    /// Early media hints from the offer, if it carried an address
    pub forward: Option<MediaForward>,
}

/// Connect a call leg to a destination
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub callto: String,
    /// Leg asking for the connection
    pub id: Option<String>,
    pub caller: Option<String>,
    pub called: Option<String>,
    pub domain: Option<String>,
    /// Overrides the host of the `sip/` URI
    pub host: Option<String>,
    pub port: Option<u16>,
    pub formats: Option<CodecList>,
    pub forward: Option<MediaForward>,
}

/// Allocate or start a local media relay for a call leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub call: CallHandle,
    /// Set when starting a relay that was allocated earlier
    pub relay_id: Option<String>,
    pub remote_ip: Option<String>,
    pub remote_port: Option<u16>,
    pub format: Option<Codec>,
    /// Begin forwarding immediately; the remote end is already known
    pub start: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: Option<String>,
    /// Contact the user can be reached at ("sip/<uri>")
    pub data: String,
    pub expires: Option<String>,
    pub received: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusRequest {
    Route(RouteRequest),
    Execute(ExecuteRequest),
    RelayAllocate(RelayRequest),
    RelayStart(RelayRequest),
    Register(RegisterRequest),
    Unregister(RegisterRequest),
}

impl BusRequest {
    pub fn name(&self) -> &'static str {
        match self {
            BusRequest::Route(_) => "call.route",
            BusRequest::Execute(_) => "call.execute",
            BusRequest::RelayAllocate(_) => "relay.allocate",
            BusRequest::RelayStart(_) => "relay.start",
            BusRequest::Register(_) => "user.register",
            BusRequest::Unregister(_) => "user.unregister",
        }
    }
}

/// Local end of a relay handed out by the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayGrant {
    pub relay_id: String,
    pub local_ip: Option<String>,
    pub local_port: Option<u16>,
    pub format: Option<Codec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusReply {
    Routed {
        destination: String,
    },
    Executed {
        target_id: Option<String>,
        forward_accepted: bool,
    },
    Relay(RelayGrant),
    Registered,
}
