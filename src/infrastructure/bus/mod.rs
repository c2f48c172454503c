//! Message bus - the routing fabric the call-control layer talks to
//!
//! `dispatch` is a request/reply exchange that may take arbitrarily long and
//! is only awaited from routing or follow-up tasks, never from the event loop
//! itself. `publish` is fire-and-forget.

pub mod events;
pub mod local;
pub mod messages;

pub use events::{CallEvent, CallEventKind};
pub use local::LocalBus;
pub use messages::{
    BusReply, BusRequest, ExecuteRequest, MediaForward, RegisterRequest, RelayGrant,
    RelayRequest, RouteRequest,
};

/// Routing fabric contract
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    /// Returns `None` when no handler accepted the request
    async fn dispatch(&self, request: BusRequest) -> Option<BusReply>;

    fn publish(&self, event: CallEvent);
}
