//! SIP call-control layer
//!
//! ```text
//! ┌─────────────────────────┐
//! │  Driver facade          │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐      ┌──────────────┐
//! │  Connections, routing   │◄────►│ Message bus  │
//! │  tasks, call registry   │      └──────────────┘
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │  Event processor        │
//! │  (transaction engine)   │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │  UDP transport          │
//! └─────────────────────────┘
//! ```

pub mod builder;
pub mod connection;
pub mod context;
pub mod dialog;
pub mod message;
pub mod registrar;
pub mod registry;
pub mod routing;
pub mod sdp;
pub mod server;
pub mod transaction;
pub mod transport;

pub use connection::{ByeState, CallState, Connection, ConnectionRef, RelayState};
pub use context::{SipContext, SipSettings};
pub use dialog::Dialog;
pub use message::{SipError, SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse};
pub use registry::CallRegistry;
pub use routing::{RoutingGate, RoutingOutcome, RoutingTask};
pub use sdp::{MediaOffer, SdpBuilder, SdpSession};
pub use server::{EventProcessor, SipEndpoint};
pub use transaction::{
    EngineHandle, SipEngine, SipEvent, Transaction, TransactionEngine, TransactionState,
};
pub use transport::{OutgoingMessage, UdpTransport};
