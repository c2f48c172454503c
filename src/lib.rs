//! sipchan - SIP call-control channel
//!
//! Owns SIP dialogs end to end, negotiates media through SDP and bridges
//! inbound and outbound calls into a message-bus routing fabric.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::SipDriver;
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
