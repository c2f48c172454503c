//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - The SIP protocol stack and call control
//! - Codec tables for media negotiation
//! - The message bus contract and its in-process implementation

pub mod bus;
pub mod media;
pub mod protocols;
