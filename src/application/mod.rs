//! Application layer - Services the host process drives
//!
//! The SIP driver binds the endpoint into the process and exposes the
//! call-control operations of the channel.

pub mod driver;

pub use driver::SipDriver;
