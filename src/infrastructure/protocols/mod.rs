//! Protocol implementations

pub mod sip;
