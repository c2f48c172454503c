//! Codec table and enable policy

pub mod policy;
pub mod table;

pub use policy::CodecPolicy;
pub use table::{Codec, CodecList, TELEPHONE_EVENT_ENCODING, TELEPHONE_EVENT_PAYLOAD};
