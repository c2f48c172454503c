//! Media negotiation support

pub mod codec;

pub use codec::{Codec, CodecList, CodecPolicy};
