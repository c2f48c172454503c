//! Domain layer - call identities and shared kernel

pub mod shared;
