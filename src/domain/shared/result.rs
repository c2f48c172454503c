//! Domain result type

use super::error::DomainError;

/// Result type for registry and call-state operations
pub type Result<T> = std::result::Result<T, DomainError>;
