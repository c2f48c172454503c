//! Per-codec enable policy

use super::table::{Codec, CodecList};
use crate::config::CodecConfig;
use std::collections::HashMap;

/// Decides which codecs may be offered or accepted.
///
/// A codec named in `overrides` uses that flag; all others use `default`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecPolicy {
    default: bool,
    overrides: HashMap<Codec, bool>,
}

impl CodecPolicy {
    pub fn new(default: bool) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with(mut self, codec: Codec, enabled: bool) -> Self {
        self.overrides.insert(codec, enabled);
        self
    }

    pub fn is_enabled(&self, codec: Codec) -> bool {
        self.overrides.get(&codec).copied().unwrap_or(self.default)
    }

    /// Keeps enabled codecs, preserving order
    pub fn filter(&self, codecs: &CodecList) -> CodecList {
        codecs.iter().copied().filter(|c| self.is_enabled(*c)).collect()
    }
}

impl Default for CodecPolicy {
    fn default() -> Self {
        Self::new(true)
    }
}

impl From<&CodecConfig> for CodecPolicy {
    fn from(config: &CodecConfig) -> Self {
        let mut policy = Self::new(config.default);
        for (name, enabled) in &config.overrides {
            match Codec::from_name(name) {
                Some(codec) => policy = policy.with(codec, *enabled),
                None => tracing::warn!("Ignoring policy for unknown codec '{}'", name),
            }
        }
        policy
    }
}
