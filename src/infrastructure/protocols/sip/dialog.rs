//! SIP dialog identity

use super::message::{SipHeaders, SipRequest, SipResponse};
use std::fmt;
use std::hash::{Hash, Hasher};

/// URI part of a From/To/Contact value
pub fn uri_text(value: &str) -> String {
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].trim().to_string(),
        _ => value.split(';').next().unwrap_or_default().trim().to_string(),
    }
}

/// Identity of one call leg.
///
/// Equality and hashing use the Call-ID and both tags; the URIs ride along
/// for building in-dialog requests. Tags stay `None` until learned.
#[derive(Debug, Clone, Default)]
pub struct Dialog {
    pub call_id: String,
    pub local_tag: Option<String>,
    pub remote_tag: Option<String>,
    pub local_uri: String,
    pub remote_uri: String,
}

impl Dialog {
    /// Dialog of a request we received; `local_tag` is the tag our responses carry
    pub fn from_incoming(request: &SipRequest, local_tag: Option<String>) -> Self {
        Self {
            call_id: request.call_id().unwrap_or_default(),
            local_tag: request.to_tag().or(local_tag),
            remote_tag: request.from_tag(),
            local_uri: request.to_value().map(|v| uri_text(&v)).unwrap_or_default(),
            remote_uri: request.from_value().map(|v| uri_text(&v)).unwrap_or_default(),
        }
    }

    /// Dialog of a request we sent
    pub fn from_outgoing(request: &SipRequest) -> Self {
        Self {
            call_id: request.call_id().unwrap_or_default(),
            local_tag: request.from_tag(),
            remote_tag: request.to_tag(),
            local_uri: request.from_value().map(|v| uri_text(&v)).unwrap_or_default(),
            remote_uri: request.to_value().map(|v| uri_text(&v)).unwrap_or_default(),
        }
    }

    /// Learn the remote tag from a response to our request.
    /// Returns true when the identity changed.
    pub fn learn_remote_tag(&mut self, response: &SipResponse) -> bool {
        match (self.remote_tag.as_ref(), response.to_tag()) {
            (None, Some(tag)) => {
                self.remote_tag = Some(tag);
                true
            }
            _ => false,
        }
    }
}

impl PartialEq for Dialog {
    fn eq(&self, other: &Self) -> bool {
        self.call_id == other.call_id
            && self.local_tag == other.local_tag
            && self.remote_tag == other.remote_tag
    }
}

impl Eq for Dialog {}

impl Hash for Dialog {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.call_id.hash(state);
        self.local_tag.hash(state);
        self.remote_tag.hash(state);
    }
}

impl fmt::Display for Dialog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}/{})",
            self.call_id,
            self.local_tag.as_deref().unwrap_or("-"),
            self.remote_tag.as_deref().unwrap_or("-")
        )
    }
}
