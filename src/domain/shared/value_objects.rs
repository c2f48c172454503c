//! Shared value objects used across the call-control layer

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CALL: AtomicU64 = AtomicU64::new(1);

/// Locally generated identifier of a SIP call leg ("sip/<n>")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallHandle(String);

impl CallHandle {
    pub const PREFIX: &'static str = "sip/";

    pub fn generate() -> Self {
        let n = NEXT_CALL.fetch_add(1, Ordering::Relaxed);
        Self(format!("{}{}", Self::PREFIX, n))
    }

    /// Accepts only identifiers in the `sip/` namespace
    pub fn parse(id: &str) -> Option<Self> {
        match id.strip_prefix(Self::PREFIX) {
            Some(rest) if !rest.is_empty() => Some(Self(id.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Call direction as seen from this endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Inbound => write!(f, "incoming"),
            CallDirection::Outbound => write!(f, "outgoing"),
        }
    }
}

/// SIP URI value object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    user: Option<String>,
    host: String,
    port: Option<u16>,
}

impl SipUri {
    pub fn new(user: Option<String>, host: String, port: Option<u16>) -> Self {
        Self { user, host, port }
    }

    /// Parses a bare URI or a name-addr (`"Bob" <sip:bob@host:5060>;tag=x`).
    pub fn parse(uri: &str) -> Result<Self, String> {
        let uri = uri.trim();
        let uri = match (uri.find('<'), uri.find('>')) {
            (Some(start), Some(end)) if start < end => &uri[start + 1..end],
            _ => uri,
        };

        let rest = uri
            .strip_prefix("sip:")
            .or_else(|| uri.strip_prefix("sips:"))
            .ok_or_else(|| "URI must start with 'sip:'".to_string())?;
        let rest = rest.split(|c| c == ';' || c == '?').next().unwrap_or_default();

        let (user, host_port) = match rest.rsplit_once('@') {
            Some((user, host_port)) => (Some(user.to_string()), host_port),
            None => (None, rest),
        };

        // IPv6 references are bracketed; the host is kept without brackets
        let (host, port) = match host_port.strip_prefix('[') {
            Some(bracketed) => {
                let (host, after) = bracketed
                    .split_once(']')
                    .ok_or_else(|| format!("Unterminated IPv6 reference: {}", host_port))?;
                match after {
                    "" => (host, None),
                    _ => (host, Some(parse_port(after.strip_prefix(':').unwrap_or(after))?)),
                }
            }
            None => match host_port.split_once(':') {
                Some((host, port)) => (host, Some(parse_port(port)?)),
                None => (host_port, None),
            },
        };

        if host.is_empty() {
            return Err("Invalid SIP URI format".to_string());
        }

        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

fn parse_port(port: &str) -> Result<u16, String> {
    port.parse()
        .map_err(|_| format!("Invalid port in SIP URI: {}", port))
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sip:")?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}
