//! SIP message types and header access

use crate::domain::shared::SipUri;
use bytes::Bytes;
use rsip::prelude::UntypedHeader;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::TransportError(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Subscribe,
    Notify,
    Refer,
    Message,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            Method::Info => Some(SipMethod::Info),
            Method::Update => Some(SipMethod::Update),
            Method::Subscribe => Some(SipMethod::Subscribe),
            Method::Notify => Some(SipMethod::Notify),
            Method::Refer => Some(SipMethod::Refer),
            Method::Message => Some(SipMethod::Message),
            _ => None,
        }
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Options => Method::Options,
            SipMethod::Info => Method::Info,
            SipMethod::Update => Method::Update,
            SipMethod::Subscribe => Method::Subscribe,
            SipMethod::Notify => Method::Notify,
            SipMethod::Refer => Method::Refer,
            SipMethod::Message => Method::Message,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        [
            SipMethod::Register,
            SipMethod::Invite,
            SipMethod::Ack,
            SipMethod::Cancel,
            SipMethod::Bye,
            SipMethod::Options,
            SipMethod::Info,
            SipMethod::Update,
            SipMethod::Subscribe,
            SipMethod::Notify,
            SipMethod::Refer,
            SipMethod::Message,
        ]
        .into_iter()
        .find(|m| m.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Value of a `;name=value` parameter inside a header value
pub fn header_param(value: &str, name: &str) -> Option<String> {
    value
        .split(';')
        .skip(1)
        .filter_map(|p| p.trim().split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}

/// Header lookups shared by requests and responses
pub trait SipHeaders {
    fn headers(&self) -> &Headers;

    fn body(&self) -> &[u8];

    fn call_id(&self) -> Option<String> {
        self.headers().iter().find_map(|h| match h {
            Header::CallId(cid) => Some(cid.value().trim().to_string()),
            _ => None,
        })
    }

    fn from_value(&self) -> Option<String> {
        self.headers().iter().find_map(|h| match h {
            Header::From(from) => Some(from.value().trim().to_string()),
            _ => None,
        })
    }

    fn to_value(&self) -> Option<String> {
        self.headers().iter().find_map(|h| match h {
            Header::To(to) => Some(to.value().trim().to_string()),
            _ => None,
        })
    }

    fn from_tag(&self) -> Option<String> {
        self.from_value().and_then(|v| header_param(&v, "tag"))
    }

    fn to_tag(&self) -> Option<String> {
        self.to_value().and_then(|v| header_param(&v, "tag"))
    }

    fn from_uri(&self) -> Option<SipUri> {
        self.from_value().and_then(|v| SipUri::parse(&v).ok())
    }

    fn to_uri(&self) -> Option<SipUri> {
        self.to_value().and_then(|v| SipUri::parse(&v).ok())
    }

    /// CSeq number and method name
    fn cseq(&self) -> Option<(u32, String)> {
        self.headers().iter().find_map(|h| match h {
            Header::CSeq(cseq) => {
                let mut parts = cseq.value().split_whitespace();
                let seq = parts.next()?.parse().ok()?;
                let method = parts.next()?.to_ascii_uppercase();
                Some((seq, method))
            }
            _ => None,
        })
    }

    /// Value of the topmost Via header
    fn top_via(&self) -> Option<String> {
        self.headers().iter().find_map(|h| match h {
            Header::Via(via) => Some(via.value().trim().to_string()),
            _ => None,
        })
    }

    fn branch(&self) -> Option<String> {
        self.top_via().and_then(|v| header_param(&v, "branch"))
    }

    fn contact(&self) -> Option<String> {
        self.headers().iter().find_map(|h| match h {
            Header::Contact(contact) => Some(contact.value().trim().to_string()),
            _ => None,
        })
    }

    fn contact_uri(&self) -> Option<SipUri> {
        self.contact().and_then(|v| SipUri::parse(&v).ok())
    }

    fn user_agent(&self) -> Option<String> {
        self.headers().iter().find_map(|h| match h {
            Header::UserAgent(ua) => Some(ua.value().trim().to_string()),
            _ => None,
        })
    }

    fn expires(&self) -> Option<String> {
        self.headers().iter().find_map(|h| match h {
            Header::Expires(expires) => Some(expires.value().trim().to_string()),
            _ => None,
        })
    }

    fn content_type(&self) -> Option<String> {
        self.headers().iter().find_map(|h| match h {
            Header::ContentType(ct) => Some(ct.value().trim().to_ascii_lowercase()),
            _ => None,
        })
    }

    /// Headers rsip keeps untyped, looked up by name
    fn header_value(&self, name: &str) -> Option<String> {
        self.headers().iter().find_map(|h| match h {
            Header::Other(n, v) if n.eq_ignore_ascii_case(name) => Some(v.trim().to_string()),
            _ => None,
        })
    }

    /// SDP body, if the message carries one
    fn sdp(&self) -> Option<&str> {
        if self.body().is_empty() {
            return None;
        }
        match self.content_type() {
            Some(ct) if !ct.starts_with("application/sdp") => None,
            _ => std::str::from_utf8(self.body()).ok(),
        }
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn method_name(&self) -> String {
        self.inner.method.to_string()
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl SipHeaders for SipRequest {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    fn body(&self) -> &[u8] {
        &self.inner.body
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code() < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl SipHeaders for SipResponse {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    fn body(&self) -> &[u8] {
        &self.inner.body
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Try parsing as request first
        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }

        // Try parsing as response
        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }

        Err(SipError::ParseError(
            "Could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

impl SipHeaders for SipMessage {
    fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => req.headers(),
            SipMessage::Response(resp) => resp.headers(),
        }
    }

    fn body(&self) -> &[u8] {
        match self {
            SipMessage::Request(req) => req.body(),
            SipMessage::Response(resp) => resp.body(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &[u8] = b"INVITE sip:100@10.0.0.1 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bK776asdhds;rport\r\n\
        From: \"Alice\" <sip:alice@10.0.0.5>;tag=1928301774\r\n\
        To: <sip:100@10.0.0.1>\r\n\
        Call-ID: a84b4c76e66710@pc33.example.com\r\n\
        CSeq: 314159 INVITE\r\n\
        Contact: <sip:alice@10.0.0.5:5060>\r\n\
        User-Agent: softphone/1.0\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 4\r\n\r\n\
        v=0\n";

    #[test]
    fn test_parse_invite_headers() {
        let msg = SipMessage::parse(INVITE).unwrap();
        let req = msg.as_request().unwrap();
        assert_eq!(req.method(), Some(SipMethod::Invite));
        assert_eq!(req.call_id().as_deref(), Some("a84b4c76e66710@pc33.example.com"));
        assert_eq!(req.cseq(), Some((314159, "INVITE".to_string())));
        assert_eq!(req.from_tag().as_deref(), Some("1928301774"));
        assert_eq!(req.to_tag(), None);
        assert_eq!(req.branch().as_deref(), Some("z9hG4bK776asdhds"));
        assert_eq!(req.user_agent().as_deref(), Some("softphone/1.0"));
        assert_eq!(req.from_uri().unwrap().user(), Some("alice"));
        assert_eq!(req.contact_uri().unwrap().port(), Some(5060));
        assert_eq!(req.sdp(), Some("v=0\n"));
    }

    #[test]
    fn test_parse_response() {
        let data = b"SIP/2.0 180 Ringing\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Bob <sip:bob@example.com>;tag=a6c85cf\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 1 INVITE\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status_code(), 180);
        assert!(resp.is_provisional());
        assert_eq!(resp.to_tag().as_deref(), Some("a6c85cf"));
        assert_eq!(resp.sdp(), None);
    }

    #[test]
    fn test_header_param() {
        assert_eq!(header_param("<sip:a@b>;tag=xy;lr", "tag").as_deref(), Some("xy"));
        assert_eq!(header_param("SIP/2.0/UDP h;BRANCH=z9", "branch").as_deref(), Some("z9"));
        assert_eq!(header_param("<sip:a@b>;tag=", "tag"), None);
        assert_eq!(header_param("<sip:a@b>", "tag"), None);
    }

    #[test]
    fn test_method_names() {
        assert_eq!(SipMethod::parse("bye"), Some(SipMethod::Bye));
        assert_eq!(SipMethod::parse("PUBLISH"), None);
        assert_eq!(SipMethod::Cancel.to_rsip(), Method::Cancel);
    }
}
