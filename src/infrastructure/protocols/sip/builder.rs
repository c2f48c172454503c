//! SIP message builder utilities

use super::message::{header_param, SipError, SipHeaders, SipRequest, SipResponse};
use rand::Rng;
use rsip::prelude::UntypedHeader;
use rsip::{Header, Headers, Method, Request, Response, StatusCode, Uri, Version};
use std::net::SocketAddr;

/// Standard reason phrase for the status codes this layer emits
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        481 => "Call/Transaction Does Not Exist",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

pub fn generate_tag() -> String {
    let random: u32 = rand::thread_rng().gen();
    format!("{:08x}", random)
}

pub fn generate_branch() -> String {
    let random: u64 = rand::thread_rng().gen();
    format!("z9hG4bK{:x}", random)
}

pub fn generate_call_id(host: &str) -> String {
    let random: u64 = rand::thread_rng().gen();
    format!("{:016x}@{}", random, host)
}

/// Appends `;tag=` to a From/To value that has none yet
fn with_tag(value: &str, tag: &str) -> String {
    if header_param(value, "tag").is_some() {
        value.to_string()
    } else {
        format!("{};tag={}", value, tag)
    }
}

fn content_length(body: &[u8]) -> Header {
    Header::ContentLength(body.len().to_string().into())
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    reason: Option<String>,
    to_tag: Option<String>,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason: None,
            to_tag: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    /// Reason phrase for the status line; the standard one when unset
    pub fn reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn sdp(mut self, sdp: String) -> Self {
        self.headers
            .push(Header::ContentType("application/sdp".into()));
        self.body = sdp.into_bytes();
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    /// Local tag added to the To header unless the request already had one
    pub fn to_tag(mut self, tag: Option<String>) -> Self {
        self.to_tag = tag;
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> SipResponse {
        let mut headers = Vec::new();

        // Copy essential headers from request
        for header in request.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                Header::To(to) => match (&self.to_tag, self.status_code) {
                    (Some(tag), code) if code > 100 => {
                        headers.push(Header::To(with_tag(to.value(), tag).into()));
                    }
                    _ => headers.push(header.clone()),
                },
                _ => {}
            }
        }

        headers.extend(self.headers);
        headers.push(content_length(&self.body));

        let response = Response {
            status_code: StatusCode::Other(
                self.status_code,
                self.reason
                    .unwrap_or_else(|| reason_phrase(self.status_code).to_string()),
            ),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        SipResponse::new(response)
    }
}

/// Build an out-of-dialog or in-dialog request
pub struct RequestBuilder {
    method: Method,
    uri: Uri,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new(method: Method, uri: &str) -> Result<Self, SipError> {
        let uri = Uri::try_from(uri)?;
        Ok(Self {
            method,
            uri,
            headers: Vec::new(),
            body: Vec::new(),
        })
    }

    pub fn via(mut self, local: SocketAddr, branch: &str) -> Self {
        self.headers.push(Header::Via(
            format!("SIP/2.0/UDP {};rport;branch={}", local, branch).into(),
        ));
        self
    }

    pub fn from_party(mut self, uri: &str, tag: &str) -> Self {
        self.headers
            .push(Header::From(format!("<{}>;tag={}", uri, tag).into()));
        self
    }

    pub fn to_party(mut self, uri: &str, tag: Option<&str>) -> Self {
        let value = match tag {
            Some(tag) => format!("<{}>;tag={}", uri, tag),
            None => format!("<{}>", uri),
        };
        self.headers.push(Header::To(value.into()));
        self
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.headers.push(Header::CallId(call_id.into()));
        self
    }

    pub fn cseq(mut self, seq: u32) -> Self {
        let value = format!("{} {}", seq, self.method);
        self.headers.push(Header::CSeq(value.into()));
        self
    }

    pub fn contact(mut self, uri: &str) -> Self {
        self.headers
            .push(Header::Contact(format!("<{}>", uri).into()));
        self
    }

    pub fn user_agent(mut self, agent: &str) -> Self {
        self.headers.push(Header::UserAgent(agent.into()));
        self
    }

    pub fn sdp(mut self, sdp: String) -> Self {
        self.headers
            .push(Header::ContentType("application/sdp".into()));
        self.body = sdp.into_bytes();
        self
    }

    pub fn build(mut self) -> SipRequest {
        self.headers.push(Header::MaxForwards("70".into()));
        self.headers.push(content_length(&self.body));
        SipRequest::new(Request {
            method: self.method,
            uri: self.uri,
            version: Version::V2,
            headers: Headers::from(self.headers),
            body: self.body,
        })
    }
}

/// CANCEL for a pending INVITE: same Request-URI, Via, From, To and Call-ID
pub fn build_cancel(invite: &SipRequest) -> SipRequest {
    let seq = invite.cseq().map(|(seq, _)| seq).unwrap_or(1);
    let mut headers: Vec<Header> = invite
        .headers()
        .iter()
        .filter(|h| {
            matches!(
                h,
                Header::Via(_) | Header::From(_) | Header::To(_) | Header::CallId(_)
            )
        })
        .cloned()
        .collect();
    headers.push(Header::CSeq(format!("{} CANCEL", seq).into()));
    headers.push(Header::MaxForwards("70".into()));
    headers.push(Header::ContentLength("0".into()));

    SipRequest::new(Request {
        method: Method::Cancel,
        uri: invite.uri().clone(),
        version: Version::V2,
        headers: Headers::from(headers),
        body: Vec::new(),
    })
}

/// ACK for a final response to an INVITE we sent
pub fn build_ack(invite: &SipRequest, response: &SipResponse) -> SipRequest {
    let seq = invite.cseq().map(|(seq, _)| seq).unwrap_or(1);
    let mut headers = Vec::new();
    for header in invite.headers().iter() {
        match header {
            Header::Via(_) | Header::From(_) | Header::CallId(_) => headers.push(header.clone()),
            _ => {}
        }
    }
    if let Some(to) = response.to_value() {
        headers.push(Header::To(to.into()));
    }
    headers.push(Header::CSeq(format!("{} ACK", seq).into()));
    headers.push(Header::MaxForwards("70".into()));
    headers.push(Header::ContentLength("0".into()));

    SipRequest::new(Request {
        method: Method::Ack,
        uri: invite.uri().clone(),
        version: Version::V2,
        headers: Headers::from(headers),
        body: Vec::new(),
    })
}
