//! SDP offer/answer handling
//!
//! Parsing is lenient: a malformed or partial body yields empty fields, which
//! callers treat as "no usable media". Building keeps a per-call
//! (session id, version) pair so every re-offer carries a higher version.

use crate::infrastructure::media::codec::{
    Codec, CodecList, CodecPolicy, TELEPHONE_EVENT_ENCODING, TELEPHONE_EVENT_PAYLOAD,
};
use serde::{Deserialize, Serialize};

/// Simple SDP session
#[derive(Debug, Clone, Default)]
pub struct SdpSession {
    pub version: u32,
    pub origin: Option<SdpOrigin>,
    pub session_name: String,
    pub connection: Option<SdpConnection>,
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, Clone)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct SdpConnection {
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub media_type: String,  // "audio", "video"
    pub port: u16,
    pub protocol: String,    // "RTP/AVP"
    pub formats: Vec<String>, // payload types
    pub rtpmap: Vec<(String, String)>, // (payload_type, encoding)
    pub connection: Option<SdpConnection>,
}

impl SdpConnection {
    fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        Some(Self {
            network_type: parts.next()?.to_string(),
            address_type: parts.next()?.to_string(),
            address: parts.next()?.to_string(),
        })
    }

    fn ip4(address: &str) -> Self {
        Self {
            network_type: "IN".to_string(),
            address_type: "IP4".to_string(),
            address: address.to_string(),
        }
    }

    /// Address usable for media; "0.0.0.0" means the stream is on hold
    fn usable_address(&self) -> Option<String> {
        if self.network_type != "IN" || self.address_type != "IP4" {
            return None;
        }
        let address = self.address.split('/').next().unwrap_or_default();
        if address.is_empty() || address == "0.0.0.0" {
            None
        } else {
            Some(address.to_string())
        }
    }
}

impl SdpSession {
    /// Convert to SDP string
    pub fn to_string(&self) -> String {
        let mut sdp = String::new();

        sdp.push_str(&format!("v={}\r\n", self.version));

        if let Some(origin) = &self.origin {
            sdp.push_str(&format!(
                "o={} {} {} IN IP4 {}\r\n",
                origin.username, origin.session_id, origin.session_version, origin.address
            ));
        }

        sdp.push_str(&format!("s={}\r\n", self.session_name));

        if let Some(conn) = &self.connection {
            sdp.push_str(&format!(
                "c={} {} {}\r\n",
                conn.network_type, conn.address_type, conn.address
            ));
        }

        sdp.push_str("t=0 0\r\n");

        for media in &self.media {
            sdp.push_str(&format!(
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                media.formats.join(" ")
            ));

            for (pt, encoding) in &media.rtpmap {
                sdp.push_str(&format!("a=rtpmap:{} {}\r\n", pt, encoding));
            }
        }

        sdp
    }

    /// Parse SDP from string
    pub fn parse(sdp_body: &str) -> Option<Self> {
        let mut session = SdpSession::default();
        let mut current_media: Option<SdpMedia> = None;
        let mut seen_version = false;

        for line in sdp_body.lines() {
            let line = line.trim();
            let Some((kind, value)) = line.split_once('=') else {
                continue;
            };

            match kind {
                "v" => {
                    session.version = value.trim().parse().unwrap_or(0);
                    seen_version = true;
                }
                "o" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        session.origin = Some(SdpOrigin {
                            username: parts[0].to_string(),
                            session_id: parts[1].to_string(),
                            session_version: parts[2].to_string(),
                            address: parts[5].to_string(),
                        });
                    }
                }
                "s" => session.session_name = value.to_string(),
                "c" => {
                    let conn = SdpConnection::parse(value);
                    match current_media.as_mut() {
                        Some(media) => media.connection = conn,
                        None if session.connection.is_none() => session.connection = conn,
                        None => {}
                    }
                }
                "m" => {
                    if let Some(media) = current_media.take() {
                        session.media.push(media);
                    }
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        current_media = Some(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].split('/').next()?.parse().unwrap_or(0),
                            protocol: parts[2].to_string(),
                            formats: parts[3..].iter().map(|s| s.to_string()).collect(),
                            rtpmap: Vec::new(),
                            connection: None,
                        });
                    }
                }
                "a" => {
                    if let (Some(media), Some(map)) =
                        (current_media.as_mut(), value.strip_prefix("rtpmap:"))
                    {
                        if let Some((pt, encoding)) = map.split_once(' ') {
                            media.rtpmap.push((pt.to_string(), encoding.trim().to_string()));
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(media) = current_media {
            session.media.push(media);
        }

        if !seen_version && session.media.is_empty() {
            return None;
        }
        Some(session)
    }

    /// Get the first audio media description
    pub fn audio_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }
}

/// Media parameters learned from a remote SDP body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaOffer {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub codecs: CodecList,
}

/// Extract the audio stream of an offer or answer, keeping only payload
/// types the codec table knows and the policy enables.
pub fn parse_offer(body: &str, policy: &CodecPolicy) -> MediaOffer {
    let Some(session) = SdpSession::parse(body) else {
        return MediaOffer::default();
    };

    let mut offer = MediaOffer {
        address: session.connection.as_ref().and_then(SdpConnection::usable_address),
        ..MediaOffer::default()
    };

    let Some(audio) = session.audio_media() else {
        return offer;
    };

    if audio.protocol.starts_with("RTP/AVP") {
        offer.port = Some(audio.port).filter(|p| *p != 0);
        let known: CodecList = audio
            .formats
            .iter()
            .filter_map(|pt| pt.parse::<u8>().ok())
            .filter_map(Codec::from_payload_type)
            .collect();
        offer.codecs = policy.filter(&known);
    }

    if offer.address.is_none() {
        offer.address = audio.connection.as_ref().and_then(SdpConnection::usable_address);
    }

    offer
}

/// Builds outgoing bodies for one call, owning its session id and version
#[derive(Debug, Clone)]
pub struct SdpBuilder {
    owner: String,
    session: Option<(u64, u64)>,
}

impl SdpBuilder {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            session: None,
        }
    }

    /// (session id, version) of the most recent body, if any was built
    pub fn session(&self) -> Option<(u64, u64)> {
        self.session
    }

    fn next_version(&mut self) -> (u64, u64) {
        let next = match self.session {
            Some((id, version)) => (id, version + 1),
            None => {
                let now = chrono::Utc::now().timestamp().max(1) as u64;
                (now, now)
            }
        };
        self.session = Some(next);
        next
    }

    /// Returns `None` when no address is known. A missing port advertises a
    /// held stream (port 1, connection 0.0.0.0). With `chosen` only that
    /// codec is listed; otherwise `formats` (or alaw,mulaw when empty).
    pub fn build(
        &mut self,
        address: Option<&str>,
        port: Option<u16>,
        formats: &CodecList,
        chosen: Option<Codec>,
        policy: &CodecPolicy,
    ) -> Option<String> {
        let address = address.filter(|a| !a.is_empty())?;
        let (session_id, version) = self.next_version();

        let (address, port) = match port {
            Some(port) => (address, port),
            None => ("0.0.0.0", 1),
        };

        let candidates: Vec<Codec> = match chosen {
            Some(codec) => vec![codec],
            None if !formats.is_empty() => formats.as_slice().to_vec(),
            None => vec![Codec::Alaw, Codec::Mulaw],
        };

        let mut formats_line = Vec::new();
        let mut rtpmap = Vec::new();
        for codec in candidates.into_iter().filter(|c| policy.is_enabled(*c)) {
            let pt = codec.payload_type().to_string();
            if formats_line.contains(&pt) {
                continue;
            }
            formats_line.push(pt.clone());
            rtpmap.push((pt, codec.rtpmap().to_string()));
        }
        formats_line.push(TELEPHONE_EVENT_PAYLOAD.to_string());
        rtpmap.push((
            TELEPHONE_EVENT_PAYLOAD.to_string(),
            TELEPHONE_EVENT_ENCODING.to_string(),
        ));

        let session = SdpSession {
            version: 0,
            origin: Some(SdpOrigin {
                username: self.owner.clone(),
                session_id: session_id.to_string(),
                session_version: version.to_string(),
                address: address.to_string(),
            }),
            session_name: "Session".to_string(),
            connection: Some(SdpConnection::ip4(address)),
            media: vec![SdpMedia {
                media_type: "audio".to_string(),
                port,
                protocol: "RTP/AVP".to_string(),
                formats: formats_line,
                rtpmap,
                connection: None,
            }],
        };

        Some(session.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(body_codecs: &str) -> String {
        format!(
            "v=0\r\no=alice 1 1 IN IP4 10.0.0.5\r\ns=-\r\nc=IN IP4 10.0.0.5\r\nt=0 0\r\n\
             m=audio 20000 RTP/AVP {}\r\na=rtpmap:0 PCMU/8000\r\n",
            body_codecs
        )
    }

    #[test]
    fn test_parse_offer() {
        let media = parse_offer(&offer("8 0 101"), &CodecPolicy::default());
        assert_eq!(media.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(media.port, Some(20000));
        assert_eq!(media.codecs.to_string(), "alaw,mulaw");
    }

    #[test]
    fn test_codec_filtering_keeps_relative_order() {
        let policy = CodecPolicy::new(true)
            .with(Codec::Alaw, true)
            .with(Codec::Gsm, false);
        let media = parse_offer(&offer("0 8 3"), &policy);
        assert_eq!(media.codecs.to_string(), "mulaw,alaw");
    }

    #[test]
    fn test_muted_and_malformed_bodies() {
        let held = offer("0").replace("c=IN IP4 10.0.0.5", "c=IN IP4 0.0.0.0");
        let media = parse_offer(&held, &CodecPolicy::default());
        assert_eq!(media.address, None);
        assert_eq!(media.port, Some(20000));

        assert_eq!(parse_offer("garbage", &CodecPolicy::default()), MediaOffer::default());
        let no_media = parse_offer("v=0\r\nc=IN IP4 1.2.3.4\r\n", &CodecPolicy::default());
        assert_eq!(no_media.address.as_deref(), Some("1.2.3.4"));
        assert_eq!(no_media.port, None);
        assert!(no_media.codecs.is_empty());
    }

    #[test]
    fn test_media_level_connection() {
        let body = "v=0\r\ns=-\r\nt=0 0\r\nm=audio 4000 RTP/AVP 0\r\nc=IN IP4 192.168.1.9\r\n";
        let media = parse_offer(body, &CodecPolicy::default());
        assert_eq!(media.address.as_deref(), Some("192.168.1.9"));
        assert_eq!(media.port, Some(4000));
    }

    #[test]
    fn test_build_requires_address() {
        let mut builder = SdpBuilder::new("sipchan");
        assert!(builder
            .build(None, Some(4000), &CodecList::default(), None, &CodecPolicy::default())
            .is_none());
        assert!(builder.session().is_none());
    }

    #[test]
    fn test_build_layout() {
        let mut builder = SdpBuilder::new("sipchan");
        let body = builder
            .build(
                Some("10.0.0.1"),
                Some(30000),
                &"alaw,mulaw".parse().unwrap(),
                Some(Codec::Alaw),
                &CodecPolicy::default(),
            )
            .unwrap();
        let (id, version) = builder.session().unwrap();
        let expected = format!(
            "v=0\r\no=sipchan {} {} IN IP4 10.0.0.1\r\ns=Session\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\n\
             m=audio 30000 RTP/AVP 8 101\r\na=rtpmap:8 PCMA/8000\r\n\
             a=rtpmap:101 telephone-event/8000\r\n",
            id, version
        );
        assert_eq!(body, expected);
    }

    #[test]
    fn test_build_without_port_is_on_hold() {
        let mut builder = SdpBuilder::new("sipchan");
        let body = builder
            .build(Some("10.0.0.1"), None, &CodecList::default(), None, &CodecPolicy::default())
            .unwrap();
        assert!(body.contains("c=IN IP4 0.0.0.0\r\n"));
        assert!(body.contains("m=audio 1 RTP/AVP 8 0 101\r\n"));
    }

    #[test]
    fn test_version_increments() {
        let mut builder = SdpBuilder::new("sipchan");
        let list = CodecList::default();
        let policy = CodecPolicy::default();
        builder.build(Some("10.0.0.1"), Some(1000), &list, None, &policy);
        let (id, first) = builder.session().unwrap();
        builder.build(Some("10.0.0.1"), Some(1000), &list, None, &policy);
        assert_eq!(builder.session(), Some((id, first + 1)));
    }

    #[test]
    fn test_round_trip_preserves_codecs() {
        let policy = CodecPolicy::default();
        let parsed = parse_offer(&offer("0 8 101"), &policy);
        let mut builder = SdpBuilder::new("sipchan");
        let body = builder
            .build(
                parsed.address.as_deref(),
                parsed.port,
                &parsed.codecs,
                None,
                &policy,
            )
            .unwrap();
        let reparsed = parse_offer(&body, &policy);
        assert_eq!(reparsed.codecs, parsed.codecs);
        assert_eq!(body.matches("telephone-event/8000").count(), 1);
        assert_eq!(body.matches("a=rtpmap:101 ").count(), 1);
        assert!(body.contains("m=audio 20000 RTP/AVP 0 8 101\r\n"));
    }
}
