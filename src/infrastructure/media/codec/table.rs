//! Static codec table
//!
//! Maps internal codec names to RTP payload types and `rtpmap` encodings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Payload type always advertised for DTMF events
pub const TELEPHONE_EVENT_PAYLOAD: u8 = 101;
pub const TELEPHONE_EVENT_ENCODING: &str = "telephone-event/8000";

/// Audio codecs known to the negotiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Mulaw,
    Alaw,
    Gsm,
    Lpc10,
    Slin,
    G726,
    G722,
    G723,
    G728,
    G729,
}

const ALL: [Codec; 10] = [
    Codec::Mulaw,
    Codec::Alaw,
    Codec::Gsm,
    Codec::Lpc10,
    Codec::Slin,
    Codec::G726,
    Codec::G722,
    Codec::G723,
    Codec::G728,
    Codec::G729,
];

impl Codec {
    /// (name, payload type, rtpmap encoding)
    fn entry(&self) -> (&'static str, u8, &'static str) {
        match self {
            Codec::Mulaw => ("mulaw", 0, "PCMU/8000"),
            Codec::Alaw => ("alaw", 8, "PCMA/8000"),
            Codec::Gsm => ("gsm", 3, "GSM/8000"),
            Codec::Lpc10 => ("lpc10", 7, "LPC/8000"),
            Codec::Slin => ("slin", 11, "L16/8000"),
            Codec::G726 => ("g726", 2, "G726-32/8000"),
            Codec::G722 => ("g722", 9, "G722/8000"),
            Codec::G723 => ("g723", 4, "G723/8000"),
            Codec::G728 => ("g728", 15, "G728/8000"),
            Codec::G729 => ("g729", 18, "G729/8000"),
        }
    }

    pub fn name(&self) -> &'static str {
        self.entry().0
    }

    pub fn payload_type(&self) -> u8 {
        self.entry().1
    }

    /// Encoding string for `a=rtpmap` lines
    pub fn rtpmap(&self) -> &'static str {
        self.entry().2
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::all().find(|c| c.name().eq_ignore_ascii_case(name))
    }

    pub fn from_payload_type(payload_type: u8) -> Option<Self> {
        Self::all().find(|c| c.payload_type() == payload_type)
    }

    pub fn all() -> impl Iterator<Item = Codec> {
        ALL.into_iter()
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered codec list, rendered as comma-joined names ("alaw,mulaw")
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecList(Vec<Codec>);

impl CodecList {
    pub fn first(&self) -> Option<Codec> {
        self.0.first().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Codec> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Codec] {
        &self.0
    }
}

impl From<Vec<Codec>> for CodecList {
    fn from(codecs: Vec<Codec>) -> Self {
        Self(codecs)
    }
}

impl FromIterator<Codec> for CodecList {
    fn from_iter<I: IntoIterator<Item = Codec>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for CodecList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(Codec::name).collect();
        f.write_str(&names.join(","))
    }
}

/// Unknown names are skipped, as an offer may list codecs we never heard of.
impl FromStr for CodecList {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.split(',')
            .filter(|n| !n.trim().is_empty())
            .filter_map(Codec::from_name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_both_ways() {
        assert_eq!(Codec::from_name("mulaw"), Some(Codec::Mulaw));
        assert_eq!(Codec::Mulaw.payload_type(), 0);
        assert_eq!(Codec::Mulaw.rtpmap(), "PCMU/8000");
        assert_eq!(Codec::from_payload_type(8), Some(Codec::Alaw));
        assert_eq!(Codec::from_payload_type(3), Some(Codec::Gsm));
        assert_eq!(Codec::Slin.rtpmap(), "L16/8000");
        assert_eq!(Codec::from_payload_type(101), None);
        assert_eq!(Codec::from_payload_type(96), None);
    }

    #[test]
    fn test_every_codec_round_trips() {
        for codec in Codec::all() {
            assert_eq!(Codec::from_name(codec.name()), Some(codec));
            assert_eq!(Codec::from_payload_type(codec.payload_type()), Some(codec));
        }
        assert_eq!(Codec::all().count(), 10);
    }

    #[test]
    fn test_codec_list_text_form() {
        let list: CodecList = "alaw, mulaw,opus,,gsm".parse().unwrap();
        assert_eq!(list.as_slice(), &[Codec::Alaw, Codec::Mulaw, Codec::Gsm]);
        assert_eq!(list.to_string(), "alaw,mulaw,gsm");
        assert_eq!(list.first(), Some(Codec::Alaw));
        assert!(CodecList::default().to_string().is_empty());
    }
}
