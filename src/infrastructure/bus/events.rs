//! Call lifecycle notifications

use super::messages::MediaForward;
use crate::domain::shared::{CallDirection, CallHandle, DomainEvent, EventMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallEventKind {
    Started {
        address: String,
        direction: CallDirection,
    },
    Ringing {
        forward: Option<MediaForward>,
    },
    Answered {
        forward: Option<MediaForward>,
    },
    Hangup {
        reason: String,
        code: u16,
    },
    RelayReleased {
        relay_id: String,
    },
}

/// Notification about one SIP call leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    pub metadata: EventMetadata,
    pub call: CallHandle,
    /// Paired internal leg, when known
    pub target: Option<String>,
    pub kind: CallEventKind,
}

impl CallEvent {
    pub fn new(call: CallHandle, target: Option<String>, kind: CallEventKind) -> Self {
        let event_type = Self::type_of(&kind);
        Self {
            metadata: EventMetadata::new(event_type),
            call,
            target,
            kind,
        }
    }

    fn type_of(kind: &CallEventKind) -> &'static str {
        match kind {
            CallEventKind::Started { .. } => "call.started",
            CallEventKind::Ringing { .. } => "call.ringing",
            CallEventKind::Answered { .. } => "call.answered",
            CallEventKind::Hangup { .. } => "call.hangup",
            CallEventKind::RelayReleased { .. } => "relay.released",
        }
    }
}

impl DomainEvent for CallEvent {
    fn event_type(&self) -> &'static str {
        Self::type_of(&self.kind)
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata.occurred_at
    }
}
