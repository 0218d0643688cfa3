//! Session state, wire messages, and deduplication identities.
//!
//! A session is an ordered, reliable, bidirectional channel between two flows
//! on different nodes. Locally a session moves through three states:
//!
//! - [`SessionState::Uninitiated`] — opened by the flow, nothing sent yet
//! - [`SessionState::Initiating`] — the initiating message is on the wire,
//!   outbound payloads buffer until the peer confirms
//! - [`SessionState::Initiated`] — both sides know each other's session ids;
//!   data flows with per-session sequence numbers

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FlowError;
use crate::flow::FlowId;

/// A peer node's stable name on the message bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyName(String);

impl PartyName {
    /// Create a party name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PartyName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartyName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// An opaque 64-bit session token, unique per flow per peer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Derive the id of the `index`-th session opened by `flow_id`.
    ///
    /// The derivation folds the flow UUID with the session ordinal, so a
    /// replayed step that re-opens the same session lands on the same id.
    pub fn derive(flow_id: &FlowId, index: u64) -> Self {
        let bytes = flow_id.as_uuid().as_bytes();
        let hi = u64::from_le_bytes(bytes[..8].try_into().expect("uuid has 16 bytes"));
        let lo = u64::from_le_bytes(bytes[8..].try_into().expect("uuid has 16 bytes"));
        Self((hi ^ lo.rotate_left(17)) ^ (index.wrapping_add(1)).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    /// The raw token value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Deduplication identity for a message.
///
/// Collision-free by construction: normal messages are identified by their
/// sender and per-session sequence, error messages by the propagated error id
/// and the session it left through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DedupId {
    /// Identity of a data, confirm, or end message.
    Normal {
        /// The sending flow.
        sender: FlowId,
        /// The session the message belongs to, on the sender's side.
        session_id: SessionId,
        /// Monotonic per-session send sequence.
        seq: u64,
    },
    /// Identity of a propagated error message.
    Error {
        /// The error being propagated.
        error_id: u64,
        /// The sender-side session the error left through.
        source_session_id: SessionId,
    },
}

impl std::fmt::Display for DedupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DedupId::Normal {
                sender,
                session_id,
                seq,
            } => write!(f, "N:{sender}:{session_id}:{seq}"),
            DedupId::Error {
                error_id,
                source_session_id,
            } => write!(f, "E:{error_id}:{source_session_id}"),
        }
    }
}

/// Acknowledgement token for one inbound delivery.
///
/// The bus redelivers a message until its handler is acknowledged; the
/// engine acknowledges only after the commit that persisted the matching
/// dedup fact, so a crash in between replays the message and the durable
/// fact suppresses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupHandler {
    /// Deduplication identity of the delivered message.
    pub dedup_id: DedupId,
    /// Opaque per-delivery tag the bus expects back.
    pub delivery_tag: u64,
}

/// An error travelling across a session.
///
/// `flow_exception` is populated on the first hop of a user
/// [`FlowException`](crate::FlowException) only; otherwise the peer surfaces
/// a generic error correlated by `error_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSessionMessage {
    /// The exception payload, first hop only.
    pub flow_exception: Option<crate::error::FlowException>,
    /// Correlates this error with the flow that raised it.
    pub error_id: u64,
}

/// The first message of a session, carried to a peer that has no flow for it
/// yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialSessionMessage {
    /// The initiator's session id; the peer addresses replies to it.
    pub initiator_session_id: SessionId,
    /// Flow class the receiving node should instantiate.
    pub flow_class_name: String,
    /// Application identifier of the initiator.
    pub app_name: String,
    /// Platform version of the initiator.
    pub platform_version: u32,
    /// First payload, delivered to the peer flow as its start arguments.
    pub payload: Value,
}

/// Payload of a message on an already-known session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionPayload {
    /// Ordered application data.
    Data {
        /// Per-session send sequence, assigned by the sender.
        seq: u64,
        /// The application payload.
        payload: Value,
    },
    /// Initiation handshake reply carrying the confirmer's session id.
    Confirm {
        /// The session id the confirming side allocated.
        initiated_session_id: SessionId,
    },
    /// The sender closed its side of the session.
    End,
    /// The sender's flow errored.
    Error(ErrorSessionMessage),
}

/// A message addressed to an existing session on the recipient's side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistingSessionMessage {
    /// The recipient-side session id.
    pub recipient_session_id: SessionId,
    /// The payload.
    pub payload: SessionPayload,
}

/// Everything that travels on the bus between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// Opens a new session (and possibly a new flow) on the recipient.
    Initial(InitialSessionMessage),
    /// Continues an established (or confirming) session.
    Existing(ExistingSessionMessage),
}

/// A payload queued on a session, waiting for the flow to receive it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReceivedPayload {
    /// Ordered application data.
    Data(Value),
    /// The peer's flow errored; surfaced to user code when received.
    Error(FlowError),
}

/// Local view of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionState {
    /// Opened by the flow; nothing has been sent yet.
    Uninitiated {
        /// The peer to initiate to.
        destination: PartyName,
        /// Flow class the peer should instantiate.
        flow_class: String,
        /// Payload to deliver with initiation.
        payload: Value,
    },
    /// The initiating message is built (and possibly sent); outbound traffic
    /// buffers until the peer confirms.
    Initiating {
        /// Our session id.
        our_session_id: SessionId,
        /// The peer being initiated to.
        destination: PartyName,
        /// The initiation message.
        initiating_message: InitialSessionMessage,
        /// Whether the initiating message has been handed to the bus.
        sent: bool,
        /// Outbound payloads awaiting confirmation, in send order. Error
        /// payloads are prepended so a failing peer learns as early as
        /// possible.
        buffered_messages: Vec<(DedupId, SessionPayload)>,
        /// Set when the peer rejected the initiation.
        rejection_error: Option<FlowError>,
    },
    /// Both sides know each other's ids; data flows.
    Initiated {
        /// Our session id.
        our_session_id: SessionId,
        /// The peer's session id; outbound messages are addressed to it.
        peer_session_id: SessionId,
        /// The peer party.
        peer_party: PartyName,
        /// Sequence number for the next outbound data message.
        next_send_seq: u64,
        /// Inbound payloads not yet consumed by the flow, oldest first.
        received_messages: Vec<(u64, ReceivedPayload)>,
        /// The peer's flow errored; no further errors are sent to it.
        other_side_errored: bool,
        /// The peer closed its side.
        other_side_closed: bool,
    },
}

impl SessionState {
    /// Returns `true` once the handshake has completed.
    pub fn is_initiated(&self) -> bool {
        matches!(self, SessionState::Initiated { .. })
    }

    /// The peer party, once known.
    pub fn peer(&self) -> &PartyName {
        match self {
            SessionState::Uninitiated { destination, .. } => destination,
            SessionState::Initiating { destination, .. } => destination,
            SessionState::Initiated { peer_party, .. } => peer_party,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_id_derivation_is_deterministic() {
        let flow_id = FlowId::random();
        assert_eq!(SessionId::derive(&flow_id, 0), SessionId::derive(&flow_id, 0));
        assert_ne!(SessionId::derive(&flow_id, 0), SessionId::derive(&flow_id, 1));

        let other_flow = FlowId::random();
        assert_ne!(SessionId::derive(&flow_id, 0), SessionId::derive(&other_flow, 0));
    }

    #[test]
    fn dedup_ids_distinguish_normal_from_error() {
        let flow_id = FlowId::random();
        let session = SessionId::derive(&flow_id, 0);

        let normal = DedupId::Normal {
            sender: flow_id,
            session_id: session,
            seq: 1,
        };
        let error = DedupId::Error {
            error_id: 1,
            source_session_id: session,
        };
        assert_ne!(normal, error);
        assert!(normal.to_string().starts_with("N:"));
        assert!(error.to_string().starts_with("E:"));
    }

    #[test]
    fn wire_messages_round_trip() {
        let initial = SessionMessage::Initial(InitialSessionMessage {
            initiator_session_id: SessionId::from(42),
            flow_class_name: "quote".into(),
            app_name: "flowspan-test".into(),
            platform_version: 1,
            payload: json!({"symbol": "XAU"}),
        });
        let json = serde_json::to_value(&initial).unwrap();
        assert_eq!(serde_json::from_value::<SessionMessage>(json).unwrap(), initial);

        let existing = SessionMessage::Existing(ExistingSessionMessage {
            recipient_session_id: SessionId::from(42),
            payload: SessionPayload::Error(ErrorSessionMessage {
                flow_exception: None,
                error_id: 99,
            }),
        });
        let json = serde_json::to_value(&existing).unwrap();
        assert_eq!(serde_json::from_value::<SessionMessage>(json).unwrap(), existing);
    }
}
