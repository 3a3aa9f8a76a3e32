//! Serializable data models for persistence.
//!
//! These are storage-friendly versions of runtime types that can be
//! serialized with bincode.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;

use super::PersistenceError;
use crate::protocol::{Publish, QoS, Will};
use crate::retained::RetainedMessage;
use crate::session::{
    InflightMessage, InflightQos2, Qos2State, ReplayWindow, Session, SessionLimits,
};

/// Stored retained message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    /// Unix timestamp in seconds when the message was stored
    pub timestamp_secs: u64,
}

/// Stored session
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub subscriptions: Vec<StoredSubscription>,
    /// Outbound QoS 1 awaiting PUBACK
    pub qos1_pending: Vec<StoredInflightMessage>,
    /// Outbound QoS 2 with handshake phase
    pub qos2_pending: Vec<StoredInflightMessage>,
    /// Inbound QoS 2 awaiting PUBREL
    pub qos2_received: Vec<StoredInflightMessage>,
    /// Offline queue, oldest first
    pub queued: Vec<StoredPublish>,
    pub will: Option<StoredWillMessage>,
    /// Next packet ID to use
    pub next_packet_id: u16,
}

/// Stored subscription
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: u8,
}

/// Stored inflight message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredInflightMessage {
    pub packet_id: u16,
    pub publish: StoredPublish,
    /// 0 = None, 1 = AwaitingPubRec, 2 = AwaitingPubComp
    pub qos2_state: u8,
    /// Original send order
    pub seq: u64,
}

/// Stored publish message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
}

/// Stored will message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredWillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

// ============================================================================
// Conversion implementations
// ============================================================================

pub(crate) fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl From<&Publish> for StoredPublish {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos as u8,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
        }
    }
}

/// Decode a stored QoS byte; out-of-range values mean the record is damaged
fn stored_qos(value: u8) -> Result<QoS, String> {
    QoS::from_u8(value).ok_or_else(|| format!("invalid QoS {}", value))
}

impl TryFrom<StoredPublish> for Publish {
    type Error = String;

    fn try_from(stored: StoredPublish) -> Result<Self, Self::Error> {
        Ok(Self {
            topic: Arc::from(stored.topic),
            payload: Bytes::from(stored.payload),
            qos: stored_qos(stored.qos)?,
            retain: stored.retain,
            dup: stored.dup,
            packet_id: stored.packet_id,
        })
    }
}

impl From<&Will> for StoredWillMessage {
    fn from(will: &Will) -> Self {
        Self {
            topic: will.topic.clone(),
            payload: will.payload.to_vec(),
            qos: will.qos as u8,
            retain: will.retain,
        }
    }
}

impl TryFrom<StoredWillMessage> for Will {
    type Error = String;

    fn try_from(stored: StoredWillMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            topic: stored.topic,
            payload: Bytes::from(stored.payload),
            qos: stored_qos(stored.qos)?,
            retain: stored.retain,
        })
    }
}

impl From<&RetainedMessage> for StoredRetainedMessage {
    fn from(rm: &RetainedMessage) -> Self {
        Self {
            topic: rm.topic.to_string(),
            payload: rm.payload.to_vec(),
            qos: rm.qos as u8,
            timestamp_secs: now_unix_secs(),
        }
    }
}

impl TryFrom<StoredRetainedMessage> for RetainedMessage {
    type Error = String;

    fn try_from(stored: StoredRetainedMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            qos: stored_qos(stored.qos)?,
            topic: Arc::from(stored.topic),
            payload: Bytes::from(stored.payload),
        })
    }
}

fn qos2_state_code(state: Qos2State) -> u8 {
    match state {
        Qos2State::AwaitingPubRec => 1,
        Qos2State::AwaitingPubComp => 2,
    }
}

fn qos2_state_from_code(code: u8) -> Result<Qos2State, String> {
    match code {
        1 => Ok(Qos2State::AwaitingPubRec),
        2 => Ok(Qos2State::AwaitingPubComp),
        other => Err(format!("invalid QoS 2 phase {}", other)),
    }
}

/// Decode an in-flight record, checking it carries the QoS of its table
fn inflight_publish(stored: StoredInflightMessage, expected: QoS) -> Result<Publish, String> {
    let packet_id = stored.packet_id;
    let publish = Publish::try_from(stored.publish)?;
    if publish.qos != expected {
        return Err(format!(
            "in-flight packet {} has QoS {:?}, expected {:?}",
            packet_id, publish.qos, expected
        ));
    }
    Ok(publish)
}

impl StoredSession {
    /// Snapshot a session for storage
    pub fn from_session(session: &Session) -> Self {
        let mut qos1_pending: Vec<_> = session
            .qos1_pending()
            .iter()
            .map(|(packet_id, msg)| StoredInflightMessage {
                packet_id: *packet_id,
                publish: StoredPublish::from(&msg.publish),
                qos2_state: 0,
                seq: msg.seq,
            })
            .collect();
        qos1_pending.sort_by_key(|m| m.seq);

        let mut qos2_pending: Vec<_> = session
            .qos2_pending()
            .iter()
            .map(|(packet_id, msg)| StoredInflightMessage {
                packet_id: *packet_id,
                publish: StoredPublish::from(&msg.publish),
                qos2_state: qos2_state_code(msg.state),
                seq: msg.seq,
            })
            .collect();
        qos2_pending.sort_by_key(|m| m.seq);

        let mut qos2_received: Vec<_> = session
            .qos2_received()
            .iter()
            .map(|(packet_id, publish)| StoredInflightMessage {
                packet_id: *packet_id,
                publish: StoredPublish::from(publish),
                qos2_state: 0,
                seq: 0,
            })
            .collect();
        qos2_received.sort_by_key(|m| m.packet_id);

        let mut subscriptions: Vec<_> = session
            .subscriptions
            .iter()
            .map(|(filter, qos)| StoredSubscription {
                filter: filter.clone(),
                qos: *qos as u8,
            })
            .collect();
        subscriptions.sort_by(|a, b| a.filter.cmp(&b.filter));

        Self {
            client_id: session.client_id.to_string(),
            subscriptions,
            qos1_pending,
            qos2_pending,
            qos2_received,
            queued: session.queued().iter().map(StoredPublish::from).collect(),
            will: session.will.as_ref().map(StoredWillMessage::from),
            next_packet_id: session.next_packet_id,
        }
    }

    /// Rebuild a durable, disconnected session.
    ///
    /// Fails with `CorruptSession` when any field is out of range; a damaged
    /// record is refused rather than restored with guessed values.
    pub fn into_session(self, limits: SessionLimits) -> Result<Session, PersistenceError> {
        let client_id: Arc<str> = Arc::from(self.client_id);
        let corrupt = |reason: String| PersistenceError::CorruptSession {
            client_id: client_id.to_string(),
            reason,
        };

        let mut qos1_pending = HashMap::with_capacity(self.qos1_pending.len());
        for m in self.qos1_pending {
            let (packet_id, seq) = (m.packet_id, m.seq);
            let publish = inflight_publish(m, QoS::AtLeastOnce).map_err(corrupt)?;
            qos1_pending.insert(packet_id, InflightMessage { publish, seq });
        }

        let mut qos2_pending = HashMap::with_capacity(self.qos2_pending.len());
        for m in self.qos2_pending {
            let (packet_id, seq) = (m.packet_id, m.seq);
            let state = qos2_state_from_code(m.qos2_state).map_err(corrupt)?;
            let publish = inflight_publish(m, QoS::ExactlyOnce).map_err(corrupt)?;
            qos2_pending.insert(packet_id, InflightQos2 { publish, state, seq });
        }

        let mut qos2_received = HashMap::with_capacity(self.qos2_received.len());
        for m in self.qos2_received {
            let packet_id = m.packet_id;
            let publish = inflight_publish(m, QoS::ExactlyOnce).map_err(corrupt)?;
            qos2_received.insert(packet_id, publish);
        }

        let subscriptions = self
            .subscriptions
            .into_iter()
            .map(|s| stored_qos(s.qos).map(|qos| (s.filter, qos)))
            .collect::<Result<HashMap<_, _>, String>>()
            .map_err(corrupt)?;

        let queue = self
            .queued
            .into_iter()
            .map(Publish::try_from)
            .collect::<Result<VecDeque<_>, String>>()
            .map_err(corrupt)?;

        let will = self.will.map(Will::try_from).transpose().map_err(corrupt)?;

        let next_seq = qos1_pending
            .values()
            .map(|m: &InflightMessage| m.seq)
            .chain(qos2_pending.values().map(|m: &InflightQos2| m.seq))
            .max()
            .map_or(0, |seq| seq + 1);

        Ok(Session {
            client_id,
            clean_session: false,
            will,
            subscriptions,
            connection: None,
            qos1_pending,
            qos2_pending,
            qos2_received,
            replay: ReplayWindow::new(limits.replay_window, limits.replay_window_size),
            queue,
            limits,
            next_packet_id: self.next_packet_id.max(1),
            next_seq,
        })
    }
}

/// Data loaded from persistence at startup
#[derive(Debug, Default)]
pub struct LoadedData {
    pub retained: Vec<(String, StoredRetainedMessage)>,
    pub sessions: Vec<(String, StoredSession)>,
    /// Client ids whose stored session failed to decode
    pub corrupted_sessions: Vec<String>,
}
