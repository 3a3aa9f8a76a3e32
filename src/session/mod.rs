//! MQTT Session Management
//!
//! Per-client session state and the QoS delivery state machine: subscriptions,
//! outbound in-flight tables, inbound QoS 2 records, the inbound QoS 1 replay
//! window and the offline queue of durable sessions.
//!
//! A session is always accessed through `Arc<RwLock<Session>>`. Holding the
//! write lock while sending is what orders redelivery, retained delivery and
//! live fan-out for one client.

mod registry;
mod replay;

pub use registry::{BindError, BindRequest, SessionRegistry};
pub use replay::ReplayWindow;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::broker::writer::PacketWriter;
use crate::protocol::{Packet, PubRel, Publish, QoS, Will};

/// Outbound QoS 2 handshake phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2State {
    /// PUBLISH sent, waiting for PUBREC
    AwaitingPubRec,
    /// PUBREC received, PUBREL sent, waiting for PUBCOMP
    AwaitingPubComp,
}

/// Outbound QoS 1 message awaiting PUBACK
#[derive(Debug, Clone)]
pub struct InflightMessage {
    /// The publish as first sent (packet id assigned)
    pub publish: Publish,
    /// Send order within the session, used to resend in original order
    pub seq: u64,
}

/// Outbound QoS 2 message in its handshake
#[derive(Debug, Clone)]
pub struct InflightQos2 {
    pub publish: Publish,
    pub state: Qos2State,
    pub seq: u64,
}

/// Outcome of handing a message to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the bound connection (or recorded in flight)
    Sent,
    /// Stored in the offline queue
    Queued,
    /// Discarded (QoS 0 without a writable connection, or no session to hold it)
    Dropped,
}

/// Per-session limits taken from configuration
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Offline queue bound; the oldest message is dropped when full
    pub max_queued_messages: usize,
    /// How long a completed inbound QoS 1 packet id is remembered
    pub replay_window: Duration,
    /// Maximum remembered packet ids
    pub replay_window_size: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_queued_messages: 1000,
            replay_window: Duration::from_secs(30),
            replay_window_size: 128,
        }
    }
}

/// Connection currently bound to a session
#[derive(Clone)]
pub struct BoundConnection {
    pub id: u64,
    pub writer: Arc<dyn PacketWriter>,
}

impl fmt::Debug for BoundConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundConnection").field("id", &self.id).finish()
    }
}

/// Client session
pub struct Session {
    /// Client identifier
    pub client_id: Arc<str>,
    /// Clean session flag of the CONNECT that created or last bound it
    pub clean_session: bool,
    /// Will message, published on abnormal disconnect
    pub will: Option<Will>,
    /// Subscriptions: filter -> granted QoS
    pub subscriptions: HashMap<String, QoS>,
    pub(crate) connection: Option<BoundConnection>,
    /// Outbound QoS 1 awaiting PUBACK
    pub(crate) qos1_pending: HashMap<u16, InflightMessage>,
    /// Outbound QoS 2 awaiting PUBREC or PUBCOMP
    pub(crate) qos2_pending: HashMap<u16, InflightQos2>,
    /// Inbound QoS 2 recorded on PUBLISH, released on PUBREL
    pub(crate) qos2_received: HashMap<u16, Publish>,
    pub(crate) replay: ReplayWindow,
    /// Messages accumulated while durably disconnected
    pub(crate) queue: VecDeque<Publish>,
    pub(crate) limits: SessionLimits,
    pub(crate) next_packet_id: u16,
    pub(crate) next_seq: u64,
}

impl Session {
    pub fn new(client_id: Arc<str>, clean_session: bool, limits: SessionLimits) -> Self {
        Self {
            client_id,
            clean_session,
            will: None,
            subscriptions: HashMap::new(),
            connection: None,
            qos1_pending: HashMap::new(),
            qos2_pending: HashMap::new(),
            qos2_received: HashMap::new(),
            replay: ReplayWindow::new(limits.replay_window, limits.replay_window_size),
            queue: VecDeque::new(),
            limits,
            next_packet_id: 1,
            next_seq: 0,
        }
    }

    // ------------------------------------------------------------------
    // Connection binding
    // ------------------------------------------------------------------

    /// Bind a connection, returning the previously bound one
    pub fn bind(&mut self, connection: BoundConnection) -> Option<BoundConnection> {
        self.connection.replace(connection)
    }

    /// Unbind `connection_id`; a stale id leaves the session untouched
    pub fn unbind(&mut self, connection_id: u64) -> bool {
        if self.is_bound_to(connection_id) {
            self.connection = None;
            true
        } else {
            false
        }
    }

    pub fn is_bound_to(&self, connection_id: u64) -> bool {
        self.connection.as_ref().is_some_and(|c| c.id == connection_id)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.connection.as_ref().map(|c| c.id)
    }

    /// Send a packet to the bound connection.
    ///
    /// Failures are logged and otherwise ignored: in-flight state is never
    /// rolled back because a write failed.
    pub fn send_packet(&self, packet: Packet) {
        let Some(conn) = &self.connection else {
            trace!(client_id = %self.client_id, "no connection bound, {:?} not sent", packet.packet_type());
            return;
        };
        if let Err(e) = conn.writer.send(packet) {
            debug!(client_id = %self.client_id, error = %e, "send failed");
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    pub fn add_subscription(&mut self, filter: &str, qos: QoS) {
        self.subscriptions.insert(filter.to_string(), qos);
    }

    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }

    // ------------------------------------------------------------------
    // Outbound delivery
    // ------------------------------------------------------------------

    /// Get the next packet identifier not used by an outbound in-flight record
    pub fn next_packet_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }

            if !self.qos1_pending.contains_key(&id) && !self.qos2_pending.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Deliver a message at the QoS and retain flag already set on `publish`.
    ///
    /// - QoS 0 is written only if the bound connection is writable
    /// - QoS 1/2 is recorded in flight, then sent; without a connection a
    ///   durable session queues it
    pub fn deliver(&mut self, mut publish: Publish) -> Delivery {
        publish.dup = false;

        if publish.qos == QoS::AtMostOnce {
            publish.packet_id = None;
            return match &self.connection {
                Some(conn) if conn.writer.is_writable() => {
                    self.send_packet(Packet::Publish(publish));
                    Delivery::Sent
                }
                _ => {
                    trace!(client_id = %self.client_id, topic = %publish.topic, "dropping QoS 0 message");
                    Delivery::Dropped
                }
            };
        }

        if self.connection.is_none() {
            return self.enqueue(publish);
        }

        let Some(packet_id) = self.next_packet_id() else {
            debug!(client_id = %self.client_id, "packet identifiers exhausted");
            return self.enqueue(publish);
        };
        publish.packet_id = Some(packet_id);
        let seq = self.take_seq();

        if publish.qos == QoS::AtLeastOnce {
            self.qos1_pending.insert(
                packet_id,
                InflightMessage {
                    publish: publish.clone(),
                    seq,
                },
            );
        } else {
            self.qos2_pending.insert(
                packet_id,
                InflightQos2 {
                    publish: publish.clone(),
                    state: Qos2State::AwaitingPubRec,
                    seq,
                },
            );
        }

        self.send_packet(Packet::Publish(publish));
        Delivery::Sent
    }

    /// Queue a QoS 1/2 message for a durable session
    fn enqueue(&mut self, mut publish: Publish) -> Delivery {
        if self.clean_session || publish.qos == QoS::AtMostOnce {
            return Delivery::Dropped;
        }
        if self.limits.max_queued_messages == 0 {
            return Delivery::Dropped;
        }
        if self.queue.len() >= self.limits.max_queued_messages {
            // Drop oldest message
            self.queue.pop_front();
            debug!(client_id = %self.client_id, "offline queue full, dropped oldest message");
        }
        publish.packet_id = None;
        self.queue.push_back(publish);
        Delivery::Queued
    }

    /// Resend in-flight records in original send order, then drain the
    /// offline queue through the normal outbound path.
    pub fn resume(&mut self) {
        let mut resend: Vec<(u64, Packet)> =
            Vec::with_capacity(self.qos1_pending.len() + self.qos2_pending.len());

        for msg in self.qos1_pending.values() {
            let mut publish = msg.publish.clone();
            publish.dup = true;
            resend.push((msg.seq, Packet::Publish(publish)));
        }
        for (&packet_id, msg) in &self.qos2_pending {
            let packet = match msg.state {
                Qos2State::AwaitingPubRec => {
                    let mut publish = msg.publish.clone();
                    publish.dup = true;
                    Packet::Publish(publish)
                }
                Qos2State::AwaitingPubComp => Packet::PubRel(PubRel::new(packet_id)),
            };
            resend.push((msg.seq, packet));
        }
        resend.sort_by_key(|(seq, _)| *seq);

        if !resend.is_empty() {
            debug!(client_id = %self.client_id, count = resend.len(), "resending in-flight messages");
        }
        for (_, packet) in resend {
            self.send_packet(packet);
        }

        let queued = std::mem::take(&mut self.queue);
        if !queued.is_empty() {
            debug!(client_id = %self.client_id, count = queued.len(), "draining offline queue");
        }
        for publish in queued {
            self.deliver(publish);
        }
    }

    /// PUBACK: complete an outbound QoS 1 message. Unknown ids are a no-op.
    pub fn handle_puback(&mut self, packet_id: u16) -> bool {
        self.qos1_pending.remove(&packet_id).is_some()
    }

    /// PUBREC: move an outbound QoS 2 message to phase 2 and send PUBREL.
    ///
    /// A PUBREC for a record already in phase 2 resends PUBREL. Unknown ids
    /// are ignored.
    pub fn handle_pubrec(&mut self, packet_id: u16) -> bool {
        let Some(msg) = self.qos2_pending.get_mut(&packet_id) else {
            return false;
        };
        msg.state = Qos2State::AwaitingPubComp;
        self.send_packet(Packet::PubRel(PubRel::new(packet_id)));
        true
    }

    /// PUBCOMP: complete a phase-2 QoS 2 message. A PUBCOMP for a record still
    /// waiting for PUBREC is ignored.
    pub fn handle_pubcomp(&mut self, packet_id: u16) -> bool {
        match self.qos2_pending.get(&packet_id) {
            Some(msg) if msg.state == Qos2State::AwaitingPubComp => {
                self.qos2_pending.remove(&packet_id);
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Whether an inbound QoS 1 publish is a retransmission of a message
    /// already completed within the replay window
    pub fn is_replayed_qos1(&self, publish: &Publish) -> bool {
        match publish.packet_id {
            Some(id) if publish.dup => self.replay.contains(id, Instant::now()),
            _ => false,
        }
    }

    /// Remember a dispatched inbound QoS 1 packet id
    pub fn complete_qos1(&mut self, packet_id: u16) {
        self.replay.record(packet_id, Instant::now());
    }

    /// Record an inbound QoS 2 publish, overwriting any earlier record for the id
    pub fn receive_qos2(&mut self, packet_id: u16, publish: Publish) {
        self.qos2_received.insert(packet_id, publish);
    }

    /// Release an inbound QoS 2 record on PUBREL
    pub fn release_qos2(&mut self, packet_id: u16) -> Option<Publish> {
        self.qos2_received.remove(&packet_id)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn qos1_pending(&self) -> &HashMap<u16, InflightMessage> {
        &self.qos1_pending
    }

    pub fn qos2_pending(&self) -> &HashMap<u16, InflightQos2> {
        &self.qos2_pending
    }

    pub fn qos2_received(&self) -> &HashMap<u16, Publish> {
        &self.qos2_received
    }

    pub fn queued(&self) -> &VecDeque<Publish> {
        &self.queue
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("connection", &self.connection)
            .field("subscriptions", &self.subscriptions.len())
            .field("qos1_pending", &self.qos1_pending.len())
            .field("qos2_pending", &self.qos2_pending.len())
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broker::writer::SendError;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory writer capturing sent packets
    #[derive(Default)]
    pub(crate) struct RecordingWriter {
        pub sent: Mutex<Vec<Packet>>,
        pub blocked: AtomicBool,
        pub closed: AtomicBool,
    }

    impl RecordingWriter {
        pub fn take(&self) -> Vec<Packet> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl PacketWriter for RecordingWriter {
        fn send(&self, packet: Packet) -> Result<(), SendError> {
            if self.closed.load(Ordering::Acquire) {
                return Err(SendError::Closed);
            }
            self.sent.lock().push(packet);
            Ok(())
        }

        fn is_writable(&self) -> bool {
            !self.closed.load(Ordering::Acquire) && !self.blocked.load(Ordering::Acquire)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    fn publish(topic: &str, qos: QoS, payload: &'static [u8]) -> Publish {
        Publish {
            qos,
            topic: topic.into(),
            payload: bytes::Bytes::from_static(payload),
            ..Default::default()
        }
    }

    fn connected(clean: bool) -> (Session, Arc<RecordingWriter>) {
        let writer = Arc::new(RecordingWriter::default());
        let mut session = Session::new("c1".into(), clean, SessionLimits::default());
        session.bind(BoundConnection {
            id: 1,
            writer: writer.clone(),
        });
        (session, writer)
    }

    #[test]
    fn test_qos0_sent_only_when_writable() {
        let (mut session, writer) = connected(true);
        assert_eq!(
            session.deliver(publish("t", QoS::AtMostOnce, b"a")),
            Delivery::Sent
        );

        writer.blocked.store(true, Ordering::Release);
        assert_eq!(
            session.deliver(publish("t", QoS::AtMostOnce, b"b")),
            Delivery::Dropped
        );

        let sent = writer.take();
        assert_eq!(sent.len(), 1);
        assert!(session.queued().is_empty());
    }

    #[test]
    fn test_qos0_never_queued_offline() {
        let mut session = Session::new("c1".into(), false, SessionLimits::default());
        assert_eq!(
            session.deliver(publish("t", QoS::AtMostOnce, b"a")),
            Delivery::Dropped
        );
        assert!(session.queued().is_empty());
    }

    #[test]
    fn test_qos1_flow() {
        let (mut session, writer) = connected(true);
        session.deliver(publish("t", QoS::AtLeastOnce, b"a"));

        let sent = writer.take();
        let Packet::Publish(p) = &sent[0] else {
            panic!("expected PUBLISH, got {:?}", sent[0]);
        };
        let id = p.packet_id.unwrap();
        assert!(session.qos1_pending().contains_key(&id));

        assert!(session.handle_puback(id));
        assert!(session.qos1_pending().is_empty());
        // unknown id is a no-op
        assert!(!session.handle_puback(id));
    }

    #[test]
    fn test_qos2_flow() {
        let (mut session, writer) = connected(true);
        session.deliver(publish("t", QoS::ExactlyOnce, b"a"));
        let id = match &writer.take()[0] {
            Packet::Publish(p) => p.packet_id.unwrap(),
            other => panic!("unexpected {:?}", other),
        };

        // PUBCOMP before PUBREC is ignored
        assert!(!session.handle_pubcomp(id));
        assert_eq!(session.qos2_pending()[&id].state, Qos2State::AwaitingPubRec);

        assert!(session.handle_pubrec(id));
        assert_eq!(session.qos2_pending()[&id].state, Qos2State::AwaitingPubComp);
        assert_eq!(writer.take(), vec![Packet::PubRel(PubRel::new(id))]);

        // duplicate PUBREC resends PUBREL
        assert!(session.handle_pubrec(id));
        assert_eq!(writer.take(), vec![Packet::PubRel(PubRel::new(id))]);

        assert!(session.handle_pubcomp(id));
        assert!(session.qos2_pending().is_empty());
        assert!(!session.handle_pubrec(id));
        assert!(writer.take().is_empty());
    }

    #[test]
    fn test_send_failure_keeps_inflight_record() {
        let (mut session, writer) = connected(false);
        writer.close();
        assert_eq!(
            session.deliver(publish("t", QoS::AtLeastOnce, b"a")),
            Delivery::Sent
        );
        assert_eq!(session.qos1_pending().len(), 1);
    }

    #[test]
    fn test_offline_queue_drops_oldest() {
        let limits = SessionLimits {
            max_queued_messages: 2,
            ..Default::default()
        };
        let mut session = Session::new("c1".into(), false, limits);
        session.deliver(publish("t", QoS::AtLeastOnce, b"1"));
        session.deliver(publish("t", QoS::AtLeastOnce, b"2"));
        assert_eq!(
            session.deliver(publish("t", QoS::ExactlyOnce, b"3")),
            Delivery::Queued
        );

        let payloads: Vec<Vec<u8>> = session.queued().iter().map(|p| p.payload.to_vec()).collect();
        assert_eq!(payloads, vec![b"2".to_vec(), b"3".to_vec()]);
    }

    #[test]
    fn test_clean_session_without_connection_drops() {
        let mut session = Session::new("c1".into(), true, SessionLimits::default());
        assert_eq!(
            session.deliver(publish("t", QoS::AtLeastOnce, b"1")),
            Delivery::Dropped
        );
    }

    #[test]
    fn test_resume_resends_in_order_then_drains_queue() {
        let (mut session, writer) = connected(false);
        session.deliver(publish("a", QoS::AtLeastOnce, b"1"));
        session.deliver(publish("b", QoS::ExactlyOnce, b"2"));
        session.deliver(publish("c", QoS::ExactlyOnce, b"3"));
        let ids: Vec<u16> = writer
            .take()
            .iter()
            .map(|p| match p {
                Packet::Publish(p) => p.packet_id.unwrap(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        session.handle_pubrec(ids[2]);
        writer.take();

        assert!(session.unbind(1));
        session.deliver(publish("d", QoS::AtLeastOnce, b"4"));
        assert_eq!(session.queued().len(), 1);

        let writer2 = Arc::new(RecordingWriter::default());
        session.bind(BoundConnection {
            id: 2,
            writer: writer2.clone(),
        });
        session.resume();

        let sent = writer2.take();
        assert_eq!(sent.len(), 4);
        match &sent[0] {
            Packet::Publish(p) => {
                assert!(p.dup);
                assert_eq!(p.packet_id, Some(ids[0]));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &sent[1] {
            Packet::Publish(p) => {
                assert!(p.dup);
                assert_eq!(p.packet_id, Some(ids[1]));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sent[2], Packet::PubRel(PubRel::new(ids[2])));
        match &sent[3] {
            Packet::Publish(p) => {
                assert!(!p.dup);
                assert_eq!(&*p.topic, "d");
                let id = p.packet_id.unwrap();
                assert!(!ids.contains(&id));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(session.queued().is_empty());
    }

    #[test]
    fn test_stale_unbind_is_noop() {
        let (mut session, _writer) = connected(false);
        assert!(!session.unbind(99));
        assert!(session.is_bound_to(1));
    }

    #[test]
    fn test_packet_ids_skip_zero_and_inflight() {
        let (mut session, _writer) = connected(false);
        session.next_packet_id = u16::MAX;
        session.deliver(publish("t", QoS::AtLeastOnce, b"a"));
        assert!(session.qos1_pending().contains_key(&u16::MAX));

        // wraps past zero
        assert_eq!(session.next_packet_id(), Some(1));

        session.next_packet_id = u16::MAX;
        // u16::MAX is in flight and must be skipped
        assert_eq!(session.next_packet_id(), Some(1));
    }

    #[test]
    fn test_inbound_qos1_replay_requires_dup() {
        let (mut session, _writer) = connected(false);
        let mut p = publish("t", QoS::AtLeastOnce, b"a");
        p.packet_id = Some(10);
        assert!(!session.is_replayed_qos1(&p));

        session.complete_qos1(10);
        assert!(!session.is_replayed_qos1(&p));
        p.dup = true;
        assert!(session.is_replayed_qos1(&p));
    }

    #[test]
    fn test_inbound_qos2_record_and_release() {
        let mut session = Session::new("c1".into(), false, SessionLimits::default());
        session.receive_qos2(3, publish("t", QoS::ExactlyOnce, b"old"));
        session.receive_qos2(3, publish("t", QoS::ExactlyOnce, b"new"));

        let released = session.release_qos2(3).unwrap();
        assert_eq!(&released.payload[..], b"new");
        assert!(session.release_qos2(3).is_none());
    }
}
