//! PUBLISH handling and message routing

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use super::{ClientConnection, Flow, PostOffice};
use crate::protocol::{Packet, ProtocolError, PubAck, PubComp, PubRec, PubRel, Publish, QoS, Will};
use crate::retained::RetainedMessage;
use crate::session::{Delivery, Session};
use crate::topic::validate_topic_name;

impl PostOffice {
    /// Handle an inbound PUBLISH
    ///
    /// - QoS 0: dispatched
    /// - QoS 1: dispatched unless a DUP replay of a completed id, then PUBACK
    /// - QoS 2: recorded (overwriting) and answered with PUBREC; dispatched on PUBREL
    pub(crate) fn handle_publish(
        &self,
        conn: &ClientConnection,
        session: &Arc<RwLock<Session>>,
        publish: Publish,
    ) -> Result<Flow, ProtocolError> {
        if let Err(e) = validate_topic_name(&publish.topic) {
            warn!(connection_id = conn.id, "Invalid topic name {:?}: {}", publish.topic, e);
            return Err(ProtocolError::InvalidTopic(e));
        }
        if publish.qos > self.config.max_qos {
            return Err(ProtocolError::ProtocolViolation("QoS exceeds maximum"));
        }

        match publish.qos {
            QoS::AtMostOnce => self.dispatch(publish),
            QoS::AtLeastOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or(ProtocolError::ProtocolViolation("QoS 1 PUBLISH without packet id"))?;

                if session.read().is_replayed_qos1(&publish) {
                    debug!(connection_id = conn.id, packet_id, "duplicate QoS 1 PUBLISH acknowledged");
                } else {
                    self.dispatch(publish);
                    session.write().complete_qos1(packet_id);
                }
                conn.reply(Packet::PubAck(PubAck::new(packet_id)));
            }
            QoS::ExactlyOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or(ProtocolError::ProtocolViolation("QoS 2 PUBLISH without packet id"))?;

                {
                    let mut session = session.write();
                    session.receive_qos2(packet_id, publish);
                    // stored before PUBREC so the message outlives a restart
                    self.registry.persist(&session);
                }
                conn.reply(Packet::PubRec(PubRec::new(packet_id)));
            }
        }

        Ok(Flow::Continue)
    }

    /// Handle PUBREL: release a recorded inbound QoS 2 message.
    ///
    /// PUBCOMP is sent even for unknown ids so a retransmitted PUBREL
    /// completes the client's flow.
    pub(crate) fn handle_pubrel(
        &self,
        conn: &ClientConnection,
        session: &Arc<RwLock<Session>>,
        pubrel: PubRel,
    ) {
        let released = session.write().release_qos2(pubrel.packet_id);
        match released {
            Some(publish) => {
                self.dispatch(publish);
                self.registry.persist(&session.read());
            }
            None => trace!(connection_id = conn.id, packet_id = pubrel.packet_id, "PUBREL for unknown id"),
        }
        conn.reply(Packet::PubComp(PubComp::new(pubrel.packet_id)));
    }

    /// Publish a will message on behalf of a client
    pub(crate) fn publish_will(&self, will: Will) {
        let publish = Publish {
            dup: false,
            qos: will.qos.min(self.config.max_qos),
            retain: will.retain,
            topic: Arc::from(will.topic),
            packet_id: None,
            payload: will.payload,
        };
        self.dispatch(publish);
    }

    /// Dispatch an accepted message: update the retained store, then fan out
    /// to every matching subscription.
    ///
    /// Must not be called while holding any session lock.
    pub fn dispatch(&self, publish: Publish) {
        if publish.retain {
            self.update_retained(&publish);
        }

        // matcher lock is released before any session is locked
        let subscribers = self.matcher.matches(&publish.topic);
        if subscribers.is_empty() {
            trace!(topic = %publish.topic, "no subscribers");
            return;
        }

        for subscriber in subscribers {
            let Some(session) = self.registry.retrieve(&subscriber.client_id) else {
                continue;
            };

            let outgoing = Publish {
                dup: false,
                qos: publish.qos.min(subscriber.qos),
                retain: false,
                topic: publish.topic.clone(),
                packet_id: None,
                payload: publish.payload.clone(),
            };

            let qos = outgoing.qos;
            let mut session = session.write();
            match session.deliver(outgoing) {
                Delivery::Queued => self.registry.persist(&session),
                Delivery::Sent if qos != QoS::AtMostOnce => self.registry.persist(&session),
                _ => {}
            }
        }
    }

    fn update_retained(&self, publish: &Publish) {
        if publish.payload.is_empty() {
            if self.retained.remove(&publish.topic).is_some() {
                debug!(topic = %publish.topic, "retained message cleared");
            }
            if let Some(persistence) = &self.persistence {
                persistence.delete_retained(&publish.topic);
            }
            return;
        }

        let message = RetainedMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
        };
        if let Some(persistence) = &self.persistence {
            persistence.save_retained(&message);
        }
        self.retained.set(message);
    }
}
