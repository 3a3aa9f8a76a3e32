//! SUBSCRIBE and UNSUBSCRIBE packet handling

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{ClientConnection, Flow, PostOffice};
use crate::protocol::{
    Packet, ProtocolError, Publish, SubAck, SubAckReturnCode, Subscribe, UnsubAck, Unsubscribe,
};
use crate::session::Session;
use crate::topic::validate_topic_filter;

impl PostOffice {
    /// Handle SUBSCRIBE packet
    ///
    /// A malformed filter anywhere in the packet closes the connection
    /// without a SUBACK. Otherwise every filter is granted
    /// `min(requested, max_qos)`, SUBACK is sent, and matching retained
    /// messages follow, all while the session is locked so no live message
    /// for these filters can overtake them.
    pub(crate) fn handle_subscribe(
        &self,
        conn: &ClientConnection,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        subscribe: Subscribe,
    ) -> Result<Flow, ProtocolError> {
        for sub in &subscribe.subscriptions {
            if let Err(e) = validate_topic_filter(&sub.filter) {
                warn!(client_id = %client_id, "Invalid topic filter {:?}: {}", sub.filter, e);
                return Err(ProtocolError::InvalidTopic(e));
            }
        }

        let mut s = session.write();

        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        for sub in &subscribe.subscriptions {
            let granted = sub.qos.min(self.config.max_qos);
            s.add_subscription(&sub.filter, granted);
            self.matcher.index(&sub.filter, client_id, granted);
            return_codes.push(SubAckReturnCode::Granted(granted));
            debug!(client_id = %client_id, filter = %sub.filter, qos = ?granted, "subscribed");
        }

        conn.reply(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }));

        for sub in &subscribe.subscriptions {
            let granted = sub.qos.min(self.config.max_qos);
            for retained in self.retained.matching(&sub.filter) {
                s.deliver(Publish {
                    dup: false,
                    qos: retained.qos.min(granted),
                    retain: true,
                    topic: retained.topic,
                    packet_id: None,
                    payload: retained.payload,
                });
            }
        }

        self.registry.persist(&s);
        Ok(Flow::Continue)
    }

    /// Handle UNSUBSCRIBE packet. Unknown filters are acknowledged too.
    pub(crate) fn handle_unsubscribe(
        &self,
        conn: &ClientConnection,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        unsubscribe: Unsubscribe,
    ) {
        let mut s = session.write();
        for filter in &unsubscribe.filters {
            s.remove_subscription(filter);
            self.matcher.remove(filter, client_id);
        }

        conn.reply(Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
        }));

        self.registry.persist(&s);
    }
}
