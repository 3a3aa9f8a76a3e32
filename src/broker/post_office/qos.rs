//! Acknowledgements for outbound QoS 1/2 messages
//!
//! Every accepted acknowledgement moves the in-flight tables, so durable
//! sessions are snapshotted right after.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::PostOffice;
use crate::protocol::{PubAck, PubComp, PubRec};
use crate::session::Session;

impl PostOffice {
    pub(crate) fn handle_puback(
        &self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        puback: PubAck,
    ) {
        let mut session = session.write();
        if session.handle_puback(puback.packet_id) {
            self.registry.persist(&session);
        } else {
            trace!(client_id = %client_id, packet_id = puback.packet_id, "PUBACK for unknown id");
        }
    }

    /// PUBREC moves the message to phase 2; the session sends PUBREL
    pub(crate) fn handle_pubrec(
        &self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        pubrec: PubRec,
    ) {
        let mut session = session.write();
        if session.handle_pubrec(pubrec.packet_id) {
            self.registry.persist(&session);
        } else {
            trace!(client_id = %client_id, packet_id = pubrec.packet_id, "PUBREC for unknown id");
        }
    }

    pub(crate) fn handle_pubcomp(
        &self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        pubcomp: PubComp,
    ) {
        let mut session = session.write();
        if session.handle_pubcomp(pubcomp.packet_id) {
            self.registry.persist(&session);
        } else {
            trace!(client_id = %client_id, packet_id = pubcomp.packet_id, "PUBCOMP for unknown id");
        }
    }
}
