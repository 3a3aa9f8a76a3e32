//! DISCONNECT and connection loss

use tracing::{debug, info};

use super::{ClientConnection, ConnectionState, PostOffice};

impl PostOffice {
    /// Graceful DISCONNECT: the will is discarded
    pub(crate) fn handle_disconnect(&self, conn: &mut ClientConnection) {
        let state = std::mem::replace(&mut conn.state, ConnectionState::Disconnected);
        let ConnectionState::Connected { client_id, session } = state else {
            return;
        };

        {
            let mut s = session.write();
            if s.is_bound_to(conn.id) {
                s.will = None;
            }
        }
        self.registry.disconnect(&client_id, conn.id);
        info!(client_id = %client_id, connection_id = conn.id, "client disconnected");
    }

    /// The network connection ended without DISCONNECT.
    ///
    /// If this connection still owns the session its will is published,
    /// then the session is released (clean) or saved (durable). A connection
    /// that lost its session to a takeover does nothing.
    pub(crate) fn handle_connection_lost(&self, conn: &mut ClientConnection) {
        let state = std::mem::replace(&mut conn.state, ConnectionState::Disconnected);
        let ConnectionState::Connected { client_id, session } = state else {
            return;
        };

        let will = {
            let mut s = session.write();
            if !s.is_bound_to(conn.id) {
                debug!(client_id = %client_id, connection_id = conn.id, "stale connection lost");
                return;
            }
            s.will.take()
        };

        if let Some(will) = will {
            debug!(client_id = %client_id, topic = %will.topic, "publishing will message");
            self.publish_will(will);
        }

        self.registry.disconnect(&client_id, conn.id);
        info!(client_id = %client_id, connection_id = conn.id, "connection lost");
    }
}
