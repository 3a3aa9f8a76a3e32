//! Session registry
//!
//! Maps client ids to sessions and owns the session lifecycle: binding a new
//! connection (with takeover and clean-session cleanup), disconnect, removal
//! and startup restore.
//!
//! Lock order is registry entry -> session -> matcher/retained. Bind runs
//! entirely under the registry entry for the client id, so evicting the old
//! connection and installing the new one is a single step.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::{BoundConnection, Session, SessionLimits};
use crate::persistence::{PersistenceManager, StoredSession};
use crate::protocol::{ConnAck, ConnectReturnCode, Packet, Will};
use crate::topic::TopicMatcher;

/// Request to bind a connection to the session of `client_id`
pub struct BindRequest {
    pub client_id: Arc<str>,
    pub clean_session: bool,
    pub will: Option<Will>,
    pub connection: BoundConnection,
}

/// Bind failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    /// The stored session for this client id could not be decoded
    SessionCorrupted(String),
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionCorrupted(id) => write!(f, "stored session for {} is corrupted", id),
        }
    }
}

impl std::error::Error for BindError {}

/// Thread-safe session registry
pub struct SessionRegistry {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
    corrupted: DashSet<String>,
    matcher: Arc<TopicMatcher>,
    persistence: Option<Arc<PersistenceManager>>,
    limits: SessionLimits,
}

impl SessionRegistry {
    pub fn new(
        matcher: Arc<TopicMatcher>,
        persistence: Option<Arc<PersistenceManager>>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            corrupted: DashSet::new(),
            matcher,
            persistence,
            limits,
        }
    }

    /// Bind a connection to the session of `request.client_id`.
    ///
    /// Closes any connection already bound (takeover). A clean request, or an
    /// existing clean session, replaces the session with a fresh one;
    /// otherwise the existing session is resumed. While holding the session
    /// lock this sends CONNACK, resends in-flight messages in their original
    /// order and drains the offline queue, so no live delivery can overtake
    /// them.
    ///
    /// Returns the session and the session-present flag.
    pub fn bind(&self, request: BindRequest) -> Result<(Arc<RwLock<Session>>, bool), BindError> {
        let BindRequest {
            client_id,
            clean_session,
            will,
            connection,
        } = request;

        if self.is_corrupted(&client_id) {
            if !clean_session {
                return Err(BindError::SessionCorrupted(client_id.to_string()));
            }
            warn!(client_id = %client_id, "discarding corrupted stored session for clean connect");
            self.corrupted.remove(&*client_id);
            if let Some(persistence) = &self.persistence {
                persistence.delete_session(&client_id);
            }
        }

        match self.sessions.entry(client_id.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get().clone();
                let mut session = existing.write();

                if let Some(old) = session.connection.take() {
                    debug!(client_id = %client_id, old_connection = old.id, "session taken over");
                    old.writer.close();
                }

                if session.clean_session || clean_session {
                    let was_durable = !session.clean_session;
                    drop(session);
                    self.matcher.remove_all_for(&client_id);
                    if was_durable {
                        if let Some(persistence) = &self.persistence {
                            persistence.delete_session(&client_id);
                        }
                    }

                    let fresh = Arc::new(RwLock::new(Session::new(
                        client_id.clone(),
                        clean_session,
                        self.limits,
                    )));
                    entry.insert(fresh.clone());
                    self.activate(&fresh, connection, will, false);
                    Ok((fresh, false))
                } else {
                    drop(session);
                    self.activate(&existing, connection, will, true);
                    Ok((existing, true))
                }
            }
            Entry::Vacant(entry) => {
                let fresh = Arc::new(RwLock::new(Session::new(
                    client_id.clone(),
                    clean_session,
                    self.limits,
                )));
                entry.insert(fresh.clone());
                self.activate(&fresh, connection, will, false);
                Ok((fresh, false))
            }
        }
    }

    /// Bind the connection, acknowledge, then redeliver under one lock hold
    fn activate(
        &self,
        session: &Arc<RwLock<Session>>,
        connection: BoundConnection,
        will: Option<Will>,
        session_present: bool,
    ) {
        let mut session = session.write();
        session.bind(connection);
        session.will = will;
        session.send_packet(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Accepted,
            session_present,
        )));
        session.resume();
        // the drained queue is now in flight
        self.persist(&session);
    }

    /// Get a session by client ID
    pub fn retrieve(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    /// Unbind `connection_id` from the session of `client_id`.
    ///
    /// A no-op when another connection has taken the session over. A clean
    /// session is removed along with its subscriptions; a durable one is kept
    /// and persisted.
    pub fn disconnect(&self, client_id: &str, connection_id: u64) {
        let Entry::Occupied(entry) = self.sessions.entry(Arc::from(client_id)) else {
            return;
        };

        let session = entry.get().clone();
        let mut guard = session.write();
        if !guard.unbind(connection_id) {
            debug!(client_id = %client_id, connection_id, "stale disconnect ignored");
            return;
        }

        if guard.clean_session {
            drop(guard);
            // unindex while the entry is held so a rebind cannot interleave
            self.matcher.remove_all_for(client_id);
            entry.remove();
            debug!(client_id = %client_id, "clean session removed");
        } else {
            if let Some(persistence) = &self.persistence {
                persistence.save_session(&guard);
            }
            debug!(client_id = %client_id, "durable session kept");
        }
    }

    /// Drop a session, its subscriptions and its stored record unconditionally
    pub fn remove(&self, client_id: &str) {
        if let Entry::Occupied(entry) = self.sessions.entry(Arc::from(client_id)) {
            self.matcher.remove_all_for(client_id);
            entry.remove();
        }
        self.corrupted.remove(client_id);
        if let Some(persistence) = &self.persistence {
            persistence.delete_session(client_id);
        }
    }

    /// Persist a snapshot of a durable session
    pub fn persist(&self, session: &Session) {
        if session.clean_session {
            return;
        }
        if let Some(persistence) = &self.persistence {
            persistence.save_session(session);
        }
    }

    /// Snapshot every durable session, used at shutdown
    pub fn persist_all(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for session in sessions {
            let session = session.read();
            if !session.clean_session {
                persistence.save_session(&session);
            }
        }
    }

    /// Install sessions loaded from storage and index their subscriptions
    pub fn restore(&self, stored: impl IntoIterator<Item = StoredSession>) {
        let mut count = 0usize;
        for stored in stored {
            let client_id = stored.client_id.clone();
            let session = match stored.into_session(self.limits) {
                Ok(session) => session,
                Err(e) => {
                    error!(client_id = %client_id, "stored session is corrupted: {}", e);
                    self.mark_corrupted(&client_id);
                    continue;
                }
            };
            for (filter, qos) in &session.subscriptions {
                self.matcher.index(filter, &session.client_id, *qos);
            }
            self.sessions
                .insert(session.client_id.clone(), Arc::new(RwLock::new(session)));
            count += 1;
        }
        if count > 0 {
            info!("Restored {} sessions from storage", count);
        }
    }

    /// Refuse durable binds for a client id whose stored session is unreadable
    pub fn mark_corrupted(&self, client_id: &str) {
        self.corrupted.insert(client_id.to_string());
    }

    pub fn is_corrupted(&self, client_id: &str) -> bool {
        self.corrupted.contains(client_id)
    }

    /// Get session count
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
