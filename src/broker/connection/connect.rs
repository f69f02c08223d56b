//! CONNECT packet handling

use std::sync::Arc;

use tracing::{debug, warn};

use super::{violation, CloseReason, ConnectionError, Flow, Handler};
use crate::auth::AuthError;
use crate::broker::BrokerEvent;
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, Packet, ProtocolVersion};
use crate::session::{ClaimOrigin, Session, SessionState};
use crate::store::{StoreError, StoredSession};
use crate::topic::validate_topic_name_with_max_levels;

impl Handler {
    /// Handle CONNECT packet
    pub(crate) async fn handle_connect(
        &mut self,
        connect: Connect,
    ) -> Result<Flow, ConnectionError> {
        let config = self.broker.config().clone();
        self.protocol_version = connect.protocol_version;

        if let Some(will) = &connect.will {
            if let Err(e) = validate_topic_name_with_max_levels(&will.topic, config.max_topic_levels) {
                debug!("Invalid will topic from {}: {}", self.addr, e);
                return Err(violation("invalid will topic in CONNECT"));
            }
        }

        let mut client_id = connect.client_id;
        if config.username_as_client_id {
            if let Some(username) = &connect.username {
                client_id = username.clone();
            }
        }

        // An empty id is only acceptable for a clean session
        if client_id.is_empty() {
            if !connect.clean_session || !config.allow_empty_client_id {
                debug!("Rejecting empty client ID from {}", self.addr);
                return Ok(self.refuse(ConnectReturnCode::IdentifierRejected).await);
            }
            client_id = format!("hubmq-{:016x}", rand_id());
        }
        let client_id: Arc<str> = Arc::from(client_id);

        debug!(
            "CONNECT from {} (client_id: {}, clean_session: {}, keep_alive: {})",
            self.addr, client_id, connect.clean_session, connect.keep_alive
        );

        if connect.username.is_none() && !config.allow_anonymous {
            debug!("Anonymous connection from {} refused", self.addr);
            return Ok(self.refuse(ConnectReturnCode::NotAuthorized).await);
        }

        match self
            .broker
            .auth()
            .check_credentials(connect.username.as_deref(), connect.password.as_deref())
            .await
        {
            Ok(()) => {}
            Err(AuthError::Backend(e)) => {
                warn!("Auth backend failed for {}: {}", client_id, e);
                return Ok(self.refuse(ConnectReturnCode::ServerUnavailable).await);
            }
            Err(_) => {
                debug!("Authentication failed for {}", client_id);
                return Ok(self.refuse(ConnectReturnCode::NotAuthorized).await);
            }
        }

        // Consult the store before touching the registry so a storage
        // failure refuses the client without side effects
        let known = self.broker.registry().find(&client_id).is_some();
        let mut stored = None;
        let store_result = if connect.clean_session {
            self.broker.store().delete_session(&client_id).await
        } else if known {
            Ok(())
        } else {
            match self.broker.store().find_session(&client_id).await {
                Ok(Some(found)) => {
                    stored = Some(found);
                    Ok(())
                }
                Ok(None) => {
                    let empty = StoredSession::empty(connect.protocol_version);
                    match self.broker.store().register_session(&client_id, &empty).await {
                        Err(StoreError::AlreadyExists(_)) => Ok(()),
                        other => other,
                    }
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = store_result {
            warn!("Session store failed for {}: {}", client_id, e);
            return Ok(self.refuse(ConnectReturnCode::ServerUnavailable).await);
        }

        let restoring = stored.is_some();
        let max_pending = config.max_queued_messages;
        let claim = self.broker.registry().claim(
            &client_id,
            connect.clean_session,
            self.conn_id,
            || match stored {
                Some(stored) => Session::restore(client_id.clone(), stored, max_pending),
                None => Session::new(
                    client_id.clone(),
                    connect.protocol_version,
                    connect.clean_session,
                    max_pending,
                ),
            },
        );

        let resumed = claim.origin == ClaimOrigin::Resumed;
        let restored = restoring && !resumed;
        let session_present = resumed || restored;

        if claim.displaced.is_some() {
            debug!("Client {} taken over by {}", client_id, self.addr);
            self.broker.emit(BrokerEvent::SessionTakenOver {
                client_id: client_id.clone(),
            });
        }
        if claim.discarded.is_some() {
            // Subscriptions of the replaced record go with it
            self.broker.matcher().unsubscribe_all(&client_id);
        }

        let (replay, subscriptions) = {
            let mut s = claim.session.lock();
            s.protocol_version = connect.protocol_version;
            s.keep_alive = connect.keep_alive;
            s.username = connect.username.clone();
            s.will = connect.will;
            let subscriptions: Vec<_> = if restored {
                s.subscriptions
                    .iter()
                    .map(|(filter, qos)| (filter.clone(), *qos))
                    .collect()
            } else {
                Vec::new()
            };
            let mut replay = if session_present {
                s.redelivery()
            } else {
                Vec::new()
            };
            replay.extend(s.release_pending());
            (replay, subscriptions)
        };

        for (filter, qos) in subscriptions {
            if let Err(e) = self.broker.matcher().subscribe(&client_id, &filter, qos) {
                warn!("Dropping stored subscription {} for {}: {}", filter, client_id, e);
            }
        }

        self.client_id = client_id.clone();
        self.username = connect.username;
        self.keep_alive = connect.keep_alive;
        self.session = Some(claim.session.clone());
        self.state = SessionState::Connected;

        // 3.1 CONNACK has no session present flag
        let session_present_flag =
            session_present && self.protocol_version == ProtocolVersion::V311;
        self.send(Packet::ConnAck(ConnAck {
            session_present: session_present_flag,
            return_code: ConnectReturnCode::Accepted,
        }))
        .await;
        for packet in replay {
            self.send(packet).await;
        }

        // From here on routed messages go straight to our queue; anything
        // that arrived while we were replaying sits in pending
        let late = {
            let mut s = claim.session.lock();
            if s.attach(self.conn_id, self.queue.clone()) {
                Some(s.release_pending())
            } else {
                None
            }
        };
        let Some(late) = late else {
            debug!("Client {} was taken over during CONNECT", client_id);
            return Ok(Flow::Close(CloseReason::QueueClosed));
        };
        for packet in late {
            self.send(packet).await;
        }

        self.broker.emit(BrokerEvent::ClientConnected {
            client_id: client_id.clone(),
            protocol_version: self.protocol_version,
            session_present,
        });
        if session_present {
            self.broker.emit(BrokerEvent::SessionResumed { client_id });
        }

        Ok(Flow::Continue)
    }

    /// Send a refusing CONNACK and close
    async fn refuse(&mut self, code: ConnectReturnCode) -> Flow {
        self.send(Packet::ConnAck(ConnAck::refused(code))).await;
        self.state = SessionState::Disconnected;
        Flow::Close(CloseReason::Refused)
    }
}

/// Generate a random ID
fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish()
}
