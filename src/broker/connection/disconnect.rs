//! DISCONNECT handling and connection teardown

use tracing::{debug, info, warn};

use super::{CloseReason, Flow, Handler};
use crate::broker::BrokerEvent;
use crate::session::SessionState;
use crate::store::StoreError;

impl Handler {
    /// Handle DISCONNECT packet
    pub(crate) fn handle_disconnect(&mut self) -> Flow {
        debug!("DISCONNECT from {}", self.client_id);
        self.state = SessionState::Disconnecting;
        if let Some(session) = &self.session {
            let mut s = session.lock();
            if s.is_owned_by(self.conn_id) {
                s.will = None;
            }
        }
        Flow::Close(CloseReason::Graceful)
    }

    /// Release the session once the read loop has stopped.
    ///
    /// Publishes the will when `reason` calls for it, drops a clean session
    /// with its subscriptions, and writes a persistent one back to the
    /// store. A connection that lost its session to a takeover does none of
    /// this.
    pub(crate) async fn close(&mut self, reason: CloseReason) {
        self.state = SessionState::Disconnected;
        let Some(session) = self.session.take() else {
            return;
        };

        let (owned, will, clean, snapshot) = {
            let mut s = session.lock();
            let owned = s.is_owned_by(self.conn_id);
            let will = if owned { s.will.take() } else { None };
            s.detach(self.conn_id);
            let snapshot = (owned && !s.clean_session).then(|| s.snapshot());
            (owned, will, s.clean_session, snapshot)
        };

        let graceful = reason == CloseReason::Graceful;
        info!("Client {} disconnected ({:?})", self.client_id, reason);

        if !owned {
            debug!("{} no longer owns its session, skipping teardown", self.client_id);
            self.broker.emit(BrokerEvent::ClientDisconnected {
                client_id: self.client_id.clone(),
                graceful,
            });
            return;
        }

        if let Some(will) = will.filter(|_| reason.fires_will()) {
            debug!("Publishing will for {} on {}", self.client_id, will.topic);
            self.broker.route(&will.to_publish()).await;
        }

        if clean {
            if self
                .broker
                .registry()
                .remove_if_current(&self.client_id, &session)
            {
                self.broker.matcher().unsubscribe_all(&self.client_id);
            }
        } else if let Some(snapshot) = snapshot {
            let store = self.broker.store();
            let result = match store.update_session(&self.client_id, &snapshot).await {
                Err(StoreError::NotFound(_)) => {
                    store.register_session(&self.client_id, &snapshot).await
                }
                other => other,
            };
            if let Err(e) = result {
                warn!("Failed to store session for {}: {}", self.client_id, e);
            }
        }

        self.broker.emit(BrokerEvent::ClientDisconnected {
            client_id: self.client_id.clone(),
            graceful,
        });
    }
}
