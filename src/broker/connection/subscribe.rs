//! SUBSCRIBE and UNSUBSCRIBE packet handling

use tracing::{debug, trace, warn};

use super::{ConnectionError, Flow, Handler};
use crate::auth::Access;
use crate::protocol::{Packet, SubAck, SubAckReturnCode, Subscribe, UnsubAck, Unsubscribe};
use crate::topic::validate_topic_filter_with_max_levels;

impl Handler {
    /// Handle SUBSCRIBE packet
    pub(crate) async fn handle_subscribe(
        &mut self,
        subscribe: Subscribe,
    ) -> Result<Flow, ConnectionError> {
        let Some(session) = self.session.clone() else {
            return Ok(Flow::Continue);
        };
        let max_qos = self.broker.config().max_qos;
        let max_levels = self.broker.config().max_topic_levels;

        let mut return_codes = Vec::with_capacity(subscribe.topics.len());
        let mut retained = Vec::new();

        for topic in subscribe.topics {
            if let Err(e) = validate_topic_filter_with_max_levels(&topic.filter, max_levels) {
                debug!("Invalid filter {:?} from {}: {}", topic.filter, self.client_id, e);
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            if let Err(e) = self
                .broker
                .auth()
                .check_acl(
                    &self.client_id,
                    self.username.as_deref(),
                    &topic.filter,
                    Access::Read,
                )
                .await
            {
                warn!(
                    "Subscribe to {} denied for {}: {}",
                    topic.filter, self.client_id, e
                );
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            let granted = topic.qos.min(max_qos);
            // Ownership check and trie insert share one session lock
            // (lock order: registry, session, trie)
            let result = {
                let mut s = session.lock();
                if !s.is_owned_by(self.conn_id) {
                    // Taken over mid-packet; the read loop is about to stop
                    return Ok(Flow::Continue);
                }
                let result = self
                    .broker
                    .matcher()
                    .subscribe(&self.client_id, &topic.filter, granted);
                if result.is_ok() {
                    s.subscriptions.insert(topic.filter.clone(), granted);
                }
                result
            };
            match result {
                Ok(messages) => {
                    trace!("{} subscribed to {} at {:?}", self.client_id, topic.filter, granted);
                    retained.extend(messages.into_iter().map(|m| (m, granted)));
                    return_codes.push(SubAckReturnCode::Granted(granted));
                }
                Err(e) => {
                    debug!("Subscribe to {} failed for {}: {}", topic.filter, self.client_id, e);
                    return_codes.push(SubAckReturnCode::Failure);
                }
            }
        }

        self.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await;

        // Retained messages follow the SUBACK, each at min(granted, stored QoS)
        for (message, granted) in retained {
            let publish = message.to_publish(granted);
            let qos = publish.qos;
            self.broker.deliver(&session, &publish, qos).await;
        }

        Ok(Flow::Continue)
    }

    /// Handle UNSUBSCRIBE packet
    pub(crate) async fn handle_unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
    ) -> Result<Flow, ConnectionError> {
        if let Some(session) = &self.session {
            for filter in &unsubscribe.filters {
                self.broker.matcher().unsubscribe(&self.client_id, filter);
                session.lock().subscriptions.remove(filter);
            }
        }

        self.send(Packet::UnsubAck(UnsubAck::new(unsubscribe.packet_id)))
            .await;
        Ok(Flow::Continue)
    }
}
