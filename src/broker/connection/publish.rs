//! PUBLISH packet handling

use tracing::{debug, trace, warn};

use super::{violation, ConnectionError, Flow, Handler};
use crate::auth::Access;
use crate::protocol::{Packet, PubAck, PubRec, Publish, QoS};
use crate::topic::validate_topic_name_with_max_levels;

impl Handler {
    /// Handle PUBLISH packet
    pub(crate) async fn handle_publish(
        &mut self,
        publish: Publish,
    ) -> Result<Flow, ConnectionError> {
        let max_levels = self.broker.config().max_topic_levels;
        if let Err(e) = validate_topic_name_with_max_levels(&publish.topic, max_levels) {
            debug!("Invalid topic name from {}: {}", self.client_id, e);
            return Err(violation("invalid topic name in PUBLISH"));
        }
        let packet_id = match publish.qos {
            QoS::AtMostOnce => None,
            _ => Some(
                publish
                    .packet_id
                    .ok_or_else(|| violation("QoS > 0 PUBLISH without packet identifier"))?,
            ),
        };

        // A denied publish is still acknowledged so the client's flow completes
        let allowed = match self
            .broker
            .auth()
            .check_acl(
                &self.client_id,
                self.username.as_deref(),
                &publish.topic,
                Access::Write,
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Publish to {} denied for {}: {}",
                    publish.topic, self.client_id, e
                );
                false
            }
        };

        trace!(
            "PUBLISH from {} on {} (qos {:?}, retain {})",
            self.client_id,
            publish.topic,
            publish.qos,
            publish.retain
        );

        match (publish.qos, packet_id) {
            (QoS::AtLeastOnce, Some(id)) => {
                if allowed {
                    self.broker.route(&publish).await;
                }
                self.send(Packet::PubAck(PubAck::new(id))).await;
            }
            (QoS::ExactlyOnce, Some(id)) => {
                // Held until PUBREL; a resent PUBLISH with the same id is not routed twice
                if allowed {
                    if let Some(session) = &self.session {
                        if !session.lock().record_inbound(id, publish) {
                            trace!("Duplicate QoS 2 PUBLISH {} from {}", id, self.client_id);
                        }
                    }
                }
                self.send(Packet::PubRec(PubRec::new(id))).await;
            }
            _ => {
                if allowed {
                    self.broker.route(&publish).await;
                }
            }
        }

        Ok(Flow::Continue)
    }
}
