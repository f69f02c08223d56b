//! QoS 1/2 acknowledgement handling

use tracing::trace;

use super::{ConnectionError, Flow, Handler};
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel};

impl Handler {
    /// Handle PUBACK packet
    pub(crate) fn handle_puback(&mut self, puback: PubAck) -> Result<Flow, ConnectionError> {
        if let Some(session) = &self.session {
            if !session.lock().acknowledge(puback.packet_id) {
                trace!(
                    "PUBACK for unknown packet {} from {}",
                    puback.packet_id,
                    self.client_id
                );
            }
        }
        Ok(Flow::Continue)
    }

    /// Handle PUBREC packet
    pub(crate) async fn handle_pubrec(&mut self, pubrec: PubRec) -> Result<Flow, ConnectionError> {
        let known = self
            .session
            .as_ref()
            .is_some_and(|s| s.lock().receive_pubrec(pubrec.packet_id));
        if !known {
            trace!(
                "PUBREC for unknown packet {} from {}",
                pubrec.packet_id,
                self.client_id
            );
        }
        // PUBREL is owed either way so the client can release its state
        self.send(Packet::PubRel(PubRel::new(pubrec.packet_id)))
            .await;
        Ok(Flow::Continue)
    }

    /// Handle PUBREL packet
    pub(crate) async fn handle_pubrel(&mut self, pubrel: PubRel) -> Result<Flow, ConnectionError> {
        let released = self
            .session
            .as_ref()
            .and_then(|s| s.lock().release_inbound(pubrel.packet_id));

        if let Some(publish) = released {
            self.broker.route(&publish).await;
        }
        self.send(Packet::PubComp(PubComp::new(pubrel.packet_id)))
            .await;
        Ok(Flow::Continue)
    }

    /// Handle PUBCOMP packet
    pub(crate) fn handle_pubcomp(&mut self, pubcomp: PubComp) -> Result<Flow, ConnectionError> {
        if let Some(session) = &self.session {
            if !session.lock().complete(pubcomp.packet_id) {
                trace!(
                    "PUBCOMP for unknown packet {} from {}",
                    pubcomp.packet_id,
                    self.client_id
                );
            }
        }
        Ok(Flow::Continue)
    }
}
