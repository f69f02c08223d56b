//! Per-connection sender task.
//!
//! Drains the session's [`OutboundQueue`] onto the socket. Frames already
//! queued are coalesced into one write so fan-out bursts cost one syscall.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::codec::Encoder;
use crate::session::OutboundQueue;

/// Stop coalescing once a batch reaches this many bytes
const MAX_BATCH_BYTES: usize = 64 * 1024;

/// Write frames until the queue is closed and empty.
///
/// A failed write closes the queue, which ends the read loop too.
pub(crate) async fn run<W>(mut writer: W, queue: Arc<OutboundQueue>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoder = Encoder::default();
    let mut buf = BytesMut::with_capacity(4096);

    let result = loop {
        let Some(packet) = queue.pop().await else {
            break Ok(());
        };

        buf.clear();
        let mut next = Some(packet);
        while let Some(packet) = next.take() {
            if let Err(e) = encoder.encode(&packet, &mut buf) {
                debug!("Dropping unencodable {:?}: {}", packet.packet_type(), e);
            }
            if buf.len() < MAX_BATCH_BYTES {
                next = queue.try_pop();
            }
        }

        trace!("Writing {} bytes", buf.len());
        if let Err(e) = writer.write_all(&buf).await {
            break Err(e);
        }
    };

    if let Err(e) = &result {
        debug!("Write failed: {}", e);
        queue.close();
    }
    let _ = writer.shutdown().await;
    result
}
