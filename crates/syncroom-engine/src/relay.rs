//! Host fan-out and validation of follower-forwarded payloads.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use syncroom_protocol::{encode_message, PeerTransport, ProtocolError};
use syncroom_types::{PeerId, PeerMessage, RecordError, UpstreamRecord};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Why a forwarded payload was refused.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid record: {0}")]
    Record(#[from] RecordError),

    /// Control messages are never relayed upstream.
    #[error("payload is a peer control message")]
    ControlMessage,
}

/// Turn a follower's `forward` payload into an upstream record.
pub fn validate_forwarded(payload: Value) -> Result<UpstreamRecord, ForwardError> {
    if payload.get("__type").is_some() {
        return Err(ForwardError::ControlMessage);
    }
    Ok(UpstreamRecord::try_from(payload)?)
}

/// Send one message to each target concurrently, encoding it once.
///
/// Per-peer failures are logged and skipped. A peer whose send doesn't finish
/// within `send_timeout` is disconnected. Returns how many sends succeeded.
pub async fn fan_out(
    transport: &Arc<dyn PeerTransport>,
    targets: &[PeerId],
    message: &PeerMessage,
    send_timeout: Duration,
) -> Result<usize, ProtocolError> {
    if targets.is_empty() {
        return Ok(0);
    }
    let data = encode_message(message)?;
    let mut sends = JoinSet::new();
    for peer in targets {
        let transport = Arc::clone(transport);
        let peer = peer.clone();
        let data = data.clone();
        sends.spawn(async move {
            let result = tokio::time::timeout(send_timeout, transport.send(&peer, data)).await;
            (peer, result)
        });
    }

    let mut delivered = 0;
    while let Some(joined) = sends.join_next().await {
        match joined {
            Ok((_, Ok(Ok(())))) => delivered += 1,
            Ok((peer, Ok(Err(e)))) => {
                debug!(peer = %peer, kind = message.kind(), error = %e, "relay send failed");
            }
            Ok((peer, Err(_))) => {
                warn!(peer = %peer, kind = message.kind(), "relay send stalled, dropping link");
                transport.disconnect(&peer).await;
            }
            Err(e) => warn!(error = %e, "relay send task failed"),
        }
    }
    Ok(delivered)
}
