//! Channels between the engine and the upstream message source/sink.
//!
//! Records the local application observes go *in* through
//! [`UpstreamHandle::observe`]; records the engine wants applied locally come
//! *out* of [`UpstreamHandle::next_delivery`].

use syncroom_types::UpstreamRecord;
use tokio::sync::mpsc;

/// Default channel depth for [`channel`].
pub const UPSTREAM_CHANNEL_CAPACITY: usize = 256;

/// Engine side of the upstream link.
#[derive(Debug)]
pub struct UpstreamLink {
    pub(crate) observed: mpsc::Receiver<UpstreamRecord>,
    pub(crate) deliver: mpsc::Sender<UpstreamRecord>,
}

/// Application side of the upstream link.
#[derive(Debug)]
pub struct UpstreamHandle {
    observed: mpsc::Sender<UpstreamRecord>,
    delivered: mpsc::Receiver<UpstreamRecord>,
}

/// Create a connected pair.
pub fn channel(capacity: usize) -> (UpstreamHandle, UpstreamLink) {
    let (observed_tx, observed_rx) = mpsc::channel(capacity);
    let (deliver_tx, deliver_rx) = mpsc::channel(capacity);
    (
        UpstreamHandle {
            observed: observed_tx,
            delivered: deliver_rx,
        },
        UpstreamLink {
            observed: observed_rx,
            deliver: deliver_tx,
        },
    )
}

impl UpstreamHandle {
    /// Hand a locally observed record to the engine.
    ///
    /// Returns `false` once the engine has stopped.
    pub async fn observe(&self, record: UpstreamRecord) -> bool {
        self.observed.send(record).await.is_ok()
    }

    /// Next record the engine wants applied locally.
    pub async fn next_delivery(&mut self) -> Option<UpstreamRecord> {
        self.delivered.recv().await
    }

    /// Non-blocking variant of [`Self::next_delivery`].
    pub fn try_next_delivery(&mut self) -> Option<UpstreamRecord> {
        self.delivered.try_recv().ok()
    }

    /// Split into the raw sender and receiver.
    pub fn into_parts(self) -> (mpsc::Sender<UpstreamRecord>, mpsc::Receiver<UpstreamRecord>) {
        (self.observed, self.delivered)
    }
}
